//! WebSocket API server
//!
//! One task per connection. Requests on a connection are handled
//! concurrently; every reply carries `in_reply_to` so clients can match
//! them. Subscriptions stream `LEDGER_EVENT` messages until the connection
//! closes.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::{
    handshake::server::{ErrorResponse, Request as HandshakeRequest, Response as HandshakeResponse},
    http::header::USER_AGENT,
    Message as WsMessage,
};
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::gatekeeper::Coordinator;
use crate::logging;
use crate::protocol::{
    ApproveAck, CancelAck, ErrorMessage, LedgerEvent, LedgerReply, Message, MessageEnvelope,
    ProtocolVersion, ReloadAck, SubmitAck, SubscribeMessage,
};

/// Outbound queue per connection
const OUTBOUND_QUEUE: usize = 256;

/// Serves the coordinator API
pub struct ApiServer {
    coordinator: Arc<Coordinator>,
    listener: TcpListener,
}

impl ApiServer {
    pub async fn bind(addr: &str, coordinator: Arc<Coordinator>) -> Result<Self> {
        let listener = TcpListener::bind(addr).await.map_err(|e| Error::ConnectionFailed {
            url: addr.to_string(),
            message: e.to_string(),
        })?;
        Ok(Self {
            coordinator,
            listener,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until `shutdown` flips to true
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        if let Ok(addr) = self.listener.local_addr() {
            info!(addr = %addr, "API listening");
        }

        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!(peer = %peer, "API connection");
                        let coordinator = Arc::clone(&self.coordinator);
                        tokio::spawn(
                            async move {
                                if let Err(e) = serve_connection(coordinator, stream).await {
                                    debug!(error = %e, "API connection ended with error");
                                }
                            }
                            .instrument(logging::connection_span(peer)),
                        );
                    }
                    Err(e) => {
                        error!(error = %e, "Accept failed");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("API server stopped");
    }
}

// ─────────────────────────────────────────────────────────────────
// Connection Handling
// ─────────────────────────────────────────────────────────────────

async fn serve_connection(coordinator: Arc<Coordinator>, stream: TcpStream) -> anyhow::Result<()> {
    let peer = stream.peer_addr()?;
    let log_agent = move |req: &HandshakeRequest,
                          resp: HandshakeResponse|
          -> std::result::Result<HandshakeResponse, ErrorResponse> {
        let agent = req
            .headers()
            .get(USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("unknown");
        debug!(%peer, agent, "Client connected");
        Ok(resp)
    };
    let ws = tokio_tungstenite::accept_hdr_async(stream, log_agent).await?;
    let (mut write, mut read) = ws.split();
    let (tx, mut rx) = mpsc::channel::<MessageEnvelope>(OUTBOUND_QUEUE);

    let writer = tokio::spawn(async move {
        while let Some(envelope) = rx.recv().await {
            let json = match envelope.to_json() {
                Ok(json) => json,
                Err(e) => {
                    warn!(error = %e, "Failed to encode reply");
                    continue;
                }
            };
            if write.send(WsMessage::Text(json)).await.is_err() {
                break;
            }
        }
        let _ = write.close().await;
    });

    while let Some(frame) = read.next().await {
        let envelope = match frame? {
            WsMessage::Text(text) => MessageEnvelope::from_json(&text),
            WsMessage::Binary(data) => MessageEnvelope::from_json_bytes(&data),
            WsMessage::Close(_) => break,
            _ => continue,
        };

        let envelope = match envelope {
            Ok(envelope) => envelope,
            Err(e) => {
                let err = Error::ProtocolMalformed {
                    message: e.to_string(),
                };
                let _ = tx.send(error_reply(Uuid::nil(), &err)).await;
                continue;
            }
        };

        if !ProtocolVersion::CURRENT.can_serve(&envelope.version) {
            let err = Error::ProtocolVersion {
                expected: ProtocolVersion::CURRENT.to_string(),
                actual: envelope.version.to_string(),
            };
            warn!(client = %envelope.version, "Client protocol version not supported");
            let _ = tx.send(error_reply(envelope.id, &err)).await;
            continue;
        }

        if !envelope.payload.is_request() {
            let err = Error::ProtocolMalformed {
                message: format!("{} is not a request", envelope.payload.type_name()),
            };
            let _ = tx.send(error_reply(envelope.id, &err)).await;
            continue;
        }

        debug!(msg_type = envelope.payload.type_name(), id = %envelope.id, "API request");

        let request_id = envelope.id;
        match envelope.payload {
            Message::Subscribe(sub) => {
                spawn_subscription(Arc::clone(&coordinator), request_id, sub, tx.clone());
            }
            payload => {
                let coordinator = Arc::clone(&coordinator);
                let tx = tx.clone();
                tokio::spawn(
                    async move {
                        let reply = match handle_request(&coordinator, payload).await {
                            Ok(message) => MessageEnvelope::reply(request_id, message),
                            Err(e) => error_reply(request_id, &e),
                        };
                        let _ = tx.send(reply).await;
                    }
                    .in_current_span(),
                );
            }
        }
    }

    drop(tx);
    let _ = writer.await;
    Ok(())
}

fn error_reply(request: Uuid, err: &Error) -> MessageEnvelope {
    MessageEnvelope::reply(request, Message::Error(ErrorMessage::from(err)))
}

/// Answer one request
pub(crate) async fn handle_request(coordinator: &Coordinator, payload: Message) -> Result<Message> {
    match payload {
        Message::Submit(draft) => Ok(Message::SubmitAck(SubmitAck {
            result: coordinator.submit(draft).await?,
        })),
        Message::Status(query) => Ok(Message::StatusReply(coordinator.status(query.request_id)?)),
        Message::Ledger(query) => Ok(Message::LedgerReply(LedgerReply {
            entries: coordinator.ledger_entries(query.request_id)?,
        })),
        Message::Cancel(cancel) => Ok(Message::CancelAck(CancelAck {
            request_id: cancel.request_id,
            outcome: coordinator.cancel(cancel.request_id, &cancel.by)?,
        })),
        Message::Approve(grant) => Ok(Message::ApproveAck(ApproveAck {
            approval: coordinator.approve(grant)?,
        })),
        Message::Reload(_) => Ok(Message::ReloadAck(ReloadAck {
            resources: coordinator.reload()?,
        })),
        other => Err(Error::ProtocolMalformed {
            message: format!("{} is not a request", other.type_name()),
        }),
    }
}

/// Stream matching ledger entries to the connection
fn spawn_subscription(
    coordinator: Arc<Coordinator>,
    request: Uuid,
    sub: SubscribeMessage,
    tx: mpsc::Sender<MessageEnvelope>,
) {
    let ledger = coordinator.ledger();
    let after = sub.after_seq.unwrap_or_else(|| ledger.last_seq());
    let mut events = match sub.request_id {
        Some(id) => ledger.subscribe_after(after, move |e| e.request_id == id),
        None => ledger.subscribe_after(after, |_| true),
    };
    debug!(request_id = ?sub.request_id, after, "Subscription opened");

    tokio::spawn(async move {
        loop {
            tokio::select! {
                entry = events.next() => {
                    let Some(entry) = entry else { break };
                    let event = MessageEnvelope::reply(request, Message::LedgerEvent(LedgerEvent { entry }));
                    if tx.send(event).await.is_err() {
                        break;
                    }
                }
                _ = tx.closed() => break,
            }
        }
        debug!("Subscription closed");
    });
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::config::{GatekeeperConfig, StaticOutcome};
    use crate::gatekeeper::Components;
    use crate::gates::{GateRunner, StaticCheck};
    use crate::protocol::{CancelMessage, StatusQuery, SubmitOutcome};
    use crate::registry::ResourceRegistry;
    use crate::repository::MemoryRepository;
    use crate::types::{RequestDraft, RequestKind};

    async fn coordinator() -> Arc<Coordinator> {
        let mut config = GatekeeperConfig::default();
        config.storage.persist = false;
        config.scheduler.tick_interval_ms = 20;
        let gates = GateRunner::new(2, true, PathBuf::from("."))
            .with_check(Arc::new(StaticCheck::new(
                "tests",
                StaticOutcome::Pass,
                Duration::ZERO,
                Duration::from_secs(5),
            )))
            .with_plan(RequestKind::Commit, &["tests"]);
        let components = Components::in_memory(
            ResourceRegistry::from_resources(vec![]).unwrap(),
            Box::new(MemoryRepository::new("main")),
        );
        let coordinator = Coordinator::new(config, components, gates).await.unwrap();
        coordinator.start().await.unwrap();
        coordinator
    }

    #[tokio::test]
    async fn test_submit_and_status() {
        let coordinator = coordinator().await;
        let draft = RequestDraft::new("bob", RequestKind::Commit).with_paths(["a.txt"]);

        match handle_request(&coordinator, Message::Submit(draft)).await.unwrap() {
            Message::SubmitAck(ack) => assert_eq!(ack.result, SubmitOutcome::Accepted { request_id: 1 }),
            other => panic!("unexpected reply {}", other.type_name()),
        }

        match handle_request(&coordinator, Message::Status(StatusQuery { request_id: 1 })).await.unwrap() {
            Message::StatusReply(report) => assert_eq!(report.request_id, 1),
            other => panic!("unexpected reply {}", other.type_name()),
        }
    }

    #[tokio::test]
    async fn test_errors_carry_codes() {
        let coordinator = coordinator().await;
        let err = handle_request(
            &coordinator,
            Message::Cancel(CancelMessage {
                request_id: 9,
                by: "bob".into(),
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(ErrorMessage::from(&err).code, "E406");
    }

    #[tokio::test]
    async fn test_reply_types_are_refused() {
        let coordinator = coordinator().await;
        let err = handle_request(&coordinator, Message::ReloadAck(ReloadAck { resources: 0 }))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ProtocolMalformed { .. }));
    }
}
