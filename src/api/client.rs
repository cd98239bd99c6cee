//! WebSocket API client
//!
//! Used by the CLI. Connects with exponential backoff, sends one request at
//! a time and waits for the reply with the matching `in_reply_to`.

use std::time::Duration;

use backoff::{backoff::Backoff, ExponentialBackoff};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        client::IntoClientRequest,
        handshake::client::Request as HandshakeRequest,
        http::{header::USER_AGENT, HeaderValue},
        Message as WsMessage,
    },
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, warn};
use url::Url;
use uuid::Uuid;

use crate::config::CoordinatorSettings;
use crate::error::{Error, Result};
use crate::ledger::LedgerEntry;
use crate::protocol::{
    CancelMessage, CancelOutcome, LedgerQuery, Message, MessageEnvelope, ProtocolVersion,
    ReloadMessage, StatusQuery, StatusReport, SubmitOutcome, SubscribeMessage,
};
use crate::registry::{Approval, ApprovalGrant};
use crate::types::{RequestDraft, RequestId};
use crate::version::build_info;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

// ─────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────

/// Configuration for the API client
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// WebSocket URL of the coordinator
    pub url: String,

    /// Timeout of one connection attempt
    pub connect_timeout: Duration,

    /// Time to wait for a reply
    pub request_timeout: Duration,

    /// Maximum connection attempts (0 = until the backoff gives up)
    pub max_reconnect_attempts: u32,

    pub initial_reconnect_delay: Duration,

    pub max_reconnect_delay: Duration,
}

impl ClientConfig {
    pub fn from_settings(settings: &CoordinatorSettings) -> Self {
        Self {
            url: settings.url.clone(),
            connect_timeout: Duration::from_millis(settings.connect_timeout_ms),
            request_timeout: Duration::from_millis(settings.request_timeout_ms),
            max_reconnect_attempts: settings.max_reconnect_attempts,
            initial_reconnect_delay: Duration::from_millis(200),
            max_reconnect_delay: Duration::from_secs(5),
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Client
// ─────────────────────────────────────────────────────────────────

/// Connected API client
pub struct ApiClient {
    config: ClientConfig,
    socket: Socket,
}

/// Upgrade request carrying this build's agent string
fn handshake_request(url: &Url) -> Result<HandshakeRequest> {
    let connection_failed = |message: String| Error::ConnectionFailed {
        url: url.to_string(),
        message,
    };
    let mut request = url
        .as_str()
        .into_client_request()
        .map_err(|e| connection_failed(e.to_string()))?;
    let agent = HeaderValue::from_str(&build_info().agent_string())
        .map_err(|e| connection_failed(e.to_string()))?;
    request.headers_mut().insert(USER_AGENT, agent);
    Ok(request)
}

impl ApiClient {
    /// Connect, retrying with exponential backoff
    pub async fn connect(config: ClientConfig) -> Result<Self> {
        let url = Url::parse(&config.url).map_err(|e| Error::ConnectionFailed {
            url: config.url.clone(),
            message: format!("invalid URL: {}", e),
        })?;

        let mut backoff = ExponentialBackoff {
            initial_interval: config.initial_reconnect_delay,
            max_interval: config.max_reconnect_delay,
            max_elapsed_time: Some(config.connect_timeout * 3),
            ..Default::default()
        };

        let mut attempts = 0u32;
        loop {
            attempts += 1;
            let handshake = handshake_request(&url)?;
            let last_error = match tokio::time::timeout(config.connect_timeout, connect_async(handshake)).await {
                Ok(Ok((socket, _response))) => {
                    debug!(url = %url, attempts, "Connected to coordinator");
                    return Ok(Self { config, socket });
                }
                Ok(Err(e)) => Error::ConnectionFailed {
                    url: url.to_string(),
                    message: e.to_string(),
                },
                Err(_) => Error::ConnectionTimeout {
                    url: url.to_string(),
                    timeout_secs: config.connect_timeout.as_secs(),
                },
            };

            if config.max_reconnect_attempts > 0 && attempts >= config.max_reconnect_attempts {
                return Err(last_error);
            }
            match backoff.next_backoff() {
                Some(delay) => {
                    debug!(error = %last_error, delay_ms = delay.as_millis() as u64, "Retrying connection");
                    tokio::time::sleep(delay).await;
                }
                None => return Err(last_error),
            }
        }
    }

    /// Send a request and wait for its reply. `ERROR` replies become `Err`.
    pub async fn request(&mut self, payload: Message) -> Result<Message> {
        let envelope = MessageEnvelope::new(payload);
        let id = envelope.id;
        self.send(&envelope).await?;

        let timeout = self.config.request_timeout;
        let reply = tokio::time::timeout(timeout, self.reply_to(id))
            .await
            .map_err(|_| Error::ConnectionTimeout {
                url: self.config.url.clone(),
                timeout_secs: timeout.as_secs(),
            })??;

        match reply {
            Message::Error(err) => Err(err.into()),
            other => Ok(other),
        }
    }

    async fn send(&mut self, envelope: &MessageEnvelope) -> Result<()> {
        let json = envelope.to_json()?;
        self.socket.send(WsMessage::Text(json)).await?;
        Ok(())
    }

    /// Next envelope from the server; `None` when the connection closed
    async fn receive(&mut self) -> Result<Option<MessageEnvelope>> {
        while let Some(frame) = self.socket.next().await {
            let envelope = match frame? {
                WsMessage::Text(text) => MessageEnvelope::from_json(&text),
                WsMessage::Binary(data) => MessageEnvelope::from_json_bytes(&data),
                WsMessage::Ping(data) => {
                    self.socket.send(WsMessage::Pong(data)).await?;
                    continue;
                }
                WsMessage::Close(_) => return Ok(None),
                _ => continue,
            };
            let envelope = envelope.map_err(|e| Error::ProtocolMalformed {
                message: e.to_string(),
            })?;

            if envelope.version.major != ProtocolVersion::CURRENT.major {
                return Err(Error::ProtocolVersion {
                    expected: ProtocolVersion::CURRENT.to_string(),
                    actual: envelope.version.to_string(),
                });
            }
            return Ok(Some(envelope));
        }
        Ok(None)
    }

    async fn reply_to(&mut self, id: Uuid) -> Result<Message> {
        loop {
            match self.receive().await? {
                Some(envelope) if envelope.in_reply_to == Some(id) => return Ok(envelope.payload),
                Some(envelope) => {
                    debug!(msg_type = envelope.payload.type_name(), "Skipping unrelated message");
                }
                None => {
                    return Err(Error::ConnectionFailed {
                        url: self.config.url.clone(),
                        message: "connection closed before reply".to_string(),
                    })
                }
            }
        }
    }

    // ─────────────────────────────────────────────────────────────
    // Typed Requests
    // ─────────────────────────────────────────────────────────────

    pub async fn submit(&mut self, draft: RequestDraft) -> Result<SubmitOutcome> {
        match self.request(Message::Submit(draft)).await? {
            Message::SubmitAck(ack) => Ok(ack.result),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn status(&mut self, request_id: RequestId) -> Result<StatusReport> {
        match self.request(Message::Status(StatusQuery { request_id })).await? {
            Message::StatusReply(report) => Ok(report),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn ledger(&mut self, request_id: Option<RequestId>) -> Result<Vec<LedgerEntry>> {
        match self.request(Message::Ledger(LedgerQuery { request_id })).await? {
            Message::LedgerReply(reply) => Ok(reply.entries),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn cancel(&mut self, request_id: RequestId, by: &str) -> Result<CancelOutcome> {
        let message = Message::Cancel(CancelMessage {
            request_id,
            by: by.to_string(),
        });
        match self.request(message).await? {
            Message::CancelAck(ack) => Ok(ack.outcome),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn approve(&mut self, grant: ApprovalGrant) -> Result<Approval> {
        match self.request(Message::Approve(grant)).await? {
            Message::ApproveAck(ack) => Ok(ack.approval),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn reload(&mut self) -> Result<usize> {
        match self.request(Message::Reload(ReloadMessage {})).await? {
            Message::ReloadAck(ack) => Ok(ack.resources),
            other => Err(unexpected(&other)),
        }
    }

    // ─────────────────────────────────────────────────────────────
    // Subscriptions
    // ─────────────────────────────────────────────────────────────

    /// Start streaming ledger entries; read them with [`next_event`](Self::next_event)
    pub async fn subscribe(&mut self, sub: SubscribeMessage) -> Result<()> {
        self.send(&MessageEnvelope::new(Message::Subscribe(sub))).await
    }

    /// Next streamed ledger entry; `None` once the server closes
    pub async fn next_event(&mut self) -> Result<Option<LedgerEntry>> {
        loop {
            match self.receive().await? {
                Some(envelope) => match envelope.payload {
                    Message::LedgerEvent(event) => return Ok(Some(event.entry)),
                    Message::Error(err) => return Err(err.into()),
                    other => warn!(msg_type = other.type_name(), "Unexpected message on subscription"),
                },
                None => return Ok(None),
            }
        }
    }

    pub async fn close(mut self) -> Result<()> {
        self.socket.close(None).await?;
        Ok(())
    }
}

fn unexpected(message: &Message) -> Error {
    Error::ProtocolMalformed {
        message: format!("unexpected reply {}", message.type_name()),
    }
}
