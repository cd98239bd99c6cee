//! Commit Gatekeeper - serialized, gated writes to a shared repository
//!
//! `gatekeeper serve` runs the coordinator: it admits change requests from
//! concurrent workers, orders them by their dependencies, runs quality gates
//! and commits one request at a time. The other commands are thin clients of
//! its WebSocket API.

mod api;
mod cli;
mod config;
mod error;
mod gatekeeper;
mod gates;
mod ledger;
mod logging;
mod mailbox;
mod protocol;
mod registry;
mod repository;
mod scheduler;
mod storage;
mod types;
mod validator;
mod version;

use std::sync::Arc;

use clap::Parser;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::api::{ApiClient, ApiServer, ClientConfig};
use crate::cli::{ApproveArgs, Cli, ClientCommand, Commands, ConfigSubcommand, RegistrySubcommand, SubmitArgs};
use crate::config::GatekeeperConfig;
use crate::error::{Error, Result, EXIT_OK};
use crate::gatekeeper::Coordinator;
use crate::ledger::LedgerEntry;
use crate::protocol::{CancelOutcome, StatusReport, SubmitOutcome, SubscribeMessage};
use crate::registry::{ApprovalGrant, ResourceRegistry};
use crate::types::{RequestDraft, RequestState};

fn main() {
    // Parse CLI arguments first (before logging, so we know verbosity)
    let cli = Cli::parse();

    let code = match run(cli) {
        Ok(code) => code,
        Err(e) => {
            eprint!("{}", e.format_for_terminal());
            e.exit_code()
        }
    };
    std::process::exit(code);
}

fn run(cli: Cli) -> Result<i32> {
    match &cli.command {
        Commands::Version => {
            version::print_version();
            Ok(EXIT_OK)
        }
        Commands::Config { subcommand } => {
            logging::init_client(cli.verbose, cli.quiet)?;
            handle_config_command(&cli, subcommand)
        }
        Commands::Serve { listen } => {
            let mut config = load_config(&cli)?;
            if let Some(addr) = listen {
                config.coordinator.listen_addr = addr.clone();
            }
            // Held until the coordinator exits so the log file is flushed
            let _log_guard = logging::init_serve(&config.logging, cli.verbose, cli.quiet)?;
            run_coordinator(config)?;
            Ok(EXIT_OK)
        }
        Commands::Registry {
            subcommand: RegistrySubcommand::Show,
        } => {
            let config = load_config(&cli)?;
            logging::init_client(cli.verbose, cli.quiet)?;
            show_registry(&config)?;
            Ok(EXIT_OK)
        }
        Commands::Client(command) => {
            let config = load_config(&cli)?;
            logging::init_client(cli.verbose, cli.quiet)?;
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .map_err(|e| Error::Internal(format!("Failed to create runtime: {}", e)))?;
            runtime.block_on(run_client(config, command.clone()))
        }
    }
}

/// Configuration file plus the `--url` and `--as` overrides
fn load_config(cli: &Cli) -> Result<GatekeeperConfig> {
    let mut config = GatekeeperConfig::load(cli.config.as_deref())?;
    if let Some(url) = &cli.url {
        config.coordinator.url = url.clone();
    }
    if let Some(worker) = &cli.worker {
        config.coordinator.worker_id = Some(worker.clone());
    }
    Ok(config)
}

// ─────────────────────────────────────────────────────────────────
// Coordinator
// ─────────────────────────────────────────────────────────────────

/// Run the coordinator until Ctrl+C
fn run_coordinator(config: GatekeeperConfig) -> Result<()> {
    let build = version::build_info();
    info!(
        version = %build.full_version(),
        target = %build.target,
        profile = %build.profile,
        "Starting commit gatekeeper"
    );
    info!(
        listen_addr = %config.coordinator.listen_addr,
        repository = ?config.repository.backend,
        registry = %config.registry.path,
        data_dir = %config.storage.data_dir,
        persist = config.storage.persist,
        "Configuration loaded"
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .worker_threads(num_cpus::get().clamp(2, 8))
        .thread_name("gatekeeper")
        .build()
        .map_err(|e| Error::Internal(format!("Failed to create async runtime: {}", e)))?;

    runtime.block_on(async_coordinator_main(config))
}

async fn async_coordinator_main(config: GatekeeperConfig) -> Result<()> {
    let listen_addr = config.coordinator.listen_addr.clone();

    let coordinator = Coordinator::open(config).await?;
    let tasks = coordinator.start().await?;

    let server = ApiServer::bind(&listen_addr, Arc::clone(&coordinator)).await?;
    info!(
        addr = %server.local_addr()?,
        resources = coordinator.registry().len(),
        "Coordinator ready"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let server_task = tokio::spawn(server.run(shutdown_rx));

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutdown signal received"),
        Err(e) => warn!(error = %e, "Failed to listen for the shutdown signal"),
    }

    shutdown_tx.send_replace(true);
    coordinator.stop();
    let _ = server_task.await;
    for task in tasks {
        let _ = task.await;
    }

    let latest = coordinator.ledger().latest_entries();
    info!(
        requests = latest.len(),
        completed = latest.iter().filter(|e| e.to == RequestState::Completed).count(),
        last_seq = coordinator.ledger().last_seq(),
        commit_seq = coordinator.snapshot().commit_seq,
        "Coordinator shut down"
    );
    Ok(())
}

// ─────────────────────────────────────────────────────────────────
// Client Commands
// ─────────────────────────────────────────────────────────────────

async fn run_client(config: GatekeeperConfig, command: ClientCommand) -> Result<i32> {
    let worker_id = config.worker_id();
    let mut client = ApiClient::connect(ClientConfig::from_settings(&config.coordinator)).await?;

    let code = match command {
        ClientCommand::Submit(args) => submit(&mut client, worker_id, args).await?,
        ClientCommand::Status { request_id, json } => {
            let report = client.status(request_id).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_status(&report);
            }
            report.state.exit_code()
        }
        ClientCommand::Ledger { request_id, json } => {
            for entry in client.ledger(request_id).await? {
                if json {
                    println!("{}", serde_json::to_string(&entry)?);
                } else {
                    print_entry(&entry);
                }
            }
            EXIT_OK
        }
        ClientCommand::Cancel { request_id } => {
            match client.cancel(request_id, &worker_id).await? {
                CancelOutcome::Cancelled => println!("Request {} cancelled.", request_id),
                CancelOutcome::Deferred => {
                    println!("Request {} will be cancelled when its gate run ends.", request_id)
                }
            }
            EXIT_OK
        }
        ClientCommand::Watch { request_id, after } => {
            // A watched request replays its whole trail and ends with its current attempt
            let until_attempt = match request_id {
                Some(id) => Some(client.status(id).await?.attempt),
                None => None,
            };
            client
                .subscribe(SubscribeMessage {
                    request_id,
                    after_seq: after.or(request_id.map(|_| 0)),
                })
                .await?;
            match follow(&mut client, until_attempt).await? {
                Some(state) => state.exit_code(),
                None => EXIT_OK,
            }
        }
        ClientCommand::Approve(args) => {
            let approval = client.approve(approval_grant(args)).await?;
            println!("{}", serde_json::to_string_pretty(&approval)?);
            EXIT_OK
        }
        ClientCommand::Reload => {
            let resources = client.reload().await?;
            println!("Registry reloaded: {} protected resource(s).", resources);
            EXIT_OK
        }
    };

    let _ = client.close().await;
    Ok(code)
}

async fn submit(client: &mut ApiClient, worker_id: String, args: SubmitArgs) -> Result<i32> {
    let wait = args.wait;
    let draft = request_draft(worker_id, args);
    let outcome = client.submit(draft).await?;

    let request_id = outcome.request_id();
    match &outcome {
        SubmitOutcome::Accepted { .. } => println!("Request {} ACCEPTED", request_id),
        SubmitOutcome::Retried { attempt, .. } => {
            println!("Request {} RETRIED (attempt {})", request_id, attempt)
        }
        SubmitOutcome::Duplicate { state, attempt, .. } => {
            println!("Request {} DUPLICATE ({}, attempt {})", request_id, state, attempt)
        }
        SubmitOutcome::Rejected { code, reason, .. } => {
            println!("Request {} REJECTED [{}] {}", request_id, code, reason)
        }
        SubmitOutcome::Cancelled { .. } => println!("Request {} CANCELLED", request_id),
    }

    let admitted = matches!(outcome, SubmitOutcome::Accepted { .. } | SubmitOutcome::Retried { .. });
    if !(wait && admitted) {
        return Ok(outcome.exit_code());
    }

    // Replay this request's trail from the start, then follow it live
    client
        .subscribe(SubscribeMessage {
            request_id: Some(request_id),
            after_seq: Some(0),
        })
        .await?;
    let attempt = match outcome {
        SubmitOutcome::Retried { attempt, .. } => attempt,
        _ => 1,
    };
    match follow(client, Some(attempt)).await? {
        Some(state) => Ok(state.exit_code()),
        None => Ok(outcome.exit_code()),
    }
}

/// Print streamed entries. With `until_attempt`, stop at the first terminal
/// state of that attempt (or a later one) and return it.
async fn follow(client: &mut ApiClient, until_attempt: Option<u32>) -> Result<Option<RequestState>> {
    while let Some(entry) = client.next_event().await? {
        print_entry(&entry);
        if let Some(attempt) = until_attempt {
            if entry.attempt >= attempt && entry.to.is_terminal() {
                return Ok(Some(entry.to));
            }
        }
    }
    Ok(None)
}

fn request_draft(worker_id: String, args: SubmitArgs) -> RequestDraft {
    let mut draft = RequestDraft::new(worker_id, args.kind)
        .with_paths(args.paths)
        .with_dependencies(args.depends_on)
        .with_approvals(args.approvals)
        .with_description(args.description);
    draft.role = args.role;
    draft.payload.diff_ref = args.diff;
    if let Some(branch) = args.branch {
        draft = draft.with_branch(branch);
    }
    if let Some(owner) = args.new_owner {
        draft = draft.with_new_owner(owner);
    }
    draft
}

fn approval_grant(args: ApproveArgs) -> ApprovalGrant {
    ApprovalGrant {
        owner: args.owner,
        grantee: args.grantee,
        pattern: args.pattern,
        ttl_secs: args.ttl_secs,
        note: args.note,
    }
}

// ─────────────────────────────────────────────────────────────────
// Output
// ─────────────────────────────────────────────────────────────────

fn print_status(report: &StatusReport) {
    println!("Request {} ({} by {})", report.request_id, report.kind, report.submitter);
    println!("  State:    {} (attempt {})", report.state, report.attempt);
    if !report.reason.is_empty() {
        println!("  Reason:   {}", report.reason);
    }
    if let Some(seq) = report.commit_seq {
        println!("  Commit:   #{}", seq);
    }
    if let Some(revision) = &report.revision {
        println!("  Revision: {}", revision);
    }
    println!("  Updated:  {}", report.updated_at.to_rfc3339());
    if !report.gate_results.is_empty() {
        println!("  Gates:");
        for result in &report.gate_results {
            println!("    {}", result.describe());
        }
    }
}

fn print_entry(entry: &LedgerEntry) {
    let from = entry.from.map(|s| s.as_str()).unwrap_or("-");
    let mut line = format!(
        "#{:<5} req {:<4} attempt {} {} -> {} [{}]",
        entry.seq, entry.request_id, entry.attempt, from, entry.to, entry.actor
    );
    if let Some(seq) = entry.commit_seq {
        line.push_str(&format!(" commit #{}", seq));
    }
    if !entry.reason.is_empty() {
        line.push_str(&format!(": {}", entry.reason));
    }
    println!("{}", line);
    for result in &entry.gate_results {
        println!("        {}", result.describe());
    }
}

fn show_registry(config: &GatekeeperConfig) -> Result<()> {
    let registry = ResourceRegistry::load(&config.registry_path())?;
    if registry.is_empty() {
        println!("No protected resources ({}).", config.registry.path);
        return Ok(());
    }
    println!("Protected resources ({}):", config.registry.path);
    for resource in registry.resources() {
        match &resource.description {
            Some(description) => println!("  {:<32} {:<16} {}", resource.pattern, resource.owner, description),
            None => println!("  {:<32} {}", resource.pattern, resource.owner),
        }
    }
    Ok(())
}

// ─────────────────────────────────────────────────────────────────
// Configuration Commands
// ─────────────────────────────────────────────────────────────────

fn handle_config_command(cli: &Cli, subcommand: &ConfigSubcommand) -> Result<i32> {
    match subcommand {
        ConfigSubcommand::Show => {
            let cfg = GatekeeperConfig::load(cli.config.as_deref())?;
            println!("{}", toml::to_string_pretty(&cfg)?);
        }
        ConfigSubcommand::Init { path, force } => {
            let path = config::init_config(path.as_deref(), *force)?;
            println!("Configuration written to {}", path.display());
        }
        ConfigSubcommand::Validate => {
            GatekeeperConfig::load(cli.config.as_deref())?;
            println!("Configuration is valid.");
        }
    }
    Ok(EXIT_OK)
}
