//! CLI argument parsing using clap v4
//!
//! Defines the command-line interface for the commit gatekeeper: `serve`
//! runs the coordinator, every other request command talks to a running
//! coordinator over its WebSocket API.

use clap::{Args, Parser, Subcommand};

use crate::types::{ApprovalId, RequestId, RequestKind};

/// Commit Gatekeeper - serialized, gated writes to a shared repository
///
/// Workers submit change requests; the coordinator validates ownership,
/// orders them by their dependencies, runs quality gates and commits one
/// request at a time.
#[derive(Parser, Debug)]
#[command(name = "gatekeeper")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Increase logging verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Path to configuration file
    #[arg(short, long, env = "GATEKEEPER_CONFIG", global = true)]
    pub config: Option<String>,

    /// Coordinator URL (overrides coordinator.url)
    #[arg(long, env = "GATEKEEPER_URL", global = true)]
    pub url: Option<String>,

    /// Worker id to act as (overrides coordinator.worker_id)
    #[arg(long = "as", value_name = "WORKER", env = "GATEKEEPER_WORKER_ID", global = true)]
    pub worker: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the coordinator and its API endpoint
    Serve {
        /// Listen address (overrides coordinator.listen_addr)
        #[arg(long)]
        listen: Option<String>,
    },

    #[command(flatten)]
    Client(ClientCommand),

    /// Protected-resource registry
    Registry {
        #[command(subcommand)]
        subcommand: RegistrySubcommand,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        subcommand: ConfigSubcommand,
    },

    /// Display version and build information
    Version,
}

/// Commands sent to a running coordinator
#[derive(Subcommand, Debug, Clone)]
pub enum ClientCommand {
    /// Submit a change request
    Submit(SubmitArgs),

    /// Show the current state of a request
    Status {
        request_id: RequestId,

        /// Print the raw JSON report
        #[arg(long)]
        json: bool,
    },

    /// Show the ledger history of one request, or of all requests
    Ledger {
        request_id: Option<RequestId>,

        /// Print entries as JSON lines
        #[arg(long)]
        json: bool,
    },

    /// Cancel a request
    Cancel { request_id: RequestId },

    /// Follow ledger entries as they are recorded
    Watch {
        /// Only entries of this request; exits once it reaches a terminal state
        request_id: Option<RequestId>,

        /// Replay recorded entries after this ledger sequence first
        #[arg(long)]
        after: Option<u64>,
    },

    /// Record an approval for a protected pattern
    Approve(ApproveArgs),

    /// Reload the protected-resource registry from its mapping file
    Reload,
}

/// Arguments of `submit`
#[derive(Args, Debug, Clone)]
pub struct SubmitArgs {
    /// commit, create_branch, merge, delete_branch or transfer_ownership
    pub kind: RequestKind,

    /// Target paths or patterns
    pub paths: Vec<String>,

    /// Request that must complete first (repeatable)
    #[arg(short = 'd', long = "depends-on", value_name = "ID")]
    pub depends_on: Vec<RequestId>,

    /// Approval presented for a protected path (repeatable)
    #[arg(short = 'a', long = "approval", value_name = "ID")]
    pub approvals: Vec<ApprovalId>,

    /// Description of the change
    #[arg(short = 'm', long, default_value = "")]
    pub description: String,

    /// Diff reference (a patch file for the git backend)
    #[arg(long)]
    pub diff: Option<String>,

    /// Branch for branch operations
    #[arg(long)]
    pub branch: Option<String>,

    /// New owner for transfer_ownership
    #[arg(long)]
    pub new_owner: Option<String>,

    /// Declared role (informational)
    #[arg(long)]
    pub role: Option<String>,

    /// Follow the request until it reaches a terminal state
    #[arg(short, long)]
    pub wait: bool,
}

/// Arguments of `approve`
#[derive(Args, Debug, Clone)]
pub struct ApproveArgs {
    /// Owner granting the approval
    #[arg(long)]
    pub owner: String,

    /// Worker allowed to write
    #[arg(long)]
    pub grantee: String,

    /// Protected pattern (or a path under it)
    #[arg(long)]
    pub pattern: String,

    /// Expire the approval after this many seconds
    #[arg(long)]
    pub ttl_secs: Option<u64>,

    #[arg(long)]
    pub note: Option<String>,
}

/// Registry subcommands
#[derive(Subcommand, Debug, Clone)]
pub enum RegistrySubcommand {
    /// List protected resources from the mapping file
    Show,
}

/// Configuration subcommands
#[derive(Subcommand, Debug, Clone)]
pub enum ConfigSubcommand {
    /// Display the current configuration
    Show,

    /// Initialize a new configuration file
    Init {
        /// Path where to create the config file
        #[arg(short, long)]
        path: Option<String>,

        /// Overwrite existing configuration
        #[arg(short, long)]
        force: bool,
    },

    /// Validate a configuration file
    Validate,
}
