//! Log output for the coordinator and the client commands
//!
//! `gatekeeper serve` logs to stderr and, with `logging.file`, to a
//! daily-rotated file, as compact text or JSON lines. Events emitted inside
//! a request pipeline carry the `request` span's `request_id` and `attempt`;
//! API events carry the `connection` span's peer address.
//!
//! Client commands log warnings and errors to stderr only, so `--json`
//! output on stdout stays machine-readable. `RUST_LOG` overrides both.

use std::fs;
use std::net::SocketAddr;
use std::path::Path;

use tracing::{info_span, Level, Span};
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

use crate::config::LoggingSettings;
use crate::error::{Error, Result};
use crate::types::RequestId;

/// Dependencies that are noisy below `warn`
const QUIET_TARGETS: &[&str] = &["tokio_tungstenite=warn", "tungstenite=warn"];

/// Flushes the log file when dropped; hold it until the coordinator exits
pub struct LogGuard {
    _file: Option<WorkerGuard>,
}

/// Span for one attempt of a request: gate run, commit and rollback
pub fn request_span(request_id: RequestId, attempt: u32) -> Span {
    info_span!("request", request_id, attempt)
}

/// Span for one API connection
pub fn connection_span(peer: SocketAddr) -> Span {
    info_span!("connection", %peer)
}

/// Logging for `gatekeeper serve`
pub fn init_serve(settings: &LoggingSettings, verbose: u8, quiet: bool) -> Result<LogGuard> {
    let level = serve_level(settings, verbose, quiet);

    let (file_layer, guard) = match settings.file.as_deref() {
        Some(path) => {
            let (writer, guard) = rolling_writer(Path::new(path), settings.max_files)?;
            (Some(layer(settings.json_format, writer, false)), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(env_filter(level)?)
        .with(layer(settings.json_format, std::io::stderr, !settings.json_format))
        .with(file_layer)
        .try_init()
        .map_err(|e| Error::Config(format!("Failed to initialize logging: {}", e)))?;

    tracing::info!(
        %level,
        file = ?settings.file,
        json = settings.json_format,
        "Logging initialized"
    );
    Ok(LogGuard { _file: guard })
}

/// Logging for client and offline commands
pub fn init_client(verbose: u8, quiet: bool) -> Result<()> {
    tracing_subscriber::registry()
        .with(env_filter(client_level(verbose, quiet))?)
        .with(layer(false, std::io::stderr, true))
        .try_init()
        .map_err(|e| Error::Config(format!("Failed to initialize logging: {}", e)))
}

fn serve_level(settings: &LoggingSettings, verbose: u8, quiet: bool) -> Level {
    match (quiet, verbose) {
        (true, _) => Level::ERROR,
        (false, 0) => settings.level.parse().unwrap_or(Level::INFO),
        (false, 1) => Level::DEBUG,
        (false, _) => Level::TRACE,
    }
}

fn client_level(verbose: u8, quiet: bool) -> Level {
    match (quiet, verbose) {
        (true, _) => Level::ERROR,
        (false, 0) => Level::WARN,
        (false, 1) => Level::DEBUG,
        (false, _) => Level::TRACE,
    }
}

fn env_filter(level: Level) -> Result<EnvFilter> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    let mut filter = EnvFilter::new(level.as_str().to_lowercase());
    for target in QUIET_TARGETS {
        let directive = target
            .parse()
            .map_err(|e| Error::Config(format!("Invalid log directive '{}': {}", target, e)))?;
        filter = filter.add_directive(directive);
    }
    Ok(filter)
}

fn layer<S, W>(json: bool, writer: W, ansi: bool) -> Box<dyn Layer<S> + Send + Sync>
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    if json {
        Box::new(
            fmt::layer()
                .json()
                .with_writer(writer)
                .with_current_span(true)
                .with_span_list(false)
                .with_target(true)
                .with_ansi(false),
        )
    } else {
        Box::new(fmt::layer().compact().with_writer(writer).with_target(false).with_ansi(ansi))
    }
}

/// Non-blocking writer over `<dir>/<stem>.<date>.log`, keeping `max_files`
fn rolling_writer(path: &Path, max_files: u32) -> Result<(NonBlocking, WorkerGuard)> {
    let directory = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    fs::create_dir_all(directory).map_err(|e| Error::IoWrite {
        path: directory.to_path_buf(),
        source: e,
    })?;

    let stem = path
        .file_stem()
        .and_then(|n| n.to_str())
        .unwrap_or("gatekeeper");

    let appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(stem)
        .filename_suffix("log")
        .max_log_files(max_files.max(1) as usize)
        .build(directory)
        .map_err(|e| Error::Config(format!("Failed to open log file in {}: {}", directory.display(), e)))?;

    Ok(tracing_appender::non_blocking(appender))
}
