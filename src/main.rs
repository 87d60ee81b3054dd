use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use nodecrypt::{relay, RelayConfig, RelayContext};
use tracing::info;

#[derive(Parser)]
#[command(
    name = "nodecryptd",
    about = "NodeCrypt relay — zero-knowledge encrypted chat relay",
    version
)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// WebSocket listen port
    #[arg(long, env = "NODECRYPT_PORT")]
    port: Option<u16>,

    /// Data directory for the relay identity slot and config.toml
    #[arg(long, env = "NODECRYPT_DATA_DIR")]
    data_dir: Option<std::path::PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "NODECRYPT_LOG")]
    log: Option<String>,

    /// Write logs to this file path (rotated daily). Optional.
    #[arg(long, env = "NODECRYPT_LOG_FILE")]
    log_file: Option<std::path::PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    /// Start the relay server (default when no subcommand given).
    ///
    /// Runs nodecryptd in the foreground until SIGTERM or Ctrl-C.
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = RelayConfig::new(args.port, args.data_dir, args.log);
    let _guard = setup_logging(&config.log, args.log_file.as_deref());

    info!(version = env!("CARGO_PKG_VERSION"), "nodecryptd starting");

    match args.command.unwrap_or(Command::Serve) {
        Command::Serve => {
            let ctx = Arc::new(RelayContext::new(config)?);
            relay::run(ctx).await
        }
    }
}

/// Install the tracing subscriber. With a log file, logs go to stdout *and*
/// a daily-rolling file; the returned guard must be held for the process
/// lifetime so buffered lines flush on exit.
fn setup_logging(
    log_level: &str,
    log_file: Option<&std::path::Path>,
) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    if let Some(path) = log_file {
        let dir = path.parent().unwrap_or_else(|| std::path::Path::new("."));
        let filename = path
            .file_name()
            .unwrap_or_else(|| std::ffi::OsStr::new("nodecryptd.log"));

        // Ensure the directory exists before tracing-appender tries to open it.
        if let Err(e) = std::fs::create_dir_all(dir) {
            // Fall back to stdout-only — don't panic on a bad log path.
            eprintln!(
                "warn: could not create log directory '{}': {e} — falling back to stdout",
                dir.display()
            );
            tracing_subscriber::fmt()
                .with_env_filter(log_level)
                .compact()
                .init();
            return None;
        }

        let appender = tracing_appender::rolling::daily(dir, filename);
        let (non_blocking, guard) = tracing_appender::non_blocking(appender);

        tracing_subscriber::registry()
            .with(tracing_subscriber::EnvFilter::new(log_level))
            .with(tracing_subscriber::fmt::layer().compact())
            .with(tracing_subscriber::fmt::layer().with_writer(non_blocking))
            .init();

        Some(guard)
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(log_level)
            .compact()
            .init();
        None
    }
}
