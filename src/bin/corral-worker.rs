//! The stock corral worker executable.
//!
//! Serves the builtin commands (echo, pid, shutdown) plus a small set of
//! diagnostic commands (seq, sleep, exit) over the protocol channels wired
//! by the launcher. Logs go to stderr by default — the host forwards them
//! to its diagnostic log — or to a daily-rotating file when `--log-dir` is
//! given.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use clap::Parser;
use tracing_appender::non_blocking::WorkerGuard;

use corral::protocol::builtin;
use corral::protocol::command::FieldValues;
use corral::worker::{self, Registry};

#[derive(Parser)]
#[command(name = "corral-worker", version, about = "corral pool worker")]
struct Args {
    /// Write logs to daily-rotating files in this directory instead of
    /// stderr.
    #[arg(long, env = "CORRAL_LOG_DIR")]
    log_dir: Option<PathBuf>,

    /// Serve the protocol over stdin/stdout even if dedicated channel
    /// descriptors are wired.
    #[arg(long)]
    stdio: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let _guard = init_logging(args.log_dir.as_deref())?;

    tracing::info!(
        "corral-worker starting, version {}, pid {}",
        env!("CARGO_PKG_VERSION"),
        std::process::id()
    );

    let mut registry = Registry::with_builtins();
    register_diagnostics(&mut registry);

    let result = if args.stdio {
        worker::serve_stdio(registry).await
    } else {
        worker::serve(registry).await
    };

    match result {
        Ok(()) => {
            tracing::info!("corral-worker exiting");
            Ok(())
        }
        Err(e) => {
            tracing::error!("corral-worker failed: {e}");
            Err(e.into())
        }
    }
}

/// Diagnostic commands used for liveness probing and pool testing.
fn register_diagnostics(registry: &mut Registry) {
    static SEQ: AtomicI64 = AtomicI64::new(0);

    registry.register(builtin::SEQ, |_args| {
        let seq = SEQ.fetch_add(1, Ordering::Relaxed) + 1;
        Ok(FieldValues::new().with("seq", seq))
    });

    registry.register(builtin::SLEEP, |args| {
        let millis = args.get_int("millis").unwrap_or(0).max(0);
        // one job in flight per worker; blocking here is fine
        std::thread::sleep(Duration::from_millis(millis as u64));
        Ok(FieldValues::new().with("millis", millis))
    });

    registry.register(builtin::EXIT, |args| {
        let code = args.get_int("code").unwrap_or(1);
        tracing::warn!("exiting on request with code {code}");
        std::process::exit(code as i32);
    });
}

/// Set up tracing output: stderr, or a daily-rotating file under
/// `log_dir`. The returned guard must stay alive so buffered log lines
/// are flushed on exit.
fn init_logging(log_dir: Option<&Path>) -> anyhow::Result<Option<WorkerGuard>> {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let appender = tracing_appender::rolling::daily(dir, "worker.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(non_blocking)
                .with_ansi(false)
                .init();
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .with_ansi(false)
                .init();
            Ok(None)
        }
    }
}
