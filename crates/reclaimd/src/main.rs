//! reclaimd - NFSv4 client recovery tracking daemon.
//!
//! The daemon opens the recovery store, connects to the kernel upcall
//! channel, and serves reclaim-gating queries until the kernel closes the
//! channel or a shutdown signal arrives.
//!
//! The runtime is built by hand in a synchronous `main()` on a
//! current-thread scheduler: reply ordering on the upcall channel depends
//! on the event loop being single-threaded, and constructing the runtime
//! explicitly keeps it that way by construction rather than by convention.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use reclaimd::config::{Config, DebugKind, DEFAULT_PIPE_PATH, DEFAULT_STORAGE_DIR};
use reclaimd::epoch::EpochManager;
use reclaimd::server::{open_upcall_pipe, Signals, UpcallServer};
use tracing::{error, info};

/// NFSv4 client recovery tracking daemon.
#[derive(Parser, Debug)]
#[command(name = "reclaimd", version, about)]
struct Args {
    /// Run in the foreground with human-readable logging.
    #[arg(short = 'f', long)]
    foreground: bool,

    /// Enable debug logging for a subsystem.
    #[arg(short = 'd', long, value_name = "KIND", value_enum)]
    debug: Option<DebugKind>,

    /// Directory holding the recovery database.
    #[arg(long, value_name = "DIR", default_value = DEFAULT_STORAGE_DIR)]
    storage_dir: PathBuf,

    /// Path of the kernel upcall channel.
    #[arg(long, value_name = "PATH", default_value = DEFAULT_PIPE_PATH)]
    pipe: PathBuf,
}

impl Args {
    fn into_config(self) -> Config {
        Config {
            storage_dir: self.storage_dir,
            pipe_path: self.pipe,
            foreground: self.foreground,
            debug: self.debug,
        }
    }
}

fn init_tracing(config: &Config) {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(config.env_filter())
        .with_target(true);
    if config.foreground {
        builder.init();
    } else {
        // Under a service manager stderr lands in the journal; drop the
        // colour codes.
        builder.with_ansi(false).init();
    }
}

async fn serve(config: Config) -> Result<()> {
    let clients = EpochManager::open(&config.storage_dir)
        .context("failed to open client recovery store")?;

    let pipe = open_upcall_pipe(&config.pipe_path).with_context(|| {
        format!(
            "failed to open upcall channel at {}",
            config.pipe_path.display()
        )
    })?;
    info!(pipe = %config.pipe_path.display(), "connected to kernel upcall channel");

    let mut signals = Signals::install().context("failed to install signal handlers")?;
    let server = UpcallServer::new(pipe, clients);
    server.run(signals.shutdown()).await
}

fn main() -> ExitCode {
    let config = Args::parse().into_config();
    init_tracing(&config);

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            error!(%err, "failed to build runtime");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(serve(config)) {
        Ok(()) => {
            info!("clean shutdown");
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!("{err:#}");
            ExitCode::FAILURE
        }
    }
}
