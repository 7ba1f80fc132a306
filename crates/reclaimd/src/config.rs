//! Daemon configuration derived from the command line.

use std::path::PathBuf;

use clap::ValueEnum;
use tracing_subscriber::EnvFilter;

/// Default directory holding the recovery database.
pub const DEFAULT_STORAGE_DIR: &str = "/var/lib/nfs/reclaimd";

/// Default path of the kernel upcall channel inside rpc_pipefs.
pub const DEFAULT_PIPE_PATH: &str = "/var/lib/nfs/rpc_pipefs/nfsd/cld";

/// Subsystem selected by `--debug`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum DebugKind {
    /// Debug logging everywhere.
    All,
    /// The persistent store and epoch state machine.
    Store,
    /// The upcall channel: framing, dispatch, replies.
    Upcall,
    /// Everything in this crate, at debug.
    General,
}

/// Resolved daemon configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory holding `main.sqlite`.
    pub storage_dir: PathBuf,
    /// Path of the kernel upcall channel.
    pub pipe_path: PathBuf,
    /// Keep human-readable logging on stderr.
    pub foreground: bool,
    /// Debug logging selection.
    pub debug: Option<DebugKind>,
}

impl Config {
    /// Builds the tracing filter for this configuration. An explicit
    /// `RUST_LOG` always wins over the `--debug` selection.
    #[must_use]
    pub fn env_filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(self.default_directives()))
    }

    fn default_directives(&self) -> &'static str {
        match self.debug {
            None => "info",
            Some(DebugKind::All) => "debug",
            Some(DebugKind::Store) => "info,reclaimd::store=debug,reclaimd::epoch=debug",
            Some(DebugKind::Upcall) => "info,reclaimd::protocol=debug,reclaimd::server=debug",
            Some(DebugKind::General) => "info,reclaimd=debug",
        }
    }
}
