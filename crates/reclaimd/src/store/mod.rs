//! Crash-safe persistent store for client recovery records.
//!
//! The store owns all durable state of the daemon. On disk it is a single
//! SQLite database `main.sqlite` inside the top directory:
//!
//! - `parameters`: key/value pairs describing the database itself, at least
//!   `("version", "3")`.
//! - `grace`: exactly one row `(current INTEGER, recovery INTEGER)` holding
//!   the current and recovery epochs. A recovery epoch of `0` means normal
//!   operation (no grace period in force). SQLite stores integers signed, so
//!   epochs round-trip through `i64` with bit-preserving casts.
//! - `rec-CCCCCCCCCCCCCCCC` (C = lowercase hex of the epoch, zero-padded to
//!   16 digits): one bucket per live epoch with a single `id BLOB PRIMARY
//!   KEY` column holding the opaque client identity as sent by the client.
//!
//! The bucket name encoding is part of the on-disk format and must stay
//! bit-exact so existing databases remain readable.
//!
//! Every multi-step operation runs under an exclusive transaction; a failure
//! at any step rolls the whole operation back, leaving the database in its
//! pre-operation state. Contention with another process holding the database
//! (a test harness, a previous instance that has not finished exiting) is
//! absorbed by SQLite's busy handler with a bounded timeout.

mod sqlite;
#[cfg(test)]
mod tests;

pub use sqlite::{ClientStore, DB_FILENAME, LATEST_SCHEMA_VERSION};

/// Maximum length in bytes of an opaque client identity.
pub const OPAQUE_LIMIT: usize = 128;

/// The `(current_epoch, recovery_epoch)` pair stored in the `grace` table.
///
/// Invariants, enforced on load and preserved by every mutation:
///
/// - `current >= 1` after first initialization
/// - `recovery == 0` (not in grace) or `recovery < current`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EpochPair {
    /// Epoch into which new client identities are recorded.
    pub current: u64,
    /// Epoch from which clients may reclaim, `0` outside a grace period.
    pub recovery: u64,
}

impl EpochPair {
    /// Returns true while a grace period is in force.
    #[must_use]
    pub const fn in_grace(&self) -> bool {
        self.recovery != 0
    }
}

/// Result of a reclaim query against the recovery epoch bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckOutcome {
    /// The client held state before the reboot and may reclaim. Its identity
    /// has been re-recorded in the current epoch bucket.
    Allowed,
    /// The client is unknown to the recovery epoch, or no grace period is in
    /// force.
    Denied,
}

/// Errors from store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The database carries a schema version this daemon does not know.
    /// Downgrade is never attempted.
    #[error("unsupported database schema version {found} (latest is {LATEST_SCHEMA_VERSION})")]
    UnsupportedSchema {
        /// Version found in the `parameters` table.
        found: u32,
    },

    /// The database contents violate a structural invariant.
    #[error("database corrupt: {reason}")]
    Corrupt {
        /// Human-readable description of the violated invariant.
        reason: String,
    },

    /// A grace-scoped operation was requested outside a grace period.
    #[error("no grace period in force")]
    NotInGrace,

    /// A client identity exceeded [`OPAQUE_LIMIT`].
    #[error("client identity too long: {len} bytes exceeds limit of {OPAQUE_LIMIT}")]
    InvalidClient {
        /// Length of the rejected identity.
        len: usize,
    },

    /// The configured top directory exists but is not a directory.
    #[error("storage path is not a directory: {}", path.display())]
    NotADirectory {
        /// The offending path.
        path: std::path::PathBuf,
    },

    /// An underlying SQLite error. Busy/locked conditions are retried by the
    /// engine's busy handler before surfacing here.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Filesystem error while preparing the top directory.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
