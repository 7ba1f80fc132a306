//! SQLite backend for the client recovery store.

use std::fs;
use std::io;
use std::os::unix::fs::DirBuilderExt;
use std::path::Path;
use std::time::Duration;

use rusqlite::{params, Connection, TransactionBehavior};
use tracing::{debug, info, warn};

use super::{CheckOutcome, EpochPair, StoreError, OPAQUE_LIMIT};

/// Name of the database file inside the top directory. Preserved for format
/// compatibility with existing deployments.
pub const DB_FILENAME: &str = "main.sqlite";

/// Latest on-disk schema version. `open` migrates forward to this version
/// and refuses anything newer.
pub const LATEST_SCHEMA_VERSION: u32 = 3;

/// How long a statement waits on a database held by another process before
/// giving up.
const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

/// Handle to the recovery database.
///
/// All mutations happen through this handle under exclusive transactions, so
/// a crash at any point leaves either the pre-operation or the
/// post-operation state on disk, never a mix.
#[derive(Debug)]
pub struct ClientStore {
    conn: Connection,
}

/// Builds the bucket name for an epoch. The encoding (lowercase hex,
/// zero-padded to 16 digits) is part of the on-disk format.
fn bucket_name(epoch: u64) -> String {
    format!("rec-{epoch:016x}")
}

/// Creates the top directory with mode 0700 if it does not exist yet.
/// Refuses a path that exists but is not a directory.
fn ensure_topdir(topdir: &Path) -> Result<(), StoreError> {
    match fs::DirBuilder::new().mode(0o700).create(topdir) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {}
        Err(err) => return Err(err.into()),
    }
    if !fs::metadata(topdir)?.is_dir() {
        return Err(StoreError::NotADirectory {
            path: topdir.to_path_buf(),
        });
    }
    Ok(())
}

/// Reads the schema version from the `parameters` table.
///
/// Any failure (missing table, missing row, unparseable value) reads as `0`,
/// which routes `open` into the create-from-scratch path; that path runs
/// under an exclusive transaction and re-checks, so a racing initializer or
/// a genuinely broken database is caught there.
fn query_schema_version(conn: &Connection) -> u32 {
    conn.query_row(
        "SELECT value FROM parameters WHERE key = 'version'",
        [],
        |row| row.get::<_, String>(0),
    )
    .ok()
    .and_then(|value| value.parse().ok())
    .unwrap_or(0)
}

#[allow(clippy::cast_sign_loss)]
fn epoch_from_db(value: i64) -> u64 {
    value as u64
}

#[allow(clippy::cast_possible_wrap)]
fn epoch_to_db(epoch: u64) -> i64 {
    epoch as i64
}

impl ClientStore {
    /// Opens (creating or migrating as needed) the recovery database under
    /// `topdir` and returns the handle together with the durable epoch pair.
    ///
    /// # Errors
    ///
    /// Fails if the directory cannot be created, the database cannot be
    /// opened or migrated, or the stored epoch row violates an invariant.
    pub fn open(topdir: &Path) -> Result<(Self, EpochPair), StoreError> {
        ensure_topdir(topdir)?;
        let db_path = topdir.join(DB_FILENAME);
        let conn = Connection::open(&db_path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;

        let mut store = Self { conn };
        store.update_schema()?;
        let epochs = store.query_grace()?;
        debug!(
            path = %db_path.display(),
            current = epochs.current,
            recovery = epochs.recovery,
            "recovery database open"
        );
        Ok((store, epochs))
    }

    /// Drives the schema state machine to [`LATEST_SCHEMA_VERSION`].
    fn update_schema(&mut self) -> Result<(), StoreError> {
        match query_schema_version(&self.conn) {
            LATEST_SCHEMA_VERSION => Ok(()),
            old @ (1 | 2) => {
                info!(from = old, to = LATEST_SCHEMA_VERSION, "updating database schema");
                self.upgrade_schema(old)
            }
            0 => self.init_schema(),
            found => Err(StoreError::UnsupportedSchema { found }),
        }
    }

    /// Creates a fresh database: `parameters` with the version row, `grace`
    /// at `(1, 0)`, and an empty bucket for epoch 1, all in one exclusive
    /// transaction.
    fn init_schema(&mut self) -> Result<(), StoreError> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Exclusive)?;

        // Re-check the version now that we hold the database exclusively;
        // another process may have set it up between our first read and the
        // transaction start.
        match query_schema_version(&tx) {
            0 => {}
            LATEST_SCHEMA_VERSION => return Ok(()),
            found => {
                return Err(StoreError::Corrupt {
                    reason: format!("schema version changed to {found} during setup"),
                })
            }
        }

        tx.execute_batch(
            "CREATE TABLE parameters (key TEXT PRIMARY KEY, value TEXT);
             CREATE TABLE grace (current INTEGER, recovery INTEGER);
             INSERT OR FAIL INTO grace VALUES (1, 0);
             CREATE TABLE \"rec-0000000000000001\" (id BLOB PRIMARY KEY);",
        )?;
        tx.execute(
            "INSERT OR FAIL INTO parameters (key, value) VALUES ('version', ?1)",
            params![LATEST_SCHEMA_VERSION.to_string()],
        )?;
        tx.commit()?;
        info!("created recovery database at schema version {LATEST_SCHEMA_VERSION}");
        Ok(())
    }

    /// Upgrades a v1 or v2 database in place: create the `grace` row and the
    /// epoch-1 bucket, move the legacy `clients` rows over, drop `clients`,
    /// and stamp the new version. One exclusive transaction covers the whole
    /// conversion.
    fn upgrade_schema(&mut self, old: u32) -> Result<(), StoreError> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Exclusive)?;

        match query_schema_version(&tx) {
            found if found == old => {}
            LATEST_SCHEMA_VERSION => return Ok(()),
            found => {
                return Err(StoreError::Corrupt {
                    reason: format!("schema version changed to {found} during upgrade from {old}"),
                })
            }
        }

        tx.execute_batch(
            "CREATE TABLE grace (current INTEGER, recovery INTEGER);
             INSERT OR FAIL INTO grace VALUES (1, 0);
             CREATE TABLE \"rec-0000000000000001\" (id BLOB PRIMARY KEY);
             INSERT INTO \"rec-0000000000000001\" SELECT id FROM clients;
             DROP TABLE clients;",
        )?;
        tx.execute(
            "UPDATE parameters SET value = ?1 WHERE key = 'version'",
            params![LATEST_SCHEMA_VERSION.to_string()],
        )?;
        tx.commit()?;
        info!(from = old, "database schema updated to version {LATEST_SCHEMA_VERSION}");
        Ok(())
    }

    /// Reads the single `grace` row and validates its invariants.
    fn query_grace(&self) -> Result<EpochPair, StoreError> {
        let (current, recovery) =
            self.conn
                .query_row("SELECT current, recovery FROM grace", [], |row| {
                    Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?))
                })?;
        let epochs = EpochPair {
            current: epoch_from_db(current),
            recovery: epoch_from_db(recovery),
        };
        if epochs.current == 0 {
            return Err(StoreError::Corrupt {
                reason: "current epoch is 0".into(),
            });
        }
        if epochs.recovery != 0 && epochs.recovery >= epochs.current {
            return Err(StoreError::Corrupt {
                reason: format!(
                    "recovery epoch {} not below current epoch {}",
                    epochs.recovery, epochs.current
                ),
            });
        }
        Ok(epochs)
    }

    fn validate_client(id: &[u8]) -> Result<(), StoreError> {
        if id.len() > OPAQUE_LIMIT {
            return Err(StoreError::InvalidClient { len: id.len() });
        }
        Ok(())
    }

    /// Records a client identity in the bucket for `epoch`. Re-recording the
    /// same identity is a no-op (upsert semantics).
    ///
    /// # Errors
    ///
    /// Rejects identities longer than [`OPAQUE_LIMIT`]; otherwise only I/O
    /// and engine errors.
    pub fn insert_client(&self, epoch: u64, id: &[u8]) -> Result<(), StoreError> {
        Self::validate_client(id)?;
        let sql = format!(
            "INSERT OR REPLACE INTO \"{}\" (id) VALUES (?1)",
            bucket_name(epoch)
        );
        self.conn.execute(&sql, params![id])?;
        debug!(epoch, len = id.len(), "client record inserted");
        Ok(())
    }

    /// Deletes a client identity from the bucket for `epoch`. Succeeds even
    /// when the identity is absent.
    ///
    /// # Errors
    ///
    /// Rejects identities longer than [`OPAQUE_LIMIT`]; otherwise only I/O
    /// and engine errors.
    pub fn remove_client(&self, epoch: u64, id: &[u8]) -> Result<(), StoreError> {
        Self::validate_client(id)?;
        let sql = format!("DELETE FROM \"{}\" WHERE id == ?1", bucket_name(epoch));
        let removed = self.conn.execute(&sql, params![id])?;
        debug!(epoch, removed, "client record delete");
        Ok(())
    }

    /// Asks whether `id` may reclaim: it must be present in the recovery
    /// epoch bucket. On a hit the identity is also re-recorded in the
    /// current epoch bucket, so the client survives the next reboot too.
    ///
    /// Outside a grace period the answer is always [`CheckOutcome::Denied`].
    ///
    /// # Errors
    ///
    /// Rejects identities longer than [`OPAQUE_LIMIT`]; otherwise only I/O
    /// and engine errors.
    pub fn check_client(&self, epochs: EpochPair, id: &[u8]) -> Result<CheckOutcome, StoreError> {
        Self::validate_client(id)?;
        if !epochs.in_grace() {
            debug!("reclaim check outside grace period");
            return Ok(CheckOutcome::Denied);
        }
        let sql = format!(
            "SELECT count(*) FROM \"{}\" WHERE id == ?1",
            bucket_name(epochs.recovery)
        );
        let hits: i64 = self.conn.query_row(&sql, params![id], |row| row.get(0))?;
        if hits != 1 {
            debug!(recovery = epochs.recovery, "client unknown to recovery epoch");
            return Ok(CheckOutcome::Denied);
        }
        self.insert_client(epochs.current, id)?;
        Ok(CheckOutcome::Allowed)
    }

    /// Starts a grace period.
    ///
    /// With no grace in force, the recovery epoch becomes the old current
    /// epoch, the current epoch advances by one, and an empty bucket is
    /// created for it. If a grace period was already in force (the server
    /// restarted mid-grace), the epochs stay as they are and the current
    /// epoch bucket is emptied instead: the restart has invalidated any
    /// partial reclaims recorded there.
    ///
    /// Returns the pair that is now durable. On error the database is left
    /// at the pre-call state and the caller must keep its old pair.
    ///
    /// # Errors
    ///
    /// I/O and engine errors only; both cases of the state machine are
    /// valid inputs.
    pub fn grace_start(&mut self, epochs: EpochPair) -> Result<EpochPair, StoreError> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Exclusive)?;

        let next = if epochs.in_grace() {
            tx.execute_batch(&format!(
                "DELETE FROM \"{}\";",
                bucket_name(epochs.current)
            ))?;
            epochs
        } else {
            let next = EpochPair {
                current: epochs.current + 1,
                recovery: epochs.current,
            };
            tx.execute(
                "UPDATE grace SET current = ?1, recovery = ?2",
                params![epoch_to_db(next.current), epoch_to_db(next.recovery)],
            )?;
            tx.execute_batch(&format!(
                "CREATE TABLE \"{}\" (id BLOB PRIMARY KEY);",
                bucket_name(next.current)
            ))?;
            next
        };

        tx.commit()?;
        info!(current = next.current, recovery = next.recovery, "grace period started");
        Ok(next)
    }

    /// Ends the grace period: clears the recovery epoch and drops the
    /// recovery bucket, in one transaction.
    ///
    /// # Errors
    ///
    /// [`StoreError::NotInGrace`] when no grace period is in force.
    pub fn grace_done(&mut self, epochs: EpochPair) -> Result<EpochPair, StoreError> {
        if !epochs.in_grace() {
            return Err(StoreError::NotInGrace);
        }
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Exclusive)?;
        tx.execute("UPDATE grace SET recovery = 0", [])?;
        tx.execute_batch(&format!("DROP TABLE \"{}\";", bucket_name(epochs.recovery)))?;
        tx.commit()?;

        let next = EpochPair {
            current: epochs.current,
            recovery: 0,
        };
        info!(current = next.current, "grace period done");
        Ok(next)
    }

    /// Streams every client identity in the bucket for `epoch` through the
    /// callback and returns how many there were. The caller is responsible
    /// for only asking about epochs whose bucket exists.
    ///
    /// # Errors
    ///
    /// I/O and engine errors, including a missing bucket.
    pub fn iterate_clients<F>(&self, epoch: u64, mut cb: F) -> Result<usize, StoreError>
    where
        F: FnMut(&[u8]),
    {
        let sql = format!("SELECT id FROM \"{}\"", bucket_name(epoch));
        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt.query([])?;
        let mut count = 0usize;
        while let Some(row) = rows.next()? {
            let id: Vec<u8> = row.get(0)?;
            if id.len() > OPAQUE_LIMIT {
                // A foreign writer could have stored an oversize blob; skip
                // it rather than hand the kernel an identity it cannot hold.
                warn!(epoch, len = id.len(), "skipping oversize client record");
                continue;
            }
            cb(&id);
            count += 1;
        }
        debug!(epoch, count, "iterated client records");
        Ok(count)
    }
}
