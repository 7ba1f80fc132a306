//! Epoch manager: the in-memory view of the grace-period state machine.
//!
//! The manager owns the store handle and a cached copy of the
//! `(current_epoch, recovery_epoch)` pair. Mutators delegate to the store
//! and overwrite the cache only with the pair the store actually committed,
//! so at every quiescent point the cached pair equals the on-disk row.

use std::path::Path;

use tracing::{debug, info};

use crate::store::{CheckOutcome, ClientStore, EpochPair, StoreError};

/// Long-lived owner of the recovery store and the epoch pair. Threaded
/// through the upcall handlers; no global state.
#[derive(Debug)]
pub struct EpochManager {
    store: ClientStore,
    epochs: EpochPair,
}

impl EpochManager {
    /// Opens the recovery store under `topdir` and loads the epoch pair.
    ///
    /// # Errors
    ///
    /// Propagates any [`StoreError`] from opening or migrating the database.
    pub fn open(topdir: &Path) -> Result<Self, StoreError> {
        let (store, epochs) = ClientStore::open(topdir)?;
        info!(
            current = epochs.current,
            recovery = epochs.recovery,
            "client recovery tracking ready"
        );
        Ok(Self { store, epochs })
    }

    /// Epoch into which new client identities are recorded.
    #[must_use]
    pub const fn current_epoch(&self) -> u64 {
        self.epochs.current
    }

    /// Epoch from which clients may reclaim, `0` outside a grace period.
    #[must_use]
    pub const fn recovery_epoch(&self) -> u64 {
        self.epochs.recovery
    }

    /// Returns true while a grace period is in force.
    #[must_use]
    pub const fn in_grace(&self) -> bool {
        self.epochs.in_grace()
    }

    /// Whether the daemon holds any usable tracking state. The store is open
    /// by construction, so this is a constant affirmative; it exists because
    /// the kernel probes for it before trusting reclaim answers.
    #[must_use]
    pub const fn has_state(&self) -> bool {
        true
    }

    /// Records `id` in the current epoch bucket. Idempotent.
    ///
    /// # Errors
    ///
    /// Propagates [`StoreError`] from the underlying insert.
    pub fn insert_client(&mut self, id: &[u8]) -> Result<(), StoreError> {
        self.store.insert_client(self.epochs.current, id)
    }

    /// Removes `id` from the current epoch bucket. Succeeds when absent.
    ///
    /// # Errors
    ///
    /// Propagates [`StoreError`] from the underlying delete.
    pub fn remove_client(&mut self, id: &[u8]) -> Result<(), StoreError> {
        self.store.remove_client(self.epochs.current, id)
    }

    /// Reclaim query: allowed only for clients recorded in the recovery
    /// epoch; an allowed client is re-recorded in the current epoch.
    ///
    /// # Errors
    ///
    /// Propagates [`StoreError`] from the underlying lookup or re-record.
    pub fn check_client(&mut self, id: &[u8]) -> Result<CheckOutcome, StoreError> {
        self.store.check_client(self.epochs, id)
    }

    /// Starts (or, after a restart mid-grace, re-arms) the grace period.
    /// The cached pair is updated only after the store commit succeeds.
    ///
    /// # Errors
    ///
    /// Propagates [`StoreError`]; the cached pair is untouched on failure.
    pub fn grace_start(&mut self) -> Result<(), StoreError> {
        self.epochs = self.store.grace_start(self.epochs)?;
        Ok(())
    }

    /// Ends the grace period and drops the recovery bucket.
    ///
    /// # Errors
    ///
    /// [`StoreError::NotInGrace`] outside a grace period, otherwise store
    /// errors; the cached pair is untouched on failure.
    pub fn grace_done(&mut self) -> Result<(), StoreError> {
        self.epochs = self.store.grace_done(self.epochs)?;
        Ok(())
    }

    /// Streams the recovery epoch's client identities through `cb` and
    /// returns the count.
    ///
    /// # Errors
    ///
    /// [`StoreError::NotInGrace`] when no grace period is in force.
    pub fn iterate_recovery<F>(&mut self, cb: F) -> Result<usize, StoreError>
    where
        F: FnMut(&[u8]),
    {
        if !self.epochs.in_grace() {
            debug!("recovery iteration requested outside grace period");
            return Err(StoreError::NotInGrace);
        }
        self.store.iterate_clients(self.epochs.recovery, cb)
    }
}
