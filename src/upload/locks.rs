//! Per-upload mutual exclusion
//!
//! Each upload with an operation in flight owns a slot holding its phase and
//! an async read/write gate. Chunk writes share the read side, a merge takes
//! the write side. A slot is dropped from the registry as soon as the last
//! operation holding it finishes, so the map only ever contains uploads that
//! are being touched right now.
//!
//! Distinct upload ids can name the same merged file (`rep` and `rep-chunk`
//! both produce `rep`), so a merge also claims its output name.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

use super::key::UploadId;
use super::types::UploadError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Accepting chunks
    Open,
    /// A merge has started; new chunks are rejected
    Merging,
    /// Merged successfully
    Closed,
}

struct UploadSlot {
    phase: Mutex<Phase>,
    gate: Arc<RwLock<()>>,
}

/// Registry of in-flight uploads
#[derive(Clone, Default)]
pub struct UploadLocks {
    slots: Arc<Mutex<HashMap<UploadId, Arc<UploadSlot>>>>,

    /// Output names of merges currently running
    outputs: Arc<Mutex<HashSet<String>>>,
}

impl UploadLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of uploads with an operation currently in flight
    pub fn active_count(&self) -> usize {
        self.slots.lock().len()
    }

    fn lease(&self, id: &UploadId) -> SlotLease {
        let slot = {
            let mut slots = self.slots.lock();
            slots
                .entry(id.clone())
                .or_insert_with(|| {
                    Arc::new(UploadSlot {
                        phase: Mutex::new(Phase::Open),
                        gate: Arc::new(RwLock::new(())),
                    })
                })
                .clone()
        };

        SlotLease {
            locks: self.clone(),
            id: id.clone(),
            slot,
        }
    }

    /// Admit a chunk write. Fails with `Conflict` once a merge has started.
    ///
    /// Waits only while a merge holds the gate, and then reports the
    /// merge's outcome: rejected if it closed the upload, admitted if it
    /// failed and reopened it.
    pub async fn begin_write(&self, id: &UploadId) -> Result<WriteGuard, UploadError> {
        let lease = self.lease(id);
        lease.check_writable()?;

        let guard = lease.slot.gate.clone().read_owned().await;
        lease.check_writable()?;

        Ok(WriteGuard {
            _guard: guard,
            _lease: lease,
        })
    }

    /// Take exclusive ownership of an upload for merging.
    ///
    /// A merge already running for the same upload, or for another upload
    /// with the same output name, yields `Conflict`; one that already closed
    /// the upload yields `NotFound`. Waits for in-flight chunk writes to
    /// finish.
    pub async fn begin_merge(&self, id: &UploadId) -> Result<MergeGuard, UploadError> {
        let lease = self.lease(id);
        {
            let mut phase = lease.slot.phase.lock();
            match *phase {
                Phase::Open => *phase = Phase::Merging,
                Phase::Merging => {
                    return Err(UploadError::Conflict(format!(
                        "merge already in progress for upload: {}",
                        id
                    )))
                }
                Phase::Closed => return Err(UploadError::NotFound(id.to_string())),
            }
        }

        // From here on dropping the guard reopens the upload, including when
        // this future is cancelled while waiting for the gate.
        let mut guard = MergeGuard {
            gate: None,
            lease,
            _output: None,
        };

        guard._output = Some(self.claim_output(id)?);
        guard.gate = Some(guard.lease.slot.gate.clone().write_owned().await);

        Ok(guard)
    }

    fn claim_output(&self, id: &UploadId) -> Result<OutputClaim, UploadError> {
        let name = id.artifact_name().to_string();
        if !self.outputs.lock().insert(name.clone()) {
            return Err(UploadError::Conflict(format!(
                "another merge is writing output file: {}",
                name
            )));
        }

        Ok(OutputClaim {
            outputs: self.outputs.clone(),
            name,
        })
    }
}

/// Reserves an output file name for one merge
struct OutputClaim {
    outputs: Arc<Mutex<HashSet<String>>>,
    name: String,
}

impl Drop for OutputClaim {
    fn drop(&mut self) {
        self.outputs.lock().remove(&self.name);
    }
}

/// Keeps a slot alive and releases it from the registry on drop
struct SlotLease {
    locks: UploadLocks,
    id: UploadId,
    slot: Arc<UploadSlot>,
}

impl SlotLease {
    fn check_writable(&self) -> Result<(), UploadError> {
        match *self.slot.phase.lock() {
            Phase::Open => Ok(()),
            Phase::Merging => Err(UploadError::Conflict(format!(
                "merge in progress for upload: {}",
                self.id
            ))),
            Phase::Closed => Err(UploadError::Conflict(format!(
                "upload already merged: {}",
                self.id
            ))),
        }
    }
}

impl Drop for SlotLease {
    fn drop(&mut self) {
        let mut slots = self.locks.slots.lock();
        // Leases are only handed out under the registry lock, so a count of
        // two (registry + this lease) cannot grow while we hold it.
        if Arc::strong_count(&self.slot) == 2 {
            if let Some(current) = slots.get(&self.id) {
                if Arc::ptr_eq(current, &self.slot) {
                    slots.remove(&self.id);
                }
            }
        }
    }
}

/// Held for the duration of one chunk write
pub struct WriteGuard {
    _guard: OwnedRwLockReadGuard<()>,
    _lease: SlotLease,
}

/// Held for the duration of one merge
///
/// Dropping it without calling [`MergeGuard::complete`] reopens the upload.
pub struct MergeGuard {
    gate: Option<OwnedRwLockWriteGuard<()>>,
    lease: SlotLease,
    _output: Option<OutputClaim>,
}

impl MergeGuard {
    /// Mark the upload closed; writers waiting on the gate are rejected
    pub fn complete(self) {
        *self.lease.slot.phase.lock() = Phase::Closed;
    }
}

impl Drop for MergeGuard {
    fn drop(&mut self) {
        {
            let mut phase = self.lease.slot.phase.lock();
            if *phase == Phase::Merging {
                *phase = Phase::Open;
            }
        }
        // release the gate before the lease so waiters see the final phase
        self.gate.take();
    }
}
