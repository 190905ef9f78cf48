//! Per-conversation mutual exclusion.
//!
//! A keyed map from chat id to an owned semaphore, created on demand and
//! removed once the last holder or waiter is gone — no global lock across
//! conversations. Each gate admits one active delivery plus a bounded wait
//! queue; acquisitions beyond the queue depth are rejected immediately.

use crate::ChatId;
use crate::delivery::cancelled;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, watch};

/// Why an acquisition did not produce a permit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireRejected {
    /// The wait queue for this key is already at the configured depth.
    Busy,
    /// The caller's cancellation flag flipped while waiting.
    Cancelled,
}

struct Gate {
    semaphore: Arc<Semaphore>,
    /// Holder plus waiters. Maintained under the map mutex so that an
    /// entry is only removed when it is genuinely unreferenced.
    occupancy: usize,
}

pub struct KeyedLocks {
    max_queue_depth: usize,
    gates: Mutex<HashMap<ChatId, Gate>>,
}

impl KeyedLocks {
    pub fn new(max_queue_depth: usize) -> Self {
        Self {
            max_queue_depth,
            gates: Mutex::new(HashMap::new()),
        }
    }

    /// Wait for exclusive access to `key`, queuing behind an active holder
    /// up to the configured depth.
    pub async fn acquire(
        &self,
        key: ChatId,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<GatePermit<'_>, AcquireRejected> {
        let semaphore = {
            let mut gates = self.gates.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            let gate = gates.entry(key).or_insert_with(|| Gate {
                semaphore: Arc::new(Semaphore::new(1)),
                occupancy: 0,
            });
            if gate.occupancy > self.max_queue_depth {
                return Err(AcquireRejected::Busy);
            }
            gate.occupancy += 1;
            gate.semaphore.clone()
        };

        let permit = tokio::select! {
            biased;
            _ = cancelled(&mut cancel) => {
                self.release_slot(key);
                return Err(AcquireRejected::Cancelled);
            }
            acquired = semaphore.acquire_owned() => match acquired {
                Ok(permit) => permit,
                Err(_) => unreachable!("gate semaphore is never closed"),
            },
        };

        Ok(GatePermit {
            locks: self,
            key,
            _permit: permit,
        })
    }

    fn release_slot(&self, key: ChatId) {
        let mut gates = self.gates.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(gate) = gates.get_mut(&key) {
            gate.occupancy = gate.occupancy.saturating_sub(1);
            if gate.occupancy == 0 {
                gates.remove(&key);
            }
        }
    }

    #[cfg(test)]
    fn gate_count(&self) -> usize {
        self.gates.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).len()
    }
}

/// Exclusive access to one conversation key for the lifetime of a delivery
/// session. Dropping the permit releases the gate and prunes the map entry
/// once nothing references it.
pub struct GatePermit<'a> {
    locks: &'a KeyedLocks,
    key: ChatId,
    _permit: OwnedSemaphorePermit,
}

impl Drop for GatePermit<'_> {
    fn drop(&mut self) {
        self.locks.release_slot(self.key);
    }
}
