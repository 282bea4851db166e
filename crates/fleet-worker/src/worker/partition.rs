//! Partition Table
//!
//! Exclusive ownership of accelerator partitions. Every acquisition carries
//! a lease token that is unique per worker instance; a release only succeeds
//! for the token that acquired the partition, so a late release from a dead
//! instance can never free a partition its replacement already holds.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use fleet_protocol::PartitionId;
use tracing::{debug, warn};

use crate::base::error::{Error, Result};

/// Current holder of a partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseHolder {
    pub worker: usize,
    pub token: u64,
}

/// Concurrent map of held partitions.
#[derive(Debug)]
pub struct PartitionTable {
    max_partitions: u32,
    held: DashMap<PartitionId, LeaseHolder>,
    next_token: AtomicU64,
}

impl PartitionTable {
    /// Table over partitions `1..=max_partitions`.
    pub fn new(max_partitions: u32) -> Self {
        Self {
            max_partitions,
            held: DashMap::new(),
            next_token: AtomicU64::new(1),
        }
    }

    pub fn max_partitions(&self) -> u32 {
        self.max_partitions
    }

    /// Fresh lease token for a new worker instance.
    pub fn next_token(&self) -> u64 {
        self.next_token.fetch_add(1, Ordering::Relaxed)
    }

    /// Take exclusive ownership of `id` for `worker`.
    ///
    /// The returned lease releases the partition when dropped.
    pub fn acquire(self: &Arc<Self>, id: PartitionId, worker: usize) -> Result<PartitionLease> {
        if id.get() == 0 || id.get() > self.max_partitions {
            return Err(Error::InvalidArgument(format!(
                "partition {} is outside 1..={}",
                id, self.max_partitions
            )));
        }

        let token = self.next_token();
        match self.held.entry(id) {
            Entry::Occupied(existing) => Err(Error::ResourceUnavailable {
                partition: id,
                holder: existing.get().worker,
            }),
            Entry::Vacant(slot) => {
                slot.insert(LeaseHolder { worker, token });
                debug!("Partition {} acquired by worker {} (token {})", id, worker, token);
                Ok(PartitionLease {
                    table: Arc::clone(self),
                    partition: id,
                    token,
                    released: false,
                })
            }
        }
    }

    /// Release `id` only if it is still held under `token`.
    pub fn release_if(&self, id: PartitionId, token: u64) -> bool {
        let released = self.held.remove_if(&id, |_, holder| holder.token == token).is_some();
        if released {
            debug!("Partition {} released (token {})", id, token);
        }
        released
    }

    /// Release `id` whoever holds it. Used only by the supervisor's final
    /// cleanup.
    pub fn force_release(&self, id: PartitionId) -> Option<LeaseHolder> {
        let removed = self.held.remove(&id).map(|(_, holder)| holder);
        if let Some(holder) = removed {
            warn!(
                "Partition {} force-released from worker {}",
                id, holder.worker
            );
        }
        removed
    }

    pub fn holder(&self, id: PartitionId) -> Option<LeaseHolder> {
        self.held.get(&id).map(|h| *h.value())
    }

    pub fn is_held(&self, id: PartitionId) -> bool {
        self.held.contains_key(&id)
    }

    /// Held partitions, sorted.
    pub fn held(&self) -> Vec<PartitionId> {
        let mut ids: Vec<PartitionId> = self.held.iter().map(|e| *e.key()).collect();
        ids.sort();
        ids
    }
}

/// Ownership of one partition by one worker instance.
#[derive(Debug)]
pub struct PartitionLease {
    table: Arc<PartitionTable>,
    partition: PartitionId,
    token: u64,
    released: bool,
}

impl PartitionLease {
    pub fn partition(&self) -> PartitionId {
        self.partition
    }

    pub fn token(&self) -> u64 {
        self.token
    }

    /// Release now instead of at drop time.
    pub fn release(mut self) -> bool {
        self.released = true;
        self.table.release_if(self.partition, self.token)
    }
}

impl Drop for PartitionLease {
    fn drop(&mut self) {
        if !self.released {
            self.table.release_if(self.partition, self.token);
        }
    }
}
