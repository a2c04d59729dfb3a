//! Unlink-generation bookkeeping for record reclamation.
//!
//! A shared region's record must not be freed until every thread that could have
//! referenced it has passed a checkpoint taken *after* the region was unlinked.
//! The bookkeeping is a monotone unlink generation: every unlink advances it and
//! stamps the pending record; every thread checkpoint publishes the generation the
//! thread has observed. A pending record is reclaimable once the minimum observed
//! generation across live threads has reached its stamp.
//!
//! This is ordering bookkeeping, not blocking: no thread ever waits here. Threads
//! pass their checkpoints opportunistically at points they reach naturally, and
//! reclamation happens inside whichever call moves the minimum forward.

use std::{collections::HashMap, sync::Arc};

use tracing::debug;

use super::{CriticalSectionRecord, RegionId};
use crate::thread::ThreadId;

/// A record removed from the live table, awaiting its reclamation epoch.
#[derive(Debug)]
pub(super) struct PendingFree {
    pub(super) region: RegionId,
    pub(super) record: Arc<CriticalSectionRecord>,
    pub(super) unlinked_at: u64,
}

/// Epoch state shared by all threads, guarded by the manager's lock.
#[derive(Debug, Default)]
pub(super) struct EpochState {
    unlink_generation: u64,
    threads: HashMap<ThreadId, u64>,
    pending: Vec<PendingFree>,
}

impl EpochState {
    /// Register a thread as a participant in the reclamation protocol.
    ///
    /// The thread starts at the current generation: it cannot have observed any
    /// region unlinked before it existed.
    pub(super) fn register_thread(&mut self, thread: ThreadId) {
        self.threads.entry(thread).or_insert(self.unlink_generation);
    }

    /// Remove a thread from the protocol and reclaim whatever its departure allows.
    ///
    /// A departed thread can no longer observe anything.
    pub(super) fn retire_thread(&mut self, thread: ThreadId) -> usize {
        self.threads.remove(&thread);
        self.reclaim()
    }

    /// Stamp a record with the next unlink generation and queue it for reclamation.
    pub(super) fn unlink(&mut self, region: RegionId, record: Arc<CriticalSectionRecord>) {
        self.unlink_generation += 1;
        debug!(
            region = %region,
            generation = self.unlink_generation,
            "region unlinked, record pending reclamation"
        );
        self.pending.push(PendingFree {
            region,
            record,
            unlinked_at: self.unlink_generation,
        });
    }

    /// Record that a thread has passed a checkpoint, then reclaim.
    ///
    /// Returns the number of records freed by this checkpoint.
    pub(super) fn checkpoint(&mut self, thread: ThreadId) -> usize {
        self.threads.insert(thread, self.unlink_generation);
        self.reclaim()
    }

    /// Number of records still awaiting reclamation.
    pub(super) fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Free every pending record whose unlink generation all live threads have
    /// observed.
    fn reclaim(&mut self) -> usize {
        let observed = self
            .threads
            .values()
            .copied()
            .min()
            .unwrap_or(self.unlink_generation);

        let before = self.pending.len();
        self.pending.retain(|pending| {
            let keep = pending.unlinked_at > observed;
            if !keep {
                debug!(region = %pending.region, "record reclaimed");
            }
            keep
        });

        before - self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::DescriptorFlags;

    fn record(address: u64) -> Arc<CriticalSectionRecord> {
        let mut record = CriticalSectionRecord::new(0, DescriptorFlags::empty(), address);
        record.resolve_addresses(0x10, 0x8, 0x20);
        Arc::new(record)
    }

    #[test]
    fn reclaim_waits_for_all_threads() {
        let mut epoch = EpochState::default();
        let (t1, t2) = (ThreadId(1), ThreadId(2));
        epoch.register_thread(t1);
        epoch.register_thread(t2);

        epoch.unlink(RegionId(9), record(0x100));
        assert_eq!(epoch.pending_len(), 1);

        assert_eq!(epoch.checkpoint(t1), 0);
        assert_eq!(epoch.pending_len(), 1);

        assert_eq!(epoch.checkpoint(t2), 1);
        assert_eq!(epoch.pending_len(), 0);
    }

    #[test]
    fn late_thread_does_not_block_older_unlinks() {
        let mut epoch = EpochState::default();
        let t1 = ThreadId(1);
        epoch.register_thread(t1);

        epoch.unlink(RegionId(1), record(0x100));

        // A thread registered after the unlink starts at the current generation
        // and cannot hold the old record hostage.
        let t2 = ThreadId(2);
        epoch.register_thread(t2);

        assert_eq!(epoch.checkpoint(t1), 1);
    }

    #[test]
    fn retirement_releases_observers() {
        let mut epoch = EpochState::default();
        let (t1, t2) = (ThreadId(1), ThreadId(2));
        epoch.register_thread(t1);
        epoch.register_thread(t2);

        epoch.unlink(RegionId(1), record(0x100));
        epoch.checkpoint(t1);
        assert_eq!(epoch.pending_len(), 1);

        assert_eq!(epoch.retire_thread(t2), 1);
        assert_eq!(epoch.pending_len(), 0);
    }

    #[test]
    fn no_threads_reclaims_immediately() {
        let mut epoch = EpochState::default();
        epoch.unlink(RegionId(1), record(0x100));

        // With no live threads nothing can observe the record.
        assert_eq!(epoch.checkpoint(ThreadId(1)), 1);
    }
}
