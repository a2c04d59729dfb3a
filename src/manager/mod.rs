//! Descriptor-record ownership, the lifetime table, and the phase boundary.
//!
//! The [`RegistrationManager`] owns every [`CriticalSectionRecord`] the process has
//! allocated, in a lifetime table keyed by generated-region identity. Regions that
//! never end a critical section have no entry; the table is an external side-table
//! precisely so ordinary regions carry no per-instance overhead.
//!
//! Two concerns meet here:
//!
//! - **The phase boundary.** [`RegistrationManager::enter_second_phase`] is the
//!   application state barrier: it publishes the record through the thread's
//!   descriptor-pointer slot and restores the entry register checkpoint as the last
//!   thing before the native copy runs. [`RegistrationManager::clear`] is its
//!   counterpart on every way out: natural completion, abort-trampoline entry,
//!   region deletion, and the post-unlink checkpoint.
//!
//! - **The deletion protocol.** A shared region's record may be referenced
//!   transiently by any thread executing the region, so freeing it is a two-step
//!   epoch: [`RegistrationManager::unlink`] removes the live-table entry and stamps
//!   the record, and the record is freed only once every live thread has passed a
//!   checkpoint taken after the unlink ([`RegistrationManager::thread_checkpoint`]).
//!   Skipping the second step risks a thread dereferencing a freed record; the
//!   protocol prevents that structurally rather than detecting it reactively.

mod epoch;

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Mutex,
};

use dashmap::{mapref::entry::Entry, DashMap};
use tracing::debug;

use crate::{
    config::RseqConfig,
    engine::MachineContext,
    registry::DescriptorFlags,
    thread::{RegisterCheckpointSlots, ThreadId, ThreadRuntimeState},
    Error, Result,
};

use epoch::EpochState;

/// Identity of a generated code region, assigned by the host engine's code cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegionId(pub u64);

impl std::fmt::Display for RegionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "region-{}", self.0)
    }
}

/// The kernel-visible descriptor for one section-ending region.
///
/// Heap-owned by the manager's lifetime table and referenced by exactly one
/// generated region; threads executing a shared region reference it transiently
/// through their descriptor-pointer slot. Cache addresses are zero placeholders
/// until the patch step resolves them, before the region can retire to the cache.
#[derive(Debug)]
pub struct CriticalSectionRecord {
    /// Descriptor version, copied from the section's static descriptor.
    pub version: u32,
    /// Trigger-selection flags, copied from the static descriptor (not honored).
    pub flags: DescriptorFlags,
    address: u64,
    start_cache: u64,
    post_commit_offset: u64,
    abort_cache: u64,
    resolved: bool,
}

impl CriticalSectionRecord {
    pub(crate) fn new(version: u32, flags: DescriptorFlags, address: u64) -> Self {
        CriticalSectionRecord {
            version,
            flags,
            address,
            start_cache: 0,
            post_commit_offset: 0,
            abort_cache: 0,
            resolved: false,
        }
    }

    /// Fill in the cache addresses resolved by the patch step.
    ///
    /// ## Arguments
    /// * 'start_cache'        - Cache address of the native copy's first instruction
    /// * 'post_commit_offset' - Offset from start to just past the commit, matching
    ///   the kernel contract of storing an offset rather than an absolute address
    /// * 'abort_cache'        - Cache address of the abort trampoline entry
    pub(crate) fn resolve_addresses(
        &mut self,
        start_cache: u64,
        post_commit_offset: u64,
        abort_cache: u64,
    ) {
        self.start_cache = start_cache;
        self.post_commit_offset = post_commit_offset;
        self.abort_cache = abort_cache;
        self.resolved = true;
    }

    /// The address the record itself lives at.
    ///
    /// This is the value written into a thread's descriptor-pointer slot and loaded
    /// by the region's patched placeholder.
    #[must_use]
    pub fn address(&self) -> u64 {
        self.address
    }

    /// Cache address of the native copy's first instruction.
    #[must_use]
    pub fn start_cache(&self) -> u64 {
        self.start_cache
    }

    /// Offset from the native copy's start to just past its commit instruction.
    #[must_use]
    pub fn post_commit_offset(&self) -> u64 {
        self.post_commit_offset
    }

    /// Cache address of the abort trampoline entry.
    #[must_use]
    pub fn abort_cache(&self) -> u64 {
        self.abort_cache
    }

    /// Whether the patch step has resolved the cache addresses.
    #[must_use]
    pub fn is_resolved(&self) -> bool {
        self.resolved
    }
}

/// Owner of the lifetime table and the registration state of every thread.
///
/// The live table is a concurrent map; the epoch bookkeeping sits behind one
/// process-wide lock, which is sufficient because contention is limited to region
/// creation and deletion.
pub struct RegistrationManager {
    regions: DashMap<RegionId, Arc<CriticalSectionRecord>>,
    epoch: Mutex<EpochState>,
    next_record: AtomicU64,
    record_base: u64,
    max_live_records: Option<usize>,
}

/// Spacing of record allocations; records are 32 bytes like the descriptor rows
/// they mirror, rounded up to their required alignment.
const RECORD_STRIDE: u64 = 32;

impl RegistrationManager {
    /// Create a manager with the given allocation policy.
    ///
    /// ## Arguments
    /// * 'config' - Process configuration; record base and live-record bound apply
    #[must_use]
    pub fn new(config: &RseqConfig) -> Self {
        RegistrationManager {
            regions: DashMap::new(),
            epoch: Mutex::new(EpochState::default()),
            next_record: AtomicU64::new(0),
            record_base: config.record_base,
            max_live_records: config.max_live_records,
        }
    }

    /// Reserve a record for a region being patched.
    ///
    /// The record is exclusively owned by the caller until it is published; a
    /// reservation abandoned on an error path is simply dropped, leaving no trace
    /// in the lifetime table.
    ///
    /// ## Arguments
    /// * 'version' - Descriptor version of the section
    /// * 'flags'   - Trigger-selection flags of the section
    ///
    /// # Errors
    /// Returns [`crate::Error::AllocationFailure`] when the live-record bound is
    /// reached. The caller must abandon the region rather than emit it referencing
    /// a record that does not exist.
    pub fn reserve_record(
        &self,
        version: u32,
        flags: DescriptorFlags,
    ) -> Result<CriticalSectionRecord> {
        if let Some(max) = self.max_live_records {
            let live = self.regions.len() + self.pending_free()?;
            if live >= max {
                return Err(Error::AllocationFailure);
            }
        }

        let index = self.next_record.fetch_add(1, Ordering::Relaxed);
        let address = self.record_base + index * RECORD_STRIDE;
        Ok(CriticalSectionRecord::new(version, flags, address))
    }

    /// Publish a patched record into the lifetime table.
    ///
    /// ## Arguments
    /// * 'region' - The generated region the record belongs to
    /// * 'record' - The record, with cache addresses resolved
    ///
    /// # Errors
    /// Returns [`crate::Error::Error`] if the record's addresses were never
    /// resolved or the region already has a record.
    pub fn publish(
        &self,
        region: RegionId,
        record: CriticalSectionRecord,
    ) -> Result<Arc<CriticalSectionRecord>> {
        if !record.is_resolved() {
            return Err(Error::Error(format!(
                "record for {region} published before its addresses were resolved"
            )));
        }

        let record = Arc::new(record);
        match self.regions.entry(region) {
            Entry::Occupied(_) => {
                return Err(Error::Error(format!("{region} already has a record")));
            }
            Entry::Vacant(slot) => {
                slot.insert(Arc::clone(&record));
            }
        }

        debug!(region = %region, address = record.address(), "record published");
        Ok(record)
    }

    /// Look up the record of a live region.
    ///
    /// ## Arguments
    /// * 'region' - The generated region
    #[must_use]
    pub fn lookup(&self, region: RegionId) -> Option<Arc<CriticalSectionRecord>> {
        self.regions.get(&region).map(|entry| Arc::clone(&entry))
    }

    /// Number of live (linked) records.
    #[must_use]
    pub fn live_records(&self) -> usize {
        self.regions.len()
    }

    /// Number of unlinked records still awaiting their reclamation epoch.
    ///
    /// # Errors
    /// Returns [`crate::Error::LockError`] if the epoch lock is poisoned.
    pub fn pending_free(&self) -> Result<usize> {
        Ok(self.epoch()?.pending_len())
    }

    /// Register a thread as a participant in the reclamation protocol.
    ///
    /// ## Arguments
    /// * 'thread' - The thread joining
    ///
    /// # Errors
    /// Returns [`crate::Error::LockError`] if the epoch lock is poisoned.
    pub fn register_thread(&self, thread: ThreadId) -> Result<()> {
        self.epoch()?.register_thread(thread);
        Ok(())
    }

    /// Retire a departing thread and reclaim whatever its departure allows.
    ///
    /// ## Arguments
    /// * 'thread' - The thread leaving the process
    ///
    /// # Errors
    /// Returns [`crate::Error::LockError`] if the epoch lock is poisoned.
    pub fn retire_thread(&self, thread: ThreadId) -> Result<usize> {
        Ok(self.epoch()?.retire_thread(thread))
    }

    /// Enter the native (second) phase of a section on the calling thread.
    ///
    /// This is the application state barrier. In order: the region's record is
    /// looked up in the live table, the thread is marked active, the record is
    /// published through the thread's descriptor-pointer slot, and, immediately
    /// before this call completes, the entry register checkpoint is restored into
    /// machine state. Nothing instrumented or foreign may execute between the
    /// restore and the native copy; the host lowers the phase-barrier op to exactly
    /// this call followed by the fall-through.
    ///
    /// Capturing the checkpoint at section entry was the caller's responsibility;
    /// the restore substitutes for the state an abort handler would normally see,
    /// because every intermediate store was elided in the first phase.
    ///
    /// ## Arguments
    /// * 'thread'      - The calling thread's runtime state
    /// * 'slots'       - The thread's checkpoint slots, captured at section entry
    /// * 'machine'     - The thread's machine context
    /// * 'slot_offset' - The resolved descriptor storage offset
    /// * 'region'      - The section-ending region being entered
    ///
    /// # Errors
    /// Returns [`crate::Error::RegionUnlinked`] when the region has no live record
    /// and [`crate::Error::StaleCheckpoint`] when the checkpoint was already
    /// consumed; in both cases the thread's slot and state are left cleared.
    pub fn enter_second_phase(
        &self,
        thread: &mut ThreadRuntimeState,
        slots: &mut RegisterCheckpointSlots,
        machine: &mut dyn MachineContext,
        slot_offset: u64,
        region: RegionId,
    ) -> Result<Arc<CriticalSectionRecord>> {
        let Some(record) = self.lookup(region) else {
            return Err(Error::RegionUnlinked(region));
        };

        thread.active = Some(region);
        machine.write_descriptor_slot(slot_offset, record.address());

        if let Err(error) = slots.consume_into(machine) {
            thread.active = None;
            machine.write_descriptor_slot(slot_offset, 0);
            return Err(error);
        }

        Ok(record)
    }

    /// Clear the calling thread's descriptor-pointer slot and active state.
    ///
    /// Invoked on natural completion, on abort-trampoline entry, as the callback
    /// when a generated region is unlinked or deleted, and again at the thread's
    /// post-unlink checkpoint before a record is freed.
    ///
    /// ## Arguments
    /// * 'thread'      - The calling thread's runtime state
    /// * 'machine'     - The thread's machine context
    /// * 'slot_offset' - The resolved descriptor storage offset
    pub fn clear(
        &self,
        thread: &mut ThreadRuntimeState,
        machine: &mut dyn MachineContext,
        slot_offset: u64,
    ) {
        machine.write_descriptor_slot(slot_offset, 0);
        thread.active = None;
    }

    /// Unlink a region's record: step one of the deletion protocol.
    ///
    /// The live-table entry is removed and the record stamped with a fresh unlink
    /// generation. The host must invoke [`RegistrationManager::clear`] on every
    /// thread it unlinked the region for; the record itself survives until every
    /// live thread has checkpointed past the stamp.
    ///
    /// ## Arguments
    /// * 'region' - The region being deleted or flushed
    ///
    /// # Errors
    /// Returns [`crate::Error::RegionUnlinked`] when the region has no live record
    /// and [`crate::Error::LockError`] if the epoch lock is poisoned.
    pub fn unlink(&self, region: RegionId) -> Result<()> {
        let Some((_, record)) = self.regions.remove(&region) else {
            return Err(Error::RegionUnlinked(region));
        };

        self.epoch()?.unlink(region, record);
        Ok(())
    }

    /// Record that a thread has passed a checkpoint: step two of the deletion
    /// protocol.
    ///
    /// Every record whose unlink generation all live threads have now observed is
    /// freed. Returns the number of records freed by this checkpoint.
    ///
    /// ## Arguments
    /// * 'thread' - The thread passing its checkpoint
    ///
    /// # Errors
    /// Returns [`crate::Error::LockError`] if the epoch lock is poisoned.
    pub fn thread_checkpoint(&self, thread: ThreadId) -> Result<usize> {
        Ok(self.epoch()?.checkpoint(thread))
    }

    fn epoch(&self) -> Result<std::sync::MutexGuard<'_, EpochState>> {
        self.epoch.lock().map_err(|_| Error::LockError)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use crate::engine::Register;

    #[derive(Default)]
    struct MockMachine {
        registers: HashMap<Register, u64>,
        slots: HashMap<u64, u64>,
    }

    impl MachineContext for MockMachine {
        fn register(&self, register: Register) -> u64 {
            self.registers.get(&register).copied().unwrap_or(0)
        }

        fn set_register(&mut self, register: Register, value: u64) {
            self.registers.insert(register, value);
        }

        fn write_descriptor_slot(&mut self, offset: u64, value: u64) {
            self.slots.insert(offset, value);
        }

        fn read_descriptor_slot(&self, offset: u64) -> u64 {
            self.slots.get(&offset).copied().unwrap_or(0)
        }
    }

    fn published_record(manager: &RegistrationManager, region: RegionId) -> Arc<CriticalSectionRecord> {
        let mut record = manager
            .reserve_record(0, DescriptorFlags::empty())
            .unwrap();
        record.resolve_addresses(0x9000, 0x20, 0x9100);
        manager.publish(region, record).unwrap()
    }

    #[test]
    fn record_addresses_are_spaced() {
        let manager = RegistrationManager::new(&RseqConfig::default());
        let first = manager.reserve_record(0, DescriptorFlags::empty()).unwrap();
        let second = manager.reserve_record(0, DescriptorFlags::empty()).unwrap();

        assert_eq!(second.address() - first.address(), RECORD_STRIDE);
        assert_eq!(first.address() % 32, 0);
    }

    #[test]
    fn allocation_bound_enforced() {
        let config = RseqConfig {
            max_live_records: Some(1),
            ..RseqConfig::default()
        };
        let manager = RegistrationManager::new(&config);

        published_record(&manager, RegionId(1));
        assert!(matches!(
            manager.reserve_record(0, DescriptorFlags::empty()),
            Err(Error::AllocationFailure)
        ));
    }

    #[test]
    fn unresolved_record_cannot_publish() {
        let manager = RegistrationManager::new(&RseqConfig::default());
        let record = manager.reserve_record(0, DescriptorFlags::empty()).unwrap();

        assert!(manager.publish(RegionId(1), record).is_err());
    }

    #[test]
    fn barrier_restores_after_slot_write() {
        let manager = RegistrationManager::new(&RseqConfig::default());
        let record = published_record(&manager, RegionId(7));

        let mut machine = MockMachine::default();
        machine.set_register(Register::R2, 0x1111);

        let mut thread = ThreadRuntimeState::new(ThreadId(1));
        let mut slots = RegisterCheckpointSlots::new();
        slots.capture(&machine, crate::engine::RegisterMask::of(&[Register::R2]));

        // First phase clobbers R2.
        machine.set_register(Register::R2, 0xDEAD);

        let entered = manager
            .enter_second_phase(&mut thread, &mut slots, &mut machine, 0x40, RegionId(7))
            .unwrap();

        assert_eq!(entered.address(), record.address());
        assert_eq!(machine.read_descriptor_slot(0x40), record.address());
        assert_eq!(machine.register(Register::R2), 0x1111);
        assert!(thread.in_native_phase());

        manager.clear(&mut thread, &mut machine, 0x40);
        assert_eq!(machine.read_descriptor_slot(0x40), 0);
        assert!(!thread.in_native_phase());
    }

    #[test]
    fn stale_checkpoint_rolls_back() {
        let manager = RegistrationManager::new(&RseqConfig::default());
        published_record(&manager, RegionId(7));

        let mut machine = MockMachine::default();
        let mut thread = ThreadRuntimeState::new(ThreadId(1));
        let mut slots = RegisterCheckpointSlots::new();

        let result =
            manager.enter_second_phase(&mut thread, &mut slots, &mut machine, 0x40, RegionId(7));

        assert!(matches!(result, Err(Error::StaleCheckpoint)));
        assert_eq!(machine.read_descriptor_slot(0x40), 0);
        assert!(!thread.in_native_phase());
    }

    #[test]
    fn unlinked_region_cannot_be_entered() {
        let manager = RegistrationManager::new(&RseqConfig::default());
        published_record(&manager, RegionId(3));
        manager.register_thread(ThreadId(1)).unwrap();
        manager.unlink(RegionId(3)).unwrap();

        let mut machine = MockMachine::default();
        let mut thread = ThreadRuntimeState::new(ThreadId(1));
        let mut slots = RegisterCheckpointSlots::new();
        slots.capture(&machine, crate::engine::RegisterMask::EMPTY);

        assert!(matches!(
            manager.enter_second_phase(&mut thread, &mut slots, &mut machine, 0x40, RegionId(3)),
            Err(Error::RegionUnlinked(_))
        ));
    }

    #[test]
    fn two_step_epoch_frees_record() {
        let manager = RegistrationManager::new(&RseqConfig::default());
        let record = published_record(&manager, RegionId(3));
        let weak = Arc::downgrade(&record);
        drop(record);

        manager.register_thread(ThreadId(1)).unwrap();
        manager.register_thread(ThreadId(2)).unwrap();

        manager.unlink(RegionId(3)).unwrap();
        assert!(manager.lookup(RegionId(3)).is_none());
        assert_eq!(manager.pending_free().unwrap(), 1);
        assert!(weak.upgrade().is_some());

        manager.thread_checkpoint(ThreadId(1)).unwrap();
        assert!(weak.upgrade().is_some());

        manager.thread_checkpoint(ThreadId(2)).unwrap();
        assert!(weak.upgrade().is_none());
        assert_eq!(manager.pending_free().unwrap(), 0);
    }
}
