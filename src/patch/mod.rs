//! Post-emission address resolution and descriptor patching.
//!
//! A section-ending region is emitted with three unknowns: where its native copy
//! will start, where its trampoline entry will land, and where its critical-section
//! record will live. All three resolve at the post-emission control point, once the
//! code cache has assigned the region its base address. The [`PatchController`] runs
//! exactly once per region at that point, before the region can retire to the cache:
//! it reserves the record, writes the resolved addresses into it, and patches the
//! region's placeholder load to reference the now-allocated record.
//!
//! # Encoding-Width Agreement
//!
//! The placeholder load's encoding depends on how far the record lives from the load
//! site, an instance-specific fact. Any alternate representation of the region
//! produced by address-independent recreation (for inspection or translation) cannot
//! re-derive that distance, so the chosen width is recorded in the region's
//! [`crate::emitter::PatchInfo`] and recreation consults it. Both representations
//! therefore agree on the encoding for that specific region instance, in both the
//! single-instruction and padded multi-instruction cases.

use std::sync::Arc;

use tracing::debug;

use crate::{
    emitter::{EmittedOp, EmittedRegion, EncodingWidth, PatchInfo},
    manager::{CriticalSectionRecord, RegistrationManager},
    Error, Result,
};

/// Resolver of emitted-region addresses and writer of descriptor records.
pub struct PatchController<'a> {
    manager: &'a RegistrationManager,
}

impl<'a> PatchController<'a> {
    /// Create a patch controller over the process's registration manager.
    #[must_use]
    pub fn new(manager: &'a RegistrationManager) -> Self {
        PatchController { manager }
    }

    /// Resolve a freshly emitted region at its post-emission control point.
    ///
    /// Reserves the region's record, resolves the native-copy start, the
    /// post-commit offset (stored as an offset from start, matching the kernel
    /// contract), and the trampoline entry, patches the placeholder load with the
    /// record's address in the width its distance requires, and publishes the
    /// record into the lifetime table.
    ///
    /// ## Arguments
    /// * 'region' - The emitted region, not yet retired to the cache
    /// * 'base'   - The cache base address the region was placed at
    ///
    /// # Errors
    /// Returns [`crate::Error::AllocationFailure`] when the record cannot be
    /// allocated; the region is left unpatched and must be abandoned, never emitted
    /// referencing the missing record. Returns [`crate::Error::Error`] if the
    /// region was already patched.
    pub fn resolve(
        &self,
        region: &mut EmittedRegion,
        base: u64,
    ) -> Result<Arc<CriticalSectionRecord>> {
        if region.patch_info().is_some() {
            return Err(Error::Error(format!(
                "{} patched more than once",
                region.region
            )));
        }

        let mut record = self
            .manager
            .reserve_record(region.descriptor.version, region.descriptor.flags)?;

        let start_cache = region.op_address(base, region.native_start());
        let post_commit_offset = region.native_copy_size();
        let abort_cache = region.op_address(base, region.trampoline_entry());
        record.resolve_addresses(start_cache, post_commit_offset, abort_cache);

        let load_site = region.op_address(base, region.record_load());
        let width = EncodingWidth::for_distance(load_site, record.address());
        region.set_record_load(width, record.address());
        region.set_patch_info(PatchInfo {
            base,
            width,
            record_address: record.address(),
        });

        debug!(
            region = %region.region,
            base,
            start_cache,
            post_commit_offset,
            abort_cache,
            width = ?width,
            "patched section-ending region"
        );

        self.manager.publish(region.region, record)
    }

    /// Recreate a patched region's op stream address-independently.
    ///
    /// Rebuilds every op from the region's structure without knowing the cache
    /// base, consulting the recorded [`crate::emitter::PatchInfo`] for the
    /// placeholder encoding. The result is behaviorally identical to the patched
    /// cache copy.
    ///
    /// ## Arguments
    /// * 'region' - A region previously resolved by [`PatchController::resolve`]
    ///
    /// # Errors
    /// Returns [`crate::Error::Error`] for a region that was never patched.
    pub fn recreate(region: &EmittedRegion) -> Result<Vec<EmittedOp>> {
        let Some(info) = region.patch_info() else {
            return Err(Error::Error(format!(
                "{} recreated before being patched",
                region.region
            )));
        };

        let mut ops = region.ops.clone();
        ops[region.record_load()] = EmittedOp::RecordAddressLoad {
            width: info.width,
            address: info.record_address,
        };

        Ok(ops)
    }
}
