//! Direct mappings: BAR-offset windows onto a queue's DRAM allocation.
//!
//! A queue owner may expose a 2 MiB-aligned sub-range of its granted DRAM
//! for user-space or peer (PCIe requester) access. Peer-filtered mappings
//! also claim a RID filter window. Mappings are owned exclusively by their
//! queue context and die with it: queue disable tears down every mapping
//! still attached.
//!
//! This module also produces the mappable-region lists the mmap layer
//! exposes for the three logical BARs.

use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::device::{AccelDevice, DeviceMode};
use crate::error::{AccelError, Result};
use crate::framework::{prot, region_flags, Caller, MappableRegion};
use crate::queue::{QueueCtx, QueueState};
use crate::rid_filter;
use crate::shared_buf::SharedBuffer;
use crate::{adebug, aerror, ainfo};
use crate::DRAM_CHUNK_BYTES;

/// A direct-mapping control request; `mmap_offset` is filled in on
/// allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirectMappingRequest {
    pub queue_index: usize,
    pub bar: usize,
    /// Byte offset into the queue's DRAM allocation; chunk aligned.
    pub base: u64,
    /// Window length in bytes; nonzero, chunk aligned.
    pub size: u64,
    /// Subset of {read, write}.
    pub prot: u32,
    /// Peer requester id and mask; zero means no peer filtering.
    pub peer_rid_address: u32,
    pub peer_rid_mask: u32,
    /// Opaque mmap cookie, allocated by the BAR-space owner.
    pub mmap_offset: u64,
}

impl DirectMappingRequest {
    /// Identity for deallocation matching: everything the caller supplied,
    /// nothing the driver filled in.
    fn matches(&self, other: &DirectMappingRequest) -> bool {
        self.bar == other.bar
            && self.base == other.base
            && self.size == other.size
            && self.prot == other.prot
            && self.peer_rid_address == other.peer_rid_address
            && self.peer_rid_mask == other.peer_rid_mask
    }
}

/// One live direct mapping, attached to its queue's mapping list.
pub struct DirectMapping {
    pub request: DirectMappingRequest,
    /// RID filter window backing peer access, if any was requested.
    pub rid_filter_window: Option<usize>,
    /// The (start, length, flags) descriptor handed to the mmap layer.
    pub mappable_region: MappableRegion,
    /// Exported shareable-buffer handles; revoked before the mapping dies.
    pub(crate) shared_bufs: Vec<Arc<SharedBuffer>>,
}

fn lookup_queue_ctx_by_index(dev: &AccelDevice, index: usize) -> Result<&QueueCtx> {
    if index >= dev.desc.queue_ctx_count {
        aerror!(
            "ACCEL/Mapping: Invalid queue index {}, must be in the range [0, {})",
            index,
            dev.desc.queue_ctx_count
        );
        return Err(AccelError::InvalidArgument);
    }
    Ok(&dev.queues[index])
}

/// Is the queue enabled by (and therefore operable by) this caller?
fn queue_is_enabled_by_caller(state: &QueueState, caller: Caller) -> bool {
    state.allocated && state.owner == caller.id
}

/// Structural validation, before any state is touched.
fn check_allocate_request(dev: &AccelDevice, request: &DirectMappingRequest) -> Result<()> {
    if request.bar != dev.desc.dram_bar {
        aerror!(
            "ACCEL/Mapping: Direct mapping bar must be {} (the DRAM BAR): {}",
            dev.desc.dram_bar,
            request.bar
        );
        return Err(AccelError::InvalidArgument);
    }

    if request.base % DRAM_CHUNK_BYTES != 0 {
        aerror!(
            "ACCEL/Mapping: Direct mapping base must be 2 MiB aligned: {:#x}",
            request.base
        );
        return Err(AccelError::InvalidArgument);
    }

    if request.size == 0 || request.size % DRAM_CHUNK_BYTES != 0 {
        aerror!(
            "ACCEL/Mapping: Direct mapping size must be non-zero and 2 MiB aligned: {:#x}",
            request.size
        );
        return Err(AccelError::InvalidArgument);
    }

    if request.prot & (prot::READ | prot::WRITE) == 0
        || request.prot & !(prot::READ | prot::WRITE) != 0
    {
        aerror!(
            "ACCEL/Mapping: Direct mapping protection is invalid: {}",
            request.prot
        );
        return Err(AccelError::InvalidArgument);
    }

    if !dev.desc.direct_mapping_supported {
        aerror!("ACCEL/Mapping: Direct mapping not supported on this device");
        return Err(AccelError::NotSupported);
    }

    Ok(())
}

/// Create a direct mapping over `[base, base+size)` of the queue's DRAM
/// allocation. Fills `request.mmap_offset` on success.
pub fn allocate_direct_mapping(
    dev: &AccelDevice,
    caller: Caller,
    request: &mut DirectMappingRequest,
) -> Result<()> {
    if dev.is_dead() {
        aerror!("ACCEL/Mapping: The device has failed.");
        return Err(AccelError::Io);
    }

    check_allocate_request(dev, request)?;

    let queue = lookup_queue_ctx_by_index(dev, request.queue_index)?;

    let state = queue.state.lock();
    let mut mappings = queue.mappings.lock();

    if !queue_is_enabled_by_caller(&state, caller) {
        aerror!(
            "ACCEL/Mapping: Queue {} is not enabled and owned by the process",
            request.queue_index
        );
        return Err(AccelError::InvalidArgument);
    }

    let allocation_bytes = DRAM_CHUNK_BYTES * state.dram_chunks as u64;
    if request.base + request.size > allocation_bytes {
        aerror!(
            "ACCEL/Mapping: Direct mapping cannot exceed the queue {}'s DRAM \
             allocation: {:#x} + {:#x} > {:#x}",
            request.queue_index,
            request.base,
            request.size,
            allocation_bytes
        );
        return Err(AccelError::InvalidArgument);
    }

    let mut mapping = DirectMapping {
        request: *request,
        rid_filter_window: None,
        mappable_region: MappableRegion {
            start: u64::MAX,
            length_bytes: request.size,
            flags: (if request.prot & prot::READ != 0 {
                region_flags::READ
            } else {
                0
            }) | (if request.prot & prot::WRITE != 0 {
                region_flags::WRITE
            } else {
                0
            }),
        },
        shared_bufs: Vec::new(),
    };
    mapping.request.mmap_offset = u64::MAX;

    if request.peer_rid_address != 0 || request.peer_rid_mask != 0 {
        let window = rid_filter::allocate(
            dev,
            queue.index as u8,
            request.peer_rid_address,
            request.peer_rid_mask,
            request.prot,
            request.bar,
            request.base,
            request.size,
        )?;
        mapping.rid_filter_window = Some(window);
    }

    if let Err(err) = dev
        .variant
        .allocate_direct_mapping(dev, queue, &state, &mut mapping)
    {
        if let Some(window) = mapping.rid_filter_window {
            let _ = rid_filter::deallocate(dev, window, queue.index as u8);
        }
        return Err(err);
    }

    request.mmap_offset = mapping.request.mmap_offset;

    ainfo!(
        "ACCEL/Mapping: Queue {} direct mapping allocated for BAR{} [{:#x}-{:#x}], \
         prot={}, rid_filter_window={:?}, mmap_offset={:#x}, mappable_region=[{:#x}, {:#x}]",
        request.queue_index,
        request.bar,
        request.base,
        request.base + request.size - 1,
        request.prot,
        mapping.rid_filter_window,
        request.mmap_offset,
        mapping.mappable_region.start,
        mapping.mappable_region.start + mapping.mappable_region.length_bytes - 1
    );

    mappings.push(mapping);
    Ok(())
}

/// Destroy the mapping exactly matching `request`.
pub fn deallocate_direct_mapping(
    dev: &AccelDevice,
    caller: Caller,
    request: &DirectMappingRequest,
) -> Result<()> {
    let queue = lookup_queue_ctx_by_index(dev, request.queue_index)?;

    let state = queue.state.lock();
    let mut mappings = queue.mappings.lock();

    if !queue_is_enabled_by_caller(&state, caller) {
        aerror!(
            "ACCEL/Mapping: Queue {} is not enabled and owned by the process",
            request.queue_index
        );
        return Err(AccelError::InvalidArgument);
    }

    let position = mappings.iter().position(|mapping| {
        adebug!(
            "ACCEL/Mapping: Checking direct mapping for queue {} of BAR{} [{:#x}, {:#x}], \
             prot={}",
            request.queue_index,
            mapping.request.bar,
            mapping.request.base,
            mapping.request.base + mapping.request.size - 1,
            mapping.request.prot
        );
        mapping.request.matches(request)
    });

    match position {
        Some(index) => {
            let mapping = mappings.remove(index);
            remove_direct_mapping(dev, caller, queue, mapping)
        }
        None => {
            aerror!(
                "ACCEL/Mapping: Failed to find a direct mapping to deallocate for queue \
                 {} of BAR{} [{:#x}, {:#x}], prot={}",
                request.queue_index,
                request.bar,
                request.base,
                request.base + request.size - 1,
                request.prot
            );
            Err(AccelError::InvalidArgument)
        }
    }
}

/// Tear one mapping down: revoke exported buffers, unmap the caller,
/// release the RID filter window and run the device-specific teardown. The
/// record is already off its queue's list.
pub(crate) fn remove_direct_mapping(
    dev: &AccelDevice,
    caller: Caller,
    queue: &QueueCtx,
    mut mapping: DirectMapping,
) -> Result<()> {
    // Exported handles observe the revocation before the window dies.
    for buf in mapping.shared_bufs.drain(..) {
        buf.revoke();
    }

    dev.platform
        .unmap_region(caller.id, mapping.request.bar, &mapping.mappable_region);

    let ret = dev.variant.deallocate_direct_mapping(dev, queue, &mapping);
    if ret.is_err() {
        aerror!(
            "ACCEL/Mapping: Error occurred in deallocating direct mapping for queue {} \
             of BAR{} [{:#x}, {:#x}], prot={}, rid_filter_window={:?}",
            queue.index,
            mapping.request.bar,
            mapping.request.base,
            mapping.request.base + mapping.request.size - 1,
            mapping.request.prot,
            mapping.rid_filter_window
        );
    }

    if let Some(window) = mapping.rid_filter_window {
        let _ = rid_filter::deallocate(dev, window, queue.index as u8);
    }

    ret
}

// =============================================================================
// Mappable-region enumeration
// =============================================================================

/// May `caller` map queue `index`'s windows? Owners always; a subcontainer
/// master additionally maps every queue reserved to its subcontainer.
pub fn should_map_queue(dev: &AccelDevice, caller: Caller, index: usize) -> bool {
    let subcontainer_master = dev.is_subcontainer() && dev.owner() == caller.id;

    let state = dev.queues[index].state.lock();
    state.owner == caller.id
        || (subcontainer_master && state.reserved_by == dev.clone_index)
}

/// Enumerate the direct mappings targeting `bar` across every queue the
/// caller is entitled to see. With `output`, fills regions and fails with
/// out-of-space if the set grew since the counting pass; without, counts.
pub fn get_direct_mappings_for_bar(
    dev: &AccelDevice,
    caller: Caller,
    bar: usize,
    mut output: Option<&mut [MappableRegion]>,
) -> Result<usize> {
    let mut output_index = 0;

    for (index, queue) in dev.queues.iter().enumerate() {
        if !should_map_queue(dev, caller, index) {
            continue;
        }

        let mappings = queue.mappings.lock();
        for mapping in mappings.iter() {
            if mapping.request.bar != bar {
                continue;
            }

            if let Some(out) = output.as_deref_mut() {
                if output_index >= out.len() {
                    aerror!(
                        "ACCEL/Mapping: No space to put direct mapping for queue {}! \
                         Direct mappings may have changed during mmap.",
                        index
                    );
                    return Err(AccelError::NoMemory);
                }
                out[output_index] = mapping.mappable_region;
                adebug!(
                    "ACCEL/Mapping: Added direct mappable region {} for queue {}: BAR{} \
                     [{:#x}, {:#x}], flags={}",
                    output_index,
                    index,
                    bar,
                    mapping.mappable_region.start,
                    mapping.mappable_region.start + mapping.mappable_region.length_bytes,
                    mapping.mappable_region.flags
                );
            }

            output_index += 1;
        }
    }

    Ok(output_index)
}

/// Count-then-fill wrapper around [`get_direct_mappings_for_bar`].
pub fn get_direct_mappable_regions(
    dev: &AccelDevice,
    caller: Caller,
    bar: usize,
) -> Result<Vec<MappableRegion>> {
    let count = get_direct_mappings_for_bar(dev, caller, bar, None)?;
    if count == 0 {
        return Ok(Vec::new());
    }

    let mut regions = alloc::vec![MappableRegion::default(); count];
    let filled = get_direct_mappings_for_bar(dev, caller, bar, Some(&mut regions))?;
    regions.truncate(filled);
    Ok(regions)
}

/// The per-queue command window on the firmware BAR.
pub fn populate_queue_mappable_region(dev: &AccelDevice, index: usize) -> MappableRegion {
    MappableRegion {
        start: (dev.desc.mappable.queue_start)(index),
        length_bytes: (dev.desc.mappable.queue_length)(index),
        flags: region_flags::READ | region_flags::WRITE,
    }
}

/// Produce the full mappable-region list for one BAR, under the caller's
/// entitlements. This is what the mmap layer consumes.
pub fn get_mappable_regions(
    dev: &AccelDevice,
    caller: Caller,
    bar: usize,
) -> Result<Vec<MappableRegion>> {
    let desc = dev.desc;

    if bar == desc.firmware_register_bar {
        // The master of a top-level device sees everything.
        let return_all = (dev.owner() == caller.id || caller.privileged)
            && !dev.is_subcontainer();

        let mut regions = Vec::new();
        for index in 0..desc.queue_ctx_count {
            if should_map_queue(dev, caller, index) || return_all {
                regions.push(populate_queue_mappable_region(dev, index));
                adebug!("ACCEL/Mapping: Adding queue region {}", index);
            }
        }

        regions.push(desc.mappable.global_region);
        if return_all {
            regions.push(desc.mappable.master_region);
        }
        Ok(regions)
    } else if bar == desc.dram_bar {
        let direct = get_direct_mappable_regions(dev, caller, bar)?;
        if !direct.is_empty() {
            return Ok(direct);
        }

        // No direct mappings: only privileged callers see the raw BAR.
        if !caller.privileged {
            return Ok(Vec::new());
        }
        Ok(desc.mappable.dram_regions.to_vec())
    } else if bar == desc.debug_bar {
        if (dev.owner() != caller.id && !caller.privileged) || dev.is_subcontainer() {
            return Ok(Vec::new());
        }
        Ok(desc.mappable.debug_regions.to_vec())
    } else {
        aerror!("ACCEL/Mapping: Invalid BAR specified: {}", bar);
        Ok(Vec::new())
    }
}

/// Page-table entitlement for the generic buffer map/unmap path: an
/// overseer owns none, a top-level device owns all, a subcontainer owns
/// its reservations.
pub fn owns_page_table(dev: &AccelDevice, page_table_index: usize) -> bool {
    if !dev.is_subcontainer() {
        return dev.state.lock().mode != DeviceMode::Overseer;
    }

    if page_table_index >= dev.desc.queue_ctx_count {
        aerror!(
            "ACCEL/Mapping: Requested page table ownership for invalid index: {}",
            page_table_index
        );
        return false;
    }

    dev.queues[page_table_index].state.lock().reserved_by == dev.clone_index
}
