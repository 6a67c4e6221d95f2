//! Overseer mode: partitioning one device into subcontainers.
//!
//! A top-level device can be switched into overseer mode, which creates a
//! fixed number of clone sub-devices. The overseer process then reserves
//! queues and DRAM chunks into each subcontainer; subcontainer masters
//! allocate only out of their reservations. Switching back requires every
//! subcontainer to be idle and returns all resources to the unreserved
//! pool.

use alloc::sync::Arc;
use core::sync::atomic::Ordering;

use crate::device::{AccelDevice, DeviceMode};
use crate::error::{AccelError, Result};
use crate::framework::{Caller, NO_CLIENT};
use crate::ioctl::FrameworkRequest;
use crate::{adebug, aerror, ainfo, awarn};
use crate::MAX_SUBCONTAINERS;

/// Overseer resource-reservation request.
#[derive(Debug, Clone, Copy)]
pub struct ReservationRequest {
    pub subcontainer_index: u32,
    /// Desired total queue reservation for the subcontainer.
    pub num_queues: u32,
    /// Desired total chunk reservation for the subcontainer.
    pub num_chunks: u32,
}

/// Create the clone sub-devices into the (already locked) subcontainer
/// set.
fn overseer_start(
    dev: &Arc<AccelDevice>,
    subcontainers: &mut alloc::vec::Vec<Arc<AccelDevice>>,
) {
    subcontainers.clear();
    for index in 0..MAX_SUBCONTAINERS {
        subcontainers.push(AccelDevice::new_subcontainer(dev, index as u32));
    }
    dev.set_subcontainer_count(MAX_SUBCONTAINERS);

    ainfo!("ACCEL/Overseer: Entered overseer mode.");
}

/// Tear down the clone sub-devices and return every resource to the
/// unreserved pool.
fn overseer_stop(dev: &AccelDevice, subcontainers: &mut alloc::vec::Vec<Arc<AccelDevice>>) {
    for sub in subcontainers.iter() {
        sub.reserved_chunks.store(0, Ordering::Relaxed);
    }
    subcontainers.clear();
    dev.set_subcontainer_count(0);

    dev.reserved_chunks
        .store(dev.desc.total_chunks as i64, Ordering::Relaxed);
    for queue in dev.queues.iter() {
        queue.state.lock().reserved_by = None;
    }

    ainfo!("ACCEL/Overseer: Entered normal execution mode.");
}

/// Switch a top-level device between NORMAL and OVERSEER. Entering
/// overseer mode requires an empty queue pool; leaving it requires every
/// subcontainer to be unowned. Same-mode requests are no-ops.
pub fn set_mode(dev: &Arc<AccelDevice>, mode: DeviceMode) -> Result<()> {
    if dev.is_subcontainer() {
        aerror!("ACCEL/Overseer: Subcontainers cannot set overseer modes!");
        return Err(AccelError::InvalidArgument);
    }

    // Lock 1 then lock 2: mode transitions serialize against every other
    // control path.
    let mut subcontainers = dev.subcontainers.lock();
    let mut dstate = dev.state.lock();

    if mode == DeviceMode::Normal && dstate.mode == DeviceMode::Overseer {
        for (index, sub) in subcontainers.iter().enumerate() {
            if sub.ownership.lock().is_owned {
                aerror!(
                    "ACCEL/Overseer: Cannot enter normal mode; subcontainer {} is in use",
                    index
                );
                return Err(AccelError::InvalidArgument);
            }
        }

        overseer_stop(dev, &mut subcontainers);
        dstate.mode = DeviceMode::Normal;
    } else if mode == DeviceMode::Overseer && dstate.mode == DeviceMode::Normal {
        for queue in dev.queues.iter() {
            if queue.state.lock().allocated {
                aerror!(
                    "ACCEL/Overseer: Cannot enter overseer mode; queue ctx {} is \
                     allocated",
                    queue.index
                );
                return Err(AccelError::InvalidArgument);
            }
        }

        overseer_start(dev, &mut subcontainers);
        dstate.mode = DeviceMode::Overseer;
    }

    Ok(())
}

/// Resize a subcontainer's reservation to the requested queue and chunk
/// totals. Growth draws from the overseer's unreserved pool; shrinking is
/// rejected while any of the subcontainer's queues is enabled. The commit
/// never partially completes.
pub fn reserve_resources(dev: &AccelDevice, request: &ReservationRequest) -> Result<()> {
    // Lock 1 then lock 2, same as mode transitions, so a reservation never
    // races the clone set going away.
    let subcontainers = dev.subcontainers.lock();
    let dstate = dev.state.lock();

    if dstate.mode != DeviceMode::Overseer {
        aerror!("ACCEL/Overseer: Resources can only be reserved in overseer mode.");
        return Err(AccelError::PermissionDenied);
    }

    if request.subcontainer_index as usize >= MAX_SUBCONTAINERS {
        aerror!(
            "ACCEL/Overseer: Subcontainer index out-of-bounds: {}",
            request.subcontainer_index
        );
        return Err(AccelError::InvalidArgument);
    }

    let sub = match subcontainers.get(request.subcontainer_index as usize) {
        Some(sub) => sub.clone(),
        None => {
            aerror!(
                "ACCEL/Overseer: Subcontainer {} does not exist",
                request.subcontainer_index
            );
            return Err(AccelError::InvalidArgument);
        }
    };

    let chunk_delta =
        request.num_chunks as i64 - sub.reserved_chunks.load(Ordering::Relaxed);
    if chunk_delta > 0 && dev.reserved_chunks.load(Ordering::Relaxed) < chunk_delta {
        aerror!(
            "ACCEL/Overseer: Insufficient free DRAM chunks for request: avail/req \
             delta: {}/{} (total req {})",
            dev.reserved_chunks.load(Ordering::Relaxed),
            chunk_delta,
            request.num_chunks
        );
        return Err(AccelError::NoMemory);
    }

    let clone_index = sub.clone_index;
    let mut reserved_queues: i64 = 0;
    let mut free_queues: i64 = 0;
    for queue in dev.queues.iter() {
        let state = queue.state.lock();
        if state.reserved_by == clone_index {
            reserved_queues += 1;
            if state.owner != NO_CLIENT {
                awarn!(
                    "ACCEL/Overseer: Can't adjust reservations with a queue allocated!"
                );
                return Err(AccelError::Busy);
            }
        } else if state.reserved_by.is_none() {
            free_queues += 1;
        }
    }

    let mut queue_delta = request.num_queues as i64 - reserved_queues;
    if queue_delta > 0 && free_queues < queue_delta {
        aerror!(
            "ACCEL/Overseer: Insufficient free queues for request: avail/req delta: \
             {}/{} (total req {})",
            free_queues,
            queue_delta,
            request.num_queues
        );
        return Err(AccelError::Busy);
    }

    // Both checks passed; the commit below cannot fail. Chunk ledgers move
    // first, then the reserved-queue set is grown or shrunk to match.
    if chunk_delta != 0 {
        sub.reserved_chunks.fetch_add(chunk_delta, Ordering::Relaxed);
        dev.reserved_chunks.fetch_sub(chunk_delta, Ordering::Relaxed);
        adebug!(
            "ACCEL/Overseer: Subcontainer {} to {} chunks. {} remaining in overseer.",
            request.subcontainer_index,
            sub.reserved_chunks.load(Ordering::Relaxed),
            dev.reserved_chunks.load(Ordering::Relaxed)
        );
    }

    if queue_delta > 0 {
        for queue in dev.queues.iter() {
            if queue_delta == 0 {
                break;
            }
            let mut state = queue.state.lock();
            if state.reserved_by.is_none() {
                state.reserved_by = clone_index;
                queue_delta -= 1;
                adebug!(
                    "ACCEL/Overseer: Reserving queue ctx {} for subcontainer {}",
                    queue.index,
                    request.subcontainer_index
                );
            }
        }
    } else if queue_delta < 0 {
        for queue in dev.queues.iter() {
            if queue_delta == 0 {
                break;
            }
            let mut state = queue.state.lock();
            if state.reserved_by == clone_index && state.owner == NO_CLIENT {
                state.reserved_by = None;
                queue_delta += 1;
                adebug!(
                    "ACCEL/Overseer: Returning queue ctx {} from subcontainer {}",
                    queue.index,
                    request.subcontainer_index
                );
            }
        }
    }

    if queue_delta != 0 {
        aerror!(
            "ACCEL/Overseer: INTERNAL ERROR: Resource leak - queue_delta should be 0 \
             after reservation (is {})!",
            queue_delta
        );
    }

    Ok(())
}

// =============================================================================
// Role-specific permission tables
// =============================================================================

/// Generic framework requests allowed on an overseer device. The overseer
/// itself has no active queues, so everything queue-scoped is denied.
pub fn overseer_framework_request_permitted(req: &FrameworkRequest) -> bool {
    match req {
        FrameworkRequest::PartitionPageTable
        | FrameworkRequest::SetEventfd { .. }
        | FrameworkRequest::ClearEventfd { .. }
        | FrameworkRequest::MapBuffer { .. }
        | FrameworkRequest::UnmapBuffer { .. } => false,
        FrameworkRequest::ClearInterruptCounts
        | FrameworkRequest::Reset
        | FrameworkRequest::NumberPageTables
        | FrameworkRequest::PageTableSize
        | FrameworkRequest::SimplePageTableSize => true,
    }
}

/// Generic framework requests on a subcontainer: overseer-level operations
/// are always denied; queue-scoped operations require the target queue to
/// be reserved to this subcontainer, then the master-or-queue-owner rule.
pub fn subcontainer_framework_request_permitted(
    dev: &AccelDevice,
    caller: Caller,
    req: &FrameworkRequest,
) -> Result<bool> {
    let is_master = dev.check_ownership(caller) || caller.privileged;

    match req {
        FrameworkRequest::ClearInterruptCounts
        | FrameworkRequest::PartitionPageTable
        | FrameworkRequest::Reset => Ok(false),
        FrameworkRequest::NumberPageTables
        | FrameworkRequest::PageTableSize
        | FrameworkRequest::SimplePageTableSize => Ok(true),
        FrameworkRequest::SetEventfd { interrupt }
        | FrameworkRequest::ClearEventfd { interrupt } => {
            if *interrupt >= dev.desc.num_interrupts {
                return Err(AccelError::InvalidArgument);
            }
            if *interrupt >= dev.desc.queue_ctx_count {
                // Beyond the per-queue interrupts lie device-global lines a
                // subcontainer has no business with.
                return Err(AccelError::PermissionDenied);
            }
            let state = dev.queues[*interrupt].state.lock();
            if state.reserved_by != dev.clone_index {
                return Ok(false);
            }
            Ok(is_master || state.owner == caller.id)
        }
        FrameworkRequest::MapBuffer { page_table_index }
        | FrameworkRequest::UnmapBuffer { page_table_index } => {
            if *page_table_index >= dev.desc.queue_ctx_count {
                return Err(AccelError::InvalidArgument);
            }
            let state = dev.queues[*page_table_index].state.lock();
            if state.reserved_by != dev.clone_index {
                return Ok(false);
            }
            Ok(is_master || state.owner == caller.id)
        }
    }
}

/// Accelerator-specific requests allowed on an overseer device.
pub fn overseer_accel_request_permitted(req: &crate::ioctl::AccelRequest) -> bool {
    use crate::ioctl::AccelRequest;

    match req {
        AccelRequest::AllocateQueueCtx(_)
        | AccelRequest::DeallocateQueueCtx { .. }
        | AccelRequest::EnableQueueCtx(_)
        | AccelRequest::DisableQueueCtx { .. }
        | AccelRequest::SubcontainerAllocateQueueCtx(_)
        | AccelRequest::AllocateDirectMapping(_)
        | AccelRequest::DeallocateDirectMapping(_) => false,
        AccelRequest::ProcessIsMaster { .. }
        | AccelRequest::SetPriorityAlgorithm(_)
        | AccelRequest::OverseerReserveResources(_)
        | AccelRequest::OverseerSetMode(_) => true,
    }
}

/// Accelerator-specific requests allowed on a subcontainer device.
pub fn subcontainer_accel_request_permitted(req: &crate::ioctl::AccelRequest) -> bool {
    use crate::ioctl::AccelRequest;

    match req {
        AccelRequest::AllocateQueueCtx(_) => {
            awarn!(
                "ACCEL/Overseer: The subcontainer allocate request must be used when in \
                 a subcontainer."
            );
            false
        }
        AccelRequest::SetPriorityAlgorithm(_)
        | AccelRequest::OverseerReserveResources(_)
        | AccelRequest::OverseerSetMode(_) => false,
        AccelRequest::ProcessIsMaster { .. }
        | AccelRequest::DeallocateQueueCtx { .. }
        | AccelRequest::EnableQueueCtx(_)
        | AccelRequest::DisableQueueCtx { .. }
        | AccelRequest::SubcontainerAllocateQueueCtx(_)
        | AccelRequest::AllocateDirectMapping(_)
        | AccelRequest::DeallocateDirectMapping(_) => true,
    }
}
