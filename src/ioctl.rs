//! Control-request types, permission evaluation and dispatch.
//!
//! Two request families reach a device node: generic device-framework
//! requests (reset, interrupt eventfds, buffer map/unmap, page-table
//! sizing) and accelerator-specific requests. Permission is evaluated
//! before dispatch and depends on the caller's role: plain device,
//! subcontainer or overseer.
//!
//! Accelerator-specific dispatch is staged: queue-management requests
//! first, then overseer requests (when the descriptor supports them), then
//! a final stage for what neither claimed. Each stage signals
//! "not supported" to let the next one try.

use alloc::sync::Arc;

use crate::device::{AccelDevice, DeviceMode};
use crate::error::{AccelError, Result};
use crate::framework::{Caller, NO_CLIENT};
use crate::mapping::{self, DirectMappingRequest};
use crate::overseer::{self, ReservationRequest};
use crate::queue::{self, QueueCtxAllocConfig, QueueCtxConfig};
use crate::regs;
use crate::{adebug, aerror, ainfo};
use crate::QUEUE_NAME_MAX;

pub const PRIORITY_ALGORITHM_ROUND_ROBIN: i32 = 0;
pub const PRIORITY_ALGORITHM_WATERFALL: i32 = 1;

/// Priority-algorithm configuration request.
#[derive(Debug, Clone, Copy)]
pub struct PriorityAlgorithmConfig {
    pub priority: i32,
    pub algorithm: i32,
}

/// Subcontainer allocate request: carries an explicit chunk bitmap instead
/// of a plain count.
#[derive(Debug, Clone)]
pub struct SubcontainerQueueCtxConfig {
    pub name: [u8; QUEUE_NAME_MAX],
    pub priority: i32,
    /// Bitmap length in chunks; must equal the container's total chunk
    /// count.
    pub num_chunks: u32,
    /// Bit per physical chunk to claim.
    pub chunk_bitmap: alloc::vec::Vec<u8>,
    pub index: i32,
}

/// Accelerator-specific control requests. In/out fields are updated in
/// place.
#[derive(Debug, Clone)]
pub enum AccelRequest {
    ProcessIsMaster { is_master: bool },
    AllocateQueueCtx(QueueCtxConfig),
    DeallocateQueueCtx { name: [u8; QUEUE_NAME_MAX] },
    EnableQueueCtx(QueueCtxConfig),
    DisableQueueCtx { name: [u8; QUEUE_NAME_MAX] },
    SubcontainerAllocateQueueCtx(SubcontainerQueueCtxConfig),
    SetPriorityAlgorithm(PriorityAlgorithmConfig),
    OverseerReserveResources(ReservationRequest),
    OverseerSetMode(DeviceMode),
    AllocateDirectMapping(DirectMappingRequest),
    DeallocateDirectMapping(DirectMappingRequest),
}

/// Generic device-framework requests, reduced to what the permission rules
/// need to see.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameworkRequest {
    Reset,
    ClearInterruptCounts,
    SetEventfd { interrupt: usize },
    ClearEventfd { interrupt: usize },
    MapBuffer { page_table_index: usize },
    UnmapBuffer { page_table_index: usize },
    NumberPageTables,
    PageTableSize,
    SimplePageTableSize,
    PartitionPageTable,
}

// =============================================================================
// Generic framework request permissions
// =============================================================================

/// May `caller` issue this generic framework request? `Ok(false)` is a
/// clean denial; `Err` is a malformed request.
pub fn check_framework_request_permission(
    dev: &AccelDevice,
    caller: Caller,
    req: &FrameworkRequest,
) -> Result<bool> {
    if dev.is_subcontainer() {
        return overseer::subcontainer_framework_request_permitted(dev, caller, req);
    }
    if dev.state.lock().mode == DeviceMode::Overseer {
        return Ok(overseer::overseer_framework_request_permitted(req));
    }

    let is_master = dev.check_ownership(caller) || caller.privileged;

    match req {
        FrameworkRequest::Reset | FrameworkRequest::ClearInterruptCounts => Ok(is_master),
        FrameworkRequest::SetEventfd { interrupt }
        | FrameworkRequest::ClearEventfd { interrupt } => {
            if *interrupt >= dev.desc.num_interrupts {
                return Err(AccelError::InvalidArgument);
            }
            if is_master {
                return Ok(true);
            }
            if Some(*interrupt) == dev.desc.failed_codec_interrupt {
                return Ok(false);
            }
            if *interrupt < dev.desc.queue_ctx_count
                && dev.queues[*interrupt].state.lock().owner == caller.id
            {
                return Ok(true);
            }
            Ok(false)
        }
        FrameworkRequest::MapBuffer { page_table_index }
        | FrameworkRequest::UnmapBuffer { page_table_index } => {
            if *page_table_index >= dev.desc.num_page_tables {
                return Err(AccelError::InvalidArgument);
            }
            if is_master {
                return Ok(true);
            }
            if *page_table_index < dev.desc.queue_ctx_count
                && dev.queues[*page_table_index].state.lock().owner == caller.id
            {
                return Ok(true);
            }
            Ok(false)
        }
        FrameworkRequest::NumberPageTables
        | FrameworkRequest::PageTableSize
        | FrameworkRequest::SimplePageTableSize => Ok(true),
        FrameworkRequest::PartitionPageTable => Ok(false),
    }
}

// =============================================================================
// Accelerator-specific dispatch
// =============================================================================

/// Entry point for accelerator-specific control requests.
pub fn device_ioctl(
    dev: &Arc<AccelDevice>,
    caller: Caller,
    request: &mut AccelRequest,
) -> Result<()> {
    if dev.is_subcontainer() {
        if !overseer::subcontainer_accel_request_permitted(request) {
            return Err(AccelError::PermissionDenied);
        }
    } else if dev.state.lock().mode == DeviceMode::Overseer
        && !overseer::overseer_accel_request_permitted(request)
    {
        return Err(AccelError::PermissionDenied);
    }

    match queue_ioctl_dispatch(dev, caller, request) {
        Err(AccelError::NotSupported) => {}
        other => return other,
    }

    if dev.desc.overseer_supported {
        match overseer_ioctl_dispatch(dev, caller, request) {
            Err(AccelError::NotSupported) => {}
            other => return other,
        }
    }

    match request {
        AccelRequest::SetPriorityAlgorithm(config) => {
            let config = *config;
            ioctl_set_priority_algorithm(dev, caller, &config)
        }
        _ => Err(AccelError::NotSupported),
    }
}

/// Stage 1: queue-management requests.
fn queue_ioctl_dispatch(
    dev: &Arc<AccelDevice>,
    caller: Caller,
    request: &mut AccelRequest,
) -> Result<()> {
    match request {
        AccelRequest::ProcessIsMaster { is_master } => {
            adebug!("ACCEL/Ioctl: Recvd process-is-master request");
            *is_master = dev.check_ownership(caller);
            Ok(())
        }
        AccelRequest::AllocateQueueCtx(config) => {
            adebug!("ACCEL/Ioctl: Recvd allocate-queue-ctx request");
            let alloc_config = QueueCtxAllocConfig {
                name: config.name,
                priority: config.priority,
                num_chunks: config.dram_chunks,
                chunk_bitmap: None,
                index: config.index,
            };
            queue::allocate_queue_ctx(dev, caller, &alloc_config).map(|_| ())
        }
        AccelRequest::DeallocateQueueCtx { name } => {
            adebug!("ACCEL/Ioctl: Recvd deallocate-queue-ctx request");
            let name = *name;
            ioctl_deallocate_queue_ctx(dev, caller, &name)
        }
        AccelRequest::EnableQueueCtx(config) => {
            adebug!("ACCEL/Ioctl: Recvd enable-queue-ctx request");
            ioctl_enable_queue_ctx(dev, caller, config)
        }
        AccelRequest::DisableQueueCtx { name } => {
            adebug!("ACCEL/Ioctl: Recvd disable-queue-ctx request");
            let name = *name;
            ioctl_disable_queue_ctx(dev, caller, &name)
        }
        AccelRequest::SubcontainerAllocateQueueCtx(config) => {
            adebug!("ACCEL/Ioctl: Recvd subcontainer-allocate-queue-ctx request");
            ioctl_subcontainer_allocate_queue_ctx(dev, caller, config)
        }
        AccelRequest::AllocateDirectMapping(request) => {
            adebug!("ACCEL/Ioctl: Recvd allocate-direct-mapping request");
            mapping::allocate_direct_mapping(dev, caller, request)
        }
        AccelRequest::DeallocateDirectMapping(request) => {
            adebug!("ACCEL/Ioctl: Recvd deallocate-direct-mapping request");
            mapping::deallocate_direct_mapping(dev, caller, request)
        }
        _ => Err(AccelError::NotSupported),
    }
}

/// Stage 2: overseer requests, when the descriptor declares support.
fn overseer_ioctl_dispatch(
    dev: &Arc<AccelDevice>,
    caller: Caller,
    request: &mut AccelRequest,
) -> Result<()> {
    let _ = caller;
    match request {
        AccelRequest::OverseerReserveResources(reservation) => {
            adebug!("ACCEL/Ioctl: Recvd overseer-reserve-resources request");
            let reservation = *reservation;
            overseer::reserve_resources(dev, &reservation)
        }
        AccelRequest::OverseerSetMode(mode) => {
            adebug!("ACCEL/Ioctl: Recvd overseer-set-mode request");
            let mode = *mode;
            overseer::set_mode(dev, mode)
        }
        _ => Err(AccelError::NotSupported),
    }
}

// =============================================================================
// Request handlers
// =============================================================================

/// Deallocate by name: master-only; an enabled queue is disabled first and
/// its owner's tracker bit dropped. Deallocating a free slot succeeds.
fn ioctl_deallocate_queue_ctx(
    dev: &AccelDevice,
    caller: Caller,
    name: &[u8; QUEUE_NAME_MAX],
) -> Result<()> {
    if !dev.check_ownership(caller) {
        aerror!(
            "ACCEL/Ioctl: device is owned by tgid {}; tgid {} can not modify.",
            dev.owner(),
            caller.id
        );
        return Err(AccelError::PermissionDenied);
    }

    let queue = queue::lookup_queue_ctx(dev, name)?;

    // Device-state lock first so the owner's tracker entry is updated
    // atomically with the teardown.
    let mut dstate = dev.state.lock();
    let mut state = queue.state.lock();

    if !state.allocated {
        return Ok(());
    }

    let mut result = Ok(());
    let queue_owner = state.owner;
    if queue_owner != NO_CLIENT {
        adebug!(
            "ACCEL/Ioctl: Disabling queue context {} ({}) during deallocation.",
            state.name_str(),
            queue.index
        );
        if let Err(err) = queue::disable_queue_ctx(dev, caller, queue, &mut state) {
            result = Err(err);
        }

        match dstate.clients.find_mut(queue_owner) {
            Some(entry) => entry.queue_remove(queue.index),
            None => {
                aerror!(
                    "ACCEL/Ioctl: Hash entry for TGID {} not found! Cannot remove queue!",
                    queue_owner
                );
                if result.is_ok() {
                    result = Err(AccelError::InvalidArgument);
                }
            }
        }
    }

    if let Err(err) = queue::deallocate_queue_ctx(dev, queue, &mut state) {
        if result.is_ok() {
            result = Err(err);
        }
    }

    result
}

/// Enable by name, reporting the slot index and granted chunks back.
///
/// When a delivery boundary exists (a user copy of the response), a failed
/// delivery must disable the just-enabled queue; with in-memory requests
/// delivery cannot fail, so no compensation path is needed here.
fn ioctl_enable_queue_ctx(
    dev: &AccelDevice,
    caller: Caller,
    config: &mut QueueCtxConfig,
) -> Result<()> {
    if dev.is_dead() {
        aerror!("ACCEL/Ioctl: The device has failed.");
        return Err(AccelError::Io);
    }

    queue::enable_queue_ctx(dev, caller, config)
}

/// Disable by name. Already-disabled queues are a logged no-op. The device
/// master may disable any queue; a queue owner only its own.
fn ioctl_disable_queue_ctx(
    dev: &AccelDevice,
    caller: Caller,
    name: &[u8; QUEUE_NAME_MAX],
) -> Result<()> {
    let queue = queue::lookup_queue_ctx(dev, name)?;

    let mut state = queue.state.lock();

    if state.owner == NO_CLIENT {
        ainfo!(
            "ACCEL/Ioctl: Queue {}/{} is already disabled!",
            state.name_str(),
            queue.index
        );
        return Ok(());
    }

    let (is_owned, device_owner) = {
        let ownership = dev.ownership.lock();
        (ownership.is_owned, ownership.owner)
    };

    if is_owned && device_owner != caller.id && state.owner != caller.id {
        aerror!(
            "ACCEL/Ioctl: Cannot disable queue: device is owned by TGID {} and queue {} \
             is owned by TGID {}",
            device_owner,
            state.name_str(),
            state.owner
        );
        return Err(AccelError::PermissionDenied);
    } else if !is_owned {
        aerror!(
            "ACCEL/Ioctl: Cannot disable an unowned queue (id {})",
            queue.index
        );
        return Err(AccelError::InvalidArgument);
    }

    let queue_owner = state.owner;
    let ret = queue::disable_queue_ctx(dev, caller, queue, &mut state);
    drop(state);

    {
        let mut dstate = dev.state.lock();
        match dstate.clients.find_mut(queue_owner) {
            Some(entry) => entry.queue_remove(queue.index),
            None => aerror!(
                "ACCEL/Ioctl: Hash entry for TGID {} not found! Cannot remove queue!",
                queue_owner
            ),
        }
    }

    adebug!(
        "ACCEL/Ioctl: tgid: {}: queue {} disabled (was owned by {})",
        caller.id,
        queue.index,
        queue_owner
    );
    ret.map(|_| ())
}

/// Subcontainer allocate: bitmap-based, and only from a subcontainer. The
/// claimed chunks are pre-checked against the shared ownership map so one
/// subcontainer cannot double-assign another's chunks.
fn ioctl_subcontainer_allocate_queue_ctx(
    dev: &AccelDevice,
    caller: Caller,
    config: &SubcontainerQueueCtxConfig,
) -> Result<()> {
    if !dev.is_subcontainer() {
        aerror!(
            "ACCEL/Ioctl: The subcontainer allocate request may only be called by \
             subcontainers!"
        );
        return Err(AccelError::PermissionDenied);
    }

    if config.num_chunks as usize != dev.desc.total_chunks {
        aerror!(
            "ACCEL/Ioctl: Chunk buffer wrong size: {} vs. {}",
            config.num_chunks,
            dev.desc.total_chunks
        );
        return Err(AccelError::Fault);
    }

    {
        let pool = dev.dram.lock();
        for chunk in 0..dev.desc.total_chunks {
            if queue::bitmap_bit_set(&config.chunk_bitmap, chunk)
                && pool.chunk_map[chunk] != crate::device::CHUNK_FREE
            {
                ainfo!(
                    "ACCEL/Ioctl: Requesting already-allocated chunk {}",
                    chunk
                );
                return Err(AccelError::NoMemory);
            }
        }
    }

    let alloc_config = QueueCtxAllocConfig {
        name: config.name,
        priority: config.priority,
        num_chunks: config.num_chunks,
        chunk_bitmap: Some(config.chunk_bitmap.clone()),
        index: config.index,
    };
    queue::allocate_queue_ctx(dev, caller, &alloc_config).map(|_| ())
}

/// Configure the hardware scheduling algorithm for one priority level.
fn ioctl_set_priority_algorithm(
    dev: &AccelDevice,
    caller: Caller,
    config: &PriorityAlgorithmConfig,
) -> Result<()> {
    adebug!("ACCEL/Ioctl: Recvd set-priority-algorithm request");

    let field = match &dev.desc.priority_algorithm_config {
        Some(field) => field,
        None => return Err(AccelError::NotSupported),
    };

    if !dev.check_ownership(caller) {
        aerror!(
            "ACCEL/Ioctl: device is owned by tgid {}; tgid {} can not modify.",
            dev.owner(),
            caller.id
        );
        return Err(AccelError::PermissionDenied);
    }

    if dev.is_dead() {
        aerror!("ACCEL/Ioctl: The device has failed.");
        return Err(AccelError::Io);
    }

    if config.priority < 0 || config.priority > 7 {
        aerror!(
            "ACCEL/Ioctl: invalid priority specified: {}",
            config.priority
        );
        return Err(AccelError::InvalidArgument);
    }

    if config.algorithm < PRIORITY_ALGORITHM_ROUND_ROBIN
        || config.algorithm > PRIORITY_ALGORITHM_WATERFALL
    {
        aerror!(
            "ACCEL/Ioctl: invalid algorithm specified: {}",
            config.algorithm
        );
        return Err(AccelError::InvalidArgument);
    }

    // One byte-wide lane per priority level.
    regs::read_modify_write(
        &*dev.io,
        dev.desc.firmware_register_bar,
        field.offset(0),
        config.algorithm as u64,
        8,
        (config.priority * 8) as u32,
    );

    Ok(())
}
