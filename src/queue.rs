//! Queue-context state machine.
//!
//! A queue context walks Free → Allocated → Enabled → Allocated → Free.
//! Allocation claims the slot and performs the DRAM chunk grant; enabling
//! records an owner process and arms the hardware; disabling cascades
//! through the queue's direct mappings and quiesces hardware; deallocation
//! returns the chunks and clears the slot. Disable and deallocate are
//! idempotent no-ops from lower states.
//!
//! The cleanup cascades at the bottom tie queue teardown to process exit:
//! a worker exit disables exactly the queues that worker enabled; the
//! master's exit tears down the whole container and forcibly terminates
//! every other tracked process, which can no longer safely use the device.

use alloc::vec::Vec;

use spin::Mutex;

use crate::device::{AccelDevice, DdrStatus, DeviceState};
use crate::error::{AccelError, Result};
use crate::framework::{Caller, ClientId, DeviceStatus, PageTable, NO_CLIENT};
use crate::mapping::DirectMapping;
use crate::{adebug, aerror, ainfo};
use crate::QUEUE_NAME_MAX;

use alloc::sync::Arc;

/// Seconds (pre-scaling) to wait for a queue to quiesce after a disable.
pub const QUEUE_CONTROL_DISABLE_TIMEOUT_SEC: u64 = 2;

/// Mutable per-queue state, guarded by the queue's context lock.
#[derive(Debug, Clone)]
pub struct QueueState {
    /// User-chosen name; unique only while allocated, zeroed otherwise.
    pub name: [u8; QUEUE_NAME_MAX],
    pub priority: i32,
    /// Driver's cached copy of the granted chunk count; the hardware
    /// ledger is authoritative.
    pub dram_chunks: u32,
    /// Enabling process, or `NO_CLIENT`.
    pub owner: ClientId,
    pub allocated: bool,
    /// In overseer mode: the subcontainer this queue is reserved to.
    /// Gates who may allocate it.
    pub reserved_by: Option<u32>,
}

impl QueueState {
    fn new() -> Self {
        QueueState {
            name: [0; QUEUE_NAME_MAX],
            priority: 0,
            dram_chunks: 0,
            owner: NO_CLIENT,
            allocated: false,
            reserved_by: None,
        }
    }

    pub fn name_str(&self) -> &str {
        let end = self.name.iter().position(|&c| c == 0).unwrap_or(QUEUE_NAME_MAX);
        core::str::from_utf8(&self.name[..end]).unwrap_or("<non-utf8>")
    }

    pub fn set_name(&mut self, name: &[u8; QUEUE_NAME_MAX]) {
        self.name = *name;
    }

    /// Back to unallocated defaults. Reservations survive: they belong to
    /// the overseer, not to the allocate/deallocate cycle.
    pub fn clear(&mut self) {
        self.name = [0; QUEUE_NAME_MAX];
        self.priority = 0;
        self.dram_chunks = 0;
        self.owner = NO_CLIENT;
        self.allocated = false;
    }
}

/// One hardware queue slot. Slots exist for the life of the device; only
/// the guarded state cycles.
pub struct QueueCtx {
    pub index: usize,
    /// Lock 3 in the crate locking order.
    pub state: Mutex<QueueState>,
    /// Lock 5: the queue's direct mappings, owned exclusively by this
    /// context.
    pub mappings: Mutex<Vec<DirectMapping>>,
    pub page_table: Arc<dyn PageTable>,
}

impl QueueCtx {
    pub(crate) fn new(index: usize, page_table: Arc<dyn PageTable>) -> Self {
        QueueCtx {
            index,
            state: Mutex::new(QueueState::new()),
            mappings: Mutex::new(Vec::new()),
            page_table,
        }
    }
}

/// Allocation parameters, from either the plain or the subcontainer
/// (bitmap-carrying) allocate request.
#[derive(Debug, Clone)]
pub struct QueueCtxAllocConfig {
    pub name: [u8; QUEUE_NAME_MAX],
    pub priority: i32,
    /// Desired chunk count for count-based allocation; for bitmap-based
    /// allocation this is the bitmap length in chunks.
    pub num_chunks: u32,
    /// Explicit chunk bitmap (bit per physical chunk); present only for
    /// subcontainer allocations.
    pub chunk_bitmap: Option<Vec<u8>>,
    /// Advisory slot index from the caller; the allocator picks its own.
    pub index: i32,
}

/// Enable request/response: resolves the name to a slot and reports the
/// granted chunk count back.
#[derive(Debug, Clone)]
pub struct QueueCtxConfig {
    pub name: [u8; QUEUE_NAME_MAX],
    pub priority: i32,
    pub dram_chunks: u32,
    pub index: i32,
}

/// Outcome of a disable: the dead-device path is a no-op that still
/// reports success, distinct from a real teardown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisableOutcome {
    Disabled,
    DeviceDead,
}

/// Pack a UTF-8 name into the fixed on-wire array (truncating, zero
/// padded).
pub fn queue_name(name: &str) -> [u8; QUEUE_NAME_MAX] {
    let mut out = [0u8; QUEUE_NAME_MAX];
    let bytes = name.as_bytes();
    let len = core::cmp::min(bytes.len(), QUEUE_NAME_MAX - 1);
    out[..len].copy_from_slice(&bytes[..len]);
    out
}

pub(crate) fn popcount_bytes(bitmap: &[u8]) -> u64 {
    bitmap.iter().map(|b| b.count_ones() as u64).sum()
}

pub(crate) fn bitmap_bit_set(bitmap: &[u8], index: usize) -> bool {
    let byte = index / 8;
    byte < bitmap.len() && bitmap[byte] & (1 << (index % 8)) != 0
}

/// Repack a byte bitmap into the 32-bit words the bitmap register block
/// takes, little-endian.
pub(crate) fn bitmap_words(bitmap: &[u8]) -> Vec<u32> {
    let mut words = Vec::with_capacity((bitmap.len() + 3) / 4);
    for chunk in bitmap.chunks(4) {
        let mut word = [0u8; 4];
        word[..chunk.len()].copy_from_slice(chunk);
        words.push(u32::from_le_bytes(word));
    }
    words
}

// =============================================================================
// State machine
// =============================================================================

/// Claim the first healthy, unallocated (and, in a subcontainer, reserved)
/// slot. The claim is made under the slot's lock before moving on.
pub fn find_free_queue_ctx(dev: &AccelDevice) -> Result<usize> {
    for queue in dev.queues.iter() {
        let mut state = queue.state.lock();

        let reserved_ok = match dev.clone_index {
            None => true,
            Some(clone_index) => state.reserved_by == Some(clone_index),
        };
        if !dev.variant.is_queue_ctx_failed(dev, queue, &state)
            && !state.allocated
            && reserved_ok
        {
            state.allocated = true;
            return Ok(queue.index);
        }
    }

    aerror!("ACCEL/Queue: No healthy & free queue contexts.");
    Err(AccelError::NoMemory)
}

/// Resolve a queue name to its slot.
pub fn lookup_queue_ctx<'a>(
    dev: &'a AccelDevice,
    name: &[u8; QUEUE_NAME_MAX],
) -> Result<&'a QueueCtx> {
    for queue in dev.queues.iter() {
        if queue.state.lock().name == *name {
            return Ok(queue);
        }
    }

    let end = name.iter().position(|&c| c == 0).unwrap_or(QUEUE_NAME_MAX);
    aerror!(
        "ACCEL/Queue: Queue context {} not found.",
        core::str::from_utf8(&name[..end]).unwrap_or("<non-utf8>")
    );
    Err(AccelError::NotFound)
}

/// Allocate a queue context: master-only, device must be alive. On success
/// the slot holds the name, priority and granted chunk count; on any
/// failure the claim is reverted.
pub fn allocate_queue_ctx(
    dev: &AccelDevice,
    caller: Caller,
    config: &QueueCtxAllocConfig,
) -> Result<usize> {
    if !dev.check_ownership(caller) {
        aerror!(
            "ACCEL/Queue: device is owned by tgid {}; tgid {} can not modify.",
            dev.owner(),
            caller.id
        );
        return Err(AccelError::PermissionDenied);
    }

    if dev.is_dead() {
        aerror!("ACCEL/Queue: The device has failed.");
        return Err(AccelError::Io);
    }

    let ctx_index = find_free_queue_ctx(dev)?;
    let queue = &dev.queues[ctx_index];
    let mut state = queue.state.lock();

    if config.priority < 0 || config.priority > 7 {
        aerror!("ACCEL/Queue: Priority must be in the range [0, 7].");
        state.allocated = false;
        return Err(AccelError::InvalidArgument);
    }

    let requested_chunks = match &config.chunk_bitmap {
        Some(bitmap) => popcount_bytes(bitmap),
        None => config.num_chunks as u64,
    };
    if requested_chunks > dev.desc.max_chunks_per_queue_ctx as u64 {
        aerror!(
            "ACCEL/Queue: Invalid DRAM chunks: {}. Valid range: [0-{}].",
            requested_chunks,
            dev.desc.max_chunks_per_queue_ctx
        );
        state.allocated = false;
        return Err(AccelError::InvalidArgument);
    }

    state.set_name(&config.name);
    state.priority = config.priority;
    state.dram_chunks = requested_chunks as u32;

    // The variant performs the hardware side: priority programming and the
    // chunk grant. The slot claim is all that needs reverting on failure;
    // hardware writes already issued are moot for an abandoned queue.
    match dev.variant.allocate_queue_ctx(dev, queue, &mut state, config) {
        Err(err) => {
            state.allocated = false;
            Err(err)
        }
        Ok(()) => {
            adebug!(
                "ACCEL/Queue: tgid: {}: Queue {} allocated.",
                caller.id,
                ctx_index
            );
            Ok(ctx_index)
        }
    }
}

/// Return a queue's chunks and clear the slot. Idempotent from the Free
/// state. Caller holds the context lock.
pub fn deallocate_queue_ctx(
    dev: &AccelDevice,
    queue: &QueueCtx,
    state: &mut QueueState,
) -> Result<()> {
    if dev.is_dead() {
        return Err(AccelError::Io);
    }

    let ret = dev.variant.deallocate_queue_ctx(dev, queue, state);

    queue.page_table.unmap_all();
    state.clear();
    adebug!("ACCEL/Queue: Deallocated queue context {}", queue.index);

    ret
}

/// Enable an allocated queue for the calling process: arm the hardware,
/// record the caller as owner and mark the queue in the caller's tracker
/// entry. Reports the slot index and granted chunks back through `config`.
pub fn enable_queue_ctx(
    dev: &AccelDevice,
    caller: Caller,
    config: &mut QueueCtxConfig,
) -> Result<()> {
    let queue = lookup_queue_ctx(dev, &config.name)?;

    // The tracker entry update and the owner handoff must be atomic with
    // respect to the release cascade, so both device-state and context
    // locks are held across the hardware enable.
    let mut dstate = dev.state.lock();
    let mut state = queue.state.lock();

    if !state.allocated {
        aerror!(
            "ACCEL/Queue: Queue {}/{} is not allocated!",
            queue.index,
            state.name_str()
        );
        return Err(AccelError::InvalidArgument);
    }

    if state.owner != NO_CLIENT {
        aerror!(
            "ACCEL/Queue: tgid {}: Queue {} is already enabled (owner: {})",
            caller.id,
            queue.index,
            state.owner
        );
        return Err(AccelError::Busy);
    }

    if dev.variant.is_queue_ctx_failed(dev, queue, &state) {
        aerror!(
            "ACCEL/Queue: Cannot enable queue {} - it has failed.",
            queue.index
        );
        return Err(AccelError::Io);
    }

    if let Err(err) = dev.variant.enable_queue_ctx(dev, queue, &mut state) {
        aerror!(
            "ACCEL/Queue: Error enabling queue context {}: {}",
            queue.index,
            err.as_str()
        );
        return Err(err);
    }

    // If the bookkeeping fails the queue stays enabled in hardware; the
    // request-delivery layer compensates when it cannot report success.
    match dstate.clients.find_mut(caller.id) {
        None => {
            aerror!(
                "ACCEL/Queue: Hash entry for TGID {} not found! Cannot add queue!",
                caller.id
            );
            return Err(AccelError::InvalidArgument);
        }
        Some(entry) => entry.queue_add(queue.index),
    }

    state.owner = caller.id;
    config.index = queue.index as i32;
    config.dram_chunks = state.dram_chunks;

    adebug!(
        "ACCEL/Queue: tgid: {}: Queue {} enabled.",
        caller.id,
        queue.index
    );
    Ok(())
}

/// Disable an enabled queue: tear down its direct mappings, quiesce the
/// hardware, unmap a non-master caller from the firmware window and clear
/// the owner. Every step runs even after a partial failure, but any
/// hardware-level failure marks the device dead. Caller holds the context
/// lock.
pub fn disable_queue_ctx(
    dev: &AccelDevice,
    caller: Caller,
    queue: &QueueCtx,
    state: &mut QueueState,
) -> Result<DisableOutcome> {
    if dev.is_dead() {
        return Ok(DisableOutcome::DeviceDead);
    }

    let mut mapping_failed = false;
    {
        let mut mappings = queue.mappings.lock();
        let drained: Vec<DirectMapping> = mappings.drain(..).collect();
        for mapping in drained {
            if crate::mapping::remove_direct_mapping(dev, caller, queue, mapping).is_err() {
                mapping_failed = true;
                dev.set_status(DeviceStatus::Dead);
            }
        }
    }
    if mapping_failed {
        // Partial hardware state is now unknown; fail stop.
        aerror!(
            "ACCEL/Queue: Error cleaning up direct mappings for queue context {}; \
             marking device as unhealthy.",
            queue.index
        );
        dev.set_status(DeviceStatus::Dead);
    }

    let result = match dev.variant.disable_queue_ctx(dev, queue, state) {
        Err(err) => {
            aerror!(
                "ACCEL/Queue: Error cleaning up queue context {}; marking as unhealthy.",
                queue.index
            );
            dev.set_status(DeviceStatus::Dead);
            Err(err)
        }
        Ok(command_window) => {
            // A worker that enabled this queue was mapped into its command
            // window; the master keeps its own mappings.
            if state.owner == caller.id
                && dev.owner() != caller.id
                && !caller.privileged
            {
                dev.platform.unmap_region(
                    caller.id,
                    dev.desc.firmware_register_bar,
                    &command_window,
                );
            }
            if mapping_failed {
                Err(AccelError::Io)
            } else {
                Ok(DisableOutcome::Disabled)
            }
        }
    };

    queue.page_table.unmap_all();
    state.owner = NO_CLIENT;

    result
}

// =============================================================================
// Cleanup cascades
// =============================================================================

/// Disable every queue a tracker entry has marked enabled, then clear its
/// bitmap.
fn disable_owned_queues(
    dev: &AccelDevice,
    caller: Caller,
    entry: &mut crate::clients::ClientEntry,
) {
    adebug!(
        "ACCEL/Queue: Disabling queues owned by TGID {}",
        entry.tgid
    );

    for index in 0..dev.desc.queue_ctx_count {
        if entry.queue_is_enabled(index) {
            adebug!("ACCEL/Queue: Disabling queue {}", index);
            let queue = &dev.queues[index];
            let mut state = queue.state.lock();
            let _ = disable_queue_ctx(dev, caller, queue, &mut state);
            drop(state);

            dev.platform.sleep_ms(1);
        }
    }

    entry.clear_queues();
}

/// Does this device node own queue `index` for cleanup purposes? A
/// top-level device owns everything; a subcontainer owns its reservations.
fn owns_queue(dev: &AccelDevice, state: &QueueState) -> bool {
    match dev.clone_index {
        None => true,
        Some(clone_index) => state.reserved_by == Some(clone_index),
    }
}

/// Last-reference cleanup for one client. Two shapes: the device master
/// closing (with no live subcontainers, or on a subcontainer itself) tears
/// down the whole container and kills every other tracked process; anyone
/// else just loses the queues they enabled.
///
/// Runs with the device state lock held.
pub(crate) fn cleanup_client(dev: &AccelDevice, dstate: &mut DeviceState, caller: Caller) {
    let has_clones = dev.subcontainer_count() > 0;

    if dev.owner() == caller.id && (!has_clones || dev.is_subcontainer()) {
        ainfo!(
            "ACCEL/Queue: Master process closing; cleaning up all queues and killing \
             all workers."
        );

        let tgids = dstate.clients.tgids();
        for tgid in &tgids {
            if let Some(entry) = dstate.clients.find_mut(*tgid) {
                disable_owned_queues(dev, caller, entry);
            }
        }
        for tgid in &tgids {
            if *tgid != caller.id {
                dev.platform.kill_client(*tgid);
            }
        }

        for queue in dev.queues.iter() {
            let mut state = queue.state.lock();
            if owns_queue(dev, &state) {
                let _ = deallocate_queue_ctx(dev, queue, &mut state);
                drop(state);
                dev.platform.sleep_ms(1);
            }
        }
    } else if let Some(entry) = dstate.clients.find_mut(caller.id) {
        disable_owned_queues(dev, caller, entry);
    }
}

/// Forcibly walk every slot down to Free. Used by reset and by overseer
/// teardown of a subcontainer.
pub fn disable_and_deallocate_all_queues(dev: &AccelDevice, caller: Caller) -> Result<()> {
    let mut failed = false;

    for queue in dev.queues.iter() {
        let mut state = queue.state.lock();
        if state.allocated {
            if state.owner != NO_CLIENT
                && disable_queue_ctx(dev, caller, queue, &mut state).is_err()
            {
                failed = true;
            }
            if deallocate_queue_ctx(dev, queue, &mut state).is_err() {
                failed = true;
            }
        }

        // A subcontainer's reserved queues may carry translations from
        // exited mappers even when unallocated.
        if dev.is_subcontainer() && state.reserved_by == dev.clone_index {
            queue.page_table.unmap_all();
            queue.page_table.garbage_collect();
        }
    }

    if failed {
        Err(AccelError::Io)
    } else {
        Ok(())
    }
}

// =============================================================================
// Firmware responses
// =============================================================================

/// Map the firmware's final DRAM status word to an outcome. A successful
/// status with a chunk count that disagrees with the request is a
/// fail-stop hardware error.
pub(crate) fn evaluate_dram_response(
    dev: &AccelDevice,
    queue: &QueueCtx,
    state: &QueueState,
) -> Result<()> {
    let desc = dev.desc;
    let status = dev.field_read(&desc.queue_ddr_status_value, queue.index);
    let alloced_chunks =
        dev.field_read(&desc.queue_ddr_status_current_chunks, queue.index) as u32;

    match DdrStatus::from_code(status) {
        Some(DdrStatus::Success) => {
            if alloced_chunks != state.dram_chunks {
                aerror!(
                    "ACCEL/Queue: HW/FW error: invalid chunks allocated. Requested {}, \
                     received {}.",
                    state.dram_chunks,
                    alloced_chunks
                );
                dev.set_status(DeviceStatus::Dead);
                Err(AccelError::Io)
            } else {
                Ok(())
            }
        }
        Some(DdrStatus::NotEnoughAvailable) => {
            aerror!("ACCEL/Queue: Insufficient DRAM chunks available.");
            Err(AccelError::NoMemory)
        }
        Some(DdrStatus::TooLarge) => {
            aerror!("ACCEL/Queue: Too many DRAM chunks requested.");
            Err(AccelError::InvalidArgument)
        }
        Some(DdrStatus::InProgress) => {
            aerror!("ACCEL/Queue: Another DDR reconfigure request was in progress.");
            Err(AccelError::Busy)
        }
        Some(DdrStatus::QueueNotDisabled) => {
            aerror!(
                "ACCEL/Queue: The target queue ctx ({}) is not disabled!",
                queue.index
            );
            Err(AccelError::Busy)
        }
        Some(DdrStatus::InvalidRequestType) => {
            aerror!("ACCEL/Queue: Invalid DDR config request type.");
            Err(AccelError::InvalidArgument)
        }
        Some(DdrStatus::ChunkAlreadyReserved) => {
            aerror!(
                "ACCEL/Queue: Memory allocation conflicted with an existing allocation."
            );
            Err(AccelError::NoMemory)
        }
        None => {
            aerror!("ACCEL/Queue: Invalid DDR config status: {}", status);
            Err(AccelError::Fault)
        }
    }
}

/// Disable the firmware queue context and zero its interrupt control and
/// status. The interrupt clearing runs even when the disable times out.
pub fn clear_firmware_queue_status(dev: &AccelDevice, queue_index: usize) -> Result<()> {
    let desc = dev.desc;
    let bar = desc.firmware_register_bar;

    dev.io
        .write_64(bar, desc.control_control.offset(queue_index), 0);

    let ret = match dev.wait_for_value(
        bar,
        desc.control_status_enabled.offset(queue_index),
        QUEUE_CONTROL_DISABLE_TIMEOUT_SEC,
        desc.control_status_enabled.mask,
        0,
    ) {
        Err(AccelError::Canceled) => Err(AccelError::Canceled),
        Err(AccelError::TimedOut) => {
            aerror!(
                "ACCEL/Queue: Queue {} did not become disabled within timeout",
                queue_index
            );
            Err(AccelError::TimedOut)
        }
        _ => Ok(()),
    };

    dev.io
        .write_64(bar, desc.interrupt_control_control.offset(queue_index), 0);
    dev.io
        .write_64(bar, desc.interrupt_control_status.offset(queue_index), 0);

    ret
}

// =============================================================================
// Common variant callbacks
// =============================================================================

/// Hardware-side allocation shared by register-programmed variants:
/// program the queue priority, run the chunk grant, and record bitmap
/// claims in the chunk ownership map.
pub fn common_allocate_queue_ctx(
    dev: &AccelDevice,
    queue: &QueueCtx,
    state: &mut QueueState,
    config: &QueueCtxAllocConfig,
) -> Result<()> {
    dev.field_write(
        &dev.desc.queue_control_priority_value,
        queue.index,
        config.priority as u64,
    );

    let words = config.chunk_bitmap.as_deref().map(bitmap_words);
    dev.configure_queue_ctx_dram(queue, state, words.as_deref())?;

    if let Some(bitmap) = &config.chunk_bitmap {
        let mut pool = dev.dram.lock();
        for chunk in 0..dev.desc.total_chunks {
            if bitmap_bit_set(bitmap, chunk) {
                pool.chunk_map[chunk] = queue.index as u8;
            }
        }
    }

    Ok(())
}

/// Hardware-side deallocation shared by register-programmed variants:
/// clear firmware queue status, release the queue's chunk-map claims and
/// hand the chunks back.
pub fn common_deallocate_queue_ctx(
    dev: &AccelDevice,
    queue: &QueueCtx,
    state: &mut QueueState,
) -> Result<()> {
    let _ = clear_firmware_queue_status(dev, queue.index);

    {
        let mut pool = dev.dram.lock();
        for chunk in pool.chunk_map.iter_mut() {
            if *chunk == queue.index as u8 {
                *chunk = crate::device::CHUNK_FREE;
            }
        }
    }

    if state.dram_chunks != 0 {
        state.dram_chunks = 0;
        dev.configure_queue_ctx_dram(queue, state, None)?;
    }

    Ok(())
}
