//! Device descriptor, variant callbacks and the per-device aggregate.
//!
//! An [`AccelDevice`] exists per physical device, and one more per
//! subcontainer clone while the parent is in overseer mode. Clones share the
//! parent's register path, queue array, DRAM pool and RID filter table; they
//! keep their own client table, ownership record and chunk ledgers.
//!
//! This module also owns the DRAM chunk handshake with firmware: issue a
//! count-based or bitmap-based reconfiguration request, poll for the
//! acknowledgement and completion with bounded (hardware-speed scaled)
//! timeouts, and reconcile the chunk-accounting ledger with the outcome.

use alloc::string::String;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicU8, AtomicUsize, Ordering};

use spin::Mutex;

use crate::clients::ClientTable;
use crate::error::{AccelError, Result};
use crate::framework::{
    BarIo, Caller, ClientId, DeviceStatus, MappableRegion, Ownership, PageTable, Platform,
};
use crate::queue::{QueueCtx, QueueCtxAllocConfig, QueueState};
use crate::regs::{read_field, write_field, RegisterField};
use crate::rid_filter::{self, RidFilterTable};
use crate::{aerror, ainfo, awarn};
use crate::{DRIVER_FIRMWARE_API_VERSION, MAX_QUEUE_CTXS, NUM_BARS};

/// Timeout scaling on real hardware.
pub const DEFAULT_TIMEOUT_SCALING: u64 = 1;

/// Timeout scaling on simulated/fake hardware, which runs orders of
/// magnitude slower than silicon.
pub const FAKE_HARDWARE_TIMEOUT_SCALING: u64 = 1000;

/// Seconds (pre-scaling) to wait for a DRAM request acknowledgement.
pub const DDR_CHUNK_ACK_TIMEOUT_SEC: u64 = 4;

/// Free-chunk sentinel in the chunk ownership map.
pub const CHUNK_FREE: u8 = 0xFF;

/// Execution mode of a top-level device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DeviceMode {
    Normal = 0,
    Overseer = 1,
}

/// Firmware status codes for a DRAM reconfiguration request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DdrStatus {
    Success = 0,
    NotEnoughAvailable = 1,
    TooLarge = 2,
    InProgress = 3,
    QueueNotDisabled = 4,
    InvalidRequestType = 5,
    ChunkAlreadyReserved = 6,
}

impl DdrStatus {
    pub fn from_code(code: u64) -> Option<Self> {
        match code {
            0 => Some(Self::Success),
            1 => Some(Self::NotEnoughAvailable),
            2 => Some(Self::TooLarge),
            3 => Some(Self::InProgress),
            4 => Some(Self::QueueNotDisabled),
            5 => Some(Self::InvalidRequestType),
            6 => Some(Self::ChunkAlreadyReserved),
            _ => None,
        }
    }
}

/// RID filter register block description. A zero `count` means the device
/// has no filter.
pub struct RidFilterDesc {
    pub count: usize,
    pub control: RegisterField,
    pub rid_address: RegisterField,
    pub rid_mask: RegisterField,
    pub read_valid: RegisterField,
    pub write_valid: RegisterField,
    pub base_addr: RegisterField,
    pub size: RegisterField,
    pub read_fault: RegisterField,
    pub write_fault: RegisterField,
    pub read_fault_address: RegisterField,
    pub write_fault_address: RegisterField,
    pub read_fault_rid: RegisterField,
    pub write_fault_rid: RegisterField,
    /// Absolute device address each BAR's offset 0 corresponds to; filter
    /// windows are programmed with absolute addresses.
    pub bar_base_addr: [u64; NUM_BARS],
}

/// Mappable-region description for the three logical BARs.
pub struct MappableDesc {
    /// Shared global-status window on the firmware BAR, visible to every
    /// opener.
    pub global_region: MappableRegion,
    /// Master-only window on the firmware BAR.
    pub master_region: MappableRegion,
    pub queue_start: fn(usize) -> u64,
    pub queue_length: fn(usize) -> u64,
    /// Whole-BAR DRAM regions exposed to privileged callers.
    pub dram_regions: &'static [MappableRegion],
    /// Debug BAR regions (owner/privileged only).
    pub debug_regions: &'static [MappableRegion],
}

/// Static description of one hardware variant: counts, BAR indices and the
/// location of every register field the core touches.
pub struct DeviceDesc {
    pub name: &'static str,
    pub queue_ctx_count: usize,
    /// Interrupt whose eventfd non-masters may never claim.
    pub failed_codec_interrupt: Option<usize>,
    pub overseer_supported: bool,
    pub direct_mapping_supported: bool,
    pub num_interrupts: usize,
    pub num_page_tables: usize,
    pub firmware_register_bar: usize,
    pub dram_bar: usize,
    pub debug_bar: usize,
    pub total_chunks: usize,
    pub max_chunks_per_queue_ctx: usize,

    pub firmware_api_version: RegisterField,
    pub is_fake_hardware: RegisterField,
    pub queue_ddr_status_value: RegisterField,
    pub queue_ddr_status_pending: RegisterField,
    pub queue_ddr_status_current_chunks: RegisterField,
    pub queue_ddr_control: RegisterField,
    /// Raw request-kind markers OR'd into the DRAM control register.
    pub bitmap_based_request: u64,
    pub count_based_request: u64,
    pub queue_ddr_control_change_requested: RegisterField,
    pub queue_control_priority_value: RegisterField,
    pub control_control: RegisterField,
    pub control_status_enabled: RegisterField,
    pub interrupt_control_control: RegisterField,
    pub interrupt_control_status: RegisterField,
    /// Packed per-priority algorithm lanes; absent on some variants.
    pub priority_algorithm_config: Option<RegisterField>,
    pub global_ddr_state_available_chunks: RegisterField,
    /// Base of the chunk-bitmap register block (32-bit words, ascending).
    pub dram_chunk_bitmap: RegisterField,

    pub rid_filter: RidFilterDesc,
    pub mappable: MappableDesc,
}

/// Per-hardware-variant callbacks. One implementation per variant (real
/// PCIe device, virtual/mailbox device); injected at device construction.
///
/// Callbacks run with the queue's context lock held and receive the guarded
/// state directly, so they must not take that lock again.
pub trait VariantOps: Send + Sync {
    /// Has this queue's hardware failed (e.g. a dead codec)?
    fn is_queue_ctx_failed(&self, dev: &AccelDevice, queue: &QueueCtx, state: &QueueState)
        -> bool;

    /// Perform the hardware side of queue allocation (priority programming
    /// and the DRAM chunk grant).
    fn allocate_queue_ctx(
        &self,
        dev: &AccelDevice,
        queue: &QueueCtx,
        state: &mut QueueState,
        config: &QueueCtxAllocConfig,
    ) -> Result<()>;

    /// Arm the queue in hardware (queue control, interrupt lines).
    fn enable_queue_ctx(
        &self,
        dev: &AccelDevice,
        queue: &QueueCtx,
        state: &mut QueueState,
    ) -> Result<()>;

    /// Quiesce the queue in hardware. Returns the firmware-BAR command
    /// window that must be unmapped from a non-master caller.
    fn disable_queue_ctx(
        &self,
        dev: &AccelDevice,
        queue: &QueueCtx,
        state: &mut QueueState,
    ) -> Result<MappableRegion>;

    /// Release the queue's chunks back to the ledger and clear firmware
    /// queue status.
    fn deallocate_queue_ctx(
        &self,
        dev: &AccelDevice,
        queue: &QueueCtx,
        state: &mut QueueState,
    ) -> Result<()>;

    /// Obtain the BAR mmap offset for a validated direct mapping.
    fn allocate_direct_mapping(
        &self,
        dev: &AccelDevice,
        queue: &QueueCtx,
        state: &QueueState,
        mapping: &mut crate::mapping::DirectMapping,
    ) -> Result<()>;

    /// Tear down the device-specific side of a direct mapping.
    fn deallocate_direct_mapping(
        &self,
        dev: &AccelDevice,
        queue: &QueueCtx,
        mapping: &crate::mapping::DirectMapping,
    ) -> Result<()>;
}

/// Chunk ownership map, byte per chunk (owning queue index or
/// [`CHUNK_FREE`]). Shared between a parent device and all of its clones;
/// its mutex also serializes the whole DRAM reconfiguration sequence for
/// the container family.
pub struct DramPool {
    pub chunk_map: Vec<u8>,
}

/// State guarded by the device-data lock.
pub struct DeviceState {
    pub mode: DeviceMode,
    pub clients: ClientTable,
}

/// One accelerator device node: a physical device or a subcontainer clone.
pub struct AccelDevice {
    pub desc: &'static DeviceDesc,
    name: String,
    pub(crate) variant: Arc<dyn VariantOps>,
    pub(crate) io: Arc<dyn BarIo>,
    pub(crate) platform: Arc<dyn Platform>,
    status: AtomicU8,
    pub(crate) ownership: Mutex<Ownership>,
    /// Lock 2: client table and mode.
    pub(crate) state: Mutex<DeviceState>,
    /// Lock 4: chunk map + DRAM handshake serialization (parent's instance
    /// for clones).
    pub(crate) dram: Arc<Mutex<DramPool>>,
    /// Lock 6: RID filter assignments (parent's instance for clones).
    pub(crate) rid_filter: Arc<Mutex<Option<RidFilterTable>>>,
    /// Fixed queue-context array, shared with clones.
    pub(crate) queues: Arc<Vec<QueueCtx>>,
    /// Lock 1: subcontainer clone set.
    pub(crate) subcontainers: Mutex<Vec<Arc<AccelDevice>>>,
    clone_count: AtomicUsize,
    pub(crate) parent: Option<Weak<AccelDevice>>,
    pub(crate) clone_index: Option<u32>,
    /// Chunks assigned to this container's pool. Mutated under the device
    /// state lock, read anywhere.
    pub(crate) reserved_chunks: AtomicI64,
    /// Chunks granted to queues out of the reserved pool. Mutated under
    /// the DRAM pool lock, read anywhere.
    pub(crate) allocated_chunks: AtomicI64,
    timeout_scaling: AtomicU64,
    is_real_hardware: AtomicBool,
}

impl AccelDevice {
    /// Build a top-level device. `page_tables` supplies one page-table
    /// handle per queue context.
    pub fn new(
        desc: &'static DeviceDesc,
        name: &str,
        variant: Arc<dyn VariantOps>,
        io: Arc<dyn BarIo>,
        platform: Arc<dyn Platform>,
        page_tables: Vec<Arc<dyn PageTable>>,
    ) -> Result<Arc<AccelDevice>> {
        if desc.queue_ctx_count == 0 || desc.queue_ctx_count > MAX_QUEUE_CTXS {
            aerror!(
                "ACCEL/Device: Descriptor queue count {} out of range [1, {}]",
                desc.queue_ctx_count,
                MAX_QUEUE_CTXS
            );
            return Err(AccelError::InvalidArgument);
        }
        if page_tables.len() != desc.queue_ctx_count {
            aerror!(
                "ACCEL/Device: Expected {} page tables, got {}",
                desc.queue_ctx_count,
                page_tables.len()
            );
            return Err(AccelError::InvalidArgument);
        }

        let queues: Vec<QueueCtx> = page_tables
            .into_iter()
            .enumerate()
            .map(|(index, page_table)| QueueCtx::new(index, page_table))
            .collect();

        Ok(Arc::new(AccelDevice {
            desc,
            name: String::from(name),
            variant,
            io,
            platform,
            status: AtomicU8::new(DeviceStatus::Alive as u8),
            ownership: Mutex::new(Ownership::default()),
            state: Mutex::new(DeviceState {
                mode: DeviceMode::Normal,
                clients: ClientTable::new(),
            }),
            dram: Arc::new(Mutex::new(DramPool {
                chunk_map: alloc::vec![CHUNK_FREE; desc.total_chunks],
            })),
            rid_filter: Arc::new(Mutex::new(None)),
            queues: Arc::new(queues),
            subcontainers: Mutex::new(Vec::new()),
            clone_count: AtomicUsize::new(0),
            parent: None,
            clone_index: None,
            reserved_chunks: AtomicI64::new(desc.total_chunks as i64),
            allocated_chunks: AtomicI64::new(0),
            timeout_scaling: AtomicU64::new(DEFAULT_TIMEOUT_SCALING),
            is_real_hardware: AtomicBool::new(true),
        }))
    }

    /// Build one subcontainer clone. The clone shares the parent's register
    /// path, queue array, chunk map and RID filter table; its own pool
    /// starts empty until the overseer reserves resources into it.
    pub(crate) fn new_subcontainer(parent: &Arc<AccelDevice>, index: u32) -> Arc<AccelDevice> {
        let name = alloc::format!("{}.sub{}", parent.name, index);

        Arc::new(AccelDevice {
            desc: parent.desc,
            name,
            variant: parent.variant.clone(),
            io: parent.io.clone(),
            platform: parent.platform.clone(),
            status: AtomicU8::new(DeviceStatus::Alive as u8),
            ownership: Mutex::new(Ownership::default()),
            state: Mutex::new(DeviceState {
                mode: DeviceMode::Normal,
                clients: ClientTable::new(),
            }),
            dram: parent.dram.clone(),
            rid_filter: parent.rid_filter.clone(),
            queues: parent.queues.clone(),
            subcontainers: Mutex::new(Vec::new()),
            clone_count: AtomicUsize::new(0),
            parent: Some(Arc::downgrade(parent)),
            clone_index: Some(index),
            reserved_chunks: AtomicI64::new(0),
            allocated_chunks: AtomicI64::new(0),
            timeout_scaling: AtomicU64::new(parent.timeout_scaling.load(Ordering::Relaxed)),
            is_real_hardware: AtomicBool::new(parent.is_real_hardware.load(Ordering::Relaxed)),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_subcontainer(&self) -> bool {
        self.parent.is_some()
    }

    pub fn status(&self) -> DeviceStatus {
        DeviceStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    pub fn set_status(&self, status: DeviceStatus) {
        self.status.store(status as u8, Ordering::Release);
    }

    pub fn is_dead(&self) -> bool {
        self.status() == DeviceStatus::Dead
    }

    /// Begin driver teardown: in-flight handshake polls abort with a
    /// cancellation error.
    pub fn set_driver_exit(&self) {
        self.set_status(DeviceStatus::DriverExit);
    }

    pub fn timeout_scaling(&self) -> u64 {
        self.timeout_scaling.load(Ordering::Relaxed)
    }

    pub fn set_timeout_scaling(&self, scaling: u64) {
        self.timeout_scaling.store(scaling, Ordering::Relaxed);
    }

    pub fn is_real_hardware(&self) -> bool {
        self.is_real_hardware.load(Ordering::Relaxed)
    }

    /// Number of live subcontainer clones. Lock-free so the release
    /// cascade can consult it under the device state lock.
    pub fn subcontainer_count(&self) -> usize {
        self.clone_count.load(Ordering::Acquire)
    }

    pub(crate) fn set_subcontainer_count(&self, count: usize) {
        self.clone_count.store(count, Ordering::Release);
    }

    /// Is `caller` the registered master of this device node?
    pub fn check_ownership(&self, caller: Caller) -> bool {
        let ownership = self.ownership.lock();
        ownership.is_owned && ownership.owner == caller.id
    }

    pub fn owner(&self) -> ClientId {
        self.ownership.lock().owner
    }

    pub fn mode(&self) -> DeviceMode {
        self.state.lock().mode
    }

    pub fn queue(&self, index: usize) -> &QueueCtx {
        &self.queues[index]
    }

    pub fn queue_count(&self) -> usize {
        self.desc.queue_ctx_count
    }

    /// One subcontainer clone, while in overseer mode.
    pub fn subcontainer(&self, index: usize) -> Option<Arc<AccelDevice>> {
        self.subcontainers.lock().get(index).cloned()
    }

    /// Chunks currently assigned to this container's pool.
    pub fn reserved_chunk_count(&self) -> i64 {
        self.reserved_chunks.load(Ordering::Relaxed)
    }

    /// Chunks currently granted to queues out of the reserved pool.
    pub fn allocated_chunk_count(&self) -> i64 {
        self.allocated_chunks.load(Ordering::Relaxed)
    }

    // =========================================================================
    // Register access
    // =========================================================================

    pub fn field_read(&self, field: &RegisterField, index: usize) -> u64 {
        read_field(&*self.io, self.desc.firmware_register_bar, field, index)
    }

    pub fn field_write(&self, field: &RegisterField, index: usize, value: u64) {
        write_field(
            &*self.io,
            self.desc.firmware_register_bar,
            field,
            index,
            value,
        );
    }

    /// Poll `bar`/`offset` until `(value & mask) == expected`, sleeping 1ms
    /// between samples. The timeout is in (pre-scaling) seconds. Aborts
    /// with `Canceled` if driver teardown begins while polling.
    pub fn wait_for_value(
        &self,
        bar: usize,
        offset: u64,
        timeout_sec: u64,
        mask: u64,
        expected: u64,
    ) -> Result<()> {
        let deadline =
            self.platform.monotonic_ms() + timeout_sec * self.timeout_scaling() * 1000;

        loop {
            if self.status() == DeviceStatus::DriverExit {
                awarn!("ACCEL/Device: Aborting FW handshake due to driver exit.");
                return Err(AccelError::Canceled);
            }

            let value = self.io.read_64(bar, offset);
            if value & mask == expected {
                return Ok(());
            }

            if self.platform.monotonic_ms() >= deadline {
                break;
            }
            self.platform.sleep_ms(1);
        }

        // One final sample after the deadline; losing the race to a slow
        // scheduler is not a hardware failure.
        let value = self.io.read_64(bar, offset);
        if value & mask == expected {
            return Ok(());
        }

        Err(AccelError::TimedOut)
    }

    // =========================================================================
    // Lifecycle hooks
    // =========================================================================

    /// Framework enable hook: verify the firmware API version, set up the
    /// RID filter and calibrate timeouts against real vs. fake hardware.
    pub fn enable_dev(&self) -> Result<()> {
        let fw_api_version = self.field_read(&self.desc.firmware_api_version, 0);
        if fw_api_version != DRIVER_FIRMWARE_API_VERSION {
            aerror!(
                "ACCEL/Device: Firmware API version mismatch! Driver: {}, firmware: {}",
                DRIVER_FIRMWARE_API_VERSION,
                fw_api_version
            );
            return Err(AccelError::InvalidArgument);
        }

        if self.desc.rid_filter.count > 0 {
            rid_filter::setup(self)?;
        }

        let is_real = self.field_read(&self.desc.is_fake_hardware, 0) == 0;
        self.is_real_hardware.store(is_real, Ordering::Relaxed);
        self.timeout_scaling.store(
            if is_real {
                DEFAULT_TIMEOUT_SCALING
            } else {
                FAKE_HARDWARE_TIMEOUT_SCALING
            },
            Ordering::Relaxed,
        );

        ainfo!(
            "ACCEL/Device: {} enabled ({} hardware, {} queues, {} chunks)",
            self.name,
            if is_real { "real" } else { "fake" },
            self.desc.queue_ctx_count,
            self.desc.total_chunks
        );
        Ok(())
    }

    /// Framework disable hook.
    pub fn disable_dev(&self) -> Result<()> {
        rid_filter::disable_and_clear(self)
    }

    /// Framework open hook: register the caller in the open-count table and
    /// take device ownership on the first write open.
    pub fn open(&self, caller: Caller, writable: bool) {
        {
            let mut dstate = self.state.lock();
            dstate.clients.get_or_create(caller.id);
        }

        if writable {
            let mut ownership = self.ownership.lock();
            if ownership.write_open_count == 0 {
                ownership.is_owned = true;
                ownership.owner = caller.id;
            }
            ownership.write_open_count += 1;
        }
    }

    /// Framework release hook: drop the caller's reference; the last one
    /// triggers the cleanup cascade.
    pub fn release(self: &Arc<Self>, caller: Caller, writable: bool) -> Result<()> {
        let ret = {
            let mut dstate = self.state.lock();
            match dstate.clients.put(caller.id) {
                crate::clients::PutResult::NotFound => {
                    ainfo!(
                        "ACCEL/Device: TGID/file entry not found for {}",
                        caller.id
                    );
                    Err(AccelError::InvalidArgument)
                }
                crate::clients::PutResult::StillOpen => Ok(()),
                crate::clients::PutResult::LastReference => {
                    crate::queue::cleanup_client(self, &mut dstate, caller);
                    dstate.clients.remove(caller.id);
                    Ok(())
                }
            }
        };

        if writable {
            let mut ownership = self.ownership.lock();
            ownership.write_open_count = ownership.write_open_count.saturating_sub(1);
            if ownership.write_open_count == 0 {
                ownership.is_owned = false;
                ownership.owner = crate::framework::NO_CLIENT;
            }
        }

        ret
    }

    /// Device reset: tear down every queue, return the chunk pool to its
    /// initial state and bring the device back alive.
    pub fn reset(self: &Arc<Self>, caller: Caller) -> Result<()> {
        ainfo!("ACCEL/Device: {} resetting", self.name);

        // Revive first so the teardown sweep is not short-circuited by a
        // dead status; a reset is exactly the recovery path for that.
        self.set_status(DeviceStatus::Alive);
        let sweep = crate::queue::disable_and_deallocate_all_queues(self, caller);

        for queue in self.queues.iter() {
            let mut state = queue.state.lock();
            state.clear();
        }
        {
            let mut pool = self.dram.lock();
            for chunk in pool.chunk_map.iter_mut() {
                *chunk = CHUNK_FREE;
            }
        }
        self.allocated_chunks.store(0, Ordering::Relaxed);

        sweep
    }

    // =========================================================================
    // DRAM chunk handshake
    // =========================================================================

    /// Issue a DRAM reconfiguration request for one queue and reconcile the
    /// ledger with the outcome. `bitmap` selects bitmap-based allocation;
    /// otherwise the request is count-based for `state.dram_chunks`.
    ///
    /// The whole sequence holds the container family's DRAM pool lock: the
    /// hardware carries one in-flight configuration per queue and the
    /// available-chunks counter is shared.
    pub fn configure_queue_ctx_dram(
        &self,
        queue: &QueueCtx,
        state: &mut QueueState,
        bitmap: Option<&[u32]>,
    ) -> Result<()> {
        let desc = self.desc;
        let pool = self.dram.clone();
        let _pool_guard = pool.lock();

        let pending = self.field_read(&desc.queue_ddr_status_pending, queue.index);
        let status = self.field_read(&desc.queue_ddr_status_value, queue.index);
        if pending != 0 || status == DdrStatus::InProgress as u64 {
            if self.status() != DeviceStatus::DriverExit {
                aerror!(
                    "ACCEL/Device: Pending DDR config in progress. This should not be \
                     possible! Marking device unhealthy."
                );
                self.set_status(DeviceStatus::Dead);
                return Err(AccelError::Io);
            }
            // A pending reconfiguration during forced exit is expected.
            return Err(AccelError::Busy);
        }

        let original_chunks =
            self.field_read(&desc.queue_ddr_status_current_chunks, queue.index) as i64;

        let chunk_delta = match bitmap {
            None => self.dram_request_send_count_based(queue, state, original_chunks)?,
            Some(words) => {
                self.dram_request_send_bitmap_based(queue, original_chunks, words)?
            }
        };

        self.get_dram_configuration_response(queue.index)?;

        let ret = crate::queue::evaluate_dram_response(self, queue, state);
        if ret.is_ok() || ret == Err(AccelError::Io) {
            self.allocated_chunks.fetch_add(chunk_delta, Ordering::Relaxed);
        }
        ret
    }

    /// Send a count-based request: the new desired total, bounded by the
    /// device-wide available-chunks counter. Returns the chunk delta.
    fn dram_request_send_count_based(
        &self,
        queue: &QueueCtx,
        state: &QueueState,
        original_chunks: i64,
    ) -> Result<i64> {
        let desc = self.desc;

        let available_chunks =
            self.field_read(&desc.global_ddr_state_available_chunks, 0) as i64;
        let chunk_delta = state.dram_chunks as i64 - original_chunks;
        if available_chunks < chunk_delta {
            aerror!(
                "ACCEL/Device: Requesting more DDR chunks than available on the device!"
            );
            return Err(AccelError::NoMemory);
        }

        let value = desc.count_based_request | state.dram_chunks as u64;
        self.io.write_64(
            desc.firmware_register_bar,
            desc.queue_ddr_control.offset(queue.index),
            value,
        );

        Ok(chunk_delta)
    }

    /// Send a bitmap-based request: write the chunk bitmap words, bound the
    /// delta by this container's reservation, then write the request
    /// marker. Returns the chunk delta.
    fn dram_request_send_bitmap_based(
        &self,
        queue: &QueueCtx,
        original_chunks: i64,
        words: &[u32],
    ) -> Result<i64> {
        let desc = self.desc;
        let bitmap_base = desc.dram_chunk_bitmap.offset(0);

        let mut chunk_delta = -original_chunks;
        for (i, word) in words.iter().enumerate() {
            self.io.write_32(
                desc.firmware_register_bar,
                bitmap_base + (i as u64) * 4,
                *word,
            );
            chunk_delta += word.count_ones() as i64;
        }

        if self.reserved_chunks.load(Ordering::Relaxed)
            < self.allocated_chunks.load(Ordering::Relaxed) + chunk_delta
        {
            aerror!("ACCEL/Device: Requesting more DDR chunks than reserved!");
            return Err(AccelError::NoMemory);
        }

        self.io.write_64(
            desc.firmware_register_bar,
            desc.queue_ddr_control.offset(queue.index),
            desc.bitmap_based_request,
        );

        Ok(chunk_delta)
    }

    /// Wait for the firmware to acknowledge and complete a DRAM request.
    /// A timeout means hardware and software disagree about in-flight
    /// state: the device is marked dead.
    fn get_dram_configuration_response(&self, queue_index: usize) -> Result<()> {
        let desc = self.desc;

        let ack = self.wait_for_value(
            desc.firmware_register_bar,
            desc.queue_ddr_control_change_requested.offset(queue_index),
            DDR_CHUNK_ACK_TIMEOUT_SEC,
            desc.queue_ddr_control_change_requested.mask,
            0,
        );
        match ack {
            Err(AccelError::Canceled) => return Err(AccelError::Canceled),
            Err(AccelError::TimedOut) => {
                aerror!(
                    "ACCEL/Device: HW/FW error: DDR config request not acked! Marking \
                     device unhealthy."
                );
                self.set_status(DeviceStatus::Dead);
                return Err(AccelError::Io);
            }
            _ => {}
        }

        let done = self.wait_for_value(
            desc.firmware_register_bar,
            desc.queue_ddr_status_pending.offset(queue_index),
            desc.max_chunks_per_queue_ctx as u64 * DDR_CHUNK_ACK_TIMEOUT_SEC,
            desc.queue_ddr_status_pending.mask,
            0,
        );
        match done {
            Err(AccelError::Canceled) => Err(AccelError::Canceled),
            Err(AccelError::TimedOut) => {
                aerror!(
                    "ACCEL/Device: HW/FW error: DDR config timed out! Marking device \
                     unhealthy."
                );
                self.set_status(DeviceStatus::Dead);
                Err(AccelError::Io)
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ddr_status_codes() {
        assert_eq!(DdrStatus::from_code(0), Some(DdrStatus::Success));
        assert_eq!(DdrStatus::from_code(3), Some(DdrStatus::InProgress));
        assert_eq!(DdrStatus::from_code(6), Some(DdrStatus::ChunkAlreadyReserved));
        assert_eq!(DdrStatus::from_code(7), None);
    }

    #[test]
    fn test_device_mode_values() {
        assert_eq!(DeviceMode::Normal as u8, 0);
        assert_eq!(DeviceMode::Overseer as u8, 1);
    }

}
