//! Simulated accelerator hardware.
//!
//! A register-level model of the virtual device variant: a backing register
//! file behind [`BarIo`] plus a tiny firmware model that acknowledges queue
//! control and DRAM reconfiguration requests synchronously. The same model
//! backs the fake-hardware flavor reported through the is-fake register,
//! and doubles as the hardware mock for this crate's tests.
//!
//! Knobs: stall DRAM requests (handshake-timeout paths), force a DRAM
//! status code (response-evaluation paths), and mark queues failed.

use alloc::collections::{BTreeMap, BTreeSet};
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};

use spin::Mutex;

use crate::device::{
    AccelDevice, DdrStatus, DeviceDesc, MappableDesc, RidFilterDesc, VariantOps,
};
use crate::error::Result;
use crate::framework::{
    region_flags, BarIo, Caller, ClientId, MappableRegion, PageTable, Platform,
};
use crate::mapping::{self, DirectMapping};
use crate::queue::{self, QueueCtx, QueueCtxAllocConfig, QueueState};
use crate::regs::RegisterField;
use crate::QUEUE_NAME_MAX;

pub const SIM_FIRMWARE_BAR: usize = 0;
pub const SIM_DRAM_BAR: usize = 2;
pub const SIM_DEBUG_BAR: usize = 4;

pub const SIM_QUEUE_CTXS: usize = 8;
pub const SIM_TOTAL_CHUNKS: usize = 512;
pub const SIM_MAX_CHUNKS_PER_QUEUE: usize = 128;
pub const SIM_RID_FILTERS: usize = 16;
pub const SIM_NUM_INTERRUPTS: usize = 12;

// Firmware BAR layout.
const REG_FW_API_VERSION: u64 = 0x0000;
const REG_IS_FAKE_HARDWARE: u64 = 0x0008;
const REG_AVAILABLE_CHUNKS: u64 = 0x0010;
const REG_PRIORITY_ALGORITHM: u64 = 0x0018;

const REG_RID_CONTROL: u64 = 0x0100;
const REG_RID_READ_FAULT: u64 = 0x0110;
const REG_RID_WRITE_FAULT: u64 = 0x0118;
const REG_RID_READ_FAULT_ADDR: u64 = 0x0120;
const REG_RID_WRITE_FAULT_ADDR: u64 = 0x0128;
const REG_RID_READ_FAULT_RID: u64 = 0x0130;
const REG_RID_WRITE_FAULT_RID: u64 = 0x0138;

const QUEUE_BLOCK: u64 = 0x1000;
const QUEUE_STRIDE: u64 = 0x100;
const QREG_CONTROL: u64 = 0x00;
const QREG_CONTROL_STATUS: u64 = 0x08;
const QREG_PRIORITY: u64 = 0x10;
const QREG_DDR_CONTROL: u64 = 0x18;
const QREG_DDR_CHANGE_REQUESTED: u64 = 0x20;
const QREG_DDR_STATUS_VALUE: u64 = 0x28;
const QREG_DDR_STATUS_PENDING: u64 = 0x30;
const QREG_DDR_STATUS_CHUNKS: u64 = 0x38;
const QREG_INTERRUPT_CONTROL: u64 = 0x40;
const QREG_INTERRUPT_STATUS: u64 = 0x48;

const BITMAP_BLOCK: u64 = 0x8000;

const RID_WINDOW_BLOCK: u64 = 0x9000;
const RID_WINDOW_STRIDE: u64 = 0x40;

/// DRAM request-kind markers in the queue DDR control register.
pub const SIM_COUNT_BASED_REQUEST: u64 = 1 << 62;
pub const SIM_BITMAP_BASED_REQUEST: u64 = 1 << 63;

fn q_control(index: usize) -> u64 {
    QUEUE_BLOCK + index as u64 * QUEUE_STRIDE + QREG_CONTROL
}
fn q_control_status(index: usize) -> u64 {
    QUEUE_BLOCK + index as u64 * QUEUE_STRIDE + QREG_CONTROL_STATUS
}
fn q_priority(index: usize) -> u64 {
    QUEUE_BLOCK + index as u64 * QUEUE_STRIDE + QREG_PRIORITY
}
fn q_ddr_control(index: usize) -> u64 {
    QUEUE_BLOCK + index as u64 * QUEUE_STRIDE + QREG_DDR_CONTROL
}
fn q_ddr_change_requested(index: usize) -> u64 {
    QUEUE_BLOCK + index as u64 * QUEUE_STRIDE + QREG_DDR_CHANGE_REQUESTED
}
fn q_ddr_status_value(index: usize) -> u64 {
    QUEUE_BLOCK + index as u64 * QUEUE_STRIDE + QREG_DDR_STATUS_VALUE
}
fn q_ddr_status_pending(index: usize) -> u64 {
    QUEUE_BLOCK + index as u64 * QUEUE_STRIDE + QREG_DDR_STATUS_PENDING
}
fn q_ddr_status_chunks(index: usize) -> u64 {
    QUEUE_BLOCK + index as u64 * QUEUE_STRIDE + QREG_DDR_STATUS_CHUNKS
}
fn q_interrupt_control(index: usize) -> u64 {
    QUEUE_BLOCK + index as u64 * QUEUE_STRIDE + QREG_INTERRUPT_CONTROL
}
fn q_interrupt_status(index: usize) -> u64 {
    QUEUE_BLOCK + index as u64 * QUEUE_STRIDE + QREG_INTERRUPT_STATUS
}

fn rid_address(index: usize) -> u64 {
    RID_WINDOW_BLOCK + index as u64 * RID_WINDOW_STRIDE
}
fn rid_mask(index: usize) -> u64 {
    RID_WINDOW_BLOCK + index as u64 * RID_WINDOW_STRIDE + 0x08
}
fn rid_read_valid(index: usize) -> u64 {
    RID_WINDOW_BLOCK + index as u64 * RID_WINDOW_STRIDE + 0x10
}
fn rid_write_valid(index: usize) -> u64 {
    RID_WINDOW_BLOCK + index as u64 * RID_WINDOW_STRIDE + 0x18
}
fn rid_base_addr(index: usize) -> u64 {
    RID_WINDOW_BLOCK + index as u64 * RID_WINDOW_STRIDE + 0x20
}
fn rid_size(index: usize) -> u64 {
    RID_WINDOW_BLOCK + index as u64 * RID_WINDOW_STRIDE + 0x28
}

fn queue_command_start(index: usize) -> u64 {
    0x10000 + index as u64 * 0x1000
}
fn queue_command_length(_index: usize) -> u64 {
    0x1000
}

static SIM_DRAM_REGIONS: [MappableRegion; 1] = [MappableRegion {
    start: 0,
    length_bytes: SIM_TOTAL_CHUNKS as u64 * crate::DRAM_CHUNK_BYTES,
    flags: region_flags::READ | region_flags::WRITE,
}];

static SIM_DEBUG_REGIONS: [MappableRegion; 1] = [MappableRegion {
    start: 0,
    length_bytes: 0x10000,
    flags: region_flags::READ | region_flags::WRITE,
}];

/// Descriptor for the simulated variant.
pub static SIM_DESC: DeviceDesc = DeviceDesc {
    name: "sim",
    queue_ctx_count: SIM_QUEUE_CTXS,
    failed_codec_interrupt: Some(8),
    overseer_supported: true,
    direct_mapping_supported: true,
    num_interrupts: SIM_NUM_INTERRUPTS,
    num_page_tables: SIM_QUEUE_CTXS,
    firmware_register_bar: SIM_FIRMWARE_BAR,
    dram_bar: SIM_DRAM_BAR,
    debug_bar: SIM_DEBUG_BAR,
    total_chunks: SIM_TOTAL_CHUNKS,
    max_chunks_per_queue_ctx: SIM_MAX_CHUNKS_PER_QUEUE,

    firmware_api_version: RegisterField::fixed(REG_FW_API_VERSION, 0, 0),
    is_fake_hardware: RegisterField::fixed(REG_IS_FAKE_HARDWARE, 0, 0),
    queue_ddr_status_value: RegisterField::per_index(q_ddr_status_value, 0, 0xFF),
    queue_ddr_status_pending: RegisterField::per_index(q_ddr_status_pending, 0, 0x1),
    queue_ddr_status_current_chunks: RegisterField::per_index(
        q_ddr_status_chunks,
        0,
        0xFFFF_FFFF,
    ),
    queue_ddr_control: RegisterField::per_index(q_ddr_control, 0, 0),
    bitmap_based_request: SIM_BITMAP_BASED_REQUEST,
    count_based_request: SIM_COUNT_BASED_REQUEST,
    queue_ddr_control_change_requested: RegisterField::per_index(
        q_ddr_change_requested,
        0,
        0x1,
    ),
    queue_control_priority_value: RegisterField::per_index(q_priority, 0, 0x7),
    control_control: RegisterField::per_index(q_control, 0, 0),
    control_status_enabled: RegisterField::per_index(q_control_status, 0, 0x1),
    interrupt_control_control: RegisterField::per_index(q_interrupt_control, 0, 0),
    interrupt_control_status: RegisterField::per_index(q_interrupt_status, 0, 0),
    priority_algorithm_config: Some(RegisterField::fixed(REG_PRIORITY_ALGORITHM, 0, 0)),
    global_ddr_state_available_chunks: RegisterField::fixed(REG_AVAILABLE_CHUNKS, 0, 0),
    dram_chunk_bitmap: RegisterField::fixed(BITMAP_BLOCK, 0, 0),

    rid_filter: RidFilterDesc {
        count: SIM_RID_FILTERS,
        control: RegisterField::fixed(REG_RID_CONTROL, 0, 0),
        rid_address: RegisterField::per_index(rid_address, 0, 0),
        rid_mask: RegisterField::per_index(rid_mask, 0, 0),
        read_valid: RegisterField::per_index(rid_read_valid, 0, 0),
        write_valid: RegisterField::per_index(rid_write_valid, 0, 0),
        base_addr: RegisterField::per_index(rid_base_addr, 0, 0),
        size: RegisterField::per_index(rid_size, 0, 0),
        read_fault: RegisterField::fixed(REG_RID_READ_FAULT, 0, 0),
        write_fault: RegisterField::fixed(REG_RID_WRITE_FAULT, 0, 0),
        read_fault_address: RegisterField::fixed(REG_RID_READ_FAULT_ADDR, 0, 0),
        write_fault_address: RegisterField::fixed(REG_RID_WRITE_FAULT_ADDR, 0, 0),
        read_fault_rid: RegisterField::fixed(REG_RID_READ_FAULT_RID, 0, 0),
        write_fault_rid: RegisterField::fixed(REG_RID_WRITE_FAULT_RID, 0, 0),
        // DRAM (BAR2) decodes at 64 GiB in device address space.
        bar_base_addr: [0, 0, 0x10_0000_0000, 0, 0, 0],
    },

    mappable: MappableDesc {
        global_region: MappableRegion {
            start: 0x20000,
            length_bytes: 0x1000,
            flags: region_flags::READ | region_flags::WRITE,
        },
        master_region: MappableRegion {
            start: 0x21000,
            length_bytes: 0x1000,
            flags: region_flags::READ | region_flags::WRITE,
        },
        queue_start: queue_command_start,
        queue_length: queue_command_length,
        dram_regions: &SIM_DRAM_REGIONS,
        debug_regions: &SIM_DEBUG_REGIONS,
    },
};

// =============================================================================
// Register file + firmware model
// =============================================================================

/// The simulated device: sparse register file plus the firmware reactions
/// the driver's handshakes expect.
pub struct SimDevice {
    regs: Mutex<BTreeMap<(usize, u64), u64>>,
    stall_ddr: core::sync::atomic::AtomicBool,
    forced_ddr_status: Mutex<Option<DdrStatus>>,
    failed_queues: Mutex<BTreeSet<usize>>,
    mmap_cookie: AtomicU64,
}

impl SimDevice {
    /// Fake-hardware flavor (the default; timeouts scale up 1000x).
    pub fn new() -> Arc<Self> {
        Self::with_fake_flag(1)
    }

    /// Real-hardware flavor, for tests that exercise timeouts.
    pub fn new_real_hardware() -> Arc<Self> {
        Self::with_fake_flag(0)
    }

    fn with_fake_flag(fake: u64) -> Arc<Self> {
        let sim = SimDevice {
            regs: Mutex::new(BTreeMap::new()),
            stall_ddr: core::sync::atomic::AtomicBool::new(false),
            forced_ddr_status: Mutex::new(None),
            failed_queues: Mutex::new(BTreeSet::new()),
            mmap_cookie: AtomicU64::new(0x10_0000),
        };
        sim.wr(SIM_FIRMWARE_BAR, REG_FW_API_VERSION, crate::DRIVER_FIRMWARE_API_VERSION);
        sim.wr(SIM_FIRMWARE_BAR, REG_IS_FAKE_HARDWARE, fake);
        sim.wr(
            SIM_FIRMWARE_BAR,
            REG_AVAILABLE_CHUNKS,
            SIM_TOTAL_CHUNKS as u64,
        );
        Arc::new(sim)
    }

    fn rd(&self, bar: usize, offset: u64) -> u64 {
        *self.regs.lock().get(&(bar, offset)).unwrap_or(&0)
    }

    fn wr(&self, bar: usize, offset: u64, value: u64) {
        self.regs.lock().insert((bar, offset), value);
    }

    /// Never acknowledge DRAM requests; the driver's handshake must time
    /// out.
    pub fn set_stall_ddr(&self, stall: bool) {
        self.stall_ddr.store(stall, Ordering::Relaxed);
    }

    /// Answer the next DRAM requests with a fixed status code.
    pub fn force_ddr_status(&self, status: Option<DdrStatus>) {
        *self.forced_ddr_status.lock() = status;
    }

    /// Mark a queue as hardware-failed.
    pub fn fail_queue(&self, index: usize) {
        self.failed_queues.lock().insert(index);
    }

    /// Retire any request left in flight by a stall: firmware eventually
    /// finishes (or a device reset clears the state).
    pub fn complete_stalled(&self) {
        for index in 0..SIM_QUEUE_CTXS {
            self.wr(SIM_FIRMWARE_BAR, q_ddr_change_requested(index), 0);
            self.wr(SIM_FIRMWARE_BAR, q_ddr_status_pending(index), 0);
        }
    }

    pub fn available_chunks(&self) -> u64 {
        self.rd(SIM_FIRMWARE_BAR, REG_AVAILABLE_CHUNKS)
    }

    fn queue_is_failed(&self, index: usize) -> bool {
        self.failed_queues.lock().contains(&index)
    }

    fn handle_queue_control(&self, index: usize, value: u64) {
        self.wr(SIM_FIRMWARE_BAR, q_control_status(index), value & 1);
    }

    fn handle_ddr_request(&self, index: usize, value: u64) {
        if self.stall_ddr.load(Ordering::Relaxed) {
            self.wr(SIM_FIRMWARE_BAR, q_ddr_change_requested(index), 1);
            self.wr(SIM_FIRMWARE_BAR, q_ddr_status_pending(index), 1);
            return;
        }

        // Request accepted immediately.
        self.wr(SIM_FIRMWARE_BAR, q_ddr_change_requested(index), 0);

        let requested: u64 = if value & SIM_BITMAP_BASED_REQUEST != 0 {
            let words = (SIM_TOTAL_CHUNKS + 31) / 32;
            (0..words)
                .map(|i| {
                    self.rd(SIM_FIRMWARE_BAR, BITMAP_BLOCK + i as u64 * 4).count_ones()
                        as u64
                })
                .sum()
        } else {
            value & 0xFFFF_FFFF
        };

        let current = self.rd(SIM_FIRMWARE_BAR, q_ddr_status_chunks(index)) as i64;
        let available = self.rd(SIM_FIRMWARE_BAR, REG_AVAILABLE_CHUNKS) as i64;
        let delta = requested as i64 - current;

        let status = if let Some(forced) = *self.forced_ddr_status.lock() {
            forced
        } else if requested > SIM_MAX_CHUNKS_PER_QUEUE as u64 {
            DdrStatus::TooLarge
        } else if delta > available {
            DdrStatus::NotEnoughAvailable
        } else {
            DdrStatus::Success
        };

        if status == DdrStatus::Success {
            self.wr(SIM_FIRMWARE_BAR, q_ddr_status_chunks(index), requested);
            self.wr(
                SIM_FIRMWARE_BAR,
                REG_AVAILABLE_CHUNKS,
                (available - delta) as u64,
            );
        }
        self.wr(SIM_FIRMWARE_BAR, q_ddr_status_value(index), status as u64);
        self.wr(SIM_FIRMWARE_BAR, q_ddr_status_pending(index), 0);
    }
}

impl BarIo for SimDevice {
    fn read_64(&self, bar: usize, offset: u64) -> u64 {
        self.rd(bar, offset)
    }

    fn write_64(&self, bar: usize, offset: u64, value: u64) {
        self.wr(bar, offset, value);

        if bar != SIM_FIRMWARE_BAR {
            return;
        }
        let queue_span = SIM_QUEUE_CTXS as u64 * QUEUE_STRIDE;
        if offset >= QUEUE_BLOCK && offset < QUEUE_BLOCK + queue_span {
            let index = ((offset - QUEUE_BLOCK) / QUEUE_STRIDE) as usize;
            match (offset - QUEUE_BLOCK) % QUEUE_STRIDE {
                QREG_CONTROL => self.handle_queue_control(index, value),
                QREG_DDR_CONTROL => self.handle_ddr_request(index, value),
                _ => {}
            }
        }
    }

    fn read_32(&self, bar: usize, offset: u64) -> u32 {
        self.rd(bar, offset) as u32
    }

    fn write_32(&self, bar: usize, offset: u64, value: u32) {
        self.wr(bar, offset, value as u64);
    }
}

// =============================================================================
// Variant callbacks
// =============================================================================

/// Variant implementation for the simulated device: the common
/// register-programmed callbacks plus trivial mapping-offset assignment.
pub struct SimVariant {
    pub sim: Arc<SimDevice>,
}

impl VariantOps for SimVariant {
    fn is_queue_ctx_failed(
        &self,
        _dev: &AccelDevice,
        queue: &QueueCtx,
        _state: &QueueState,
    ) -> bool {
        self.sim.queue_is_failed(queue.index)
    }

    fn allocate_queue_ctx(
        &self,
        dev: &AccelDevice,
        queue: &QueueCtx,
        state: &mut QueueState,
        config: &QueueCtxAllocConfig,
    ) -> Result<()> {
        queue::common_allocate_queue_ctx(dev, queue, state, config)
    }

    fn enable_queue_ctx(
        &self,
        dev: &AccelDevice,
        queue: &QueueCtx,
        _state: &mut QueueState,
    ) -> Result<()> {
        let desc = dev.desc;
        dev.io.write_64(
            desc.firmware_register_bar,
            desc.control_control.offset(queue.index),
            1,
        );
        dev.wait_for_value(
            desc.firmware_register_bar,
            desc.control_status_enabled.offset(queue.index),
            queue::QUEUE_CONTROL_DISABLE_TIMEOUT_SEC,
            desc.control_status_enabled.mask,
            desc.control_status_enabled.mask,
        )
    }

    fn disable_queue_ctx(
        &self,
        dev: &AccelDevice,
        queue: &QueueCtx,
        _state: &mut QueueState,
    ) -> Result<MappableRegion> {
        let desc = dev.desc;
        dev.io.write_64(
            desc.firmware_register_bar,
            desc.control_control.offset(queue.index),
            0,
        );
        dev.wait_for_value(
            desc.firmware_register_bar,
            desc.control_status_enabled.offset(queue.index),
            queue::QUEUE_CONTROL_DISABLE_TIMEOUT_SEC,
            desc.control_status_enabled.mask,
            0,
        )?;

        Ok(mapping::populate_queue_mappable_region(dev, queue.index))
    }

    fn deallocate_queue_ctx(
        &self,
        dev: &AccelDevice,
        queue: &QueueCtx,
        state: &mut QueueState,
    ) -> Result<()> {
        queue::common_deallocate_queue_ctx(dev, queue, state)
    }

    fn allocate_direct_mapping(
        &self,
        _dev: &AccelDevice,
        _queue: &QueueCtx,
        _state: &QueueState,
        mapping: &mut DirectMapping,
    ) -> Result<()> {
        // Hand out distinct, nonzero mmap cookies; the region itself is
        // the requested BAR window.
        let cookie = self
            .sim
            .mmap_cookie
            .fetch_add(mapping.request.size.max(0x1000), Ordering::Relaxed);
        mapping.request.mmap_offset = cookie;
        mapping.mappable_region.start = mapping.request.base;
        Ok(())
    }

    fn deallocate_direct_mapping(
        &self,
        _dev: &AccelDevice,
        _queue: &QueueCtx,
        _mapping: &DirectMapping,
    ) -> Result<()> {
        Ok(())
    }
}

// =============================================================================
// Platform + page-table doubles
// =============================================================================

/// Virtual-clock platform: sleeping advances time, and every kill/unmap is
/// recorded for assertions.
pub struct SimPlatform {
    now_ms: AtomicU64,
    pub killed: Mutex<Vec<ClientId>>,
    pub unmapped: Mutex<Vec<(ClientId, usize, MappableRegion)>>,
    mrrs: AtomicU32,
}

impl SimPlatform {
    pub fn new() -> Arc<Self> {
        Arc::new(SimPlatform {
            now_ms: AtomicU64::new(0),
            killed: Mutex::new(Vec::new()),
            unmapped: Mutex::new(Vec::new()),
            mrrs: AtomicU32::new(512),
        })
    }
}

impl Platform for SimPlatform {
    fn monotonic_ms(&self) -> u64 {
        self.now_ms.load(Ordering::Relaxed)
    }

    fn sleep_ms(&self, ms: u64) {
        self.now_ms.fetch_add(ms, Ordering::Relaxed);
    }

    fn kill_client(&self, client: ClientId) {
        self.killed.lock().push(client);
    }

    fn unmap_region(&self, client: ClientId, bar: usize, region: &MappableRegion) {
        self.unmapped.lock().push((client, bar, *region));
    }

    fn pcie_mrrs(&self) -> u32 {
        self.mrrs.load(Ordering::Relaxed)
    }

    fn set_pcie_mrrs(&self, value: u32) -> Result<()> {
        self.mrrs.store(value, Ordering::Relaxed);
        Ok(())
    }

    fn root_bus_number(&self) -> u8 {
        0x3A
    }
}

/// Page-table double that counts teardowns.
pub struct SimPageTable {
    pub unmap_count: AtomicUsize,
    pub gc_count: AtomicUsize,
}

impl SimPageTable {
    pub fn new() -> Arc<Self> {
        Arc::new(SimPageTable {
            unmap_count: AtomicUsize::new(0),
            gc_count: AtomicUsize::new(0),
        })
    }
}

impl PageTable for SimPageTable {
    fn unmap_all(&self) {
        self.unmap_count.fetch_add(1, Ordering::Relaxed);
    }

    fn garbage_collect(&self) {
        self.gc_count.fetch_add(1, Ordering::Relaxed);
    }
}

// =============================================================================
// Wiring
// =============================================================================

/// A fully wired simulated device, enabled and ready for control requests.
pub fn sim_device() -> (Arc<AccelDevice>, Arc<SimDevice>, Arc<SimPlatform>) {
    sim_device_from(SimDevice::new())
}

/// Wire a specific [`SimDevice`] (e.g. the real-hardware flavor).
pub fn sim_device_from(
    sim: Arc<SimDevice>,
) -> (Arc<AccelDevice>, Arc<SimDevice>, Arc<SimPlatform>) {
    let platform = SimPlatform::new();
    let variant = Arc::new(SimVariant { sim: sim.clone() });

    let page_tables: Vec<Arc<dyn PageTable>> = (0..SIM_QUEUE_CTXS)
        .map(|_| SimPageTable::new() as Arc<dyn PageTable>)
        .collect();

    let dev = AccelDevice::new(
        &SIM_DESC,
        "accel0",
        variant,
        sim.clone() as Arc<dyn BarIo>,
        platform.clone() as Arc<dyn Platform>,
        page_tables,
    )
    .expect("sim descriptor is valid");
    dev.enable_dev().expect("sim device enables");

    (dev, sim, platform)
}

/// A name array for tests and callers.
pub fn name(text: &str) -> [u8; QUEUE_NAME_MAX] {
    queue::queue_name(text)
}

/// A plain unprivileged caller.
pub fn caller(id: ClientId) -> Caller {
    Caller::new(id)
}
