//! Device-framework collaborator surface.
//!
//! The resource core never touches PCI, page tables, address spaces or task
//! management directly. Everything it needs from the surrounding kernel is
//! expressed here as a narrow trait, implemented by the embedding framework
//! (or by the [`crate::sim`] doubles in tests). The core decides *when* these
//! hooks run and with what arguments; the embedder decides *how*.

use alloc::sync::Arc;

use crate::error::Result;

/// Opaque client identity: the runtime's session/process-group id.
/// `NO_CLIENT` (0) means "unowned".
pub type ClientId = u32;

pub const NO_CLIENT: ClientId = 0;

/// The identity of the process driving a call into the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Caller {
    pub id: ClientId,
    /// System-administrator equivalent; bypasses ownership checks where the
    /// permission rules say so.
    pub privileged: bool,
}

impl Caller {
    pub const fn new(id: ClientId) -> Self {
        Caller {
            id,
            privileged: false,
        }
    }

    pub const fn privileged(id: ClientId) -> Self {
        Caller {
            id,
            privileged: true,
        }
    }
}

/// Device health state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DeviceStatus {
    /// Hardware/software state is inconsistent; all mutating requests
    /// short-circuit with an I/O error until reset.
    Dead = 0,
    /// Normal operation
    Alive = 1,
    /// Driver teardown in progress; polling loops abort with a
    /// cancellation error instead of timing out.
    DriverExit = 2,
}

impl DeviceStatus {
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => DeviceStatus::Dead,
            1 => DeviceStatus::Alive,
            _ => DeviceStatus::DriverExit,
        }
    }
}

/// Ownership record for a device node: the first write-opener becomes the
/// master process until the last write handle closes.
#[derive(Debug, Clone, Copy, Default)]
pub struct Ownership {
    pub is_owned: bool,
    pub owner: ClientId,
    pub write_open_count: u32,
}

/// Memory protection bits used by direct mappings and the RID filter.
pub mod prot {
    pub const NONE: u32 = 0;
    pub const READ: u32 = 1 << 0;
    pub const WRITE: u32 = 1 << 1;
}

/// Flags on a mappable region, mirroring the mmap layer's VM flags.
pub mod region_flags {
    pub const READ: u32 = 1 << 0;
    pub const WRITE: u32 = 1 << 1;
}

/// A (start, length, flags) window the mmap layer may expose to user space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MappableRegion {
    pub start: u64,
    pub length_bytes: u64,
    pub flags: u32,
}

/// Register-level access to the device's BARs. One implementation per
/// transport: direct MMIO on real hardware, a mailbox RPC in a VM, a
/// register file in the simulator.
pub trait BarIo: Send + Sync {
    fn read_64(&self, bar: usize, offset: u64) -> u64;
    fn write_64(&self, bar: usize, offset: u64, value: u64);
    fn read_32(&self, bar: usize, offset: u64) -> u32;
    fn write_32(&self, bar: usize, offset: u64, value: u32);
}

/// Handle to one queue's page table, owned by the framework.
pub trait PageTable: Send + Sync {
    /// Tear down every live translation.
    fn unmap_all(&self);
    /// Reclaim entries left behind by exited mappers.
    fn garbage_collect(&self);
}

/// Everything else the core needs from the surrounding kernel.
pub trait Platform: Send + Sync {
    /// Monotonic milliseconds; only differences are meaningful.
    fn monotonic_ms(&self) -> u64;

    /// Block the calling thread. Handshake polls sleep 1ms per sample.
    fn sleep_ms(&self, ms: u64);

    /// Forcibly terminate a client that can no longer safely use the
    /// device (master-exit cascade).
    fn kill_client(&self, client: ClientId);

    /// Unmap `region` of `bar` from the client's mapped-memory view.
    fn unmap_region(&self, client: ClientId, bar: usize, region: &MappableRegion);

    /// PCIe maximum read request size, in bytes.
    fn pcie_mrrs(&self) -> u32;

    /// Set the PCIe maximum read request size. The value has already been
    /// validated against the set of legal sizes.
    fn set_pcie_mrrs(&self, value: u32) -> Result<()>;

    /// Bus number of the PCI root bus above this device; programmed into
    /// the reserved bus-root RID filter window.
    fn root_bus_number(&self) -> u8;
}

/// A no-op page table for devices whose translations are managed entirely
/// by the embedding framework.
pub struct NullPageTable;

impl PageTable for NullPageTable {
    fn unmap_all(&self) {}
    fn garbage_collect(&self) {}
}

/// Convenience: a vector of no-op page tables, one per queue.
pub fn null_page_tables(count: usize) -> alloc::vec::Vec<Arc<dyn PageTable>> {
    (0..count)
        .map(|_| Arc::new(NullPageTable) as Arc<dyn PageTable>)
        .collect()
}
