//! RID filter table: admission control for peer PCIe access.
//!
//! The filter is a fixed hardware table of (requester-id, address-window,
//! permission) triples; DMA reads/writes are allowed only when some window
//! admits them. Window 0 is permanently reserved for the device's own DMA
//! self-access and window 1 for same-bus-root access; explicit allocation
//! starts above those.
//!
//! The assignment array shadows the hardware table with the owning queue
//! index per window, or a free/reserved sentinel. Subcontainers share the
//! parent's table and lock.

use crate::device::AccelDevice;
use crate::error::{AccelError, Result};
use crate::framework::prot;
use crate::regs::{read_field, write_field};
use crate::{adebug, aerror, ainfo, awarn};

use alloc::vec::Vec;

/// Assignment sentinel: window unassigned.
pub const RID_FILTER_FREE: u8 = 0xFF;

/// Assignment sentinel: window reserved for kernel use. Queue indices must
/// stay below this.
pub const RID_FILTER_RESERVED: u8 = 0xFE;

/// Shadow of the hardware table: owning queue index per window.
pub struct RidFilterTable {
    pub assignments: Vec<u8>,
}

/// Write the filter enable bit and verify it took effect. If the readback
/// disagrees the device is likely inaccessible; force the filter off as a
/// fail-safe and report failure.
fn set_enable(dev: &AccelDevice, enable: bool) -> bool {
    let desc = &dev.desc.rid_filter;
    let bar = dev.desc.firmware_register_bar;
    let target: u64 = if enable { 1 } else { 0 };

    write_field(&*dev.io, bar, &desc.control, 0, target);

    let value = read_field(&*dev.io, bar, &desc.control, 0);
    if value != target {
        aerror!(
            "ACCEL/RidFilter: Failed to set the RID filter enable state, device is \
             likely inaccessible (state={}, target={}); blindly disabling the RID filter.",
            value,
            target
        );
        write_field(&*dev.io, bar, &desc.control, 0, 0);
        return false;
    }

    true
}

/// Program one window and record its owner. Valid bits are dropped first
/// and re-applied last so a partially-programmed window never matches.
fn filter_set(
    dev: &AccelDevice,
    assignments: &mut [u8],
    idx: usize,
    queue_idx: u8,
    rid: u32,
    rid_mask: u32,
    protection: u32,
    base_addr: u64,
    size: u64,
) {
    let desc = &dev.desc.rid_filter;
    let bar = dev.desc.firmware_register_bar;

    adebug!(
        "ACCEL/RidFilter: [{:2}] assignment={:#04x}, rid={:#06x}, mask={:#06x}, \
         perm={}{}-, [{:#x}-{:#x}]",
        idx,
        queue_idx,
        rid,
        rid_mask,
        if protection & prot::READ != 0 { 'r' } else { '-' },
        if protection & prot::WRITE != 0 { 'w' } else { '-' },
        base_addr,
        base_addr.wrapping_add(size).wrapping_sub(1)
    );

    write_field(&*dev.io, bar, &desc.read_valid, idx, 0);
    write_field(&*dev.io, bar, &desc.write_valid, idx, 0);

    write_field(&*dev.io, bar, &desc.rid_address, idx, rid as u64);
    write_field(&*dev.io, bar, &desc.rid_mask, idx, rid_mask as u64);
    write_field(&*dev.io, bar, &desc.base_addr, idx, base_addr);
    write_field(&*dev.io, bar, &desc.size, idx, size);

    write_field(
        &*dev.io,
        bar,
        &desc.read_valid,
        idx,
        if protection & prot::READ != 0 { 1 } else { 0 },
    );
    write_field(
        &*dev.io,
        bar,
        &desc.write_valid,
        idx,
        if protection & prot::WRITE != 0 { 1 } else { 0 },
    );

    assignments[idx] = queue_idx;
}

/// Disable the filter and zero every window, dropping the assignment
/// array. Lock already held.
fn disable_and_clear_locked(
    dev: &AccelDevice,
    table: &mut Option<RidFilterTable>,
) -> Result<()> {
    let mut ret = Ok(());

    if !set_enable(dev, false) {
        ret = Err(AccelError::Io);
    }

    *table = None;

    let count = dev.desc.rid_filter.count;
    let mut scratch = alloc::vec![RID_FILTER_FREE; count];
    for idx in 0..count {
        filter_set(dev, &mut scratch, idx, RID_FILTER_FREE, 0, 0, prot::NONE, 0, 0);
    }

    ret
}

/// Disable the whole filter and clear its windows.
pub fn disable_and_clear(dev: &AccelDevice) -> Result<()> {
    let table_ref = dev.rid_filter.clone();
    let mut table = table_ref.lock();

    if dev.desc.rid_filter.count == 0 {
        return Ok(());
    }

    disable_and_clear_locked(dev, &mut table)?;

    ainfo!("ACCEL/RidFilter: RID filter is disabled and cleared");
    Ok(())
}

/// Bring the filter up from scratch: clear it, rebuild the assignment
/// array, program the two reserved windows and enable. Any failure falls
/// back to the disabled/cleared state rather than leaving a half-configured
/// table.
pub fn setup(dev: &AccelDevice) -> Result<()> {
    let count = dev.desc.rid_filter.count;
    let table_ref = dev.rid_filter.clone();
    let mut table = table_ref.lock();

    disable_and_clear_locked(dev, &mut table)?;

    if dev.desc.queue_ctx_count >= RID_FILTER_RESERVED as usize {
        aerror!(
            "ACCEL/RidFilter: Device has too many queues ({}) for this RID filter code \
             (>={})!",
            dev.desc.queue_ctx_count,
            RID_FILTER_RESERVED
        );
        return Err(AccelError::Io);
    }

    let mut assignments = alloc::vec![RID_FILTER_FREE; count];

    // Window 0: the device's own DMA self-access, wildcard function mask.
    filter_set(
        dev,
        &mut assignments,
        0,
        RID_FILTER_RESERVED,
        0,
        0xFF,
        prot::READ | prot::WRITE,
        0,
        0,
    );

    // Window 1: anything under the same PCI root bus.
    let root_bus = dev.platform.root_bus_number();
    filter_set(
        dev,
        &mut assignments,
        1,
        RID_FILTER_RESERVED,
        (root_bus as u32) << 8,
        0xFF,
        prot::READ | prot::WRITE,
        0,
        0,
    );

    *table = Some(RidFilterTable { assignments });

    if !set_enable(dev, true) {
        let _ = disable_and_clear_locked(dev, &mut table);
        return Err(AccelError::Io);
    }

    ainfo!("ACCEL/RidFilter: RID filter is enabled");
    Ok(())
}

/// Claim the first free window for `queue_idx` and program it with an
/// absolute address window derived from the BAR base plus `offset`.
/// Returns the window index.
pub fn allocate(
    dev: &AccelDevice,
    queue_idx: u8,
    rid: u32,
    rid_mask: u32,
    protection: u32,
    bar: usize,
    offset: u64,
    size: u64,
) -> Result<usize> {
    if queue_idx >= RID_FILTER_RESERVED {
        aerror!(
            "ACCEL/RidFilter: Invoked with invalid queue_idx={} (>={}), but should \
             never happen",
            queue_idx,
            RID_FILTER_RESERVED
        );
        return Err(AccelError::InvalidArgument);
    }

    let base_addr = dev.desc.rid_filter.bar_base_addr[bar] + offset;

    let table_ref = dev.rid_filter.clone();
    let mut table = table_ref.lock();
    let table = match table.as_mut() {
        Some(table) => table,
        None => return Err(AccelError::NotSupported),
    };

    let count = dev.desc.rid_filter.count;
    let idx = match table
        .assignments
        .iter()
        .position(|&assignment| assignment == RID_FILTER_FREE)
    {
        Some(idx) => idx,
        None => {
            awarn!("ACCEL/RidFilter: No free RID filters");
            return Err(AccelError::Io);
        }
    };
    debug_assert!(idx < count);

    filter_set(
        dev,
        &mut table.assignments,
        idx,
        queue_idx,
        rid,
        rid_mask,
        protection,
        base_addr,
        size,
    );

    Ok(idx)
}

/// Release window `idx`, but only if it is still assigned to `queue_idx`:
/// a stale index must not clobber another queue's window.
pub fn deallocate(dev: &AccelDevice, idx: usize, queue_idx: u8) -> Result<()> {
    if queue_idx >= RID_FILTER_RESERVED {
        aerror!(
            "ACCEL/RidFilter: Invoked with invalid queue_idx={} (>={}), but should \
             never happen",
            queue_idx,
            RID_FILTER_RESERVED
        );
        return Err(AccelError::InvalidArgument);
    }
    if idx >= dev.desc.rid_filter.count {
        return Err(AccelError::InvalidArgument);
    }

    let table_ref = dev.rid_filter.clone();
    let mut table = table_ref.lock();
    let table = match table.as_mut() {
        Some(table) => table,
        None => return Err(AccelError::NotSupported),
    };

    if table.assignments[idx] == queue_idx {
        filter_set(
            dev,
            &mut table.assignments,
            idx,
            RID_FILTER_FREE,
            0,
            0,
            prot::NONE,
            0,
            0,
        );
    } else {
        awarn!(
            "ACCEL/RidFilter: RID filter window {} not allocated to queue {} ({})",
            idx,
            queue_idx,
            table.assignments[idx]
        );
    }

    Ok(())
}
