//! Observability attributes (the virtual-file surface).
//!
//! Read-only and read-write attributes the embedding kernel exposes as
//! per-device virtual files: hardware flavor, PCIe read-request sizing,
//! timeout scaling, the RID filter state, and, in overseer mode, the
//! per-subcontainer partition summaries. A dead device stays readable here
//! while rejecting every mutating control request.

use alloc::string::String;
use alloc::vec::Vec;
use core::fmt::Write;
use core::sync::atomic::Ordering;

use crate::device::{AccelDevice, DeviceMode};
use crate::error::{AccelError, Result};
use crate::regs::read_field;
use crate::{aerror, awarn};

/// Chunk-map bytes exposed per subcontainer-memory attribute node.
pub const CHUNKS_PER_ATTR_NODE: usize = 2048;

/// The attribute set. Memory nodes are binary and go through
/// [`attr_show_binary`]; everything else is text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceAttr {
    IsRealHardware,
    PcieMrrs,
    TimeoutScaling,
    RidFilterStatus,
    RidFilterTable,
    Subcontainers,
    SubcontainerId,
    SubcontainerMemory(usize),
}

fn valid_pcie_mrrs(value: u32) -> bool {
    matches!(value, 128 | 256 | 512 | 1024 | 2048 | 4096)
}

/// `bus:slot.func` rendering of a 16-bit requester id.
fn write_rid(out: &mut String, rid: u64) {
    let _ = write!(
        out,
        "{:02x}:{:02x}.{:x}",
        (rid >> 8) & 0xFF,
        (rid >> 3) & 0x1F,
        rid & 0x7
    );
}

fn show_rid_filter_status(dev: &AccelDevice) -> String {
    let desc = &dev.desc.rid_filter;
    let bar = dev.desc.firmware_register_bar;
    let mut out = String::new();

    let enabled = read_field(&*dev.io, bar, &desc.control, 0);
    let _ = writeln!(out, "{}", if enabled != 0 { "enabled" } else { "disabled" });

    let faulted = read_field(&*dev.io, bar, &desc.read_fault, 0);
    let address = read_field(&*dev.io, bar, &desc.read_fault_address, 0);
    let rid = read_field(&*dev.io, bar, &desc.read_fault_rid, 0);
    let _ = write!(out, "read  : faulted={}, rid=", faulted);
    write_rid(&mut out, rid);
    let _ = writeln!(out, ", address={:#x}", address);

    let faulted = read_field(&*dev.io, bar, &desc.write_fault, 0);
    let address = read_field(&*dev.io, bar, &desc.write_fault_address, 0);
    let rid = read_field(&*dev.io, bar, &desc.write_fault_rid, 0);
    let _ = write!(out, "write : faulted={}, rid=", faulted);
    write_rid(&mut out, rid);
    let _ = writeln!(out, ", address={:#x}", address);

    out
}

fn show_rid_filter_table(dev: &AccelDevice) -> String {
    let desc = &dev.desc.rid_filter;
    let bar = dev.desc.firmware_register_bar;
    let mut out = String::new();

    let table = dev.rid_filter.lock();
    for idx in 0..desc.count {
        let assignment = table
            .as_ref()
            .map(|table| table.assignments[idx])
            .unwrap_or(crate::rid_filter::RID_FILTER_FREE);
        let read_valid = read_field(&*dev.io, bar, &desc.read_valid, idx);
        let write_valid = read_field(&*dev.io, bar, &desc.write_valid, idx);
        let rid = read_field(&*dev.io, bar, &desc.rid_address, idx);
        let mask = read_field(&*dev.io, bar, &desc.rid_mask, idx);
        let window_base = read_field(&*dev.io, bar, &desc.base_addr, idx);
        let window_size = read_field(&*dev.io, bar, &desc.size, idx);

        let _ = write!(out, "[{:2}] assignment={:#04x}, rid=", idx, assignment);
        write_rid(&mut out, rid);
        let _ = write!(out, ", mask_off=");
        write_rid(&mut out, mask);
        let _ = writeln!(
            out,
            ", perm={}{}-, [{:#x}-{:#x}]",
            if read_valid != 0 { 'r' } else { '-' },
            if write_valid != 0 { 'w' } else { '-' },
            window_base,
            window_base.wrapping_add(window_size).wrapping_sub(1)
        );
    }

    out
}

/// One line per subcontainer: device name, allocated/reserved chunks and
/// the reserved queue list. "n/a" lines outside overseer mode.
fn show_subcontainers(dev: &AccelDevice) -> String {
    let mut out = String::new();

    let subcontainers = dev.subcontainers.lock();
    if subcontainers.is_empty() {
        for _ in 0..crate::MAX_SUBCONTAINERS {
            let _ = writeln!(out, "n/a");
        }
        return out;
    }

    for sub in subcontainers.iter() {
        let _ = write!(
            out,
            "{} {}/{} ",
            sub.name(),
            sub.allocated_chunks.load(Ordering::Relaxed),
            sub.reserved_chunks.load(Ordering::Relaxed)
        );

        let mut first_queue = true;
        for queue in dev.queues.iter() {
            let state = queue.state.lock();
            if state.reserved_by == sub.clone_index {
                let _ = write!(
                    out,
                    "{}{}",
                    if first_queue { "" } else { "," },
                    queue.index
                );
                first_queue = false;
            }
        }
        let _ = writeln!(out);
    }

    out
}

/// Render a text attribute.
pub fn attr_show(dev: &AccelDevice, attr: DeviceAttr) -> Result<String> {
    let mut out = String::new();
    match attr {
        DeviceAttr::IsRealHardware => {
            let _ = writeln!(out, "{}", if dev.is_real_hardware() { 1 } else { 0 });
        }
        DeviceAttr::PcieMrrs => {
            let _ = writeln!(out, "{}", dev.platform.pcie_mrrs());
        }
        DeviceAttr::TimeoutScaling => {
            let _ = writeln!(out, "{}", dev.timeout_scaling());
        }
        DeviceAttr::RidFilterStatus => return Ok(show_rid_filter_status(dev)),
        DeviceAttr::RidFilterTable => return Ok(show_rid_filter_table(dev)),
        DeviceAttr::Subcontainers => return Ok(show_subcontainers(dev)),
        DeviceAttr::SubcontainerId => match dev.clone_index {
            Some(index) => {
                let _ = writeln!(out, "{}", index);
            }
            None => {
                awarn!("ACCEL/Attrs: subcontainer_id attribute read on master!");
                let _ = writeln!(out, "-1");
            }
        },
        DeviceAttr::SubcontainerMemory(_) => return Err(AccelError::InvalidArgument),
    }
    Ok(out)
}

/// Raw chunk-map slice for one subcontainer-memory node (binary
/// attribute).
pub fn attr_show_binary(dev: &AccelDevice, attr: DeviceAttr) -> Result<Vec<u8>> {
    match attr {
        DeviceAttr::SubcontainerMemory(node) => {
            let pool = dev.dram.lock();
            let start = node * CHUNKS_PER_ATTR_NODE;
            if start >= pool.chunk_map.len() {
                return Err(AccelError::InvalidArgument);
            }
            let end = core::cmp::min(start + CHUNKS_PER_ATTR_NODE, pool.chunk_map.len());
            let mut out = pool.chunk_map[start..end].to_vec();
            out.push(b'\n');
            Ok(out)
        }
        _ => Err(AccelError::InvalidArgument),
    }
}

/// Apply a write to a read-write attribute.
pub fn attr_store(dev: &AccelDevice, attr: DeviceAttr, value: &str) -> Result<()> {
    match attr {
        DeviceAttr::PcieMrrs => {
            let parsed: u32 = match value.trim().parse() {
                Ok(parsed) if valid_pcie_mrrs(parsed) => parsed,
                _ => {
                    aerror!("ACCEL/Attrs: Invalid pcie_mrrs arg: {}", value.trim());
                    return Err(AccelError::InvalidArgument);
                }
            };
            if dev.platform.set_pcie_mrrs(parsed).is_err() {
                aerror!("ACCEL/Attrs: Error setting PCI MRRS");
                return Err(AccelError::Io);
            }
            Ok(())
        }
        DeviceAttr::TimeoutScaling => match value.trim().parse::<u64>() {
            Ok(parsed) => {
                dev.set_timeout_scaling(parsed);
                Ok(())
            }
            Err(_) => {
                aerror!("ACCEL/Attrs: Invalid timeout_scaling arg: {}", value.trim());
                Err(AccelError::InvalidArgument)
            }
        },
        _ => Err(AccelError::InvalidArgument),
    }
}

/// Which attribute nodes exist for a device node in its current role.
pub fn attrs_for_device(dev: &AccelDevice) -> Vec<DeviceAttr> {
    let mut attrs = alloc::vec![
        DeviceAttr::IsRealHardware,
        DeviceAttr::PcieMrrs,
        DeviceAttr::TimeoutScaling,
    ];

    if !dev.is_subcontainer() && dev.desc.rid_filter.count > 0 {
        attrs.push(DeviceAttr::RidFilterStatus);
        attrs.push(DeviceAttr::RidFilterTable);
    }

    let memory_nodes =
        (dev.desc.total_chunks + CHUNKS_PER_ATTR_NODE - 1) / CHUNKS_PER_ATTR_NODE;

    if dev.is_subcontainer() {
        attrs.push(DeviceAttr::SubcontainerId);
        for node in 0..memory_nodes {
            attrs.push(DeviceAttr::SubcontainerMemory(node));
        }
    } else if dev.state.lock().mode == DeviceMode::Overseer {
        attrs.push(DeviceAttr::Subcontainers);
        for node in 0..memory_nodes {
            attrs.push(DeviceAttr::SubcontainerMemory(node));
        }
    }

    attrs
}
