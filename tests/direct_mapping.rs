//! Direct-mapping tests: validation, DRAM-range bounds, RID filter window
//! wiring, teardown cascades and shareable buffer revocation.

use nexa_accel::attrs::{attr_show, DeviceAttr};
use nexa_accel::error::AccelError;
use nexa_accel::framework::{prot, Caller};
use nexa_accel::ioctl::{device_ioctl, AccelRequest};
use nexa_accel::mapping::DirectMappingRequest;
use nexa_accel::queue::QueueCtxConfig;
use nexa_accel::shared_buf::create_shared_buffer;
use nexa_accel::sim::{name, sim_device, SIM_DRAM_BAR};
use nexa_accel::DRAM_CHUNK_BYTES;

const MASTER: Caller = Caller::new(100);
const WORKER: Caller = Caller::new(200);

fn mapping_request(base_chunks: u64, size_chunks: u64, prot_bits: u32) -> DirectMappingRequest {
    DirectMappingRequest {
        queue_index: 0,
        bar: SIM_DRAM_BAR,
        base: base_chunks * DRAM_CHUNK_BYTES,
        size: size_chunks * DRAM_CHUNK_BYTES,
        prot: prot_bits,
        peer_rid_address: 0,
        peer_rid_mask: 0,
        mmap_offset: 0,
    }
}

/// Master-owned device with queue "q0" enabled holding 10 chunks.
fn enabled_device() -> (
    std::sync::Arc<nexa_accel::device::AccelDevice>,
    std::sync::Arc<nexa_accel::sim::SimDevice>,
    std::sync::Arc<nexa_accel::sim::SimPlatform>,
) {
    let (dev, sim, platform) = sim_device();
    dev.open(MASTER, true);

    let mut req = AccelRequest::AllocateQueueCtx(QueueCtxConfig {
        name: name("q0"),
        priority: 0,
        dram_chunks: 10,
        index: -1,
    });
    device_ioctl(&dev, MASTER, &mut req).unwrap();
    let mut req = AccelRequest::EnableQueueCtx(QueueCtxConfig {
        name: name("q0"),
        priority: 0,
        dram_chunks: 0,
        index: -1,
    });
    device_ioctl(&dev, MASTER, &mut req).unwrap();

    (dev, sim, platform)
}

// =============================================================================
// Allocation bounds
// =============================================================================

#[test]
fn test_mapping_within_allocation_succeeds() {
    let (dev, _sim, _platform) = enabled_device();

    // The full 10-chunk (20 MiB) allocation is mappable.
    let mut req = AccelRequest::AllocateDirectMapping(mapping_request(0, 10, prot::READ));
    device_ioctl(&dev, MASTER, &mut req).unwrap();
    match &req {
        AccelRequest::AllocateDirectMapping(request) => {
            assert_ne!(request.mmap_offset, 0);
            assert_ne!(request.mmap_offset, u64::MAX);
        }
        _ => unreachable!(),
    }
}

#[test]
fn test_mapping_beyond_allocation_rejected() {
    let (dev, _sim, _platform) = enabled_device();

    let mut req = AccelRequest::AllocateDirectMapping(mapping_request(0, 11, prot::READ));
    assert_eq!(
        device_ioctl(&dev, MASTER, &mut req),
        Err(AccelError::InvalidArgument)
    );

    let mut req = AccelRequest::AllocateDirectMapping(mapping_request(4, 7, prot::READ));
    assert_eq!(
        device_ioctl(&dev, MASTER, &mut req),
        Err(AccelError::InvalidArgument)
    );
}

#[test]
fn test_mmap_offsets_distinct_across_mappings() {
    let (dev, _sim, _platform) = enabled_device();

    let mut first = AccelRequest::AllocateDirectMapping(mapping_request(0, 1, prot::READ));
    device_ioctl(&dev, MASTER, &mut first).unwrap();
    let mut second =
        AccelRequest::AllocateDirectMapping(mapping_request(1, 1, prot::READ));
    device_ioctl(&dev, MASTER, &mut second).unwrap();

    let (first_offset, second_offset) = match (&first, &second) {
        (
            AccelRequest::AllocateDirectMapping(a),
            AccelRequest::AllocateDirectMapping(b),
        ) => (a.mmap_offset, b.mmap_offset),
        _ => unreachable!(),
    };
    assert_ne!(first_offset, 0);
    assert_ne!(second_offset, 0);
    assert_ne!(first_offset, second_offset);
}

#[test]
fn test_structural_validation() {
    let (dev, _sim, _platform) = enabled_device();

    // Wrong BAR.
    let mut request = mapping_request(0, 1, prot::READ);
    request.bar = 0;
    let mut req = AccelRequest::AllocateDirectMapping(request);
    assert_eq!(
        device_ioctl(&dev, MASTER, &mut req),
        Err(AccelError::InvalidArgument)
    );

    // Misaligned base.
    let mut request = mapping_request(0, 1, prot::READ);
    request.base = DRAM_CHUNK_BYTES / 2;
    let mut req = AccelRequest::AllocateDirectMapping(request);
    assert_eq!(
        device_ioctl(&dev, MASTER, &mut req),
        Err(AccelError::InvalidArgument)
    );

    // Zero size.
    let mut request = mapping_request(0, 1, prot::READ);
    request.size = 0;
    let mut req = AccelRequest::AllocateDirectMapping(request);
    assert_eq!(
        device_ioctl(&dev, MASTER, &mut req),
        Err(AccelError::InvalidArgument)
    );

    // Empty and oversized protection.
    let mut req = AccelRequest::AllocateDirectMapping(mapping_request(0, 1, 0));
    assert_eq!(
        device_ioctl(&dev, MASTER, &mut req),
        Err(AccelError::InvalidArgument)
    );
    let mut req = AccelRequest::AllocateDirectMapping(mapping_request(0, 1, 0x4));
    assert_eq!(
        device_ioctl(&dev, MASTER, &mut req),
        Err(AccelError::InvalidArgument)
    );
}

#[test]
fn test_mapping_requires_queue_ownership() {
    let (dev, _sim, _platform) = enabled_device();
    dev.open(WORKER, false);

    let mut req = AccelRequest::AllocateDirectMapping(mapping_request(0, 1, prot::READ));
    assert_eq!(
        device_ioctl(&dev, WORKER, &mut req),
        Err(AccelError::InvalidArgument)
    );
}

// =============================================================================
// Deallocation
// =============================================================================

#[test]
fn test_deallocate_requires_exact_match() {
    let (dev, _sim, _platform) = enabled_device();

    let mut req = AccelRequest::AllocateDirectMapping(mapping_request(0, 2, prot::READ));
    device_ioctl(&dev, MASTER, &mut req).unwrap();

    // Same window, different protection: no match.
    let mut req =
        AccelRequest::DeallocateDirectMapping(mapping_request(0, 2, prot::WRITE));
    assert_eq!(
        device_ioctl(&dev, MASTER, &mut req),
        Err(AccelError::InvalidArgument)
    );

    let mut req = AccelRequest::DeallocateDirectMapping(mapping_request(0, 2, prot::READ));
    device_ioctl(&dev, MASTER, &mut req).unwrap();
    assert!(dev.queue(0).mappings.lock().is_empty());
}

#[test]
fn test_deallocate_unmaps_caller() {
    let (dev, _sim, platform) = enabled_device();

    let mut req = AccelRequest::AllocateDirectMapping(mapping_request(0, 2, prot::READ));
    device_ioctl(&dev, MASTER, &mut req).unwrap();
    let mut req = AccelRequest::DeallocateDirectMapping(mapping_request(0, 2, prot::READ));
    device_ioctl(&dev, MASTER, &mut req).unwrap();

    let unmapped = platform.unmapped.lock();
    assert!(unmapped
        .iter()
        .any(|(client, bar, _)| *client == MASTER.id && *bar == SIM_DRAM_BAR));
}

// =============================================================================
// RID filter wiring
// =============================================================================

#[test]
fn test_peer_mapping_claims_filter_window() {
    let (dev, _sim, _platform) = enabled_device();

    let mut request = mapping_request(0, 2, prot::READ | prot::WRITE);
    request.peer_rid_address = 0x0420;
    request.peer_rid_mask = 0xFF;
    let mut req = AccelRequest::AllocateDirectMapping(request);
    device_ioctl(&dev, MASTER, &mut req).unwrap();

    // The first window above the two reserved slots belongs to queue 0.
    let table = attr_show(&dev, DeviceAttr::RidFilterTable).unwrap();
    assert!(table.contains("[ 2] assignment=0x00"), "table: {}", table);

    // Tearing the mapping down frees the window.
    let mut request = mapping_request(0, 2, prot::READ | prot::WRITE);
    request.peer_rid_address = 0x0420;
    request.peer_rid_mask = 0xFF;
    let mut req = AccelRequest::DeallocateDirectMapping(request);
    device_ioctl(&dev, MASTER, &mut req).unwrap();

    let table = attr_show(&dev, DeviceAttr::RidFilterTable).unwrap();
    assert!(table.contains("[ 2] assignment=0xff"), "table: {}", table);
}

// =============================================================================
// Cascading teardown
// =============================================================================

#[test]
fn test_queue_disable_tears_down_mappings() {
    let (dev, _sim, _platform) = enabled_device();

    let mut request = mapping_request(0, 2, prot::READ);
    request.peer_rid_address = 0x0420;
    request.peer_rid_mask = 0xFF;
    let mut req = AccelRequest::AllocateDirectMapping(request);
    device_ioctl(&dev, MASTER, &mut req).unwrap();
    let mut req = AccelRequest::AllocateDirectMapping(mapping_request(2, 2, prot::READ));
    device_ioctl(&dev, MASTER, &mut req).unwrap();

    let mut req = AccelRequest::DisableQueueCtx { name: name("q0") };
    device_ioctl(&dev, MASTER, &mut req).unwrap();

    assert!(dev.queue(0).mappings.lock().is_empty());
    let table = attr_show(&dev, DeviceAttr::RidFilterTable).unwrap();
    assert!(table.contains("[ 2] assignment=0xff"), "table: {}", table);
}

// =============================================================================
// Shareable buffers
// =============================================================================

#[test]
fn test_shared_buffer_revoked_with_mapping() {
    let (dev, _sim, _platform) = enabled_device();

    let request = mapping_request(0, 4, prot::READ | prot::WRITE);
    let mut req = AccelRequest::AllocateDirectMapping(request);
    device_ioctl(&dev, MASTER, &mut req).unwrap();

    let buf = create_shared_buffer(
        &dev,
        MASTER,
        &request,
        DRAM_CHUNK_BYTES,
        DRAM_CHUNK_BYTES,
        0,
    )
    .unwrap();
    assert!(!buf.is_revoked());
    assert_ne!(buf.mmap_offset, 0);

    let mut req = AccelRequest::DeallocateDirectMapping(request);
    device_ioctl(&dev, MASTER, &mut req).unwrap();
    assert!(buf.is_revoked());
}

#[test]
fn test_shared_buffer_range_validation() {
    let (dev, _sim, _platform) = enabled_device();

    let request = mapping_request(0, 2, prot::READ);
    let mut req = AccelRequest::AllocateDirectMapping(request);
    device_ioctl(&dev, MASTER, &mut req).unwrap();

    // offset + size beyond the mapping.
    assert_eq!(
        create_shared_buffer(
            &dev,
            MASTER,
            &request,
            DRAM_CHUNK_BYTES,
            2 * DRAM_CHUNK_BYTES,
            0
        )
        .err(),
        Some(AccelError::InvalidArgument)
    );

    // No such mapping.
    assert_eq!(
        create_shared_buffer(&dev, MASTER, &mapping_request(4, 2, prot::READ), 0, 1, 0)
            .err(),
        Some(AccelError::NotFound)
    );
}

// =============================================================================
// Mappable-region enumeration
// =============================================================================

#[test]
fn test_firmware_bar_regions_by_entitlement() {
    let (dev, _sim, _platform) = enabled_device();
    dev.open(WORKER, false);

    // Master of a top-level device sees every queue window, the global
    // window and the master window.
    let regions =
        nexa_accel::mapping::get_mappable_regions(&dev, MASTER, 0).unwrap();
    assert_eq!(regions.len(), dev.queue_count() + 2);

    // A bystander sees only the shared global window.
    let regions =
        nexa_accel::mapping::get_mappable_regions(&dev, WORKER, 0).unwrap();
    assert_eq!(regions.len(), 1);
}

#[test]
fn test_dram_bar_regions() {
    let (dev, _sim, _platform) = enabled_device();

    // No direct mappings and unprivileged: nothing.
    let regions =
        nexa_accel::mapping::get_mappable_regions(&dev, MASTER, SIM_DRAM_BAR).unwrap();
    assert!(regions.is_empty());

    // Privileged callers get the raw BAR.
    let admin = Caller::privileged(999);
    let regions =
        nexa_accel::mapping::get_mappable_regions(&dev, admin, SIM_DRAM_BAR).unwrap();
    assert_eq!(regions.len(), 1);

    // With a direct mapping, the owner sees exactly that window.
    let mut req = AccelRequest::AllocateDirectMapping(mapping_request(0, 2, prot::READ));
    device_ioctl(&dev, MASTER, &mut req).unwrap();
    let regions =
        nexa_accel::mapping::get_mappable_regions(&dev, MASTER, SIM_DRAM_BAR).unwrap();
    assert_eq!(regions.len(), 1);
    assert_eq!(regions[0].length_bytes, 2 * DRAM_CHUNK_BYTES);
}

#[test]
fn test_mapping_rejected_on_dead_device() {
    let (dev, sim, _platform) = enabled_device();

    dev.set_timeout_scaling(1);
    sim.set_stall_ddr(true);
    let mut req = AccelRequest::AllocateQueueCtx(QueueCtxConfig {
        name: name("q1"),
        priority: 0,
        dram_chunks: 1,
        index: -1,
    });
    assert_eq!(device_ioctl(&dev, MASTER, &mut req), Err(AccelError::Io));

    let mut req = AccelRequest::AllocateDirectMapping(mapping_request(0, 1, prot::READ));
    assert_eq!(device_ioctl(&dev, MASTER, &mut req), Err(AccelError::Io));
}
