//! Observability attribute rendering and the role-based permission tables
//! for generic framework requests.

use nexa_accel::attrs::{
    attr_show, attr_show_binary, attr_store, attrs_for_device, DeviceAttr,
};
use nexa_accel::device::DeviceMode;
use nexa_accel::error::AccelError;
use nexa_accel::framework::Caller;
use nexa_accel::ioctl::{
    check_framework_request_permission, device_ioctl, AccelRequest, FrameworkRequest,
    PriorityAlgorithmConfig,
};
use nexa_accel::mapping::owns_page_table;
use nexa_accel::overseer::ReservationRequest;
use nexa_accel::queue::QueueCtxConfig;
use nexa_accel::sim::{name, sim_device, SIM_NUM_INTERRUPTS, SIM_TOTAL_CHUNKS};

const MASTER: Caller = Caller::new(100);
const WORKER: Caller = Caller::new(200);
const SUB_MASTER: Caller = Caller::new(300);

// =============================================================================
// Attributes
// =============================================================================

#[test]
fn test_hardware_flavor_and_timeout_scaling() {
    let (dev, _sim, _platform) = sim_device();

    // The sim reports fake hardware, which scales timeouts up.
    assert_eq!(attr_show(&dev, DeviceAttr::IsRealHardware).unwrap(), "0\n");
    assert_eq!(
        attr_show(&dev, DeviceAttr::TimeoutScaling).unwrap(),
        "1000\n"
    );

    attr_store(&dev, DeviceAttr::TimeoutScaling, "5\n").unwrap();
    assert_eq!(attr_show(&dev, DeviceAttr::TimeoutScaling).unwrap(), "5\n");

    assert_eq!(
        attr_store(&dev, DeviceAttr::TimeoutScaling, "fast"),
        Err(AccelError::InvalidArgument)
    );
}

#[test]
fn test_pcie_mrrs_validation() {
    let (dev, _sim, _platform) = sim_device();

    assert_eq!(attr_show(&dev, DeviceAttr::PcieMrrs).unwrap(), "512\n");

    attr_store(&dev, DeviceAttr::PcieMrrs, "256").unwrap();
    assert_eq!(attr_show(&dev, DeviceAttr::PcieMrrs).unwrap(), "256\n");

    for bad in ["300", "64", "8192", "words"] {
        assert_eq!(
            attr_store(&dev, DeviceAttr::PcieMrrs, bad),
            Err(AccelError::InvalidArgument)
        );
    }
}

#[test]
fn test_rid_filter_attrs() {
    let (dev, _sim, _platform) = sim_device();

    let status = attr_show(&dev, DeviceAttr::RidFilterStatus).unwrap();
    assert!(status.starts_with("enabled\n"), "status: {}", status);
    assert!(status.contains("read  : faulted=0"));
    assert!(status.contains("write : faulted=0"));

    let table = attr_show(&dev, DeviceAttr::RidFilterTable).unwrap();
    // The two reserved windows, then free slots.
    assert!(table.contains("[ 0] assignment=0xfe"));
    assert!(table.contains("[ 1] assignment=0xfe"));
    assert!(table.contains("[ 2] assignment=0xff"));
}

#[test]
fn test_subcontainer_attrs() {
    let (dev, _sim, _platform) = sim_device();
    dev.open(MASTER, true);

    let summary = attr_show(&dev, DeviceAttr::Subcontainers).unwrap();
    assert_eq!(summary, "n/a\nn/a\n");
    assert_eq!(attr_show(&dev, DeviceAttr::SubcontainerId).unwrap(), "-1\n");

    let mut req = AccelRequest::OverseerSetMode(DeviceMode::Overseer);
    device_ioctl(&dev, MASTER, &mut req).unwrap();
    let mut req = AccelRequest::OverseerReserveResources(ReservationRequest {
        subcontainer_index: 0,
        num_queues: 4,
        num_chunks: 100,
    });
    device_ioctl(&dev, MASTER, &mut req).unwrap();

    let summary = attr_show(&dev, DeviceAttr::Subcontainers).unwrap();
    let first_line = summary.lines().next().unwrap();
    assert!(
        first_line.starts_with("accel0.sub0 0/100 0,1,2,3"),
        "summary: {}",
        summary
    );

    let sub = dev.subcontainer(0).unwrap();
    assert_eq!(attr_show(&sub, DeviceAttr::SubcontainerId).unwrap(), "0\n");
}

#[test]
fn test_chunk_map_attr_node() {
    let (dev, _sim, _platform) = sim_device();

    let raw = attr_show_binary(&dev, DeviceAttr::SubcontainerMemory(0)).unwrap();
    assert_eq!(raw.len(), SIM_TOTAL_CHUNKS + 1);
    assert!(raw[..SIM_TOTAL_CHUNKS].iter().all(|&b| b == 0xFF));
    assert_eq!(raw[SIM_TOTAL_CHUNKS], b'\n');

    assert_eq!(
        attr_show_binary(&dev, DeviceAttr::SubcontainerMemory(1)),
        Err(AccelError::InvalidArgument)
    );
}

#[test]
fn test_attr_sets_per_role() {
    let (dev, _sim, _platform) = sim_device();
    dev.open(MASTER, true);

    let attrs = attrs_for_device(&dev);
    assert!(attrs.contains(&DeviceAttr::RidFilterStatus));
    assert!(!attrs.contains(&DeviceAttr::Subcontainers));

    let mut req = AccelRequest::OverseerSetMode(DeviceMode::Overseer);
    device_ioctl(&dev, MASTER, &mut req).unwrap();

    let attrs = attrs_for_device(&dev);
    assert!(attrs.contains(&DeviceAttr::Subcontainers));
    assert!(attrs.contains(&DeviceAttr::SubcontainerMemory(0)));

    let sub = dev.subcontainer(0).unwrap();
    let attrs = attrs_for_device(&sub);
    assert!(attrs.contains(&DeviceAttr::SubcontainerId));
    assert!(!attrs.contains(&DeviceAttr::RidFilterStatus));
}

// =============================================================================
// Priority algorithm
// =============================================================================

#[test]
fn test_priority_algorithm_configuration() {
    let (dev, _sim, _platform) = sim_device();
    dev.open(MASTER, true);
    dev.open(WORKER, false);

    let mut req = AccelRequest::SetPriorityAlgorithm(PriorityAlgorithmConfig {
        priority: 3,
        algorithm: 1,
    });
    device_ioctl(&dev, MASTER, &mut req).unwrap();

    let mut req = AccelRequest::SetPriorityAlgorithm(PriorityAlgorithmConfig {
        priority: 8,
        algorithm: 0,
    });
    assert_eq!(
        device_ioctl(&dev, MASTER, &mut req),
        Err(AccelError::InvalidArgument)
    );

    let mut req = AccelRequest::SetPriorityAlgorithm(PriorityAlgorithmConfig {
        priority: 0,
        algorithm: 2,
    });
    assert_eq!(
        device_ioctl(&dev, MASTER, &mut req),
        Err(AccelError::InvalidArgument)
    );

    let mut req = AccelRequest::SetPriorityAlgorithm(PriorityAlgorithmConfig {
        priority: 0,
        algorithm: 0,
    });
    assert_eq!(
        device_ioctl(&dev, WORKER, &mut req),
        Err(AccelError::PermissionDenied)
    );
}

// =============================================================================
// Framework request permissions
// =============================================================================

#[test]
fn test_plain_device_permissions() {
    let (dev, _sim, _platform) = sim_device();
    dev.open(MASTER, true);
    dev.open(WORKER, false);

    // Reset and interrupt-count clearing are master-only.
    assert!(check_framework_request_permission(&dev, MASTER, &FrameworkRequest::Reset)
        .unwrap());
    assert!(
        !check_framework_request_permission(&dev, WORKER, &FrameworkRequest::Reset)
            .unwrap()
    );
    assert!(check_framework_request_permission(
        &dev,
        Caller::privileged(999),
        &FrameworkRequest::Reset
    )
    .unwrap());

    // Eventfd follows queue ownership.
    let mut req = AccelRequest::AllocateQueueCtx(QueueCtxConfig {
        name: name("q0"),
        priority: 0,
        dram_chunks: 1,
        index: -1,
    });
    device_ioctl(&dev, MASTER, &mut req).unwrap();
    let mut req = AccelRequest::EnableQueueCtx(QueueCtxConfig {
        name: name("q0"),
        priority: 0,
        dram_chunks: 0,
        index: -1,
    });
    device_ioctl(&dev, WORKER, &mut req).unwrap();

    assert!(check_framework_request_permission(
        &dev,
        WORKER,
        &FrameworkRequest::SetEventfd { interrupt: 0 }
    )
    .unwrap());
    assert!(!check_framework_request_permission(
        &dev,
        WORKER,
        &FrameworkRequest::SetEventfd { interrupt: 1 }
    )
    .unwrap());

    // The failed-codec interrupt is never claimable by a non-master.
    assert!(!check_framework_request_permission(
        &dev,
        WORKER,
        &FrameworkRequest::SetEventfd { interrupt: 8 }
    )
    .unwrap());

    // Out-of-range interrupts are malformed, not denied.
    assert_eq!(
        check_framework_request_permission(
            &dev,
            MASTER,
            &FrameworkRequest::SetEventfd {
                interrupt: SIM_NUM_INTERRUPTS
            }
        ),
        Err(AccelError::InvalidArgument)
    );

    // Buffer mapping follows queue ownership too.
    assert!(check_framework_request_permission(
        &dev,
        WORKER,
        &FrameworkRequest::MapBuffer {
            page_table_index: 0
        }
    )
    .unwrap());
    assert!(!check_framework_request_permission(
        &dev,
        WORKER,
        &FrameworkRequest::UnmapBuffer {
            page_table_index: 1
        }
    )
    .unwrap());

    // Size queries are open; partitioning is not.
    assert!(check_framework_request_permission(
        &dev,
        WORKER,
        &FrameworkRequest::PageTableSize
    )
    .unwrap());
    assert!(!check_framework_request_permission(
        &dev,
        MASTER,
        &FrameworkRequest::PartitionPageTable
    )
    .unwrap());
}

#[test]
fn test_subcontainer_permissions() {
    let (dev, _sim, _platform) = sim_device();
    dev.open(MASTER, true);

    let mut req = AccelRequest::OverseerSetMode(DeviceMode::Overseer);
    device_ioctl(&dev, MASTER, &mut req).unwrap();
    let mut req = AccelRequest::OverseerReserveResources(ReservationRequest {
        subcontainer_index: 0,
        num_queues: 2,
        num_chunks: 10,
    });
    device_ioctl(&dev, MASTER, &mut req).unwrap();

    let sub = dev.subcontainer(0).unwrap();
    sub.open(SUB_MASTER, true);

    // Overseer-level operations are always denied to subcontainers.
    assert!(!check_framework_request_permission(
        &sub,
        SUB_MASTER,
        &FrameworkRequest::Reset
    )
    .unwrap());
    assert!(!check_framework_request_permission(
        &sub,
        SUB_MASTER,
        &FrameworkRequest::ClearInterruptCounts
    )
    .unwrap());

    // Queue-scoped requests require the queue to be reserved here.
    assert!(check_framework_request_permission(
        &sub,
        SUB_MASTER,
        &FrameworkRequest::MapBuffer {
            page_table_index: 0
        }
    )
    .unwrap());
    assert!(!check_framework_request_permission(
        &sub,
        SUB_MASTER,
        &FrameworkRequest::MapBuffer {
            page_table_index: 5
        }
    )
    .unwrap());

    // Per-queue page table ownership mirrors the reservations.
    assert!(owns_page_table(&sub, 0));
    assert!(!owns_page_table(&sub, 5));
}

#[test]
fn test_overseer_permissions() {
    let (dev, _sim, _platform) = sim_device();
    dev.open(MASTER, true);

    let mut req = AccelRequest::OverseerSetMode(DeviceMode::Overseer);
    device_ioctl(&dev, MASTER, &mut req).unwrap();

    assert!(check_framework_request_permission(&dev, MASTER, &FrameworkRequest::Reset)
        .unwrap());
    assert!(!check_framework_request_permission(
        &dev,
        MASTER,
        &FrameworkRequest::SetEventfd { interrupt: 0 }
    )
    .unwrap());
    assert!(!check_framework_request_permission(
        &dev,
        MASTER,
        &FrameworkRequest::MapBuffer {
            page_table_index: 0
        }
    )
    .unwrap());

    // The overseer owns no page tables.
    assert!(!owns_page_table(&dev, 0));
}
