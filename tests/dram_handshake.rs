//! DRAM chunk handshake tests: ledger accounting, firmware status mapping,
//! timeout fail-stop and teardown cancellation.

use nexa_accel::device::DdrStatus;
use nexa_accel::error::AccelError;
use nexa_accel::framework::{Caller, DeviceStatus};
use nexa_accel::ioctl::{device_ioctl, AccelRequest};
use nexa_accel::queue::QueueCtxConfig;
use nexa_accel::sim::{name, sim_device};

const MASTER: Caller = Caller::new(100);

fn alloc_config(ctx_name: &str, chunks: u32) -> QueueCtxConfig {
    QueueCtxConfig {
        name: name(ctx_name),
        priority: 0,
        dram_chunks: chunks,
        index: -1,
    }
}

#[test]
fn test_ledger_tracks_grants_and_returns() {
    let (dev, sim, _platform) = sim_device();
    dev.open(MASTER, true);

    let mut req = AccelRequest::AllocateQueueCtx(alloc_config("a", 10));
    device_ioctl(&dev, MASTER, &mut req).unwrap();
    let mut req = AccelRequest::AllocateQueueCtx(alloc_config("b", 20));
    device_ioctl(&dev, MASTER, &mut req).unwrap();

    assert_eq!(dev.allocated_chunk_count(), 30);
    assert!(dev.allocated_chunk_count() <= dev.reserved_chunk_count());
    assert_eq!(
        sim.available_chunks(),
        nexa_accel::sim::SIM_TOTAL_CHUNKS as u64 - 30
    );

    let mut req = AccelRequest::DeallocateQueueCtx { name: name("a") };
    device_ioctl(&dev, MASTER, &mut req).unwrap();

    assert_eq!(dev.allocated_chunk_count(), 20);
    assert_eq!(
        sim.available_chunks(),
        nexa_accel::sim::SIM_TOTAL_CHUNKS as u64 - 20
    );
}

#[test]
fn test_insufficient_chunks_leaves_ledger_untouched() {
    let (dev, sim, _platform) = sim_device();
    dev.open(MASTER, true);

    sim.force_ddr_status(Some(DdrStatus::NotEnoughAvailable));

    let mut req = AccelRequest::AllocateQueueCtx(alloc_config("a", 10));
    assert_eq!(
        device_ioctl(&dev, MASTER, &mut req),
        Err(AccelError::NoMemory)
    );

    assert_eq!(dev.allocated_chunk_count(), 0);
    assert!(!dev.queue(0).state.lock().allocated);
    assert_eq!(dev.status(), DeviceStatus::Alive);
}

#[test]
fn test_status_code_mapping() {
    let cases = [
        (DdrStatus::TooLarge, AccelError::InvalidArgument),
        (DdrStatus::QueueNotDisabled, AccelError::Busy),
        (DdrStatus::InvalidRequestType, AccelError::InvalidArgument),
        (DdrStatus::ChunkAlreadyReserved, AccelError::NoMemory),
    ];

    for (status, expected) in cases {
        let (dev, sim, _platform) = sim_device();
        dev.open(MASTER, true);
        sim.force_ddr_status(Some(status));

        let mut req = AccelRequest::AllocateQueueCtx(alloc_config("a", 10));
        assert_eq!(device_ioctl(&dev, MASTER, &mut req), Err(expected));
        assert_eq!(dev.allocated_chunk_count(), 0);
    }
}

#[test]
fn test_handshake_timeout_marks_device_dead() {
    let (dev, sim, _platform) = sim_device();
    dev.open(MASTER, true);

    // Virtual clock: drop the fake-hardware scaling so the poll budget is
    // thousands of samples, not millions.
    dev.set_timeout_scaling(1);
    sim.set_stall_ddr(true);

    let mut req = AccelRequest::AllocateQueueCtx(alloc_config("a", 10));
    assert_eq!(device_ioctl(&dev, MASTER, &mut req), Err(AccelError::Io));
    assert_eq!(dev.status(), DeviceStatus::Dead);

    // Every subsequent mutating request short-circuits.
    sim.set_stall_ddr(false);
    let mut req = AccelRequest::AllocateQueueCtx(alloc_config("b", 1));
    assert_eq!(device_ioctl(&dev, MASTER, &mut req), Err(AccelError::Io));
    let mut req = AccelRequest::EnableQueueCtx(alloc_config("a", 0));
    assert_eq!(device_ioctl(&dev, MASTER, &mut req), Err(AccelError::Io));
}

#[test]
fn test_driver_exit_cancels_inflight_wait() {
    let (dev, sim, _platform) = sim_device();
    dev.open(MASTER, true);

    dev.set_timeout_scaling(1);
    sim.set_stall_ddr(true);
    dev.set_driver_exit();

    let mut req = AccelRequest::AllocateQueueCtx(alloc_config("a", 10));
    assert_eq!(
        device_ioctl(&dev, MASTER, &mut req),
        Err(AccelError::Canceled)
    );

    // Cancellation is not a hardware fault.
    assert_eq!(dev.status(), DeviceStatus::DriverExit);
}

#[test]
fn test_reset_revives_dead_device() {
    let (dev, sim, _platform) = sim_device();
    dev.open(MASTER, true);

    dev.set_timeout_scaling(1);
    sim.set_stall_ddr(true);
    let mut req = AccelRequest::AllocateQueueCtx(alloc_config("a", 10));
    assert_eq!(device_ioctl(&dev, MASTER, &mut req), Err(AccelError::Io));
    assert_eq!(dev.status(), DeviceStatus::Dead);

    sim.set_stall_ddr(false);
    sim.complete_stalled();
    dev.reset(MASTER).unwrap();
    assert_eq!(dev.status(), DeviceStatus::Alive);

    let mut req = AccelRequest::AllocateQueueCtx(alloc_config("a", 5));
    device_ioctl(&dev, MASTER, &mut req).unwrap();
}
