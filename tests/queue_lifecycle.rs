//! Queue-context lifecycle tests against the simulated device.
//!
//! Exercises the Free -> Allocated -> Enabled -> Allocated -> Free cycle
//! through the control-request dispatcher, plus its boundary and
//! permission failures.

use nexa_accel::error::AccelError;
use nexa_accel::framework::{Caller, NO_CLIENT};
use nexa_accel::ioctl::{device_ioctl, AccelRequest};
use nexa_accel::queue::QueueCtxConfig;
use nexa_accel::sim::{name, sim_device};

const MASTER: Caller = Caller::new(100);
const WORKER: Caller = Caller::new(200);

fn alloc_config(ctx_name: &str, priority: i32, chunks: u32) -> QueueCtxConfig {
    QueueCtxConfig {
        name: name(ctx_name),
        priority,
        dram_chunks: chunks,
        index: -1,
    }
}

// =============================================================================
// Round trip
// =============================================================================

#[test]
fn test_allocate_enable_disable_deallocate_round_trip() {
    let (dev, _sim, _platform) = sim_device();
    dev.open(MASTER, true);

    let mut req = AccelRequest::AllocateQueueCtx(alloc_config("q0", 3, 10));
    device_ioctl(&dev, MASTER, &mut req).unwrap();

    {
        let state = dev.queue(0).state.lock();
        assert!(state.allocated);
        assert_eq!(state.name_str(), "q0");
        assert_eq!(state.priority, 3);
        assert_eq!(state.dram_chunks, 10);
        assert_eq!(state.owner, NO_CLIENT);
    }
    assert_eq!(dev.allocated_chunk_count(), 10);

    let mut req = AccelRequest::EnableQueueCtx(alloc_config("q0", 0, 0));
    device_ioctl(&dev, MASTER, &mut req).unwrap();
    match &req {
        AccelRequest::EnableQueueCtx(config) => {
            assert_eq!(config.index, 0);
            assert_eq!(config.dram_chunks, 10);
        }
        _ => unreachable!(),
    }
    assert_eq!(dev.queue(0).state.lock().owner, MASTER.id);

    let mut req = AccelRequest::DisableQueueCtx { name: name("q0") };
    device_ioctl(&dev, MASTER, &mut req).unwrap();
    assert_eq!(dev.queue(0).state.lock().owner, NO_CLIENT);

    let mut req = AccelRequest::DeallocateQueueCtx { name: name("q0") };
    device_ioctl(&dev, MASTER, &mut req).unwrap();

    // Back to unallocated defaults.
    let state = dev.queue(0).state.lock();
    assert!(!state.allocated);
    assert_eq!(state.name_str(), "");
    assert_eq!(state.priority, 0);
    assert_eq!(state.dram_chunks, 0);
    assert_eq!(state.owner, NO_CLIENT);
    drop(state);
    assert_eq!(dev.allocated_chunk_count(), 0);
}

#[test]
fn test_owner_implies_allocated_through_lifecycle() {
    let (dev, _sim, _platform) = sim_device();
    dev.open(MASTER, true);

    let mut req = AccelRequest::AllocateQueueCtx(alloc_config("q0", 1, 4));
    device_ioctl(&dev, MASTER, &mut req).unwrap();
    let mut req = AccelRequest::EnableQueueCtx(alloc_config("q0", 0, 0));
    device_ioctl(&dev, MASTER, &mut req).unwrap();

    for queue_index in 0..dev.queue_count() {
        let state = dev.queue(queue_index).state.lock();
        if state.owner != NO_CLIENT {
            assert!(state.allocated);
        }
    }
}

// =============================================================================
// Idempotence and mutual exclusion
// =============================================================================

#[test]
fn test_disable_already_disabled_is_noop() {
    let (dev, _sim, _platform) = sim_device();
    dev.open(MASTER, true);

    let mut req = AccelRequest::AllocateQueueCtx(alloc_config("q0", 0, 2));
    device_ioctl(&dev, MASTER, &mut req).unwrap();
    let mut req = AccelRequest::AllocateQueueCtx(alloc_config("q1", 0, 2));
    device_ioctl(&dev, MASTER, &mut req).unwrap();
    let mut req = AccelRequest::EnableQueueCtx(alloc_config("q1", 0, 0));
    device_ioctl(&dev, MASTER, &mut req).unwrap();

    // q0 was never enabled; disabling it succeeds and changes nothing else.
    let mut req = AccelRequest::DisableQueueCtx { name: name("q0") };
    device_ioctl(&dev, MASTER, &mut req).unwrap();

    assert!(dev.queue(0).state.lock().allocated);
    assert_eq!(dev.queue(1).state.lock().owner, MASTER.id);
}

#[test]
fn test_second_enable_observes_busy() {
    let (dev, _sim, _platform) = sim_device();
    dev.open(MASTER, true);
    dev.open(WORKER, false);

    let mut req = AccelRequest::AllocateQueueCtx(alloc_config("q0", 2, 4));
    device_ioctl(&dev, MASTER, &mut req).unwrap();

    let mut req = AccelRequest::EnableQueueCtx(alloc_config("q0", 0, 0));
    device_ioctl(&dev, MASTER, &mut req).unwrap();

    let mut req = AccelRequest::EnableQueueCtx(alloc_config("q0", 0, 0));
    assert_eq!(
        device_ioctl(&dev, WORKER, &mut req),
        Err(AccelError::Busy)
    );
}

#[test]
fn test_deallocate_free_slot_succeeds() {
    let (dev, _sim, _platform) = sim_device();
    dev.open(MASTER, true);

    let mut req = AccelRequest::AllocateQueueCtx(alloc_config("q0", 0, 1));
    device_ioctl(&dev, MASTER, &mut req).unwrap();
    let mut req = AccelRequest::DeallocateQueueCtx { name: name("q0") };
    device_ioctl(&dev, MASTER, &mut req).unwrap();

    // The name is gone with the allocation.
    let mut req = AccelRequest::DeallocateQueueCtx { name: name("q0") };
    assert_eq!(
        device_ioctl(&dev, MASTER, &mut req),
        Err(AccelError::NotFound)
    );
}

// =============================================================================
// Boundaries and permissions
// =============================================================================

#[test]
fn test_priority_boundaries() {
    let (dev, _sim, _platform) = sim_device();
    dev.open(MASTER, true);

    let mut req = AccelRequest::AllocateQueueCtx(alloc_config("bad-low", -1, 1));
    assert_eq!(
        device_ioctl(&dev, MASTER, &mut req),
        Err(AccelError::InvalidArgument)
    );

    let mut req = AccelRequest::AllocateQueueCtx(alloc_config("bad-high", 8, 1));
    assert_eq!(
        device_ioctl(&dev, MASTER, &mut req),
        Err(AccelError::InvalidArgument)
    );

    let mut req = AccelRequest::AllocateQueueCtx(alloc_config("low", 0, 1));
    device_ioctl(&dev, MASTER, &mut req).unwrap();
    let mut req = AccelRequest::AllocateQueueCtx(alloc_config("high", 7, 1));
    device_ioctl(&dev, MASTER, &mut req).unwrap();
}

#[test]
fn test_chunk_count_above_per_queue_maximum_rejected() {
    let (dev, _sim, _platform) = sim_device();
    dev.open(MASTER, true);

    let mut req = AccelRequest::AllocateQueueCtx(alloc_config(
        "big",
        0,
        nexa_accel::sim::SIM_MAX_CHUNKS_PER_QUEUE as u32 + 1,
    ));
    assert_eq!(
        device_ioctl(&dev, MASTER, &mut req),
        Err(AccelError::InvalidArgument)
    );

    // The failed allocate released its slot claim.
    assert!(!dev.queue(0).state.lock().allocated);
}

#[test]
fn test_allocate_requires_device_ownership() {
    let (dev, _sim, _platform) = sim_device();
    dev.open(MASTER, true);
    dev.open(WORKER, false);

    let mut req = AccelRequest::AllocateQueueCtx(alloc_config("q0", 0, 1));
    assert_eq!(
        device_ioctl(&dev, WORKER, &mut req),
        Err(AccelError::PermissionDenied)
    );
}

#[test]
fn test_disable_permission_rules() {
    let (dev, _sim, _platform) = sim_device();
    dev.open(MASTER, true);
    dev.open(WORKER, false);

    let mut req = AccelRequest::AllocateQueueCtx(alloc_config("q0", 0, 1));
    device_ioctl(&dev, MASTER, &mut req).unwrap();
    let mut req = AccelRequest::EnableQueueCtx(alloc_config("q0", 0, 0));
    device_ioctl(&dev, MASTER, &mut req).unwrap();

    // A bystander may not disable the master's queue.
    let mut req = AccelRequest::DisableQueueCtx { name: name("q0") };
    assert_eq!(
        device_ioctl(&dev, WORKER, &mut req),
        Err(AccelError::PermissionDenied)
    );

    // The master may disable anyone's queue: worker enables, master
    // disables.
    let mut req = AccelRequest::DisableQueueCtx { name: name("q0") };
    device_ioctl(&dev, MASTER, &mut req).unwrap();
    let mut req = AccelRequest::EnableQueueCtx(alloc_config("q0", 0, 0));
    device_ioctl(&dev, WORKER, &mut req).unwrap();
    let mut req = AccelRequest::DisableQueueCtx { name: name("q0") };
    device_ioctl(&dev, MASTER, &mut req).unwrap();
    assert_eq!(dev.queue(0).state.lock().owner, NO_CLIENT);
}

#[test]
fn test_failed_queue_skipped_and_rejected() {
    let (dev, sim, _platform) = sim_device();
    dev.open(MASTER, true);

    sim.fail_queue(0);

    let mut req = AccelRequest::AllocateQueueCtx(alloc_config("q0", 0, 1));
    device_ioctl(&dev, MASTER, &mut req).unwrap();

    // The failed slot 0 was skipped by find-free.
    assert!(!dev.queue(0).state.lock().allocated);
    assert!(dev.queue(1).state.lock().allocated);
}

#[test]
fn test_queue_pool_exhaustion() {
    let (dev, _sim, _platform) = sim_device();
    dev.open(MASTER, true);

    for i in 0..dev.queue_count() {
        let mut req =
            AccelRequest::AllocateQueueCtx(alloc_config(&format!("q{}", i), 0, 1));
        device_ioctl(&dev, MASTER, &mut req).unwrap();
    }

    let mut req = AccelRequest::AllocateQueueCtx(alloc_config("overflow", 0, 1));
    assert_eq!(
        device_ioctl(&dev, MASTER, &mut req),
        Err(AccelError::NoMemory)
    );
}
