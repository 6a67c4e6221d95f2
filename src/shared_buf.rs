//! Shareable buffer handles exported from a direct mapping.
//!
//! A queue owner can hand a sub-range of one of its direct mappings to
//! another subsystem as an opaque buffer handle. The handle stays attached
//! to the mapping; tearing the mapping down (explicitly, or through queue
//! disable) revokes every attached handle before the window disappears, so
//! importers never observe a live handle over dead device memory.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, Ordering};

use crate::device::AccelDevice;
use crate::error::{AccelError, Result};
use crate::framework::Caller;
use crate::mapping::DirectMappingRequest;
use crate::{aerror, ainfo};

/// An exported buffer over `[offset, offset+size)` of a direct mapping.
pub struct SharedBuffer {
    pub queue_index: usize,
    /// Byte offset within the backing direct mapping.
    pub offset: u64,
    pub size: u64,
    pub flags: u32,
    /// Device-absolute mmap cookie of the backing storage.
    pub mmap_offset: u64,
    revoked: AtomicBool,
}

impl SharedBuffer {
    /// Has the backing mapping been torn down underneath this handle?
    pub fn is_revoked(&self) -> bool {
        self.revoked.load(Ordering::Acquire)
    }

    /// Move-notify: the backing storage is going away.
    pub(crate) fn revoke(&self) {
        self.revoked.store(true, Ordering::Release);
    }
}

/// Export `[offset, offset+size)` of the direct mapping matching
/// `request` as a shareable buffer handle.
pub fn create_shared_buffer(
    dev: &AccelDevice,
    caller: Caller,
    request: &DirectMappingRequest,
    offset: u64,
    size: u64,
    flags: u32,
) -> Result<Arc<SharedBuffer>> {
    if request.queue_index >= dev.desc.queue_ctx_count {
        return Err(AccelError::InvalidArgument);
    }
    let queue = &dev.queues[request.queue_index];

    let state = queue.state.lock();
    let mut mappings = queue.mappings.lock();

    if !state.allocated || state.owner != caller.id {
        aerror!(
            "ACCEL/SharedBuf: Queue {} is not enabled and owned by the process",
            request.queue_index
        );
        return Err(AccelError::InvalidArgument);
    }

    let mapping = mappings
        .iter_mut()
        .find(|mapping| {
            mapping.request.bar == request.bar
                && mapping.request.base == request.base
                && mapping.request.size == request.size
                && mapping.request.prot == request.prot
                && mapping.request.peer_rid_address == request.peer_rid_address
                && mapping.request.peer_rid_mask == request.peer_rid_mask
        })
        .ok_or_else(|| {
            aerror!(
                "ACCEL/SharedBuf: No direct mapping for queue {} matches the request",
                request.queue_index
            );
            AccelError::NotFound
        })?;

    if offset + size > mapping.request.size {
        aerror!(
            "ACCEL/SharedBuf: Invalid offset and size ({:#x}, {:#x}) for shared buffer \
             backing storage.",
            offset,
            size
        );
        return Err(AccelError::InvalidArgument);
    }

    let buf = Arc::new(SharedBuffer {
        queue_index: request.queue_index,
        offset,
        size,
        flags,
        mmap_offset: mapping.request.mmap_offset + offset,
        revoked: AtomicBool::new(false),
    });
    mapping.shared_bufs.push(buf.clone());

    ainfo!(
        "ACCEL/SharedBuf: Queue {} exported [{:#x}, {:#x}) of BAR{} mapping {:#x}",
        request.queue_index,
        offset,
        offset + size,
        request.bar,
        mapping.request.base
    );

    Ok(buf)
}
