use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::device::adapter::{CopyKind, DeviceRuntime, StreamHandle};
use crate::error::{GradBusError, Result};
use crate::types::DeviceId;

/// Cache-line-friendly alignment for staging buffers.
const HOST_ALIGN: usize = 64;

/// DeviceRuntime over plain host memory.
///
/// "Devices" are just labels: every pointer is a host pointer, copies
/// are synchronous `memcpy`s, and streams are numbered no-ops. This is
/// the backend used by the test suite and by CPU-only deployments; the
/// engine's queueing, rendezvous, and wait discipline are identical
/// under a real GPU runtime.
#[derive(Debug, Default)]
pub struct CpuRuntime {
    next_stream: AtomicU64,
}

impl CpuRuntime {
    pub fn new() -> Self {
        Self::default()
    }
}

fn host_layout(len_bytes: usize) -> Result<Layout> {
    Layout::from_size_align(len_bytes.max(1), HOST_ALIGN)
        .map_err(|e| GradBusError::runtime_with_source("bad host allocation layout", e))
}

impl DeviceRuntime for CpuRuntime {
    fn bind_device(&self, _devid: DeviceId) -> Result<()> {
        Ok(())
    }

    fn alloc_host(&self, len_bytes: usize, _pinned: bool) -> Result<u64> {
        let layout = host_layout(len_bytes)?;
        // Zeroed allocation: freshly initialized weight buffers read as zero.
        let ptr = unsafe { alloc_zeroed(layout) };
        if ptr.is_null() {
            return Err(GradBusError::runtime(format!(
                "host allocation of {len_bytes} bytes failed"
            )));
        }
        Ok(ptr as u64)
    }

    unsafe fn free_host(&self, ptr: u64, len_bytes: usize, _pinned: bool) {
        let layout = host_layout(len_bytes).expect("layout validated at alloc time");
        unsafe { dealloc(ptr as *mut u8, layout) };
    }

    fn new_stream(&self, _devid: DeviceId) -> Result<StreamHandle> {
        // Handles start at 1 so 0 never aliases a live stream.
        Ok(self.next_stream.fetch_add(1, Ordering::Relaxed) + 1)
    }

    fn delete_stream(&self, _devid: DeviceId, _stream: StreamHandle) {}

    unsafe fn copy(
        &self,
        dst: u64,
        src: u64,
        len_bytes: usize,
        _kind: CopyKind,
        _stream: StreamHandle,
    ) -> Result<()> {
        unsafe {
            std::ptr::copy_nonoverlapping(src as *const u8, dst as *mut u8, len_bytes);
        }
        Ok(())
    }

    fn stream_wait(&self, _stream: StreamHandle) -> Result<()> {
        Ok(())
    }
}
