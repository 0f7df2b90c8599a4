//! RAII wrapper for engine-owned host staging memory.

use std::sync::Arc;

use crate::device::DeviceRuntime;
use crate::error::Result;

/// An engine-owned host allocation obtained from a [`DeviceRuntime`].
///
/// Holds the raw pointer plus everything needed to free it. Push and
/// pull workers address disjoint regions of a buffer concurrently
/// through raw pointers; the rendezvous bookkeeping guarantees the
/// regions never overlap while in use.
pub(crate) struct HostBuffer {
    ptr: u64,
    len_bytes: usize,
    pinned: bool,
    runtime: Arc<dyn DeviceRuntime>,
}

// The buffer is plain memory; which thread touches which region is
// coordinated by the engine's per-key state machines.
unsafe impl Send for HostBuffer {}
unsafe impl Sync for HostBuffer {}

impl HostBuffer {
    /// Allocate `len_bytes` of zero-initialized host memory.
    pub fn alloc(runtime: Arc<dyn DeviceRuntime>, len_bytes: usize, pinned: bool) -> Result<Self> {
        let ptr = runtime.alloc_host(len_bytes, pinned)?;
        Ok(Self {
            ptr,
            len_bytes,
            pinned,
            runtime,
        })
    }

    /// Raw pointer to the first byte.
    pub fn as_u64(&self) -> u64 {
        self.ptr
    }

    pub fn len_bytes(&self) -> usize {
        self.len_bytes
    }
}

impl Drop for HostBuffer {
    fn drop(&mut self) {
        unsafe {
            self.runtime.free_host(self.ptr, self.len_bytes, self.pinned);
        }
    }
}

impl std::fmt::Debug for HostBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "HostBuffer(0x{:x}, {}B{})",
            self.ptr,
            self.len_bytes,
            if self.pinned { ", pinned" } else { "" }
        )
    }
}
