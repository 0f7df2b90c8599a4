use crate::error::Result;
use crate::types::DeviceId;

/// Opaque handle to a per-device copy stream.
///
/// Raw `u64` so handles can cross thread boundaries freely; only the
/// runtime that produced a handle may interpret it.
pub type StreamHandle = u64;

/// Direction of a staged copy between host and device memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyKind {
    HostToDevice,
    DeviceToHost,
}

/// Bridges the engine with the host/device memory runtime.
///
/// gradbus operates on raw `u64` pointers + byte counts. The runtime
/// owns device selection, host allocation (pinned or pageable), copy
/// streams, and the async copies the worker pools enqueue on them.
///
/// - `CpuRuntime` (built-in): plain host memory, synchronous copies,
///   no-op streams. Used for tests and CPU-only deployments.
/// - `CudaRuntime` (feature `cuda`): CUDA contexts, page-locked host
///   allocation, and real async copy streams.
pub trait DeviceRuntime: Send + Sync {
    /// Bind the calling thread to a device before touching its memory
    /// or streams.
    fn bind_device(&self, devid: DeviceId) -> Result<()>;

    /// Allocate `len_bytes` of zero-initialized host memory, page-locked
    /// when `pinned` is set. Returns the raw pointer.
    fn alloc_host(&self, len_bytes: usize, pinned: bool) -> Result<u64>;

    /// Release memory obtained from `alloc_host`.
    ///
    /// # Safety
    /// `ptr` must come from a prior `alloc_host` on this runtime with the
    /// same `len_bytes` and `pinned`, and must not be used afterwards.
    unsafe fn free_host(&self, ptr: u64, len_bytes: usize, pinned: bool);

    /// Create a copy stream on `devid`. The stream is owned by the
    /// calling thread and must be destroyed by it.
    fn new_stream(&self, devid: DeviceId) -> Result<StreamHandle>;

    /// Destroy a stream created by `new_stream`.
    fn delete_stream(&self, devid: DeviceId, stream: StreamHandle);

    /// Enqueue an async copy of `len_bytes` on `stream`.
    ///
    /// The copy may still be in flight when this returns; `stream_wait`
    /// drains it.
    ///
    /// # Safety
    /// `dst` and `src` must be valid for `len_bytes` bytes in the memory
    /// spaces implied by `kind`, non-overlapping, and must stay valid
    /// until the stream is drained.
    unsafe fn copy(
        &self,
        dst: u64,
        src: u64,
        len_bytes: usize,
        kind: CopyKind,
        stream: StreamHandle,
    ) -> Result<()>;

    /// Block until every copy enqueued on `stream` has completed.
    fn stream_wait(&self, stream: StreamHandle) -> Result<()>;
}
