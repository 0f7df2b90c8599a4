//! CUDA device runtime for multi-GPU hosts.
//!
//! Uses cudarc 0.19. One retained context per device; copy streams are
//! created and destroyed by the worker threads that own them, and host
//! staging buffers may be page-locked for full-speed async copies.

#![cfg(feature = "cuda")]

use std::collections::HashMap;
use std::sync::Arc;

use cudarc::driver::{result, sys, CudaContext};

use crate::device::adapter::{CopyKind, DeviceRuntime, StreamHandle};
use crate::error::{GradBusError, Result};
use crate::types::DeviceId;

/// DeviceRuntime over NVIDIA GPUs.
pub struct CudaRuntime {
    contexts: HashMap<DeviceId, Arc<CudaContext>>,
}

impl CudaRuntime {
    /// Create a runtime holding one CUDA context per device ordinal.
    pub fn new(devices: &[DeviceId]) -> Result<Self> {
        let mut contexts = HashMap::new();
        for &devid in devices {
            let ctx = CudaContext::new(devid as usize).map_err(|e| {
                GradBusError::runtime_with_source(
                    format!("failed to create CUDA context for GPU {devid}"),
                    e,
                )
            })?;
            contexts.insert(devid, ctx);
        }
        Ok(Self { contexts })
    }

    fn context(&self, devid: DeviceId) -> Result<&Arc<CudaContext>> {
        self.contexts
            .get(&devid)
            .ok_or_else(|| GradBusError::runtime(format!("no CUDA context for device {devid}")))
    }
}

impl DeviceRuntime for CudaRuntime {
    fn bind_device(&self, devid: DeviceId) -> Result<()> {
        self.context(devid)?
            .bind_to_thread()
            .map_err(|e| GradBusError::runtime_with_source("CUDA bind_to_thread failed", e))
    }

    fn alloc_host(&self, len_bytes: usize, pinned: bool) -> Result<u64> {
        if !pinned {
            // Pageable path shares the plain host allocator.
            return crate::device::cpu::CpuRuntime::new().alloc_host(len_bytes, false);
        }
        let ptr = unsafe { result::malloc_host(len_bytes.max(1), 0) }
            .map_err(|e| GradBusError::runtime_with_source("cuMemHostAlloc failed", e))?;
        unsafe { std::ptr::write_bytes(ptr as *mut u8, 0, len_bytes) };
        Ok(ptr as u64)
    }

    unsafe fn free_host(&self, ptr: u64, len_bytes: usize, pinned: bool) {
        if !pinned {
            unsafe {
                crate::device::cpu::CpuRuntime::new().free_host(ptr, len_bytes, false);
            }
            return;
        }
        if let Err(e) = unsafe { result::free_host(ptr as *mut std::ffi::c_void) } {
            tracing::warn!("cuMemFreeHost failed: {e}");
        }
    }

    fn new_stream(&self, devid: DeviceId) -> Result<StreamHandle> {
        self.bind_device(devid)?;
        let stream = result::stream::create(result::stream::StreamKind::NonBlocking)
            .map_err(|e| GradBusError::runtime_with_source("cuStreamCreate failed", e))?;
        Ok(stream as u64)
    }

    fn delete_stream(&self, devid: DeviceId, stream: StreamHandle) {
        if self.bind_device(devid).is_err() {
            return;
        }
        if let Err(e) = unsafe { result::stream::destroy(stream as sys::CUstream) } {
            tracing::warn!(devid, "cuStreamDestroy failed: {e}");
        }
    }

    unsafe fn copy(
        &self,
        dst: u64,
        src: u64,
        len_bytes: usize,
        kind: CopyKind,
        stream: StreamHandle,
    ) -> Result<()> {
        let stream = stream as sys::CUstream;
        match kind {
            CopyKind::HostToDevice => {
                let host = unsafe { std::slice::from_raw_parts(src as *const u8, len_bytes) };
                unsafe {
                    result::memcpy_htod_async(dst as sys::CUdeviceptr, host, stream)
                }
                .map_err(|e| GradBusError::runtime_with_source("cuMemcpyHtoDAsync failed", e))
            }
            CopyKind::DeviceToHost => {
                let host = unsafe { std::slice::from_raw_parts_mut(dst as *mut u8, len_bytes) };
                unsafe {
                    result::memcpy_dtoh_async(host, src as sys::CUdeviceptr, stream)
                }
                .map_err(|e| GradBusError::runtime_with_source("cuMemcpyDtoHAsync failed", e))
            }
        }
    }

    fn stream_wait(&self, stream: StreamHandle) -> Result<()> {
        unsafe { result::stream::synchronize(stream as sys::CUstream) }
            .map_err(|e| GradBusError::runtime_with_source("cuStreamSynchronize failed", e))
    }
}
