pub mod adapter;
pub mod cpu;
#[cfg(feature = "cuda")]
pub mod cuda;

pub use adapter::{CopyKind, DeviceRuntime, StreamHandle};
pub use cpu::CpuRuntime;
#[cfg(feature = "cuda")]
pub use cuda::CudaRuntime;
