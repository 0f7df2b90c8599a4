pub mod config;
pub mod device;
pub mod engine;
pub mod error;
mod keymap;
mod memory;
mod queue;
mod reduce;
pub mod types;
pub mod updater;

pub use config::{EngineConfig, ThreadMode};
#[cfg(feature = "cuda")]
pub use device::CudaRuntime;
pub use device::{CopyKind, CpuRuntime, DeviceRuntime, StreamHandle};
pub use engine::{LocalEngine, PullCallback};
pub use error::{GradBusError, Result};
pub use types::{DataType, DeviceId, Key, Priority, PushOp, Shape2, TensorView};
pub use updater::{ModelUpdater, SgdUpdater, UpdaterFactory};
