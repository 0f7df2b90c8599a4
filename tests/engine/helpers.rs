use std::sync::Arc;

use gradbus::{CpuRuntime, DataType, DeviceId, LocalEngine, Shape2, TensorView};

/// Build an initialized engine over the CPU runtime, applying `params`
/// before `init`.
pub fn engine_with_params(devices: &[DeviceId], params: &[(&str, &str)]) -> LocalEngine {
    let mut engine = LocalEngine::new(Arc::new(CpuRuntime::new()));
    for (name, value) in params {
        engine.set_param(name, value);
    }
    engine.init(devices);
    engine
}

pub fn engine(devices: &[DeviceId]) -> LocalEngine {
    engine_with_params(devices, &[])
}

/// f32 view over a push source buffer.
pub fn view(data: &[f32], rows: usize, cols: usize) -> TensorView {
    assert_eq!(data.len(), rows * cols);
    unsafe { TensorView::new(data.as_ptr() as u64, Shape2::new(rows, cols), DataType::F32) }
}

/// f32 view over a pull destination buffer.
pub fn view_mut(data: &mut [f32], rows: usize, cols: usize) -> TensorView {
    assert_eq!(data.len(), rows * cols);
    unsafe {
        TensorView::new(
            data.as_mut_ptr() as u64,
            Shape2::new(rows, cols),
            DataType::F32,
        )
    }
}
