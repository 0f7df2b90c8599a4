//! Gradient sum across 2 simulated devices.
//!
//! Each device pushes its own contribution for one key; after the
//! rendezvous, every device pulls back the element-wise sum.
//!
//! ```bash
//! cargo run --example local_sum
//! ```

use gradbus::{CpuRuntime, DataType, LocalEngine, Shape2, TensorView};
use std::sync::Arc;
use std::thread;

fn main() {
    let devices = [0u32, 1u32];
    let mut engine = LocalEngine::new(Arc::new(CpuRuntime::new()));
    engine.init(&devices);
    let engine = Arc::new(engine);

    let shape = Shape2::new(1, 8);
    for &dev in &devices {
        engine.init_key(shape, DataType::F32, 0, dev);
    }

    // Each device fills its contribution with its own id.
    // device 0: [0.0, 0.0, ...], device 1: [1.0, 1.0, ...]
    let mut handles = Vec::new();
    for &dev in &devices {
        let engine = Arc::clone(&engine);
        handles.push(thread::spawn(move || -> Vec<f32> {
            let grad = vec![dev as f32; shape.nelem()];
            let src = unsafe { TensorView::new(grad.as_ptr() as u64, shape, DataType::F32) };
            engine.push(src, 0, dev, 0);

            let mut out = vec![0.0f32; shape.nelem()];
            let dst = unsafe { TensorView::new(out.as_mut_ptr() as u64, shape, DataType::F32) };
            engine.pull_req(dst, 0, dev, 0, None);
            engine.pull_wait(0, dev);
            out
        }));
    }

    for (dev, h) in devices.iter().zip(handles) {
        let data = h.join().unwrap();
        println!("device {dev}: {data:?}");
    }
    // Output (all devices identical):
    // device 0: [1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0]
    // device 1: [1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0]
}
