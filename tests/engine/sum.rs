use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use gradbus::{DataType, Shape2};

use super::helpers::{engine, engine_with_params, view, view_mut};

#[test]
fn test_sum_two_devices_single_key() {
    let eng = engine(&[0, 1]);
    let shape = Shape2::new(2, 2);
    eng.init_key(shape, DataType::F32, 7, 0);
    eng.init_key(shape, DataType::F32, 7, 1);

    let src0: Vec<f32> = vec![1.0, 2.0, 3.0, 4.0];
    let src1: Vec<f32> = vec![10.0, 20.0, 30.0, 40.0];
    eng.push(view(&src0, 2, 2), 7, 0, 0);
    eng.push(view(&src1, 2, 2), 7, 1, 0);

    let mut dst0: Vec<f32> = vec![0.0; 4];
    let mut dst1: Vec<f32> = vec![0.0; 4];
    eng.pull_req(view_mut(&mut dst0, 2, 2), 7, 0, 0, None);
    eng.pull_req(view_mut(&mut dst1, 2, 2), 7, 1, 0, None);
    eng.pull_wait(7, 0);
    eng.pull_wait(7, 1);

    assert_eq!(dst0, vec![11.0, 22.0, 33.0, 44.0]);
    assert_eq!(dst1, dst0);
}

#[test]
fn test_single_device_push_finishes_immediately() {
    let eng = engine(&[3]);
    eng.init_key(Shape2::new(1, 4), DataType::F32, 0, 3);

    let src: Vec<f32> = vec![5.0, 6.0, 7.0, 8.0];
    eng.push(view(&src, 1, 4), 0, 3, 0);

    let mut dst: Vec<f32> = vec![0.0; 4];
    eng.pull_req(view_mut(&mut dst, 1, 4), 0, 3, 0, None);
    eng.pull_wait(0, 3);
    assert_eq!(dst, src);
}

#[test]
fn test_keys_progress_independently() {
    let eng = engine(&[0, 1]);
    eng.init_key(Shape2::new(1, 2), DataType::F32, 1, 0);
    eng.init_key(Shape2::new(1, 2), DataType::F32, 1, 1);
    eng.init_key(Shape2::new(1, 3), DataType::F32, 2, 0);
    eng.init_key(Shape2::new(1, 3), DataType::F32, 2, 1);

    // Key 2 completes even though key 1 only ever sees device 0's push.
    let partial: Vec<f32> = vec![1.0, 1.0];
    eng.push(view(&partial, 1, 2), 1, 0, 0);

    let a: Vec<f32> = vec![1.0, 2.0, 3.0];
    let b: Vec<f32> = vec![4.0, 5.0, 6.0];
    eng.push(view(&a, 1, 3), 2, 0, 0);
    eng.push(view(&b, 1, 3), 2, 1, 0);

    let mut dst: Vec<f32> = vec![0.0; 3];
    eng.pull_req(view_mut(&mut dst, 1, 3), 2, 1, 0, None);
    eng.pull_wait(2, 1);
    assert_eq!(dst, vec![5.0, 7.0, 9.0]);
}

#[test]
fn test_shared_worker_modes() {
    let eng = engine_with_params(&[0, 1], &[("push_thread", "one"), ("pull_thread", "one")]);
    let shape = Shape2::new(2, 1);
    eng.init_key(shape, DataType::F32, 0, 0);
    eng.init_key(shape, DataType::F32, 0, 1);

    let src0: Vec<f32> = vec![1.0, 2.0];
    let src1: Vec<f32> = vec![3.0, 4.0];
    eng.push(view(&src0, 2, 1), 0, 0, 0);
    eng.push(view(&src1, 2, 1), 0, 1, 0);

    let mut dst: Vec<f32> = vec![0.0; 2];
    eng.pull_req(view_mut(&mut dst, 2, 1), 0, 0, 0, None);
    eng.pull_wait(0, 0);
    assert_eq!(dst, vec![4.0, 6.0]);
}

#[test]
fn test_consecutive_rounds() {
    let eng = engine(&[0, 1]);
    let shape = Shape2::new(1, 2);
    eng.init_key(shape, DataType::F32, 5, 0);
    eng.init_key(shape, DataType::F32, 5, 1);

    for round in 0..10 {
        let base = round as f32 * 100.0;
        let src0: Vec<f32> = vec![base + 1.0, base + 2.0];
        let src1: Vec<f32> = vec![base + 10.0, base + 20.0];
        eng.push(view(&src0, 1, 2), 5, 0, 0);
        eng.push(view(&src1, 1, 2), 5, 1, 0);

        let mut dst0: Vec<f32> = vec![0.0; 2];
        let mut dst1: Vec<f32> = vec![0.0; 2];
        eng.pull_req(view_mut(&mut dst0, 1, 2), 5, 0, 0, None);
        eng.pull_req(view_mut(&mut dst1, 1, 2), 5, 1, 0, None);
        eng.pull_wait(5, 0);
        eng.pull_wait(5, 1);

        let expected = vec![2.0 * base + 11.0, 2.0 * base + 22.0];
        assert_eq!(dst0, expected, "round {round}");
        assert_eq!(dst1, expected, "round {round}");
    }
}

#[test]
fn test_callback_fires_before_wait_returns() {
    let eng = engine(&[0]);
    eng.init_key(Shape2::new(1, 1), DataType::F32, 0, 0);

    let src: Vec<f32> = vec![1.0];
    eng.push(view(&src, 1, 1), 0, 0, 0);

    let fired = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&fired);
    let mut dst: Vec<f32> = vec![0.0];
    eng.pull_req(
        view_mut(&mut dst, 1, 1),
        0,
        0,
        0,
        Some(Box::new(move |stream| {
            assert_ne!(stream, 0, "callback receives the live copy stream");
            flag.store(true, Ordering::Release);
        })),
    );
    eng.pull_wait(0, 0);
    assert!(fired.load(Ordering::Acquire));
    assert_eq!(dst, vec![1.0]);
}

#[test]
fn test_repeated_pull_without_new_push() {
    let eng = engine(&[0]);
    eng.init_key(Shape2::new(1, 2), DataType::F32, 0, 0);

    let src: Vec<f32> = vec![3.0, 4.0];
    eng.push(view(&src, 1, 2), 0, 0, 0);

    // The key stays pull-ready until the next push resets it, so
    // back-to-back pulls observe the same authoritative value.
    for _ in 0..3 {
        let mut dst: Vec<f32> = vec![0.0; 2];
        eng.pull_req(view_mut(&mut dst, 1, 2), 0, 0, 0, None);
        eng.pull_wait(0, 0);
        assert_eq!(dst, vec![3.0, 4.0]);
    }
}

#[test]
fn test_init_key_is_idempotent() {
    let eng = engine(&[0, 1]);
    let shape = Shape2::new(2, 3);
    for _ in 0..3 {
        eng.init_key(shape, DataType::F32, 9, 0);
        eng.init_key(shape, DataType::F32, 9, 1);
    }

    let src0: Vec<f32> = vec![1.0; 6];
    let src1: Vec<f32> = vec![2.0; 6];
    eng.push(view(&src0, 2, 3), 9, 0, 0);
    eng.push(view(&src1, 2, 3), 9, 1, 0);

    let mut dst: Vec<f32> = vec![0.0; 6];
    eng.pull_req(view_mut(&mut dst, 2, 3), 9, 0, 0, None);
    eng.pull_wait(9, 0);
    assert_eq!(dst, vec![3.0; 6]);
}

#[test]
fn test_parallel_reduction_path() {
    // Force the parallel schedule by dropping the big-array bound below
    // the tensor size.
    let eng = engine_with_params(&[0, 1, 2], &[("bigarray_bound", "8"), ("reduce_thread", "4")]);
    let shape = Shape2::new(8, 4);
    for dev in 0..3u32 {
        eng.init_key(shape, DataType::F32, 0, dev);
    }

    let sources: Vec<Vec<f32>> = (0..3)
        .map(|d| (0..32).map(|i| (d * 100 + i) as f32).collect())
        .collect();
    for (d, src) in sources.iter().enumerate() {
        eng.push(view(src, 8, 4), 0, d as u32, 0);
    }

    let mut dst: Vec<f32> = vec![0.0; 32];
    eng.pull_req(view_mut(&mut dst, 8, 4), 0, 0, 0, None);
    eng.pull_wait(0, 0);

    let expected: Vec<f32> = (0..32).map(|i| (3 * i + 300) as f32).collect();
    assert_eq!(dst, expected);
}
