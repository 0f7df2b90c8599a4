use std::sync::Arc;
use std::thread;

use gradbus::{DataType, Shape2};

use super::helpers::{engine, view, view_mut};

#[test]
fn test_wait_before_any_request_returns_immediately() {
    let eng = engine(&[0, 1]);
    eng.init_key(Shape2::new(2, 2), DataType::F32, 7, 0);
    eng.pull_wait(7, 0);
    eng.pull_wait(7, 1);
}

#[test]
fn test_wait_on_unknown_key_returns_immediately() {
    let eng = engine(&[0]);
    eng.pull_wait(99, 0);
}

#[test]
fn test_multiple_waiters_are_all_released() {
    let eng = Arc::new(engine(&[0]));
    eng.init_key(Shape2::new(1, 1), DataType::F32, 0, 0);

    let mut dst: Vec<f32> = vec![0.0];
    eng.pull_req(view_mut(&mut dst, 1, 1), 0, 0, 0, None);

    let waiters: Vec<_> = (0..3)
        .map(|_| {
            let eng = Arc::clone(&eng);
            thread::spawn(move || eng.pull_wait(0, 0))
        })
        .collect();

    // The pull is pending until the rendezvous completes.
    let src: Vec<f32> = vec![42.0];
    eng.push(view(&src, 1, 1), 0, 0, 0);

    for w in waiters {
        w.join().unwrap();
    }
    eng.pull_wait(0, 0);
    assert_eq!(dst, vec![42.0]);
}

#[test]
fn test_wait_after_delivery_returns_immediately() {
    let eng = engine(&[0]);
    eng.init_key(Shape2::new(1, 1), DataType::F32, 0, 0);

    let src: Vec<f32> = vec![1.0];
    eng.push(view(&src, 1, 1), 0, 0, 0);
    let mut dst: Vec<f32> = vec![0.0];
    eng.pull_req(view_mut(&mut dst, 1, 1), 0, 0, 0, None);
    eng.pull_wait(0, 0);
    // Finished stays set until the next pull request.
    eng.pull_wait(0, 0);
    eng.pull_wait(0, 0);
}
