use gradbus::{DataType, Shape2};

use super::helpers::{engine_with_params, view, view_mut};

#[test]
fn test_gather_three_devices() {
    let eng = engine_with_params(&[0, 1, 2], &[("push_op[5]", "gather")]);
    let shape = Shape2::new(1, 3);
    for dev in 0..3u32 {
        eng.init_key(shape, DataType::F32, 5, dev);
    }

    let rows: Vec<Vec<f32>> = vec![
        vec![1.0, 2.0, 3.0],
        vec![4.0, 5.0, 6.0],
        vec![7.0, 8.0, 9.0],
    ];
    for (dev, row) in rows.iter().enumerate() {
        eng.push(view(row, 1, 3), 5, dev as u32, 0);
    }

    let expected: Vec<f32> = (1..=9).map(|i| i as f32).collect();
    for dev in 0..3u32 {
        let mut dst: Vec<f32> = vec![0.0; 9];
        eng.pull_req(view_mut(&mut dst, 3, 3), 5, dev, 0, None);
        eng.pull_wait(5, dev);
        assert_eq!(dst, expected, "device {dev}");
    }
}

#[test]
fn test_gather_rows_follow_device_order_not_arrival_order() {
    let eng = engine_with_params(&[0, 1], &[("push_op[0]", "gather")]);
    let shape = Shape2::new(1, 2);
    eng.init_key(shape, DataType::F32, 0, 0);
    eng.init_key(shape, DataType::F32, 0, 1);

    let row0: Vec<f32> = vec![1.0, 2.0];
    let row1: Vec<f32> = vec![3.0, 4.0];
    // Device 1 pushes first; its contribution still lands in row 1.
    eng.push(view(&row1, 1, 2), 0, 1, 0);
    eng.push(view(&row0, 1, 2), 0, 0, 0);

    let mut dst: Vec<f32> = vec![0.0; 4];
    eng.pull_req(view_mut(&mut dst, 2, 2), 0, 0, 0, None);
    eng.pull_wait(0, 0);
    assert_eq!(dst, vec![1.0, 2.0, 3.0, 4.0]);
}

#[test]
fn test_gather_repeated_rounds() {
    let eng = engine_with_params(&[0, 1], &[("push_op[3]", "gather")]);
    let shape = Shape2::new(2, 1);
    eng.init_key(shape, DataType::F32, 3, 0);
    eng.init_key(shape, DataType::F32, 3, 1);

    for round in 0..4 {
        let base = round as f32 * 10.0;
        let src0: Vec<f32> = vec![base, base + 1.0];
        let src1: Vec<f32> = vec![base + 2.0, base + 3.0];
        eng.push(view(&src0, 2, 1), 3, 0, 0);
        eng.push(view(&src1, 2, 1), 3, 1, 0);

        let mut dst: Vec<f32> = vec![0.0; 4];
        eng.pull_req(view_mut(&mut dst, 4, 1), 3, 0, 0, None);
        eng.pull_wait(3, 0);
        assert_eq!(
            dst,
            vec![base, base + 1.0, base + 2.0, base + 3.0],
            "round {round}"
        );
    }
}
