//! Sum reduction over per-device contribution planes.
//!
//! A push slot holds `ndevice` contiguous `[rows, cols]` planes; sum
//! reduction accumulates planes `1..ndevice` into plane 0. Large tensors
//! are split across worker threads along the row dimension with a static
//! partition, so the per-element accumulation order (device index
//! ascending) is identical in the serial and parallel schedules and the
//! result is reproducible for a fixed thread count and shape.

use crate::error::{GradBusError, Result};
use crate::types::DataType;

/// Trait for element types that support sum accumulation.
trait Accumulate: Copy + 'static {
    fn accumulate(a: Self, b: Self) -> Self;
}

macro_rules! impl_accumulate {
    (int: $($ty:ty),*) => {
        $(
            impl Accumulate for $ty {
                #[inline]
                fn accumulate(a: Self, b: Self) -> Self {
                    a.wrapping_add(b)
                }
            }
        )*
    };
    (float: $($ty:ty),*) => {
        $(
            impl Accumulate for $ty {
                #[inline]
                fn accumulate(a: Self, b: Self) -> Self {
                    a + b
                }
            }
        )*
    };
}

impl_accumulate!(int: i8, i32, i64, u8, u32, u64);
impl_accumulate!(float: f32, f64);

/// Reduce `ndevice` planes of shape `[rows, cols]` at `base` into the
/// first plane.
///
/// Parallelizes across rows when the plane holds at least
/// `bigarray_bound` elements and `nthreads > 0`; otherwise runs a single
/// row-major accumulation.
///
/// # Safety
/// `base` must point to `ndevice * rows * cols` elements of `dtype`, and
/// no other thread may access that memory during the call.
pub(crate) unsafe fn reduce_sum(
    base: u64,
    ndevice: usize,
    rows: usize,
    cols: usize,
    dtype: DataType,
    nthreads: usize,
    bigarray_bound: usize,
) -> Result<()> {
    unsafe {
        match dtype {
            DataType::F32 => reduce_sum_typed::<f32>(base, ndevice, rows, cols, nthreads, bigarray_bound),
            DataType::F64 => reduce_sum_typed::<f64>(base, ndevice, rows, cols, nthreads, bigarray_bound),
            DataType::I8 => reduce_sum_typed::<i8>(base, ndevice, rows, cols, nthreads, bigarray_bound),
            DataType::I32 => reduce_sum_typed::<i32>(base, ndevice, rows, cols, nthreads, bigarray_bound),
            DataType::I64 => reduce_sum_typed::<i64>(base, ndevice, rows, cols, nthreads, bigarray_bound),
            DataType::U8 => reduce_sum_typed::<u8>(base, ndevice, rows, cols, nthreads, bigarray_bound),
            DataType::U32 => reduce_sum_typed::<u32>(base, ndevice, rows, cols, nthreads, bigarray_bound),
            DataType::U64 => reduce_sum_typed::<u64>(base, ndevice, rows, cols, nthreads, bigarray_bound),
            _ => {
                return Err(GradBusError::UnsupportedDType {
                    dtype,
                    op: "reduce_sum",
                })
            }
        }
    }
    Ok(())
}

/// # Safety
/// Same contract as [`reduce_sum`], with `T` matching the buffer's
/// element type.
unsafe fn reduce_sum_typed<T: Accumulate>(
    base: u64,
    ndevice: usize,
    rows: usize,
    cols: usize,
    nthreads: usize,
    bigarray_bound: usize,
) {
    let plane = rows * cols;
    if plane >= bigarray_bound && nthreads > 0 {
        let chunk = rows.div_ceil(nthreads);
        std::thread::scope(|s| {
            for t in 0..nthreads {
                let lo = t * chunk;
                if lo >= rows {
                    break;
                }
                let hi = (lo + chunk).min(rows);
                // Threads own disjoint row ranges of every plane.
                s.spawn(move || unsafe {
                    accumulate_rows::<T>(base, ndevice, plane, cols, lo, hi);
                });
            }
        });
    } else {
        unsafe { accumulate_rows::<T>(base, ndevice, plane, cols, 0, rows) };
    }
}

/// Accumulate rows `lo..hi` of planes `1..ndevice` into plane 0.
///
/// # Safety
/// `base` must point to `ndevice * plane` elements of `T`; the row range
/// must be exclusively owned by the caller.
unsafe fn accumulate_rows<T: Accumulate>(
    base: u64,
    ndevice: usize,
    plane: usize,
    cols: usize,
    lo: usize,
    hi: usize,
) {
    let dst = base as *mut T;
    for d in 1..ndevice {
        let src = unsafe { dst.add(d * plane) };
        for i in lo * cols..hi * cols {
            unsafe {
                *dst.add(i) = T::accumulate(*dst.add(i), *src.add(i));
            }
        }
    }
}
