//! Element-wise reduction primitives over little-endian byte slices, used by
//! the in-process transport to combine contributions from every rank.

use crate::error::{HookError, Result};
use crate::tensor::Element;
use crate::types::{DataType, ReduceOp};

/// Types that support the reduction operations.
pub(crate) trait Reducible: Copy + 'static {
    fn reduce(a: Self, b: Self, op: ReduceOp) -> Self;

    /// Mean of `n` values, folded in iteration order.
    fn mean<I: Iterator<Item = Self>>(values: I, n: u32) -> Self;
}

macro_rules! impl_reducible {
    (int: $($ty:ty),*) => {
        $(
            impl Reducible for $ty {
                #[inline]
                fn reduce(a: Self, b: Self, op: ReduceOp) -> Self {
                    match op {
                        ReduceOp::Sum | ReduceOp::Avg => a.wrapping_add(b),
                        ReduceOp::Prod => a.wrapping_mul(b),
                        ReduceOp::Min => a.min(b),
                        ReduceOp::Max => a.max(b),
                    }
                }

                // The sum is taken in i128 so it cannot wrap; the truncated
                // quotient always fits back into the element type.
                #[inline]
                fn mean<I: Iterator<Item = Self>>(values: I, n: u32) -> Self {
                    let sum: i128 = values.map(|v| v as i128).sum();
                    (sum / n as i128) as $ty
                }
            }
        )*
    };
    (float: $($ty:ty),*) => {
        $(
            impl Reducible for $ty {
                #[inline]
                fn reduce(a: Self, b: Self, op: ReduceOp) -> Self {
                    match op {
                        ReduceOp::Sum | ReduceOp::Avg => a + b,
                        ReduceOp::Prod => a * b,
                        ReduceOp::Min => a.min(b),
                        ReduceOp::Max => a.max(b),
                    }
                }

                #[inline]
                fn mean<I: Iterator<Item = Self>>(values: I, n: u32) -> Self {
                    values.reduce(|a, b| a + b).unwrap_or(0.0) / n as $ty
                }
            }
        )*
    };
}

impl_reducible!(int: i8, i32, i64, u8, u32, u64);
impl_reducible!(float: f32, f64);

/// Element-wise `dst[i] = op(dst[i], src[i])` on byte slices interpreted as
/// `dtype` elements. `Avg` folds like `Sum`; use [`average_slices`] for a
/// mean that cannot overflow.
pub(crate) fn reduce_slice(
    dst: &mut [u8],
    src: &[u8],
    dtype: DataType,
    op: ReduceOp,
) -> Result<()> {
    if dst.len() != src.len() {
        return Err(HookError::BufferSizeMismatch {
            expected: dst.len(),
            actual: src.len(),
        });
    }
    match dtype {
        DataType::F32 => reduce_slice_typed::<f32>(dst, src, op),
        DataType::F64 => reduce_slice_typed::<f64>(dst, src, op),
        DataType::I32 => reduce_slice_typed::<i32>(dst, src, op),
        DataType::I64 => reduce_slice_typed::<i64>(dst, src, op),
        DataType::U32 => reduce_slice_typed::<u32>(dst, src, op),
        DataType::U64 => reduce_slice_typed::<u64>(dst, src, op),
        DataType::I8 => reduce_slice_typed::<i8>(dst, src, op),
        DataType::U8 => reduce_slice_typed::<u8>(dst, src, op),
        DataType::F16 | DataType::BF16 => {
            return Err(HookError::UnsupportedDType {
                dtype,
                op: "reduce",
            });
        }
    }
    Ok(())
}

/// Write the element-wise mean of `contributions` into `out`.
///
/// Floats are summed in contribution order, then divided. Integers are
/// summed without overflow and divided with truncation towards zero.
pub(crate) fn average_slices(
    out: &mut [u8],
    contributions: &[&[u8]],
    dtype: DataType,
) -> Result<()> {
    if contributions.is_empty() {
        return Err(HookError::InvalidArgument(
            "cannot average zero contributions".into(),
        ));
    }
    if let Some(c) = contributions.iter().find(|c| c.len() != out.len()) {
        return Err(HookError::BufferSizeMismatch {
            expected: out.len(),
            actual: c.len(),
        });
    }
    match dtype {
        DataType::F32 => average_typed::<f32>(out, contributions),
        DataType::F64 => average_typed::<f64>(out, contributions),
        DataType::I32 => average_typed::<i32>(out, contributions),
        DataType::I64 => average_typed::<i64>(out, contributions),
        DataType::U32 => average_typed::<u32>(out, contributions),
        DataType::U64 => average_typed::<u64>(out, contributions),
        DataType::I8 => average_typed::<i8>(out, contributions),
        DataType::U8 => average_typed::<u8>(out, contributions),
        DataType::F16 | DataType::BF16 => {
            return Err(HookError::UnsupportedDType {
                dtype,
                op: "average",
            });
        }
    }
    Ok(())
}

fn reduce_slice_typed<T: Reducible + Element>(dst: &mut [u8], src: &[u8], op: ReduceOp) {
    let t_size = std::mem::size_of::<T>();
    for (d, s) in dst.chunks_exact_mut(t_size).zip(src.chunks_exact(t_size)) {
        let r = T::reduce(T::read_le(d), T::read_le(s), op);
        r.write_le(d);
    }
}

fn average_typed<T: Reducible + Element>(out: &mut [u8], contributions: &[&[u8]]) {
    let t_size = std::mem::size_of::<T>();
    let n = contributions.len() as u32;
    for (i, chunk) in out.chunks_exact_mut(t_size).enumerate() {
        let at = i * t_size..(i + 1) * t_size;
        let values = contributions.iter().map(|c| T::read_le(&c[at.clone()]));
        T::mean(values, n).write_le(chunk);
    }
}
