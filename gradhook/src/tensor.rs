//! Caller-owned numeric buffers.
//!
//! A [`Tensor`] is a cheap, clonable handle to shared storage. Cloning the
//! handle never copies data; [`Tensor::same_storage`] tells two handles to
//! the same storage apart from two tensors with equal contents. Element data
//! is kept as little-endian bytes so the transport can move it without
//! knowing the element type.

use std::sync::{Arc, RwLock};

use crate::error::{HookError, Result};
use crate::types::{DataType, Device};

/// Rust scalar types that map onto a [`DataType`].
pub trait Element: Copy + Send + Sync + 'static {
    const DTYPE: DataType;

    fn write_le(self, out: &mut [u8]);

    fn read_le(bytes: &[u8]) -> Self;
}

macro_rules! impl_element {
    ($($ty:ty => $dtype:ident),* $(,)?) => {
        $(
            impl Element for $ty {
                const DTYPE: DataType = DataType::$dtype;

                #[inline]
                fn write_le(self, out: &mut [u8]) {
                    out.copy_from_slice(&self.to_le_bytes());
                }

                #[inline]
                fn read_le(bytes: &[u8]) -> Self {
                    let mut raw = [0u8; std::mem::size_of::<$ty>()];
                    raw.copy_from_slice(bytes);
                    Self::from_le_bytes(raw)
                }
            }
        )*
    };
}

impl_element!(
    f32 => F32,
    f64 => F64,
    i8 => I8,
    i32 => I32,
    i64 => I64,
    u8 => U8,
    u32 => U32,
    u64 => U64,
);

struct Storage {
    dtype: DataType,
    shape: Vec<usize>,
    device: Device,
    data: RwLock<Vec<u8>>,
}

/// A fixed-shape numeric array with an element type and a device.
#[derive(Clone)]
pub struct Tensor {
    inner: Arc<Storage>,
}

impl Tensor {
    /// Build a tensor from raw little-endian bytes.
    pub fn from_bytes(
        bytes: Vec<u8>,
        shape: &[usize],
        dtype: DataType,
        device: Device,
    ) -> Result<Self> {
        let expected = shape.iter().product::<usize>() * dtype.size_in_bytes();
        if bytes.len() != expected {
            return Err(HookError::BufferSizeMismatch {
                expected,
                actual: bytes.len(),
            });
        }
        Ok(Self {
            inner: Arc::new(Storage {
                dtype,
                shape: shape.to_vec(),
                device,
                data: RwLock::new(bytes),
            }),
        })
    }

    /// Build a CPU tensor of the given shape from typed values.
    pub fn from_slice<T: Element>(values: &[T], shape: &[usize]) -> Result<Self> {
        let numel: usize = shape.iter().product();
        if values.len() != numel {
            return Err(HookError::InvalidArgument(format!(
                "{} values do not fill shape {shape:?}",
                values.len()
            )));
        }
        Self::from_bytes(encode(values), shape, T::DTYPE, Device::Cpu)
    }

    /// Build a 1-D CPU tensor from typed values.
    pub fn from_values<T: Element>(values: &[T]) -> Self {
        Self {
            inner: Arc::new(Storage {
                dtype: T::DTYPE,
                shape: vec![values.len()],
                device: Device::Cpu,
                data: RwLock::new(encode(values)),
            }),
        }
    }

    /// A zero-filled tensor.
    pub fn zeros(shape: &[usize], dtype: DataType, device: Device) -> Self {
        let len = shape.iter().product::<usize>() * dtype.size_in_bytes();
        Self {
            inner: Arc::new(Storage {
                dtype,
                shape: shape.to_vec(),
                device,
                data: RwLock::new(vec![0u8; len]),
            }),
        }
    }

    /// A new, independent tensor with the same metadata and a copy of the data.
    pub fn deep_clone(&self) -> Result<Self> {
        Self::from_bytes(self.to_bytes()?, self.shape(), self.dtype(), self.device())
    }

    /// Same data and shape, tagged with a different device.
    pub fn on_device(&self, device: Device) -> Result<Self> {
        Self::from_bytes(self.to_bytes()?, self.shape(), self.dtype(), device)
    }

    /// A new tensor with this tensor's metadata holding `bytes`.
    pub(crate) fn like_with_bytes(&self, bytes: Vec<u8>) -> Result<Self> {
        Self::from_bytes(bytes, self.shape(), self.dtype(), self.device())
    }

    pub fn dtype(&self) -> DataType {
        self.inner.dtype
    }

    pub fn shape(&self) -> &[usize] {
        &self.inner.shape
    }

    pub fn device(&self) -> Device {
        self.inner.device
    }

    /// Number of elements.
    pub fn numel(&self) -> usize {
        self.inner.shape.iter().product()
    }

    pub fn size_in_bytes(&self) -> usize {
        self.numel() * self.inner.dtype.size_in_bytes()
    }

    /// Whether both handles refer to the same storage.
    pub fn same_storage(&self, other: &Tensor) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Snapshot of the raw little-endian bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let data = self
            .inner
            .data
            .read()
            .map_err(|_| HookError::LockPoisoned("tensor"))?;
        Ok(data.clone())
    }

    /// Copy the elements out as `T`.
    pub fn to_vec<T: Element>(&self) -> Result<Vec<T>> {
        if T::DTYPE != self.inner.dtype {
            return Err(HookError::InvalidArgument(format!(
                "tensor holds {}, requested {}",
                self.inner.dtype,
                T::DTYPE
            )));
        }
        let data = self
            .inner
            .data
            .read()
            .map_err(|_| HookError::LockPoisoned("tensor"))?;
        Ok(data
            .chunks_exact(T::DTYPE.size_in_bytes())
            .map(T::read_le)
            .collect())
    }

    /// Overwrite the contents in place. The length must match exactly.
    pub fn write_bytes(&self, bytes: &[u8]) -> Result<()> {
        let mut data = self
            .inner
            .data
            .write()
            .map_err(|_| HookError::LockPoisoned("tensor"))?;
        if data.len() != bytes.len() {
            return Err(HookError::BufferSizeMismatch {
                expected: data.len(),
                actual: bytes.len(),
            });
        }
        data.copy_from_slice(bytes);
        Ok(())
    }

    /// Copy `src` into this tensor in place. Shapes and dtypes must match.
    pub fn copy_from(&self, src: &Tensor) -> Result<()> {
        if self.same_storage(src) {
            return Ok(());
        }
        if src.dtype() != self.dtype() {
            return Err(HookError::InvalidArgument(format!(
                "cannot copy {} into {}",
                src.dtype(),
                self.dtype()
            )));
        }
        if src.shape() != self.shape() {
            return Err(HookError::ShapeMismatch {
                index: 0,
                expected: self.shape().to_vec(),
                actual: src.shape().to_vec(),
            });
        }
        let bytes = src.to_bytes()?;
        self.write_bytes(&bytes)
    }
}

impl std::fmt::Debug for Tensor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tensor")
            .field("dtype", &self.inner.dtype)
            .field("shape", &self.inner.shape)
            .field("device", &self.inner.device)
            .finish()
    }
}

fn encode<T: Element>(values: &[T]) -> Vec<u8> {
    let size = T::DTYPE.size_in_bytes();
    let mut bytes = vec![0u8; values.len() * size];
    for (v, out) in values.iter().zip(bytes.chunks_exact_mut(size)) {
        v.write_le(out);
    }
    bytes
}

/// Gather tensors into one contiguous 1-D tensor.
///
/// All tensors must share a dtype and device; the result carries both.
pub fn flatten_dense(tensors: &[Tensor]) -> Result<Tensor> {
    let first = tensors
        .first()
        .ok_or_else(|| HookError::InvalidArgument("cannot flatten zero tensors".into()))?;
    let total: usize = tensors.iter().map(Tensor::size_in_bytes).sum();
    let mut flat = Vec::with_capacity(total);
    for t in tensors {
        if t.dtype() != first.dtype() || t.device() != first.device() {
            return Err(HookError::InvalidArgument(format!(
                "cannot flatten {} on {} together with {} on {}",
                t.dtype(),
                t.device(),
                first.dtype(),
                first.device()
            )));
        }
        flat.extend_from_slice(&t.to_bytes()?);
    }
    let numel = total / first.dtype().size_in_bytes();
    Tensor::from_bytes(flat, &[numel], first.dtype(), first.device())
}

/// Scatter a contiguous tensor back into `tensors`, overwriting each in place.
pub fn unflatten_into(flat: &Tensor, tensors: &[Tensor]) -> Result<()> {
    let bytes = flat.to_bytes()?;
    let total: usize = tensors.iter().map(Tensor::size_in_bytes).sum();
    if bytes.len() != total {
        return Err(HookError::BufferSizeMismatch {
            expected: total,
            actual: bytes.len(),
        });
    }
    let mut offset = 0;
    for t in tensors {
        let len = t.size_in_bytes();
        t.write_bytes(&bytes[offset..offset + len])?;
        offset += len;
    }
    Ok(())
}
