use std::sync::{Arc, OnceLock, RwLock};

use thiserror::Error;

use super::{
    context::Context,
    engine::Var,
    num::{DataType, Scalar},
    shape::Shape,
};

#[derive(Debug, Error)]
pub enum TensorError {
    #[error("tensor type error: data type {0} mismatches {1}")]
    Type(DataType, DataType),
    #[error("tensor creation error: shape {0}'s size not match data len {1}")]
    Create(Shape, usize),
    #[error("tensor shape {0} is not known")]
    Unknown(Shape),
    #[error("tensor is none")]
    None,
}

/// Host memory backing one buffer, aligned for every [`Scalar`].
pub struct Storage {
    data: RwLock<Box<[u64]>>,
    len: usize,
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage").field("len", &self.len).finish()
    }
}

impl Storage {
    /// Allocates `len` zeroed bytes.
    pub fn new(len: usize) -> Self {
        let data = vec![0u64; len.div_ceil(size_of::<u64>())].into_boxed_slice();
        let data = RwLock::new(data);
        Self { data, len }
    }

    /// Size in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of whole `T` elements that fit in the storage.
    #[inline]
    fn count<T: Scalar>(&self) -> usize {
        self.len / size_of::<T>()
    }

    /// Reads the contents as elements of `T`.
    pub fn read<T: Scalar, R>(&self, f: impl FnOnce(&[T]) -> R) -> R {
        let data = self.data.read().expect("failed to lock");
        let bytes: &[u8] = bytemuck::cast_slice(&data[..]);
        let len = self.count::<T>() * size_of::<T>();
        f(bytemuck::cast_slice(&bytes[..len]))
    }

    /// Writes the contents as elements of `T`.
    pub fn write<T: Scalar, R>(&self, f: impl FnOnce(&mut [T]) -> R) -> R {
        let mut data = self.data.write().expect("failed to lock");
        let bytes: &mut [u8] = bytemuck::cast_slice_mut(&mut data[..]);
        let len = self.count::<T>() * size_of::<T>();
        f(bytemuck::cast_slice_mut(&mut bytes[..len]))
    }
}

/// The view of a buffer handed to kernels.
#[derive(Debug, Clone)]
pub struct TBlob {
    shape: Shape,
    dtype: DataType,
    storage: Arc<Storage>,
}

impl TBlob {
    pub fn new(shape: Shape, dtype: DataType, storage: Arc<Storage>) -> Self {
        Self {
            shape,
            dtype,
            storage,
        }
    }

    #[inline]
    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    #[inline]
    pub fn dtype(&self) -> DataType {
        self.dtype
    }

    /// Reinterprets the blob with another shape of the same size.
    pub fn reshape(&self, shape: impl Into<Shape>) -> Self {
        let shape = shape.into();
        debug_assert_eq!(shape.size(), self.shape.size());
        Self {
            shape,
            ..self.clone()
        }
    }

    #[inline]
    fn check<T: Scalar>(&self) -> Result<(), TensorError> {
        match self.dtype == T::DATA_TYPE {
            true => Ok(()),
            false => Err(TensorError::Type(self.dtype, T::DATA_TYPE)),
        }
    }

    /// Copies the elements out.
    pub fn to_vec<T: Scalar>(&self) -> Result<Vec<T>, TensorError> {
        self.check::<T>()?;
        let len = self.shape.size();
        Ok(self.storage.read(|data: &[T]| data[..len].to_vec()))
    }

    /// Mutates the elements in place.
    pub fn write<T: Scalar, R>(&self, f: impl FnOnce(&mut [T]) -> R) -> Result<R, TensorError> {
        self.check::<T>()?;
        let len = self.shape.size();
        Ok(self.storage.write(|data: &mut [T]| f(&mut data[..len])))
    }
}

#[derive(Debug)]
struct Chunk {
    shape: Shape,
    dtype: DataType,
    context: Context,
    var: Var,
    storage: OnceLock<Arc<Storage>>,
}

/// A caller-visible handle to a tensor buffer.
///
/// Clones share the buffer and its dependency variable. The default handle is "none": it is
/// not bound to any buffer and only serves as a slot to be filled.
#[derive(Debug, Default, Clone)]
pub struct NdArray(Option<Arc<Chunk>>);

impl NdArray {
    #[inline]
    pub fn none() -> Self {
        Self(None)
    }

    /// Creates a handle whose storage is allocated on first access.
    pub fn new(shape: impl Into<Shape>, context: Context, dtype: DataType) -> Self {
        let chunk = Chunk {
            shape: shape.into(),
            dtype,
            context,
            var: Var::new(),
            storage: OnceLock::new(),
        };
        Self(Some(Arc::new(chunk)))
    }

    /// Creates a handle initialized with `data`.
    pub fn from_vec<T: Scalar>(
        shape: impl Into<Shape>,
        context: Context,
        data: Vec<T>,
    ) -> Result<Self, TensorError> {
        let shape = shape.into();
        if shape.size() != data.len() {
            return Err(TensorError::Create(shape, data.len()));
        }
        let array = Self::new(shape, context, T::DATA_TYPE);
        array.blob()?.write(|x: &mut [T]| x.copy_from_slice(&data))?;
        Ok(array)
    }

    #[inline]
    pub fn is_none(&self) -> bool {
        self.0.is_none()
    }

    #[inline]
    fn chunk(&self) -> Result<&Chunk, TensorError> {
        self.0.as_deref().ok_or(TensorError::None)
    }

    /// The shape of the buffer, or the unknown shape if none.
    #[inline]
    pub fn shape(&self) -> Shape {
        self.0
            .as_ref()
            .map(|chunk| chunk.shape.clone())
            .unwrap_or_default()
    }

    #[inline]
    pub fn dtype(&self) -> Option<DataType> {
        self.0.as_ref().map(|chunk| chunk.dtype)
    }

    #[inline]
    pub fn context(&self) -> Option<Context> {
        self.0.as_ref().map(|chunk| chunk.context)
    }

    #[inline]
    pub fn var(&self) -> Option<&Var> {
        self.0.as_ref().map(|chunk| &chunk.var)
    }

    /// Returns `true` if both handles refer to the same buffer.
    #[inline]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        match (&self.0, &other.0) {
            (Some(x), Some(y)) => Arc::ptr_eq(x, y),
            _ => false,
        }
    }

    /// Moves the handle out, leaving none in its place.
    #[inline]
    pub fn take(&mut self) -> Self {
        std::mem::take(self)
    }

    /// Returns the kernel view, allocating the storage if it is not allocated yet.
    pub fn blob(&self) -> Result<TBlob, TensorError> {
        let chunk = self.chunk()?;
        if chunk.shape.is_unknown() {
            return Err(TensorError::Unknown(chunk.shape.clone()));
        }
        let storage = chunk
            .storage
            .get_or_init(|| Arc::new(Storage::new(chunk.shape.size() * chunk.dtype.size())))
            .clone();
        Ok(TBlob::new(chunk.shape.clone(), chunk.dtype, storage))
    }

    /// Copies the elements out without waiting for pending writes.
    pub fn to_vec<T: Scalar>(&self) -> Result<Vec<T>, TensorError> {
        self.blob()?.to_vec()
    }
}
