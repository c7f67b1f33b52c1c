// Melforge - Tensor exchange between inference stages
// Copies engine outputs into owned, shape-checked buffers and wraps buffers
// back up as named inputs for the next model.

use std::fmt;

use ndarray::{ArrayD, IxDyn};

/// Element type of a tensor as reported by the inference engine
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ElementType {
    Float32,
    Int32,
    Int64,
}

impl ElementType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Float32 => "f32",
            Self::Int32 => "i32",
            Self::Int64 => "i64",
        }
    }
}

impl fmt::Display for ElementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed flat storage of an engine tensor (row-major)
#[derive(Clone, Debug, PartialEq)]
pub enum TensorData {
    Float32(Vec<f32>),
    Int32(Vec<i32>),
    Int64(Vec<i64>),
}

impl TensorData {
    pub fn element_type(&self) -> ElementType {
        match self {
            Self::Float32(_) => ElementType::Float32,
            Self::Int32(_) => ElementType::Int32,
            Self::Int64(_) => ElementType::Int64,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Float32(values) => values.len(),
            Self::Int32(values) => values.len(),
            Self::Int64(values) => values.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

mod sealed {
    pub trait Sealed {}
}

/// Scalar types that can be copied out of (and fed into) an engine tensor.
pub trait TensorElement: sealed::Sealed + Copy + fmt::Debug + PartialEq + Send + Sync + 'static {
    const ELEMENT_TYPE: ElementType;

    /// Borrow the storage as `&[Self]` if the dtype matches exactly.
    fn view(data: &TensorData) -> Option<&[Self]>;

    fn wrap(values: Vec<Self>) -> TensorData;
}

macro_rules! impl_tensor_element {
    ($ty:ty, $variant:ident) => {
        impl sealed::Sealed for $ty {}

        impl TensorElement for $ty {
            const ELEMENT_TYPE: ElementType = ElementType::$variant;

            fn view(data: &TensorData) -> Option<&[Self]> {
                match data {
                    TensorData::$variant(values) => Some(values.as_slice()),
                    _ => None,
                }
            }

            fn wrap(values: Vec<Self>) -> TensorData {
                TensorData::$variant(values)
            }
        }
    };
}

impl_tensor_element!(f32, Float32);
impl_tensor_element!(i32, Int32);
impl_tensor_element!(i64, Int64);

/// Tensor as handed over by an inference engine: the engine's own shape
/// descriptor plus typed storage. Nothing here is validated; that is the job
/// of [`copy_tensor`].
#[derive(Clone, Debug, PartialEq)]
pub struct EngineTensor {
    shape: Vec<i64>,
    data: TensorData,
}

impl EngineTensor {
    pub fn new(shape: Vec<i64>, data: TensorData) -> Self {
        Self { shape, data }
    }

    pub fn from_values<T: TensorElement>(shape: Vec<i64>, values: Vec<T>) -> Self {
        Self::new(shape, T::wrap(values))
    }

    /// Zero-dimensional tensor holding a single value
    pub fn scalar<T: TensorElement>(value: T) -> Self {
        Self::new(Vec::new(), T::wrap(vec![value]))
    }

    pub fn shape(&self) -> &[i64] {
        &self.shape
    }

    pub fn data(&self) -> &TensorData {
        &self.data
    }

    pub fn element_type(&self) -> ElementType {
        self.data.element_type()
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TensorError {
    #[error("Type mismatch: expected {expected} tensor, engine produced {actual}")]
    TypeMismatch {
        expected: ElementType,
        actual: ElementType,
    },

    #[error("Negative dimension {dim} in shape {shape:?}")]
    NegativeDimension { shape: Vec<i64>, dim: i64 },

    #[error("Shape {shape:?} describes {expected} elements but the buffer holds {actual}")]
    ShapeMismatch {
        shape: Vec<i64>,
        expected: usize,
        actual: usize,
    },

    #[error("Waveform tensor {shape:?} has more than one non-singleton dimension")]
    NotMono { shape: Vec<i64> },
}

/// Number of elements a shape describes. The empty shape is a scalar (1).
pub fn element_count(shape: &[i64]) -> Result<usize, TensorError> {
    shape.iter().try_fold(1usize, |acc, &dim| {
        let extent = usize::try_from(dim).map_err(|_| TensorError::NegativeDimension {
            shape: shape.to_vec(),
            dim,
        })?;
        Ok(acc.saturating_mul(extent))
    })
}

/// Dense, owned, immutable tensor.
///
/// Invariant: `data.len() == total_size == product(shape)`.
#[derive(Clone, Debug, PartialEq)]
pub struct TensorBuffer<T> {
    data: Vec<T>,
    shape: Vec<i64>,
    total_size: usize,
}

impl<T: TensorElement> TensorBuffer<T> {
    pub fn new(shape: Vec<i64>, data: Vec<T>) -> Result<Self, TensorError> {
        let total_size = element_count(&shape)?;
        if total_size != data.len() {
            return Err(TensorError::ShapeMismatch {
                shape,
                expected: total_size,
                actual: data.len(),
            });
        }

        Ok(Self {
            data,
            shape,
            total_size,
        })
    }

    pub fn scalar(value: T) -> Self {
        Self {
            data: vec![value],
            shape: Vec::new(),
            total_size: 1,
        }
    }

    /// Build from an ndarray in logical (row-major) order.
    pub fn from_array(array: ArrayD<T>) -> Self {
        let shape = array.shape().iter().map(|&d| d as i64).collect();
        let data: Vec<T> = array.iter().copied().collect();
        let total_size = data.len();

        Self {
            data,
            shape,
            total_size,
        }
    }

    pub fn to_array(&self) -> Result<ArrayD<T>, TensorError> {
        let dims: Vec<usize> = self.shape.iter().map(|&d| d as usize).collect();
        ArrayD::from_shape_vec(IxDyn(&dims), self.data.clone()).map_err(|_| {
            TensorError::ShapeMismatch {
                shape: self.shape.clone(),
                expected: self.total_size,
                actual: self.data.len(),
            }
        })
    }

    pub fn data(&self) -> &[T] {
        &self.data
    }

    pub fn shape(&self) -> &[i64] {
        &self.shape
    }

    pub fn total_size(&self) -> usize {
        self.total_size
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    pub fn is_scalar(&self) -> bool {
        self.shape.is_empty()
    }

    pub fn into_data(self) -> Vec<T> {
        self.data
    }

    /// Rewrap as an engine input with the same flat data and shape.
    pub fn to_engine(&self) -> EngineTensor {
        EngineTensor::from_values(self.shape.clone(), self.data.clone())
    }

    pub fn into_engine(self) -> EngineTensor {
        EngineTensor::from_values(self.shape, self.data)
    }
}

/// Copy an engine tensor into an independent [`TensorBuffer`].
///
/// Fails on a dtype mismatch (never coerces) or when the engine's data
/// disagrees with its own shape descriptor.
pub fn copy_tensor<T: TensorElement>(tensor: &EngineTensor) -> Result<TensorBuffer<T>, TensorError> {
    let values = T::view(&tensor.data).ok_or(TensorError::TypeMismatch {
        expected: T::ELEMENT_TYPE,
        actual: tensor.element_type(),
    })?;

    TensorBuffer::new(tensor.shape.clone(), values.to_vec())
}

/// Mono PCM samples produced by the vocoder
#[derive(Clone, Debug, PartialEq)]
pub struct WaveformBuffer {
    samples: Vec<f32>,
    source_shape: Vec<i64>,
}

impl WaveformBuffer {
    /// Accept vocoder output shaped `[T]`, `[1, T]`, `[1, T, 1]`, ... and
    /// reject anything with a second non-singleton axis (batch or channels).
    pub fn from_tensor(buffer: TensorBuffer<f32>) -> Result<Self, TensorError> {
        let wide_axes = buffer.shape().iter().filter(|&&d| d > 1).count();
        if wide_axes > 1 {
            return Err(TensorError::NotMono {
                shape: buffer.shape().to_vec(),
            });
        }

        let source_shape = buffer.shape().to_vec();
        Ok(Self {
            samples: buffer.into_data(),
            source_shape,
        })
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    /// Shape of the vocoder tensor the samples were taken from
    pub fn source_shape(&self) -> &[i64] {
        &self.source_shape
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// A tensor bound to a model's input or output slot name
#[derive(Clone, Debug, PartialEq)]
pub struct NamedTensor {
    pub name: String,
    pub tensor: EngineTensor,
}

/// Named tensors in insertion order. Names are unique keys.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TensorSet {
    entries: Vec<NamedTensor>,
}

impl TensorSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
        }
    }

    /// Insert a tensor; an existing entry with the same name is replaced in place.
    pub fn insert(&mut self, name: impl Into<String>, tensor: EngineTensor) -> &mut Self {
        let name = name.into();
        match self.entries.iter_mut().find(|entry| entry.name == name) {
            Some(entry) => entry.tensor = tensor,
            None => self.entries.push(NamedTensor { name, tensor }),
        }
        self
    }

    pub fn get(&self, name: &str) -> Option<&EngineTensor> {
        self.entries
            .iter()
            .find(|entry| entry.name == name)
            .map(|entry| &entry.tensor)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|entry| entry.name.as_str())
    }

    pub fn iter(&self) -> std::slice::Iter<'_, NamedTensor> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<'a> IntoIterator for &'a TensorSet {
    type Item = &'a NamedTensor;
    type IntoIter = std::slice::Iter<'a, NamedTensor>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

impl IntoIterator for TensorSet {
    type Item = NamedTensor;
    type IntoIter = std::vec::IntoIter<NamedTensor>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array1, Axis};

    #[test]
    fn copy_tensor_preserves_shape_and_data() {
        let engine = EngineTensor::from_values(vec![1, 2, 3], vec![0.5f32; 6]);
        let buffer = copy_tensor::<f32>(&engine).expect("copy should succeed");

        assert_eq!(buffer.shape(), &[1, 2, 3]);
        assert_eq!(buffer.total_size(), 6);
        assert_eq!(buffer.data().len(), buffer.total_size());
        assert_eq!(buffer.rank(), 3);
    }

    #[test]
    fn copy_tensor_is_independent_of_engine_storage() {
        let engine = EngineTensor::from_values(vec![3], vec![1i32, 2, 3]);
        let buffer = copy_tensor::<i32>(&engine).unwrap();
        drop(engine);

        assert_eq!(buffer.data(), &[1, 2, 3]);
    }

    #[test]
    fn copy_tensor_rejects_dtype_mismatch() {
        let engine = EngineTensor::from_values(vec![2], vec![1i64, 2]);
        let err = copy_tensor::<i32>(&engine).expect_err("i64 must not coerce to i32");

        assert_eq!(
            err,
            TensorError::TypeMismatch {
                expected: ElementType::Int32,
                actual: ElementType::Int64,
            }
        );
    }

    #[test]
    fn copy_tensor_rejects_data_that_disagrees_with_shape() {
        let engine = EngineTensor::from_values(vec![2, 3], vec![0.0f32; 5]);
        match copy_tensor::<f32>(&engine) {
            Err(TensorError::ShapeMismatch {
                expected, actual, ..
            }) => {
                assert_eq!(expected, 6);
                assert_eq!(actual, 5);
            }
            other => panic!("expected shape mismatch, got {:?}", other),
        }
    }

    #[test]
    fn copy_tensor_rejects_unresolved_dynamic_dimension() {
        let engine = EngineTensor::from_values(vec![1, -1], vec![0.0f32; 4]);
        assert!(matches!(
            copy_tensor::<f32>(&engine),
            Err(TensorError::NegativeDimension { dim: -1, .. })
        ));
    }

    #[test]
    fn scalar_has_empty_shape_and_one_element() {
        let engine = EngineTensor::scalar(1.0f32);
        let buffer = copy_tensor::<f32>(&engine).unwrap();

        assert!(buffer.is_scalar());
        assert_eq!(buffer.total_size(), 1);
        assert_eq!(buffer, TensorBuffer::scalar(1.0f32));
        assert_eq!(element_count(&[]).unwrap(), 1);
    }

    #[test]
    fn zero_extent_dimension_means_empty_buffer() {
        let buffer = TensorBuffer::<f32>::new(vec![1, 0, 80], Vec::new()).unwrap();
        assert_eq!(buffer.total_size(), 0);
    }

    #[test]
    fn array_conversion_adds_batch_axis() {
        let ids = Array1::from(vec![8i32, 31, 12]).insert_axis(Axis(0)).into_dyn();
        let buffer = TensorBuffer::from_array(ids);

        assert_eq!(buffer.shape(), &[1, 3]);
        assert_eq!(buffer.data(), &[8, 31, 12]);

        let array = buffer.to_array().unwrap();
        assert_eq!(array.shape(), &[1, 3]);
        assert_eq!(array[IxDyn(&[0, 2])], 12);
    }

    #[test]
    fn rewrap_keeps_flat_data_and_shape() {
        let mel = TensorBuffer::new(vec![1, 2, 2], vec![0.1f32, 0.2, 0.3, 0.4]).unwrap();
        let engine = mel.to_engine();

        assert_eq!(engine.shape(), mel.shape());
        assert_eq!(engine.data(), &TensorData::Float32(mel.data().to_vec()));
    }

    #[test]
    fn waveform_squeezes_singleton_axes() {
        let buffer = TensorBuffer::new(vec![1, 4, 1], vec![0.0f32, 0.1, 0.2, 0.3]).unwrap();
        let waveform = WaveformBuffer::from_tensor(buffer).unwrap();

        assert_eq!(waveform.len(), 4);
        assert_eq!(waveform.source_shape(), &[1, 4, 1]);
    }

    #[test]
    fn waveform_rejects_multichannel_tensor() {
        let buffer = TensorBuffer::new(vec![2, 3], vec![0.0f32; 6]).unwrap();
        assert!(matches!(
            WaveformBuffer::from_tensor(buffer),
            Err(TensorError::NotMono { .. })
        ));
    }

    #[test]
    fn tensor_set_preserves_order_and_replaces_by_name() {
        let mut set = TensorSet::new();
        set.insert("ids", EngineTensor::scalar(1i32))
            .insert("speed", EngineTensor::scalar(1.0f32))
            .insert("ids", EngineTensor::scalar(7i32));

        assert_eq!(set.len(), 2);
        assert_eq!(set.names().collect::<Vec<_>>(), vec!["ids", "speed"]);
        assert_eq!(set.get("ids"), Some(&EngineTensor::scalar(7i32)));
        assert!(set.get("missing").is_none());
    }
}
