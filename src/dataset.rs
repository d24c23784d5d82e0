//! Typed n-dimensional arrays, attributes, and the datasets a container holds.
//!
//! A [`Dataset`] is either common (every worker holds the whole array) or distributed (each
//! worker holds a contiguous shard along one dimension). [`DistArray`] is a distributed array on
//! its own, before it is registered in a container.

use std::{fmt::Display, ops::Range};

use indexmap::IndexMap;
use ndarray::{concatenate, ArrayD, Axis, IxDyn, Slice};
use num_complex::Complex;
use serde::{Deserialize, Serialize};
use strum_macros::{Display as StrumDisplay, EnumString};

use crate::{
    axes::Role,
    comm::{partition, split_m, Comm},
    TodError,
};

/// Element type of a [`DataArray`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, StrumDisplay, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum DType {
    /// Single precision complex
    Complex64,
    /// Boolean
    Bool,
    /// Double precision float
    Float64,
    /// 64 bit signed integer
    Int64,
    /// Variable length string
    Str,
}

/// A dynamically-shaped array of one of the supported element types.
#[derive(Debug, Clone, PartialEq)]
pub enum DataArray {
    /// Visibilities
    Complex(ArrayD<Complex<f32>>),
    /// Masks
    Bool(ArrayD<bool>),
    /// Coordinates and other real-valued metadata
    Float(ArrayD<f64>),
    /// Identifiers
    Int(ArrayD<i64>),
    /// Labels
    Str(ArrayD<String>),
}

/// Apply an expression to the array inside any variant, producing the same variant.
macro_rules! map_array {
    ($value:expr, $arr:ident => $body:expr) => {
        match $value {
            DataArray::Complex($arr) => DataArray::Complex($body),
            DataArray::Bool($arr) => DataArray::Bool($body),
            DataArray::Float($arr) => DataArray::Float($body),
            DataArray::Int($arr) => DataArray::Int($body),
            DataArray::Str($arr) => DataArray::Str($body),
        }
    };
}

/// Evaluate an expression on the array inside any variant.
macro_rules! with_array {
    ($value:expr, $arr:ident => $body:expr) => {
        match $value {
            DataArray::Complex($arr) => $body,
            DataArray::Bool($arr) => $body,
            DataArray::Float($arr) => $body,
            DataArray::Int($arr) => $body,
            DataArray::Str($arr) => $body,
        }
    };
}

macro_rules! impl_from_array {
    ($elem:ty, $variant:ident) => {
        impl<D: ndarray::Dimension> From<ndarray::Array<$elem, D>> for DataArray {
            fn from(array: ndarray::Array<$elem, D>) -> Self {
                DataArray::$variant(array.into_dyn())
            }
        }
    };
}

impl_from_array!(Complex<f32>, Complex);
impl_from_array!(bool, Bool);
impl_from_array!(f64, Float);
impl_from_array!(i64, Int);
impl_from_array!(String, Str);

macro_rules! impl_accessors {
    ($variant:ident, $elem:ty, $get:ident, $get_mut:ident, $name:expr) => {
        /// Borrow the array, if it holds this element type.
        ///
        /// # Errors
        ///
        /// [`TodError::DataTypeMismatch`] for any other element type.
        pub fn $get(&self, name: &str) -> Result<&ArrayD<$elem>, TodError> {
            match self {
                DataArray::$variant(array) => Ok(array),
                other => Err(TodError::DataTypeMismatch {
                    name: name.into(),
                    expected: $name.into(),
                    found: other.dtype().to_string(),
                }),
            }
        }

        /// Mutably borrow the array, if it holds this element type.
        ///
        /// # Errors
        ///
        /// [`TodError::DataTypeMismatch`] for any other element type.
        pub fn $get_mut(&mut self, name: &str) -> Result<&mut ArrayD<$elem>, TodError> {
            match self {
                DataArray::$variant(array) => Ok(array),
                other => Err(TodError::DataTypeMismatch {
                    name: name.into(),
                    expected: $name.into(),
                    found: other.dtype().to_string(),
                }),
            }
        }
    };
}

impl Default for DataArray {
    fn default() -> Self {
        DataArray::Bool(ArrayD::default(IxDyn(&[0])))
    }
}

impl DataArray {
    impl_accessors!(Complex, Complex<f32>, as_complex, as_complex_mut, "complex64");
    impl_accessors!(Bool, bool, as_bool, as_bool_mut, "bool");
    impl_accessors!(Float, f64, as_float, as_float_mut, "float64");
    impl_accessors!(Int, i64, as_int, as_int_mut, "int64");
    impl_accessors!(Str, String, as_str, as_str_mut, "str");

    /// The element type.
    pub fn dtype(&self) -> DType {
        match self {
            DataArray::Complex(_) => DType::Complex64,
            DataArray::Bool(_) => DType::Bool,
            DataArray::Float(_) => DType::Float64,
            DataArray::Int(_) => DType::Int64,
            DataArray::Str(_) => DType::Str,
        }
    }

    /// An empty array of the given type with the given shape, filled with the default value.
    pub fn default_of(dtype: DType, shape: &[usize]) -> Self {
        let shape = IxDyn(shape);
        match dtype {
            DType::Complex64 => DataArray::Complex(ArrayD::default(shape)),
            DType::Bool => DataArray::Bool(ArrayD::default(shape)),
            DType::Float64 => DataArray::Float(ArrayD::default(shape)),
            DType::Int64 => DataArray::Int(ArrayD::default(shape)),
            DType::Str => DataArray::Str(ArrayD::default(shape)),
        }
    }

    /// The local shape.
    pub fn shape(&self) -> &[usize] {
        with_array!(self, array => array.shape())
    }

    /// The number of dimensions.
    pub fn ndim(&self) -> usize {
        self.shape().len()
    }

    /// The total number of elements.
    pub fn len(&self) -> usize {
        with_array!(self, array => array.len())
    }

    /// Whether the array has no elements.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The length along `dim`.
    pub fn len_of(&self, dim: usize) -> usize {
        self.shape()[dim]
    }

    /// Move the array out, leaving an empty placeholder.
    pub fn take(&mut self) -> Self {
        std::mem::take(self)
    }

    /// Select `idxs` along `dim`, in the given order.
    pub fn select(&self, dim: usize, idxs: &[usize]) -> Self {
        map_array!(self, array => array.select(Axis(dim), idxs))
    }

    /// A copy of the contiguous `range` along `dim`.
    pub fn slice_dim(&self, dim: usize, range: Range<usize>) -> Self {
        map_array!(self, array => array.slice_axis(Axis(dim), Slice::from(range)).to_owned())
    }

    /// Split along `dim` into consecutive pieces of the given lengths.
    pub fn split_dim(&self, dim: usize, counts: &[usize]) -> Vec<Self> {
        let mut start = 0;
        counts
            .iter()
            .map(|&count| {
                let piece = self.slice_dim(dim, start..start + count);
                start += count;
                piece
            })
            .collect()
    }

    /// Rotate elements along `dim` by `shift` places, like `numpy.roll`.
    pub fn roll(&self, dim: usize, shift: isize) -> Self {
        let len = self.len_of(dim);
        if len == 0 {
            return self.clone();
        }
        let shift = shift.rem_euclid(len as isize) as usize;
        let idxs: Vec<usize> = (0..len).map(|idx| (idx + len - shift) % len).collect();
        self.select(dim, &idxs)
    }

    /// Join arrays of the same type along `dim`.
    ///
    /// # Errors
    ///
    /// - [`TodError::DataTypeMismatch`] if the parts hold different element types
    /// - [`TodError::BadArrayShape`] if there are no parts, or they disagree off `dim`
    pub fn concatenate(dim: usize, parts: &[DataArray]) -> Result<Self, TodError> {
        let first = parts.first().ok_or_else(|| TodError::BadArrayShape {
            argument: "parts".into(),
            function: "DataArray::concatenate".into(),
            expected: "at least one part".into(),
            received: "none".into(),
        })?;

        macro_rules! concat_variant {
            ($variant:ident, $dtype:expr) => {{
                let views = parts
                    .iter()
                    .map(|part| match part {
                        DataArray::$variant(array) => Ok(array.view()),
                        other => Err(TodError::DataTypeMismatch {
                            name: "concatenate".into(),
                            expected: $dtype.to_string(),
                            found: other.dtype().to_string(),
                        }),
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                DataArray::$variant(concatenate(Axis(dim), &views).map_err(|e| {
                    TodError::BadArrayShape {
                        argument: "parts".into(),
                        function: "DataArray::concatenate".into(),
                        expected: format!("equal extents except along dimension {dim}"),
                        received: e.to_string(),
                    }
                })?)
            }};
        }

        Ok(match first {
            DataArray::Complex(_) => concat_variant!(Complex, DType::Complex64),
            DataArray::Bool(_) => concat_variant!(Bool, DType::Bool),
            DataArray::Float(_) => concat_variant!(Float, DType::Float64),
            DataArray::Int(_) => concat_variant!(Int, DType::Int64),
            DataArray::Str(_) => concat_variant!(Str, DType::Str),
        })
    }

    /// Wrap a single integer, used for small collective messages.
    pub fn scalar(value: i64) -> Self {
        DataArray::Int(ndarray::arr0(value).into_dyn())
    }
}

/// Allocate an array of the given shape filled with `fill`.
///
/// # Errors
///
/// can raise [`TodError::InsufficientMemory`] if not enough memory.
pub fn allocate<T: Clone>(shape: &[usize], fill: T) -> Result<ArrayD<T>, TodError> {
    let num_elems = shape.iter().product::<usize>();
    let mut v = Vec::new();
    if v.try_reserve_exact(num_elems) == Ok(()) {
        // Make the vector's length equal to its new capacity.
        v.resize(num_elems, fill);
        ArrayD::from_shape_vec(IxDyn(shape), v).map_err(|e| TodError::BadArrayShape {
            argument: "shape".into(),
            function: "allocate".into(),
            expected: format!("{num_elems} elements"),
            received: e.to_string(),
        })
    } else {
        let need_gib = num_elems * std::mem::size_of::<T>() / 1024_usize.pow(3);
        Err(TodError::InsufficientMemory { need_gib })
    }
}

/// A metadata value attached to a container or dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttrValue {
    /// A flag
    Bool(bool),
    /// An integer
    Int(i64),
    /// A float
    Float(f64),
    /// Text
    Str(String),
    /// Integers
    IntList(Vec<i64>),
    /// Floats
    FloatList(Vec<f64>),
    /// Text values
    StrList(Vec<String>),
}

impl AttrValue {
    /// The value as a float, if it is numeric.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            AttrValue::Int(value) => Some(*value as f64),
            AttrValue::Float(value) => Some(*value),
            _ => None,
        }
    }

    /// The value as text, if it is text.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttrValue::Str(value) => Some(value),
            _ => None,
        }
    }
}

impl Display for AttrValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AttrValue::Bool(value) => write!(f, "{value}"),
            AttrValue::Int(value) => write!(f, "{value}"),
            AttrValue::Float(value) => write!(f, "{value}"),
            AttrValue::Str(value) => write!(f, "{value}"),
            AttrValue::IntList(values) => write!(f, "{values:?}"),
            AttrValue::FloatList(values) => write!(f, "{values:?}"),
            AttrValue::StrList(values) => write!(f, "{values:?}"),
        }
    }
}

impl From<&str> for AttrValue {
    fn from(value: &str) -> Self {
        AttrValue::Str(value.into())
    }
}

impl From<String> for AttrValue {
    fn from(value: String) -> Self {
        AttrValue::Str(value)
    }
}

impl From<f64> for AttrValue {
    fn from(value: f64) -> Self {
        AttrValue::Float(value)
    }
}

impl From<i64> for AttrValue {
    fn from(value: i64) -> Self {
        AttrValue::Int(value)
    }
}

impl From<bool> for AttrValue {
    fn from(value: bool) -> Self {
        AttrValue::Bool(value)
    }
}

/// Ordered attribute mapping.
pub type Attrs = IndexMap<String, AttrValue>;

/// How a dataset is laid out across workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Layout {
    /// Every worker holds the whole array.
    Common,
    /// Each worker holds a near-even contiguous shard along `dim`.
    Distributed {
        /// The partitioned dimension
        dim: usize,
        /// The length of the whole array along `dim`
        global_len: usize,
    },
}

/// A distributed array: this worker's shard plus where it sits in the whole.
#[derive(Debug, Clone, PartialEq)]
pub struct DistArray {
    /// This worker's shard
    pub local: DataArray,
    /// The partitioned dimension
    pub dim: usize,
    /// The length of the whole array along `dim`
    pub global_len: usize,
}

impl DistArray {
    /// Take this worker's shard of an array every worker holds in full.
    pub fn from_global(global: &DataArray, dim: usize, comm: &Comm) -> Self {
        let global_len = global.len_of(dim);
        Self {
            local: global.slice_dim(dim, partition(global_len, comm.size(), comm.rank())),
            dim,
            global_len,
        }
    }

    /// Wrap shards that every worker already holds. Collective.
    ///
    /// # Errors
    ///
    /// [`TodError::BadArrayShape`] if the shards are not a near-even split along `dim`.
    pub fn wrap(local: DataArray, dim: usize, comm: &Comm) -> Result<Self, TodError> {
        let lens = comm.all_gather_usize(local.len_of(dim))?;
        let global_len = lens.iter().sum();
        let expected = split_m(global_len, comm.size());
        if lens != expected {
            return Err(TodError::BadArrayShape {
                argument: "local".into(),
                function: "DistArray::wrap".into(),
                expected: format!("shard lengths {expected:?}"),
                received: format!("{lens:?}"),
            });
        }
        Ok(Self {
            local,
            dim,
            global_len,
        })
    }

    /// The shape of the whole array.
    pub fn global_shape(&self) -> Vec<usize> {
        let mut shape = self.local.shape().to_vec();
        shape[self.dim] = self.global_len;
        shape
    }

    /// The range of global indices along `dim` held by this worker.
    pub fn local_range(&self, comm: &Comm) -> Range<usize> {
        partition(self.global_len, comm.size(), comm.rank())
    }

    /// Assemble the whole array on every worker. Collective.
    ///
    /// # Errors
    ///
    /// Propagates communication and concatenation errors.
    pub fn gather_all(&self, comm: &Comm) -> Result<DataArray, TodError> {
        let parts = comm.all_gather(self.local.clone())?;
        DataArray::concatenate(self.dim, &parts)
    }

    /// Repartition along `new_dim` with an all-to-all exchange. Collective.
    ///
    /// Rows keep their order along every dimension.
    ///
    /// # Errors
    ///
    /// Propagates communication and concatenation errors.
    pub fn redistribute(self, new_dim: usize, comm: &Comm) -> Result<Self, TodError> {
        if new_dim == self.dim {
            return Ok(self);
        }
        let new_global_len = self.local.len_of(new_dim);
        let pieces = self
            .local
            .split_dim(new_dim, &split_m(new_global_len, comm.size()));
        let received = comm.all_to_all(pieces)?;
        Ok(Self {
            local: DataArray::concatenate(self.dim, &received)?,
            dim: new_dim,
            global_len: new_global_len,
        })
    }
}

/// What [`crate::Container::create_dataset`] accepts: a whole array or a distributed one.
#[derive(Debug, Clone)]
pub enum Payload {
    /// Every worker passes the same whole array.
    Common(DataArray),
    /// Every worker passes its shard.
    Distributed(DistArray),
}

impl From<DataArray> for Payload {
    fn from(data: DataArray) -> Self {
        Payload::Common(data)
    }
}

impl From<DistArray> for Payload {
    fn from(data: DistArray) -> Self {
        Payload::Distributed(data)
    }
}

/// A named entry in a container.
#[derive(Debug, Clone, PartialEq)]
pub struct Dataset {
    /// This worker's part of the data
    pub data: DataArray,
    /// How the data is spread across workers
    pub layout: Layout,
    /// How the dimensions line up with the main data
    pub role: Role,
    /// Dataset attributes
    pub attrs: Attrs,
}

impl Dataset {
    /// The shape of the whole dataset.
    pub fn global_shape(&self) -> Vec<usize> {
        let mut shape = self.data.shape().to_vec();
        if let Layout::Distributed { dim, global_len } = self.layout {
            shape[dim] = global_len;
        }
        shape
    }

    /// The partitioned dimension, if distributed.
    pub fn dist_dim(&self) -> Option<usize> {
        match self.layout {
            Layout::Distributed { dim, .. } => Some(dim),
            Layout::Common => None,
        }
    }

    /// Assemble the whole dataset on every worker. Collective for distributed datasets.
    ///
    /// # Errors
    ///
    /// Propagates communication errors.
    pub fn gather_all(&self, comm: &Comm) -> Result<DataArray, TodError> {
        match self.layout {
            Layout::Common => Ok(self.data.clone()),
            Layout::Distributed { dim, global_len } => DistArray {
                local: self.data.clone(),
                dim,
                global_len,
            }
            .gather_all(comm),
        }
    }
}
