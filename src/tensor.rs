//! Runtime tensor descriptors
//!
//! Two descriptor tiers exist, mirroring the split in the runtime they feed:
//! [`EvalTensor`] is the minimal per-tensor record the inference loop reads
//! on every invocation, [`FullTensor`] is the richer view (quantization
//! included) produced on demand during operator preparation.
//!
//! Buffer contents are addressed by [`DataRef`] values - an index pair
//! naming either the serialized model bytes (constants, read in place) or
//! an offset inside the arena (planned buffers). No raw pointers cross the
//! module boundary.

use crate::error::{ForgeResult, MicroForgeError};

/// Element type of a tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementType {
    F32,
    F16,
    I8,
    U8,
    I16,
    I32,
    I64,
    Bool,
}

impl ElementType {
    /// Size of a single element in bytes.
    pub fn byte_size(&self) -> usize {
        match self {
            ElementType::F32 | ElementType::I32 => 4,
            ElementType::F16 | ElementType::I16 => 2,
            ElementType::I8 | ElementType::U8 | ElementType::Bool => 1,
            ElementType::I64 => 8,
        }
    }

    /// Decode from the serialized type code.
    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(ElementType::F32),
            1 => Some(ElementType::F16),
            2 => Some(ElementType::I8),
            3 => Some(ElementType::U8),
            4 => Some(ElementType::I16),
            5 => Some(ElementType::I32),
            6 => Some(ElementType::I64),
            7 => Some(ElementType::Bool),
            _ => None,
        }
    }

    /// Serialized type code.
    pub fn code(&self) -> u32 {
        match self {
            ElementType::F32 => 0,
            ElementType::F16 => 1,
            ElementType::I8 => 2,
            ElementType::U8 => 3,
            ElementType::I16 => 4,
            ElementType::I32 => 5,
            ElementType::I64 => 6,
            ElementType::Bool => 7,
        }
    }

    /// String tag for diagnostics.
    pub fn as_str(&self) -> &'static str {
        match self {
            ElementType::F32 => "f32",
            ElementType::F16 => "f16",
            ElementType::I8 => "i8",
            ElementType::U8 => "u8",
            ElementType::I16 => "i16",
            ElementType::I32 => "i32",
            ElementType::I64 => "i64",
            ElementType::Bool => "bool",
        }
    }
}

/// Integer array view (shapes, operator index lists).
///
/// On little-endian hosts this aliases the serialized little-endian words
/// zero-copy; the model buffer must outlive the view. On big-endian hosts
/// construction copies into a host-order vector, swapping element by
/// element. The choice is invisible to callers.
#[derive(Debug, Clone)]
pub enum IntArray<'m> {
    /// Zero-copy view of i32 little-endian words in the model buffer.
    Model(&'m [u8]),
    /// Host-order copy.
    Owned(Vec<i32>),
}

impl<'m> IntArray<'m> {
    /// Wrap a serialized word array, choosing the zero-copy path when the
    /// host layout matches the wire layout.
    pub fn from_model(bytes: &'m [u8]) -> Self {
        debug_assert_eq!(bytes.len() % 4, 0);
        if cfg!(target_endian = "little") {
            IntArray::Model(bytes)
        } else {
            let words = bytes
                .chunks_exact(4)
                .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect();
            IntArray::Owned(words)
        }
    }

    /// A zero-length array (scalar tensor shapes).
    pub fn empty() -> Self {
        IntArray::Owned(Vec::new())
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        match self {
            IntArray::Model(bytes) => bytes.len() / 4,
            IntArray::Owned(words) => words.len(),
        }
    }

    /// True if the array holds no elements.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Element at `index`. Panics if out of range, like slice indexing.
    pub fn get(&self, index: usize) -> i32 {
        match self {
            IntArray::Model(bytes) => {
                let at = index * 4;
                i32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
            }
            IntArray::Owned(words) => words[index],
        }
    }

    /// Iterate over the elements.
    pub fn iter(&self) -> impl Iterator<Item = i32> + '_ {
        (0..self.len()).map(move |i| self.get(i))
    }

    /// Copy into an owned vector.
    pub fn to_vec(&self) -> Vec<i32> {
        self.iter().collect()
    }
}

/// Float array view (per-channel quantization scales).
///
/// Same endianness contract as [`IntArray`].
#[derive(Debug, Clone)]
pub enum FloatArray<'m> {
    /// Zero-copy view of f32 little-endian words in the model buffer.
    Model(&'m [u8]),
    /// Host-order copy.
    Owned(Vec<f32>),
}

impl<'m> FloatArray<'m> {
    /// Wrap a serialized word array, zero-copy where the layouts match.
    pub fn from_model(bytes: &'m [u8]) -> Self {
        debug_assert_eq!(bytes.len() % 4, 0);
        if cfg!(target_endian = "little") {
            FloatArray::Model(bytes)
        } else {
            let words = bytes
                .chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect();
            FloatArray::Owned(words)
        }
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        match self {
            FloatArray::Model(bytes) => bytes.len() / 4,
            FloatArray::Owned(words) => words.len(),
        }
    }

    /// True if the array holds no elements.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Element at `index`. Panics if out of range, like slice indexing.
    pub fn get(&self, index: usize) -> f32 {
        match self {
            FloatArray::Model(bytes) => {
                let at = index * 4;
                f32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
            }
            FloatArray::Owned(words) => words[index],
        }
    }

    /// Iterate over the elements.
    pub fn iter(&self) -> impl Iterator<Item = f32> + '_ {
        (0..self.len()).map(move |i| self.get(i))
    }
}

/// Where a tensor's payload bytes live.
///
/// Resolved to slices through the model or the arena; committed once by the
/// memory plan and stable for the lifetime of the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataRef {
    /// Constant payload aliasing the serialized model bytes.
    Model { start: usize, len: usize },
    /// Planned payload at an offset from the arena's aligned base.
    Arena { offset: usize },
}

impl DataRef {
    /// True for buffers placed inside the arena.
    pub fn is_arena(&self) -> bool {
        matches!(self, DataRef::Arena { .. })
    }

    /// True for buffers aliasing model bytes.
    pub fn is_model(&self) -> bool {
        matches!(self, DataRef::Model { .. })
    }
}

/// Runtime tensor descriptor consumed by the inference loop.
///
/// `data` is `None` until the static plan commits (or forever, for tensors
/// the graph never materializes).
#[derive(Debug, Clone)]
pub struct EvalTensor<'m> {
    pub dtype: ElementType,
    pub shape: IntArray<'m>,
    pub data: Option<DataRef>,
}

impl<'m> EvalTensor<'m> {
    /// Number of elements implied by the shape. A zero-rank shape is a
    /// scalar with one element.
    pub fn element_count(&self) -> ForgeResult<usize> {
        let mut count: usize = 1;
        for dim in self.shape.iter() {
            if dim < 0 {
                return Err(MicroForgeError::InvalidModelFile(format!(
                    "negative dimension {dim} in tensor shape"
                )));
            }
            count = count.checked_mul(dim as usize).ok_or_else(|| {
                MicroForgeError::InvalidModelFile("tensor shape overflows usize".to_string())
            })?;
        }
        Ok(count)
    }

    /// Byte footprint of the tensor payload.
    pub fn byte_length(&self) -> ForgeResult<usize> {
        self.element_count()?
            .checked_mul(self.dtype.byte_size())
            .ok_or_else(|| {
                MicroForgeError::InvalidModelFile("tensor byte length overflows usize".to_string())
            })
    }
}

/// Per-tensor quantization parameters (channel 0 of the per-channel data).
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct QuantizationParams {
    pub scale: f32,
    pub zero_point: i32,
}

/// Per-channel affine quantization.
///
/// Scales alias the model on little-endian hosts. Zero points are stored as
/// i64 in the container but the kernels consume i32, so they are always
/// narrowed into an owned vector.
#[derive(Debug, Clone)]
pub struct AffineQuantization<'m> {
    pub scales: FloatArray<'m>,
    pub zero_points: Vec<i32>,
    pub quantized_dimension: i32,
}

/// Rich tensor descriptor produced on demand for operator preparation.
///
/// Persistent instances live for the session; temporary instances are valid
/// until the next `reset_temp_allocations` on the owning allocator.
#[derive(Debug, Clone)]
pub struct FullTensor<'m> {
    pub dtype: ElementType,
    pub shape: IntArray<'m>,
    pub data: Option<DataRef>,
    pub bytes: usize,
    pub is_variable: bool,
    pub params: QuantizationParams,
    pub quantization: Option<AffineQuantization<'m>>,
}
