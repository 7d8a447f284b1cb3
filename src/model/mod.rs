//! `.mfge` model container - flat, position-independent serialized graph.
//!
//! Layout (all integers u32 little-endian unless noted):
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │ Magic: "MFGE" (4 bytes), version u32         │
//! │ subgraph_count u32 (must be 1)               │
//! │ buffer / opcode / metadata counts + tables   │
//! │ subgraph_off u32                             │
//! ├──────────────────────────────────────────────┤
//! │ Payload area: buffer blobs (16-aligned),     │
//! │ name strings, shape and index word arrays,   │
//! │ quantization arrays, operator options        │
//! ├──────────────────────────────────────────────┤
//! │ Tables: buffers, opcodes, metadata,          │
//! │ tensors, operators, subgraph header          │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! All `*_off` fields are absolute byte offsets from the start of the
//! buffer, so the container can be memory-mapped or embedded in flash and
//! read in place. [`Model`] borrows the bytes and validates bounds on
//! every access; it never copies tensor payloads. [`ModelBuilder`] is the
//! writer counterpart used by tests, benchmarks and tooling.

mod builder;

pub use builder::ModelBuilder;

use crate::error::{ForgeResult, MicroForgeError};
use crate::tensor::{ElementType, FloatArray, IntArray};

/// Magic bytes identifying a .mfge container.
pub const MAGIC: &[u8; 4] = b"MFGE";

/// Supported container version.
pub const VERSION: u32 = 1;

/// Sentinel `quant_off` for tensors without quantization.
pub const NO_QUANTIZATION: u32 = u32::MAX;

/// Metadata entry name carrying an offline memory plan.
pub const OFFLINE_MEMORY_ALLOCATION_METADATA: &str = "OfflineMemoryAllocation";

/// Tensor flag bit: state persists across invocations.
pub const FLAG_VARIABLE: u32 = 1;

pub(crate) const HEADER_LEN: usize = 40;
pub(crate) const SUBGRAPH_HEADER_LEN: usize = 32;
pub(crate) const BUFFER_ENTRY_LEN: usize = 8;
pub(crate) const OPCODE_ENTRY_LEN: usize = 12;
pub(crate) const METADATA_ENTRY_LEN: usize = 12;
pub(crate) const TENSOR_RECORD_LEN: usize = 24;
pub(crate) const OPERATOR_RECORD_LEN: usize = 36;
pub(crate) const QUANT_RECORD_LEN: usize = 16;

fn invalid(msg: impl Into<String>) -> MicroForgeError {
    MicroForgeError::InvalidModelFile(msg.into())
}

fn read_u32(bytes: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([bytes[off], bytes[off + 1], bytes[off + 2], bytes[off + 3]])
}

/// Opcode table entry: a builtin code plus, for custom operators, a name.
#[derive(Debug, Clone, Copy)]
pub struct OpcodeView<'a> {
    pub builtin_code: u32,
    pub name: &'a str,
}

/// Metadata table entry: a name and the index of the buffer it points at.
#[derive(Debug, Clone, Copy)]
pub struct MetadataView<'a> {
    pub name: &'a str,
    pub buffer: usize,
}

/// Per-channel quantization record view.
#[derive(Debug, Clone, Copy)]
pub struct QuantizationView<'a> {
    pub channel_count: usize,
    pub quantized_dimension: u32,
    scales_bytes: &'a [u8],
    zero_point_bytes: &'a [u8],
}

impl<'a> QuantizationView<'a> {
    /// Per-channel scales (f32), zero-copy on little-endian hosts.
    pub fn scales(&self) -> FloatArray<'a> {
        FloatArray::from_model(self.scales_bytes)
    }

    /// Zero point for `channel`, stored as i64 in the container.
    pub fn zero_point(&self, channel: usize) -> i64 {
        let at = channel * 8;
        let mut word = [0u8; 8];
        word.copy_from_slice(&self.zero_point_bytes[at..at + 8]);
        i64::from_le_bytes(word)
    }
}

/// Serialized tensor view.
#[derive(Debug, Clone, Copy)]
pub struct TensorView<'a> {
    pub dtype: ElementType,
    pub is_variable: bool,
    pub buffer: usize,
    pub quantization: Option<QuantizationView<'a>>,
    shape_bytes: &'a [u8],
}

impl<'a> TensorView<'a> {
    /// Tensor shape as a runtime integer array.
    pub fn shape(&self) -> IntArray<'a> {
        IntArray::from_model(self.shape_bytes)
    }
}

/// Serialized operator view.
#[derive(Debug, Clone, Copy)]
pub struct OperatorView<'a> {
    pub opcode_index: usize,
    pub builtin_options: Option<&'a [u8]>,
    pub custom_options: Option<&'a [u8]>,
    inputs_bytes: &'a [u8],
    outputs_bytes: &'a [u8],
}

impl<'a> OperatorView<'a> {
    /// Input tensor indices.
    pub fn inputs(&self) -> IntArray<'a> {
        IntArray::from_model(self.inputs_bytes)
    }

    /// Output tensor indices.
    pub fn outputs(&self) -> IntArray<'a> {
        IntArray::from_model(self.outputs_bytes)
    }
}

/// Zero-copy reader over a serialized model.
///
/// Construction validates the magic, the version, the single-subgraph
/// restriction and the extents of every table; per-record payload offsets
/// are validated on access. The borrowed buffer must outlive inference:
/// constant tensors are read in place.
#[derive(Debug)]
pub struct Model<'a> {
    bytes: &'a [u8],
    buffer_count: usize,
    buffer_table: usize,
    opcode_count: usize,
    opcode_table: usize,
    metadata_count: usize,
    metadata_table: usize,
    tensor_count: usize,
    tensor_table: usize,
    operator_count: usize,
    operator_table: usize,
    inputs_off: usize,
    inputs_len: usize,
    outputs_off: usize,
    outputs_len: usize,
}

impl<'a> Model<'a> {
    /// Parse and validate a serialized model.
    pub fn from_bytes(bytes: &'a [u8]) -> ForgeResult<Self> {
        if bytes.len() < HEADER_LEN {
            return Err(invalid(format!(
                "container too small: {} bytes, header needs {HEADER_LEN}",
                bytes.len()
            )));
        }
        if &bytes[0..4] != MAGIC {
            return Err(invalid("bad magic (expected MFGE)"));
        }
        let version = read_u32(bytes, 4);
        if version != VERSION {
            return Err(invalid(format!(
                "unsupported container version {version} (expected {VERSION})"
            )));
        }
        let subgraph_count = read_u32(bytes, 8);
        if subgraph_count != 1 {
            return Err(MicroForgeError::UnsupportedModel(format!(
                "only 1 subgraph is supported, model has {subgraph_count}"
            )));
        }

        let buffer_count = read_u32(bytes, 12) as usize;
        let buffer_table = read_u32(bytes, 16) as usize;
        let opcode_count = read_u32(bytes, 20) as usize;
        let opcode_table = read_u32(bytes, 24) as usize;
        let metadata_count = read_u32(bytes, 28) as usize;
        let metadata_table = read_u32(bytes, 32) as usize;
        let subgraph_off = read_u32(bytes, 36) as usize;

        check_extent(bytes, buffer_table, buffer_count, BUFFER_ENTRY_LEN, "buffer table")?;
        check_extent(bytes, opcode_table, opcode_count, OPCODE_ENTRY_LEN, "opcode table")?;
        check_extent(
            bytes,
            metadata_table,
            metadata_count,
            METADATA_ENTRY_LEN,
            "metadata table",
        )?;
        check_extent(bytes, subgraph_off, 1, SUBGRAPH_HEADER_LEN, "subgraph header")?;

        let tensor_count = read_u32(bytes, subgraph_off) as usize;
        let tensor_table = read_u32(bytes, subgraph_off + 4) as usize;
        let operator_count = read_u32(bytes, subgraph_off + 8) as usize;
        let operator_table = read_u32(bytes, subgraph_off + 12) as usize;
        let inputs_off = read_u32(bytes, subgraph_off + 16) as usize;
        let inputs_len = read_u32(bytes, subgraph_off + 20) as usize;
        let outputs_off = read_u32(bytes, subgraph_off + 24) as usize;
        let outputs_len = read_u32(bytes, subgraph_off + 28) as usize;

        check_extent(bytes, tensor_table, tensor_count, TENSOR_RECORD_LEN, "tensor table")?;
        check_extent(
            bytes,
            operator_table,
            operator_count,
            OPERATOR_RECORD_LEN,
            "operator table",
        )?;
        check_extent(bytes, inputs_off, inputs_len, 4, "subgraph inputs")?;
        check_extent(bytes, outputs_off, outputs_len, 4, "subgraph outputs")?;

        Ok(Model {
            bytes,
            buffer_count,
            buffer_table,
            opcode_count,
            opcode_table,
            metadata_count,
            metadata_table,
            tensor_count,
            tensor_table,
            operator_count,
            operator_table,
            inputs_off,
            inputs_len,
            outputs_off,
            outputs_len,
        })
    }

    /// Total container size in bytes.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// True for a zero-length container (never constructs; kept for API symmetry).
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Number of raw byte buffers.
    pub fn buffer_count(&self) -> usize {
        self.buffer_count
    }

    /// Number of opcode table entries.
    pub fn opcode_count(&self) -> usize {
        self.opcode_count
    }

    /// Number of metadata entries.
    pub fn metadata_count(&self) -> usize {
        self.metadata_count
    }

    /// Number of tensors in the subgraph.
    pub fn tensor_count(&self) -> usize {
        self.tensor_count
    }

    /// Number of operators in the subgraph.
    pub fn operator_count(&self) -> usize {
        self.operator_count
    }

    /// Bounds-checked view of a payload byte range.
    pub fn bytes_at(&self, off: usize, len: usize) -> ForgeResult<&'a [u8]> {
        let end = off
            .checked_add(len)
            .ok_or_else(|| invalid("payload range overflows"))?;
        if end > self.bytes.len() {
            return Err(invalid(format!(
                "payload range [{off}, {end}) outside container of {} bytes",
                self.bytes.len()
            )));
        }
        Ok(&self.bytes[off..end])
    }

    /// Byte range (offset, length) of buffer `index` within the container.
    pub fn buffer_range(&self, index: usize) -> ForgeResult<(usize, usize)> {
        if index >= self.buffer_count {
            return Err(invalid(format!(
                "buffer index {index} out of range ({} buffers)",
                self.buffer_count
            )));
        }
        let at = self.buffer_table + index * BUFFER_ENTRY_LEN;
        let off = read_u32(self.bytes, at) as usize;
        let len = read_u32(self.bytes, at + 4) as usize;
        self.bytes_at(off, len)?;
        Ok((off, len))
    }

    /// Contents of buffer `index` (empty slice for the empty buffer).
    pub fn buffer(&self, index: usize) -> ForgeResult<&'a [u8]> {
        let (off, len) = self.buffer_range(index)?;
        self.bytes_at(off, len)
    }

    /// Opcode table entry `index`.
    pub fn opcode(&self, index: usize) -> ForgeResult<OpcodeView<'a>> {
        if index >= self.opcode_count {
            return Err(invalid(format!(
                "opcode index {index} out of range ({} opcodes)",
                self.opcode_count
            )));
        }
        let at = self.opcode_table + index * OPCODE_ENTRY_LEN;
        let builtin_code = read_u32(self.bytes, at);
        let name_off = read_u32(self.bytes, at + 4) as usize;
        let name_len = read_u32(self.bytes, at + 8) as usize;
        let name = std::str::from_utf8(self.bytes_at(name_off, name_len)?)
            .map_err(|_| invalid("opcode name is not valid UTF-8"))?;
        Ok(OpcodeView { builtin_code, name })
    }

    /// Metadata entry `index`.
    pub fn metadata(&self, index: usize) -> ForgeResult<MetadataView<'a>> {
        if index >= self.metadata_count {
            return Err(invalid(format!(
                "metadata index {index} out of range ({} entries)",
                self.metadata_count
            )));
        }
        let at = self.metadata_table + index * METADATA_ENTRY_LEN;
        let name_off = read_u32(self.bytes, at) as usize;
        let name_len = read_u32(self.bytes, at + 4) as usize;
        let buffer = read_u32(self.bytes, at + 8) as usize;
        let name = std::str::from_utf8(self.bytes_at(name_off, name_len)?)
            .map_err(|_| invalid("metadata name is not valid UTF-8"))?;
        Ok(MetadataView { name, buffer })
    }

    /// First metadata entry with the given name, if any.
    pub fn find_metadata(&self, name: &str) -> ForgeResult<Option<MetadataView<'a>>> {
        for i in 0..self.metadata_count {
            let entry = self.metadata(i)?;
            if entry.name == name {
                return Ok(Some(entry));
            }
        }
        Ok(None)
    }

    /// Tensor record `index`.
    pub fn tensor(&self, index: usize) -> ForgeResult<TensorView<'a>> {
        if index >= self.tensor_count {
            return Err(invalid(format!(
                "tensor index {index} out of range ({} tensors)",
                self.tensor_count
            )));
        }
        let at = self.tensor_table + index * TENSOR_RECORD_LEN;
        let dtype_code = read_u32(self.bytes, at);
        let flags = read_u32(self.bytes, at + 4);
        let buffer = read_u32(self.bytes, at + 8) as usize;
        let shape_off = read_u32(self.bytes, at + 12) as usize;
        let shape_len = read_u32(self.bytes, at + 16) as usize;
        let quant_off = read_u32(self.bytes, at + 20);

        let dtype = ElementType::from_code(dtype_code).ok_or_else(|| {
            MicroForgeError::UnsupportedModel(format!(
                "tensor {index} has unknown element type code {dtype_code}"
            ))
        })?;
        let shape_bytes = self.bytes_at(shape_off, shape_len * 4)?;
        let quantization = if quant_off == NO_QUANTIZATION {
            None
        } else {
            Some(self.quantization(quant_off as usize)?)
        };

        Ok(TensorView {
            dtype,
            is_variable: flags & FLAG_VARIABLE != 0,
            buffer,
            quantization,
            shape_bytes,
        })
    }

    fn quantization(&self, off: usize) -> ForgeResult<QuantizationView<'a>> {
        let record = self.bytes_at(off, QUANT_RECORD_LEN)?;
        let channel_count = read_u32(record, 0) as usize;
        let quantized_dimension = read_u32(record, 4);
        let scales_off = read_u32(record, 8) as usize;
        let zero_point_off = read_u32(record, 12) as usize;
        let scales_bytes = self.bytes_at(scales_off, channel_count * 4)?;
        let zero_point_bytes = self.bytes_at(zero_point_off, channel_count * 8)?;
        Ok(QuantizationView {
            channel_count,
            quantized_dimension,
            scales_bytes,
            zero_point_bytes,
        })
    }

    /// Operator record `index`.
    pub fn operator(&self, index: usize) -> ForgeResult<OperatorView<'a>> {
        if index >= self.operator_count {
            return Err(invalid(format!(
                "operator index {index} out of range ({} operators)",
                self.operator_count
            )));
        }
        let at = self.operator_table + index * OPERATOR_RECORD_LEN;
        let opcode_index = read_u32(self.bytes, at) as usize;
        let inputs_off = read_u32(self.bytes, at + 4) as usize;
        let inputs_len = read_u32(self.bytes, at + 8) as usize;
        let outputs_off = read_u32(self.bytes, at + 12) as usize;
        let outputs_len = read_u32(self.bytes, at + 16) as usize;
        let builtin_off = read_u32(self.bytes, at + 20) as usize;
        let builtin_len = read_u32(self.bytes, at + 24) as usize;
        let custom_off = read_u32(self.bytes, at + 28) as usize;
        let custom_len = read_u32(self.bytes, at + 32) as usize;

        let inputs_bytes = self.bytes_at(inputs_off, inputs_len * 4)?;
        let outputs_bytes = self.bytes_at(outputs_off, outputs_len * 4)?;
        let builtin_options = if builtin_off == 0 && builtin_len == 0 {
            None
        } else {
            Some(self.bytes_at(builtin_off, builtin_len)?)
        };
        let custom_options = if custom_off == 0 && custom_len == 0 {
            None
        } else {
            Some(self.bytes_at(custom_off, custom_len)?)
        };

        Ok(OperatorView {
            opcode_index,
            builtin_options,
            custom_options,
            inputs_bytes,
            outputs_bytes,
        })
    }

    /// Subgraph input tensor indices.
    pub fn inputs(&self) -> ForgeResult<IntArray<'a>> {
        Ok(IntArray::from_model(
            self.bytes_at(self.inputs_off, self.inputs_len * 4)?,
        ))
    }

    /// Subgraph output tensor indices.
    pub fn outputs(&self) -> ForgeResult<IntArray<'a>> {
        Ok(IntArray::from_model(
            self.bytes_at(self.outputs_off, self.outputs_len * 4)?,
        ))
    }
}

fn check_extent(
    bytes: &[u8],
    off: usize,
    count: usize,
    entry_len: usize,
    what: &str,
) -> ForgeResult<()> {
    let total = count
        .checked_mul(entry_len)
        .and_then(|n| n.checked_add(off))
        .ok_or_else(|| invalid(format!("{what} extent overflows")))?;
    if total > bytes.len() {
        return Err(invalid(format!(
            "{what} at {off} ({count} entries) extends past {} bytes",
            bytes.len()
        )));
    }
    Ok(())
}
