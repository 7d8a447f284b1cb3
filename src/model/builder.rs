//! Builder for creating .mfge models programmatically.
//!
//! The runtime itself only ever reads models; this writer exists for tests,
//! benchmarks and offline tooling that needs to assemble containers.

use crate::ops::BuiltinOperator;
use crate::tensor::ElementType;

use super::{
    BUFFER_ENTRY_LEN, FLAG_VARIABLE, HEADER_LEN, MAGIC, METADATA_ENTRY_LEN, NO_QUANTIZATION,
    OFFLINE_MEMORY_ALLOCATION_METADATA, OPCODE_ENTRY_LEN, OPERATOR_RECORD_LEN,
    SUBGRAPH_HEADER_LEN, TENSOR_RECORD_LEN, VERSION,
};

/// Alignment of buffer payloads inside the container, so constant tensors
/// can be consumed in place by vectorized kernels.
const PAYLOAD_ALIGNMENT: usize = 16;

#[derive(Debug, Clone)]
struct QuantDecl {
    scales: Vec<f32>,
    zero_points: Vec<i64>,
    quantized_dimension: i32,
}

#[derive(Debug, Clone)]
struct TensorDecl {
    dtype: ElementType,
    is_variable: bool,
    buffer: u32,
    shape: Vec<i32>,
    quant: Option<QuantDecl>,
}

#[derive(Debug, Clone)]
struct OperatorDecl {
    opcode: u32,
    inputs: Vec<i32>,
    outputs: Vec<i32>,
    builtin_options: Vec<u8>,
    custom_options: Vec<u8>,
}

#[derive(Debug, Clone)]
struct OpcodeDecl {
    builtin: u32,
    name: String,
}

#[derive(Debug, Clone)]
struct MetadataDecl {
    name: String,
    buffer: u32,
}

/// Builder for creating .mfge models programmatically.
#[derive(Debug, Clone)]
pub struct ModelBuilder {
    buffers: Vec<Vec<u8>>,
    opcodes: Vec<OpcodeDecl>,
    metadata: Vec<MetadataDecl>,
    tensors: Vec<TensorDecl>,
    operators: Vec<OperatorDecl>,
    inputs: Vec<i32>,
    outputs: Vec<i32>,
}

impl Default for ModelBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ModelBuilder {
    /// Create an empty builder. Buffer 0 is pre-registered as the empty
    /// buffer, matching the container convention for non-constant tensors.
    pub fn new() -> Self {
        ModelBuilder {
            buffers: vec![Vec::new()],
            opcodes: Vec::new(),
            metadata: Vec::new(),
            tensors: Vec::new(),
            operators: Vec::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
        }
    }

    /// Add a raw byte buffer, returning its index.
    pub fn add_buffer(&mut self, data: &[u8]) -> usize {
        self.buffers.push(data.to_vec());
        self.buffers.len() - 1
    }

    /// Add a builtin opcode table entry, returning its index.
    pub fn add_builtin_opcode(&mut self, op: BuiltinOperator) -> usize {
        self.opcodes.push(OpcodeDecl {
            builtin: op.code(),
            name: String::new(),
        });
        self.opcodes.len() - 1
    }

    /// Add a custom opcode table entry, returning its index.
    pub fn add_custom_opcode(&mut self, name: &str) -> usize {
        self.opcodes.push(OpcodeDecl {
            builtin: BuiltinOperator::Custom.code(),
            name: name.to_string(),
        });
        self.opcodes.len() - 1
    }

    /// Add a tensor, returning its index. `buffer` 0 marks a non-constant
    /// tensor; any buffer with payload bytes marks a constant read in place.
    pub fn add_tensor(
        &mut self,
        dtype: ElementType,
        shape: &[i32],
        buffer: usize,
        is_variable: bool,
    ) -> usize {
        self.tensors.push(TensorDecl {
            dtype,
            is_variable,
            buffer: buffer as u32,
            shape: shape.to_vec(),
            quant: None,
        });
        self.tensors.len() - 1
    }

    /// Attach per-channel quantization to an existing tensor.
    pub fn set_tensor_quantization(
        &mut self,
        tensor: usize,
        scales: &[f32],
        zero_points: &[i64],
        quantized_dimension: i32,
    ) {
        assert_eq!(scales.len(), zero_points.len());
        self.tensors[tensor].quant = Some(QuantDecl {
            scales: scales.to_vec(),
            zero_points: zero_points.to_vec(),
            quantized_dimension,
        });
    }

    /// Add an operator, returning its index.
    pub fn add_operator(&mut self, opcode: usize, inputs: &[i32], outputs: &[i32]) -> usize {
        self.operators.push(OperatorDecl {
            opcode: opcode as u32,
            inputs: inputs.to_vec(),
            outputs: outputs.to_vec(),
            builtin_options: Vec::new(),
            custom_options: Vec::new(),
        });
        self.operators.len() - 1
    }

    /// Attach builtin option bytes to an existing operator.
    pub fn set_builtin_options(&mut self, operator: usize, bytes: &[u8]) {
        self.operators[operator].builtin_options = bytes.to_vec();
    }

    /// Attach a custom option payload to an existing operator.
    pub fn set_custom_options(&mut self, operator: usize, bytes: &[u8]) {
        self.operators[operator].custom_options = bytes.to_vec();
    }

    /// Set the subgraph input tensor indices.
    pub fn set_inputs(&mut self, inputs: &[i32]) {
        self.inputs = inputs.to_vec();
    }

    /// Set the subgraph output tensor indices.
    pub fn set_outputs(&mut self, outputs: &[i32]) {
        self.outputs = outputs.to_vec();
    }

    /// Add a metadata entry pointing at an existing buffer.
    pub fn add_metadata(&mut self, name: &str, buffer: usize) {
        self.metadata.push(MetadataDecl {
            name: name.to_string(),
            buffer: buffer as u32,
        });
    }

    /// Embed an offline memory plan: one arena offset per tensor, -1 meaning
    /// "plan online". Uses the standard metadata encoding.
    pub fn add_offline_plan(&mut self, offsets: &[i32]) {
        self.add_offline_plan_raw(1, 0, offsets);
    }

    /// Embed an offline plan with explicit header words. Version and
    /// subgraph values other than (1, 0) produce a model the runtime
    /// rejects; tests use this to exercise validation.
    pub fn add_offline_plan_raw(&mut self, version: i32, subgraph: i32, offsets: &[i32]) {
        let mut words = Vec::with_capacity((3 + offsets.len()) * 4);
        words.extend_from_slice(&version.to_le_bytes());
        words.extend_from_slice(&subgraph.to_le_bytes());
        words.extend_from_slice(&(offsets.len() as i32).to_le_bytes());
        for off in offsets {
            words.extend_from_slice(&off.to_le_bytes());
        }
        let buffer = self.add_buffer(&words);
        self.add_metadata(OFFLINE_MEMORY_ALLOCATION_METADATA, buffer);
    }

    /// Serialize the model to container bytes.
    pub fn build(&self) -> Vec<u8> {
        let mut out = vec![0u8; HEADER_LEN];

        // Payload area: buffer blobs first, 16-aligned for in-place reads.
        let mut buffer_entries = Vec::with_capacity(self.buffers.len());
        for data in &self.buffers {
            if data.is_empty() {
                buffer_entries.push((0u32, 0u32));
            } else {
                pad_to(&mut out, PAYLOAD_ALIGNMENT);
                let off = out.len() as u32;
                out.extend_from_slice(data);
                buffer_entries.push((off, data.len() as u32));
            }
        }

        let mut opcode_entries = Vec::with_capacity(self.opcodes.len());
        for opcode in &self.opcodes {
            let (off, len) = push_bytes(&mut out, opcode.name.as_bytes());
            opcode_entries.push((opcode.builtin, off, len));
        }

        let mut metadata_entries = Vec::with_capacity(self.metadata.len());
        for entry in &self.metadata {
            let (off, len) = push_bytes(&mut out, entry.name.as_bytes());
            metadata_entries.push((off, len, entry.buffer));
        }

        let mut tensor_records = Vec::with_capacity(self.tensors.len());
        for tensor in &self.tensors {
            let (shape_off, _) = push_words(&mut out, &tensor.shape);
            let quant_off = match &tensor.quant {
                None => NO_QUANTIZATION,
                Some(quant) => {
                    let scales_off = out.len() as u32;
                    for scale in &quant.scales {
                        out.extend_from_slice(&scale.to_le_bytes());
                    }
                    let zero_point_off = out.len() as u32;
                    for zp in &quant.zero_points {
                        out.extend_from_slice(&zp.to_le_bytes());
                    }
                    let record_off = out.len() as u32;
                    push_u32(&mut out, quant.scales.len() as u32);
                    push_u32(&mut out, quant.quantized_dimension as u32);
                    push_u32(&mut out, scales_off);
                    push_u32(&mut out, zero_point_off);
                    record_off
                }
            };
            let flags = if tensor.is_variable { FLAG_VARIABLE } else { 0 };
            tensor_records.push((
                tensor.dtype.code(),
                flags,
                tensor.buffer,
                shape_off,
                tensor.shape.len() as u32,
                quant_off,
            ));
        }

        let mut operator_records = Vec::with_capacity(self.operators.len());
        for op in &self.operators {
            let (inputs_off, inputs_len) = push_words(&mut out, &op.inputs);
            let (outputs_off, outputs_len) = push_words(&mut out, &op.outputs);
            let (builtin_off, builtin_len) = push_bytes(&mut out, &op.builtin_options);
            let (custom_off, custom_len) = push_bytes(&mut out, &op.custom_options);
            operator_records.push([
                op.opcode,
                inputs_off,
                inputs_len,
                outputs_off,
                outputs_len,
                builtin_off,
                builtin_len,
                custom_off,
                custom_len,
            ]);
        }

        let (inputs_off, inputs_len) = push_words(&mut out, &self.inputs);
        let (outputs_off, outputs_len) = push_words(&mut out, &self.outputs);

        // Tables.
        let buffer_table = out.len() as u32;
        for (off, len) in &buffer_entries {
            push_u32(&mut out, *off);
            push_u32(&mut out, *len);
        }
        debug_assert_eq!(
            out.len() - buffer_table as usize,
            buffer_entries.len() * BUFFER_ENTRY_LEN
        );

        let opcode_table = out.len() as u32;
        for (builtin, off, len) in &opcode_entries {
            push_u32(&mut out, *builtin);
            push_u32(&mut out, *off);
            push_u32(&mut out, *len);
        }
        debug_assert_eq!(
            out.len() - opcode_table as usize,
            opcode_entries.len() * OPCODE_ENTRY_LEN
        );

        let metadata_table = out.len() as u32;
        for (off, len, buffer) in &metadata_entries {
            push_u32(&mut out, *off);
            push_u32(&mut out, *len);
            push_u32(&mut out, *buffer);
        }
        debug_assert_eq!(
            out.len() - metadata_table as usize,
            metadata_entries.len() * METADATA_ENTRY_LEN
        );

        let tensor_table = out.len() as u32;
        for (dtype, flags, buffer, shape_off, shape_len, quant_off) in &tensor_records {
            push_u32(&mut out, *dtype);
            push_u32(&mut out, *flags);
            push_u32(&mut out, *buffer);
            push_u32(&mut out, *shape_off);
            push_u32(&mut out, *shape_len);
            push_u32(&mut out, *quant_off);
        }
        debug_assert_eq!(
            out.len() - tensor_table as usize,
            tensor_records.len() * TENSOR_RECORD_LEN
        );

        let operator_table = out.len() as u32;
        for record in &operator_records {
            for word in record {
                push_u32(&mut out, *word);
            }
        }
        debug_assert_eq!(
            out.len() - operator_table as usize,
            operator_records.len() * OPERATOR_RECORD_LEN
        );

        let subgraph_off = out.len() as u32;
        push_u32(&mut out, self.tensors.len() as u32);
        push_u32(&mut out, tensor_table);
        push_u32(&mut out, self.operators.len() as u32);
        push_u32(&mut out, operator_table);
        push_u32(&mut out, inputs_off);
        push_u32(&mut out, inputs_len);
        push_u32(&mut out, outputs_off);
        push_u32(&mut out, outputs_len);
        debug_assert_eq!(out.len() - subgraph_off as usize, SUBGRAPH_HEADER_LEN);

        // Header.
        out[0..4].copy_from_slice(MAGIC);
        patch_u32(&mut out, 4, VERSION);
        patch_u32(&mut out, 8, 1); // subgraph count
        patch_u32(&mut out, 12, self.buffers.len() as u32);
        patch_u32(&mut out, 16, buffer_table);
        patch_u32(&mut out, 20, self.opcodes.len() as u32);
        patch_u32(&mut out, 24, opcode_table);
        patch_u32(&mut out, 28, self.metadata.len() as u32);
        patch_u32(&mut out, 32, metadata_table);
        patch_u32(&mut out, 36, subgraph_off);

        out
    }
}

fn push_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn patch_u32(out: &mut [u8], at: usize, value: u32) {
    out[at..at + 4].copy_from_slice(&value.to_le_bytes());
}

/// Append raw bytes, returning (offset, length); (0, 0) when empty.
fn push_bytes(out: &mut Vec<u8>, bytes: &[u8]) -> (u32, u32) {
    if bytes.is_empty() {
        return (0, 0);
    }
    let off = out.len() as u32;
    out.extend_from_slice(bytes);
    (off, bytes.len() as u32)
}

/// Append an i32 word array, returning (offset, word count); (0, 0) when empty.
fn push_words(out: &mut Vec<u8>, words: &[i32]) -> (u32, u32) {
    if words.is_empty() {
        return (0, 0);
    }
    let off = out.len() as u32;
    for word in words {
        out.extend_from_slice(&word.to_le_bytes());
    }
    (off, words.len() as u32)
}

fn pad_to(out: &mut Vec<u8>, alignment: usize) {
    while out.len() % alignment != 0 {
        out.push(0);
    }
}
