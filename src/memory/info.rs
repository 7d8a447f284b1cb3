//! Allocation-info builder.
//!
//! Walks the graph once to produce, for every activation tensor and every
//! operator scratch buffer, a record of byte footprint, live range and
//! planning mode (online or pinned by an offline plan). The records drive
//! the greedy planner; each one carries a slot naming the eval-tensor or
//! scratch-handle field the committed offset is written back into.
//!
//! Methods must be called in order: `new`, `offline_planned_offsets`,
//! `add_tensors`, `add_scratch_buffers`, `finish`.

use tracing::debug;

use crate::error::{ForgeResult, MicroForgeError};
use crate::memory::allocator::ScratchBufferHandle;
use crate::model::{Model, OFFLINE_MEMORY_ALLOCATION_METADATA};
use crate::tensor::{EvalTensor, IntArray};

/// `first_use`/`last_use` value for "not seen yet".
const UNSET: i32 = -1;

/// Back-reference to the pointer field the planner must fill in.
///
/// Index pairs instead of raw back-pointers: the commit step resolves them
/// through the eval-tensor and scratch-handle arrays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    Tensor(usize),
    Scratch(usize),
}

/// Planning record for one tensor or scratch buffer.
#[derive(Debug, Clone, Copy)]
pub struct AllocationInfo {
    pub bytes: usize,
    pub first_use: i32,
    pub last_use: i32,
    /// `None` plans online; `Some` pins the buffer at a fixed arena offset.
    pub offline_offset: Option<u32>,
    pub needs_allocating: bool,
    pub slot: Slot,
}

/// View over a validated offline plan's offset words.
#[derive(Debug, Clone)]
pub struct OfflineOffsets<'m> {
    words: IntArray<'m>,
}

impl<'m> OfflineOffsets<'m> {
    /// Offset for tensor `index`: negative means "plan online".
    pub fn offset(&self, index: usize) -> i32 {
        self.words.get(index)
    }

    /// Number of per-tensor entries.
    pub fn len(&self) -> usize {
        self.words.len()
    }

    /// True when the table carries no entries.
    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }
}

/// Builds the dense `AllocationInfo` array: all activation tensors first,
/// then all scratch buffers.
#[derive(Debug)]
pub struct AllocationInfoBuilder {
    tensor_count: usize,
    scratch_count: usize,
    records: Vec<AllocationInfo>,
}

impl AllocationInfoBuilder {
    pub fn new(tensor_count: usize, scratch_count: usize) -> Self {
        AllocationInfoBuilder {
            tensor_count,
            scratch_count,
            records: Vec::with_capacity(tensor_count + scratch_count),
        }
    }

    /// Total records once fully built.
    pub fn len(&self) -> usize {
        self.tensor_count + self.scratch_count
    }

    /// True for a graph with no tensors and no scratch requests.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Probe the model metadata for an offline memory plan.
    ///
    /// Returns `None` when no `"OfflineMemoryAllocation"` entry exists.
    /// A present entry must carry format version 1, subgraph index 0 and
    /// exactly one offset word per tensor.
    pub fn offline_planned_offsets<'m>(
        &self,
        model: &Model<'m>,
    ) -> ForgeResult<Option<OfflineOffsets<'m>>> {
        let Some(entry) = model.find_metadata(OFFLINE_MEMORY_ALLOCATION_METADATA)? else {
            return Ok(None);
        };
        let words_bytes = model.buffer(entry.buffer)?;
        if words_bytes.len() < 12 || words_bytes.len() % 4 != 0 {
            return Err(MicroForgeError::InvalidModelFile(format!(
                "offline plan buffer holds {} bytes, expected at least 3 words",
                words_bytes.len()
            )));
        }
        let words = IntArray::from_model(words_bytes);
        let version = words.get(0);
        if version != 1 {
            return Err(MicroForgeError::UnsupportedModel(format!(
                "offline plan version {version} not supported (expected 1)"
            )));
        }
        let subgraph = words.get(1);
        if subgraph != 0 {
            return Err(MicroForgeError::UnsupportedModel(format!(
                "offline plan targets subgraph {subgraph}, only subgraph 0 is supported"
            )));
        }
        let count = words.get(2);
        if count < 0 || count as usize != self.tensor_count {
            return Err(MicroForgeError::UnsupportedModel(format!(
                "offline plan has {count} offsets but the model has {} tensors",
                self.tensor_count
            )));
        }
        if words.len() < 3 + count as usize {
            return Err(MicroForgeError::InvalidModelFile(
                "offline plan buffer shorter than its declared offset count".to_string(),
            ));
        }
        let offsets = IntArray::from_model(&words_bytes[12..12 + 4 * count as usize]);
        debug!(tensors = count, "offline memory plan found");
        Ok(Some(OfflineOffsets { words: offsets }))
    }

    /// Fill the first `tensor_count` records from the subgraph.
    pub fn add_tensors(
        &mut self,
        model: &Model<'_>,
        offline: Option<&OfflineOffsets<'_>>,
        eval_tensors: &[EvalTensor<'_>],
    ) -> ForgeResult<()> {
        debug_assert_eq!(eval_tensors.len(), self.tensor_count);

        for (index, eval) in eval_tensors.iter().enumerate() {
            let tensor = model.tensor(index)?;
            let offline_offset = match offline {
                Some(table) => {
                    let value = table.offset(index);
                    if value < 0 {
                        None
                    } else {
                        Some(value as u32)
                    }
                }
                None => None,
            };
            self.records.push(AllocationInfo {
                bytes: eval.byte_length()?,
                first_use: UNSET,
                last_use: UNSET,
                offline_offset,
                // Constants already point at model bytes; variables are
                // allocated from the tail at finalize time.
                needs_allocating: eval.data.is_none() && !tensor.is_variable,
                slot: Slot::Tensor(index),
            });
        }

        for index in model.inputs()?.iter() {
            self.tensor_record_mut(index)?.first_use = 0;
        }

        // Outputs stay live to the end of the invocation.
        let last_operator = model.operator_count() as i32 - 1;
        for index in model.outputs()?.iter() {
            self.tensor_record_mut(index)?.last_use = last_operator;
        }

        // Walk operators in reverse to find each tensor's first and last use.
        for op_index in (0..model.operator_count()).rev() {
            let step = op_index as i32;
            let operator = model.operator(op_index)?;
            let inputs = operator.inputs();
            for index in inputs.iter() {
                // Workaround for graphs whose operator inputs are not a
                // subset of subgraph inputs: when an operator consumes a
                // subgraph input, its other still-uninitialized inputs that
                // need allocating inherit this step as their first use.
                if self.tensor_record_mut(index)?.first_use == 0 {
                    for other in inputs.iter() {
                        let record = self.tensor_record_mut(other)?;
                        if record.needs_allocating && record.first_use == UNSET {
                            record.first_use = step;
                        }
                    }
                }
                let record = self.tensor_record_mut(index)?;
                if record.last_use == UNSET || record.last_use < step {
                    record.last_use = step;
                }
            }
            for index in operator.outputs().iter() {
                let record = self.tensor_record_mut(index)?;
                if record.first_use == UNSET || record.first_use > step {
                    record.first_use = step;
                }
            }
        }

        // A tensor that is only ever read is excluded from planning; a
        // half-known lifetime on a tensor that needs bytes is a planner
        // logic error.
        for (index, record) in self.records.iter_mut().enumerate() {
            let read_only = record.first_use == UNSET && record.last_use != UNSET;
            if read_only {
                record.needs_allocating = false;
            }
            let partial_lifetime =
                !read_only && (record.first_use == UNSET || record.last_use == UNSET);
            if partial_lifetime && record.needs_allocating {
                return Err(MicroForgeError::LifetimeLogicError {
                    tensor: index,
                    first_use: record.first_use,
                    last_use: record.last_use,
                });
            }
        }
        Ok(())
    }

    /// Fill the trailing `scratch_count` records from the request handles.
    /// A scratch buffer is live only while its owning operator executes.
    pub fn add_scratch_buffers(&mut self, handles: &[ScratchBufferHandle]) -> ForgeResult<()> {
        debug_assert_eq!(handles.len(), self.scratch_count);
        for (index, handle) in handles.iter().enumerate() {
            let step = handle.node_index as i32;
            self.records.push(AllocationInfo {
                bytes: handle.bytes,
                first_use: step,
                last_use: step,
                offline_offset: None,
                needs_allocating: true,
                slot: Slot::Scratch(index),
            });
        }
        Ok(())
    }

    /// The completed record array.
    pub fn finish(self) -> Vec<AllocationInfo> {
        debug_assert_eq!(self.records.len(), self.len());
        self.records
    }

    fn tensor_record_mut(&mut self, index: i32) -> ForgeResult<&mut AllocationInfo> {
        if index < 0 || index as usize >= self.tensor_count {
            return Err(MicroForgeError::InvalidModelFile(format!(
                "tensor index {index} out of range ({} tensors)",
                self.tensor_count
            )));
        }
        Ok(&mut self.records[index as usize])
    }
}
