//! Model allocator - lifecycle orchestration for the static memory plan.
//!
//! Drives `Idle -> Allocating -> Frozen`: materialize eval tensors and node
//! bundles from the serialized graph, collect scratch requests while
//! operators prepare, build the allocation-info table, run the greedy
//! planner, commit offsets into the live descriptors, allocate variable
//! tensors from the tail, freeze. After a successful finish every data
//! reference is stable for the lifetime of the model.
//!
//! Bookkeeping (descriptors, planning records) lives in host memory and is
//! fully built inside the allocation window; the arena itself carries only
//! payload bytes. Steady-state inference performs no allocation.

use tracing::{debug, error, info};

use crate::error::{ForgeResult, MicroForgeError};
use crate::memory::info::{AllocationInfoBuilder, Slot};
use crate::memory::planner::GreedyMemoryPlanner;
use crate::memory::region::{align_up, SplitArena, BUFFER_ALIGNMENT};
use crate::model::Model;
use crate::ops::{
    BuiltinOperator, Node, NodeAndRegistration, OpResolver,
};
use crate::tensor::{
    AffineQuantization, DataRef, EvalTensor, FullTensor, QuantizationParams,
};

/// Planner configuration.
///
/// `Default` gives the production values; the knobs exist for bring-up and
/// for tests that want observable layouts.
#[derive(Debug, Clone)]
pub struct PlannerConfig {
    /// Alignment of every activation, variable and scratch buffer.
    pub buffer_alignment: usize,
    /// Zero-fill variable tensors at finalize so first read is defined.
    pub zero_variable_tensors: bool,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        PlannerConfig {
            buffer_alignment: BUFFER_ALIGNMENT,
            zero_variable_tensors: true,
        }
    }
}

impl PlannerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the buffer alignment (power of two).
    pub fn with_buffer_alignment(mut self, alignment: usize) -> Self {
        self.buffer_alignment = alignment;
        self
    }

    /// Enable or disable variable-tensor zero fill.
    pub fn with_zero_variable_tensors(mut self, zero: bool) -> Self {
        self.zero_variable_tensors = zero;
        self
    }
}

/// Scratch buffer request: transient working memory owned by one operator,
/// valid only while that operator executes. The offset is filled in by the
/// committed plan.
#[derive(Debug, Clone)]
pub struct ScratchBufferHandle {
    pub bytes: usize,
    pub node_index: usize,
    pub offset: Option<usize>,
}

/// Frozen scratch-handle table produced by `finish_model_allocation`.
#[derive(Debug)]
pub struct ScratchBufferHandles {
    handles: Vec<ScratchBufferHandle>,
}

impl ScratchBufferHandles {
    /// Handle for scratch buffer `id`.
    pub fn get(&self, id: usize) -> Option<&ScratchBufferHandle> {
        self.handles.get(id)
    }

    /// Number of scratch buffers in the table.
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    /// True when no operator requested scratch memory.
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Iterate over all handles in id order.
    pub fn iter(&self) -> impl Iterator<Item = &ScratchBufferHandle> {
        self.handles.iter()
    }
}

/// Eval tensors and node bundles for one allocated model.
///
/// Returned by `start_model_allocation` and finalized in place by
/// `finish_model_allocation`; the inference loop reads it afterwards.
#[derive(Debug)]
pub struct ModelAllocation<'m> {
    pub eval_tensors: Vec<EvalTensor<'m>>,
    pub nodes: Vec<NodeAndRegistration<'m>>,
}

/// Static arena allocator and memory planner for one model.
#[derive(Debug)]
pub struct ModelAllocator<'a> {
    region: SplitArena<'a>,
    config: PlannerConfig,
    model_is_allocating: bool,
    scratch_handles: Vec<ScratchBufferHandle>,
}

impl<'a> ModelAllocator<'a> {
    /// Wrap a host-supplied arena with the default configuration.
    pub fn new(arena: &'a mut [u8]) -> Self {
        Self::with_config(arena, PlannerConfig::default())
    }

    /// Wrap a host-supplied arena with an explicit configuration.
    pub fn with_config(arena: &'a mut [u8], config: PlannerConfig) -> Self {
        let region = SplitArena::new(arena);
        info!(
            capacity = region.capacity(),
            alignment = config.buffer_alignment,
            "model allocator created"
        );
        ModelAllocator {
            region,
            config,
            model_is_allocating: false,
            scratch_handles: Vec::new(),
        }
    }

    /// Begin allocation: materialize eval tensors and node bundles from the
    /// serialized graph. Must be called exactly once per model, before any
    /// scratch request.
    pub fn start_model_allocation<'m>(
        &mut self,
        model: &Model<'m>,
        op_resolver: &dyn OpResolver,
    ) -> ForgeResult<ModelAllocation<'m>> {
        if self.model_is_allocating {
            return Err(MicroForgeError::InvariantViolation(
                "model allocation started before finishing the previously allocated model",
            ));
        }
        self.model_is_allocating = true;
        self.scratch_handles.clear();

        let eval_tensors = self.build_eval_tensors(model)?;
        let nodes = self.build_nodes(model, op_resolver)?;
        debug!(
            tensors = eval_tensors.len(),
            operators = nodes.len(),
            "model allocation started"
        );
        Ok(ModelAllocation {
            eval_tensors,
            nodes,
        })
    }

    /// Request transient scratch memory for the operator at `node_index`.
    /// Returns a dense buffer id starting at 0. Only legal between start
    /// and finish.
    pub fn request_scratch_buffer(
        &mut self,
        node_index: usize,
        bytes: usize,
    ) -> ForgeResult<usize> {
        if !self.model_is_allocating {
            return Err(MicroForgeError::InvariantViolation(
                "scratch buffers can only be requested between start and finish of model allocation",
            ));
        }
        let id = self.scratch_handles.len();
        self.scratch_handles.push(ScratchBufferHandle {
            bytes,
            node_index,
            offset: None,
        });
        debug!(id, node_index, bytes, "scratch buffer requested");
        Ok(id)
    }

    /// Commit the static memory plan, allocate variable tensors and freeze.
    ///
    /// On success every activation and scratch offset points into the arena
    /// head, every variable tensor into the tail, and every constant tensor
    /// into the model bytes.
    pub fn finish_model_allocation<'m>(
        &mut self,
        model: &Model<'m>,
        allocation: &mut ModelAllocation<'m>,
    ) -> ForgeResult<ScratchBufferHandles> {
        if !self.model_is_allocating {
            return Err(MicroForgeError::InvariantViolation(
                "model allocation finished before being started",
            ));
        }

        // Retarget the staged handles into the table returned to the
        // caller; the committed plan owns the head from offset 0 onward.
        let mut handles = std::mem::take(&mut self.scratch_handles);

        self.commit_static_memory_plan(model, &mut allocation.eval_tensors, &mut handles)?;
        self.allocate_variables(model, &mut allocation.eval_tensors)?;

        self.model_is_allocating = false;
        info!(
            used_bytes = self.region.used_bytes(),
            scratch_buffers = handles.len(),
            "model allocation finished"
        );
        Ok(ScratchBufferHandles { handles })
    }

    /// Tail allocation with buffer alignment; usable at any lifecycle
    /// point. The memory lives until the arena is dropped.
    pub fn allocate_persistent_buffer(&mut self, bytes: usize) -> ForgeResult<usize> {
        self.region
            .allocate_from_tail(bytes, self.config.buffer_alignment)
    }

    /// Build a session-lifetime [`FullTensor`] for `tensor_index`.
    pub fn allocate_persistent_full_tensor<'m>(
        &mut self,
        model: &Model<'m>,
        eval_tensors: &[EvalTensor<'m>],
        tensor_index: usize,
    ) -> ForgeResult<FullTensor<'m>> {
        self.build_full_tensor(model, eval_tensors, tensor_index)
    }

    /// Build a [`FullTensor`] for `tensor_index` that is only guaranteed
    /// valid until the next [`ModelAllocator::reset_temp_allocations`];
    /// intended for the current operator-preparation call.
    pub fn allocate_temp_full_tensor<'m>(
        &mut self,
        model: &Model<'m>,
        eval_tensors: &[EvalTensor<'m>],
        tensor_index: usize,
    ) -> ForgeResult<FullTensor<'m>> {
        self.build_full_tensor(model, eval_tensors, tensor_index)
    }

    /// Carve transient workspace bytes from the temp sub-region (operator
    /// preparation only).
    pub fn allocate_temp(&mut self, bytes: usize) -> ForgeResult<usize> {
        self.region
            .allocate_temp(bytes, self.config.buffer_alignment)
    }

    /// Release every outstanding temp allocation. Idempotent.
    pub fn reset_temp_allocations(&mut self) {
        self.region.reset_temp_allocations();
    }

    /// Handle lookup in a frozen scratch table.
    pub fn get_scratch_buffer<'h>(
        handles: &'h ScratchBufferHandles,
        id: usize,
    ) -> Option<&'h ScratchBufferHandle> {
        handles.get(id)
    }

    /// Head plus tail consumption, for diagnostics.
    pub fn used_bytes(&self) -> usize {
        self.region.used_bytes()
    }

    /// The underlying split arena.
    pub fn arena(&self) -> &SplitArena<'a> {
        &self.region
    }

    /// Resolve a tensor's payload bytes through the model or the arena.
    /// `None` when the tensor was never materialized.
    pub fn tensor_data<'s>(
        &'s self,
        model: &'s Model<'_>,
        tensor: &EvalTensor<'_>,
    ) -> ForgeResult<Option<&'s [u8]>> {
        match tensor.data {
            None => Ok(None),
            Some(DataRef::Model { start, len }) => Ok(Some(model.bytes_at(start, len)?)),
            Some(DataRef::Arena { offset }) => {
                Ok(Some(self.region.slice(offset, tensor.byte_length()?)?))
            }
        }
    }

    /// Mutable payload view for an arena-backed tensor. Constants alias the
    /// immutable model bytes and cannot be written.
    pub fn tensor_data_mut<'s>(
        &'s mut self,
        tensor: &EvalTensor<'_>,
    ) -> ForgeResult<&'s mut [u8]> {
        match tensor.data {
            Some(DataRef::Arena { offset }) => {
                let len = tensor.byte_length()?;
                self.region.slice_mut(offset, len)
            }
            Some(DataRef::Model { .. }) => Err(MicroForgeError::InvariantViolation(
                "constant tensors alias read-only model bytes",
            )),
            None => Err(MicroForgeError::InvariantViolation(
                "tensor has no committed buffer",
            )),
        }
    }

    /// Payload bytes of a planned scratch buffer.
    pub fn scratch_data<'s>(
        &'s self,
        handle: &ScratchBufferHandle,
    ) -> ForgeResult<Option<&'s [u8]>> {
        match handle.offset {
            None => Ok(None),
            Some(offset) => Ok(Some(self.region.slice(offset, handle.bytes)?)),
        }
    }

    fn build_eval_tensors<'m>(&mut self, model: &Model<'m>) -> ForgeResult<Vec<EvalTensor<'m>>> {
        let mut tensors = Vec::with_capacity(model.tensor_count());
        for index in 0..model.tensor_count() {
            let tensor = model.tensor(index)?;
            let (start, len) = model.buffer_range(tensor.buffer)?;
            // A tensor is constant iff the model supplies payload bytes for
            // it; the descriptor then reads them in place.
            let data = if len > 0 {
                Some(DataRef::Model { start, len })
            } else {
                None
            };
            tensors.push(EvalTensor {
                dtype: tensor.dtype,
                shape: tensor.shape(),
                data,
            });
        }
        Ok(tensors)
    }

    fn build_nodes<'m>(
        &mut self,
        model: &Model<'m>,
        op_resolver: &dyn OpResolver,
    ) -> ForgeResult<Vec<NodeAndRegistration<'m>>> {
        let mut nodes = Vec::with_capacity(model.operator_count());
        for index in 0..model.operator_count() {
            let operator = model.operator(index)?;
            let opcode = model.opcode(operator.opcode_index)?;
            let op = BuiltinOperator::from_code(opcode.builtin_code).ok_or_else(|| {
                MicroForgeError::UnsupportedModel(format!(
                    "operator {index} has unknown builtin code {}",
                    opcode.builtin_code
                ))
            })?;

            let registration = if op == BuiltinOperator::Custom {
                op_resolver
                    .find_custom(opcode.name)
                    .ok_or_else(|| MicroForgeError::MissingRegistration(opcode.name.to_string()))?
                    .clone()
            } else {
                op_resolver
                    .find_builtin(op)
                    .ok_or_else(|| MicroForgeError::MissingRegistration(op.name().to_string()))?
                    .clone()
            };

            let (builtin_data, custom_data) = if op == BuiltinOperator::Custom {
                // Custom operators may or may not carry an option payload.
                (None, operator.custom_options)
            } else {
                if operator.custom_options.is_some() {
                    return Err(MicroForgeError::UnsupportedModel(format!(
                        "builtin operator {} carries custom options",
                        op.name()
                    )));
                }
                let parser = op_resolver.builtin_parser(op).ok_or_else(|| {
                    MicroForgeError::UnsupportedModel(format!(
                        "no options parser registered for {}",
                        op.name()
                    ))
                })?;
                let data = parser(operator.builtin_options.unwrap_or(&[]))?;
                (Some(data), None)
            };

            nodes.push(NodeAndRegistration {
                node: Node {
                    inputs: operator.inputs(),
                    outputs: operator.outputs(),
                    builtin_data,
                    custom_data,
                },
                registration,
            });
        }
        Ok(nodes)
    }

    /// Build the allocation-info table, run the greedy planner over the
    /// free window, verify the footprint fits, and write the committed
    /// offsets back through each record's slot.
    fn commit_static_memory_plan(
        &mut self,
        model: &Model<'_>,
        eval_tensors: &mut [EvalTensor<'_>],
        handles: &mut [ScratchBufferHandle],
    ) -> ForgeResult<()> {
        let mut builder = AllocationInfoBuilder::new(model.tensor_count(), handles.len());
        let offline = builder.offline_planned_offsets(model)?;
        builder.add_tensors(model, offline.as_ref(), eval_tensors)?;
        builder.add_scratch_buffers(handles)?;
        let records = builder.finish();

        let mut planner = GreedyMemoryPlanner::with_alignment(self.config.buffer_alignment);
        for record in &records {
            if !record.needs_allocating {
                continue;
            }
            let aligned_bytes = align_up(record.bytes, self.config.buffer_alignment);
            match record.offline_offset {
                Some(offset) => {
                    planner.add_buffer_at(
                        aligned_bytes,
                        record.first_use,
                        record.last_use,
                        offset as usize,
                    )?;
                }
                None => {
                    planner.add_buffer(aligned_bytes, record.first_use, record.last_use)?;
                }
            }
        }

        let needed = planner.maximum_memory_size()?;
        let available = self.region.available_memory(self.config.buffer_alignment);
        if needed > available {
            error!(
                needed,
                available, "arena size is too small for all buffers"
            );
            return Err(MicroForgeError::ArenaExhausted {
                requested: needed,
                available,
            });
        }

        // Plan offsets are relative to the head base; resolve each slot
        // through the live descriptor arrays.
        let mut planner_index = 0;
        for record in &records {
            if !record.needs_allocating {
                continue;
            }
            let offset = planner.offset_for_buffer(planner_index)?;
            match record.slot {
                Slot::Tensor(index) => {
                    eval_tensors[index].data = Some(DataRef::Arena { offset });
                }
                Slot::Scratch(index) => {
                    handles[index].offset = Some(offset);
                }
            }
            planner_index += 1;
        }

        self.region
            .ensure_head_size(needed, self.config.buffer_alignment)?;
        debug!(
            head_bytes = needed,
            planned_buffers = planner_index,
            "static memory plan committed"
        );
        Ok(())
    }

    /// Allocate persistent state for every variable tensor from the tail.
    fn allocate_variables(
        &mut self,
        model: &Model<'_>,
        eval_tensors: &mut [EvalTensor<'_>],
    ) -> ForgeResult<()> {
        for index in 0..model.tensor_count() {
            let tensor = model.tensor(index)?;
            if !tensor.is_variable {
                continue;
            }
            let bytes = eval_tensors[index].byte_length()?;
            let offset = self
                .region
                .allocate_from_tail(bytes, self.config.buffer_alignment)
                .map_err(|err| {
                    error!(tensor = index, bytes, "failed to allocate variable tensor");
                    err
                })?;
            if self.config.zero_variable_tensors {
                self.region.slice_mut(offset, bytes)?.fill(0);
            }
            eval_tensors[index].data = Some(DataRef::Arena { offset });
        }
        Ok(())
    }

    fn build_full_tensor<'m>(
        &self,
        model: &Model<'m>,
        eval_tensors: &[EvalTensor<'m>],
        tensor_index: usize,
    ) -> ForgeResult<FullTensor<'m>> {
        let eval = eval_tensors.get(tensor_index).ok_or_else(|| {
            MicroForgeError::InvalidModelFile(format!(
                "tensor index {tensor_index} out of range ({} tensors)",
                eval_tensors.len()
            ))
        })?;
        let tensor = model.tensor(tensor_index)?;

        let mut params = QuantizationParams::default();
        let mut quantization = None;
        if let Some(quant) = tensor.quantization {
            if quant.channel_count > 0 {
                let scales = quant.scales();
                // The container stores zero points as i64; the kernels
                // consume i32, so narrow into an owned copy.
                let zero_points: Vec<i32> = (0..quant.channel_count)
                    .map(|channel| quant.zero_point(channel) as i32)
                    .collect();
                params = QuantizationParams {
                    scale: scales.get(0),
                    zero_point: zero_points[0],
                };
                quantization = Some(AffineQuantization {
                    scales,
                    zero_points,
                    quantized_dimension: quant.quantized_dimension as i32,
                });
            }
        }

        Ok(FullTensor {
            dtype: eval.dtype,
            shape: eval.shape.clone(),
            data: eval.data,
            bytes: eval.byte_length()?,
            is_variable: tensor.is_variable,
            params,
            quantization,
        })
    }
}
