//! MicroForge - static memory planning for microcontroller inference
//!
//! A micro-runtime executes pre-trained neural-network graphs out of a
//! single contiguous byte region supplied by the host firmware. Before the
//! first inference, this crate materializes runtime tensor descriptors from
//! the serialized graph, computes every intermediate buffer's live range,
//! reconciles an optional offline placement plan with greedy online
//! placement, and packs everything into the fixed arena - without ever
//! calling the system allocator for payload data. After planning, every
//! data reference is frozen for the lifetime of the model.
//!
//! Operator kernels, the inference loop and model authoring are external
//! collaborators; they appear here only through the interfaces the core
//! consumes ([`ops::OpResolver`], [`model::Model`]).

pub mod error;
pub mod logging;
pub mod memory;
pub mod model;
pub mod ops;
pub mod tensor;

pub use error::{ErrorCategory, ForgeResult, MicroForgeError};
pub use memory::{
    GreedyMemoryPlanner, ModelAllocation, ModelAllocator, PlannerConfig, ScratchBufferHandle,
    ScratchBufferHandles, SplitArena, BUFFER_ALIGNMENT,
};
pub use model::{Model, ModelBuilder};
pub use ops::{BuiltinOperator, MicroOpResolver, NodeAndRegistration, OpRegistration, OpResolver};
pub use tensor::{DataRef, ElementType, EvalTensor, FullTensor};
