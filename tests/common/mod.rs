//! Common test fixtures: aligned arena backings and synthetic models.
//!
//! Consolidates the model-construction helpers shared by the integration
//! suites so each scenario reads as graph shape + assertions only.

#![allow(dead_code)]

use microforge::{BuiltinOperator, ElementType, MicroOpResolver, ModelBuilder};

/// Arena backing with a guaranteed 16-byte base address, so planned
/// offsets in assertions are exact and no bytes are lost to realignment.
#[repr(align(16))]
pub struct AlignedArena<const N: usize> {
    bytes: [u8; N],
}

impl<const N: usize> AlignedArena<N> {
    pub fn new() -> Self {
        AlignedArena { bytes: [0u8; N] }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.bytes
    }
}

impl<const N: usize> Default for AlignedArena<N> {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolver with every builtin the fixtures use.
pub fn test_resolver() -> MicroOpResolver {
    let mut resolver = MicroOpResolver::new();
    resolver.register_builtin(BuiltinOperator::Softmax);
    resolver.register_builtin(BuiltinOperator::Add);
    resolver
}

/// Builder for a linear activation chain t0 -> t1 -> ... -> t_{n-1} of f32
/// tensors with the given byte sizes, connected by softmax operators. t0 is
/// the subgraph input and the last tensor the subgraph output.
pub fn chain_builder(activation_bytes: &[usize]) -> ModelBuilder {
    assert!(activation_bytes.len() >= 2);
    let mut builder = ModelBuilder::new();
    let opcode = builder.add_builtin_opcode(BuiltinOperator::Softmax);
    for &bytes in activation_bytes {
        assert_eq!(bytes % 4, 0);
        builder.add_tensor(ElementType::F32, &[(bytes / 4) as i32], 0, false);
    }
    for i in 0..activation_bytes.len() - 1 {
        builder.add_operator(opcode, &[i as i32], &[i as i32 + 1]);
    }
    builder.set_inputs(&[0]);
    builder.set_outputs(&[activation_bytes.len() as i32 - 1]);
    builder
}

/// Serialized linear chain model.
pub fn chain_model(activation_bytes: &[usize]) -> Vec<u8> {
    chain_builder(activation_bytes).build()
}

/// Chain model carrying an offline memory plan.
pub fn chain_model_with_offline_plan(activation_bytes: &[usize], offsets: &[i32]) -> Vec<u8> {
    let mut builder = chain_builder(activation_bytes);
    builder.add_offline_plan(offsets);
    builder.build()
}

/// Model with a 512-byte variable tensor: add(input, state) -> output.
pub fn variable_state_model() -> Vec<u8> {
    let mut builder = ModelBuilder::new();
    let opcode = builder.add_builtin_opcode(BuiltinOperator::Add);
    builder.add_tensor(ElementType::F32, &[128], 0, false); // input, 512 B
    builder.add_tensor(ElementType::F32, &[128], 0, true); // variable state, 512 B
    builder.add_tensor(ElementType::F32, &[128], 0, false); // output
    builder.add_operator(opcode, &[0, 1], &[2]);
    builder.set_inputs(&[0]);
    builder.set_outputs(&[2]);
    builder.build()
}

/// Four-operator chain (five tensors) so scratch requests can target
/// operator index 3.
pub fn four_op_chain_model() -> Vec<u8> {
    chain_model(&[256, 256, 256, 256, 256])
}

/// Diamond graph with known lifetimes:
///
/// ```text
///        t0 (input)
///       /          \
///   op0: softmax  op1: softmax
///      |             |
///      t1            t2
///       \           /
///       op2: add -> t3 (output)
/// ```
pub fn diamond_model() -> Vec<u8> {
    let mut builder = ModelBuilder::new();
    let softmax = builder.add_builtin_opcode(BuiltinOperator::Softmax);
    let add = builder.add_builtin_opcode(BuiltinOperator::Add);
    builder.add_tensor(ElementType::F32, &[64], 0, false); // t0
    builder.add_tensor(ElementType::F32, &[96], 0, false); // t1
    builder.add_tensor(ElementType::F32, &[32], 0, false); // t2
    builder.add_tensor(ElementType::F32, &[64], 0, false); // t3
    builder.add_operator(softmax, &[0], &[1]);
    builder.add_operator(softmax, &[0], &[2]);
    builder.add_operator(add, &[1, 2], &[3]);
    builder.set_inputs(&[0]);
    builder.set_outputs(&[3]);
    builder.build()
}

/// Live ranges of the [`diamond_model`] tensors, in operator steps.
pub const DIAMOND_LIFETIMES: [(i32, i32); 4] = [(0, 1), (0, 2), (1, 2), (2, 2)];
