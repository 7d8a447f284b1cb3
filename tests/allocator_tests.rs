//! End-to-end scenarios for the model allocator: plan commitment,
//! offline pins, variable tensors, scratch buffers and failure reporting.

mod common;

use common::{
    chain_model, chain_model_with_offline_plan, diamond_model, four_op_chain_model,
    test_resolver, variable_state_model, AlignedArena, DIAMOND_LIFETIMES,
};
use microforge::{
    DataRef, MicroForgeError, Model, ModelAllocator, ModelBuilder, ElementType,
};

fn arena_offset(data: Option<DataRef>) -> usize {
    match data {
        Some(DataRef::Arena { offset }) => offset,
        other => panic!("expected arena-backed data, got {other:?}"),
    }
}

#[test]
fn empty_graph_start_finish_succeeds() {
    let bytes = ModelBuilder::new().build();
    let model = Model::from_bytes(&bytes).unwrap();
    let resolver = test_resolver();

    let mut backing = AlignedArena::<4096>::new();
    let mut allocator = ModelAllocator::new(backing.as_mut_slice());
    let mut allocation = allocator.start_model_allocation(&model, &resolver).unwrap();
    let handles = allocator
        .finish_model_allocation(&model, &mut allocation)
        .unwrap();

    assert!(allocation.eval_tensors.is_empty());
    assert!(allocation.nodes.is_empty());
    assert!(handles.is_empty());
    // No payload data exists, so the arena is untouched.
    assert_eq!(allocator.used_bytes(), 0);
}

#[test]
fn linear_chain_reuses_first_activation() {
    // A -> B -> C with 1024/2048/1024 bytes: A's bytes are reusable for C.
    let bytes = chain_model(&[1024, 2048, 1024]);
    let model = Model::from_bytes(&bytes).unwrap();
    let resolver = test_resolver();

    let mut backing = AlignedArena::<8192>::new();
    let mut allocator = ModelAllocator::new(backing.as_mut_slice());
    let mut allocation = allocator.start_model_allocation(&model, &resolver).unwrap();
    allocator
        .finish_model_allocation(&model, &mut allocation)
        .unwrap();

    let off_a = arena_offset(allocation.eval_tensors[0].data);
    let off_b = arena_offset(allocation.eval_tensors[1].data);
    let off_c = arena_offset(allocation.eval_tensors[2].data);

    assert_eq!(off_a, off_c, "C should reuse A's bytes");
    assert_ne!(off_a, off_b);
    assert!(allocator.arena().head_used() <= 2048 + 1024);
}

#[test]
fn offline_pins_are_honored_exactly() {
    let bytes = chain_model_with_offline_plan(&[1024, 2048, 1024], &[0, 1024, 0]);
    let model = Model::from_bytes(&bytes).unwrap();
    let resolver = test_resolver();

    let mut backing = AlignedArena::<8192>::new();
    let mut allocator = ModelAllocator::new(backing.as_mut_slice());
    let mut allocation = allocator.start_model_allocation(&model, &resolver).unwrap();
    allocator
        .finish_model_allocation(&model, &mut allocation)
        .unwrap();

    assert_eq!(arena_offset(allocation.eval_tensors[0].data), 0);
    assert_eq!(arena_offset(allocation.eval_tensors[1].data), 1024);
    assert_eq!(arena_offset(allocation.eval_tensors[2].data), 0);
    assert_eq!(allocator.arena().head_used(), 1024 + 2048);
}

#[test]
fn conflicting_offline_pins_rejected() {
    // B and C are live together yet pinned to overlapping byte ranges.
    let bytes = chain_model_with_offline_plan(&[1024, 2048, 1024], &[0, 1024, 1536]);
    let model = Model::from_bytes(&bytes).unwrap();
    let resolver = test_resolver();

    let mut backing = AlignedArena::<8192>::new();
    let mut allocator = ModelAllocator::new(backing.as_mut_slice());
    let mut allocation = allocator.start_model_allocation(&model, &resolver).unwrap();
    let err = allocator
        .finish_model_allocation(&model, &mut allocation)
        .unwrap_err();
    assert!(matches!(err, MicroForgeError::UnsupportedModel(_)));
}

#[test]
fn partially_offline_plan_mixes_with_online() {
    // Pin only the middle tensor; the ends plan online around it.
    let bytes = chain_model_with_offline_plan(&[1024, 2048, 1024], &[-1, 0, -1]);
    let model = Model::from_bytes(&bytes).unwrap();
    let resolver = test_resolver();

    let mut backing = AlignedArena::<8192>::new();
    let mut allocator = ModelAllocator::new(backing.as_mut_slice());
    let mut allocation = allocator.start_model_allocation(&model, &resolver).unwrap();
    allocator
        .finish_model_allocation(&model, &mut allocation)
        .unwrap();

    let off_a = arena_offset(allocation.eval_tensors[0].data);
    let off_b = arena_offset(allocation.eval_tensors[1].data);
    assert_eq!(off_b, 0);
    assert!(off_a >= 2048, "A overlaps B's lifetime and must avoid it");
}

#[test]
fn variable_tensor_allocated_from_tail_and_zeroed() {
    let bytes = variable_state_model();
    let model = Model::from_bytes(&bytes).unwrap();
    let resolver = test_resolver();

    let mut backing = AlignedArena::<8192>::new();
    let mut allocator = ModelAllocator::new(backing.as_mut_slice());
    let mut allocation = allocator.start_model_allocation(&model, &resolver).unwrap();
    allocator
        .finish_model_allocation(&model, &mut allocation)
        .unwrap();

    let state = &allocation.eval_tensors[1];
    let offset = arena_offset(state.data);
    let capacity = allocator.arena().capacity();
    let tail_used = allocator.arena().tail_used();
    assert!(
        offset >= capacity - tail_used,
        "variable state must live in the tail region"
    );

    let data = allocator.tensor_data(&model, state).unwrap().unwrap();
    assert_eq!(data.len(), 512);
    assert!(data.iter().all(|&b| b == 0), "first read must see zeros");

    // The committed reference is stable across invocations within the plan.
    assert_eq!(arena_offset(allocation.eval_tensors[1].data), offset);
}

#[test]
fn scratch_requests_get_dense_ids_and_distinct_ranges() {
    let bytes = four_op_chain_model();
    let model = Model::from_bytes(&bytes).unwrap();
    let resolver = test_resolver();

    let mut backing = AlignedArena::<8192>::new();
    let mut allocator = ModelAllocator::new(backing.as_mut_slice());
    let mut allocation = allocator.start_model_allocation(&model, &resolver).unwrap();

    // Operator 3 asks twice; ids are dense from 0 regardless of sizes.
    let first = allocator.request_scratch_buffer(3, 256).unwrap();
    let second = allocator.request_scratch_buffer(3, 256).unwrap();
    assert_eq!(first, 0);
    assert_eq!(second, 1);

    let handles = allocator
        .finish_model_allocation(&model, &mut allocation)
        .unwrap();
    assert_eq!(handles.len(), 2);

    let a = ModelAllocator::get_scratch_buffer(&handles, 0).unwrap();
    let b = ModelAllocator::get_scratch_buffer(&handles, 1).unwrap();
    assert_eq!(a.bytes, 256);
    assert_eq!(b.bytes, 256);

    let off_a = a.offset.expect("scratch 0 must be planned");
    let off_b = b.offset.expect("scratch 1 must be planned");
    assert_ne!(off_a, off_b);
    // Both live during the same operator, so their ranges are disjoint and
    // inside the committed head.
    assert!(off_a + 256 <= off_b || off_b + 256 <= off_a);
    let head = allocator.arena().head_used();
    assert!(off_a + 256 <= head && off_b + 256 <= head);
    assert!(allocator.scratch_data(a).unwrap().is_some());
}

#[test]
fn scratch_ids_are_order_independent_of_sizes() {
    let bytes = four_op_chain_model();
    let model = Model::from_bytes(&bytes).unwrap();
    let resolver = test_resolver();

    let mut backing = AlignedArena::<8192>::new();
    let mut allocator = ModelAllocator::new(backing.as_mut_slice());
    let mut allocation = allocator.start_model_allocation(&model, &resolver).unwrap();

    assert_eq!(allocator.request_scratch_buffer(1, 1024).unwrap(), 0);
    assert_eq!(allocator.request_scratch_buffer(2, 16).unwrap(), 1);

    let handles = allocator
        .finish_model_allocation(&model, &mut allocation)
        .unwrap();
    assert_eq!(ModelAllocator::get_scratch_buffer(&handles, 0).unwrap().bytes, 1024);
    assert_eq!(ModelAllocator::get_scratch_buffer(&handles, 1).unwrap().bytes, 16);
}

#[test]
fn arena_too_small_reports_required_and_available() {
    let bytes = chain_model(&[1024, 2048, 1024]);
    let model = Model::from_bytes(&bytes).unwrap();
    let resolver = test_resolver();

    let mut backing = AlignedArena::<256>::new();
    let mut allocator = ModelAllocator::new(backing.as_mut_slice());
    let mut allocation = allocator.start_model_allocation(&model, &resolver).unwrap();
    let err = allocator
        .finish_model_allocation(&model, &mut allocation)
        .unwrap_err();

    match err {
        MicroForgeError::ArenaExhausted {
            requested,
            available,
        } => {
            assert_eq!(requested, 2048 + 1024);
            assert!(available <= 256);
        }
        other => panic!("expected ArenaExhausted, got {other:?}"),
    }
}

#[test]
fn committed_plan_respects_lifetime_disjointness_and_alignment() {
    let bytes = diamond_model();
    let model = Model::from_bytes(&bytes).unwrap();
    let resolver = test_resolver();

    let mut backing = AlignedArena::<8192>::new();
    let mut allocator = ModelAllocator::new(backing.as_mut_slice());
    let mut allocation = allocator.start_model_allocation(&model, &resolver).unwrap();
    allocator
        .finish_model_allocation(&model, &mut allocation)
        .unwrap();

    let mut ranges = Vec::new();
    for (i, tensor) in allocation.eval_tensors.iter().enumerate() {
        let offset = arena_offset(tensor.data);
        assert_eq!(offset % 16, 0, "tensor {i} offset must be 16-aligned");
        let size16 = tensor.byte_length().unwrap().div_ceil(16) * 16;
        ranges.push((offset, offset + size16, DIAMOND_LIFETIMES[i]));
    }

    for (i, &(start_a, end_a, (first_a, last_a))) in ranges.iter().enumerate() {
        for &(start_b, end_b, (first_b, last_b)) in ranges.iter().skip(i + 1) {
            let lifetimes_overlap = first_a <= last_b && first_b <= last_a;
            if lifetimes_overlap {
                assert!(
                    end_a <= start_b || end_b <= start_a,
                    "tensors with overlapping lifetimes share bytes"
                );
            }
        }
    }

    // head + tail never exceed capacity.
    assert!(allocator.used_bytes() <= allocator.arena().capacity());
}

#[test]
fn constants_keep_pointing_into_model_bytes() {
    let mut builder = ModelBuilder::new();
    let weights: Vec<u8> = (0..64u8).collect();
    let buf = builder.add_buffer(&weights);
    let opcode = builder.add_builtin_opcode(microforge::BuiltinOperator::Add);
    builder.add_tensor(ElementType::F32, &[16], 0, false);
    builder.add_tensor(ElementType::F32, &[16], buf, false);
    builder.add_tensor(ElementType::F32, &[16], 0, false);
    builder.add_operator(opcode, &[0, 1], &[2]);
    builder.set_inputs(&[0]);
    builder.set_outputs(&[2]);
    let bytes = builder.build();
    let model = Model::from_bytes(&bytes).unwrap();
    let resolver = test_resolver();

    let mut backing = AlignedArena::<8192>::new();
    let mut allocator = ModelAllocator::new(backing.as_mut_slice());
    let mut allocation = allocator.start_model_allocation(&model, &resolver).unwrap();
    allocator
        .finish_model_allocation(&model, &mut allocation)
        .unwrap();

    let constant = &allocation.eval_tensors[1];
    assert!(matches!(constant.data, Some(DataRef::Model { .. })));
    let data = allocator.tensor_data(&model, constant).unwrap().unwrap();
    assert_eq!(data, weights.as_slice());
    // Constants are read-only.
    assert!(allocator.tensor_data_mut(&constant.clone()).is_err());
}

#[test]
fn subgraph_inputs_and_outputs_span_the_invocation() {
    // The input keeps offset stability from step 0, the output from the
    // last operator; with only two tensors live at disjoint times plus the
    // overlap through the middle, input and output must not collide with
    // their neighbors.
    let bytes = chain_model(&[512, 512, 512, 512]);
    let model = Model::from_bytes(&bytes).unwrap();
    let resolver = test_resolver();

    let mut backing = AlignedArena::<8192>::new();
    let mut allocator = ModelAllocator::new(backing.as_mut_slice());
    let mut allocation = allocator.start_model_allocation(&model, &resolver).unwrap();
    allocator
        .finish_model_allocation(&model, &mut allocation)
        .unwrap();

    let offsets: Vec<usize> = allocation
        .eval_tensors
        .iter()
        .map(|t| arena_offset(t.data))
        .collect();
    // Adjacent tensors in the chain are always live together.
    for window in offsets.windows(2) {
        assert_ne!(window[0], window[1]);
    }
}

#[test]
fn second_model_can_be_planned_after_finish() {
    let bytes = chain_model(&[256, 256]);
    let model = Model::from_bytes(&bytes).unwrap();
    let resolver = test_resolver();

    let mut backing = AlignedArena::<8192>::new();
    let mut allocator = ModelAllocator::new(backing.as_mut_slice());
    let mut first = allocator.start_model_allocation(&model, &resolver).unwrap();
    allocator.finish_model_allocation(&model, &mut first).unwrap();

    let mut second = allocator.start_model_allocation(&model, &resolver).unwrap();
    allocator
        .finish_model_allocation(&model, &mut second)
        .unwrap();
    assert!(arena_offset(second.eval_tensors[0].data) < allocator.arena().head_used());
}
