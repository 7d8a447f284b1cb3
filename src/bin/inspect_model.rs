use std::env;

use microforge::{
    BuiltinOperator, MicroOpResolver, Model, ModelAllocator, DataRef,
};

fn main() -> anyhow::Result<()> {
    microforge::logging::init_logging_default();

    let args: Vec<String> = env::args().collect();
    if args.len() != 2 {
        eprintln!("Usage: {} <path-to-mfge-file>", args[0]);
        std::process::exit(1);
    }

    let path = &args[1];
    println!("Inspecting model: {}", path);

    let bytes = std::fs::read(path)?;
    let model = Model::from_bytes(&bytes)?;

    println!("\n=== Container ===");
    println!("Size: {} bytes", model.len());
    println!("Tensors: {}", model.tensor_count());
    println!("Operators: {}", model.operator_count());
    println!("Buffers: {}", model.buffer_count());
    println!("Metadata entries: {}", model.metadata_count());

    println!("\n=== Tensors ===");
    for i in 0..model.tensor_count() {
        let tensor = model.tensor(i)?;
        let shape: Vec<i32> = tensor.shape().to_vec();
        let (_, payload_len) = model.buffer_range(tensor.buffer)?;
        let kind = if payload_len > 0 {
            "constant"
        } else if tensor.is_variable {
            "variable"
        } else {
            "activation"
        };
        println!(
            "{}. {} {:?} ({}{})",
            i,
            tensor.dtype.as_str(),
            shape,
            kind,
            if tensor.quantization.is_some() {
                ", quantized"
            } else {
                ""
            }
        );
    }

    println!("\n=== Operators ===");
    for i in 0..model.operator_count() {
        let op = model.operator(i)?;
        let opcode = model.opcode(op.opcode_index)?;
        let name = match BuiltinOperator::from_code(opcode.builtin_code) {
            Some(BuiltinOperator::Custom) => opcode.name,
            Some(builtin) => builtin.name(),
            None => "<unknown>",
        };
        println!(
            "{}. {} inputs={:?} outputs={:?}",
            i,
            name,
            op.inputs().to_vec(),
            op.outputs().to_vec()
        );
    }

    println!("\n=== Metadata ===");
    for i in 0..model.metadata_count() {
        let entry = model.metadata(i)?;
        let payload = model.buffer(entry.buffer)?;
        println!("{}. {} ({} bytes)", i, entry.name, payload.len());
    }

    // Dry-run the static memory plan in a scratch arena to report the
    // footprint the model would need on target.
    println!("\n=== Memory plan (dry run) ===");
    let mut resolver = MicroOpResolver::new();
    for i in 0..model.opcode_count() {
        let opcode = model.opcode(i)?;
        match BuiltinOperator::from_code(opcode.builtin_code) {
            Some(BuiltinOperator::Custom) => {
                resolver.register_custom(Box::leak(opcode.name.to_owned().into_boxed_str()));
            }
            Some(builtin) => {
                resolver.register_builtin(builtin);
            }
            None => {}
        }
    }

    let mut arena = vec![0u8; 4 * 1024 * 1024];
    let mut allocator = ModelAllocator::new(&mut arena);
    let mut allocation = allocator.start_model_allocation(&model, &resolver)?;
    allocator.finish_model_allocation(&model, &mut allocation)?;

    for (i, tensor) in allocation.eval_tensors.iter().enumerate() {
        match tensor.data {
            Some(DataRef::Arena { offset }) => {
                println!("tensor {}: arena offset {}", i, offset)
            }
            Some(DataRef::Model { start, len }) => {
                println!("tensor {}: model bytes [{}, {})", i, start, start + len)
            }
            None => println!("tensor {}: not materialized", i),
        }
    }
    println!(
        "arena footprint: {} bytes (head {}, tail {})",
        allocator.used_bytes(),
        allocator.arena().head_used(),
        allocator.arena().tail_used()
    );

    Ok(())
}
