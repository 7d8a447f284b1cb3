//! Memory planner benchmark suite
//!
//! Tracks the cost of the full allocation pipeline (descriptor build,
//! lifetime analysis, greedy planning, commit) for activation chains of
//! increasing depth, plus the planner in isolation.
//!
//! Run with: `cargo bench --bench planner_bench`

use std::hint::black_box;
use std::time::{Duration, Instant};

use microforge::{
    BuiltinOperator, ElementType, GreedyMemoryPlanner, MicroOpResolver, Model, ModelAllocator,
    ModelBuilder,
};

struct Benchmark {
    name: String,
    iterations: usize,
    warmup_iterations: usize,
}

impl Benchmark {
    fn new(name: &str, iterations: usize) -> Self {
        Benchmark {
            name: name.to_string(),
            iterations,
            warmup_iterations: iterations.min(10),
        }
    }

    fn run<F, R>(&self, mut f: F) -> BenchmarkResult
    where
        F: FnMut() -> R,
    {
        for _ in 0..self.warmup_iterations {
            black_box(f());
        }

        let mut durations = Vec::with_capacity(self.iterations);
        for _ in 0..self.iterations {
            let start = Instant::now();
            black_box(f());
            durations.push(start.elapsed());
        }

        BenchmarkResult {
            name: self.name.clone(),
            iterations: self.iterations,
            durations,
        }
    }
}

struct BenchmarkResult {
    name: String,
    iterations: usize,
    durations: Vec<Duration>,
}

impl BenchmarkResult {
    fn report(&self) {
        let total: Duration = self.durations.iter().sum();
        let avg = total / self.iterations as u32;
        let min = *self.durations.iter().min().unwrap();
        let max = *self.durations.iter().max().unwrap();

        let mut sorted = self.durations.clone();
        sorted.sort();
        let p50 = sorted[sorted.len() / 2];
        let p95 = sorted[(sorted.len() * 95) / 100];

        println!("\n=== {} ===", self.name);
        println!("Iterations: {}", self.iterations);
        println!("Average: {:.3} ms", avg.as_secs_f64() * 1000.0);
        println!("Min:     {:.3} ms", min.as_secs_f64() * 1000.0);
        println!("Max:     {:.3} ms", max.as_secs_f64() * 1000.0);
        println!("P50:     {:.3} ms", p50.as_secs_f64() * 1000.0);
        println!("P95:     {:.3} ms", p95.as_secs_f64() * 1000.0);
    }
}

/// Serialized activation chain with `tensors` f32 tensors of varying sizes.
fn build_chain(tensors: usize) -> Vec<u8> {
    let mut builder = ModelBuilder::new();
    let opcode = builder.add_builtin_opcode(BuiltinOperator::Softmax);
    for i in 0..tensors {
        let dim = 64 + ((i * 37) % 192) as i32;
        builder.add_tensor(ElementType::F32, &[dim], 0, false);
    }
    for i in 0..tensors - 1 {
        builder.add_operator(opcode, &[i as i32], &[i as i32 + 1]);
    }
    builder.set_inputs(&[0]);
    builder.set_outputs(&[tensors as i32 - 1]);
    builder.build()
}

fn benchmark_full_pipeline() {
    println!("\n[Full Allocation Pipeline]");
    println!("===========================");

    for tensors in [16usize, 64, 256] {
        let bytes = build_chain(tensors);
        let model = Model::from_bytes(&bytes).unwrap();
        let mut resolver = MicroOpResolver::new();
        resolver.register_builtin(BuiltinOperator::Softmax);

        let bench = Benchmark::new(&format!("start + finish ({tensors} tensors)"), 100);
        let result = bench.run(|| {
            let mut arena = vec![0u8; 1024 * 1024];
            let mut allocator = ModelAllocator::new(&mut arena);
            let mut allocation = allocator.start_model_allocation(&model, &resolver).unwrap();
            allocator
                .finish_model_allocation(&model, &mut allocation)
                .unwrap();
            allocator.used_bytes()
        });
        result.report();
    }
}

fn benchmark_planner_only() {
    println!("\n[Greedy Planner]");
    println!("=================");

    for buffers in [32usize, 128, 512] {
        let bench = Benchmark::new(&format!("plan {buffers} buffers"), 100);
        let result = bench.run(|| {
            let mut planner = GreedyMemoryPlanner::new();
            for i in 0..buffers {
                let size = (64 + (i * 53) % 4096).div_ceil(16) * 16;
                let first = (i % 23) as i32;
                let last = first + (i % 5) as i32;
                planner.add_buffer(size, first, last).unwrap();
            }
            planner.maximum_memory_size().unwrap()
        });
        result.report();
    }
}

fn benchmark_scratch_heavy() {
    println!("\n[Scratch-Heavy Model]");
    println!("======================");

    let tensors = 64;
    let bytes = build_chain(tensors);
    let model = Model::from_bytes(&bytes).unwrap();
    let mut resolver = MicroOpResolver::new();
    resolver.register_builtin(BuiltinOperator::Softmax);

    let bench = Benchmark::new("2 scratch requests per operator", 100);
    let result = bench.run(|| {
        let mut arena = vec![0u8; 1024 * 1024];
        let mut allocator = ModelAllocator::new(&mut arena);
        let mut allocation = allocator.start_model_allocation(&model, &resolver).unwrap();
        for op in 0..tensors - 1 {
            allocator.request_scratch_buffer(op, 512).unwrap();
            allocator.request_scratch_buffer(op, 128).unwrap();
        }
        let handles = allocator
            .finish_model_allocation(&model, &mut allocation)
            .unwrap();
        handles.len()
    });
    result.report();
}

fn main() {
    println!("========================================");
    println!("MicroForge Memory Planner Benchmark Suite");
    println!("========================================");

    benchmark_full_pipeline();
    benchmark_planner_only();
    benchmark_scratch_heavy();

    println!("\n========================================");
    println!("Benchmark Complete");
    println!("========================================");
}
