//! Benchmarks for the per-phase cost of the resource lifecycle on the host emulator

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::sync::Arc;
use veda_cl::kernels::{self, SAXPY};
use veda_cl::prelude::*;

fn host() -> Arc<HostRuntime> {
    let runtime = Arc::new(HostRuntime::new());
    kernels::register_host_kernels(&runtime);
    runtime
}

fn bench_context_creation(c: &mut Criterion) {
    let runtime = host();
    c.bench_function("context_creation", |b| {
        b.iter(|| DeviceContext::create(runtime.clone(), black_box(DeviceKind::Gpu)).unwrap());
    });
}

fn bench_program_build(c: &mut Criterion) {
    let runtime = host();
    let ctx = DeviceContext::create(runtime, DeviceKind::Gpu).unwrap();
    c.bench_function("program_build", |b| {
        b.iter(|| CompiledProgram::build(&ctx, black_box(SAXPY.source), SAXPY.entry_point).unwrap());
    });
}

fn bench_saxpy(c: &mut Criterion) {
    let runtime = host();
    let ctx = DeviceContext::create(runtime, DeviceKind::Gpu).unwrap();
    let mut group = c.benchmark_group("saxpy");

    for size in [1024usize, 16 * 1024, 256 * 1024] {
        let a = DeviceBuffer::from_slice(&ctx, &vec![1.0f32; size], AccessMode::ReadOnly).unwrap();
        let b = DeviceBuffer::from_slice(&ctx, &vec![2.0f32; size], AccessMode::ReadOnly).unwrap();
        let out = DeviceBuffer::<f32>::new(&ctx, size, AccessMode::WriteOnly).unwrap();
        let mut program = CompiledProgram::build(&ctx, SAXPY.source, SAXPY.entry_point).unwrap();
        program.bind_args(&kernel_args![2.35f32, &a, &b, &out]).unwrap();
        let mut queue = CommandQueue::create(&ctx).unwrap();

        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |bench, &size| {
            bench.iter(|| {
                queue.launch(&program, size).unwrap();
                let ticket = queue.read(&out, size).unwrap();
                queue.drain().unwrap();
                black_box(queue.take(&ticket).unwrap())
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_context_creation, bench_program_build, bench_saxpy);
criterion_main!(benches);
