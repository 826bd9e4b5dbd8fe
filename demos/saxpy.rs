//! SAXPY over 1024 floats, with a per-phase timing table.
//!
//! Runs on the host emulator by default. Build with `--features opencl` and set
//! `VEDA_CL_BACKEND=opencl` to use the system OpenCL driver instead.
//!
//! ```text
//! RUST_LOG=veda_cl=debug cargo run --example saxpy
//! ```

use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use veda_cl::kernels;
use veda_cl::prelude::*;

const N: usize = 1024;
const ALPHA: f32 = 2.35;

fn select_runtime() -> Arc<dyn ComputeRuntime> {
    #[cfg(feature = "opencl")]
    {
        if std::env::var("VEDA_CL_BACKEND").as_deref() == Ok("opencl") {
            return Arc::new(OpenClRuntime);
        }
    }
    let runtime = HostRuntime::new();
    kernels::register_host_kernels(&runtime);
    Arc::new(runtime)
}

fn run(recorder: &PhaseRecorder) -> veda_cl::Result<Vec<f32>> {
    let a: Vec<f32> = (0..N).map(|i| i as f32).collect();
    let b: Vec<f32> = (0..N).map(|i| (N - i) as f32).collect();

    let ctx = recorder.time(Phase::ContextCreation, || {
        DeviceContext::create(select_runtime(), DeviceKind::Gpu)
    })?;
    println!("platform: {}", ctx.platform_name()?);
    let info = ctx.device_info()?;
    println!("device:   {} ({}, {})\n", info.name, info.vendor, info.kind);

    let (buf_a, buf_b, buf_c) = recorder.time(Phase::BufferAllocation, || {
        Ok((
            DeviceBuffer::from_slice(&ctx, &a, AccessMode::ReadOnly)?,
            DeviceBuffer::from_slice(&ctx, &b, AccessMode::ReadOnly)?,
            DeviceBuffer::<f32>::new(&ctx, N, AccessMode::WriteOnly)?,
        ))
    })?;
    recorder.record_bytes(buf_a.byte_size() + buf_b.byte_size());

    let mut program = recorder.time(Phase::ProgramBuild, || {
        CompiledProgram::build(&ctx, kernels::SAXPY.source, kernels::SAXPY.entry_point)
    })?;
    recorder.time(Phase::ArgumentBinding, || {
        program.bind_args(&kernel_args![ALPHA, &buf_a, &buf_b, &buf_c])
    })?;

    let mut queue = recorder.time(Phase::QueueCreation, || CommandQueue::create(&ctx))?;
    let ticket = recorder.time(Phase::Enqueue, || {
        queue.launch(&program, N)?;
        queue.read(&buf_c, N)
    })?;
    recorder.time(Phase::Drain, || queue.drain())?;
    recorder.record_bytes(buf_c.byte_size());

    queue.take(&ticket)
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    println!("=== SAXPY: C = {} * A + B ===\n", ALPHA);

    let recorder = PhaseRecorder::new().expect("Failed to create recorder");
    let result = match run(&recorder) {
        Ok(result) => result,
        Err(err) => {
            eprintln!("saxpy failed: {}", err);
            std::process::exit(1);
        }
    };

    let mismatches = result
        .iter()
        .enumerate()
        .filter(|&(i, &c)| {
            let expected = ALPHA * i as f32 + (N - i) as f32;
            ((c - expected) / expected).abs() > 1e-5
        })
        .count();

    println!("C[0..4] = {:?}", &result[..4]);
    println!("mismatches: {}\n", mismatches);

    println!("--- Timing (ms) ---");
    ConsoleExporter::new(std::env::args().any(|a| a == "--verbose"))
        .export(&recorder.snapshot())
        .expect("Failed to export metrics");

    if mismatches > 0 {
        std::process::exit(1);
    }
}
