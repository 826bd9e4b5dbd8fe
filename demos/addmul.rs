//! Byte-wise `C = alpha * A + B` with wrapping arithmetic.

use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;
use veda_cl::kernels;
use veda_cl::prelude::*;

const N: usize = 256;
const ALPHA: u8 = 3;

fn main() -> veda_cl::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let runtime = HostRuntime::new();
    kernels::register_host_kernels(&runtime);

    let config = Config::builder()
        .device_kind(DeviceKind::Cpu)
        .local_work_size(32)
        .blocking_writes(false)
        .build()?;
    let ctx = DeviceContext::with_config(Arc::new(runtime), config)?;
    info!(device = %ctx.device_info()?.name, "context ready");

    let a: Vec<u8> = (0..N).map(|i| i as u8).collect();
    let b: Vec<u8> = (0..N).map(|i| (N - 1 - i) as u8).collect();

    let buf_a = DeviceBuffer::<u8>::new(&ctx, N, AccessMode::ReadOnly)?;
    let buf_b = DeviceBuffer::<u8>::new(&ctx, N, AccessMode::ReadOnly)?;
    let buf_c = DeviceBuffer::<u8>::new(&ctx, N, AccessMode::WriteOnly)?;

    let mut program = CompiledProgram::build(&ctx, kernels::ADDMUL.source, kernels::ADDMUL.entry_point)?;
    program.bind_args(&kernel_args![ALPHA, &buf_a, &buf_b, &buf_c])?;

    let mut queue = CommandQueue::create(&ctx)?;
    queue.write(&buf_a, &a)?;
    queue.write(&buf_b, &b)?;
    queue.launch(&program, N)?;
    let ticket = queue.read(&buf_c, N)?;
    queue.drain()?;
    let c = queue.take(&ticket)?;

    let wrong = (0..N)
        .filter(|&i| c[i] != ALPHA.wrapping_mul(a[i]).wrapping_add(b[i]))
        .count();
    info!(elements = N, wrong, "addmul finished");
    println!("C[0..8] = {:?}", &c[..8]);
    Ok(())
}
