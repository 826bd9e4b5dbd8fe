//! VEDA-CL - accelerator resource lifecycle
//!
//! Safe wrappers around a compute runtime: a device context, typed device
//! buffers, compiled programs with bound arguments, and an in-order command
//! queue. Every wrapper borrows the context it was created from, so the
//! borrow checker guarantees nothing outlives it, and every wrapper releases
//! its native handle exactly once when dropped.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use veda_cl::prelude::*;
//!
//! # fn main() -> veda_cl::Result<()> {
//! let runtime = HostRuntime::new();
//! veda_cl::kernels::register_host_kernels(&runtime);
//! let ctx = DeviceContext::create(Arc::new(runtime), DeviceKind::Gpu)?;
//!
//! let a = DeviceBuffer::from_slice(&ctx, &[1.0f32; 1024], AccessMode::ReadOnly)?;
//! let b = DeviceBuffer::from_slice(&ctx, &[2.0f32; 1024], AccessMode::ReadOnly)?;
//! let c = DeviceBuffer::<f32>::new(&ctx, 1024, AccessMode::WriteOnly)?;
//!
//! let mut program = CompiledProgram::build(&ctx, veda_cl::kernels::SAXPY.source, "saxpy_kernel")?;
//! program.bind_args(&kernel_args![2.0f32, &a, &b, &c])?;
//!
//! let mut queue = CommandQueue::create(&ctx)?;
//! queue.launch(&program, 1024)?;
//! let ticket = queue.read(&c, 1024)?;
//! queue.drain()?;
//! let result: Vec<f32> = queue.take(&ticket)?;
//! assert_eq!(result[0], 4.0);
//! # Ok(())
//! # }
//! ```
//!
//! # Features
//!
//! - **Deterministic teardown**: handles are released in dependency order by `Drop`
//! - **Typed failures**: every native failure carries its status code and call name
//! - **Host emulator**: an in-process runtime for tests, with failure injection
//! - **OpenCL backend**: the `opencl` feature drives a real ICD loader
//! - **Telemetry**: per-phase timing histograms and exporters (optional)

#![warn(missing_debug_implementations)]

pub mod buffer;
pub mod config;
pub mod context;
pub mod error;
pub mod kernels;
pub mod prelude;
pub mod program;
pub mod queue;
pub mod runtime;
pub mod telemetry;

pub use buffer::{AccessMode, DeviceBuffer};
pub use config::{Config, ConfigBuilder, GeometryCheck};
pub use context::DeviceContext;
pub use error::{Direction, Error, Result, Status};
pub use program::{BufferArg, CompiledProgram, KernelArg, ProgramSource};
pub use queue::{CommandQueue, QueueState, ReadTicket};
pub use runtime::{ComputeRuntime, DeviceInfo, DeviceKind, HostRuntime};
pub use telemetry::{Phase, PhaseRecorder};

#[cfg(feature = "opencl")]
pub use runtime::OpenClRuntime;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_saxpy_end_to_end() {
        let runtime = Arc::new(HostRuntime::new());
        kernels::register_host_kernels(&runtime);
        {
            let ctx = DeviceContext::create(runtime.clone(), DeviceKind::Gpu).unwrap();
            let a = DeviceBuffer::from_slice(&ctx, &[1.0f32; 64], AccessMode::ReadOnly).unwrap();
            let b = DeviceBuffer::from_slice(&ctx, &[0.5f32; 64], AccessMode::ReadOnly).unwrap();
            let c = DeviceBuffer::<f32>::new(&ctx, 64, AccessMode::WriteOnly).unwrap();

            let mut program =
                CompiledProgram::build(&ctx, kernels::SAXPY.source, "saxpy_kernel").unwrap();
            program.bind_args(&kernel_args![3.0f32, &a, &b, &c]).unwrap();

            let mut queue = CommandQueue::create(&ctx).unwrap();
            queue.launch(&program, 64).unwrap();
            let ticket = queue.read(&c, 64).unwrap();
            queue.drain().unwrap();
            let out = queue.take(&ticket).unwrap();
            assert!(out.iter().all(|&v| v == 3.5));
        }
        assert!(runtime.live_objects().is_empty());
    }
}
