pub use crate::buffer::{AccessMode, DeviceBuffer};
pub use crate::config::{Config, ConfigBuilder, GeometryCheck};
pub use crate::context::DeviceContext;
pub use crate::error::{Direction, Error, Result, Status};
pub use crate::kernel_args;
pub use crate::program::{CompiledProgram, KernelArg, ProgramSource};
pub use crate::queue::{CommandQueue, QueueState, ReadTicket};
pub use crate::runtime::{ComputeRuntime, DeviceKind, HostRuntime};
pub use crate::telemetry::{Phase, PhaseRecorder};

#[cfg(feature = "telemetry")]
pub use crate::telemetry::{ConsoleExporter, MetricsExporter, MetricsSnapshot};

#[cfg(feature = "opencl")]
pub use crate::runtime::OpenClRuntime;
