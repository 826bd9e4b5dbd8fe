//! Kernel programs: compilation, entry-point extraction and positional
//! argument binding.

use crate::buffer::DeviceBuffer;
use crate::context::DeviceContext;
use crate::error::{Error, Result};
use crate::runtime::{ArgValue, ComputeRuntime, DeviceId, KernelHandle, MemHandle, ProgramHandle};
use bytemuck::Pod;
use std::fmt;
use std::marker::PhantomData;
use tracing::{debug, trace, warn};

/// Initial size of the buffer the build log is read into.
const BUILD_LOG_SCRATCH: usize = 1024;

/// Where a program comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgramSource<'a> {
    /// UTF-8 kernel source text.
    Text(&'a str),
    /// A precompiled, device-specific binary.
    Binary(&'a [u8]),
}

impl<'a> From<&'a str> for ProgramSource<'a> {
    fn from(source: &'a str) -> Self {
        ProgramSource::Text(source)
    }
}

impl<'a> From<&'a String> for ProgramSource<'a> {
    fn from(source: &'a String) -> Self {
        ProgramSource::Text(source)
    }
}

impl<'a> From<&'a [u8]> for ProgramSource<'a> {
    fn from(binary: &'a [u8]) -> Self {
        ProgramSource::Binary(binary)
    }
}

impl<'a> From<&'a Vec<u8>> for ProgramSource<'a> {
    fn from(binary: &'a Vec<u8>) -> Self {
        ProgramSource::Binary(binary)
    }
}

/// One positional kernel argument.
///
/// A buffer argument borrows its [`DeviceBuffer`] for `'b`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KernelArg<'b> {
    /// A by-value argument, as its raw bytes.
    Scalar(Vec<u8>),
    /// A device buffer.
    Buffer(BufferArg<'b>),
}

/// A borrowed device buffer, as bound to a kernel parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferArg<'b> {
    mem: MemHandle,
    _borrow: PhantomData<&'b ()>,
}

impl BufferArg<'_> {
    pub fn mem(&self) -> MemHandle {
        self.mem
    }
}

impl<'b> KernelArg<'b> {
    pub fn scalar<T: Pod>(value: T) -> Self {
        KernelArg::Scalar(bytemuck::bytes_of(&value).to_vec())
    }

    pub fn buffer<T: Pod>(buffer: &'b DeviceBuffer<'_, T>) -> Self {
        KernelArg::Buffer(BufferArg {
            mem: buffer.mem(),
            _borrow: PhantomData,
        })
    }

    fn as_value(&self) -> ArgValue<'_> {
        match self {
            KernelArg::Scalar(bytes) => ArgValue::Bytes(bytes),
            KernelArg::Buffer(buffer) => ArgValue::Mem(buffer.mem),
        }
    }
}

macro_rules! impl_scalar_arg {
    ($($ty:ty),* $(,)?) => {
        $(
            impl From<$ty> for KernelArg<'_> {
                fn from(value: $ty) -> Self {
                    KernelArg::scalar(value)
                }
            }
        )*
    };
}

impl_scalar_arg!(u8, i8, u16, i16, u32, i32, u64, i64, f32, f64);

/// Vector types (`float4`, `int2`, ...).
impl<T: Pod, const N: usize> From<[T; N]> for KernelArg<'_> {
    fn from(value: [T; N]) -> Self {
        KernelArg::Scalar(bytemuck::cast_slice(&value).to_vec())
    }
}

impl<'b, T: Pod> From<&'b DeviceBuffer<'_, T>> for KernelArg<'b> {
    fn from(buffer: &'b DeviceBuffer<'_, T>) -> Self {
        KernelArg::buffer(buffer)
    }
}

/// Builds a `Vec<KernelArg>` from scalars and buffer references, in order.
///
/// ```ignore
/// program.bind_args(&kernel_args![2.35f32, &a, &b, &c])?;
/// ```
#[macro_export]
macro_rules! kernel_args {
    () => {
        ::std::vec::Vec::<$crate::program::KernelArg>::new()
    };
    ($($arg:expr),+ $(,)?) => {
        ::std::vec![$($crate::program::KernelArg::from($arg)),+]
    };
}

/// Releases a program on early return unless disarmed.
struct ProgramGuard<'a> {
    runtime: &'a dyn ComputeRuntime,
    program: ProgramHandle,
    armed: bool,
}

impl ProgramGuard<'_> {
    fn disarm(mut self) -> ProgramHandle {
        self.armed = false;
        self.program
    }
}

impl Drop for ProgramGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            if let Err(status) = self.runtime.release_program(self.program) {
                warn!(op = "clReleaseProgram", %status, "failed to release partially built program");
            }
        }
    }
}

/// Reads the build log. Returns `"undefined"` if the runtime cannot report one.
fn read_build_log(runtime: &dyn ComputeRuntime, program: ProgramHandle, device: DeviceId) -> String {
    let mut scratch = vec![0u8; BUILD_LOG_SCRATCH];
    let reported = match runtime.program_build_log(program, device, &mut scratch) {
        Ok(len) => len,
        Err(_) => return "undefined".to_string(),
    };
    if reported > scratch.len() {
        scratch.resize(reported, 0);
        if runtime.program_build_log(program, device, &mut scratch).is_err() {
            return "undefined".to_string();
        }
    }
    scratch.truncate(reported);
    while scratch.last() == Some(&0) {
        scratch.pop();
    }
    String::from_utf8_lossy(&scratch).into_owned()
}

/// A built program with one extracted kernel entry point.
///
/// Buffers bound through [`bind_args`](Self::bind_args) stay borrowed for
/// `'b`, so none of them can be released while the program may still launch
/// with it:
///
/// ```compile_fail
/// use std::sync::Arc;
/// use veda_cl::kernels::{self, COPY};
/// use veda_cl::prelude::*;
///
/// # fn main() -> veda_cl::Result<()> {
/// let runtime = Arc::new(HostRuntime::new());
/// kernels::register_host_kernels(&runtime);
/// let ctx = DeviceContext::create(runtime, DeviceKind::Gpu)?;
/// let src = DeviceBuffer::from_slice(&ctx, &[1.0f32; 64], AccessMode::ReadOnly)?;
/// let dst = DeviceBuffer::<f32>::new(&ctx, 64, AccessMode::WriteOnly)?;
/// let mut program = CompiledProgram::build(&ctx, COPY.source, COPY.entry_point)?;
/// program.bind_args(&kernel_args![&src, &dst])?;
/// drop(src);
/// let mut queue = CommandQueue::create(&ctx)?;
/// queue.launch(&program, 64)?;
/// # Ok(())
/// # }
/// ```
pub struct CompiledProgram<'ctx, 'b> {
    ctx: &'ctx DeviceContext,
    program: ProgramHandle,
    kernel: KernelHandle,
    entry_point: String,
    next_arg_index: u32,
    _bound: PhantomData<&'b ()>,
}

impl<'ctx, 'b> CompiledProgram<'ctx, 'b> {
    /// Compile `source` for the context's primary device and extract `entry_point`.
    ///
    /// Build options come from the context's [`Config`](crate::Config). Any
    /// failure releases the program before returning.
    pub fn build<'s>(
        ctx: &'ctx DeviceContext,
        source: impl Into<ProgramSource<'s>>,
        entry_point: &str,
    ) -> Result<Self> {
        let runtime = ctx.runtime();
        let device = ctx.device();

        let program = match source.into() {
            ProgramSource::Text(text) => runtime
                .create_program_with_source(ctx.context(), text)
                .map_err(|status| Error::ProgramBuild {
                    op: "clCreateProgramWithSource",
                    status,
                    log: String::new(),
                })?,
            ProgramSource::Binary(binary) => runtime
                .create_program_with_binary(ctx.context(), device, binary)
                .map_err(|status| Error::ProgramBuild {
                    op: "clCreateProgramWithBinary",
                    status,
                    log: String::new(),
                })?,
        };
        let guard = ProgramGuard {
            runtime,
            program,
            armed: true,
        };

        if let Err(status) = runtime.build_program(program, device, &ctx.config().build_options) {
            let log = read_build_log(runtime, program, device);
            return Err(Error::ProgramBuild {
                op: "clBuildProgram",
                status,
                log,
            });
        }

        let kernel = runtime
            .create_kernel(program, entry_point)
            .map_err(|status| Error::EntryPointNotFound {
                entry_point: entry_point.to_string(),
                op: "clCreateKernel",
                status,
            })?;

        let program = guard.disarm();
        debug!(
            program = program.as_raw(),
            kernel = kernel.as_raw(),
            entry_point,
            "program built"
        );

        Ok(Self {
            ctx,
            program,
            kernel,
            entry_point: entry_point.to_string(),
            next_arg_index: 0,
            _bound: PhantomData,
        })
    }

    /// Bind `args` to parameters `0..args.len()` in order.
    ///
    /// Resets the argument cursor first. Binding stops at the first failure,
    /// which reports the failing index.
    pub fn bind_args(&mut self, args: &[KernelArg<'b>]) -> Result<()> {
        self.next_arg_index = 0;
        for arg in args {
            self.push_arg(arg)?;
        }
        Ok(())
    }

    /// Bind `arg` at the cursor and advance it.
    pub fn push_arg(&mut self, arg: &KernelArg<'b>) -> Result<()> {
        let index = self.next_arg_index;
        self.set_arg(index, arg)?;
        self.next_arg_index += 1;
        Ok(())
    }

    /// Bind `arg` at an explicit index. The cursor is left unchanged.
    pub fn set_arg(&mut self, index: u32, arg: &KernelArg<'b>) -> Result<()> {
        self.ctx
            .runtime()
            .set_kernel_arg(self.kernel, index, arg.as_value())
            .map_err(|status| Error::ArgumentBind {
                index,
                op: "clSetKernelArg",
                status,
            })?;
        trace!(
            kernel = self.kernel.as_raw(),
            index,
            buffer = matches!(arg, KernelArg::Buffer(..)),
            "kernel argument bound"
        );
        Ok(())
    }

    /// Device build log, including warnings from a successful build.
    pub fn build_log(&self) -> String {
        read_build_log(self.ctx.runtime(), self.program, self.ctx.device())
    }

    pub fn entry_point(&self) -> &str {
        &self.entry_point
    }

    /// Index the next [`push_arg`](Self::push_arg) binds to.
    pub fn next_arg_index(&self) -> u32 {
        self.next_arg_index
    }

    pub fn kernel(&self) -> KernelHandle {
        self.kernel
    }

    pub fn program(&self) -> ProgramHandle {
        self.program
    }

    pub fn context(&self) -> &'ctx DeviceContext {
        self.ctx
    }
}

impl Drop for CompiledProgram<'_, '_> {
    fn drop(&mut self) {
        let runtime = self.ctx.runtime();
        if let Err(status) = runtime.release_kernel(self.kernel) {
            warn!(op = "clReleaseKernel", %status, kernel = self.kernel.as_raw(), "failed to release kernel");
        }
        if let Err(status) = runtime.release_program(self.program) {
            warn!(op = "clReleaseProgram", %status, program = self.program.as_raw(), "failed to release program");
        }
        debug!(entry_point = %self.entry_point, "program released");
    }
}

impl fmt::Debug for CompiledProgram<'_, '_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledProgram")
            .field("entry_point", &self.entry_point)
            .field("program", &self.program)
            .field("kernel", &self.kernel)
            .field("next_arg_index", &self.next_arg_index)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::AccessMode;
    use crate::error::Status;
    use crate::kernels::{self, SAXPY};
    use crate::queue::CommandQueue;
    use crate::runtime::{DeviceKind, HostRuntime, NativeCall};
    use std::sync::Arc;

    fn setup() -> (Arc<HostRuntime>, DeviceContext) {
        let host = Arc::new(HostRuntime::new());
        kernels::register_host_kernels(&host);
        let ctx = DeviceContext::create(host.clone(), DeviceKind::Default).unwrap();
        (host, ctx)
    }

    #[test]
    fn test_kernel_args_macro_tags_each_value() {
        let args = crate::kernel_args![5i32, 1.5f32, [1u16, 2u16]];
        assert_eq!(
            args,
            vec![
                KernelArg::Scalar(5i32.to_ne_bytes().to_vec()),
                KernelArg::Scalar(1.5f32.to_ne_bytes().to_vec()),
                KernelArg::Scalar([1u16.to_ne_bytes(), 2u16.to_ne_bytes()].concat()),
            ]
        );
        assert!(crate::kernel_args![].is_empty());
    }

    #[test]
    fn test_build_and_bind() {
        let (host, ctx) = setup();
        let a = DeviceBuffer::<f32>::new(&ctx, 8, AccessMode::ReadOnly).unwrap();
        let mut program = CompiledProgram::build(&ctx, SAXPY.source, SAXPY.entry_point).unwrap();
        assert_eq!(program.entry_point(), "saxpy_kernel");
        assert_eq!(program.build_log(), "");

        program
            .bind_args(&crate::kernel_args![2.0f32, &a, &a, &a])
            .unwrap();
        assert_eq!(program.next_arg_index(), 4);

        // Rebinding starts from zero again.
        program.bind_args(&crate::kernel_args![1.0f32]).unwrap();
        assert_eq!(program.next_arg_index(), 1);

        assert_eq!(host.live_objects().kernels, 1);
        drop(program);
        assert_eq!(host.live_objects().kernels, 0);
        assert_eq!(host.live_objects().programs, 0);
    }

    #[test]
    fn test_bind_failure_reports_index() {
        let (_host, ctx) = setup();
        let a = DeviceBuffer::<f32>::new(&ctx, 8, AccessMode::ReadOnly).unwrap();
        let mut program = CompiledProgram::build(&ctx, SAXPY.source, SAXPY.entry_point).unwrap();
        // Index 2 expects a buffer.
        let err = program
            .bind_args(&crate::kernel_args![2.0f32, &a, 7u32, &a])
            .unwrap_err();
        match err {
            Error::ArgumentBind { index, op, status } => {
                assert_eq!(index, 2);
                assert_eq!(op, "clSetKernelArg");
                assert_eq!(status, Status::INVALID_ARG_SIZE);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(program.next_arg_index(), 2);
    }

    #[test]
    fn test_set_arg_leaves_cursor() {
        let (_host, ctx) = setup();
        let a = DeviceBuffer::<f32>::new(&ctx, 8, AccessMode::ReadOnly).unwrap();
        let mut program = CompiledProgram::build(&ctx, SAXPY.source, SAXPY.entry_point).unwrap();
        program.set_arg(3, &KernelArg::from(&a)).unwrap();
        assert_eq!(program.next_arg_index(), 0);
        program.push_arg(&KernelArg::scalar(1.0f32)).unwrap();
        assert_eq!(program.next_arg_index(), 1);
        let err = program.set_arg(4, &KernelArg::from(&a)).unwrap_err();
        assert_eq!(err.status(), Some(Status::INVALID_ARG_INDEX));
    }

    #[test]
    fn test_bound_buffers_outlive_program() {
        let (host, ctx) = setup();
        let a = DeviceBuffer::from_slice(&ctx, &[1.0f32; 64], AccessMode::ReadOnly).unwrap();
        let b = DeviceBuffer::from_slice(&ctx, &[2.0f32; 64], AccessMode::ReadOnly).unwrap();
        let c = DeviceBuffer::<f32>::new(&ctx, 64, AccessMode::WriteOnly).unwrap();
        match KernelArg::from(&c) {
            KernelArg::Buffer(arg) => assert_eq!(arg.mem(), c.mem()),
            other => panic!("unexpected argument: {other:?}"),
        }

        {
            let mut program = CompiledProgram::build(&ctx, SAXPY.source, SAXPY.entry_point).unwrap();
            program.bind_args(&crate::kernel_args![2.0f32, &a, &b, &c]).unwrap();
            let mut queue = CommandQueue::create(&ctx).unwrap();
            queue.launch(&program, 64).unwrap();
            let ticket = queue.read(&c, 64).unwrap();
            queue.drain().unwrap();
            assert_eq!(queue.take(&ticket).unwrap(), vec![4.0f32; 64]);
        }
        assert_eq!(host.live_objects().kernels, 0);
        assert_eq!(host.live_objects().buffers, 3);

        drop((a, b, c));
        assert_eq!(host.live_objects().buffers, 0);
        assert_eq!(host.teardown_violations(), 0);
    }

    #[test]
    fn test_missing_entry_point_releases_program() {
        let (host, ctx) = setup();
        let err = CompiledProgram::build(&ctx, SAXPY.source, "saxpy").unwrap_err();
        match err {
            Error::EntryPointNotFound {
                entry_point,
                op,
                status,
            } => {
                assert_eq!(entry_point, "saxpy");
                assert_eq!(op, "clCreateKernel");
                assert_eq!(status, Status::INVALID_KERNEL_NAME);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(host.live_objects().programs, 0);
    }

    #[test]
    fn test_build_failure_carries_log() {
        let (host, ctx) = setup();
        let err = CompiledProgram::build(&ctx, "__kernel void broken(float x) {", "broken").unwrap_err();
        assert_eq!(err.operation(), Some("clBuildProgram"));
        assert_eq!(err.status(), Some(Status::BUILD_PROGRAM_FAILURE));
        assert!(err.build_log().unwrap().contains("expected '}'"));
        assert_eq!(host.live_objects().programs, 0);
    }

    #[test]
    fn test_unreadable_log_is_undefined() {
        let (host, ctx) = setup();
        host.inject_failure(NativeCall::BuildLog, Status::INVALID_VALUE);
        let err = CompiledProgram::build(&ctx, "kernel void k(", "k").unwrap_err();
        assert_eq!(err.build_log(), Some("undefined"));
    }

    #[test]
    fn test_binary_source() {
        let (_host, ctx) = setup();
        let blob = HostRuntime::program_binary(SAXPY.source);
        let program = CompiledProgram::build(&ctx, &blob, SAXPY.entry_point).unwrap();
        assert_eq!(program.entry_point(), SAXPY.entry_point);

        let err = CompiledProgram::build(&ctx, &b"garbage"[..], SAXPY.entry_point).unwrap_err();
        assert_eq!(err.operation(), Some("clCreateProgramWithBinary"));
        assert_eq!(err.status(), Some(Status::INVALID_BINARY));
    }
}
