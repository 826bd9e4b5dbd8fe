//! The native runtime seam.
//!
//! Every call that touches the accelerator runtime goes through
//! [`ComputeRuntime`]. Methods mirror the native API one-to-one and return the
//! raw [`Status`] on failure; translating that status into a typed
//! [`Error`](crate::Error) is the job of the owning wrapper at the call site.
//!
//! Two backends exist:
//!
//! - [`HostRuntime`]: an in-process emulator that executes registered Rust
//!   implementations of kernel entry points and counts every live object.
//! - `OpenClRuntime` (feature `opencl`): the system OpenCL ICD.

pub mod host;

#[cfg(feature = "opencl")]
pub mod opencl;

pub use host::{HostDevice, HostKernelFn, HostRuntime, HostRuntimeBuilder, LiveObjects, NativeCall, WorkItem};

#[cfg(feature = "opencl")]
pub use opencl::OpenClRuntime;

use crate::error::Status;
use std::fmt;

/// Result of a single native call.
pub type StatusResult<T> = std::result::Result<T, Status>;

macro_rules! native_handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub struct $name(u64);

        impl $name {
            #[inline]
            pub fn from_raw(raw: u64) -> Self {
                Self(raw)
            }

            #[inline]
            pub fn as_raw(self) -> u64 {
                self.0
            }
        }
    };
}

native_handle!(
    /// Vendor runtime instance. Never released.
    PlatformId
);
native_handle!(
    /// One compute unit of a platform. Never released.
    DeviceId
);
native_handle!(ContextHandle);
native_handle!(MemHandle);
native_handle!(ProgramHandle);
native_handle!(KernelHandle);
native_handle!(QueueHandle);

/// Device type filter used during discovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DeviceKind {
    /// The platform's default device type.
    #[default]
    Default,
    Cpu,
    Gpu,
    Accelerator,
    /// Any device type.
    All,
}

impl DeviceKind {
    /// Native `cl_device_type` bitfield.
    pub fn bits(self) -> u64 {
        match self {
            DeviceKind::Default => 1 << 0,
            DeviceKind::Cpu => 1 << 1,
            DeviceKind::Gpu => 1 << 2,
            DeviceKind::Accelerator => 1 << 3,
            DeviceKind::All => 0xFFFF_FFFF,
        }
    }

    /// Concrete kind from a native bitfield; `All` if no single bit matches.
    pub fn from_bits(bits: u64) -> Self {
        if bits & (1 << 2) != 0 {
            DeviceKind::Gpu
        } else if bits & (1 << 1) != 0 {
            DeviceKind::Cpu
        } else if bits & (1 << 3) != 0 {
            DeviceKind::Accelerator
        } else {
            DeviceKind::All
        }
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DeviceKind::Default => "default",
            DeviceKind::Cpu => "CPU",
            DeviceKind::Gpu => "GPU",
            DeviceKind::Accelerator => "accelerator",
            DeviceKind::All => "any",
        })
    }
}

/// Allowed kernel access to a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum AccessMode {
    ReadOnly,
    WriteOnly,
    #[default]
    ReadWrite,
}

impl AccessMode {
    /// Native `cl_mem_flags` bits for this mode.
    pub fn bits(self) -> u64 {
        match self {
            AccessMode::ReadWrite => 1 << 0,
            AccessMode::WriteOnly => 1 << 1,
            AccessMode::ReadOnly => 1 << 2,
        }
    }

    #[inline]
    pub fn kernel_can_write(self) -> bool {
        self != AccessMode::ReadOnly
    }
}

/// Flag added to [`AccessMode::bits`] when the allocation is seeded from host memory.
pub const COPY_HOST_PTR: u64 = 1 << 5;

/// Properties of one device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub name: String,
    pub vendor: String,
    pub kind: DeviceKind,
    pub max_work_group_size: usize,
    pub global_mem_size: u64,
}

/// A kernel argument as the native call sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgValue<'a> {
    /// Raw bytes of a by-value argument; the size is the slice length.
    Bytes(&'a [u8]),
    /// A memory object handle.
    Mem(MemHandle),
}

/// Native accelerator runtime.
///
/// Implementations must be internally synchronized; the wrappers above this
/// seam are not.
pub trait ComputeRuntime: Send + Sync {
    /// Short backend identifier used in logs.
    fn backend_name(&self) -> &'static str;

    fn platform_ids(&self) -> StatusResult<Vec<PlatformId>>;
    fn platform_name(&self, platform: PlatformId) -> StatusResult<String>;
    fn device_ids(&self, platform: PlatformId, kind: DeviceKind) -> StatusResult<Vec<DeviceId>>;
    fn device_info(&self, device: DeviceId) -> StatusResult<DeviceInfo>;

    fn create_context(&self, devices: &[DeviceId]) -> StatusResult<ContextHandle>;
    fn release_context(&self, context: ContextHandle) -> StatusResult<()>;

    /// Allocates `size` bytes. When `host` is given the allocation is seeded
    /// from it; the slice is not retained.
    fn create_buffer(
        &self,
        context: ContextHandle,
        access: AccessMode,
        size: usize,
        host: Option<&[u8]>,
    ) -> StatusResult<MemHandle>;
    fn release_buffer(&self, mem: MemHandle) -> StatusResult<()>;

    fn create_program_with_source(
        &self,
        context: ContextHandle,
        source: &str,
    ) -> StatusResult<ProgramHandle>;
    fn create_program_with_binary(
        &self,
        context: ContextHandle,
        device: DeviceId,
        binary: &[u8],
    ) -> StatusResult<ProgramHandle>;
    fn build_program(
        &self,
        program: ProgramHandle,
        device: DeviceId,
        options: &str,
    ) -> StatusResult<()>;
    /// Copies up to `scratch.len()` bytes of the build log into `scratch` and
    /// returns the full reported length.
    fn program_build_log(
        &self,
        program: ProgramHandle,
        device: DeviceId,
        scratch: &mut [u8],
    ) -> StatusResult<usize>;
    fn release_program(&self, program: ProgramHandle) -> StatusResult<()>;

    fn create_kernel(&self, program: ProgramHandle, name: &str) -> StatusResult<KernelHandle>;
    fn set_kernel_arg(&self, kernel: KernelHandle, index: u32, value: ArgValue<'_>)
        -> StatusResult<()>;
    fn release_kernel(&self, kernel: KernelHandle) -> StatusResult<()>;

    fn create_queue(&self, context: ContextHandle, device: DeviceId) -> StatusResult<QueueHandle>;
    fn release_queue(&self, queue: QueueHandle) -> StatusResult<()>;

    /// Enqueues a host-to-device copy of `len` bytes.
    ///
    /// # Safety
    ///
    /// `src` must be valid for `len` bytes until the call returns when
    /// `blocking`, or until the queue has finished otherwise.
    unsafe fn enqueue_write(
        &self,
        queue: QueueHandle,
        mem: MemHandle,
        blocking: bool,
        offset: usize,
        src: *const u8,
        len: usize,
    ) -> StatusResult<()>;

    /// Enqueues a device-to-host copy of `len` bytes.
    ///
    /// # Safety
    ///
    /// `dst` must be valid for writes of `len` bytes, and not otherwise
    /// accessed, until the call returns when `blocking`, or until the queue has
    /// finished otherwise.
    unsafe fn enqueue_read(
        &self,
        queue: QueueHandle,
        mem: MemHandle,
        blocking: bool,
        offset: usize,
        dst: *mut u8,
        len: usize,
    ) -> StatusResult<()>;

    /// Enqueues a 1-D launch. Arguments are captured at enqueue time.
    fn enqueue_kernel(
        &self,
        queue: QueueHandle,
        kernel: KernelHandle,
        global_work_size: usize,
        local_work_size: Option<usize>,
    ) -> StatusResult<()>;

    fn flush(&self, queue: QueueHandle) -> StatusResult<()>;
    fn finish(&self, queue: QueueHandle) -> StatusResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_kind_bits_round_trip_for_concrete_kinds() {
        for kind in [DeviceKind::Cpu, DeviceKind::Gpu, DeviceKind::Accelerator] {
            assert_eq!(DeviceKind::from_bits(kind.bits()), kind);
        }
        assert_eq!(DeviceKind::from_bits(0), DeviceKind::All);
    }

    #[test]
    fn test_access_mode_flags() {
        assert_eq!(AccessMode::default(), AccessMode::ReadWrite);
        assert!(!AccessMode::ReadOnly.kernel_can_write());
        assert!(AccessMode::WriteOnly.kernel_can_write());
        assert_eq!(AccessMode::ReadOnly.bits() | COPY_HOST_PTR, 0b100100);
    }

    #[test]
    fn test_handles_are_opaque_raw_values() {
        let mem = MemHandle::from_raw(0xdead_beef);
        assert_eq!(mem.as_raw(), 0xdead_beef);
    }
}
