//! System OpenCL backend.
//!
//! Discovery goes through `opencl3`'s safe wrappers; object lifecycle and
//! command submission use the thin `cl3` functions so that each native call
//! maps to exactly one method of [`ComputeRuntime`].

use super::{
    AccessMode, ArgValue, ComputeRuntime, ContextHandle, DeviceId, DeviceInfo, DeviceKind,
    KernelHandle, MemHandle, PlatformId, ProgramHandle, QueueHandle, StatusResult, COPY_HOST_PTR,
};
use crate::error::Status;
use cl3::types::{
    cl_bool, cl_command_queue, cl_context, cl_device_id, cl_event, cl_kernel, cl_mem,
    cl_platform_id, cl_program,
};
use opencl3::device::Device;
use opencl3::platform::{get_platforms, Platform};
use std::ffi::{c_void, CString};
use std::ptr;
use tracing::debug;

/// The installed OpenCL ICD.
#[derive(Debug, Default, Clone, Copy)]
pub struct OpenClRuntime;

impl OpenClRuntime {
    pub fn new() -> Self {
        Self
    }
}

macro_rules! to_native {
    ($handle:expr, $ty:ty) => {
        $handle.as_raw() as usize as $ty
    };
}

fn handle_of<T>(ptr: *mut T) -> u64 {
    ptr as usize as u64
}

fn status(code: cl3::types::cl_int) -> Status {
    Status(code)
}

fn release_event(event: cl_event) {
    if !event.is_null() {
        // Completion is tracked through flush/finish, not events.
        let _ = unsafe { cl3::event::release_event(event) };
    }
}

impl ComputeRuntime for OpenClRuntime {
    fn backend_name(&self) -> &'static str {
        "opencl"
    }

    fn platform_ids(&self) -> StatusResult<Vec<PlatformId>> {
        let platforms = get_platforms().map_err(|e| Status(e.0))?;
        if platforms.is_empty() {
            return Err(Status::PLATFORM_NOT_FOUND_KHR);
        }
        Ok(platforms
            .iter()
            .map(|p| PlatformId::from_raw(handle_of(p.id())))
            .collect())
    }

    fn platform_name(&self, platform: PlatformId) -> StatusResult<String> {
        Platform::new(to_native!(platform, cl_platform_id))
            .name()
            .map_err(|e| Status(e.0))
    }

    fn device_ids(&self, platform: PlatformId, kind: DeviceKind) -> StatusResult<Vec<DeviceId>> {
        let ids = Platform::new(to_native!(platform, cl_platform_id))
            .get_devices(kind.bits())
            .map_err(|e| Status(e.0))?;
        if ids.is_empty() {
            return Err(Status::DEVICE_NOT_FOUND);
        }
        Ok(ids
            .into_iter()
            .map(|id| DeviceId::from_raw(handle_of(id)))
            .collect())
    }

    fn device_info(&self, device: DeviceId) -> StatusResult<DeviceInfo> {
        let d = Device::new(to_native!(device, cl_device_id));
        let err = |e: opencl3::error_codes::ClError| Status(e.0);
        Ok(DeviceInfo {
            name: d.name().map_err(err)?,
            vendor: d.vendor().map_err(err)?,
            kind: DeviceKind::from_bits(d.dev_type().map_err(err)?),
            max_work_group_size: d.max_work_group_size().map_err(err)?,
            global_mem_size: d.global_mem_size().map_err(err)?,
        })
    }

    fn create_context(&self, devices: &[DeviceId]) -> StatusResult<ContextHandle> {
        let ids: Vec<cl_device_id> = devices
            .iter()
            .map(|d| to_native!(d, cl_device_id))
            .collect();
        let ctx = cl3::context::create_context(&ids, ptr::null(), None, ptr::null_mut())
            .map_err(status)?;
        debug!(devices = ids.len(), "OpenCL context created");
        Ok(ContextHandle::from_raw(handle_of(ctx)))
    }

    fn release_context(&self, context: ContextHandle) -> StatusResult<()> {
        unsafe { cl3::context::release_context(to_native!(context, cl_context)) }.map_err(status)
    }

    fn create_buffer(
        &self,
        context: ContextHandle,
        access: AccessMode,
        size: usize,
        host: Option<&[u8]>,
    ) -> StatusResult<MemHandle> {
        let (flags, host_ptr) = match host {
            Some(bytes) if bytes.len() < size => return Err(Status::INVALID_HOST_PTR),
            // COPY_HOST_PTR reads the slice during the call and never writes it.
            Some(bytes) => (access.bits() | COPY_HOST_PTR, bytes.as_ptr() as *mut c_void),
            None => (access.bits(), ptr::null_mut()),
        };
        let mem = unsafe {
            cl3::memory::create_buffer(to_native!(context, cl_context), flags, size, host_ptr)
        }
        .map_err(status)?;
        Ok(MemHandle::from_raw(handle_of(mem)))
    }

    fn release_buffer(&self, mem: MemHandle) -> StatusResult<()> {
        unsafe { cl3::memory::release_mem_object(to_native!(mem, cl_mem)) }.map_err(status)
    }

    fn create_program_with_source(
        &self,
        context: ContextHandle,
        source: &str,
    ) -> StatusResult<ProgramHandle> {
        let program =
            cl3::program::create_program_with_source(to_native!(context, cl_context), &[source])
                .map_err(status)?;
        Ok(ProgramHandle::from_raw(handle_of(program)))
    }

    fn create_program_with_binary(
        &self,
        context: ContextHandle,
        device: DeviceId,
        binary: &[u8],
    ) -> StatusResult<ProgramHandle> {
        let devices = [to_native!(device, cl_device_id)];
        let program = unsafe {
            cl3::program::create_program_with_binary(
                to_native!(context, cl_context),
                &devices,
                &[binary],
            )
        }
        .map_err(status)?;
        Ok(ProgramHandle::from_raw(handle_of(program)))
    }

    fn build_program(
        &self,
        program: ProgramHandle,
        device: DeviceId,
        options: &str,
    ) -> StatusResult<()> {
        let options = CString::new(options).map_err(|_| Status::INVALID_BUILD_OPTIONS)?;
        let devices = [to_native!(device, cl_device_id)];
        cl3::program::build_program(
            to_native!(program, cl_program),
            &devices,
            &options,
            None,
            ptr::null_mut(),
        )
        .map_err(status)
    }

    fn program_build_log(
        &self,
        program: ProgramHandle,
        device: DeviceId,
        scratch: &mut [u8],
    ) -> StatusResult<usize> {
        let info = cl3::program::get_program_build_info(
            to_native!(program, cl_program),
            to_native!(device, cl_device_id),
            cl3::program::CL_PROGRAM_BUILD_LOG,
        )
        .map_err(status)?;
        let bytes = Vec::<u8>::from(info);
        let n = bytes.len().min(scratch.len());
        scratch[..n].copy_from_slice(&bytes[..n]);
        Ok(bytes.len())
    }

    fn release_program(&self, program: ProgramHandle) -> StatusResult<()> {
        unsafe { cl3::program::release_program(to_native!(program, cl_program)) }.map_err(status)
    }

    fn create_kernel(&self, program: ProgramHandle, name: &str) -> StatusResult<KernelHandle> {
        let name = CString::new(name).map_err(|_| Status::INVALID_KERNEL_NAME)?;
        let kernel = cl3::kernel::create_kernel(to_native!(program, cl_program), &name)
            .map_err(status)?;
        Ok(KernelHandle::from_raw(handle_of(kernel)))
    }

    fn set_kernel_arg(
        &self,
        kernel: KernelHandle,
        index: u32,
        value: ArgValue<'_>,
    ) -> StatusResult<()> {
        let kernel = to_native!(kernel, cl_kernel);
        match value {
            ArgValue::Bytes(bytes) => unsafe {
                cl3::kernel::set_kernel_arg(
                    kernel,
                    index,
                    bytes.len(),
                    bytes.as_ptr() as *const c_void,
                )
            },
            ArgValue::Mem(mem) => {
                let mem = to_native!(mem, cl_mem);
                unsafe {
                    cl3::kernel::set_kernel_arg(
                        kernel,
                        index,
                        std::mem::size_of::<cl_mem>(),
                        &mem as *const cl_mem as *const c_void,
                    )
                }
            }
        }
        .map_err(status)
    }

    fn release_kernel(&self, kernel: KernelHandle) -> StatusResult<()> {
        unsafe { cl3::kernel::release_kernel(to_native!(kernel, cl_kernel)) }.map_err(status)
    }

    fn create_queue(&self, context: ContextHandle, device: DeviceId) -> StatusResult<QueueHandle> {
        let queue = unsafe {
            cl3::command_queue::create_command_queue_with_properties(
                to_native!(context, cl_context),
                to_native!(device, cl_device_id),
                ptr::null(),
            )
        }
        .map_err(status)?;
        Ok(QueueHandle::from_raw(handle_of(queue)))
    }

    fn release_queue(&self, queue: QueueHandle) -> StatusResult<()> {
        unsafe { cl3::command_queue::release_command_queue(to_native!(queue, cl_command_queue)) }
            .map_err(status)
    }

    unsafe fn enqueue_write(
        &self,
        queue: QueueHandle,
        mem: MemHandle,
        blocking: bool,
        offset: usize,
        src: *const u8,
        len: usize,
    ) -> StatusResult<()> {
        let event = cl3::command_queue::enqueue_write_buffer(
            to_native!(queue, cl_command_queue),
            to_native!(mem, cl_mem),
            blocking as cl_bool,
            offset,
            len,
            src as *const c_void,
            0,
            ptr::null(),
        )
        .map_err(status)?;
        release_event(event);
        Ok(())
    }

    unsafe fn enqueue_read(
        &self,
        queue: QueueHandle,
        mem: MemHandle,
        blocking: bool,
        offset: usize,
        dst: *mut u8,
        len: usize,
    ) -> StatusResult<()> {
        let event = cl3::command_queue::enqueue_read_buffer(
            to_native!(queue, cl_command_queue),
            to_native!(mem, cl_mem),
            blocking as cl_bool,
            offset,
            len,
            dst as *mut c_void,
            0,
            ptr::null(),
        )
        .map_err(status)?;
        release_event(event);
        Ok(())
    }

    fn enqueue_kernel(
        &self,
        queue: QueueHandle,
        kernel: KernelHandle,
        global_work_size: usize,
        local_work_size: Option<usize>,
    ) -> StatusResult<()> {
        let global = [global_work_size];
        let local = local_work_size.map(|l| [l]);
        let local_ptr = local.as_ref().map_or(ptr::null(), |l| l.as_ptr());
        let event = unsafe {
            cl3::command_queue::enqueue_nd_range_kernel(
                to_native!(queue, cl_command_queue),
                to_native!(kernel, cl_kernel),
                1,
                ptr::null(),
                global.as_ptr(),
                local_ptr,
                0,
                ptr::null(),
            )
        }
        .map_err(status)?;
        release_event(event);
        Ok(())
    }

    fn flush(&self, queue: QueueHandle) -> StatusResult<()> {
        cl3::command_queue::flush(to_native!(queue, cl_command_queue)).map_err(status)
    }

    fn finish(&self, queue: QueueHandle) -> StatusResult<()> {
        cl3::command_queue::finish(to_native!(queue, cl_command_queue)).map_err(status)
    }
}
