//! In-process emulation of an accelerator runtime.
//!
//! The emulator keeps every native object in a table, so tests can assert
//! that nothing leaks and that teardown happens in reverse creation order.
//! Kernel source is parsed for `__kernel void name(...)` declarations; each
//! declared entry point must have a Rust body registered with
//! [`HostRuntime::register_kernel`]. Commands are queued per command queue and
//! executed in submission order on `finish` or on any blocking transfer.

use super::{
    AccessMode, ArgValue, ComputeRuntime, ContextHandle, DeviceId, DeviceInfo, DeviceKind,
    KernelHandle, MemHandle, PlatformId, ProgramHandle, QueueHandle, StatusResult,
};
use crate::error::Status;
use bytemuck::Pod;
use parking_lot::{Mutex, MutexGuard, RwLock};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, trace, warn};

/// Body of one emulated kernel, invoked once per work-item.
pub type HostKernelFn = dyn Fn(&mut WorkItem<'_>) + Send + Sync;

const BINARY_MAGIC: &[u8; 8] = b"VCLHBIN\0";

/// An emulated device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostDevice {
    pub name: String,
    pub vendor: String,
    pub kind: DeviceKind,
    pub max_work_group_size: usize,
    pub global_mem_size: u64,
}

impl HostDevice {
    pub fn new(name: impl Into<String>, kind: DeviceKind) -> Self {
        Self {
            name: name.into(),
            vendor: "veda".to_string(),
            kind,
            max_work_group_size: 256,
            global_mem_size: 1 << 30,
        }
    }

    pub fn with_max_work_group_size(mut self, size: usize) -> Self {
        self.max_work_group_size = size;
        self
    }

    pub fn with_global_mem_size(mut self, bytes: u64) -> Self {
        self.global_mem_size = bytes;
        self
    }
}

#[derive(Debug, Clone)]
struct HostPlatform {
    name: String,
    devices: Vec<HostDevice>,
}

/// Native entry points of the emulator, used for call counting and failure injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NativeCall {
    PlatformIds,
    DeviceIds,
    DeviceInfo,
    CreateContext,
    ReleaseContext,
    CreateBuffer,
    ReleaseBuffer,
    CreateProgram,
    BuildProgram,
    BuildLog,
    ReleaseProgram,
    CreateKernel,
    SetKernelArg,
    ReleaseKernel,
    CreateQueue,
    ReleaseQueue,
    EnqueueWrite,
    EnqueueRead,
    EnqueueKernel,
    Flush,
    Finish,
}

/// Count of native objects currently alive.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LiveObjects {
    pub contexts: usize,
    pub buffers: usize,
    pub programs: usize,
    pub kernels: usize,
    pub queues: usize,
}

impl LiveObjects {
    pub fn total(&self) -> usize {
        self.contexts + self.buffers + self.programs + self.kernels + self.queues
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParamKind {
    Buffer,
    /// By-value parameter; `None` when the type size is unknown.
    Scalar(Option<usize>),
}

#[derive(Debug, Clone)]
struct KernelDecl {
    name: String,
    params: Vec<ParamKind>,
}

#[derive(Debug, Clone)]
enum BoundArg {
    Bytes(Vec<u8>),
    Mem(u64),
}

struct ContextObject {
    devices: Vec<DeviceId>,
}

struct MemObject {
    context: u64,
    access: AccessMode,
    data: Vec<u8>,
}

struct ProgramObject {
    context: u64,
    source: String,
    built: bool,
    log: String,
    decls: Vec<KernelDecl>,
    kernels: usize,
}

struct KernelObject {
    program: u64,
    context: u64,
    decl: KernelDecl,
    body: Arc<HostKernelFn>,
    args: Vec<Option<BoundArg>>,
}

struct QueueObject {
    context: u64,
    device: DeviceId,
    pending: VecDeque<Command>,
}

struct HostPtr(*const u8);
struct HostPtrMut(*mut u8);

// SAFETY: the pointers are only dereferenced while executing the queue, and
// the enqueue contract keeps them valid until the queue has finished.
unsafe impl Send for HostPtr {}
unsafe impl Send for HostPtrMut {}

enum Command {
    Write {
        mem: u64,
        offset: usize,
        src: HostPtr,
        len: usize,
    },
    Read {
        mem: u64,
        offset: usize,
        dst: HostPtrMut,
        len: usize,
    },
    Launch {
        name: String,
        body: Arc<HostKernelFn>,
        args: Vec<BoundArg>,
        global: usize,
        local: usize,
    },
}

#[derive(Default)]
struct HostState {
    next_handle: u64,
    contexts: HashMap<u64, ContextObject>,
    buffers: HashMap<u64, MemObject>,
    programs: HashMap<u64, ProgramObject>,
    kernels: HashMap<u64, KernelObject>,
    queues: HashMap<u64, QueueObject>,
    faults: HashMap<NativeCall, VecDeque<Status>>,
    calls: HashMap<NativeCall, usize>,
    teardown_violations: usize,
}

impl HostState {
    fn next_handle(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }
}

/// Builder for a [`HostRuntime`] with a custom platform/device layout.
#[derive(Debug, Default)]
pub struct HostRuntimeBuilder {
    platforms: Vec<HostPlatform>,
}

impl HostRuntimeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a new platform; following devices attach to it.
    pub fn platform(mut self, name: impl Into<String>) -> Self {
        self.platforms.push(HostPlatform {
            name: name.into(),
            devices: Vec::new(),
        });
        self
    }

    /// Adds a device to the most recent platform, creating one if needed.
    pub fn device(mut self, device: HostDevice) -> Self {
        if self.platforms.is_empty() {
            self = self.platform("Veda Host Platform");
        }
        if let Some(platform) = self.platforms.last_mut() {
            platform.devices.push(device);
        }
        self
    }

    pub fn build(self) -> HostRuntime {
        HostRuntime {
            platforms: self.platforms,
            registry: RwLock::new(HashMap::new()),
            state: Mutex::new(HostState::default()),
        }
    }
}

/// Resource-counting emulator of a native compute runtime.
pub struct HostRuntime {
    platforms: Vec<HostPlatform>,
    registry: RwLock<HashMap<String, Arc<HostKernelFn>>>,
    state: Mutex<HostState>,
}

impl fmt::Debug for HostRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostRuntime")
            .field("platforms", &self.platforms.len())
            .field("kernels", &self.registry.read().len())
            .field("live", &self.live_objects())
            .finish()
    }
}

impl Default for HostRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl HostRuntime {
    /// One platform exposing an emulated GPU (the default device) and CPU.
    pub fn new() -> Self {
        Self::builder()
            .platform("Veda Host Platform")
            .device(HostDevice::new("veda-host-gpu", DeviceKind::Gpu))
            .device(HostDevice::new("veda-host-cpu", DeviceKind::Cpu).with_max_work_group_size(1024))
            .build()
    }

    /// A runtime with no platforms installed.
    pub fn empty() -> Self {
        Self::builder().build()
    }

    pub fn builder() -> HostRuntimeBuilder {
        HostRuntimeBuilder::new()
    }

    /// Registers the Rust body executed for kernel entry point `name`.
    pub fn register_kernel<F>(&self, name: impl Into<String>, body: F)
    where
        F: Fn(&mut WorkItem<'_>) + Send + Sync + 'static,
    {
        self.registry.write().insert(name.into(), Arc::new(body));
    }

    /// Wraps kernel source as a binary blob accepted by `create_program_with_binary`.
    pub fn program_binary(source: &str) -> Vec<u8> {
        let mut blob = BINARY_MAGIC.to_vec();
        blob.extend_from_slice(source.as_bytes());
        blob
    }

    /// Makes the next invocation of `call` fail with `status`. Failures queue up.
    pub fn inject_failure(&self, call: NativeCall, status: Status) {
        self.state
            .lock()
            .faults
            .entry(call)
            .or_default()
            .push_back(status);
    }

    pub fn clear_failures(&self) {
        self.state.lock().faults.clear();
    }

    pub fn call_count(&self, call: NativeCall) -> usize {
        self.state.lock().calls.get(&call).copied().unwrap_or(0)
    }

    pub fn live_objects(&self) -> LiveObjects {
        let state = self.state.lock();
        LiveObjects {
            contexts: state.contexts.len(),
            buffers: state.buffers.len(),
            programs: state.programs.len(),
            kernels: state.kernels.len(),
            queues: state.queues.len(),
        }
    }

    /// Number of releases rejected because dependents were still alive.
    pub fn teardown_violations(&self) -> usize {
        self.state.lock().teardown_violations
    }

    /// Current device-side bytes of a buffer.
    pub fn mem_contents(&self, mem: MemHandle) -> Option<Vec<u8>> {
        self.state
            .lock()
            .buffers
            .get(&mem.as_raw())
            .map(|m| m.data.clone())
    }

    fn enter(&self, call: NativeCall) -> StatusResult<MutexGuard<'_, HostState>> {
        let mut state = self.state.lock();
        *state.calls.entry(call).or_insert(0) += 1;
        if let Some(status) = state.faults.get_mut(&call).and_then(|q| q.pop_front()) {
            trace!(?call, %status, "injected failure");
            return Err(status);
        }
        Ok(state)
    }

    fn lookup_platform(&self, platform: PlatformId) -> Option<&HostPlatform> {
        let index = platform.as_raw().checked_sub(1)? as usize;
        self.platforms.get(index)
    }

    fn lookup_device(&self, device: DeviceId) -> Option<&HostDevice> {
        let raw = device.as_raw();
        let platform = (raw >> 32).checked_sub(1)? as usize;
        let index = (raw & 0xFFFF_FFFF).checked_sub(1)? as usize;
        self.platforms.get(platform)?.devices.get(index)
    }

    fn device_id(platform: usize, index: usize) -> DeviceId {
        DeviceId::from_raw(((platform as u64 + 1) << 32) | (index as u64 + 1))
    }

    fn context_has_device(state: &HostState, context: u64, device: DeviceId) -> StatusResult<()> {
        let ctx = state.contexts.get(&context).ok_or(Status::INVALID_CONTEXT)?;
        if ctx.devices.contains(&device) {
            Ok(())
        } else {
            Err(Status::INVALID_DEVICE)
        }
    }
}

/// Runs every queued command in order. Stops at the first fault and drops the rest.
fn execute_pending(state: &mut HostState, queue: u64) -> StatusResult<()> {
    let commands = match state.queues.get_mut(&queue) {
        Some(q) => std::mem::take(&mut q.pending),
        None => return Err(Status::INVALID_COMMAND_QUEUE),
    };
    for command in commands {
        execute(&mut state.buffers, command)?;
    }
    Ok(())
}

fn execute(buffers: &mut HashMap<u64, MemObject>, command: Command) -> StatusResult<()> {
    match command {
        Command::Write {
            mem,
            offset,
            src,
            len,
        } => {
            let obj = buffers.get_mut(&mem).ok_or(Status::INVALID_MEM_OBJECT)?;
            let dst = obj
                .data
                .get_mut(offset..offset + len)
                .ok_or(Status::INVALID_VALUE)?;
            // SAFETY: the enqueue contract keeps `src` valid for `len` bytes
            // until the queue has finished.
            let src = unsafe { std::slice::from_raw_parts(src.0, len) };
            dst.copy_from_slice(src);
            Ok(())
        }
        Command::Read {
            mem,
            offset,
            dst,
            len,
        } => {
            let obj = buffers.get(&mem).ok_or(Status::INVALID_MEM_OBJECT)?;
            let src = obj
                .data
                .get(offset..offset + len)
                .ok_or(Status::INVALID_VALUE)?;
            // SAFETY: the enqueue contract keeps `dst` valid and unaliased
            // for `len` bytes until the queue has finished.
            let dst = unsafe { std::slice::from_raw_parts_mut(dst.0, len) };
            dst.copy_from_slice(src);
            Ok(())
        }
        Command::Launch {
            name,
            body,
            args,
            global,
            local,
        } => {
            for arg in &args {
                if let BoundArg::Mem(mem) = arg {
                    if !buffers.contains_key(mem) {
                        return Err(Status::INVALID_MEM_OBJECT);
                    }
                }
            }
            let mut item = WorkItem {
                global_id: 0,
                global_size: global,
                local_size: local,
                args: &args,
                memory: buffers,
                fault: None,
            };
            for gid in 0..global {
                item.global_id = gid;
                body(&mut item);
                if let Some(status) = item.fault {
                    warn!(kernel = %name, global_id = gid, %status, "kernel faulted");
                    return Err(status);
                }
            }
            trace!(kernel = %name, global, local, "kernel executed");
            Ok(())
        }
    }
}

/// View of one work-item's arguments while an emulated kernel runs.
///
/// Out-of-range accesses, writes to read-only buffers and mismatched
/// argument types do not panic; they mark the launch as faulted and the
/// failure is reported by the queue's next finish.
pub struct WorkItem<'a> {
    global_id: usize,
    global_size: usize,
    local_size: usize,
    args: &'a [BoundArg],
    memory: &'a mut HashMap<u64, MemObject>,
    fault: Option<Status>,
}

impl fmt::Debug for WorkItem<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkItem")
            .field("global_id", &self.global_id)
            .field("global_size", &self.global_size)
            .field("local_size", &self.local_size)
            .field("fault", &self.fault)
            .finish()
    }
}

impl WorkItem<'_> {
    #[inline]
    pub fn global_id(&self) -> usize {
        self.global_id
    }

    #[inline]
    pub fn global_size(&self) -> usize {
        self.global_size
    }

    #[inline]
    pub fn local_size(&self) -> usize {
        self.local_size
    }

    #[inline]
    pub fn local_id(&self) -> usize {
        self.global_id % self.local_size
    }

    #[inline]
    pub fn group_id(&self) -> usize {
        self.global_id / self.local_size
    }

    /// By-value argument at `index`.
    pub fn scalar<T: Pod>(&mut self, index: usize) -> T {
        match self.args.get(index) {
            Some(BoundArg::Bytes(bytes)) if bytes.len() == std::mem::size_of::<T>() => {
                bytemuck::pod_read_unaligned(bytes)
            }
            _ => {
                self.fail(Status::INVALID_ARG_VALUE);
                T::zeroed()
            }
        }
    }

    /// Number of `T` elements in the buffer bound at `index`.
    pub fn len<T: Pod>(&mut self, index: usize) -> usize {
        match self.mem(index) {
            Some(obj) => obj.data.len() / std::mem::size_of::<T>().max(1),
            None => {
                self.fail(Status::INVALID_ARG_VALUE);
                0
            }
        }
    }

    /// Reads element `element` of the buffer bound at `index`.
    pub fn load<T: Pod>(&mut self, index: usize, element: usize) -> T {
        let size = std::mem::size_of::<T>();
        let value = self.mem(index).and_then(|obj| {
            let start = element.checked_mul(size)?;
            obj.data.get(start..start + size).map(bytemuck::pod_read_unaligned)
        });
        match value {
            Some(v) => v,
            None => {
                self.fail(Status::OUT_OF_RESOURCES);
                T::zeroed()
            }
        }
    }

    /// Writes element `element` of the buffer bound at `index`.
    pub fn store<T: Pod>(&mut self, index: usize, element: usize, value: T) {
        let size = std::mem::size_of::<T>();
        let mem = match self.args.get(index) {
            Some(BoundArg::Mem(mem)) => *mem,
            _ => return self.fail(Status::INVALID_ARG_VALUE),
        };
        let status = match self.memory.get_mut(&mem) {
            None => Some(Status::INVALID_MEM_OBJECT),
            Some(obj) if !obj.access.kernel_can_write() => Some(Status::INVALID_OPERATION),
            Some(obj) => {
                let slot = element
                    .checked_mul(size)
                    .and_then(|start| obj.data.get_mut(start..start + size));
                match slot {
                    Some(slot) => {
                        slot.copy_from_slice(bytemuck::bytes_of(&value));
                        None
                    }
                    None => Some(Status::OUT_OF_RESOURCES),
                }
            }
        };
        if let Some(status) = status {
            self.fail(status);
        }
    }

    fn mem(&self, index: usize) -> Option<&MemObject> {
        match self.args.get(index) {
            Some(BoundArg::Mem(mem)) => self.memory.get(mem),
            _ => None,
        }
    }

    fn fail(&mut self, status: Status) {
        if self.fault.is_none() {
            self.fault = Some(status);
        }
    }
}

impl ComputeRuntime for HostRuntime {
    fn backend_name(&self) -> &'static str {
        "host"
    }

    fn platform_ids(&self) -> StatusResult<Vec<PlatformId>> {
        let _state = self.enter(NativeCall::PlatformIds)?;
        if self.platforms.is_empty() {
            return Err(Status::PLATFORM_NOT_FOUND_KHR);
        }
        Ok((0..self.platforms.len())
            .map(|i| PlatformId::from_raw(i as u64 + 1))
            .collect())
    }

    fn platform_name(&self, platform: PlatformId) -> StatusResult<String> {
        self.lookup_platform(platform)
            .map(|p| p.name.clone())
            .ok_or(Status::INVALID_PLATFORM)
    }

    fn device_ids(&self, platform: PlatformId, kind: DeviceKind) -> StatusResult<Vec<DeviceId>> {
        let _state = self.enter(NativeCall::DeviceIds)?;
        let index = (platform.as_raw() as usize)
            .checked_sub(1)
            .ok_or(Status::INVALID_PLATFORM)?;
        let host = self.platforms.get(index).ok_or(Status::INVALID_PLATFORM)?;
        let ids: Vec<DeviceId> = host
            .devices
            .iter()
            .enumerate()
            .filter(|(i, d)| match kind {
                DeviceKind::All => true,
                DeviceKind::Default => *i == 0,
                other => d.kind == other,
            })
            .map(|(i, _)| Self::device_id(index, i))
            .collect();
        if ids.is_empty() {
            return Err(Status::DEVICE_NOT_FOUND);
        }
        Ok(ids)
    }

    fn device_info(&self, device: DeviceId) -> StatusResult<DeviceInfo> {
        let _state = self.enter(NativeCall::DeviceInfo)?;
        let d = self.lookup_device(device).ok_or(Status::INVALID_DEVICE)?;
        Ok(DeviceInfo {
            name: d.name.clone(),
            vendor: d.vendor.clone(),
            kind: d.kind,
            max_work_group_size: d.max_work_group_size,
            global_mem_size: d.global_mem_size,
        })
    }

    fn create_context(&self, devices: &[DeviceId]) -> StatusResult<ContextHandle> {
        let mut state = self.enter(NativeCall::CreateContext)?;
        if devices.is_empty() {
            return Err(Status::INVALID_VALUE);
        }
        if devices.iter().any(|d| self.lookup_device(*d).is_none()) {
            return Err(Status::INVALID_DEVICE);
        }
        let handle = state.next_handle();
        state.contexts.insert(
            handle,
            ContextObject {
                devices: devices.to_vec(),
            },
        );
        debug!(context = handle, devices = devices.len(), "host context created");
        Ok(ContextHandle::from_raw(handle))
    }

    fn release_context(&self, context: ContextHandle) -> StatusResult<()> {
        let mut state = self.enter(NativeCall::ReleaseContext)?;
        let raw = context.as_raw();
        if !state.contexts.contains_key(&raw) {
            return Err(Status::INVALID_CONTEXT);
        }
        let dependents = state.buffers.values().filter(|b| b.context == raw).count()
            + state.programs.values().filter(|p| p.context == raw).count()
            + state.queues.values().filter(|q| q.context == raw).count();
        if dependents > 0 {
            state.teardown_violations += 1;
            error!(context = raw, dependents, "context released before its dependents");
            return Err(Status::INVALID_OPERATION);
        }
        state.contexts.remove(&raw);
        debug!(context = raw, "host context released");
        Ok(())
    }

    fn create_buffer(
        &self,
        context: ContextHandle,
        access: AccessMode,
        size: usize,
        host: Option<&[u8]>,
    ) -> StatusResult<MemHandle> {
        let mut state = self.enter(NativeCall::CreateBuffer)?;
        let ctx = state
            .contexts
            .get(&context.as_raw())
            .ok_or(Status::INVALID_CONTEXT)?;
        let limit = ctx
            .devices
            .iter()
            .filter_map(|d| self.lookup_device(*d))
            .map(|d| d.global_mem_size)
            .min()
            .unwrap_or(0);
        if size == 0 || size as u64 > limit {
            return Err(Status::INVALID_BUFFER_SIZE);
        }
        let data = match host {
            Some(bytes) if bytes.len() < size => return Err(Status::INVALID_HOST_PTR),
            Some(bytes) => bytes[..size].to_vec(),
            None => vec![0u8; size],
        };
        let handle = state.next_handle();
        state.buffers.insert(
            handle,
            MemObject {
                context: context.as_raw(),
                access,
                data,
            },
        );
        debug!(mem = handle, bytes = size, ?access, seeded = host.is_some(), "host buffer created");
        Ok(MemHandle::from_raw(handle))
    }

    fn release_buffer(&self, mem: MemHandle) -> StatusResult<()> {
        let mut state = self.enter(NativeCall::ReleaseBuffer)?;
        state
            .buffers
            .remove(&mem.as_raw())
            .map(|_| ())
            .ok_or(Status::INVALID_MEM_OBJECT)
    }

    fn create_program_with_source(
        &self,
        context: ContextHandle,
        source: &str,
    ) -> StatusResult<ProgramHandle> {
        let mut state = self.enter(NativeCall::CreateProgram)?;
        if !state.contexts.contains_key(&context.as_raw()) {
            return Err(Status::INVALID_CONTEXT);
        }
        if source.trim().is_empty() {
            return Err(Status::INVALID_VALUE);
        }
        let handle = state.next_handle();
        state.programs.insert(
            handle,
            ProgramObject {
                context: context.as_raw(),
                source: source.to_string(),
                built: false,
                log: String::new(),
                decls: Vec::new(),
                kernels: 0,
            },
        );
        Ok(ProgramHandle::from_raw(handle))
    }

    fn create_program_with_binary(
        &self,
        context: ContextHandle,
        device: DeviceId,
        binary: &[u8],
    ) -> StatusResult<ProgramHandle> {
        let mut state = self.enter(NativeCall::CreateProgram)?;
        Self::context_has_device(&state, context.as_raw(), device)?;
        let body = binary
            .strip_prefix(BINARY_MAGIC.as_slice())
            .ok_or(Status::INVALID_BINARY)?;
        let source = std::str::from_utf8(body).map_err(|_| Status::INVALID_BINARY)?;
        let handle = state.next_handle();
        state.programs.insert(
            handle,
            ProgramObject {
                context: context.as_raw(),
                source: source.to_string(),
                built: false,
                log: String::new(),
                decls: Vec::new(),
                kernels: 0,
            },
        );
        Ok(ProgramHandle::from_raw(handle))
    }

    fn build_program(
        &self,
        program: ProgramHandle,
        device: DeviceId,
        options: &str,
    ) -> StatusResult<()> {
        let mut state = self.enter(NativeCall::BuildProgram)?;
        let context = state
            .programs
            .get(&program.as_raw())
            .ok_or(Status::INVALID_PROGRAM)?
            .context;
        Self::context_has_device(&state, context, device)?;
        if options.split_whitespace().any(|opt| !opt.starts_with('-')) {
            return Err(Status::INVALID_BUILD_OPTIONS);
        }
        let registry = self.registry.read();
        let obj = state
            .programs
            .get_mut(&program.as_raw())
            .ok_or(Status::INVALID_PROGRAM)?;
        if obj.kernels > 0 {
            return Err(Status::INVALID_OPERATION);
        }
        match compile(&obj.source, &registry) {
            Ok(decls) => {
                debug!(program = program.as_raw(), kernels = decls.len(), "host program built");
                obj.decls = decls;
                obj.built = true;
                obj.log.clear();
                Ok(())
            }
            Err(log) => {
                obj.decls.clear();
                obj.built = false;
                obj.log = log;
                Err(Status::BUILD_PROGRAM_FAILURE)
            }
        }
    }

    fn program_build_log(
        &self,
        program: ProgramHandle,
        device: DeviceId,
        scratch: &mut [u8],
    ) -> StatusResult<usize> {
        let state = self.enter(NativeCall::BuildLog)?;
        let obj = state
            .programs
            .get(&program.as_raw())
            .ok_or(Status::INVALID_PROGRAM)?;
        Self::context_has_device(&state, obj.context, device)?;
        // Reported length counts the NUL terminator, as native runtimes do.
        let mut bytes = obj.log.as_bytes().to_vec();
        bytes.push(0);
        let n = bytes.len().min(scratch.len());
        scratch[..n].copy_from_slice(&bytes[..n]);
        Ok(bytes.len())
    }

    fn release_program(&self, program: ProgramHandle) -> StatusResult<()> {
        let mut state = self.enter(NativeCall::ReleaseProgram)?;
        let raw = program.as_raw();
        let kernels = state
            .programs
            .get(&raw)
            .ok_or(Status::INVALID_PROGRAM)?
            .kernels;
        if kernels > 0 {
            state.teardown_violations += 1;
            error!(program = raw, kernels, "program released before its kernels");
            return Err(Status::INVALID_OPERATION);
        }
        state.programs.remove(&raw);
        Ok(())
    }

    fn create_kernel(&self, program: ProgramHandle, name: &str) -> StatusResult<KernelHandle> {
        let mut state = self.enter(NativeCall::CreateKernel)?;
        let obj = state
            .programs
            .get(&program.as_raw())
            .ok_or(Status::INVALID_PROGRAM)?;
        if !obj.built {
            return Err(Status::INVALID_PROGRAM_EXECUTABLE);
        }
        let decl = obj
            .decls
            .iter()
            .find(|d| d.name == name)
            .cloned()
            .ok_or(Status::INVALID_KERNEL_NAME)?;
        let body = self
            .registry
            .read()
            .get(name)
            .cloned()
            .ok_or(Status::INVALID_KERNEL_NAME)?;
        let context = obj.context;
        if let Some(obj) = state.programs.get_mut(&program.as_raw()) {
            obj.kernels += 1;
        }
        let handle = state.next_handle();
        let arity = decl.params.len();
        state.kernels.insert(
            handle,
            KernelObject {
                program: program.as_raw(),
                context,
                decl,
                body,
                args: vec![None; arity],
            },
        );
        Ok(KernelHandle::from_raw(handle))
    }

    fn set_kernel_arg(
        &self,
        kernel: KernelHandle,
        index: u32,
        value: ArgValue<'_>,
    ) -> StatusResult<()> {
        let mut state = self.enter(NativeCall::SetKernelArg)?;
        let HostState {
            kernels, buffers, ..
        } = &mut *state;
        let obj = kernels
            .get_mut(&kernel.as_raw())
            .ok_or(Status::INVALID_KERNEL)?;
        let param = *obj
            .decl
            .params
            .get(index as usize)
            .ok_or(Status::INVALID_ARG_INDEX)?;
        let bound = match (param, value) {
            (ParamKind::Buffer, ArgValue::Mem(mem)) => {
                match buffers.get(&mem.as_raw()) {
                    Some(m) if m.context == obj.context => BoundArg::Mem(mem.as_raw()),
                    _ => return Err(Status::INVALID_MEM_OBJECT),
                }
            }
            (ParamKind::Buffer, ArgValue::Bytes(_)) => return Err(Status::INVALID_ARG_SIZE),
            (ParamKind::Scalar(_), ArgValue::Mem(_)) => return Err(Status::INVALID_ARG_SIZE),
            (ParamKind::Scalar(Some(size)), ArgValue::Bytes(bytes)) if bytes.len() != size => {
                return Err(Status::INVALID_ARG_SIZE)
            }
            (ParamKind::Scalar(_), ArgValue::Bytes(bytes)) => {
                if bytes.is_empty() {
                    return Err(Status::INVALID_ARG_SIZE);
                }
                BoundArg::Bytes(bytes.to_vec())
            }
        };
        obj.args[index as usize] = Some(bound);
        Ok(())
    }

    fn release_kernel(&self, kernel: KernelHandle) -> StatusResult<()> {
        let mut state = self.enter(NativeCall::ReleaseKernel)?;
        let obj = state
            .kernels
            .remove(&kernel.as_raw())
            .ok_or(Status::INVALID_KERNEL)?;
        if let Some(program) = state.programs.get_mut(&obj.program) {
            program.kernels = program.kernels.saturating_sub(1);
        }
        Ok(())
    }

    fn create_queue(&self, context: ContextHandle, device: DeviceId) -> StatusResult<QueueHandle> {
        let mut state = self.enter(NativeCall::CreateQueue)?;
        Self::context_has_device(&state, context.as_raw(), device)?;
        let handle = state.next_handle();
        state.queues.insert(
            handle,
            QueueObject {
                context: context.as_raw(),
                device,
                pending: VecDeque::new(),
            },
        );
        debug!(queue = handle, "host queue created");
        Ok(QueueHandle::from_raw(handle))
    }

    fn release_queue(&self, queue: QueueHandle) -> StatusResult<()> {
        let mut state = self.enter(NativeCall::ReleaseQueue)?;
        let raw = queue.as_raw();
        if !state.queues.contains_key(&raw) {
            return Err(Status::INVALID_COMMAND_QUEUE);
        }
        // Release implies completion of whatever is still queued.
        if let Err(status) = execute_pending(&mut state, raw) {
            warn!(queue = raw, %status, "queued work failed during release");
        }
        state.queues.remove(&raw);
        Ok(())
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
        let mut state = self.enter(NativeCall::EnqueueWrite)?;
        check_transfer(&state, queue, mem, offset, len, src.is_null())?;
        trace!(queue = queue.as_raw(), mem = mem.as_raw(), bytes = len, blocking, "enqueue write");
        let command = Command::Write {
            mem: mem.as_raw(),
            offset,
            src: HostPtr(src),
            len,
        };
        submit(&mut state, queue.as_raw(), command, blocking)
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
        let mut state = self.enter(NativeCall::EnqueueRead)?;
        check_transfer(&state, queue, mem, offset, len, dst.is_null())?;
        trace!(queue = queue.as_raw(), mem = mem.as_raw(), bytes = len, blocking, "enqueue read");
        let command = Command::Read {
            mem: mem.as_raw(),
            offset,
            dst: HostPtrMut(dst),
            len,
        };
        submit(&mut state, queue.as_raw(), command, blocking)
    }

    fn enqueue_kernel(
        &self,
        queue: QueueHandle,
        kernel: KernelHandle,
        global_work_size: usize,
        local_work_size: Option<usize>,
    ) -> StatusResult<()> {
        let mut state = self.enter(NativeCall::EnqueueKernel)?;
        let q = state
            .queues
            .get(&queue.as_raw())
            .ok_or(Status::INVALID_COMMAND_QUEUE)?;
        let (queue_context, device) = (q.context, q.device);
        let obj = state
            .kernels
            .get(&kernel.as_raw())
            .ok_or(Status::INVALID_KERNEL)?;
        if obj.context != queue_context {
            return Err(Status::INVALID_CONTEXT);
        }
        let args: Vec<BoundArg> = obj
            .args
            .iter()
            .cloned()
            .collect::<Option<Vec<_>>>()
            .ok_or(Status::INVALID_KERNEL_ARGS)?;
        if global_work_size == 0 {
            return Err(Status::INVALID_GLOBAL_WORK_SIZE);
        }
        let max_group = self
            .lookup_device(device)
            .map(|d| d.max_work_group_size)
            .unwrap_or(1);
        let local = match local_work_size {
            Some(local) => {
                if local == 0 || global_work_size % local != 0 || local > max_group {
                    return Err(Status::INVALID_WORK_GROUP_SIZE);
                }
                local
            }
            // The runtime picks a group size when none is given.
            None => (1..=max_group.min(global_work_size))
                .rev()
                .find(|l| global_work_size % l == 0)
                .unwrap_or(1),
        };
        trace!(
            queue = queue.as_raw(),
            kernel = %obj.decl.name,
            global = global_work_size,
            local,
            "enqueue launch"
        );
        let command = Command::Launch {
            name: obj.decl.name.clone(),
            body: Arc::clone(&obj.body),
            args,
            global: global_work_size,
            local,
        };
        submit(&mut state, queue.as_raw(), command, false)
    }

    fn flush(&self, queue: QueueHandle) -> StatusResult<()> {
        let state = self.enter(NativeCall::Flush)?;
        if state.queues.contains_key(&queue.as_raw()) {
            Ok(())
        } else {
            Err(Status::INVALID_COMMAND_QUEUE)
        }
    }

    fn finish(&self, queue: QueueHandle) -> StatusResult<()> {
        let mut state = self.enter(NativeCall::Finish)?;
        execute_pending(&mut state, queue.as_raw())
    }
}

fn check_transfer(
    state: &HostState,
    queue: QueueHandle,
    mem: MemHandle,
    offset: usize,
    len: usize,
    null_ptr: bool,
) -> StatusResult<()> {
    let q = state
        .queues
        .get(&queue.as_raw())
        .ok_or(Status::INVALID_COMMAND_QUEUE)?;
    let obj = state
        .buffers
        .get(&mem.as_raw())
        .ok_or(Status::INVALID_MEM_OBJECT)?;
    if obj.context != q.context {
        return Err(Status::INVALID_CONTEXT);
    }
    if null_ptr || len == 0 {
        return Err(Status::INVALID_VALUE);
    }
    match offset.checked_add(len) {
        Some(end) if end <= obj.data.len() => Ok(()),
        _ => Err(Status::INVALID_VALUE),
    }
}

/// Queues `command`; a blocking command first drains what is ahead of it.
fn submit(state: &mut HostState, queue: u64, command: Command, blocking: bool) -> StatusResult<()> {
    if blocking {
        execute_pending(state, queue).map_err(|_| Status::EXEC_STATUS_ERROR_FOR_EVENTS_IN_WAIT_LIST)?;
        return execute(&mut state.buffers, command);
    }
    state
        .queues
        .get_mut(&queue)
        .ok_or(Status::INVALID_COMMAND_QUEUE)?
        .pending
        .push_back(command);
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Ident(String),
    Punct(char),
}

/// Checks bracket balance, extracts kernel declarations and resolves each
/// against the registry. On failure returns the build log.
fn compile(
    source: &str,
    registry: &HashMap<String, Arc<HostKernelFn>>,
) -> std::result::Result<Vec<KernelDecl>, String> {
    let tokens = tokenize(source)?;
    check_brackets(&tokens)?;

    let mut errors = Vec::new();
    let mut decls: Vec<KernelDecl> = Vec::new();
    let mut i = 0;
    while i < tokens.len() {
        let (line, tok) = &tokens[i];
        i += 1;
        if !matches!(tok, Token::Ident(w) if w == "__kernel" || w == "kernel") {
            continue;
        }
        // Skip `__attribute__((...))`.
        if matches!(tokens.get(i), Some((_, Token::Ident(w))) if w == "__attribute__") {
            i += 1;
            let mut depth = 0usize;
            while let Some((_, t)) = tokens.get(i) {
                i += 1;
                match t {
                    Token::Punct('(') => depth += 1,
                    Token::Punct(')') => {
                        depth = depth.saturating_sub(1);
                        if depth == 0 {
                            break;
                        }
                    }
                    _ => {}
                }
            }
        }
        match tokens.get(i) {
            Some((_, Token::Ident(w))) if w == "void" => i += 1,
            _ => {
                errors.push(format!("{}: error: kernel must have a void return type", line));
                continue;
            }
        }
        let name = match tokens.get(i) {
            Some((_, Token::Ident(name))) => name.clone(),
            _ => {
                errors.push(format!("{}: error: expected kernel name", line));
                continue;
            }
        };
        i += 1;
        if tokens.get(i).map(|(_, t)| t) != Some(&Token::Punct('(')) {
            errors.push(format!("{}: error: expected '(' after kernel '{}'", line, name));
            continue;
        }
        i += 1;
        let mut params = Vec::new();
        let mut current: Vec<Token> = Vec::new();
        let mut depth = 0usize;
        while let Some((_, t)) = tokens.get(i) {
            i += 1;
            match t {
                Token::Punct('(') => {
                    depth += 1;
                    current.push(t.clone());
                }
                Token::Punct(')') if depth == 0 => break,
                Token::Punct(')') => {
                    depth -= 1;
                    current.push(t.clone());
                }
                Token::Punct(',') if depth == 0 => params.push(std::mem::take(&mut current)),
                _ => current.push(t.clone()),
            }
        }
        if !current.is_empty() {
            params.push(current);
        }
        let params: Vec<ParamKind> = params
            .iter()
            .filter(|p| !(p.len() == 1 && p[0] == Token::Ident("void".to_string())))
            .map(|p| classify_param(p))
            .collect();
        if decls.iter().any(|d| d.name == name) {
            errors.push(format!("{}: error: redefinition of kernel '{}'", line, name));
            continue;
        }
        if !registry.contains_key(&name) {
            errors.push(format!(
                "{}: error: no host implementation registered for kernel '{}'",
                line, name
            ));
        }
        decls.push(KernelDecl { name, params });
    }

    if errors.is_empty() {
        Ok(decls)
    } else {
        Err(errors.join("\n"))
    }
}

fn tokenize(source: &str) -> std::result::Result<Vec<(usize, Token)>, String> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut line = 1;
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c == '\n' {
            line += 1;
            i += 1;
        } else if c.is_whitespace() {
            i += 1;
        } else if c == '/' && chars.get(i + 1) == Some(&'/') {
            while i < chars.len() && chars[i] != '\n' {
                i += 1;
            }
        } else if c == '/' && chars.get(i + 1) == Some(&'*') {
            let start = line;
            i += 2;
            loop {
                match chars.get(i) {
                    None => return Err(format!("{}: error: unterminated /* comment", start)),
                    Some('*') if chars.get(i + 1) == Some(&'/') => {
                        i += 2;
                        break;
                    }
                    Some('\n') => {
                        line += 1;
                        i += 1;
                    }
                    Some(_) => i += 1,
                }
            }
        } else if c.is_alphanumeric() || c == '_' {
            let start = i;
            while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '.') {
                i += 1;
            }
            tokens.push((line, Token::Ident(chars[start..i].iter().collect())));
        } else {
            tokens.push((line, Token::Punct(c)));
            i += 1;
        }
    }
    Ok(tokens)
}

fn check_brackets(tokens: &[(usize, Token)]) -> std::result::Result<(), String> {
    let mut stack: Vec<(usize, char)> = Vec::new();
    for (line, tok) in tokens {
        if let Token::Punct(c) = tok {
            match c {
                '(' | '{' | '[' => stack.push((*line, *c)),
                ')' | '}' | ']' => {
                    let open = match c {
                        ')' => '(',
                        '}' => '{',
                        _ => '[',
                    };
                    match stack.pop() {
                        Some((_, o)) if o == open => {}
                        _ => return Err(format!("{}: error: unexpected '{}'", line, c)),
                    }
                }
                _ => {}
            }
        }
    }
    match stack.pop() {
        Some((line, open)) => {
            let close = match open {
                '(' => ')',
                '{' => '}',
                _ => ']',
            };
            Err(format!("{}: error: expected '{}' to match this '{}'", line, close, open))
        }
        None => Ok(()),
    }
}

fn classify_param(tokens: &[Token]) -> ParamKind {
    if tokens.iter().any(|t| *t == Token::Punct('*')) {
        return ParamKind::Buffer;
    }
    let words: Vec<&str> = tokens
        .iter()
        .filter_map(|t| match t {
            Token::Ident(w) => Some(w.as_str()),
            Token::Punct(_) => None,
        })
        .filter(|w| !matches!(*w, "const" | "__private" | "private" | "volatile" | "restrict" | "__restrict"))
        .collect();
    // The last word is the parameter name.
    let type_words = match words.split_last() {
        Some((_, ty)) if !ty.is_empty() => ty,
        _ => return ParamKind::Scalar(None),
    };
    let ty = match type_words {
        ["unsigned", "char"] => "uchar".to_string(),
        ["unsigned", "short"] => "ushort".to_string(),
        ["unsigned", "int"] | ["unsigned"] => "uint".to_string(),
        ["unsigned", "long"] => "ulong".to_string(),
        other => other.join(" "),
    };
    ParamKind::Scalar(scalar_size(&ty))
}

fn scalar_size(ty: &str) -> Option<usize> {
    let base_len = ty.trim_end_matches(|c: char| c.is_ascii_digit()).len();
    let (base, lanes) = ty.split_at(base_len);
    let lanes = match lanes {
        "" => 1,
        "2" => 2,
        "3" | "4" => 4,
        "8" => 8,
        "16" => 16,
        _ => return None,
    };
    let size = match base {
        "char" | "uchar" | "bool" => 1,
        "short" | "ushort" | "half" => 2,
        "int" | "uint" | "float" => 4,
        "long" | "ulong" | "double" => 8,
        _ => return None,
    };
    Some(size * lanes)
}

#[cfg(test)]
mod tests {
    use super::*;

    const ADD_ONE: &str = r#"
        // adds one
        __kernel void add_one(__global float* data) {
            int i = get_global_id(0);
            data[i] = data[i] + 1.0f;
        }
    "#;

    fn runtime_with_add_one() -> HostRuntime {
        let rt = HostRuntime::new();
        rt.register_kernel("add_one", |item| {
            let i = item.global_id();
            let v: f32 = item.load(0, i);
            item.store(0, i, v + 1.0);
        });
        rt
    }

    fn context(rt: &HostRuntime) -> (ContextHandle, DeviceId) {
        let platform = rt.platform_ids().unwrap()[0];
        let device = rt.device_ids(platform, DeviceKind::Default).unwrap()[0];
        (rt.create_context(&[device]).unwrap(), device)
    }

    #[test]
    fn test_empty_runtime_has_no_platforms() {
        let rt = HostRuntime::empty();
        assert_eq!(rt.platform_ids(), Err(Status::PLATFORM_NOT_FOUND_KHR));
    }

    #[test]
    fn test_device_filtering() {
        let rt = HostRuntime::new();
        let platform = rt.platform_ids().unwrap()[0];
        assert_eq!(rt.device_ids(platform, DeviceKind::All).unwrap().len(), 2);
        assert_eq!(rt.device_ids(platform, DeviceKind::Cpu).unwrap().len(), 1);
        assert_eq!(
            rt.device_ids(platform, DeviceKind::Accelerator),
            Err(Status::DEVICE_NOT_FOUND)
        );
        let gpu = rt.device_ids(platform, DeviceKind::Gpu).unwrap()[0];
        assert_eq!(rt.device_info(gpu).unwrap().kind, DeviceKind::Gpu);
    }

    #[test]
    fn test_compile_extracts_params() {
        let mut registry: HashMap<String, Arc<HostKernelFn>> = HashMap::new();
        registry.insert("k".to_string(), Arc::new(|_: &mut WorkItem<'_>| {}));
        let decls = compile(
            "__kernel void k(float a, __global const uchar* b, unsigned int n, float4 v) {}",
            &registry,
        )
        .unwrap();
        assert_eq!(decls.len(), 1);
        assert_eq!(
            decls[0].params,
            vec![
                ParamKind::Scalar(Some(4)),
                ParamKind::Buffer,
                ParamKind::Scalar(Some(4)),
                ParamKind::Scalar(Some(16)),
            ]
        );
    }

    #[test]
    fn test_compile_reports_unbalanced_braces() {
        let registry = HashMap::new();
        let log = compile("__kernel void k(__global float* a) {\n a[0] = 1;\n", &registry).unwrap_err();
        assert!(log.contains("expected '}'"), "{}", log);
        let log = compile("/* never closed", &registry).unwrap_err();
        assert!(log.contains("unterminated"));
    }

    #[test]
    fn test_compile_requires_registered_body() {
        let registry = HashMap::new();
        let log = compile("kernel void missing(void) {}", &registry).unwrap_err();
        assert!(log.contains("no host implementation registered for kernel 'missing'"));
    }

    #[test]
    fn test_launch_runs_in_submission_order() {
        let rt = runtime_with_add_one();
        let (ctx, device) = context(&rt);
        let data = [1.0f32, 2.0, 3.0, 4.0];
        let mem = rt
            .create_buffer(ctx, AccessMode::ReadWrite, 16, Some(bytemuck::cast_slice(&data)))
            .unwrap();
        let program = rt.create_program_with_source(ctx, ADD_ONE).unwrap();
        rt.build_program(program, device, "").unwrap();
        let kernel = rt.create_kernel(program, "add_one").unwrap();
        rt.set_kernel_arg(kernel, 0, ArgValue::Mem(mem)).unwrap();
        let queue = rt.create_queue(ctx, device).unwrap();

        let mut out = [0.0f32; 4];
        rt.enqueue_kernel(queue, kernel, 4, Some(2)).unwrap();
        rt.enqueue_kernel(queue, kernel, 4, Some(2)).unwrap();
        unsafe {
            rt.enqueue_read(queue, mem, false, 0, out.as_mut_ptr() as *mut u8, 16)
                .unwrap();
        }
        assert_eq!(out, [0.0; 4]);
        rt.flush(queue).unwrap();
        rt.finish(queue).unwrap();
        assert_eq!(out, [3.0, 4.0, 5.0, 6.0]);

        rt.release_queue(queue).unwrap();
        rt.release_kernel(kernel).unwrap();
        rt.release_program(program).unwrap();
        rt.release_buffer(mem).unwrap();
        rt.release_context(ctx).unwrap();
        assert!(rt.live_objects().is_empty());
        assert_eq!(rt.teardown_violations(), 0);
    }

    #[test]
    fn test_context_release_with_live_buffer_is_flagged() {
        let rt = HostRuntime::new();
        let (ctx, _) = context(&rt);
        let mem = rt.create_buffer(ctx, AccessMode::ReadOnly, 8, None).unwrap();
        assert_eq!(rt.release_context(ctx), Err(Status::INVALID_OPERATION));
        assert_eq!(rt.teardown_violations(), 1);
        rt.release_buffer(mem).unwrap();
        rt.release_context(ctx).unwrap();
        assert!(rt.live_objects().is_empty());
    }

    #[test]
    fn test_store_to_read_only_buffer_faults_on_finish() {
        let rt = runtime_with_add_one();
        let (ctx, device) = context(&rt);
        let mem = rt.create_buffer(ctx, AccessMode::ReadOnly, 16, None).unwrap();
        let program = rt.create_program_with_source(ctx, ADD_ONE).unwrap();
        rt.build_program(program, device, "").unwrap();
        let kernel = rt.create_kernel(program, "add_one").unwrap();
        rt.set_kernel_arg(kernel, 0, ArgValue::Mem(mem)).unwrap();
        let queue = rt.create_queue(ctx, device).unwrap();
        rt.enqueue_kernel(queue, kernel, 4, None).unwrap();
        assert_eq!(rt.finish(queue), Err(Status::INVALID_OPERATION));
    }

    #[test]
    fn test_injected_failure_is_consumed_once() {
        let rt = HostRuntime::new();
        rt.inject_failure(NativeCall::PlatformIds, Status::OUT_OF_HOST_MEMORY);
        assert_eq!(rt.platform_ids(), Err(Status::OUT_OF_HOST_MEMORY));
        assert!(rt.platform_ids().is_ok());
        assert_eq!(rt.call_count(NativeCall::PlatformIds), 2);
    }

    #[test]
    fn test_binary_round_trip_and_rejection() {
        let rt = runtime_with_add_one();
        let (ctx, device) = context(&rt);
        let blob = HostRuntime::program_binary(ADD_ONE);
        let program = rt.create_program_with_binary(ctx, device, &blob).unwrap();
        rt.build_program(program, device, "-cl-fast-relaxed-math").unwrap();
        assert_eq!(
            rt.create_program_with_binary(ctx, device, b"not a binary"),
            Err(Status::INVALID_BINARY)
        );
        assert_eq!(
            rt.build_program(program, device, "fast"),
            Err(Status::INVALID_BUILD_OPTIONS)
        );
    }
}
