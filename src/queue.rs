//! Ordered command submission to one device.
//!
//! Transfers and launches are enqueued in order and complete, in that order,
//! by the next [`CommandQueue::drain`]. Host memory handed to a non-blocking
//! command is always queue-owned staging, so no caller borrow has to outlive
//! the call that enqueued it.

use crate::buffer::DeviceBuffer;
use crate::config::GeometryCheck;
use crate::context::DeviceContext;
use crate::error::{Direction, Error, Result, Status};
use crate::program::CompiledProgram;
use crate::runtime::QueueHandle;
use bytemuck::Pod;
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, trace, warn};

const OP_CREATE: &str = "clCreateCommandQueueWithProperties";
const OP_WRITE: &str = "clEnqueueWriteBuffer";
const OP_READ: &str = "clEnqueueReadBuffer";
const OP_LAUNCH: &str = "clEnqueueNDRangeKernel";
const OP_FLUSH: &str = "clFlush";
const OP_FINISH: &str = "clFinish";

// Shared by every queue so a ticket can never name another queue's read.
static NEXT_TICKET: AtomicU64 = AtomicU64::new(0);

/// Lifecycle of a queue's current batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueState {
    /// Nothing has been enqueued yet.
    Created,
    /// At least one command was enqueued since the last drain.
    Pending,
    /// A drain is in progress.
    Draining,
    /// The last drain returned.
    Idle,
}

/// Handle to a pending device-to-host read.
///
/// The data becomes available through [`CommandQueue::complete`] or
/// [`CommandQueue::take`] once the queue has been drained. A ticket is only
/// valid on the queue that issued it.
///
/// The queue holds the read's host memory until the ticket is redeemed or
/// passed to [`CommandQueue::discard`]. Dropping a ticket without either
/// leaves that memory with the queue until the queue itself is dropped.
#[must_use = "read data is only reachable through its ticket"]
pub struct ReadTicket<T> {
    id: u64,
    queue: QueueHandle,
    count: usize,
    _marker: PhantomData<fn() -> T>,
}

impl<T> ReadTicket<T> {
    /// Number of elements the read covers.
    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}

impl<T> fmt::Debug for ReadTicket<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadTicket")
            .field("id", &self.id)
            .field("queue", &self.queue)
            .field("count", &self.count)
            .finish()
    }
}

struct ReadSlot {
    data: Box<[u8]>,
    ready: bool,
    // Dropped by the next successful drain.
    discarded: bool,
}

/// A command queue bound to the context's primary device.
pub struct CommandQueue<'ctx> {
    ctx: &'ctx DeviceContext,
    queue: QueueHandle,
    state: QueueState,
    // Boxed so the heap address handed to the runtime stays put.
    staging: Vec<Box<[u8]>>,
    reads: HashMap<u64, ReadSlot>,
    // Host memory of failed batches; the runtime may still reference it until release.
    retired: Vec<Box<[u8]>>,
    max_work_group_size: Option<usize>,
}

impl<'ctx> CommandQueue<'ctx> {
    pub fn create(ctx: &'ctx DeviceContext) -> Result<Self> {
        let queue = ctx
            .runtime()
            .create_queue(ctx.context(), ctx.device())
            .map_err(|status| Error::QueueCreation { op: OP_CREATE, status })?;

        // Geometry validation is skipped when the limit cannot be queried.
        let max_work_group_size = ctx.device_info().ok().map(|info| info.max_work_group_size);
        debug!(queue = queue.as_raw(), ?max_work_group_size, "command queue created");

        Ok(Self {
            ctx,
            queue,
            state: QueueState::Created,
            staging: Vec::new(),
            reads: HashMap::new(),
            retired: Vec::new(),
            max_work_group_size,
        })
    }

    pub fn state(&self) -> QueueState {
        self.state
    }

    pub fn handle(&self) -> QueueHandle {
        self.queue
    }

    /// Reads whose host memory the queue still holds.
    pub fn pending_reads(&self) -> usize {
        self.reads.len()
    }

    /// Copy `src` into the start of `buffer`.
    ///
    /// Blocks until the copy is done when `Config::blocking_writes` is set;
    /// otherwise `src` is staged and the copy completes with the next drain.
    pub fn write<T: Pod>(&mut self, buffer: &DeviceBuffer<'_, T>, src: &[T]) -> Result<()> {
        let bytes: &[u8] = bytemuck::cast_slice(src);
        check_transfer_size(bytes.len(), buffer.byte_size())?;
        let blocking = self.ctx.config().blocking_writes;
        let runtime = self.ctx.runtime();

        let result = if blocking {
            // SAFETY: the call returns only after `src` has been read.
            unsafe {
                runtime.enqueue_write(self.queue, buffer.mem(), true, 0, bytes.as_ptr(), bytes.len())
            }
        } else {
            let staged: Box<[u8]> = bytes.into();
            let ptr = staged.as_ptr();
            self.staging.push(staged);
            // SAFETY: the staged copy lives until the next drain or the queue's drop.
            let result =
                unsafe { runtime.enqueue_write(self.queue, buffer.mem(), false, 0, ptr, bytes.len()) };
            if result.is_err() {
                self.staging.pop();
            }
            result
        };

        result.map_err(|status| Error::Transfer {
            direction: Direction::HostToDevice,
            op: OP_WRITE,
            status,
        })?;
        trace!(queue = self.queue.as_raw(), bytes = bytes.len(), blocking, "write enqueued");
        self.state = QueueState::Pending;
        Ok(())
    }

    /// Enqueue a read of the first `count` elements of `buffer`.
    ///
    /// The read is non-blocking; its data is reachable through the returned
    /// ticket after the next successful [`drain`](Self::drain).
    pub fn read<T: Pod>(&mut self, buffer: &DeviceBuffer<'_, T>, count: usize) -> Result<ReadTicket<T>> {
        let len = count
            .checked_mul(std::mem::size_of::<T>())
            .ok_or_else(|| Error::invalid_size("read byte size overflows usize"))?;
        check_transfer_size(len, buffer.byte_size())?;

        let mut slot = ReadSlot {
            data: vec![0u8; len].into_boxed_slice(),
            ready: false,
            discarded: false,
        };
        let ptr = slot.data.as_mut_ptr();
        // SAFETY: the slot's heap block is owned by the queue and is neither
        // read nor freed before the queue has finished.
        unsafe {
            self.ctx
                .runtime()
                .enqueue_read(self.queue, buffer.mem(), false, 0, ptr, len)
        }
        .map_err(|status| Error::Transfer {
            direction: Direction::DeviceToHost,
            op: OP_READ,
            status,
        })?;

        let id = NEXT_TICKET.fetch_add(1, Ordering::Relaxed);
        self.reads.insert(id, slot);
        trace!(queue = self.queue.as_raw(), bytes = len, ticket = id, "read enqueued");
        self.state = QueueState::Pending;

        Ok(ReadTicket {
            id,
            queue: self.queue,
            count,
            _marker: PhantomData,
        })
    }

    /// Copy a drained read into `dst`.
    ///
    /// Fails with a transfer error carrying `CL_INVALID_OPERATION` if the
    /// queue has not been drained since the read, the read was discarded, or
    /// the ticket was issued by another queue.
    pub fn complete<T: Pod>(&mut self, ticket: &ReadTicket<T>, dst: &mut [T]) -> Result<()> {
        if dst.len() < ticket.count {
            return Err(Error::invalid_size(crate::diagnostic!(
                "destination holds ",
                dst.len(),
                " elements, read returned ",
                ticket.count
            )));
        }
        let slot = self.ready_slot(ticket)?;
        bytemuck::cast_slice_mut::<T, u8>(&mut dst[..ticket.count]).copy_from_slice(&slot.data);
        Ok(())
    }

    /// Like [`complete`](Self::complete), returning the elements as a new vector.
    pub fn take<T: Pod>(&mut self, ticket: &ReadTicket<T>) -> Result<Vec<T>> {
        let slot = self.ready_slot(ticket)?;
        Ok(bytemuck::pod_collect_to_vec(&slot.data))
    }

    /// Give up on a read without looking at its data.
    ///
    /// A read still in flight keeps its memory until the next drain.
    pub fn discard<T>(&mut self, ticket: ReadTicket<T>) {
        if ticket.queue != self.queue {
            return;
        }
        let ready = match self.reads.get_mut(&ticket.id) {
            Some(slot) if slot.ready => true,
            Some(slot) => {
                slot.discarded = true;
                false
            }
            None => return,
        };
        if ready {
            self.reads.remove(&ticket.id);
        }
        trace!(queue = self.queue.as_raw(), ticket = ticket.id, ready, "read discarded");
    }

    fn ready_slot<T: Pod>(&mut self, ticket: &ReadTicket<T>) -> Result<ReadSlot> {
        let invalid = Error::Transfer {
            direction: Direction::DeviceToHost,
            op: OP_READ,
            status: Status::INVALID_OPERATION,
        };
        if ticket.queue != self.queue {
            return Err(invalid);
        }
        let expected = ticket.count.checked_mul(std::mem::size_of::<T>());
        match self.reads.get(&ticket.id) {
            Some(slot) if slot.ready && !slot.discarded && Some(slot.data.len()) == expected => {}
            _ => return Err(invalid),
        }
        self.reads.remove(&ticket.id).ok_or(invalid)
    }

    /// Read the start of `buffer` into `dst`, blocking until it has landed.
    pub fn read_blocking<T: Pod>(&mut self, buffer: &DeviceBuffer<'_, T>, dst: &mut [T]) -> Result<()> {
        let bytes: &mut [u8] = bytemuck::cast_slice_mut(dst);
        check_transfer_size(bytes.len(), buffer.byte_size())?;
        // SAFETY: `dst` is exclusively borrowed for the whole blocking call.
        unsafe {
            self.ctx.runtime().enqueue_read(
                self.queue,
                buffer.mem(),
                true,
                0,
                bytes.as_mut_ptr(),
                bytes.len(),
            )
        }
        .map_err(|status| Error::Transfer {
            direction: Direction::DeviceToHost,
            op: OP_READ,
            status,
        })?;
        trace!(queue = self.queue.as_raw(), bytes = bytes.len(), "blocking read done");
        self.state = QueueState::Pending;
        Ok(())
    }

    /// Launch the program's kernel over `total_work_items`, in groups of
    /// `Config::local_work_size`.
    pub fn launch(&mut self, program: &CompiledProgram<'_, '_>, total_work_items: usize) -> Result<()> {
        let local = self.ctx.config().local_work_size;
        self.launch_with_local_size(program, total_work_items, local)
    }

    pub fn launch_with_local_size(
        &mut self,
        program: &CompiledProgram<'_, '_>,
        total_work_items: usize,
        local_work_size: usize,
    ) -> Result<()> {
        if self.ctx.config().geometry_check == GeometryCheck::Validate {
            self.validate_geometry(total_work_items, local_work_size)?;
        }
        self.ctx
            .runtime()
            .enqueue_kernel(self.queue, program.kernel(), total_work_items, Some(local_work_size))
            .map_err(|status| Error::KernelLaunch { op: OP_LAUNCH, status })?;
        trace!(
            queue = self.queue.as_raw(),
            entry_point = program.entry_point(),
            global = total_work_items,
            local = local_work_size,
            "launch enqueued"
        );
        self.state = QueueState::Pending;
        Ok(())
    }

    fn validate_geometry(&self, total: usize, local: usize) -> Result<()> {
        if total == 0 {
            return Err(Error::invalid_size("global work size must be > 0"));
        }
        if local == 0 {
            return Err(Error::invalid_size("local work size must be > 0"));
        }
        if total % local != 0 {
            return Err(Error::invalid_size(crate::diagnostic!(
                "local work size ",
                local,
                " does not divide global work size ",
                total
            )));
        }
        if let Some(max) = self.max_work_group_size {
            if local > max {
                return Err(Error::invalid_size(crate::diagnostic!(
                    "local work size ",
                    local,
                    " exceeds device maximum ",
                    max
                )));
            }
        }
        Ok(())
    }

    /// Flush, then block until every enqueued command has completed.
    ///
    /// On failure the whole batch is dropped: staged writes are freed and
    /// outstanding read tickets become invalid.
    pub fn drain(&mut self) -> Result<()> {
        self.state = QueueState::Draining;
        let runtime = self.ctx.runtime();

        let result = runtime
            .flush(self.queue)
            .map_err(|status| Error::QueueFlush { op: OP_FLUSH, status })
            .and_then(|()| {
                runtime
                    .finish(self.queue)
                    .map_err(|status| Error::QueueFinish { op: OP_FINISH, status })
            });

        match &result {
            Ok(()) => {
                self.staging.clear();
                self.reads.retain(|_, slot| !slot.discarded);
                for slot in self.reads.values_mut() {
                    slot.ready = true;
                }
                trace!(queue = self.queue.as_raw(), "queue drained");
            }
            Err(err) => {
                self.retired.append(&mut self.staging);
                let failed: Vec<u64> = self
                    .reads
                    .iter()
                    .filter(|(_, slot)| !slot.ready)
                    .map(|(id, _)| *id)
                    .collect();
                for id in failed {
                    if let Some(slot) = self.reads.remove(&id) {
                        self.retired.push(slot.data);
                    }
                }
                warn!(queue = self.queue.as_raw(), error = %err, "drain failed, batch discarded");
            }
        }
        self.state = QueueState::Idle;
        result
    }
}

fn check_transfer_size(bytes: usize, capacity: usize) -> Result<()> {
    if bytes == 0 {
        return Err(Error::invalid_size("transfer of zero bytes"));
    }
    if bytes > capacity {
        return Err(Error::invalid_size(crate::diagnostic!(
            "transfer of ",
            bytes,
            " bytes exceeds buffer size ",
            capacity
        )));
    }
    Ok(())
}

impl Drop for CommandQueue<'_> {
    fn drop(&mut self) {
        let runtime = self.ctx.runtime();
        if let Err(status) = runtime.finish(self.queue) {
            warn!(op = OP_FINISH, %status, queue = self.queue.as_raw(), "finish before release failed");
        }
        match runtime.release_queue(self.queue) {
            Ok(()) => debug!(queue = self.queue.as_raw(), "command queue released"),
            Err(status) => warn!(
                op = "clReleaseCommandQueue",
                %status,
                queue = self.queue.as_raw(),
                "failed to release command queue"
            ),
        }
    }
}

impl fmt::Debug for CommandQueue<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandQueue")
            .field("queue", &self.queue)
            .field("state", &self.state)
            .field("staged_writes", &self.staging.len())
            .field("pending_reads", &self.pending_reads())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::AccessMode;
    use crate::config::Config;
    use crate::kernels::{self, COPY};
    use crate::runtime::{DeviceKind, HostRuntime, NativeCall};
    use std::sync::Arc;

    fn setup(config: Config) -> (Arc<HostRuntime>, DeviceContext) {
        let host = Arc::new(HostRuntime::new());
        kernels::register_host_kernels(&host);
        let ctx = DeviceContext::with_config(host.clone(), config).unwrap();
        (host, ctx)
    }

    #[test]
    fn test_state_transitions() {
        let (_host, ctx) = setup(Config::default());
        let buf = DeviceBuffer::<u32>::new(&ctx, 4, AccessMode::ReadWrite).unwrap();
        let mut queue = CommandQueue::create(&ctx).unwrap();
        assert_eq!(queue.state(), QueueState::Created);
        queue.write(&buf, &[1, 2, 3, 4]).unwrap();
        assert_eq!(queue.state(), QueueState::Pending);
        queue.drain().unwrap();
        assert_eq!(queue.state(), QueueState::Idle);
        let ticket = queue.read(&buf, 4).unwrap();
        assert_eq!(queue.state(), QueueState::Pending);
        queue.drain().unwrap();
        assert_eq!(queue.take(&ticket).unwrap(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_complete_before_drain_is_rejected() {
        let (_host, ctx) = setup(Config::default());
        let buf = DeviceBuffer::from_slice(&ctx, &[9u8; 16], AccessMode::ReadOnly).unwrap();
        let mut queue = CommandQueue::create(&ctx).unwrap();
        let ticket = queue.read(&buf, 16).unwrap();

        let mut out = [0u8; 16];
        let err = queue.complete(&ticket, &mut out).unwrap_err();
        assert!(matches!(
            err,
            Error::Transfer {
                direction: Direction::DeviceToHost,
                status: Status::INVALID_OPERATION,
                ..
            }
        ));

        queue.drain().unwrap();
        let mut short = [0u8; 8];
        assert!(matches!(
            queue.complete(&ticket, &mut short),
            Err(Error::InvalidSize(_))
        ));
        queue.complete(&ticket, &mut out).unwrap();
        assert_eq!(out, [9u8; 16]);

        // A ticket is good for one completion.
        assert!(queue.complete(&ticket, &mut out).is_err());
    }

    #[test]
    fn test_oversized_write_rejected() {
        let (_host, ctx) = setup(Config::default());
        let buf = DeviceBuffer::<f32>::new(&ctx, 2, AccessMode::ReadWrite).unwrap();
        let mut queue = CommandQueue::create(&ctx).unwrap();
        let err = queue.write(&buf, &[1.0, 2.0, 3.0]).unwrap_err();
        assert_eq!(
            err.to_string(),
            "invalid size: transfer of 12 bytes exceeds buffer size 8"
        );
        assert_eq!(queue.state(), QueueState::Created);
    }

    #[test]
    fn test_non_blocking_write_completes_on_drain() {
        let config = Config::builder().blocking_writes(false).build().unwrap();
        let (host, ctx) = setup(config);
        let buf = DeviceBuffer::<u16>::new(&ctx, 3, AccessMode::ReadWrite).unwrap();
        let mut queue = CommandQueue::create(&ctx).unwrap();
        {
            let src = vec![7u16, 8, 9];
            queue.write(&buf, &src).unwrap();
        }
        assert_eq!(host.mem_contents(buf.mem()).unwrap(), vec![0u8; 6]);
        queue.drain().unwrap();
        let expected: Vec<u8> = [7u16, 8, 9].iter().flat_map(|v| v.to_ne_bytes()).collect();
        assert_eq!(host.mem_contents(buf.mem()).unwrap(), expected);
    }

    #[test]
    fn test_geometry_validation() {
        let (_host, ctx) = setup(Config::default());
        let src = DeviceBuffer::<f32>::new(&ctx, 100, AccessMode::ReadOnly).unwrap();
        let dst = DeviceBuffer::<f32>::new(&ctx, 100, AccessMode::WriteOnly).unwrap();
        let mut program = CompiledProgram::build(&ctx, COPY.source, COPY.entry_point).unwrap();
        program.bind_args(&crate::kernel_args![&src, &dst]).unwrap();
        let mut queue = CommandQueue::create(&ctx).unwrap();

        // 100 is not a multiple of the default 64.
        assert!(matches!(queue.launch(&program, 100), Err(Error::InvalidSize(_))));
        assert!(matches!(
            queue.launch_with_local_size(&program, 0, 4),
            Err(Error::InvalidSize(_))
        ));
        assert!(matches!(
            queue.launch_with_local_size(&program, 100, 0),
            Err(Error::InvalidSize(_))
        ));
        // Above the emulated GPU's limit of 256.
        assert!(matches!(
            queue.launch_with_local_size(&program, 512, 512),
            Err(Error::InvalidSize(_))
        ));
        assert_eq!(queue.state(), QueueState::Created);

        queue.launch_with_local_size(&program, 100, 20).unwrap();
        queue.drain().unwrap();
    }

    #[test]
    fn test_unchecked_geometry_surfaces_launch_failure() {
        let config = Config::builder()
            .geometry_check(GeometryCheck::Unchecked)
            .build()
            .unwrap();
        let (_host, ctx) = setup(config);
        let src = DeviceBuffer::<f32>::new(&ctx, 100, AccessMode::ReadOnly).unwrap();
        let dst = DeviceBuffer::<f32>::new(&ctx, 100, AccessMode::WriteOnly).unwrap();
        let mut program = CompiledProgram::build(&ctx, COPY.source, COPY.entry_point).unwrap();
        program.bind_args(&crate::kernel_args![&src, &dst]).unwrap();
        let mut queue = CommandQueue::create(&ctx).unwrap();

        match queue.launch(&program, 100).unwrap_err() {
            Error::KernelLaunch { op, status } => {
                assert_eq!(op, "clEnqueueNDRangeKernel");
                assert_eq!(status, Status::INVALID_WORK_GROUP_SIZE);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_finish_failure_discards_batch() {
        let (host, ctx) = setup(Config::default());
        let buf = DeviceBuffer::<u8>::new(&ctx, 4, AccessMode::ReadWrite).unwrap();
        let mut queue = CommandQueue::create(&ctx).unwrap();
        let ticket = queue.read(&buf, 4).unwrap();
        host.inject_failure(NativeCall::Finish, Status::OUT_OF_RESOURCES);
        match queue.drain().unwrap_err() {
            Error::QueueFinish { op, status } => {
                assert_eq!(op, "clFinish");
                assert_eq!(status, Status::OUT_OF_RESOURCES);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(queue.state(), QueueState::Idle);
        assert!(queue.take(&ticket).is_err());
    }

    #[test]
    fn test_ticket_is_bound_to_its_queue() {
        let (_host, ctx) = setup(Config::default());
        let wide = DeviceBuffer::from_slice(&ctx, &[1.0f32; 16], AccessMode::ReadOnly).unwrap();
        let narrow = DeviceBuffer::from_slice(&ctx, &[2.0f32; 8], AccessMode::ReadOnly).unwrap();
        let mut qa = CommandQueue::create(&ctx).unwrap();
        let mut qb = CommandQueue::create(&ctx).unwrap();

        let ta = qa.read(&wide, 16).unwrap();
        let tb = qb.read(&narrow, 8).unwrap();
        qa.drain().unwrap();
        qb.drain().unwrap();

        let mut out = [0f32; 16];
        for result in [qb.complete(&ta, &mut out), qb.take(&ta).map(drop)] {
            assert!(matches!(
                result,
                Err(Error::Transfer {
                    direction: Direction::DeviceToHost,
                    status: Status::INVALID_OPERATION,
                    ..
                })
            ));
        }
        assert_eq!(qb.pending_reads(), 1);

        // Each queue still serves its own ticket.
        assert_eq!(qb.take(&tb).unwrap(), vec![2.0f32; 8]);
        qa.complete(&ta, &mut out).unwrap();
        assert_eq!(out, [1.0f32; 16]);
    }

    #[test]
    fn test_discard_releases_read_memory() {
        let (_host, ctx) = setup(Config::default());
        let buf = DeviceBuffer::from_slice(&ctx, &[3u32; 4], AccessMode::ReadOnly).unwrap();
        let mut queue = CommandQueue::create(&ctx).unwrap();

        // Dropped tickets keep their slot.
        let _ = queue.read(&buf, 4).unwrap();
        assert_eq!(queue.pending_reads(), 1);

        let drained = queue.read(&buf, 4).unwrap();
        queue.drain().unwrap();
        assert_eq!(queue.pending_reads(), 2);
        queue.discard(drained);
        assert_eq!(queue.pending_reads(), 1);

        // An in-flight read is only dropped once the drain has landed it.
        let in_flight = queue.read(&buf, 4).unwrap();
        queue.discard(in_flight);
        assert_eq!(queue.pending_reads(), 2);
        queue.drain().unwrap();
        assert_eq!(queue.pending_reads(), 1);
    }

    #[test]
    fn test_device_kind_cpu_queue() {
        let config = Config::builder().device_kind(DeviceKind::Cpu).build().unwrap();
        let (host, ctx) = setup(config);
        let queue = CommandQueue::create(&ctx).unwrap();
        assert_eq!(host.live_objects().queues, 1);
        drop(queue);
        assert_eq!(host.live_objects().queues, 0);
    }
}
