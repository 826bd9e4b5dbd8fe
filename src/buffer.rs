//! Device-resident buffers with a typed element layout.

use crate::context::DeviceContext;
use crate::error::{Error, Result};
use crate::runtime::MemHandle;
use bytemuck::Pod;
use std::fmt;
use std::marker::PhantomData;
use tracing::{debug, warn};

pub use crate::runtime::AccessMode;

/// One device allocation of `element_count` values of `T`.
pub struct DeviceBuffer<'ctx, T: Pod> {
    ctx: &'ctx DeviceContext,
    mem: MemHandle,
    element_count: usize,
    access: AccessMode,
    _marker: PhantomData<T>,
}

impl<'ctx, T: Pod> DeviceBuffer<'ctx, T> {
    /// Allocate `element_count` elements, optionally seeded from `host`.
    ///
    /// The host slice is copied during the call and is not retained.
    pub fn allocate(
        ctx: &'ctx DeviceContext,
        element_count: usize,
        host: Option<&[T]>,
        access: AccessMode,
    ) -> Result<Self> {
        if element_count == 0 {
            return Err(Error::invalid_size("buffer element count must be > 0"));
        }
        if let Some(src) = host {
            if src.len() < element_count {
                return Err(Error::invalid_size(crate::diagnostic!(
                    "host slice has ",
                    src.len(),
                    " elements, buffer needs ",
                    element_count
                )));
            }
        }
        let bytes = element_count
            .checked_mul(std::mem::size_of::<T>())
            .ok_or_else(|| Error::invalid_size("buffer byte size overflows usize"))?;
        let seed = host.map(|src| &bytemuck::cast_slice::<T, u8>(src)[..bytes]);

        let mem = ctx
            .runtime()
            .create_buffer(ctx.context(), access, bytes, seed)
            .map_err(|status| Error::BufferAllocation {
                bytes,
                op: "clCreateBuffer",
                status,
            })?;
        debug!(mem = mem.as_raw(), bytes, ?access, "buffer allocated");

        Ok(Self {
            ctx,
            mem,
            element_count,
            access,
            _marker: PhantomData,
        })
    }

    /// Uninitialized buffer.
    pub fn new(ctx: &'ctx DeviceContext, element_count: usize, access: AccessMode) -> Result<Self> {
        Self::allocate(ctx, element_count, None, access)
    }

    /// Buffer sized to and seeded from `host`.
    pub fn from_slice(ctx: &'ctx DeviceContext, host: &[T], access: AccessMode) -> Result<Self> {
        Self::allocate(ctx, host.len(), Some(host), access)
    }

    #[inline]
    pub fn element_size(&self) -> usize {
        std::mem::size_of::<T>()
    }

    #[inline]
    pub fn element_count(&self) -> usize {
        self.element_count
    }

    #[inline]
    pub fn byte_size(&self) -> usize {
        // Checked at allocation.
        self.element_count * self.element_size()
    }

    #[inline]
    pub fn access_mode(&self) -> AccessMode {
        self.access
    }

    /// Native memory handle, for binding as a kernel argument.
    #[inline]
    pub fn mem(&self) -> MemHandle {
        self.mem
    }

    pub fn context(&self) -> &'ctx DeviceContext {
        self.ctx
    }
}

impl<T: Pod> Drop for DeviceBuffer<'_, T> {
    fn drop(&mut self) {
        if let Err(status) = self.ctx.runtime().release_buffer(self.mem) {
            warn!(op = "clReleaseMemObject", %status, mem = self.mem.as_raw(), "failed to release buffer");
        } else {
            debug!(mem = self.mem.as_raw(), "buffer released");
        }
    }
}

impl<T: Pod> fmt::Debug for DeviceBuffer<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceBuffer")
            .field("mem", &self.mem)
            .field("element_size", &self.element_size())
            .field("element_count", &self.element_count)
            .field("access", &self.access)
            .finish()
    }
}
