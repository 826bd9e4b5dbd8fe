//! Platform/device discovery and the execution context.

use crate::config::Config;
use crate::error::{Error, Result};
use crate::runtime::{ComputeRuntime, ContextHandle, DeviceId, DeviceInfo, DeviceKind, PlatformId};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// Owner of the execution context every other resource is created against.
///
/// Buffers, programs and queues borrow the context for their whole lifetime,
/// so it cannot be dropped or moved while any of them is alive.
pub struct DeviceContext {
    runtime: Arc<dyn ComputeRuntime>,
    platform: PlatformId,
    devices: Vec<DeviceId>,
    context: ContextHandle,
    config: Config,
}

impl DeviceContext {
    /// Discover the first platform and its devices of `kind`, and create a context over them.
    pub fn create(runtime: Arc<dyn ComputeRuntime>, kind: DeviceKind) -> Result<Self> {
        let config = Config {
            device_kind: kind,
            ..Config::default()
        };
        Self::with_config(runtime, config)
    }

    /// Like [`create`](Self::create), taking the device kind and every
    /// downstream default from `config`.
    pub fn with_config(runtime: Arc<dyn ComputeRuntime>, config: Config) -> Result<Self> {
        config.validate()?;
        let kind = config.device_kind;

        let platforms = runtime.platform_ids().map_err(|status| Error::PlatformDiscovery {
            op: "clGetPlatformIDs",
            status,
        })?;
        let platform = *platforms.first().ok_or(Error::PlatformDiscovery {
            op: "clGetPlatformIDs",
            status: crate::error::Status::PLATFORM_NOT_FOUND_KHR,
        })?;

        let devices = runtime
            .device_ids(platform, kind)
            .map_err(|status| Error::DeviceDiscovery {
                kind,
                op: "clGetDeviceIDs",
                status,
            })?;
        if devices.is_empty() {
            return Err(Error::DeviceDiscovery {
                kind,
                op: "clGetDeviceIDs",
                status: crate::error::Status::DEVICE_NOT_FOUND,
            });
        }

        let context = runtime
            .create_context(&devices)
            .map_err(|status| Error::ContextCreation {
                op: "clCreateContext",
                status,
            })?;

        debug!(
            backend = runtime.backend_name(),
            context = context.as_raw(),
            devices = devices.len(),
            %kind,
            "device context created"
        );

        Ok(Self {
            runtime,
            platform,
            devices,
            context,
            config,
        })
    }

    /// Get the native context handle
    pub fn context(&self) -> ContextHandle {
        self.context
    }

    /// Get the primary (first) device
    pub fn device(&self) -> DeviceId {
        self.devices[0]
    }

    pub fn devices(&self) -> &[DeviceId] {
        &self.devices
    }

    pub fn platform(&self) -> PlatformId {
        self.platform
    }

    pub fn platform_name(&self) -> Result<String> {
        self.runtime
            .platform_name(self.platform)
            .map_err(|status| Error::PlatformDiscovery {
                op: "clGetPlatformInfo",
                status,
            })
    }

    /// Query properties of the primary device.
    pub fn device_info(&self) -> Result<DeviceInfo> {
        self.runtime
            .device_info(self.device())
            .map_err(|status| Error::DeviceDiscovery {
                kind: self.config.device_kind,
                op: "clGetDeviceInfo",
                status,
            })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn runtime(&self) -> &dyn ComputeRuntime {
        self.runtime.as_ref()
    }
}

impl Drop for DeviceContext {
    fn drop(&mut self) {
        match self.runtime.release_context(self.context) {
            Ok(()) => debug!(context = self.context.as_raw(), "device context released"),
            Err(status) => warn!(
                op = "clReleaseContext",
                %status,
                context = self.context.as_raw(),
                "failed to release context"
            ),
        }
    }
}

impl fmt::Debug for DeviceContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceContext")
            .field("backend", &self.runtime.backend_name())
            .field("platform", &self.platform)
            .field("devices", &self.devices)
            .field("context", &self.context)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Status;
    use crate::runtime::{HostDevice, HostRuntime, NativeCall};

    #[test]
    fn test_create_selects_first_device() {
        let host = Arc::new(HostRuntime::new());
        let ctx = DeviceContext::create(host.clone(), DeviceKind::Cpu).unwrap();
        assert_eq!(ctx.devices().len(), 1);
        assert_eq!(ctx.device_info().unwrap().kind, DeviceKind::Cpu);
        assert_eq!(ctx.platform_name().unwrap(), "Veda Host Platform");
        assert_eq!(host.live_objects().contexts, 1);
        drop(ctx);
        assert!(host.live_objects().is_empty());
    }

    #[test]
    fn test_no_platform() {
        let err = DeviceContext::create(Arc::new(HostRuntime::empty()), DeviceKind::All).unwrap_err();
        assert!(matches!(
            err,
            Error::PlatformDiscovery {
                status: Status::PLATFORM_NOT_FOUND_KHR,
                ..
            }
        ));
    }

    #[test]
    fn test_no_matching_device() {
        let host = HostRuntime::builder()
            .platform("cpu-only")
            .device(HostDevice::new("cpu0", DeviceKind::Cpu))
            .build();
        let err = DeviceContext::create(Arc::new(host), DeviceKind::Gpu).unwrap_err();
        match err {
            Error::DeviceDiscovery { kind, op, status } => {
                assert_eq!(kind, DeviceKind::Gpu);
                assert_eq!(op, "clGetDeviceIDs");
                assert_eq!(status, Status::DEVICE_NOT_FOUND);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_context_creation_failure_leaves_nothing_alive() {
        let host = Arc::new(HostRuntime::new());
        host.inject_failure(NativeCall::CreateContext, Status::OUT_OF_HOST_MEMORY);
        let err = DeviceContext::create(host.clone(), DeviceKind::Default).unwrap_err();
        assert_eq!(err.operation(), Some("clCreateContext"));
        assert_eq!(err.status(), Some(Status::OUT_OF_HOST_MEMORY));
        assert!(host.live_objects().is_empty());
    }

    #[test]
    fn test_invalid_config_is_rejected_before_discovery() {
        let host = Arc::new(HostRuntime::new());
        let config = Config {
            local_work_size: 0,
            ..Config::default()
        };
        assert!(matches!(
            DeviceContext::with_config(host.clone(), config),
            Err(Error::Config(_))
        ));
        assert_eq!(host.call_count(NativeCall::PlatformIds), 0);
    }
}
