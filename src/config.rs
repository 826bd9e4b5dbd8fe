use crate::error::{Error, Result};
use crate::runtime::DeviceKind;

/// How launch geometry is checked before it reaches the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GeometryCheck {
    /// Reject zero sizes, indivisible local sizes and local sizes above the
    /// device limit with [`Error::InvalidSize`].
    #[default]
    Validate,
    /// Pass the geometry through; the runtime reports any problem as a launch failure.
    Unchecked,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub device_kind: DeviceKind,
    pub local_work_size: usize,
    pub geometry_check: GeometryCheck,
    pub blocking_writes: bool,
    pub build_options: String,

    #[cfg(feature = "telemetry")]
    pub enable_telemetry: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            device_kind: DeviceKind::Default,
            local_work_size: 64,
            geometry_check: GeometryCheck::default(),
            blocking_writes: true,
            build_options: String::new(),

            #[cfg(feature = "telemetry")]
            enable_telemetry: true,
        }
    }
}

impl Config {
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::new()
    }

    pub fn validate(&self) -> Result<()> {
        if self.local_work_size == 0 {
            return Err(Error::config("local_work_size must be > 0"));
        }

        if self.build_options.contains('\0') {
            return Err(Error::config("build_options must not contain NUL"));
        }

        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    pub fn device_kind(mut self, kind: DeviceKind) -> Self {
        self.config.device_kind = kind;
        self
    }

    pub fn local_work_size(mut self, size: usize) -> Self {
        self.config.local_work_size = size;
        self
    }

    pub fn geometry_check(mut self, check: GeometryCheck) -> Self {
        self.config.geometry_check = check;
        self
    }

    pub fn blocking_writes(mut self, blocking: bool) -> Self {
        self.config.blocking_writes = blocking;
        self
    }

    pub fn build_options<S: Into<String>>(mut self, options: S) -> Self {
        self.config.build_options = options.into();
        self
    }

    #[cfg(feature = "telemetry")]
    pub fn enable_telemetry(mut self, enable: bool) -> Self {
        self.config.enable_telemetry = enable;
        self
    }

    pub fn build(self) -> Result<Config> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.device_kind, DeviceKind::Default);
        assert_eq!(config.local_work_size, 64);
        assert_eq!(config.geometry_check, GeometryCheck::Validate);
        assert!(config.blocking_writes);
        assert!(config.build_options.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder_rejects_zero_local_size() {
        let err = Config::builder().local_work_size(0).build().unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_builder_rejects_nul_in_build_options() {
        assert!(Config::builder().build_options("-D N=1\0").build().is_err());
        let config = Config::builder()
            .device_kind(DeviceKind::Gpu)
            .build_options("-cl-fast-relaxed-math")
            .geometry_check(GeometryCheck::Unchecked)
            .blocking_writes(false)
            .build()
            .unwrap();
        assert_eq!(config.device_kind, DeviceKind::Gpu);
        assert!(!config.blocking_writes);
    }
}
