//! Typed failures for every native call, plus the diagnostic formatter.

use crate::runtime::DeviceKind;
use std::fmt::{self, Write as _};

pub type Result<T> = std::result::Result<T, Error>;

/// Raw status code returned by a native call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Status(pub i32);

impl Status {
    pub const SUCCESS: Status = Status(0);
    pub const DEVICE_NOT_FOUND: Status = Status(-1);
    pub const MEM_OBJECT_ALLOCATION_FAILURE: Status = Status(-4);
    pub const OUT_OF_RESOURCES: Status = Status(-5);
    pub const OUT_OF_HOST_MEMORY: Status = Status(-6);
    pub const BUILD_PROGRAM_FAILURE: Status = Status(-11);
    pub const EXEC_STATUS_ERROR_FOR_EVENTS_IN_WAIT_LIST: Status = Status(-14);
    pub const INVALID_VALUE: Status = Status(-30);
    pub const INVALID_DEVICE_TYPE: Status = Status(-31);
    pub const INVALID_PLATFORM: Status = Status(-32);
    pub const INVALID_DEVICE: Status = Status(-33);
    pub const INVALID_CONTEXT: Status = Status(-34);
    pub const INVALID_COMMAND_QUEUE: Status = Status(-36);
    pub const INVALID_HOST_PTR: Status = Status(-37);
    pub const INVALID_MEM_OBJECT: Status = Status(-38);
    pub const INVALID_BINARY: Status = Status(-42);
    pub const INVALID_BUILD_OPTIONS: Status = Status(-43);
    pub const INVALID_PROGRAM: Status = Status(-44);
    pub const INVALID_PROGRAM_EXECUTABLE: Status = Status(-45);
    pub const INVALID_KERNEL_NAME: Status = Status(-46);
    pub const INVALID_KERNEL: Status = Status(-48);
    pub const INVALID_ARG_INDEX: Status = Status(-49);
    pub const INVALID_ARG_VALUE: Status = Status(-50);
    pub const INVALID_ARG_SIZE: Status = Status(-51);
    pub const INVALID_KERNEL_ARGS: Status = Status(-52);
    pub const INVALID_WORK_DIMENSION: Status = Status(-53);
    pub const INVALID_WORK_GROUP_SIZE: Status = Status(-54);
    pub const INVALID_OPERATION: Status = Status(-59);
    pub const INVALID_BUFFER_SIZE: Status = Status(-61);
    pub const INVALID_GLOBAL_WORK_SIZE: Status = Status(-63);
    pub const PLATFORM_NOT_FOUND_KHR: Status = Status(-1001);

    #[inline]
    pub fn code(self) -> i32 {
        self.0
    }

    #[inline]
    pub fn is_success(self) -> bool {
        self.0 == 0
    }

    /// Symbolic name of a well-known status code.
    pub fn name(self) -> Option<&'static str> {
        let name = match self.0 {
            0 => "CL_SUCCESS",
            -1 => "CL_DEVICE_NOT_FOUND",
            -4 => "CL_MEM_OBJECT_ALLOCATION_FAILURE",
            -5 => "CL_OUT_OF_RESOURCES",
            -6 => "CL_OUT_OF_HOST_MEMORY",
            -11 => "CL_BUILD_PROGRAM_FAILURE",
            -14 => "CL_EXEC_STATUS_ERROR_FOR_EVENTS_IN_WAIT_LIST",
            -30 => "CL_INVALID_VALUE",
            -31 => "CL_INVALID_DEVICE_TYPE",
            -32 => "CL_INVALID_PLATFORM",
            -33 => "CL_INVALID_DEVICE",
            -34 => "CL_INVALID_CONTEXT",
            -36 => "CL_INVALID_COMMAND_QUEUE",
            -37 => "CL_INVALID_HOST_PTR",
            -38 => "CL_INVALID_MEM_OBJECT",
            -42 => "CL_INVALID_BINARY",
            -43 => "CL_INVALID_BUILD_OPTIONS",
            -44 => "CL_INVALID_PROGRAM",
            -45 => "CL_INVALID_PROGRAM_EXECUTABLE",
            -46 => "CL_INVALID_KERNEL_NAME",
            -48 => "CL_INVALID_KERNEL",
            -49 => "CL_INVALID_ARG_INDEX",
            -50 => "CL_INVALID_ARG_VALUE",
            -51 => "CL_INVALID_ARG_SIZE",
            -52 => "CL_INVALID_KERNEL_ARGS",
            -53 => "CL_INVALID_WORK_DIMENSION",
            -54 => "CL_INVALID_WORK_GROUP_SIZE",
            -59 => "CL_INVALID_OPERATION",
            -61 => "CL_INVALID_BUFFER_SIZE",
            -63 => "CL_INVALID_GLOBAL_WORK_SIZE",
            -1001 => "CL_PLATFORM_NOT_FOUND_KHR",
            _ => return None,
        };
        Some(name)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{} ({})", name, self.0),
            None => write!(f, "status {}", self.0),
        }
    }
}

/// Direction of a buffer transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    HostToDevice,
    DeviceToHost,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Direction::HostToDevice => "host-to-device",
            Direction::DeviceToHost => "device-to-host",
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("platform discovery failed: {op} returned {status}")]
    PlatformDiscovery { op: &'static str, status: Status },

    #[error("no {kind} device found: {op} returned {status}")]
    DeviceDiscovery {
        kind: DeviceKind,
        op: &'static str,
        status: Status,
    },

    #[error("context creation failed: {op} returned {status}")]
    ContextCreation { op: &'static str, status: Status },

    #[error("buffer allocation of {bytes} bytes failed: {op} returned {status}")]
    BufferAllocation {
        bytes: usize,
        op: &'static str,
        status: Status,
    },

    #[error("{op} failed: {status}\n{log}")]
    ProgramBuild {
        op: &'static str,
        status: Status,
        log: String,
    },

    #[error("entry point `{entry_point}` not found: {op} returned {status}")]
    EntryPointNotFound {
        entry_point: String,
        op: &'static str,
        status: Status,
    },

    #[error("binding kernel argument {index} failed: {op} returned {status}")]
    ArgumentBind {
        index: u32,
        op: &'static str,
        status: Status,
    },

    #[error("command queue creation failed: {op} returned {status}")]
    QueueCreation { op: &'static str, status: Status },

    #[error("{direction} transfer failed: {op} returned {status}")]
    Transfer {
        direction: Direction,
        op: &'static str,
        status: Status,
    },

    #[error("kernel launch failed: {op} returned {status}")]
    KernelLaunch { op: &'static str, status: Status },

    #[error("queue flush failed: {op} returned {status}")]
    QueueFlush { op: &'static str, status: Status },

    #[error("queue finish failed: {op} returned {status}")]
    QueueFinish { op: &'static str, status: Status },

    #[error("invalid size: {0}")]
    InvalidSize(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("telemetry error: {0}")]
    Telemetry(String),
}

impl Error {
    pub fn invalid_size<S: Into<String>>(msg: S) -> Self {
        Error::InvalidSize(msg.into())
    }

    pub fn config<S: Into<String>>(msg: S) -> Self {
        Error::Config(msg.into())
    }

    pub fn telemetry<S: Into<String>>(msg: S) -> Self {
        Error::Telemetry(msg.into())
    }

    /// Native status carried by the failure, if it came from a native call.
    pub fn status(&self) -> Option<Status> {
        match self {
            Error::PlatformDiscovery { status, .. }
            | Error::DeviceDiscovery { status, .. }
            | Error::ContextCreation { status, .. }
            | Error::BufferAllocation { status, .. }
            | Error::ProgramBuild { status, .. }
            | Error::EntryPointNotFound { status, .. }
            | Error::ArgumentBind { status, .. }
            | Error::QueueCreation { status, .. }
            | Error::Transfer { status, .. }
            | Error::KernelLaunch { status, .. }
            | Error::QueueFlush { status, .. }
            | Error::QueueFinish { status, .. } => Some(*status),
            Error::InvalidSize(_) | Error::Config(_) | Error::Telemetry(_) => None,
        }
    }

    /// Name of the native operation that failed.
    pub fn operation(&self) -> Option<&'static str> {
        match self {
            Error::PlatformDiscovery { op, .. }
            | Error::DeviceDiscovery { op, .. }
            | Error::ContextCreation { op, .. }
            | Error::BufferAllocation { op, .. }
            | Error::ProgramBuild { op, .. }
            | Error::EntryPointNotFound { op, .. }
            | Error::ArgumentBind { op, .. }
            | Error::QueueCreation { op, .. }
            | Error::Transfer { op, .. }
            | Error::KernelLaunch { op, .. }
            | Error::QueueFlush { op, .. }
            | Error::QueueFinish { op, .. } => Some(op),
            Error::InvalidSize(_) | Error::Config(_) | Error::Telemetry(_) => None,
        }
    }

    /// Build log attached to a program build failure.
    pub fn build_log(&self) -> Option<&str> {
        match self {
            Error::ProgramBuild { log, .. } => Some(log),
            _ => None,
        }
    }
}

/// Concatenates heterogeneous parts into one diagnostic string, with no separators.
pub fn format_diagnostic(parts: &[&dyn fmt::Display]) -> String {
    let mut out = String::new();
    for part in parts {
        // Writing into a String cannot fail.
        let _ = write!(out, "{}", part);
    }
    out
}

/// `diagnostic!("expected ", n, " elements")` formats any `Display` values back to back.
#[macro_export]
macro_rules! diagnostic {
    ($($part:expr),+ $(,)?) => {
        $crate::error::format_diagnostic(&[$(&$part as &dyn ::std::fmt::Display),+])
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_display() {
        assert_eq!(
            Status::INVALID_KERNEL_NAME.to_string(),
            "CL_INVALID_KERNEL_NAME (-46)"
        );
        assert_eq!(Status(-9999).to_string(), "status -9999");
        assert!(Status::SUCCESS.is_success());
        assert!(!Status::OUT_OF_RESOURCES.is_success());
    }

    #[test]
    fn test_diagnostic_concatenates_mixed_parts() {
        let msg = crate::diagnostic!("clCreateBuffer failed: ", -4, " after ", 2.5, "ms");
        assert_eq!(msg, "clCreateBuffer failed: -4 after 2.5ms");
    }

    #[test]
    fn test_error_carries_status_and_operation() {
        let err = Error::ArgumentBind {
            index: 3,
            op: "clSetKernelArg",
            status: Status::INVALID_ARG_SIZE,
        };
        assert_eq!(err.status(), Some(Status::INVALID_ARG_SIZE));
        assert_eq!(err.operation(), Some("clSetKernelArg"));
        assert!(err.to_string().contains("argument 3"));
        assert!(err.to_string().contains("CL_INVALID_ARG_SIZE"));

        let err = Error::invalid_size("zero elements");
        assert_eq!(err.status(), None);
        assert_eq!(err.operation(), None);
    }

    #[test]
    fn test_build_error_includes_log() {
        let err = Error::ProgramBuild {
            op: "clBuildProgram",
            status: Status::BUILD_PROGRAM_FAILURE,
            log: "3:1: error: expected ';'".to_string(),
        };
        let text = err.to_string();
        assert!(text.starts_with("clBuildProgram failed: CL_BUILD_PROGRAM_FAILURE"));
        assert!(text.contains("expected ';'"));
        assert_eq!(err.build_log(), Some("3:1: error: expected ';'"));
    }

    #[test]
    fn test_transfer_error_names_direction() {
        let err = Error::Transfer {
            direction: Direction::DeviceToHost,
            op: "clEnqueueReadBuffer",
            status: Status::INVALID_MEM_OBJECT,
        };
        assert!(err.to_string().starts_with("device-to-host transfer failed"));
    }
}
