//! Error types for hvcore.

use thiserror::Error;

/// Result type alias using hvcore's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur when managing a virtual machine.
///
/// Variants carrying an `i32` hold the native return code reported by the
/// hypervisor backend, unchanged.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    // Platform errors
    #[error("hypervisor is not supported on this system")]
    HypervisorNotSupported,

    #[error("insufficient system resources")]
    InsufficientResources,

    #[error("permission denied - check virtualization settings")]
    PermissionDenied,

    // VM lifecycle errors
    #[error("virtual machine not created")]
    VmNotCreated,

    #[error("failed to create VM (error: {0:#x})")]
    VmCreationFailed(i32),

    #[error("virtual machine is already running")]
    VmAlreadyRunning,

    #[error("virtual machine is not running")]
    VmNotRunning,

    // Memory errors
    #[error("failed to map memory (error: {0:#x})")]
    MemoryMappingFailed(i32),

    #[error("failed to unmap memory (error: {0:#x})")]
    MemoryUnmappingFailed(i32),

    #[error("invalid memory address")]
    InvalidAddress,

    #[error("buffer size is too small")]
    BufferTooSmall,

    #[error("invalid allocation size")]
    InvalidSize,

    #[error("failed to allocate memory")]
    AllocationFailed,

    #[error("guest memory region overlaps an existing mapping")]
    RegionOverlap,

    #[error("no memory region starts at the given guest address")]
    RegionNotFound,

    // vCPU errors
    #[error("vCPU not created")]
    VcpuNotCreated,

    #[error("failed to create vCPU (error: {0:#x})")]
    VcpuCreationFailed(i32),

    #[error("vCPU execution failed (error: {0:#x})")]
    VcpuExecutionFailed(i32),

    #[error("vCPU is already running")]
    VcpuAlreadyRunning,

    #[error("failed to read register (error: {0:#x})")]
    RegisterReadFailed(i32),

    #[error("failed to write register (error: {0:#x})")]
    RegisterWriteFailed(i32),

    // Architecture errors
    #[error("architecture not supported")]
    ArchitectureNotSupported,

    #[error("instruction not supported")]
    InstructionNotSupported,
}

impl Error {
    /// Numeric code for this error.
    ///
    /// Backend failures return the backend's own code; locally detected
    /// errors use fixed negative codes grouped by origin.
    pub fn code(&self) -> i32 {
        match self {
            Error::HypervisorNotSupported => -1000,
            Error::InsufficientResources => -1001,
            Error::PermissionDenied => -1002,

            Error::VmNotCreated => -2000,
            Error::VmAlreadyRunning => -2001,
            Error::VmNotRunning => -2002,
            Error::VmCreationFailed(code) => *code,

            Error::InvalidAddress => -3000,
            Error::BufferTooSmall => -3001,
            Error::AllocationFailed => -3002,
            Error::InvalidSize => -3003,
            Error::RegionOverlap => -3004,
            Error::RegionNotFound => -3005,
            Error::MemoryMappingFailed(code) | Error::MemoryUnmappingFailed(code) => *code,

            Error::VcpuNotCreated => -4000,
            Error::VcpuAlreadyRunning => -4001,
            Error::VcpuCreationFailed(code)
            | Error::VcpuExecutionFailed(code)
            | Error::RegisterReadFailed(code)
            | Error::RegisterWriteFailed(code) => *code,

            Error::ArchitectureNotSupported => -5000,
            Error::InstructionNotSupported => -5001,
        }
    }

    /// Whether the caller may retry the operation with adjusted parameters.
    ///
    /// Only memory errors are recoverable this way. `VcpuAlreadyRunning` is an
    /// exclusivity signal and is never reported as retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::MemoryMappingFailed(_)
                | Error::MemoryUnmappingFailed(_)
                | Error::InvalidAddress
                | Error::BufferTooSmall
                | Error::InvalidSize
                | Error::AllocationFailed
                | Error::RegionOverlap
                | Error::RegionNotFound
        )
    }

    /// Whether the error carries a native backend return code.
    pub fn backend_code(&self) -> Option<i32> {
        match self {
            Error::VmCreationFailed(code)
            | Error::MemoryMappingFailed(code)
            | Error::MemoryUnmappingFailed(code)
            | Error::VcpuCreationFailed(code)
            | Error::VcpuExecutionFailed(code)
            | Error::RegisterReadFailed(code)
            | Error::RegisterWriteFailed(code) => Some(*code),
            _ => None,
        }
    }
}
