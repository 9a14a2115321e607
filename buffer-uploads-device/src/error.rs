//! Device-boundary error types.

use thiserror::Error;

/// Errors the device collaborator can report back across the trait
/// boundary.
#[derive(Error, Clone, Debug, Eq, PartialEq)]
pub enum DeviceError {
    #[error("out of device memory")]
    OutOfDeviceMemory,
    #[error("out of host memory")]
    OutOfHostMemory,
    #[error("the device was lost")]
    DeviceLost,
    #[error("resource map failed: {0}")]
    MapFailed(String),
    #[error("unsupported resource description: {0}")]
    Unsupported(String),
}
