#![warn(missing_docs)]
//! Device-facing traits and resource descriptors for the Buffer
//! Uploads transfer engine.
//!
//! This plays the role `gfx-hal` plays in the wider workspace: a
//! thin, backend-agnostic contract that a real graphics API implements
//! and that the engine (here, the `buffer-uploads` crate) consumes. It
//! does not implement a real GPU backend — that is out of scope for
//! Buffer Uploads.

pub mod desc;
pub mod device;
pub mod error;
pub mod format;

pub use desc::*;
pub use device::*;
pub use error::DeviceError;
pub use format::Format;
