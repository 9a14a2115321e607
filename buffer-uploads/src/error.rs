//! Error kinds.

use thiserror::Error;

/// Errors raised by [`crate::heap::SpanningHeap`].
#[derive(Error, Clone, Copy, Debug, Eq, PartialEq)]
pub enum HeapError {
    /// `Allocate` could not find a fitting free block and the caller
    /// requested no growth.
    #[error("heap exhausted: no free block large enough")]
    HeapExhausted,
}

/// Errors raised by [`crate::locator::ResourceLocator`].
#[derive(Error, Clone, Debug, Eq, PartialEq)]
pub enum LocatorError {
    /// A whole-resource view (e.g. texture view) was requested from a
    /// sub-range locator.
    #[error("a partial resource locator cannot be viewed as a whole resource")]
    PartialResourceNotAViewable,
}

/// Errors surfaced on a [`crate::transaction::Transaction`]'s promise.
#[derive(Error, Clone, Debug)]
pub enum TransactionError {
    /// The client released its last reference before a step executed.
    #[error("aborted because client references were released")]
    Aborted,
    /// The transaction table (temporary or long-term) is full.
    #[error("transaction table exhausted")]
    TableExhausted,
    /// A step queue-set was full and the step could not be enqueued.
    #[error("queue set is full")]
    QueueFull,
    /// The async data source's future failed.
    #[error("async data source failed: {0}")]
    AsyncSourceFailed(String),
    /// The device was lost while the transaction was in flight.
    #[error("device lost")]
    DeviceLost,
    /// The underlying device reported an error while servicing a step.
    #[error("device error: {0}")]
    Device(#[from] buffer_uploads_device::DeviceError),
}
