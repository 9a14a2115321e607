//! [`DataPacket`]: what a transaction copies into a device resource.
//! Either the bytes are already in hand (`Sync`), or
//! they are produced by an [`IAsyncDataSource`] future that the
//! assembly line polls to completion before the copy step can run.

use std::sync::Arc;

use async_trait::async_trait;
use buffer_uploads_device::{ResourceDesc, SubResourceId};

use crate::error::TransactionError;

/// One subresource's worth of bytes and the pitch the device should
/// interpret them with.
#[derive(Clone, Debug)]
pub struct SubResourceData {
    /// The subresource this data belongs to.
    pub subresource: SubResourceId,
    /// Packed byte contents, row-major.
    pub data: Arc<[u8]>,
    /// Bytes per row. `0` for linear buffers (no rows).
    pub row_pitch: u32,
    /// Bytes per depth slice. `0` for 2D resources.
    pub depth_pitch: u32,
}

/// A data source whose contents are not ready yet — produced on
/// another thread (decompression, disk I/O, procedural generation) and
/// delivered through a future. Requires that
/// an upload can be enqueued before its data exists.
#[async_trait]
pub trait IAsyncDataSource: Send + Sync {
    /// Describe the resource this source will eventually fill, without
    /// blocking on the data itself. Lets
    /// [`crate::manager::Manager::begin_transaction_from_source`] start
    /// a transaction before the final shape is known, e.g. a compressed
    /// texture whose dimensions only become available once its header
    /// has been parsed.
    async fn get_desc(&self) -> Result<ResourceDesc, TransactionError>;

    /// Produce the actual bytes. Called once the assembly line is
    /// ready to copy; may block the calling (background) thread.
    async fn prepare_data(&self) -> Result<Vec<SubResourceData>, TransactionError>;
}

/// The payload a transaction carries: either data the caller already
/// has, or a source that will produce it asynchronously.
pub enum DataPacket {
    /// Bytes are ready now.
    Sync(Vec<SubResourceData>),
    /// Bytes will be ready later; polled by the worker thread.
    Async(Arc<dyn IAsyncDataSource>),
}

impl DataPacket {
    /// Wrap a single whole-buffer payload with no subresource structure.
    pub fn whole_buffer(bytes: impl Into<Arc<[u8]>>) -> DataPacket {
        DataPacket::Sync(vec![SubResourceData {
            subresource: SubResourceId::WHOLE_BUFFER,
            data: bytes.into(),
            row_pitch: 0,
            depth_pitch: 0,
        }])
    }

    /// `true` if this packet needs no asynchronous wait before its
    /// bytes are available.
    pub fn is_ready(&self) -> bool {
        matches!(self, DataPacket::Sync(_))
    }

    /// Bytes this packet will add to the queue once enqueued. `0` for
    /// an async source, since its length is unknown until `prepare_data`
    /// resolves.
    pub fn queued_byte_len(&self) -> u64 {
        match self {
            DataPacket::Sync(parts) => parts.iter().map(|p| p.data.len() as u64).sum(),
            DataPacket::Async(_) => 0,
        }
    }
}

impl std::fmt::Debug for DataPacket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DataPacket::Sync(parts) => f.debug_tuple("Sync").field(&parts.len()).finish(),
            DataPacket::Async(_) => f.write_str("Async(..)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct ImmediateSource(Vec<u8>);

    #[async_trait]
    impl IAsyncDataSource for ImmediateSource {
        async fn get_desc(&self) -> Result<ResourceDesc, TransactionError> {
            use buffer_uploads_device::{LinearBufferDesc, ResourceKind};
            Ok(ResourceDesc {
                kind: ResourceKind::LinearBuffer(LinearBufferDesc {
                    size_in_bytes: self.0.len() as u32,
                    stride: 0,
                }),
                bind_flags: Default::default(),
                cpu_access: Default::default(),
                gpu_access: Default::default(),
                allocation_rules: Default::default(),
                name: "immediate-source".into(),
            })
        }

        async fn prepare_data(&self) -> Result<Vec<SubResourceData>, TransactionError> {
            Ok(vec![SubResourceData {
                subresource: SubResourceId::WHOLE_BUFFER,
                data: self.0.clone().into(),
                row_pitch: 0,
                depth_pitch: 0,
            }])
        }
    }

    #[test]
    fn whole_buffer_packet_is_ready() {
        let packet = DataPacket::whole_buffer(vec![1u8, 2, 3]);
        assert!(packet.is_ready());
    }

    #[test]
    fn sync_packet_reports_its_byte_length_async_reports_zero() {
        let sync = DataPacket::whole_buffer(vec![1u8, 2, 3]);
        assert_eq!(sync.queued_byte_len(), 3);
        let source = Arc::new(ImmediateSource(vec![0u8; 10]));
        let async_packet = DataPacket::Async(source);
        assert_eq!(async_packet.queued_byte_len(), 0);
    }

    #[test]
    fn async_packet_resolves_to_expected_bytes() {
        let source = Arc::new(ImmediateSource(vec![9, 9, 9]));
        let packet = DataPacket::Async(source.clone());
        assert!(!packet.is_ready());
        let data = pollster::block_on(source.prepare_data()).unwrap();
        assert_eq!(&*data[0].data, &[9, 9, 9]);
    }
}
