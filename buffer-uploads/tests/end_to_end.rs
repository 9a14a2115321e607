//! End-to-end scenarios exercised through the public API rather than a
//! single module's unit tests, alongside the in-crate `#[cfg(test)]`
//! coverage colocated with each module.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use buffer_uploads::device::{
    BindFlags, Dimensionality, Format, LinearBufferDesc, ResourceDesc, ResourceKind, SubResourceId,
    TextureDesc,
};
use buffer_uploads::{
    BufferUploadsConfig, DataPacket, IAsyncDataSource, Lane, Manager, SubResourceData,
    TransactionError,
};
use buffer_uploads_mock::MockDevice;

fn linear_buffer_desc(size: u32, bind_flags: BindFlags) -> ResourceDesc {
    ResourceDesc {
        kind: ResourceKind::LinearBuffer(LinearBufferDesc {
            size_in_bytes: size,
            stride: 0,
        }),
        bind_flags,
        cpu_access: Default::default(),
        gpu_access: Default::default(),
        allocation_rules: Default::default(),
        name: "vertex-buffer".into(),
    }
}

fn texture_desc(width: u32, height: u32) -> ResourceDesc {
    ResourceDesc {
        kind: ResourceKind::Texture(TextureDesc {
            width,
            height,
            depth: 1,
            format: Format::Rgba8Unorm,
            mip_count: 1,
            array_count: 1,
            samples: 1,
            dimensionality: Dimensionality::Tex2D,
        }),
        bind_flags: Default::default(),
        cpu_access: Default::default(),
        gpu_access: Default::default(),
        allocation_rules: Default::default(),
        name: "texture".into(),
    }
}

/// Scenario 1: a small pooled vertex buffer round-trips its bytes and
/// resolves to a whole-resource locator.
#[test]
fn synchronous_small_buffer_round_trips_and_is_whole_resource() {
    let manager = Manager::new(MockDevice::default(), BufferUploadsConfig::default());
    let bytes: Vec<u8> = (0..1024u32).map(|i| (i % 256) as u8).collect();
    let (id, future) = manager
        .begin_transaction(
            linear_buffer_desc(1024, BindFlags::VERTEX_BUFFER),
            DataPacket::whole_buffer(bytes.clone()),
            false,
            Lane::Main,
        )
        .unwrap();
    manager.frame_priority_barrier();
    manager.release_transaction(id);

    let locator = pollster::block_on(future).unwrap();
    assert!(locator.is_whole());
    assert_eq!(locator.resource().read_back(), bytes);
}

/// Scenario 2: a texture upload carries its pixel pattern through to
/// the device resource. The full staging-resource indirection
/// (`PrepareStaging`/`TransferStagingToFinal`) is not wired into the
/// worker loop yet (see DESIGN.md); this exercises the direct
/// sync-packet path, which is the one actually in service today.
#[test]
fn texture_upload_round_trips_pixel_pattern() {
    let manager = Manager::new(MockDevice::default(), BufferUploadsConfig::default());
    let desc = texture_desc(256, 256);
    let pixel_count = 256 * 256;
    let mut bytes = Vec::with_capacity(pixel_count * 4);
    for _ in 0..pixel_count {
        bytes.extend_from_slice(&[0xff, 0x7f, 0xff, 0x7f]);
    }
    let packet = DataPacket::Sync(vec![SubResourceData {
        subresource: SubResourceId::WHOLE_BUFFER,
        data: bytes.clone().into(),
        row_pitch: 256 * 4,
        depth_pitch: 0,
    }]);
    let (id, future) = manager
        .begin_transaction(desc, packet, false, Lane::Main)
        .unwrap();
    manager.frame_priority_barrier();
    manager.release_transaction(id);

    let locator = pollster::block_on(future).unwrap();
    let read_back = locator.resource().read_back();
    assert_eq!(read_back.len(), bytes.len());
    assert!(read_back.chunks_exact(4).all(|px| px == [0xff, 0x7f, 0xff, 0x7f]));
}

/// Scenario 6: cancelling a transaction before the worker thread
/// drains its step resolves the promise as aborted and releases the
/// queued step without touching the target resource.
#[test]
fn cancel_while_queued_resolves_aborted_without_uploading() {
    let manager = Manager::new(MockDevice::default(), BufferUploadsConfig::default());
    let (id, future) = manager
        .begin_transaction(
            linear_buffer_desc(256, BindFlags::SHADER_RESOURCE),
            DataPacket::whole_buffer(vec![0xAAu8; 256]),
            false,
            Lane::Main,
        )
        .unwrap();

    manager.cancel_transaction(id);
    manager.release_transaction(id);
    manager.frame_priority_barrier();

    let result = pollster::block_on(future);
    assert!(matches!(result, Err(TransactionError::Aborted)));
}

struct DelayedSource {
    desc_delay: Duration,
    data_delay: Duration,
    subresource: SubResourceId,
    word: u8,
    byte_len: usize,
}

#[async_trait]
impl IAsyncDataSource for DelayedSource {
    async fn get_desc(&self) -> Result<ResourceDesc, TransactionError> {
        std::thread::sleep(self.desc_delay);
        Ok(texture_desc(256, 256))
    }

    async fn prepare_data(&self) -> Result<Vec<SubResourceData>, TransactionError> {
        std::thread::sleep(self.data_delay);
        Ok(vec![SubResourceData {
            subresource: self.subresource,
            data: vec![self.word; self.byte_len].into(),
            row_pitch: 0,
            depth_pitch: 0,
        }])
    }
}

/// Scenario 3: an async data source whose bytes aren't ready for 1.5s
/// still resolves the transaction within a 5s wall-clock budget.
/// Ignored by default since it burns real wall-clock time.
#[test]
#[ignore]
fn async_data_source_resolves_within_wall_clock_budget() {
    let manager = Manager::new(MockDevice::default(), BufferUploadsConfig::default());
    let source = Arc::new(DelayedSource {
        desc_delay: Duration::from_millis(500),
        data_delay: Duration::from_millis(1500),
        subresource: SubResourceId::WHOLE_BUFFER,
        word: 0x42,
        byte_len: 256 * 256 * 4,
    });
    let started = Instant::now();
    let (id, future) = manager
        .begin_transaction_from_source(source, false, Lane::Main)
        .unwrap();
    manager.frame_priority_barrier();
    manager.release_transaction(id);

    let locator = pollster::block_on(future).unwrap();
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(locator.resource().read_back().iter().all(|&b| b == 0x42));
}

/// Scenario 4: a steady-state thrash of batched allocations completes
/// without the prototype count growing unbounded. Exercises
/// `BatchedResources` directly (`Manager` drives the same type through
/// its own bucket registry; see `small_index_buffer_is_batched_and_shares_a_prototype`
/// in `manager.rs` for that path). Ignored by default: it is a
/// thrash-duration run, not a quick check.
#[test]
#[ignore]
fn batched_thrash_keeps_prototype_count_bounded() {
    use buffer_uploads::batched::BatchedResources;

    let device = MockDevice::default();
    let prototype = linear_buffer_desc(64 << 10, BindFlags::INDEX_BUFFER);
    let batched = BatchedResources::<MockDevice>::new(prototype, 16, 0.5);

    let mut live = Vec::new();
    let mut seed = 0x1234_5678u32;
    for i in 0..384u32 {
        seed = seed.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
        let size = 8 * 1024 + (seed % (56 * 1024));
        let size = size & !15; // keep it quantum-aligned
        let locator = batched.allocate(&device, size).unwrap().unwrap();
        live.push(locator);
        if i % 3 == 0 && !live.is_empty() {
            live.remove((seed as usize) % live.len());
        }
    }
    assert!(batched.heap_count() < 384, "every allocation got its own prototype");
}

/// Scenario 5: releasing half of a batch of sub-allocations leaves the
/// heap fragmented; running the defrag protocol once compacts it, fresh
/// allocations against the compacted heap round-trip their bytes
/// correctly, and locators captured before the defrag migrate to the
/// compacted resource rather than being left pointing at the evicted one.
/// Ignored by default: many release/allocate cycles.
#[test]
#[ignore]
fn defrag_correctness_compacts_heap_and_stays_usable() {
    use buffer_uploads::batched::BatchedResources;
    use buffer_uploads_device::{DeviceContext, MapMode};

    let device = MockDevice::default();
    let prototype = linear_buffer_desc(256 << 10, BindFlags::VERTEX_BUFFER);
    let batched = BatchedResources::<MockDevice>::new(prototype, 16, 0.0);

    let mut live = Vec::new();
    for _ in 0..100u32 {
        live.push(batched.allocate(&device, 64).unwrap().unwrap());
    }

    let mut seed = 0xdead_beefu32;
    let mut released = 0;
    live.retain(|_| {
        seed = seed.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
        let keep = !(seed % 2 == 0 && released < 50);
        if !keep {
            released += 1;
        }
        keep
    });
    assert_eq!(released, 50);

    let plan = batched
        .begin_defrag(&device, 0)
        .unwrap()
        .expect("releasing half of 100 allocations must leave room to compact");
    assert!(!plan.steps.is_empty());
    let old_resource = live[0].resource();
    let mut ctx = device.create_deferred_context();
    batched.record_defrag_copy(&mut ctx, &plan, &old_resource);
    batched.commit_defrag(plan);
    assert!(!batched.heap_wants_defrag(0));

    // Space reclaimed by the compaction is usable by fresh allocations.
    let fresh = batched.allocate(&device, 2048).unwrap().unwrap();
    assert_eq!(
        live[0].resource(),
        fresh.resource(),
        "a locator captured before the defrag must migrate to the compacted resource"
    );
    let (start, end) = fresh.range().unwrap();
    let mut mapped = ctx
        .map(&fresh.resource(), MapMode::WriteDiscard, SubResourceId::WHOLE_BUFFER)
        .unwrap();
    // SAFETY: exclusive access via a context with no concurrent readers.
    unsafe { mapped.as_mut_slice()[start as usize..end as usize].fill(0x7A) };
    ctx.unmap(&fresh.resource(), SubResourceId::WHOLE_BUFFER);
    let bytes = fresh.resource().read_back();
    assert!(bytes[start as usize..end as usize].iter().all(|&b| b == 0x7A));
}
