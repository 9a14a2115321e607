//! [`AssemblyLine`]: the transaction tables plus the bounded
//! step queue-set a background worker drains.
//!
//! Five lanes make up a queue-set: one `Main` lane serviced only when
//! every priority lane is empty, and four `FramePriority` lanes
//! (0 = most urgent) so a transaction the renderer is about to block
//! on can jump ahead of routine background streaming.
//!
//! A step's target resource is not created until [`AssemblyLine::process`]
//! actually dequeues it — creating it any earlier would charge a
//! device allocation to a transaction that gets cancelled before the
//! worker ever gets to it. An async-sourced step's `prepare_data` is
//! likewise never awaited on the worker thread itself: it is handed to
//! a short-lived background thread, which hands the resolved bytes
//! back over the `resolved` channel for the worker to map and copy.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use buffer_uploads_device::{CommandListId, Device, DeviceError, MapMode, ResourceDesc};
use parking_lot::Mutex;

use crate::error::TransactionError;
use crate::locator::ResourceLocator;
use crate::metrics::AssemblyLineMetrics;
use crate::packet::DataPacket;
use crate::transaction::{TransactionFuture, TransactionId, TransactionTable};
use crate::SubResourceData;

/// Number of `FramePriority` lanes, independent of the always-present
/// `Main` lane.
pub const FRAME_PRIORITY_LANE_COUNT: usize = 4;

/// Which lane a step is enqueued onto.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Lane {
    /// Background streaming; only serviced once every priority lane is empty.
    Main,
    /// `0` is the most urgent; must be `< FRAME_PRIORITY_LANE_COUNT`.
    FramePriority(u8),
}

impl Lane {
    fn index(self) -> usize {
        match self {
            Lane::Main => 0,
            Lane::FramePriority(p) => {
                assert!((p as usize) < FRAME_PRIORITY_LANE_COUNT);
                1 + p as usize
            }
        }
    }
}

/// One queued unit of work: once a target resource for `desc` is
/// created, write `packet`'s bytes into it and let `transaction`
/// resolve once the containing command list commits. The target is
/// not created until [`AssemblyLine::process`] actually dequeues this,
/// so a transaction cancelled while still queued never costs an
/// allocation.
pub struct UploadStep {
    /// Which transaction this step belongs to.
    pub transaction: TransactionId,
    /// The shape of the resource to create (or reuse from a pool/batch)
    /// once this step is dequeued.
    pub desc: ResourceDesc,
    /// The data to write.
    pub packet: DataPacket,
}

/// A step whose async source has finished producing its bytes on a
/// background thread, waiting for the worker to map and copy them.
struct ResolvedStep {
    transaction: TransactionId,
    desc: ResourceDesc,
    parts: Vec<SubResourceData>,
}

struct QueueSet {
    lanes: Vec<(
        crossbeam_channel::Sender<UploadStep>,
        crossbeam_channel::Receiver<UploadStep>,
    )>,
    steps_dropped: AtomicU32,
    queued_bytes: AtomicU64,
}

impl QueueSet {
    fn new(capacity_per_lane: usize) -> Self {
        let lanes = (0..1 + FRAME_PRIORITY_LANE_COUNT)
            .map(|_| crossbeam_channel::bounded(capacity_per_lane))
            .collect();
        QueueSet {
            lanes,
            steps_dropped: AtomicU32::new(0),
            queued_bytes: AtomicU64::new(0),
        }
    }

    fn enqueue(&self, lane: Lane, step: UploadStep) -> Result<(), TransactionError> {
        let bytes = step.packet.queued_byte_len();
        self.lanes[lane.index()].0.try_send(step).map_err(|_| {
            self.steps_dropped.fetch_add(1, Ordering::Relaxed);
            TransactionError::QueueFull
        })?;
        self.queued_bytes.fetch_add(bytes, Ordering::Relaxed);
        Ok(())
    }

    /// Highest-priority lane first, `Main` last.
    fn try_pop_any(&self) -> Option<UploadStep> {
        for (_, rx) in self.lanes.iter().skip(1).chain(self.lanes.iter().take(1)) {
            if let Ok(step) = rx.try_recv() {
                self.queued_bytes
                    .fetch_sub(step.packet.queued_byte_len(), Ordering::Relaxed);
                return Some(step);
            }
        }
        None
    }

    fn queued_len(&self) -> usize {
        self.lanes.iter().map(|(_, rx)| rx.len()).sum()
    }
}

/// Caps how much work [`AssemblyLine::process`] drains in one pass, so
/// a backlog of queued steps can't stall the frame it's called from.
#[derive(Clone, Copy, Debug)]
pub struct CommandListBudget {
    /// Stop pulling more steps once this many bytes have been written.
    pub max_bytes_per_commit: u64,
    /// Stop pulling more steps once this many have been processed.
    pub max_steps_per_commit: u32,
    /// If `false`, the loading-screen case: ignore the byte budget and
    /// drain everything queued (the original had a flagged bug here
    /// where this path was silently skipped; it is honored here).
    pub is_loading: bool,
}

/// Owns the temporary and long-term transaction tables and the step
/// queue-set the worker thread drains.
pub struct AssemblyLine<D: Device> {
    temporary: Mutex<TransactionTable<D::Resource>>,
    long_term: Mutex<TransactionTable<D::Resource>>,
    queue: QueueSet,
    resolved_tx: crossbeam_channel::Sender<ResolvedStep>,
    resolved_rx: crossbeam_channel::Receiver<ResolvedStep>,
    /// Cycled once per [`crate::manager::Manager::frame_priority_barrier`]
    /// call, wrapping every `FRAME_PRIORITY_LANE_COUNT` flips. Read by
    /// [`Self::writing_queue_set`].
    writing_queue_set: AtomicU32,
    self_weak: Weak<Self>,
}

impl<D: Device> AssemblyLine<D> {
    /// `queue_capacity` bounds each of the five lanes independently.
    pub fn new(
        temp_initial_slots: u32,
        temp_growth_slots: u32,
        long_term_initial_slots: u32,
        long_term_growth_slots: u32,
        queue_capacity: usize,
    ) -> Arc<Self> {
        let (resolved_tx, resolved_rx) = crossbeam_channel::unbounded();
        Arc::new_cyclic(|weak| AssemblyLine {
            temporary: Mutex::new(TransactionTable::new(temp_initial_slots, temp_growth_slots, false)),
            long_term: Mutex::new(TransactionTable::new(long_term_initial_slots, long_term_growth_slots, true)),
            queue: QueueSet::new(queue_capacity),
            resolved_tx,
            resolved_rx,
            writing_queue_set: AtomicU32::new(0),
            self_weak: weak.clone(),
        })
    }

    fn table(&self, id: TransactionId) -> &Mutex<TransactionTable<D::Resource>> {
        if id.is_long_term() {
            &self.long_term
        } else {
            &self.temporary
        }
    }

    /// Reserve a transaction slot. `long_term` transactions survive
    /// across frame boundaries (e.g. a streaming texture); ordinary
    /// ones are expected to resolve within a few frames.
    pub fn begin_transaction(
        &self,
        desc: ResourceDesc,
        long_term: bool,
    ) -> Result<(TransactionId, TransactionFuture<D::Resource>), TransactionError> {
        if long_term {
            self.long_term.lock().allocate(desc)
        } else {
            self.temporary.lock().allocate(desc)
        }
    }

    /// Reserve a transaction slot whose resource shape isn't known yet
    /// — an async source's `get_desc` hasn't resolved. Fill it in with
    /// [`Self::set_transaction_desc`] once it does.
    pub fn begin_transaction_pending(
        &self,
        long_term: bool,
    ) -> Result<(TransactionId, TransactionFuture<D::Resource>), TransactionError> {
        if long_term {
            self.long_term.lock().allocate_pending()
        } else {
            self.temporary.lock().allocate_pending()
        }
    }

    /// Fill in the resource shape for a transaction started with
    /// [`Self::begin_transaction_pending`].
    pub fn set_transaction_desc(&self, id: TransactionId, desc: ResourceDesc) {
        self.table(id).lock().set_desc(id, desc);
    }

    /// Resolve a pending transaction's promise with `error` without
    /// ever having enqueued a step for it, e.g. because its source's
    /// `get_desc` future itself failed.
    pub fn fail_pending_transaction(&self, id: TransactionId, error: TransactionError) {
        if let Some(txn) = self.table(id).lock().get(id) {
            txn.complete(Err(error));
        }
    }

    /// Queue a step onto `lane`. Registers an extra system reference so
    /// the transaction's slot survives even if every client handle is
    /// dropped before the worker thread gets to it.
    pub fn enqueue_step(&self, lane: Lane, step: UploadStep) -> Result<(), TransactionError> {
        self.table(step.transaction).lock().add_system_ref(step.transaction);
        let transaction = step.transaction;
        let result = self.queue.enqueue(lane, step);
        if result.is_err() {
            self.table(transaction).lock().release_system_ref(transaction);
        }
        result
    }

    /// Balance a client handle's reference (called from
    /// `TransactionMarker`'s `Drop`).
    pub fn release_client_ref(&self, id: TransactionId) {
        self.table(id).lock().release_client_ref(id);
    }

    /// Cancel a transaction before its queued step has been processed.
    /// Resolves its promise with `Aborted` immediately; the step itself
    /// is skipped (no map/copy, no completion overwrite) once
    /// [`Self::process`] dequeues it.
    pub fn cancel_transaction(&self, id: TransactionId) {
        self.table(id).lock().cancel(id);
    }

    /// `true` if `id` names a live, cancelled transaction.
    pub fn is_cancelled(&self, id: TransactionId) -> bool {
        self.table(id).lock().is_cancelled(id)
    }

    /// The index a frame-priority barrier is currently servicing.
    /// Cycled by [`Self::flip_writing_queue_set`].
    pub fn writing_queue_set(&self) -> u32 {
        self.writing_queue_set.load(Ordering::Acquire)
    }

    /// Advance the writing queue-set index by one, wrapping modulo
    /// [`FRAME_PRIORITY_LANE_COUNT`]. Called once per
    /// `frame_priority_barrier`, so four barriers in quick succession
    /// wrap it back to `0`.
    pub fn flip_writing_queue_set(&self) -> u32 {
        self.writing_queue_set
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| {
                Some((v + 1) % FRAME_PRIORITY_LANE_COUNT as u32)
            })
            .map(|prev| (prev + 1) % FRAME_PRIORITY_LANE_COUNT as u32)
            .expect("closure always returns Some")
    }

    fn apply_part(ctx: &mut crate::thread_context::ThreadContext<D>, target: &ResourceLocator<D::Resource>, part: &SubResourceData) {
        let resource = target.resource();
        if let Ok(mut mapped) = ctx.context_mut().map(&resource, MapMode::WriteDiscard, part.subresource) {
            let offset = target.range().map(|(start, _)| start as usize).unwrap_or(0);
            let n = part.data.len().min(mapped.size.saturating_sub(offset));
            // SAFETY: `mapped` is exclusively ours until `unmap` below.
            unsafe { mapped.as_mut_slice()[offset..offset + n].copy_from_slice(&part.data[..n]) };
            ctx.context_mut().unmap(&resource, part.subresource);
        }
    }

    fn fail_queued_step(&self, transaction: TransactionId, error: DeviceError) {
        if let Some(txn) = self.table(transaction).lock().get(transaction) {
            txn.complete(Err(TransactionError::Device(error)));
        }
        self.table(transaction).lock().release_system_ref(transaction);
    }

    /// Drain queued steps up to `budget`, creating each step's target
    /// resource via `create_target` and mapping its bytes into it, then
    /// resolve and return one command list covering everything
    /// processed this call. Returns `None` if nothing was queued.
    ///
    /// An async-sourced step is dispatched to a background thread
    /// instead of being awaited inline, so a slow `prepare_data` never
    /// stalls this worker thread; its result is picked up from the
    /// `resolved` channel on a later `process` call.
    pub fn process(
        &self,
        ctx: &mut crate::thread_context::ThreadContext<D>,
        budget: &CommandListBudget,
        mut create_target: impl FnMut(&ResourceDesc) -> Result<ResourceLocator<D::Resource>, DeviceError>,
    ) -> Option<CommandListId> {
        let mut processed = 0u32;
        let mut bytes = 0u64;
        let mut completions = Vec::new();

        while let Ok(resolved) = self.resolved_rx.try_recv() {
            if !budget.is_loading && (processed >= budget.max_steps_per_commit || bytes >= budget.max_bytes_per_commit) {
                break;
            }
            if self.table(resolved.transaction).lock().is_cancelled(resolved.transaction) {
                self.table(resolved.transaction).lock().release_system_ref(resolved.transaction);
                continue;
            }
            match create_target(&resolved.desc) {
                Ok(target) => {
                    for part in &resolved.parts {
                        bytes += part.data.len() as u64;
                        Self::apply_part(ctx, &target, part);
                    }
                    completions.push((resolved.transaction, target));
                    processed += 1;
                }
                Err(e) => {
                    self.fail_queued_step(resolved.transaction, e);
                    processed += 1;
                }
            }
        }

        loop {
            if !budget.is_loading && (processed >= budget.max_steps_per_commit || bytes >= budget.max_bytes_per_commit) {
                break;
            }
            let Some(step) = self.queue.try_pop_any() else {
                break;
            };
            if self.table(step.transaction).lock().is_cancelled(step.transaction) {
                self.table(step.transaction).lock().release_system_ref(step.transaction);
                processed += 1;
                continue;
            }
            match step.packet {
                DataPacket::Sync(parts) => match create_target(&step.desc) {
                    Ok(target) => {
                        for part in &parts {
                            bytes += part.data.len() as u64;
                            Self::apply_part(ctx, &target, part);
                        }
                        completions.push((step.transaction, target));
                        processed += 1;
                    }
                    Err(e) => {
                        self.fail_queued_step(step.transaction, e);
                        processed += 1;
                    }
                },
                DataPacket::Async(source) => {
                    let line = self
                        .self_weak
                        .upgrade()
                        .expect("AssemblyLine dispatching an async step must still be alive");
                    let transaction = step.transaction;
                    let desc = step.desc;
                    std::thread::spawn(move || match pollster::block_on(source.prepare_data()) {
                        Ok(parts) => {
                            if line.table(transaction).lock().is_cancelled(transaction) {
                                line.table(transaction).lock().release_system_ref(transaction);
                                return;
                            }
                            let _ = line.resolved_tx.send(ResolvedStep { transaction, desc, parts });
                        }
                        Err(e) => {
                            if let Some(txn) = line.table(transaction).lock().get(transaction) {
                                txn.complete(Err(e));
                            }
                            line.table(transaction).lock().release_system_ref(transaction);
                        }
                    });
                    processed += 1;
                }
            }
        }
        if processed == 0 {
            return None;
        }
        let id = ctx.commit();
        for (transaction, locator) in completions {
            locator.set_completion_command_list(id);
            if let Some(txn) = self.table(transaction).lock().get(transaction) {
                txn.complete(Ok(locator));
            }
            self.table(transaction).lock().release_system_ref(transaction);
        }
        Some(id)
    }

    /// Snapshot worker/table activity for [`crate::manager::Manager::pop_metrics`].
    pub fn metrics(&self) -> AssemblyLineMetrics {
        AssemblyLineMetrics {
            transaction_count: self.temporary.lock().live_count(),
            long_term_transaction_count: self.long_term.lock().live_count(),
            queued_bytes: self.queue.queued_bytes.load(Ordering::Relaxed),
            steps_dropped: self.queue.steps_dropped.swap(0, Ordering::Relaxed),
        }
    }

    /// Approximate number of steps still queued across every lane.
    pub fn queued_step_count(&self) -> usize {
        self.queue.queued_len()
    }

    /// Abort every in-flight transaction and drop the queue. Called
    /// when the device context is lost.
    pub fn on_lost_device(&self) {
        self.temporary.lock().on_lost_device();
        self.long_term.lock().on_lost_device();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use buffer_uploads_device::{Device, LinearBufferDesc, ResourceDesc, ResourceKind, SubResourceId};
    use buffer_uploads_mock::MockDevice;

    fn desc(size: u32) -> ResourceDesc {
        ResourceDesc {
            kind: ResourceKind::LinearBuffer(LinearBufferDesc {
                size_in_bytes: size,
                stride: 0,
            }),
            bind_flags: Default::default(),
            cpu_access: Default::default(),
            gpu_access: Default::default(),
            allocation_rules: Default::default(),
            name: "test".into(),
        }
    }

    fn budget() -> CommandListBudget {
        CommandListBudget {
            max_bytes_per_commit: 1 << 20,
            max_steps_per_commit: 64,
            is_loading: false,
        }
    }

    fn create_target(device: &MockDevice) -> impl FnMut(&ResourceDesc) -> Result<ResourceLocator<<MockDevice as Device>::Resource>, DeviceError> + '_ {
        move |d: &ResourceDesc| device.create_resource(d, None).map(ResourceLocator::whole)
    }

    #[test]
    fn transaction_resolves_to_locator_with_uploaded_bytes() {
        let device = MockDevice::default();
        let line = AssemblyLine::<MockDevice>::new(4, 64, 4, 64, 16);
        let (id, future) = line.begin_transaction(desc(8), false).unwrap();
        line.enqueue_step(
            Lane::Main,
            UploadStep {
                transaction: id,
                desc: desc(8),
                packet: DataPacket::whole_buffer(vec![1, 2, 3, 4, 5, 6, 7, 8]),
            },
        )
        .unwrap();
        line.release_client_ref(id);
        let mut ctx = crate::thread_context::ThreadContext::new(device.create_deferred_context());
        let resolved = line.process(&mut ctx, &budget(), create_target(&device));
        assert!(resolved.is_some());
        let locator = pollster::block_on(future).unwrap();
        assert_eq!(locator.resource().read_back(), vec![1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn frame_priority_lane_drains_before_main() {
        let line = AssemblyLine::<MockDevice>::new(4, 64, 4, 64, 16);
        let (main_id, _mf) = line.begin_transaction(desc(4), false).unwrap();
        let (pri_id, _pf) = line.begin_transaction(desc(4), false).unwrap();
        line.enqueue_step(
            Lane::Main,
            UploadStep {
                transaction: main_id,
                desc: desc(4),
                packet: DataPacket::whole_buffer(vec![0u8; 4]),
            },
        )
        .unwrap();
        line.enqueue_step(
            Lane::FramePriority(0),
            UploadStep {
                transaction: pri_id,
                desc: desc(4),
                packet: DataPacket::whole_buffer(vec![1u8; 4]),
            },
        )
        .unwrap();
        let popped = line.queue.try_pop_any().unwrap();
        assert_eq!(popped.transaction, pri_id);
        line.release_client_ref(main_id);
        line.release_client_ref(pri_id);
        line.table(main_id).lock().release_system_ref(main_id);
    }

    #[test]
    fn cancelled_step_is_skipped_and_resolves_aborted() {
        let device = MockDevice::default();
        let line = AssemblyLine::<MockDevice>::new(4, 64, 4, 64, 16);
        let (id, future) = line.begin_transaction(desc(4), false).unwrap();
        line.enqueue_step(
            Lane::Main,
            UploadStep {
                transaction: id,
                desc: desc(4),
                packet: DataPacket::whole_buffer(vec![9u8; 4]),
            },
        )
        .unwrap();
        line.cancel_transaction(id);
        line.release_client_ref(id);
        let mut ctx = crate::thread_context::ThreadContext::new(device.create_deferred_context());
        line.process(&mut ctx, &budget(), create_target(&device));
        let result = pollster::block_on(future);
        assert!(matches!(result, Err(TransactionError::Aborted)));
    }

    #[test]
    fn queue_full_reports_error_and_counts_a_drop() {
        let line = AssemblyLine::<MockDevice>::new(4, 64, 4, 64, 1);
        let (id, _f) = line.begin_transaction(desc(4), false).unwrap();
        line.enqueue_step(
            Lane::Main,
            UploadStep {
                transaction: id,
                desc: desc(4),
                packet: DataPacket::whole_buffer(vec![0u8; 4]),
            },
        )
        .unwrap();
        let err = line.enqueue_step(
            Lane::Main,
            UploadStep {
                transaction: id,
                desc: desc(4),
                packet: DataPacket::whole_buffer(vec![0u8; 4]),
            },
        );
        assert!(matches!(err, Err(TransactionError::QueueFull)));
        assert_eq!(line.metrics().steps_dropped, 1);
    }

    #[test]
    fn queued_bytes_metric_tracks_enqueue_and_drain() {
        let device = MockDevice::default();
        let line = AssemblyLine::<MockDevice>::new(4, 64, 4, 64, 16);
        let (id, _f) = line.begin_transaction(desc(8), false).unwrap();
        line.enqueue_step(
            Lane::Main,
            UploadStep {
                transaction: id,
                desc: desc(8),
                packet: DataPacket::whole_buffer(vec![1u8; 8]),
            },
        )
        .unwrap();
        assert_eq!(line.metrics().queued_bytes, 8);
        line.release_client_ref(id);
        let mut ctx = crate::thread_context::ThreadContext::new(device.create_deferred_context());
        line.process(&mut ctx, &budget(), create_target(&device));
        assert_eq!(line.metrics().queued_bytes, 0);
    }

    #[test]
    fn flip_writing_queue_set_wraps_after_four_calls() {
        let line = AssemblyLine::<MockDevice>::new(4, 64, 4, 64, 16);
        assert_eq!(line.writing_queue_set(), 0);
        assert_eq!(line.flip_writing_queue_set(), 1);
        assert_eq!(line.flip_writing_queue_set(), 2);
        assert_eq!(line.flip_writing_queue_set(), 3);
        assert_eq!(line.flip_writing_queue_set(), 0);
    }

    #[test]
    fn async_step_resolves_without_blocking_the_caller() {
        use crate::packet::IAsyncDataSource;
        use async_trait::async_trait;

        struct Slow;
        #[async_trait]
        impl IAsyncDataSource for Slow {
            async fn get_desc(&self) -> Result<ResourceDesc, TransactionError> {
                Ok(desc(4))
            }
            async fn prepare_data(&self) -> Result<Vec<SubResourceData>, TransactionError> {
                std::thread::sleep(std::time::Duration::from_millis(200));
                Ok(vec![SubResourceData {
                    subresource: SubResourceId::WHOLE_BUFFER,
                    data: vec![7u8; 4].into(),
                    row_pitch: 0,
                    depth_pitch: 0,
                }])
            }
        }

        let device = MockDevice::default();
        let line = AssemblyLine::<MockDevice>::new(4, 64, 4, 64, 16);
        let (id, future) = line.begin_transaction(desc(4), false).unwrap();
        line.enqueue_step(
            Lane::Main,
            UploadStep {
                transaction: id,
                desc: desc(4),
                packet: DataPacket::Async(Arc::new(Slow)),
            },
        )
        .unwrap();
        line.release_client_ref(id);

        let mut ctx = crate::thread_context::ThreadContext::new(device.create_deferred_context());
        let started = std::time::Instant::now();
        let first_pass = line.process(&mut ctx, &budget(), create_target(&device));
        assert!(started.elapsed() < std::time::Duration::from_millis(100), "dispatching an async step must not block");
        assert!(first_pass.is_none(), "nothing is resolved yet on the first pass");

        std::thread::sleep(std::time::Duration::from_millis(300));
        let second_pass = line.process(&mut ctx, &budget(), create_target(&device));
        assert!(second_pass.is_some());
        let locator = pollster::block_on(future).unwrap();
        assert_eq!(locator.resource().read_back(), vec![7, 7, 7, 7]);
    }
}
