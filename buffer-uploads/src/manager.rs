//! [`Manager`]: the front-end coordinator clients actually talk to —
//! owns the assembly line, the resource pool, the batched-allocation
//! buckets, and the background worker thread that drains queued uploads.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

use buffer_uploads_device::{Device, DeviceError, ResourceDesc, ResourceKind};
use parking_lot::{Condvar, Mutex};

use crate::assembly_line::{AssemblyLine, CommandListBudget, Lane, UploadStep};
use crate::batched::{BatchedResources, BucketKey};
use crate::config::BufferUploadsConfig;
use crate::error::TransactionError;
use crate::locator::ResourceLocator;
use crate::metrics::{BatchingSystemMetrics, PoolSystemMetrics};
use crate::packet::{DataPacket, IAsyncDataSource};
use crate::pool::{self, ResourcesPool};
use crate::resource_source::{route, RoutingDecision};
use crate::thread_context::ThreadContext;
use crate::transaction::{TransactionFuture, TransactionId};

/// A condvar-backed wakeup, coalesced so repeated `notify` calls
/// between wakeups collapse into a single wait return instead of
/// queueing up.
struct WakeEvent {
    pending: Mutex<bool>,
    condvar: Condvar,
}

impl WakeEvent {
    fn new() -> Self {
        WakeEvent {
            pending: Mutex::new(false),
            condvar: Condvar::new(),
        }
    }

    fn notify(&self) {
        let mut pending = self.pending.lock();
        *pending = true;
        self.condvar.notify_one();
    }

    fn wait_timeout(&self, timeout: Duration) {
        let mut pending = self.pending.lock();
        if !*pending {
            self.condvar.wait_for(&mut pending, timeout);
        }
        *pending = false;
    }
}

/// The coordinator a client constructs once and calls into every
/// frame: `begin_transaction` to kick off an upload, `update` to
/// publish whatever the worker thread has finished, and
/// `frame_priority_barrier` to drain everything before a point the
/// caller cannot proceed past (e.g. a synchronous readback).
pub struct Manager<D: Device> {
    device: D,
    assembly_line: Arc<AssemblyLine<D>>,
    pool: Arc<ResourcesPool<D::Resource>>,
    batched_buckets: Mutex<HashMap<BucketKey, Arc<BatchedResources<D>>>>,
    config: BufferUploadsConfig,
    ctx: Mutex<ThreadContext<D>>,
    wake: Arc<WakeEvent>,
    stop: Arc<AtomicBool>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
    /// Upgraded by [`Self::spawn_worker`] and
    /// [`Self::begin_transaction_from_source`] so those can hand an
    /// owned `Arc<Self>` to a spawned thread without a `self: &Arc<Self>`
    /// receiver (not valid on stable Rust for a non-`Self` smart pointer).
    self_weak: Weak<Self>,
}

impl<D: Device + Send + Sync + 'static> Manager<D>
where
    D::Context: Send,
{
    /// Build the manager and start its background worker thread.
    pub fn new(device: D, config: BufferUploadsConfig) -> Arc<Self> {
        let config = config.clamp_to(device.platform_caps());
        let assembly_line = AssemblyLine::new(
            config.temporary_table_initial_slots,
            config.temporary_table_growth_slots,
            config.long_term_table_initial_slots,
            config.long_term_table_growth_slots,
            config.queue_capacity_per_lane,
        );
        let ctx = ThreadContext::new(device.create_deferred_context());
        let pool = Arc::new(ResourcesPool::new(config.pool_retain_frames));
        let manager = Arc::new_cyclic(|weak| Manager {
            device,
            assembly_line,
            pool,
            batched_buckets: Mutex::new(HashMap::new()),
            config,
            ctx: Mutex::new(ctx),
            wake: Arc::new(WakeEvent::new()),
            stop: Arc::new(AtomicBool::new(false)),
            worker: Mutex::new(None),
            self_weak: weak.clone(),
        });
        manager.spawn_worker();
        manager
    }

    fn spawn_worker(&self) {
        let manager = self
            .self_weak
            .upgrade()
            .expect("Manager must still be alive to spawn its worker thread");
        let handle = thread::spawn(move || manager.worker_loop());
        *self.worker.lock() = Some(handle);
    }

    fn worker_loop(&self) {
        let budget = CommandListBudget {
            max_bytes_per_commit: self.config.command_list_byte_budget,
            max_steps_per_commit: self.config.command_list_step_budget,
            is_loading: false,
        };
        while !self.stop.load(Ordering::Acquire) {
            self.wake.wait_timeout(Duration::from_millis(16));
            let mut ctx = self.ctx.lock();
            self.assembly_line.process(&mut ctx, &budget, |desc| self.create_target(desc));
        }
    }

    fn batched_prototype_desc(&self, desc: &ResourceDesc) -> ResourceDesc {
        let mut proto = desc.clone();
        if let ResourceKind::LinearBuffer(buf) = &mut proto.kind {
            buf.size_in_bytes = self.config.batched_prototype_size;
        }
        proto.name = "batched-prototype".into();
        proto
    }

    fn batched_bucket(&self, desc: &ResourceDesc) -> Arc<BatchedResources<D>> {
        let key = BucketKey::of(desc);
        self.batched_buckets
            .lock()
            .entry(key)
            .or_insert_with(|| {
                BatchedResources::new(
                    self.batched_prototype_desc(desc),
                    self.config.batched_quantum,
                    self.config.batched_fragmentation_threshold,
                )
            })
            .clone()
    }

    /// Wrap a pooled resource in a locator that returns it to
    /// `self.pool` once the caller's last clone is dropped, rather than
    /// leaking it until the next `on_lost_device`.
    fn pooled_locator(&self, desc: ResourceDesc, resource: D::Resource) -> ResourceLocator<D::Resource> {
        let pool = self.pool.clone();
        ResourceLocator::whole_with_release(
            resource,
            Arc::new(move |r: &D::Resource| pool.return_to_pool(desc.clone(), r.clone())),
        )
    }

    fn create_pooled(&self, desc: &ResourceDesc) -> Result<ResourceLocator<D::Resource>, DeviceError> {
        if let Some(resource) = self.pool.create_resource(desc) {
            return Ok(self.pooled_locator(desc.clone(), resource));
        }
        let resource = self.device.create_resource(desc, None)?;
        Ok(self.pooled_locator(desc.clone(), resource))
    }

    /// Create (or reuse) the target resource for `desc`, routed through
    /// pooling/batching policy. Called from the worker thread only,
    /// once a queued step is actually about to be serviced — never at
    /// `begin_transaction` time, so a transaction cancelled while still
    /// queued never costs an allocation.
    fn create_target(&self, desc: &ResourceDesc) -> Result<ResourceLocator<D::Resource>, DeviceError> {
        match route(desc) {
            RoutingDecision::Direct => {
                let resource = self.device.create_resource(desc, None)?;
                Ok(ResourceLocator::whole(resource))
            }
            RoutingDecision::Pooled => {
                let normalized = pool::normalize(desc);
                self.create_pooled(&normalized)
            }
            RoutingDecision::PooledAndBatched => {
                let normalized = pool::normalize(desc);
                let bucket = self.batched_bucket(&normalized);
                if let Some(locator) = bucket.allocate(&self.device, normalized.byte_count())? {
                    return Ok(locator);
                }
                self.create_pooled(&normalized)
            }
        }
    }

    /// Reserve a transaction slot and enqueue its upload step. The
    /// target resource is not created until the worker thread actually
    /// dequeues the step — see [`Self::create_target`]. Wakes the
    /// worker thread immediately.
    pub fn begin_transaction(
        &self,
        desc: ResourceDesc,
        packet: DataPacket,
        long_term: bool,
        lane: Lane,
    ) -> Result<(TransactionId, TransactionFuture<D::Resource>), TransactionError> {
        let (id, future) = self.assembly_line.begin_transaction(desc.clone(), long_term)?;
        self.assembly_line.enqueue_step(lane, UploadStep { transaction: id, desc, packet })?;
        self.wake.notify();
        Ok((id, future))
    }

    /// Reserve a transaction from an [`IAsyncDataSource`] whose resource
    /// shape is not known synchronously. `source.get_desc()` is awaited
    /// on a short-lived background thread rather than this call or the
    /// worker thread blocking on it; the step is only enqueued once it
    /// resolves.
    pub fn begin_transaction_from_source(
        &self,
        source: Arc<dyn IAsyncDataSource>,
        long_term: bool,
        lane: Lane,
    ) -> Result<(TransactionId, TransactionFuture<D::Resource>), TransactionError> {
        let (id, future) = self.assembly_line.begin_transaction_pending(long_term)?;
        let manager = self
            .self_weak
            .upgrade()
            .expect("begin_transaction_from_source called on a live Manager");
        let wake = self.wake.clone();
        thread::spawn(move || match pollster::block_on(source.get_desc()) {
            Ok(desc) => {
                manager.assembly_line.set_transaction_desc(id, desc.clone());
                let _ = manager
                    .assembly_line
                    .enqueue_step(lane, UploadStep { transaction: id, desc, packet: DataPacket::Async(source) });
                wake.notify();
            }
            Err(e) => manager.assembly_line.fail_pending_transaction(id, e),
        });
        Ok((id, future))
    }

    /// Release a client's reference to a transaction (its
    /// `TransactionMarker`, if it has one, was dropped).
    pub fn release_transaction(&self, id: TransactionId) {
        self.assembly_line.release_client_ref(id);
    }

    /// Cancel a transaction before its queued step runs. The promise
    /// resolves with [`TransactionError::Aborted`] immediately; if the
    /// worker thread has not yet dequeued the matching step, it will be
    /// skipped (no resource created, no copy) once it is. Does not
    /// itself release the caller's client reference — call
    /// [`Self::release_transaction`] once the caller is done with `id`.
    pub fn cancel_transaction(&self, id: TransactionId) {
        self.assembly_line.cancel_transaction(id);
    }

    /// Publish whatever the worker thread has committed since the last
    /// call, and age the resource pool by one frame. Call once per frame.
    pub fn update(&self) {
        let mut ctx = self.ctx.lock();
        let written = ctx.events().written();
        ctx.publish(written);
        drop(ctx);
        self.pool.update();
    }

    /// Block until every currently-queued step has been processed, then
    /// publish. Advances the assembly line's writing queue-set index
    /// first, so a barrier always drains into a freshly-selected lane
    /// generation rather than racing new enqueues against the same one.
    /// Used before an operation that cannot proceed with stale data,
    /// e.g. a synchronous CPU readback.
    pub fn frame_priority_barrier(&self) {
        self.assembly_line.flip_writing_queue_set();
        while self.assembly_line.queued_step_count() > 0 {
            self.wake.notify();
            thread::yield_now();
        }
        self.update();
    }

    /// `true` once `future` has resolved (successfully or not), without
    /// blocking or consuming it.
    pub fn is_complete(future: &TransactionFuture<D::Resource>) -> bool {
        future.peek().is_some()
    }

    /// Snapshot of worker and pool activity since the last call.
    pub fn pop_metrics(&self) -> PoolSystemMetrics {
        PoolSystemMetrics {
            assembly_line: self.assembly_line.metrics(),
            command_lists: Vec::new(),
            pools: vec![self.pool.metrics()],
            batching: BatchingSystemMetrics::default(),
        }
    }

    /// Abort every in-flight transaction and discard pooled/batched
    /// resources. The device handle itself is assumed invalid after
    /// this call.
    pub fn on_lost_device(&self) {
        self.assembly_line.on_lost_device();
        self.pool.on_lost_device();
        for bucket in self.batched_buckets.lock().values() {
            bucket.on_lost_device();
        }
    }
}

impl<D: Device> Drop for Manager<D> {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        self.wake.notify();
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
    }
}
