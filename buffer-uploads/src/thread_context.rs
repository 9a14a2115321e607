//! [`ThreadContext`]: a deferred device context plus the bookkeeping
//! the worker thread needs to publish its work to readers on other
//! threads without a lock on the hot path.

use std::sync::atomic::{AtomicU64, Ordering};

use buffer_uploads_device::{CommandListId, DefragStep, Device, DeviceContext};

/// One deferred unit of work recorded against a [`ThreadContext`],
/// replayed onto the device context when the command list is resolved.
pub enum CommitStep<R> {
    /// Copy the whole of `src` into `dst`.
    DeferredCopy { dst: R, src: R },
    /// Copy `src` into `dst` following a defrag's move list.
    DeferredDefragCopy {
        dst: R,
        src: R,
        steps: Vec<DefragStep>,
    },
    /// Drop `resource` once this command list has committed — used to
    /// keep a resource alive until any outstanding device reads against
    /// it are guaranteed to have finished.
    DelayedDelete(R),
}

/// Three monotonic cursors over resolved command lists, read without
/// locking from any thread:
/// - `written`: the worker thread has recorded everything up to here.
/// - `published`: safe for a reader to treat as visible on the device.
/// - `processed`: every `DelayedDelete` up to here has actually run.
#[derive(Debug, Default)]
pub struct EventRing {
    written: AtomicU64,
    published: AtomicU64,
    processed: AtomicU64,
}

impl EventRing {
    /// A fresh ring with every cursor at zero.
    pub fn new() -> Self {
        EventRing::default()
    }

    fn record_written(&self, id: CommandListId) {
        self.written.fetch_max(id, Ordering::AcqRel);
    }

    /// Advance the published cursor. Never moves it backwards.
    pub fn publish_up_to(&self, id: CommandListId) {
        self.published.fetch_max(id, Ordering::AcqRel);
    }

    /// Advance the processed cursor. Never moves it backwards.
    pub fn mark_processed_up_to(&self, id: CommandListId) {
        self.processed.fetch_max(id, Ordering::AcqRel);
    }

    /// The highest command list the worker thread has resolved.
    pub fn written(&self) -> CommandListId {
        self.written.load(Ordering::Acquire)
    }

    /// The highest command list safe to treat as visible on the device.
    pub fn published(&self) -> CommandListId {
        self.published.load(Ordering::Acquire)
    }

    /// The highest command list whose delayed deletes have run.
    pub fn processed(&self) -> CommandListId {
        self.processed.load(Ordering::Acquire)
    }
}

/// A deferred device context with a queue of steps accumulated by the
/// worker thread before being replayed and resolved into a command
/// list. Two of these back the `Manager`: one under construction by
/// the worker, one already committed and readable by the main thread.
pub struct ThreadContext<D: Device> {
    context: D::Context,
    pending_steps: Vec<CommitStep<D::Resource>>,
    events: EventRing,
}

impl<D: Device> ThreadContext<D> {
    /// Wrap a fresh device context.
    pub fn new(context: D::Context) -> Self {
        ThreadContext {
            context,
            pending_steps: Vec::new(),
            events: EventRing::new(),
        }
    }

    /// Queue a plain resource-to-resource copy.
    pub fn record_copy(&mut self, dst: D::Resource, src: D::Resource) {
        self.pending_steps.push(CommitStep::DeferredCopy { dst, src });
    }

    /// Queue a defrag copy, following `steps`.
    pub fn record_defrag_copy(&mut self, dst: D::Resource, src: D::Resource, steps: Vec<DefragStep>) {
        self.pending_steps
            .push(CommitStep::DeferredDefragCopy { dst, src, steps });
    }

    /// Queue a resource to be dropped once this command list commits.
    pub fn record_delayed_delete(&mut self, resource: D::Resource) {
        self.pending_steps.push(CommitStep::DelayedDelete(resource));
    }

    /// Number of steps queued but not yet replayed.
    pub fn pending_step_count(&self) -> usize {
        self.pending_steps.len()
    }

    /// Replay every queued step against the device context, resolve a
    /// new command list, and record it as written. Does not publish —
    /// callers decide when committed work becomes visible.
    pub fn commit(&mut self) -> CommandListId {
        for step in self.pending_steps.drain(..) {
            match step {
                CommitStep::DeferredCopy { dst, src } => self.context.resource_copy(&dst, &src),
                CommitStep::DeferredDefragCopy { dst, src, steps } => {
                    self.context.resource_copy_defrag_steps(&dst, &src, &steps)
                }
                CommitStep::DelayedDelete(resource) => drop(resource),
            }
        }
        let id = self.context.resolve_command_list();
        self.events.record_written(id);
        id
    }

    /// Publish work up to `up_to`, making it visible to readers and
    /// telling the device context it is safe to treat as committed.
    pub fn publish(&mut self, up_to: CommandListId) {
        self.context.commit_to_immediate(up_to);
        self.events.publish_up_to(up_to);
    }

    /// The event cursors tracking this context's progress.
    pub fn events(&self) -> &EventRing {
        &self.events
    }

    /// The underlying device context.
    pub fn context(&self) -> &D::Context {
        &self.context
    }

    /// The underlying device context, mutably.
    pub fn context_mut(&mut self) -> &mut D::Context {
        &mut self.context
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use buffer_uploads_device::{LinearBufferDesc, ResourceDesc, ResourceKind};
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

    #[test]
    fn commit_replays_copies_and_advances_written() {
        let device = MockDevice::default();
        let src = device.create_resource(&desc(8), Some(&[5u8; 8])).unwrap();
        let dst = device.create_resource(&desc(8), None).unwrap();
        let mut ctx = ThreadContext::<MockDevice>::new(device.create_deferred_context());
        ctx.record_copy(dst.clone(), src);
        let id = ctx.commit();
        assert_eq!(ctx.events().written(), id);
        assert_eq!(dst.read_back(), vec![5u8; 8]);
    }

    #[test]
    fn publish_advances_published_cursor_not_beyond_written() {
        let device = MockDevice::default();
        let mut ctx = ThreadContext::<MockDevice>::new(device.create_deferred_context());
        let id = ctx.commit();
        ctx.publish(id);
        assert_eq!(ctx.events().published(), id);
        assert_eq!(ctx.events().processed(), 0);
    }

    #[test]
    fn delayed_delete_is_queued_and_dropped_on_commit() {
        let device = MockDevice::default();
        let resource = device.create_resource(&desc(8), None).unwrap();
        let mut ctx = ThreadContext::<MockDevice>::new(device.create_deferred_context());
        ctx.record_delayed_delete(resource);
        assert_eq!(ctx.pending_step_count(), 1);
        ctx.commit();
        assert_eq!(ctx.pending_step_count(), 0);
    }
}
