//! [`ResourceLocator`]: a client-facing handle to either a whole
//! device resource or a sub-range of one backed by `BatchedResources`.
//!
//! Locator lifetime used to be tracked with explicit `AddRef`/`Release`
//! calls on an intrusive count. Rust already has that primitive —
//! `Arc`'s clone/drop — so a locator here just *is* an `Arc`, and
//! "releasing" a sub-range back to its owning heap happens in a `Drop`
//! impl instead of a manually-paired call.
//!
//! The resource/range pair lives behind a lock rather than as plain
//! `Inner` fields: a defrag compaction or a pool return can reassign
//! what an already-handed-out locator points at, and every clone of it
//! needs to observe the same rewrite.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use buffer_uploads_device::{CommandListId, ResourceHandle};
use parking_lot::Mutex;

use crate::error::LocatorError;

/// Invoked when the last clone of a sub-range locator is dropped, so
/// the owning `BatchedResources` can release the reference-counted
/// range back to its heap.
pub trait RangeRelease<R>: Send + Sync {
    /// `range` is the `(start, len)` byte range the dropped locator held.
    fn on_release(&self, resource: &R, range: (u32, u32));
}

impl<R, F: Fn(&R, (u32, u32)) + Send + Sync> RangeRelease<R> for F {
    fn on_release(&self, resource: &R, range: (u32, u32)) {
        self(resource, range)
    }
}

struct LocatorState<R> {
    resource: R,
    range: Option<(u32, u32)>,
}

struct Inner<R: ResourceHandle> {
    state: Mutex<LocatorState<R>>,
    completion_command_list: AtomicU64,
    on_release: Option<Arc<dyn RangeRelease<R>>>,
    on_whole_release: Option<Arc<dyn Fn(&R) + Send + Sync>>,
}

impl<R: ResourceHandle> Drop for Inner<R> {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        match (state.range, &self.on_release) {
            (Some(range), Some(hook)) => hook.on_release(&state.resource, range),
            (None, _) => {
                if let Some(hook) = &self.on_whole_release {
                    hook(&state.resource);
                }
            }
            _ => {}
        }
    }
}

/// A reference-counted view onto a device resource, either the whole
/// thing or a sub-range packed into a batched prototype resource.
/// Cloning is `AddRef`; dropping the last clone is `Release`.
pub struct ResourceLocator<R: ResourceHandle>(Arc<Inner<R>>);

impl<R: ResourceHandle> Clone for ResourceLocator<R> {
    fn clone(&self) -> Self {
        ResourceLocator(self.0.clone())
    }
}

impl<R: ResourceHandle> fmt::Debug for ResourceLocator<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.0.state.lock();
        f.debug_struct("ResourceLocator")
            .field("resource", &state.resource)
            .field("range", &state.range)
            .finish()
    }
}

/// A non-owning reference to a [`ResourceLocator`], used by an owner
/// like `BatchedResources` to keep a list of locators it has handed
/// out without extending their lifetime — the registry should not be
/// the reason a caller's locator stays alive.
pub struct WeakResourceLocator<R: ResourceHandle>(Weak<Inner<R>>);

impl<R: ResourceHandle> Clone for WeakResourceLocator<R> {
    fn clone(&self) -> Self {
        WeakResourceLocator(self.0.clone())
    }
}

impl<R: ResourceHandle> WeakResourceLocator<R> {
    /// Recover a strong handle, if any clone of the original locator
    /// is still alive.
    pub fn upgrade(&self) -> Option<ResourceLocator<R>> {
        self.0.upgrade().map(ResourceLocator)
    }
}

impl<R: ResourceHandle> ResourceLocator<R> {
    /// A locator over the entire resource, with no action taken when
    /// the last clone drops.
    pub fn whole(resource: R) -> Self {
        ResourceLocator(Arc::new(Inner {
            state: Mutex::new(LocatorState { resource, range: None }),
            completion_command_list: AtomicU64::new(0),
            on_release: None,
            on_whole_release: None,
        }))
    }

    /// A locator over the entire resource. `on_release` fires once the
    /// last clone is dropped, e.g. to hand the resource back to a
    /// `ResourcesPool`.
    pub fn whole_with_release(resource: R, on_release: Arc<dyn Fn(&R) + Send + Sync>) -> Self {
        ResourceLocator(Arc::new(Inner {
            state: Mutex::new(LocatorState { resource, range: None }),
            completion_command_list: AtomicU64::new(0),
            on_release: None,
            on_whole_release: Some(on_release),
        }))
    }

    /// A locator over `range` within `resource`, backed by a batched
    /// prototype. `on_release` fires when the last clone is dropped.
    pub fn sub_range(resource: R, range: (u32, u32), on_release: Arc<dyn RangeRelease<R>>) -> Self {
        assert!(range.0 < range.1, "sub-range locator must be non-empty");
        ResourceLocator(Arc::new(Inner {
            state: Mutex::new(LocatorState { resource, range: Some(range) }),
            completion_command_list: AtomicU64::new(0),
            on_release: Some(on_release),
            on_whole_release: None,
        }))
    }

    /// A weak reference suitable for a registry that should not keep
    /// this locator alive on its own.
    pub fn downgrade(&self) -> WeakResourceLocator<R> {
        WeakResourceLocator(Arc::downgrade(&self.0))
    }

    /// The underlying device resource handle (shared across whole and
    /// sub-range locators backed by the same batched prototype).
    pub fn resource(&self) -> R {
        self.0.state.lock().resource.clone()
    }

    /// `Some((start, len))` for a sub-range locator, `None` for a
    /// whole-resource locator.
    pub fn range(&self) -> Option<(u32, u32)> {
        self.0.state.lock().range
    }

    /// `true` if this locator covers the entire resource.
    pub fn is_whole(&self) -> bool {
        self.0.state.lock().range.is_none()
    }

    /// View this locator as covering the whole resource. Fails if it
    /// is actually a sub-range of a batched prototype, since in that
    /// case the backing device resource holds unrelated neighbours'
    /// data too.
    pub fn view_as_whole(&self) -> Result<R, LocatorError> {
        let state = self.0.state.lock();
        if state.range.is_none() {
            Ok(state.resource.clone())
        } else {
            Err(LocatorError::PartialResourceNotAViewable)
        }
    }

    /// Split off a new locator over `sub_range` within this one's
    /// range (or within the whole resource, if `self` is whole).
    /// `on_release` fires when the new locator's last clone drops.
    pub fn make_sub_locator(
        &self,
        sub_range: (u32, u32),
        on_release: Arc<dyn RangeRelease<R>>,
    ) -> ResourceLocator<R> {
        let state = self.0.state.lock();
        let (base, _) = state.range.unwrap_or((0, u32::MAX));
        let resource = state.resource.clone();
        drop(state);
        ResourceLocator::sub_range(resource, (base + sub_range.0, base + sub_range.1), on_release)
    }

    /// Rewrite this locator, and every existing clone of it, to point
    /// at `new_resource`/`new_range` — used after a defrag compaction
    /// moves the bytes a live locator was reading. Does not touch
    /// `completion_command_list`.
    pub fn apply_reposition(&self, new_resource: R, new_range: Option<(u32, u32)>) {
        let mut state = self.0.state.lock();
        state.resource = new_resource;
        state.range = new_range;
    }

    /// The command list that must be committed before this locator's
    /// contents are safe to read from on the device. `0` until set.
    pub fn completion_command_list(&self) -> CommandListId {
        self.0.completion_command_list.load(Ordering::Acquire)
    }

    /// Record the command list whose commit makes this locator's data
    /// visible. Called once, when the upload that populates it resolves.
    pub fn set_completion_command_list(&self, id: CommandListId) {
        self.0.completion_command_list.store(id, Ordering::Release);
    }
}
