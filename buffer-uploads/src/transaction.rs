//! [`Transaction`] and [`TransactionTable`]: the slot-indexed table the
//! worker thread and client threads both touch, and the packed atomic
//! reference count that lets them agree when a slot can be reused
//! with a bit layout matching how `BufferUploads_Manager.cpp` packs it.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use buffer_uploads_device::{ResourceDesc, ResourceHandle};
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;

use crate::error::TransactionError;
use crate::heap::SpanningHeap;
use crate::locator::ResourceLocator;

/// Slot-table granularity: each transaction occupies a 16-byte slot in
/// the table's backing `SpanningHeap`, matching the original's
/// `heapIndex << 4` addressing.
pub const SLOT_QUANTUM: u32 = 16;

/// A transaction handle: low 32 bits are the slot index, bits 32..63
/// are a per-slot discriminator (bumped every time a slot is reused,
/// so a stale id from a freed slot is never mistaken for the new
/// occupant), and bit 63 selects the long-term table.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct TransactionId(u64);

impl TransactionId {
    fn new(slot_index: u32, discriminator: u32, is_long_term: bool) -> Self {
        let mut bits = slot_index as u64 | ((discriminator as u64 & 0x7FFF_FFFF) << 32);
        if is_long_term {
            bits |= 1u64 << 63;
        }
        TransactionId(bits)
    }

    /// The raw 64-bit value, as handed to clients.
    pub fn as_u64(self) -> u64 {
        self.0
    }

    /// Reconstruct a `TransactionId` from its raw value.
    pub fn from_u64(bits: u64) -> Self {
        TransactionId(bits)
    }

    /// Index into the owning table's slot array.
    pub fn slot_index(self) -> u32 {
        (self.0 & 0xFFFF_FFFF) as u32
    }

    /// Per-slot generation counter.
    pub fn discriminator(self) -> u32 {
        ((self.0 >> 32) & 0x7FFF_FFFF) as u32
    }

    /// `true` if this id belongs to the long-term table.
    pub fn is_long_term(self) -> bool {
        (self.0 >> 63) != 0
    }
}

const CLIENT_SHIFT: u32 = 24;
const SYSTEM_MASK: u32 = 0x00FF_FFFF;
const CLIENT_MASK: u32 = 0xFF00_0000;
/// All bits set: never a value either field reaches under normal
/// operation (that would require 2^24 system refs and 255 client
/// refs simultaneously), so it doubles as the "slot is free" marker.
const FREE_SENTINEL: u32 = u32::MAX;

/// A packed atomic reference count: the low 24 bits are held by the
/// assembly line for each step still in flight against this
/// transaction; the high 8 bits are held by client-visible handles
/// (`TransactionMarker`). The slot is only recycled once both reach
/// zero, so an in-flight step keeps a cancelled transaction's slot
/// alive until that step actually finishes.
#[derive(Debug)]
struct RefCount(AtomicU32);

impl RefCount {
    fn new(system: u32, client: u8) -> Self {
        assert!(system & !SYSTEM_MASK == 0);
        RefCount(AtomicU32::new(system | ((client as u32) << CLIENT_SHIFT)))
    }

    fn add_system_ref(&self) {
        let prev = self.0.fetch_add(1, Ordering::AcqRel);
        debug_assert!(prev & SYSTEM_MASK != SYSTEM_MASK, "system reference count overflow");
    }

    /// Returns `true` if this was the last outstanding reference of
    /// either kind, i.e. the slot should now be freed.
    fn release_system_ref(&self) -> bool {
        let prev = self.0.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev & SYSTEM_MASK != 0, "released a system ref that wasn't held");
        if prev == 1 {
            self.0.store(FREE_SENTINEL, Ordering::Release);
            true
        } else {
            false
        }
    }

    fn add_client_ref(&self) {
        let prev = self.0.fetch_add(1 << CLIENT_SHIFT, Ordering::AcqRel);
        debug_assert!(prev & CLIENT_MASK != CLIENT_MASK, "client reference count overflow");
    }

    /// Returns `true` if this was the last outstanding reference.
    fn release_client_ref(&self) -> bool {
        let prev = self.0.fetch_sub(1 << CLIENT_SHIFT, Ordering::AcqRel);
        debug_assert!(prev & CLIENT_MASK != 0, "released a client ref that wasn't held");
        if prev == 1 << CLIENT_SHIFT {
            self.0.store(FREE_SENTINEL, Ordering::Release);
            true
        } else {
            false
        }
    }
}

/// Result a transaction resolves to: the locator for the data once it
/// is safely uploaded, or the error that aborted it.
pub type TransactionResult<R> = Result<ResourceLocator<R>, TransactionError>;

/// A clonable, poll-anytime future over a transaction's outcome.
/// Attaching a continuation after the transaction has already resolved
/// just observes the cached value — `Shared` makes "subscribe late"
/// free, rather than needing a broadcast-channel of our own.
pub type TransactionFuture<R> = Shared<BoxFuture<'static, TransactionResult<R>>>;

struct Completer<R>(Option<futures::channel::oneshot::Sender<TransactionResult<R>>>);

impl<R> Completer<R> {
    fn complete(&mut self, result: TransactionResult<R>) {
        if let Some(tx) = self.0.take() {
            let _ = tx.send(result);
        }
    }
}

fn completion_pair<R: Clone + Send + 'static>() -> (Completer<R>, TransactionFuture<R>) {
    let (tx, rx) = futures::channel::oneshot::channel::<TransactionResult<R>>();
    let future = rx
        .map(|r| r.unwrap_or(Err(TransactionError::Aborted)))
        .boxed()
        .shared();
    (Completer(Some(tx)), future)
}

/// One in-flight (or already-resolved) upload request. `desc` starts
/// empty for a transaction begun from an [`crate::packet::IAsyncDataSource`]
/// whose shape isn't known synchronously (`Manager::begin_transaction_from_source`)
/// and is filled in once that source's `get_desc` future resolves.
pub struct Transaction<R: ResourceHandle> {
    id: TransactionId,
    desc: Mutex<Option<ResourceDesc>>,
    ref_count: RefCount,
    completer: Mutex<Completer<R>>,
    future: TransactionFuture<R>,
    cancelled: AtomicBool,
}

impl<R: ResourceHandle> Transaction<R> {
    /// This transaction's id.
    pub fn id(&self) -> TransactionId {
        self.id
    }

    /// The resource shape this transaction is uploading into, once known.
    pub fn desc(&self) -> Option<ResourceDesc> {
        self.desc.lock().clone()
    }

    /// Fill in the resource shape for a transaction begun without one.
    pub fn set_desc(&self, desc: ResourceDesc) {
        *self.desc.lock() = Some(desc);
    }

    /// A clone of the completion future. Safe to poll or drop at any
    /// time, including after the transaction has already resolved.
    pub fn future(&self) -> TransactionFuture<R> {
        self.future.clone()
    }

    /// Mark this transaction as cancelled and resolve its promise with
    /// [`TransactionError::Aborted`] immediately. A no-op (beyond the
    /// flag) if it already resolved — the step, once the worker thread
    /// gets to it, is skipped rather than uploaded.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        self.complete(Err(TransactionError::Aborted));
    }

    /// `true` if [`Self::cancel`] has been called on this transaction.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Resolve the transaction's outcome. A no-op if already resolved.
    pub fn complete(&self, result: TransactionResult<R>) {
        self.completer.lock().complete(result);
    }
}

/// Either the temporary (short-lived, frame-scoped) or long-term
/// transaction table. Both share the same slot-allocation machinery;
/// only capacity defaults and the id's long-term bit differ.
pub struct TransactionTable<R: ResourceHandle> {
    heap: SpanningHeap,
    slots: Vec<Option<Transaction<R>>>,
    discriminators: Vec<u32>,
    is_long_term: bool,
    growth_slots: u32,
}

impl<R: ResourceHandle> TransactionTable<R> {
    /// `initial_slot_capacity` is the number of transaction slots to
    /// reserve up front (the original sized its long-term table for
    /// 512 slots initially); `growth_slots` is how many more slots to
    /// add when the table is exhausted and growth is permitted.
    pub fn new(initial_slot_capacity: u32, growth_slots: u32, is_long_term: bool) -> Self {
        TransactionTable {
            heap: SpanningHeap::new(initial_slot_capacity * SLOT_QUANTUM, SLOT_QUANTUM),
            slots: Vec::new(),
            discriminators: Vec::new(),
            is_long_term,
            growth_slots,
        }
    }

    /// Allocate a fresh slot for `desc`, returning the new
    /// transaction's id and its completion future. Grows the table
    /// once before giving up with [`TransactionError::TableExhausted`].
    pub fn allocate(&mut self, desc: ResourceDesc) -> Result<(TransactionId, TransactionFuture<R>), TransactionError> {
        self.allocate_with(Some(desc))
    }

    /// Allocate a fresh slot whose resource shape is not known yet —
    /// [`Self::set_desc`] fills it in once an async source's `get_desc`
    /// future resolves.
    pub fn allocate_pending(&mut self) -> Result<(TransactionId, TransactionFuture<R>), TransactionError> {
        self.allocate_with(None)
    }

    fn allocate_with(&mut self, desc: Option<ResourceDesc>) -> Result<(TransactionId, TransactionFuture<R>), TransactionError> {
        let offset = match self.heap.allocate(SLOT_QUANTUM) {
            Some(o) => o,
            None => {
                self.heap.append_new_block(SLOT_QUANTUM * self.growth_slots);
                self.heap
                    .allocate(SLOT_QUANTUM)
                    .ok_or(TransactionError::TableExhausted)?
            }
        };
        let slot_index = (offset / SLOT_QUANTUM) as usize;
        while self.slots.len() <= slot_index {
            self.slots.push(None);
            self.discriminators.push(0);
        }
        self.discriminators[slot_index] = self.discriminators[slot_index].wrapping_add(1);
        let id = TransactionId::new(slot_index as u32, self.discriminators[slot_index], self.is_long_term);
        let (completer, future) = completion_pair::<R>();
        self.slots[slot_index] = Some(Transaction {
            id,
            desc: Mutex::new(desc),
            ref_count: RefCount::new(0, 1),
            completer: Mutex::new(completer),
            future: future.clone(),
            cancelled: AtomicBool::new(false),
        });
        Ok((id, future))
    }

    /// Fill in the resource shape for a transaction allocated with
    /// [`Self::allocate_pending`]. A no-op for a stale or already-freed id.
    pub fn set_desc(&self, id: TransactionId, desc: ResourceDesc) {
        if let Some(txn) = self.slot(id) {
            txn.set_desc(desc);
        }
    }

    fn slot(&self, id: TransactionId) -> Option<&Transaction<R>> {
        if id.is_long_term() != self.is_long_term {
            return None;
        }
        let txn = self.slots.get(id.slot_index() as usize)?.as_ref()?;
        (txn.id == id).then_some(txn)
    }

    /// Look up a live transaction by id. Returns `None` for a stale id
    /// (slot reused or already freed).
    pub fn get(&self, id: TransactionId) -> Option<&Transaction<R>> {
        self.slot(id)
    }

    /// Cancel a queued transaction before its step has been processed:
    /// resolves the promise with [`TransactionError::Aborted`] right
    /// away and marks the slot so [`crate::assembly_line::AssemblyLine::process`]
    /// skips the upload once it dequeues the matching step. A no-op
    /// for an id that is already stale or resolved.
    pub fn cancel(&self, id: TransactionId) {
        if let Some(txn) = self.slot(id) {
            txn.cancel();
        }
    }

    /// `true` if `id` names a live transaction that has been cancelled.
    pub fn is_cancelled(&self, id: TransactionId) -> bool {
        self.slot(id).is_some_and(|txn| txn.is_cancelled())
    }

    /// Register an additional in-flight step against `id`. Keeps the
    /// slot alive even if every client handle is dropped before the
    /// step completes.
    pub fn add_system_ref(&self, id: TransactionId) {
        if let Some(txn) = self.slot(id) {
            txn.ref_count.add_system_ref();
        }
    }

    /// A client handle's clone: one more reference the caller must
    /// eventually balance with [`Self::release_client_ref`].
    pub fn add_client_ref(&self, id: TransactionId) {
        if let Some(txn) = self.slot(id) {
            txn.ref_count.add_client_ref();
        }
    }

    /// A queued step has finished; free the slot if this was the last
    /// reference of any kind.
    pub fn release_system_ref(&mut self, id: TransactionId) {
        let should_free = self.slot(id).map(|txn| txn.ref_count.release_system_ref());
        if should_free == Some(true) {
            self.free_slot(id);
        }
    }

    /// A client handle was dropped; free the slot if this was the last
    /// reference of any kind.
    pub fn release_client_ref(&mut self, id: TransactionId) {
        let should_free = self.slot(id).map(|txn| txn.ref_count.release_client_ref());
        if should_free == Some(true) {
            self.free_slot(id);
        }
    }

    fn free_slot(&mut self, id: TransactionId) {
        let index = id.slot_index() as usize;
        if self.slots[index].as_ref().is_some_and(|t| t.id == id) {
            self.slots[index] = None;
            self.heap.deallocate(index as u32 * SLOT_QUANTUM, SLOT_QUANTUM);
        }
    }

    /// Transactions currently occupying a slot.
    pub fn live_count(&self) -> u32 {
        self.slots.iter().filter(|s| s.is_some()).count() as u32
    }

    /// Abort every live transaction with [`TransactionError::DeviceLost`]
    /// and empty the table. Used on device loss.
    pub fn on_lost_device(&mut self) {
        for slot in self.slots.iter_mut() {
            if let Some(txn) = slot.take() {
                txn.complete(Err(TransactionError::DeviceLost));
            }
        }
        self.heap = SpanningHeap::new(self.heap.total_size(), SLOT_QUANTUM);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use buffer_uploads_device::{LinearBufferDesc, ResourceKind};

    #[derive(Clone, Debug)]
    struct DummyResource;

    fn desc() -> ResourceDesc {
        ResourceDesc {
            kind: ResourceKind::LinearBuffer(LinearBufferDesc {
                size_in_bytes: 64,
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
    fn id_round_trips_through_bit_layout() {
        let id = TransactionId::new(0xABCD, 7, true);
        assert_eq!(id.slot_index(), 0xABCD);
        assert_eq!(id.discriminator(), 7);
        assert!(id.is_long_term());
        assert_eq!(TransactionId::from_u64(id.as_u64()), id);
    }

    #[test]
    fn allocate_then_release_client_ref_frees_slot_with_no_outstanding_steps() {
        let mut table = TransactionTable::<DummyResource>::new(4, 64, false);
        let (id, _future) = table.allocate(desc()).unwrap();
        assert_eq!(table.live_count(), 1);
        table.release_client_ref(id);
        assert_eq!(table.live_count(), 0);
        assert!(table.get(id).is_none());
    }

    #[test]
    fn outstanding_system_ref_keeps_slot_alive_after_client_drops() {
        let mut table = TransactionTable::<DummyResource>::new(4, 64, false);
        let (id, _future) = table.allocate(desc()).unwrap();
        table.add_system_ref(id); // e.g. a step was enqueued
        table.release_client_ref(id); // client handle dropped
        assert!(table.get(id).is_some(), "slot must survive while a step is in flight");
        table.release_system_ref(id); // step finished
        assert!(table.get(id).is_none());
    }

    #[test]
    fn complete_resolves_future_even_after_slot_is_reused() {
        let mut table = TransactionTable::<DummyResource>::new(4, 64, false);
        let (id, future) = table.allocate(desc()).unwrap();
        table.get(id).unwrap().complete(Err(TransactionError::Aborted));
        table.release_client_ref(id);
        let result = pollster::block_on(future);
        assert!(matches!(result, Err(TransactionError::Aborted)));
    }

    #[test]
    fn cancel_resolves_future_to_aborted_and_marks_the_slot() {
        let mut table = TransactionTable::<DummyResource>::new(4, 64, false);
        let (id, future) = table.allocate(desc()).unwrap();
        table.cancel(id);
        assert!(table.is_cancelled(id));
        let result = pollster::block_on(future);
        assert!(matches!(result, Err(TransactionError::Aborted)));
    }

    #[test]
    fn table_exhaustion_without_growth_room_reports_error() {
        let mut table = TransactionTable::<DummyResource>::new(1, 0, false);
        let first = table.allocate(desc());
        assert!(first.is_ok());
        let second = table.allocate(desc());
        assert!(matches!(second, Err(TransactionError::TableExhausted)));
    }
}
