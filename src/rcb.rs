//! The Request Control Block arena: a per-open slab (arena) of RCBs keyed by stable
//! indices, with intrusive-list next/prev expressed as index pairs and child callbacks
//! carrying the index plus a generation counter to detect cancellation. This follows
//! the same index-plus-generation idiom `vector-buffers` uses for its record
//! IDs (`RecordId` wrapping a `u64` that callers treat as opaque), adapted into a small
//! slab allocator since FVD additionally needs O(1) freelist reuse per request.

use std::ops::Range;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

/// A caller-held handle for cancelling an in-flight request (`aio_cancel`).
///
/// Mirrors the source's ACB: created by the caller before issuing a request, passed
/// alongside it, and usable at any point afterward to ask the request to stop waiting.
/// Cancellation here is cooperative rather than preemptive — it only takes effect at the
/// parking points `write.rs` already awaits on (a write blocked behind a copy_lock, or
/// blocked on a journal-ring reservation); a cancelled request's `fresh` bits stay
/// updated but `stale` does not.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

#[derive(Debug, Default)]
struct CancelInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        // `notify_one`, not `notify_waiters`: only ever one task races `cancelled()` per
        // token, and unlike `notify_waiters` it stores a permit if that task has not
        // started waiting yet, so a `cancel()` landing between the `is_cancelled` check
        // and the `.await` below is never lost.
        self.inner.notify.notify_one();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves once [`cancel`](Self::cancel) has been called (or immediately, if it
    /// already has). Meant to be raced via `tokio::select!` against the thing being
    /// cancelled.
    pub async fn cancelled(&self) {
        if !self.is_cancelled() {
            self.inner.notify.notified().await;
        }
    }
}

/// What kind of operation an RCB represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Read,
    Write,
    Copy,
    StoreCompact,
    LoadCompact,
    Flush,
    Wrapper,
}

/// Which of the three intrusive lists (if any) an RCB currently belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListMembership {
    None,
    CopyLocks,
    WriteLocks,
    WaitForJournal,
}

/// A stable reference to a slot in the [`RcbSlab`]. The generation counter lets a
/// delayed child-I/O callback detect that its RCB was already cancelled and reused for
/// an unrelated request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RcbId {
    index: u32,
    generation: u32,
}

/// One in-flight request's bookkeeping.
#[derive(Debug)]
pub struct Rcb {
    pub op: OpKind,
    pub range: Range<u64>,
    pub child_ios_outstanding: u32,
    pub bounce_buffer: Option<Vec<u8>>,
    /// Set by the Store path when a table-journal update is owed for this request.
    pub update_table: bool,
    pub membership: ListMembership,
    /// Other RCBs parked behind this one (a write blocked on this copy/write lock).
    pub dependents: Vec<RcbId>,
    /// Wakes this RCB's suspended `async fn` when it is released from whatever it is
    /// parked on. The `async fn` call stack *is* the state machine (rather than an
    /// explicit state enum advanced on callback, the compiler generates that enum);
    /// parking becomes awaiting this `Notify` instead of manual callback re-entry.
    pub notify: Arc<Notify>,
    // Intrusive doubly-linked-list pointers for whichever list `membership` names.
    pub(crate) prev: Option<RcbId>,
    pub(crate) next: Option<RcbId>,
    generation: u32,
}

impl Rcb {
    fn new(op: OpKind, range: Range<u64>, generation: u32) -> Self {
        Self {
            op,
            range,
            child_ios_outstanding: 0,
            bounce_buffer: None,
            update_table: false,
            membership: ListMembership::None,
            dependents: Vec::new(),
            notify: Arc::new(Notify::new()),
            prev: None,
            next: None,
            generation,
        }
    }
}

enum Slot {
    Occupied(Rcb),
    Free { next_free: Option<u32>, generation: u32 },
}

/// A per-open arena of RCBs, indexed by [`RcbId`]. Plays the role the source's
/// heap-allocated, intrusively-linked RCBs play, without unsafe pointer chasing.
#[derive(Default)]
pub struct RcbSlab {
    slots: Vec<Slot>,
    free_head: Option<u32>,
}

impl RcbSlab {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free_head: None,
        }
    }

    /// Allocates a new RCB, created when the request enters the engine.
    pub fn alloc(&mut self, op: OpKind, range: Range<u64>) -> RcbId {
        if let Some(index) = self.free_head {
            let (next_free, generation) = match &self.slots[index as usize] {
                Slot::Free { next_free, generation } => (*next_free, *generation),
                Slot::Occupied(_) => unreachable!("free list points at occupied slot"),
            };
            self.free_head = next_free;
            self.slots[index as usize] = Slot::Occupied(Rcb::new(op, range, generation));
            RcbId { index, generation }
        } else {
            let index = self.slots.len() as u32;
            let generation = 0;
            self.slots.push(Slot::Occupied(Rcb::new(op, range, generation)));
            RcbId { index, generation }
        }
    }

    pub fn get(&self, id: RcbId) -> Option<&Rcb> {
        match self.slots.get(id.index as usize)? {
            Slot::Occupied(rcb) if rcb.generation == id.generation => Some(rcb),
            _ => None,
        }
    }

    pub fn get_mut(&mut self, id: RcbId) -> Option<&mut Rcb> {
        match self.slots.get_mut(id.index as usize)? {
            Slot::Occupied(rcb) if rcb.generation == id.generation => Some(rcb),
            _ => None,
        }
    }

    /// Destroys an RCB, exactly once, when its final callback reports to the caller;
    /// all embedded buffers are released then. Bumps the generation so any stale
    /// `RcbId` a late callback still holds will miss.
    pub fn free(&mut self, id: RcbId) {
        let Some(Slot::Occupied(rcb)) = self.slots.get(id.index as usize) else {
            return;
        };
        if rcb.generation != id.generation {
            return;
        }
        let next_generation = rcb.generation.wrapping_add(1);
        self.slots[id.index as usize] = Slot::Free {
            next_free: self.free_head,
            generation: next_generation,
        };
        self.free_head = Some(id.index);
    }

    pub fn is_live(&self, id: RcbId) -> bool {
        self.get(id).is_some()
    }
}
