//! Fault-handle table and persistent per-page metadata (spec §3, §4.1, §5).
//!
//! Two sharded maps, both keyed by shared-window offset:
//! - [`PageTable`] holds the three probe bits (SHARED, MODIFIED, REPLICATED)
//!   and the node's acked-fault counter, which outlive any single fault.
//! - [`HandleTable`] holds the transient rendezvous object created while a
//!   fault against a page is in flight; at most one handle exists per page
//!   key at a time (spec §3 invariant), enforced by the bucket lock.
//!
//! Per-bucket `spin::Mutex` sharding has no direct teacher analogue (the
//! teacher's `mm::page_fault` dispatcher has no cache of its own); it is
//! taken straight from spec §5 ("sharded hash with per-bucket spin locks;
//! critical sections are short").

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};

use bitflags::bitflags;
use spin::Mutex as SpinMutex;

const BUCKET_COUNT: usize = 64;

fn bucket_for(offset: u64) -> usize {
    (offset as usize / crate::config::PAGE_SIZE as usize) % BUCKET_COUNT
}

/// A generic sharded hash map with one spin lock per bucket.
pub struct Sharded<V> {
    buckets: Vec<SpinMutex<HashMap<u64, V>>>,
}

impl<V> Sharded<V> {
    pub fn new() -> Self {
        let mut buckets = Vec::with_capacity(BUCKET_COUNT);
        for _ in 0..BUCKET_COUNT {
            buckets.push(SpinMutex::new(HashMap::new()));
        }
        Self { buckets }
    }

    pub fn with_bucket<R>(&self, key: u64, f: impl FnOnce(&mut HashMap<u64, V>) -> R) -> R {
        let mut bucket = self.buckets[bucket_for(key)].lock();
        f(&mut bucket)
    }
}

impl<V> Default for Sharded<V> {
    fn default() -> Self {
        Self::new()
    }
}

/// Persistent per-page coherence bits (spec §4.1 "metadata probe").
#[derive(Debug, Clone, Copy, Default)]
pub struct PageState {
    pub shared: bool,
    pub modified: bool,
    pub replicated: bool,
    pub acked_fault_count: i64,
}

impl PageState {
    /// Pack the three probe bits (and REMOTE/NEEDWRITE, supplied by the
    /// caller) into a [`HandleFlags`] index for the action table.
    pub fn probe_flags(&self) -> HandleFlags {
        let mut flags = HandleFlags::empty();
        flags.set(HandleFlags::REPLICATED, self.replicated);
        flags.set(HandleFlags::MODIFIED, self.modified);
        flags.set(HandleFlags::SHARED, self.shared);
        flags
    }
}

pub type PageTable = Sharded<PageState>;

impl PageTable {
    pub fn get(&self, offset: u64) -> PageState {
        self.with_bucket(offset, |b| b.get(&offset).copied().unwrap_or_default())
    }

    pub fn update(&self, offset: u64, f: impl FnOnce(&mut PageState)) -> PageState {
        self.with_bucket(offset, |b| {
            let entry = b.entry(offset).or_default();
            f(entry);
            *entry
        })
    }
}

bitflags! {
    /// The five (plus RETRY) flags of spec §4.1. The low five bits form the
    /// action-table index; RETRY is handle-local transient state.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct HandleFlags: u8 {
        const REMOTE     = 1 << 0;
        const NEEDWRITE  = 1 << 1;
        const REPLICATED = 1 << 2;
        const MODIFIED   = 1 << 3;
        const SHARED     = 1 << 4;
        const RETRY      = 1 << 5;
    }
}

impl HandleFlags {
    /// The 5-bit action-table index (spec §4.1).
    pub fn table_index(self) -> u8 {
        (self & HandleFlags::all_but_retry()).bits() & 0b1_1111
    }

    fn all_but_retry() -> HandleFlags {
        HandleFlags::REMOTE
            | HandleFlags::NEEDWRITE
            | HandleFlags::REPLICATED
            | HandleFlags::MODIFIED
            | HandleFlags::SHARED
    }
}

/// One fault handle's mutable rendezvous state.
struct HandleState {
    flags: HandleFlags,
    /// Set once the owner has finished and published an outcome.
    done: bool,
    /// Woken waiters must re-drive the fault rather than proceed (spec
    /// §4.1's NEEDWRITE race / priority-loss case).
    retry: bool,
    /// Set by a concurrent remote handler that won priority over this
    /// handle's owner (spec §4.1: "set RETRY on the local handle so the
    /// current local owner re-drives after waking"). Folded into `retry`
    /// when the owner calls `complete`.
    pending_retry: bool,
    /// Number of local waiters currently attached, for diagnostics only.
    waiters: u32,
}

/// A per-page rendezvous object. Held behind an `Arc` so that a local fault
/// which finds an existing handle can attach a private completion and sleep
/// on the same object as the handle's current owner.
pub struct FaultHandle {
    pub offset: u64,
    state: Mutex<HandleState>,
    cv: Condvar,
}

impl FaultHandle {
    fn new(offset: u64, flags: HandleFlags) -> Self {
        Self {
            offset,
            state: Mutex::new(HandleState {
                flags,
                done: false,
                retry: false,
                pending_retry: false,
                waiters: 0,
            }),
            cv: Condvar::new(),
        }
    }

    pub fn flags(&self) -> HandleFlags {
        self.state.lock().unwrap().flags
    }

    pub fn set_flags(&self, flags: HandleFlags) {
        self.state.lock().unwrap().flags = flags;
    }

    /// Attach as a waiter and block until the owner completes. Returns
    /// `true` if the waiter must re-drive the fault (spec §4.1: "woken when
    /// the current owner finishes and may then proceed or ... must re-drive
    /// as RetryFault").
    pub fn wait(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        state.waiters += 1;
        while !state.done {
            state = self.cv.wait(state).unwrap();
        }
        state.waiters -= 1;
        state.retry
    }

    /// Mark the handle complete, optionally forcing every waiter to
    /// re-drive. Folds in any `pending_retry` set by a remote handler that
    /// won priority while the owner was still working.
    pub fn complete(&self, retry: bool) {
        let mut state = self.state.lock().unwrap();
        state.done = true;
        state.retry = retry || state.pending_retry;
        self.cv.notify_all();
    }

    /// Record that a remote handler has won priority over this handle's
    /// owner; the owner must force its waiters to re-drive once it
    /// finishes, even though it completed "successfully" from its own
    /// point of view.
    pub fn mark_pending_retry(&self) {
        self.state.lock().unwrap().pending_retry = true;
    }
}

/// Table of in-flight fault handles, one per page currently being
/// serviced.
pub type HandleTable = Sharded<Arc<FaultHandle>>;

/// Outcome of attempting to become the owner of a page's fault handle.
pub enum HandleSlot {
    /// No handle existed; caller now owns a fresh one with `flags`.
    Owner(Arc<FaultHandle>),
    /// A handle already existed; caller attached as a waiter.
    Attached(Arc<FaultHandle>),
}

impl HandleTable {
    /// Look up an in-flight handle without creating one.
    pub fn peek(&self, offset: u64) -> Option<Arc<FaultHandle>> {
        self.with_bucket(offset, |bucket| bucket.get(&offset).cloned())
    }

    /// Install a new handle for `offset` if none exists, or return the
    /// existing one so the caller can attach.
    pub fn acquire_or_attach(&self, offset: u64, flags: HandleFlags) -> HandleSlot {
        self.with_bucket(offset, |bucket| {
            if let Some(existing) = bucket.get(&offset) {
                HandleSlot::Attached(existing.clone())
            } else {
                let handle = Arc::new(FaultHandle::new(offset, flags));
                bucket.insert(offset, handle.clone());
                HandleSlot::Owner(handle)
            }
        })
    }

    /// Remove the handle once the owning fault has published its result.
    pub fn release(&self, offset: u64) {
        self.with_bucket(offset, |bucket| {
            bucket.remove(&offset);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_index_ignores_retry_bit() {
        let flags = HandleFlags::REMOTE | HandleFlags::SHARED | HandleFlags::RETRY;
        assert_eq!(flags.table_index(), (HandleFlags::REMOTE | HandleFlags::SHARED).bits());
    }

    #[test]
    fn page_table_defaults_to_invalid_state() {
        let table = PageTable::new();
        let state = table.get(0x1000);
        assert!(!state.shared && !state.modified && !state.replicated);
    }

    #[test]
    fn at_most_one_handle_per_page_key() {
        let table = HandleTable::new();
        let first = table.acquire_or_attach(0x2000, HandleFlags::empty());
        assert!(matches!(first, HandleSlot::Owner(_)));
        let second = table.acquire_or_attach(0x2000, HandleFlags::empty());
        assert!(matches!(second, HandleSlot::Attached(_)));
        table.release(0x2000);
        let third = table.acquire_or_attach(0x2000, HandleFlags::empty());
        assert!(matches!(third, HandleSlot::Owner(_)));
    }

    #[test]
    fn waiter_observes_retry_flag_from_owner() {
        let handle = Arc::new(FaultHandle::new(0x3000, HandleFlags::empty()));
        let h2 = handle.clone();
        let thread = std::thread::spawn(move || h2.wait());
        std::thread::sleep(std::time::Duration::from_millis(10));
        handle.complete(true);
        assert!(thread.join().unwrap());
    }
}
