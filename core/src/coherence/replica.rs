//! Replica pool & aging/reclaim manager (spec §4.4).
//!
//! Two MRU-to-LRU ordered lists (`active`, `inactive`) track replica
//! pages. A replica's "young" bit stands in for the spec's VMA-interval-
//! tree walk: on a real devdax mapping this would scan every VMA that maps
//! the replica and clear a hardware accessed bit, which is out of scope
//! for a host-process implementation (spec §1 excludes the mapping layer
//! as an external collaborator), so the sampler in `hotness.rs` marks a
//! replica young whenever it observes a fresh access and the reclaim scan
//! consumes that bit directly, preserving the two-list aging contract
//! without reimplementing a page-table walker.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::coherence::handle::PageTable;
use crate::error::{CoreError, Result};
use crate::window::SharedWindow;

/// One locally allocated replica page.
pub struct Replica {
    pub original_offset: u64,
    pub local_bytes: Mutex<Vec<u8>>,
    pub dirty: AtomicBool,
    pub young: AtomicBool,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum ListMembership {
    Active,
    Inactive,
}

struct Lists {
    active: VecDeque<u64>,
    inactive: VecDeque<u64>,
    membership: HashMap<u64, ListMembership>,
}

impl Lists {
    fn new() -> Self {
        Self {
            active: VecDeque::new(),
            inactive: VecDeque::new(),
            membership: HashMap::new(),
        }
    }

    fn push_active_head(&mut self, offset: u64) {
        self.active.push_front(offset);
        self.membership.insert(offset, ListMembership::Active);
    }

    fn remove(&mut self, offset: u64) {
        if let Some(m) = self.membership.remove(&offset) {
            let list = match m {
                ListMembership::Active => &mut self.active,
                ListMembership::Inactive => &mut self.inactive,
            };
            list.retain(|o| *o != offset);
        }
    }
}

/// Allocates, tracks, and reclaims replica pages (spec §4.4).
///
/// `pages` is the same [`PageTable`] the owning [`super::fault_engine::FaultEngine`]
/// drives faults against, shared via `Arc` rather than duplicated: the stale-shared
/// skip in `create_replica` has to see the live MSI bits, not a private copy.
pub struct ReplicaPool {
    page_size: usize,
    pages: Arc<PageTable>,
    replicas: Mutex<HashMap<u64, Arc<Replica>>>,
    lists: Mutex<Lists>,
    allocated: AtomicU64,
    hits: AtomicU64,
    creates: AtomicU64,
    frees: AtomicU64,
}

impl ReplicaPool {
    pub fn new(page_size: usize, pages: Arc<PageTable>) -> Self {
        Self {
            page_size,
            pages,
            replicas: Mutex::new(HashMap::new()),
            lists: Mutex::new(Lists::new()),
            allocated: AtomicU64::new(0),
            creates: AtomicU64::new(0),
            frees: AtomicU64::new(0),
            hits: AtomicU64::new(0),
        }
    }

    pub fn allocated_pages(&self) -> u64 {
        self.allocated.load(Ordering::Relaxed)
    }

    pub fn hit_count(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn create_count(&self) -> u64 {
        self.creates.load(Ordering::Relaxed)
    }

    pub fn free_count(&self) -> u64 {
        self.frees.load(Ordering::Relaxed)
    }

    pub fn get(&self, offset: u64) -> Option<Arc<Replica>> {
        let found = self.replicas.lock().unwrap().get(&offset).cloned();
        if found.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        }
        found
    }

    /// Spec §4.4 `create_replica`: allocates a zeroed page, copies the
    /// original's contents, skips stale-shared pages, and inserts the new
    /// replica at the head of the active list.
    pub fn create_replica(&self, window: &dyn SharedWindow, offset: u64) -> Result<Arc<Replica>> {
        let state = self.pages.get(offset);
        if state.modified && state.shared {
            // Stale-shared: creation is skipped (spec §4.4).
            return Err(CoreError::RetryFault);
        }

        let mut bytes = vec![0u8; self.page_size];
        window.read(offset, &mut bytes);

        let replica = Arc::new(Replica {
            original_offset: offset,
            local_bytes: Mutex::new(bytes),
            dirty: AtomicBool::new(false),
            young: AtomicBool::new(true),
        });

        self.replicas.lock().unwrap().insert(offset, replica.clone());
        self.lists.lock().unwrap().push_active_head(offset);
        self.pages.update(offset, |s| s.replicated = true);
        self.allocated.fetch_add(1, Ordering::Relaxed);
        self.creates.fetch_add(1, Ordering::Relaxed);
        Ok(replica)
    }

    /// Re-reads an existing replica's bytes from the shared page and clears
    /// its dirty bit, for the S-stale refresh a synchronous FETCH performs
    /// when a page is already replicated but marked stale (spec §4.1).
    pub fn refresh_replica(&self, window: &dyn SharedWindow, offset: u64) -> Result<()> {
        let replica = self.get(offset).ok_or(CoreError::NotFound { what: "replica" })?;
        let mut bytes = replica.local_bytes.lock().unwrap();
        window.read(offset, &mut bytes);
        replica.dirty.store(false, Ordering::Release);
        Ok(())
    }

    /// Spec §4.4 `flush_replica`: writes dirty data back, clears the
    /// replica pointer, and frees the replica.
    pub fn flush_replica(&self, window: &dyn SharedWindow, offset: u64) -> Result<()> {
        let replica = self
            .replicas
            .lock()
            .unwrap()
            .remove(&offset)
            .ok_or(CoreError::NotFound { what: "replica" })?;

        if replica.dirty.load(Ordering::Acquire) {
            let bytes = replica.local_bytes.lock().unwrap();
            window.write(offset, &bytes);
        }

        self.lists.lock().unwrap().remove(offset);
        self.pages.update(offset, |s| {
            s.replicated = false;
            s.modified = false;
            s.shared = false;
        });
        self.allocated.fetch_sub(1, Ordering::Relaxed);
        self.frees.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Spec §4.4 shrinker: `count_objects` = inactive length + one quarter
    /// of active length.
    pub fn count_objects(&self) -> usize {
        let lists = self.lists.lock().unwrap();
        lists.inactive.len() + lists.active.len() / 4
    }

    /// One aging pass over the tail of `active`: young replicas return to
    /// the MRU head, not-young replicas migrate to `inactive`. Returns the
    /// number migrated.
    fn age_active(&self, lists: &mut Lists, count: usize) -> usize {
        let mut migrated = 0;
        for _ in 0..count {
            let Some(offset) = lists.active.pop_back() else {
                break;
            };
            let young = self
                .replicas
                .lock()
                .unwrap()
                .get(&offset)
                .map(|r| r.young.swap(false, Ordering::AcqRel))
                .unwrap_or(false);
            if young {
                lists.active.push_front(offset);
                lists.membership.insert(offset, ListMembership::Active);
            } else {
                lists.inactive.push_front(offset);
                lists.membership.insert(offset, ListMembership::Inactive);
                migrated += 1;
            }
        }
        migrated
    }

    /// Pops and flushes up to `count` replicas from the tail of `inactive`,
    /// one at a time (each `flush_replica` call takes the lock itself).
    fn reclaim_inactive(&self, window: &dyn SharedWindow, count: usize) -> usize {
        let mut freed = 0;
        for _ in 0..count {
            let offset = {
                let mut lists = self.lists.lock().unwrap();
                match lists.inactive.pop_back() {
                    Some(offset) => {
                        lists.membership.remove(&offset);
                        offset
                    }
                    None => break,
                }
            };
            if self.flush_replica(window, offset).is_ok() {
                freed += 1;
            }
        }
        freed
    }

    /// Spec §4.4 `scan_objects(n)`: try inactive first; if it is smaller
    /// than `2n`, age up to `4n * 2^k` active pages per round (geometric
    /// back-off in `k`) until enough inactive is available or active is
    /// exhausted, then reclaim.
    pub fn scan_objects(&self, window: &dyn SharedWindow, n: usize) -> usize {
        if n == 0 {
            return 0;
        }
        const MAX_ROUNDS: u32 = 8;
        let mut k: u32 = 0;

        loop {
            let (inactive_len, active_len) = {
                let lists = self.lists.lock().unwrap();
                (lists.inactive.len(), lists.active.len())
            };

            if inactive_len >= 2 * n || active_len == 0 {
                return self.reclaim_inactive(window, n.min(inactive_len));
            }

            if k >= MAX_ROUNDS {
                // Both lists too small to proceed further; spec §8 boundary
                // behavior: "returns early without freeing".
                return 0;
            }

            let age_count = (4 * n * (1usize << k)).min(active_len);
            let mut lists = self.lists.lock().unwrap();
            self.age_active(&mut lists, age_count);
            k += 1;
        }
    }

    /// Spec §4.4 "explicit flush": age everything to inactive, then
    /// reclaim the whole inactive list. Used on shutdown.
    pub fn flush_all(&self, window: &dyn SharedWindow) -> usize {
        let mut lists = self.lists.lock().unwrap();
        let active_len = lists.active.len();
        self.age_active(&mut lists, active_len);
        let all_inactive = lists.inactive.len();
        drop(lists);
        self.reclaim_inactive(window, all_inactive)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::window::InMemoryWindow;

    fn pool() -> (ReplicaPool, InMemoryWindow) {
        (ReplicaPool::new(4096, Arc::new(PageTable::new())), InMemoryWindow::new(1 << 20))
    }

    #[test]
    fn create_then_flush_round_trips_unmodified_bytes() {
        let (pool, window) = pool();
        window.write(4096, b"HELLO");
        pool.create_replica(&window, 4096).unwrap();
        assert_eq!(pool.allocated_pages(), 1);
        pool.flush_replica(&window, 4096).unwrap();
        assert_eq!(pool.allocated_pages(), 0);
        let mut out = [0u8; 5];
        window.read(4096, &mut out);
        assert_eq!(&out, b"HELLO");
    }

    #[test]
    fn stale_shared_page_skips_replica_creation() {
        let (pool, window) = pool();
        pool.pages.update(4096, |s| {
            s.modified = true;
            s.shared = true;
        });
        assert!(pool.create_replica(&window, 4096).is_err());
    }

    #[test]
    fn dirty_replica_writes_back_on_flush() {
        let (pool, window) = pool();
        let replica = pool.create_replica(&window, 4096).unwrap();
        {
            let mut bytes = replica.local_bytes.lock().unwrap();
            bytes[0..5].copy_from_slice(b"DIRTY");
        }
        replica.dirty.store(true, Ordering::Release);
        pool.flush_replica(&window, 4096).unwrap();
        let mut out = [0u8; 5];
        window.read(4096, &mut out);
        assert_eq!(&out, b"DIRTY");
    }

    #[test]
    fn count_objects_combines_inactive_and_quarter_active() {
        let (pool, window) = pool();
        for i in 0..8 {
            pool.create_replica(&window, i * 4096).unwrap();
        }
        assert_eq!(pool.count_objects(), 8 / 4);
    }

    #[test]
    fn scan_objects_on_small_lists_returns_early_without_freeing() {
        let (pool, window) = pool();
        pool.create_replica(&window, 4096).unwrap();
        let freed = pool.scan_objects(&window, 256);
        assert!(freed < 256);
    }

    #[test]
    fn flush_all_reclaims_every_replica() {
        let (pool, window) = pool();
        for i in 0..16 {
            pool.create_replica(&window, i * 4096).unwrap();
        }
        let freed = pool.flush_all(&window);
        assert_eq!(freed, 16);
        assert_eq!(pool.allocated_pages(), 0);
    }
}
