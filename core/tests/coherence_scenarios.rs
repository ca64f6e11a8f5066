//! End-to-end coherence scenarios exercised across multiple in-process
//! nodes connected by `LoopbackTransport`, one `InMemoryWindow` standing in
//! for the fabric-shared memory all nodes address identically.

use std::sync::Arc;
use std::time::Duration;

use swc_core::coherence::{FaultEngine, FaultOutcome, PageTable};
use swc_core::error::CoreError;
use swc_core::ipc::{LoopbackNetwork, LoopbackTransport, WaitStationRegistry};
use swc_core::window::{InMemoryWindow, SharedWindow};
use swc_core::coherence::ReplicaPool;

const PAGE: usize = 4096;

fn cluster(node_count: u32) -> (Vec<Arc<FaultEngine<LoopbackTransport>>>, Arc<InMemoryWindow>) {
    let transports = LoopbackNetwork::build(node_count);
    let window = Arc::new(InMemoryWindow::new(PAGE * 64));
    let engines = transports
        .into_iter()
        .enumerate()
        .map(|(id, transport)| {
            let pages = Arc::new(PageTable::new());
            Arc::new(FaultEngine::new(
                id as u32,
                Arc::new(transport),
                pages.clone(),
                Arc::new(ReplicaPool::new(PAGE, pages)),
                // soft_threshold 0 forces every transaction down the
                // synchronous path, matching the end-to-end scenarios'
                // wording ("broadcasts FETCH, receives ACKs from all
                // peers") rather than the latency-hiding async path.
                Arc::new(WaitStationRegistry::new(64, 0)),
            ))
        })
        .collect();
    (engines, window)
}

/// Spawns a background thread that drains `engine`'s transport and feeds
/// every inbound message through `on_remote_message`, the way
/// `NodeRuntime::spawn_receive_loop` does, so synchronous transactions from
/// peers actually resolve.
fn spawn_receiver(engine: Arc<FaultEngine<LoopbackTransport>>, window: Arc<InMemoryWindow>) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || {
        for _ in 0..200 {
            match engine.transport_poll() {
                Some(msg) => engine.on_remote_message(window.as_ref(), &msg),
                None => std::thread::sleep(Duration::from_millis(2)),
            }
        }
    })
}

/// Scenario 1: cold read.
#[test]
fn cold_read_creates_a_replica_and_marks_shared() {
    let (engines, window) = cluster(2);
    let a = engines[0].clone();
    let b = engines[1].clone();
    // A's own receive loop must run concurrently to process the ACK reply
    // its synchronous FETCH is blocked waiting on; B's receive loop
    // services the FETCH itself.
    let a_receiver = spawn_receiver(a.clone(), window.clone());
    let b_receiver = spawn_receiver(b.clone(), window.clone());

    let outcome = a.on_local_fault(window.as_ref(), 0x10_000, false).unwrap();
    assert_eq!(outcome, FaultOutcome::Mapped { replica: true });

    let state = a.page_table().get(0x10_000);
    assert!(state.shared && !state.modified);

    // Subsequent reads hit local state without any new transaction.
    let outcome2 = a.on_local_fault(window.as_ref(), 0x10_000, false).unwrap();
    assert_eq!(outcome2, FaultOutcome::Mapped { replica: true });

    a_receiver.join().unwrap();
    b_receiver.join().unwrap();
}

/// Scenario 2: upgrade to write invalidates a peer's shared copy.
#[test]
fn write_upgrade_invalidates_peer_shared_copy() {
    let (engines, window) = cluster(2);
    let a = engines[0].clone();
    let b = engines[1].clone();

    // Pre-establish both A and B as S on the page (bypassing the fault path
    // since only the write-upgrade transition is under test here).
    a.page_table().update(0x10_000, |s| {
        s.shared = true;
        s.replicated = true;
    });
    b.page_table().update(0x10_000, |s| {
        s.shared = true;
        s.replicated = true;
    });

    // A's own receive loop must run concurrently to process the ACK reply
    // its synchronous INVALIDATE is blocked waiting on.
    let a_receiver = spawn_receiver(a.clone(), window.clone());
    let b_receiver = spawn_receiver(b.clone(), window.clone());
    let outcome = a.on_local_fault(window.as_ref(), 0x10_000, true).unwrap();
    assert_eq!(outcome, FaultOutcome::Mapped { replica: true });
    a_receiver.join().unwrap();
    b_receiver.join().unwrap();

    let a_state = a.page_table().get(0x10_000);
    assert!(a_state.modified && !a_state.shared);

    let b_state = b.page_table().get(0x10_000);
    assert!(!b_state.shared && !b_state.replicated);
}

/// Scenario 3: a remote read against a modified page forces a write-back.
#[test]
fn remote_read_against_modified_writes_back_dirty_bytes() {
    let (engines, window) = cluster(2);
    let a = engines[0].clone();
    let b = engines[1].clone();

    a.page_table().update(0x20_000, |s| {
        s.modified = true;
        s.replicated = true;
    });
    let replica = a.replicas().create_replica(window.as_ref(), 0x20_000).unwrap_or_else(|_| {
        // `create_replica` skips stale-shared pages, not modified-only ones,
        // so this path is taken; fall back defensively if semantics change.
        a.replicas().get(0x20_000).expect("replica exists")
    });
    {
        let mut bytes = replica.local_bytes.lock().unwrap();
        bytes[0..5].copy_from_slice(b"HELLO");
    }
    replica.dirty.store(true, std::sync::atomic::Ordering::Release);

    // B's own receive loop must run concurrently to process the ACK reply
    // its synchronous FETCH is blocked waiting on; A's receive loop services
    // the FETCH and performs the write-back.
    let a_receiver = spawn_receiver(a.clone(), window.clone());
    let b_receiver = spawn_receiver(b.clone(), window.clone());
    let outcome = b.on_local_fault(window.as_ref(), 0x20_000, false).unwrap();
    assert_eq!(outcome, FaultOutcome::Mapped { replica: true });
    a_receiver.join().unwrap();
    b_receiver.join().unwrap();

    let mut out = [0u8; 5];
    window.read(0x20_000, &mut out);
    assert_eq!(&out, b"HELLO");

    let a_state = a.page_table().get(0x20_000);
    assert!(!a_state.modified);
}

/// Scenario 4: concurrent writers on the same page tie-break on the lower
/// node id when acked-fault-counts are equal.
#[test]
fn concurrent_writers_tie_break_on_lower_node_id() {
    let (engines, window) = cluster(2);
    let a = engines[0].clone(); // node id 0, wins ties
    let b = engines[1].clone(); // node id 1

    for engine in [&a, &b] {
        engine.page_table().update(0x30_000, |s| {
            s.replicated = true;
            s.shared = true;
        });
    }

    let a_receiver = spawn_receiver(a.clone(), window.clone());
    let b_receiver = spawn_receiver(b.clone(), window.clone());

    let a_handle = {
        let a = a.clone();
        let window = window.clone();
        std::thread::spawn(move || a.on_local_fault(window.as_ref(), 0x30_000, true))
    };
    let b_handle = {
        let b = b.clone();
        let window = window.clone();
        std::thread::spawn(move || b.on_local_fault(window.as_ref(), 0x30_000, true))
    };

    let a_result = a_handle.join().unwrap();
    let b_result = b_handle.join().unwrap();
    a_receiver.join().unwrap();
    b_receiver.join().unwrap();

    // Both engines start this fault with acked_fault_count == 0, so
    // `remote_priority`'s tie-break is deterministic: the lower node id
    // (A) wins and becomes M, B's write loses and must retry.
    assert!(a_result.is_ok(), "A (lower id) must win the tie: {a_result:?}");
    assert!(a.page_table().get(0x30_000).modified, "A must become M after winning");
    assert_eq!(b_result, Err(CoreError::RetryFault));
}

/// Scenario 6: reclaim under pressure frees replicas once the pool has
/// enough inactive pages to satisfy the request.
#[test]
fn reclaim_under_pressure_eventually_frees_requested_count() {
    let pool = ReplicaPool::new(PAGE, Arc::new(PageTable::new()));
    let window = InMemoryWindow::new(PAGE * 1100);
    for i in 0..1000u64 {
        pool.create_replica(&window, i * PAGE as u64).unwrap();
    }

    // `scan_objects` pages everything it needs to age within its bounded
    // retry budget; looping the call mirrors the daemon driving multiple
    // ticks until the request is satisfied or the pool is exhausted.
    let mut freed = 0;
    for _ in 0..8 {
        freed += pool.scan_objects(&window, 256);
        if freed >= 256 {
            break;
        }
    }
    assert!(freed >= 256 || pool.allocated_pages() < 512, "freed={freed}");
}
