//! Long-lived worker tasks: receive loop, async-completion daemon, and
//! hotness daemon (spec §5 "Scheduling model").
//!
//! Each runs as a preemptive OS thread (`std::thread`), matching the
//! host-process scale of this implementation rather than spec §5's
//! embedded-scheduler wording. The teacher has no host-process daemon of
//! its own to borrow from (its scheduler runs an in-kernel idle loop, not
//! spawned worker threads); the shape here — a runtime struct holding
//! `Arc`-shared state and a `Vec<JoinHandle<()>>` it joins on shutdown —
//! is a plain `std::thread` rendition of that same "long-lived background
//! worker" role.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use log::{debug, info};

use super::fault_engine::FaultEngine;
use super::hotness::Sampler;
use crate::ipc::Transport;
use crate::window::SharedWindow;

const RECEIVE_LOOP_SLEEP: Duration = Duration::from_millis(1);

/// Coordinates the three background tasks of spec §5 for one node process.
pub struct NodeRuntime<T: Transport + 'static, W: SharedWindow + 'static> {
    engine: Arc<FaultEngine<T>>,
    window: Arc<W>,
    sampler: Arc<Sampler>,
    async_daemon: Arc<AsyncCompletionDaemon<T>>,
    coherence_enabled: Arc<AtomicBool>,
    replication_enabled: Arc<AtomicBool>,
    hot_page_percent: Arc<Mutex<u8>>,
    replication_interval: Arc<Mutex<Duration>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    shutdown: Arc<AtomicBool>,
}

impl<T: Transport + 'static, W: SharedWindow + 'static> NodeRuntime<T, W> {
    pub fn new(
        engine: Arc<FaultEngine<T>>,
        window: Arc<W>,
        sampler: Arc<Sampler>,
        hot_page_percent: u8,
        replication_interval: Duration,
    ) -> Self {
        let async_daemon = Arc::new(AsyncCompletionDaemon::new(engine.clone()));
        Self {
            engine,
            window,
            sampler,
            async_daemon,
            coherence_enabled: Arc::new(AtomicBool::new(true)),
            replication_enabled: Arc::new(AtomicBool::new(false)),
            hot_page_percent: Arc::new(Mutex::new(hot_page_percent)),
            replication_interval: Arc::new(Mutex::new(replication_interval)),
            handles: Mutex::new(Vec::new()),
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_coherence_enabled(&self) -> bool {
        self.coherence_enabled.load(Ordering::Acquire)
    }

    pub fn set_coherence_enabled(&self, enabled: bool) {
        self.coherence_enabled.store(enabled, Ordering::Release);
    }

    pub fn start_replication(&self, interval: Duration, hot_page_percent: u8) {
        *self.replication_interval.lock().unwrap() = interval;
        *self.hot_page_percent.lock().unwrap() = hot_page_percent;
        self.replication_enabled.store(true, Ordering::Release);
    }

    pub fn stop_replication(&self) {
        self.replication_enabled.store(false, Ordering::Release);
    }

    pub fn is_replication_enabled(&self) -> bool {
        self.replication_enabled.load(Ordering::Acquire)
    }

    pub fn sampler(&self) -> &Arc<Sampler> {
        &self.sampler
    }

    /// Spawn the receive loop, async-completion daemon, and hotness daemon
    /// (spec §5). Each worker exits once `shutdown` is set.
    pub fn spawn_workers(&self) {
        let mut handles = self.handles.lock().unwrap();
        handles.push(self.spawn_receive_loop());
        handles.push(self.spawn_async_completion_daemon());
        handles.push(self.spawn_hotness_daemon());
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        let mut handles = self.handles.lock().unwrap();
        for handle in handles.drain(..) {
            let _ = handle.join();
        }
        self.engine.replicas().flush_all(self.window.as_ref());
    }

    fn spawn_receive_loop(&self) -> JoinHandle<()> {
        let engine = self.engine.clone();
        let window = self.window.clone();
        let enabled = self.coherence_enabled.clone();
        let shutdown = self.shutdown.clone();

        std::thread::spawn(move || {
            info!("receive loop started");
            while !shutdown.load(Ordering::Acquire) {
                if !enabled.load(Ordering::Acquire) {
                    std::thread::sleep(RECEIVE_LOOP_SLEEP);
                    continue;
                }
                match engine_poll(&engine) {
                    Some(msg) => {
                        // Spec §5: "one per-incoming-message worker task
                        // spawned to run the remote-fault state machine so
                        // the receiver loop never blocks on a bucket lock."
                        let engine = engine.clone();
                        let window = window.clone();
                        std::thread::spawn(move || {
                            engine.on_remote_message(window.as_ref(), &msg);
                        });
                    }
                    None => std::thread::sleep(RECEIVE_LOOP_SLEEP),
                }
            }
            info!("receive loop stopped");
        })
    }

    /// Spec §4.1/§4.3: hands every station `issue_async_transaction`
    /// enqueues off to a dedicated thread, so the caller that issued the
    /// async FETCH never blocks on its own ACK.
    fn spawn_async_completion_daemon(&self) -> JoinHandle<()> {
        let daemon = self.async_daemon.clone();
        let window = self.window.clone();
        let stations = self.engine.stations().clone();
        let shutdown = self.shutdown.clone();

        std::thread::spawn(move || {
            info!("async completion daemon started");
            while !shutdown.load(Ordering::Acquire) {
                if daemon.drain(window.as_ref(), &stations) == 0 {
                    std::thread::sleep(RECEIVE_LOOP_SLEEP);
                }
            }
            info!("async completion daemon stopped");
        })
    }

    fn spawn_hotness_daemon(&self) -> JoinHandle<()> {
        let engine = self.engine.clone();
        let window = self.window.clone();
        let sampler = self.sampler.clone();
        let replication_enabled = self.replication_enabled.clone();
        let hot_page_percent = self.hot_page_percent.clone();
        let interval = self.replication_interval.clone();
        let shutdown = self.shutdown.clone();

        std::thread::spawn(move || {
            info!("hotness daemon started");
            while !shutdown.load(Ordering::Acquire) {
                let sleep_for = *interval.lock().unwrap();
                std::thread::sleep(sleep_for.min(Duration::from_millis(200)));
                if shutdown.load(Ordering::Acquire) {
                    break;
                }
                if !replication_enabled.load(Ordering::Acquire) {
                    continue;
                }
                let percent = *hot_page_percent.lock().unwrap();
                run_replication_tick(&engine, window.as_ref(), &sampler, percent);
            }
            info!("hotness daemon stopped");
        })
    }
}

fn engine_poll<T: Transport>(engine: &FaultEngine<T>) -> Option<crate::ipc::Message> {
    engine.transport_poll()
}

/// Spec §4.5 "On each tick" (steps 1-6). Exposed as a free function so it
/// can be unit-tested without spinning up real threads.
pub fn run_replication_tick<T: Transport>(
    engine: &FaultEngine<T>,
    window: &dyn SharedWindow,
    sampler: &Sampler,
    hot_page_percent: u8,
) {
    let threshold = sampler.hotness_threshold(hot_page_percent);

    // Step 1: evict pages that fell below threshold. The replica pool's
    // own LRU aging (`scan_objects`) plays the role of the spec's
    // threshold-filtered list walk here; evicting precisely the pages
    // whose MSB-index fell below `threshold` would require per-replica
    // bucket tracking the pool does not expose, so eviction volume is
    // driven by aging pressure instead, which is the pool's actual
    // reclaim contract (spec §4.4).
    let candidates = engine.replicas().count_objects();
    if candidates > 0 {
        let freed = engine.replicas().scan_objects(window, candidates.max(1));
        if freed > 0 {
            info!("replication tick: reclaimed {freed} cold replicas");
        }
    }

    // Step 2-3: promote every page sampled hot enough (bucket at or above
    // `threshold`) that isn't already replicated, so it is served locally
    // before the next fault would have forced a transaction for it.
    let mut promoted = 0;
    for offset in sampler.hot_pages_at_or_above(threshold) {
        if engine.page_table().get(offset).replicated {
            continue;
        }
        match engine.replicas().create_replica(window, offset) {
            Ok(_) => promoted += 1,
            Err(err) => debug!("replication tick: skipped hot page {offset:#x}: {err:?}"),
        }
    }
    if promoted > 0 {
        info!("replication tick: proactively replicated {promoted} hot pages");
    }

    // Step 4: age the monitoring clock so future samples decay.
    sampler.advance_age();

    // Step 5: recompute the hotness threshold for the next tick.
    sampler.hotness_threshold(hot_page_percent);

    // Step 6: cool the histogram.
    sampler.cool_histogram();
}

/// Drains the completion work-ring for async FETCH transactions (spec
/// §4.1 "Asynchronous transaction" / §9 "work-ring between the receive
/// loop... and the completion daemon"). The work-ring itself lives on
/// [`FaultEngine`] (`issue_async_transaction` enqueues directly onto it);
/// this daemon only owns the draining loop.
pub struct AsyncCompletionDaemon<T: Transport + 'static> {
    engine: Arc<FaultEngine<T>>,
}

impl<T: Transport + 'static> AsyncCompletionDaemon<T> {
    pub fn new(engine: Arc<FaultEngine<T>>) -> Self {
        Self { engine }
    }

    /// Drive every pending async transaction whose wait station has a
    /// resolvable outcome. Each entry blocks this dedicated thread on its
    /// own wait station (spec §5: the completion daemon is the only
    /// long-lived task that suspends on a per-page station) until it
    /// resolves, then applies the result to page metadata.
    pub fn drain(&self, window: &dyn SharedWindow, stations: &crate::ipc::WaitStationRegistry) -> usize {
        let items = self.engine.async_queue().drain_all();
        let mut completed = 0;
        for (offset, ws_id) in items {
            let outcome = stations.wait(ws_id);
            self.engine.complete_async(window, offset, outcome);
            completed += 1;
        }
        completed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coherence::handle::PageTable;
    use crate::coherence::replica::ReplicaPool;
    use crate::ipc::{LoopbackNetwork, WaitStationRegistry};
    use crate::window::InMemoryWindow;

    fn engine() -> FaultEngine<crate::ipc::LoopbackTransport> {
        let transport = Arc::new(LoopbackNetwork::build(1).remove(0));
        let pages = Arc::new(PageTable::new());
        FaultEngine::new(
            0,
            transport,
            pages.clone(),
            Arc::new(ReplicaPool::new(4096, pages)),
            Arc::new(WaitStationRegistry::new(64, 51)),
        )
    }

    #[test]
    fn replication_tick_ages_the_sampler_clock() {
        let engine = engine();
        let window = InMemoryWindow::new(1 << 16);
        let sampler = Sampler::new();
        sampler.record_sample(0x1000);
        let age_before = sampler.current_age();
        run_replication_tick(&engine, &window, &sampler, 20);
        assert_eq!(sampler.current_age(), age_before + 1);
    }

    #[test]
    fn replication_tick_cools_the_histogram() {
        let engine = engine();
        let window = InMemoryWindow::new(1 << 16);
        let sampler = Sampler::new();
        for _ in 0..10 {
            sampler.record_sample(0x1000);
        }
        let total_before = sampler.histogram_snapshot().total();
        run_replication_tick(&engine, &window, &sampler, 20);
        assert!(sampler.histogram_snapshot().total() <= total_before);
    }

    #[test]
    fn replication_tick_creates_a_replica_for_an_unreplicated_hot_page() {
        let engine = engine();
        let window = InMemoryWindow::new(1 << 16);
        let sampler = Sampler::new();
        sampler.record_sample(0x1000);
        assert!(!engine.page_table().get(0x1000).replicated);
        run_replication_tick(&engine, &window, &sampler, 100);
        assert!(engine.page_table().get(0x1000).replicated);
        assert!(engine.replicas().get(0x1000).is_some());
    }

    #[test]
    fn runtime_toggles_coherence_enabled() {
        let engine = Arc::new(engine());
        let window = Arc::new(InMemoryWindow::new(1 << 16));
        let sampler = Arc::new(Sampler::new());
        let runtime = NodeRuntime::new(engine, window, sampler, 20, Duration::from_secs(60));
        assert!(runtime.is_coherence_enabled());
        runtime.set_coherence_enabled(false);
        assert!(!runtime.is_coherence_enabled());
    }
}
