//! Software-managed shared-window coherence core.
//!
//! Three subsystems tied together by [`CoherenceNode`]: the page coherence
//! engine (`coherence::fault_engine`), the inter-node messaging ring
//! (`ipc::ring`), and the replica pool/aging manager (`coherence::replica`),
//! plus the wait-station registry (`ipc::wait_station`) and hotness sampler
//! (`coherence::hotness`) that back the replication daemon.

pub mod cacheops;
pub mod config;
pub mod control;
pub mod coherence;
pub mod error;
pub mod ipc;
pub mod logging;
pub mod window;

use std::sync::Arc;

use config::NodeConfig;
use coherence::{FaultEngine, NodeRuntime, PageTable, ReplicaPool, Sampler};
use ipc::{Transport, WaitStationRegistry};
use window::SharedWindow;

/// Wires one node's fault engine, replica pool, wait stations, hotness
/// sampler, and background runtime together from a [`NodeConfig`] (spec §2
/// "System overview" / §5 scheduling model). `node::main` constructs one of
/// these per process; tests construct the pieces directly when they need
/// finer control (see `coherence::fault_engine` and `coherence::daemon`
/// unit tests).
pub struct CoherenceNode<T: Transport + 'static, W: SharedWindow + 'static> {
    engine: Arc<FaultEngine<T>>,
    window: Arc<W>,
    runtime: NodeRuntime<T, W>,
}

impl<T: Transport + 'static, W: SharedWindow + 'static> CoherenceNode<T, W> {
    /// Assemble a node from its transport and shared window. The page table
    /// is shared between the fault engine and the replica pool, matching
    /// spec §4.1/§4.4's shared metadata probe.
    pub fn new(config: &NodeConfig, transport: Arc<T>, window: Arc<W>) -> Self {
        let pages = Arc::new(PageTable::new());
        let replicas = Arc::new(ReplicaPool::new(config::PAGE_SIZE as usize, pages.clone()));
        let stations = Arc::new(WaitStationRegistry::new(
            config.wait_station_pool,
            config.soft_threshold_count(),
        ));
        let engine = Arc::new(FaultEngine::new(config.node_id, transport, pages, replicas, stations));
        let sampler = Arc::new(Sampler::new());
        let runtime = NodeRuntime::new(
            engine.clone(),
            window.clone(),
            sampler,
            config.hot_page_percent,
            std::time::Duration::from_secs(config.replication_interval_secs),
        );
        Self { engine, window, runtime }
    }

    pub fn engine(&self) -> &Arc<FaultEngine<T>> {
        &self.engine
    }

    pub fn window(&self) -> &Arc<W> {
        &self.window
    }

    pub fn runtime(&self) -> &NodeRuntime<T, W> {
        &self.runtime
    }

    /// Start the receive loop, async-completion daemon, and hotness daemon
    /// (spec §5).
    pub fn start(&self) {
        self.runtime.spawn_workers();
    }

    /// Join every background worker, flushing all replicas on the way out
    /// (spec §4.4 "explicit flush").
    pub fn shutdown(&self) {
        self.runtime.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::LoopbackNetwork;
    use crate::window::InMemoryWindow;

    #[test]
    fn node_assembles_from_config_and_reports_enabled_coherence() {
        let config = NodeConfig {
            node_count: 2,
            ..NodeConfig::default()
        };
        let transport = Arc::new(LoopbackNetwork::build(2).remove(0));
        let window = Arc::new(InMemoryWindow::new(1 << 16));
        let node = CoherenceNode::new(&config, transport, window);
        assert!(node.runtime().is_coherence_enabled());
        assert_eq!(node.engine().page_table().get(0).replicated, false);
    }
}
