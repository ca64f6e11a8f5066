//! Control surface: enable/disable coherence, start/stop the replication
//! daemon, flush all replicas, and read/reset counters (spec §6 "System
//! calls or equivalent RPC endpoints" / §4.5 "sysfs-style counters").
//!
//! The original implementation exposed this as sysfs attribute files (a
//! reset-on-write-1 endpoint for counters, plain read/write files for the
//! rest). The closest idiomatic host-process equivalent is a small RPC
//! protocol: length-prefixed JSON (`serde_json`) requests and responses
//! over a Unix-domain socket. The teacher's own IPC layer has no RPC
//! framing to borrow (`ipc::rpc` is an unfinished stub); the fixed-width
//! length header ahead of a variable-length payload instead matches this
//! crate's own `ipc::message` wire codec's preference for an explicit
//! size field over implicit framing. `node` runs the listener side; `ctl`
//! is a thin client.

use std::io::{self, Read, Write};

use serde::{Deserialize, Serialize};

/// Number of bytes in the length prefix ahead of every JSON frame.
const FRAME_HEADER_LEN: usize = 4;

/// One control-surface request (spec §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ControlRequest {
    /// Enable servicing of local faults and remote messages.
    EnableCoherence,
    /// Disable the receive loop without tearing down state (spec §5: the
    /// receive loop sleeps rather than exits while disabled).
    DisableCoherence,
    /// Start the periodic hotness/replication daemon.
    StartReplication { interval_secs: u64, hot_page_percent: u8 },
    /// Stop the periodic hotness/replication daemon.
    StopReplication,
    /// Age every replica to inactive and reclaim the whole pool (spec §4.4
    /// "explicit flush").
    FlushAll,
    /// Read the current counter snapshot.
    Stats,
    /// Reset fault counters to zero.
    ResetStats,
}

/// Counter snapshot returned by [`ControlRequest::Stats`] (spec §4.5, §6).
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub fault_reads: u64,
    pub fault_writes: u64,
    pub replica_allocated: u64,
    pub replica_hits: u64,
    pub replica_creates: u64,
    pub replica_frees: u64,
    pub coherence_enabled: bool,
    pub replication_enabled: bool,
}

/// One control-surface response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ControlResponse {
    Ok,
    Stats(StatsSnapshot),
    Error(String),
}

/// Write one length-prefixed JSON frame.
pub fn write_frame<W: Write, T: Serialize>(writer: &mut W, value: &T) -> io::Result<()> {
    let body = serde_json::to_vec(value).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = u32::try_from(body.len()).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&body)?;
    writer.flush()
}

/// Read one length-prefixed JSON frame.
pub fn read_frame<R: Read, T: for<'de> Deserialize<'de>>(reader: &mut R) -> io::Result<T> {
    let mut header = [0u8; FRAME_HEADER_LEN];
    reader.read_exact(&mut header)?;
    let len = u32::from_le_bytes(header) as usize;
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body)?;
    serde_json::from_slice(&body).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

/// Applies a [`ControlRequest`] against a running [`crate::CoherenceNode`],
/// producing the matching [`ControlResponse`]. Kept generic over the
/// transport/window types rather than tied to `CoherenceNode` directly so
/// `node`'s socket-accept loop can share one surface across connections
/// without re-deriving the dispatch logic per binary.
pub struct ControlSurface<T: crate::ipc::Transport + 'static, W: crate::window::SharedWindow + 'static> {
    node: std::sync::Arc<crate::CoherenceNode<T, W>>,
}

impl<T: crate::ipc::Transport + 'static, W: crate::window::SharedWindow + 'static> ControlSurface<T, W> {
    pub fn new(node: std::sync::Arc<crate::CoherenceNode<T, W>>) -> Self {
        Self { node }
    }

    pub fn handle(&self, request: ControlRequest) -> ControlResponse {
        match request {
            ControlRequest::EnableCoherence => {
                self.node.runtime().set_coherence_enabled(true);
                ControlResponse::Ok
            }
            ControlRequest::DisableCoherence => {
                self.node.runtime().set_coherence_enabled(false);
                ControlResponse::Ok
            }
            ControlRequest::StartReplication {
                interval_secs,
                hot_page_percent,
            } => {
                self.node
                    .runtime()
                    .start_replication(std::time::Duration::from_secs(interval_secs), hot_page_percent);
                ControlResponse::Ok
            }
            ControlRequest::StopReplication => {
                self.node.runtime().stop_replication();
                ControlResponse::Ok
            }
            ControlRequest::FlushAll => {
                self.node
                    .engine()
                    .replicas()
                    .flush_all(self.node.window().as_ref());
                ControlResponse::Ok
            }
            ControlRequest::Stats => {
                let counters = &self.node.engine().counters;
                let replicas = self.node.engine().replicas();
                ControlResponse::Stats(StatsSnapshot {
                    fault_reads: counters.fault_reads.load(std::sync::atomic::Ordering::Relaxed),
                    fault_writes: counters.fault_writes.load(std::sync::atomic::Ordering::Relaxed),
                    replica_allocated: replicas.allocated_pages(),
                    replica_hits: replicas.hit_count(),
                    replica_creates: replicas.create_count(),
                    replica_frees: replicas.free_count(),
                    coherence_enabled: self.node.runtime().is_coherence_enabled(),
                    replication_enabled: self.node.runtime().is_replication_enabled(),
                })
            }
            ControlRequest::ResetStats => {
                self.node.engine().counters.reset();
                ControlResponse::Ok
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeConfig;
    use crate::ipc::LoopbackNetwork;
    use crate::window::InMemoryWindow;
    use crate::CoherenceNode;
    use std::sync::Arc;

    fn surface() -> ControlSurface<crate::ipc::LoopbackTransport, InMemoryWindow> {
        let config = NodeConfig {
            node_count: 2,
            ..NodeConfig::default()
        };
        let transport = Arc::new(LoopbackNetwork::build(2).remove(0));
        let window = Arc::new(InMemoryWindow::new(1 << 16));
        let node = Arc::new(CoherenceNode::new(&config, transport, window));
        ControlSurface::new(node)
    }

    #[test]
    fn frame_round_trips_through_a_byte_buffer() {
        let mut buf = Vec::new();
        write_frame(&mut buf, &ControlRequest::Stats).unwrap();
        let decoded: ControlRequest = read_frame(&mut buf.as_slice()).unwrap();
        assert!(matches!(decoded, ControlRequest::Stats));
    }

    #[test]
    fn disable_then_enable_toggles_runtime_flag() {
        let surface = surface();
        assert!(matches!(surface.handle(ControlRequest::DisableCoherence), ControlResponse::Ok));
        assert!(!surface.node.runtime().is_coherence_enabled());
        assert!(matches!(surface.handle(ControlRequest::EnableCoherence), ControlResponse::Ok));
        assert!(surface.node.runtime().is_coherence_enabled());
    }

    #[test]
    fn stats_request_reports_zeroed_counters_initially() {
        let surface = surface();
        match surface.handle(ControlRequest::Stats) {
            ControlResponse::Stats(snapshot) => {
                assert_eq!(snapshot.fault_reads, 0);
                assert_eq!(snapshot.replica_allocated, 0);
            }
            other => panic!("expected Stats, got {other:?}"),
        }
    }

    #[test]
    fn flush_all_reclaims_outstanding_replicas() {
        let surface = surface();
        let window = surface.node.window().clone();
        surface
            .node
            .engine()
            .replicas()
            .create_replica(window.as_ref(), 0x1000)
            .unwrap();
        assert!(matches!(surface.handle(ControlRequest::FlushAll), ControlResponse::Ok));
        assert_eq!(surface.node.engine().replicas().allocated_pages(), 0);
    }

    #[test]
    fn reset_stats_clears_fault_counters() {
        let surface = surface();
        surface
            .node
            .engine()
            .counters
            .fault_reads
            .fetch_add(5, std::sync::atomic::Ordering::Relaxed);
        surface.handle(ControlRequest::ResetStats);
        match surface.handle(ControlRequest::Stats) {
            ControlResponse::Stats(snapshot) => assert_eq!(snapshot.fault_reads, 0),
            other => panic!("expected Stats, got {other:?}"),
        }
    }
}
