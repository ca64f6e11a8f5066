//! Transport abstraction over the messaging ring (spec §4.2/§5).
//!
//! The fault engine talks to peers only through this trait, the same
//! seam the teacher's `ipc` layer draws between its queue implementation
//! and callers that just need to send/receive framed messages. Two
//! implementations: [`RingTransport`], backed by [`RingSet`] for real
//! multi-process runs, and [`LoopbackTransport`], an in-process
//! channel-based stand-in used by the test suite so coherence logic can
//! be exercised without standing up real shared memory.

use std::sync::mpsc::{Receiver, Sender};
use std::sync::{Arc, Mutex};

use super::message::Message;
use super::ring::{RingSet, SendOutcome};
use crate::error::{CoreError, Result};

/// Everything the fault engine needs from the messaging layer.
pub trait Transport: Send + Sync {
    /// This node's id.
    fn self_node(&self) -> u32;

    /// Total node count in the cluster.
    fn node_count(&self) -> u32;

    /// Send one message to `dest`.
    fn unicast(&self, dest: u32, msg: &Message) -> Result<()>;

    /// Send one message to every other node.
    fn broadcast(&self, msg: &Message) -> Result<()>;

    /// Non-blocking poll for the next inbound message, if any.
    fn poll(&self) -> Option<Message>;
}

/// Production transport, backed by the shared-memory ring set.
pub struct RingTransport {
    self_node: u32,
    rings: Arc<RingSet>,
}

impl RingTransport {
    pub fn new(self_node: u32, rings: Arc<RingSet>) -> Self {
        Self { self_node, rings }
    }
}

impl Transport for RingTransport {
    fn self_node(&self) -> u32 {
        self.self_node
    }

    fn node_count(&self) -> u32 {
        self.rings.node_count()
    }

    fn unicast(&self, dest: u32, msg: &Message) -> Result<()> {
        match self.rings.send(self.self_node, dest, msg) {
            SendOutcome::Sent => Ok(()),
            SendOutcome::Dropped => Err(CoreError::OutOfResources {
                resource: "messaging ring slot",
            }),
        }
    }

    fn broadcast(&self, msg: &Message) -> Result<()> {
        match self.rings.broadcast(self.self_node, msg) {
            SendOutcome::Sent => Ok(()),
            SendOutcome::Dropped => Err(CoreError::OutOfResources {
                resource: "messaging ring slot",
            }),
        }
    }

    fn poll(&self) -> Option<Message> {
        self.rings.poll(self.self_node).map(|(_, msg)| msg)
    }
}

/// In-process loopback transport for tests: every node's inbox is a plain
/// `mpsc` channel, and peers are wired together by [`LoopbackNetwork`].
pub struct LoopbackTransport {
    self_node: u32,
    peers: Vec<Sender<Message>>,
    inbox: Mutex<Receiver<Message>>,
}

impl Transport for LoopbackTransport {
    fn self_node(&self) -> u32 {
        self.self_node
    }

    fn node_count(&self) -> u32 {
        self.peers.len() as u32
    }

    fn unicast(&self, dest: u32, msg: &Message) -> Result<()> {
        self.peers
            .get(dest as usize)
            .ok_or(CoreError::InvalidNode { node: dest })?
            .send(*msg)
            .map_err(|_| CoreError::TransportUnavailable)
    }

    fn broadcast(&self, msg: &Message) -> Result<()> {
        for (node, peer) in self.peers.iter().enumerate() {
            if node as u32 == self.self_node {
                continue;
            }
            peer.send(*msg).map_err(|_| CoreError::TransportUnavailable)?;
        }
        Ok(())
    }

    fn poll(&self) -> Option<Message> {
        self.inbox.lock().unwrap().try_recv().ok()
    }
}

/// Builds a fully connected set of [`LoopbackTransport`]s, one per node,
/// for use in integration tests.
pub struct LoopbackNetwork;

impl LoopbackNetwork {
    pub fn build(node_count: u32) -> Vec<LoopbackTransport> {
        let mut senders = Vec::with_capacity(node_count as usize);
        let mut receivers = Vec::with_capacity(node_count as usize);
        for _ in 0..node_count {
            let (tx, rx) = std::sync::mpsc::channel();
            senders.push(tx);
            receivers.push(rx);
        }
        receivers
            .into_iter()
            .enumerate()
            .map(|(node, rx)| LoopbackTransport {
                self_node: node as u32,
                peers: senders.clone(),
                inbox: Mutex::new(rx),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::message::MessageType;

    fn msg(from: u32, to: u32) -> Message {
        Message {
            msg_type: MessageType::Fetch,
            ws_id: 0,
            from_node: from as i32,
            to_node: to as i32,
            offset: 0,
            page_order: 0,
            acked_fault_count: 0,
        }
    }

    #[test]
    fn loopback_unicast_delivers_to_addressed_node_only() {
        let net = LoopbackNetwork::build(3);
        net[0].unicast(2, &msg(0, 2)).unwrap();
        assert!(net[1].poll().is_none());
        let received = net[2].poll().unwrap();
        assert_eq!(received.from_node, 0);
    }

    #[test]
    fn loopback_broadcast_reaches_every_other_node() {
        let net = LoopbackNetwork::build(3);
        net[0].broadcast(&msg(0, 0)).unwrap();
        assert!(net[1].poll().is_some());
        assert!(net[2].poll().is_some());
        assert!(net[0].poll().is_none());
    }

    #[test]
    fn unicast_to_unknown_node_is_invalid_node_error() {
        let net = LoopbackNetwork::build(2);
        assert_eq!(
            net[0].unicast(9, &msg(0, 9)).unwrap_err(),
            CoreError::InvalidNode { node: 9 }
        );
    }
}
