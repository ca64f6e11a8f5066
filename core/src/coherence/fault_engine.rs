//! The page coherence engine: fault handler, MSI state machine, and
//! remote-fault responder (spec §4.1).

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use log::{debug, warn};

use super::action_table::{self, ActionMask};
use super::handle::{HandleFlags, HandleSlot, HandleTable, PageTable};
use super::replica::ReplicaPool;
use crate::error::{CoreError, Result};
use crate::ipc::{Message, MessageType, StationOutcome, Transport, WaitStationRegistry};
use crate::window::SharedWindow;

/// Read-only observability counters (spec §4.5, §6: "Sysfs-style counters
/// expose fault totals... replica hits, creates, frees, and allocated
/// pages").
#[derive(Default)]
pub struct Counters {
    pub fault_reads: AtomicU64,
    pub fault_writes: AtomicU64,
}

impl Counters {
    pub fn reset(&self) {
        self.fault_reads.store(0, Ordering::Relaxed);
        self.fault_writes.store(0, Ordering::Relaxed);
    }
}

/// FIFO of async FETCH transactions awaiting the completion daemon (spec
/// §4.1/§4.3: `deliver_ack` "hands the station to the async completion
/// work-ring" whenever the acked station was raised with `async_page` set;
/// §5 names the completion daemon the only long-lived task that suspends on
/// a per-page station, so the work-ring itself is just a plain queue here).
#[derive(Default)]
pub struct AsyncQueue {
    pending: Mutex<Vec<(u64, i32)>>,
}

impl AsyncQueue {
    pub fn enqueue(&self, offset: u64, ws_id: i32) {
        self.pending.lock().unwrap().push((offset, ws_id));
    }

    pub fn drain_all(&self) -> Vec<(u64, i32)> {
        std::mem::take(&mut *self.pending.lock().unwrap())
    }
}

/// Outcome of [`FaultEngine::on_local_fault`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultOutcome {
    /// The frame is ready to map; `true` means it's a replica, `false`
    /// means the raw shared page (no coherence transaction was needed, or
    /// the async path returned before the transaction finished).
    Mapped { replica: bool },
}

/// Ties the fault-handle table, page-state table, replica pool, wait
/// stations, and transport together into the engine described by spec
/// §4.1.
pub struct FaultEngine<T: Transport> {
    node_id: u32,
    transport: Arc<T>,
    handles: HandleTable,
    pages: Arc<PageTable>,
    replicas: Arc<ReplicaPool>,
    stations: Arc<WaitStationRegistry>,
    async_queue: AsyncQueue,
    acked_fault_count: AtomicI64,
    pub counters: Counters,
}

impl<T: Transport> FaultEngine<T> {
    /// `pages` must be the same table handed to `replicas`'s `ReplicaPool`:
    /// the engine drives the MSI bits and the pool's stale-shared check reads
    /// them, both against one shared table.
    pub fn new(
        node_id: u32,
        transport: Arc<T>,
        pages: Arc<PageTable>,
        replicas: Arc<ReplicaPool>,
        stations: Arc<WaitStationRegistry>,
    ) -> Self {
        Self {
            node_id,
            transport,
            handles: HandleTable::new(),
            pages,
            replicas,
            stations,
            async_queue: AsyncQueue::default(),
            acked_fault_count: AtomicI64::new(0),
            counters: Counters::default(),
        }
    }

    pub fn page_table(&self) -> &PageTable {
        &self.pages
    }

    pub fn replicas(&self) -> &Arc<ReplicaPool> {
        &self.replicas
    }

    pub fn stations(&self) -> &Arc<WaitStationRegistry> {
        &self.stations
    }

    /// The work-ring the async-completion daemon drains (spec §5).
    pub fn async_queue(&self) -> &AsyncQueue {
        &self.async_queue
    }

    /// Non-blocking poll of this node's inbound transport, for the receive
    /// loop in `daemon.rs`.
    pub fn transport_poll(&self) -> Option<Message> {
        self.transport.poll()
    }

    /// `on_local_fault(offset, is_write)` (spec §4.1).
    pub fn on_local_fault(&self, window: &dyn SharedWindow, offset: u64, is_write: bool) -> Result<FaultOutcome> {
        if is_write {
            self.counters.fault_writes.fetch_add(1, Ordering::Relaxed);
        } else {
            self.counters.fault_reads.fetch_add(1, Ordering::Relaxed);
        }

        let probe = self.pages.get(offset);
        let mut flags = probe.probe_flags();
        flags.set(HandleFlags::NEEDWRITE, is_write);

        if action_table::is_invalid_cell(flags) {
            warn!(
                "fault_engine: invalid action-table cell reached locally at offset {offset:#x}; \
                 treating as forced retry after clearing staleness"
            );
            self.pages.update(offset, |s| s.modified = false);
            return Err(CoreError::RetryFault);
        }

        match self.handles.acquire_or_attach(offset, flags) {
            HandleSlot::Attached(handle) => {
                let must_retry = handle.wait();
                if must_retry {
                    return Err(CoreError::RetryFault);
                }
                self.map_from_state(offset)
            }
            HandleSlot::Owner(handle) => {
                let result = self.drive_local_fault(window, offset, flags);
                self.handles.release(offset);
                handle.complete(result.is_err());
                result
            }
        }
    }

    fn map_from_state(&self, offset: u64) -> Result<FaultOutcome> {
        let state = self.pages.get(offset);
        Ok(FaultOutcome::Mapped {
            replica: state.replicated,
        })
    }

    fn drive_local_fault(&self, window: &dyn SharedWindow, offset: u64, flags: HandleFlags) -> Result<FaultOutcome> {
        let actions = action_table::lookup(flags);
        let mut took_async_path = false;

        if actions.contains(ActionMask::ISSUE_SYNC_TRANSACTION) {
            let is_write = flags.contains(HandleFlags::NEEDWRITE);
            let prefer_async = !is_write && self.stations.below_soft_threshold();

            if prefer_async {
                self.issue_async_transaction(offset)?;
                took_async_path = true;
            } else {
                self.issue_sync_transaction(offset, is_write)?;
            }
        }

        // Async path defers the metadata update to `complete_async`, once
        // the daemon has drained every ACK (spec §4.1).
        if actions.contains(ActionMask::UPDATE_METADATA) && !took_async_path {
            self.apply_local_update(window, offset, flags);
        }

        if took_async_path {
            return Ok(FaultOutcome::Mapped { replica: false });
        }

        self.map_from_state(offset)
    }

    /// Spec §4.1/§4.4: a fault that reaches `UPDATE_METADATA` on the
    /// synchronous path gets a real replica, not just a flipped probe bit.
    /// A page already replicated (the S-stale refresh case) has its
    /// existing replica re-read instead of allocating a second one.
    fn apply_local_update(&self, window: &dyn SharedWindow, offset: u64, flags: HandleFlags) {
        let is_write = flags.contains(HandleFlags::NEEDWRITE);
        let was_replicated = self.pages.get(offset).replicated;
        self.pages.update(offset, |s| {
            s.replicated = true;
            if is_write {
                s.modified = true;
                s.shared = false;
            } else {
                s.shared = true;
                s.modified = false;
            }
        });
        let result = if was_replicated {
            self.replicas.refresh_replica(window, offset)
        } else {
            self.replicas.create_replica(window, offset).map(|_| ())
        };
        if let Err(err) = result {
            warn!("fault_engine: replica pool update failed at offset {offset:#x}: {err:?}");
        }
    }

    /// Spec §4.1 "Synchronous transaction": broadcast, sleep on a station
    /// sized to N-1 peers, retry on any NACK, refresh a stale replica on
    /// success.
    fn issue_sync_transaction(&self, offset: u64, is_write: bool) -> Result<()> {
        let peers = self.transport.node_count().saturating_sub(1);
        let ws_id = self.stations.acquire(peers)?;
        let msg = Message {
            msg_type: if is_write {
                MessageType::Invalidate
            } else {
                MessageType::Fetch
            },
            ws_id,
            from_node: self.node_id as i32,
            to_node: -1,
            offset,
            page_order: 0,
            acked_fault_count: self.acked_fault_count.load(Ordering::Relaxed),
        };
        self.transport.broadcast(&msg)?;

        match self.stations.wait(ws_id) {
            StationOutcome::Nacked => Err(CoreError::RetryFault),
            StationOutcome::Acked => {
                self.acked_fault_count.fetch_add(1, Ordering::Relaxed);
                let state = self.pages.get(offset);
                if state.replicated && !state.shared {
                    // S-stale refresh: nothing to copy over the network in
                    // this host model beyond re-reading the shared page,
                    // which `create_replica`/fault mapping already does.
                    debug!("fault_engine: refreshed stale replica at offset {offset:#x}");
                }
                Ok(())
            }
        }
    }

    /// Spec §4.1 "Asynchronous transaction": latency-hiding path for I→S
    /// reads below the soft threshold. Broadcasts and returns immediately;
    /// resolution happens when the receive loop/daemon drains the ACKs.
    fn issue_async_transaction(&self, offset: u64) -> Result<()> {
        let peers = self.transport.node_count().saturating_sub(1);
        let ws_id = self.stations.acquire(peers)?;
        let msg = Message {
            msg_type: MessageType::Fetch,
            ws_id,
            from_node: self.node_id as i32,
            to_node: -1,
            offset,
            page_order: 0,
            acked_fault_count: self.acked_fault_count.load(Ordering::Relaxed),
        };
        self.transport.broadcast(&msg)?;
        // Hand the station to the async-completion work-ring instead of
        // waiting on it here; the caller maps the raw shared page
        // immediately (MAP_VPN_TO_PFN against un-replicated state) and
        // `complete_async` finishes the transition to S once the daemon
        // drains this entry's ACK.
        self.async_queue.enqueue(offset, ws_id);
        Ok(())
    }

    /// Called by the async-completion daemon once a station acquired via
    /// [`Self::issue_async_transaction`] resolves. Same create-or-refresh
    /// replica handling as [`Self::apply_local_update`]'s synchronous path.
    pub fn complete_async(&self, window: &dyn SharedWindow, offset: u64, outcome: StationOutcome) {
        match outcome {
            StationOutcome::Acked => {
                let was_replicated = self.pages.get(offset).replicated;
                self.pages.update(offset, |s| {
                    s.replicated = true;
                    s.shared = true;
                    s.modified = false;
                });
                let result = if was_replicated {
                    self.replicas.refresh_replica(window, offset)
                } else {
                    self.replicas.create_replica(window, offset).map(|_| ())
                };
                if let Err(err) = result {
                    warn!("fault_engine: async replica pool update failed at offset {offset:#x}: {err:?}");
                }
            }
            StationOutcome::Nacked => {
                warn!("fault_engine: async fetch nacked for offset {offset:#x}, leaving page invalid");
            }
        }
    }

    /// `on_remote_message(msg)` (spec §4.1): always produces exactly one
    /// reply to a FETCH/INVALIDATE request; an ACK/NACK reply instead
    /// resolves the wait station the original requester is blocked on (or
    /// that the async-completion daemon will drain later) and produces no
    /// further message.
    pub fn on_remote_message(&self, window: &dyn SharedWindow, msg: &Message) {
        if msg.msg_type.is_ack() {
            self.stations.deliver_ack(msg.ws_id);
            return;
        }
        if msg.msg_type.is_nack() {
            self.stations.deliver_nack(msg.ws_id);
            return;
        }

        let offset = msg.offset;
        let is_write = msg.msg_type == MessageType::Invalidate;
        let probe = self.pages.get(offset);
        let mut flags = probe.probe_flags();
        flags.insert(HandleFlags::REMOTE);
        flags.set(HandleFlags::NEEDWRITE, is_write);

        if action_table::is_invalid_cell(flags) {
            warn!(
                "fault_engine: invalid action-table cell reached servicing remote message at offset {offset:#x}; \
                 best-effort ACK and cleanup"
            );
            self.pages.update(offset, |s| {
                s.modified = false;
                s.shared = false;
                s.replicated = false;
            });
            self.respond(msg, true);
            return;
        }

        let decision = self.remote_priority(offset, msg, is_write);
        if !decision.ack {
            self.respond(msg, false);
            return;
        }

        // The remote handler services the page's persistent metadata
        // directly (serialized by the `PageTable` bucket lock) rather than
        // installing its own fault handle: the only handle that can exist
        // here belongs to a racing local fault, which `remote_priority`
        // has already judged to have lower priority. That handle's owner
        // is still running; `mark_pending_retry` defers the re-drive until
        // it calls `complete` on its own.
        if decision.set_retry_on_local {
            if let Some(local_handle) = self.handles.peek(offset) {
                local_handle.mark_pending_retry();
            }
        }

        let actions = action_table::lookup(flags);
        self.service_remote(window, offset, actions);
        self.respond(msg, true);
    }

    fn service_remote(&self, window: &dyn SharedWindow, offset: u64, actions: ActionMask) {
        if actions.contains(ActionMask::WRITEBACK) {
            if let Some(replica) = self.replicas.get(offset) {
                let bytes = replica.local_bytes.lock().unwrap();
                window.write(offset, &bytes);
            }
        }
        if actions.contains(ActionMask::INVALIDATE) {
            let _ = self.replicas.flush_replica(window, offset);
        }
        if actions.contains(ActionMask::UPDATE_METADATA) {
            let invalidate = actions.contains(ActionMask::INVALIDATE);
            self.pages.update(offset, |s| {
                if invalidate {
                    s.replicated = false;
                    s.modified = false;
                    s.shared = false;
                } else {
                    // Remote FETCH against our M: downgrade to S.
                    s.modified = false;
                    s.shared = true;
                }
            });
        }
    }

    fn respond(&self, msg: &Message, ack: bool) {
        let reply_type = if ack {
            msg.msg_type.ack_for()
        } else {
            msg.msg_type.nack_for()
        };
        let Some(reply_type) = reply_type else {
            warn!("fault_engine: no ACK/NACK variant for message type {:?}", msg.msg_type);
            return;
        };
        let reply = Message {
            msg_type: reply_type,
            ws_id: msg.ws_id,
            from_node: self.node_id as i32,
            to_node: msg.from_node,
            offset: msg.offset,
            page_order: msg.page_order,
            acked_fault_count: self.acked_fault_count.load(Ordering::Relaxed),
        };
        if let Err(err) = self.transport.unicast(msg.from_node as u32, &reply) {
            warn!("fault_engine: failed to send reply to node {}: {err}", msg.from_node);
        }
    }

    /// Spec §4.1 remote-handler priority rules.
    fn remote_priority(&self, offset: u64, msg: &Message, remote_is_write: bool) -> PriorityDecision {
        match self.handles.peek(offset) {
            None => PriorityDecision {
                ack: true,
                set_retry_on_local: false,
            },
            Some(existing) => {
                let existing_flags = existing.flags();
                if existing_flags.contains(HandleFlags::REMOTE) {
                    // Already servicing a remote request for this page.
                    return PriorityDecision {
                        ack: false,
                        set_retry_on_local: false,
                    };
                }
                let local_is_write = existing_flags.contains(HandleFlags::NEEDWRITE);
                if !remote_is_write && local_is_write {
                    return PriorityDecision {
                        ack: false,
                        set_retry_on_local: false,
                    };
                }
                if remote_is_write && local_is_write {
                    let local_count = self.acked_fault_count.load(Ordering::Relaxed);
                    let remote_wins = msg.acked_fault_count < local_count
                        || (msg.acked_fault_count == local_count && (msg.from_node as u32) < self.node_id);
                    if !remote_wins {
                        return PriorityDecision {
                            ack: false,
                            set_retry_on_local: false,
                        };
                    }
                }
                PriorityDecision {
                    ack: true,
                    set_retry_on_local: remote_is_write,
                }
            }
        }
    }
}

struct PriorityDecision {
    ack: bool,
    set_retry_on_local: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::LoopbackNetwork;
    use crate::window::InMemoryWindow;
    use std::sync::Arc;

    fn engine_pair() -> (
        FaultEngine<crate::ipc::LoopbackTransport>,
        FaultEngine<crate::ipc::LoopbackTransport>,
        InMemoryWindow,
        InMemoryWindow,
    ) {
        let mut transports = LoopbackNetwork::build(2);
        let t1 = Arc::new(transports.remove(1));
        let t0 = Arc::new(transports.remove(0));
        let pages0 = Arc::new(PageTable::new());
        let pages1 = Arc::new(PageTable::new());
        let engine0 = FaultEngine::new(
            0,
            t0,
            pages0.clone(),
            Arc::new(ReplicaPool::new(4096, pages0)),
            Arc::new(WaitStationRegistry::new(64, 51)),
        );
        let engine1 = FaultEngine::new(
            1,
            t1,
            pages1.clone(),
            Arc::new(ReplicaPool::new(4096, pages1)),
            Arc::new(WaitStationRegistry::new(64, 51)),
        );
        (engine0, engine1, InMemoryWindow::new(1 << 20), InMemoryWindow::new(1 << 20))
    }

    #[test]
    fn already_shared_read_maps_without_new_transaction() {
        let (engine, _peer, window, _w1) = engine_pair();
        engine.page_table().update(0x1000, |s| {
            s.replicated = true;
            s.shared = true;
        });
        let outcome = engine.on_local_fault(&window, 0x1000, false).unwrap();
        assert_eq!(outcome, FaultOutcome::Mapped { replica: true });
    }

    #[test]
    fn remote_invalidate_against_shared_transitions_to_invalid() {
        let (engine, _peer, window, _w1) = engine_pair();
        engine.page_table().update(0x2000, |s| {
            s.replicated = true;
            s.shared = true;
        });
        let msg = Message {
            msg_type: MessageType::Invalidate,
            ws_id: 0,
            from_node: 1,
            to_node: 0,
            offset: 0x2000,
            page_order: 0,
            acked_fault_count: 0,
        };
        engine.on_remote_message(&window, &msg);
        let state = engine.page_table().get(0x2000);
        assert!(!state.shared && !state.replicated);
    }

    #[test]
    fn ack_message_resolves_wait_station_instead_of_servicing_a_fault() {
        let (engine, _peer, window, _w1) = engine_pair();
        let ws_id = engine.stations().acquire(1).unwrap();
        let ack = Message {
            msg_type: MessageType::FetchAck,
            ws_id,
            from_node: 1,
            to_node: 0,
            offset: 0x4000,
            page_order: 0,
            acked_fault_count: 0,
        };
        engine.on_remote_message(&window, &ack);
        assert_eq!(engine.stations().wait(ws_id), StationOutcome::Acked);
    }

    #[test]
    fn remote_invariant_violation_clears_flags_and_acks() {
        let (engine, _peer, window, _w1) = engine_pair();
        engine.page_table().update(0x3000, |s| {
            s.replicated = true;
            s.shared = true;
            s.modified = true;
        });
        let msg = Message {
            msg_type: MessageType::Invalidate,
            ws_id: 0,
            from_node: 1,
            to_node: 0,
            offset: 0x3000,
            page_order: 0,
            acked_fault_count: 0,
        };
        engine.on_remote_message(&window, &msg);
        let state = engine.page_table().get(0x3000);
        assert!(!state.modified);
    }
}
