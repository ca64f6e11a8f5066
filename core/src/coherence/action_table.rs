//! The 32-entry MSI action table (spec §4.1).
//!
//! Indexed by the 5-bit combination of REMOTE, NEEDWRITE, REPLICATED,
//! MODIFIED, SHARED. The three probe bits (REPLICATED, MODIFIED, SHARED)
//! encode the page's effective state on this node:
//!
//! | REPLICATED | MODIFIED | SHARED | state    |
//! |---|---|---|---|
//! | 0 | _ | _ | I |
//! | 1 | 0 | 1 | S |
//! | 1 | 1 | 0 | M |
//! | 1 | 1 | 1 | S-stale |
//!
//! REMOTE distinguishes `on_remote_message` (servicing a peer's FETCH or
//! INVALIDATE) from `on_local_fault`; when REMOTE is set, NEEDWRITE means
//! the inbound message is an INVALIDATE rather than a FETCH.

use super::handle::HandleFlags;
use bitflags::bitflags;

bitflags! {
    /// Work items chosen for one fault. LOCAL-side bits are consumed by
    /// `on_local_fault`; REMOTE-side bits by `on_remote_message` (spec
    /// §4.1).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ActionMask: u16 {
        /// LOCAL: broadcast FETCH/INVALIDATE and block on the wait station.
        const ISSUE_SYNC_TRANSACTION      = 1 << 0;
        /// LOCAL: broadcast FETCH and return immediately (latency hiding).
        const ISSUE_ASYNC_TRANSACTION     = 1 << 1;
        /// LOCAL: an async transaction for this page is already in flight;
        /// attach and block on its completion instead of issuing a new one.
        const WAIT_FOR_ASYNC_TRANSACTION  = 1 << 2;
        /// Update this node's persistent page-state bits.
        const UPDATE_METADATA             = 1 << 3;
        /// LOCAL: map the faulting address to the resolved frame.
        const MAP_VPN_TO_PFN              = 1 << 4;
        /// REMOTE: drain modified replica data back to the original page.
        const WRITEBACK                   = 1 << 5;
        /// REMOTE: unmap and free the local replica.
        const INVALIDATE                  = 1 << 6;
        /// REMOTE: send exactly one ACK/NACK back to the sender.
        const RESPOND                     = 1 << 7;
    }
}

/// The invalid cell declared by spec §4.1: a replicated page cannot be
/// both Modified and Shared (S-stale) while also being asked to take a
/// write-class transition, whether that request originates locally
/// (`on_local_fault` write fault) or remotely (`on_remote_message`
/// INVALIDATE). Spec §9 leaves this reachable under race orderings rather
/// than proven unreachable; [`super::fault_engine`] treats it as a
/// [`crate::error::CoreError::InvariantViolation`] and falls back to the
/// nearest valid transition (see `DESIGN.md`).
pub fn is_invalid_cell(flags: HandleFlags) -> bool {
    flags.contains(HandleFlags::NEEDWRITE | HandleFlags::REPLICATED | HandleFlags::MODIFIED | HandleFlags::SHARED)
}

const fn bit(mask: ActionMask) -> u16 {
    mask.bits()
}

const fn local_entry(replicated: bool, modified: bool, shared: bool, needwrite: bool) -> u16 {
    if needwrite && replicated && modified && shared {
        return 0; // invalid cell, see `is_invalid_cell`
    }
    if !replicated {
        // State I: always need a transaction (FETCH for read, INVALIDATE
        // broadcast for write). Sync-vs-async for the read case is a
        // runtime decision in the fault engine, not encoded here.
        return bit(ActionMask::ISSUE_SYNC_TRANSACTION)
            | bit(ActionMask::UPDATE_METADATA)
            | bit(ActionMask::MAP_VPN_TO_PFN);
    }
    if replicated && shared && modified {
        // S-stale: refresh before serving a read; write case handled above.
        return bit(ActionMask::ISSUE_SYNC_TRANSACTION)
            | bit(ActionMask::UPDATE_METADATA)
            | bit(ActionMask::MAP_VPN_TO_PFN);
    }
    if replicated && shared && !modified {
        // State S.
        if needwrite {
            // S -> M: INVALIDATE broadcast.
            return bit(ActionMask::ISSUE_SYNC_TRANSACTION)
                | bit(ActionMask::UPDATE_METADATA)
                | bit(ActionMask::MAP_VPN_TO_PFN);
        }
        // Already S: serve the replica directly.
        return bit(ActionMask::MAP_VPN_TO_PFN);
    }
    // State M (replicated && !shared && modified): already exclusive
    // owner, local read or write both hit the replica with no transaction.
    bit(ActionMask::MAP_VPN_TO_PFN)
}

const fn remote_entry(replicated: bool, modified: bool, shared: bool, needwrite: bool) -> u16 {
    if needwrite && replicated && modified && shared {
        return 0; // invalid cell
    }
    if !needwrite {
        // Inbound FETCH.
        if replicated && !shared && modified {
            // We hold M: writeback before handing off, downgrade to S.
            return bit(ActionMask::WRITEBACK) | bit(ActionMask::UPDATE_METADATA) | bit(ActionMask::RESPOND);
        }
        // I, S, or S-stale: nothing to writeback, just acknowledge.
        return bit(ActionMask::RESPOND);
    }
    // Inbound INVALIDATE.
    if !replicated {
        // Nothing local to give up.
        return bit(ActionMask::RESPOND);
    }
    if replicated && !shared && modified {
        // We hold M: writeback, then invalidate.
        return bit(ActionMask::WRITEBACK)
            | bit(ActionMask::INVALIDATE)
            | bit(ActionMask::UPDATE_METADATA)
            | bit(ActionMask::RESPOND);
    }
    // S or S-stale: drop our copy, no writeback owed.
    bit(ActionMask::INVALIDATE) | bit(ActionMask::UPDATE_METADATA) | bit(ActionMask::RESPOND)
}

const fn action_for(index: u8) -> ActionMask {
    let remote = index & HandleFlags::REMOTE.bits() != 0;
    let needwrite = index & HandleFlags::NEEDWRITE.bits() != 0;
    let replicated = index & HandleFlags::REPLICATED.bits() != 0;
    let modified = index & HandleFlags::MODIFIED.bits() != 0;
    let shared = index & HandleFlags::SHARED.bits() != 0;

    let bits = if remote {
        remote_entry(replicated, modified, shared, needwrite)
    } else {
        local_entry(replicated, modified, shared, needwrite)
    };
    ActionMask::from_bits_truncate(bits)
}

const ACTION_TABLE: [ActionMask; 32] = {
    let mut table = [ActionMask::empty(); 32];
    let mut i = 0u8;
    while i < 32 {
        table[i as usize] = action_for(i);
        i += 1;
    }
    table
};

/// Look up the action mask for `flags`. Always returns a usable mask, even
/// for the declared-invalid cell (see [`is_invalid_cell`] to detect and log
/// that case before acting on the fallback).
pub fn lookup(flags: HandleFlags) -> ActionMask {
    ACTION_TABLE[flags.table_index() as usize]
}
