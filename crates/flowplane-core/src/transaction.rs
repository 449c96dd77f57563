//! Per-Endpoint transaction store (§4.3): correlates a request's `xid` with
//! its expected reply so that a reply arriving on any `ConnId` of the same
//! Endpoint can be matched against the request that originated it.

use std::collections::HashMap;
use std::time::Instant;

use flowplane_time::Deadline;
use tracing::warn;

use crate::frame::{ConnId, Xid};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Transaction {
    pub message_type: u8,
    pub origin_conn_id: ConnId,
    pub deadline: Deadline,
}

#[derive(Debug, PartialEq, Eq)]
pub enum RegisterOutcome {
    Ok,
    Busy,
}

pub struct TransactionStore {
    next_xid: Xid,
    inflight: HashMap<Xid, Transaction>,
}

impl Default for TransactionStore {
    fn default() -> Self {
        Self { next_xid: 0, inflight: HashMap::new() }
    }
}

impl TransactionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Draws the next xid from the monotonic counter, skipping any value
    /// that collides with an outstanding transaction (§4.3's "collisions
    /// resolved by skipping").
    pub fn allocate_xid(&mut self) -> Xid {
        loop {
            let candidate = self.next_xid;
            self.next_xid = self.next_xid.wrapping_add(1);
            if !self.inflight.contains_key(&candidate) {
                return candidate;
            }
        }
    }

    pub fn register(
        &mut self,
        xid: Xid,
        message_type: u8,
        origin_conn_id: ConnId,
        deadline: Deadline,
    ) -> RegisterOutcome {
        if self.inflight.contains_key(&xid) {
            return RegisterOutcome::Busy;
        }
        self.inflight.insert(xid, Transaction { message_type, origin_conn_id, deadline });
        RegisterOutcome::Ok
    }

    /// Removes and returns the transaction for `xid` iff its recorded
    /// message type matches `expected_type`. A mismatch is left in place
    /// (a genuine reply may still arrive) and journalled by the caller.
    pub fn take_matching(&mut self, xid: Xid, expected_type: u8) -> Option<Transaction> {
        let entry = self.inflight.get(&xid)?;
        if entry.message_type != expected_type {
            warn!(xid, expected_type, actual_type = entry.message_type, "transaction type mismatch");
            return None;
        }
        self.inflight.remove(&xid)
    }

    /// Drops every in-flight transaction, e.g. when the owning Conn closes
    /// (§5, "flushes transactions owned by it with a CONNECTION_CLOSED
    /// signal"). Returns the ones that belonged to `conn_id`.
    pub fn clear_conn(&mut self, conn_id: ConnId) -> Vec<(Xid, Transaction)> {
        let (owned, rest): (Vec<_>, Vec<_>) =
            self.inflight.drain().partition(|(_, t)| t.origin_conn_id == conn_id);
        self.inflight = rest.into_iter().collect();
        owned
    }

    /// Removes and returns every transaction whose deadline has passed.
    pub fn sweep(&mut self, now: Instant) -> Vec<(Xid, Transaction)> {
        let (expired, remaining): (Vec<_>, Vec<_>) =
            self.inflight.drain().partition(|(_, t)| t.deadline.is_past(now));
        self.inflight = remaining.into_iter().collect();
        expired
    }

    pub fn len(&self) -> usize {
        self.inflight.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inflight.is_empty()
    }
}
