//! Endpoint (§4.5): aggregates every `Conn` sharing one peer identity
//! (a connected switch, or a connected controller) behind a single
//! `ConnId → Conn` map, a shared transaction store, and — for
//! controller-attached identities — role arbitration.

use std::collections::HashMap;
use std::time::Instant;

use flowplane_time::Deadline;
use tracing::info;

use crate::conn::{Conn, ConnEvent};
use crate::error::{CloseReason, CoreError};
use crate::frame::{ConnId, CtlId, DpId, Frame, Xid};
use crate::journal::Journal;
use crate::role::{evaluate_role_request, Role, RoleRequestOutcome};
use crate::transaction::{RegisterOutcome, Transaction, TransactionStore};

/// Which kind of peer identity this Endpoint aggregates. `Ctl` endpoints
/// exist only while this `Core` is acting in the datapath role, `Dp`
/// endpoints only while it is acting in the controller role (§4.5, §4.6).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Identity {
    Dp(DpId),
    Ctl(CtlId),
}

/// Which async notifications a Ctl-Endpoint currently receives, separately
/// configurable for when it holds MASTER/EQUAL versus SLAVE (real OpenFlow
/// controllers expect exactly this split: SLAVE never receives PACKET_IN).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AsyncMask {
    pub packet_in: bool,
    pub flow_removed: bool,
    pub port_status: bool,
}

impl AsyncMask {
    pub const ALL: Self = Self { packet_in: true, flow_removed: true, port_status: true };
    pub const NONE: Self = Self { packet_in: false, flow_removed: false, port_status: false };
}

#[derive(Clone, Copy, Debug)]
pub struct AsyncConfig {
    pub master_equal: AsyncMask,
    pub slave: AsyncMask,
}

impl Default for AsyncConfig {
    /// Role-default template (§4.5): MASTER/EQUAL get everything, SLAVE gets
    /// nothing until the application widens it.
    fn default() -> Self {
        Self { master_equal: AsyncMask::ALL, slave: AsyncMask::NONE }
    }
}

struct RoleState {
    role: Role,
    generation_id: Option<u64>,
    async_config: AsyncConfig,
}

impl RoleState {
    fn effective_mask(&self) -> AsyncMask {
        match self.role {
            Role::Slave => self.async_config.slave,
            _ => self.async_config.master_equal,
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub enum AsyncKind {
    PacketIn,
    FlowRemoved,
    PortStatus,
}

pub struct Endpoint {
    identity: Identity,
    conns: HashMap<ConnId, Conn>,
    negotiated_version: Option<u8>,
    transactions: TransactionStore,
    role_state: Option<RoleState>,
    journal: Journal,
}

impl Endpoint {
    pub fn new_dp(dpid: DpId) -> Self {
        Self {
            identity: Identity::Dp(dpid),
            conns: HashMap::new(),
            negotiated_version: None,
            transactions: TransactionStore::new(),
            role_state: None,
            journal: Journal::default(),
        }
    }

    pub fn new_ctl(ctlid: CtlId) -> Self {
        Self {
            identity: Identity::Ctl(ctlid),
            conns: HashMap::new(),
            negotiated_version: None,
            transactions: TransactionStore::new(),
            role_state: Some(RoleState {
                role: Role::Equal,
                generation_id: None,
                async_config: AsyncConfig::default(),
            }),
            journal: Journal::default(),
        }
    }

    pub fn identity(&self) -> Identity {
        self.identity
    }

    pub fn is_established(&self) -> bool {
        self.conns.get(&ConnId::MAIN).is_some_and(|c| c.state() == crate::conn::State::Established)
    }

    pub fn negotiated_version(&self) -> Option<u8> {
        self.negotiated_version
    }

    pub fn journal(&self) -> &Journal {
        &self.journal
    }

    /// Places `conn` under its conn-id. The first conn must be `ConnId::MAIN`
    /// and establishes the Endpoint's negotiated version; later conns must
    /// agree with it, and (for `Dp` identities) must have learned the same
    /// `dpid` as the main conn, per §4.5.
    pub fn add_conn(&mut self, conn: Conn, now: Instant) -> Result<(), CoreError> {
        let conn_id = conn.conn_id();
        if self.conns.is_empty() && !conn_id.is_main() {
            return Err(CoreError::NoSuchConn(conn_id));
        }
        if let Some(version) = self.negotiated_version {
            if conn.negotiated_version() != Some(version) {
                return Err(CoreError::DuplicateIdentity);
            }
            if let Identity::Dp(DpId(expected)) = self.identity {
                if conn.learned_dpid().is_some_and(|got| got != expected) {
                    return Err(CoreError::DuplicateIdentity);
                }
            }
        } else {
            self.negotiated_version = conn.negotiated_version();
        }
        self.journal.record(now, format!("conn {conn_id} joined endpoint"));
        self.conns.insert(conn_id, conn);
        Ok(())
    }

    /// Removes `conn_id`. Returns `true` if this was the main conn, meaning
    /// the whole Endpoint must now be torn down by the caller (§4.5).
    pub fn remove_conn(&mut self, conn_id: ConnId, now: Instant) -> bool {
        self.conns.remove(&conn_id);
        let transactions = self.transactions.clear_conn(conn_id);
        if !transactions.is_empty() {
            self.journal.record(now, format!("flushed {} transaction(s) on closed conn {conn_id}", transactions.len()));
        }
        if conn_id.is_main() {
            self.journal.record(now, "main conn removed, tearing down endpoint");
            self.conns.clear();
            true
        } else {
            false
        }
    }

    pub fn conn_mut(&mut self, conn_id: ConnId) -> Option<&mut Conn> {
        self.conns.get_mut(&conn_id)
    }

    pub fn conn_ids(&self) -> impl Iterator<Item = ConnId> + '_ {
        self.conns.keys().copied()
    }

    /// Dispatches `frame` on `conn_id` (§4.5: `conn_id == 0` always valid if
    /// present; others only if present, else `NoSuchConn`).
    pub fn send(&mut self, conn_id: ConnId, frame: Frame) -> Result<(), CoreError> {
        self.conns.get_mut(&conn_id).ok_or(CoreError::NoSuchConn(conn_id))?.send(frame)
    }

    pub fn tick(&mut self, now: Instant) -> Vec<(ConnId, ConnEvent)> {
        self.conns
            .iter_mut()
            .filter_map(|(id, conn)| conn.tick(now).map(|e| (*id, e)))
            .collect()
    }

    pub fn take_outbound(&mut self, conn_id: ConnId) -> Vec<u8> {
        self.conns.get_mut(&conn_id).map(|c| c.take_outbound()).unwrap_or_default()
    }

    pub fn allocate_xid(&mut self) -> Xid {
        self.transactions.allocate_xid()
    }

    pub fn register_request(&mut self, xid: Xid, message_type: u8, origin: ConnId, deadline: Deadline) -> RegisterOutcome {
        self.transactions.register(xid, message_type, origin, deadline)
    }

    pub fn match_reply(&mut self, xid: Xid, expected_type: u8) -> Option<Transaction> {
        self.transactions.take_matching(xid, expected_type)
    }

    pub fn sweep_transactions(&mut self, now: Instant) -> Vec<(Xid, Transaction)> {
        self.transactions.sweep(now)
    }

    // --- Role arbitration, Ctl identities only (§4.5) ---

    pub fn role(&self) -> Option<Role> {
        self.role_state.as_ref().map(|r| r.role)
    }

    /// Applies one ROLE_REQUEST. `Stale` is returned verbatim for the caller
    /// to reply with ROLE_REQUEST_FAILED/STALE; otherwise returns whether
    /// this endpoint just became MASTER, so the caller (`Core`) can demote
    /// every other MASTER Ctl-Endpoint sharing this local identity.
    pub fn apply_role_request(&mut self, requested: Role, generation_id: u64, now: Instant) -> RoleRequestOutcome {
        let Some(state) = &mut self.role_state else {
            return RoleRequestOutcome::Stale;
        };
        let outcome = evaluate_role_request(state.generation_id, state.role, requested, generation_id);
        if let RoleRequestOutcome::Accepted { .. } = outcome {
            if requested != Role::NoChange {
                state.generation_id = Some(generation_id);
                state.role = requested;
                state.async_config = AsyncConfig::default();
                self.journal.record(now, format!("role changed to {requested:?}"));
                info!(role = ?requested, "role changed");
            }
        }
        outcome
    }

    pub fn demote_from_master(&mut self, now: Instant) {
        if let Some(state) = &mut self.role_state {
            if state.role == Role::Master {
                state.role = Role::Slave;
                state.async_config = AsyncConfig::default();
                self.journal.record(now, "demoted to SLAVE: another controller became MASTER");
            }
        }
    }

    /// Sends one async notification if this endpoint's current role
    /// permits `kind`, always on the main conn (§4.5, Ctl-Endpoints only).
    pub fn send_async(&mut self, kind: AsyncKind, frame: Frame) -> Result<(), CoreError> {
        let Some(state) = &self.role_state else {
            return Err(CoreError::NotConnected);
        };
        let mask = state.effective_mask();
        let permitted = match kind {
            AsyncKind::PacketIn => mask.packet_in,
            AsyncKind::FlowRemoved => mask.flow_removed,
            AsyncKind::PortStatus => mask.port_status,
        };
        if !permitted {
            return Ok(());
        }
        self.send(ConnId::MAIN, frame)
    }

    pub fn close_reason_for_teardown() -> CloseReason {
        CloseReason::EndpointTornDown
    }
}
