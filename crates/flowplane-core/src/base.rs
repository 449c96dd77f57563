//! `Core` (§4.6): owns every listener, the `DpId`/`CtlId` Endpoint maps, and
//! the global generation-id used by role arbitration. Knows nothing about
//! `mio`/reactor mechanics directly — it is driven by the Dispatcher through
//! token-addressed events and hands back outbound bytes for the Dispatcher
//! to write.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Instant;

use flowplane_net::tcp::Token;
use flowplane_util::safe_panic;
use tracing::{info, warn};

use crate::config::Config;
use crate::conn::{Conn, ConnEvent, LocalRole};
use crate::control::{self, decode_role_message, encode_role_reply, ErrorKind, RoleMessage};
use crate::endpoint::{AsyncKind, Endpoint, Identity};
use crate::error::{CloseReason, CoreError, TransportError};
use crate::frame::{ConnId, CtlId, DpId, Frame};
use crate::role::{Role, RoleRequestOutcome};
use crate::version::VersionBitmap;

/// A `Conn` that has not yet joined an Endpoint: still negotiating, or
/// (controller-role only) established but awaiting its FEATURES_REPLY.
struct PendingConn {
    conn: Conn,
    local_role: LocalRole,
    /// Present only for actively-originated conns, so a reconnect can be
    /// retried at the same address under a new `Token`.
    dial_addr: Option<SocketAddr>,
}

/// Where an established, routed conn lives.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Route {
    identity: Identity,
    conn_id: ConnId,
}

/// Events the Dispatcher must react to after driving one `Core` method:
/// write `bytes` to `token` (if non-empty), and/or surface the message to
/// the application.
#[derive(Default)]
pub struct CoreOutcome {
    pub writes: Vec<(Token, Vec<u8>)>,
    pub established: Vec<(Token, Identity)>,
    pub messages: Vec<(Identity, ConnId, Frame)>,
    /// `identity` is `None` when the closed conn never made it past pending
    /// (negotiating, or awaiting FEATURES_REPLY) and so never joined an
    /// Endpoint.
    pub closed: Vec<(Token, Option<Identity>)>,
    /// Requests whose deadline passed before a matching reply arrived
    /// (§5's per-second transaction sweep).
    pub timeouts: Vec<(Identity, crate::frame::Xid, crate::transaction::Transaction)>,
}

impl CoreOutcome {
    fn write(&mut self, token: Token, bytes: Vec<u8>) {
        if !bytes.is_empty() {
            self.writes.push((token, bytes));
        }
    }
}

pub struct Core {
    config: Config,
    supported: VersionBitmap,
    listener_roles: HashMap<Token, LocalRole>,
    pending: HashMap<Token, PendingConn>,
    routes: HashMap<Token, Route>,
    dp_endpoints: HashMap<DpId, Endpoint>,
    ctl_endpoints: HashMap<CtlId, Endpoint>,
    next_ctlid: u64,
    generation_id: u64,
}

impl Core {
    pub fn new(config: Config, supported: VersionBitmap) -> Self {
        Self {
            config,
            supported,
            listener_roles: HashMap::new(),
            pending: HashMap::new(),
            routes: HashMap::new(),
            dp_endpoints: HashMap::new(),
            ctl_endpoints: HashMap::new(),
            next_ctlid: 1,
            generation_id: 0,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn register_listener(&mut self, token: Token, role: LocalRole) {
        self.listener_roles.insert(token, role);
    }

    /// A listener accepted a new peer. Builds a passive `Conn` (HELLO
    /// already queued) and stages it as pending.
    pub fn on_accept(&mut self, listener: Token, stream_token: Token, now: Instant) -> Vec<u8> {
        let Some(&local_role) = self.listener_roles.get(&listener) else {
            warn!(?listener, "accept on unknown listener token");
            return Vec::new();
        };
        let mut conn = Conn::new_passive(ConnId::MAIN, local_role, self.supported, &self.config, now);
        let outbound = conn.take_outbound();
        self.pending.insert(stream_token, PendingConn { conn, local_role, dial_addr: None });
        outbound
    }

    /// Begins an actively-originated connection: call `reactor.connect(addr)`
    /// first, then register its token here.
    pub fn begin_connect(&mut self, token: Token, addr: SocketAddr, local_role: LocalRole) {
        let conn = Conn::new_active(ConnId::MAIN, local_role, self.supported, &self.config);
        self.pending.insert(token, PendingConn { conn, local_role, dial_addr: Some(addr) });
    }

    pub fn on_tcp_established(&mut self, token: Token, now: Instant) -> Vec<u8> {
        let Some(pending) = self.pending.get_mut(&token) else {
            warn!(?token, "tcp established for unknown token");
            return Vec::new();
        };
        pending.conn.on_tcp_established(now);
        pending.conn.take_outbound()
    }

    /// Returns the dial address to retry and a fresh token placeholder is
    /// the Dispatcher's job to obtain from the reactor; call
    /// [`Core::rekey_pending`] once it has one.
    pub fn on_tcp_failed(&mut self, token: Token, now: Instant, err: std::io::Error) -> Option<SocketAddr> {
        let pending = self.pending.get_mut(&token)?;
        let _event = pending.conn.on_tcp_failed(now, err);
        pending.dial_addr
    }

    /// Moves bookkeeping for a pending conn from `old` to `new` after the
    /// Dispatcher re-dials it under a fresh reactor token.
    pub fn rekey_pending(&mut self, old: Token, new: Token) {
        if let Some(pending) = self.pending.remove(&old) {
            self.pending.insert(new, pending);
        }
    }

    pub fn due_reconnects(&self, now: Instant) -> Vec<(Token, SocketAddr)> {
        self.pending
            .iter()
            .filter_map(|(token, p)| {
                let addr = p.dial_addr?;
                p.conn.reconnect_due(now).then_some((*token, addr))
            })
            .collect()
    }

    pub fn note_reconnect_attempt(&mut self, token: Token) {
        if let Some(pending) = self.pending.get_mut(&token) {
            pending.conn.note_reconnect_attempt();
        }
    }

    /// The reactor tore `token`'s socket down (peer closed, or a read/write
    /// error). Closes whichever `Conn` owned it, pending or routed, and
    /// reports the teardown.
    pub fn on_disconnect(&mut self, token: Token, now: Instant) -> CoreOutcome {
        let mut outcome = CoreOutcome::default();
        if let Some(route) = self.routes.get(&token).copied() {
            if let Some(endpoint) = self.endpoint_mut(route.identity) {
                if let Some(conn) = endpoint.conn_mut(route.conn_id) {
                    conn.close(now, CloseReason::Transport(TransportError::PeerClosed));
                }
            }
            self.teardown_routed(token, route, now, &mut outcome);
        } else if let Some(mut pending) = self.pending.remove(&token) {
            pending.conn.close(now, CloseReason::Transport(TransportError::PeerClosed));
            outcome.closed.push((token, None));
        }
        outcome
    }

    /// Feeds bytes arriving on `token` to whichever conn owns it (pending or
    /// routed), producing everything the Dispatcher must act on.
    pub fn on_bytes(&mut self, token: Token, bytes: &[u8], now: Instant) -> CoreOutcome {
        let mut outcome = CoreOutcome::default();
        if let Some(route) = self.routes.get(&token).copied() {
            self.on_bytes_routed(token, route, bytes, now, &mut outcome);
        } else if self.pending.contains_key(&token) {
            self.on_bytes_pending(token, bytes, now, &mut outcome);
        } else {
            warn!(?token, "bytes for unknown token");
        }
        outcome
    }

    fn on_bytes_pending(&mut self, token: Token, bytes: &[u8], now: Instant, outcome: &mut CoreOutcome) {
        let Some(mut pending) = self.pending.remove(&token) else { return };
        let events = pending.conn.on_bytes(bytes, now);
        outcome.write(token, pending.conn.take_outbound());
        let local_role = pending.local_role;

        for event in events {
            match event {
                ConnEvent::Established { .. } if local_role == LocalRole::Controller => {
                    let req = Frame::new(pending.conn.negotiated_version().unwrap_or(1), control::TYPE_FEATURES_REQUEST, 0, &[]);
                    let _ = pending.conn.send(req);
                    outcome.write(token, pending.conn.take_outbound());
                }
                ConnEvent::Established { .. } => {
                    self.pending.insert(token, pending);
                    self.finalize_ctl(token, now, outcome);
                    return;
                }
                ConnEvent::Message { frame } if frame.msg_type() == control::TYPE_FEATURES_REPLY => {
                    self.pending.insert(token, pending);
                    // Any further events already produced in this same batch
                    // are not replayed against the endpoint the conn just
                    // joined; FEATURES_REPLY is expected to be the sole
                    // payload of its frame in practice.
                    self.finalize_dp(token, frame, now, outcome);
                    return;
                }
                ConnEvent::Closed { .. } => {
                    outcome.closed.push((token, None));
                    return;
                }
                ConnEvent::NegotiationFailed { .. } | ConnEvent::Message { .. } => {}
            }
        }

        self.pending.insert(token, pending);
    }

    fn finalize_ctl(&mut self, token: Token, now: Instant, outcome: &mut CoreOutcome) {
        let Some(pending) = self.pending.remove(&token) else { return };
        let ctlid = CtlId(self.next_ctlid);
        self.next_ctlid += 1;
        let mut endpoint = Endpoint::new_ctl(ctlid);
        if endpoint.add_conn(pending.conn, now).is_ok() {
            info!(?ctlid, "controller attached");
            self.ctl_endpoints.insert(ctlid, endpoint);
            self.routes.insert(token, Route { identity: Identity::Ctl(ctlid), conn_id: ConnId::MAIN });
            outcome.established.push((token, Identity::Ctl(ctlid)));
        }
    }

    fn finalize_dp(&mut self, token: Token, features_reply: Frame, now: Instant, outcome: &mut CoreOutcome) {
        let Some(dpid) = control::decode_features_reply_dpid(&features_reply) else {
            warn!(?token, "FEATURES_REPLY missing dpid");
            return;
        };
        let Some(pending) = self.pending.remove(&token) else { return };
        let dpid = DpId(dpid);
        let endpoint = self.dp_endpoints.entry(dpid).or_insert_with(|| Endpoint::new_dp(dpid));
        if endpoint.add_conn(pending.conn, now).is_ok() {
            info!(?dpid, "switch attached");
            self.routes.insert(token, Route { identity: Identity::Dp(dpid), conn_id: ConnId::MAIN });
            outcome.established.push((token, Identity::Dp(dpid)));
        } else if endpoint.conn_ids().next().is_none() {
            self.dp_endpoints.remove(&dpid);
        }
    }

    fn on_bytes_routed(&mut self, token: Token, route: Route, bytes: &[u8], now: Instant, outcome: &mut CoreOutcome) {
        let Some(endpoint) = self.endpoint_mut(route.identity) else { return };
        let Some(conn) = endpoint.conn_mut(route.conn_id) else { return };
        let events = conn.on_bytes(bytes, now);
        outcome.write(token, conn.take_outbound());

        for event in events {
            match event {
                ConnEvent::Message { frame } => self.handle_routed_message(token, route, frame, now, outcome),
                ConnEvent::Closed { .. } => self.teardown_routed(token, route, now, outcome),
                ConnEvent::Established { .. } | ConnEvent::NegotiationFailed { .. } => {}
            }
        }
    }

    fn handle_routed_message(&mut self, token: Token, route: Route, frame: Frame, now: Instant, outcome: &mut CoreOutcome) {
        if let Identity::Ctl(ctlid) = route.identity {
            if frame.msg_type() == control::TYPE_ROLE_REQUEST {
                self.handle_role_request(token, route, frame, now, outcome);
                return;
            }
            if control::is_modifying_request(frame.msg_type())
                && self.ctl_endpoints.get(&ctlid).and_then(Endpoint::role) == Some(Role::Slave)
            {
                self.reject_slave_modifying_request(token, route, ctlid, &frame, outcome);
                return;
            }
        }
        outcome.messages.push((route.identity, route.conn_id, frame));
    }

    /// §6.4/§7: a SLAVE-role controller sending a modifying request (e.g.
    /// FLOW_MOD) is rejected with BAD_REQUEST/IS_SLAVE carrying the first 64
    /// octets of the offending frame; the request is never forwarded and the
    /// connection stays open.
    fn reject_slave_modifying_request(&mut self, token: Token, route: Route, ctlid: CtlId, frame: &Frame, outcome: &mut CoreOutcome) {
        let version = self.ctl_endpoints.get(&ctlid).and_then(Endpoint::negotiated_version).unwrap_or(frame.version());
        let bytes = frame.as_bytes();
        let payload = &bytes[..64.min(bytes.len())];
        let reply = control::encode_error_frame(version, frame.xid(), ErrorKind::BadRequestIsSlave, payload);
        if let Some(endpoint) = self.ctl_endpoints.get_mut(&ctlid) {
            if endpoint.send(route.conn_id, reply).is_ok() {
                outcome.write(token, endpoint.take_outbound(route.conn_id));
            }
        }
    }

    fn handle_role_request(&mut self, token: Token, route: Route, frame: Frame, now: Instant, outcome: &mut CoreOutcome) {
        let Identity::Ctl(ctlid) = route.identity else {
            safe_panic!("role request routed to non-Ctl identity");
            return;
        };
        let Some(RoleMessage { role, generation_id }) = decode_role_message(&frame) else {
            warn!(?ctlid, "malformed ROLE_REQUEST body");
            return;
        };
        let Some(requested) = Role::from_wire(role) else {
            warn!(?ctlid, role, "unknown role value in ROLE_REQUEST");
            return;
        };

        let version = self.ctl_endpoints.get(&ctlid).and_then(Endpoint::negotiated_version).unwrap_or(1);
        let Some(endpoint) = self.ctl_endpoints.get_mut(&ctlid) else { return };
        let role_outcome = endpoint.apply_role_request(requested, generation_id, now);

        let reply = match role_outcome {
            RoleRequestOutcome::Stale => {
                crate::control::encode_error_frame(version, frame.xid(), ErrorKind::RoleRequestFailedStale, &[])
            }
            RoleRequestOutcome::Accepted { promoted_to_master } => {
                if promoted_to_master {
                    self.generation_id = self.generation_id.wrapping_add(1);
                    for (other_id, other) in self.ctl_endpoints.iter_mut() {
                        if *other_id != ctlid {
                            other.demote_from_master(now);
                        }
                    }
                }
                let current_role = self.ctl_endpoints.get(&ctlid).and_then(Endpoint::role).unwrap_or(Role::Equal);
                encode_role_reply(version, frame.xid(), RoleMessage { role: current_role.to_wire(), generation_id })
            }
        };

        if let Some(endpoint) = self.ctl_endpoints.get_mut(&ctlid) {
            if endpoint.send(route.conn_id, reply).is_ok() {
                outcome.write(token, endpoint.take_outbound(route.conn_id));
            }
        }
    }

    fn teardown_routed(&mut self, token: Token, route: Route, now: Instant, outcome: &mut CoreOutcome) {
        self.routes.remove(&token);
        outcome.closed.push((token, Some(route.identity)));
        let torn_down = match self.endpoint_mut(route.identity) {
            Some(endpoint) => endpoint.remove_conn(route.conn_id, now),
            None => return,
        };
        if torn_down {
            match route.identity {
                Identity::Dp(id) => {
                    self.dp_endpoints.remove(&id);
                }
                Identity::Ctl(id) => {
                    self.ctl_endpoints.remove(&id);
                }
            }
        }
    }

    /// Sends `frame` on `(identity, conn_id)`, queuing the encoded bytes
    /// against whichever token currently routes that conn. The sole
    /// synchronous entry point application code (via the Dispatcher's
    /// `wake_up`) uses to originate a message rather than reply to one.
    pub fn send(&mut self, identity: Identity, conn_id: ConnId, frame: Frame, outcome: &mut CoreOutcome) -> Result<(), CoreError> {
        let endpoint = self.endpoint_mut(identity).ok_or(CoreError::NoSuchConn(conn_id))?;
        endpoint.send(conn_id, frame)?;
        let bytes = endpoint.take_outbound(conn_id);
        if let Some(token) = Self::token_for(&self.routes, identity, conn_id) {
            outcome.write(token, bytes);
        }
        Ok(())
    }

    fn endpoint_mut(&mut self, identity: Identity) -> Option<&mut Endpoint> {
        match identity {
            Identity::Dp(id) => self.dp_endpoints.get_mut(&id),
            Identity::Ctl(id) => self.ctl_endpoints.get_mut(&id),
        }
    }

    /// Drives every Conn's per-tick liveness/hello-timeout check (pending
    /// and routed alike) and sweeps every Endpoint's transaction store for
    /// expired requests. Called once per second by the Dispatcher (§5).
    pub fn tick_all(&mut self, now: Instant, outcome: &mut CoreOutcome) {
        let mut closed_pending = Vec::new();
        for (token, pending) in &mut self.pending {
            if let Some(ConnEvent::Closed { .. }) = pending.conn.tick(now) {
                closed_pending.push(*token);
            }
            outcome.write(*token, pending.conn.take_outbound());
        }
        for token in closed_pending {
            self.pending.remove(&token);
            outcome.closed.push((token, None));
        }

        let routes = self.routes.clone();
        let dp_ids: Vec<DpId> = self.dp_endpoints.keys().copied().collect();
        for dpid in dp_ids {
            self.tick_endpoint(Identity::Dp(dpid), &routes, now, outcome);
        }
        let ctl_ids: Vec<CtlId> = self.ctl_endpoints.keys().copied().collect();
        for ctlid in ctl_ids {
            self.tick_endpoint(Identity::Ctl(ctlid), &routes, now, outcome);
        }
    }

    fn tick_endpoint(&mut self, identity: Identity, routes: &HashMap<Token, Route>, now: Instant, outcome: &mut CoreOutcome) {
        let Some(endpoint) = self.endpoint_mut(identity) else { return };
        let expired = endpoint.sweep_transactions(now);
        for (xid, txn) in expired {
            outcome.timeouts.push((identity, xid, txn));
        }

        let conn_ids: Vec<ConnId> = endpoint.conn_ids().collect();
        let events = endpoint.tick(now);

        // `tick` only reports the conns it produced an event for, but a
        // liveness-unremarkable tick (e.g. an ECHO_REQUEST queued without
        // closing) still needs its bytes flushed, so drain every conn here
        // rather than just the ones in `events`.
        for conn_id in conn_ids {
            let Some(token) = routes.iter().find(|(_, r)| r.identity == identity && r.conn_id == conn_id).map(|(t, _)| *t) else {
                continue;
            };
            if let Some(endpoint) = self.endpoint_mut(identity) {
                outcome.write(token, endpoint.take_outbound(conn_id));
            }
        }

        for (conn_id, event) in events {
            if matches!(event, ConnEvent::Closed { .. }) {
                if let Some(token) = routes.iter().find(|(_, r)| r.identity == identity && r.conn_id == conn_id).map(|(t, _)| *t) {
                    self.teardown_routed(token, Route { identity, conn_id }, now, outcome);
                }
            }
        }
    }

    /// Delivers an async notification (PACKET_IN/FLOW_REMOVED/PORT_STATUS)
    /// to every Ctl-Endpoint whose async-config permits it (§4.5). Returns
    /// `NotConnected` if no Ctl-Endpoint is established.
    pub fn fan_out_async(&mut self, kind: AsyncKind, frame: &Frame, outcome: &mut CoreOutcome) -> Result<(), CoreError> {
        let mut delivered = false;
        for (&ctlid, endpoint) in self.ctl_endpoints.iter_mut() {
            if endpoint.is_established() && endpoint.send_async(kind, frame.clone()).is_ok() {
                delivered = true;
                let bytes = endpoint.take_outbound(ConnId::MAIN);
                if let Some(token) = Self::token_for(&self.routes, Identity::Ctl(ctlid), ConnId::MAIN) {
                    outcome.write(token, bytes);
                }
            }
        }
        if delivered {
            Ok(())
        } else {
            Err(CoreError::NotConnected)
        }
    }

    fn token_for(routes: &HashMap<Token, Route>, identity: Identity, conn_id: ConnId) -> Option<Token> {
        routes
            .iter()
            .find(|(_, route)| route.identity == identity && route.conn_id == conn_id)
            .map(|(token, _)| *token)
    }

    pub fn dp_endpoint(&self, dpid: DpId) -> Option<&Endpoint> {
        self.dp_endpoints.get(&dpid)
    }

    pub fn ctl_endpoint(&self, ctlid: CtlId) -> Option<&Endpoint> {
        self.ctl_endpoints.get(&ctlid)
    }

    pub fn generation_id(&self) -> u64 {
        self.generation_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::{encode_hello, TYPE_FEATURES_REPLY, TYPE_FEATURES_REQUEST};

    fn core_with(listener_role: LocalRole) -> (Core, Token) {
        let mut core = Core::new(Config::default(), VersionBitmap::from_versions([1, 4]));
        let listener = Token(0);
        core.register_listener(listener, listener_role);
        (core, listener)
    }

    fn features_reply(version: u8, dpid: u64) -> Frame {
        Frame::new(version, TYPE_FEATURES_REPLY, 0, &dpid.to_be_bytes())
    }

    #[test]
    fn accepting_a_switch_and_its_features_reply_creates_a_dp_endpoint() {
        let (mut core, listener) = core_with(LocalRole::Controller);
        let stream = Token(1);
        let now = Instant::now();

        let our_hello = core.on_accept(listener, stream, now);
        assert!(!our_hello.is_empty());

        let peer_hello = encode_hello(4, 0, VersionBitmap::from_versions([1, 4])).into_bytes();
        let outcome = core.on_bytes(stream, &peer_hello, now);
        assert!(outcome.established.is_empty(), "controller side waits for FEATURES_REPLY first");
        let (_, sent) = outcome.writes.into_iter().next().expect("FEATURES_REQUEST queued");
        assert_eq!(sent[1], TYPE_FEATURES_REQUEST);

        let reply = features_reply(4, 0x42).into_bytes();
        let outcome = core.on_bytes(stream, &reply, now);
        assert_eq!(outcome.established, vec![(stream, Identity::Dp(DpId(0x42)))]);
        assert!(core.dp_endpoint(DpId(0x42)).is_some());
    }

    #[test]
    fn accepting_a_controller_creates_a_ctl_endpoint_without_features_roundtrip() {
        let (mut core, listener) = core_with(LocalRole::Datapath);
        let stream = Token(1);
        let now = Instant::now();

        core.on_accept(listener, stream, now);
        let peer_hello = encode_hello(4, 0, VersionBitmap::from_versions([1, 4])).into_bytes();
        let outcome = core.on_bytes(stream, &peer_hello, now);

        assert_eq!(outcome.established.len(), 1);
        let (_, identity) = outcome.established[0];
        assert!(matches!(identity, Identity::Ctl(_)));
    }

    #[test]
    fn role_request_promotes_one_controller_and_demotes_the_other() {
        let (mut core, listener) = core_with(LocalRole::Datapath);
        let now = Instant::now();

        let token_a = Token(1);
        let token_b = Token(2);
        core.on_accept(listener, token_a, now);
        core.on_bytes(token_a, &encode_hello(4, 0, VersionBitmap::from_versions([1, 4])).into_bytes(), now);
        core.on_accept(listener, token_b, now);
        core.on_bytes(token_b, &encode_hello(4, 0, VersionBitmap::from_versions([1, 4])).into_bytes(), now);

        let role_request = |role: u32, generation_id: u64| {
            let mut body = Vec::with_capacity(16);
            body.extend_from_slice(&role.to_be_bytes());
            body.extend_from_slice(&[0u8; 4]);
            body.extend_from_slice(&generation_id.to_be_bytes());
            Frame::new(4, crate::control::TYPE_ROLE_REQUEST, 1, &body).into_bytes()
        };

        core.on_bytes(token_a, &role_request(Role::Master.to_wire(), 10), now);
        let ctl_a = core.routes.get(&token_a).map(|r| match r.identity {
            Identity::Ctl(id) => id,
            _ => unreachable!(),
        }).unwrap();
        assert_eq!(core.ctl_endpoint(ctl_a).unwrap().role(), Some(Role::Master));

        core.on_bytes(token_b, &role_request(Role::Master.to_wire(), 11), now);
        let ctl_b = core.routes.get(&token_b).map(|r| match r.identity {
            Identity::Ctl(id) => id,
            _ => unreachable!(),
        }).unwrap();
        assert_eq!(core.ctl_endpoint(ctl_b).unwrap().role(), Some(Role::Master));
        assert_eq!(core.ctl_endpoint(ctl_a).unwrap().role(), Some(Role::Slave));
    }

    #[test]
    fn slave_controller_sending_flow_mod_is_rejected_and_not_forwarded() {
        let (mut core, listener) = core_with(LocalRole::Datapath);
        let now = Instant::now();

        let token_a = Token(1);
        let token_b = Token(2);
        core.on_accept(listener, token_a, now);
        core.on_bytes(token_a, &encode_hello(4, 0, VersionBitmap::from_versions([1, 4])).into_bytes(), now);
        core.on_accept(listener, token_b, now);
        core.on_bytes(token_b, &encode_hello(4, 0, VersionBitmap::from_versions([1, 4])).into_bytes(), now);

        let role_request = |role: u32, generation_id: u64| {
            let mut body = Vec::with_capacity(16);
            body.extend_from_slice(&role.to_be_bytes());
            body.extend_from_slice(&[0u8; 4]);
            body.extend_from_slice(&generation_id.to_be_bytes());
            Frame::new(4, crate::control::TYPE_ROLE_REQUEST, 1, &body).into_bytes()
        };

        // token_a becomes MASTER, which demotes token_b (the lone other
        // Ctl-Endpoint) from its initial EQUAL role to SLAVE.
        core.on_bytes(token_a, &role_request(Role::Master.to_wire(), 10), now);
        let ctl_b = core.routes.get(&token_b).map(|r| match r.identity {
            Identity::Ctl(id) => id,
            _ => unreachable!(),
        }).unwrap();
        assert_eq!(core.ctl_endpoint(ctl_b).unwrap().role(), Some(Role::Slave));

        let flow_mod = Frame::new(4, crate::control::TYPE_FLOW_MOD, 7, &[0xaa; 80]).into_bytes();
        let outcome = core.on_bytes(token_b, &flow_mod, now);

        assert!(outcome.messages.is_empty(), "FLOW_MOD from a SLAVE must not reach the application");
        assert!(core.ctl_endpoint(ctl_b).is_some(), "connection stays open");
        let (_, sent) = outcome.writes.into_iter().next().expect("BAD_REQUEST/IS_SLAVE queued");
        assert_eq!(sent[1], crate::control::TYPE_ERROR);
        assert_eq!(&sent[8..10], &1u16.to_be_bytes(), "kind BAD_REQUEST");
        assert_eq!(&sent[10..12], &1u16.to_be_bytes(), "code IS_SLAVE");
        assert_eq!(&sent[12..], &flow_mod[..64], "payload truncated to first 64 octets of the offending frame");
    }

    #[test]
    fn disconnect_tears_down_a_routed_main_conn_and_drops_its_endpoint() {
        let (mut core, listener) = core_with(LocalRole::Datapath);
        let stream = Token(1);
        let now = Instant::now();

        core.on_accept(listener, stream, now);
        let outcome = core.on_bytes(stream, &encode_hello(4, 0, VersionBitmap::from_versions([1, 4])).into_bytes(), now);
        let (_, identity) = outcome.established[0];
        let ctlid = match identity {
            Identity::Ctl(id) => id,
            _ => unreachable!(),
        };
        assert!(core.ctl_endpoint(ctlid).is_some());

        let outcome = core.on_disconnect(stream, now);
        assert_eq!(outcome.closed, vec![(stream, Some(identity))]);
        assert!(core.ctl_endpoint(ctlid).is_none());
    }

    #[test]
    fn tick_all_closes_a_routed_conn_once_echo_liveness_times_out() {
        let (mut core, listener) = core_with(LocalRole::Datapath);
        let stream = Token(1);
        let t0 = Instant::now();

        core.on_accept(listener, stream, t0);
        let outcome = core.on_bytes(stream, &encode_hello(4, 0, VersionBitmap::from_versions([1, 4])).into_bytes(), t0);
        let (_, identity) = outcome.established[0];
        let ctlid = match identity {
            Identity::Ctl(id) => id,
            _ => unreachable!(),
        };

        let mut outcome = CoreOutcome::default();
        core.tick_all(t0 + std::time::Duration::from_secs(6), &mut outcome);
        assert!(outcome.closed.is_empty(), "echo request queued, not yet timed out");
        assert!(core.ctl_endpoint(ctlid).is_some());
        let (_, sent) = outcome.writes.into_iter().next().expect("ECHO_REQUEST queued");
        assert_eq!(sent[1], crate::control::TYPE_ECHO_REQUEST);

        let mut outcome = CoreOutcome::default();
        core.tick_all(t0 + std::time::Duration::from_secs(12), &mut outcome);
        assert_eq!(outcome.closed, vec![(stream, Some(identity))]);
        assert!(core.ctl_endpoint(ctlid).is_none());
    }

    #[test]
    fn tick_all_reports_a_timed_out_transaction_without_touching_the_conn() {
        let (mut core, listener) = core_with(LocalRole::Datapath);
        let stream = Token(1);
        let t0 = Instant::now();

        core.on_accept(listener, stream, t0);
        let outcome = core.on_bytes(stream, &encode_hello(4, 0, VersionBitmap::from_versions([1, 4])).into_bytes(), t0);
        let (_, identity) = outcome.established[0];
        let ctlid = match identity {
            Identity::Ctl(id) => id,
            _ => unreachable!(),
        };

        let xid = {
            let endpoint = core.ctl_endpoints.get_mut(&ctlid).unwrap();
            let xid = endpoint.allocate_xid();
            let deadline = flowplane_time::Deadline::after(t0, std::time::Duration::from_secs(1));
            endpoint.register_request(xid, crate::control::TYPE_ROLE_REQUEST, ConnId::MAIN, deadline);
            xid
        };

        let mut outcome = CoreOutcome::default();
        core.tick_all(t0 + std::time::Duration::from_millis(500), &mut outcome);
        assert!(outcome.timeouts.is_empty(), "deadline hasn't passed yet");

        let mut outcome = CoreOutcome::default();
        core.tick_all(t0 + std::time::Duration::from_secs(2), &mut outcome);
        assert_eq!(outcome.timeouts.len(), 1);
        let (timed_out_identity, timed_out_xid, transaction) = &outcome.timeouts[0];
        assert_eq!(*timed_out_identity, identity);
        assert_eq!(*timed_out_xid, xid);
        assert_eq!(transaction.message_type, crate::control::TYPE_ROLE_REQUEST);
        assert!(core.ctl_endpoint(ctlid).is_some(), "a timed-out transaction doesn't close the conn");
    }
}
