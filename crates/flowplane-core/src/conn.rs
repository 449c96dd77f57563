//! Protocol connection state machine (§4.2): one TCP byte stream's worth of
//! framing, version negotiation, echo liveness, reconnection backoff and
//! outbound backpressure. Knows nothing about sockets — it is fed bytes and
//! hands back bytes to write, leaving actual IO to the reactor the
//! Dispatcher drives.

use std::collections::VecDeque;
use std::time::Instant;

use flowplane_time::{Deadline, Repeater};
use tracing::{debug, warn};

use crate::config::{Config, OutboundQueueLimits, ReconnectPolicy};
use crate::control::{
    self, decode_hello, encode_echo, encode_error_frame, encode_hello, peer_explanation_from_payload,
    ErrorKind,
};
use crate::error::{CloseReason, CoreError, FramingError, TransportError};
use crate::frame::{ConnId, Frame, FrameReader, Xid};
use crate::journal::Journal;
use crate::version::VersionBitmap;

/// Which side of the protocol this `Conn` plays towards its peer. Decides
/// nothing about wire format — both sides speak the same framing — only
/// which Endpoint kind (`Dpt`/`Ctl`) a freshly-established Conn joins.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LocalRole {
    /// The peer is a datapath; we behave as its controller.
    Controller,
    /// The peer is a controller; we behave as the datapath.
    Datapath,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    Disconnected,
    Connecting,
    WaitHello,
    Established,
    Closing,
}

/// What a caller driving a `Conn` must react to.
#[derive(Debug)]
pub enum ConnEvent {
    Established { version: u8 },
    /// A non-control-plane frame, to be decoded by the codec collaborator
    /// and dispatched to the application.
    Message { frame: Frame },
    NegotiationFailed { reason: String },
    Closed { reason: CloseReason },
}

#[derive(Debug, Clone, Copy)]
struct ReconnectState {
    consecutive_failures: u32,
    next_attempt: Deadline,
}

pub struct Conn {
    conn_id: ConnId,
    local_role: LocalRole,
    state: State,
    actively_originated: bool,

    local_bitmap: VersionBitmap,
    negotiated_version: Option<u8>,

    reader: FrameReader,
    outbound: VecDeque<Vec<u8>>,
    outbound_bytes: usize,
    queue_limits: OutboundQueueLimits,

    echo_repeater: Repeater,
    echo_timeout: std::time::Duration,
    echo_pending_since: Option<Instant>,
    echo_xid: Xid,

    reconnect_policy: ReconnectPolicy,
    reconnect: Option<ReconnectState>,

    wait_hello_deadline: Option<Deadline>,

    journal: Journal,

    /// `dpid` learned from FEATURES_REPLY, for datapath-role Conns only.
    learned_dpid: Option<u64>,
    next_control_xid: Xid,
}

const HELLO_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

impl Conn {
    fn base(conn_id: ConnId, local_role: LocalRole, local_bitmap: VersionBitmap, config: &Config, actively_originated: bool) -> Self {
        let now = Instant::now();
        Self {
            conn_id,
            local_role,
            state: State::Disconnected,
            actively_originated,
            local_bitmap,
            negotiated_version: None,
            reader: FrameReader::new(),
            outbound: VecDeque::new(),
            outbound_bytes: 0,
            queue_limits: config.outbound_queue,
            echo_repeater: Repeater::every(config.echo_interval, now),
            echo_timeout: config.echo_timeout,
            echo_pending_since: None,
            echo_xid: 0,
            reconnect_policy: config.reconnect,
            reconnect: None,
            wait_hello_deadline: None,
            journal: Journal::default(),
            learned_dpid: None,
            next_control_xid: 0,
        }
    }

    /// A Conn this side is about to dial. Starts `Connecting`; the caller
    /// must still ask the reactor to `connect()` and report the outcome via
    /// [`Conn::on_tcp_established`]/[`Conn::on_tcp_failed`].
    pub fn new_active(conn_id: ConnId, local_role: LocalRole, local_bitmap: VersionBitmap, config: &Config) -> Self {
        let mut conn = Self::base(conn_id, local_role, local_bitmap, config, true);
        conn.state = State::Connecting;
        conn
    }

    /// A Conn from an already-accepted socket. TCP is already up, so this
    /// starts directly in `WaitHello` and immediately has an outbound HELLO
    /// ready via [`Conn::take_outbound`].
    pub fn new_passive(conn_id: ConnId, local_role: LocalRole, local_bitmap: VersionBitmap, config: &Config, now: Instant) -> Self {
        let mut conn = Self::base(conn_id, local_role, local_bitmap, config, false);
        conn.enter_wait_hello(now);
        conn
    }

    pub fn conn_id(&self) -> ConnId {
        self.conn_id
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn negotiated_version(&self) -> Option<u8> {
        self.negotiated_version
    }

    pub fn learned_dpid(&self) -> Option<u64> {
        self.learned_dpid
    }

    pub fn journal(&self) -> &Journal {
        &self.journal
    }

    fn journal(&mut self, now: Instant, message: impl Into<String>) {
        self.journal.record(now, message);
    }

    fn enter_wait_hello(&mut self, now: Instant) {
        self.state = State::WaitHello;
        self.wait_hello_deadline = Some(Deadline::after(now, HELLO_TIMEOUT));
        let hello = encode_hello(self.local_bitmap.highest().unwrap_or(1), 0, self.local_bitmap);
        self.enqueue_raw(hello.into_bytes());
        self.journal(now, "sent HELLO, awaiting peer HELLO");
    }

    /// Reactor reports the outbound connect succeeded: send our HELLO.
    pub fn on_tcp_established(&mut self, now: Instant) {
        debug_assert_eq!(self.state, State::Connecting);
        if let Some(r) = &mut self.reconnect {
            r.consecutive_failures = 0;
        }
        self.enter_wait_hello(now);
    }

    /// Reactor reports the outbound connect failed.
    pub fn on_tcp_failed(&mut self, now: Instant, source: std::io::Error) -> ConnEvent {
        self.state = State::Disconnected;
        self.schedule_reconnect(now);
        self.journal(now, format!("connect failed: {source}"));
        ConnEvent::Closed { reason: CloseReason::Transport(TransportError::Io(source)) }
    }

    fn schedule_reconnect(&mut self, now: Instant) {
        if !self.actively_originated {
            return;
        }
        let failures = self.reconnect.map(|r| r.consecutive_failures).unwrap_or(0);
        let backoff = self.reconnect_policy.backoff_after(failures);
        self.reconnect = Some(ReconnectState {
            consecutive_failures: failures.saturating_add(1),
            next_attempt: Deadline::after(now, backoff),
        });
    }

    /// Whether an actively-originated, currently-disconnected Conn is due
    /// for another reconnect attempt.
    pub fn reconnect_due(&self, now: Instant) -> bool {
        self.actively_originated
            && self.state == State::Disconnected
            && self.reconnect.is_some_and(|r| r.next_attempt.is_past(now))
    }

    /// Caller is about to ask the reactor to connect again.
    pub fn note_reconnect_attempt(&mut self) {
        self.state = State::Connecting;
    }

    /// Feeds newly-arrived bytes through framing and protocol handling.
    /// Returns every event produced, in order.
    pub fn on_bytes(&mut self, bytes: &[u8], now: Instant) -> Vec<ConnEvent> {
        let mut frames = Vec::new();
        if let Err(err) = self.reader.push(bytes, &mut frames) {
            return vec![self.close(now, CloseReason::Malformed(err))];
        }

        let mut events = Vec::new();
        for frame in frames {
            if let Some(event) = self.handle_frame(frame, now) {
                let closed = matches!(event, ConnEvent::Closed { .. });
                events.push(event);
                if closed {
                    break;
                }
            }
        }
        events
    }

    fn handle_frame(&mut self, frame: Frame, now: Instant) -> Option<ConnEvent> {
        self.echo_repeater.reset(now);

        match self.state {
            State::WaitHello => self.handle_hello(frame, now),
            State::Established => self.handle_established_frame(frame, now),
            State::Connecting | State::Disconnected | State::Closing => {
                debug!(conn_id = ?self.conn_id, state = ?self.state, "dropping frame in non-receiving state");
                None
            }
        }
    }

    fn handle_hello(&mut self, frame: Frame, now: Instant) -> Option<ConnEvent> {
        if frame.msg_type() != control::TYPE_HELLO {
            self.journal(now, "dropped non-HELLO message received before handshake completed");
            return None;
        }
        let hello = match decode_hello(&frame) {
            Ok(h) => h,
            Err(err) => return Some(self.close(now, CloseReason::Malformed(err))),
        };

        let negotiated = match hello.bitmap {
            Some(peer_bitmap) => self.local_bitmap.highest_common(&peer_bitmap),
            None => self.local_bitmap.contains(hello.header_version).then_some(hello.header_version),
        };

        let Some(version) = negotiated else {
            let reason = format!(
                "no common version with peer (local highest {:?})",
                self.local_bitmap.highest()
            );
            let err_frame = encode_error_frame(
                frame.version(),
                frame.xid(),
                ErrorKind::HelloFailedIncompatible,
                reason.as_bytes(),
            );
            self.enqueue_raw(err_frame.into_bytes());
            return Some(self.close(now, CloseReason::NegotiationFailed(reason)));
        };

        self.negotiated_version = Some(version);
        self.state = State::Established;
        self.wait_hello_deadline = None;
        self.echo_repeater.reset(now);
        self.journal(now, format!("established at version {version}"));
        Some(ConnEvent::Established { version })
    }

    fn handle_established_frame(&mut self, frame: Frame, now: Instant) -> Option<ConnEvent> {
        match frame.msg_type() {
            control::TYPE_HELLO => {
                // Idempotence law (§8): a duplicate HELLO while ESTABLISHED
                // is a no-op.
                None
            }
            control::TYPE_ECHO_REQUEST => {
                let reply = encode_echo(true, self.negotiated_version.unwrap_or(1), frame.xid(), frame.body());
                self.enqueue_raw(reply.into_bytes());
                None
            }
            control::TYPE_ECHO_REPLY => {
                if self.echo_pending_since.is_some() && frame.xid() == self.echo_xid {
                    self.echo_pending_since = None;
                    self.journal(now, "echo reply received");
                }
                None
            }
            control::TYPE_ERROR => {
                let explanation = peer_explanation_from_payload(&frame.body()[4.min(frame.body().len())..]);
                warn!(conn_id = ?self.conn_id, %explanation, "peer sent ERROR");
                Some(ConnEvent::Message { frame })
            }
            control::TYPE_FEATURES_REPLY => {
                if let Some(dpid) = control::decode_features_reply_dpid(&frame) {
                    self.learned_dpid = Some(dpid);
                }
                Some(ConnEvent::Message { frame })
            }
            _ => Some(ConnEvent::Message { frame }),
        }
    }

    /// Periodic housekeeping: echo liveness and HELLO timeout. Call once per
    /// loop tick (§5: sweep runs each second).
    pub fn tick(&mut self, now: Instant) -> Option<ConnEvent> {
        if self.state == State::WaitHello {
            if self.wait_hello_deadline.is_some_and(|d| d.is_past(now)) {
                return Some(self.close(now, CloseReason::NegotiationFailed("HELLO timeout".into())));
            }
            return None;
        }

        if self.state != State::Established {
            return None;
        }

        if let Some(since) = self.echo_pending_since {
            if now.duration_since(since) >= self.echo_timeout {
                return Some(self.close(now, CloseReason::LivenessTimeout));
            }
            return None;
        }

        if self.echo_repeater.fired(now) {
            let xid = self.next_control_xid();
            self.echo_xid = xid;
            let request = encode_echo(false, self.negotiated_version.unwrap_or(1), xid, &[]);
            self.enqueue_raw(request.into_bytes());
            self.echo_pending_since = Some(now);
        }
        None
    }

    fn next_control_xid(&mut self) -> Xid {
        let xid = self.next_control_xid;
        self.next_control_xid = self.next_control_xid.wrapping_add(1);
        xid
    }

    /// Enqueues a fully-formed frame for the application (§4.2 `send`).
    pub fn send(&mut self, frame: Frame) -> Result<(), CoreError> {
        if self.state != State::Established {
            return Err(CoreError::NotEstablished);
        }
        let bytes = frame.into_bytes();
        if self.outbound.len() >= self.queue_limits.max_messages
            || self.outbound_bytes + bytes.len() > self.queue_limits.max_bytes
        {
            return Err(CoreError::Congested);
        }
        self.outbound_bytes += bytes.len();
        self.outbound.push_back(bytes);
        Ok(())
    }

    fn enqueue_raw(&mut self, bytes: Vec<u8>) {
        self.outbound_bytes += bytes.len();
        self.outbound.push_back(bytes);
    }

    /// Drains every queued frame as one contiguous buffer, in FIFO order,
    /// ready to hand to the transport.
    pub fn take_outbound(&mut self) -> Vec<u8> {
        let mut combined = Vec::with_capacity(self.outbound_bytes);
        while let Some(bytes) = self.outbound.pop_front() {
            combined.extend_from_slice(&bytes);
        }
        self.outbound_bytes = 0;
        combined
    }

    pub fn close(&mut self, now: Instant, reason: CloseReason) -> ConnEvent {
        self.state = State::Closing;
        self.journal(now, format!("closing: {reason}"));
        if self.actively_originated {
            self.state = State::Disconnected;
            self.schedule_reconnect(now);
        }
        ConnEvent::Closed { reason }
    }
}
