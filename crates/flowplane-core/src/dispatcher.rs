//! Single-threaded event loop (§5) driving one [`Core`] against a
//! [`flowplane_net::tcp::Reactor`]. Three suspension points: socket
//! readiness, timer expiry, and `wake_up`.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use flowplane_net::tcp::{PollEvent, Reactor, Token};
use flowplane_time::Clock;
use parking_lot::Mutex;
use tracing::warn;

use crate::base::{Core, CoreOutcome};
use crate::conn::LocalRole;
use crate::endpoint::{AsyncKind, Identity};
use crate::frame::{ConnId, Frame, Xid};
use crate::transaction::Transaction;

/// A callback enqueued from another thread to run on the loop thread, the
/// only sanctioned way for `send(...)` issued off-thread to reach the `Core`
/// (§5's `wake_up` primitive).
type WakeupFn = Box<dyn FnOnce(&mut Core, &mut Reactor) + Send>;

/// Thread-safe handle other threads use to enqueue work onto the
/// Dispatcher's loop thread and nudge it out of a blocking poll.
#[derive(Clone)]
pub struct WakeUp {
    queue: Arc<Mutex<VecDeque<WakeupFn>>>,
}

impl WakeUp {
    pub fn call(&self, f: impl FnOnce(&mut Core, &mut Reactor) + Send + 'static) {
        self.queue.lock().push_back(Box::new(f));
    }
}

/// Application-visible events surfaced once per [`Dispatcher::run_once`].
pub enum DispatchEvent {
    Established { identity: Identity },
    Message { identity: Identity, conn_id: ConnId, frame: Frame },
    Closed { identity: Option<Identity> },
    Timeout { identity: Identity, xid: Xid, transaction: Transaction },
}

pub struct Dispatcher<C: Clock> {
    reactor: Reactor,
    core: Core,
    clock: C,
    wakeups: Arc<Mutex<VecDeque<WakeupFn>>>,
    last_tick: Instant,
    tick_interval: Duration,
}

impl<C: Clock> Dispatcher<C> {
    pub fn new(core: Core, clock: C) -> Self {
        let now = clock.now();
        Self {
            reactor: Reactor::new(),
            core,
            clock,
            wakeups: Arc::new(Mutex::new(VecDeque::new())),
            last_tick: now,
            tick_interval: Duration::from_secs(1),
        }
    }

    pub fn wake_up(&self) -> WakeUp {
        WakeUp { queue: self.wakeups.clone() }
    }

    pub fn core(&self) -> &Core {
        &self.core
    }

    pub fn core_mut(&mut self) -> &mut Core {
        &mut self.core
    }

    pub fn listen(&mut self, addr: SocketAddr, role: LocalRole) -> std::io::Result<Token> {
        let backlog = self.core.config().listen_backlog;
        let token = self.reactor.listen(addr, backlog)?;
        self.core.register_listener(token, role);
        Ok(token)
    }

    pub fn connect(&mut self, addr: SocketAddr, role: LocalRole) -> std::io::Result<Token> {
        let token = self.reactor.connect(addr)?;
        self.core.begin_connect(token, addr, role);
        Ok(token)
    }

    /// One non-blocking pass: drains reactor readiness, runs due timers, and
    /// drains the wake-up queue. Returns every application-visible event, in
    /// the order produced.
    pub fn run_once(&mut self) -> Vec<DispatchEvent> {
        let mut events = Vec::new();
        let now = self.clock.now();

        self.drain_wakeups();
        self.poll_reactor(now, &mut events);
        self.run_timers(now, &mut events);
        self.run_due_reconnects(now);

        events
    }

    fn drain_wakeups(&mut self) {
        loop {
            let next = self.wakeups.lock().pop_front();
            let Some(f) = next else { break };
            f(&mut self.core, &mut self.reactor);
        }
    }

    fn poll_reactor(&mut self, now: Instant, events: &mut Vec<DispatchEvent>) {
        let reactor = &mut self.reactor;
        let core = &mut self.core;
        let mut pending_writes: Vec<(Token, Vec<u8>)> = Vec::new();
        let mut pending_events: Vec<DispatchEvent> = Vec::new();

        reactor.poll_with(|event| match event {
            PollEvent::Accept { listener, stream, .. } => {
                let outbound = core.on_accept(listener, stream, now);
                if !outbound.is_empty() {
                    pending_writes.push((stream, outbound));
                }
            }
            PollEvent::Disconnected { token } => {
                let outcome = core.on_disconnect(token, now);
                apply_outcome(outcome, &mut pending_writes, &mut pending_events);
            }
            PollEvent::Bytes { token, bytes } => {
                let outcome = core.on_bytes(token, bytes, now);
                apply_outcome(outcome, &mut pending_writes, &mut pending_events);
            }
        });

        for (token, bytes) in pending_writes {
            reactor.write_or_enqueue(token, bytes);
        }
        events.extend(pending_events);
    }

    fn run_timers(&mut self, now: Instant, events: &mut Vec<DispatchEvent>) {
        if now.duration_since(self.last_tick) < self.tick_interval {
            return;
        }
        self.last_tick = now;

        let mut outcome = CoreOutcome::default();
        self.core.tick_all(now, &mut outcome);
        let mut writes = Vec::new();
        let mut pending_events = Vec::new();
        apply_outcome(outcome, &mut writes, &mut pending_events);
        for (token, bytes) in writes {
            self.reactor.write_or_enqueue(token, bytes);
        }
        events.extend(pending_events);
    }

    fn run_due_reconnects(&mut self, now: Instant) {
        for (old_token, addr) in self.core.due_reconnects(now) {
            self.core.note_reconnect_attempt(old_token);
            match self.reactor.connect(addr) {
                Ok(new_token) => self.core.rekey_pending(old_token, new_token),
                Err(err) => warn!(%addr, %err, "reconnect attempt failed to even start"),
            }
        }
    }

    /// Sends `frame` on `(identity, conn_id)` and flushes it to the socket
    /// immediately. Call this only from the loop thread; anything else must
    /// go through [`Dispatcher::wake_up`].
    pub fn send(&mut self, identity: Identity, conn_id: ConnId, frame: Frame) -> Result<(), crate::error::CoreError> {
        let mut outcome = CoreOutcome::default();
        self.core.send(identity, conn_id, frame, &mut outcome)?;
        for (token, bytes) in outcome.writes {
            self.reactor.write_or_enqueue(token, bytes);
        }
        Ok(())
    }

    pub fn fan_out_async(&mut self, kind: AsyncKind, frame: &Frame) -> Result<(), crate::error::CoreError> {
        let mut outcome = CoreOutcome::default();
        let result = self.core.fan_out_async(kind, frame, &mut outcome);
        for (token, bytes) in outcome.writes {
            self.reactor.write_or_enqueue(token, bytes);
        }
        result
    }
}

fn apply_outcome(outcome: CoreOutcome, writes: &mut Vec<(Token, Vec<u8>)>, events: &mut Vec<DispatchEvent>) {
    writes.extend(outcome.writes);
    for (_, identity) in outcome.established {
        events.push(DispatchEvent::Established { identity });
    }
    for (identity, conn_id, frame) in outcome.messages {
        events.push(DispatchEvent::Message { identity, conn_id, frame });
    }
    for (_token, identity) in outcome.closed {
        events.push(DispatchEvent::Closed { identity });
    }
    for (identity, xid, transaction) in outcome.timeouts {
        events.push(DispatchEvent::Timeout { identity, xid, transaction });
    }
}
