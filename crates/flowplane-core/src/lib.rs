//! Connection lifecycle and message-dispatch engine for a framed, versioned
//! control protocol between a controller and a datapath.
//!
//! [`Core`] owns the protocol state (Conns, Endpoints, transactions,
//! generation-id) without touching any socket directly. [`Dispatcher`] is
//! the single-threaded event loop that drives a `Core` against a
//! [`flowplane_net::tcp::Reactor`] and turns its output into [`Handler`]
//! callbacks.

mod base;
mod config;
mod conn;
mod control;
mod dispatcher;
mod endpoint;
mod error;
mod frame;
mod journal;
mod role;
mod transaction;
mod version;

pub use base::{Core, CoreOutcome};
pub use config::{Config, OutboundQueueLimits, ReconnectPolicy};
pub use conn::{Conn, ConnEvent, LocalRole, State as ConnState};
pub use control::{
    decode_features_reply_dpid, decode_hello, decode_role_message, encode_echo,
    encode_error, encode_error_frame, encode_hello, encode_role_reply,
    peer_explanation_from_payload, ErrorKind, Hello, RoleMessage, TYPE_ECHO_REPLY,
    TYPE_ECHO_REQUEST, TYPE_ERROR, TYPE_FEATURES_REPLY, TYPE_FEATURES_REQUEST, TYPE_HELLO,
    TYPE_ROLE_REPLY, TYPE_ROLE_REQUEST,
};
pub use dispatcher::{DispatchEvent, Dispatcher, WakeUp};
pub use endpoint::{AsyncConfig, AsyncKind, AsyncMask, Endpoint, Identity};
pub use error::{CloseReason, CoreError, FramingError, PeerExplanation, TransportError};
pub use frame::{ConnId, CtlId, DpId, Frame, FrameReader, Xid};
pub use journal::{Journal, JournalEntry};
pub use role::{is_stale, Role, RoleRequestOutcome};
pub use transaction::{RegisterOutcome, Transaction, TransactionStore};
pub use version::{VersionBitmap, MAX_VERSION, MIN_VERSION};

/// Capability interface the application supplies to receive protocol
/// events off a [`Dispatcher`]. Default methods no-op, so a handler only
/// implements what it cares about; dispatch onto the concrete event kind
/// happens once, here, via [`DispatchEvent`]'s tags rather than through a
/// hierarchy of message-type-specific virtual calls.
pub trait Handler {
    fn on_established(&mut self, _identity: Identity) {}

    fn on_message(&mut self, _identity: Identity, _conn_id: ConnId, _frame: Frame) {}

    fn on_closed(&mut self, _identity: Option<Identity>) {}

    fn on_timeout(&mut self, _identity: Identity, _xid: Xid, _transaction: Transaction) {}
}

impl<C: flowplane_time::Clock> Dispatcher<C> {
    /// Runs one [`Dispatcher::run_once`] pass and feeds every resulting
    /// [`DispatchEvent`] to `handler` in order.
    pub fn drive(&mut self, handler: &mut impl Handler) {
        for event in self.run_once() {
            match event {
                DispatchEvent::Established { identity } => handler.on_established(identity),
                DispatchEvent::Message { identity, conn_id, frame } => {
                    handler.on_message(identity, conn_id, frame)
                }
                DispatchEvent::Closed { identity } => handler.on_closed(identity),
                DispatchEvent::Timeout { identity, xid, transaction } => {
                    handler.on_timeout(identity, xid, transaction)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowplane_time::SystemClock;

    struct RecordingHandler {
        established: Vec<Identity>,
        closed: usize,
    }

    impl Handler for RecordingHandler {
        fn on_established(&mut self, identity: Identity) {
            self.established.push(identity);
        }

        fn on_closed(&mut self, _identity: Option<Identity>) {
            self.closed += 1;
        }
    }

    #[test]
    fn drive_with_no_sockets_registered_is_a_harmless_no_op() {
        let core = Core::new(Config::default(), VersionBitmap::from_versions([1, 4]));
        let mut dispatcher = Dispatcher::new(core, SystemClock);
        let mut handler = RecordingHandler { established: Vec::new(), closed: 0 };
        dispatcher.drive(&mut handler);
        assert!(handler.established.is_empty());
        assert_eq!(handler.closed, 0);
    }
}
