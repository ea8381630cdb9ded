//! Session signals and the publish/subscribe registry
//!
//! Signals are the only way the engine talks to a host layer. Subscribers
//! are keyed by (session, kind) and run synchronously on whichever thread
//! publishes, so they must not assume a particular delivery thread.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use tracing::{debug, error};

use crate::error::ResultCode;
use crate::message::Envelope;
use crate::roster::{Buddy, Group};
use crate::types::SessionId;

/// Kinds of session-level occurrences
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalKind {
    LoginComplete,
    VerifyRequired,
    LoginFailed,
    FriendArrived,
    GroupArrived,
    FriendAvatar,
    GroupAvatar,
    ConnectionLost,
    BasicInfoReady,
    MessageReceived,
    PresenceChanged,
    Kicked,
    SystemNotice,
    RosterChanged,
    GroupNotice,
    SendFailed,
}

/// A published occurrence with its payload
#[derive(Debug, Clone)]
pub enum Signal {
    LoginComplete,
    /// Login needs a verification image answered
    VerifyRequired,
    LoginFailed { reason: String },
    /// A buddy's account number arrived
    FriendArrived(Buddy),
    /// A group's account number arrived
    GroupArrived(Group),
    FriendAvatar {
        uin: String,
        avatar: Option<Arc<[u8]>>,
    },
    GroupAvatar {
        code: String,
        avatar: Option<Arc<[u8]>>,
    },
    ConnectionLost,
    /// Every account lookup of the bulk fetch has landed
    BasicInfoReady,
    /// A decoded poll envelope; kind follows the variant
    Envelope(Arc<Envelope>),
    SendFailed {
        to: String,
        code: ResultCode,
        text: String,
    },
}

impl Signal {
    pub fn kind(&self) -> SignalKind {
        match self {
            Signal::LoginComplete => SignalKind::LoginComplete,
            Signal::VerifyRequired => SignalKind::VerifyRequired,
            Signal::LoginFailed { .. } => SignalKind::LoginFailed,
            Signal::FriendArrived(_) => SignalKind::FriendArrived,
            Signal::GroupArrived(_) => SignalKind::GroupArrived,
            Signal::FriendAvatar { .. } => SignalKind::FriendAvatar,
            Signal::GroupAvatar { .. } => SignalKind::GroupAvatar,
            Signal::ConnectionLost => SignalKind::ConnectionLost,
            Signal::BasicInfoReady => SignalKind::BasicInfoReady,
            Signal::Envelope(envelope) => envelope.signal_kind(),
            Signal::SendFailed { .. } => SignalKind::SendFailed,
        }
    }
}

/// Subscriber callback
pub type Subscriber = Arc<dyn Fn(&Signal) + Send + Sync + 'static>;

/// Handle returned by subscribe, used to unsubscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Registry = HashMap<(SessionId, SignalKind), Vec<(SubscriptionId, Subscriber)>>;

/// Typed publish/subscribe registry
///
/// One process-wide instance is available through `global()`; separate
/// instances can be created for isolation.
pub struct SignalBus {
    registry: Mutex<Registry>,
    next_id: AtomicU64,
}

impl SignalBus {
    pub fn new() -> Self {
        Self {
            registry: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// The process-wide bus
    pub fn global() -> Arc<SignalBus> {
        static GLOBAL: OnceLock<Arc<SignalBus>> = OnceLock::new();
        Arc::clone(GLOBAL.get_or_init(|| Arc::new(SignalBus::new())))
    }

    pub fn subscribe<F>(&self, session: SessionId, kind: SignalKind, callback: F) -> SubscriptionId
    where
        F: Fn(&Signal) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.registry
            .lock()
            .entry((session, kind))
            .or_default()
            .push((id, Arc::new(callback)));
        debug!("session {} subscribed to {:?}", session, kind);
        id
    }

    /// Remove one subscription. Returns false if it was not registered.
    pub fn unsubscribe(&self, session: SessionId, kind: SignalKind, id: SubscriptionId) -> bool {
        let mut registry = self.registry.lock();
        let Some(subscribers) = registry.get_mut(&(session, kind)) else {
            return false;
        };
        let before = subscribers.len();
        subscribers.retain(|(sub_id, _)| *sub_id != id);
        let removed = subscribers.len() != before;
        if subscribers.is_empty() {
            registry.remove(&(session, kind));
        }
        removed
    }

    /// Deliver `signal` to every matching subscriber, in subscription order
    ///
    /// Runs on the calling thread. A panicking subscriber is logged and the
    /// remaining ones still run. Returns the number of subscribers invoked.
    pub fn publish(&self, session: SessionId, signal: Signal) -> usize {
        let kind = signal.kind();
        // Snapshot so subscribers may (un)subscribe while being called
        let subscribers: Vec<Subscriber> = match self.registry.lock().get(&(session, kind)) {
            Some(subs) => subs.iter().map(|(_, cb)| Arc::clone(cb)).collect(),
            None => Vec::new(),
        };

        debug!(
            "publishing {:?} for session {} to {} subscriber(s)",
            kind,
            session,
            subscribers.len()
        );
        for subscriber in &subscribers {
            if catch_unwind(AssertUnwindSafe(|| subscriber(&signal))).is_err() {
                error!("subscriber for {:?} in session {} panicked", kind, session);
            }
        }
        subscribers.len()
    }

    /// Drop every subscription of a session
    pub fn clear_session(&self, session: SessionId) {
        self.registry.lock().retain(|(owner, _), _| *owner != session);
    }

    pub fn subscriber_count(&self, session: SessionId, kind: SignalKind) -> usize {
        self.registry
            .lock()
            .get(&(session, kind))
            .map_or(0, Vec::len)
    }
}

impl Default for SignalBus {
    fn default() -> Self {
        Self::new()
    }
}
