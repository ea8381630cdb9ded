//! Session state
//!
//! A `Session` owns everything one logged-in account needs: credentials,
//! the roster, the HTTP handle and the signal bus it publishes on.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::{Mutex, MutexGuard, RwLock};
use rand::Rng;
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::error::{ClientError, LoginError};
use crate::json;
use crate::message::RosterChange;
use crate::roster::{Buddy, Roster};
use crate::signal::{Signal, SignalBus, SignalKind, SubscriptionId};
use crate::transport::{with_query, Http, HttpRequest, Transport};
use crate::types::{ClientId, SessionId};
use crate::worker::Workers;

/// Identifiers issued at login and echoed on every call
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub client_id: ClientId,
    pub psessionid: String,
    pub vfwebqq: String,
    /// Our own uin
    pub uin: String,
}

/// Performs the login handshake; verification images and password
/// hashing live behind this trait
pub trait Authenticator: Send + Sync {
    fn login(&self) -> Result<Credentials, LoginError>;
}

/// Key and signature required to send group messages with custom faces
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupFaceSig {
    pub key: String,
    pub sig: String,
}

pub struct Session {
    id: SessionId,
    config: Arc<ClientConfig>,
    http: Http,
    bus: Arc<SignalBus>,
    credentials: RwLock<Credentials>,
    roster: Mutex<Roster>,
    msg_seq: AtomicU64,
    gface_sig: Mutex<Option<GroupFaceSig>>,
    avatar_server: AtomicUsize,
    lost: AtomicBool,
}

impl Session {
    /// Build a session with its own worker pool
    pub fn new(
        config: ClientConfig,
        transport: Arc<dyn Transport>,
        bus: Arc<SignalBus>,
        credentials: Credentials,
    ) -> Result<Arc<Self>, ClientError> {
        let workers = Arc::new(Workers::new(config.max_workers)?);
        let http = Http::new(transport, workers);
        let roster = Roster::new(credentials.uin.clone());
        let id = SessionId::new();
        info!("session {} created for uin {}", id, credentials.uin);

        Ok(Arc::new(Self {
            id,
            config: Arc::new(config),
            http,
            bus,
            credentials: RwLock::new(credentials),
            roster: Mutex::new(roster),
            msg_seq: AtomicU64::new(rand::thread_rng().gen_range(10_000_000..60_000_000)),
            gface_sig: Mutex::new(None),
            avatar_server: AtomicUsize::new(0),
            lost: AtomicBool::new(false),
        }))
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn http(&self) -> &Http {
        &self.http
    }

    pub fn bus(&self) -> &Arc<SignalBus> {
        &self.bus
    }

    pub fn credentials(&self) -> Credentials {
        self.credentials.read().clone()
    }

    /// Replace credentials after a (re)login
    pub fn set_credentials(&self, credentials: Credentials) {
        self.roster.lock().myself.uin = credentials.uin.clone();
        *self.credentials.write() = credentials;
        *self.gface_sig.lock() = None;
    }

    /// Lock the roster. Do not hold the guard across a publish.
    pub fn roster(&self) -> MutexGuard<'_, Roster> {
        self.roster.lock()
    }

    /// Register a callback for one signal kind
    ///
    /// Callbacks may run inside event dispatch on a worker, where
    /// `AsyncEventSet::wait` on a pending set is refused. Start blocking
    /// workflows from a callback through their `background_*` form, which
    /// runs on its own thread.
    pub fn subscribe<F>(&self, kind: SignalKind, callback: F) -> SubscriptionId
    where
        F: Fn(&Signal) + Send + Sync + 'static,
    {
        self.bus.subscribe(self.id, kind, callback)
    }

    pub fn publish(&self, signal: Signal) -> usize {
        self.bus.publish(self.id, signal)
    }

    /// Next outgoing message id
    pub fn next_msg_id(&self) -> u64 {
        self.msg_seq.fetch_add(1, Ordering::Relaxed)
    }

    /// Avatar server number, rotating through 1..=10
    pub fn next_avatar_server(&self) -> usize {
        self.avatar_server.fetch_add(1, Ordering::Relaxed) % 10 + 1
    }

    /// Publish ConnectionLost unless already reported. Returns whether this
    /// call published it.
    pub fn report_connection_lost(&self) -> bool {
        if self.lost.swap(true, Ordering::SeqCst) {
            debug!("session {} connection loss already reported", self.id);
            return false;
        }
        warn!("session {} lost its connection", self.id);
        self.publish(Signal::ConnectionLost);
        true
    }

    pub fn is_connection_lost(&self) -> bool {
        self.lost.load(Ordering::SeqCst)
    }

    /// Group face key and signature, fetched on first use
    ///
    /// Concurrent callers wait on the same fetch.
    pub fn ensure_gface_sig(&self) -> Result<GroupFaceSig, ClientError> {
        let mut slot = self.gface_sig.lock();
        if let Some(sig) = slot.as_ref() {
            return Ok(sig.clone());
        }

        let creds = self.credentials();
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or_default()
            .to_string();
        let url = with_query(
            &format!("{}/channel/get_gface_sig2", self.config.channel_host),
            &[
                ("clientid", creds.client_id.as_str()),
                ("psessionid", creds.psessionid.as_str()),
                ("t", now.as_str()),
            ],
        );
        let request = HttpRequest::get(url).header(
            "Referer",
            format!("{}/proxy.html?v=20110331002&callback=1&id=2", self.config.channel_host),
        );

        let response = self.http.request(&request)?.require_ok()?;
        let tree = json::parse(&response.text())?;
        let code = json::retcode(&tree);
        if code != 0 {
            return Err(ClientError::from_retcode(code));
        }
        let result = tree.get("result").unwrap_or(&tree);
        let sig = GroupFaceSig {
            key: json::required(result, "gface_key")?,
            sig: json::required(result, "gface_sig")?,
        };
        debug!("session {} fetched group face signature", self.id);
        *slot = Some(sig.clone());
        Ok(sig)
    }

    /// Apply a buddy-list change to the roster
    ///
    /// Returns the uins that were newly added and still need lookups.
    pub fn apply_roster_change(&self, change: &RosterChange) -> Vec<String> {
        let mut roster = self.roster.lock();
        for uin in &change.removed {
            if roster.remove_buddy(uin).is_none() {
                debug!("removed buddy {} was not in the roster", uin);
            }
        }
        let mut added = Vec::new();
        for entry in &change.added {
            if roster.find_buddy(&entry.uin).is_some() {
                continue;
            }
            let mut buddy = Buddy::new(entry.uin.clone());
            buddy.category = entry.category.clone();
            roster.upsert_buddy(buddy);
            added.push(entry.uin.clone());
        }
        roster.recount_categories();
        added
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        debug!("session {} dropped", self.id);
        self.bus.clear_session(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::RosterEntry;
    use crate::testing::{credentials, session_with, ScriptedTransport};
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_connection_lost_published_once() {
        let session = session_with(Arc::new(ScriptedTransport::new()));
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        session.subscribe(SignalKind::ConnectionLost, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert!(session.report_connection_lost());
        assert!(!session.report_connection_lost());
        assert!(session.is_connection_lost());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_drop_clears_subscriptions() {
        let bus = Arc::new(SignalBus::new());
        let session = Session::new(
            ClientConfig::default(),
            Arc::new(ScriptedTransport::new()),
            Arc::clone(&bus),
            credentials(),
        )
        .unwrap();
        let id = session.id();
        session.subscribe(SignalKind::LoginComplete, |_| {});
        assert_eq!(bus.subscriber_count(id, SignalKind::LoginComplete), 1);
        drop(session);
        assert_eq!(bus.subscriber_count(id, SignalKind::LoginComplete), 0);
    }

    #[test]
    fn test_gface_sig_fetched_once() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.respond(
            "get_gface_sig2",
            200,
            r#"{"retcode":0,"result":{"reply":0,"gface_key":"k1","gface_sig":"s1"}}"#,
        );
        let session = session_with(transport.clone());
        let first = session.ensure_gface_sig().unwrap();
        let second = session.ensure_gface_sig().unwrap();
        assert_eq!(first, GroupFaceSig { key: "k1".to_string(), sig: "s1".to_string() });
        assert_eq!(first, second);
        assert_eq!(transport.call_count("get_gface_sig2"), 1);
    }

    #[test]
    fn test_gface_sig_error_not_cached() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.respond("get_gface_sig2", 200, r#"{"retcode":103}"#);
        transport.respond(
            "get_gface_sig2",
            200,
            r#"{"retcode":0,"result":{"gface_key":"k","gface_sig":"s"}}"#,
        );
        let session = session_with(transport.clone());
        assert!(matches!(session.ensure_gface_sig(), Err(ClientError::Server(103))));
        assert!(session.ensure_gface_sig().is_ok());
    }

    #[test]
    fn test_apply_roster_change() {
        let session = session_with(Arc::new(ScriptedTransport::new()));
        session.roster().upsert_buddy(Buddy::new("1"));
        session.roster().upsert_buddy(Buddy::new("2"));

        let change = RosterChange {
            added: vec![
                RosterEntry { uin: "3".to_string(), category: Some("0".to_string()) },
                RosterEntry { uin: "2".to_string(), category: None },
            ],
            removed: vec!["1".to_string()],
        };
        let added = session.apply_roster_change(&change);
        assert_eq!(added, vec!["3".to_string()]);

        let roster = session.roster();
        assert!(roster.find_buddy("1").is_none());
        assert!(roster.find_buddy("2").is_some());
        assert_eq!(roster.find_buddy("3").unwrap().category.as_deref(), Some("0"));
    }

    #[test]
    fn test_avatar_server_rotation() {
        let session = session_with(Arc::new(ScriptedTransport::new()));
        let servers: Vec<usize> = (0..11).map(|_| session.next_avatar_server()).collect();
        assert_eq!(servers[0], 1);
        assert_eq!(servers[9], 10);
        assert_eq!(servers[10], 1);
    }

    #[test]
    fn test_msg_ids_increase() {
        let session = session_with(Arc::new(ScriptedTransport::new()));
        let a = session.next_msg_id();
        assert_eq!(session.next_msg_id(), a + 1);
    }
}
