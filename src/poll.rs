//! Long-poll message loop
//!
//! `PollSession` keeps one poll request outstanding against the channel
//! host, decodes every batch it returns, queues the envelopes and publishes
//! one signal per envelope. It runs on its own thread and is the only
//! cancellable component of the engine.
//!
//! ```text
//! Idle -> Polling -> Decoding -> Dispatching -> Polling ...
//!            \____________\_____________\______> Stopped
//! ```

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::{Condvar, Mutex};
use serde_json::json;
use tracing::{debug, error, info, warn};

use crate::config::RetcodeAction;
use crate::content::{ChatKind, ContentRun};
use crate::error::{ClientError, ProtocolError, ResultCode, RETCODE_SESSION_INVALIDATED};
use crate::event::AsyncEvent;
use crate::info::{lookup_account, Contact};
use crate::message::{decode_batch, ChatMessage, Envelope};
use crate::session::Session;
use crate::signal::Signal;
use crate::transport::{form_encode, with_query, HttpRequest, HttpResponse};

/// Lifecycle of a poll session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollState {
    Idle,
    Polling,
    Decoding,
    Dispatching,
    Stopped,
}

/// Result of one poll cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Batch decoded; number of envelopes dispatched
    Dispatched(usize),
    /// Transport failure or unreadable body; poll again after the retry delay
    Retry,
    /// Retcode policy asked for a pause before the next poll
    Backoff(Duration),
    /// Another poll call is already in flight
    Busy,
    Stopped,
}

/// Fetches image bytes referenced by chat content
pub trait ContentFetcher: Send + Sync {
    fn fetch(
        &self,
        session: &Session,
        message: &ChatMessage,
        run: &ContentRun,
    ) -> Result<Arc<[u8]>, ClientError>;
}

/// Fetches images from the service's picture endpoints
pub struct HttpFetcher;

impl HttpFetcher {
    fn request_for(session: &Session, message: &ChatMessage, run: &ContentRun) -> Result<HttpRequest, ProtocolError> {
        let config = session.config();
        let creds = session.credentials();
        let clientid = creds.client_id.as_str();
        let psessionid = creds.psessionid.as_str();

        let url = match (run, message.kind) {
            (ContentRun::OfflineImage(img), _) => with_query(
                &format!("{}/channel/get_offpic2", config.channel_host),
                &[
                    ("file_path", img.file_path.as_str()),
                    ("f_uin", message.from.as_str()),
                    ("clientid", clientid),
                    ("psessionid", psessionid),
                ],
            ),
            (ContentRun::CustomFace(face), ChatKind::Buddy) => with_query(
                &format!("{}/channel/get_cface2", config.channel_host),
                &[
                    ("lcid", message.msg_id.as_deref().unwrap_or_default()),
                    ("to", message.from.as_str()),
                    ("guid", face.name.as_str()),
                    ("count", "5"),
                    ("time", "1"),
                    ("clientid", clientid),
                    ("psessionid", psessionid),
                ],
            ),
            (ContentRun::CustomFace(face), ChatKind::Group) => {
                let server = face.server.as_ref().ok_or(ProtocolError::MissingField("server"))?;
                let now = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_secs())
                    .unwrap_or_default()
                    .to_string();
                with_query(
                    &format!("{}/cgi-bin/get_group_pic", config.web_host),
                    &[
                        ("type", "0"),
                        ("gid", message.group_code.as_deref().unwrap_or_default()),
                        ("uin", message.send_uin.as_deref().unwrap_or_default()),
                        ("rip", server.ip.as_str()),
                        ("rport", server.port.as_str()),
                        ("fid", face.file_id.as_deref().unwrap_or_default()),
                        ("pic", face.name.as_str()),
                        ("vfwebqq", creds.vfwebqq.as_str()),
                        ("t", now.as_str()),
                    ],
                )
            }
            _ => {
                return Err(ProtocolError::InvalidField {
                    field: "content",
                    reason: "run carries no image".to_string(),
                })
            }
        };
        Ok(HttpRequest::get(url).header("Referer", format!("{}/", config.web_host)))
    }
}

impl ContentFetcher for HttpFetcher {
    fn fetch(
        &self,
        session: &Session,
        message: &ChatMessage,
        run: &ContentRun,
    ) -> Result<Arc<[u8]>, ClientError> {
        let request = Self::request_for(session, message, run)?;
        let response = session.http().request(&request)?;
        // Buddy custom faces answer with a redirect when the transport does not follow it
        let accepted = response.is_ok()
            || (response.status == 302 && matches!(run, ContentRun::CustomFace(_)) && message.kind == ChatKind::Buddy);
        if !accepted {
            return Err(crate::error::TransportError::Status(response.status).into());
        }
        Ok(Arc::from(response.body))
    }
}

fn attach(run: &mut ContentRun, data: Arc<[u8]>) {
    match run {
        ContentRun::OfflineImage(img) => img.data = Some(data),
        ContentRun::CustomFace(face) => face.data = Some(data),
        _ => {}
    }
}

pub struct PollSession {
    session: Arc<Session>,
    fetcher: Box<dyn ContentFetcher>,
    state: Mutex<PollState>,
    /// The outstanding poll call, if any
    pending: Mutex<Option<AsyncEvent>>,
    queue: Mutex<VecDeque<Arc<Envelope>>>,
    stopped: Mutex<bool>,
    wake: Condvar,
}

impl PollSession {
    pub fn new(session: Arc<Session>) -> Arc<Self> {
        Self::with_fetcher(session, Box::new(HttpFetcher))
    }

    pub fn with_fetcher(session: Arc<Session>, fetcher: Box<dyn ContentFetcher>) -> Arc<Self> {
        Arc::new(Self {
            session,
            fetcher,
            state: Mutex::new(PollState::Idle),
            pending: Mutex::new(None),
            queue: Mutex::new(VecDeque::new()),
            stopped: Mutex::new(false),
            wake: Condvar::new(),
        })
    }

    pub fn state(&self) -> PollState {
        *self.state.lock()
    }

    fn set_state(&self, state: PollState) {
        *self.state.lock() = state;
    }

    /// Event of the poll call currently in flight
    pub fn pending(&self) -> Option<AsyncEvent> {
        self.pending.lock().clone()
    }

    pub fn is_stop_requested(&self) -> bool {
        *self.stopped.lock()
    }

    /// Spawn the poll loop on its own thread
    pub fn start(self: &Arc<Self>) -> Result<JoinHandle<()>, ClientError> {
        let poller = Arc::clone(self);
        let handle = std::thread::Builder::new()
            .name("webim-poll".to_string())
            .spawn(move || poller.run())?;
        Ok(handle)
    }

    /// Poll until stopped
    pub fn run(&self) {
        info!("poll loop started for session {}", self.session.id());
        loop {
            match self.poll_once() {
                CycleOutcome::Stopped => break,
                CycleOutcome::Dispatched(_) => {}
                CycleOutcome::Retry | CycleOutcome::Busy => {
                    self.pause(self.session.config().poll_retry_delay())
                }
                CycleOutcome::Backoff(delay) => self.pause(delay),
            }
        }
        info!("poll loop stopped for session {}", self.session.id());
    }

    /// Request cancellation
    ///
    /// Takes effect at the next cycle boundary; the result of a call still
    /// in flight is discarded and its event completes as cancelled.
    pub fn stop(&self) {
        *self.stopped.lock() = true;
        self.wake.notify_all();
        if let Some(event) = self.pending() {
            event.try_complete(ResultCode::Cancelled, None);
        }
        debug!("poll stop requested for session {}", self.session.id());
    }

    /// Sleep unless stopped in the meantime
    fn pause(&self, delay: Duration) {
        let mut stopped = self.stopped.lock();
        if !*stopped {
            self.wake.wait_for(&mut stopped, delay);
        }
    }

    fn enter_stopped(&self) -> CycleOutcome {
        *self.stopped.lock() = true;
        self.set_state(PollState::Stopped);
        CycleOutcome::Stopped
    }

    fn poll_request(&self) -> HttpRequest {
        let config = self.session.config();
        let creds = self.session.credentials();
        let r = json!({
            "clientid": creds.client_id.as_str(),
            "psessionid": creds.psessionid,
        })
        .to_string();
        HttpRequest::post_form(
            format!("{}/channel/poll2", config.channel_host),
            form_encode(&[("r", r.as_str())]),
        )
        .header(
            "Referer",
            format!("{}/proxy.html?v=20101025002", config.channel_host),
        )
    }

    /// Run a single cycle: poll, decode, dispatch
    pub fn poll_once(&self) -> CycleOutcome {
        if self.is_stop_requested() {
            return self.enter_stopped();
        }

        let event = AsyncEvent::for_session(self.session.id());
        {
            let mut pending = self.pending.lock();
            if pending.is_some() {
                return CycleOutcome::Busy;
            }
            *pending = Some(event.clone());
        }
        self.set_state(PollState::Polling);

        let outcome = self.session.http().request(&self.poll_request());
        let result = match &outcome {
            Ok(response) if response.is_ok() => ResultCode::Success,
            Ok(response) => ResultCode::Transport(Some(response.status)),
            Err(e) => e.into(),
        };
        let won = event.try_complete(result, None);
        self.pending.lock().take();

        if !won || self.is_stop_requested() {
            debug!("discarding poll result after stop");
            return self.enter_stopped();
        }
        match outcome {
            Ok(response) if response.is_ok() => self.decode_and_dispatch(response),
            Ok(response) => {
                warn!("poll returned HTTP {}, retrying", response.status);
                CycleOutcome::Retry
            }
            Err(e) => {
                warn!("poll failed: {}, retrying", e);
                CycleOutcome::Retry
            }
        }
    }

    fn decode_and_dispatch(&self, response: HttpResponse) -> CycleOutcome {
        self.set_state(PollState::Decoding);
        let batch = match decode_batch(&response.text()) {
            Ok(batch) => batch,
            Err(e) => {
                warn!("unreadable poll body: {}, retrying", e);
                self.set_state(PollState::Polling);
                return CycleOutcome::Retry;
            }
        };

        if batch.dropped > 0 {
            warn!("dropped {} malformed poll element(s)", batch.dropped);
        }
        let count = self.dispatch(batch.items);

        match batch.retcode {
            0 => CycleOutcome::Dispatched(count),
            RETCODE_SESSION_INVALIDATED => {
                error!("session {} invalidated by server", self.session.id());
                let outcome = self.enter_stopped();
                self.session.report_connection_lost();
                outcome
            }
            code => match self.session.config().retcode_policy.action_for(code) {
                RetcodeAction::Continue => {
                    debug!("poll retcode {}, continuing", code);
                    CycleOutcome::Dispatched(count)
                }
                RetcodeAction::Backoff(ms) => {
                    debug!("poll retcode {}, backing off {}ms", code, ms);
                    CycleOutcome::Backoff(Duration::from_millis(ms))
                }
                RetcodeAction::Fatal => {
                    error!("poll retcode {} is fatal", code);
                    let outcome = self.enter_stopped();
                    self.session.report_connection_lost();
                    outcome
                }
            },
        }
    }

    /// Fetch images, apply roster effects, queue and publish
    ///
    /// Leaves the state at Polling, ready for the next cycle.
    fn dispatch(&self, mut envelopes: Vec<Envelope>) -> usize {
        if self.session.config().fetch_images {
            for envelope in &mut envelopes {
                if let Envelope::Chat(message) = envelope {
                    self.fetch_content(message);
                }
            }
        }

        self.set_state(PollState::Dispatching);
        let count = envelopes.len();
        for envelope in envelopes {
            let envelope = Arc::new(envelope);
            self.apply_to_session(&envelope);
            self.queue.lock().push_back(Arc::clone(&envelope));
            self.session.publish(Signal::Envelope(envelope));
        }
        debug!("dispatched {} envelope(s)", count);
        self.set_state(PollState::Polling);
        count
    }

    fn fetch_content(&self, message: &mut ChatMessage) {
        for i in 0..message.content.runs.len() {
            if !message.content.runs[i].needs_fetch() {
                continue;
            }
            match self.fetcher.fetch(&self.session, message, &message.content.runs[i]) {
                Ok(data) => attach(&mut message.content.runs[i], data),
                Err(e) => warn!("image fetch for message from {} failed: {}", message.from, e),
            }
        }
    }

    /// Roster side effects of presence and buddy-list envelopes
    fn apply_to_session(&self, envelope: &Envelope) {
        match envelope {
            Envelope::Presence(change) => {
                let client_type = change.client_type.to_string();
                if !self
                    .session
                    .roster()
                    .set_status(&change.who, &change.status, Some(&client_type))
                {
                    debug!("presence for unknown buddy {}", change.who);
                }
            }
            Envelope::Roster(change) => {
                for uin in self.session.apply_roster_change(change) {
                    lookup_account(&self.session, Contact::Buddy(uin));
                }
            }
            _ => {}
        }
    }

    /// Next queued envelope
    pub fn try_recv(&self) -> Option<Arc<Envelope>> {
        self.queue.lock().pop_front()
    }

    /// All queued envelopes, oldest first
    pub fn drain(&self) -> Vec<Arc<Envelope>> {
        self.queue.lock().drain(..).collect()
    }

    pub fn queued(&self) -> usize {
        self.queue.lock().len()
    }
}
