//! In-memory transport for unit tests
//!
//! Responses are scripted per URL fragment; the longest fragment contained
//! in the request URL wins. Each fragment holds a queue of responses and
//! the last one repeats. Fragments can be held so that matching requests
//! block until released.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::config::ClientConfig;
use crate::error::TransportError;
use crate::session::{Credentials, Session};
use crate::signal::SignalBus;
use crate::transport::{HttpRequest, HttpResponse, Transport};
use crate::types::ClientId;

type Reply = Result<HttpResponse, TransportError>;

#[derive(Default)]
struct Script {
    routes: Vec<(String, VecDeque<Reply>)>,
    held: HashSet<String>,
    calls: Vec<HttpRequest>,
}

#[derive(Default)]
pub struct ScriptedTransport {
    script: Mutex<Script>,
    cond: Condvar,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(&self, fragment: &str, status: u16, body: impl Into<Vec<u8>>) {
        self.push(fragment, Ok(HttpResponse::new(status, body)));
    }

    pub fn fail(&self, fragment: &str, error: TransportError) {
        self.push(fragment, Err(error));
    }

    fn push(&self, fragment: &str, reply: Reply) {
        let mut script = self.script.lock();
        match script.routes.iter_mut().find(|(f, _)| f == fragment) {
            Some((_, queue)) => queue.push_back(reply),
            None => script
                .routes
                .push((fragment.to_string(), VecDeque::from([reply]))),
        }
    }

    /// Block requests matching `fragment` until released
    pub fn hold(&self, fragment: &str) {
        self.script.lock().held.insert(fragment.to_string());
    }

    pub fn release(&self, fragment: &str) {
        self.script.lock().held.remove(fragment);
        self.cond.notify_all();
    }

    pub fn calls(&self) -> Vec<HttpRequest> {
        self.script.lock().calls.clone()
    }

    pub fn call_count(&self, fragment: &str) -> usize {
        self.script
            .lock()
            .calls
            .iter()
            .filter(|c| c.url.contains(fragment))
            .count()
    }

    /// Wait until at least `n` calls matched `fragment`
    pub fn wait_for_calls(&self, fragment: &str, n: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self.call_count(fragment) >= n {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        self.call_count(fragment) >= n
    }
}

impl Transport for ScriptedTransport {
    fn request(&self, request: &HttpRequest) -> Result<HttpResponse, TransportError> {
        let mut script = self.script.lock();
        script.calls.push(request.clone());

        let fragment = script
            .routes
            .iter()
            .map(|(f, _)| f.as_str())
            .filter(|f| request.url.contains(f))
            .max_by_key(|f| f.len())
            .map(str::to_string);
        let Some(fragment) = fragment else {
            return Err(TransportError::Status(404));
        };

        while script.held.contains(&fragment) {
            self.cond.wait(&mut script);
        }

        let Some((_, queue)) = script.routes.iter_mut().find(|(f, _)| *f == fragment) else {
            return Err(TransportError::Status(404));
        };
        if queue.len() > 1 {
            queue.pop_front().unwrap_or(Err(TransportError::Status(404)))
        } else {
            queue
                .front()
                .cloned()
                .unwrap_or(Err(TransportError::Status(404)))
        }
    }
}

pub fn credentials() -> Credentials {
    Credentials {
        client_id: ClientId::from_string("12345678".to_string()),
        psessionid: "ps".to_string(),
        vfwebqq: "vf".to_string(),
        uin: "100".to_string(),
    }
}

pub fn test_config() -> ClientConfig {
    ClientConfig {
        channel_host: "http://channel".to_string(),
        api_host: "http://api".to_string(),
        web_host: "http://web".to_string(),
        avatar_host: "avatar".to_string(),
        poll_retry_delay_ms: 10,
        max_workers: 4,
        ..ClientConfig::default()
    }
}

/// Session on a private bus, talking to `transport`
pub fn session_with(transport: Arc<ScriptedTransport>) -> Arc<Session> {
    config_session(test_config(), transport)
}

pub fn config_session(config: ClientConfig, transport: Arc<ScriptedTransport>) -> Arc<Session> {
    Session::new(config, transport, Arc::new(SignalBus::new()), credentials())
        .expect("session")
}
