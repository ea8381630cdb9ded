//! HTTP transport
//!
//! The engine talks to the service through the blocking [`Transport`]
//! trait. [`Http`] pairs a transport with the worker pool so that a request
//! can be issued asynchronously and observed through an [`AsyncEvent`].

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error};
use url::form_urlencoded;

use crate::error::{ResultCode, TransportError};
use crate::event::{AsyncEvent, Payload};
use crate::types::SessionId;
use crate::worker::Workers;

/// HTTP method
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

/// One outgoing request
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub url: String,
    pub method: Method,
    pub body: Option<String>,
    pub headers: Vec<(String, String)>,
}

impl HttpRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: Method::Get,
            body: None,
            headers: Vec::new(),
        }
    }

    /// Form POST; sets the form content type
    pub fn post_form(url: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: Method::Post,
            body: Some(body.into()),
            headers: vec![(
                "Content-Type".to_string(),
                "application/x-www-form-urlencoded".to_string(),
            )],
        }
    }

    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push((name.to_string(), value.into()));
        self
    }
}

/// Response status and raw body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == 200
    }

    /// Body as text, replacing invalid UTF-8
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Fail with [`TransportError::Status`] unless the status is 200
    pub fn require_ok(self) -> Result<Self, TransportError> {
        if self.is_ok() {
            Ok(self)
        } else {
            Err(TransportError::Status(self.status))
        }
    }
}

/// Blocking request/response transport
pub trait Transport: Send + Sync {
    fn request(&self, request: &HttpRequest) -> Result<HttpResponse, TransportError>;
}

/// Transport backed by `reqwest::blocking` with a shared cookie store
pub struct ReqwestTransport {
    client: reqwest::blocking::Client,
}

impl ReqwestTransport {
    pub fn new(timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::blocking::Client::builder()
            .cookie_store(true)
            .timeout(timeout)
            .build()?;
        Ok(Self { client })
    }
}

impl Transport for ReqwestTransport {
    fn request(&self, request: &HttpRequest) -> Result<HttpResponse, TransportError> {
        let mut builder = match request.method {
            Method::Get => self.client.get(&request.url),
            Method::Post => self.client.post(&request.url),
        };
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        let response = builder.send()?;
        let status = response.status().as_u16();
        let body = response.bytes()?.to_vec();
        debug!("{:?} {} -> {} ({} bytes)", request.method, request.url, status, body.len());
        Ok(HttpResponse { status, body })
    }
}

/// A transport plus the worker pool its async requests run on
#[derive(Clone)]
pub struct Http {
    transport: Arc<dyn Transport>,
    workers: Arc<Workers>,
}

impl Http {
    pub fn new(transport: Arc<dyn Transport>, workers: Arc<Workers>) -> Self {
        Self { transport, workers }
    }

    pub fn workers(&self) -> &Arc<Workers> {
        &self.workers
    }

    /// Blocking request on the calling thread
    pub fn request(&self, request: &HttpRequest) -> Result<HttpResponse, TransportError> {
        self.transport.request(request)
    }

    /// Issue `request` on a worker and complete the returned event there
    ///
    /// `handler` turns the raw outcome into the event's result and payload;
    /// it runs on the worker thread, before any listener.
    pub fn request_async<F>(&self, session: SessionId, request: HttpRequest, handler: F) -> AsyncEvent
    where
        F: FnOnce(Result<HttpResponse, TransportError>) -> (ResultCode, Option<Payload>)
            + Send
            + 'static,
    {
        let event = AsyncEvent::for_session(session);
        let completer = event.clone();
        let transport = Arc::clone(&self.transport);

        self.workers.spawn_blocking(move || {
            let outcome = transport.request(&request);
            if let Err(e) = &outcome {
                debug!("request to {} failed: {}", request.url, e);
            }
            let (result, payload) = match catch_unwind(AssertUnwindSafe(|| handler(outcome))) {
                Ok(done) => done,
                Err(_) => {
                    error!("response handler for {} panicked", request.url);
                    (ResultCode::Protocol, None)
                }
            };
            let _ = completer.complete(result, payload);
        });
        event
    }
}

/// `application/x-www-form-urlencoded` encoding of key/value pairs
pub fn form_encode(pairs: &[(&str, &str)]) -> String {
    form_urlencoded::Serializer::new(String::new())
        .extend_pairs(pairs)
        .finish()
}

/// `base?k=v&...`
pub fn with_query(base: &str, pairs: &[(&str, &str)]) -> String {
    format!("{}?{}", base, form_encode(pairs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedTransport;

    #[test]
    fn test_form_encode_escapes() {
        let body = form_encode(&[("r", r#"{"h":"hello"}"#), ("clientid", "12")]);
        assert_eq!(body, "r=%7B%22h%22%3A%22hello%22%7D&clientid=12");
    }

    #[test]
    fn test_with_query_keeps_empty_values() {
        let url = with_query("http://s/api", &[("tuin", "1"), ("code", "")]);
        assert_eq!(url, "http://s/api?tuin=1&code=");
    }

    #[test]
    fn test_require_ok() {
        assert!(HttpResponse::new(200, "x").require_ok().is_ok());
        assert!(matches!(
            HttpResponse::new(502, "").require_ok(),
            Err(TransportError::Status(502))
        ));
    }

    #[test]
    fn test_request_async_completes_on_worker() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.respond("/ping", 200, "pong");
        let http = Http::new(transport.clone(), Arc::new(Workers::new(2).unwrap()));

        let event = http.request_async(SessionId::new(), HttpRequest::get("http://h/ping"), |outcome| {
            match outcome {
                Ok(resp) => (ResultCode::Success, Some(Arc::new(resp.text()) as Payload)),
                Err(e) => ((&e).into(), None),
            }
        });
        let set = crate::event::AsyncEventSet::new();
        set.add(&event).unwrap();
        set.wait().unwrap();

        assert_eq!(event.result(), Some(ResultCode::Success));
        assert_eq!(event.payload::<String>().as_deref().map(String::as_str), Some("pong"));
        assert_eq!(transport.call_count("/ping"), 1);
    }

    #[test]
    fn test_request_async_handler_panic_fails_event() {
        let transport = Arc::new(ScriptedTransport::new());
        let http = Http::new(transport, Arc::new(Workers::new(1).unwrap()));
        let event = http.request_async(SessionId::new(), HttpRequest::get("http://h/x"), |_| {
            panic!("bad handler")
        });
        let set = crate::event::AsyncEventSet::new();
        set.add(&event).unwrap();
        set.wait().unwrap();
        assert_eq!(event.result(), Some(ResultCode::Protocol));
    }
}
