//! Outgoing chat messages

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, warn};

use crate::content::{self, ChatKind, MessageContent};
use crate::error::{ClientError, ProtocolError, ResultCode};
use crate::event::AsyncEvent;
use crate::json;
use crate::session::Session;
use crate::transport::{form_encode, HttpRequest};

/// A message to a buddy or group
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub kind: ChatKind,
    /// Buddy uin or group gid
    pub to: String,
    /// Group code; looked up from the roster when absent
    pub group_code: Option<String>,
    pub content: MessageContent,
}

impl OutgoingMessage {
    pub fn buddy(to: impl Into<String>, content: MessageContent) -> Self {
        Self {
            kind: ChatKind::Buddy,
            to: to.into(),
            group_code: None,
            content,
        }
    }

    pub fn group(gid: impl Into<String>, content: MessageContent) -> Self {
        Self {
            kind: ChatKind::Group,
            to: gid.into(),
            group_code: None,
            content,
        }
    }
}

/// Send a message; the event's result mirrors the response retcode
pub fn send_message(session: &Arc<Session>, message: OutgoingMessage) -> AsyncEvent {
    let event = AsyncEvent::for_session(session.id());
    let completer = event.clone();
    let owner = Arc::clone(session);

    session.http().workers().spawn_blocking(move || {
        let result = match deliver(&owner, &message) {
            Ok(()) => {
                debug!("message to {} delivered", message.to);
                ResultCode::Success
            }
            Err(e) => {
                warn!("message to {} failed: {}", message.to, e);
                ResultCode::from(&e)
            }
        };
        let _ = completer.complete(result, None);
    });
    event
}

fn deliver(session: &Session, message: &OutgoingMessage) -> Result<(), ClientError> {
    let request = build_request(session, message)?;
    let response = session.http().request(&request)?.require_ok()?;
    let tree = json::parse(&response.text())?;
    match json::retcode(&tree) {
        0 => Ok(()),
        code => Err(ClientError::from_retcode(code)),
    }
}

/// Numeric ids go out bare, anything else as a JSON string
fn json_id(id: &str) -> String {
    if !id.is_empty() && id.bytes().all(|b| b.is_ascii_digit()) {
        id.to_string()
    } else {
        Value::from(id).to_string()
    }
}

/// Build the send request
///
/// Blocks to fetch the group face signature when a group message carries
/// custom faces.
pub fn build_request(session: &Session, message: &OutgoingMessage) -> Result<HttpRequest, ClientError> {
    let creds = session.credentials();
    let encoded = content::encode(&message.content, message.kind)?;
    let (to_key, api) = match message.kind {
        ChatKind::Buddy => ("to", "send_buddy_msg2"),
        ChatKind::Group => ("group_uin", "send_qun_msg2"),
    };

    let mut r = format!("{{\"{}\":{},", to_key, json_id(&message.to));
    if message.kind == ChatKind::Group && message.content.has_custom_face() {
        let code = match &message.group_code {
            Some(code) => code.clone(),
            None => session
                .roster()
                .find_group_by_gid_mut(&message.to)
                .map(|g| g.code.clone())
                .ok_or(ProtocolError::MissingField("group_code"))?,
        };
        let sig = session.ensure_gface_sig()?;
        r.push_str(&format!(
            "\"group_code\":{},\"key\":{},\"sig\":{},",
            json_id(&code),
            Value::from(sig.key),
            Value::from(sig.sig)
        ));
    }
    r.push_str(&format!(
        "\"face\":0,\"content\":{},\"msg_id\":{},\"clientid\":{},\"psessionid\":{}}}",
        encoded,
        session.next_msg_id(),
        Value::from(creds.client_id.as_str()),
        Value::from(creds.psessionid.as_str())
    ));

    let body = form_encode(&[
        ("r", r.as_str()),
        ("clientid", creds.client_id.as_str()),
        ("psessionid", creds.psessionid.as_str()),
    ]);
    Ok(HttpRequest::post_form(format!("{}/channel/{}", session.config().channel_host, api), body)
        .header(
            "Referer",
            format!("{}/proxy.html?v=20101025002", session.config().channel_host),
        ))
}
