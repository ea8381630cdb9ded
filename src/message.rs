//! Poll envelope definitions
//!
//! The poll endpoint answers `{"retcode": n, "result": [{"poll_type": ..,
//! "value": {..}}, ..]}`. Each element decodes on its own into one
//! `Envelope` variant; a bad element is dropped without affecting the rest.

use serde::Deserialize;
use serde_json::Value;
use tracing::warn;

use crate::content::{self, ChatKind, MessageContent};
use crate::error::ProtocolError;
use crate::json;
use crate::signal::SignalKind;

/// Buddy or group chat message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub kind: ChatKind,
    /// Sender uin (the group uin for group messages)
    pub from: String,
    pub to: String,
    pub msg_id: Option<String>,
    /// Unix seconds
    pub time: i64,
    /// Member who spoke in a group message
    pub send_uin: Option<String>,
    pub group_code: Option<String>,
    pub content: MessageContent,
}

/// Buddy presence update
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceChange {
    pub who: String,
    pub status: String,
    pub client_type: i64,
}

/// Session kicked by the server (e.g. logged in elsewhere)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KickNotice {
    pub show_reason: bool,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SystemNoticeKind {
    /// Someone asks to add us as a buddy
    VerifyRequired,
    Other(String),
}

/// System message addressed to the account
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemNotice {
    pub kind: SystemNoticeKind,
    pub seq: Option<String>,
    pub from_uin: Option<String>,
    pub account: Option<String>,
    pub msg: Option<String>,
    pub allow: Option<String>,
    pub stat: Option<String>,
    pub client_type: Option<String>,
}

/// Buddy added to the roster by a roster change
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RosterEntry {
    pub uin: String,
    pub category: Option<String>,
}

/// Buddies added to or removed from the roster
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RosterChange {
    pub added: Vec<RosterEntry>,
    pub removed: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupEvent {
    Create,
    Join,
    Leave,
    Other(String),
}

/// Group created, joined or left
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupLifecycleNotice {
    pub event: GroupEvent,
    pub gcode: String,
    /// Member who joined or left
    pub member: Option<String>,
}

/// One decoded server-pushed unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Envelope {
    Chat(ChatMessage),
    Presence(PresenceChange),
    Kick(KickNotice),
    System(SystemNotice),
    Roster(RosterChange),
    Group(GroupLifecycleNotice),
}

impl Envelope {
    /// Signal published when this envelope is dispatched
    pub fn signal_kind(&self) -> SignalKind {
        match self {
            Envelope::Chat(_) => SignalKind::MessageReceived,
            Envelope::Presence(_) => SignalKind::PresenceChanged,
            Envelope::Kick(_) => SignalKind::Kicked,
            Envelope::System(_) => SignalKind::SystemNotice,
            Envelope::Roster(_) => SignalKind::RosterChanged,
            Envelope::Group(_) => SignalKind::GroupNotice,
        }
    }

    pub fn as_chat(&self) -> Option<&ChatMessage> {
        match self {
            Envelope::Chat(msg) => Some(msg),
            _ => None,
        }
    }
}

/// Top-level poll response
#[derive(Debug, Deserialize)]
struct PollResponse {
    #[serde(default)]
    retcode: Option<Value>,
    #[serde(default)]
    result: Option<Value>,
}

/// One element of the result list
#[derive(Debug, Deserialize)]
struct RawEnvelope {
    poll_type: String,
    value: Value,
}

/// Outcome of decoding a poll response body
///
/// The envelope list is decoded whatever the retcode says; the caller
/// decides what a non-zero retcode means once the envelopes are handled.
#[derive(Debug, Default)]
pub struct PollBatch {
    pub retcode: i64,
    /// Envelopes that decoded, in arrival order
    pub items: Vec<Envelope>,
    /// Elements skipped as unknown or malformed
    pub dropped: usize,
}

/// Decode a poll response body
///
/// Fails only when the body itself is not a JSON object; malformed
/// elements are counted in `dropped`.
pub fn decode_batch(body: &str) -> Result<PollBatch, ProtocolError> {
    let response: PollResponse = serde_json::from_str(body)?;
    let retcode = match &response.retcode {
        None => 0,
        Some(value) => json::scalar(value)
            .and_then(|s| s.parse().ok())
            .ok_or(ProtocolError::InvalidField {
                field: "retcode",
                reason: "not an integer".to_string(),
            })?,
    };

    let elements = match response.result {
        Some(Value::Array(elements)) => elements,
        _ => Vec::new(),
    };

    let mut batch = PollBatch {
        retcode,
        items: Vec::with_capacity(elements.len()),
        dropped: 0,
    };
    for element in &elements {
        match decode_envelope(element) {
            Ok(envelope) => batch.items.push(envelope),
            Err(e) => {
                warn!("dropping poll element: {}", e);
                batch.dropped += 1;
            }
        }
    }
    Ok(batch)
}

/// Decode one `{"poll_type": .., "value": ..}` element
pub fn decode_envelope(element: &Value) -> Result<Envelope, ProtocolError> {
    let raw = RawEnvelope::deserialize(element)?;
    let value = &raw.value;
    match raw.poll_type.as_str() {
        "message" => decode_chat(value, ChatKind::Buddy).map(Envelope::Chat),
        "group_message" => decode_chat(value, ChatKind::Group).map(Envelope::Chat),
        "buddies_status_change" => decode_presence(value).map(Envelope::Presence),
        "kick_message" => decode_kick(value).map(Envelope::Kick),
        "system_message" => decode_system(value).map(Envelope::System),
        "buddylist_change" => Ok(Envelope::Roster(decode_roster_change(value))),
        "sys_g_msg" => decode_group_notice(value).map(Envelope::Group),
        other => Err(ProtocolError::UnknownPollType(other.to_string())),
    }
}

fn decode_chat(value: &Value, kind: ChatKind) -> Result<ChatMessage, ProtocolError> {
    let from = json::required(value, "from_uin")?;
    let to = json::required(value, "to_uin")?;
    let content = value
        .get("content")
        .ok_or(ProtocolError::MissingField("content"))?;

    Ok(ChatMessage {
        kind,
        from,
        to,
        msg_id: json::field(value, "msg_id"),
        time: json::int_field(value, "time").unwrap_or(0),
        send_uin: json::field(value, "send_uin"),
        group_code: json::field(value, "group_code"),
        content: content::decode(content)?,
    })
}

fn decode_presence(value: &Value) -> Result<PresenceChange, ProtocolError> {
    Ok(PresenceChange {
        who: json::required(value, "uin")?,
        status: json::required(value, "status")?,
        client_type: json::int_field(value, "client_type").unwrap_or(1),
    })
}

fn decode_kick(value: &Value) -> Result<KickNotice, ProtocolError> {
    let show_reason = json::int_field(value, "show_reason");
    let reason = json::field(value, "reason");
    if show_reason.is_some() && reason.is_none() {
        return Err(ProtocolError::MissingField("reason"));
    }
    Ok(KickNotice {
        show_reason: show_reason.is_some_and(|v| v != 0),
        reason,
    })
}

fn decode_system(value: &Value) -> Result<SystemNotice, ProtocolError> {
    let kind = match json::required(value, "type")?.as_str() {
        "verify_required" => SystemNoticeKind::VerifyRequired,
        other => SystemNoticeKind::Other(other.to_string()),
    };
    Ok(SystemNotice {
        kind,
        seq: json::field(value, "seq"),
        from_uin: json::field(value, "from_uin"),
        account: json::field(value, "account"),
        msg: json::field(value, "msg"),
        allow: json::field(value, "allow"),
        stat: json::field(value, "stat"),
        client_type: json::field(value, "client_type"),
    })
}

fn decode_roster_change(value: &Value) -> RosterChange {
    let list = |key: &str| -> Vec<Value> {
        value
            .get(key)
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default()
    };

    RosterChange {
        added: list("added_friends")
            .iter()
            .filter_map(|entry| {
                Some(RosterEntry {
                    uin: json::field(entry, "uin")?,
                    category: json::field(entry, "groupid"),
                })
            })
            .collect(),
        removed: list("removed_friends")
            .iter()
            .filter_map(|entry| json::field(entry, "uin"))
            .collect(),
    }
}

fn decode_group_notice(value: &Value) -> Result<GroupLifecycleNotice, ProtocolError> {
    let event = match json::required(value, "type")?.as_str() {
        "group_create" => GroupEvent::Create,
        "group_join" => GroupEvent::Join,
        "group_leave" => GroupEvent::Leave,
        other => GroupEvent::Other(other.to_string()),
    };
    let member = match event {
        GroupEvent::Join => json::field(value, "new_member"),
        GroupEvent::Leave => json::field(value, "old_member"),
        _ => None,
    };
    Ok(GroupLifecycleNotice {
        event,
        gcode: json::required(value, "gcode")?,
        member,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::ContentRun;

    fn envelopes(body: &str) -> (Vec<Envelope>, usize) {
        let batch = decode_batch(body).unwrap();
        assert_eq!(batch.retcode, 0);
        (batch.items, batch.dropped)
    }

    #[test]
    fn test_presence_change() {
        let body = r#"{"retcode":0,"result":[{"poll_type":"buddies_status_change","value":{"uin":"123","status":"busy","client_type":"1"}}]}"#;
        let (items, dropped) = envelopes(body);
        assert_eq!(dropped, 0);
        assert_eq!(
            items,
            vec![Envelope::Presence(PresenceChange {
                who: "123".to_string(),
                status: "busy".to_string(),
                client_type: 1,
            })]
        );
    }

    #[test]
    fn test_buddy_message() {
        let body = r#"{"retcode":0,"result":[{"poll_type":"message","value":{"msg_id":5244,"from_uin":570454553,"to_uin":75396018,"msg_id2":395911,"msg_type":9,"reply_ip":176752041,"time":1339663883,"content":[["font",{"size":10,"color":"000000","style":[0,0,0],"name":"宋体"}],"hello\n "]}}]}"#;
        let (items, _) = envelopes(body);
        let msg = items[0].as_chat().unwrap();
        assert_eq!(msg.kind, ChatKind::Buddy);
        assert_eq!(msg.from, "570454553");
        assert_eq!(msg.to, "75396018");
        assert_eq!(msg.msg_id.as_deref(), Some("5244"));
        assert_eq!(msg.time, 1339663883);
        assert_eq!(msg.content.runs, vec![ContentRun::text("hello\n ")]);
        assert_eq!(items[0].signal_kind(), SignalKind::MessageReceived);
    }

    #[test]
    fn test_malformed_element_dropped_batch_continues() {
        let body = r#"{"retcode":0,"result":[
            {"poll_type":"buddies_status_change","value":{"uin":1,"status":"online"}},
            {"poll_type":"buddies_status_change","value":{"status":"online"}},
            {"poll_type":"kick_message","value":{"show_reason":1,"reason":"elsewhere"}}
        ]}"#;
        let (items, dropped) = envelopes(body);
        assert_eq!(items.len(), 2);
        assert_eq!(dropped, 1);
        assert!(matches!(items[1], Envelope::Kick(KickNotice { show_reason: true, .. })));
    }

    #[test]
    fn test_unknown_poll_type_dropped() {
        let body = r#"{"retcode":0,"result":[{"poll_type":"input_notify","value":{}},{"no_tag":1}]}"#;
        let (items, dropped) = envelopes(body);
        assert!(items.is_empty());
        assert_eq!(dropped, 2);
    }

    #[test]
    fn test_nonzero_retcode() {
        let batch = decode_batch(r#"{"retcode":121,"t":"1"}"#).unwrap();
        assert_eq!(batch.retcode, 121);
        assert!(batch.items.is_empty());
        let batch = decode_batch(r#"{"retcode":"102","errmsg":""}"#).unwrap();
        assert_eq!(batch.retcode, 102);
        assert!(batch.items.is_empty());
    }

    #[test]
    fn test_nonzero_retcode_keeps_envelopes() {
        let body = r#"{"retcode":102,"result":[{"poll_type":"buddies_status_change","value":{"uin":"123","status":"busy"}}]}"#;
        let batch = decode_batch(body).unwrap();
        assert_eq!(batch.retcode, 102);
        assert_eq!(batch.dropped, 0);
        assert_eq!(
            batch.items,
            vec![Envelope::Presence(PresenceChange {
                who: "123".to_string(),
                status: "busy".to_string(),
                client_type: 1,
            })]
        );
    }

    #[test]
    fn test_malformed_body() {
        assert!(decode_batch("<html>").is_err());
        assert!(decode_batch(r#""busy""#).is_err());
    }

    #[test]
    fn test_missing_result_is_empty() {
        let (items, dropped) = envelopes(r#"{"retcode":0}"#);
        assert!(items.is_empty());
        assert_eq!(dropped, 0);
    }

    #[test]
    fn test_kick_requires_reason_when_shown() {
        let body = r#"{"retcode":0,"result":[{"poll_type":"kick_message","value":{"show_reason":1}},{"poll_type":"kick_message","value":{}}]}"#;
        let (items, dropped) = envelopes(body);
        assert_eq!(dropped, 1);
        assert_eq!(
            items,
            vec![Envelope::Kick(KickNotice {
                show_reason: false,
                reason: None
            })]
        );
    }

    #[test]
    fn test_system_message() {
        let body = r#"{"retcode":0,"result":[{"poll_type":"system_message","value":{"seq":1,"type":"verify_required","from_uin":77,"account":12345,"msg":"hi","allow":1,"stat":10,"client_type":1}}]}"#;
        let (items, _) = envelopes(body);
        let Envelope::System(notice) = &items[0] else {
            panic!("expected system notice");
        };
        assert_eq!(notice.kind, SystemNoticeKind::VerifyRequired);
        assert_eq!(notice.account.as_deref(), Some("12345"));
    }

    #[test]
    fn test_roster_change() {
        let body = r#"{"retcode":0,"result":[{"poll_type":"buddylist_change","value":{"added_friends":[{"uin":5,"groupid":2}],"removed_friends":[{"uin":6}]}}]}"#;
        let (items, _) = envelopes(body);
        assert_eq!(
            items[0],
            Envelope::Roster(RosterChange {
                added: vec![RosterEntry {
                    uin: "5".to_string(),
                    category: Some("2".to_string())
                }],
                removed: vec!["6".to_string()],
            })
        );
    }

    #[test]
    fn test_group_lifecycle() {
        let body = r#"{"retcode":0,"result":[
            {"poll_type":"sys_g_msg","value":{"type":"group_join","gcode":2570026216,"new_member":2501542492}},
            {"poll_type":"sys_g_msg","value":{"type":"group_leave","gcode":2676780935,"old_member":574849996}},
            {"poll_type":"sys_g_msg","value":{"type":"group_create"}}
        ]}"#;
        let (items, dropped) = envelopes(body);
        assert_eq!(dropped, 1);
        assert_eq!(
            items[0],
            Envelope::Group(GroupLifecycleNotice {
                event: GroupEvent::Join,
                gcode: "2570026216".to_string(),
                member: Some("2501542492".to_string()),
            })
        );
        assert_eq!(items[1].signal_kind(), SignalKind::GroupNotice);
    }

    #[test]
    fn test_group_message_fields() {
        let body = r#"{"retcode":0,"result":[{"poll_type":"group_message","value":{"msg_id":1,"from_uin":3772225519,"to_uin":75396018,"send_uin":909998471,"group_code":1713443374,"time":0,"content":["hi all"]}}]}"#;
        let (items, _) = envelopes(body);
        let msg = items[0].as_chat().unwrap();
        assert_eq!(msg.kind, ChatKind::Group);
        assert_eq!(msg.send_uin.as_deref(), Some("909998471"));
        assert_eq!(msg.group_code.as_deref(), Some("1713443374"));
    }
}
