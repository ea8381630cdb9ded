//! Rich chat content codec
//!
//! Chat content travels as a JSON array mixing plain strings with tagged
//! arrays (`"font"`, `"face"`, `"offpic"`, `"cface"`). On send the array is
//! serialized to text and embedded as a JSON string, which is where the
//! doubled-backslash escaping of the outbound form comes from.

use std::sync::Arc;

use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::error::ProtocolError;
use crate::json;

/// Smallest font size the client renders
pub const MIN_FONT_SIZE: u32 = 10;

/// Message-level font descriptor
///
/// The protocol carries a single font per message, not per run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Font {
    pub name: String,
    pub size: u32,
    pub bold: bool,
    pub italic: bool,
    pub underline: bool,
    /// Hex RGB without '#', e.g. "000000"
    pub color: String,
}

impl Default for Font {
    fn default() -> Self {
        Self {
            name: "Arial".to_string(),
            size: 12,
            bold: false,
            italic: false,
            underline: false,
            color: "000000".to_string(),
        }
    }
}

/// Image uploaded to the offline file server
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct OfflineImage {
    pub file_path: String,
    pub name: String,
    pub size: u64,
    /// Fetched bytes
    pub data: Option<Arc<[u8]>>,
}

/// Address of the server holding a group custom face
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FaceServer {
    pub ip: String,
    pub port: String,
}

/// User-defined emoticon image
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CustomFace {
    pub name: String,
    pub file_id: Option<String>,
    pub key: Option<String>,
    pub server: Option<FaceServer>,
    /// Fetched bytes
    pub data: Option<Arc<[u8]>>,
}

/// One segment of a chat message body
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentRun {
    Text(String),
    /// Built-in emoticon by numeric id
    Face(u32),
    OfflineImage(OfflineImage),
    CustomFace(CustomFace),
}

impl ContentRun {
    pub fn text(s: impl Into<String>) -> Self {
        ContentRun::Text(s.into())
    }

    /// Image run whose bytes have not been fetched yet
    pub fn needs_fetch(&self) -> bool {
        match self {
            ContentRun::OfflineImage(img) => img.data.is_none(),
            ContentRun::CustomFace(face) => face.data.is_none(),
            _ => false,
        }
    }
}

/// Body of a chat message: ordered runs plus one font
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageContent {
    pub runs: Vec<ContentRun>,
    pub font: Font,
}

impl MessageContent {
    pub fn new(runs: Vec<ContentRun>) -> Self {
        Self {
            runs,
            font: Font::default(),
        }
    }

    /// Set the font; sizes below [`MIN_FONT_SIZE`] are raised to it
    pub fn with_font(mut self, font: Font) -> Self {
        self.font = Font {
            size: font.size.max(MIN_FONT_SIZE),
            ..font
        };
        self
    }

    /// Concatenated text runs, for logging and previews
    pub fn plain_text(&self) -> String {
        self.runs
            .iter()
            .filter_map(|run| match run {
                ContentRun::Text(s) => Some(s.as_str()),
                _ => None,
            })
            .collect()
    }

    pub fn has_custom_face(&self) -> bool {
        self.runs
            .iter()
            .any(|run| matches!(run, ContentRun::CustomFace(_)))
    }
}

/// Conversation type; custom faces are encoded differently for groups
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatKind {
    Buddy,
    Group,
}

/// Decode a received `content` array
pub fn decode(wire: &Value) -> Result<MessageContent, ProtocolError> {
    let items = wire.as_array().ok_or(ProtocolError::InvalidField {
        field: "content",
        reason: "expected an array".to_string(),
    })?;

    let mut runs = Vec::with_capacity(items.len());
    let mut font = Font::default();

    for item in items {
        match item {
            Value::String(text) => runs.push(ContentRun::Text(text.clone())),
            Value::Array(parts) => {
                let Some(tag) = parts.first().and_then(Value::as_str) else {
                    debug!("skipping untagged content element");
                    continue;
                };
                match tag {
                    "font" => font = decode_font(parts.get(1)),
                    "face" => match parts.get(1).and_then(as_u32) {
                        Some(id) => runs.push(ContentRun::Face(id)),
                        None => warn!("skipping face element without id"),
                    },
                    "offpic" => match decode_offpic(parts) {
                        Some(img) => runs.push(ContentRun::OfflineImage(img)),
                        None => warn!("skipping offpic element without file path"),
                    },
                    "cface" => match decode_cface(parts) {
                        Some(face) => runs.push(ContentRun::CustomFace(face)),
                        None => warn!("skipping cface element without name"),
                    },
                    other => debug!("skipping unknown content tag '{}'", other),
                }
            }
            _ => debug!("skipping content element of unexpected type"),
        }
    }

    if runs.is_empty() {
        return Err(ProtocolError::EmptyContent);
    }
    Ok(MessageContent { runs, font })
}

/// Decode the outbound string form produced by [`encode`]
pub fn decode_wire(wire: &str) -> Result<MessageContent, ProtocolError> {
    let inner: String = serde_json::from_str(wire)?;
    let array: Value = serde_json::from_str(&inner)?;
    decode(&array)
}

/// Encode content for sending
///
/// Produces a JSON string literal wrapping the content array, with exactly
/// one trailing font element. The font size never goes out below
/// [`MIN_FONT_SIZE`].
///
/// Custom faces are sent by name only; `file_id`, `key`, `server` and
/// fetched bytes of a received face are not encoded. `decode` therefore
/// returns the same content only for runs built for sending.
pub fn encode(content: &MessageContent, kind: ChatKind) -> Result<String, ProtocolError> {
    let mut items: Vec<Value> = content
        .runs
        .iter()
        .map(|run| match run {
            ContentRun::Text(text) => Value::String(text.clone()),
            ContentRun::Face(id) => json!(["face", id]),
            ContentRun::OfflineImage(img) => {
                json!(["offpic", img.file_path, img.name, img.size])
            }
            ContentRun::CustomFace(face) => match kind {
                ChatKind::Group => json!(["cface", "group", face.name]),
                ChatKind::Buddy => json!(["cface", face.name]),
            },
        })
        .collect();

    let font = &content.font;
    items.push(json!([
        "font",
        {
            "name": font.name,
            "size": font.size.max(MIN_FONT_SIZE).to_string(),
            "style": [u8::from(font.bold), u8::from(font.italic), u8::from(font.underline)],
            "color": font.color,
        }
    ]));

    let inner = serde_json::to_string(&Value::Array(items))?;
    Ok(serde_json::to_string(&inner)?)
}

fn as_u32(value: &Value) -> Option<u32> {
    match value {
        Value::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn decode_font(wire: Option<&Value>) -> Font {
    let mut font = Font::default();
    let Some(wire) = wire else {
        return font;
    };

    if let Some(name) = json::field(wire, "name") {
        font.name = name;
    }
    if let Some(color) = json::field(wire, "color") {
        font.color = color;
    }
    if let Some(size) = json::int_field(wire, "size") {
        font.size = u32::try_from(size).unwrap_or(0);
    }
    font.size = font.size.max(MIN_FONT_SIZE);

    if let Some(style) = wire.get("style").and_then(Value::as_array) {
        let flag = |i: usize| style.get(i).and_then(Value::as_i64).is_some_and(|v| v != 0);
        font.bold = flag(0);
        font.italic = flag(1);
        font.underline = flag(2);
    }
    font
}

fn decode_offpic(parts: &[Value]) -> Option<OfflineImage> {
    match parts.get(1)? {
        // ["offpic",{"success":1,"file_path":"/d65c..."}]
        obj @ Value::Object(_) => Some(OfflineImage {
            file_path: json::field(obj, "file_path")?,
            name: json::field(obj, "name").unwrap_or_default(),
            size: json::int_field(obj, "size")
                .and_then(|s| u64::try_from(s).ok())
                .unwrap_or(0),
            data: None,
        }),
        // ["offpic","/path","name.jpg",1234]
        path => Some(OfflineImage {
            file_path: json::scalar(path)?,
            name: parts.get(2).and_then(json::scalar).unwrap_or_default(),
            size: parts
                .get(3)
                .and_then(json::scalar)
                .and_then(|s| s.parse().ok())
                .unwrap_or(0),
            data: None,
        }),
    }
}

fn decode_cface(parts: &[Value]) -> Option<CustomFace> {
    match parts.get(1)? {
        // ["cface",{"name":"0C3A...jPg","file_id":914490174,"key":"YkC3...","server":"119.147.15.201:443"}]
        obj @ Value::Object(_) => Some(CustomFace {
            name: json::field(obj, "name")?,
            file_id: json::field(obj, "file_id"),
            key: json::field(obj, "key"),
            server: json::field(obj, "server").and_then(|s| {
                let (ip, port) = s.split_once(':')?;
                Some(FaceServer {
                    ip: ip.to_string(),
                    port: port.to_string(),
                })
            }),
            data: None,
        }),
        // ["cface","group","0C3A...jPg"]
        Value::String(marker) if marker == "group" && parts.len() >= 3 => Some(CustomFace {
            name: json::scalar(&parts[2])?,
            ..CustomFace::default()
        }),
        // ["cface","0C3A...jPg",""]
        other => Some(CustomFace {
            name: json::scalar(other)?,
            ..CustomFace::default()
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_content() -> MessageContent {
        MessageContent::new(vec![
            ContentRun::text("line one\nline\ttwo \\ end \"quoted\""),
            ContentRun::Face(14),
            ContentRun::OfflineImage(OfflineImage {
                file_path: "/d65c58ae-faa6-44f3".to_string(),
                name: "shot.png".to_string(),
                size: 2048,
                data: None,
            }),
            ContentRun::CustomFace(CustomFace {
                name: "0C3AED06704CA9381EDCC20B7F552802.jPg".to_string(),
                ..CustomFace::default()
            }),
            ContentRun::text("tail"),
        ])
        .with_font(Font {
            name: "宋体".to_string(),
            size: 13,
            bold: true,
            italic: false,
            underline: true,
            color: "ff0000".to_string(),
        })
    }

    #[test]
    fn test_decode_received_message() {
        let wire: Value = serde_json::from_str(
            r#"[["font",{"size":9,"color":"000000","style":[0,0,0],"name":"\u5B8B\u4F53"}],"hello\n "]"#,
        )
        .unwrap();
        let content = decode(&wire).unwrap();
        assert_eq!(content.runs, vec![ContentRun::text("hello\n ")]);
        assert_eq!(content.font.name, "宋体");
        // Clamped to the minimum
        assert_eq!(content.font.size, MIN_FONT_SIZE);
    }

    #[test]
    fn test_decode_default_font_when_absent() {
        let wire = json!(["hi", ["face", 107]]);
        let content = decode(&wire).unwrap();
        assert_eq!(content.font, Font::default());
        assert_eq!(
            content.runs,
            vec![ContentRun::text("hi"), ContentRun::Face(107)]
        );
    }

    #[test]
    fn test_decode_skips_unknown_tags() {
        let wire = json!([["shake", 1], "text", 42]);
        let content = decode(&wire).unwrap();
        assert_eq!(content.runs, vec![ContentRun::text("text")]);
    }

    #[test]
    fn test_decode_font_only_is_empty() {
        let wire = json!([["font", {"name": "Arial"}]]);
        assert!(matches!(decode(&wire), Err(ProtocolError::EmptyContent)));
    }

    #[test]
    fn test_decode_received_image_forms() {
        let wire = json!([
            ["offpic", {"success": 1, "file_path": "/abc"}],
            ["cface", {"name": "F.jpg", "file_id": 914490174, "key": "YkC3", "server": "119.147.15.201:443"}],
            ["cface", "G.jpg", ""]
        ]);
        let content = decode(&wire).unwrap();
        let ContentRun::OfflineImage(img) = &content.runs[0] else {
            panic!("expected offpic");
        };
        assert_eq!(img.file_path, "/abc");
        let ContentRun::CustomFace(face) = &content.runs[1] else {
            panic!("expected cface");
        };
        assert_eq!(face.file_id.as_deref(), Some("914490174"));
        assert_eq!(
            face.server,
            Some(FaceServer {
                ip: "119.147.15.201".to_string(),
                port: "443".to_string()
            })
        );
        let ContentRun::CustomFace(face) = &content.runs[2] else {
            panic!("expected cface");
        };
        assert_eq!(face.name, "G.jpg");
        assert!(content.runs.iter().all(ContentRun::needs_fetch));
    }

    #[test]
    fn test_encode_escapes_with_doubled_backslashes() {
        let content = MessageContent::new(vec![ContentRun::text("a\nb\\c\td")]);
        let wire = encode(&content, ChatKind::Buddy).unwrap();
        assert!(wire.starts_with('"') && wire.ends_with('"'));
        assert!(wire.contains(r#"a\\nb\\\\c\\td"#));
    }

    #[test]
    fn test_encode_single_trailing_font() {
        let wire = encode(&sample_content(), ChatKind::Group).unwrap();
        assert_eq!(wire.matches("font").count(), 1);
        let inner: String = serde_json::from_str(&wire).unwrap();
        let array: Value = serde_json::from_str(&inner).unwrap();
        let last = array.as_array().unwrap().last().unwrap();
        assert_eq!(last[0], "font");
        assert_eq!(last[1]["size"], "13");
        assert_eq!(last[1]["style"], json!([1, 0, 1]));
    }

    #[test]
    fn test_encode_cface_by_kind() {
        let content = MessageContent::new(vec![ContentRun::CustomFace(CustomFace {
            name: "X.jpg".to_string(),
            ..CustomFace::default()
        })]);
        let group: String = serde_json::from_str(&encode(&content, ChatKind::Group).unwrap()).unwrap();
        assert!(group.starts_with(r#"[["cface","group","X.jpg"]"#));
        let buddy: String = serde_json::from_str(&encode(&content, ChatKind::Buddy).unwrap()).unwrap();
        assert!(buddy.starts_with(r#"[["cface","X.jpg"]"#));
    }

    #[test]
    fn test_round_trip() {
        let content = sample_content();
        for kind in [ChatKind::Buddy, ChatKind::Group] {
            let wire = encode(&content, kind).unwrap();
            assert_eq!(decode_wire(&wire).unwrap(), content);
        }
    }

    #[test]
    fn test_small_font_raised_and_round_trips() {
        let content = MessageContent::new(vec![ContentRun::text("tiny")]).with_font(Font {
            size: 8,
            ..Font::default()
        });
        assert_eq!(content.font.size, MIN_FONT_SIZE);
        let wire = encode(&content, ChatKind::Buddy).unwrap();
        assert_eq!(decode_wire(&wire).unwrap(), content);

        // Assigned directly, the size is still raised on the wire
        let mut direct = MessageContent::new(vec![ContentRun::text("tiny")]);
        direct.font.size = 3;
        let inner: String = serde_json::from_str(&encode(&direct, ChatKind::Buddy).unwrap()).unwrap();
        let array: Value = serde_json::from_str(&inner).unwrap();
        assert_eq!(array[1][1]["size"], "10");
    }

    #[test]
    fn test_received_custom_face_sent_by_name_only() {
        let received = MessageContent::new(vec![ContentRun::CustomFace(CustomFace {
            name: "F.jpg".to_string(),
            file_id: Some("9".to_string()),
            key: Some("K".to_string()),
            server: Some(FaceServer {
                ip: "1.2.3.4".to_string(),
                port: "80".to_string(),
            }),
            data: None,
        })]);
        let back = decode_wire(&encode(&received, ChatKind::Group).unwrap()).unwrap();
        assert_eq!(
            back.runs,
            vec![ContentRun::CustomFace(CustomFace {
                name: "F.jpg".to_string(),
                ..CustomFace::default()
            })]
        );
    }

    #[test]
    fn test_round_trip_backslash_sequences() {
        let content = MessageContent::new(vec![ContentRun::text(r"C:\new\table \\n")]);
        let wire = encode(&content, ChatKind::Buddy).unwrap();
        assert_eq!(decode_wire(&wire).unwrap(), content);
    }
}
