//! Core data models used throughout the archive indexer.
//!
//! Export entities (`users.json`, `channels.json`, message files) are
//! validated into these types at the parse boundary. Fields the indexer does
//! not interpret are kept in `extra` maps so re-hydrated messages carry the
//! export content through unchanged.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// Position value of a document that has not been reconciled yet.
pub const UNASSIGNED_POSITION: i64 = -1;

// ============ Timestamps ============

/// A Slack message timestamp such as `"1700000000.000100"`.
///
/// Parsed exactly into whole seconds plus nanoseconds; a float would lose the
/// microsecond digits. The original string is kept because it is the
/// message's identity and appears verbatim in `thread_ts` references.
#[derive(Debug, Clone)]
pub struct MessageTs {
    secs: i64,
    nanos: u32,
    raw: String,
}

impl MessageTs {
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn secs(&self) -> i64 {
        self.secs
    }

    /// Microseconds since the epoch. Used as the engine's exact sort key.
    pub fn as_micros(&self) -> i64 {
        self.secs * 1_000_000 + i64::from(self.nanos / 1_000)
    }

    pub fn to_datetime(&self) -> DateTime<Utc> {
        Utc.timestamp_opt(self.secs, self.nanos)
            .single()
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
    }

    /// ISO-8601 form with millisecond precision, as stored in `ts_dt`.
    pub fn to_iso(&self) -> String {
        self.to_datetime()
            .format("%Y-%m-%dT%H:%M:%S%.3fZ")
            .to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidTs(pub String);

impl fmt::Display for InvalidTs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid message ts: {:?}", self.0)
    }
}

impl std::error::Error for InvalidTs {}

impl FromStr for MessageTs {
    type Err = InvalidTs;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || InvalidTs(s.to_string());
        let (whole, frac) = match s.split_once('.') {
            Some((w, f)) => (w, f),
            None => (s, ""),
        };
        if whole.is_empty()
            || whole.len() > 12
            || frac.len() > 9
            || !whole.bytes().all(|b| b.is_ascii_digit())
            || !frac.bytes().all(|b| b.is_ascii_digit())
        {
            return Err(invalid());
        }
        let secs: i64 = whole.parse().map_err(|_| invalid())?;
        let nanos: u32 = if frac.is_empty() {
            0
        } else {
            let padded = format!("{:0<9}", frac);
            padded.parse().map_err(|_| invalid())?
        };
        Ok(Self {
            secs,
            nanos,
            raw: s.to_string(),
        })
    }
}

impl PartialEq for MessageTs {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for MessageTs {}

impl PartialOrd for MessageTs {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for MessageTs {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.secs, self.nanos).cmp(&(other.secs, other.nanos))
    }
}

impl fmt::Display for MessageTs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl Serialize for MessageTs {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.raw)
    }
}

impl<'de> Deserialize<'de> for MessageTs {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

// ============ Messages ============

/// One message object from an export file.
///
/// `ts` is the only required field. The typed fields below accept a string
/// and read any other shape as absent; everything else (blocks, files,
/// reactions, reply metadata) stays verbatim in `extra`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub ts: MessageTs,
    #[serde(default, deserialize_with = "lenient_string", skip_serializing_if = "Option::is_none")]
    pub thread_ts: Option<String>,
    #[serde(
        rename = "type",
        default,
        deserialize_with = "lenient_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub kind: Option<String>,
    #[serde(default, deserialize_with = "lenient_string", skip_serializing_if = "Option::is_none")]
    pub subtype: Option<String>,
    #[serde(default, deserialize_with = "lenient_string", skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default, deserialize_with = "lenient_string", skip_serializing_if = "Option::is_none")]
    pub bot_id: Option<String>,
    #[serde(default, deserialize_with = "lenient_string", skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn lenient_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
    Ok(match Value::deserialize(deserializer)? {
        Value::String(s) => Some(s),
        _ => None,
    })
}

impl Message {
    /// Not a thread reply: `thread_ts` absent or equal to its own ts.
    pub fn is_top_level(&self) -> bool {
        match &self.thread_ts {
            None => true,
            Some(thread_ts) => thread_ts == self.ts.as_str(),
        }
    }

    pub fn is_thread_reply(&self) -> bool {
        !self.is_top_level()
    }

    pub fn is_thread_parent(&self) -> bool {
        self.thread_ts.as_deref() == Some(self.ts.as_str())
    }
}

/// A message together with the export file it was read from.
#[derive(Debug, Clone)]
pub struct LoadedMessage {
    pub message: Message,
    /// Path relative to the archive base directory.
    pub file_path: String,
}

/// Engine document id for a message: `{chat_id}_{ts}`.
pub fn document_id(chat_id: &str, ts: &str) -> String {
    format!("{}_{}", chat_id, ts)
}

// ============ Export metadata ============

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct UserProfile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub real_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_72: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Entry of `users.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportUser {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub real_name: Option<String>,
    #[serde(default)]
    pub profile: UserProfile,
    #[serde(default)]
    pub is_bot: bool,
    #[serde(default)]
    pub deleted: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Entry of `channels.json`, `groups.json`, `dms.json`, or `mpims.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportConversation {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub is_archived: Option<bool>,
    #[serde(default)]
    pub members: Option<Vec<String>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Names a user is known by, resolved with fallbacks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserIdentity {
    pub user_id: String,
    pub real_name: String,
    pub name: String,
    pub display_name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatType {
    Channel,
    Group,
    Dm,
    Mpim,
}

impl ChatType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChatType::Channel => "channel",
            ChatType::Group => "group",
            ChatType::Dm => "dm",
            ChatType::Mpim => "mpim",
        }
    }
}

/// A chat as shown in the chat list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRecord {
    pub id: String,
    pub name: String,
    pub technical_name: Option<String>,
    #[serde(rename = "type")]
    pub kind: ChatType,
    pub is_archived: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub other_member_ids: Vec<String>,
}

// ============ Engine documents ============

/// Projection of a message and its chat as stored in the search engine.
///
/// Field names follow Solr dynamic-field suffixes (`_s`, `_b`, `_l`, `_dt`,
/// `_ss`, `_txt_en`) so an existing schemaless core accepts them as-is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexedDocument {
    pub id: String,
    #[serde(rename = "chat_id_s")]
    pub chat_id: String,
    #[serde(rename = "chat_name_s", default)]
    pub chat_name: String,
    #[serde(rename = "chat_type_s", default)]
    pub chat_type: String,
    #[serde(rename = "ts_s")]
    pub ts: String,
    #[serde(rename = "ts_dt", default)]
    pub ts_iso: String,
    /// Exact sort key, microseconds since the epoch.
    #[serde(rename = "ts_us_l", default)]
    pub ts_micros: i64,
    #[serde(
        rename = "thread_ts_s",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub thread_ts: Option<String>,
    /// True for thread replies, which never get a position.
    #[serde(rename = "thread_message_b", default)]
    pub thread_message: bool,
    #[serde(rename = "thread_parent_b", default)]
    pub thread_parent: bool,
    #[serde(rename = "user_s", default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(
        rename = "user_name_s",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub user_name: Option<String>,
    #[serde(
        rename = "user_real_name_s",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub user_real_name: Option<String>,
    #[serde(
        rename = "user_display_name_s",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub user_display_name: Option<String>,
    #[serde(rename = "subtype_s", default, skip_serializing_if = "Option::is_none")]
    pub subtype: Option<String>,
    #[serde(rename = "text_txt_en", default)]
    pub text: String,
    #[serde(rename = "url_ss", default, skip_serializing_if = "Vec::is_empty")]
    pub urls: Vec<String>,
    #[serde(rename = "file_path_s", default)]
    pub file_path: String,
    #[serde(rename = "message_index_l", default = "unassigned")]
    pub position: i64,
}

fn unassigned() -> i64 {
    UNASSIGNED_POSITION
}

impl IndexedDocument {
    pub fn has_position(&self) -> bool {
        self.position >= 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn ts_parses_exactly() {
        let a: MessageTs = "1700000000.000100".parse().unwrap();
        let b: MessageTs = "1700000000.000099".parse().unwrap();
        assert!(b < a);
        assert_eq!(a.as_micros(), 1_700_000_000_000_100);
        assert_eq!(a.as_str(), "1700000000.000100");
    }

    #[test]
    fn ts_without_fraction() {
        let ts: MessageTs = "42".parse().unwrap();
        assert_eq!(ts.secs(), 42);
        assert_eq!(ts.as_micros(), 42_000_000);
    }

    #[test]
    fn ts_rejects_garbage() {
        for bad in ["", ".5", "abc", "1.2.3", "-1.0", "1e9", "12.3456789012"] {
            assert!(bad.parse::<MessageTs>().is_err(), "accepted {:?}", bad);
        }
    }

    #[test]
    fn ts_iso_format() {
        let ts: MessageTs = "1700000000.123456".parse().unwrap();
        assert_eq!(ts.to_iso(), "2023-11-14T22:13:20.123Z");
    }

    #[test]
    fn message_without_ts_is_rejected() {
        let result: Result<Message, _> = serde_json::from_value(json!({"text": "hi"}));
        assert!(result.is_err());
        let result: Result<Message, _> = serde_json::from_value(json!({"ts": 12, "text": "hi"}));
        assert!(result.is_err());
    }

    #[test]
    fn message_keeps_unknown_fields() {
        let msg: Message = serde_json::from_value(json!({
            "type": "message",
            "ts": "1.000001",
            "text": "hello",
            "client_msg_id": "abc",
            "edited": {"user": "U1", "ts": "2.0"}
        }))
        .unwrap();
        assert_eq!(msg.kind.as_deref(), Some("message"));
        assert_eq!(msg.extra["client_msg_id"], json!("abc"));

        let back = serde_json::to_value(&msg).unwrap();
        assert_eq!(back["edited"]["user"], json!("U1"));
        assert_eq!(back["ts"], json!("1.000001"));
    }

    #[test]
    fn secondary_fields_never_reject_a_message() {
        let odd = [
            json!({"ts": "2.0", "reactions": [{"count": 1, "users": ["U1"]}]}),
            json!({"ts": "3.0", "replies": [{"user": "U1"}]}),
            json!({"ts": "4.0", "reply_count": -1}),
            json!({"ts": "5.0", "text": {"rich": true}, "user": 7, "thread_ts": null}),
            json!({"ts": "6.0", "files": "not-a-list", "blocks": {}}),
        ];
        for value in odd {
            let msg: Message = serde_json::from_value(value.clone())
                .unwrap_or_else(|e| panic!("rejected {}: {}", value, e));
            assert!(msg.is_top_level());
        }

        let msg: Message =
            serde_json::from_value(json!({"ts": "5.0", "text": {"rich": true}, "reply_count": -1}))
                .unwrap();
        assert_eq!(msg.text, None);
        assert_eq!(msg.extra["reply_count"], json!(-1));
    }

    #[test]
    fn thread_classification() {
        let parent: Message =
            serde_json::from_value(json!({"ts": "10", "thread_ts": "10"})).unwrap();
        let reply: Message =
            serde_json::from_value(json!({"ts": "11", "thread_ts": "10"})).unwrap();
        let plain: Message = serde_json::from_value(json!({"ts": "12"})).unwrap();

        assert!(parent.is_top_level() && parent.is_thread_parent());
        assert!(reply.is_thread_reply());
        assert!(plain.is_top_level() && !plain.is_thread_parent());
    }

    #[test]
    fn chat_record_serializes_camel_case() {
        let chat = ChatRecord {
            id: "C1".into(),
            name: "general".into(),
            technical_name: Some("general".into()),
            kind: ChatType::Channel,
            is_archived: false,
            other_member_ids: vec![],
        };
        let v = serde_json::to_value(&chat).unwrap();
        assert_eq!(v["technicalName"], json!("general"));
        assert_eq!(v["type"], json!("channel"));
        assert!(v.get("otherMemberIds").is_none());
    }

    #[test]
    fn indexed_document_defaults_to_unassigned() {
        let doc: IndexedDocument = serde_json::from_value(json!({
            "id": "C1_1.0",
            "chat_id_s": "C1",
            "ts_s": "1.0"
        }))
        .unwrap();
        assert_eq!(doc.position, UNASSIGNED_POSITION);
        assert!(!doc.has_position());
    }
}
