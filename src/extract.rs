//! Projection of export messages into engine documents.
//!
//! Every message with a valid `ts` becomes one [`IndexedDocument`], thread
//! replies included. Replies are flagged with `thread_message_b` so the
//! position sequence can leave them out. Positions start unassigned; the
//! reconciler fills them in after the chat is committed.

use serde_json::Value;

use crate::archive::UserDirectory;
use crate::models::{
    document_id, ChatRecord, IndexedDocument, LoadedMessage, Message, UNASSIGNED_POSITION,
};

/// Build the engine document for one loaded message of `chat`.
pub fn extract_document(
    loaded: &LoadedMessage,
    chat: &ChatRecord,
    users: &UserDirectory,
) -> IndexedDocument {
    let message = &loaded.message;
    let ts = message.ts.as_str();

    let (user_id, user_name, user_real_name, user_display_name) = match &message.user {
        Some(user) => {
            let identity = users.identity(user);
            (
                Some(identity.user_id),
                Some(identity.name),
                Some(identity.real_name),
                Some(identity.display_name),
            )
        }
        None => {
            // Bot posts carry no user id; the export names them via `username`.
            let username = message
                .extra
                .get("username")
                .and_then(Value::as_str)
                .map(str::to_string);
            (
                message.bot_id.clone(),
                username.clone(),
                None,
                username,
            )
        }
    };

    IndexedDocument {
        id: document_id(&chat.id, ts),
        chat_id: chat.id.clone(),
        chat_name: chat.name.clone(),
        chat_type: chat.kind.as_str().to_string(),
        ts: ts.to_string(),
        ts_iso: message.ts.to_iso(),
        ts_micros: message.ts.as_micros(),
        thread_ts: message.thread_ts.clone(),
        thread_message: message.is_thread_reply(),
        thread_parent: message.is_thread_parent(),
        user_id,
        user_name,
        user_real_name,
        user_display_name,
        subtype: message.subtype.clone(),
        text: message.text.clone().unwrap_or_default(),
        urls: extract_urls(message),
        file_path: loaded.file_path.clone(),
        position: UNASSIGNED_POSITION,
    }
}

/// String values of every `url` key, at any depth.
pub fn extract_urls(message: &Message) -> Vec<String> {
    let mut urls = Vec::new();
    // Serializing cannot fail: every field is already a JSON value or string.
    if let Ok(value) = serde_json::to_value(message) {
        collect_urls(&value, &mut urls);
    }
    urls
}

fn collect_urls(value: &Value, out: &mut Vec<String>) {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                match child {
                    Value::String(s) if key == "url" => out.push(s.clone()),
                    _ => collect_urls(child, out),
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_urls(item, out);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ChatType, ExportUser};
    use serde_json::json;

    fn chat() -> ChatRecord {
        ChatRecord {
            id: "C1".into(),
            name: "general".into(),
            technical_name: Some("general".into()),
            kind: ChatType::Channel,
            is_archived: false,
            other_member_ids: vec![],
        }
    }

    fn loaded(value: Value) -> LoadedMessage {
        LoadedMessage {
            message: serde_json::from_value(value).unwrap(),
            file_path: "general/2024-01-01.json".into(),
        }
    }

    fn users() -> UserDirectory {
        let users: Vec<ExportUser> = serde_json::from_value(json!([
            {"id": "U1", "name": "ann", "profile": {"real_name": "Ann A", "display_name": "annie"}}
        ]))
        .unwrap();
        UserDirectory::new(&users)
    }

    #[test]
    fn builds_document_fields() {
        let doc = extract_document(
            &loaded(json!({
                "type": "message",
                "ts": "1700000000.000100",
                "user": "U1",
                "text": "see https://example.com"
            })),
            &chat(),
            &users(),
        );

        assert_eq!(doc.id, "C1_1700000000.000100");
        assert_eq!(doc.chat_type, "channel");
        assert_eq!(doc.ts_micros, 1_700_000_000_000_100);
        assert_eq!(doc.user_display_name.as_deref(), Some("annie"));
        assert_eq!(doc.user_real_name.as_deref(), Some("Ann A"));
        assert_eq!(doc.file_path, "general/2024-01-01.json");
        assert!(!doc.thread_message);
        assert!(!doc.has_position());
    }

    #[test]
    fn thread_flags() {
        let parent = extract_document(
            &loaded(json!({"ts": "10.0", "thread_ts": "10.0", "text": "q"})),
            &chat(),
            &users(),
        );
        let reply = extract_document(
            &loaded(json!({"ts": "11.0", "thread_ts": "10.0", "text": "a"})),
            &chat(),
            &users(),
        );
        assert!(parent.thread_parent && !parent.thread_message);
        assert!(reply.thread_message && !reply.thread_parent);
        assert_eq!(reply.thread_ts.as_deref(), Some("10.0"));
    }

    #[test]
    fn bot_messages_use_username() {
        let doc = extract_document(
            &loaded(json!({"ts": "1.0", "bot_id": "B1", "username": "deploybot", "subtype": "bot_message"})),
            &chat(),
            &users(),
        );
        assert_eq!(doc.user_id.as_deref(), Some("B1"));
        assert_eq!(doc.user_name.as_deref(), Some("deploybot"));
        assert_eq!(doc.subtype.as_deref(), Some("bot_message"));
        assert_eq!(doc.text, "");
    }

    #[test]
    fn collects_nested_url_keys() {
        let message: Message = serde_json::from_value(json!({
            "ts": "1.0",
            "url": "https://top.example",
            "attachments": [
                {"title": "x", "url": "https://a.example", "original_url": "https://ignored.example"},
                {"blocks": [{"elements": [{"type": "link", "url": "https://deep.example"}]}]}
            ],
            "files": [{"url": 42}]
        }))
        .unwrap();

        let urls = extract_urls(&message);
        assert!(urls.contains(&"https://top.example".to_string()));
        assert!(urls.contains(&"https://a.example".to_string()));
        assert!(urls.contains(&"https://deep.example".to_string()));
        assert!(!urls.iter().any(|u| u.contains("ignored")));
        assert_eq!(urls.len(), 3);
    }
}
