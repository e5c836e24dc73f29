//! Chat list construction from export metadata.
//!
//! Channels and private groups are named by their technical name. DMs and
//! MPIMs have no useful name in the export, so they are named after the
//! people in them. The archive owner is never listed in those names; the
//! owner is guessed as the member that appears in the most DM and MPIM
//! member lists.

use std::collections::HashMap;

use crate::models::{ChatRecord, ChatType, ExportConversation, ExportUser, UserIdentity};

/// Lookup from user id to the names a user is shown by.
#[derive(Debug, Default, Clone)]
pub struct UserDirectory {
    users: HashMap<String, ExportUser>,
}

impl UserDirectory {
    pub fn new(users: &[ExportUser]) -> Self {
        Self {
            users: users.iter().map(|u| (u.id.clone(), u.clone())).collect(),
        }
    }

    pub fn get(&self, user_id: &str) -> Option<&ExportUser> {
        self.users.get(user_id)
    }

    /// Resolve display names, falling back to the raw id for unknown users.
    pub fn identity(&self, user_id: &str) -> UserIdentity {
        let member = self.users.get(user_id);
        let real_name = member
            .and_then(|m| m.profile.real_name.clone())
            .unwrap_or_else(|| user_id.to_string());
        let name = member
            .and_then(|m| m.name.clone())
            .unwrap_or_else(|| real_name.clone());
        let display_name = member
            .and_then(|m| m.profile.display_name.as_deref())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| name.clone());

        UserIdentity {
            user_id: user_id.to_string(),
            real_name,
            name,
            display_name,
        }
    }

    pub fn display_name(&self, user_id: &str) -> String {
        self.identity(user_id).display_name
    }
}

/// The four conversation lists of an export.
#[derive(Debug, Default, Clone)]
pub struct ExportMetadata {
    pub channels: Vec<ExportConversation>,
    pub groups: Vec<ExportConversation>,
    pub dms: Vec<ExportConversation>,
    pub mpims: Vec<ExportConversation>,
}

/// Most frequent member across DM and MPIM member lists. On a tie the member
/// seen first loses.
pub fn current_user_id(dms: &[ExportConversation], mpims: &[ExportConversation]) -> Option<String> {
    let mut order: Vec<&str> = Vec::new();
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for member in dms
        .iter()
        .chain(mpims.iter())
        .flat_map(|c| c.members.iter().flatten())
    {
        let count = counts.entry(member.as_str()).or_insert(0);
        if *count == 0 {
            order.push(member.as_str());
        }
        *count += 1;
    }

    let mut best: Option<(&str, usize)> = None;
    for id in order {
        let count = counts[id];
        if best.map_or(true, |(_, c)| count >= c) {
            best = Some((id, count));
        }
    }
    best.map(|(id, _)| id.to_string())
}

pub fn build_chat_list(meta: &ExportMetadata, users: &UserDirectory) -> Vec<ChatRecord> {
    let current = current_user_id(&meta.dms, &meta.mpims);
    let mut chats = Vec::new();

    let lists = [
        (&meta.channels, ChatType::Channel),
        (&meta.groups, ChatType::Group),
        (&meta.dms, ChatType::Dm),
        (&meta.mpims, ChatType::Mpim),
    ];
    for (list, kind) in lists {
        for item in list {
            chats.push(chat_record(item, kind, current.as_deref(), users));
        }
    }

    chats.retain(|c| !c.name.is_empty());
    chats.sort_by_cached_key(|c| c.name.to_lowercase());
    chats
}

fn chat_record(
    item: &ExportConversation,
    kind: ChatType,
    current: Option<&str>,
    users: &UserDirectory,
) -> ChatRecord {
    let mut name = item.name.clone();
    let mut other_member_ids = Vec::new();
    let joined = |members: &[String], sep: &str| {
        members
            .iter()
            .map(|m| users.display_name(m))
            .collect::<Vec<_>>()
            .join(sep)
    };

    match (kind, item.members.as_deref()) {
        (ChatType::Dm, Some(members)) if members.len() == 2 => {
            match members.iter().find(|m| Some(m.as_str()) != current) {
                Some(other) => {
                    name = Some(users.display_name(other));
                    other_member_ids = vec![other.clone()];
                }
                None => {
                    tracing::warn!(
                        chat_id = %item.id,
                        owner = current.unwrap_or("unknown"),
                        "could not determine other user for DM"
                    );
                    name = name.or_else(|| Some(joined(members, " & ")));
                }
            }
        }
        (ChatType::Dm, Some(members)) => {
            name = name.or_else(|| Some(joined(members, " & ")));
        }
        (ChatType::Mpim, Some(members)) => {
            let others: Vec<String> = match current {
                Some(owner) => members.iter().filter(|m| *m != owner).cloned().collect(),
                None => members.to_vec(),
            };
            let to_name = if others.is_empty() { members } else { &others[..] };
            let generated = to_name
                .iter()
                .map(|m| users.display_name(m))
                .filter(|n| !n.is_empty())
                .collect::<Vec<_>>()
                .join(", ");
            if !generated.is_empty() {
                name = Some(generated);
            }
            other_member_ids = others;
        }
        _ => {}
    }

    ChatRecord {
        id: item.id.clone(),
        name: name.unwrap_or_else(|| item.id.clone()),
        technical_name: item.name.clone(),
        kind,
        is_archived: item.is_archived.unwrap_or(false),
        other_member_ids,
    }
}
