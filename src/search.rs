//! Full-text search over indexed messages.
//!
//! The engine highlights matches by wrapping them in sentinel markers that
//! cannot occur in chat text. Hits carry the marked-up phrases as plain
//! strings, so clients highlight on their own and never see the markers.
//! Results are ordered newest first.

use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

use crate::engine::{EngineQuery, Highlight, SearchEngine, Sort};

pub const HL_PRE_MARKER: &str = "@@SLACK_HL_START@@";
pub const HL_POST_MARKER: &str = "@@SLACK_HL_END@@";

static HIGHLIGHT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(
        "(?s){}(.*?){}",
        regex::escape(HL_PRE_MARKER),
        regex::escape(HL_POST_MARKER)
    ))
    .expect("valid highlight pattern")
});

/// A single search result.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SearchHit {
    pub id: String,
    pub chat_id: String,
    pub ts: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_ts: Option<String>,
    /// Position within the chat; `None` for thread replies and messages not
    /// yet reconciled.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_name: Option<String>,
    pub text: String,
    /// Matched phrases, first occurrence order, without duplicates.
    pub highlight_phrases: Vec<String>,
}

/// Phrases between highlight markers across all fragments.
pub fn highlight_phrases(fragments: &[String]) -> Vec<String> {
    let mut phrases: Vec<String> = Vec::new();
    for fragment in fragments {
        for cap in HIGHLIGHT_RE.captures_iter(fragment) {
            let phrase = &cap[1];
            if !phrase.is_empty() && !phrases.iter().any(|p| p == phrase) {
                phrases.push(phrase.to_string());
            }
        }
    }
    phrases
}

/// Search message text. A blank query returns no hits.
pub async fn search_messages(
    engine: &dyn SearchEngine,
    query: &str,
    limit: usize,
) -> Result<Vec<SearchHit>> {
    let query = query.trim();
    if query.is_empty() || limit == 0 {
        return Ok(Vec::new());
    }

    let started = std::time::Instant::now();
    let resp = engine
        .query(
            &EngineQuery::new()
                .text(query)
                .sort(Sort::TsDesc)
                .page(0, limit as u64)
                .highlight(Highlight {
                    pre: HL_PRE_MARKER.to_string(),
                    post: HL_POST_MARKER.to_string(),
                    whole_fragment: true,
                }),
        )
        .await
        .with_context(|| format!("Search failed for query {:?}", query))?;

    let hits: Vec<SearchHit> = resp
        .docs
        .into_iter()
        .map(|doc| {
            let highlight_phrases = resp
                .highlighting
                .get(&doc.id)
                .map(|frags| highlight_phrases(frags))
                .unwrap_or_default();
            SearchHit {
                position: doc.has_position().then_some(doc.position),
                id: doc.id,
                chat_id: doc.chat_id,
                ts: doc.ts,
                thread_ts: doc.thread_ts,
                user: doc.user_id,
                user_name: doc.user_display_name.or(doc.user_name),
                text: doc.text,
                highlight_phrases,
            }
        })
        .collect();

    tracing::debug!(
        query,
        hits = hits.len(),
        total = resp.num_found,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "search complete"
    );
    Ok(hits)
}
