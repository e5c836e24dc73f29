//! In-process [`SearchEngine`] for tests and `kind = "memory"`.
//!
//! Writes are staged until `commit`, so queries only ever see committed
//! documents and `rollback` really discards work. Text matching is a
//! case-insensitive whole-word match of any query term.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};

use super::{
    EngineQuery, EngineResult, Filter, Highlight, PositionUpdate, QueryResponse, SearchEngine,
    Sort,
};
use crate::error::EngineError;
use crate::models::IndexedDocument;

enum PendingOp {
    Add(IndexedDocument),
    SetPosition(PositionUpdate),
}

#[derive(Default)]
struct State {
    committed: HashMap<String, IndexedDocument>,
    pending: Vec<PendingOp>,
}

#[derive(Default)]
pub struct InMemoryEngine {
    state: Mutex<State>,
    fail_writes: AtomicBool,
}

impl InMemoryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every write (add, set_positions, commit) fail as if the engine
    /// were down. Queries keep working.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, AtomicOrdering::SeqCst);
    }

    /// Committed document by id.
    pub fn get(&self, id: &str) -> Option<IndexedDocument> {
        self.state.lock().committed.get(id).cloned()
    }

    pub fn committed_len(&self) -> usize {
        self.state.lock().committed.len()
    }

    pub fn pending_len(&self) -> usize {
        self.state.lock().pending.len()
    }

    fn check_writable(&self) -> EngineResult<()> {
        if self.fail_writes.load(AtomicOrdering::SeqCst) {
            return Err(EngineError::Unavailable);
        }
        Ok(())
    }
}

fn matches_filter(doc: &IndexedDocument, filter: &Filter) -> bool {
    match filter {
        Filter::Chat(id) => &doc.chat_id == id,
        Filter::TopLevel => !doc.thread_message,
        Filter::ThreadTs(ts) => doc.thread_ts.as_deref() == Some(ts.as_str()),
        Filter::PositionRange { from, to } => doc.position >= *from && doc.position < *to,
        Filter::TsAfter(micros) => doc.ts_micros > *micros,
        Filter::TsAtMost(micros) => doc.ts_micros <= *micros,
    }
}

fn query_terms(text: &str) -> HashSet<String> {
    words(text).map(|(_, w)| w.to_lowercase()).collect()
}

/// Alphanumeric runs of `text` with their byte offsets.
fn words(text: &str) -> impl Iterator<Item = (usize, &str)> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(move |w| (w.as_ptr() as usize - text.as_ptr() as usize, w))
}

fn score(doc: &IndexedDocument, terms: &HashSet<String>) -> usize {
    words(&doc.text)
        .filter(|(_, w)| terms.contains(&w.to_lowercase()))
        .count()
}

fn highlight_text(text: &str, terms: &HashSet<String>, hl: &Highlight) -> String {
    let mut out = String::with_capacity(text.len());
    let mut last = 0;
    for (offset, word) in words(text) {
        if terms.contains(&word.to_lowercase()) {
            out.push_str(&text[last..offset]);
            out.push_str(&hl.pre);
            out.push_str(word);
            out.push_str(&hl.post);
            last = offset + word.len();
        }
    }
    out.push_str(&text[last..]);
    out
}

fn compare(a: &IndexedDocument, b: &IndexedDocument, sort: Sort) -> Ordering {
    match sort {
        Sort::PositionAsc => a.position.cmp(&b.position).then_with(|| a.id.cmp(&b.id)),
        Sort::PositionDesc => b.position.cmp(&a.position).then_with(|| a.id.cmp(&b.id)),
        Sort::TsAsc => a.ts_micros.cmp(&b.ts_micros).then_with(|| a.id.cmp(&b.id)),
        Sort::TsDesc => b.ts_micros.cmp(&a.ts_micros).then_with(|| a.id.cmp(&b.id)),
    }
}

#[async_trait]
impl SearchEngine for InMemoryEngine {
    async fn add(&self, docs: &[IndexedDocument]) -> EngineResult<()> {
        self.check_writable()?;
        let mut state = self.state.lock();
        state
            .pending
            .extend(docs.iter().cloned().map(PendingOp::Add));
        Ok(())
    }

    async fn set_positions(&self, updates: &[PositionUpdate]) -> EngineResult<()> {
        self.check_writable()?;
        let mut state = self.state.lock();
        state
            .pending
            .extend(updates.iter().cloned().map(PendingOp::SetPosition));
        Ok(())
    }

    async fn commit(&self) -> EngineResult<()> {
        self.check_writable()?;
        let mut state = self.state.lock();
        let pending = std::mem::take(&mut state.pending);
        for op in pending {
            match op {
                PendingOp::Add(doc) => {
                    state.committed.insert(doc.id.clone(), doc);
                }
                PendingOp::SetPosition(update) => {
                    // Updates against unknown ids are dropped.
                    if let Some(doc) = state.committed.get_mut(&update.id) {
                        doc.position = update.position;
                    }
                }
            }
        }
        Ok(())
    }

    async fn rollback(&self) -> EngineResult<()> {
        self.state.lock().pending.clear();
        Ok(())
    }

    async fn query(&self, query: &EngineQuery) -> EngineResult<QueryResponse> {
        let state = self.state.lock();
        let terms = query
            .text
            .as_deref()
            .map(query_terms)
            .filter(|t| !t.is_empty());

        let mut hits: Vec<(usize, &IndexedDocument)> = state
            .committed
            .values()
            .filter(|doc| query.filters.iter().all(|f| matches_filter(doc, f)))
            .filter_map(|doc| match &terms {
                Some(terms) => {
                    let s = score(doc, terms);
                    (s > 0).then_some((s, doc))
                }
                None => Some((0, doc)),
            })
            .collect();

        match query.sort {
            Some(sort) => hits.sort_by(|a, b| compare(a.1, b.1, sort)),
            None => hits.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.id.cmp(&b.1.id))),
        }

        let num_found = hits.len() as u64;
        let page: Vec<&IndexedDocument> = hits
            .into_iter()
            .skip(query.start as usize)
            .take(query.rows as usize)
            .map(|(_, doc)| doc)
            .collect();

        let mut highlighting = HashMap::new();
        if let (Some(hl), Some(terms)) = (&query.highlight, &terms) {
            for doc in &page {
                highlighting.insert(doc.id.clone(), vec![highlight_text(&doc.text, terms, hl)]);
            }
        }

        Ok(QueryResponse {
            num_found,
            docs: page.into_iter().cloned().collect(),
            highlighting,
        })
    }

    async fn ping(&self) -> EngineResult<()> {
        Ok(())
    }
}
