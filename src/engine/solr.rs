//! Solr backend.
//!
//! Documents and atomic updates go to `POST {core}/update/json`, queries to
//! `GET {core}/select`, health checks to `GET {core}/admin/ping`.
//!
//! # Retry Strategy
//!
//! - HTTP 429 and 5xx → retry with exponential backoff
//! - HTTP 4xx (not 429) → fail immediately
//! - Timeouts and connection failures → retry
//! - Backoff: 500ms, 1s, 2s, 4s, ... (capped at 2^5 steps)

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::Duration;

use super::{
    EngineQuery, EngineResult, Filter, PositionUpdate, QueryResponse, SearchEngine, Sort,
    POSITION_FIELD, TEXT_FIELD,
};
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::models::IndexedDocument;

/// Fields every projection must include so documents still deserialize.
const REQUIRED_FIELDS: [&str; 3] = ["id", "chat_id_s", "ts_s"];

pub struct SolrEngine {
    client: reqwest::Client,
    base_url: String,
    max_retries: u32,
}

impl SolrEngine {
    pub fn new(config: &EngineConfig) -> EngineResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            base_url: config.base_url(),
            max_retries: config.max_retries,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Send a request built by `build`, retrying transient failures.
    async fn send<F>(&self, build: F) -> EngineResult<reqwest::Response>
    where
        F: Fn() -> reqwest::RequestBuilder,
    {
        let mut last_err = EngineError::Unavailable;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = Duration::from_millis(500 << (attempt - 1).min(5));
                tracing::debug!(attempt, ?delay, error = %last_err, "retrying engine request");
                tokio::time::sleep(delay).await;
            }

            let err = match build().send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return Ok(response);
                    }
                    let body = response.text().await.unwrap_or_default();
                    if status.as_u16() == 429 || status.is_server_error() {
                        EngineError::Server {
                            status: status.as_u16(),
                            body,
                        }
                    } else {
                        return Err(EngineError::Rejected {
                            status: status.as_u16(),
                            body,
                        });
                    }
                }
                Err(e) => classify(e),
            };

            if !err.is_retryable() {
                return Err(err);
            }
            last_err = err;
        }

        Err(last_err)
    }

    async fn update(&self, body: &Value) -> EngineResult<()> {
        let url = format!("{}/update/json?wt=json", self.base_url);
        self.send(|| self.client.post(&url).json(body)).await?;
        Ok(())
    }
}

fn classify(err: reqwest::Error) -> EngineError {
    if err.is_timeout() {
        EngineError::Timeout
    } else if err.is_connect() {
        EngineError::Unavailable
    } else {
        EngineError::Request(err)
    }
}

/// Quote a value for use in a field query.
fn quote(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}

pub(crate) fn filter_query(filter: &Filter) -> String {
    match filter {
        Filter::Chat(id) => format!("chat_id_s:{}", quote(id)),
        Filter::TopLevel => "thread_message_b:false".to_string(),
        Filter::ThreadTs(ts) => format!("thread_ts_s:{}", quote(ts)),
        Filter::PositionRange { from, to } => format!("{}:[{} TO {}}}", POSITION_FIELD, from, to),
        Filter::TsAfter(micros) => format!("ts_us_l:{{{} TO *]", micros),
        Filter::TsAtMost(micros) => format!("ts_us_l:[* TO {}]", micros),
    }
}

pub(crate) fn sort_clause(sort: Sort) -> String {
    let key = match sort {
        Sort::PositionAsc => "message_index_l asc",
        Sort::PositionDesc => "message_index_l desc",
        Sort::TsAsc => "ts_us_l asc",
        Sort::TsDesc => "ts_us_l desc",
    };
    format!("{}, id asc", key)
}

/// Query-string parameters for a select request.
pub(crate) fn select_params(query: &EngineQuery) -> Vec<(String, String)> {
    let mut params: Vec<(String, String)> = vec![("wt".into(), "json".into())];

    match query.text.as_deref().map(str::trim).filter(|t| !t.is_empty()) {
        Some(text) => {
            params.push(("q".into(), text.to_string()));
            params.push(("df".into(), TEXT_FIELD.into()));
        }
        None => params.push(("q".into(), "*:*".into())),
    }

    for filter in &query.filters {
        params.push(("fq".into(), filter_query(filter)));
    }

    if !query.fields.is_empty() {
        let mut fields = query.fields.clone();
        for required in REQUIRED_FIELDS {
            if !fields.iter().any(|f| f == required) {
                fields.push(required.to_string());
            }
        }
        params.push(("fl".into(), fields.join(",")));
    }

    if let Some(sort) = query.sort {
        params.push(("sort".into(), sort_clause(sort)));
    }
    params.push(("start".into(), query.start.to_string()));
    params.push(("rows".into(), query.rows.to_string()));

    if let Some(hl) = &query.highlight {
        params.push(("hl".into(), "true".into()));
        params.push(("hl.fl".into(), TEXT_FIELD.into()));
        params.push(("hl.simple.pre".into(), hl.pre.clone()));
        params.push(("hl.simple.post".into(), hl.post.clone()));
        params.push(("hl.tag.pre".into(), hl.pre.clone()));
        params.push(("hl.tag.post".into(), hl.post.clone()));
        if hl.whole_fragment {
            params.push(("hl.fragsize".into(), "0".into()));
        }
    }

    params
}

#[derive(Deserialize)]
struct SelectResponse {
    response: SelectBody,
    #[serde(default)]
    highlighting: HashMap<String, HashMap<String, Vec<String>>>,
}

#[derive(Deserialize)]
struct SelectBody {
    #[serde(rename = "numFound")]
    num_found: u64,
    #[serde(default)]
    docs: Vec<IndexedDocument>,
}

pub(crate) fn parse_select(body: Value) -> EngineResult<QueryResponse> {
    let parsed: SelectResponse = serde_json::from_value(body)?;
    let highlighting = parsed
        .highlighting
        .into_iter()
        .filter_map(|(id, mut fields)| fields.remove(TEXT_FIELD).map(|frags| (id, frags)))
        .collect();
    Ok(QueryResponse {
        num_found: parsed.response.num_found,
        docs: parsed.response.docs,
        highlighting,
    })
}

fn atomic_updates(updates: &[PositionUpdate]) -> Value {
    Value::Array(
        updates
            .iter()
            .map(|u| json!({ "id": u.id, POSITION_FIELD: { "set": u.position } }))
            .collect(),
    )
}

#[async_trait]
impl SearchEngine for SolrEngine {
    async fn add(&self, docs: &[IndexedDocument]) -> EngineResult<()> {
        if docs.is_empty() {
            return Ok(());
        }
        let body = serde_json::to_value(docs)?;
        self.update(&body).await
    }

    async fn set_positions(&self, updates: &[PositionUpdate]) -> EngineResult<()> {
        if updates.is_empty() {
            return Ok(());
        }
        self.update(&atomic_updates(updates)).await
    }

    async fn commit(&self) -> EngineResult<()> {
        self.update(&json!({ "commit": {} })).await?;
        tracing::debug!("engine commit");
        Ok(())
    }

    async fn rollback(&self) -> EngineResult<()> {
        self.update(&json!({ "rollback": {} })).await?;
        tracing::warn!("engine rollback");
        Ok(())
    }

    async fn query(&self, query: &EngineQuery) -> EngineResult<QueryResponse> {
        let url = format!("{}/select", self.base_url);
        let params = select_params(query);
        let response = self
            .send(|| self.client.get(&url).query(&params))
            .await?;
        let body: Value = response.json().await.map_err(classify)?;
        parse_select(body)
    }

    async fn ping(&self) -> EngineResult<()> {
        let url = format!("{}/admin/ping?wt=json", self.base_url);
        self.send(|| self.client.get(&url)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Highlight;

    fn param<'a>(params: &'a [(String, String)], key: &str) -> Vec<&'a str> {
        params
            .iter()
            .filter(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
            .collect()
    }

    #[test]
    fn filter_syntax() {
        assert_eq!(filter_query(&Filter::Chat("C1".into())), "chat_id_s:\"C1\"");
        assert_eq!(
            filter_query(&Filter::PositionRange { from: 10, to: 15 }),
            "message_index_l:[10 TO 15}"
        );
        assert_eq!(filter_query(&Filter::TsAfter(5)), "ts_us_l:{5 TO *]");
        assert_eq!(filter_query(&Filter::TsAtMost(5)), "ts_us_l:[* TO 5]");
        assert_eq!(
            filter_query(&Filter::ThreadTs("a\"b".into())),
            "thread_ts_s:\"a\\\"b\""
        );
    }

    #[test]
    fn window_params() {
        let query = EngineQuery::top_level("C1")
            .filter(Filter::PositionRange { from: 0, to: 5 })
            .fields(&["message_index_l"])
            .sort(Sort::PositionAsc)
            .page(0, 5);
        let params = select_params(&query);

        assert_eq!(param(&params, "q"), vec!["*:*"]);
        assert_eq!(param(&params, "fq").len(), 3);
        assert_eq!(
            param(&params, "fl"),
            vec!["message_index_l,id,chat_id_s,ts_s"]
        );
        assert_eq!(param(&params, "sort"), vec!["message_index_l asc, id asc"]);
        assert_eq!(param(&params, "rows"), vec!["5"]);
        assert!(param(&params, "hl").is_empty());
    }

    #[test]
    fn highlight_params() {
        let query = EngineQuery::new()
            .text("deploy")
            .highlight(Highlight {
                pre: "[[".into(),
                post: "]]".into(),
                whole_fragment: true,
            })
            .page(0, 50);
        let params = select_params(&query);

        assert_eq!(param(&params, "q"), vec!["deploy"]);
        assert_eq!(param(&params, "df"), vec![TEXT_FIELD]);
        assert_eq!(param(&params, "hl.simple.pre"), vec!["[["]);
        assert_eq!(param(&params, "hl.fragsize"), vec!["0"]);
    }

    #[test]
    fn parses_select_response() {
        let body = json!({
            "responseHeader": {"status": 0},
            "response": {
                "numFound": 7,
                "start": 0,
                "docs": [{
                    "id": "C1_1.0",
                    "chat_id_s": "C1",
                    "ts_s": "1.0",
                    "message_index_l": 3,
                    "_version_": 1
                }]
            },
            "highlighting": {
                "C1_1.0": {"text_txt_en": ["a [[b]]"]}
            }
        });
        let resp = parse_select(body).unwrap();
        assert_eq!(resp.num_found, 7);
        assert_eq!(resp.docs[0].position, 3);
        assert_eq!(resp.highlighting["C1_1.0"], vec!["a [[b]]"]);
    }

    #[test]
    fn malformed_response_is_decode_error() {
        let err = parse_select(json!({"error": "x"})).unwrap_err();
        assert!(matches!(err, EngineError::Decode(_)));
    }

    #[test]
    fn atomic_update_shape() {
        let body = atomic_updates(&[PositionUpdate {
            id: "C1_1.0".into(),
            position: 4,
        }]);
        assert_eq!(body, json!([{"id": "C1_1.0", "message_index_l": {"set": 4}}]));
    }
}
