// src/ingest/providers/scripted.rs
use async_trait::async_trait;
use serde_json::json;
use std::collections::VecDeque;
use std::sync::Mutex;

use crate::ingest::types::{
    Filter, Page, PageCursor, ResultId, ResultRecord, SearchClient, SearchError,
};

/// One observed `search` invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchCall {
    pub filter: Filter,
    pub since_id: Option<ResultId>,
    pub cursor: Option<PageCursor>,
}

/// Replays a fixed sequence of responses; once exhausted every call returns an empty,
/// final page. Keeps a log of calls for assertions.
pub struct ScriptedClient {
    script: Mutex<VecDeque<Result<Page, SearchError>>>,
    calls: Mutex<Vec<SearchCall>>,
}

impl ScriptedClient {
    pub fn new(script: Vec<Result<Page, SearchError>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<SearchCall> {
        self.calls.lock().expect("calls mutex poisoned").clone()
    }
}

#[async_trait]
impl SearchClient for ScriptedClient {
    async fn search(
        &self,
        filter: &Filter,
        since_id: Option<ResultId>,
        cursor: Option<&PageCursor>,
    ) -> Result<Page, SearchError> {
        self.calls.lock().expect("calls mutex poisoned").push(SearchCall {
            filter: filter.clone(),
            since_id,
            cursor: cursor.cloned(),
        });
        self.script
            .lock()
            .expect("script mutex poisoned")
            .pop_front()
            .unwrap_or_else(|| Ok(Page::default()))
    }
}

/// Minimal search-API-shaped record.
pub fn record(id: u64) -> ResultRecord {
    ResultRecord::from_value(json!({
        "id": id,
        "id_str": id.to_string(),
        "text": format!("post {id}"),
        "created_at": "Wed Aug 27 13:08:45 +0000 2008",
    }))
    .expect("record fixture has an id")
}

/// Page with the given ids and an optional continuation cursor.
pub fn page(ids: &[u64], next: Option<&str>) -> Page {
    Page::new(
        ids.iter().copied().map(record).collect(),
        next.map(|c| PageCursor(c.to_string())),
    )
}
