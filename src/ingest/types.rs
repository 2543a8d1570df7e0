// src/ingest/types.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Result ordering preference understood by the search endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultType {
    #[default]
    Mixed,
    Recent,
    Popular,
}

impl ResultType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResultType::Mixed => "mixed",
            ResultType::Recent => "recent",
            ResultType::Popular => "popular",
        }
    }
}

impl FromStr for ResultType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mixed" => Ok(ResultType::Mixed),
            "recent" => Ok(ResultType::Recent),
            "popular" => Ok(ResultType::Popular),
            other => anyhow::bail!("unknown result type: {other}"),
        }
    }
}

/// One acquisition stream. Two filters with equal fields share one watermark.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Filter {
    #[serde(default)]
    pub query: Option<String>,
    #[serde(default)]
    pub geocode: Option<String>,
    #[serde(default)]
    pub lang: Option<String>,
    #[serde(default)]
    pub result_type: ResultType,
}

impl Filter {
    pub fn query(q: impl Into<String>) -> Self {
        Self {
            query: Some(q.into()),
            ..Default::default()
        }
    }

    /// True when the filter can select anything (query or geocode set).
    pub fn is_meaningful(&self) -> bool {
        let set = |f: &Option<String>| f.as_deref().is_some_and(|s| !s.trim().is_empty());
        set(&self.query) || set(&self.geocode)
    }

    /// Stable textual key, used for logging, metrics labels and store lookups.
    pub fn key(&self) -> String {
        format!(
            "q={}|geo={}|lang={}|type={}",
            self.query.as_deref().unwrap_or_default(),
            self.geocode.as_deref().unwrap_or_default(),
            self.lang.as_deref().unwrap_or_default(),
            self.result_type.as_str()
        )
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

/// External result identifier. Totally ordered; `None < Some(_)` makes an absent
/// watermark the identity for `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResultId(pub u64);

impl ResultId {
    /// Accepts a JSON number or a numeric string.
    pub fn from_json(v: &Value) -> Option<Self> {
        match v {
            Value::Number(n) => n.as_u64().map(ResultId),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }
}

impl FromStr for ResultId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<u64>().map(ResultId)
    }
}

impl fmt::Display for ResultId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// Persisted as a string, the same way the search API's `id_str` is.
impl Serialize for ResultId {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ResultId {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let v = Value::deserialize(d)?;
        ResultId::from_json(&v)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid result id: {v}")))
    }
}

#[derive(Debug, Error)]
pub enum RecordError {
    #[error("record is not a JSON object")]
    NotAnObject,
    #[error("record has no usable identifier")]
    MissingId,
}

/// One retrieved item: identifier + opaque payload + normalized creation time.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultRecord {
    pub id: ResultId,
    pub created_at: Option<DateTime<Utc>>,
    pub payload: Map<String, Value>,
}

impl ResultRecord {
    /// Extract the identifier from `id_str`, falling back to `id`.
    pub fn from_value(v: Value) -> Result<Self, RecordError> {
        let Value::Object(payload) = v else {
            return Err(RecordError::NotAnObject);
        };
        let id = payload
            .get("id_str")
            .and_then(ResultId::from_json)
            .or_else(|| payload.get("id").and_then(ResultId::from_json))
            .ok_or(RecordError::MissingId)?;
        Ok(Self {
            id,
            created_at: None,
            payload,
        })
    }

    /// Rewrite `created_at` (and `user.created_at`) as RFC 3339 UTC.
    /// Unparseable values are left untouched. Returns whether the top-level field parsed.
    pub fn normalize_timestamps(&mut self) -> bool {
        self.created_at = normalize_field(&mut self.payload, "created_at");
        if let Some(Value::Object(user)) = self.payload.get_mut("user") {
            let _ = normalize_field(user, "created_at");
        }
        self.created_at.is_some()
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.payload.clone())
    }
}

fn normalize_field(obj: &mut Map<String, Value>, field: &str) -> Option<DateTime<Utc>> {
    let raw = obj.get(field)?.as_str()?;
    let ts = parse_timestamp(raw)?;
    obj.insert(field.to_string(), Value::String(ts.to_rfc3339()));
    Some(ts)
}

/// Search API format (`Wed Aug 27 13:08:45 +0000 2008`), RFC 2822 or RFC 3339.
pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    DateTime::parse_from_str(s, "%a %b %d %H:%M:%S %z %Y")
        .or_else(|_| DateTime::parse_from_rfc2822(s))
        .or_else(|_| DateTime::parse_from_rfc3339(s))
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Opaque continuation token. `None` in a page means the walk is exhausted.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PageCursor(pub String);

impl PageCursor {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RateLimitInfo {
    pub remaining: Option<u32>,
    /// Unix seconds when the current window resets.
    pub reset_at: Option<i64>,
}

#[derive(Debug, Clone, Default)]
pub struct Page {
    pub records: Vec<ResultRecord>,
    pub next: Option<PageCursor>,
    pub rate_limit: Option<RateLimitInfo>,
    /// Items dropped by the client because they carried no identifier.
    pub skipped: usize,
}

impl Page {
    pub fn new(records: Vec<ResultRecord>, next: Option<PageCursor>) -> Self {
        Self {
            records,
            next,
            ..Default::default()
        }
    }
}

#[derive(Debug, Error)]
pub enum SearchError {
    #[error("rate limited")]
    RateLimited { retry_after: Option<Duration> },

    #[error("network error: {0}")]
    Network(String),

    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("parse error: {0}")]
    Parse(String),
}

impl SearchError {
    pub fn is_rate_limit(&self) -> bool {
        matches!(self, SearchError::RateLimited { .. })
    }
}

impl From<reqwest::Error> for SearchError {
    fn from(err: reqwest::Error) -> Self {
        SearchError::Network(err.to_string())
    }
}

impl From<serde_json::Error> for SearchError {
    fn from(err: serde_json::Error) -> Self {
        SearchError::Parse(err.to_string())
    }
}

/// Returned by suspension points once shutdown was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("acquisition cancelled")]
pub struct Cancelled;

#[async_trait::async_trait]
pub trait SearchClient: Send + Sync {
    /// Fetch one page. `since_id` is the exclusive lower bound; `cursor` the upper bound
    /// returned by the previous page of the same walk.
    async fn search(
        &self,
        filter: &Filter,
        since_id: Option<ResultId>,
        cursor: Option<&PageCursor>,
    ) -> Result<Page, SearchError>;
}
