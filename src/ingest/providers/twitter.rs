// src/ingest/providers/twitter.rs
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::{header::HeaderMap, Client, StatusCode, Url};
use serde::Deserialize;
use std::time::Duration;

use crate::ingest::types::{
    Filter, Page, PageCursor, RateLimitInfo, ResultId, ResultRecord, SearchClient, SearchError,
};

pub const DEFAULT_API_BASE: &str = "https://api.twitter.com";

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    statuses: Vec<serde_json::Value>,
    #[serde(default)]
    search_metadata: SearchMetadata,
}

#[derive(Debug, Default, Deserialize)]
struct SearchMetadata {
    next_results: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token_type: String,
    access_token: String,
}

/// Application-only search client (OAuth2 bearer token).
pub struct TwitterSearchClient {
    client: Client,
    base: String,
    access_token: String,
    page_size: u32,
}

impl TwitterSearchClient {
    pub fn new(base: impl Into<String>, access_token: impl Into<String>, page_size: u32) -> Self {
        Self {
            client: Client::new(),
            base: base.into().trim_end_matches('/').to_string(),
            access_token: access_token.into(),
            page_size: page_size.clamp(1, 100),
        }
    }

    /// Client-credentials grant: trade consumer key + secret for a bearer token.
    pub async fn obtain_access_token(
        base: &str,
        consumer_key: &str,
        consumer_secret: &str,
    ) -> Result<String> {
        let url = format!("{}/oauth2/token", base.trim_end_matches('/'));
        let resp = Client::new()
            .post(&url)
            .basic_auth(consumer_key, Some(consumer_secret))
            .form(&[("grant_type", "client_credentials")])
            .timeout(Duration::from_secs(30))
            .send()
            .await
            .context("token request")?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(anyhow!("token request failed (status {status}): {body}"));
        }
        let token: TokenResponse = resp.json().await.context("parsing token response")?;
        if !token.token_type.eq_ignore_ascii_case("bearer") {
            return Err(anyhow!("unexpected token type: {}", token.token_type));
        }
        Ok(token.access_token)
    }

    fn params(
        &self,
        filter: &Filter,
        since_id: Option<ResultId>,
        cursor: Option<&PageCursor>,
    ) -> Vec<(&'static str, String)> {
        let mut p = vec![
            ("q", filter.query.clone().unwrap_or_default()),
            ("count", self.page_size.to_string()),
            ("result_type", filter.result_type.as_str().to_string()),
        ];
        if let Some(g) = &filter.geocode {
            p.push(("geocode", g.clone()));
        }
        if let Some(l) = &filter.lang {
            p.push(("lang", l.clone()));
        }
        if let Some(s) = since_id {
            p.push(("since_id", s.to_string()));
        }
        if let Some(c) = cursor {
            p.push(("max_id", c.as_str().to_string()));
        }
        p
    }
}

#[async_trait]
impl SearchClient for TwitterSearchClient {
    async fn search(
        &self,
        filter: &Filter,
        since_id: Option<ResultId>,
        cursor: Option<&PageCursor>,
    ) -> Result<Page, SearchError> {
        let url = format!("{}/1.1/search/tweets.json", self.base);
        let resp = self
            .client
            .get(&url)
            .bearer_auth(&self.access_token)
            .query(&self.params(filter, since_id, cursor))
            .send()
            .await?;

        let status = resp.status();
        let rate_limit = rate_limit_info(resp.headers());
        if let Some(mut err) = status_error(status, resp.headers()) {
            if let SearchError::Api { message, .. } = &mut err {
                *message = resp.text().await.unwrap_or_default();
            }
            return Err(err);
        }

        let body: SearchResponse = serde_json::from_slice(&resp.bytes().await?)?;
        let mut skipped = 0;
        let mut records = Vec::with_capacity(body.statuses.len());
        for status in body.statuses {
            match ResultRecord::from_value(status) {
                Ok(r) => records.push(r),
                Err(e) => {
                    tracing::debug!(error = %e, "dropping status");
                    skipped += 1;
                }
            }
        }

        Ok(Page {
            records,
            next: body
                .search_metadata
                .next_results
                .as_deref()
                .and_then(cursor_from_next_results),
            rate_limit: Some(rate_limit),
            skipped,
        })
    }
}

/// Maps a non-success response to its error kind. 429 and the legacy 420
/// ("enhance your calm") are rate limits; anything else is an `Api` error with
/// the body left for the caller to fill in.
pub fn status_error(status: StatusCode, headers: &HeaderMap) -> Option<SearchError> {
    if status == StatusCode::TOO_MANY_REQUESTS || status.as_u16() == 420 {
        let retry_after = headers
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs);
        return Some(SearchError::RateLimited { retry_after });
    }
    if status.is_success() {
        return None;
    }
    Some(SearchError::Api {
        status: status.as_u16(),
        message: String::new(),
    })
}

/// `next_results` is a query string such as `?max_id=123&q=rust&include_entities=1`;
/// the continuation cursor is its `max_id`.
pub fn cursor_from_next_results(next_results: &str) -> Option<PageCursor> {
    let base = Url::parse("https://search.invalid/").ok()?;
    let url = base.join(next_results).ok()?;
    url.query_pairs()
        .find(|(k, _)| k == "max_id")
        .map(|(_, v)| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .map(PageCursor)
}

fn rate_limit_info(headers: &HeaderMap) -> RateLimitInfo {
    let num = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<i64>().ok())
    };
    RateLimitInfo {
        remaining: num("x-rate-limit-remaining").and_then(|v| u32::try_from(v).ok()),
        reset_at: num("x-rate-limit-reset"),
    }
}
