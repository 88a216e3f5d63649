//! Client for the downstream similarity-search service. Every call presents
//! a token obtained through [`OboExchanger`], never the server's own.

use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

use crate::{
    auth::OboExchanger,
    config::DownstreamConfig,
    error::{Error, Result},
    retry::{with_retry, RetryConfig},
    secret::Secret,
};

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SearchMatch {
    pub issue_id: String,
    pub score: f64,
}

#[derive(Serialize)]
struct SearchRequest<'a> {
    query: &'a str,
    limit: usize,
}

#[derive(Deserialize)]
struct SearchResponse {
    #[serde(default)]
    matches: Vec<SearchMatch>,
}

pub struct SimilaritySearchClient {
    search_url: Url,
    audience: String,
    exchanger: OboExchanger,
    http: reqwest::Client,
    retry: RetryConfig,
}

impl SimilaritySearchClient {
    pub fn new(config: &DownstreamConfig, exchanger: OboExchanger, http: reqwest::Client) -> Self {
        Self {
            search_url: config.search_url.clone(),
            audience: config.audience.clone(),
            exchanger,
            http,
            retry: RetryConfig::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn audience(&self) -> &str {
        &self.audience
    }

    /// Exchange `inbound` for a downstream token, then run the search. The
    /// exchange happens once; only the search POST is retried.
    pub async fn search(&self, inbound: &Secret, query: &str, limit: usize) -> Result<Vec<SearchMatch>> {
        let exchanged = self.exchanger.exchange(inbound, &self.audience).await?;
        let token = &exchanged.access_token;

        let matches = with_retry(&self.retry, || self.post_search(token, query, limit)).await?;
        debug!(audience = %self.audience, count = matches.len(), "downstream search complete");
        Ok(matches)
    }

    async fn post_search(&self, token: &Secret, query: &str, limit: usize) -> Result<Vec<SearchMatch>> {
        let response = self
            .http
            .post(self.search_url.clone())
            .bearer_auth(token.expose())
            .json(&SearchRequest { query, limit })
            .send()
            .await
            .map_err(|e| Error::UpstreamUnavailable(format!("similarity search: {}", e.without_url())))?;

        let status = response.status();
        if status.is_server_error() {
            return Err(Error::UpstreamUnavailable(format!(
                "similarity search returned HTTP {status}"
            )));
        }
        if !status.is_success() {
            return Err(Error::InternalError(format!(
                "similarity search rejected the request: HTTP {status}"
            )));
        }
        let body: SearchResponse = response
            .json()
            .await
            .map_err(|e| Error::InternalError(format!("similarity search response: {e}")))?;
        Ok(body.matches)
    }
}
