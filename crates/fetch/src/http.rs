//! Message gateway over HTTP.
//!
//! `GET {base}/sources/{identity}/messages?limit=N[&before=ID]` returns
//! `{"messages": [...]}` newest first. Status codes map onto
//! [`SourceError`]: 429 is a rate limit (honouring `Retry-After`), 404 means
//! the identity is gone, 5xx and network failures are transient.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::RETRY_AFTER;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use url::Url;

use chatsync_core::config::SourceApiConfig;
use chatsync_core::Record;

use crate::error::SourceError;
use crate::source::{FetchDirection, MessageSource};

/// Wait used when a 429 carries no usable `Retry-After`.
const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    messages: Vec<Record>,
}

#[derive(Debug, Clone)]
pub struct HttpMessageSource {
    base_url: Url,
    token: Option<String>,
    client: Client,
}

impl HttpMessageSource {
    pub fn new(base_url: Url, token: Option<String>) -> Self {
        Self {
            base_url,
            token,
            client: Client::new(),
        }
    }

    pub fn from_config(config: &SourceApiConfig) -> Result<Self, url::ParseError> {
        Ok(Self::new(Url::parse(&config.base_url)?, config.token.clone()))
    }

    fn messages_url(&self, identity: &str, direction: FetchDirection, limit: u32) -> Result<Url, SourceError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| SourceError::NotFound(format!("base url {} cannot carry a path", self.base_url)))?
            .pop_if_empty()
            .extend(["sources", identity, "messages"]);
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("limit", &limit.to_string());
            if let FetchDirection::OlderThan(before) = direction {
                query.append_pair("before", &before.to_string());
            }
        }
        Ok(url)
    }
}

#[async_trait]
impl MessageSource for HttpMessageSource {
    async fn fetch(
        &self,
        identity: &str,
        direction: FetchDirection,
        limit: u32,
    ) -> Result<Vec<Record>, SourceError> {
        let url = self.messages_url(identity, direction, limit)?;
        tracing::debug!(identity, %direction, limit, "requesting messages");

        let mut request = self.client.get(url);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        let response = request.send().await.map_err(transport_error)?;

        let status = response.status();
        if status.is_success() {
            let body: MessagesResponse = response.json().await.map_err(transport_error)?;
            return Ok(body.messages);
        }

        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_retry_after);
        Err(classify_status(status, retry_after, identity))
    }
}

fn transport_error(err: reqwest::Error) -> SourceError {
    if err.is_timeout() {
        SourceError::Transient(format!("request timed out: {err}"))
    } else if err.is_connect() {
        SourceError::Transient(format!("connection failed: {err}"))
    } else {
        SourceError::Transient(err.to_string())
    }
}

/// `Retry-After` in delta-seconds form. HTTP-date values are not used by the
/// gateway and fall back to the default.
fn parse_retry_after(value: &str) -> Option<Duration> {
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}

fn classify_status(status: StatusCode, retry_after: Option<Duration>, identity: &str) -> SourceError {
    match status {
        StatusCode::TOO_MANY_REQUESTS => SourceError::RateLimited {
            wait: retry_after.unwrap_or(DEFAULT_RETRY_AFTER),
        },
        StatusCode::NOT_FOUND | StatusCode::GONE => SourceError::NotFound(identity.to_string()),
        s => SourceError::Transient(format!("gateway returned {s}")),
    }
}
