//! HTTP gateway shared by the directory clients.
//!
//! Every call goes through [`Gateway::request`]: credentials are injected,
//! each attempt is bounded by a timeout, failures are classified into
//! [`ApiError`] and retried according to the [`RetryPolicy`]. A 401 triggers
//! exactly one forced credential refresh before the error is surfaced.

use futures::stream::{self, Stream, TryStreamExt};
use regex::Regex;
use reqwest::header::{HeaderMap, ACCEPT, AUTHORIZATION};
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use url::Url;

use crate::credentials::CredentialProvider;
use crate::error::{ApiError, ApiResult};
use crate::retry::RetryPolicy;

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

const USER_AGENT: &str = concat!("team-sync/", env!("CARGO_PKG_VERSION"));

/// How a listing endpoint exposes its next page.
#[derive(Debug, Clone, Copy)]
pub enum Pagination {
    /// The body is a JSON array and the next page is announced in a
    /// `Link: <url>; rel="next"` header.
    LinkHeader,
    /// `page`/`perpage` query parameters. The body is an object carrying
    /// `totalCount` and the items under `items_field`.
    PageNumber {
        per_page: u32,
        items_field: &'static str,
    },
}

/// A successful response with its body already read.
#[derive(Debug)]
pub struct RawResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: String,
}

impl RawResponse {
    pub fn json<T: DeserializeOwned>(&self) -> ApiResult<T> {
        Ok(serde_json::from_str(&self.body)?)
    }
}

pub struct Gateway {
    name: &'static str,
    base_url: Url,
    http_client: reqwest::Client,
    credentials: Arc<dyn CredentialProvider>,
    retry: RetryPolicy,
    request_timeout: Duration,
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("name", &self.name)
            .field("base_url", &self.base_url.as_str())
            .field("retry", &self.retry)
            .field("request_timeout", &self.request_timeout)
            .finish_non_exhaustive()
    }
}

impl Gateway {
    pub fn new(
        name: &'static str,
        base_url: &str,
        credentials: Arc<dyn CredentialProvider>,
    ) -> ApiResult<Self> {
        // A trailing slash keeps any path prefix when joining endpoint paths.
        let normalized = format!("{}/", base_url.trim_end_matches('/'));
        let base_url = Url::parse(&normalized).map_err(|e| ApiError::Validation {
            status: 0,
            message: format!("Invalid base URL {}: {}", base_url, e),
        })?;

        let http_client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| ApiError::Network(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            name,
            base_url,
            http_client,
            credentials,
            retry: RetryPolicy::default(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        })
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Resolve an API path such as `/api/v1/groups` against the base URL.
    pub fn endpoint(&self, path: &str) -> ApiResult<Url> {
        self.base_url
            .join(path.trim_start_matches('/'))
            .map_err(|e| ApiError::Validation {
                status: 0,
                message: format!("Invalid endpoint path {}: {}", path, e),
            })
    }

    /// Like [`Gateway::endpoint`] with query parameters appended.
    pub fn endpoint_with_query(&self, path: &str, query: &[(&str, &str)]) -> ApiResult<Url> {
        let mut url = self.endpoint(path)?;
        if !query.is_empty() {
            url.query_pairs_mut().extend_pairs(query);
        }
        Ok(url)
    }

    pub async fn get_json<T: DeserializeOwned>(&self, url: Url) -> ApiResult<T> {
        self.request(Method::GET, url, None).await?.json()
    }

    /// Perform a request with retries and a single credential refresh on 401.
    /// Non-success statuses come back as classified errors.
    pub async fn request(
        &self,
        method: Method,
        url: Url,
        body: Option<&serde_json::Value>,
    ) -> ApiResult<RawResponse> {
        let operation = format!("{} {} {}", self.name, method, url.path());
        self.retry
            .execute(&operation, |_| self.attempt(&method, &url, body))
            .await
    }

    async fn attempt(
        &self,
        method: &Method,
        url: &Url,
        body: Option<&serde_json::Value>,
    ) -> ApiResult<RawResponse> {
        let authorization = self.credentials.authorization().await?;
        let response = self.dispatch(method, url, body, &authorization).await?;

        if response.status == StatusCode::UNAUTHORIZED
            && self.credentials.reject(&authorization).await
        {
            tracing::info!(
                target_api = self.name,
                "Credential rejected, retrying {} {} with a fresh one",
                method,
                url.path()
            );
            let authorization = self.credentials.authorization().await?;
            let response = self.dispatch(method, url, body, &authorization).await?;
            return into_result(response, url);
        }

        into_result(response, url)
    }

    async fn dispatch(
        &self,
        method: &Method,
        url: &Url,
        body: Option<&serde_json::Value>,
        authorization: &str,
    ) -> ApiResult<RawResponse> {
        let started = Instant::now();
        let mut request = self
            .http_client
            .request(method.clone(), url.clone())
            .header(AUTHORIZATION, authorization)
            .header(ACCEPT, "application/json")
            .timeout(self.request_timeout);

        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.text().await?;

        tracing::debug!(
            target_api = self.name,
            status = status.as_u16(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "{} {}",
            method,
            url
        );

        Ok(RawResponse {
            status,
            headers,
            body,
        })
    }

    /// Lazily walk every page of a listing endpoint, yielding items in order.
    ///
    /// The stream ends when the server announces no further page, when a page
    /// number listing has delivered `totalCount` items or an empty page, or
    /// when a next-page cursor repeats one already visited.
    pub fn paginate<T>(
        &self,
        first: Url,
        pagination: Pagination,
    ) -> impl Stream<Item = ApiResult<T>> + Send + '_
    where
        T: DeserializeOwned + Send + 'static,
    {
        let state = PageState {
            next: Some(first),
            page: 1,
            seen: 0,
            visited: HashSet::new(),
        };

        stream::try_unfold(state, move |mut state| async move {
            let Some(base) = state.next.take() else {
                return Ok(None);
            };

            let url = match pagination {
                Pagination::LinkHeader => base.clone(),
                Pagination::PageNumber { per_page, .. } => {
                    let mut url = base.clone();
                    url.query_pairs_mut()
                        .append_pair("perpage", &per_page.to_string())
                        .append_pair("page", &state.page.to_string());
                    url
                }
            };

            if !state.visited.insert(url.to_string()) {
                tracing::warn!(
                    target_api = self.name,
                    "Pagination cursor repeated at {}, stopping",
                    url
                );
                return Ok(None);
            }

            let response = self.request(Method::GET, url, None).await?;

            let items: Vec<T> = match pagination {
                Pagination::LinkHeader => {
                    let items: Vec<T> = response.json()?;
                    state.next = next_link(&response.headers, &base);
                    items
                }
                Pagination::PageNumber {
                    per_page,
                    items_field,
                } => {
                    let mut value: serde_json::Value = response.json()?;
                    let total = value.get("totalCount").and_then(|v| v.as_u64());
                    let items: Vec<T> = match value.get_mut(items_field) {
                        Some(raw) => serde_json::from_value(raw.take())?,
                        None => Vec::new(),
                    };
                    state.seen += items.len() as u64;
                    state.page += 1;

                    let more = match total {
                        Some(total) => state.seen < total,
                        None => items.len() as u64 >= u64::from(per_page),
                    };
                    if more && !items.is_empty() {
                        state.next = Some(base);
                    }
                    items
                }
            };

            let page = stream::iter(items.into_iter().map(Ok::<T, ApiError>));
            Ok::<_, ApiError>(Some((page, state)))
        })
        .try_flatten()
    }
}

struct PageState {
    next: Option<Url>,
    page: u32,
    seen: u64,
    visited: HashSet<String>,
}

fn into_result(response: RawResponse, url: &Url) -> ApiResult<RawResponse> {
    if response.status.is_success() {
        return Ok(response);
    }

    let retry_after = if response.status == StatusCode::TOO_MANY_REQUESTS {
        retry_after_hint(&response.headers, chrono::Utc::now().timestamp())
    } else {
        None
    };

    Err(ApiError::from_status(
        response.status,
        url.as_str(),
        &response.body,
        retry_after,
    ))
}

/// Wait hint from `Retry-After` (seconds) or Okta's `X-Rate-Limit-Reset`
/// (epoch seconds, relative to `now`).
pub(crate) fn retry_after_hint(headers: &HeaderMap, now: i64) -> Option<Duration> {
    let header_str = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());

    if let Some(secs) = header_str("retry-after").and_then(|v| v.trim().parse::<u64>().ok()) {
        return Some(Duration::from_secs(secs));
    }

    header_str("x-rate-limit-reset")
        .and_then(|v| v.trim().parse::<i64>().ok())
        .map(|reset| Duration::from_secs((reset - now).max(0) as u64))
}

lazy_static::lazy_static! {
    static ref NEXT_LINK: Regex = Regex::new(r#"<([^>]+)>\s*;\s*rel="?next"?"#).unwrap();
}

/// Extract the `rel="next"` target from one or more `Link` headers.
pub(crate) fn next_link(headers: &HeaderMap, base: &Url) -> Option<Url> {
    headers
        .get_all(reqwest::header::LINK)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .find_map(|part| {
            NEXT_LINK
                .captures(part)
                .and_then(|caps| caps.get(1))
                .and_then(|m| base.join(m.as_str()).ok())
        })
}
