//! Authenticated, retried HTTP access to the tracker REST API and the paginated
//! search walk built on top of it.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use base64::Engine;
use reqwest::header::{HeaderValue, ACCEPT, AUTHORIZATION};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;
use tracing::{debug, error, info, info_span, warn, Instrument};
use tsync_core::RawRecord;

pub const CRATE_NAME: &str = "tsync-fetch";

/// Records requested per search call.
pub const PAGE_SIZE: usize = 100;

pub const SEARCH_ENDPOINT: &str = "/rest/api/2/search";
pub const FIELD_CATALOG_ENDPOINT: &str = "/rest/api/3/field";
pub const CREATE_META_ENDPOINT: &str =
    "/rest/api/2/issue/createmeta?expand=projects.issuetypes.fields";

/// Custom fields that still count as defaults.
pub const DEFAULT_CUSTOM_FIELDS: [&str; 2] = ["Flagged", "Story Points"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    match status {
        StatusCode::INTERNAL_SERVER_ERROR
        | StatusCode::BAD_GATEWAY
        | StatusCode::SERVICE_UNAVAILABLE
        | StatusCode::GATEWAY_TIMEOUT => RetryDisposition::Retryable,
        _ => RetryDisposition::NonRetryable,
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub max_in_flight: usize,
    pub min_request_interval: Option<Duration>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            max_in_flight: 8,
            min_request_interval: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("credentials rejected by {url}")]
    Unauthorized { url: String },
    #[error("malformed payload from {url}: {message}")]
    Decode { url: String, message: String },
    #[error("http client is shutting down")]
    Shutdown,
}

impl FetchError {
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, FetchError::Unauthorized { .. })
    }
}

/// Raw JSON GET seam between the tracker client and the network.
#[async_trait]
pub trait JsonTransport: Send + Sync {
    async fn get_json(&self, url: &str, query: &[(&str, String)]) -> Result<JsonValue, FetchError>;
}

/// `Basic <base64(username:token)>`
pub fn basic_auth_header(username: &str, token: &str) -> String {
    let encoded = base64::engine::general_purpose::STANDARD.encode(format!("{username}:{token}"));
    format!("Basic {encoded}")
}

/// Spaces successive requests at least `min_interval` apart.
#[derive(Debug)]
pub struct RequestPacer {
    min_interval: Duration,
    next_slot: Mutex<Instant>,
}

impl RequestPacer {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            next_slot: Mutex::new(Instant::now()),
        }
    }

    pub async fn wait_turn(&self) {
        let mut next = self.next_slot.lock().await;
        let now = Instant::now();
        if *next > now {
            tokio::time::sleep_until(*next).await;
        }
        *next = (*next).max(now) + self.min_interval;
    }
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    auth_header: HeaderValue,
    in_flight: Semaphore,
    pacer: Option<RequestPacer>,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig, username: &str, token: &str) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        let mut auth_header = HeaderValue::from_str(&basic_auth_header(username, token))
            .context("encoding basic auth header")?;
        auth_header.set_sensitive(true);

        Ok(Self {
            client,
            auth_header,
            in_flight: Semaphore::new(config.max_in_flight.max(1)),
            pacer: config.min_request_interval.map(RequestPacer::new),
            backoff: config.backoff,
        })
    }
}

#[async_trait]
impl JsonTransport for HttpFetcher {
    async fn get_json(&self, url: &str, query: &[(&str, String)]) -> Result<JsonValue, FetchError> {
        let _permit = self.in_flight.acquire().await.map_err(|_| FetchError::Shutdown)?;

        let span = info_span!("http_fetch", url);
        async {
            let mut attempt = 0usize;
            loop {
                if let Some(pacer) = &self.pacer {
                    pacer.wait_turn().await;
                }

                let result = self
                    .client
                    .get(url)
                    .header(AUTHORIZATION, self.auth_header.clone())
                    .header(ACCEPT, "application/json")
                    .query(query)
                    .send()
                    .await;

                match result {
                    Ok(resp) => {
                        let status = resp.status();
                        let final_url = resp.url().to_string();

                        if status.is_success() {
                            return resp.json::<JsonValue>().await.map_err(|err| FetchError::Decode {
                                url: final_url,
                                message: err.to_string(),
                            });
                        }
                        if status == StatusCode::UNAUTHORIZED {
                            return Err(FetchError::Unauthorized { url: final_url });
                        }
                        if classify_status(status) == RetryDisposition::Retryable
                            && attempt < self.backoff.max_retries
                        {
                            debug!(%status, attempt, "retrying after server error");
                            tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                            attempt += 1;
                            continue;
                        }
                        return Err(FetchError::HttpStatus {
                            status: status.as_u16(),
                            url: final_url,
                        });
                    }
                    Err(err) => {
                        if classify_reqwest_error(&err) == RetryDisposition::Retryable
                            && attempt < self.backoff.max_retries
                        {
                            debug!(error = %err, attempt, "retrying after transport error");
                            tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                            attempt += 1;
                            continue;
                        }
                        return Err(FetchError::Request(err));
                    }
                }
            }
        }
        .instrument(span)
        .await
    }
}

/// Record type names of a project plus every status id/name it declares.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProjectStatuses {
    pub record_types: Vec<String>,
    pub status_catalog: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordTypeFields {
    pub name: String,
    pub fields: BTreeSet<String>,
}

/// Every record matched by one search query, plus the merged `names` expansion.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchResult {
    pub records: Vec<RawRecord>,
    pub names: BTreeMap<String, String>,
    pub pages: usize,
}

#[derive(Debug, Deserialize)]
struct SearchPage {
    #[serde(default)]
    issues: Option<Vec<RawRecord>>,
    #[serde(default)]
    total: usize,
    #[serde(default)]
    names: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct IssueTypeStatuses {
    name: String,
    #[serde(default)]
    statuses: Vec<StatusRef>,
}

#[derive(Debug, Deserialize)]
struct StatusRef {
    id: String,
    name: String,
}

#[derive(Debug, Deserialize)]
struct FieldDescriptor {
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    custom: bool,
}

/// Tracker API client for one instance.
///
/// Request failures other than a credential rejection degrade to "no data":
/// they are logged and the caller sees an empty or partial result.
#[derive(Clone)]
pub struct TrackerClient {
    instance: String,
    base_url: String,
    transport: Arc<dyn JsonTransport>,
}

impl TrackerClient {
    pub fn new(
        instance: impl Into<String>,
        base_url: impl Into<String>,
        transport: Arc<dyn JsonTransport>,
    ) -> Self {
        Self {
            instance: instance.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            transport,
        }
    }

    /// Builds the base URL by substituting `{instance}` in `template`.
    pub fn for_instance(instance: &str, template: &str, transport: Arc<dyn JsonTransport>) -> Self {
        Self::new(instance, template.replace("{instance}", instance), transport)
    }

    pub fn instance(&self) -> &str {
        &self.instance
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn get(
        &self,
        endpoint: &str,
        query: &[(&str, String)],
    ) -> Result<Option<JsonValue>, FetchError> {
        let url = format!("{}{}", self.base_url, endpoint);
        match self.transport.get_json(&url, query).await {
            Ok(value) => Ok(Some(value)),
            Err(err) if err.is_unauthorized() => Err(err),
            Err(err) => {
                error!(instance = %self.instance, %url, error = %err, "request failed");
                Ok(None)
            }
        }
    }

    /// Record type names for a project, with the status catalog declared alongside them.
    pub async fn fetch_project_statuses(
        &self,
        project_key: &str,
    ) -> Result<ProjectStatuses, FetchError> {
        let endpoint = format!("/rest/api/2/project/{project_key}/statuses");
        let Some(data) = self.get(&endpoint, &[]).await? else {
            return Ok(ProjectStatuses::default());
        };
        let items: Vec<IssueTypeStatuses> = match serde_json::from_value(data) {
            Ok(items) => items,
            Err(err) => {
                error!(project = project_key, error = %err, "unexpected statuses payload");
                return Ok(ProjectStatuses::default());
            }
        };

        let mut out = ProjectStatuses::default();
        for item in items {
            for status in item.statuses {
                out.status_catalog.entry(status.id).or_insert(status.name);
            }
            out.record_types.push(item.name);
        }
        Ok(out)
    }

    /// Create-time field metadata per record type id, or `None` when the
    /// project has no create metadata.
    pub async fn fetch_record_type_fields(
        &self,
        project_key: &str,
    ) -> Result<Option<BTreeMap<String, RecordTypeFields>>, FetchError> {
        let Some(data) = self.get(CREATE_META_ENDPOINT, &[]).await? else {
            return Ok(None);
        };
        Ok(extract_record_type_fields(&data, project_key))
    }

    /// Non-custom field ids plus the few custom fields treated as defaults.
    pub async fn fetch_default_fields(&self) -> Result<Option<BTreeSet<String>>, FetchError> {
        let Some(data) = self.get(FIELD_CATALOG_ENDPOINT, &[]).await? else {
            return Ok(None);
        };
        match serde_json::from_value::<Vec<FieldDescriptor>>(data) {
            Ok(fields) => Ok(Some(extract_default_fields(&fields))),
            Err(err) => {
                error!(instance = %self.instance, error = %err, "unexpected field catalog payload");
                Ok(None)
            }
        }
    }

    /// Walks every page of `jql` and returns all matching records.
    pub async fn search(&self, jql: &str) -> Result<SearchResult, FetchError> {
        let mut result = SearchResult::default();
        let mut start_at = 0usize;

        loop {
            let query = [
                ("jql", jql.to_string()),
                ("maxResults", PAGE_SIZE.to_string()),
                ("startAt", start_at.to_string()),
                ("expand", "names".to_string()),
            ];
            let Some(data) = self.get(SEARCH_ENDPOINT, &query).await? else {
                warn!(instance = %self.instance, start_at, "search page unavailable; stopping");
                break;
            };
            result.pages += 1;

            let page: SearchPage = match serde_json::from_value(data) {
                Ok(page) => page,
                Err(err) => {
                    error!(
                        instance = %self.instance,
                        start_at,
                        error = %err,
                        "unexpected search payload"
                    );
                    break;
                }
            };
            result.names.extend(page.names);

            let Some(issues) = page.issues else {
                break;
            };
            if issues.is_empty() {
                break;
            }
            start_at += issues.len();
            result.records.extend(issues);
            if start_at >= page.total {
                break;
            }
        }

        info!(
            instance = %self.instance,
            records = result.records.len(),
            pages = result.pages,
            "search complete"
        );
        Ok(result)
    }
}

fn extract_record_type_fields(
    data: &JsonValue,
    project_key: &str,
) -> Option<BTreeMap<String, RecordTypeFields>> {
    let project = data
        .get("projects")
        .and_then(JsonValue::as_array)
        .and_then(|projects| {
            projects
                .iter()
                .find(|p| p.get("key").and_then(JsonValue::as_str) == Some(project_key))
        });
    let Some(project) = project else {
        error!(project = project_key, "no create metadata found for project");
        return None;
    };

    let issue_types = project
        .get("issuetypes")
        .and_then(JsonValue::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();
    let out = issue_types
        .iter()
        .filter_map(|issue_type| {
            let id = match issue_type.get("id")? {
                JsonValue::String(s) => s.clone(),
                other => other.to_string(),
            };
            let name = issue_type.get("name")?.as_str()?.to_string();
            let fields = issue_type
                .get("fields")
                .and_then(JsonValue::as_object)
                .map(|f| f.keys().cloned().collect())
                .unwrap_or_default();
            Some((id, RecordTypeFields { name, fields }))
        })
        .collect();
    Some(out)
}

fn extract_default_fields(fields: &[FieldDescriptor]) -> BTreeSet<String> {
    fields
        .iter()
        .filter(|f| !f.custom || DEFAULT_CUSTOM_FIELDS.contains(&f.name.as_str()))
        .map(|f| f.id.clone())
        .collect()
}
