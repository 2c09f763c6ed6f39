//! Forms-platform client: schema fetch, paged submission ids with filters,
//! full submissions and the reviewer roster, behind a trait seam so the
//! pipeline can run against fixtures.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::NaiveDate;
use formgrid_core::{DescriptorForest, ReviewerGroup, Submission};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{info_span, Instrument};

pub const CRATE_NAME: &str = "formgrid-source";

/// Filters forwarded to the submission-id page query. Empty means no
/// filtering on that axis.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncFilters {
    pub submitted_after: Option<NaiveDate>,
    pub submitted_before: Option<NaiveDate>,
    #[serde(default)]
    pub states: Vec<String>,
    #[serde(default)]
    pub reviewer_groups: Vec<String>,
}

impl SyncFilters {
    pub fn is_empty(&self) -> bool {
        self.submitted_after.is_none()
            && self.submitted_before.is_none()
            && self.states.is_empty()
            && self.reviewer_groups.is_empty()
    }
}

/// One page of submission ids.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SubmissionPage {
    pub numbers: Vec<i64>,
    pub next_cursor: Option<String>,
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("source api error: {0}")]
    Api(String),
    #[error("decoding source payload: {0}")]
    Decode(#[from] serde_json::Error),
}

impl SourceError {
    /// Credential problems abort the whole run instead of being retried
    /// per submission.
    pub fn is_credential(&self) -> bool {
        matches!(self, SourceError::HttpStatus { status: 401 | 403, .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
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
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

/// Everything the sync pipeline needs from the source platform.
#[async_trait]
pub trait SubmissionSource: Send + Sync {
    async fn fetch_schema(&self, form_id: i64) -> Result<DescriptorForest, SourceError>;

    async fn fetch_submission_ids_page(
        &self,
        form_id: i64,
        filters: &SyncFilters,
        cursor: Option<&str>,
    ) -> Result<SubmissionPage, SourceError>;

    async fn fetch_submission(&self, number: i64) -> Result<Submission, SourceError>;

    async fn fetch_reviewer_roster(&self, form_id: i64) -> Result<Vec<ReviewerGroup>, SourceError>;
}

#[derive(Debug, Clone)]
pub struct FormsClientConfig {
    pub base_url: String,
    pub token: String,
    pub timeout: Duration,
    pub concurrency: usize,
    pub backoff: BackoffPolicy,
}

impl Default for FormsClientConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            token: String::new(),
            timeout: Duration::from_secs(20),
            concurrency: 3,
            backoff: BackoffPolicy::default(),
        }
    }
}

const SCHEMA_QUERY: &str = "\
query FormSchema($formId: Int!) {\n\
  form(number: $formId) {\n\
    activeRevision { fields { ...descriptor subDescriptors { ...descriptor } } annotations { ...descriptor } }\n\
  }\n\
}";

const IDS_PAGE_QUERY: &str = "\
query SubmissionIds($formId: Int!, $after: String, $submittedAfter: Date, $submittedBefore: Date, $states: [String!], $reviewerGroups: [String!]) {\n\
  form(number: $formId) {\n\
    submissions(after: $after, submittedAfter: $submittedAfter, submittedBefore: $submittedBefore, states: $states, reviewerGroups: $reviewerGroups) {\n\
      pageInfo { hasNextPage endCursor }\n\
      nodes { number }\n\
    }\n\
  }\n\
}";

const SUBMISSION_QUERY: &str = "\
query FullSubmission($number: Int!) {\n\
  submission(number: $number) { ...fullSubmission }\n\
}";

const ROSTER_QUERY: &str = "\
query ReviewerRoster($formId: Int!) {\n\
  form(number: $formId) { reviewerGroups { label reviewers { id email } } }\n\
}";

#[derive(Debug, Deserialize)]
struct GraphQlEnvelope {
    #[serde(default)]
    data: Option<JsonValue>,
    #[serde(default)]
    errors: Vec<GraphQlError>,
}

#[derive(Debug, Deserialize)]
struct GraphQlError {
    message: String,
}

#[derive(Debug, Deserialize)]
struct PageInfo {
    #[serde(rename = "hasNextPage")]
    has_next_page: bool,
    #[serde(rename = "endCursor")]
    end_cursor: Option<String>,
}

/// HTTP client for the source platform's query endpoint.
#[derive(Debug)]
pub struct FormsClient {
    client: reqwest::Client,
    base_url: String,
    token: String,
    limit: Arc<Semaphore>,
    backoff: BackoffPolicy,
}

impl FormsClient {
    pub fn new(config: FormsClientConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .build()
            .context("building source http client")?;
        Ok(Self {
            client,
            base_url: config.base_url,
            token: config.token,
            limit: Arc::new(Semaphore::new(config.concurrency.max(1))),
            backoff: config.backoff,
        })
    }

    async fn execute(&self, operation: &str, query: &str, variables: JsonValue) -> Result<JsonValue, SourceError> {
        let _permit = self
            .limit
            .acquire()
            .await
            .map_err(|_| SourceError::Api("source client closed".to_string()))?;
        let span = info_span!("source_query", operation);
        self.execute_with_retries(query, variables)
            .instrument(span)
            .await
    }

    async fn execute_with_retries(
        &self,
        query: &str,
        variables: JsonValue,
    ) -> Result<JsonValue, SourceError> {
        let body = json!({ "query": query, "variables": variables });
        let mut last_request_error: Option<reqwest::Error> = None;

        for attempt in 0..=self.backoff.max_retries {
            let resp_result = self
                .client
                .post(&self.base_url)
                .bearer_auth(&self.token)
                .json(&body)
                .send()
                .await;

            match resp_result {
                Ok(resp) => {
                    let status = resp.status();
                    let url = resp.url().to_string();
                    if status.is_success() {
                        let envelope: GraphQlEnvelope = resp.json().await?;
                        if let Some(err) = envelope.errors.first() {
                            return Err(SourceError::Api(err.message.clone()));
                        }
                        return envelope
                            .data
                            .ok_or_else(|| SourceError::Api("response carried no data".to_string()));
                    }
                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(SourceError::HttpStatus {
                        status: status.as_u16(),
                        url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        last_request_error = Some(err);
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(SourceError::Request(err));
                }
            }
        }

        Err(match last_request_error {
            Some(err) => SourceError::Request(err),
            None => SourceError::Api("retry budget exhausted".to_string()),
        })
    }

    fn pointer<'a>(data: &'a JsonValue, pointer: &str) -> Result<&'a JsonValue, SourceError> {
        data.pointer(pointer)
            .ok_or_else(|| SourceError::Api(format!("missing {pointer} in response")))
    }
}

#[async_trait]
impl SubmissionSource for FormsClient {
    async fn fetch_schema(&self, form_id: i64) -> Result<DescriptorForest, SourceError> {
        let data = self
            .execute("schema", SCHEMA_QUERY, json!({ "formId": form_id }))
            .await?;
        let revision = Self::pointer(&data, "/form/activeRevision")?;
        Ok(serde_json::from_value(revision.clone())?)
    }

    async fn fetch_submission_ids_page(
        &self,
        form_id: i64,
        filters: &SyncFilters,
        cursor: Option<&str>,
    ) -> Result<SubmissionPage, SourceError> {
        let variables = json!({
            "formId": form_id,
            "after": cursor,
            "submittedAfter": filters.submitted_after,
            "submittedBefore": filters.submitted_before,
            "states": if filters.states.is_empty() { JsonValue::Null } else { json!(filters.states) },
            "reviewerGroups": if filters.reviewer_groups.is_empty() { JsonValue::Null } else { json!(filters.reviewer_groups) },
        });
        let data = self.execute("submission_ids", IDS_PAGE_QUERY, variables).await?;

        let nodes = Self::pointer(&data, "/form/submissions/nodes")?;
        let numbers = nodes
            .as_array()
            .map(|arr| {
                arr.iter()
                    .filter_map(|n| n.get("number").and_then(JsonValue::as_i64))
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();

        let page_info: PageInfo =
            serde_json::from_value(Self::pointer(&data, "/form/submissions/pageInfo")?.clone())?;
        let next_cursor = if page_info.has_next_page {
            page_info.end_cursor
        } else {
            None
        };

        Ok(SubmissionPage {
            numbers,
            next_cursor,
        })
    }

    async fn fetch_submission(&self, number: i64) -> Result<Submission, SourceError> {
        let data = self
            .execute("submission", SUBMISSION_QUERY, json!({ "number": number }))
            .await?;
        let node = Self::pointer(&data, "/submission")?;
        Ok(serde_json::from_value(node.clone())?)
    }

    async fn fetch_reviewer_roster(&self, form_id: i64) -> Result<Vec<ReviewerGroup>, SourceError> {
        let data = self
            .execute("reviewer_roster", ROSTER_QUERY, json!({ "formId": form_id }))
            .await?;
        let groups = Self::pointer(&data, "/form/reviewerGroups")?;
        Ok(serde_json::from_value(groups.clone())?)
    }
}

/// In-memory source used by tests and offline runs: the whole form is
/// loaded up front, paging and per-id failures are simulated.
#[derive(Debug, Clone, Default)]
pub struct FixtureSource {
    pub schema: DescriptorForest,
    pub submissions: BTreeMap<i64, Submission>,
    pub reviewer_groups: Vec<ReviewerGroup>,
    pub page_size: usize,
    /// Submission numbers whose fetch should fail, as if unreachable.
    pub failing: HashSet<i64>,
    /// When set, schema fetches fail, exercising the sampling fallback.
    pub schema_unavailable: bool,
}

impl FixtureSource {
    pub fn new(schema: DescriptorForest, submissions: Vec<Submission>) -> Self {
        Self {
            schema,
            submissions: submissions.into_iter().map(|s| (s.number, s)).collect(),
            reviewer_groups: Vec::new(),
            page_size: 100,
            failing: HashSet::new(),
            schema_unavailable: false,
        }
    }

    fn matches_filters(submission: &Submission, filters: &SyncFilters) -> bool {
        if let Some(after) = filters.submitted_after {
            match submission.submitted_at {
                Some(at) if at.date_naive() >= after => {}
                _ => return false,
            }
        }
        if let Some(before) = filters.submitted_before {
            match submission.submitted_at {
                Some(at) if at.date_naive() <= before => {}
                _ => return false,
            }
        }
        if !filters.states.is_empty() && !filters.states.contains(&submission.state) {
            return false;
        }
        true
    }
}

#[async_trait]
impl SubmissionSource for FixtureSource {
    async fn fetch_schema(&self, _form_id: i64) -> Result<DescriptorForest, SourceError> {
        if self.schema_unavailable {
            return Err(SourceError::Api("schema unavailable".to_string()));
        }
        Ok(self.schema.clone())
    }

    async fn fetch_submission_ids_page(
        &self,
        _form_id: i64,
        filters: &SyncFilters,
        cursor: Option<&str>,
    ) -> Result<SubmissionPage, SourceError> {
        let all: Vec<i64> = self
            .submissions
            .values()
            .filter(|s| Self::matches_filters(s, filters))
            .map(|s| s.number)
            .collect();

        let start = cursor
            .and_then(|c| c.parse::<usize>().ok())
            .unwrap_or(0);
        let page_size = self.page_size.max(1);
        let end = (start + page_size).min(all.len());
        let numbers = all[start.min(all.len())..end].to_vec();
        let next_cursor = if end < all.len() {
            Some(end.to_string())
        } else {
            None
        };
        Ok(SubmissionPage {
            numbers,
            next_cursor,
        })
    }

    async fn fetch_submission(&self, number: i64) -> Result<Submission, SourceError> {
        if self.failing.contains(&number) {
            return Err(SourceError::HttpStatus {
                status: 403,
                url: format!("fixture://submissions/{number}"),
            });
        }
        self.submissions
            .get(&number)
            .cloned()
            .ok_or_else(|| SourceError::Api(format!("unknown submission {number}")))
    }

    async fn fetch_reviewer_roster(&self, _form_id: i64) -> Result<Vec<ReviewerGroup>, SourceError> {
        Ok(self.reviewer_groups.clone())
    }
}
