use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use reqwest::StatusCode;
use reqwest::header::{ACCEPT, AUTHORIZATION, HeaderMap, HeaderValue, RETRY_AFTER, USER_AGENT};
use serde::Deserialize;
use serde::de::DeserializeOwned;

use super::{PendingWork, RegistrationToken, RegistryApi, RegistryWorker, RegistryWorkerStatus};
use crate::config::Config;
use crate::error::AdapterError;

const GITHUB_API: &str = "https://api.github.com";
const MAX_ATTEMPTS: u32 = 3;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const PAGE_SIZE: usize = 100;

/// GitHub Actions REST adapter.
pub struct GithubRegistry {
    http: reqwest::Client,
    scope: String,
    org_scope: bool,
    name_prefix: String,
}

impl GithubRegistry {
    pub fn new(config: &Config) -> Result<Self, AdapterError> {
        let mut headers = HeaderMap::new();
        let mut auth = HeaderValue::from_str(&format!("token {}", config.token))
            .map_err(|_| AdapterError::Fatal("token contains invalid header characters".into()))?;
        auth.set_sensitive(true);
        headers.insert(AUTHORIZATION, auth);
        headers.insert(ACCEPT, HeaderValue::from_static("application/vnd.github+json"));
        headers.insert(USER_AGENT, HeaderValue::from_static("runner-controller"));

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| AdapterError::Fatal(format!("failed to build http client: {e}")))?;

        Ok(Self {
            http,
            scope: config.scope_path(),
            org_scope: config.org_scope(),
            name_prefix: config.runner_prefix.clone(),
        })
    }

    /// Send a request, retrying transient failures with exponential backoff.
    /// Rate-limit responses honor `Retry-After`; auth rejections never retry.
    async fn request<F>(&self, build: F) -> Result<reqwest::Response, AdapterError>
    where
        F: Fn() -> reqwest::RequestBuilder,
    {
        let mut backoff = Duration::from_secs(1);
        for attempt in 1..=MAX_ATTEMPTS {
            let outcome = match build().send().await {
                Ok(response) => classify(response)?,
                Err(e) => Outcome::Retry(None, e.to_string()),
            };
            match outcome {
                Outcome::Done(response) => return Ok(response),
                Outcome::Retry(after, why) => {
                    if attempt == MAX_ATTEMPTS {
                        return Err(AdapterError::Transient(why));
                    }
                    let delay = after.unwrap_or(backoff) + jitter();
                    tracing::warn!(
                        "github call failed (attempt {attempt}/{MAX_ATTEMPTS}), \
                         retrying in {delay:?}: {why}"
                    );
                    tokio::time::sleep(delay).await;
                    backoff *= 2;
                }
            }
        }
        unreachable!("retry loop returns before exhausting attempts")
    }

    fn url(&self, suffix: &str) -> String {
        format!("{GITHUB_API}/{}/actions/{suffix}", self.scope)
    }

    async fn count_runs(&self, status: &str) -> Result<u64, AdapterError> {
        let url = self.url("runs");
        let response = self
            .request(|| {
                self.http
                    .get(&url)
                    .query(&[("status", status), ("per_page", "1")])
            })
            .await?;
        let page: RunsPage = parse_json(response).await?;
        Ok(page.total_count)
    }
}

enum Outcome {
    Done(reqwest::Response),
    Retry(Option<Duration>, String),
}

fn classify(response: reqwest::Response) -> Result<Outcome, AdapterError> {
    let status = response.status();
    if status == StatusCode::UNAUTHORIZED {
        return Err(AdapterError::Auth(format!("github returned {status}")));
    }
    if status == StatusCode::FORBIDDEN {
        // 403 is both "bad credentials scope" and "rate limited"; only the
        // latter carries rate-limit headers.
        return if rate_limited(&response) {
            Ok(Outcome::Retry(
                retry_after(&response),
                "rate limited".into(),
            ))
        } else {
            Err(AdapterError::Auth(format!("github returned {status}")))
        };
    }
    if status == StatusCode::TOO_MANY_REQUESTS {
        return Ok(Outcome::Retry(retry_after(&response), "rate limited".into()));
    }
    if status.is_server_error() {
        return Ok(Outcome::Retry(None, format!("github returned {status}")));
    }
    Ok(Outcome::Done(response))
}

fn rate_limited(response: &reqwest::Response) -> bool {
    if response.headers().contains_key(RETRY_AFTER) {
        return true;
    }
    response
        .headers()
        .get("x-ratelimit-remaining")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == "0")
}

fn retry_after(response: &reqwest::Response) -> Option<Duration> {
    response
        .headers()
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs)
}

fn jitter() -> Duration {
    Duration::from_millis(rand::thread_rng().gen_range(0..250))
}

async fn parse_json<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, AdapterError> {
    let status = response.status();
    if !status.is_success() {
        return Err(AdapterError::Fatal(format!("github returned {status}")));
    }
    response
        .json::<T>()
        .await
        .map_err(|e| AdapterError::Fatal(format!("malformed github response: {e}")))
}

#[derive(Deserialize)]
struct RunnersPage {
    runners: Vec<ApiRunner>,
}

#[derive(Deserialize)]
struct ApiRunner {
    id: i64,
    name: String,
    status: RegistryWorkerStatus,
    busy: bool,
    #[serde(default)]
    labels: Vec<ApiLabel>,
}

#[derive(Deserialize)]
struct ApiLabel {
    name: String,
}

#[derive(Deserialize)]
struct RunsPage {
    total_count: u64,
}

impl From<ApiRunner> for RegistryWorker {
    fn from(r: ApiRunner) -> Self {
        RegistryWorker {
            id: r.id,
            name: r.name,
            status: r.status,
            busy: r.busy,
            labels: r.labels.into_iter().map(|l| l.name).collect(),
        }
    }
}

#[async_trait]
impl RegistryApi for GithubRegistry {
    async fn list_workers(&self) -> Result<Vec<RegistryWorker>, AdapterError> {
        let url = self.url("runners");
        let mut workers = Vec::new();
        let mut page = 1usize;
        loop {
            let page_param = page.to_string();
            let response = self
                .request(|| {
                    self.http
                        .get(&url)
                        .query(&[("per_page", "100"), ("page", page_param.as_str())])
                })
                .await?;
            let body: RunnersPage = parse_json(response).await?;
            let fetched = body.runners.len();
            workers.extend(
                body.runners
                    .into_iter()
                    .filter(|r| r.name.starts_with(&self.name_prefix))
                    .map(RegistryWorker::from),
            );
            if fetched < PAGE_SIZE {
                return Ok(workers);
            }
            page += 1;
        }
    }

    async fn fetch_registration_token(&self) -> Result<RegistrationToken, AdapterError> {
        let url = self.url("runners/registration-token");
        let response = self.request(|| self.http.post(&url)).await?;
        parse_json(response).await
    }

    async fn delete_worker(&self, id: i64) -> Result<(), AdapterError> {
        let url = self.url(&format!("runners/{id}"));
        let response = self.request(|| self.http.delete(&url)).await?;
        match response.status() {
            StatusCode::NO_CONTENT | StatusCode::NOT_FOUND => Ok(()),
            other => Err(AdapterError::Fatal(format!(
                "unexpected status {other} deleting runner {id}"
            ))),
        }
    }

    async fn list_pending_work(&self) -> Result<PendingWork, AdapterError> {
        if self.org_scope {
            // The org-level API has no cheap queued-run count. Report the
            // gap and derive in-progress from busy runners.
            let busy = self
                .list_workers()
                .await?
                .iter()
                .filter(|w| w.busy)
                .count() as u64;
            return Ok(PendingWork {
                queued: None,
                in_progress: busy,
            });
        }
        let queued = self.count_runs("queued").await?;
        let in_progress = self.count_runs("in_progress").await?;
        Ok(PendingWork {
            queued: Some(queued),
            in_progress,
        })
    }
}
