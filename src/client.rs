use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::Config;
use crate::credentials::Credential;
use crate::model::{PostDraft, PostItem, SubmissionOutcome};

const DEFAULT_BASE_URL: &str = "https://post-to-status.vercel.app/api/";

/// Receives the human-readable request/response trace of a submission.
pub trait TraceSink: Send + Sync {
    fn trace(&self, line: &str);
}

impl<F> TraceSink for F
where
    F: Fn(&str) + Send + Sync,
{
    fn trace(&self, line: &str) {
        self(line)
    }
}

/// Forwards trace lines to `tracing` at info level.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogTrace;

impl TraceSink for LogTrace {
    fn trace(&self, line: &str) {
        info!("{}", line);
    }
}

/// Collects trace lines in memory.
#[derive(Debug, Default)]
pub struct TraceBuffer {
    lines: Mutex<Vec<String>>,
}

impl TraceBuffer {
    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().map(|l| l.clone()).unwrap_or_default()
    }

    pub fn text(&self) -> String {
        self.lines().join("\n")
    }
}

impl TraceSink for TraceBuffer {
    fn trace(&self, line: &str) {
        if let Ok(mut lines) = self.lines.lock() {
            lines.push(line.to_string());
        }
    }
}

/// Sends one post to the publishing endpoint and classifies the result.
#[async_trait]
pub trait PostSubmitter: Send + Sync {
    async fn submit(
        &self,
        post: &PostDraft,
        credential: &Credential,
        trace: &dyn TraceSink,
    ) -> SubmissionOutcome;
}

/// JSON body of `POST <base>/quick-post`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuickPostPayload<'a> {
    pub password: &'a str,
    pub content: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<&'a str>,
    #[serde(skip_serializing_if = "<[_]>::is_empty")]
    pub tags: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_data: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_name: Option<&'a str>,
    pub image_path: &'a str,
    pub shortcode_template: &'a str,
}

pub fn build_payload<'a>(post: &'a PostDraft, credential: &'a Credential) -> QuickPostPayload<'a> {
    QuickPostPayload {
        password: credential.expose(),
        content: post.content(),
        title: post.title().filter(|t| !t.trim().is_empty()),
        tags: post.tags(),
        image_data: post.image_data(),
        image_name: post.image_name(),
        image_path: post.image_path(),
        shortcode_template: post.shortcode_template(),
    }
}

#[derive(Debug, Default, Deserialize)]
struct PublishResponse {
    message: Option<String>,
    path: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ErrorResponse {
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PostsResponse {
    posts: Vec<PostItem>,
}

/// Client errors that resending the same body can never fix. Auth, timeout and
/// rate-limit responses stay retryable.
fn is_permanent(status: StatusCode) -> bool {
    status.is_client_error()
        && !matches!(
            status,
            StatusCode::UNAUTHORIZED
                | StatusCode::FORBIDDEN
                | StatusCode::REQUEST_TIMEOUT
                | StatusCode::TOO_MANY_REQUESTS
        )
}

/// Map an HTTP response to an outcome. 2xx bodies are decoded leniently.
pub fn classify_response(status: StatusCode, body: &str) -> SubmissionOutcome {
    if status.is_success() {
        let parsed: PublishResponse = serde_json::from_str(body).unwrap_or_default();
        return SubmissionOutcome::Success {
            message: parsed.message.unwrap_or_else(|| "Success".to_string()),
            published_path: parsed.path.filter(|p| !p.is_empty()),
        };
    }
    let parsed: ErrorResponse = serde_json::from_str(body).unwrap_or_default();
    let reason = parsed
        .error
        .filter(|e| !e.is_empty())
        .unwrap_or_else(|| format!("HTTP {}", status.as_u16()));
    if is_permanent(status) {
        SubmissionOutcome::PermanentFailure { reason }
    } else {
        SubmissionOutcome::RetryableFailure { reason }
    }
}

#[derive(Clone)]
pub struct HttpPublisher {
    http: Client,
    base_url: Url,
}

impl fmt::Debug for HttpPublisher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpPublisher")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl HttpPublisher {
    pub fn new(base_url: &str) -> Result<Self> {
        Self::with_timeouts(base_url, Duration::from_secs(30), Duration::from_secs(60))
    }

    pub fn from_config(cfg: &Config) -> Result<Self> {
        Self::with_timeouts(
            &cfg.endpoint.base_url,
            cfg.endpoint.connect_timeout(),
            cfg.endpoint.request_timeout(),
        )
    }

    pub fn with_timeouts(base_url: &str, connect: Duration, request: Duration) -> Result<Self> {
        let base = if base_url.trim().is_empty() {
            DEFAULT_BASE_URL
        } else {
            base_url.trim()
        };
        // Url::join drops the last path segment unless the base ends with '/'.
        let base = if base.ends_with('/') {
            base.to_string()
        } else {
            format!("{}/", base)
        };
        let base_url = Url::parse(&base).with_context(|| format!("invalid base URL: {}", base))?;
        let http = Client::builder()
            .user_agent(concat!("quickpost/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(connect)
            .timeout(request)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self { http, base_url })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn build_request(&self, payload: &QuickPostPayload<'_>) -> Result<reqwest::Request> {
        let endpoint = self
            .base_url
            .join("quick-post")
            .context("invalid quick-post URL")?;
        self.http
            .post(endpoint)
            .header("Content-Type", "application/json")
            .json(payload)
            .build()
            .context("failed to build quick-post request")
    }

    async fn execute(
        &self,
        post: &PostDraft,
        credential: &Credential,
        trace: &dyn TraceSink,
    ) -> SubmissionOutcome {
        let payload = build_payload(post, credential);
        let request = match self.build_request(&payload) {
            Ok(request) => request,
            Err(err) => {
                trace.trace(&format!("x Exception: {:#}", err));
                return SubmissionOutcome::RetryableFailure {
                    reason: format!("{:#}", err),
                };
            }
        };

        trace.trace(&format!("-> POST {}", request.url()));
        trace.trace(&format!("  title: \"{}\"", post.title().unwrap_or("")));
        trace.trace(&format!("  content length: {} chars", post.content().chars().count()));
        trace.trace(&format!("  tags: {:?}", post.tags()));
        trace.trace(&format!("  image: {}", post.image_name().unwrap_or("none")));
        trace.trace(&format!("  imagePath: {}", post.image_path()));
        trace.trace("  password: [REDACTED]");
        trace.trace("");
        trace.trace("Sending request...");

        let res = match self.http.execute(request).await {
            Ok(res) => res,
            Err(err) => {
                warn!(?err, "quick-post transport failure");
                trace.trace(&format!("x Exception: {}", err));
                return SubmissionOutcome::RetryableFailure {
                    reason: err.to_string(),
                };
            }
        };

        let status = res.status();
        let body = match res.text().await {
            Ok(body) => body,
            Err(err) => {
                trace.trace(&format!("x Exception: {}", err));
                return SubmissionOutcome::RetryableFailure {
                    reason: format!("failed to read response: {}", err),
                };
            }
        };
        trace.trace(&format!("<- HTTP {}", status.as_u16()));
        trace.trace(&format!("  Response: {}", body));

        let outcome = classify_response(status, &body);
        match &outcome {
            SubmissionOutcome::Success { message, .. } => trace.trace(&format!("ok {}", message)),
            SubmissionOutcome::RetryableFailure { reason }
            | SubmissionOutcome::PermanentFailure { reason } => {
                warn!(status = status.as_u16(), reason = %reason, "quick-post rejected");
                trace.trace(&format!("x Error: {}", reason));
            }
        }
        outcome
    }

    /// Fetch the published posts from `GET <base>/get-posts`.
    pub async fn list_posts(&self) -> Result<Vec<PostItem>> {
        let url = self.base_url.join("get-posts")?;
        let res = self
            .http
            .get(url)
            .send()
            .await
            .context("failed to reach post index")?;
        if !res.status().is_success() {
            return Err(anyhow!(
                "get-posts error {}: {}",
                res.status(),
                res.text().await.unwrap_or_default()
            ));
        }
        let body: PostsResponse = res.json().await.context("invalid get-posts response JSON")?;
        Ok(body.posts)
    }
}

#[async_trait]
impl PostSubmitter for HttpPublisher {
    async fn submit(
        &self,
        post: &PostDraft,
        credential: &Credential,
        trace: &dyn TraceSink,
    ) -> SubmissionOutcome {
        self.execute(post, credential, trace).await
    }
}
