//! Request dispatcher for the rate-limited HTTP channel.
//!
//! The dispatcher resolves which bucket(s) a call needs from its method and
//! path, queues behind all of them jointly, then executes the call. A 429 is
//! never retried here; it is surfaced to the caller with diagnostic metadata.
//! This `request` method plus the cache handle is the entire contract exposed
//! to the external manager layer: managers never touch the socket or buckets.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use reqwest::{multipart, Client, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;
use thiserror::Error;
use tokio::time::Instant;
use tracing::debug;

use crate::rest::bucket::{AdmitGate, Bucket};
use crate::retry::{retry_async, RetryPolicy};

pub const DEFAULT_BASE_URL: &str = "https://api.quill.chat";
pub const DEFAULT_API_VERSION: u8 = 6;
const ERROR_BODY_SNIPPET_LEN: usize = 220;

/// HTTP methods accepted by the dispatcher.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Method {
    Get,
    Post,
    Patch,
    Put,
    Delete,
}

impl Method {
    pub fn as_str(self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Patch => "PATCH",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
        }
    }

    fn to_reqwest(self) -> reqwest::Method {
        match self {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
            Method::Patch => reqwest::Method::PATCH,
            Method::Put => reqwest::Method::PUT,
            Method::Delete => reqwest::Method::DELETE,
        }
    }
}

/// Rate-limit bucket identity resolved from an HTTP method and path.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub enum BucketKey {
    /// Global cap shared by every authenticated call.
    Global,
    /// Per-channel message-send cap.
    ChannelSend(String),
    /// Strict cap on account profile changes (username and friends).
    ProfileUpdate,
    /// Fallback per-route bucket.
    Route(String),
}

impl fmt::Display for BucketKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BucketKey::Global => f.write_str("global"),
            BucketKey::ChannelSend(id) => write!(f, "channel-send:{id}"),
            BucketKey::ProfileUpdate => f.write_str("profile-update"),
            BucketKey::Route(route) => write!(f, "route:{route}"),
        }
    }
}

impl BucketKey {
    /// Admission limit and window for this bucket class.
    fn config(&self) -> (u32, Duration) {
        match self {
            BucketKey::Global => (50, Duration::from_secs(1)),
            BucketKey::ChannelSend(_) => (5, Duration::from_secs(5)),
            BucketKey::ProfileUpdate => (2, Duration::from_secs(3600)),
            BucketKey::Route(_) => (5, Duration::from_secs(1)),
        }
    }
}

/// File attachment sent as a multipart part instead of a JSON body.
#[derive(Clone, Debug)]
pub struct FileAttachment {
    pub name: String,
    pub data: Vec<u8>,
}

/// Options for a single dispatched request.
#[derive(Debug, Default)]
pub struct RequestOptions {
    /// Attach the Authorization header.
    pub auth: bool,
    /// JSON body, or the `payload_json` part when a file is attached.
    pub body: Option<Value>,
    /// Optional file attachment; switches the request to multipart encoding.
    pub file: Option<FileAttachment>,
}

impl RequestOptions {
    pub fn authenticated() -> Self {
        Self {
            auth: true,
            ..Self::default()
        }
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_file(mut self, name: impl Into<String>, data: Vec<u8>) -> Self {
        self.file = Some(FileAttachment {
            name: name.into(),
            data,
        });
        self
    }
}

/// Errors produced by the HTTP channel.
#[derive(Debug, Error)]
pub enum RestError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("http status {status}: {body}")]
    HttpStatus { status: StatusCode, body: String },

    /// Server-signaled throttling. Never retried internally; the caller
    /// decides what to do with the diagnostic metadata.
    #[error(
        "rate limited on {buckets:?} (retry_after {retry_after_ms:?} ms, \
         latency {latency_ms} ms, shard {shard})"
    )]
    RateLimited {
        retry_after_ms: Option<u64>,
        buckets: Vec<String>,
        latency_ms: u64,
        shard: u16,
    },

    #[error("failed to parse response: {0}")]
    Parse(String),

    #[error("bucket queue is closed")]
    QueueClosed,
}

impl RestError {
    /// Only connection-level transport blips are retryable. HTTP statuses,
    /// including 429, always reach the caller untouched.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(err) => err.is_timeout() || err.is_connect(),
            _ => false,
        }
    }
}

#[derive(Clone, Debug)]
pub struct RequestDispatcherOptions {
    pub base_url: String,
    pub api_version: u8,
    pub user_agent: String,
    pub connect_timeout: Duration,
    pub attempt_timeout: Duration,
    pub retry_policy: RetryPolicy,
    /// Shard id echoed in rate-limit diagnostics.
    pub shard: u16,
}

impl Default for RequestDispatcherOptions {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            api_version: DEFAULT_API_VERSION,
            user_agent: concat!("quill-sdk/", env!("CARGO_PKG_VERSION")).to_string(),
            connect_timeout: Duration::from_secs(5),
            attempt_timeout: Duration::from_secs(15),
            retry_policy: RetryPolicy::interactive(),
            shard: 0,
        }
    }
}

/// Bucket-gated HTTP request scheduler.
#[derive(Clone)]
pub struct RequestDispatcher {
    http: Client,
    token: Option<SecretString>,
    bot: bool,
    base_url: String,
    api_version: u8,
    user_agent: String,
    attempt_timeout: Duration,
    retry_policy: RetryPolicy,
    shard: u16,
    buckets: Arc<Mutex<HashMap<BucketKey, Bucket>>>,
}

impl RequestDispatcher {
    pub fn new(token: Option<SecretString>, bot: bool) -> Result<Self, RestError> {
        Self::with_options(token, bot, RequestDispatcherOptions::default())
    }

    pub fn with_options(
        token: Option<SecretString>,
        bot: bool,
        options: RequestDispatcherOptions,
    ) -> Result<Self, RestError> {
        let http = Client::builder()
            .connect_timeout(options.connect_timeout)
            .build()
            .map_err(RestError::Transport)?;

        Ok(Self {
            http,
            token,
            bot,
            base_url: options.base_url.trim_end_matches('/').to_string(),
            api_version: options.api_version,
            user_agent: options.user_agent,
            attempt_timeout: options.attempt_timeout,
            retry_policy: options.retry_policy,
            shard: options.shard,
            buckets: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Resolves which buckets a call must clear. Every authenticated call
    /// shares the global cap; specific routes stack a stricter bucket on top.
    pub fn route_buckets(method: Method, path: &str) -> Vec<BucketKey> {
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        let specific = match (method, segments.as_slice()) {
            (Method::Post, ["channels", id, "messages"]) => {
                BucketKey::ChannelSend((*id).to_string())
            }
            (Method::Patch, ["users", "@me"]) => BucketKey::ProfileUpdate,
            _ => BucketKey::Route(format!("{} {}", method.as_str(), route_tag(&segments))),
        };
        vec![BucketKey::Global, specific]
    }

    /// Dispatches a request: resolve buckets, queue behind all of them, then
    /// execute the HTTP call and decode the JSON response.
    pub async fn request(
        &self,
        method: Method,
        path: &str,
        options: RequestOptions,
    ) -> Result<Value, RestError> {
        let keys = Self::route_buckets(method, path);
        let (gate, opened) = AdmitGate::new(keys.len());
        for key in &keys {
            self.bucket_for(key)
                .enqueue(Arc::clone(&gate))
                .map_err(|_| RestError::QueueClosed)?;
        }
        opened.await.map_err(|_| RestError::QueueClosed)?;

        let url = format!("{}/v{}{}", self.base_url, self.api_version, path);
        debug!(
            event = "rest_request",
            method = method.as_str(),
            %url,
            buckets = ?keys.iter().map(ToString::to_string).collect::<Vec<_>>(),
        );

        let started = Instant::now();
        let policy = self.retry_policy.clone();
        let result = retry_async(
            &policy,
            |_| {
                let url = url.clone();
                let options = &options;
                async move { self.send_attempt(method, &url, options).await }
            },
            RestError::is_retryable,
        )
        .await;

        match result {
            Err(RestError::HttpStatus { status, body })
                if status == StatusCode::TOO_MANY_REQUESTS =>
            {
                Err(RestError::RateLimited {
                    retry_after_ms: parse_retry_after(&body),
                    buckets: keys.iter().map(ToString::to_string).collect(),
                    latency_ms: started.elapsed().as_millis() as u64,
                    shard: self.shard,
                })
            }
            other => other,
        }
    }

    /// Fetches the streaming endpoint URL advertised by the platform.
    pub async fn get_gateway(&self) -> Result<String, RestError> {
        let value = self
            .request(Method::Get, "/gateway", RequestOptions::authenticated())
            .await?;
        value
            .get("url")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| RestError::Parse("gateway response missing url".to_string()))
    }

    fn bucket_for(&self, key: &BucketKey) -> Bucket {
        let mut buckets = self.buckets.lock().unwrap_or_else(|err| err.into_inner());
        buckets
            .entry(key.clone())
            .or_insert_with(|| {
                let (limit, window) = key.config();
                Bucket::new(limit, window)
            })
            .clone()
    }

    async fn send_attempt(
        &self,
        method: Method,
        url: &str,
        options: &RequestOptions,
    ) -> Result<Value, RestError> {
        let mut builder = self
            .http
            .request(method.to_reqwest(), url)
            .timeout(self.attempt_timeout)
            .header("User-Agent", &self.user_agent);

        if options.auth {
            if let Some(token) = self.token.as_ref() {
                builder = builder.header("Authorization", self.auth_header(token));
            }
        }

        builder = match (&options.file, &options.body) {
            (Some(file), body) => {
                let mut form = multipart::Form::new().part(
                    "file",
                    multipart::Part::bytes(file.data.clone()).file_name(file.name.clone()),
                );
                if let Some(body) = body {
                    form = form.text("payload_json", body.to_string());
                }
                builder.multipart(form)
            }
            (None, Some(body)) => builder.json(body),
            (None, None) => builder,
        };

        let response = builder.send().await.map_err(RestError::Transport)?;
        let status = response.status();
        let body = response.text().await.map_err(RestError::Transport)?;

        if !status.is_success() {
            return Err(RestError::HttpStatus {
                status,
                body: summarize_error_body(&body),
            });
        }

        if body.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&body).map_err(|err| RestError::Parse(err.to_string()))
    }

    fn auth_header(&self, token: &SecretString) -> String {
        if self.bot {
            format!("Bot {}", token.expose_secret())
        } else {
            token.expose_secret().to_string()
        }
    }
}

/// Collapses trailing ids so `/channels/1/messages/2` and
/// `/channels/1/messages/3` share one bucket while different major resources
/// keep their own.
fn route_tag(segments: &[&str]) -> String {
    let mut tagged = Vec::with_capacity(segments.len());
    let mut kept_major_id = false;
    for segment in segments {
        if segment.chars().all(|c| c.is_ascii_digit()) && !segment.is_empty() {
            if kept_major_id {
                tagged.push(":id");
                continue;
            }
            kept_major_id = true;
        }
        tagged.push(segment);
    }
    format!("/{}", tagged.join("/"))
}

fn parse_retry_after(body: &str) -> Option<u64> {
    let value: Value = serde_json::from_str(body).ok()?;
    value.get("retry_after").and_then(Value::as_u64)
}

fn summarize_error_body(body: &str) -> String {
    #[derive(serde::Deserialize)]
    struct ErrorBody {
        #[serde(default)]
        error: Option<String>,
        #[serde(default)]
        message: Option<String>,
    }

    if let Ok(parsed) = serde_json::from_str::<ErrorBody>(body) {
        if let Some(message) = parsed.error.or(parsed.message) {
            return message;
        }
    }
    body.chars().take(ERROR_BODY_SNIPPET_LEN).collect()
}
