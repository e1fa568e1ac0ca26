//! Execution plane boundary and its HTTP client.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::config::PlaneConfig;
use crate::job::{Jid, PlaneResult};

/// Remote system that runs jobs asynchronously and reports per-target
/// results later.
#[async_trait]
pub trait ExecutionPlane: Send + Sync {
    /// Starts a job and returns its jid without waiting for it.
    async fn dispatch(&self, request: &DispatchRequest) -> anyhow::Result<Jid>;

    /// Results reported so far. `None` while the job is still running.
    async fn lookup(&self, jid: &Jid) -> anyhow::Result<Option<PlaneResult>>;
}

/// A fire-and-forget job for a set of targets.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DispatchRequest {
    /// Target expression understood by the plane.
    pub target: String,
    pub function: String,
    #[serde(default)]
    pub args: Vec<Value>,
}

impl DispatchRequest {
    pub fn new(target: impl Into<String>, function: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            function: function.into(),
            args: Vec::new(),
        }
    }

    pub fn with_arg(mut self, arg: impl Into<Value>) -> Self {
        self.args.push(arg.into());
        self
    }
}

#[derive(Debug, Error)]
pub enum PlaneError {
    #[error("execution plane request failed: {0}")]
    Request(String),

    #[error("execution plane rejected credentials")]
    Unauthorized,

    #[error("execution plane returned {status}: {message}")]
    Status { status: u16, message: String },

    #[error("invalid execution plane response: {0}")]
    Decode(String),
}

impl From<reqwest::Error> for PlaneError {
    fn from(err: reqwest::Error) -> Self {
        PlaneError::Request(err.to_string())
    }
}

#[derive(Clone, Debug)]
struct Token {
    value: String,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    #[serde(rename = "return")]
    items: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct LoginReply {
    token: String,
    /// Unix timestamp in seconds.
    expire: f64,
}

#[derive(Debug, Deserialize)]
struct DispatchReply {
    jid: String,
}

/// HTTP execution plane client with a cached bearer token.
///
/// The token is refreshed `token_refresh_margin_secs` before it expires. A
/// 401 on a request triggers exactly one re-login and retry.
pub struct HttpExecutionPlane {
    config: PlaneConfig,
    client: reqwest::Client,
    token: Mutex<Option<Token>>,
}

impl std::fmt::Debug for HttpExecutionPlane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpExecutionPlane")
            .field("base_url", &self.config.base_url)
            .field("username", &self.config.username)
            .finish()
    }
}

impl HttpExecutionPlane {
    pub fn new(config: PlaneConfig) -> Result<Self, PlaneError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()?;
        Ok(Self {
            config,
            client,
            token: Mutex::new(None),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    fn refresh_margin(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.config.token_refresh_margin_secs as i64)
    }

    async fn login(&self) -> Result<Token, PlaneError> {
        let response = self
            .client
            .post(self.url("/login"))
            .json(&serde_json::json!({
                "username": self.config.username,
                "password": self.config.password,
                "eauth": self.config.eauth,
            }))
            .send()
            .await?;
        match response.status() {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                return Err(PlaneError::Unauthorized);
            }
            status if !status.is_success() => {
                return Err(status_error(status, response).await);
            }
            _ => {}
        }

        let reply: Envelope<LoginReply> = response
            .json()
            .await
            .map_err(|e| PlaneError::Decode(e.to_string()))?;
        let login = reply
            .items
            .into_iter()
            .next()
            .ok_or_else(|| PlaneError::Decode("login reply has no token".into()))?;
        let expires_at = Utc
            .timestamp_opt(login.expire as i64, 0)
            .single()
            .ok_or_else(|| PlaneError::Decode(format!("bad token expiry {}", login.expire)))?;
        tracing::debug!(expires_at = %expires_at, "execution plane token refreshed");
        Ok(Token {
            value: login.token,
            expires_at,
        })
    }

    /// Current token, logging in when absent or close to expiry.
    async fn token(&self) -> Result<String, PlaneError> {
        let mut cached = self.token.lock().await;
        let fresh_until = Utc::now() + self.refresh_margin();
        if let Some(token) = cached.as_ref().filter(|t| t.expires_at > fresh_until) {
            return Ok(token.value.clone());
        }
        let token = self.login().await?;
        let value = token.value.clone();
        *cached = Some(token);
        Ok(value)
    }

    /// Drops the cached token if it is still the one the plane rejected. A
    /// token another caller already refreshed is kept.
    async fn invalidate(&self, rejected: &str) {
        let mut cached = self.token.lock().await;
        if cached.as_ref().is_some_and(|t| t.value == rejected) {
            *cached = None;
        }
    }

    /// Sends an authenticated request built by `build`, re-authenticating
    /// once on 401.
    async fn send_authed<F>(&self, build: F) -> Result<reqwest::Response, PlaneError>
    where
        F: Fn(&reqwest::Client) -> reqwest::RequestBuilder,
    {
        let mut reauthenticated = false;
        loop {
            let token = self.token().await?;
            let response = build(&self.client)
                .header("X-Auth-Token", &token)
                .send()
                .await?;
            if response.status() != StatusCode::UNAUTHORIZED {
                return Ok(response);
            }
            if reauthenticated {
                return Err(PlaneError::Unauthorized);
            }
            tracing::info!("execution plane token rejected, re-authenticating");
            self.invalidate(&token).await;
            reauthenticated = true;
        }
    }

    pub async fn try_dispatch(&self, request: &DispatchRequest) -> Result<Jid, PlaneError> {
        let body = serde_json::json!({
            "client": "local_async",
            "tgt": request.target,
            "fun": request.function,
            "arg": request.args,
        });
        let response = self
            .send_authed(|client| client.post(self.url("/")).json(&body))
            .await?;
        if !response.status().is_success() {
            return Err(status_error(response.status(), response).await);
        }
        let reply: Envelope<DispatchReply> = response
            .json()
            .await
            .map_err(|e| PlaneError::Decode(e.to_string()))?;
        reply
            .items
            .into_iter()
            .next()
            .map(|r| Jid::new(r.jid))
            .ok_or_else(|| PlaneError::Decode("dispatch reply has no jid".into()))
    }

    pub async fn try_lookup(&self, jid: &Jid) -> Result<Option<PlaneResult>, PlaneError> {
        let path = format!("/jobs/{jid}");
        let response = self
            .send_authed(|client| client.get(self.url(&path)))
            .await?;
        match response.status() {
            StatusCode::NOT_FOUND => return Ok(None),
            status if !status.is_success() => {
                return Err(status_error(status, response).await);
            }
            _ => {}
        }
        let reply: Envelope<PlaneResult> = response
            .json()
            .await
            .map_err(|e| PlaneError::Decode(e.to_string()))?;
        Ok(reply.items.into_iter().next().filter(|r| !r.is_empty()))
    }
}

#[async_trait]
impl ExecutionPlane for HttpExecutionPlane {
    async fn dispatch(&self, request: &DispatchRequest) -> anyhow::Result<Jid> {
        Ok(self.try_dispatch(request).await?)
    }

    async fn lookup(&self, jid: &Jid) -> anyhow::Result<Option<PlaneResult>> {
        Ok(self.try_lookup(jid).await?)
    }
}

async fn status_error(status: StatusCode, response: reqwest::Response) -> PlaneError {
    let body = response.bytes().await.unwrap_or_default();
    let message = serde_json::from_slice::<Value>(&body)
        .ok()
        .and_then(|value| {
            value
                .get("message")
                .and_then(|v| v.as_str())
                .map(str::to_string)
        })
        .unwrap_or_else(|| String::from_utf8_lossy(&body).to_string());
    PlaneError::Status {
        status: status.as_u16(),
        message,
    }
}
