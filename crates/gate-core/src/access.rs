use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const COOKIE_NAME_HEADER: &str = "x-cookie-name";
pub const COOKIE_VALUE_HEADER: &str = "x-cookie-value";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessOutcome {
    pub access_status: bool,
    pub message: String,
}

impl AccessOutcome {
    fn denied() -> Self {
        Self {
            access_status: false,
            message: "Access denied".into(),
        }
    }

    fn server_error() -> Self {
        Self {
            access_status: false,
            message: "Access denied due to server error".into(),
        }
    }
}

/// Read access to the cookies of an inbound request.
pub trait CookieJar: Sync {
    fn get(&self, name: &str) -> Option<String>;
}

impl CookieJar for HashMap<String, String> {
    fn get(&self, name: &str) -> Option<String> {
        HashMap::get(self, name).cloned()
    }
}

impl CookieJar for BTreeMap<String, String> {
    fn get(&self, name: &str) -> Option<String> {
        BTreeMap::get(self, name).cloned()
    }
}

pub enum CookieSource<'a> {
    Jar(&'a dyn CookieJar),
    Raw(&'a str),
}

impl CookieSource<'_> {
    fn value(&self, name: &str) -> String {
        match self {
            CookieSource::Jar(jar) => jar.get(name).unwrap_or_default(),
            CookieSource::Raw(value) => value.to_string(),
        }
    }
}

/// How the cookie travels to the authorization backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CookieTransport {
    /// `Cookie: name=value`
    #[default]
    CookieHeader,
    /// `x-cookie-name` and `x-cookie-value`
    SplitHeaders,
}

impl CookieTransport {
    fn headers(self, name: &str, value: &str) -> Vec<(String, String)> {
        let mut headers = vec![("Content-Type".to_string(), "application/json".to_string())];
        match self {
            CookieTransport::CookieHeader => {
                headers.push(("Cookie".into(), format!("{name}={value}")));
            }
            CookieTransport::SplitHeaders => {
                headers.push((COOKIE_NAME_HEADER.into(), name.to_string()));
                headers.push((COOKIE_VALUE_HEADER.into(), value.to_string()));
            }
        }
        headers
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendReply {
    pub status: u16,
    pub body: String,
}

impl BackendReply {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Outbound GET to the authorization backend.
#[async_trait]
pub trait AuthTransport: Send + Sync {
    async fn get(&self, url: &str, headers: &[(String, String)]) -> anyhow::Result<BackendReply>;
}

pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("build http client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl AuthTransport for ReqwestTransport {
    async fn get(&self, url: &str, headers: &[(String, String)]) -> anyhow::Result<BackendReply> {
        let mut req = self.client.get(url);
        for (name, value) in headers {
            req = req.header(name.as_str(), value.as_str());
        }
        let res = req.send().await.context("send access request")?;
        let status = res.status().as_u16();
        let body = res.text().await.context("read access response")?;
        Ok(BackendReply { status, body })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BackendVerdict {
    #[serde(default)]
    access_status: Option<bool>,
    #[serde(default)]
    message: Option<String>,
}

/// Asks an authorization backend whether the session cookie grants access.
#[derive(Clone)]
pub struct AccessVerifier {
    transport: Arc<dyn AuthTransport>,
    backend_url: String,
    cookie_name: String,
    cookie_transport: CookieTransport,
}

impl AccessVerifier {
    pub fn new(
        transport: Arc<dyn AuthTransport>,
        backend_url: impl Into<String>,
        cookie_name: impl Into<String>,
        cookie_transport: CookieTransport,
    ) -> Self {
        Self {
            transport,
            backend_url: backend_url.into(),
            cookie_name: cookie_name.into(),
            cookie_transport,
        }
    }

    /// Never fails: transport errors and malformed replies deny access.
    pub async fn verify(&self, cookies: CookieSource<'_>) -> AccessOutcome {
        let value = cookies.value(&self.cookie_name);
        debug!(
            url = %self.backend_url,
            cookie = %self.cookie_name,
            present = !value.is_empty(),
            "verifying access"
        );

        match self.ask(&value).await {
            Ok(outcome) => {
                if !outcome.access_status {
                    info!(url = %self.backend_url, reason = %outcome.message, "access denied");
                }
                outcome
            }
            Err(err) => {
                let err = format!("{err:#}");
                warn!(url = %self.backend_url, %err, "access verification failed");
                AccessOutcome::server_error()
            }
        }
    }

    async fn ask(&self, value: &str) -> anyhow::Result<AccessOutcome> {
        let headers = self.cookie_transport.headers(&self.cookie_name, value);
        let reply = self.transport.get(&self.backend_url, &headers).await?;
        if !reply.is_success() {
            debug!(status = reply.status, "backend refused");
            return Ok(AccessOutcome::denied());
        }

        let verdict: BackendVerdict =
            serde_json::from_str(&reply.body).context("parse access response")?;
        let access_status = verdict.access_status.unwrap_or(false);
        let message = match verdict.message.filter(|m| !m.is_empty()) {
            Some(message) => message,
            None if access_status => "Access granted".into(),
            None => "Access denied".into(),
        };
        Ok(AccessOutcome {
            access_status,
            message,
        })
    }
}
