use std::time::Duration;

use rand::Rng;
use reqwest::header::{
    HeaderMap, HeaderValue, CONTENT_ENCODING, CONTENT_TYPE, ETAG, IF_NONE_MATCH,
};
use reqwest::Method;
use skiff_domain::{Identity, Secret};
use tracing::{debug, warn};

use crate::error::HttpError;

#[derive(Debug, Clone)]
pub struct CloudClientConfig {
    /// Cloud base URL, no trailing slash.
    pub base_url: String,
    /// Bearer credential; injected into each request, never logged.
    pub api_key: Option<Secret>,
    /// Extra PEM roots trusted for this endpoint.
    pub ca_chain: Option<String>,
    /// When false, certificate verification is disabled (lab setups).
    pub verify: bool,
    pub timeout: Duration,
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
}

impl Default for CloudClientConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            api_key: None,
            ca_chain: None,
            verify: true,
            timeout: Duration::from_secs(15),
            max_attempts: 4,
            backoff_base: Duration::from_millis(250),
            backoff_cap: Duration::from_secs(10),
        }
    }
}

impl CloudClientConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Default::default()
        }
    }

    /// Client configuration as granted at registration: endpoint, key and
    /// TLS trust all come from the identity row.
    pub fn from_identity(identity: &Identity) -> Self {
        let (ca_chain, verify) = identity
            .api_tls
            .as_ref()
            .map(|tls| (tls.ca_chain.clone(), tls.verify))
            .unwrap_or((None, true));
        Self {
            base_url: identity.api_endpoint.trim_end_matches('/').to_string(),
            api_key: identity.device_api_key.clone(),
            ca_chain,
            verify,
            ..Default::default()
        }
    }
}

/// What a request produced. Non-2xx statuses are data, not errors; callers
/// interpret them. Only connection-level failures become [`HttpError`].
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub etag: Option<String>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn json(&self) -> Result<serde_json::Value, HttpError> {
        Ok(serde_json::from_slice(&self.body)?)
    }
}

pub enum Payload {
    Json(serde_json::Value),
    Bytes {
        body: Vec<u8>,
        content_type: &'static str,
        gzip: bool,
    },
}

/// Retry/backoff-aware client for the cloud API.
///
/// Connection errors and 5xx responses are retried for idempotent methods
/// only, with `min(base · 2ⁿ, cap)` backoff plus jitter. POST/PATCH are never
/// retried automatically.
pub struct CloudClient {
    http: reqwest::Client,
    cfg: CloudClientConfig,
}

impl CloudClient {
    pub fn new(cfg: CloudClientConfig) -> Result<Self, HttpError> {
        if cfg.base_url.is_empty() {
            return Err(HttpError::InvalidConfig("empty base URL".into()));
        }
        let mut builder = reqwest::Client::builder()
            .timeout(cfg.timeout)
            .user_agent(concat!("skiff/", env!("CARGO_PKG_VERSION")));
        if let Some(pem) = &cfg.ca_chain {
            let certs = reqwest::Certificate::from_pem_bundle(pem.as_bytes())
                .map_err(|e| HttpError::InvalidConfig(format!("bad CA chain: {e}")))?;
            for cert in certs {
                builder = builder.add_root_certificate(cert);
            }
        }
        if !cfg.verify {
            builder = builder.danger_accept_invalid_certs(true);
        }
        let http = builder
            .build()
            .map_err(|e| HttpError::InvalidConfig(e.to_string()))?;
        Ok(Self { http, cfg })
    }

    pub fn base_url(&self) -> &str {
        &self.cfg.base_url
    }

    /// GET with entity-tag support: sends `If-None-Match` when a previous tag
    /// is known and surfaces the response `ETag`. 304 comes back as a plain
    /// response for the caller to short-circuit on.
    pub async fn get_with_etag(
        &self,
        path: &str,
        last_etag: Option<&str>,
    ) -> Result<HttpResponse, HttpError> {
        let mut headers = HeaderMap::new();
        if let Some(tag) = last_etag {
            if let Ok(v) = HeaderValue::from_str(tag) {
                headers.insert(IF_NONE_MATCH, v);
            }
        }
        self.request(Method::GET, path, headers, None, None).await
    }

    pub async fn get(&self, path: &str) -> Result<HttpResponse, HttpError> {
        self.request(Method::GET, path, HeaderMap::new(), None, None).await
    }

    pub async fn post_json(
        &self,
        path: &str,
        body: &serde_json::Value,
    ) -> Result<HttpResponse, HttpError> {
        self.request(
            Method::POST,
            path,
            HeaderMap::new(),
            Some(Payload::Json(body.clone())),
            None,
        )
        .await
    }

    pub async fn patch_json(
        &self,
        path: &str,
        body: &serde_json::Value,
    ) -> Result<HttpResponse, HttpError> {
        self.request(
            Method::PATCH,
            path,
            HeaderMap::new(),
            Some(Payload::Json(body.clone())),
            None,
        )
        .await
    }

    /// Upload a newline-delimited JSON document, optionally gzipped.
    pub async fn post_ndjson(
        &self,
        path: &str,
        body: Vec<u8>,
        gzip: bool,
    ) -> Result<HttpResponse, HttpError> {
        self.request(
            Method::POST,
            path,
            HeaderMap::new(),
            Some(Payload::Bytes {
                body,
                content_type: "application/x-ndjson",
                gzip,
            }),
            None,
        )
        .await
    }

    /// Core request with an optional aggregate deadline across all attempts.
    pub async fn request(
        &self,
        method: Method,
        path: &str,
        headers: HeaderMap,
        body: Option<Payload>,
        deadline: Option<Duration>,
    ) -> Result<HttpResponse, HttpError> {
        match deadline {
            Some(limit) => tokio::time::timeout(limit, self.request_inner(method, path, headers, body))
                .await
                .map_err(|_| HttpError::DeadlineExceeded {
                    attempts: self.cfg.max_attempts,
                })?,
            None => self.request_inner(method, path, headers, body).await,
        }
    }

    async fn request_inner(
        &self,
        method: Method,
        path: &str,
        headers: HeaderMap,
        body: Option<Payload>,
    ) -> Result<HttpResponse, HttpError> {
        let retryable = is_idempotent(&method);
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let result = self.send_once(&method, path, &headers, body.as_ref()).await;
            match result {
                Ok(resp) => {
                    let status = resp.status();
                    if retryable && status.is_server_error() && attempt < self.cfg.max_attempts {
                        warn!(%method, path, status = status.as_u16(), attempt, "server error, retrying");
                        self.backoff(attempt).await;
                        continue;
                    }
                    let etag = resp
                        .headers()
                        .get(ETAG)
                        .and_then(|v| v.to_str().ok())
                        .map(String::from);
                    let bytes = resp.bytes().await.map_err(HttpError::Network)?;
                    return Ok(HttpResponse {
                        status: status.as_u16(),
                        etag,
                        body: bytes.to_vec(),
                    });
                }
                Err(e) if retryable && is_connection_error(&e) && attempt < self.cfg.max_attempts => {
                    warn!(%method, path, attempt, error = %e, "connection error, retrying");
                    self.backoff(attempt).await;
                }
                Err(e) => return Err(HttpError::Network(e)),
            }
        }
    }

    async fn send_once(
        &self,
        method: &Method,
        path: &str,
        headers: &HeaderMap,
        body: Option<&Payload>,
    ) -> Result<reqwest::Response, reqwest::Error> {
        let url = format!("{}{}", self.cfg.base_url, path);
        let mut req = self.http.request(method.clone(), &url);
        if let Some(key) = &self.cfg.api_key {
            req = req.bearer_auth(key.expose());
        }
        for (name, value) in headers {
            req = req.header(name, value);
        }
        match body {
            Some(Payload::Json(v)) => req = req.json(v),
            Some(Payload::Bytes {
                body,
                content_type,
                gzip,
            }) => {
                req = req.header(CONTENT_TYPE, *content_type);
                if *gzip {
                    req = req.header(CONTENT_ENCODING, "gzip");
                }
                req = req.body(body.clone());
            }
            None => {}
        }
        debug!(%method, path, "cloud request");
        req.send().await
    }

    async fn backoff(&self, attempt: u32) {
        let exp = self
            .cfg
            .backoff_base
            .saturating_mul(1u32 << (attempt - 1).min(16));
        let capped = exp.min(self.cfg.backoff_cap);
        // jitter: up to +50%
        let jitter_ms = rand::thread_rng().gen_range(0..=capped.as_millis() as u64 / 2);
        tokio::time::sleep(capped + Duration::from_millis(jitter_ms)).await;
    }
}

fn is_idempotent(method: &Method) -> bool {
    matches!(
        *method,
        Method::GET | Method::HEAD | Method::PUT | Method::DELETE
    )
}

fn is_connection_error(e: &reqwest::Error) -> bool {
    e.is_connect() || e.is_timeout() || e.is_request()
}
