//! Minimal request/response seam over an HTTP client.
//!
//! The relay and telemetry clients speak through [`HttpTransport`] so the
//! protocol fallbacks can be driven by canned responses in tests.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub basic_auth: Option<(String, String)>,
    pub json_body: Option<Value>,
    pub timeout: Duration,
}

impl HttpRequest {
    pub fn get(url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            method: Method::Get,
            url: url.into(),
            headers: Vec::new(),
            basic_auth: None,
            json_body: None,
            timeout,
        }
    }

    pub fn post_json(url: impl Into<String>, body: Value, timeout: Duration) -> Self {
        Self {
            method: Method::Post,
            json_body: Some(body),
            ..Self::get(url, timeout)
        }
    }

    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push((name.to_string(), value.into()));
        self
    }

    pub fn basic_auth(mut self, user: &str, pass: &str) -> Self {
        self.basic_auth = Some((user.to_string(), pass.to_string()));
        self
    }

    pub fn header_value(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    pub status: u16,
    pub www_authenticate: Option<String>,
    pub body: String,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Flatten newlines and cut a response body down for log lines.
pub fn snippet(body: &str, max: usize) -> String {
    body.replace(['\n', '\r'], " ")
        .trim()
        .chars()
        .take(max)
        .collect()
}

#[async_trait]
pub trait HttpTransport: Send + Sync {
    /// Send one request. `Err` means the exchange never produced an HTTP
    /// status (timeout, refused connection, DNS, TLS).
    async fn send(&self, req: HttpRequest) -> Result<HttpResponse>;
}

// ---------------------------------------------------------------------------
// reqwest
// ---------------------------------------------------------------------------

pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    /// `accept_invalid_certs` is for LAN relays that serve self-signed
    /// certificates; the cloud transport keeps verification on.
    pub fn new(accept_invalid_certs: bool) -> Result<Self> {
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(accept_invalid_certs)
            .build()
            .context("failed to build http client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(&self, req: HttpRequest) -> Result<HttpResponse> {
        let mut builder = match req.method {
            Method::Get => self.client.get(&req.url),
            Method::Post => self.client.post(&req.url),
        }
        .timeout(req.timeout);

        for (name, value) in &req.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some((user, pass)) = &req.basic_auth {
            builder = builder.basic_auth(user, Some(pass));
        }
        if let Some(body) = &req.json_body {
            builder = builder.json(body);
        }

        let resp = builder
            .send()
            .await
            .with_context(|| format!("{} {} failed", req.method.as_str(), req.url))?;
        let status = resp.status().as_u16();
        let www_authenticate = resp
            .headers()
            .get(reqwest::header::WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = resp.text().await.unwrap_or_default();

        Ok(HttpResponse {
            status,
            www_authenticate,
            body,
        })
    }
}

// ---------------------------------------------------------------------------
// Scripted transport for tests
// ---------------------------------------------------------------------------

#[cfg(test)]
pub(crate) mod fake {
    use super::*;
    use std::sync::Mutex;

    type Responder = dyn Fn(&HttpRequest) -> Result<HttpResponse> + Send + Sync;

    /// Answers every request through a closure and records what was sent.
    pub(crate) struct ScriptedTransport {
        responder: Box<Responder>,
        pub(crate) requests: Mutex<Vec<HttpRequest>>,
    }

    impl ScriptedTransport {
        pub(crate) fn new(
            responder: impl Fn(&HttpRequest) -> Result<HttpResponse> + Send + Sync + 'static,
        ) -> Self {
            Self {
                responder: Box::new(responder),
                requests: Mutex::new(Vec::new()),
            }
        }

        pub(crate) fn sent(&self) -> Vec<HttpRequest> {
            self.requests.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl HttpTransport for ScriptedTransport {
        async fn send(&self, req: HttpRequest) -> Result<HttpResponse> {
            self.requests.lock().unwrap().push(req.clone());
            (self.responder)(&req)
        }
    }

    pub(crate) fn status(code: u16, body: &str) -> Result<HttpResponse> {
        Ok(HttpResponse {
            status: code,
            www_authenticate: None,
            body: body.to_string(),
        })
    }

    pub(crate) fn challenge(header: &str) -> Result<HttpResponse> {
        Ok(HttpResponse {
            status: 401,
            www_authenticate: Some(header.to_string()),
            body: "unauthorized".to_string(),
        })
    }
}
