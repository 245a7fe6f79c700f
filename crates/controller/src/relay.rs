//! Relay control over HTTP. Tries the RPC endpoint (query-string GET, then
//! JSON POST) and finally the legacy REST endpoint, answering Digest
//! challenges along the way.

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::digest::{client_nonce, DigestChallenge};
use crate::http::{snippet, HttpRequest, HttpTransport};

const COMMAND_TIMEOUT: Duration = Duration::from_secs(5);
const BODY_SNIPPET: usize = 160;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub user: String,
    pub password: String,
}

impl Credentials {
    pub fn new(user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            password: password.into(),
        }
    }

    fn is_set(&self) -> bool {
        !self.user.is_empty() && !self.password.is_empty()
    }
}

/// How a single attempt ended.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Attempt {
    Accepted,
    /// 401 that could not be answered. Ends the whole command.
    Unauthorized(String),
    /// Transport error or any other status. Move on to the next form.
    Failed { status: u16, detail: String },
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct RelayClient {
    transport: Arc<dyn HttpTransport>,
}

impl RelayClient {
    pub fn new(transport: Arc<dyn HttpTransport>) -> Self {
        Self { transport }
    }

    /// Switch relay `relay_id` on `host`. Returns `true` only when one of
    /// the command forms was answered with a 2xx.
    pub async fn set_switch(&self, host: &str, relay_id: u32, on: bool, creds: &Credentials) -> bool {
        let Some(base) = normalize_host_url(host) else {
            debug!(host, "relay: empty host, nothing to switch");
            return false;
        };

        let attempts = [
            (
                "rpc get",
                HttpRequest::get(
                    format!("{base}/rpc/Switch.Set?id={relay_id}&on={on}"),
                    COMMAND_TIMEOUT,
                ),
            ),
            (
                "rpc post",
                HttpRequest::post_json(
                    format!("{base}/rpc/Switch.Set"),
                    json!({ "id": relay_id, "on": on }),
                    COMMAND_TIMEOUT,
                ),
            ),
            (
                "legacy get",
                HttpRequest::get(
                    format!(
                        "{base}/relay/{relay_id}?turn={}",
                        if on { "on" } else { "off" }
                    ),
                    COMMAND_TIMEOUT,
                ),
            ),
        ];

        for (form, req) in attempts {
            let url = req.url.clone();
            match self.send_with_auth(req, creds).await {
                Attempt::Accepted => {
                    debug!(host = %base, relay_id, on, form, "relay: switched");
                    return true;
                }
                Attempt::Unauthorized(body) => {
                    debug!(url = %url, form, body = %body, "relay: unauthorized, giving up");
                    return false;
                }
                Attempt::Failed { status, detail } => {
                    debug!(url = %url, form, status, body = %detail, "relay: command failed");
                }
            }
        }

        debug!(host = %base, relay_id, on, "relay: every command form failed");
        false
    }

    /// Send `req`; on a 401 with credentials available, answer the Digest
    /// challenge and send the same request once more.
    async fn send_with_auth(&self, req: HttpRequest, creds: &Credentials) -> Attempt {
        let resp = match self.transport.send(req.clone()).await {
            Ok(r) => r,
            Err(e) => {
                return Attempt::Failed {
                    status: 0,
                    detail: format!("{e:#}"),
                }
            }
        };
        if resp.is_success() {
            return Attempt::Accepted;
        }
        if resp.status != 401 {
            return Attempt::Failed {
                status: resp.status,
                detail: snippet(&resp.body, BODY_SNIPPET),
            };
        }
        if !creds.is_set() {
            return Attempt::Unauthorized(snippet(&resp.body, BODY_SNIPPET));
        }

        let Some(challenge) = resp.www_authenticate.as_deref().and_then(DigestChallenge::parse)
        else {
            return Attempt::Unauthorized(snippet(&resp.body, BODY_SNIPPET));
        };

        let auth = challenge.authorization(
            &creds.user,
            &creds.password,
            req.method.as_str(),
            &req.url,
            1,
            &client_nonce(),
        );
        match self.transport.send(req.header("Authorization", auth)).await {
            Ok(r) if r.is_success() => Attempt::Accepted,
            Ok(r) if r.status == 401 => Attempt::Unauthorized(snippet(&r.body, BODY_SNIPPET)),
            Ok(r) => Attempt::Failed {
                status: r.status,
                detail: snippet(&r.body, BODY_SNIPPET),
            },
            Err(e) => Attempt::Failed {
                status: 0,
                detail: format!("{e:#}"),
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Turn a bare host or IP into a base URL without trailing slash.
///
/// Bare hosts get `http://`; an explicit `http://...:443` is rewritten to
/// `https://` without the port.
pub fn normalize_host_url(host: &str) -> Option<String> {
    let mut h = host.trim().to_string();
    if h.is_empty() {
        return None;
    }
    if h.starts_with("http://") && h.contains(":443") {
        h = h.replacen("http://", "https://", 1).replacen(":443", "", 1);
    }
    if !(h.starts_with("http://") || h.starts_with("https://")) {
        h = format!("http://{h}");
    }
    Some(h.trim_end_matches('/').to_string())
}

// ===========================================================================
// Tests
// ===========================================================================
