//! HTTP Digest authentication (RFC 7616 subset) for relay firmware that
//! answers 401 with a `WWW-Authenticate: Digest ...` challenge.

use md5::Md5;
use sha2::{Digest, Sha256};

/// The fields of a digest challenge that the response depends on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestChallenge {
    pub realm: String,
    pub nonce: String,
    pub qop: String,
    pub algorithm: String,
    pub opaque: String,
}

impl DigestChallenge {
    /// Parse a `WWW-Authenticate` header value. Returns `None` when the
    /// challenge carries no nonce, since no response can be computed then.
    pub fn parse(header: &str) -> Option<Self> {
        let params = parse_params(header);
        let get = |key: &str| {
            params
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(key))
                .map(|(_, v)| v.clone())
        };

        let nonce = get("nonce").filter(|n| !n.is_empty())?;
        let qop = get("qop")
            .and_then(|q| q.split(',').next().map(|s| s.trim().to_string()))
            .filter(|q| !q.is_empty())
            .unwrap_or_else(|| "auth".to_string());
        let algorithm = get("algorithm")
            .filter(|a| !a.is_empty())
            .unwrap_or_else(|| "SHA-256".to_string());

        Some(Self {
            realm: get("realm").unwrap_or_default(),
            nonce,
            qop,
            algorithm,
            opaque: get("opaque").unwrap_or_default(),
        })
    }

    /// Build the `Authorization` header value for `method` on `url`.
    ///
    /// The digest URI is the path plus query string of `url`.
    pub fn authorization(
        &self,
        username: &str,
        password: &str,
        method: &str,
        url: &str,
        nc: u32,
        cnonce: &str,
    ) -> String {
        let uri = request_uri(url);
        let nc_str = format!("{nc:08x}");
        let response = self.response(username, password, method, &uri, &nc_str, cnonce);

        let mut parts = vec![
            format!("Digest username=\"{}\"", unquote(username)),
            format!("realm=\"{}\"", unquote(&self.realm)),
            format!("nonce=\"{}\"", unquote(&self.nonce)),
            format!("uri=\"{}\"", unquote(&uri)),
            format!("response=\"{response}\""),
            format!("algorithm={}", self.algorithm),
            format!("qop={}", self.qop),
            format!("nc={nc_str}"),
            format!("cnonce=\"{}\"", unquote(cnonce)),
        ];
        if !self.opaque.is_empty() {
            parts.push(format!("opaque=\"{}\"", unquote(&self.opaque)));
        }
        parts.join(", ")
    }

    /// `H(H(user:realm:pass):nonce:nc:cnonce:qop:H(method:uri))`
    pub fn response(
        &self,
        username: &str,
        password: &str,
        method: &str,
        uri: &str,
        nc: &str,
        cnonce: &str,
    ) -> String {
        let ha1 = hash_hex(
            &self.algorithm,
            format!("{username}:{}:{password}", self.realm).as_bytes(),
        );
        let ha2 = hash_hex(&self.algorithm, format!("{method}:{uri}").as_bytes());
        hash_hex(
            &self.algorithm,
            format!("{ha1}:{}:{nc}:{cnonce}:{}:{ha2}", self.nonce, self.qop).as_bytes(),
        )
    }
}

/// Hex digest with SHA-256 for `SHA-256`/`SHA256`, MD5 for anything else.
pub fn hash_hex(algorithm: &str, data: &[u8]) -> String {
    let algo = algorithm.to_ascii_uppercase();
    if algo == "SHA-256" || algo == "SHA256" {
        hex::encode(Sha256::digest(data))
    } else {
        hex::encode(Md5::digest(data))
    }
}

/// Fresh client nonce: MD5 over 16 random bytes.
pub fn client_nonce() -> String {
    let mut bytes = [0u8; 16];
    for b in bytes.iter_mut() {
        *b = fastrand::u8(..);
    }
    hash_hex("MD5", &bytes)
}

fn request_uri(url: &str) -> String {
    match reqwest::Url::parse(url) {
        Ok(u) => match u.query() {
            Some(q) => format!("{}?{q}", u.path()),
            None => u.path().to_string(),
        },
        Err(_) => url.to_string(),
    }
}

fn unquote(s: &str) -> String {
    s.replace('"', "")
}

/// Split `key=value, key="quoted, value"` pairs after an optional `Digest`
/// scheme prefix.
fn parse_params(header: &str) -> Vec<(String, String)> {
    let mut s = header.trim();
    if s.get(..7).is_some_and(|p| p.eq_ignore_ascii_case("digest ")) {
        s = &s[7..];
    }

    let mut out = Vec::new();
    let mut rest = s;
    loop {
        rest = rest.trim_start_matches(|c: char| c == ',' || c.is_whitespace());
        if rest.is_empty() {
            break;
        }

        let key_len = rest
            .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
            .unwrap_or(rest.len());
        let key = &rest[..key_len];
        rest = &rest[key_len..];

        if key.is_empty() || !rest.starts_with('=') {
            // Not a key=value pair; skip to the next separator.
            match rest.find(',') {
                Some(i) => {
                    rest = &rest[i + 1..];
                    continue;
                }
                None => break,
            }
        }
        rest = &rest[1..];

        let value = if let Some(quoted) = rest.strip_prefix('"') {
            let end = quoted.find('"').unwrap_or(quoted.len());
            let v = &quoted[..end];
            rest = quoted.get(end + 1..).unwrap_or("");
            v
        } else {
            let end = rest.find(',').unwrap_or(rest.len());
            let v = &rest[..end];
            rest = &rest[end..];
            v
        };
        out.push((key.to_string(), value.trim().to_string()));
    }
    out
}
