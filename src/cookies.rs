//! Cookie parsing, serialization, and HMAC-SHA256 signing.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use sha2::{Digest, Sha256};
use std::collections::HashMap;

const SHA256_BLOCK: usize = 64;

/// `SameSite` attribute values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SameSite {
    Strict,
    Lax,
    None,
}

impl SameSite {
    fn as_str(self) -> &'static str {
        match self {
            Self::Strict => "Strict",
            Self::Lax => "Lax",
            Self::None => "None",
        }
    }
}

/// Attributes serialized into a `Set-Cookie` header.
#[derive(Debug, Clone, Default)]
pub struct CookieOptions {
    pub domain: Option<String>,
    pub path: Option<String>,
    /// Lifetime in seconds; `Some(0)` expires the cookie immediately.
    pub max_age: Option<i64>,
    /// Pre-formatted HTTP date, passed through verbatim.
    pub expires: Option<String>,
    pub secure: bool,
    pub http_only: bool,
    pub same_site: Option<SameSite>,
}

/// Parses a `Cookie` request header into name/value pairs.
#[must_use]
pub fn parse(header: &str) -> HashMap<String, String> {
    let mut out = HashMap::new();
    for pair in header.split(';') {
        if let Some((name, value)) = pair.split_once('=') {
            let value = value.trim().trim_matches('"');
            out.insert(name.trim().to_string(), value.to_string());
        }
    }
    out
}

/// Serializes one cookie into a `Set-Cookie` header value.
#[must_use]
pub fn serialize(name: &str, value: &str, options: &CookieOptions) -> String {
    let mut out = format!("{name}={value}");
    if let Some(domain) = &options.domain {
        out.push_str("; Domain=");
        out.push_str(domain);
    }
    let path = options.path.as_deref().unwrap_or("/");
    out.push_str("; Path=");
    out.push_str(path);
    if let Some(max_age) = options.max_age {
        out.push_str(&format!("; Max-Age={max_age}"));
    }
    if let Some(expires) = &options.expires {
        out.push_str("; Expires=");
        out.push_str(expires);
    }
    if options.secure {
        out.push_str("; Secure");
    }
    if options.http_only {
        out.push_str("; HttpOnly");
    }
    if let Some(same_site) = options.same_site {
        out.push_str("; SameSite=");
        out.push_str(same_site.as_str());
    }
    out
}

// HMAC-SHA256 over the raw sha2 primitive (RFC 2104 ipad/opad schedule).
fn hmac_sha256(secret: &[u8], message: &[u8]) -> [u8; 32] {
    let mut key = [0u8; SHA256_BLOCK];
    if secret.len() > SHA256_BLOCK {
        key[..32].copy_from_slice(&Sha256::digest(secret));
    } else {
        key[..secret.len()].copy_from_slice(secret);
    }

    let mut inner = Sha256::new();
    let ipad: Vec<u8> = key.iter().map(|b| b ^ 0x36).collect();
    inner.update(&ipad);
    inner.update(message);
    let inner_hash = inner.finalize();

    let mut outer = Sha256::new();
    let opad: Vec<u8> = key.iter().map(|b| b ^ 0x5c).collect();
    outer.update(&opad);
    outer.update(inner_hash);
    outer.finalize().into()
}

/// Appends an HMAC-SHA256 signature to a cookie value: `value.signature`.
#[must_use]
pub fn sign(value: &str, secret: &str) -> String {
    let tag = hmac_sha256(secret.as_bytes(), value.as_bytes());
    format!("{value}.{}", URL_SAFE_NO_PAD.encode(tag))
}

/// Verifies and strips the signature from a signed cookie value.
///
/// Returns `None` when the value carries no signature or the signature does
/// not verify against `secret`.
#[must_use]
pub fn unsign(signed: &str, secret: &str) -> Option<String> {
    let (value, tag) = signed.rsplit_once('.')?;
    let expected = URL_SAFE_NO_PAD.encode(hmac_sha256(secret.as_bytes(), value.as_bytes()));
    // Compare without early exit on length-equal inputs.
    if tag.len() == expected.len()
        && tag
            .bytes()
            .zip(expected.bytes())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
    {
        Some(value.to_string())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_cookie_header() {
        let cookies = parse("session=abc123; theme=\"dark\"; flag=1");
        assert_eq!(cookies.get("session").map(String::as_str), Some("abc123"));
        assert_eq!(cookies.get("theme").map(String::as_str), Some("dark"));
        assert_eq!(cookies.len(), 3);
    }

    #[test]
    fn serializes_attributes() {
        let options = CookieOptions {
            domain: Some("example.com".into()),
            max_age: Some(3600),
            secure: true,
            http_only: true,
            same_site: Some(SameSite::Lax),
            ..CookieOptions::default()
        };
        let header = serialize("session", "abc", &options);
        assert_eq!(
            header,
            "session=abc; Domain=example.com; Path=/; Max-Age=3600; Secure; HttpOnly; SameSite=Lax"
        );
    }

    #[test]
    fn sign_round_trip() {
        let signed = sign("user42", "hunter2");
        assert_eq!(unsign(&signed, "hunter2").as_deref(), Some("user42"));
    }

    #[test]
    fn tampered_value_rejected() {
        let signed = sign("user42", "hunter2");
        let tampered = signed.replacen("user42", "user43", 1);
        assert_eq!(unsign(&tampered, "hunter2"), None);
        assert_eq!(unsign(&signed, "wrong-secret"), None);
        assert_eq!(unsign("no-signature", "hunter2"), None);
    }
}
