//! The webhook adapter: a reference implementation of the `RelayAdapter`
//! contract. Inbound verification and outbound delivery both sign
//! `{timestamp}.{body}` with HMAC-SHA256, adding the inbound half (nonce
//! replay cache, timestamp window, constant-time comparison with
//! dummy-compare on length mismatch) that a pure-outbound notifier never
//! needed.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Reasons an inbound webhook request is rejected. All map to HTTP 401.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookError {
    InvalidTimestamp,
    TimestampOutOfWindow,
    ReplayedNonce,
    InvalidSignature,
    MalformedBody(String),
}

impl std::fmt::Display for WebhookError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WebhookError::InvalidTimestamp => write!(f, "invalid timestamp header"),
            WebhookError::TimestampOutOfWindow => write!(f, "timestamp outside replay window"),
            WebhookError::ReplayedNonce => write!(f, "nonce already seen (replay)"),
            WebhookError::InvalidSignature => write!(f, "signature verification failed"),
            WebhookError::MalformedBody(s) => write!(f, "malformed body: {s}"),
        }
    }
}

impl std::error::Error for WebhookError {}

impl From<WebhookError> for relay_types::RelayError {
    fn from(e: WebhookError) -> Self {
        relay_types::RelayError::Malformed(e.to_string())
    }
}

/// Verification configuration for one webhook-adapter instance.
#[derive(Debug, Clone)]
pub struct InboundConfig {
    pub secret: String,
    /// Accepted during a key-rotation window; verified only if the primary
    /// secret doesn't match.
    pub previous_secret: Option<String>,
    pub timestamp_window_secs: i64,
    pub nonce_ttl_secs: i64,
}

impl InboundConfig {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
            previous_secret: None,
            timestamp_window_secs: 300,
            nonce_ttl_secs: 24 * 60 * 60,
        }
    }
}

/// In-memory nonce replay cache. A single writer is fine; readers and
/// writers share one mutex since the critical section is a hash-map probe.
#[derive(Default)]
pub struct NonceCache {
    seen: Mutex<HashMap<String, i64>>,
}

impl NonceCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn contains(&self, nonce: &str) -> bool {
        self.seen.lock().expect("nonce cache mutex poisoned").contains_key(nonce)
    }

    fn insert(&self, nonce: &str, now_secs: i64) {
        self.seen
            .lock()
            .expect("nonce cache mutex poisoned")
            .insert(nonce.to_string(), now_secs);
    }

    /// Drop entries older than `ttl_secs`. Called opportunistically on each
    /// verification; a standalone periodic sweep is equally valid.
    pub fn prune(&self, now_secs: i64, ttl_secs: i64) {
        self.seen
            .lock()
            .expect("nonce cache mutex poisoned")
            .retain(|_, inserted_at| now_secs - *inserted_at < ttl_secs);
    }
}

/// Bytes making up the inbound request relevant to verification.
pub struct InboundRequest<'a> {
    pub raw_body: &'a str,
    pub signature_header: &'a str,
    pub timestamp_header: &'a str,
    pub nonce: &'a str,
}

/// Run the full verification pipeline and return the parsed JSON body on
/// success.
pub fn verify_inbound(
    req: &InboundRequest<'_>,
    config: &InboundConfig,
    nonces: &NonceCache,
    now_secs: i64,
) -> Result<serde_json::Value, WebhookError> {
    let timestamp: i64 = req
        .timestamp_header
        .parse()
        .map_err(|_| WebhookError::InvalidTimestamp)?;

    if (now_secs - timestamp).abs() > config.timestamp_window_secs {
        return Err(WebhookError::TimestampOutOfWindow);
    }

    nonces.prune(now_secs, config.nonce_ttl_secs);
    if nonces.contains(req.nonce) {
        return Err(WebhookError::ReplayedNonce);
    }

    if !verify_signature(req.raw_body, timestamp, req.signature_header, config) {
        return Err(WebhookError::InvalidSignature);
    }

    nonces.insert(req.nonce, now_secs);

    serde_json::from_str(req.raw_body).map_err(|e| WebhookError::MalformedBody(e.to_string()))
}

fn verify_signature(body: &str, timestamp: i64, signature_hex: &str, config: &InboundConfig) -> bool {
    let message = format!("{timestamp}.{body}");
    let expected = compute_hmac_hex(&config.secret, &message);
    if constant_time_eq(&expected, signature_hex) {
        return true;
    }
    if let Some(previous) = &config.previous_secret {
        let expected_previous = compute_hmac_hex(previous, &message);
        if constant_time_eq(&expected_previous, signature_hex) {
            return true;
        }
    }
    false
}

fn compute_hmac_hex(secret: &str, message: &str) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC can take key of any size");
    mac.update(message.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Constant-time comparison. On a length mismatch, still runs a dummy
/// comparison of equal cost so verification time doesn't leak the expected
/// signature's length.
fn constant_time_eq(expected: &str, actual: &str) -> bool {
    let expected = expected.as_bytes();
    let actual = actual.as_bytes();
    if expected.len() != actual.len() {
        let dummy = vec![0u8; expected.len()];
        let _ = ct_eq_bytes(expected, &dummy);
        return false;
    }
    ct_eq_bytes(expected, actual)
}

fn ct_eq_bytes(a: &[u8], b: &[u8]) -> bool {
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// Outbound signed delivery: fire-and-forget, blocking HTTP client in its
/// own thread.
pub struct OutboundWebhookClient {
    client: reqwest::blocking::Client,
    url: String,
    secret: String,
}

impl OutboundWebhookClient {
    pub fn new(url: impl Into<String>, secret: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build webhook HTTP client")?;
        Ok(Self {
            client,
            url: url.into(),
            secret: secret.into(),
        })
    }

    /// Sign and POST `body`, fire-and-forget on a background thread.
    /// `extra_headers` are caller-supplied and sent alongside the three
    /// signature headers.
    pub fn send(&self, body: serde_json::Value, extra_headers: HashMap<String, String>) {
        let client = self.client.clone();
        let url = self.url.clone();
        let secret = self.secret.clone();

        std::thread::spawn(move || {
            if let Err(e) = do_send(&client, &url, &secret, &body, &extra_headers) {
                eprintln!("[warn] webhook delivery failed (non-blocking): {:#}", e);
            }
        });
    }

    /// Synchronous variant for callers that want the `DeliveryResult`
    /// inline (e.g. `RelayAdapter::deliver`).
    pub fn send_sync(
        &self,
        body: serde_json::Value,
        extra_headers: &HashMap<String, String>,
    ) -> Result<()> {
        do_send(&self.client, &self.url, &self.secret, &body, extra_headers)
    }
}

fn do_send(
    client: &reqwest::blocking::Client,
    url: &str,
    secret: &str,
    body: &serde_json::Value,
    extra_headers: &HashMap<String, String>,
) -> Result<()> {
    let json = serde_json::to_string(body).context("failed to serialize webhook body")?;
    let timestamp = Utc::now().timestamp();
    let signature = compute_hmac_hex(secret, &format!("{timestamp}.{json}"));
    let nonce = uuid::Uuid::new_v4().to_string();

    let mut request = client
        .post(url)
        .header("Content-Type", "application/json")
        .header("X-Signature", signature)
        .header("X-Timestamp", timestamp.to_string())
        .header("X-Nonce", nonce);

    for (key, value) in extra_headers {
        request = request.header(key, value);
    }

    let response = request.body(json).send().context("failed to send webhook request")?;

    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().unwrap_or_default();
        bail!("webhook returned error status {}: {}", status, body);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_signature_round_trips() {
        let config = InboundConfig::new("sixteen-chars-min");
        let nonces = NonceCache::new();
        let body = r#"{"hello":"world"}"#;
        let ts = 1_000_000i64;
        let signature = compute_hmac_hex(&config.secret, &format!("{ts}.{body}"));

        let req = InboundRequest {
            raw_body: body,
            signature_header: &signature,
            timestamp_header: &ts.to_string(),
            nonce: "nonce-1",
        };

        let parsed = verify_inbound(&req, &config, &nonces, ts).unwrap();
        assert_eq!(parsed["hello"], "world");
    }

    #[test]
    fn replayed_nonce_is_rejected() {
        let config = InboundConfig::new("sixteen-chars-min");
        let nonces = NonceCache::new();
        let body = r#"{"hello":"world"}"#;
        let ts = 1_000_000i64;
        let signature = compute_hmac_hex(&config.secret, &format!("{ts}.{body}"));
        let req = InboundRequest {
            raw_body: body,
            signature_header: &signature,
            timestamp_header: &ts.to_string(),
            nonce: "dup",
        };
        verify_inbound(&req, &config, &nonces, ts).unwrap();
        let second = verify_inbound(&req, &config, &nonces, ts);
        assert_eq!(second, Err(WebhookError::ReplayedNonce));
    }

    #[test]
    fn timestamp_outside_window_is_rejected() {
        let config = InboundConfig::new("sixteen-chars-min");
        let nonces = NonceCache::new();
        let body = "{}";
        let ts = 0i64;
        let signature = compute_hmac_hex(&config.secret, &format!("{ts}.{body}"));
        let req = InboundRequest {
            raw_body: body,
            signature_header: &signature,
            timestamp_header: &ts.to_string(),
            nonce: "n",
        };
        let result = verify_inbound(&req, &config, &nonces, 301);
        assert_eq!(result, Err(WebhookError::TimestampOutOfWindow));
    }

    #[test]
    fn invalid_signature_is_rejected() {
        let config = InboundConfig::new("sixteen-chars-min");
        let nonces = NonceCache::new();
        let req = InboundRequest {
            raw_body: "{}",
            signature_header: "deadbeef",
            timestamp_header: "0",
            nonce: "n",
        };
        let result = verify_inbound(&req, &config, &nonces, 0);
        assert_eq!(result, Err(WebhookError::InvalidSignature));
    }

    #[test]
    fn rotated_previous_secret_is_accepted() {
        let mut config = InboundConfig::new("current-secret16");
        config.previous_secret = Some("old-secret-value".to_string());
        let nonces = NonceCache::new();
        let body = "{}";
        let ts = 0i64;
        let signature = compute_hmac_hex("old-secret-value", &format!("{ts}.{body}"));
        let req = InboundRequest {
            raw_body: body,
            signature_header: &signature,
            timestamp_header: &ts.to_string(),
            nonce: "n",
        };
        assert!(verify_inbound(&req, &config, &nonces, 0).is_ok());
    }

    #[test]
    fn constant_time_eq_handles_length_mismatch() {
        assert!(!constant_time_eq("abc", "abcd"));
        assert!(constant_time_eq("abcd", "abcd"));
        assert!(!constant_time_eq("abcd", "abce"));
    }

    #[test]
    fn nonce_cache_prunes_entries_past_ttl() {
        let cache = NonceCache::new();
        cache.insert("n1", 0);
        cache.prune(100, 50);
        assert!(!cache.contains("n1"));
    }
}
