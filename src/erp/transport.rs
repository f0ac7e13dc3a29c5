// ABOUTME: HTTP transport to the ERP's local XML listener
// ABOUTME: One request per call, UTF-16 payloads, bounded timeouts, no retries

use reqwest::Client;
use std::future::Future;
use std::time::Duration;

use crate::error::{SyncError, SyncResult};

/// Default timeout for a single request.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default timeout for bulk transaction tables.
pub const DEFAULT_BULK_TIMEOUT: Duration = Duration::from_secs(45);

/// Anything that can carry a compiled request to the ERP and bring back its text.
///
/// Retries do not belong here: a failed call surfaces immediately and the
/// orchestrator's next tick is the retry.
pub trait ErpTransport {
    /// Send one request. `bulk` selects the longer timeout.
    fn send(&self, xml: &str, bulk: bool) -> impl Future<Output = SyncResult<String>> + Send;

    /// Cheap reachability probe.
    fn check(&self) -> impl Future<Output = SyncResult<()>> + Send;
}

/// reqwest-backed transport for the ERP listener at a fixed host and port.
pub struct ErpClient {
    client: Client,
    endpoint: String,
    timeout: Duration,
    bulk_timeout: Duration,
}

impl ErpClient {
    pub fn new(host: &str, port: u16, timeout: Duration, bulk_timeout: Duration) -> SyncResult<Self> {
        // Fresh connection per call; the listener does not handle keep-alive well.
        let client = Client::builder()
            .pool_max_idle_per_host(0)
            .build()
            .map_err(|e| SyncError::Transport(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            endpoint: format!("http://{}:{}", host.trim_end_matches('/'), port),
            timeout,
            bulk_timeout,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

impl ErpTransport for ErpClient {
    async fn send(&self, xml: &str, bulk: bool) -> SyncResult<String> {
        let timeout = if bulk { self.bulk_timeout } else { self.timeout };

        tracing::debug!(
            "Sending {} byte request to ERP at {} (timeout {:?})",
            xml.len(),
            self.endpoint,
            timeout
        );

        let response = self
            .client
            .post(&self.endpoint)
            .timeout(timeout)
            .header("Content-Type", "text/xml;charset=utf-16")
            .body(encode_utf16(xml))
            .send()
            .await
            .map_err(|e| SyncError::from_http("ERP request", timeout.as_secs(), e))?;

        let status = response.status();
        let bytes = response
            .bytes()
            .await
            .map_err(|e| SyncError::from_http("ERP response", timeout.as_secs(), e))?;

        if !status.is_success() {
            return Err(SyncError::Transport(format!(
                "ERP returned status {}: {}",
                status,
                decode_response(&bytes).chars().take(200).collect::<String>()
            )));
        }

        Ok(decode_response(&bytes))
    }

    async fn check(&self) -> SyncResult<()> {
        let response = self
            .client
            .get(&self.endpoint)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| SyncError::from_http("ERP health check", self.timeout.as_secs(), e))?;

        if !response.status().is_success() {
            return Err(SyncError::Transport(format!(
                "ERP health check returned status {}",
                response.status()
            )));
        }
        Ok(())
    }
}

/// Encode a request as UTF-16LE with a byte-order mark.
pub fn encode_utf16(text: &str) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(2 + text.len() * 2);
    bytes.extend_from_slice(&[0xFF, 0xFE]);
    for unit in text.encode_utf16() {
        bytes.extend_from_slice(&unit.to_le_bytes());
    }
    bytes
}

/// Decode a response body, sniffing for UTF-16 before falling back to UTF-8.
pub fn decode_response(bytes: &[u8]) -> String {
    match bytes {
        [0xFF, 0xFE, rest @ ..] => decode_utf16(rest, u16::from_le_bytes),
        [0xFE, 0xFF, rest @ ..] => decode_utf16(rest, u16::from_be_bytes),
        [0xEF, 0xBB, 0xBF, rest @ ..] => String::from_utf8_lossy(rest).into_owned(),
        _ if looks_like_utf16le(bytes) => decode_utf16(bytes, u16::from_le_bytes),
        _ => String::from_utf8_lossy(bytes).into_owned(),
    }
}

fn decode_utf16(bytes: &[u8], to_unit: fn([u8; 2]) -> u16) -> String {
    let units = bytes.chunks_exact(2).map(|pair| to_unit([pair[0], pair[1]]));
    char::decode_utf16(units)
        .map(|c| c.unwrap_or(char::REPLACEMENT_CHARACTER))
        .collect()
}

/// ASCII-heavy UTF-16LE has a zero in most odd positions.
fn looks_like_utf16le(bytes: &[u8]) -> bool {
    if bytes.len() < 2 || bytes.len() % 2 != 0 {
        return false;
    }
    let sample = &bytes[..bytes.len().min(512)];
    let zeros = sample.iter().skip(1).step_by(2).filter(|b| **b == 0).count();
    zeros * 2 >= sample.len() / 2
}
