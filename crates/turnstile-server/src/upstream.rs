use arc_swap::ArcSwap;
use async_trait::async_trait;
use reqwest::header;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("upstream timed out after {0:?}")]
    Timeout(Duration),
    #[error("upstream request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("upstream returned status {0}")]
    Status(u16),
    #[error("upstream payload is not a JSON array: {0}")]
    Decode(#[from] serde_json::Error),
}

/// The data source behind the read path: `GET {base}/{resource}?{query}`
/// returning a JSON array of records.
#[async_trait]
pub trait Upstream: Send + Sync {
    async fn fetch(&self, resource: &str, query: &[(&str, &str)])
        -> Result<Vec<Value>, UpstreamError>;
}

/// HTTP or HTTPS upstream client. The base URL can be swapped at runtime.
pub struct HttpUpstream {
    client: reqwest::Client,
    base_url: ArcSwap<String>,
    timeout: Duration,
}

impl HttpUpstream {
    pub fn new(base_url: &str, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|e| panic!("failed to build upstream client: {e}"));
        Self {
            client,
            base_url: ArcSwap::from_pointee(base_url.to_string()),
            timeout,
        }
    }

    #[cfg(test)]
    pub fn base_url(&self) -> Arc<String> {
        self.base_url.load_full()
    }

    pub fn set_base_url(&self, url: &str) {
        self.base_url.store(Arc::new(url.to_string()));
    }

    fn url(&self, resource: &str, query: &[(&str, &str)]) -> String {
        let base = self.base_url.load();
        let mut url = format!("{}/{}", base.trim_end_matches('/'), resource);
        for (i, (k, v)) in query.iter().enumerate() {
            url.push(if i == 0 { '?' } else { '&' });
            url.push_str(&encode_component(k));
            url.push('=');
            url.push_str(&encode_component(v));
        }
        url
    }

    async fn send(&self, url: &str) -> Result<Vec<Value>, UpstreamError> {
        let response = self
            .client
            .get(url)
            .header(header::ACCEPT, "application/json")
            .send()
            .await
            .map_err(|e| self.classify(e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(UpstreamError::Status(status.as_u16()));
        }

        let body = response.bytes().await.map_err(|e| self.classify(e))?;
        Ok(serde_json::from_slice(&body)?)
    }

    fn classify(&self, e: reqwest::Error) -> UpstreamError {
        if e.is_timeout() {
            UpstreamError::Timeout(self.timeout)
        } else {
            UpstreamError::Transport(e)
        }
    }
}

#[async_trait]
impl Upstream for HttpUpstream {
    async fn fetch(
        &self,
        resource: &str,
        query: &[(&str, &str)],
    ) -> Result<Vec<Value>, UpstreamError> {
        let url = self.url(resource, query);
        tracing::debug!(url = %url, "calling upstream");

        match tokio::time::timeout(self.timeout, self.send(&url)).await {
            Ok(result) => result,
            Err(_) => Err(UpstreamError::Timeout(self.timeout)),
        }
    }
}

/// Percent-encode everything outside the RFC 3986 unreserved set.
fn encode_component(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        if b.is_ascii_alphanumeric() || matches!(b, b'-' | b'.' | b'_' | b'~') {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{b:02X}"));
        }
    }
    out
}
