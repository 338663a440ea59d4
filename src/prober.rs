use anyhow::{Context, Result};
use chrono::Utc;
use futures::future::BoxFuture;
use reqwest::header::{ACCEPT, CACHE_CONTROL};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::config::{DeviceConfig, ProbeConfig};
use crate::error::ErrorKind;
use crate::models::{ProbePayload, ProbeResult};

/// One timed GET against the device. Expected failures come back as a failed
/// [`ProbeResult`], never as an error.
pub trait DeviceProbe: Send + Sync {
    fn probe<'a>(&'a self, endpoint: &'a str, timeout: Duration) -> BoxFuture<'a, ProbeResult>;
}

pub struct HttpProber {
    client: reqwest::Client,
    base_url: String,
}

impl HttpProber {
    pub fn new(device: &DeviceConfig, probe: &ProbeConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(probe.user_agent.clone())
            .pool_max_idle_per_host(1)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: device.base_url(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn fetch(&self, endpoint: &str, timeout: Duration) -> ProbeResult {
        let url = format!("{}{}", self.base_url, endpoint);
        let start = Instant::now();

        let exchange = async {
            let response = self
                .client
                .get(&url)
                .header(ACCEPT, "application/json, text/plain, */*")
                .header(CACHE_CONTROL, "no-cache")
                .send()
                .await?;
            let status = response.status();
            let body = response.text().await?;
            Ok::<_, reqwest::Error>((status, body))
        };

        // Dropping the exchange on expiry aborts the in-flight request.
        let outcome = tokio::time::timeout(timeout, exchange).await;
        let latency_ms = start.elapsed().as_millis() as u64;

        let result = match outcome {
            Err(_) => ProbeResult::failed(
                endpoint,
                latency_ms,
                ErrorKind::Timeout,
                format!("No response within {}ms", timeout.as_millis()),
            ),
            Ok(Err(e)) if e.is_timeout() => {
                ProbeResult::failed(endpoint, latency_ms, ErrorKind::Timeout, e.to_string())
            }
            Ok(Err(e)) => {
                ProbeResult::failed(endpoint, latency_ms, ErrorKind::NetworkFailure, e.to_string())
            }
            Ok(Ok((status, _))) if !status.is_success() => ProbeResult {
                status_code: Some(status.as_u16()),
                ..ProbeResult::failed(
                    endpoint,
                    latency_ms,
                    ErrorKind::HttpError,
                    format!("Unexpected status {}", status),
                )
            },
            Ok(Ok((status, body))) => ProbeResult {
                endpoint: endpoint.to_string(),
                timestamp: Utc::now(),
                ok: true,
                status_code: Some(status.as_u16()),
                latency_ms,
                payload: Some(parse_payload(body)),
                error_kind: None,
                message: format!("HTTP {}", status.as_u16()),
            },
        };

        debug!(
            endpoint,
            ok = result.ok,
            latency_ms = result.latency_ms,
            error = ?result.error_kind,
            "probe finished"
        );
        result
    }
}

impl DeviceProbe for HttpProber {
    fn probe<'a>(&'a self, endpoint: &'a str, timeout: Duration) -> BoxFuture<'a, ProbeResult> {
        Box::pin(self.fetch(endpoint, timeout))
    }
}

pub fn parse_payload(body: String) -> ProbePayload {
    match serde_json::from_str::<serde_json::Value>(&body) {
        Ok(value) => ProbePayload::Json(value),
        Err(_) => ProbePayload::Text(body),
    }
}

/// Bounded ring of recent probe results, oldest first.
pub struct ProbeHistory {
    capacity: usize,
    entries: Mutex<VecDeque<ProbeResult>>,
}

impl ProbeHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    pub fn record(&self, result: ProbeResult) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(result);
    }

    pub fn snapshot(&self) -> Vec<ProbeResult> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.iter().cloned().collect()
    }
}
