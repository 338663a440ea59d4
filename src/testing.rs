//! Scripted collaborators for unit tests.

use anyhow::{anyhow, Result};
use chrono::Utc;
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;

use crate::detector::{NetworkInfoProvider, PermissionGate};
use crate::error::ErrorKind;
use crate::export::SessionExporter;
use crate::models::{NetworkInfo, ProbePayload, ProbeResult, SessionData};
use crate::prober::DeviceProbe;

pub fn ok_json(endpoint: &str, value: serde_json::Value, latency_ms: u64) -> ProbeResult {
    ok_payload(endpoint, ProbePayload::Json(value), latency_ms)
}

pub fn ok_text(endpoint: &str, body: &str, latency_ms: u64) -> ProbeResult {
    ok_payload(endpoint, ProbePayload::Text(body.into()), latency_ms)
}

fn ok_payload(endpoint: &str, payload: ProbePayload, latency_ms: u64) -> ProbeResult {
    ProbeResult {
        endpoint: endpoint.into(),
        timestamp: Utc::now(),
        ok: true,
        status_code: Some(200),
        latency_ms,
        payload: Some(payload),
        error_kind: None,
        message: "HTTP 200".into(),
    }
}

pub fn timed_out(endpoint: &str, latency_ms: u64) -> ProbeResult {
    ProbeResult::failed(endpoint, latency_ms, ErrorKind::Timeout, "timed out")
}

pub fn on_ssid(ssid: &str) -> NetworkInfo {
    NetworkInfo {
        ssid: Some(ssid.into()),
        ip_address: Some("192.168.4.2".into()),
        is_wifi_enabled: true,
        is_internet_reachable: Some(false),
    }
}

/// Answers each endpoint with a fixed response, or a refused connection if
/// none was set.
#[derive(Default)]
pub struct ScriptedProbe {
    fixed: Mutex<HashMap<String, ProbeResult>>,
    calls: Mutex<Vec<String>>,
    completed: AtomicUsize,
    delay: Mutex<Duration>,
}

impl ScriptedProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(&self, endpoint: &str, result: ProbeResult) {
        self.fixed.lock().unwrap().insert(endpoint.into(), result);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    /// Requests that ran to the end instead of being dropped mid-flight.
    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }

    pub fn clear_calls(&self) {
        self.calls.lock().unwrap().clear();
        self.completed.store(0, Ordering::SeqCst);
    }

    fn next(&self, endpoint: &str) -> ProbeResult {
        self.fixed
            .lock()
            .unwrap()
            .get(endpoint)
            .cloned()
            .unwrap_or_else(|| ProbeResult::failed(endpoint, 1, ErrorKind::NetworkFailure, "refused"))
    }
}

impl DeviceProbe for ScriptedProbe {
    fn probe<'a>(&'a self, endpoint: &'a str, _timeout: Duration) -> BoxFuture<'a, ProbeResult> {
        Box::pin(async move {
            self.calls.lock().unwrap().push(endpoint.to_string());
            let delay = *self.delay.lock().unwrap();
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            self.completed.fetch_add(1, Ordering::SeqCst);
            self.next(endpoint)
        })
    }
}

pub struct FixedNetwork {
    info: Mutex<Option<NetworkInfo>>,
}

impl FixedNetwork {
    pub fn new(info: NetworkInfo) -> Self {
        Self { info: Mutex::new(Some(info)) }
    }

    pub fn unavailable() -> Self {
        Self { info: Mutex::new(None) }
    }

    pub fn set(&self, info: NetworkInfo) {
        *self.info.lock().unwrap() = Some(info);
    }
}

impl NetworkInfoProvider for FixedNetwork {
    fn network_info(&self) -> BoxFuture<'_, Result<NetworkInfo>> {
        let info = self.info.lock().unwrap().clone();
        Box::pin(async move { info.ok_or_else(|| anyhow!("wifi service unavailable")) })
    }
}

pub struct Permissions(AtomicBool);

impl Permissions {
    pub fn granted() -> Self {
        Self(AtomicBool::new(true))
    }

    pub fn denied() -> Self {
        Self(AtomicBool::new(false))
    }

    pub fn set(&self, granted: bool) {
        self.0.store(granted, Ordering::SeqCst);
    }
}

impl PermissionGate for Permissions {
    fn has_required_permissions(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
pub struct RecordingExporter {
    exported: Mutex<Vec<SessionData>>,
    fail: bool,
    pub notify: Notify,
}

impl RecordingExporter {
    pub fn failing() -> Self {
        Self { fail: true, ..Self::default() }
    }

    pub fn exported(&self) -> Vec<SessionData> {
        self.exported.lock().unwrap().clone()
    }
}

impl SessionExporter for RecordingExporter {
    fn export_session(&self, data: SessionData) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.exported.lock().unwrap().push(data);
            self.notify.notify_one();
            if self.fail {
                Err(anyhow!("disk full"))
            } else {
                Ok(())
            }
        })
    }
}
