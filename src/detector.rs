use anyhow::Result;
use chrono::Utc;
use futures::future::BoxFuture;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::{DeviceConfig, ProbeConfig, StaticNetworkConfig};
use crate::error::{DetectError, ErrorKind};
use crate::models::{
    ConnectionQuality, ConnectionState, DetectionStatus, NetworkInfo, ProbePayload, ProbeResult,
};
use crate::prober::{DeviceProbe, ProbeHistory};

/// Source of the phone's current WiFi association.
pub trait NetworkInfoProvider: Send + Sync {
    fn network_info(&self) -> BoxFuture<'_, Result<NetworkInfo>>;
}

pub trait PermissionGate: Send + Sync {
    fn has_required_permissions(&self) -> bool;
}

/// Reports a fixed association, for hosts that are wired into the device
/// network rather than roaming onto it.
pub struct StaticNetworkInfo {
    info: NetworkInfo,
}

impl StaticNetworkInfo {
    pub fn new(config: &StaticNetworkConfig) -> Self {
        Self {
            info: NetworkInfo {
                ssid: config.ssid.clone(),
                ip_address: config.ip_address.clone(),
                is_wifi_enabled: config.ssid.is_some(),
                is_internet_reachable: None,
            },
        }
    }
}

impl NetworkInfoProvider for StaticNetworkInfo {
    fn network_info(&self) -> BoxFuture<'_, Result<NetworkInfo>> {
        Box::pin(futures::future::ready(Ok(self.info.clone())))
    }
}

pub struct GrantedPermissions;

impl PermissionGate for GrantedPermissions {
    fn has_required_permissions(&self) -> bool {
        true
    }
}

/// Status strings the firmware reports once it accepts commands.
const READY_STATUSES: &[&str] = &["ready", "ok", "online", "idle"];

#[derive(Debug, Clone, PartialEq)]
pub enum Readiness {
    Ready,
    NotReady(String),
    Unrecognized,
}

/// Reads a `/status` or `/health` body.
pub fn readiness(payload: &ProbePayload) -> Readiness {
    let ProbePayload::Json(value) = payload else {
        return Readiness::Unrecognized;
    };

    if let Some(status) = value.get("status").and_then(|s| s.as_str()) {
        let normalized = status.trim().to_ascii_lowercase();
        return if READY_STATUSES.contains(&normalized.as_str()) {
            Readiness::Ready
        } else {
            Readiness::NotReady(status.to_string())
        };
    }

    match value.get("healthy").and_then(|h| h.as_bool()) {
        Some(true) => Readiness::Ready,
        Some(false) => Readiness::NotReady("unhealthy".into()),
        None => Readiness::Unrecognized,
    }
}

/// Liveness needs a 2xx with something in it; an empty body is not an answer.
fn has_body(result: &ProbeResult) -> bool {
    match &result.payload {
        Some(ProbePayload::Text(body)) => !body.trim().is_empty(),
        Some(ProbePayload::Json(_)) => true,
        None => false,
    }
}

/// Android and iOS both hand back SSIDs wrapped in quotes on some versions.
fn normalize_ssid(ssid: &str) -> &str {
    ssid.trim().trim_matches('"')
}

pub struct Detector {
    probe: Arc<dyn DeviceProbe>,
    network: Arc<dyn NetworkInfoProvider>,
    permissions: Arc<dyn PermissionGate>,
    target_ssid: Option<String>,
    liveness_endpoint: String,
    timeout: Duration,
    high_latency_ms: u64,
    history: ProbeHistory,
}

impl Detector {
    pub fn new(
        device: &DeviceConfig,
        probe_config: &ProbeConfig,
        probe: Arc<dyn DeviceProbe>,
        network: Arc<dyn NetworkInfoProvider>,
        permissions: Arc<dyn PermissionGate>,
    ) -> Self {
        Self {
            probe,
            network,
            permissions,
            target_ssid: device.ssid.clone(),
            liveness_endpoint: device.liveness_endpoint.clone(),
            timeout: probe_config.timeout(),
            high_latency_ms: probe_config.high_latency_ms,
            history: ProbeHistory::new(probe_config.history_capacity),
        }
    }

    pub fn history(&self) -> &ProbeHistory {
        &self.history
    }

    pub fn has_permissions(&self) -> bool {
        self.permissions.has_required_permissions()
    }

    pub fn target_ssid(&self) -> Option<&str> {
        self.target_ssid.as_deref()
    }

    pub fn high_latency_ms(&self) -> u64 {
        self.high_latency_ms
    }

    fn link_ok(&self, info: &NetworkInfo) -> bool {
        if !info.is_wifi_enabled {
            return false;
        }
        let Some(current) = info.ssid.as_deref().map(normalize_ssid) else {
            return false;
        };
        match &self.target_ssid {
            Some(target) => current == normalize_ssid(target),
            None => !current.is_empty(),
        }
    }

    async fn run_probe(&self, endpoint: &str) -> ProbeResult {
        let result = self.probe.probe(endpoint, self.timeout).await;
        self.history.record(result.clone());
        result
    }

    /// Runs link, transport and application checks in that order, stopping at
    /// the first failing layer. `app_endpoint` is the status route to confirm
    /// readiness against.
    pub async fn detect(&self, app_endpoint: &str) -> Result<ConnectionState, DetectError> {
        if !self.permissions.has_required_permissions() {
            return Err(DetectError::PermissionDenied);
        }

        let info = match self.network.network_info().await {
            Ok(info) => info,
            Err(e) => {
                warn!("Network info unavailable: {:#}", e);
                return Ok(ConnectionState::errored(ErrorKind::NetworkFailure, None));
            }
        };

        let unreachable = ConnectionState {
            detection_status: DetectionStatus::Disconnected,
            network_info: Some(info.clone()),
            checked_at: Some(Utc::now()),
            ..ConnectionState::default()
        };

        if !self.link_ok(&info) {
            debug!(ssid = ?info.ssid, target = ?self.target_ssid, "link layer failed");
            return Ok(unreachable);
        }

        let liveness = self.run_probe(&self.liveness_endpoint).await;
        if !liveness.ok || !has_body(&liveness) {
            let last_error = if liveness.ok {
                Some(ErrorKind::MalformedResponse)
            } else {
                liveness.error_kind
            };
            debug!(error = ?last_error, "transport layer failed");
            return Ok(ConnectionState {
                is_link_ok: true,
                connection_quality: ConnectionQuality::Poor,
                last_error,
                checked_at: Some(Utc::now()),
                ..unreachable
            });
        }

        let app = self.run_probe(app_endpoint).await;
        let (ready, last_error) = match (&app.payload, app.ok) {
            (Some(payload), true) => match readiness(payload) {
                Readiness::Ready => (true, None),
                Readiness::NotReady(status) => {
                    debug!(endpoint = app_endpoint, status = %status, "device not ready");
                    (false, None)
                }
                Readiness::Unrecognized => (false, Some(ErrorKind::MalformedResponse)),
            },
            _ => (false, app.error_kind),
        };

        let latency_ms = if app.ok {
            liveness.latency_ms.max(app.latency_ms)
        } else {
            liveness.latency_ms
        };
        let connection_quality = if ready && latency_ms <= self.high_latency_ms {
            ConnectionQuality::Excellent
        } else {
            ConnectionQuality::Good
        };

        Ok(ConnectionState {
            is_link_ok: true,
            is_reachable: true,
            is_responding: ready,
            connection_quality,
            detection_status: if ready {
                DetectionStatus::Connected
            } else {
                DetectionStatus::Disconnected
            },
            latency_ms: Some(latency_ms),
            last_error,
            network_info: Some(info),
            checked_at: Some(Utc::now()),
        })
    }
}
