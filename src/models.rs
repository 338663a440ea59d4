use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ErrorKind;

/// Body of a successful probe. Device firmware answers in JSON on the status
/// routes but some builds reply with plain text on `/ping`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum ProbePayload {
    Json(serde_json::Value),
    Text(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeResult {
    pub endpoint: String,
    pub timestamp: DateTime<Utc>,
    pub ok: bool,
    pub status_code: Option<u16>,
    pub latency_ms: u64,
    pub payload: Option<ProbePayload>,
    pub error_kind: Option<ErrorKind>,
    pub message: String,
}

impl ProbeResult {
    pub fn failed(endpoint: &str, latency_ms: u64, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            timestamp: Utc::now(),
            ok: false,
            status_code: None,
            latency_ms,
            payload: None,
            error_kind: Some(kind),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkInfo {
    pub ssid: Option<String>,
    pub ip_address: Option<String>,
    pub is_wifi_enabled: bool,
    pub is_internet_reachable: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionQuality {
    None,
    Poor,
    Good,
    Excellent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectionStatus {
    Idle,
    Checking,
    Connected,
    Disconnected,
    Error,
}

/// One detection cycle's verdict. Always replaced as a whole.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionState {
    pub is_link_ok: bool,
    pub is_reachable: bool,
    pub is_responding: bool,
    pub connection_quality: ConnectionQuality,
    pub detection_status: DetectionStatus,
    pub latency_ms: Option<u64>,
    pub last_error: Option<ErrorKind>,
    pub network_info: Option<NetworkInfo>,
    pub checked_at: Option<DateTime<Utc>>,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self {
            is_link_ok: false,
            is_reachable: false,
            is_responding: false,
            connection_quality: ConnectionQuality::None,
            detection_status: DetectionStatus::Idle,
            latency_ms: None,
            last_error: None,
            network_info: None,
            checked_at: None,
        }
    }
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        self.detection_status == DetectionStatus::Connected
    }

    /// The same snapshot, marked as being re-checked.
    pub fn checking(&self) -> Self {
        Self {
            detection_status: DetectionStatus::Checking,
            ..self.clone()
        }
    }

    pub fn errored(kind: ErrorKind, network_info: Option<NetworkInfo>) -> Self {
        Self {
            detection_status: DetectionStatus::Error,
            last_error: Some(kind),
            network_info,
            checked_at: Some(Utc::now()),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Session,
    Info,
    Success,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionEvent {
    pub timestamp: DateTime<Utc>,
    pub kind: EventKind,
    pub title: String,
    pub detail: String,
}

/// Whether the device answered when the session began.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionMode {
    Online,
    Offline,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionData {
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration_secs: u64,
    pub mode: SessionMode,
    pub events: Vec<SessionEvent>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_state_serializes_for_clients() {
        let state = ConnectionState {
            is_link_ok: true,
            connection_quality: ConnectionQuality::Poor,
            detection_status: DetectionStatus::Disconnected,
            last_error: Some(ErrorKind::Timeout),
            ..ConnectionState::default()
        };
        let json = serde_json::to_value(&state).unwrap();

        assert_eq!(json["isLinkOk"], true);
        assert_eq!(json["connectionQuality"], "poor");
        assert_eq!(json["detectionStatus"], "disconnected");
        assert_eq!(json["lastError"], "TIMEOUT");
    }

    #[test]
    fn quality_orders_from_none_to_excellent() {
        assert!(ConnectionQuality::None < ConnectionQuality::Poor);
        assert!(ConnectionQuality::Good < ConnectionQuality::Excellent);
    }

    #[test]
    fn payload_is_tagged() {
        let text = serde_json::to_value(ProbePayload::Text("pong".into())).unwrap();
        assert_eq!(text, serde_json::json!({ "type": "text", "value": "pong" }));
    }
}
