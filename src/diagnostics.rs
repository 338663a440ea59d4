use serde::Serialize;
use std::collections::BTreeMap;

use crate::error::ErrorKind;
use crate::models::{ConnectionState, DetectionStatus, ProbeResult};

const UNSTABLE_MIN_SAMPLES: usize = 4;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticsReport {
    pub total_probes: usize,
    pub successful_probes: usize,
    pub success_rate: f64,
    pub average_latency_ms: Option<f64>,
    pub failures: BTreeMap<ErrorKind, usize>,
    pub last_failure: Option<ProbeResult>,
    pub recommendations: Vec<String>,
}

/// Summarizes recent probes into guidance text. Reads only.
pub fn diagnose(
    history: &[ProbeResult],
    state: &ConnectionState,
    target_ssid: Option<&str>,
    high_latency_ms: u64,
) -> DiagnosticsReport {
    let total_probes = history.len();
    let successful: Vec<&ProbeResult> = history.iter().filter(|p| p.ok).collect();
    let success_rate = if total_probes == 0 {
        0.0
    } else {
        successful.len() as f64 / total_probes as f64
    };
    let average_latency_ms = if successful.is_empty() {
        None
    } else {
        Some(successful.iter().map(|p| p.latency_ms as f64).sum::<f64>() / successful.len() as f64)
    };

    let mut failures = BTreeMap::new();
    for kind in history.iter().filter_map(|p| p.error_kind) {
        *failures.entry(kind).or_insert(0) += 1;
    }
    let last_failure = history.iter().rev().find(|p| !p.ok).cloned();

    let mut recommendations = Vec::new();
    if state.last_error == Some(ErrorKind::PermissionDenied) {
        recommendations
            .push("Grant location and network permissions so the WiFi network can be identified.".into());
    } else if state.detection_status == DetectionStatus::Error {
        recommendations.push("WiFi status could not be read. Check that WiFi is turned on.".into());
    } else if state.detection_status != DetectionStatus::Idle && !state.is_link_ok {
        match target_ssid {
            Some(ssid) => recommendations.push(format!("Connect this phone to the \"{}\" WiFi network.", ssid)),
            None => recommendations.push("Connect this phone to the device's WiFi network.".into()),
        }
    } else if state.is_link_ok && !state.is_reachable {
        if state.last_error == Some(ErrorKind::Timeout) {
            recommendations.push(
                "The device is not answering. Check that it is powered on and within range.".into(),
            );
        } else {
            recommendations.push("The device refused the connection. Restart the device and retry.".into());
        }
    } else if state.is_reachable && !state.is_responding {
        if state.last_error == Some(ErrorKind::MalformedResponse) {
            recommendations.push(
                "An unexpected service answered at the device address. Another device may be using it."
                    .into(),
            );
        } else {
            recommendations.push("The device is still starting up. Wait a few seconds and refresh.".into());
        }
    }

    if failures.contains_key(&ErrorKind::HttpError) {
        recommendations.push("The device returned HTTP errors; its firmware may be busy.".into());
    }
    if average_latency_ms.is_some_and(|avg| avg > high_latency_ms as f64) {
        recommendations.push("Responses are slow. Move closer to the device.".into());
    }
    if total_probes >= UNSTABLE_MIN_SAMPLES && success_rate < 0.5 {
        recommendations.push(format!(
            "Connection is unstable: {:.0}% of recent probes failed.",
            (1.0 - success_rate) * 100.0
        ));
    }
    if recommendations.is_empty() && state.is_connected() {
        recommendations.push("Connection is healthy.".into());
    }

    DiagnosticsReport {
        total_probes,
        successful_probes: successful.len(),
        success_rate,
        average_latency_ms,
        failures,
        last_failure,
        recommendations,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ConnectionQuality;
    use crate::testing::{ok_text, timed_out};

    #[test]
    fn healthy_history() {
        let history = vec![ok_text("/ping", "pong", 100), ok_text("/status", "{}", 300)];
        let state = ConnectionState {
            is_link_ok: true,
            is_reachable: true,
            is_responding: true,
            connection_quality: ConnectionQuality::Excellent,
            detection_status: DetectionStatus::Connected,
            ..ConnectionState::default()
        };

        let report = diagnose(&history, &state, None, 1_500);

        assert_eq!(report.success_rate, 1.0);
        assert_eq!(report.average_latency_ms, Some(200.0));
        assert!(report.failures.is_empty());
        assert_eq!(report.recommendations, vec!["Connection is healthy."]);
    }

    #[test]
    fn powered_off_device() {
        let history: Vec<_> = (0..4).map(|_| timed_out("/ping", 20_000)).collect();
        let state = ConnectionState {
            is_link_ok: true,
            connection_quality: ConnectionQuality::Poor,
            detection_status: DetectionStatus::Disconnected,
            last_error: Some(ErrorKind::Timeout),
            ..ConnectionState::default()
        };

        let report = diagnose(&history, &state, Some("Rig-AP"), 1_500);

        assert_eq!(report.failures.get(&ErrorKind::Timeout), Some(&4));
        assert!(report.last_failure.is_some());
        assert!(report.recommendations[0].contains("powered on"));
        assert!(report.recommendations.iter().any(|r| r.contains("100%")));
    }

    #[test]
    fn wrong_network_names_the_target() {
        let state = ConnectionState {
            detection_status: DetectionStatus::Disconnected,
            ..ConnectionState::default()
        };

        let report = diagnose(&[], &state, Some("Rig-AP"), 1_500);
        assert_eq!(report.recommendations, vec!["Connect this phone to the \"Rig-AP\" WiFi network."]);
    }
}
