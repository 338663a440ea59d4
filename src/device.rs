use anyhow::Result;
use serde::Serialize;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tracing::info;

use crate::config::AppConfig;
use crate::detector::{Detector, NetworkInfoProvider, PermissionGate};
use crate::diagnostics::{diagnose, DiagnosticsReport};
use crate::error::SessionError;
use crate::export::{JsonFileExporter, SessionExporter};
use crate::models::{
    ConnectionQuality, ConnectionState, DetectionStatus, EventKind, SessionData,
};
use crate::prober::{DeviceProbe, HttpProber};
use crate::scheduler::{Scheduler, SchedulerPhase};
use crate::session::{SessionManager, SessionUpdate};
use crate::task::TaskHandle;

/// What the control side needs before dispatching a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlStatus {
    pub is_connected: bool,
    pub connection_quality: ConnectionQuality,
    pub session_active: bool,
    pub can_dispatch: bool,
}

/// Owns connectivity and session state for the one device. Hand it to
/// consumers instead of reaching for globals.
pub struct DeviceCore {
    scheduler: Scheduler,
    sessions: SessionManager,
    alerts: Mutex<Option<TaskHandle>>,
}

impl DeviceCore {
    pub fn new(
        config: &AppConfig,
        probe: Arc<dyn DeviceProbe>,
        network: Arc<dyn NetworkInfoProvider>,
        permissions: Arc<dyn PermissionGate>,
        exporter: Arc<dyn SessionExporter>,
    ) -> Self {
        let detector = Detector::new(&config.device, &config.probe, probe, network, permissions);
        let scheduler = Scheduler::new(
            detector,
            config.scheduler.clone(),
            config.device.app_endpoints.clone(),
        );
        let sessions = SessionManager::new(exporter, scheduler.subscribe());
        Self {
            scheduler,
            sessions,
            alerts: Mutex::new(None),
        }
    }

    /// Builds the core with the HTTP prober and the JSON file exporter.
    pub fn from_config(
        config: &AppConfig,
        network: Arc<dyn NetworkInfoProvider>,
        permissions: Arc<dyn PermissionGate>,
    ) -> Result<Self> {
        let probe = Arc::new(HttpProber::new(&config.device, &config.probe)?);
        info!("Device endpoint: {}", probe.base_url());
        let exporter = Arc::new(JsonFileExporter::new(config.session.export_dir.clone()));
        Ok(Self::new(config, probe, network, permissions, exporter))
    }

    pub fn init(&self) {
        self.scheduler.init();

        let mut states = self.scheduler.subscribe();
        let sessions = self.sessions.clone();
        let alerts = TaskHandle::spawn("connectivity-alerts", move |cancel| async move {
            let mut was_connected = states.borrow_and_update().is_connected();
            while states.changed().await.is_ok() {
                if cancel.is_cancelled() {
                    break;
                }
                let state = states.borrow_and_update().clone();
                match state.detection_status {
                    DetectionStatus::Idle | DetectionStatus::Checking => continue,
                    DetectionStatus::Connected if !was_connected => {
                        sessions.add_session_alert(
                            EventKind::Success,
                            "Connection Restored",
                            &format!("Quality {:?}", state.connection_quality),
                        );
                    }
                    DetectionStatus::Disconnected | DetectionStatus::Error if was_connected => {
                        let cause = state
                            .last_error
                            .map_or_else(|| "device not ready".to_string(), |kind| kind.to_string());
                        sessions.add_session_alert(EventKind::Warning, "Connection Lost", &cause);
                    }
                    _ => {}
                }
                was_connected = state.is_connected();
            }
        });
        *self.alerts.lock().unwrap_or_else(|e| e.into_inner()) = Some(alerts);
    }

    pub fn teardown(&self) {
        if let Some(mut alerts) = self.alerts.lock().unwrap_or_else(|e| e.into_inner()).take() {
            alerts.cancel();
        }
        self.scheduler.teardown();
        self.sessions.teardown();
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.scheduler.state()
    }

    pub fn phase(&self) -> SchedulerPhase {
        self.scheduler.phase()
    }

    pub async fn refresh_connection(&self) -> bool {
        self.scheduler.refresh_connection().await
    }

    pub fn start_session(&self) -> Result<SessionData, SessionError> {
        self.sessions.start_session()
    }

    pub fn end_session(&self) -> Result<SessionData, SessionError> {
        self.sessions.end_session()
    }

    pub fn add_session_alert(&self, kind: EventKind, title: &str, detail: &str) -> bool {
        self.sessions.add_session_alert(kind, title, detail)
    }

    pub fn subscribe_session(&self) -> broadcast::Receiver<SessionUpdate> {
        self.sessions.subscribe()
    }

    pub fn register_force_update_callback<F>(&self, callback: F)
    where
        F: Fn(u64) + Send + Sync + 'static,
    {
        self.sessions.register_force_update_callback(callback);
    }

    /// After teardown the last snapshot is stale, so nothing reports as
    /// connected.
    pub fn control_status(&self) -> ControlStatus {
        let state = self.scheduler.state();
        let is_connected = self.scheduler.is_active() && state.is_connected();
        let session_active = self.sessions.is_active();
        ControlStatus {
            is_connected,
            connection_quality: state.connection_quality,
            session_active,
            can_dispatch: is_connected && session_active,
        }
    }

    /// Logs the failure into the active session and re-probes the device.
    pub fn report_command_failure(&self, reason: &str) {
        self.sessions.add_session_alert(EventKind::Error, "Command Failed", reason);
        self.scheduler.report_command_failure(reason);
    }

    pub fn diagnostics(&self) -> DiagnosticsReport {
        let detector = self.scheduler.detector();
        diagnose(
            &detector.history().snapshot(),
            &self.scheduler.state(),
            detector.target_ssid(),
            detector.high_latency_ms(),
        )
    }
}
