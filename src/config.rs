use serde::{Deserialize, Deserializer, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AppConfig {
    pub device: DeviceConfig,
    #[serde(default)]
    pub probe: ProbeConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub network: StaticNetworkConfig,
    #[serde(default = "default_api_port")]
    pub api_port: u16,
    #[serde(default = "default_dashboard_dir")]
    pub dashboard_dir: PathBuf,
}

fn default_api_port() -> u16 { 3000 }
fn default_dashboard_dir() -> PathBuf { PathBuf::from("public") }

/// The single statically-addressed peer.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct DeviceConfig {
    /// IP address, optionally with `:port`.
    pub address: String,
    /// SSID the phone must be associated with. `None` accepts any WiFi network.
    #[serde(default)]
    pub ssid: Option<String>,
    #[serde(default = "default_liveness_endpoint")]
    pub liveness_endpoint: String,
    /// Status routes tried in order each round. Must not be empty.
    #[serde(default = "default_app_endpoints", deserialize_with = "non_empty_endpoints")]
    pub app_endpoints: Vec<String>,
}

fn default_liveness_endpoint() -> String { "/ping".into() }
fn default_app_endpoints() -> Vec<String> { vec!["/status".into(), "/health".into()] }

fn non_empty_endpoints<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let endpoints = Vec::<String>::deserialize(deserializer)?;
    if endpoints.is_empty() {
        return Err(serde::de::Error::custom(
            "app_endpoints must list at least one status route",
        ));
    }
    Ok(endpoints)
}

impl DeviceConfig {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            ssid: None,
            liveness_endpoint: default_liveness_endpoint(),
            app_endpoints: default_app_endpoints(),
        }
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.address.trim_end_matches('/'))
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ProbeConfig {
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_high_latency_ms")]
    pub high_latency_ms: u64,
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

// Mobile radio stacks can stall the first request on a fresh association for
// well over ten seconds.
pub fn default_timeout_ms() -> u64 { 20_000 }
pub fn default_high_latency_ms() -> u64 { 1_500 }
fn default_history_capacity() -> usize { 50 }
fn default_user_agent() -> String { format!("devlink/{}", env!("CARGO_PKG_VERSION")) }

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
            high_latency_ms: default_high_latency_ms(),
            history_capacity: default_history_capacity(),
            user_agent: default_user_agent(),
        }
    }
}

impl ProbeConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SchedulerConfig {
    #[serde(default = "default_rounds")]
    pub rounds: u32,
    #[serde(default = "default_endpoint_delay_ms")]
    pub endpoint_delay_ms: u64,
    #[serde(default = "default_round_delay_ms")]
    pub round_delay_ms: u64,
    #[serde(default = "default_retry_interval_ms")]
    pub retry_interval_ms: u64,
    #[serde(default = "default_health_check_interval_ms")]
    pub health_check_interval_ms: u64,
}

fn default_rounds() -> u32 { 2 }
fn default_endpoint_delay_ms() -> u64 { 500 }
fn default_round_delay_ms() -> u64 { 2_000 }
fn default_retry_interval_ms() -> u64 { 10_000 }
fn default_health_check_interval_ms() -> u64 { 30_000 }

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            rounds: default_rounds(),
            endpoint_delay_ms: default_endpoint_delay_ms(),
            round_delay_ms: default_round_delay_ms(),
            retry_interval_ms: default_retry_interval_ms(),
            health_check_interval_ms: default_health_check_interval_ms(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SessionConfig {
    #[serde(default = "default_export_dir")]
    pub export_dir: PathBuf,
}

fn default_export_dir() -> PathBuf { PathBuf::from("sessions") }

impl Default for SessionConfig {
    fn default() -> Self {
        Self { export_dir: default_export_dir() }
    }
}

/// What the daemon's static network-info provider reports.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct StaticNetworkConfig {
    #[serde(default)]
    pub ssid: Option<String>,
    #[serde(default)]
    pub ip_address: Option<String>,
}
