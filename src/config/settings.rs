use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;
use std::time::Duration;

use crate::websocket::BackoffConfig;

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub realtime: RealtimeConfig,
    #[serde(default)]
    pub clock: ClockConfig,
    #[serde(default)]
    pub watch: WatchConfig,
    #[serde(default)]
    pub otel: OtelConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RealtimeConfig {
    /// REST base URL, e.g. `https://auction.example.com/api`
    pub api_base_url: String,
    /// Hub path appended to the REST origin
    #[serde(default = "default_hub_path")]
    pub hub_path: String,
    /// Maximum time for the socket open plus hub handshake, in seconds
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,
    /// Interval between client keep-alive pings, in seconds
    #[serde(default = "default_keep_alive_interval")]
    pub keep_alive_interval_secs: u64,
    /// Drop the socket if the server is silent for this long, in seconds
    #[serde(default = "default_server_timeout")]
    pub server_timeout_secs: u64,
    /// Reconnect attempts before the transport gives up
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    #[serde(default = "default_reconnect_initial_delay")]
    pub reconnect_initial_delay_ms: u64,
    #[serde(default = "default_reconnect_max_delay")]
    pub reconnect_max_delay_ms: u64,
    #[serde(default = "default_reconnect_multiplier")]
    pub reconnect_multiplier: f64,
    /// Jitter factor (0.0 to 1.0)
    #[serde(default = "default_reconnect_jitter")]
    pub reconnect_jitter: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClockConfig {
    /// EMA smoothing factor. Higher reacts faster to real skew changes but
    /// lets more network jitter through; lower is smoother and converges slower.
    #[serde(default = "default_alpha")]
    pub alpha: f64,
    /// Interval of the background time sync probe, in seconds (0 disables it)
    #[serde(default = "default_probe_interval")]
    pub probe_interval_secs: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WatchConfig {
    /// Items subscribed on startup by the binary
    #[serde(default)]
    pub items: Vec<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OtelConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_otel_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_service_name")]
    pub service_name: String,
    #[serde(default = "default_sampling_ratio")]
    pub sampling_ratio: f64,
}

fn default_hub_path() -> String {
    "/auctionHub".to_string()
}

fn default_handshake_timeout() -> u64 {
    15
}

fn default_keep_alive_interval() -> u64 {
    15
}

fn default_server_timeout() -> u64 {
    30
}

fn default_max_reconnect_attempts() -> u32 {
    4
}

fn default_reconnect_initial_delay() -> u64 {
    500
}

fn default_reconnect_max_delay() -> u64 {
    30_000 // 30 seconds
}

fn default_reconnect_multiplier() -> f64 {
    2.0
}

fn default_reconnect_jitter() -> f64 {
    0.1
}

fn default_alpha() -> f64 {
    0.2
}

fn default_probe_interval() -> u64 {
    60
}

fn default_otel_endpoint() -> String {
    "http://localhost:4317".to_string()
}

fn default_service_name() -> String {
    "auction-realtime".to_string()
}

fn default_sampling_ratio() -> f64 {
    1.0
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        // Load .env file if exists
        let _ = dotenvy::dotenv();

        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let builder = Config::builder()
            .set_default("realtime.api_base_url", "http://localhost:5000/api")?
            .set_default("realtime.hub_path", default_hub_path())?
            .set_default("clock.alpha", default_alpha())?
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            // REALTIME__API_BASE_URL, CLOCK__ALPHA, WATCH__ITEMS=1,2,3, etc.
            .add_source(
                Environment::default()
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("watch.items"),
            );

        builder.build()?.try_deserialize()
    }
}

impl RealtimeConfig {
    pub fn new(api_base_url: impl Into<String>) -> Self {
        Self {
            api_base_url: api_base_url.into(),
            hub_path: default_hub_path(),
            handshake_timeout_secs: default_handshake_timeout(),
            keep_alive_interval_secs: default_keep_alive_interval(),
            server_timeout_secs: default_server_timeout(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            reconnect_initial_delay_ms: default_reconnect_initial_delay(),
            reconnect_max_delay_ms: default_reconnect_max_delay(),
            reconnect_multiplier: default_reconnect_multiplier(),
            reconnect_jitter: default_reconnect_jitter(),
        }
    }

    /// Push endpoint: the REST origin with its `/api` suffix stripped, plus the
    /// hub path, on the matching WebSocket scheme.
    pub fn hub_endpoint(&self) -> String {
        let base = self.api_base_url.trim_end_matches('/');
        let origin = base.strip_suffix("/api").unwrap_or(base);

        let origin = if let Some(rest) = origin.strip_prefix("https://") {
            format!("wss://{}", rest)
        } else if let Some(rest) = origin.strip_prefix("http://") {
            format!("ws://{}", rest)
        } else {
            origin.to_string()
        };

        let path = if self.hub_path.starts_with('/') {
            self.hub_path.clone()
        } else {
            format!("/{}", self.hub_path)
        };

        format!("{}{}", origin, path)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    /// Never shorter than one second
    pub fn keep_alive_interval(&self) -> Duration {
        Duration::from_secs(self.keep_alive_interval_secs.max(1))
    }

    pub fn server_timeout(&self) -> Duration {
        Duration::from_secs(self.server_timeout_secs)
    }

    pub fn backoff(&self) -> BackoffConfig {
        BackoffConfig {
            initial_delay_ms: self.reconnect_initial_delay_ms,
            max_delay_ms: self.reconnect_max_delay_ms,
            multiplier: self.reconnect_multiplier,
            jitter_factor: self.reconnect_jitter,
        }
    }
}

impl Default for ClockConfig {
    fn default() -> Self {
        Self {
            alpha: default_alpha(),
            probe_interval_secs: default_probe_interval(),
        }
    }
}

impl Default for OtelConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: default_otel_endpoint(),
            service_name: default_service_name(),
            sampling_ratio: default_sampling_ratio(),
        }
    }
}
