use serde::Deserialize;

use crate::telemetry::{LogConfig, LogLevel};

pub const DEFAULT_STUN_URLS: [&str; 5] = [
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
    "stun:stun2.l.google.com:19302",
    "stun:stun3.l.google.com:19302",
    "stun:stun4.l.google.com:19302",
];

/// Process configuration, read from `TANDEM_*` environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    #[serde(default = "default_static_dir")]
    pub static_dir: String,
    #[serde(default = "default_ice_port_start")]
    pub ice_port_start: u16,
    #[serde(default = "default_ice_port_end")]
    pub ice_port_end: u16,
    /// Comma separated host IPs advertised through NAT 1:1 mapping.
    #[serde(default)]
    pub ice_public_ips: Option<String>,
    /// Comma separated STUN URLs. Unset means the public Google pool; an
    /// empty value disables STUN entirely.
    #[serde(default)]
    pub stun_urls: Option<String>,
    #[serde(default)]
    pub log_path: Option<String>,
    #[serde(default)]
    pub log_level: Option<String>,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, config::ConfigError> {
        config::Config::builder()
            .add_source(config::Environment::with_prefix("TANDEM"))
            .build()
            .and_then(|c| c.try_deserialize::<AppConfig>())
            .map(AppConfig::normalize)
    }

    fn normalize(mut self) -> Self {
        self.bind_addr = self.bind_addr.trim().to_string();
        self.static_dir = self.static_dir.trim().to_string();
        self.ice_public_ips = Self::normalize_opt(self.ice_public_ips.take());
        self.log_path = Self::normalize_opt(self.log_path.take());
        self.log_level = Self::normalize_opt(self.log_level.take());
        // An explicitly empty STUN list is meaningful, so only trim it.
        self.stun_urls = self.stun_urls.take().map(|s| s.trim().to_string());
        self
    }

    fn normalize_opt(value: Option<String>) -> Option<String> {
        value.and_then(|s| {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        })
    }

    pub fn public_ips(&self) -> Vec<String> {
        self.ice_public_ips
            .as_deref()
            .map(split_list)
            .unwrap_or_default()
    }

    pub fn stun_servers(&self) -> Vec<String> {
        match self.stun_urls.as_deref() {
            None => DEFAULT_STUN_URLS.iter().map(|s| s.to_string()).collect(),
            Some(list) => split_list(list),
        }
    }

    pub fn port_range(&self) -> (u16, u16) {
        (self.ice_port_start, self.ice_port_end)
    }

    pub fn log_config(&self) -> LogConfig {
        LogConfig {
            level: self
                .log_level
                .as_deref()
                .and_then(LogLevel::parse)
                .unwrap_or_default(),
            file: self.log_path.as_ref().map(Into::into),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        AppConfig {
            bind_addr: default_bind_addr(),
            static_dir: default_static_dir(),
            ice_port_start: default_ice_port_start(),
            ice_port_end: default_ice_port_end(),
            ice_public_ips: None,
            stun_urls: None,
            log_path: None,
            log_level: None,
        }
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

fn default_bind_addr() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_static_dir() -> String {
    "./client".to_string()
}

fn default_ice_port_start() -> u16 {
    50_000
}

fn default_ice_port_end() -> u16 {
    60_000
}
