use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    /// Directory where credential JSON files are persisted.
    pub auth_dir: String,
    pub providers: HashMap<String, ProviderConfig>,
    pub performance: PerformanceConfig,
    pub quota: QuotaConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8317,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Base URL override for this provider's API.
    pub endpoint: Option<String>,
    /// API key used when no persisted credential exists for the provider.
    pub api_key: Option<String>,
    pub proxy_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PerformanceConfig {
    pub request_timeout_seconds: u64,
    /// Streams with no upstream bytes for this long are aborted.
    pub stream_idle_timeout_seconds: u64,
    pub result_queue_size: usize,
    pub result_workers: usize,
    pub enable_metrics: bool,
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            request_timeout_seconds: 300,
            stream_idle_timeout_seconds: 300,
            result_queue_size: 2048,
            result_workers: 4,
            enable_metrics: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaConfig {
    /// Cooldown ladder applied to repeated 429s without a Retry-After header,
    /// in minutes. The last step saturates.
    pub backoff_minutes: Vec<u64>,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            backoff_minutes: vec![1, 5, 15, 60, 360],
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            auth_dir: "auths".to_string(),
            providers: HashMap::new(),
            performance: PerformanceConfig::default(),
            quota: QuotaConfig::default(),
        }
    }
}

impl Config {
    pub fn load(path: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let content = std::fs::read_to_string(path)?;
        let config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.performance.request_timeout_seconds)
    }

    pub fn stream_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.performance.stream_idle_timeout_seconds)
    }

    pub fn quota_ladder(&self) -> Vec<Duration> {
        self.quota
            .backoff_minutes
            .iter()
            .map(|m| Duration::from_secs(m * 60))
            .collect()
    }

    pub fn provider_endpoint(&self, provider: &str) -> Option<String> {
        self.providers.get(provider)?.endpoint.clone()
    }
}
