use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct CourierConfig {
    #[serde(default)]
    pub service: ServiceConfig,
    pub database: DatabaseConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub bridge: BridgeConfig,
    #[serde(default)]
    pub agent_backend: AgentBackendConfig,
    #[serde(default)]
    pub pairing: PairingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServiceConfig {
    pub log_level: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct HttpConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct AuthConfig {
    pub enabled: bool,
    /// Owner assigned to sessions when auth is disabled, and the user seeded
    /// from `bootstrap_api_key`.
    pub default_owner: String,
    #[serde(default)]
    pub bootstrap_api_key: Option<String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default_owner: "admin".to_string(),
            bootstrap_api_key: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct BridgeConfig {
    pub socket_path: String,
    pub request_timeout_seconds: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            socket_path: "/tmp/courier-bridge.sock".to_string(),
            request_timeout_seconds: 30,
        }
    }
}

impl BridgeConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct AgentBackendConfig {
    #[serde(default)]
    pub base_url: Option<String>,
    pub timeout_seconds: u64,
    #[serde(default = "default_parameters")]
    pub default_parameters: serde_json::Map<String, serde_json::Value>,
}

fn default_parameters() -> serde_json::Map<String, serde_json::Value> {
    let mut params = serde_json::Map::new();
    params.insert("max_steps".to_string(), serde_json::json!(5));
    params
}

impl Default for AgentBackendConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            timeout_seconds: 30,
            default_parameters: default_parameters(),
        }
    }
}

impl AgentBackendConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct PairingConfig {
    pub first_code_wait_seconds: u64,
    pub reconnect_code_wait_seconds: u64,
    pub stale_code_seconds: u64,
    pub connect_attempts: usize,
    pub connect_backoff_seconds: u64,
}

impl Default for PairingConfig {
    fn default() -> Self {
        Self {
            first_code_wait_seconds: 15,
            reconnect_code_wait_seconds: 2,
            stale_code_seconds: 50,
            connect_attempts: 5,
            connect_backoff_seconds: 2,
        }
    }
}

impl PairingConfig {
    pub fn first_code_wait(&self) -> Duration {
        Duration::from_secs(self.first_code_wait_seconds)
    }

    pub fn reconnect_code_wait(&self) -> Duration {
        Duration::from_secs(self.reconnect_code_wait_seconds)
    }

    pub fn stale_code_after(&self) -> Duration {
        Duration::from_secs(self.stale_code_seconds)
    }

    pub fn connect_backoff_step(&self) -> Duration {
        Duration::from_secs(self.connect_backoff_seconds)
    }
}

impl CourierConfig {
    /// Load from a TOML file, then overlay `COURIER__SECTION__KEY` env vars.
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let s = Config::builder()
            .add_source(File::with_name(path))
            .add_source(Environment::with_prefix("COURIER").separator("__"))
            .build()?;
        s.try_deserialize()
    }
}
