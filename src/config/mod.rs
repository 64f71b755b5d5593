/// Configuration management for the Relay engine
///
/// Handles server configuration, database location, container runtime settings,
/// and trigger/webhook delivery parameters.

use serde::{Deserialize, Serialize};

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration
    pub server: ServerConfig,
    /// Database configuration
    pub database: DatabaseConfig,
    /// Container runtime configuration
    pub runtime: RuntimeConfig,
    /// Trigger dispatcher configuration
    pub triggers: TriggerConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Server bind address (e.g., "0.0.0.0")
    pub host: String,
    /// Server port number
    pub port: u16,
    /// Base URL advertised to step/trigger containers for metadata and
    /// event-emit callbacks (e.g., "http://host.docker.internal:3004")
    pub public_url: String,
}

/// Database configuration for SQLite-backed persistence
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Base directory for the relay database file (default: "data")
    pub data_dir: String,
    /// Days to keep archived runs before pruning
    pub retention_days: u32,
}

/// Container runtime configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Container CLI binary used to launch step/trigger containers
    pub docker_bin: String,
    /// Default maximum duration budget for a step, in seconds.
    /// Individual steps may override this in their definition.
    pub default_step_timeout_secs: u64,
}

/// Trigger dispatcher and webhook delivery configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerConfig {
    /// First loopback port assigned to trigger container listeners
    pub port_range_start: u16,
    /// Timeout for forwarding a webhook payload to a trigger container, in seconds
    pub delivery_timeout_secs: u64,
}

impl Default for Config {
    /// Default configuration with ENV_VAR support for k8s/container deployment
    fn default() -> Self {
        let port: u16 = std::env::var("RELAY_PORT")
            .unwrap_or_else(|_| "3004".to_string())
            .parse()
            .unwrap_or(3004);

        Self {
            server: ServerConfig {
                host: std::env::var("RELAY_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
                port,
                public_url: std::env::var("RELAY_PUBLIC_URL")
                    .unwrap_or_else(|_| format!("http://127.0.0.1:{}", port)),
            },
            database: DatabaseConfig {
                data_dir: std::env::var("RELAY_DATA_DIR").unwrap_or_else(|_| "data".to_string()),
                retention_days: std::env::var("RELAY_RETENTION_DAYS")
                    .unwrap_or_else(|_| "30".to_string())
                    .parse()
                    .unwrap_or(30),
            },
            runtime: RuntimeConfig {
                docker_bin: std::env::var("RELAY_DOCKER_BIN")
                    .unwrap_or_else(|_| "docker".to_string()),
                default_step_timeout_secs: std::env::var("RELAY_DEFAULT_STEP_TIMEOUT_SECS")
                    .unwrap_or_else(|_| "3600".to_string())
                    .parse()
                    .unwrap_or(3600),
            },
            triggers: TriggerConfig {
                port_range_start: std::env::var("RELAY_TRIGGER_PORT_START")
                    .unwrap_or_else(|_| "42000".to_string())
                    .parse()
                    .unwrap_or(42000),
                delivery_timeout_secs: std::env::var("RELAY_DELIVERY_TIMEOUT_SECS")
                    .unwrap_or_else(|_| "10".to_string())
                    .parse()
                    .unwrap_or(10),
            },
        }
    }
}
