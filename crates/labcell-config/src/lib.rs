//! # Labcell Config
//!
//! Unified single-file configuration for the labcell orchestrator. One
//! `labcell.yaml` configures the HTTP listener, the robot link and retry
//! policy, observability, and optionally the workcell inventory seed.

mod loader;

pub use loader::{load_config, ConfigError};

use serde::Deserialize;

use labcell_core::types::{Hand, ObjectType, SlotCategory};

/// Top-level configuration schema.
#[derive(Debug, Clone, Deserialize)]
pub struct LabcellConfig {
    /// Config schema version.
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub app: AppConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub robot: RobotConfig,
    #[serde(default)]
    pub observability: ObservabilityConfig,
    /// `None` means use the built-in workcell layout.
    #[serde(default)]
    pub inventory: Option<InventoryConfig>,
}

fn default_version() -> u32 {
    1
}

impl Default for LabcellConfig {
    fn default() -> Self {
        Self {
            version: default_version(),
            app: AppConfig::default(),
            http: HttpConfig::default(),
            robot: RobotConfig::default(),
            observability: ObservabilityConfig::default(),
            inventory: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_app_name")]
    pub name: String,
    #[serde(default = "default_env")]
    pub environment: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            name: default_app_name(),
            environment: default_env(),
        }
    }
}

fn default_app_name() -> String {
    "labcell".to_string()
}

fn default_env() -> String {
    "development".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

fn default_listen() -> String {
    "127.0.0.1:8090".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct RobotConfig {
    #[serde(default = "default_robot_host")]
    pub host: String,
    #[serde(default = "default_robot_port")]
    pub port: u16,
    #[serde(default = "default_retry_interval")]
    pub retry_interval_secs: u64,
    /// `None` means retry forever.
    #[serde(default)]
    pub max_retry_attempts: Option<u32>,
    #[serde(default = "default_request_timeout")]
    pub default_timeout_secs: u64,
}

impl Default for RobotConfig {
    fn default() -> Self {
        Self {
            host: default_robot_host(),
            port: default_robot_port(),
            retry_interval_secs: default_retry_interval(),
            max_retry_attempts: None,
            default_timeout_secs: default_request_timeout(),
        }
    }
}

fn default_robot_host() -> String {
    "127.0.0.1".to_string()
}

fn default_robot_port() -> u16 {
    9090
}

fn default_retry_interval() -> u64 {
    5
}

fn default_request_timeout() -> u64 {
    10
}

#[derive(Debug, Clone, Deserialize)]
pub struct ObservabilityConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Optional per-run append-only log file.
    #[serde(default)]
    pub log_file: Option<String>,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_file: None,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Workcell layout seed.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct InventoryConfig {
    #[serde(default)]
    pub slots: Vec<SlotSeed>,
    #[serde(default)]
    pub bottles: Vec<BottleSeed>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SlotSeed {
    pub pose_name: String,
    pub category: SlotCategory,
    pub navigation_pose: String,
    /// Omit for untyped slots.
    #[serde(default)]
    pub accepted_type: Option<ObjectType>,
    #[serde(default = "default_capacity")]
    pub capacity: usize,
}

fn default_capacity() -> usize {
    2
}

#[derive(Debug, Clone, Deserialize)]
pub struct BottleSeed {
    pub bottle_id: String,
    pub object_type: ObjectType,
    #[serde(default = "default_hand")]
    pub hand: Hand,
    /// Must reference a slot declared in `slots`.
    #[serde(default)]
    pub location: Option<String>,
}

fn default_hand() -> Hand {
    Hand::Right
}
