use crate::error::{BridgeError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Bridge configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Logging
    #[serde(default)]
    pub log: LogSettings,

    /// VM lifecycle behavior
    #[serde(default)]
    pub lifecycle: LifecycleConfig,

    /// Network datapath defaults
    #[serde(default)]
    pub datapath: DatapathConfig,

    /// IPC sessions
    #[serde(default)]
    pub ipc: IpcConfig,

    /// Host constants reported by the simulated hypervisor
    #[serde(default)]
    pub simulator: SimulatorConfig,
}

impl BridgeConfig {
    /// Load configuration from a YAML or JSON file, chosen by extension.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)?;
        let config: BridgeConfig = match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => serde_yaml::from_str(&contents)?,
            _ => serde_json::from_str(&contents)?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Check values that would make the bridge unusable.
    pub fn validate(&self) -> Result<()> {
        let mut violations = Vec::new();
        if self.datapath.max_packet_size == 0 {
            violations.push("datapath.max_packet_size must be positive".to_string());
        }
        if self.datapath.max_read_packet_count == 0 {
            violations.push("datapath.max_read_packet_count must be positive".to_string());
        }
        if self.datapath.max_write_packet_count == 0 {
            violations.push("datapath.max_write_packet_count must be positive".to_string());
        }
        let sim = &self.simulator;
        if sim.min_cpu_count == 0 || sim.min_cpu_count > sim.max_cpu_count {
            violations.push(format!(
                "simulator CPU bounds {}..={} are inconsistent",
                sim.min_cpu_count, sim.max_cpu_count
            ));
        }
        if sim.min_memory_size > sim.max_memory_size {
            violations.push(format!(
                "simulator memory bounds {}..={} are inconsistent",
                sim.min_memory_size, sim.max_memory_size
            ));
        }
        if violations.is_empty() {
            Ok(())
        } else {
            Err(BridgeError::ConfigInvalid { violations })
        }
    }
}

/// Logging settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSettings {
    /// Default level when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: LogLevel,

    /// Output format
    #[serde(default)]
    pub format: LogFormat,
}

fn default_log_level() -> LogLevel {
    LogLevel::Warn
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

/// Log level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => tracing::Level::TRACE,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Error => tracing::Level::ERROR,
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        };
        f.write_str(s)
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable lines
    #[default]
    Pretty,
    /// One JSON object per line
    Json,
}

/// Lifecycle configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LifecycleConfig {
    /// Force a stop when a cooperative stop request has not completed in
    /// this many milliseconds. Unset leaves shutdown entirely to the guest.
    #[serde(default)]
    pub request_stop_escalation_ms: Option<u64>,
}

impl LifecycleConfig {
    pub fn request_stop_escalation(&self) -> Option<Duration> {
        self.request_stop_escalation_ms.map(Duration::from_millis)
    }
}

/// Datapath configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatapathConfig {
    /// Maximum packet size in bytes (Ethernet frame without FCS)
    #[serde(default = "default_max_packet_size")]
    pub max_packet_size: u64,

    /// Packets per read call
    #[serde(default = "default_packet_count")]
    pub max_read_packet_count: usize,

    /// Packets per write call
    #[serde(default = "default_packet_count")]
    pub max_write_packet_count: usize,
}

fn default_max_packet_size() -> u64 {
    1514
}

fn default_packet_count() -> usize {
    256
}

impl Default for DatapathConfig {
    fn default() -> Self {
        Self {
            max_packet_size: default_max_packet_size(),
            max_read_packet_count: default_packet_count(),
            max_write_packet_count: default_packet_count(),
        }
    }
}

/// IPC configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IpcConfig {
    /// Fail replies that take longer than this many milliseconds
    #[serde(default)]
    pub reply_timeout_ms: Option<u64>,
}

impl IpcConfig {
    pub fn reply_timeout(&self) -> Option<Duration> {
        self.reply_timeout_ms.map(Duration::from_millis)
    }
}

/// Simulated hypervisor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulatorConfig {
    pub min_cpu_count: u32,
    pub max_cpu_count: u32,
    /// Bytes
    pub min_memory_size: u64,
    /// Bytes
    pub max_memory_size: u64,
    /// OS version the simulated host reports, e.g. "26.0"
    pub platform_version: String,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            min_cpu_count: 1,
            max_cpu_count: 8,
            min_memory_size: 128 * 1024 * 1024,
            max_memory_size: 16 * 1024 * 1024 * 1024,
            platform_version: "26.0".to_string(),
        }
    }
}
