use crate::server::ServerOptions;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use sweepcore::interface::{SensorConfig, SensorId, SessionConfig};
use sweepcore::processing::DetectorConfig;

/// Where the module server lives.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConnectionConfig {
    /// A synthetic server on an in-process channel.
    Simulated(ServerOptions),
    Tcp { address: String },
    Serial { port: String, baud_rate: u32 },
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig::Simulated(ServerOptions::default())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CalibrationSettings {
    /// Artifacts are kept in memory only when unset.
    pub dir: Option<PathBuf>,
    pub frames: usize,
}

impl Default for CalibrationSettings {
    fn default() -> Self {
        Self {
            dir: None,
            frames: 10,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WorkflowConfig {
    pub connection: ConnectionConfig,
    pub sensors: Vec<SensorId>,
    pub sensor_config: SensorConfig,
    pub update_rate: Option<f32>,
    pub detector: DetectorConfig,
    /// Live runs stop after this many results.
    pub frames: u64,
    pub timeout_ms: u64,
    pub calibration: CalibrationSettings,
    pub record: Option<PathBuf>,
    pub bridge_address: Option<String>,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            connection: ConnectionConfig::default(),
            sensors: vec![SensorId::new(1)],
            sensor_config: SensorConfig::default(),
            update_rate: None,
            detector: DetectorConfig::default(),
            frames: 100,
            timeout_ms: 2000,
            calibration: CalibrationSettings::default(),
            record: None,
            bridge_address: None,
        }
    }
}

impl WorkflowConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path_ref = path.as_ref();
        let contents = fs::read_to_string(path_ref)
            .with_context(|| format!("reading workflow config {}", path_ref.display()))?;
        let config: WorkflowConfig = serde_yaml::from_str(&contents)
            .with_context(|| format!("parsing workflow config {}", path_ref.display()))?;
        Ok(config)
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            update_rate: self.update_rate,
            ..SessionConfig::new(self.sensors.clone(), self.sensor_config.clone())
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.max(1))
    }
}
