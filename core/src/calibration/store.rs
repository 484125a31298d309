use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use log::{debug, warn};
use tempfile::NamedTempFile;

use crate::calibration::artifact::CalibrationArtifact;
use crate::calibration::CalibrationError;
use crate::interface::SensorId;

/// Artifacts keyed by sensor, optionally mirrored to a directory.
///
/// Readers get an `Arc` to a complete artifact; a replacement swaps the
/// `Arc` under the write lock, so nobody sees a half-updated one. On disk
/// each artifact lives in `sensor-<id>.json` and is replaced by rename.
pub struct ArtifactStore {
    dir: Option<PathBuf>,
    artifacts: RwLock<HashMap<SensorId, Arc<CalibrationArtifact>>>,
}

impl ArtifactStore {
    pub fn in_memory() -> Self {
        Self {
            dir: None,
            artifacts: RwLock::new(HashMap::new()),
        }
    }

    /// Opens (creating if needed) a store directory and loads what it holds.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, CalibrationError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let mut artifacts = HashMap::new();
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if !is_artifact_file(&path) {
                continue;
            }
            match fs::read(&path)
                .map_err(CalibrationError::from)
                .and_then(|bytes| Ok(serde_json::from_slice::<CalibrationArtifact>(&bytes)?))
            {
                Ok(artifact) => {
                    debug!("loaded calibration for sensor {}", artifact.sensor_id);
                    artifacts.insert(artifact.sensor_id, Arc::new(artifact));
                }
                Err(err) => warn!("skipping unreadable artifact {}: {}", path.display(), err),
            }
        }

        Ok(Self {
            dir: Some(dir),
            artifacts: RwLock::new(artifacts),
        })
    }

    pub fn get(&self, sensor_id: SensorId) -> Option<Arc<CalibrationArtifact>> {
        self.artifacts
            .read()
            .ok()
            .and_then(|artifacts| artifacts.get(&sensor_id).cloned())
    }

    /// Stores `artifact`, replacing any previous one for the same sensor.
    pub fn put(&self, artifact: CalibrationArtifact) -> Result<Arc<CalibrationArtifact>, CalibrationError> {
        let artifact = Arc::new(artifact);
        let mut artifacts = self
            .artifacts
            .write()
            .map_err(|_| CalibrationError::Poisoned)?;
        if let Some(dir) = &self.dir {
            persist(dir, &artifact)?;
        }
        artifacts.insert(artifact.sensor_id, Arc::clone(&artifact));
        Ok(artifact)
    }

    pub fn remove(&self, sensor_id: SensorId) -> Result<Option<Arc<CalibrationArtifact>>, CalibrationError> {
        let mut artifacts = self
            .artifacts
            .write()
            .map_err(|_| CalibrationError::Poisoned)?;
        if let Some(dir) = &self.dir {
            match fs::remove_file(artifact_path(dir, sensor_id)) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(artifacts.remove(&sensor_id))
    }

    pub fn sensors(&self) -> Vec<SensorId> {
        let mut sensors: Vec<SensorId> = self
            .artifacts
            .read()
            .map(|artifacts| artifacts.keys().copied().collect())
            .unwrap_or_default();
        sensors.sort();
        sensors
    }

    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }
}

pub fn artifact_path(dir: &Path, sensor_id: SensorId) -> PathBuf {
    dir.join(format!("sensor-{}.json", sensor_id.get()))
}

fn is_artifact_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .map(|name| name.starts_with("sensor-") && name.ends_with(".json"))
        .unwrap_or(false)
}

fn persist(dir: &Path, artifact: &CalibrationArtifact) -> Result<(), CalibrationError> {
    let mut file = NamedTempFile::new_in(dir)?;
    serde_json::to_writer_pretty(&mut file, artifact)?;
    file.flush()?;
    file.as_file().sync_all()?;
    file.persist(artifact_path(dir, artifact.sensor_id))
        .map_err(|err| CalibrationError::Io(err.error))?;
    Ok(())
}
