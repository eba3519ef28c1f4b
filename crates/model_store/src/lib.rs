use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use carrier_model::{CarrierModel, HoleState};
use core_types::StoreError;
use serde::{Deserialize, Serialize};
use tracing::warn;

pub const SCHEMA_VERSION: u32 = 1;

/// Interchange record for one carrier model file.
#[derive(Debug, Serialize, Deserialize)]
struct ModelFile {
    schema_version: u32,
    carrier_id: String,
    holes: BTreeMap<String, HoleState>,
}

/// One JSON file per carrier under `models_dir`, written atomically.
#[derive(Debug, Clone)]
pub struct ModelStore {
    models_dir: PathBuf,
}

impl ModelStore {
    pub fn new(models_dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let models_dir = models_dir.into();
        fs::create_dir_all(&models_dir)?;
        Ok(Self { models_dir })
    }

    pub fn models_dir(&self) -> &Path {
        &self.models_dir
    }

    pub fn model_path(&self, carrier_id: &str) -> PathBuf {
        self.models_dir
            .join(format!("{}.json", sanitize_id(carrier_id)))
    }

    /// Writes the full payload to a sibling temp file, flushes, then renames
    /// over the target. A failed save removes the temp file and leaves the
    /// previous on-disk model untouched.
    pub fn save(&self, model: &CarrierModel) -> Result<(), StoreError> {
        let target = self.model_path(&model.carrier_id);
        let tmp = target.with_extension("json.tmp");
        let record = ModelFile {
            schema_version: SCHEMA_VERSION,
            carrier_id: model.carrier_id.clone(),
            holes: model.holes.clone(),
        };
        let payload =
            serde_json::to_vec(&record).map_err(|e| StoreError::Io(std::io::Error::other(e)))?;

        let result = (|| -> Result<(), StoreError> {
            {
                let mut file = File::create(&tmp)?;
                file.write_all(&payload)?;
                file.sync_all()?;
            }
            if let Err(err) = fs::rename(&tmp, &target) {
                if target.exists() {
                    let _ = fs::remove_file(&target);
                    fs::rename(&tmp, &target)?;
                } else {
                    return Err(err.into());
                }
            }
            Ok(())
        })();
        if result.is_err() {
            let _ = fs::remove_file(&tmp);
        }
        result
    }

    /// Absent files are not an error. A file that cannot be parsed or whose
    /// schema version is unknown is quarantined next to the original so the
    /// next load starts fresh, and reported as `StoreError::Corrupt`.
    pub fn load(&self, carrier_id: &str) -> Result<Option<CarrierModel>, StoreError> {
        let path = self.model_path(carrier_id);
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };

        let corrupt = |reason: String| {
            self.quarantine(&path, carrier_id, &reason);
            StoreError::Corrupt {
                carrier_id: carrier_id.to_string(),
                reason,
            }
        };
        let record = serde_json::from_str::<ModelFile>(&raw)
            .map_err(|e| corrupt(e.to_string()))?;
        if record.schema_version != SCHEMA_VERSION {
            return Err(corrupt(format!(
                "schema_version {} not supported",
                record.schema_version
            )));
        }
        Ok(Some(CarrierModel {
            carrier_id: record.carrier_id,
            holes: record.holes,
        }))
    }

    fn quarantine(&self, path: &Path, carrier_id: &str, reason: &str) {
        let backup = path.with_extension("json.corrupted");
        match fs::rename(path, &backup) {
            Ok(()) => warn!(carrier_id, reason, backup = %backup.display(), "quarantined corrupt model file"),
            Err(err) => warn!(carrier_id, %err, "failed to quarantine corrupt model file"),
        }
    }
}

/// Keeps carrier-id file names filesystem-safe; anything outside
/// `[A-Za-z0-9_-]` becomes an underscore.
fn sanitize_id(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        if ch.is_ascii_alphanumeric() || ch == '_' || ch == '-' {
            out.push(ch);
        } else {
            out.push('_');
        }
    }
    while out.contains("__") {
        out = out.replace("__", "_");
    }
    let trimmed = out.trim_matches('_');
    if trimmed.is_empty() {
        "carrier".to_string()
    } else {
        trimmed.to_string()
    }
}
