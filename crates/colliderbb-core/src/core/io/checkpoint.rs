use super::traits::ModelFile;
use crate::core::models::collider::Collider;
use serde::{Deserialize, Serialize};
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Version of the checkpoint layout written by this crate.
pub const CHECKPOINT_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("Malformed checkpoint: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Unsupported checkpoint format version {found} (expected {expected})")]
    UnsupportedVersion { found: u32, expected: u32 },
    #[error("Checkpoint not found: {}", .0.display())]
    NotFound(PathBuf),
}

#[derive(Serialize)]
struct CheckpointRef<'a> {
    format_version: u32,
    collider: &'a Collider,
}

#[derive(Deserialize)]
struct CheckpointOwned {
    format_version: u32,
    collider: Collider,
}

/// JSON checkpoint holding a full collider model.
pub struct JsonCheckpoint;

impl ModelFile for JsonCheckpoint {
    type Error = CheckpointError;

    fn read_from(reader: &mut impl BufRead) -> Result<Collider, Self::Error> {
        let data: CheckpointOwned = serde_json::from_reader(reader)?;
        if data.format_version != CHECKPOINT_FORMAT_VERSION {
            return Err(CheckpointError::UnsupportedVersion {
                found: data.format_version,
                expected: CHECKPOINT_FORMAT_VERSION,
            });
        }
        Ok(data.collider)
    }

    fn write_to(collider: &Collider, writer: &mut impl Write) -> Result<(), Self::Error> {
        let data = CheckpointRef {
            format_version: CHECKPOINT_FORMAT_VERSION,
            collider,
        };
        serde_json::to_writer(writer, &data)?;
        Ok(())
    }
}

/// Path of the checkpoint written by pipeline stage `stage` for run `tag`,
/// e.g. `collider_hllhc_02.json`.
pub fn checkpoint_path(dir: &Path, tag: &str, stage: u8) -> PathBuf {
    dir.join(format!("collider_{}_{:02}.json", tag, stage))
}

pub fn save_checkpoint(collider: &Collider, path: &Path) -> Result<(), CheckpointError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    JsonCheckpoint::write_to_path(collider, path)
}

pub fn load_checkpoint(path: &Path) -> Result<Collider, CheckpointError> {
    if !path.exists() {
        return Err(CheckpointError::NotFound(path.to_path_buf()));
    }
    JsonCheckpoint::read_from_path(path)
}

impl Collider {
    pub fn to_json_string(&self) -> Result<String, CheckpointError> {
        let mut buffer = Vec::new();
        JsonCheckpoint::write_to(self, &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e).into())
    }

    pub fn from_json_str(json: &str) -> Result<Self, CheckpointError> {
        JsonCheckpoint::read_from(&mut json.as_bytes())
    }

    pub fn to_json_path(&self, path: &Path) -> Result<(), CheckpointError> {
        save_checkpoint(self, path)
    }

    pub fn from_json_path(path: &Path) -> Result<Self, CheckpointError> {
        load_checkpoint(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::models::knobs::Provenance;
    use crate::core::models::line::{Element, Line, ReferenceParticle};
    use std::io::Cursor;
    use tempfile::tempdir;

    fn collider() -> Collider {
        let mut collider = Collider::new();
        collider.add_line(
            Line::new("lhcb1", ReferenceParticle::proton(7000.0), 26658.8832)
                .with_elements([Element::marker("ip1", 0.0), Element::marker("ip5", 13329.0)]),
        );
        collider
            .set_knob("on_x1", 250.0, Provenance::Settings)
            .unwrap();
        collider
    }

    #[test]
    fn checkpoint_paths_are_numbered_by_stage() {
        let path = checkpoint_path(Path::new("out"), "hllhc", 2);
        assert_eq!(path, Path::new("out/collider_hllhc_02.json"));
    }

    #[test]
    fn saved_checkpoint_loads_back_identical() {
        let dir = tempdir().unwrap();
        let path = checkpoint_path(dir.path(), "test", 0);
        let original = collider();

        save_checkpoint(&original, &path).unwrap();
        let loaded = load_checkpoint(&path).unwrap();

        assert_eq!(loaded, original);
    }

    #[test]
    fn missing_checkpoint_is_reported() {
        let dir = tempdir().unwrap();
        let err = load_checkpoint(&dir.path().join("nope.json")).unwrap_err();
        assert!(matches!(err, CheckpointError::NotFound(_)));
    }

    #[test]
    fn json_string_round_trip_keeps_element_names() {
        let original = collider();
        let json = original.to_json_string().unwrap();
        let loaded = Collider::from_json_str(&json).unwrap();
        let names: Vec<&str> = loaded
            .line("lhcb1")
            .unwrap()
            .elements()
            .iter()
            .map(|e| e.name.as_str())
            .collect();
        assert_eq!(names, vec!["ip1", "ip5"]);
        assert_eq!(loaded.knob("on_x1").unwrap(), 250.0);
    }

    #[test]
    fn unknown_format_version_is_rejected() {
        let json = r#"{"format_version": 99, "collider": {"lines": {}, "knobs": {"knobs": {}}, "beambeam": null}}"#;
        let err = JsonCheckpoint::read_from(&mut Cursor::new(json)).unwrap_err();
        assert!(matches!(
            err,
            CheckpointError::UnsupportedVersion { found: 99, .. }
        ));
    }
}
