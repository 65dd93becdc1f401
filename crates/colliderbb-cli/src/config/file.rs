use crate::error::{CliError, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::debug;

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct FileConfig {
    pub install: Option<FileInstallConfig>,
    pub beam_beam: Option<FileBeamBeamConfig>,
    pub luminosity: Option<FileLuminosityConfig>,
    pub verify: Option<FileVerifyConfig>,
}

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct FileInstallConfig {
    pub ips: Option<Vec<String>>,
    pub delay_at_ips_slots: Option<Vec<u32>>,
    pub num_long_range_encounters_per_side: Option<Vec<usize>>,
    pub num_slices_head_on: Option<usize>,
    pub harmonic_number: Option<u32>,
    pub bunch_spacing_buckets: Option<u32>,
    pub sigma_z: Option<f64>,
}

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct FileBeamBeamConfig {
    pub num_particles: Option<f64>,
    pub nemitt_x: Option<f64>,
    pub nemitt_y: Option<f64>,
    pub crab_zeta_offset: Option<f64>,
    pub min_sigma_diff: Option<f64>,
    pub threshold_singular: Option<f64>,
}

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct FileLuminosityConfig {
    /// Colliding bunch pairs keyed by IP name.
    pub num_colliding_bunches: Option<BTreeMap<String, u32>>,
    pub num_particles_per_bunch: Option<f64>,
    pub nemitt_x: Option<f64>,
    pub nemitt_y: Option<f64>,
    pub sigma_z: Option<f64>,
    pub crab: Option<bool>,
}

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct FileVerifyConfig {
    pub expected_tune_shift: Option<f64>,
    pub tune_shift_atol: Option<f64>,
    /// Crossing-plane tilts keyed by IP name.
    pub crossing_tilts: Option<BTreeMap<String, f64>>,
    /// `[qx, qy]` without beam-beam, keyed by line name.
    pub bb_off_tunes: Option<BTreeMap<String, [f64; 2]>>,
    pub check_tunes: Option<bool>,
}

impl FileConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        debug!("Reading configuration file {:?}", path);
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| CliError::FileParsing {
            path: path.to_path_buf(),
            source: e.into(),
        })
    }

    pub fn from_optional_file(path: Option<&Path>) -> Result<Self> {
        path.map_or_else(|| Ok(Self::default()), Self::from_file)
    }
}
