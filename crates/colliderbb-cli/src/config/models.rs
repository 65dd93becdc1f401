use colliderbb::engine::backend::ExportedTables;
use colliderbb::engine::config as core_config;
use std::path::PathBuf;

pub struct InstallJob {
    pub input_path: PathBuf,
    pub output_path: PathBuf,
    pub install: core_config::BeamBeamInstallConfig,
}

pub struct VerifyJob {
    pub collider_path: PathBuf,
    pub tables: ExportedTables,
    pub verify: core_config::VerifyConfig,
}
