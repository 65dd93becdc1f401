mod builder;
mod defaults;
mod file;
mod models;

pub use builder::{build_install_job, build_luminosity_params, build_verify_job};
pub use models::InstallJob;
