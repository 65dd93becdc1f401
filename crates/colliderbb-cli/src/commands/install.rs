use crate::cli::InstallArgs;
use crate::config::{InstallJob, build_install_job};
use crate::error::{CliError, Result};
use crate::utils::progress::CliProgressHandler;
use colliderbb::core::io::checkpoint::{load_checkpoint, save_checkpoint};
use colliderbb::engine::error::EngineError;
use colliderbb::engine::install::{InstallSummary, install_beambeam_interactions};
use colliderbb::engine::progress::ProgressReporter;
use tracing::info;

fn install(job: &InstallJob, reporter: &ProgressReporter) -> Result<InstallSummary> {
    info!("Loading collider from {:?}", &job.input_path);
    let mut collider = load_checkpoint(&job.input_path).map_err(|e| CliError::FileParsing {
        path: job.input_path.clone(),
        source: e.into(),
    })?;

    let summary = install_beambeam_interactions(&mut collider, &job.install, reporter)?;

    info!("Writing collider to {:?}", &job.output_path);
    save_checkpoint(&collider, &job.output_path).map_err(EngineError::from)?;
    Ok(summary)
}

pub fn run(args: InstallArgs) -> Result<()> {
    info!("Merging configuration from file and CLI arguments...");
    let job = build_install_job(&args)?;

    let progress_handler = CliProgressHandler::new();
    let reporter = ProgressReporter::with_callback(progress_handler.get_callback());

    let summary = install(&job, &reporter)?;
    println!(
        "Installed {} long-range and {} head-on lenses per line at {} IPs.",
        summary.long_range_per_line,
        summary.head_on_per_line,
        job.install.ips.len()
    );
    println!("Collider written to: {}", job.output_path.display());
    Ok(())
}
