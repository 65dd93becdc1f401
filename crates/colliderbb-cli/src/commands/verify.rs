use crate::cli::VerifyArgs;
use crate::config::build_verify_job;
use crate::error::{CliError, Result};
use crate::utils::progress::CliProgressHandler;
use colliderbb::core::io::checkpoint::load_checkpoint;
use colliderbb::engine::progress::ProgressReporter;
use colliderbb::engine::verify::verify_beambeam_configuration;
use tracing::info;

pub fn run(args: VerifyArgs) -> Result<()> {
    let job = build_verify_job(&args)?;

    info!("Loading collider from {:?}", &job.collider_path);
    let mut collider = load_checkpoint(&job.collider_path).map_err(|e| CliError::FileParsing {
        path: job.collider_path.clone(),
        source: e.into(),
    })?;

    let progress_handler = CliProgressHandler::new();
    let reporter = ProgressReporter::with_callback(progress_handler.get_callback());

    let report = reporter.phase("Verifying beam-beam lenses", || {
        verify_beambeam_configuration(&mut collider, &job.tables, &job.verify)
    })?;

    for section in &report.sections {
        println!("✓ {:<32} {:>7} comparisons", section.name, section.comparisons);
    }
    println!(
        "Beam-beam configuration verified ({} comparisons).",
        report.total_comparisons()
    );
    Ok(())
}
