use crate::cli::LuminosityArgs;
use crate::config::build_luminosity_params;
use crate::error::{CliError, Result};
use colliderbb::core::models::ids::Plane;
use colliderbb::core::models::twiss::TwissTable;
use colliderbb::engine::error::EngineError;
use colliderbb::engine::luminosity::{IpGeometry, luminosity_from_twiss, normalized_separation};
use std::path::Path;
use tracing::info;

#[derive(Debug)]
struct LuminosityReport {
    luminosity: f64,
    separation_sigma: (f64, f64),
    crossing_angle: (f64, f64),
}

fn read_twiss(path: &Path) -> Result<TwissTable> {
    info!("Loading twiss table from {:?}", path);
    TwissTable::read_csv_path(path).map_err(|e| CliError::FileParsing {
        path: path.to_path_buf(),
        source: e.into(),
    })
}

fn evaluate(args: &LuminosityArgs) -> Result<LuminosityReport> {
    let params = build_luminosity_params(args)?;
    let tw_b1 = read_twiss(&args.twiss_b1)?;
    let tw_b2 = read_twiss(&args.twiss_b2)?;

    let geometry = IpGeometry::from_twiss(&tw_b1, &tw_b2, params.ip).map_err(EngineError::from)?;
    Ok(LuminosityReport {
        luminosity: luminosity_from_twiss(&params, &tw_b1, &tw_b2)?,
        separation_sigma: (
            normalized_separation(&tw_b1, &tw_b2, params.ip, Plane::X, params.nemitt_x)?,
            normalized_separation(&tw_b1, &tw_b2, params.ip, Plane::Y, params.nemitt_y)?,
        ),
        crossing_angle: (
            geometry.crossing_angle(Plane::X),
            geometry.crossing_angle(Plane::Y),
        ),
    })
}

pub fn run(args: LuminosityArgs) -> Result<()> {
    let report = evaluate(&args)?;
    println!("{}", args.ip);
    println!(
        "  luminosity        {:.4e} m^-2 s^-1 ({:.4e} cm^-2 s^-1)",
        report.luminosity,
        report.luminosity * 1e-4
    );
    println!(
        "  separation        {:.3} sigma (x), {:.3} sigma (y)",
        report.separation_sigma.0, report.separation_sigma.1
    );
    println!(
        "  full crossing     {:.3} urad (x), {:.3} urad (y)",
        report.crossing_angle.0 * 1e6,
        report.crossing_angle.1 * 1e6
    );
    Ok(())
}
