//! Contracts of the numerical services the engine relies on.
//!
//! Optics (twiss), survey and matching are provided by an external accelerator
//! code. The engine only sees these traits; failures are passed through as
//! [`BackendError`] without retry.

use super::config::LuminosityParams;
use crate::core::models::TableError;
use crate::core::models::collider::Collider;
use crate::core::models::ids::{Beam, Ip, Plane};
use crate::core::models::survey::SurveyTable;
use crate::core::models::twiss::{TwissColumn, TwissTable};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("Optics service failed on '{line}': {message}")]
    Optics { line: String, message: String },
    #[error("Survey service failed on '{line}': {message}")]
    Survey { line: String, message: String },
    #[error("Matching job '{job}' failed: {message}")]
    Matching { job: String, message: String },
    #[error("Service not available: {0}")]
    Unsupported(&'static str),
    #[error("Exported table '{}' could not be read: {source}", path.display())]
    Table {
        path: PathBuf,
        #[source]
        source: TableError,
    },
    #[error(
        "Exported table '{}' holds the orbit at zeta0 = {found:?}, requested {requested:?}",
        path.display()
    )]
    OffsetMismatch {
        path: PathBuf,
        requested: Option<f64>,
        found: Option<f64>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TwissMethod {
    #[default]
    SixD,
    FourD,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct TwissOptions {
    pub method: TwissMethod,
    /// Longitudinal coordinate of the particle the closed orbit is computed for.
    pub zeta0: Option<f64>,
    pub freeze_longitudinal: bool,
}

impl TwissOptions {
    pub fn four_d() -> Self {
        Self {
            method: TwissMethod::FourD,
            ..Self::default()
        }
    }

    /// Four-dimensional closed orbit of an off-centre particle at `zeta0`.
    pub fn off_centre(zeta0: f64) -> Self {
        Self {
            method: TwissMethod::FourD,
            zeta0: Some(zeta0),
            freeze_longitudinal: true,
        }
    }
}

pub trait OpticsService {
    fn twiss(
        &self,
        collider: &Collider,
        beam: Beam,
        options: &TwissOptions,
    ) -> Result<TwissTable, BackendError>;
}

pub trait SurveyService {
    /// Survey of the beam's line in a frame centred on `element0`.
    fn survey(
        &self,
        collider: &Collider,
        beam: Beam,
        element0: &str,
    ) -> Result<SurveyTable, BackendError>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct Vary {
    pub knob: String,
    pub step: f64,
}

impl Vary {
    pub fn new(knob: impl Into<String>, step: f64) -> Self {
        Self {
            knob: knob.into(),
            step,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MatchTarget {
    Tune { plane: Plane, value: f64, tol: f64 },
    Chromaticity { plane: Plane, value: f64, tol: f64 },
    CouplingCMinus { value: f64, tol: f64 },
    /// Closed orbit equal to the one of `reference_line` at every monitor.
    ClosedOrbit { reference_line: String, tol: f64 },
    Luminosity {
        params: LuminosityParams,
        value: f64,
        tol: f64,
    },
    /// Separation of `n_sigma` mean beam sizes in `plane` at `ip`.
    Separation {
        ip: Ip,
        plane: Plane,
        n_sigma: f64,
        nemitt: f64,
        tol: f64,
    },
    /// Separation vector at `ip` orthogonal to the crossing vector.
    SeparationOrthogonalToCrossing { ip: Ip, tol: f64 },
    /// `column` of `beam`'s own twiss at `element` held at `value`.
    OrbitAt {
        beam: Beam,
        element: String,
        column: TwissColumn,
        value: f64,
        tol: f64,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct MatchJob {
    pub name: String,
    pub beam: Beam,
    pub vary: Vec<Vary>,
    pub targets: Vec<MatchTarget>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MatchReport {
    pub job: String,
    pub iterations: usize,
    pub penalty: f64,
    /// Final values of the varied knobs.
    pub knobs: Vec<(String, f64)>,
}

pub trait MatchingService {
    /// Adjusts the varied knobs of `job` through [`Collider::set_knob`] until the targets are met.
    fn run_match(&self, collider: &mut Collider, job: &MatchJob) -> Result<MatchReport, BackendError>;
}

/// Everything a full pipeline needs from the numerical backend.
pub trait Backend: OpticsService + SurveyService + MatchingService {}

impl<T: OpticsService + SurveyService + MatchingService> Backend for T {}

/// Optics and survey tables exported by the external code, served from a directory.
///
/// Expected files: `twiss_<line>.csv`, `twiss_<line>_zeta_plus.csv` and
/// `twiss_<line>_zeta_minus.csv` for off-centre orbits, and `survey_<line>_<element0>.csv`.
/// An off-centre table carries its offset in a `# zeta0 = ...` header line, which must
/// agree with the requested offset to a relative [`ZETA0_RTOL`]. A centred table has no
/// such line, or `zeta0 = 0`. The tables do not depend on the knob values of the collider.
#[derive(Debug, Clone)]
pub struct ExportedTables {
    twiss_dir: PathBuf,
    survey_dir: PathBuf,
}

pub const ZETA0_RTOL: f64 = 1e-9;

fn same_offset(requested: Option<f64>, found: Option<f64>) -> bool {
    match (requested.filter(|z| *z != 0.0), found.filter(|z| *z != 0.0)) {
        (None, None) => true,
        (Some(r), Some(f)) => (r - f).abs() <= ZETA0_RTOL * r.abs(),
        _ => false,
    }
}

impl ExportedTables {
    pub fn new(twiss_dir: impl Into<PathBuf>, survey_dir: impl Into<PathBuf>) -> Self {
        Self {
            twiss_dir: twiss_dir.into(),
            survey_dir: survey_dir.into(),
        }
    }

    pub fn twiss_path(&self, beam: Beam, options: &TwissOptions) -> PathBuf {
        let suffix = match options.zeta0 {
            Some(z) if z > 0.0 => "_zeta_plus",
            Some(z) if z < 0.0 => "_zeta_minus",
            _ => "",
        };
        self.twiss_dir
            .join(format!("twiss_{}{}.csv", beam.line_name(), suffix))
    }

    pub fn survey_path(&self, beam: Beam, element0: &str) -> PathBuf {
        self.survey_dir
            .join(format!("survey_{}_{}.csv", beam.line_name(), element0))
    }

    fn wrap(path: &Path, source: TableError) -> BackendError {
        BackendError::Table {
            path: path.to_path_buf(),
            source,
        }
    }
}

impl OpticsService for ExportedTables {
    fn twiss(
        &self,
        _collider: &Collider,
        beam: Beam,
        options: &TwissOptions,
    ) -> Result<TwissTable, BackendError> {
        let path = self.twiss_path(beam, options);
        let table = TwissTable::read_csv_path(&path).map_err(|e| Self::wrap(&path, e))?;
        let found = table.summary().zeta0;
        if !same_offset(options.zeta0, found) {
            return Err(BackendError::OffsetMismatch {
                path,
                requested: options.zeta0,
                found,
            });
        }
        Ok(table)
    }
}

impl SurveyService for ExportedTables {
    fn survey(
        &self,
        _collider: &Collider,
        beam: Beam,
        element0: &str,
    ) -> Result<SurveyTable, BackendError> {
        let path = self.survey_path(beam, element0);
        SurveyTable::read_csv_path(&path).map_err(|e| Self::wrap(&path, e))
    }
}
