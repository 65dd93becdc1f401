//! Verification harness for a collider with beam-beam interactions.
//!
//! Every check compares the model against a closed-form expectation computed from
//! the optics and survey of both beams. Checks run in a fixed order and the first
//! failed comparison aborts the run with the element and quantity at fault.

use super::backend::{OpticsService, SurveyService, TwissOptions};
use super::config::{LevelingConfig, LevelingTarget, TuningTargets, VerifyConfig};
use super::configure::{WeakStrongOptics, crab_displacement, survey_pair};
use super::error::EngineError;
use super::luminosity::{IpGeometry, luminosity_from_twiss, separation_orthogonality};
use crate::core::models::collider::{BeamBeamRecord, Collider};
use crate::core::models::ids::{Beam, EncounterKind, Ip, LensId, Plane};
use crate::core::models::knobs::BEAMBEAM_SCALE;
use crate::core::models::lens::{HeadOnLens, LongRangeLens};
use crate::core::models::survey::SurveyTable;
use crate::core::models::twiss::{TwissRow, TwissTable};
use crate::core::slicing::indexed_z_centroids;
use std::collections::BTreeMap;
use std::f64::consts::FRAC_PI_2;
use thiserror::Error;
use tracing::{debug, info, instrument};

/// Tolerance of a comparison, with `numpy.isclose` semantics.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Tolerance {
    pub atol: f64,
    pub rtol: f64,
}

impl Tolerance {
    pub const EXACT: Tolerance = Tolerance { atol: 0.0, rtol: 0.0 };

    pub const fn new(atol: f64, rtol: f64) -> Self {
        Self { atol, rtol }
    }

    pub const fn abs(atol: f64) -> Self {
        Self { atol, rtol: 0.0 }
    }

    pub const fn rel(rtol: f64) -> Self {
        Self { atol: 0.0, rtol }
    }

    /// `|actual - expected| <= atol + rtol·|expected|`.
    pub fn isclose(&self, actual: f64, expected: f64) -> bool {
        if self.atol == 0.0 && self.rtol == 0.0 {
            return actual == expected;
        }
        (actual - expected).abs() <= self.atol + self.rtol * expected.abs()
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum VerificationError {
    #[error("{element}: {quantity} = {actual:e}, expected {expected:e} (atol {atol:e}, rtol {rtol:e})")]
    Mismatch {
        element: String,
        quantity: String,
        expected: f64,
        actual: f64,
        atol: f64,
        rtol: f64,
    },
    #[error("{element}: missing from {table}")]
    Missing { element: String, table: String },
    #[error("{element}: {quantity} is {actual}, expected {expected}")]
    Count {
        element: String,
        quantity: String,
        expected: usize,
        actual: usize,
    },
    #[error("{element}: {condition}")]
    Condition { element: String, condition: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct SectionReport {
    pub name: String,
    pub comparisons: usize,
}

/// Sections run by a harness and the number of comparisons each made.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VerificationReport {
    pub sections: Vec<SectionReport>,
}

impl VerificationReport {
    pub fn total_comparisons(&self) -> usize {
        self.sections.iter().map(|s| s.comparisons).sum()
    }

    pub fn merge(&mut self, other: VerificationReport) {
        self.sections.extend(other.sections);
    }
}

/// Runs comparisons and counts them.
#[derive(Debug, Default)]
pub struct Checker {
    report: VerificationReport,
    comparisons: usize,
}

impl Checker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `checks` as a named section of the report.
    pub fn section<T, E>(
        &mut self,
        name: &str,
        checks: impl FnOnce(&mut Self) -> Result<T, E>,
    ) -> Result<T, E> {
        let before = self.comparisons;
        let result = checks(self)?;
        let comparisons = self.comparisons - before;
        debug!(section = name, comparisons, "Verification section passed.");
        self.report.sections.push(SectionReport {
            name: name.to_string(),
            comparisons,
        });
        Ok(result)
    }

    pub fn close(
        &mut self,
        element: &str,
        quantity: &str,
        actual: f64,
        expected: f64,
        tol: Tolerance,
    ) -> Result<(), VerificationError> {
        self.comparisons += 1;
        if tol.isclose(actual, expected) {
            Ok(())
        } else {
            Err(VerificationError::Mismatch {
                element: element.to_string(),
                quantity: quantity.to_string(),
                expected,
                actual,
                atol: tol.atol,
                rtol: tol.rtol,
            })
        }
    }

    pub fn exact(
        &mut self,
        element: &str,
        quantity: &str,
        actual: f64,
        expected: f64,
    ) -> Result<(), VerificationError> {
        self.close(element, quantity, actual, expected, Tolerance::EXACT)
    }

    pub fn count(
        &mut self,
        element: &str,
        quantity: &str,
        actual: usize,
        expected: usize,
    ) -> Result<(), VerificationError> {
        self.comparisons += 1;
        if actual == expected {
            Ok(())
        } else {
            Err(VerificationError::Count {
                element: element.to_string(),
                quantity: quantity.to_string(),
                expected,
                actual,
            })
        }
    }

    pub fn ensure(
        &mut self,
        element: &str,
        holds: bool,
        condition: impl FnOnce() -> String,
    ) -> Result<(), VerificationError> {
        self.comparisons += 1;
        if holds {
            Ok(())
        } else {
            Err(VerificationError::Condition {
                element: element.to_string(),
                condition: condition(),
            })
        }
    }

    /// Asserts `low < value < high`.
    pub fn within(
        &mut self,
        element: &str,
        quantity: &str,
        value: f64,
        low: f64,
        high: f64,
    ) -> Result<(), VerificationError> {
        self.ensure(element, value > low && value < high, || {
            format!("{} = {:e} outside ({:e}, {:e})", quantity, value, low, high)
        })
    }

    pub fn finish(self) -> VerificationReport {
        self.report
    }
}

fn twiss_row<'t>(table: &'t TwissTable, label: &str, name: &str) -> Result<&'t TwissRow, VerificationError> {
    table.row(name).map_err(|_| VerificationError::Missing {
        element: name.to_string(),
        table: label.to_string(),
    })
}

fn survey_xy(table: &SurveyTable, label: &str, name: &str) -> Result<(f64, f64), VerificationError> {
    table
        .row(name)
        .map(|r| (r.x, r.y))
        .map_err(|_| VerificationError::Missing {
            element: name.to_string(),
            table: label.to_string(),
        })
}

/// Signed distance from `s_ref` to `s` on a ring of length `circumference`.
fn ring_offset(s: f64, s_ref: f64, circumference: f64) -> f64 {
    let d = (s - s_ref).rem_euclid(circumference);
    if d > circumference / 2.0 { d - circumference } else { d }
}

/// Long-range lenses per line equal twice the sum of the per-side counts, head-on lenses
/// one per slice and IP.
pub fn check_lens_counts(checker: &mut Checker, collider: &Collider) -> Result<(), EngineError> {
    let record = collider.beambeam()?;
    let expected_lr: usize = record.ips.iter().map(|ip| 2 * ip.num_long_range_per_side).sum();
    let expected_ho = record.ips.len() * record.num_slices_head_on;
    for beam in Beam::ALL {
        let line = collider.beam_line(beam)?;
        checker.count(&line.name, "long-range lenses", line.lens_count(EncounterKind::LongRange), expected_lr)?;
        checker.count(&line.name, "head-on lenses", line.lens_count(EncounterKind::HeadOn), expected_ho)?;
        checker.count(&line.name, "registered lenses", record.lenses_of(beam).count(), expected_lr + expected_ho)?;
        checker.count(&line.name, "encounter records", record.encounters.for_beam(beam).len(), expected_lr + expected_ho)?;
    }
    Ok(())
}

/// Setting `beambeam_scale` reaches the `scale_strength` of every lens.
pub fn check_scale_knob(checker: &mut Checker, collider: &mut Collider) -> Result<(), EngineError> {
    for value in [1.0, 0.0] {
        collider.with_temp_knobs(&[(BEAMBEAM_SCALE, value)], |c| -> Result<(), EngineError> {
            for (id, lens) in &c.beambeam()?.lenses {
                checker.exact(&id.to_string(), "scale_strength", lens.scale_strength(), value)?;
            }
            Ok(())
        })?;
    }
    Ok(())
}

/// Tunes without beam-beam match the expected values, the lenses shift them by the
/// expected amount and leave the closed orbit untouched.
pub fn check_beambeam_tunes<B: OpticsService + ?Sized>(
    checker: &mut Checker,
    collider: &mut Collider,
    backend: &B,
    config: &VerifyConfig,
) -> Result<(), EngineError> {
    let options = TwissOptions::default();
    for beam in Beam::ALL {
        let line = beam.line_name();
        let tw_on = collider.with_temp_knobs(&[(BEAMBEAM_SCALE, 1.0)], |c| -> Result<_, EngineError> {
            Ok(backend.twiss(c, beam, &options)?)
        })?;
        let tw_off = collider.with_temp_knobs(&[(BEAMBEAM_SCALE, 0.0)], |c| -> Result<_, EngineError> {
            Ok(backend.twiss(c, beam, &options)?)
        })?;
        let (on, off) = (tw_on.summary(), tw_off.summary());

        let (qx0, qy0) = match config.bb_off_tunes(beam) {
            Some((qx, qy)) => {
                checker.close(line, "qx (beam-beam off)", off.qx, qx, Tolerance::abs(1e-4))?;
                checker.close(line, "qy (beam-beam off)", off.qy, qy, Tolerance::abs(1e-4))?;
                (qx, qy)
            }
            None => (off.qx, off.qy),
        };
        let shift = Tolerance::abs(config.tune_shift_atol);
        checker.close(line, "qx (beam-beam on)", on.qx, qx0 + config.expected_tune_shift, shift)?;
        checker.close(line, "qy (beam-beam on)", on.qy, qy0 + config.expected_tune_shift, shift)?;

        for (row_on, row_off) in tw_on.rows().iter().zip(tw_off.rows()) {
            checker.close(&row_on.name, "x (beam-beam on vs off)", row_on.x, row_off.x, Tolerance::abs(1e-10))?;
            checker.close(&row_on.name, "y (beam-beam on vs off)", row_on.y, row_off.y, Tolerance::abs(1e-10))?;
        }
    }
    Ok(())
}

fn check_long_range(
    checker: &mut Checker,
    id: LensId,
    lens: &LongRangeLens,
    ctx: &LensContext,
) -> Result<(), VerificationError> {
    let name = id.to_string();
    let partner = id.partner().to_string();
    let w = twiss_row(&ctx.optics.tw_weak, "weak twiss", &name)?;
    let s = twiss_row(&ctx.optics.tw_strong, "strong twiss", &partner)?;
    let (big_x_w, big_y_w) = survey_xy(ctx.survey_weak, "weak survey", &name)?;
    let (big_x_s, big_y_s) = survey_xy(ctx.survey_strong, "strong survey", &partner)?;

    let sigma_x = (s.betx * ctx.eps_x).sqrt();
    let sigma_y = (s.bety * ctx.eps_y).sqrt();
    checker.close(&name, "other_beam_sigma_11", lens.other_beam_sigma_11, sigma_x * sigma_x, Tolerance::rel(1e-5))?;
    checker.close(&name, "other_beam_sigma_33", lens.other_beam_sigma_33, sigma_y * sigma_y, Tolerance::rel(1e-5))?;
    checker.exact(&name, "other_beam_sigma_13", lens.other_beam_sigma_13, 0.0)?;

    checker.close(&name, "ref_shift_x", lens.ref_shift_x, w.x, Tolerance::abs(1e-4 * sigma_x))?;
    checker.close(&name, "ref_shift_y", lens.ref_shift_y, w.y, Tolerance::abs(1e-4 * sigma_y))?;
    checker.close(
        &name,
        "other_beam_shift_x",
        lens.other_beam_shift_x,
        s.x - w.x + big_x_s - big_x_w,
        Tolerance::abs(5e-4 * sigma_x),
    )?;
    checker.close(
        &name,
        "other_beam_shift_y",
        lens.other_beam_shift_y,
        s.y - w.y + big_y_s - big_y_w,
        Tolerance::abs(5e-4 * sigma_y),
    )?;

    let offset = ring_offset(w.s, ctx.s_ip, ctx.optics.tw_weak.circumference());
    let expected = ctx.bunch_spacing_ds / 2.0 * f64::from(id.index) * ctx.optics.weak.sorting(id.side);
    checker.close(&name, "s - s_ip", offset, expected, Tolerance::abs(10e-6))?;

    checker.close(
        &name,
        "other_beam_num_particles",
        lens.other_beam_num_particles,
        ctx.num_particles,
        Tolerance::rel(1e-8),
    )?;
    checker.within(&name, "min_sigma_diff", lens.min_sigma_diff, 0.0, 1e-9)?;
    checker.exact(&name, "scale_strength", lens.scale_strength, 1.0)?;
    checker.exact(&name, "other_beam_q0", lens.other_beam_q0, 1.0)?;
    Ok(())
}

fn check_head_on(
    checker: &mut Checker,
    id: LensId,
    lens: &HeadOnLens,
    z: f64,
    ctx: &LensContext,
) -> Result<(), VerificationError> {
    let name = id.to_string();
    let partner = id.partner().to_string();
    let w = twiss_row(&ctx.optics.tw_weak, "weak twiss", &name)?;
    let s = twiss_row(&ctx.optics.tw_strong, "strong twiss", &partner)?;
    let (big_x_w, big_y_w) = survey_xy(ctx.survey_weak, "weak survey", &name)?;
    let (big_x_s, big_y_s) = survey_xy(ctx.survey_strong, "strong survey", &partner)?;

    checker.count(&name, "slices of the other beam", lens.slices.len(), 1)?;
    let slice = &lens.slices[0];
    checker.exact(&name, "slice zeta_center", slice.zeta_center, 0.0)?;

    let offset = ring_offset(w.s, ctx.s_ip, ctx.optics.tw_weak.circumference());
    checker.close(&name, "s - s_ip", offset, z / 2.0, Tolerance::abs(10e-6))?;

    let (ex, ey) = (ctx.eps_x, ctx.eps_y);
    let sigma_x = (s.betx * ex).sqrt();
    let sigma_y = (s.bety * ey).sqrt();
    let sigma_px = (s.gamx * ex).sqrt();
    let sigma_py = (s.gamy * ey).sqrt();
    checker.close(&name, "Sigma_11", slice.sigma_ij(1, 1), s.betx * ex, Tolerance::rel(1e-5))?;
    checker.close(&name, "Sigma_33", slice.sigma_ij(3, 3), s.bety * ey, Tolerance::rel(1e-5))?;
    checker.close(&name, "Sigma_22", slice.sigma_ij(2, 2), s.gamx * ex, Tolerance::rel(1e-4))?;
    checker.close(&name, "Sigma_44", slice.sigma_ij(4, 4), s.gamy * ey, Tolerance::rel(1e-4))?;
    checker.close(&name, "Sigma_12", slice.sigma_ij(1, 2), -s.alfx * ex, Tolerance::new(1e-12, 5e-4))?;
    checker.close(&name, "Sigma_34", slice.sigma_ij(3, 4), -s.alfy * ey, Tolerance::new(1e-12, 5e-4))?;
    for (i, j) in [(1, 3), (1, 4), (2, 3), (2, 4)] {
        checker.exact(&name, &format!("Sigma_{}{}", i, j), slice.sigma_ij(i, j), 0.0)?;
    }

    let r = &lens.ref_shift;
    checker.close(&name, "ref_shift_x", r.x, w.x, Tolerance::abs(1e-4 * sigma_x))?;
    checker.close(&name, "ref_shift_px", r.px, w.px, Tolerance::abs(1e-4 * sigma_px))?;
    checker.close(&name, "ref_shift_y", r.y, w.y, Tolerance::abs(1e-4 * sigma_y))?;
    checker.close(&name, "ref_shift_py", r.py, w.py, Tolerance::abs(1e-4 * sigma_py))?;
    checker.close(&name, "ref_shift_zeta", r.zeta, w.zeta, Tolerance::abs(1e-9))?;
    checker.close(&name, "ref_shift_pzeta", r.pzeta, w.ptau / ctx.optics.beta0_strong, Tolerance::abs(1e-9))?;

    let circumference = ctx.optics.tw_strong.circumference();
    let shift = &lens.other_beam_shift;
    checker.close(
        &name,
        "other_beam_shift_x",
        shift.x,
        s.x - w.x + big_x_s - big_x_w
            - crab_displacement(ctx.phi_crab.0, z, circumference, ctx.harmonic_number),
        Tolerance::abs(1e-6),
    )?;
    checker.close(
        &name,
        "other_beam_shift_y",
        shift.y,
        s.y - w.y + big_y_s - big_y_w
            - crab_displacement(ctx.phi_crab.1, z, circumference, ctx.harmonic_number),
        Tolerance::abs(1e-6),
    )?;
    checker.exact(&name, "other_beam_shift_px", shift.px, 0.0)?;
    checker.exact(&name, "other_beam_shift_py", shift.py, 0.0)?;
    checker.exact(&name, "other_beam_shift_zeta", shift.zeta, 0.0)?;
    checker.exact(&name, "other_beam_shift_pzeta", shift.pzeta, 0.0)?;

    let (ip_w, ip_s) = (ctx.ip_weak, ctx.ip_strong);
    if ip_w.px.abs() < 1e-6 {
        checker.close(&name, "alpha (vertical crossing)", lens.alpha, FRAC_PI_2, Tolerance::abs(5e-3))?;
        checker.close(&name, "2 phi", 2.0 * lens.phi, ip_w.py - ip_s.py, Tolerance::abs(2e-7))?;
    } else {
        checker.close(
            &name,
            "alpha (horizontal crossing)",
            lens.alpha,
            ctx.tilt * ctx.optics.weak.sign(),
            Tolerance::abs(5e-3),
        )?;
        checker.close(&name, "2 phi", 2.0 * lens.phi, ip_w.px - ip_s.px, Tolerance::abs(2e-7))?;
    }

    checker.close(
        &name,
        "slice num_particles",
        slice.num_particles,
        ctx.num_particles / ctx.num_slices as f64,
        Tolerance::rel(1e-8),
    )?;
    checker.within(&name, "min_sigma_diff", lens.min_sigma_diff, 0.0, 1e-9)?;
    checker.within(&name, "threshold_singular", lens.threshold_singular, 0.0, 1e-27)?;
    checker.ensure(&name, !lens.flag_beamstrahlung, || "beamstrahlung is enabled".to_string())?;
    checker.exact(&name, "scale_strength", lens.scale_strength, 1.0)?;
    checker.exact(&name, "other_beam_q0", lens.other_beam_q0, 1.0)?;
    for (k, slice) in lens.slices.iter().enumerate() {
        checker.ensure(&name, slice.center.is_zero(), || {
            format!("slice {} of the other beam is not centred", k)
        })?;
    }
    Ok(())
}

struct LensContext<'a> {
    optics: &'a WeakStrongOptics,
    survey_weak: &'a SurveyTable,
    survey_strong: &'a SurveyTable,
    ip_weak: &'a TwissRow,
    ip_strong: &'a TwissRow,
    s_ip: f64,
    eps_x: f64,
    eps_y: f64,
    phi_crab: (f64, f64),
    tilt: f64,
    bunch_spacing_ds: f64,
    harmonic_number: u32,
    num_slices: usize,
    num_particles: f64,
}

/// Checks every lens seen by `optics.weak` against the optics and surveys of both beams.
///
/// Head-on lenses are checked against centroids recomputed from the record's slice
/// count and bunch length, not against the centroids stored at installation.
///
/// `surveys` holds, per IP, the weak survey and the reversed strong survey, both
/// starting from the IP.
pub fn check_weak_beam_lenses(
    checker: &mut Checker,
    record: &BeamBeamRecord,
    optics: &WeakStrongOptics,
    surveys: &BTreeMap<Ip, (SurveyTable, SurveyTable)>,
    config: &VerifyConfig,
) -> Result<(), EngineError> {
    let weak = optics.weak;
    let params = &config.beambeam;
    let slices = indexed_z_centroids(record.num_slices_head_on, record.sigma_z)?;
    let recorded: BTreeMap<LensId, f64> = record
        .encounters
        .for_beam(weak)
        .iter()
        .filter_map(|r| r.z_centroid.map(|z| (r.element_name, z)))
        .collect();

    for settings in &record.ips {
        let ip = settings.ip;
        let ip_name = ip.name();
        let (survey_weak, survey_strong) = surveys.get(&ip).ok_or_else(|| VerificationError::Missing {
            element: ip_name.clone(),
            table: "surveys".to_string(),
        })?;
        let ip_weak = twiss_row(&optics.tw_weak, "weak twiss", &ip_name)?;
        let ctx = LensContext {
            optics,
            survey_weak,
            survey_strong,
            ip_weak,
            ip_strong: twiss_row(&optics.tw_strong, "strong twiss", &ip_name)?,
            s_ip: ip_weak.s,
            eps_x: params.nemitt_x / optics.beta_gamma_strong(),
            eps_y: params.nemitt_y / optics.beta_gamma_strong(),
            phi_crab: optics.crab_angles(ip)?,
            tilt: config.crossing_tilt(ip),
            bunch_spacing_ds: optics.tw_weak.circumference() / f64::from(record.harmonic_number)
                * f64::from(record.bunch_spacing_buckets),
            harmonic_number: record.harmonic_number,
            num_slices: record.num_slices_head_on,
            num_particles: params.num_particles,
        };

        let slice_z: BTreeMap<LensId, f64> = slices
            .iter()
            .map(|&(index, z)| (LensId::head_on(ip, weak, index), z))
            .collect();

        let mut checked = 0;
        for (&id, lens) in record.lenses_of(weak).filter(|(id, _)| id.ip == ip) {
            if let Some(lr) = lens.as_long_range() {
                check_long_range(checker, id, lr, &ctx)?;
            } else if let Some(ho) = lens.as_head_on() {
                let name = id.to_string();
                let z = slice_z.get(&id).copied().ok_or_else(|| VerificationError::Missing {
                    element: name.clone(),
                    table: "slice centroids".to_string(),
                })?;
                let z_recorded = recorded.get(&id).copied().ok_or_else(|| VerificationError::Missing {
                    element: name.clone(),
                    table: "encounter records".to_string(),
                })?;
                checker.close(&name, "z_centroid", z_recorded, z, Tolerance::abs(1e-12))?;
                check_head_on(checker, id, ho, z, &ctx)?;
            }
            checked += 1;
        }
        checker.count(
            &format!("{} at {}", weak, ip),
            "checked lenses",
            checked,
            2 * settings.num_long_range_per_side + record.num_slices_head_on,
        )?;
        debug!(beam = %weak, %ip, lenses = checked, "Lenses verified.");
    }
    Ok(())
}

/// Optics quantities a beam-beam installation must leave untouched: tunes,
/// chromaticities, and beta, angle and position at every IP present in `reference`.
pub fn check_optics_unchanged(
    checker: &mut Checker,
    label: &str,
    reference: &TwissTable,
    actual: &TwissTable,
) -> Result<(), VerificationError> {
    let (r, a) = (reference.summary(), actual.summary());
    checker.close(label, "qx", a.qx, r.qx, Tolerance::abs(1e-7))?;
    checker.close(label, "qy", a.qy, r.qy, Tolerance::abs(1e-7))?;
    checker.close(label, "dqx", a.dqx, r.dqx, Tolerance::abs(1e-4))?;
    checker.close(label, "dqy", a.dqy, r.dqy, Tolerance::abs(1e-4))?;

    for ip in (1..=8).filter_map(|n| Ip::new(n).ok()) {
        let name = ip.name();
        if !reference.contains(&name) {
            continue;
        }
        let r = twiss_row(reference, "reference twiss", &name)?;
        let a = twiss_row(actual, label, &name)?;
        checker.close(&name, "betx", a.betx, r.betx, Tolerance::rel(1e-5))?;
        checker.close(&name, "bety", a.bety, r.bety, Tolerance::rel(1e-5))?;
        checker.close(&name, "px", a.px, r.px, Tolerance::rel(1e-9))?;
        checker.close(&name, "py", a.py, r.py, Tolerance::rel(1e-9))?;
        checker.close(&name, "s", a.s, r.s, Tolerance::rel(1e-10))?;
    }
    Ok(())
}

/// A collider read back from a checkpoint has the same lines, elements, knobs and
/// encounter tables as the one that was written.
pub fn check_checkpoint_integrity(
    checker: &mut Checker,
    written: &Collider,
    read: &Collider,
) -> Result<(), VerificationError> {
    checker.count("collider", "lines", read.num_lines(), written.num_lines())?;
    for name in written.line_names() {
        let before = written.line(name).map_err(|_| VerificationError::Missing {
            element: name.to_string(),
            table: "written collider".to_string(),
        })?;
        let after = read.line(name).map_err(|_| VerificationError::Missing {
            element: name.to_string(),
            table: "read collider".to_string(),
        })?;
        checker.count(name, "elements", after.elements().len(), before.elements().len())?;
        for (a, b) in after.elements().iter().zip(before.elements()) {
            checker.ensure(name, a.name == b.name, || {
                format!("element '{}' read back as '{}'", b.name, a.name)
            })?;
            checker.exact(&a.name, "s", a.s, b.s)?;
        }
    }

    checker.count("collider", "knobs", read.knobs().len(), written.knobs().len())?;
    for (name, value) in written.knobs().iter() {
        let after = read.knobs().get(name).ok_or_else(|| VerificationError::Missing {
            element: name.to_string(),
            table: "knobs".to_string(),
        })?;
        checker.exact(name, "knob value", after, value)?;
    }

    match (written.beambeam(), read.beambeam()) {
        (Ok(before), Ok(after)) => {
            for beam in Beam::ALL {
                let (b, a) = (before.encounters.for_beam(beam), after.encounters.for_beam(beam));
                checker.count(beam.direction(), "encounter records", a.len(), b.len())?;
                for (ra, rb) in a.iter().zip(b) {
                    checker.ensure(beam.direction(), ra.element_name == rb.element_name, || {
                        format!("record '{}' read back as '{}'", rb.element_name, ra.element_name)
                    })?;
                }
            }
            checker.count("collider", "lenses", after.lenses.len(), before.lenses.len())?;
            checker.ensure("collider", after == before, || "beam-beam record differs".to_string())?;
        }
        (Err(_), Err(_)) => {}
        (before, _) => {
            let written_has = before.is_ok();
            checker.ensure("collider", false, || {
                format!(
                    "beam-beam record {} after reading",
                    if written_has { "lost" } else { "appeared" }
                )
            })?;
        }
    }
    Ok(())
}

/// Tunes and chromaticities of `tw` equal the tuning targets.
pub fn check_tuning(
    checker: &mut Checker,
    tw: &TwissTable,
    label: &str,
    targets: &TuningTargets,
    tune_tol: Tolerance,
    chromaticity_tol: Tolerance,
) -> Result<(), VerificationError> {
    let s = tw.summary();
    checker.close(label, "qx", s.qx, targets.qx, tune_tol)?;
    checker.close(label, "qy", s.qy, targets.qy, tune_tol)?;
    checker.close(label, "dqx", s.dqx, targets.dqx, chromaticity_tol)?;
    checker.close(label, "dqy", s.dqy, targets.dqy, chromaticity_tol)?;
    Ok(())
}

pub fn check_coupling(
    checker: &mut Checker,
    tw: &TwissTable,
    label: &str,
    expected_c_minus: f64,
    tol: Tolerance,
) -> Result<(), VerificationError> {
    checker.close(label, "c_minus", tw.summary().c_minus, expected_c_minus, tol)
}

/// Coupling knobs of each beam act on that beam only.
///
/// Sets both coupling knobs of one beam to `strength` in turn and expects
/// `|c⁻| ≈ √2·strength` on that beam and no coupling on the other.
pub fn check_coupling_response<B: OpticsService + ?Sized>(
    checker: &mut Checker,
    collider: &mut Collider,
    backend: &B,
    knobs: &[(Beam, String, String)],
    strength: f64,
    tol: Tolerance,
) -> Result<(), EngineError> {
    let options = TwissOptions::default();
    for (driven, re, im) in knobs {
        collider.with_temp_knobs(&[(re.as_str(), strength), (im.as_str(), strength)], |c| {
            for beam in Beam::ALL {
                let tw = backend.twiss(c, beam, &options)?;
                let expected = if beam == *driven { strength * 2f64.sqrt() } else { 0.0 };
                check_coupling(checker, &tw, beam.line_name(), expected, tol)?;
            }
            Ok::<(), EngineError>(())
        })?;
    }
    Ok(())
}

/// Orbit of beam 1 at `ip` in `plane` equals `expected`, and beam 2, seen in beam 1's
/// frame, sits symmetrically on the other side.
pub fn check_ip_offset(
    checker: &mut Checker,
    tw_b1: &TwissTable,
    tw_b2: &TwissTable,
    ip: Ip,
    plane: Plane,
    expected: f64,
    tol: Tolerance,
) -> Result<(), EngineError> {
    let geometry = IpGeometry::from_twiss(tw_b1, tw_b2, ip)?;
    let (b1, b2) = match plane {
        Plane::X => (geometry.b1.x, geometry.b2.x),
        Plane::Y => (geometry.b1.y, geometry.b2.y),
    };
    let element = ip.name();
    checker.close(&element, &format!("{} of {}", plane, Beam::B1), b1, expected, tol)?;
    checker.close(&element, &format!("{} of {} (reversed)", plane, Beam::B2), b2, -expected, tol)?;
    Ok(())
}

/// Luminosity leveled at or below this relative error counts as on target.
pub const LEVELED_LUMINOSITY_RTOL: f64 = 1e-2;

/// Separations and luminosities after leveling match the leveling targets.
pub fn check_leveling(
    checker: &mut Checker,
    collider: &Collider,
    tw_b1: &TwissTable,
    tw_b2: &TwissTable,
    config: &LevelingConfig,
) -> Result<(), EngineError> {
    for leveling in &config.ips {
        let ip = leveling.ip;
        let element = ip.name();
        match &leveling.target {
            LevelingTarget::Separation {
                plane, n_sigma, knob, ..
            } => {
                let geometry = IpGeometry::from_twiss(tw_b1, tw_b2, ip)?;
                let sigma = geometry.mean_beam_size(*plane, config.nemitt(*plane));
                checker.close(
                    &element,
                    &format!("{} / 1000", knob),
                    collider.knob(knob)? / 1000.0,
                    n_sigma * sigma / 2.0,
                    Tolerance::rel(1e-3),
                )?;
                checker.close(
                    &element,
                    "normalized separation",
                    geometry.separation(*plane).abs() / sigma,
                    *n_sigma,
                    Tolerance::rel(1e-3),
                )?;
            }
            LevelingTarget::Luminosity { value, .. } => {
                let params = config.luminosity_params(ip)?;
                let luminosity = luminosity_from_twiss(&params, tw_b1, tw_b2)?;
                checker.close(&element, "luminosity", luminosity, *value, Tolerance::rel(LEVELED_LUMINOSITY_RTOL))?;
            }
            LevelingTarget::MatchedLuminosity { value, .. } => {
                let params = config.luminosity_params(ip)?;
                let luminosity = luminosity_from_twiss(&params, tw_b1, tw_b2)?;
                checker.close(&element, "luminosity", luminosity, *value, Tolerance::rel(LEVELED_LUMINOSITY_RTOL))?;
                check_separation_orthogonality(checker, tw_b1, tw_b2, ip, 1e-6)?;
            }
        }
    }
    Ok(())
}

/// The separation vector at `ip` is orthogonal to the crossing plane.
pub fn check_separation_orthogonality(
    checker: &mut Checker,
    tw_b1: &TwissTable,
    tw_b2: &TwissTable,
    ip: Ip,
    atol: f64,
) -> Result<(), EngineError> {
    let cosine = separation_orthogonality(tw_b1, tw_b2, ip)?;
    checker.close(&ip.name(), "cos(crossing, separation)", cosine, 0.0, Tolerance::abs(atol))?;
    Ok(())
}

/// Full check of a configured collider: lens counts, scale knob, tune shifts and every lens.
#[instrument(skip_all, name = "verify_beambeam")]
pub fn verify_beambeam_configuration<B>(
    collider: &mut Collider,
    backend: &B,
    config: &VerifyConfig,
) -> Result<VerificationReport, EngineError>
where
    B: OpticsService + SurveyService + ?Sized,
{
    config.beambeam.validate()?;
    let mut checker = Checker::new();
    checker.section("lens counts", |c| check_lens_counts(c, collider))?;
    checker.section("scale knob", |c| check_scale_knob(c, collider))?;
    if config.check_tunes {
        checker.section("beam-beam tunes", |c| check_beambeam_tunes(c, collider, backend, config))?;
    } else {
        debug!("Tune check skipped.");
    }

    let record = collider.beambeam()?.clone();
    for weak in Beam::ALL {
        let optics = WeakStrongOptics::collect(collider, backend, weak, config.beambeam.crab_zeta_offset)?;
        let mut surveys = BTreeMap::new();
        for settings in &record.ips {
            surveys.insert(settings.ip, survey_pair(collider, backend, weak, settings.ip)?);
        }
        checker.section(&format!("lenses seen by {}", weak), |c| {
            check_weak_beam_lenses(c, &record, &optics, &surveys, config)
        })?;
    }

    let report = checker.finish();
    info!(
        sections = report.sections.len(),
        comparisons = report.total_comparisons(),
        "Beam-beam configuration verified."
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::models::ids::Side;
    use crate::core::models::knobs::Provenance;
    use crate::core::models::lens::BeamBeamLens;
    use crate::engine::config::{BeamBeamInstallConfig, BeamBeamParams, TuningKnobs};
    use crate::engine::configure::configure_beambeam_interactions;
    use crate::engine::install::install_beambeam_interactions;
    use crate::engine::progress::ProgressReporter;
    use crate::engine::testing::{IP8_TILT, SyntheticBackend, bb_off_tunes, hllhc_install_config, synthetic_collider};

    fn params() -> BeamBeamParams {
        BeamBeamParams::new(2.2e11, 2e-6, 3e-6)
    }

    fn verify_config() -> VerifyConfig {
        let mut config = VerifyConfig::new(params());
        config.crossing_tilts = vec![(Ip::IP8, IP8_TILT)];
        config.bb_off_tunes = Beam::ALL
            .iter()
            .map(|&b| {
                let (qx, qy) = bb_off_tunes(b);
                (b, qx, qy)
            })
            .collect();
        config
    }

    fn configured() -> Collider {
        configured_with(&hllhc_install_config(), |_| {})
    }

    /// Installs with `install`, lets `adjust` alter the model, then configures the lenses.
    fn configured_with(install: &BeamBeamInstallConfig, adjust: impl FnOnce(&mut Collider)) -> Collider {
        let mut collider = synthetic_collider();
        let backend = SyntheticBackend::new();
        for (k, v) in [
            ("on_x1", 250.0),
            ("on_x2", 170.0),
            ("on_x5", 250.0),
            ("on_x8", -200.0),
            ("on_sep2", 0.138),
            ("on_sep8", -0.043),
            ("on_crab1", -190.0),
            ("on_crab5", -190.0),
        ] {
            collider.set_knob(k, v, Provenance::Settings).unwrap();
        }
        // Tune the bare machine to the reference tunes.
        for beam in Beam::ALL {
            let k = TuningKnobs::for_beam(beam);
            let (qx, qy) = bb_off_tunes(beam);
            let (q0x, q0y) = match beam {
                Beam::B1 => (62.29, 60.30),
                Beam::B2 => (62.295, 60.305),
            };
            // qx = q0x + q1 + 0.2 q2, qy = q0y - 0.2 q1 - q2
            let (a, b) = (qx - q0x, qy - q0y);
            let q2 = -(b + 0.2 * a) / (1.0 - 0.04);
            let q1 = a - 0.2 * q2;
            collider.set_knob(&k.q_knob_1, q1, Provenance::Settings).unwrap();
            collider.set_knob(&k.q_knob_2, q2, Provenance::Settings).unwrap();
        }
        let reporter = ProgressReporter::new();
        install_beambeam_interactions(&mut collider, install, &reporter).unwrap();
        adjust(&mut collider);
        configure_beambeam_interactions(&mut collider, &backend, &params(), &reporter).unwrap();
        collider
    }

    #[test]
    fn isclose_follows_absolute_plus_relative_bound() {
        let tol = Tolerance::new(1e-3, 1e-2);
        assert!(tol.isclose(1.0105, 1.0));
        assert!(!tol.isclose(1.0115, 1.0));
        assert!(Tolerance::EXACT.isclose(0.25, 0.25));
        assert!(!Tolerance::EXACT.isclose(0.25, 0.25 + f64::EPSILON));
    }

    #[test]
    fn checker_reports_first_mismatch_with_context() {
        let mut checker = Checker::new();
        checker.close("bb_lr.l1b1_01", "ref_shift_x", 1.0, 1.0, Tolerance::abs(1e-9)).unwrap();
        let err = checker
            .close("bb_lr.l1b1_02", "ref_shift_y", 2.0, 1.0, Tolerance::abs(1e-9))
            .unwrap_err();
        assert!(matches!(
            &err,
            VerificationError::Mismatch { element, quantity, .. }
                if element == "bb_lr.l1b1_02" && quantity == "ref_shift_y"
        ));
        assert!(err.to_string().starts_with("bb_lr.l1b1_02: ref_shift_y"));
    }

    #[test]
    fn sections_count_their_comparisons() {
        let mut checker = Checker::new();
        checker
            .section("a", |c| -> Result<(), VerificationError> {
                c.exact("e", "q", 1.0, 1.0)?;
                c.count("e", "n", 3, 3)
            })
            .unwrap();
        checker
            .section("b", |c| c.within("e", "w", 0.5, 0.0, 1.0))
            .unwrap();
        let report = checker.finish();
        assert_eq!(report.sections.len(), 2);
        assert_eq!(report.sections[0].comparisons, 2);
        assert_eq!(report.total_comparisons(), 3);
    }

    #[test]
    fn configured_collider_passes_full_verification() {
        let mut collider = configured();
        let report =
            verify_beambeam_configuration(&mut collider, &SyntheticBackend::new(), &verify_config()).unwrap();
        assert_eq!(report.sections.len(), 5);
        assert!(report.total_comparisons() > 2 * 224 * 10);
        assert_eq!(collider.knob(BEAMBEAM_SCALE).unwrap(), 1.0);
    }

    #[test]
    fn tampered_lens_is_reported_by_name() {
        let mut collider = configured();
        let id = LensId::long_range(Ip::IP5, Side::Left, Beam::B2, 3);
        if let BeamBeamLens::LongRange(lens) = collider.lens_mut(id).unwrap() {
            lens.other_beam_sigma_11 *= 1.01;
        }
        let err =
            verify_beambeam_configuration(&mut collider, &SyntheticBackend::new(), &verify_config()).unwrap_err();
        match err {
            EngineError::Verification(VerificationError::Mismatch { element, quantity, .. }) => {
                assert_eq!(element, "bb_lr.l5b2_03");
                assert_eq!(quantity, "other_beam_sigma_11");
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn head_on_lenses_are_checked_against_recomputed_slices() {
        let long_bunch = BeamBeamInstallConfig::builder()
            .ips(vec![Ip::IP1, Ip::IP2, Ip::IP5, Ip::IP8])
            .delay_at_ips_slots(vec![0, 891, 0, 2670])
            .num_long_range_encounters_per_side(vec![25, 20, 25, 20])
            .num_slices_head_on(11)
            .harmonic_number(35640)
            .bunch_spacing_buckets(10)
            .sigma_z(0.3)
            .build()
            .unwrap();
        // Lenses placed for a 0.3 m bunch, record claiming the nominal 0.076 m.
        let mut collider = configured_with(&long_bunch, |c| {
            c.beambeam_mut().unwrap().sigma_z = 0.076;
        });

        let err =
            verify_beambeam_configuration(&mut collider, &SyntheticBackend::new(), &verify_config()).unwrap_err();
        match err {
            EngineError::Verification(VerificationError::Mismatch { element, quantity, .. }) => {
                assert!(element.starts_with("bb_ho."), "{}", element);
                assert_eq!(quantity, "z_centroid");
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn altered_encounter_centroid_is_reported_by_lens() {
        let id = LensId::head_on(Ip::IP5, Beam::B1, 3);
        let mut collider = configured_with(&hllhc_install_config(), |c| {
            let record = c.beambeam_mut().unwrap();
            for r in record.encounters.for_beam_mut(Beam::B1) {
                if r.element_name == id {
                    r.z_centroid = r.z_centroid.map(|z| z * 4.0);
                }
            }
        });

        let err =
            verify_beambeam_configuration(&mut collider, &SyntheticBackend::new(), &verify_config()).unwrap_err();
        assert!(matches!(
            err,
            EngineError::Verification(VerificationError::Mismatch { ref element, ref quantity, .. })
                if *element == id.to_string() && quantity == "z_centroid"
        ));
    }

    #[test]
    fn unconfigured_lenses_fail_intensity_check() {
        let mut collider = synthetic_collider();
        collider.set_knob("on_x2", 170.0, Provenance::Settings).unwrap();
        install_beambeam_interactions(&mut collider, &hllhc_install_config(), &ProgressReporter::new()).unwrap();
        let mut checker = Checker::new();
        check_lens_counts(&mut checker, &collider).unwrap();
        check_scale_knob(&mut checker, &mut collider).unwrap();

        let record = collider.beambeam().unwrap().clone();
        let backend = SyntheticBackend::new();
        let optics = WeakStrongOptics::collect(&mut collider, &backend, Beam::B1, 1e-2).unwrap();
        let surveys = record
            .ips
            .iter()
            .map(|s| (s.ip, survey_pair(&collider, &backend, Beam::B1, s.ip).unwrap()))
            .collect();
        assert!(matches!(
            check_weak_beam_lenses(&mut checker, &record, &optics, &surveys, &verify_config()),
            Err(EngineError::Verification(VerificationError::Mismatch { .. }))
        ));
    }

    #[test]
    fn checkpoint_round_trip_keeps_integrity() {
        let collider = configured();
        let read = Collider::from_json_str(&collider.to_json_string().unwrap()).unwrap();
        let mut checker = Checker::new();
        check_checkpoint_integrity(&mut checker, &collider, &read).unwrap();

        let mut altered = read.clone();
        altered.take_beambeam();
        assert!(matches!(
            check_checkpoint_integrity(&mut Checker::new(), &collider, &altered),
            Err(VerificationError::Condition { .. })
        ));
    }

    #[test]
    fn installation_leaves_optics_unchanged() {
        let backend = SyntheticBackend::new();
        let mut reference = synthetic_collider();
        for (k, v) in [("on_x1", 250.0), ("on_x5", -200.0)] {
            reference.set_knob(k, v, Provenance::Settings).unwrap();
        }
        let mut installed = reference.clone();
        install_beambeam_interactions(&mut installed, &hllhc_install_config(), &ProgressReporter::new()).unwrap();

        let mut checker = Checker::new();
        for beam in Beam::ALL {
            let tw0 = backend.twiss(&reference, beam, &TwissOptions::four_d()).unwrap();
            let tw1 = backend.twiss(&installed, beam, &TwissOptions::four_d()).unwrap();
            check_optics_unchanged(&mut checker, beam.line_name(), &tw0, &tw1).unwrap();
        }
        assert_eq!(checker.finish().total_comparisons(), 2 * (4 + 8 * 5));
    }

    #[test]
    fn coupling_knobs_act_on_their_own_beam() {
        let mut collider = synthetic_collider();
        let knobs: Vec<(Beam, String, String)> = Beam::ALL
            .iter()
            .map(|&b| (b, format!("c_minus_re_b{}", b.digit()), format!("c_minus_im_b{}", b.digit())))
            .collect();
        let mut checker = Checker::new();
        check_coupling_response(
            &mut checker,
            &mut collider,
            &SyntheticBackend::new(),
            &knobs,
            1e-3,
            Tolerance::abs(2e-4),
        )
        .unwrap();
        assert_eq!(collider.knob("c_minus_re_b1").unwrap(), 0.0);
    }

    #[test]
    fn separation_orthogonal_to_crossing() {
        let mut collider = synthetic_collider();
        collider.set_knob("on_x8", 200.0, Provenance::Settings).unwrap();
        collider.set_knob("on_sep8", 0.05, Provenance::Settings).unwrap();
        collider.set_knob("on_x2", 170.0, Provenance::Settings).unwrap();
        collider.set_knob("on_sep2", 0.1, Provenance::Settings).unwrap();
        let backend = SyntheticBackend::new();
        let tw_b1 = backend.twiss(&collider, Beam::B1, &TwissOptions::default()).unwrap();
        let tw_b2 = backend.twiss(&collider, Beam::B2, &TwissOptions::default()).unwrap();

        let mut checker = Checker::new();
        check_separation_orthogonality(&mut checker, &tw_b1, &tw_b2, Ip::IP2, 1e-6).unwrap();
        check_ip_offset(&mut checker, &tw_b1, &tw_b2, Ip::IP2, Plane::X, 0.1e-3, Tolerance::abs(1e-12)).unwrap();
        // The tilted crossing at ip8 is not orthogonal to a purely vertical separation.
        assert!(check_separation_orthogonality(&mut checker, &tw_b1, &tw_b2, Ip::IP8, 1e-6).is_err());
    }
}
