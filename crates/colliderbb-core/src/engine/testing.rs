//! Synthetic optics, survey and matching services for tests.
//!
//! Compiled for the crate's own tests and, with the `testing` feature, for dependent
//! crates. The machine is a ring with eight interaction points. Around each IP the optics
//! is a drift with `β(Δs) = β* + Δs²/β*`, and the closed orbit is a straight line
//! set by the crossing (`on_xN`, µrad) and separation (`on_sepN`, `on_sepNh`,
//! `on_sepNv`, mm) knobs. A `crossing_leakN` error knob (µrad per mm) turns each beam's
//! offset at the IP into an angle, which the `corr_co_acbhN.bB` and `corr_co_acbvN.bB`
//! corrector knobs (µrad) can cancel. Tunes, chromaticities and coupling respond
//! linearly to the tuning knobs, and configured head-on lenses shift the tunes in
//! proportion to their charge.

use super::backend::{
    BackendError, MatchJob, MatchReport, MatchTarget, MatchingService, OpticsService,
    SurveyService, TwissOptions,
};
use super::config::{BeamBeamInstallConfig, TuningKnobs};
use super::luminosity::{IpGeometry, luminosity_from_twiss, separation_orthogonality};
use crate::core::models::collider::{Collider, IpEncounters};
use crate::core::models::ids::{Beam, Ip, Plane};
use crate::core::models::knobs::Provenance;
use crate::core::models::line::{Element, Line, ReferenceParticle};
use crate::core::models::survey::{SurveyRow, SurveyTable};
use crate::core::models::twiss::{TwissRow, TwissSummary, TwissTable};
use nalgebra::{DMatrix, DVector};

pub const CIRCUMFERENCE: f64 = 26658.8832;
pub const IP8_TILT: f64 = -15e-3;
/// Tune shift of one fully charged head-on IP.
pub const HEAD_ON_TUNE_SHIFT_PER_IP: f64 = -3.75e-3;
pub const NOMINAL_NUM_PARTICLES: f64 = 2.2e11;

pub fn ip_position_b1(ip: Ip) -> f64 {
    f64::from(ip.number() - 1) * CIRCUMFERENCE / 8.0
}

fn beta_star(ip: Ip) -> f64 {
    match ip.number() {
        1 | 5 => 0.15,
        2 => 10.0,
        8 => 1.5,
        _ => 100.0,
    }
}

fn all_ips() -> impl Iterator<Item = Ip> {
    (1..=8).filter_map(|n| Ip::new(n).ok())
}

/// Position of `s` measured in `beam`'s own line, seen from beam 1.
fn to_b1_frame(beam: Beam, s: f64) -> f64 {
    match beam {
        Beam::B1 => s,
        Beam::B2 => (CIRCUMFERENCE - s).rem_euclid(CIRCUMFERENCE),
    }
}

fn signed_distance(s: f64, s_ref: f64) -> f64 {
    let d = (s - s_ref).rem_euclid(CIRCUMFERENCE);
    if d > CIRCUMFERENCE / 2.0 { d - CIRCUMFERENCE } else { d }
}

fn nearest_ip(s_b1: f64) -> (Ip, f64) {
    all_ips()
        .map(|ip| (ip, signed_distance(s_b1, ip_position_b1(ip))))
        .fold((Ip::IP1, f64::INFINITY), |best, cur| {
            if cur.1.abs() < best.1.abs() { cur } else { best }
        })
}

fn knob(collider: &Collider, name: &str) -> f64 {
    collider.knobs().get(name).unwrap_or(0.0)
}

/// Half crossing angles and half separations of beam 1 at `ip`.
fn ip_orbit(collider: &Collider, ip: Ip) -> (f64, f64, f64, f64) {
    let n = ip.number();
    let theta = knob(collider, &format!("on_x{}", n)) * 1e-6;
    let sep = knob(collider, &format!("on_sep{}", n)) * 1e-3;
    let sep_h = knob(collider, &format!("on_sep{}h", n)) * 1e-3;
    let sep_v = knob(collider, &format!("on_sep{}v", n)) * 1e-3;
    let (tx, ty, dx, dy) = match n {
        1 | 2 => (0.0, theta, sep, 0.0),
        5 => (theta, 0.0, 0.0, sep),
        8 => (theta * IP8_TILT.cos(), theta * IP8_TILT.sin(), 0.0, sep),
        _ => (0.0, 0.0, 0.0, 0.0),
    };
    (tx, ty, dx + sep_h, dy + sep_v)
}

/// Angle added to `beam`'s own orbit at `ip` by the leak of its offset `(x, y)` and
/// by the correctors.
fn ip_kick(collider: &Collider, beam: Beam, ip: Ip, x: f64, y: f64) -> (f64, f64) {
    let (n, b) = (ip.number(), beam.digit());
    let leak = knob(collider, &format!("crossing_leak{}", n)) * 1e-3;
    (
        leak * x + knob(collider, &format!("corr_co_acbh{}.b{}", n, b)) * 1e-6,
        leak * y + knob(collider, &format!("corr_co_acbv{}.b{}", n, b)) * 1e-6,
    )
}

fn base_tunes(beam: Beam) -> (f64, f64) {
    match beam {
        Beam::B1 => (62.29, 60.30),
        Beam::B2 => (62.295, 60.305),
    }
}

pub fn bb_off_tunes(beam: Beam) -> (f64, f64) {
    match beam {
        Beam::B1 => (62.31, 60.32),
        Beam::B2 => (62.315, 60.325),
    }
}

/// Four lines with markers at the IPs and a quadrupole on each side.
pub fn synthetic_collider() -> Collider {
    let mut collider = Collider::new();
    for beam in Beam::ALL {
        for name in [beam.line_name(), beam.co_ref_line_name()] {
            let mut line = Line::new(name, ReferenceParticle::proton(7000.0), CIRCUMFERENCE);
            for ip in all_ips() {
                let s = to_b1_frame(beam, ip_position_b1(ip));
                line.insert(Element::marker(ip.name(), s));
                line.insert(Element::magnet(format!("mqx.l{}", ip.number()), line.wrap_s(s - 30.0)));
                line.insert(Element::magnet(format!("mqx.r{}", ip.number()), line.wrap_s(s + 30.0)));
            }
            collider.add_line(line);
        }
    }

    let mut model_knobs: Vec<String> = Vec::new();
    for n in [1, 2, 5, 8] {
        model_knobs.push(format!("on_x{}", n));
        model_knobs.push(format!("on_sep{}", n));
        model_knobs.push(format!("on_crab{}", n));
    }
    model_knobs.extend(["on_sep8h".to_string(), "on_sep8v".to_string()]);
    for n in [2, 8] {
        for b in [1, 2] {
            model_knobs.push(format!("corr_co_acbh{}.b{}", n, b));
            model_knobs.push(format!("corr_co_acbv{}.b{}", n, b));
        }
    }
    for beam in Beam::ALL {
        let k = TuningKnobs::for_beam(beam);
        model_knobs.extend([
            k.q_knob_1, k.q_knob_2, k.dq_knob_1, k.dq_knob_2, k.c_minus_knob_1, k.c_minus_knob_2,
        ]);
        model_knobs.push(format!("orbit_error_b{}", beam.digit()));
        model_knobs.push(format!("corr_co_h.b{}", beam.digit()));
    }
    for name in model_knobs {
        let _ = collider.set_knob(&name, 0.0, Provenance::Model);
    }
    collider
}

pub fn hllhc_install_config() -> BeamBeamInstallConfig {
    let ips = [(1, 0, 25), (2, 891, 20), (5, 0, 25), (8, 2670, 20)]
        .into_iter()
        .filter_map(|(n, delay_in_slots, num_long_range_per_side)| {
            Ip::new(n).ok().map(|ip| IpEncounters {
                ip,
                num_long_range_per_side,
                delay_in_slots,
            })
        })
        .collect();
    BeamBeamInstallConfig {
        ips,
        num_slices_head_on: 11,
        harmonic_number: 35640,
        bunch_spacing_buckets: 10,
        sigma_z: 0.076,
    }
}

#[derive(Debug, Default)]
pub struct SyntheticBackend {
    pub max_iterations: usize,
}

impl SyntheticBackend {
    pub fn new() -> Self {
        Self { max_iterations: 25 }
    }

    fn twiss_line(
        &self,
        collider: &Collider,
        line_name: &str,
        beam: Beam,
        options: &TwissOptions,
    ) -> Result<TwissTable, BackendError> {
        let line = collider.line(line_name).map_err(|e| BackendError::Optics {
            line: line_name.to_string(),
            message: e.to_string(),
        })?;
        let is_reference = line_name == beam.co_ref_line_name();
        let b = beam.digit();
        let orbit_offset = if is_reference {
            0.0
        } else {
            knob(collider, &format!("orbit_error_b{}", b)) + knob(collider, &format!("corr_co_h.b{}", b))
        };
        let zeta0 = options.zeta0.unwrap_or(0.0);

        let rows = line
            .elements()
            .iter()
            .map(|element| {
                let s_b1 = to_b1_frame(beam, element.s);
                let (ip, delta_b1) = nearest_ip(s_b1);
                let delta = match beam {
                    Beam::B1 => delta_b1,
                    Beam::B2 => -delta_b1,
                };
                let (tx, ty, dx, dy) = ip_orbit(collider, ip);
                let crab = knob(collider, &format!("on_crab{}", ip.number())) * 1e-6 * zeta0;

                let (x0, px, y0, py) = match beam {
                    Beam::B1 => (dx, tx, dy, ty),
                    Beam::B2 => (dx, -tx, -dy, ty),
                };
                let (kx, ky) = ip_kick(collider, beam, ip, x0, y0);
                let (px, py) = (px + kx, py + ky);
                let (x, y) = (x0 + px * delta + crab, y0 + py * delta);

                let bstar = beta_star(ip);
                let betx = bstar + delta * delta / bstar;
                let alfx = -delta / bstar;
                TwissRow {
                    name: element.name.clone(),
                    s: element.s,
                    x: x + orbit_offset,
                    px,
                    y,
                    py,
                    zeta: zeta0,
                    ptau: 0.0,
                    betx,
                    bety: betx,
                    alfx,
                    alfy: alfx,
                    gamx: (1.0 + alfx * alfx) / betx,
                    gamy: (1.0 + alfx * alfx) / betx,
                    dx: 0.0,
                    dy: 0.0,
                }
            })
            .collect();

        let k = TuningKnobs::for_beam(beam);
        let (q1, q2) = (knob(collider, &k.q_knob_1), knob(collider, &k.q_knob_2));
        let (s1, s2) = (knob(collider, &k.dq_knob_1), knob(collider, &k.dq_knob_2));
        let (c_re, c_im) = (
            knob(collider, &k.c_minus_knob_1),
            knob(collider, &k.c_minus_knob_2),
        );

        let bb_shift = collider
            .beambeam()
            .map(|bb| {
                bb.lenses_of(beam)
                    .filter_map(|(_, lens)| lens.as_head_on())
                    .map(|lens| {
                        let charge: f64 = lens.slices.iter().map(|s| s.num_particles).sum();
                        HEAD_ON_TUNE_SHIFT_PER_IP * lens.scale_strength * charge
                            / NOMINAL_NUM_PARTICLES
                    })
                    .sum::<f64>()
            })
            .unwrap_or(0.0);

        let (qx0, qy0) = base_tunes(beam);
        let summary = TwissSummary {
            qx: qx0 + q1 + 0.2 * q2 + bb_shift,
            qy: qy0 - 0.2 * q1 - q2 + bb_shift,
            dqx: 2.0 + 10.0 * s1 + s2,
            dqy: 2.0 - s1 - 10.0 * s2,
            c_minus: c_re.hypot(c_im),
            circumference: line.length,
            beta0: line.reference.beta0,
            gamma0: line.reference.gamma0,
            zeta0: options.zeta0,
        };
        Ok(TwissTable::new(summary, rows))
    }

    fn residuals(&self, collider: &Collider, job: &MatchJob) -> Result<Vec<f64>, BackendError> {
        let options = TwissOptions::default();
        let tw = self.twiss(collider, job.beam, &options)?;
        let mut residuals = Vec::new();
        for target in &job.targets {
            match target {
                MatchTarget::Tune { plane, value, tol } => {
                    let q = match plane {
                        Plane::X => tw.summary().qx,
                        Plane::Y => tw.summary().qy,
                    };
                    residuals.push((q - value) / tol);
                }
                MatchTarget::Chromaticity { plane, value, tol } => {
                    let dq = match plane {
                        Plane::X => tw.summary().dqx,
                        Plane::Y => tw.summary().dqy,
                    };
                    residuals.push((dq - value) / tol);
                }
                MatchTarget::CouplingCMinus { value, tol } => {
                    residuals.push((tw.summary().c_minus - value) / tol);
                }
                MatchTarget::ClosedOrbit {
                    reference_line,
                    tol,
                } => {
                    let reference = self.twiss_line(collider, reference_line, job.beam, &options)?;
                    let mean_dx = tw
                        .rows()
                        .iter()
                        .zip(reference.rows())
                        .map(|(a, b)| a.x - b.x)
                        .sum::<f64>()
                        / tw.rows().len().max(1) as f64;
                    residuals.push(mean_dx / tol);
                }
                MatchTarget::Luminosity { params, value, tol } => {
                    let (tw_b1, tw_b2) = self.both(collider)?;
                    let lumi = luminosity_from_twiss(params, &tw_b1, &tw_b2).map_err(|e| {
                        BackendError::Matching {
                            job: job.name.clone(),
                            message: e.to_string(),
                        }
                    })?;
                    residuals.push((lumi - value) / tol);
                }
                MatchTarget::Separation {
                    ip,
                    plane,
                    n_sigma,
                    nemitt,
                    tol,
                } => {
                    let (tw_b1, tw_b2) = self.both(collider)?;
                    let geometry = IpGeometry::from_twiss(&tw_b1, &tw_b2, *ip).map_err(|e| {
                        BackendError::Matching {
                            job: job.name.clone(),
                            message: e.to_string(),
                        }
                    })?;
                    let n = geometry.separation(*plane) / geometry.mean_beam_size(*plane, *nemitt);
                    residuals.push((n.abs() - n_sigma) / tol);
                }
                MatchTarget::SeparationOrthogonalToCrossing { ip, tol } => {
                    let (tw_b1, tw_b2) = self.both(collider)?;
                    let cosine = separation_orthogonality(&tw_b1, &tw_b2, *ip).map_err(|e| {
                        BackendError::Matching {
                            job: job.name.clone(),
                            message: e.to_string(),
                        }
                    })?;
                    residuals.push(cosine / tol);
                }
                MatchTarget::OrbitAt {
                    beam,
                    element,
                    column,
                    value,
                    tol,
                } => {
                    let tw = self.twiss(collider, *beam, &options)?;
                    let row = tw.row(element).map_err(|e| BackendError::Matching {
                        job: job.name.clone(),
                        message: e.to_string(),
                    })?;
                    residuals.push((column.of(row) - value) / tol);
                }
            }
        }
        Ok(residuals)
    }

    fn both(&self, collider: &Collider) -> Result<(TwissTable, TwissTable), BackendError> {
        let options = TwissOptions::default();
        Ok((
            self.twiss(collider, Beam::B1, &options)?,
            self.twiss(collider, Beam::B2, &options)?,
        ))
    }
}

impl OpticsService for SyntheticBackend {
    fn twiss(
        &self,
        collider: &Collider,
        beam: Beam,
        options: &TwissOptions,
    ) -> Result<TwissTable, BackendError> {
        self.twiss_line(collider, beam.line_name(), beam, options)
    }
}

impl SurveyService for SyntheticBackend {
    fn survey(
        &self,
        collider: &Collider,
        beam: Beam,
        element0: &str,
    ) -> Result<SurveyTable, BackendError> {
        let line = collider
            .line(beam.line_name())
            .map_err(|e| BackendError::Survey {
                line: beam.line_name().to_string(),
                message: e.to_string(),
            })?;
        let s0 = line
            .element(element0)
            .map(|e| e.s)
            .ok_or_else(|| BackendError::Survey {
                line: beam.line_name().to_string(),
                message: format!("no element '{}'", element0),
            })?;
        let rows = line
            .elements()
            .iter()
            .map(|e| {
                let s = signed_distance(e.s, s0);
                SurveyRow {
                    name: e.name.clone(),
                    s: s.rem_euclid(line.length),
                    x: 0.0,
                    y: 0.0,
                    z: s,
                }
            })
            .collect();
        Ok(SurveyTable::new(line.length, rows))
    }
}

impl MatchingService for SyntheticBackend {
    fn run_match(&self, collider: &mut Collider, job: &MatchJob) -> Result<MatchReport, BackendError> {
        let provenance = Provenance::Matching(job.name.clone());
        let fail = |message: String| BackendError::Matching {
            job: job.name.clone(),
            message,
        };

        for iteration in 0..self.max_iterations.max(1) {
            let r = self.residuals(collider, job)?;
            let penalty = r.iter().map(|v| v * v).sum::<f64>().sqrt();
            if r.iter().all(|v| v.abs() <= 1.0) {
                let knobs = job
                    .vary
                    .iter()
                    .map(|v| (v.knob.clone(), knob(collider, &v.knob)))
                    .collect();
                return Ok(MatchReport {
                    job: job.name.clone(),
                    iterations: iteration,
                    penalty,
                    knobs,
                });
            }

            let mut jacobian = DMatrix::<f64>::zeros(r.len(), job.vary.len());
            for (j, vary) in job.vary.iter().enumerate() {
                let k0 = knob(collider, &vary.knob);
                collider
                    .set_knob(&vary.knob, k0 + vary.step, provenance.clone())
                    .map_err(|e| fail(e.to_string()))?;
                let rp = self.residuals(collider, job)?;
                collider
                    .set_knob(&vary.knob, k0, provenance.clone())
                    .map_err(|e| fail(e.to_string()))?;
                for (i, (a, b)) in rp.iter().zip(&r).enumerate() {
                    jacobian[(i, j)] = (a - b) / vary.step;
                }
            }

            let rhs = -DVector::from_vec(r);
            let delta = jacobian
                .svd(true, true)
                .solve(&rhs, 1e-12)
                .map_err(|e| fail(e.to_string()))?;
            for (vary, d) in job.vary.iter().zip(delta.iter()) {
                let k0 = knob(collider, &vary.knob);
                collider
                    .set_knob(&vary.knob, k0 + d, provenance.clone())
                    .map_err(|e| fail(e.to_string()))?;
            }
        }
        Err(fail(format!(
            "targets not met after {} iterations",
            self.max_iterations
        )))
    }
}
