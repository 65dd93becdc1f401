//! Luminosity leveling at the interaction points.
//!
//! Luminosities are in m⁻² s⁻¹. Separation knobs are half separations in mm.
//! Separation targets and matched luminosity targets are handed to the matching
//! service together with targets that hold the crossing angles and close the
//! separation bump; the plain luminosity target is solved here by a secant search.

use super::backend::{MatchJob, MatchReport, MatchTarget, MatchingService, OpticsService, TwissOptions, Vary};
use super::config::{IpLeveling, LevelingConfig, LevelingTarget, LuminosityParams, OrbitPreservation};
use super::error::EngineError;
use super::luminosity::{IpGeometry, luminosity_from_twiss};
use super::progress::{Progress, ProgressReporter};
use crate::core::models::collider::Collider;
use crate::core::models::ids::{Beam, Ip, Plane};
use crate::core::models::knobs::Provenance;
use crate::core::models::twiss::{TwissColumn, TwissTable};
use tracing::{debug, info, instrument, warn};

/// Step of the separation knobs in match jobs (mm).
pub const SEPARATION_STEP: f64 = 1e-4;
/// Step of the orbit correctors in match jobs.
pub const CORRECTOR_STEP: f64 = 1e-7;
/// Largest change of a crossing angle at the leveled IP (rad).
pub const CROSSING_ANGLE_TOL: f64 = 1e-7;
pub const BUMP_POSITION_TOL: f64 = 1e-5;
pub const BUMP_ANGLE_TOL: f64 = 1e-8;
/// Tolerance on the normalized separation of a separation target.
pub const SEPARATION_TOL: f64 = 1e-4;
/// Tolerance on the cosine between separation and crossing vectors.
pub const ORTHOGONALITY_TOL: f64 = 1e-7;

#[derive(Debug, Clone, PartialEq)]
pub struct LevelingOutcome {
    pub ip: Ip,
    /// Final values of the separation knobs and correctors that were adjusted.
    pub knobs: Vec<(String, f64)>,
    /// Luminosity after leveling, when the bunch count of the IP is known.
    pub luminosity: Option<f64>,
    pub iterations: usize,
}

fn twiss_both<B: OpticsService + ?Sized>(
    collider: &Collider,
    backend: &B,
) -> Result<(TwissTable, TwissTable), EngineError> {
    let options = TwissOptions::default();
    Ok((
        backend.twiss(collider, Beam::B1, &options)?,
        backend.twiss(collider, Beam::B2, &options)?,
    ))
}

/// Sets `knob` so that the beams are `n_sigma` mean beam sizes apart in `plane` at `ip`.
pub fn level_separation<B: OpticsService + ?Sized>(
    collider: &mut Collider,
    backend: &B,
    ip: Ip,
    plane: Plane,
    n_sigma: f64,
    knob: &str,
    nemitt: f64,
) -> Result<f64, EngineError> {
    let (tw_b1, tw_b2) = twiss_both(collider, backend)?;
    let sigma = IpGeometry::from_twiss(&tw_b1, &tw_b2, ip)?.mean_beam_size(plane, nemitt);
    let value = n_sigma * sigma / 2.0 * 1e3;
    collider.set_knob(knob, value, Provenance::Leveling(ip.name()))?;
    debug!(%ip, %plane, n_sigma, sigma, knob, value, "Separation leveled.");
    Ok(value)
}

fn hold(tw: &TwissTable, beam: Beam, element: &str, column: TwissColumn, tol: f64) -> Result<MatchTarget, EngineError> {
    Ok(MatchTarget::OrbitAt {
        beam,
        element: element.to_string(),
        column,
        value: tw.value(column, element)?,
        tol,
    })
}

/// Targets holding the present crossing angles of both beams at `ip` and the orbit
/// at the bump ends of `preserve`.
pub fn orbit_preservation_targets<B: OpticsService + ?Sized>(
    collider: &Collider,
    backend: &B,
    ip: Ip,
    preserve: &OrbitPreservation,
) -> Result<Vec<MatchTarget>, EngineError> {
    let ip_name = ip.name();
    let mut targets = Vec::new();
    for beam in Beam::ALL {
        let tw = backend.twiss(collider, beam, &TwissOptions::default())?;
        for column in [TwissColumn::Px, TwissColumn::Py] {
            targets.push(hold(&tw, beam, &ip_name, column, CROSSING_ANGLE_TOL)?);
        }
        for (_, element) in preserve.bump_ends.iter().filter(|(b, _)| *b == beam) {
            for (column, tol) in [
                (TwissColumn::X, BUMP_POSITION_TOL),
                (TwissColumn::Y, BUMP_POSITION_TOL),
                (TwissColumn::Px, BUMP_ANGLE_TOL),
                (TwissColumn::Py, BUMP_ANGLE_TOL),
            ] {
                targets.push(hold(&tw, beam, element, column, tol)?);
            }
        }
    }
    Ok(targets)
}

fn separation_vary<'a>(knobs: impl IntoIterator<Item = &'a String>, preserve: &OrbitPreservation) -> Vec<Vary> {
    knobs
        .into_iter()
        .map(|k| Vary::new(k.clone(), SEPARATION_STEP))
        .chain(preserve.correctors.iter().map(|k| Vary::new(k.clone(), CORRECTOR_STEP)))
        .collect()
}

fn run_job<M: MatchingService + ?Sized>(
    collider: &mut Collider,
    matcher: &M,
    job: &MatchJob,
) -> Result<MatchReport, EngineError> {
    let report = matcher.run_match(collider, job)?;
    debug!(
        job = %report.job,
        iterations = report.iterations,
        penalty = report.penalty,
        "Leveling match converged."
    );
    Ok(report)
}

/// Separation of `n_sigma` mean beam sizes in `plane` at `ip`, driven by `knob`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SeparationGoal<'a> {
    pub ip: Ip,
    pub plane: Plane,
    pub n_sigma: f64,
    pub knob: &'a str,
    /// Normalized emittance in `plane`.
    pub nemitt: f64,
}

/// Separation leveling through the matching service: starts from [`level_separation`],
/// then matches the knob and the correctors so that the separation holds while the
/// crossing angles and the bump ends keep their values from before the change.
pub fn match_separation<B: OpticsService + MatchingService + ?Sized>(
    collider: &mut Collider,
    backend: &B,
    goal: &SeparationGoal<'_>,
    preserve: &OrbitPreservation,
) -> Result<MatchReport, EngineError> {
    let ip = goal.ip;
    let held = orbit_preservation_targets(collider, backend, ip, preserve)?;
    level_separation(collider, backend, ip, goal.plane, goal.n_sigma, goal.knob, goal.nemitt)?;

    let mut targets = vec![MatchTarget::Separation {
        ip,
        plane: goal.plane,
        n_sigma: goal.n_sigma,
        nemitt: goal.nemitt,
        tol: SEPARATION_TOL,
    }];
    targets.extend(held);
    let knob = goal.knob.to_string();
    let job = MatchJob {
        name: format!("separation_{}", ip.name()),
        beam: Beam::B1,
        vary: separation_vary([&knob], preserve),
        targets,
    };
    run_job(collider, backend, &job)
}

/// Luminosity leveling through the matching service. The separation `knobs` are varied
/// together so that the luminosity reaches `value` within `rtol` with the separation
/// orthogonal to the crossing, while the crossing angles and bump ends are held.
///
/// The matching starts from the present knob values, which should already separate the
/// beams.
pub fn match_luminosity<B: OpticsService + MatchingService + ?Sized>(
    collider: &mut Collider,
    backend: &B,
    params: &LuminosityParams,
    value: f64,
    rtol: f64,
    knobs: &[String],
    preserve: &OrbitPreservation,
) -> Result<MatchReport, EngineError> {
    let ip = params.ip;
    let mut targets = vec![
        MatchTarget::Luminosity {
            params: params.clone(),
            value,
            tol: rtol * value,
        },
        MatchTarget::SeparationOrthogonalToCrossing {
            ip,
            tol: ORTHOGONALITY_TOL,
        },
    ];
    targets.extend(orbit_preservation_targets(collider, backend, ip, preserve)?);
    let job = MatchJob {
        name: format!("luminosity_{}", ip.name()),
        beam: Beam::B1,
        vary: separation_vary(knobs, preserve),
        targets,
    };
    run_job(collider, backend, &job)
}

/// Settings of a luminosity leveling search.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LuminositySearch {
    pub target: f64,
    pub rtol: f64,
    pub initial_step: f64,
    pub max_iterations: usize,
}

/// Solves `L(knob) = target` by secant steps, bisecting once the root is bracketed.
///
/// Returns the final knob value and the number of luminosity evaluations.
pub fn level_luminosity_with_knob<B: OpticsService + ?Sized>(
    collider: &mut Collider,
    backend: &B,
    params: &LuminosityParams,
    knob: &str,
    search: &LuminositySearch,
) -> Result<(f64, usize), EngineError> {
    let provenance = Provenance::Leveling(params.ip.name());
    let tol = search.rtol * search.target;
    let mut evaluations = 0;
    let mut residual = |collider: &mut Collider, value: f64| -> Result<f64, EngineError> {
        collider.set_knob(knob, value, provenance.clone())?;
        let (tw_b1, tw_b2) = twiss_both(collider, backend)?;
        evaluations += 1;
        Ok(luminosity_from_twiss(params, &tw_b1, &tw_b2)? - search.target)
    };

    let mut k_prev = collider.knob(knob).unwrap_or(0.0);
    let mut f_prev = residual(collider, k_prev)?;
    if f_prev.abs() <= tol {
        return Ok((k_prev, 1));
    }
    let mut k = k_prev + search.initial_step;
    let mut f = residual(collider, k)?;
    // (a, f(a), b, f(b)) with f(a) and f(b) of opposite signs.
    let mut bracket: Option<(f64, f64, f64, f64)> = None;

    for iteration in 0..search.max_iterations {
        debug!(iteration, knob, value = k, residual = f, "Luminosity leveling step.");
        if f.abs() <= tol {
            return Ok((k, evaluations));
        }

        bracket = match bracket {
            Some((a, fa, b, fb)) => {
                if f.signum() == fa.signum() {
                    Some((k, f, b, fb))
                } else {
                    Some((a, fa, k, f))
                }
            }
            None if f.signum() != f_prev.signum() => Some((k_prev, f_prev, k, f)),
            None => None,
        };

        let secant = if f != f_prev {
            k - f * (k - k_prev) / (f - f_prev)
        } else {
            f64::NAN
        };
        let next = match bracket {
            Some((a, _, b, _)) if !secant.is_finite() || secant <= a.min(b) || secant >= a.max(b) => {
                0.5 * (a + b)
            }
            Some(_) => secant,
            None if secant.is_finite() => secant,
            None => k + 2.0 * (k - k_prev),
        };

        k_prev = k;
        f_prev = f;
        k = next;
        f = residual(collider, k)?;
    }

    Err(EngineError::Convergence {
        what: format!("luminosity leveling at {} with '{}'", params.ip, knob),
        iterations: search.max_iterations,
    })
}

fn level_ip<B: OpticsService + MatchingService + ?Sized>(
    collider: &mut Collider,
    backend: &B,
    config: &LevelingConfig,
    leveling: &IpLeveling,
) -> Result<LevelingOutcome, EngineError> {
    let ip = leveling.ip;
    let (knobs, iterations) = match &leveling.target {
        LevelingTarget::Separation {
            plane,
            n_sigma,
            knob,
            preserve,
        } => {
            let goal = SeparationGoal {
                ip,
                plane: *plane,
                n_sigma: *n_sigma,
                knob,
                nemitt: config.nemitt(*plane),
            };
            let report = match_separation(collider, backend, &goal, preserve)?;
            (report.knobs, report.iterations)
        }
        LevelingTarget::Luminosity {
            value,
            knob,
            rtol,
            initial_step,
            max_iterations,
        } => {
            let params = config.luminosity_params(ip)?;
            let search = LuminositySearch {
                target: *value,
                rtol: *rtol,
                initial_step: *initial_step,
                max_iterations: *max_iterations,
            };
            let (value, iterations) =
                level_luminosity_with_knob(collider, backend, &params, knob, &search)?;
            (vec![(knob.clone(), value)], iterations)
        }
        LevelingTarget::MatchedLuminosity {
            value,
            rtol,
            knobs,
            preserve,
        } => {
            let params = config.luminosity_params(ip)?;
            let report = match_luminosity(collider, backend, &params, *value, *rtol, knobs, preserve)?;
            (report.knobs, report.iterations)
        }
    };

    let luminosity = match config.luminosity_params(ip) {
        Ok(params) => {
            let (tw_b1, tw_b2) = twiss_both(collider, backend)?;
            Some(luminosity_from_twiss(&params, &tw_b1, &tw_b2)?)
        }
        Err(_) => None,
    };
    Ok(LevelingOutcome {
        ip,
        knobs,
        luminosity,
        iterations,
    })
}

/// Levels every IP listed in `config`, in order.
#[instrument(skip_all, name = "luminosity_leveling")]
pub fn level_luminosity<B: OpticsService + MatchingService + ?Sized>(
    collider: &mut Collider,
    backend: &B,
    config: &LevelingConfig,
    reporter: &ProgressReporter,
) -> Result<Vec<LevelingOutcome>, EngineError> {
    config.validate()?;
    if config.ips.is_empty() {
        warn!("No IP to level.");
    }
    reporter.report(Progress::TaskStart {
        total_steps: config.ips.len() as u64,
    });

    let mut outcomes = Vec::with_capacity(config.ips.len());
    for leveling in &config.ips {
        let outcome = level_ip(collider, backend, config, leveling)?;
        let knobs = outcome
            .knobs
            .iter()
            .map(|(k, v)| format!("{} = {}", k, v))
            .collect::<Vec<_>>()
            .join(", ");
        match outcome.luminosity {
            Some(luminosity) => info!(ip = %outcome.ip, %knobs, luminosity, "IP leveled."),
            None => info!(ip = %outcome.ip, %knobs, "IP leveled."),
        }
        outcomes.push(outcome);
        reporter.report(Progress::TaskIncrement);
    }
    reporter.report(Progress::TaskFinish);
    Ok(outcomes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::backend::BackendError;
    use crate::engine::luminosity::separation_orthogonality;
    use crate::engine::testing::{SyntheticBackend, synthetic_collider};
    use crate::engine::verify::{Checker, check_leveling};

    fn leveling_config(ips: Vec<IpLeveling>) -> LevelingConfig {
        LevelingConfig {
            ips,
            num_colliding_bunches: vec![(Ip::IP2, 2160), (Ip::IP8, 2572)],
            num_particles_per_bunch: 2.2e11,
            nemitt_x: 2.5e-6,
            nemitt_y: 2.5e-6,
            sigma_z: 0.076,
            crab: false,
        }
    }

    fn ip8_params() -> LuminosityParams {
        leveling_config(Vec::new()).luminosity_params(Ip::IP8).unwrap()
    }

    fn luminosity_now(collider: &Collider, params: &LuminosityParams) -> f64 {
        let (tw_b1, tw_b2) = twiss_both(collider, &SyntheticBackend::new()).unwrap();
        luminosity_from_twiss(params, &tw_b1, &tw_b2).unwrap()
    }

    fn set_all(collider: &mut Collider, knobs: &[(&str, f64)]) {
        for (name, value) in knobs {
            collider.set_knob(name, *value, Provenance::Settings).unwrap();
        }
    }

    fn correctors(n: u8) -> Vec<String> {
        ["acbh", "acbv"]
            .iter()
            .flat_map(|c| [1, 2].map(|b| format!("corr_co_{}{}.b{}", c, n, b)))
            .collect()
    }

    fn assert_angles_held(before: &(TwissTable, TwissTable), after: &(TwissTable, TwissTable), ips: &[&str]) {
        for ip in ips {
            for (tw0, tw1) in [(&before.0, &after.0), (&before.1, &after.1)] {
                for column in [TwissColumn::Px, TwissColumn::Py] {
                    let shift = tw1.value(column, ip).unwrap() - tw0.value(column, ip).unwrap();
                    assert!(shift.abs() <= 1e-7, "{} {} moved by {}", ip, column.name(), shift);
                }
            }
        }
    }

    #[test]
    fn separation_leveling_sets_half_separation_in_mm() {
        let mut collider = synthetic_collider();
        let backend = SyntheticBackend::new();
        let config = leveling_config(vec![IpLeveling {
            ip: Ip::IP2,
            target: LevelingTarget::Separation {
                plane: Plane::X,
                n_sigma: 5.0,
                knob: "on_sep2".to_string(),
                preserve: OrbitPreservation::default(),
            },
        }]);
        let outcomes = level_luminosity(&mut collider, &backend, &config, &ProgressReporter::new()).unwrap();

        let (tw_b1, tw_b2) = twiss_both(&collider, &backend).unwrap();
        let geometry = IpGeometry::from_twiss(&tw_b1, &tw_b2, Ip::IP2).unwrap();
        let mean_betx = (tw_b1.row("ip2").unwrap().betx * tw_b2.row("ip2").unwrap().betx).sqrt();
        let sigma = (2.5e-6 * mean_betx / geometry.beta_gamma_b1).sqrt();
        let knob = collider.knob("on_sep2").unwrap();
        assert!(((knob / 1000.0 - 5.0 * sigma / 2.0) / (5.0 * sigma / 2.0)).abs() < 1e-3);
        assert_eq!(outcomes[0].knobs, vec![("on_sep2".to_string(), knob)]);
        assert!(outcomes[0].luminosity.is_some());
    }

    #[test]
    fn separation_match_corrects_leaking_crossing_angle() {
        let mut collider = synthetic_collider();
        set_all(&mut collider, &[("on_x2", -170.0), ("crossing_leak2", 40.0)]);
        let backend = SyntheticBackend::new();
        let before = twiss_both(&collider, &backend).unwrap();

        let preserve = OrbitPreservation {
            correctors: correctors(2),
            bump_ends: vec![(Beam::B1, "ip3".to_string()), (Beam::B2, "ip1".to_string())],
        };
        let goal = SeparationGoal {
            ip: Ip::IP2,
            plane: Plane::X,
            n_sigma: 3.0,
            knob: "on_sep2",
            nemitt: 2.5e-6,
        };
        let report = match_separation(&mut collider, &backend, &goal, &preserve).unwrap();

        let after = twiss_both(&collider, &backend).unwrap();
        assert_angles_held(&before, &after, &["ip2"]);
        let geometry = IpGeometry::from_twiss(&after.0, &after.1, Ip::IP2).unwrap();
        let n = geometry.separation(Plane::X).abs() / geometry.mean_beam_size(Plane::X, 2.5e-6);
        assert!((n - 3.0).abs() <= SEPARATION_TOL);
        assert!(collider.knob("corr_co_acbh2.b1").unwrap().abs() > 0.0);
        assert_eq!(report.knobs.len(), 5);
    }

    #[test]
    fn matched_luminosity_keeps_crossing_angles_and_orthogonality() {
        let mut collider = synthetic_collider();
        set_all(
            &mut collider,
            &[
                ("on_x1", 250.0),
                ("on_x8", 170.0),
                ("on_sep8v", 0.03),
                ("crossing_leak8", 50.0),
            ],
        );
        let backend = SyntheticBackend::new();
        let params = ip8_params();
        let target = 0.1 * luminosity_now(&collider, &params);
        let before = twiss_both(&collider, &backend).unwrap();

        let config = leveling_config(vec![IpLeveling {
            ip: Ip::IP8,
            target: LevelingTarget::MatchedLuminosity {
                value: target,
                rtol: 1e-3,
                knobs: vec!["on_sep8h".to_string(), "on_sep8v".to_string()],
                preserve: OrbitPreservation {
                    correctors: correctors(8),
                    bump_ends: vec![(Beam::B1, "ip1".to_string()), (Beam::B2, "ip1".to_string())],
                },
            },
        }]);
        let outcomes = level_luminosity(&mut collider, &backend, &config, &ProgressReporter::new()).unwrap();

        let after = twiss_both(&collider, &backend).unwrap();
        assert_angles_held(&before, &after, &["ip1", "ip8"]);
        let achieved = luminosity_from_twiss(&params, &after.0, &after.1).unwrap();
        assert!(((achieved - target) / target).abs() <= 1e-3);
        assert!(separation_orthogonality(&after.0, &after.1, Ip::IP8).unwrap().abs() <= 1e-6);
        assert!(collider.knob("on_sep8v").unwrap() > 0.03);
        assert!(collider.knob("corr_co_acbv8.b1").unwrap().abs() > 0.0);
        assert_eq!(outcomes[0].knobs.len(), 6);
        let mut checker = Checker::new();
        check_leveling(&mut checker, &collider, &after.0, &after.1, &config).unwrap();
        assert_eq!(
            collider.knobs().knob("on_sep8h").unwrap().last_provenance(),
            Some(&Provenance::Matching("luminosity_ip8".to_string()))
        );
    }

    #[test]
    fn leaking_crossing_without_correctors_cannot_be_matched() {
        let mut collider = synthetic_collider();
        set_all(
            &mut collider,
            &[("on_x8", 170.0), ("on_sep8v", 0.03), ("crossing_leak8", 50.0)],
        );
        let backend = SyntheticBackend::new();
        let params = ip8_params();
        let target = 0.1 * luminosity_now(&collider, &params);
        let knobs = ["on_sep8h".to_string(), "on_sep8v".to_string()];

        let err = match_luminosity(
            &mut collider,
            &backend,
            &params,
            target,
            1e-3,
            &knobs,
            &OrbitPreservation::default(),
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::Backend(BackendError::Matching { .. })));
    }

    #[test]
    fn luminosity_leveling_reaches_target() {
        let mut collider = synthetic_collider();
        collider.set_knob("on_x8", 170.0, Provenance::Settings).unwrap();
        let params = ip8_params();
        let target = 0.1 * luminosity_now(&collider, &params);

        let config = leveling_config(vec![IpLeveling {
            ip: Ip::IP8,
            target: LevelingTarget::Luminosity {
                value: target,
                knob: "on_sep8".to_string(),
                rtol: 1e-3,
                initial_step: 1e-3,
                max_iterations: 50,
            },
        }]);
        let outcomes =
            level_luminosity(&mut collider, &SyntheticBackend::new(), &config, &ProgressReporter::new()).unwrap();

        let achieved = luminosity_now(&collider, &params);
        assert!(((achieved - target) / target).abs() <= 1e-3);
        assert!(collider.knob("on_sep8").unwrap() > 0.0);
        assert!((outcomes[0].luminosity.unwrap() - achieved).abs() < 1e-6 * achieved);
    }

    #[test]
    fn unreachable_luminosity_reports_non_convergence() {
        let mut collider = synthetic_collider();
        let params = ip8_params();
        let search = LuminositySearch {
            target: 10.0 * luminosity_now(&collider, &params),
            rtol: 1e-3,
            initial_step: 1e-3,
            max_iterations: 8,
        };
        let err = level_luminosity_with_knob(
            &mut collider,
            &SyntheticBackend::new(),
            &params,
            "on_sep8",
            &search,
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::Convergence { iterations: 8, .. }));
    }

    #[test]
    fn luminosity_leveling_needs_bunch_count() {
        let mut collider = synthetic_collider();
        let mut config = leveling_config(vec![IpLeveling {
            ip: Ip::IP1,
            target: LevelingTarget::Luminosity {
                value: 1e38,
                knob: "on_sep1".to_string(),
                rtol: 1e-3,
                initial_step: 1e-3,
                max_iterations: 10,
            },
        }]);
        config.num_colliding_bunches.clear();
        assert!(matches!(
            level_luminosity(&mut collider, &SyntheticBackend::new(), &config, &ProgressReporter::new()),
            Err(EngineError::Config { .. })
        ));
    }
}
