use super::backend::{MatchJob, MatchReport, MatchTarget, MatchingService, Vary};
use super::config::TuningRequest;
use super::error::EngineError;
use crate::core::models::collider::Collider;
use crate::core::models::ids::{Beam, Plane};
use tracing::{info, instrument};

/// Match jobs of a tuning request, in the order they are run: closed orbit, linear
/// coupling, tunes, chromaticities.
pub fn tuning_jobs(beam: Beam, request: &TuningRequest) -> Vec<MatchJob> {
    let line = beam.line_name();
    let knobs = &request.knobs;
    let step = request.knob_step;
    let mut jobs = Vec::new();

    if request.correct_closed_orbit {
        jobs.push(MatchJob {
            name: format!("closed_orbit_{}", line),
            beam,
            vary: request
                .orbit_correctors
                .iter()
                .map(|knob| Vary::new(knob.clone(), step))
                .collect(),
            targets: vec![MatchTarget::ClosedOrbit {
                reference_line: beam.co_ref_line_name().to_string(),
                tol: request.orbit_tol,
            }],
        });
    }
    if request.correct_coupling {
        jobs.push(MatchJob {
            name: format!("coupling_{}", line),
            beam,
            vary: vec![
                Vary::new(knobs.c_minus_knob_1.clone(), step),
                Vary::new(knobs.c_minus_knob_2.clone(), step),
            ],
            targets: vec![MatchTarget::CouplingCMinus {
                value: 0.0,
                tol: request.coupling_tol,
            }],
        });
    }
    if request.match_tune {
        jobs.push(MatchJob {
            name: format!("tune_{}", line),
            beam,
            vary: vec![
                Vary::new(knobs.q_knob_1.clone(), step),
                Vary::new(knobs.q_knob_2.clone(), step),
            ],
            targets: vec![
                MatchTarget::Tune {
                    plane: Plane::X,
                    value: request.targets.qx,
                    tol: request.tune_tol,
                },
                MatchTarget::Tune {
                    plane: Plane::Y,
                    value: request.targets.qy,
                    tol: request.tune_tol,
                },
            ],
        });
    }
    if request.match_chromaticity {
        jobs.push(MatchJob {
            name: format!("chromaticity_{}", line),
            beam,
            vary: vec![
                Vary::new(knobs.dq_knob_1.clone(), step),
                Vary::new(knobs.dq_knob_2.clone(), step),
            ],
            targets: vec![
                MatchTarget::Chromaticity {
                    plane: Plane::X,
                    value: request.targets.dqx,
                    tol: request.chromaticity_tol,
                },
                MatchTarget::Chromaticity {
                    plane: Plane::Y,
                    value: request.targets.dqy,
                    tol: request.chromaticity_tol,
                },
            ],
        });
    }
    jobs
}

/// Runs the tuning jobs of `beam` one after the other. The first failing job aborts.
#[instrument(skip_all, name = "machine_tuning", fields(beam = %beam))]
pub fn machine_tuning<M: MatchingService + ?Sized>(
    collider: &mut Collider,
    matcher: &M,
    beam: Beam,
    request: &TuningRequest,
) -> Result<Vec<MatchReport>, EngineError> {
    request.validate()?;
    collider.beam_line(beam)?;
    if request.correct_closed_orbit {
        collider.line(beam.co_ref_line_name())?;
    }

    let mut reports = Vec::new();
    for job in tuning_jobs(beam, request) {
        let report = matcher.run_match(collider, &job)?;
        info!(
            job = %report.job,
            iterations = report.iterations,
            penalty = report.penalty,
            "Match job converged."
        );
        reports.push(report);
    }
    Ok(reports)
}
