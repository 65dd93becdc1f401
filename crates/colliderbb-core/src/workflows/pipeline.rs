use crate::core::io::checkpoint::{checkpoint_path, load_checkpoint, save_checkpoint};
use crate::core::models::collider::Collider;
use crate::core::models::ids::{Beam, Ip, Plane};
use crate::core::models::knobs::Provenance;
use crate::core::models::twiss::TwissTable;
use crate::engine::backend::{Backend, OpticsService, TwissOptions};
use crate::engine::config::{
    BeamBeamInstallConfig, BeamBeamParams, ConfigError, LevelingConfig, TuningRequest,
    VerifyConfig, invalid,
};
use crate::engine::configure::configure_beambeam_interactions;
use crate::engine::error::EngineError;
use crate::engine::install::install_beambeam_interactions;
use crate::engine::leveling::level_luminosity;
use crate::engine::progress::{Progress, ProgressReporter};
use crate::engine::tuning::machine_tuning;
use crate::engine::verify::{
    Checker, Tolerance, VerificationReport, check_checkpoint_integrity, check_coupling,
    check_coupling_response, check_ip_offset, check_leveling, check_optics_unchanged,
    check_separation_orthogonality, check_tuning, verify_beambeam_configuration,
};
use std::fmt;
use std::path::PathBuf;
use tracing::{info, instrument};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Stage {
    SequenceBuilt,
    BeamBeamInstalled,
    Tuned,
    Leveled,
    BeamBeamConfigured,
}

impl Stage {
    pub const ALL: [Stage; 5] = [
        Stage::SequenceBuilt,
        Stage::BeamBeamInstalled,
        Stage::Tuned,
        Stage::Leveled,
        Stage::BeamBeamConfigured,
    ];

    pub fn index(self) -> u8 {
        self as u8
    }

    pub fn from_index(index: u8) -> Option<Stage> {
        Self::ALL.get(usize::from(index)).copied()
    }

    pub fn name(self) -> &'static str {
        match self {
            Stage::SequenceBuilt => "sequence built",
            Stage::BeamBeamInstalled => "beam-beam installed",
            Stage::Tuned => "tuned",
            Stage::Leveled => "leveled",
            Stage::BeamBeamConfigured => "beam-beam configured",
        }
    }

    pub fn previous(self) -> Option<Stage> {
        self.index().checked_sub(1).and_then(Self::from_index)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02} ({})", self.index(), self.name())
    }
}

/// Everything a pipeline run needs besides the backend and the input collider.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    pub output_dir: PathBuf,
    /// Run name used in checkpoint file names.
    pub tag: String,
    pub install: BeamBeamInstallConfig,
    /// Knobs set temporarily on both the bare and the installed collider when
    /// checking that installation leaves the optics unchanged.
    pub integrity_knobs: Vec<(String, f64)>,
    /// Machine settings applied at the start of the tuning stage.
    pub knob_settings: Vec<(String, f64)>,
    /// Strength of the coupling-knob response check, skipped when `None`.
    pub coupling_check_strength: Option<f64>,
    /// Coupling introduced before tuning, to be removed by the coupling correction.
    pub coupling_injection: Vec<(String, f64)>,
    pub tuning: Vec<(Beam, TuningRequest)>,
    /// Beam 1 orbit expected at an IP once the settings are applied.
    pub ip_offsets: Vec<(Ip, Plane, f64)>,
    pub leveling: LevelingConfig,
    /// IPs whose separation must be orthogonal to the crossing after leveling.
    pub orthogonality_ips: Vec<Ip>,
    pub beambeam: BeamBeamParams,
    pub verify: VerifyConfig,
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tag.is_empty() || self.tag.contains(['/', '\\']) {
            return Err(invalid("tag", format!("'{}' cannot be used in a file name", self.tag)));
        }
        for (_, request) in &self.tuning {
            request.validate()?;
        }
        self.leveling.validate()?;
        self.beambeam.validate()?;
        Ok(())
    }

    pub fn checkpoint(&self, stage: Stage) -> PathBuf {
        checkpoint_path(&self.output_dir, &self.tag, stage.index())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StageOutcome {
    pub stage: Stage,
    pub checkpoint: PathBuf,
    pub report: VerificationReport,
}

fn knob_refs(knobs: &[(String, f64)]) -> Vec<(&str, f64)> {
    knobs.iter().map(|(name, value)| (name.as_str(), *value)).collect()
}

fn twiss_4d_with<B: OpticsService + ?Sized>(
    collider: &mut Collider,
    backend: &B,
    knobs: &[(String, f64)],
) -> Result<Vec<(Beam, TwissTable)>, EngineError> {
    collider.with_temp_knobs(&knob_refs(knobs), |c| {
        Beam::ALL
            .iter()
            .map(|&beam| Ok((beam, backend.twiss(c, beam, &TwissOptions::four_d())?)))
            .collect::<Result<Vec<_>, EngineError>>()
    })
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

fn check_sequence(collider: &Collider) -> Result<VerificationReport, EngineError> {
    let mut checker = Checker::new();
    checker.section("lines", |c| -> Result<(), EngineError> {
        for beam in Beam::ALL {
            for name in [beam.line_name(), beam.co_ref_line_name()] {
                c.ensure(name, collider.line(name).is_ok(), || "line is missing".to_string())?;
            }
        }
        c.ensure("collider", !collider.is_beambeam_installed(), || {
            "beam-beam lenses are already installed".to_string()
        })?;
        Ok(())
    })?;
    Ok(checker.finish())
}

fn install_stage<B: Backend + ?Sized>(
    collider: &mut Collider,
    backend: &B,
    config: &PipelineConfig,
    reporter: &ProgressReporter,
) -> Result<VerificationReport, EngineError> {
    let before = twiss_4d_with(collider, backend, &config.integrity_knobs)?;
    reporter.phase("Installing beam-beam lenses", || {
        install_beambeam_interactions(collider, &config.install, reporter)
    })?;
    let after = twiss_4d_with(collider, backend, &config.integrity_knobs)?;

    let mut checker = Checker::new();
    checker.section("optics unchanged by installation", |c| {
        before
            .iter()
            .zip(&after)
            .try_for_each(|((beam, tw0), (_, tw1))| check_optics_unchanged(c, beam.line_name(), tw0, tw1))
    })?;
    let read_back = Collider::from_json_str(&collider.to_json_string()?)?;
    checker.section("checkpoint integrity", |c| check_checkpoint_integrity(c, collider, &read_back))?;
    Ok(checker.finish())
}

fn tuning_stage<B: Backend + ?Sized>(
    collider: &mut Collider,
    backend: &B,
    config: &PipelineConfig,
    reporter: &ProgressReporter,
) -> Result<VerificationReport, EngineError> {
    for (name, value) in &config.knob_settings {
        collider.set_knob(name, *value, Provenance::Settings)?;
    }
    info!(knobs = config.knob_settings.len(), "Machine settings applied.");

    let mut checker = Checker::new();
    if let Some(strength) = config.coupling_check_strength {
        let knobs: Vec<(Beam, String, String)> = config
            .tuning
            .iter()
            .map(|(beam, request)| {
                (
                    *beam,
                    request.knobs.c_minus_knob_1.clone(),
                    request.knobs.c_minus_knob_2.clone(),
                )
            })
            .collect();
        checker.section("coupling knob response", |c| {
            check_coupling_response(c, collider, backend, &knobs, strength, Tolerance::abs(0.2 * strength))
        })?;
    }
    for (name, value) in &config.coupling_injection {
        collider.set_knob(name, *value, Provenance::Settings)?;
    }

    reporter.report(Progress::TaskStart {
        total_steps: config.tuning.len() as u64,
    });
    for (beam, request) in &config.tuning {
        machine_tuning(collider, backend, *beam, request)?;
        reporter.report(Progress::TaskIncrement);
    }
    reporter.report(Progress::TaskFinish);

    checker.section("tuning targets", |c| -> Result<(), EngineError> {
        for (beam, request) in &config.tuning {
            let tw = backend.twiss(collider, *beam, &TwissOptions::default())?;
            check_tuning(
                c,
                &tw,
                beam.line_name(),
                &request.targets,
                Tolerance::abs(request.tune_tol),
                Tolerance::abs(request.chromaticity_tol),
            )?;
            if request.correct_coupling {
                check_coupling(c, &tw, beam.line_name(), 0.0, Tolerance::abs(request.coupling_tol))?;
            }
        }
        Ok(())
    })?;
    checker.section("IP orbit settings", |c| -> Result<(), EngineError> {
        let (tw_b1, tw_b2) = twiss_both(collider, backend)?;
        for &(ip, plane, expected) in &config.ip_offsets {
            check_ip_offset(c, &tw_b1, &tw_b2, ip, plane, expected, Tolerance::abs(1e-8))?;
        }
        Ok(())
    })?;
    Ok(checker.finish())
}

fn leveling_stage<B: Backend + ?Sized>(
    collider: &mut Collider,
    backend: &B,
    config: &PipelineConfig,
    reporter: &ProgressReporter,
) -> Result<VerificationReport, EngineError> {
    reporter.phase("Leveling", || level_luminosity(collider, backend, &config.leveling, reporter))?;

    reporter.phase("Re-matching tunes and chromaticities", || -> Result<(), EngineError> {
        for (beam, request) in &config.tuning {
            let mut rematch = request.clone();
            rematch.correct_closed_orbit = false;
            rematch.correct_coupling = false;
            machine_tuning(collider, backend, *beam, &rematch)?;
        }
        Ok(())
    })?;

    let (tw_b1, tw_b2) = twiss_both(collider, backend)?;
    let mut checker = Checker::new();
    checker.section("leveling targets", |c| check_leveling(c, collider, &tw_b1, &tw_b2, &config.leveling))?;
    checker.section("separation orthogonal to crossing", |c| -> Result<(), EngineError> {
        for &ip in &config.orthogonality_ips {
            check_separation_orthogonality(c, &tw_b1, &tw_b2, ip, 1e-6)?;
        }
        Ok(())
    })?;
    Ok(checker.finish())
}

fn configure_stage<B: Backend + ?Sized>(
    collider: &mut Collider,
    backend: &B,
    config: &PipelineConfig,
    reporter: &ProgressReporter,
) -> Result<VerificationReport, EngineError> {
    reporter.phase("Configuring beam-beam lenses", || {
        configure_beambeam_interactions(collider, backend, &config.beambeam, reporter)
    })?;
    reporter.phase("Verifying beam-beam lenses", || {
        verify_beambeam_configuration(collider, backend, &config.verify)
    })
}

/// Runs the action of `stage` on `collider` in place.
pub fn apply_stage<B: Backend + ?Sized>(
    stage: Stage,
    collider: &mut Collider,
    backend: &B,
    config: &PipelineConfig,
    reporter: &ProgressReporter,
) -> Result<VerificationReport, EngineError> {
    match stage {
        Stage::SequenceBuilt => check_sequence(collider),
        Stage::BeamBeamInstalled => install_stage(collider, backend, config, reporter),
        Stage::Tuned => tuning_stage(collider, backend, config, reporter),
        Stage::Leveled => leveling_stage(collider, backend, config, reporter),
        Stage::BeamBeamConfigured => configure_stage(collider, backend, config, reporter),
    }
}

/// Writes the stage 00 checkpoint from a collider produced by an external builder.
#[instrument(skip_all, name = "pipeline_stage", fields(stage = 0))]
pub fn start_pipeline(
    input: &Collider,
    config: &PipelineConfig,
    reporter: &ProgressReporter,
) -> Result<StageOutcome, EngineError> {
    let stage = Stage::SequenceBuilt;
    config.validate()?;
    reporter.report(Progress::StageStart {
        stage: stage.index(),
        name: stage.name(),
    });
    let report = check_sequence(input)?;
    let checkpoint = config.checkpoint(stage);
    save_checkpoint(input, &checkpoint)?;
    reporter.report(Progress::StageFinish { stage: stage.index() });
    info!(%stage, checkpoint = %checkpoint.display(), "Stage complete.");
    Ok(StageOutcome {
        stage,
        checkpoint,
        report,
    })
}

/// Loads the checkpoint of the stage before `stage`, runs `stage` and writes its checkpoint.
#[instrument(skip_all, name = "pipeline_stage", fields(stage = stage.index()))]
pub fn run_stage<B: Backend + ?Sized>(
    stage: Stage,
    backend: &B,
    config: &PipelineConfig,
    reporter: &ProgressReporter,
) -> Result<StageOutcome, EngineError> {
    let previous = stage.previous().ok_or_else(|| {
        EngineError::InvalidState(format!("stage {} starts from an external model", stage))
    })?;
    config.validate()?;
    reporter.report(Progress::StageStart {
        stage: stage.index(),
        name: stage.name(),
    });

    let mut collider = load_checkpoint(&config.checkpoint(previous))?;
    let report = apply_stage(stage, &mut collider, backend, config, reporter)?;
    let checkpoint = config.checkpoint(stage);
    save_checkpoint(&collider, &checkpoint)?;

    reporter.report(Progress::StageFinish { stage: stage.index() });
    info!(
        %stage,
        comparisons = report.total_comparisons(),
        checkpoint = %checkpoint.display(),
        "Stage complete."
    );
    Ok(StageOutcome {
        stage,
        checkpoint,
        report,
    })
}

/// Runs every stage in order, starting from `input`.
#[instrument(skip_all, name = "pipeline", fields(tag = %config.tag))]
pub fn run_pipeline<B: Backend + ?Sized>(
    input: &Collider,
    backend: &B,
    config: &PipelineConfig,
    reporter: &ProgressReporter,
) -> Result<Vec<StageOutcome>, EngineError> {
    let mut outcomes = vec![start_pipeline(input, config, reporter)?];
    for stage in Stage::ALL.into_iter().skip(1) {
        outcomes.push(run_stage(stage, backend, config, reporter)?);
    }
    info!(stages = outcomes.len(), "Pipeline complete.");
    Ok(outcomes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::io::checkpoint::CheckpointError;
    use crate::core::models::ids::EncounterKind;
    use crate::core::models::knobs::BEAMBEAM_SCALE;
    use crate::engine::config::{IpLeveling, LevelingTarget, OrbitPreservation, TuningKnobs, TuningTargets};
    use crate::engine::luminosity::luminosity_from_twiss;
    use crate::engine::testing::{
        IP8_TILT, SyntheticBackend, bb_off_tunes, hllhc_install_config, synthetic_collider,
    };
    use std::sync::Mutex;
    use tempfile::tempdir;

    fn tuning_request(beam: Beam) -> TuningRequest {
        let (qx, qy) = bb_off_tunes(beam);
        let request = TuningRequest::new(
            TuningTargets {
                qx,
                qy,
                dqx: 5.0,
                dqy: 5.0,
            },
            TuningKnobs::for_beam(beam),
        )
        .with_coupling_correction();
        request.with_orbit_correction(vec![format!("corr_co_h.b{}", beam.digit())])
    }

    fn strings(pairs: &[(&str, f64)]) -> Vec<(String, f64)> {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    fn pipeline_config(output_dir: PathBuf) -> PipelineConfig {
        let beambeam = BeamBeamParams::new(2.2e11, 2e-6, 3e-6);
        let mut verify = VerifyConfig::new(beambeam.clone());
        verify.crossing_tilts = vec![(Ip::IP8, IP8_TILT)];
        verify.bb_off_tunes = Beam::ALL
            .iter()
            .map(|&b| {
                let (qx, qy) = bb_off_tunes(b);
                (b, qx, qy)
            })
            .collect();

        let knob_settings = strings(&[
            ("on_x1", 250.0),
            ("on_x2", -170.0),
            ("on_x5", 250.0),
            ("on_x8", -250.0),
            ("on_sep2", 0.138),
            ("on_crab1", -190.0),
            ("on_crab5", -190.0),
            ("orbit_error_b1", 1e-4),
            ("orbit_error_b2", -3e-5),
        ]);
        let mut leveling = LevelingConfig {
            ips: vec![IpLeveling {
                ip: Ip::IP2,
                target: LevelingTarget::Separation {
                    plane: Plane::X,
                    n_sigma: 5.0,
                    knob: "on_sep2".to_string(),
                    preserve: OrbitPreservation {
                        correctors: vec!["corr_co_acbh2.b1".to_string(), "corr_co_acbh2.b2".to_string()],
                        bump_ends: vec![(Beam::B1, "ip3".to_string()), (Beam::B2, "ip1".to_string())],
                    },
                },
            }],
            num_colliding_bunches: vec![(Ip::IP2, 2160), (Ip::IP8, 2572)],
            num_particles_per_bunch: 2.2e11,
            nemitt_x: 2.5e-6,
            nemitt_y: 2.5e-6,
            sigma_z: 0.076,
            crab: false,
        };
        // Level ip8 to a tenth of its head-on luminosity on the corrected orbit.
        let head_on = {
            let mut collider = synthetic_collider();
            for (name, value) in knob_settings.iter().filter(|(name, _)| !name.starts_with("orbit_error")) {
                collider.set_knob(name, *value, Provenance::Settings).unwrap();
            }
            let backend = SyntheticBackend::new();
            let (tw_b1, tw_b2) = twiss_both(&collider, &backend).unwrap();
            luminosity_from_twiss(&leveling.luminosity_params(Ip::IP8).unwrap(), &tw_b1, &tw_b2).unwrap()
        };
        leveling.ips.push(IpLeveling {
            ip: Ip::IP8,
            target: LevelingTarget::Luminosity {
                value: 0.1 * head_on,
                knob: "on_sep8".to_string(),
                rtol: 1e-3,
                initial_step: 1e-3,
                max_iterations: 60,
            },
        });

        PipelineConfig {
            output_dir,
            tag: "synthetic".to_string(),
            install: hllhc_install_config(),
            integrity_knobs: strings(&[("on_x1", 250.0), ("on_x5", -200.0)]),
            knob_settings,
            coupling_check_strength: Some(1e-3),
            coupling_injection: strings(&[
                ("c_minus_re_b1", 0.4e-3),
                ("c_minus_im_b1", 0.7e-3),
                ("c_minus_re_b2", 0.5e-3),
                ("c_minus_im_b2", 0.6e-3),
            ]),
            tuning: Beam::ALL.iter().map(|&b| (b, tuning_request(b))).collect(),
            ip_offsets: vec![(Ip::IP2, Plane::X, 0.138e-3)],
            leveling,
            orthogonality_ips: vec![Ip::IP2],
            beambeam,
            verify,
        }
    }

    #[test]
    fn stage_indices_and_order() {
        assert_eq!(Stage::from_index(3), Some(Stage::Leveled));
        assert_eq!(Stage::from_index(5), None);
        assert_eq!(Stage::Tuned.previous(), Some(Stage::BeamBeamInstalled));
        assert_eq!(Stage::SequenceBuilt.previous(), None);
        assert_eq!(Stage::BeamBeamConfigured.to_string(), "04 (beam-beam configured)");
    }

    #[test]
    fn full_pipeline_writes_checkpoint_chain() {
        let dir = tempdir().unwrap();
        let config = pipeline_config(dir.path().to_path_buf());
        let seen = Mutex::new(Vec::new());
        let reporter = ProgressReporter::with_callback(Box::new(|event| {
            if let Progress::StageFinish { stage } = event {
                seen.lock().unwrap().push(stage);
            }
        }));

        let outcomes = run_pipeline(&synthetic_collider(), &SyntheticBackend::new(), &config, &reporter).unwrap();
        drop(reporter);
        assert_eq!(seen.into_inner().unwrap(), vec![0, 1, 2, 3, 4]);
        assert_eq!(outcomes.len(), 5);
        for outcome in &outcomes {
            assert!(outcome.checkpoint.exists(), "{}", outcome.checkpoint.display());
            assert!(
                outcome
                    .checkpoint
                    .ends_with(format!("collider_synthetic_{:02}.json", outcome.stage.index()))
            );
        }

        let last = load_checkpoint(&config.checkpoint(Stage::BeamBeamConfigured)).unwrap();
        let line = last.beam_line(Beam::B1).unwrap();
        assert_eq!(line.lens_count(EncounterKind::HeadOn), 44);
        assert!(last.knob("on_sep8").unwrap() != 0.0);
        assert_eq!(last.knob(BEAMBEAM_SCALE).unwrap(), 1.0);
        assert!(last.beambeam().unwrap().lenses.values().all(|l| l.other_beam_population() > 0.0));
        assert!((last.knob("corr_co_h.b1").unwrap() + 1e-4).abs() < 1e-8);
        assert!(outcomes[4].report.total_comparisons() > 4000);
    }

    #[test]
    fn stage_resumes_from_previous_checkpoint() {
        let dir = tempdir().unwrap();
        let config = pipeline_config(dir.path().to_path_buf());
        let reporter = ProgressReporter::new();
        let backend = SyntheticBackend::new();

        start_pipeline(&synthetic_collider(), &config, &reporter).unwrap();
        let installed = run_stage(Stage::BeamBeamInstalled, &backend, &config, &reporter).unwrap();
        assert!(installed.report.sections.iter().any(|s| s.name == "checkpoint integrity"));

        let tuned = run_stage(Stage::Tuned, &backend, &config, &reporter).unwrap();
        let collider = load_checkpoint(&tuned.checkpoint).unwrap();
        assert_eq!(collider.knob("on_x8").unwrap(), -250.0);
    }

    #[test]
    fn missing_previous_checkpoint_is_reported() {
        let dir = tempdir().unwrap();
        let config = pipeline_config(dir.path().to_path_buf());
        let err = run_stage(Stage::Leveled, &SyntheticBackend::new(), &config, &ProgressReporter::new())
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::Checkpoint {
                source: CheckpointError::NotFound(_)
            }
        ));
        assert!(matches!(
            run_stage(Stage::SequenceBuilt, &SyntheticBackend::new(), &config, &ProgressReporter::new()),
            Err(EngineError::InvalidState(_))
        ));
    }

    #[test]
    fn sequence_without_reference_lines_is_rejected() {
        let dir = tempdir().unwrap();
        let config = pipeline_config(dir.path().to_path_buf());
        let mut collider = Collider::new();
        collider.add_line(synthetic_collider().beam_line(Beam::B1).unwrap().clone());
        assert!(matches!(
            start_pipeline(&collider, &config, &ProgressReporter::new()),
            Err(EngineError::Verification(_))
        ));
        assert!(!config.checkpoint(Stage::SequenceBuilt).exists());
    }

    #[test]
    fn invalid_tag_is_rejected() {
        let dir = tempdir().unwrap();
        let mut config = pipeline_config(dir.path().to_path_buf());
        config.tag = "a/b".to_string();
        assert!(matches!(
            start_pipeline(&synthetic_collider(), &config, &ProgressReporter::new()),
            Err(EngineError::Config { .. })
        ));
    }
}
