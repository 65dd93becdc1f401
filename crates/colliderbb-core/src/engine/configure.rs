use super::backend::{OpticsService, SurveyService, TwissOptions};
use super::config::BeamBeamParams;
use super::error::EngineError;
use super::progress::{Progress, ProgressReporter};
use crate::core::models::collider::Collider;
use crate::core::models::ids::{Beam, EncounterKind, Ip, LensId};
use crate::core::models::knobs::BEAMBEAM_SCALE;
use crate::core::models::lens::{
    BeamBeamLens, HeadOnLens, LongRangeLens, OtherBeamSlice, PhaseSpaceOffset,
};
use crate::core::models::survey::SurveyTable;
use crate::core::models::twiss::TwissTable;
use nalgebra::Matrix4;
use std::collections::BTreeMap;
use std::f64::consts::{FRAC_PI_2, PI};
use tracing::{debug, info, instrument};

/// Optics of a weak beam and of the strong beam it sees, both in the weak beam's frame.
///
/// All tables are computed with the beam-beam lenses switched off.
#[derive(Debug, Clone)]
pub struct WeakStrongOptics {
    pub weak: Beam,
    pub tw_weak: TwissTable,
    pub tw_strong: TwissTable,
    /// Strong beam orbit for a particle at `+crab_zeta_offset`, reversed.
    pub tw_strong_crab_plus: TwissTable,
    /// Strong beam orbit for a particle at `-crab_zeta_offset`, reversed.
    pub tw_strong_crab_minus: TwissTable,
    pub crab_zeta_offset: f64,
    pub beta0_strong: f64,
    pub gamma0_strong: f64,
}

impl WeakStrongOptics {
    /// Twisses both beams with `beambeam_scale` set to zero for the duration of the call.
    pub fn collect<B: OpticsService + ?Sized>(
        collider: &mut Collider,
        backend: &B,
        weak: Beam,
        crab_zeta_offset: f64,
    ) -> Result<Self, EngineError> {
        let strong = weak.other();
        let reference = collider.beam_line(strong)?.reference;
        collider.with_temp_knobs(&[(BEAMBEAM_SCALE, 0.0)], |c| {
            let tw_weak = backend.twiss(c, weak, &TwissOptions::default())?;
            let tw_strong = backend
                .twiss(c, strong, &TwissOptions::default())?
                .reverse();
            // The strong line runs backwards, so the physical offset is mirrored.
            let tw_strong_crab_plus = backend
                .twiss(c, strong, &TwissOptions::off_centre(-crab_zeta_offset))?
                .reverse();
            let tw_strong_crab_minus = backend
                .twiss(c, strong, &TwissOptions::off_centre(crab_zeta_offset))?
                .reverse();
            Ok(Self {
                weak,
                tw_weak,
                tw_strong,
                tw_strong_crab_plus,
                tw_strong_crab_minus,
                crab_zeta_offset,
                beta0_strong: reference.beta0,
                gamma0_strong: reference.gamma0,
            })
        })
    }

    pub fn beta_gamma_strong(&self) -> f64 {
        self.beta0_strong * self.gamma0_strong
    }

    /// Crab angles `(φx, φy)` of the strong beam at `ip`.
    pub fn crab_angles(&self, ip: Ip) -> Result<(f64, f64), EngineError> {
        let name = ip.name();
        let plus = self.tw_strong_crab_plus.row(&name)?;
        let minus = self.tw_strong_crab_minus.row(&name)?;
        let z = self.crab_zeta_offset;
        Ok((
            -(plus.x - minus.x) / (2.0 * z),
            -(plus.y - minus.y) / (2.0 * z),
        ))
    }
}

/// Surveys of both beams in a frame centred on `ip`, the strong one reversed.
pub fn survey_pair<B: SurveyService + ?Sized>(
    collider: &Collider,
    backend: &B,
    weak: Beam,
    ip: Ip,
) -> Result<(SurveyTable, SurveyTable), EngineError> {
    let name = ip.name();
    let survey_weak = backend.survey(collider, weak, &name)?;
    let survey_strong = backend.survey(collider, weak.other(), &name)?.reverse();
    Ok((survey_weak, survey_strong))
}

/// Splits the full crossing angle `(dpx, dpy)` into a half angle and the angle of the
/// crossing plane with the horizontal, with the plane angle folded into `(-π/2, π/2]`.
pub fn crossing_geometry(dpx: f64, dpy: f64) -> (f64, f64) {
    let mut phi = 0.5 * dpx.hypot(dpy);
    let mut alpha = dpy.atan2(dpx);
    if alpha > FRAC_PI_2 {
        alpha -= PI;
        phi = -phi;
    } else if alpha <= -FRAC_PI_2 {
        alpha += PI;
        phi = -phi;
    }
    (phi, alpha)
}

/// Transverse displacement of a strong-beam slice at `z` produced by a crab angle `phi_crab`.
pub fn crab_displacement(phi_crab: f64, z: f64, circumference: f64, harmonic_number: u32) -> f64 {
    let h = f64::from(harmonic_number);
    phi_crab * circumference / (2.0 * PI * h) * (2.0 * PI * z * h / circumference).sin()
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConfigureSummary {
    pub long_range: usize,
    pub head_on: usize,
}

/// Fills every installed lens from the optics of both beams.
#[instrument(skip_all, name = "configure_beambeam")]
pub fn configure_beambeam_interactions<B>(
    collider: &mut Collider,
    backend: &B,
    params: &BeamBeamParams,
    reporter: &ProgressReporter,
) -> Result<ConfigureSummary, EngineError>
where
    B: OpticsService + SurveyService + ?Sized,
{
    params.validate()?;
    let record = collider.beambeam()?.clone();
    let scale_strength = collider.knob(BEAMBEAM_SCALE)?;

    reporter.report(Progress::TaskStart {
        total_steps: (Beam::ALL.len() * record.ips.len()) as u64,
    });

    let mut configured: Vec<(LensId, BeamBeamLens)> = Vec::with_capacity(record.lenses.len());
    for weak in Beam::ALL {
        let optics = WeakStrongOptics::collect(collider, backend, weak, params.crab_zeta_offset)?;
        let eps_x = params.nemitt_x / optics.beta_gamma_strong();
        let eps_y = params.nemitt_y / optics.beta_gamma_strong();
        let z_centroids: BTreeMap<LensId, f64> = record
            .encounters
            .for_beam(weak)
            .iter()
            .filter_map(|r| r.z_centroid.map(|z| (r.element_name, z)))
            .collect();

        for settings in &record.ips {
            let ip = settings.ip;
            let (survey_weak, survey_strong) = survey_pair(collider, backend, weak, ip)?;
            let ip_name = ip.name();
            let ip_weak = optics.tw_weak.row(&ip_name)?;
            let ip_strong = optics.tw_strong.row(&ip_name)?;
            let (phi, alpha) = crossing_geometry(ip_weak.px - ip_strong.px, ip_weak.py - ip_strong.py);
            let (phi_crab_x, phi_crab_y) = optics.crab_angles(ip)?;
            debug!(beam = %weak, %ip, phi, alpha, phi_crab_x, phi_crab_y, "Crossing geometry.");

            for (&id, _) in record.lenses_of(weak).filter(|(id, _)| id.ip == ip) {
                let name = id.to_string();
                let partner = id.partner().to_string();
                let w = optics.tw_weak.row(&name)?;
                let s = optics.tw_strong.row(&partner)?;
                let shift_x = s.x - w.x + survey_strong.big_x(&partner)? - survey_weak.big_x(&name)?;
                let shift_y = s.y - w.y + survey_strong.big_y(&partner)? - survey_weak.big_y(&name)?;

                let lens = match id.kind {
                    EncounterKind::LongRange => BeamBeamLens::LongRange(LongRangeLens {
                        other_beam_sigma_11: s.betx * eps_x,
                        other_beam_sigma_33: s.bety * eps_y,
                        other_beam_sigma_13: 0.0,
                        ref_shift_x: w.x,
                        ref_shift_y: w.y,
                        other_beam_shift_x: shift_x,
                        other_beam_shift_y: shift_y,
                        other_beam_num_particles: params.num_particles,
                        other_beam_q0: 1.0,
                        scale_strength,
                        min_sigma_diff: params.min_sigma_diff,
                    }),
                    EncounterKind::HeadOn => {
                        let z = *z_centroids.get(&id).ok_or_else(|| {
                            EngineError::InvalidState(format!("no slice centroid recorded for '{}'", id))
                        })?;
                        let circumference = optics.tw_strong.circumference();
                        let mut sigma = Matrix4::zeros();
                        sigma[(0, 0)] = s.betx * eps_x;
                        sigma[(0, 1)] = -s.alfx * eps_x;
                        sigma[(1, 0)] = -s.alfx * eps_x;
                        sigma[(1, 1)] = s.gamx * eps_x;
                        sigma[(2, 2)] = s.bety * eps_y;
                        sigma[(2, 3)] = -s.alfy * eps_y;
                        sigma[(3, 2)] = -s.alfy * eps_y;
                        sigma[(3, 3)] = s.gamy * eps_y;

                        BeamBeamLens::HeadOn(HeadOnLens {
                            slices: vec![OtherBeamSlice {
                                num_particles: params.num_particles
                                    / record.num_slices_head_on as f64,
                                sigma,
                                ..OtherBeamSlice::empty()
                            }],
                            ref_shift: PhaseSpaceOffset {
                                x: w.x,
                                px: w.px,
                                y: w.y,
                                py: w.py,
                                zeta: w.zeta,
                                pzeta: w.ptau / optics.beta0_strong,
                            },
                            other_beam_shift: PhaseSpaceOffset {
                                x: shift_x
                                    - crab_displacement(phi_crab_x, z, circumference, record.harmonic_number),
                                y: shift_y
                                    - crab_displacement(phi_crab_y, z, circumference, record.harmonic_number),
                                ..PhaseSpaceOffset::default()
                            },
                            phi,
                            alpha,
                            other_beam_q0: 1.0,
                            scale_strength,
                            min_sigma_diff: params.min_sigma_diff,
                            threshold_singular: params.threshold_singular,
                            flag_beamstrahlung: false,
                        })
                    }
                };
                debug!(lens = %id, "Lens configured.");
                configured.push((id, lens));
            }
            reporter.report(Progress::TaskIncrement);
        }
        info!(beam = %weak, "Beam-beam lenses configured for weak beam.");
    }
    reporter.report(Progress::TaskFinish);

    let mut summary = ConfigureSummary {
        long_range: 0,
        head_on: 0,
    };
    for (id, lens) in configured {
        match id.kind {
            EncounterKind::LongRange => summary.long_range += 1,
            EncounterKind::HeadOn => summary.head_on += 1,
        }
        *collider.lens_mut(id)? = lens;
    }
    info!(
        long_range = summary.long_range,
        head_on = summary.head_on,
        num_particles = params.num_particles,
        "Beam-beam configuration complete."
    );
    Ok(summary)
}
