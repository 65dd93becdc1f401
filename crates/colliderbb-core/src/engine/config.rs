use crate::core::models::collider::IpEncounters;
use crate::core::models::ids::{Beam, Ip, Plane};
use crate::core::models::lens::{DEFAULT_MIN_SIGMA_DIFF, DEFAULT_THRESHOLD_SINGULAR};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Clone)]
pub enum ConfigError {
    #[error("Missing required parameter: {0}")]
    MissingParameter(&'static str),
    #[error("Invalid value for '{parameter}': {reason}")]
    Invalid {
        parameter: &'static str,
        reason: String,
    },
}

pub(crate) fn invalid(parameter: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        parameter,
        reason: reason.into(),
    }
}

pub(crate) fn require_positive(parameter: &'static str, value: f64) -> Result<f64, ConfigError> {
    if value.is_finite() && value > 0.0 {
        Ok(value)
    } else {
        Err(invalid(parameter, format!("must be positive and finite, got {}", value)))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BeamBeamInstallConfig {
    pub ips: Vec<IpEncounters>,
    pub num_slices_head_on: usize,
    pub harmonic_number: u32,
    pub bunch_spacing_buckets: u32,
    pub sigma_z: f64,
}

impl BeamBeamInstallConfig {
    pub fn builder() -> BeamBeamInstallConfigBuilder {
        BeamBeamInstallConfigBuilder::new()
    }

    /// Distance between two consecutive bunches along a line of length `circumference`.
    pub fn bunch_spacing_ds(&self, circumference: f64) -> f64 {
        circumference / f64::from(self.harmonic_number) * f64::from(self.bunch_spacing_buckets)
    }
}

#[derive(Default)]
pub struct BeamBeamInstallConfigBuilder {
    ips: Option<Vec<Ip>>,
    delay_at_ips_slots: Option<Vec<u32>>,
    num_long_range_encounters_per_side: Option<Vec<usize>>,
    num_slices_head_on: Option<usize>,
    harmonic_number: Option<u32>,
    bunch_spacing_buckets: Option<u32>,
    sigma_z: Option<f64>,
}

impl BeamBeamInstallConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ips(mut self, ips: Vec<Ip>) -> Self {
        self.ips = Some(ips);
        self
    }
    pub fn delay_at_ips_slots(mut self, delays: Vec<u32>) -> Self {
        self.delay_at_ips_slots = Some(delays);
        self
    }
    pub fn num_long_range_encounters_per_side(mut self, counts: Vec<usize>) -> Self {
        self.num_long_range_encounters_per_side = Some(counts);
        self
    }
    pub fn num_slices_head_on(mut self, n: usize) -> Self {
        self.num_slices_head_on = Some(n);
        self
    }
    pub fn harmonic_number(mut self, h: u32) -> Self {
        self.harmonic_number = Some(h);
        self
    }
    pub fn bunch_spacing_buckets(mut self, buckets: u32) -> Self {
        self.bunch_spacing_buckets = Some(buckets);
        self
    }
    pub fn sigma_z(mut self, sigma_z: f64) -> Self {
        self.sigma_z = Some(sigma_z);
        self
    }

    pub fn build(self) -> Result<BeamBeamInstallConfig, ConfigError> {
        let ips = self.ips.ok_or(ConfigError::MissingParameter("ips"))?;
        let delays = self
            .delay_at_ips_slots
            .ok_or(ConfigError::MissingParameter("delay_at_ips_slots"))?;
        let counts = self
            .num_long_range_encounters_per_side
            .ok_or(ConfigError::MissingParameter("num_long_range_encounters_per_side"))?;
        let num_slices_head_on = self
            .num_slices_head_on
            .ok_or(ConfigError::MissingParameter("num_slices_head_on"))?;
        let harmonic_number = self
            .harmonic_number
            .ok_or(ConfigError::MissingParameter("harmonic_number"))?;
        let bunch_spacing_buckets = self
            .bunch_spacing_buckets
            .ok_or(ConfigError::MissingParameter("bunch_spacing_buckets"))?;
        let sigma_z = self.sigma_z.ok_or(ConfigError::MissingParameter("sigma_z"))?;

        if ips.is_empty() {
            return Err(invalid("ips", "at least one interaction point is required"));
        }
        if delays.len() != ips.len() {
            return Err(invalid(
                "delay_at_ips_slots",
                format!("expected {} entries, got {}", ips.len(), delays.len()),
            ));
        }
        if counts.len() != ips.len() {
            return Err(invalid(
                "num_long_range_encounters_per_side",
                format!("expected {} entries, got {}", ips.len(), counts.len()),
            ));
        }
        for (i, ip) in ips.iter().enumerate() {
            if ips[..i].contains(ip) {
                return Err(invalid("ips", format!("'{}' listed twice", ip)));
            }
        }
        if num_slices_head_on == 0 || num_slices_head_on % 2 == 0 {
            return Err(invalid(
                "num_slices_head_on",
                format!("must be a positive odd number, got {}", num_slices_head_on),
            ));
        }
        if harmonic_number == 0 {
            return Err(invalid("harmonic_number", "must be positive"));
        }
        if bunch_spacing_buckets == 0 {
            return Err(invalid("bunch_spacing_buckets", "must be positive"));
        }
        let sigma_z = require_positive("sigma_z", sigma_z)?;

        let ips = ips
            .into_iter()
            .zip(delays)
            .zip(counts)
            .map(|((ip, delay_in_slots), num_long_range_per_side)| IpEncounters {
                ip,
                num_long_range_per_side,
                delay_in_slots,
            })
            .collect();

        Ok(BeamBeamInstallConfig {
            ips,
            num_slices_head_on,
            harmonic_number,
            bunch_spacing_buckets,
            sigma_z,
        })
    }
}

/// Strong-beam parameters used to fill the lenses.
#[derive(Debug, Clone, PartialEq)]
pub struct BeamBeamParams {
    pub num_particles: f64,
    pub nemitt_x: f64,
    pub nemitt_y: f64,
    /// Longitudinal offset at which the crab angle of the strong beam is measured.
    pub crab_zeta_offset: f64,
    pub min_sigma_diff: f64,
    pub threshold_singular: f64,
}

impl BeamBeamParams {
    pub const DEFAULT_CRAB_ZETA_OFFSET: f64 = 1e-2;

    pub fn new(num_particles: f64, nemitt_x: f64, nemitt_y: f64) -> Self {
        Self {
            num_particles,
            nemitt_x,
            nemitt_y,
            crab_zeta_offset: Self::DEFAULT_CRAB_ZETA_OFFSET,
            min_sigma_diff: DEFAULT_MIN_SIGMA_DIFF,
            threshold_singular: DEFAULT_THRESHOLD_SINGULAR,
        }
    }

    pub fn nemitt(&self, plane: Plane) -> f64 {
        match plane {
            Plane::X => self.nemitt_x,
            Plane::Y => self.nemitt_y,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        require_positive("num_particles", self.num_particles)?;
        require_positive("nemitt_x", self.nemitt_x)?;
        require_positive("nemitt_y", self.nemitt_y)?;
        require_positive("crab_zeta_offset", self.crab_zeta_offset)?;
        require_positive("min_sigma_diff", self.min_sigma_diff)?;
        require_positive("threshold_singular", self.threshold_singular)?;
        Ok(())
    }
}

/// Beam parameters entering the luminosity of one interaction point.
#[derive(Debug, Clone, PartialEq)]
pub struct LuminosityParams {
    pub ip: Ip,
    pub num_colliding_bunches: u32,
    pub num_particles_per_bunch: f64,
    pub nemitt_x: f64,
    pub nemitt_y: f64,
    pub sigma_z: f64,
    /// Crab cavities compensate the crossing angle.
    pub crab: bool,
}

impl LuminosityParams {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.num_colliding_bunches == 0 {
            return Err(invalid("num_colliding_bunches", "must be positive"));
        }
        require_positive("num_particles_per_bunch", self.num_particles_per_bunch)?;
        require_positive("nemitt_x", self.nemitt_x)?;
        require_positive("nemitt_y", self.nemitt_y)?;
        require_positive("sigma_z", self.sigma_z)?;
        Ok(())
    }
}

/// What a separation change at an IP must leave untouched.
///
/// The crossing angles of both beams at the IP are always held. `bump_ends` adds the
/// position and angle of one beam at an element past which the separation bump is closed.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct OrbitPreservation {
    /// Orbit correctors varied together with the separation knobs.
    pub correctors: Vec<String>,
    pub bump_ends: Vec<(Beam, String)>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LevelingTarget {
    /// Half separation of `n_sigma` beam sizes in `plane`, driven by `knob` (in mm).
    Separation {
        plane: Plane,
        n_sigma: f64,
        knob: String,
        preserve: OrbitPreservation,
    },
    /// Luminosity `value` reached by adjusting the separation knob `knob`.
    Luminosity {
        value: f64,
        knob: String,
        rtol: f64,
        initial_step: f64,
        max_iterations: usize,
    },
    /// Luminosity `value` matched by varying the separation `knobs` together, with the
    /// separation kept orthogonal to the crossing plane.
    MatchedLuminosity {
        value: f64,
        rtol: f64,
        knobs: Vec<String>,
        preserve: OrbitPreservation,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct IpLeveling {
    pub ip: Ip,
    pub target: LevelingTarget,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LevelingConfig {
    pub ips: Vec<IpLeveling>,
    pub num_colliding_bunches: Vec<(Ip, u32)>,
    pub num_particles_per_bunch: f64,
    pub nemitt_x: f64,
    pub nemitt_y: f64,
    pub sigma_z: f64,
    pub crab: bool,
}

impl LevelingConfig {
    pub fn luminosity_params(&self, ip: Ip) -> Result<LuminosityParams, ConfigError> {
        let num_colliding_bunches = self
            .num_colliding_bunches
            .iter()
            .find(|(i, _)| *i == ip)
            .map(|(_, n)| *n)
            .ok_or(ConfigError::MissingParameter("num_colliding_bunches"))?;
        let params = LuminosityParams {
            ip,
            num_colliding_bunches,
            num_particles_per_bunch: self.num_particles_per_bunch,
            nemitt_x: self.nemitt_x,
            nemitt_y: self.nemitt_y,
            sigma_z: self.sigma_z,
            crab: self.crab,
        };
        params.validate()?;
        Ok(params)
    }

    pub fn nemitt(&self, plane: Plane) -> f64 {
        match plane {
            Plane::X => self.nemitt_x,
            Plane::Y => self.nemitt_y,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        require_positive("nemitt_x", self.nemitt_x)?;
        require_positive("nemitt_y", self.nemitt_y)?;
        for leveling in &self.ips {
            match &leveling.target {
                LevelingTarget::Separation { n_sigma, .. } => {
                    if !n_sigma.is_finite() || *n_sigma < 0.0 {
                        return Err(invalid("n_sigma", format!("must be non-negative, got {}", n_sigma)));
                    }
                }
                LevelingTarget::Luminosity {
                    value,
                    rtol,
                    initial_step,
                    max_iterations,
                    ..
                } => {
                    require_positive("luminosity", *value)?;
                    require_positive("rtol", *rtol)?;
                    require_positive("initial_step", *initial_step)?;
                    if *max_iterations == 0 {
                        return Err(invalid("max_iterations", "must be positive"));
                    }
                    self.luminosity_params(leveling.ip)?;
                }
                LevelingTarget::MatchedLuminosity {
                    value, rtol, knobs, ..
                } => {
                    require_positive("luminosity", *value)?;
                    require_positive("rtol", *rtol)?;
                    if knobs.is_empty() {
                        return Err(invalid("knobs", "at least one separation knob is required"));
                    }
                    self.luminosity_params(leveling.ip)?;
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TuningTargets {
    pub qx: f64,
    pub qy: f64,
    pub dqx: f64,
    pub dqy: f64,
}

/// Names of the knobs used by the tuning of one line.
#[derive(Debug, Clone, PartialEq)]
pub struct TuningKnobs {
    pub q_knob_1: String,
    pub q_knob_2: String,
    pub dq_knob_1: String,
    pub dq_knob_2: String,
    pub c_minus_knob_1: String,
    pub c_minus_knob_2: String,
}

impl TuningKnobs {
    /// The conventional knob names of `beam` (`kqtf.b1`, `ksf.b1`, `c_minus_re_b1`, ...).
    pub fn for_beam(beam: Beam) -> Self {
        let b = beam.digit();
        Self {
            q_knob_1: format!("kqtf.b{}", b),
            q_knob_2: format!("kqtd.b{}", b),
            dq_knob_1: format!("ksf.b{}", b),
            dq_knob_2: format!("ksd.b{}", b),
            c_minus_knob_1: format!("c_minus_re_b{}", b),
            c_minus_knob_2: format!("c_minus_im_b{}", b),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TuningRequest {
    pub correct_closed_orbit: bool,
    pub correct_coupling: bool,
    pub match_tune: bool,
    pub match_chromaticity: bool,
    pub targets: TuningTargets,
    pub knobs: TuningKnobs,
    pub orbit_correctors: Vec<String>,
    pub knob_step: f64,
    pub tune_tol: f64,
    pub chromaticity_tol: f64,
    pub coupling_tol: f64,
    pub orbit_tol: f64,
}

impl TuningRequest {
    pub fn new(targets: TuningTargets, knobs: TuningKnobs) -> Self {
        Self {
            correct_closed_orbit: false,
            correct_coupling: false,
            match_tune: true,
            match_chromaticity: true,
            targets,
            knobs,
            orbit_correctors: Vec::new(),
            knob_step: 1e-8,
            tune_tol: 1e-5,
            chromaticity_tol: 1e-2,
            coupling_tol: 1e-4,
            orbit_tol: 1e-9,
        }
    }

    pub fn with_orbit_correction(mut self, correctors: Vec<String>) -> Self {
        self.correct_closed_orbit = true;
        self.orbit_correctors = correctors;
        self
    }

    pub fn with_coupling_correction(mut self) -> Self {
        self.correct_coupling = true;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.correct_closed_orbit && self.orbit_correctors.is_empty() {
            return Err(invalid(
                "orbit_correctors",
                "closed-orbit correction needs at least one corrector",
            ));
        }
        require_positive("knob_step", self.knob_step)?;
        require_positive("tune_tol", self.tune_tol)?;
        require_positive("chromaticity_tol", self.chromaticity_tol)?;
        require_positive("coupling_tol", self.coupling_tol)?;
        require_positive("orbit_tol", self.orbit_tol)?;
        Ok(())
    }
}

/// Expected machine state checked by the verification harness.
#[derive(Debug, Clone, PartialEq)]
pub struct VerifyConfig {
    pub beambeam: BeamBeamParams,
    /// Tunes without beam-beam, per beam.
    pub bb_off_tunes: Vec<(Beam, f64, f64)>,
    pub expected_tune_shift: f64,
    pub tune_shift_atol: f64,
    /// Tilt of the crossing plane of horizontally crossing IPs, as seen by beam 1.
    pub crossing_tilts: Vec<(Ip, f64)>,
    /// Compare tunes with the lenses on and off. Needs optics that follow the scale knob.
    pub check_tunes: bool,
}

impl VerifyConfig {
    pub fn new(beambeam: BeamBeamParams) -> Self {
        Self {
            beambeam,
            bb_off_tunes: Vec::new(),
            expected_tune_shift: -1.5e-2,
            tune_shift_atol: 4e-3,
            crossing_tilts: Vec::new(),
            check_tunes: true,
        }
    }

    pub fn crossing_tilt(&self, ip: Ip) -> f64 {
        self.crossing_tilts
            .iter()
            .find(|(i, _)| *i == ip)
            .map_or(0.0, |(_, tilt)| *tilt)
    }

    pub fn bb_off_tunes(&self, beam: Beam) -> Option<(f64, f64)> {
        self.bb_off_tunes
            .iter()
            .find(|(b, _, _)| *b == beam)
            .map(|(_, qx, qy)| (*qx, *qy))
    }
}
