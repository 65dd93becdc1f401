use super::ids::EncounterKind;
use nalgebra::Matrix4;
use serde::{Deserialize, Serialize};

/// Smallest difference of the two transverse variances treated as non-round.
pub const DEFAULT_MIN_SIGMA_DIFF: f64 = 1e-10;
/// Determinant below which the 4D sigma matrix is treated as singular.
pub const DEFAULT_THRESHOLD_SINGULAR: f64 = 1e-28;

/// Offset in the six-dimensional phase space `(x, px, y, py, zeta, pzeta)`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PhaseSpaceOffset {
    pub x: f64,
    pub px: f64,
    pub y: f64,
    pub py: f64,
    pub zeta: f64,
    pub pzeta: f64,
}

impl PhaseSpaceOffset {
    pub fn is_zero(&self) -> bool {
        [self.x, self.px, self.y, self.py, self.zeta, self.pzeta]
            .iter()
            .all(|v| *v == 0.0)
    }
}

/// Bi-Gaussian 2D kick from a long-range encounter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LongRangeLens {
    pub other_beam_sigma_11: f64,
    pub other_beam_sigma_33: f64,
    pub other_beam_sigma_13: f64,
    pub ref_shift_x: f64,
    pub ref_shift_y: f64,
    pub other_beam_shift_x: f64,
    pub other_beam_shift_y: f64,
    pub other_beam_num_particles: f64,
    pub other_beam_q0: f64,
    pub scale_strength: f64,
    pub min_sigma_diff: f64,
}

impl LongRangeLens {
    pub fn unconfigured() -> Self {
        Self {
            other_beam_sigma_11: 0.0,
            other_beam_sigma_33: 0.0,
            other_beam_sigma_13: 0.0,
            ref_shift_x: 0.0,
            ref_shift_y: 0.0,
            other_beam_shift_x: 0.0,
            other_beam_shift_y: 0.0,
            other_beam_num_particles: 0.0,
            other_beam_q0: 1.0,
            scale_strength: 1.0,
            min_sigma_diff: DEFAULT_MIN_SIGMA_DIFF,
        }
    }
}

/// One longitudinal slice of the strong beam seen by a head-on lens.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OtherBeamSlice {
    pub num_particles: f64,
    pub zeta_center: f64,
    pub center: PhaseSpaceOffset,
    /// Second moments over `(x, px, y, py)`.
    pub sigma: Matrix4<f64>,
}

impl OtherBeamSlice {
    pub fn empty() -> Self {
        Self {
            num_particles: 0.0,
            zeta_center: 0.0,
            center: PhaseSpaceOffset::default(),
            sigma: Matrix4::zeros(),
        }
    }

    /// Element of the sigma matrix with 1-based indices, as in `Sigma_12`.
    pub fn sigma_ij(&self, i: usize, j: usize) -> f64 {
        self.sigma[(i - 1, j - 1)]
    }
}

/// Bi-Gaussian 3D (synchro-beam) kick from a head-on encounter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeadOnLens {
    pub slices: Vec<OtherBeamSlice>,
    pub ref_shift: PhaseSpaceOffset,
    pub other_beam_shift: PhaseSpaceOffset,
    /// Half crossing angle.
    pub phi: f64,
    /// Crossing plane angle, measured from the horizontal.
    pub alpha: f64,
    pub other_beam_q0: f64,
    pub scale_strength: f64,
    pub min_sigma_diff: f64,
    pub threshold_singular: f64,
    pub flag_beamstrahlung: bool,
}

impl HeadOnLens {
    pub fn unconfigured() -> Self {
        Self {
            slices: vec![OtherBeamSlice::empty()],
            ref_shift: PhaseSpaceOffset::default(),
            other_beam_shift: PhaseSpaceOffset::default(),
            phi: 0.0,
            alpha: 0.0,
            other_beam_q0: 1.0,
            scale_strength: 1.0,
            min_sigma_diff: DEFAULT_MIN_SIGMA_DIFF,
            threshold_singular: DEFAULT_THRESHOLD_SINGULAR,
            flag_beamstrahlung: false,
        }
    }

    pub fn num_slices_other_beam(&self) -> usize {
        self.slices.len()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum BeamBeamLens {
    LongRange(LongRangeLens),
    HeadOn(HeadOnLens),
}

impl BeamBeamLens {
    pub fn unconfigured(kind: EncounterKind) -> Self {
        match kind {
            EncounterKind::LongRange => BeamBeamLens::LongRange(LongRangeLens::unconfigured()),
            EncounterKind::HeadOn => BeamBeamLens::HeadOn(HeadOnLens::unconfigured()),
        }
    }

    pub fn kind(&self) -> EncounterKind {
        match self {
            BeamBeamLens::LongRange(_) => EncounterKind::LongRange,
            BeamBeamLens::HeadOn(_) => EncounterKind::HeadOn,
        }
    }

    pub fn scale_strength(&self) -> f64 {
        match self {
            BeamBeamLens::LongRange(l) => l.scale_strength,
            BeamBeamLens::HeadOn(l) => l.scale_strength,
        }
    }

    pub fn set_scale_strength(&mut self, value: f64) {
        match self {
            BeamBeamLens::LongRange(l) => l.scale_strength = value,
            BeamBeamLens::HeadOn(l) => l.scale_strength = value,
        }
    }

    /// Total charge of the other beam represented by the lens.
    pub fn other_beam_population(&self) -> f64 {
        match self {
            BeamBeamLens::LongRange(l) => l.other_beam_num_particles,
            BeamBeamLens::HeadOn(l) => l.slices.iter().map(|s| s.num_particles).sum(),
        }
    }

    pub fn as_long_range(&self) -> Option<&LongRangeLens> {
        match self {
            BeamBeamLens::LongRange(l) => Some(l),
            BeamBeamLens::HeadOn(_) => None,
        }
    }

    pub fn as_head_on(&self) -> Option<&HeadOnLens> {
        match self {
            BeamBeamLens::HeadOn(l) => Some(l),
            BeamBeamLens::LongRange(_) => None,
        }
    }
}
