//! Luminosity and beam separation at an interaction point, from the optics of both beams.
//!
//! Beam 2 is described in its own direction of motion; its table is reversed before
//! it is compared with beam 1 so that both are expressed in the same frame.

use super::config::LuminosityParams;
use super::error::EngineError;
use crate::core::models::TableError;
use crate::core::models::ids::{Ip, Plane};
use crate::core::models::twiss::{TwissRow, TwissTable};
use std::f64::consts::PI;

pub const SPEED_OF_LIGHT: f64 = 299_792_458.0;

/// Closed orbits and optics of the two beams at one IP, in the frame of beam 1.
#[derive(Debug, Clone, PartialEq)]
pub struct IpGeometry {
    pub b1: TwissRow,
    pub b2: TwissRow,
    pub beta_gamma_b1: f64,
    pub beta_gamma_b2: f64,
}

impl IpGeometry {
    pub fn from_twiss(tw_b1: &TwissTable, tw_b2: &TwissTable, ip: Ip) -> Result<Self, TableError> {
        let name = ip.name();
        let b2_reversed = tw_b2.reverse();
        Ok(Self {
            b1: tw_b1.row(&name)?.clone(),
            b2: b2_reversed.row(&name)?.clone(),
            beta_gamma_b1: tw_b1.summary().beta0 * tw_b1.summary().gamma0,
            beta_gamma_b2: tw_b2.summary().beta0 * tw_b2.summary().gamma0,
        })
    }

    /// Offset of beam 1 with respect to beam 2.
    pub fn separation(&self, plane: Plane) -> f64 {
        match plane {
            Plane::X => self.b1.x - self.b2.x,
            Plane::Y => self.b1.y - self.b2.y,
        }
    }

    /// Full crossing angle in `plane`.
    pub fn crossing_angle(&self, plane: Plane) -> f64 {
        match plane {
            Plane::X => self.b1.px - self.b2.px,
            Plane::Y => self.b1.py - self.b2.py,
        }
    }

    /// RMS sizes of beam 1 and beam 2 in `plane`.
    pub fn beam_sizes(&self, plane: Plane, nemitt: f64) -> (f64, f64) {
        let (beta1, beta2) = match plane {
            Plane::X => (self.b1.betx, self.b2.betx),
            Plane::Y => (self.b1.bety, self.b2.bety),
        };
        (
            (beta1 * nemitt / self.beta_gamma_b1).sqrt(),
            (beta2 * nemitt / self.beta_gamma_b2).sqrt(),
        )
    }

    /// Beam size computed from the geometric mean of the two betas, using beam 1's energy.
    pub fn mean_beam_size(&self, plane: Plane, nemitt: f64) -> f64 {
        let mean_beta = match plane {
            Plane::X => (self.b1.betx * self.b2.betx).sqrt(),
            Plane::Y => (self.b1.bety * self.b2.bety).sqrt(),
        };
        (nemitt * mean_beta / self.beta_gamma_b1).sqrt()
    }
}

/// Inputs of the closed-form overlap integral of two Gaussian bunches.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OverlapInputs {
    pub f_rev: f64,
    pub num_colliding_bunches: f64,
    pub num_particles_per_bunch: f64,
    /// Quadrature sums `sqrt(σ₁² + σ₂²)` of the two beams.
    pub sigma_x: f64,
    pub sigma_y: f64,
    pub sigma_z: f64,
    pub dx: f64,
    pub dy: f64,
    /// Half crossing angles.
    pub phi_x: f64,
    pub phi_y: f64,
}

pub fn overlap_luminosity(inputs: &OverlapInputs) -> f64 {
    let OverlapInputs {
        f_rev,
        num_colliding_bunches,
        num_particles_per_bunch,
        sigma_x,
        sigma_y,
        sigma_z,
        dx,
        dy,
        phi_x,
        phi_y,
    } = *inputs;

    let sx2 = sigma_x * sigma_x;
    let sy2 = sigma_y * sigma_y;
    let (tx, ty) = (phi_x.tan(), phi_y.tan());

    let a = 1.0 / (sigma_z * sigma_z) + 2.0 * tx * tx / sx2 + 2.0 * ty * ty / sy2;
    let b = 2.0 * (tx * dx / sx2 + ty * dy / sy2);
    let c = dx * dx / (2.0 * sx2) + dy * dy / (2.0 * sy2);

    let head_on = f_rev * num_colliding_bunches * num_particles_per_bunch * num_particles_per_bunch
        / (2.0 * PI * sigma_x * sigma_y);
    head_on / (a * sigma_z * sigma_z).sqrt() * (b * b / (4.0 * a) - c).exp()
}

/// Revolution frequency of a particle with velocity `beta0·c` on a ring of length `circumference`.
pub fn revolution_frequency(beta0: f64, circumference: f64) -> f64 {
    beta0 * SPEED_OF_LIGHT / circumference
}

/// Luminosity of Gaussian bunches colliding at `params.ip`.
pub fn luminosity_from_twiss(
    params: &LuminosityParams,
    tw_b1: &TwissTable,
    tw_b2: &TwissTable,
) -> Result<f64, EngineError> {
    params.validate()?;
    let geometry = IpGeometry::from_twiss(tw_b1, tw_b2, params.ip)?;

    let (sx1, sx2) = geometry.beam_sizes(Plane::X, params.nemitt_x);
    let (sy1, sy2) = geometry.beam_sizes(Plane::Y, params.nemitt_y);

    let (phi_x, phi_y) = if params.crab {
        (0.0, 0.0)
    } else {
        (
            geometry.crossing_angle(Plane::X) / 2.0,
            geometry.crossing_angle(Plane::Y) / 2.0,
        )
    };

    let summary = tw_b1.summary();
    Ok(overlap_luminosity(&OverlapInputs {
        f_rev: revolution_frequency(summary.beta0, summary.circumference),
        num_colliding_bunches: f64::from(params.num_colliding_bunches),
        num_particles_per_bunch: params.num_particles_per_bunch,
        sigma_x: (sx1 * sx1 + sx2 * sx2).sqrt(),
        sigma_y: (sy1 * sy1 + sy2 * sy2).sqrt(),
        sigma_z: params.sigma_z,
        dx: geometry.separation(Plane::X),
        dy: geometry.separation(Plane::Y),
        phi_x,
        phi_y,
    }))
}

/// Separation of the two beams at `ip` in units of the mean beam size.
pub fn normalized_separation(
    tw_b1: &TwissTable,
    tw_b2: &TwissTable,
    ip: Ip,
    plane: Plane,
    nemitt: f64,
) -> Result<f64, EngineError> {
    let geometry = IpGeometry::from_twiss(tw_b1, tw_b2, ip)?;
    Ok(geometry.separation(plane).abs() / geometry.mean_beam_size(plane, nemitt))
}

/// Cosine of the angle between the crossing and separation vectors at `ip`.
/// Zero when the beams are separated orthogonally to the crossing plane, or when
/// either vector vanishes.
pub fn separation_orthogonality(
    tw_b1: &TwissTable,
    tw_b2: &TwissTable,
    ip: Ip,
) -> Result<f64, EngineError> {
    let geometry = IpGeometry::from_twiss(tw_b1, tw_b2, ip)?;
    let (dpx, dpy) = (
        geometry.crossing_angle(Plane::X),
        geometry.crossing_angle(Plane::Y),
    );
    let (dx, dy) = (geometry.separation(Plane::X), geometry.separation(Plane::Y));
    let norm = dpx.hypot(dpy) * dx.hypot(dy);
    if norm == 0.0 {
        return Ok(0.0);
    }
    Ok((dpx * dx + dpy * dy) / norm)
}
