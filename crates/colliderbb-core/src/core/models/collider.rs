use super::ids::{Beam, EncounterKind, Ip, LensId};
use super::knobs::{BEAMBEAM_SCALE, KnobError, KnobStore, Provenance};
use super::lens::BeamBeamLens;
use super::line::Line;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ColliderError {
    #[error("Line '{0}' not found in collider")]
    UnknownLine(String),
    #[error("Element '{element}' not found in line '{line}'")]
    UnknownElement { line: String, element: String },
    #[error("Beam-beam interactions have not been installed")]
    BeamBeamNotInstalled,
    #[error("Beam-beam lens '{0}' not found")]
    UnknownLens(LensId),
    #[error(transparent)]
    Knob(#[from] KnobError),
}

/// Per-IP installation settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IpEncounters {
    pub ip: Ip,
    pub num_long_range_per_side: usize,
    pub delay_in_slots: u32,
}

/// One row of the encounter table of a beam direction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncounterRecord {
    pub element_name: LensId,
    pub s_offset: f64,
    pub s_position: f64,
    /// Longitudinal centroid of the strong-beam slice, for head-on encounters.
    pub z_centroid: Option<f64>,
    pub delay_in_slots: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EncounterTables {
    pub clockwise: Vec<EncounterRecord>,
    pub anticlockwise: Vec<EncounterRecord>,
}

impl EncounterTables {
    pub fn for_beam(&self, beam: Beam) -> &[EncounterRecord] {
        match beam {
            Beam::B1 => &self.clockwise,
            Beam::B2 => &self.anticlockwise,
        }
    }

    pub fn for_beam_mut(&mut self, beam: Beam) -> &mut Vec<EncounterRecord> {
        match beam {
            Beam::B1 => &mut self.clockwise,
            Beam::B2 => &mut self.anticlockwise,
        }
    }
}

/// Everything the beam-beam installation left in the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BeamBeamRecord {
    pub harmonic_number: u32,
    pub bunch_spacing_buckets: u32,
    pub sigma_z: f64,
    pub num_slices_head_on: usize,
    pub ips: Vec<IpEncounters>,
    pub encounters: EncounterTables,
    pub lenses: BTreeMap<LensId, BeamBeamLens>,
}

impl BeamBeamRecord {
    pub fn ip_settings(&self, ip: Ip) -> Option<&IpEncounters> {
        self.ips.iter().find(|s| s.ip == ip)
    }

    pub fn lenses_of(&self, beam: Beam) -> impl Iterator<Item = (&LensId, &BeamBeamLens)> {
        self.lenses.iter().filter(move |(id, _)| id.beam == beam)
    }

    pub fn count(&self, beam: Beam, kind: EncounterKind) -> usize {
        self.lenses_of(beam).filter(|(id, _)| id.kind == kind).count()
    }
}

/// The two-beam model: lines, knobs, and the beam-beam configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Collider {
    lines: BTreeMap<String, Line>,
    knobs: KnobStore,
    beambeam: Option<BeamBeamRecord>,
}

impl Collider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_line(&mut self, line: Line) {
        self.lines.insert(line.name.clone(), line);
    }

    pub fn line_names(&self) -> impl Iterator<Item = &str> {
        self.lines.keys().map(String::as_str)
    }

    pub fn num_lines(&self) -> usize {
        self.lines.len()
    }

    pub fn line(&self, name: &str) -> Result<&Line, ColliderError> {
        self.lines
            .get(name)
            .ok_or_else(|| ColliderError::UnknownLine(name.to_string()))
    }

    pub fn line_mut(&mut self, name: &str) -> Result<&mut Line, ColliderError> {
        self.lines
            .get_mut(name)
            .ok_or_else(|| ColliderError::UnknownLine(name.to_string()))
    }

    pub fn beam_line(&self, beam: Beam) -> Result<&Line, ColliderError> {
        self.line(beam.line_name())
    }

    pub fn element_s(&self, line: &str, element: &str) -> Result<f64, ColliderError> {
        self.line(line)?
            .element(element)
            .map(|e| e.s)
            .ok_or_else(|| ColliderError::UnknownElement {
                line: line.to_string(),
                element: element.to_string(),
            })
    }

    pub fn knobs(&self) -> &KnobStore {
        &self.knobs
    }

    pub fn knob(&self, name: &str) -> Result<f64, ColliderError> {
        Ok(self.knobs.value(name)?)
    }

    /// Sets a knob and updates the model quantities that depend on it.
    pub fn set_knob(
        &mut self,
        name: &str,
        value: f64,
        provenance: Provenance,
    ) -> Result<(), ColliderError> {
        debug!(knob = name, value, %provenance, "Setting knob.");
        self.knobs.set(name, value, provenance)?;
        if name == BEAMBEAM_SCALE {
            if let Some(bb) = self.beambeam.as_mut() {
                for lens in bb.lenses.values_mut() {
                    lens.set_scale_strength(value);
                }
            }
        }
        Ok(())
    }

    /// Runs `action` with the given knob values and restores the previous ones afterwards,
    /// whether `action` succeeded or not.
    pub fn with_temp_knobs<R, E, F>(&mut self, knobs: &[(&str, f64)], action: F) -> Result<R, E>
    where
        F: FnOnce(&mut Self) -> Result<R, E>,
        E: From<ColliderError>,
    {
        let snapshot = self.knobs.snapshot(knobs.iter().map(|(name, _)| *name));
        let applied = knobs
            .iter()
            .try_for_each(|(name, value)| self.set_knob(name, *value, Provenance::Temporary));

        let result = match applied {
            Ok(()) => action(self),
            Err(e) => Err(E::from(e)),
        };

        self.restore_knobs(snapshot)?;
        result
    }

    fn restore_knobs(&mut self, snapshot: Vec<(String, Option<f64>)>) -> Result<(), ColliderError> {
        for (name, previous) in snapshot {
            match previous {
                Some(value) => self.set_knob(&name, value, Provenance::Restore)?,
                None => self.knobs.restore(vec![(name, None)])?,
            }
        }
        Ok(())
    }

    pub fn beambeam(&self) -> Result<&BeamBeamRecord, ColliderError> {
        self.beambeam
            .as_ref()
            .ok_or(ColliderError::BeamBeamNotInstalled)
    }

    pub fn beambeam_mut(&mut self) -> Result<&mut BeamBeamRecord, ColliderError> {
        self.beambeam
            .as_mut()
            .ok_or(ColliderError::BeamBeamNotInstalled)
    }

    pub fn is_beambeam_installed(&self) -> bool {
        self.beambeam.is_some()
    }

    pub fn set_beambeam(&mut self, record: BeamBeamRecord) {
        self.beambeam = Some(record);
    }

    pub fn take_beambeam(&mut self) -> Option<BeamBeamRecord> {
        self.beambeam.take()
    }

    pub fn lens(&self, id: LensId) -> Result<&BeamBeamLens, ColliderError> {
        self.beambeam()?
            .lenses
            .get(&id)
            .ok_or(ColliderError::UnknownLens(id))
    }

    pub fn lens_mut(&mut self, id: LensId) -> Result<&mut BeamBeamLens, ColliderError> {
        self.beambeam_mut()?
            .lenses
            .get_mut(&id)
            .ok_or(ColliderError::UnknownLens(id))
    }
}
