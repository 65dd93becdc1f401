use super::ids::{EncounterKind, LensId};
use serde::{Deserialize, Serialize};

/// Proton rest energy in GeV.
pub const PROTON_MASS_GEV: f64 = 0.938_272_088_16;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ReferenceParticle {
    pub energy_tot_gev: f64,
    pub mass_gev: f64,
    pub beta0: f64,
    pub gamma0: f64,
}

impl ReferenceParticle {
    pub fn proton(energy_tot_gev: f64) -> Self {
        Self::new(energy_tot_gev, PROTON_MASS_GEV)
    }

    pub fn new(energy_tot_gev: f64, mass_gev: f64) -> Self {
        let gamma0 = energy_tot_gev / mass_gev;
        let beta0 = (1.0 - 1.0 / (gamma0 * gamma0)).sqrt();
        Self {
            energy_tot_gev,
            mass_gev,
            beta0,
            gamma0,
        }
    }

    /// Geometric emittance for a normalized emittance.
    pub fn geometric_emittance(&self, nemitt: f64) -> f64 {
        nemitt / (self.beta0 * self.gamma0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "lens", rename_all = "kebab-case")]
pub enum ElementKind {
    Marker,
    Magnet,
    BeamBeam(LensId),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Element {
    pub name: String,
    pub s: f64,
    pub kind: ElementKind,
}

impl Element {
    pub fn marker(name: impl Into<String>, s: f64) -> Self {
        Self {
            name: name.into(),
            s,
            kind: ElementKind::Marker,
        }
    }

    pub fn magnet(name: impl Into<String>, s: f64) -> Self {
        Self {
            name: name.into(),
            s,
            kind: ElementKind::Magnet,
        }
    }

    pub fn beambeam(id: LensId, s: f64) -> Self {
        Self {
            name: id.to_string(),
            s,
            kind: ElementKind::BeamBeam(id),
        }
    }

    pub fn lens_id(&self) -> Option<LensId> {
        match self.kind {
            ElementKind::BeamBeam(id) => Some(id),
            _ => None,
        }
    }
}

/// A beam line: reference particle and the element layout, sorted by `s`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Line {
    pub name: String,
    pub reference: ReferenceParticle,
    pub length: f64,
    elements: Vec<Element>,
}

impl Line {
    pub fn new(name: impl Into<String>, reference: ReferenceParticle, length: f64) -> Self {
        Self {
            name: name.into(),
            reference,
            length,
            elements: Vec::new(),
        }
    }

    pub fn with_elements(mut self, elements: impl IntoIterator<Item = Element>) -> Self {
        for element in elements {
            self.insert(element);
        }
        self
    }

    pub fn elements(&self) -> &[Element] {
        &self.elements
    }

    pub fn element(&self, name: &str) -> Option<&Element> {
        self.elements.iter().find(|e| e.name == name)
    }

    /// Inserts after every element at the same or smaller `s`.
    pub fn insert(&mut self, element: Element) {
        let at = self.elements.partition_point(|e| e.s <= element.s);
        self.elements.insert(at, element);
    }

    /// Wraps a position into `[0, length)`.
    pub fn wrap_s(&self, s: f64) -> f64 {
        s.rem_euclid(self.length)
    }

    pub fn lens_count(&self, kind: EncounterKind) -> usize {
        self.elements
            .iter()
            .filter_map(Element::lens_id)
            .filter(|id| id.kind == kind)
            .count()
    }

    pub fn remove_lenses(&mut self) -> usize {
        let before = self.elements.len();
        self.elements.retain(|e| e.lens_id().is_none());
        before - self.elements.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::models::ids::{Beam, Ip, Side};

    #[test]
    fn proton_at_7_tev_is_ultra_relativistic() {
        let p = ReferenceParticle::proton(7000.0);
        assert!((p.gamma0 - 7460.522_473_5).abs() < 1e-6);
        assert!(1.0 - p.beta0 < 1e-8);
        assert!((p.geometric_emittance(2.5e-6) - 2.5e-6 / p.gamma0 / p.beta0).abs() < 1e-22);
    }

    #[test]
    fn elements_stay_sorted_by_position() {
        let line = Line::new("lhcb1", ReferenceParticle::proton(7000.0), 100.0).with_elements([
            Element::marker("ip5", 50.0),
            Element::marker("ip1", 0.0),
            Element::magnet("mq.1", 20.0),
        ]);
        let names: Vec<&str> = line.elements().iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["ip1", "mq.1", "ip5"]);
    }

    #[test]
    fn wrap_s_handles_negative_offsets() {
        let line = Line::new("lhcb1", ReferenceParticle::proton(7000.0), 100.0);
        assert!((line.wrap_s(-3.75) - 96.25).abs() < 1e-12);
        assert_eq!(line.wrap_s(100.0), 0.0);
    }

    #[test]
    fn lens_elements_are_counted_and_removed() {
        let mut line = Line::new("lhcb1", ReferenceParticle::proton(7000.0), 100.0)
            .with_elements([Element::marker("ip1", 0.0)]);
        line.insert(Element::beambeam(LensId::head_on(Ip::IP1, Beam::B1, 0), 0.0));
        line.insert(Element::beambeam(
            LensId::long_range(Ip::IP1, Side::Right, Beam::B1, 1),
            3.75,
        ));
        assert_eq!(line.lens_count(EncounterKind::HeadOn), 1);
        assert_eq!(line.lens_count(EncounterKind::LongRange), 1);
        assert_eq!(line.elements()[1].name, "bb_ho.c1b1_00");
        assert_eq!(line.remove_lenses(), 2);
        assert_eq!(line.elements().len(), 1);
    }
}
