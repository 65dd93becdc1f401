use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// Knob scaling the strength of every beam-beam lens.
pub const BEAMBEAM_SCALE: &str = "beambeam_scale";

#[derive(Debug, Error, Clone, PartialEq)]
pub enum KnobError {
    #[error("Unknown knob '{0}'")]
    Unknown(String),
    #[error("Knob '{name}' cannot take non-finite value {value}")]
    NonFinite { name: String, value: f64 },
}

/// Which stage of the pipeline wrote a knob value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "source", content = "detail")]
pub enum Provenance {
    Model,
    Settings,
    Manual,
    BeamBeamInstall,
    Tuning(String),
    Leveling(String),
    Matching(String),
    /// Scoped override, not recorded in the history.
    Temporary,
    /// Undo of a scoped override, not recorded in the history.
    Restore,
}

impl fmt::Display for Provenance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Provenance::Model => f.write_str("model"),
            Provenance::Settings => f.write_str("settings"),
            Provenance::Manual => f.write_str("manual"),
            Provenance::BeamBeamInstall => f.write_str("beam-beam install"),
            Provenance::Tuning(what) => write!(f, "tuning ({})", what),
            Provenance::Leveling(what) => write!(f, "leveling ({})", what),
            Provenance::Matching(what) => write!(f, "matching ({})", what),
            Provenance::Temporary => f.write_str("temporary"),
            Provenance::Restore => f.write_str("restore"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnobChange {
    pub value: f64,
    pub provenance: Provenance,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Knob {
    value: f64,
    history: Vec<KnobChange>,
}

impl Knob {
    pub fn value(&self) -> f64 {
        self.value
    }

    pub fn history(&self) -> &[KnobChange] {
        &self.history
    }

    pub fn last_provenance(&self) -> Option<&Provenance> {
        self.history.last().map(|c| &c.provenance)
    }
}

/// Named adjustable parameters of the model. Every write goes through [`KnobStore::set`].
///
/// The history keeps one entry per run of writes with the same provenance, so iterative
/// searches leave their final value only. Temporary overrides and their restores are not
/// recorded.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KnobStore {
    knobs: BTreeMap<String, Knob>,
}

impl KnobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, name: &str, value: f64, provenance: Provenance) -> Result<(), KnobError> {
        if !value.is_finite() {
            return Err(KnobError::NonFinite {
                name: name.to_string(),
                value,
            });
        }
        let knob = self.knobs.entry(name.to_string()).or_insert_with(|| Knob {
            value,
            history: Vec::new(),
        });
        knob.value = value;
        match provenance {
            Provenance::Temporary | Provenance::Restore => {}
            _ => match knob.history.last_mut() {
                Some(last) if last.provenance == provenance => last.value = value,
                _ => knob.history.push(KnobChange { value, provenance }),
            },
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.knobs.get(name).map(Knob::value)
    }

    pub fn value(&self, name: &str) -> Result<f64, KnobError> {
        self.get(name)
            .ok_or_else(|| KnobError::Unknown(name.to_string()))
    }

    pub fn knob(&self, name: &str) -> Option<&Knob> {
        self.knobs.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.knobs.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.knobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.knobs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.knobs.iter().map(|(k, v)| (k.as_str(), v.value))
    }

    /// Current values of `names`, `None` for knobs that do not exist yet.
    pub fn snapshot<'a>(&self, names: impl IntoIterator<Item = &'a str>) -> Vec<(String, Option<f64>)> {
        names
            .into_iter()
            .map(|n| (n.to_string(), self.get(n)))
            .collect()
    }

    /// Puts back values captured with [`KnobStore::snapshot`]; knobs that did not exist are removed.
    pub fn restore(&mut self, snapshot: Vec<(String, Option<f64>)>) -> Result<(), KnobError> {
        for (name, value) in snapshot {
            match value {
                Some(v) => self.set(&name, v, Provenance::Restore)?,
                None => {
                    self.knobs.remove(&name);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_records_value_and_provenance() {
        let mut store = KnobStore::new();
        store.set("on_x1", 250.0, Provenance::Settings).unwrap();
        store.set("on_x1", 200.0, Provenance::Manual).unwrap();

        let knob = store.knob("on_x1").unwrap();
        assert_eq!(knob.value(), 200.0);
        assert_eq!(knob.history().len(), 2);
        assert_eq!(knob.history()[0].provenance, Provenance::Settings);
        assert_eq!(knob.last_provenance(), Some(&Provenance::Manual));
    }

    #[test]
    fn unknown_knob_is_an_error() {
        let store = KnobStore::new();
        assert_eq!(store.get("on_sep2"), None);
        assert_eq!(
            store.value("on_sep2"),
            Err(KnobError::Unknown("on_sep2".to_string()))
        );
    }

    #[test]
    fn non_finite_values_are_rejected() {
        let mut store = KnobStore::new();
        assert!(store.set("qx", f64::NAN, Provenance::Manual).is_err());
        assert!(!store.contains("qx"));
    }

    #[test]
    fn snapshot_and_restore_round_trip() {
        let mut store = KnobStore::new();
        store.set(BEAMBEAM_SCALE, 1.0, Provenance::BeamBeamInstall).unwrap();

        let snapshot = store.snapshot([BEAMBEAM_SCALE, "on_disp"]);
        store.set(BEAMBEAM_SCALE, 0.0, Provenance::Temporary).unwrap();
        store.set("on_disp", 1.0, Provenance::Temporary).unwrap();
        store.restore(snapshot).unwrap();

        assert_eq!(store.get(BEAMBEAM_SCALE), Some(1.0));
        assert!(!store.contains("on_disp"));
        let knob = store.knob(BEAMBEAM_SCALE).unwrap();
        assert_eq!(knob.history().len(), 1);
        assert_eq!(knob.last_provenance(), Some(&Provenance::BeamBeamInstall));
    }

    #[test]
    fn repeated_overrides_leave_history_unchanged() {
        let mut store = KnobStore::new();
        store.set(BEAMBEAM_SCALE, 1.0, Provenance::BeamBeamInstall).unwrap();
        for _ in 0..50 {
            let snapshot = store.snapshot([BEAMBEAM_SCALE]);
            store.set(BEAMBEAM_SCALE, 0.0, Provenance::Temporary).unwrap();
            store.restore(snapshot).unwrap();
        }
        let history = store.knob(BEAMBEAM_SCALE).unwrap().history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].value, 1.0);
    }

    #[test]
    fn consecutive_writes_from_one_search_fold_into_one_entry() {
        let mut store = KnobStore::new();
        store.set("on_sep8", 0.0, Provenance::Model).unwrap();
        for step in 1..=30 {
            store
                .set("on_sep8", 1e-3 * f64::from(step), Provenance::Leveling("ip8".into()))
                .unwrap();
        }
        store.set("on_sep8", 0.05, Provenance::Manual).unwrap();

        let history = store.knob("on_sep8").unwrap().history();
        let provenances: Vec<_> = history.iter().map(|c| c.provenance.clone()).collect();
        assert_eq!(
            provenances,
            vec![Provenance::Model, Provenance::Leveling("ip8".into()), Provenance::Manual]
        );
        assert!((history[1].value - 0.03).abs() < 1e-15);
    }

    #[test]
    fn store_serializes_with_history() {
        let mut store = KnobStore::new();
        store
            .set("on_sep8", 0.01, Provenance::Leveling("ip8".into()))
            .unwrap();
        let json = serde_json::to_string(&store).unwrap();
        let back: KnobStore = serde_json::from_str(&json).unwrap();
        assert_eq!(back, store);
    }
}
