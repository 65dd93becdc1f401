use phf::{Map, phf_map};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdParseError {
    #[error("Unknown beam line '{0}'. Expected 'lhcb1' or 'lhcb2'.")]
    UnknownBeam(String),
    #[error("Invalid interaction point '{0}'. Expected 'ip1' to 'ip8'.")]
    InvalidIp(String),
    #[error("Invalid lens side '{0}'. Expected 'l', 'r' or 'c'.")]
    InvalidSide(char),
    #[error("Malformed beam-beam lens name '{0}'")]
    MalformedLensName(String),
}

/// One of the two counter-rotating beams of the collider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Beam {
    B1,
    B2,
}

impl Beam {
    pub const ALL: [Beam; 2] = [Beam::B1, Beam::B2];

    pub fn line_name(self) -> &'static str {
        match self {
            Beam::B1 => "lhcb1",
            Beam::B2 => "lhcb2",
        }
    }

    /// Line holding the reference closed orbit used by orbit correction.
    pub fn co_ref_line_name(self) -> &'static str {
        match self {
            Beam::B1 => "lhcb1_co_ref",
            Beam::B2 => "lhcb2_co_ref",
        }
    }

    pub fn digit(self) -> char {
        match self {
            Beam::B1 => '1',
            Beam::B2 => '2',
        }
    }

    /// The beam that acts as the source of the field when `self` is tracked.
    pub fn other(self) -> Beam {
        match self {
            Beam::B1 => Beam::B2,
            Beam::B2 => Beam::B1,
        }
    }

    /// +1 for the clockwise beam, -1 for the anticlockwise one.
    pub fn sign(self) -> f64 {
        match self {
            Beam::B1 => 1.0,
            Beam::B2 => -1.0,
        }
    }

    pub fn direction(self) -> &'static str {
        match self {
            Beam::B1 => "clockwise",
            Beam::B2 => "anticlockwise",
        }
    }

    /// Sign of the longitudinal offset of lenses on `side` of an IP, as seen in this beam's line.
    pub fn sorting(self, side: Side) -> f64 {
        match (self, side) {
            (_, Side::Center) => 0.0,
            (Beam::B1, Side::Left) | (Beam::B2, Side::Right) => -1.0,
            (Beam::B1, Side::Right) | (Beam::B2, Side::Left) => 1.0,
        }
    }

    /// Side label of head-on slice `slice_index` (negative indices lie upstream of the IP).
    pub fn side_of_slice(self, slice_index: i32) -> Side {
        match slice_index.signum() {
            0 => Side::Center,
            -1 if self.sorting(Side::Left) < 0.0 => Side::Left,
            -1 => Side::Right,
            _ if self.sorting(Side::Right) > 0.0 => Side::Right,
            _ => Side::Left,
        }
    }
}

impl fmt::Display for Beam {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.line_name())
    }
}

impl FromStr for Beam {
    type Err = IdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "lhcb1" | "b1" => Ok(Beam::B1),
            "lhcb2" | "b2" => Ok(Beam::B2),
            other => Err(IdParseError::UnknownBeam(other.to_string())),
        }
    }
}

impl TryFrom<String> for Beam {
    type Error = IdParseError;
    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Beam> for String {
    fn from(beam: Beam) -> Self {
        beam.line_name().to_string()
    }
}

/// Interaction point `ip1` to `ip8`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Ip(u8);

impl Ip {
    pub const IP1: Ip = Ip(1);
    pub const IP2: Ip = Ip(2);
    pub const IP5: Ip = Ip(5);
    pub const IP8: Ip = Ip(8);

    pub fn new(number: u8) -> Result<Self, IdParseError> {
        if (1..=8).contains(&number) {
            Ok(Ip(number))
        } else {
            Err(IdParseError::InvalidIp(format!("ip{}", number)))
        }
    }

    pub fn number(self) -> u8 {
        self.0
    }

    pub fn name(self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Ip {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ip{}", self.0)
    }
}

impl FromStr for Ip {
    type Err = IdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || IdParseError::InvalidIp(s.to_string());
        let digits = s.trim().strip_prefix("ip").ok_or_else(invalid)?;
        let number: u8 = digits.parse().map_err(|_| invalid())?;
        Ip::new(number).map_err(|_| invalid())
    }
}

impl TryFrom<String> for Ip {
    type Error = IdParseError;
    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Ip> for String {
    fn from(ip: Ip) -> Self {
        ip.to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Left,
    Right,
    Center,
}

impl Side {
    pub fn code(self) -> char {
        match self {
            Side::Left => 'l',
            Side::Right => 'r',
            Side::Center => 'c',
        }
    }

    pub fn from_code(code: char) -> Result<Self, IdParseError> {
        match code {
            'l' => Ok(Side::Left),
            'r' => Ok(Side::Right),
            'c' => Ok(Side::Center),
            other => Err(IdParseError::InvalidSide(other)),
        }
    }
}

/// Transverse plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Plane {
    X,
    Y,
}

impl fmt::Display for Plane {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Plane::X => f.write_str("x"),
            Plane::Y => f.write_str("y"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EncounterKind {
    LongRange,
    HeadOn,
}

static ENCOUNTER_PREFIXES: Map<&'static str, EncounterKind> = phf_map! {
    "bb_lr" => EncounterKind::LongRange,
    "bb_ho" => EncounterKind::HeadOn,
};

impl EncounterKind {
    pub fn prefix(self) -> &'static str {
        match self {
            EncounterKind::LongRange => "bb_lr",
            EncounterKind::HeadOn => "bb_ho",
        }
    }
}

/// Typed identifier of a beam-beam lens, rendered as the element name used in the lines
/// (e.g. `bb_lr.l1b1_05`, `bb_ho.c5b2_00`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct LensId {
    pub kind: EncounterKind,
    pub ip: Ip,
    pub side: Side,
    pub beam: Beam,
    pub index: u16,
}

impl LensId {
    /// Long-range encounter number `index` (starting at 1) on `side` of `ip`.
    pub fn long_range(ip: Ip, side: Side, beam: Beam, index: u16) -> Self {
        Self {
            kind: EncounterKind::LongRange,
            ip,
            side,
            beam,
            index,
        }
    }

    /// Head-on slice with signed index `slice_index`; side and index follow the beam's sorting.
    pub fn head_on(ip: Ip, beam: Beam, slice_index: i32) -> Self {
        Self {
            kind: EncounterKind::HeadOn,
            ip,
            side: beam.side_of_slice(slice_index),
            beam,
            index: slice_index.unsigned_abs() as u16,
        }
    }

    /// The lens describing the same encounter in the other beam's line.
    pub fn partner(self) -> Self {
        Self {
            beam: self.beam.other(),
            ..self
        }
    }
}

impl fmt::Display for LensId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}{}b{}_{:02}",
            self.kind.prefix(),
            self.side.code(),
            self.ip.number(),
            self.beam.digit(),
            self.index
        )
    }
}

impl FromStr for LensId {
    type Err = IdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || IdParseError::MalformedLensName(s.to_string());

        let (prefix, rest) = s.split_once('.').ok_or_else(malformed)?;
        let kind = *ENCOUNTER_PREFIXES.get(prefix).ok_or_else(malformed)?;

        let (location, index) = rest.split_once('_').ok_or_else(malformed)?;
        let index: u16 = index.parse().map_err(|_| malformed())?;

        let mut chars = location.chars();
        let side = Side::from_code(chars.next().ok_or_else(malformed)?)?;
        let remainder: String = chars.collect();
        let (ip_digits, beam_digit) = remainder.split_once('b').ok_or_else(malformed)?;
        let ip = Ip::new(ip_digits.parse().map_err(|_| malformed())?)?;
        let beam = match beam_digit {
            "1" => Beam::B1,
            "2" => Beam::B2,
            _ => return Err(malformed()),
        };

        Ok(Self {
            kind,
            ip,
            side,
            beam,
            index,
        })
    }
}

impl TryFrom<String> for LensId {
    type Error = IdParseError;
    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<LensId> for String {
    fn from(id: LensId) -> Self {
        id.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn long_range_names_render_with_two_digit_index() {
        let id = LensId::long_range(Ip::IP1, Side::Left, Beam::B1, 5);
        assert_eq!(id.to_string(), "bb_lr.l1b1_05");
        assert_eq!(id.partner().to_string(), "bb_lr.l1b2_05");
    }

    #[test]
    fn head_on_names_follow_beam_sorting() {
        assert_eq!(LensId::head_on(Ip::IP5, Beam::B1, 0).to_string(), "bb_ho.c5b1_00");
        assert_eq!(LensId::head_on(Ip::IP5, Beam::B1, -3).to_string(), "bb_ho.l5b1_03");
        assert_eq!(LensId::head_on(Ip::IP5, Beam::B1, 2).to_string(), "bb_ho.r5b1_02");
        assert_eq!(LensId::head_on(Ip::IP5, Beam::B2, -3).to_string(), "bb_ho.r5b2_03");
        assert_eq!(LensId::head_on(Ip::IP5, Beam::B2, 2).to_string(), "bb_ho.l5b2_02");
    }

    #[test]
    fn lens_names_parse_back() {
        for name in ["bb_lr.r8b2_20", "bb_ho.c2b1_00", "bb_ho.l1b2_05"] {
            let id: LensId = name.parse().unwrap();
            assert_eq!(id.to_string(), name);
        }
        let id: LensId = "bb_lr.r8b2_20".parse().unwrap();
        assert_eq!(id.kind, EncounterKind::LongRange);
        assert_eq!(id.ip, Ip::IP8);
        assert_eq!(id.side, Side::Right);
        assert_eq!(id.beam, Beam::B2);
        assert_eq!(id.index, 20);
    }

    #[test]
    fn malformed_lens_names_are_rejected() {
        for name in ["bb_xx.l1b1_01", "bb_lr.l1b3_01", "bb_lr.x1b1_01", "bb_lr.l9b1_01", "bb_lr", "mq.12r1"] {
            assert!(name.parse::<LensId>().is_err(), "{name} should not parse");
        }
    }

    #[test]
    fn sorting_is_mirrored_between_beams() {
        assert_eq!(Beam::B1.sorting(Side::Left), -1.0);
        assert_eq!(Beam::B1.sorting(Side::Right), 1.0);
        assert_eq!(Beam::B2.sorting(Side::Left), 1.0);
        assert_eq!(Beam::B2.sorting(Side::Right), -1.0);
    }

    #[test]
    fn ip_parsing_accepts_only_valid_points() {
        assert_eq!("ip8".parse::<Ip>().unwrap(), Ip::IP8);
        assert!("ip0".parse::<Ip>().is_err());
        assert!("ip9".parse::<Ip>().is_err());
        assert!("5".parse::<Ip>().is_err());
    }

    #[test]
    fn lens_ids_serialize_as_names() {
        let id = LensId::long_range(Ip::IP2, Side::Right, Beam::B2, 1);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"bb_lr.r2b2_01\"");
        let back: LensId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}
