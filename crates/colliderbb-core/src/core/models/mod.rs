//! # Core Models Module
//!
//! Data structures describing the collider: the beam lines with their elements,
//! the knob store, optics and survey tables exported by the backend, and the
//! beam-beam lenses installed at the interaction points.
//!
//! ## Key Components
//!
//! - [`ids`] - Typed identifiers for beams, interaction points and lens names
//! - [`knobs`] - Named parameters with a recorded history of who set them
//! - [`line`] - Reference particle and the element layout of one line
//! - [`lens`] - Long-range (2D) and head-on (3D) beam-beam lens parameters
//! - [`twiss`] / [`survey`] - Optics and geometry tables indexed by element name
//! - [`collider`] - The complete two-beam model
//!
//! ## Usage
//!
//! ```ignore
//! use colliderbb::core::models::{collider::Collider, knobs::Provenance};
//!
//! let mut collider = Collider::from_json_path(path)?;
//! collider.set_knob("on_x1", 250.0, Provenance::Settings)?;
//! let lens = collider.lens("bb_ho.c1b1_00".parse()?)?;
//! ```

pub mod collider;
pub mod ids;
pub mod knobs;
pub mod lens;
pub mod line;
pub mod survey;
pub(crate) mod table;
pub mod twiss;

pub use table::TableError;
