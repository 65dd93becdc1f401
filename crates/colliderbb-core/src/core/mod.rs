//! # Core Module
//!
//! Stateless numerics and the data structures describing a two-beam collider model.
//!
//! ## Architecture
//!
//! - **Special functions** ([`special`]) - Error function and normal distribution helpers
//! - **Bunch slicing** ([`slicing`]) - Equal-probability longitudinal centroids of a Gaussian bunch
//! - **Model representation** ([`models`]) - Lines, knobs, optics tables and beam-beam lenses
//! - **Persistence** ([`io`]) - JSON checkpoints of a full collider model
//!
//! Nothing in this layer talks to the optics backend; operations that need optics
//! live in [`crate::engine`].

pub mod io;
pub mod models;
pub mod slicing;
pub mod special;
