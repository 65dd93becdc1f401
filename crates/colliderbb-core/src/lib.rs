//! # colliderbb Core Library
//!
//! Beam-beam interaction modelling for a two-beam collider: analytic slicing of
//! Gaussian bunches, installation and configuration of beam-beam lenses, luminosity
//! and leveling, and numeric verification of the resulting lens parameters.
//!
//! ## Architectural Philosophy
//!
//! The library follows a three-layer architecture.
//!
//! - **[`core`]: The Foundation.** Stateless numerics (`special`, `slicing`) and the data
//!   models of the collider (`Collider`, `Line`, `KnobStore`, `TwissTable`, lenses), with
//!   JSON checkpoints.
//!
//! - **[`engine`]: The Logic Core.** Operations that mutate a `Collider` in place: lens
//!   installation and configuration, luminosity, leveling, machine tuning and the
//!   verification harness. Optics, survey and matching are reached through the traits
//!   in [`engine::backend`], so that the numerical backend stays an external collaborator.
//!
//! - **[`workflows`]: The Public API.** The staged pipeline that chains the engine
//!   operations and writes a checkpoint after every stage.

pub mod core;
pub mod engine;
pub mod workflows;
