//! # Workflows Module
//!
//! High-level entry points that chain the engine operations into the staged
//! beam-beam pipeline.
//!
//! ## Architecture
//!
//! - **Pipeline** ([`pipeline`]) - Five stages, from the bare collider to a collider with
//!   configured and verified beam-beam lenses. Each stage reads the checkpoint of the
//!   previous one and writes its own, so a run can be resumed from any stage.

pub mod pipeline;
