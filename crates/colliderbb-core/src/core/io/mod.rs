//! Persistence of collider models.
//!
//! Each pipeline stage writes its model to a JSON checkpoint so that the following
//! stage (or an inspection command) can pick it up from disk. The [`traits::ModelFile`]
//! trait is the common interface for checkpoint formats.

pub mod checkpoint;
pub mod traits;
