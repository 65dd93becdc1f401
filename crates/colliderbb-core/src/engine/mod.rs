//! # Engine Module
//!
//! Operations that act on a [`Collider`](crate::core::models::collider::Collider) in
//! place, one pipeline step at a time.
//!
//! ## Architecture
//!
//! - **Configuration** ([`config`]) - Validated parameter sets and their builders
//! - **Backend contracts** ([`backend`]) - Optics, survey and matching services
//! - **Installation** ([`install`]) - Placement of long-range and head-on lenses
//! - **Configuration of lenses** ([`configure`]) - Lens parameters from the optics of both beams
//! - **Luminosity** ([`luminosity`]) - Overlap integral, separations and crossing geometry
//! - **Leveling** ([`leveling`]) - Separation and luminosity leveling at the IPs
//! - **Tuning** ([`tuning`]) - Closed orbit, coupling, tune and chromaticity match jobs
//! - **Verification** ([`verify`]) - Closed-form checks of every lens and of the machine state
//! - **Progress Monitoring** ([`progress`]) - Progress events for a front end
//! - **Error Handling** ([`error`]) - The engine error type
//! - **Test support** (`testing`, feature `testing`) - A synthetic backend and collider
//!
//! The model is mutated in place and only through knobs and lens records. Every
//! numerical service is called synchronously and its failures are passed through
//! as [`backend::BackendError`].

pub mod backend;
pub mod config;
pub mod configure;
pub mod error;
pub mod install;
pub mod leveling;
pub mod luminosity;
pub mod progress;
pub mod tuning;
pub mod verify;

#[cfg(any(test, feature = "testing"))]
pub mod testing;
