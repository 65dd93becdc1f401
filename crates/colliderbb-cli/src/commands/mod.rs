pub mod inspect;
pub mod install;
pub mod luminosity;
pub mod slices;
pub mod verify;
