//! Core types, coordinate transforms and constants for drum-head localization

pub mod types;
pub mod constants;
pub mod coordinates;

pub use types::*;
pub use constants::*;
pub use coordinates::{
    cartesian_to_polar, cartesian_to_spherical, normalize_angle_deg, polar_to_cartesian,
    sensor_from_spherical, spherical_to_cartesian, SphericalPosition,
};
