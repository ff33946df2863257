//! Drum Head Impact Localization
//!
//! Estimates where a drum head was struck from the sample indices at which
//! the impact reached each sensor, and calibrates sensor positions and
//! propagation speed from recorded hits.

pub mod core;
pub mod algorithms;
pub mod processing;
pub mod validation;
pub mod utils;
pub mod api;
pub mod args;

// Re-export commonly used types
pub use crate::core::{
    ObservedHit, Position, PolarPosition, PositionAnnotation, PropagationModel, Sensor, SensorGeometry, SensorId,
};
pub use crate::algorithms::{
    calibrate, CalibrationOutcome, Calibrator, CancellationToken, Constraint, LagMap, LocationEstimate, Localizer,
    SolveStatus,
};
pub use crate::processing::{DrumModel, LagMapCache, ModelStore};
pub use crate::validation::{LocalizationError, LocalizationResult};
pub use crate::utils::ConfigurationManager;
