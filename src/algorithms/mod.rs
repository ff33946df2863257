//! Lag model, localization and calibration algorithms

pub mod solver;
pub mod lag_model;
pub mod localizer;
pub mod calibrator;

pub use solver::{CancellationToken, LeastSquaresProblem, LevenbergMarquardt, SolveStatus, SolverReport, SolverSettings};
pub use lag_model::{lag_field, theoretical_lag, GridSpec, LagMap, SensorPair, MAX_HALF_CELLS};
pub use localizer::{Confidence, LocationEstimate, Localizer, LocalizerConfig, QualityIssue};
pub use calibrator::{calibrate, CalibrationConfig, CalibrationOutcome, Calibrator, Constraint};
