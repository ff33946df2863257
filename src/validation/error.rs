use std::fmt;
use serde::{Serialize, Deserialize};

use crate::core::SensorId;

/// Result type for localization and calibration operations
pub type LocalizationResult<T> = Result<T, LocalizationError>;

/// Error classification for the localization core
///
/// Input and geometry problems abort the call. Convergence problems are not
/// errors: they are reported as a flag on the returned estimate (see
/// [`crate::algorithms::solver::SolveStatus`]).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LocalizationError {
    /// Degenerate or malformed sensor layout, coordinates or model parameters
    InvalidGeometry {
        issue: GeometryIssue,
        details: String,
    },
    /// Fewer usable sensors in a hit than a unique 2D solution needs
    InsufficientObservations {
        available: usize,
        required: usize,
    },
    /// A hit references a sensor the geometry does not declare
    UnknownSensor {
        id: SensorId,
    },
    /// An arrival sample index that is negative or not finite
    InvalidObservation {
        sensor: SensorId,
        value: f64,
    },
    /// The calibration problem cannot identify its parameters
    CalibrationIllPosed {
        reason: String,
        condition_number: Option<f64>,
    },
}

/// Types of geometric issues that invalidate a layout or model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GeometryIssue {
    NonFinite,
    CoincidentSensors,
    TooFewSensors,
    DuplicateName,
    NonPositiveRadius,
    NonPositiveSpeed,
    NonPositiveSampleRate,
    InvalidConstraint,
}

impl LocalizationError {
    pub fn invalid_geometry(issue: GeometryIssue, details: impl Into<String>) -> Self {
        LocalizationError::InvalidGeometry {
            issue,
            details: details.into(),
        }
    }

    pub fn ill_posed(reason: impl Into<String>, condition_number: Option<f64>) -> Self {
        LocalizationError::CalibrationIllPosed {
            reason: reason.into(),
            condition_number,
        }
    }

    /// Short, stable name of the error kind for logs and reports
    pub fn kind(&self) -> &'static str {
        match self {
            LocalizationError::InvalidGeometry { .. } => "InvalidGeometry",
            LocalizationError::InsufficientObservations { .. } => "InsufficientObservations",
            LocalizationError::UnknownSensor { .. } => "UnknownSensor",
            LocalizationError::InvalidObservation { .. } => "InvalidObservation",
            LocalizationError::CalibrationIllPosed { .. } => "CalibrationIllPosed",
        }
    }
}

impl fmt::Display for GeometryIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            GeometryIssue::NonFinite => "non-finite value",
            GeometryIssue::CoincidentSensors => "coincident sensors",
            GeometryIssue::TooFewSensors => "too few sensors",
            GeometryIssue::DuplicateName => "duplicate sensor name",
            GeometryIssue::NonPositiveRadius => "non-positive radius",
            GeometryIssue::NonPositiveSpeed => "non-positive propagation speed",
            GeometryIssue::NonPositiveSampleRate => "non-positive sample rate",
            GeometryIssue::InvalidConstraint => "invalid constraint",
        };
        f.write_str(text)
    }
}

impl fmt::Display for LocalizationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LocalizationError::InvalidGeometry { issue, details } => {
                write!(f, "Invalid geometry ({}): {}", issue, details)
            }
            LocalizationError::InsufficientObservations { available, required } => {
                write!(f, "Insufficient observations: {} usable sensors, {} required", available, required)
            }
            LocalizationError::UnknownSensor { id } => {
                write!(f, "Unknown sensor {}", id)
            }
            LocalizationError::InvalidObservation { sensor, value } => {
                write!(f, "Invalid arrival sample {} for sensor {}", value, sensor)
            }
            LocalizationError::CalibrationIllPosed { reason, condition_number } => match condition_number {
                Some(cond) => write!(f, "Calibration ill-posed: {} (condition number {:.3e})", reason, cond),
                None => write!(f, "Calibration ill-posed: {}", reason),
            },
        }
    }
}

impl std::error::Error for LocalizationError {}
