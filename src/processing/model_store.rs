//! Versioned, atomically published sensor geometry and propagation model

use std::fmt;
use std::sync::{Arc, RwLock};

use log::{info, warn};
use serde::Serialize;

use crate::algorithms::calibrator::CalibrationOutcome;
use crate::algorithms::solver::SolveStatus;
use crate::core::{PropagationModel, SensorGeometry};

/// Geometry and propagation model that are always read together
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DrumModel {
    pub geometry: SensorGeometry,
    pub propagation: PropagationModel,
    /// Bumped on every publish
    pub version: u64,
}

impl DrumModel {
    /// First version of a model, for callers that never republish
    pub fn new(geometry: SensorGeometry, propagation: PropagationModel) -> Self {
        Self {
            geometry,
            propagation,
            version: 1,
        }
    }
}

/// Reasons a model could not be published
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishError {
    /// The calibration did not converge; its geometry is only a best effort
    NotConverged(SolveStatus),
}

impl fmt::Display for PublishError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PublishError::NotConverged(status) => {
                write!(f, "Refusing to publish calibration that ended with {:?}", status)
            }
        }
    }
}

impl std::error::Error for PublishError {}

/// Owner of the current [`DrumModel`]
///
/// Readers take an `Arc` snapshot and keep using it for the whole
/// computation, so they see either the old or the new model in full.
#[derive(Debug)]
pub struct ModelStore {
    current: RwLock<Arc<DrumModel>>,
}

impl ModelStore {
    /// Create a new store holding version 1 of the model
    pub fn new(geometry: SensorGeometry, propagation: PropagationModel) -> Self {
        Self {
            current: RwLock::new(Arc::new(DrumModel::new(geometry, propagation))),
        }
    }

    /// Current model
    pub fn snapshot(&self) -> Arc<DrumModel> {
        let guard = self.current.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(&guard)
    }

    pub fn version(&self) -> u64 {
        self.snapshot().version
    }

    /// Replace the model and return the new version
    pub fn publish(&self, geometry: SensorGeometry, propagation: PropagationModel) -> u64 {
        let mut guard = self.current.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        let version = guard.version + 1;
        *guard = Arc::new(DrumModel {
            geometry,
            propagation,
            version,
        });
        info!("published drum model version {}", version);
        version
    }

    /// Publish a converged calibration result
    pub fn publish_calibration(&self, outcome: &CalibrationOutcome) -> Result<u64, PublishError> {
        if !outcome.converged() {
            warn!("calibration not published: {:?}", outcome.status);
            return Err(PublishError::NotConverged(outcome.status));
        }
        Ok(self.publish(outcome.geometry.clone(), outcome.model))
    }
}
