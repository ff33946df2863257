//! Impact localization from pairwise arrival lags
//!
//! The inverse problem is solved as nonlinear least squares over (x, y):
//! a coarse grid search over the membrane provides a handful of separated
//! seeds, each is refined with Levenberg-Marquardt, and the lowest-cost
//! refinement wins. All observed pairs contribute, so extra sensors make the
//! fit overdetermined instead of being dropped.

use std::fmt;
use std::sync::Arc;

use log::debug;
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::algorithms::lag_model::{GridSpec, LagMap, SensorPair};
use crate::algorithms::solver::{LeastSquaresProblem, LevenbergMarquardt, SolveStatus, SolverReport, SolverSettings};
use crate::core::{cartesian_to_polar, ObservedHit, PolarPosition, Position, PropagationModel, SensorGeometry, MIN_SENSORS};
use crate::processing::cache::{LagMapCache, LagMapKey};
use crate::processing::model_store::DrumModel;
use crate::validation::{LocalizationError, LocalizationResult};

/// Relative cost difference under which two refined solutions tie
const TIE_TOLERANCE: f64 = 1e-6;

/// Localizer settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalizerConfig {
    /// Seed grid spacing as a fraction of the membrane radius
    pub grid_step_fraction: f64,
    /// Number of grid minima refined by the solver
    pub seed_count: usize,
    /// Minimum distance between seeds as a fraction of the membrane radius
    pub seed_separation_fraction: f64,
    /// RMS lag residual (samples) above which an estimate is low confidence
    pub max_rms_residual_samples: f64,
    pub solver: SolverSettings,
}

impl Default for LocalizerConfig {
    fn default() -> Self {
        Self {
            grid_step_fraction: 0.05,
            seed_count: 3,
            seed_separation_fraction: 0.2,
            max_rms_residual_samples: 2.0,
            solver: SolverSettings::default(),
        }
    }
}

/// Whether an estimate can be trusted as an in-bounds impact position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Confidence {
    High,
    Low,
}

/// Reasons an estimate is flagged low confidence
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QualityIssue {
    /// Best fit lies off the membrane; the reported position is projected onto the rim
    OutsideMembrane { distance_from_center: f64 },
    /// Solver stopped before converging
    NotConverged { status: SolveStatus },
    /// Observed lags disagree with the model more than the configured limit
    HighResidual { rms_samples: f64 },
}

impl fmt::Display for QualityIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QualityIssue::OutsideMembrane { distance_from_center } => {
                write!(f, "outside membrane ({:.2} cm from center)", distance_from_center)
            }
            QualityIssue::NotConverged { status } => write!(f, "not converged ({:?})", status),
            QualityIssue::HighResidual { rms_samples } => write!(f, "high residual ({:.2} samples RMS)", rms_samples),
        }
    }
}

/// Estimated impact position with fit diagnostics
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LocationEstimate {
    /// Reported position, always on the membrane
    pub position: Position,
    /// Unconstrained least-squares solution, may lie outside the membrane
    pub raw_position: Position,
    /// `position` in normalized polar coordinates
    pub polar: PolarPosition,
    pub rms_residual_samples: f64,
    /// RMS residual converted to path length
    pub rms_residual_cm: f64,
    pub status: SolveStatus,
    pub iterations: usize,
    pub sensors_used: usize,
    pub pairs_used: usize,
    pub confidence: Confidence,
    pub issues: Vec<QualityIssue>,
}

impl LocationEstimate {
    pub fn is_confident(&self) -> bool {
        self.confidence == Confidence::High
    }

    pub fn converged(&self) -> bool {
        self.status.is_converged()
    }
}

/// Lag residuals for a single hit as a function of its position
struct HitProblem<'a> {
    observations: &'a [(SensorPair, f64)],
}

impl LeastSquaresProblem for HitProblem<'_> {
    fn parameter_count(&self) -> usize {
        2
    }

    fn residuals(&self, params: &DVector<f64>) -> DVector<f64> {
        let point = Position::new(params[0], params[1]);
        DVector::from_iterator(
            self.observations.len(),
            self.observations.iter().map(|(pair, observed)| pair.lag_at(&point) - observed),
        )
    }

    fn jacobian(&self, params: &DVector<f64>) -> DMatrix<f64> {
        let point = Position::new(params[0], params[1]);
        let mut jacobian = DMatrix::zeros(self.observations.len(), 2);
        for (row, (pair, _)) in self.observations.iter().enumerate() {
            let gradient = pair.gradient_at(&point);
            jacobian[(row, 0)] = gradient.x;
            jacobian[(row, 1)] = gradient.y;
        }
        jacobian
    }
}

/// Stateless impact localizer
#[derive(Debug, Clone, Default)]
pub struct Localizer {
    config: LocalizerConfig,
}

impl Localizer {
    /// Create a new localizer
    pub fn new(config: LocalizerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &LocalizerConfig {
        &self.config
    }

    /// Estimate the impact position of `hit`
    pub fn locate(
        &self,
        hit: &ObservedHit,
        geometry: &SensorGeometry,
        model: &PropagationModel,
    ) -> LocalizationResult<LocationEstimate> {
        self.locate_with_maps(hit, geometry, model, |pair, _, grid| Ok(Arc::new(pair.lag_field(grid))))
    }

    /// Estimate the impact position of `hit`, reusing seed-grid lag maps
    /// cached for the model's version
    pub fn locate_cached(
        &self,
        hit: &ObservedHit,
        drum: &DrumModel,
        cache: &LagMapCache,
    ) -> LocalizationResult<LocationEstimate> {
        self.locate_with_maps(hit, &drum.geometry, &drum.propagation, |pair, key, grid| {
            cache.get_or_compute(drum.version, key, || Ok(pair.lag_field(grid)))
        })
    }

    fn locate_with_maps<F>(
        &self,
        hit: &ObservedHit,
        geometry: &SensorGeometry,
        model: &PropagationModel,
        lag_map: F,
    ) -> LocalizationResult<LocationEstimate>
    where
        F: Fn(&SensorPair, LagMapKey, &GridSpec) -> LocalizationResult<Arc<LagMap>>,
    {
        hit.validate_against(geometry)?;
        let sensors_used = hit.sensor_count();
        if sensors_used < MIN_SENSORS {
            return Err(LocalizationError::InsufficientObservations {
                available: sensors_used,
                required: MIN_SENSORS,
            });
        }
        let deadline = self.config.solver.deadline_from_now();

        let lags = hit.pairwise_lags();
        let observations = lags
            .iter()
            .map(|lag| Ok((SensorPair::from_geometry(geometry, lag.first, lag.second, model)?, lag.samples)))
            .collect::<LocalizationResult<Vec<_>>>()?;

        let radius = geometry.radius();
        let grid = GridSpec::new(radius, radius * self.config.grid_step_fraction)?;
        let maps = lags
            .iter()
            .zip(&observations)
            .map(|(lag, (pair, _))| lag_map(pair, LagMapKey::new(lag.first, lag.second, &grid), &grid))
            .collect::<LocalizationResult<Vec<_>>>()?;

        let seeds = self.select_seeds(&maps, &observations, radius);
        let solver = LevenbergMarquardt::new(self.config.solver.clone());
        let problem = HitProblem { observations: &observations };

        let mut best: Option<SolverReport> = None;
        for seed in seeds {
            let report = solver.minimize_with(&problem, DVector::from_vec(vec![seed.x, seed.y]), None, deadline);
            best = match best {
                Some(current) if !prefer(&report, &current, radius) => Some(current),
                _ => Some(report),
            };
        }
        let report = match best {
            Some(report) => report,
            // the seed list always holds at least the center
            None => solver.minimize_with(&problem, DVector::zeros(2), None, deadline),
        };

        Ok(self.build_estimate(&report, geometry, model, sensors_used, observations.len()))
    }

    /// Lowest-cost grid cells, at least the configured separation apart
    fn select_seeds(&self, maps: &[Arc<LagMap>], observations: &[(SensorPair, f64)], radius: f64) -> Vec<Position> {
        let mut scored: Vec<(f64, Position)> = match maps.first() {
            Some(reference) => reference
                .iter_cells()
                .filter_map(|(row, col, _)| {
                    let cost = maps
                        .iter()
                        .zip(observations)
                        .map(|(map, (_, observed))| map.get(row, col).map(|lag| (lag - observed).powi(2)))
                        .sum::<Option<f64>>()?;
                    Some((cost, reference.position_of(row, col)))
                })
                .collect(),
            None => Vec::new(),
        };
        scored.sort_by(|a, b| a.0.total_cmp(&b.0));

        let separation = radius * self.config.seed_separation_fraction;
        let mut seeds: Vec<Position> = Vec::with_capacity(self.config.seed_count);
        for (_, position) in scored {
            if seeds.len() >= self.config.seed_count.max(1) {
                break;
            }
            if seeds.iter().all(|s| s.distance_to(&position) >= separation) {
                seeds.push(position);
            }
        }
        if seeds.is_empty() {
            seeds.push(Position::ORIGIN);
        }
        seeds
    }

    fn build_estimate(
        &self,
        report: &SolverReport,
        geometry: &SensorGeometry,
        model: &PropagationModel,
        sensors_used: usize,
        pairs_used: usize,
    ) -> LocationEstimate {
        let radius = geometry.radius();
        let raw_position = Position::new(report.params[0], report.params[1]);
        let rms_residual_samples = report.rms();
        let mut issues = Vec::new();

        let distance = raw_position.norm();
        let position = if distance > radius {
            issues.push(QualityIssue::OutsideMembrane { distance_from_center: distance });
            Position::new(raw_position.x * radius / distance, raw_position.y * radius / distance)
        } else {
            raw_position
        };
        if !report.status.is_converged() {
            issues.push(QualityIssue::NotConverged { status: report.status });
        }
        if rms_residual_samples > self.config.max_rms_residual_samples {
            issues.push(QualityIssue::HighResidual { rms_samples: rms_residual_samples });
        }

        let confidence = if issues.is_empty() { Confidence::High } else { Confidence::Low };
        if confidence == Confidence::Low {
            debug!("low confidence estimate at {}: {:?}", raw_position, issues);
        }

        LocationEstimate {
            position,
            raw_position,
            // position is finite and the radius validated, so this cannot fail
            polar: cartesian_to_polar(position, radius).unwrap_or_default(),
            rms_residual_samples,
            rms_residual_cm: rms_residual_samples / model.samples_per_unit(),
            status: report.status,
            iterations: report.iterations,
            sensors_used,
            pairs_used,
            confidence,
            issues,
        }
    }
}

/// Whether `candidate` beats `current`: lower cost, then on the membrane,
/// then closer to the center
fn prefer(candidate: &SolverReport, current: &SolverReport, radius: f64) -> bool {
    let tolerance = TIE_TOLERANCE * (1.0 + candidate.cost.min(current.cost));
    if candidate.cost < current.cost - tolerance {
        return true;
    }
    if candidate.cost > current.cost + tolerance {
        return false;
    }
    let candidate_norm = candidate.params[0].hypot(candidate.params[1]);
    let current_norm = current.params[0].hypot(current.params[1]);
    match (candidate_norm <= radius, current_norm <= radius) {
        (true, false) => true,
        (false, true) => false,
        _ => candidate_norm < current_norm,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{polar_to_cartesian, SensorId};

    const R: f64 = 17.78;

    fn model() -> PropagationModel {
        PropagationModel::new(100.0, 48_000.0).unwrap()
    }

    fn triangle() -> SensorGeometry {
        SensorGeometry::from_polar(
            R,
            &[
                ("s1", PolarPosition::new(0.9, 0.0)),
                ("s2", PolarPosition::new(0.9, 120.0)),
                ("s3", PolarPosition::new(0.9, 240.0)),
            ],
        )
        .unwrap()
    }

    fn square() -> SensorGeometry {
        SensorGeometry::from_polar(
            R,
            &[
                ("n", PolarPosition::new(0.9, 90.0)),
                ("e", PolarPosition::new(0.9, 0.0)),
                ("s", PolarPosition::new(0.9, 270.0)),
                ("w", PolarPosition::new(0.9, 180.0)),
            ],
        )
        .unwrap()
    }

    /// Noiseless arrivals for an impact at `point`, offset by a common start time
    fn synthetic_hit(geometry: &SensorGeometry, model: &PropagationModel, point: Position) -> ObservedHit {
        let mut hit = ObservedHit::new();
        for (id, sensor) in geometry.ids().zip(geometry.sensors()) {
            hit.insert(id, 500.0 + sensor.distance_to(&point) * model.samples_per_unit());
        }
        hit
    }

    #[test]
    fn test_noiseless_self_consistency_three_sensors() {
        let geometry = triangle();
        let localizer = Localizer::default();
        for &(r, angle) in &[(0.0, 0.0), (0.15, 30.0), (0.3, 100.0), (0.4, 200.0), (0.35, 310.0)] {
            let truth = polar_to_cartesian(PolarPosition::new(r, angle), R).unwrap();
            let hit = synthetic_hit(&geometry, &model(), truth);
            let estimate = localizer.locate(&hit, &geometry, &model()).unwrap();
            assert!(
                estimate.position.distance_to(&truth) < 0.01 * R,
                "truth {} estimate {}",
                truth,
                estimate.position
            );
            assert!(estimate.is_confident());
            assert_eq!(estimate.pairs_used, 3);
        }
    }

    #[test]
    fn test_noiseless_self_consistency_overdetermined() {
        let geometry = square();
        let localizer = Localizer::default();
        for &(r, angle) in &[(0.2, 45.0), (0.5, 160.0), (0.7, 250.0), (0.85, 10.0)] {
            let truth = polar_to_cartesian(PolarPosition::new(r, angle), R).unwrap();
            let hit = synthetic_hit(&geometry, &model(), truth);
            let estimate = localizer.locate(&hit, &geometry, &model()).unwrap();
            assert!(estimate.position.distance_to(&truth) < 0.01 * R);
            assert_eq!(estimate.sensors_used, 4);
            assert_eq!(estimate.pairs_used, 6);
            assert!(estimate.rms_residual_samples < 1e-3);
        }
    }

    #[test]
    fn test_center_hit() {
        let geometry = triangle();
        let hit = ObservedHit::from_samples([(SensorId(0), 1000), (SensorId(1), 1000), (SensorId(2), 1000)]);
        let estimate = Localizer::default().locate(&hit, &geometry, &model()).unwrap();
        assert!(estimate.position.norm() < 1e-6);
        assert!(estimate.polar.radius < 1e-6);
        assert_eq!(estimate.confidence, Confidence::High);
        assert!(estimate.converged());
    }

    #[test]
    fn test_quantized_arrivals() {
        let geometry = square();
        let localizer = Localizer::default();
        for &(r, angle) in &[(0.3, 20.0), (0.6, 135.0), (0.5, 290.0)] {
            let truth = polar_to_cartesian(PolarPosition::new(r, angle), R).unwrap();
            let exact = synthetic_hit(&geometry, &model(), truth);
            let hit = ObservedHit::from_samples(exact.arrivals().iter().map(|(&id, &s)| (id, s.round() as u64)));
            let estimate = localizer.locate(&hit, &geometry, &model()).unwrap();
            assert!(estimate.position.distance_to(&truth) < 0.05 * R);
            assert!(estimate.rms_residual_samples < 1.0);
        }
    }

    #[test]
    fn test_out_of_disc_fit_is_low_confidence() {
        let geometry = square();
        let outside = Position::new(1.5 * R, 0.0);
        let hit = synthetic_hit(&geometry, &model(), outside);
        let estimate = Localizer::default().locate(&hit, &geometry, &model()).unwrap();

        assert_eq!(estimate.confidence, Confidence::Low);
        assert!(estimate.raw_position.norm() > R);
        assert!((estimate.position.norm() - R).abs() < 1e-9);
        assert!(estimate
            .issues
            .iter()
            .any(|issue| matches!(issue, QualityIssue::OutsideMembrane { .. })));
    }

    #[test]
    fn test_missing_sensor_uses_remaining_pairs() {
        let geometry = square();
        let truth = polar_to_cartesian(PolarPosition::new(0.3, 60.0), R).unwrap();
        let full = synthetic_hit(&geometry, &model(), truth);
        let mut hit = ObservedHit::new();
        for (&id, &sample) in full.arrivals() {
            if id != SensorId(2) {
                hit.insert(id, sample);
            }
        }
        let estimate = Localizer::default().locate(&hit, &geometry, &model()).unwrap();
        assert_eq!(estimate.sensors_used, 3);
        assert_eq!(estimate.pairs_used, 3);
        assert!(estimate.position.distance_to(&truth) < 0.01 * R);
    }

    #[test]
    fn test_insufficient_and_invalid_observations() {
        let geometry = triangle();
        let localizer = Localizer::default();

        let two = ObservedHit::from_samples([(SensorId(0), 10), (SensorId(1), 12)]);
        assert_eq!(
            localizer.locate(&two, &geometry, &model()).unwrap_err(),
            LocalizationError::InsufficientObservations { available: 2, required: 3 }
        );

        let unknown = ObservedHit::from_samples([(SensorId(0), 10), (SensorId(1), 12), (SensorId(9), 3)]);
        assert_eq!(
            localizer.locate(&unknown, &geometry, &model()).unwrap_err(),
            LocalizationError::UnknownSensor { id: SensorId(9) }
        );

        let nan = ObservedHit::new()
            .with_arrival(SensorId(0), 1.0)
            .with_arrival(SensorId(1), f64::NAN)
            .with_arrival(SensorId(2), 3.0);
        assert!(matches!(
            localizer.locate(&nan, &geometry, &model()),
            Err(LocalizationError::InvalidObservation { .. })
        ));
    }

    #[test]
    fn test_inconsistent_lags_flag_high_residual() {
        let geometry = square();
        let truth = polar_to_cartesian(PolarPosition::new(0.2, 80.0), R).unwrap();
        let mut hit = synthetic_hit(&geometry, &model(), truth);
        let shifted = hit.arrival(SensorId(1)).unwrap() + 40.0;
        hit.insert(SensorId(1), shifted);

        let estimate = Localizer::default().locate(&hit, &geometry, &model()).unwrap();
        assert_eq!(estimate.confidence, Confidence::Low);
        assert!(estimate
            .issues
            .iter()
            .any(|issue| matches!(issue, QualityIssue::HighResidual { .. })));
        assert!((estimate.rms_residual_cm * model().samples_per_unit() - estimate.rms_residual_samples).abs() < 1e-9);
    }

    #[test]
    fn test_iteration_cap_returns_best_so_far() {
        let geometry = triangle();
        let truth = polar_to_cartesian(PolarPosition::new(0.3, 45.0), R).unwrap();
        let hit = synthetic_hit(&geometry, &model(), truth);
        let localizer = Localizer::new(LocalizerConfig {
            solver: SolverSettings {
                max_iterations: 0,
                ..SolverSettings::default()
            },
            ..LocalizerConfig::default()
        });
        let estimate = localizer.locate(&hit, &geometry, &model()).unwrap();
        assert_eq!(estimate.status, SolveStatus::IterationLimit);
        assert_eq!(estimate.confidence, Confidence::Low);
        // the grid seed is still a usable approximation
        assert!(estimate.position.distance_to(&truth) < 0.1 * R);
    }

    #[test]
    fn test_exhausted_time_budget() {
        let geometry = triangle();
        let hit = synthetic_hit(&geometry, &model(), Position::new(2.0, 1.0));
        let localizer = Localizer::new(LocalizerConfig {
            solver: SolverSettings {
                time_budget_ms: Some(0),
                ..SolverSettings::default()
            },
            ..LocalizerConfig::default()
        });
        let estimate = localizer.locate(&hit, &geometry, &model()).unwrap();
        assert_eq!(estimate.status, SolveStatus::TimeBudgetExceeded);
        assert!(!estimate.is_confident());
    }

    #[test]
    fn test_time_budget_covers_seed_search() {
        let geometry = triangle();
        let hit = synthetic_hit(&geometry, &model(), Position::new(2.0, 1.0));
        // about a million cells per pair takes far longer than the budget
        let localizer = Localizer::new(LocalizerConfig {
            grid_step_fraction: 0.002,
            solver: SolverSettings {
                time_budget_ms: Some(1),
                ..SolverSettings::default()
            },
            ..LocalizerConfig::default()
        });
        let estimate = localizer.locate(&hit, &geometry, &model()).unwrap();
        assert_eq!(estimate.status, SolveStatus::TimeBudgetExceeded);
        assert_eq!(estimate.confidence, Confidence::Low);
    }

    #[test]
    fn test_cached_locate_matches_uncached() {
        let geometry = square();
        let drum = DrumModel {
            geometry: geometry.clone(),
            propagation: model(),
            version: 4,
        };
        let cache = LagMapCache::new();
        let localizer = Localizer::default();
        let hit = synthetic_hit(&geometry, &model(), Position::new(-3.0, 5.5));

        let direct = localizer.locate(&hit, &geometry, &model()).unwrap();
        let cached = localizer.locate_cached(&hit, &drum, &cache).unwrap();
        assert_eq!(direct.position, cached.position);
        assert_eq!(cache.len(), 6);

        localizer.locate_cached(&hit, &drum, &cache).unwrap();
        let (hits, misses, _) = cache.get_statistics();
        assert_eq!((hits, misses), (6, 6));
    }
}
