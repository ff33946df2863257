//! Joint fit of sensor positions and propagation speed from observed hits
//!
//! The residual is the same lag mismatch the localizer minimizes, summed
//! over every hit and every observed sensor pair. Sensor coordinates, the
//! propagation speed and the positions of hits that were not annotated are
//! all parameters of one least-squares problem; constraints remove or tie
//! parameters together.

use std::collections::BTreeMap;
use std::f64::consts::PI;

use log::{debug, info, warn};
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::algorithms::localizer::Localizer;
use crate::algorithms::solver::{
    condition_number, CancellationToken, LeastSquaresProblem, LevenbergMarquardt, SolveStatus, SolverSettings,
};
use crate::core::{
    ObservedHit, ObservedLag, Position, PositionAnnotation, PropagationModel, SensorGeometry, SensorId,
    CENTIMETERS_PER_METER,
};
use crate::validation::{GeometryIssue, LocalizationError, LocalizationResult};

/// Restriction on the calibration parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Constraint {
    /// Sensor position is known and not fitted
    FixedPosition { sensor: SensorId, position: Position },
    /// Sensors share one (fitted) distance from the center
    EqualRadius { sensors: Vec<SensorId> },
    /// Propagation speed (m/s) is known and not fitted
    FixedSpeed { speed_m_per_s: f64 },
    /// Sensors sit on one ring, `spacing_deg` apart in listed order; only
    /// the ring radius and a common rotation are fitted
    FixedAngularSpacing { sensors: Vec<SensorId>, spacing_deg: f64 },
    /// No restriction
    Free,
}

/// Calibration settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    /// Fewest hits accepted
    pub min_hits: usize,
    /// Smallest spread of annotated hit positions, as a fraction of the
    /// membrane radius, when every hit is annotated
    pub min_known_spread_fraction: f64,
    /// Column-normalized Jacobian condition number above which the fit is ill-posed
    pub max_condition_number: f64,
    pub solver: SolverSettings,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            min_hits: 3,
            min_known_spread_fraction: 0.1,
            max_condition_number: 1e6,
            solver: SolverSettings {
                max_iterations: 200,
                ..SolverSettings::default()
            },
        }
    }
}

/// Result of a calibration run
///
/// A non-converged outcome carries the best estimate found, which must not
/// be treated as a calibrated model.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CalibrationOutcome {
    pub geometry: SensorGeometry,
    pub model: PropagationModel,
    /// RMS lag residual in samples
    pub rms_residual: f64,
    pub status: SolveStatus,
    pub iterations: usize,
    pub condition_number: f64,
    /// Fitted (or annotated) position of every hit, in input order
    pub hit_positions: Vec<Position>,
}

impl CalibrationOutcome {
    pub fn converged(&self) -> bool {
        self.status.is_converged()
    }
}

#[derive(Debug, Clone, Copy)]
enum SensorParam {
    Fixed(Position),
    Free { x: usize },
    /// Shared radius, own angle
    Ring { group: usize, angle: usize },
    /// Shared radius, angle = group rotation + slot * spacing
    Spaced { group: usize, slot: usize },
}

#[derive(Debug, Clone, Copy)]
struct RingGroup {
    radius: usize,
    rotation: Option<usize>,
    spacing_rad: f64,
}

#[derive(Debug, Clone, Copy)]
enum HitParam {
    Known(Position),
    OnCircle { radius: f64, angle: usize },
    Free { x: usize },
}

#[derive(Debug, Clone, Copy)]
enum SpeedParam {
    Fixed(f64),
    Free(usize),
}

/// Mapping from the flat parameter vector to sensors, speed and hits
#[derive(Debug, Clone)]
struct ParameterLayout {
    sensors: Vec<SensorParam>,
    groups: Vec<RingGroup>,
    hits: Vec<HitParam>,
    speed: SpeedParam,
    count: usize,
}

impl ParameterLayout {
    fn sensor_position(&self, index: usize, params: &DVector<f64>) -> Position {
        match self.sensors[index] {
            SensorParam::Fixed(position) => position,
            SensorParam::Free { x } => Position::new(params[x], params[x + 1]),
            SensorParam::Ring { group, angle } => {
                let radius = params[self.groups[group].radius];
                on_ring(radius, params[angle])
            }
            SensorParam::Spaced { group, slot } => {
                let ring = self.groups[group];
                let rotation = ring.rotation.map_or(0.0, |r| params[r]);
                on_ring(params[ring.radius], rotation + slot as f64 * ring.spacing_rad)
            }
        }
    }

    fn hit_position(&self, index: usize, params: &DVector<f64>) -> Position {
        match self.hits[index] {
            HitParam::Known(position) => position,
            HitParam::OnCircle { radius, angle } => on_ring(radius, params[angle]),
            HitParam::Free { x } => Position::new(params[x], params[x + 1]),
        }
    }

    fn speed(&self, params: &DVector<f64>) -> f64 {
        match self.speed {
            SpeedParam::Fixed(speed) => speed,
            SpeedParam::Free(index) => params[index],
        }
    }
}

fn on_ring(radius: f64, angle_rad: f64) -> Position {
    Position::new(radius * angle_rad.cos(), radius * angle_rad.sin())
}

/// Lag residuals across all hits as a function of the calibration parameters
struct CalibrationProblem<'a> {
    layout: &'a ParameterLayout,
    heights: Vec<f64>,
    sample_rate_hz: f64,
    lags: Vec<Vec<ObservedLag>>,
    residual_count: usize,
}

impl CalibrationProblem<'_> {
    fn path_length(&self, sensor: Position, height: f64, point: &Position) -> f64 {
        let planar = sensor.distance_to(point);
        if height == 0.0 {
            planar
        } else {
            planar.hypot(height)
        }
    }
}

impl LeastSquaresProblem for CalibrationProblem<'_> {
    fn parameter_count(&self) -> usize {
        self.layout.count
    }

    fn residuals(&self, params: &DVector<f64>) -> DVector<f64> {
        let sensors: Vec<Position> = (0..self.layout.sensors.len())
            .map(|i| self.layout.sensor_position(i, params))
            .collect();
        let samples_per_unit = self.sample_rate_hz / (self.layout.speed(params) * CENTIMETERS_PER_METER);

        let mut residuals = Vec::with_capacity(self.residual_count);
        for (index, lags) in self.lags.iter().enumerate() {
            let point = self.layout.hit_position(index, params);
            for lag in lags {
                let (a, b) = (lag.first.index(), lag.second.index());
                let da = self.path_length(sensors[a], self.heights[a], &point);
                let db = self.path_length(sensors[b], self.heights[b], &point);
                residuals.push((db - da) * samples_per_unit - lag.samples);
            }
        }
        DVector::from_vec(residuals)
    }
}

/// Offline sensor geometry and propagation speed fitter
#[derive(Debug, Clone, Default)]
pub struct Calibrator {
    config: CalibrationConfig,
}

impl Calibrator {
    /// Create a new calibrator
    pub fn new(config: CalibrationConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &CalibrationConfig {
        &self.config
    }

    /// Fit geometry and speed to `hits`, starting from the initial model
    pub fn calibrate(
        &self,
        hits: &[ObservedHit],
        geometry: &SensorGeometry,
        model: &PropagationModel,
        constraints: &[Constraint],
    ) -> LocalizationResult<CalibrationOutcome> {
        self.run(hits, geometry, model, constraints, None)
    }

    /// Same as [`Calibrator::calibrate`], stopping between iterations once
    /// `cancel` is set; the outcome is then flagged [`SolveStatus::Cancelled`]
    pub fn calibrate_with_cancel(
        &self,
        hits: &[ObservedHit],
        geometry: &SensorGeometry,
        model: &PropagationModel,
        constraints: &[Constraint],
        cancel: &CancellationToken,
    ) -> LocalizationResult<CalibrationOutcome> {
        self.run(hits, geometry, model, constraints, Some(cancel))
    }

    fn run(
        &self,
        hits: &[ObservedHit],
        geometry: &SensorGeometry,
        model: &PropagationModel,
        constraints: &[Constraint],
        cancel: Option<&CancellationToken>,
    ) -> LocalizationResult<CalibrationOutcome> {
        if hits.len() < self.config.min_hits {
            return Err(LocalizationError::ill_posed(
                format!("{} hits supplied, at least {} required", hits.len(), self.config.min_hits),
                None,
            ));
        }
        for hit in hits {
            hit.validate_against(geometry)?;
        }
        self.check_known_spread(hits, geometry)?;

        let (layout, initial) = build_layout(hits, geometry, model, constraints)?;
        let lags: Vec<Vec<ObservedLag>> = hits.iter().map(ObservedHit::pairwise_lags).collect();
        let residual_count = lags.iter().map(Vec::len).sum();
        if residual_count < layout.count {
            return Err(LocalizationError::ill_posed(
                format!("{} lag residuals for {} parameters", residual_count, layout.count),
                None,
            ));
        }

        let problem = CalibrationProblem {
            layout: &layout,
            heights: geometry.sensors().iter().map(|s| s.height).collect(),
            sample_rate_hz: model.sample_rate(),
            lags,
            residual_count,
        };

        info!(
            "calibrating {} parameters from {} hits ({} lag residuals)",
            layout.count,
            hits.len(),
            residual_count
        );
        let solver = LevenbergMarquardt::new(self.config.solver.clone());
        let report = solver.minimize_with(&problem, initial, cancel, self.config.solver.deadline_from_now());

        let condition = normalized_condition_number(problem.jacobian(&report.params));
        if report.status != SolveStatus::Cancelled && condition > self.config.max_condition_number {
            return Err(LocalizationError::ill_posed(
                "calibration parameters are not identifiable from these hits",
                Some(condition),
            ));
        }

        let positions: Vec<Position> = (0..geometry.len())
            .map(|i| layout.sensor_position(i, &report.params))
            .collect();
        let fitted_geometry = geometry.with_positions(&positions)?;
        let fitted_model = model.with_speed(layout.speed(&report.params))?;
        let hit_positions = (0..hits.len()).map(|i| layout.hit_position(i, &report.params)).collect();

        let outcome = CalibrationOutcome {
            geometry: fitted_geometry,
            model: fitted_model,
            rms_residual: report.rms(),
            status: report.status,
            iterations: report.iterations,
            condition_number: condition,
            hit_positions,
        };
        if outcome.converged() {
            info!(
                "calibration converged in {} iterations: rms {:.4} samples, speed {:.2} m/s",
                outcome.iterations,
                outcome.rms_residual,
                outcome.model.speed()
            );
        } else {
            warn!(
                "calibration stopped with {:?} after {} iterations (rms {:.4} samples)",
                outcome.status, outcome.iterations, outcome.rms_residual
            );
        }
        Ok(outcome)
    }

    /// Annotated positions must be spread out when they are all there is
    fn check_known_spread(&self, hits: &[ObservedHit], geometry: &SensorGeometry) -> LocalizationResult<()> {
        let known: Vec<Position> = hits.iter().filter_map(ObservedHit::known_position).collect();
        if known.len() != hits.len() {
            return Ok(());
        }
        let spread = known
            .iter()
            .enumerate()
            .flat_map(|(i, a)| known[i + 1..].iter().map(move |b| a.distance_to(b)))
            .fold(0.0, f64::max);
        let required = self.config.min_known_spread_fraction * geometry.radius();
        if spread < required {
            return Err(LocalizationError::ill_posed(
                format!("known hit positions span {:.3} cm, at least {:.3} cm required", spread, required),
                None,
            ));
        }
        Ok(())
    }
}

/// Fit geometry and speed with default settings
pub fn calibrate(
    hits: &[ObservedHit],
    geometry: &SensorGeometry,
    model: &PropagationModel,
    constraints: &[Constraint],
) -> LocalizationResult<CalibrationOutcome> {
    Calibrator::default().calibrate(hits, geometry, model, constraints)
}

fn constraint_error(details: impl Into<String>) -> LocalizationError {
    LocalizationError::invalid_geometry(GeometryIssue::InvalidConstraint, details)
}

/// Translate constraints into a parameter layout and the initial parameter vector
fn build_layout(
    hits: &[ObservedHit],
    geometry: &SensorGeometry,
    model: &PropagationModel,
    constraints: &[Constraint],
) -> LocalizationResult<(ParameterLayout, DVector<f64>)> {
    let mut initial: Vec<f64> = Vec::new();
    let mut assigned: BTreeMap<SensorId, SensorParam> = BTreeMap::new();
    let mut groups: Vec<RingGroup> = Vec::new();
    let mut fixed_speed: Option<f64> = None;

    let claim = |assigned: &mut BTreeMap<SensorId, SensorParam>, sensor: SensorId, param: SensorParam| {
        if geometry.sensor(sensor).is_none() {
            return Err(LocalizationError::UnknownSensor { id: sensor });
        }
        if assigned.insert(sensor, param).is_some() {
            return Err(constraint_error(format!("sensor {} is constrained more than once", sensor)));
        }
        Ok(())
    };

    for constraint in constraints {
        match constraint {
            Constraint::Free => {}
            Constraint::FixedSpeed { speed_m_per_s } => {
                let speed = model.with_speed(*speed_m_per_s)?.speed();
                if fixed_speed.map_or(false, |existing| existing != speed) {
                    return Err(constraint_error("conflicting fixed speeds"));
                }
                fixed_speed = Some(speed);
            }
            Constraint::FixedPosition { sensor, position } => {
                if !position.is_finite() {
                    return Err(LocalizationError::invalid_geometry(
                        GeometryIssue::NonFinite,
                        format!("fixed position of sensor {}", sensor),
                    ));
                }
                claim(&mut assigned, *sensor, SensorParam::Fixed(*position))?;
            }
            Constraint::EqualRadius { sensors } => {
                if sensors.len() < 2 {
                    return Err(constraint_error("equal radius needs at least two sensors"));
                }
                let group = groups.len();
                let radius = initial.len();
                initial.push(mean_radius(geometry, sensors)?);
                groups.push(RingGroup { radius, rotation: None, spacing_rad: 0.0 });
                for &sensor in sensors {
                    let angle = initial.len();
                    claim(&mut assigned, sensor, SensorParam::Ring { group, angle })?;
                    let position = geometry.sensor(sensor).map_or(Position::ORIGIN, |s| s.position);
                    initial.push(position.y.atan2(position.x));
                }
            }
            Constraint::FixedAngularSpacing { sensors, spacing_deg } => {
                if sensors.len() < 2 || !spacing_deg.is_finite() {
                    return Err(constraint_error("angular spacing needs at least two sensors and a finite spacing"));
                }
                let spacing_rad = spacing_deg.to_radians();
                let group = groups.len();
                let radius = initial.len();
                initial.push(mean_radius(geometry, sensors)?);
                let rotation = initial.len();
                initial.push(mean_rotation(geometry, sensors, spacing_rad));
                groups.push(RingGroup { radius, rotation: Some(rotation), spacing_rad });
                for (slot, &sensor) in sensors.iter().enumerate() {
                    claim(&mut assigned, sensor, SensorParam::Spaced { group, slot })?;
                }
            }
        }
    }

    let mut sensors = Vec::with_capacity(geometry.len());
    for (id, sensor) in geometry.ids().zip(geometry.sensors()) {
        match assigned.get(&id) {
            Some(param) => sensors.push(*param),
            None => {
                sensors.push(SensorParam::Free { x: initial.len() });
                initial.push(sensor.position.x);
                initial.push(sensor.position.y);
            }
        }
    }

    let speed = match fixed_speed {
        Some(speed) => SpeedParam::Fixed(speed),
        None => {
            initial.push(model.speed());
            SpeedParam::Free(initial.len() - 1)
        }
    };

    let localizer = Localizer::default();
    let mut hit_params = Vec::with_capacity(hits.len());
    for (index, hit) in hits.iter().enumerate() {
        let required = match hit.annotation() {
            PositionAnnotation::Known { .. } => 2,
            PositionAnnotation::OnCircle { .. } => 2,
            PositionAnnotation::Unknown => 3,
        };
        if hit.sensor_count() < required {
            return Err(LocalizationError::ill_posed(
                format!("hit {} registered on {} sensors, {} required", index, hit.sensor_count(), required),
                None,
            ));
        }

        let param = match hit.annotation() {
            PositionAnnotation::Known { position } => HitParam::Known(position),
            PositionAnnotation::OnCircle { radius_fraction } => {
                if !radius_fraction.is_finite() || radius_fraction < 0.0 {
                    return Err(LocalizationError::invalid_geometry(
                        GeometryIssue::NonFinite,
                        format!("radius fraction {} of hit {}", radius_fraction, index),
                    ));
                }
                let angle = initial.len();
                let seed = localizer
                    .locate(hit, geometry, model)
                    .map(|estimate| estimate.raw_position.y.atan2(estimate.raw_position.x))
                    .unwrap_or(0.0);
                initial.push(seed);
                HitParam::OnCircle { radius: radius_fraction * geometry.radius(), angle }
            }
            PositionAnnotation::Unknown => {
                let x = initial.len();
                let seed = match localizer.locate(hit, geometry, model) {
                    Ok(estimate) => estimate.position,
                    Err(err) => {
                        debug!("hit {} could not be seeded ({}), starting at the center", index, err);
                        Position::ORIGIN
                    }
                };
                initial.push(seed.x);
                initial.push(seed.y);
                HitParam::Free { x }
            }
        };
        hit_params.push(param);
    }

    let layout = ParameterLayout {
        sensors,
        groups,
        hits: hit_params,
        speed,
        count: initial.len(),
    };
    Ok((layout, DVector::from_vec(initial)))
}

fn mean_radius(geometry: &SensorGeometry, sensors: &[SensorId]) -> LocalizationResult<f64> {
    let mut total = 0.0;
    for &id in sensors {
        let sensor = geometry.sensor(id).ok_or(LocalizationError::UnknownSensor { id })?;
        total += sensor.position.norm();
    }
    Ok(total / sensors.len() as f64)
}

/// Circular mean of each sensor's angle minus its nominal offset
fn mean_rotation(geometry: &SensorGeometry, sensors: &[SensorId], spacing_rad: f64) -> f64 {
    let (sin, cos) = sensors
        .iter()
        .enumerate()
        .filter_map(|(slot, &id)| geometry.sensor(id).map(|s| (slot, s.position)))
        .map(|(slot, p)| p.y.atan2(p.x) - slot as f64 * spacing_rad)
        .fold((0.0, 0.0), |(s, c), angle| (s + angle.sin(), c + angle.cos()));
    if sin == 0.0 && cos == 0.0 {
        0.0
    } else {
        sin.atan2(cos).rem_euclid(2.0 * PI)
    }
}

/// Condition number after scaling every Jacobian column to unit length, so
/// parameters in different units (cm, radians, m/s) compare fairly
fn normalized_condition_number(mut jacobian: DMatrix<f64>) -> f64 {
    for k in 0..jacobian.ncols() {
        let norm = jacobian.column(k).norm();
        if norm <= f64::EPSILON || !norm.is_finite() {
            return f64::INFINITY;
        }
        let mut column = jacobian.column_mut(k);
        column /= norm;
    }
    condition_number(&jacobian)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{polar_to_cartesian, PolarPosition, Sensor};
    use crate::processing::{ModelStore, PublishError};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    const R: f64 = 17.78;

    fn nominal() -> SensorGeometry {
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

    fn actual() -> SensorGeometry {
        SensorGeometry::new(
            R,
            vec![
                Sensor::new("s1", Position::new(15.4, 0.8)),
                Sensor::new("s2", Position::new(-8.6, 13.1)),
                Sensor::new("s3", Position::new(-7.5, -14.2)),
            ],
        )
        .unwrap()
    }

    fn hit_points() -> Vec<Position> {
        let mut points = vec![Position::ORIGIN];
        for ring in [0.3, 0.6, 0.8] {
            for k in 0..5 {
                let angle = k as f64 * 72.0 + ring * 50.0;
                points.push(polar_to_cartesian(PolarPosition::new(ring, angle), R).unwrap());
            }
        }
        points
    }

    /// Arrivals for each point under the true geometry, with uniform noise of
    /// `amplitude` samples drawn from a fixed seed
    fn synthetic_hits(geometry: &SensorGeometry, model: &PropagationModel, amplitude: f64) -> Vec<ObservedHit> {
        let mut rng = StdRng::seed_from_u64(7);
        hit_points()
            .into_iter()
            .map(|point| {
                let mut hit = ObservedHit::new().with_known_position(point);
                for (id, sensor) in geometry.ids().zip(geometry.sensors()) {
                    let noise: f64 = rng.gen_range(-1.0..=1.0);
                    hit.insert(id, 1000.0 + sensor.distance_to(&point) * model.samples_per_unit() + amplitude * noise);
                }
                hit
            })
            .collect()
    }

    fn max_sensor_error(fitted: &SensorGeometry, truth: &SensorGeometry) -> f64 {
        fitted
            .sensors()
            .iter()
            .zip(truth.sensors())
            .map(|(a, b)| a.position.distance_to(&b.position))
            .fold(0.0, f64::max)
    }

    #[test]
    fn test_recovers_sensor_positions_with_fixed_speed() {
        let model = PropagationModel::new(100.0, 48_000.0).unwrap();
        let hits = synthetic_hits(&actual(), &model, 0.0);
        let outcome = calibrate(&hits, &nominal(), &model, &[Constraint::FixedSpeed { speed_m_per_s: 100.0 }]).unwrap();

        assert!(outcome.converged());
        assert!(max_sensor_error(&outcome.geometry, &actual()) < 1e-3);
        assert!(outcome.rms_residual < 1e-4);
        assert_eq!(outcome.model.speed(), 100.0);
        assert_eq!(outcome.hit_positions.len(), hits.len());
    }

    #[test]
    fn test_recovers_speed_with_fixed_positions() {
        let truth = PropagationModel::new(120.0, 48_000.0).unwrap();
        let initial = PropagationModel::new(100.0, 48_000.0).unwrap();
        let geometry = actual();
        let hits = synthetic_hits(&geometry, &truth, 0.0);
        let constraints: Vec<Constraint> = geometry
            .ids()
            .zip(geometry.sensors())
            .map(|(sensor, s)| Constraint::FixedPosition { sensor, position: s.position })
            .collect();

        let outcome = calibrate(&hits, &geometry, &initial, &constraints).unwrap();
        assert!(outcome.converged());
        assert!((outcome.model.speed() - 120.0).abs() < 1e-4);
        assert_eq!(outcome.geometry, geometry);
    }

    #[test]
    fn test_equal_radius_constraint() {
        let model = PropagationModel::new(100.0, 48_000.0).unwrap();
        let truth = SensorGeometry::from_polar(
            R,
            &[
                ("s1", PolarPosition::new(0.8, 5.0)),
                ("s2", PolarPosition::new(0.8, 128.0)),
                ("s3", PolarPosition::new(0.8, 247.0)),
            ],
        )
        .unwrap();
        let hits = synthetic_hits(&truth, &model, 0.0);
        let constraints = [
            Constraint::EqualRadius { sensors: vec![SensorId(0), SensorId(1), SensorId(2)] },
            Constraint::FixedSpeed { speed_m_per_s: 100.0 },
            Constraint::Free,
        ];
        let outcome = calibrate(&hits, &nominal(), &model, &constraints).unwrap();

        assert!(outcome.converged());
        assert!(max_sensor_error(&outcome.geometry, &truth) < 1e-3);
        let radii: Vec<f64> = outcome.geometry.sensors().iter().map(|s| s.position.norm()).collect();
        assert!(radii.iter().all(|r| (r - radii[0]).abs() < 1e-9));
    }

    #[test]
    fn test_fixed_angular_spacing_fits_radius_and_rotation() {
        let model = PropagationModel::new(100.0, 48_000.0).unwrap();
        let truth = SensorGeometry::from_polar(
            R,
            &[
                ("s1", PolarPosition::new(0.85, 10.0)),
                ("s2", PolarPosition::new(0.85, 130.0)),
                ("s3", PolarPosition::new(0.85, 250.0)),
            ],
        )
        .unwrap();
        let hits = synthetic_hits(&truth, &model, 0.0);
        let constraints = [Constraint::FixedAngularSpacing {
            sensors: vec![SensorId(0), SensorId(1), SensorId(2)],
            spacing_deg: 120.0,
        }];
        let outcome = calibrate(&hits, &nominal(), &model, &constraints).unwrap();

        assert!(outcome.converged());
        assert!(max_sensor_error(&outcome.geometry, &truth) < 1e-3);
        assert!((outcome.model.speed() - 100.0).abs() < 1e-3);
    }

    #[test]
    fn test_residual_tracks_noise_level() {
        let model = PropagationModel::new(100.0, 48_000.0).unwrap();
        let constraints = [Constraint::FixedSpeed { speed_m_per_s: 100.0 }];
        let mut previous = f64::INFINITY;
        let mut errors = Vec::new();
        for amplitude in [1.0, 0.3, 0.0] {
            let hits = synthetic_hits(&actual(), &model, amplitude);
            let outcome = calibrate(&hits, &nominal(), &model, &constraints).unwrap();
            assert!(outcome.rms_residual < previous, "{} !< {}", outcome.rms_residual, previous);
            previous = outcome.rms_residual;
            errors.push(max_sensor_error(&outcome.geometry, &actual()));
        }
        // one sample of noise is about 0.2 cm of path difference
        assert!(errors[0] < 1.0);
        assert!(errors[2] < 1e-3);
        assert!(errors[2] <= errors[0]);
    }

    #[test]
    fn test_unknown_and_on_circle_hits() {
        let model = PropagationModel::new(100.0, 48_000.0).unwrap();
        let geometry = actual();
        let mut hits = synthetic_hits(&geometry, &model, 0.0);
        // forget where some of the hits landed
        for hit in hits.iter_mut().skip(11) {
            *hit = hit.clone().with_annotation(PositionAnnotation::Unknown);
        }
        let truth_on_circle = hits[6].known_position().unwrap();
        hits[6] = hits[6]
            .clone()
            .with_annotation(PositionAnnotation::OnCircle { radius_fraction: truth_on_circle.norm() / R });

        let outcome = calibrate(&hits, &nominal(), &model, &[Constraint::FixedSpeed { speed_m_per_s: 100.0 }]).unwrap();
        assert!(outcome.converged());
        assert!(max_sensor_error(&outcome.geometry, &geometry) < 1e-3);
        assert!(outcome.hit_positions[6].distance_to(&truth_on_circle) < 1e-3);
        for (fitted, truth) in outcome.hit_positions.iter().zip(hit_points()).skip(11) {
            assert!(fitted.distance_to(&truth) < 1e-3);
        }
    }

    #[test]
    fn test_all_hits_at_center_is_ill_posed() {
        let model = PropagationModel::new(100.0, 48_000.0).unwrap();
        let hits: Vec<ObservedHit> = (0..5)
            .map(|_| {
                ObservedHit::from_samples([(SensorId(0), 100), (SensorId(1), 100), (SensorId(2), 100)])
                    .with_known_position(Position::ORIGIN)
            })
            .collect();
        let err = calibrate(&hits, &nominal(), &model, &[]).unwrap_err();
        assert!(matches!(err, LocalizationError::CalibrationIllPosed { .. }));
    }

    #[test]
    fn test_too_few_residuals_is_ill_posed() {
        let model = PropagationModel::new(100.0, 48_000.0).unwrap();
        let hits: Vec<ObservedHit> = synthetic_hits(&actual(), &model, 0.0)
            .into_iter()
            .take(3)
            .map(|hit| hit.with_annotation(PositionAnnotation::Unknown))
            .collect();
        // 9 residuals for 6 sensor + 1 speed + 6 hit parameters
        let err = calibrate(&hits, &nominal(), &model, &[]).unwrap_err();
        assert!(matches!(err, LocalizationError::CalibrationIllPosed { condition_number: None, .. }));

        let err = calibrate(&hits[..2], &nominal(), &model, &[]).unwrap_err();
        assert!(matches!(err, LocalizationError::CalibrationIllPosed { .. }));
    }

    #[test]
    fn test_unanchored_layout_is_ill_posed() {
        let model = PropagationModel::new(100.0, 48_000.0).unwrap();
        let square = SensorGeometry::from_polar(
            R,
            &[
                ("n", PolarPosition::new(0.9, 90.0)),
                ("e", PolarPosition::new(0.9, 0.0)),
                ("s", PolarPosition::new(0.9, 270.0)),
                ("w", PolarPosition::new(0.9, 180.0)),
            ],
        )
        .unwrap();
        // nothing ties the fit to the membrane frame: any rotation or shift
        // of sensors and hits together explains the lags equally well
        let hits: Vec<ObservedHit> = synthetic_hits(&square, &model, 0.0)
            .into_iter()
            .map(|hit| hit.with_annotation(PositionAnnotation::Unknown))
            .collect();
        let err = calibrate(&hits, &square, &model, &[Constraint::FixedSpeed { speed_m_per_s: 100.0 }]).unwrap_err();
        match err {
            LocalizationError::CalibrationIllPosed { condition_number: Some(cond), .. } => assert!(cond > 1e6),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_conflicting_constraints_rejected() {
        let model = PropagationModel::new(100.0, 48_000.0).unwrap();
        let hits = synthetic_hits(&actual(), &model, 0.0);
        let constraints = [
            Constraint::FixedPosition { sensor: SensorId(0), position: Position::new(16.0, 0.0) },
            Constraint::EqualRadius { sensors: vec![SensorId(0), SensorId(1)] },
        ];
        let err = calibrate(&hits, &nominal(), &model, &constraints).unwrap_err();
        assert!(matches!(err, LocalizationError::InvalidGeometry { issue: GeometryIssue::InvalidConstraint, .. }));

        let unknown = [Constraint::FixedPosition { sensor: SensorId(7), position: Position::ORIGIN }];
        assert_eq!(
            calibrate(&hits, &nominal(), &model, &unknown).unwrap_err(),
            LocalizationError::UnknownSensor { id: SensorId(7) }
        );

        let bad_speed = [Constraint::FixedSpeed { speed_m_per_s: -3.0 }];
        assert!(calibrate(&hits, &nominal(), &model, &bad_speed).is_err());
    }

    #[test]
    fn test_cancelled_calibration_is_flagged() {
        let model = PropagationModel::new(100.0, 48_000.0).unwrap();
        let hits = synthetic_hits(&actual(), &model, 0.0);
        let token = CancellationToken::new();
        token.cancel();
        let outcome = Calibrator::default()
            .calibrate_with_cancel(&hits, &nominal(), &model, &[Constraint::FixedSpeed { speed_m_per_s: 100.0 }], &token)
            .unwrap();
        assert_eq!(outcome.status, SolveStatus::Cancelled);
        assert!(!outcome.converged());
        assert_eq!(outcome.geometry, nominal());
    }

    /// Run a fixed-speed calibration under `solver` and check the outcome is
    /// returned as a best effort that cannot be published
    fn assert_budget_outcome(solver: SolverSettings, expected: SolveStatus) {
        let model = PropagationModel::new(100.0, 48_000.0).unwrap();
        let hits = synthetic_hits(&actual(), &model, 0.0);
        let calibrator = Calibrator::new(CalibrationConfig {
            solver,
            ..CalibrationConfig::default()
        });

        let outcome = calibrator
            .calibrate(&hits, &nominal(), &model, &[Constraint::FixedSpeed { speed_m_per_s: 100.0 }])
            .unwrap();
        assert_eq!(outcome.status, expected);
        assert!(!outcome.converged());
        assert!(outcome.rms_residual.is_finite());
        assert_eq!(outcome.geometry.len(), 3);

        let store = ModelStore::new(nominal(), model);
        assert_eq!(store.publish_calibration(&outcome), Err(PublishError::NotConverged(expected)));
        assert_eq!(store.version(), 1);
    }

    #[test]
    fn test_iteration_cap_is_flagged() {
        let solver = SolverSettings {
            max_iterations: 1,
            ..CalibrationConfig::default().solver
        };
        assert_budget_outcome(solver, SolveStatus::IterationLimit);
    }

    #[test]
    fn test_time_budget_is_flagged() {
        let solver = SolverSettings {
            time_budget_ms: Some(0),
            ..CalibrationConfig::default().solver
        };
        assert_budget_outcome(solver, SolveStatus::TimeBudgetExceeded);
    }
}
