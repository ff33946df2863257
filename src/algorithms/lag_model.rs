//! Theoretical inter-sensor lags and lag fields over the membrane
//!
//! Sign convention: the lag for pair (A, B) is `(d(point, B) - d(point, A))`
//! scaled to samples, so a positive lag means the signal reaches B later.

use nalgebra::{DMatrix, Vector2};

use crate::core::{Position, PropagationModel, Sensor, SensorGeometry, SensorId, MIN_SENSOR_SEPARATION_CM};
use crate::validation::{GeometryIssue, LocalizationError, LocalizationResult};

/// A validated sensor pair bound to a propagation model
///
/// Construction checks the pair once so inner loops (grid evaluation,
/// solver residuals) can call [`SensorPair::lag_at`] without re-validating.
#[derive(Debug, Clone, PartialEq)]
pub struct SensorPair {
    first: Sensor,
    second: Sensor,
    samples_per_unit: f64,
}

impl SensorPair {
    /// Create a new pair from two sensors
    pub fn new(first: &Sensor, second: &Sensor, model: &PropagationModel) -> LocalizationResult<Self> {
        for sensor in [first, second] {
            if !sensor.position.is_finite() || !sensor.height.is_finite() {
                return Err(LocalizationError::invalid_geometry(
                    GeometryIssue::NonFinite,
                    format!("sensor '{}'", sensor.name),
                ));
            }
        }
        let separation = first
            .position
            .distance_to(&second.position)
            .hypot(first.height - second.height);
        if separation < MIN_SENSOR_SEPARATION_CM {
            return Err(LocalizationError::invalid_geometry(
                GeometryIssue::CoincidentSensors,
                format!("'{}' and '{}'", first.name, second.name),
            ));
        }
        Ok(Self {
            first: first.clone(),
            second: second.clone(),
            samples_per_unit: model.samples_per_unit(),
        })
    }

    /// Create a new pair from two sensors declared by a geometry
    pub fn from_geometry(
        geometry: &SensorGeometry,
        first: SensorId,
        second: SensorId,
        model: &PropagationModel,
    ) -> LocalizationResult<Self> {
        let a = geometry.sensor(first).ok_or(LocalizationError::UnknownSensor { id: first })?;
        let b = geometry.sensor(second).ok_or(LocalizationError::UnknownSensor { id: second })?;
        Self::new(a, b, model)
    }

    pub fn first(&self) -> &Sensor {
        &self.first
    }

    pub fn second(&self) -> &Sensor {
        &self.second
    }

    pub fn samples_per_unit(&self) -> f64 {
        self.samples_per_unit
    }

    /// Theoretical lag in samples for an impact at `point`
    pub fn lag_at(&self, point: &Position) -> f64 {
        (self.second.distance_to(point) - self.first.distance_to(point)) * self.samples_per_unit
    }

    /// Gradient of [`SensorPair::lag_at`] with respect to the impact position
    pub fn gradient_at(&self, point: &Position) -> Vector2<f64> {
        (unit_toward(point, &self.second) - unit_toward(point, &self.first)) * self.samples_per_unit
    }

    /// Evaluate the lag over every cell of `grid`
    pub fn lag_field(&self, grid: &GridSpec) -> LagMap {
        let size = grid.cells_per_axis();
        let half = grid.half_cells();
        let step = grid.step;
        let limit = grid.radius + grid.edge_tolerance;
        let values = DMatrix::from_fn(size, size, |row, col| {
            let point = cell_position(half, step, row, col);
            if point.norm() <= limit {
                Some(self.lag_at(&point))
            } else {
                None
            }
        });
        LagMap {
            first: self.first.name.clone(),
            second: self.second.name.clone(),
            step,
            half,
            values,
        }
    }
}

/// Derivative of the path length to `sensor` with respect to the impact
/// position; zero at the singular point directly under a contact sensor
fn unit_toward(point: &Position, sensor: &Sensor) -> Vector2<f64> {
    let distance = sensor.distance_to(point);
    if distance <= f64::EPSILON {
        Vector2::zeros()
    } else {
        (point.to_vector() - sensor.position.to_vector()) / distance
    }
}

fn cell_position(half: usize, step: f64, row: usize, col: usize) -> Position {
    Position::new(
        (col as f64 - half as f64) * step,
        (row as f64 - half as f64) * step,
    )
}

/// Signed lag in samples between two contact sensors at `a` and `b` for an
/// impact at `point`
pub fn theoretical_lag(a: Position, b: Position, point: Position, model: &PropagationModel) -> LocalizationResult<f64> {
    if !point.is_finite() {
        return Err(LocalizationError::invalid_geometry(
            GeometryIssue::NonFinite,
            format!("impact point {:?}", point),
        ));
    }
    let pair = SensorPair::new(&Sensor::new("a", a), &Sensor::new("b", b), model)?;
    Ok(pair.lag_at(&point))
}

/// Largest number of cells from the grid center to its edge along one axis
pub const MAX_HALF_CELLS: usize = 4096;

/// Square grid over a bounding disc, centered on the membrane center
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GridSpec {
    /// Disc radius (centimeters)
    pub radius: f64,
    /// Cell spacing (centimeters)
    pub step: f64,
    /// Extra margin beyond `radius` that is still evaluated (centimeters)
    pub edge_tolerance: f64,
}

impl GridSpec {
    /// Create a new grid with no edge tolerance
    pub fn new(radius: f64, step: f64) -> LocalizationResult<Self> {
        Self::with_edge_tolerance(radius, step, 0.0)
    }

    /// Create a new grid that also evaluates cells up to `edge_tolerance`
    /// past the rim
    pub fn with_edge_tolerance(radius: f64, step: f64, edge_tolerance: f64) -> LocalizationResult<Self> {
        if !radius.is_finite() || !step.is_finite() || !edge_tolerance.is_finite() {
            return Err(LocalizationError::invalid_geometry(GeometryIssue::NonFinite, "lag grid"));
        }
        if radius <= 0.0 {
            return Err(LocalizationError::invalid_geometry(
                GeometryIssue::NonPositiveRadius,
                format!("lag grid radius {}", radius),
            ));
        }
        if step <= 0.0 || edge_tolerance < 0.0 {
            return Err(LocalizationError::invalid_geometry(
                GeometryIssue::InvalidConstraint,
                format!("lag grid step {} with edge tolerance {}", step, edge_tolerance),
            ));
        }
        let half = ((radius + edge_tolerance) / step).floor();
        if !half.is_finite() || half > MAX_HALF_CELLS as f64 {
            return Err(LocalizationError::invalid_geometry(
                GeometryIssue::InvalidConstraint,
                format!(
                    "lag grid step {} is too fine for radius {}: at most {} cells per half-axis",
                    step,
                    radius + edge_tolerance,
                    MAX_HALF_CELLS
                ),
            ));
        }
        Ok(Self { radius, step, edge_tolerance })
    }

    /// Grid covering the membrane of `geometry` with `step` spacing
    pub fn for_geometry(geometry: &SensorGeometry, step: f64) -> LocalizationResult<Self> {
        Self::new(geometry.radius(), step)
    }

    /// Cells from the center to the outermost evaluated row, never more
    /// than [`MAX_HALF_CELLS`]
    pub fn half_cells(&self) -> usize {
        let half = ((self.radius + self.edge_tolerance) / self.step).floor();
        if half.is_nan() {
            0
        } else {
            half.clamp(0.0, MAX_HALF_CELLS as f64) as usize
        }
    }

    pub fn cells_per_axis(&self) -> usize {
        self.half_cells()
            .checked_mul(2)
            .and_then(|cells| cells.checked_add(1))
            .unwrap_or(2 * MAX_HALF_CELLS + 1)
    }
}

/// Theoretical lags for one sensor pair sampled on a square grid
///
/// Rows run along +y and columns along +x; cell (half, half) is the
/// membrane center. Cells outside the bounding disc are masked (`None`).
#[derive(Debug, Clone, PartialEq)]
pub struct LagMap {
    first: String,
    second: String,
    step: f64,
    half: usize,
    values: DMatrix<Option<f64>>,
}

impl LagMap {
    /// Names of the sensor pair (first, second)
    pub fn pair(&self) -> (&str, &str) {
        (&self.first, &self.second)
    }

    pub fn step(&self) -> f64 {
        self.step
    }

    pub fn size(&self) -> usize {
        self.values.nrows()
    }

    /// Lag at a cell, `None` when masked or out of range
    pub fn get(&self, row: usize, col: usize) -> Option<f64> {
        if row >= self.values.nrows() || col >= self.values.ncols() {
            return None;
        }
        self.values[(row, col)]
    }

    /// Membrane coordinates of a cell center
    pub fn position_of(&self, row: usize, col: usize) -> Position {
        cell_position(self.half, self.step, row, col)
    }

    /// Cell nearest to `point`, if it falls on the grid
    pub fn nearest_cell(&self, point: &Position) -> Option<(usize, usize)> {
        if !point.is_finite() {
            return None;
        }
        let col = (point.x / self.step).round() + self.half as f64;
        let row = (point.y / self.step).round() + self.half as f64;
        let size = self.size() as f64;
        if row < 0.0 || col < 0.0 || row >= size || col >= size {
            return None;
        }
        Some((row as usize, col as usize))
    }

    /// Unmasked cells as (row, column, lag)
    pub fn iter_cells(&self) -> impl Iterator<Item = (usize, usize, f64)> + '_ {
        let size = self.size();
        (0..size).flat_map(move |row| (0..size).filter_map(move |col| self.get(row, col).map(|lag| (row, col, lag))))
    }

    /// Unmasked cells as (position, lag)
    pub fn iter_valid(&self) -> impl Iterator<Item = (Position, f64)> + '_ {
        self.iter_cells().map(move |(row, col, lag)| (self.position_of(row, col), lag))
    }

    pub fn valid_count(&self) -> usize {
        self.values.iter().filter(|v| v.is_some()).count()
    }

    /// Smallest and largest unmasked lag
    pub fn value_range(&self) -> Option<(f64, f64)> {
        self.values.iter().flatten().fold(None, |range, &lag| match range {
            None => Some((lag, lag)),
            Some((lo, hi)) => Some((lo.min(lag), hi.max(lag))),
        })
    }

    /// Same map with every lag rounded to whole samples
    pub fn rounded(&self) -> LagMap {
        LagMap {
            values: self.values.map(|v| v.map(f64::round)),
            ..self.clone()
        }
    }
}

/// Lag field for the pair (a, b) over `grid`
pub fn lag_field(a: &Sensor, b: &Sensor, grid: &GridSpec, model: &PropagationModel) -> LocalizationResult<LagMap> {
    Ok(SensorPair::new(a, b, model)?.lag_field(grid))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{polar_to_cartesian, PolarPosition};

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

    #[test]
    fn test_center_hit_has_zero_lag() {
        let geometry = triangle();
        for (a, b) in geometry.pairs() {
            let pair = SensorPair::from_geometry(&geometry, a, b, &model()).unwrap();
            assert!(pair.lag_at(&Position::ORIGIN).abs() < 1e-9);
        }
    }

    #[test]
    fn test_hit_at_sensor_gives_chord_lag() {
        let geometry = triangle();
        let s1 = geometry.sensors()[0].position;
        let s2 = geometry.sensors()[1].position;
        let s3 = geometry.sensors()[2].position;
        // chord of a 0.9 R ring at 120 degrees
        let chord = 0.9 * R * 3.0_f64.sqrt();
        let expected = chord * model().samples_per_unit();
        assert!((expected - 132.8).abs() < 0.1);

        let lag_12 = theoretical_lag(s1, s2, s1, &model()).unwrap();
        let lag_13 = theoretical_lag(s1, s3, s1, &model()).unwrap();
        assert!((lag_12 - expected).abs() < 1e-9);
        assert!((lag_13 - expected).abs() < 1e-9);

        // reversed pair flips the sign
        let lag_21 = theoretical_lag(s2, s1, s1, &model()).unwrap();
        assert!((lag_21 + expected).abs() < 1e-9);
    }

    #[test]
    fn test_coincident_pair_rejected() {
        let p = Position::new(1.0, 2.0);
        let err = theoretical_lag(p, p, Position::ORIGIN, &model()).unwrap_err();
        assert!(matches!(err, LocalizationError::InvalidGeometry { issue: GeometryIssue::CoincidentSensors, .. }));
        assert!(theoretical_lag(p, Position::ORIGIN, Position::new(f64::NAN, 0.0), &model()).is_err());
    }

    #[test]
    fn test_gradient_matches_finite_difference() {
        let geometry = triangle();
        let pair = SensorPair::from_geometry(&geometry, SensorId(0), SensorId(2), &model()).unwrap();
        let point = polar_to_cartesian(PolarPosition::new(0.4, 75.0), R).unwrap();
        let h = 1e-6;
        let dx = (pair.lag_at(&Position::new(point.x + h, point.y)) - pair.lag_at(&Position::new(point.x - h, point.y))) / (2.0 * h);
        let dy = (pair.lag_at(&Position::new(point.x, point.y + h)) - pair.lag_at(&Position::new(point.x, point.y - h))) / (2.0 * h);
        let gradient = pair.gradient_at(&point);
        assert!((gradient.x - dx).abs() < 1e-5);
        assert!((gradient.y - dy).abs() < 1e-5);
    }

    #[test]
    fn test_lag_field_masks_outside_disc() {
        let geometry = triangle();
        let grid = GridSpec::new(R, 1.0).unwrap();
        let map = lag_field(&geometry.sensors()[0], &geometry.sensors()[1], &grid, &model()).unwrap();

        assert_eq!(map.size(), 2 * 17 + 1);
        assert_eq!(map.pair(), ("s1", "s2"));
        // corner cell is outside the disc
        assert_eq!(map.get(0, 0), None);
        let center = map.nearest_cell(&Position::ORIGIN).unwrap();
        assert_eq!(center, (17, 17));
        assert!(map.get(center.0, center.1).unwrap().abs() < 1e-9);
        assert!(map.iter_valid().all(|(p, _)| p.norm() <= R));

        // lags are bounded by the sensor separation
        let chord = geometry.sensors()[0].position.distance_to(&geometry.sensors()[1].position);
        let (lo, hi) = map.value_range().unwrap();
        let bound = chord * model().samples_per_unit() + 1e-9;
        assert!(lo >= -bound && hi <= bound);
    }

    #[test]
    fn test_edge_tolerance_and_rounding() {
        let geometry = triangle();
        let strict = GridSpec::new(R, 2.0).unwrap();
        let loose = GridSpec::with_edge_tolerance(R, 2.0, 2.0).unwrap();
        let a = &geometry.sensors()[0];
        let b = &geometry.sensors()[2];
        let strict_map = lag_field(a, b, &strict, &model()).unwrap();
        let loose_map = lag_field(a, b, &loose, &model()).unwrap();
        assert!(loose_map.valid_count() > strict_map.valid_count());

        let rounded = strict_map.rounded();
        assert!(rounded.iter_valid().all(|(_, lag)| lag.fract() == 0.0));
        assert_eq!(rounded.valid_count(), strict_map.valid_count());

        assert!(GridSpec::new(R, 0.0).is_err());
        assert!(GridSpec::new(-1.0, 1.0).is_err());
    }

    #[test]
    fn test_grid_too_fine_rejected() {
        for step in [1e-300, 1e-4, R / (MAX_HALF_CELLS as f64 + 2.0)] {
            match GridSpec::new(R, step) {
                Err(LocalizationError::InvalidGeometry { issue, .. }) => {
                    assert_eq!(issue, GeometryIssue::InvalidConstraint)
                }
                other => panic!("step {} accepted: {:?}", step, other),
            }
        }
        assert!(GridSpec::with_edge_tolerance(1.0, 1.0, 1e300).is_err());

        // Fields are public, so the size stays bounded without the constructor
        let unchecked = GridSpec { radius: R, step: 1e-300, edge_tolerance: 0.0 };
        assert_eq!(unchecked.half_cells(), MAX_HALF_CELLS);
        assert_eq!(unchecked.cells_per_axis(), 2 * MAX_HALF_CELLS + 1);

        let finest = GridSpec::new(R, R / MAX_HALF_CELLS as f64).unwrap();
        assert!(finest.half_cells() <= MAX_HALF_CELLS);
        assert_eq!(finest.cells_per_axis(), 2 * finest.half_cells() + 1);
    }

    #[test]
    fn test_position_of_round_trip() {
        let grid = GridSpec::new(10.0, 0.5).unwrap();
        let a = Sensor::new("a", Position::new(5.0, 0.0));
        let b = Sensor::new("b", Position::new(-5.0, 0.0));
        let map = lag_field(&a, &b, &grid, &model()).unwrap();
        let p = map.position_of(3, 30);
        assert_eq!(map.nearest_cell(&p), Some((3, 30)));
        assert_eq!(map.nearest_cell(&Position::new(100.0, 0.0)), None);
    }
}
