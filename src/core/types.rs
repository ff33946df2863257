//! Core data types for the localization system

use std::collections::BTreeMap;
use std::fmt;

use nalgebra::Vector2;
use serde::{Deserialize, Serialize};

use crate::core::constants::{CENTIMETERS_PER_METER, MIN_SENSORS, MIN_SENSOR_SEPARATION_CM, SPEED_OF_SOUND_AIR};
use crate::core::coordinates::polar_to_cartesian;
use crate::validation::{GeometryIssue, LocalizationError, LocalizationResult};

/// Point on the membrane in Cartesian coordinates (centimeters, origin at the center)
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

impl Position {
    pub const ORIGIN: Position = Position { x: 0.0, y: 0.0 };

    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    /// Distance from the membrane center
    pub fn norm(&self) -> f64 {
        self.x.hypot(self.y)
    }

    pub fn distance_to(&self, other: &Position) -> f64 {
        (self.x - other.x).hypot(self.y - other.y)
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }

    pub fn to_vector(&self) -> Vector2<f64> {
        Vector2::new(self.x, self.y)
    }

    pub fn from_vector(v: &Vector2<f64>) -> Self {
        Self { x: v.x, y: v.y }
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({:.3}, {:.3})", self.x, self.y)
    }
}

/// Normalized polar position: `radius` in [0, 1] of the membrane radius,
/// `angle_deg` in [0, 360) measured counter-clockwise from the +x axis
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct PolarPosition {
    pub radius: f64,
    pub angle_deg: f64,
}

impl PolarPosition {
    pub fn new(radius: f64, angle_deg: f64) -> Self {
        Self { radius, angle_deg }
    }
}

/// Identifier of a sensor, declared by the [`SensorGeometry`] that owns it
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SensorId(pub u16);

impl SensorId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for SensorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A named sensor mounted on or above the membrane
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sensor {
    pub name: String,
    /// Projection of the sensor onto the membrane plane
    pub position: Position,
    /// Mounting height above the membrane (centimeters), 0 for contact sensors
    #[serde(default)]
    pub height: f64,
}

impl Sensor {
    pub fn new(name: impl Into<String>, position: Position) -> Self {
        Self {
            name: name.into(),
            position,
            height: 0.0,
        }
    }

    pub fn with_height(mut self, height: f64) -> Self {
        self.height = height;
        self
    }

    /// Straight-line path length from a membrane point to this sensor
    pub fn distance_to(&self, point: &Position) -> f64 {
        let planar = self.position.distance_to(point);
        if self.height == 0.0 {
            planar
        } else {
            planar.hypot(self.height)
        }
    }
}

/// Ordered collection of sensors on a circular membrane of radius `radius`
///
/// A sensor's [`SensorId`] is its index in the collection.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SensorGeometry {
    radius: f64,
    sensors: Vec<Sensor>,
}

impl SensorGeometry {
    /// Create a validated geometry
    pub fn new(radius: f64, sensors: Vec<Sensor>) -> LocalizationResult<Self> {
        let geometry = Self { radius, sensors };
        geometry.validate()?;
        Ok(geometry)
    }

    /// Create a geometry from named sensors in normalized polar coordinates
    pub fn from_polar(radius: f64, placements: &[(&str, PolarPosition)]) -> LocalizationResult<Self> {
        let sensors = placements
            .iter()
            .map(|(name, polar)| Ok(Sensor::new(*name, polar_to_cartesian(*polar, radius)?)))
            .collect::<LocalizationResult<Vec<_>>>()?;
        Self::new(radius, sensors)
    }

    /// Check the layout invariants: finite values, R > 0, at least three
    /// sensors, unique names, no coincident sensors
    pub fn validate(&self) -> LocalizationResult<()> {
        if !self.radius.is_finite() {
            return Err(LocalizationError::invalid_geometry(GeometryIssue::NonFinite, "membrane radius"));
        }
        if self.radius <= 0.0 {
            return Err(LocalizationError::invalid_geometry(
                GeometryIssue::NonPositiveRadius,
                format!("membrane radius {}", self.radius),
            ));
        }
        if self.sensors.len() < MIN_SENSORS {
            return Err(LocalizationError::invalid_geometry(
                GeometryIssue::TooFewSensors,
                format!("{} sensors declared, {} required", self.sensors.len(), MIN_SENSORS),
            ));
        }
        if self.sensors.len() > u16::MAX as usize {
            return Err(LocalizationError::invalid_geometry(
                GeometryIssue::InvalidConstraint,
                format!("{} sensors exceed the identifier space", self.sensors.len()),
            ));
        }

        for (i, sensor) in self.sensors.iter().enumerate() {
            if !sensor.position.is_finite() || !sensor.height.is_finite() {
                return Err(LocalizationError::invalid_geometry(
                    GeometryIssue::NonFinite,
                    format!("sensor '{}'", sensor.name),
                ));
            }
            for other in &self.sensors[i + 1..] {
                if other.name == sensor.name {
                    return Err(LocalizationError::invalid_geometry(
                        GeometryIssue::DuplicateName,
                        format!("sensor '{}'", sensor.name),
                    ));
                }
                let separation = sensor.position.distance_to(&other.position).hypot(sensor.height - other.height);
                if separation < MIN_SENSOR_SEPARATION_CM {
                    return Err(LocalizationError::invalid_geometry(
                        GeometryIssue::CoincidentSensors,
                        format!("'{}' and '{}'", sensor.name, other.name),
                    ));
                }
            }
        }

        Ok(())
    }

    pub fn radius(&self) -> f64 {
        self.radius
    }

    pub fn sensors(&self) -> &[Sensor] {
        &self.sensors
    }

    pub fn len(&self) -> usize {
        self.sensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sensors.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = SensorId> + '_ {
        (0..self.sensors.len()).map(|i| SensorId(i as u16))
    }

    pub fn sensor(&self, id: SensorId) -> Option<&Sensor> {
        self.sensors.get(id.index())
    }

    pub fn id_of(&self, name: &str) -> Option<SensorId> {
        self.sensors
            .iter()
            .position(|s| s.name == name)
            .map(|i| SensorId(i as u16))
    }

    /// Whether a point lies on the membrane (x² + y² ≤ R²)
    pub fn contains(&self, point: &Position) -> bool {
        point.norm() <= self.radius
    }

    /// All unordered sensor pairs in declaration order
    pub fn pairs(&self) -> Vec<(SensorId, SensorId)> {
        let ids: Vec<SensorId> = self.ids().collect();
        let mut pairs = Vec::with_capacity(ids.len() * (ids.len() - 1) / 2);
        for (i, &a) in ids.iter().enumerate() {
            for &b in &ids[i + 1..] {
                pairs.push((a, b));
            }
        }
        pairs
    }

    /// Same sensors and radius with new planar positions, re-validated
    pub fn with_positions(&self, positions: &[Position]) -> LocalizationResult<Self> {
        if positions.len() != self.sensors.len() {
            return Err(LocalizationError::invalid_geometry(
                GeometryIssue::InvalidConstraint,
                format!("{} positions for {} sensors", positions.len(), self.sensors.len()),
            ));
        }
        let sensors = self
            .sensors
            .iter()
            .zip(positions)
            .map(|(sensor, position)| Sensor {
                position: *position,
                ..sensor.clone()
            })
            .collect();
        Self::new(self.radius, sensors)
    }
}

/// Propagation speed and sampling rate shared by all lag computations
///
/// Assumes an isotropic, non-dispersive medium. This does not hold across
/// media boundaries such as the rim versus the head.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PropagationModel {
    speed_m_per_s: f64,
    sample_rate_hz: f64,
}

impl PropagationModel {
    pub fn new(speed_m_per_s: f64, sample_rate_hz: f64) -> LocalizationResult<Self> {
        if !speed_m_per_s.is_finite() || !sample_rate_hz.is_finite() {
            return Err(LocalizationError::invalid_geometry(
                GeometryIssue::NonFinite,
                "propagation speed or sample rate",
            ));
        }
        if speed_m_per_s <= 0.0 {
            return Err(LocalizationError::invalid_geometry(
                GeometryIssue::NonPositiveSpeed,
                format!("{} m/s", speed_m_per_s),
            ));
        }
        if sample_rate_hz <= 0.0 {
            return Err(LocalizationError::invalid_geometry(
                GeometryIssue::NonPositiveSampleRate,
                format!("{} Hz", sample_rate_hz),
            ));
        }
        Ok(Self { speed_m_per_s, sample_rate_hz })
    }

    /// Sound travelling through air to microphones above the head
    pub fn air(sample_rate_hz: f64) -> LocalizationResult<Self> {
        Self::new(SPEED_OF_SOUND_AIR, sample_rate_hz)
    }

    pub fn speed(&self) -> f64 {
        self.speed_m_per_s
    }

    pub fn sample_rate(&self) -> f64 {
        self.sample_rate_hz
    }

    /// Lag in samples per centimeter of path-length difference
    pub fn samples_per_unit(&self) -> f64 {
        self.sample_rate_hz / (self.speed_m_per_s * CENTIMETERS_PER_METER)
    }

    pub fn with_speed(&self, speed_m_per_s: f64) -> LocalizationResult<Self> {
        Self::new(speed_m_per_s, self.sample_rate_hz)
    }
}

/// What is known about where a hit landed
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PositionAnnotation {
    /// Ground-truth position
    Known { position: Position },
    /// Known distance from the center as a fraction of the radius, unknown angle
    OnCircle { radius_fraction: f64 },
    #[default]
    Unknown,
}

/// One detected event: per-sensor arrival sample indices on a shared clock
///
/// Only differences between arrivals matter. Sensors that failed to register
/// an onset are simply absent.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ObservedHit {
    arrivals: BTreeMap<SensorId, f64>,
    #[serde(default)]
    annotation: PositionAnnotation,
}

/// Observed lag for one sensor pair: arrival at `second` minus arrival at `first`
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ObservedLag {
    pub first: SensorId,
    pub second: SensorId,
    pub samples: f64,
}

impl ObservedHit {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a hit from integer sample indices produced by onset detection
    pub fn from_samples<I>(samples: I) -> Self
    where
        I: IntoIterator<Item = (SensorId, u64)>,
    {
        Self {
            arrivals: samples.into_iter().map(|(id, s)| (id, s as f64)).collect(),
            annotation: PositionAnnotation::Unknown,
        }
    }

    /// Add an arrival, fractional for sub-sample interpolated onsets
    pub fn with_arrival(mut self, sensor: SensorId, sample: f64) -> Self {
        self.arrivals.insert(sensor, sample);
        self
    }

    pub fn insert(&mut self, sensor: SensorId, sample: f64) {
        self.arrivals.insert(sensor, sample);
    }

    pub fn with_known_position(mut self, position: Position) -> Self {
        self.annotation = PositionAnnotation::Known { position };
        self
    }

    pub fn with_annotation(mut self, annotation: PositionAnnotation) -> Self {
        self.annotation = annotation;
        self
    }

    pub fn annotation(&self) -> PositionAnnotation {
        self.annotation
    }

    pub fn known_position(&self) -> Option<Position> {
        match self.annotation {
            PositionAnnotation::Known { position } => Some(position),
            _ => None,
        }
    }

    pub fn arrivals(&self) -> &BTreeMap<SensorId, f64> {
        &self.arrivals
    }

    pub fn arrival(&self, sensor: SensorId) -> Option<f64> {
        self.arrivals.get(&sensor).copied()
    }

    pub fn sensor_count(&self) -> usize {
        self.arrivals.len()
    }

    /// Reject arrivals from undeclared sensors and malformed sample indices
    pub fn validate_against(&self, geometry: &SensorGeometry) -> LocalizationResult<()> {
        for (&sensor, &sample) in &self.arrivals {
            if geometry.sensor(sensor).is_none() {
                return Err(LocalizationError::UnknownSensor { id: sensor });
            }
            if !sample.is_finite() || sample < 0.0 {
                return Err(LocalizationError::InvalidObservation { sensor, value: sample });
            }
        }
        if let PositionAnnotation::Known { position } = self.annotation {
            if !position.is_finite() {
                return Err(LocalizationError::invalid_geometry(GeometryIssue::NonFinite, "annotated hit position"));
            }
        }
        Ok(())
    }

    /// Lags for every unordered pair of observed sensors, ordered by sensor id
    pub fn pairwise_lags(&self) -> Vec<ObservedLag> {
        let observed: Vec<(SensorId, f64)> = self.arrivals.iter().map(|(&id, &s)| (id, s)).collect();
        let mut lags = Vec::with_capacity(observed.len() * observed.len().saturating_sub(1) / 2);
        for (i, &(first, a)) in observed.iter().enumerate() {
            for &(second, b) in &observed[i + 1..] {
                lags.push(ObservedLag {
                    first,
                    second,
                    samples: b - a,
                });
            }
        }
        lags
    }
}
