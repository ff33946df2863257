//! Conversions between Cartesian, normalized polar and spherical positions
//!
//! Angles are in degrees, measured counter-clockwise from the +x axis and
//! normalized to [0, 360). Polar radii are fractions of the membrane radius
//! and are not clamped: a radius above 1 is off the membrane, which is the
//! caller's concern.

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

use crate::core::types::{PolarPosition, Position, Sensor};
use crate::validation::{GeometryIssue, LocalizationError, LocalizationResult};

/// Position in 3D relative to the membrane center: `distance` in
/// centimeters, `azimuth_deg` in the membrane plane, `elevation_deg` above
/// the plane (0 = in plane, 90 = straight up)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SphericalPosition {
    pub distance: f64,
    pub azimuth_deg: f64,
    pub elevation_deg: f64,
}

/// Wrap an angle into [0, 360)
pub fn normalize_angle_deg(angle_deg: f64) -> f64 {
    let wrapped = angle_deg.rem_euclid(360.0);
    // rem_euclid can round up to exactly 360 for tiny negative inputs
    if wrapped >= 360.0 {
        0.0
    } else {
        wrapped
    }
}

fn check_radius(radius: f64) -> LocalizationResult<()> {
    if !radius.is_finite() {
        return Err(LocalizationError::invalid_geometry(GeometryIssue::NonFinite, "membrane radius"));
    }
    if radius <= 0.0 {
        return Err(LocalizationError::invalid_geometry(
            GeometryIssue::NonPositiveRadius,
            format!("membrane radius {}", radius),
        ));
    }
    Ok(())
}

/// Convert a normalized polar position to Cartesian centimeters on a
/// membrane of the given radius
pub fn polar_to_cartesian(polar: PolarPosition, radius: f64) -> LocalizationResult<Position> {
    check_radius(radius)?;
    if !polar.radius.is_finite() || !polar.angle_deg.is_finite() {
        return Err(LocalizationError::invalid_geometry(
            GeometryIssue::NonFinite,
            format!("polar position ({}, {})", polar.radius, polar.angle_deg),
        ));
    }
    let r = polar.radius * radius;
    let phi = polar.angle_deg.to_radians();
    Ok(Position::new(r * phi.cos(), r * phi.sin()))
}

/// Convert Cartesian centimeters to a normalized polar position on a
/// membrane of the given radius
pub fn cartesian_to_polar(position: Position, radius: f64) -> LocalizationResult<PolarPosition> {
    check_radius(radius)?;
    if !position.is_finite() {
        return Err(LocalizationError::invalid_geometry(
            GeometryIssue::NonFinite,
            format!("position {:?}", position),
        ));
    }
    let angle = position.y.atan2(position.x).to_degrees();
    Ok(PolarPosition::new(position.norm() / radius, normalize_angle_deg(angle)))
}

/// Convert a spherical position to Cartesian (x, y in the membrane plane, z up)
pub fn spherical_to_cartesian(spherical: SphericalPosition) -> LocalizationResult<Vector3<f64>> {
    let SphericalPosition { distance, azimuth_deg, elevation_deg } = spherical;
    if !distance.is_finite() || !azimuth_deg.is_finite() || !elevation_deg.is_finite() {
        return Err(LocalizationError::invalid_geometry(
            GeometryIssue::NonFinite,
            format!("spherical position {:?}", spherical),
        ));
    }
    let phi = azimuth_deg.to_radians();
    let theta = elevation_deg.to_radians();
    Ok(Vector3::new(
        distance * theta.cos() * phi.cos(),
        distance * theta.cos() * phi.sin(),
        distance * theta.sin(),
    ))
}

/// Convert Cartesian (x, y in the membrane plane, z up) to spherical
pub fn cartesian_to_spherical(point: &Vector3<f64>) -> LocalizationResult<SphericalPosition> {
    if !point.iter().all(|v| v.is_finite()) {
        return Err(LocalizationError::invalid_geometry(
            GeometryIssue::NonFinite,
            format!("point ({}, {}, {})", point.x, point.y, point.z),
        ));
    }
    let distance = point.norm();
    let planar = point.x.hypot(point.y);
    let elevation_deg = if distance == 0.0 { 0.0 } else { point.z.atan2(planar).to_degrees() };
    Ok(SphericalPosition {
        distance,
        azimuth_deg: normalize_angle_deg(point.y.atan2(point.x).to_degrees()),
        elevation_deg,
    })
}

/// Place a sensor (typically a microphone) from spherical coordinates: its
/// planar projection becomes the position and its z the mounting height
pub fn sensor_from_spherical(name: &str, spherical: SphericalPosition) -> LocalizationResult<Sensor> {
    let p = spherical_to_cartesian(spherical)?;
    Ok(Sensor::new(name, Position::new(p.x, p.y)).with_height(p.z))
}
