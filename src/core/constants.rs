//! Physical constants and system parameters

/// Speed of sound in air at room temperature (m/s)
pub const SPEED_OF_SOUND_AIR: f64 = 343.0;

/// Default drum head diameter: a 14" snare (centimeters)
pub const DEFAULT_DRUM_DIAMETER_CM: f64 = 14.0 * 2.54;

/// Default audio sampling rate (Hz)
pub const DEFAULT_SAMPLE_RATE_HZ: f64 = 96_000.0;

/// Positions are expressed in centimeters, speeds in meters per second
pub const CENTIMETERS_PER_METER: f64 = 100.0;

/// Minimum number of sensors for a unique 2D solution
pub const MIN_SENSORS: usize = 3;

/// Two sensors closer than this are considered coincident (centimeters)
pub const MIN_SENSOR_SEPARATION_CM: f64 = 1e-6;
