use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use log::{debug, info};

use crate::algorithms::calibrator::{CalibrationConfig, CalibrationOutcome, Constraint};
use crate::algorithms::lag_model::GridSpec;
use crate::algorithms::localizer::LocalizerConfig;
use crate::core::{
    polar_to_cartesian, sensor_from_spherical, PolarPosition, Position, PropagationModel, Sensor, SensorGeometry,
    SphericalPosition, DEFAULT_DRUM_DIAMETER_CM, DEFAULT_SAMPLE_RATE_HZ, MIN_SENSORS, SPEED_OF_SOUND_AIR,
};
use crate::validation::LocalizationError;

/// System-wide configuration parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemConfig {
    /// Drum head diameter (centimeters)
    pub drum_diameter_cm: f64,
    /// Sampling rate of the arrival indices (Hz)
    pub sample_rate_hz: f64,
    /// Propagation speed of the impact signal (m/s)
    pub speed_m_per_s: f64,
    /// Enable debug logging
    #[serde(default)]
    pub debug_logging: bool,
    /// Localizer tuning
    #[serde(default)]
    pub localizer: LocalizerConfig,
    /// Calibration tuning and constraints
    #[serde(default)]
    pub calibration: CalibrationSettings,
    /// Lag map export settings
    #[serde(default)]
    pub lag_map: LagMapSettings,
}

/// Calibration settings as stored on disk
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CalibrationSettings {
    #[serde(default)]
    pub solver: CalibrationConfig,
    /// Constraints, referring to sensors by name
    #[serde(default)]
    pub constraints: Vec<ConstraintConfig>,
}

/// A calibration constraint that refers to sensors by name
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConstraintConfig {
    /// Keep a sensor where it is, or at `position` when given
    FixedPosition {
        sensor: String,
        #[serde(default)]
        position: Option<Position>,
    },
    EqualRadius { sensors: Vec<String> },
    /// Keep the speed fixed, at the configured speed unless given
    FixedSpeed {
        #[serde(default)]
        speed_m_per_s: Option<f64>,
    },
    FixedAngularSpacing { sensors: Vec<String>, spacing_deg: f64 },
    Free,
}

/// Lag map export settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LagMapSettings {
    /// Grid spacing (centimeters)
    pub step_cm: f64,
    /// Margin past the rim that is still evaluated (centimeters)
    pub edge_tolerance_cm: f64,
    /// Round lags to whole samples
    pub rounded: bool,
}

impl Default for LagMapSettings {
    fn default() -> Self {
        Self {
            step_cm: 0.1,
            edge_tolerance_cm: 0.0,
            rounded: false,
        }
    }
}

/// Where a sensor is mounted
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SensorPlacement {
    /// Fraction of the drum radius and angle in degrees
    Polar { radius: f64, angle_deg: f64 },
    /// Centimeters from the drum center
    Cartesian { x: f64, y: f64 },
    /// Above the head, relative to the drum center; sets the mounting height
    Spherical {
        distance_cm: f64,
        azimuth_deg: f64,
        elevation_deg: f64,
    },
}

/// Individual sensor configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorConfig {
    /// Unique sensor name
    pub name: String,
    pub placement: SensorPlacement,
    /// Mounting height above the head (centimeters)
    #[serde(default)]
    pub height_cm: f64,
    /// Whether this sensor takes part in localization
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl SensorConfig {
    /// Create a new enabled contact sensor at a polar placement
    pub fn polar(name: impl Into<String>, radius: f64, angle_deg: f64) -> Self {
        Self {
            name: name.into(),
            placement: SensorPlacement::Polar { radius, angle_deg },
            height_cm: 0.0,
            enabled: true,
        }
    }

    /// Build the sensor for a drum of the given radius
    pub fn to_sensor(&self, drum_radius_cm: f64) -> Result<Sensor, ConfigError> {
        let sensor = match self.placement {
            SensorPlacement::Polar { radius, angle_deg } => Sensor::new(
                self.name.clone(),
                polar_to_cartesian(PolarPosition::new(radius, angle_deg), drum_radius_cm)?,
            )
            .with_height(self.height_cm),
            SensorPlacement::Cartesian { x, y } => {
                Sensor::new(self.name.clone(), Position::new(x, y)).with_height(self.height_cm)
            }
            SensorPlacement::Spherical {
                distance_cm,
                azimuth_deg,
                elevation_deg,
            } => sensor_from_spherical(
                &self.name,
                SphericalPosition {
                    distance: distance_cm,
                    azimuth_deg,
                    elevation_deg,
                },
            )?,
        };
        Ok(sensor)
    }
}

/// Configuration validation errors
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigError {
    /// Invalid parameter value
    InvalidParameter { parameter: String, value: String, reason: String },
    /// Missing required parameter
    MissingParameter { parameter: String },
    /// Configuration file I/O error
    IoError { message: String },
    /// JSON serialization/deserialization error
    SerializationError { message: String },
    /// Sensor configuration conflict
    SensorConflict { sensor: String, reason: String },
    /// Geometry validation failure
    GeometryValidation { reason: String },
}

/// Configuration validation result
#[derive(Debug)]
pub struct ValidationResult {
    /// Whether configuration is valid
    pub is_valid: bool,
    /// Validation errors
    pub errors: Vec<ConfigError>,
    /// Validation warnings
    pub warnings: Vec<String>,
}

impl ValidationResult {
    fn from_findings(errors: Vec<ConfigError>, warnings: Vec<String>) -> Self {
        Self {
            is_valid: errors.is_empty(),
            errors,
            warnings,
        }
    }

    /// First error, if any
    fn into_error(self) -> Option<ConfigError> {
        self.errors.into_iter().next()
    }
}

/// Main configuration manager
pub struct ConfigurationManager {
    /// Current system configuration
    system_config: SystemConfig,
    /// Sensor configurations in declaration order
    sensor_configs: Vec<SensorConfig>,
    /// Configuration file path
    config_file_path: Option<String>,
    /// Whether configuration has been modified
    is_modified: bool,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            drum_diameter_cm: DEFAULT_DRUM_DIAMETER_CM,
            sample_rate_hz: DEFAULT_SAMPLE_RATE_HZ,
            speed_m_per_s: SPEED_OF_SOUND_AIR,
            debug_logging: false,
            localizer: LocalizerConfig::default(),
            calibration: CalibrationSettings::default(),
            lag_map: LagMapSettings::default(),
        }
    }
}

impl SystemConfig {
    pub fn drum_radius_cm(&self) -> f64 {
        self.drum_diameter_cm / 2.0
    }
}

impl Default for ConfigurationManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigurationManager {
    /// Create a new configuration manager with default settings and no sensors
    pub fn new() -> Self {
        Self {
            system_config: SystemConfig::default(),
            sensor_configs: Vec::new(),
            config_file_path: None,
            is_modified: false,
        }
    }

    /// Create a configuration manager with three sensors evenly spaced at
    /// 90% of the drum radius
    pub fn with_default_layout() -> Self {
        let mut manager = Self::new();
        manager.sensor_configs = vec![
            SensorConfig::polar("s1", 0.9, 0.0),
            SensorConfig::polar("s2", 0.9, 120.0),
            SensorConfig::polar("s3", 0.9, 240.0),
        ];
        manager
    }

    /// Create configuration manager and load from file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut manager = Self::new();
        manager.load_from_file(path)?;
        Ok(manager)
    }

    /// Get current system configuration
    pub fn get_system_config(&self) -> &SystemConfig {
        &self.system_config
    }

    /// Update system configuration with validation
    pub fn update_system_config(&mut self, config: SystemConfig) -> Result<(), ConfigError> {
        let validation = self.validate_system_config(&config);
        if let Some(error) = validation.into_error() {
            return Err(error);
        }
        self.system_config = config;
        self.is_modified = true;
        Ok(())
    }

    /// Get sensor configuration by name
    pub fn get_sensor_config(&self, name: &str) -> Option<&SensorConfig> {
        self.sensor_configs.iter().find(|s| s.name == name)
    }

    /// Get all sensor configurations in declaration order
    pub fn get_all_sensor_configs(&self) -> &[SensorConfig] {
        &self.sensor_configs
    }

    /// Add a sensor, or replace the one with the same name in place
    pub fn set_sensor_config(&mut self, config: SensorConfig) -> Result<(), ConfigError> {
        if let Some(error) = self.validate_sensor_config(&config).into_error() {
            return Err(error);
        }
        match self.sensor_configs.iter_mut().find(|s| s.name == config.name) {
            Some(existing) => *existing = config,
            None => self.sensor_configs.push(config),
        }
        self.is_modified = true;
        Ok(())
    }

    /// Remove sensor configuration
    pub fn remove_sensor_config(&mut self, name: &str) -> Option<SensorConfig> {
        let index = self.sensor_configs.iter().position(|s| s.name == name)?;
        self.is_modified = true;
        Some(self.sensor_configs.remove(index))
    }

    /// Names of enabled sensors in declaration order
    pub fn get_enabled_sensors(&self) -> Vec<&str> {
        self.sensor_configs
            .iter()
            .filter(|config| config.enabled)
            .map(|config| config.name.as_str())
            .collect()
    }

    /// Enable or disable a sensor, keeping enough enabled for localization
    pub fn set_sensor_enabled(&mut self, name: &str, enabled: bool) -> Result<bool, ConfigError> {
        let enabled_count = self.get_enabled_sensors().len();
        let sensor = self
            .sensor_configs
            .iter_mut()
            .find(|s| s.name == name)
            .ok_or_else(|| ConfigError::MissingParameter {
                parameter: format!("sensor '{}'", name),
            })?;
        let old_value = sensor.enabled;

        if !enabled && old_value && enabled_count <= MIN_SENSORS {
            return Err(ConfigError::SensorConflict {
                sensor: name.to_string(),
                reason: format!(
                    "Cannot disable sensor: would leave only {} enabled sensors, but {} required",
                    enabled_count - 1,
                    MIN_SENSORS
                ),
            });
        }

        sensor.enabled = enabled;
        self.is_modified = true;
        Ok(old_value)
    }

    /// Check if a sensor is enabled
    pub fn is_sensor_enabled(&self, name: &str) -> Option<bool> {
        self.get_sensor_config(name).map(|config| config.enabled)
    }

    /// Load configuration from JSON file
    pub fn load_from_file<P: AsRef<Path>>(&mut self, path: P) -> Result<(), ConfigError> {
        let path_str = path.as_ref().to_string_lossy().to_string();

        let content = fs::read_to_string(&path).map_err(|e| ConfigError::IoError {
            message: format!("Failed to read config file '{}': {}", path_str, e),
        })?;

        let config_data: ConfigFileData = serde_json::from_str(&content).map_err(|e| ConfigError::SerializationError {
            message: format!("Failed to parse config file '{}': {}", path_str, e),
        })?;

        // Validate before applying
        if let Some(error) = self.validate_system_config(&config_data.system).into_error() {
            return Err(error);
        }
        for (i, sensor) in config_data.sensors.iter().enumerate() {
            if let Some(error) = self.validate_sensor_config(sensor).into_error() {
                return Err(error);
            }
            if config_data.sensors[..i].iter().any(|other| other.name == sensor.name) {
                return Err(ConfigError::SensorConflict {
                    sensor: sensor.name.clone(),
                    reason: "Duplicate sensor name".to_string(),
                });
            }
        }

        self.system_config = config_data.system;
        self.sensor_configs = config_data.sensors;
        self.config_file_path = Some(path_str);
        self.is_modified = false;
        info!(
            "loaded configuration with {} sensors from {}",
            self.sensor_configs.len(),
            self.config_file_path.as_deref().unwrap_or_default()
        );
        Ok(())
    }

    /// Save configuration to JSON file
    pub fn save_to_file<P: AsRef<Path>>(&mut self, path: P) -> Result<(), ConfigError> {
        let path_str = path.as_ref().to_string_lossy().to_string();

        let config_data = ConfigFileData {
            system: self.system_config.clone(),
            sensors: self.sensor_configs.clone(),
        };

        let content = serde_json::to_string_pretty(&config_data).map_err(|e| ConfigError::SerializationError {
            message: format!("Failed to serialize config: {}", e),
        })?;

        fs::write(&path, content).map_err(|e| ConfigError::IoError {
            message: format!("Failed to write config file '{}': {}", path_str, e),
        })?;

        debug!("saved configuration to {}", path_str);
        self.config_file_path = Some(path_str);
        self.is_modified = false;
        Ok(())
    }

    /// Save to the currently loaded file path
    pub fn save(&mut self) -> Result<(), ConfigError> {
        if let Some(path) = self.config_file_path.clone() {
            self.save_to_file(path)
        } else {
            Err(ConfigError::IoError {
                message: "No file path set for saving configuration".to_string(),
            })
        }
    }

    /// Check if configuration has been modified since last save
    pub fn is_modified(&self) -> bool {
        self.is_modified
    }

    // Runtime Parameter Adjustment Methods

    /// Update propagation speed with validation
    pub fn set_speed(&mut self, speed_m_per_s: f64) -> Result<f64, ConfigError> {
        let old_value = self.system_config.speed_m_per_s;
        if !speed_m_per_s.is_finite() || speed_m_per_s <= 0.0 {
            return Err(ConfigError::InvalidParameter {
                parameter: "speed_m_per_s".to_string(),
                value: speed_m_per_s.to_string(),
                reason: "Propagation speed must be positive".to_string(),
            });
        }
        self.system_config.speed_m_per_s = speed_m_per_s;
        self.is_modified = true;
        Ok(old_value)
    }

    /// Get current propagation speed
    pub fn get_speed(&self) -> f64 {
        self.system_config.speed_m_per_s
    }

    /// Update sample rate with validation
    pub fn set_sample_rate(&mut self, sample_rate_hz: f64) -> Result<f64, ConfigError> {
        let old_value = self.system_config.sample_rate_hz;
        if !sample_rate_hz.is_finite() || sample_rate_hz <= 0.0 {
            return Err(ConfigError::InvalidParameter {
                parameter: "sample_rate_hz".to_string(),
                value: sample_rate_hz.to_string(),
                reason: "Sample rate must be positive".to_string(),
            });
        }
        self.system_config.sample_rate_hz = sample_rate_hz;
        self.is_modified = true;
        Ok(old_value)
    }

    /// Get current sample rate
    pub fn get_sample_rate(&self) -> f64 {
        self.system_config.sample_rate_hz
    }

    /// Update drum diameter with validation
    pub fn set_drum_diameter(&mut self, diameter_cm: f64) -> Result<f64, ConfigError> {
        let old_value = self.system_config.drum_diameter_cm;
        if !diameter_cm.is_finite() || diameter_cm <= 0.0 {
            return Err(ConfigError::InvalidParameter {
                parameter: "drum_diameter_cm".to_string(),
                value: diameter_cm.to_string(),
                reason: "Drum diameter must be positive".to_string(),
            });
        }
        self.system_config.drum_diameter_cm = diameter_cm;
        self.is_modified = true;
        Ok(old_value)
    }

    /// Get current drum diameter
    pub fn get_drum_diameter(&self) -> f64 {
        self.system_config.drum_diameter_cm
    }

    /// Create a configuration snapshot for rollback purposes
    pub fn create_snapshot(&self) -> ConfigurationSnapshot {
        ConfigurationSnapshot {
            system_config: self.system_config.clone(),
            sensor_configs: self.sensor_configs.clone(),
            is_modified: self.is_modified,
        }
    }

    /// Restore configuration from a snapshot
    pub fn restore_from_snapshot(&mut self, snapshot: ConfigurationSnapshot) {
        self.system_config = snapshot.system_config;
        self.sensor_configs = snapshot.sensor_configs;
        self.is_modified = snapshot.is_modified;
    }

    /// Validate system configuration
    pub fn validate_system_config(&self, config: &SystemConfig) -> ValidationResult {
        let mut errors = Vec::new();
        let mut warnings = Vec::new();

        let positive = [
            ("drum_diameter_cm", config.drum_diameter_cm),
            ("sample_rate_hz", config.sample_rate_hz),
            ("speed_m_per_s", config.speed_m_per_s),
            ("localizer.grid_step_fraction", config.localizer.grid_step_fraction),
            ("lag_map.step_cm", config.lag_map.step_cm),
        ];
        for (parameter, value) in positive {
            if !value.is_finite() || value <= 0.0 {
                errors.push(ConfigError::InvalidParameter {
                    parameter: parameter.to_string(),
                    value: value.to_string(),
                    reason: "Must be a positive number".to_string(),
                });
            }
        }

        if !config.lag_map.edge_tolerance_cm.is_finite() || config.lag_map.edge_tolerance_cm < 0.0 {
            errors.push(ConfigError::InvalidParameter {
                parameter: "lag_map.edge_tolerance_cm".to_string(),
                value: config.lag_map.edge_tolerance_cm.to_string(),
                reason: "Edge tolerance must be non-negative".to_string(),
            });
        }

        if errors.is_empty() {
            let radius = config.drum_radius_cm();
            let grids = [
                (
                    "lag_map.step_cm",
                    config.lag_map.step_cm,
                    GridSpec::with_edge_tolerance(radius, config.lag_map.step_cm, config.lag_map.edge_tolerance_cm),
                ),
                (
                    "localizer.grid_step_fraction",
                    config.localizer.grid_step_fraction,
                    GridSpec::new(radius, radius * config.localizer.grid_step_fraction),
                ),
            ];
            for (parameter, value, grid) in grids {
                if let Err(e) = grid {
                    errors.push(ConfigError::InvalidParameter {
                        parameter: parameter.to_string(),
                        value: value.to_string(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        if config.localizer.seed_count == 0 {
            errors.push(ConfigError::InvalidParameter {
                parameter: "localizer.seed_count".to_string(),
                value: "0".to_string(),
                reason: "At least one seed is required".to_string(),
            });
        }

        if config.localizer.grid_step_fraction > 0.5 {
            warnings.push("Coarse seed grid may miss the global minimum".to_string());
        }
        if config.speed_m_per_s < 30.0 || config.speed_m_per_s > 2000.0 {
            warnings.push(format!(
                "Propagation speed {} m/s is unusual for drum heads or air",
                config.speed_m_per_s
            ));
        }

        ValidationResult::from_findings(errors, warnings)
    }

    /// Validate sensor configuration
    pub fn validate_sensor_config(&self, config: &SensorConfig) -> ValidationResult {
        let mut errors = Vec::new();
        let mut warnings = Vec::new();

        if config.name.trim().is_empty() {
            errors.push(ConfigError::MissingParameter {
                parameter: "sensor name".to_string(),
            });
        }

        let coordinates = match config.placement {
            SensorPlacement::Polar { radius, angle_deg } => vec![radius, angle_deg],
            SensorPlacement::Cartesian { x, y } => vec![x, y],
            SensorPlacement::Spherical {
                distance_cm,
                azimuth_deg,
                elevation_deg,
            } => vec![distance_cm, azimuth_deg, elevation_deg],
        };
        if !coordinates.iter().all(|v| v.is_finite()) || !config.height_cm.is_finite() {
            errors.push(ConfigError::InvalidParameter {
                parameter: format!("sensor '{}' placement", config.name),
                value: format!("{:?}", config.placement),
                reason: "Coordinates must be finite".to_string(),
            });
        }
        if config.height_cm < 0.0 {
            errors.push(ConfigError::InvalidParameter {
                parameter: format!("sensor '{}' height_cm", config.name),
                value: config.height_cm.to_string(),
                reason: "Height must be non-negative".to_string(),
            });
        }

        if let Ok(sensor) = config.to_sensor(self.system_config.drum_radius_cm()) {
            if sensor.position.norm() > self.system_config.drum_radius_cm() {
                warnings.push(format!("Sensor '{}' is mounted outside the drum head", config.name));
            }
        }

        ValidationResult::from_findings(errors, warnings)
    }

    /// Build the sensor geometry from the enabled sensors
    pub fn build_geometry(&self) -> Result<SensorGeometry, ConfigError> {
        let radius = self.system_config.drum_radius_cm();
        let sensors = self
            .sensor_configs
            .iter()
            .filter(|config| config.enabled)
            .map(|config| config.to_sensor(radius))
            .collect::<Result<Vec<_>, ConfigError>>()?;
        Ok(SensorGeometry::new(radius, sensors)?)
    }

    /// Build the propagation model
    pub fn build_propagation_model(&self) -> Result<PropagationModel, ConfigError> {
        Ok(PropagationModel::new(
            self.system_config.speed_m_per_s,
            self.system_config.sample_rate_hz,
        )?)
    }

    /// Grid for lag map export
    pub fn build_lag_grid(&self) -> Result<GridSpec, ConfigError> {
        let settings = &self.system_config.lag_map;
        Ok(GridSpec::with_edge_tolerance(
            self.system_config.drum_radius_cm(),
            settings.step_cm,
            settings.edge_tolerance_cm,
        )?)
    }

    /// Resolve the configured constraints against `geometry`
    pub fn build_constraints(&self, geometry: &SensorGeometry) -> Result<Vec<Constraint>, ConfigError> {
        let resolve = |name: &String| {
            geometry.id_of(name).ok_or_else(|| ConfigError::SensorConflict {
                sensor: name.clone(),
                reason: "Constraint refers to a sensor that is missing or disabled".to_string(),
            })
        };

        self.system_config
            .calibration
            .constraints
            .iter()
            .map(|constraint| {
                Ok(match constraint {
                    ConstraintConfig::FixedPosition { sensor, position } => {
                        let id = resolve(sensor)?;
                        let position = match position {
                            Some(position) => *position,
                            None => geometry.sensor(id).map_or(Position::ORIGIN, |s| s.position),
                        };
                        Constraint::FixedPosition { sensor: id, position }
                    }
                    ConstraintConfig::EqualRadius { sensors } => Constraint::EqualRadius {
                        sensors: sensors.iter().map(resolve).collect::<Result<_, _>>()?,
                    },
                    ConstraintConfig::FixedSpeed { speed_m_per_s } => Constraint::FixedSpeed {
                        speed_m_per_s: speed_m_per_s.unwrap_or(self.system_config.speed_m_per_s),
                    },
                    ConstraintConfig::FixedAngularSpacing { sensors, spacing_deg } => Constraint::FixedAngularSpacing {
                        sensors: sensors.iter().map(resolve).collect::<Result<_, _>>()?,
                        spacing_deg: *spacing_deg,
                    },
                    ConstraintConfig::Free => Constraint::Free,
                })
            })
            .collect()
    }

    /// Write a converged calibration back: fitted sensors become Cartesian
    /// placements and the fitted speed replaces the configured one
    pub fn apply_calibration(&mut self, outcome: &CalibrationOutcome) -> Result<(), ConfigError> {
        if !outcome.converged() {
            return Err(ConfigError::InvalidParameter {
                parameter: "calibration".to_string(),
                value: format!("{:?}", outcome.status),
                reason: "Only converged calibrations can be applied".to_string(),
            });
        }

        let snapshot = self.create_snapshot();
        for sensor in outcome.geometry.sensors() {
            let Some(config) = self.sensor_configs.iter_mut().find(|s| s.name == sensor.name) else {
                self.restore_from_snapshot(snapshot);
                return Err(ConfigError::MissingParameter {
                    parameter: format!("sensor '{}'", sensor.name),
                });
            };
            config.placement = SensorPlacement::Cartesian {
                x: sensor.position.x,
                y: sensor.position.y,
            };
            config.height_cm = sensor.height;
        }
        if let Err(error) = self.set_speed(outcome.model.speed()) {
            self.restore_from_snapshot(snapshot);
            return Err(error);
        }

        info!(
            "applied calibration: {} sensors, speed {:.2} m/s",
            outcome.geometry.len(),
            outcome.model.speed()
        );
        self.is_modified = true;
        Ok(())
    }
}

/// Configuration file data structure
#[derive(Debug, Serialize, Deserialize)]
struct ConfigFileData {
    /// System configuration
    system: SystemConfig,
    /// Sensor configurations
    sensors: Vec<SensorConfig>,
}

/// Configuration snapshot for rollback
#[derive(Debug, Clone)]
pub struct ConfigurationSnapshot {
    /// System configuration at snapshot time
    system_config: SystemConfig,
    /// Sensor configurations at snapshot time
    sensor_configs: Vec<SensorConfig>,
    /// Modified flag at snapshot time
    is_modified: bool,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::InvalidParameter { parameter, value, reason } => {
                write!(f, "Invalid parameter '{}' = '{}': {}", parameter, value, reason)
            }
            ConfigError::MissingParameter { parameter } => {
                write!(f, "Missing required parameter: {}", parameter)
            }
            ConfigError::IoError { message } => {
                write!(f, "I/O error: {}", message)
            }
            ConfigError::SerializationError { message } => {
                write!(f, "Serialization error: {}", message)
            }
            ConfigError::SensorConflict { sensor, reason } => {
                write!(f, "Sensor '{}' conflict: {}", sensor, reason)
            }
            ConfigError::GeometryValidation { reason } => {
                write!(f, "Geometry validation error: {}", reason)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<LocalizationError> for ConfigError {
    fn from(error: LocalizationError) -> Self {
        ConfigError::GeometryValidation {
            reason: error.to_string(),
        }
    }
}

impl From<std::io::Error> for ConfigError {
    fn from(error: std::io::Error) -> Self {
        ConfigError::IoError {
            message: error.to_string(),
        }
    }
}

impl From<serde_json::Error> for ConfigError {
    fn from(error: serde_json::Error) -> Self {
        ConfigError::SerializationError {
            message: error.to_string(),
        }
    }
}
