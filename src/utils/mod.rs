//! Configuration management

pub mod config;

pub use config::{
    CalibrationSettings, ConfigError, ConfigurationManager, ConfigurationSnapshot, ConstraintConfig, LagMapSettings,
    SensorConfig, SensorPlacement, SystemConfig, ValidationResult,
};
