//! Error classification for the localization core

pub mod error;

pub use error::{GeometryIssue, LocalizationError, LocalizationResult};
