//! Location estimate output formatting and lag map export
//!
//! This module renders estimates as human-readable text, JSON and CSV, and
//! exports lag maps for plotting outside the library.

use serde::{Deserialize, Serialize};

use crate::algorithms::lag_model::LagMap;
use crate::algorithms::localizer::{Confidence, LocationEstimate};
use crate::algorithms::solver::SolveStatus;

/// Formatted estimate ready for output
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FormattedEstimate {
    /// Position of the impact
    pub position: PositionData,
    /// Quality indicators
    pub quality: QualityIndicators,
    /// Diagnostic information (optional)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diagnostics: Option<DiagnosticInfo>,
}

/// Impact position in both coordinate systems
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionData {
    pub x_cm: f64,
    pub y_cm: f64,
    /// Distance from the center as a fraction of the drum radius
    pub radius_fraction: f64,
    pub angle_deg: f64,
}

/// Quality indicators for the estimate
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityIndicators {
    pub confidence: Confidence,
    pub rms_residual_samples: f64,
    pub rms_residual_cm: f64,
    pub sensors_used: usize,
    pub pairs_used: usize,
    pub converged: bool,
}

/// Solver details for debugging
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagnosticInfo {
    pub status: SolveStatus,
    pub iterations: usize,
    /// Unprojected least-squares solution
    pub raw_x_cm: f64,
    pub raw_y_cm: f64,
    /// Reasons for low confidence
    pub issues: Vec<String>,
}

/// Converts location estimates into [`FormattedEstimate`]s
pub struct EstimateFormatter {
    /// Include diagnostic information
    pub include_diagnostics: bool,
    /// Decimal places kept for floating-point values
    pub precision: u8,
}

impl Default for EstimateFormatter {
    fn default() -> Self {
        Self {
            include_diagnostics: false,
            precision: 3,
        }
    }
}

impl EstimateFormatter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create formatter with diagnostic information enabled
    pub fn with_diagnostics() -> Self {
        Self {
            include_diagnostics: true,
            ..Default::default()
        }
    }

    /// Set the precision for floating-point values
    pub fn with_precision(mut self, precision: u8) -> Self {
        self.precision = precision;
        self
    }

    pub fn format(&self, estimate: &LocationEstimate) -> FormattedEstimate {
        let position = PositionData {
            x_cm: self.round_to_precision(estimate.position.x),
            y_cm: self.round_to_precision(estimate.position.y),
            radius_fraction: self.round_to_precision(estimate.polar.radius),
            angle_deg: self.round_to_precision(estimate.polar.angle_deg),
        };
        let quality = QualityIndicators {
            confidence: estimate.confidence,
            rms_residual_samples: self.round_to_precision(estimate.rms_residual_samples),
            rms_residual_cm: self.round_to_precision(estimate.rms_residual_cm),
            sensors_used: estimate.sensors_used,
            pairs_used: estimate.pairs_used,
            converged: estimate.converged(),
        };
        let diagnostics = self.include_diagnostics.then(|| DiagnosticInfo {
            status: estimate.status,
            iterations: estimate.iterations,
            raw_x_cm: self.round_to_precision(estimate.raw_position.x),
            raw_y_cm: self.round_to_precision(estimate.raw_position.y),
            issues: estimate.issues.iter().map(ToString::to_string).collect(),
        });

        FormattedEstimate {
            position,
            quality,
            diagnostics,
        }
    }

    /// Round floating-point value to specified precision
    fn round_to_precision(&self, value: f64) -> f64 {
        let multiplier = 10_f64.powi(self.precision as i32);
        (value * multiplier).round() / multiplier
    }
}

/// Human-readable text formatter
#[derive(Default)]
pub struct TextFormatter {
    /// Use the single-line format
    pub compact: bool,
}

impl TextFormatter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn compact() -> Self {
        Self { compact: true }
    }

    /// Format an estimate as human-readable text
    pub fn format_text(&self, formatted: &FormattedEstimate) -> String {
        let position = &formatted.position;
        let quality = &formatted.quality;

        if self.compact {
            let mut output = format!(
                "Hit: ({:.2}, {:.2}) cm | r={:.2}R, {:.1}° | rms {:.2} smp | {:?}",
                position.x_cm,
                position.y_cm,
                position.radius_fraction,
                position.angle_deg,
                quality.rms_residual_samples,
                quality.confidence
            );
            if let Some(diag) = &formatted.diagnostics {
                for issue in &diag.issues {
                    output.push_str(&format!(" | {}", issue));
                }
            }
            return output;
        }

        let mut output = String::new();
        output.push_str("Position:\n");
        output.push_str(&format!("  x:      {:.2} cm\n", position.x_cm));
        output.push_str(&format!("  y:      {:.2} cm\n", position.y_cm));
        output.push_str(&format!("  radius: {:.3} R\n", position.radius_fraction));
        output.push_str(&format!("  angle:  {:.1}°\n", position.angle_deg));

        output.push_str("Quality:\n");
        output.push_str(&format!("  Confidence: {:?}\n", quality.confidence));
        output.push_str(&format!(
            "  Residual:   {:.3} samples ({:.3} cm)\n",
            quality.rms_residual_samples, quality.rms_residual_cm
        ));
        output.push_str(&format!("  Sensors:    {} ({} pairs)\n", quality.sensors_used, quality.pairs_used));

        if let Some(diag) = &formatted.diagnostics {
            output.push_str("Diagnostics:\n");
            output.push_str(&format!("  Status:     {:?} after {} iterations\n", diag.status, diag.iterations));
            output.push_str(&format!("  Raw fit:    ({:.2}, {:.2}) cm\n", diag.raw_x_cm, diag.raw_y_cm));
            if !diag.issues.is_empty() {
                output.push_str("  Issues:\n");
                for issue in &diag.issues {
                    output.push_str(&format!("    - {}\n", issue));
                }
            }
        }

        output
    }
}

/// JSON formatter for structured output
#[derive(Default)]
pub struct JsonFormatter {
    /// Pretty print JSON
    pub pretty: bool,
}

impl JsonFormatter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pretty() -> Self {
        Self { pretty: true }
    }

    /// Format several estimates as a JSON array
    pub fn format_batch(&self, formatted: &[FormattedEstimate]) -> Result<String, serde_json::Error> {
        if self.pretty {
            serde_json::to_string_pretty(formatted)
        } else {
            serde_json::to_string(formatted)
        }
    }
}

/// CSV formatter for data logging
pub struct CsvFormatter {
    /// Include header row
    pub include_header: bool,
}

impl Default for CsvFormatter {
    fn default() -> Self {
        Self { include_header: true }
    }
}

impl CsvFormatter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn header(&self) -> String {
        "hit,x_cm,y_cm,radius_fraction,angle_deg,rms_samples,rms_cm,sensors,pairs,converged,confidence".to_string()
    }

    /// Format one estimate as a CSV row
    pub fn format_csv(&self, hit: usize, formatted: &FormattedEstimate) -> String {
        let position = &formatted.position;
        let quality = &formatted.quality;
        format!(
            "{},{},{},{},{},{},{},{},{},{},{:?}",
            hit,
            position.x_cm,
            position.y_cm,
            position.radius_fraction,
            position.angle_deg,
            quality.rms_residual_samples,
            quality.rms_residual_cm,
            quality.sensors_used,
            quality.pairs_used,
            quality.converged,
            quality.confidence
        )
    }

    /// Format estimates as CSV rows, each tagged with its hit index
    pub fn format_all(&self, formatted: &[(usize, FormattedEstimate)]) -> String {
        let mut output = String::new();
        if self.include_header {
            output.push_str(&self.header());
            output.push('\n');
        }
        for (hit, estimate) in formatted {
            output.push_str(&self.format_csv(*hit, estimate));
            output.push('\n');
        }
        output
    }
}

/// Lag map in a plotting-friendly JSON layout
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LagMapExport {
    pub first: String,
    pub second: String,
    pub step_cm: f64,
    /// Coordinate of cell centers along both axes, lowest first
    pub axis_cm: Vec<f64>,
    /// Lags in samples indexed `[row][col]`, rows along +y; `null` off the membrane
    pub values: Vec<Vec<Option<f64>>>,
}

impl LagMapExport {
    pub fn from_map(map: &LagMap) -> Self {
        let (first, second) = map.pair();
        let size = map.size();
        Self {
            first: first.to_string(),
            second: second.to_string(),
            step_cm: map.step(),
            axis_cm: (0..size).map(|i| map.position_of(0, i).x).collect(),
            values: (0..size)
                .map(|row| (0..size).map(|col| map.get(row, col)).collect())
                .collect(),
        }
    }
}

/// Export formats for lag maps
pub struct LagMapFormatter;

impl LagMapFormatter {
    /// One `x_cm,y_cm,lag_samples` row per unmasked cell
    pub fn to_csv(map: &LagMap) -> String {
        let mut output = String::from("x_cm,y_cm,lag_samples\n");
        for (position, lag) in map.iter_valid() {
            output.push_str(&format!("{},{},{}\n", position.x, position.y, lag));
        }
        output
    }

    pub fn to_json(map: &LagMap) -> Result<String, serde_json::Error> {
        serde_json::to_string(&LagMapExport::from_map(map))
    }
}
