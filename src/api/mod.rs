//! Output formatting for location estimates and lag maps

pub mod formatting;

pub use formatting::{
    CsvFormatter, DiagnosticInfo, EstimateFormatter, FormattedEstimate, JsonFormatter, LagMapExport, LagMapFormatter,
    PositionData, QualityIndicators, TextFormatter,
};
