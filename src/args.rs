// Command line argument parser using clap for ghostnote

use clap::{Args, Parser, Subcommand, ValueEnum};

#[derive(Debug, Parser, Clone)]
#[clap(version, about)]
pub struct GhostnoteArgs {
    #[command(subcommand)]
    /// Which task to perform
    pub command: CommandTask,

    /// Drum configuration file (JSON)
    #[arg(short = 'c', long = "config", global = true, default_value = "ghostnote.json")]
    pub config: String,
}

#[derive(Debug, Subcommand, Clone)]
pub enum CommandTask {
    /// Write a default three-sensor configuration file
    #[command(about)]
    InitConfig(InitConfigCommand),

    /// Estimate impact positions for recorded hits
    #[command(about)]
    Locate(LocateCommand),

    /// Fit sensor positions and propagation speed to recorded hits
    #[command(about)]
    Calibrate(CalibrateCommand),

    /// Export the theoretical lag map of one sensor pair
    #[command(about)]
    LagMap(LagMapCommand),
}

#[derive(Debug, Args, Clone)]
pub struct InitConfigCommand {
    /// Overwrite an existing configuration file
    #[arg(short, long)]
    pub force: bool,
}

#[derive(Debug, Args, Clone)]
pub struct LocateCommand {
    /// Hit records, JSON or CSV by extension
    pub input: String,

    /// Output format
    #[arg(short = 'f', long = "format", value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,

    /// Include solver diagnostics
    #[arg(short, long)]
    pub diagnostics: bool,

    /// Filename for output to be written to, stdout when omitted
    #[arg(short = 'o', long = "out")]
    pub outfile: Option<String>,
}

#[derive(Debug, Args, Clone)]
pub struct CalibrateCommand {
    /// Hit records, JSON or CSV by extension
    pub input: String,

    /// Write the fitted geometry and speed back to the configuration file
    #[arg(short, long)]
    pub apply: bool,

    /// Filename for the full calibration outcome (JSON)
    #[arg(short = 'o', long = "out")]
    pub outfile: Option<String>,
}

#[derive(Debug, Args, Clone)]
pub struct LagMapCommand {
    /// First sensor of the pair
    pub first: String,

    /// Second sensor of the pair
    pub second: String,

    /// Export format
    #[arg(short = 'f', long = "format", value_enum, default_value_t = ExportFormat::Csv)]
    pub format: ExportFormat,

    /// Grid spacing in centimeters, overriding the configuration
    #[arg(short, long)]
    pub step: Option<f64>,

    /// Round lags to whole samples, overriding the configuration
    #[arg(short, long)]
    pub rounded: bool,

    /// Filename for output to be written to, stdout when omitted
    #[arg(short = 'o', long = "out")]
    pub outfile: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Text,
    Compact,
    Json,
    Csv,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ExportFormat {
    Csv,
    Json,
}
