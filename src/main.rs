use std::fs;
use std::path::Path;

use clap::Parser;
use log::{info, warn};

use ghostnote::algorithms::{Calibrator, GridSpec, Localizer, SensorPair};
use ghostnote::api::{CsvFormatter, EstimateFormatter, JsonFormatter, LagMapFormatter, TextFormatter};
use ghostnote::args::{
    CalibrateCommand, CommandTask, ExportFormat, GhostnoteArgs, InitConfigCommand, LagMapCommand, LocateCommand,
    OutputFormat,
};
use ghostnote::core::ObservedHit;
use ghostnote::processing::{DrumModel, HitFormat, HitRecordParser, LagMapCache};
use ghostnote::utils::{ConfigError, ConfigurationManager};

// Example:
// ghostnote --config snare.json init-config
// ghostnote --config snare.json locate hits.csv --format json --diagnostics
// ghostnote --config snare.json calibrate tuning_hits.json --apply
// ghostnote --config snare.json lag-map s1 s2 --step 0.25 --out s1_s2.csv

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = GhostnoteArgs::parse();

    if let CommandTask::InitConfig(cmd) = &args.command {
        init_logging(false);
        return init_config(&args.config, cmd);
    }

    let loaded = ConfigurationManager::from_file(&args.config);
    init_logging(loaded.as_ref().is_ok_and(|m| m.get_system_config().debug_logging));
    let mut manager = loaded?;

    match args.command {
        CommandTask::Locate(cmd) => locate(&manager, &cmd),
        CommandTask::Calibrate(cmd) => calibrate(&mut manager, &cmd),
        CommandTask::LagMap(cmd) => lag_map(&manager, &cmd),
        CommandTask::InitConfig(_) => Ok(()),
    }
}

/// RUST_LOG wins; otherwise `info`, or `debug` when the config asks for it
fn init_logging(debug_logging: bool) {
    let level = if debug_logging { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();
}

fn init_config(path: &str, cmd: &InitConfigCommand) -> Result<(), Box<dyn std::error::Error>> {
    if Path::new(path).exists() && !cmd.force {
        return Err(format!("{} already exists, pass --force to overwrite", path).into());
    }
    let mut manager = ConfigurationManager::with_default_layout();
    manager.save_to_file(path)?;
    info!("wrote default configuration to {}", path);
    Ok(())
}

fn read_hits(manager: &ConfigurationManager, input: &str) -> Result<Vec<ObservedHit>, Box<dyn std::error::Error>> {
    let geometry = manager.build_geometry()?;
    let text = fs::read_to_string(input).map_err(ConfigError::from)?;
    let hits = HitRecordParser::new(&geometry).parse(&text, HitFormat::from_path(Path::new(input)))?;
    info!("read {} hits from {}", hits.len(), input);
    Ok(hits)
}

fn emit(outfile: Option<&str>, text: &str) -> Result<(), Box<dyn std::error::Error>> {
    match outfile {
        Some(path) => {
            fs::write(path, text)?;
            info!("wrote {}", path);
        }
        None => println!("{}", text.trim_end()),
    }
    Ok(())
}

fn locate(manager: &ConfigurationManager, cmd: &LocateCommand) -> Result<(), Box<dyn std::error::Error>> {
    let hits = read_hits(manager, &cmd.input)?;
    let drum = DrumModel::new(manager.build_geometry()?, manager.build_propagation_model()?);
    let cache = LagMapCache::new();
    let localizer = Localizer::new(manager.get_system_config().localizer.clone());
    let formatter = if cmd.diagnostics {
        EstimateFormatter::with_diagnostics()
    } else {
        EstimateFormatter::new()
    };

    let mut located = Vec::with_capacity(hits.len());
    for (index, hit) in hits.iter().enumerate() {
        match localizer.locate_cached(hit, &drum, &cache) {
            Ok(estimate) => located.push((index, formatter.format(&estimate))),
            Err(e) => warn!("hit {}: {}", index, e),
        }
    }
    let (cache_hits, cache_misses, _) = cache.get_statistics();
    info!(
        "located {} of {} hits ({} lag maps built, {} reused)",
        located.len(),
        hits.len(),
        cache_misses,
        cache_hits
    );

    let output = match cmd.format {
        OutputFormat::Text | OutputFormat::Compact => {
            let text = if cmd.format == OutputFormat::Compact {
                TextFormatter::compact()
            } else {
                TextFormatter::new()
            };
            located
                .iter()
                .map(|(index, formatted)| format!("Hit {}\n{}", index, text.format_text(formatted)))
                .collect::<Vec<_>>()
                .join("\n")
        }
        OutputFormat::Json => {
            let estimates: Vec<_> = located.into_iter().map(|(_, formatted)| formatted).collect();
            JsonFormatter::pretty().format_batch(&estimates)?
        }
        OutputFormat::Csv => CsvFormatter::new().format_all(&located),
    };
    emit(cmd.outfile.as_deref(), &output)
}

fn calibrate(manager: &mut ConfigurationManager, cmd: &CalibrateCommand) -> Result<(), Box<dyn std::error::Error>> {
    let hits = read_hits(manager, &cmd.input)?;
    let geometry = manager.build_geometry()?;
    let model = manager.build_propagation_model()?;
    let constraints = manager.build_constraints(&geometry)?;
    let calibrator = Calibrator::new(manager.get_system_config().calibration.solver.clone());

    let outcome = calibrator.calibrate(&hits, &geometry, &model, &constraints)?;
    println!(
        "{:?} after {} iterations: rms {:.3} samples, speed {:.2} m/s, condition {:.1}",
        outcome.status,
        outcome.iterations,
        outcome.rms_residual,
        outcome.model.speed(),
        outcome.condition_number
    );
    for sensor in outcome.geometry.sensors() {
        println!("  {}: ({:.3}, {:.3}) cm", sensor.name, sensor.position.x, sensor.position.y);
    }

    if let Some(path) = &cmd.outfile {
        emit(Some(path.as_str()), &serde_json::to_string_pretty(&outcome)?)?;
    }

    if cmd.apply {
        // refuses anything that did not converge
        manager.apply_calibration(&outcome)?;
        manager.save()?;
        info!("saved calibrated model");
    } else if !outcome.converged() {
        warn!("calibration did not converge, the fit above is a best effort");
    }
    Ok(())
}

fn lag_map(manager: &ConfigurationManager, cmd: &LagMapCommand) -> Result<(), Box<dyn std::error::Error>> {
    let geometry = manager.build_geometry()?;
    let model = manager.build_propagation_model()?;
    let id_of = |name: &str| {
        geometry
            .id_of(name)
            .ok_or_else(|| format!("sensor '{}' is not declared or is disabled", name))
    };
    let pair = SensorPair::from_geometry(&geometry, id_of(&cmd.first)?, id_of(&cmd.second)?, &model)?;

    let settings = &manager.get_system_config().lag_map;
    let grid = match cmd.step {
        Some(step) => GridSpec::with_edge_tolerance(geometry.radius(), step, settings.edge_tolerance_cm)?,
        None => manager.build_lag_grid()?,
    };
    let mut map = pair.lag_field(&grid);
    if cmd.rounded || settings.rounded {
        map = map.rounded();
    }
    if let Some((lo, hi)) = map.value_range() {
        info!("lag range {:.2} to {:.2} samples over {} cells", lo, hi, map.valid_count());
    }

    let output = match cmd.format {
        ExportFormat::Csv => LagMapFormatter::to_csv(&map),
        ExportFormat::Json => LagMapFormatter::to_json(&map)?,
    };
    emit(cmd.outfile.as_deref(), &output)
}
