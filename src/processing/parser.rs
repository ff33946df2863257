use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::core::{ObservedHit, Position, PositionAnnotation, SensorGeometry};
use crate::validation::LocalizationError;

/// Column names in hit CSV files that are not sensor names
const X_COLUMN: &str = "x";
const Y_COLUMN: &str = "y";
const RADIUS_COLUMN: &str = "r";

/// On-disk formats for hit records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HitFormat {
    Json,
    Csv,
}

impl HitFormat {
    /// Pick the format from a file extension, defaulting to JSON
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("csv") => HitFormat::Csv,
            _ => HitFormat::Json,
        }
    }
}

/// One serialized hit: arrivals keyed by sensor name
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HitRecord {
    pub arrivals: BTreeMap<String, f64>,
    #[serde(default)]
    pub position: PositionAnnotation,
}

/// Errors that can occur while reading hit records
#[derive(Debug, Clone, PartialEq)]
pub enum ParseError {
    InvalidFormat { details: String },
    UnknownSensor { name: String },
    InvalidSample { row: usize, column: String, value: String },
    InvalidPosition { row: usize, details: String },
    InvalidHit { row: usize, source: LocalizationError },
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::InvalidFormat { details } => write!(f, "Invalid hit record format: {}", details),
            ParseError::UnknownSensor { name } => write!(f, "Unknown sensor name: {}", name),
            ParseError::InvalidSample { row, column, value } => {
                write!(f, "Invalid sample '{}' in row {}, column {}", value, row, column)
            }
            ParseError::InvalidPosition { row, details } => write!(f, "Invalid position in row {}: {}", row, details),
            ParseError::InvalidHit { row, source } => write!(f, "Invalid hit in row {}: {}", row, source),
        }
    }
}

impl std::error::Error for ParseError {}

impl From<serde_json::Error> for ParseError {
    fn from(error: serde_json::Error) -> Self {
        ParseError::InvalidFormat { details: error.to_string() }
    }
}

/// Reads and writes hit records against a sensor geometry, translating
/// sensor names to the geometry's identifiers
pub struct HitRecordParser<'a> {
    geometry: &'a SensorGeometry,
}

impl<'a> HitRecordParser<'a> {
    /// Create a new parser for hits recorded with `geometry`'s sensors
    pub fn new(geometry: &'a SensorGeometry) -> Self {
        Self { geometry }
    }

    /// Parse hits in the given format
    pub fn parse(&self, text: &str, format: HitFormat) -> Result<Vec<ObservedHit>, ParseError> {
        match format {
            HitFormat::Json => self.parse_json(text),
            HitFormat::Csv => self.parse_csv(text),
        }
    }

    /// Parse a JSON array of hit records
    pub fn parse_json(&self, text: &str) -> Result<Vec<ObservedHit>, ParseError> {
        let records: Vec<HitRecord> = serde_json::from_str(text)?;
        records
            .iter()
            .enumerate()
            .map(|(row, record)| self.record_to_hit(row + 1, record))
            .collect()
    }

    /// Convert one record, checking names and samples
    pub fn record_to_hit(&self, row: usize, record: &HitRecord) -> Result<ObservedHit, ParseError> {
        let mut hit = ObservedHit::new().with_annotation(record.position);
        for (name, &sample) in &record.arrivals {
            let id = self
                .geometry
                .id_of(name)
                .ok_or_else(|| ParseError::UnknownSensor { name: name.clone() })?;
            hit.insert(id, sample);
        }
        hit.validate_against(self.geometry)
            .map_err(|source| ParseError::InvalidHit { row, source })?;
        Ok(hit)
    }

    /// Convert a hit back into a named record
    pub fn hit_to_record(&self, hit: &ObservedHit) -> HitRecord {
        let arrivals = hit
            .arrivals()
            .iter()
            .filter_map(|(&id, &sample)| self.geometry.sensor(id).map(|s| (s.name.clone(), sample)))
            .collect();
        HitRecord {
            arrivals,
            position: hit.annotation(),
        }
    }

    pub fn to_json(&self, hits: &[ObservedHit]) -> Result<String, ParseError> {
        let records: Vec<HitRecord> = hits.iter().map(|hit| self.hit_to_record(hit)).collect();
        Ok(serde_json::to_string_pretty(&records)?)
    }

    /// Parse CSV with a header of sensor names and optional `x`, `y` (known
    /// position) or `r` (known radius fraction) columns. Empty cells mean the
    /// sensor did not register; lines starting with `#` are skipped.
    pub fn parse_csv(&self, text: &str) -> Result<Vec<ObservedHit>, ParseError> {
        let mut lines = text
            .lines()
            .map(str::trim)
            .enumerate()
            .filter(|(_, line)| !line.is_empty() && !line.starts_with('#'));

        let (_, header) = lines.next().ok_or_else(|| ParseError::InvalidFormat {
            details: "missing header row".to_string(),
        })?;
        let columns: Vec<&str> = header.split(',').map(str::trim).collect();
        for (i, column) in columns.iter().enumerate() {
            if columns[..i].contains(column) {
                return Err(ParseError::InvalidFormat {
                    details: format!("duplicate column '{}'", column),
                });
            }
            let reserved = [X_COLUMN, Y_COLUMN, RADIUS_COLUMN].contains(column);
            if !reserved && self.geometry.id_of(column).is_none() {
                return Err(ParseError::UnknownSensor { name: column.to_string() });
            }
        }

        let mut hits = Vec::new();
        for (index, line) in lines {
            let row = index + 1;
            let cells: Vec<&str> = line.split(',').map(str::trim).collect();
            if cells.len() != columns.len() {
                return Err(ParseError::InvalidFormat {
                    details: format!("row {} has {} cells, header has {}", row, cells.len(), columns.len()),
                });
            }

            let mut hit = ObservedHit::new();
            let (mut x, mut y, mut radius) = (None, None, None);
            for (&column, &cell) in columns.iter().zip(&cells) {
                if cell.is_empty() {
                    continue;
                }
                let value: f64 = cell.parse().map_err(|_| ParseError::InvalidSample {
                    row,
                    column: column.to_string(),
                    value: cell.to_string(),
                })?;
                match column {
                    X_COLUMN => x = Some(value),
                    Y_COLUMN => y = Some(value),
                    RADIUS_COLUMN => radius = Some(value),
                    name => {
                        if let Some(id) = self.geometry.id_of(name) {
                            hit.insert(id, value);
                        }
                    }
                }
            }

            let annotation = match (x, y, radius) {
                (Some(x), Some(y), None) => PositionAnnotation::Known { position: Position::new(x, y) },
                (None, None, Some(radius_fraction)) => PositionAnnotation::OnCircle { radius_fraction },
                (None, None, None) => PositionAnnotation::Unknown,
                _ => {
                    return Err(ParseError::InvalidPosition {
                        row,
                        details: "give both x and y, or r alone".to_string(),
                    })
                }
            };
            let hit = hit.with_annotation(annotation);
            hit.validate_against(self.geometry)
                .map_err(|source| ParseError::InvalidHit { row, source })?;
            hits.push(hit);
        }
        Ok(hits)
    }

    /// Write hits as CSV with every sensor plus `x`, `y` and `r` columns
    pub fn to_csv(&self, hits: &[ObservedHit]) -> String {
        let mut header: Vec<&str> = self.geometry.sensors().iter().map(|s| s.name.as_str()).collect();
        header.extend([X_COLUMN, Y_COLUMN, RADIUS_COLUMN]);
        let mut output = header.join(",");
        output.push('\n');

        for hit in hits {
            let mut cells: Vec<String> = self
                .geometry
                .ids()
                .map(|id| hit.arrival(id).map(|s| s.to_string()).unwrap_or_default())
                .collect();
            match hit.annotation() {
                PositionAnnotation::Known { position } => {
                    cells.extend([position.x.to_string(), position.y.to_string(), String::new()]);
                }
                PositionAnnotation::OnCircle { radius_fraction } => {
                    cells.extend([String::new(), String::new(), radius_fraction.to_string()]);
                }
                PositionAnnotation::Unknown => cells.extend([String::new(), String::new(), String::new()]),
            }
            output.push_str(&cells.join(","));
            output.push('\n');
        }
        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{PolarPosition, SensorId};

    fn geometry() -> SensorGeometry {
        SensorGeometry::from_polar(
            17.78,
            &[
                ("left", PolarPosition::new(0.9, 0.0)),
                ("top", PolarPosition::new(0.9, 120.0)),
                ("right", PolarPosition::new(0.9, 240.0)),
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_parse_json_records() {
        let geometry = geometry();
        let parser = HitRecordParser::new(&geometry);
        let text = r#"[
            {"arrivals": {"left": 100, "top": 132.5, "right": 90}},
            {"arrivals": {"left": 10, "right": 12, "top": 11}, "position": {"kind": "known", "position": {"x": 1.0, "y": -2.0}}},
            {"arrivals": {"left": 10, "right": 12, "top": 11}, "position": {"kind": "on_circle", "radius_fraction": 0.5}}
        ]"#;
        let hits = parser.parse_json(text).unwrap();
        assert_eq!(hits.len(), 3);
        assert_eq!(hits[0].arrival(SensorId(1)), Some(132.5));
        assert_eq!(hits[0].annotation(), PositionAnnotation::Unknown);
        assert_eq!(hits[1].known_position(), Some(Position::new(1.0, -2.0)));
        assert_eq!(hits[2].annotation(), PositionAnnotation::OnCircle { radius_fraction: 0.5 });
    }

    #[test]
    fn test_json_errors() {
        let geometry = geometry();
        let parser = HitRecordParser::new(&geometry);
        assert_eq!(
            parser.parse_json(r#"[{"arrivals": {"snare": 1}}]"#).unwrap_err(),
            ParseError::UnknownSensor { name: "snare".to_string() }
        );
        assert!(matches!(
            parser.parse_json(r#"[{"arrivals": {"left": -1}}]"#).unwrap_err(),
            ParseError::InvalidHit { row: 1, .. }
        ));
        assert!(matches!(parser.parse_json("not json").unwrap_err(), ParseError::InvalidFormat { .. }));
    }

    #[test]
    fn test_parse_csv_with_missing_cells() {
        let geometry = geometry();
        let parser = HitRecordParser::new(&geometry);
        let text = "# recorded hits\nleft,top,right,x,y\n100,130,95,,\n100,,95,2.5,3.0\n";
        let hits = parser.parse_csv(text).unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].sensor_count(), 3);
        assert_eq!(hits[1].sensor_count(), 2);
        assert_eq!(hits[1].arrival(SensorId(1)), None);
        assert_eq!(hits[1].known_position(), Some(Position::new(2.5, 3.0)));
    }

    #[test]
    fn test_csv_errors() {
        let geometry = geometry();
        let parser = HitRecordParser::new(&geometry);
        assert!(matches!(parser.parse_csv("").unwrap_err(), ParseError::InvalidFormat { .. }));
        assert!(matches!(parser.parse_csv("left,kick\n1,2").unwrap_err(), ParseError::UnknownSensor { .. }));
        assert!(matches!(parser.parse_csv("left,left\n1,2").unwrap_err(), ParseError::InvalidFormat { .. }));
        assert!(matches!(parser.parse_csv("left,top\n1").unwrap_err(), ParseError::InvalidFormat { .. }));
        assert_eq!(
            parser.parse_csv("left,top\n1,abc").unwrap_err(),
            ParseError::InvalidSample { row: 2, column: "top".to_string(), value: "abc".to_string() }
        );
        assert!(matches!(
            parser.parse_csv("left,top,x\n1,2,3").unwrap_err(),
            ParseError::InvalidPosition { row: 2, .. }
        ));
    }

    #[test]
    fn test_csv_written_hits_read_back() {
        let geometry = geometry();
        let parser = HitRecordParser::new(&geometry);
        let hits = vec![
            ObservedHit::new()
                .with_arrival(SensorId(0), 10.0)
                .with_arrival(SensorId(2), 12.25)
                .with_known_position(Position::new(-1.0, 4.0)),
            ObservedHit::new()
                .with_arrival(SensorId(0), 1.0)
                .with_arrival(SensorId(1), 2.0)
                .with_arrival(SensorId(2), 3.0)
                .with_annotation(PositionAnnotation::OnCircle { radius_fraction: 0.75 }),
        ];
        let csv = parser.to_csv(&hits);
        assert!(csv.starts_with("left,top,right,x,y,r\n"));
        assert_eq!(parser.parse_csv(&csv).unwrap(), hits);

        let json = parser.to_json(&hits).unwrap();
        assert_eq!(parser.parse_json(&json).unwrap(), hits);
    }

    #[test]
    fn test_format_from_path() {
        assert_eq!(HitFormat::from_path(Path::new("hits.CSV")), HitFormat::Csv);
        assert_eq!(HitFormat::from_path(Path::new("hits.json")), HitFormat::Json);
        assert_eq!(HitFormat::from_path(Path::new("hits")), HitFormat::Json);
    }
}
