//! Parsed workbook <-> engine sheet model, and the diff that proves the two agree.

use crate::clients::models::EngineSheets;
use crate::error::AppError;
use crate::models::{
    datetime_to_serial, Cell, CellLocation, CellValue, ErrorKind, ErrorRecord, Severity, Sheet, Workbook,
};
use crate::services::excel::utils::parse_datetime;
use crate::services::formula::{detect_error_literal, is_formula_text, strip_marker};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use serde_json::{json, Number, Value};

pub const DEFAULT_SAMPLE_LIMIT: usize = 10_000;
/// Mismatch rate above which a conversion is rejected.
pub const MAX_MISMATCH_RATE: f64 = 0.10;
const MAX_DIVERGENCES: usize = 20;
const NUMBER_EPSILON: f64 = 1e-9;
const DATE_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3f";

/// Not representable in the engine model. Documented, never flagged.
pub const KNOWN_LOSSES: &[&str] = &[
    "cell formatting",
    "charts and images",
    "macro code",
    "named ranges",
    "cached formula results",
];

static ISO_DATE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\d{4}-\d{2}-\d{2}(T\d{2}:\d{2}(:\d{2}(\.\d+)?)?)?(Z|[+-]\d{2}:\d{2})?$").expect("valid iso regex"));

pub fn cell_to_engine(cell: &Cell) -> Value {
    if let Some(formula) = &cell.formula {
        return Value::String(formula.clone());
    }
    match &cell.value {
        CellValue::Number(n) => Number::from_f64(*n).map(Value::Number).unwrap_or(Value::Null),
        CellValue::Text(s) if reads_as_text(s) => Value::String(s.clone()),
        CellValue::Text(s) => json!({ "type": "text", "value": s }),
        CellValue::Boolean(b) => Value::Bool(*b),
        CellValue::DateTime(_) => cell
            .value
            .as_datetime()
            .map(|dt| Value::String(dt.format(DATE_FORMAT).to_string()))
            .unwrap_or(Value::Null),
        CellValue::Empty => Value::Null,
        CellValue::ErrorLiteral(literal) => Value::String(literal.clone()),
    }
}

pub fn cell_from_engine(value: &Value) -> Result<Cell, AppError> {
    Ok(match value {
        Value::Null => Cell::default(),
        Value::Bool(b) => Cell::value(CellValue::Boolean(*b)),
        Value::Number(n) => Cell::value(n.as_f64().map(CellValue::Number).unwrap_or_default()),
        Value::String(s) => string_cell(s),
        Value::Object(map) if map.contains_key("type") => typed_cell(map)?,
        Value::Object(map) => match (map.get("formula"), map.get("value")) {
            (Some(Value::String(formula)), cached) => {
                let cached = match cached {
                    Some(v) => cell_from_engine(v)?.value,
                    None => CellValue::Empty,
                };
                Cell::formula(formula.clone(), cached)
            }
            (_, Some(v)) => cell_from_engine(v)?,
            _ => Cell::default(),
        },
        Value::Array(_) => {
            return Err(AppError::ParseError("nested array where a cell was expected".to_string()));
        }
    })
}

/// Plain text that would decode as a formula, error literal or date travels tagged.
fn reads_as_text(s: &str) -> bool {
    matches!(string_cell(s).value, CellValue::Text(_))
}

fn typed_cell(map: &serde_json::Map<String, Value>) -> Result<Cell, AppError> {
    let kind = map.get("type").and_then(Value::as_str).unwrap_or_default();
    let value = map.get("value").unwrap_or(&Value::Null);
    let text = || {
        value
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| AppError::ParseError(format!("'{}' cell without a string value", kind)))
    };
    Ok(match kind {
        "text" => Cell::value(CellValue::Text(text()?)),
        "error" => Cell::value(CellValue::ErrorLiteral(text()?)),
        "date" => {
            let raw = text()?;
            let serial = parse_datetime(&raw)
                .and_then(datetime_to_serial)
                .ok_or_else(|| AppError::ParseError(format!("unreadable date '{}'", raw)))?;
            Cell::value(CellValue::DateTime(serial))
        }
        _ => cell_from_engine(value)?,
    })
}

fn string_cell(s: &str) -> Cell {
    if is_formula_text(s) {
        return Cell::formula(s, CellValue::Empty);
    }
    if let Some(class) = detect_error_literal(s) {
        if class.literal().eq_ignore_ascii_case(s.trim()) {
            return Cell::value(CellValue::ErrorLiteral(class.literal().to_string()));
        }
    }
    if ISO_DATE.is_match(s) {
        if let Some(serial) = parse_datetime(s).and_then(datetime_to_serial) {
            return Cell::value(CellValue::DateTime(serial));
        }
    }
    Cell::value(CellValue::Text(s.to_string()))
}

pub fn to_engine_model(workbook: &Workbook) -> EngineSheets {
    workbook
        .sheets
        .iter()
        .map(|sheet| {
            let rows = sheet
                .rows
                .iter()
                .map(|row| Value::Array(row.iter().map(cell_to_engine).collect()))
                .collect();
            (sheet.name.clone(), Value::Array(rows))
        })
        .collect()
}

pub fn from_engine_model(sheets: &EngineSheets) -> Result<Vec<Sheet>, AppError> {
    sheets
        .iter()
        .map(|(name, grid)| {
            let rows = grid
                .as_array()
                .ok_or_else(|| AppError::ParseError(format!("sheet '{}' is not an array of rows", name)))?;
            let rows = rows
                .iter()
                .enumerate()
                .map(|(r, row)| match row {
                    Value::Array(cells) => cells.iter().map(cell_from_engine).collect::<Result<Vec<_>, _>>(),
                    Value::Null => Ok(Vec::new()),
                    _ => Err(AppError::ParseError(format!("row {} of sheet '{}' is not an array", r + 1, name))),
                })
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Sheet::new(name.clone(), rows))
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CellDivergence {
    pub location: String,
    pub original: String,
    pub returned: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversionReport {
    pub sampled: usize,
    pub mismatches: usize,
    pub mismatch_rate: f64,
    pub valid: bool,
    pub errors: Vec<ErrorRecord>,
    /// First few differing cells.
    pub divergences: Vec<CellDivergence>,
    pub known_losses: Vec<&'static str>,
}

fn values_match(a: &CellValue, b: &CellValue) -> bool {
    match (a, b) {
        (CellValue::Number(x), CellValue::Number(y)) => (x - y).abs() <= NUMBER_EPSILON * x.abs().max(1.0),
        (CellValue::DateTime(_), CellValue::DateTime(_)) => match (a.as_datetime(), b.as_datetime()) {
            (Some(x), Some(y)) => (x - y).num_milliseconds().abs() <= 1,
            _ => false,
        },
        (CellValue::ErrorLiteral(x), CellValue::ErrorLiteral(y)) => x.eq_ignore_ascii_case(y),
        (x, y) if x.is_empty() && y.is_empty() => true,
        (x, y) => x == y,
    }
}

pub fn cells_match(original: &Cell, returned: &Cell) -> bool {
    match (&original.formula, &returned.formula) {
        (Some(a), Some(b)) => strip_marker(a) == strip_marker(b),
        (None, None) => values_match(&original.value, &returned.value),
        _ => false,
    }
}

fn describe(cell: &Cell) -> String {
    match &cell.formula {
        Some(formula) => formula.clone(),
        None => format!("{:?}", cell.value),
    }
}

/// Cell-by-cell diff of `returned` against `original`, bounded by `sample_limit` cells.
pub fn compare(original: &Workbook, returned: &[Sheet], sample_limit: usize) -> ConversionReport {
    let blank = Cell::default();
    let mut sampled = 0;
    let mut mismatches = 0;
    let mut divergences = Vec::new();

    'sheets: for sheet in &original.sheets {
        let other = returned.iter().find(|s| s.name == sheet.name);
        for (r, row) in sheet.rows.iter().enumerate() {
            for (c, cell) in row.iter().enumerate() {
                if sampled >= sample_limit {
                    break 'sheets;
                }
                sampled += 1;
                let counterpart = other.and_then(|s| s.cell(r, c)).unwrap_or(&blank);
                if !cells_match(cell, counterpart) {
                    mismatches += 1;
                    if divergences.len() < MAX_DIVERGENCES {
                        divergences.push(CellDivergence {
                            location: CellLocation::new(sheet.name.as_str(), r, c).to_string(),
                            original: describe(cell),
                            returned: describe(counterpart),
                        });
                    }
                }
            }
        }
    }

    let mismatch_rate = if sampled == 0 {
        0.0
    } else {
        mismatches as f64 / sampled as f64
    };
    let mut errors = Vec::new();
    let valid = mismatch_rate <= MAX_MISMATCH_RATE;
    if !valid {
        errors.push(ErrorRecord::new(
            ErrorKind::StructureError,
            Severity::Critical,
            format!(
                "Round-trip conversion diverged on {:.1}% of {} sampled cells",
                mismatch_rate * 100.0,
                sampled
            ),
        ));
    } else if mismatches > 0 {
        errors.push(ErrorRecord::new(
            ErrorKind::CompatibilityWarning,
            Severity::Medium,
            format!("{} of {} sampled cells changed in conversion", mismatches, sampled),
        ));
    }

    tracing::debug!("Round-trip compare: {}/{} mismatches", mismatches, sampled);
    ConversionReport {
        sampled,
        mismatches,
        mismatch_rate,
        valid,
        errors,
        divergences,
        known_losses: KNOWN_LOSSES.to_vec(),
    }
}

/// Converts to the engine model, serializes it as the wire would, parses it back and diffs.
pub fn validate_round_trip(workbook: &Workbook, sample_limit: usize) -> Result<ConversionReport, AppError> {
    let model = to_engine_model(workbook);
    let wire = serde_json::to_string(&model)?;
    let parsed: EngineSheets = serde_json::from_str(&wire)?;
    let returned = from_engine_model(&parsed)?;

    let report = compare(workbook, &returned, sample_limit);
    if report.valid {
        tracing::info!(
            "Round-trip validation passed ({:.2}% mismatches over {} cells)",
            report.mismatch_rate * 100.0,
            report.sampled
        );
    } else {
        tracing::warn!(
            "Round-trip validation failed ({:.2}% mismatches over {} cells)",
            report.mismatch_rate * 100.0,
            report.sampled
        );
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{FileFormat, WorkbookMetadata};
    use serde_json::json;

    fn workbook(rows: Vec<Vec<Cell>>) -> Workbook {
        Workbook {
            metadata: WorkbookMetadata::new(FileFormat::Xlsx, b"PK"),
            sheets: vec![Sheet::new("Sheet1", rows)],
        }
    }

    fn mixed_rows() -> Vec<Vec<Cell>> {
        vec![
            vec![
                Cell::value(CellValue::Text("name".into())),
                Cell::value(CellValue::Number(1.25)),
                Cell::value(CellValue::Boolean(true)),
            ],
            vec![
                Cell::formula("=SUM(B1:B2)", CellValue::Number(2.5)),
                Cell::value(CellValue::Empty),
                Cell::value(CellValue::ErrorLiteral("#N/A".into())),
            ],
            vec![Cell::value(CellValue::DateTime(45366.5)), Cell::value(CellValue::Number(-0.1))],
        ]
    }

    #[test]
    fn engine_model_shapes() {
        let model = to_engine_model(&workbook(mixed_rows()));
        assert_eq!(
            model["Sheet1"],
            json!([
                ["name", 1.25, true],
                ["=SUM(B1:B2)", null, "#N/A"],
                ["2024-03-15T12:00:00.000", -0.1]
            ])
        );
    }

    #[test]
    fn round_trip_matches_mixed_workbook() {
        let report = validate_round_trip(&workbook(mixed_rows()), DEFAULT_SAMPLE_LIMIT).unwrap();
        assert!(report.valid);
        assert_eq!(report.mismatches, 0);
        assert!(report.errors.is_empty());
        assert_eq!(report.sampled, 8);
    }

    #[test]
    fn formula_marker_is_ignored_in_comparison() {
        let a = Cell::formula("=A1+1", CellValue::Empty);
        let b = Cell::formula("A1+1", CellValue::Number(3.0));
        assert!(cells_match(&a, &b));
    }

    #[test]
    fn large_divergence_is_critical() {
        let original = workbook(vec![vec![Cell::value(CellValue::Number(1.0)); 10]]);
        let returned = vec![Sheet::new("Sheet1", vec![vec![Cell::value(CellValue::Number(2.0)); 10]])];
        let report = compare(&original, &returned, DEFAULT_SAMPLE_LIMIT);
        assert!(!report.valid);
        assert_eq!(report.errors[0].severity, Severity::Critical);
        assert_eq!(report.divergences.len(), 10);
    }

    #[test]
    fn small_divergence_is_a_warning() {
        let mut rows = vec![vec![Cell::value(CellValue::Number(1.0)); 20]];
        let original = workbook(rows.clone());
        rows[0][3] = Cell::value(CellValue::Text("x".into()));
        let report = compare(&original, &[Sheet::new("Sheet1", rows)], DEFAULT_SAMPLE_LIMIT);
        assert!(report.valid);
        assert_eq!(report.errors[0].kind, ErrorKind::CompatibilityWarning);
    }

    #[test]
    fn sample_limit_bounds_the_diff() {
        let original = workbook(vec![vec![Cell::value(CellValue::Number(1.0)); 50]]);
        let report = compare(&original, &[], 5);
        assert_eq!(report.sampled, 5);
        assert_eq!(report.mismatches, 5);
    }

    #[test]
    fn rejects_malformed_engine_sheets() {
        let mut sheets = EngineSheets::new();
        sheets.insert("Bad".into(), json!({"not": "rows"}));
        assert!(matches!(from_engine_model(&sheets), Err(AppError::ParseError(_))));
    }

    #[test]
    fn text_that_looks_like_other_types_stays_text() {
        let rows = vec![vec![
            Cell::value(CellValue::Text("2024-01-01".into())),
            Cell::value(CellValue::Text("2024-02-01T08:30:00".into())),
            Cell::value(CellValue::Text("#N/A".into())),
            Cell::value(CellValue::Text("=not a formula".into())),
            Cell::value(CellValue::Text("hello".into())),
        ]];
        let model = to_engine_model(&workbook(rows.clone()));
        assert_eq!(model["Sheet1"][0][0], json!({"type": "text", "value": "2024-01-01"}));
        assert_eq!(model["Sheet1"][0][4], json!("hello"));

        let returned = from_engine_model(&model).unwrap();
        assert_eq!(returned[0].rows, rows);

        let report = validate_round_trip(&workbook(rows), DEFAULT_SAMPLE_LIMIT).unwrap();
        assert!(report.valid);
        assert_eq!(report.mismatches, 0);
        assert!(report.errors.is_empty());
    }

    #[test]
    fn tagged_dates_and_errors_decode() {
        let date = cell_from_engine(&json!({"type": "date", "value": "2024-03-15T12:00:00.000"})).unwrap();
        assert_eq!(date.value, CellValue::DateTime(45366.5));
        let error = cell_from_engine(&json!({"type": "error", "value": "#DIV/0!"})).unwrap();
        assert_eq!(error.value, CellValue::ErrorLiteral("#DIV/0!".into()));
        assert!(matches!(
            cell_from_engine(&json!({"type": "date", "value": "soon"})),
            Err(AppError::ParseError(_))
        ));
    }

    #[test]
    fn engine_objects_carry_formula_and_value() {
        let cell = cell_from_engine(&json!({"formula": "=A1*2", "value": 4})).unwrap();
        assert_eq!(cell.formula.as_deref(), Some("=A1*2"));
        assert_eq!(cell.value, CellValue::Number(4.0));
    }
}
