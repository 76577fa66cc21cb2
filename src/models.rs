use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Container formats accepted at the file boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileFormat {
    Xlsx,
    Xlsm,
    Xltx,
    Xltm,
    Xls,
    Xlt,
    Xlsb,
    Ods,
    Csv,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FormatFamily {
    Modern,
    Legacy,
    Binary,
    OpenDocument,
    Delimited,
}

pub const ALL_FORMATS: [FileFormat; 9] = [
    FileFormat::Xlsx,
    FileFormat::Xlsm,
    FileFormat::Xltx,
    FileFormat::Xltm,
    FileFormat::Xls,
    FileFormat::Xlt,
    FileFormat::Xlsb,
    FileFormat::Ods,
    FileFormat::Csv,
];

impl FileFormat {
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.trim_start_matches('.').to_ascii_lowercase().as_str() {
            "xlsx" => Some(FileFormat::Xlsx),
            "xlsm" => Some(FileFormat::Xlsm),
            "xltx" => Some(FileFormat::Xltx),
            "xltm" => Some(FileFormat::Xltm),
            "xls" => Some(FileFormat::Xls),
            "xlt" => Some(FileFormat::Xlt),
            "xlsb" => Some(FileFormat::Xlsb),
            "ods" => Some(FileFormat::Ods),
            "csv" => Some(FileFormat::Csv),
            _ => None,
        }
    }

    pub fn from_filename(name: &str) -> Option<Self> {
        name.rsplit_once('.').and_then(|(_, ext)| Self::from_extension(ext))
    }

    pub fn extension(&self) -> &'static str {
        match self {
            FileFormat::Xlsx => "xlsx",
            FileFormat::Xlsm => "xlsm",
            FileFormat::Xltx => "xltx",
            FileFormat::Xltm => "xltm",
            FileFormat::Xls => "xls",
            FileFormat::Xlt => "xlt",
            FileFormat::Xlsb => "xlsb",
            FileFormat::Ods => "ods",
            FileFormat::Csv => "csv",
        }
    }

    pub fn family(&self) -> FormatFamily {
        match self {
            FileFormat::Xlsx | FileFormat::Xlsm | FileFormat::Xltx | FileFormat::Xltm => FormatFamily::Modern,
            FileFormat::Xls | FileFormat::Xlt => FormatFamily::Legacy,
            FileFormat::Xlsb => FormatFamily::Binary,
            FileFormat::Ods => FormatFamily::OpenDocument,
            FileFormat::Csv => FormatFamily::Delimited,
        }
    }

    /// Registered content types for the extension. The generic octet-stream type is
    /// accepted separately by the validator.
    pub fn expected_content_types(&self) -> &'static [&'static str] {
        match self {
            FileFormat::Xlsx => &["application/vnd.openxmlformats-officedocument.spreadsheetml.sheet"],
            FileFormat::Xlsm => &["application/vnd.ms-excel.sheet.macroenabled.12"],
            FileFormat::Xltx => &["application/vnd.openxmlformats-officedocument.spreadsheetml.template"],
            FileFormat::Xltm => &["application/vnd.ms-excel.template.macroenabled.12"],
            FileFormat::Xls | FileFormat::Xlt => &["application/vnd.ms-excel"],
            FileFormat::Xlsb => &["application/vnd.ms-excel.sheet.binary.macroenabled.12"],
            FileFormat::Ods => &["application/vnd.oasis.opendocument.spreadsheet"],
            FileFormat::Csv => &["text/csv", "text/plain", "application/csv"],
        }
    }

    pub fn is_template(&self) -> bool {
        matches!(self, FileFormat::Xltx | FileFormat::Xltm | FileFormat::Xlt)
    }

    pub fn is_macro_enabled(&self) -> bool {
        matches!(self, FileFormat::Xlsm | FileFormat::Xltm | FileFormat::Xls | FileFormat::Xlt | FileFormat::Xlsb)
    }

    pub fn is_binary(&self) -> bool {
        matches!(self.family(), FormatFamily::Legacy | FormatFamily::Binary)
    }
}

impl fmt::Display for FileFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

/// A single cell value. Date-times keep the spreadsheet serial (days since 1899-12-30).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "camelCase")]
pub enum CellValue {
    Number(f64),
    Text(String),
    Boolean(bool),
    DateTime(f64),
    Empty,
    ErrorLiteral(String),
}

impl Default for CellValue {
    fn default() -> Self {
        CellValue::Empty
    }
}

impl CellValue {
    pub fn is_empty(&self) -> bool {
        match self {
            CellValue::Empty => true,
            CellValue::Text(s) => s.is_empty(),
            _ => false,
        }
    }

    pub fn as_datetime(&self) -> Option<NaiveDateTime> {
        match self {
            CellValue::DateTime(serial) => serial_to_datetime(*serial),
            _ => None,
        }
    }

    /// Rough in-memory footprint, used for the streaming memory sample.
    pub fn approx_bytes(&self) -> usize {
        let payload = match self {
            CellValue::Text(s) | CellValue::ErrorLiteral(s) => s.capacity(),
            _ => 0,
        };
        std::mem::size_of::<CellValue>() + payload
    }
}

impl fmt::Display for CellValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CellValue::Number(n) => write!(f, "{}", n),
            CellValue::Text(s) => f.write_str(s),
            CellValue::Boolean(b) => f.write_str(if *b { "TRUE" } else { "FALSE" }),
            CellValue::DateTime(serial) => match serial_to_datetime(*serial) {
                Some(dt) => write!(f, "{}", dt.format("%Y-%m-%dT%H:%M:%S")),
                None => write!(f, "{}", serial),
            },
            CellValue::Empty => Ok(()),
            CellValue::ErrorLiteral(lit) => f.write_str(lit),
        }
    }
}

fn serial_epoch() -> Option<NaiveDateTime> {
    NaiveDate::from_ymd_opt(1899, 12, 30)?.and_hms_opt(0, 0, 0)
}

pub fn serial_to_datetime(serial: f64) -> Option<NaiveDateTime> {
    if !serial.is_finite() {
        return None;
    }
    let millis = (serial * 86_400_000.0).round() as i64;
    serial_epoch()?.checked_add_signed(chrono::Duration::milliseconds(millis))
}

pub fn datetime_to_serial(dt: NaiveDateTime) -> Option<f64> {
    let delta = dt - serial_epoch()?;
    Some(delta.num_milliseconds() as f64 / 86_400_000.0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DataType {
    Numeric,
    Text,
    Boolean,
    DateTime,
    Formula,
    Placeholder,
    Error,
    Empty,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Cell {
    pub value: CellValue,
    /// Source text including the leading `=`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub formula: Option<String>,
}

impl Cell {
    pub fn value(value: CellValue) -> Self {
        Self { value, formula: None }
    }

    pub fn formula(text: impl Into<String>, cached: CellValue) -> Self {
        Self {
            value: cached,
            formula: Some(text.into()),
        }
    }

    pub fn is_blank(&self) -> bool {
        self.formula.is_none() && self.value.is_empty()
    }

    pub fn approx_bytes(&self) -> usize {
        self.value.approx_bytes() + self.formula.as_ref().map_or(0, |f| f.capacity())
    }
}

/// 0-based position; rendered 1-based (`A1`) for users.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CellLocation {
    pub sheet: String,
    pub row: usize,
    pub column: usize,
}

impl CellLocation {
    pub fn new(sheet: impl Into<String>, row: usize, column: usize) -> Self {
        Self {
            sheet: sheet.into(),
            row,
            column,
        }
    }

    pub fn address(&self) -> String {
        cell_address(self.row, self.column)
    }
}

impl fmt::Display for CellLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}!{}", self.sheet, self.address())
    }
}

/// 0 -> "A", 25 -> "Z", 26 -> "AA".
pub fn column_name(mut column: usize) -> String {
    let mut name = Vec::new();
    loop {
        name.push(b'A' + (column % 26) as u8);
        if column < 26 {
            break;
        }
        column = column / 26 - 1;
    }
    name.reverse();
    String::from_utf8_lossy(&name).into_owned()
}

pub fn cell_address(row: usize, column: usize) -> String {
    format!("{}{}", column_name(column), row + 1)
}

/// Parses `A1`, `$B$7` or `Sheet1!C3` into (sheet, row, column), 0-based.
pub fn parse_address(address: &str) -> Option<(Option<String>, usize, usize)> {
    let (sheet, reference) = match address.rsplit_once('!') {
        Some((sheet, reference)) => (Some(sheet.trim_matches('\'').to_string()), reference),
        None => (None, address),
    };
    let reference = reference.replace('$', "");
    let split = reference.find(|c: char| c.is_ascii_digit())?;
    let (letters, digits) = reference.split_at(split);
    if letters.is_empty() || !letters.chars().all(|c| c.is_ascii_alphabetic()) {
        return None;
    }
    let row: usize = digits.parse().ok()?;
    if row == 0 {
        return None;
    }
    let column = letters
        .to_ascii_uppercase()
        .bytes()
        .fold(0usize, |acc, b| acc * 26 + (b - b'A' + 1) as usize)
        - 1;
    Some((sheet, row - 1, column))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComplexityClass {
    Simple,
    Medium,
    Complex,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    FormulaError,
    StructureError,
    CompatibilityWarning,
    BinaryCorruption,
    SecurityWarning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub kind: ErrorKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    pub message: String,
    pub severity: Severity,
}

impl ErrorRecord {
    pub fn new(kind: ErrorKind, severity: Severity, message: impl Into<String>) -> Self {
        Self {
            kind,
            location: None,
            message: message.into(),
            severity,
        }
    }

    pub fn at(mut self, location: impl ToString) -> Self {
        self.location = Some(location.to_string());
        self
    }

    pub fn is_warning(&self) -> bool {
        matches!(self.kind, ErrorKind::CompatibilityWarning | ErrorKind::SecurityWarning)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DependencyEdge {
    /// Formula cell.
    pub dependent: String,
    /// Cell or range the formula reads.
    pub precedent: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircularReference {
    /// Cells on the cycle, in the order the engine reported them.
    pub cells: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FormulaRecord {
    pub location: String,
    pub formula: String,
    pub functions: Vec<String>,
    pub complexity: ComplexityClass,
    pub nesting_depth: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceMetrics {
    pub elapsed_ms: u64,
    pub rows_per_sec: f64,
    pub formulas_per_sec: f64,
    pub chunks: usize,
    pub peak_chunk_bytes: usize,
}

impl PerformanceMetrics {
    pub fn from_elapsed(elapsed: std::time::Duration, rows: usize, formulas: usize) -> Self {
        let secs = elapsed.as_secs_f64();
        let rate = |n: usize| if secs > 0.0 { n as f64 / secs } else { 0.0 };
        Self {
            elapsed_ms: elapsed.as_millis() as u64,
            rows_per_sec: rate(rows),
            formulas_per_sec: rate(formulas),
            chunks: 0,
            peak_chunk_bytes: 0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisResult {
    pub total_rows: usize,
    pub total_cells: usize,
    pub total_formulas: usize,
    pub data_types: BTreeMap<DataType, usize>,
    pub complexity: BTreeMap<ComplexityClass, usize>,
    pub functions: BTreeMap<String, usize>,
    /// Per-sheet formula counts as reported by the engine.
    pub sheet_formula_counts: BTreeMap<String, usize>,
    pub errors: Vec<ErrorRecord>,
    pub dependencies: Vec<DependencyEdge>,
    /// Engine-reported cycles. Authoritative.
    pub circular_references: Vec<CircularReference>,
    /// Cells whose formula mentions their own address. Early signal only.
    pub possible_circular_references: Vec<String>,
    pub complex_formulas: Vec<FormulaRecord>,
    pub batches_flushed: usize,
    pub batches_failed: usize,
    pub undelivered_formulas: usize,
    pub engine_analyzed: bool,
    pub performance: PerformanceMetrics,
}

impl AnalysisResult {
    pub fn record_error(&mut self, record: ErrorRecord) {
        self.errors.push(record);
    }

    pub fn has_critical_errors(&self) -> bool {
        self.errors.iter().any(|e| e.severity == Severity::Critical)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkbookMetadata {
    pub format: FileFormat,
    pub family: FormatFamily,
    pub size_bytes: u64,
    /// First bytes of the container, hex encoded.
    pub signature: String,
    pub sheet_count: usize,
    pub created: Option<NaiveDateTime>,
    pub modified: Option<NaiveDateTime>,
}

impl WorkbookMetadata {
    pub fn new(format: FileFormat, data: &[u8]) -> Self {
        Self {
            format,
            family: format.family(),
            size_bytes: data.len() as u64,
            signature: signature_hex(data, 8),
            sheet_count: 0,
            created: None,
            modified: None,
        }
    }
}

pub fn signature_hex(data: &[u8], len: usize) -> String {
    data.iter().take(len).map(|b| format!("{:02X}", b)).collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sheet {
    pub name: String,
    pub rows: Vec<Vec<Cell>>,
}

impl Sheet {
    pub fn new(name: impl Into<String>, rows: Vec<Vec<Cell>>) -> Self {
        Self {
            name: name.into(),
            rows,
        }
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn column_count(&self) -> usize {
        self.rows.iter().map(|r| r.len()).max().unwrap_or(0)
    }

    pub fn cell(&self, row: usize, column: usize) -> Option<&Cell> {
        self.rows.get(row).and_then(|r| r.get(column))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workbook {
    pub metadata: WorkbookMetadata,
    pub sheets: Vec<Sheet>,
}

impl Workbook {
    pub fn sheet(&self, name: &str) -> Option<&Sheet> {
        self.sheets.iter().find(|s| s.name == name)
    }

    pub fn cell_count(&self) -> usize {
        self.sheets.iter().map(|s| s.rows.iter().map(|r| r.len()).sum::<usize>()).sum()
    }
}
