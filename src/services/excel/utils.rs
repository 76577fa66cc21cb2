use super::types::{MacroRiskAssessment, Placeholder, RiskFinding};
use crate::error::AppError;
use crate::models::{datetime_to_serial, Cell, CellLocation, CellValue, DataType};
use crate::services::formula::{detect_error_literal, is_formula_text, normalize_formula};
use bytes::Bytes;
use calamine::{Data, Reader};
use chrono::{DateTime, NaiveDateTime};
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::Client;
use std::borrow::Cow;
use std::io::{Cursor, Read, Seek};

static PLACEHOLDER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\{\{\s*([A-Za-z0-9_.\-]+)\s*\}\}|\$\{([A-Za-z0-9_.\-]+)\}|<<([A-Za-z0-9_.\-]+)>>")
        .expect("valid placeholder regex")
});

static VBA_AUTO_EXEC: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(Auto_?Open|Auto_?Close|Auto_?Exec|Workbook_Open|Workbook_BeforeClose|Workbook_Activate|Document_Open)\b")
        .expect("valid auto-exec regex")
});

static VBA_RISKY_CALL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(Shell|CreateObject|GetObject|WScript\.Shell|URLDownloadToFile|PowerShell|cmd\.exe|Kill|CallByName|ExecuteExcel4Macro|Environ|MacScript)\b")
        .expect("valid risky-call regex")
});

static CORE_CREATED: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"<dcterms:created[^>]*>([^<]+)<").expect("valid created regex"));
static CORE_MODIFIED: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"<dcterms:modified[^>]*>([^<]+)<").expect("valid modified regex"));
static ODS_CREATED: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"<meta:creation-date>([^<]+)<").expect("valid ods created regex"));
static ODS_MODIFIED: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"<dc:date>([^<]+)<").expect("valid ods modified regex"));

pub fn is_date_string(s: &str) -> bool {
    // Common date formats to try
    let formats = [
        "%Y-%m-%d",
        "%d/%m/%Y",
        "%m/%d/%Y",
        "%Y/%m/%d",
        "%d-%m-%Y",
    ];
    let datetime_formats = [
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%dT%H:%M:%S",
        "%d/%m/%Y %H:%M:%S",
    ];

    formats
        .iter()
        .any(|format| chrono::NaiveDate::parse_from_str(s, format).is_ok())
        || datetime_formats
            .iter()
            .any(|format| NaiveDateTime::parse_from_str(s, format).is_ok())
}

pub fn parse_datetime(s: &str) -> Option<NaiveDateTime> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.naive_utc());
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S"]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(s, format).ok())
        .or_else(|| {
            chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
}

/// Maps a calamine cell onto the closed [`CellValue`] sum type.
pub fn data_to_value(data: &Data) -> CellValue {
    match data {
        Data::Int(i) => CellValue::Number(*i as f64),
        Data::Float(f) => CellValue::Number(*f),
        Data::String(s) if s.is_empty() => CellValue::Empty,
        Data::String(s) => CellValue::Text(s.clone()),
        Data::Bool(b) => CellValue::Boolean(*b),
        Data::DateTime(d) => CellValue::DateTime(d.as_f64()),
        Data::DateTimeIso(s) => parse_datetime(s)
            .and_then(datetime_to_serial)
            .map(CellValue::DateTime)
            .unwrap_or_else(|| CellValue::Text(s.clone())),
        Data::DurationIso(s) => CellValue::Text(s.clone()),
        Data::Error(e) => CellValue::ErrorLiteral(e.to_string()),
        Data::Empty => CellValue::Empty,
    }
}

/// Infers a typed value from delimited-text fields.
pub fn infer_value(field: &str) -> CellValue {
    let trimmed = field.trim();
    if trimmed.is_empty() {
        return CellValue::Empty;
    }
    if trimmed.eq_ignore_ascii_case("true") {
        return CellValue::Boolean(true);
    }
    if trimmed.eq_ignore_ascii_case("false") {
        return CellValue::Boolean(false);
    }
    if let Ok(n) = trimmed.parse::<f64>() {
        if n.is_finite() {
            return CellValue::Number(n);
        }
    }
    if trimmed.starts_with('#') {
        if let Some(class) = detect_error_literal(trimmed) {
            if class.literal().eq_ignore_ascii_case(trimmed) {
                return CellValue::ErrorLiteral(class.literal().to_string());
            }
        }
    }
    CellValue::Text(field.to_string())
}

/// A delimited-text field becomes a formula cell when it carries the marker.
pub fn field_to_cell(field: &str) -> Cell {
    let trimmed = field.trim();
    if is_formula_text(trimmed) {
        Cell::formula(trimmed, CellValue::Empty)
    } else {
        Cell::value(infer_value(field))
    }
}

pub fn placeholders_in(text: &str) -> Vec<String> {
    PLACEHOLDER
        .captures_iter(text)
        .filter_map(|caps| {
            caps.get(1)
                .or_else(|| caps.get(2))
                .or_else(|| caps.get(3))
                .map(|m| m.as_str().to_string())
        })
        .collect()
}

pub fn classify_cell(cell: &Cell) -> DataType {
    if cell.formula.is_some() {
        return DataType::Formula;
    }
    match &cell.value {
        CellValue::Number(_) => DataType::Numeric,
        CellValue::Text(s) if !placeholders_in(s).is_empty() => DataType::Placeholder,
        CellValue::Text(s) if is_date_string(s.trim()) => DataType::DateTime,
        CellValue::Text(s) if s.trim().is_empty() => DataType::Empty,
        CellValue::Text(_) => DataType::Text,
        CellValue::Boolean(_) => DataType::Boolean,
        CellValue::DateTime(_) => DataType::DateTime,
        CellValue::ErrorLiteral(_) => DataType::Error,
        CellValue::Empty => DataType::Empty,
    }
}

pub fn collect_placeholders(location: &CellLocation, cell: &Cell) -> Vec<Placeholder> {
    match &cell.value {
        CellValue::Text(s) if cell.formula.is_none() => placeholders_in(s)
            .into_iter()
            .map(|name| Placeholder {
                name,
                location: location.to_string(),
            })
            .collect(),
        _ => Vec::new(),
    }
}

/// Reads text, falling back to Windows-1252 (common for spreadsheet-exported CSVs).
pub fn decode_text(bytes: &[u8]) -> (Cow<'_, str>, &'static str) {
    let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
    match std::str::from_utf8(bytes) {
        Ok(s) => (Cow::Borrowed(s), "utf-8"),
        Err(_) => {
            let (decoded, _, _) = encoding_rs::WINDOWS_1252.decode(bytes);
            (decoded, "windows-1252")
        }
    }
}

/// Detect the most likely field delimiter by checking consistency across the first few lines.
///
/// For each candidate (tab, semicolon, comma, pipe), count fields per line. The delimiter
/// that produces the most consistent field count (>1 field) wins.
pub fn sniff_delimiter(content: &str) -> u8 {
    let candidates: &[u8] = &[b'\t', b';', b',', b'|'];
    let sample_lines: Vec<&str> = content.lines().take(10).collect();

    if sample_lines.is_empty() {
        return b',';
    }

    let mut best = b',';
    let mut best_score = 0u64;

    for &delim in candidates {
        let counts: Vec<usize> = sample_lines
            .iter()
            .map(|line| {
                csv::ReaderBuilder::new()
                    .delimiter(delim)
                    .has_headers(false)
                    .flexible(true)
                    .from_reader(line.as_bytes())
                    .records()
                    .next()
                    .and_then(|r| r.ok())
                    .map(|r| r.len())
                    .unwrap_or(1)
            })
            .collect();

        if counts.first().copied().unwrap_or(0) <= 1 {
            continue;
        }

        let target = counts[0];
        let consistent = counts.iter().filter(|&&c| c == target).count() as u64;
        let score = consistent * target as u64;

        if score > best_score {
            best_score = score;
            best = delim;
        }
    }

    best
}

#[derive(Debug, Clone, Default)]
pub struct ZipSummary {
    pub entries: Vec<String>,
    pub compressed_bytes: u64,
    pub uncompressed_bytes: u64,
}

impl ZipSummary {
    pub fn contains(&self, name: &str) -> bool {
        self.entries.iter().any(|e| e.eq_ignore_ascii_case(name))
    }
}

pub fn inspect_zip(data: &Bytes) -> Result<ZipSummary, AppError> {
    let mut archive = zip::ZipArchive::new(Cursor::new(data.clone()))?;
    let mut summary = ZipSummary::default();
    for i in 0..archive.len() {
        let entry = archive.by_index(i)?;
        summary.compressed_bytes += entry.compressed_size();
        summary.uncompressed_bytes += entry.size();
        summary.entries.push(entry.name().to_string());
    }
    Ok(summary)
}

pub fn read_zip_text(data: &Bytes, name: &str) -> Option<String> {
    let mut archive = zip::ZipArchive::new(Cursor::new(data.clone())).ok()?;
    let mut entry = archive.by_name(name).ok()?;
    let mut text = String::new();
    entry.read_to_string(&mut text).ok()?;
    Some(text)
}

/// (created, modified) from `docProps/core.xml` or the open-document `meta.xml`.
pub fn document_timestamps(data: &Bytes) -> (Option<NaiveDateTime>, Option<NaiveDateTime>) {
    let capture = |re: &Regex, text: &str| {
        re.captures(text)
            .and_then(|caps| caps.get(1))
            .and_then(|m| parse_datetime(m.as_str()))
    };
    if let Some(core) = read_zip_text(data, "docProps/core.xml") {
        return (capture(&CORE_CREATED, &core), capture(&CORE_MODIFIED, &core));
    }
    if let Some(meta) = read_zip_text(data, "meta.xml") {
        return (capture(&ODS_CREATED, &meta), capture(&ODS_MODIFIED, &meta));
    }
    (None, None)
}

/// Text-only inspection of VBA module source. Nothing is executed.
pub fn scan_vba_source(module: &str, source: &str, assessment: &mut MacroRiskAssessment) {
    for caps in VBA_AUTO_EXEC.captures_iter(source) {
        let entry = format!("{}::{}", module, &caps[1]);
        if !assessment.auto_exec_entry_points.contains(&entry) {
            assessment.auto_exec_entry_points.push(entry);
        }
    }
    for caps in VBA_RISKY_CALL.captures_iter(source) {
        let finding = RiskFinding {
            location: module.to_string(),
            indicator: caps[1].to_string(),
        };
        if !assessment.vba_findings.contains(&finding) {
            assessment.vba_findings.push(finding);
        }
    }
}

/// Reads the container's VBA project, if any. An unreadable project is reported back as
/// a message; the caller decides how loud to be about it.
pub fn assess_vba<RS, R>(workbook: &mut R) -> (MacroRiskAssessment, Option<String>)
where
    RS: Read + Seek,
    R: Reader<RS>,
    R::Error: std::fmt::Display,
{
    let mut assessment = MacroRiskAssessment::none();
    let mut problem = None;

    match workbook.vba_project() {
        None => {}
        Some(Err(e)) => {
            assessment.has_vba_project = true;
            problem = Some(format!("VBA project could not be read: {}", e));
        }
        Some(Ok(project)) => {
            assessment.has_vba_project = true;
            let names: Vec<String> = project.get_module_names().iter().map(|n| n.to_string()).collect();
            for name in names {
                match project.get_module(&name) {
                    Ok(source) => scan_vba_source(&name, &source, &mut assessment),
                    Err(e) => tracing::warn!("Failed to decode VBA module {}: {}", name, e),
                }
                assessment.modules.push(name);
            }
        }
    }

    assessment.recompute_level();
    (assessment, problem)
}

pub async fn load_file_from_url(url: &str) -> Result<Bytes, AppError> {
    let client = Client::new();
    let response = client
        .get(url)
        .send()
        .await
        .map_err(|e| AppError::HttpError(format!("Failed to fetch file: {}", e)))?;

    if !response.status().is_success() {
        return Err(AppError::HttpError(
            format!("Failed to fetch file. Status: {}", response.status())
        ));
    }

    response
        .bytes()
        .await
        .map_err(|e| AppError::HttpError(format!("Failed to read response bytes: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn infers_delimited_values() {
        assert_eq!(infer_value("1.5"), CellValue::Number(1.5));
        assert_eq!(infer_value(" TRUE "), CellValue::Boolean(true));
        assert_eq!(infer_value("#DIV/0!"), CellValue::ErrorLiteral("#DIV/0!".into()));
        assert_eq!(infer_value("#hashtag"), CellValue::Text("#hashtag".into()));
        assert_eq!(infer_value(""), CellValue::Empty);
        assert_eq!(infer_value("NaN"), CellValue::Text("NaN".into()));
    }

    #[test]
    fn formula_fields_keep_their_marker() {
        let cell = field_to_cell("=A1&B1");
        assert_eq!(cell.formula.as_deref(), Some("=A1&B1"));
        assert_eq!(classify_cell(&cell), DataType::Formula);
        assert!(field_to_cell("=").formula.is_none());
    }

    #[test]
    fn classifies_placeholders_and_dates() {
        assert_eq!(classify_cell(&Cell::value(CellValue::Text("Dear {{ customer }}".into()))), DataType::Placeholder);
        assert_eq!(classify_cell(&Cell::value(CellValue::Text("2024-02-01".into()))), DataType::DateTime);
        assert_eq!(classify_cell(&Cell::value(CellValue::Text("hello".into()))), DataType::Text);
        assert_eq!(classify_cell(&Cell::default()), DataType::Empty);
    }

    #[test]
    fn placeholder_syntaxes() {
        assert_eq!(
            placeholders_in("{{a}} ${b.c} <<d>> {e}"),
            vec!["a".to_string(), "b.c".to_string(), "d".to_string()]
        );
    }

    #[test]
    fn sniffs_semicolons() {
        assert_eq!(sniff_delimiter("a;b;c\n1;2;3\n"), b';');
        assert_eq!(sniff_delimiter("a,b\n1,2\n"), b',');
        assert_eq!(sniff_delimiter(""), b',');
    }

    #[test]
    fn decodes_windows_1252_fallback() {
        let (text, encoding) = decode_text(b"caf\xE9,1\n");
        assert_eq!(encoding, "windows-1252");
        assert!(text.starts_with("café"));

        let (text, encoding) = decode_text(b"\xEF\xBB\xBFa,b");
        assert_eq!(encoding, "utf-8");
        assert_eq!(text, "a,b");
    }

    #[test]
    fn vba_scan_finds_entry_points_and_calls() {
        let mut assessment = MacroRiskAssessment::none();
        assessment.has_vba_project = true;
        let source = "Sub Workbook_Open()\n  Shell \"cmd.exe /c calc\"\nEnd Sub";
        scan_vba_source("ThisWorkbook", source, &mut assessment);
        assessment.recompute_level();
        assert_eq!(assessment.auto_exec_entry_points, vec!["ThisWorkbook::Workbook_Open"]);
        assert!(assessment.vba_findings.iter().any(|f| f.indicator == "Shell"));
        assert_eq!(assessment.risk_level, super::super::types::RiskLevel::High);
    }

    #[test]
    fn parses_document_property_timestamps() {
        assert!(parse_datetime("2024-01-02T03:04:05Z").is_some());
        assert!(parse_datetime("2024-01-02T03:04:05.123").is_some());
        assert!(parse_datetime("yesterday").is_none());
    }

    #[test]
    fn data_conversion_covers_errors_and_empty_strings() {
        assert_eq!(data_to_value(&Data::Int(3)), CellValue::Number(3.0));
        assert_eq!(data_to_value(&Data::String(String::new())), CellValue::Empty);
        assert_eq!(
            data_to_value(&Data::Error(calamine::CellErrorType::Div0)),
            CellValue::ErrorLiteral("#DIV/0!".into())
        );
    }
}
