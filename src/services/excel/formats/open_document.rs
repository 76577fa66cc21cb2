use super::{metadata_for, unsupported};
use crate::error::AppError;
use crate::models::{ErrorKind, ErrorRecord, FileFormat, Severity};
use crate::services::excel::analyzer::{walk_sheets, FormatAnalyzer, WalkOptions};
use crate::services::excel::sources::{ByteCursor, CalamineSource, SheetSource};
use crate::services::excel::types::{FormatExtension, FormatReport, OpenDocumentNotes};
use crate::services::excel::utils::read_zip_text;
use crate::services::formula::normalize_formula;
use bytes::Bytes;
use calamine::Ods;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeSet;

pub const ODS_MIMETYPE: &str = "application/vnd.oasis.opendocument.spreadsheet";

static BRACKET_REFERENCE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[([^\]]+)\]").expect("valid reference regex"));

/// Functions only LibreOffice evaluates.
const LIBREOFFICE_ONLY: &[&str] = &[
    "EASTERSUNDAY",
    "DAYSINMONTH",
    "DAYSINYEAR",
    "WEEKSINYEAR",
    "ISLEAPYEAR",
    "MONTHS",
    "WEEKS",
    "YEARS",
    "ROT13",
    "CURRENT",
    "STYLE",
    "MULTIPLE.OPERATIONS",
];

/// `.ods` packages.
pub struct OpenDocumentAnalyzer;

fn rewrite_reference(inner: &str) -> String {
    inner
        .split(':')
        .map(|part| {
            if let Some(cell) = part.strip_prefix('.') {
                return cell.to_string();
            }
            match part.rfind('.') {
                Some(dot) => {
                    let sheet = part[..dot].trim_start_matches('$');
                    format!("{}!{}", sheet, &part[dot + 1..])
                }
                None => part.to_string(),
            }
        })
        .collect::<Vec<_>>()
        .join(":")
}

/// Turns OpenFormula (`of:=SUM([.A1:.B2];2)`) into `=SUM(A1:B2,2)`. The flag is true
/// when anything besides the namespace prefix changed.
pub fn normalize_open_formula(raw: &str) -> (String, bool) {
    let trimmed = raw.trim();
    let body = trimmed
        .strip_prefix("of:")
        .or_else(|| trimmed.strip_prefix("oooc:"))
        .unwrap_or(trimmed);

    let references = BRACKET_REFERENCE.replace_all(body, |caps: &regex::Captures| rewrite_reference(&caps[1]));

    let mut out = String::with_capacity(references.len());
    let mut in_string = false;
    for c in references.chars() {
        match c {
            '"' => {
                in_string = !in_string;
                out.push(c);
            }
            ';' if !in_string => out.push(','),
            _ => out.push(c),
        }
    }

    let rewritten = out != body;
    (normalize_formula(&out), rewritten)
}

fn is_libreoffice_only(function: &str) -> bool {
    function.starts_with("ORG.OPENOFFICE.")
        || function.starts_with("ORG.LIBREOFFICE.")
        || LIBREOFFICE_ONLY.contains(&function)
}

impl FormatAnalyzer for OpenDocumentAnalyzer {
    fn name(&self) -> &'static str {
        "open-document"
    }

    fn supports(&self, format: FileFormat) -> bool {
        format == FileFormat::Ods
    }

    fn analyze(&self, data: &Bytes, format: FileFormat, _filename: Option<&str>) -> Result<FormatReport, AppError> {
        if !self.supports(format) {
            return Err(unsupported(self.name(), format));
        }
        let mut notes = OpenDocumentNotes::default();

        notes.mimetype_valid = read_zip_text(data, "mimetype")
            .map(|m| m.trim() == ODS_MIMETYPE)
            .unwrap_or(false);

        let mut source = CalamineSource::<Ods<ByteCursor>>::open(data)?.with_normalizer(normalize_open_formula);
        let mut output = walk_sheets(&mut source, WalkOptions::default());
        notes.normalized_formulas = source.normalized_formulas();

        if !notes.mimetype_valid {
            output.errors.push(ErrorRecord::new(
                ErrorKind::StructureError,
                Severity::Medium,
                format!("Missing or unexpected mimetype entry (expected {})", ODS_MIMETYPE),
            ));
        }

        notes.libreoffice_only_functions = output
            .sheets
            .iter()
            .flat_map(|sheet| sheet.functions.keys())
            .filter(|name| is_libreoffice_only(name))
            .cloned()
            .collect::<BTreeSet<_>>();

        if !notes.libreoffice_only_functions.is_empty() {
            let names: Vec<&str> = notes.libreoffice_only_functions.iter().map(String::as_str).collect();
            let message = format!("LibreOffice-only functions will not evaluate elsewhere: {}", names.join(", "));
            notes.notes.push(message.clone());
            output
                .warnings
                .push(ErrorRecord::new(ErrorKind::CompatibilityWarning, Severity::Medium, message));
        }
        if notes.normalized_formulas > 0 {
            notes
                .notes
                .push(format!("{} formulas normalized from OpenFormula syntax", notes.normalized_formulas));
        }

        Ok(output.into_report(self.name(), metadata_for(data, format), FormatExtension::OpenDocument(notes)))
    }
}
