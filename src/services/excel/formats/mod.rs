//! Family analyzers. Each one opens its container through a [`SheetSource`], runs the
//! shared cell walk and adds its own extension report.
//!
//! [`SheetSource`]: super::sources::SheetSource

mod binary;
mod delimited;
mod legacy;
mod modern;
pub mod open_document;
mod template;

pub use binary::BinaryZipAnalyzer;
pub use delimited::DelimitedAnalyzer;
pub use legacy::LegacyBinaryAnalyzer;
pub use modern::ModernXmlAnalyzer;
pub use open_document::OpenDocumentAnalyzer;
pub use template::{MacroTemplateAnalyzer, TemplateAnalyzer};

use super::analyzer::{empty_workbook_error, WalkOutput};
use super::types::{BinaryMetrics, MacroRiskAssessment, RiskLevel};
use super::utils::{document_timestamps, ZipSummary};
use crate::error::AppError;
use crate::models::{ErrorKind, ErrorRecord, FileFormat, FormatFamily, Severity, WorkbookMetadata};
use bytes::Bytes;

/// Base metadata; zip packages also carry document-property timestamps.
pub(crate) fn metadata_for(data: &Bytes, format: FileFormat) -> WorkbookMetadata {
    let mut metadata = WorkbookMetadata::new(format, data);
    if matches!(format.family(), FormatFamily::Modern | FormatFamily::OpenDocument | FormatFamily::Binary) {
        let (created, modified) = document_timestamps(data);
        metadata.created = created;
        metadata.modified = modified;
    }
    metadata
}

pub(crate) fn unsupported(analyzer: &str, format: FileFormat) -> AppError {
    AppError::FileProcessingError(format!("{} analyzer cannot read .{} files", analyzer, format))
}

/// Template and macro-enabled workbooks must carry at least one sheet.
pub(crate) fn require_sheets(format: FileFormat, output: &mut WalkOutput) {
    if output.sheets.is_empty() && (format.is_template() || format.is_macro_enabled()) {
        output.errors.push(empty_workbook_error(format));
    }
}

/// Folds formula findings from the walk into the VBA assessment and reports the result.
pub(crate) fn finish_macro_risk(
    mut risk: MacroRiskAssessment,
    vba_problem: Option<String>,
    output: &mut WalkOutput,
) -> MacroRiskAssessment {
    risk.formula_findings = std::mem::take(&mut output.risk_findings);
    risk.recompute_level();

    if let Some(problem) = vba_problem {
        output.warnings.push(ErrorRecord::new(ErrorKind::SecurityWarning, Severity::Medium, problem));
    }

    if !risk.auto_exec_entry_points.is_empty() || !risk.vba_findings.is_empty() {
        let severity = if risk.risk_level == RiskLevel::High {
            Severity::High
        } else {
            Severity::Medium
        };
        let calls: Vec<&str> = risk.vba_findings.iter().map(|f| f.indicator.as_str()).collect();
        output.warnings.push(ErrorRecord::new(
            ErrorKind::SecurityWarning,
            severity,
            format!(
                "VBA project has auto-execute entry points [{}] and risky calls [{}]",
                risk.auto_exec_entry_points.join(", "),
                calls.join(", ")
            ),
        ));
    }

    tracing::debug!(
        "Macro risk {:?}: {} modules, {} formula findings",
        risk.risk_level,
        risk.modules.len(),
        risk.formula_findings.len()
    );
    risk
}

pub(crate) fn binary_metrics(data: &Bytes, output: &WalkOutput, zip: Option<&ZipSummary>) -> BinaryMetrics {
    let declared = output.declared_cells();
    let non_empty = output.non_empty_cells();
    let container_bytes = data.len() as u64;

    let mut metrics = BinaryMetrics {
        container_bytes,
        cell_density: if declared == 0 { 0.0 } else { non_empty as f64 / declared as f64 },
        bytes_per_cell: (non_empty > 0).then(|| container_bytes as f64 / non_empty as f64),
        ..Default::default()
    };

    if let Some(zip) = zip {
        metrics.part_count = Some(zip.entries.len());
        metrics.compressed_bytes = Some(zip.compressed_bytes);
        metrics.uncompressed_bytes = Some(zip.uncompressed_bytes);
        metrics.compression_ratio =
            (zip.uncompressed_bytes > 0).then(|| zip.compressed_bytes as f64 / zip.uncompressed_bytes as f64);
    }
    metrics
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::excel::types::{RiskFinding, SheetReport};

    #[test]
    fn formula_findings_raise_macro_risk() {
        let mut output = WalkOutput::default();
        output.risk_findings.push(RiskFinding {
            location: "Sheet1!A1".into(),
            indicator: "EXEC".into(),
        });
        let risk = finish_macro_risk(MacroRiskAssessment::none(), None, &mut output);
        assert_eq!(risk.risk_level, RiskLevel::High);
        assert!(output.risk_findings.is_empty());
    }

    #[test]
    fn unreadable_vba_project_is_a_warning() {
        let mut output = WalkOutput::default();
        let mut risk = MacroRiskAssessment::none();
        risk.has_vba_project = true;
        let risk = finish_macro_risk(risk, Some("VBA project could not be read".into()), &mut output);
        assert_eq!(risk.risk_level, RiskLevel::Low);
        assert_eq!(output.warnings.len(), 1);
    }

    #[test]
    fn macro_and_template_formats_need_a_sheet() {
        for format in [FileFormat::Xlsm, FileFormat::Xlsb, FileFormat::Xls, FileFormat::Xltx, FileFormat::Xltm] {
            let mut output = WalkOutput::default();
            require_sheets(format, &mut output);
            assert_eq!(output.errors.len(), 1, "{:?}", format);
            assert_eq!(output.errors[0].kind, ErrorKind::StructureError);
        }
    }

    #[test]
    fn plain_formats_may_be_empty() {
        for format in [FileFormat::Xlsx, FileFormat::Csv, FileFormat::Ods] {
            let mut output = WalkOutput::default();
            require_sheets(format, &mut output);
            assert!(output.errors.is_empty(), "{:?}", format);
        }
        let mut output = WalkOutput::default();
        output.sheets.push(SheetReport::default());
        require_sheets(FileFormat::Xlsm, &mut output);
        assert!(output.errors.is_empty());
    }

    #[test]
    fn density_and_compression() {
        let mut output = WalkOutput::default();
        output.sheets.push(SheetReport {
            row_count: 4,
            column_count: 5,
            non_empty_cells: 10,
            ..Default::default()
        });
        let zip = ZipSummary {
            entries: vec!["a".into(), "b".into()],
            compressed_bytes: 50,
            uncompressed_bytes: 200,
        };
        let data = Bytes::from(vec![0u8; 1000]);
        let metrics = binary_metrics(&data, &output, Some(&zip));
        assert!((metrics.cell_density - 0.5).abs() < 1e-9);
        assert_eq!(metrics.bytes_per_cell, Some(100.0));
        assert_eq!(metrics.compression_ratio, Some(0.25));
        assert_eq!(metrics.part_count, Some(2));
    }
}
