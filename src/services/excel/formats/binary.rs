use super::{binary_metrics, finish_macro_risk, metadata_for, require_sheets, unsupported};
use crate::error::AppError;
use crate::models::{ErrorKind, ErrorRecord, FileFormat, Severity};
use crate::services::excel::analyzer::{walk_sheets, FormatAnalyzer, WalkOptions};
use crate::services::excel::sources::{ByteCursor, CalamineSource};
use crate::services::excel::types::{FormatExtension, FormatReport};
use crate::services::excel::utils::{assess_vba, inspect_zip};
use bytes::Bytes;
use calamine::Xlsb;

/// `.xlsb`: binary records inside a zip package.
pub struct BinaryZipAnalyzer;

impl FormatAnalyzer for BinaryZipAnalyzer {
    fn name(&self) -> &'static str {
        "binary-zip"
    }

    fn supports(&self, format: FileFormat) -> bool {
        format == FileFormat::Xlsb
    }

    fn analyze(&self, data: &Bytes, format: FileFormat, _filename: Option<&str>) -> Result<FormatReport, AppError> {
        if !self.supports(format) {
            return Err(unsupported(self.name(), format));
        }
        let zip = inspect_zip(data)?;
        let mut source = CalamineSource::<Xlsb<ByteCursor>>::open(data)?;
        let (risk, problem) = assess_vba(source.workbook_mut());

        let mut output = walk_sheets(
            &mut source,
            WalkOptions {
                scan_risky_calls: true,
                collect_placeholders: false,
                unreadable_sheet_kind: ErrorKind::BinaryCorruption,
            },
        );
        require_sheets(format, &mut output);

        if !zip.contains("xl/workbook.bin") {
            output.errors.push(ErrorRecord::new(
                ErrorKind::BinaryCorruption,
                Severity::High,
                "Package has no xl/workbook.bin part",
            ));
        }

        let binary = binary_metrics(data, &output, Some(&zip));
        let macro_risk = finish_macro_risk(risk, problem, &mut output);
        Ok(output.into_report(
            self.name(),
            metadata_for(data, format),
            FormatExtension::BinaryZip { binary, macro_risk },
        ))
    }
}
