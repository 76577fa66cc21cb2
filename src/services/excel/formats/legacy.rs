use super::{binary_metrics, finish_macro_risk, metadata_for, require_sheets, unsupported};
use crate::error::AppError;
use crate::models::{ErrorKind, FileFormat};
use crate::services::excel::analyzer::{walk_sheets, FormatAnalyzer, WalkOptions};
use crate::services::excel::sources::{ByteCursor, CalamineSource};
use crate::services::excel::types::{FormatExtension, FormatReport, TemplateInventory};
use crate::services::excel::utils::assess_vba;
use bytes::Bytes;
use calamine::Xls;

/// Compound-document `.xls` workbooks and `.xlt` templates.
pub struct LegacyBinaryAnalyzer;

impl FormatAnalyzer for LegacyBinaryAnalyzer {
    fn name(&self) -> &'static str {
        "legacy-binary"
    }

    fn supports(&self, format: FileFormat) -> bool {
        matches!(format, FileFormat::Xls | FileFormat::Xlt)
    }

    fn analyze(&self, data: &Bytes, format: FileFormat, _filename: Option<&str>) -> Result<FormatReport, AppError> {
        if !self.supports(format) {
            return Err(unsupported(self.name(), format));
        }
        let mut source = CalamineSource::<Xls<ByteCursor>>::open(data)?;
        let (risk, problem) = assess_vba(source.workbook_mut());

        let mut output = walk_sheets(
            &mut source,
            WalkOptions {
                scan_risky_calls: true,
                collect_placeholders: format.is_template(),
                unreadable_sheet_kind: ErrorKind::BinaryCorruption,
            },
        );

        require_sheets(format, &mut output);
        let template = format.is_template().then(|| {
            TemplateInventory::from_placeholders(std::mem::take(&mut output.placeholders))
        });

        let binary = binary_metrics(data, &output, None);
        let macro_risk = finish_macro_risk(risk, problem, &mut output);
        Ok(output.into_report(
            self.name(),
            metadata_for(data, format),
            FormatExtension::LegacyBinary {
                binary,
                macro_risk,
                template,
            },
        ))
    }
}
