use super::{finish_macro_risk, metadata_for, require_sheets, unsupported};
use crate::error::AppError;
use crate::models::FileFormat;
use crate::services::excel::analyzer::{walk_sheets, FormatAnalyzer, WalkOptions};
use crate::services::excel::sources::{ByteCursor, CalamineSource};
use crate::services::excel::types::{FormatExtension, FormatReport};
use crate::services::excel::utils::assess_vba;
use bytes::Bytes;
use calamine::Xlsx;

/// `.xlsx` and `.xlsm` workbooks.
pub struct ModernXmlAnalyzer;

impl FormatAnalyzer for ModernXmlAnalyzer {
    fn name(&self) -> &'static str {
        "modern-xml"
    }

    fn supports(&self, format: FileFormat) -> bool {
        matches!(format, FileFormat::Xlsx | FileFormat::Xlsm)
    }

    fn analyze(&self, data: &Bytes, format: FileFormat, _filename: Option<&str>) -> Result<FormatReport, AppError> {
        if !self.supports(format) {
            return Err(unsupported(self.name(), format));
        }
        let mut source = CalamineSource::<Xlsx<ByteCursor>>::open(data)?;

        let vba = format
            .is_macro_enabled()
            .then(|| assess_vba(source.workbook_mut()));

        let mut output = walk_sheets(
            &mut source,
            WalkOptions {
                scan_risky_calls: format.is_macro_enabled(),
                ..Default::default()
            },
        );
        require_sheets(format, &mut output);

        let macro_risk = vba.map(|(risk, problem)| finish_macro_risk(risk, problem, &mut output));
        Ok(output.into_report(
            self.name(),
            metadata_for(data, format),
            FormatExtension::ModernXml { macro_risk },
        ))
    }
}
