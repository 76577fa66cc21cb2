use super::{finish_macro_risk, metadata_for, require_sheets, unsupported};
use crate::error::AppError;
use crate::models::FileFormat;
use crate::services::excel::analyzer::{walk_sheets, FormatAnalyzer, WalkOptions, WalkOutput};
use crate::services::excel::sources::{ByteCursor, CalamineSource};
use crate::services::excel::types::{FormatExtension, FormatReport, TemplateInventory};
use crate::services::excel::utils::assess_vba;
use bytes::Bytes;
use calamine::Xlsx;

/// `.xltx` templates: cell walk plus placeholder inventory.
pub struct TemplateAnalyzer;

/// `.xltm` templates: placeholder inventory and macro risk.
pub struct MacroTemplateAnalyzer;

fn template_walk(source: &mut CalamineSource<Xlsx<ByteCursor>>, format: FileFormat) -> (WalkOutput, TemplateInventory) {
    let mut output = walk_sheets(
        source,
        WalkOptions {
            scan_risky_calls: format.is_macro_enabled(),
            collect_placeholders: true,
            ..Default::default()
        },
    );
    require_sheets(format, &mut output);
    let inventory = TemplateInventory::from_placeholders(std::mem::take(&mut output.placeholders));
    tracing::debug!(
        "Template inventory: {} placeholders, {} unique",
        inventory.placeholders.len(),
        inventory.unique_names.len()
    );
    (output, inventory)
}

impl FormatAnalyzer for TemplateAnalyzer {
    fn name(&self) -> &'static str {
        "template"
    }

    fn supports(&self, format: FileFormat) -> bool {
        format == FileFormat::Xltx
    }

    fn analyze(&self, data: &Bytes, format: FileFormat, _filename: Option<&str>) -> Result<FormatReport, AppError> {
        if !self.supports(format) {
            return Err(unsupported(self.name(), format));
        }
        let mut source = CalamineSource::<Xlsx<ByteCursor>>::open(data)?;
        let (output, inventory) = template_walk(&mut source, format);
        Ok(output.into_report(self.name(), metadata_for(data, format), FormatExtension::Template(inventory)))
    }
}

impl FormatAnalyzer for MacroTemplateAnalyzer {
    fn name(&self) -> &'static str {
        "macro-template"
    }

    fn supports(&self, format: FileFormat) -> bool {
        format == FileFormat::Xltm
    }

    fn analyze(&self, data: &Bytes, format: FileFormat, _filename: Option<&str>) -> Result<FormatReport, AppError> {
        if !self.supports(format) {
            return Err(unsupported(self.name(), format));
        }
        let mut source = CalamineSource::<Xlsx<ByteCursor>>::open(data)?;
        let (risk, problem) = assess_vba(source.workbook_mut());
        let (mut output, template) = template_walk(&mut source, format);
        let macro_risk = finish_macro_risk(risk, problem, &mut output);
        Ok(output.into_report(
            self.name(),
            metadata_for(data, format),
            FormatExtension::MacroTemplate { template, macro_risk },
        ))
    }
}
