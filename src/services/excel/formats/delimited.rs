use super::unsupported;
use crate::error::AppError;
use crate::models::{ErrorKind, ErrorRecord, FileFormat, Severity, WorkbookMetadata};
use crate::services::excel::analyzer::{walk_sheets, FormatAnalyzer, WalkOptions};
use crate::services::excel::sources::{delimited_sheet_name, CsvSource};
use crate::services::excel::types::{FormatExtension, FormatReport};
use bytes::Bytes;

pub struct DelimitedAnalyzer;

impl FormatAnalyzer for DelimitedAnalyzer {
    fn name(&self) -> &'static str {
        "delimited"
    }

    fn supports(&self, format: FileFormat) -> bool {
        format == FileFormat::Csv
    }

    fn analyze(&self, data: &Bytes, format: FileFormat, filename: Option<&str>) -> Result<FormatReport, AppError> {
        if !self.supports(format) {
            return Err(unsupported(self.name(), format));
        }
        let mut source = CsvSource::open(data, delimited_sheet_name(filename));
        let delimiter = source.delimiter as char;
        let encoding = source.encoding;

        let mut output = walk_sheets(&mut source, WalkOptions::default());
        if encoding != "utf-8" {
            output.warnings.push(ErrorRecord::new(
                ErrorKind::CompatibilityWarning,
                Severity::Low,
                format!("File is not UTF-8; decoded as {}", encoding),
            ));
        }

        Ok(output.into_report(
            self.name(),
            WorkbookMetadata::new(format, data),
            FormatExtension::Delimited {
                delimiter,
                encoding: encoding.to_string(),
            },
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ComplexityClass, DataType};

    #[test]
    fn three_row_scenario() {
        let data = Bytes::from_static(b"a,1\nb,=A1&B1\nc,3\n");
        let report = DelimitedAnalyzer
            .analyze(&data, FileFormat::Csv, Some("scenario.csv"))
            .unwrap();

        assert_eq!(report.total_rows(), 3);
        assert_eq!(report.total_formulas(), 1);
        let sheet = &report.sheets[0];
        assert_eq!(sheet.name, "scenario");
        assert!(sheet.functions.is_empty());
        assert_eq!(sheet.complexity.get(&ComplexityClass::Simple), Some(&1));
        assert_eq!(sheet.data_types.get(&DataType::Numeric), Some(&2));
        assert!(report.possible_circular_references.is_empty());
        assert!(report.errors.is_empty());
        assert_eq!(report.metadata.sheet_count, 1);
        match report.extension {
            FormatExtension::Delimited { delimiter, ref encoding } => {
                assert_eq!(delimiter, ',');
                assert_eq!(encoding, "utf-8");
            }
            ref other => panic!("unexpected extension {:?}", other),
        }
    }

    #[test]
    fn self_reference_is_flagged_before_any_engine_call() {
        let data = Bytes::from_static(b"=A1\n");
        let report = DelimitedAnalyzer.analyze(&data, FileFormat::Csv, None).unwrap();
        assert_eq!(report.possible_circular_references, vec!["Sheet1!A1"]);
    }

    #[test]
    fn windows_1252_is_reported() {
        let data = Bytes::from_static(b"caf\xE9;1\nth\xE9;2\n");
        let report = DelimitedAnalyzer.analyze(&data, FileFormat::Csv, None).unwrap();
        assert_eq!(report.warnings.len(), 1);
    }
}
