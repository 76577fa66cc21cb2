use super::formats;
use super::sources::{SheetGrid, SheetSource};
use super::types::*;
use super::utils::*;
use crate::error::AppError;
use crate::models::{
    CellLocation, CellValue, ComplexityClass, DataType, ErrorKind, ErrorRecord, FileFormat, Severity,
    WorkbookMetadata,
};
use crate::services::formula::{analyze_formula, detect_error_literal, is_possible_circular_reference, risky_calls};
use bytes::Bytes;
use rayon::prelude::*;
use std::collections::BTreeMap;

/// One implementation per container family.
pub trait FormatAnalyzer: Send + Sync {
    fn name(&self) -> &'static str;

    fn supports(&self, format: FileFormat) -> bool;

    /// `filename` is only used to name the sheet of delimited files.
    fn analyze(&self, data: &Bytes, format: FileFormat, filename: Option<&str>) -> Result<FormatReport, AppError>;
}

pub fn analyzer_for(format: FileFormat) -> Box<dyn FormatAnalyzer> {
    match format {
        FileFormat::Xlsx | FileFormat::Xlsm => Box::new(formats::ModernXmlAnalyzer),
        FileFormat::Xltx => Box::new(formats::TemplateAnalyzer),
        FileFormat::Xltm => Box::new(formats::MacroTemplateAnalyzer),
        FileFormat::Xls | FileFormat::Xlt => Box::new(formats::LegacyBinaryAnalyzer),
        FileFormat::Xlsb => Box::new(formats::BinaryZipAnalyzer),
        FileFormat::Ods => Box::new(formats::OpenDocumentAnalyzer),
        FileFormat::Csv => Box::new(formats::DelimitedAnalyzer),
    }
}

#[derive(Debug, Clone, Copy)]
pub struct WalkOptions {
    pub scan_risky_calls: bool,
    pub collect_placeholders: bool,
    /// Kind used when a sheet cannot be read at all.
    pub unreadable_sheet_kind: ErrorKind,
}

impl Default for WalkOptions {
    fn default() -> Self {
        Self {
            scan_risky_calls: false,
            collect_placeholders: false,
            unreadable_sheet_kind: ErrorKind::StructureError,
        }
    }
}

#[derive(Debug, Default)]
pub struct WalkOutput {
    pub sheets: Vec<SheetReport>,
    pub errors: Vec<ErrorRecord>,
    pub warnings: Vec<ErrorRecord>,
    pub possible_circular_references: Vec<String>,
    pub placeholders: Vec<Placeholder>,
    pub risk_findings: Vec<RiskFinding>,
}

impl WalkOutput {
    fn push(&mut self, record: ErrorRecord) {
        if record.is_warning() {
            self.warnings.push(record);
        } else {
            self.errors.push(record);
        }
    }

    pub fn non_empty_cells(&self) -> usize {
        self.sheets.iter().map(|s| s.non_empty_cells).sum()
    }

    pub fn declared_cells(&self) -> usize {
        self.sheets.iter().map(|s| s.declared_cells()).sum()
    }

    /// Assembles the report; every analyzer ends here.
    pub fn into_report(
        self,
        analyzer: &'static str,
        mut metadata: WorkbookMetadata,
        extension: FormatExtension,
    ) -> FormatReport {
        metadata.sheet_count = self.sheets.len();
        FormatReport {
            analyzer,
            metadata,
            sheets: self.sheets,
            errors: self.errors,
            warnings: self.warnings,
            possible_circular_references: self.possible_circular_references,
            extension,
        }
    }
}

/// Per-row partial result, merged with rayon.
#[derive(Default)]
struct SheetAccumulator {
    non_empty: usize,
    formulas: usize,
    data_types: BTreeMap<DataType, usize>,
    complexity: BTreeMap<ComplexityClass, usize>,
    functions: BTreeMap<String, usize>,
    records: Vec<ErrorRecord>,
    possible_circular: Vec<String>,
    placeholders: Vec<Placeholder>,
    risk_findings: Vec<RiskFinding>,
}

impl SheetAccumulator {
    fn merge(mut self, other: SheetAccumulator) -> SheetAccumulator {
        self.non_empty += other.non_empty;
        self.formulas += other.formulas;
        for (k, v) in other.data_types {
            *self.data_types.entry(k).or_default() += v;
        }
        for (k, v) in other.complexity {
            *self.complexity.entry(k).or_default() += v;
        }
        for (k, v) in other.functions {
            *self.functions.entry(k).or_default() += v;
        }
        self.records.extend(other.records);
        self.possible_circular.extend(other.possible_circular);
        self.placeholders.extend(other.placeholders);
        self.risk_findings.extend(other.risk_findings);
        self
    }
}

fn walk_row(
    sheet: &str,
    row_idx: usize,
    row: &[crate::models::Cell],
    width: usize,
    options: WalkOptions,
    mut acc: SheetAccumulator,
) -> SheetAccumulator {
    for column in 0..width {
        let cell = match row.get(column) {
            Some(cell) => cell,
            None => {
                *acc.data_types.entry(DataType::Empty).or_default() += 1;
                continue;
            }
        };
        let data_type = classify_cell(cell);
        *acc.data_types.entry(data_type).or_default() += 1;
        if data_type == DataType::Empty {
            continue;
        }
        acc.non_empty += 1;
        let location = CellLocation::new(sheet, row_idx, column);

        if let CellValue::ErrorLiteral(literal) = &cell.value {
            let class = detect_error_literal(literal);
            let severity = class.map_or(Severity::Medium, |c| c.severity());
            let description = class.map_or("unknown error", |c| c.description());
            acc.records.push(
                ErrorRecord::new(ErrorKind::FormulaError, severity, format!("{} ({})", literal, description))
                    .at(&location),
            );
        }

        if let Some(formula) = &cell.formula {
            acc.formulas += 1;
            let analysis = analyze_formula(formula);
            *acc.complexity.entry(analysis.complexity).or_default() += 1;
            for name in &analysis.functions {
                *acc.functions.entry(name.clone()).or_default() += 1;
            }

            if !matches!(cell.value, CellValue::ErrorLiteral(_)) {
                if let Some(class) = detect_error_literal(formula) {
                    acc.records.push(
                        ErrorRecord::new(
                            ErrorKind::FormulaError,
                            class.severity(),
                            format!("Formula contains {} ({})", class.literal(), class.description()),
                        )
                        .at(&location),
                    );
                }
            }

            if is_possible_circular_reference(&location, formula) {
                acc.possible_circular.push(location.to_string());
            }

            if options.scan_risky_calls {
                for indicator in risky_calls(formula, &analysis) {
                    acc.records.push(
                        ErrorRecord::new(
                            ErrorKind::SecurityWarning,
                            Severity::High,
                            format!("Formula calls risk-indicating function {}", indicator),
                        )
                        .at(&location),
                    );
                    acc.risk_findings.push(RiskFinding {
                        location: location.to_string(),
                        indicator,
                    });
                }
            }
        } else if options.collect_placeholders && data_type == DataType::Placeholder {
            acc.placeholders.extend(collect_placeholders(&location, cell));
        }
    }
    acc
}

pub fn summarize_sheet(name: &str, grid: &SheetGrid, options: WalkOptions) -> (SheetReport, SheetFindings) {
    let width = grid.iter().map(|r| r.len()).max().unwrap_or(0);

    let acc = grid
        .par_iter()
        .enumerate()
        .fold(SheetAccumulator::default, |acc, (row_idx, row)| {
            walk_row(name, row_idx, row, width, options, acc)
        })
        .reduce(SheetAccumulator::default, SheetAccumulator::merge);

    let sample_data = grid
        .iter()
        .take(SAMPLE_SIZE)
        .map(|row| {
            row.iter()
                .map(|cell| cell.formula.clone().unwrap_or_else(|| cell.value.to_string()))
                .collect()
        })
        .collect();

    let report = SheetReport {
        name: name.to_string(),
        row_count: grid.len(),
        column_count: width,
        non_empty_cells: acc.non_empty,
        formula_count: acc.formulas,
        data_types: acc.data_types,
        complexity: acc.complexity,
        functions: acc.functions,
        sample_data,
    };

    let view = SheetFindings {
        records: acc.records,
        possible_circular: acc.possible_circular,
        placeholders: acc.placeholders,
        risk_findings: acc.risk_findings,
    };
    (report, view)
}

/// Per-cell findings of one sheet.
pub struct SheetFindings {
    pub records: Vec<ErrorRecord>,
    pub possible_circular: Vec<String>,
    pub placeholders: Vec<Placeholder>,
    pub risk_findings: Vec<RiskFinding>,
}

/// The single cell walk shared by every analyzer.
pub fn walk_sheets(source: &mut dyn SheetSource, options: WalkOptions) -> WalkOutput {
    let mut output = WalkOutput::default();

    for name in source.sheet_names() {
        let grid = match source.read_sheet(&name) {
            Ok(grid) => grid,
            Err(e) => {
                tracing::warn!("Skipping unreadable sheet {}: {}", name, e);
                output.push(ErrorRecord::new(
                    options.unreadable_sheet_kind,
                    Severity::High,
                    format!("Sheet '{}' could not be read: {}", name, e),
                ));
                continue;
            }
        };

        let (report, view) = summarize_sheet(&name, &grid, options);
        tracing::debug!(
            "Sheet {}: {} rows x {} columns, {} formulas",
            name,
            report.row_count,
            report.column_count,
            report.formula_count
        );

        if report.declared_cells() > 0 && report.empty_ratio() > SPARSE_RATIO {
            output.push(ErrorRecord::new(
                ErrorKind::CompatibilityWarning,
                Severity::Low,
                format!(
                    "Sheet '{}' is sparse: {:.1}% of {} declared cells are empty",
                    name,
                    report.empty_ratio() * 100.0,
                    report.declared_cells()
                ),
            ));
        }
        if report.row_count > LARGE_SHEET_ROWS {
            output.push(ErrorRecord::new(
                ErrorKind::CompatibilityWarning,
                Severity::Medium,
                format!(
                    "Sheet '{}' has {} rows; streaming analysis is recommended",
                    name, report.row_count
                ),
            ));
        }

        for record in view.records {
            output.push(record);
        }
        output.possible_circular_references.extend(view.possible_circular);
        output.placeholders.extend(view.placeholders);
        output.risk_findings.extend(view.risk_findings);
        output.sheets.push(report);
    }

    for note in source.take_notes() {
        output.push(ErrorRecord::new(ErrorKind::CompatibilityWarning, Severity::Low, note));
    }

    output
}

/// Raised for template and macro formats whose workbook has no sheets.
pub fn empty_workbook_error(format: FileFormat) -> ErrorRecord {
    ErrorRecord::new(
        ErrorKind::StructureError,
        Severity::High,
        format!("The .{} workbook contains no sheets", format),
    )
}

pub struct ExcelAnalyzer;

impl ExcelAnalyzer {
    /// Runs the family analyzer on a blocking worker.
    pub async fn analyze_from_bytes(
        &self,
        file_data: Bytes,
        format: FileFormat,
        filename: Option<String>,
    ) -> Result<FormatReport, AppError> {
        let start = std::time::Instant::now();
        tracing::info!("Starting .{} analysis ({} bytes)", format, file_data.len());

        let report = tokio::task::spawn_blocking(move || {
            analyzer_for(format).analyze(&file_data, format, filename.as_deref())
        })
        .await
        .map_err(|e| AppError::Internal(format!("Analyzer task failed: {}", e)))??;

        tracing::info!(
            "{} analyzer finished in {:?}: {} sheets, {} formulas, {} errors, {} warnings",
            report.analyzer,
            start.elapsed(),
            report.sheets.len(),
            report.total_formulas(),
            report.errors.len(),
            report.warnings.len()
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Cell;

    struct GridSource(Vec<(String, SheetGrid)>);

    impl SheetSource for GridSource {
        fn sheet_names(&self) -> Vec<String> {
            self.0.iter().map(|(n, _)| n.clone()).collect()
        }

        fn read_sheet(&mut self, name: &str) -> Result<SheetGrid, AppError> {
            self.0
                .iter()
                .find(|(n, _)| n == name)
                .map(|(_, g)| g.clone())
                .ok_or_else(|| AppError::FileProcessingError("missing".into()))
        }
    }

    fn text(s: &str) -> Cell {
        Cell::value(CellValue::Text(s.into()))
    }

    fn num(n: f64) -> Cell {
        Cell::value(CellValue::Number(n))
    }

    #[test]
    fn walk_counts_types_formulas_and_errors() {
        let grid = vec![
            vec![text("a"), num(1.0)],
            vec![text("b"), Cell::formula("=A1&B1", CellValue::Empty)],
            vec![text("c"), Cell::value(CellValue::ErrorLiteral("#REF!".into()))],
        ];
        let mut source = GridSource(vec![("Sheet1".into(), grid)]);
        let output = walk_sheets(&mut source, WalkOptions::default());

        let sheet = &output.sheets[0];
        assert_eq!(sheet.row_count, 3);
        assert_eq!(sheet.formula_count, 1);
        assert_eq!(sheet.data_types[&DataType::Text], 3);
        assert_eq!(sheet.data_types[&DataType::Formula], 1);
        assert_eq!(sheet.data_types[&DataType::Error], 1);
        assert_eq!(sheet.complexity[&ComplexityClass::Simple], 1);
        assert!(sheet.functions.is_empty());
        assert_eq!(output.errors.len(), 1);
        assert_eq!(output.errors[0].location.as_deref(), Some("Sheet1!B3"));
        assert_eq!(output.errors[0].severity, Severity::High);
        assert!(output.possible_circular_references.is_empty());
    }

    #[test]
    fn sparse_sheets_warn_once() {
        let mut grid = vec![vec![Cell::default(); 10]; 10];
        grid[0][0] = num(1.0);
        let mut source = GridSource(vec![("Sparse".into(), grid)]);
        let output = walk_sheets(&mut source, WalkOptions::default());
        let sparse: Vec<_> = output.warnings.iter().filter(|w| w.message.contains("sparse")).collect();
        assert_eq!(sparse.len(), 1);
    }

    #[test]
    fn large_sheets_get_a_performance_warning() {
        let grid = vec![vec![num(1.0)]; LARGE_SHEET_ROWS + 1];
        let mut source = GridSource(vec![("Big".into(), grid)]);
        let output = walk_sheets(&mut source, WalkOptions::default());
        assert!(output.warnings.iter().any(|w| w.message.contains("streaming analysis")));
    }

    #[test]
    fn risky_calls_only_when_enabled() {
        let grid = vec![vec![Cell::formula("=EXEC(\"calc\")", CellValue::Empty)]];
        let mut plain = GridSource(vec![("S".into(), grid.clone())]);
        assert!(walk_sheets(&mut plain, WalkOptions::default()).warnings.is_empty());

        let mut binary = GridSource(vec![("S".into(), grid)]);
        let output = walk_sheets(
            &mut binary,
            WalkOptions {
                scan_risky_calls: true,
                ..Default::default()
            },
        );
        assert_eq!(output.warnings.len(), 1);
        assert_eq!(output.warnings[0].kind, ErrorKind::SecurityWarning);
        assert_eq!(output.warnings[0].severity, Severity::High);
        assert_eq!(output.risk_findings[0].indicator, "EXEC");
    }

    #[test]
    fn self_referencing_formula_is_flagged_locally() {
        let grid = vec![vec![Cell::formula("=A1", CellValue::Number(0.0))]];
        let mut source = GridSource(vec![("Sheet1".into(), grid)]);
        let output = walk_sheets(&mut source, WalkOptions::default());
        assert_eq!(output.possible_circular_references, vec!["Sheet1!A1"]);
    }

    #[test]
    fn every_formula_cell_keeps_the_marker() {
        let grid = vec![vec![
            Cell::formula("=SUM(B1:B2)", CellValue::Empty),
            Cell::formula("=B1*2", CellValue::Empty),
        ]];
        for cell in &grid[0] {
            assert_eq!(classify_cell(cell), DataType::Formula);
            assert!(cell.formula.as_deref().unwrap().starts_with('='));
        }
    }
}
