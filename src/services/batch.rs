//! Streams formulas into an engine session in bounded batches and folds everything the
//! stream and the engine report into one [`AnalysisResult`].

use crate::clients::engine::{EngineClient, EngineSession, SessionGuard};
use crate::clients::models::{EngineAnalysis, EngineSheets};
use crate::config::MAX_BATCH_SIZE;
use crate::error::AppError;
use crate::models::{
    cell_address, parse_address, AnalysisResult, CellLocation, CellValue, CircularReference, ComplexityClass,
    DependencyEdge, ErrorKind, ErrorRecord, PerformanceMetrics, Severity,
};
use crate::services::excel::processor::RowStream;
use crate::services::excel::utils::classify_cell;
use crate::services::formula::{detect_error_literal, is_possible_circular_reference, FormulaCache};
use serde_json::Value;
use std::collections::BTreeSet;
use std::time::Instant;

pub const DEFAULT_BATCH_SIZE: usize = 100;
const COMPLEX_FORMULA_SAMPLE: usize = 50;

#[derive(Debug, Clone, PartialEq)]
pub struct BatchEntry {
    pub location: CellLocation,
    pub formula: String,
}

/// Pending formulas, flushed at capacity or at stream end.
#[derive(Debug)]
pub struct FormulaBatch {
    entries: Vec<BatchEntry>,
    capacity: usize,
}

impl FormulaBatch {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.clamp(1, MAX_BATCH_SIZE);
        Self {
            entries: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, location: CellLocation, formula: String) {
        self.entries.push(BatchEntry { location, formula });
    }

    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.capacity
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Per-sheet jagged grids anchored at A1, so engine addresses equal file addresses.
    /// Rows without formulas are `[]`; gaps inside a row are `null`.
    pub fn to_engine_sheets(&self) -> EngineSheets {
        let mut grids: Vec<(String, Vec<Vec<Value>>)> = Vec::new();
        for entry in &self.entries {
            let position = match grids.iter().position(|(name, _)| *name == entry.location.sheet) {
                Some(position) => position,
                None => {
                    grids.push((entry.location.sheet.clone(), Vec::new()));
                    grids.len() - 1
                }
            };
            let rows = &mut grids[position].1;
            let (r, c) = (entry.location.row, entry.location.column);
            if rows.len() <= r {
                rows.resize_with(r + 1, Vec::new);
            }
            if rows[r].len() <= c {
                rows[r].resize(c + 1, Value::Null);
            }
            rows[r][c] = Value::String(entry.formula.clone());
        }

        grids
            .into_iter()
            .map(|(name, rows)| (name, Value::Array(rows.into_iter().map(Value::Array).collect())))
            .collect()
    }
}

pub struct BatchCoordinator {
    client: EngineClient,
    batch_size: usize,
}

impl BatchCoordinator {
    pub fn new(client: EngineClient, batch_size: usize) -> Self {
        Self {
            client,
            batch_size: batch_size.clamp(1, MAX_BATCH_SIZE),
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Opens one session for the stream and destroys it exactly once on every path.
    /// Only a failed session create is returned as an error; everything later lands in
    /// the result.
    pub async fn run(&self, mut stream: RowStream) -> Result<AnalysisResult, AppError> {
        let start = Instant::now();
        let mut guard = SessionGuard::open(&self.client).await.map_err(|e| {
            tracing::error!("Could not open engine session: {}", e);
            e
        })?;

        let mut result = AnalysisResult::default();
        self.drive(guard.session_mut(), &mut stream, &mut result).await;
        guard.close().await;

        let stats = stream.stats();
        result.performance = PerformanceMetrics {
            chunks: stats.chunks,
            peak_chunk_bytes: stats.peak_chunk_bytes,
            ..PerformanceMetrics::from_elapsed(start.elapsed(), result.total_rows, result.total_formulas)
        };
        tracing::info!(
            "Batch analysis finished in {:?}: {} rows, {} formulas, {} batches ({} failed)",
            start.elapsed(),
            result.total_rows,
            result.total_formulas,
            result.batches_flushed + result.batches_failed,
            result.batches_failed
        );
        Ok(result)
    }

    async fn drive(&self, session: &mut EngineSession, stream: &mut RowStream, result: &mut AnalysisResult) {
        let mut cache = FormulaCache::default();
        let mut batch = FormulaBatch::new(self.batch_size);
        let mut formula_sheets = BTreeSet::new();

        while let Some(chunk) = stream.next_chunk().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    tracing::error!("Row stream failed after {} rows: {}", result.total_rows, e);
                    result.record_error(ErrorRecord::new(
                        ErrorKind::StructureError,
                        Severity::Critical,
                        format!("Reading stopped after {} rows: {}", result.total_rows, e),
                    ));
                    break;
                }
            };

            for row in chunk.rows {
                result.total_rows += 1;
                for (column, cell) in row.cells.iter().enumerate() {
                    result.total_cells += 1;
                    *result.data_types.entry(classify_cell(cell)).or_default() += 1;

                    let location = || CellLocation::new(&*row.sheet, row.index, column);

                    if let CellValue::ErrorLiteral(literal) = &cell.value {
                        let severity = detect_error_literal(literal).map_or(Severity::Medium, |c| c.severity());
                        result.record_error(
                            ErrorRecord::new(ErrorKind::FormulaError, severity, format!("Cell holds {}", literal))
                                .at(location()),
                        );
                    }

                    let Some(formula) = &cell.formula else {
                        continue;
                    };
                    result.total_formulas += 1;
                    let location = location();
                    let analysis = cache.analyze(formula);

                    *result.complexity.entry(analysis.complexity).or_default() += 1;
                    for name in &analysis.functions {
                        *result.functions.entry(name.clone()).or_default() += 1;
                    }
                    if is_possible_circular_reference(&location, formula) {
                        result.possible_circular_references.push(location.to_string());
                    }
                    if !matches!(cell.value, CellValue::ErrorLiteral(_)) {
                        if let Some(class) = detect_error_literal(formula) {
                            result.record_error(
                                ErrorRecord::new(
                                    ErrorKind::FormulaError,
                                    class.severity(),
                                    format!("Formula contains {}", class.literal()),
                                )
                                .at(&location),
                            );
                        }
                    }
                    if analysis.complexity == ComplexityClass::Complex
                        && result.complex_formulas.len() < COMPLEX_FORMULA_SAMPLE
                    {
                        result.complex_formulas.push(analysis.record(&location, formula));
                    }

                    if !formula_sheets.contains(&location.sheet) {
                        formula_sheets.insert(location.sheet.clone());
                    }
                    batch.push(location, formula.clone());
                    if batch.is_full() {
                        self.flush(session, &mut batch, result).await;
                    }
                }
            }
        }

        // Partial batch at stream end.
        self.flush(session, &mut batch, result).await;

        if result.batches_flushed == 0 {
            tracing::debug!("No batch reached the engine; skipping analyze");
            return;
        }
        match self.client.analyze(session).await {
            Ok(engine) => merge_engine_analysis(result, engine, &formula_sheets),
            Err(e) => {
                tracing::warn!("Engine analysis failed, keeping local results: {}", e);
                result.record_error(ErrorRecord::new(
                    ErrorKind::CompatibilityWarning,
                    Severity::High,
                    format!("Engine analysis failed; dependency and cycle data unavailable: {}", e),
                ));
            }
        }
    }

    async fn flush(&self, session: &mut EngineSession, batch: &mut FormulaBatch, result: &mut AnalysisResult) {
        if batch.is_empty() {
            return;
        }
        let size = batch.len();
        let payload = batch.to_engine_sheets();
        batch.clear();

        let number = result.batches_flushed + result.batches_failed + 1;
        match self.client.load_data(session, &payload).await {
            Ok(()) => {
                result.batches_flushed += 1;
                tracing::debug!("Batch {} delivered ({} formulas)", number, size);
            }
            Err(e) => {
                tracing::warn!("Batch {} ({} formulas) was not delivered: {}", number, size, e);
                result.batches_failed += 1;
                result.undelivered_formulas += size;
                result.record_error(ErrorRecord::new(
                    ErrorKind::CompatibilityWarning,
                    Severity::Medium,
                    format!("Batch {} of {} formulas failed to load: {}", number, size, e),
                ));
            }
        }
    }
}

/// Engine edges and cycles are authoritative; local histograms cover every batch and stay.
fn merge_engine_analysis(result: &mut AnalysisResult, engine: EngineAnalysis, sheets: &BTreeSet<String>) {
    // Bare addresses are only unambiguous when every formula came from one sheet.
    let default_sheet = match sheets.len() {
        1 => sheets.iter().next().map(String::as_str),
        _ => None,
    };
    result.engine_analyzed = true;
    result.dependencies = engine
        .dependencies
        .into_iter()
        .map(|edge| DependencyEdge {
            dependent: canonical_address(&edge.dependent, default_sheet),
            precedent: canonical_address(&edge.precedent, default_sheet),
        })
        .collect();
    result.circular_references = engine
        .circular_references
        .into_iter()
        .map(|cycle| CircularReference {
            cells: cycle.cells.iter().map(|cell| canonical_address(cell, default_sheet)).collect(),
        })
        .collect();
    result.sheet_formula_counts = engine.formulas_by_sheet;
    for issue in engine.errors {
        let mut record = ErrorRecord::new(ErrorKind::FormulaError, Severity::Medium, issue.message);
        record.location = issue.location;
        result.record_error(record);
    }
}

/// Single-cell references come back as `Sheet!A1`; ranges and names pass through.
fn canonical_address(address: &str, default_sheet: Option<&str>) -> String {
    match parse_address(address) {
        Some((Some(sheet), row, column)) => CellLocation::new(sheet, row, column).to_string(),
        Some((None, row, column)) => match default_sheet {
            Some(sheet) => CellLocation::new(sheet, row, column).to_string(),
            None => cell_address(row, column),
        },
        None => address.to_string(),
    }
}
