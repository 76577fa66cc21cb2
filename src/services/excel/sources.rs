//! Per-format cell readers. Every analyzer walks sheets through [`SheetSource`], so the
//! classification loop exists once no matter which container the cells came from.

use super::utils::{data_to_value, decode_text, field_to_cell, sniff_delimiter};
use crate::error::AppError;
use crate::models::{Cell, FileFormat, FormatFamily, Sheet, Workbook, WorkbookMetadata};
use crate::services::formula::normalize_formula;
use bytes::Bytes;
use calamine::{open_workbook_from_rs, Ods, Reader, Xls, Xlsb, Xlsx};
use std::fmt::Display;
use std::io::Cursor;

pub type ByteCursor = Cursor<Bytes>;

/// A dense sheet grid anchored at A1.
pub type SheetGrid = Vec<Vec<Cell>>;

pub trait SheetSource {
    fn sheet_names(&self) -> Vec<String>;

    fn read_sheet(&mut self, name: &str) -> Result<SheetGrid, AppError>;

    /// Problems that did not stop a sheet from being read (e.g. formulas unavailable).
    fn take_notes(&mut self) -> Vec<String> {
        Vec::new()
    }

    /// Formulas rewritten from a foreign syntax on the way in.
    fn normalized_formulas(&self) -> usize {
        0
    }
}

/// Any calamine reader. `normalize` turns the reader's raw formula text into `=...` A1
/// syntax and reports whether it had to rewrite anything.
pub struct CalamineSource<R> {
    workbook: R,
    normalize: fn(&str) -> (String, bool),
    normalized: usize,
    notes: Vec<String>,
}

fn passthrough(raw: &str) -> (String, bool) {
    (normalize_formula(raw), false)
}

impl<R> CalamineSource<R>
where
    R: Reader<ByteCursor>,
    R::Error: Display,
{
    pub fn open(data: &Bytes) -> Result<Self, AppError> {
        let workbook: R = open_workbook_from_rs(Cursor::new(data.clone())).map_err(|e| {
            tracing::error!("Failed to open spreadsheet container: {}", e);
            AppError::FileProcessingError(format!("Failed to open spreadsheet: {}", e))
        })?;
        Ok(Self {
            workbook,
            normalize: passthrough,
            normalized: 0,
            notes: Vec::new(),
        })
    }

    pub fn with_normalizer(mut self, normalize: fn(&str) -> (String, bool)) -> Self {
        self.normalize = normalize;
        self
    }

    pub fn workbook_mut(&mut self) -> &mut R {
        &mut self.workbook
    }
}

impl<R> SheetSource for CalamineSource<R>
where
    R: Reader<ByteCursor>,
    R::Error: Display,
{
    fn sheet_names(&self) -> Vec<String> {
        self.workbook.sheet_names().to_vec()
    }

    fn read_sheet(&mut self, name: &str) -> Result<SheetGrid, AppError> {
        let values = self
            .workbook
            .worksheet_range(name)
            .map_err(|e| AppError::FileProcessingError(format!("Failed to read sheet '{}': {}", name, e)))?;

        let formulas = match self.workbook.worksheet_formula(name) {
            Ok(range) => Some(range),
            Err(e) => {
                self.notes
                    .push(format!("Formulas unavailable for sheet '{}': {}", name, e));
                None
            }
        };

        let value_end = values.end().map(|(r, c)| (r as usize + 1, c as usize + 1));
        let formula_end = formulas
            .as_ref()
            .and_then(|f| f.end())
            .map(|(r, c)| (r as usize + 1, c as usize + 1));
        let (height, width) = match (value_end, formula_end) {
            (Some(a), Some(b)) => (a.0.max(b.0), a.1.max(b.1)),
            (Some(a), None) | (None, Some(a)) => a,
            (None, None) => return Ok(Vec::new()),
        };

        let mut grid: SheetGrid = vec![vec![Cell::default(); width]; height];

        if let Some((start_row, start_col)) = values.start() {
            for (r, row) in values.rows().enumerate() {
                for (c, data) in row.iter().enumerate() {
                    grid[start_row as usize + r][start_col as usize + c].value = data_to_value(data);
                }
            }
        }

        if let Some(formulas) = formulas {
            if let Some((start_row, start_col)) = formulas.start() {
                for (r, row) in formulas.rows().enumerate() {
                    for (c, raw) in row.iter().enumerate() {
                        if raw.trim().is_empty() {
                            continue;
                        }
                        let (text, rewritten) = (self.normalize)(raw);
                        if rewritten {
                            self.normalized += 1;
                        }
                        grid[start_row as usize + r][start_col as usize + c].formula = Some(text);
                    }
                }
            }
        }

        Ok(grid)
    }

    fn take_notes(&mut self) -> Vec<String> {
        std::mem::take(&mut self.notes)
    }

    fn normalized_formulas(&self) -> usize {
        self.normalized
    }
}

/// Delimited text as a single sheet.
pub struct CsvSource {
    sheet_name: String,
    content: String,
    pub delimiter: u8,
    pub encoding: &'static str,
}

impl CsvSource {
    pub fn open(data: &Bytes, sheet_name: impl Into<String>) -> Self {
        let (content, encoding) = decode_text(data);
        let delimiter = sniff_delimiter(&content);
        Self {
            sheet_name: sheet_name.into(),
            content: content.into_owned(),
            delimiter,
            encoding,
        }
    }
}

impl SheetSource for CsvSource {
    fn sheet_names(&self) -> Vec<String> {
        vec![self.sheet_name.clone()]
    }

    fn read_sheet(&mut self, name: &str) -> Result<SheetGrid, AppError> {
        if name != self.sheet_name {
            return Err(AppError::FileProcessingError(format!("No sheet named '{}'", name)));
        }
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(self.delimiter)
            .has_headers(false)
            .flexible(true)
            .from_reader(self.content.as_bytes());

        let mut grid = Vec::new();
        for record in reader.records() {
            let record = record?;
            grid.push(record.iter().map(field_to_cell).collect());
        }
        Ok(grid)
    }
}

/// Sheet name used for delimited files.
pub fn delimited_sheet_name(filename: Option<&str>) -> String {
    filename
        .and_then(|name| std::path::Path::new(name).file_stem())
        .map(|stem| stem.to_string_lossy().into_owned())
        .filter(|stem| !stem.is_empty())
        .unwrap_or_else(|| "Sheet1".to_string())
}

pub fn open_source(data: &Bytes, format: FileFormat) -> Result<Box<dyn SheetSource>, AppError> {
    Ok(match format.family() {
        FormatFamily::Modern => Box::new(CalamineSource::<Xlsx<ByteCursor>>::open(data)?),
        FormatFamily::Legacy => Box::new(CalamineSource::<Xls<ByteCursor>>::open(data)?),
        FormatFamily::Binary => Box::new(CalamineSource::<Xlsb<ByteCursor>>::open(data)?),
        FormatFamily::OpenDocument => Box::new(
            CalamineSource::<Ods<ByteCursor>>::open(data)?
                .with_normalizer(super::formats::open_document::normalize_open_formula),
        ),
        FormatFamily::Delimited => Box::new(CsvSource::open(data, delimited_sheet_name(None))),
    })
}

/// Materializes every sheet. Only for files under the streaming threshold.
pub fn load_workbook(data: &Bytes, format: FileFormat) -> Result<Workbook, AppError> {
    let mut source = open_source(data, format)?;
    let mut metadata = WorkbookMetadata::new(format, data);
    let mut sheets = Vec::new();
    for name in source.sheet_names() {
        let rows = source.read_sheet(&name)?;
        sheets.push(Sheet::new(name, rows));
    }
    metadata.sheet_count = sheets.len();
    Ok(Workbook { metadata, sheets })
}
