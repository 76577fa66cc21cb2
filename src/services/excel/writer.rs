//! Incremental output: rows are appended in order and the container is committed once,
//! on completion or on the first failure. Modern-XML output runs the worksheet in constant
//! memory mode, so each finished row is flushed to a temp file instead of held in memory.

use super::processor::RowStream;
use crate::error::AppError;
use crate::models::{Cell, CellValue, FileFormat, FormatFamily};
use rust_xlsxwriter::{Format, Workbook, Worksheet};
use std::fs::File;
use std::path::{Path, PathBuf};

const DATE_FORMAT: &str = "yyyy-mm-dd hh:mm:ss";

enum Sink {
    Xlsx {
        workbook: Workbook,
        date_format: Format,
        path: PathBuf,
    },
    Csv {
        writer: csv::Writer<File>,
    },
}

pub struct StreamWriter {
    sink: Sink,
    rows_written: u32,
}

impl StreamWriter {
    /// Modern-XML (single sheet) and delimited text are writable.
    pub fn create(path: impl AsRef<Path>, format: FileFormat, sheet_name: &str) -> Result<Self, AppError> {
        let path = path.as_ref();
        let sink = match format.family() {
            FormatFamily::Modern if !format.is_macro_enabled() => {
                let mut workbook = Workbook::new();
                workbook.add_worksheet_with_constant_memory().set_name(sheet_name)?;
                Sink::Xlsx {
                    workbook,
                    date_format: Format::new().set_num_format(DATE_FORMAT),
                    path: path.to_path_buf(),
                }
            }
            FormatFamily::Delimited => Sink::Csv {
                writer: csv::Writer::from_path(path)?,
            },
            _ => {
                return Err(AppError::ValidationError(format!(
                    "Writing .{} files is not supported",
                    format
                )))
            }
        };
        tracing::debug!("Opened .{} writer at {}", format, path.display());
        Ok(Self { sink, rows_written: 0 })
    }

    pub fn rows_written(&self) -> u32 {
        self.rows_written
    }

    pub fn append_row(&mut self, cells: &[Cell]) -> Result<(), AppError> {
        let row = self.rows_written;
        match &mut self.sink {
            Sink::Xlsx {
                workbook, date_format, ..
            } => {
                let worksheet = workbook.worksheet_from_index(0)?;
                for (column, cell) in cells.iter().enumerate() {
                    let column = u16::try_from(column)
                        .map_err(|_| AppError::FileProcessingError(format!("Row {} is too wide", row + 1)))?;
                    write_xlsx_cell(worksheet, date_format, row, column, cell)?;
                }
            }
            Sink::Csv { writer } => {
                writer.write_record(cells.iter().map(|cell| match &cell.formula {
                    Some(formula) => formula.clone(),
                    None => cell.value.to_string(),
                }))?;
            }
        }
        self.rows_written += 1;
        Ok(())
    }

    /// Commits the output and returns the number of rows written.
    pub fn finish(self) -> Result<u32, AppError> {
        let rows = self.rows_written;
        match self.sink {
            Sink::Xlsx { mut workbook, path, .. } => {
                workbook.save(&path)?;
            }
            Sink::Csv { mut writer } => writer.flush()?,
        }
        tracing::info!("Committed {} rows", rows);
        Ok(rows)
    }

    /// Drains a row stream into the sink. A failing source still commits what was
    /// written so far before the error is returned.
    pub async fn write_stream(mut self, mut stream: RowStream) -> Result<u32, AppError> {
        while let Some(row) = stream.next_row().await {
            let outcome = row.and_then(|row| self.append_row(&row.cells));
            if let Err(e) = outcome {
                tracing::warn!("Stream write interrupted after {} rows: {}", self.rows_written, e);
                if let Err(commit) = self.finish() {
                    tracing::error!("Failed to commit partial output: {}", commit);
                }
                return Err(e);
            }
        }
        self.finish()
    }
}

fn write_xlsx_cell(
    worksheet: &mut Worksheet,
    date_format: &Format,
    row: u32,
    column: u16,
    cell: &Cell,
) -> Result<(), AppError> {
    if let Some(formula) = &cell.formula {
        worksheet.write_formula(row, column, formula.as_str())?;
        return Ok(());
    }
    match &cell.value {
        CellValue::Number(n) => {
            worksheet.write_number(row, column, *n)?;
        }
        CellValue::Text(s) | CellValue::ErrorLiteral(s) => {
            worksheet.write_string(row, column, s)?;
        }
        CellValue::Boolean(b) => {
            worksheet.write_boolean(row, column, *b)?;
        }
        CellValue::DateTime(serial) => {
            worksheet.write_number_with_format(row, column, *serial, date_format)?;
        }
        CellValue::Empty => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::excel::processor::ExcelProcessor;
    use crate::services::excel::sources::load_workbook;
    use bytes::Bytes;

    fn rows() -> Vec<Vec<Cell>> {
        vec![
            vec![Cell::value(CellValue::Text("a".into())), Cell::value(CellValue::Number(1.0))],
            vec![Cell::value(CellValue::Text("b".into())), Cell::formula("=A1&B1", CellValue::Empty)],
            vec![Cell::value(CellValue::Text("c".into())), Cell::value(CellValue::Number(3.0))],
        ]
    }

    #[test]
    fn writes_and_reads_back_xlsx() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scenario.xlsx");
        let mut writer = StreamWriter::create(&path, FileFormat::Xlsx, "Sheet1").unwrap();
        for row in rows() {
            writer.append_row(&row).unwrap();
        }
        assert_eq!(writer.finish().unwrap(), 3);

        let data = Bytes::from(std::fs::read(&path).unwrap());
        let workbook = load_workbook(&data, FileFormat::Xlsx).unwrap();
        let sheet = workbook.sheet("Sheet1").unwrap();
        assert_eq!(sheet.row_count(), 3);
        assert_eq!(sheet.cell(1, 1).unwrap().formula.as_deref(), Some("=A1&B1"));
        assert_eq!(sheet.cell(2, 1).unwrap().value, CellValue::Number(3.0));
    }

    #[test]
    fn long_xlsx_output_keeps_every_row() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("long.xlsx");
        let mut writer = StreamWriter::create(&path, FileFormat::Xlsx, "Data").unwrap();
        for i in 0..5_000u32 {
            let row = vec![
                Cell::value(CellValue::Text(format!("row {}", i))),
                Cell::value(CellValue::Number(i as f64)),
            ];
            writer.append_row(&row).unwrap();
        }
        assert_eq!(writer.finish().unwrap(), 5_000);

        let data = Bytes::from(std::fs::read(&path).unwrap());
        let workbook = load_workbook(&data, FileFormat::Xlsx).unwrap();
        let sheet = workbook.sheet("Data").unwrap();
        assert_eq!(sheet.row_count(), 5_000);
        assert_eq!(sheet.cell(4_999, 0).unwrap().value, CellValue::Text("row 4999".into()));
        assert_eq!(sheet.cell(4_999, 1).unwrap().value, CellValue::Number(4999.0));
    }

    #[test]
    fn unsupported_targets_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let result = StreamWriter::create(dir.path().join("x.xls"), FileFormat::Xls, "Sheet1");
        assert!(matches!(result, Err(AppError::ValidationError(_))));
    }

    #[tokio::test]
    async fn stream_to_csv() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("copy.csv");
        let stream = ExcelProcessor::new(2).stream_read(Bytes::from_static(b"a,1\nb,=A1&B1\nc,3\n"), FileFormat::Csv, None);
        let writer = StreamWriter::create(&path, FileFormat::Csv, "copy").unwrap();
        assert_eq!(writer.write_stream(stream).await.unwrap(), 3);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "a,1\nb,=A1&B1\nc,3\n");
    }

    #[tokio::test]
    async fn failed_source_commits_partial_output() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("partial.csv");
        let stream = ExcelProcessor::default().stream_read(Bytes::from_static(b"PK\x03\x04junk"), FileFormat::Xlsx, None);
        let writer = StreamWriter::create(&path, FileFormat::Csv, "partial").unwrap();
        assert!(writer.write_stream(stream).await.is_err());
        assert!(path.exists());
    }
}
