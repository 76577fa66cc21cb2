//! Chunked row streaming. A blocking worker parses the container and hands rows over a
//! channel of capacity one. The worker starts filling a chunk only after the consumer asks
//! for it, so the stream itself never holds more than one chunk. Dropping the
//! [`RowStream`] stops the worker at its next handoff.

use super::sources::{delimited_sheet_name, open_source, ByteCursor};
use super::utils::{decode_text, field_to_cell, sniff_delimiter};
use crate::config::MAX_CHUNK_SIZE;
use crate::error::AppError;
use crate::models::{datetime_to_serial, Cell, CellValue, FileFormat, FormatFamily};
use crate::services::formula::normalize_formula;
use bytes::Bytes;
use calamine::{open_workbook_from_rs, DataRef, Xlsx};
use futures::Stream;
use serde::Serialize;
use std::collections::VecDeque;
use std::io::Cursor;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc;

pub const DEFAULT_CHUNK_SIZE: usize = 1_000;

#[derive(Debug, Clone, PartialEq)]
pub struct StreamedRow {
    pub sheet: Arc<str>,
    /// 0-based row index within the sheet.
    pub index: usize,
    pub cells: Vec<Cell>,
}

impl StreamedRow {
    fn approx_bytes(&self) -> usize {
        self.cells.iter().map(Cell::approx_bytes).sum::<usize>() + std::mem::size_of::<Self>()
    }
}

/// Running totals, as of the most recent chunk.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamStats {
    pub rows: usize,
    pub cells: usize,
    pub chunks: usize,
    pub peak_chunk_bytes: usize,
}

#[derive(Debug, Clone)]
pub struct RowChunk {
    pub rows: Vec<StreamedRow>,
    pub stats: StreamStats,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProcessingStrategy {
    WholeFile,
    Streaming,
}

impl ProcessingStrategy {
    pub fn select(size: usize, streaming_threshold: usize) -> Self {
        if size > streaming_threshold {
            ProcessingStrategy::Streaming
        } else {
            ProcessingStrategy::WholeFile
        }
    }
}

pub struct RowStream {
    rx: mpsc::Receiver<Result<RowChunk, AppError>>,
    demand: mpsc::Sender<()>,
    requested: bool,
    pending: VecDeque<StreamedRow>,
    stats: StreamStats,
}

impl RowStream {
    /// At most one request is outstanding; it is answered by the next chunk.
    fn request(&mut self) {
        if !self.requested {
            let _ = self.demand.try_send(());
            self.requested = true;
        }
    }

    pub async fn next_chunk(&mut self) -> Option<Result<RowChunk, AppError>> {
        self.request();
        let item = self.rx.recv().await;
        self.requested = false;
        if let Some(Ok(chunk)) = &item {
            self.stats = chunk.stats.clone();
        }
        item
    }

    /// Row-at-a-time view over the same chunks.
    pub async fn next_row(&mut self) -> Option<Result<StreamedRow, AppError>> {
        loop {
            if let Some(row) = self.pending.pop_front() {
                return Some(Ok(row));
            }
            match self.next_chunk().await? {
                Ok(chunk) => self.pending.extend(chunk.rows),
                Err(e) => return Some(Err(e)),
            }
        }
    }

    pub fn stats(&self) -> &StreamStats {
        &self.stats
    }
}

impl Stream for RowStream {
    type Item = Result<RowChunk, AppError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.request();
        let polled = self.rx.poll_recv(cx);
        if polled.is_ready() {
            self.requested = false;
        }
        if let Poll::Ready(Some(Ok(chunk))) = &polled {
            self.stats = chunk.stats.clone();
        }
        polled
    }
}

/// The consumer went away.
struct Closed;

struct ChunkSink {
    tx: mpsc::Sender<Result<RowChunk, AppError>>,
    demand: mpsc::Receiver<()>,
    chunk_size: usize,
    buffer: Vec<StreamedRow>,
    buffer_bytes: usize,
    stats: StreamStats,
}

impl ChunkSink {
    fn push(&mut self, row: StreamedRow) -> Result<(), Closed> {
        if self.buffer.is_empty() {
            self.demand.blocking_recv().ok_or(Closed)?;
        }
        self.buffer_bytes += row.approx_bytes();
        self.buffer.push(row);
        if self.buffer.len() >= self.chunk_size {
            self.flush()?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), Closed> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let rows = std::mem::replace(&mut self.buffer, Vec::with_capacity(self.chunk_size));
        self.stats.rows += rows.len();
        self.stats.cells += rows.iter().map(|r| r.cells.len()).sum::<usize>();
        self.stats.chunks += 1;
        self.stats.peak_chunk_bytes = self.stats.peak_chunk_bytes.max(self.buffer_bytes);
        self.buffer_bytes = 0;
        tracing::debug!("Chunk {} ready: {} rows", self.stats.chunks, rows.len());

        self.tx
            .blocking_send(Ok(RowChunk {
                rows,
                stats: self.stats.clone(),
            }))
            .map_err(|_| Closed)
    }

    fn fail(&self, error: AppError) {
        tracing::error!("Streaming read failed after {} rows: {}", self.stats.rows, error);
        let _ = self.tx.blocking_send(Err(error));
    }
}

/// Regroups row-major cells into A1-anchored rows, filling skipped rows with empties.
struct RowAssembler {
    sheet: Arc<str>,
    next_index: usize,
    current: Option<(usize, Vec<Cell>)>,
}

impl RowAssembler {
    fn new(sheet: &str) -> Self {
        Self {
            sheet: Arc::from(sheet),
            next_index: 0,
            current: None,
        }
    }

    fn place(&mut self, row: usize, column: usize, cell: Cell, sink: &mut ChunkSink) -> Result<(), Closed> {
        if self.current.as_ref().map_or(true, |(index, _)| *index != row) {
            self.finish_row(sink)?;
            while self.next_index < row {
                self.emit(self.next_index, Vec::new(), sink)?;
            }
            self.current = Some((row, Vec::new()));
        }
        if let Some((_, cells)) = self.current.as_mut() {
            if cells.len() <= column {
                cells.resize(column + 1, Cell::default());
            }
            cells[column] = cell;
        }
        Ok(())
    }

    fn finish_row(&mut self, sink: &mut ChunkSink) -> Result<(), Closed> {
        match self.current.take() {
            Some((index, cells)) => self.emit(index, cells, sink),
            None => Ok(()),
        }
    }

    fn emit(&mut self, index: usize, cells: Vec<Cell>, sink: &mut ChunkSink) -> Result<(), Closed> {
        self.next_index = index + 1;
        sink.push(StreamedRow {
            sheet: Arc::clone(&self.sheet),
            index,
            cells,
        })
    }
}

pub fn dataref_to_value(data: &DataRef<'_>) -> CellValue {
    match data {
        DataRef::Int(i) => CellValue::Number(*i as f64),
        DataRef::Float(f) => CellValue::Number(*f),
        DataRef::String(s) if s.is_empty() => CellValue::Empty,
        DataRef::String(s) => CellValue::Text(s.clone()),
        DataRef::SharedString(s) if s.is_empty() => CellValue::Empty,
        DataRef::SharedString(s) => CellValue::Text(s.to_string()),
        DataRef::Bool(b) => CellValue::Boolean(*b),
        DataRef::DateTime(d) => CellValue::DateTime(d.as_f64()),
        DataRef::DateTimeIso(s) => super::utils::parse_datetime(s)
            .and_then(datetime_to_serial)
            .map(CellValue::DateTime)
            .unwrap_or_else(|| CellValue::Text(s.clone())),
        DataRef::DurationIso(s) => CellValue::Text(s.clone()),
        DataRef::Error(e) => CellValue::ErrorLiteral(e.to_string()),
        DataRef::Empty => CellValue::Empty,
        #[allow(unreachable_patterns)]
        _ => CellValue::Empty,
    }
}

enum Producer {
    Done,
    Stopped,
}

fn open_xlsx(data: &Bytes) -> Result<Xlsx<ByteCursor>, AppError> {
    open_workbook_from_rs(Cursor::new(data.clone()))
        .map_err(|e| AppError::FileProcessingError(format!("Failed to open spreadsheet: {}", e)))
}

fn sheet_error(sheet: &str, e: impl std::fmt::Display) -> AppError {
    AppError::FileProcessingError(format!("Failed to stream sheet '{}': {}", sheet, e))
}

/// Values and formulas come from two readers over the same package, merged by position.
fn produce_xlsx(data: &Bytes, sink: &mut ChunkSink) -> Result<Producer, AppError> {
    let mut value_book = open_xlsx(data)?;
    let mut formula_book = open_xlsx(data)?;
    let sheet_names = calamine::Reader::sheet_names(&value_book);

    for name in &sheet_names {
        let mut values = value_book
            .worksheet_cells_reader(name)
            .map_err(|e| sheet_error(name, e))?;
        let mut formulas = match formula_book.worksheet_cells_reader(name) {
            Ok(reader) => Some(reader),
            Err(e) => {
                tracing::warn!("Formulas unavailable for sheet {}: {}", name, e);
                None
            }
        };

        let mut next_formula = || -> Option<((u32, u32), String)> {
            let reader = formulas.as_mut()?;
            match reader.next_formula() {
                Ok(Some(cell)) => Some((cell.get_position(), cell.get_value().clone())),
                Ok(None) => None,
                Err(e) => {
                    tracing::warn!("Stopped reading formulas of sheet {}: {}", name, e);
                    None
                }
            }
        };

        let mut pending_value = values
            .next_cell()
            .map_err(|e| sheet_error(name, e))?
            .map(|c| (c.get_position(), dataref_to_value(c.get_value())));
        let mut pending_formula = next_formula();
        let mut assembler = RowAssembler::new(name);

        loop {
            let position = match (&pending_value, &pending_formula) {
                (None, None) => break,
                (Some((p, _)), None) | (None, Some((p, _))) => *p,
                (Some((v, _)), Some((f, _))) => (*v).min(*f),
            };

            let mut cell = Cell::default();
            if matches!(&pending_value, Some((p, _)) if *p == position) {
                if let Some((_, value)) = pending_value.take() {
                    cell.value = value;
                }
                pending_value = values
                    .next_cell()
                    .map_err(|e| sheet_error(name, e))?
                    .map(|c| (c.get_position(), dataref_to_value(c.get_value())));
            }
            if matches!(&pending_formula, Some((p, _)) if *p == position) {
                if let Some((_, text)) = pending_formula.take() {
                    if !text.trim().is_empty() {
                        cell.formula = Some(normalize_formula(&text));
                    }
                }
                pending_formula = next_formula();
            }

            if cell.is_blank() {
                continue;
            }
            if assembler
                .place(position.0 as usize, position.1 as usize, cell, sink)
                .is_err()
            {
                return Ok(Producer::Stopped);
            }
        }
        if assembler.finish_row(sink).is_err() {
            return Ok(Producer::Stopped);
        }
    }
    Ok(Producer::Done)
}

/// Containers without a cell-level reader are read one sheet at a time and re-chunked.
fn produce_by_sheet(data: &Bytes, format: FileFormat, sink: &mut ChunkSink) -> Result<Producer, AppError> {
    let mut source = open_source(data, format)?;
    for name in source.sheet_names() {
        let grid = source.read_sheet(&name)?;
        let sheet: Arc<str> = Arc::from(name.as_str());
        for (index, cells) in grid.into_iter().enumerate() {
            let row = StreamedRow {
                sheet: Arc::clone(&sheet),
                index,
                cells,
            };
            if sink.push(row).is_err() {
                return Ok(Producer::Stopped);
            }
        }
    }
    Ok(Producer::Done)
}

fn produce_delimited(data: &Bytes, sheet_name: &str, sink: &mut ChunkSink) -> Result<Producer, AppError> {
    let (content, encoding) = decode_text(data);
    let delimiter = sniff_delimiter(&content);
    tracing::debug!("Streaming delimited text ({}, delimiter {:?})", encoding, delimiter as char);

    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .has_headers(false)
        .flexible(true)
        .from_reader(content.as_bytes());

    let sheet: Arc<str> = Arc::from(sheet_name);
    for (index, record) in reader.records().enumerate() {
        let record = record?;
        let row = StreamedRow {
            sheet: Arc::clone(&sheet),
            index,
            cells: record.iter().map(field_to_cell).collect(),
        };
        if sink.push(row).is_err() {
            return Ok(Producer::Stopped);
        }
    }
    Ok(Producer::Done)
}

#[derive(Debug, Clone)]
pub struct ExcelProcessor {
    chunk_size: usize,
}

impl Default for ExcelProcessor {
    fn default() -> Self {
        Self::new(DEFAULT_CHUNK_SIZE)
    }
}

impl ExcelProcessor {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size: chunk_size.clamp(1, MAX_CHUNK_SIZE),
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Opens the container once on a blocking worker. Must be called inside a tokio runtime.
    pub fn stream_read(&self, data: Bytes, format: FileFormat, filename: Option<&str>) -> RowStream {
        let (tx, rx) = mpsc::channel(1);
        let (demand_tx, demand_rx) = mpsc::channel(1);
        let chunk_size = self.chunk_size;
        let sheet_name = delimited_sheet_name(filename);

        tokio::task::spawn_blocking(move || {
            let start = std::time::Instant::now();
            let mut sink = ChunkSink {
                tx,
                demand: demand_rx,
                chunk_size,
                buffer: Vec::with_capacity(chunk_size),
                buffer_bytes: 0,
                stats: StreamStats::default(),
            };

            let produced = match format.family() {
                FormatFamily::Modern => produce_xlsx(&data, &mut sink),
                FormatFamily::Delimited => produce_delimited(&data, &sheet_name, &mut sink),
                _ => produce_by_sheet(&data, format, &mut sink),
            };

            match produced {
                Ok(Producer::Done) => {
                    if sink.flush().is_ok() {
                        tracing::info!(
                            "Streamed {} rows in {} chunks in {:?}",
                            sink.stats.rows,
                            sink.stats.chunks,
                            start.elapsed()
                        );
                    }
                }
                Ok(Producer::Stopped) => {
                    tracing::debug!("Stream consumer dropped after {} rows", sink.stats.rows);
                }
                Err(e) => {
                    if sink.flush().is_ok() {
                        sink.fail(e);
                    }
                }
            }
        });

        RowStream {
            rx,
            demand: demand_tx,
            requested: false,
            pending: VecDeque::new(),
            stats: StreamStats::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    fn csv_bytes(rows: usize) -> Bytes {
        let mut text = String::new();
        for i in 0..rows {
            text.push_str(&format!("{},{}\n", i, i * 2));
        }
        Bytes::from(text)
    }

    fn sink(chunk_size: usize) -> (ChunkSink, mpsc::Receiver<Result<RowChunk, AppError>>, mpsc::Sender<()>) {
        let (tx, rx) = mpsc::channel(1);
        let (demand_tx, demand_rx) = mpsc::channel(1);
        let sink = ChunkSink {
            tx,
            demand: demand_rx,
            chunk_size,
            buffer: Vec::new(),
            buffer_bytes: 0,
            stats: StreamStats::default(),
        };
        (sink, rx, demand_tx)
    }

    #[test]
    fn worker_waits_for_demand_before_each_chunk() {
        let (mut sink, mut rx, demand) = sink(2);
        let worker = std::thread::spawn(move || {
            for index in 0..6 {
                let row = StreamedRow {
                    sheet: Arc::from("S"),
                    index,
                    cells: vec![Cell::value(CellValue::Number(index as f64))],
                };
                if sink.push(row).is_err() {
                    return sink.stats.rows;
                }
            }
            sink.stats.rows
        });

        std::thread::sleep(std::time::Duration::from_millis(50));
        assert!(rx.try_recv().is_err());

        demand.blocking_send(()).unwrap();
        let first = rx.blocking_recv().unwrap().unwrap();
        assert_eq!(first.rows.len(), 2);

        std::thread::sleep(std::time::Duration::from_millis(50));
        assert!(rx.try_recv().is_err());

        drop(demand);
        assert_eq!(worker.join().unwrap(), 2);
    }

    #[test]
    fn strategy_follows_the_threshold() {
        assert_eq!(ProcessingStrategy::select(10, 100), ProcessingStrategy::WholeFile);
        assert_eq!(ProcessingStrategy::select(100, 100), ProcessingStrategy::WholeFile);
        assert_eq!(ProcessingStrategy::select(101, 100), ProcessingStrategy::Streaming);
    }

    #[test]
    fn chunk_size_is_clamped() {
        assert_eq!(ExcelProcessor::new(0).chunk_size(), 1);
        assert_eq!(ExcelProcessor::new(50_000).chunk_size(), MAX_CHUNK_SIZE);
    }

    #[tokio::test]
    async fn chunks_never_exceed_the_configured_size() {
        let processor = ExcelProcessor::new(4);
        let mut stream = processor.stream_read(csv_bytes(10), FileFormat::Csv, Some("numbers.csv"));

        let mut sizes = Vec::new();
        while let Some(chunk) = stream.next_chunk().await {
            let chunk = chunk.unwrap();
            assert_eq!(&*chunk.rows[0].sheet, "numbers");
            sizes.push(chunk.rows.len());
        }
        assert_eq!(sizes, vec![4, 4, 2]);
        assert_eq!(stream.stats().rows, 10);
        assert_eq!(stream.stats().cells, 20);
        assert_eq!(stream.stats().chunks, 3);
        assert!(stream.stats().peak_chunk_bytes > 0);
    }

    #[tokio::test]
    async fn rows_arrive_in_order() {
        let processor = ExcelProcessor::new(3);
        let mut stream = processor.stream_read(csv_bytes(7), FileFormat::Csv, None);
        let mut indices = Vec::new();
        while let Some(row) = stream.next_row().await {
            indices.push(row.unwrap().index);
        }
        assert_eq!(indices, (0..7).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn implements_stream() {
        let processor = ExcelProcessor::new(2);
        let stream = processor.stream_read(csv_bytes(5), FileFormat::Csv, None);
        let chunks: Vec<_> = stream.collect().await;
        assert_eq!(chunks.len(), 3);
    }

    #[tokio::test]
    async fn dropping_the_stream_stops_the_producer() {
        let processor = ExcelProcessor::new(1);
        let mut stream = processor.stream_read(csv_bytes(1_000), FileFormat::Csv, None);
        let first = stream.next_chunk().await.unwrap().unwrap();
        assert_eq!(first.rows.len(), 1);
        drop(stream);
    }

    #[tokio::test]
    async fn corrupt_container_surfaces_an_error() {
        let processor = ExcelProcessor::default();
        let mut stream = processor.stream_read(Bytes::from_static(b"PK\x03\x04junk"), FileFormat::Xlsx, None);
        let item = stream.next_chunk().await.unwrap();
        assert!(matches!(item, Err(AppError::FileProcessingError(_))));
        assert!(stream.next_chunk().await.is_none());
    }
}
