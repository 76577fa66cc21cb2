pub mod analyzer;
pub mod formats;
pub mod processor;
pub mod sources;
pub mod types;
pub mod utils;
pub mod writer;

pub use analyzer::{analyzer_for, ExcelAnalyzer, FormatAnalyzer};
pub use processor::{ExcelProcessor, ProcessingStrategy, RowChunk, RowStream, StreamStats, StreamedRow};
pub use writer::StreamWriter;
