use crate::clients::engine::EngineClient;
use crate::config::Config;
use crate::error::AppError;
use crate::models::{AnalysisResult, ErrorKind, ErrorRecord, Severity};
use crate::services::batch::BatchCoordinator;
use crate::services::converter::{self, ConversionReport, DEFAULT_SAMPLE_LIMIT};
use crate::services::excel::sources::load_workbook;
use crate::services::excel::types::FormatReport;
use crate::services::excel::utils::load_file_from_url;
use crate::services::excel::{ExcelAnalyzer, ExcelProcessor, ProcessingStrategy};
use crate::services::validator::{FormatValidator, ValidationOutcome};
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use serde::Serialize;

#[derive(Debug, Clone, Copy, Default)]
pub struct AnalyzeOptions {
    /// Run the round-trip converter check. Skipped for streamed files.
    pub validate_conversion: bool,
}

#[derive(Debug, Clone)]
pub struct FileInput {
    pub filename: String,
    pub content_type: Option<String>,
    pub data: Bytes,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileAnalysis {
    pub validation: ValidationOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strategy: Option<ProcessingStrategy>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<FormatReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub analysis: Option<AnalysisResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversion: Option<ConversionReport>,
}

impl FileAnalysis {
    fn rejected(validation: ValidationOutcome) -> Self {
        Self {
            validation,
            strategy: None,
            format: None,
            analysis: None,
            conversion: None,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileOutcome {
    pub filename: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<FileAnalysis>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Validate, pick a strategy, analyze and stream through the engine, optionally diff the
/// converter round trip.
#[derive(Clone)]
pub struct FileProcessor {
    validator: FormatValidator,
    processor: ExcelProcessor,
    engine: EngineClient,
    streaming_threshold: usize,
    batch_size: usize,
    concurrency: usize,
}

impl FileProcessor {
    pub fn new(config: &Config, engine: EngineClient) -> Self {
        Self {
            validator: FormatValidator::new(config.max_file_size),
            processor: ExcelProcessor::new(config.chunk_size),
            engine,
            streaming_threshold: config.streaming_threshold,
            batch_size: config.batch_size,
            concurrency: config.analysis_concurrency.max(1),
        }
    }

    pub fn engine(&self) -> &EngineClient {
        &self.engine
    }

    pub fn validate(&self, data: &[u8], filename: &str, content_type: Option<&str>) -> ValidationOutcome {
        let outcome = self.validator.validate(data, filename, content_type);
        if !outcome.valid {
            tracing::warn!("Rejected {}: {}", filename, outcome.errors.join("; "));
        }
        outcome
    }

    pub async fn download(&self, url: &str) -> Result<Bytes, AppError> {
        let start = std::time::Instant::now();
        let data = load_file_from_url(url).await.map_err(|e| {
            tracing::error!("Download failed: {}", e);
            e
        })?;
        tracing::info!("File downloaded, size: {}KB, took: {:?}", data.len() / 1024, start.elapsed());
        Ok(data)
    }

    /// An invalid file is not an error: the outcome carries only the validation result.
    pub async fn analyze(
        &self,
        data: Bytes,
        filename: &str,
        content_type: Option<&str>,
        options: AnalyzeOptions,
    ) -> Result<FileAnalysis, AppError> {
        let start = std::time::Instant::now();
        tracing::info!("Starting analysis of {} ({} bytes)", filename, data.len());

        let validation = self.validate(&data, filename, content_type);
        if !validation.valid {
            return Ok(FileAnalysis::rejected(validation));
        }
        let format = validation
            .format
            .ok_or_else(|| AppError::Internal(format!("No format resolved for {}", filename)))?;

        let strategy = ProcessingStrategy::select(data.len(), self.streaming_threshold);
        tracing::info!("Processing {} as .{} with {:?} strategy", filename, format, strategy);

        let report = match strategy {
            ProcessingStrategy::WholeFile => {
                let analyzer_start = std::time::Instant::now();
                let report = ExcelAnalyzer
                    .analyze_from_bytes(data.clone(), format, Some(filename.to_string()))
                    .await?;
                tracing::info!("Format analysis completed in {:?}", analyzer_start.elapsed());
                Some(report)
            }
            ProcessingStrategy::Streaming => None,
        };

        let stream_start = std::time::Instant::now();
        let stream = self.processor.stream_read(data.clone(), format, Some(filename));
        let mut analysis = BatchCoordinator::new(self.engine.clone(), self.batch_size).run(stream).await?;
        tracing::info!("Stream and engine pass completed in {:?}", stream_start.elapsed());

        let conversion = match (options.validate_conversion, strategy) {
            (false, _) => None,
            (true, ProcessingStrategy::WholeFile) => Some(check_conversion(data, format).await?),
            (true, ProcessingStrategy::Streaming) => {
                tracing::warn!("Skipping conversion check for streamed file {}", filename);
                analysis.record_error(ErrorRecord::new(
                    ErrorKind::CompatibilityWarning,
                    Severity::Low,
                    "Conversion check skipped: file exceeds the streaming threshold",
                ));
                None
            }
        };

        tracing::info!("Total processing of {} completed in {:?}", filename, start.elapsed());
        Ok(FileAnalysis {
            validation,
            strategy: Some(strategy),
            format: report,
            analysis: Some(analysis),
            conversion,
        })
    }

    pub async fn analyze_url(
        &self,
        url: &str,
        filename: &str,
        content_type: Option<&str>,
        options: AnalyzeOptions,
    ) -> Result<FileAnalysis, AppError> {
        let data = self.download(url).await?;
        self.analyze(data, filename, content_type, options).await
    }

    /// Independent files in parallel, each with its own session. One file failing does not
    /// affect the others. Outcomes come back in completion order.
    pub async fn analyze_many(&self, files: Vec<FileInput>, options: AnalyzeOptions) -> Vec<FileOutcome> {
        tracing::info!("Analyzing {} files, {} at a time", files.len(), self.concurrency);
        stream::iter(files)
            .map(|file| async move {
                let result = self
                    .analyze(file.data, &file.filename, file.content_type.as_deref(), options)
                    .await;
                match result {
                    Ok(analysis) => FileOutcome {
                        filename: file.filename,
                        result: Some(analysis),
                        error: None,
                    },
                    Err(e) => {
                        tracing::error!("Analysis of {} failed: {}", file.filename, e);
                        FileOutcome {
                            filename: file.filename,
                            result: None,
                            error: Some(e.to_string()),
                        }
                    }
                }
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await
    }
}

async fn check_conversion(data: Bytes, format: crate::models::FileFormat) -> Result<ConversionReport, AppError> {
    let start = std::time::Instant::now();
    let report = tokio::task::spawn_blocking(move || {
        let workbook = load_workbook(&data, format)?;
        converter::validate_round_trip(&workbook, DEFAULT_SAMPLE_LIMIT)
    })
    .await
    .map_err(|e| AppError::Internal(format!("Conversion task failed: {}", e)))??;
    tracing::info!(
        "Conversion check completed in {:?}: {} cells sampled, {:.2}% mismatched",
        start.elapsed(),
        report.sampled,
        report.mismatch_rate * 100.0
    );
    Ok(report)
}
