mod common;

use bytes::Bytes;
use common::*;
use httpmock::prelude::*;
use sheet_insight::clients::EngineClient;
use sheet_insight::config::Config;
use sheet_insight::services::excel::ProcessingStrategy;
use sheet_insight::services::file_processor::{AnalyzeOptions, FileInput, FileProcessor};
use sheet_insight::services::session_registry::SessionRegistry;
use std::sync::Arc;

fn processor_for(server: &MockServer, streaming_threshold: usize) -> FileProcessor {
    let config = Config {
        streaming_threshold,
        // The mock engine hands every file the same session id.
        analysis_concurrency: 1,
        engine: engine_config(server.base_url(), 3),
        ..Config::default()
    };
    let engine = EngineClient::new(&config.engine, Arc::new(SessionRegistry::new())).unwrap();
    FileProcessor::new(&config, engine)
}

#[tokio::test]
async fn small_files_get_format_analysis_and_conversion_check() {
    let server = MockServer::start_async().await;
    let mocks = healthy_engine(&server).await;
    let processor = processor_for(&server, 1024 * 1024);

    let outcome = processor
        .analyze(
            Bytes::from_static(SCENARIO_CSV),
            "scenario.csv",
            Some("text/csv"),
            AnalyzeOptions {
                validate_conversion: true,
            },
        )
        .await
        .unwrap();

    assert!(outcome.validation.valid);
    assert_eq!(outcome.strategy, Some(ProcessingStrategy::WholeFile));
    let format = outcome.format.expect("format report");
    assert_eq!(format.total_formulas(), 1);
    let analysis = outcome.analysis.expect("analysis");
    assert_eq!(analysis.total_rows, 3);
    assert!(outcome.conversion.expect("conversion").valid);
    assert_eq!(mocks.destroy.hits_async().await, 1);
}

#[tokio::test]
async fn large_files_stream_without_whole_file_passes() {
    let server = MockServer::start_async().await;
    let mocks = healthy_engine(&server).await;
    let processor = processor_for(&server, 4);

    let outcome = processor
        .analyze(
            Bytes::from_static(SCENARIO_CSV),
            "scenario.csv",
            None,
            AnalyzeOptions {
                validate_conversion: true,
            },
        )
        .await
        .unwrap();

    assert_eq!(outcome.strategy, Some(ProcessingStrategy::Streaming));
    assert!(outcome.format.is_none());
    assert!(outcome.conversion.is_none());
    let analysis = outcome.analysis.expect("analysis");
    assert_eq!(analysis.total_formulas, 1);
    assert!(analysis.errors.iter().any(|e| e.message.contains("Conversion check skipped")));
    assert_eq!(mocks.load.hits_async().await, 1);
}

#[tokio::test]
async fn many_files_are_analyzed_independently() {
    let server = MockServer::start_async().await;
    let mocks = healthy_engine(&server).await;
    let processor = processor_for(&server, 1024 * 1024);

    let files = vec![
        FileInput {
            filename: "first.csv".into(),
            content_type: None,
            data: Bytes::from_static(SCENARIO_CSV),
        },
        FileInput {
            filename: "empty.xlsx".into(),
            content_type: None,
            data: Bytes::new(),
        },
        FileInput {
            filename: "second.csv".into(),
            content_type: None,
            data: Bytes::from_static(b"1,=SUM(A1:A1)\n"),
        },
    ];
    let outcomes = processor.analyze_many(files, AnalyzeOptions::default()).await;

    assert_eq!(outcomes.len(), 3);
    let empty = outcomes.iter().find(|o| o.filename == "empty.xlsx").unwrap();
    assert!(!empty.result.as_ref().unwrap().validation.valid);
    let second = outcomes.iter().find(|o| o.filename == "second.csv").unwrap();
    let analysis = second.result.as_ref().unwrap().analysis.as_ref().unwrap();
    assert_eq!(analysis.functions.get("SUM"), Some(&1));

    assert_eq!(mocks.create.hits_async().await, 2);
    assert_eq!(mocks.destroy.hits_async().await, 2);
}
