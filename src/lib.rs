pub mod clients;
pub mod config;
pub mod error;
pub mod logging;
pub mod models;
pub mod routes;
pub mod services;

use clients::engine::EngineClient;
use services::file_processor::FileProcessor;

// Application state
#[derive(Clone)]
pub struct AppState {
    pub config: config::Config,
    pub processor: FileProcessor,
    pub engine: EngineClient,
}

impl AppState {
    pub fn new(config: config::Config, engine: EngineClient) -> Self {
        let processor = FileProcessor::new(&config, engine.clone());
        Self {
            config,
            processor,
            engine,
        }
    }
}
