pub mod engine;
pub mod models;

pub use engine::{EngineClient, EngineSession, RetryPolicy, SessionGuard, SessionState};
pub use models::{
    CalculationResult, EngineAnalysis, EngineHealth, EngineHealthReport, EngineIssue, EngineSheets, FunctionCatalog,
    FormulaValidation,
};
