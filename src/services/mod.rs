pub mod batch;
pub mod converter;
pub mod excel;
pub mod file_processor;
pub mod formula;
pub mod session_registry;
pub mod validator;
