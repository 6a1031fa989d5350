pub mod app_error;
pub mod settings;
pub mod tracing;
