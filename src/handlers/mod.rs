pub mod file_handlers;
pub mod form;
pub mod health_handlers;
pub mod upload_handlers;
