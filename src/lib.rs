pub mod auth;
pub mod config;
pub mod error;
pub mod ingest;
pub mod requestlog;
pub mod resolve;
pub mod server;
pub mod service;
pub mod store;

pub use config::Config;
pub use error::{Result, ServiceError};
pub use service::DataService;
