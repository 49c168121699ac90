pub mod config;
pub mod error;
pub mod logging;

pub use config::{AppConfig, ConflictStrategy};
pub use error::{AppError, Result};
