pub mod config;
pub mod error;
pub mod logging;
pub mod models;
pub mod services;

pub use config::KernelConfig;
pub use error::{KernelError, Result};
pub use models::*;
pub use services::*;
