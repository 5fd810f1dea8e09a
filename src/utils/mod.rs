// Utility modules
pub mod error;
pub mod config;
pub mod types;

pub use error::*;
pub use config::*;
pub use types::*;