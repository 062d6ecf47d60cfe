//! Core module - Common types, traits, and error handling

pub mod config;
pub mod error;
pub mod history;
pub mod traits;
pub mod types;

pub use config::Config;
pub use error::{Error, Result};
pub use history::{HistoryPolicy, OrderedUniqueLog};
pub use traits::*;
pub use types::*;
