//! Shared types, errors and page layout for the GIN index engine.

pub mod config;
pub mod error;
pub mod page;
pub mod types;

pub use config::{EngineConfig, IndexOptions};
pub use error::{GinError, Result};
pub use page::{BlockNumber, INVALID_BLOCK, OffsetNumber, PAGE_SIZE, PageHeader};
pub use types::{Datum, KeyType};
