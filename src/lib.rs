#[cfg(feature = "mimalloc")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

pub mod build;
pub mod config;
pub mod core;
pub mod error;
pub mod index;
pub mod query;
pub mod stats;
pub mod storage;

pub use build::IndexBuilder;
pub use config::{BuildConfig, Config, QueryConfig};
pub use crate::core::{HashRecord, KeySpace, RecordOrder};
pub use error::{BuildError, ConfigError, QueryError, ResolveError};
pub use index::IndexStore;
pub use query::{HashQuery, Lookup, QueryOutcome, SoftwareReference};
