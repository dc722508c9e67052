//! Persistence layer for per-job resource usage statistics
//!
//! Job statistics travel as a compact text blob (`JS1:` + base64 of gzipped
//! JSON). They are stored either inline, in the workload manager's own job
//! record, or as normalized rows in an external relational database.
//!
//! # Usage
//!
//! ```rust,ignore
//! use jobstats_db::{JobKey, StatsCoordinator, StorageConfig};
//!
//! let coordinator = StatsCoordinator::connect(&config.storage).await?;
//!
//! let key = JobKey::new("della", 4242);
//! coordinator.save_blob(&key, blob).await?;
//!
//! if let Some(payload) = coordinator.load(&key).await? {
//!     println!("{}", serde_json::to_string_pretty(&payload)?);
//! }
//! ```
//!
//! # Database Selection
//!
//! The driver is chosen at compile time (see [`pool`]): SQLite by default,
//! MySQL / MariaDB with `--no-default-features --features mysql`.

#[cfg(not(any(feature = "sqlite", feature = "mysql")))]
compile_error!("enable the `sqlite` or `mysql` feature");

pub mod codec;
pub mod config;
mod coordinator;
mod error;
pub mod mapper;
pub mod pool;
mod schema;
pub mod store;
mod types;

pub use config::{ConnectionConfig, ExternalDbConfig, StorageConfig, TableNames};
pub use coordinator::StatsCoordinator;
pub use error::{DecodeError, EncodeError, Result, StatsError, StoreError};
pub use pool::{Db, DbPool};
pub use store::{BackendStore, InlineStore, RelationalStore, StoredJob};
pub use types::*;
