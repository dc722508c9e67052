//! Backend stores.
//!
//! A [`BackendStore`] is one of the two places statistics can live:
//!
//! - [`InlineStore`]: the encoded blob in the workload manager's job record
//! - [`RelationalStore`]: normalized rows in the external database, with the
//!   blob retained on the summary row
//!
//! Both are cheap to clone; clones share the connection pool.

mod inline;
mod relational;

pub use inline::InlineStore;
pub use relational::{RelationalStore, StoredJob};

use crate::error::{Result, StatsError};
use crate::types::{JobKey, NormalizedJob, StatsPayload, StorageMode};

/// One backend the coordinator can write to or read from.
#[derive(Debug, Clone)]
pub enum BackendStore {
    Inline(InlineStore),
    Relational(RelationalStore),
}

impl BackendStore {
    pub fn mode(&self) -> StorageMode {
        match self {
            Self::Inline(_) => StorageMode::Inline,
            Self::Relational(_) => StorageMode::Relational,
        }
    }

    /// Persist a normalized job.
    pub async fn write(&self, job: &NormalizedJob) -> Result<()> {
        match self {
            Self::Inline(store) => store.write(job).await,
            Self::Relational(store) => store.write(job).await,
        }
    }

    /// Read and decode the stored summary for a job.
    pub async fn read(
        &self,
        key: &JobKey,
    ) -> std::result::Result<Option<StatsPayload>, StatsError> {
        match self {
            Self::Inline(store) => store.read(key).await,
            Self::Relational(store) => store.read(key).await,
        }
    }

    /// Read the stored blob without decoding it.
    pub async fn read_blob(&self, key: &JobKey) -> Result<Option<String>> {
        match self {
            Self::Inline(store) => store.read_blob(key).await,
            Self::Relational(store) => store.read_blob(key).await,
        }
    }
}

impl From<InlineStore> for BackendStore {
    fn from(store: InlineStore) -> Self {
        Self::Inline(store)
    }
}

impl From<RelationalStore> for BackendStore {
    fn from(store: RelationalStore) -> Self {
        Self::Relational(store)
    }
}
