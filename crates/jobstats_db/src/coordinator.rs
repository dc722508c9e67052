//! Entry point for saving and loading job statistics.
//!
//! The write backend is fixed when the coordinator is built. Reads try the
//! inline store first, then the relational store when external storage is
//! enabled; the first store that has the job wins and a store error ends the
//! lookup.

use tracing::{debug, info, warn};

use crate::codec;
use crate::config::StorageConfig;
use crate::error::{StatsError, StoreError};
use crate::mapper;
use crate::store::{BackendStore, InlineStore, RelationalStore};
use crate::types::{JobKey, StatsPayload, StorageMode};

type Result<T> = std::result::Result<T, StatsError>;

#[derive(Debug, Clone)]
pub struct StatsCoordinator {
    mode: StorageMode,
    writer: BackendStore,
    readers: Vec<BackendStore>,
}

impl StatsCoordinator {
    /// Assemble a coordinator from already-connected stores.
    ///
    /// Fails with `ConnectionFailed` when the store `mode` writes to is missing.
    pub fn new(
        mode: StorageMode,
        inline: Option<InlineStore>,
        relational: Option<RelationalStore>,
    ) -> std::result::Result<Self, StoreError> {
        let writer = match mode {
            StorageMode::Inline => inline.clone().map(BackendStore::Inline),
            StorageMode::Relational => relational.clone().map(BackendStore::Relational),
        }
        .ok_or_else(|| {
            StoreError::connection_failed(format!(
                "no database connection available for {} storage",
                mode
            ))
        })?;

        let mut readers = Vec::with_capacity(2);
        if let Some(store) = inline {
            readers.push(BackendStore::Inline(store));
        }
        if mode == StorageMode::Relational {
            if let Some(store) = relational {
                readers.push(BackendStore::Relational(store));
            }
        }

        info!(mode = %mode, readers = readers.len(), "Job stats storage ready");
        Ok(Self {
            mode,
            writer,
            readers,
        })
    }

    /// Connect the stores `config` asks for.
    ///
    /// The write backend is connected eagerly. An inline store that only
    /// serves reads connects on first use.
    pub async fn connect(config: &StorageConfig) -> std::result::Result<Self, StoreError> {
        let mode = config.mode();

        let inline = match &config.inline {
            Some(conn) if conn.is_configured() => Some(match mode {
                StorageMode::Inline => InlineStore::connect(conn).await?,
                StorageMode::Relational => InlineStore::connect_lazy(conn)?,
            }),
            _ => None,
        };

        let relational = match mode {
            StorageMode::Relational => Some(RelationalStore::connect(&config.external).await?),
            StorageMode::Inline => None,
        };

        Self::new(mode, inline, relational)
    }

    pub fn mode(&self) -> StorageMode {
        self.mode
    }

    /// The store writes go to.
    pub fn writer(&self) -> &BackendStore {
        &self.writer
    }

    /// The relational store, when external storage is enabled.
    pub fn relational(&self) -> Option<&RelationalStore> {
        match &self.writer {
            BackendStore::Relational(store) => Some(store),
            BackendStore::Inline(_) => None,
        }
    }

    /// Encode and persist a job's statistics.
    pub async fn save(&self, key: &JobKey, payload: &StatsPayload) -> Result<()> {
        let blob = codec::encode(payload)?;
        self.write(key, payload, blob).await
    }

    /// Persist an already-encoded blob.
    ///
    /// The blob is decoded first; a malformed blob is rejected before anything
    /// is written.
    pub async fn save_blob(&self, key: &JobKey, blob: &str) -> Result<()> {
        let payload = codec::decode(blob)?;
        self.write(key, &payload, blob.trim().to_string()).await
    }

    async fn write(&self, key: &JobKey, payload: &StatsPayload, blob: String) -> Result<()> {
        let job = mapper::normalize(key, payload, Some(blob));

        match self.writer.write(&job).await {
            Ok(()) => {
                info!(
                    job = %key,
                    backend = %self.mode,
                    nodes = job.nodes.len(),
                    "Stored job statistics"
                );
                Ok(())
            }
            Err(err) => {
                warn!(
                    job = %key,
                    backend = %self.mode,
                    kind = err.kind(),
                    error = %err,
                    "Failed to store job statistics"
                );
                Err(err.into())
            }
        }
    }

    /// Decoded statistics for a job, or `None` when no store has them.
    pub async fn load(&self, key: &JobKey) -> Result<Option<StatsPayload>> {
        for store in &self.readers {
            if let Some(payload) = store.read(key).await? {
                debug!(job = %key, backend = %store.mode(), "Found job statistics");
                return Ok(Some(payload));
            }
        }
        debug!(job = %key, "No statistics stored");
        Ok(None)
    }

    /// The stored blob for a job, undecoded.
    pub async fn load_blob(&self, key: &JobKey) -> Result<Option<String>> {
        for store in &self.readers {
            if let Some(blob) = store.read_blob(key).await? {
                debug!(job = %key, backend = %store.mode(), "Found job statistics blob");
                return Ok(Some(blob));
            }
        }
        Ok(None)
    }
}
