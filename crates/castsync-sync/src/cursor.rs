use anyhow::{Context, Result};
use castsync_core::SyncCursor;
use castsync_storage::OptionStore;
use chrono::{DateTime, SecondsFormat, Utc};
use tracing::warn;

pub const SINCE_KEY: &str = "since";
pub const SYNC_INDEX_KEY: &str = "sync_index";
pub const TOTAL_KEY: &str = "sync_total_result_count";

/// Loads and saves the show cursor through the option store.
pub struct CursorStore<'a, O: ?Sized> {
    options: &'a O,
}

impl<'a, O: OptionStore + ?Sized> CursorStore<'a, O> {
    pub fn new(options: &'a O) -> Self {
        Self { options }
    }

    /// Missing or unreadable values fall back to the start of the catalog.
    pub async fn load(&self) -> Result<SyncCursor> {
        let since = self
            .read(SINCE_KEY)
            .await?
            .and_then(|raw| match DateTime::parse_from_rfc3339(&raw) {
                Ok(dt) => Some(dt.with_timezone(&Utc)),
                Err(err) => {
                    warn!(value = %raw, %err, "ignoring unreadable sync cursor timestamp");
                    None
                }
            })
            .unwrap_or_default();
        let sync_index = self.read_count(SYNC_INDEX_KEY).await?;
        let total_result_count = self.read_count(TOTAL_KEY).await?;
        Ok(SyncCursor {
            since,
            sync_index,
            total_result_count,
        })
    }

    pub async fn save_index(&self, sync_index: usize) -> Result<()> {
        self.write(SYNC_INDEX_KEY, &sync_index.to_string()).await
    }

    pub async fn save_total(&self, total: usize) -> Result<()> {
        self.write(TOTAL_KEY, &total.to_string()).await
    }

    pub async fn save(&self, cursor: &SyncCursor) -> Result<()> {
        self.write(
            SINCE_KEY,
            &cursor.since.to_rfc3339_opts(SecondsFormat::AutoSi, true),
        )
        .await?;
        self.save_index(cursor.sync_index).await?;
        self.save_total(cursor.total_result_count).await
    }

    pub async fn reset(&self) -> Result<()> {
        for key in [SINCE_KEY, SYNC_INDEX_KEY, TOTAL_KEY] {
            self.options
                .delete_option(key)
                .await
                .with_context(|| format!("deleting {key}"))?;
        }
        Ok(())
    }

    async fn read(&self, key: &str) -> Result<Option<String>> {
        self.options
            .get_option(key)
            .await
            .with_context(|| format!("reading {key}"))
    }

    async fn read_count(&self, key: &str) -> Result<usize> {
        Ok(self
            .read(key)
            .await?
            .and_then(|raw| raw.trim().parse().ok())
            .unwrap_or(0))
    }

    async fn write(&self, key: &str, value: &str) -> Result<()> {
        self.options
            .set_option(key, value)
            .await
            .with_context(|| format!("writing {key}"))
    }
}
