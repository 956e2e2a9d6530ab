use std::time::Duration;

use anyhow::{Context, Result};
use castsync_storage::OptionStore;
use tracing::warn;

pub const SYNC_LOCK_KEY: &str = "sync_lock";
pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(5 * 60);

/// Advisory single-process lock held in an expiring transient.
pub struct SyncLock<'a, O: ?Sized> {
    options: &'a O,
    ttl: Duration,
}

impl<'a, O: OptionStore + ?Sized> SyncLock<'a, O> {
    pub fn new(options: &'a O, ttl: Duration) -> Self {
        Self { options, ttl }
    }

    /// Returns false when another holder's transient has not yet expired.
    pub async fn acquire(&self, holder: &str) -> Result<bool> {
        self.options
            .add_transient(SYNC_LOCK_KEY, holder, self.ttl)
            .await
            .context("acquiring sync lock")
    }

    /// Failures are logged; the ttl bounds how long a stuck lock can block.
    pub async fn release(&self) {
        if let Err(err) = self.options.delete_transient(SYNC_LOCK_KEY).await {
            warn!(%err, "failed to release sync lock");
        }
    }
}
