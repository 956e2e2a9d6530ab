use anyhow::{Context, Result};
use castsync_storage::{content_hash, OptionStore};
use serde_json::Value as JsonValue;
use tracing::info;

/// Option keys holding the last committed hash of each gated collection.
pub mod hash_keys {
    pub const SCHEDULE: &str = "hash_schedule";
    pub const CATEGORIES: &str = "hash_categories";
    pub const PROJECTS: &str = "hash_projects";
    pub const PRODUCERS: &str = "hash_producers";

    pub const ALL: [&str; 4] = [SCHEDULE, CATEGORIES, PROJECTS, PRODUCERS];
}

/// Skips a collection whose payload hashes to the value committed after its last processing.
pub struct ChangeGate<'a, O: ?Sized> {
    options: &'a O,
}

impl<'a, O: OptionStore + ?Sized> ChangeGate<'a, O> {
    pub fn new(options: &'a O) -> Self {
        Self { options }
    }

    pub async fn should_process(&self, collection: &[JsonValue], hash_key: &str) -> Result<bool> {
        let current = content_hash(collection);
        let stored = self
            .options
            .get_option(hash_key)
            .await
            .with_context(|| format!("reading {hash_key}"))?;
        if stored.as_deref() == Some(current.as_str()) {
            info!(hash_key, records = collection.len(), "collection unchanged; skipping");
            return Ok(false);
        }
        Ok(true)
    }

    pub async fn commit(&self, collection: &[JsonValue], hash_key: &str) -> Result<()> {
        self.options
            .set_option(hash_key, &content_hash(collection))
            .await
            .with_context(|| format!("writing {hash_key}"))
    }
}
