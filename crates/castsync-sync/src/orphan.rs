use std::collections::BTreeSet;

use anyhow::{Context, Result};
use castsync_api::CatalogSource;
use castsync_core::{RecordId, RecordKind, RemoteId};
use castsync_storage::{ContentStore, OptionStore};
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use serde::Serialize;
use tracing::{info, warn};

pub const ORPHAN_CHECK_KEY: &str = "orphan_check_at";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OrphanReport {
    pub remote_shows: usize,
    pub local_shows: usize,
    /// Local `(record id, remote show id)` pairs the catalog no longer lists.
    pub orphans: Vec<(RecordId, RemoteId)>,
}

/// Read-only audit of local shows missing from the remote catalog.
pub struct OrphanDetector<'a, S: ?Sized, C: ?Sized> {
    store: &'a S,
    catalog: &'a C,
    interval: Duration,
}

impl<'a, S, C> OrphanDetector<'a, S, C>
where
    S: ContentStore + OptionStore + ?Sized,
    C: CatalogSource + ?Sized,
{
    pub fn new(store: &'a S, catalog: &'a C) -> Self {
        Self {
            store,
            catalog,
            interval: Duration::hours(24),
        }
    }

    pub async fn last_run(&self) -> Result<Option<DateTime<Utc>>> {
        Ok(self
            .store
            .get_option(ORPHAN_CHECK_KEY)
            .await
            .context("reading orphan check timestamp")?
            .and_then(|raw| DateTime::parse_from_rfc3339(&raw).ok())
            .map(|dt| dt.with_timezone(&Utc)))
    }

    /// Runs the audit unless one completed within the last 24 hours.
    pub async fn run_if_due(&self, now: DateTime<Utc>) -> Result<Option<OrphanReport>> {
        if let Some(last) = self.last_run().await? {
            if now - last < self.interval {
                info!(%last, "orphan check ran recently; skipping");
                return Ok(None);
            }
        }
        self.run(now).await
    }

    /// Returns `None` when the remote id listing could not be fetched.
    pub async fn run(&self, now: DateTime<Utc>) -> Result<Option<OrphanReport>> {
        let Some(remote_ids) = self.catalog.all_show_ids().await else {
            warn!("remote show id listing failed; orphan check postponed");
            return Ok(None);
        };
        let remote: BTreeSet<RemoteId> = remote_ids.into_iter().collect();
        let local = self
            .store
            .external_ids(RecordKind::Show)
            .await
            .context("listing local shows")?;

        let orphans: Vec<(RecordId, RemoteId)> = local
            .iter()
            .copied()
            .filter(|(_, remote_id)| !remote.contains(remote_id))
            .collect();
        for (record_id, remote_show_id) in &orphans {
            warn!(record_id, remote_show_id, "local show no longer exists remotely");
        }

        self.store
            .set_option(
                ORPHAN_CHECK_KEY,
                &now.to_rfc3339_opts(SecondsFormat::Secs, true),
            )
            .await
            .context("writing orphan check timestamp")?;
        info!(
            remote = remote.len(),
            local = local.len(),
            orphans = orphans.len(),
            "orphan check complete"
        );
        Ok(Some(OrphanReport {
            remote_shows: remote.len(),
            local_shows: local.len(),
            orphans,
        }))
    }
}

#[cfg(test)]
mod tests {
    use castsync_core::RecordDraft;
    use castsync_storage::MemoryStore;

    use super::*;
    use crate::testing::ScriptedCatalog;

    async fn seed(store: &MemoryStore, external_id: RemoteId) -> RecordId {
        store
            .insert_record(&RecordDraft {
                kind: RecordKind::Show,
                external_id,
                title: format!("Show {external_id}"),
                body: String::new(),
                created_at: None,
            })
            .await
            .expect("seed")
    }

    #[tokio::test]
    async fn reports_local_shows_missing_remotely_without_deleting() {
        let store = MemoryStore::new();
        let catalog = ScriptedCatalog::default();
        seed(&store, 1).await;
        let gone = seed(&store, 2).await;
        catalog.set_all_ids(Some(vec![1, 3])).await;

        let now = "2024-03-01T00:00:00Z".parse().expect("now");
        let report = OrphanDetector::new(&store, &catalog)
            .run_if_due(now)
            .await
            .expect("audit")
            .expect("report");

        assert_eq!(report.orphans, vec![(gone, 2)]);
        assert_eq!(report.remote_shows, 2);
        assert_eq!(store.records_of(RecordKind::Show).await.len(), 2);
    }

    #[tokio::test]
    async fn runs_at_most_once_per_day() {
        let store = MemoryStore::new();
        let catalog = ScriptedCatalog::default();
        catalog.set_all_ids(Some(Vec::new())).await;
        let detector = OrphanDetector::new(&store, &catalog);

        let first: DateTime<Utc> = "2024-03-01T00:00:00Z".parse().expect("now");
        assert!(detector.run_if_due(first).await.expect("first").is_some());
        assert!(detector
            .run_if_due(first + Duration::hours(23))
            .await
            .expect("throttled")
            .is_none());
        assert!(detector
            .run_if_due(first + Duration::hours(24))
            .await
            .expect("due")
            .is_some());
        assert_eq!(catalog.requests().await, 2);
    }

    #[tokio::test]
    async fn failed_listing_does_not_stamp_the_check() {
        let store = MemoryStore::new();
        let catalog = ScriptedCatalog::default();
        let detector = OrphanDetector::new(&store, &catalog);
        let now = "2024-03-01T00:00:00Z".parse().expect("now");
        assert!(detector.run_if_due(now).await.expect("audit").is_none());
        assert!(detector.last_run().await.expect("last").is_none());
    }
}
