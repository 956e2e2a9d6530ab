//! Sync cycle orchestration: lock, reference collections, show batch, schedule prune, orphan audit.

pub mod config;
pub mod cursor;
pub mod gate;
pub mod lock;
pub mod orphan;
pub mod schedule;
pub mod shows;
pub mod upsert;

#[cfg(test)]
mod testing;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use castsync_api::{CatalogSource, HttpCatalog, ScheduleWindow};
use castsync_core::{SyncCursor, ThumbnailMode};
use castsync_storage::{
    AttachmentStore, ContentStore, OptionStore, PgStore, ResourceFetcher, ScheduleTable,
};
use chrono::{DateTime, FixedOffset, Utc};
use serde::Serialize;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub use config::SyncConfig;
pub use cursor::CursorStore;
pub use gate::{hash_keys, ChangeGate};
pub use lock::SyncLock;
pub use orphan::{OrphanDetector, OrphanReport};
pub use schedule::ReconcileReport;
pub use shows::{ReferenceData, ShowPass, ShowSync, ShowSyncSettings};

pub const CRATE_NAME: &str = "castsync-sync";

/// Everything the engine persists through.
pub trait SyncStore: ContentStore + ScheduleTable + OptionStore {}

impl<T: ContentStore + ScheduleTable + OptionStore + ?Sized> SyncStore for T {}

#[derive(Debug, Clone, Copy)]
pub struct EngineSettings {
    pub batch_size: usize,
    pub thumbnail_mode: ThumbnailMode,
    pub site_offset: FixedOffset,
    pub schedule_window_days: u32,
    pub lock_ttl: Duration,
}

impl EngineSettings {
    pub fn from_config(config: &SyncConfig) -> Result<Self> {
        Ok(Self {
            batch_size: config.batch_size.max(1),
            thumbnail_mode: config.thumbnail_mode,
            site_offset: config.site_offset()?,
            schedule_window_days: config.schedule_window_days,
            lock_ttl: config.lock_ttl(),
        })
    }

    fn show_settings(&self) -> ShowSyncSettings {
        ShowSyncSettings {
            batch_size: self.batch_size,
            thumbnail_mode: self.thumbnail_mode,
            site_offset: self.site_offset,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CycleSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub channels: usize,
    pub categories_changed: bool,
    pub projects_changed: bool,
    pub producers_changed: bool,
    pub custom_taxonomies: usize,
    pub shows_processed: usize,
    pub cursor: SyncCursor,
    pub rolled_over: bool,
    /// `None` when the schedule request failed and reconciliation was skipped.
    pub schedule: Option<ReconcileReport>,
    pub orphans: Option<OrphanReport>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CycleOutcome {
    /// Another cycle held the lock; nothing was fetched or written.
    Skipped,
    Completed(Box<CycleSummary>),
    Failed { run_id: Uuid, error: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncStatus {
    pub cursor: SyncCursor,
    pub hashes: Vec<(String, Option<String>)>,
    pub last_orphan_check: Option<DateTime<Utc>>,
}

pub struct SyncEngine<S: ?Sized, C: ?Sized> {
    store: Arc<S>,
    catalog: Arc<C>,
    attachments: AttachmentStore,
    settings: EngineSettings,
}

impl<S, C> SyncEngine<S, C>
where
    S: SyncStore + ?Sized,
    C: CatalogSource + ?Sized,
{
    pub fn new(
        store: Arc<S>,
        catalog: Arc<C>,
        attachments: AttachmentStore,
        settings: EngineSettings,
    ) -> Self {
        Self {
            store,
            catalog,
            attachments,
            settings,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// One full cycle under the lock. Failures are logged and reported, never raised.
    pub async fn run_cycle(&self) -> CycleOutcome {
        let run_id = Uuid::new_v4();
        let span = info_span!("sync_cycle", %run_id);
        self.run_cycle_inner(run_id).instrument(span).await
    }

    async fn run_cycle_inner(&self, run_id: Uuid) -> CycleOutcome {
        let lock = SyncLock::new(&*self.store, self.settings.lock_ttl);
        match lock.acquire(&run_id.to_string()).await {
            Ok(true) => {}
            Ok(false) => {
                info!("sync already running; skipping cycle");
                return CycleOutcome::Skipped;
            }
            Err(err) => {
                error!(error = %format!("{err:#}"), "could not acquire sync lock");
                return CycleOutcome::Failed {
                    run_id,
                    error: format!("{err:#}"),
                };
            }
        }

        let started_at = Utc::now();
        let result = self.run_locked(run_id, started_at).await;
        lock.release().await;

        match result {
            Ok(mut summary) => {
                if summary.rolled_over {
                    summary.orphans = self.audit_orphans(false).await;
                }
                summary.finished_at = Utc::now();
                info!(
                    shows = summary.shows_processed,
                    sync_index = summary.cursor.sync_index,
                    total = summary.cursor.total_result_count,
                    rolled_over = summary.rolled_over,
                    "sync cycle complete"
                );
                CycleOutcome::Completed(Box::new(summary))
            }
            Err(err) => {
                error!(error = %format!("{err:#}"), "sync cycle failed");
                CycleOutcome::Failed {
                    run_id,
                    error: format!("{err:#}"),
                }
            }
        }
    }

    async fn run_locked(&self, run_id: Uuid, started_at: DateTime<Utc>) -> Result<CycleSummary> {
        let store = &*self.store;
        let catalog = &*self.catalog;
        let gate = ChangeGate::new(store);

        let channels = catalog.channels().await;
        let live_streams = catalog.live_streams().await;
        upsert::upsert_channels(store, &channels.items, &live_streams.items).await?;

        let categories = catalog.categories().await;
        let categories_changed = gate
            .should_process(&categories.raw, hash_keys::CATEGORIES)
            .await?;
        if categories_changed {
            upsert::upsert_categories(store, &categories.items).await?;
            gate.commit(&categories.raw, hash_keys::CATEGORIES).await?;
        }

        let projects = catalog.projects().await;
        let projects_changed = gate
            .should_process(&projects.raw, hash_keys::PROJECTS)
            .await?;
        if projects_changed {
            upsert::upsert_projects(store, &projects.items).await?;
            gate.commit(&projects.raw, hash_keys::PROJECTS).await?;
        }

        let producers = catalog.producers().await;
        let producers_changed = gate
            .should_process(&producers.raw, hash_keys::PRODUCERS)
            .await?;
        if producers_changed {
            upsert::upsert_producers(store, &producers.items).await?;
            gate.commit(&producers.raw, hash_keys::PRODUCERS).await?;
        }

        let show_fields = catalog.show_fields().await;
        let custom_taxonomies =
            upsert::register_custom_field_taxonomies(store, &show_fields.items).await?;

        let refs = ReferenceData {
            producers: &producers.items,
            projects: &projects.items,
            categories: &categories.items,
            show_fields: &show_fields.items,
            custom_taxonomies: &custom_taxonomies,
        };
        let cursor = CursorStore::new(store).load().await?;
        let pass = ShowSync::new(store, catalog, &self.attachments, self.settings.show_settings())
            .run(cursor, &refs)
            .await?;

        let today = Utc::now().with_timezone(&self.settings.site_offset).date_naive();
        let window = ScheduleWindow::rolling(today, self.settings.schedule_window_days);
        let schedule = match catalog.schedule_items(window).await {
            Some(payload) => {
                Some(schedule::reconcile(store, &payload, self.settings.site_offset).await?)
            }
            None => {
                warn!(start = %window.start, end = %window.end, "schedule fetch failed; rows left as they are");
                None
            }
        };

        Ok(CycleSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            channels: channels.items.len(),
            categories_changed,
            projects_changed,
            producers_changed,
            custom_taxonomies: custom_taxonomies.len(),
            shows_processed: pass.processed,
            cursor: pass.cursor,
            rolled_over: pass.rolled_over,
            schedule,
            orphans: None,
        })
    }

    /// Orphan audit; `force` ignores the once-a-day throttle. Errors are logged.
    pub async fn audit_orphans(&self, force: bool) -> Option<OrphanReport> {
        let detector = OrphanDetector::new(&*self.store, &*self.catalog);
        let now = Utc::now();
        let result = if force {
            detector.run(now).await
        } else {
            detector.run_if_due(now).await
        };
        result.unwrap_or_else(|err| {
            error!(error = %format!("{err:#}"), "orphan check failed");
            None
        })
    }

    pub async fn status(&self) -> Result<SyncStatus> {
        let store = &*self.store;
        let cursor = CursorStore::new(store).load().await?;
        let mut hashes = Vec::with_capacity(hash_keys::ALL.len());
        for key in hash_keys::ALL {
            let value = store
                .get_option(key)
                .await
                .with_context(|| format!("reading {key}"))?;
            hashes.push((key.to_string(), value));
        }
        let last_orphan_check = OrphanDetector::new(store, &*self.catalog).last_run().await?;
        Ok(SyncStatus {
            cursor,
            hashes,
            last_orphan_check,
        })
    }

    /// Clears the cursor and collection hashes so the next cycle re-syncs everything.
    pub async fn reset_cursor(&self) -> Result<()> {
        let store = &*self.store;
        CursorStore::new(store).reset().await?;
        for key in hash_keys::ALL {
            store
                .delete_option(key)
                .await
                .with_context(|| format!("deleting {key}"))?;
        }
        info!("sync cursor and collection hashes reset");
        Ok(())
    }
}

/// Runs `run_cycle` on `cron` until the returned scheduler is shut down.
pub async fn build_scheduler<S, C>(engine: Arc<SyncEngine<S, C>>, cron: String) -> Result<JobScheduler>
where
    S: SyncStore + Send + Sync + 'static,
    C: CatalogSource + Send + Sync + 'static,
{
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let job = Job::new_async(&cron, move |_uuid, _l| {
        let engine = Arc::clone(&engine);
        Box::pin(async move {
            let outcome = engine.run_cycle().await;
            if let CycleOutcome::Failed { run_id, error } = outcome {
                warn!(%run_id, %error, "scheduled sync cycle failed");
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(sched)
}

/// `None` unless `scheduler_enabled` is set; otherwise a scheduler on `sync_cron`.
pub async fn maybe_build_scheduler<S, C>(
    engine: Arc<SyncEngine<S, C>>,
    config: &SyncConfig,
) -> Result<Option<JobScheduler>>
where
    S: SyncStore + Send + Sync + 'static,
    C: CatalogSource + Send + Sync + 'static,
{
    if !config.scheduler_enabled {
        return Ok(None);
    }
    build_scheduler(engine, config.sync_cron.clone()).await.map(Some)
}

pub type PgEngine = SyncEngine<PgStore, HttpCatalog>;

/// Postgres store plus HTTP catalog, wired from `config`.
pub async fn engine_from_config(config: &SyncConfig) -> Result<PgEngine> {
    let settings = EngineSettings::from_config(config)?;
    let store = PgStore::connect(&config.database_url, 5)
        .await
        .context("connecting to database")?;
    let fetcher = ResourceFetcher::new(config.http_client_config())?;
    let catalog = HttpCatalog::new(config.server_url.clone(), fetcher);
    Ok(SyncEngine::new(
        Arc::new(store),
        Arc::new(catalog),
        AttachmentStore::new(config.attachments_dir.clone()),
        settings,
    ))
}

pub async fn run_sync_once_from_env() -> Result<CycleOutcome> {
    let config = SyncConfig::load()?;
    let engine = engine_from_config(&config).await?;
    Ok(engine.run_cycle().await)
}

#[cfg(test)]
mod tests {
    use castsync_core::{meta, RecordKind, CATEGORY_TAXONOMY};
    use castsync_storage::MemoryStore;
    use serde_json::json;

    use super::*;
    use crate::testing::ScriptedCatalog;

    struct Harness {
        store: Arc<MemoryStore>,
        catalog: Arc<ScriptedCatalog>,
        engine: SyncEngine<MemoryStore, ScriptedCatalog>,
        _dir: tempfile::TempDir,
    }

    fn harness() -> Harness {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(MemoryStore::new());
        let catalog = Arc::new(ScriptedCatalog::default());
        let settings = EngineSettings {
            batch_size: 100,
            thumbnail_mode: ThumbnailMode::Remote,
            site_offset: FixedOffset::east_opt(0).expect("offset"),
            schedule_window_days: 14,
            lock_ttl: lock::DEFAULT_LOCK_TTL,
        };
        let engine = SyncEngine::new(
            Arc::clone(&store),
            Arc::clone(&catalog),
            AttachmentStore::new(dir.path()),
            settings,
        );
        Harness {
            store,
            catalog,
            engine,
            _dir: dir,
        }
    }

    #[tokio::test]
    async fn disabled_scheduler_is_not_built() {
        let h = harness();
        let config = SyncConfig::default();
        assert!(!config.scheduler_enabled);
        let sched = maybe_build_scheduler(Arc::new(h.engine), &config)
            .await
            .expect("scheduler");
        assert!(sched.is_none());
        assert_eq!(h.catalog.requests().await, 0);
    }

    fn completed(outcome: CycleOutcome) -> CycleSummary {
        match outcome {
            CycleOutcome::Completed(summary) => *summary,
            other => panic!("expected completed cycle, got {other:?}"),
        }
    }

    async fn script_catalog(catalog: &ScriptedCatalog) {
        catalog
            .set_collection("channels", vec![json!({"id": 1, "name": "Channel 1", "liveStreams": [5]})])
            .await;
        catalog
            .set_collection("liveStreams", vec![json!({"id": 5, "embedCode": "<live>"})])
            .await;
        catalog
            .set_collection("categories", vec![json!({"id": 3, "name": "Government"})])
            .await;
        catalog
            .set_collection("showFields", vec![json!({"id": 8, "name": "Topics", "type": "tag"})])
            .await;
        catalog.set_changed_ids(vec![42]).await;
        catalog
            .add_show(json!({
                "id": 42,
                "title": "Council",
                "category": 3,
                "lastModified": "2024-01-05T00:00:00Z",
                "customFields": [{"showField": 8, "value": "Budget"}]
            }))
            .await;
        catalog
            .set_schedule(Some(vec![
                json!({"id": 900, "show": 42, "channel": 1, "runDateTime": "2024-03-01T10:00:00"}),
            ]))
            .await;
        catalog.set_all_ids(Some(vec![42])).await;
    }

    #[tokio::test]
    async fn full_cycle_syncs_everything_and_rolls_over() {
        let h = harness();
        script_catalog(&h.catalog).await;

        let summary = completed(h.engine.run_cycle().await);
        assert_eq!(summary.channels, 1);
        assert!(summary.categories_changed);
        assert_eq!(summary.custom_taxonomies, 1);
        assert_eq!(summary.shows_processed, 1);
        assert!(summary.rolled_over);
        assert_eq!(summary.cursor.since.to_rfc3339(), "2024-01-05T00:00:00+00:00");
        assert_eq!(summary.schedule.as_ref().map(|s| s.inserted), Some(1));
        assert_eq!(summary.orphans.as_ref().map(|o| o.orphans.len()), Some(0));

        let channel = &h.store.records_of(RecordKind::Channel).await[0];
        assert_eq!(channel.meta[meta::LIVE_EMBED_CODE], "<live>");

        let show = &h.store.records_of(RecordKind::Show).await[0];
        assert_eq!(show.meta[meta::CATEGORY], "Government");
        assert_eq!(
            h.store.terms_of(show.id, CATEGORY_TAXONOMY).await,
            vec!["Government".to_string()]
        );
        assert_eq!(
            h.store.terms_of(show.id, "custom_field_8").await,
            vec!["Budget".to_string()]
        );

        let row = &h.store.schedule_rows().await[0];
        assert_eq!(row.show_post_id, show.id);
        assert_eq!(row.channel_post_id, Some(channel.id));

        let released = h
            .engine
            .store()
            .add_transient(lock::SYNC_LOCK_KEY, "probe", lock::DEFAULT_LOCK_TTL)
            .await
            .expect("lock");
        assert!(released);
    }

    #[tokio::test]
    async fn held_lock_means_no_requests_and_no_writes() {
        let h = harness();
        script_catalog(&h.catalog).await;
        h.store
            .add_transient(lock::SYNC_LOCK_KEY, "other-run", lock::DEFAULT_LOCK_TTL)
            .await
            .expect("lock");
        let content = h.store.content_writes().await;
        let options = h.store.option_writes().await;

        assert!(matches!(h.engine.run_cycle().await, CycleOutcome::Skipped));
        assert_eq!(h.catalog.requests().await, 0);
        assert_eq!(h.store.content_writes().await, content);
        assert_eq!(h.store.option_writes().await, options);
    }

    #[tokio::test]
    async fn unchanged_gated_collections_are_skipped_on_second_cycle() {
        let h = harness();
        script_catalog(&h.catalog).await;
        completed(h.engine.run_cycle().await);

        let second = completed(h.engine.run_cycle().await);
        assert!(!second.categories_changed);
        assert!(!second.projects_changed);
        assert!(!second.producers_changed);
        assert_eq!(second.schedule.map(|s| s.changed), Some(false));
        assert!(second.orphans.is_none());
    }

    #[tokio::test]
    async fn failed_schedule_fetch_keeps_existing_rows() {
        let h = harness();
        script_catalog(&h.catalog).await;
        completed(h.engine.run_cycle().await);
        assert_eq!(h.store.schedule_rows().await.len(), 1);

        h.catalog.set_schedule(None).await;
        let summary = completed(h.engine.run_cycle().await);
        assert!(summary.schedule.is_none());
        assert_eq!(h.store.schedule_rows().await.len(), 1);
    }

    #[tokio::test]
    async fn status_and_reset_cursor() {
        let h = harness();
        script_catalog(&h.catalog).await;
        completed(h.engine.run_cycle().await);

        let status = h.engine.status().await.expect("status");
        assert_eq!(status.cursor.since.to_rfc3339(), "2024-01-05T00:00:00+00:00");
        assert!(status.last_orphan_check.is_some());
        assert!(status
            .hashes
            .iter()
            .any(|(key, value)| key == hash_keys::SCHEDULE && value.is_some()));

        h.engine.reset_cursor().await.expect("reset");
        let status = h.engine.status().await.expect("status");
        assert_eq!(status.cursor, SyncCursor::default());
        assert!(status.hashes.iter().all(|(_, value)| value.is_none()));
    }
}
