//! Resumable batch walk over the shows changed since the cursor's high-water mark.

use std::collections::{BTreeMap, BTreeSet};

use anyhow::{Context, Result};
use castsync_api::{CatalogSource, ShowBatch};
use castsync_core::{
    custom_field_terms, meta, normalize_term_name, Category, Producer, Project, RecordDraft,
    RecordId, RecordKind, RemoteRef, Show, ShowField, SyncCursor, ThumbnailMode, Vod,
    CATEGORY_TAXONOMY, PRODUCER_TAXONOMY, PROJECT_TAXONOMY,
};
use castsync_storage::{
    extension_from_url, is_valid_remote_url, AttachmentStore, ContentStore, OptionStore,
};
use chrono::{FixedOffset, SecondsFormat};
use tracing::{debug, info, warn};

use crate::cursor::CursorStore;
use crate::upsert::{find_by_id, upsert_record};

/// Reference collections the show upserter resolves ids against.
#[derive(Debug, Clone, Copy)]
pub struct ReferenceData<'a> {
    pub producers: &'a [Producer],
    pub projects: &'a [Project],
    pub categories: &'a [Category],
    pub show_fields: &'a [ShowField],
    pub custom_taxonomies: &'a BTreeSet<String>,
}

#[derive(Debug, Clone, Copy)]
pub struct ShowSyncSettings {
    pub batch_size: usize,
    pub thumbnail_mode: ThumbnailMode,
    pub site_offset: FixedOffset,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ShowPass {
    pub cursor: SyncCursor,
    pub processed: usize,
    pub rolled_over: bool,
}

pub struct ShowSync<'a, S: ?Sized, C: ?Sized> {
    store: &'a S,
    catalog: &'a C,
    attachments: &'a AttachmentStore,
    settings: ShowSyncSettings,
}

impl<'a, S, C> ShowSync<'a, S, C>
where
    S: ContentStore + OptionStore + ?Sized,
    C: CatalogSource + ?Sized,
{
    pub fn new(
        store: &'a S,
        catalog: &'a C,
        attachments: &'a AttachmentStore,
        settings: ShowSyncSettings,
    ) -> Self {
        Self {
            store,
            catalog,
            attachments,
            settings,
        }
    }

    /// Processes the next batch after `cursor`, persisting progress after every show.
    pub async fn run(&self, mut cursor: SyncCursor, refs: &ReferenceData<'_>) -> Result<ShowPass> {
        let cursors = CursorStore::new(self.store);
        let mut pass = ShowPass {
            cursor,
            processed: 0,
            rolled_over: false,
        };

        let Some(ids) = self.catalog.changed_show_ids(cursor.since).await else {
            warn!(since = %cursor.since, "changed-show search failed; cursor left in place");
            return Ok(pass);
        };

        let total = ids.len();
        if cursor.sync_index >= total {
            cursor.sync_index = 0;
        }
        cursor.total_result_count = total;
        cursors.save_total(total).await?;
        pass.cursor = cursor;

        let end = (cursor.sync_index + self.settings.batch_size).min(total);
        let batch_ids = &ids[cursor.sync_index..end];
        if batch_ids.is_empty() {
            debug!(since = %cursor.since, "no changed shows");
            return Ok(pass);
        }
        info!(
            since = %cursor.since,
            offset = cursor.sync_index,
            batch = batch_ids.len(),
            total,
            "syncing changed shows"
        );

        let Some(batch) = self.catalog.shows_by_ids(batch_ids).await else {
            warn!(offset = cursor.sync_index, "show batch fetch failed; retrying next run");
            return Ok(pass);
        };

        // Every requested id moves the index, decoded or not.
        let mut last_synced: Option<&Show> = None;
        for &show_id in batch_ids {
            match batch.shows.iter().find(|show| show.id == show_id) {
                Some(show) => {
                    self.upsert_show(show, &batch, refs).await?;
                    pass.processed += 1;
                    last_synced = Some(show);
                }
                None => warn!(show_id, "show missing or undecodable in batch; skipping"),
            }
            cursor.sync_index += 1;
            cursors.save_index(cursor.sync_index).await?;
        }

        if cursor.sync_index >= cursor.total_result_count {
            match last_synced.map(|show| (show.id, show.last_modified_at(self.settings.site_offset))) {
                Some((_, Some(last_modified))) if last_modified >= cursor.since => {
                    cursor = SyncCursor {
                        since: last_modified,
                        sync_index: 0,
                        total_result_count: 0,
                    };
                    cursors.save(&cursor).await?;
                    pass.rolled_over = true;
                    info!(since = %cursor.since, "change-set complete; cursor advanced");
                }
                Some((show_id, Some(last_modified))) => warn!(
                    show_id,
                    %last_modified,
                    since = %cursor.since,
                    "last show predates cursor; not advancing"
                ),
                Some((show_id, None)) => {
                    warn!(show_id, "last show has no lastModified; not advancing")
                }
                None => warn!("no show in the final batch decoded; not advancing"),
            }
        }

        pass.cursor = cursor;
        Ok(pass)
    }

    /// Writes one show and everything hanging off it. Returns the local record id.
    pub async fn upsert_show(
        &self,
        show: &Show,
        batch: &ShowBatch,
        refs: &ReferenceData<'_>,
    ) -> Result<RecordId> {
        let offset = self.settings.site_offset;
        let draft = RecordDraft {
            kind: RecordKind::Show,
            external_id: show.id,
            title: show.display_title().to_string(),
            body: show.comments.clone().unwrap_or_default(),
            created_at: show.event_date_at(offset),
        };
        let record = upsert_record(self.store, &draft).await?;

        if let Some(vod) = first_vod(show, &batch.vods) {
            self.set_meta(record, meta::VOD_URL, vod.url.as_deref().unwrap_or_default())
                .await?;
            self.set_meta(
                record,
                meta::VOD_EMBED,
                vod.embed_code.as_deref().unwrap_or_default(),
            )
            .await?;
        }

        let producer = show
            .producer
            .and_then(|id| find_by_id(refs.producers, id))
            .map(|p| (p.id, normalize_term_name(&p.name)));
        self.assign_reference(record, producer, meta::PRODUCER, meta::PRODUCER_ID, PRODUCER_TAXONOMY)
            .await?;

        let project = show
            .project
            .and_then(|id| find_by_id(refs.projects, id))
            .map(|p| (p.id, normalize_term_name(&p.name)));
        self.assign_reference(record, project, meta::PROJECT, meta::PROJECT_ID, PROJECT_TAXONOMY)
            .await?;

        let category = show
            .category
            .and_then(|id| find_by_id(refs.categories, id))
            .map(|c| (c.id, c.name.trim().to_string()));
        self.assign_reference(record, category, meta::CATEGORY, meta::CATEGORY_ID, CATEGORY_TAXONOMY)
            .await?;

        for (index, value) in show.custom_slots().iter().enumerate() {
            self.set_meta(record, &meta::custom_slot(index + 1), value).await?;
        }

        let mut taxonomy_terms: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for field_value in &show.custom_fields {
            self.set_meta(
                record,
                &meta::custom_field(field_value.show_field),
                &field_value.display_value(),
            )
            .await?;

            let Some(field) = find_by_id(refs.show_fields, field_value.show_field) else {
                continue;
            };
            let taxonomy = field.taxonomy_name();
            if field.is_taxonomy() && refs.custom_taxonomies.contains(&taxonomy) {
                let terms = taxonomy_terms.entry(taxonomy).or_default();
                for term in custom_field_terms(&field_value.value) {
                    if !terms.contains(&term) {
                        terms.push(term);
                    }
                }
            }
        }
        for (taxonomy, terms) in &taxonomy_terms {
            self.store
                .assign_terms(record, taxonomy, terms)
                .await
                .with_context(|| format!("assigning {taxonomy} to show {}", show.id))?;
        }

        let runtime = runtime_seconds(show, batch);
        if let Some(event_date) = show.event_date_at(offset) {
            self.set_meta(
                record,
                meta::EVENT_DATE,
                &event_date.to_rfc3339_opts(SecondsFormat::Secs, true),
            )
            .await?;
        }
        if let Some(location) = show.location {
            self.set_meta(record, meta::LOCATION_ID, &location.to_string())
                .await?;
        }
        if let Some(last_modified) = show.last_modified_at(offset) {
            self.set_meta(
                record,
                meta::LAST_MODIFIED,
                &last_modified.to_rfc3339_opts(SecondsFormat::AutoSi, true),
            )
            .await?;
        }
        self.set_meta(record, meta::RUNTIME_SECONDS, &runtime.to_string())
            .await?;

        self.sync_thumbnail(record, show).await?;
        debug!(show_id = show.id, record, runtime, "show upserted");
        Ok(record)
    }

    async fn assign_reference(
        &self,
        record: RecordId,
        resolved: Option<(i64, String)>,
        name_key: &str,
        id_key: &str,
        taxonomy: &str,
    ) -> Result<()> {
        let Some((id, name)) = resolved else {
            return Ok(());
        };
        self.set_meta(record, name_key, &name).await?;
        self.set_meta(record, id_key, &id.to_string()).await?;
        if !name.is_empty() {
            self.store
                .assign_terms(record, taxonomy, &[name])
                .await
                .with_context(|| format!("assigning {taxonomy} to record {record}"))?;
        }
        Ok(())
    }

    async fn sync_thumbnail(&self, record: RecordId, show: &Show) -> Result<()> {
        let Some(url) = show.thumbnail_url() else {
            return Ok(());
        };
        if !is_valid_remote_url(url) {
            warn!(show_id = show.id, url, "skipping invalid thumbnail url");
            return Ok(());
        }

        match self.settings.thumbnail_mode {
            ThumbnailMode::Remote => {
                self.set_meta(record, meta::THUMBNAIL_URL, url).await?;
                self.delete_meta(record, meta::THUMBNAIL_ID).await
            }
            ThumbnailMode::Local => {
                let current = self
                    .store
                    .attachment_for(record)
                    .await
                    .with_context(|| format!("reading attachment of record {record}"))?;
                if current.is_some_and(|a| a.source_url == url) {
                    return self.delete_meta(record, meta::THUMBNAIL_URL).await;
                }

                let Some(bytes) = self.catalog.download(url).await else {
                    warn!(show_id = show.id, url, "thumbnail download failed");
                    return Ok(());
                };
                let stored = self
                    .attachments
                    .store_bytes(show.id, &extension_from_url(url), &bytes)
                    .await?;
                let relative_path = stored.relative_path.to_string_lossy().replace('\\', "/");
                let attachment = self
                    .store
                    .attach_file(record, url, &relative_path, &stored.content_hash)
                    .await
                    .with_context(|| format!("attaching thumbnail to record {record}"))?;
                self.set_meta(record, meta::THUMBNAIL_ID, &attachment.to_string())
                    .await?;
                self.delete_meta(record, meta::THUMBNAIL_URL).await
            }
        }
    }

    async fn set_meta(&self, record: RecordId, key: &str, value: &str) -> Result<()> {
        self.store
            .upsert_meta(record, key, value)
            .await
            .with_context(|| format!("writing {key} on record {record}"))
    }

    async fn delete_meta(&self, record: RecordId, key: &str) -> Result<()> {
        self.store
            .delete_meta(record, key)
            .await
            .with_context(|| format!("deleting {key} on record {record}"))
    }
}

fn first_vod<'b>(show: &'b Show, sideloaded: &'b [Vod]) -> Option<&'b Vod> {
    match show.vods.first()? {
        RemoteRef::Inline(vod) => Some(vod),
        RemoteRef::Id(id) => find_by_id(sideloaded, *id),
    }
}

/// Sum of the lengths of the show's reels; references missing from the payload are skipped.
pub fn runtime_seconds(show: &Show, batch: &ShowBatch) -> i64 {
    show.reels
        .iter()
        .filter_map(|reel| match reel {
            RemoteRef::Inline(reel) => Some(reel.length),
            RemoteRef::Id(id) => {
                let found = find_by_id(&batch.reels, *id).map(|r| r.length);
                if found.is_none() {
                    warn!(show_id = show.id, reel_id = id, "reel missing from payload");
                }
                found
            }
        })
        .sum()
}
