//! Upserters for the reference collections: channels and the three builtin taxonomies.

use std::collections::BTreeSet;

use anyhow::{Context, Result};
use castsync_core::{
    meta, normalize_term_name, Category, Channel, HasRemoteId, LiveStream, Producer, Project,
    RecordDraft, RecordKind, RecordId, RemoteId, ShowField, TermId, CATEGORY_TAXONOMY, PRODUCER_TAXONOMY,
    PROJECT_TAXONOMY,
};
use castsync_storage::ContentStore;
use tracing::{debug, info, warn};

/// Linear scan for the record with `id`.
pub fn find_by_id<T: HasRemoteId>(items: &[T], id: RemoteId) -> Option<&T> {
    items.iter().find(|item| item.remote_id() == id)
}

/// Updates the record matched by external id, or inserts it. Returns the local id.
pub async fn upsert_record<S>(store: &S, draft: &RecordDraft) -> Result<RecordId>
where
    S: ContentStore + ?Sized,
{
    let existing = store
        .find_record(draft.kind, draft.external_id)
        .await
        .with_context(|| format!("looking up {} {}", draft.kind, draft.external_id))?;
    match existing {
        Some(found) => {
            store
                .update_record(found.id, draft)
                .await
                .with_context(|| format!("updating {} {}", draft.kind, draft.external_id))?;
            Ok(found.id)
        }
        None => store
            .insert_record(draft)
            .await
            .with_context(|| format!("inserting {} {}", draft.kind, draft.external_id)),
    }
}

/// Channels are never gated: every pass rewrites the live embed from the first linked stream.
pub async fn upsert_channels<S>(
    store: &S,
    channels: &[Channel],
    live_streams: &[LiveStream],
) -> Result<usize>
where
    S: ContentStore + ?Sized,
{
    for channel in channels {
        let draft = RecordDraft {
            kind: RecordKind::Channel,
            external_id: channel.id,
            title: channel.name.clone(),
            body: String::new(),
            created_at: None,
        };
        let record = upsert_record(store, &draft).await?;

        let embed = channel
            .live_streams
            .first()
            .and_then(|id| find_by_id(live_streams, *id))
            .and_then(|stream| stream.embed_code.clone())
            .unwrap_or_default();
        store
            .upsert_meta(record, meta::LIVE_EMBED_CODE, &embed)
            .await
            .with_context(|| format!("writing live embed for channel {}", channel.id))?;
    }
    debug!(channels = channels.len(), "channels upserted");
    Ok(channels.len())
}

/// Create-only: existing category terms are left as they are.
pub async fn upsert_categories<S>(store: &S, categories: &[Category]) -> Result<usize>
where
    S: ContentStore + ?Sized,
{
    let mut created = 0;
    for category in categories {
        let name = category.name.trim();
        if name.is_empty() {
            continue;
        }
        if find_term(store, CATEGORY_TAXONOMY, name).await?.is_none() {
            store
                .create_term(CATEGORY_TAXONOMY, name, "")
                .await
                .with_context(|| format!("creating category {name:?}"))?;
            created += 1;
        }
    }
    info!(created, total = categories.len(), "categories synced");
    Ok(created)
}

/// Creates missing project terms and refreshes every description.
pub async fn upsert_projects<S>(store: &S, projects: &[Project]) -> Result<usize>
where
    S: ContentStore + ?Sized,
{
    for project in projects {
        let name = normalize_term_name(&project.name);
        if name.is_empty() {
            continue;
        }
        let description = project.description.as_deref().unwrap_or_default();
        match find_term(store, PROJECT_TAXONOMY, &name).await? {
            Some(term) => store
                .update_term_description(term, description)
                .await
                .with_context(|| format!("updating project {name:?}"))?,
            None => {
                store
                    .create_term(PROJECT_TAXONOMY, &name, description)
                    .await
                    .with_context(|| format!("creating project {name:?}"))?;
            }
        }
    }
    info!(total = projects.len(), "projects synced");
    Ok(projects.len())
}

/// Creates missing producer terms and rewrites their contact metadata.
pub async fn upsert_producers<S>(store: &S, producers: &[Producer]) -> Result<usize>
where
    S: ContentStore + ?Sized,
{
    let mut synced = 0;
    for producer in producers {
        let name = normalize_term_name(&producer.name);
        if name.is_empty() {
            warn!(producer_id = producer.id, "skipping producer without a name");
            continue;
        }
        let term = match find_term(store, PRODUCER_TAXONOMY, &name).await? {
            Some(term) => term,
            None => store
                .create_term(PRODUCER_TAXONOMY, &name, "")
                .await
                .with_context(|| format!("creating producer {name:?}"))?,
        };

        let producer_id = producer.id.to_string();
        let fields = [
            (meta::PRODUCER_ID, Some(producer_id.as_str())),
            (meta::CONTACT, producer.contact.as_deref()),
            (meta::ADDRESS, producer.address.as_deref()),
            (meta::PHONE_ONE, producer.phone_one.as_deref()),
            (meta::PHONE_TWO, producer.phone_two.as_deref()),
            (meta::EMAIL, producer.email.as_deref()),
            (meta::WEBSITE, producer.website.as_deref()),
            (meta::NOTES, producer.notes.as_deref()),
        ];
        for (key, value) in fields {
            store
                .upsert_term_meta(term, key, value.unwrap_or_default())
                .await
                .with_context(|| format!("writing {key} for producer {name:?}"))?;
        }
        synced += 1;
    }
    info!(synced, total = producers.len(), "producers synced");
    Ok(synced)
}

/// Registers a taxonomy for every tag/select field and returns the names now available.
pub async fn register_custom_field_taxonomies<S>(
    store: &S,
    fields: &[ShowField],
) -> Result<BTreeSet<String>>
where
    S: ContentStore + ?Sized,
{
    let mut available = BTreeSet::new();
    for field in fields.iter().filter(|f| f.is_taxonomy()) {
        let taxonomy = field.taxonomy_name();
        let label = if field.name.trim().is_empty() {
            taxonomy.clone()
        } else {
            field.name.trim().to_string()
        };
        if store
            .register_taxonomy(&taxonomy, &label)
            .await
            .with_context(|| format!("registering {taxonomy}"))?
        {
            info!(%taxonomy, %label, "registered custom field taxonomy");
        }
        available.insert(taxonomy);
    }
    Ok(available)
}

async fn find_term<S>(store: &S, taxonomy: &str, name: &str) -> Result<Option<TermId>>
where
    S: ContentStore + ?Sized,
{
    store
        .find_term(taxonomy, name)
        .await
        .with_context(|| format!("looking up {taxonomy} term {name:?}"))
}
