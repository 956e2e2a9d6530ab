//! In-process implementation of the store contracts, used by tests and dry runs.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use castsync_core::{
    Attachment, AttachmentId, RecordDraft, RecordId, RecordKind, RemoteId, ScheduleRow, TermId,
    CATEGORY_TAXONOMY, PRODUCER_TAXONOMY, PROJECT_TAXONOMY,
};
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::store::{
    ContentStore, OptionStore, RecordSummary, ScheduleTable, StoreError, StoreResult,
};

#[derive(Debug, Clone, PartialEq)]
pub struct MemoryRecord {
    pub id: RecordId,
    pub kind: RecordKind,
    pub external_id: RemoteId,
    pub title: String,
    pub body: String,
    pub status: String,
    pub created_at: Option<DateTime<Utc>>,
    pub meta: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MemoryTerm {
    pub id: TermId,
    pub taxonomy: String,
    pub name: String,
    pub description: String,
    pub meta: BTreeMap<String, String>,
}

#[derive(Debug, Default)]
struct MemoryState {
    next_id: i64,
    records: BTreeMap<RecordId, MemoryRecord>,
    terms: BTreeMap<TermId, MemoryTerm>,
    taxonomies: BTreeMap<String, String>,
    record_terms: BTreeMap<(RecordId, String), Vec<TermId>>,
    attachments: Vec<Attachment>,
    schedule: BTreeMap<RemoteId, ScheduleRow>,
    options: BTreeMap<String, String>,
    transients: BTreeMap<String, (String, DateTime<Utc>)>,
    content_writes: usize,
    option_writes: usize,
}

impl MemoryState {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn record_mut(&mut self, id: RecordId) -> StoreResult<&mut MemoryRecord> {
        self.records.get_mut(&id).ok_or(StoreError::RecordNotFound(id))
    }

    fn term_id(&self, taxonomy: &str, name: &str) -> Option<TermId> {
        self.terms
            .values()
            .find(|t| t.taxonomy == taxonomy && t.name == name)
            .map(|t| t.id)
    }

    fn insert_term(&mut self, taxonomy: &str, name: &str, description: &str) -> StoreResult<TermId> {
        if !self.taxonomies.contains_key(taxonomy) {
            return Err(StoreError::UnknownTaxonomy(taxonomy.to_string()));
        }
        if let Some(id) = self.term_id(taxonomy, name) {
            return Ok(id);
        }
        let id = self.next_id();
        self.terms.insert(
            id,
            MemoryTerm {
                id,
                taxonomy: taxonomy.to_string(),
                name: name.to_string(),
                description: description.to_string(),
                meta: BTreeMap::new(),
            },
        );
        self.content_writes += 1;
        Ok(id)
    }
}

/// Store contracts backed by in-process maps.
#[derive(Debug)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let mut state = MemoryState::default();
        for (name, label) in [
            (PRODUCER_TAXONOMY, "Producers"),
            (PROJECT_TAXONOMY, "Series"),
            (CATEGORY_TAXONOMY, "Categories"),
        ] {
            state.taxonomies.insert(name.to_string(), label.to_string());
        }
        Self {
            state: Mutex::new(state),
        }
    }

    /// Number of record, term, attachment and schedule mutations so far.
    pub async fn content_writes(&self) -> usize {
        self.state.lock().await.content_writes
    }

    pub async fn option_writes(&self) -> usize {
        self.state.lock().await.option_writes
    }

    pub async fn record(&self, id: RecordId) -> Option<MemoryRecord> {
        self.state.lock().await.records.get(&id).cloned()
    }

    pub async fn records_of(&self, kind: RecordKind) -> Vec<MemoryRecord> {
        self.state
            .lock()
            .await
            .records
            .values()
            .filter(|r| r.kind == kind)
            .cloned()
            .collect()
    }

    pub async fn term(&self, taxonomy: &str, name: &str) -> Option<MemoryTerm> {
        self.state
            .lock()
            .await
            .terms
            .values()
            .find(|t| t.taxonomy == taxonomy && t.name == name)
            .cloned()
    }

    pub async fn terms_of(&self, record: RecordId, taxonomy: &str) -> Vec<String> {
        let state = self.state.lock().await;
        state
            .record_terms
            .get(&(record, taxonomy.to_string()))
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| state.terms.get(id).map(|t| t.name.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub async fn attachments(&self) -> Vec<Attachment> {
        self.state.lock().await.attachments.clone()
    }

    pub async fn schedule_rows(&self) -> Vec<ScheduleRow> {
        self.state.lock().await.schedule.values().cloned().collect()
    }
}

#[async_trait]
impl ContentStore for MemoryStore {
    async fn find_record(
        &self,
        kind: RecordKind,
        external_id: RemoteId,
    ) -> StoreResult<Option<RecordSummary>> {
        let state = self.state.lock().await;
        Ok(state
            .records
            .values()
            .find(|r| r.kind == kind && r.external_id == external_id)
            .map(|r| RecordSummary {
                id: r.id,
                title: r.title.clone(),
            }))
    }

    async fn insert_record(&self, draft: &RecordDraft) -> StoreResult<RecordId> {
        let mut state = self.state.lock().await;
        let id = state.next_id();
        state.records.insert(
            id,
            MemoryRecord {
                id,
                kind: draft.kind,
                external_id: draft.external_id,
                title: draft.title.clone(),
                body: draft.body.clone(),
                status: "publish".to_string(),
                created_at: draft.created_at,
                meta: BTreeMap::new(),
            },
        );
        state.content_writes += 1;
        Ok(id)
    }

    async fn update_record(&self, id: RecordId, draft: &RecordDraft) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        let record = state.record_mut(id)?;
        record.title = draft.title.clone();
        record.body = draft.body.clone();
        record.created_at = draft.created_at;
        state.content_writes += 1;
        Ok(())
    }

    async fn upsert_meta(&self, id: RecordId, key: &str, value: &str) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        state
            .record_mut(id)?
            .meta
            .insert(key.to_string(), value.to_string());
        state.content_writes += 1;
        Ok(())
    }

    async fn delete_meta(&self, id: RecordId, key: &str) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        if state.record_mut(id)?.meta.remove(key).is_some() {
            state.content_writes += 1;
        }
        Ok(())
    }

    async fn find_term(&self, taxonomy: &str, name: &str) -> StoreResult<Option<TermId>> {
        Ok(self.state.lock().await.term_id(taxonomy, name))
    }

    async fn create_term(
        &self,
        taxonomy: &str,
        name: &str,
        description: &str,
    ) -> StoreResult<TermId> {
        self.state
            .lock()
            .await
            .insert_term(taxonomy, name, description)
    }

    async fn update_term_description(&self, term: TermId, description: &str) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        let entry = state
            .terms
            .get_mut(&term)
            .ok_or(StoreError::TermNotFound(term))?;
        entry.description = description.to_string();
        state.content_writes += 1;
        Ok(())
    }

    async fn upsert_term_meta(&self, term: TermId, key: &str, value: &str) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        let entry = state
            .terms
            .get_mut(&term)
            .ok_or(StoreError::TermNotFound(term))?;
        entry.meta.insert(key.to_string(), value.to_string());
        state.content_writes += 1;
        Ok(())
    }

    async fn assign_terms(
        &self,
        record: RecordId,
        taxonomy: &str,
        names: &[String],
    ) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        if !state.records.contains_key(&record) {
            return Err(StoreError::RecordNotFound(record));
        }
        let mut ids = Vec::with_capacity(names.len());
        for name in names {
            let id = state.insert_term(taxonomy, name, "")?;
            if !ids.contains(&id) {
                ids.push(id);
            }
        }
        state.record_terms.insert((record, taxonomy.to_string()), ids);
        state.content_writes += 1;
        Ok(())
    }

    async fn register_taxonomy(&self, name: &str, label: &str) -> StoreResult<bool> {
        let mut state = self.state.lock().await;
        if state.taxonomies.contains_key(name) {
            return Ok(false);
        }
        state.taxonomies.insert(name.to_string(), label.to_string());
        Ok(true)
    }

    async fn taxonomy_exists(&self, name: &str) -> StoreResult<bool> {
        Ok(self.state.lock().await.taxonomies.contains_key(name))
    }

    async fn attachment_for(&self, record: RecordId) -> StoreResult<Option<Attachment>> {
        Ok(self
            .state
            .lock()
            .await
            .attachments
            .iter()
            .rev()
            .find(|a| a.record_id == record)
            .cloned())
    }

    async fn attach_file(
        &self,
        record: RecordId,
        source_url: &str,
        relative_path: &str,
        content_hash: &str,
    ) -> StoreResult<AttachmentId> {
        let mut state = self.state.lock().await;
        if !state.records.contains_key(&record) {
            return Err(StoreError::RecordNotFound(record));
        }
        let id = state.next_id();
        state.attachments.push(Attachment {
            id,
            record_id: record,
            source_url: source_url.to_string(),
            relative_path: relative_path.to_string(),
            content_hash: content_hash.to_string(),
        });
        state.content_writes += 1;
        Ok(id)
    }

    async fn external_ids(&self, kind: RecordKind) -> StoreResult<Vec<(RecordId, RemoteId)>> {
        Ok(self
            .state
            .lock()
            .await
            .records
            .values()
            .filter(|r| r.kind == kind)
            .map(|r| (r.id, r.external_id))
            .collect())
    }
}

#[async_trait]
impl ScheduleTable for MemoryStore {
    async fn find_schedule_row(
        &self,
        schedule_item_id: RemoteId,
    ) -> StoreResult<Option<ScheduleRow>> {
        Ok(self.state.lock().await.schedule.get(&schedule_item_id).cloned())
    }

    async fn insert_schedule_row(&self, row: &ScheduleRow) -> StoreResult<i64> {
        let mut state = self.state.lock().await;
        let id = state.next_id();
        let mut stored = row.clone();
        stored.id = Some(id);
        state.schedule.insert(row.schedule_item_id, stored);
        state.content_writes += 1;
        Ok(id)
    }

    async fn update_schedule_row(&self, row: &ScheduleRow) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        let existing = state
            .schedule
            .get_mut(&row.schedule_item_id)
            .ok_or(StoreError::ScheduleRowNotFound(row.schedule_item_id))?;
        let id = existing.id;
        *existing = row.clone();
        existing.id = id;
        state.content_writes += 1;
        Ok(())
    }

    async fn delete_schedule_row(&self, schedule_item_id: RemoteId) -> StoreResult<u64> {
        let mut state = self.state.lock().await;
        let removed = state.schedule.remove(&schedule_item_id).is_some();
        if removed {
            state.content_writes += 1;
        }
        Ok(u64::from(removed))
    }

    async fn schedule_item_ids(&self) -> StoreResult<Vec<RemoteId>> {
        Ok(self.state.lock().await.schedule.keys().copied().collect())
    }

    async fn delete_schedule_rows(&self, schedule_item_ids: &[RemoteId]) -> StoreResult<u64> {
        let mut state = self.state.lock().await;
        let mut removed = 0u64;
        for id in schedule_item_ids {
            if state.schedule.remove(id).is_some() {
                removed += 1;
            }
        }
        if removed > 0 {
            state.content_writes += 1;
        }
        Ok(removed)
    }

    async fn delete_all_schedule_rows(&self) -> StoreResult<u64> {
        let mut state = self.state.lock().await;
        let removed = state.schedule.len() as u64;
        state.schedule.clear();
        if removed > 0 {
            state.content_writes += 1;
        }
        Ok(removed)
    }
}

#[async_trait]
impl OptionStore for MemoryStore {
    async fn get_option(&self, key: &str) -> StoreResult<Option<String>> {
        Ok(self.state.lock().await.options.get(key).cloned())
    }

    async fn set_option(&self, key: &str, value: &str) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        state.options.insert(key.to_string(), value.to_string());
        state.option_writes += 1;
        Ok(())
    }

    async fn delete_option(&self, key: &str) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        state.options.remove(key);
        state.option_writes += 1;
        Ok(())
    }

    async fn add_transient(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        if let Some((_, expires_at)) = state.transients.get(key) {
            if *expires_at > now {
                return Ok(false);
            }
        }
        let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(365));
        let expires_at = now + ttl;
        state
            .transients
            .insert(key.to_string(), (value.to_string(), expires_at));
        state.option_writes += 1;
        Ok(true)
    }

    async fn delete_transient(&self, key: &str) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        state.transients.remove(key);
        state.option_writes += 1;
        Ok(())
    }
}
