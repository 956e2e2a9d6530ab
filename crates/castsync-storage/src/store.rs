//! Narrow contracts the sync engine uses to reach host content storage.

use std::time::Duration;

use async_trait::async_trait;
use castsync_core::{
    Attachment, AttachmentId, RecordDraft, RecordId, RecordKind, RemoteId, ScheduleRow, TermId,
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{context}: {source}")]
    Backend {
        context: &'static str,
        #[source]
        source: sqlx::Error,
    },
    #[error("record {0} not found")]
    RecordNotFound(RecordId),
    #[error("term {0} not found")]
    TermNotFound(TermId),
    #[error("taxonomy {0} is not registered")]
    UnknownTaxonomy(String),
    #[error("schedule item {0} has no persisted row")]
    ScheduleRowNotFound(RemoteId),
}

impl StoreError {
    pub(crate) fn backend(context: &'static str, source: sqlx::Error) -> Self {
        Self::Backend { context, source }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Identity and title of a persisted record, as returned by external-id lookups.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordSummary {
    pub id: RecordId,
    pub title: String,
}

#[async_trait]
pub trait ContentStore: Send + Sync {
    async fn find_record(
        &self,
        kind: RecordKind,
        external_id: RemoteId,
    ) -> StoreResult<Option<RecordSummary>>;

    /// Inserts a published record and returns its id.
    async fn insert_record(&self, draft: &RecordDraft) -> StoreResult<RecordId>;

    async fn update_record(&self, id: RecordId, draft: &RecordDraft) -> StoreResult<()>;

    async fn upsert_meta(&self, id: RecordId, key: &str, value: &str) -> StoreResult<()>;

    async fn delete_meta(&self, id: RecordId, key: &str) -> StoreResult<()>;

    async fn find_term(&self, taxonomy: &str, name: &str) -> StoreResult<Option<TermId>>;

    async fn create_term(&self, taxonomy: &str, name: &str, description: &str)
        -> StoreResult<TermId>;

    async fn update_term_description(&self, term: TermId, description: &str) -> StoreResult<()>;

    async fn upsert_term_meta(&self, term: TermId, key: &str, value: &str) -> StoreResult<()>;

    /// Replaces the record's terms in `taxonomy` with `names`, creating missing terms.
    async fn assign_terms(
        &self,
        record: RecordId,
        taxonomy: &str,
        names: &[String],
    ) -> StoreResult<()>;

    /// Returns true when the taxonomy was newly registered.
    async fn register_taxonomy(&self, name: &str, label: &str) -> StoreResult<bool>;

    async fn taxonomy_exists(&self, name: &str) -> StoreResult<bool>;

    /// Most recent attachment of the record, if any.
    async fn attachment_for(&self, record: RecordId) -> StoreResult<Option<Attachment>>;

    async fn attach_file(
        &self,
        record: RecordId,
        source_url: &str,
        relative_path: &str,
        content_hash: &str,
    ) -> StoreResult<AttachmentId>;

    /// All `(record id, external id)` pairs of the given kind.
    async fn external_ids(&self, kind: RecordKind) -> StoreResult<Vec<(RecordId, RemoteId)>>;
}

/// The flat schedule table, keyed by `schedule_item_id`.
#[async_trait]
pub trait ScheduleTable: Send + Sync {
    async fn find_schedule_row(&self, schedule_item_id: RemoteId)
        -> StoreResult<Option<ScheduleRow>>;

    async fn insert_schedule_row(&self, row: &ScheduleRow) -> StoreResult<i64>;

    async fn update_schedule_row(&self, row: &ScheduleRow) -> StoreResult<()>;

    async fn delete_schedule_row(&self, schedule_item_id: RemoteId) -> StoreResult<u64>;

    async fn schedule_item_ids(&self) -> StoreResult<Vec<RemoteId>>;

    async fn delete_schedule_rows(&self, schedule_item_ids: &[RemoteId]) -> StoreResult<u64>;

    async fn delete_all_schedule_rows(&self) -> StoreResult<u64>;
}

/// Process-wide key/value options plus expiring transients.
#[async_trait]
pub trait OptionStore: Send + Sync {
    async fn get_option(&self, key: &str) -> StoreResult<Option<String>>;

    async fn set_option(&self, key: &str, value: &str) -> StoreResult<()>;

    async fn delete_option(&self, key: &str) -> StoreResult<()>;

    /// Sets the transient only when it is absent or expired. Returns whether it was set.
    async fn add_transient(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool>;

    async fn delete_transient(&self, key: &str) -> StoreResult<()>;
}
