//! Postgres implementation of the store contracts.

use std::time::Duration;

use async_trait::async_trait;
use castsync_core::{
    Attachment, AttachmentId, RecordDraft, RecordId, RecordKind, RemoteId, ScheduleRow, TermId,
};
use chrono::Utc;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};

use crate::store::{
    ContentStore, OptionStore, RecordSummary, ScheduleTable, StoreError, StoreResult,
};

const SCHEMA: &str = include_str!("../migrations/0001_init.sql");

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(database_url)
            .await
            .map_err(|e| StoreError::backend("connect postgres", e))?;
        Ok(Self { pool })
    }

    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Applies the bootstrap schema. Every statement is `IF NOT EXISTS`, so this is safe to repeat.
    pub async fn migrate(&self) -> StoreResult<()> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::backend("apply schema", e))?;
        Ok(())
    }

    async fn ensure_taxonomy(&self, taxonomy: &str) -> StoreResult<()> {
        if self.taxonomy_exists(taxonomy).await? {
            Ok(())
        } else {
            Err(StoreError::UnknownTaxonomy(taxonomy.to_string()))
        }
    }

    fn schedule_row_from(row: &PgRow) -> StoreResult<ScheduleRow> {
        let get = |e| StoreError::backend("decode schedule row", e);
        Ok(ScheduleRow {
            id: Some(row.try_get("id").map_err(get)?),
            run_date_time: row.try_get("run_date_time").map_err(get)?,
            show_id: row.try_get("show_id").map_err(get)?,
            show_title: row.try_get("show_title").map_err(get)?,
            channel_id: row.try_get("channel_id").map_err(get)?,
            show_post_id: row.try_get("show_post_id").map_err(get)?,
            channel_post_id: row.try_get("channel_post_id").map_err(get)?,
            schedule_item_id: row.try_get("schedule_item_id").map_err(get)?,
            cg_exempt: row.try_get("cg_exempt").map_err(get)?,
        })
    }
}

#[async_trait]
impl ContentStore for PgStore {
    async fn find_record(
        &self,
        kind: RecordKind,
        external_id: RemoteId,
    ) -> StoreResult<Option<RecordSummary>> {
        let row = sqlx::query("SELECT id, title FROM records WHERE kind = $1 AND external_id = $2")
            .bind(kind.as_str())
            .bind(external_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::backend("find record", e))?;
        row.map(|row| {
            Ok(RecordSummary {
                id: row
                    .try_get("id")
                    .map_err(|e| StoreError::backend("record id", e))?,
                title: row
                    .try_get("title")
                    .map_err(|e| StoreError::backend("record title", e))?,
            })
        })
        .transpose()
    }

    async fn insert_record(&self, draft: &RecordDraft) -> StoreResult<RecordId> {
        sqlx::query_scalar(
            r#"
            INSERT INTO records (kind, external_id, title, body, status, created_at)
            VALUES ($1, $2, $3, $4, 'publish', $5)
            RETURNING id
            "#,
        )
        .bind(draft.kind.as_str())
        .bind(draft.external_id)
        .bind(&draft.title)
        .bind(&draft.body)
        .bind(draft.created_at)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| StoreError::backend("insert record", e))
    }

    async fn update_record(&self, id: RecordId, draft: &RecordDraft) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE records
               SET title = $2, body = $3, created_at = $4, updated_at = now()
             WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(&draft.title)
        .bind(&draft.body)
        .bind(draft.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::backend("update record", e))?;
        if result.rows_affected() == 0 {
            return Err(StoreError::RecordNotFound(id));
        }
        Ok(())
    }

    async fn upsert_meta(&self, id: RecordId, key: &str, value: &str) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO record_meta (record_id, meta_key, meta_value)
            VALUES ($1, $2, $3)
            ON CONFLICT (record_id, meta_key) DO UPDATE SET meta_value = EXCLUDED.meta_value
            "#,
        )
        .bind(id)
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::backend("upsert record meta", e))?;
        Ok(())
    }

    async fn delete_meta(&self, id: RecordId, key: &str) -> StoreResult<()> {
        sqlx::query("DELETE FROM record_meta WHERE record_id = $1 AND meta_key = $2")
            .bind(id)
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::backend("delete record meta", e))?;
        Ok(())
    }

    async fn find_term(&self, taxonomy: &str, name: &str) -> StoreResult<Option<TermId>> {
        sqlx::query_scalar("SELECT id FROM terms WHERE taxonomy = $1 AND name = $2")
            .bind(taxonomy)
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::backend("find term", e))
    }

    async fn create_term(
        &self,
        taxonomy: &str,
        name: &str,
        description: &str,
    ) -> StoreResult<TermId> {
        self.ensure_taxonomy(taxonomy).await?;
        sqlx::query_scalar(
            r#"
            INSERT INTO terms (taxonomy, name, description)
            VALUES ($1, $2, $3)
            ON CONFLICT (taxonomy, name) DO UPDATE SET name = EXCLUDED.name
            RETURNING id
            "#,
        )
        .bind(taxonomy)
        .bind(name)
        .bind(description)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| StoreError::backend("create term", e))
    }

    async fn update_term_description(&self, term: TermId, description: &str) -> StoreResult<()> {
        let result = sqlx::query("UPDATE terms SET description = $2 WHERE id = $1")
            .bind(term)
            .bind(description)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::backend("update term description", e))?;
        if result.rows_affected() == 0 {
            return Err(StoreError::TermNotFound(term));
        }
        Ok(())
    }

    async fn upsert_term_meta(&self, term: TermId, key: &str, value: &str) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO term_meta (term_id, meta_key, meta_value)
            VALUES ($1, $2, $3)
            ON CONFLICT (term_id, meta_key) DO UPDATE SET meta_value = EXCLUDED.meta_value
            "#,
        )
        .bind(term)
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::backend("upsert term meta", e))?;
        Ok(())
    }

    async fn assign_terms(
        &self,
        record: RecordId,
        taxonomy: &str,
        names: &[String],
    ) -> StoreResult<()> {
        self.ensure_taxonomy(taxonomy).await?;
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::backend("begin assign terms", e))?;

        sqlx::query("DELETE FROM record_terms WHERE record_id = $1 AND taxonomy = $2")
            .bind(record)
            .bind(taxonomy)
            .execute(&mut *tx)
            .await
            .map_err(|e| StoreError::backend("clear record terms", e))?;

        for name in names {
            let term_id: TermId = sqlx::query_scalar(
                r#"
                INSERT INTO terms (taxonomy, name)
                VALUES ($1, $2)
                ON CONFLICT (taxonomy, name) DO UPDATE SET name = EXCLUDED.name
                RETURNING id
                "#,
            )
            .bind(taxonomy)
            .bind(name)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| StoreError::backend("find or create term", e))?;

            sqlx::query(
                r#"
                INSERT INTO record_terms (record_id, term_id, taxonomy)
                VALUES ($1, $2, $3)
                ON CONFLICT (record_id, term_id) DO NOTHING
                "#,
            )
            .bind(record)
            .bind(term_id)
            .bind(taxonomy)
            .execute(&mut *tx)
            .await
            .map_err(|e| StoreError::backend("assign record term", e))?;
        }

        tx.commit()
            .await
            .map_err(|e| StoreError::backend("commit assign terms", e))
    }

    async fn register_taxonomy(&self, name: &str, label: &str) -> StoreResult<bool> {
        let result = sqlx::query(
            "INSERT INTO taxonomies (name, label) VALUES ($1, $2) ON CONFLICT (name) DO NOTHING",
        )
        .bind(name)
        .bind(label)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::backend("register taxonomy", e))?;
        Ok(result.rows_affected() > 0)
    }

    async fn taxonomy_exists(&self, name: &str) -> StoreResult<bool> {
        sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM taxonomies WHERE name = $1)")
            .bind(name)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| StoreError::backend("taxonomy exists", e))
    }

    async fn attachment_for(&self, record: RecordId) -> StoreResult<Option<Attachment>> {
        let row = sqlx::query(
            r#"
            SELECT id, record_id, source_url, relative_path, content_hash
              FROM attachments
             WHERE record_id = $1
             ORDER BY id DESC
             LIMIT 1
            "#,
        )
        .bind(record)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::backend("find attachment", e))?;

        row.map(|row| {
            let get = |e| StoreError::backend("decode attachment", e);
            Ok(Attachment {
                id: row.try_get("id").map_err(get)?,
                record_id: row.try_get("record_id").map_err(get)?,
                source_url: row.try_get("source_url").map_err(get)?,
                relative_path: row.try_get("relative_path").map_err(get)?,
                content_hash: row.try_get("content_hash").map_err(get)?,
            })
        })
        .transpose()
    }

    async fn attach_file(
        &self,
        record: RecordId,
        source_url: &str,
        relative_path: &str,
        content_hash: &str,
    ) -> StoreResult<AttachmentId> {
        sqlx::query_scalar(
            r#"
            INSERT INTO attachments (record_id, source_url, relative_path, content_hash)
            VALUES ($1, $2, $3, $4)
            RETURNING id
            "#,
        )
        .bind(record)
        .bind(source_url)
        .bind(relative_path)
        .bind(content_hash)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| StoreError::backend("attach file", e))
    }

    async fn external_ids(&self, kind: RecordKind) -> StoreResult<Vec<(RecordId, RemoteId)>> {
        sqlx::query_as("SELECT id, external_id FROM records WHERE kind = $1 ORDER BY id")
            .bind(kind.as_str())
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::backend("list external ids", e))
    }
}

#[async_trait]
impl ScheduleTable for PgStore {
    async fn find_schedule_row(
        &self,
        schedule_item_id: RemoteId,
    ) -> StoreResult<Option<ScheduleRow>> {
        let row = sqlx::query(
            r#"
            SELECT id, run_date_time, show_id, show_title, channel_id, show_post_id,
                   channel_post_id, schedule_item_id, cg_exempt
              FROM schedule_items
             WHERE schedule_item_id = $1
            "#,
        )
        .bind(schedule_item_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::backend("find schedule row", e))?;
        row.as_ref().map(Self::schedule_row_from).transpose()
    }

    async fn insert_schedule_row(&self, row: &ScheduleRow) -> StoreResult<i64> {
        sqlx::query_scalar(
            r#"
            INSERT INTO schedule_items (run_date_time, show_id, show_title, channel_id,
                                        show_post_id, channel_post_id, schedule_item_id, cg_exempt)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING id
            "#,
        )
        .bind(row.run_date_time)
        .bind(row.show_id)
        .bind(&row.show_title)
        .bind(row.channel_id)
        .bind(row.show_post_id)
        .bind(row.channel_post_id)
        .bind(row.schedule_item_id)
        .bind(row.cg_exempt)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| StoreError::backend("insert schedule row", e))
    }

    async fn update_schedule_row(&self, row: &ScheduleRow) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE schedule_items
               SET run_date_time = $2, show_id = $3, show_title = $4, channel_id = $5,
                   show_post_id = $6, channel_post_id = $7, cg_exempt = $8
             WHERE schedule_item_id = $1
            "#,
        )
        .bind(row.schedule_item_id)
        .bind(row.run_date_time)
        .bind(row.show_id)
        .bind(&row.show_title)
        .bind(row.channel_id)
        .bind(row.show_post_id)
        .bind(row.channel_post_id)
        .bind(row.cg_exempt)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::backend("update schedule row", e))?;
        if result.rows_affected() == 0 {
            return Err(StoreError::ScheduleRowNotFound(row.schedule_item_id));
        }
        Ok(())
    }

    async fn delete_schedule_row(&self, schedule_item_id: RemoteId) -> StoreResult<u64> {
        let result = sqlx::query("DELETE FROM schedule_items WHERE schedule_item_id = $1")
            .bind(schedule_item_id)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::backend("delete schedule row", e))?;
        Ok(result.rows_affected())
    }

    async fn schedule_item_ids(&self) -> StoreResult<Vec<RemoteId>> {
        sqlx::query_scalar("SELECT schedule_item_id FROM schedule_items ORDER BY schedule_item_id")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::backend("list schedule item ids", e))
    }

    async fn delete_schedule_rows(&self, schedule_item_ids: &[RemoteId]) -> StoreResult<u64> {
        if schedule_item_ids.is_empty() {
            return Ok(0);
        }
        let result = sqlx::query("DELETE FROM schedule_items WHERE schedule_item_id = ANY($1)")
            .bind(schedule_item_ids)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::backend("delete schedule rows", e))?;
        Ok(result.rows_affected())
    }

    async fn delete_all_schedule_rows(&self) -> StoreResult<u64> {
        let result = sqlx::query("DELETE FROM schedule_items")
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::backend("delete all schedule rows", e))?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl OptionStore for PgStore {
    async fn get_option(&self, key: &str) -> StoreResult<Option<String>> {
        sqlx::query_scalar(
            r#"
            SELECT option_value FROM options
             WHERE option_key = $1 AND (expires_at IS NULL OR expires_at > now())
            "#,
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::backend("get option", e))
    }

    async fn set_option(&self, key: &str, value: &str) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO options (option_key, option_value, expires_at)
            VALUES ($1, $2, NULL)
            ON CONFLICT (option_key) DO UPDATE
               SET option_value = EXCLUDED.option_value, expires_at = NULL
            "#,
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::backend("set option", e))?;
        Ok(())
    }

    async fn delete_option(&self, key: &str) -> StoreResult<()> {
        sqlx::query("DELETE FROM options WHERE option_key = $1")
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::backend("delete option", e))?;
        Ok(())
    }

    async fn add_transient(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool> {
        let now = Utc::now();
        let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(365));
        let acquired: Option<String> = sqlx::query_scalar(
            r#"
            INSERT INTO options (option_key, option_value, expires_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (option_key) DO UPDATE
               SET option_value = EXCLUDED.option_value, expires_at = EXCLUDED.expires_at
             WHERE options.expires_at IS NOT NULL AND options.expires_at <= $4
            RETURNING option_key
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(now + ttl)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::backend("add transient", e))?;
        Ok(acquired.is_some())
    }

    async fn delete_transient(&self, key: &str) -> StoreResult<()> {
        sqlx::query("DELETE FROM options WHERE option_key = $1 AND expires_at IS NOT NULL")
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::backend("delete transient", e))?;
        Ok(())
    }
}
