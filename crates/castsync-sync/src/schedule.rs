//! Reconciles the flat schedule table against the latest schedule-items payload.

use std::collections::BTreeSet;

use anyhow::{Context, Result};
use castsync_api::Collection;
use castsync_core::{parse_remote_datetime, RecordKind, RemoteId, ScheduleItem, ScheduleRow};
use castsync_storage::{ContentStore, OptionStore, ScheduleTable};
use chrono::FixedOffset;
use serde::Serialize;
use serde_json::Value as JsonValue;
use tracing::{debug, info, warn};

use crate::gate::{hash_keys, ChangeGate};

/// Rows per stale-row delete statement.
pub const PRUNE_CHUNK_SIZE: usize = 500;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    /// False when the payload matched the last committed hash and nothing was written.
    pub changed: bool,
    pub inserted: usize,
    pub updated: usize,
    pub deleted: usize,
    pub skipped: usize,
    pub pruned: u64,
}

/// Applies the payload item by item, then deletes every persisted row whose
/// `schedule_item_id` the payload does not mention.
pub async fn reconcile<S>(
    store: &S,
    payload: &Collection<ScheduleItem>,
    site_offset: FixedOffset,
) -> Result<ReconcileReport>
where
    S: ContentStore + ScheduleTable + OptionStore + ?Sized,
{
    let gate = ChangeGate::new(store);
    if !gate.should_process(&payload.raw, hash_keys::SCHEDULE).await? {
        return Ok(ReconcileReport::default());
    }

    let mut report = ReconcileReport {
        changed: true,
        ..ReconcileReport::default()
    };
    for item in &payload.items {
        apply_item(store, item, site_offset, &mut report).await?;
    }

    let keep = payload_ids(&payload.raw);
    report.pruned = if keep.is_empty() {
        store
            .delete_all_schedule_rows()
            .await
            .context("clearing schedule table")?
    } else {
        let stale: Vec<RemoteId> = store
            .schedule_item_ids()
            .await
            .context("listing schedule rows")?
            .into_iter()
            .filter(|id| !keep.contains(id))
            .collect();
        let mut pruned = 0;
        for chunk in stale.chunks(PRUNE_CHUNK_SIZE) {
            pruned += store
                .delete_schedule_rows(chunk)
                .await
                .context("pruning stale schedule rows")?;
        }
        pruned
    };

    gate.commit(&payload.raw, hash_keys::SCHEDULE).await?;
    info!(
        inserted = report.inserted,
        updated = report.updated,
        deleted = report.deleted,
        skipped = report.skipped,
        pruned = report.pruned,
        "schedule reconciled"
    );
    Ok(report)
}

async fn apply_item<S>(
    store: &S,
    item: &ScheduleItem,
    site_offset: FixedOffset,
    report: &mut ReconcileReport,
) -> Result<()>
where
    S: ContentStore + ScheduleTable + ?Sized,
{
    if item.deleted {
        report.deleted += store
            .delete_schedule_row(item.id)
            .await
            .with_context(|| format!("deleting schedule item {}", item.id))?
            as usize;
        return Ok(());
    }

    let Some(show_id) = item.show else {
        debug!(schedule_item_id = item.id, "schedule item has no show");
        report.skipped += 1;
        return Ok(());
    };
    let Some(run_date_time) = item
        .run_date_time
        .as_deref()
        .and_then(|raw| parse_remote_datetime(raw, site_offset))
    else {
        warn!(schedule_item_id = item.id, raw = ?item.run_date_time, "unparseable run time");
        report.skipped += 1;
        return Ok(());
    };
    let Some(show) = store
        .find_record(RecordKind::Show, show_id)
        .await
        .with_context(|| format!("looking up show {show_id}"))?
    else {
        debug!(schedule_item_id = item.id, show_id, "show not synced yet");
        report.skipped += 1;
        return Ok(());
    };
    let channel_post_id = match item.channel {
        Some(channel_id) => store
            .find_record(RecordKind::Channel, channel_id)
            .await
            .with_context(|| format!("looking up channel {channel_id}"))?
            .map(|c| c.id),
        None => None,
    };

    let mut row = ScheduleRow {
        id: None,
        run_date_time,
        show_id,
        show_title: show.title,
        channel_id: item.channel,
        show_post_id: show.id,
        channel_post_id,
        schedule_item_id: item.id,
        cg_exempt: item.cg_exempt,
    };
    let existing = store
        .find_schedule_row(item.id)
        .await
        .with_context(|| format!("looking up schedule item {}", item.id))?;
    match existing {
        Some(current) => {
            row.id = current.id;
            store
                .update_schedule_row(&row)
                .await
                .with_context(|| format!("updating schedule item {}", item.id))?;
            report.updated += 1;
        }
        None => {
            store
                .insert_schedule_row(&row)
                .await
                .with_context(|| format!("inserting schedule item {}", item.id))?;
            report.inserted += 1;
        }
    }
    Ok(())
}

/// Every id in the payload, including records that failed to decode.
fn payload_ids(raw: &[JsonValue]) -> BTreeSet<RemoteId> {
    raw.iter()
        .filter_map(|item| item.get("id").and_then(JsonValue::as_i64))
        .collect()
}
