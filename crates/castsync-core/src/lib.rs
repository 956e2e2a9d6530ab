//! Core domain model for castsync: remote catalog payloads, local record shapes and cursor state.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

pub const CRATE_NAME: &str = "castsync-core";

/// Identifier issued by the remote catalog service.
pub type RemoteId = i64;
/// Identifier of a locally persisted content record.
pub type RecordId = i64;
pub type TermId = i64;
pub type AttachmentId = i64;

pub const PRODUCER_TAXONOMY: &str = "producers";
pub const PROJECT_TAXONOMY: &str = "projects";
pub const CATEGORY_TAXONOMY: &str = "categories";

/// Metadata keys written onto show, channel and producer records.
pub mod meta {
    pub const VOD_URL: &str = "vod_url";
    pub const VOD_EMBED: &str = "vod_embed";
    pub const PRODUCER: &str = "producer";
    pub const PRODUCER_ID: &str = "producer_id";
    pub const PROJECT: &str = "project";
    pub const PROJECT_ID: &str = "project_id";
    pub const CATEGORY: &str = "category";
    pub const CATEGORY_ID: &str = "category_id";
    pub const RUNTIME_SECONDS: &str = "runtime_seconds";
    pub const EVENT_DATE: &str = "event_date";
    pub const LOCATION_ID: &str = "location_id";
    pub const LAST_MODIFIED: &str = "last_modified";
    pub const THUMBNAIL_URL: &str = "thumbnail_url";
    pub const THUMBNAIL_ID: &str = "thumbnail_id";
    pub const LIVE_EMBED_CODE: &str = "live_embed_code";

    pub const CONTACT: &str = "contact";
    pub const ADDRESS: &str = "address";
    pub const PHONE_ONE: &str = "phone_one";
    pub const PHONE_TWO: &str = "phone_two";
    pub const EMAIL: &str = "email";
    pub const WEBSITE: &str = "website";
    pub const NOTES: &str = "notes";

    pub fn custom_slot(index: usize) -> String {
        format!("custom_{index}")
    }

    pub fn custom_field(field_id: super::RemoteId) -> String {
        format!("custom_field_{field_id}")
    }
}

/// Either a bare id or the inlined object, depending on the `include` the request asked for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RemoteRef<T> {
    Id(RemoteId),
    Inline(T),
}

pub trait HasRemoteId {
    fn remote_id(&self) -> RemoteId;
}

impl<T: HasRemoteId> RemoteRef<T> {
    pub fn id(&self) -> RemoteId {
        match self {
            RemoteRef::Id(id) => *id,
            RemoteRef::Inline(item) => item.remote_id(),
        }
    }
}

macro_rules! impl_has_remote_id {
    ($($ty:ty),* $(,)?) => {
        $(impl HasRemoteId for $ty {
            fn remote_id(&self) -> RemoteId {
                self.id
            }
        })*
    };
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Channel {
    pub id: RemoteId,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub live_streams: Vec<RemoteId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveStream {
    pub id: RemoteId,
    #[serde(default)]
    pub embed_code: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Category {
    pub id: RemoteId,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Producer {
    pub id: RemoteId,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub contact: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub phone_one: Option<String>,
    #[serde(default)]
    pub phone_two: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub website: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub id: RemoteId,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
}

/// Definition of a custom show field configured on the remote service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShowField {
    pub id: RemoteId,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type", default)]
    pub field_type: String,
}

impl ShowField {
    /// Only tag and select fields are mirrored as taxonomies.
    pub fn is_taxonomy(&self) -> bool {
        matches!(
            self.field_type.to_ascii_lowercase().as_str(),
            "tag" | "select"
        )
    }

    pub fn taxonomy_name(&self) -> String {
        custom_field_taxonomy(self.id)
    }
}

pub fn custom_field_taxonomy(field_id: RemoteId) -> String {
    format!("custom_field_{field_id}")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reel {
    pub id: RemoteId,
    #[serde(default)]
    pub length: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Vod {
    pub id: RemoteId,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub embed_code: Option<String>,
}

impl_has_remote_id!(Channel, LiveStream, Category, Producer, Project, ShowField, Reel, Vod, Show, ScheduleItem);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThumbnailImage {
    #[serde(default)]
    pub url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShowCustomField {
    pub show_field: RemoteId,
    #[serde(default)]
    pub value: JsonValue,
}

impl ShowCustomField {
    pub fn display_value(&self) -> String {
        json_scalar_to_string(&self.value)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Show {
    pub id: RemoteId,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub cg_title: Option<String>,
    #[serde(default)]
    pub comments: Option<String>,
    #[serde(default)]
    pub event_date: Option<String>,
    #[serde(default)]
    pub last_modified: Option<String>,
    #[serde(default)]
    pub location: Option<RemoteId>,
    #[serde(default)]
    pub producer: Option<RemoteId>,
    #[serde(default)]
    pub project: Option<RemoteId>,
    #[serde(default)]
    pub category: Option<RemoteId>,
    #[serde(default)]
    pub reels: Vec<RemoteRef<Reel>>,
    #[serde(default)]
    pub vods: Vec<RemoteRef<Vod>>,
    #[serde(default)]
    pub thumbnail_image: Option<ThumbnailImage>,
    #[serde(default)]
    pub custom_fields: Vec<ShowCustomField>,
    #[serde(default, rename = "custom1")]
    pub custom_1: JsonValue,
    #[serde(default, rename = "custom2")]
    pub custom_2: JsonValue,
    #[serde(default, rename = "custom3")]
    pub custom_3: JsonValue,
    #[serde(default, rename = "custom4")]
    pub custom_4: JsonValue,
    #[serde(default, rename = "custom5")]
    pub custom_5: JsonValue,
    #[serde(default, rename = "custom6")]
    pub custom_6: JsonValue,
    #[serde(default, rename = "custom7")]
    pub custom_7: JsonValue,
    #[serde(default, rename = "custom8")]
    pub custom_8: JsonValue,
}

impl Show {
    /// Character-generator title when present, otherwise the catalog title.
    pub fn display_title(&self) -> &str {
        match self.cg_title.as_deref().map(str::trim) {
            Some(cg) if !cg.is_empty() => cg,
            _ => self.title.as_str(),
        }
    }

    /// The eight generic custom slots, nulls coerced to empty strings.
    pub fn custom_slots(&self) -> [String; 8] {
        [
            &self.custom_1,
            &self.custom_2,
            &self.custom_3,
            &self.custom_4,
            &self.custom_5,
            &self.custom_6,
            &self.custom_7,
            &self.custom_8,
        ]
        .map(json_scalar_to_string)
    }

    pub fn thumbnail_url(&self) -> Option<&str> {
        self.thumbnail_image
            .as_ref()
            .and_then(|t| t.url.as_deref())
            .map(str::trim)
            .filter(|u| !u.is_empty())
    }

    pub fn last_modified_at(&self, offset: FixedOffset) -> Option<DateTime<Utc>> {
        self.last_modified
            .as_deref()
            .and_then(|s| parse_remote_datetime(s, offset))
    }

    pub fn event_date_at(&self, offset: FixedOffset) -> Option<DateTime<Utc>> {
        self.event_date
            .as_deref()
            .and_then(|s| parse_remote_datetime(s, offset))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleItem {
    pub id: RemoteId,
    #[serde(default)]
    pub show: Option<RemoteId>,
    #[serde(default)]
    pub channel: Option<RemoteId>,
    #[serde(default)]
    pub run_date_time: Option<String>,
    #[serde(default)]
    pub cg_exempt: bool,
    #[serde(default)]
    pub deleted: bool,
}

fn json_scalar_to_string(value: &JsonValue) -> String {
    match value {
        JsonValue::Null => String::new(),
        JsonValue::String(s) => s.clone(),
        JsonValue::Array(items) => items
            .iter()
            .map(json_scalar_to_string)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join(", "),
        other => other.to_string(),
    }
}

/// Term values carried by a custom field: one per array element, or the scalar itself.
pub fn custom_field_terms(value: &JsonValue) -> Vec<String> {
    let values = match value {
        JsonValue::Array(items) => items.iter().map(json_scalar_to_string).collect(),
        other => vec![json_scalar_to_string(other)],
    };
    values
        .iter()
        .map(|v| normalize_term_name(v))
        .filter(|v| !v.is_empty())
        .collect()
}

/// Parses the datetime shapes the catalog emits. Values without an offset are
/// interpreted in `offset` (the site's local time) and normalized to UTC.
pub fn parse_remote_datetime(input: &str, offset: FixedOffset) -> Option<DateTime<Utc>> {
    let input = input.trim();
    if input.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(input) {
        return Some(dt.with_timezone(&Utc));
    }
    const NAIVE_FORMATS: [&str; 3] = ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S"];
    let naive = NAIVE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(input, fmt).ok())
        .or_else(|| {
            NaiveDate::parse_from_str(input, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })?;
    offset
        .from_local_datetime(&naive)
        .single()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Term names are stored as single terms, so list separators are neutralized.
pub fn normalize_term_name(raw: &str) -> String {
    raw.replace(',', "-").trim().to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordKind {
    Show,
    Channel,
}

impl RecordKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::Show => "show",
            RecordKind::Channel => "channel",
        }
    }

    /// Name of the identifying attribute used for upsert matching.
    pub fn external_id_key(&self) -> &'static str {
        match self {
            RecordKind::Show => "remote_show_id",
            RecordKind::Channel => "remote_channel_id",
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Attributes written when a record is inserted or updated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordDraft {
    pub kind: RecordKind,
    pub external_id: RemoteId,
    pub title: String,
    pub body: String,
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    pub id: AttachmentId,
    pub record_id: RecordId,
    pub source_url: String,
    pub relative_path: String,
    pub content_hash: String,
}

/// One row of the flat schedule table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleRow {
    pub id: Option<i64>,
    pub run_date_time: DateTime<Utc>,
    pub show_id: RemoteId,
    pub show_title: String,
    pub channel_id: Option<RemoteId>,
    pub show_post_id: RecordId,
    pub channel_post_id: Option<RecordId>,
    pub schedule_item_id: RemoteId,
    pub cg_exempt: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThumbnailMode {
    /// Download the image and attach it to the record.
    #[default]
    Local,
    /// Store the URL as metadata only.
    Remote,
}

impl FromStr for ThumbnailMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(ThumbnailMode::Local),
            "remote" => Ok(ThumbnailMode::Remote),
            other => Err(format!("unknown thumbnail mode {other:?}")),
        }
    }
}

/// Resumable position within the current change-set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SyncCursor {
    /// High-water mark of the last fully completed change-set.
    pub since: DateTime<Utc>,
    pub sync_index: usize,
    pub total_result_count: usize,
}
