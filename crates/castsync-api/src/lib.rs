//! Catalog source contract + HTTP implementation for the remote scheduling service.

use async_trait::async_trait;
use castsync_core::{
    Category, Channel, LiveStream, Producer, Project, Reel, RemoteId, ScheduleItem, Show,
    ShowField, Vod,
};
use castsync_storage::{page_meta, ResourceFetcher};
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use reqwest::Url;
use serde::de::DeserializeOwned;
use serde_json::{json, Value as JsonValue};
use tracing::{error, warn};

pub const CRATE_NAME: &str = "castsync-api";

/// Page size of the initial schedule request; larger windows are expanded once by the fetcher.
const SCHEDULE_PAGE_SIZE: usize = 1000;
const BULK_ID_PAGE_SIZE: usize = 100_000;

/// A fetched collection: the raw payload (for change hashing) and the records that decoded.
#[derive(Debug, Clone, PartialEq)]
pub struct Collection<T> {
    pub raw: Vec<JsonValue>,
    pub items: Vec<T>,
}

impl<T> Default for Collection<T> {
    fn default() -> Self {
        Self {
            raw: Vec::new(),
            items: Vec::new(),
        }
    }
}

impl<T: DeserializeOwned> Collection<T> {
    /// Decodes each record independently; a record that does not decode is skipped.
    pub fn decode(raw: Vec<JsonValue>, kind: &str) -> Self {
        let items = decode_records(&raw, kind);
        Self { raw, items }
    }
}

pub fn decode_records<T: DeserializeOwned>(raw: &[JsonValue], kind: &str) -> Vec<T> {
    raw.iter()
        .enumerate()
        .filter_map(|(index, value)| match serde_json::from_value(value.clone()) {
            Ok(item) => Some(item),
            Err(err) => {
                warn!(kind, index, %err, "skipping undecodable record");
                None
            }
        })
        .collect()
}

/// Full show detail for one batch, with the related records sideloaded by the API.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ShowBatch {
    pub shows: Vec<Show>,
    pub reels: Vec<Reel>,
    pub vods: Vec<Vod>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl ScheduleWindow {
    /// From one day back to `days_ahead` days forward of `today`.
    pub fn rolling(today: NaiveDate, days_ahead: u32) -> Self {
        let start = today.pred_opt().unwrap_or(today);
        let end = today
            .checked_add_days(chrono::Days::new(u64::from(days_ahead)))
            .unwrap_or(today);
        Self { start, end }
    }
}

/// Everything the sync engine needs from the remote catalog.
///
/// Implementations absorb and log their own failures: collections come back empty,
/// and `None` marks a request that failed as opposed to one that returned nothing.
#[async_trait]
pub trait CatalogSource: Send + Sync {
    async fn channels(&self) -> Collection<Channel>;
    async fn live_streams(&self) -> Collection<LiveStream>;
    async fn categories(&self) -> Collection<Category>;
    async fn producers(&self) -> Collection<Producer>;
    async fn projects(&self) -> Collection<Project>;
    async fn show_fields(&self) -> Collection<ShowField>;
    async fn schedule_items(&self, window: ScheduleWindow) -> Option<Collection<ScheduleItem>>;
    /// Ids of every show modified after `since`, ordered by last-modified then title.
    async fn changed_show_ids(&self, since: DateTime<Utc>) -> Option<Vec<RemoteId>>;
    async fn shows_by_ids(&self, ids: &[RemoteId]) -> Option<ShowBatch>;
    async fn all_show_ids(&self) -> Option<Vec<RemoteId>>;
    async fn download(&self, url: &str) -> Option<Vec<u8>>;
}

#[derive(Debug, Clone)]
pub struct HttpCatalog {
    base_url: String,
    fetcher: ResourceFetcher,
}

impl HttpCatalog {
    pub fn new(base_url: impl Into<String>, fetcher: ResourceFetcher) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { base_url, fetcher }
    }

    pub fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn endpoint_with_query(&self, path: &str, pairs: &[(&str, String)]) -> Option<String> {
        let mut url = match Url::parse(&self.endpoint(path)) {
            Ok(url) => url,
            Err(err) => {
                error!(base_url = %self.base_url, path, %err, "invalid catalog url");
                return None;
            }
        };
        url.query_pairs_mut()
            .extend_pairs(pairs.iter().map(|(k, v)| (*k, v.as_str())));
        Some(url.to_string())
    }

    async fn collection<T: DeserializeOwned>(
        &self,
        path: &str,
        key: &str,
        ensure_all_loaded: bool,
    ) -> Collection<T> {
        let raw = self
            .fetcher
            .fetch(&self.endpoint(path), key, ensure_all_loaded)
            .await;
        Collection::decode(raw, key)
    }
}

/// Advanced-search body: every show modified after `since`, sorted for stable paging.
pub fn changed_since_query(since: DateTime<Utc>) -> JsonValue {
    json!({
        "savedShowSearch": {
            "query": {
                "groups": [{
                    "orAnd": "and",
                    "filters": [{
                        "field": "lastModified",
                        "operator": "greaterThan",
                        "searchValue": since.to_rfc3339_opts(SecondsFormat::AutoSi, true),
                    }],
                }],
                "sortOptions": [
                    { "field": "lastModified", "descending": false },
                    { "field": "title", "descending": false },
                ],
            },
            "name": "",
        }
    })
}

fn sideloaded<'a>(body: &'a JsonValue, key: &str) -> &'a [JsonValue] {
    body.get(key)
        .and_then(JsonValue::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default()
}

fn ids_from(values: &[JsonValue]) -> Vec<RemoteId> {
    values
        .iter()
        .filter_map(|v| v.as_i64().or_else(|| v.get("id").and_then(JsonValue::as_i64)))
        .collect()
}

#[async_trait]
impl CatalogSource for HttpCatalog {
    async fn channels(&self) -> Collection<Channel> {
        self.collection("channels", "channels", true).await
    }

    async fn live_streams(&self) -> Collection<LiveStream> {
        self.collection("livestreams", "liveStreams", false).await
    }

    async fn categories(&self) -> Collection<Category> {
        self.collection("categories", "categories", true).await
    }

    async fn producers(&self) -> Collection<Producer> {
        self.collection("producers", "producers", true).await
    }

    async fn projects(&self) -> Collection<Project> {
        self.collection("projects", "projects", true).await
    }

    async fn show_fields(&self) -> Collection<ShowField> {
        self.collection("showfields", "showFields", false).await
    }

    async fn schedule_items(&self, window: ScheduleWindow) -> Option<Collection<ScheduleItem>> {
        let url = self.endpoint_with_query(
            "scheduleitems",
            &[
                ("start", window.start.format("%Y-%m-%d").to_string()),
                ("end", window.end.format("%Y-%m-%d").to_string()),
                ("include_cg_exempt", "true".to_string()),
                ("page_size", SCHEDULE_PAGE_SIZE.to_string()),
            ],
        )?;
        let raw = self.fetcher.try_fetch(&url, "scheduleItems", true).await?;
        Some(Collection::decode(raw, "scheduleItems"))
    }

    async fn changed_show_ids(&self, since: DateTime<Utc>) -> Option<Vec<RemoteId>> {
        let url = self.endpoint("shows/search/advanced");
        let body = match self.fetcher.post_json(&url, &changed_since_query(since)).await {
            Ok(body) => body,
            Err(err) => {
                error!(%err, "changed-show search failed");
                return None;
            }
        };
        match body
            .get("savedShowSearch")
            .and_then(|s| s.get("results"))
            .and_then(JsonValue::as_array)
        {
            Some(results) => Some(ids_from(results)),
            None => {
                error!("changed-show search response has no results list");
                None
            }
        }
    }

    async fn shows_by_ids(&self, ids: &[RemoteId]) -> Option<ShowBatch> {
        let mut pairs = vec![
            ("page_size", ids.len().max(1).to_string()),
            ("include", "reel,vod,webfile,thumbnail".to_string()),
        ];
        pairs.extend(ids.iter().map(|id| ("ids[]", id.to_string())));
        let url = self.endpoint_with_query("shows", &pairs)?;

        let body = match self.fetcher.get_json(&url, self.fetcher.timeout()).await {
            Ok(body) => body,
            Err(err) => {
                error!(%err, batch = ids.len(), "show batch fetch failed");
                return None;
            }
        };
        let Some(shows) = body.get("shows").and_then(JsonValue::as_array) else {
            error!("show batch response has no shows list");
            return None;
        };
        Some(ShowBatch {
            shows: decode_records(shows, "shows"),
            reels: decode_records(sideloaded(&body, "reels"), "reels"),
            vods: decode_records(sideloaded(&body, "vods"), "vods"),
        })
    }

    async fn all_show_ids(&self) -> Option<Vec<RemoteId>> {
        let url = self.endpoint_with_query(
            "shows",
            &[
                ("id_only", "true".to_string()),
                ("page_size", BULK_ID_PAGE_SIZE.to_string()),
            ],
        )?;
        let body = match self.fetcher.get_json(&url, self.fetcher.extended_timeout()).await {
            Ok(body) => body,
            Err(err) => {
                error!(%err, "show id listing failed");
                return None;
            }
        };
        let Some(raw) = body.get("shows").and_then(JsonValue::as_array) else {
            error!("show id listing has no shows list");
            return None;
        };
        let ids = ids_from(raw);
        if let Some((count, _)) = page_meta(&body) {
            if count > ids.len() as u64 {
                warn!(
                    count,
                    received = ids.len(),
                    "show id listing truncated; orphan check may over-report"
                );
            }
        }
        Some(ids)
    }

    async fn download(&self, url: &str) -> Option<Vec<u8>> {
        match self.fetcher.fetch_bytes(url).await {
            Ok(resp) => Some(resp.body),
            Err(err) => {
                warn!(url, %err, "download failed");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn undecodable_records_are_skipped_but_kept_in_raw() {
        let raw = vec![
            json!({"id": 1, "name": "Public"}),
            json!({"name": "no id"}),
            json!({"id": 3, "name": "Education"}),
        ];
        let collection: Collection<Category> = Collection::decode(raw, "categories");
        assert_eq!(collection.raw.len(), 3);
        assert_eq!(
            collection.items.iter().map(|c| c.id).collect::<Vec<_>>(),
            vec![1, 3]
        );
    }

    #[test]
    fn rolling_window_spans_yesterday_through_horizon() {
        let today = NaiveDate::from_ymd_opt(2024, 3, 1).expect("date");
        let window = ScheduleWindow::rolling(today, 14);
        assert_eq!(window.start, NaiveDate::from_ymd_opt(2024, 2, 29).expect("date"));
        assert_eq!(window.end, NaiveDate::from_ymd_opt(2024, 3, 15).expect("date"));
    }

    #[test]
    fn search_query_filters_and_sorts_by_last_modified() {
        let since = DateTime::parse_from_rfc3339("2024-01-01T00:00:00Z")
            .expect("ts")
            .with_timezone(&Utc);
        let query = changed_since_query(since);
        let filter = &query["savedShowSearch"]["query"]["groups"][0]["filters"][0];
        assert_eq!(filter["field"], "lastModified");
        assert_eq!(filter["operator"], "greaterThan");
        assert_eq!(filter["searchValue"], "2024-01-01T00:00:00Z");
        let sort = &query["savedShowSearch"]["query"]["sortOptions"];
        assert_eq!(sort[0]["field"], "lastModified");
        assert_eq!(sort[1]["field"], "title");
    }

    #[test]
    fn search_query_keeps_sub_second_precision() {
        let since = DateTime::parse_from_rfc3339("2024-01-01T00:00:00.470Z")
            .expect("ts")
            .with_timezone(&Utc);
        let query = changed_since_query(since);
        assert_eq!(
            query["savedShowSearch"]["query"]["groups"][0]["filters"][0]["searchValue"],
            "2024-01-01T00:00:00.470Z"
        );
    }

    #[test]
    fn id_listing_accepts_bare_and_object_ids() {
        assert_eq!(ids_from(&[json!(4), json!({"id": 5}), json!("x")]), vec![4, 5]);
    }
}
