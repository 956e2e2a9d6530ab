//! Scripted in-memory catalog used by the engine tests.

use std::collections::BTreeMap;

use async_trait::async_trait;
use castsync_api::{decode_records, CatalogSource, Collection, ScheduleWindow, ShowBatch};
use castsync_core::{
    Category, Channel, LiveStream, Producer, Project, RemoteId, ScheduleItem, Show, ShowField,
};
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use tokio::sync::Mutex;

pub fn show(value: JsonValue) -> Show {
    serde_json::from_value(value).expect("show fixture")
}

#[derive(Debug)]
struct Script {
    collections: BTreeMap<&'static str, Vec<JsonValue>>,
    schedule: Option<Vec<JsonValue>>,
    changed_ids: Option<Vec<RemoteId>>,
    shows: Vec<JsonValue>,
    reels: Vec<JsonValue>,
    vods: Vec<JsonValue>,
    all_ids: Option<Vec<RemoteId>>,
    files: BTreeMap<String, Vec<u8>>,
    requests: usize,
    downloads: usize,
    batches: Vec<Vec<RemoteId>>,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            collections: BTreeMap::new(),
            schedule: None,
            changed_ids: Some(Vec::new()),
            shows: Vec::new(),
            reels: Vec::new(),
            vods: Vec::new(),
            all_ids: None,
            files: BTreeMap::new(),
            requests: 0,
            downloads: 0,
            batches: Vec::new(),
        }
    }
}

/// Serves canned payloads and records what was asked of it.
#[derive(Debug, Default)]
pub struct ScriptedCatalog {
    script: Mutex<Script>,
}

impl ScriptedCatalog {
    pub async fn set_collection(&self, key: &'static str, raw: Vec<JsonValue>) {
        self.script.lock().await.collections.insert(key, raw);
    }

    pub async fn set_schedule(&self, raw: Option<Vec<JsonValue>>) {
        self.script.lock().await.schedule = raw;
    }

    pub async fn set_changed_ids(&self, ids: Vec<RemoteId>) {
        self.script.lock().await.changed_ids = Some(ids);
    }

    pub async fn fail_search(&self) {
        self.script.lock().await.changed_ids = None;
    }

    pub async fn add_show(&self, show: JsonValue) {
        self.script.lock().await.shows.push(show);
    }

    pub async fn add_vod(&self, vod: JsonValue) {
        self.script.lock().await.vods.push(vod);
    }

    pub async fn set_all_ids(&self, ids: Option<Vec<RemoteId>>) {
        self.script.lock().await.all_ids = ids;
    }

    pub async fn add_download(&self, url: &str, bytes: Vec<u8>) {
        self.script.lock().await.files.insert(url.to_string(), bytes);
    }

    pub async fn requests(&self) -> usize {
        self.script.lock().await.requests
    }

    pub async fn downloads(&self) -> usize {
        self.script.lock().await.downloads
    }

    pub async fn requested_batches(&self) -> Vec<Vec<RemoteId>> {
        self.script.lock().await.batches.clone()
    }

    async fn collection<T: serde::de::DeserializeOwned>(&self, key: &'static str) -> Collection<T> {
        let mut script = self.script.lock().await;
        script.requests += 1;
        let raw = script.collections.get(key).cloned().unwrap_or_default();
        Collection::decode(raw, key)
    }
}

#[async_trait]
impl CatalogSource for ScriptedCatalog {
    async fn channels(&self) -> Collection<Channel> {
        self.collection("channels").await
    }

    async fn live_streams(&self) -> Collection<LiveStream> {
        self.collection("liveStreams").await
    }

    async fn categories(&self) -> Collection<Category> {
        self.collection("categories").await
    }

    async fn producers(&self) -> Collection<Producer> {
        self.collection("producers").await
    }

    async fn projects(&self) -> Collection<Project> {
        self.collection("projects").await
    }

    async fn show_fields(&self) -> Collection<ShowField> {
        self.collection("showFields").await
    }

    async fn schedule_items(&self, _window: ScheduleWindow) -> Option<Collection<ScheduleItem>> {
        let mut script = self.script.lock().await;
        script.requests += 1;
        script
            .schedule
            .clone()
            .map(|raw| Collection::decode(raw, "scheduleItems"))
    }

    async fn changed_show_ids(&self, _since: DateTime<Utc>) -> Option<Vec<RemoteId>> {
        let mut script = self.script.lock().await;
        script.requests += 1;
        script.changed_ids.clone()
    }

    async fn shows_by_ids(&self, ids: &[RemoteId]) -> Option<ShowBatch> {
        let mut script = self.script.lock().await;
        script.requests += 1;
        script.batches.push(ids.to_vec());
        let shows: Vec<JsonValue> = ids
            .iter()
            .filter_map(|id| {
                script
                    .shows
                    .iter()
                    .find(|s| s.get("id").and_then(JsonValue::as_i64) == Some(*id))
                    .cloned()
            })
            .collect();
        Some(ShowBatch {
            shows: decode_records(&shows, "shows"),
            reels: decode_records(&script.reels, "reels"),
            vods: decode_records(&script.vods, "vods"),
        })
    }

    async fn all_show_ids(&self) -> Option<Vec<RemoteId>> {
        let mut script = self.script.lock().await;
        script.requests += 1;
        script.all_ids.clone()
    }

    async fn download(&self, url: &str) -> Option<Vec<u8>> {
        let mut script = self.script.lock().await;
        script.requests += 1;
        script.downloads += 1;
        script.files.get(url).cloned()
    }
}
