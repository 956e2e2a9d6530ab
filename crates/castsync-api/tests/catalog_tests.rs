use castsync_api::{CatalogSource, HttpCatalog, ScheduleWindow};
use castsync_core::RemoteRef;
use castsync_storage::{HttpClientConfig, ResourceFetcher};
use chrono::{DateTime, NaiveDate, Utc};
use serde_json::json;
use wiremock::matchers::{body_partial_json, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn catalog(server: &MockServer) -> HttpCatalog {
    let fetcher = ResourceFetcher::new(HttpClientConfig::default()).expect("fetcher");
    HttpCatalog::new(format!("{}/", server.uri()), fetcher)
}

#[tokio::test]
async fn changed_show_search_posts_filter_and_returns_ordered_ids() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/shows/search/advanced"))
        .and(body_partial_json(json!({
            "savedShowSearch": { "query": { "groups": [{ "filters": [{
                "field": "lastModified",
                "operator": "greaterThan",
                "searchValue": "2024-01-01T00:00:00Z"
            }]}]}}
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "savedShowSearch": { "results": [30, 10, 20] }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let since: DateTime<Utc> = "2024-01-01T00:00:00Z".parse().expect("since");
    let ids = catalog(&server).changed_show_ids(since).await;
    assert_eq!(ids, Some(vec![30, 10, 20]));
}

#[tokio::test]
async fn changed_show_search_failure_is_none() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/shows/search/advanced"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let since: DateTime<Utc> = "2024-01-01T00:00:00Z".parse().expect("since");
    assert_eq!(catalog(&server).changed_show_ids(since).await, None);
}

#[tokio::test]
async fn show_batch_requests_ids_and_decodes_sideloads() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/shows"))
        .and(query_param("ids[]", "7"))
        .and(query_param("ids[]", "8"))
        .and(query_param("page_size", "2"))
        .and(query_param("include", "reel,vod,webfile,thumbnail"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "shows": [
                { "id": 7, "title": "Seven", "reels": [1], "vods": [3] },
                { "id": 8, "title": "Eight", "reels": [2] }
            ],
            "reels": [{ "id": 1, "length": 60 }, { "id": 2, "length": 90 }],
            "vods": [{ "id": 3, "url": "https://vod/3", "embedCode": "<iframe>" }]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let batch = catalog(&server).shows_by_ids(&[7, 8]).await.expect("batch");
    assert_eq!(batch.shows.len(), 2);
    assert_eq!(batch.shows[0].reels, vec![RemoteRef::Id(1)]);
    assert_eq!(batch.reels.len(), 2);
    assert_eq!(batch.vods[0].embed_code.as_deref(), Some("<iframe>"));
}

#[tokio::test]
async fn schedule_items_carry_window_and_distinguish_failure() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/scheduleitems"))
        .and(query_param("start", "2024-02-29"))
        .and(query_param("end", "2024-03-15"))
        .and(query_param("include_cg_exempt", "true"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "scheduleItems": [
                { "id": 100, "show": 7, "channel": 1, "runDateTime": "2024-03-01T10:00:00", "cgExempt": true },
                { "id": 101, "show": 8, "channel": 1, "runDateTime": "2024-03-01T11:00:00", "deleted": true }
            ],
            "meta": { "count": 2, "pageSize": 1000 }
        })))
        .mount(&server)
        .await;

    let window = ScheduleWindow::rolling(NaiveDate::from_ymd_opt(2024, 3, 1).expect("date"), 14);
    let items = catalog(&server).schedule_items(window).await.expect("items");
    assert_eq!(items.raw.len(), 2);
    assert!(items.items[0].cg_exempt);
    assert!(items.items[1].deleted);

    let down = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/scheduleitems"))
        .respond_with(ResponseTemplate::new(502))
        .mount(&down)
        .await;
    assert!(catalog(&down).schedule_items(window).await.is_none());
}

#[tokio::test]
async fn bulk_id_listing_and_reference_collections() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/shows"))
        .and(query_param("id_only", "true"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "shows": [1, 2, { "id": 3 }] })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/livestreams"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "liveStreams": [{ "id": 5, "embedCode": "<video>" }]
        })))
        .mount(&server)
        .await;

    let catalog = catalog(&server);
    assert_eq!(catalog.all_show_ids().await, Some(vec![1, 2, 3]));
    let streams = catalog.live_streams().await;
    assert_eq!(streams.items[0].embed_code.as_deref(), Some("<video>"));
    assert!(catalog.channels().await.items.is_empty());
}

#[tokio::test]
async fn producers_beyond_first_page_are_loaded_with_one_expanded_request() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/producers"))
        .and(query_param("page_size", "13"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "producers": [
                { "id": 1, "name": "First" },
                { "id": 2, "name": "Second" },
                { "id": 3, "name": "Third" }
            ],
            "meta": { "count": 3, "pageSize": 13 }
        })))
        .with_priority(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/producers"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "producers": [{ "id": 1, "name": "First" }],
            "meta": { "count": 3, "pageSize": 1 }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let producers = catalog(&server).producers().await;
    assert_eq!(producers.raw.len(), 3);
    assert_eq!(producers.items[2].name, "Third");
}

#[tokio::test]
async fn truncated_id_listing_still_returns_what_arrived() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/shows"))
        .and(query_param("id_only", "true"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "shows": [1, 2],
            "meta": { "count": 5, "pageSize": 2 }
        })))
        .expect(1)
        .mount(&server)
        .await;

    assert_eq!(catalog(&server).all_show_ids().await, Some(vec![1, 2]));
}
