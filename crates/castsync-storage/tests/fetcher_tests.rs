use castsync_storage::{HttpClientConfig, ResourceFetcher};
use serde_json::json;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn fetcher() -> ResourceFetcher {
    ResourceFetcher::new(HttpClientConfig::default()).expect("fetcher")
}

fn items(n: usize) -> Vec<serde_json::Value> {
    (1..=n).map(|id| json!({ "id": id })).collect()
}

#[tokio::test]
async fn non_success_status_yields_empty_collection() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/channels"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let url = format!("{}/channels", server.uri());
    assert!(fetcher().fetch(&url, "channels", false).await.is_empty());
    assert!(fetcher().try_fetch(&url, "channels", false).await.is_none());
}

#[tokio::test]
async fn malformed_body_and_missing_envelope_key_yield_nothing() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/categories"))
        .respond_with(ResponseTemplate::new(200).set_body_string("{not json"))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/producers"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "projects": [] })))
        .mount(&server)
        .await;

    let fetcher = fetcher();
    let categories = format!("{}/categories", server.uri());
    let producers = format!("{}/producers", server.uri());
    assert!(fetcher.fetch(&categories, "categories", false).await.is_empty());
    assert!(fetcher.try_fetch(&producers, "producers", false).await.is_none());
}

#[tokio::test]
async fn successful_empty_collection_is_distinguishable_from_failure() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/scheduleitems"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "scheduleItems": [] })))
        .mount(&server)
        .await;

    let url = format!("{}/scheduleitems", server.uri());
    assert_eq!(fetcher().try_fetch(&url, "scheduleItems", true).await, Some(vec![]));
}

#[tokio::test]
async fn short_page_is_expanded_exactly_once() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/scheduleitems"))
        .and(query_param("page_size", "10"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "scheduleItems": items(10),
            "meta": { "count": 25, "pageSize": 10 }
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/scheduleitems"))
        .and(query_param("page_size", "35"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "scheduleItems": items(25),
            "meta": { "count": 25, "pageSize": 35 }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let url = format!("{}/scheduleitems?start=2024-01-01&page_size=10", server.uri());
    let records = fetcher().fetch(&url, "scheduleItems", true).await;
    assert_eq!(records.len(), 25);
}

#[tokio::test]
async fn expansion_does_not_loop_on_remaining_shortfall() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/shows"))
        .and(query_param("page_size", "5"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "shows": items(5),
            "meta": { "count": 50, "pageSize": 5 }
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/shows"))
        .and(query_param("page_size", "60"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "shows": items(40),
            "meta": { "count": 90, "pageSize": 60 }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let url = format!("{}/shows?page_size=5", server.uri());
    let records = fetcher().fetch(&url, "shows", true).await;
    assert_eq!(records.len(), 40);
}

#[tokio::test]
async fn expansion_is_skipped_unless_requested() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/projects"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "projects": items(3),
            "meta": { "count": 9, "pageSize": 3 }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let url = format!("{}/projects", server.uri());
    assert_eq!(fetcher().fetch(&url, "projects", false).await.len(), 3);
}
