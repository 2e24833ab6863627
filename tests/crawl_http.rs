use std::path::Path;
use std::time::Duration;

use httptest::matchers::{all_of, contains, not, request, url_decoded};
use httptest::responders::json_encoded;
use httptest::{Expectation, Server};
use secrecy::SecretString;
use serde_json::json;
use tempfile::tempdir;

use places_grid_crawler::{
    AppConfig, BoundingBox, CrawlSettings, CrawlerApp, JournalSettings, ProviderEndpoints,
    RegionConfig, RegionStop,
};

fn config(server: &Server, dir: &Path) -> AppConfig {
    AppConfig {
        database_path: dir.join("data").join("places.sqlite"),
        journal: JournalSettings {
            enabled: true,
            directory: dir.join("data"),
            batch_size: 1,
            max_file_bytes: 1 << 20,
            max_files: 2,
        },
        endpoints: ProviderEndpoints {
            nearby_search: server.url("/maps/api/place/nearbysearch/json").to_string(),
            place_details: server.url("/maps/api/place/details/json").to_string(),
            connect_timeout: Duration::from_secs(2),
            read_timeout: Duration::from_secs(5),
        },
        google_places_api_key: Some(SecretString::from("integration-key".to_string())),
        keyword: "restaurant".into(),
        crawl: CrawlSettings {
            step_multiplier: 1.0,
            ..CrawlSettings::default().without_delays()
        },
    }
}

fn result(place_id: &str) -> serde_json::Value {
    json!({
        "place_id": place_id,
        "name": format!("Diner {place_id}"),
        "vicinity": "Main St",
        "geometry": { "location": { "lat": 0.004, "lng": 0.004 } },
        "rating": 4.0,
        "user_ratings_total": 12,
        "types": ["restaurant"]
    })
}

fn tiny_region(name: &str, lat: f64) -> RegionConfig {
    RegionConfig::new(name, BoundingBox::new(lat, lat + 0.01, 0.0, 0.01), 500)
}

#[tokio::test]
async fn crawls_pages_and_dedups_across_points() {
    let server = Server::run();
    server.expect(
        Expectation::matching(all_of![
            request::method("GET"),
            request::path("/maps/api/place/nearbysearch/json"),
            request::query(url_decoded(contains(("keyword", "restaurant")))),
            request::query(url_decoded(contains(("radius", "500")))),
            request::query(url_decoded(contains(("key", "integration-key")))),
            request::query(url_decoded(not(contains(("pagetoken", "tok-2")))))
        ])
        .times(9)
        .respond_with(json_encoded(json!({
            "status": "OK",
            "results": [result("a"), result("b")],
            "next_page_token": "tok-2"
        }))),
    );
    server.expect(
        Expectation::matching(all_of![
            request::path("/maps/api/place/nearbysearch/json"),
            request::query(url_decoded(contains(("pagetoken", "tok-2"))))
        ])
        .times(9)
        .respond_with(json_encoded(json!({
            "status": "OK",
            "results": [result("c")]
        }))),
    );

    let dir = tempdir().unwrap();
    let app = CrawlerApp::initialize(config(&server, dir.path())).unwrap();
    let run = app.crawl(&[tiny_region("Tiny", 0.0)]).await.unwrap();

    let report = &run.regions[0];
    assert_eq!(report.points_visited, 9);
    assert_eq!(report.results_seen, 27);
    assert_eq!(report.new_records, 3);
    assert_eq!(report.stop, RegionStop::GridExhausted);

    let store = app.open_store().unwrap();
    assert_eq!(store.count_region("Tiny").unwrap(), 3);
    let record = store.get("Tiny", "c").unwrap().unwrap();
    assert_eq!(record.name.as_deref(), Some("Diner c"));
    assert_eq!(record.raw_payload["user_ratings_total"], 12);

    let journal = std::fs::read_to_string(dir.path().join("data").join("crawl-journal.jsonl"))
        .unwrap();
    assert!(journal.contains("region_started"));
    assert!(journal.contains("region_finished"));
}

#[tokio::test]
async fn denied_key_aborts_before_next_region() {
    let server = Server::run();
    server.expect(
        Expectation::matching(request::path("/maps/api/place/nearbysearch/json"))
            .times(1)
            .respond_with(json_encoded(json!({
                "status": "REQUEST_DENIED",
                "error_message": "The provided API key is invalid.",
                "results": []
            }))),
    );

    let dir = tempdir().unwrap();
    let app = CrawlerApp::initialize(config(&server, dir.path())).unwrap();
    let err = app
        .crawl(&[tiny_region("First", 0.0), tiny_region("Second", 10.0)])
        .await
        .unwrap_err();

    assert!(err.is_process_fatal());
    assert!(err.to_string().contains("REQUEST_DENIED"));
    let store = app.open_store().unwrap();
    assert!(store.region_counts().unwrap().is_empty());
}

#[tokio::test]
async fn backfills_postal_codes_for_crawled_places() {
    let server = Server::run();
    server.expect(
        Expectation::matching(request::path("/maps/api/place/nearbysearch/json"))
            .times(9)
            .respond_with(json_encoded(json!({
                "status": "OK",
                "results": [result("a"), result("b")]
            }))),
    );
    server.expect(
        Expectation::matching(all_of![
            request::path("/maps/api/place/details/json"),
            request::query(url_decoded(contains((
                "fields",
                "address_component,formatted_address"
            ))))
        ])
        .times(2)
        .respond_with(json_encoded(json!({
            "status": "OK",
            "result": {
                "formatted_address": "1 Main St, Springfield, IL 62701, USA",
                "address_components": [
                    { "long_name": "62701", "short_name": "62701", "types": ["postal_code"] }
                ]
            }
        }))),
    );

    let dir = tempdir().unwrap();
    let app = CrawlerApp::initialize(config(&server, dir.path())).unwrap();
    app.crawl(&[tiny_region("Springfield", 0.0)]).await.unwrap();

    let report = app.backfill_postal(None).await.unwrap();
    assert_eq!(report.total, 2);
    assert_eq!(report.updated, 2);

    let store = app.open_store().unwrap();
    let record = store.get("Springfield", "a").unwrap().unwrap();
    assert_eq!(record.postal_code.as_deref(), Some("62701"));
    assert_eq!(
        record.address.as_deref(),
        Some("1 Main St, Springfield, IL 62701, USA")
    );
}
