//! PostgREST store against a mock server

use dpd_ingest::error::RemoteError;
use dpd_ingest::mapper::MappedRow;
use dpd_ingest::remote::{PostgrestConfig, PostgrestStore, RemoteStore};
use dpd_ingest::retry::BackoffPolicy;
use dpd_ingest::sync::{SyncOptions, SyncWriter};
use serde_json::json;
use std::sync::Arc;
use wiremock::{
    matchers::{body_partial_json, header, method, path, query_param},
    Mock, MockServer, ResponseTemplate,
};

const TABLE_PATH: &str = "/rest/v1/nexara_all_source";

fn store(server: &MockServer, page_size: usize) -> PostgrestStore {
    let mut config = PostgrestConfig::new(server.uri(), "service-key", "nexara_all_source");
    config.page_size = page_size;
    PostgrestStore::new(config).expect("store")
}

fn row(uid: &str) -> MappedRow {
    let mut payload = serde_json::Map::new();
    payload.insert("Product".into(), json!("ACMEPRIL"));
    MappedRow {
        row_uid: uid.to_string(),
        source: "HC".to_string(),
        match_bucket: "HC".to_string(),
        payload,
    }
}

#[tokio::test]
async fn test_fetch_row_uids_pages_through_table() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(TABLE_PATH))
        .and(header("apikey", "service-key"))
        .and(header("authorization", "Bearer service-key"))
        .and(query_param("select", "row_uid"))
        .and(query_param("source", "eq.HC"))
        .and(query_param("offset", "0"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!([{"row_uid": "HC:A1"}, {"row_uid": "HC:A2"}])),
        )
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(TABLE_PATH))
        .and(query_param("offset", "2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([{"row_uid": "HC:A3"}])))
        .expect(1)
        .mount(&server)
        .await;

    let uids = store(&server, 2).fetch_row_uids("HC").await.unwrap();
    assert_eq!(uids.len(), 3);
    assert!(uids.contains("HC:A3"));
}

#[tokio::test]
async fn test_fetch_row_uids_failure_is_classified() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(TABLE_PATH))
        .respond_with(ResponseTemplate::new(503).set_body_string("upstream down"))
        .mount(&server)
        .await;

    let err = store(&server, 1000).fetch_row_uids("HC").await.unwrap_err();
    assert!(matches!(err, RemoteError::Transient(ref m) if m.contains("upstream down")));
}

#[tokio::test]
async fn test_fetch_row_uids_skips_rows_without_uid() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(TABLE_PATH))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!([{"row_uid": "HC:A1"}, {"row_uid": null}, {"row_uid": "HC:A2"}])),
        )
        .expect(1)
        .mount(&server)
        .await;

    let uids = store(&server, 1000).fetch_row_uids("HC").await.unwrap();
    let mut sorted: Vec<String> = uids.into_iter().collect();
    sorted.sort();
    assert_eq!(sorted, vec!["HC:A1", "HC:A2"]);
}

#[tokio::test]
async fn test_undecodable_row_uid_page_is_rejected() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(TABLE_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>gateway login</html>"))
        .mount(&server)
        .await;

    let err = store(&server, 1000).fetch_row_uids("HC").await.unwrap_err();
    assert!(matches!(err, RemoteError::Rejected(ref m) if m.contains("unreadable row_uid page")));
}

#[tokio::test]
async fn test_insert_rows_posts_flat_json() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(TABLE_PATH))
        .and(header("prefer", "return=minimal"))
        .and(body_partial_json(json!([{"row_uid": "HC:A1", "source": "HC", "Product": "ACMEPRIL"}])))
        .respond_with(ResponseTemplate::new(201))
        .expect(1)
        .mount(&server)
        .await;

    store(&server, 1000).insert_rows(&[row("HC:A1")]).await.unwrap();
}

#[tokio::test]
async fn test_insert_rows_error_mapping() {
    let cases = [
        (409, "", "conflict"),
        (
            400,
            r#"{"code":"23505","message":"duplicate key value violates unique constraint"}"#,
            "conflict",
        ),
        (502, "bad gateway", "transient"),
        (400, r#"{"code":"PGRST204","message":"column not found"}"#, "rejected"),
    ];

    for (status, body, expected) in cases {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(TABLE_PATH))
            .respond_with(ResponseTemplate::new(status).set_body_string(body))
            .mount(&server)
            .await;

        let err = store(&server, 1000).insert_rows(&[row("HC:A1")]).await.unwrap_err();
        let kind = match err {
            RemoteError::Conflict(_) => "conflict",
            RemoteError::Transient(_) => "transient",
            RemoteError::Rejected(_) => "rejected",
        };
        assert_eq!(kind, expected, "HTTP {status} {body}");
    }
}

#[tokio::test]
async fn test_sync_writer_over_http_retries_then_records_failure() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(TABLE_PATH))
        .and(body_partial_json(json!([{"row_uid": "HC:A3"}])))
        .respond_with(ResponseTemplate::new(503))
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(TABLE_PATH))
        .respond_with(ResponseTemplate::new(201))
        .expect(2)
        .mount(&server)
        .await;

    let writer = SyncWriter::new(
        Arc::new(store(&server, 1000)),
        SyncOptions {
            batch_size: 1,
            policy: BackoffPolicy::immediate(2),
            ..SyncOptions::default()
        },
    );
    let report = writer.sync(vec![row("HC:A1"), row("HC:A2"), row("HC:A3")]).await;

    assert_eq!(report.batches, 3);
    assert_eq!(report.inserted, 2);
    assert_eq!(report.failed_batches.len(), 1);
    assert_eq!(report.failed_batches[0].row_uids, vec!["HC:A3"]);
}
