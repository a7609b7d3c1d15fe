//! DPD HTTP client against a mock server
//!
//! Checks request shape, status classification and a full scrape over the
//! listing and detail pages.

use dpd_ingest::checkpoint::CheckpointStore;
use dpd_ingest::error::ErrorClass;
use dpd_ingest::orchestrator::ScrapeState;
use dpd_ingest::pipeline::{Pipeline, RunMode};
use dpd_ingest::retry::{Attempt, BackoffPolicy};
use dpd_ingest::source::{DpdClientConfig, DpdSourceClient, SourceClient};
use dpd_ingest::types::{ItemReference, ListingCursor, ListingEntry};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use wiremock::{
    matchers::{method, path, query_param},
    Mock, MockServer, ResponseTemplate,
};

const RESULTS_PATH: &str = "/dpd-bdpp/search-fast-recherche-rapide";

fn client(server: &MockServer) -> DpdSourceClient {
    DpdSourceClient::new(DpdClientConfig {
        base_url: server.uri(),
        timeout: Duration::from_secs(5),
        request_delay: Duration::ZERO,
        ..DpdClientConfig::default()
    })
    .expect("client")
}

fn listing_html(rows: &[(&str, &str)], total: usize) -> String {
    let body: String = rows
        .iter()
        .map(|(din, code)| {
            format!(
                r#"<tr><td>Marketed</td>
                   <td><a href="/dpd-bdpp/info?lang=eng&amp;code={code}">{din}</a></td>
                   <td>ACME PHARMA INC</td><td>PRODUCT {din}</td><td>Human</td><td>No</td>
                   <td>Prescription</td><td>1</td><td>WATER</td><td>1 %</td></tr>"#
            )
        })
        .collect();
    format!(
        r#"<html><body><div>Showing 1 to {n} of {total} entries</div>
           <table id="results"><tbody>{body}</tbody></table></body></html>"#,
        n = rows.len()
    )
}

const DETAIL_HTML: &str = r#"
    <html><body>
    <div class="row"><p class="col-sm-4"><strong>Class:</strong></p>
        <p class="col-sm-8">Human</p></div>
    <div class="row"><p class="col-sm-4"><strong>Company:</strong></p>
        <p class="col-sm-8"><a id="company" href="/c">ACME PHARMA INC</a><span>1 Main St</span>
        <span>Toronto</span></p></div>
    <div class="row"><p class="col-sm-4"><strong>Biosimilar Biologic Drug:</strong></p>
        <p class="col-sm-8">No</p></div>
    </body></html>"#;

fn item(source_id: String) -> ItemReference {
    ItemReference::new(
        ListingEntry {
            natural_key: "02240000".into(),
            source_id,
            fields: Default::default(),
        },
        ListingCursor::START,
    )
}

#[tokio::test]
async fn test_fetch_page_sends_listing_query() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(RESULTS_PATH))
        .and(query_param("lang", "eng"))
        .and(query_param("wbdisable", "true"))
        .and(query_param("results_page", "1"))
        .respond_with(
            ResponseTemplate::new(200).set_body_string(listing_html(&[("02240000", "1001")], 1)),
        )
        .expect(1)
        .mount(&server)
        .await;

    let page = match client(&server).fetch_page(1).await {
        Attempt::Ok(page) => page,
        other => panic!("unexpected {other:?}"),
    };
    assert_eq!(page.total, Some(1));
    assert_eq!(page.entries[0].natural_key, "02240000");
    assert_eq!(
        page.entries[0].source_id,
        format!("{}/dpd-bdpp/info?lang=eng&code=1001", server.uri())
    );
}

#[tokio::test]
async fn test_status_classification() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(query_param("results_page", "1"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(query_param("results_page", "2"))
        .respond_with(ResponseTemplate::new(403))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(query_param("results_page", "3"))
        .respond_with(ResponseTemplate::new(429))
        .mount(&server)
        .await;

    let client = client(&server);
    assert!(matches!(client.fetch_page(1).await, Attempt::Retryable(r) if r.contains("503")));
    assert!(matches!(client.fetch_page(2).await, Attempt::Refused(r) if r.contains("403")));
    assert!(matches!(client.fetch_page(3).await, Attempt::Retryable(_)));
}

#[tokio::test]
async fn test_missing_results_table() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(RESULTS_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html><p>Maintenance</p></html>"))
        .mount(&server)
        .await;

    let client = client(&server);
    // On the first page the layout must have changed
    assert!(matches!(client.fetch_page(1).await, Attempt::Fatal(_)));
    // Later pages past the end drop the table
    match client.fetch_page(9).await {
        Attempt::Ok(page) => assert!(page.entries.is_empty()),
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn test_fetch_detail() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/dpd-bdpp/info"))
        .and(query_param("code", "1001"))
        .respond_with(ResponseTemplate::new(200).set_body_string(DETAIL_HTML))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/dpd-bdpp/info"))
        .and(query_param("code", "404"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let client = client(&server);
    let found = item(format!("{}/dpd-bdpp/info?lang=eng&code=1001", server.uri()));
    match client.fetch_detail(&found).await {
        Attempt::Ok(fields) => {
            assert_eq!(fields["Class"], "Human");
            assert_eq!(fields["Company"], "ACME PHARMA INC");
            assert_eq!(fields["City"], "Toronto");
        },
        other => panic!("unexpected {other:?}"),
    }

    let gone = item(format!("{}/dpd-bdpp/info?lang=eng&code=404", server.uri()));
    assert!(matches!(client.fetch_detail(&gone).await, Attempt::Fatal(_)));
}

#[tokio::test]
async fn test_detail_refusal_stops_the_scrape() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(RESULTS_PATH))
        .and(query_param("results_page", "1"))
        .respond_with(ResponseTemplate::new(200).set_body_string(listing_html(
            &[("02240000", "1"), ("02240001", "2")],
            2,
        )))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/dpd-bdpp/info"))
        .and(query_param("code", "1"))
        .respond_with(ResponseTemplate::new(200).set_body_string(DETAIL_HTML))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/dpd-bdpp/info"))
        .and(query_param("code", "2"))
        .respond_with(ResponseTemplate::new(401))
        .expect(1)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let report = Pipeline::new(
        Arc::new(client(&server)),
        None,
        CheckpointStore::new(dir.path().join("cp.jsonl")),
        "HC",
    )
    .with_scrape_policy(BackoffPolicy::immediate(3))
    .run(RunMode::ScrapeOnly)
    .await
    .unwrap();

    let outcome = report.scrape.unwrap();
    assert_eq!(outcome.state, ScrapeState::FatalError);
    assert_eq!(outcome.failure.as_ref().unwrap().class, ErrorClass::PermanentSource);
    assert!(outcome.checkpoint.skipped.is_empty());
    assert_eq!(outcome.checkpoint.records.len(), 1);
}

#[tokio::test]
async fn test_scrape_over_http() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(RESULTS_PATH))
        .and(query_param("results_page", "1"))
        .respond_with(ResponseTemplate::new(200).set_body_string(listing_html(
            &[("02240000", "1"), ("02240001", "2")],
            3,
        )))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(RESULTS_PATH))
        .and(query_param("results_page", "2"))
        .respond_with(ResponseTemplate::new(200).set_body_string(listing_html(&[("02240002", "3")], 3)))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/dpd-bdpp/info"))
        .respond_with(ResponseTemplate::new(200).set_body_string(DETAIL_HTML))
        .expect(3)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let source = Arc::new(client(&server));
    let report = Pipeline::new(source, None, CheckpointStore::new(dir.path().join("cp.json")), "HC")
        .with_scrape_policy(BackoffPolicy::immediate(1))
        .run(RunMode::ScrapeOnly)
        .await
        .unwrap();

    let checkpoint = report.scrape.unwrap().checkpoint;
    assert!(checkpoint.completed);
    let keys: Vec<&str> = checkpoint.records.iter().map(|r| r.natural_key.as_str()).collect();
    assert_eq!(keys, vec!["02240000", "02240001", "02240002"]);
    let record = &checkpoint.records[2];
    assert_eq!(record.page, 2);
    assert_eq!(record.fields["Product"], "PRODUCT 02240002");
    assert_eq!(record.fields["City"], "Toronto");
    assert_eq!(record.fields["Biosimilar Biologic Drug"], "No");
    // Columns absent from both pages still exist
    assert_eq!(record.fields["Anatomical Therapeutic Chemical (ATC)"], "");
}
