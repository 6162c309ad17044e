//! Full harvest over HTTP against a mock catalog

use gleaner::config::{Config, TargetEntry};
use gleaner::crawler::{HttpCatalogFetcher, Orchestrator};
use gleaner::storage::{RecordSink, SqliteCheckpointStore, SqliteRecordSink};
use std::path::Path;
use std::sync::Arc;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn listing_page(titles: &[&str], next: Option<&str>) -> String {
    let products: String = titles
        .iter()
        .map(|title| {
            format!(
                r#"<article class="product_pod">
                    <div class="image_container"><img src="/media/{slug}.jpg"></div>
                    <p class="star-rating Four"></p>
                    <h3><a href="/catalogue/{slug}/index.html" title="{title}">{title}</a></h3>
                    <div class="product_price">
                        <p class="price_color">£20.00</p>
                        <p class="instock availability"> In stock </p>
                    </div>
                </article>"#,
                slug = title.to_lowercase().replace(' ', "-"),
                title = title
            )
        })
        .collect();
    let pager = next
        .map(|href| format!(r#"<ul class="pager"><li class="next"><a href="{}">next</a></li></ul>"#, href))
        .unwrap_or_default();
    format!("<html><body><ol>{}</ol>{}</body></html>", products, pager)
}

async fn mount(server: &MockServer, route: &str, body: String) {
    Mock::given(method("GET"))
        .and(path(route))
        .respond_with(ResponseTemplate::new(200).set_body_string(body))
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_http_harvest_end_to_end() {
    let server = MockServer::start().await;
    mount(
        &server,
        "/fiction/index.html",
        listing_page(&["Dune", "Emma"], Some("page-2.html")),
    )
    .await;
    mount(&server, "/fiction/page-2.html", listing_page(&["Ulysses"], None)).await;
    mount(&server, "/mystery/index.html", listing_page(&["Rebecca"], None)).await;
    Mock::given(method("GET"))
        .and(path("/poetry/index.html"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let mut config: Config = crate::common::test_config(dir.path(), &[]);
    config.scraping.max_retries = 2;
    config.targets = ["Fiction", "Mystery", "Poetry"]
        .iter()
        .map(|key| TargetEntry {
            key: key.to_string(),
            url: format!("{}/{}/index.html", server.uri(), key.to_lowercase()),
        })
        .collect();

    let fetcher = Arc::new(HttpCatalogFetcher::new(&config).unwrap());
    let store = Arc::new(SqliteCheckpointStore::new(Path::new(&config.checkpoint.database_path)).unwrap());
    let sink = Arc::new(SqliteRecordSink::new(Path::new(&config.data.output_path)).unwrap());
    let orchestrator =
        Orchestrator::new(config, fetcher, store, sink.clone(), "hash".to_string()).unwrap();

    let report = orchestrator.run().await.unwrap();

    assert_eq!(report.tasks.completed, 2);
    assert_eq!(report.tasks.failed, 1);
    assert_eq!(report.tasks.failed_tasks[0].target_key, "Poetry");
    assert!(report.tasks.failed_tasks[0]
        .last_error
        .as_deref()
        .unwrap_or_default()
        .contains("404"));
    assert_eq!(report.data.total_written, 4);
    assert_eq!(sink.count().unwrap(), 4);

    let fiction = orchestrator
        .registry()
        .all_sessions()
        .into_iter()
        .find(|s| s.target_key == "Fiction")
        .unwrap();
    assert_eq!(fiction.pages_count, 2);
    assert_eq!(fiction.records_count, 3);

    let rows = orchestrator.aggregator().sample(10).unwrap();
    assert_eq!(rows.len(), 4);
    let dune = rows
        .iter()
        .find(|row| row.iter().any(|(name, value)| *name == "title" && value == "Dune"))
        .unwrap();
    let field = |name: &str| {
        dune.iter()
            .find(|(n, _)| *n == name)
            .map(|(_, v)| v.clone())
            .unwrap()
    };
    assert_eq!(field("rating"), "4");
    assert_eq!(field("availability"), "In stock");
    assert_eq!(field("url"), format!("{}/catalogue/dune/index.html", server.uri()));
    assert_eq!(field("image_url"), format!("{}/media/dune.jpg", server.uri()));
}
