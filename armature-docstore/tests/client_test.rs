//! Transport tests for the OpenSearch executor against a mock HTTP server.

use armature_docstore::*;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{body_string_contains, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn config(server: &MockServer) -> RepositoryConfig {
    RepositoryConfig::new(server.uri())
        .with_request_timeout(Duration::from_secs(5))
        .with_cluster_info_retry(Duration::from_millis(10), 3)
}

async fn mount_info(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "cluster_name": "test",
            "version": { "number": "2.11.0", "distribution": "opensearch" }
        })))
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_connect_polls_cluster_info() {
    let server = MockServer::start().await;
    mount_info(&server).await;

    let client = OpenSearchClient::connect(config(&server)).await;
    assert!(client.is_ok());
}

#[tokio::test]
async fn test_connect_gives_up_after_max_retries() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(ResponseTemplate::new(503))
        .expect(3)
        .mount(&server)
        .await;

    let err = OpenSearchClient::connect(config(&server)).await.unwrap_err();
    assert!(matches!(err, RepositoryError::ClusterUnavailable { retries: 3 }));
}

#[tokio::test]
async fn test_connect_keeps_polling_after_garbled_info() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>proxy</html>"))
        .up_to_n_times(1)
        .with_priority(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "cluster_name": "test",
            "version": { "number": "2.11.0" }
        })))
        .with_priority(2)
        .expect(1)
        .mount(&server)
        .await;

    let client = OpenSearchClient::connect(config(&server)).await;
    assert!(client.is_ok());
}

#[tokio::test]
async fn test_connect_garbled_info_exhausts_retries() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
        .expect(3)
        .mount(&server)
        .await;

    let err = OpenSearchClient::connect(config(&server)).await.unwrap_err();
    assert!(matches!(err, RepositoryError::ClusterUnavailable { retries: 3 }));
}

#[tokio::test]
async fn test_search_through_client() {
    let server = MockServer::start().await;
    mount_info(&server).await;
    Mock::given(method("POST"))
        .and(path("/orders/_search"))
        .and(body_string_contains("\"status\":\"open\""))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "took": 1,
            "hits": {
                "total": { "value": 1, "relation": "eq" },
                "hits": [{ "_index": "orders", "_id": "1", "_source": { "status": "open" } }]
            }
        })))
        .mount(&server)
        .await;

    let client = OpenSearchClient::connect(config(&server)).await.unwrap();
    let repo = Repository::new(Arc::new(client));

    let result = repo
        .search(
            "orders",
            &SearchOption::new().with_term("status", "open", "filter").with_size(10),
        )
        .await
        .unwrap();

    assert_eq!(result.total, 1);
    assert_eq!(result.documents()[0].id(), "1");
}

#[tokio::test]
async fn test_create_refreshes() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/orders/_doc"))
        .and(query_param("refresh", "true"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({
            "_index": "orders", "_id": "generated", "result": "created"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let client = OpenSearchClient::new(config(&server)).unwrap();
    let repo = Repository::new(Arc::new(client));
    let doc = Document::builder().index("orders").content(r#"{"total":42}"#).build();

    let result = repo.create(&[doc]).await.unwrap();
    assert_eq!(result.documents()[0].id(), "generated");
}

#[tokio::test]
async fn test_bad_request_maps_to_query_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/orders/_count"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "error": { "type": "parsing_exception", "reason": "unknown query [nope]" },
            "status": 400
        })))
        .mount(&server)
        .await;

    let client = OpenSearchClient::new(config(&server)).unwrap();
    let repo = Repository::new(Arc::new(client));

    let err = repo
        .count("orders", &SearchOption::new().with_term("a", 1, "filter"))
        .await
        .unwrap_err();
    assert!(err.is_query_error());
    assert_eq!(err.to_string(), "count: [400] parsing_exception: unknown query [nope]");
}

#[tokio::test]
async fn test_retries_configured_status() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/orders/_count"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/orders/_count"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "count": 7 })))
        .with_priority(2)
        .mount(&server)
        .await;

    let config = config(&server).with_retry(RetryConfig::exponential(3, Duration::from_millis(5)));
    let repo = Repository::new(Arc::new(OpenSearchClient::new(config).unwrap()));

    let result = repo
        .count("orders", &SearchOption::new().with_term("a", 1, "filter"))
        .await
        .unwrap();
    assert_eq!(result.total, 7);
}

#[tokio::test]
async fn test_retry_disabled_surfaces_status() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/orders/_count"))
        .respond_with(ResponseTemplate::new(503).set_body_json(json!({ "error": "unavailable" })))
        .expect(1)
        .mount(&server)
        .await;

    let repo = Repository::new(Arc::new(OpenSearchClient::new(config(&server)).unwrap()));
    let err = repo
        .count("orders", &SearchOption::new().with_term("a", 1, "filter"))
        .await
        .unwrap_err();
    assert!(matches!(err, RepositoryError::Backend(ref m) if m == "[503] unavailable"));
}

#[tokio::test]
async fn test_bulk_through_client() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/_bulk"))
        .and(body_string_contains("{\"index\":{\"_id\":\"1\",\"_index\":\"orders\"}}"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "took": 2,
            "errors": false,
            "items": [{ "index": { "_index": "orders", "_id": "1", "status": 201, "result": "created" } }]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let repo = Repository::new(Arc::new(OpenSearchClient::new(config(&server)).unwrap()));
    let (tx, mut rx) = tokio::sync::mpsc::channel(4);
    let indexer = repo.bulk_indexer(BulkConfig::default().with_workers(1), Some(tx));

    let doc = Document::builder().index("orders").id("1").content(r#"{"total":42}"#).build();
    indexer.add(BulkAction::Index, doc).await.unwrap();
    indexer.close(&CancellationToken::new()).await.unwrap();

    let outcome = rx.recv().await.unwrap();
    assert!(outcome.is_success());
    assert_eq!(outcome.status, Some(201));
}

#[tokio::test]
async fn test_bootstrap_through_client() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(dir.path().join(TEMPLATE_DIR_ECS)).unwrap();
    std::fs::create_dir_all(dir.path().join(TEMPLATE_DIR_INDEX)).unwrap();
    std::fs::write(
        dir.path().join(TEMPLATE_DIR_ECS).join("base.json"),
        r#"{"_meta":{"ecs_version":"8.4.0"},"template":{}}"#,
    )
    .unwrap();
    let manifest = dir.path().join("indices.json");
    std::fs::write(&manifest, r#"{"indices":["orders"]}"#).unwrap();

    let server = MockServer::start().await;
    Mock::given(method("HEAD"))
        .and(path("/_component_template/ecs_8.4.0_base"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/_component_template/ecs_8.4.0_base"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "acknowledged": true })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("HEAD"))
        .and(path("/orders"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/orders"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let client = OpenSearchClient::new(config(&server)).unwrap();
    let mapping = MappingConfig::new(dir.path(), &manifest);
    Bootstrap::new(&client).run(&mapping).await.unwrap();
}
