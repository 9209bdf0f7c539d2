//! HTTP API over the in-memory scenario, served on an ephemeral port.

mod common;

use std::sync::Arc;

use common::{body, doc_id, harness};
use dedupe_harness::server::router;
use serde_json::{json, Value};

async fn serve() -> (String, Arc<common::MemoryWiki>) {
    let h = harness();
    let wiki = h.wiki.clone();
    let app = router(Arc::new(h.service));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{}", addr), wiki)
}

#[tokio::test]
async fn health_reports_ok() {
    let (base, _) = serve().await;
    let resp: Value = reqwest::get(format!("{}/health", base))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(resp["status"], "ok");
}

#[tokio::test]
async fn scan_merge_and_undo_over_http() {
    let (base, wiki) = serve().await;
    let client = reqwest::Client::new();

    let ingest: Value = client
        .post(format!("{}/orgs/acme/ingest", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(ingest["inserted"], 5);

    let resp = client
        .post(format!("{}/orgs/acme/scan", base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let report: Value = resp.json().await.unwrap();
    assert_eq!(report["pairs_found"], 2);

    let dupes: Value = client
        .get(format!("{}/orgs/acme/duplicates", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(dupes["pairs"].as_array().unwrap().len(), 2);

    let outcome: Value = client
        .post(format!("{}/orgs/acme/merges", base))
        .json(&json!({
            "kept_id": doc_id(1),
            "removed_id": doc_id(2),
            "merged_content": "combined",
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(outcome["success"], true);
    assert!(!wiki.is_live("p2"));
    let merge_id = outcome["operation"]["id"].as_str().unwrap().to_string();

    let check: Value = client
        .get(format!("{}/orgs/acme/merges/{}/undo-check", base, merge_id))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(check["can_undo"], true);

    let undone: Value = client
        .post(format!("{}/orgs/acme/merges/{}/undo", base, merge_id))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(undone["success"], true);
    assert_eq!(wiki.content("p1"), Some(body(1)));
    assert!(wiki.is_live("p2"));

    let history: Value = client
        .get(format!("{}/orgs/acme/merges", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(history["operations"][0]["status"], "undone");
}

#[tokio::test]
async fn errors_map_to_statuses() {
    let (base, _) = serve().await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{}/orgs/acme/scan", base))
        .json(&json!({ "threshold": 2.0 }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let err: Value = resp.json().await.unwrap();
    assert_eq!(err["error"]["code"], "invalid_input");

    let resp = client
        .get(format!("{}/orgs/acme/merges/nope/undo-check", base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);

    let resp = client
        .post(format!("{}/orgs/acme/merges", base))
        .json(&json!({
            "kept_id": doc_id(1),
            "removed_id": doc_id(2),
            "merged_content": "  ",
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
}
