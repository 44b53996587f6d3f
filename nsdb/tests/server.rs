use base64::{engine::general_purpose::STANDARD, Engine};
use nsdb::api;
use nsdb_core::{Database, DebounceConfig, Dispatcher, Reply};
use parking_lot::RwLock;
use std::future::IntoFuture;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

fn basic(user: &str, password: &str) -> String {
    format!("Basic {}", STANDARD.encode(format!("{user}:{password}")))
}

#[tokio::test]
async fn serves_over_tcp() {
    let tempdir = tempfile::tempdir().unwrap();
    let storage = tempdir.path().join("storage");
    let config = tempdir.path().join("config.snap");
    let db = Database::boot(&storage, &config, "s3cret").unwrap();
    let dispatcher = Arc::new(Dispatcher::new(
        Arc::new(RwLock::new(db)),
        DebounceConfig::default(),
    ));
    let app = api::router(api::AppState::new(dispatcher.clone()));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = tokio::spawn(axum::serve(listener, app).into_future());
    tokio::time::sleep(Duration::from_millis(100)).await;

    let client = reqwest::Client::new();
    let url = |path: &str| format!("http://{addr}{path}");

    let resp = client.get(url("/")).send().await.unwrap();
    assert!(resp.status().is_success());
    let hello: Reply = resp.json().await.unwrap();
    assert_eq!(hello.data, Some(api::HELLO.into()));

    let resp = client.get(url("/nsp/new/acme")).send().await.unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::UNAUTHORIZED);
    assert!(resp.headers().contains_key("www-authenticate"));

    let resp = client
        .get(url("/nsp/new/acme"))
        .header("authorization", basic("root", "wrong"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::FORBIDDEN);

    let created: Reply = client
        .get(url("/nsp/new/acme"))
        .header("authorization", basic("root", "s3cret"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(created.ok);

    let listed: Reply = client
        .get(url("/nsp/all"))
        .header("authorization", basic("root", "s3cret"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(listed.data, Some(serde_json::json!(["acme"])));

    let resp = client.get(url("/missing")).send().await.unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::NOT_FOUND);

    server.abort();

    // A fresh boot sees what the flush wrote.
    dispatcher.flush_all().unwrap();
    let rebooted = Database::boot(&storage, &config, "ignored").unwrap();
    assert_eq!(rebooted.list_namespaces().unwrap(), vec!["acme"]);
}
