use nsdb_core::{AuthLevel, Database, DebounceConfig, Dispatcher, Operation, RequestContext};
use parking_lot::RwLock;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn in_namespace(ns: &str) -> RequestContext {
    RequestContext {
        namespace: Some(ns.to_string()),
        ..RequestContext::new(AuthLevel::Namespace)
    }
}

#[tokio::test(start_paused = true)]
async fn burst_of_writes_survives_reboot() {
    let tempdir = tempfile::tempdir().unwrap();
    let storage = tempdir.path().join("storage");
    let config = tempdir.path().join("config.snap");

    let db = Database::boot(&storage, &config, "root").unwrap();
    let dispatcher = Dispatcher::new(Arc::new(RwLock::new(db)), DebounceConfig::default());

    let create = RequestContext {
        namespace: Some("shop".into()),
        ..RequestContext::new(AuthLevel::Database)
    };
    assert!(dispatcher.dispatch(Operation::CreateNamespace, &create).ok);

    let orders = RequestContext {
        collection: Some("orders".into()),
        ..in_namespace("shop")
    };
    assert!(dispatcher.dispatch(Operation::CreateCollection, &orders).ok);

    for i in 0..25 {
        let doc = RequestContext {
            document: Some(format!("o-{i:02}")),
            data: Some(json!({ "n": i })),
            ..orders.clone()
        };
        assert!(dispatcher.dispatch(Operation::CreateDocument, &doc).ok);
    }
    assert_eq!(dispatcher.pending_saves(), 1);

    tokio::time::sleep(Duration::from_millis(301)).await;
    assert_eq!(dispatcher.pending_saves(), 0);

    // The trailing save captured the last write without a final flush.
    let rebooted = Database::boot(&storage, &config, "ignored").unwrap();
    let docs = rebooted.list_documents("shop", "orders").unwrap();
    assert_eq!(docs.len(), 25);
    assert_eq!(
        rebooted.get_document("shop", "orders", "o-24").unwrap(),
        "{\"n\":24}"
    );
    assert_eq!(rebooted.list_namespace_users("shop").unwrap(), vec!["user"]);
}

#[tokio::test]
async fn flush_all_supersedes_pending_saves() {
    let tempdir = tempfile::tempdir().unwrap();
    let storage = tempdir.path().join("storage");
    let config = tempdir.path().join("config.snap");

    let db = Database::boot(&storage, &config, "root").unwrap();
    let dispatcher = Dispatcher::new(Arc::new(RwLock::new(db)), DebounceConfig::default());
    for ns in ["a", "b"] {
        let ctx = RequestContext {
            namespace: Some(ns.into()),
            ..RequestContext::new(AuthLevel::Database)
        };
        assert!(dispatcher.dispatch(Operation::CreateNamespace, &ctx).ok);
    }
    let drop_b = RequestContext {
        namespace: Some("b".into()),
        ..RequestContext::new(AuthLevel::Database)
    };
    assert!(dispatcher.dispatch(Operation::RemoveNamespace, &drop_b).ok);
    assert!(storage.join("b").is_file());

    assert_eq!(dispatcher.flush_all().unwrap(), vec!["a"]);
    assert_eq!(dispatcher.pending_saves(), 0);
    assert!(!storage.join("b").exists());

    let rebooted = Database::boot(&storage, &config, "ignored").unwrap();
    assert_eq!(rebooted.list_namespaces().unwrap(), vec!["a"]);
}
