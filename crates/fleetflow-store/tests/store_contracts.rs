//! Contract tests for the `ArtifactStore` trait.
//!
//! These exercise the behavioral contract against both the in-memory fake
//! and the local filesystem backend. Any conforming backend must pass
//! them; core pipeline tests rely on the fake honouring the same rules as
//! production stores.

use fleetflow_store::{ArtifactStore, LocalStore, MemoryStore, StoreError};

fn backends() -> (tempfile::TempDir, Vec<(&'static str, Box<dyn ArtifactStore>)>) {
    let dir = tempfile::tempdir().unwrap();
    let stores: Vec<(&'static str, Box<dyn ArtifactStore>)> = vec![
        ("memory", Box::new(MemoryStore::new())),
        ("local", Box::new(LocalStore::new(dir.path().join("artifacts")))),
    ];
    (dir, stores)
}

#[tokio::test]
async fn contract_text_roundtrip() {
    let (_dir, stores) = backends();
    for (name, store) in stores {
        store
            .write_text("run_a/example.txt", "hello")
            .await
            .unwrap();
        assert!(store.exists("run_a/example.txt").await.unwrap(), "{name}");
        assert_eq!(
            store.read_text("run_a/example.txt").await.unwrap(),
            "hello",
            "{name}"
        );
    }
}

#[tokio::test]
async fn contract_bytes_roundtrip() {
    let (_dir, stores) = backends();
    for (name, store) in stores {
        store
            .write_bytes("run_a/data.bin", &[0u8, 1, 2, 255])
            .await
            .unwrap();
        assert_eq!(
            store.read_bytes("run_a/data.bin").await.unwrap(),
            vec![0u8, 1, 2, 255],
            "{name}"
        );
    }
}

#[tokio::test]
async fn contract_overwrite_is_last_writer_wins() {
    let (_dir, stores) = backends();
    for (name, store) in stores {
        store.write_text("run_a/x.txt", "first").await.unwrap();
        store.write_text("run_a/x.txt", "second").await.unwrap();
        assert_eq!(store.read_text("run_a/x.txt").await.unwrap(), "second", "{name}");
    }
}

#[tokio::test]
async fn contract_read_missing_is_not_found() {
    let (_dir, stores) = backends();
    for (name, store) in stores {
        let err = store.read_text("no/such/key.json").await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }), "{name}: {err}");
    }
}

#[tokio::test]
async fn contract_list_is_recursive_and_leaf_only() {
    let (_dir, stores) = backends();
    for (name, store) in stores {
        store.write_text("run_a/top.txt", "x").await.unwrap();
        store.write_text("run_a/sub/inner.json", "{}").await.unwrap();
        store.write_text("run_b/other.txt", "y").await.unwrap();

        let mut keys = store.list("run_a").await.unwrap();
        keys.sort();
        assert_eq!(
            keys,
            vec!["run_a/sub/inner.json".to_string(), "run_a/top.txt".to_string()],
            "{name}"
        );
    }
}

#[tokio::test]
async fn contract_list_missing_prefix_is_empty() {
    let (_dir, stores) = backends();
    for (name, store) in stores {
        assert!(store.list("absent").await.unwrap().is_empty(), "{name}");
    }
}

#[tokio::test]
async fn contract_delete_prefix_is_recursive_and_idempotent() {
    let (_dir, stores) = backends();
    for (name, store) in stores {
        store.write_text("run_a/a.txt", "x").await.unwrap();
        store.write_text("run_a/sub/b.txt", "y").await.unwrap();
        store.write_text("run_b/keep.txt", "z").await.unwrap();

        store.delete_prefix("run_a").await.unwrap();
        assert!(!store.exists("run_a/a.txt").await.unwrap(), "{name}");
        assert!(!store.exists("run_a/sub/b.txt").await.unwrap(), "{name}");
        assert!(store.exists("run_b/keep.txt").await.unwrap(), "{name}");

        // Absent prefix is not a failure
        store.delete_prefix("run_a").await.unwrap();
    }
}

#[tokio::test]
async fn contract_create_if_absent_succeeds_once() {
    let (_dir, stores) = backends();
    for (name, store) in stores {
        let first = store
            .create_if_absent("locks/worker.lock", b"holder-1")
            .await
            .unwrap();
        let second = store
            .create_if_absent("locks/worker.lock", b"holder-2")
            .await
            .unwrap();
        assert!(first, "{name}");
        assert!(!second, "{name}");
        assert_eq!(
            store.read_text("locks/worker.lock").await.unwrap(),
            "holder-1",
            "{name}: loser must not overwrite"
        );
    }
}

#[tokio::test]
async fn contract_create_if_absent_after_delete() {
    let (_dir, stores) = backends();
    for (name, store) in stores {
        store.create_if_absent("locks/worker.lock", b"one").await.unwrap();
        store.delete_prefix("locks/worker.lock").await.unwrap();
        assert!(
            store.create_if_absent("locks/worker.lock", b"two").await.unwrap(),
            "{name}: delete releases the key"
        );
    }
}

#[tokio::test]
async fn contract_list_runs_sorted_ascending() {
    let (_dir, stores) = backends();
    for (name, store) in stores {
        store.write_text("run-2/x.txt", "x").await.unwrap();
        store.write_text("run-1/x.txt", "x").await.unwrap();
        let runs = store.list_runs().await.unwrap();
        assert_eq!(runs, vec!["run-1".to_string(), "run-2".to_string()], "{name}");
    }
}

#[tokio::test]
async fn contract_json_helpers_roundtrip() {
    use serde::{Deserialize, Serialize};

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Payload {
        run_id: String,
        count: u32,
    }

    let (_dir, stores) = backends();
    for (name, store) in stores {
        let payload = Payload {
            run_id: "run_a".to_string(),
            count: 3,
        };
        fleetflow_store::write_json(store.as_ref(), "run_a/payload.json", &payload)
            .await
            .unwrap();
        let loaded: Payload = fleetflow_store::read_json(store.as_ref(), "run_a/payload.json")
            .await
            .unwrap();
        assert_eq!(loaded, payload, "{name}");

        // Pretty-printed on disk
        let text = store.read_text("run_a/payload.json").await.unwrap();
        assert!(text.contains("\n"), "{name}: expected pretty JSON");
    }
}
