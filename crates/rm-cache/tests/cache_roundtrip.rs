//! CacheStore behavior across separate store instances, the way a collect
//! run and a later transmit-only run see the same directory.

use std::time::{Duration, SystemTime};

use filetime::FileTime;
use rm_cache::{CacheStore, DEFAULT_RETENTION};
use rm_common::ConfigurationSnapshot;
use serde_json::json;

fn snapshot(interval: u64) -> ConfigurationSnapshot {
    let mut snap = ConfigurationSnapshot::defaults();
    snap.collection_interval_secs = interval;
    snap
}

#[test]
fn payload_survives_across_instances() {
    let dir = tempfile::tempdir().unwrap();
    let payload = json!({
        "metadata": {"deviceId": "abc", "collectionType": "full"},
        "hardware": {"cpu": {"cores": 8, "brand": "Apple M2"}, "memory": [16, 32]},
        "network": {"interfaces": [{"name": "en0", "mac": "aa:bb"}]}
    });

    CacheStore::new(dir.path()).persist_payload(&payload).unwrap();

    let loaded = CacheStore::new(dir.path()).load_payload().unwrap().unwrap();
    assert_eq!(loaded, payload);
    // Structural equality does not depend on serialized key order.
    let reordered: serde_json::Value = serde_json::from_str(
        r#"{"network":{"interfaces":[{"mac":"aa:bb","name":"en0"}]},
            "hardware":{"memory":[16,32],"cpu":{"brand":"Apple M2","cores":8}},
            "metadata":{"collectionType":"full","deviceId":"abc"}}"#,
    )
    .unwrap();
    assert_eq!(loaded, reordered);
}

#[test]
fn overwrite_leaves_no_temp_files() {
    let dir = tempfile::tempdir().unwrap();
    let store = CacheStore::new(dir.path());
    for i in 0..5 {
        store.persist_payload(&json!({ "iteration": i })).unwrap();
    }
    assert_eq!(store.load_payload().unwrap(), Some(json!({ "iteration": 4 })));

    let names: Vec<String> = std::fs::read_dir(dir.path())
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    assert_eq!(names, vec!["collected_data.json".to_string()]);
}

#[test]
fn skip_decision_examples() {
    let dir = tempfile::tempdir().unwrap();
    let store = CacheStore::new(dir.path());
    let now = 1_760_000_000;

    // (recorded offset, interval, force, expected skip)
    let cases = [
        (None, 3600, false, false),
        (Some(10), 3600, false, true),
        (Some(3599), 3600, false, true),
        (Some(3600), 3600, false, false),
        (Some(7200), 3600, false, false),
        (Some(10), 3600, true, false),
        (Some(10), 5, false, false),
    ];

    for (offset, interval, force, expected) in cases {
        let _ = std::fs::remove_file(store.timestamp_path());
        if let Some(offset) = offset {
            store.record_collection_time(now - offset).unwrap();
        }
        assert_eq!(
            store.should_skip_at(&snapshot(interval), force, now),
            expected,
            "offset={:?} interval={} force={}",
            offset,
            interval,
            force
        );
    }
}

#[test]
fn prune_removes_only_expired_payloads() {
    let dir = tempfile::tempdir().unwrap();
    let store = CacheStore::new(dir.path());
    store.record_collection_time(1_760_000_000).unwrap();
    store.persist_payload(&json!({"fresh": true})).unwrap();
    store
        .persist_module_payload("inventory", &json!({"asset": "A-1"}))
        .unwrap();
    store
        .persist_module_payload("security", &json!({"sip": true}))
        .unwrap();

    let old = FileTime::from_system_time(SystemTime::now() - Duration::from_secs(2 * 86_400));
    for id in ["inventory", "security"] {
        filetime::set_file_times(store.module_path(id).unwrap(), old, old).unwrap();
    }

    let report = store.prune_older_than(DEFAULT_RETENTION);
    assert_eq!(report.removed.len(), 2);
    assert!(report.failed.is_empty());
    assert_eq!(store.load_module_payload("inventory").unwrap(), None);
    assert_eq!(store.load_payload().unwrap(), Some(json!({"fresh": true})));
    assert_eq!(store.last_collection_time().unwrap(), Some(1_760_000_000));
}
