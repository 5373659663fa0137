//! End-to-end coverage of the scenarios in spec.md §8, driven against the
//! real portable (`notify`-backed) kernel port over a `tempfile` directory.

use std::fs;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use fen_core::{Config, Engine, EventMapper, EventSink, MappingA, SemanticKind, SubscriberId};
use tempfile::tempdir;

struct RecordingSink {
    events: Mutex<Vec<(String, SemanticKind)>>,
}

impl RecordingSink {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            events: Mutex::new(Vec::new()),
        })
    }

    fn snapshot(&self) -> Vec<(String, SemanticKind)> {
        self.events.lock().unwrap().clone()
    }
}

impl EventSink for RecordingSink {
    fn emit_all(&self, path: &str, kind: SemanticKind) {
        self.events.lock().unwrap().push((path.to_string(), kind));
    }

    fn emit_one(&self, _subscriber: SubscriberId, path: &str, kind: SemanticKind) {
        self.events.lock().unwrap().push((path.to_string(), kind));
    }
}

fn fast_config() -> Config {
    Config {
        event_pump_interval: Duration::from_millis(10),
        settle_backoff_base: Duration::from_millis(20),
        settle_backoff_min: Duration::from_millis(40),
        settle_backoff_max: Duration::from_millis(40),
        port_pump_interval: Duration::from_millis(20),
        missing_scan_interval: Duration::from_millis(50),
        ..Config::default()
    }
}

async fn wait_for(sink: &RecordingSink, predicate: impl Fn(&[(String, SemanticKind)]) -> bool) -> bool {
    for _ in 0..100 {
        if predicate(&sink.snapshot()) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

#[tokio::test]
async fn created_after_subscription() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("new-file.txt");
    let engine = Engine::with_config(fast_config()).unwrap();
    let sink = RecordingSink::new();
    let sub = engine.subscribe(&path, Arc::new(MappingA) as Arc<dyn EventMapper>, sink.clone(), false);

    fs::write(&path, b"hello").unwrap();

    let path_str = path.to_string_lossy().to_string();
    assert!(
        wait_for(&sink, |events| events
            .iter()
            .any(|(p, k)| p == &path_str && *k == SemanticKind::Created))
        .await,
        "expected a CREATED event for {path_str}"
    );

    engine.unsubscribe(sub);
}

#[tokio::test]
async fn directory_monitor_discovers_new_child() {
    let dir = tempdir().unwrap();
    let engine = Engine::with_config(fast_config()).unwrap();
    let sink = RecordingSink::new();
    let sub = engine.subscribe(dir.path(), Arc::new(MappingA) as Arc<dyn EventMapper>, sink.clone(), true);

    let child = dir.path().join("child.txt");
    fs::write(&child, b"data").unwrap();

    let child_str = child.to_string_lossy().to_string();
    assert!(
        wait_for(&sink, |events| events
            .iter()
            .any(|(p, k)| p == &child_str && *k == SemanticKind::Created))
        .await,
        "expected a CREATED event for the new child {child_str}"
    );

    engine.unsubscribe(sub);
}

#[tokio::test]
async fn delete_preempts_modify() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("doomed.txt");
    fs::write(&path, b"v1").unwrap();

    let engine = Engine::with_config(fast_config()).unwrap();
    let sink = RecordingSink::new();
    let sub = engine.subscribe(&path, Arc::new(MappingA) as Arc<dyn EventMapper>, sink.clone(), false);

    fs::write(&path, b"v2").unwrap();
    // Give the single-shot association a chance to be re-armed between the
    // two writes, the same gap the kernel primitive itself needs between a
    // delivery and the next one for the same path.
    tokio::time::sleep(Duration::from_millis(80)).await;
    fs::remove_file(&path).unwrap();

    let path_str = path.to_string_lossy().to_string();
    assert!(
        wait_for(&sink, |events| events
            .iter()
            .any(|(p, k)| p == &path_str && *k == SemanticKind::Deleted))
        .await,
        "expected a DELETED event for {path_str}"
    );

    engine.unsubscribe(sub);
}

#[tokio::test]
async fn subscribing_to_a_missing_path_delivers_created_once_it_appears() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("not-there-yet.txt");
    let engine = Engine::with_config(fast_config()).unwrap();
    let sink = RecordingSink::new();
    let sub = engine.subscribe(&path, Arc::new(MappingA) as Arc<dyn EventMapper>, sink.clone(), false);

    let path_str = path.to_string_lossy().to_string();
    // The path doesn't exist yet: Add synthesizes a DELETED immediately and
    // parks the subscription on the Missing List.
    assert!(
        wait_for(&sink, |events| events
            .iter()
            .any(|(p, k)| p == &path_str && *k == SemanticKind::Deleted))
        .await,
        "expected an immediate DELETED event for the not-yet-existing {path_str}"
    );

    fs::write(&path, b"now it exists").unwrap();

    assert!(
        wait_for(&sink, |events| events
            .iter()
            .any(|(p, k)| p == &path_str && *k == SemanticKind::Created))
        .await,
        "expected a CREATED event once {path_str} was created"
    );

    engine.unsubscribe(sub);
}
