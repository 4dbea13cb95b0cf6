#![allow(missing_docs)]

use std::path::PathBuf;
use std::sync::Arc;

use assert_cmd::cargo::cargo_bin_cmd;
use folio::index::{IndexContext, IndexDefinition, ItemIndex, KeySpec, MemorySource, NullSink};
use folio::queue::{PendingEvent, PENDING_EVENTS};
use folio::FolioConfig;
use serde_json::{json, Map, Value};
use tempfile::TempDir;

fn obj(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        other => panic!("not an object: {other}"),
    }
}

/// Builds a small index on disk and returns its state file.
fn setup_index() -> (TempDir, PathBuf) {
    let dir = TempDir::new().expect("tempdir");
    let source = Arc::new(MemorySource::new("site"));
    let config = FolioConfig {
        source_id: "site".to_owned(),
        default_page_size: 3,
        ..FolioConfig::with_cache_dir(dir.path())
    };
    let ctx = IndexContext::in_memory(config, Arc::clone(&source), Arc::new(NullSink));
    for n in 0..10 {
        source.put(&format!("posts/{n}"), obj(json!({"n": n})));
    }
    let definition = IndexDefinition::sorted(vec!["posts/*".to_owned()], vec![KeySpec::desc("n")]);
    let index = ItemIndex::open(&ctx, "by-n", definition).expect("open index");
    index.wait_idle();
    index.stop();
    index
        .state()
        .set(PENDING_EVENTS, &vec![PendingEvent::removed("posts/3")])
        .expect("queue event");
    let path = ctx.state_path("by-n");
    drop(index);
    (dir, path)
}

#[test]
fn summary_json_reports_both_trees() {
    let (_dir, path) = setup_index();
    let output = cargo_bin_cmd!("folio-inspect")
        .arg(&path)
        .arg("summary")
        .args(["--format", "json"])
        .output()
        .expect("run summary");
    assert!(output.status.success());
    let summary: Value = serde_json::from_slice(&output.stdout).expect("summary json");
    assert_eq!(summary["version"], json!(2));
    assert_eq!(summary["source_cursor"], json!("10"));
    assert_eq!(summary["pending_events"], json!(1));
    assert_eq!(summary["definition"]["type"], json!("ItemIndex"));
    assert_eq!(summary["forward"]["entries"], json!(10));
    assert_eq!(summary["reverse"]["entries"], json!(10));
    assert_eq!(summary["forward"]["page_size"], json!(3));
}

#[test]
fn verify_succeeds_then_fails_on_tampered_page() {
    let (_dir, path) = setup_index();
    cargo_bin_cmd!("folio-inspect")
        .arg(&path)
        .arg("verify")
        .assert()
        .success();

    let page = path.with_extension("").join("forward").join("0.json");
    std::fs::write(&page, br#"{"version": 1, "keys": [], "values": []}"#).expect("tamper");
    let output = cargo_bin_cmd!("folio-inspect")
        .arg(&path)
        .arg("verify")
        .args(["--format", "json"])
        .output()
        .expect("run verify");
    assert_eq!(output.status.code(), Some(1));
    let report: Value = serde_json::from_slice(&output.stdout).expect("verify json");
    assert_eq!(report["success"], json!(false));
    assert_eq!(report["findings"][0]["scope"], json!("forward"));
}

#[test]
fn pending_lists_queued_events() {
    let (_dir, path) = setup_index();
    let output = cargo_bin_cmd!("folio-inspect")
        .arg(&path)
        .arg("pending")
        .output()
        .expect("run pending");
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("1 pending event(s)"));
    assert!(stdout.contains("<ItemRemoved posts/3>"));
}

#[test]
fn missing_state_file_is_an_error() {
    let dir = TempDir::new().expect("tempdir");
    cargo_bin_cmd!("folio-inspect")
        .arg(dir.path().join("absent.index"))
        .arg("summary")
        .assert()
        .code(2);
}
