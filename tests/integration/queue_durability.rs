#![allow(missing_docs)]

use std::path::Path;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use folio::queue::{
    DurableEventQueue, PendingEvent, StateFile, StopHandle, PENDING_EVENTS, SOURCE_CURSOR,
    STATE_VERSION,
};
use folio::{FolioError, Result};
use parking_lot::Mutex;
use serde_json::json;
use tempfile::tempdir;

fn events(count: usize) -> Vec<PendingEvent> {
    (0..count)
        .map(|n| {
            if n % 3 == 2 {
                PendingEvent::removed(format!("item-{}", n - 1))
            } else {
                PendingEvent::changed(format!("item-{n}"), format!("item-{n}.item"))
            }
        })
        .collect()
}

fn on_disk(path: &Path) -> Result<Vec<PendingEvent>> {
    Ok(StateFile::open(path)?
        .get::<Vec<PendingEvent>>(PENDING_EVENTS)?
        .unwrap_or_default())
}

/// Starts a queue over `path` that applies at most `budget` events before
/// stopping itself, or drains it, and returns what it applied.
fn run_with_budget(path: &Path, budget: usize) -> Result<Vec<PendingEvent>> {
    let state = Arc::new(StateFile::open(path)?);
    let (tx, rx) = mpsc::channel::<StopHandle>();
    let applied = Arc::new(Mutex::new(Vec::new()));
    let log = Arc::clone(&applied);
    let mut stopper: Option<StopHandle> = None;
    let queue = DurableEventQueue::start("budget", state, move |event: &PendingEvent| -> Result<()> {
        if stopper.is_none() {
            stopper = rx.recv_timeout(Duration::from_secs(5)).ok();
        }
        let mut log = log.lock();
        log.push(event.clone());
        if log.len() >= budget {
            if let Some(handle) = &stopper {
                handle.stop();
            }
        }
        Ok(())
    })?;
    tx.send(queue.stop_handle())
        .map_err(|_| FolioError::Invalid("worker gone"))?;
    queue.close_queue();
    queue.join();
    let applied = applied.lock().clone();
    Ok(applied)
}

#[test]
fn every_event_is_applied_once_across_restarts() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("site#idx.index");
    let expected = events(10);
    StateFile::open(&path)?.set(PENDING_EVENTS, &expected)?;

    let mut applied = Vec::new();
    for _ in 0..expected.len() {
        let before = on_disk(&path)?;
        if before.is_empty() {
            break;
        }
        let run = run_with_budget(&path, 3)?;
        assert_eq!(run.as_slice(), &before[..run.len()]);
        assert_eq!(on_disk(&path)?, before[run.len()..].to_vec());
        applied.extend(run);
    }
    assert_eq!(applied, expected);
    assert!(on_disk(&path)?.is_empty());
    Ok(())
}

#[test]
fn queue_leaves_index_keys_alone() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("site#idx.index");
    let state = Arc::new(StateFile::open(&path)?);
    state.update(|doc| {
        doc.insert(SOURCE_CURSOR.to_owned(), json!("42"));
        doc.insert("config".to_owned(), json!({"type": "ItemIndex", "from": ["*"]}));
        Ok(())
    })?;

    let queue = DurableEventQueue::start("keys", Arc::clone(&state), |_: &PendingEvent| -> Result<()> {
        Ok(())
    })?;
    for event in events(5) {
        queue.enqueue(event)?;
    }
    queue.wait_idle();
    drop(queue);

    let reopened = StateFile::open(&path)?;
    assert_eq!(reopened.get::<String>(SOURCE_CURSOR)?.as_deref(), Some("42"));
    assert_eq!(reopened.get_raw("config"), Some(json!({"type": "ItemIndex", "from": ["*"]})));
    assert_eq!(reopened.get_raw("version"), Some(json!(STATE_VERSION)));
    assert!(on_disk(&path)?.is_empty());
    Ok(())
}

#[test]
fn version_one_queue_is_migrated_and_drained() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("legacy.index");
    std::fs::write(
        &path,
        serde_json::to_vec(&json!({
            "version": 1,
            "pendingEvents": [
                {"type": "ItemChanged", "item_id": "a", "path": "a.item"},
                {"type": "MetaChanged", "path": "site.meta"},
                {"type": "ItemRemoved", "item_id": "a"}
            ],
            "source_cursor": "17"
        }))?,
    )?;

    let state = StateFile::open(&path)?;
    assert_eq!(state.get::<String>(SOURCE_CURSOR)?, None);
    drop(state);

    let applied = run_with_budget(&path, usize::MAX)?;
    assert_eq!(
        applied,
        vec![
            PendingEvent::changed("a", "a.item"),
            PendingEvent::MetaChanged {
                path: "site.meta".to_owned()
            },
            PendingEvent::removed("a"),
        ]
    );
    let migrated = std::fs::read_to_string(&path)?;
    assert!(migrated.contains(&format!("\"version\": {STATE_VERSION}")));
    Ok(())
}

#[test]
fn stopped_queue_rejects_new_events() -> Result<()> {
    let dir = tempdir()?;
    let state = Arc::new(StateFile::open(dir.path().join("q.index"))?);
    let queue = DurableEventQueue::start("stopped", state, |_: &PendingEvent| -> Result<()> { Ok(()) })?;
    assert!(queue.is_accepting());
    queue.stop();
    queue.join();
    assert!(queue.is_stopped());
    assert!(matches!(
        queue.enqueue(PendingEvent::removed("late")),
        Err(FolioError::Closed(_))
    ));
    Ok(())
}
