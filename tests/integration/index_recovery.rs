#![allow(missing_docs)]

use std::path::Path;
use std::sync::mpsc::{channel, Receiver};
use std::sync::Arc;

use folio::index::{
    ChangeSource, ChannelSink, IndexContext, IndexDefinition, ItemIndex, KeySpec, MemorySource,
    PageChangeNotification,
};
use folio::queue::{PendingEvent, StateFile, PENDING_EVENTS, SOURCE_CURSOR};
use folio::{FolioConfig, FolioError, Key, Result};
use serde_json::{json, Map, Value};
use tempfile::tempdir;

fn obj(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        other => panic!("not an object: {other}"),
    }
}

fn context(
    cache_dir: &Path,
    source: &Arc<MemorySource>,
) -> (IndexContext, Receiver<PageChangeNotification>) {
    let (tx, rx) = channel();
    let config = FolioConfig {
        source_id: "site".to_owned(),
        default_page_size: 4,
        ..FolioConfig::with_cache_dir(cache_dir)
    };
    let ctx = IndexContext::in_memory(config, Arc::clone(source), Arc::new(ChannelSink::new(tx)));
    (ctx, rx)
}

fn by_rank() -> IndexDefinition {
    IndexDefinition::sorted(
        vec!["posts/**".to_owned()],
        vec![KeySpec::desc("rank"), KeySpec::asc("title")],
    )
}

fn post(source: &MemorySource, n: i64) -> PendingEvent {
    source.put(
        &format!("posts/{n}"),
        obj(json!({"rank": n % 3, "title": format!("post {n}")})),
    )
}

fn snapshot(index: &ItemIndex) -> Result<Vec<(Key, String)>> {
    index.wait_idle();
    index.verify()?;
    index.entries()
}

/// Index built by replaying the whole source from scratch.
fn reference(source: &Arc<MemorySource>) -> Result<Vec<(Key, String)>> {
    let dir = tempdir()?;
    let (ctx, _rx) = context(dir.path(), source);
    let index = ItemIndex::open(&ctx, "by-rank", by_rank())?;
    snapshot(&index)
}

/// Runs the first `applied` changes through a live index, records the rest in
/// the source only, and leaves the state file the way a process killed right
/// after applying `applied` events would.
fn crashed_run(
    ctx: &IndexContext,
    source: &Arc<MemorySource>,
    applied: i64,
    total: i64,
    keep_applied_in_queue: bool,
) -> Result<Vec<PendingEvent>> {
    let index = ItemIndex::open(ctx, "by-rank", by_rank())?;
    let mut done = Vec::new();
    for n in 0..applied {
        let event = post(source, n);
        index.trigger(&event)?;
        done.push(event);
    }
    index.wait_idle();
    let mut remaining = Vec::new();
    for n in applied..total {
        remaining.push(post(source, n));
    }
    remaining.push(source.delete("posts/1"));
    index.save_source_cursor(source.cursor().as_deref())?;
    let state = Arc::clone(index.state());
    index.stop();
    drop(index);

    let queued: Vec<PendingEvent> = if keep_applied_in_queue {
        done.into_iter().chain(remaining.iter().cloned()).collect()
    } else {
        remaining.clone()
    };
    state.set(PENDING_EVENTS, &queued)?;
    Ok(remaining)
}

#[test]
fn restart_applies_exactly_the_unapplied_events() -> Result<()> {
    let dir = tempdir()?;
    let source = Arc::new(MemorySource::new("site"));
    let (ctx, _rx) = context(dir.path(), &source);
    let remaining = crashed_run(&ctx, &source, 5, 12, false)?;

    let (ctx, rx) = context(dir.path(), &source);
    let index = ItemIndex::open(&ctx, "by-rank", by_rank())?;
    let recovered = snapshot(&index)?;

    assert_eq!(recovered, reference(&source)?);
    assert_eq!(rx.try_iter().count(), remaining.len());
    assert!(index
        .state()
        .get::<Vec<Value>>(PENDING_EVENTS)?
        .unwrap_or_default()
        .is_empty());
    assert!(!recovered.iter().any(|(_, id)| id == "posts/1"));
    Ok(())
}

#[test]
fn replaying_already_applied_events_changes_nothing() -> Result<()> {
    let dir = tempdir()?;
    let source = Arc::new(MemorySource::new("site"));
    let (ctx, _rx) = context(dir.path(), &source);
    crashed_run(&ctx, &source, 6, 9, true)?;

    let index = ItemIndex::open(&ctx, "by-rank", by_rank())?;
    assert_eq!(snapshot(&index)?, reference(&source)?);
    Ok(())
}

#[test]
fn cursor_gap_is_replayed_at_open() -> Result<()> {
    let dir = tempdir()?;
    let source = Arc::new(MemorySource::new("site").with_batch_size(3));
    let (ctx, _rx) = context(dir.path(), &source);
    {
        let index = ItemIndex::open(&ctx, "by-rank", by_rank())?;
        for n in 0..4 {
            index.trigger(&post(&source, n))?;
        }
        index.wait_idle();
        index.save_source_cursor(source.cursor().as_deref())?;
    }

    // Changes made while no index was running.
    for n in 4..15 {
        post(&source, n);
    }
    source.delete("posts/0");
    source.put("pages/about", obj(json!({"rank": 9})));

    let index = ItemIndex::open(&ctx, "by-rank", by_rank())?;
    assert_eq!(snapshot(&index)?, reference(&source)?);
    assert_eq!(index.source_cursor()?, source.cursor());
    assert_eq!(index.get_metadata()?.item_count, 14);
    Ok(())
}

#[test]
fn version_one_state_rebuilds_trees() -> Result<()> {
    let dir = tempdir()?;
    let source = Arc::new(MemorySource::new("site"));
    for n in 0..6 {
        post(&source, n);
    }
    let (ctx, _rx) = context(dir.path(), &source);
    std::fs::create_dir_all(dir.path())?;
    std::fs::write(
        ctx.state_path("by-rank"),
        serde_json::to_vec(&json!({
            "version": 1,
            "pendingEvents": [{"type": "ItemRemoved", "item_id": "posts/2"}],
            "source_cursor": "6"
        }))?,
    )?;

    let index = ItemIndex::open(&ctx, "by-rank", by_rank())?;
    let entries = snapshot(&index)?;
    assert_eq!(entries, reference(&source)?);
    assert_eq!(entries.len(), 6);
    assert_eq!(index.source_cursor()?.as_deref(), Some("6"));
    Ok(())
}

#[test]
fn newer_state_version_refuses_to_open() -> Result<()> {
    let dir = tempdir()?;
    let source = Arc::new(MemorySource::new("site"));
    let (ctx, _rx) = context(dir.path(), &source);
    std::fs::write(
        ctx.state_path("by-rank"),
        serde_json::to_vec(&json!({"version": 3, "pendingEvents": []}))?,
    )?;
    let opened = ItemIndex::open(&ctx, "by-rank", by_rank());
    assert!(matches!(opened, Err(FolioError::Format(_))));

    let state = StateFile::open(ctx.state_path("other"))?;
    assert_eq!(state.get::<String>(SOURCE_CURSOR)?, None);
    Ok(())
}

#[test]
fn change_notifications_name_live_page_files() -> Result<()> {
    let dir = tempdir()?;
    let source = Arc::new(MemorySource::new("site"));
    let (ctx, rx) = context(dir.path(), &source);
    let index = ItemIndex::open(&ctx, "by-rank", by_rank())?;
    for n in 0..20 {
        index.trigger(&post(&source, n))?;
    }
    for n in 2..20 {
        index.trigger(&source.delete(&format!("posts/{n}")))?;
    }
    index.wait_idle();

    let mut last_changed = Vec::new();
    let mut removed_any = false;
    for note in rx.try_iter() {
        assert_eq!(note.index_id, "by-rank");
        assert!(!note.changed_pages.is_empty() || !note.removed_pages.is_empty());
        removed_any |= !note.removed_pages.is_empty();
        last_changed = note.changed_pages;
    }
    assert!(removed_any, "shrinking to two items merges pages");
    for page in last_changed {
        assert!(index.page_path(folio::PageNo(page)).exists());
    }
    let listed: Vec<u32> = index.get_metadata()?.pages.iter().map(|p| p.page).collect();
    for page in listed {
        assert!(index.page_path(folio::PageNo(page)).exists());
    }
    Ok(())
}
