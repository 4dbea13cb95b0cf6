#![allow(missing_docs)]

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use folio::index::{
    drain_changes, ChangeSource, IndexContext, IndexDefinition, IndexRegistry, ItemIndex,
    MemorySource, NullSink, INDEX_FIELD,
};
use folio::{FolioConfig, Result};
use serde_json::{json, Map, Value};
use tempfile::tempdir;

fn obj(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        other => panic!("not an object: {other}"),
    }
}

fn context(cache_dir: &Path, source: &Arc<MemorySource>) -> IndexContext {
    let config = FolioConfig {
        source_id: source.source_id().to_owned(),
        default_page_size: 3,
        ..FolioConfig::with_cache_dir(cache_dir)
    };
    IndexContext::in_memory(config, Arc::clone(source), Arc::new(NullSink))
}

fn item_ids(index: &ItemIndex) -> Result<Vec<String>> {
    index.wait_idle();
    Ok(index.entries()?.into_iter().map(|(_, id)| id).collect())
}

/// What a connector does on each poll: fetch changes after `cursor`, route
/// them through the registry, and record the new cursor.
fn poll(
    registry: &mut IndexRegistry,
    source: &MemorySource,
    cursor: Option<String>,
) -> Result<Option<String>> {
    let (changes, cursor) = drain_changes(source, cursor.as_deref())?;
    for event in &changes {
        registry.handle_event(event)?;
    }
    registry.save_source_cursor(cursor.as_deref())?;
    Ok(cursor)
}

fn seed(source: &MemorySource) {
    source.put(
        "indexes/by-date",
        obj(json!({ INDEX_FIELD: {
            "type": "ItemIndex",
            "from": ["posts/*"],
            "keys": [{"field": "date", "order": "desc", "kind": "timestamp"}]
        }})),
    );
    source.put(
        "indexes/by-tag",
        obj(json!({ INDEX_FIELD: {
            "type": "ItemIndex",
            "from": ["posts/*", "notes/**"],
            "keys": [{"field": "tags"}],
            "page_size": 4
        }})),
    );
    source.put(
        "posts/a",
        obj(json!({"date": "2024-03-01T00:00:00Z", "tags": ["rust", "db"]})),
    );
    source.put("posts/b", obj(json!({"date": 1_700_000_000, "tags": ["rust"]})));
    source.put("notes/x/y", obj(json!({"tags": ["db"]})));
}

#[test]
fn indexes_follow_their_definition_items() -> Result<()> {
    let dir = tempdir()?;
    let source = Arc::new(MemorySource::new("site"));
    seed(&source);
    let mut registry = IndexRegistry::new(context(dir.path(), &source));
    let cursor = poll(&mut registry, &source, None)?;
    registry.wait_idle();

    assert_eq!(registry.ids().collect::<Vec<_>>(), vec!["indexes/by-date", "indexes/by-tag"]);
    let by_date = registry.get("indexes/by-date").expect("by-date");
    assert_eq!(item_ids(by_date)?, vec!["posts/a", "posts/b"]);
    let by_tag = registry.get("indexes/by-tag").expect("by-tag");
    assert_eq!(
        item_ids(by_tag)?,
        vec!["notes/x/y", "posts/a", "posts/a", "posts/b"]
    );
    assert_eq!(by_tag.get_metadata()?.page_size, 4);

    source.delete("posts/a");
    source.put("indexes/by-tag", obj(json!({"title": "no longer an index"})));
    let cursor = poll(&mut registry, &source, cursor)?;
    registry.wait_idle();

    assert!(registry.get("indexes/by-tag").is_none());
    let by_date = registry.get("indexes/by-date").expect("by-date");
    assert_eq!(item_ids(by_date)?, vec!["posts/b"]);
    assert_eq!(by_date.source_cursor()?, cursor);
    Ok(())
}

#[test]
fn shutdown_and_load_resume_where_they_left_off() -> Result<()> {
    let dir = tempdir()?;
    let source = Arc::new(MemorySource::new("site"));
    seed(&source);
    let mut registry = IndexRegistry::new(context(dir.path(), &source));
    let cursor = poll(&mut registry, &source, None)?;
    registry.wait_idle();
    registry.close();
    let definitions: BTreeMap<String, IndexDefinition> = registry.shutdown();
    assert_eq!(definitions.len(), 2);

    // Upstream moves on while the process is down.
    source.put("posts/c", obj(json!({"date": "2025-01-01T00:00:00Z", "tags": ["new"]})));
    source.delete("notes/x/y");

    let mut registry = IndexRegistry::load(context(dir.path(), &source), definitions);
    registry.wait_idle();
    let by_date = registry.get("indexes/by-date").expect("by-date");
    assert_eq!(item_ids(by_date)?, vec!["posts/c", "posts/a", "posts/b"]);
    let by_tag = registry.get("indexes/by-tag").expect("by-tag");
    assert_eq!(
        item_ids(by_tag)?,
        vec!["posts/a", "posts/c", "posts/a", "posts/b"]
    );
    by_tag.verify()?;

    // The connector's own cursor still points before the downtime changes;
    // routing them again is harmless.
    poll(&mut registry, &source, cursor)?;
    registry.wait_idle();
    let by_tag = registry.get("indexes/by-tag").expect("by-tag");
    assert_eq!(by_tag.get_metadata()?.item_count, 3);
    Ok(())
}

#[test]
fn invalid_definition_items_are_skipped() -> Result<()> {
    let dir = tempdir()?;
    let source = Arc::new(MemorySource::new("site"));
    source.put("indexes/broken", obj(json!({ INDEX_FIELD: {"type": "Nope", "from": ["*"]} })));
    source.put("indexes/empty", obj(json!({ INDEX_FIELD: {"type": "ItemIndex", "from": []} })));
    source.put("posts/a", obj(json!({})));
    let mut registry = IndexRegistry::new(context(dir.path(), &source));
    poll(&mut registry, &source, None)?;
    assert!(registry.is_empty());
    Ok(())
}
