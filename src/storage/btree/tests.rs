use super::{BTree, NodeDescriptor, TreeDescriptor, DESCRIPTOR_VERSION};
use crate::storage::key::{Direction, Key, KeyComponent};
use crate::types::{FolioError, PageNo, Result};
use proptest::prelude::*;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::collections::{BTreeMap, BTreeSet};
use tempfile::tempdir;

fn leaf_keys(tree: &mut BTree<i64>) -> Result<Vec<Vec<i64>>> {
    let mut out = Vec::new();
    for page in tree.leaf_pages()? {
        let keys = tree
            .store()
            .page(page)?
            .keys()
            .map(int_of)
            .collect::<Vec<_>>();
        out.push(keys);
    }
    Ok(out)
}

fn int_of(key: &Key) -> i64 {
    match key.parts()[0].value {
        KeyComponent::Int(v) => v,
        ref other => panic!("unexpected component {other}"),
    }
}

fn root_keys(tree: &mut BTree<i64>) -> Result<Vec<i64>> {
    match tree.to_descriptor()?.root {
        NodeDescriptor::Internal { keys, .. } => Ok(keys.iter().map(int_of).collect()),
        NodeDescriptor::Leaf { .. } => panic!("root must be interior"),
    }
}

fn shuffled(range: std::ops::Range<i64>, seed: u64) -> Vec<i64> {
    let mut numbers: Vec<i64> = range.collect();
    numbers.shuffle(&mut ChaCha8Rng::seed_from_u64(seed));
    numbers
}

#[test]
fn fresh_tree_is_root_over_one_empty_leaf() -> Result<()> {
    let dir = tempdir()?;
    let mut tree = BTree::<i64>::create(dir.path().join("idx"), 3)?;
    assert_eq!(tree.height()?, 2);
    assert!(tree.is_empty()?);
    assert_eq!(tree.get(&Key::from(1))?, None);
    let desc = tree.to_descriptor()?;
    match desc.root {
        NodeDescriptor::Internal { keys, childs } => {
            assert!(keys.is_empty());
            assert_eq!(childs.len(), 1);
            assert!(matches!(childs[0], NodeDescriptor::Leaf { count: 0, .. }));
        }
        NodeDescriptor::Leaf { .. } => panic!("root must be interior"),
    }
    assert!(dir.path().join("idx").join("0.json").exists());
    tree.verify()
}

#[test]
fn page_size_below_two_is_rejected() -> Result<()> {
    let dir = tempdir()?;
    match BTree::<i64>::create(dir.path(), 1) {
        Err(FolioError::Config(_)) => Ok(()),
        Err(other) => panic!("expected config error, got {other}"),
        Ok(_) => panic!("page size 1 accepted"),
    }
}

#[test]
fn leaf_splits_on_overflow() -> Result<()> {
    let dir = tempdir()?;
    let mut tree = BTree::<i64>::create(dir.path(), 3)?;
    tree.insert(Key::from(1), 101)?;
    assert_eq!(leaf_keys(&mut tree)?, vec![vec![1]]);
    tree.insert(Key::from(2), 102)?;
    tree.insert(Key::from(3), 103)?;
    assert_eq!(leaf_keys(&mut tree)?, vec![vec![1, 2, 3]]);

    tree.insert(Key::from(4), 104)?;
    assert_eq!(leaf_keys(&mut tree)?, vec![vec![1, 2], vec![3, 4]]);
    assert_eq!(root_keys(&mut tree)?, vec![3]);
    assert_eq!(tree.stats_snapshot().leaf_splits, 1);
    // The lower half keeps the original page.
    assert_eq!(tree.leaf_pages()?, vec![PageNo(0), PageNo(1)]);

    for number in shuffled(5..100, 7) {
        tree.insert(Key::from(number), 100 + number)?;
    }
    for number in 1..100 {
        assert!(tree.search(&Key::from(number))?.contains_key(&Key::from(number)));
        assert_eq!(tree.get(&Key::from(number))?, Some(100 + number));
    }
    assert!(tree.height()? > 2);
    assert!(tree.stats_snapshot().root_grows >= 1);
    tree.verify()
}

#[test]
fn insert_existing_key_replaces_value() -> Result<()> {
    let dir = tempdir()?;
    let mut tree = BTree::<i64>::create(dir.path(), 3)?;
    assert_eq!(tree.insert(Key::from(5), 1)?, None);
    assert_eq!(tree.insert(Key::from(5), 2)?, Some(1));
    assert_eq!(tree.len()?, 1);
    assert_eq!(tree.get(&Key::from(5))?, Some(2));
    Ok(())
}

#[test]
fn delete_all_in_random_order() -> Result<()> {
    let dir = tempdir()?;
    let mut tree = BTree::<i64>::create(dir.path(), 3)?;
    for number in shuffled(1..100, 11) {
        tree.insert(Key::from(number), 100 + number)?;
    }
    tree.verify()?;

    for (step, number) in shuffled(1..100, 12).into_iter().enumerate() {
        let key = Key::from(number);
        assert!(tree.search(&key)?.contains_key(&key));
        assert_eq!(tree.remove(&key)?, 100 + number);
        assert!(!tree.search(&key)?.contains_key(&key));
        if step % 10 == 0 {
            tree.verify()?;
        }
    }

    assert!(root_keys(&mut tree)?.is_empty());
    assert_eq!(leaf_keys(&mut tree)?, vec![Vec::<i64>::new()]);
    assert_eq!(tree.height()?, 2);
    assert_eq!(tree.store().page_count(), 1);
    let stats = tree.stats_snapshot();
    assert!(stats.leaf_merges > 0);
    assert!(stats.root_collapses > 0);
    tree.verify()
}

#[test]
fn removing_absent_key_is_not_found() -> Result<()> {
    let dir = tempdir()?;
    let mut tree = BTree::<i64>::create(dir.path(), 3)?;
    tree.insert(Key::from(1), 1)?;
    let err = tree.remove(&Key::from(2)).unwrap_err();
    assert!(err.is_not_found());
    assert_eq!(tree.len()?, 1);
    Ok(())
}

#[test]
fn removing_first_key_updates_separator() -> Result<()> {
    let dir = tempdir()?;
    let mut tree = BTree::<i64>::create(dir.path(), 3)?;
    for number in 1..=5 {
        tree.insert(Key::from(number), number)?;
    }
    assert_eq!(leaf_keys(&mut tree)?, vec![vec![1, 2], vec![3, 4, 5]]);
    tree.remove(&Key::from(3))?;
    assert_eq!(root_keys(&mut tree)?, vec![4]);
    tree.verify()
}

#[test]
fn underflow_borrows_then_merges() -> Result<()> {
    let dir = tempdir()?;
    let mut tree = BTree::<i64>::create(dir.path(), 4)?;
    for number in 1..=5 {
        tree.insert(Key::from(number), number)?;
    }
    assert_eq!(leaf_keys(&mut tree)?, vec![vec![1, 2], vec![3, 4, 5]]);

    tree.remove(&Key::from(1))?;
    assert_eq!(leaf_keys(&mut tree)?, vec![vec![2, 3], vec![4, 5]]);
    assert_eq!(root_keys(&mut tree)?, vec![4]);
    assert_eq!(tree.stats_snapshot().leaf_borrows, 1);

    tree.remove(&Key::from(2))?;
    assert_eq!(leaf_keys(&mut tree)?, vec![vec![3, 4, 5]]);
    assert!(root_keys(&mut tree)?.is_empty());
    assert_eq!(tree.stats_snapshot().leaf_merges, 1);
    assert_eq!(tree.store().page_count(), 1);
    tree.verify()
}

#[test]
fn descriptor_reopens_lazily() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("tree");
    let mut tree = BTree::<i64>::create(&path, 4)?;
    for number in shuffled(0..200, 3) {
        tree.insert(Key::from(number), number * 2)?;
    }
    let desc = tree.to_descriptor()?;
    assert_eq!(desc.version, DESCRIPTOR_VERSION);
    let json = serde_json::to_string(&desc)?;
    drop(tree);

    let parsed: TreeDescriptor = serde_json::from_str(&json)?;
    assert_eq!(parsed, desc);
    let mut reopened = BTree::<i64>::from_descriptor(parsed, &path)?;
    assert_eq!(reopened.store().loaded_count(), 0);
    assert_eq!(reopened.len()?, 200);
    assert_eq!(reopened.get(&Key::from(117))?, Some(234));
    assert_eq!(reopened.store().loaded_count(), 1);
    reopened.verify()?;
    assert_eq!(reopened.to_descriptor()?, desc);
    Ok(())
}

#[test]
fn verify_rejects_page_rewritten_behind_descriptor() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("tree");
    let mut tree = BTree::<i64>::create(&path, 4)?;
    tree.insert(Key::from(1), 1)?;
    tree.insert(Key::from(2), 2)?;
    let desc = tree.to_descriptor()?;
    let page = tree.leaf_pages()?[0];
    let file = tree.store().page_path(page);
    drop(tree);

    let mut body: serde_json::Value = serde_json::from_slice(&std::fs::read(&file)?)?;
    body["values"][1] = serde_json::json!(999);
    std::fs::write(&file, serde_json::to_vec(&body)?)?;

    let mut reopened = BTree::<i64>::from_descriptor(desc, &path)?;
    let stale = reopened.stale_pages()?;
    assert_eq!(stale.len(), 1);
    assert_eq!(stale[0].0, page);
    match reopened.verify() {
        Err(FolioError::Format(msg)) => assert!(msg.contains("differs from recorded"), "{msg}"),
        other => panic!("expected format error, got {other:?}"),
    }
    Ok(())
}

#[test]
fn descriptor_validation() -> Result<()> {
    let dir = tempdir()?;
    let wrong_version = TreeDescriptor {
        version: 7,
        page_size: 3,
        root: NodeDescriptor::Internal {
            keys: Vec::new(),
            childs: Vec::new(),
        },
    };
    assert!(matches!(
        BTree::<i64>::from_descriptor(wrong_version, dir.path()),
        Err(FolioError::Format(_))
    ));

    let bad_children = TreeDescriptor {
        version: DESCRIPTOR_VERSION,
        page_size: 3,
        root: NodeDescriptor::Internal {
            keys: vec![Key::from(1)],
            childs: vec![NodeDescriptor::Leaf {
                page: PageNo(0),
                count: 0,
                hash: String::new(),
            }],
        },
    };
    assert!(matches!(
        BTree::<i64>::from_descriptor(bad_children, dir.path()),
        Err(FolioError::Format(_))
    ));
    Ok(())
}

#[test]
fn tracking_reports_written_and_removed_pages() -> Result<()> {
    let dir = tempdir()?;
    let mut tree = BTree::<i64>::create(dir.path(), 3)?;
    for number in 1..=4 {
        tree.insert(Key::from(number), number)?;
    }
    tree.flush()?;

    let session = tree.track_changes();
    tree.insert(Key::from(5), 5)?;
    tree.flush()?;
    let changes = tree.stop_tracking(session);
    assert_eq!(changes.changed, BTreeSet::from([PageNo(1)]));
    assert!(changes.removed.is_empty());

    let session = tree.track_changes();
    for number in [1, 3, 4, 5] {
        tree.remove(&Key::from(number))?;
    }
    tree.flush()?;
    let changes = tree.stop_tracking(session);
    assert_eq!(changes.removed, BTreeSet::from([PageNo(1)]));
    assert_eq!(changes.changed, BTreeSet::from([PageNo(0)]));
    assert_eq!(leaf_keys(&mut tree)?, vec![vec![2]]);
    Ok(())
}

#[test]
fn composite_keys_with_descending_parts() -> Result<()> {
    let dir = tempdir()?;
    let mut tree = BTree::<String>::create(dir.path(), 3)?;
    for (ts, id) in [(10, "a"), (30, "b"), (20, "c"), (30, "d"), (5, "e")] {
        let key = Key::default()
            .with(KeyComponent::Timestamp(ts), Direction::Desc)
            .with(KeyComponent::Str(id.to_owned()), Direction::Asc);
        tree.insert(key, id.to_owned())?;
    }
    let order: Vec<String> = tree.scan()?.into_iter().map(|(_, v)| v).collect();
    assert_eq!(order, vec!["b", "d", "c", "a", "e"]);
    tree.verify()
}

#[test]
fn bounded_cache_keeps_results_correct() -> Result<()> {
    let dir = tempdir()?;
    let mut tree = BTree::<i64>::create(dir.path(), 3)?;
    tree.set_max_loaded_pages(Some(2));
    for number in shuffled(0..300, 5) {
        tree.insert(Key::from(number), number)?;
        tree.flush()?;
    }
    for number in 0..300 {
        assert_eq!(tree.get(&Key::from(number))?, Some(number));
    }
    assert!(tree.store().loaded_count() <= 2);
    tree.cleanup()?;
    assert_eq!(tree.store().loaded_count(), 0);
    tree.verify()
}

#[derive(Clone, Debug)]
enum PropOp {
    Insert(i64, i64),
    Remove(i64),
}

fn op_strategy() -> impl Strategy<Value = PropOp> {
    let key_range = 0i64..64;
    let value_range = 0i64..512;
    prop_oneof![
        (key_range.clone(), value_range).prop_map(|(k, v)| PropOp::Insert(k, v)),
        key_range.prop_map(PropOp::Remove),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]
    #[test]
    fn btree_matches_btreemap_random_ops(
        page_size in 2usize..6,
        ops in prop::collection::vec(op_strategy(), 1..200),
    ) {
        let dir = tempdir().expect("tempdir");
        let mut tree = BTree::<i64>::create(dir.path(), page_size).expect("create tree");
        let mut reference = BTreeMap::new();

        for op in ops {
            match op {
                PropOp::Insert(key, value) => {
                    let previous = tree.insert(Key::from(key), value).expect("insert");
                    prop_assert_eq!(previous, reference.insert(key, value));
                }
                PropOp::Remove(key) => {
                    let removed = tree.remove(&Key::from(key));
                    match reference.remove(&key) {
                        Some(expected) => prop_assert_eq!(removed.expect("remove"), expected),
                        None => prop_assert!(removed.expect_err("absent").is_not_found()),
                    }
                }
            }
        }

        tree.verify().expect("verify");
        let scanned: Vec<(i64, i64)> = tree
            .scan()
            .expect("scan")
            .into_iter()
            .map(|(k, v)| (int_of(&k), v))
            .collect();
        let expected: Vec<(i64, i64)> = reference.into_iter().collect();
        prop_assert_eq!(scanned, expected);
    }
}
