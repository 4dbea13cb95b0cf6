//! Offline reports over an index state file and its page cache.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde_json::Value;

use crate::index::IndexDefinition;
use crate::queue::{PendingEvent, StateFile, PENDING_EVENTS, SOURCE_CURSOR};
use crate::storage::btree::{BTree, TreeDescriptor};
use crate::storage::key::{Key, KeyComponent};
use crate::types::{FolioError, Result};

const MAX_FINDINGS: usize = 32;
const TREES: [&str; 2] = ["forward", "reverse"];

/// Page directory belonging to `state_path` (`<stem>.index` → `<stem>/`).
pub fn tree_dir_for(state_path: &Path) -> PathBuf {
    state_path.with_extension("")
}

fn open_state(state_path: &Path) -> Result<StateFile> {
    let state = StateFile::open(state_path)?;
    if !state.existed() {
        return Err(FolioError::not_found(format!(
            "state file {}",
            state_path.display()
        )));
    }
    Ok(state)
}

fn open_tree<V>(state: &StateFile, state_path: &Path, name: &str) -> Result<Option<BTree<V>>>
where
    V: Serialize + serde::de::DeserializeOwned + Clone,
{
    match state.get::<TreeDescriptor>(name)? {
        Some(descriptor) => Ok(Some(BTree::from_descriptor(
            descriptor,
            tree_dir_for(state_path).join(name),
        )?)),
        None => Ok(None),
    }
}

/// Shape of one persisted tree.
#[derive(Clone, Debug, Serialize)]
pub struct TreeSummary {
    /// Entries per page.
    pub page_size: usize,
    /// Levels from the root to the leaves.
    pub height: usize,
    /// Stored entries.
    pub entries: usize,
    /// Allocated leaf pages.
    pub pages: usize,
}

/// Contents of a state file at a glance.
#[derive(Clone, Debug, Serialize)]
pub struct SummaryReport {
    /// Inspected state file.
    pub state_path: PathBuf,
    /// Document version after migration.
    pub version: u64,
    /// Stored index definition.
    pub definition: Option<IndexDefinition>,
    /// Last saved upstream cursor.
    pub source_cursor: Option<String>,
    /// Number of queued events.
    pub pending_events: usize,
    /// Forward tree, when persisted.
    pub forward: Option<TreeSummary>,
    /// Reverse tree, when persisted.
    pub reverse: Option<TreeSummary>,
}

/// Summarizes the state file at `state_path` without touching page files.
pub fn summary(state_path: &Path) -> Result<SummaryReport> {
    let state = open_state(state_path)?;
    let summarize = |name: &str| -> Result<Option<TreeSummary>> {
        let Some(tree) = open_tree::<Value>(&state, state_path, name)? else {
            return Ok(None);
        };
        Ok(Some(TreeSummary {
            page_size: tree.page_size(),
            height: tree.height()?,
            entries: tree.len()?,
            pages: tree.store().page_count(),
        }))
    };
    let pending_events = match state.get_raw(PENDING_EVENTS) {
        Some(Value::Array(events)) => events.len(),
        _ => 0,
    };
    Ok(SummaryReport {
        state_path: state_path.to_path_buf(),
        version: state.get::<u64>("version")?.unwrap_or_default(),
        definition: state.get("config")?,
        source_cursor: state.get(SOURCE_CURSOR)?,
        pending_events,
        forward: summarize(TREES[0])?,
        reverse: summarize(TREES[1])?,
    })
}

/// One problem found by [`verify`].
#[derive(Clone, Debug, Serialize)]
pub struct VerifyFinding {
    /// Tree the finding concerns, or `index` for cross-tree checks.
    pub scope: String,
    /// What is wrong.
    pub message: String,
}

/// Outcome of [`verify`].
#[derive(Clone, Debug, Default, Serialize)]
pub struct VerifyReport {
    /// No findings.
    pub success: bool,
    /// Problems, capped at a fixed number.
    pub findings: Vec<VerifyFinding>,
    /// Pages loaded while checking.
    pub pages_checked: usize,
}

impl VerifyReport {
    fn push(&mut self, scope: &str, message: impl Into<String>) {
        if self.findings.len() < MAX_FINDINGS {
            self.findings.push(VerifyFinding {
                scope: scope.to_owned(),
                message: message.into(),
            });
        }
    }
}

/// Loads both trees, checks their invariants, and checks that the reverse
/// tree lists exactly the forward entries of each item.
pub fn verify(state_path: &Path) -> Result<VerifyReport> {
    let state = open_state(state_path)?;
    let mut report = VerifyReport::default();

    let mut forward = match open_tree::<String>(&state, state_path, TREES[0]) {
        Ok(tree) => tree,
        Err(err) => {
            report.push(TREES[0], err.to_string());
            None
        }
    };
    let mut reverse = match open_tree::<Vec<Key>>(&state, state_path, TREES[1]) {
        Ok(tree) => tree,
        Err(err) => {
            report.push(TREES[1], err.to_string());
            None
        }
    };
    if let Some(tree) = forward.as_mut() {
        if let Err(err) = tree.verify() {
            report.push(TREES[0], err.to_string());
        }
        report.pages_checked += tree.store().page_count();
    }
    if let Some(tree) = reverse.as_mut() {
        if let Err(err) = tree.verify() {
            report.push(TREES[1], err.to_string());
        }
        report.pages_checked += tree.store().page_count();
    }
    if let (Some(forward), Some(reverse)) = (forward.as_mut(), reverse.as_mut()) {
        if report.findings.is_empty() {
            cross_check(forward, reverse, &mut report)?;
        }
    }
    report.success = report.findings.is_empty();
    Ok(report)
}

fn cross_check(
    forward: &mut BTree<String>,
    reverse: &mut BTree<Vec<Key>>,
    report: &mut VerifyReport,
) -> Result<()> {
    let mut unclaimed: BTreeSet<(Key, String)> = forward.scan()?.into_iter().collect();
    for (id_key, keys) in reverse.scan()? {
        let Some(KeyComponent::Str(item_id)) = id_key.parts().first().map(|p| &p.value) else {
            report.push("index", format!("reverse key {id_key} is not an item id"));
            continue;
        };
        for key in keys {
            if !unclaimed.remove(&(key.clone(), item_id.clone())) {
                report.push("index", format!("{item_id}: key {key} missing from forward tree"));
            }
        }
    }
    for (key, item_id) in unclaimed {
        report.push("index", format!("{item_id}: forward key {key} not listed in reverse tree"));
    }
    Ok(())
}

/// Queued events of a state file.
#[derive(Clone, Debug, Serialize)]
pub struct PendingReport {
    /// Events that decode, in queue order.
    pub events: Vec<PendingEvent>,
    /// Entries that no longer decode.
    pub corrupt: usize,
}

/// Lists the pending events of the state file at `state_path`.
pub fn pending(state_path: &Path) -> Result<PendingReport> {
    let state = open_state(state_path)?;
    let mut report = PendingReport {
        events: Vec::new(),
        corrupt: 0,
    };
    if let Some(Value::Array(entries)) = state.get_raw(PENDING_EVENTS) {
        for entry in entries {
            match serde_json::from_value::<PendingEvent>(entry) {
                Ok(event) => report.events.push(event),
                Err(_) => report.corrupt += 1,
            }
        }
    }
    Ok(report)
}
