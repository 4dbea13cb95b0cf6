//! The JSON state file shared by a queue and the index that owns it.
//!
//! The document is a flat JSON object. The queue owns `pendingEvents`, the
//! index owns `source_cursor`, `config`, `forward` and `reverse`; `version` is
//! rewritten on every persist.

use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::primitives::io::{read_optional, remove_if_exists, write_atomic};
use crate::types::{FolioError, Result};

/// Current state file version.
pub const STATE_VERSION: u64 = 2;

/// Key holding the persisted pending-event list.
pub const PENDING_EVENTS: &str = "pendingEvents";
/// Key holding the last applied upstream cursor.
pub const SOURCE_CURSOR: &str = "source_cursor";

/// A persisted JSON document guarded for concurrent readers and writers.
#[derive(Debug)]
pub struct StateFile {
    path: PathBuf,
    doc: Mutex<Map<String, Value>>,
    write_lock: Mutex<()>,
    existed: bool,
}

impl StateFile {
    /// Loads `path`, migrating older versions. A missing file yields a fresh
    /// document that is not written until the first persist.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let (doc, existed) = match read_optional(&path)? {
            Some(bytes) => (parse_document(&path, &bytes)?, true),
            None => (fresh_document(), false),
        };
        Ok(Self {
            path,
            doc: Mutex::new(doc),
            write_lock: Mutex::new(()),
            existed,
        })
    }

    /// Location of the state file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the file existed when it was opened.
    pub fn existed(&self) -> bool {
        self.existed
    }

    /// Reads and decodes the value under `key`. Absent and `null` values yield `None`.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let value = match self.doc.lock().get(key) {
            None | Some(Value::Null) => return Ok(None),
            Some(value) => value.clone(),
        };
        serde_json::from_value(value).map(Some).map_err(|err| {
            FolioError::format(format!("{}: field {key}: {err}", self.path.display()))
        })
    }

    /// Raw value under `key`.
    pub fn get_raw(&self, key: &str) -> Option<Value> {
        self.doc.lock().get(key).cloned()
    }

    /// Copy of the whole document.
    pub fn snapshot(&self) -> Map<String, Value> {
        self.doc.lock().clone()
    }

    /// Applies `edit` to the document and writes the result atomically.
    ///
    /// Writers are serialized; `edit` runs while the write lock is held, so a
    /// value computed inside it is never overwritten by an older one.
    pub fn update<F>(&self, edit: F) -> Result<()>
    where
        F: FnOnce(&mut Map<String, Value>) -> Result<()>,
    {
        let _writer = self.write_lock.lock();
        let bytes = {
            let mut doc = self.doc.lock();
            edit(&mut doc)?;
            doc.insert("version".to_owned(), Value::from(STATE_VERSION));
            let mut bytes = serde_json::to_vec_pretty(&*doc)?;
            bytes.push(b'\n');
            bytes
        };
        write_atomic(&self.path, &bytes)
    }

    /// Stores `value` under `key` and persists.
    pub fn set<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let value = serde_json::to_value(value)?;
        self.update(|doc| {
            doc.insert(key.to_owned(), value);
            Ok(())
        })
    }

    /// Writes the current document without changes.
    pub fn persist(&self) -> Result<()> {
        self.update(|_| Ok(()))
    }

    /// Deletes the state file from disk.
    pub fn remove(&self) -> Result<bool> {
        let _writer = self.write_lock.lock();
        remove_if_exists(&self.path)
    }
}

fn fresh_document() -> Map<String, Value> {
    let mut doc = Map::new();
    doc.insert("version".to_owned(), Value::from(STATE_VERSION));
    doc.insert(PENDING_EVENTS.to_owned(), Value::Array(Vec::new()));
    doc
}

fn parse_document(path: &Path, bytes: &[u8]) -> Result<Map<String, Value>> {
    let mut doc: Map<String, Value> = serde_json::from_slice(bytes)
        .map_err(|err| FolioError::format(format!("{}: {err}", path.display())))?;
    let version = doc
        .get("version")
        .and_then(Value::as_u64)
        .ok_or_else(|| FolioError::format(format!("{}: missing version", path.display())))?;
    if version > STATE_VERSION {
        return Err(FolioError::format(format!(
            "{}: state version {version} is newer than supported version {STATE_VERSION}",
            path.display()
        )));
    }
    if version < STATE_VERSION {
        migrate(&mut doc, version);
        info!(
            target: "folio::queue",
            path = %path.display(),
            from = version,
            to = STATE_VERSION,
            "migrated state file"
        );
    }
    if !doc.contains_key(PENDING_EVENTS) {
        doc.insert(PENDING_EVENTS.to_owned(), Value::Array(Vec::new()));
    }
    debug!(target: "folio::queue", path = %path.display(), "loaded state file");
    Ok(doc)
}

/// Brings a document from `version` up to [`STATE_VERSION`].
fn migrate(doc: &mut Map<String, Value>, version: u64) {
    if version < 2 {
        // Version 1 carried no tree descriptors; replaying the source from
        // the start rebuilds them.
        doc.insert(SOURCE_CURSOR.to_owned(), Value::Null);
        doc.remove("forward");
        doc.remove("reverse");
    }
    doc.insert("version".to_owned(), Value::from(STATE_VERSION));
}
