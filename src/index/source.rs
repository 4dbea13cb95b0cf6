//! Interfaces to the collaborators around an index: the upstream change
//! source, the metadata extractor and the publisher of changed pages.

use std::collections::BTreeMap;
use std::sync::mpsc::Sender;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::queue::PendingEvent;
use crate::storage::btree::PageChanges;
use crate::types::{FolioError, Result};

/// One batch of upstream changes.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ChangeBatch {
    /// Changes in upstream order.
    pub changes: Vec<PendingEvent>,
    /// Cursor positioned after this batch.
    pub cursor: Option<String>,
    /// More changes are available after `cursor`.
    pub has_more: bool,
}

/// The upstream content source.
pub trait ChangeSource: Send + Sync {
    /// Identifier of the source, used in state file names.
    fn source_id(&self) -> &str;

    /// The source's current cursor.
    fn cursor(&self) -> Option<String>;

    /// Changes after `cursor`; `None` means from the beginning.
    fn fetch_changes(&self, cursor: Option<&str>) -> Result<ChangeBatch>;
}

/// Fetches every change after `cursor`, following `has_more` batches.
pub fn drain_changes(
    source: &dyn ChangeSource,
    cursor: Option<&str>,
) -> Result<(Vec<PendingEvent>, Option<String>)> {
    let mut changes = Vec::new();
    let mut cursor = cursor.map(str::to_owned);
    loop {
        let batch = source.fetch_changes(cursor.as_deref())?;
        changes.extend(batch.changes);
        if batch.cursor.is_some() {
            cursor = batch.cursor;
        }
        if !batch.has_more {
            return Ok((changes, cursor));
        }
    }
}

/// Item metadata as produced by content extraction.
pub trait MetadataProvider: Send + Sync {
    /// Metadata of `item_id`, or `None` when the item does not exist.
    fn metadata(&self, item_id: &str) -> Result<Option<Map<String, Value>>>;
}

/// Message telling a publisher which index pages to re-upload or delete.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageChangeNotification {
    /// Index the pages belong to.
    pub index_id: String,
    /// Pages written since the last notification.
    pub changed_pages: Vec<u32>,
    /// Pages deallocated since the last notification.
    pub removed_pages: Vec<u32>,
}

impl PageChangeNotification {
    /// Builds a notification from a tracking session's result.
    pub fn from_changes(index_id: &str, changes: &PageChanges) -> Self {
        Self {
            index_id: index_id.to_owned(),
            changed_pages: changes.changed.iter().map(|p| p.0).collect(),
            removed_pages: changes.removed.iter().map(|p| p.0).collect(),
        }
    }
}

/// Receiver of page-change notifications.
pub trait PageChangeSink: Send + Sync {
    /// Delivers one notification.
    fn publish(&self, notification: PageChangeNotification) -> Result<()>;
}

/// Sink that forwards notifications into an mpsc channel.
pub struct ChannelSink {
    sender: Mutex<Sender<PageChangeNotification>>,
}

impl ChannelSink {
    /// Wraps `sender`.
    pub fn new(sender: Sender<PageChangeNotification>) -> Self {
        Self {
            sender: Mutex::new(sender),
        }
    }
}

impl PageChangeSink for ChannelSink {
    fn publish(&self, notification: PageChangeNotification) -> Result<()> {
        self.sender
            .lock()
            .send(notification)
            .map_err(|_| FolioError::Closed("page change channel".to_owned()))
    }
}

/// Sink that drops every notification.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullSink;

impl PageChangeSink for NullSink {
    fn publish(&self, _notification: PageChangeNotification) -> Result<()> {
        Ok(())
    }
}

/// In-process source keeping items and their change log in memory.
///
/// Cursors are positions in the change log rendered as decimal strings.
/// Serves as both [`ChangeSource`] and [`MetadataProvider`].
pub struct MemorySource {
    id: String,
    batch_size: usize,
    inner: Mutex<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    items: BTreeMap<String, Map<String, Value>>,
    log: Vec<PendingEvent>,
}

impl MemorySource {
    /// Empty source named `id`.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            batch_size: 64,
            inner: Mutex::new(MemoryInner::default()),
        }
    }

    /// Limits how many changes one `fetch_changes` call returns.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Creates or replaces `item_id` and logs an `ItemChanged` change.
    pub fn put(&self, item_id: &str, metadata: Map<String, Value>) -> PendingEvent {
        let event = PendingEvent::changed(item_id, format!("{item_id}.item"));
        let mut inner = self.inner.lock();
        inner.items.insert(item_id.to_owned(), metadata);
        inner.log.push(event.clone());
        event
    }

    /// Deletes `item_id` and logs an `ItemRemoved` change.
    pub fn delete(&self, item_id: &str) -> PendingEvent {
        let event = PendingEvent::removed(item_id);
        let mut inner = self.inner.lock();
        inner.items.remove(item_id);
        inner.log.push(event.clone());
        event
    }

    /// Number of logged changes.
    pub fn log_len(&self) -> usize {
        self.inner.lock().log.len()
    }
}

impl ChangeSource for MemorySource {
    fn source_id(&self) -> &str {
        &self.id
    }

    fn cursor(&self) -> Option<String> {
        Some(self.log_len().to_string())
    }

    fn fetch_changes(&self, cursor: Option<&str>) -> Result<ChangeBatch> {
        let start = match cursor {
            None | Some("") => 0,
            Some(text) => text
                .parse::<usize>()
                .map_err(|_| FolioError::format(format!("bad cursor {text:?}")))?,
        };
        let inner = self.inner.lock();
        let start = start.min(inner.log.len());
        let end = (start + self.batch_size).min(inner.log.len());
        Ok(ChangeBatch {
            changes: inner.log[start..end].to_vec(),
            cursor: Some(end.to_string()),
            has_more: end < inner.log.len(),
        })
    }
}

impl MetadataProvider for MemorySource {
    fn metadata(&self, item_id: &str) -> Result<Option<Map<String, Value>>> {
        Ok(self.inner.lock().items.get(item_id).cloned())
    }
}
