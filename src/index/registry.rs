use std::collections::BTreeMap;

use serde_json::Value;
use tracing::{error, info};

use super::coordinator::{IndexContext, ItemIndex};
use super::definition::IndexDefinition;
use crate::queue::PendingEvent;
use crate::types::Result;

/// Metadata field of an item that declares an index.
pub const INDEX_FIELD: &str = "index";

/// All indexes of one source, keyed by the id of the item defining them.
pub struct IndexRegistry {
    ctx: IndexContext,
    indexes: BTreeMap<String, ItemIndex>,
}

impl IndexRegistry {
    /// Registry without indexes.
    pub fn new(ctx: IndexContext) -> Self {
        Self {
            ctx,
            indexes: BTreeMap::new(),
        }
    }

    /// Opens every definition. An index that fails to open is logged and
    /// skipped.
    pub fn load<I>(ctx: IndexContext, definitions: I) -> Self
    where
        I: IntoIterator<Item = (String, IndexDefinition)>,
    {
        let mut registry = Self::new(ctx);
        for (index_id, definition) in definitions {
            if let Err(err) = registry.open_index(&index_id, definition) {
                error!(
                    target: "folio::index",
                    index_id = %index_id,
                    error = %err,
                    "skipping index"
                );
            }
        }
        info!(target: "folio::index", indexes = registry.len(), "loaded indexes");
        registry
    }

    /// The shared context.
    pub fn context(&self) -> &IndexContext {
        &self.ctx
    }

    /// Opens `index_id`, replacing a running index of the same id.
    pub fn open_index(&mut self, index_id: &str, definition: IndexDefinition) -> Result<()> {
        if let Some(previous) = self.indexes.remove(index_id) {
            previous.stop();
        }
        let index = ItemIndex::open(&self.ctx, index_id, definition)?;
        self.indexes.insert(index_id.to_owned(), index);
        Ok(())
    }

    /// Stops `index_id` and deletes its files. Returns whether it existed.
    pub fn destroy_index(&mut self, index_id: &str) -> Result<bool> {
        match self.indexes.remove(index_id) {
            Some(index) => {
                index.destroy()?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Routes one upstream change: maintains the set of indexes when the item
    /// declares or drops an index definition, then offers the event to every
    /// index.
    ///
    /// Failures are logged per index and never keep the event from the
    /// remaining indexes.
    pub fn handle_event(&mut self, event: &PendingEvent) -> Result<()> {
        match event {
            PendingEvent::ItemChanged { item_id, .. } => {
                match self.ctx.metadata.metadata(item_id) {
                    Ok(metadata) => {
                        let declared = metadata.and_then(|m| m.get(INDEX_FIELD).cloned());
                        self.reconcile(item_id, declared);
                    }
                    Err(err) => error!(
                        target: "folio::index",
                        item_id = %item_id,
                        error = %err,
                        "metadata lookup failed; index definitions left as they are"
                    ),
                }
            }
            PendingEvent::ItemRemoved { item_id } => {
                self.drop_index(item_id, "index item removed");
            }
            PendingEvent::MetaChanged { .. } => {}
        }
        for (index_id, index) in &self.indexes {
            if let Err(err) = index.trigger(event) {
                error!(
                    target: "folio::index",
                    index_id = %index_id,
                    event = %event,
                    error = %err,
                    "could not queue event"
                );
            }
        }
        Ok(())
    }

    fn reconcile(&mut self, item_id: &str, declared: Option<Value>) {
        let Some(value) = declared.filter(|value| !value.is_null()) else {
            self.drop_index(item_id, "index definition dropped");
            return;
        };
        let definition = match IndexDefinition::from_value(&value) {
            Ok(definition) => definition,
            Err(err) => {
                error!(
                    target: "folio::index",
                    index_id = %item_id,
                    error = %err,
                    "ignoring invalid index definition"
                );
                self.drop_index(item_id, "invalid index destroyed");
                return;
            }
        };
        if let Some(existing) = self.indexes.get(item_id) {
            if existing.definition() == &definition {
                return;
            }
            info!(target: "folio::index", index_id = %item_id, "index definition changed");
        } else {
            info!(target: "folio::index", index_id = %item_id, "index created");
        }
        if let Err(err) = self.open_index(item_id, definition) {
            error!(
                target: "folio::index",
                index_id = %item_id,
                error = %err,
                "skipping index"
            );
        }
    }

    fn drop_index(&mut self, index_id: &str, reason: &str) {
        match self.destroy_index(index_id) {
            Ok(true) => info!(target: "folio::index", index_id = %index_id, "{reason}"),
            Ok(false) => {}
            Err(err) => error!(
                target: "folio::index",
                index_id = %index_id,
                error = %err,
                "could not destroy index"
            ),
        }
    }

    /// Records the connector's cursor in every index.
    pub fn save_source_cursor(&self, cursor: Option<&str>) -> Result<()> {
        for index in self.indexes.values() {
            index.save_source_cursor(cursor)?;
        }
        Ok(())
    }

    /// The index named `index_id`.
    pub fn get(&self, index_id: &str) -> Option<&ItemIndex> {
        self.indexes.get(index_id)
    }

    /// Ids of the open indexes, sorted.
    pub fn ids(&self) -> impl Iterator<Item = &str> + '_ {
        self.indexes.keys().map(String::as_str)
    }

    /// Number of open indexes.
    pub fn len(&self) -> usize {
        self.indexes.len()
    }

    /// True when no index is open.
    pub fn is_empty(&self) -> bool {
        self.indexes.is_empty()
    }

    /// Blocks until every index has drained its queue.
    pub fn wait_idle(&self) {
        for index in self.indexes.values() {
            index.wait_idle();
        }
    }

    /// Closes every queue; workers exit once drained.
    pub fn close(&self) {
        for index in self.indexes.values() {
            index.close_queue();
        }
    }

    /// Stops every index and returns the definitions to persist.
    pub fn shutdown(self) -> BTreeMap<String, IndexDefinition> {
        self.indexes
            .into_iter()
            .map(|(index_id, index)| {
                index.stop();
                let definition = index.definition().clone();
                (index_id, definition)
            })
            .collect()
    }
}
