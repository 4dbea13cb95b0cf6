//! The item index: a forward tree from composite key to item id, a reverse
//! tree from item id to its keys, and the queue that feeds both.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use super::definition::IndexDefinition;
use super::keyspec::{derive_keys, KeySpec};
use super::pattern::GlobPattern;
use super::source::{
    drain_changes, ChangeSource, MemorySource, MetadataProvider, PageChangeNotification,
    PageChangeSink,
};
use crate::admin::FolioConfig;
use crate::primitives::io::remove_dir_if_exists;
use crate::queue::{DurableEventQueue, EventHandler, PendingEvent, StateFile, SOURCE_CURSOR};
use crate::storage::btree::{BTree, PageChanges, TreeDescriptor};
use crate::storage::key::Key;
use crate::types::{FolioError, PageNo, Result};

const CONFIG_KEY: &str = "config";
const FORWARD_KEY: &str = "forward";
const REVERSE_KEY: &str = "reverse";

/// Everything an index needs from its surroundings, built once at startup.
#[derive(Clone)]
pub struct IndexContext {
    /// Runtime configuration.
    pub config: FolioConfig,
    /// Upstream change source.
    pub source: Arc<dyn ChangeSource>,
    /// Item metadata lookup.
    pub metadata: Arc<dyn MetadataProvider>,
    /// Receiver of page-change notifications.
    pub sink: Arc<dyn PageChangeSink>,
}

impl IndexContext {
    /// Bundles the collaborators.
    pub fn new(
        config: FolioConfig,
        source: Arc<dyn ChangeSource>,
        metadata: Arc<dyn MetadataProvider>,
        sink: Arc<dyn PageChangeSink>,
    ) -> Self {
        Self {
            config,
            source,
            metadata,
            sink,
        }
    }

    /// Context whose source and metadata both come from `source`.
    pub fn in_memory(
        config: FolioConfig,
        source: Arc<MemorySource>,
        sink: Arc<dyn PageChangeSink>,
    ) -> Self {
        let metadata: Arc<dyn MetadataProvider> = source.clone();
        Self::new(config, source, metadata, sink)
    }

    /// State file of `index_id`.
    pub fn state_path(&self, index_id: &str) -> PathBuf {
        self.config
            .cache_dir
            .join(format!("{}.index", file_stem(&self.config.source_id, index_id)))
    }

    /// Directory holding the page files of `index_id`.
    pub fn tree_dir(&self, index_id: &str) -> PathBuf {
        self.config
            .cache_dir
            .join(file_stem(&self.config.source_id, index_id))
    }
}

fn file_stem(source_id: &str, index_id: &str) -> String {
    format!("{source_id}#{index_id}").replace('/', "__")
}

/// One published page of an index listing.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageSummary {
    /// Page number.
    pub page: u32,
    /// Entries in the page.
    pub count: usize,
    /// Content hash of the page file.
    pub hash: String,
}

/// Listing of an index for publishers and inspection.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexMetadata {
    /// Index identifier.
    pub index_id: String,
    /// Key positions.
    pub keys: Vec<KeySpec>,
    /// Entries per page.
    pub page_size: usize,
    /// Number of indexed items.
    pub item_count: usize,
    /// Forward-tree pages in key order.
    pub pages: Vec<PageSummary>,
}

struct IndexCore {
    index_id: String,
    specs: Vec<KeySpec>,
    forward: BTree<String>,
    reverse: BTree<Vec<Key>>,
    state: Arc<StateFile>,
    metadata: Arc<dyn MetadataProvider>,
    sink: Arc<dyn PageChangeSink>,
}

impl IndexCore {
    fn apply(&mut self, event: &PendingEvent) -> Result<()> {
        match event {
            PendingEvent::ItemChanged { item_id, .. } => match self.metadata.metadata(item_id)? {
                Some(metadata) => self.update_item(item_id, &metadata),
                None => {
                    debug!(
                        target: "folio::index",
                        index_id = %self.index_id,
                        item_id = %item_id,
                        "changed item no longer exists; removing"
                    );
                    self.remove_item(item_id)
                }
            },
            PendingEvent::ItemRemoved { item_id } => self.remove_item(item_id),
            PendingEvent::MetaChanged { .. } => {
                debug!(target: "folio::index", index_id = %self.index_id, event = %event, "ignored");
                Ok(())
            }
        }
    }

    fn update_item(&mut self, item_id: &str, metadata: &Map<String, Value>) -> Result<()> {
        let new_keys = derive_keys(&self.specs, metadata, item_id)?;
        let old_keys = self.reverse.get(&Key::from(item_id))?;
        if old_keys.as_ref() == Some(&new_keys) && self.forward_holds(item_id, &new_keys)? {
            debug!(
                target: "folio::index",
                index_id = %self.index_id,
                item_id = %item_id,
                "keys unchanged"
            );
            return Ok(());
        }
        let count = new_keys.len();
        let session = self.forward.track_changes();
        let result = self.replace_keys(item_id, old_keys.unwrap_or_default(), Some(new_keys));
        let changes = self.forward.stop_tracking(session);
        result?;
        self.persist_trees()?;
        debug!(
            target: "folio::index",
            index_id = %self.index_id,
            item_id = %item_id,
            keys = count,
            changed = changes.changed.len(),
            removed = changes.removed.len(),
            "updated item"
        );
        self.notify(&changes);
        Ok(())
    }

    fn remove_item(&mut self, item_id: &str) -> Result<()> {
        let Some(old_keys) = self.reverse.get(&Key::from(item_id))? else {
            debug!(
                target: "folio::index",
                index_id = %self.index_id,
                item_id = %item_id,
                "item not indexed"
            );
            return Ok(());
        };
        let session = self.forward.track_changes();
        let result = self.replace_keys(item_id, old_keys, None);
        let changes = self.forward.stop_tracking(session);
        result?;
        self.persist_trees()?;
        debug!(target: "folio::index", index_id = %self.index_id, item_id = %item_id, "removed item");
        self.notify(&changes);
        Ok(())
    }

    fn forward_holds(&mut self, item_id: &str, keys: &[Key]) -> Result<bool> {
        for key in keys {
            if self.forward.get(key)?.as_deref() != Some(item_id) {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Swaps the forward entries of `item_id` from `old` to `new` and writes
    /// the touched pages. `None` drops the item entirely.
    fn replace_keys(&mut self, item_id: &str, old: Vec<Key>, new: Option<Vec<Key>>) -> Result<()> {
        for key in &old {
            match self.forward.remove(key) {
                Ok(_) => {}
                Err(err) if err.is_not_found() => {
                    debug!(target: "folio::index", index_id = %self.index_id, key = %key, "stale key already gone");
                }
                Err(err) => return Err(err),
            }
        }
        let id_key = Key::from(item_id);
        match new {
            Some(keys) => {
                for key in &keys {
                    self.forward.insert(key.clone(), item_id.to_owned())?;
                }
                self.reverse.insert(id_key, keys)?;
            }
            None => match self.reverse.remove(&id_key) {
                Ok(_) => {}
                Err(err) if err.is_not_found() => {}
                Err(err) => return Err(err),
            },
        }
        self.forward.flush()?;
        self.reverse.flush()
    }

    fn persist_trees(&mut self) -> Result<()> {
        let forward = serde_json::to_value(self.forward.to_descriptor()?)?;
        let reverse = serde_json::to_value(self.reverse.to_descriptor()?)?;
        self.state.update(|doc| {
            doc.insert(FORWARD_KEY.to_owned(), forward);
            doc.insert(REVERSE_KEY.to_owned(), reverse);
            Ok(())
        })
    }

    fn notify(&self, changes: &PageChanges) {
        if changes.is_empty() {
            return;
        }
        let notification = PageChangeNotification::from_changes(&self.index_id, changes);
        if let Err(err) = self.sink.publish(notification) {
            warn!(
                target: "folio::index",
                index_id = %self.index_id,
                error = %err,
                "could not deliver page change notification"
            );
        }
    }
}

struct CoreHandler {
    core: Arc<Mutex<IndexCore>>,
}

impl EventHandler for CoreHandler {
    fn apply(&mut self, event: &PendingEvent) -> Result<()> {
        self.core
            .lock()
            .apply(event)
            .map_err(|err| err.into_apply(event))
    }
}

/// A sorted index over the items matching its `from` patterns.
pub struct ItemIndex {
    index_id: String,
    definition: IndexDefinition,
    patterns: Vec<GlobPattern>,
    page_size: usize,
    state: Arc<StateFile>,
    tree_dir: PathBuf,
    core: Arc<Mutex<IndexCore>>,
    queue: DurableEventQueue,
}

impl ItemIndex {
    /// Opens or creates the index `index_id`, restores its queue, and replays
    /// upstream changes missed since its last saved cursor.
    ///
    /// A stored definition that differs from `definition` discards the old
    /// state and rebuilds from scratch.
    pub fn open(ctx: &IndexContext, index_id: &str, definition: IndexDefinition) -> Result<Self> {
        let patterns = definition.validate(ctx.config.default_page_size)?;
        let page_size = definition.effective_page_size(ctx.config.default_page_size);
        let state_path = ctx.state_path(index_id);
        let tree_dir = ctx.tree_dir(index_id);

        let mut state = StateFile::open(&state_path)?;
        if let Some(stored) = state.get::<IndexDefinition>(CONFIG_KEY)? {
            if stored != definition {
                warn!(
                    target: "folio::index",
                    index_id = %index_id,
                    "index definition changed; rebuilding"
                );
                state.remove()?;
                remove_dir_if_exists(&tree_dir)?;
                state = StateFile::open(&state_path)?;
            }
        }
        let state = Arc::new(state);

        let (mut forward, mut reverse, rebuilt) = open_trees(&state, &tree_dir, page_size)?;
        forward.set_max_loaded_pages(ctx.config.max_loaded_pages);
        reverse.set_max_loaded_pages(ctx.config.max_loaded_pages);
        let config = serde_json::to_value(&definition)?;
        let forward_desc = serde_json::to_value(forward.to_descriptor()?)?;
        let reverse_desc = serde_json::to_value(reverse.to_descriptor()?)?;
        state.update(|doc| {
            doc.insert(CONFIG_KEY.to_owned(), config);
            doc.insert(FORWARD_KEY.to_owned(), forward_desc);
            doc.insert(REVERSE_KEY.to_owned(), reverse_desc);
            if rebuilt {
                doc.insert(SOURCE_CURSOR.to_owned(), Value::Null);
            }
            Ok(())
        })?;

        let core = Arc::new(Mutex::new(IndexCore {
            index_id: index_id.to_owned(),
            specs: definition.keys.clone(),
            forward,
            reverse,
            state: Arc::clone(&state),
            metadata: Arc::clone(&ctx.metadata),
            sink: Arc::clone(&ctx.sink),
        }));
        let queue = DurableEventQueue::start(
            format!("{}#{index_id}", ctx.config.source_id),
            Arc::clone(&state),
            CoreHandler {
                core: Arc::clone(&core),
            },
        )?;
        let index = Self {
            index_id: index_id.to_owned(),
            definition,
            patterns,
            page_size,
            state,
            tree_dir,
            core,
            queue,
        };
        info!(
            target: "folio::index",
            index_id = %index_id,
            page_size,
            rebuilt,
            pending = index.queue.pending_len(),
            "opened index"
        );
        index.resync(ctx.source.as_ref())?;
        Ok(index)
    }

    /// Identifier of the index.
    pub fn index_id(&self) -> &str {
        &self.index_id
    }

    /// The definition the index was built from.
    pub fn definition(&self) -> &IndexDefinition {
        &self.definition
    }

    /// The shared state file.
    pub fn state(&self) -> &Arc<StateFile> {
        &self.state
    }

    /// Replays upstream changes between the saved cursor and the source's
    /// current cursor.
    pub fn resync(&self, source: &dyn ChangeSource) -> Result<()> {
        let saved = self.source_cursor()?;
        let current = source.cursor();
        if saved == current {
            return Ok(());
        }
        warn!(
            target: "folio::index",
            index_id = %self.index_id,
            source = source.source_id(),
            saved = ?saved,
            current = ?current,
            "index is out of sync; fetching changes"
        );
        let (changes, cursor) = drain_changes(source, saved.as_deref())?;
        let mut queued = 0usize;
        for event in &changes {
            if self.trigger(event)? {
                queued += 1;
            }
        }
        self.save_source_cursor(cursor.as_deref())?;
        info!(
            target: "folio::index",
            index_id = %self.index_id,
            fetched = changes.len(),
            queued,
            "resynchronized with source"
        );
        Ok(())
    }

    /// Whether `event` concerns an item this index watches.
    pub fn is_relevant(&self, event: &PendingEvent) -> bool {
        event
            .item_id()
            .is_some_and(|id| self.patterns.iter().any(|p| p.matches(id)))
    }

    /// Enqueues `event` if it is relevant. Returns whether it was queued.
    pub fn trigger(&self, event: &PendingEvent) -> Result<bool> {
        if !self.is_relevant(event) {
            return Ok(false);
        }
        self.queue.enqueue(event.clone())?;
        Ok(true)
    }

    /// Records how far the upstream change stream has been consumed.
    pub fn save_source_cursor(&self, cursor: Option<&str>) -> Result<()> {
        self.state.set(SOURCE_CURSOR, &cursor)
    }

    /// The saved upstream cursor.
    pub fn source_cursor(&self) -> Result<Option<String>> {
        self.state.get(SOURCE_CURSOR)
    }

    /// Listing of the forward tree's pages, taken under the index lock.
    pub fn get_metadata(&self) -> Result<IndexMetadata> {
        let core = self.core.lock();
        let mut pages = Vec::new();
        for page in core.forward.leaf_pages()? {
            let info = core.forward.page_info(page)?;
            pages.push(PageSummary {
                page: page.0,
                count: info.len(),
                hash: info.hash().to_owned(),
            });
        }
        Ok(IndexMetadata {
            index_id: self.index_id.clone(),
            keys: self.definition.keys.clone(),
            page_size: self.page_size,
            item_count: core.reverse.len()?,
            pages,
        })
    }

    /// Number of forward-tree pages.
    pub fn get_page_count(&self) -> usize {
        self.core.lock().forward.store().page_count()
    }

    /// File backing forward-tree page `page`.
    pub fn page_path(&self, page: PageNo) -> PathBuf {
        self.core.lock().forward.store().page_path(page)
    }

    /// Forward entries in key order.
    pub fn entries(&self) -> Result<Vec<(Key, String)>> {
        self.core.lock().forward.scan()
    }

    /// Keys currently recorded for `item_id`.
    pub fn keys_of(&self, item_id: &str) -> Result<Option<Vec<Key>>> {
        self.core.lock().reverse.get(&Key::from(item_id))
    }

    /// Checks the invariants of both trees.
    pub fn verify(&self) -> Result<()> {
        let mut core = self.core.lock();
        core.forward.verify()?;
        core.reverse.verify()
    }

    /// Unloads every resident page of both trees.
    pub fn cleanup(&self) -> Result<()> {
        let mut core = self.core.lock();
        core.forward.cleanup()?;
        core.reverse.cleanup()
    }

    /// Number of queued events.
    pub fn pending_len(&self) -> usize {
        self.queue.pending_len()
    }

    /// Blocks until every queued event has been applied.
    pub fn wait_idle(&self) {
        self.queue.wait_idle();
    }

    /// Stops accepting events; the worker exits once drained.
    pub fn close_queue(&self) {
        self.queue.close_queue();
    }

    /// Stops the worker after its current event and waits for it.
    pub fn stop(&self) {
        self.queue.stop();
        self.queue.join();
        info!(target: "folio::index", index_id = %self.index_id, "stopped index");
    }

    /// Stops the index and deletes its state file and page cache.
    pub fn destroy(self) -> Result<()> {
        self.stop();
        self.state.remove()?;
        remove_dir_if_exists(&self.tree_dir)?;
        info!(target: "folio::index", index_id = %self.index_id, "destroyed index");
        Ok(())
    }
}

type Trees = (BTree<String>, BTree<Vec<Key>>, bool);

/// Reopens both trees from their descriptors, or creates empty ones when the
/// state holds none or a page file disagrees with its descriptor. The flag
/// reports a fresh build.
fn open_trees(state: &StateFile, tree_dir: &Path, page_size: usize) -> Result<Trees> {
    let forward_dir = tree_dir.join(FORWARD_KEY);
    let reverse_dir = tree_dir.join(REVERSE_KEY);
    let forward = state.get::<TreeDescriptor>(FORWARD_KEY)?;
    let reverse = state.get::<TreeDescriptor>(REVERSE_KEY)?;
    match (forward, reverse) {
        (Some(forward), Some(reverse)) => {
            if forward.page_size != page_size || reverse.page_size != page_size {
                return Err(FolioError::format(format!(
                    "{}: stored page size does not match definition",
                    state.path().display()
                )));
            }
            let forward = BTree::from_descriptor(forward, &forward_dir)?;
            let reverse = BTree::from_descriptor(reverse, &reverse_dir)?;
            let stale = forward.stale_pages()?.len() + reverse.stale_pages()?.len();
            if stale == 0 {
                return Ok((forward, reverse, false));
            }
            // Pages were written after the descriptors were last saved.
            warn!(
                target: "folio::index",
                state = %state.path().display(),
                stale,
                "page files do not match saved descriptors; rebuilding"
            );
            Ok((
                BTree::create(forward_dir, page_size)?,
                BTree::create(reverse_dir, page_size)?,
                true,
            ))
        }
        _ => Ok((
            BTree::create(forward_dir, page_size)?,
            BTree::create(reverse_dir, page_size)?,
            true,
        )),
    }
}
