//! Leaf pages and the store that persists them.
//!
//! Every leaf of a [`super::BTree`] lives in its own JSON page file inside the
//! tree's directory. Pages start out *unloaded* when a tree is reopened from a
//! descriptor: only the page number, the cached entry count and the cached
//! content hash are known until the first access reads the file.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::mem;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};

use lru::LruCache;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::primitives::io::{read_optional, remove_dir_if_exists, remove_if_exists, write_atomic};
use crate::storage::key::Key;
use crate::types::{content_hash, FolioError, PageNo, Result};

/// Format version written into every page file.
pub const PAGE_FORMAT_VERSION: u32 = 1;

#[derive(Serialize)]
struct PageFileOut<'a, V> {
    version: u32,
    keys: Vec<&'a Key>,
    values: Vec<&'a V>,
}

#[derive(Deserialize)]
struct PageVersion {
    version: u32,
}

#[derive(Deserialize)]
struct PageFileIn<V> {
    keys: Vec<Key>,
    values: Vec<V>,
}

/// One persisted leaf: an ordered run of key/value pairs.
pub struct LeafPage<V> {
    number: PageNo,
    entries: Option<Vec<(Key, V)>>,
    count: usize,
    hash: String,
    dirty: bool,
}

impl<V> LeafPage<V> {
    fn fresh(number: PageNo) -> Self {
        Self {
            number,
            entries: Some(Vec::new()),
            count: 0,
            hash: String::new(),
            dirty: true,
        }
    }

    fn unloaded(number: PageNo, count: usize, hash: String) -> Self {
        Self {
            number,
            entries: None,
            count,
            hash,
            dirty: false,
        }
    }

    /// Page number.
    pub fn number(&self) -> PageNo {
        self.number
    }

    /// Entry count; the cached count while unloaded.
    pub fn len(&self) -> usize {
        match &self.entries {
            Some(entries) => entries.len(),
            None => self.count,
        }
    }

    /// True when the page holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Content hash as of the last write or load.
    pub fn hash(&self) -> &str {
        &self.hash
    }

    /// Whether the pairs are resident in memory.
    pub fn is_loaded(&self) -> bool {
        self.entries.is_some()
    }

    /// Whether the page has changes not yet written.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Resident entries in key order; empty while unloaded.
    pub fn entries(&self) -> &[(Key, V)] {
        self.entries.as_deref().unwrap_or(&[])
    }

    /// Resident keys in order.
    pub fn keys(&self) -> impl Iterator<Item = &Key> + '_ {
        self.entries().iter().map(|(k, _)| k)
    }

    /// Resident values in key order.
    pub fn values(&self) -> impl Iterator<Item = &V> + '_ {
        self.entries().iter().map(|(_, v)| v)
    }

    /// Position of `key` among the resident entries.
    pub fn position(&self, key: &Key) -> Option<usize> {
        self.entries()
            .binary_search_by(|(k, _)| k.cmp(key))
            .ok()
    }

    /// Value stored under `key`, if resident.
    pub fn get(&self, key: &Key) -> Option<&V> {
        self.position(key).map(|idx| &self.entries()[idx].1)
    }

    /// True if `key` is resident in this page.
    pub fn contains_key(&self, key: &Key) -> bool {
        self.position(key).is_some()
    }

    pub(crate) fn entries_mut(&mut self) -> &mut Vec<(Key, V)> {
        self.dirty = true;
        self.entries.get_or_insert_with(Vec::new)
    }
}

impl<V> fmt::Debug for LeafPage<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LeafPage")
            .field("number", &self.number)
            .field("len", &self.len())
            .field("loaded", &self.is_loaded())
            .field("dirty", &self.dirty)
            .field("hash", &self.hash)
            .finish()
    }
}

/// Handle for one change-tracking session opened with [`PageStore::track_changes`].
#[derive(Debug, PartialEq, Eq)]
#[must_use = "a change session must be passed back to stop_tracking"]
pub struct ChangeSession {
    id: u64,
}

/// Page numbers written or removed during a change-tracking session.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PageChanges {
    /// Pages written since the session started.
    pub changed: BTreeSet<PageNo>,
    /// Pages deallocated since the session started.
    pub removed: BTreeSet<PageNo>,
}

impl PageChanges {
    /// True when nothing was written or removed.
    pub fn is_empty(&self) -> bool {
        self.changed.is_empty() && self.removed.is_empty()
    }

    fn record_write(&mut self, page: PageNo) {
        self.removed.remove(&page);
        self.changed.insert(page);
    }

    fn record_removal(&mut self, page: PageNo) {
        self.changed.remove(&page);
        self.removed.insert(page);
    }
}

/// Allocates, loads and persists the leaf pages of one tree.
pub struct PageStore<V> {
    dir: PathBuf,
    pages: BTreeMap<PageNo, LeafPage<V>>,
    sessions: BTreeMap<u64, PageChanges>,
    next_session: u64,
    resident: LruCache<PageNo, ()>,
    max_loaded: Option<NonZeroUsize>,
}

impl<V> PageStore<V>
where
    V: Serialize + DeserializeOwned,
{
    /// Opens a store rooted at `dir`, creating the directory if needed.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            pages: BTreeMap::new(),
            sessions: BTreeMap::new(),
            next_session: 1,
            resident: LruCache::unbounded(),
            max_loaded: None,
        })
    }

    /// Directory holding the page files.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Location of the file backing `page`.
    pub fn page_path(&self, page: PageNo) -> PathBuf {
        self.dir.join(format!("{}.json", page.0))
    }

    /// Bounds the number of resident pages; `None` disables eviction.
    pub fn set_max_loaded_pages(&mut self, max: Option<usize>) {
        self.max_loaded = max.and_then(NonZeroUsize::new);
    }

    /// Number of pages whose entries are resident.
    pub fn loaded_count(&self) -> usize {
        self.pages.values().filter(|p| p.is_loaded()).count()
    }

    /// Number of allocated pages.
    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    /// Metadata of every allocated page, by page number.
    pub fn pages(&self) -> impl Iterator<Item = &LeafPage<V>> + '_ {
        self.pages.values()
    }

    /// Registers an existing page as unloaded, from descriptor metadata.
    pub(crate) fn register(&mut self, page: PageNo, count: usize, hash: String) -> Result<()> {
        if self.pages.contains_key(&page) {
            return Err(FolioError::format(format!(
                "page {page} referenced twice in descriptor"
            )));
        }
        self.pages.insert(page, LeafPage::unloaded(page, count, hash));
        Ok(())
    }

    /// Allocates the lowest unused page number and returns it as an empty, resident page.
    pub fn allocate(&mut self) -> Result<PageNo> {
        let mut candidate = 0u32;
        for number in self.pages.keys() {
            if number.0 != candidate {
                break;
            }
            candidate = candidate
                .checked_add(1)
                .ok_or(FolioError::Invalid("page number space exhausted"))?;
        }
        let page = PageNo(candidate);
        self.pages.insert(page, LeafPage::fresh(page));
        self.touch(page);
        debug!(target: "folio::pages", dir = %self.dir.display(), %page, "allocated page");
        Ok(page)
    }

    /// Frees `page` and removes its file.
    pub fn deallocate(&mut self, page: PageNo) -> Result<()> {
        if self.pages.remove(&page).is_none() {
            return Err(FolioError::not_found(format!("page {page}")));
        }
        self.resident.pop(&page);
        remove_if_exists(self.page_path(page))?;
        for session in self.sessions.values_mut() {
            session.record_removal(page);
        }
        debug!(target: "folio::pages", dir = %self.dir.display(), %page, "deallocated page");
        Ok(())
    }

    /// Loads `page` if needed and returns it.
    pub fn load(&mut self, page: PageNo) -> Result<&LeafPage<V>> {
        self.ensure_loaded(page)?;
        self.touch(page);
        self.evict_over_limit(page)?;
        self.page(page)
    }

    /// Metadata of `page` without loading it.
    pub fn page(&self, page: PageNo) -> Result<&LeafPage<V>> {
        self.pages
            .get(&page)
            .ok_or_else(|| FolioError::not_found(format!("page {page}")))
    }

    /// Entry count of `page`, from cached metadata when unloaded.
    pub fn page_len(&self, page: PageNo) -> Result<usize> {
        Ok(self.page(page)?.len())
    }

    pub(crate) fn page_mut(&mut self, page: PageNo) -> Result<&mut LeafPage<V>> {
        self.ensure_loaded(page)?;
        self.touch(page);
        let leaf = self
            .pages
            .get_mut(&page)
            .ok_or_else(|| FolioError::not_found(format!("page {page}")))?;
        leaf.dirty = true;
        Ok(leaf)
    }

    pub(crate) fn take_entries(&mut self, page: PageNo) -> Result<Vec<(Key, V)>> {
        Ok(mem::take(self.page_mut(page)?.entries_mut()))
    }

    pub(crate) fn put_entries(&mut self, page: PageNo, entries: Vec<(Key, V)>) -> Result<()> {
        *self.page_mut(page)?.entries_mut() = entries;
        Ok(())
    }

    /// Writes `page` if it changed since the last write.
    pub fn write(&mut self, page: PageNo) -> Result<()> {
        let path = self.page_path(page);
        let leaf = self
            .pages
            .get_mut(&page)
            .ok_or_else(|| FolioError::not_found(format!("page {page}")))?;
        if !leaf.dirty {
            return Ok(());
        }
        let entries = leaf.entries.as_deref().unwrap_or(&[]);
        let body = PageFileOut {
            version: PAGE_FORMAT_VERSION,
            keys: entries.iter().map(|(k, _)| k).collect(),
            values: entries.iter().map(|(_, v)| v).collect(),
        };
        let bytes = serde_json::to_vec(&body)?;
        write_atomic(&path, &bytes)?;
        leaf.count = entries.len();
        leaf.hash = content_hash(&bytes);
        leaf.dirty = false;
        for session in self.sessions.values_mut() {
            session.record_write(page);
        }
        Ok(())
    }

    /// Writes every dirty page.
    pub fn flush(&mut self) -> Result<()> {
        let dirty: Vec<PageNo> = self
            .pages
            .values()
            .filter(|p| p.dirty)
            .map(|p| p.number)
            .collect();
        for page in dirty {
            self.write(page)?;
        }
        Ok(())
    }

    /// Drops the resident entries of `page`, writing them first if dirty.
    pub fn unload(&mut self, page: PageNo) -> Result<()> {
        self.write(page)?;
        if let Some(leaf) = self.pages.get_mut(&page) {
            leaf.entries = None;
        }
        self.resident.pop(&page);
        Ok(())
    }

    /// Unloads every resident page without losing its disk representation.
    pub fn cleanup(&mut self) -> Result<()> {
        let loaded: Vec<PageNo> = self
            .pages
            .values()
            .filter(|p| p.is_loaded())
            .map(|p| p.number)
            .collect();
        for page in &loaded {
            self.unload(*page)?;
        }
        debug!(
            target: "folio::pages",
            dir = %self.dir.display(),
            unloaded = loaded.len(),
            "page cleanup"
        );
        Ok(())
    }

    /// Starts recording which pages are written or removed.
    pub fn track_changes(&mut self) -> ChangeSession {
        let id = self.next_session;
        self.next_session += 1;
        self.sessions.insert(id, PageChanges::default());
        ChangeSession { id }
    }

    /// Ends `session` and returns what it recorded.
    pub fn stop_tracking(&mut self, session: ChangeSession) -> PageChanges {
        self.sessions.remove(&session.id).unwrap_or_default()
    }

    /// Compares the file of `page` with its recorded entry count and hash.
    ///
    /// Dirty pages are skipped, their file is about to be rewritten. Returns a
    /// description of the first difference found.
    pub fn check_file(&self, page: PageNo) -> Result<Option<String>> {
        let leaf = self.page(page)?;
        if leaf.dirty {
            return Ok(None);
        }
        let Some(bytes) = read_optional(&self.page_path(page))? else {
            if leaf.count == 0 && leaf.hash.is_empty() {
                return Ok(None);
            }
            return Ok(Some("page file missing".to_owned()));
        };
        let hash = content_hash(&bytes);
        if !leaf.hash.is_empty() && hash != leaf.hash {
            return Ok(Some(format!(
                "file hash {hash} differs from recorded {}",
                leaf.hash
            )));
        }
        let stored = match decode_page::<V>(&bytes) {
            Ok(entries) => entries.len(),
            Err(FolioError::Format(msg)) => return Ok(Some(msg)),
            Err(err) => return Err(err),
        };
        if stored != leaf.count {
            return Ok(Some(format!(
                "file holds {stored} entries, recorded {}",
                leaf.count
            )));
        }
        Ok(None)
    }

    /// Removes every page file and the store directory.
    pub fn destroy(self) -> Result<()> {
        remove_dir_if_exists(&self.dir)
    }

    fn ensure_loaded(&mut self, page: PageNo) -> Result<()> {
        let path = self.page_path(page);
        let leaf = self
            .pages
            .get_mut(&page)
            .ok_or_else(|| FolioError::not_found(format!("page {page}")))?;
        if leaf.entries.is_some() {
            return Ok(());
        }
        match read_optional(&path)? {
            Some(bytes) => {
                let entries = decode_page::<V>(&bytes).map_err(|err| match err {
                    FolioError::Format(msg) => {
                        FolioError::format(format!("{}: {msg}", path.display()))
                    }
                    other => other,
                })?;
                let hash = content_hash(&bytes);
                if !leaf.hash.is_empty() && leaf.hash != hash {
                    warn!(
                        target: "folio::pages",
                        %page,
                        expected = %leaf.hash,
                        actual = %hash,
                        "page hash differs from descriptor"
                    );
                }
                leaf.count = entries.len();
                leaf.hash = hash;
                leaf.entries = Some(entries);
            }
            None => {
                warn!(
                    target: "folio::pages",
                    %page,
                    path = %path.display(),
                    "page file missing; starting from an empty page"
                );
                leaf.entries = Some(Vec::new());
                leaf.count = 0;
                leaf.dirty = true;
            }
        }
        Ok(())
    }

    fn touch(&mut self, page: PageNo) {
        self.resident.put(page, ());
    }

    fn evict_over_limit(&mut self, keep: PageNo) -> Result<()> {
        let Some(max) = self.max_loaded else {
            return Ok(());
        };
        while self.resident.len() > max.get() {
            let victim = self
                .resident
                .iter()
                .rev()
                .map(|(page, _)| *page)
                .find(|page| {
                    *page != keep && self.pages.get(page).is_some_and(|p| !p.dirty)
                });
            let Some(victim) = victim else {
                break;
            };
            self.unload(victim)?;
        }
        Ok(())
    }
}

fn decode_page<V: DeserializeOwned>(bytes: &[u8]) -> Result<Vec<(Key, V)>> {
    let probe: PageVersion = serde_json::from_slice(bytes)
        .map_err(|err| FolioError::format(format!("unreadable page: {err}")))?;
    if probe.version != PAGE_FORMAT_VERSION {
        return Err(FolioError::format(format!(
            "unsupported page version {} (expected {PAGE_FORMAT_VERSION})",
            probe.version
        )));
    }
    let body: PageFileIn<V> = serde_json::from_slice(bytes)
        .map_err(|err| FolioError::format(format!("unreadable page: {err}")))?;
    if body.keys.len() != body.values.len() {
        return Err(FolioError::format(format!(
            "page has {} keys but {} values",
            body.keys.len(),
            body.values.len()
        )));
    }
    Ok(body.keys.into_iter().zip(body.values).collect())
}
