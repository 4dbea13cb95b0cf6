use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

/// Snapshot of B+ tree statistics at a point in time.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub struct BTreeStatsSnapshot {
    /// Number of leaf lookups performed
    pub leaf_searches: u64,
    /// Number of interior nodes visited while descending
    pub internal_searches: u64,
    /// Number of leaf page splits performed
    pub leaf_splits: u64,
    /// Number of interior node splits performed
    pub internal_splits: u64,
    /// Number of leaf page merges performed
    pub leaf_merges: u64,
    /// Number of interior node merges performed
    pub internal_merges: u64,
    /// Number of leaf underflows repaired by borrowing from a sibling
    pub leaf_borrows: u64,
    /// Number of interior underflows repaired by borrowing from a sibling
    pub internal_borrows: u64,
    /// Number of times the tree grew a level
    pub root_grows: u64,
    /// Number of times the tree lost a level
    pub root_collapses: u64,
}

/// Thread-safe statistics tracking for B+ tree operations.
#[derive(Default)]
pub struct BTreeStats {
    leaf_searches: AtomicU64,
    internal_searches: AtomicU64,
    leaf_splits: AtomicU64,
    internal_splits: AtomicU64,
    leaf_merges: AtomicU64,
    internal_merges: AtomicU64,
    leaf_borrows: AtomicU64,
    internal_borrows: AtomicU64,
    root_grows: AtomicU64,
    root_collapses: AtomicU64,
}

impl BTreeStats {
    /// Returns the current count of leaf lookups.
    pub fn leaf_searches(&self) -> u64 {
        self.leaf_searches.load(AtomicOrdering::Relaxed)
    }

    /// Returns the current count of interior node visits.
    pub fn internal_searches(&self) -> u64 {
        self.internal_searches.load(AtomicOrdering::Relaxed)
    }

    /// Returns the current count of leaf page splits.
    pub fn leaf_splits(&self) -> u64 {
        self.leaf_splits.load(AtomicOrdering::Relaxed)
    }

    /// Returns the current count of interior node splits.
    pub fn internal_splits(&self) -> u64 {
        self.internal_splits.load(AtomicOrdering::Relaxed)
    }

    /// Returns the current count of leaf page merges.
    pub fn leaf_merges(&self) -> u64 {
        self.leaf_merges.load(AtomicOrdering::Relaxed)
    }

    /// Returns the current count of interior node merges.
    pub fn internal_merges(&self) -> u64 {
        self.internal_merges.load(AtomicOrdering::Relaxed)
    }

    /// Returns the number of leaf borrows.
    pub fn leaf_borrows(&self) -> u64 {
        self.leaf_borrows.load(AtomicOrdering::Relaxed)
    }

    /// Returns the number of interior borrows.
    pub fn internal_borrows(&self) -> u64 {
        self.internal_borrows.load(AtomicOrdering::Relaxed)
    }

    /// Returns how often a new root was created above a split.
    pub fn root_grows(&self) -> u64 {
        self.root_grows.load(AtomicOrdering::Relaxed)
    }

    /// Returns how often the root collapsed into its only child.
    pub fn root_collapses(&self) -> u64 {
        self.root_collapses.load(AtomicOrdering::Relaxed)
    }

    pub(crate) fn inc_leaf_searches(&self) {
        self.leaf_searches.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_internal_searches(&self) {
        self.internal_searches.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_leaf_splits(&self) {
        self.leaf_splits.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_internal_splits(&self) {
        self.internal_splits.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_leaf_merges(&self) {
        self.leaf_merges.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_internal_merges(&self) {
        self.internal_merges.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_leaf_borrows(&self) {
        self.leaf_borrows.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_internal_borrows(&self) {
        self.internal_borrows
            .fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_root_grows(&self) {
        self.root_grows.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_root_collapses(&self) {
        self.root_collapses
            .fetch_add(1, AtomicOrdering::Relaxed);
    }

    /// Creates a snapshot of all current statistics.
    pub fn snapshot(&self) -> BTreeStatsSnapshot {
        BTreeStatsSnapshot {
            leaf_searches: self.leaf_searches(),
            internal_searches: self.internal_searches(),
            leaf_splits: self.leaf_splits(),
            internal_splits: self.internal_splits(),
            leaf_merges: self.leaf_merges(),
            internal_merges: self.internal_merges(),
            leaf_borrows: self.leaf_borrows(),
            internal_borrows: self.internal_borrows(),
            root_grows: self.root_grows(),
            root_collapses: self.root_collapses(),
        }
    }

    /// Emits current statistics to the tracing infrastructure.
    pub fn emit_tracing(&self) {
        let snapshot = self.snapshot();
        tracing::info!(
            target: "folio::btree::stats",
            leaf_searches = snapshot.leaf_searches,
            internal_searches = snapshot.internal_searches,
            leaf_splits = snapshot.leaf_splits,
            internal_splits = snapshot.internal_splits,
            leaf_merges = snapshot.leaf_merges,
            internal_merges = snapshot.internal_merges,
            leaf_borrows = snapshot.leaf_borrows,
            internal_borrows = snapshot.internal_borrows,
            root_grows = snapshot.root_grows,
            root_collapses = snapshot.root_collapses,
            "btree stats snapshot"
        );
    }
}
