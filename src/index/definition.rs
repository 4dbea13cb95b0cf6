use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::keyspec::KeySpec;
use super::pattern::{compile_all, GlobPattern};
use crate::storage::btree::MIN_PAGE_SIZE;
use crate::types::{FolioError, Result};

/// The kinds of index a definition can name in its `type` field.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IndexKind {
    /// Items ordered by composite keys derived from their metadata.
    #[serde(rename = "ItemIndex", alias = "sorted")]
    Sorted,
}

impl IndexKind {
    /// The `type` string written for this kind.
    pub fn type_name(self) -> &'static str {
        match self {
            IndexKind::Sorted => "ItemIndex",
        }
    }
}

/// Declarative description of one index, as carried by an index item's
/// `index` metadata field.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDefinition {
    /// Index kind.
    #[serde(rename = "type")]
    pub kind: IndexKind,
    /// Item-id patterns the index watches.
    pub from: Vec<String>,
    /// Key positions, most significant first.
    #[serde(default)]
    pub keys: Vec<KeySpec>,
    /// Entries per page; the configured default when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_size: Option<usize>,
}

impl IndexDefinition {
    /// Sorted index over `from` ordered by `keys`.
    pub fn sorted(from: Vec<String>, keys: Vec<KeySpec>) -> Self {
        Self {
            kind: IndexKind::Sorted,
            from,
            keys,
            page_size: None,
        }
    }

    /// Same definition with an explicit page size.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = Some(page_size);
        self
    }

    /// Parses a definition out of item metadata.
    pub fn from_value(value: &Value) -> Result<Self> {
        serde_json::from_value(value.clone())
            .map_err(|err| FolioError::config(format!("invalid index definition: {err}")))
    }

    /// Effective page size given the configured default.
    pub fn effective_page_size(&self, default: usize) -> usize {
        self.page_size.unwrap_or(default)
    }

    /// Checks the definition and compiles its patterns.
    pub fn validate(&self, default_page_size: usize) -> Result<Vec<GlobPattern>> {
        if self.from.is_empty() {
            return Err(FolioError::config("index watches no items: `from` is empty"));
        }
        let page_size = self.effective_page_size(default_page_size);
        if page_size < MIN_PAGE_SIZE {
            return Err(FolioError::config(format!(
                "page size {page_size} is below the minimum of {MIN_PAGE_SIZE}"
            )));
        }
        if let Some(spec) = self.keys.iter().find(|spec| spec.field.is_empty()) {
            return Err(FolioError::config(format!(
                "key spec {spec:?} has an empty field name"
            )));
        }
        compile_all(&self.from)
    }
}
