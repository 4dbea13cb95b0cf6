use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::types::{FolioError, Result};

/// Page size used when an index definition does not name one.
pub const DEFAULT_PAGE_SIZE: usize = 50;

/// Runtime configuration shared by every index of a process.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FolioConfig {
    /// Directory holding state files and page caches.
    pub cache_dir: PathBuf,
    /// Identifier of the content source, prefixed to state file names.
    pub source_id: String,
    /// Page size for definitions without an explicit one.
    pub default_page_size: usize,
    /// Upper bound on resident pages per tree; `None` keeps every page loaded.
    pub max_loaded_pages: Option<usize>,
}

impl Default for FolioConfig {
    fn default() -> Self {
        Self {
            cache_dir: default_cache_dir(),
            source_id: "default".to_owned(),
            default_page_size: DEFAULT_PAGE_SIZE,
            max_loaded_pages: None,
        }
    }
}

impl FolioConfig {
    /// Configuration rooted at `cache_dir` with defaults elsewhere.
    pub fn with_cache_dir(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            ..Self::default()
        }
    }

    /// Loads `path`, or the default location when `None`. A missing file
    /// yields the defaults.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let path = match explicit {
            Some(path) => Some(path.to_path_buf()),
            None => default_config_path(),
        };
        let Some(path) = path else {
            return Ok(Self::default());
        };
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = fs::read_to_string(&path)?;
        let config: Self = toml::from_str(&contents).map_err(|err| {
            FolioError::config(format!("failed to parse {}: {err}", path.display()))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Writes the configuration as TOML to `path`.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let serialized = toml::to_string_pretty(self)
            .map_err(|err| FolioError::config(format!("failed to serialize config: {err}")))?;
        fs::write(path, serialized)?;
        Ok(())
    }

    /// Rejects values no index could be built with.
    pub fn validate(&self) -> Result<()> {
        if self.default_page_size < crate::storage::btree::MIN_PAGE_SIZE {
            return Err(FolioError::config(format!(
                "default_page_size {} is below the minimum of {}",
                self.default_page_size,
                crate::storage::btree::MIN_PAGE_SIZE
            )));
        }
        if self.source_id.is_empty() {
            return Err(FolioError::config("source_id must not be empty"));
        }
        Ok(())
    }
}

/// `<platform cache dir>/folio/index`, or a relative `.folio-cache` when the
/// platform has none.
pub fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .map(|base| base.join("folio").join("index"))
        .unwrap_or_else(|| PathBuf::from(".folio-cache"))
}

/// `<platform config dir>/folio/folio.toml`.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|base| base.join("folio").join("folio.toml"))
}
