//! `.skein/config.toml` loading.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

pub const CONFIG_DIR: &str = ".skein";
pub const CONFIG_FILE: &str = "config.toml";

#[derive(Debug, Deserialize, Serialize, Default, Clone)]
pub struct SkeinConfig {
    #[serde(default)]
    pub workspace: WorkspaceConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub snapshot: SnapshotConfig,
}

#[derive(Debug, Deserialize, Serialize, Default, Clone)]
pub struct WorkspaceConfig {
    /// Workspace roots; empty means the project directory itself
    #[serde(default)]
    pub roots: Vec<PathBuf>,
    /// Library roots: resolvable, indexed, never validated
    #[serde(default)]
    pub external_roots: Vec<PathBuf>,
    #[serde(default)]
    pub ignore: Vec<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct CacheConfig {
    #[serde(default = "default_min_cache_size")]
    pub min_cache_size: usize,
    #[serde(default = "default_max_cache_size")]
    pub max_cache_size: usize,
    /// Keep raw source text inside payloads
    #[serde(default)]
    pub keep_source: bool,
}

fn default_min_cache_size() -> usize {
    100
}
fn default_max_cache_size() -> usize {
    500
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            min_cache_size: default_min_cache_size(),
            max_cache_size: default_max_cache_size(),
            keep_source: false,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SchedulerConfig {
    /// Tasks per batch before the scheduler yields
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_eval_depth")]
    pub max_eval_depth: usize,
}

fn default_batch_size() -> usize {
    50
}
fn default_max_eval_depth() -> usize {
    256
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            max_eval_depth: default_max_eval_depth(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SnapshotConfig {
    #[serde(default = "default_snapshot_enabled")]
    pub enabled: bool,
    /// Defaults to the user cache directory
    #[serde(default)]
    pub path: Option<PathBuf>,
}

fn default_snapshot_enabled() -> bool {
    true
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            enabled: default_snapshot_enabled(),
            path: None,
        }
    }
}

impl SkeinConfig {
    /// Config rooted at `root`: relative roots are made absolute, empty
    /// workspace roots become `root`, cache bounds are made consistent.
    pub fn resolved(mut self, root: &Path) -> Self {
        let absolute = |p: PathBuf| if p.is_relative() { root.join(p) } else { p };
        self.workspace.roots = if self.workspace.roots.is_empty() {
            vec![root.to_path_buf()]
        } else {
            self.workspace.roots.into_iter().map(absolute).collect()
        };
        self.workspace.external_roots = self
            .workspace
            .external_roots
            .into_iter()
            .map(absolute)
            .collect();
        self.snapshot.path = self.snapshot.path.map(absolute);

        if self.cache.max_cache_size < self.cache.min_cache_size {
            tracing::warn!(
                "max_cache_size {} is below min_cache_size {}, raising it",
                self.cache.max_cache_size,
                self.cache.min_cache_size
            );
            self.cache.max_cache_size = self.cache.min_cache_size;
        }
        if self.scheduler.batch_size == 0 {
            tracing::warn!("batch_size 0 would never make progress, using 1");
            self.scheduler.batch_size = 1;
        }
        self
    }

    /// Snapshot file for this project, if snapshots are enabled.
    pub fn snapshot_path(&self, root: &Path) -> Option<PathBuf> {
        if !self.snapshot.enabled {
            return None;
        }
        if let Some(path) = &self.snapshot.path {
            return Some(path.clone());
        }
        let key = blake3::hash(root.to_string_lossy().as_bytes()).to_hex();
        let base = dirs::cache_dir().unwrap_or_else(|| root.join(CONFIG_DIR));
        Some(base.join("skein").join(format!("{}.snapshot", &key[..16])))
    }
}

/// Load configuration from `<root>/.skein/config.toml`, falling back to
/// defaults when it is missing or malformed.
pub fn load_config(root: &Path) -> SkeinConfig {
    let config_path = root.join(CONFIG_DIR).join(CONFIG_FILE);
    if !config_path.exists() {
        return SkeinConfig::default().resolved(root);
    }

    let config = match std::fs::read_to_string(&config_path) {
        Ok(content) => toml::from_str(&content).unwrap_or_else(|e| {
            tracing::warn!("Failed to parse {:?}: {}", config_path, e);
            SkeinConfig::default()
        }),
        Err(e) => {
            tracing::warn!("Failed to read {:?}: {}", config_path, e);
            SkeinConfig::default()
        }
    };
    config.resolved(root)
}

pub const DEFAULT_CONFIG: &str = r#"# skein configuration
# See: skein config --help

[workspace]
roots = []
external_roots = []
ignore = []

[cache]
min_cache_size = 100
max_cache_size = 500
keep_source = false

[scheduler]
batch_size = 50
max_eval_depth = 256

[snapshot]
enabled = true
"#;
