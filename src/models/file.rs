use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use lsp_types::Diagnostic;
use serde::{Deserialize, Serialize};

use super::payload::{ExportTable, ModuleOutline};

/// Build steps, strictly ordered per file
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildStep {
    Arch,
    ArchEval,
    Validation,
}

impl BuildStep {
    pub const ALL: [BuildStep; 3] = [BuildStep::Arch, BuildStep::ArchEval, BuildStep::Validation];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Arch => "arch",
            Self::ArchEval => "arch_eval",
            Self::Validation => "validation",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildStatus {
    #[default]
    Pending,
    InProgress,
    Done,
    Failed,
}

impl BuildStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheTier {
    Persistent,
    Transient,
}

/// Outcome of one scheduler batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    NeedsMoreWork,
    Complete,
    Interrupted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileOrigin {
    Workspace,
    External,
}

/// Durable per-file metadata. Survives payload eviction.
#[derive(Debug, Clone)]
pub struct FileRecord {
    pub path: PathBuf,
    pub hash: Option<String>,
    pub mtime: i64,
    pub open: bool,
    pub origin: FileOrigin,
    /// Unsaved editor text; takes precedence over disk while set
    pub overlay: Option<Arc<str>>,
    pub status: [BuildStatus; 3],
    pub diagnostics: BTreeMap<BuildStep, Vec<Diagnostic>>,
    /// Arch product
    pub outline: Option<Arc<ModuleOutline>>,
    pub imports: Vec<PathBuf>,
    /// ArchEval product
    pub exports: Option<Arc<ExportTable>>,
    pub from_snapshot: bool,
    pub missing: bool,
}

impl FileRecord {
    pub fn new(path: PathBuf, origin: FileOrigin) -> Self {
        Self {
            path,
            hash: None,
            mtime: 0,
            open: false,
            origin,
            overlay: None,
            status: [BuildStatus::Pending; 3],
            diagnostics: BTreeMap::new(),
            outline: None,
            imports: Vec::new(),
            exports: None,
            from_snapshot: false,
            missing: false,
        }
    }

    pub fn is_workspace(&self) -> bool {
        self.origin == FileOrigin::Workspace
    }

    pub fn status(&self, step: BuildStep) -> BuildStatus {
        self.status[step.index()]
    }

    pub fn set_status(&mut self, step: BuildStep, status: BuildStatus) {
        self.status[step.index()] = status;
    }

    /// Mark `step` and every later step as needing a rebuild.
    pub fn reset_from(&mut self, step: BuildStep) {
        for later in BuildStep::ALL.into_iter().filter(|s| *s >= step) {
            self.status[later.index()] = BuildStatus::Pending;
        }
        if step <= BuildStep::ArchEval {
            self.exports = None;
        }
    }

    pub fn is_built(&self) -> bool {
        self.status.iter().all(|s| s.is_terminal())
    }

    pub fn diagnostic_count(&self) -> usize {
        self.diagnostics.values().map(Vec::len).sum()
    }
}
