//! Durable per-file metadata: hashes, open state, diagnostics, import edges.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use indexmap::IndexSet;
use lsp_types::Diagnostic;

use super::source::content_hash;
use crate::cache::AstCache;
use crate::models::{BuildStatus, BuildStep, FileOrigin, FileRecord, ModuleOutline};

pub struct FileRecordStore {
    records: HashMap<PathBuf, FileRecord>,
    workspace_roots: Vec<PathBuf>,
    /// Reverse import edges: imported file -> direct importers
    dependents: HashMap<PathBuf, IndexSet<PathBuf>>,
    /// Files whose content hash changed under a reload
    stale: IndexSet<PathBuf>,
}

#[allow(dead_code)]
impl FileRecordStore {
    pub fn new(workspace_roots: Vec<PathBuf>) -> Self {
        Self {
            records: HashMap::new(),
            workspace_roots,
            dependents: HashMap::new(),
            stale: IndexSet::new(),
        }
    }

    pub fn classify(&self, path: &Path) -> FileOrigin {
        if self.workspace_roots.iter().any(|root| path.starts_with(root)) {
            FileOrigin::Workspace
        } else {
            FileOrigin::External
        }
    }

    pub fn get_or_create(&mut self, path: &Path) -> &mut FileRecord {
        let origin = self.classify(path);
        self.records.entry(path.to_path_buf()).or_insert_with(|| {
            tracing::debug!("Discovered {:?} ({:?})", path, origin);
            FileRecord::new(path.to_path_buf(), origin)
        })
    }

    pub fn get(&self, path: &Path) -> Option<&FileRecord> {
        self.records.get(path)
    }

    pub fn get_mut(&mut self, path: &Path) -> Option<&mut FileRecord> {
        self.records.get_mut(path)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn is_open(&self, path: &Path) -> bool {
        self.records.get(path).is_some_and(|r| r.open)
    }

    pub fn status(&self, path: &Path, step: BuildStep) -> BuildStatus {
        self.records
            .get(path)
            .map(|r| r.status(step))
            .unwrap_or_default()
    }

    /// Records sorted by path, for deterministic reporting.
    pub fn sorted(&self) -> Vec<&FileRecord> {
        let mut records: Vec<&FileRecord> = self.records.values().collect();
        records.sort_by(|a, b| a.path.cmp(&b.path));
        records
    }

    /// Open a file, optionally with editor text. Returns true when the text
    /// differs from what the last build saw.
    pub fn mark_open(&mut self, cache: &mut AstCache, path: &Path, text: Option<String>) -> bool {
        let record = self.get_or_create(path);
        record.open = true;
        let mut changed = false;
        if let Some(text) = text {
            let hash = content_hash(text.as_bytes());
            changed = record.hash.as_deref() != Some(hash.as_str());
            record.overlay = Some(Arc::from(text));
        }
        if changed {
            cache.invalidate(path);
        }
        cache.promote(path);
        changed
    }

    /// Close a file. Returns true when an overlay was dropped, meaning disk
    /// content must be reparsed.
    pub fn mark_closed(&mut self, cache: &mut AstCache, path: &Path) -> bool {
        let Some(record) = self.records.get_mut(path) else {
            return false;
        };
        record.open = false;
        let had_overlay = record.overlay.take().is_some();
        if had_overlay {
            cache.invalidate(path);
        } else {
            cache.demote(path);
        }
        had_overlay
    }

    /// Replace the diagnostics of one step.
    pub fn record_diagnostics(&mut self, path: &Path, step: BuildStep, diagnostics: Vec<Diagnostic>) {
        let record = self.get_or_create(path);
        if diagnostics.is_empty() {
            record.diagnostics.remove(&step);
        } else {
            record.diagnostics.insert(step, diagnostics);
        }
    }

    /// Union of every step's diagnostics, in step order.
    pub fn diagnostics(&self, path: &Path) -> Vec<Diagnostic> {
        self.records
            .get(path)
            .map(|r| r.diagnostics.values().flatten().cloned().collect())
            .unwrap_or_default()
    }

    /// Replace the import edges of `path`, keeping the reverse index in sync.
    pub fn set_imports(&mut self, path: &Path, imports: Vec<PathBuf>) {
        let record = self.get_or_create(path);
        let previous = std::mem::replace(&mut record.imports, imports.clone());
        for old in previous {
            if let Some(importers) = self.dependents.get_mut(&old) {
                importers.shift_remove(path);
            }
        }
        for new in imports {
            self.dependents
                .entry(new)
                .or_default()
                .insert(path.to_path_buf());
        }
    }

    /// Direct importers of `path`.
    pub fn dependents(&self, path: &Path) -> Vec<PathBuf> {
        self.dependents
            .get(path)
            .map(|d| d.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// True when an open file imports `path` directly.
    pub fn has_open_dependent(&self, path: &Path) -> bool {
        self.dependents
            .get(path)
            .is_some_and(|d| d.iter().any(|importer| self.is_open(importer)))
    }

    /// Transitive importers of `path`, breadth first, excluding `path`.
    pub fn rebuild_set(&self, path: &Path) -> Vec<PathBuf> {
        let mut seen: IndexSet<PathBuf> = IndexSet::new();
        let mut queue: VecDeque<&Path> = VecDeque::from([path]);
        while let Some(current) = queue.pop_front() {
            if let Some(importers) = self.dependents.get(current) {
                for importer in importers {
                    if importer != path && seen.insert(importer.clone()) {
                        queue.push_back(importer);
                    }
                }
            }
        }
        seen.into_iter().collect()
    }

    /// Install symbol metadata restored from a snapshot.
    pub fn restore(
        &mut self,
        path: &Path,
        hash: String,
        mtime: i64,
        outline: ModuleOutline,
        imports: Vec<PathBuf>,
    ) {
        let record = self.get_or_create(path);
        record.hash = Some(hash);
        record.mtime = mtime;
        record.outline = Some(Arc::new(outline));
        record.from_snapshot = true;
        record.reset_from(BuildStep::Arch);
        record.set_status(BuildStep::Arch, BuildStatus::Done);
        self.set_imports(path, imports);
    }

    /// The file is gone from disk: forget its build products, keep the record.
    pub fn mark_missing(&mut self, path: &Path) {
        let record = self.get_or_create(path);
        record.missing = true;
        record.hash = None;
        record.outline = None;
        record.overlay = None;
        record.diagnostics.clear();
        record.reset_from(BuildStep::Arch);
        self.set_imports(path, Vec::new());
    }

    pub fn mark_stale(&mut self, path: &Path) {
        self.stale.insert(path.to_path_buf());
    }

    pub fn has_stale(&self) -> bool {
        !self.stale.is_empty()
    }

    pub fn take_stale(&mut self) -> Vec<PathBuf> {
        std::mem::take(&mut self.stale).into_iter().collect()
    }
}
