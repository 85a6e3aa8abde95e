//! Shared indexing state: the stores plus the protocol operations that
//! mutate them. One owner behind one lock.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use super::eviction::{EvictionCoordinator, EvictionReport};
use super::parser::{ModuleResolver, SourceParser};
use super::records::FileRecordStore;
use super::scheduler::BuildScheduler;
use super::source::SourceReader;
use crate::cache::{AstCache, CacheStats};
use crate::config::SkeinConfig;
use crate::models::{BuildStatus, BuildStep, ProcessState};
use crate::snapshot::IndexSnapshot;

pub struct IndexState {
    pub records: FileRecordStore,
    pub cache: AstCache,
    pub scheduler: BuildScheduler,
    pub evictor: EvictionCoordinator,
    batch_size: usize,
    /// A batch ran since the last eviction pass
    eviction_due: bool,
}

/// Point-in-time counters for status output
#[derive(Debug, Clone, Serialize)]
pub struct IndexStats {
    pub files: usize,
    pub built: usize,
    pub from_snapshot: usize,
    pub diagnostics: usize,
    pub pending: [usize; 3],
    pub processed: u64,
    pub leases: usize,
    pub evicted: u64,
    pub cache: CacheStats,
}

impl IndexState {
    pub fn new(config: &SkeinConfig, reader: Arc<dyn SourceReader>, parser: Box<dyn SourceParser>) -> Self {
        let resolver = ModuleResolver::new(
            config.workspace.roots.clone(),
            config.workspace.external_roots.clone(),
        );
        let cache = AstCache::new(
            reader,
            parser,
            resolver,
            config.cache.min_cache_size,
            config.cache.max_cache_size,
        )
        .with_keep_source(config.cache.keep_source);

        Self {
            records: FileRecordStore::new(config.workspace.roots.clone()),
            cache,
            scheduler: BuildScheduler::new(config.scheduler.max_eval_depth)
                .with_lease_limit(config.cache.max_cache_size),
            evictor: EvictionCoordinator::new(),
            batch_size: config.scheduler.batch_size.max(1),
            eviction_due: false,
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    // -- Protocol events ----------------------------------------------------

    /// Editor opened `path`, optionally with its buffer text.
    pub fn did_open(&mut self, path: &Path, text: Option<String>) {
        let changed = self.records.mark_open(&mut self.cache, path, text);
        let built = self.records.get(path).is_some_and(|r| r.is_built());
        if changed {
            self.clear_hash(path);
        }
        if changed || !built {
            self.schedule_rebuild(path);
        }
        self.reprioritize_around(path);
        tracing::debug!("Opened {:?} (changed: {})", path, changed);
    }

    /// Content changed: editor text when `text` is set, otherwise on disk.
    /// Editor text for a file that is not open is dropped and the change is
    /// taken from disk.
    pub fn did_change(&mut self, path: &Path, text: Option<String>) {
        let record = self.records.get_or_create(path);
        match text {
            Some(_) if !record.open => {
                tracing::debug!("Buffer change for closed {:?}, reading disk instead", path);
            }
            Some(text) => {
                if record.overlay.as_deref() == Some(text.as_str()) {
                    return;
                }
                record.overlay = Some(Arc::from(text));
            }
            None if record.overlay.is_some() => {
                tracing::debug!("Ignoring disk change under open buffer {:?}", path);
                return;
            }
            None => {}
        }
        record.missing = false;
        self.clear_hash(path);
        self.cache.invalidate(path);
        self.schedule_rebuild(path);
    }

    pub fn did_close(&mut self, path: &Path) {
        if self.records.mark_closed(&mut self.cache, path) {
            // The buffer may differ from disk
            self.clear_hash(path);
            self.schedule_rebuild(path);
        }
        self.reprioritize_around(path);
        tracing::debug!("Closed {:?}", path);
    }

    pub fn did_delete(&mut self, path: &Path) {
        let importers = self.records.dependents(path);
        self.scheduler.cancel_file(path);
        self.scheduler.release(path);
        self.cache.invalidate(path);
        self.records.mark_missing(path);

        // Importers resolved their imports against the deleted file
        for importer in &importers {
            self.cache.invalidate(importer);
        }
        for dependent in self.records.rebuild_set(path) {
            self.reset(&dependent);
        }
        tracing::debug!("Deleted {:?}, {} importers to rebuild", path, importers.len());
    }

    /// Register `paths` and queue whatever each still needs. Checks the
    /// token between files.
    pub fn scan(&mut self, paths: &[PathBuf], cancel: &CancellationToken) -> ProcessState {
        let mut queued = 0;
        for path in paths {
            if cancel.is_cancelled() {
                tracing::info!("Scan interrupted after {} files", queued);
                return ProcessState::Interrupted;
            }
            // A failed read is retried: the file may be readable now
            if self.records.get_or_create(path).status(BuildStep::Arch) == BuildStatus::Failed {
                self.clear_hash(path);
                self.schedule_rebuild(path);
                queued += 1;
                continue;
            }
            let record = self.records.get_or_create(path);
            let next = BuildStep::ALL
                .into_iter()
                .find(|step| !record.status(*step).is_terminal());
            if let Some(step) = next {
                if self.scheduler.enqueue(&self.records, path, step) {
                    queued += 1;
                }
            }
        }
        tracing::info!("Scan registered {} files, {} queued", paths.len(), queued);
        ProcessState::Complete
    }

    // -- Scheduling ---------------------------------------------------------

    /// Run one batch. Stale files found along the way are queued for rebuild.
    pub fn process_batch(&mut self, cancel: &CancellationToken) -> ProcessState {
        self.absorb_stale();
        let state = self.scheduler.process_batch(
            &mut self.records,
            &mut self.cache,
            self.batch_size,
            cancel,
        );
        self.eviction_due = true;
        self.absorb_stale();
        match state {
            ProcessState::Complete if self.scheduler.pending_len() > 0 => ProcessState::NeedsMoreWork,
            other => other,
        }
    }

    /// Eviction for the previous batch. Call after the lock was released and
    /// reacquired, never in the same critical section as the batch.
    pub fn after_batch(&mut self) -> EvictionReport {
        if !std::mem::take(&mut self.eviction_due) {
            return EvictionReport::default();
        }
        self.evictor
            .after_batch(&mut self.scheduler, &self.records, &mut self.cache)
    }

    pub fn memory_pressure(&mut self) -> EvictionReport {
        self.evictor
            .on_memory_pressure(&mut self.scheduler, &self.records, &mut self.cache)
    }

    /// Drive batches until nothing is pending. For single-owner callers
    /// without other lock users.
    pub fn run_to_completion(&mut self, cancel: &CancellationToken) -> ProcessState {
        loop {
            self.after_batch();
            match self.process_batch(cancel) {
                ProcessState::NeedsMoreWork => continue,
                state => {
                    self.after_batch();
                    return state;
                }
            }
        }
    }

    pub fn is_idle(&self) -> bool {
        self.scheduler.pending_len() == 0 && !self.records.has_stale()
    }

    // -- Snapshot -----------------------------------------------------------

    pub fn restore_snapshot(&mut self, snapshot: &IndexSnapshot) -> usize {
        let reader = self.cache.reader().clone();
        snapshot.apply(&mut self.records, reader.as_ref())
    }

    pub fn capture_snapshot(&self, roots_fingerprint: String) -> IndexSnapshot {
        IndexSnapshot::capture(&self.records, roots_fingerprint)
    }

    pub fn stats(&self) -> IndexStats {
        let records = self.records.sorted();
        IndexStats {
            files: records.len(),
            built: records.iter().filter(|r| r.is_built()).count(),
            from_snapshot: records.iter().filter(|r| r.from_snapshot).count(),
            diagnostics: records.iter().map(|r| r.diagnostic_count()).sum(),
            pending: self.scheduler.pending_by_step(),
            processed: self.scheduler.processed(),
            leases: self.scheduler.lease_count(),
            evicted: self.evictor.evicted_total(),
            cache: self.cache.stats(),
        }
    }

    // -- Internals ----------------------------------------------------------

    /// Reset `path` and everything that transitively imports it, then queue Arch.
    fn schedule_rebuild(&mut self, path: &Path) {
        self.reset(path);
        for dependent in self.records.rebuild_set(path) {
            self.reset(&dependent);
        }
    }

    fn reset(&mut self, path: &Path) {
        self.scheduler.release(path);
        self.records.get_or_create(path).reset_from(BuildStep::Arch);
        self.scheduler.enqueue(&self.records, path, BuildStep::Arch);
    }

    /// Forget the last seen hash so the next load is not reported stale.
    fn clear_hash(&mut self, path: &Path) {
        if let Some(record) = self.records.get_mut(path) {
            record.hash = None;
        }
    }

    fn absorb_stale(&mut self) {
        for path in self.records.take_stale() {
            tracing::info!("{:?} changed on disk, rebuilding", path);
            self.schedule_rebuild(&path);
        }
    }

    /// Open state of `path` changed: it and its direct imports may change class.
    fn reprioritize_around(&mut self, path: &Path) {
        self.scheduler.reprioritize(&self.records, path);
        let imports = self
            .records
            .get(path)
            .map(|r| r.imports.clone())
            .unwrap_or_default();
        for import in imports {
            self.scheduler.reprioritize(&self.records, &import);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indexer::parser::PythonParser;
    use crate::indexer::source::MemoryReader;
    use crate::models::{code_of, CacheTier};

    fn state(files: &[(&str, &str)]) -> (IndexState, Arc<MemoryReader>) {
        let reader = Arc::new(MemoryReader::with_files(files.iter().map(|(p, t)| (*p, *t))));
        let mut config = SkeinConfig::default().resolved(Path::new("/ws"));
        config.cache.min_cache_size = 2;
        config.cache.max_cache_size = 8;
        config.scheduler.batch_size = 4;
        (
            IndexState::new(&config, reader.clone(), Box::new(PythonParser::new())),
            reader,
        )
    }

    fn paths(paths: &[&str]) -> Vec<PathBuf> {
        paths.iter().map(PathBuf::from).collect()
    }

    fn codes(state: &IndexState, path: &str) -> Vec<String> {
        state
            .records
            .diagnostics(Path::new(path))
            .iter()
            .filter_map(|d| code_of(d).map(str::to_string))
            .collect()
    }

    #[test]
    fn test_scan_and_build_workspace() {
        let (mut state, _) = state(&[
            ("/ws/a.py", "from b import g\n"),
            ("/ws/b.py", "def g():\n    pass\n"),
        ]);
        let cancel = CancellationToken::new();
        assert_eq!(state.scan(&paths(&["/ws/a.py", "/ws/b.py"]), &cancel), ProcessState::Complete);
        assert_eq!(state.run_to_completion(&cancel), ProcessState::Complete);

        let stats = state.stats();
        assert_eq!(stats.files, 2);
        assert_eq!(stats.built, 2);
        assert_eq!(stats.pending, [0, 0, 0]);
        assert_eq!(stats.leases, 0);

        // A second scan finds nothing to do
        state.scan(&paths(&["/ws/a.py", "/ws/b.py"]), &cancel);
        assert!(state.is_idle());
    }

    #[test]
    fn test_cancelled_scan_and_batch_are_interrupted() {
        let (mut state, _) = state(&[("/ws/a.py", "")]);
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert_eq!(state.scan(&paths(&["/ws/a.py"]), &cancel), ProcessState::Interrupted);
        assert_eq!(state.process_batch(&cancel), ProcessState::Interrupted);
    }

    #[test]
    fn test_change_rebuilds_dependents() {
        let (mut state, reader) = state(&[
            ("/ws/a.py", "from b import g\n"),
            ("/ws/b.py", "from c import g\n"),
            ("/ws/c.py", "def g():\n    pass\n"),
        ]);
        let cancel = CancellationToken::new();
        state.scan(&paths(&["/ws/a.py", "/ws/b.py", "/ws/c.py"]), &cancel);
        state.run_to_completion(&cancel);
        assert!(codes(&state, "/ws/a.py").is_empty());

        reader.insert("/ws/c.py", "def h():\n    pass\n");
        state.did_change(Path::new("/ws/c.py"), None);
        for path in ["/ws/a.py", "/ws/b.py", "/ws/c.py"] {
            assert_eq!(state.records.status(Path::new(path), BuildStep::Arch), BuildStatus::Pending);
        }
        state.run_to_completion(&cancel);

        // b now imports a missing name; a still finds `g` bound in b
        assert_eq!(codes(&state, "/ws/b.py"), vec!["SK2001"]);
        assert!(codes(&state, "/ws/a.py").is_empty());
        assert!(state.records.take_stale().is_empty());
    }

    #[test]
    fn test_open_buffer_overrides_disk() {
        let (mut state, _) = state(&[("/ws/a.py", "def f():\n    pass\n")]);
        let a = Path::new("/ws/a.py");
        let cancel = CancellationToken::new();
        state.scan(&paths(&["/ws/a.py"]), &cancel);
        state.run_to_completion(&cancel);

        state.did_open(a, Some("def f():\n    pass\n\ndef f():\n    pass\n".to_string()));
        state.run_to_completion(&cancel);
        assert_eq!(codes(&state, "/ws/a.py"), vec!["SK2002"]);
        assert_eq!(state.cache.tier_of(a), Some(CacheTier::Persistent));

        // Disk events are ignored while the buffer is open
        state.did_change(a, None);
        assert!(state.is_idle());

        state.did_close(a);
        state.run_to_completion(&cancel);
        assert!(codes(&state, "/ws/a.py").is_empty());
        assert_ne!(state.cache.tier_of(a), Some(CacheTier::Persistent));
    }

    #[test]
    fn test_open_file_is_built_first() {
        let (mut state, _) = state(&[
            ("/ws/a.py", ""),
            ("/ws/b.py", ""),
            ("/ws/c.py", ""),
        ]);
        let cancel = CancellationToken::new();
        state.scan(&paths(&["/ws/a.py", "/ws/b.py", "/ws/c.py"]), &cancel);
        state.did_open(Path::new("/ws/c.py"), None);

        state.scheduler.process_batch(&mut state.records, &mut state.cache, 1, &cancel);
        assert_eq!(state.records.status(Path::new("/ws/c.py"), BuildStep::Arch), BuildStatus::Done);
        assert_eq!(state.records.status(Path::new("/ws/a.py"), BuildStep::Arch), BuildStatus::Pending);
    }

    #[test]
    fn test_open_file_imports_jump_the_background_queue() {
        let (mut state, _) = state(&[
            ("/ws/app.py", "import dep\n"),
            ("/ws/bg1.py", ""),
            ("/ws/bg2.py", ""),
            ("/ws/dep.py", ""),
        ]);
        let cancel = CancellationToken::new();
        state.scan(&paths(&["/ws/bg1.py", "/ws/bg2.py", "/ws/dep.py"]), &cancel);
        state.did_open(Path::new("/ws/app.py"), None);

        // app's Arch discovers dep, which then runs ahead of bg1 and bg2
        state.scheduler.process_batch(&mut state.records, &mut state.cache, 2, &cancel);
        assert_eq!(state.records.status(Path::new("/ws/app.py"), BuildStep::Arch), BuildStatus::Done);
        assert_eq!(state.records.status(Path::new("/ws/dep.py"), BuildStep::Arch), BuildStatus::Done);
        assert_eq!(state.records.status(Path::new("/ws/bg1.py"), BuildStep::Arch), BuildStatus::Pending);
    }

    #[test]
    fn test_rescan_retries_failed_reads() {
        let (mut state, reader) = state(&[]);
        let a = Path::new("/ws/a.py");
        let cancel = CancellationToken::new();
        state.scan(&paths(&["/ws/a.py"]), &cancel);
        state.run_to_completion(&cancel);
        assert_eq!(state.records.status(a, BuildStep::Arch), BuildStatus::Failed);
        assert_eq!(codes(&state, "/ws/a.py"), vec!["SK1002"]);

        reader.insert("/ws/a.py", "def f():\n    pass\n");
        state.scan(&paths(&["/ws/a.py"]), &cancel);
        assert!(!state.is_idle());
        state.run_to_completion(&cancel);

        let record = state.records.get(a).unwrap();
        assert!(record.is_built());
        assert!(!record.missing);
        assert!(codes(&state, "/ws/a.py").is_empty());
    }

    #[test]
    fn test_buffer_change_for_closed_file_reads_disk() {
        let (mut state, reader) = state(&[("/ws/a.py", "def f():\n    pass\n")]);
        let a = Path::new("/ws/a.py");
        let cancel = CancellationToken::new();
        state.scan(&paths(&["/ws/a.py"]), &cancel);
        state.run_to_completion(&cancel);

        state.did_change(a, Some("def f():\n    pass\n\ndef f():\n    pass\n".to_string()));
        assert!(state.records.get(a).unwrap().overlay.is_none());
        state.run_to_completion(&cancel);
        assert!(codes(&state, "/ws/a.py").is_empty());

        // Later disk changes are not shadowed by the dropped text
        reader.insert("/ws/a.py", "class C:\n    pass\n\nclass C:\n    pass\n");
        state.did_change(a, None);
        state.run_to_completion(&cancel);
        assert_eq!(codes(&state, "/ws/a.py"), vec!["SK2002"]);
    }

    #[test]
    fn test_leases_bounded_by_cache_size() {
        let files: Vec<(String, String)> = (0..40)
            .map(|i| (format!("/ws/f{}.py", i), format!("import f{}\n", i + 1)))
            .collect();
        let reader = MemoryReader::with_files(files.iter().map(|(p, t)| (p.as_str(), t.as_str())));
        let mut config = SkeinConfig::default().resolved(Path::new("/ws"));
        config.cache.min_cache_size = 2;
        config.cache.max_cache_size = 3;
        config.scheduler.batch_size = 5;
        let mut state = IndexState::new(&config, Arc::new(reader), Box::new(PythonParser::new()));
        let cancel = CancellationToken::new();
        let all: Vec<PathBuf> = files.iter().map(|(p, _)| PathBuf::from(p)).collect();
        state.scan(&all, &cancel);

        let mut peak = 0;
        loop {
            state.after_batch();
            let outcome = state.process_batch(&cancel);
            peak = peak.max(state.scheduler.lease_count());
            if outcome != ProcessState::NeedsMoreWork {
                break;
            }
        }
        assert!(peak <= 3, "peak lease count {}", peak);
        assert_eq!(state.stats().built, 40);
    }

    #[test]
    fn test_delete_reports_broken_imports() {
        let (mut state, reader) = state(&[
            ("/ws/pkg/a.py", "from .b import g\n"),
            ("/ws/pkg/b.py", "def g():\n    pass\n"),
        ]);
        let cancel = CancellationToken::new();
        state.scan(&paths(&["/ws/pkg/a.py", "/ws/pkg/b.py"]), &cancel);
        state.run_to_completion(&cancel);

        reader.remove(Path::new("/ws/pkg/b.py"));
        state.did_delete(Path::new("/ws/pkg/b.py"));
        state.run_to_completion(&cancel);

        assert_eq!(codes(&state, "/ws/pkg/a.py"), vec!["SK2000"]);
        assert!(state.records.get(Path::new("/ws/pkg/b.py")).unwrap().missing);
    }

    #[test]
    fn test_silent_disk_change_is_detected_on_reload() {
        let (mut state, reader) = state(&[("/ws/a.py", "def f():\n    pass\n")]);
        let a = Path::new("/ws/a.py");
        let cancel = CancellationToken::new();
        state.scan(&paths(&["/ws/a.py"]), &cancel);
        state.run_to_completion(&cancel);
        assert_eq!(state.cache.tier_of(a), None);

        // No event: the next load notices the new hash
        reader.insert("/ws/a.py", "class C:\n    pass\n\nclass C:\n    pass\n");
        let payload = state.cache.get(&mut state.records, a).unwrap();
        assert!(payload.outline.top_level("C").is_some());
        drop(payload);
        assert!(!state.is_idle());

        state.run_to_completion(&cancel);
        assert_eq!(codes(&state, "/ws/a.py"), vec!["SK2002"]);
    }

    #[test]
    fn test_memory_pressure_drops_closed_payloads() {
        let (mut state, _) = state(&[("/ws/a.py", ""), ("/ws/b.py", "")]);
        let cancel = CancellationToken::new();
        state.did_open(Path::new("/ws/a.py"), None);
        state.scan(&paths(&["/ws/b.py"]), &cancel);
        state.process_batch(&cancel);

        let report = state.memory_pressure();
        assert_eq!(report.released, 1);
        assert_eq!(state.cache.tier_of(Path::new("/ws/b.py")), None);
        assert_eq!(state.cache.tier_of(Path::new("/ws/a.py")), Some(CacheTier::Persistent));
    }
}
