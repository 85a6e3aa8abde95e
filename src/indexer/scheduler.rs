//! Priority work queues for the three build steps.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use indexmap::{IndexMap, IndexSet};
use tokio_util::sync::CancellationToken;

use super::analysis::{self, BuildContext};
use super::records::FileRecordStore;
use crate::cache::AstCache;
use crate::models::{AstPayload, BuildStep, ProcessState};

/// Queue class of a pending task. Lower variants run first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    Open,
    /// Imported directly by an open file
    OpenDependency,
    Background,
}

impl Priority {
    pub fn of(records: &FileRecordStore, path: &Path) -> Self {
        if records.is_open(path) {
            Self::Open
        } else if records.has_open_dependent(path) {
            Self::OpenDependency
        } else {
            Self::Background
        }
    }
}

/// Pending files of one step, split by priority, each in insertion order.
#[derive(Debug, Default)]
struct StepQueue {
    classes: [IndexSet<PathBuf>; 3],
}

impl StepQueue {
    fn contains(&self, path: &Path) -> bool {
        self.classes.iter().any(|class| class.contains(path))
    }

    /// Queue `path` in `priority`'s class. A path already pending in a lower
    /// class moves up; only a fresh insert returns true.
    fn insert(&mut self, path: PathBuf, priority: Priority) -> bool {
        let target = priority as usize;
        match self.classes.iter().position(|class| class.contains(&path)) {
            None => self.classes[target].insert(path),
            Some(current) if current > target => {
                self.classes[current].shift_remove(&path);
                tracing::trace!("Promoted {:?} to {:?}", path, priority);
                self.classes[target].insert(path);
                false
            }
            Some(_) => false,
        }
    }

    fn remove(&mut self, path: &Path) -> bool {
        self.classes
            .iter_mut()
            .any(|class| class.shift_remove(path))
    }

    fn pop(&mut self) -> Option<PathBuf> {
        self.classes
            .iter_mut()
            .find_map(|class| class.shift_remove_index(0))
    }

    fn len(&self) -> usize {
        self.classes.iter().map(IndexSet::len).sum()
    }
}

/// Leases held at once when no limit is configured
pub const DEFAULT_LEASE_LIMIT: usize = 500;

pub struct BuildScheduler {
    queues: [StepQueue; 3],
    /// Strong references held for the files touched by the current run
    leases: IndexMap<PathBuf, Arc<AstPayload>>,
    /// Files seen since the last `take_drained`
    touched: IndexSet<PathBuf>,
    /// Oldest leases are dropped past this many
    lease_limit: usize,
    max_eval_depth: usize,
    processed: u64,
}

#[allow(dead_code)]
impl BuildScheduler {
    pub fn new(max_eval_depth: usize) -> Self {
        Self {
            queues: Default::default(),
            leases: IndexMap::new(),
            touched: IndexSet::new(),
            lease_limit: DEFAULT_LEASE_LIMIT,
            max_eval_depth,
            processed: 0,
        }
    }

    pub fn with_lease_limit(mut self, limit: usize) -> Self {
        self.lease_limit = limit.max(1);
        self
    }

    /// Queue `step` for `path` unless it is already pending. Returns true when queued.
    pub fn enqueue(&mut self, records: &FileRecordStore, path: &Path, step: BuildStep) -> bool {
        let priority = Priority::of(records, path);
        let queued = self.queues[step.index()].insert(path.to_path_buf(), priority);
        if queued {
            tracing::trace!("Queued {} for {:?} ({:?})", step.as_str(), path, priority);
        }
        queued
    }

    /// Move `path` to the queue class its open state now calls for, in every step.
    pub fn reprioritize(&mut self, records: &FileRecordStore, path: &Path) {
        let priority = Priority::of(records, path);
        for queue in &mut self.queues {
            if queue.remove(path) {
                queue.insert(path.to_path_buf(), priority);
            }
        }
    }

    /// Drop every pending task of `path`.
    pub fn cancel_file(&mut self, path: &Path) {
        for queue in &mut self.queues {
            queue.remove(path);
        }
    }

    /// Run at most `max_items` tasks. Earlier steps always go first; within a
    /// step, open files, then their direct imports, then the rest.
    pub fn process_batch(
        &mut self,
        records: &mut FileRecordStore,
        cache: &mut AstCache,
        max_items: usize,
        cancel: &CancellationToken,
    ) -> ProcessState {
        let mut done = 0;
        while done < max_items {
            if cancel.is_cancelled() {
                tracing::info!("Build interrupted after {} tasks", done);
                return ProcessState::Interrupted;
            }
            let Some((path, step)) = self.pop() else {
                break;
            };
            self.run_task(records, cache, &path, step);
            self.processed += 1;
            done += 1;
        }

        let remaining = self.pending_len();
        if done > 0 {
            tracing::debug!("Batch processed {} tasks, {} pending", done, remaining);
        }
        if remaining > 0 {
            ProcessState::NeedsMoreWork
        } else {
            ProcessState::Complete
        }
    }

    fn pop(&mut self) -> Option<(PathBuf, BuildStep)> {
        BuildStep::ALL
            .into_iter()
            .find_map(|step| self.queues[step.index()].pop().map(|path| (path, step)))
    }

    fn run_task(&mut self, records: &mut FileRecordStore, cache: &mut AstCache, path: &Path, step: BuildStep) {
        // Already produced inline by a dependent's evaluation
        if records.status(path, step).is_terminal() {
            tracing::trace!("Skipping {} for {:?}: already built", step.as_str(), path);
            return;
        }
        let mut ctx = BuildContext::new(
            records,
            cache,
            &mut self.leases,
            &mut self.touched,
            self.lease_limit,
            self.max_eval_depth,
        );
        analysis::run_step(&mut ctx, path, step);
        for (next, next_step) in ctx.into_followups() {
            self.enqueue(records, &next, next_step);
        }

        // Imports of an open file are only known once its Arch ran
        if step == BuildStep::Arch && records.is_open(path) {
            let imports = records.get(path).map(|r| r.imports.clone()).unwrap_or_default();
            for import in &imports {
                self.reprioritize(records, import);
            }
        }
    }

    pub fn is_pending(&self, path: &Path, step: BuildStep) -> bool {
        self.queues[step.index()].contains(path)
    }

    pub fn has_pending(&self, path: &Path) -> bool {
        self.queues.iter().any(|queue| queue.contains(path))
    }

    pub fn pending_len(&self) -> usize {
        self.queues.iter().map(StepQueue::len).sum()
    }

    pub fn pending_by_step(&self) -> [usize; 3] {
        [self.queues[0].len(), self.queues[1].len(), self.queues[2].len()]
    }

    pub fn processed(&self) -> u64 {
        self.processed
    }

    /// Touched files with no task left in any step. They leave the touched set.
    pub fn take_drained(&mut self) -> Vec<PathBuf> {
        let drained: Vec<PathBuf> = self
            .touched
            .iter()
            .filter(|path| !self.has_pending(path))
            .cloned()
            .collect();
        for path in &drained {
            self.touched.shift_remove(path);
        }
        drained
    }

    /// Drop the lease on `path`. Returns true when one was held.
    pub fn release(&mut self, path: &Path) -> bool {
        self.leases.shift_remove(path).is_some()
    }

    /// Drop every lease on a closed file.
    pub fn release_closed(&mut self, records: &FileRecordStore) -> usize {
        let before = self.leases.len();
        self.leases.retain(|path, _| records.is_open(path));
        before - self.leases.len()
    }

    pub fn lease_count(&self) -> usize {
        self.leases.len()
    }

    pub fn is_leased(&self, path: &Path) -> bool {
        self.leases.contains_key(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indexer::parser::{ModuleResolver, PythonParser};
    use crate::indexer::source::MemoryReader;
    use crate::models::{code_of, BuildStatus};

    fn setup(files: &[(&str, &str)]) -> (FileRecordStore, AstCache) {
        let reader = MemoryReader::with_files(files.iter().map(|(p, t)| (*p, *t)));
        let roots = vec![PathBuf::from("/ws")];
        (
            FileRecordStore::new(roots.clone()),
            AstCache::new(
                Arc::new(reader),
                Box::new(PythonParser::new()),
                ModuleResolver::new(roots, Vec::new()),
                2,
                8,
            ),
        )
    }

    fn drain(scheduler: &mut BuildScheduler, records: &mut FileRecordStore, cache: &mut AstCache) {
        let cancel = CancellationToken::new();
        while scheduler.process_batch(records, cache, 10, &cancel) == ProcessState::NeedsMoreWork {}
    }

    #[test]
    fn test_enqueue_dedups_pending_tasks() {
        let (records, _cache) = setup(&[]);
        let mut scheduler = BuildScheduler::new(64);
        let a = Path::new("/ws/a.py");
        assert!(scheduler.enqueue(&records, a, BuildStep::Arch));
        assert!(!scheduler.enqueue(&records, a, BuildStep::Arch));
        assert!(scheduler.enqueue(&records, a, BuildStep::Validation));
        assert_eq!(scheduler.pending_len(), 2);
        assert!(scheduler.is_pending(a, BuildStep::Arch));
    }

    #[test]
    fn test_pop_order_prefers_step_then_priority() {
        let (mut records, mut cache) = setup(&[]);
        let mut scheduler = BuildScheduler::new(64);
        let (bg, open, dep) = (Path::new("/ws/bg.py"), Path::new("/ws/open.py"), Path::new("/ws/dep.py"));
        records.mark_open(&mut cache, open, None);
        records.set_imports(open, vec![dep.to_path_buf()]);

        scheduler.enqueue(&records, bg, BuildStep::ArchEval);
        scheduler.enqueue(&records, bg, BuildStep::Arch);
        scheduler.enqueue(&records, dep, BuildStep::Arch);
        scheduler.enqueue(&records, open, BuildStep::Arch);

        let order: Vec<(PathBuf, BuildStep)> = std::iter::from_fn(|| scheduler.pop()).collect();
        assert_eq!(
            order,
            vec![
                (open.to_path_buf(), BuildStep::Arch),
                (dep.to_path_buf(), BuildStep::Arch),
                (bg.to_path_buf(), BuildStep::Arch),
                (bg.to_path_buf(), BuildStep::ArchEval),
            ]
        );
    }

    #[test]
    fn test_enqueue_promotes_pending_file() {
        let (mut records, mut cache) = setup(&[]);
        let mut scheduler = BuildScheduler::new(64);
        let (other, dep, open) = (Path::new("/ws/other.py"), Path::new("/ws/dep.py"), Path::new("/ws/open.py"));
        scheduler.enqueue(&records, other, BuildStep::Arch);
        scheduler.enqueue(&records, dep, BuildStep::Arch);

        records.mark_open(&mut cache, open, None);
        records.set_imports(open, vec![dep.to_path_buf()]);
        // Already pending: not queued twice, but moved ahead of `other`
        assert!(!scheduler.enqueue(&records, dep, BuildStep::Arch));
        assert_eq!(scheduler.pending_len(), 2);
        assert_eq!(scheduler.pop(), Some((dep.to_path_buf(), BuildStep::Arch)));
        assert_eq!(scheduler.pop(), Some((other.to_path_buf(), BuildStep::Arch)));
    }

    #[test]
    fn test_enqueue_never_demotes() {
        let (mut records, mut cache) = setup(&[]);
        let mut scheduler = BuildScheduler::new(64);
        let (a, b) = (Path::new("/ws/a.py"), Path::new("/ws/b.py"));
        scheduler.enqueue(&records, a, BuildStep::Arch);
        records.mark_open(&mut cache, b, None);
        scheduler.enqueue(&records, b, BuildStep::Arch);

        records.mark_closed(&mut cache, b);
        assert!(!scheduler.enqueue(&records, b, BuildStep::Arch));
        assert_eq!(scheduler.pop(), Some((b.to_path_buf(), BuildStep::Arch)));
    }

    #[test]
    fn test_leases_stay_within_limit() {
        let files: Vec<(String, String)> = (0..12)
            .map(|i| (format!("/ws/m{}.py", i), format!("import m{}\n", i + 1)))
            .collect();
        let (mut records, mut cache) = setup(
            &files
                .iter()
                .map(|(p, t)| (p.as_str(), t.as_str()))
                .collect::<Vec<_>>(),
        );
        let mut scheduler = BuildScheduler::new(64).with_lease_limit(3);
        scheduler.enqueue(&records, Path::new("/ws/m0.py"), BuildStep::Arch);

        let cancel = CancellationToken::new();
        let mut peak = 0;
        while scheduler.process_batch(&mut records, &mut cache, 1, &cancel) == ProcessState::NeedsMoreWork {
            peak = peak.max(scheduler.lease_count());
        }
        peak = peak.max(scheduler.lease_count());

        assert!(peak <= 3, "peak lease count {}", peak);
        for (path, _) in &files {
            assert!(records.get(Path::new(path)).unwrap().is_built(), "{} not built", path);
        }
    }

    #[test]
    fn test_reprioritize_moves_pending_file() {
        let (mut records, mut cache) = setup(&[]);
        let mut scheduler = BuildScheduler::new(64);
        let (a, b) = (Path::new("/ws/a.py"), Path::new("/ws/b.py"));
        scheduler.enqueue(&records, a, BuildStep::Arch);
        scheduler.enqueue(&records, b, BuildStep::Arch);

        records.mark_open(&mut cache, b, None);
        scheduler.reprioritize(&records, b);
        assert_eq!(scheduler.pop(), Some((b.to_path_buf(), BuildStep::Arch)));
    }

    #[test]
    fn test_process_batch_respects_budget() {
        let (mut records, mut cache) = setup(&[
            ("/ws/a.py", "x = 1\n"),
            ("/ws/b.py", "y = 2\n"),
            ("/ws/c.py", "z = 3\n"),
        ]);
        let mut scheduler = BuildScheduler::new(64);
        for path in ["/ws/a.py", "/ws/b.py", "/ws/c.py"] {
            scheduler.enqueue(&records, Path::new(path), BuildStep::Arch);
        }
        let cancel = CancellationToken::new();

        let state = scheduler.process_batch(&mut records, &mut cache, 2, &cancel);
        assert_eq!(state, ProcessState::NeedsMoreWork);
        assert_eq!(scheduler.processed(), 2);
        assert_eq!(records.status(Path::new("/ws/c.py"), BuildStep::Arch), BuildStatus::Pending);

        assert_eq!(scheduler.process_batch(&mut records, &mut cache, 0, &cancel), ProcessState::NeedsMoreWork);
        assert_eq!(scheduler.processed(), 2);

        drain(&mut scheduler, &mut records, &mut cache);
        assert_eq!(scheduler.pending_len(), 0);
        assert_eq!(
            scheduler.process_batch(&mut records, &mut cache, 10, &cancel),
            ProcessState::Complete
        );
        for path in ["/ws/a.py", "/ws/b.py", "/ws/c.py"] {
            assert!(records.get(Path::new(path)).unwrap().is_built());
        }
    }

    #[test]
    fn test_chain_builds_dependencies_before_validation() {
        let (mut records, mut cache) = setup(&[
            ("/ws/a.py", "from b import g\n\ndef f():\n    return g()\n"),
            ("/ws/b.py", "from c import h as g\n"),
            ("/ws/c.py", "def h():\n    pass\n"),
        ]);
        let mut scheduler = BuildScheduler::new(64);
        let a = Path::new("/ws/a.py");
        scheduler.enqueue(&records, a, BuildStep::Arch);
        drain(&mut scheduler, &mut records, &mut cache);

        for path in ["/ws/a.py", "/ws/b.py", "/ws/c.py"] {
            let record = records.get(Path::new(path)).unwrap();
            assert!(record.is_built(), "{} not built", path);
            assert!(records.diagnostics(Path::new(path)).is_empty());
        }
        let exports = records.get(a).unwrap().exports.clone().unwrap();
        assert_eq!(
            exports.get("g").and_then(|r| r.location()).map(|(p, _)| p.to_path_buf()),
            Some(PathBuf::from("/ws/c.py"))
        );
    }

    #[test]
    fn test_mutual_imports_report_one_cycle() {
        let (mut records, mut cache) = setup(&[
            ("/ws/a.py", "from b import g\n\ndef f():\n    return g()\n"),
            ("/ws/b.py", "from a import f\n\ndef g():\n    return f()\n"),
        ]);
        let mut scheduler = BuildScheduler::new(64);
        scheduler.enqueue(&records, Path::new("/ws/a.py"), BuildStep::Arch);
        scheduler.enqueue(&records, Path::new("/ws/b.py"), BuildStep::Arch);
        drain(&mut scheduler, &mut records, &mut cache);

        let cycles: usize = ["/ws/a.py", "/ws/b.py"]
            .iter()
            .flat_map(|p| records.diagnostics(Path::new(p)))
            .filter(|d| code_of(d) == Some("SK1100"))
            .count();
        assert_eq!(cycles, 1);
        assert!(records.get(Path::new("/ws/a.py")).unwrap().is_built());
        assert!(records.get(Path::new("/ws/b.py")).unwrap().is_built());
    }

    #[test]
    fn test_cancelled_batch_is_interrupted() {
        let (mut records, mut cache) = setup(&[("/ws/a.py", "x = 1\n")]);
        let mut scheduler = BuildScheduler::new(64);
        scheduler.enqueue(&records, Path::new("/ws/a.py"), BuildStep::Arch);
        let cancel = CancellationToken::new();
        cancel.cancel();

        assert_eq!(
            scheduler.process_batch(&mut records, &mut cache, 10, &cancel),
            ProcessState::Interrupted
        );
        assert_eq!(scheduler.pending_len(), 1);
    }

    #[test]
    fn test_drained_files_and_leases() {
        let (mut records, mut cache) = setup(&[("/ws/a.py", "import b\n"), ("/ws/b.py", "")]);
        let mut scheduler = BuildScheduler::new(64);
        let (a, b) = (Path::new("/ws/a.py"), Path::new("/ws/b.py"));
        scheduler.enqueue(&records, a, BuildStep::Arch);

        let cancel = CancellationToken::new();
        scheduler.process_batch(&mut records, &mut cache, 1, &cancel);
        // a still has ArchEval and Validation queued
        assert!(scheduler.take_drained().is_empty());
        assert!(scheduler.is_leased(a));

        drain(&mut scheduler, &mut records, &mut cache);
        let mut drained = scheduler.take_drained();
        drained.sort();
        assert_eq!(drained, vec![a.to_path_buf(), b.to_path_buf()]);
        assert!(scheduler.take_drained().is_empty());

        records.mark_open(&mut cache, a, None);
        assert_eq!(scheduler.release_closed(&records), 1);
        assert!(scheduler.is_leased(a));
        assert!(scheduler.release(a));
        assert_eq!(scheduler.lease_count(), 0);
    }
}
