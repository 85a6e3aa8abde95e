//! Payload reclamation at batch boundaries and under memory pressure.

use super::records::FileRecordStore;
use super::scheduler::BuildScheduler;
use crate::cache::AstCache;

/// Outcome of one reclamation pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EvictionReport {
    pub released: usize,
    pub evicted: usize,
    pub reclaimed: usize,
}

#[derive(Debug, Default)]
pub struct EvictionCoordinator {
    passes: u64,
    evicted_total: u64,
}

impl EvictionCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs once the scheduler has given up exclusive access and reacquired
    /// it. Files whose tasks all drained lose their lease; closed ones also
    /// lose the cache's reference.
    pub fn after_batch(
        &mut self,
        scheduler: &mut BuildScheduler,
        records: &FileRecordStore,
        cache: &mut AstCache,
    ) -> EvictionReport {
        let mut report = EvictionReport::default();
        for path in scheduler.take_drained() {
            if scheduler.release(&path) {
                report.released += 1;
            }
            if !records.is_open(&path) && cache.evict(&path) {
                report.evicted += 1;
            }
        }
        report.reclaimed = cache.sweep();
        self.record(report)
    }

    /// Host memory-pressure signal: drop every closed-file lease and trim the
    /// transient tier down to its floor.
    pub fn on_memory_pressure(
        &mut self,
        scheduler: &mut BuildScheduler,
        records: &FileRecordStore,
        cache: &mut AstCache,
    ) -> EvictionReport {
        let report = EvictionReport {
            released: scheduler.release_closed(records),
            evicted: 0,
            reclaimed: cache.reclaim_transient(),
        };
        tracing::info!(
            "Memory pressure: released {} leases, reclaimed {} transient entries",
            report.released,
            report.reclaimed
        );
        self.record(report)
    }

    pub fn evicted_total(&self) -> u64 {
        self.evicted_total
    }

    pub fn passes(&self) -> u64 {
        self.passes
    }

    fn record(&mut self, report: EvictionReport) -> EvictionReport {
        self.passes += 1;
        self.evicted_total += report.evicted as u64;
        if report.evicted > 0 || report.reclaimed > 0 {
            tracing::debug!(
                "Eviction pass: {} released, {} evicted, {} reclaimed",
                report.released,
                report.evicted,
                report.reclaimed
            );
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::{Path, PathBuf};
    use std::sync::Arc;

    use tokio_util::sync::CancellationToken;

    use crate::indexer::parser::{ModuleResolver, PythonParser};
    use crate::indexer::source::MemoryReader;
    use crate::models::{BuildStep, CacheTier, ProcessState};

    struct Fixture {
        records: FileRecordStore,
        cache: AstCache,
        scheduler: BuildScheduler,
        evictor: EvictionCoordinator,
        reader: Arc<MemoryReader>,
    }

    impl Fixture {
        fn new(files: &[(&str, &str)]) -> Self {
            let reader = Arc::new(MemoryReader::with_files(files.iter().map(|(p, t)| (*p, *t))));
            let roots = vec![PathBuf::from("/ws")];
            Self {
                records: FileRecordStore::new(roots.clone()),
                cache: AstCache::new(
                    reader.clone(),
                    Box::new(PythonParser::new()),
                    ModuleResolver::new(roots, Vec::new()),
                    2,
                    8,
                ),
                scheduler: BuildScheduler::new(64),
                evictor: EvictionCoordinator::new(),
                reader,
            }
        }

        fn run(&mut self, max_items: usize) -> ProcessState {
            self.scheduler.process_batch(
                &mut self.records,
                &mut self.cache,
                max_items,
                &CancellationToken::new(),
            )
        }

        fn after_batch(&mut self) -> EvictionReport {
            self.evictor
                .after_batch(&mut self.scheduler, &self.records, &mut self.cache)
        }
    }

    #[test]
    fn test_drained_closed_files_are_evicted() {
        let mut fx = Fixture::new(&[
            ("/ws/a.py", "from b import g\n"),
            ("/ws/b.py", "from c import h as g\n"),
            ("/ws/c.py", "def h():\n    pass\n"),
        ]);
        fx.scheduler.enqueue(&fx.records, Path::new("/ws/a.py"), BuildStep::Arch);
        assert_eq!(fx.run(100), ProcessState::Complete);
        for path in ["/ws/a.py", "/ws/b.py", "/ws/c.py"] {
            assert_eq!(fx.cache.tier_of(Path::new(path)), Some(CacheTier::Transient));
        }

        let report = fx.after_batch();
        assert_eq!(report.released, 3);
        assert_eq!(report.evicted, 3);
        assert_eq!(fx.scheduler.lease_count(), 0);
        assert_eq!(fx.cache.tier_of(Path::new("/ws/c.py")), None);
        // Metadata outlives the payload
        assert!(fx.records.get(Path::new("/ws/c.py")).unwrap().is_built());
        assert_eq!(fx.evictor.evicted_total(), 3);
    }

    #[test]
    fn test_open_files_keep_their_payload() {
        let mut fx = Fixture::new(&[("/ws/a.py", "import b\n"), ("/ws/b.py", "x = 1\n")]);
        let a = Path::new("/ws/a.py");
        fx.records.mark_open(&mut fx.cache, a, None);
        fx.scheduler.enqueue(&fx.records, a, BuildStep::Arch);
        fx.run(100);

        let report = fx.after_batch();
        assert_eq!(report.evicted, 1);
        assert_eq!(fx.cache.tier_of(a), Some(CacheTier::Persistent));
        assert_eq!(fx.cache.tier_of(Path::new("/ws/b.py")), None);
    }

    #[test]
    fn test_pending_files_are_not_evicted() {
        let mut fx = Fixture::new(&[("/ws/a.py", "x = 1\n")]);
        let a = Path::new("/ws/a.py");
        fx.scheduler.enqueue(&fx.records, a, BuildStep::Arch);
        assert_eq!(fx.run(1), ProcessState::NeedsMoreWork);

        let report = fx.after_batch();
        assert_eq!(report, EvictionReport::default());
        assert_eq!(fx.cache.tier_of(a), Some(CacheTier::Transient));
        assert!(fx.scheduler.is_leased(a));
    }

    #[test]
    fn test_reload_after_eviction_is_identical() {
        let mut fx = Fixture::new(&[
            ("/ws/a.py", "from b import g\n"),
            ("/ws/b.py", "from c import h as g\n"),
            ("/ws/c.py", "def h():\n    pass\n\nclass Widget:\n    def draw(self:\n        pass\n"),
        ]);
        let c = Path::new("/ws/c.py");
        fx.scheduler.enqueue(&fx.records, Path::new("/ws/a.py"), BuildStep::Arch);
        fx.run(100);
        let before = fx.cache.lookup(c).unwrap();
        let diagnostics_before = fx.records.diagnostics(c);
        assert!(!before.diagnostics.is_empty());
        let reads = fx.reader.read_count();

        // An outside holder keeps the old payload alive; the cache forgets it anyway
        fx.after_batch();
        assert_eq!(fx.cache.tier_of(c), None);

        let after = fx.cache.get(&mut fx.records, c).unwrap();
        assert_eq!(fx.reader.read_count(), reads + 1);
        assert!(!Arc::ptr_eq(&before, &after));
        assert!(*after == *before);
        assert_eq!(fx.records.diagnostics(c), diagnostics_before);
        assert!(fx.records.take_stale().is_empty());
    }

    #[test]
    fn test_memory_pressure_releases_closed_leases() {
        let mut fx = Fixture::new(&[
            ("/ws/a.py", "x = 1\n"),
            ("/ws/b.py", "y = 1\n"),
            ("/ws/c.py", "z = 1\n"),
        ]);
        let a = Path::new("/ws/a.py");
        fx.records.mark_open(&mut fx.cache, a, None);
        for path in ["/ws/a.py", "/ws/b.py", "/ws/c.py"] {
            fx.scheduler.enqueue(&fx.records, Path::new(path), BuildStep::Arch);
        }
        fx.run(3);
        assert_eq!(fx.scheduler.lease_count(), 3);

        let report = fx
            .evictor
            .on_memory_pressure(&mut fx.scheduler, &fx.records, &mut fx.cache);
        assert_eq!(report.released, 2);
        assert!(fx.scheduler.is_leased(a));
        assert_eq!(fx.cache.tier_of(a), Some(CacheTier::Persistent));
        assert_eq!(fx.cache.stats().live_transient, 0);
    }
}
