use std::path::{Path, PathBuf};
use std::sync::Arc;

use lsp_types::Diagnostic;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use super::query::{DefinitionTarget, ReferenceLocation, SymbolInfo, SymbolMatch};
use super::state::{IndexState, IndexStats};
use crate::error::Result;
use crate::models::ProcessState;

/// Input to the indexer loop
#[derive(Debug, Clone, PartialEq)]
pub enum IndexEvent {
    Opened { path: PathBuf, text: Option<String> },
    /// `text: None` means the file changed on disk
    Changed { path: PathBuf, text: Option<String> },
    Closed(PathBuf),
    Deleted(PathBuf),
    Rescan(Vec<PathBuf>),
    MemoryPressure,
}

/// Owns the index state and drives the build loop. Queries share the same
/// lock and interleave with batches.
#[derive(Clone)]
pub struct IndexerService {
    state: Arc<Mutex<IndexState>>,
    cancel: CancellationToken,
}

impl IndexerService {
    pub fn new(state: IndexState, cancel: CancellationToken) -> Self {
        Self {
            state: Arc::new(Mutex::new(state)),
            cancel,
        }
    }

    pub fn state(&self) -> Arc<Mutex<IndexState>> {
        self.state.clone()
    }

    /// Apply events and run batches until the channel closes with nothing
    /// left to build (`Complete`) or the token is cancelled (`Interrupted`).
    pub async fn run(&self, mut rx: mpsc::Receiver<IndexEvent>) -> ProcessState {
        tracing::info!("Indexer service started");
        let mut events = Vec::new();

        loop {
            while let Ok(event) = rx.try_recv() {
                events.push(event);
            }

            let outcome = {
                let mut state = self.state.lock().await;
                for event in events.drain(..) {
                    apply(&mut state, event, &self.cancel);
                }
                // Eviction for the previous batch happens in this fresh critical section
                state.after_batch();
                state.process_batch(&self.cancel)
            };

            match outcome {
                ProcessState::NeedsMoreWork => tokio::task::yield_now().await,
                ProcessState::Interrupted => {
                    tracing::info!("Indexer service interrupted");
                    return ProcessState::Interrupted;
                }
                ProcessState::Complete => {
                    tokio::task::yield_now().await;
                    let report = self.state.lock().await.after_batch();
                    if report.evicted > 0 {
                        tracing::debug!("Idle eviction: {:?}", report);
                    }

                    tokio::select! {
                        _ = self.cancel.cancelled() => {
                            tracing::info!("Indexer service cancelled while idle");
                            return ProcessState::Interrupted;
                        }
                        event = rx.recv() => match event {
                            Some(event) => events.push(event),
                            None => {
                                tracing::info!("Indexer service stopped");
                                return ProcessState::Complete;
                            }
                        }
                    }
                }
            }
        }
    }

    pub async fn document_symbols(&self, path: &Path) -> Result<Vec<SymbolInfo>> {
        self.state.lock().await.document_symbols(path)
    }

    pub async fn definition(&self, path: &Path, name: &str) -> Result<Option<DefinitionTarget>> {
        self.state.lock().await.definition(path, name)
    }

    pub async fn references(
        &self,
        path: &Path,
        name: &str,
        include_declaration: bool,
    ) -> Result<Vec<ReferenceLocation>> {
        self.state
            .lock()
            .await
            .references(path, name, include_declaration)
    }

    pub async fn workspace_symbols(&self, query: &str, limit: usize) -> Result<Vec<SymbolMatch>> {
        self.state
            .lock()
            .await
            .workspace_symbols(query, limit, &self.cancel)
    }

    pub async fn diagnostics(&self, path: &Path) -> Vec<Diagnostic> {
        self.state.lock().await.diagnostics(path)
    }

    /// Every file with at least one diagnostic, sorted by path.
    pub async fn all_diagnostics(&self) -> Vec<(PathBuf, Vec<Diagnostic>)> {
        let state = self.state.lock().await;
        state
            .records
            .sorted()
            .into_iter()
            .map(|record| (record.path.clone(), state.diagnostics(&record.path)))
            .filter(|(_, diagnostics)| !diagnostics.is_empty())
            .collect()
    }

    pub async fn stats(&self) -> IndexStats {
        self.state.lock().await.stats()
    }
}

fn apply(state: &mut IndexState, event: IndexEvent, cancel: &CancellationToken) {
    tracing::debug!("Index event: {:?}", event);
    match event {
        IndexEvent::Opened { path, text } => state.did_open(&path, text),
        IndexEvent::Changed { path, text } => state.did_change(&path, text),
        IndexEvent::Closed(path) => state.did_close(&path),
        IndexEvent::Deleted(path) => state.did_delete(&path),
        IndexEvent::Rescan(paths) => {
            state.scan(&paths, cancel);
        }
        IndexEvent::MemoryPressure => {
            state.memory_pressure();
        }
    }
}
