use std::path::{Path, PathBuf};
use std::sync::mpsc::channel;
use std::time::Duration;

use ignore::gitignore::{Gitignore, GitignoreBuilder};
use notify_debouncer_mini::{new_debouncer, notify::RecursiveMode, DebounceEventResult};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::parser::is_indexable;
use super::service::IndexEvent;
use crate::config::CONFIG_DIR;

/// Build gitignore matcher for a directory
fn build_gitignore(root: &Path, extra_ignores: &[String]) -> Gitignore {
    let gitignore_path = root.join(".gitignore");
    let mut builder = GitignoreBuilder::new(root);

    // Always ignored
    let _ = builder.add_line(None, ".git");
    let _ = builder.add_line(None, CONFIG_DIR);
    let _ = builder.add_line(None, "__pycache__");
    let _ = builder.add_line(None, "*.pyc");

    for pattern in extra_ignores {
        let _ = builder.add_line(None, pattern);
    }

    if gitignore_path.exists() {
        let _ = builder.add(&gitignore_path);
    }

    builder.build().unwrap_or_else(|_| Gitignore::empty())
}

/// Watch `roots` on a blocking thread and forward changes of indexable files
/// as `Changed` / `Deleted` events until `cancel` fires or the receiver goes away.
pub fn start_watcher(
    roots: Vec<PathBuf>,
    events: mpsc::Sender<IndexEvent>,
    extra_ignores: Vec<String>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::task::spawn_blocking(move || watch_blocking(roots, events, extra_ignores, cancel))
}

fn watch_blocking(
    roots: Vec<PathBuf>,
    events: mpsc::Sender<IndexEvent>,
    extra_ignores: Vec<String>,
    cancel: CancellationToken,
) {
    let ignores: Vec<(PathBuf, Gitignore)> = roots
        .iter()
        .map(|root| (root.clone(), build_gitignore(root, &extra_ignores)))
        .collect();

    let (tx, rx) = channel::<DebounceEventResult>();
    let mut debouncer = match new_debouncer(Duration::from_millis(500), tx) {
        Ok(d) => d,
        Err(e) => {
            tracing::error!("Failed to create file watcher: {}", e);
            return;
        }
    };
    for root in &roots {
        if let Err(e) = debouncer.watcher().watch(root, RecursiveMode::Recursive) {
            tracing::error!("Failed to watch {:?}: {}", root, e);
            return;
        }
    }
    tracing::info!("File watcher started for {} roots", roots.len());

    loop {
        // Timeout so cancellation is noticed without an event
        match rx.recv_timeout(Duration::from_secs(1)) {
            Ok(Ok(batch)) => {
                for event in batch {
                    let path = event.path;
                    let ignored = ignores.iter().any(|(root, gitignore)| {
                        path.starts_with(root)
                            && gitignore
                                .matched_path_or_any_parents(&path, path.is_dir())
                                .is_ignore()
                    });
                    if ignored || !is_indexable(&path) {
                        continue;
                    }

                    let event = if path.exists() {
                        IndexEvent::Changed { path, text: None }
                    } else {
                        IndexEvent::Deleted(path)
                    };
                    tracing::debug!("File event: {:?}", event);

                    if events.blocking_send(event).is_err() {
                        tracing::info!("Index event channel closed, watcher exiting");
                        return;
                    }
                }
            }
            Ok(Err(e)) => {
                tracing::warn!("Watcher error: {:?}", e);
            }
            Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {}
            Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                tracing::info!("Watcher channel closed");
                break;
            }
        }

        if cancel.is_cancelled() {
            tracing::info!("File watcher stopped");
            break;
        }
    }
}

/// All indexable files under `root`, honoring .gitignore and `extra_ignores`.
pub fn scan_directory(root: &Path, extra_ignores: &[String]) -> Vec<PathBuf> {
    use ignore::WalkBuilder;

    let mut builder = WalkBuilder::new(root);
    builder
        .hidden(true)
        .git_ignore(true)
        .git_global(true)
        .git_exclude(true)
        .require_git(false);

    let mut overrides = ignore::overrides::OverrideBuilder::new(root);
    for pattern in extra_ignores {
        // `!pattern` in an override excludes matches
        let _ = overrides.add(&format!("!{}", pattern));
    }
    if let Ok(ov) = overrides.build() {
        builder.overrides(ov);
    }

    let mut files: Vec<PathBuf> = builder
        .build()
        .flatten()
        .map(|entry| entry.into_path())
        .filter(|path| path.is_file() && is_indexable(path))
        .collect();
    files.sort();
    files
}
