//! Persisted symbol metadata for external files.
//! Uses rkyv with validation; any version, engine or root mismatch discards
//! the whole file.

use std::path::{Path, PathBuf};

use rkyv::{Archive, Deserialize as RkyvDeserialize, Serialize as RkyvSerialize};
use smol_str::SmolStr;
use thiserror::Error;

use crate::indexer::records::FileRecordStore;
use crate::indexer::source::SourceReader;
use crate::models::{BuildStatus, BuildStep, ImportBinding, ModuleOutline, ModuleRef, SymbolDef, SymbolKind, TextRange};

pub const SNAPSHOT_VERSION: u32 = 1;

#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("Snapshot I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to serialize snapshot: {0}")]
    Serialize(String),
}

#[derive(Debug, Clone, PartialEq, Archive, RkyvSerialize, RkyvDeserialize)]
#[archive(check_bytes)]
pub struct IndexSnapshot {
    pub version: u32,
    pub engine_version: String,
    /// Hash of the configured roots
    pub roots_fingerprint: String,
    pub created_at: u64,
    pub files: Vec<SnapshotFile>,
}

#[derive(Debug, Clone, PartialEq, Archive, RkyvSerialize, RkyvDeserialize)]
#[archive(check_bytes)]
pub struct SnapshotFile {
    pub path: String,
    pub hash: String,
    pub mtime: i64,
    pub imports: Vec<String>,
    /// Outline definitions in preorder
    pub symbols: Vec<SnapshotSymbol>,
    pub bindings: Vec<SnapshotBinding>,
}

#[derive(Debug, Clone, PartialEq, Archive, RkyvSerialize, RkyvDeserialize)]
#[archive(check_bytes)]
pub struct SnapshotSymbol {
    pub name: String,
    pub kind: String,
    /// Nesting depth, 0 for top level
    pub depth: u32,
    pub start: u32,
    pub end: u32,
    pub name_start: u32,
    pub name_end: u32,
}

#[derive(Debug, Clone, PartialEq, Archive, RkyvSerialize, RkyvDeserialize)]
#[archive(check_bytes)]
pub struct SnapshotBinding {
    pub local_name: String,
    pub level: u32,
    pub module: String,
    pub imported: Option<String>,
    pub start: u32,
    pub end: u32,
    pub target: Option<String>,
    pub local_target: Option<String>,
}

/// Fingerprint of the roots a snapshot was taken under.
pub fn roots_fingerprint(workspace_roots: &[PathBuf], external_roots: &[PathBuf]) -> String {
    let mut hasher = blake3::Hasher::new();
    for root in workspace_roots {
        hasher.update(b"w:");
        hasher.update(root.to_string_lossy().as_bytes());
        hasher.update(b"\n");
    }
    for root in external_roots {
        hasher.update(b"e:");
        hasher.update(root.to_string_lossy().as_bytes());
        hasher.update(b"\n");
    }
    hasher.finalize().to_hex().to_string()
}

impl IndexSnapshot {
    /// Every external file whose Arch step finished.
    pub fn capture(records: &FileRecordStore, roots_fingerprint: String) -> Self {
        let files = records
            .sorted()
            .into_iter()
            .filter(|r| !r.is_workspace() && r.status(BuildStep::Arch) == BuildStatus::Done)
            .filter_map(|r| {
                let hash = r.hash.clone()?;
                let outline = r.outline.as_ref()?;
                Some(SnapshotFile {
                    path: r.path.to_string_lossy().into_owned(),
                    hash,
                    mtime: r.mtime,
                    imports: r.imports.iter().map(|p| p.to_string_lossy().into_owned()).collect(),
                    symbols: flatten_symbols(&outline.symbols),
                    bindings: outline.bindings.iter().map(SnapshotBinding::from_binding).collect(),
                })
            })
            .collect();

        Self {
            version: SNAPSHOT_VERSION,
            engine_version: env!("CARGO_PKG_VERSION").to_string(),
            roots_fingerprint,
            created_at: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or_default(),
            files,
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), SnapshotError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let bytes = rkyv::to_bytes::<_, 4096>(self)
            .map_err(|e| SnapshotError::Serialize(e.to_string()))?;

        // Write next to the target, then swap in
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, &bytes)?;
        std::fs::rename(&tmp, path)?;

        tracing::info!("Snapshot saved to {:?} ({} files)", path, self.files.len());
        Ok(())
    }

    /// Load a snapshot taken under the same roots. Missing, corrupt or
    /// mismatched snapshots yield `None`; the latter two are deleted.
    pub fn load(path: &Path, roots_fingerprint: &str) -> Result<Option<Self>, SnapshotError> {
        let bytes = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let mut aligned = rkyv::AlignedVec::with_capacity(bytes.len());
        aligned.extend_from_slice(&bytes);

        let archived = match rkyv::check_archived_root::<IndexSnapshot>(&aligned) {
            Ok(archived) => archived,
            Err(e) => {
                tracing::warn!("Discarding corrupt snapshot {:?}: {}", path, e);
                discard(path);
                return Ok(None);
            }
        };
        if archived.version != SNAPSHOT_VERSION
            || archived.engine_version.as_str() != env!("CARGO_PKG_VERSION")
            || archived.roots_fingerprint.as_str() != roots_fingerprint
        {
            tracing::info!("Discarding snapshot {:?}: taken by another version or roots", path);
            discard(path);
            return Ok(None);
        }

        let snapshot = Self {
            version: archived.version,
            engine_version: archived.engine_version.to_string(),
            roots_fingerprint: archived.roots_fingerprint.to_string(),
            created_at: archived.created_at,
            files: archived.files.iter().map(SnapshotFile::from_archived).collect(),
        };
        if snapshot.outlines().is_none() {
            tracing::warn!("Discarding snapshot {:?}: malformed outline entry", path);
            discard(path);
            return Ok(None);
        }
        tracing::info!("Snapshot loaded from {:?} ({} files)", path, snapshot.files.len());
        Ok(Some(snapshot))
    }

    /// Every entry's outline, or `None` if any entry is malformed.
    fn outlines(&self) -> Option<Vec<ModuleOutline>> {
        self.files.iter().map(SnapshotFile::outline).collect()
    }

    /// Install outlines for files whose disk content still matches. Returns
    /// how many were restored. A single malformed entry voids the whole
    /// snapshot.
    pub fn apply(&self, records: &mut FileRecordStore, reader: &dyn SourceReader) -> usize {
        let Some(outlines) = self.outlines() else {
            tracing::warn!("Snapshot has a malformed outline entry, ignoring it");
            return 0;
        };
        let mut restored = 0;
        for (file, outline) in self.files.iter().zip(outlines) {
            let path = PathBuf::from(&file.path);
            if records.is_open(&path) {
                continue;
            }
            let current = match reader.read(&path) {
                Ok(current) => current,
                Err(e) => {
                    tracing::debug!("Snapshot entry {:?} unreadable: {}", path, e);
                    continue;
                }
            };
            if current.hash != file.hash {
                continue;
            }
            let imports = file.imports.iter().map(PathBuf::from).collect();
            records.restore(&path, file.hash.clone(), current.mtime, outline, imports);
            restored += 1;
        }
        tracing::info!("Restored {}/{} files from snapshot", restored, self.files.len());
        restored
    }
}

fn discard(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        tracing::warn!("Failed to remove snapshot {:?}: {}", path, e);
    }
}

impl SnapshotFile {
    fn from_archived(archived: &ArchivedSnapshotFile) -> Self {
        Self {
            path: archived.path.to_string(),
            hash: archived.hash.to_string(),
            mtime: archived.mtime,
            imports: archived.imports.iter().map(|s| s.to_string()).collect(),
            symbols: archived
                .symbols
                .iter()
                .map(|s| SnapshotSymbol {
                    name: s.name.to_string(),
                    kind: s.kind.to_string(),
                    depth: s.depth,
                    start: s.start,
                    end: s.end,
                    name_start: s.name_start,
                    name_end: s.name_end,
                })
                .collect(),
            bindings: archived
                .bindings
                .iter()
                .map(|b| SnapshotBinding {
                    local_name: b.local_name.to_string(),
                    level: b.level,
                    module: b.module.to_string(),
                    imported: b.imported.as_ref().map(|s| s.to_string()),
                    start: b.start,
                    end: b.end,
                    target: b.target.as_ref().map(|s| s.to_string()),
                    local_target: b.local_target.as_ref().map(|s| s.to_string()),
                })
                .collect(),
        }
    }

    /// Rebuild the outline, or `None` if the entry does not describe one.
    pub fn outline(&self) -> Option<ModuleOutline> {
        let mut pos = 0;
        let symbols = unflatten_symbols(&self.symbols, &mut pos, 0)?;
        if pos != self.symbols.len() {
            return None;
        }
        Some(ModuleOutline {
            symbols,
            bindings: self.bindings.iter().map(SnapshotBinding::to_binding).collect(),
        })
    }
}

impl SnapshotBinding {
    fn from_binding(binding: &ImportBinding) -> Self {
        let path_string = |p: &PathBuf| p.to_string_lossy().into_owned();
        Self {
            local_name: binding.local_name.to_string(),
            level: binding.module.level,
            module: binding.module.dotted.to_string(),
            imported: binding.imported.as_ref().map(|s| s.to_string()),
            start: binding.range.start,
            end: binding.range.end,
            target: binding.target.as_ref().map(path_string),
            local_target: binding.local_target.as_ref().map(path_string),
        }
    }

    fn to_binding(&self) -> ImportBinding {
        ImportBinding {
            local_name: SmolStr::new(&self.local_name),
            module: ModuleRef {
                level: self.level,
                dotted: SmolStr::new(&self.module),
            },
            imported: self.imported.as_deref().map(SmolStr::new),
            range: TextRange {
                start: self.start,
                end: self.end,
            },
            target: self.target.as_ref().map(PathBuf::from),
            local_target: self.local_target.as_ref().map(PathBuf::from),
        }
    }
}

fn flatten_symbols(symbols: &[SymbolDef]) -> Vec<SnapshotSymbol> {
    fn walk(symbols: &[SymbolDef], depth: u32, out: &mut Vec<SnapshotSymbol>) {
        for symbol in symbols {
            out.push(SnapshotSymbol {
                name: symbol.name.to_string(),
                kind: symbol.kind.as_str().to_string(),
                depth,
                start: symbol.range.start,
                end: symbol.range.end,
                name_start: symbol.name_range.start,
                name_end: symbol.name_range.end,
            });
            walk(&symbol.children, depth + 1, out);
        }
    }
    let mut out = Vec::new();
    walk(symbols, 0, &mut out);
    out
}

fn unflatten_symbols(flat: &[SnapshotSymbol], pos: &mut usize, depth: u32) -> Option<Vec<SymbolDef>> {
    let mut out = Vec::new();
    while let Some(symbol) = flat.get(*pos).filter(|s| s.depth == depth) {
        *pos += 1;
        let kind = SymbolKind::parse(&symbol.kind)?;
        let children = unflatten_symbols(flat, pos, depth + 1)?;
        out.push(SymbolDef {
            name: SmolStr::new(&symbol.name),
            kind,
            range: TextRange {
                start: symbol.start,
                end: symbol.end,
            },
            name_range: TextRange {
                start: symbol.name_start,
                end: symbol.name_end,
            },
            children,
        });
    }
    Some(out)
}
