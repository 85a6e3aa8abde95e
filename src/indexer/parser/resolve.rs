//! Import resolution against workspace and external roots.

use std::path::{Path, PathBuf};

use indexmap::IndexSet;
use smol_str::SmolStr;

use crate::indexer::source::SourceReader;
use crate::models::{ModuleOutline, ModuleRef};

#[derive(Debug, Clone, Default)]
pub struct ModuleResolver {
    workspace_roots: Vec<PathBuf>,
    external_roots: Vec<PathBuf>,
}

impl ModuleResolver {
    pub fn new(workspace_roots: Vec<PathBuf>, external_roots: Vec<PathBuf>) -> Self {
        Self {
            workspace_roots,
            external_roots,
        }
    }

    /// File implementing `module` as seen from `from`, if it exists locally.
    pub fn resolve(&self, reader: &dyn SourceReader, from: &Path, module: &ModuleRef) -> Option<PathBuf> {
        if module.is_relative() {
            let mut base = from.parent()?;
            for _ in 1..module.level {
                base = base.parent()?;
            }
            return candidate(reader, base, &module.dotted);
        }
        if module.dotted.is_empty() {
            return None;
        }
        self.workspace_roots
            .iter()
            .chain(&self.external_roots)
            .find_map(|root| candidate(reader, root, &module.dotted))
    }

    /// Fill `target` / `local_target` of every binding and return the local
    /// import edges in source order.
    pub fn resolve_bindings(
        &self,
        reader: &dyn SourceReader,
        from: &Path,
        outline: &mut ModuleOutline,
    ) -> Vec<PathBuf> {
        let mut edges = IndexSet::new();
        for binding in &mut outline.bindings {
            binding.target = self.resolve(reader, from, &binding.module);
            binding.local_target = match binding.imported.as_deref() {
                None => {
                    let root = binding.module.dotted.split('.').next().unwrap_or("");
                    if binding.module.dotted.contains('.') && binding.local_name == root {
                        self.resolve(reader, from, &ModuleRef::absolute(root))
                    } else {
                        binding.target.clone()
                    }
                }
                Some("*") => None,
                Some(name) => {
                    let dotted = if binding.module.dotted.is_empty() {
                        SmolStr::new(name)
                    } else {
                        SmolStr::new(format!("{}.{}", binding.module.dotted, name))
                    };
                    let submodule = ModuleRef {
                        level: binding.module.level,
                        dotted,
                    };
                    self.resolve(reader, from, &submodule)
                }
            };
            edges.extend(binding.target.iter().cloned());
            edges.extend(binding.local_target.iter().cloned());
        }
        edges.shift_remove(from);
        edges.into_iter().collect()
    }
}

/// `base/a/b.py`, `base/a/b.pyi` or `base/a/b/__init__.py`; an empty module
/// names the package at `base` itself.
fn candidate(reader: &dyn SourceReader, base: &Path, dotted: &str) -> Option<PathBuf> {
    let segments: Vec<&str> = dotted.split('.').filter(|s| !s.is_empty()).collect();
    let Some((last, parents)) = segments.split_last() else {
        let init = base.join("__init__.py");
        return reader.exists(&init).then_some(init);
    };

    let mut dir = base.to_path_buf();
    dir.extend(parents);
    for file_name in [format!("{last}.py"), format!("{last}.pyi")] {
        let path = dir.join(file_name);
        if reader.exists(&path) {
            return Some(path);
        }
    }
    let init = dir.join(last).join("__init__.py");
    reader.exists(&init).then_some(init)
}
