//! Read-only queries. They may load payloads through the cache but never
//! touch the scheduler queues.

use std::path::{Path, PathBuf};

use indexmap::IndexSet;
use lsp_types::{Diagnostic, Range};
use nucleo_matcher::{Config, Matcher, Utf32Str};
use serde::Serialize;
use smol_str::SmolStr;
use tokio_util::sync::CancellationToken;
use tree_sitter::Node;

use super::state::IndexState;
use crate::error::{IndexError, Result};
use crate::models::{AstPayload, Resolution, SymbolDef, SymbolKind, TextRange};

/// Re-export chains longer than this are treated as unresolvable
const MAX_DEFINITION_HOPS: usize = 32;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SymbolInfo {
    pub name: String,
    pub kind: SymbolKind,
    pub range: Range,
    pub selection_range: Range,
    pub children: Vec<SymbolInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DefinitionTarget {
    pub name: String,
    pub path: PathBuf,
    /// `None` when the name designates a whole module
    pub kind: Option<SymbolKind>,
    pub range: Range,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReferenceLocation {
    pub path: PathBuf,
    pub range: Range,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SymbolMatch {
    pub name: String,
    pub kind: SymbolKind,
    pub path: PathBuf,
    pub container: Option<String>,
    pub score: u16,
}

fn symbol_info(payload: &AstPayload, symbol: &SymbolDef) -> SymbolInfo {
    SymbolInfo {
        name: symbol.name.to_string(),
        kind: symbol.kind,
        range: payload.range(symbol.range),
        selection_range: payload.range(symbol.name_range),
        children: symbol
            .children
            .iter()
            .map(|child| symbol_info(payload, child))
            .collect(),
    }
}

impl IndexState {
    /// Outline of one file with editor positions.
    pub fn document_symbols(&mut self, path: &Path) -> Result<Vec<SymbolInfo>> {
        let payload = self.cache.get(&mut self.records, path)?;
        Ok(payload
            .outline
            .symbols
            .iter()
            .map(|symbol| symbol_info(&payload, symbol))
            .collect())
    }

    /// Where `name`, as seen from `path`, is defined. Follows imports and
    /// re-exports across files.
    pub fn definition(&mut self, path: &Path, name: &str) -> Result<Option<DefinitionTarget>> {
        let mut current = (path.to_path_buf(), SmolStr::new(name));
        for _ in 0..MAX_DEFINITION_HOPS {
            let (file, symbol) = current.clone();
            let payload = self.cache.get(&mut self.records, &file)?;
            if let Some(def) = payload.outline.top_level(&symbol) {
                return Ok(Some(DefinitionTarget {
                    name: def.name.to_string(),
                    path: file,
                    kind: Some(def.kind),
                    range: payload.range(def.name_range),
                }));
            }

            let resolution = self
                .records
                .get(&file)
                .and_then(|r| r.exports.as_ref())
                .and_then(|exports| exports.get(&symbol).cloned())
                .or_else(|| binding_resolution(&payload, &symbol));
            current = match resolution {
                Some(Resolution::Local { path, name, .. }) | Some(Resolution::Partial { path, name }) => {
                    (path, name)
                }
                Some(Resolution::Module { path }) => {
                    return Ok(Some(DefinitionTarget {
                        name: symbol.to_string(),
                        path,
                        kind: None,
                        range: Range::default(),
                    }));
                }
                _ => return Ok(None),
            };
        }
        tracing::debug!("Gave up resolving `{}` from {:?}", name, path);
        Ok(None)
    }

    /// Every occurrence of the symbol `name` designates when seen from
    /// `path`: in its defining file and in the files that import it,
    /// directly, through re-exports or under an alias. Module names have
    /// no references.
    pub fn references(
        &mut self,
        path: &Path,
        name: &str,
        include_declaration: bool,
    ) -> Result<Vec<ReferenceLocation>> {
        let Some(target) = self.definition(path, name)? else {
            return Ok(Vec::new());
        };
        if target.kind.is_none() {
            return Ok(Vec::new());
        }

        let mut files = vec![target.path.clone()];
        files.extend(self.records.rebuild_set(&target.path));
        let mut locations = Vec::new();
        for file in files {
            let ranges = match self.references_in(&file, &target) {
                Ok(ranges) => ranges,
                Err(e) => {
                    tracing::debug!("Skipping {:?} in reference search: {}", file, e);
                    continue;
                }
            };
            for range in ranges {
                if !include_declaration && file == target.path && range == target.range {
                    continue;
                }
                locations.push(ReferenceLocation {
                    path: file.clone(),
                    range,
                });
            }
        }
        Ok(locations)
    }

    fn references_in(&mut self, file: &Path, target: &DefinitionTarget) -> Result<Vec<Range>> {
        let names = self.names_designating(file, target)?;
        if names.is_empty() {
            return Ok(Vec::new());
        }
        let payload = self.cache.get(&mut self.records, file)?;
        let Some(source) = self.cache.source_of(&self.records, &payload) else {
            tracing::debug!("Source of {:?} changed since parse", file);
            return Ok(Vec::new());
        };
        Ok(identifier_ranges(&payload, &source, &names)
            .into_iter()
            .map(|range| payload.range(range))
            .collect())
    }

    /// Names that resolve to `target` inside `file`.
    fn names_designating(&mut self, file: &Path, target: &DefinitionTarget) -> Result<Vec<SmolStr>> {
        if file == target.path {
            return Ok(vec![SmolStr::new(&target.name)]);
        }
        let payload = self.cache.get(&mut self.records, file)?;
        let mut candidates: IndexSet<SmolStr> = IndexSet::new();
        for binding in &payload.outline.bindings {
            match binding.imported.as_deref() {
                Some("*") => {
                    candidates.insert(SmolStr::new(&target.name));
                }
                Some(_) => {
                    candidates.insert(binding.local_name.clone());
                }
                None => {}
            }
        }

        let mut names = Vec::new();
        for candidate in candidates {
            if self.definition(file, &candidate)?.as_ref() == Some(target) {
                names.push(candidate);
            }
        }
        Ok(names)
    }

    /// Fuzzy subsequence search over every known outline. Uses stored
    /// metadata only, so nothing is reparsed.
    pub fn workspace_symbols(
        &self,
        query: &str,
        limit: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<SymbolMatch>> {
        let mut matcher = Matcher::new(Config::DEFAULT);
        let needle_text = query.to_lowercase();
        let mut needle_buf = Vec::new();
        let needle = Utf32Str::new(&needle_text, &mut needle_buf);
        let mut haystack_buf = Vec::new();
        let mut matches = Vec::new();

        for record in self.records.sorted() {
            if cancel.is_cancelled() {
                return Err(IndexError::Cancelled);
            }
            let Some(outline) = &record.outline else {
                continue;
            };
            let mut stack: Vec<(&SymbolDef, Option<&SymbolDef>)> =
                outline.symbols.iter().rev().map(|s| (s, None)).collect();
            while let Some((symbol, parent)) = stack.pop() {
                let haystack = Utf32Str::new(&symbol.name, &mut haystack_buf);
                if let Some(score) = matcher.fuzzy_match(haystack, needle) {
                    matches.push(SymbolMatch {
                        name: symbol.name.to_string(),
                        kind: symbol.kind,
                        path: record.path.clone(),
                        container: parent.map(|p| p.name.to_string()),
                        score,
                    });
                }
                stack.extend(symbol.children.iter().rev().map(|c| (c, Some(symbol))));
            }
        }

        matches.sort_by(|a, b| {
            b.score
                .cmp(&a.score)
                .then_with(|| a.name.cmp(&b.name))
                .then_with(|| a.path.cmp(&b.path))
        });
        matches.truncate(limit);
        Ok(matches)
    }

    /// Last reported diagnostics of every step.
    pub fn diagnostics(&self, path: &Path) -> Vec<Diagnostic> {
        self.records.diagnostics(path)
    }
}

/// Identifier nodes spelling one of `names`, skipping attribute members,
/// keyword argument names and module paths.
fn identifier_ranges(payload: &AstPayload, source: &[u8], names: &[SmolStr]) -> Vec<TextRange> {
    let Some(tree) = &payload.tree else {
        return Vec::new();
    };
    let mut ranges = Vec::new();
    let mut cursor = tree.walk();
    loop {
        let node = cursor.node();
        if node.kind() == "identifier" && !is_name_only(node) {
            let matched = node
                .utf8_text(source)
                .is_ok_and(|text| names.iter().any(|name| name == text));
            if matched {
                ranges.push(TextRange::new(node.start_byte(), node.end_byte()));
            }
        }
        if cursor.goto_first_child() {
            continue;
        }
        while !cursor.goto_next_sibling() {
            if !cursor.goto_parent() {
                return ranges;
            }
        }
    }
}

/// Identifier that spells a name without referring to a binding in scope.
fn is_name_only(node: Node<'_>) -> bool {
    let Some(parent) = node.parent() else {
        return false;
    };
    match parent.kind() {
        "attribute" => parent.child_by_field_name("attribute") == Some(node),
        "keyword_argument" => parent.child_by_field_name("name") == Some(node),
        "dotted_name" => parent.parent().is_some_and(|outer| match outer.kind() {
            "import_statement" | "relative_import" => true,
            "aliased_import" => outer
                .parent()
                .is_some_and(|statement| statement.kind() == "import_statement"),
            "import_from_statement" => outer.child_by_field_name("module_name") == Some(parent),
            _ => false,
        }),
        _ => false,
    }
}

/// Follow an import binding directly, for files not evaluated yet.
fn binding_resolution(payload: &AstPayload, name: &str) -> Option<Resolution> {
    let binding = payload
        .outline
        .bindings
        .iter()
        .rev()
        .find(|b| b.local_name == name)?;
    match (binding.imported.as_deref(), &binding.target, &binding.local_target) {
        (None, _, Some(path)) => Some(Resolution::Module { path: path.clone() }),
        (Some("*"), _, _) => None,
        (Some(imported), Some(target), _) => Some(Resolution::Local {
            path: target.clone(),
            name: SmolStr::new(imported),
            kind: SymbolKind::Variable,
        }),
        (Some(_), None, Some(path)) => Some(Resolution::Module { path: path.clone() }),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::config::SkeinConfig;
    use crate::indexer::parser::PythonParser;
    use crate::indexer::source::MemoryReader;
    use crate::models::{BuildStep, ProcessState};

    fn state(files: &[(&str, &str)]) -> IndexState {
        let reader = MemoryReader::with_files(files.iter().map(|(p, t)| (*p, *t)));
        let mut config = SkeinConfig::default().resolved(Path::new("/ws"));
        config.cache.min_cache_size = 2;
        config.cache.max_cache_size = 8;
        IndexState::new(&config, Arc::new(reader), Box::new(PythonParser::new()))
    }

    const MODELS: &str = "class User:\n    def save(self):\n        pass\n\n    def delete(self):\n        pass\n\nclass UserService:\n    pass\n";

    #[test]
    fn test_document_symbols_nest_with_positions() {
        let mut state = state(&[("/ws/models.py", MODELS)]);
        let symbols = state.document_symbols(Path::new("/ws/models.py")).unwrap();

        assert_eq!(symbols.len(), 2);
        let user = &symbols[0];
        assert_eq!(user.name, "User");
        assert_eq!(user.selection_range.start.line, 0);
        assert_eq!(user.selection_range.start.character, 6);
        let children: Vec<&str> = user.children.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(children, vec!["save", "delete"]);
        assert_eq!(user.children[1].kind, SymbolKind::Method);
        assert_eq!(symbols[1].range.start.line, 7);
    }

    #[test]
    fn test_definition_follows_reexports() {
        let mut state = state(&[
            ("/ws/app.py", "from api import User\nimport models\nfrom os import path\n"),
            ("/ws/api.py", "from models import User\n"),
            ("/ws/models.py", MODELS),
        ]);
        let app = Path::new("/ws/app.py");
        let cancel = CancellationToken::new();
        // Works before and after evaluation
        for pass in 0..2 {
            let user = state.definition(app, "User").unwrap().unwrap();
            assert_eq!(user.path, PathBuf::from("/ws/models.py"), "pass {}", pass);
            assert_eq!(user.kind, Some(SymbolKind::Class));
            assert_eq!(user.range.start.line, 0);

            let module = state.definition(app, "models").unwrap().unwrap();
            assert_eq!(module.kind, None);
            assert_eq!(module.path, PathBuf::from("/ws/models.py"));

            assert_eq!(state.definition(app, "path").unwrap(), None);
            assert_eq!(state.definition(app, "nothing").unwrap(), None);

            state.scan(&[app.to_path_buf()], &cancel);
            state.run_to_completion(&cancel);
        }
    }

    #[test]
    fn test_evicted_dependency_reloads_identically() {
        let mut state = state(&[
            ("/ws/a.py", "from b import g\n"),
            ("/ws/b.py", "from c import g\n"),
            ("/ws/c.py", "def g():\n    pass\n"),
        ]);
        let cancel = CancellationToken::new();
        let (a, c) = (Path::new("/ws/a.py"), Path::new("/ws/c.py"));
        state.scheduler.enqueue(&state.records, a, BuildStep::Arch);
        let outcome = state
            .scheduler
            .process_batch(&mut state.records, &mut state.cache, 100, &cancel);
        assert_eq!(outcome, ProcessState::Complete);
        for path in ["/ws/a.py", "/ws/b.py", "/ws/c.py"] {
            assert!(state.records.get(Path::new(path)).unwrap().is_built());
        }

        let before = state.definition(a, "g").unwrap().unwrap();
        let symbols_before = state.document_symbols(c).unwrap();
        let parses = state.cache.stats().parses;

        assert!(state.cache.evict(c));
        let after = state.definition(a, "g").unwrap().unwrap();
        assert_eq!(state.cache.stats().parses, parses + 1);
        assert_eq!(after, before);
        assert_eq!(after.path, c.to_path_buf());
        assert_eq!(state.document_symbols(c).unwrap(), symbols_before);
    }

    #[test]
    fn test_references_follow_aliases_and_reexports() {
        let mut state = state(&[
            ("/ws/a.py", "from b import g\n\ndef f():\n    return g()\n"),
            ("/ws/b.py", "from c import h as g\n"),
            (
                "/ws/c.py",
                "def h():\n    pass\n\ndef other(h_count):\n    return h()\n\nother(h=1)\n",
            ),
            ("/ws/d.py", "import c\n\nc.h()\n"),
        ]);
        let cancel = CancellationToken::new();
        let all: Vec<PathBuf> = ["/ws/a.py", "/ws/b.py", "/ws/c.py", "/ws/d.py"]
            .iter()
            .map(PathBuf::from)
            .collect();
        state.scan(&all, &cancel);
        state.run_to_completion(&cancel);

        let at = |path: &str, line: u32, character: u32| (PathBuf::from(path), line, character);
        let found = |locations: Vec<ReferenceLocation>| -> Vec<(PathBuf, u32, u32)> {
            locations
                .into_iter()
                .map(|l| (l.path, l.range.start.line, l.range.start.character))
                .collect()
        };

        let references = state.references(Path::new("/ws/a.py"), "g", true).unwrap();
        assert_eq!(
            found(references),
            vec![
                at("/ws/c.py", 0, 4),
                at("/ws/c.py", 4, 11),
                at("/ws/b.py", 0, 19),
                at("/ws/a.py", 0, 14),
                at("/ws/a.py", 3, 11),
            ]
        );

        // Same set from the defining file, minus the declaration
        let references = state.references(Path::new("/ws/c.py"), "h", false).unwrap();
        assert_eq!(references.len(), 4);
        assert!(!references
            .iter()
            .any(|l| l.path == Path::new("/ws/c.py") && l.range.start.line == 0));

        assert!(state.references(Path::new("/ws/d.py"), "c", true).unwrap().is_empty());
        assert!(state.references(Path::new("/ws/a.py"), "nothing", true).unwrap().is_empty());
    }

    #[test]
    fn test_positions_count_utf16_units() {
        let mut state = state(&[("/ws/a.py", "def f():\n    return \"ñ😀\"\n")]);
        let symbols = state.document_symbols(Path::new("/ws/a.py")).unwrap();
        // `ñ` is one unit and the emoji two, so the string ends at 16
        assert_eq!(symbols[0].range.end.line, 1);
        assert_eq!(symbols[0].range.end.character, 16);
    }

    #[test]
    fn test_workspace_symbols_fuzzy_match() {
        let mut state = state(&[
            ("/ws/models.py", MODELS),
            ("/ws/factory.py", "def user_service_factory():\n    pass\n\nclass Widget:\n    pass\n"),
        ]);
        let cancel = CancellationToken::new();
        state.scan(
            &[PathBuf::from("/ws/models.py"), PathBuf::from("/ws/factory.py")],
            &cancel,
        );
        state.run_to_completion(&cancel);

        let matches = state.workspace_symbols("usrsvc", 10, &cancel).unwrap();
        let names: Vec<&str> = matches.iter().map(|m| m.name.as_str()).collect();
        assert!(names.contains(&"UserService"));
        assert!(names.contains(&"user_service_factory"));
        assert!(!names.contains(&"Widget"));

        let save = state.workspace_symbols("save", 10, &cancel).unwrap();
        assert_eq!(save[0].name, "save");
        assert_eq!(save[0].container.as_deref(), Some("User"));

        assert_eq!(state.workspace_symbols("s", 1, &cancel).unwrap().len(), 1);
    }

    #[test]
    fn test_workspace_symbols_cancellation() {
        let mut state = state(&[("/ws/models.py", MODELS)]);
        let cancel = CancellationToken::new();
        state.scan(&[PathBuf::from("/ws/models.py")], &cancel);
        state.run_to_completion(&cancel);

        cancel.cancel();
        assert!(matches!(
            state.workspace_symbols("user", 10, &cancel),
            Err(IndexError::Cancelled)
        ));
    }
}
