use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use lsp_types::{Diagnostic, Position, Range};
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use tree_sitter::Tree;

/// Byte span inside a source file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TextRange {
    pub start: u32,
    pub end: u32,
}

impl TextRange {
    pub fn new(start: usize, end: usize) -> Self {
        Self {
            start: start as u32,
            end: end as u32,
        }
    }
}

/// Symbol kind enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SymbolKind {
    Class,
    Function,
    Method,
    Variable,
}

impl SymbolKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Class => "class",
            Self::Function => "function",
            Self::Method => "method",
            Self::Variable => "variable",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "class" => Some(Self::Class),
            "function" => Some(Self::Function),
            "method" => Some(Self::Method),
            "variable" => Some(Self::Variable),
            _ => None,
        }
    }
}

/// A definition found by the Arch step: skeletal, without cross-file resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolDef {
    pub name: SmolStr,
    pub kind: SymbolKind,
    /// Whole definition, including decorators and body
    pub range: TextRange,
    /// Just the identifier
    pub name_range: TextRange,
    pub children: Vec<SymbolDef>,
}

/// Module named by an import statement. `level` counts leading dots.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ModuleRef {
    pub level: u32,
    pub dotted: SmolStr,
}

impl ModuleRef {
    pub fn absolute(dotted: &str) -> Self {
        Self {
            level: 0,
            dotted: SmolStr::new(dotted),
        }
    }

    pub fn is_relative(&self) -> bool {
        self.level > 0
    }

    pub fn display(&self) -> String {
        format!("{}{}", ".".repeat(self.level as usize), self.dotted)
    }
}

/// Name bound in a module by an import statement.
///
/// `imported` is `None` for `import a.b [as x]`, the imported member for
/// `from m import n [as x]`, and `"*"` for wildcard imports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportBinding {
    pub local_name: SmolStr,
    pub module: ModuleRef,
    pub imported: Option<SmolStr>,
    pub range: TextRange,
    /// File implementing `module`, filled by the resolver
    pub target: Option<PathBuf>,
    /// File the local name designates when it names a module
    pub local_target: Option<PathBuf>,
}

impl ImportBinding {
    pub fn is_wildcard(&self) -> bool {
        self.imported.as_deref() == Some("*")
    }
}

/// Skeletal outline of a module: definitions plus import bindings.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ModuleOutline {
    pub symbols: Vec<SymbolDef>,
    pub bindings: Vec<ImportBinding>,
}

impl ModuleOutline {
    /// Last top-level definition with this name (later definitions shadow earlier ones).
    pub fn top_level(&self, name: &str) -> Option<&SymbolDef> {
        self.symbols.iter().rev().find(|s| s.name == name)
    }

    pub fn symbol_count(&self) -> usize {
        fn count(symbols: &[SymbolDef]) -> usize {
            symbols.iter().map(|s| 1 + count(&s.children)).sum()
        }
        count(&self.symbols)
    }
}

/// What a module-level name resolves to after ArchEval.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Local {
        path: PathBuf,
        name: SmolStr,
        kind: SymbolKind,
    },
    Module {
        path: PathBuf,
    },
    /// Module outside every configured root
    External {
        module: SmolStr,
    },
    /// Best-effort result produced while the defining module was still mid-evaluation
    Partial {
        path: PathBuf,
        name: SmolStr,
    },
    Unresolved {
        module: SmolStr,
        name: Option<SmolStr>,
    },
}

impl Resolution {
    /// File and name to jump to, if the resolution points into a local file.
    pub fn location(&self) -> Option<(&Path, Option<&str>)> {
        match self {
            Self::Local { path, name, .. } | Self::Partial { path, name } => {
                Some((path.as_path(), Some(name.as_str())))
            }
            Self::Module { path } => Some((path.as_path(), None)),
            Self::External { .. } | Self::Unresolved { .. } => None,
        }
    }
}

pub type ExportTable = BTreeMap<SmolStr, Resolution>;

/// Byte offset to line/column mapping. Columns count UTF-16 code units,
/// the default position encoding of LSP clients.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LineIndex {
    line_starts: Vec<u32>,
    /// Multi-byte characters of each line that has any
    wide_chars: BTreeMap<u32, Vec<WideChar>>,
    len: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct WideChar {
    /// Byte column within the line
    start: u32,
    utf8_len: u8,
    utf16_len: u8,
}

impl WideChar {
    fn extra_bytes(self) -> u32 {
        u32::from(self.utf8_len - self.utf16_len)
    }
}

impl LineIndex {
    pub fn new(text: &[u8]) -> Self {
        let mut line_starts = vec![0];
        line_starts.extend(
            text.iter()
                .enumerate()
                .filter(|(_, b)| **b == b'\n')
                .map(|(i, _)| i as u32 + 1),
        );

        // Invalid UTF-8 keeps byte columns
        let mut wide_chars: BTreeMap<u32, Vec<WideChar>> = BTreeMap::new();
        if let Ok(text) = std::str::from_utf8(text) {
            let mut line = 0u32;
            let mut line_start = 0u32;
            for (offset, c) in text.char_indices() {
                if c == '\n' {
                    line += 1;
                    line_start = offset as u32 + 1;
                } else if !c.is_ascii() {
                    wide_chars.entry(line).or_default().push(WideChar {
                        start: offset as u32 - line_start,
                        utf8_len: c.len_utf8() as u8,
                        utf16_len: c.len_utf16() as u8,
                    });
                }
            }
        }

        Self {
            line_starts,
            wide_chars,
            len: text.len() as u32,
        }
    }

    pub fn position(&self, offset: u32) -> Position {
        let offset = offset.min(self.len);
        let line = self
            .line_starts
            .partition_point(|start| *start <= offset)
            .saturating_sub(1);
        let start = self.line_starts.get(line).copied().unwrap_or(0);
        let column = offset - start;
        let extra: u32 = self
            .wide_chars
            .get(&(line as u32))
            .map(|chars| {
                chars
                    .iter()
                    .filter(|c| c.start < column)
                    .map(|c| c.extra_bytes())
                    .sum()
            })
            .unwrap_or(0);
        Position::new(line as u32, column - extra)
    }

    pub fn range(&self, range: TextRange) -> Range {
        Range::new(self.position(range.start), self.position(range.end))
    }
}

/// The heavy parsed representation of one file.
///
/// Shared through `Arc`: the persistent cache tier, scheduler leases and
/// queries hold strong references, the transient tier only a `Weak`.
#[derive(Debug)]
pub struct AstPayload {
    pub path: PathBuf,
    pub hash: String,
    pub mtime: i64,
    pub tree: Option<Tree>,
    pub source: Option<Arc<str>>,
    pub line_index: LineIndex,
    pub outline: Arc<ModuleOutline>,
    /// Resolved local import edges, deduplicated in source order
    pub imports: Vec<PathBuf>,
    pub diagnostics: Vec<Diagnostic>,
}

impl AstPayload {
    pub fn range(&self, range: TextRange) -> Range {
        self.line_index.range(range)
    }

    fn tree_sexp(&self) -> Option<String> {
        self.tree.as_ref().map(|t| t.root_node().to_sexp())
    }
}

// Structural equality: two parses of the same bytes compare equal even though
// they live in different allocations.
impl PartialEq for AstPayload {
    fn eq(&self, other: &Self) -> bool {
        self.path == other.path
            && self.hash == other.hash
            && self.mtime == other.mtime
            && self.source == other.source
            && self.line_index == other.line_index
            && self.outline == other.outline
            && self.imports == other.imports
            && self.diagnostics == other.diagnostics
            && self.tree_sexp() == other.tree_sexp()
    }
}
