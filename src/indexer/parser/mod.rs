pub mod core;
pub mod resolve;

use std::path::Path;

use lsp_types::{Diagnostic, Range};
use tree_sitter::Tree;

use crate::models::{DiagnosticCode, ModuleOutline};

pub use self::core::PythonParser;
pub use resolve::ModuleResolver;

/// Result of parsing one file. Never an error: malformed input yields a
/// partial outline plus syntax diagnostics.
#[derive(Debug, Default)]
pub struct ParsedSource {
    pub tree: Option<Tree>,
    pub outline: ModuleOutline,
    pub diagnostics: Vec<Diagnostic>,
}

impl ParsedSource {
    /// Empty result for when no tree could be produced at all.
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self {
            tree: None,
            outline: ModuleOutline::default(),
            diagnostics: vec![DiagnosticCode::ParserUnavailable.diagnostic(Range::default(), message)],
        }
    }
}

pub trait SourceParser: Send {
    fn parse(&mut self, path: &Path, bytes: &[u8]) -> ParsedSource;
}

/// Check if a file should be indexed based on extension
pub fn is_indexable(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("py") | Some("pyi")
    )
}
