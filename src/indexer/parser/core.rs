use std::path::Path;

use lsp_types::Diagnostic;
use smol_str::SmolStr;
use tree_sitter::{Language, Node, Parser};

use super::{ParsedSource, SourceParser};
use crate::models::{
    DiagnosticCode, ImportBinding, LineIndex, ModuleOutline, ModuleRef, SymbolDef, SymbolKind, TextRange,
};

/// Cap per file; a badly broken file would otherwise flood the client.
const MAX_SYNTAX_DIAGNOSTICS: usize = 100;

/// tree-sitter backed parser for Python modules
pub struct PythonParser {
    parser: Parser,
    language: Language,
    language_set: bool,
}

impl PythonParser {
    pub fn new() -> Self {
        Self {
            parser: Parser::new(),
            language: tree_sitter_python::LANGUAGE.into(),
            language_set: false,
        }
    }
}

impl Default for PythonParser {
    fn default() -> Self {
        Self::new()
    }
}

impl SourceParser for PythonParser {
    fn parse(&mut self, path: &Path, bytes: &[u8]) -> ParsedSource {
        if !self.language_set {
            if let Err(e) = self.parser.set_language(&self.language) {
                tracing::warn!("Failed to load Python grammar: {}", e);
                return ParsedSource::unavailable(format!("Python grammar unavailable: {}", e));
            }
            self.language_set = true;
        }

        let Some(tree) = self.parser.parse(bytes, None) else {
            tracing::warn!("Parser produced no tree for {:?}", path);
            return ParsedSource::unavailable("Parser produced no syntax tree");
        };

        let root = tree.root_node();
        let mut outline = ModuleOutline::default();
        collect_definitions(root, bytes, false, &mut outline.symbols);
        collect_bindings(root, bytes, &mut outline.bindings);

        let mut diagnostics = Vec::new();
        if root.has_error() {
            collect_syntax_errors(root, &LineIndex::new(bytes), &mut diagnostics);
        }

        ParsedSource {
            tree: Some(tree),
            outline,
            diagnostics,
        }
    }
}

fn text<'a>(node: Node<'_>, code: &'a [u8]) -> Option<&'a str> {
    node.utf8_text(code).ok().filter(|t| !t.is_empty())
}

fn text_range(node: Node<'_>) -> TextRange {
    TextRange::new(node.start_byte(), node.end_byte())
}

/// Statements whose bodies still belong to the enclosing scope
fn is_scope_container(kind: &str) -> bool {
    matches!(
        kind,
        "if_statement"
            | "elif_clause"
            | "else_clause"
            | "try_statement"
            | "except_clause"
            | "finally_clause"
            | "with_statement"
            | "block"
    )
}

// -- Definitions ------------------------------------------------------------

fn collect_definitions(node: Node<'_>, code: &[u8], in_class: bool, out: &mut Vec<SymbolDef>) {
    let mut cursor = node.walk();
    for child in node.named_children(&mut cursor) {
        match child.kind() {
            "class_definition" | "function_definition" => {
                out.extend(definition(child, child, code, in_class));
            }
            "decorated_definition" => {
                if let Some(def) = child.child_by_field_name("definition") {
                    out.extend(definition(child, def, code, in_class));
                }
            }
            "expression_statement" => collect_assignments(child, code, out),
            kind if is_scope_container(kind) => collect_definitions(child, code, in_class, out),
            _ => {}
        }
    }
}

fn definition(outer: Node<'_>, def: Node<'_>, code: &[u8], in_class: bool) -> Option<SymbolDef> {
    let name_node = def.child_by_field_name("name")?;
    let name = text(name_node, code)?;
    let (kind, children) = match def.kind() {
        "class_definition" => {
            let mut children = Vec::new();
            if let Some(body) = def.child_by_field_name("body") {
                collect_definitions(body, code, true, &mut children);
            }
            (SymbolKind::Class, children)
        }
        "function_definition" if in_class => (SymbolKind::Method, Vec::new()),
        "function_definition" => (SymbolKind::Function, Vec::new()),
        _ => return None,
    };
    Some(SymbolDef {
        name: SmolStr::new(name),
        kind,
        range: text_range(outer),
        name_range: text_range(name_node),
        children,
    })
}

fn collect_assignments(stmt: Node<'_>, code: &[u8], out: &mut Vec<SymbolDef>) {
    let mut cursor = stmt.walk();
    for expr in stmt.named_children(&mut cursor) {
        if expr.kind() != "assignment" {
            continue;
        }
        if let Some(left) = expr.child_by_field_name("left") {
            push_targets(left, stmt, code, out);
        }
    }
}

fn push_targets(target: Node<'_>, stmt: Node<'_>, code: &[u8], out: &mut Vec<SymbolDef>) {
    match target.kind() {
        "identifier" => {
            if let Some(name) = text(target, code) {
                out.push(SymbolDef {
                    name: SmolStr::new(name),
                    kind: SymbolKind::Variable,
                    range: text_range(stmt),
                    name_range: text_range(target),
                    children: Vec::new(),
                });
            }
        }
        "pattern_list" | "tuple_pattern" | "list_pattern" => {
            let mut cursor = target.walk();
            for inner in target.named_children(&mut cursor) {
                push_targets(inner, stmt, code, out);
            }
        }
        // attribute / subscript targets bind nothing at module level
        _ => {}
    }
}

// -- Imports ----------------------------------------------------------------

fn collect_bindings(node: Node<'_>, code: &[u8], out: &mut Vec<ImportBinding>) {
    let mut cursor = node.walk();
    for child in node.named_children(&mut cursor) {
        match child.kind() {
            "import_statement" => push_import(child, code, out),
            "import_from_statement" => push_from_import(child, code, out),
            kind if is_scope_container(kind) => collect_bindings(child, code, out),
            _ => {}
        }
    }
}

/// `import a.b`, `import a.b as x`
fn push_import(node: Node<'_>, code: &[u8], out: &mut Vec<ImportBinding>) {
    let mut cursor = node.walk();
    for name in node.children_by_field_name("name", &mut cursor) {
        let (dotted, alias) = match name.kind() {
            "aliased_import" => (
                name.child_by_field_name("name").and_then(|n| text(n, code)),
                name.child_by_field_name("alias").and_then(|n| text(n, code)),
            ),
            _ => (text(name, code), None),
        };
        let Some(dotted) = dotted else { continue };
        // Without an alias, `import a.b` binds the top-level package `a`
        let local = alias.unwrap_or_else(|| dotted.split('.').next().unwrap_or(dotted));
        out.push(ImportBinding {
            local_name: SmolStr::new(local),
            module: ModuleRef::absolute(dotted),
            imported: None,
            range: text_range(name),
            target: None,
            local_target: None,
        });
    }
}

/// `from m import a, b as c`, `from ..pkg import *`
fn push_from_import(node: Node<'_>, code: &[u8], out: &mut Vec<ImportBinding>) {
    let Some(module_node) = node.child_by_field_name("module_name") else {
        return;
    };
    let module = match module_node.kind() {
        "relative_import" => {
            let mut level = 0;
            let mut dotted = "";
            let mut cursor = module_node.walk();
            for part in module_node.named_children(&mut cursor) {
                match part.kind() {
                    "import_prefix" => {
                        level = text(part, code)
                            .map(|t| t.chars().filter(|c| *c == '.').count())
                            .unwrap_or(0);
                    }
                    "dotted_name" => dotted = text(part, code).unwrap_or(""),
                    _ => {}
                }
            }
            ModuleRef {
                level: level as u32,
                dotted: SmolStr::new(dotted),
            }
        }
        _ => ModuleRef::absolute(text(module_node, code).unwrap_or("")),
    };

    let mut cursor = node.walk();
    for name in node.children_by_field_name("name", &mut cursor) {
        let (imported, alias) = match name.kind() {
            "aliased_import" => (
                name.child_by_field_name("name").and_then(|n| text(n, code)),
                name.child_by_field_name("alias").and_then(|n| text(n, code)),
            ),
            _ => (text(name, code), None),
        };
        let Some(imported) = imported else { continue };
        out.push(ImportBinding {
            local_name: SmolStr::new(alias.unwrap_or(imported)),
            module: module.clone(),
            imported: Some(SmolStr::new(imported)),
            range: text_range(name),
            target: None,
            local_target: None,
        });
    }

    let mut cursor = node.walk();
    let wildcard = node
        .named_children(&mut cursor)
        .find(|n| n.kind() == "wildcard_import");
    if let Some(star) = wildcard {
        out.push(ImportBinding {
            local_name: SmolStr::new("*"),
            module,
            imported: Some(SmolStr::new("*")),
            range: text_range(star),
            target: None,
            local_target: None,
        });
    }
}

// -- Syntax errors ----------------------------------------------------------

fn collect_syntax_errors(root: Node<'_>, lines: &LineIndex, out: &mut Vec<Diagnostic>) {
    let mut stack = vec![root];
    while let Some(node) = stack.pop() {
        if out.len() >= MAX_SYNTAX_DIAGNOSTICS {
            break;
        }
        if node.is_missing() {
            out.push(
                DiagnosticCode::MissingToken
                    .diagnostic(lines.range(text_range(node)), format!("Missing `{}`", node.kind())),
            );
            continue;
        }
        if node.is_error() {
            out.push(DiagnosticCode::SyntaxError.diagnostic(lines.range(text_range(node)), "Invalid syntax"));
            continue;
        }
        if !node.has_error() {
            continue;
        }
        let mut cursor = node.walk();
        let children: Vec<Node<'_>> = node.children(&mut cursor).collect();
        stack.extend(children.into_iter().rev());
    }
}
