//! Build step bodies: Arch, ArchEval and Validation.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use indexmap::{IndexMap, IndexSet};
use lsp_types::{Diagnostic, Range};
use tree_sitter::Tree;

use super::records::FileRecordStore;
use crate::cache::AstCache;
use crate::error::Result;
use crate::models::{
    AstPayload, BuildStatus, BuildStep, DiagnosticCode, ExportTable, ImportBinding, Resolution,
    SymbolKind, TextRange,
};

/// Mutable view the scheduler hands to one task.
pub struct BuildContext<'a> {
    pub records: &'a mut FileRecordStore,
    pub cache: &'a mut AstCache,
    leases: &'a mut IndexMap<PathBuf, Arc<AstPayload>>,
    touched: &'a mut IndexSet<PathBuf>,
    lease_limit: usize,
    followups: Vec<(PathBuf, BuildStep)>,
    /// Files whose ArchEval is in progress, outermost first
    chain: IndexSet<PathBuf>,
    max_eval_depth: usize,
}

/// Exports of a dependency, and whether they are only a best-effort subset.
struct Evaluated {
    exports: Arc<ExportTable>,
    partial: bool,
}

impl<'a> BuildContext<'a> {
    pub fn new(
        records: &'a mut FileRecordStore,
        cache: &'a mut AstCache,
        leases: &'a mut IndexMap<PathBuf, Arc<AstPayload>>,
        touched: &'a mut IndexSet<PathBuf>,
        lease_limit: usize,
        max_eval_depth: usize,
    ) -> Self {
        Self {
            records,
            cache,
            leases,
            touched,
            lease_limit: lease_limit.max(1),
            followups: Vec::new(),
            chain: IndexSet::new(),
            max_eval_depth,
        }
    }

    /// Tasks discovered while running, in discovery order.
    pub fn into_followups(self) -> Vec<(PathBuf, BuildStep)> {
        self.followups
    }

    /// Payload for `path`, leased until its tasks drain. Past the lease
    /// limit the least recently used lease is dropped; callers keep their
    /// own `Arc` for as long as they need it.
    fn payload(&mut self, path: &Path) -> Result<Arc<AstPayload>> {
        self.touched.insert(path.to_path_buf());
        if let Some(payload) = self.leases.shift_remove(path) {
            self.leases.insert(path.to_path_buf(), payload.clone());
            return Ok(payload);
        }
        let payload = self.cache.get(self.records, path)?;
        self.leases.insert(path.to_path_buf(), payload.clone());
        while self.leases.len() > self.lease_limit {
            if let Some((oldest, _)) = self.leases.shift_remove_index(0) {
                tracing::trace!("Lease limit reached, released {:?}", oldest);
            }
        }
        Ok(payload)
    }

    fn enqueue(&mut self, path: &Path, step: BuildStep) {
        self.followups.push((path.to_path_buf(), step));
    }
}

pub fn run_step(ctx: &mut BuildContext<'_>, path: &Path, step: BuildStep) {
    match step {
        BuildStep::Arch => run_arch(ctx, path),
        BuildStep::ArchEval => {
            ensure_eval(ctx, path);
        }
        BuildStep::Validation => validate(ctx, path),
    }
}

// -- Arch -------------------------------------------------------------------

fn run_arch(ctx: &mut BuildContext<'_>, path: &Path) {
    ctx.records
        .get_or_create(path)
        .set_status(BuildStep::Arch, BuildStatus::InProgress);

    let payload = match ctx.payload(path) {
        Ok(payload) => payload,
        Err(e) => {
            tracing::warn!("Arch skipped for {:?}: {}", path, e);
            let diagnostic = DiagnosticCode::ReadFailure
                .diagnostic(Range::default(), format!("Cannot read file: {}", e));
            ctx.records
                .record_diagnostics(path, BuildStep::Arch, vec![diagnostic]);
            ctx.records
                .record_diagnostics(path, BuildStep::ArchEval, Vec::new());
            ctx.records
                .record_diagnostics(path, BuildStep::Validation, Vec::new());
            ctx.records.set_imports(path, Vec::new());
            let record = ctx.records.get_or_create(path);
            record.outline = None;
            record.exports = None;
            record.missing = e.is_not_found();
            record.status = [BuildStatus::Failed; 3];
            return;
        }
    };

    let record = ctx.records.get_or_create(path);
    record.outline = Some(payload.outline.clone());
    record.from_snapshot = false;
    record.set_status(BuildStep::Arch, BuildStatus::Done);
    record.reset_from(BuildStep::ArchEval);
    ctx.records
        .record_diagnostics(path, BuildStep::Arch, payload.diagnostics.clone());
    ctx.records.set_imports(path, payload.imports.clone());

    ctx.enqueue(path, BuildStep::ArchEval);
    for dep in &payload.imports {
        let unbuilt = ctx
            .records
            .get(dep)
            .map_or(true, |r| r.status(BuildStep::Arch) == BuildStatus::Pending);
        if unbuilt {
            ctx.enqueue(dep, BuildStep::Arch);
        }
    }
    tracing::debug!(
        "Arch {:?}: {} symbols, {} local imports",
        path,
        payload.outline.symbols.len(),
        payload.imports.len()
    );
}

fn ensure_arch(ctx: &mut BuildContext<'_>, path: &Path) {
    if ctx.records.status(path, BuildStep::Arch) == BuildStatus::Pending {
        run_arch(ctx, path);
    }
}

// -- ArchEval ---------------------------------------------------------------

/// Export table of `path`, evaluating it (and, re-entrantly, its imports) if needed.
pub fn ensure_eval(ctx: &mut BuildContext<'_>, path: &Path) -> Arc<ExportTable> {
    evaluate(ctx, path, 0).exports
}

fn evaluate(ctx: &mut BuildContext<'_>, path: &Path, depth: usize) -> Evaluated {
    if let Some(record) = ctx.records.get(path) {
        if record.status(BuildStep::ArchEval) == BuildStatus::Done {
            if let Some(exports) = &record.exports {
                return Evaluated {
                    exports: exports.clone(),
                    partial: false,
                };
            }
        }
    }

    ensure_arch(ctx, path);
    if ctx.records.status(path, BuildStep::Arch) == BuildStatus::Failed {
        return Evaluated {
            exports: Arc::new(ExportTable::new()),
            partial: false,
        };
    }
    if depth > ctx.max_eval_depth {
        tracing::debug!("Eval depth limit reached at {:?}", path);
        return Evaluated {
            exports: partial_exports(ctx.records, path),
            partial: true,
        };
    }

    ctx.chain.insert(path.to_path_buf());
    ctx.records
        .get_or_create(path)
        .set_status(BuildStep::ArchEval, BuildStatus::InProgress);

    let outline = ctx
        .records
        .get(path)
        .and_then(|r| r.outline.clone())
        .unwrap_or_default();
    let mut table = ExportTable::new();
    // Import target -> first binding that ran into the cycle
    let mut cycles: IndexMap<PathBuf, (TextRange, String)> = IndexMap::new();

    for binding in &outline.bindings {
        match binding.imported.as_deref() {
            None => {
                table.insert(binding.local_name.clone(), module_resolution(binding));
            }
            Some("*") => {
                let Some(target) = &binding.target else {
                    continue;
                };
                let dep = dependency(ctx, path, target, binding, depth, &mut cycles);
                for (name, resolution) in dep.exports.iter() {
                    if !name.starts_with('_') {
                        table.insert(name.clone(), resolution.clone());
                    }
                }
            }
            Some(name) => {
                let resolution = match &binding.target {
                    Some(target) => {
                        let dep = dependency(ctx, path, target, binding, depth, &mut cycles);
                        match dep.exports.get(name) {
                            Some(resolution) => resolution.clone(),
                            None => match &binding.local_target {
                                Some(sub) => Resolution::Module { path: sub.clone() },
                                None if dep.partial => Resolution::Partial {
                                    path: target.clone(),
                                    name: binding.imported.clone().unwrap_or_default(),
                                },
                                None => Resolution::Unresolved {
                                    module: binding.module.display().into(),
                                    name: binding.imported.clone(),
                                },
                            },
                        }
                    }
                    None => module_resolution(binding),
                };
                table.insert(binding.local_name.clone(), resolution);
            }
        }
    }
    for symbol in &outline.symbols {
        table.insert(
            symbol.name.clone(),
            Resolution::Local {
                path: path.to_path_buf(),
                name: symbol.name.clone(),
                kind: symbol.kind,
            },
        );
    }
    ctx.chain.shift_remove(path);

    let diagnostics = cycle_diagnostics(ctx, path, &cycles);
    ctx.records
        .record_diagnostics(path, BuildStep::ArchEval, diagnostics);

    let exports = Arc::new(table);
    let record = ctx.records.get_or_create(path);
    record.exports = Some(exports.clone());
    record.set_status(BuildStep::ArchEval, BuildStatus::Done);
    let workspace = record.is_workspace();
    if !workspace {
        record.set_status(BuildStep::Validation, BuildStatus::Done);
    }
    if workspace {
        ctx.enqueue(path, BuildStep::Validation);
    }
    tracing::debug!("ArchEval {:?}: {} exported names", path, exports.len());

    Evaluated {
        exports,
        partial: false,
    }
}

/// Exports of an imported module. Short-circuits with a partial table when
/// the module is already being evaluated further up the chain.
fn dependency(
    ctx: &mut BuildContext<'_>,
    importer: &Path,
    target: &Path,
    binding: &ImportBinding,
    depth: usize,
    cycles: &mut IndexMap<PathBuf, (TextRange, String)>,
) -> Evaluated {
    if target == importer {
        return Evaluated {
            exports: partial_exports(ctx.records, target),
            partial: true,
        };
    }
    if ctx.chain.contains(target) {
        tracing::debug!("Import cycle: {:?} -> {:?}", importer, target);
        cycles
            .entry(target.to_path_buf())
            .or_insert_with(|| (binding.range, binding.module.display()));
        return Evaluated {
            exports: partial_exports(ctx.records, target),
            partial: true,
        };
    }
    evaluate(ctx, target, depth + 1)
}

/// What a name bound to a module (rather than a member) resolves to.
fn module_resolution(binding: &ImportBinding) -> Resolution {
    match (&binding.local_target, binding.module.is_relative()) {
        (Some(path), _) => Resolution::Module { path: path.clone() },
        (None, false) => Resolution::External {
            module: binding.module.dotted.clone(),
        },
        (None, true) => Resolution::Unresolved {
            module: binding.module.display().into(),
            name: binding.imported.clone(),
        },
    }
}

/// Local definitions only, from the Arch outline.
fn partial_exports(records: &FileRecordStore, path: &Path) -> Arc<ExportTable> {
    let table = records
        .get(path)
        .and_then(|r| r.outline.as_ref())
        .map(|outline| {
            outline
                .symbols
                .iter()
                .map(|s| {
                    (
                        s.name.clone(),
                        Resolution::Partial {
                            path: path.to_path_buf(),
                            name: s.name.clone(),
                        },
                    )
                })
                .collect()
        })
        .unwrap_or_default();
    Arc::new(table)
}

fn cycle_diagnostics(
    ctx: &mut BuildContext<'_>,
    path: &Path,
    cycles: &IndexMap<PathBuf, (TextRange, String)>,
) -> Vec<Diagnostic> {
    if cycles.is_empty() {
        return Vec::new();
    }
    let payload = ctx.payload(path).ok();
    cycles
        .values()
        .map(|(range, module)| {
            let range = payload
                .as_ref()
                .map(|p| p.range(*range))
                .unwrap_or_default();
            DiagnosticCode::CyclicImport.diagnostic(
                range,
                format!("Cyclic import: `{}` is still being resolved; names from it are partial", module),
            )
        })
        .collect()
}

// -- Validation -------------------------------------------------------------

fn validate(ctx: &mut BuildContext<'_>, path: &Path) {
    if !ctx.records.get_or_create(path).is_workspace() {
        ctx.records
            .get_or_create(path)
            .set_status(BuildStep::Validation, BuildStatus::Done);
        return;
    }

    // ArchEval always precedes Validation, even when its own task is still queued
    let exports = ensure_eval(ctx, path);
    if ctx.records.status(path, BuildStep::Arch) == BuildStatus::Failed {
        return;
    }
    ctx.records
        .get_or_create(path)
        .set_status(BuildStep::Validation, BuildStatus::InProgress);

    let payload = match ctx.payload(path) {
        Ok(payload) => payload,
        Err(e) => {
            tracing::warn!("Validation skipped for {:?}: {}", path, e);
            let diagnostic = DiagnosticCode::ReadFailure
                .diagnostic(Range::default(), format!("Cannot read file: {}", e));
            ctx.records
                .record_diagnostics(path, BuildStep::Validation, vec![diagnostic]);
            ctx.records
                .get_or_create(path)
                .set_status(BuildStep::Validation, BuildStatus::Failed);
            return;
        }
    };

    let records = &*ctx.records;
    let mut diagnostics = import_diagnostics(&payload, &exports, |target| {
        records.get(target).and_then(|r| r.exports.clone())
    });
    diagnostics.extend(redefinition_diagnostics(&payload));
    tracing::debug!("Validation {:?}: {} diagnostics", path, diagnostics.len());

    ctx.records
        .record_diagnostics(path, BuildStep::Validation, diagnostics);
    ctx.records
        .get_or_create(path)
        .set_status(BuildStep::Validation, BuildStatus::Done);
}

/// `target_exports` looks up the evaluated exports of an imported file; a
/// name is only reported missing in the module that fails to define it.
fn import_diagnostics(
    payload: &AstPayload,
    exports: &ExportTable,
    target_exports: impl Fn(&Path) -> Option<Arc<ExportTable>>,
) -> Vec<Diagnostic> {
    let mut diagnostics = Vec::new();
    let mut reported_modules = IndexSet::new();
    for binding in &payload.outline.bindings {
        if binding.target.is_none() && binding.local_target.is_none() && binding.module.is_relative() {
            let module = binding.module.display();
            if reported_modules.insert(module.clone()) {
                diagnostics.push(DiagnosticCode::UnresolvedImport.diagnostic(
                    payload.range(binding.range),
                    format!("Cannot resolve relative import `{}`", module),
                ));
            }
            continue;
        }
        let (Some(name), Some(target)) = (binding.imported.as_deref(), &binding.target) else {
            continue;
        };
        if binding.is_wildcard() {
            continue;
        }
        let unresolved = matches!(exports.get(&binding.local_name), Some(Resolution::Unresolved { .. }));
        let defined_there = target_exports(target).is_some_and(|t| t.contains_key(name));
        if unresolved && !defined_there {
            let module = binding.module.display();
            diagnostics.push(DiagnosticCode::MissingImportedName.diagnostic(
                payload.range(binding.range),
                format!("`{}` is not defined in module `{}`", name, module),
            ));
        }
    }
    diagnostics
}

fn redefinition_diagnostics(payload: &AstPayload) -> Vec<Diagnostic> {
    let Some(tree) = &payload.tree else {
        return Vec::new();
    };
    let mut first_seen: HashMap<&str, (SymbolKind, TextRange)> = HashMap::new();
    let mut diagnostics = Vec::new();
    for symbol in &payload.outline.symbols {
        if !matches!(symbol.kind, SymbolKind::Class | SymbolKind::Function) {
            continue;
        }
        // Definitions under `if`/`try` are alternatives, not redefinitions
        if !is_module_level(tree, symbol.range) {
            continue;
        }
        match first_seen.get(symbol.name.as_str()) {
            Some((kind, first)) => {
                let line = payload.range(*first).start.line + 1;
                diagnostics.push(DiagnosticCode::Redefinition.diagnostic(
                    payload.range(symbol.name_range),
                    format!(
                        "`{}` redefines the {} defined on line {}",
                        symbol.name,
                        kind.as_str(),
                        line
                    ),
                ));
            }
            None => {
                first_seen.insert(symbol.name.as_str(), (symbol.kind, symbol.name_range));
            }
        }
    }
    diagnostics
}

fn is_module_level(tree: &Tree, range: TextRange) -> bool {
    tree.root_node()
        .descendant_for_byte_range(range.start as usize, range.end as usize)
        .and_then(|node| node.parent())
        .is_some_and(|parent| parent.kind() == "module")
}
