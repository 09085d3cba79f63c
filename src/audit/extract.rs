//! Structural fact extraction from candidate Rust source.
//!
//! Walks the parsed file and emits typed ground facts over the audit
//! predicate schema (`ast_import`, `ast_call`, `ast_macro`,
//! `ast_task_spawn`, `ast_uses_context_cancellation`, `ast_unsafe`,
//! `ast_extern_native`, `ast_assignment`). The extracted index keeps
//! subject -> line mappings so the auditor can classify policy bindings
//! and render locations.

use crate::error::{EngineError, EngineResult};
use crate::facts::{Fact, Term};
use std::collections::HashMap;
use syn::spanned::Spanned;
use syn::visit::Visit;

/// Facts plus the subject index used for violation classification.
#[derive(Debug, Default)]
pub struct ExtractedFacts {
    pub facts: Vec<Fact>,
    /// import prefix -> lines
    pub imports: HashMap<String, Vec<usize>>,
    /// callee -> lines (calls and method calls)
    pub calls: HashMap<String, Vec<usize>>,
    /// macro name -> lines
    pub macros: HashMap<String, Vec<usize>>,
    /// spawn callee -> lines
    pub spawns: HashMap<String, Vec<usize>>,
    /// let-bound identifier -> lines
    pub assignments: HashMap<String, Vec<usize>>,
    pub unsafe_lines: Vec<usize>,
    pub extern_native_lines: Vec<usize>,
    pub functions: usize,
}

impl ExtractedFacts {
    pub fn imports_examined(&self) -> usize {
        self.imports.values().map(|v| v.len()).sum()
    }

    pub fn calls_examined(&self) -> usize {
        self.calls.values().map(|v| v.len()).sum::<usize>()
            + self.macros.values().map(|v| v.len()).sum::<usize>()
    }

    /// First recorded line for a subject, searching every index.
    pub fn line_of(&self, subject: &str) -> Option<usize> {
        for index in [
            &self.imports,
            &self.calls,
            &self.macros,
            &self.spawns,
            &self.assignments,
        ] {
            if let Some(lines) = index.get(subject) {
                if let Some(&line) = lines.first() {
                    return Some(line);
                }
            }
        }
        None
    }
}

/// Parse and walk candidate source. A file `syn` cannot parse is a
/// blocking audit failure surfaced as [`EngineError::Parse`].
pub fn extract(source: &str) -> EngineResult<ExtractedFacts> {
    let file = syn::parse_file(source)
        .map_err(|e| EngineError::Parse(format!("candidate source: {}", e)))?;

    let mut visitor = Extractor::default();
    visitor.visit_file(&file);
    Ok(visitor.finish())
}

#[derive(Default)]
struct Extractor {
    out: ExtractedFacts,
    /// Line of the enclosing function item, used as the cancellation
    /// scope key for spawn sites.
    scope: Vec<usize>,
    /// Scopes that showed a cancellation-shaped parameter or call.
    cancel_scopes: Vec<usize>,
}

impl Extractor {
    fn finish(mut self) -> ExtractedFacts {
        self.cancel_scopes.sort_unstable();
        self.cancel_scopes.dedup();
        for scope in &self.cancel_scopes {
            self.out.facts.push(Fact::new(
                "ast_uses_context_cancellation",
                vec![Term::Int(*scope as i64)],
            ));
        }
        self.out
    }

    fn current_scope(&self) -> usize {
        self.scope.last().copied().unwrap_or(0)
    }

    fn mark_cancellation(&mut self) {
        let scope = self.current_scope();
        self.cancel_scopes.push(scope);
    }

    fn record_import(&mut self, prefix: String, line: usize) {
        self.out.facts.push(Fact::new(
            "ast_import",
            vec![Term::str(prefix.clone()), Term::Int(line as i64)],
        ));
        self.out.imports.entry(prefix).or_default().push(line);
    }

    fn record_call(&mut self, callee: String, line: usize) {
        if is_spawn_callee(&callee) {
            let scope = self.current_scope();
            self.out.facts.push(Fact::new(
                "ast_task_spawn",
                vec![Term::str(callee.clone()), Term::Int(scope as i64)],
            ));
            self.out.spawns.entry(callee.clone()).or_default().push(line);
        }
        self.out.facts.push(Fact::new(
            "ast_call",
            vec![Term::str(callee.clone()), Term::Int(line as i64)],
        ));
        self.out.calls.entry(callee).or_default().push(line);
    }

    fn record_macro(&mut self, name: String, line: usize) {
        if name == "select" {
            // tokio::select! is treated as cancellation-aware waiting
            self.mark_cancellation();
        }
        self.out.facts.push(Fact::new(
            "ast_macro",
            vec![Term::str(name.clone()), Term::Int(line as i64)],
        ));
        self.out.macros.entry(name).or_default().push(line);
    }
}

/// Import prefix used for allowlist matching: `std::xxx` keeps two
/// segments, external crates keep the root.
fn import_prefix(segments: &[String]) -> Option<String> {
    let root = segments.first()?;
    match root.as_str() {
        "std" | "core" | "alloc" | "tokio" => {
            if segments.len() >= 2 {
                Some(format!("{}::{}", root, segments[1]))
            } else {
                Some(root.clone())
            }
        }
        "crate" | "self" | "super" => None,
        _ => Some(root.clone()),
    }
}

fn flatten_use(tree: &syn::UseTree, prefix: &mut Vec<String>, out: &mut Vec<Vec<String>>) {
    match tree {
        syn::UseTree::Path(p) => {
            prefix.push(p.ident.to_string());
            flatten_use(&p.tree, prefix, out);
            prefix.pop();
        }
        syn::UseTree::Name(n) => {
            let mut path = prefix.clone();
            path.push(n.ident.to_string());
            out.push(path);
        }
        syn::UseTree::Rename(r) => {
            let mut path = prefix.clone();
            path.push(r.ident.to_string());
            out.push(path);
        }
        syn::UseTree::Glob(_) => {
            out.push(prefix.clone());
        }
        syn::UseTree::Group(g) => {
            for item in &g.items {
                flatten_use(item, prefix, out);
            }
        }
    }
}

fn path_to_string(path: &syn::Path) -> String {
    path.segments
        .iter()
        .map(|s| s.ident.to_string())
        .collect::<Vec<_>>()
        .join("::")
}

fn is_spawn_callee(callee: &str) -> bool {
    let last = callee.rsplit("::").next().unwrap_or(callee);
    matches!(last, "spawn" | "spawn_blocking" | "spawn_local")
}

/// Parameter types that count as accepting cancellation.
fn is_cancellation_type(ty: &str) -> bool {
    ty.contains("CancellationToken")
        || ty.contains("CancelToken")
        || ty.contains("Context")
        || ty.contains("StopSignal")
}

impl<'ast> Visit<'ast> for Extractor {
    fn visit_item_use(&mut self, item: &'ast syn::ItemUse) {
        let line = item.span().start().line;
        let mut paths = Vec::new();
        flatten_use(&item.tree, &mut Vec::new(), &mut paths);
        for segments in paths {
            if let Some(prefix) = import_prefix(&segments) {
                self.record_import(prefix, line);
            }
        }
        syn::visit::visit_item_use(self, item);
    }

    fn visit_item_extern_crate(&mut self, item: &'ast syn::ItemExternCrate) {
        let line = item.span().start().line;
        self.record_import(item.ident.to_string(), line);
        syn::visit::visit_item_extern_crate(self, item);
    }

    fn visit_item_fn(&mut self, item: &'ast syn::ItemFn) {
        let line = item.span().start().line;
        self.out.functions += 1;
        self.scope.push(line);

        if item.sig.unsafety.is_some() {
            self.out.unsafe_lines.push(line);
            self.out
                .facts
                .push(Fact::new("ast_unsafe", vec![Term::Int(line as i64)]));
        }
        if item.sig.abi.is_some() || item.attrs.iter().any(|a| a.path().is_ident("no_mangle")) {
            self.out.extern_native_lines.push(line);
            self.out
                .facts
                .push(Fact::new("ast_extern_native", vec![Term::Int(line as i64)]));
        }
        for input in &item.sig.inputs {
            if let syn::FnArg::Typed(pat) = input {
                let ty = type_name_of(&pat.ty);
                if is_cancellation_type(&ty) {
                    self.mark_cancellation();
                }
            }
        }

        syn::visit::visit_item_fn(self, item);
        self.scope.pop();
    }

    fn visit_item_foreign_mod(&mut self, item: &'ast syn::ItemForeignMod) {
        let line = item.span().start().line;
        self.out.extern_native_lines.push(line);
        self.out
            .facts
            .push(Fact::new("ast_extern_native", vec![Term::Int(line as i64)]));
        syn::visit::visit_item_foreign_mod(self, item);
    }

    fn visit_expr_unsafe(&mut self, expr: &'ast syn::ExprUnsafe) {
        let line = expr.span().start().line;
        self.out.unsafe_lines.push(line);
        self.out
            .facts
            .push(Fact::new("ast_unsafe", vec![Term::Int(line as i64)]));
        syn::visit::visit_expr_unsafe(self, expr);
    }

    fn visit_expr_call(&mut self, expr: &'ast syn::ExprCall) {
        if let syn::Expr::Path(p) = expr.func.as_ref() {
            let line = expr.span().start().line;
            self.record_call(path_to_string(&p.path), line);
        }
        syn::visit::visit_expr_call(self, expr);
    }

    fn visit_expr_method_call(&mut self, expr: &'ast syn::ExprMethodCall) {
        let line = expr.span().start().line;
        let method = expr.method.to_string();
        if method == "is_cancelled" || method == "cancelled" {
            self.mark_cancellation();
        }
        self.record_call(method, line);
        syn::visit::visit_expr_method_call(self, expr);
    }

    fn visit_macro(&mut self, mac: &'ast syn::Macro) {
        let line = mac.span().start().line;
        if let Some(last) = mac.path.segments.last() {
            self.record_macro(last.ident.to_string(), line);
        }
        syn::visit::visit_macro(self, mac);
    }

    fn visit_local(&mut self, local: &'ast syn::Local) {
        if let syn::Pat::Ident(ident) = &local.pat {
            if let Some(init) = &local.init {
                if matches!(init.expr.as_ref(), syn::Expr::Lit(_)) {
                    let line = local.span().start().line;
                    let name = ident.ident.to_string();
                    self.out.facts.push(Fact::new(
                        "ast_assignment",
                        vec![Term::str(name.clone()), Term::Int(line as i64)],
                    ));
                    self.out.assignments.entry(name).or_default().push(line);
                }
            }
        }
        syn::visit::visit_local(self, local);
    }
}

fn type_name_of(ty: &syn::Type) -> String {
    match ty {
        syn::Type::Path(p) => path_to_string(&p.path),
        syn::Type::Reference(r) => type_name_of(&r.elem),
        _ => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_import_prefixes() {
        let facts = extract(
            r#"
            use std::process::Command;
            use std::collections::HashMap;
            use serde_json::Value;
            "#,
        )
        .unwrap();
        assert!(facts.imports.contains_key("std::process"));
        assert!(facts.imports.contains_key("std::collections"));
        assert!(facts.imports.contains_key("serde_json"));
        assert_eq!(facts.imports_examined(), 3);
    }

    #[test]
    fn grouped_use_trees_are_flattened() {
        let facts = extract("use std::{fs::File, io::Read};").unwrap();
        assert!(facts.imports.contains_key("std::fs"));
        assert!(facts.imports.contains_key("std::io"));
    }

    #[test]
    fn extracts_calls_macros_and_panics() {
        let facts = extract(
            r#"
            pub fn run(input: &str) -> Result<String, String> {
                let n: i64 = input.parse().map_err(|_| "bad".to_string())?;
                if n < 0 {
                    panic!("negative");
                }
                Ok(n.to_string())
            }
            "#,
        )
        .unwrap();
        assert!(facts.macros.contains_key("panic"));
        assert!(facts.calls.contains_key("parse"));
        assert!(facts.calls_examined() >= 3);
    }

    #[test]
    fn spawn_without_cancellation_is_visible() {
        let facts = extract(
            r#"
            pub fn run(input: &str) -> Result<String, String> {
                std::thread::spawn(move || loop {});
                Ok(String::new())
            }
            "#,
        )
        .unwrap();
        assert_eq!(facts.spawns.len(), 1);
        assert!(facts
            .facts
            .iter()
            .all(|f| f.predicate != "ast_uses_context_cancellation"));
    }

    #[test]
    fn cancellation_parameter_marks_the_scope() {
        let facts = extract(
            r#"
            pub fn run(token: CancellationToken, input: &str) -> Result<String, String> {
                std::thread::spawn(move || loop {});
                Ok(String::new())
            }
            "#,
        )
        .unwrap();
        let spawn_scope = facts
            .facts
            .iter()
            .find(|f| f.predicate == "ast_task_spawn")
            .and_then(|f| f.args.get(1).and_then(|t| t.as_int()))
            .unwrap();
        assert!(facts.facts.iter().any(|f| {
            f.predicate == "ast_uses_context_cancellation"
                && f.args[0].as_int() == Some(spawn_scope)
        }));
    }

    #[test]
    fn unsafe_and_extern_are_recorded() {
        let facts = extract(
            r#"
            extern "C" { fn strlen(s: *const u8) -> usize; }
            pub fn run(input: &str) -> Result<String, String> {
                let p = input.as_ptr();
                let n = unsafe { strlen(p) };
                Ok(n.to_string())
            }
            "#,
        )
        .unwrap();
        assert_eq!(facts.extern_native_lines.len(), 1);
        assert_eq!(facts.unsafe_lines.len(), 1);
    }

    #[test]
    fn literal_assignments_are_indexed() {
        let facts = extract(
            r#"
            pub fn run(input: &str) -> Result<String, String> {
                let api_key = "sk-123456";
                Ok(api_key.to_string())
            }
            "#,
        )
        .unwrap();
        assert!(facts.assignments.contains_key("api_key"));
    }

    #[test]
    fn garbage_is_a_parse_error() {
        let err = extract("this is not rust at all {{{").unwrap_err();
        assert!(matches!(err, EngineError::Parse(_)));
    }
}
