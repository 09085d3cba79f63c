//! Entry-point discovery.
//!
//! Statically locates the function the harness (and the compiled
//! wrapper) should invoke: a public function taking the input string
//! and returning a `Result`. Candidates are scored by exported-ness,
//! parameter shape, return arity, and name hints; `main`, initializers,
//! tests, benchmarks, and registration helpers are excluded.

use crate::error::{EngineError, EngineResult};
use syn::spanned::Spanned;

/// How the entry takes its input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputStyle {
    /// `fn f(input: &str)`
    Borrowed,
    /// `fn f(input: String)`
    Owned,
}

#[derive(Debug, Clone)]
pub struct EntryPoint {
    pub name: String,
    pub input_style: InputStyle,
    pub line: usize,
    pub score: i32,
}

/// Names never considered as entry points.
fn is_excluded(name: &str) -> bool {
    name == "main"
        || name == "init"
        || name.starts_with("test_")
        || name.starts_with("bench_")
        || name.starts_with("register")
}

/// Name fragments that suggest the function is the operation itself.
const NAME_HINTS: &[&str] = &["execute", "run", "process", "handle"];

/// Find the best entry function in candidate source.
pub fn discover_entry(source: &str) -> EngineResult<EntryPoint> {
    let file = syn::parse_file(source)
        .map_err(|e| EngineError::Parse(format!("candidate source: {}", e)))?;

    let mut best: Option<EntryPoint> = None;
    for item in &file.items {
        let func = match item {
            syn::Item::Fn(f) => f,
            _ => continue,
        };
        let name = func.sig.ident.to_string();
        if is_excluded(&name) {
            continue;
        }
        if func.attrs.iter().any(|a| {
            a.path().is_ident("test") || a.path().is_ident("bench")
        }) {
            continue;
        }

        let (input_style, mut score) = match signature_shape(&func.sig) {
            Some(shape) => shape,
            None => continue,
        };

        if matches!(func.vis, syn::Visibility::Public(_)) {
            score += 3;
        }
        let lower = name.to_lowercase();
        if NAME_HINTS.iter().any(|hint| lower.contains(hint)) {
            score += 2;
        }

        let line = func.span().start().line;
        let candidate = EntryPoint {
            name,
            input_style,
            line,
            score,
        };
        let better = match &best {
            None => true,
            Some(current) => candidate.score > current.score,
        };
        if better {
            best = Some(candidate);
        }
    }

    best.ok_or_else(|| {
        EngineError::Parse(
            "no entry function found: expected a pub fn taking the input string and returning Result"
                .to_string(),
        )
    })
}

/// Accepted shapes: exactly one string-typed parameter, returning a
/// `Result`. Returns the input style plus a shape score.
fn signature_shape(sig: &syn::Signature) -> Option<(InputStyle, i32)> {
    if sig.inputs.len() != 1 {
        return None;
    }
    let arg = match sig.inputs.first()? {
        syn::FnArg::Typed(arg) => arg,
        syn::FnArg::Receiver(_) => return None,
    };

    let input_style = match arg.ty.as_ref() {
        syn::Type::Reference(r) => match r.elem.as_ref() {
            syn::Type::Path(p) if p.path.is_ident("str") => InputStyle::Borrowed,
            _ => return None,
        },
        syn::Type::Path(p) if p.path.is_ident("String") => InputStyle::Owned,
        _ => return None,
    };

    let mut score = 2; // unary string input
    match &sig.output {
        syn::ReturnType::Type(_, ty) => {
            if let syn::Type::Path(p) = ty.as_ref() {
                let last = p.path.segments.last()?;
                if last.ident != "Result" {
                    return None;
                }
                score += 2;
                if let syn::PathArguments::AngleBracketed(args) = &last.arguments {
                    if args.args.len() == 2 {
                        score += 2; // explicit (ok, err) arity
                    }
                }
            } else {
                return None;
            }
        }
        syn::ReturnType::Default => return None,
    }
    if sig.asyncness.is_some() {
        return None; // the harness drives a synchronous call
    }
    Some((input_style, score))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_the_obvious_entry() {
        let entry = discover_entry(
            r#"
            fn helper(n: usize) -> usize { n + 1 }

            pub fn run(input: &str) -> Result<String, String> {
                Ok(input.to_string())
            }
            "#,
        )
        .unwrap();
        assert_eq!(entry.name, "run");
        assert_eq!(entry.input_style, InputStyle::Borrowed);
    }

    #[test]
    fn prefers_exported_and_hinted_names() {
        let entry = discover_entry(
            r#"
            fn transform(input: &str) -> Result<String, String> { Ok(input.into()) }

            pub fn execute_word_count(input: &str) -> Result<String, String> {
                Ok(input.split_whitespace().count().to_string())
            }
            "#,
        )
        .unwrap();
        assert_eq!(entry.name, "execute_word_count");
    }

    #[test]
    fn excludes_main_tests_and_registration() {
        let err = discover_entry(
            r#"
            fn main() {}
            fn register_tool(input: &str) -> Result<String, String> { Ok(input.into()) }
            fn test_things(input: &str) -> Result<String, String> { Ok(input.into()) }
            "#,
        );
        assert!(err.is_err());
    }

    #[test]
    fn owned_string_parameter_is_accepted() {
        let entry = discover_entry(
            "pub fn handle(input: String) -> Result<String, String> { Ok(input) }",
        )
        .unwrap();
        assert_eq!(entry.input_style, InputStyle::Owned);
    }

    #[test]
    fn non_result_returns_are_rejected() {
        assert!(discover_entry("pub fn run(input: &str) -> String { input.to_string() }").is_err());
    }
}
