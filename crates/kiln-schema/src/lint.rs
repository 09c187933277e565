//! Pre-flight signature lint.
//!
//! A null default on a non-optional input is ambiguous: the field looks
//! filled-in but produces a value of the wrong type at call time. The lint
//! rejects the signature before the inspector builds a descriptor, rendering
//! the offending declaration with its neighbors and a caret.

use std::fmt::Write as _;

use thiserror::Error;

use crate::types::{Declared, InputDecl, Signature};

#[derive(Debug, Error)]
#[error("{message}")]
pub struct LintError {
    message: String,
}

/// Reject any non-optional input declared with `default = null`.
pub fn lint_signature(sig: &Signature) -> Result<(), LintError> {
    let hits: Vec<usize> = sig
        .inputs
        .iter()
        .enumerate()
        .filter(|(_, decl)| is_ambiguous_null_default(decl))
        .map(|(i, _)| i)
        .collect();

    if hits.is_empty() {
        return Ok(());
    }

    let mut message = String::new();
    for i in &hits {
        let decl = &sig.inputs[*i];
        let _ = writeln!(
            message,
            "error: ambiguous null default for input `{}`",
            decl.name
        );
        render_context(&mut message, &sig.inputs, *i);
    }
    let _ = writeln!(message);
    let _ = writeln!(message, "A null default without an optional type is ambiguous.");
    let _ = writeln!(message, "Declare the input type as optional instead, for example:");
    let first = &sig.inputs[hits[0]];
    let _ = writeln!(message, "-    {}", render_decl(first));
    let _ = writeln!(
        message,
        "+    {}: optional<{}>  (optional implies a null default)",
        first.name,
        render_declared(&first.declared)
    );

    Err(LintError { message })
}

fn is_ambiguous_null_default(decl: &InputDecl) -> bool {
    !matches!(decl.declared, Declared::Optional(_))
        && decl.opts.default.as_ref().is_some_and(|d| d.is_null())
}

/// Render the offending declaration with its surrounding declarations and a
/// caret under the null default.
fn render_context(out: &mut String, inputs: &[InputDecl], hit: usize) {
    let start = hit.saturating_sub(1);
    let end = (hit + 1).min(inputs.len() - 1);
    let width = (end + 1).to_string().len() + 1;

    for (i, decl) in inputs.iter().enumerate().take(end + 1).skip(start) {
        let line = render_decl(decl);
        let _ = writeln!(out, "{:<width$} |     {line}", i + 1, width = width);
        if i == hit {
            let marker = "default = null";
            let col = line.find(marker).unwrap_or(0);
            let _ = writeln!(
                out,
                "{:<width$} |     {}{}",
                "",
                " ".repeat(col),
                "^".repeat(marker.len()),
                width = width
            );
        }
    }
}

fn render_decl(decl: &InputDecl) -> String {
    let ty = render_declared(&decl.declared);
    match decl.opts.default {
        Some(ref d) if d.is_null() => format!("{}: {} = Input(default = null)", decl.name, ty),
        Some(ref d) => format!("{}: {} = Input(default = {})", decl.name, ty, d),
        None => format!("{}: {}", decl.name, ty),
    }
}

fn render_declared(d: &Declared) -> String {
    match d {
        Declared::Bool => "bool".into(),
        Declared::Float => "float".into(),
        Declared::Integer => "integer".into(),
        Declared::String => "string".into(),
        Declared::Path => "path".into(),
        Declared::Secret => "secret".into(),
        Declared::Custom(name) => (*name).to_string(),
        Declared::Optional(inner) => format!("optional<{}>", render_declared(inner)),
        Declared::List(inner) => format!("list<{}>", render_declared(inner)),
    }
}
