//! Typed error categories and caret-style diagnostic rendering.
//!
//! Every stage reports failures as a [`Diagnostic`]: a category, a span, a
//! message, and the chain of module inclusions that led to the offending
//! source. Rendering quotes the offending line and points a caret at the
//! start of the span, with ANSI color when the consumer asks for it.

use std::fmt;

use crate::location::{SourceMap, Span};

/// Which stage produced a diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::IntoStaticStr, serde::Serialize, serde::Deserialize)]
pub enum ErrorKind {
    /// Lexical error: malformed token, unterminated literal, bad regex.
    SyntaxError,
    /// Parse error: structure the grammar rejects.
    ParseError,
    /// Compile error: scope conflicts, bad lvalues, unknown modules.
    CompileError,
    /// Runtime error that escaped every handler.
    RuntimeError,
}

/// Result alias used by stages that fail with a [`Diagnostic`].
pub type DiagResult<T> = Result<T, Diagnostic>;

/// A rendered-on-demand error: category, primary span, message, and the
/// import chain (outermost module first).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Diagnostic {
    pub kind: ErrorKind,
    pub span: Span,
    pub message: String,
    /// Spans of the `import` statements through which the failing module was
    /// reached, outermost first. Empty for the entry module.
    pub include_chain: Vec<Span>,
}

impl Diagnostic {
    #[must_use]
    pub fn new(kind: ErrorKind, span: Span, message: impl Into<String>) -> Self {
        Self {
            kind,
            span,
            message: message.into(),
            include_chain: Vec::new(),
        }
    }

    /// Prepends an import site to the inclusion chain.
    #[must_use]
    pub fn included_from(mut self, site: Span) -> Self {
        self.include_chain.insert(0, site);
        self
    }

    /// Renders the diagnostic with source context.
    ///
    /// Output shape (colors elided):
    ///
    /// ```text
    /// SyntaxError example.ty:3:7: unterminated string literal
    ///
    ///     near: let s = 'abc
    ///                   ^
    /// ```
    #[must_use]
    pub fn render(&self, sources: &SourceMap, color: bool) -> String {
        let mut out = String::new();
        for site in &self.include_chain {
            out.push_str(&format!(
                "{}in module included from {}:{}\n",
                paint(color, "34"),
                sources.name(site.src),
                site.start,
            ));
            if color {
                out.push_str("\x1b[0m");
            }
        }

        out.push_str(&format!(
            "{}{}{} {}{}:{}{}: {}",
            paint(color, "1;31"),
            self.kind,
            paint(color, "0"),
            paint(color, "34"),
            sources.name(self.span.src),
            self.span.start,
            paint(color, "0"),
            self.message,
        ));

        if !self.span.synthetic {
            let line = sources.line_at(self.span.src, self.span.start);
            out.push_str(&format!("\n\n\tnear: {line}\n"));
            let pad = " ".repeat(6 + self.span.start.col as usize);
            out.push_str(&format!("\t{pad}{}^{}", paint(color, "31"), paint(color, "0")));
        }

        out
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

fn paint(color: bool, code: &str) -> String {
    if color { format!("\x1b[{code}m") } else { String::new() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::location::{Location, SourceMap};

    #[test]
    fn render_points_at_span_start() {
        let mut map = SourceMap::new();
        let id = map.add("t.ty", "let x = @\n");
        let span = Span::new(id, Location::new(0, 8, 8), Location::new(0, 9, 9));
        let diag = Diagnostic::new(ErrorKind::SyntaxError, span, "unexpected character");
        let rendered = diag.render(&map, false);
        assert!(rendered.contains("t.ty:1:9"));
        assert!(rendered.contains("near: let x = @"));
        assert!(rendered.lines().last().unwrap().contains('^'));
    }
}
