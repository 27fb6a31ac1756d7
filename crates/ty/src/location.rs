//! Source positions and spans.
//!
//! Every token and AST node carries a half-open `[start, end)` span into the
//! source buffer of the module it came from. Nodes produced by macro
//! expansion are marked synthetic; their positions point at the expansion
//! site rather than into any buffer.

use std::fmt;

/// Identifies one source buffer registered in the [`SourceMap`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, serde::Serialize, serde::Deserialize)]
pub struct SrcId(pub u32);

/// A position within a source buffer.
///
/// `line` and `col` are zero-based; rendering adds one. `offset` is the byte
/// offset, which is what the lexer and the caret renderer actually index by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub struct Location {
    pub line: u32,
    pub col: u32,
    pub offset: u32,
}

impl Location {
    #[must_use]
    pub fn new(line: u32, col: u32, offset: u32) -> Self {
        Self { line, col, offset }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line + 1, self.col + 1)
    }
}

/// A half-open source range plus the buffer it indexes into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub struct Span {
    pub src: SrcId,
    pub start: Location,
    pub end: Location,
    /// Set on nodes spliced in by macro expansion; such spans point at the
    /// expansion site, not at text that reads like the expanded code.
    pub synthetic: bool,
}

impl Span {
    #[must_use]
    pub fn new(src: SrcId, start: Location, end: Location) -> Self {
        Self {
            src,
            start,
            end,
            synthetic: false,
        }
    }

    /// A span covering both `self` and `other`, in that order.
    #[must_use]
    pub fn to(self, other: Span) -> Span {
        Span {
            src: self.src,
            start: self.start,
            end: other.end,
            synthetic: self.synthetic || other.synthetic,
        }
    }

    /// Marks the span as produced by macro expansion.
    #[must_use]
    pub fn as_synthetic(mut self) -> Span {
        self.synthetic = true;
        self
    }
}

/// One registered source buffer.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SourceFile {
    pub name: String,
    pub text: String,
}

/// All source buffers seen by a compilation, indexed by [`SrcId`].
///
/// Diagnostics hold spans rather than text; the map is consulted only when a
/// diagnostic is rendered.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct SourceMap {
    files: Vec<SourceFile>,
}

impl SourceMap {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, name: impl Into<String>, text: impl Into<String>) -> SrcId {
        let id = SrcId(u32::try_from(self.files.len()).expect("source file count exceeds u32"));
        self.files.push(SourceFile {
            name: name.into(),
            text: text.into(),
        });
        id
    }

    #[must_use]
    pub fn get(&self, id: SrcId) -> &SourceFile {
        &self.files[id.0 as usize]
    }

    #[must_use]
    pub fn name(&self, id: SrcId) -> &str {
        &self.files[id.0 as usize].name
    }

    /// The full text of the line containing `loc`, without its newline.
    #[must_use]
    pub fn line_at(&self, id: SrcId, loc: Location) -> &str {
        let text = &self.files[id.0 as usize].text;
        let offset = (loc.offset as usize).min(text.len());
        let start = text[..offset].rfind('\n').map_or(0, |i| i + 1);
        let end = text[offset..].find('\n').map_or(text.len(), |i| offset + i);
        &text[start..end]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_extraction() {
        let mut map = SourceMap::new();
        let id = map.add("test.ty", "let a = 1\nlet b = 2\n");
        let loc = Location::new(1, 4, 14);
        assert_eq!(map.line_at(id, loc), "let b = 2");
    }

    #[test]
    fn span_join() {
        let a = Span::new(SrcId(0), Location::new(0, 0, 0), Location::new(0, 3, 3));
        let b = Span::new(SrcId(0), Location::new(0, 6, 6), Location::new(0, 9, 9));
        let joined = a.to(b);
        assert_eq!(joined.start.offset, 0);
        assert_eq!(joined.end.offset, 9);
    }
}
