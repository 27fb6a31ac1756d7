//! String interning for identifiers, member names, and literals.
//!
//! The interner stores unique strings in a vector and hands out `StringId`
//! indices, so the compiler and VM can compare names by integer and bytecode
//! operands stay fixed-width. It is populated during lexing/compilation and
//! keeps growing at runtime only for dynamically computed member names.

use ahash::AHashMap;

/// Index into the interner's storage.
///
/// `u32` keeps bytecode operands and symbol records small; four billion
/// distinct names is far beyond any real program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, serde::Serialize, serde::Deserialize)]
pub struct StringId(u32);

impl StringId {
    /// Reconstructs a `StringId` from a raw bytecode operand.
    #[inline]
    #[must_use]
    pub fn from_index(index: u32) -> Self {
        Self(index)
    }

    #[inline]
    #[must_use]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Interned string storage.
#[derive(Debug, Default)]
pub struct Interns {
    strings: Vec<Box<str>>,
    index: AHashMap<Box<str>, u32>,
}

impl Interns {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Interns `s`, returning the id of the existing entry when present.
    pub fn intern(&mut self, s: &str) -> StringId {
        if let Some(&id) = self.index.get(s) {
            return StringId(id);
        }
        let id = u32::try_from(self.strings.len()).expect("interner exceeds u32 capacity");
        let boxed: Box<str> = s.into();
        self.strings.push(boxed.clone());
        self.index.insert(boxed, id);
        StringId(id)
    }

    /// Looks up `s` without inserting it.
    #[must_use]
    pub fn lookup(&self, s: &str) -> Option<StringId> {
        self.index.get(s).map(|&id| StringId(id))
    }

    #[must_use]
    pub fn get(&self, id: StringId) -> &str {
        &self.strings[id.index()]
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.strings.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.strings.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intern_is_idempotent() {
        let mut interns = Interns::new();
        let a = interns.intern("map");
        let b = interns.intern("filter");
        let c = interns.intern("map");
        assert_eq!(a, c);
        assert_ne!(a, b);
        assert_eq!(interns.get(a), "map");
        assert_eq!(interns.len(), 2);
    }
}
