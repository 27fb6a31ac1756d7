//! Tag allocation and tag-stack interning.
//!
//! A tag is a small integer naming a variant (`Ok`, `Err`, `Some`). Applying
//! a tag to a value pushes onto the value's tag stack; stacks are interned,
//! so two structurally identical stacks always share one id and
//! [`TagTable::same`] is integer equality. `Some(None)` therefore stays
//! distinct from `None`, and pushing the same tag onto equal stacks twice
//! returns the same interned id.
//!
//! Each tag also carries a method table, consulted by method dispatch when
//! the receiver's top tag matches.

use ahash::AHashMap;

use crate::{intern::StringId, value::Value};

/// A tag id. Zero is never a real tag (it marks the empty stack root).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct TagId(pub u32);

/// An interned tag stack id. Zero is the empty stack.
pub type TagStack = u32;

#[derive(Debug)]
struct StackNode {
    /// Topmost tag of this stack (0 for the root).
    tag: u32,
    /// The stack below the top.
    next: TagStack,
    /// Interning links: tag pushed on this stack -> resulting stack.
    links: Vec<(u32, TagStack)>,
}

/// All tags and interned tag stacks in a program.
#[derive(Debug)]
pub struct TagTable {
    nodes: Vec<StackNode>,
    names: Vec<StringId>,
    methods: Vec<AHashMap<StringId, Value>>,
}

impl TagTable {
    #[must_use]
    pub fn new() -> Self {
        Self {
            nodes: vec![StackNode {
                tag: 0,
                next: 0,
                links: Vec::new(),
            }],
            names: Vec::new(),
            methods: Vec::new(),
        }
    }

    /// Allocates a fresh tag named `name`.
    pub fn new_tag(&mut self, name: StringId) -> TagId {
        self.names.push(name);
        self.methods.push(AHashMap::new());
        TagId(u32::try_from(self.names.len()).expect("tag count exceeds u32"))
    }

    #[must_use]
    pub fn name(&self, tag: TagId) -> StringId {
        self.names[(tag.0 - 1) as usize]
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.names.len()
    }

    /// Pushes `tag` onto stack `n`, interning the result.
    pub fn push(&mut self, n: TagStack, tag: TagId) -> TagStack {
        if let Some(&(_, existing)) = self.nodes[n as usize].links.iter().find(|&&(t, _)| t == tag.0) {
            return existing;
        }
        let id = u32::try_from(self.nodes.len()).expect("tag stack count exceeds u32");
        self.nodes.push(StackNode {
            tag: tag.0,
            next: n,
            links: Vec::new(),
        });
        self.nodes[n as usize].links.push((tag.0, id));
        id
    }

    /// The stack under the top tag of `n`.
    #[must_use]
    pub fn pop(&self, n: TagStack) -> TagStack {
        self.nodes[n as usize].next
    }

    /// The top tag of stack `n`, or `None` for the empty stack.
    #[must_use]
    pub fn first(&self, n: TagStack) -> Option<TagId> {
        let t = self.nodes[n as usize].tag;
        (t != 0).then_some(TagId(t))
    }

    /// Structural equality of two stacks. Interning makes this integer
    /// comparison.
    #[must_use]
    pub fn same(&self, a: TagStack, b: TagStack) -> bool {
        a == b
    }

    /// Wraps `s` in the tag labels of `stack`: `Some(Ok(s))`.
    #[must_use]
    pub fn wrap(&self, interns: &crate::intern::Interns, s: &str, stack: TagStack) -> String {
        let mut labels = Vec::new();
        let mut cur = stack;
        while let Some(tag) = self.first(cur) {
            labels.push(interns.get(self.name(tag)).to_string());
            cur = self.pop(cur);
        }
        let mut out = String::new();
        for label in &labels {
            out.push_str(label);
            out.push('(');
        }
        out.push_str(s);
        for _ in &labels {
            out.push(')');
        }
        out
    }

    pub fn add_method(&mut self, tag: TagId, name: StringId, f: Value) {
        self.methods[(tag.0 - 1) as usize].insert(name, f);
    }

    #[must_use]
    pub fn lookup_method(&self, tag: TagId, name: StringId) -> Option<Value> {
        self.methods[(tag.0 - 1) as usize].get(&name).copied()
    }

    /// All method values registered on `tag` (GC roots).
    #[must_use]
    pub fn methods_of(&self, tag: TagId) -> Vec<Value> {
        self.methods[(tag.0 - 1) as usize].values().copied().collect()
    }
}

impl Default for TagTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intern::Interns;

    #[test]
    fn push_is_interned() {
        let mut interns = Interns::new();
        let mut tags = TagTable::new();
        let some = tags.new_tag(interns.intern("Some"));
        let ok = tags.new_tag(interns.intern("Ok"));

        let a = tags.push(0, some);
        let b = tags.push(0, some);
        assert_eq!(a, b);

        let nested = tags.push(a, ok);
        let nested2 = tags.push(b, ok);
        assert!(tags.same(nested, nested2));
        assert_ne!(nested, a);

        assert_eq!(tags.first(nested), Some(ok));
        assert_eq!(tags.pop(nested), a);
    }

    #[test]
    fn wrap_renders_nested_labels() {
        let mut interns = Interns::new();
        let mut tags = TagTable::new();
        let some = tags.new_tag(interns.intern("Some"));
        let ok = tags.new_tag(interns.intern("Ok"));
        let inner = tags.push(0, some);
        let stack = tags.push(inner, ok);
        assert_eq!(tags.wrap(&interns, "1", stack), "Ok(Some(1))");
    }
}
