//! Lexical scopes, symbols, and closure capture bookkeeping.
//!
//! Scopes form a tree; some scopes are function boundaries. Every symbol
//! owns a slot in its enclosing function's frame (or a global slot when the
//! enclosing function is a module top level). When an identifier resolves
//! across a function boundary, the symbol is threaded through each
//! intermediate function's capture list, recording at every level where the
//! captured cell comes from in the parent frame. The emitted function header
//! reads this list to build closures at runtime.
//!
//! Namespaces are a separate, parallel hierarchy governing public visibility
//! and qualified lookup; see [`Namespaces`].

use ahash::AHashMap;

use crate::{ast::Expr, location::Span};

/// Index of a symbol in the [`Scopes`] arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct SymbolId(pub u32);

/// Index of a scope in the [`Scopes`] arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct ScopeId(pub u32);

/// Index of a namespace in the [`Namespaces`] arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct NamespaceId(pub u32);

/// How a resolved identifier is reached from the referencing function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// Slot in the current frame.
    Local(u32),
    /// Slot in the process-wide globals vector.
    Global(u32),
    /// Index into the current closure's capture environment.
    Capture(u32),
}

/// Where a captured cell comes from in the parent function's frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum CaptureSrc {
    /// The parent's local slot (which holds a cell, since it is captured).
    Local(u32),
    /// The parent's own capture environment.
    Capture(u32),
}

/// One entry in a function scope's capture list.
#[derive(Debug, Clone, Copy)]
pub struct CaptureRec {
    pub sym: SymbolId,
    pub src: CaptureSrc,
}

/// A declared name.
#[derive(Debug)]
pub struct Symbol {
    pub name: String,
    pub id: SymbolId,
    /// Slot in the owning function's frame, or global slot when `global`.
    pub slot: u32,
    pub scope: ScopeId,
    pub decl: Span,
    pub global: bool,
    pub public: bool,
    pub const_: bool,
    pub macro_: bool,
    pub fun_macro: bool,
    /// Set when any inner function captures this symbol; celled at runtime.
    pub captured: bool,
    pub type_var: bool,
    /// Tag id, for symbols naming a tag.
    pub tag: Option<u32>,
    /// Class id, for symbols naming a class.
    pub class: Option<u32>,
    /// Declared type constraint (`x: T`, `set_type`), unchecked at runtime.
    pub ty: Option<Expr>,
}

/// A lexical scope.
#[derive(Debug)]
pub struct Scope {
    pub parent: Option<ScopeId>,
    /// The nearest enclosing function-boundary scope (itself, when it is one).
    pub function: ScopeId,
    pub is_function: bool,
    /// Set on module top-level scopes (and the builtin scope): symbols
    /// declared here live in the process-wide globals vector, not a frame.
    pub is_global: bool,
    /// Set on imported module scopes: only public symbols resolve.
    pub external: bool,
    table: AHashMap<String, SymbolId>,
    pub owned: Vec<SymbolId>,
    /// Only on function scopes: captured symbols in environment order.
    pub captures: Vec<CaptureRec>,
    /// Only on function scopes: next free frame slot.
    next_slot: u32,
}

/// Arena of scopes and symbols for a whole compilation (all modules).
#[derive(Debug, Default)]
pub struct Scopes {
    scopes: Vec<Scope>,
    symbols: Vec<Symbol>,
    global_count: u32,
}

impl Scopes {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a scope. A scope with no parent is a module top level: it is a
    /// function boundary whose symbols are globals.
    pub fn new_scope(&mut self, parent: Option<ScopeId>, is_function: bool) -> ScopeId {
        let id = ScopeId(u32::try_from(self.scopes.len()).expect("scope count exceeds u32"));
        let function = if is_function || parent.is_none() {
            id
        } else {
            self.scopes[parent.expect("non-function scope has a parent").0 as usize].function
        };
        self.scopes.push(Scope {
            parent,
            function,
            is_function: is_function || parent.is_none(),
            is_global: parent.is_none(),
            external: false,
            table: AHashMap::new(),
            owned: Vec::new(),
            captures: Vec::new(),
            next_slot: 0,
        });
        id
    }

    /// Creates a module top-level scope: a function boundary whose symbols
    /// are globals.
    pub fn new_module_scope(&mut self, parent: Option<ScopeId>) -> ScopeId {
        let id = self.new_scope(parent, true);
        self.scopes[id.0 as usize].is_global = true;
        id
    }

    #[must_use]
    pub fn scope(&self, id: ScopeId) -> &Scope {
        &self.scopes[id.0 as usize]
    }

    pub fn scope_mut(&mut self, id: ScopeId) -> &mut Scope {
        &mut self.scopes[id.0 as usize]
    }

    #[must_use]
    pub fn symbol(&self, id: SymbolId) -> &Symbol {
        &self.symbols[id.0 as usize]
    }

    pub fn symbol_mut(&mut self, id: SymbolId) -> &mut Symbol {
        &mut self.symbols[id.0 as usize]
    }

    /// Marks a module scope external, so only public symbols resolve through
    /// it.
    pub fn set_external(&mut self, id: ScopeId) {
        self.scopes[id.0 as usize].external = true;
    }

    /// Is the module top level the owning function of `scope`?
    #[must_use]
    pub fn is_global_scope(&self, scope: ScopeId) -> bool {
        let f = self.scopes[scope.0 as usize].function;
        self.scopes[f.0 as usize].is_global
    }

    /// Declares `name` in `scope`.
    ///
    /// Re-declaration in the same scope is rejected, except for the anonymous
    /// `_`, which always gets a fresh symbol.
    pub fn add(&mut self, scope: ScopeId, name: &str, decl: Span) -> Result<SymbolId, String> {
        if name != "_" && self.scopes[scope.0 as usize].table.contains_key(name) {
            return Err(format!("redeclaration of '{name}'"));
        }
        Ok(self.add_unchecked(scope, name, decl))
    }

    /// Declares `name` without the re-declaration check (builtins, internal
    /// temporaries).
    pub fn add_unchecked(&mut self, scope: ScopeId, name: &str, decl: Span) -> SymbolId {
        let id = SymbolId(u32::try_from(self.symbols.len()).expect("symbol count exceeds u32"));
        let global = self.is_global_scope(scope);
        let slot = if global {
            let s = self.global_count;
            self.global_count += 1;
            s
        } else {
            let f = self.scopes[scope.0 as usize].function;
            let fs = &mut self.scopes[f.0 as usize];
            let s = fs.next_slot;
            fs.next_slot += 1;
            s
        };
        self.symbols.push(Symbol {
            name: name.to_string(),
            id,
            slot,
            scope,
            decl,
            global,
            public: false,
            const_: false,
            macro_: false,
            fun_macro: false,
            captured: false,
            type_var: false,
            tag: None,
            class: None,
            ty: None,
        });
        self.scopes[scope.0 as usize].table.insert(name.to_string(), id);
        self.scopes[scope.0 as usize].owned.push(id);
        id
    }

    /// Makes an existing symbol visible in `scope` under `name` (imports,
    /// `use`). No new slot is allocated.
    pub fn insert_alias(&mut self, scope: ScopeId, name: &str, sym: SymbolId) -> Result<(), String> {
        if self.scopes[scope.0 as usize].table.contains_key(name) {
            return Err(format!("redeclaration of '{name}'"));
        }
        self.scopes[scope.0 as usize].table.insert(name.to_string(), sym);
        Ok(())
    }

    /// Looks `name` up in `scope` and its ancestors.
    ///
    /// External (imported-module) scopes only yield public symbols.
    #[must_use]
    pub fn lookup(&self, scope: ScopeId, name: &str) -> Option<SymbolId> {
        let mut cur = Some(scope);
        while let Some(id) = cur {
            let s = &self.scopes[id.0 as usize];
            if let Some(&sym) = s.table.get(name) {
                if !s.external || self.symbols[sym.0 as usize].public {
                    return Some(sym);
                }
            }
            cur = s.parent;
        }
        None
    }

    /// True only in the scope that declares `name`.
    #[must_use]
    pub fn locally_defined(&self, scope: ScopeId, name: &str) -> bool {
        self.scopes[scope.0 as usize].table.contains_key(name)
    }

    /// Total number of frame slots the function scope `f` needs.
    #[must_use]
    pub fn frame_size(&self, f: ScopeId) -> u32 {
        self.scopes[f.0 as usize].next_slot
    }

    /// Number of global slots allocated so far.
    #[must_use]
    pub fn global_count(&self) -> u32 {
        self.global_count
    }

    /// Local slots of function scope `f` that must be celled (captured by an
    /// inner function), in ascending order.
    #[must_use]
    pub fn cell_slots(&self, f: ScopeId) -> Vec<u32> {
        let mut slots: Vec<u32> = self
            .symbols
            .iter()
            .filter(|s| s.captured && !s.global && self.scopes[s.scope.0 as usize].function == f)
            .map(|s| s.slot)
            .collect();
        slots.sort_unstable();
        slots.dedup();
        slots
    }

    /// The capture list of function scope `f`, in environment order.
    #[must_use]
    pub fn captures(&self, f: ScopeId) -> &[CaptureRec] {
        &self.scopes[f.0 as usize].captures
    }

    /// Computes how `sym` is accessed from code in `from`, recording capture
    /// chains through every intermediate function boundary.
    pub fn access(&mut self, from: ScopeId, sym: SymbolId) -> Access {
        let symbol = &self.symbols[sym.0 as usize];
        if symbol.global {
            return Access::Global(symbol.slot);
        }

        let sym_fn = self.scopes[symbol.scope.0 as usize].function;
        let cur_fn = self.scopes[from.0 as usize].function;
        if sym_fn == cur_fn {
            return Access::Local(symbol.slot);
        }

        // Collect the function boundaries between the declaring function and
        // the referencing one, innermost last.
        let mut chain = Vec::new();
        let mut f = cur_fn;
        loop {
            chain.push(f);
            let Some(parent) = self.scopes[f.0 as usize].parent else {
                break;
            };
            let parent_fn = self.scopes[parent.0 as usize].function;
            if parent_fn == sym_fn {
                break;
            }
            f = parent_fn;
        }
        chain.reverse();

        self.symbols[sym.0 as usize].captured = true;

        let mut src = CaptureSrc::Local(self.symbols[sym.0 as usize].slot);
        let mut idx = 0;
        for f in chain {
            idx = self.capture_into(f, sym, src);
            src = CaptureSrc::Capture(idx);
        }
        Access::Capture(idx)
    }

    fn capture_into(&mut self, f: ScopeId, sym: SymbolId, src: CaptureSrc) -> u32 {
        let caps = &mut self.scopes[f.0 as usize].captures;
        if let Some(i) = caps.iter().position(|c| c.sym == sym) {
            return u32::try_from(i).expect("capture count exceeds u32");
        }
        caps.push(CaptureRec { sym, src });
        u32::try_from(caps.len() - 1).expect("capture count exceeds u32")
    }
}

/// A namespace: the unit of qualified lookup and public visibility,
/// orthogonal to lexical scoping.
#[derive(Debug)]
pub struct Namespace {
    pub name: String,
    pub parent: Option<NamespaceId>,
    pub pub_: bool,
    pub symbols: AHashMap<String, SymbolId>,
    pub children: AHashMap<String, NamespaceId>,
}

/// Arena of namespaces.
#[derive(Debug, Default)]
pub struct Namespaces {
    list: Vec<Namespace>,
}

impl Namespaces {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&mut self, name: &str, parent: Option<NamespaceId>, pub_: bool) -> NamespaceId {
        let id = NamespaceId(u32::try_from(self.list.len()).expect("namespace count exceeds u32"));
        self.list.push(Namespace {
            name: name.to_string(),
            parent,
            pub_,
            symbols: AHashMap::new(),
            children: AHashMap::new(),
        });
        if let Some(p) = parent {
            self.list[p.0 as usize].children.insert(name.to_string(), id);
        }
        id
    }

    /// The root namespace, once one has been created.
    #[must_use]
    pub fn root(&self) -> Option<NamespaceId> {
        (!self.list.is_empty()).then_some(NamespaceId(0))
    }

    #[must_use]
    pub fn get(&self, id: NamespaceId) -> &Namespace {
        &self.list[id.0 as usize]
    }

    pub fn get_mut(&mut self, id: NamespaceId) -> &mut Namespace {
        &mut self.list[id.0 as usize]
    }

    /// Resolves a `/`-separated path of child namespaces under `root`.
    #[must_use]
    pub fn resolve_path(&self, root: NamespaceId, path: &str) -> Option<NamespaceId> {
        let mut cur = root;
        for part in path.split('/') {
            cur = *self.list[cur.0 as usize].children.get(part)?;
        }
        Some(cur)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn span() -> Span {
        Span::default()
    }

    #[test]
    fn lookup_finds_added_symbol() {
        let mut scopes = Scopes::new();
        let root = scopes.new_scope(None, true);
        let sym = scopes.add(root, "x", span()).unwrap();
        assert_eq!(scopes.lookup(root, "x"), Some(sym));
        assert!(scopes.locally_defined(root, "x"));
    }

    #[test]
    fn locally_defined_only_in_declaring_scope() {
        let mut scopes = Scopes::new();
        let root = scopes.new_scope(None, true);
        let inner = scopes.new_scope(Some(root), false);
        scopes.add(root, "x", span()).unwrap();
        assert!(scopes.locally_defined(root, "x"));
        assert!(!scopes.locally_defined(inner, "x"));
        assert!(scopes.lookup(inner, "x").is_some());
    }

    #[test]
    fn redeclaration_rejected_except_underscore() {
        let mut scopes = Scopes::new();
        let root = scopes.new_scope(None, true);
        scopes.add(root, "x", span()).unwrap();
        assert!(scopes.add(root, "x", span()).is_err());
        scopes.add(root, "_", span()).unwrap();
        scopes.add(root, "_", span()).unwrap();
    }

    #[test]
    fn capture_chain_through_two_functions() {
        let mut scopes = Scopes::new();
        let root = scopes.new_scope(None, true);
        let outer = scopes.new_scope(Some(root), true);
        let inner = scopes.new_scope(Some(outer), true);
        let innermost = scopes.new_scope(Some(inner), true);

        let n = scopes.add(outer, "n", span()).unwrap();
        let access = scopes.access(innermost, n);
        assert_eq!(access, Access::Capture(0));
        assert!(scopes.symbol(n).captured);

        // The intermediate function captures from the declaring frame's
        // local slot; the innermost from the intermediate's environment.
        assert_eq!(scopes.captures(inner)[0].src, CaptureSrc::Local(scopes.symbol(n).slot));
        assert_eq!(scopes.captures(innermost)[0].src, CaptureSrc::Capture(0));
    }

    #[test]
    fn globals_resolve_without_capture() {
        let mut scopes = Scopes::new();
        let root = scopes.new_scope(None, true);
        let f = scopes.new_scope(Some(root), true);
        let g = scopes.add(root, "g", span()).unwrap();
        assert!(matches!(scopes.access(f, g), Access::Global(_)));
        assert!(!scopes.symbol(g).captured);
    }
}
