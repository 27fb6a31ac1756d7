//! Heap-resident aggregate types: dicts, tuples, closures, generators,
//! objects, ranges, iterators, and the thread-facing handles.
//!
//! Dicts hash their keys through the value model, which needs heap access,
//! so dict operations are free functions taking the heap plus the dict's
//! heap id rather than methods on `Dict`.

use ahash::AHashMap;
use indexmap::IndexMap;

use crate::{
    heap::{Heap, HeapData, HeapId},
    intern::{Interns, StringId},
    value::{ClassId, FunctionId, Value, value_eq, value_hash},
};

/// An open-addressed table of values keyed by value hash, with collision
/// buckets and an optional default returned on missing-key lookup.
#[derive(Debug, Clone, Default)]
pub struct Dict {
    pub buckets: IndexMap<u64, Vec<(Value, Value)>>,
    pub len: usize,
    pub dflt: Option<Value>,
}

/// A fixed-length tuple, optionally with per-slot names.
#[derive(Debug, Clone)]
pub struct Tuple {
    pub items: Vec<Value>,
    pub names: Option<Vec<Option<StringId>>>,
}

/// A closure: compiled function plus its captured environment cells.
#[derive(Debug, Clone)]
pub struct Closure {
    pub fid: FunctionId,
    pub env: Vec<HeapId>,
}

/// A registered scope-exit action carried by call frames (and by suspended
/// generator frames, which is why it lives with the heap types).
#[derive(Debug, Clone, Copy)]
pub enum DeferAction {
    /// Run a zero-argument callable on exit.
    Call(Value),
    /// Run it only when the frame exits by unwinding.
    CallUnwind(Value),
    /// Invoke the value's `drop` method on exit.
    DropValue(Value),
}

impl DeferAction {
    /// The value the GC must keep alive for this action.
    #[must_use]
    pub fn value(&self) -> Value {
        match self {
            DeferAction::Call(v) | DeferAction::CallUnwind(v) | DeferAction::DropValue(v) => *v,
        }
    }
}

/// An exception handler suspended with a generator frame, with its depths
/// recorded relative to the frame's bases so it can be reinstated wherever
/// the generator resumes.
#[derive(Debug, Clone, Copy)]
pub struct SavedHandler {
    pub stack: usize,
    pub sp_saves: usize,
    pub targets: usize,
    pub catch_ip: usize,
    pub finally_ip: usize,
}

/// A suspended frame owned by a generator.
#[derive(Debug, Clone)]
pub struct SavedFrame {
    pub fid: FunctionId,
    pub ip: usize,
    pub locals: Vec<Value>,
    pub env: Vec<HeapId>,
    pub stack: Vec<Value>,
    pub defers: Vec<DeferAction>,
    /// Handlers of try regions still open in this frame, frame-relative.
    pub handlers: Vec<SavedHandler>,
    /// Saved stack positions still open in this frame, relative to its base.
    pub sp_saves: Vec<usize>,
}

/// A generator object: a snapshot of code pointer, stack, and environment.
#[derive(Debug, Clone)]
pub struct Generator {
    pub frame: Option<SavedFrame>,
    pub done: bool,
}

/// A class instance.
#[derive(Debug, Clone)]
pub struct Object {
    pub class: ClassId,
    pub fields: IndexMap<StringId, Value>,
    pub finalizer: Option<Value>,
}

/// A runtime class: name, superclass, method tables, field metadata.
#[derive(Debug, Default)]
pub struct ClassInfo {
    pub name: StringId,
    pub super_: Option<ClassId>,
    pub traits: Vec<ClassId>,
    pub methods: AHashMap<StringId, Value>,
    pub getters: AHashMap<StringId, Value>,
    pub setters: AHashMap<StringId, Value>,
    pub statics: AHashMap<StringId, Value>,
    pub field_names: Vec<StringId>,
    pub field_defaults: Vec<Value>,
    pub is_trait: bool,
}

impl ClassInfo {
    /// Looks `name` up through the class chain (class, then superclasses,
    /// then traits).
    #[must_use]
    pub fn resolve_method(classes: &[ClassInfo], class: ClassId, name: StringId) -> Option<Value> {
        let mut cur = Some(class);
        while let Some(c) = cur {
            let info = &classes[c.0 as usize];
            if let Some(&m) = info.methods.get(&name) {
                return Some(m);
            }
            for &t in &info.traits {
                if let Some(&m) = classes[t.0 as usize].methods.get(&name) {
                    return Some(m);
                }
            }
            cur = info.super_;
        }
        None
    }
}

/// A numeric range value.
#[derive(Debug, Clone, Copy)]
pub struct Range {
    pub lo: Value,
    pub hi: Value,
    pub inclusive: bool,
}

/// Iterator state for for-each loops and the `iter` builtin.
#[derive(Debug, Clone)]
pub enum Iter {
    Array { arr: HeapId, i: usize },
    Tuple { tup: HeapId, i: usize },
    Range { cur: i64, hi: i64, inclusive: bool },
    Str { s: Value, i: usize },
    Dict { dict: HeapId, i: usize },
    Gen { generator: HeapId },
}

/// Handle to a spawned thread.
#[derive(Debug, Clone, Copy)]
pub struct ThreadHandle {
    pub tid: usize,
}

/// Cooperative mutex state, driven under the world lock.
#[derive(Debug, Clone, Copy, Default)]
pub struct MutexState {
    pub locked_by: Option<usize>,
}

/// Cooperative condition variable: waiters watch the generation counter.
#[derive(Debug, Clone, Copy, Default)]
pub struct CondvarState {
    pub generation: u64,
}

/// AST captured as a compile-time value (macro expansion currency).
#[derive(Debug, Clone)]
pub enum AstValue {
    Expr(Box<crate::ast::Expr>),
    Stmt(Box<crate::ast::Stmt>),
}

// ----------------------------------------------------------------------
// Dict operations.
// ----------------------------------------------------------------------

/// Looks `key` up in the dict at `dict`; the default value applies on miss.
#[must_use]
pub fn dict_get(heap: &Heap, interns: &Interns, dict: HeapId, key: &Value) -> Option<Value> {
    let h = value_hash(heap, interns, key);
    let HeapData::Dict(d) = heap.get(dict) else {
        return None;
    };
    if let Some(bucket) = d.buckets.get(&h) {
        for (k, v) in bucket {
            if value_eq(heap, interns, k, key) {
                return Some(*v);
            }
        }
    }
    d.dflt
}

/// True when `key` is present (the default does not count).
#[must_use]
pub fn dict_contains(heap: &Heap, interns: &Interns, dict: HeapId, key: &Value) -> bool {
    let h = value_hash(heap, interns, key);
    let HeapData::Dict(d) = heap.get(dict) else {
        return false;
    };
    d.buckets
        .get(&h)
        .is_some_and(|bucket| bucket.iter().any(|(k, _)| value_eq(heap, interns, k, key)))
}

/// Inserts or replaces `key`.
pub fn dict_insert(heap: &mut Heap, interns: &Interns, dict: HeapId, key: Value, value: Value) {
    let h = value_hash(heap, interns, &key);
    let existing = {
        let HeapData::Dict(d) = heap.get(dict) else {
            return;
        };
        d.buckets
            .get(&h)
            .and_then(|bucket| bucket.iter().position(|(k, _)| value_eq(heap, interns, k, &key)))
    };
    let HeapData::Dict(d) = heap.get_mut(dict) else {
        return;
    };
    let bucket = d.buckets.entry(h).or_default();
    match existing {
        Some(i) => bucket[i].1 = value,
        None => {
            bucket.push((key, value));
            d.len += 1;
        }
    }
}

/// Removes `key`, returning its value.
pub fn dict_remove(heap: &mut Heap, interns: &Interns, dict: HeapId, key: &Value) -> Option<Value> {
    let h = value_hash(heap, interns, key);
    let pos = {
        let HeapData::Dict(d) = heap.get(dict) else {
            return None;
        };
        d.buckets
            .get(&h)
            .and_then(|bucket| bucket.iter().position(|(k, _)| value_eq(heap, interns, k, key)))
    };
    let i = pos?;
    let HeapData::Dict(d) = heap.get_mut(dict) else {
        return None;
    };
    let bucket = d.buckets.get_mut(&h)?;
    let (_, v) = bucket.remove(i);
    d.len -= 1;
    Some(v)
}

/// Number of entries.
#[must_use]
pub fn dict_len(heap: &Heap, dict: HeapId) -> usize {
    match heap.get(dict) {
        HeapData::Dict(d) => d.len,
        _ => 0,
    }
}

/// The `i`th entry in bucket-insertion order.
#[must_use]
pub fn dict_nth(heap: &Heap, dict: HeapId, n: usize) -> Option<(Value, Value)> {
    let HeapData::Dict(d) = heap.get(dict) else {
        return None;
    };
    let mut i = n;
    for bucket in d.buckets.values() {
        if i < bucket.len() {
            return Some(bucket[i]);
        }
        i -= bucket.len();
    }
    None
}

/// All keys, in bucket-insertion order.
#[must_use]
pub fn dict_keys(heap: &Heap, dict: HeapId) -> Vec<Value> {
    let HeapData::Dict(d) = heap.get(dict) else {
        return Vec::new();
    };
    d.buckets.values().flatten().map(|(k, _)| *k).collect()
}

/// Structural equality: same length, every key maps to an equal value.
#[must_use]
pub fn dict_eq(heap: &Heap, interns: &Interns, a: HeapId, b: HeapId) -> bool {
    if dict_len(heap, a) != dict_len(heap, b) {
        return false;
    }
    let entries = {
        let HeapData::Dict(d) = heap.get(a) else {
            return false;
        };
        d.buckets.values().flatten().copied().collect::<Vec<_>>()
    };
    entries.iter().all(|(k, v)| {
        dict_get(heap, interns, b, k).is_some_and(|other| value_eq(heap, interns, v, &other))
            && dict_contains(heap, interns, b, k)
    })
}

/// Order-independent hash (XOR of entry hashes), so structurally equal
/// dicts hash equally regardless of insertion order.
#[must_use]
pub fn dict_hash(heap: &Heap, interns: &Interns, dict: HeapId) -> u64 {
    let HeapData::Dict(d) = heap.get(dict) else {
        return 0;
    };
    let entries: Vec<(Value, Value)> = d.buckets.values().flatten().copied().collect();
    let mut acc = 0u64;
    for (k, v) in &entries {
        let kh = value_hash(heap, interns, k);
        let vh = value_hash(heap, interns, v);
        acc ^= kh.wrapping_mul(31).wrapping_add(vh);
    }
    acc
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dict_insert_get_remove() {
        let mut heap = Heap::new();
        let mut interns = Interns::new();
        let k = Value::InternStr(interns.intern("key"));
        let dict = heap.alloc(HeapData::Dict(Dict::default()));

        assert!(dict_get(&heap, &interns, dict, &k).is_none());
        dict_insert(&mut heap, &interns, dict, k, Value::Int(1));
        dict_insert(&mut heap, &interns, dict, k, Value::Int(2));
        assert_eq!(dict_len(&heap, dict), 1);
        assert!(matches!(dict_get(&heap, &interns, dict, &k), Some(Value::Int(2))));
        assert!(matches!(dict_remove(&mut heap, &interns, dict, &k), Some(Value::Int(2))));
        assert_eq!(dict_len(&heap, dict), 0);
    }

    #[test]
    fn dict_default_applies_on_miss() {
        let mut heap = Heap::new();
        let interns = Interns::new();
        let dict = heap.alloc(HeapData::Dict(Dict {
            dflt: Some(Value::Int(0)),
            ..Dict::default()
        }));
        assert!(matches!(dict_get(&heap, &interns, dict, &Value::Int(9)), Some(Value::Int(0))));
        assert!(!dict_contains(&heap, &interns, dict, &Value::Int(9)));
    }
}
