//! The garbage-collected heap: slot arena, mark phase, sweeper.
//!
//! Every heap value lives in a slot; freed slots go on a free list and are
//! reused. Collection is precise mark-and-sweep: the VM gathers roots (all
//! thread stacks, frames, environments, globals, module state) and calls
//! [`Heap::mark`], then [`Heap::sweep`] frees every unmarked slot.
//!
//! Collection only happens at safe points and only while the disable
//! counter is zero; code holding raw references across allocations brackets
//! the region with [`Heap::gc_disable`] / [`Heap::gc_enable`].
//!
//! Unreachable objects with finalizers and suspended generators with
//! pending deferred actions are not freed immediately: the sweep
//! resurrects them onto the finalize queue, the VM runs the queued actions,
//! and the next cycle reclaims them.

use crate::{
    tags::TagStack,
    types::{
        AstValue, Closure, CondvarState, DeferAction, Dict, Generator, Iter, MutexState, Object, Range, ThreadHandle,
        Tuple,
    },
    value::Value,
};

/// A queued post-sweep action: finalizers of reclaimed objects and the
/// pending deferred actions of reclaimed generators.
#[derive(Debug, Clone, Copy)]
pub enum FinalizeAction {
    /// Call a zero-argument callable.
    Call(Value),
    /// Call a finalizer with its receiver.
    CallWith { f: Value, recv: Value },
    /// Invoke the value's `drop` method.
    Drop(Value),
}

impl FinalizeAction {
    /// Values the GC must keep alive while the action is queued.
    #[must_use]
    pub fn roots(&self) -> [Value; 2] {
        match self {
            FinalizeAction::Call(v) | FinalizeAction::Drop(v) => [*v, Value::Nil],
            FinalizeAction::CallWith { f, recv } => [*f, *recv],
        }
    }
}

/// Index of a heap slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct HeapId(u32);

impl HeapId {
    #[inline]
    #[must_use]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// The payload of one heap slot.
#[derive(Debug, Clone)]
pub enum HeapData {
    /// An owned immutable string.
    Str(Box<str>),
    /// A non-owning slice of another GC string's bytes.
    StrView { owner: HeapId, offset: u32, len: u32 },
    Array(Vec<Value>),
    Blob(Vec<u8>),
    Dict(Dict),
    Tuple(Tuple),
    /// A value with a non-empty tag stack.
    Tagged(TagStack, Value),
    /// A mutable cell shared between a function and its closures.
    Cell(Value),
    Closure(Closure),
    Generator(Generator),
    Object(Object),
    Range(Range),
    /// A bound method: receiver plus function.
    Method { recv: Value, fun: Value },
    /// A builtin bound to a receiver.
    BuiltinMethod { recv: Value, builtin: crate::value::BuiltinId },
    Iter(Iter),
    Thread(ThreadHandle),
    Mutex(MutexState),
    Condvar(CondvarState),
    /// Quoted AST flowing through macro expansion.
    Ast(AstValue),
}

#[derive(Debug)]
struct Slot {
    data: Option<HeapData>,
    mark: bool,
}

/// Result of one sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweepStats {
    pub freed: usize,
    pub live: usize,
}

/// The heap.
#[derive(Debug)]
pub struct Heap {
    slots: Vec<Slot>,
    free: Vec<u32>,
    live: usize,
    allocs_since_gc: usize,
    gc_off: u32,
    /// Actions queued by the last sweep, run by the VM after the cycle.
    pub finalize_queue: Vec<FinalizeAction>,
}

const GC_THRESHOLD_FLOOR: usize = 4096;

impl Heap {
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            live: 0,
            allocs_since_gc: 0,
            gc_off: 0,
            finalize_queue: Vec::new(),
        }
    }

    /// Allocates a slot for `data`.
    pub fn alloc(&mut self, data: HeapData) -> HeapId {
        self.live += 1;
        self.allocs_since_gc += 1;
        if let Some(i) = self.free.pop() {
            self.slots[i as usize] = Slot {
                data: Some(data),
                mark: false,
            };
            return HeapId(i);
        }
        let i = u32::try_from(self.slots.len()).expect("heap slot count exceeds u32");
        self.slots.push(Slot {
            data: Some(data),
            mark: false,
        });
        HeapId(i)
    }

    /// Convenience: allocates and wraps in a `Value`.
    pub fn alloc_value(&mut self, data: HeapData) -> Value {
        Value::Ref(self.alloc(data))
    }

    /// Allocates an owned string.
    pub fn alloc_str(&mut self, s: &str) -> Value {
        self.alloc_value(HeapData::Str(s.into()))
    }

    #[must_use]
    pub fn get(&self, id: HeapId) -> &HeapData {
        self.slots[id.index()].data.as_ref().expect("access to freed heap slot")
    }

    pub fn get_mut(&mut self, id: HeapId) -> &mut HeapData {
        self.slots[id.index()].data.as_mut().expect("access to freed heap slot")
    }

    /// Number of live allocations.
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.live
    }

    /// Number of recycled slots available for reuse.
    #[must_use]
    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    /// Should the VM trigger a collection at the next safe point?
    #[must_use]
    pub fn should_collect(&self) -> bool {
        self.gc_off == 0 && self.allocs_since_gc > GC_THRESHOLD_FLOOR.max(self.live / 2)
    }

    /// Increments the collection disable counter.
    pub fn gc_disable(&mut self) {
        self.gc_off += 1;
    }

    /// Decrements the collection disable counter.
    pub fn gc_enable(&mut self) {
        self.gc_off = self.gc_off.saturating_sub(1);
    }

    /// Whether collection is currently permitted.
    #[must_use]
    pub fn gc_enabled(&self) -> bool {
        self.gc_off == 0
    }

    /// Clears all marks; the start of a cycle.
    pub fn clear_marks(&mut self) {
        for slot in &mut self.slots {
            slot.mark = false;
        }
    }

    /// Marks everything reachable from `roots`.
    pub fn mark<I: IntoIterator<Item = Value>>(&mut self, roots: I) {
        let mut worklist: Vec<HeapId> = roots.into_iter().filter_map(value_heap_id).collect();
        while let Some(id) = worklist.pop() {
            let slot = &mut self.slots[id.index()];
            if slot.mark {
                continue;
            }
            slot.mark = true;
            let Some(data) = slot.data.as_ref() else {
                continue;
            };
            push_children(data, &mut worklist);
        }
    }

    /// Marks a single root value.
    pub fn mark_value(&mut self, v: Value) {
        self.mark(std::iter::once(v));
    }

    /// Frees every unmarked slot.
    ///
    /// Unmarked objects with finalizers and suspended generators with
    /// deferred actions are resurrected instead: the pending action goes on
    /// [`Heap::finalize_queue`], the object (and everything it reaches) is
    /// marked live, and the next cycle frees it once the finalizer has been
    /// cleared.
    pub fn sweep(&mut self) -> SweepStats {
        // Resurrection pass.
        let mut doomed_actions: Vec<FinalizeAction> = Vec::new();
        for i in 0..self.slots.len() {
            if self.slots[i].mark {
                continue;
            }
            match self.slots[i].data.as_mut() {
                Some(HeapData::Object(obj)) => {
                    if let Some(f) = obj.finalizer.take() {
                        doomed_actions.push(FinalizeAction::CallWith {
                            f,
                            recv: Value::Ref(HeapId(u32::try_from(i).expect("slot index fits u32"))),
                        });
                    }
                }
                Some(HeapData::Generator(g)) => {
                    if let Some(frame) = g.frame.as_mut()
                        && !frame.defers.is_empty()
                    {
                        let defers = std::mem::take(&mut frame.defers);
                        g.done = true;
                        for d in defers.into_iter().rev() {
                            doomed_actions.push(match d {
                                DeferAction::Call(v) | DeferAction::CallUnwind(v) => FinalizeAction::Call(v),
                                DeferAction::DropValue(v) => FinalizeAction::Drop(v),
                            });
                        }
                    }
                }
                _ => {}
            }
        }
        // Everything a queued action references stays live.
        let roots: Vec<Value> = doomed_actions.iter().flat_map(FinalizeAction::roots).collect();
        self.mark(roots);
        self.finalize_queue.extend(doomed_actions);

        let mut freed = 0;
        for (i, slot) in self.slots.iter_mut().enumerate() {
            if slot.data.is_some() && !slot.mark {
                slot.data = None;
                freed += 1;
                self.free.push(u32::try_from(i).expect("slot index fits u32"));
            }
            slot.mark = false;
        }
        self.live -= freed;
        self.allocs_since_gc = 0;
        SweepStats { freed, live: self.live }
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

/// The heap id inside a value, if any.
#[must_use]
pub fn value_heap_id(v: Value) -> Option<HeapId> {
    match v {
        Value::Ref(id) => Some(id),
        _ => None,
    }
}

fn push_value(v: &Value, out: &mut Vec<HeapId>) {
    if let Value::Ref(id) = v {
        out.push(*id);
    }
}

fn push_children(data: &HeapData, out: &mut Vec<HeapId>) {
    match data {
        HeapData::Str(_) | HeapData::Blob(_) | HeapData::Thread(_) | HeapData::Mutex(_) | HeapData::Condvar(_) => {}
        HeapData::StrView { owner, .. } => out.push(*owner),
        HeapData::Array(xs) => {
            for v in xs {
                push_value(v, out);
            }
        }
        HeapData::Dict(d) => {
            for (k, v) in d.buckets.values().flatten() {
                push_value(k, out);
                push_value(v, out);
            }
            if let Some(dflt) = &d.dflt {
                push_value(dflt, out);
            }
        }
        HeapData::Tuple(t) => {
            for v in &t.items {
                push_value(v, out);
            }
        }
        HeapData::Tagged(_, inner) | HeapData::Cell(inner) => push_value(inner, out),
        HeapData::Closure(c) => out.extend(c.env.iter().copied()),
        HeapData::Generator(g) => {
            if let Some(f) = &g.frame {
                out.extend(f.env.iter().copied());
                for v in f.locals.iter().chain(f.stack.iter()) {
                    push_value(v, out);
                }
                for d in &f.defers {
                    push_value(&d.value(), out);
                }
            }
        }
        HeapData::Object(o) => {
            for v in o.fields.values() {
                push_value(v, out);
            }
            if let Some(f) = &o.finalizer {
                push_value(f, out);
            }
        }
        HeapData::Range(r) => {
            push_value(&r.lo, out);
            push_value(&r.hi, out);
        }
        HeapData::Method { recv, fun } => {
            push_value(recv, out);
            push_value(fun, out);
        }
        HeapData::BuiltinMethod { recv, .. } => push_value(recv, out),
        HeapData::Iter(it) => match it {
            Iter::Array { arr, .. } => out.push(*arr),
            Iter::Tuple { tup, .. } => out.push(*tup),
            Iter::Dict { dict, .. } => out.push(*dict),
            Iter::Gen { generator } => out.push(*generator),
            Iter::Str { s, .. } => push_value(s, out),
            Iter::Range { .. } => {}
        },
        HeapData::Ast(_) => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collect_frees_unreachable_and_keeps_reachable() {
        let mut heap = Heap::new();
        let kept = heap.alloc(HeapData::Str("kept".into()));
        let arr = heap.alloc(HeapData::Array(vec![Value::Ref(kept)]));
        let _garbage = heap.alloc(HeapData::Str("garbage".into()));
        let before = heap.live_count();

        heap.clear_marks();
        heap.mark([Value::Ref(arr)]);
        let stats = heap.sweep();

        assert_eq!(stats.freed, 1);
        assert_eq!(heap.live_count(), before - 1);
        assert!(matches!(heap.get(kept), HeapData::Str(s) if &**s == "kept"));
    }

    #[test]
    fn freed_slots_are_reused() {
        let mut heap = Heap::new();
        let a = heap.alloc(HeapData::Str("a".into()));
        heap.clear_marks();
        heap.mark([]);
        heap.sweep();
        let b = heap.alloc(HeapData::Str("b".into()));
        assert_eq!(a, b);
    }

    #[test]
    fn finalizers_resurrect_for_one_cycle() {
        let mut heap = Heap::new();
        let fin = heap.alloc(HeapData::Str("finalizer-stand-in".into()));
        let obj = heap.alloc(HeapData::Object(Object {
            class: crate::value::ClassId(0),
            fields: indexmap::IndexMap::new(),
            finalizer: Some(Value::Ref(fin)),
        }));

        heap.clear_marks();
        heap.mark([]);
        let stats = heap.sweep();
        // Neither the object nor its finalizer was freed.
        assert_eq!(stats.freed, 0);
        assert_eq!(heap.finalize_queue.len(), 1);

        // After the queue drains, the next cycle reclaims both.
        heap.finalize_queue.clear();
        heap.clear_marks();
        heap.mark([]);
        let stats = heap.sweep();
        assert_eq!(stats.freed, 2);
        let _ = (obj, fin);
    }
}
