//! Iteration: `GetIter` turns an iterable into iterator state, `IterNext`
//! advances it, pushing either the next element or the end sentinel. For
//! generators, advancing resumes the suspended frame; whatever it yields
//! (or the sentinel when it finishes) lands on the resumer's stack.

use crate::{
    heap::HeapData,
    types::Iter,
    value::Value,
};

use super::{Flow, RtTag, RunResult, World, call};

/// Builds the iterator value for an iterable.
pub fn get_iter(world: &mut World, v: Value) -> RunResult<Value> {
    let it = match v {
        Value::Ref(id) => match world.heap.get(id) {
            HeapData::Array(_) => Iter::Array { arr: id, i: 0 },
            HeapData::Tuple(_) => Iter::Tuple { tup: id, i: 0 },
            HeapData::Dict(_) => Iter::Dict { dict: id, i: 0 },
            HeapData::Str(_) | HeapData::StrView { .. } => Iter::Str { s: v, i: 0 },
            HeapData::Range(r) => {
                let (lo, hi, inclusive) = (r.lo, r.hi, r.inclusive);
                match (lo, hi) {
                    (Value::Int(a), Value::Int(b)) => Iter::Range {
                        cur: a,
                        hi: b,
                        inclusive,
                    },
                    _ => return Err(world.throw(RtTag::TypeError, "range endpoints must be integers")),
                }
            }
            HeapData::Generator(_) => Iter::Gen { generator: id },
            HeapData::Iter(_) => return Ok(v),
            _ => {
                let t = v.type_name(&world.heap);
                return Err(world.throw(RtTag::TypeError, format!("cannot iterate a value of type {t}")));
            }
        },
        Value::InternStr(_) => Iter::Str { s: v, i: 0 },
        _ => {
            let t = v.type_name(&world.heap);
            return Err(world.throw(RtTag::TypeError, format!("cannot iterate a value of type {t}")));
        }
    };
    Ok(world.heap.alloc_value(HeapData::Iter(it)))
}

/// Advances the iterator on top of the stack, pushing the next element
/// above it (or the end sentinel).
pub fn iter_next(world: &mut World, tid: usize) -> RunResult<Flow> {
    let iter_val = world.peek(tid);
    let Value::Ref(iter_id) = iter_val else {
        return Err(world.throw(RtTag::TypeError, "iteration over a non-iterator"));
    };

    let state = match world.heap.get(iter_id) {
        HeapData::Iter(it) => it.clone(),
        _ => return Err(world.throw(RtTag::TypeError, "iteration over a non-iterator")),
    };

    match state {
        Iter::Array { arr, i } => {
            let next = match world.heap.get(arr) {
                HeapData::Array(xs) => xs.get(i).copied(),
                _ => None,
            };
            advance(world, iter_id, Iter::Array { arr, i: i + 1 });
            world.push(tid, next.unwrap_or(Value::Sentinel));
            Ok(Flow::Continue)
        }
        Iter::Tuple { tup, i } => {
            let next = match world.heap.get(tup) {
                HeapData::Tuple(t) => t.items.get(i).copied(),
                _ => None,
            };
            advance(world, iter_id, Iter::Tuple { tup, i: i + 1 });
            world.push(tid, next.unwrap_or(Value::Sentinel));
            Ok(Flow::Continue)
        }
        Iter::Range { cur, hi, inclusive } => {
            let has = if inclusive { cur <= hi } else { cur < hi };
            if has {
                advance(world, iter_id, Iter::Range {
                    cur: cur + 1,
                    hi,
                    inclusive,
                });
                world.push(tid, Value::Int(cur));
            } else {
                world.push(tid, Value::Sentinel);
            }
            Ok(Flow::Continue)
        }
        Iter::Str { s, i } => {
            let text = crate::value::value_str(&world.heap, &world.interns, &s).unwrap_or("");
            let next: Option<String> = text.chars().nth(i).map(|c| c.to_string());
            advance(world, iter_id, Iter::Str { s, i: i + 1 });
            match next {
                Some(c) => {
                    let v = world.heap.alloc_str(&c);
                    world.push(tid, v);
                }
                None => world.push(tid, Value::Sentinel),
            }
            Ok(Flow::Continue)
        }
        Iter::Dict { dict, i } => {
            let next = crate::types::dict_nth(&world.heap, dict, i).map(|(k, _)| k);
            advance(world, iter_id, Iter::Dict { dict, i: i + 1 });
            world.push(tid, next.unwrap_or(Value::Sentinel));
            Ok(Flow::Continue)
        }
        Iter::Gen { generator } => call::resume_generator(world, tid, generator),
    }
}

fn advance(world: &mut World, iter_id: crate::heap::HeapId, next: Iter) {
    *world.heap.get_mut(iter_id) = HeapData::Iter(next);
}
