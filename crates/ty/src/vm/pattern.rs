//! The match opcodes: try-binds, element probes, tag pops, regex matches.
//!
//! All `Try*` instructions leave the subject (and any probe pushes) on the
//! stack and jump to their failure offset on mismatch; the compiled arm
//! restores the stack at the failure landing point. A bind either happens
//! completely or the arm fails; arm-scoped slots keep partial binds from
//! escaping.

use crate::{
    compile::op::{AccessKind, Opcode},
    heap::HeapData,
    tags::TagId,
    value::Value,
};

use super::{RtTag, RunResult, VmError, World};

pub fn step(world: &mut World, tid: usize, op: Opcode) -> RunResult<()> {
    match op {
        Opcode::TryAssignNonNil => {
            let kind = world.fetch_byte(tid);
            let idx = world.fetch_u32(tid);
            let fail = world.fetch_i32(tid);
            let subject = world.peek(tid);
            if subject.is_nil() {
                world.jump(tid, fail);
            } else {
                write_access(world, tid, kind, idx, subject)?;
            }
        }
        Opcode::TryIndex => {
            let i = world.fetch_u32(tid) as usize;
            let fail = world.fetch_i32(tid);
            let subject = world.peek(tid);
            let elem = indexable_get(world, subject, i);
            match elem {
                Some(v) => world.push(tid, v),
                None => world.jump(tid, fail),
            }
        }
        Opcode::ArrayRest => {
            let kind = world.fetch_byte(tid);
            let idx = world.fetch_u32(tid);
            let from = world.fetch_u32(tid) as usize;
            let fail = world.fetch_i32(tid);
            let subject = world.peek(tid);
            let rest = match subject {
                Value::Ref(id) => match world.heap.get(id) {
                    HeapData::Array(xs) if xs.len() >= from => Some(xs[from..].to_vec()),
                    _ => None,
                },
                _ => None,
            };
            match rest {
                Some(items) => {
                    let arr = world.heap.alloc_value(HeapData::Array(items));
                    write_access(world, tid, kind, idx, arr)?;
                }
                None => world.jump(tid, fail),
            }
        }
        Opcode::EnsureLen => {
            let n = world.fetch_u32(tid) as usize;
            let fail = world.fetch_i32(tid);
            let subject = world.peek(tid);
            let len = match subject {
                Value::Ref(id) => match world.heap.get(id) {
                    HeapData::Array(xs) => Some(xs.len()),
                    HeapData::Tuple(t) => Some(t.items.len()),
                    _ => None,
                },
                _ => None,
            };
            if len != Some(n) {
                world.jump(tid, fail);
            }
        }
        Opcode::TryTagPop => {
            let tag = TagId(world.fetch_u32(tid));
            let fail = world.fetch_i32(tid);
            let subject = world.peek(tid);
            let inner = match subject {
                Value::Ref(id) => match world.heap.get(id) {
                    HeapData::Tagged(stack, inner) => {
                        let (stack, inner) = (*stack, *inner);
                        if world.tags.first(stack) == Some(tag) {
                            let rest = world.tags.pop(stack);
                            if rest == 0 {
                                Some(inner)
                            } else {
                                Some(world.heap.alloc_value(HeapData::Tagged(rest, inner)))
                            }
                        } else {
                            None
                        }
                    }
                    _ => None,
                },
                // A bare tag value matches a nullary application.
                Value::Tag(t) if t == tag => Some(Value::Nil),
                _ => None,
            };
            match inner {
                Some(v) => {
                    // Replace the duplicated subject with the untagged
                    // payload.
                    world.pop(tid);
                    world.push(tid, v);
                }
                None => world.jump(tid, fail),
            }
        }
        Opcode::TryRegex => {
            let spec_id = world.fetch_u32(tid) as usize;
            let fail = world.fetch_i32(tid);
            let subject = world.peek(tid);
            let matched = try_regex(world, tid, spec_id, subject)?;
            if !matched {
                world.jump(tid, fail);
            }
        }
        Opcode::TryKey => {
            let fail = world.fetch_i32(tid);
            let key = world.pop(tid);
            let subject = world.peek(tid);
            let found = match subject {
                Value::Ref(id) if matches!(world.heap.get(id), HeapData::Dict(_)) => {
                    if crate::types::dict_contains(&world.heap, &world.interns, id, &key) {
                        crate::types::dict_get(&world.heap, &world.interns, id, &key)
                    } else {
                        None
                    }
                }
                _ => None,
            };
            match found {
                Some(v) => world.push(tid, v),
                None => world.jump(tid, fail),
            }
        }
        Opcode::BadMatch => {
            let subject = world.peek(tid);
            let rendered = super::display_value(world, subject);
            return Err(world.throw(RtTag::MatchError, format!("no pattern matched {rendered}")));
        }
        Opcode::UntagOrDie => {
            let tag = TagId(world.fetch_u32(tid));
            let v = world.pop(tid);
            let inner = super::ops::untag_or_die(world, v, tag)?;
            world.push(tid, inner);
        }
        _ => return Err(VmError::Fatal("non-pattern opcode in pattern step".to_string())),
    }
    Ok(())
}

fn write_access(world: &mut World, tid: usize, kind: u8, idx: u32, v: Value) -> RunResult<()> {
    match AccessKind::from_repr(kind) {
        Some(AccessKind::Local) => {
            world.write_local(tid, idx, v);
            Ok(())
        }
        Some(AccessKind::Global) => {
            world.set_global(idx, v);
            Ok(())
        }
        Some(AccessKind::Capture) => {
            world.write_capture(tid, idx, v);
            Ok(())
        }
        None => Err(VmError::Fatal("bad access kind".to_string())),
    }
}

fn indexable_get(world: &World, subject: Value, i: usize) -> Option<Value> {
    match subject {
        Value::Ref(id) => match world.heap.get(id) {
            HeapData::Array(xs) => xs.get(i).copied(),
            HeapData::Tuple(t) => t.items.get(i).copied(),
            _ => None,
        },
        _ => None,
    }
}

/// Regex patterns: the subject must be a string matching the pattern; named
/// groups bind through the match spec.
fn try_regex(world: &mut World, tid: usize, spec_id: usize, subject: Value) -> RunResult<bool> {
    let Some(text) = crate::value::value_str(&world.heap, &world.interns, &subject).map(str::to_string) else {
        return Ok(false);
    };
    let (regex, binds) = {
        let spec = &world.program.match_specs[spec_id];
        (world.program.regexes[spec.regex.0 as usize].clone(), spec.binds.clone())
    };

    let captures = match regex.captures(&text) {
        Ok(Some(c)) => c,
        Ok(None) => return Ok(false),
        Err(e) => return Err(world.throw(RtTag::TypeError, format!("regex engine failure: {e}"))),
    };

    let groups: Vec<Option<String>> = (0..captures.len())
        .map(|i| captures.get(i).map(|m| m.as_str().to_string()))
        .collect();
    drop(captures);

    for bind in binds {
        let v = match groups.get(bind.group).and_then(Clone::clone) {
            Some(s) => world.heap.alloc_str(&s),
            None => Value::Nil,
        };
        write_access(world, tid, bind.kind as u8, bind.index, v)?;
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::value_eq;

    #[test]
    fn equal_values_match_structurally() {
        let world = World::new(Box::new(crate::io::NoPrint));
        let a = Value::Int(3);
        let b = Value::Int(3);
        assert!(value_eq(&world.heap, &world.interns, &a, &b));
    }
}
