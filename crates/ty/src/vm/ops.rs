//! Operator implementations: arithmetic, comparison, assignment targets,
//! subscripts, slices, ranges, and member access.

use std::cmp::Ordering;

use crate::{
    compile::op::Opcode,
    heap::{HeapData, HeapId},
    intern::StringId,
    tags::TagId,
    types::{ClassInfo, dict_contains, dict_get, dict_insert},
    value::{Value, value_cmp, value_eq, value_str},
};

use super::{RtTag, RunResult, Target, VmError, World};

/// Pushes `tag` onto the value's tag stack, preserving the payload.
pub fn tag_push(world: &mut World, v: Value, tag: TagId) -> Value {
    match v {
        Value::Ref(id) => {
            if let HeapData::Tagged(stack, inner) = world.heap.get(id) {
                let (stack, inner) = (*stack, *inner);
                let new_stack = world.tags.push(stack, tag);
                return world.heap.alloc_value(HeapData::Tagged(new_stack, inner));
            }
            let stack = world.tags.push(0, tag);
            world.heap.alloc_value(HeapData::Tagged(stack, v))
        }
        _ => {
            let stack = world.tags.push(0, tag);
            world.heap.alloc_value(HeapData::Tagged(stack, v))
        }
    }
}

/// Strict binary operators (everything except the short-circuit family).
pub fn binary(world: &mut World, op: Opcode, lhs: Value, rhs: Value) -> RunResult<Value> {
    match op {
        Opcode::Eq => {
            let eq = value_eq(&world.heap, &world.interns, &lhs, &rhs);
            return Ok(Value::Bool(eq));
        }
        Opcode::Neq => {
            let eq = value_eq(&world.heap, &world.interns, &lhs, &rhs);
            return Ok(Value::Bool(!eq));
        }
        Opcode::Lt | Opcode::Leq | Opcode::Gt | Opcode::Geq | Opcode::Cmp => {
            let Some(ord) = value_cmp(&world.heap, &world.interns, &lhs, &rhs) else {
                return Err(cmp_type_error(world, &lhs, &rhs));
            };
            return Ok(match op {
                Opcode::Lt => Value::Bool(ord == Ordering::Less),
                Opcode::Leq => Value::Bool(ord != Ordering::Greater),
                Opcode::Gt => Value::Bool(ord == Ordering::Greater),
                Opcode::Geq => Value::Bool(ord != Ordering::Less),
                _ => Value::Int(match ord {
                    Ordering::Less => -1,
                    Ordering::Equal => 0,
                    Ordering::Greater => 1,
                }),
            });
        }
        _ => {}
    }

    arith(world, op, lhs, rhs)
}

#[expect(clippy::cast_precision_loss, reason = "mixed int/real arithmetic")]
fn arith(world: &mut World, op: Opcode, lhs: Value, rhs: Value) -> RunResult<Value> {
    // Integer arithmetic wraps explicitly.
    if let (Value::Int(a), Value::Int(b)) = (lhs, rhs) {
        return int_arith(world, op, a, b);
    }

    let as_real = |v: &Value| match v {
        Value::Int(k) => Some(*k as f64),
        Value::Real(x) => Some(*x),
        _ => None,
    };
    if let (Some(a), Some(b)) = (as_real(&lhs), as_real(&rhs)) {
        return match op {
            Opcode::Add => Ok(Value::Real(a + b)),
            Opcode::Sub => Ok(Value::Real(a - b)),
            Opcode::Mul => Ok(Value::Real(a * b)),
            Opcode::Div => Ok(Value::Real(a / b)),
            Opcode::Mod => Ok(Value::Real(a % b)),
            _ => Err(arith_type_error(world, op, &lhs, &rhs)),
        };
    }

    // String concatenation.
    if op == Opcode::Add {
        let joined = match (
            value_str(&world.heap, &world.interns, &lhs),
            value_str(&world.heap, &world.interns, &rhs),
        ) {
            (Some(a), Some(b)) => Some(format!("{a}{b}")),
            _ => None,
        };
        if let Some(s) = joined {
            return Ok(world.heap.alloc_str(&s));
        }
        // Array concatenation.
        if let (Value::Ref(a), Value::Ref(b)) = (lhs, rhs)
            && let (HeapData::Array(xs), HeapData::Array(ys)) = (world.heap.get(a), world.heap.get(b))
        {
            let mut out = xs.clone();
            out.extend(ys.iter().copied());
            return Ok(world.heap.alloc_value(HeapData::Array(out)));
        }
    }

    // String repetition: 'ab' * 3.
    if op == Opcode::Mul
        && let (Some(s), Value::Int(n)) = (value_str(&world.heap, &world.interns, &lhs), rhs)
    {
        let out = s.repeat(usize::try_from(n.max(0)).unwrap_or(0));
        return Ok(world.heap.alloc_str(&out));
    }

    Err(arith_type_error(world, op, &lhs, &rhs))
}

fn int_arith(world: &mut World, op: Opcode, a: i64, b: i64) -> RunResult<Value> {
    match op {
        Opcode::Add => Ok(Value::Int(a.wrapping_add(b))),
        Opcode::Sub => Ok(Value::Int(a.wrapping_sub(b))),
        Opcode::Mul => Ok(Value::Int(a.wrapping_mul(b))),
        Opcode::Div => {
            if b == 0 {
                Err(world.throw(RtTag::DivisionByZero, "division by zero"))
            } else {
                Ok(Value::Int(a.wrapping_div(b)))
            }
        }
        Opcode::Mod => {
            if b == 0 {
                Err(world.throw(RtTag::DivisionByZero, "modulo by zero"))
            } else {
                Ok(Value::Int(a.wrapping_rem(b)))
            }
        }
        Opcode::BitAnd => Ok(Value::Int(a & b)),
        Opcode::BitOr => Ok(Value::Int(a | b)),
        Opcode::BitXor => Ok(Value::Int(a ^ b)),
        Opcode::Shl => Ok(Value::Int(a.wrapping_shl(u32::try_from(b & 63).expect("masked shift")))),
        Opcode::Shr => Ok(Value::Int(a.wrapping_shr(u32::try_from(b & 63).expect("masked shift")))),
        _ => Err(arith_type_error(world, op, &Value::Int(a), &Value::Int(b))),
    }
}

fn arith_type_error(world: &mut World, op: Opcode, lhs: &Value, rhs: &Value) -> VmError {
    let opname: &'static str = op.into();
    let l = lhs.type_name(&world.heap);
    let r = rhs.type_name(&world.heap);
    world.throw(RtTag::TypeError, format!("invalid operands to {opname}: {l} and {r}"))
}

fn cmp_type_error(world: &mut World, lhs: &Value, rhs: &Value) -> VmError {
    let l = lhs.type_name(&world.heap);
    let r = rhs.type_name(&world.heap);
    world.throw(RtTag::TypeError, format!("values of types {l} and {r} are not ordered"))
}

pub fn negate(world: &mut World, v: Value) -> RunResult<Value> {
    match v {
        Value::Int(k) => Ok(Value::Int(k.wrapping_neg())),
        Value::Real(x) => Ok(Value::Real(-x)),
        _ => {
            let t = v.type_name(&world.heap);
            Err(world.throw(RtTag::TypeError, format!("cannot negate a value of type {t}")))
        }
    }
}

/// Writes `value` through `target`.
pub fn assign(world: &mut World, tid: usize, target: Target, value: Value) -> RunResult<()> {
    match target {
        Target::Local(slot) => {
            world.write_local(tid, slot, value);
            Ok(())
        }
        Target::Global(slot) => {
            world.set_global(slot, value);
            Ok(())
        }
        Target::Cell(id) => {
            *world.heap.get_mut(id) = HeapData::Cell(value);
            Ok(())
        }
        Target::Member(obj, name) => member_assign(world, tid, obj, name, value),
        Target::Subscript(container, index) => subscript_assign(world, container, index, value),
    }
}

/// Reads the current value of `target` (compound assignment).
fn target_read(world: &mut World, tid: usize, target: Target) -> RunResult<Value> {
    match target {
        Target::Local(slot) => Ok(world.read_local(tid, slot)),
        Target::Global(slot) => Ok(world.global(slot)),
        Target::Cell(id) => match world.heap.get(id) {
            HeapData::Cell(v) => Ok(*v),
            _ => Ok(Value::Nil),
        },
        Target::Member(obj, name) => member_access(world, tid, obj, name),
        Target::Subscript(container, index) => subscript(world, container, index),
    }
}

/// Compound assignment: read, combine, write, and return the new value.
pub fn mutate(world: &mut World, tid: usize, target: Target, value: Value, op: Opcode) -> RunResult<Value> {
    let current = target_read(world, tid, target)?;
    let arith_op = match op {
        Opcode::MutAdd => Opcode::Add,
        Opcode::MutSub => Opcode::Sub,
        Opcode::MutMul => Opcode::Mul,
        _ => Opcode::Div,
    };
    let out = binary(world, arith_op, current, value)?;
    assign(world, tid, target, out)?;
    Ok(out)
}

fn norm_index(len: usize, i: i64) -> Option<usize> {
    let len = i64::try_from(len).ok()?;
    let i = if i < 0 { i + len } else { i };
    (0..len).contains(&i).then(|| usize::try_from(i).expect("index checked non-negative"))
}

/// `container[index]` reads.
pub fn subscript(world: &mut World, container: Value, index: Value) -> RunResult<Value> {
    match container {
        Value::Ref(id) => match world.heap.get(id) {
            HeapData::Array(xs) => {
                let len = xs.len();
                let Value::Int(i) = index else {
                    return Err(world.throw(RtTag::TypeError, "array index must be an integer"));
                };
                match norm_index(len, i) {
                    Some(i) => {
                        let v = match world.heap.get(id) {
                            HeapData::Array(xs) => xs[i],
                            _ => Value::Nil,
                        };
                        Ok(v)
                    }
                    None => Err(world.throw(RtTag::IndexError, format!("array index {i} out of bounds"))),
                }
            }
            HeapData::Tuple(t) => {
                let len = t.items.len();
                let Value::Int(i) = index else {
                    return Err(world.throw(RtTag::TypeError, "tuple index must be an integer"));
                };
                match norm_index(len, i) {
                    Some(i) => {
                        let v = match world.heap.get(id) {
                            HeapData::Tuple(t) => t.items[i],
                            _ => Value::Nil,
                        };
                        Ok(v)
                    }
                    None => Err(world.throw(RtTag::IndexError, format!("tuple index {i} out of bounds"))),
                }
            }
            HeapData::Dict(_) => Ok(dict_get(&world.heap, &world.interns, id, &index).unwrap_or(Value::Nil)),
            HeapData::Blob(bytes) => {
                let len = bytes.len();
                let Value::Int(i) = index else {
                    return Err(world.throw(RtTag::TypeError, "blob index must be an integer"));
                };
                match norm_index(len, i) {
                    Some(i) => {
                        let b = match world.heap.get(id) {
                            HeapData::Blob(bytes) => bytes[i],
                            _ => 0,
                        };
                        Ok(Value::Int(i64::from(b)))
                    }
                    None => Err(world.throw(RtTag::IndexError, format!("blob index {i} out of bounds"))),
                }
            }
            HeapData::Str(_) | HeapData::StrView { .. } => string_index(world, container, index),
            _ => {
                let t = container.type_name(&world.heap);
                Err(world.throw(RtTag::TypeError, format!("cannot index a value of type {t}")))
            }
        },
        Value::InternStr(_) => string_index(world, container, index),
        _ => {
            let t = container.type_name(&world.heap);
            Err(world.throw(RtTag::TypeError, format!("cannot index a value of type {t}")))
        }
    }
}

fn string_index(world: &mut World, s: Value, index: Value) -> RunResult<Value> {
    let Value::Int(i) = index else {
        return Err(world.throw(RtTag::TypeError, "string index must be an integer"));
    };
    let Some(text) = value_str(&world.heap, &world.interns, &s) else {
        return Err(world.throw(RtTag::TypeError, "cannot index a non-string value"));
    };
    let chars: Vec<char> = text.chars().collect();
    match norm_index(chars.len(), i) {
        Some(i) => {
            let out = chars[i].to_string();
            Ok(world.heap.alloc_str(&out))
        }
        None => Err(world.throw(RtTag::IndexError, format!("string index {i} out of bounds"))),
    }
}

fn subscript_assign(world: &mut World, container: Value, index: Value, value: Value) -> RunResult<()> {
    match container {
        Value::Ref(id) => match world.heap.get(id) {
            HeapData::Array(xs) => {
                let len = xs.len();
                let Value::Int(i) = index else {
                    return Err(world.throw(RtTag::TypeError, "array index must be an integer"));
                };
                match norm_index(len, i) {
                    Some(i) => {
                        if let HeapData::Array(xs) = world.heap.get_mut(id) {
                            xs[i] = value;
                        }
                        Ok(())
                    }
                    None => Err(world.throw(RtTag::IndexError, format!("array index {i} out of bounds"))),
                }
            }
            HeapData::Dict(_) => {
                dict_insert(&mut world.heap, &world.interns, id, index, value);
                Ok(())
            }
            HeapData::Blob(bytes) => {
                let len = bytes.len();
                let (Value::Int(i), Value::Int(b)) = (index, value) else {
                    return Err(world.throw(RtTag::TypeError, "blob assignment takes integer index and byte"));
                };
                match norm_index(len, i) {
                    Some(i) => {
                        if let HeapData::Blob(bytes) = world.heap.get_mut(id) {
                            bytes[i] = u8::try_from(b & 0xff).expect("masked byte");
                        }
                        Ok(())
                    }
                    None => Err(world.throw(RtTag::IndexError, format!("blob index {i} out of bounds"))),
                }
            }
            _ => {
                let t = container.type_name(&world.heap);
                Err(world.throw(RtTag::TypeError, format!("cannot assign into a value of type {t}")))
            }
        },
        _ => {
            let t = container.type_name(&world.heap);
            Err(world.throw(RtTag::TypeError, format!("cannot assign into a value of type {t}")))
        }
    }
}

/// `e[i;j;k]` slicing. Strings slice into views; arrays copy.
pub fn slice(world: &mut World, subject: Value, i: Value, j: Value, k: Value) -> RunResult<Value> {
    let step = match k {
        Value::Nil => 1,
        Value::Int(s) if s != 0 => s,
        _ => return Err(world.throw(RtTag::TypeError, "slice step must be a non-zero integer")),
    };

    let bounds = |len: usize, lo: Value, hi: Value| -> RunResult<(usize, usize)> {
        let ilen = i64::try_from(len).unwrap_or(i64::MAX);
        let norm = |v: Value, dflt: i64| match v {
            Value::Nil => Ok(dflt),
            Value::Int(x) => Ok(if x < 0 { (x + ilen).max(0) } else { x.min(ilen) }),
            _ => Err(VmError::Fatal("slice bound must be an integer".to_string())),
        };
        let lo = norm(lo, 0)?;
        let hi = norm(hi, ilen)?;
        Ok((
            usize::try_from(lo.max(0)).expect("clamped"),
            usize::try_from(hi.max(0)).expect("clamped"),
        ))
    };

    // Strings prefer views over copies.
    if let Value::Ref(id) = subject
        && matches!(world.heap.get(id), HeapData::Str(_) | HeapData::StrView { .. })
    {
        let text = crate::value::heap_str(&world.heap, id).unwrap_or("");
        if text.is_ascii() && step == 1 {
            let (owner, base) = match world.heap.get(id) {
                HeapData::StrView { owner, offset, .. } => (*owner, *offset),
                _ => (id, 0),
            };
            let (lo, hi) = bounds(text.len(), i, j)?;
            let lo32 = u32::try_from(lo).expect("string length fits u32");
            let len32 = u32::try_from(hi.saturating_sub(lo)).expect("string length fits u32");
            return Ok(world.heap.alloc_value(HeapData::StrView {
                owner,
                offset: base + lo32,
                len: len32,
            }));
        }
        let chars: Vec<char> = text.chars().collect();
        let (lo, hi) = bounds(chars.len(), i, j)?;
        let out = sliced(&chars, lo, hi, step).into_iter().collect::<String>();
        return Ok(world.heap.alloc_str(&out));
    }
    if let Value::InternStr(sid) = subject {
        let text = world.interns.get(sid).to_string();
        let chars: Vec<char> = text.chars().collect();
        let (lo, hi) = bounds(chars.len(), i, j)?;
        let out = sliced(&chars, lo, hi, step).into_iter().collect::<String>();
        return Ok(world.heap.alloc_str(&out));
    }

    if let Value::Ref(id) = subject
        && let HeapData::Array(xs) = world.heap.get(id)
    {
        let xs = xs.clone();
        let (lo, hi) = bounds(xs.len(), i, j)?;
        let out = sliced(&xs, lo, hi, step);
        return Ok(world.heap.alloc_value(HeapData::Array(out)));
    }

    let t = subject.type_name(&world.heap);
    Err(world.throw(RtTag::TypeError, format!("cannot slice a value of type {t}")))
}

fn sliced<T: Copy>(xs: &[T], lo: usize, hi: usize, step: i64) -> Vec<T> {
    let mut out = Vec::new();
    if step > 0 {
        let mut i = lo;
        while i < hi.min(xs.len()) {
            out.push(xs[i]);
            i += usize::try_from(step).expect("positive step");
        }
    } else {
        let mut i = i64::try_from(hi.min(xs.len())).unwrap_or(0) - 1;
        let lo = i64::try_from(lo).unwrap_or(0);
        while i >= lo {
            out.push(xs[usize::try_from(i).expect("non-negative index")]);
            i += step;
        }
    }
    out
}

pub fn length(world: &mut World, v: Value) -> RunResult<i64> {
    let n = match v {
        Value::InternStr(id) => world.interns.get(id).chars().count(),
        Value::Ref(id) => match world.heap.get(id) {
            HeapData::Str(_) | HeapData::StrView { .. } => {
                crate::value::heap_str(&world.heap, id).map_or(0, |s| s.chars().count())
            }
            HeapData::Array(xs) => xs.len(),
            HeapData::Tuple(t) => t.items.len(),
            HeapData::Blob(b) => b.len(),
            HeapData::Dict(_) => crate::types::dict_len(&world.heap, id),
            HeapData::Range(r) => {
                let (lo, hi, inc) = (r.lo, r.hi, r.inclusive);
                match (lo, hi) {
                    (Value::Int(a), Value::Int(b)) => {
                        let span = b - a + i64::from(inc);
                        return Ok(span.max(0));
                    }
                    _ => return Err(world.throw(RtTag::TypeError, "range endpoints must be integers")),
                }
            }
            _ => {
                let t = v.type_name(&world.heap);
                return Err(world.throw(RtTag::TypeError, format!("no length for a value of type {t}")));
            }
        },
        _ => {
            let t = v.type_name(&world.heap);
            return Err(world.throw(RtTag::TypeError, format!("no length for a value of type {t}")));
        }
    };
    Ok(i64::try_from(n).unwrap_or(i64::MAX))
}

/// Membership tests: arrays scan, dicts check keys, strings check
/// substrings, ranges check numerically.
pub fn contains(world: &mut World, collection: &Value, item: &Value) -> RunResult<bool> {
    match collection {
        Value::Ref(id) => match world.heap.get(*id) {
            HeapData::Array(xs) => {
                let xs = xs.clone();
                Ok(xs.iter().any(|x| value_eq(&world.heap, &world.interns, x, item)))
            }
            HeapData::Tuple(t) => {
                let xs = t.items.clone();
                Ok(xs.iter().any(|x| value_eq(&world.heap, &world.interns, x, item)))
            }
            HeapData::Dict(_) => Ok(dict_contains(&world.heap, &world.interns, *id, item)),
            HeapData::Str(_) | HeapData::StrView { .. } => {
                let hay = crate::value::heap_str(&world.heap, *id).unwrap_or("");
                let needle = value_str(&world.heap, &world.interns, item).unwrap_or("");
                Ok(hay.contains(needle))
            }
            HeapData::Range(r) => {
                let (lo, hi, inc) = (r.lo, r.hi, r.inclusive);
                match (lo, hi, item) {
                    (Value::Int(a), Value::Int(b), Value::Int(x)) => Ok(*x >= a && (*x < b || (inc && *x == b))),
                    _ => Ok(false),
                }
            }
            _ => Ok(false),
        },
        Value::InternStr(sid) => {
            let hay = world.interns.get(*sid);
            let needle = value_str(&world.heap, &world.interns, item).unwrap_or("");
            Ok(hay.contains(needle))
        }
        _ => {
            let t = collection.type_name(&world.heap);
            Err(world.throw(RtTag::TypeError, format!("'in' on a value of type {t}")))
        }
    }
}

/// Member reads: object fields, getters, bound methods, named tuple slots,
/// class statics, builtin-type methods.
pub fn member_access(world: &mut World, tid: usize, obj: Value, name: StringId) -> RunResult<Value> {
    if let Value::Ref(id) = obj {
        match world.heap.get(id) {
            HeapData::Object(o) => {
                if let Some(&v) = o.fields.get(&name) {
                    return Ok(v);
                }
                let cid = o.class;
                if let Some(getter) = lookup_table(&world.classes, cid, name, TableKind::Getter) {
                    return super::call::call_function_sync(world, tid, getter, vec![obj]);
                }
                if let Some(m) = ClassInfo::resolve_method(&world.classes, cid, name) {
                    return Ok(world.heap.alloc_value(HeapData::Method { recv: obj, fun: m }));
                }
                return Ok(Value::Nil);
            }
            HeapData::Tuple(t) => {
                if let Some(names) = &t.names
                    && let Some(i) = names.iter().position(|n| *n == Some(name))
                {
                    return Ok(t.items[i]);
                }
            }
            HeapData::Tagged(stack, _) => {
                let stack = *stack;
                if let Some(tag) = world.tags.first(stack)
                    && let Some(m) = world.tags.lookup_method(tag, name)
                {
                    return Ok(world.heap.alloc_value(HeapData::Method { recv: obj, fun: m }));
                }
            }
            _ => {}
        }
    }
    if let Value::Class(cid) = obj
        && let Some(&v) = world.classes[cid.0 as usize].statics.get(&name)
    {
        return Ok(v);
    }

    // Builtin-type members resolve to bound builtin methods.
    if let Some(b) = crate::builtins::type_method_id(world, &obj, name) {
        return Ok(world.heap.alloc_value(HeapData::BuiltinMethod { recv: obj, builtin: b }));
    }

    let n = world.interns.get(name).to_string();
    let t = obj.type_name(&world.heap);
    Err(world.throw(RtTag::TypeError, format!("no member '{n}' on a value of type {t}")))
}

enum TableKind {
    Getter,
    Setter,
}

fn lookup_table(classes: &[ClassInfo], class: crate::value::ClassId, name: StringId, kind: TableKind) -> Option<Value> {
    let mut cur = Some(class);
    while let Some(c) = cur {
        let info = &classes[c.0 as usize];
        let table = match kind {
            TableKind::Getter => &info.getters,
            TableKind::Setter => &info.setters,
        };
        if let Some(&m) = table.get(&name) {
            return Some(m);
        }
        cur = info.super_;
    }
    None
}

fn member_assign(world: &mut World, tid: usize, obj: Value, name: StringId, value: Value) -> RunResult<()> {
    if let Value::Ref(id) = obj {
        if let HeapData::Object(o) = world.heap.get(id) {
            let cid = o.class;
            if let Some(setter) = lookup_table(&world.classes, cid, name, TableKind::Setter) {
                super::call::call_function_sync(world, tid, setter, vec![obj, value])?;
                return Ok(());
            }
            if let HeapData::Object(o) = world.heap.get_mut(id) {
                o.fields.insert(name, value);
            }
            return Ok(());
        }
    }
    let t = obj.type_name(&world.heap);
    Err(world.throw(RtTag::TypeError, format!("cannot assign a member on a value of type {t}")))
}

/// Pops the top tag from a tagged value; used by untagging assignment.
pub(super) fn untag_or_die(world: &mut World, v: Value, tag: TagId) -> RunResult<Value> {
    if let Value::Ref(id) = v
        && let HeapData::Tagged(stack, inner) = world.heap.get(id)
    {
        let (stack, inner) = (*stack, *inner);
        if world.tags.first(stack) == Some(tag) {
            let rest = world.tags.pop(stack);
            if rest == 0 {
                return Ok(inner);
            }
            return Ok(world.heap.alloc_value(HeapData::Tagged(rest, inner)));
        }
    }
    let name = world.interns.get(world.tags.name(tag)).to_string();
    Err(world.throw(RtTag::MatchError, format!("value does not carry tag {name}")))
}

