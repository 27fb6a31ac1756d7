//! Rendering values for `print`, string interpolation, and diagnostics.

use std::fmt::Write;

use crate::{
    heap::{HeapData, HeapId},
    types::dict_nth,
    value::Value,
};

use super::World;

/// Renders a value the way `print` shows it. Strings render raw at the top
/// level and quoted inside containers.
#[must_use]
pub fn display_value(world: &World, v: Value) -> String {
    render(world, v, false, 0)
}

const MAX_RENDER_DEPTH: usize = 16;

fn render(world: &World, v: Value, quoted: bool, depth: usize) -> String {
    if depth > MAX_RENDER_DEPTH {
        return "…".to_string();
    }
    match v {
        Value::Nil | Value::Sentinel => "nil".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Int(k) => k.to_string(),
        Value::Real(x) => {
            let mut buf = ryu::Buffer::new();
            buf.format(x).to_string()
        }
        Value::InternStr(id) => {
            let s = world.interns.get(id);
            if quoted { format!("'{s}'") } else { s.to_string() }
        }
        Value::Tag(t) => world.interns.get(world.tags.name(t)).to_string(),
        Value::Class(c) => {
            let name = world.interns.get(world.classes[c.0 as usize].name);
            format!("<class {name}>")
        }
        Value::Function(fid) => {
            let name = world.program.func(fid).name.map_or("<anonymous>", |n| world.interns.get(n));
            format!("<function {name}>")
        }
        Value::Builtin(b) => format!("<function {}>", crate::builtins::BUILTINS[b.0 as usize].name),
        Value::Regex(r) => format!("/{}/", world.program.regex_sources[r.0 as usize]),
        Value::Ptr(p) => format!("<pointer {p:#x}>"),
        Value::Ref(id) => render_heap(world, id, quoted, depth),
    }
}

fn render_heap(world: &World, id: HeapId, quoted: bool, depth: usize) -> String {
    match world.heap.get(id) {
        HeapData::Str(_) | HeapData::StrView { .. } => {
            let s = crate::value::heap_str(&world.heap, id).unwrap_or("");
            if quoted { format!("'{s}'") } else { s.to_string() }
        }
        HeapData::Array(xs) => {
            let mut out = String::from("[");
            for (i, x) in xs.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                out.push_str(&render(world, *x, true, depth + 1));
            }
            out.push(']');
            out
        }
        HeapData::Tuple(t) => {
            let mut out = String::from("(");
            for (i, x) in t.items.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                if let Some(names) = &t.names
                    && let Some(Some(n)) = names.get(i)
                {
                    let _ = write!(out, "{}: ", world.interns.get(*n));
                }
                out.push_str(&render(world, *x, true, depth + 1));
            }
            out.push(')');
            out
        }
        HeapData::Dict(d) => {
            let mut out = String::from("%{");
            for i in 0..d.len {
                if i > 0 {
                    out.push_str(", ");
                }
                if let Some((k, v)) = dict_nth(&world.heap, id, i) {
                    out.push_str(&render(world, k, true, depth + 1));
                    out.push_str(": ");
                    out.push_str(&render(world, v, true, depth + 1));
                }
            }
            out.push('}');
            out
        }
        HeapData::Blob(bytes) => format!("<blob {} bytes>", bytes.len()),
        HeapData::Tagged(stack, inner) => {
            let payload = render(world, *inner, true, depth + 1);
            world.tags.wrap(&world.interns, &payload, *stack)
        }
        HeapData::Cell(inner) => render(world, *inner, quoted, depth + 1),
        HeapData::Closure(c) => {
            let name = world.program.func(c.fid).name.map_or("<anonymous>", |n| world.interns.get(n));
            format!("<function {name}>")
        }
        HeapData::Generator(_) => "<generator>".to_string(),
        HeapData::Object(o) => {
            let name = world.interns.get(world.classes[o.class.0 as usize].name);
            format!("<{name} object>")
        }
        HeapData::Range(r) => {
            let lo = render(world, r.lo, true, depth + 1);
            let hi = render(world, r.hi, true, depth + 1);
            if r.inclusive { format!("{lo}...{hi}") } else { format!("{lo}..{hi}") }
        }
        HeapData::Method { fun, .. } => {
            let inner = render(world, *fun, false, depth + 1);
            format!("<bound {inner}>")
        }
        HeapData::BuiltinMethod { builtin, .. } => {
            format!("<method {}>", crate::builtins::BUILTINS[builtin.0 as usize].name)
        }
        HeapData::Iter(_) => "<iterator>".to_string(),
        HeapData::Thread(t) => format!("<thread {}>", t.tid),
        HeapData::Mutex(_) => "<mutex>".to_string(),
        HeapData::Condvar(_) => "<condvar>".to_string(),
        HeapData::Ast(_) => "<ast>".to_string(),
    }
}

/// Applies a format spec from an interpolated string: `[width][.prec][type]`
/// with `d`, `f`, `x`, `b`, and `s` conversion types.
#[must_use]
pub fn format_value(world: &World, v: Value, spec: &str) -> String {
    let spec = spec.trim();
    let (body, conv) = match spec.chars().last() {
        Some(c) if c.is_ascii_alphabetic() => (&spec[..spec.len() - 1], Some(c)),
        _ => (spec, None),
    };
    let (width_s, prec_s) = match body.split_once('.') {
        Some((w, p)) => (w, Some(p)),
        None => (body, None),
    };
    let width: usize = width_s.trim_start_matches('0').parse().unwrap_or(0);
    let zero_pad = width_s.starts_with('0') && width_s.len() > 1;
    let prec: Option<usize> = prec_s.and_then(|p| p.parse().ok());

    let base = match (conv, v) {
        (Some('x'), Value::Int(k)) => format!("{k:x}"),
        (Some('b'), Value::Int(k)) => format!("{k:b}"),
        (Some('f'), Value::Int(k)) => {
            #[expect(clippy::cast_precision_loss, reason = "formatting only")]
            let x = k as f64;
            format!("{x:.*}", prec.unwrap_or(6))
        }
        (Some('f'), Value::Real(x)) => format!("{x:.*}", prec.unwrap_or(6)),
        (_, Value::Real(x)) if prec.is_some() => format!("{x:.*}", prec.unwrap_or(6)),
        _ => display_value(world, v),
    };

    if base.len() >= width {
        return base;
    }
    let pad = width - base.len();
    if zero_pad && matches!(v, Value::Int(_) | Value::Real(_)) {
        let (sign, digits) = base.strip_prefix('-').map_or(("", base.as_str()), |d| ("-", d));
        format!("{sign}{}{digits}", "0".repeat(pad))
    } else {
        format!("{}{base}", " ".repeat(pad))
    }
}
