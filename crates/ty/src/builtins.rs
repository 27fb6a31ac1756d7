//! Builtin functions and builtin-type methods.
//!
//! Builtins are values in the global scope (`print`, `len`, `thread`, …).
//! Methods on builtin types (arrays, strings, dicts, generators) share the
//! same table: one entry per method name, dispatching on the receiver type,
//! with the receiver passed as argument zero.

use crate::{
    heap::HeapData,
    intern::StringId,
    types::{CondvarState, MutexState, dict_keys, dict_remove},
    value::{BuiltinId, Value, value_cmp, value_str},
    vm::{BlockOn, Flow, ParserDriver, RtTag, RunResult, VmError, World, call_function_sync, display_value},
};

/// What a builtin produced.
pub enum BuiltinOut {
    Value(Value),
    Block(BlockOn),
    /// The builtin pushed a frame itself.
    FramePushed,
}

/// One table entry.
pub struct BuiltinDef {
    pub name: &'static str,
    pub f: fn(&mut World, usize, Vec<Value>, Option<&mut dyn ParserDriver>) -> RunResult<BuiltinOut>,
}

macro_rules! builtin {
    ($name:literal, $f:ident) => {
        BuiltinDef { name: $name, f: $f }
    };
}

/// The builtin table. Indexed by [`BuiltinId`]; order is part of compiled
/// programs, so append only.
pub static BUILTINS: &[BuiltinDef] = &[
    builtin!("print", bi_print),
    builtin!("len", bi_len),
    builtin!("type", bi_type),
    builtin!("str", bi_str),
    builtin!("int", bi_int),
    builtin!("real", bi_real),
    builtin!("bool", bi_bool),
    builtin!("chr", bi_chr),
    builtin!("ord", bi_ord),
    builtin!("min", bi_min),
    builtin!("max", bi_max),
    builtin!("abs", bi_abs),
    builtin!("rand", bi_rand),
    builtin!("die", bi_die),
    builtin!("readLine", bi_read_line),
    builtin!("slurp", bi_slurp),
    builtin!("iter", bi_iter),
    builtin!("gc", bi_gc),
    builtin!("gcOff", bi_gc_off),
    builtin!("gcOn", bi_gc_on),
    builtin!("blob", bi_blob),
    builtin!("thread", bi_thread),
    builtin!("join", bi_join),
    builtin!("kill", bi_kill),
    builtin!("sleep", bi_sleep),
    builtin!("mutex", bi_mutex),
    builtin!("lock", bi_lock),
    builtin!("unlock", bi_unlock),
    builtin!("condvar", bi_condvar),
    builtin!("wait", bi_wait),
    builtin!("signal", bi_signal),
    builtin!("setFinalizer", bi_set_finalizer),
    builtin!("doc", bi_doc),
    builtin!("parse_get_expr", bi_parse_get_expr),
    builtin!("parse_get_stmt", bi_parse_get_stmt),
    builtin!("parse_get_type", bi_parse_get_type),
    builtin!("parse_get_token", bi_parse_get_token),
    builtin!("parse_next", bi_parse_next),
    builtin!("parse_fail", bi_parse_fail),
    // Builtin-type methods (receiver as argument zero).
    builtin!("push", m_push),
    builtin!("pop", m_pop),
    builtin!("map", m_map),
    builtin!("filter", m_filter),
    builtin!("sum", m_sum),
    builtin!("join", m_join),
    builtin!("contains?", m_contains),
    builtin!("reverse", m_reverse),
    builtin!("sort", m_sort),
    builtin!("keys", m_keys),
    builtin!("remove", m_remove),
    builtin!("default!", m_default),
    builtin!("next", m_next),
    builtin!("split", m_split),
    builtin!("upper", m_upper),
    builtin!("lower", m_lower),
    builtin!("match!", m_match),
    builtin!("slice", m_slice),
    builtin!("repr", m_repr),
];

/// Invokes builtin `b`.
pub fn call(
    world: &mut World,
    tid: usize,
    b: BuiltinId,
    args: Vec<Value>,
    driver: Option<&mut dyn ParserDriver>,
) -> RunResult<BuiltinOut> {
    (BUILTINS[b.0 as usize].f)(world, tid, args, driver)
}

/// Resolves a method name to its table entry. Methods sit at the tail of
/// the table and the search runs back-to-front, so in method position
/// `join` means the array method, not the thread builtin.
fn method_id_of(name: &str) -> Option<BuiltinId> {
    BUILTINS
        .iter()
        .rposition(|b| b.name == name)
        .map(|i| BuiltinId(u16::try_from(i).expect("builtin count fits u16")))
}

/// Which method names each builtin receiver type supports.
fn methods_for(world: &World, recv: &Value) -> &'static [&'static str] {
    match recv {
        Value::InternStr(_) => STR_METHODS,
        Value::Ref(id) => match world.heap.get(*id) {
            HeapData::Str(_) | HeapData::StrView { .. } => STR_METHODS,
            HeapData::Array(_) => ARRAY_METHODS,
            HeapData::Tuple(_) => TUPLE_METHODS,
            HeapData::Dict(_) => DICT_METHODS,
            HeapData::Generator(_) | HeapData::Iter(_) => GEN_METHODS,
            HeapData::Range(_) => RANGE_METHODS,
            _ => COMMON_METHODS,
        },
        _ => COMMON_METHODS,
    }
}

const COMMON_METHODS: &[&str] = &["str", "repr", "len"];
const ARRAY_METHODS: &[&str] = &[
    "len", "push", "pop", "map", "filter", "sum", "join", "contains?", "reverse", "sort", "slice", "str", "repr",
];
const TUPLE_METHODS: &[&str] = &["len", "contains?", "str", "repr"];
const STR_METHODS: &[&str] = &[
    "len", "split", "upper", "lower", "match!", "contains?", "slice", "str", "repr",
];
const DICT_METHODS: &[&str] = &["len", "keys", "remove", "contains?", "default!", "str", "repr"];
const GEN_METHODS: &[&str] = &["next", "str", "repr"];
const RANGE_METHODS: &[&str] = &["len", "contains?", "map", "filter", "sum", "str", "repr"];

/// Resolves `recv.name` to a builtin method id, when the receiver's type
/// supports it.
#[must_use]
pub fn type_method_id(world: &World, recv: &Value, name: StringId) -> Option<BuiltinId> {
    let name = world.interns.get(name);
    let supported = methods_for(world, recv);
    if !supported.contains(&name) && !matches!(name, "str" | "repr" | "len") {
        return None;
    }
    method_id_of(name)
}

/// `CallMethod` fallback for builtin receiver types.
pub fn call_type_method(
    world: &mut World,
    tid: usize,
    recv: Value,
    name: StringId,
    args: Vec<Value>,
) -> RunResult<Flow> {
    let Some(b) = type_method_id(world, &recv, name) else {
        let n = world.interns.get(name).to_string();
        let t = recv.type_name(&world.heap);
        return Err(world.throw(RtTag::TypeError, format!("no method '{n}' on a value of type {t}")));
    };
    let mut all = Vec::with_capacity(args.len() + 1);
    all.push(recv);
    all.extend(args);
    match call(world, tid, b, all, None)? {
        BuiltinOut::Value(v) => {
            world.push(tid, v);
            Ok(Flow::Continue)
        }
        BuiltinOut::Block(b) => Ok(Flow::Block(b)),
        BuiltinOut::FramePushed => Ok(Flow::Continue),
    }
}

// ----------------------------------------------------------------------
// Core builtins.
// ----------------------------------------------------------------------

fn bi_print(world: &mut World, _tid: usize, args: Vec<Value>, _d: Option<&mut dyn ParserDriver>) -> RunResult<BuiltinOut> {
    let mut out = String::new();
    for (i, a) in args.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        out.push_str(&display_value(world, *a));
    }
    out.push('\n');
    world.printer.write_str(&out);
    Ok(BuiltinOut::Value(Value::Nil))
}

fn bi_len(world: &mut World, _tid: usize, args: Vec<Value>, _d: Option<&mut dyn ParserDriver>) -> RunResult<BuiltinOut> {
    let v = one(world, &args)?;
    let n = crate::vm::ops_length(world, v)?;
    Ok(BuiltinOut::Value(Value::Int(n)))
}

fn bi_type(world: &mut World, _tid: usize, args: Vec<Value>, _d: Option<&mut dyn ParserDriver>) -> RunResult<BuiltinOut> {
    let v = one(world, &args)?;
    let id = world.interns.intern(v.type_name(&world.heap));
    Ok(BuiltinOut::Value(Value::InternStr(id)))
}

fn bi_str(world: &mut World, _tid: usize, args: Vec<Value>, _d: Option<&mut dyn ParserDriver>) -> RunResult<BuiltinOut> {
    let v = one(world, &args)?;
    let s = display_value(world, v);
    Ok(BuiltinOut::Value(world.heap.alloc_str(&s)))
}

fn bi_int(world: &mut World, _tid: usize, args: Vec<Value>, _d: Option<&mut dyn ParserDriver>) -> RunResult<BuiltinOut> {
    let v = one(world, &args)?;
    let out = match v {
        Value::Int(_) => v,
        #[expect(clippy::cast_possible_truncation, reason = "conversion truncates by contract")]
        Value::Real(x) => Value::Int(x as i64),
        Value::Bool(b) => Value::Int(i64::from(b)),
        _ => match value_str(&world.heap, &world.interns, &v).and_then(|s| s.trim().parse::<i64>().ok()) {
            Some(k) => Value::Int(k),
            None => Value::Nil,
        },
    };
    Ok(BuiltinOut::Value(out))
}

fn bi_real(world: &mut World, _tid: usize, args: Vec<Value>, _d: Option<&mut dyn ParserDriver>) -> RunResult<BuiltinOut> {
    let v = one(world, &args)?;
    let out = match v {
        Value::Real(_) => v,
        #[expect(clippy::cast_precision_loss, reason = "conversion by contract")]
        Value::Int(k) => Value::Real(k as f64),
        _ => match value_str(&world.heap, &world.interns, &v).and_then(|s| s.trim().parse::<f64>().ok()) {
            Some(x) => Value::Real(x),
            None => Value::Nil,
        },
    };
    Ok(BuiltinOut::Value(out))
}

fn bi_bool(world: &mut World, _tid: usize, args: Vec<Value>, _d: Option<&mut dyn ParserDriver>) -> RunResult<BuiltinOut> {
    let v = one(world, &args)?;
    Ok(BuiltinOut::Value(Value::Bool(v.truthy())))
}

fn bi_chr(world: &mut World, _tid: usize, args: Vec<Value>, _d: Option<&mut dyn ParserDriver>) -> RunResult<BuiltinOut> {
    let v = one(world, &args)?;
    let Value::Int(k) = v else {
        return Err(world.throw(RtTag::TypeError, "chr takes an integer"));
    };
    let c = u32::try_from(k).ok().and_then(char::from_u32);
    match c {
        Some(c) => Ok(BuiltinOut::Value(world.heap.alloc_str(&c.to_string()))),
        None => Err(world.throw(RtTag::TypeError, format!("invalid codepoint {k}"))),
    }
}

fn bi_ord(world: &mut World, _tid: usize, args: Vec<Value>, _d: Option<&mut dyn ParserDriver>) -> RunResult<BuiltinOut> {
    let v = one(world, &args)?;
    match value_str(&world.heap, &world.interns, &v).and_then(|s| s.chars().next()) {
        Some(c) => Ok(BuiltinOut::Value(Value::Int(i64::from(u32::from(c))))),
        None => Err(world.throw(RtTag::TypeError, "ord takes a non-empty string")),
    }
}

fn bi_min(world: &mut World, _tid: usize, args: Vec<Value>, _d: Option<&mut dyn ParserDriver>) -> RunResult<BuiltinOut> {
    extremum(world, args, std::cmp::Ordering::Less)
}

fn bi_max(world: &mut World, _tid: usize, args: Vec<Value>, _d: Option<&mut dyn ParserDriver>) -> RunResult<BuiltinOut> {
    extremum(world, args, std::cmp::Ordering::Greater)
}

fn extremum(world: &mut World, args: Vec<Value>, want: std::cmp::Ordering) -> RunResult<BuiltinOut> {
    let mut best: Option<Value> = None;
    for a in args {
        best = Some(match best {
            None => a,
            Some(b) => match value_cmp(&world.heap, &world.interns, &a, &b) {
                Some(ord) if ord == want => a,
                Some(_) => b,
                None => return Err(world.throw(RtTag::TypeError, "values are not ordered")),
            },
        });
    }
    Ok(BuiltinOut::Value(best.unwrap_or(Value::Nil)))
}

fn bi_abs(world: &mut World, _tid: usize, args: Vec<Value>, _d: Option<&mut dyn ParserDriver>) -> RunResult<BuiltinOut> {
    let v = one(world, &args)?;
    match v {
        Value::Int(k) => Ok(BuiltinOut::Value(Value::Int(k.wrapping_abs()))),
        Value::Real(x) => Ok(BuiltinOut::Value(Value::Real(x.abs()))),
        _ => Err(world.throw(RtTag::TypeError, "abs takes a number")),
    }
}

fn bi_rand(world: &mut World, _tid: usize, args: Vec<Value>, _d: Option<&mut dyn ParserDriver>) -> RunResult<BuiltinOut> {
    // xorshift64*.
    let mut x = world.rng;
    x ^= x >> 12;
    x ^= x << 25;
    x ^= x >> 27;
    world.rng = x;
    let r = x.wrapping_mul(0x2545_f491_4f6c_dd1d);
    match args.first() {
        Some(Value::Int(n)) if *n > 0 => {
            let k = i64::try_from(r % u64::try_from(*n).expect("positive bound")).expect("bounded");
            Ok(BuiltinOut::Value(Value::Int(k)))
        }
        _ => {
            #[expect(clippy::cast_precision_loss, reason = "uniform real in [0, 1)")]
            let f = (r >> 11) as f64 / (1u64 << 53) as f64;
            Ok(BuiltinOut::Value(Value::Real(f)))
        }
    }
}

fn bi_die(world: &mut World, _tid: usize, args: Vec<Value>, _d: Option<&mut dyn ParserDriver>) -> RunResult<BuiltinOut> {
    let msg = args.first().map_or_else(|| "died".to_string(), |v| display_value(world, *v));
    Err(VmError::Fatal(msg))
}

fn bi_read_line(world: &mut World, _tid: usize, _args: Vec<Value>, _d: Option<&mut dyn ParserDriver>) -> RunResult<BuiltinOut> {
    let mut line = String::new();
    match std::io::stdin().read_line(&mut line) {
        Ok(0) => Ok(BuiltinOut::Value(Value::Nil)),
        Ok(_) => {
            let trimmed = line.trim_end_matches(['\n', '\r']);
            Ok(BuiltinOut::Value(world.heap.alloc_str(trimmed)))
        }
        Err(e) => Err(VmError::Fatal(format!("readLine failed: {e}"))),
    }
}

fn bi_slurp(world: &mut World, _tid: usize, args: Vec<Value>, _d: Option<&mut dyn ParserDriver>) -> RunResult<BuiltinOut> {
    let v = one(world, &args)?;
    let Some(path) = value_str(&world.heap, &world.interns, &v).map(str::to_string) else {
        return Err(world.throw(RtTag::TypeError, "slurp takes a path string"));
    };
    match std::fs::read_to_string(&path) {
        Ok(text) => Ok(BuiltinOut::Value(world.heap.alloc_str(&text))),
        Err(e) => Err(world.throw(RtTag::TypeError, format!("cannot read '{path}': {e}"))),
    }
}

fn bi_iter(world: &mut World, _tid: usize, args: Vec<Value>, _d: Option<&mut dyn ParserDriver>) -> RunResult<BuiltinOut> {
    let v = one(world, &args)?;
    let it = crate::vm::get_iter_value(world, v)?;
    Ok(BuiltinOut::Value(it))
}

fn bi_gc(world: &mut World, tid: usize, _args: Vec<Value>, _d: Option<&mut dyn ParserDriver>) -> RunResult<BuiltinOut> {
    world.collect_garbage();
    world.drain_finalizers(tid);
    Ok(BuiltinOut::Value(Value::Int(
        i64::try_from(world.heap.live_count()).unwrap_or(i64::MAX),
    )))
}

fn bi_gc_off(world: &mut World, _tid: usize, _args: Vec<Value>, _d: Option<&mut dyn ParserDriver>) -> RunResult<BuiltinOut> {
    world.heap.gc_disable();
    Ok(BuiltinOut::Value(Value::Nil))
}

fn bi_gc_on(world: &mut World, _tid: usize, _args: Vec<Value>, _d: Option<&mut dyn ParserDriver>) -> RunResult<BuiltinOut> {
    world.heap.gc_enable();
    Ok(BuiltinOut::Value(Value::Nil))
}

fn bi_blob(world: &mut World, _tid: usize, args: Vec<Value>, _d: Option<&mut dyn ParserDriver>) -> RunResult<BuiltinOut> {
    let bytes = match args.first() {
        None => Vec::new(),
        Some(Value::Int(n)) => vec![0u8; usize::try_from(*n).unwrap_or(0)],
        Some(v) => match value_str(&world.heap, &world.interns, v) {
            Some(s) => s.as_bytes().to_vec(),
            None => return Err(world.throw(RtTag::TypeError, "blob takes a size or a string")),
        },
    };
    Ok(BuiltinOut::Value(world.heap.alloc_value(HeapData::Blob(bytes))))
}

fn bi_set_finalizer(world: &mut World, _tid: usize, args: Vec<Value>, _d: Option<&mut dyn ParserDriver>) -> RunResult<BuiltinOut> {
    let (obj, f) = two(world, &args)?;
    if let Value::Ref(id) = obj
        && let HeapData::Object(o) = world.heap.get_mut(id)
    {
        o.finalizer = Some(f);
        return Ok(BuiltinOut::Value(Value::Nil));
    }
    Err(world.throw(RtTag::TypeError, "setFinalizer takes an object"))
}

/// `doc(f)`: a human-readable description of a callable, reconstructed from
/// its compiled signature; nil for anything else.
fn bi_doc(world: &mut World, _tid: usize, args: Vec<Value>, _d: Option<&mut dyn ParserDriver>) -> RunResult<BuiltinOut> {
    let v = one(world, &args)?;
    let fid = match v {
        Value::Function(fid) => Some(fid),
        Value::Ref(id) => match world.heap.get(id) {
            HeapData::Closure(c) => Some(c.fid),
            HeapData::Method { fun: Value::Function(fid), .. } => Some(*fid),
            _ => None,
        },
        Value::Builtin(b) => {
            let s = format!("builtin {}", BUILTINS[b.0 as usize].name);
            return Ok(BuiltinOut::Value(world.heap.alloc_str(&s)));
        }
        _ => None,
    };
    let Some(fid) = fid else {
        return Ok(BuiltinOut::Value(Value::Nil));
    };

    let info = world.program.func(fid);
    let name = info.name.map_or("<anonymous>", |n| world.interns.get(n));
    let mut out = format!("function {name}(");
    for (i, p) in info.params.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        if info.rest == Some(i as u32) {
            out.push('*');
        } else if info.kwargs == Some(i as u32) {
            out.push('%');
        }
        out.push_str(world.interns.get(p.name));
    }
    out.push(')');
    Ok(BuiltinOut::Value(world.heap.alloc_str(&out)))
}

// ----------------------------------------------------------------------
// Threads and locking.
// ----------------------------------------------------------------------

fn bi_thread(world: &mut World, _tid: usize, mut args: Vec<Value>, _d: Option<&mut dyn ParserDriver>) -> RunResult<BuiltinOut> {
    if args.is_empty() {
        return Err(world.throw(RtTag::TypeError, "thread takes a function"));
    }
    let f = args.remove(0);
    let handle = crate::vm::spawn_thread(world, f, args)?;
    Ok(BuiltinOut::Value(handle))
}

fn thread_of(world: &mut World, v: Value) -> RunResult<usize> {
    if let Value::Ref(id) = v
        && let HeapData::Thread(t) = world.heap.get(id)
    {
        return Ok(t.tid);
    }
    Err(world.throw(RtTag::TypeError, "expected a thread handle"))
}

fn bi_join(world: &mut World, _tid: usize, args: Vec<Value>, _d: Option<&mut dyn ParserDriver>) -> RunResult<BuiltinOut> {
    let v = one(world, &args)?;
    let other = thread_of(world, v)?;
    Ok(BuiltinOut::Block(BlockOn::Join(other)))
}

fn bi_kill(world: &mut World, _tid: usize, args: Vec<Value>, _d: Option<&mut dyn ParserDriver>) -> RunResult<BuiltinOut> {
    let v = one(world, &args)?;
    let other = thread_of(world, v)?;
    world.threads[other].cancel = true;
    Ok(BuiltinOut::Value(Value::Nil))
}

fn bi_sleep(world: &mut World, _tid: usize, args: Vec<Value>, _d: Option<&mut dyn ParserDriver>) -> RunResult<BuiltinOut> {
    let ms = match one(world, &args)? {
        Value::Int(ms) if ms >= 0 => u64::try_from(ms).expect("checked non-negative"),
        #[expect(clippy::cast_possible_truncation, clippy::cast_sign_loss, reason = "seconds to millis")]
        Value::Real(s) if s >= 0.0 => (s * 1000.0) as u64,
        _ => return Err(world.throw(RtTag::TypeError, "sleep takes a non-negative duration")),
    };
    Ok(BuiltinOut::Block(BlockOn::SleepMs(ms)))
}

fn bi_mutex(world: &mut World, _tid: usize, _args: Vec<Value>, _d: Option<&mut dyn ParserDriver>) -> RunResult<BuiltinOut> {
    Ok(BuiltinOut::Value(world.heap.alloc_value(HeapData::Mutex(MutexState::default()))))
}

fn mutex_of(world: &mut World, v: Value) -> RunResult<crate::heap::HeapId> {
    if let Value::Ref(id) = v
        && matches!(world.heap.get(id), HeapData::Mutex(_))
    {
        return Ok(id);
    }
    Err(world.throw(RtTag::TypeError, "expected a mutex"))
}

fn bi_lock(world: &mut World, tid: usize, args: Vec<Value>, _d: Option<&mut dyn ParserDriver>) -> RunResult<BuiltinOut> {
    let v = one(world, &args)?;
    let m = mutex_of(world, v)?;
    if let HeapData::Mutex(s) = world.heap.get_mut(m) {
        if s.locked_by.is_none() {
            s.locked_by = Some(tid);
            return Ok(BuiltinOut::Value(Value::Nil));
        }
    }
    Ok(BuiltinOut::Block(BlockOn::MutexLock(m)))
}

fn bi_unlock(world: &mut World, _tid: usize, args: Vec<Value>, _d: Option<&mut dyn ParserDriver>) -> RunResult<BuiltinOut> {
    let v = one(world, &args)?;
    let m = mutex_of(world, v)?;
    if let HeapData::Mutex(s) = world.heap.get_mut(m) {
        s.locked_by = None;
    }
    if let Some(shared) = world.shared.upgrade() {
        shared.cv.notify_all();
    }
    Ok(BuiltinOut::Value(Value::Nil))
}

fn bi_condvar(world: &mut World, _tid: usize, _args: Vec<Value>, _d: Option<&mut dyn ParserDriver>) -> RunResult<BuiltinOut> {
    Ok(BuiltinOut::Value(world.heap.alloc_value(HeapData::Condvar(CondvarState::default()))))
}

fn bi_wait(world: &mut World, _tid: usize, args: Vec<Value>, _d: Option<&mut dyn ParserDriver>) -> RunResult<BuiltinOut> {
    let (cv_val, m_val) = two(world, &args)?;
    let Value::Ref(cv) = cv_val else {
        return Err(world.throw(RtTag::TypeError, "wait takes a condvar and a mutex"));
    };
    let seen = match world.heap.get(cv) {
        HeapData::Condvar(c) => c.generation,
        _ => return Err(world.throw(RtTag::TypeError, "wait takes a condvar and a mutex")),
    };
    let m = mutex_of(world, m_val)?;
    Ok(BuiltinOut::Block(BlockOn::CondWait { cv, mutex: m, seen }))
}

fn bi_signal(world: &mut World, _tid: usize, args: Vec<Value>, _d: Option<&mut dyn ParserDriver>) -> RunResult<BuiltinOut> {
    let v = one(world, &args)?;
    if let Value::Ref(id) = v
        && let HeapData::Condvar(c) = world.heap.get_mut(id)
    {
        c.generation += 1;
        if let Some(shared) = world.shared.upgrade() {
            shared.cv.notify_all();
        }
        return Ok(BuiltinOut::Value(Value::Nil));
    }
    Err(world.throw(RtTag::TypeError, "signal takes a condvar"))
}

// ----------------------------------------------------------------------
// Parser entry points (fun-macros).
// ----------------------------------------------------------------------

fn with_driver<T>(
    world: &mut World,
    d: Option<&mut dyn ParserDriver>,
    f: impl FnOnce(&mut World, &mut dyn ParserDriver) -> RunResult<T>,
) -> RunResult<T> {
    match d {
        Some(driver) => f(world, driver),
        None => Err(VmError::Fatal("parser entry points are only available inside macros".to_string())),
    }
}

fn ast_value(world: &mut World, e: crate::ast::Expr) -> Value {
    world.heap.alloc_value(HeapData::Ast(crate::types::AstValue::Expr(Box::new(e))))
}

fn bi_parse_get_expr(world: &mut World, _tid: usize, _args: Vec<Value>, d: Option<&mut dyn ParserDriver>) -> RunResult<BuiltinOut> {
    with_driver(world, d, |world, drv| {
        let e = drv.get_expr().map_err(|diag| VmError::Fatal(diag.message))?;
        Ok(BuiltinOut::Value(ast_value(world, e)))
    })
}

fn bi_parse_get_stmt(world: &mut World, _tid: usize, _args: Vec<Value>, d: Option<&mut dyn ParserDriver>) -> RunResult<BuiltinOut> {
    with_driver(world, d, |world, drv| {
        let s = drv.get_stmt().map_err(|diag| VmError::Fatal(diag.message))?;
        let v = world
            .heap
            .alloc_value(HeapData::Ast(crate::types::AstValue::Stmt(Box::new(s))));
        Ok(BuiltinOut::Value(v))
    })
}

fn bi_parse_get_type(world: &mut World, _tid: usize, _args: Vec<Value>, d: Option<&mut dyn ParserDriver>) -> RunResult<BuiltinOut> {
    with_driver(world, d, |world, drv| {
        let e = drv.get_type().map_err(|diag| VmError::Fatal(diag.message))?;
        Ok(BuiltinOut::Value(ast_value(world, e)))
    })
}

fn bi_parse_get_token(world: &mut World, _tid: usize, _args: Vec<Value>, d: Option<&mut dyn ParserDriver>) -> RunResult<BuiltinOut> {
    with_driver(world, d, |world, drv| {
        let text = drv.get_token_text();
        Ok(BuiltinOut::Value(world.heap.alloc_str(&text)))
    })
}

fn bi_parse_next(world: &mut World, _tid: usize, _args: Vec<Value>, d: Option<&mut dyn ParserDriver>) -> RunResult<BuiltinOut> {
    with_driver(world, d, |_world, drv| {
        drv.next_token();
        Ok(BuiltinOut::Value(Value::Nil))
    })
}

fn bi_parse_fail(world: &mut World, _tid: usize, args: Vec<Value>, d: Option<&mut dyn ParserDriver>) -> RunResult<BuiltinOut> {
    let msg = args
        .first()
        .and_then(|v| value_str(&world.heap, &world.interns, v))
        .unwrap_or("macro error")
        .to_string();
    with_driver(world, d, |_world, drv| {
        let diag = drv.fail(&msg);
        Err(VmError::Fatal(diag.message))
    })
}

// ----------------------------------------------------------------------
// Builtin-type methods. Receiver is args[0].
// ----------------------------------------------------------------------

fn one(world: &mut World, args: &[Value]) -> RunResult<Value> {
    args.first()
        .copied()
        .ok_or_else(|| world.throw(RtTag::ArityError, "missing argument"))
}

fn two(world: &mut World, args: &[Value]) -> RunResult<(Value, Value)> {
    match args {
        [a, b, ..] => Ok((*a, *b)),
        _ => Err(world.throw(RtTag::ArityError, "missing argument")),
    }
}

fn array_of(world: &mut World, v: Value) -> RunResult<crate::heap::HeapId> {
    if let Value::Ref(id) = v
        && matches!(world.heap.get(id), HeapData::Array(_))
    {
        return Ok(id);
    }
    Err(world.throw(RtTag::TypeError, "expected an array"))
}

fn m_push(world: &mut World, _tid: usize, args: Vec<Value>, _d: Option<&mut dyn ParserDriver>) -> RunResult<BuiltinOut> {
    let (recv, item) = two(world, &args)?;
    let id = array_of(world, recv)?;
    if let HeapData::Array(xs) = world.heap.get_mut(id) {
        xs.push(item);
    }
    Ok(BuiltinOut::Value(recv))
}

fn m_pop(world: &mut World, _tid: usize, args: Vec<Value>, _d: Option<&mut dyn ParserDriver>) -> RunResult<BuiltinOut> {
    let recv = one(world, &args)?;
    let id = array_of(world, recv)?;
    let popped = match world.heap.get_mut(id) {
        HeapData::Array(xs) => xs.pop(),
        _ => None,
    };
    Ok(BuiltinOut::Value(popped.unwrap_or(Value::Nil)))
}

/// Elements of an iterable receiver, for the collection methods.
fn elements(world: &mut World, v: Value) -> RunResult<Vec<Value>> {
    match v {
        Value::Ref(id) => match world.heap.get(id) {
            HeapData::Array(xs) => Ok(xs.clone()),
            HeapData::Tuple(t) => Ok(t.items.clone()),
            HeapData::Range(r) => {
                let (lo, hi, inc) = (r.lo, r.hi, r.inclusive);
                match (lo, hi) {
                    (Value::Int(a), Value::Int(b)) => {
                        let end = if inc { b + 1 } else { b };
                        Ok((a..end).map(Value::Int).collect())
                    }
                    _ => Err(world.throw(RtTag::TypeError, "range endpoints must be integers")),
                }
            }
            _ => Err(world.throw(RtTag::TypeError, "expected an iterable")),
        },
        _ => Err(world.throw(RtTag::TypeError, "expected an iterable")),
    }
}

fn m_map(world: &mut World, tid: usize, args: Vec<Value>, _d: Option<&mut dyn ParserDriver>) -> RunResult<BuiltinOut> {
    let (recv, f) = two(world, &args)?;
    let xs = elements(world, recv)?;
    let mut out = Vec::with_capacity(xs.len());
    // Results stay rooted through the out-vector only after the alloc, so
    // keep collection off while user code runs.
    world.heap.gc_disable();
    let r: RunResult<()> = xs.into_iter().try_for_each(|x| {
        out.push(call_function_sync(world, tid, f, vec![x])?);
        Ok(())
    });
    world.heap.gc_enable();
    r?;
    Ok(BuiltinOut::Value(world.heap.alloc_value(HeapData::Array(out))))
}

fn m_filter(world: &mut World, tid: usize, args: Vec<Value>, _d: Option<&mut dyn ParserDriver>) -> RunResult<BuiltinOut> {
    let (recv, f) = two(world, &args)?;
    let xs = elements(world, recv)?;
    let mut out = Vec::new();
    world.heap.gc_disable();
    let r: RunResult<()> = xs.into_iter().try_for_each(|x| {
        if call_function_sync(world, tid, f, vec![x])?.truthy() {
            out.push(x);
        }
        Ok(())
    });
    world.heap.gc_enable();
    r?;
    Ok(BuiltinOut::Value(world.heap.alloc_value(HeapData::Array(out))))
}

fn m_sum(world: &mut World, _tid: usize, args: Vec<Value>, _d: Option<&mut dyn ParserDriver>) -> RunResult<BuiltinOut> {
    let recv = one(world, &args)?;
    let xs = elements(world, recv)?;
    let mut acc = Value::Int(0);
    for x in xs {
        acc = crate::vm::ops_binary(world, crate::compile::op::Opcode::Add, acc, x)?;
    }
    Ok(BuiltinOut::Value(acc))
}

fn m_join(world: &mut World, _tid: usize, args: Vec<Value>, _d: Option<&mut dyn ParserDriver>) -> RunResult<BuiltinOut> {
    let (recv, sep) = match args.len() {
        0 => return Err(world.throw(RtTag::ArityError, "missing argument")),
        1 => (args[0], None),
        _ => (args[0], Some(args[1])),
    };
    let sep = match sep {
        Some(v) => value_str(&world.heap, &world.interns, &v)
            .map(str::to_string)
            .unwrap_or_default(),
        None => String::new(),
    };
    let xs = elements(world, recv)?;
    let mut out = String::new();
    for (i, x) in xs.iter().enumerate() {
        if i > 0 {
            out.push_str(&sep);
        }
        out.push_str(&display_value(world, *x));
    }
    Ok(BuiltinOut::Value(world.heap.alloc_str(&out)))
}

fn m_contains(world: &mut World, _tid: usize, args: Vec<Value>, _d: Option<&mut dyn ParserDriver>) -> RunResult<BuiltinOut> {
    let (recv, item) = two(world, &args)?;
    let found = crate::vm::ops_contains(world, &recv, &item)?;
    Ok(BuiltinOut::Value(Value::Bool(found)))
}

fn m_reverse(world: &mut World, _tid: usize, args: Vec<Value>, _d: Option<&mut dyn ParserDriver>) -> RunResult<BuiltinOut> {
    let recv = one(world, &args)?;
    let id = array_of(world, recv)?;
    if let HeapData::Array(xs) = world.heap.get_mut(id) {
        xs.reverse();
    }
    Ok(BuiltinOut::Value(recv))
}

fn m_sort(world: &mut World, _tid: usize, args: Vec<Value>, _d: Option<&mut dyn ParserDriver>) -> RunResult<BuiltinOut> {
    let recv = one(world, &args)?;
    let id = array_of(world, recv)?;
    let mut xs = match world.heap.get(id) {
        HeapData::Array(xs) => xs.clone(),
        _ => Vec::new(),
    };
    xs.sort_by(|a, b| value_cmp(&world.heap, &world.interns, a, b).unwrap_or(std::cmp::Ordering::Equal));
    if let HeapData::Array(slot) = world.heap.get_mut(id) {
        *slot = xs;
    }
    Ok(BuiltinOut::Value(recv))
}

fn m_keys(world: &mut World, _tid: usize, args: Vec<Value>, _d: Option<&mut dyn ParserDriver>) -> RunResult<BuiltinOut> {
    let recv = one(world, &args)?;
    if let Value::Ref(id) = recv
        && matches!(world.heap.get(id), HeapData::Dict(_))
    {
        let keys = dict_keys(&world.heap, id);
        return Ok(BuiltinOut::Value(world.heap.alloc_value(HeapData::Array(keys))));
    }
    Err(world.throw(RtTag::TypeError, "keys takes a dict"))
}

fn m_remove(world: &mut World, _tid: usize, args: Vec<Value>, _d: Option<&mut dyn ParserDriver>) -> RunResult<BuiltinOut> {
    let (recv, key) = two(world, &args)?;
    if let Value::Ref(id) = recv
        && matches!(world.heap.get(id), HeapData::Dict(_))
    {
        let removed = dict_remove(&mut world.heap, &world.interns, id, &key);
        return Ok(BuiltinOut::Value(removed.unwrap_or(Value::Nil)));
    }
    Err(world.throw(RtTag::TypeError, "remove takes a dict"))
}

fn m_default(world: &mut World, _tid: usize, args: Vec<Value>, _d: Option<&mut dyn ParserDriver>) -> RunResult<BuiltinOut> {
    let (recv, dflt) = two(world, &args)?;
    if let Value::Ref(id) = recv
        && let HeapData::Dict(d) = world.heap.get_mut(id)
    {
        d.dflt = Some(dflt);
        return Ok(BuiltinOut::Value(recv));
    }
    Err(world.throw(RtTag::TypeError, "default! takes a dict"))
}

fn m_next(world: &mut World, tid: usize, args: Vec<Value>, _d: Option<&mut dyn ParserDriver>) -> RunResult<BuiltinOut> {
    let recv = one(world, &args)?;
    // Generators resume directly: the yielded value (or the end sentinel)
    // lands on the stack when the generator suspends again.
    let generator = match recv {
        Value::Ref(id) => match world.heap.get(id) {
            HeapData::Generator(_) => Some(id),
            HeapData::Iter(crate::types::Iter::Gen { generator }) => Some(*generator),
            _ => None,
        },
        _ => None,
    };
    if let Some(generator) = generator {
        // Either a frame was pushed (value arrives at the next yield) or
        // the end sentinel was pushed directly.
        let _ = crate::vm::resume_generator_flow(world, tid, generator)?;
        return Ok(BuiltinOut::FramePushed);
    }

    // Other iterators advance inline; nil at exhaustion.
    let it = crate::vm::get_iter_value(world, recv)?;
    world.push(tid, it);
    match crate::vm::iter_next_flow(world, tid)? {
        Flow::Continue => {
            let next = world.pop(tid);
            world.pop(tid);
            let out = if matches!(next, Value::Sentinel) { Value::Nil } else { next };
            Ok(BuiltinOut::Value(out))
        }
        _ => Err(VmError::Fatal("iterator advance blocked".to_string())),
    }
}

fn m_split(world: &mut World, _tid: usize, args: Vec<Value>, _d: Option<&mut dyn ParserDriver>) -> RunResult<BuiltinOut> {
    let (recv, sep) = two(world, &args)?;
    let Some(text) = value_str(&world.heap, &world.interns, &recv).map(str::to_string) else {
        return Err(world.throw(RtTag::TypeError, "split takes a string"));
    };
    let Some(sep) = value_str(&world.heap, &world.interns, &sep).map(str::to_string) else {
        return Err(world.throw(RtTag::TypeError, "split separator must be a string"));
    };
    let parts: Vec<Value> = text.split(&sep).map(|p| world.heap.alloc_str(p)).collect();
    Ok(BuiltinOut::Value(world.heap.alloc_value(HeapData::Array(parts))))
}

fn m_upper(world: &mut World, _tid: usize, args: Vec<Value>, _d: Option<&mut dyn ParserDriver>) -> RunResult<BuiltinOut> {
    let recv = one(world, &args)?;
    let Some(text) = value_str(&world.heap, &world.interns, &recv) else {
        return Err(world.throw(RtTag::TypeError, "upper takes a string"));
    };
    let out = text.to_uppercase();
    Ok(BuiltinOut::Value(world.heap.alloc_str(&out)))
}

fn m_lower(world: &mut World, _tid: usize, args: Vec<Value>, _d: Option<&mut dyn ParserDriver>) -> RunResult<BuiltinOut> {
    let recv = one(world, &args)?;
    let Some(text) = value_str(&world.heap, &world.interns, &recv) else {
        return Err(world.throw(RtTag::TypeError, "lower takes a string"));
    };
    let out = text.to_lowercase();
    Ok(BuiltinOut::Value(world.heap.alloc_str(&out)))
}

/// `s.match!(re)`: the full match, or an array when the pattern has groups;
/// nil on no match.
fn m_match(world: &mut World, _tid: usize, args: Vec<Value>, _d: Option<&mut dyn ParserDriver>) -> RunResult<BuiltinOut> {
    let (recv, re_val) = two(world, &args)?;
    let Some(text) = value_str(&world.heap, &world.interns, &recv).map(str::to_string) else {
        return Err(world.throw(RtTag::TypeError, "match! takes a string"));
    };
    let Value::Regex(rid) = re_val else {
        return Err(world.throw(RtTag::TypeError, "match! takes a regex"));
    };
    let re = world.program.regexes[rid.0 as usize].clone();
    match re.captures(&text) {
        Ok(Some(caps)) => {
            if caps.len() == 1 {
                let m = caps.get(0).map(|m| m.as_str().to_string()).unwrap_or_default();
                Ok(BuiltinOut::Value(world.heap.alloc_str(&m)))
            } else {
                let groups: Vec<String> = (0..caps.len())
                    .map(|i| caps.get(i).map(|m| m.as_str().to_string()).unwrap_or_default())
                    .collect();
                drop(caps);
                let items: Vec<Value> = groups.iter().map(|g| world.heap.alloc_str(g)).collect();
                Ok(BuiltinOut::Value(world.heap.alloc_value(HeapData::Array(items))))
            }
        }
        Ok(None) => Ok(BuiltinOut::Value(Value::Nil)),
        Err(e) => Err(world.throw(RtTag::TypeError, format!("regex engine failure: {e}"))),
    }
}

fn m_slice(world: &mut World, _tid: usize, args: Vec<Value>, _d: Option<&mut dyn ParserDriver>) -> RunResult<BuiltinOut> {
    let recv = one(world, &args)?;
    let i = args.get(1).copied().unwrap_or(Value::Nil);
    let j = args.get(2).copied().unwrap_or(Value::Nil);
    let k = args.get(3).copied().unwrap_or(Value::Nil);
    let out = crate::vm::ops_slice(world, recv, i, j, k)?;
    Ok(BuiltinOut::Value(out))
}

fn m_repr(world: &mut World, _tid: usize, args: Vec<Value>, _d: Option<&mut dyn ParserDriver>) -> RunResult<BuiltinOut> {
    let recv = one(world, &args)?;
    let s = match value_str(&world.heap, &world.interns, &recv) {
        Some(text) => format!("'{text}'"),
        None => display_value(world, recv),
    };
    Ok(BuiltinOut::Value(world.heap.alloc_str(&s)))
}
