//! Calls: closures, builtins, tags, classes, methods, and generators.

use crate::{
    compile::code::FuncInfo,
    heap::{HeapData, HeapId},
    intern::StringId,
    scope::CaptureSrc,
    types::{ClassInfo, Closure, Generator, Object, SavedFrame, SavedHandler, Tuple},
    value::{ClassId, FunctionId, Value},
};

use super::{Flow, Frame, Handler, ParserDriver, RtTag, RunResult, VmError, World};

/// Builds a closure (or plain function value when nothing is captured) from
/// the current frame per the function's capture list.
pub fn make_closure(world: &mut World, tid: usize, fid: FunctionId) {
    let captures = world.program.func(fid).captures.clone();
    if captures.is_empty() {
        world.push(tid, Value::Function(fid));
        return;
    }
    let mut env = Vec::with_capacity(captures.len());
    for src in captures {
        let cell = match src {
            CaptureSrc::Local(slot) => {
                // Captured locals are celled at frame entry.
                match world.frame(tid).locals[slot as usize] {
                    Value::Ref(id) if matches!(world.heap.get(id), HeapData::Cell(_)) => id,
                    other => {
                        // First capture of a slot the compiler did not cell
                        // (environment built outside a frame); wrap now.
                        let id = world.heap.alloc(HeapData::Cell(other));
                        world.frame_mut(tid).locals[slot as usize] = Value::Ref(id);
                        id
                    }
                }
            }
            CaptureSrc::Capture(idx) => world.frame(tid).env[idx as usize],
        };
        env.push(cell);
    }
    let v = world.heap.alloc_value(HeapData::Closure(Closure { fid, env }));
    world.push(tid, v);
}

/// `Call` / `CallKw`: pops the callee (and kwargs dict), binds arguments,
/// and either pushes a frame or completes inline (builtins, tags).
pub fn do_call(
    world: &mut World,
    tid: usize,
    nargs: u32,
    has_kw: bool,
    driver: Option<&mut dyn ParserDriver>,
) -> RunResult<Flow> {
    let callee = world.pop(tid);
    let kw = if has_kw { Some(world.pop(tid)) } else { None };
    let args = world.pop_args(tid, nargs);
    call_value(world, tid, callee, args, kw, driver)
}

/// Calls `callee` with already-popped arguments.
pub fn call_value(
    world: &mut World,
    tid: usize,
    callee: Value,
    args: Vec<Value>,
    kw: Option<Value>,
    driver: Option<&mut dyn ParserDriver>,
) -> RunResult<Flow> {
    match callee {
        Value::Function(fid) => push_function_frame(world, tid, fid, Vec::new(), args, kw, None, None),
        Value::Ref(id) => match world.heap.get(id) {
            HeapData::Closure(c) => {
                let (fid, env) = (c.fid, c.env.clone());
                push_function_frame(world, tid, fid, env, args, kw, None, None)
            }
            HeapData::Method { recv, fun } => {
                let (recv, fun) = (*recv, *fun);
                let mut all = Vec::with_capacity(args.len() + 1);
                all.push(recv);
                all.extend(args);
                call_value(world, tid, fun, all, kw, driver)
            }
            HeapData::BuiltinMethod { recv, builtin } => {
                let (recv, builtin) = (*recv, *builtin);
                let mut all = Vec::with_capacity(args.len() + 1);
                all.push(recv);
                all.extend(args);
                call_builtin(world, tid, builtin, all, driver)
            }
            _ => {
                let t = callee.type_name(&world.heap);
                Err(world.throw(RtTag::TypeError, format!("call of non-function value of type {t}")))
            }
        },
        Value::Builtin(b) => call_builtin(world, tid, b, args, driver),
        Value::Tag(t) => {
            // Applying a tag wraps the payload (a tuple for multiple args).
            let payload = match args.len() {
                0 => Value::Nil,
                1 => args[0],
                _ => world.heap.alloc_value(HeapData::Tuple(Tuple { items: args, names: None })),
            };
            let wrapped = super::ops::tag_push(world, payload, t);
            world.push(tid, wrapped);
            Ok(Flow::Continue)
        }
        Value::Class(cid) => instantiate(world, tid, cid, args, kw),
        _ => {
            let t = callee.type_name(&world.heap);
            Err(world.throw(RtTag::TypeError, format!("call of non-function value of type {t}")))
        }
    }
}

fn call_builtin(
    world: &mut World,
    tid: usize,
    b: crate::value::BuiltinId,
    args: Vec<Value>,
    driver: Option<&mut dyn ParserDriver>,
) -> RunResult<Flow> {
    world.tracer.on_call(crate::builtins::BUILTINS[b.0 as usize].name);
    match crate::builtins::call(world, tid, b, args, driver)? {
        crate::builtins::BuiltinOut::Value(v) => {
            world.push(tid, v);
            Ok(Flow::Continue)
        }
        crate::builtins::BuiltinOut::Block(block) => Ok(Flow::Block(block)),
        crate::builtins::BuiltinOut::FramePushed => Ok(Flow::Continue),
    }
}

/// Binds arguments and pushes a frame (or creates a generator object when
/// the function is one).
#[expect(clippy::too_many_arguments, reason = "one binding path serves calls, methods, and constructors")]
fn push_function_frame(
    world: &mut World,
    tid: usize,
    fid: FunctionId,
    env: Vec<HeapId>,
    args: Vec<Value>,
    kw: Option<Value>,
    ctor: Option<Value>,
    generator: Option<HeapId>,
) -> RunResult<Flow> {
    let locals = bind_args(world, fid, args, kw)?;
    let info = world.program.func(fid);
    if let Some(name) = info.name {
        let name = world.interns.get(name).to_string();
        world.tracer.on_call(&name);
    }

    if info.is_generator && generator.is_none() {
        let genv = Generator {
            frame: Some(SavedFrame {
                fid,
                ip: 0,
                locals,
                env,
                stack: Vec::new(),
                defers: Vec::new(),
                handlers: Vec::new(),
                sp_saves: Vec::new(),
            }),
            done: false,
        };
        let v = world.heap.alloc_value(HeapData::Generator(genv));
        world.push(tid, v);
        return Ok(Flow::Continue);
    }

    let st = &world.threads[tid].state;
    let frame = Frame {
        fid,
        ip: 0,
        locals,
        env,
        defers: Vec::new(),
        base: st.stack.len(),
        sp_saves_base: st.sp_saves.len(),
        targets_base: st.targets.len(),
        generator,
        ctor,
    };
    world.thread(tid).frames.push(frame);
    cell_captured_locals(world, tid, fid);
    Ok(Flow::Continue)
}

/// Wraps captured local slots in cells at frame entry.
fn cell_captured_locals(world: &mut World, tid: usize, fid: FunctionId) {
    let cell_slots = world.program.func(fid).cell_slots.clone();
    for slot in cell_slots {
        let old = world.frame(tid).locals[slot as usize];
        let cell = world.heap.alloc(HeapData::Cell(old));
        world.frame_mut(tid).locals[slot as usize] = Value::Ref(cell);
    }
}

/// Binds positional and keyword arguments to a fresh locals vector per the
/// function's parameter metadata. Missing parameters bind nil (the preamble
/// fills defaults); `*rest` collects positional overflow, `%kwargs` named
/// overflow.
fn bind_args(world: &mut World, fid: FunctionId, args: Vec<Value>, kw: Option<Value>) -> RunResult<Vec<Value>> {
    let info: &FuncInfo = world.program.func(fid);
    let nparams = info.params.len();
    // Parameter `i` lives in frame slot `base + i`; methods have the
    // receiver at slot 0 and `base == 1`, with the receiver arriving as
    // argument 0, so argument positions map onto slots directly.
    let base = info.param_base as usize;
    let rest = info.rest.map(|i| i as usize + base);
    let kwargs_at = info.kwargs.map(|i| i as usize + base);
    let nlocals = info.nlocals as usize;
    let param_names: Vec<StringId> = info.params.iter().map(|p| p.name).collect();

    let mut locals = vec![Value::Nil; nlocals.max(nparams + base)];

    let plain_limit = rest.unwrap_or(nparams + base);
    let mut extra = Vec::new();
    for (i, arg) in args.into_iter().enumerate() {
        if i < plain_limit && Some(i) != kwargs_at {
            locals[i] = arg;
        } else {
            extra.push(arg);
        }
    }
    if let Some(r) = rest {
        let arr = world.heap.alloc_value(HeapData::Array(extra));
        locals[r] = arr;
    } else if !extra.is_empty() {
        let info_name = world
            .program
            .func(fid)
            .name
            .map_or_else(|| "<anonymous>".to_string(), |n| world.interns.get(n).to_string());
        return Err(world.throw(RtTag::ArityError, format!("too many arguments in call to {info_name}")));
    }

    // Keyword arguments: match parameter names, collect overflow.
    if let Some(kwv) = kw {
        let Value::Ref(dict_id) = kwv else {
            return Err(world.throw(RtTag::TypeError, "kwargs must be a dict"));
        };
        let entries: Vec<(Value, Value)> = {
            let n = crate::types::dict_len(&world.heap, dict_id);
            (0..n).filter_map(|i| crate::types::dict_nth(&world.heap, dict_id, i)).collect()
        };
        let mut overflow = Vec::new();
        for (k, v) in entries {
            // A None marker means a conditional kwarg whose condition
            // failed.
            if matches!(v, Value::Sentinel) {
                continue;
            }
            let name = crate::value::value_str(&world.heap, &world.interns, &k).map(str::to_string);
            let slot = name
                .as_deref()
                .and_then(|n| world.interns.lookup(n))
                .and_then(|id| param_names.iter().position(|&p| p == id))
                .map(|pos| pos + base);
            match slot {
                Some(i) if Some(i) != rest && Some(i) != kwargs_at => locals[i] = v,
                _ => overflow.push((k, v)),
            }
        }
        if let Some(ka) = kwargs_at {
            let dict = world.heap.alloc(HeapData::Dict(crate::types::Dict::default()));
            for (k, v) in overflow {
                crate::types::dict_insert(&mut world.heap, &world.interns, dict, k, v);
            }
            locals[ka] = Value::Ref(dict);
        } else if !overflow.is_empty() {
            return Err(world.throw(RtTag::ArityError, "unknown keyword argument"));
        }
    } else if let Some(ka) = kwargs_at {
        let dict = world.heap.alloc(HeapData::Dict(crate::types::Dict::default()));
        locals[ka] = Value::Ref(dict);
    }

    Ok(locals)
}

/// Class instantiation: build the object, then run `init` as a constructor
/// frame that returns the object.
fn instantiate(world: &mut World, tid: usize, cid: ClassId, args: Vec<Value>, kw: Option<Value>) -> RunResult<Flow> {
    let (field_names, field_defaults) = {
        let info = &world.classes[cid.0 as usize];
        if info.is_trait {
            return Err(world.throw(RtTag::TypeError, "traits cannot be instantiated"));
        }
        (info.field_names.clone(), info.field_defaults.clone())
    };
    let mut fields = indexmap::IndexMap::new();
    for (i, name) in field_names.iter().enumerate() {
        let v = field_defaults.get(i).copied().unwrap_or(Value::Nil);
        fields.insert(*name, v);
    }

    let finalize_name = world.interns.intern("finalize");
    let finalizer = ClassInfo::resolve_method(&world.classes, cid, finalize_name);

    let obj = world.heap.alloc_value(HeapData::Object(Object {
        class: cid,
        fields,
        finalizer: None,
    }));
    if let (Some(f), Value::Ref(obj_id)) = (finalizer, obj) {
        let bound = world.heap.alloc_value(HeapData::Method { recv: obj, fun: f });
        if let HeapData::Object(o) = world.heap.get_mut(obj_id) {
            o.finalizer = Some(bound);
        }
    }

    let init_name = world.interns.intern("init");
    if let Some(init) = ClassInfo::resolve_method(&world.classes, cid, init_name) {
        let mut all = Vec::with_capacity(args.len() + 1);
        all.push(obj);
        all.extend(args);
        match init {
            Value::Function(fid) => push_function_frame(world, tid, fid, Vec::new(), all, kw, Some(obj), None),
            Value::Ref(id) => match world.heap.get(id) {
                HeapData::Closure(c) => {
                    let (fid, env) = (c.fid, c.env.clone());
                    push_function_frame(world, tid, fid, env, all, kw, Some(obj), None)
                }
                _ => Err(world.throw(RtTag::TypeError, "class init is not callable")),
            },
            _ => Err(world.throw(RtTag::TypeError, "class init is not callable")),
        }
    } else {
        world.push(tid, obj);
        Ok(Flow::Continue)
    }
}

/// `CallMethod`: looks `name` up on the receiver's class, tag, or builtin
/// type, prepending the receiver as argument zero.
pub fn do_method_call(world: &mut World, tid: usize, name: StringId, nargs: u32, has_kw: bool) -> RunResult<Flow> {
    let kw = if has_kw { Some(world.pop(tid)) } else { None };
    let args = world.pop_args(tid, nargs);
    let recv = world.pop(tid);
    dispatch_method(world, tid, recv, name, args, kw)
}

pub fn dispatch_method(
    world: &mut World,
    tid: usize,
    recv: Value,
    name: StringId,
    args: Vec<Value>,
    kw: Option<Value>,
) -> RunResult<Flow> {
    // Class instances: class-chain lookup.
    if let Value::Ref(id) = recv
        && let HeapData::Object(obj) = world.heap.get(id)
    {
        let cid = obj.class;
        if let Some(m) = ClassInfo::resolve_method(&world.classes, cid, name) {
            let mut all = Vec::with_capacity(args.len() + 1);
            all.push(recv);
            all.extend(args);
            return call_value(world, tid, m, all, kw, None);
        }
        // A field holding a callable is callable as a method.
        if let HeapData::Object(obj) = world.heap.get(id)
            && let Some(&field) = obj.fields.get(&name)
        {
            return call_value(world, tid, field, args, kw, None);
        }
    }

    // Tagged values: the tag's method table, receiver passed tagged.
    if let Value::Ref(id) = recv
        && let HeapData::Tagged(stack, _) = world.heap.get(id)
    {
        let stack = *stack;
        if let Some(tag) = world.tags.first(stack)
            && let Some(m) = world.tags.lookup_method(tag, name)
        {
            let mut all = Vec::with_capacity(args.len() + 1);
            all.push(recv);
            all.extend(args);
            return call_value(world, tid, m, all, kw, None);
        }
    }

    // Statics on class values.
    if let Value::Class(cid) = recv {
        let m = world.classes[cid.0 as usize]
            .statics
            .get(&name)
            .copied()
            .or_else(|| world.classes[cid.0 as usize].methods.get(&name).copied());
        if let Some(m) = m {
            return call_value(world, tid, m, args, kw, None);
        }
    }

    // Builtin-type methods (arrays, strings, dicts, …).
    crate::builtins::call_type_method(world, tid, recv, name, args)
}

/// `CallSuper`: method dispatch starting at the superclass of `cid`.
pub fn do_super_call(world: &mut World, tid: usize, cid: ClassId, name: StringId, nargs: u32) -> RunResult<Flow> {
    let args = world.pop_args(tid, nargs);
    let recv = world.pop(tid);
    let Some(super_id) = world.classes[cid.0 as usize].super_ else {
        return Err(world.throw(RtTag::TypeError, "class has no superclass"));
    };
    let Some(m) = ClassInfo::resolve_method(&world.classes, super_id, name) else {
        let n = world.interns.get(name).to_string();
        return Err(world.throw(RtTag::TypeError, format!("no method '{n}' on superclass")));
    };
    let mut all = Vec::with_capacity(args.len() + 1);
    all.push(recv);
    all.extend(args);
    call_value(world, tid, m, all, None, None)
}

/// `Yield`: snapshot the generator frame and hand the value to the resumer.
///
/// Try regions and saved stack positions still open inside the frame
/// suspend with it, recorded relative to the frame's bases so resumption at
/// any depth can reinstate them.
pub fn perform_yield(world: &mut World, tid: usize, value: Value) -> RunResult<Flow> {
    let cur = world.threads[tid].state.frames.len() - 1;
    let Some(gen_id) = world.frame(tid).generator else {
        return Err(VmError::Fatal("yield outside of a generator frame".to_string()));
    };

    // The yield expression itself evaluates to nil on resumption; leave it
    // on the suspended stack.
    world.push(tid, Value::Nil);

    let split_handlers = super::exceptions::split_handlers_above(world, tid, cur);

    let frame = world.thread(tid).frames.pop().expect("generator frame");
    let st = world.thread(tid);
    let stack_tail = st.stack.split_off(frame.base);
    let sp_tail = st.sp_saves.split_off(frame.sp_saves_base);
    st.targets.truncate(frame.targets_base);

    let handlers = split_handlers
        .into_iter()
        .map(|h| SavedHandler {
            stack: h.stack - frame.base,
            sp_saves: h.sp_saves - frame.sp_saves_base,
            targets: h.targets - frame.targets_base,
            catch_ip: h.catch_ip,
            finally_ip: h.finally_ip,
        })
        .collect();
    let sp_saves = sp_tail.into_iter().map(|p| p - frame.base).collect();

    if let HeapData::Generator(g) = world.heap.get_mut(gen_id) {
        g.frame = Some(SavedFrame {
            fid: frame.fid,
            ip: frame.ip,
            locals: frame.locals,
            env: frame.env,
            stack: stack_tail,
            defers: frame.defers,
            handlers,
            sp_saves,
        });
        g.done = false;
    }

    world.push(tid, value);
    Ok(Flow::Continue)
}

/// Resumes a suspended generator by reinstating its saved frame.
pub fn resume_generator(world: &mut World, tid: usize, gen_id: HeapId) -> RunResult<Flow> {
    let saved = match world.heap.get_mut(gen_id) {
        HeapData::Generator(g) => {
            if g.done {
                world.push(tid, Value::Sentinel);
                return Ok(Flow::Continue);
            }
            match g.frame.take() {
                Some(f) => f,
                None => return Err(world.throw(RtTag::TypeError, "generator is already running")),
            }
        }
        _ => return Err(VmError::Fatal("resume of a non-generator".to_string())),
    };

    let st = &world.threads[tid].state;
    let base = st.stack.len();
    let sp_saves_base = st.sp_saves.len();
    let targets_base = st.targets.len();
    let frame = Frame {
        fid: saved.fid,
        ip: saved.ip,
        locals: saved.locals,
        env: saved.env,
        defers: saved.defers,
        base,
        sp_saves_base,
        targets_base,
        generator: Some(gen_id),
        ctor: None,
    };
    world.thread(tid).frames.push(frame);
    let frame_idx = world.threads[tid].state.frames.len() - 1;

    let st = world.thread(tid);
    st.stack.extend(saved.stack);
    st.sp_saves.extend(saved.sp_saves.into_iter().map(|p| p + base));
    // Reinstate the frame's suspended try regions at its new depth.
    st.handlers.extend(saved.handlers.into_iter().map(|h| Handler {
        frame: frame_idx,
        stack: h.stack + base,
        sp_saves: h.sp_saves + sp_saves_base,
        targets: h.targets + targets_base,
        catch_ip: h.catch_ip,
        finally_ip: h.finally_ip,
    }));
    Ok(Flow::Continue)
}

/// Pushes a frame for a zero-argument function (module initializers,
/// `eval`).
pub fn push_plain_frame(world: &mut World, tid: usize, fid: FunctionId) {
    let nlocals = world.program.func(fid).nlocals as usize;
    let st = &world.threads[tid].state;
    let frame = Frame {
        fid,
        ip: 0,
        locals: vec![Value::Nil; nlocals],
        env: Vec::new(),
        defers: Vec::new(),
        base: st.stack.len(),
        sp_saves_base: st.sp_saves.len(),
        targets_base: st.targets.len(),
        generator: None,
        ctor: None,
    };
    world.thread(tid).frames.push(frame);
    cell_captured_locals(world, tid, fid);
}

/// Sets up a thread's entry frame for `f(args…)`. Returns the result when
/// the call completed without pushing a frame (builtins, tag application).
pub fn setup_entry(world: &mut World, tid: usize, f: Value, args: Vec<Value>) -> RunResult<Option<Value>> {
    match call_value(world, tid, f, args, None, None)? {
        Flow::Continue => {}
        Flow::Done(v) => return Ok(Some(v)),
        Flow::Block(_) => return Err(VmError::Fatal("entry call blocked immediately".to_string())),
    }
    if world.threads[tid].state.frames.is_empty() {
        return Ok(Some(world.pop(tid)));
    }
    Ok(None)
}

/// Calls `f(args…)` to completion on the current thread (used by deferred
/// actions, finalizers, and collection builtins like `map`).
pub fn call_function_sync(world: &mut World, tid: usize, f: Value, args: Vec<Value>) -> RunResult<Value> {
    let depth = world.threads[tid].state.frames.len();
    match call_value(world, tid, f, args, None, None)? {
        Flow::Continue => {}
        Flow::Done(v) => return Ok(v),
        Flow::Block(_) => return Err(VmError::Fatal("blocking call in synchronous context".to_string())),
    }
    if world.threads[tid].state.frames.len() == depth {
        // Completed inline (builtin, tag application): result on the stack.
        return Ok(world.pop(tid));
    }
    loop {
        match super::step(world, tid, None)? {
            Flow::Continue => {}
            Flow::Done(v) => return Ok(v),
            Flow::Block(_) => return Err(VmError::Fatal("blocking call in synchronous context".to_string())),
        }
        if world.threads[tid].state.frames.len() == depth {
            return Ok(world.pop(tid));
        }
    }
}

/// Invokes the value's `drop` method if it has one; silently succeeds
/// otherwise.
pub fn call_drop_method(world: &mut World, tid: usize, v: Value) -> RunResult<()> {
    let name = world.interns.intern("drop");
    let has = match v {
        Value::Ref(id) => match world.heap.get(id) {
            HeapData::Object(o) => ClassInfo::resolve_method(&world.classes, o.class, name).is_some(),
            HeapData::Tagged(stack, _) => {
                let stack = *stack;
                world.tags.first(stack).and_then(|t| world.tags.lookup_method(t, name)).is_some()
            }
            _ => false,
        },
        _ => false,
    };
    if !has {
        return Ok(());
    }
    let depth = world.threads[tid].state.frames.len();
    match dispatch_method(world, tid, v, name, Vec::new(), None)? {
        Flow::Continue => {}
        Flow::Done(_) | Flow::Block(_) => return Ok(()),
    }
    if world.threads[tid].state.frames.len() == depth {
        world.pop(tid);
        return Ok(());
    }
    loop {
        match super::step(world, tid, None)? {
            Flow::Continue => {}
            Flow::Done(_) => return Ok(()),
            Flow::Block(_) => return Err(VmError::Fatal("blocking drop method".to_string())),
        }
        if world.threads[tid].state.frames.len() == depth {
            world.pop(tid);
            return Ok(());
        }
    }
}
