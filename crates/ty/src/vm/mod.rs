//! The bytecode virtual machine.
//!
//! A [`World`] holds everything shared between threads: the heap, interned
//! strings, tags, classes, the compiled program, globals, and every thread's
//! evaluation stack and call frames. Threads run real OS threads, but VM
//! execution is serialized by one world lock ([`VmShared`]); a thread holds
//! the lock while interpreting and releases it across blocking operations
//! (sleep, join, mutex waits). Garbage collection happens under the lock at
//! instruction boundaries (safe points), so it is stop-the-world by
//! construction.
//!
//! Keeping thread stacks inside the world means the collector sees every
//! root without cross-thread coordination.

mod call;
mod display;
mod exceptions;
mod iter;
mod ops;
mod pattern;

use std::sync::{Arc, Condvar, Mutex, Weak};

use crate::{
    compile::{
        CompilerState,
        code::Program,
        op::{AccessKind, FROM_MARK, Opcode},
    },
    diagnostics::{Diagnostic, ErrorKind},
    heap::{Heap, HeapData, HeapId},
    intern::{Interns, StringId},
    io::PrintWriter,
    location::{SourceMap, Span},
    tags::{TagId, TagTable},
    tracer::VmTracer,
    types::{AstValue, ClassInfo, ThreadHandle},
    value::{FunctionId, Value},
};

pub use self::display::{display_value, format_value};
pub use call::{call_function_sync, push_plain_frame};

/// Re-exports for the builtin table, which lives outside this module.
pub fn ops_length(world: &mut World, v: Value) -> RunResult<i64> {
    ops::length(world, v)
}

pub fn ops_binary(world: &mut World, op: Opcode, a: Value, b: Value) -> RunResult<Value> {
    ops::binary(world, op, a, b)
}

pub fn ops_contains(world: &mut World, collection: &Value, item: &Value) -> RunResult<bool> {
    ops::contains(world, collection, item)
}

pub fn ops_slice(world: &mut World, subject: Value, i: Value, j: Value, k: Value) -> RunResult<Value> {
    ops::slice(world, subject, i, j, k)
}

pub fn get_iter_value(world: &mut World, v: Value) -> RunResult<Value> {
    iter::get_iter(world, v)
}

pub fn iter_next_flow(world: &mut World, tid: usize) -> RunResult<Flow> {
    iter::iter_next(world, tid)
}

pub fn resume_generator_flow(world: &mut World, tid: usize, generator: HeapId) -> RunResult<Flow> {
    call::resume_generator(world, tid, generator)
}

/// Names of the tags the runtime itself throws; registered in every world
/// in this order, ids starting at 1.
pub const BUILTIN_TAGS: &[&str] = &[
    "Cancelled",
    "DivisionByZero",
    "TypeError",
    "IndexError",
    "KeyError",
    "MatchError",
    "ArityError",
];

/// Index into [`BUILTIN_TAGS`].
#[derive(Debug, Clone, Copy)]
pub enum RtTag {
    Cancelled = 0,
    DivisionByZero,
    TypeError,
    IndexError,
    KeyError,
    MatchError,
    ArityError,
}

/// A VM-level error: a thrown Ty value (catchable) or a fatal fault.
#[derive(Debug)]
pub enum VmError {
    Throw(Value),
    Fatal(String),
}

/// Result alias used throughout the VM.
pub type RunResult<T> = Result<T, VmError>;

/// An assignment target produced by the `Target*` opcodes.
#[derive(Debug, Clone, Copy)]
pub enum Target {
    Local(u32),
    Global(u32),
    Cell(HeapId),
    Member(Value, StringId),
    Subscript(Value, Value),
}

pub use crate::types::DeferAction;

/// The action to resume after a finally block.
#[derive(Debug, Clone, Copy)]
pub enum Pending {
    Fall,
    Throw(Value),
    Return(Value),
}

/// An installed exception handler.
#[derive(Debug, Clone, Copy)]
pub struct Handler {
    pub frame: usize,
    pub stack: usize,
    pub sp_saves: usize,
    pub targets: usize,
    pub catch_ip: usize,
    pub finally_ip: usize,
}

/// One call frame.
#[derive(Debug)]
pub struct Frame {
    pub fid: FunctionId,
    pub ip: usize,
    pub locals: Vec<Value>,
    pub env: Vec<HeapId>,
    pub defers: Vec<DeferAction>,
    /// Stack depth at entry; the frame's portion of the stack sits above.
    pub base: usize,
    pub sp_saves_base: usize,
    pub targets_base: usize,
    /// Generator this frame resumes, when it is a generator frame.
    pub generator: Option<HeapId>,
    /// Constructor frames push the new object instead of the return value.
    pub ctor: Option<Value>,
}

/// One thread's execution state. Lives inside the world so the collector
/// sees every stack as a root set.
#[derive(Debug, Default)]
pub struct ThreadState {
    pub stack: Vec<Value>,
    pub frames: Vec<Frame>,
    pub sp_saves: Vec<usize>,
    pub targets: Vec<Target>,
    pub handlers: Vec<Handler>,
    pub pending: Vec<Pending>,
}

/// A thread slot: state plus completion bookkeeping.
#[derive(Debug)]
pub struct ThreadSlot {
    pub state: ThreadState,
    pub done: bool,
    pub result: Value,
    pub cancel: bool,
    /// Slot freed and reusable.
    pub vacant: bool,
}

impl Default for ThreadSlot {
    fn default() -> Self {
        Self {
            state: ThreadState::default(),
            done: false,
            result: Value::Nil,
            cancel: false,
            vacant: false,
        }
    }
}

/// What a run slice ended with.
#[derive(Debug)]
pub enum Outcome {
    /// `Halt` or the entry frame returned.
    Done(Value),
    /// Release the lock and wait.
    Block(BlockOn),
    /// The slice budget ran out; re-run after letting other threads in.
    Yield,
}

/// Why a thread wants to release the world lock.
#[derive(Debug, Clone, Copy)]
pub enum BlockOn {
    SleepMs(u64),
    Join(usize),
    MutexLock(HeapId),
    CondWait { cv: HeapId, mutex: HeapId, seen: u64 },
}

/// Fun-macros drive the parser through this interface, which the compiler
/// threads into the compile-time VM.
pub trait ParserDriver {
    fn get_expr(&mut self) -> Result<crate::ast::Expr, Diagnostic>;
    fn get_stmt(&mut self) -> Result<crate::ast::Stmt, Diagnostic>;
    fn get_type(&mut self) -> Result<crate::ast::Expr, Diagnostic>;
    fn get_token_text(&mut self) -> String;
    fn next_token(&mut self);
    fn fail(&mut self, msg: &str) -> Diagnostic;
}

/// The standard driver: a borrowed parser with no nested macro expansion.
pub struct ParserDriverImpl<'a, 's> {
    pub parser: &'a mut crate::parse::Parser<'s>,
}

impl ParserDriver for ParserDriverImpl<'_, '_> {
    fn get_expr(&mut self) -> Result<crate::ast::Expr, Diagnostic> {
        self.parser.parse_get_expr(&mut crate::parse::NoMacros)
    }

    fn get_stmt(&mut self) -> Result<crate::ast::Stmt, Diagnostic> {
        self.parser.parse_get_stmt(&mut crate::parse::NoMacros)
    }

    fn get_type(&mut self) -> Result<crate::ast::Expr, Diagnostic> {
        self.parser.parse_get_type(&mut crate::parse::NoMacros)
    }

    fn get_token_text(&mut self) -> String {
        format!("{}", self.parser.parse_get_token().kind)
    }

    fn next_token(&mut self) {
        self.parser.parse_next();
    }

    fn fail(&mut self, msg: &str) -> Diagnostic {
        self.parser.parse_fail(msg)
    }
}

/// The world: all state shared between threads, guarded by one lock.
pub struct World {
    pub sources: SourceMap,
    pub interns: Interns,
    pub heap: Heap,
    pub tags: TagTable,
    pub classes: Vec<ClassInfo>,
    pub program: Program,
    pub globals: Vec<Value>,
    /// Compile-time values referenced by emitted code; always live.
    pub const_roots: Vec<Value>,
    pub modules_executed: Vec<bool>,
    pub threads: Vec<ThreadSlot>,
    pub printer: Box<dyn PrintWriter + Send>,
    pub tracer: Box<dyn VmTracer + Send>,
    compiler_state: Option<CompilerState>,
    /// Back-reference for spawning threads.
    pub shared: Weak<VmShared>,
    /// Simple xorshift state for the `rand` builtin.
    pub rng: u64,
}

impl World {
    #[must_use]
    pub fn new(printer: Box<dyn PrintWriter + Send>) -> Self {
        let mut interns = Interns::new();
        let mut tags = TagTable::new();
        for name in BUILTIN_TAGS {
            let id = interns.intern(name);
            tags.new_tag(id);
        }
        Self {
            sources: SourceMap::new(),
            interns,
            heap: Heap::new(),
            tags,
            classes: Vec::new(),
            program: Program::default(),
            globals: Vec::new(),
            const_roots: Vec::new(),
            modules_executed: Vec::new(),
            threads: Vec::new(),
            printer,
            tracer: Box::new(crate::tracer::NoopTracer),
            compiler_state: None,
            shared: Weak::new(),
            rng: 0x9e37_79b9_7f4a_7c15,
        }
    }

    pub fn take_compiler_state(&mut self) -> CompilerState {
        self.compiler_state.take().unwrap_or_default()
    }

    pub fn put_compiler_state(&mut self, st: CompilerState) {
        self.compiler_state = Some(st);
    }

    /// Writes a global, growing the vector as compilation allocates slots.
    pub fn set_global(&mut self, slot: u32, v: Value) {
        let i = slot as usize;
        if i >= self.globals.len() {
            self.globals.resize(i + 1, Value::Nil);
        }
        self.globals[i] = v;
    }

    #[must_use]
    pub fn global(&self, slot: u32) -> Value {
        self.globals.get(slot as usize).copied().unwrap_or(Value::Nil)
    }

    /// Pins a compile-time value for the life of the program, returning its
    /// const-root index.
    pub fn add_const_root(&mut self, v: Value) -> u32 {
        self.const_roots.push(v);
        u32::try_from(self.const_roots.len() - 1).expect("const root count fits u32")
    }

    /// The runtime tag for a builtin error category.
    #[must_use]
    pub fn rt_tag(&self, t: RtTag) -> TagId {
        TagId(t as u32 + 1)
    }

    /// Builds a thrown error value: `Tag('message')`.
    pub fn error_value(&mut self, t: RtTag, msg: &str) -> Value {
        let tag = self.rt_tag(t);
        let s = self.heap.alloc_str(msg);
        let stack = self.tags.push(0, tag);
        self.heap.alloc_value(HeapData::Tagged(stack, s))
    }

    pub fn throw(&mut self, t: RtTag, msg: impl AsRef<str>) -> VmError {
        VmError::Throw(self.error_value(t, msg.as_ref()))
    }

    /// Allocates a thread slot (reusing vacated ones).
    pub fn new_thread(&mut self) -> usize {
        if let Some(i) = self.threads.iter().position(|t| t.vacant) {
            self.threads[i] = ThreadSlot::default();
            return i;
        }
        self.threads.push(ThreadSlot::default());
        self.threads.len() - 1
    }

    pub fn thread(&mut self, tid: usize) -> &mut ThreadState {
        &mut self.threads[tid].state
    }

    // ------------------------------------------------------------------
    // Operand fetching.
    // ------------------------------------------------------------------

    fn frame(&self, tid: usize) -> &Frame {
        self.threads[tid].state.frames.last().expect("active frame")
    }

    fn frame_mut(&mut self, tid: usize) -> &mut Frame {
        self.threads[tid].state.frames.last_mut().expect("active frame")
    }

    fn fetch_byte(&mut self, tid: usize) -> u8 {
        let f = self.threads[tid].state.frames.last_mut().expect("active frame");
        let b = self.program.funcs[f.fid.0 as usize].code.bytes[f.ip];
        f.ip += 1;
        b
    }

    fn fetch_u32(&mut self, tid: usize) -> u32 {
        let f = self.threads[tid].state.frames.last_mut().expect("active frame");
        let bytes = &self.program.funcs[f.fid.0 as usize].code.bytes;
        let v = u32::from_le_bytes(bytes[f.ip..f.ip + 4].try_into().expect("operand in bounds"));
        f.ip += 4;
        v
    }

    fn fetch_i32(&mut self, tid: usize) -> i32 {
        let f = self.threads[tid].state.frames.last_mut().expect("active frame");
        let bytes = &self.program.funcs[f.fid.0 as usize].code.bytes;
        let v = i32::from_le_bytes(bytes[f.ip..f.ip + 4].try_into().expect("operand in bounds"));
        f.ip += 4;
        v
    }

    fn fetch_i64(&mut self, tid: usize) -> i64 {
        let f = self.threads[tid].state.frames.last_mut().expect("active frame");
        let bytes = &self.program.funcs[f.fid.0 as usize].code.bytes;
        let v = i64::from_le_bytes(bytes[f.ip..f.ip + 8].try_into().expect("operand in bounds"));
        f.ip += 8;
        v
    }

    fn fetch_f64(&mut self, tid: usize) -> f64 {
        let f = self.threads[tid].state.frames.last_mut().expect("active frame");
        let bytes = &self.program.funcs[f.fid.0 as usize].code.bytes;
        let v = f64::from_le_bytes(bytes[f.ip..f.ip + 8].try_into().expect("operand in bounds"));
        f.ip += 8;
        v
    }

    /// Applies a relative jump to the current ip.
    fn jump(&mut self, tid: usize, off: i32) {
        let f = self.frame_mut(tid);
        let ip = i64::try_from(f.ip).expect("ip fits i64") + i64::from(off);
        f.ip = usize::try_from(ip).expect("jump stays in bounds");
    }

    // ------------------------------------------------------------------
    // Stack helpers.
    // ------------------------------------------------------------------

    pub(crate) fn push(&mut self, tid: usize, v: Value) {
        self.threads[tid].state.stack.push(v);
    }

    pub(crate) fn pop(&mut self, tid: usize) -> Value {
        self.threads[tid].state.stack.pop().expect("stack underflow")
    }

    fn peek(&self, tid: usize) -> Value {
        *self.threads[tid].state.stack.last().expect("stack underflow")
    }

    /// Pops `n` values (or down to the last saved mark for [`FROM_MARK`]).
    fn pop_args(&mut self, tid: usize, n: u32) -> Vec<Value> {
        let st = &mut self.threads[tid].state;
        if n == FROM_MARK {
            let mark = st.sp_saves.pop().expect("saved stack position");
            st.stack.split_off(mark)
        } else {
            let at = st.stack.len() - n as usize;
            st.stack.split_off(at)
        }
    }

    /// Reads a variable through its cell, if celled.
    fn read_local(&self, tid: usize, slot: u32) -> Value {
        let v = self.frame(tid).locals[slot as usize];
        match v {
            Value::Ref(id) => match self.heap.get(id) {
                HeapData::Cell(inner) => *inner,
                _ => v,
            },
            _ => v,
        }
    }

    fn write_local(&mut self, tid: usize, slot: u32, v: Value) {
        let cur = self.frame(tid).locals[slot as usize];
        if let Value::Ref(id) = cur
            && matches!(self.heap.get(id), HeapData::Cell(_))
        {
            *self.heap.get_mut(id) = HeapData::Cell(v);
            return;
        }
        self.frame_mut(tid).locals[slot as usize] = v;
    }

    fn read_capture(&self, tid: usize, idx: u32) -> Value {
        let cell = self.frame(tid).env[idx as usize];
        match self.heap.get(cell) {
            HeapData::Cell(inner) => *inner,
            _ => Value::Nil,
        }
    }

    fn write_capture(&mut self, tid: usize, idx: u32, v: Value) {
        let cell = self.frame(tid).env[idx as usize];
        *self.heap.get_mut(cell) = HeapData::Cell(v);
    }

    // ------------------------------------------------------------------
    // Garbage collection.
    // ------------------------------------------------------------------

    /// Collects garbage from every root the world knows about. Called only
    /// at safe points.
    pub fn collect_garbage(&mut self) {
        if !self.heap.gc_enabled() {
            return;
        }
        self.tracer.on_collect_start(self.heap.live_count());

        let mut roots: Vec<Value> = Vec::new();
        roots.extend(self.globals.iter().copied());
        roots.extend(self.const_roots.iter().copied());
        for slot in &self.threads {
            let st = &slot.state;
            roots.extend(st.stack.iter().copied());
            roots.push(slot.result);
            for f in &st.frames {
                roots.extend(f.locals.iter().copied());
                roots.extend(f.env.iter().map(|&c| Value::Ref(c)));
                for d in &f.defers {
                    match d {
                        DeferAction::Call(v) | DeferAction::CallUnwind(v) | DeferAction::DropValue(v) => {
                            roots.push(*v);
                        }
                    }
                }
                if let Some(g) = f.generator {
                    roots.push(Value::Ref(g));
                }
                if let Some(c) = f.ctor {
                    roots.push(c);
                }
            }
            for t in &st.targets {
                match t {
                    Target::Member(v, _) => roots.push(*v),
                    Target::Subscript(c, i) => {
                        roots.push(*c);
                        roots.push(*i);
                    }
                    Target::Cell(id) => roots.push(Value::Ref(*id)),
                    Target::Local(_) | Target::Global(_) => {}
                }
            }
            for p in &st.pending {
                match p {
                    Pending::Throw(v) | Pending::Return(v) => roots.push(*v),
                    Pending::Fall => {}
                }
            }
        }
        for class in &self.classes {
            roots.extend(class.methods.values().copied());
            roots.extend(class.getters.values().copied());
            roots.extend(class.setters.values().copied());
            roots.extend(class.statics.values().copied());
            roots.extend(class.field_defaults.iter().copied());
        }
        for t in 1..=self.tags.count() {
            let tag = TagId(u32::try_from(t).expect("tag id fits u32"));
            // Method tables are roots too; enumerate via the name table.
            roots.extend(self.tags.methods_of(tag));
        }
        roots.extend(self.heap.finalize_queue.iter().flat_map(crate::heap::FinalizeAction::roots));

        self.heap.clear_marks();
        self.heap.mark(roots);
        let stats = self.heap.sweep();
        self.tracer.on_collect_end(stats.freed, stats.live);
    }

    /// Declared parameter count of a callable, for adapting finalizer calls.
    fn callee_arity(&self, f: Value) -> usize {
        match f {
            Value::Function(fid) => self.program.func(fid).params.len(),
            Value::Ref(id) => match self.heap.get(id) {
                HeapData::Closure(c) => self.program.func(c.fid).params.len(),
                HeapData::Method { fun, .. } => self.callee_arity(*fun),
                _ => 1,
            },
            _ => 1,
        }
    }

    /// Runs queued finalizers and deferred generator actions after a cycle.
    pub fn drain_finalizers(&mut self, tid: usize) {
        while let Some(action) = self.heap.finalize_queue.pop() {
            self.heap.gc_disable();
            let r = match action {
                crate::heap::FinalizeAction::Call(f) => call::call_function_sync(self, tid, f, Vec::new()).map(|_| ()),
                crate::heap::FinalizeAction::CallWith { f, recv } => {
                    // A finalizer may be a method taking the object or a
                    // plain zero-argument callable.
                    let args = if self.callee_arity(f) == 0 { Vec::new() } else { vec![recv] };
                    call::call_function_sync(self, tid, f, args).map(|_| ())
                }
                crate::heap::FinalizeAction::Drop(v) => call::call_drop_method(self, tid, v),
            };
            self.heap.gc_enable();
            if let Err(e) = r {
                let msg = describe_vm_error(self, &e);
                self.tracer.on_note(&format!("finalizer failed: {msg}"));
            }
        }
    }
}

/// The world plus its lock and wakeup condition: the unit threads share.
pub struct VmShared {
    pub world: Mutex<World>,
    pub cv: Condvar,
}

impl VmShared {
    #[must_use]
    pub fn new(world: World) -> Arc<Self> {
        let arc = Arc::new(Self {
            world: Mutex::new(world),
            cv: Condvar::new(),
        });
        arc.world.lock().expect("fresh lock").shared = Arc::downgrade(&arc);
        arc
    }
}

/// Instructions per slice before the lock is offered to other threads.
const SLICE_BUDGET: u32 = 65_536;

/// Runs thread `tid` until completion, handling blocking points by waiting
/// on the world's condition variable.
pub fn execute(shared: &Arc<VmShared>, tid: usize) -> Result<Value, Diagnostic> {
    let mut guard = shared.world.lock().expect("world lock poisoned");
    loop {
        let out = run_slice(&mut guard, tid, None);
        match out {
            Ok(Outcome::Done(v)) => {
                guard.threads[tid].done = true;
                guard.threads[tid].result = v;
                shared.cv.notify_all();
                return Ok(v);
            }
            Ok(Outcome::Yield) => {
                drop(guard);
                std::thread::yield_now();
                guard = shared.world.lock().expect("world lock poisoned");
            }
            Ok(Outcome::Block(b)) => {
                guard = block_on(shared, guard, tid, b);
            }
            Err(diag) => {
                guard.threads[tid].done = true;
                shared.cv.notify_all();
                return Err(diag);
            }
        }
    }
}

fn block_on<'g>(
    shared: &'g Arc<VmShared>,
    mut guard: std::sync::MutexGuard<'g, World>,
    tid: usize,
    b: BlockOn,
) -> std::sync::MutexGuard<'g, World> {
    match b {
        BlockOn::SleepMs(ms) => {
            let (g, _) = shared
                .cv
                .wait_timeout(guard, std::time::Duration::from_millis(ms))
                .expect("world lock poisoned");
            let mut g = g;
            g.thread(tid).stack.push(Value::Nil);
            g
        }
        BlockOn::Join(other) => {
            while !guard.threads[other].done {
                guard = shared.cv.wait(guard).expect("world lock poisoned");
            }
            let result = guard.threads[other].result;
            guard.threads[other].vacant = true;
            guard.thread(tid).stack.push(result);
            guard
        }
        BlockOn::MutexLock(m) => {
            loop {
                let locked = matches!(
                    guard.heap.get(m),
                    HeapData::Mutex(s) if s.locked_by.is_some()
                );
                if !locked {
                    break;
                }
                guard = shared.cv.wait(guard).expect("world lock poisoned");
            }
            if let HeapData::Mutex(s) = guard.heap.get_mut(m) {
                s.locked_by = Some(tid);
            }
            guard.thread(tid).stack.push(Value::Nil);
            guard
        }
        BlockOn::CondWait { cv, mutex, seen } => {
            // Release the mutex, wait for a signal, then reacquire.
            if let HeapData::Mutex(s) = guard.heap.get_mut(mutex) {
                s.locked_by = None;
            }
            shared.cv.notify_all();
            loop {
                let current = match guard.heap.get(cv) {
                    HeapData::Condvar(c) => c.generation,
                    _ => seen + 1,
                };
                if current != seen {
                    break;
                }
                guard = shared.cv.wait(guard).expect("world lock poisoned");
            }
            loop {
                let locked = matches!(
                    guard.heap.get(mutex),
                    HeapData::Mutex(s) if s.locked_by.is_some()
                );
                if !locked {
                    break;
                }
                guard = shared.cv.wait(guard).expect("world lock poisoned");
            }
            if let HeapData::Mutex(s) = guard.heap.get_mut(mutex) {
                s.locked_by = Some(tid);
            }
            guard.thread(tid).stack.push(Value::Nil);
            guard
        }
    }
}

/// Reborrows an `Option<&mut dyn ParserDriver>` for a single call, so it can
/// be passed repeatedly across loop iterations.
fn reborrow_driver<'a>(
    driver: &'a mut Option<&mut dyn ParserDriver>,
) -> Option<&'a mut dyn ParserDriver> {
    match driver {
        Some(d) => Some(&mut **d),
        None => None,
    }
}

/// Runs a compile-time or auxiliary call to completion on a temporary
/// thread, without lock juggling. Blocking operations are errors here.
pub fn run_isolated(
    world: &mut World,
    f: Value,
    args: Vec<Value>,
    mut driver: Option<&mut dyn ParserDriver>,
) -> Result<Value, String> {
    let tid = world.new_thread();
    let r = (|| {
        match call::setup_entry(world, tid, f, args) {
            Ok(Some(v)) => return Ok(v),
            Ok(None) => {}
            Err(e) => return Err(describe_vm_error(world, &e)),
        }
        loop {
            match run_slice(world, tid, reborrow_driver(&mut driver)) {
                Ok(Outcome::Done(v)) => return Ok(v),
                Ok(Outcome::Yield) => {}
                Ok(Outcome::Block(_)) => return Err("blocking operation during compile-time execution".to_string()),
                Err(diag) => return Err(diag.message),
            }
        }
    })();
    world.threads[tid].vacant = true;
    world.threads[tid].state = ThreadState::default();
    r
}

fn describe_vm_error(world: &mut World, e: &VmError) -> String {
    match e {
        VmError::Throw(v) => display_value(world, *v),
        VmError::Fatal(msg) => msg.clone(),
    }
}

/// The diagnostic for an uncaught thrown value, located via the location
/// map of the instruction that threw.
fn uncaught_diagnostic(world: &mut World, tid: usize, v: Value) -> Diagnostic {
    let span = current_span(world, tid).unwrap_or_default();
    let rendered = display_value(world, v);
    Diagnostic::new(ErrorKind::RuntimeError, span, format!("uncaught exception: {rendered}"))
}

fn current_span(world: &World, tid: usize) -> Option<Span> {
    let f = world.threads[tid].state.frames.last()?;
    world.program.func(f.fid).code.location_at(f.ip.saturating_sub(1))
}

/// Interprets until the entry frame returns, a blocking point, or the slice
/// budget runs out.
pub fn run_slice(world: &mut World, tid: usize, mut driver: Option<&mut dyn ParserDriver>) -> Result<Outcome, Diagnostic> {
    let mut budget = SLICE_BUDGET;
    loop {
        if budget == 0 {
            return Ok(Outcome::Yield);
        }
        budget -= 1;

        // Safe point: collection, finalizers, cancellation.
        if world.heap.should_collect() {
            world.collect_garbage();
            world.drain_finalizers(tid);
        }
        if world.threads[tid].cancel {
            world.threads[tid].cancel = false;
            let v = world.error_value(RtTag::Cancelled, "thread cancelled");
            match exceptions::handle_throw(world, tid, v) {
                Ok(()) => {}
                Err(e) => return Err(fatal_to_diag(world, tid, e)),
            }
        }

        match step(world, tid, reborrow_driver(&mut driver)) {
            Ok(Flow::Continue) => {}
            Ok(Flow::Done(v)) => return Ok(Outcome::Done(v)),
            Ok(Flow::Block(b)) => return Ok(Outcome::Block(b)),
            Err(e) => {
                // Thrown values unwind to a handler; only unhandled ones
                // terminate the thread.
                match e {
                    VmError::Throw(v) => match exceptions::handle_throw(world, tid, v) {
                        Ok(()) => {}
                        Err(e) => return Err(fatal_to_diag(world, tid, e)),
                    },
                    VmError::Fatal(msg) => {
                        let span = current_span(world, tid).unwrap_or_default();
                        return Err(Diagnostic::new(ErrorKind::RuntimeError, span, msg));
                    }
                }
            }
        }
    }
}

fn fatal_to_diag(world: &mut World, tid: usize, e: VmError) -> Diagnostic {
    match e {
        VmError::Throw(v) => uncaught_diagnostic(world, tid, v),
        VmError::Fatal(msg) => {
            let span = current_span(world, tid).unwrap_or_default();
            Diagnostic::new(ErrorKind::RuntimeError, span, msg)
        }
    }
}

/// Per-instruction control flow.
pub enum Flow {
    Continue,
    Done(Value),
    Block(BlockOn),
}

#[expect(clippy::too_many_lines, reason = "the dispatch table is one match by design")]
fn step(world: &mut World, tid: usize, driver: Option<&mut dyn ParserDriver>) -> RunResult<Flow> {
    let byte = world.fetch_byte(tid);
    let op = Opcode::from_repr(byte).ok_or_else(|| VmError::Fatal(format!("bad opcode {byte:#x}")))?;
    world.tracer.on_instruction(op.into());

    match op {
        Opcode::Nil => world.push(tid, Value::Nil),
        Opcode::True => world.push(tid, Value::Bool(true)),
        Opcode::False => world.push(tid, Value::Bool(false)),
        Opcode::NoneVal => world.push(tid, Value::Sentinel),
        Opcode::ConstRoot => {
            let idx = world.fetch_u32(tid);
            let v = world.const_roots[idx as usize];
            world.push(tid, v);
        }
        Opcode::Int => {
            let k = world.fetch_i64(tid);
            world.push(tid, Value::Int(k));
        }
        Opcode::Real => {
            let x = world.fetch_f64(tid);
            world.push(tid, Value::Real(x));
        }
        Opcode::Str => {
            let id = world.fetch_u32(tid);
            world.push(tid, Value::InternStr(StringId::from_index(id)));
        }
        Opcode::Regex => {
            let id = world.fetch_u32(tid);
            world.push(tid, Value::Regex(crate::value::RegexId(id)));
        }
        Opcode::TagVal => {
            let id = world.fetch_u32(tid);
            world.push(tid, Value::Tag(TagId(id)));
        }
        Opcode::ClassVal => {
            let id = world.fetch_u32(tid);
            world.push(tid, Value::Class(crate::value::ClassId(id)));
        }
        Opcode::Array => {
            let n = world.fetch_u32(tid);
            let items = world.pop_args(tid, n);
            let v = world.heap.alloc_value(HeapData::Array(items));
            world.push(tid, v);
        }
        Opcode::Dict => {
            let n = world.fetch_u32(tid);
            let flat = world.pop_args(tid, if n == FROM_MARK { FROM_MARK } else { n * 2 });
            let dict = world.heap.alloc(HeapData::Dict(crate::types::Dict::default()));
            let mut it = flat.into_iter();
            while let (Some(k), Some(v)) = (it.next(), it.next()) {
                crate::types::dict_insert(&mut world.heap, &world.interns, dict, k, v);
            }
            world.push(tid, Value::Ref(dict));
        }
        Opcode::DictDefault => {
            let dflt = world.pop(tid);
            let dict = world.peek(tid);
            if let Value::Ref(id) = dict
                && let HeapData::Dict(d) = world.heap.get_mut(id)
            {
                d.dflt = Some(dflt);
            }
        }
        Opcode::Tuple => {
            let n = world.fetch_u32(tid);
            let shape = world.fetch_u32(tid);
            let items = world.pop_args(tid, n);
            let names = if shape == FROM_MARK {
                None
            } else {
                Some(world.program.tuple_shapes[shape as usize].clone())
            };
            let v = world.heap.alloc_value(HeapData::Tuple(crate::types::Tuple { items, names }));
            world.push(tid, v);
        }
        Opcode::LoadVar => {
            let slot = world.fetch_u32(tid);
            let v = world.read_local(tid, slot);
            world.push(tid, v);
        }
        Opcode::LoadGlobal => {
            let slot = world.fetch_u32(tid);
            let v = world.global(slot);
            world.push(tid, v);
        }
        Opcode::LoadRef => {
            let idx = world.fetch_u32(tid);
            let v = world.read_capture(tid, idx);
            world.push(tid, v);
        }
        Opcode::PushVar => {
            let slot = world.fetch_u32(tid);
            // Saves the raw slot contents (cells included) for PopVar.
            let v = world.frame(tid).locals[slot as usize];
            world.push(tid, v);
        }
        Opcode::PopVar => {
            let slot = world.fetch_u32(tid);
            let v = world.pop(tid);
            world.frame_mut(tid).locals[slot as usize] = v;
        }
        Opcode::TargetVar => {
            let slot = world.fetch_u32(tid);
            let t = Target::Local(slot);
            world.thread(tid).targets.push(t);
        }
        Opcode::TargetGlobal => {
            let slot = world.fetch_u32(tid);
            world.thread(tid).targets.push(Target::Global(slot));
        }
        Opcode::TargetRef => {
            let idx = world.fetch_u32(tid);
            let cell = world.frame(tid).env[idx as usize];
            world.thread(tid).targets.push(Target::Cell(cell));
        }
        Opcode::TargetMember => {
            let name = world.fetch_u32(tid);
            let obj = world.pop(tid);
            world.thread(tid).targets.push(Target::Member(obj, StringId::from_index(name)));
        }
        Opcode::TargetSubscript => {
            let index = world.pop(tid);
            let container = world.pop(tid);
            world.thread(tid).targets.push(Target::Subscript(container, index));
        }
        Opcode::Assign => {
            let target = world.thread(tid).targets.pop().expect("target for assignment");
            let value = world.peek(tid);
            ops::assign(world, tid, target, value)?;
        }
        Opcode::MutAdd | Opcode::MutSub | Opcode::MutMul | Opcode::MutDiv => {
            let target = world.thread(tid).targets.pop().expect("target for assignment");
            let value = world.pop(tid);
            let result = ops::mutate(world, tid, target, value, op)?;
            world.push(tid, result);
        }
        Opcode::MakeClosure => {
            let fid = FunctionId(world.fetch_u32(tid));
            call::make_closure(world, tid, fid);
        }
        Opcode::Call => {
            let n = world.fetch_u32(tid);
            return call::do_call(world, tid, n, false, driver);
        }
        Opcode::CallKw => {
            let n = world.fetch_u32(tid);
            return call::do_call(world, tid, n, true, driver);
        }
        Opcode::CallMethod => {
            let name = StringId::from_index(world.fetch_u32(tid));
            let n = world.fetch_u32(tid);
            return call::do_method_call(world, tid, name, n, false);
        }
        Opcode::CallMethodKw => {
            let name = StringId::from_index(world.fetch_u32(tid));
            let n = world.fetch_u32(tid);
            return call::do_method_call(world, tid, name, n, true);
        }
        Opcode::CallSuper => {
            let cid = crate::value::ClassId(world.fetch_u32(tid));
            let name = StringId::from_index(world.fetch_u32(tid));
            let n = world.fetch_u32(tid);
            return call::do_super_call(world, tid, cid, name, n);
        }
        Opcode::TagPush => {
            let tag = TagId(world.fetch_u32(tid));
            let v = world.pop(tid);
            let wrapped = ops::tag_push(world, v, tag);
            world.push(tid, wrapped);
        }
        Opcode::Return => {
            let v = world.pop(tid);
            return exceptions::perform_return(world, tid, v);
        }
        Opcode::Yield => {
            let v = world.pop(tid);
            return call::perform_yield(world, tid, v);
        }
        Opcode::Halt => {
            let v = world.pop(tid);
            return Ok(Flow::Done(v));
        }
        Opcode::Jump => {
            let off = world.fetch_i32(tid);
            world.jump(tid, off);
        }
        Opcode::JumpIf => {
            let off = world.fetch_i32(tid);
            let v = world.pop(tid);
            if v.truthy() {
                world.jump(tid, off);
            }
        }
        Opcode::JumpIfNot => {
            let off = world.fetch_i32(tid);
            let v = world.pop(tid);
            if !v.truthy() {
                world.jump(tid, off);
            }
        }
        Opcode::JumpIfNil => {
            let off = world.fetch_i32(tid);
            let v = world.pop(tid);
            if v.is_nil() {
                world.jump(tid, off);
            }
        }
        Opcode::JumpIfNone => {
            let off = world.fetch_i32(tid);
            if matches!(world.peek(tid), Value::Sentinel) {
                world.pop(tid);
                world.jump(tid, off);
            }
        }
        Opcode::Dup => {
            let v = world.peek(tid);
            world.push(tid, v);
        }
        Opcode::Pop => {
            world.pop(tid);
        }
        Opcode::Swap => {
            let st = world.thread(tid);
            let len = st.stack.len();
            st.stack.swap(len - 1, len - 2);
        }
        Opcode::SaveStackPos => {
            let depth = world.thread(tid).stack.len();
            world.thread(tid).sp_saves.push(depth);
        }
        Opcode::RestoreStackPos => {
            let depth = world.thread(tid).sp_saves.pop().expect("saved stack position");
            world.thread(tid).stack.truncate(depth);
        }
        Opcode::Splat => {
            let v = world.pop(tid);
            match v {
                Value::Ref(id) => match world.heap.get(id) {
                    HeapData::Array(items) => {
                        let items = items.clone();
                        for item in items {
                            world.push(tid, item);
                        }
                    }
                    HeapData::Tuple(t) => {
                        let items = t.items.clone();
                        for item in items {
                            world.push(tid, item);
                        }
                    }
                    _ => return Err(world.throw(RtTag::TypeError, "cannot spread a non-array value")),
                },
                _ => return Err(world.throw(RtTag::TypeError, "cannot spread a non-array value")),
            }
        }
        Opcode::TryAssignNonNil
        | Opcode::TryIndex
        | Opcode::ArrayRest
        | Opcode::EnsureLen
        | Opcode::TryTagPop
        | Opcode::TryRegex
        | Opcode::TryKey
        | Opcode::BadMatch
        | Opcode::UntagOrDie => return pattern::step(world, tid, op).map(|()| Flow::Continue),
        Opcode::Add
        | Opcode::Sub
        | Opcode::Mul
        | Opcode::Div
        | Opcode::Mod
        | Opcode::Eq
        | Opcode::Neq
        | Opcode::Lt
        | Opcode::Leq
        | Opcode::Gt
        | Opcode::Geq
        | Opcode::Cmp
        | Opcode::BitAnd
        | Opcode::BitOr
        | Opcode::BitXor
        | Opcode::Shl
        | Opcode::Shr => {
            let rhs = world.pop(tid);
            let lhs = world.pop(tid);
            let out = ops::binary(world, op, lhs, rhs)?;
            world.push(tid, out);
        }
        Opcode::Neg => {
            let v = world.pop(tid);
            let out = ops::negate(world, v)?;
            world.push(tid, out);
        }
        Opcode::Not => {
            let v = world.pop(tid);
            world.push(tid, Value::Bool(!v.truthy()));
        }
        Opcode::Subscript => {
            let index = world.pop(tid);
            let container = world.pop(tid);
            let out = ops::subscript(world, container, index)?;
            world.push(tid, out);
        }
        Opcode::Slice => {
            let k = world.pop(tid);
            let j = world.pop(tid);
            let i = world.pop(tid);
            let subject = world.pop(tid);
            let out = ops::slice(world, subject, i, j, k)?;
            world.push(tid, out);
        }
        Opcode::Member => {
            let name = StringId::from_index(world.fetch_u32(tid));
            let maybe = world.fetch_byte(tid) != 0;
            let obj = world.pop(tid);
            if maybe && obj.is_nil() {
                world.push(tid, Value::Nil);
            } else {
                let out = ops::member_access(world, tid, obj, name)?;
                world.push(tid, out);
            }
        }
        Opcode::DynMember => {
            let name_val = world.pop(tid);
            let obj = world.pop(tid);
            let Some(name) = crate::value::value_str(&world.heap, &world.interns, &name_val).map(str::to_string) else {
                return Err(world.throw(RtTag::TypeError, "dynamic member name must be a string"));
            };
            let id = world.interns.intern(&name);
            let out = ops::member_access(world, tid, obj, id)?;
            world.push(tid, out);
        }
        Opcode::RangeNew => {
            let inclusive = world.fetch_byte(tid) != 0;
            let hi = world.pop(tid);
            let lo = world.pop(tid);
            let v = world.heap.alloc_value(HeapData::Range(crate::types::Range { lo, hi, inclusive }));
            world.push(tid, v);
        }
        Opcode::Len => {
            let v = world.pop(tid);
            let out = ops::length(world, v)?;
            world.push(tid, Value::Int(out));
        }
        Opcode::Keys => {
            let v = world.pop(tid);
            match v {
                Value::Ref(id) if matches!(world.heap.get(id), HeapData::Dict(_)) => {
                    let keys = crate::types::dict_keys(&world.heap, id);
                    let out = world.heap.alloc_value(HeapData::Array(keys));
                    world.push(tid, out);
                }
                _ => return Err(world.throw(RtTag::TypeError, "keys of a non-dict value")),
            }
        }
        Opcode::Contains => {
            let negated = world.fetch_byte(tid) != 0;
            let collection = world.pop(tid);
            let item = world.pop(tid);
            let found = ops::contains(world, &collection, &item)?;
            world.push(tid, Value::Bool(found != negated));
        }
        Opcode::ConcatStrings => {
            let n = world.fetch_u32(tid);
            let parts = world.pop_args(tid, n);
            let mut out = String::new();
            for p in &parts {
                match crate::value::value_str(&world.heap, &world.interns, p) {
                    Some(s) => out.push_str(s),
                    None => {
                        let rendered = display_value(world, *p);
                        out.push_str(&rendered);
                    }
                }
            }
            let v = world.heap.alloc_str(&out);
            world.push(tid, v);
        }
        Opcode::ToString => {
            let fmt = world.fetch_u32(tid);
            let v = world.pop(tid);
            let s = if fmt == FROM_MARK {
                display_value(world, v)
            } else {
                let spec = world.interns.get(StringId::from_index(fmt)).to_string();
                format_value(world, v, &spec)
            };
            let out = world.heap.alloc_str(&s);
            world.push(tid, out);
        }
        Opcode::TypeOf => {
            let v = world.pop(tid);
            let name = v.type_name(&world.heap);
            let id = world.interns.intern(name);
            world.push(tid, Value::InternStr(id));
        }
        Opcode::Throw => {
            let v = world.pop(tid);
            return Err(VmError::Throw(v));
        }
        Opcode::PushTry => {
            let catch_off = world.fetch_i32(tid);
            let finally_off = world.fetch_i32(tid);
            let base_ip = world.frame(tid).ip;
            // Offsets are relative to the end of their own operand.
            let catch_ip = offset_ip(base_ip - 4, catch_off);
            let finally_ip = offset_ip(base_ip, finally_off);
            let st = &world.threads[tid].state;
            let h = Handler {
                frame: st.frames.len() - 1,
                stack: st.stack.len(),
                sp_saves: st.sp_saves.len(),
                targets: st.targets.len(),
                catch_ip,
                finally_ip,
            };
            world.thread(tid).handlers.push(h);
        }
        Opcode::PopTry => {
            world.thread(tid).handlers.pop().expect("handler to pop");
        }
        Opcode::EndFinally => {
            let pending = world.thread(tid).pending.pop().unwrap_or(Pending::Fall);
            match pending {
                Pending::Fall => {}
                Pending::Throw(v) => return Err(VmError::Throw(v)),
                Pending::Return(v) => return exceptions::perform_return(world, tid, v),
            }
        }
        Opcode::Defer => {
            let unwind_only = world.fetch_byte(tid) != 0;
            let f = world.pop(tid);
            let action = if unwind_only { DeferAction::CallUnwind(f) } else { DeferAction::Call(f) };
            world.frame_mut(tid).defers.push(action);
        }
        Opcode::DeferDrop => {
            let kind = world.fetch_byte(tid);
            let idx = world.fetch_u32(tid);
            let v = match AccessKind::from_repr(kind) {
                Some(AccessKind::Local) => world.read_local(tid, idx),
                Some(AccessKind::Global) => world.global(idx),
                Some(AccessKind::Capture) => world.read_capture(tid, idx),
                None => return Err(VmError::Fatal("bad access kind".to_string())),
            };
            world.frame_mut(tid).defers.push(DeferAction::DropValue(v));
        }
        Opcode::GetIter => {
            let v = world.pop(tid);
            let it = iter::get_iter(world, v)?;
            world.push(tid, it);
        }
        Opcode::IterNext => {
            return iter::iter_next(world, tid);
        }
        Opcode::ClassMethod => {
            let cid = world.fetch_u32(tid) as usize;
            let name = StringId::from_index(world.fetch_u32(tid));
            let kind = world.fetch_byte(tid);
            let f = world.pop(tid);
            let class = &mut world.classes[cid];
            match kind {
                1 => class.getters.insert(name, f),
                2 => class.setters.insert(name, f),
                3 => class.statics.insert(name, f),
                _ => class.methods.insert(name, f),
            };
        }
        Opcode::ClassFieldDefault => {
            let cid = world.fetch_u32(tid) as usize;
            let idx = world.fetch_u32(tid) as usize;
            let v = world.pop(tid);
            let class = &mut world.classes[cid];
            if class.field_defaults.len() <= idx {
                class.field_defaults.resize(idx + 1, Value::Nil);
            }
            class.field_defaults[idx] = v;
        }
        Opcode::TagMethod => {
            let tag = TagId(world.fetch_u32(tid));
            let name = StringId::from_index(world.fetch_u32(tid));
            let f = world.pop(tid);
            world.tags.add_method(tag, name, f);
        }
        Opcode::ExecCode => {
            let mid = world.fetch_u32(tid) as usize;
            if world.modules_executed[mid] {
                world.push(tid, Value::Nil);
            } else {
                world.modules_executed[mid] = true;
                let init = world.program.modules[mid].init;
                call::push_plain_frame(world, tid, init);
            }
        }
        Opcode::Eval => {
            let src_val = world.pop(tid);
            let Some(src) = crate::value::value_str(&world.heap, &world.interns, &src_val).map(str::to_string) else {
                return Err(world.throw(RtTag::TypeError, "eval of a non-string value"));
            };
            let fid = crate::compile::Compiler::new(world)
                .compile_eval(&src)
                .map_err(|d| VmError::Fatal(d.message))?;
            call::push_plain_frame(world, tid, fid);
        }
        Opcode::Render => {
            let template = world.fetch_u32(tid) as usize;
            let nholes = world.fetch_u32(tid);
            let holes = world.pop_args(tid, nholes);
            let body = world.program.templates[template].clone();
            let expanded = render_template(world, body, &holes);
            let v = world.heap.alloc_value(HeapData::Ast(AstValue::Expr(Box::new(expanded))));
            world.push(tid, v);
        }
    }

    Ok(Flow::Continue)
}

fn offset_ip(base: usize, off: i32) -> usize {
    let ip = i64::try_from(base).expect("ip fits i64") + i64::from(off);
    usize::try_from(ip).expect("offset stays in bounds")
}

/// Substitutes template holes with the expansion-time values.
fn render_template(world: &mut World, mut body: crate::ast::Expr, holes: &[Value]) -> crate::ast::Expr {
    use crate::ast::{ExprKind, Visitor};

    struct Subst<'a> {
        world: &'a mut World,
        holes: &'a [Value],
    }

    impl Visitor for Subst<'_> {
        fn visit_expr(&mut self, e: &mut crate::ast::Expr) {
            let hole = match e.kind {
                ExprKind::TemplateHole(i) | ExprKind::TemplateTHole(i) | ExprKind::TemplateXHole(i) => Some((i, true)),
                ExprKind::TemplateVHole(i) => Some((i, false)),
                _ => None,
            };
            if let Some((i, as_ast)) = hole {
                let v = self.holes.get(i as usize).copied().unwrap_or(Value::Nil);
                *e = if as_ast {
                    crate::compile::value_to_expr(self.world, v, e.span)
                } else {
                    self.world.add_const_root(v);
                    crate::ast::Expr::new(e.span, ExprKind::ConstValue(v))
                };
                return;
            }
            crate::ast::walk_expr(self, e);
        }
    }

    let mut subst = Subst { world, holes };
    subst.visit_expr(&mut body);
    body
}

// ----------------------------------------------------------------------
// Thread builtins' helpers (spawn target).
// ----------------------------------------------------------------------

/// Spawns an OS thread running `f(args…)` in a fresh VM thread; returns the
/// thread handle value.
pub fn spawn_thread(world: &mut World, f: Value, args: Vec<Value>) -> RunResult<Value> {
    let Some(shared) = world.shared.upgrade() else {
        return Err(VmError::Fatal("threads are unavailable in this context".to_string()));
    };
    let tid = world.new_thread();
    let immediate = call::setup_entry(world, tid, f, args)?;
    let handle = world.heap.alloc_value(HeapData::Thread(ThreadHandle { tid }));

    if let Some(v) = immediate {
        world.threads[tid].done = true;
        world.threads[tid].result = v;
        return Ok(handle);
    }

    std::thread::spawn(move || {
        let _ = execute(&shared, tid);
    });

    Ok(handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::NoPrint;

    #[test]
    fn builtin_tags_are_registered_in_order() {
        let world = World::new(Box::new(NoPrint));
        assert_eq!(world.rt_tag(RtTag::Cancelled), TagId(1));
        assert_eq!(world.rt_tag(RtTag::ArityError), TagId(BUILTIN_TAGS.len() as u32));
        assert_eq!(world.tags.count(), BUILTIN_TAGS.len());
    }
}
