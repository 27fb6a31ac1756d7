//! The public execution surface.
//!
//! A [`Runner`] compiles one source file into a world and runs it: the main
//! thread interprets the entry module's code under the world lock, spawned
//! threads share the same world, and `run` returns the final value (or the
//! rendered diagnostic).

use std::sync::Arc;

use crate::{
    compile::Compiler,
    diagnostics::Diagnostic,
    io::{CollectStringPrint, PrintWriter, StdPrint},
    value::{FunctionId, Value},
    vm::{self, VmShared, World},
};

/// A compiled program, ready to run.
pub struct Runner {
    shared: Arc<VmShared>,
    main: FunctionId,
}

/// The observable result of a run.
#[derive(Debug, Clone, PartialEq)]
pub enum RunValue {
    Nil,
    Bool(bool),
    Int(i64),
    Real(f64),
    Str(String),
    Other(String),
}

impl Runner {
    /// Compiles `source` with output going to stdout.
    pub fn new(source: &str, path: &str) -> Result<Self, Diagnostic> {
        Self::with_printer(source, path, Box::new(StdPrint))
    }

    /// Compiles `source`, capturing output into the returned collector.
    pub fn new_collecting(source: &str, path: &str) -> Result<(Self, CollectStringPrint), Diagnostic> {
        let collector = CollectStringPrint::new();
        let runner = Self::with_printer(source, path, Box::new(collector.handle()))?;
        Ok((runner, collector))
    }

    pub fn with_printer(source: &str, path: &str, printer: Box<dyn PrintWriter + Send>) -> Result<Self, Diagnostic> {
        let mut world = World::new(printer);
        let main = Compiler::new(&mut world).compile_source(path, source)?;
        let shared = VmShared::new(world);
        Ok(Self { shared, main })
    }

    /// Runs the program's entry module on the calling thread.
    pub fn run(&self) -> Result<RunValue, Diagnostic> {
        let tid = {
            let mut world = self.shared.world.lock().expect("world lock poisoned");
            let tid = world.new_thread();
            vm::push_plain_frame(&mut world, tid, self.main);
            tid
        };
        let v = vm::execute(&self.shared, tid)?;
        let mut world = self.shared.world.lock().expect("world lock poisoned");
        Ok(snapshot(&mut world, v))
    }

    /// Renders a diagnostic against this runner's sources.
    #[must_use]
    pub fn render(&self, diag: &Diagnostic, color: bool) -> String {
        let world = self.shared.world.lock().expect("world lock poisoned");
        diag.render(&world.sources, color)
    }
}

/// Renders a compile-error diagnostic when no runner was produced.
#[must_use]
pub fn render_compile_error(source: &str, path: &str, diag: &Diagnostic, color: bool) -> String {
    let mut sources = crate::location::SourceMap::new();
    sources.add(path, source);
    diag.render(&sources, color)
}

fn snapshot(world: &mut World, v: Value) -> RunValue {
    match v {
        Value::Nil | Value::Sentinel => RunValue::Nil,
        Value::Bool(b) => RunValue::Bool(b),
        Value::Int(k) => RunValue::Int(k),
        Value::Real(x) => RunValue::Real(x),
        _ => match crate::value::value_str(&world.heap, &world.interns, &v) {
            Some(s) => RunValue::Str(s.to_string()),
            None => RunValue::Other(vm::display_value(world, v)),
        },
    }
}
