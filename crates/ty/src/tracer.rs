//! Execution tracing hooks.
//!
//! The world owns one tracer; the VM reports instruction dispatch, calls,
//! and collection cycles through it. The default tracer ignores everything;
//! `StderrTracer` prints a line per event for debugging interpreter or GC
//! behavior, and `CountingTracer` aggregates instruction counts for tests
//! and profiling.

/// Hooks called by the VM at notable points.
pub trait VmTracer {
    fn on_instruction(&mut self, _op: &'static str) {}
    fn on_call(&mut self, _name: &str) {}
    fn on_collect_start(&mut self, _live: usize) {}
    fn on_collect_end(&mut self, _freed: usize, _live: usize) {}
    fn on_note(&mut self, _msg: &str) {}
}

/// The default: no output, no counting.
#[derive(Debug, Default)]
pub struct NoopTracer;

impl VmTracer for NoopTracer {}

/// Prints every event to stderr.
#[derive(Debug, Default)]
pub struct StderrTracer;

impl VmTracer for StderrTracer {
    fn on_instruction(&mut self, op: &'static str) {
        eprintln!("[vm] {op}");
    }

    fn on_call(&mut self, name: &str) {
        eprintln!("[vm] call {name}");
    }

    fn on_collect_start(&mut self, live: usize) {
        eprintln!("[gc] collecting ({live} live)");
    }

    fn on_collect_end(&mut self, freed: usize, live: usize) {
        eprintln!("[gc] freed {freed}, {live} live");
    }

    fn on_note(&mut self, msg: &str) {
        eprintln!("[vm] {msg}");
    }
}

/// Counts instructions and collections.
#[derive(Debug, Default)]
pub struct CountingTracer {
    pub instructions: u64,
    pub calls: u64,
    pub collections: u64,
}

impl VmTracer for CountingTracer {
    fn on_instruction(&mut self, _op: &'static str) {
        self.instructions += 1;
    }

    fn on_call(&mut self, _name: &str) {
        self.calls += 1;
    }

    fn on_collect_end(&mut self, _freed: usize, _live: usize) {
        self.collections += 1;
    }
}
