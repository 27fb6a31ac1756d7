#![doc = include_str!("../../../README.md")]

pub mod ast;
pub mod builtins;
pub mod compile;
pub mod diagnostics;
pub mod heap;
pub mod intern;
pub mod io;
pub mod lex;
pub mod location;
pub mod modules;
pub mod parse;
pub mod run;
pub mod scope;
pub mod tags;
pub mod tracer;
pub mod types;
pub mod value;
pub mod vm;

pub use crate::{
    diagnostics::{Diagnostic, ErrorKind},
    io::{CollectStringPrint, NoPrint, PrintWriter, StdPrint},
    location::{Location, SourceMap, Span, SrcId},
    run::{RunValue, Runner, render_compile_error},
    tracer::{CountingTracer, NoopTracer, StderrTracer, VmTracer},
};
