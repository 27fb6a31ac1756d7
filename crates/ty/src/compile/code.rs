//! Compiled code objects and the program they live in.

use std::sync::Arc;

use smallvec::SmallVec;

use crate::{
    intern::StringId,
    location::Span,
    scope::CaptureSrc,
    value::{FunctionId, RegexId},
};

/// One entry of a code object's location map.
#[derive(Debug, Clone, Copy)]
pub struct LocationEntry {
    /// Instruction start offset.
    pub offset: u32,
    /// The AST span that produced the instruction.
    pub span: Span,
}

/// A compiled function body: bytecode plus its location map.
#[derive(Debug, Clone, Default)]
pub struct Code {
    pub bytes: Vec<u8>,
    /// Sorted by offset; one entry per emit site, densely covering the
    /// buffer.
    pub locations: Vec<LocationEntry>,
}

impl Code {
    /// The span of the instruction containing `offset`, by binary search.
    #[must_use]
    pub fn location_at(&self, offset: usize) -> Option<Span> {
        let offset = u32::try_from(offset).ok()?;
        let i = match self.locations.binary_search_by_key(&offset, |e| e.offset) {
            Ok(i) => i,
            Err(0) => return None,
            Err(i) => i - 1,
        };
        Some(self.locations[i].span)
    }
}

/// One parameter of a compiled function.
#[derive(Debug, Clone)]
pub struct ParamInfo {
    pub name: StringId,
    pub has_default: bool,
    pub has_constraint: bool,
}

/// Header and body of one compiled function.
#[derive(Debug, Clone, Default)]
pub struct FuncInfo {
    pub name: Option<StringId>,
    pub params: Vec<ParamInfo>,
    /// Frame slot of the first parameter (1 for methods, whose slot 0 is
    /// the implicit receiver).
    pub param_base: u32,
    /// Index into `params` collecting positional overflow.
    pub rest: Option<u32>,
    /// Index into `params` collecting keyword overflow.
    pub kwargs: Option<u32>,
    pub nlocals: u32,
    /// Local slots that must be celled at frame entry (captured by inner
    /// functions). Almost always tiny.
    pub cell_slots: SmallVec<[u32; 4]>,
    /// Capture environment layout: where each captured cell comes from in
    /// the parent frame.
    pub captures: Vec<CaptureSrc>,
    pub is_generator: bool,
    pub code: Code,
}

/// One named-group bind of a regex pattern.
#[derive(Debug, Clone)]
pub struct RegexBindSpec {
    pub group: usize,
    pub kind: crate::compile::op::AccessKind,
    pub index: u32,
}

/// A regex pattern site: which regex, and which groups bind where.
#[derive(Debug, Clone)]
pub struct RegexMatchSpec {
    pub regex: RegexId,
    pub binds: Vec<RegexBindSpec>,
}

/// A compiled module: init function plus its namespace bookkeeping.
#[derive(Debug, Clone)]
pub struct ModuleInfo {
    pub path: String,
    pub init: FunctionId,
}

/// Everything the compiler produces for a program: function bodies, regex
/// literals, tuple shapes, templates, and module initializers.
#[derive(Debug, Default)]
pub struct Program {
    pub funcs: Vec<FuncInfo>,
    pub regexes: Vec<Arc<fancy_regex::Regex>>,
    pub regex_sources: Vec<String>,
    pub tuple_shapes: Vec<Vec<Option<StringId>>>,
    pub match_specs: Vec<RegexMatchSpec>,
    pub templates: Vec<crate::ast::Expr>,
    pub modules: Vec<ModuleInfo>,
}

impl Program {
    #[must_use]
    pub fn func(&self, id: FunctionId) -> &FuncInfo {
        &self.funcs[id.0 as usize]
    }

    pub fn add_func(&mut self, f: FuncInfo) -> FunctionId {
        let id = FunctionId(u32::try_from(self.funcs.len()).expect("function count exceeds u32"));
        self.funcs.push(f);
        id
    }

    pub fn add_regex(&mut self, re: Arc<fancy_regex::Regex>, source: String) -> RegexId {
        let id = RegexId(u32::try_from(self.regexes.len()).expect("regex count exceeds u32"));
        self.regexes.push(re);
        self.regex_sources.push(source);
        id
    }
}
