//! AST to bytecode.
//!
//! Compilation runs statement by statement: the parser hands over one
//! statement, the symbolization pass resolves every identifier against the
//! scope tree (recording closure captures along the way), and the emitter
//! writes bytecode into the current function's builder. Driving the parser
//! from here is what lets macro definitions take effect for the very next
//! statement, and what gives the preprocessor a compile-time eval hook.
//!
//! The compiler owns the scope arena, namespaces, the operator table, and
//! the macro table as [`CompilerState`]; the state survives compilation
//! inside the [`World`] so that runtime `eval` can resume it.

pub mod builder;
pub mod code;
pub mod op;

use ahash::AHashMap;

use crate::{
    ast::{
        Arg, BinOp, ClassDef, ClassKind, CondPart, Expr, ExprKind, FieldDef, FnKind, FunctionExpr, IncDec, LogicOp,
        MarkSynthetic, MatchCase, Param, SpecialPart, Stmt, StmtKind, UnOp, Visitor,
    },
    diagnostics::{DiagResult, Diagnostic, ErrorKind},
    heap::HeapData,
    intern::StringId,
    lex::token::RegexTok,
    location::{Span, SrcId},
    parse::{MacroHost, MacroKind, NoMacros, OperatorTable, Parser},
    scope::{Access, NamespaceId, ScopeId, Scopes, SymbolId},
    tags::TagId,
    types::{AstValue, ClassInfo},
    value::{ClassId, FunctionId, Value},
    vm::{self, World},
};

use self::{
    builder::{CodeBuilder, JumpSite},
    code::{FuncInfo, ModuleInfo, ParamInfo, Program, RegexBindSpec, RegexMatchSpec},
    op::{AccessKind, FROM_MARK, Opcode},
};

/// Result alias for compilation.
pub type CompileResult<T> = DiagResult<T>;

/// A defined macro: the compiled function value and its kind.
#[derive(Debug, Clone, Copy)]
pub struct MacroDef {
    pub value: Value,
    pub kind: MacroKind,
}

/// An imported module visible under an alias.
#[derive(Debug, Clone, Copy)]
pub struct ModuleRef {
    pub scope: ScopeId,
    pub ns: NamespaceId,
    pub module: u32,
}

/// Compiler state that outlives a single compilation (module cache, scopes,
/// operator table), kept in the world so runtime `eval` can extend it.
#[derive(Debug, Default)]
pub struct CompilerState {
    pub scopes: Scopes,
    pub namespaces: crate::scope::Namespaces,
    pub ops: OperatorTable,
    pub macros: AHashMap<SymbolId, MacroDef>,
    /// Resolved module path -> module ref.
    pub module_cache: AHashMap<String, ModuleRef>,
    pub builtin_scope: Option<ScopeId>,
}

/// Per-loop emission context.
struct LoopCtx {
    breaks: Vec<JumpSite>,
    continues: Vec<JumpSite>,
    /// Iterator values this loop keeps on the stack (popped at break).
    iter_depth: u32,
    /// Try-region depth at loop entry; break unwinds the difference.
    try_depth: usize,
}

/// An open protected region during emission.
struct TryCtx {
    finally: Option<Stmt>,
}

/// Emission context for one function.
struct FnCtx {
    builder: CodeBuilder,
    loops: Vec<LoopCtx>,
    trys: Vec<TryCtx>,
    match_fails: Vec<Vec<JumpSite>>,
    match_successes: Vec<Vec<JumpSite>>,
    is_generator: bool,
}

impl FnCtx {
    fn new(is_generator: bool) -> Self {
        Self {
            builder: CodeBuilder::new(),
            loops: Vec::new(),
            trys: Vec::new(),
            match_fails: Vec::new(),
            match_successes: Vec::new(),
            is_generator,
        }
    }
}

/// The compiler.
pub struct Compiler<'w> {
    world: &'w mut World,
    st: CompilerState,
    fns: Vec<FnCtx>,
    /// Current lexical scope.
    scope: ScopeId,
    /// Current namespace.
    ns: NamespaceId,
    /// Module aliases visible in the module being compiled.
    aliases: AHashMap<String, ModuleRef>,
    /// Class ids of enclosing class bodies (`super` dispatch).
    class_stack: Vec<ClassId>,
    src: SrcId,
    /// Import chain for diagnostics.
    import_stack: Vec<Span>,
}

impl<'w> Compiler<'w> {
    /// Creates a compiler over `world`, reusing any state a previous
    /// compilation left there.
    pub fn new(world: &'w mut World) -> Self {
        let mut st = world.take_compiler_state();
        let builtin_scope = match st.builtin_scope {
            Some(s) => s,
            None => {
                let s = st.scopes.new_scope(None, true);
                for (i, b) in crate::builtins::BUILTINS.iter().enumerate() {
                    let sym = st.scopes.add_unchecked(s, b.name, Span::default());
                    st.scopes.symbol_mut(sym).const_ = true;
                    let slot = st.scopes.symbol(sym).slot;
                    world.set_global(slot, Value::Builtin(crate::value::BuiltinId(
                        u16::try_from(i).expect("builtin count fits u16"),
                    )));
                }
                // The runtime's own error tags are catchable by name.
                for (i, name) in crate::vm::BUILTIN_TAGS.iter().enumerate() {
                    let sym = st.scopes.add_unchecked(s, name, Span::default());
                    st.scopes.symbol_mut(sym).const_ = true;
                    st.scopes.symbol_mut(sym).tag =
                        Some(u32::try_from(i + 1).expect("builtin tag id fits u32"));
                }
                st.builtin_scope = Some(s);
                s
            }
        };
        let ns = match st.namespaces.root() {
            Some(root) => root,
            None => st.namespaces.create("", None, true),
        };
        Self {
            world,
            st,
            fns: Vec::new(),
            scope: builtin_scope,
            ns,
            aliases: AHashMap::new(),
            class_stack: Vec::new(),
            src: SrcId(0),
            import_stack: Vec::new(),
        }
    }

    /// Compiles `source` as the entry module, returning its function id.
    pub fn compile_source(mut self, name: &str, source: &str) -> CompileResult<FunctionId> {
        let srcid = self.world.sources.add(name, source);
        let (fid, _) = self.compile_module_text(srcid, source.to_string(), true)?;
        self.world.put_compiler_state(self.st);
        Ok(fid)
    }

    /// Compiles one module's text into an init function, returning the
    /// module's top-level scope as well.
    fn compile_module_text(
        &mut self,
        srcid: SrcId,
        source: String,
        is_entry: bool,
    ) -> CompileResult<(FunctionId, ScopeId)> {
        let builtin = self.st.builtin_scope.expect("builtin scope initialized");
        let module_scope = self.st.scopes.new_module_scope(Some(builtin));

        let saved_scope = std::mem::replace(&mut self.scope, module_scope);
        let saved_src = std::mem::replace(&mut self.src, srcid);
        let saved_aliases = std::mem::take(&mut self.aliases);

        self.fns.push(FnCtx::new(false));

        let mut parser = Parser::new(srcid, &source, self.st.ops.clone());
        let result = self.compile_statements(&mut parser);
        self.st.ops = parser.into_ops();

        let ctx = self.fns.pop().expect("module fn ctx pushed above");
        self.scope = saved_scope;
        self.src = saved_src;
        self.aliases = saved_aliases;
        result.map_err(|d| self.with_chain(d))?;

        let code = if is_entry {
            ctx.builder.build_halting()
        } else {
            ctx.builder.build()
        };
        let info = FuncInfo {
            code,
            ..FuncInfo::default()
        };
        Ok((self.world.program.add_func(info), module_scope))
    }

    /// Compiles an `eval` source string at runtime: statements run in a
    /// fresh module scope sharing the globals, and the value of a trailing
    /// expression statement becomes the result.
    pub fn compile_eval(mut self, source: &str) -> CompileResult<FunctionId> {
        let srcid = self.world.sources.add("<eval>", source);
        let builtin = self.st.builtin_scope.expect("builtin scope initialized");
        let module_scope = self.st.scopes.new_module_scope(Some(builtin));

        let saved_scope = std::mem::replace(&mut self.scope, module_scope);
        let saved_src = std::mem::replace(&mut self.src, srcid);
        self.fns.push(FnCtx::new(false));

        let source_owned = source.to_string();
        let mut parser = Parser::new(srcid, &source_owned, self.st.ops.clone());
        let result: CompileResult<()> = (|| {
            let mut last_expr: Option<Expr> = None;
            loop {
                let t = parser.parse_get_token();
                if matches!(t.kind, crate::lex::token::TokenKind::End) {
                    break;
                }
                if let Some(pending) = last_expr.take() {
                    self.emit_expression(&pending)?;
                    self.b().emit(Opcode::Pop);
                }
                let mut stmt = parser.parse_statement(&mut NoMacros)?;
                if let StmtKind::Expression(_) = &stmt.kind {
                    self.symbolize_statement(&mut stmt)?;
                    let StmtKind::Expression(e) = stmt.kind else {
                        unreachable!("checked above");
                    };
                    last_expr = Some(e);
                } else {
                    self.process_statement(&mut stmt)?;
                }
            }
            match last_expr {
                Some(e) => self.emit_expression(&e)?,
                None => self.b().emit(Opcode::Nil),
            }
            self.b().emit(Opcode::Return);
            Ok(())
        })();
        self.st.ops = parser.into_ops();

        let ctx = self.fns.pop().expect("eval ctx pushed above");
        self.scope = saved_scope;
        self.src = saved_src;
        // The state goes back into the world even when compilation failed;
        // later evals must keep resolving the same globals.
        if let Err(diag) = result {
            self.world.put_compiler_state(self.st);
            return Err(diag);
        }

        let info = FuncInfo {
            code: ctx.builder.build(),
            ..FuncInfo::default()
        };
        let fid = self.world.program.add_func(info);
        self.world.put_compiler_state(self.st);
        Ok(fid)
    }

    fn compile_statements(&mut self, parser: &mut Parser<'_>) -> CompileResult<()> {
        loop {
            let t = parser.parse_get_token();
            if matches!(t.kind, crate::lex::token::TokenKind::End) {
                return Ok(());
            }
            let mut stmt = parser.parse_statement(self)?;
            self.process_statement(&mut stmt)?;
        }
    }

    /// Symbolizes and emits one top-level statement, handling the
    /// compile-time statements (macro and operator definitions, imports)
    /// in place.
    fn process_statement(&mut self, s: &mut Stmt) -> CompileResult<()> {
        match &mut s.kind {
            StmtKind::OperatorDef { name, prec, assoc } => {
                self.st.ops.define(name, *prec, *assoc);
                Ok(())
            }
            StmtKind::MacroDef { .. } | StmtKind::FunMacroDef { .. } => self.define_macro(s),
            _ => {
                self.symbolize_statement(s)?;
                let s = &*s;
                self.emit_statement(s)
            }
        }
    }

    fn with_chain(&self, mut d: Diagnostic) -> Diagnostic {
        for site in self.import_stack.iter().rev() {
            d = d.included_from(*site);
        }
        d
    }

    fn err(&self, span: Span, msg: impl Into<String>) -> Diagnostic {
        Diagnostic::new(ErrorKind::CompileError, span, msg)
    }

    // ------------------------------------------------------------------
    // Small helpers.
    // ------------------------------------------------------------------

    fn ctx(&mut self) -> &mut FnCtx {
        self.fns.last_mut().expect("emission outside a function context")
    }

    fn b(&mut self) -> &mut CodeBuilder {
        &mut self.ctx().builder
    }

    fn intern(&mut self, s: &str) -> StringId {
        self.world.interns.intern(s)
    }

    /// Allocates a compiler temporary in the current frame (or globals, at
    /// module level).
    fn tmp_slot(&mut self, span: Span) -> Access {
        let scope = self.scope;
        let sym = self.st.scopes.add_unchecked(scope, "<tmp>", span);
        let symbol = self.st.scopes.symbol(sym);
        if symbol.global {
            Access::Global(symbol.slot)
        } else {
            Access::Local(symbol.slot)
        }
    }

    fn emit_tmp_load(&mut self, tmp: Access) {
        self.emit_load_access(tmp);
    }

    /// Pops the stack top into a temporary.
    fn emit_tmp_store(&mut self, tmp: Access) {
        match tmp {
            Access::Local(slot) => self.b().emit_u32(Opcode::PopVar, slot),
            _ => {
                self.emit_target_access(tmp);
                self.b().emit(Opcode::Assign);
                self.b().emit(Opcode::Pop);
            }
        }
    }

    /// Pushes the temporary's current contents (saving it around a reuse).
    fn emit_tmp_save(&mut self, tmp: Access) {
        match tmp {
            Access::Local(slot) => self.b().emit_u32(Opcode::PushVar, slot),
            _ => self.emit_load_access(tmp),
        }
    }

    fn access_of(&mut self, sym: SymbolId) -> Access {
        let scope = self.scope;
        self.st.scopes.access(scope, sym)
    }

    fn emit_load_access(&mut self, access: Access) {
        match access {
            Access::Local(slot) => self.b().emit_u32(Opcode::LoadVar, slot),
            Access::Global(slot) => self.b().emit_u32(Opcode::LoadGlobal, slot),
            Access::Capture(idx) => self.b().emit_u32(Opcode::LoadRef, idx),
        }
    }

    fn emit_target_access(&mut self, access: Access) {
        match access {
            Access::Local(slot) => self.b().emit_u32(Opcode::TargetVar, slot),
            Access::Global(slot) => self.b().emit_u32(Opcode::TargetGlobal, slot),
            Access::Capture(idx) => self.b().emit_u32(Opcode::TargetRef, idx),
        }
    }

    fn access_kind(access: Access) -> (AccessKind, u32) {
        match access {
            Access::Local(slot) => (AccessKind::Local, slot),
            Access::Global(slot) => (AccessKind::Global, slot),
            Access::Capture(idx) => (AccessKind::Capture, idx),
        }
    }

    fn push_fail(&mut self, site: JumpSite) {
        self.ctx()
            .match_fails
            .last_mut()
            .expect("match fail frame active")
            .push(site);
    }

    fn sym_of(&self, e: &Expr) -> CompileResult<SymbolId> {
        let sym = match &e.kind {
            ExprKind::Ident { sym, .. }
            | ExprKind::MatchNotNil { sym, .. }
            | ExprKind::MatchRest { sym, .. }
            | ExprKind::ResourceBinding { sym, .. }
            | ExprKind::Alias { sym, .. } => *sym,
            _ => None,
        };
        sym.ok_or_else(|| self.err(e.span, "unresolved binding"))
    }

    // ==================================================================
    // Symbolization.
    // ==================================================================

    fn push_scope(&mut self, is_function: bool) -> ScopeId {
        let parent = self.scope;
        let s = self.st.scopes.new_scope(Some(parent), is_function);
        self.scope = s;
        s
    }

    fn pop_scope(&mut self) {
        let parent = self.st.scopes.scope(self.scope).parent.expect("scope underflow");
        self.scope = parent;
    }

    fn declare(&mut self, name: &str, span: Span) -> CompileResult<SymbolId> {
        let scope = self.scope;
        self.st
            .scopes
            .add(scope, name, span)
            .map_err(|msg| self.err(span, msg))
    }

    fn symbolize_statement(&mut self, s: &mut Stmt) -> CompileResult<()> {
        let span = s.span;
        match &mut s.kind {
            StmtKind::Null | StmtKind::Halt | StmtKind::Next | StmtKind::Continue | StmtKind::Break { .. } => Ok(()),
            StmtKind::OperatorDef { .. } => Ok(()),
            StmtKind::Expression(e) => self.symbolize_expression(e),
            StmtKind::Definition {
                target,
                value,
                pub_,
                const_,
            } => {
                self.symbolize_expression(value)?;
                let pub_ = *pub_;
                let const_ = *const_;
                self.symbolize_binding(target, pub_, const_)
            }
            StmtKind::FunctionDef { f, pub_ } => {
                let ExprKind::Function(fx) = &mut f.kind else {
                    return Err(self.err(span, "malformed function definition"));
                };
                let name = fx.name.clone().expect("named function definition");
                let sym = self.declare(&name, span)?;
                if *pub_ {
                    self.publish(sym, &name);
                }
                fx.self_sym = Some(sym);
                self.symbolize_function(fx, false)
            }
            StmtKind::MacroDef { .. } | StmtKind::FunMacroDef { .. } => Ok(()),
            StmtKind::TagDef(c) => self.symbolize_tag(c, span),
            StmtKind::ClassDef(c) => self.symbolize_class(c, span),
            StmtKind::TypeDef { name, ty, .. } => {
                let sym = self.declare(name, span)?;
                self.st.scopes.symbol_mut(sym).type_var = true;
                self.st.scopes.symbol_mut(sym).ty = Some(ty.clone());
                Ok(())
            }
            StmtKind::For { init, cond, next, body } => {
                self.push_scope(false);
                self.symbolize_statement(init)?;
                if let Some(c) = cond {
                    self.symbolize_expression(c)?;
                }
                if let Some(n) = next {
                    self.symbolize_expression(n)?;
                }
                self.symbolize_statement(body)?;
                self.pop_scope();
                Ok(())
            }
            StmtKind::Each {
                target,
                iter,
                cond,
                stop,
                body,
            } => {
                self.symbolize_expression(iter)?;
                self.push_scope(false);
                self.symbolize_pattern(target)?;
                if let Some(c) = cond {
                    self.symbolize_expression(c)?;
                }
                if let Some(st) = stop {
                    self.symbolize_expression(st)?;
                }
                self.symbolize_statement(body)?;
                self.pop_scope();
                Ok(())
            }
            StmtKind::While { parts, body } => {
                self.push_scope(false);
                for p in parts.iter_mut() {
                    self.symbolize_cond_part(p)?;
                }
                self.symbolize_statement(body)?;
                self.pop_scope();
                Ok(())
            }
            StmtKind::WhileMatch { subject, pattern, body } => {
                self.symbolize_expression(subject)?;
                self.push_scope(false);
                self.symbolize_pattern(pattern)?;
                self.symbolize_statement(body)?;
                self.pop_scope();
                Ok(())
            }
            StmtKind::If {
                parts,
                then,
                otherwise,
                ..
            } => {
                self.push_scope(false);
                for p in parts.iter_mut() {
                    self.symbolize_cond_part(p)?;
                }
                self.symbolize_statement(then)?;
                self.pop_scope();
                if let Some(o) = otherwise {
                    self.push_scope(false);
                    self.symbolize_statement(o)?;
                    self.pop_scope();
                }
                Ok(())
            }
            StmtKind::Match { subject, cases } => {
                self.symbolize_expression(subject)?;
                for case in cases {
                    self.push_scope(false);
                    self.symbolize_pattern(&mut case.pattern)?;
                    if let Some(g) = &mut case.guard {
                        self.symbolize_expression(g)?;
                    }
                    self.symbolize_statement(&mut case.body)?;
                    self.pop_scope();
                }
                Ok(())
            }
            StmtKind::Return(es) | StmtKind::GeneratorReturn(es) => {
                for e in es {
                    self.symbolize_expression(e)?;
                }
                Ok(())
            }
            StmtKind::Try { body, catches, finally } => {
                self.push_scope(false);
                self.symbolize_statement(body)?;
                self.pop_scope();
                for case in catches {
                    self.push_scope(false);
                    self.symbolize_pattern(&mut case.pattern)?;
                    if let Some(g) = &mut case.guard {
                        self.symbolize_expression(g)?;
                    }
                    self.symbolize_statement(&mut case.body)?;
                    self.pop_scope();
                }
                if let Some(f) = finally {
                    self.push_scope(false);
                    self.symbolize_statement(f)?;
                    self.pop_scope();
                }
                Ok(())
            }
            StmtKind::Defer(e) | StmtKind::Cleanup(e) => {
                // A deferred action is a zero-argument closure over the
                // scope it was registered in.
                let body = Stmt::new(e.span, StmtKind::Expression(e.clone()));
                let mut f = FunctionExpr {
                    name: None,
                    kind: FnKind::Function,
                    params: Vec::new(),
                    rest: None,
                    kwargs: None,
                    body: Box::new(body),
                    decorators: Vec::new(),
                    return_type: None,
                    type_params: Vec::new(),
                    where_clauses: Vec::new(),
                    self_sym: None,
                    scope: None,
                };
                self.symbolize_function(&mut f, false)?;
                *e = Expr::new(e.span, ExprKind::Function(Box::new(f)));
                Ok(())
            }
            StmtKind::Drop(es) => {
                for e in es {
                    self.symbolize_expression(e)?;
                }
                Ok(())
            }
            StmtKind::Block(ss) => {
                self.push_scope(false);
                for s in ss {
                    self.symbolize_statement(s)?;
                }
                self.pop_scope();
                Ok(())
            }
            StmtKind::Multi(ss) => {
                for s in ss {
                    self.symbolize_statement(s)?;
                }
                Ok(())
            }
            StmtKind::Import {
                module,
                alias,
                names,
                pub_,
            } => {
                let module = module.clone();
                let alias = alias.clone();
                let names = names.clone();
                let pub_ = *pub_;
                self.symbolize_import(span, &module, alias.as_deref(), &names, pub_)
            }
            StmtKind::Export(names) => {
                let names = names.clone();
                for name in &names {
                    let Some(sym) = self.st.scopes.lookup(self.scope, name) else {
                        return Err(self.err(span, format!("export of undefined name '{name}'")));
                    };
                    self.publish(sym, name);
                }
                Ok(())
            }
            StmtKind::Use { module, names } => {
                let module = module.clone();
                let names = names.clone();
                self.symbolize_use(span, module.as_deref(), &names)
            }
            StmtKind::SetType { target, ty } => {
                self.symbolize_expression(target)?;
                if let ExprKind::Ident { sym: Some(sym), .. } = target.kind {
                    self.st.scopes.symbol_mut(sym).ty = Some(ty.clone());
                }
                Ok(())
            }
            StmtKind::NamespaceDef { name, pub_, body } => {
                let ns = self.st.namespaces.create(name, Some(self.ns), *pub_);
                let saved = std::mem::replace(&mut self.ns, ns);
                self.push_scope(false);
                let r: CompileResult<()> = body.iter_mut().try_for_each(|s| self.symbolize_statement(s));
                self.pop_scope();
                self.ns = saved;
                r
            }
        }
    }

    fn symbolize_cond_part(&mut self, p: &mut CondPart) -> CompileResult<()> {
        self.symbolize_expression(&mut p.expr)?;
        if let Some(t) = &mut p.target {
            self.symbolize_pattern(t)?;
        }
        Ok(())
    }

    fn publish(&mut self, sym: SymbolId, name: &str) {
        self.st.scopes.symbol_mut(sym).public = true;
        let ns = self.ns;
        self.st.namespaces.get_mut(ns).symbols.insert(name.to_string(), sym);
    }

    /// Symbolizes a definition target: identifiers declare new symbols.
    fn symbolize_binding(&mut self, target: &mut Expr, pub_: bool, const_: bool) -> CompileResult<()> {
        let span = target.span;
        match &mut target.kind {
            ExprKind::Ident {
                module: None,
                name,
                sym,
            } => {
                let name = name.clone();
                let s = self.declare(&name, span)?;
                self.st.scopes.symbol_mut(s).const_ = const_;
                if pub_ {
                    self.publish(s, &name);
                }
                *sym = Some(s);
                Ok(())
            }
            ExprKind::Ident { module: Some(_), .. } => Err(self.err(span, "qualified name in binding position")),
            ExprKind::MatchAny => Ok(()),
            ExprKind::MatchNotNil { name, sym } | ExprKind::MatchRest { name, sym } => {
                let name = name.clone();
                let s = self.declare(&name, span)?;
                *sym = Some(s);
                Ok(())
            }
            ExprKind::ResourceBinding { name, sym } => {
                let name = name.clone();
                let s = self.declare(&name, span)?;
                *sym = Some(s);
                Ok(())
            }
            ExprKind::Array { elems, .. } => {
                for el in elems {
                    self.symbolize_binding(el, pub_, const_)?;
                }
                Ok(())
            }
            ExprKind::Tuple { items, .. } => {
                for item in items {
                    self.symbolize_binding(item, pub_, const_)?;
                }
                Ok(())
            }
            ExprKind::Dict { keys, values, .. } => {
                for k in keys.iter_mut() {
                    self.symbolize_expression(k)?;
                }
                for v in values {
                    self.symbolize_binding(v, pub_, const_)?;
                }
                Ok(())
            }
            ExprKind::TagPattern { tag, inner } => {
                self.symbolize_expression(tag)?;
                self.symbolize_binding(inner, pub_, const_)
            }
            ExprKind::Alias { pattern, name, sym } => {
                let name = name.clone();
                let s = self.declare(&name, span)?;
                *sym = Some(s);
                self.symbolize_binding(pattern, pub_, const_)
            }
            ExprKind::Cast { e, ty } => {
                self.symbolize_binding(e, pub_, const_)?;
                if let ExprKind::Ident { sym: Some(s), .. } = e.kind {
                    self.st.scopes.symbol_mut(s).ty = Some((**ty).clone());
                }
                Ok(())
            }
            _ => Err(self.err(span, "invalid binding target")),
        }
    }

    /// Symbolizes a pattern: binding identifiers declare in the current
    /// (arm) scope; everything else is resolved as an expression.
    fn symbolize_pattern(&mut self, p: &mut Expr) -> CompileResult<()> {
        let span = p.span;
        match &mut p.kind {
            ExprKind::MatchAny => Ok(()),
            ExprKind::Ident { module: None, name, sym } => {
                // A name that resolves to a tag is a tag pattern; anything
                // else binds.
                let name = name.clone();
                if let Some(existing) = self.st.scopes.lookup(self.scope, &name)
                    && self.st.scopes.symbol(existing).tag.is_some()
                {
                    *sym = Some(existing);
                    return Ok(());
                }
                let s = self.declare(&name, span)?;
                *sym = Some(s);
                Ok(())
            }
            ExprKind::Ident { module: Some(_), .. } => self.symbolize_expression(p),
            ExprKind::MatchNotNil { name, sym } | ExprKind::MatchRest { name, sym } => {
                let name = name.clone();
                let s = self.declare(&name, span)?;
                *sym = Some(s);
                Ok(())
            }
            ExprKind::ResourceBinding { name, sym } => {
                let name = name.clone();
                let s = self.declare(&name, span)?;
                *sym = Some(s);
                Ok(())
            }
            ExprKind::Array { elems, .. } => {
                for el in elems {
                    self.symbolize_pattern(el)?;
                }
                Ok(())
            }
            ExprKind::Tuple { items, .. } => {
                for item in items {
                    self.symbolize_pattern(item)?;
                }
                Ok(())
            }
            ExprKind::Dict { keys, values, .. } => {
                for k in keys.iter_mut() {
                    self.symbolize_expression(k)?;
                }
                for v in values {
                    self.symbolize_pattern(v)?;
                }
                Ok(())
            }
            ExprKind::Choice(alts) => {
                for alt in alts {
                    self.symbolize_pattern(alt)?;
                }
                Ok(())
            }
            ExprKind::TagPattern { tag, inner } => {
                self.symbolize_expression(tag)?;
                self.symbolize_pattern(inner)
            }
            ExprKind::View { f, pat } | ExprKind::NotNilView { f, pat } => {
                self.symbolize_expression(f)?;
                self.symbolize_pattern(pat)
            }
            ExprKind::Alias { pattern, name, sym } => {
                let name = name.clone();
                let s = self.declare(&name, span)?;
                *sym = Some(s);
                self.symbolize_pattern(pattern)
            }
            ExprKind::Regex { tok, binds } => {
                // Named capture groups bind pattern variables.
                let names: Vec<(usize, String)> = tok
                    .re
                    .capture_names()
                    .enumerate()
                    .filter_map(|(i, n)| n.map(|n| (i, n.to_string())))
                    .collect();
                for (group, name) in names {
                    let s = self.declare(&name, span)?;
                    binds.push(crate::ast::RegexBind {
                        group,
                        name,
                        sym: Some(s),
                    });
                }
                Ok(())
            }
            // Literals and arbitrary expressions compare for equality.
            _ => self.symbolize_expression(p),
        }
    }

    fn symbolize_function(&mut self, f: &mut FunctionExpr, is_method: bool) -> CompileResult<()> {
        for d in &mut f.decorators {
            self.symbolize_expression(d)?;
        }
        let fscope = self.push_scope(true);
        f.scope = Some(fscope);
        if is_method {
            let span = f.body.span;
            self.st.scopes.add_unchecked(fscope, "self", span);
        }
        // Parameters first: argument binding maps argument positions onto
        // the leading frame slots.
        for p in &mut f.params {
            let sym = self
                .st
                .scopes
                .add(fscope, &p.name, p.span)
                .map_err(|msg| self.err(p.span, msg))?;
            p.sym = Some(sym);
        }
        for tp in &f.type_params {
            let span = f.body.span;
            let sym = self.st.scopes.add_unchecked(fscope, tp, span);
            self.st.scopes.symbol_mut(sym).type_var = true;
        }
        // Defaults and constraints may reference earlier parameters; they
        // are resolved in the function scope and evaluated in the preamble.
        for p in &mut f.params {
            if let Some(d) = &mut p.default {
                self.symbolize_expression(d)?;
            }
            if let Some(c) = &mut p.constraint {
                self.symbolize_expression(c)?;
            }
        }
        let r = self.symbolize_statement(&mut f.body);
        self.pop_scope();
        r
    }

    fn symbolize_tag(&mut self, c: &mut ClassDef, span: Span) -> CompileResult<()> {
        let name_id = self.intern(&c.name);
        let tag = self.world.tags.new_tag(name_id);
        let sym = self.declare(&c.name.clone(), span)?;
        self.st.scopes.symbol_mut(sym).tag = Some(tag.0);
        self.st.scopes.symbol_mut(sym).const_ = true;
        if c.pub_ {
            let name = c.name.clone();
            self.publish(sym, &name);
        }
        c.sym = Some(sym);
        for m in &mut c.methods {
            let ExprKind::Function(fx) = &mut m.kind else {
                return Err(self.err(m.span, "malformed method"));
            };
            self.symbolize_function(fx, true)?;
        }
        Ok(())
    }

    fn symbolize_class(&mut self, c: &mut ClassDef, span: Span) -> CompileResult<()> {
        let name_id = self.intern(&c.name);
        let class_id = ClassId(u32::try_from(self.world.classes.len()).expect("class count exceeds u32"));
        self.world.classes.push(ClassInfo {
            name: name_id,
            is_trait: c.kind == ClassKind::Trait,
            ..ClassInfo::default()
        });

        let sym = self.declare(&c.name.clone(), span)?;
        self.st.scopes.symbol_mut(sym).class = Some(class_id.0);
        self.st.scopes.symbol_mut(sym).const_ = true;
        if c.pub_ {
            let name = c.name.clone();
            self.publish(sym, &name);
        }
        c.sym = Some(sym);

        if let Some(sup) = &mut c.super_ {
            self.symbolize_expression(sup)?;
            let super_id = self.class_of(sup)?;
            self.world.classes[class_id.0 as usize].super_ = Some(super_id);
        }
        for t in &mut c.traits {
            self.symbolize_expression(t)?;
            let tid = self.class_of(t)?;
            self.world.classes[class_id.0 as usize].traits.push(tid);
        }

        // Implicit-init parameters become an `init` method assigning fields.
        if !c.init_params.is_empty() {
            let init = synth_init_method(c, span);
            c.methods.insert(0, init);
            for p in &c.init_params {
                c.fields.push(FieldDef {
                    name: p.name.clone(),
                    default: None,
                    constraint: p.constraint.clone(),
                    span: p.span,
                });
            }
        }

        for field in &c.fields {
            let fname = self.intern(&field.name);
            self.world.classes[class_id.0 as usize].field_names.push(fname);
        }
        for field in &mut c.fields {
            if let Some(d) = &mut field.default {
                self.symbolize_expression(d)?;
            }
        }

        self.class_stack.push(class_id);
        let r: CompileResult<()> = c
            .methods
            .iter_mut()
            .chain(c.getters.iter_mut())
            .chain(c.setters.iter_mut())
            .map(|m| (m, true))
            .chain(c.statics.iter_mut().map(|m| (m, false)))
            .try_for_each(|(m, is_method)| {
                let ExprKind::Function(fx) = &mut m.kind else {
                    return Err(Diagnostic::new(ErrorKind::CompileError, m.span, "malformed method"));
                };
                self.symbolize_function(fx, is_method)
            });
        self.class_stack.pop();
        r
    }

    fn class_of(&self, e: &Expr) -> CompileResult<ClassId> {
        if let ExprKind::Ident { sym: Some(sym), .. } = &e.kind
            && let Some(cid) = self.st.scopes.symbol(*sym).class
        {
            return Ok(ClassId(cid));
        }
        Err(self.err(e.span, "expected a class name"))
    }

    fn symbolize_expression(&mut self, e: &mut Expr) -> CompileResult<()> {
        let span = e.span;
        match &mut e.kind {
            ExprKind::Nil
            | ExprKind::Boolean(_)
            | ExprKind::Integer(_)
            | ExprKind::Real(_)
            | ExprKind::Str(_)
            | ExprKind::Regex { .. }
            | ExprKind::MatchAny
            | ExprKind::Super
            | ExprKind::TemplateHole(_)
            | ExprKind::TemplateVHole(_)
            | ExprKind::TemplateTHole(_)
            | ExprKind::TemplateXHole(_)
            | ExprKind::ConstValue(_) => Ok(()),
            ExprKind::Ident { module, name, sym } => {
                let module = module.clone();
                let name = name.clone();
                let resolved = self.resolve_ident(span, module.as_deref(), &name)?;
                *sym = Some(resolved);
                Ok(())
            }
            ExprKind::Self_ => {
                if self.st.scopes.lookup(self.scope, "self").is_none() {
                    return Err(self.err(span, "'self' outside of a method"));
                }
                Ok(())
            }
            ExprKind::Special(parts) => {
                for part in parts {
                    if let SpecialPart::Interp { expr, .. } = part {
                        self.symbolize_expression(expr)?;
                    }
                }
                Ok(())
            }
            ExprKind::UserOp { name, lhs, rhs, sym } => {
                let name = name.clone();
                self.symbolize_expression(lhs)?;
                self.symbolize_expression(rhs)?;
                let resolved = self.resolve_ident(span, None, &name)?;
                *sym = Some(resolved);
                Ok(())
            }
            ExprKind::Match { subject, arms } => {
                self.symbolize_expression(subject)?;
                for arm in arms {
                    self.push_scope(false);
                    self.symbolize_pattern(&mut arm.pattern)?;
                    if let Some(g) = &mut arm.guard {
                        self.symbolize_expression(g)?;
                    }
                    self.symbolize_expression(&mut arm.body)?;
                    self.pop_scope();
                }
                Ok(())
            }
            ExprKind::Function(f) => self.symbolize_function(f, false),
            ExprKind::CheckMatch { subject, pattern } => {
                self.symbolize_expression(subject)?;
                self.push_scope(false);
                self.symbolize_pattern(pattern)?;
                self.pop_scope();
                Ok(())
            }
            ExprKind::Defined { .. } => Ok(()),
            ExprKind::Assign { target, value } | ExprKind::MaybeAssign { target, value } => {
                self.symbolize_expression(value)?;
                self.symbolize_assign_target(target)
            }
            ExprKind::CompoundAssign { target, value, .. } => {
                self.symbolize_expression(value)?;
                self.symbolize_assign_target(target)
            }
            ExprKind::IncDec { target, .. } => self.symbolize_assign_target(target),
            ExprKind::With { defs, body } => {
                self.push_scope(false);
                let r: CompileResult<()> = defs
                    .iter_mut()
                    .try_for_each(|d| self.symbolize_statement(d))
                    .and_then(|()| self.symbolize_statement(body));
                self.pop_scope();
                r
            }
            ExprKind::Statement(s) => self.symbolize_statement(s),
            ExprKind::Template { holes, .. } => {
                // Hole expressions are evaluated at expansion time in the
                // enclosing scope; the template body is symbolized when
                // spliced.
                for h in holes {
                    self.symbolize_expression(h)?;
                }
                Ok(())
            }
            ExprKind::MacroInvocation { name, .. } => {
                Err(self.err(span, format!("macro '{name}' used outside of expansion")))
            }
            ExprKind::ArrayCompr { elem, pattern, iter, cond } => {
                self.symbolize_expression(iter)?;
                self.push_scope(false);
                self.symbolize_pattern(pattern)?;
                if let Some(c) = cond {
                    self.symbolize_expression(c)?;
                }
                self.symbolize_expression(elem)?;
                self.pop_scope();
                Ok(())
            }
            ExprKind::DictCompr {
                key,
                value,
                pattern,
                iter,
                cond,
            } => {
                self.symbolize_expression(iter)?;
                self.push_scope(false);
                self.symbolize_pattern(pattern)?;
                if let Some(c) = cond {
                    self.symbolize_expression(c)?;
                }
                self.symbolize_expression(key)?;
                self.symbolize_expression(value)?;
                self.pop_scope();
                Ok(())
            }
            // Everything else just recurses.
            _ => {
                let mut result = Ok(());
                let mut recurse = SymbolizeChildren {
                    compiler: self,
                    result: &mut result,
                };
                crate::ast::walk_expr(&mut recurse, e);
                result
            }
        }
    }

    fn symbolize_assign_target(&mut self, target: &mut Expr) -> CompileResult<()> {
        let span = target.span;
        match &mut target.kind {
            ExprKind::Ident { .. } => {
                self.symbolize_expression(target)?;
                if let ExprKind::Ident { sym: Some(sym), .. } = target.kind
                    && self.st.scopes.symbol(sym).const_
                {
                    return Err(self.err(span, "assignment to constant"));
                }
                Ok(())
            }
            ExprKind::MatchAny => Ok(()),
            ExprKind::Member { object, .. } => self.symbolize_expression(object),
            ExprKind::Subscript { container, index } => {
                self.symbolize_expression(container)?;
                self.symbolize_expression(index)
            }
            ExprKind::Array { elems, .. } | ExprKind::Tuple { items: elems, .. } => {
                for el in elems {
                    self.symbolize_assign_target(el)?;
                }
                Ok(())
            }
            ExprKind::MatchRest { name, sym } => {
                let name = name.clone();
                let Some(existing) = self.st.scopes.lookup(self.scope, &name) else {
                    return Err(self.err(span, format!("assignment to undefined variable '{name}'")));
                };
                *sym = Some(existing);
                Ok(())
            }
            ExprKind::TagPattern { tag, inner } => {
                self.symbolize_expression(tag)?;
                self.symbolize_assign_target(inner)
            }
            ExprKind::Call { callee, args } => {
                self.symbolize_expression(callee)?;
                for a in args {
                    self.symbolize_assign_target(&mut a.value)?;
                }
                Ok(())
            }
            _ => Err(self.err(span, "invalid assignment target")),
        }
    }

    fn resolve_ident(&mut self, span: Span, module: Option<&str>, name: &str) -> CompileResult<SymbolId> {
        if let Some(m) = module {
            // Module alias, then namespace path.
            if let Some(mr) = self.aliases.get(m).copied() {
                if let Some(sym) = self.st.scopes.lookup(mr.scope, name) {
                    if !self.st.scopes.symbol(sym).public {
                        return Err(self.err(span, format!("'{name}' is not public in module '{m}'")));
                    }
                    return Ok(sym);
                }
                return Err(self.err(span, format!("module '{m}' has no member '{name}'")));
            }
            if let Some(ns) = self.st.namespaces.resolve_path(self.ns, m)
                && let Some(&sym) = self.st.namespaces.get(ns).symbols.get(name)
            {
                return Ok(sym);
            }
            return Err(self.err(span, format!("unknown module or namespace '{m}'")));
        }
        self.st
            .scopes
            .lookup(self.scope, name)
            .ok_or_else(|| self.err(span, format!("undefined variable '{name}'")))
    }

    fn symbolize_import(
        &mut self,
        span: Span,
        module: &str,
        alias: Option<&str>,
        names: &[(String, Option<String>)],
        pub_: bool,
    ) -> CompileResult<()> {
        let local = alias.unwrap_or_else(|| module.rsplit('/').next().unwrap_or(module));
        if self.aliases.contains_key(local) {
            return Err(self.err(span, format!("duplicate import alias '{local}'")));
        }

        let mr = self.import_module(span, module)?;
        self.aliases.insert(local.to_string(), mr);

        for (name, as_name) in names {
            let Some(sym) = self.st.scopes.lookup(mr.scope, name) else {
                return Err(self.err(span, format!("module '{module}' has no member '{name}'")));
            };
            if !self.st.scopes.symbol(sym).public {
                return Err(self.err(span, format!("'{name}' is not public in module '{module}'")));
            }
            let bind = as_name.as_deref().unwrap_or(name);
            let scope = self.scope;
            self.st
                .scopes
                .insert_alias(scope, bind, sym)
                .map_err(|msg| self.err(span, msg))?;
            if pub_ {
                self.publish(sym, bind);
            }
        }

        // Run the module initializer at this point of the program.
        self.b().set_location(span);
        self.b().emit_u32(Opcode::ExecCode, mr.module);
        self.b().emit(Opcode::Pop);
        Ok(())
    }

    /// Resolves and compiles a module, reusing the cache on repeat imports.
    fn import_module(&mut self, span: Span, module: &str) -> CompileResult<ModuleRef> {
        let path = crate::modules::resolve_module_path(&self.world.sources, self.src, module)
            .ok_or_else(|| self.err(span, format!("cannot find module '{module}'")))?;
        let key = path.to_string_lossy().to_string();
        if let Some(mr) = self.st.module_cache.get(&key) {
            return Ok(*mr);
        }

        let source = std::fs::read_to_string(&path)
            .map_err(|e| self.err(span, format!("cannot read module '{module}': {e}")))?;
        let srcid = self.world.sources.add(key.clone(), source.clone());

        self.import_stack.push(span);
        let saved_ns = self.ns;
        let module_ns = self.st.namespaces.create(module, None, true);
        self.ns = module_ns;

        let result = self.compile_module_text(srcid, source, false);

        self.ns = saved_ns;
        self.import_stack.pop();
        let (init, module_scope) = result?;

        // Only public symbols resolve through an imported module's scope.
        self.st.scopes.set_external(module_scope);

        let module_id = u32::try_from(self.world.program.modules.len()).expect("module count fits u32");
        self.world.program.modules.push(ModuleInfo {
            path: key.clone(),
            init,
        });
        self.world.modules_executed.push(false);

        let mr = ModuleRef {
            scope: module_scope,
            ns: module_ns,
            module: module_id,
        };
        self.st.module_cache.insert(key, mr);
        Ok(mr)
    }

    /// `use ns::a, b` (or `use alias::a`) pulls names into the current
    /// scope.
    fn symbolize_use(&mut self, span: Span, module: Option<&str>, names: &[String]) -> CompileResult<()> {
        for name in names {
            let sym = self.resolve_ident(span, module, name)?;
            let scope = self.scope;
            self.st
                .scopes
                .insert_alias(scope, name, sym)
                .map_err(|msg| self.err(span, msg))?;
        }
        Ok(())
    }

    // ==================================================================
    // Emission.
    // ==================================================================

    fn emit_statement(&mut self, s: &Stmt) -> CompileResult<()> {
        self.b().set_location(s.span);
        match &s.kind {
            StmtKind::Null | StmtKind::OperatorDef { .. } | StmtKind::MacroDef { .. } | StmtKind::FunMacroDef { .. } => {
                Ok(())
            }
            StmtKind::Halt => {
                self.b().emit(Opcode::Nil);
                self.b().emit(Opcode::Halt);
                Ok(())
            }
            StmtKind::Expression(e) => {
                self.emit_expression(e)?;
                self.b().emit(Opcode::Pop);
                Ok(())
            }
            StmtKind::Definition { target, value, .. } => {
                self.emit_expression(value)?;
                self.emit_assignment(target)?;
                self.b().emit(Opcode::Pop);
                Ok(())
            }
            StmtKind::FunctionDef { f, .. } => {
                let ExprKind::Function(fx) = &f.kind else {
                    return Err(self.err(f.span, "malformed function definition"));
                };
                self.emit_function(fx, f.span)?;
                let sym = fx.self_sym.expect("function definition symbolized");
                let access = self.access_of(sym);
                self.emit_target_access(access);
                self.b().emit(Opcode::Assign);
                self.b().emit(Opcode::Pop);
                Ok(())
            }
            StmtKind::TagDef(c) => self.emit_tag_def(c),
            StmtKind::ClassDef(c) => self.emit_class_def(c),
            StmtKind::TypeDef { .. } => Ok(()),
            StmtKind::For { init, cond, next, body } => self.emit_for(init, cond.as_ref(), next.as_ref(), body),
            StmtKind::Each {
                target,
                iter,
                cond,
                stop,
                body,
            } => self.emit_each(target, iter, cond.as_ref(), stop.as_ref(), body),
            StmtKind::While { parts, body } => self.emit_while(parts, body),
            StmtKind::WhileMatch { subject, pattern, body } => self.emit_while_match(subject, pattern, body),
            StmtKind::If {
                parts,
                neg,
                then,
                otherwise,
            } => self.emit_if(parts, *neg, then, otherwise.as_deref(), false),
            StmtKind::Match { subject, cases } => self.emit_match_statement(subject, cases, false),
            StmtKind::Return(es) | StmtKind::GeneratorReturn(es) => {
                if self.fns.len() == 1 {
                    return Err(self.err(s.span, "invalid 'return' statement (not inside of a function)"));
                }
                match es.len() {
                    0 => self.b().emit(Opcode::Nil),
                    1 => self.emit_expression(&es[0])?,
                    _ => {
                        for e in es {
                            self.emit_expression(e)?;
                        }
                        let n = u32::try_from(es.len()).expect("return arity fits u32");
                        self.b().emit_u32_u32(Opcode::Tuple, n, FROM_MARK);
                    }
                }
                self.b().emit(Opcode::Return);
                Ok(())
            }
            StmtKind::Next | StmtKind::Continue => {
                if self.ctx().loops.is_empty() {
                    return Err(self.err(s.span, "'continue' outside of a loop"));
                }
                let site = self.b().emit_jump(Opcode::Jump);
                self.ctx()
                    .loops
                    .last_mut()
                    .expect("loop context checked above")
                    .continues
                    .push(site);
                Ok(())
            }
            StmtKind::Break { depth } => self.emit_break(s.span, *depth as usize),
            StmtKind::Try { body, catches, finally } => self.emit_try(body, catches, finally.as_deref()),
            StmtKind::Defer(e) => {
                self.emit_expression(e)?;
                self.b().emit_u8(Opcode::Defer, 0);
                Ok(())
            }
            StmtKind::Cleanup(e) => {
                self.emit_expression(e)?;
                self.b().emit_u8(Opcode::Defer, 1);
                Ok(())
            }
            StmtKind::Drop(es) => {
                let drop_name = self.intern("drop");
                for e in es {
                    self.emit_expression(e)?;
                    self.b().emit_u32_u32(Opcode::CallMethod, drop_name.index() as u32, 0);
                    self.b().emit(Opcode::Pop);
                }
                Ok(())
            }
            StmtKind::Block(ss) | StmtKind::Multi(ss) | StmtKind::NamespaceDef { body: ss, .. } => {
                for s in ss {
                    self.emit_statement(s)?;
                }
                Ok(())
            }
            StmtKind::Import { .. } | StmtKind::Export(_) | StmtKind::Use { .. } | StmtKind::SetType { .. } => Ok(()),
        }
    }

    /// Emits a statement in value position: its result is on the stack.
    fn emit_statement_expr(&mut self, s: &Stmt) -> CompileResult<()> {
        match &s.kind {
            StmtKind::Expression(e) => self.emit_expression(e),
            StmtKind::Block(ss) => {
                match ss.split_last() {
                    None => self.b().emit(Opcode::Nil),
                    Some((last, init)) => {
                        for s in init {
                            self.emit_statement(s)?;
                        }
                        self.emit_statement_expr(last)?;
                    }
                }
                Ok(())
            }
            StmtKind::If {
                parts,
                neg,
                then,
                otherwise,
            } => self.emit_if(parts, *neg, then, otherwise.as_deref(), true),
            StmtKind::Match { subject, cases } => self.emit_match_statement(subject, cases, true),
            _ => {
                self.emit_statement(s)?;
                self.b().emit(Opcode::Nil);
                Ok(())
            }
        }
    }

    fn emit_break(&mut self, span: Span, depth: usize) -> CompileResult<()> {
        let nloops = self.ctx().loops.len();
        if depth == 0 || depth > nloops {
            return Err(self.err(span, "'break' outside of a loop (or depth too large)"));
        }
        // Unwind protected regions entered inside the loops being exited.
        let target_loop = nloops - depth;
        let try_floor = self.ctx().loops[target_loop].try_depth;
        let pending: Vec<Option<Stmt>> = self.ctx().trys[try_floor..].iter().map(|t| t.finally.clone()).collect();
        for finally in pending.iter().rev() {
            self.b().emit(Opcode::PopTry);
            if let Some(f) = finally {
                self.emit_statement(f)?;
            }
        }
        // Pop iterator values of every loop being exited.
        let iters: u32 = self.ctx().loops[target_loop..].iter().map(|l| l.iter_depth).sum();
        for _ in 0..iters {
            self.b().emit(Opcode::Pop);
        }
        let site = self.b().emit_jump(Opcode::Jump);
        self.ctx().loops[target_loop].breaks.push(site);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Loops.
    // ------------------------------------------------------------------

    fn begin_loop(&mut self, iter_depth: u32) {
        let try_depth = self.ctx().trys.len();
        self.ctx().loops.push(LoopCtx {
            breaks: Vec::new(),
            continues: Vec::new(),
            iter_depth,
            try_depth,
        });
    }

    /// Ends a loop: patches continues to `continue_target` and breaks to the
    /// current offset.
    fn end_loop(&mut self, continue_target: usize) {
        let ctx = self.ctx();
        let lp = ctx.loops.pop().expect("loop context pushed");
        for site in lp.continues {
            ctx.builder.patch_jump_to(site, continue_target);
        }
        for site in lp.breaks {
            ctx.builder.patch_jump(site);
        }
    }

    fn emit_for(&mut self, init: &Stmt, cond: Option<&Expr>, next: Option<&Expr>, body: &Stmt) -> CompileResult<()> {
        self.emit_statement(init)?;
        self.begin_loop(0);

        let begin = self.b().offset();
        let skip_next = self.b().emit_jump(Opcode::Jump);
        let next_target = self.b().offset();
        if let Some(n) = next {
            self.emit_expression(n)?;
            self.b().emit(Opcode::Pop);
        }
        self.b().patch_jump(skip_next);

        let end = if let Some(c) = cond {
            self.emit_expression(c)?;
            Some(self.b().emit_jump(Opcode::JumpIfNot))
        } else {
            None
        };

        self.emit_statement(body)?;
        self.b().emit_jump_back(Opcode::Jump, next_target);

        if let Some(site) = end {
            self.b().patch_jump(site);
        }
        self.end_loop(next_target);
        // The first iteration skips `next`; continues jump to it.
        let _ = begin;
        Ok(())
    }

    fn emit_each(
        &mut self,
        target: &Expr,
        iter: &Expr,
        cond: Option<&Expr>,
        stop: Option<&Expr>,
        body: &Stmt,
    ) -> CompileResult<()> {
        self.emit_expression(iter)?;
        self.b().emit(Opcode::GetIter);
        self.begin_loop(1);

        let begin = self.b().offset();
        self.b().emit(Opcode::IterNext);
        let done = self.b().emit_jump(Opcode::JumpIfNone);

        // Bind the element.
        self.emit_assignment(target)?;
        self.b().emit(Opcode::Pop);

        // `while stop` bound: leave the loop when the bound fails.
        let stop_site = if let Some(st) = stop {
            self.emit_expression(st)?;
            Some(self.b().emit_jump(Opcode::JumpIfNot))
        } else {
            None
        };

        // `if cond` filter: skip the body.
        if let Some(c) = cond {
            self.emit_expression(c)?;
            let skip = self.b().emit_jump(Opcode::JumpIfNot);
            self.emit_statement(body)?;
            self.b().patch_jump(skip);
        } else {
            self.emit_statement(body)?;
        }
        self.b().emit_jump_back(Opcode::Jump, begin);

        self.b().patch_jump(done);
        if let Some(site) = stop_site {
            self.b().patch_jump(site);
        }
        self.b().emit(Opcode::Pop);
        let after = self.b().offset();
        self.end_loop(begin);
        let _ = after;
        Ok(())
    }

    fn emit_while(&mut self, parts: &[CondPart], body: &Stmt) -> CompileResult<()> {
        self.begin_loop(0);
        let begin = self.b().offset();
        let mut ends = Vec::new();

        for p in parts {
            match &p.target {
                None => {
                    self.emit_expression(&p.expr)?;
                    ends.push(self.b().emit_jump(Opcode::JumpIfNot));
                }
                Some(pattern) => {
                    self.emit_expression(&p.expr)?;
                    self.b().emit(Opcode::SaveStackPos);
                    self.ctx().match_fails.push(Vec::new());
                    self.emit_try_match(pattern)?;
                    let fails = self.ctx().match_fails.pop().expect("fail frame pushed");
                    self.b().emit(Opcode::RestoreStackPos);
                    self.b().emit(Opcode::Pop);
                    let ok = self.b().emit_jump(Opcode::Jump);
                    for site in fails {
                        self.b().patch_jump(site);
                    }
                    self.b().emit(Opcode::RestoreStackPos);
                    self.b().emit(Opcode::Pop);
                    ends.push(self.b().emit_jump(Opcode::Jump));
                    self.b().patch_jump(ok);
                }
            }
        }

        self.emit_statement(body)?;
        self.b().emit_jump_back(Opcode::Jump, begin);
        for site in ends {
            self.b().patch_jump(site);
        }
        self.end_loop(begin);
        Ok(())
    }

    fn emit_while_match(&mut self, subject: &Expr, pattern: &Expr, body: &Stmt) -> CompileResult<()> {
        self.begin_loop(0);
        let begin = self.b().offset();

        self.emit_expression(subject)?;
        self.b().emit(Opcode::SaveStackPos);
        self.ctx().match_fails.push(Vec::new());
        self.emit_try_match(pattern)?;
        let fails = self.ctx().match_fails.pop().expect("fail frame pushed");
        self.b().emit(Opcode::RestoreStackPos);
        self.b().emit(Opcode::Pop);
        self.emit_statement(body)?;
        self.b().emit_jump_back(Opcode::Jump, begin);

        for site in fails {
            self.b().patch_jump(site);
        }
        self.b().emit(Opcode::RestoreStackPos);
        self.b().emit(Opcode::Pop);
        self.end_loop(begin);
        Ok(())
    }

    fn emit_if(
        &mut self,
        parts: &[CondPart],
        neg: bool,
        then: &Stmt,
        otherwise: Option<&Stmt>,
        value: bool,
    ) -> CompileResult<()> {
        let mut to_else = Vec::new();

        for p in parts {
            match &p.target {
                None => {
                    self.emit_expression(&p.expr)?;
                    let op = if neg { Opcode::JumpIf } else { Opcode::JumpIfNot };
                    to_else.push(self.b().emit_jump(op));
                }
                Some(pattern) => {
                    self.emit_expression(&p.expr)?;
                    self.b().emit(Opcode::SaveStackPos);
                    self.ctx().match_fails.push(Vec::new());
                    self.emit_try_match(pattern)?;
                    let fails = self.ctx().match_fails.pop().expect("fail frame pushed");
                    self.b().emit(Opcode::RestoreStackPos);
                    self.b().emit(Opcode::Pop);
                    let ok = self.b().emit_jump(Opcode::Jump);
                    for site in fails {
                        self.b().patch_jump(site);
                    }
                    self.b().emit(Opcode::RestoreStackPos);
                    self.b().emit(Opcode::Pop);
                    to_else.push(self.b().emit_jump(Opcode::Jump));
                    self.b().patch_jump(ok);
                }
            }
        }

        if value {
            self.emit_statement_expr(then)?;
        } else {
            self.emit_statement(then)?;
        }
        let done = self.b().emit_jump(Opcode::Jump);
        for site in to_else {
            self.b().patch_jump(site);
        }
        match otherwise {
            Some(o) if value => self.emit_statement_expr(o)?,
            Some(o) => self.emit_statement(o)?,
            None if value => self.b().emit(Opcode::Nil),
            None => {}
        }
        self.b().patch_jump(done);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Match.
    // ------------------------------------------------------------------

    fn emit_match_statement(&mut self, subject: &Expr, cases: &[MatchCase], value: bool) -> CompileResult<()> {
        self.ctx().match_successes.push(Vec::new());
        self.emit_expression(subject)?;

        for case in cases {
            self.emit_case(case, value)?;
        }

        self.b().emit(Opcode::BadMatch);
        let successes = self.ctx().match_successes.pop().expect("success frame pushed");
        for site in successes {
            self.b().patch_jump(site);
        }
        if !value {
            self.b().emit(Opcode::Pop);
        }
        Ok(())
    }

    fn emit_case(&mut self, case: &MatchCase, value: bool) -> CompileResult<()> {
        self.b().set_location(case.pattern.span);
        self.b().emit(Opcode::SaveStackPos);
        self.ctx().match_fails.push(Vec::new());
        self.emit_try_match(&case.pattern)?;

        if let Some(guard) = &case.guard {
            self.emit_expression(guard)?;
            let site = self.b().emit_jump(Opcode::JumpIfNot);
            self.push_fail(site);
        }

        self.b().emit(Opcode::RestoreStackPos);
        if value {
            // Pop the subject before producing the arm's value.
            self.b().emit(Opcode::Pop);
            self.emit_statement_expr(&case.body)?;
        } else {
            self.emit_statement(&case.body)?;
        }
        let success = self.b().emit_jump(Opcode::Jump);
        self.ctx()
            .match_successes
            .last_mut()
            .expect("success frame active")
            .push(success);

        let fails = self.ctx().match_fails.pop().expect("fail frame pushed");
        for site in fails {
            self.b().patch_jump(site);
        }
        self.b().emit(Opcode::RestoreStackPos);
        Ok(())
    }

    /// Emits a try-match sequence against the subject on top of the stack.
    /// On failure, jumps registered in the current fail frame fire with the
    /// stack still dirty; the surrounding case emits the restore.
    fn emit_try_match(&mut self, pattern: &Expr) -> CompileResult<()> {
        self.b().set_location(pattern.span);
        match &pattern.kind {
            // `_` matches anything, even nil. Ordinary identifiers do not
            // match nil.
            ExprKind::MatchAny => Ok(()),
            ExprKind::Ident { sym: Some(sym), .. } if self.st.scopes.symbol(*sym).tag.is_some() => {
                // A bare tag name matches a bare tag value.
                let tag = self.st.scopes.symbol(*sym).tag.expect("tag symbol");
                self.b().emit(Opcode::Dup);
                self.b().emit_u32(Opcode::TagVal, tag);
                self.b().emit(Opcode::Eq);
                let site = self.b().emit_jump(Opcode::JumpIfNot);
                self.push_fail(site);
                Ok(())
            }
            ExprKind::Ident { .. } | ExprKind::MatchNotNil { .. } => {
                let sym = self.sym_of(pattern)?;
                let access = self.access_of(sym);
                let (kind, idx) = Self::access_kind(access);
                self.b().emit(Opcode::TryAssignNonNil);
                self.b().push_access(kind, idx);
                let site = self.b().jump_placeholder();
                self.push_fail(site);
                Ok(())
            }
            ExprKind::ResourceBinding { .. } => {
                let sym = self.sym_of(pattern)?;
                let access = self.access_of(sym);
                let (kind, idx) = Self::access_kind(access);
                self.b().emit(Opcode::TryAssignNonNil);
                self.b().push_access(kind, idx);
                let site = self.b().jump_placeholder();
                self.push_fail(site);
                self.b().emit(Opcode::DeferDrop);
                self.b().push_access(kind, idx);
                Ok(())
            }
            ExprKind::View { f, pat } => {
                // [subj] -> [subj, f(subj)]; match the view result.
                self.b().emit(Opcode::Dup);
                self.emit_expression(f)?;
                self.b().emit_u32(Opcode::Call, 1);
                self.emit_try_match(pat)?;
                self.b().emit(Opcode::Pop);
                Ok(())
            }
            ExprKind::NotNilView { f, pat } => {
                self.b().emit(Opcode::Dup);
                self.emit_expression(f)?;
                self.b().emit_u32(Opcode::Call, 1);
                self.b().emit(Opcode::Dup);
                let site = self.b().emit_jump(Opcode::JumpIfNil);
                self.push_fail(site);
                self.emit_try_match(pat)?;
                self.b().emit(Opcode::Pop);
                Ok(())
            }
            ExprKind::Array { elems, .. } => {
                let mut has_rest = false;
                for (i, el) in elems.iter().enumerate() {
                    let idx = u32::try_from(i).expect("pattern length fits u32");
                    if let ExprKind::MatchRest { .. } = &el.kind {
                        if i + 1 != elems.len() {
                            return Err(self.err(el.span, "the *rest pattern must be last in an array pattern"));
                        }
                        has_rest = true;
                        let sym = self.sym_of(el)?;
                        let access = self.access_of(sym);
                        let (kind, aidx) = Self::access_kind(access);
                        self.b().emit(Opcode::ArrayRest);
                        self.b().push_access(kind, aidx);
                        self.b().push_u32(idx);
                        let site = self.b().jump_placeholder();
                        self.push_fail(site);
                    } else {
                        self.b().emit_u32(Opcode::TryIndex, idx);
                        let site = self.b().jump_placeholder();
                        self.push_fail(site);
                        self.emit_try_match(el)?;
                        self.b().emit(Opcode::Pop);
                    }
                }
                if !has_rest {
                    let n = u32::try_from(elems.len()).expect("pattern length fits u32");
                    self.b().emit_u32(Opcode::EnsureLen, n);
                    let site = self.b().jump_placeholder();
                    self.push_fail(site);
                }
                Ok(())
            }
            ExprKind::Tuple { items, .. } => {
                for (i, item) in items.iter().enumerate() {
                    let idx = u32::try_from(i).expect("pattern length fits u32");
                    self.b().emit_u32(Opcode::TryIndex, idx);
                    let site = self.b().jump_placeholder();
                    self.push_fail(site);
                    self.emit_try_match(item)?;
                    self.b().emit(Opcode::Pop);
                }
                let n = u32::try_from(items.len()).expect("pattern length fits u32");
                self.b().emit_u32(Opcode::EnsureLen, n);
                let site = self.b().jump_placeholder();
                self.push_fail(site);
                Ok(())
            }
            ExprKind::Dict { keys, values, .. } => {
                for (k, v) in keys.iter().zip(values.iter()) {
                    self.emit_expression(k)?;
                    self.b().emit(Opcode::TryKey);
                    let site = self.b().jump_placeholder();
                    self.push_fail(site);
                    self.emit_try_match(v)?;
                    self.b().emit(Opcode::Pop);
                }
                Ok(())
            }
            ExprKind::TagPattern { tag, inner } => {
                let tag_id = self.tag_of(tag)?;
                self.b().emit(Opcode::Dup);
                self.b().emit_u32(Opcode::TryTagPop, tag_id.0);
                let site = self.b().jump_placeholder();
                self.push_fail(site);
                self.emit_try_match(inner)?;
                self.b().emit(Opcode::Pop);
                Ok(())
            }
            ExprKind::Alias { pattern: inner, .. } => {
                let sym = self.sym_of(pattern)?;
                let access = self.access_of(sym);
                let (kind, idx) = Self::access_kind(access);
                self.b().emit(Opcode::TryAssignNonNil);
                self.b().push_access(kind, idx);
                let site = self.b().jump_placeholder();
                self.push_fail(site);
                self.emit_try_match(inner)
            }
            ExprKind::Choice(alts) => {
                let mut done = Vec::new();
                for (i, alt) in alts.iter().enumerate() {
                    let last = i + 1 == alts.len();
                    if last {
                        self.emit_try_match(alt)?;
                    } else {
                        self.b().emit(Opcode::SaveStackPos);
                        self.ctx().match_fails.push(Vec::new());
                        self.emit_try_match(alt)?;
                        let fails = self.ctx().match_fails.pop().expect("fail frame pushed");
                        self.b().emit(Opcode::RestoreStackPos);
                        done.push(self.b().emit_jump(Opcode::Jump));
                        for site in fails {
                            self.b().patch_jump(site);
                        }
                        self.b().emit(Opcode::RestoreStackPos);
                    }
                }
                for site in done {
                    self.b().patch_jump(site);
                }
                Ok(())
            }
            ExprKind::Regex { tok, binds } => {
                let spec = self.regex_spec(tok, binds)?;
                self.b().emit_u32(Opcode::TryRegex, spec);
                let site = self.b().jump_placeholder();
                self.push_fail(site);
                Ok(())
            }
            // Anything else: evaluate and compare structurally.
            _ => {
                self.b().emit(Opcode::Dup);
                self.emit_expression(pattern)?;
                self.b().emit(Opcode::Eq);
                let site = self.b().emit_jump(Opcode::JumpIfNot);
                self.push_fail(site);
                Ok(())
            }
        }
    }

    fn tag_of(&mut self, tag: &Expr) -> CompileResult<TagId> {
        if let ExprKind::Ident { sym: Some(sym), .. } = &tag.kind
            && let Some(t) = self.st.scopes.symbol(*sym).tag
        {
            return Ok(TagId(t));
        }
        Err(self.err(tag.span, "expected a tag in pattern"))
    }

    fn regex_spec(&mut self, tok: &RegexTok, binds: &[crate::ast::RegexBind]) -> CompileResult<u32> {
        let rid = self.world.program.add_regex(tok.re.clone(), tok.pattern.clone());
        let mut specs = Vec::new();
        for b in binds {
            let sym = b.sym.ok_or_else(|| self.err(Span::default(), "unresolved regex bind"))?;
            let access = self.access_of(sym);
            let (kind, index) = Self::access_kind(access);
            specs.push(RegexBindSpec {
                group: b.group,
                kind,
                index,
            });
        }
        let id = u32::try_from(self.world.program.match_specs.len()).expect("match spec count fits u32");
        self.world.program.match_specs.push(RegexMatchSpec { regex: rid, binds: specs });
        Ok(id)
    }

    // ------------------------------------------------------------------
    // Assignment.
    // ------------------------------------------------------------------

    /// Emits the assignment of the value on top of the stack to `target`,
    /// leaving the value on the stack.
    fn emit_assignment(&mut self, target: &Expr) -> CompileResult<()> {
        match &target.kind {
            ExprKind::MatchAny => Ok(()),
            ExprKind::Ident { .. } | ExprKind::MatchNotNil { .. } => {
                let sym = self.sym_of(target)?;
                let access = self.access_of(sym);
                self.emit_target_access(access);
                self.b().emit(Opcode::Assign);
                Ok(())
            }
            ExprKind::ResourceBinding { .. } => {
                let sym = self.sym_of(target)?;
                let access = self.access_of(sym);
                let (kind, idx) = Self::access_kind(access);
                self.emit_target_access(access);
                self.b().emit(Opcode::Assign);
                self.b().emit(Opcode::DeferDrop);
                self.b().push_access(kind, idx);
                Ok(())
            }
            ExprKind::Member { object, member, .. } => {
                let name = self.intern(member);
                self.emit_expression(object)?;
                self.b().emit_u32(Opcode::TargetMember, name.index() as u32);
                self.b().emit(Opcode::Assign);
                Ok(())
            }
            ExprKind::Subscript { container, index } => {
                self.emit_expression(container)?;
                self.emit_expression(index)?;
                self.b().emit(Opcode::TargetSubscript);
                self.b().emit(Opcode::Assign);
                Ok(())
            }
            ExprKind::TagPattern { tag, inner } => {
                let tag_id = self.tag_of(tag)?;
                self.b().emit_u32(Opcode::UntagOrDie, tag_id.0);
                self.emit_assignment(inner)
            }
            ExprKind::Call { callee, args } if args.len() == 1 => {
                // `Tag(x) = v` via the call shape.
                let tag_id = self.tag_of(callee)?;
                self.b().emit_u32(Opcode::UntagOrDie, tag_id.0);
                self.emit_assignment(&args[0].value)
            }
            ExprKind::Array { elems, .. } | ExprKind::Tuple { items: elems, .. } => {
                self.emit_destructure(elems, target.span)
            }
            ExprKind::Dict { keys, values, .. } => {
                let tmp = self.tmp_slot(target.span);
                self.stash_in_tmp(tmp);
                for (k, v) in keys.iter().zip(values.iter()) {
                    self.emit_tmp_load(tmp);
                    self.emit_expression(k)?;
                    self.b().emit(Opcode::Subscript);
                    self.emit_assignment(v)?;
                    self.b().emit(Opcode::Pop);
                }
                self.unstash_tmp(tmp);
                Ok(())
            }
            ExprKind::Alias { pattern, .. } => {
                let sym = self.sym_of(target)?;
                let access = self.access_of(sym);
                self.emit_target_access(access);
                self.b().emit(Opcode::Assign);
                self.emit_assignment(pattern)
            }
            ExprKind::Cast { e, .. } => self.emit_assignment(e),
            _ => Err(self.err(target.span, "invalid assignment target")),
        }
    }

    /// Array/tuple destructuring through a temporary slot. The temporary's
    /// previous contents are saved and restored so nested destructures can
    /// recurse through the same frame.
    fn emit_destructure(&mut self, elems: &[Expr], span: Span) -> CompileResult<()> {
        let tmp = self.tmp_slot(span);
        self.stash_in_tmp(tmp);
        for (j, el) in elems.iter().enumerate() {
            let idx = i64::try_from(j).expect("element index fits i64");
            if let ExprKind::MatchRest { .. } = &el.kind {
                if j + 1 != elems.len() {
                    return Err(self.err(el.span, "the *rest target must be last"));
                }
                self.emit_tmp_load(tmp);
                self.b().emit_i64(Opcode::Int, idx);
                self.b().emit(Opcode::Nil);
                self.b().emit(Opcode::Nil);
                self.b().emit(Opcode::Slice);
                let sym = self.sym_of(el)?;
                let access = self.access_of(sym);
                self.emit_target_access(access);
                self.b().emit(Opcode::Assign);
                self.b().emit(Opcode::Pop);
            } else {
                self.emit_tmp_load(tmp);
                self.b().emit_i64(Opcode::Int, idx);
                self.b().emit(Opcode::Subscript);
                self.emit_assignment(el)?;
                self.b().emit(Opcode::Pop);
            }
        }
        self.unstash_tmp(tmp);
        Ok(())
    }

    /// `[value]` -> `[old]`: saves the old contents of `tmp` and stores the
    /// value in it. Pair with [`Compiler::unstash_tmp`].
    fn stash_in_tmp(&mut self, tmp: Access) {
        self.emit_tmp_save(tmp);
        self.b().emit(Opcode::Swap);
        self.emit_tmp_store(tmp);
    }

    /// `[old]` -> `[value]`: pushes the stashed value back and restores the
    /// temporary.
    fn unstash_tmp(&mut self, tmp: Access) {
        self.emit_tmp_load(tmp);
        self.b().emit(Opcode::Swap);
        self.emit_tmp_store(tmp);
    }

    // ------------------------------------------------------------------
    // Expressions.
    // ------------------------------------------------------------------

    fn emit_expression(&mut self, e: &Expr) -> CompileResult<()> {
        self.b().set_location(e.span);
        match &e.kind {
            ExprKind::Nil => {
                self.b().emit(Opcode::Nil);
                Ok(())
            }
            ExprKind::Boolean(true) => {
                self.b().emit(Opcode::True);
                Ok(())
            }
            ExprKind::Boolean(false) => {
                self.b().emit(Opcode::False);
                Ok(())
            }
            ExprKind::Integer(k) => {
                self.b().emit_i64(Opcode::Int, *k);
                Ok(())
            }
            ExprKind::Real(x) => {
                self.b().emit_f64(Opcode::Real, *x);
                Ok(())
            }
            ExprKind::Str(s) => {
                let id = self.intern(s);
                self.b().emit_u32(Opcode::Str, id.index() as u32);
                Ok(())
            }
            ExprKind::Special(parts) => self.emit_special(parts),
            ExprKind::Regex { tok, .. } => {
                let rid = self.world.program.add_regex(tok.re.clone(), tok.pattern.clone());
                self.b().emit_u32(Opcode::Regex, rid.0);
                Ok(())
            }
            ExprKind::Ident { sym: Some(sym), .. } => {
                let symbol = self.st.scopes.symbol(*sym);
                if let Some(tag) = symbol.tag {
                    self.b().emit_u32(Opcode::TagVal, tag);
                    return Ok(());
                }
                if let Some(class) = symbol.class {
                    self.b().emit_u32(Opcode::ClassVal, class);
                    return Ok(());
                }
                let access = self.access_of(*sym);
                self.emit_load_access(access);
                Ok(())
            }
            ExprKind::Ident { name, .. } => Err(self.err(e.span, format!("unresolved identifier '{name}'"))),
            ExprKind::Self_ => {
                let sym = self
                    .st
                    .scopes
                    .lookup(self.scope, "self")
                    .ok_or_else(|| self.err(e.span, "'self' outside of a method"))?;
                let access = self.access_of(sym);
                self.emit_load_access(access);
                Ok(())
            }
            ExprKind::Super => Err(self.err(e.span, "'super' can only be used for method calls")),
            ExprKind::Array { elems, conds } => self.emit_array(elems, conds),
            ExprKind::Dict {
                keys,
                values,
                conds,
                dflt,
            } => self.emit_dict(keys, values, conds, dflt.as_deref()),
            ExprKind::Tuple {
                items,
                names,
                conds,
                ..
            } => self.emit_tuple(items, names, conds),
            ExprKind::ArrayCompr { elem, pattern, iter, cond } => {
                self.emit_comprehension(iter, pattern, cond.as_deref(), |c| c.emit_expression(elem), Opcode::Array)
            }
            ExprKind::DictCompr {
                key,
                value,
                pattern,
                iter,
                cond,
            } => self.emit_comprehension(
                iter,
                pattern,
                cond.as_deref(),
                |c| {
                    c.emit_expression(key)?;
                    c.emit_expression(value)
                },
                Opcode::Dict,
            ),
            ExprKind::Binary { op, lhs, rhs } => {
                self.emit_expression(lhs)?;
                self.emit_expression(rhs)?;
                self.b().emit(bin_opcode(*op));
                Ok(())
            }
            ExprKind::Logic { op, lhs, rhs } => {
                self.emit_expression(lhs)?;
                self.b().emit(Opcode::Dup);
                let short = match op {
                    LogicOp::And => self.b().emit_jump(Opcode::JumpIfNot),
                    LogicOp::Or => self.b().emit_jump(Opcode::JumpIf),
                };
                self.b().emit(Opcode::Pop);
                self.emit_expression(rhs)?;
                self.b().patch_jump(short);
                Ok(())
            }
            ExprKind::Unary { op, operand } => {
                self.emit_expression(operand)?;
                match op {
                    UnOp::Neg => self.b().emit(Opcode::Neg),
                    UnOp::Not => self.b().emit(Opcode::Not),
                    UnOp::Count => self.b().emit(Opcode::Len),
                }
                Ok(())
            }
            ExprKind::IncDec { op, target } => self.emit_inc_dec(*op, target),
            ExprKind::Coalesce { lhs, rhs } => {
                self.emit_expression(lhs)?;
                self.b().emit(Opcode::Dup);
                let use_rhs = self.b().emit_jump(Opcode::JumpIfNil);
                let done = self.b().emit_jump(Opcode::Jump);
                self.b().patch_jump(use_rhs);
                self.b().emit(Opcode::Pop);
                self.emit_expression(rhs)?;
                self.b().patch_jump(done);
                Ok(())
            }
            ExprKind::Elvis { lhs, rhs } => {
                self.emit_expression(lhs)?;
                self.b().emit(Opcode::Dup);
                let use_rhs = self.b().emit_jump(Opcode::JumpIfNot);
                let done = self.b().emit_jump(Opcode::Jump);
                self.b().patch_jump(use_rhs);
                self.b().emit(Opcode::Pop);
                self.emit_expression(rhs)?;
                self.b().patch_jump(done);
                Ok(())
            }
            ExprKind::Conditional { cond, then, otherwise } => {
                self.emit_expression(cond)?;
                let alt = self.b().emit_jump(Opcode::JumpIfNot);
                self.emit_expression(then)?;
                let done = self.b().emit_jump(Opcode::Jump);
                self.b().patch_jump(alt);
                self.emit_expression(otherwise)?;
                self.b().patch_jump(done);
                Ok(())
            }
            ExprKind::Assign { target, value } => {
                self.emit_expression(value)?;
                self.emit_assignment(target)
            }
            ExprKind::MaybeAssign { target, value } => {
                // Assign only when the target is currently nil.
                self.emit_load_of_target(target)?;
                let do_assign = self.b().emit_jump(Opcode::JumpIfNil);
                self.emit_load_of_target(target)?;
                let done = self.b().emit_jump(Opcode::Jump);
                self.b().patch_jump(do_assign);
                self.emit_expression(value)?;
                self.emit_assignment(target)?;
                self.b().patch_jump(done);
                Ok(())
            }
            ExprKind::CompoundAssign { op, target, value } => {
                let mutate = mut_opcode(*op).ok_or_else(|| self.err(e.span, "invalid compound assignment"))?;
                self.emit_expression(value)?;
                self.emit_target_of(target)?;
                self.b().emit(mutate);
                Ok(())
            }
            ExprKind::Range { lo, hi, inclusive } => {
                self.emit_expression(lo)?;
                self.emit_expression(hi)?;
                self.b().emit_u8(Opcode::RangeNew, u8::from(*inclusive));
                Ok(())
            }
            ExprKind::In {
                item,
                collection,
                negated,
            } => {
                self.emit_expression(item)?;
                self.emit_expression(collection)?;
                self.b().emit_u8(Opcode::Contains, u8::from(*negated));
                Ok(())
            }
            ExprKind::CheckMatch { subject, pattern } => self.emit_check_match(subject, pattern),
            ExprKind::UserOp { sym, lhs, rhs, .. } => {
                self.emit_expression(lhs)?;
                self.emit_expression(rhs)?;
                let sym = sym.ok_or_else(|| self.err(e.span, "unresolved operator"))?;
                let access = self.access_of(sym);
                self.emit_load_access(access);
                self.b().emit_u32(Opcode::Call, 2);
                Ok(())
            }
            ExprKind::Call { callee, args } => self.emit_call(callee, args),
            ExprKind::MethodCall {
                object,
                maybe,
                method,
                args,
            } => self.emit_method_call(object, *maybe, method, args),
            ExprKind::Member { object, member, maybe } => {
                self.emit_expression(object)?;
                let name = self.intern(member);
                self.b().emit_u32_u8(Opcode::Member, name.index() as u32, u8::from(*maybe));
                Ok(())
            }
            ExprKind::DynMember { object, member } => {
                self.emit_expression(object)?;
                self.emit_expression(member)?;
                self.b().emit(Opcode::DynMember);
                Ok(())
            }
            ExprKind::Subscript { container, index } => {
                self.emit_expression(container)?;
                self.emit_expression(index)?;
                self.b().emit(Opcode::Subscript);
                Ok(())
            }
            ExprKind::Slice { e: subject, i, j, k } => {
                self.emit_expression(subject)?;
                for part in [i, j, k] {
                    match part {
                        Some(p) => self.emit_expression(p)?,
                        None => self.b().emit(Opcode::Nil),
                    }
                }
                self.b().emit(Opcode::Slice);
                Ok(())
            }
            ExprKind::Function(f) => self.emit_function(f, e.span),
            ExprKind::Match { subject, arms } => {
                let cases: Vec<MatchCase> = arms
                    .iter()
                    .map(|a| MatchCase {
                        pattern: a.pattern.clone(),
                        guard: a.guard.clone(),
                        body: Stmt::new(a.body.span, StmtKind::Expression(a.body.clone())),
                    })
                    .collect();
                self.emit_match_statement(subject, &cases, true)
            }
            ExprKind::Template { body, holes } => {
                for h in holes {
                    self.emit_expression(h)?;
                }
                let id = u32::try_from(self.world.program.templates.len()).expect("template count fits u32");
                self.world.program.templates.push((**body).clone());
                let n = u32::try_from(holes.len()).expect("hole count fits u32");
                self.b().emit_u32_u32(Opcode::Render, id, n);
                Ok(())
            }
            ExprKind::TemplateHole(_)
            | ExprKind::TemplateVHole(_)
            | ExprKind::TemplateTHole(_)
            | ExprKind::TemplateXHole(_) => Err(self.err(e.span, "template hole outside of a template")),
            ExprKind::MacroInvocation { name, .. } => {
                Err(self.err(e.span, format!("macro '{name}' used outside of expansion")))
            }
            ExprKind::Eval(operand) => {
                self.emit_expression(operand)?;
                self.b().emit(Opcode::Eval);
                Ok(())
            }
            ExprKind::Defined { module, name } => {
                let defined = self.resolve_ident(e.span, module.as_deref(), name).is_ok();
                self.b().emit(if defined { Opcode::True } else { Opcode::False });
                Ok(())
            }
            ExprKind::TypeOf(operand) => {
                self.emit_expression(operand)?;
                self.b().emit(Opcode::TypeOf);
                Ok(())
            }
            ExprKind::Throw(operand) => {
                self.emit_expression(operand)?;
                self.b().emit(Opcode::Throw);
                // Throw never falls through; keep the stack shape for the
                // expression's consumers.
                self.b().emit(Opcode::Nil);
                Ok(())
            }
            ExprKind::Yield(value) => {
                if !self.ctx().is_generator {
                    return Err(self.err(e.span, "'yield' outside of a generator"));
                }
                match value {
                    Some(v) => self.emit_expression(v)?,
                    None => self.b().emit(Opcode::Nil),
                }
                self.b().emit(Opcode::Yield);
                Ok(())
            }
            ExprKind::With { defs, body } => self.emit_with(defs, body),
            ExprKind::Statement(s) => self.emit_statement_expr(s),
            ExprKind::Cast { e: inner, .. } => self.emit_expression(inner),
            ExprKind::ConstValue(v) => {
                // Compile-time values spliced by macros are kept alive as
                // world roots.
                let idx = self.world.add_const_root(*v);
                self.b().emit_u32(Opcode::ConstRoot, idx);
                Ok(())
            }
            ExprKind::Spread(_) => Err(self.err(e.span, "spread outside of a call or literal")),
            ExprKind::MatchAny
            | ExprKind::MatchNotNil { .. }
            | ExprKind::MatchRest { .. }
            | ExprKind::Choice(_)
            | ExprKind::List(_)
            | ExprKind::View { .. }
            | ExprKind::NotNilView { .. }
            | ExprKind::TagPattern { .. }
            | ExprKind::Alias { .. }
            | ExprKind::ResourceBinding { .. } => Err(self.err(e.span, "pattern used in expression position")),
        }
    }

    fn emit_special(&mut self, parts: &[SpecialPart]) -> CompileResult<()> {
        for part in parts {
            match part {
                SpecialPart::Lit(s) => {
                    let id = self.intern(s);
                    self.b().emit_u32(Opcode::Str, id.index() as u32);
                }
                SpecialPart::Interp { expr, fmt } => {
                    self.emit_expression(expr)?;
                    let fmt_id = match fmt {
                        Some(f) => self.intern(f).index() as u32,
                        None => FROM_MARK,
                    };
                    self.b().emit_u32(Opcode::ToString, fmt_id);
                }
            }
        }
        let n = u32::try_from(parts.len()).expect("fragment count fits u32");
        self.b().emit_u32(Opcode::ConcatStrings, n);
        Ok(())
    }

    fn emit_array(&mut self, elems: &[Expr], conds: &[Option<Expr>]) -> CompileResult<()> {
        let dynamic = conds.iter().any(Option::is_some) || elems.iter().any(|e| matches!(e.kind, ExprKind::Spread(_)));
        if !dynamic {
            for el in elems {
                self.emit_expression(el)?;
            }
            let n = u32::try_from(elems.len()).expect("array length fits u32");
            self.b().emit_u32(Opcode::Array, n);
            return Ok(());
        }

        self.b().emit(Opcode::SaveStackPos);
        for (el, cond) in elems.iter().zip(conds.iter()) {
            let skip = match cond {
                Some(c) => {
                    self.emit_expression(c)?;
                    Some(self.b().emit_jump(Opcode::JumpIfNot))
                }
                None => None,
            };
            match &el.kind {
                ExprKind::Spread(inner) => {
                    self.emit_expression(inner)?;
                    self.b().emit(Opcode::Splat);
                }
                _ => self.emit_expression(el)?,
            }
            if let Some(site) = skip {
                self.b().patch_jump(site);
            }
        }
        self.b().emit_u32(Opcode::Array, FROM_MARK);
        Ok(())
    }

    fn emit_dict(
        &mut self,
        keys: &[Expr],
        values: &[Expr],
        conds: &[Option<Expr>],
        dflt: Option<&Expr>,
    ) -> CompileResult<()> {
        let dynamic = conds.iter().any(Option::is_some);
        if dynamic {
            self.b().emit(Opcode::SaveStackPos);
        }
        for ((k, v), cond) in keys.iter().zip(values.iter()).zip(conds.iter()) {
            let skip = match cond {
                Some(c) => {
                    self.emit_expression(c)?;
                    Some(self.b().emit_jump(Opcode::JumpIfNot))
                }
                None => None,
            };
            self.emit_expression(k)?;
            self.emit_expression(v)?;
            if let Some(site) = skip {
                self.b().patch_jump(site);
            }
        }
        if dynamic {
            self.b().emit_u32(Opcode::Dict, FROM_MARK);
        } else {
            let n = u32::try_from(keys.len()).expect("dict size fits u32");
            self.b().emit_u32(Opcode::Dict, n);
        }
        if let Some(d) = dflt {
            self.emit_expression(d)?;
            self.b().emit(Opcode::DictDefault);
        }
        Ok(())
    }

    fn emit_tuple(&mut self, items: &[Expr], names: &[Option<String>], conds: &[Option<Expr>]) -> CompileResult<()> {
        let shape = if names.iter().any(Option::is_some) {
            let ids: Vec<Option<StringId>> = names
                .iter()
                .map(|n| n.as_deref().map(|n| self.world.interns.intern(n)))
                .collect();
            let id = u32::try_from(self.world.program.tuple_shapes.len()).expect("shape count fits u32");
            self.world.program.tuple_shapes.push(ids);
            id
        } else {
            FROM_MARK
        };

        let dynamic = conds.iter().any(Option::is_some);
        if dynamic {
            self.b().emit(Opcode::SaveStackPos);
        }
        for (item, cond) in items.iter().zip(conds.iter()) {
            let skip = match cond {
                Some(c) => {
                    self.emit_expression(c)?;
                    Some(self.b().emit_jump(Opcode::JumpIfNot))
                }
                None => None,
            };
            self.emit_expression(item)?;
            if let Some(site) = skip {
                self.b().patch_jump(site);
            }
        }
        let n = if dynamic {
            FROM_MARK
        } else {
            u32::try_from(items.len()).expect("tuple size fits u32")
        };
        self.b().emit_u32_u32(Opcode::Tuple, n, shape);
        Ok(())
    }

    fn emit_inc_dec(&mut self, op: IncDec, target: &Expr) -> CompileResult<()> {
        let add = matches!(op, IncDec::PreInc | IncDec::PostInc);
        let post = matches!(op, IncDec::PostInc | IncDec::PostDec);
        if post {
            self.emit_load_of_target(target)?;
        }
        self.b().emit_i64(Opcode::Int, 1);
        self.emit_target_of(target)?;
        self.b().emit(if add { Opcode::MutAdd } else { Opcode::MutSub });
        if post {
            self.b().emit(Opcode::Pop);
        }
        Ok(())
    }

    /// Pushes the current value of an assignable target.
    fn emit_load_of_target(&mut self, target: &Expr) -> CompileResult<()> {
        match &target.kind {
            ExprKind::Ident { .. } => {
                let sym = self.sym_of(target)?;
                let access = self.access_of(sym);
                self.emit_load_access(access);
                Ok(())
            }
            ExprKind::Member { .. } | ExprKind::Subscript { .. } => self.emit_expression(target),
            _ => Err(self.err(target.span, "invalid assignment target")),
        }
    }

    /// Pushes a target reference for an assignable target.
    fn emit_target_of(&mut self, target: &Expr) -> CompileResult<()> {
        match &target.kind {
            ExprKind::Ident { .. } => {
                let sym = self.sym_of(target)?;
                let access = self.access_of(sym);
                self.emit_target_access(access);
                Ok(())
            }
            ExprKind::Member { object, member, .. } => {
                let name = self.intern(member);
                self.emit_expression(object)?;
                self.b().emit_u32(Opcode::TargetMember, name.index() as u32);
                Ok(())
            }
            ExprKind::Subscript { container, index } => {
                self.emit_expression(container)?;
                self.emit_expression(index)?;
                self.b().emit(Opcode::TargetSubscript);
                Ok(())
            }
            _ => Err(self.err(target.span, "invalid assignment target")),
        }
    }

    /// `with defs { body }`: bindings acquire, and the bound resources drop
    /// on every path out of the block. The whole construct lowers to a
    /// protected region whose finally runs the drops.
    fn emit_with(&mut self, defs: &[Stmt], body: &Stmt) -> CompileResult<()> {
        let mut resources = Vec::new();
        for d in defs {
            if let StmtKind::Definition { target, value, .. } = &d.kind
                && let ExprKind::ResourceBinding { name, sym } = &target.kind
            {
                // Bind without the frame-level defer; the region's finally
                // owns the drop.
                self.emit_expression(value)?;
                let sym = sym.ok_or_else(|| self.err(target.span, "unresolved binding"))?;
                let access = self.access_of(sym);
                self.emit_target_access(access);
                self.b().emit(Opcode::Assign);
                self.b().emit(Opcode::Pop);
                resources.push(Expr::new(target.span, ExprKind::Ident {
                    module: None,
                    name: name.clone(),
                    sym: Some(sym),
                }));
            } else {
                self.emit_statement(d)?;
            }
        }

        if resources.is_empty() {
            return self.emit_statement_expr(body);
        }

        let span = body.span;
        let drops = Stmt::new(span, StmtKind::Drop(resources));
        let value_body = Stmt::new(
            span,
            StmtKind::Expression(Expr::new(span, ExprKind::Statement(Box::new(body.clone())))),
        );
        // The protected body leaves no value; the expression result of a
        // `with` is nil.
        self.emit_try(&value_body, &[], Some(&drops))?;
        self.b().emit(Opcode::Nil);
        Ok(())
    }

    fn emit_check_match(&mut self, subject: &Expr, pattern: &Expr) -> CompileResult<()> {
        self.emit_expression(subject)?;
        self.b().emit(Opcode::SaveStackPos);
        self.ctx().match_fails.push(Vec::new());
        self.emit_try_match(pattern)?;
        let fails = self.ctx().match_fails.pop().expect("fail frame pushed");
        self.b().emit(Opcode::RestoreStackPos);
        self.b().emit(Opcode::Pop);
        self.b().emit(Opcode::True);
        let done = self.b().emit_jump(Opcode::Jump);
        for site in fails {
            self.b().patch_jump(site);
        }
        self.b().emit(Opcode::RestoreStackPos);
        self.b().emit(Opcode::Pop);
        self.b().emit(Opcode::False);
        self.b().patch_jump(done);
        Ok(())
    }

    fn emit_call(&mut self, callee: &Expr, args: &[Arg]) -> CompileResult<()> {
        // Tag application is compiled directly when the callee names a tag.
        if let ExprKind::Ident { sym: Some(sym), .. } = &callee.kind
            && let Some(tag) = self.st.scopes.symbol(*sym).tag
            && args.len() == 1
            && args[0].name.is_none()
            && !args[0].spread
            && args[0].cond.is_none()
        {
            self.emit_expression(&args[0].value)?;
            self.b().emit_u32(Opcode::TagPush, tag);
            return Ok(());
        }

        let kwargs: Vec<&Arg> = args.iter().filter(|a| a.name.is_some()).collect();
        let positional: Vec<&Arg> = args.iter().filter(|a| a.name.is_none()).collect();
        let dynamic = positional.iter().any(|a| a.cond.is_some() || a.spread);

        if dynamic {
            self.b().emit(Opcode::SaveStackPos);
        }
        for a in &positional {
            let skip = match &a.cond {
                Some(c) => {
                    self.emit_expression(c)?;
                    Some(self.b().emit_jump(Opcode::JumpIfNot))
                }
                None => None,
            };
            self.emit_expression(&a.value)?;
            if a.spread {
                self.b().emit(Opcode::Splat);
            }
            if let Some(site) = skip {
                self.b().patch_jump(site);
            }
        }

        let npos = if dynamic {
            FROM_MARK
        } else {
            u32::try_from(positional.len()).expect("arity fits u32")
        };

        if kwargs.is_empty() {
            self.emit_expression(callee)?;
            self.b().emit_u32(Opcode::Call, npos);
        } else {
            self.emit_kwargs_dict(&kwargs)?;
            self.emit_expression(callee)?;
            self.b().emit_u32(Opcode::CallKw, npos);
        }
        Ok(())
    }

    fn emit_kwargs_dict(&mut self, kwargs: &[&Arg]) -> CompileResult<()> {
        for a in kwargs {
            let name = a.name.as_deref().expect("kwargs are named");
            let id = self.intern(name);
            self.b().emit_u32(Opcode::Str, id.index() as u32);
            match &a.cond {
                // A failed per-kwarg condition passes the None marker, which
                // argument binding treats as absent.
                Some(c) => {
                    self.emit_expression(c)?;
                    let absent = self.b().emit_jump(Opcode::JumpIfNot);
                    self.emit_expression(&a.value)?;
                    let present = self.b().emit_jump(Opcode::Jump);
                    self.b().patch_jump(absent);
                    self.b().emit(Opcode::NoneVal);
                    self.b().patch_jump(present);
                }
                None => self.emit_expression(&a.value)?,
            }
        }
        let n = u32::try_from(kwargs.len()).expect("kwargs count fits u32");
        self.b().emit_u32(Opcode::Dict, n);
        Ok(())
    }

    fn emit_method_call(&mut self, object: &Expr, maybe: bool, method: &str, args: &[Arg]) -> CompileResult<()> {
        let name = self.intern(method);

        // `super.m(args)` dispatches starting above the current class.
        if matches!(object.kind, ExprKind::Super) {
            let Some(&cid) = self.class_stack.last() else {
                return Err(self.err(object.span, "'super' outside of a method"));
            };
            let self_sym = self
                .st
                .scopes
                .lookup(self.scope, "self")
                .ok_or_else(|| self.err(object.span, "'super' outside of a method"))?;
            let access = self.access_of(self_sym);
            self.emit_load_access(access);
            for a in args {
                self.emit_expression(&a.value)?;
            }
            let n = u32::try_from(args.len()).expect("arity fits u32");
            self.b().emit_u32_u32(Opcode::CallSuper, cid.0, name.index() as u32);
            self.b().push_u32(n);
            return Ok(());
        }

        self.emit_expression(object)?;
        let nil_skip = if maybe {
            self.b().emit(Opcode::Dup);
            Some(self.b().emit_jump(Opcode::JumpIfNil))
        } else {
            None
        };

        let kwargs: Vec<&Arg> = args.iter().filter(|a| a.name.is_some()).collect();
        let positional: Vec<&Arg> = args.iter().filter(|a| a.name.is_none()).collect();
        let dynamic = positional.iter().any(|a| a.cond.is_some() || a.spread);

        if dynamic {
            self.b().emit(Opcode::SaveStackPos);
        }
        for a in &positional {
            let skip = match &a.cond {
                Some(c) => {
                    self.emit_expression(c)?;
                    Some(self.b().emit_jump(Opcode::JumpIfNot))
                }
                None => None,
            };
            self.emit_expression(&a.value)?;
            if a.spread {
                self.b().emit(Opcode::Splat);
            }
            if let Some(site) = skip {
                self.b().patch_jump(site);
            }
        }

        let npos = if dynamic {
            FROM_MARK
        } else {
            u32::try_from(positional.len()).expect("arity fits u32")
        };

        if kwargs.is_empty() {
            self.b().emit_u32_u32(Opcode::CallMethod, name.index() as u32, npos);
        } else {
            self.emit_kwargs_dict(&kwargs)?;
            self.b().emit_u32_u32(Opcode::CallMethodKw, name.index() as u32, npos);
        }

        if let Some(site) = nil_skip {
            self.b().patch_jump(site);
        }
        Ok(())
    }

    fn emit_function(&mut self, f: &FunctionExpr, span: Span) -> CompileResult<()> {
        let fscope = f.scope.ok_or_else(|| self.err(span, "function not symbolized"))?;
        let is_generator = f.kind == FnKind::Generator || body_has_yield(&f.body);

        let saved_scope = std::mem::replace(&mut self.scope, fscope);
        self.fns.push(FnCtx::new(is_generator));

        // Preamble: fill defaulted parameters.
        for p in &f.params {
            if let Some(d) = &p.default {
                let sym = p.sym.expect("parameter symbolized");
                let slot = self.st.scopes.symbol(sym).slot;
                self.b().set_location(d.span);
                self.b().emit_u32(Opcode::LoadVar, slot);
                let set = self.b().emit_jump(Opcode::JumpIfNil);
                let done = self.b().emit_jump(Opcode::Jump);
                self.b().patch_jump(set);
                self.emit_expression(d)?;
                self.b().emit_u32(Opcode::TargetVar, slot);
                self.b().emit(Opcode::Assign);
                self.b().emit(Opcode::Pop);
                self.b().patch_jump(done);
            }
        }

        let body_result = self.emit_statement(&f.body);
        let ctx = self.fns.pop().expect("function ctx pushed above");
        self.scope = saved_scope;
        body_result?;

        let name = f.name.as_deref().map(|n| self.world.interns.intern(n));
        let params = f
            .params
            .iter()
            .map(|p| ParamInfo {
                name: self.world.interns.intern(&p.name),
                has_default: p.default.is_some(),
                has_constraint: p.constraint.is_some(),
            })
            .collect();

        let param_base = f
            .params
            .first()
            .and_then(|p| p.sym)
            .map_or(0, |sym| self.st.scopes.symbol(sym).slot);
        let info = FuncInfo {
            name,
            params,
            param_base,
            rest: f.rest.map(|i| u32::try_from(i).expect("rest index fits u32")),
            kwargs: f.kwargs.map(|i| u32::try_from(i).expect("kwargs index fits u32")),
            nlocals: self.st.scopes.frame_size(fscope),
            cell_slots: smallvec::SmallVec::from_vec(self.st.scopes.cell_slots(fscope)),
            captures: self.st.scopes.captures(fscope).iter().map(|c| c.src).collect(),
            is_generator,
            code: ctx.builder.build(),
        };
        let fid = self.world.program.add_func(info);

        self.b().set_location(span);
        self.b().emit_u32(Opcode::MakeClosure, fid.0);
        Ok(())
    }

    /// Shared comprehension shell: iterates, binds the pattern, and lets
    /// `emit_elem` push accumulated values; finishes with `collect`
    /// (`Array`/`Dict` from the saved mark).
    fn emit_comprehension(
        &mut self,
        iter: &Expr,
        pattern: &Expr,
        cond: Option<&Expr>,
        emit_elem: impl Fn(&mut Self) -> CompileResult<()>,
        collect: Opcode,
    ) -> CompileResult<()> {
        let tmp = self.tmp_slot(iter.span);
        self.emit_expression(iter)?;
        self.b().emit(Opcode::GetIter);
        // Save the temporary's old contents under the accumulation, and
        // store the iterator in it.
        self.emit_tmp_save(tmp);
        self.b().emit(Opcode::Swap);
        self.emit_tmp_store(tmp);
        self.b().emit(Opcode::SaveStackPos);

        let begin = self.b().offset();
        self.emit_tmp_load(tmp);
        self.b().emit(Opcode::IterNext);
        let done = self.b().emit_jump(Opcode::JumpIfNone);
        // [old, elems..., iter, v] -> [old, elems..., v]
        self.b().emit(Opcode::Swap);
        self.b().emit(Opcode::Pop);
        self.emit_assignment(pattern)?;
        self.b().emit(Opcode::Pop);

        if let Some(c) = cond {
            self.emit_expression(c)?;
            let skip = self.b().emit_jump(Opcode::JumpIfNot);
            emit_elem(self)?;
            self.b().patch_jump(skip);
        } else {
            emit_elem(self)?;
        }
        self.b().emit_jump_back(Opcode::Jump, begin);

        self.b().patch_jump(done);
        // [old, elems..., iter]
        self.b().emit(Opcode::Pop);
        self.b().emit_u32(collect, FROM_MARK);
        // [old, result] -> [result], restoring the temporary.
        self.b().emit(Opcode::Swap);
        self.emit_tmp_store(tmp);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Try/catch/finally.
    // ------------------------------------------------------------------

    fn emit_try(&mut self, body: &Stmt, catches: &[MatchCase], finally: Option<&Stmt>) -> CompileResult<()> {
        self.ctx().trys.push(TryCtx {
            finally: finally.cloned(),
        });

        self.b().emit(Opcode::PushTry);
        let catch_site = self.b().jump_placeholder();
        let finally_site = self.b().jump_placeholder();

        self.emit_statement(body)?;
        self.b().emit(Opcode::PopTry);
        if let Some(f) = finally {
            self.emit_statement(f)?;
        }
        let done = self.b().emit_jump(Opcode::Jump);

        // Catch entry: the VM arrives here with the thrown value pushed and
        // the handler already popped. Every path out runs the finally
        // inline.
        self.b().patch_jump(catch_site);
        let mut successes = Vec::new();
        if !catches.is_empty() {
            self.ctx().match_successes.push(Vec::new());
            for case in catches {
                self.emit_catch_case(case, finally)?;
            }
            successes = self.ctx().match_successes.pop().expect("success frame pushed");
        }
        // No handler matched (or none exist): finally, then rethrow.
        if let Some(f) = finally {
            self.emit_statement(f)?;
        }
        self.b().emit(Opcode::Throw);

        // Finally entry for VM-driven unwinding (return/throw passing
        // through): runs the block and resumes the pending action.
        let vm_finally = self.b().offset();
        self.b().patch_jump_to(finally_site, vm_finally);
        if let Some(f) = finally {
            self.emit_statement(f)?;
        }
        self.b().emit(Opcode::EndFinally);

        self.b().patch_jump(done);
        for site in successes {
            self.b().patch_jump(site);
        }
        self.ctx().trys.pop();
        Ok(())
    }

    fn emit_catch_case(&mut self, case: &MatchCase, finally: Option<&Stmt>) -> CompileResult<()> {
        self.b().set_location(case.pattern.span);
        self.b().emit(Opcode::SaveStackPos);
        self.ctx().match_fails.push(Vec::new());
        self.emit_try_match(&case.pattern)?;
        if let Some(guard) = &case.guard {
            self.emit_expression(guard)?;
            let site = self.b().emit_jump(Opcode::JumpIfNot);
            self.push_fail(site);
        }
        self.b().emit(Opcode::RestoreStackPos);
        self.b().emit(Opcode::Pop);
        self.emit_statement(&case.body)?;
        if let Some(f) = finally {
            self.emit_statement(f)?;
        }
        let success = self.b().emit_jump(Opcode::Jump);
        self.ctx()
            .match_successes
            .last_mut()
            .expect("success frame active")
            .push(success);
        let fails = self.ctx().match_fails.pop().expect("fail frame pushed");
        for site in fails {
            self.b().patch_jump(site);
        }
        self.b().emit(Opcode::RestoreStackPos);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Tags and classes.
    // ------------------------------------------------------------------

    fn emit_tag_def(&mut self, c: &ClassDef) -> CompileResult<()> {
        let sym = c.sym.expect("tag symbolized");
        let tag = self.st.scopes.symbol(sym).tag.expect("tag symbol");
        self.b().emit_u32(Opcode::TagVal, tag);
        let access = self.access_of(sym);
        self.emit_target_access(access);
        self.b().emit(Opcode::Assign);
        self.b().emit(Opcode::Pop);

        for m in &c.methods {
            let ExprKind::Function(fx) = &m.kind else {
                return Err(self.err(m.span, "malformed method"));
            };
            let name = fx.name.as_deref().expect("methods are named").to_string();
            let name_id = self.intern(&name);
            self.emit_function(fx, m.span)?;
            self.b().emit_u32_u32(Opcode::TagMethod, tag, name_id.index() as u32);
        }
        Ok(())
    }

    fn emit_class_def(&mut self, c: &ClassDef) -> CompileResult<()> {
        let sym = c.sym.expect("class symbolized");
        let cid = self.st.scopes.symbol(sym).class.expect("class symbol");
        self.b().emit_u32(Opcode::ClassVal, cid);
        let access = self.access_of(sym);
        self.emit_target_access(access);
        self.b().emit(Opcode::Assign);
        self.b().emit(Opcode::Pop);

        self.class_stack.push(ClassId(cid));
        let groups: [(&[Expr], u8); 4] = [
            (&c.methods, 0),
            (&c.getters, 1),
            (&c.setters, 2),
            (&c.statics, 3),
        ];
        for (group, kind) in groups {
            for m in group {
                let ExprKind::Function(fx) = &m.kind else {
                    self.class_stack.pop();
                    return Err(self.err(m.span, "malformed method"));
                };
                let name = fx.name.as_deref().expect("methods are named").to_string();
                let name_id = self.intern(&name);
                self.emit_function(fx, m.span)?;
                self.b().emit_u32_u32_u8(Opcode::ClassMethod, cid, name_id.index() as u32, kind);
            }
        }
        for (i, field) in c.fields.iter().enumerate() {
            if let Some(d) = &field.default {
                self.emit_expression(d)?;
                let idx = u32::try_from(i).expect("field index fits u32");
                self.b().emit_u32_u32(Opcode::ClassFieldDefault, cid, idx);
            }
        }
        self.class_stack.pop();
        Ok(())
    }

    // ------------------------------------------------------------------
    // Macros.
    // ------------------------------------------------------------------

    /// Compiles a macro definition immediately so later statements can
    /// expand it.
    fn define_macro(&mut self, s: &mut Stmt) -> CompileResult<()> {
        let span = s.span;
        match &mut s.kind {
            StmtKind::MacroDef { name, body, .. } => {
                let name = name.clone();
                // The template body becomes a one-parameter function: `self`
                // receives the array of argument ASTs.
                let body_stmt = Stmt::new(body.span, StmtKind::Return(vec![body.clone()]));
                let mut f = FunctionExpr {
                    name: Some(name.clone()),
                    kind: FnKind::Function,
                    params: vec![Param {
                        name: "self".to_string(),
                        default: None,
                        constraint: None,
                        span,
                        sym: None,
                    }],
                    rest: None,
                    kwargs: None,
                    body: Box::new(body_stmt),
                    decorators: Vec::new(),
                    return_type: None,
                    type_params: Vec::new(),
                    where_clauses: Vec::new(),
                    self_sym: None,
                    scope: None,
                };
                let value = self.compile_macro_function(&mut f, span)?;
                let sym = self.declare(&name, span)?;
                self.st.scopes.symbol_mut(sym).macro_ = true;
                self.st.macros.insert(sym, MacroDef {
                    value,
                    kind: MacroKind::Template,
                });
                Ok(())
            }
            StmtKind::FunMacroDef { name, f } => {
                let name = name.clone();
                let ExprKind::Function(fx) = &mut f.kind else {
                    return Err(self.err(span, "malformed macro definition"));
                };
                let mut fx = (**fx).clone();
                let value = self.compile_macro_function(&mut fx, span)?;
                let sym = self.declare(&name, span)?;
                self.st.scopes.symbol_mut(sym).fun_macro = true;
                self.st.macros.insert(sym, MacroDef {
                    value,
                    kind: MacroKind::Fun,
                });
                Ok(())
            }
            _ => Err(self.err(span, "not a macro definition")),
        }
    }

    /// Compiles a function for compile-time execution; it must not capture
    /// locals.
    fn compile_macro_function(&mut self, f: &mut FunctionExpr, span: Span) -> CompileResult<Value> {
        self.symbolize_function(f, false)?;
        // Emit into a scratch context so MakeClosure does not land in the
        // surrounding code.
        self.fns.push(FnCtx::new(false));
        let r = self.emit_function(f, span);
        let ctx = self.fns.pop().expect("scratch ctx pushed above");
        drop(ctx);
        r?;
        // The scratch context only held the MakeClosure; the function id is
        // the most recently added one.
        let fid = FunctionId(u32::try_from(self.world.program.funcs.len() - 1).expect("function id fits u32"));
        if !self.world.program.func(fid).captures.is_empty() {
            return Err(self.err(span, "macros cannot capture local variables"));
        }
        Ok(Value::Function(fid))
    }

    /// Compile-time evaluation: compiles `e` into a scratch function and
    /// runs it in the world's VM.
    fn compile_time_eval(&mut self, e: &mut Expr) -> CompileResult<Value> {
        self.symbolize_expression(e)?;
        let scratch_scope = self.st.scopes.new_scope(self.st.builtin_scope, true);
        let saved_scope = std::mem::replace(&mut self.scope, scratch_scope);
        self.fns.push(FnCtx::new(false));
        let r = self.emit_expression(e).map(|()| {
            self.b().emit(Opcode::Return);
        });
        let ctx = self.fns.pop().expect("scratch ctx pushed above");
        self.scope = saved_scope;
        r?;

        if !self.st.scopes.captures(scratch_scope).is_empty() {
            return Err(self.err(e.span, "compile-time expression references a local variable"));
        }

        let info = FuncInfo {
            nlocals: self.st.scopes.frame_size(scratch_scope),
            code: ctx.builder.build(),
            ..FuncInfo::default()
        };
        let fid = self.world.program.add_func(info);
        vm::run_isolated(self.world, Value::Function(fid), Vec::new(), None)
            .map_err(|msg| self.err(e.span, format!("compile-time evaluation failed: {msg}")))
    }

    fn macro_lookup(&self, module: Option<&str>, name: &str) -> Option<(SymbolId, MacroDef)> {
        if module.is_some() {
            return None;
        }
        let sym = self.st.scopes.lookup(self.scope, name)?;
        let def = self.st.macros.get(&sym)?;
        Some((sym, *def))
    }
}

/// Recursive child symbolization for expression kinds with no binding
/// structure.
struct SymbolizeChildren<'a, 'w> {
    compiler: &'a mut Compiler<'w>,
    result: &'a mut CompileResult<()>,
}

impl Visitor for SymbolizeChildren<'_, '_> {
    fn visit_expr(&mut self, e: &mut Expr) {
        if self.result.is_err() {
            return;
        }
        let r = self.compiler.symbolize_expression(e);
        if r.is_err() {
            *self.result = r;
        }
    }

    fn visit_stmt(&mut self, s: &mut Stmt) {
        if self.result.is_err() {
            return;
        }
        let r = self.compiler.symbolize_statement(s);
        if r.is_err() {
            *self.result = r;
        }
    }
}

impl MacroHost for Compiler<'_> {
    fn macro_kind(&self, module: Option<&str>, name: &str) -> Option<MacroKind> {
        self.macro_lookup(module, name).map(|(_, def)| def.kind)
    }

    fn expand_macro(
        &mut self,
        _p: &mut Parser<'_>,
        module: Option<&str>,
        name: &str,
        args: Vec<Expr>,
        span: Span,
    ) -> DiagResult<Expr> {
        let Some((_, def)) = self.macro_lookup(module, name) else {
            return Err(self.err(span, format!("unknown macro '{name}'")));
        };
        // Arguments are passed as an array of quoted ASTs.
        let arg_values: Vec<Value> = args
            .into_iter()
            .map(|a| self.world.heap.alloc_value(HeapData::Ast(AstValue::Expr(Box::new(a)))))
            .collect();
        let arr = self.world.heap.alloc_value(HeapData::Array(arg_values));
        self.world.add_const_root(arr);
        let result = vm::run_isolated(self.world, def.value, vec![arr], None)
            .map_err(|msg| self.err(span, format!("macro expansion failed: {msg}")))?;
        let mut expr = value_to_expr(self.world, result, span);
        MarkSynthetic.visit_expr(&mut expr);
        Ok(expr)
    }

    fn expand_fun_macro(
        &mut self,
        p: &mut Parser<'_>,
        module: Option<&str>,
        name: &str,
        span: Span,
    ) -> DiagResult<Expr> {
        let Some((_, def)) = self.macro_lookup(module, name) else {
            return Err(self.err(span, format!("unknown macro '{name}'")));
        };
        let mut driver = vm::ParserDriverImpl { parser: p };
        let result = vm::run_isolated(self.world, def.value, Vec::new(), Some(&mut driver))
            .map_err(|msg| self.err(span, format!("macro expansion failed: {msg}")))?;
        let mut expr = value_to_expr(self.world, result, span);
        MarkSynthetic.visit_expr(&mut expr);
        Ok(expr)
    }

    fn eval_const_bool(&mut self, e: &Expr) -> DiagResult<bool> {
        let mut e = e.clone();
        let v = self.compile_time_eval(&mut e)?;
        Ok(v.truthy())
    }
}

/// Converts a compile-time value back into AST for splicing.
pub fn value_to_expr(world: &mut World, v: Value, span: Span) -> Expr {
    match v {
        Value::Nil | Value::Sentinel => Expr::new(span, ExprKind::Nil),
        Value::Bool(b) => Expr::new(span, ExprKind::Boolean(b)),
        Value::Int(k) => Expr::new(span, ExprKind::Integer(k)),
        Value::Real(x) => Expr::new(span, ExprKind::Real(x)),
        Value::InternStr(id) => {
            let s = world.interns.get(id).to_string();
            Expr::new(span, ExprKind::Str(s))
        }
        Value::Ref(id) => match world.heap.get(id) {
            HeapData::Ast(AstValue::Expr(e)) => (**e).clone(),
            HeapData::Ast(AstValue::Stmt(s)) => {
                let s = (**s).clone();
                Expr::new(span, ExprKind::Statement(Box::new(s)))
            }
            HeapData::Str(s) => {
                let s = s.to_string();
                Expr::new(span, ExprKind::Str(s))
            }
            HeapData::Array(items) => {
                let items = items.clone();
                let elems: Vec<Expr> = items.into_iter().map(|i| value_to_expr(world, i, span)).collect();
                let n = elems.len();
                Expr::new(
                    span,
                    ExprKind::Array {
                        elems,
                        conds: std::iter::repeat_with(|| None).take(n).collect(),
                    },
                )
            }
            _ => {
                world.add_const_root(v);
                Expr::new(span, ExprKind::ConstValue(v))
            }
        },
        _ => Expr::new(span, ExprKind::ConstValue(v)),
    }
}

fn bin_opcode(op: BinOp) -> Opcode {
    match op {
        BinOp::Add => Opcode::Add,
        BinOp::Sub => Opcode::Sub,
        BinOp::Mul => Opcode::Mul,
        BinOp::Div => Opcode::Div,
        BinOp::Mod => Opcode::Mod,
        BinOp::Eq => Opcode::Eq,
        BinOp::NotEq => Opcode::Neq,
        BinOp::Lt => Opcode::Lt,
        BinOp::Leq => Opcode::Leq,
        BinOp::Gt => Opcode::Gt,
        BinOp::Geq => Opcode::Geq,
        BinOp::Cmp => Opcode::Cmp,
        BinOp::BitAnd => Opcode::BitAnd,
        BinOp::BitOr => Opcode::BitOr,
        BinOp::BitXor => Opcode::BitXor,
        BinOp::Shl => Opcode::Shl,
        BinOp::Shr => Opcode::Shr,
    }
}

fn mut_opcode(op: BinOp) -> Option<Opcode> {
    Some(match op {
        BinOp::Add => Opcode::MutAdd,
        BinOp::Sub => Opcode::MutSub,
        BinOp::Mul => Opcode::MutMul,
        BinOp::Div => Opcode::MutDiv,
        _ => return None,
    })
}

/// Builds the implicit `init` method for `class Foo(a, b)`: the parameters
/// become `self.a = a; self.b = b` assignments.
fn synth_init_method(c: &ClassDef, span: Span) -> Expr {
    let mut body = Vec::new();
    for p in &c.init_params {
        let target = Expr::new(
            p.span,
            ExprKind::Member {
                object: Box::new(Expr::new(p.span, ExprKind::Self_)),
                member: p.name.clone(),
                maybe: false,
            },
        );
        let value = Expr::new(
            p.span,
            ExprKind::Ident {
                module: None,
                name: p.name.clone(),
                sym: None,
            },
        );
        body.push(Stmt::new(
            p.span,
            StmtKind::Expression(Expr::new(
                p.span,
                ExprKind::Assign {
                    target: Box::new(target),
                    value: Box::new(value),
                },
            )),
        ));
    }
    Expr::new(
        span,
        ExprKind::Function(Box::new(FunctionExpr {
            name: Some("init".to_string()),
            kind: FnKind::Function,
            params: c.init_params.clone(),
            rest: None,
            kwargs: None,
            body: Box::new(Stmt::new(span, StmtKind::Block(body))),
            decorators: Vec::new(),
            return_type: None,
            type_params: Vec::new(),
            where_clauses: Vec::new(),
            self_sym: None,
            scope: None,
        })),
    )
}

fn body_has_yield(s: &Stmt) -> bool {
    struct HasYield(bool);
    impl Visitor for HasYield {
        fn visit_expr(&mut self, e: &mut Expr) {
            match &e.kind {
                ExprKind::Yield(_) => self.0 = true,
                // Yields inside nested functions belong to those functions.
                ExprKind::Function(_) => {}
                _ => crate::ast::walk_expr(self, e),
            }
        }
    }
    let mut v = HasYield(false);
    let mut cloned = s.clone();
    v.visit_stmt(&mut cloned);
    v.0
}
