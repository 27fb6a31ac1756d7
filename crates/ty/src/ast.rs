//! Expression and statement sum types, plus a uniform mutating visitor.
//!
//! The parser produces this tree; the compiler's symbolization pass walks it
//! mutably, filling in the `sym` slots on identifiers, bindings, and
//! functions. Nodes spliced by macro expansion have synthetic spans.

use crate::{
    lex::token::RegexTok,
    location::Span,
    scope::SymbolId,
    value::Value,
};

/// Binary operators with strict (non-short-circuit) evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::IntoStaticStr)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Eq,
    NotEq,
    Lt,
    Leq,
    Gt,
    Geq,
    /// `<=>`, three-way comparison.
    Cmp,
    BitAnd,
    BitOr,
    BitXor,
    Shl,
    Shr,
}

/// Short-circuiting logical operators (`&&`/`and`, `||`/`or`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicOp {
    And,
    Or,
}

/// Prefix operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnOp {
    Neg,
    Not,
    /// `#xs`: element count.
    Count,
}

/// Prefix/postfix increment and decrement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IncDec {
    PreInc,
    PreDec,
    PostInc,
    PostDec,
}

/// One piece of a special (interpolated) string at the AST level.
#[derive(Debug, Clone)]
pub enum SpecialPart {
    Lit(String),
    Interp { expr: Box<Expr>, fmt: Option<String> },
}

/// A call argument: positional, named (kwarg), spread, or conditional.
#[derive(Debug, Clone)]
pub struct Arg {
    pub value: Expr,
    /// Keyword-argument name, when given as `name: value`.
    pub name: Option<String>,
    /// `*xs` spread.
    pub spread: bool,
    /// `f(x if c)`: the argument is passed only when `c` is truthy.
    pub cond: Option<Expr>,
}

/// A function parameter.
#[derive(Debug, Clone)]
pub struct Param {
    pub name: String,
    pub default: Option<Expr>,
    pub constraint: Option<Expr>,
    pub span: Span,
    pub sym: Option<SymbolId>,
}

/// Function literal kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FnKind {
    Function,
    /// `&expr` shorthand: one implicit parameter named `it`.
    Implicit,
    Generator,
}

/// A function literal (also the payload of function definitions).
#[derive(Debug, Clone)]
pub struct FunctionExpr {
    pub name: Option<String>,
    pub kind: FnKind,
    pub params: Vec<Param>,
    /// Index into `params` of the `*rest` parameter.
    pub rest: Option<usize>,
    /// Index into `params` of the `%kwargs` parameter.
    pub kwargs: Option<usize>,
    pub body: Box<Stmt>,
    pub decorators: Vec<Expr>,
    pub return_type: Option<Box<Expr>>,
    pub type_params: Vec<String>,
    /// `where T: Trait and U: Other` constraints (unchecked at runtime).
    pub where_clauses: Vec<Expr>,
    /// Filled at symbolization: the symbol this function binds itself to in
    /// the enclosing scope, when it has a name.
    pub self_sym: Option<SymbolId>,
    /// Filled at symbolization: the function-boundary scope of the body.
    pub scope: Option<crate::scope::ScopeId>,
}

/// One `pattern [if guard] => body` arm of a match expression.
#[derive(Debug, Clone)]
pub struct MatchArm {
    pub pattern: Expr,
    pub guard: Option<Expr>,
    pub body: Expr,
}

/// One `pattern [if guard] => stmt` case of a match statement (and of
/// try/catch handler lists).
#[derive(Debug, Clone)]
pub struct MatchCase {
    pub pattern: Expr,
    pub guard: Option<Expr>,
    pub body: Stmt,
}

/// A named-group binding introduced by a regex pattern, filled during
/// symbolization.
#[derive(Debug, Clone)]
pub struct RegexBind {
    pub group: usize,
    pub name: String,
    pub sym: Option<SymbolId>,
}

/// One condition of an `if`/`while` header: a plain expression, or a
/// `pattern = expr` binding condition (if-let / while-let / while-match).
#[derive(Debug, Clone)]
pub struct CondPart {
    pub target: Option<Expr>,
    pub expr: Expr,
}

/// Field/method container kinds sharing [`ClassDef`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassKind {
    Class,
    Tag,
    Trait,
}

/// A field declaration inside a class body.
#[derive(Debug, Clone)]
pub struct FieldDef {
    pub name: String,
    pub default: Option<Expr>,
    pub constraint: Option<Expr>,
    pub span: Span,
}

/// A class, tag, or trait definition.
#[derive(Debug, Clone)]
pub struct ClassDef {
    pub kind: ClassKind,
    pub name: String,
    pub pub_: bool,
    pub super_: Option<Expr>,
    pub traits: Vec<Expr>,
    pub type_params: Vec<String>,
    pub fields: Vec<FieldDef>,
    /// Implicit-init parameters from `class Foo(a: Int, b)`.
    pub init_params: Vec<Param>,
    pub methods: Vec<Expr>,
    pub getters: Vec<Expr>,
    pub setters: Vec<Expr>,
    pub statics: Vec<Expr>,
    pub doc: Option<String>,
    pub sym: Option<SymbolId>,
}

/// Expressions.
#[derive(Debug, Clone)]
pub struct Expr {
    pub span: Span,
    pub kind: ExprKind,
}

impl Expr {
    #[must_use]
    pub fn new(span: Span, kind: ExprKind) -> Self {
        Self { span, kind }
    }

    /// A synthetic nil expression, used for error recovery and implicit
    /// values.
    #[must_use]
    pub fn nil(span: Span) -> Self {
        Self::new(span, ExprKind::Nil)
    }
}

/// The expression discriminator.
#[derive(Debug, Clone)]
pub enum ExprKind {
    // Literals.
    Nil,
    Boolean(bool),
    Integer(i64),
    Real(f64),
    Str(String),
    Special(Vec<SpecialPart>),
    Regex { tok: RegexTok, binds: Vec<RegexBind> },

    // Names and paths.
    Ident {
        module: Option<String>,
        name: String,
        sym: Option<SymbolId>,
    },
    /// `^x`: resource binding; the bound value's `drop` method runs on scope
    /// exit.
    ResourceBinding { name: String, sym: Option<SymbolId> },
    Self_,
    Super,

    // Patterns (most produced by `patternize`).
    MatchAny,
    MatchNotNil { name: String, sym: Option<SymbolId> },
    MatchRest { name: String, sym: Option<SymbolId> },
    Alias {
        pattern: Box<Expr>,
        name: String,
        sym: Option<SymbolId>,
    },
    TagPattern { tag: Box<Expr>, inner: Box<Expr> },
    View { f: Box<Expr>, pat: Box<Expr> },
    NotNilView { f: Box<Expr>, pat: Box<Expr> },
    Choice(Vec<Expr>),
    Spread(Box<Expr>),

    // Composites.
    Array {
        elems: Vec<Expr>,
        conds: Vec<Option<Expr>>,
    },
    ArrayCompr {
        elem: Box<Expr>,
        pattern: Box<Expr>,
        iter: Box<Expr>,
        cond: Option<Box<Expr>>,
    },
    Dict {
        keys: Vec<Expr>,
        values: Vec<Expr>,
        conds: Vec<Option<Expr>>,
        dflt: Option<Box<Expr>>,
    },
    DictCompr {
        key: Box<Expr>,
        value: Box<Expr>,
        pattern: Box<Expr>,
        iter: Box<Expr>,
        cond: Option<Box<Expr>>,
    },
    Tuple {
        items: Vec<Expr>,
        names: Vec<Option<String>>,
        conds: Vec<Option<Expr>>,
        required: Vec<bool>,
    },
    /// Parser-internal comma sequence; `patternize` turns it into a choice.
    List(Vec<Expr>),

    // Operators.
    Binary { op: BinOp, lhs: Box<Expr>, rhs: Box<Expr> },
    Logic { op: LogicOp, lhs: Box<Expr>, rhs: Box<Expr> },
    Unary { op: UnOp, operand: Box<Expr> },
    IncDec { op: IncDec, target: Box<Expr> },
    /// `a ?? b`: nil-coalescing.
    Coalesce { lhs: Box<Expr>, rhs: Box<Expr> },
    /// `a ?: b`: `a` unless it is nil or false.
    Elvis { lhs: Box<Expr>, rhs: Box<Expr> },
    Conditional {
        cond: Box<Expr>,
        then: Box<Expr>,
        otherwise: Box<Expr>,
    },
    Assign { target: Box<Expr>, value: Box<Expr> },
    /// `x ?= e`: assign only when the target is nil.
    MaybeAssign { target: Box<Expr>, value: Box<Expr> },
    CompoundAssign {
        op: BinOp,
        target: Box<Expr>,
        value: Box<Expr>,
    },
    Range {
        lo: Box<Expr>,
        hi: Box<Expr>,
        inclusive: bool,
    },
    In {
        item: Box<Expr>,
        collection: Box<Expr>,
        negated: bool,
    },
    /// `e :: pattern`: check-match, evaluating to a boolean.
    CheckMatch { subject: Box<Expr>, pattern: Box<Expr> },
    UserOp {
        name: String,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
        sym: Option<SymbolId>,
    },

    // Calls and access.
    Call { callee: Box<Expr>, args: Vec<Arg> },
    MethodCall {
        object: Box<Expr>,
        maybe: bool,
        method: String,
        args: Vec<Arg>,
    },
    Member {
        object: Box<Expr>,
        member: String,
        maybe: bool,
    },
    DynMember { object: Box<Expr>, member: Box<Expr> },
    Subscript { container: Box<Expr>, index: Box<Expr> },
    Slice {
        e: Box<Expr>,
        i: Option<Box<Expr>>,
        j: Option<Box<Expr>>,
        k: Option<Box<Expr>>,
    },

    // Functions.
    Function(Box<FunctionExpr>),

    // Match.
    Match { subject: Box<Expr>, arms: Vec<MatchArm> },

    // Macro machinery.
    Template { body: Box<Expr>, holes: Vec<Expr> },
    /// `$(e)` inside a template: splice the expansion-time value as an AST.
    TemplateHole(u32),
    /// `${e}`: splice the expansion-time value as a literal value.
    TemplateVHole(u32),
    /// `$:t`: splice a type expression.
    TemplateTHole(u32),
    /// `$!{e}`: splice and re-symbolize in the expansion scope.
    TemplateXHole(u32),
    MacroInvocation {
        module: Option<String>,
        name: String,
        args: Vec<Expr>,
    },

    // Meta.
    Eval(Box<Expr>),
    Defined { module: Option<String>, name: String },
    TypeOf(Box<Expr>),
    Throw(Box<Expr>),
    Yield(Option<Box<Expr>>),
    With { defs: Vec<Stmt>, body: Box<Stmt> },
    Statement(Box<Stmt>),
    Cast { e: Box<Expr>, ty: Box<Expr> },
    /// A compile-time value spliced by macro expansion.
    ConstValue(Value),
}

/// Statements.
#[derive(Debug, Clone)]
pub struct Stmt {
    pub span: Span,
    pub kind: StmtKind,
}

impl Stmt {
    #[must_use]
    pub fn new(span: Span, kind: StmtKind) -> Self {
        Self { span, kind }
    }

    #[must_use]
    pub fn null(span: Span) -> Self {
        Self::new(span, StmtKind::Null)
    }
}

/// Operator associativity for user operator definitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Assoc {
    Left,
    Right,
}

/// The statement discriminator.
#[derive(Debug, Clone)]
pub enum StmtKind {
    Expression(Expr),
    Definition {
        target: Expr,
        value: Expr,
        pub_: bool,
        const_: bool,
    },
    FunctionDef { f: Expr, pub_: bool },
    MacroDef {
        name: String,
        params: Vec<String>,
        body: Expr,
    },
    FunMacroDef { name: String, f: Expr },
    OperatorDef { name: String, prec: u8, assoc: Assoc },
    TagDef(Box<ClassDef>),
    ClassDef(Box<ClassDef>),
    TypeDef {
        name: String,
        params: Vec<String>,
        ty: Expr,
    },
    For {
        init: Box<Stmt>,
        cond: Option<Expr>,
        next: Option<Expr>,
        body: Box<Stmt>,
    },
    Each {
        target: Expr,
        iter: Expr,
        cond: Option<Expr>,
        stop: Option<Expr>,
        body: Box<Stmt>,
    },
    While { parts: Vec<CondPart>, body: Box<Stmt> },
    WhileMatch {
        subject: Expr,
        pattern: Expr,
        body: Box<Stmt>,
    },
    If {
        parts: Vec<CondPart>,
        neg: bool,
        then: Box<Stmt>,
        otherwise: Option<Box<Stmt>>,
    },
    Match { subject: Expr, cases: Vec<MatchCase> },
    Return(Vec<Expr>),
    GeneratorReturn(Vec<Expr>),
    Next,
    Continue,
    Break { depth: u32 },
    Try {
        body: Box<Stmt>,
        catches: Vec<MatchCase>,
        finally: Option<Box<Stmt>>,
    },
    Defer(Expr),
    /// Like `defer`, but the action runs only when the scope exits by
    /// unwinding.
    Cleanup(Expr),
    Drop(Vec<Expr>),
    Block(Vec<Stmt>),
    /// A statement group that does not open a scope (macro expansions).
    Multi(Vec<Stmt>),
    Halt,
    Null,
    Import {
        module: String,
        alias: Option<String>,
        names: Vec<(String, Option<String>)>,
        pub_: bool,
    },
    Export(Vec<String>),
    Use { module: Option<String>, names: Vec<String> },
    SetType { target: Expr, ty: Expr },
    NamespaceDef {
        name: String,
        pub_: bool,
        body: Vec<Stmt>,
    },
}

/// A uniform mutating visitor over the tree.
///
/// Override the hooks you need; the default implementations recurse via
/// [`walk_expr`] and [`walk_stmt`].
pub trait Visitor {
    fn visit_expr(&mut self, e: &mut Expr) {
        walk_expr(self, e);
    }

    fn visit_stmt(&mut self, s: &mut Stmt) {
        walk_stmt(self, s);
    }
}

fn walk_opt<V: Visitor + ?Sized>(v: &mut V, e: &mut Option<Box<Expr>>) {
    if let Some(e) = e {
        v.visit_expr(e);
    }
}

fn walk_args<V: Visitor + ?Sized>(v: &mut V, args: &mut [Arg]) {
    for arg in args {
        v.visit_expr(&mut arg.value);
        if let Some(cond) = &mut arg.cond {
            v.visit_expr(cond);
        }
    }
}

fn walk_fn<V: Visitor + ?Sized>(v: &mut V, f: &mut FunctionExpr) {
    for p in &mut f.params {
        if let Some(d) = &mut p.default {
            v.visit_expr(d);
        }
        if let Some(c) = &mut p.constraint {
            v.visit_expr(c);
        }
    }
    for d in &mut f.decorators {
        v.visit_expr(d);
    }
    v.visit_stmt(&mut f.body);
}

fn walk_class<V: Visitor + ?Sized>(v: &mut V, c: &mut ClassDef) {
    if let Some(s) = &mut c.super_ {
        v.visit_expr(s);
    }
    for t in &mut c.traits {
        v.visit_expr(t);
    }
    for field in &mut c.fields {
        if let Some(d) = &mut field.default {
            v.visit_expr(d);
        }
        if let Some(cst) = &mut field.constraint {
            v.visit_expr(cst);
        }
    }
    for m in c
        .methods
        .iter_mut()
        .chain(c.getters.iter_mut())
        .chain(c.setters.iter_mut())
        .chain(c.statics.iter_mut())
    {
        v.visit_expr(m);
    }
}

/// Visits every child expression/statement of `e`.
pub fn walk_expr<V: Visitor + ?Sized>(v: &mut V, e: &mut Expr) {
    match &mut e.kind {
        ExprKind::Nil
        | ExprKind::Boolean(_)
        | ExprKind::Integer(_)
        | ExprKind::Real(_)
        | ExprKind::Str(_)
        | ExprKind::Regex { .. }
        | ExprKind::Ident { .. }
        | ExprKind::ResourceBinding { .. }
        | ExprKind::Self_
        | ExprKind::Super
        | ExprKind::MatchAny
        | ExprKind::MatchNotNil { .. }
        | ExprKind::MatchRest { .. }
        | ExprKind::TemplateHole(_)
        | ExprKind::TemplateVHole(_)
        | ExprKind::TemplateTHole(_)
        | ExprKind::TemplateXHole(_)
        | ExprKind::Defined { .. }
        | ExprKind::ConstValue(_) => {}
        ExprKind::Special(parts) => {
            for part in parts {
                if let SpecialPart::Interp { expr, .. } = part {
                    v.visit_expr(expr);
                }
            }
        }
        ExprKind::Alias { pattern, .. } => v.visit_expr(pattern),
        ExprKind::TagPattern { tag, inner } => {
            v.visit_expr(tag);
            v.visit_expr(inner);
        }
        ExprKind::View { f, pat } | ExprKind::NotNilView { f, pat } => {
            v.visit_expr(f);
            v.visit_expr(pat);
        }
        ExprKind::Choice(es) | ExprKind::List(es) => {
            for e in es {
                v.visit_expr(e);
            }
        }
        ExprKind::Spread(e)
        | ExprKind::Unary { operand: e, .. }
        | ExprKind::IncDec { target: e, .. }
        | ExprKind::Eval(e)
        | ExprKind::TypeOf(e)
        | ExprKind::Throw(e) => v.visit_expr(e),
        ExprKind::Array { elems, conds } => {
            for e in elems {
                v.visit_expr(e);
            }
            for c in conds.iter_mut().flatten() {
                v.visit_expr(c);
            }
        }
        ExprKind::ArrayCompr { elem, pattern, iter, cond } => {
            v.visit_expr(elem);
            v.visit_expr(pattern);
            v.visit_expr(iter);
            walk_opt(v, cond);
        }
        ExprKind::Dict { keys, values, conds, dflt } => {
            for e in keys.iter_mut().chain(values.iter_mut()) {
                v.visit_expr(e);
            }
            for c in conds.iter_mut().flatten() {
                v.visit_expr(c);
            }
            walk_opt(v, dflt);
        }
        ExprKind::DictCompr {
            key,
            value,
            pattern,
            iter,
            cond,
        } => {
            v.visit_expr(key);
            v.visit_expr(value);
            v.visit_expr(pattern);
            v.visit_expr(iter);
            walk_opt(v, cond);
        }
        ExprKind::Tuple { items, conds, .. } => {
            for e in items {
                v.visit_expr(e);
            }
            for c in conds.iter_mut().flatten() {
                v.visit_expr(c);
            }
        }
        ExprKind::Binary { lhs, rhs, .. }
        | ExprKind::Logic { lhs, rhs, .. }
        | ExprKind::Coalesce { lhs, rhs }
        | ExprKind::Elvis { lhs, rhs }
        | ExprKind::UserOp { lhs, rhs, .. } => {
            v.visit_expr(lhs);
            v.visit_expr(rhs);
        }
        ExprKind::Conditional { cond, then, otherwise } => {
            v.visit_expr(cond);
            v.visit_expr(then);
            v.visit_expr(otherwise);
        }
        ExprKind::Assign { target, value }
        | ExprKind::MaybeAssign { target, value }
        | ExprKind::CompoundAssign { target, value, .. } => {
            v.visit_expr(target);
            v.visit_expr(value);
        }
        ExprKind::Range { lo, hi, .. } => {
            v.visit_expr(lo);
            v.visit_expr(hi);
        }
        ExprKind::In { item, collection, .. } => {
            v.visit_expr(item);
            v.visit_expr(collection);
        }
        ExprKind::CheckMatch { subject, pattern } => {
            v.visit_expr(subject);
            v.visit_expr(pattern);
        }
        ExprKind::Call { callee, args } => {
            v.visit_expr(callee);
            walk_args(v, args);
        }
        ExprKind::MethodCall { object, args, .. } => {
            v.visit_expr(object);
            walk_args(v, args);
        }
        ExprKind::Member { object, .. } => v.visit_expr(object),
        ExprKind::DynMember { object, member } => {
            v.visit_expr(object);
            v.visit_expr(member);
        }
        ExprKind::Subscript { container, index } => {
            v.visit_expr(container);
            v.visit_expr(index);
        }
        ExprKind::Slice { e, i, j, k } => {
            v.visit_expr(e);
            walk_opt(v, i);
            walk_opt(v, j);
            walk_opt(v, k);
        }
        ExprKind::Function(f) => walk_fn(v, f),
        ExprKind::Match { subject, arms } => {
            v.visit_expr(subject);
            for arm in arms {
                v.visit_expr(&mut arm.pattern);
                if let Some(g) = &mut arm.guard {
                    v.visit_expr(g);
                }
                v.visit_expr(&mut arm.body);
            }
        }
        ExprKind::Template { body, holes } => {
            v.visit_expr(body);
            for h in holes {
                v.visit_expr(h);
            }
        }
        ExprKind::MacroInvocation { args, .. } => {
            for a in args {
                v.visit_expr(a);
            }
        }
        ExprKind::Yield(e) => walk_opt(v, e),
        ExprKind::With { defs, body } => {
            for d in defs {
                v.visit_stmt(d);
            }
            v.visit_stmt(body);
        }
        ExprKind::Statement(s) => v.visit_stmt(s),
        ExprKind::Cast { e, ty } => {
            v.visit_expr(e);
            v.visit_expr(ty);
        }
    }
}

/// Visits every child expression/statement of `s`.
pub fn walk_stmt<V: Visitor + ?Sized>(v: &mut V, s: &mut Stmt) {
    match &mut s.kind {
        StmtKind::Null
        | StmtKind::Halt
        | StmtKind::Next
        | StmtKind::Continue
        | StmtKind::Break { .. }
        | StmtKind::Import { .. }
        | StmtKind::Export(_)
        | StmtKind::Use { .. }
        | StmtKind::OperatorDef { .. } => {}
        StmtKind::Expression(e) | StmtKind::Defer(e) | StmtKind::Cleanup(e) => v.visit_expr(e),
        StmtKind::Definition { target, value, .. } => {
            v.visit_expr(target);
            v.visit_expr(value);
        }
        StmtKind::FunctionDef { f, .. } | StmtKind::FunMacroDef { f, .. } => v.visit_expr(f),
        StmtKind::MacroDef { body, .. } => v.visit_expr(body),
        StmtKind::TagDef(c) | StmtKind::ClassDef(c) => walk_class(v, c),
        StmtKind::TypeDef { ty, .. } => v.visit_expr(ty),
        StmtKind::For { init, cond, next, body } => {
            v.visit_stmt(init);
            if let Some(c) = cond {
                v.visit_expr(c);
            }
            if let Some(n) = next {
                v.visit_expr(n);
            }
            v.visit_stmt(body);
        }
        StmtKind::Each {
            target,
            iter,
            cond,
            stop,
            body,
        } => {
            v.visit_expr(target);
            v.visit_expr(iter);
            if let Some(c) = cond {
                v.visit_expr(c);
            }
            if let Some(st) = stop {
                v.visit_expr(st);
            }
            v.visit_stmt(body);
        }
        StmtKind::While { parts, body } => {
            for p in parts {
                if let Some(t) = &mut p.target {
                    v.visit_expr(t);
                }
                v.visit_expr(&mut p.expr);
            }
            v.visit_stmt(body);
        }
        StmtKind::WhileMatch { subject, pattern, body } => {
            v.visit_expr(subject);
            v.visit_expr(pattern);
            v.visit_stmt(body);
        }
        StmtKind::If {
            parts,
            then,
            otherwise,
            ..
        } => {
            for p in parts {
                if let Some(t) = &mut p.target {
                    v.visit_expr(t);
                }
                v.visit_expr(&mut p.expr);
            }
            v.visit_stmt(then);
            if let Some(o) = otherwise {
                v.visit_stmt(o);
            }
        }
        StmtKind::Match { subject, cases } => {
            v.visit_expr(subject);
            for case in cases {
                v.visit_expr(&mut case.pattern);
                if let Some(g) = &mut case.guard {
                    v.visit_expr(g);
                }
                v.visit_stmt(&mut case.body);
            }
        }
        StmtKind::Return(es) | StmtKind::GeneratorReturn(es) => {
            for e in es {
                v.visit_expr(e);
            }
        }
        StmtKind::Try { body, catches, finally } => {
            v.visit_stmt(body);
            for case in catches {
                v.visit_expr(&mut case.pattern);
                if let Some(g) = &mut case.guard {
                    v.visit_expr(g);
                }
                v.visit_stmt(&mut case.body);
            }
            if let Some(f) = finally {
                v.visit_stmt(f);
            }
        }
        StmtKind::Drop(es) => {
            for e in es {
                v.visit_expr(e);
            }
        }
        StmtKind::Block(ss) | StmtKind::Multi(ss) | StmtKind::NamespaceDef { body: ss, .. } => {
            for s in ss {
                v.visit_stmt(s);
            }
        }
        StmtKind::SetType { target, ty } => {
            v.visit_expr(target);
            v.visit_expr(ty);
        }
    }
}

/// Marks every span in the tree synthetic; applied to macro expansions.
pub struct MarkSynthetic;

impl Visitor for MarkSynthetic {
    fn visit_expr(&mut self, e: &mut Expr) {
        e.span.synthetic = true;
        walk_expr(self, e);
    }

    fn visit_stmt(&mut self, s: &mut Stmt) {
        s.span.synthetic = true;
        walk_stmt(self, s);
    }
}
