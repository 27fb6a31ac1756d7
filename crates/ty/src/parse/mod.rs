//! Pratt parser: tokens to AST.
//!
//! Prefix and infix parsing are driven by the token kind; every infix token
//! has a binding power, and user-defined operators get theirs from the
//! [`OperatorTable`] updated by `operator` directives. Context flags
//! (`NoEquals`, `NoIn`, …) suppress individual infix operators so argument
//! lists, loop headers, and type unions parse unambiguously.
//!
//! Macro expansion happens during parsing through a [`MacroHost`]: the host
//! (normally the compiler) evaluates macro bodies in a compile-time VM and
//! returns replacement AST, and fun-macros drive the parser through the
//! `parse_get_*` entry points. Preprocessor directives (`$if`, `$while`) are
//! evaluated through the same host; skipped tokens are marked hidden and the
//! token accessor steps over them.

pub mod pattern;

use crate::{
    ast::{
        Arg, Assoc, BinOp, ClassDef, ClassKind, CondPart, Expr, ExprKind, FieldDef, FnKind, FunctionExpr, IncDec,
        LogicOp, MatchArm, MatchCase, Param, SpecialPart, Stmt, StmtKind, UnOp,
    },
    diagnostics::{DiagResult, Diagnostic, ErrorKind},
    lex::{
        Lexer, LexPos,
        token::{Directive, Keyword, LexContext, SpecialStr, StrPart, Token, TokenKind},
    },
    location::{Location, Span, SrcId},
};

pub use self::pattern::{assignment_lvalue, definition_lvalue, patternize};

/// Result alias for parser entry points.
pub type ParseResult<T> = DiagResult<T>;

// Binding powers, loosest first. User operators land between comparison and
// range by default.
pub const PREC_ASSIGN: u8 = 1;
pub const PREC_ARROW: u8 = 2;
pub const PREC_TERNARY: u8 = 3;
pub const PREC_COALESCE: u8 = 4;
pub const PREC_KW_OR: u8 = 5;
pub const PREC_KW_AND: u8 = 6;
pub const PREC_VIEW: u8 = 7;
pub const PREC_OR: u8 = 8;
pub const PREC_AND: u8 = 9;
pub const PREC_IN: u8 = 10;
pub const PREC_EQ: u8 = 11;
pub const PREC_USER: u8 = 12;
pub const PREC_CMP: u8 = 13;
pub const PREC_RANGE: u8 = 14;
pub const PREC_BITOR: u8 = 15;
pub const PREC_BITXOR: u8 = 16;
pub const PREC_BITAND: u8 = 17;
pub const PREC_SHIFT: u8 = 18;
pub const PREC_ADD: u8 = 19;
pub const PREC_MUL: u8 = 20;
pub const PREC_CAST: u8 = 21;
pub const PREC_PREFIX: u8 = 22;
pub const PREC_POSTFIX: u8 = 23;

/// The process-wide user operator table: name to (precedence, associativity).
///
/// Updated only by `operator` directives between statements, so the table is
/// immutable within any single expression parse.
#[derive(Debug, Clone, Default)]
pub struct OperatorTable {
    entries: ahash::AHashMap<String, (u8, Assoc)>,
}

impl OperatorTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn define(&mut self, name: &str, prec: u8, assoc: Assoc) {
        self.entries.insert(name.to_string(), (prec, assoc));
    }

    /// Precedence and associativity of a user operator; undeclared operators
    /// default to [`PREC_USER`], left-associative.
    #[must_use]
    pub fn lookup(&self, name: &str) -> (u8, Assoc) {
        self.entries.get(name).copied().unwrap_or((PREC_USER, Assoc::Left))
    }
}

/// What kind of macro a name resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MacroKind {
    Template,
    Fun,
}

/// The parser's window into the compiler during parsing: macro resolution
/// and expansion, and compile-time evaluation for preprocessor directives.
pub trait MacroHost {
    /// Does `name` resolve to a macro in the current scope?
    fn macro_kind(&self, module: Option<&str>, name: &str) -> Option<MacroKind>;

    /// Expands a template macro invocation, returning the replacement
    /// expression.
    fn expand_macro(
        &mut self,
        p: &mut Parser<'_>,
        module: Option<&str>,
        name: &str,
        args: Vec<Expr>,
        span: Span,
    ) -> DiagResult<Expr>;

    /// Runs a fun-macro, which drives the parser itself through `p`.
    fn expand_fun_macro(&mut self, p: &mut Parser<'_>, module: Option<&str>, name: &str, span: Span)
    -> DiagResult<Expr>;

    /// Evaluates a preprocessor condition at compile time.
    fn eval_const_bool(&mut self, e: &Expr) -> DiagResult<bool>;
}

/// A host with no macros; used by parser unit tests and tooling.
#[derive(Debug, Default)]
pub struct NoMacros;

impl MacroHost for NoMacros {
    fn macro_kind(&self, _module: Option<&str>, _name: &str) -> Option<MacroKind> {
        None
    }

    fn expand_macro(
        &mut self,
        _p: &mut Parser<'_>,
        _module: Option<&str>,
        name: &str,
        _args: Vec<Expr>,
        span: Span,
    ) -> DiagResult<Expr> {
        Err(Diagnostic::new(ErrorKind::ParseError, span, format!("macro '{name}' cannot be expanded here")))
    }

    fn expand_fun_macro(
        &mut self,
        _p: &mut Parser<'_>,
        _module: Option<&str>,
        name: &str,
        span: Span,
    ) -> DiagResult<Expr> {
        Err(Diagnostic::new(ErrorKind::ParseError, span, format!("macro '{name}' cannot be expanded here")))
    }

    fn eval_const_bool(&mut self, e: &Expr) -> DiagResult<bool> {
        Err(Diagnostic::new(
            ErrorKind::ParseError,
            e.span,
            "preprocessor directives cannot be evaluated here",
        ))
    }
}

/// Collected holes of the template currently being parsed.
#[derive(Debug, Default)]
struct TemplateCtx {
    holes: Vec<Expr>,
}

/// A parser save-point; restoring rewinds the token cursor and mode flags.
#[derive(Debug, Clone, Copy)]
pub struct SavePoint {
    ti: usize,
    modes: Modes,
}

/// The boolean parse-mode flags, saved and restored as a unit.
#[derive(Debug, Clone, Copy, Default)]
struct Modes {
    no_equals: bool,
    no_in: bool,
    no_andor: bool,
    no_pipe: bool,
    no_constraint: bool,
    type_context: bool,
}

/// The parser over one module's source.
pub struct Parser<'s> {
    lexer: Lexer<'s>,
    srcid: SrcId,
    tokens: Vec<Token>,
    starts: Vec<LexPos>,
    ti: usize,
    modes: Modes,
    ops: OperatorTable,
    templates: Vec<TemplateCtx>,
    /// Collect diagnostics instead of failing, for IDE-style use.
    allow_errors: bool,
    errors: Vec<Diagnostic>,
    depth: u32,
}

const MAX_DEPTH: u32 = 256;

impl<'s> Parser<'s> {
    #[must_use]
    pub fn new(srcid: SrcId, src: &'s str, ops: OperatorTable) -> Self {
        Self {
            lexer: Lexer::new(srcid, src),
            srcid,
            tokens: Vec::new(),
            starts: Vec::new(),
            ti: 0,
            modes: Modes::default(),
            ops,
            templates: Vec::new(),
            allow_errors: false,
            errors: Vec::new(),
            depth: 0,
        }
    }

    /// Switches the parser into error-collecting mode: recoverable errors
    /// unwind to the statement boundary and parsing continues.
    pub fn set_allow_errors(&mut self, allow: bool) {
        self.allow_errors = allow;
    }

    /// Diagnostics collected in allow-errors mode.
    #[must_use]
    pub fn errors(&self) -> &[Diagnostic] {
        &self.errors
    }

    /// Takes the operator table back (it may have grown from `operator`
    /// directives).
    #[must_use]
    pub fn into_ops(self) -> OperatorTable {
        self.ops
    }

    // ------------------------------------------------------------------
    // Token plumbing.
    // ------------------------------------------------------------------

    fn pull(&mut self, ctx: LexContext) {
        let mark = self.lexer.mark();
        let tok = self.lexer.token(ctx);
        self.starts.push(mark);
        self.tokens.push(tok);
    }

    /// The token at `ti + n`, lexed in `ctx`. Re-lexes when the buffered
    /// token was produced in a different context (lexing is pure, so this is
    /// always consistent). Hidden tokens are skipped transparently.
    fn tok_at(&mut self, n: usize, ctx: LexContext) -> Token {
        // Skip hidden tokens at the cursor.
        while self.ti < self.tokens.len() && self.tokens[self.ti].hidden {
            self.ti += 1;
        }

        let mut idx = self.ti;
        let mut remaining = n;
        loop {
            if idx >= self.tokens.len() {
                let rewind = self.starts.get(idx).copied();
                if let Some(pos) = rewind {
                    self.lexer.rewind(pos);
                }
                self.pull(ctx);
            }
            if self.tokens[idx].hidden {
                idx += 1;
                continue;
            }
            if remaining == 0 {
                break;
            }
            remaining -= 1;
            idx += 1;
        }

        // Re-lex in the requested context when it differs.
        if self.tokens[idx].ctx != ctx && !matches!(self.tokens[idx].kind, TokenKind::End) {
            self.tokens.truncate(idx);
            self.starts.truncate(idx + 1);
            self.lexer.rewind(self.starts[idx]);
            self.starts.truncate(idx);
            self.pull(ctx);
        }

        self.tokens[idx].clone()
    }

    /// Current token (newlines skipped) in `ctx`.
    fn tok(&mut self, ctx: LexContext) -> Token {
        loop {
            let t = self.tok_at(0, ctx);
            if matches!(t.kind, TokenKind::Newline) {
                self.ti += 1;
                continue;
            }
            return t;
        }
    }

    /// Current token without newline skipping (directive/import ends).
    fn tok_nl(&mut self, ctx: LexContext) -> Token {
        self.tok_at(0, ctx)
    }

    /// Lookahead of one significant token.
    fn tok1(&mut self, ctx: LexContext) -> Token {
        let _ = self.tok(ctx);
        let mut n = 1;
        loop {
            let t = self.tok_at(n, ctx);
            if matches!(t.kind, TokenKind::Newline) {
                n += 1;
                continue;
            }
            return t;
        }
    }

    fn bump(&mut self) {
        // Advance over the current significant token (and any newlines or
        // hidden tokens before it).
        loop {
            if self.ti >= self.tokens.len() {
                return;
            }
            let t = &self.tokens[self.ti];
            if t.hidden || matches!(t.kind, TokenKind::Newline) {
                self.ti += 1;
                continue;
            }
            self.ti += 1;
            return;
        }
    }

    /// Consumes the current token when it matches `kind`.
    fn eat(&mut self, kind: &TokenKind, ctx: LexContext) -> bool {
        if self.tok(ctx).kind == *kind {
            self.bump();
            true
        } else {
            false
        }
    }

    fn eat_punct(&mut self, c: char, ctx: LexContext) -> bool {
        self.eat(&TokenKind::Punct(c), ctx)
    }

    fn eat_kw(&mut self, kw: Keyword) -> bool {
        self.eat(&TokenKind::Keyword(kw), LexContext::Prefix)
    }

    fn expect(&mut self, kind: &TokenKind, ctx: LexContext) -> ParseResult<Token> {
        let t = self.tok(ctx);
        if t.kind == *kind {
            self.bump();
            Ok(t)
        } else {
            Err(self.err_at(&t, format!("expected {kind} but found {}", t.kind)))
        }
    }

    fn expect_punct(&mut self, c: char, ctx: LexContext) -> ParseResult<Token> {
        self.expect(&TokenKind::Punct(c), ctx)
    }

    fn expect_kw(&mut self, kw: Keyword) -> ParseResult<Token> {
        self.expect(&TokenKind::Keyword(kw), LexContext::Prefix)
    }

    /// Consumes an identifier, returning `(module, name, span)`.
    fn expect_id(&mut self, ctx: LexContext) -> ParseResult<(Option<String>, String, Span)> {
        let t = self.tok(ctx);
        match t.kind {
            TokenKind::Id { module, name } => {
                self.bump();
                Ok((module, name, t.span))
            }
            _ => Err(self.err_at(&t, format!("expected identifier but found {}", t.kind))),
        }
    }

    fn err_at(&self, tok: &Token, msg: impl Into<String>) -> Diagnostic {
        let kind = if matches!(tok.kind, TokenKind::Error(_)) {
            ErrorKind::SyntaxError
        } else {
            ErrorKind::ParseError
        };
        let msg = match &tok.kind {
            TokenKind::Error(m) => m.clone(),
            _ => msg.into(),
        };
        Diagnostic::new(kind, tok.span, msg)
    }

    fn err(&self, span: Span, msg: impl Into<String>) -> Diagnostic {
        Diagnostic::new(ErrorKind::ParseError, span, msg)
    }

    /// Saves the parser state (token cursor and modes).
    #[must_use]
    pub fn save(&self) -> SavePoint {
        SavePoint {
            ti: self.ti,
            modes: self.modes,
        }
    }

    /// Restores a save-point created by [`Parser::save`].
    pub fn restore(&mut self, sp: SavePoint) {
        self.ti = sp.ti;
        self.modes = sp.modes;
    }

    fn with_modes<T>(&mut self, f: impl FnOnce(&mut Modes), body: impl FnOnce(&mut Self) -> ParseResult<T>) -> ParseResult<T> {
        let saved = self.modes;
        f(&mut self.modes);
        let r = body(self);
        self.modes = saved;
        r
    }

    fn span_from(&self, start: Span) -> Span {
        let end = self
            .ti
            .checked_sub(1)
            .and_then(|i| self.tokens.get(i))
            .map_or(start.end, |t| t.span.end);
        Span {
            src: self.srcid,
            start: start.start,
            end,
            synthetic: start.synthetic,
        }
    }

    // ------------------------------------------------------------------
    // Entry points.
    // ------------------------------------------------------------------

    /// Parses the whole module.
    pub fn parse_program(&mut self, host: &mut dyn MacroHost) -> ParseResult<Vec<Stmt>> {
        let mut stmts = Vec::new();
        loop {
            let t = self.tok(LexContext::Prefix);
            if matches!(t.kind, TokenKind::End) {
                break;
            }
            match self.parse_statement(host) {
                Ok(s) => {
                    if !matches!(s.kind, StmtKind::Null) {
                        stmts.push(s);
                    }
                }
                Err(diag) => {
                    if !self.allow_errors {
                        return Err(diag);
                    }
                    self.errors.push(diag);
                    self.synchronize();
                    stmts.push(Stmt::null(t.span));
                }
            }
        }
        Ok(stmts)
    }

    /// Skips tokens to a likely statement boundary after an error.
    fn synchronize(&mut self) {
        loop {
            let t = self.tok_nl(LexContext::Prefix);
            match t.kind {
                TokenKind::End => return,
                TokenKind::Punct(';' | '}') | TokenKind::Newline => {
                    self.bump_any();
                    return;
                }
                _ => self.bump_any(),
            }
        }
    }

    fn bump_any(&mut self) {
        if self.ti < self.tokens.len() {
            self.ti += 1;
        }
    }

    // ------------------------------------------------------------------
    // Macro-facing entry points (fun-macros drive the parser with these).
    // ------------------------------------------------------------------

    /// Parses one expression; exposed to fun-macros.
    pub fn parse_get_expr(&mut self, host: &mut dyn MacroHost) -> ParseResult<Expr> {
        self.parse_expr(0, host)
    }

    /// Parses one statement; exposed to fun-macros.
    pub fn parse_get_stmt(&mut self, host: &mut dyn MacroHost) -> ParseResult<Stmt> {
        self.parse_statement(host)
    }

    /// Parses a type expression; exposed to fun-macros.
    pub fn parse_get_type(&mut self, host: &mut dyn MacroHost) -> ParseResult<Expr> {
        self.with_modes(|m| m.type_context = true, |p| p.parse_expr(PREC_CMP, host))
    }

    /// The current token, for fun-macros inspecting the stream.
    pub fn parse_get_token(&mut self) -> Token {
        self.tok(LexContext::Prefix)
    }

    /// Advances over one token; exposed to fun-macros.
    pub fn parse_next(&mut self) {
        self.bump();
    }

    /// Fails the current parse with a message at the current token.
    pub fn parse_fail(&mut self, msg: &str) -> Diagnostic {
        let t = self.tok(LexContext::Prefix);
        self.err(t.span, msg.to_string())
    }

    // ------------------------------------------------------------------
    // Expressions.
    // ------------------------------------------------------------------

    /// Pratt expression parser: parses at binding powers above `min_prec`.
    pub fn parse_expr(&mut self, min_prec: u8, host: &mut dyn MacroHost) -> ParseResult<Expr> {
        let t = self.tok(LexContext::Prefix);
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            self.depth -= 1;
            return Err(self.err(t.span, "expression nesting too deep"));
        }
        let r = self.parse_expr_inner(min_prec, host);
        self.depth -= 1;
        r
    }

    fn parse_expr_inner(&mut self, min_prec: u8, host: &mut dyn MacroHost) -> ParseResult<Expr> {
        let mut lhs = self.parse_prefix(host)?;

        loop {
            let Some((prec, right)) = self.peek_infix() else {
                break;
            };
            if prec <= min_prec && !(right && prec == min_prec) {
                break;
            }
            lhs = self.parse_infix(lhs, prec, right, host)?;
        }

        Ok(lhs)
    }

    /// Binding power of the upcoming infix token, honoring mode flags.
    fn peek_infix(&mut self) -> Option<(u8, bool)> {
        let t = self.tok(LexContext::Infix);
        let m = self.modes;
        let info = match &t.kind {
            TokenKind::Punct('=') if !m.no_equals => (PREC_ASSIGN, true),
            TokenKind::MaybeEq if !m.no_equals => (PREC_ASSIGN, true),
            TokenKind::PlusEq | TokenKind::MinusEq | TokenKind::StarEq | TokenKind::DivEq | TokenKind::ModEq
                if !m.no_equals =>
            {
                (PREC_ASSIGN, true)
            }
            TokenKind::Arrow => (PREC_ARROW, true),
            TokenKind::Punct('?') => (PREC_TERNARY, true),
            TokenKind::Wtf | TokenKind::Elvis => (PREC_COALESCE, true),
            TokenKind::Keyword(Keyword::Or) if !m.no_andor => (PREC_KW_OR, false),
            TokenKind::Keyword(Keyword::And) if !m.no_andor => (PREC_KW_AND, false),
            TokenKind::SquigglyArrow | TokenKind::DollarSquigglyArrow => (PREC_VIEW, true),
            TokenKind::PipePipe => (PREC_OR, false),
            TokenKind::AmpAmp => (PREC_AND, false),
            TokenKind::Keyword(Keyword::In) if !m.no_in => (PREC_IN, false),
            TokenKind::Keyword(Keyword::Not) if !m.no_in => (PREC_IN, false),
            TokenKind::DblEq | TokenKind::NotEq | TokenKind::CheckMatch => (PREC_EQ, false),
            TokenKind::Punct('<' | '>') | TokenKind::Leq | TokenKind::Geq | TokenKind::Cmp => (PREC_CMP, false),
            TokenKind::DotDot | TokenKind::DotDotDot => (PREC_RANGE, false),
            TokenKind::Punct('|') if !m.no_pipe => (PREC_BITOR, false),
            TokenKind::Punct('^') => (PREC_BITXOR, false),
            TokenKind::Punct('&') => (PREC_BITAND, false),
            TokenKind::Shl | TokenKind::Shr => (PREC_SHIFT, false),
            TokenKind::Punct('+' | '-') => (PREC_ADD, false),
            TokenKind::Punct('*' | '/' | '%') => (PREC_MUL, false),
            TokenKind::Keyword(Keyword::As) => (PREC_CAST, false),
            TokenKind::Punct(':') if !m.no_constraint => (PREC_CAST, false),
            TokenKind::Punct('.') | TokenKind::DotMaybe | TokenKind::Punct('(') | TokenKind::Punct('[') => {
                (PREC_POSTFIX, false)
            }
            TokenKind::Inc | TokenKind::Dec => (PREC_POSTFIX, false),
            TokenKind::UserOp(name) => {
                let (p, a) = self.ops.lookup(name);
                (p, a == Assoc::Right)
            }
            _ => return None,
        };
        // `not` only begins an infix operator as part of `not in`.
        if matches!(t.kind, TokenKind::Keyword(Keyword::Not)) {
            let t1 = self.tok1(LexContext::Prefix);
            if !matches!(t1.kind, TokenKind::Keyword(Keyword::In)) {
                return None;
            }
        }
        Some(info)
    }

    fn parse_prefix(&mut self, host: &mut dyn MacroHost) -> ParseResult<Expr> {
        let t = self.tok(LexContext::Prefix);
        let span = t.span;
        match t.kind {
            TokenKind::Integer(k) => {
                self.bump();
                Ok(Expr::new(span, ExprKind::Integer(k)))
            }
            TokenKind::Real(x) => {
                self.bump();
                Ok(Expr::new(span, ExprKind::Real(x)))
            }
            TokenKind::Str(s) => {
                self.bump();
                Ok(Expr::new(span, ExprKind::Str(s)))
            }
            TokenKind::Special(special) => {
                self.bump();
                self.parse_special_string(special, span, host)
            }
            TokenKind::Regex(tok) => {
                self.bump();
                Ok(Expr::new(span, ExprKind::Regex { tok, binds: Vec::new() }))
            }
            TokenKind::Keyword(Keyword::True) => {
                self.bump();
                Ok(Expr::new(span, ExprKind::Boolean(true)))
            }
            TokenKind::Keyword(Keyword::False) => {
                self.bump();
                Ok(Expr::new(span, ExprKind::Boolean(false)))
            }
            TokenKind::Keyword(Keyword::Nil) => {
                self.bump();
                Ok(Expr::new(span, ExprKind::Nil))
            }
            TokenKind::Keyword(Keyword::Self_) => {
                self.bump();
                Ok(Expr::new(span, ExprKind::Self_))
            }
            TokenKind::Keyword(Keyword::Super) => {
                self.bump();
                Ok(Expr::new(span, ExprKind::Super))
            }
            TokenKind::Keyword(Keyword::Function | Keyword::Generator) => self.parse_function_literal(host),
            TokenKind::Keyword(Keyword::Match) => self.parse_match_expr(host),
            TokenKind::Keyword(Keyword::If) => {
                let s = self.parse_if_statement(host)?;
                Ok(Expr::new(self.span_from(span), ExprKind::Statement(Box::new(s))))
            }
            TokenKind::Keyword(Keyword::Do) => {
                self.bump();
                let block = self.parse_block(host)?;
                Ok(Expr::new(self.span_from(span), ExprKind::Statement(Box::new(block))))
            }
            TokenKind::Keyword(Keyword::Throw) => {
                self.bump();
                let e = self.parse_expr(PREC_ASSIGN, host)?;
                Ok(Expr::new(self.span_from(span), ExprKind::Throw(Box::new(e))))
            }
            TokenKind::Keyword(Keyword::Yield) => {
                self.bump();
                let t = self.tok(LexContext::Prefix);
                let value = if matches!(t.kind, TokenKind::Punct(';' | ')' | '}' | ']') | TokenKind::End) {
                    None
                } else {
                    Some(Box::new(self.parse_expr(PREC_ASSIGN, host)?))
                };
                Ok(Expr::new(self.span_from(span), ExprKind::Yield(value)))
            }
            TokenKind::Keyword(Keyword::Eval) => {
                self.bump();
                self.expect_punct('(', LexContext::Prefix)?;
                let e = self.parse_expr(0, host)?;
                self.expect_punct(')', LexContext::Infix)?;
                Ok(Expr::new(self.span_from(span), ExprKind::Eval(Box::new(e))))
            }
            TokenKind::Keyword(Keyword::Typeof) => {
                self.bump();
                self.expect_punct('(', LexContext::Prefix)?;
                let e = self.parse_expr(0, host)?;
                self.expect_punct(')', LexContext::Infix)?;
                Ok(Expr::new(self.span_from(span), ExprKind::TypeOf(Box::new(e))))
            }
            TokenKind::Keyword(Keyword::Defined) => {
                self.bump();
                self.expect_punct('(', LexContext::Prefix)?;
                let (module, name, _) = self.expect_id(LexContext::Prefix)?;
                self.expect_punct(')', LexContext::Infix)?;
                Ok(Expr::new(self.span_from(span), ExprKind::Defined { module, name }))
            }
            TokenKind::Keyword(Keyword::With) => self.parse_with_expr(host),
            TokenKind::Keyword(Keyword::Not) => {
                self.bump();
                let e = self.parse_expr(PREC_KW_AND, host)?;
                Ok(Expr::new(
                    self.span_from(span),
                    ExprKind::Unary {
                        op: UnOp::Not,
                        operand: Box::new(e),
                    },
                ))
            }
            TokenKind::Id { module, name } => {
                self.bump();
                // Macro invocation? Expand during parsing.
                match host.macro_kind(module.as_deref(), &name) {
                    Some(MacroKind::Template) => {
                        let args = if self.tok(LexContext::Infix).kind == TokenKind::Punct('(') {
                            self.bump();
                            self.parse_macro_args(host)?
                        } else {
                            Vec::new()
                        };
                        host.expand_macro(self, module.as_deref(), &name, args, span)
                    }
                    Some(MacroKind::Fun) => host.expand_fun_macro(self, module.as_deref(), &name, span),
                    None => Ok(Expr::new(span, ExprKind::Ident { module, name, sym: None })),
                }
            }
            TokenKind::Punct('(') => self.parse_paren(host),
            TokenKind::Punct('[') => self.parse_array(host),
            TokenKind::Punct('{') => {
                let block = self.parse_block(host)?;
                Ok(Expr::new(self.span_from(span), ExprKind::Statement(Box::new(block))))
            }
            TokenKind::Punct('%') => {
                self.bump();
                self.expect_punct('{', LexContext::Prefix)?;
                self.parse_dict(span, host)
            }
            TokenKind::Punct('-') => {
                self.bump();
                let e = self.parse_expr(PREC_PREFIX, host)?;
                Ok(Expr::new(
                    self.span_from(span),
                    ExprKind::Unary {
                        op: UnOp::Neg,
                        operand: Box::new(e),
                    },
                ))
            }
            TokenKind::Punct('!') => {
                self.bump();
                let e = self.parse_expr(PREC_PREFIX, host)?;
                Ok(Expr::new(
                    self.span_from(span),
                    ExprKind::Unary {
                        op: UnOp::Not,
                        operand: Box::new(e),
                    },
                ))
            }
            TokenKind::Punct('#') => {
                self.bump();
                let e = self.parse_expr(PREC_PREFIX, host)?;
                Ok(Expr::new(
                    self.span_from(span),
                    ExprKind::Unary {
                        op: UnOp::Count,
                        operand: Box::new(e),
                    },
                ))
            }
            TokenKind::Punct('&') => {
                // Implicit function: `&it.name` is `it -> it.name`.
                self.bump();
                let body = self.parse_expr(PREC_PREFIX, host)?;
                let body_span = body.span;
                Ok(Expr::new(
                    self.span_from(span),
                    ExprKind::Function(Box::new(FunctionExpr {
                        name: None,
                        kind: FnKind::Implicit,
                        params: vec![Param {
                            name: "it".to_string(),
                            default: None,
                            constraint: None,
                            span,
                            sym: None,
                        }],
                        rest: None,
                        kwargs: None,
                        body: Box::new(Stmt::new(body_span, StmtKind::Return(vec![body]))),
                        decorators: Vec::new(),
                        return_type: None,
                        type_params: Vec::new(),
                        where_clauses: Vec::new(),
                        self_sym: None,
                    scope: None,
                    })),
                ))
            }
            TokenKind::Punct('*') => {
                self.bump();
                let e = self.parse_expr(PREC_PREFIX, host)?;
                Ok(Expr::new(self.span_from(span), ExprKind::Spread(Box::new(e))))
            }
            TokenKind::Punct('^') => {
                self.bump();
                let (_, name, _) = self.expect_id(LexContext::Prefix)?;
                Ok(Expr::new(self.span_from(span), ExprKind::ResourceBinding { name, sym: None }))
            }
            TokenKind::Punct('@') => {
                self.bump();
                let t = self.tok(LexContext::Name);
                if let TokenKind::Id { name, .. } = t.kind {
                    self.bump();
                    Ok(Expr::new(
                        self.span_from(span),
                        ExprKind::Member {
                            object: Box::new(Expr::new(span, ExprKind::Self_)),
                            member: name,
                            maybe: false,
                        },
                    ))
                } else {
                    Err(self.err_at(&t, "expected member name after '@'"))
                }
            }
            TokenKind::Punct('$') => self.parse_dollar(span, host),
            TokenKind::Inc | TokenKind::Dec => {
                let op = if matches!(t.kind, TokenKind::Inc) { IncDec::PreInc } else { IncDec::PreDec };
                self.bump();
                let target = self.parse_expr(PREC_PREFIX, host)?;
                Ok(Expr::new(
                    self.span_from(span),
                    ExprKind::IncDec {
                        op,
                        target: Box::new(target),
                    },
                ))
            }
            TokenKind::Error(_) => Err(self.err_at(&t, "")),
            _ => Err(self.err_at(&t, format!("unexpected {} in expression", t.kind))),
        }
    }

    /// `$x` (match-not-nil), `$[ … ]` (template), and template holes
    /// `$(e)` / `${e}` / `$:t` / `$!e`.
    fn parse_dollar(&mut self, span: Span, host: &mut dyn MacroHost) -> ParseResult<Expr> {
        self.bump();
        let t = self.tok_nl(LexContext::Prefix);
        match &t.kind {
            TokenKind::Id { module: None, .. } => {
                let (_, name, _) = self.expect_id(LexContext::Prefix)?;
                Ok(Expr::new(self.span_from(span), ExprKind::MatchNotNil { name, sym: None }))
            }
            TokenKind::Punct('[') => {
                self.bump();
                self.parse_template(span, host)
            }
            TokenKind::Punct('(') if !self.templates.is_empty() => {
                self.bump();
                let hole = self.parse_expr(0, host)?;
                self.expect_punct(')', LexContext::Infix)?;
                let i = self.push_hole(hole, span)?;
                Ok(Expr::new(self.span_from(span), ExprKind::TemplateHole(i)))
            }
            TokenKind::Punct('{') if !self.templates.is_empty() => {
                self.bump();
                let hole = self.parse_expr(0, host)?;
                self.expect_punct('}', LexContext::Infix)?;
                let i = self.push_hole(hole, span)?;
                Ok(Expr::new(self.span_from(span), ExprKind::TemplateVHole(i)))
            }
            TokenKind::Punct(':') if !self.templates.is_empty() => {
                self.bump();
                let hole = self.with_modes(|m| m.type_context = true, |p| p.parse_expr(PREC_PREFIX, host))?;
                let i = self.push_hole(hole, span)?;
                Ok(Expr::new(self.span_from(span), ExprKind::TemplateTHole(i)))
            }
            TokenKind::Punct('!') if !self.templates.is_empty() => {
                self.bump();
                let hole = self.parse_expr(PREC_PREFIX, host)?;
                let i = self.push_hole(hole, span)?;
                Ok(Expr::new(self.span_from(span), ExprKind::TemplateXHole(i)))
            }
            _ => Err(self.err_at(&t, "expected identifier or template after '$'")),
        }
    }

    fn push_hole(&mut self, hole: Expr, span: Span) -> ParseResult<u32> {
        let Some(tpl) = self.templates.last_mut() else {
            return Err(self.err(span, "template hole outside of a template"));
        };
        tpl.holes.push(hole);
        Ok(u32::try_from(tpl.holes.len() - 1).expect("hole count exceeds u32"))
    }

    /// `$[ stmts ]`: a quoted template.
    fn parse_template(&mut self, span: Span, host: &mut dyn MacroHost) -> ParseResult<Expr> {
        self.templates.push(TemplateCtx::default());
        let mut stmts = Vec::new();
        let result = loop {
            let t = self.tok(LexContext::Prefix);
            match t.kind {
                TokenKind::Punct(']') => {
                    self.bump();
                    break Ok(());
                }
                TokenKind::End => break Err(self.err_at(&t, "unterminated template")),
                _ => match self.parse_statement(host) {
                    Ok(s) => stmts.push(s),
                    Err(e) => break Err(e),
                },
            }
        };
        let tpl = self.templates.pop().expect("template context pushed above");
        result?;

        let full = self.span_from(span);
        let body = if stmts.len() == 1
            && let StmtKind::Expression(_) = &stmts[0].kind
        {
            let Some(Stmt {
                kind: StmtKind::Expression(e),
                ..
            }) = stmts.pop()
            else {
                unreachable!("checked above");
            };
            e
        } else {
            Expr::new(full, ExprKind::Statement(Box::new(Stmt::new(full, StmtKind::Multi(stmts)))))
        };

        Ok(Expr::new(
            full,
            ExprKind::Template {
                body: Box::new(body),
                holes: tpl.holes,
            },
        ))
    }

    fn parse_special_string(&mut self, special: SpecialStr, span: Span, host: &mut dyn MacroHost) -> ParseResult<Expr> {
        let mut parts = Vec::new();
        for part in special.parts {
            match part {
                StrPart::Lit(s) => parts.push(SpecialPart::Lit(s)),
                StrPart::Expr { text, start, fmt } => {
                    let expr = self.parse_embedded_expr(&text, start, host)?;
                    parts.push(SpecialPart::Interp {
                        expr: Box::new(expr),
                        fmt: fmt.map(|(s, _)| s),
                    });
                }
            }
        }
        if parts.len() == 1
            && let SpecialPart::Lit(_) = &parts[0]
        {
            let Some(SpecialPart::Lit(s)) = parts.pop() else {
                unreachable!("checked above");
            };
            return Ok(Expr::new(span, ExprKind::Str(s)));
        }
        Ok(Expr::new(span, ExprKind::Special(parts)))
    }

    /// Parses an interpolated-expression fragment with a sub-parser sharing
    /// the operator table, so spans keep pointing into the real buffer.
    fn parse_embedded_expr(&mut self, text: &str, start: Location, host: &mut dyn MacroHost) -> ParseResult<Expr> {
        let mut sub = Parser::new(self.srcid, text, self.ops.clone());
        // Positions inside the fragment are relative; shift them to the
        // enclosing buffer.
        let e = sub.parse_expr(0, host)?;
        let t = sub.tok(LexContext::Infix);
        if !matches!(t.kind, TokenKind::End) {
            return Err(sub.err_at(&t, format!("unexpected {} in interpolated expression", t.kind)));
        }
        Ok(shift_expr(e, start))
    }

    fn parse_macro_args(&mut self, host: &mut dyn MacroHost) -> ParseResult<Vec<Expr>> {
        let mut args = Vec::new();
        if self.eat_punct(')', LexContext::Infix) {
            return Ok(args);
        }
        loop {
            args.push(self.with_modes(|m| m.no_equals = true, |p| p.parse_expr(PREC_ASSIGN, host))?);
            if self.eat_punct(',', LexContext::Infix) {
                continue;
            }
            self.expect_punct(')', LexContext::Infix)?;
            break;
        }
        Ok(args)
    }

    fn parse_infix(&mut self, lhs: Expr, prec: u8, _right: bool, host: &mut dyn MacroHost) -> ParseResult<Expr> {
        let t = self.tok(LexContext::Infix);
        let start = lhs.span;
        match t.kind {
            TokenKind::Punct('=') => {
                self.bump();
                let value = self.parse_expr(PREC_ASSIGN - 1, host)?;
                let target = assignment_lvalue(lhs)?;
                Ok(Expr::new(
                    self.span_from(start),
                    ExprKind::Assign {
                        target: Box::new(target),
                        value: Box::new(value),
                    },
                ))
            }
            TokenKind::MaybeEq => {
                self.bump();
                let value = self.parse_expr(PREC_ASSIGN - 1, host)?;
                let target = assignment_lvalue(lhs)?;
                Ok(Expr::new(
                    self.span_from(start),
                    ExprKind::MaybeAssign {
                        target: Box::new(target),
                        value: Box::new(value),
                    },
                ))
            }
            TokenKind::PlusEq | TokenKind::MinusEq | TokenKind::StarEq | TokenKind::DivEq | TokenKind::ModEq => {
                let op = match t.kind {
                    TokenKind::PlusEq => BinOp::Add,
                    TokenKind::MinusEq => BinOp::Sub,
                    TokenKind::StarEq => BinOp::Mul,
                    TokenKind::DivEq => BinOp::Div,
                    _ => BinOp::Mod,
                };
                self.bump();
                let value = self.parse_expr(PREC_ASSIGN - 1, host)?;
                let target = assignment_lvalue(lhs)?;
                Ok(Expr::new(
                    self.span_from(start),
                    ExprKind::CompoundAssign {
                        op,
                        target: Box::new(target),
                        value: Box::new(value),
                    },
                ))
            }
            TokenKind::Arrow => {
                self.bump();
                self.parse_arrow_function(lhs, host)
            }
            TokenKind::Punct('?') => {
                self.bump();
                // The branch before ':' must not eat it as a constraint.
                let then = self.with_modes(|m| m.no_constraint = true, |p| p.parse_expr(PREC_TERNARY - 1, host))?;
                self.expect_punct(':', LexContext::Infix)?;
                let otherwise = self.parse_expr(PREC_TERNARY - 1, host)?;
                Ok(Expr::new(
                    self.span_from(start),
                    ExprKind::Conditional {
                        cond: Box::new(lhs),
                        then: Box::new(then),
                        otherwise: Box::new(otherwise),
                    },
                ))
            }
            TokenKind::Wtf => {
                self.bump();
                let rhs = self.parse_expr(PREC_COALESCE - 1, host)?;
                Ok(Expr::new(
                    self.span_from(start),
                    ExprKind::Coalesce {
                        lhs: Box::new(lhs),
                        rhs: Box::new(rhs),
                    },
                ))
            }
            TokenKind::Elvis => {
                self.bump();
                let rhs = self.parse_expr(PREC_COALESCE - 1, host)?;
                Ok(Expr::new(
                    self.span_from(start),
                    ExprKind::Elvis {
                        lhs: Box::new(lhs),
                        rhs: Box::new(rhs),
                    },
                ))
            }
            TokenKind::Keyword(Keyword::Or) | TokenKind::PipePipe => {
                self.bump();
                let rhs = self.parse_expr(prec, host)?;
                Ok(Expr::new(
                    self.span_from(start),
                    ExprKind::Logic {
                        op: LogicOp::Or,
                        lhs: Box::new(lhs),
                        rhs: Box::new(rhs),
                    },
                ))
            }
            TokenKind::Keyword(Keyword::And) | TokenKind::AmpAmp => {
                self.bump();
                let rhs = self.parse_expr(prec, host)?;
                Ok(Expr::new(
                    self.span_from(start),
                    ExprKind::Logic {
                        op: LogicOp::And,
                        lhs: Box::new(lhs),
                        rhs: Box::new(rhs),
                    },
                ))
            }
            TokenKind::SquigglyArrow => {
                self.bump();
                let pat = self.parse_expr(PREC_VIEW - 1, host)?;
                Ok(Expr::new(
                    self.span_from(start),
                    ExprKind::View {
                        f: Box::new(lhs),
                        pat: Box::new(pat),
                    },
                ))
            }
            TokenKind::DollarSquigglyArrow => {
                self.bump();
                let pat = self.parse_expr(PREC_VIEW - 1, host)?;
                Ok(Expr::new(
                    self.span_from(start),
                    ExprKind::NotNilView {
                        f: Box::new(lhs),
                        pat: Box::new(pat),
                    },
                ))
            }
            TokenKind::Keyword(Keyword::In) => {
                self.bump();
                let rhs = self.parse_expr(prec, host)?;
                Ok(Expr::new(
                    self.span_from(start),
                    ExprKind::In {
                        item: Box::new(lhs),
                        collection: Box::new(rhs),
                        negated: false,
                    },
                ))
            }
            TokenKind::Keyword(Keyword::Not) => {
                self.bump();
                self.expect_kw(Keyword::In)?;
                let rhs = self.parse_expr(prec, host)?;
                Ok(Expr::new(
                    self.span_from(start),
                    ExprKind::In {
                        item: Box::new(lhs),
                        collection: Box::new(rhs),
                        negated: true,
                    },
                ))
            }
            TokenKind::CheckMatch => {
                self.bump();
                let pat = self.with_modes(|m| m.no_equals = true, |p| p.parse_expr(PREC_EQ, host))?;
                Ok(Expr::new(
                    self.span_from(start),
                    ExprKind::CheckMatch {
                        subject: Box::new(lhs),
                        pattern: Box::new(patternize(pat)),
                    },
                ))
            }
            TokenKind::DotDot | TokenKind::DotDotDot => {
                let inclusive = matches!(t.kind, TokenKind::DotDotDot);
                self.bump();
                let hi = self.parse_expr(PREC_RANGE, host)?;
                Ok(Expr::new(
                    self.span_from(start),
                    ExprKind::Range {
                        lo: Box::new(lhs),
                        hi: Box::new(hi),
                        inclusive,
                    },
                ))
            }
            TokenKind::Keyword(Keyword::As) => {
                self.bump();
                let ty = self.with_modes(|m| m.type_context = true, |p| p.parse_expr(PREC_CAST, host))?;
                Ok(Expr::new(
                    self.span_from(start),
                    ExprKind::Cast {
                        e: Box::new(lhs),
                        ty: Box::new(ty),
                    },
                ))
            }
            TokenKind::Punct(':') => {
                self.bump();
                let ty = self.with_modes(|m| m.type_context = true, |p| p.parse_expr(PREC_CAST, host))?;
                Ok(Expr::new(
                    self.span_from(start),
                    ExprKind::Cast {
                        e: Box::new(lhs),
                        ty: Box::new(ty),
                    },
                ))
            }
            TokenKind::Punct('.') | TokenKind::DotMaybe => {
                let maybe = matches!(t.kind, TokenKind::DotMaybe);
                self.bump();
                self.parse_member(lhs, maybe, host)
            }
            TokenKind::Punct('(') => {
                self.bump();
                let args = self.parse_call_args(host)?;
                Ok(Expr::new(
                    self.span_from(start),
                    ExprKind::Call {
                        callee: Box::new(lhs),
                        args,
                    },
                ))
            }
            TokenKind::Punct('[') => {
                self.bump();
                self.parse_subscript(lhs, host)
            }
            TokenKind::Inc | TokenKind::Dec => {
                let op = if matches!(t.kind, TokenKind::Inc) { IncDec::PostInc } else { IncDec::PostDec };
                self.bump();
                Ok(Expr::new(
                    self.span_from(start),
                    ExprKind::IncDec {
                        op,
                        target: Box::new(lhs),
                    },
                ))
            }
            TokenKind::UserOp(name) => {
                self.bump();
                let (p, assoc) = self.ops.lookup(&name);
                let rhs = self.parse_expr(if assoc == Assoc::Right { p - 1 } else { p }, host)?;
                Ok(Expr::new(
                    self.span_from(start),
                    ExprKind::UserOp {
                        name,
                        lhs: Box::new(lhs),
                        rhs: Box::new(rhs),
                        sym: None,
                    },
                ))
            }
            _ => {
                let op = match t.kind {
                    TokenKind::DblEq => BinOp::Eq,
                    TokenKind::NotEq => BinOp::NotEq,
                    TokenKind::Punct('<') => BinOp::Lt,
                    TokenKind::Punct('>') => BinOp::Gt,
                    TokenKind::Leq => BinOp::Leq,
                    TokenKind::Geq => BinOp::Geq,
                    TokenKind::Cmp => BinOp::Cmp,
                    TokenKind::Punct('|') => BinOp::BitOr,
                    TokenKind::Punct('^') => BinOp::BitXor,
                    TokenKind::Punct('&') => BinOp::BitAnd,
                    TokenKind::Shl => BinOp::Shl,
                    TokenKind::Shr => BinOp::Shr,
                    TokenKind::Punct('+') => BinOp::Add,
                    TokenKind::Punct('-') => BinOp::Sub,
                    TokenKind::Punct('*') => BinOp::Mul,
                    TokenKind::Punct('/') => BinOp::Div,
                    TokenKind::Punct('%') => BinOp::Mod,
                    _ => return Err(self.err_at(&t, format!("unexpected {} in expression", t.kind))),
                };
                self.bump();
                let rhs = self.parse_expr(prec, host)?;
                Ok(Expr::new(
                    self.span_from(start),
                    ExprKind::Binary {
                        op,
                        lhs: Box::new(lhs),
                        rhs: Box::new(rhs),
                    },
                ))
            }
        }
    }

    /// After `.` or `.?`: member access or method call.
    fn parse_member(&mut self, object: Expr, maybe: bool, host: &mut dyn MacroHost) -> ParseResult<Expr> {
        let start = object.span;
        let t = self.tok(LexContext::Name);
        match t.kind {
            TokenKind::Id { module: None, name } => {
                self.bump();
                if self.tok(LexContext::Infix).kind == TokenKind::Punct('(') {
                    self.bump();
                    let args = self.parse_call_args(host)?;
                    Ok(Expr::new(
                        self.span_from(start),
                        ExprKind::MethodCall {
                            object: Box::new(object),
                            maybe,
                            method: name,
                            args,
                        },
                    ))
                } else {
                    Ok(Expr::new(
                        self.span_from(start),
                        ExprKind::Member {
                            object: Box::new(object),
                            member: name,
                            maybe,
                        },
                    ))
                }
            }
            // Dynamic member access: `obj.(expr)`.
            TokenKind::Punct('(') => {
                self.bump();
                let member = self.parse_expr(0, host)?;
                self.expect_punct(')', LexContext::Infix)?;
                Ok(Expr::new(
                    self.span_from(start),
                    ExprKind::DynMember {
                        object: Box::new(object),
                        member: Box::new(member),
                    },
                ))
            }
            _ => Err(self.err_at(&t, "expected member name after '.'")),
        }
    }

    /// `e[i]` subscript or `e[i;j;k]` slice.
    fn parse_subscript(&mut self, container: Expr, host: &mut dyn MacroHost) -> ParseResult<Expr> {
        let start = container.span;
        let mut parts: Vec<Option<Expr>> = Vec::new();
        let mut cur: Option<Expr> = None;
        loop {
            let t = self.tok(LexContext::Prefix);
            match t.kind {
                TokenKind::Punct(']') => {
                    self.bump();
                    parts.push(cur.take());
                    break;
                }
                TokenKind::Punct(';') => {
                    self.bump();
                    parts.push(cur.take());
                }
                _ => {
                    if cur.is_some() {
                        return Err(self.err_at(&t, "expected ';' or ']' in subscript"));
                    }
                    cur = Some(self.parse_expr(0, host)?);
                }
            }
        }

        if parts.len() == 1 {
            let Some(index) = parts.pop().flatten() else {
                return Err(self.err(self.span_from(start), "empty subscript"));
            };
            return Ok(Expr::new(
                self.span_from(start),
                ExprKind::Subscript {
                    container: Box::new(container),
                    index: Box::new(index),
                },
            ));
        }

        let mut it = parts.into_iter();
        Ok(Expr::new(
            self.span_from(start),
            ExprKind::Slice {
                e: Box::new(container),
                i: it.next().flatten().map(Box::new),
                j: it.next().flatten().map(Box::new),
                k: it.next().flatten().map(Box::new),
            },
        ))
    }

    /// Call argument list after `(`: positional, `name: value` kwargs,
    /// `*spread`, per-argument `if` conditions.
    fn parse_call_args(&mut self, host: &mut dyn MacroHost) -> ParseResult<Vec<Arg>> {
        let mut args = Vec::new();
        if self.eat_punct(')', LexContext::Infix) {
            return Ok(args);
        }
        loop {
            let t = self.tok(LexContext::Prefix);
            let mut name = None;
            // `name: value` keyword argument.
            if let TokenKind::Id { module: None, name: n } = &t.kind
                && self.tok1(LexContext::Infix).kind == TokenKind::Punct(':')
            {
                name = Some(n.clone());
                self.bump();
                self.bump();
            }

            let spread = name.is_none() && self.tok(LexContext::Prefix).kind == TokenKind::Punct('*');
            let value = self.with_modes(
                |m| {
                    m.no_equals = true;
                    m.no_constraint = true;
                },
                |p| p.parse_expr(PREC_ASSIGN, host),
            )?;
            let (value, spread) = match (spread, value) {
                (
                    true,
                    Expr {
                        kind: ExprKind::Spread(inner),
                        ..
                    },
                ) => (*inner, true),
                (_, v) => (v, false),
            };

            let cond = if self.eat(&TokenKind::Keyword(Keyword::If), LexContext::Infix) {
                Some(self.with_modes(|m| m.no_equals = true, |p| p.parse_expr(PREC_ASSIGN, host))?)
            } else {
                None
            };

            args.push(Arg {
                value,
                name,
                spread,
                cond,
            });

            if self.eat_punct(',', LexContext::Infix) {
                continue;
            }
            self.expect_punct(')', LexContext::Infix)?;
            break;
        }
        Ok(args)
    }

    /// `( … )`: unit, group, or tuple (possibly with per-slot names).
    fn parse_paren(&mut self, host: &mut dyn MacroHost) -> ParseResult<Expr> {
        let open = self.tok(LexContext::Prefix);
        self.bump();

        if self.eat_punct(')', LexContext::Infix) {
            return Ok(Expr::new(
                self.span_from(open.span),
                ExprKind::Tuple {
                    items: Vec::new(),
                    names: Vec::new(),
                    conds: Vec::new(),
                    required: Vec::new(),
                },
            ));
        }

        let mut items = Vec::new();
        let mut names: Vec<Option<String>> = Vec::new();
        let mut conds: Vec<Option<Expr>> = Vec::new();
        let mut required = Vec::new();
        let mut saw_comma = false;
        let mut saw_name = false;

        loop {
            let t = self.tok(LexContext::Prefix);
            let mut name = None;
            if let TokenKind::Id { module: None, name: n } = &t.kind
                && self.tok1(LexContext::Infix).kind == TokenKind::Punct(':')
            {
                name = Some(n.clone());
                saw_name = true;
                self.bump();
                self.bump();
            }

            // `?name: value` marks the slot optional in tuple patterns.
            let req = !matches!(t.kind, TokenKind::Punct('?'));

            let value = self.with_modes(|m| m.no_constraint = false, |p| p.parse_expr(0, host))?;
            let cond = if self.eat(&TokenKind::Keyword(Keyword::If), LexContext::Infix) {
                Some(self.with_modes(|m| m.no_equals = true, |p| p.parse_expr(PREC_ASSIGN, host))?)
            } else {
                None
            };

            items.push(value);
            names.push(name);
            conds.push(cond);
            required.push(req);

            if self.eat_punct(',', LexContext::Infix) {
                saw_comma = true;
                if self.tok(LexContext::Infix).kind == TokenKind::Punct(')') {
                    self.bump();
                    break;
                }
                continue;
            }
            self.expect_punct(')', LexContext::Infix)?;
            break;
        }

        if !saw_comma && !saw_name && items.len() == 1 {
            let Some(only) = items.pop() else {
                unreachable!("one item checked above");
            };
            return Ok(only);
        }

        Ok(Expr::new(
            self.span_from(open.span),
            ExprKind::Tuple {
                items,
                names,
                conds,
                required,
            },
        ))
    }

    /// `[ … ]`: array literal or comprehension.
    fn parse_array(&mut self, host: &mut dyn MacroHost) -> ParseResult<Expr> {
        let open = self.tok(LexContext::Prefix);
        self.bump();

        if self.eat_punct(']', LexContext::Infix) {
            return Ok(Expr::new(
                self.span_from(open.span),
                ExprKind::Array {
                    elems: Vec::new(),
                    conds: Vec::new(),
                },
            ));
        }

        let first = self.with_modes(|m| m.no_in = false, |p| p.parse_expr(0, host))?;

        // `[expr for pat in iter if cond]` comprehension.
        if self.eat(&TokenKind::Keyword(Keyword::For), LexContext::Infix) {
            let pat = self.with_modes(|m| m.no_in = true, |p| p.parse_expr(PREC_IN, host))?;
            self.expect_kw(Keyword::In)?;
            let iter = self.parse_expr(0, host)?;
            let cond = if self.eat(&TokenKind::Keyword(Keyword::If), LexContext::Infix) {
                Some(Box::new(self.parse_expr(0, host)?))
            } else {
                None
            };
            self.expect_punct(']', LexContext::Infix)?;
            return Ok(Expr::new(
                self.span_from(open.span),
                ExprKind::ArrayCompr {
                    elem: Box::new(first),
                    pattern: Box::new(patternize(pat)),
                    iter: Box::new(iter),
                    cond,
                },
            ));
        }

        let mut elems = vec![first];
        let mut conds: Vec<Option<Expr>> = Vec::new();
        conds.push(if self.eat(&TokenKind::Keyword(Keyword::If), LexContext::Infix) {
            Some(self.parse_expr(0, host)?)
        } else {
            None
        });

        while self.eat_punct(',', LexContext::Infix) {
            if self.tok(LexContext::Infix).kind == TokenKind::Punct(']') {
                break;
            }
            elems.push(self.parse_expr(0, host)?);
            conds.push(if self.eat(&TokenKind::Keyword(Keyword::If), LexContext::Infix) {
                Some(self.parse_expr(0, host)?)
            } else {
                None
            });
        }
        self.expect_punct(']', LexContext::Infix)?;

        Ok(Expr::new(self.span_from(open.span), ExprKind::Array { elems, conds }))
    }

    /// After `%{`: dict literal or comprehension. A `*: expr` entry sets the
    /// dict's default value.
    fn parse_dict(&mut self, start: Span, host: &mut dyn MacroHost) -> ParseResult<Expr> {
        let mut keys = Vec::new();
        let mut values = Vec::new();
        let mut conds: Vec<Option<Expr>> = Vec::new();
        let mut dflt: Option<Box<Expr>> = None;

        if self.eat_punct('}', LexContext::Infix) {
            return Ok(Expr::new(
                self.span_from(start),
                ExprKind::Dict {
                    keys,
                    values,
                    conds,
                    dflt,
                },
            ));
        }

        let mut first = true;
        loop {
            if self.tok(LexContext::Prefix).kind == TokenKind::Punct('*') {
                // Default entry: `*: expr`.
                self.bump();
                self.expect_punct(':', LexContext::Infix)?;
                dflt = Some(Box::new(self.parse_expr(0, host)?));
            } else {
                let key = self.with_modes(|m| m.no_constraint = true, |p| p.parse_expr(0, host))?;
                self.expect_punct(':', LexContext::Infix)?;
                let value = self.parse_expr(0, host)?;

                // `%{k: v for pat in iter}` comprehension.
                if first && self.eat(&TokenKind::Keyword(Keyword::For), LexContext::Infix) {
                    let pat = self.with_modes(|m| m.no_in = true, |p| p.parse_expr(PREC_IN, host))?;
                    self.expect_kw(Keyword::In)?;
                    let iter = self.parse_expr(0, host)?;
                    let cond = if self.eat(&TokenKind::Keyword(Keyword::If), LexContext::Infix) {
                        Some(Box::new(self.parse_expr(0, host)?))
                    } else {
                        None
                    };
                    self.expect_punct('}', LexContext::Infix)?;
                    return Ok(Expr::new(
                        self.span_from(start),
                        ExprKind::DictCompr {
                            key: Box::new(key),
                            value: Box::new(value),
                            pattern: Box::new(patternize(pat)),
                            iter: Box::new(iter),
                            cond,
                        },
                    ));
                }

                let cond = if self.eat(&TokenKind::Keyword(Keyword::If), LexContext::Infix) {
                    Some(self.parse_expr(0, host)?)
                } else {
                    None
                };
                keys.push(key);
                values.push(value);
                conds.push(cond);
            }
            first = false;

            if self.eat_punct(',', LexContext::Infix) {
                if self.tok(LexContext::Infix).kind == TokenKind::Punct('}') {
                    self.bump();
                    break;
                }
                continue;
            }
            self.expect_punct('}', LexContext::Infix)?;
            break;
        }

        Ok(Expr::new(
            self.span_from(start),
            ExprKind::Dict {
                keys,
                values,
                conds,
                dflt,
            },
        ))
    }

    /// Converts the left side of `->` into a parameter list.
    fn arrow_params(&mut self, lhs: Expr) -> ParseResult<Vec<Param>> {
        let mut params = Vec::new();
        fn push<'s>(p: &mut Parser<'s>, params: &mut Vec<Param>, e: Expr) -> ParseResult<()> {
            match e.kind {
                ExprKind::Ident { module: None, name, .. } => {
                    params.push(Param {
                        name,
                        default: None,
                        constraint: None,
                        span: e.span,
                        sym: None,
                    });
                    Ok(())
                }
                ExprKind::Cast { e: inner, ty } => {
                    if let ExprKind::Ident { module: None, name, .. } = inner.kind {
                        params.push(Param {
                            name,
                            default: None,
                            constraint: Some(*ty),
                            span: inner.span,
                            sym: None,
                        });
                        Ok(())
                    } else {
                        Err(p.err(inner.span, "invalid parameter in function literal"))
                    }
                }
                ExprKind::Assign { target, value } => {
                    if let ExprKind::Ident { module: None, name, .. } = target.kind {
                        params.push(Param {
                            name,
                            default: Some(*value),
                            constraint: None,
                            span: target.span,
                            sym: None,
                        });
                        Ok(())
                    } else {
                        Err(p.err(target.span, "invalid parameter in function literal"))
                    }
                }
                _ => Err(p.err(e.span, "invalid parameter in function literal")),
            }
        }

        match lhs.kind {
            ExprKind::Tuple { items, names, .. } => {
                // `(x: Int, y) -> …`: a named slot is a constrained
                // parameter.
                for (item, name) in items.into_iter().zip(names) {
                    if let Some(name) = name {
                        params.push(Param {
                            name,
                            default: None,
                            constraint: Some(item),
                            span: lhs.span,
                            sym: None,
                        });
                    } else {
                        push(self, &mut params, item)?;
                    }
                }
            }
            ExprKind::List(items) => {
                for item in items {
                    push(self, &mut params, item)?;
                }
            }
            _ => push(self, &mut params, lhs)?,
        }
        Ok(params)
    }

    /// `params -> body` function literal.
    fn parse_arrow_function(&mut self, lhs: Expr, host: &mut dyn MacroHost) -> ParseResult<Expr> {
        let start = lhs.span;
        let params = self.arrow_params(lhs)?;

        let body = if self.tok(LexContext::Prefix).kind == TokenKind::Punct('{') {
            self.parse_block(host)?
        } else {
            let e = self.parse_expr(PREC_ARROW - 1, host)?;
            Stmt::new(e.span, StmtKind::Return(vec![e]))
        };

        Ok(Expr::new(
            self.span_from(start),
            ExprKind::Function(Box::new(FunctionExpr {
                name: None,
                kind: FnKind::Function,
                params,
                rest: None,
                kwargs: None,
                body: Box::new(body),
                decorators: Vec::new(),
                return_type: None,
                type_params: Vec::new(),
                where_clauses: Vec::new(),
                self_sym: None,
                    scope: None,
            })),
        ))
    }

    /// `function name? [T, …] (params) [-> Ret] [where …] body`, and the
    /// `generator` variant.
    fn parse_function_literal(&mut self, host: &mut dyn MacroHost) -> ParseResult<Expr> {
        let kw = self.tok(LexContext::Prefix);
        let start = kw.span;
        let is_generator = matches!(kw.kind, TokenKind::Keyword(Keyword::Generator));
        self.bump();

        let name = match self.tok(LexContext::Infix).kind {
            TokenKind::Id { module: None, ref name } => {
                let n = name.clone();
                self.bump();
                Some(n)
            }
            TokenKind::UserOp(ref op) => {
                // Operator implementations: `function <%>(a, b) …`.
                let n = op.clone();
                self.bump();
                Some(n)
            }
            _ => None,
        };

        // Optional type parameters.
        let mut type_params = Vec::new();
        if self.eat_punct('[', LexContext::Infix) {
            loop {
                let (_, n, _) = self.expect_id(LexContext::Prefix)?;
                type_params.push(n);
                if self.eat_punct(',', LexContext::Infix) {
                    continue;
                }
                self.expect_punct(']', LexContext::Infix)?;
                break;
            }
        }

        let (params, rest, kwargs) = if self.eat_punct('(', LexContext::Prefix) {
            self.parse_params(host)?
        } else {
            (Vec::new(), None, None)
        };

        let return_type = if self.eat(&TokenKind::Arrow, LexContext::Infix) {
            Some(Box::new(self.with_modes(|m| m.type_context = true, |p| p.parse_expr(PREC_CMP, host))?))
        } else {
            None
        };

        let mut where_clauses = Vec::new();
        if self.eat(&TokenKind::Keyword(Keyword::Where), LexContext::Infix) {
            loop {
                where_clauses.push(self.with_modes(
                    |m| {
                        m.type_context = true;
                        m.no_andor = true;
                    },
                    |p| p.parse_expr(PREC_KW_AND, host),
                )?);
                if self.eat(&TokenKind::Keyword(Keyword::And), LexContext::Infix) {
                    continue;
                }
                break;
            }
        }

        let body = if self.eat_punct('=', LexContext::Infix) {
            let e = self.parse_expr(PREC_ASSIGN - 1, host)?;
            Stmt::new(e.span, StmtKind::Return(vec![e]))
        } else {
            self.parse_block(host)?
        };

        Ok(Expr::new(
            self.span_from(start),
            ExprKind::Function(Box::new(FunctionExpr {
                name,
                kind: if is_generator { FnKind::Generator } else { FnKind::Function },
                params,
                rest,
                kwargs,
                body: Box::new(body),
                decorators: Vec::new(),
                return_type,
                type_params,
                where_clauses,
                self_sym: None,
                    scope: None,
            })),
        ))
    }

    /// Parameter list after `(`: names with defaults and constraints, one
    /// `*rest`, one `%kwargs`.
    #[expect(clippy::type_complexity, reason = "internal triple keeps call sites simple")]
    fn parse_params(&mut self, host: &mut dyn MacroHost) -> ParseResult<(Vec<Param>, Option<usize>, Option<usize>)> {
        let mut params = Vec::new();
        let mut rest = None;
        let mut kwargs = None;

        if self.eat_punct(')', LexContext::Infix) {
            return Ok((params, rest, kwargs));
        }

        loop {
            let t = self.tok(LexContext::Prefix);
            let marker = match t.kind {
                TokenKind::Punct('*') => {
                    self.bump();
                    Some('*')
                }
                TokenKind::Punct('%') => {
                    self.bump();
                    Some('%')
                }
                _ => None,
            };

            let (_, name, pspan) = self.expect_id(LexContext::Prefix)?;

            match marker {
                Some('*') => {
                    if rest.is_some() {
                        return Err(self.err(pspan, "multiple *rest parameters"));
                    }
                    rest = Some(params.len());
                }
                Some('%') => {
                    if kwargs.is_some() {
                        return Err(self.err(pspan, "multiple %kwargs parameters"));
                    }
                    kwargs = Some(params.len());
                }
                _ => {}
            }

            let constraint = if self.eat_punct(':', LexContext::Infix) {
                Some(self.with_modes(
                    |m| {
                        m.type_context = true;
                        m.no_equals = true;
                    },
                    |p| p.parse_expr(PREC_CMP, host),
                )?)
            } else {
                None
            };

            let default = if self.eat_punct('=', LexContext::Infix) {
                Some(self.with_modes(|m| m.no_equals = true, |p| p.parse_expr(PREC_ASSIGN, host))?)
            } else {
                None
            };

            params.push(Param {
                name,
                default,
                constraint,
                span: pspan,
                sym: None,
            });

            if self.eat_punct(',', LexContext::Infix) {
                continue;
            }
            self.expect_punct(')', LexContext::Infix)?;
            break;
        }

        Ok((params, rest, kwargs))
    }

    /// `match subject { pattern [if guard] => expr, … }` as an expression.
    fn parse_match_expr(&mut self, host: &mut dyn MacroHost) -> ParseResult<Expr> {
        let kw = self.tok(LexContext::Prefix);
        self.bump();
        let subject = self.with_modes(|m| m.no_equals = true, |p| p.parse_expr(0, host))?;
        self.expect_punct('{', LexContext::Prefix)?;

        let mut arms = Vec::new();
        loop {
            if self.eat_punct('}', LexContext::Prefix) {
                break;
            }
            let (pattern, guard) = self.parse_arm_head(host)?;
            let body = self.parse_expr(PREC_ASSIGN - 1, host)?;
            arms.push(MatchArm { pattern, guard, body });
            if self.eat_punct(',', LexContext::Infix) {
                continue;
            }
            self.expect_punct('}', LexContext::Infix)?;
            break;
        }

        if arms.is_empty() {
            return Err(self.err(kw.span, "match expression with no arms"));
        }

        Ok(Expr::new(
            self.span_from(kw.span),
            ExprKind::Match {
                subject: Box::new(subject),
                arms,
            },
        ))
    }

    /// Parses `pattern [if guard] =>` shared by match arms and cases.
    fn parse_arm_head(&mut self, host: &mut dyn MacroHost) -> ParseResult<(Expr, Option<Expr>)> {
        let pattern = self.parse_pattern(host)?;
        let guard = if self.eat(&TokenKind::Keyword(Keyword::If), LexContext::Infix) {
            Some(self.with_modes(|m| m.no_equals = true, |p| p.parse_expr(PREC_ASSIGN, host))?)
        } else {
            None
        };
        self.expect(&TokenKind::FatArrow, LexContext::Infix)?;
        Ok((pattern, guard))
    }

    /// Parses a comma-separated choice pattern.
    pub fn parse_pattern(&mut self, host: &mut dyn MacroHost) -> ParseResult<Expr> {
        let first = self.with_modes(|m| m.no_equals = true, |p| p.parse_expr(PREC_ASSIGN, host))?;
        let start = first.span;
        let mut alts = vec![first];
        while self.tok(LexContext::Infix).kind == TokenKind::Punct(',') {
            // Only continue the choice when another pattern plausibly
            // follows; `}` or `=>` after the comma belongs to the caller.
            let t1 = self.tok1(LexContext::Prefix);
            if matches!(t1.kind, TokenKind::Punct('}' | ')' | ']') | TokenKind::End) {
                break;
            }
            self.bump();
            alts.push(self.with_modes(|m| m.no_equals = true, |p| p.parse_expr(PREC_ASSIGN, host))?);
        }

        let e = if alts.len() == 1 {
            let Some(only) = alts.pop() else {
                unreachable!("one alternative checked above");
            };
            only
        } else {
            Expr::new(self.span_from(start), ExprKind::List(alts))
        };
        Ok(patternize(e))
    }

    /// `with defs { body }`: scoped resource acquisition.
    fn parse_with_expr(&mut self, host: &mut dyn MacroHost) -> ParseResult<Expr> {
        let kw = self.tok(LexContext::Prefix);
        self.bump();

        let mut defs = Vec::new();
        loop {
            let e = self.with_modes(|m| m.no_equals = true, |p| p.parse_expr(PREC_ASSIGN, host))?;
            let span = e.span;
            let def = if self.eat(&TokenKind::Keyword(Keyword::As), LexContext::Infix) {
                let (_, name, nspan) = self.expect_id(LexContext::Prefix)?;
                Stmt::new(
                    span,
                    StmtKind::Definition {
                        target: Expr::new(nspan, ExprKind::ResourceBinding { name, sym: None }),
                        value: e,
                        pub_: false,
                        const_: false,
                    },
                )
            } else if self.eat_punct('=', LexContext::Infix) {
                let value = self.parse_expr(PREC_ASSIGN - 1, host)?;
                let target = definition_lvalue(e)?;
                Stmt::new(
                    span,
                    StmtKind::Definition {
                        target,
                        value,
                        pub_: false,
                        const_: false,
                    },
                )
            } else {
                Stmt::new(span, StmtKind::Expression(e))
            };
            defs.push(def);
            if self.eat_punct(',', LexContext::Infix) {
                continue;
            }
            break;
        }

        let body = self.parse_block(host)?;
        Ok(Expr::new(
            self.span_from(kw.span),
            ExprKind::With {
                defs,
                body: Box::new(body),
            },
        ))
    }

    // ------------------------------------------------------------------
    // Statements.
    // ------------------------------------------------------------------

    /// `{ stmts }`.
    fn parse_block(&mut self, host: &mut dyn MacroHost) -> ParseResult<Stmt> {
        let open = self.expect_punct('{', LexContext::Prefix)?;
        let mut stmts = Vec::new();
        loop {
            let t = self.tok(LexContext::Prefix);
            match t.kind {
                TokenKind::Punct('}') => {
                    self.bump();
                    break;
                }
                TokenKind::End => return Err(self.err_at(&t, "unterminated block")),
                _ => {
                    let s = self.parse_statement(host)?;
                    if !matches!(s.kind, StmtKind::Null) {
                        stmts.push(s);
                    }
                }
            }
        }
        Ok(Stmt::new(self.span_from(open.span), StmtKind::Block(stmts)))
    }

    /// Parses one statement.
    pub fn parse_statement(&mut self, host: &mut dyn MacroHost) -> ParseResult<Stmt> {
        let t = self.tok(LexContext::Prefix);
        let span = t.span;

        match &t.kind {
            TokenKind::Punct(';') => {
                self.bump();
                return Ok(Stmt::null(span));
            }
            TokenKind::Punct('{') => return self.parse_block(host),
            TokenKind::Directive(d) => {
                let d = *d;
                return self.parse_directive(d, host);
            }
            TokenKind::Keyword(kw) => {
                let kw = *kw;
                match kw {
                    Keyword::Let | Keyword::Const => return self.parse_definition(host),
                    Keyword::Pub => return self.parse_pub(host),
                    Keyword::Function | Keyword::Generator | Keyword::Macro => {
                        return self.parse_function_definition(host);
                    }
                    Keyword::Operator => return self.parse_operator_directive(),
                    Keyword::Tag => return self.parse_tag_definition(false, host),
                    Keyword::Class | Keyword::Trait => return self.parse_class_definition(false, host),
                    Keyword::If => return self.parse_if_statement(host),
                    Keyword::While => return self.parse_while(host),
                    Keyword::For => return self.parse_for(host),
                    Keyword::Match => return self.parse_match_statement(host),
                    Keyword::Try => return self.parse_try(host),
                    Keyword::Return => return self.parse_return(host),
                    Keyword::Continue => {
                        self.bump();
                        self.eat_punct(';', LexContext::Infix);
                        return Ok(Stmt::new(span, StmtKind::Continue));
                    }
                    Keyword::Next => {
                        self.bump();
                        self.eat_punct(';', LexContext::Infix);
                        return Ok(Stmt::new(span, StmtKind::Next));
                    }
                    Keyword::Break => {
                        self.bump();
                        let depth = match self.tok_nl(LexContext::Infix).kind {
                            TokenKind::Integer(n) if n > 0 => {
                                self.bump();
                                u32::try_from(n).unwrap_or(1)
                            }
                            _ => 1,
                        };
                        self.eat_punct(';', LexContext::Infix);
                        return Ok(Stmt::new(self.span_from(span), StmtKind::Break { depth }));
                    }
                    Keyword::Defer => {
                        self.bump();
                        let e = self.parse_expr(0, host)?;
                        self.eat_punct(';', LexContext::Infix);
                        return Ok(Stmt::new(self.span_from(span), StmtKind::Defer(e)));
                    }
                    Keyword::Import => return self.parse_import(false),
                    Keyword::Export => return self.parse_export(),
                    Keyword::Use => return self.parse_use(),
                    Keyword::Namespace => return self.parse_namespace(false, host),
                    Keyword::SetType => {
                        self.bump();
                        let target = self.with_modes(|m| m.no_constraint = true, |p| p.parse_expr(PREC_CAST, host))?;
                        self.expect_punct(':', LexContext::Infix)?;
                        let ty = self.with_modes(|m| m.type_context = true, |p| p.parse_expr(PREC_CMP, host))?;
                        self.eat_punct(';', LexContext::Infix);
                        return Ok(Stmt::new(self.span_from(span), StmtKind::SetType { target, ty }));
                    }
                    _ => {}
                }
            }
            TokenKind::Id { module: None, name } if name == "drop" => {
                // Contextual: `drop x, y` runs drop methods immediately.
                if matches!(self.tok1(LexContext::Prefix).kind, TokenKind::Id { .. }) {
                    self.bump();
                    let mut targets = Vec::new();
                    loop {
                        let (module, name, ispan) = self.expect_id(LexContext::Prefix)?;
                        targets.push(Expr::new(ispan, ExprKind::Ident { module, name, sym: None }));
                        if self.eat_punct(',', LexContext::Infix) {
                            continue;
                        }
                        break;
                    }
                    self.eat_punct(';', LexContext::Infix);
                    return Ok(Stmt::new(self.span_from(span), StmtKind::Drop(targets)));
                }
            }
            TokenKind::Id { module: None, name } if name == "cleanup" => {
                // Contextual: `cleanup expr` registers an unwind-only defer.
                if !matches!(
                    self.tok1(LexContext::Infix).kind,
                    TokenKind::Punct('=' | '.' | '(' | '[' | ',') | TokenKind::End
                ) {
                    self.bump();
                    let e = self.parse_expr(0, host)?;
                    self.eat_punct(';', LexContext::Infix);
                    return Ok(Stmt::new(self.span_from(span), StmtKind::Cleanup(e)));
                }
            }
            TokenKind::Error(_) => return Err(self.err_at(&t, "")),
            TokenKind::End => return Err(self.err_at(&t, "unexpected end of input")),
            _ => {}
        }

        // Expression statement.
        let e = self.parse_expr(0, host)?;
        self.eat_punct(';', LexContext::Infix);
        Ok(Stmt::new(self.span_from(span), StmtKind::Expression(e)))
    }

    fn parse_definition(&mut self, host: &mut dyn MacroHost) -> ParseResult<Stmt> {
        let kw = self.tok(LexContext::Prefix);
        let const_ = matches!(kw.kind, TokenKind::Keyword(Keyword::Const));
        self.bump();

        let target = self.with_modes(|m| m.no_equals = true, |p| p.parse_expr(PREC_ASSIGN, host))?;
        self.expect_punct('=', LexContext::Infix)?;
        let value = self.parse_expr(PREC_ASSIGN - 1, host)?;
        self.eat_punct(';', LexContext::Infix);

        let target = definition_lvalue(target)?;
        Ok(Stmt::new(
            self.span_from(kw.span),
            StmtKind::Definition {
                target,
                value,
                pub_: false,
                const_,
            },
        ))
    }

    /// `pub` prefixes definitions, functions, classes, tags, and imports.
    fn parse_pub(&mut self, host: &mut dyn MacroHost) -> ParseResult<Stmt> {
        let kw = self.tok(LexContext::Prefix);
        self.bump();
        let t = self.tok(LexContext::Prefix);
        let mut s = match t.kind {
            TokenKind::Keyword(Keyword::Let | Keyword::Const) => self.parse_definition(host)?,
            TokenKind::Keyword(Keyword::Function | Keyword::Generator) => self.parse_function_definition(host)?,
            TokenKind::Keyword(Keyword::Tag) => self.parse_tag_definition(true, host)?,
            TokenKind::Keyword(Keyword::Class | Keyword::Trait) => self.parse_class_definition(true, host)?,
            TokenKind::Keyword(Keyword::Import) => self.parse_import(true)?,
            TokenKind::Keyword(Keyword::Namespace) => self.parse_namespace(true, host)?,
            _ => {
                // `pub x = value` defines a public binding.
                let target = self.with_modes(|m| m.no_equals = true, |p| p.parse_expr(PREC_ASSIGN, host))?;
                self.expect_punct('=', LexContext::Infix)?;
                let value = self.parse_expr(PREC_ASSIGN - 1, host)?;
                self.eat_punct(';', LexContext::Infix);
                let target = definition_lvalue(target)?;
                Stmt::new(
                    self.span_from(kw.span),
                    StmtKind::Definition {
                        target,
                        value,
                        pub_: true,
                        const_: false,
                    },
                )
            }
        };
        match &mut s.kind {
            StmtKind::Definition { pub_, .. } | StmtKind::FunctionDef { pub_, .. } | StmtKind::Import { pub_, .. } => {
                *pub_ = true;
            }
            StmtKind::TagDef(c) | StmtKind::ClassDef(c) => c.pub_ = true,
            StmtKind::NamespaceDef { pub_, .. } => *pub_ = true,
            _ => {}
        }
        s.span = self.span_from(kw.span);
        Ok(s)
    }

    /// `function f(…) { … }` definitions, plus `macro` definitions which
    /// share the surface shape.
    fn parse_function_definition(&mut self, host: &mut dyn MacroHost) -> ParseResult<Stmt> {
        let kw = self.tok(LexContext::Prefix);
        let is_macro = matches!(kw.kind, TokenKind::Keyword(Keyword::Macro));

        if is_macro {
            return self.parse_macro_definition(host);
        }

        let f = self.parse_function_literal(host)?;
        let span = self.span_from(kw.span);
        let ExprKind::Function(ref fx) = f.kind else {
            return Err(self.err(span, "expected function definition"));
        };
        if fx.name.is_none() {
            return Err(self.err(span, "anonymous function definition used in statement context"));
        }
        Ok(Stmt::new(span, StmtKind::FunctionDef { f, pub_: false }))
    }

    /// `macro name(params) { … }` (fun-macro) or
    /// `macro name = $[ … ]` / `macro name { … }` (template macro).
    fn parse_macro_definition(&mut self, host: &mut dyn MacroHost) -> ParseResult<Stmt> {
        let kw = self.tok(LexContext::Prefix);
        self.bump();
        let (_, name, _) = self.expect_id(LexContext::Prefix)?;

        if self.tok(LexContext::Infix).kind == TokenKind::Punct('(') {
            // Fun-macro: a function the compiler runs against the parser.
            self.bump();
            let (params, rest, kwargs) = self.parse_params(host)?;
            let body = self.parse_block(host)?;
            let span = self.span_from(kw.span);
            let f = Expr::new(
                span,
                ExprKind::Function(Box::new(FunctionExpr {
                    name: Some(name.clone()),
                    kind: FnKind::Function,
                    params,
                    rest,
                    kwargs,
                    body: Box::new(body),
                    decorators: Vec::new(),
                    return_type: None,
                    type_params: Vec::new(),
                    where_clauses: Vec::new(),
                    self_sym: None,
                    scope: None,
                })),
            );
            return Ok(Stmt::new(span, StmtKind::FunMacroDef { name, f }));
        }

        // Template macro: parameters are implicit (referenced by name inside
        // the template), body is a template expression.
        self.expect_punct('=', LexContext::Infix)?;
        let body = self.parse_expr(PREC_ASSIGN - 1, host)?;
        let span = self.span_from(kw.span);
        if !matches!(body.kind, ExprKind::Template { .. }) {
            return Err(self.err(span, "template macro body must be a template"));
        }
        self.eat_punct(';', LexContext::Infix);
        Ok(Stmt::new(
            span,
            StmtKind::MacroDef {
                name,
                params: Vec::new(),
                body,
            },
        ))
    }

    /// `operator <%> 8 left`.
    fn parse_operator_directive(&mut self) -> ParseResult<Stmt> {
        let kw = self.tok(LexContext::Prefix);
        self.bump();

        let t = self.tok(LexContext::Infix);
        let TokenKind::UserOp(name) = t.kind else {
            return Err(self.err_at(&t, "expected operator after 'operator'"));
        };
        self.bump();

        let t = self.tok(LexContext::Infix);
        let TokenKind::Integer(prec) = t.kind else {
            return Err(self.err_at(&t, "expected precedence integer in operator directive"));
        };
        self.bump();
        if !(1..=20).contains(&prec) {
            return Err(self.err_at(&t, "operator precedence must be between 1 and 20"));
        }

        let (_, assoc_word, aspan) = self.expect_id(LexContext::Prefix)?;
        let assoc = match assoc_word.as_str() {
            "left" => Assoc::Left,
            "right" => Assoc::Right,
            _ => return Err(self.err(aspan, "expected 'left' or 'right' in operator directive")),
        };

        #[expect(clippy::cast_possible_truncation, reason = "range-checked above")]
        self.ops.define(&name, prec as u8, assoc);

        // The directive line ends at the newline the lexer was told to watch
        // for.
        let t = self.tok_nl(LexContext::Infix);
        if matches!(t.kind, TokenKind::Newline) {
            self.bump_any();
        }

        #[expect(clippy::cast_possible_truncation, reason = "range-checked above")]
        Ok(Stmt::new(
            self.span_from(kw.span),
            StmtKind::OperatorDef {
                name,
                prec: prec as u8,
                assoc,
            },
        ))
    }

    /// `tag A, B { methods }, C`.
    fn parse_tag_definition(&mut self, pub_: bool, host: &mut dyn MacroHost) -> ParseResult<Stmt> {
        let kw = self.tok(LexContext::Prefix);
        self.bump();

        let mut defs = Vec::new();
        loop {
            let (_, name, nspan) = self.expect_id(LexContext::Prefix)?;
            let mut class = ClassDef {
                kind: ClassKind::Tag,
                name,
                pub_,
                super_: None,
                traits: Vec::new(),
                type_params: Vec::new(),
                fields: Vec::new(),
                init_params: Vec::new(),
                methods: Vec::new(),
                getters: Vec::new(),
                setters: Vec::new(),
                statics: Vec::new(),
                doc: None,
                sym: None,
            };
            if self.tok(LexContext::Infix).kind == TokenKind::Punct('{') {
                self.parse_class_body(&mut class, host)?;
            }
            defs.push(Stmt::new(self.span_from(nspan), StmtKind::TagDef(Box::new(class))));
            if self.eat_punct(',', LexContext::Infix) {
                continue;
            }
            break;
        }
        self.eat_punct(';', LexContext::Infix);

        if defs.len() == 1 {
            let Some(only) = defs.pop() else {
                unreachable!("one definition checked above");
            };
            return Ok(only);
        }
        Ok(Stmt::new(self.span_from(kw.span), StmtKind::Multi(defs)))
    }

    /// `class Foo[T](a, b) < Super : Trait1, Trait2 { body }`.
    fn parse_class_definition(&mut self, pub_: bool, host: &mut dyn MacroHost) -> ParseResult<Stmt> {
        let kw = self.tok(LexContext::Prefix);
        let is_trait = matches!(kw.kind, TokenKind::Keyword(Keyword::Trait));
        self.bump();

        let (_, name, _) = self.expect_id(LexContext::Prefix)?;
        let mut class = ClassDef {
            kind: if is_trait { ClassKind::Trait } else { ClassKind::Class },
            name,
            pub_,
            super_: None,
            traits: Vec::new(),
            type_params: Vec::new(),
            fields: Vec::new(),
            init_params: Vec::new(),
            methods: Vec::new(),
            getters: Vec::new(),
            setters: Vec::new(),
            statics: Vec::new(),
            doc: None,
            sym: None,
        };

        if self.eat_punct('[', LexContext::Infix) {
            loop {
                let (_, n, _) = self.expect_id(LexContext::Prefix)?;
                class.type_params.push(n);
                if self.eat_punct(',', LexContext::Infix) {
                    continue;
                }
                self.expect_punct(']', LexContext::Infix)?;
                break;
            }
        }

        // Implicit-init parameter list.
        if self.eat_punct('(', LexContext::Prefix) {
            let (params, _, _) = self.parse_params(host)?;
            class.init_params = params;
        }

        if self.eat_punct('<', LexContext::Infix) {
            class.super_ = Some(self.with_modes(|m| m.type_context = true, |p| p.parse_expr(PREC_CMP, host))?);
        }

        if self.eat_punct(':', LexContext::Infix) {
            loop {
                class
                    .traits
                    .push(self.with_modes(|m| m.type_context = true, |p| p.parse_expr(PREC_CMP, host))?);
                if self.eat_punct(',', LexContext::Infix) {
                    continue;
                }
                break;
            }
        }

        if self.tok(LexContext::Infix).kind == TokenKind::Punct('{') {
            self.parse_class_body(&mut class, host)?;
        } else {
            self.eat_punct(';', LexContext::Infix);
        }

        Ok(Stmt::new(self.span_from(kw.span), StmtKind::ClassDef(Box::new(class))))
    }

    /// Class body: fields, methods, getters/setters, statics.
    fn parse_class_body(&mut self, class: &mut ClassDef, host: &mut dyn MacroHost) -> ParseResult<()> {
        self.expect_punct('{', LexContext::Prefix)?;
        loop {
            let t = self.tok(LexContext::Name);
            match &t.kind {
                TokenKind::Punct('}') => {
                    self.bump();
                    return Ok(());
                }
                TokenKind::Punct(';') => {
                    self.bump();
                }
                TokenKind::End => return Err(self.err_at(&t, "unterminated class body")),
                TokenKind::Keyword(Keyword::Static) => {
                    self.bump();
                    let m = self.parse_method(None, host)?;
                    class.statics.push(m);
                }
                TokenKind::Id { module: None, name } => {
                    let name = name.clone();
                    let t1 = self.tok1(LexContext::Infix);
                    match t1.kind {
                        // `name(params) { … }` method (get/set prefixes are
                        // method modifiers when followed by another name).
                        TokenKind::Punct('(') => {
                            let m = self.parse_method(Some(name), host)?;
                            class.methods.push(m);
                        }
                        // The `get`/`set`/`static` modifiers (identifiers in
                        // name-lexing context) apply when another name
                        // follows.
                        _ if (name == "get" || name == "set" || name == "static")
                            && matches!(t1.kind, TokenKind::Id { .. } | TokenKind::Keyword(_)) =>
                        {
                            self.bump();
                            let m = self.parse_method(None, host)?;
                            match name.as_str() {
                                "get" => class.getters.push(m),
                                "set" => class.setters.push(m),
                                _ => class.statics.push(m),
                            }
                        }
                        // `name = default` or bare `name` field, with an
                        // optional `: Type` constraint.
                        _ => {
                            self.bump();
                            let constraint = if self.eat_punct(':', LexContext::Infix) {
                                Some(self.with_modes(|m| m.type_context = true, |p| p.parse_expr(PREC_CMP, host))?)
                            } else {
                                None
                            };
                            let default = if self.eat_punct('=', LexContext::Infix) {
                                Some(self.parse_expr(PREC_ASSIGN - 1, host)?)
                            } else {
                                None
                            };
                            self.eat_punct(';', LexContext::Infix);
                            class.fields.push(FieldDef {
                                name,
                                default,
                                constraint,
                                span: t.span,
                            });
                        }
                    }
                }
                _ => return Err(self.err_at(&t, format!("unexpected {} in class body", t.kind))),
            }
        }
    }

    /// One method: `name(params) body` (name may come from the caller).
    fn parse_method(&mut self, name: Option<String>, host: &mut dyn MacroHost) -> ParseResult<Expr> {
        let name = match name {
            Some(n) => n,
            None => {
                let t = self.tok(LexContext::Name);
                match t.kind {
                    TokenKind::Id { module: None, name } => {
                        self.bump();
                        name
                    }
                    _ => return Err(self.err_at(&t, "expected method name")),
                }
            }
        };
        let t = self.tok(LexContext::Infix);
        let start = t.span;
        let (params, rest, kwargs) = if self.eat_punct('(', LexContext::Infix) {
            self.parse_params(host)?
        } else {
            (Vec::new(), None, None)
        };
        let body = if self.eat_punct('=', LexContext::Infix) {
            let e = self.parse_expr(PREC_ASSIGN - 1, host)?;
            Stmt::new(e.span, StmtKind::Return(vec![e]))
        } else {
            self.parse_block(host)?
        };
        Ok(Expr::new(
            self.span_from(start),
            ExprKind::Function(Box::new(FunctionExpr {
                name: Some(name),
                kind: FnKind::Function,
                params,
                rest,
                kwargs,
                body: Box::new(body),
                decorators: Vec::new(),
                return_type: None,
                type_params: Vec::new(),
                where_clauses: Vec::new(),
                self_sym: None,
                    scope: None,
            })),
        ))
    }

    fn parse_if_statement(&mut self, host: &mut dyn MacroHost) -> ParseResult<Stmt> {
        let kw = self.tok(LexContext::Prefix);
        self.bump();

        let neg = self.eat(&TokenKind::Keyword(Keyword::Not), LexContext::Prefix);
        let parts = self.parse_cond_parts(host)?;
        let then = self.parse_statement(host)?;
        let otherwise = if self.eat(&TokenKind::Keyword(Keyword::Else), LexContext::Prefix) {
            Some(Box::new(self.parse_statement(host)?))
        } else {
            None
        };

        Ok(Stmt::new(
            self.span_from(kw.span),
            StmtKind::If {
                parts,
                neg,
                then: Box::new(then),
                otherwise,
            },
        ))
    }

    /// Condition parts for `if`/`while` headers: expressions and
    /// `let pattern = expr` bindings, comma-separated.
    fn parse_cond_parts(&mut self, host: &mut dyn MacroHost) -> ParseResult<Vec<CondPart>> {
        let mut parts = Vec::new();
        loop {
            if self.eat_kw(Keyword::Let) {
                let pat = self.with_modes(|m| m.no_equals = true, |p| p.parse_expr(PREC_ASSIGN, host))?;
                self.expect_punct('=', LexContext::Infix)?;
                let e = self.with_modes(|m| m.no_in = true, |p| p.parse_expr(PREC_ASSIGN - 1, host))?;
                parts.push(CondPart {
                    target: Some(patternize(pat)),
                    expr: e,
                });
            } else {
                let e = self.with_modes(
                    |m| {
                        m.no_in = true;
                        m.no_equals = true;
                    },
                    |p| p.parse_expr(PREC_ASSIGN, host),
                )?;
                parts.push(CondPart { target: None, expr: e });
            }
            if self.eat_punct(',', LexContext::Infix) {
                continue;
            }
            return Ok(parts);
        }
    }

    fn parse_while(&mut self, host: &mut dyn MacroHost) -> ParseResult<Stmt> {
        let kw = self.tok(LexContext::Prefix);
        self.bump();

        let parts = self.parse_cond_parts(host)?;
        let body = self.parse_statement(host)?;
        let span = self.span_from(kw.span);

        // `while subject :: pattern` loops while the match keeps succeeding,
        // binding the pattern each iteration.
        if parts.len() == 1 && parts[0].target.is_none() {
            if let [
                CondPart {
                    expr: Expr {
                        kind: ExprKind::CheckMatch { .. },
                        ..
                    },
                    ..
                },
            ] = parts.as_slice()
            {
                let mut parts = parts;
                let Some(CondPart {
                    expr: Expr {
                        kind: ExprKind::CheckMatch { subject, pattern },
                        ..
                    },
                    ..
                }) = parts.pop()
                else {
                    unreachable!("shape checked above");
                };
                return Ok(Stmt::new(
                    span,
                    StmtKind::WhileMatch {
                        subject: *subject,
                        pattern: *pattern,
                        body: Box::new(body),
                    },
                ));
            }
        }

        Ok(Stmt::new(
            span,
            StmtKind::While {
                parts,
                body: Box::new(body),
            },
        ))
    }

    /// `for target in iter body` or C-style `for init; cond; next body`.
    fn parse_for(&mut self, host: &mut dyn MacroHost) -> ParseResult<Stmt> {
        let kw = self.tok(LexContext::Prefix);
        self.bump();

        // Speculative: each-loop headers are `pattern in …`.
        let save = self.save();
        let each = self
            .with_modes(
                |m| {
                    m.no_in = true;
                    m.no_equals = true;
                },
                |p| p.parse_expr(PREC_IN, host),
            )
            .ok()
            .filter(|_| self.tok(LexContext::Infix).kind == TokenKind::Keyword(Keyword::In));

        if let Some(target) = each {
            self.bump();
            let iter = self.with_modes(|m| m.no_andor = false, |p| p.parse_expr(0, host))?;
            // `if cond` filter and `while stop` bound, as in the original's
            // each-loops.
            let cond = if self.eat(&TokenKind::Keyword(Keyword::If), LexContext::Infix) {
                Some(self.parse_expr(0, host)?)
            } else {
                None
            };
            let stop = if self.eat(&TokenKind::Keyword(Keyword::While), LexContext::Infix) {
                Some(self.parse_expr(0, host)?)
            } else {
                None
            };
            let body = self.parse_statement(host)?;
            return Ok(Stmt::new(
                self.span_from(kw.span),
                StmtKind::Each {
                    target: patternize(target),
                    iter,
                    cond,
                    stop,
                    body: Box::new(body),
                },
            ));
        }
        self.restore(save);

        let init = self.parse_statement(host)?;
        let cond = if self.tok(LexContext::Prefix).kind == TokenKind::Punct(';') {
            None
        } else {
            Some(self.parse_expr(0, host)?)
        };
        self.expect_punct(';', LexContext::Infix)?;
        let next = if self.tok(LexContext::Prefix).kind == TokenKind::Punct('{') {
            None
        } else {
            Some(self.parse_expr(0, host)?)
        };
        let body = self.parse_block(host)?;

        Ok(Stmt::new(
            self.span_from(kw.span),
            StmtKind::For {
                init: Box::new(init),
                cond,
                next,
                body: Box::new(body),
            },
        ))
    }

    fn parse_match_statement(&mut self, host: &mut dyn MacroHost) -> ParseResult<Stmt> {
        let kw = self.tok(LexContext::Prefix);
        self.bump();
        let subject = self.with_modes(|m| m.no_equals = true, |p| p.parse_expr(0, host))?;
        self.expect_punct('{', LexContext::Prefix)?;

        let mut cases = Vec::new();
        loop {
            if self.eat_punct('}', LexContext::Prefix) {
                break;
            }
            let (pattern, guard) = self.parse_arm_head(host)?;
            let body = self.parse_statement(host)?;
            cases.push(MatchCase { pattern, guard, body });
            if self.eat_punct(',', LexContext::Infix) {
                continue;
            }
            self.expect_punct('}', LexContext::Infix)?;
            break;
        }

        if cases.is_empty() {
            return Err(self.err(kw.span, "match statement with no cases"));
        }

        Ok(Stmt::new(self.span_from(kw.span), StmtKind::Match { subject, cases }))
    }

    /// `try { } catch pattern { } … finally { }`.
    fn parse_try(&mut self, host: &mut dyn MacroHost) -> ParseResult<Stmt> {
        let kw = self.tok(LexContext::Prefix);
        self.bump();
        let body = self.parse_block(host)?;

        let mut catches = Vec::new();
        while self.eat(&TokenKind::Keyword(Keyword::Catch), LexContext::Prefix) {
            let pattern = self.parse_pattern(host)?;
            let guard = if self.eat(&TokenKind::Keyword(Keyword::If), LexContext::Infix) {
                Some(self.with_modes(|m| m.no_equals = true, |p| p.parse_expr(PREC_ASSIGN, host))?)
            } else {
                None
            };
            let handler = self.parse_block(host)?;
            catches.push(MatchCase {
                pattern,
                guard,
                body: handler,
            });
        }

        let finally = if self.eat(&TokenKind::Keyword(Keyword::Finally), LexContext::Prefix) {
            Some(Box::new(self.parse_block(host)?))
        } else {
            None
        };

        Ok(Stmt::new(
            self.span_from(kw.span),
            StmtKind::Try {
                body: Box::new(body),
                catches,
                finally,
            },
        ))
    }

    fn parse_return(&mut self, host: &mut dyn MacroHost) -> ParseResult<Stmt> {
        let kw = self.tok(LexContext::Prefix);
        self.bump();

        let mut values = Vec::new();
        let t = self.tok_nl(LexContext::Prefix);
        if !matches!(
            t.kind,
            TokenKind::Punct(';' | '}' | ')') | TokenKind::End | TokenKind::Newline
        ) {
            loop {
                values.push(self.parse_expr(PREC_ASSIGN - 1, host)?);
                if self.eat_punct(',', LexContext::Infix) {
                    continue;
                }
                break;
            }
        }
        self.eat_punct(';', LexContext::Infix);

        Ok(Stmt::new(self.span_from(kw.span), StmtKind::Return(values)))
    }

    /// `import a.b.c [as x] [(name1, name2 as y)]`.
    fn parse_import(&mut self, pub_: bool) -> ParseResult<Stmt> {
        let kw = self.tok(LexContext::Prefix);
        self.bump();

        let mut module = String::new();
        loop {
            let (_, part, _) = self.expect_id(LexContext::Name)?;
            if !module.is_empty() {
                module.push('/');
            }
            module.push_str(&part);
            if self.eat_punct('.', LexContext::Infix) {
                continue;
            }
            break;
        }

        let alias = if self.eat(&TokenKind::Keyword(Keyword::As), LexContext::Infix) {
            let (_, a, _) = self.expect_id(LexContext::Prefix)?;
            Some(a)
        } else {
            None
        };

        let mut names = Vec::new();
        if self.eat_punct('(', LexContext::Infix) {
            loop {
                let (_, n, _) = self.expect_id(LexContext::Prefix)?;
                let local = if self.eat(&TokenKind::Keyword(Keyword::As), LexContext::Infix) {
                    let (_, l, _) = self.expect_id(LexContext::Prefix)?;
                    Some(l)
                } else {
                    None
                };
                names.push((n, local));
                if self.eat_punct(',', LexContext::Infix) {
                    continue;
                }
                self.expect_punct(')', LexContext::Infix)?;
                break;
            }
        }

        // Imports end at the newline.
        let t = self.tok_nl(LexContext::Infix);
        if matches!(t.kind, TokenKind::Newline) {
            self.bump_any();
        } else {
            self.eat_punct(';', LexContext::Infix);
        }

        Ok(Stmt::new(
            self.span_from(kw.span),
            StmtKind::Import {
                module,
                alias,
                names,
                pub_,
            },
        ))
    }

    fn parse_export(&mut self) -> ParseResult<Stmt> {
        let kw = self.tok(LexContext::Prefix);
        self.bump();
        let mut names = Vec::new();
        loop {
            let (_, n, _) = self.expect_id(LexContext::Prefix)?;
            names.push(n);
            if self.eat_punct(',', LexContext::Infix) {
                continue;
            }
            break;
        }
        let t = self.tok_nl(LexContext::Infix);
        if matches!(t.kind, TokenKind::Newline) {
            self.bump_any();
        } else {
            self.eat_punct(';', LexContext::Infix);
        }
        Ok(Stmt::new(self.span_from(kw.span), StmtKind::Export(names)))
    }

    /// `use ns::name1, name2` pulls names from a namespace into scope.
    fn parse_use(&mut self) -> ParseResult<Stmt> {
        let kw = self.tok(LexContext::Prefix);
        self.bump();

        let (module, first, _) = self.expect_id(LexContext::Prefix)?;
        let mut names = vec![first];
        while self.eat_punct(',', LexContext::Infix) {
            let (_, n, _) = self.expect_id(LexContext::Prefix)?;
            names.push(n);
        }
        self.eat_punct(';', LexContext::Infix);

        Ok(Stmt::new(self.span_from(kw.span), StmtKind::Use { module, names }))
    }

    fn parse_namespace(&mut self, pub_: bool, host: &mut dyn MacroHost) -> ParseResult<Stmt> {
        let kw = self.tok(LexContext::Prefix);
        self.bump();
        let (_, name, _) = self.expect_id(LexContext::Prefix)?;
        let body = self.parse_block(host)?;
        let StmtKind::Block(stmts) = body.kind else {
            unreachable!("parse_block returns a block");
        };
        Ok(Stmt::new(
            self.span_from(kw.span),
            StmtKind::NamespaceDef {
                name,
                pub_,
                body: stmts,
            },
        ))
    }

    // ------------------------------------------------------------------
    // Preprocessor.
    // ------------------------------------------------------------------

    /// `$if cond { … } [else { … }]` and `$while cond { … }`, evaluated at
    /// compile time through the host.
    fn parse_directive(&mut self, d: Directive, host: &mut dyn MacroHost) -> ParseResult<Stmt> {
        let kw = self.tok(LexContext::Prefix);
        self.bump();
        let cond = self.with_modes(|m| m.no_equals = true, |p| p.parse_expr(PREC_ASSIGN, host))?;

        match d {
            Directive::If => {
                let taken = host.eval_const_bool(&cond)?;
                let then = if taken {
                    self.parse_block(host)?
                } else {
                    self.skip_hidden_block()?;
                    Stmt::null(kw.span)
                };
                let mut stmts = vec![then];
                if self.eat(&TokenKind::Keyword(Keyword::Else), LexContext::Prefix) {
                    if taken {
                        self.skip_hidden_block()?;
                    } else {
                        stmts.push(self.parse_block(host)?);
                    }
                }
                Ok(Stmt::new(self.span_from(kw.span), StmtKind::Multi(stmts)))
            }
            Directive::While => {
                // Re-parse the controlled block while the condition holds;
                // compile-time state advanced by the host bounds the loop.
                let mut stmts = Vec::new();
                let block_start = self.save();
                let mut iterations = 0u32;
                while host.eval_const_bool(&cond)? {
                    iterations += 1;
                    if iterations > 10_000 {
                        return Err(self.err(kw.span, "$while directive did not terminate"));
                    }
                    self.restore(block_start);
                    stmts.push(self.parse_block(host)?);
                }
                if stmts.is_empty() {
                    self.restore(block_start);
                    self.skip_hidden_block()?;
                }
                Ok(Stmt::new(self.span_from(kw.span), StmtKind::Multi(stmts)))
            }
        }
    }

    /// Marks the tokens of a `{ … }` block hidden without parsing them.
    fn skip_hidden_block(&mut self) -> ParseResult<()> {
        let open = self.expect_punct('{', LexContext::Prefix)?;
        // The `{` was consumed normally; hide everything to the matching `}`.
        let mut depth = 1usize;
        loop {
            let t = self.tok_nl(LexContext::Prefix);
            match t.kind {
                TokenKind::Punct('{') => depth += 1,
                TokenKind::Punct('}') => {
                    depth -= 1;
                    if depth == 0 {
                        self.bump_any();
                        return Ok(());
                    }
                }
                TokenKind::End => return Err(self.err(open.span, "unterminated preprocessor block")),
                _ => {}
            }
            let i = self.ti;
            self.tokens[i].hidden = true;
            self.tokens[i].pp = true;
            self.ti += 1;
        }
    }
}

/// Shifts every location in a re-parsed fragment by the fragment's position
/// in the enclosing buffer (interpolated string expressions).
fn shift_expr(mut e: Expr, base: Location) -> Expr {
    struct Shift(Location);
    impl crate::ast::Visitor for Shift {
        fn visit_expr(&mut self, e: &mut Expr) {
            e.span = shift_span(e.span, self.0);
            crate::ast::walk_expr(self, e);
        }

        fn visit_stmt(&mut self, s: &mut Stmt) {
            s.span = shift_span(s.span, self.0);
            crate::ast::walk_stmt(self, s);
        }
    }
    let mut v = Shift(base);
    crate::ast::Visitor::visit_expr(&mut v, &mut e);
    e
}

fn shift_span(mut span: Span, base: Location) -> Span {
    let shift_loc = |loc: &mut Location| {
        if loc.line == 0 {
            loc.col += base.col;
        }
        loc.line += base.line;
        loc.offset += base.offset;
    };
    shift_loc(&mut span.start);
    shift_loc(&mut span.end);
    span
}
