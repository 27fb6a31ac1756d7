//! Tagged token representation shared by the lexer and parser.

use std::{fmt, sync::Arc};

use crate::location::{Location, Span};

/// Lexing context requested by the parser for the next token.
///
/// The same characters lex differently depending on position: `/` starts a
/// regex in prefix position but divides in infix position, `-` is unary in
/// prefix position, and so on. `Fmt`/`XFmt` scan format specs inside
/// interpolated strings; `Name` treats keyword-like words as plain
/// identifiers (method position).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LexContext {
    #[default]
    Prefix,
    Infix,
    Fmt,
    XFmt,
    Name,
}

/// Keywords, lexed from identifier-shaped words.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::EnumString, strum::IntoStaticStr)]
#[strum(serialize_all = "lowercase")]
pub enum Keyword {
    Return,
    Break,
    Let,
    Continue,
    If,
    Do,
    Or,
    And,
    Not,
    Function,
    Macro,
    Else,
    For,
    In,
    While,
    Use,
    Where,
    True,
    False,
    Const,
    #[strum(serialize = "self")]
    Self_,
    Nil,
    Import,
    Export,
    As,
    Tag,
    Class,
    Trait,
    Match,
    Try,
    Catch,
    Finally,
    Throw,
    Operator,
    Yield,
    Next,
    Generator,
    Pub,
    Defer,
    With,
    Static,
    Super,
    Eval,
    Typeof,
    #[strum(serialize = "set_type")]
    SetType,
    Defined,
    Namespace,
}

/// One piece of a double-quoted "special string".
#[derive(Debug, Clone, PartialEq)]
pub enum StrPart {
    /// A literal fragment with escapes already processed.
    Lit(String),
    /// An interpolated `{ expr }`: the raw expression text plus where it
    /// starts, so the parser can re-enter the lexer there with correct spans.
    Expr {
        text: String,
        start: Location,
        /// Format spec captured from a preceding `%spec`, if any.
        fmt: Option<(String, Location)>,
    },
}

/// A lexed special string: literal fragments interleaved with expressions.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SpecialStr {
    pub parts: Vec<StrPart>,
}

/// A regex literal, compiled eagerly at lex time.
#[derive(Debug, Clone)]
pub struct RegexTok {
    pub pattern: String,
    pub ci: bool,
    pub utf: bool,
    pub re: Arc<fancy_regex::Regex>,
}

impl PartialEq for RegexTok {
    fn eq(&self, other: &Self) -> bool {
        self.pattern == other.pattern && self.ci == other.ci && self.utf == other.utf
    }
}

/// The token discriminator.
#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    Keyword(Keyword),
    /// Identifier with optional `::`-qualified module prefix.
    Id { module: Option<String>, name: String },
    Str(String),
    Special(SpecialStr),
    Regex(RegexTok),
    Integer(i64),
    Real(f64),
    /// Single-codepoint punctuation: `(`, `)`, `[`, `]`, `{`, `}`, `,`, `;`,
    /// `:`, `.`, `#`, `$`, `&`, `!`, `?`, `@`, `=`, `<`, `>`, `+`, `-`, `*`,
    /// `/`, `%`, `|`, `^`, `~`.
    Punct(char),
    /// An operator sequence with no fixed meaning; resolved through the
    /// user-operator table.
    UserOp(String),
    /// Preprocessor directive: `$if` or `$while`.
    Directive(Directive),
    /// A preserved comment (only when the parser asks for comments).
    Comment(String),
    Newline,
    End,
    /// Lexical error; the message is reported through the parser's
    /// diagnostics machinery.
    Error(String),

    // Compound punctuation.
    Shl,
    Shr,
    NotEq,
    DblEq,
    PlusEq,
    StarEq,
    DivEq,
    MinusEq,
    ModEq,
    Arrow,
    FatArrow,
    SquigglyArrow,
    /// `$~>`: the not-nil view-pattern arrow.
    DollarSquigglyArrow,
    AmpAmp,
    PipePipe,
    Cmp,
    Leq,
    Geq,
    Inc,
    Dec,
    DotMaybe,
    DotDot,
    DotDotDot,
    MaybeEq,
    /// `??`: nil-coalescing.
    Wtf,
    /// `?:`: nil-coalescing conditional.
    Elvis,
    /// `::` in expression position: the check-match operator.
    CheckMatch,
}

/// Maps a greedily-lexed operator string to its fixed token kind, when it has
/// one. Unknown sequences become [`TokenKind::UserOp`].
#[must_use]
pub fn operator_token_kind(op: &str) -> Option<TokenKind> {
    Some(match op {
        "+" => TokenKind::Punct('+'),
        "-" => TokenKind::Punct('-'),
        "*" => TokenKind::Punct('*'),
        "/" => TokenKind::Punct('/'),
        "%" => TokenKind::Punct('%'),
        "=" => TokenKind::Punct('='),
        "<" => TokenKind::Punct('<'),
        ">" => TokenKind::Punct('>'),
        "!" => TokenKind::Punct('!'),
        "?" => TokenKind::Punct('?'),
        "@" => TokenKind::Punct('@'),
        "." => TokenKind::Punct('.'),
        ".." => TokenKind::DotDot,
        "..." => TokenKind::DotDotDot,
        "&" => TokenKind::Punct('&'),
        "|" => TokenKind::Punct('|'),
        "^" => TokenKind::Punct('^'),
        "~" => TokenKind::Punct('~'),
        "$" => TokenKind::Punct('$'),
        "<<" => TokenKind::Shl,
        ">>" => TokenKind::Shr,
        "!=" => TokenKind::NotEq,
        "==" => TokenKind::DblEq,
        "+=" => TokenKind::PlusEq,
        "*=" => TokenKind::StarEq,
        "/=" => TokenKind::DivEq,
        "-=" => TokenKind::MinusEq,
        "%=" => TokenKind::ModEq,
        "->" => TokenKind::Arrow,
        "=>" => TokenKind::FatArrow,
        "~>" => TokenKind::SquigglyArrow,
        "$~>" => TokenKind::DollarSquigglyArrow,
        "&&" => TokenKind::AmpAmp,
        "||" => TokenKind::PipePipe,
        "<=>" => TokenKind::Cmp,
        "<=" => TokenKind::Leq,
        ">=" => TokenKind::Geq,
        "++" => TokenKind::Inc,
        "--" => TokenKind::Dec,
        ".?" => TokenKind::DotMaybe,
        "?=" => TokenKind::MaybeEq,
        "??" => TokenKind::Wtf,
        "?:" => TokenKind::Elvis,
        _ => return None,
    })
}

/// Preprocessor directives recognized after `$`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum Directive {
    If,
    While,
}

/// A token: kind, span, the context it was lexed in, and bookkeeping flags.
#[derive(Debug, Clone)]
pub struct Token {
    pub kind: TokenKind,
    pub span: Span,
    pub ctx: LexContext,
    /// Set on tokens inside a preprocessor-controlled region.
    pub pp: bool,
    /// A newline (or newline-spanning comment) preceded this token while the
    /// parser had requested newline significance.
    pub nl: bool,
    /// Marked by the preprocessor when this token was skipped by `$if`; the
    /// parser's accessor steps over hidden tokens transparently.
    pub hidden: bool,
}

impl Token {
    #[must_use]
    pub fn new(kind: TokenKind, span: Span, ctx: LexContext) -> Self {
        Self {
            kind,
            span,
            ctx,
            pp: false,
            nl: false,
            hidden: false,
        }
    }

    #[must_use]
    pub fn is(&self, kind: &TokenKind) -> bool {
        self.kind == *kind
    }

    #[must_use]
    pub fn keyword(&self) -> Option<Keyword> {
        match self.kind {
            TokenKind::Keyword(kw) => Some(kw),
            _ => None,
        }
    }
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenKind::Keyword(kw) => write!(f, "keyword '{kw}'"),
            TokenKind::Id { module: Some(m), name } => write!(f, "identifier '{m}::{name}'"),
            TokenKind::Id { module: None, name } => write!(f, "identifier '{name}'"),
            TokenKind::Str(_) | TokenKind::Special(_) => write!(f, "string literal"),
            TokenKind::Regex(r) => write!(f, "regex /{}/", r.pattern),
            TokenKind::Integer(k) => write!(f, "integer '{k}'"),
            TokenKind::Real(x) => write!(f, "real '{x}'"),
            TokenKind::Punct(c) => write!(f, "'{c}'"),
            TokenKind::UserOp(op) => write!(f, "operator '{op}'"),
            TokenKind::Directive(d) => write!(f, "directive '${d}'"),
            TokenKind::Comment(_) => write!(f, "comment"),
            TokenKind::Newline => write!(f, "newline"),
            TokenKind::End => write!(f, "end of input"),
            TokenKind::Error(msg) => write!(f, "invalid token ({msg})"),
            TokenKind::Shl => write!(f, "'<<'"),
            TokenKind::Shr => write!(f, "'>>'"),
            TokenKind::NotEq => write!(f, "'!='"),
            TokenKind::DblEq => write!(f, "'=='"),
            TokenKind::PlusEq => write!(f, "'+='"),
            TokenKind::StarEq => write!(f, "'*='"),
            TokenKind::DivEq => write!(f, "'/='"),
            TokenKind::MinusEq => write!(f, "'-='"),
            TokenKind::ModEq => write!(f, "'%='"),
            TokenKind::Arrow => write!(f, "'->'"),
            TokenKind::FatArrow => write!(f, "'=>'"),
            TokenKind::SquigglyArrow => write!(f, "'~>'"),
            TokenKind::DollarSquigglyArrow => write!(f, "'$~>'"),
            TokenKind::AmpAmp => write!(f, "'&&'"),
            TokenKind::PipePipe => write!(f, "'||'"),
            TokenKind::Cmp => write!(f, "'<=>'"),
            TokenKind::Leq => write!(f, "'<='"),
            TokenKind::Geq => write!(f, "'>='"),
            TokenKind::Inc => write!(f, "'++'"),
            TokenKind::Dec => write!(f, "'--'"),
            TokenKind::DotMaybe => write!(f, "'.?'"),
            TokenKind::DotDot => write!(f, "'..'"),
            TokenKind::DotDotDot => write!(f, "'...'"),
            TokenKind::MaybeEq => write!(f, "'?='"),
            TokenKind::Wtf => write!(f, "'??'"),
            TokenKind::Elvis => write!(f, "'?:'"),
            TokenKind::CheckMatch => write!(f, "'::'"),
        }
    }
}
