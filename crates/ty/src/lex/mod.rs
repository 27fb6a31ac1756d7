//! Character stream to token stream.
//!
//! The lexer is context-driven: the parser asks for each token in a
//! [`LexContext`], and the same source characters produce different tokens in
//! prefix and infix positions (`/` begins a regex only in prefix position,
//! `-` is unary only in prefix position, and so on). State save/restore lets
//! the parser rewind and re-lex in a different context; lexing is a pure
//! function of `(source, position, context)`, so re-lexing is always
//! consistent.
//!
//! Failures never abort: the lexer produces an [`TokenKind::Error`] token and
//! leaves recovery to the parser's save-point machinery.

pub mod token;

use std::sync::Arc;

use crate::location::{Location, Span, SrcId};

pub use self::token::{
    Directive, Keyword, LexContext, RegexTok, SpecialStr, StrPart, Token, TokenKind, operator_token_kind,
};

/// Characters an operator may be built from.
const OP_CHARS: &str = "/=<~|!@%^&*-+>?.$";

/// Longest operator we will lex before giving up.
const MAX_OP_LEN: usize = 8;

/// A saved lexer position, used by the parser to rewind and re-lex.
#[derive(Debug, Clone, Copy)]
pub struct LexPos {
    pos: usize,
    loc: Location,
    need_nl: bool,
}

/// A pushed lexing region, for re-entering interpolated expressions and
/// macro-provided source without losing the outer position.
#[derive(Debug, Clone, Copy)]
struct LexFrame {
    pos: usize,
    end: usize,
    loc: Location,
}

/// The lexer over one source buffer.
#[derive(Debug)]
pub struct Lexer<'s> {
    src: &'s str,
    bytes: &'s [u8],
    srcid: SrcId,
    pos: usize,
    end: usize,
    loc: Location,
    start: Location,
    need_nl: bool,
    keep_comments: bool,
    states: Vec<LexFrame>,
}

impl<'s> Lexer<'s> {
    /// Creates a lexer over `src`. A shebang on the first line is discarded.
    #[must_use]
    pub fn new(srcid: SrcId, src: &'s str) -> Self {
        let mut lexer = Self {
            src,
            bytes: src.as_bytes(),
            srcid,
            pos: 0,
            end: src.len(),
            loc: Location::default(),
            start: Location::default(),
            need_nl: false,
            keep_comments: false,
            states: Vec::new(),
        };
        if src.starts_with("#!") {
            while lexer.peek(0) != '\0' && lexer.peek(0) != '\n' {
                lexer.advance();
            }
        }
        lexer
    }

    /// The parser wants a newline token at the next line boundary.
    pub fn set_need_newline(&mut self, need: bool) {
        self.need_nl = need;
    }

    /// Whether comments are returned as tokens instead of skipped.
    pub fn set_keep_comments(&mut self, keep: bool) {
        self.keep_comments = keep;
    }

    /// Saves the current position for a later [`Lexer::rewind`].
    #[must_use]
    pub fn mark(&self) -> LexPos {
        LexPos {
            pos: self.pos,
            loc: self.loc,
            need_nl: self.need_nl,
        }
    }

    /// Rewinds to a previously saved position.
    pub fn rewind(&mut self, mark: LexPos) {
        self.pos = mark.pos;
        self.loc = mark.loc;
        self.need_nl = mark.need_nl;
    }

    /// Restricts lexing to the byte range `[pos, end)` starting at `loc`,
    /// saving the current region. Used to lex interpolated expressions and
    /// preprocessor regions in place.
    pub fn push_region(&mut self, pos: usize, end: usize, loc: Location) {
        self.states.push(LexFrame {
            pos: self.pos,
            end: self.end,
            loc: self.loc,
        });
        self.pos = pos;
        self.end = end;
        self.loc = loc;
    }

    /// Pops a region pushed by [`Lexer::push_region`].
    pub fn pop_region(&mut self) {
        let frame = self.states.pop().expect("pop_region with no pushed region");
        self.pos = frame.pos;
        self.end = frame.end;
        self.loc = frame.loc;
    }

    /// Peeks at the byte `n` positions ahead as a char. Only meaningful for
    /// ASCII structure; literal content goes through [`Lexer::take_run`] and
    /// [`Lexer::take_char`], which slice the source and keep multi-byte
    /// characters intact.
    fn peek(&self, n: usize) -> char {
        if self.pos + n < self.end { self.bytes[self.pos + n] as char } else { '\0' }
    }

    fn advance(&mut self) -> char {
        let c = self.peek(0);
        if c == '\n' {
            self.loc.line += 1;
            self.loc.col = 0;
        } else {
            self.loc.col += 1;
        }
        self.pos += 1;
        self.loc.offset = self.pos as u32;
        c
    }

    /// Appends a run of plain literal content to `out`, stopping before a
    /// backslash, any byte in `stops`, or end of input. The run is sliced
    /// straight out of the source buffer, so multi-byte UTF-8 sequences pass
    /// through byte-for-byte.
    fn take_run(&mut self, out: &mut String, stops: &[u8]) {
        let start = self.pos;
        while self.pos < self.end {
            let b = self.bytes[self.pos];
            if b == b'\\' || stops.contains(&b) {
                break;
            }
            self.advance();
        }
        out.push_str(&self.src[start..self.pos]);
    }

    /// Appends the full character at the current position to `out` and
    /// advances past all of its bytes.
    fn take_char(&mut self, out: &mut String) {
        let Some(c) = self.src[self.pos..self.end].chars().next() else {
            return;
        };
        let start = self.pos;
        for _ in 0..c.len_utf8() {
            self.advance();
        }
        out.push_str(&self.src[start..self.pos]);
    }

    fn span(&self) -> Span {
        Span::new(self.srcid, self.start, self.loc)
    }

    fn make(&self, kind: TokenKind, ctx: LexContext) -> Token {
        Token::new(kind, self.span(), ctx)
    }

    fn error(&self, message: impl Into<String>, ctx: LexContext) -> Token {
        self.make(TokenKind::Error(message.into()), ctx)
    }

    fn have_id(&self) -> bool {
        let c = self.peek(0);
        if c == ':' && self.peek(1) == ':' && self.peek(2).is_ascii_alphabetic() {
            return true;
        }
        c.is_ascii_alphabetic() || c == '_'
    }

    /// Skips whitespace; true when a newline was crossed while the parser had
    /// requested newline significance.
    fn skip_space(&mut self) -> bool {
        let mut nl = false;
        while self.peek(0).is_ascii_whitespace() {
            if self.peek(0) == '\n' && self.need_nl {
                nl = true;
                self.need_nl = false;
            }
            self.advance();
        }
        nl
    }

    /// The main entry point: lexes one token in the given context.
    pub fn token(&mut self, ctx: LexContext) -> Token {
        if self.skip_space() {
            self.start = self.loc;
            return self.make(TokenKind::Newline, ctx);
        }

        self.start = self.loc;

        while self.pos < self.end {
            let (c0, c1) = (self.peek(0), self.peek(1));
            if c0 == '/' && c1 == '*' {
                match self.block_comment(ctx) {
                    Some(tok) => return tok,
                    None => {
                        if self.skip_space() {
                            return self.make(TokenKind::Newline, ctx);
                        }
                        self.start = self.loc;
                        continue;
                    }
                }
            }
            if c0 == '/' && c1 == '/' {
                match self.line_comment(ctx) {
                    Some(tok) => return tok,
                    None => {
                        if self.skip_space() {
                            return self.make(TokenKind::Newline, ctx);
                        }
                        self.start = self.loc;
                        continue;
                    }
                }
            }
            if matches!(ctx, LexContext::Fmt | LexContext::XFmt) {
                return self.lex_fmt_spec(ctx);
            }
            if ctx == LexContext::Prefix && c0 == '/' {
                return self.lex_regex(ctx);
            }
            if self.have_id() {
                return self.lex_word(ctx);
            }
            if c0 == ':' && c1 == ':' && !OP_CHARS.contains(self.peek(2)) {
                self.advance();
                self.advance();
                return self.make(TokenKind::CheckMatch, ctx);
            }
            if ctx == LexContext::Prefix {
                if c0 == '-' && c1 == '>' {
                    self.advance();
                    self.advance();
                    return self.make(TokenKind::Arrow, ctx);
                }
                if c0 == '-' && c1 != '-' {
                    self.advance();
                    return self.make(TokenKind::Punct('-'), ctx);
                }
                if c0 == '$' {
                    if let Some(tok) = self.lex_directive(ctx) {
                        return tok;
                    }
                }
                if matches!(c0, '#' | '&' | '!' | '?' | '$') {
                    self.advance();
                    return self.make(TokenKind::Punct(c0), ctx);
                }
                if c0 == '*' {
                    self.advance();
                    return self.make(TokenKind::Punct('*'), ctx);
                }
            }
            if OP_CHARS.contains(c0) || (c0 == ':' && OP_CHARS.contains(c1) && c1 != '-') {
                return self.lex_operator(ctx);
            }
            if c0.is_ascii_digit() {
                return self.lex_number(ctx);
            }
            if c0 == '\'' {
                return self.lex_raw_string(ctx);
            }
            if c0 == '"' {
                return self.lex_special_string(ctx);
            }
            let c = self.advance();
            if !c.is_ascii() {
                return self.error("unexpected non-ASCII byte outside of a literal", ctx);
            }
            return self.make(TokenKind::Punct(c), ctx);
        }

        self.make(TokenKind::End, ctx)
    }

    /// Lexes an identifier or keyword, with `::` module qualifiers and the
    /// `!`/`?` identifier suffixes.
    fn lex_word(&mut self, ctx: LexContext) -> Token {
        let mut module = String::new();
        let mut word = String::new();
        let mut has_module = false;

        loop {
            while self.peek(0).is_ascii_alphanumeric() || self.peek(0) == '_' {
                word.push(self.advance());
            }

            if self.peek(0) == ':' && self.peek(1) == ':' {
                has_module = true;
                self.advance();
                self.advance();
                if !module.is_empty() {
                    module.push('/');
                }
                module.push_str(&word);
                word.clear();
                if !self.peek(0).is_ascii_alphabetic() && self.peek(0) != '_' {
                    return self.error("expected name after '::' in identifier", ctx);
                }
            } else {
                break;
            }
        }

        // Identifiers may end in '?' or '!': [1, 2, 3].map!(a -> a + 1)
        if self.peek(0) == '!' || self.peek(0) == '?' {
            word.push(self.advance());
        }

        if !has_module && ctx != LexContext::Name {
            if let Ok(kw) = word.parse::<Keyword>() {
                self.need_nl |= matches!(kw, Keyword::Import | Keyword::Export | Keyword::Operator);
                return self.make(TokenKind::Keyword(kw), ctx);
            }
        }

        self.make(
            TokenKind::Id {
                module: has_module.then_some(module),
                name: word,
            },
            ctx,
        )
    }

    /// Single-quoted raw string: only `\n`, `\r`, `\t`, `\\`, `\'` escapes.
    fn lex_raw_string(&mut self, ctx: LexContext) -> Token {
        let mut s = String::new();
        self.advance();

        loop {
            match self.peek(0) {
                '\0' => return self.error("unterminated string literal", ctx),
                '\'' => break,
                '\\' => {
                    self.advance();
                    match self.peek(0) {
                        '\0' => return self.error("unterminated string literal", ctx),
                        'n' => {
                            self.advance();
                            s.push('\n');
                        }
                        'r' => {
                            self.advance();
                            s.push('\r');
                        }
                        't' => {
                            self.advance();
                            s.push('\t');
                        }
                        _ => self.take_char(&mut s),
                    }
                }
                _ => self.take_run(&mut s, &[b'\'']),
            }
        }

        self.advance();
        self.make(TokenKind::Str(s), ctx)
    }

    /// Captures the raw text of a `{ expr }` interpolation, balancing braces.
    fn capture_expr(&mut self) -> Option<(String, Location)> {
        let start_loc = self.loc;
        let start_pos = self.pos;
        let mut depth = 1usize;
        loop {
            match self.peek(0) {
                '\0' => return None,
                '{' => depth += 1,
                '}' => {
                    depth -= 1;
                    if depth == 0 {
                        break;
                    }
                }
                _ => {}
            }
            self.advance();
        }
        let text = self.src[start_pos..self.pos].to_string();
        Some((text, start_loc))
    }

    /// Double-quoted "special string": literal fragments, `%fmt` specs, and
    /// `{ expr }` interpolations.
    fn lex_special_string(&mut self, ctx: LexContext) -> Token {
        let mut parts = Vec::new();
        let mut lit = String::new();
        let mut fmt: Option<(String, Location)> = None;

        self.advance();

        loop {
            match self.peek(0) {
                '\0' => return self.error("unterminated string literal", ctx),
                '"' => break,
                '{' => {
                    self.advance();
                    if !lit.is_empty() {
                        parts.push(StrPart::Lit(std::mem::take(&mut lit)));
                    }
                    let Some((text, start)) = self.capture_expr() else {
                        return self.error("unterminated expression in interpolated string", ctx);
                    };
                    self.advance();
                    parts.push(StrPart::Expr {
                        text,
                        start,
                        fmt: fmt.take(),
                    });
                }
                '%' => {
                    self.advance();
                    if self.peek(0) == '%' {
                        self.advance();
                        lit.push('%');
                    } else {
                        let spec_loc = self.loc;
                        let spec_start = self.pos;
                        while !matches!(self.peek(0), '\0' | '{' | '"') {
                            self.advance();
                        }
                        if self.peek(0) != '{' {
                            return self.error("unterminated format specifier", ctx);
                        }
                        fmt = Some((self.src[spec_start..self.pos].to_string(), spec_loc));
                    }
                }
                '\\' => {
                    self.advance();
                    match self.peek(0) {
                        '\0' => return self.error("unterminated string literal", ctx),
                        'n' => {
                            self.advance();
                            lit.push('\n');
                        }
                        'r' => {
                            self.advance();
                            lit.push('\r');
                        }
                        't' => {
                            self.advance();
                            lit.push('\t');
                        }
                        _ => self.take_char(&mut lit),
                    }
                }
                _ => self.take_run(&mut lit, &[b'"', b'{', b'%']),
            }
        }

        self.advance();
        if !lit.is_empty() || parts.is_empty() {
            parts.push(StrPart::Lit(lit));
        }
        self.make(TokenKind::Special(SpecialStr { parts }), ctx)
    }

    /// `/pattern/flags` with `i` and `u` flags, compiled eagerly.
    fn lex_regex(&mut self, ctx: LexContext) -> Token {
        let mut pat = String::new();
        self.advance();

        loop {
            match self.peek(0) {
                '\0' => return self.error(format!("unterminated regular expression: /{pat}..."), ctx),
                '/' => break,
                '\\' => {
                    if self.peek(1) == '\0' {
                        return self.error(format!("unterminated regular expression: /{pat}..."), ctx);
                    }
                    if self.peek(1) == '/' {
                        self.advance();
                        pat.push('/');
                        self.advance();
                    } else {
                        self.advance();
                        pat.push('\\');
                        self.take_char(&mut pat);
                    }
                }
                _ => self.take_run(&mut pat, &[b'/']),
            }
        }

        self.advance();

        let mut ci = false;
        let mut utf = false;
        while self.peek(0).is_ascii_alphabetic() {
            match self.peek(0) {
                'i' => ci = true,
                'u' => utf = true,
                c => return self.error(format!("invalid regex flag: '{c}'"), ctx),
            }
            self.advance();
        }

        let full = if ci { format!("(?i){pat}") } else { pat.clone() };
        match fancy_regex::Regex::new(&full) {
            Ok(re) => self.make(
                TokenKind::Regex(RegexTok {
                    pattern: pat,
                    ci,
                    utf,
                    re: Arc::new(re),
                }),
                ctx,
            ),
            Err(err) => self.error(format!("error compiling regular expression: /{pat}/: {err}"), ctx),
        }
    }

    /// Decimal/hex/octal/binary integers, `<base>r<digits>` radix integers,
    /// and reals with optional exponent.
    fn lex_number(&mut self, ctx: LexContext) -> Token {
        // Scanning works on an owned copy so position advancement below
        // stays simple.
        let rest = self.src[self.pos..self.end].to_string();
        let rest = rest.as_str();

        let (radix, digits_at) = if rest.starts_with("0x") || rest.starts_with("0X") {
            (16, 2)
        } else if rest.starts_with("0o") || rest.starts_with("0O") {
            (8, 2)
        } else if rest.starts_with("0b") || rest.starts_with("0B") {
            (2, 2)
        } else {
            (10, 0)
        };

        let body = &rest[digits_at..];
        let digit_len = body
            .char_indices()
            .take_while(|&(_, c)| c.is_digit(radix))
            .last()
            .map_or(0, |(i, c)| i + c.len_utf8());

        if digit_len == 0 {
            // "0x" with nothing after it; consume the prefix so we make progress.
            for _ in 0..digits_at.max(1) {
                self.advance();
            }
            return self.error("invalid numeric literal", ctx);
        }

        let total = digits_at + digit_len;
        let after = rest[total..].chars().next().unwrap_or('\0');
        let after2 = rest[total..].chars().nth(1).unwrap_or('\0');

        // Real literal: a '.' not followed by an identifier character or
        // another '.' (which would be a range).
        if radix == 10 && after == '.' && !after2.is_ascii_alphabetic() && after2 != '_' && after2 != '.' {
            return self.lex_real(rest, total, ctx);
        }

        let text = &rest[digits_at..total];
        let Ok(value) = i64::from_str_radix(text, radix) else {
            for _ in 0..total {
                self.advance();
            }
            return self.error("invalid numeric literal: value out of range", ctx);
        };

        // Base-N literal: 36rZZ.
        if radix == 10 && after == 'r' {
            return self.lex_radix_integer(rest, total, value, ctx);
        }

        for _ in 0..total {
            self.advance();
        }
        if self.peek(0).is_ascii_alphanumeric() {
            return self.error(format!("trailing character after numeric literal: '{}'", self.peek(0)), ctx);
        }
        self.make(TokenKind::Integer(value), ctx)
    }

    fn lex_real(&mut self, rest: &str, int_len: usize, ctx: LexContext) -> Token {
        let mut len = int_len + 1;
        while rest[len..].starts_with(|c: char| c.is_ascii_digit()) {
            len += 1;
        }
        if rest[len..].starts_with(['e', 'E']) {
            let mut elen = len + 1;
            if rest[elen..].starts_with(['+', '-']) {
                elen += 1;
            }
            if rest[elen..].starts_with(|c: char| c.is_ascii_digit()) {
                len = elen;
                while rest[len..].starts_with(|c: char| c.is_ascii_digit()) {
                    len += 1;
                }
            }
        }

        let Ok(value) = rest[..len].parse::<f64>() else {
            for _ in 0..len {
                self.advance();
            }
            return self.error("invalid numeric literal", ctx);
        };

        for _ in 0..len {
            self.advance();
        }
        if self.peek(0).is_ascii_alphanumeric() {
            return self.error(format!("trailing character after numeric literal: '{}'", self.peek(0)), ctx);
        }
        self.make(TokenKind::Real(value), ctx)
    }

    fn lex_radix_integer(&mut self, rest: &str, prefix_len: usize, base: i64, ctx: LexContext) -> Token {
        if !(2..=36).contains(&base) {
            for _ in 0..prefix_len {
                self.advance();
            }
            return self.error(format!("invalid radix in numeric literal: {base}"), ctx);
        }
        let radix = base as u32;
        let body = &rest[prefix_len + 1..];
        let digit_len = body
            .char_indices()
            .take_while(|&(_, c)| c.is_digit(radix))
            .last()
            .map_or(0, |(i, c)| i + c.len_utf8());
        let Ok(value) = i64::from_str_radix(&body[..digit_len], radix) else {
            for _ in 0..prefix_len {
                self.advance();
            }
            return self.error("invalid numeric literal", ctx);
        };
        for _ in 0..prefix_len + 1 + digit_len {
            self.advance();
        }
        if self.peek(0).is_ascii_alphanumeric() {
            return self.error(format!("trailing character after numeric literal: '{}'", self.peek(0)), ctx);
        }
        self.make(TokenKind::Integer(value), ctx)
    }

    /// Greedy operator lexing over [`OP_CHARS`]; known sequences become fixed
    /// tokens, everything else a user operator.
    fn lex_operator(&mut self, ctx: LexContext) -> Token {
        let mut op = String::new();
        loop {
            let c = self.peek(0);
            let continues = OP_CHARS.contains(c) || (c == ':' && OP_CHARS.contains(self.peek(1)) && self.peek(1) != '-');
            if !continues {
                break;
            }
            if op.len() == MAX_OP_LEN {
                return self.error(format!("operator contains too many characters: '{op}...'"), ctx);
            }
            op.push(self.advance());
        }

        match operator_token_kind(&op) {
            Some(kind) => self.make(kind, ctx),
            None => self.make(TokenKind::UserOp(op), ctx),
        }
    }

    /// `$if` / `$while` preprocessor directives. Returns `None` when the `$`
    /// isn't one, leaving the position untouched.
    fn lex_directive(&mut self, ctx: LexContext) -> Option<Token> {
        for d in ["if", "while"] {
            let end = self.pos + 1 + d.len();
            if self.src[self.pos + 1..self.end].starts_with(d) {
                let after = if end < self.end { self.bytes[end] as char } else { '\0' };
                if !after.is_ascii_alphanumeric() && after != '_' {
                    self.advance();
                    for _ in 0..d.len() {
                        self.advance();
                    }
                    let dir = d.parse::<Directive>().expect("directive name parses");
                    let mut tok = self.make(TokenKind::Directive(dir), ctx);
                    tok.pp = true;
                    return Some(tok);
                }
            }
        }
        None
    }

    /// `Fmt`/`XFmt` context: scan a raw format spec up to the next `{` (or
    /// closing quote in `XFmt`).
    fn lex_fmt_spec(&mut self, ctx: LexContext) -> Token {
        let start = self.pos;
        let stop = if ctx == LexContext::XFmt { b'"' } else { b'{' };
        while self.pos < self.end {
            let b = self.bytes[self.pos];
            if b == b'{' || b == stop {
                break;
            }
            self.advance();
        }
        let spec = self.src[start..self.pos].to_string();
        self.make(TokenKind::Str(spec), ctx)
    }

    /// `// …` comment. Returns a token when comments are preserved or a
    /// significant newline was pending.
    fn line_comment(&mut self, ctx: LexContext) -> Option<Token> {
        self.advance();
        self.advance();
        let need_nl = self.need_nl;
        let text_start = self.pos;

        while self.peek(0) != '\n' && self.peek(0) != '\0' {
            self.advance();
        }
        let text = self.src[text_start..self.pos].to_string();
        self.advance();
        self.need_nl = false;

        if self.keep_comments {
            return Some(self.make(TokenKind::Comment(text), ctx));
        }
        if need_nl {
            self.start = self.loc;
            return Some(self.make(TokenKind::Newline, ctx));
        }
        self.start = self.loc;
        None
    }

    /// `/* … */` comment, nesting allowed.
    fn block_comment(&mut self, ctx: LexContext) -> Option<Token> {
        self.advance();
        self.advance();
        let text_start = self.pos;

        let mut level = 1;
        while self.peek(0) != '\0' && level != 0 {
            if self.peek(0) == '/' && self.peek(1) == '*' {
                level += 1;
            }
            if self.peek(0) == '*' && self.peek(1) == '/' {
                level -= 1;
            }
            self.advance();
        }

        if level != 0 {
            return Some(self.error("unterminated comment", ctx));
        }

        let text = self.src[text_start..self.pos - 1].to_string();
        self.advance();

        if self.keep_comments {
            return Some(self.make(TokenKind::Comment(text), ctx));
        }
        self.start = self.loc;
        None
    }
}
