//! Lexer behavior: context sensitivity, literals, rewind purity.

use pretty_assertions::assert_eq;
use ty::lex::{Lexer, token::{Keyword, LexContext, TokenKind}};
use ty::location::SrcId;

fn kinds(src: &str, ctx: LexContext) -> Vec<TokenKind> {
    let mut lexer = Lexer::new(SrcId(0), src);
    let mut out = Vec::new();
    loop {
        let t = lexer.token(ctx);
        let end = matches!(t.kind, TokenKind::End);
        out.push(t.kind);
        if end {
            break;
        }
    }
    out
}

#[test]
fn keywords_and_identifiers() {
    let ks = kinds("let x = nil", LexContext::Prefix);
    assert_eq!(ks[0], TokenKind::Keyword(Keyword::Let));
    assert!(matches!(&ks[1], TokenKind::Id { module: None, name } if name == "x"));
    assert_eq!(ks[2], TokenKind::Punct('='));
    assert_eq!(ks[3], TokenKind::Keyword(Keyword::Nil));
}

#[test]
fn identifier_suffix_characters() {
    let ks = kinds("map! empty?", LexContext::Prefix);
    assert!(matches!(&ks[0], TokenKind::Id { name, .. } if name == "map!"));
    assert!(matches!(&ks[1], TokenKind::Id { name, .. } if name == "empty?"));
}

#[test]
fn module_qualified_identifier() {
    let ks = kinds("math::pi", LexContext::Prefix);
    assert!(matches!(&ks[0], TokenKind::Id { module: Some(m), name } if m == "math" && name == "pi"));
}

#[test]
fn slash_is_regex_in_prefix_and_division_in_infix() {
    let mut lexer = Lexer::new(SrcId(0), "/ab/i");
    let t = lexer.token(LexContext::Prefix);
    match t.kind {
        TokenKind::Regex(r) => {
            assert_eq!(r.pattern, "ab");
            assert!(r.ci);
        }
        other => panic!("expected a regex, got {other:?}"),
    }

    let mut lexer = Lexer::new(SrcId(0), "/ ab");
    let t = lexer.token(LexContext::Infix);
    assert_eq!(t.kind, TokenKind::Punct('/'));
}

#[test]
fn numbers_in_all_bases() {
    let ks = kinds("42 0x2a 0o52 0b101010 36rZZ", LexContext::Infix);
    assert_eq!(ks[0], TokenKind::Integer(42));
    assert_eq!(ks[1], TokenKind::Integer(42));
    assert_eq!(ks[2], TokenKind::Integer(42));
    assert_eq!(ks[3], TokenKind::Integer(42));
    assert_eq!(ks[4], TokenKind::Integer(35 * 36 + 35));
}

#[test]
fn reals_need_a_nonadjacent_dot() {
    let ks = kinds("1.5 1..3", LexContext::Infix);
    assert_eq!(ks[0], TokenKind::Real(1.5));
    assert_eq!(ks[1], TokenKind::Integer(1));
    assert_eq!(ks[2], TokenKind::DotDot);
    assert_eq!(ks[3], TokenKind::Integer(3));
}

#[test]
fn raw_string_escapes() {
    let ks = kinds(r"'a\nb\'c'", LexContext::Prefix);
    assert_eq!(ks[0], TokenKind::Str("a\nb'c".to_string()));
}

#[test]
fn multibyte_text_survives_string_literals() {
    let ks = kinds("'héllo wörld — ツ'", LexContext::Prefix);
    assert_eq!(ks[0], TokenKind::Str("héllo wörld — ツ".to_string()));

    // Multi-byte characters adjacent to escapes keep their bytes too.
    let ks = kinds("'é\\né'", LexContext::Prefix);
    assert_eq!(ks[0], TokenKind::Str("é\né".to_string()));
}

#[test]
fn multibyte_text_survives_interpolated_fragments() {
    let mut lexer = Lexer::new(SrcId(0), "\"héllo {x}ツ\"");
    let t = lexer.token(LexContext::Prefix);
    let TokenKind::Special(s) = t.kind else {
        panic!("expected a special string");
    };
    assert_eq!(s.parts.len(), 3);
    assert!(matches!(&s.parts[0], ty::lex::token::StrPart::Lit(l) if l == "héllo "));
    assert!(matches!(&s.parts[2], ty::lex::token::StrPart::Lit(l) if l == "ツ"));
}

#[test]
fn multibyte_text_survives_regex_patterns() {
    let mut lexer = Lexer::new(SrcId(0), "/é+/");
    let t = lexer.token(LexContext::Prefix);
    match t.kind {
        TokenKind::Regex(r) => assert_eq!(r.pattern, "é+"),
        other => panic!("expected a regex, got {other:?}"),
    }
}

#[test]
fn special_string_captures_fragments_and_expressions() {
    let mut lexer = Lexer::new(SrcId(0), "\"x = {a + 1}!\"");
    let t = lexer.token(LexContext::Prefix);
    let TokenKind::Special(s) = t.kind else {
        panic!("expected a special string");
    };
    assert_eq!(s.parts.len(), 3);
    match &s.parts[1] {
        ty::lex::token::StrPart::Expr { text, .. } => assert_eq!(text, "a + 1"),
        other => panic!("expected an interpolation, got {other:?}"),
    }
}

#[test]
fn format_spec_attaches_to_interpolation() {
    let mut lexer = Lexer::new(SrcId(0), "\"%.2f{x}\"");
    let t = lexer.token(LexContext::Prefix);
    let TokenKind::Special(s) = t.kind else {
        panic!("expected a special string");
    };
    match &s.parts[0] {
        ty::lex::token::StrPart::Expr { fmt: Some((spec, _)), .. } => assert_eq!(spec, ".2f"),
        other => panic!("expected a formatted interpolation, got {other:?}"),
    }
}

#[test]
fn operators_lex_greedily_into_user_ops() {
    let ks = kinds("a <+> b", LexContext::Infix);
    assert_eq!(ks[1], TokenKind::UserOp("<+>".to_string()));
}

#[test]
fn operator_length_is_bounded() {
    let mut lexer = Lexer::new(SrcId(0), "a <<>><<>><<>> b");
    let _ = lexer.token(LexContext::Infix);
    let t = lexer.token(LexContext::Infix);
    assert!(matches!(t.kind, TokenKind::Error(_)));
}

#[test]
fn check_match_token() {
    let ks = kinds("x :: y", LexContext::Infix);
    assert_eq!(ks[1], TokenKind::CheckMatch);
}

#[test]
fn comments_skip_and_nest() {
    let ks = kinds("1 /* outer /* inner */ still */ 2 // end", LexContext::Infix);
    assert_eq!(ks[0], TokenKind::Integer(1));
    assert_eq!(ks[1], TokenKind::Integer(2));
    assert_eq!(ks[2], TokenKind::End);
}

#[test]
fn shebang_is_discarded() {
    let ks = kinds("#!/usr/bin/env ty\n42", LexContext::Prefix);
    assert_eq!(ks[0], TokenKind::Integer(42));
}

#[test]
fn rewind_relexes_identically() {
    let src = "foo + / 2 - 'str'";
    let mut lexer = Lexer::new(SrcId(0), src);
    let mark = lexer.mark();
    let first: Vec<String> = (0..5).map(|_| format!("{:?}", lexer.token(LexContext::Infix).kind)).collect();
    lexer.rewind(mark);
    let second: Vec<String> = (0..5).map(|_| format!("{:?}", lexer.token(LexContext::Infix).kind)).collect();
    assert_eq!(first, second);
}

#[test]
fn token_spans_are_well_formed() {
    let src = "let answer = 42";
    let mut lexer = Lexer::new(SrcId(0), src);
    loop {
        let t = lexer.token(LexContext::Prefix);
        assert!(t.span.start.offset <= t.span.end.offset);
        assert!((t.span.end.offset as usize) <= src.len());
        if matches!(t.kind, TokenKind::End) {
            break;
        }
    }
}
