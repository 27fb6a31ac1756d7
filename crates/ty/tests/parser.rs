//! Parser shape tests: precedence, patterns, save-points, operator table.

use ty::ast::{Assoc, BinOp, ExprKind, StmtKind};
use ty::location::SrcId;
use ty::parse::{NoMacros, OperatorTable, Parser, patternize};

fn parse_one_expr(src: &str) -> ty::ast::Expr {
    let mut p = Parser::new(SrcId(0), src, OperatorTable::new());
    p.parse_expr(0, &mut NoMacros).expect("parses")
}

fn parse_program(src: &str) -> Vec<ty::ast::Stmt> {
    let mut p = Parser::new(SrcId(0), src, OperatorTable::new());
    p.parse_program(&mut NoMacros).expect("parses")
}

#[test]
fn multiplication_binds_tighter_than_addition() {
    let e = parse_one_expr("1 + 2 * 3");
    let ExprKind::Binary { op: BinOp::Add, rhs, .. } = e.kind else {
        panic!("expected an addition at the root, got {:?}", e.kind);
    };
    assert!(matches!(rhs.kind, ExprKind::Binary { op: BinOp::Mul, .. }));
}

#[test]
fn comparison_is_looser_than_arithmetic() {
    let e = parse_one_expr("a + 1 < b * 2");
    assert!(matches!(e.kind, ExprKind::Binary { op: BinOp::Lt, .. }));
}

#[test]
fn assignment_is_right_associative() {
    let e = parse_one_expr("a = b = 1");
    let ExprKind::Assign { value, .. } = e.kind else {
        panic!("expected an assignment");
    };
    assert!(matches!(value.kind, ExprKind::Assign { .. }));
}

#[test]
fn unary_minus_only_in_prefix_position() {
    let e = parse_one_expr("a - -b");
    let ExprKind::Binary { op: BinOp::Sub, rhs, .. } = e.kind else {
        panic!("expected a subtraction");
    };
    assert!(matches!(rhs.kind, ExprKind::Unary { .. }));
}

#[test]
fn arrow_function_from_tuple() {
    let e = parse_one_expr("(a, b) -> a + b");
    let ExprKind::Function(f) = e.kind else {
        panic!("expected a function literal");
    };
    assert_eq!(f.params.len(), 2);
    assert_eq!(f.params[0].name, "a");
}

#[test]
fn method_call_and_member_access() {
    let e = parse_one_expr("xs.map(f).len");
    let ExprKind::Member { object, member, .. } = e.kind else {
        panic!("expected a member access at the root");
    };
    assert_eq!(member, "len");
    assert!(matches!(object.kind, ExprKind::MethodCall { .. }));
}

#[test]
fn keyword_method_names_lex_in_name_context() {
    let e = parse_one_expr("x.match");
    assert!(matches!(e.kind, ExprKind::Member { ref member, .. } if member == "match"));
}

#[test]
fn slice_with_semicolons() {
    let e = parse_one_expr("xs[1;5;2]");
    assert!(matches!(e.kind, ExprKind::Slice { .. }));
}

#[test]
fn operator_directive_changes_parse_shape() {
    // Low precedence: parses as (1 + 2) <&&&> (3 + 4).
    let stmts = parse_program("operator <&&&> 2 left\nlet x = 1 + 2 <&&&> 3 + 4");
    let StmtKind::Definition { value, .. } = &stmts[1].kind else {
        panic!("expected a definition");
    };
    let ExprKind::UserOp { name, lhs, .. } = &value.kind else {
        panic!("expected the user operator at the root, got {:?}", value.kind);
    };
    assert_eq!(name, "<&&&>");
    assert!(matches!(lhs.kind, ExprKind::Binary { op: BinOp::Add, .. }));

    // High precedence: the additions happen around it.
    let stmts = parse_program("operator <&&&> 20 left\nlet x = 1 + 2 <&&&> 3 + 4");
    let StmtKind::Definition { value, .. } = &stmts[1].kind else {
        panic!("expected a definition");
    };
    assert!(matches!(value.kind, ExprKind::Binary { op: BinOp::Add, .. }));
}

#[test]
fn operator_table_defaults() {
    let table = OperatorTable::new();
    let (prec, assoc) = table.lookup("<%>");
    assert_eq!(assoc, Assoc::Left);
    assert!(prec > 0);
}

#[test]
fn patternize_rewrites_are_idempotent() {
    let pat = parse_one_expr("[h, *t]");
    let once = patternize(pat);
    let twice = patternize(once.clone());
    assert_eq!(format!("{once:?}"), format!("{twice:?}"));
    let ExprKind::Array { elems, .. } = once.kind else {
        panic!("expected an array pattern");
    };
    assert!(matches!(elems[1].kind, ExprKind::MatchRest { .. }));
}

#[test]
fn call_of_name_patternizes_to_tag_pattern() {
    let pat = patternize(parse_one_expr("Some(x)"));
    assert!(matches!(pat.kind, ExprKind::TagPattern { .. }));
}

#[test]
fn match_statement_with_guards_and_commas() {
    let stmts = parse_program("match x { 1 => a(), n if n > 1 => b(), _ => c() }");
    let StmtKind::Match { cases, .. } = &stmts[0].kind else {
        panic!("expected a match statement");
    };
    assert_eq!(cases.len(), 3);
    assert!(cases[1].guard.is_some());
    assert!(matches!(cases[2].pattern.kind, ExprKind::MatchAny));
}

#[test]
fn try_catch_finally_shape() {
    let stmts = parse_program("try { a() } catch e { b() } finally { c() }");
    let StmtKind::Try { catches, finally, .. } = &stmts[0].kind else {
        panic!("expected a try statement");
    };
    assert_eq!(catches.len(), 1);
    assert!(finally.is_some());
}

#[test]
fn for_each_and_c_style_for() {
    let stmts = parse_program("for x in xs { } for let i = 0; i < 3; i = i + 1 { }");
    assert!(matches!(stmts[0].kind, StmtKind::Each { .. }));
    assert!(matches!(stmts[1].kind, StmtKind::For { .. }));
}

#[test]
fn break_carries_depth() {
    let stmts = parse_program("while a { break 2; }");
    let StmtKind::While { body, .. } = &stmts[0].kind else {
        panic!("expected a while loop");
    };
    let StmtKind::Block(inner) = &body.kind else {
        panic!("expected a block body");
    };
    assert!(matches!(inner[0].kind, StmtKind::Break { depth: 2 }));
}

#[test]
fn allow_errors_mode_recovers_per_statement() {
    let mut p = Parser::new(SrcId(0), "let = ; let ok = 1", OperatorTable::new());
    p.set_allow_errors(true);
    let stmts = p.parse_program(&mut NoMacros).expect("recovers");
    assert!(!p.errors().is_empty());
    assert!(stmts.iter().any(|s| matches!(&s.kind, StmtKind::Definition { .. })));
}

#[test]
fn spans_cover_their_source() {
    let src = "let x = 1 + 2";
    let stmts = parse_program(src);
    let span = stmts[0].span;
    assert!(span.start.offset < span.end.offset);
    assert!((span.end.offset as usize) <= src.len());
}
