//! Pattern-matching behavior: binding policies, composite patterns, views,
//! regex captures, and the no-partial-bind guarantee.

use pretty_assertions::assert_eq;
use ty::Runner;

fn run(src: &str) -> String {
    let (runner, output) = Runner::new_collecting(src, "patterns.ty").expect("compiles");
    runner.run().expect("runs");
    output.contents()
}

#[test]
fn underscore_matches_nil_but_identifiers_do_not() {
    assert_eq!(run("match nil { _ => print('any') }"), "any\n");
    assert_eq!(run("match nil { x => print('bound'), _ => print('fell through') }"), "fell through\n");
}

#[test]
fn match_not_nil_binds() {
    assert_eq!(run("match 5 { $x => print(x) }"), "5\n");
}

#[test]
fn literal_patterns_compare_structurally() {
    assert_eq!(run("match 'abc' { 'abc' => print('hit'), _ => print('miss') }"), "hit\n");
    assert_eq!(run("match [1, 2] { [1, 3] => print('a'), [1, 2] => print('b') }"), "b\n");
}

#[test]
fn array_length_is_verified_without_rest() {
    assert_eq!(run("match [1, 2, 3] { [a, b] => print('two'), [a, b, c] => print('three') }"), "three\n");
}

#[test]
fn nested_tag_patterns() {
    let src = "tag Some, Wrap; \
        match Wrap(Some(7)) { Wrap(Some(x)) => print(x), _ => print('no') }";
    assert_eq!(run(src), "7\n");
}

#[test]
fn tag_stacks_keep_nestings_distinct() {
    let src = "tag Some; \
        match Some(Some(1)) { Some(Some(x)) => print('two deep', x), Some(x) => print('one deep') }";
    assert_eq!(run(src), "two deep, 1\n");
}

#[test]
fn dict_patterns_match_by_key() {
    let src = "match %{'name': 'ada', 'age': 36} { %{'name': n} => print(n), _ => print('no') }";
    assert_eq!(run(src), "ada\n");
}

#[test]
fn choice_pattern_takes_first_matching_alternative() {
    assert_eq!(run("match 4 { 1, 2 => print('small'), 3, 4 => print('mid') }"), "mid\n");
}

#[test]
fn view_pattern_applies_function() {
    let src = "function double(x) { return x * 2; } \
        match 21 { double ~> 42 => print('yes'), _ => print('no') }";
    assert_eq!(run(src), "yes\n");
}

#[test]
fn view_pattern_binds_result() {
    let src = "function half(x) { return x / 2; } \
        match 10 { half ~> h => print(h) }";
    assert_eq!(run(src), "5\n");
}

#[test]
fn not_nil_view_rejects_nil_results() {
    let src = "function evens(x) { if x % 2 == 0 return x; return nil; } \
        match 3 { evens $~> v => print('even', v), _ => print('odd') }";
    assert_eq!(run(src), "odd\n");
}

#[test]
fn alias_pattern_binds_whole_subject() {
    assert_eq!(run("match [1, 2] { [a, b] as whole => print(a, b, whole) }"), "1, 2, [1, 2]\n");
}

#[test]
fn regex_pattern_with_named_groups() {
    let src = "match 'v1.25' { /v(?<major>\\d+)\\.(?<minor>\\d+)/ => print(major, minor), _ => print('no') }";
    assert_eq!(run(src), "1, 25\n");
}

#[test]
fn regex_pattern_requires_string_subject() {
    assert_eq!(run("match 42 { /x/ => print('yes'), _ => print('no') }"), "no\n");
}

#[test]
fn guards_fall_through_to_later_arms() {
    assert_eq!(run("match 5 { x if x > 10 => print('big'), x => print('small', x) }"), "small, 5\n");
}

#[test]
fn destructuring_definition() {
    assert_eq!(run("let [a, b, *rest] = [1, 2, 3, 4]; print(a, b, rest)"), "1, 2, [3, 4]\n");
    assert_eq!(run("let (x, y) = (10, 20); print(x + y)"), "30\n");
}

#[test]
fn untagging_assignment() {
    assert_eq!(run("tag Box; let Box(v) = Box(9); print(v)"), "9\n");
}

#[test]
fn tuple_patterns_in_match() {
    assert_eq!(run("match (1, 'two') { (a, b) => print(b, a) }"), "two, 1\n");
}

#[test]
fn bad_match_is_catchable() {
    let out = run("try { match 1 { 2 => print('no') } } catch MatchError(m) { print('caught') }");
    assert_eq!(out, "caught\n");
}
