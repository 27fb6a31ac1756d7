//! End-to-end programs run through the public `Runner`, checking stdout.

use pretty_assertions::assert_eq;
use ty::Runner;

fn run(src: &str) -> String {
    let (runner, output) = Runner::new_collecting(src, "test.ty").expect("compiles");
    runner.run().expect("runs");
    output.contents()
}

#[test]
fn factorial_via_recursion() {
    let out = run("function f(n) { if n <= 1 return 1; return n * f(n - 1); } print(f(5))");
    assert_eq!(out, "120\n");
}

#[test]
fn tag_sum_type() {
    let out = run(
        "tag Ok, Err; \
         function div(a, b) { if b == 0 return Err('div0'); return Ok(a / b); } \
         match div(10, 0) { Ok(x) => print(x), Err(m) => print(m) }",
    );
    assert_eq!(out, "div0\n");
}

#[test]
fn closure_capture() {
    let out = run(
        "function counter() { let n = 0; return () -> { n = n + 1; return n; } } \
         let c = counter(); print(c(), c(), c())",
    );
    assert_eq!(out, "1, 2, 3\n");
}

#[test]
fn pattern_with_rest_and_guard() {
    let out = run("match [1,2,3,4] { [h, *t] if h == 1 => print(t) }");
    assert_eq!(out, "[2, 3, 4]\n");
}

#[test]
fn exception_with_finally() {
    let out = run("try { throw 'x' } catch e { print('caught', e) } finally { print('done') }");
    assert_eq!(out, "caught, x\ndone\n");
}

#[test]
fn generator_iteration() {
    let out = run("generator range(n) { for i in 0..n yield i } for v in range(3) print(v)");
    assert_eq!(out, "0\n1\n2\n");
}

#[test]
fn closures_share_one_cell() {
    let out = run(
        "function pair() { let n = 0; return [() -> { n = n + 10; return n; }, () -> n] } \
         let fs = pair(); fs[0](); fs[0](); print(fs[1]())",
    );
    assert_eq!(out, "20\n");
}

#[test]
fn arithmetic_and_precedence() {
    assert_eq!(run("print(2 + 3 * 4)"), "14\n");
    assert_eq!(run("print((2 + 3) * 4)"), "20\n");
    assert_eq!(run("print(7 / 2, 7 % 2, -7 / 2)"), "3, 1, -3\n");
    assert_eq!(run("print(1.5 + 2)"), "3.5\n");
}

#[test]
fn string_interpolation_with_format() {
    assert_eq!(run("let x = 6; print(\"x = {x * 7}\")"), "x = 42\n");
    assert_eq!(run("print(\"pi is %.2f{3.14159}\")"), "pi is 3.14\n");
}

#[test]
fn compound_assignment_and_incdec() {
    assert_eq!(run("let x = 10; x += 5; x -= 3; x *= 2; print(x)"), "24\n");
    assert_eq!(run("let x = 1; ++x; print(x++); print(x)"), "2\n3\n");
}

#[test]
fn arrays_and_dicts() {
    assert_eq!(run("let xs = [1, 2]; xs.push(3); print(xs, #xs)"), "[1, 2, 3], 3\n");
    assert_eq!(run("let d = %{'a': 1}; d['b'] = 2; print(d['a'] + d['b'])"), "3\n");
    assert_eq!(run("let d = %{*: 0}; print(d['missing'])"), "0\n");
}

#[test]
fn array_comprehension() {
    assert_eq!(run("print([x * x for x in 0..4 if x % 2 == 0])"), "[0, 4]\n");
}

#[test]
fn conditional_elements() {
    assert_eq!(run("let keep = false; print([1, 2 if keep, 3])"), "[1, 3]\n");
}

#[test]
fn spread_in_calls_and_arrays() {
    assert_eq!(run("let xs = [2, 3]; print([1, *xs, 4])"), "[1, 2, 3, 4]\n");
    assert_eq!(
        run("function add3(a, b, c) { return a + b + c; } let xs = [1, 2, 3]; print(add3(*xs))"),
        "6\n"
    );
}

#[test]
fn rest_and_kwargs_parameters() {
    assert_eq!(
        run("function f(a, *rest) { return rest; } print(f(1, 2, 3))"),
        "[2, 3]\n"
    );
    assert_eq!(
        run("function f(a, %kw) { return kw['b']; } print(f(1, b: 9))"),
        "9\n"
    );
    assert_eq!(run("function f(a, b = 7) { return a + b; } print(f(1), f(1, 2))"), "8, 3\n");
}

#[test]
fn ranges_and_membership() {
    assert_eq!(run("print(2 in 0..5, 5 in 0..5, 5 in 0...5)"), "true, false, true\n");
    assert_eq!(run("print(3 in [1, 2, 3], 'el' in 'hello', 9 not in [1])"), "true, true, true\n");
}

#[test]
fn while_and_break_depth() {
    assert_eq!(run("let i = 0; while i < 5 { i = i + 1; if i == 3 break; } print(i)"), "3\n");
    let nested = "let hits = 0; \
        for i in 0..3 { for j in 0..3 { hits = hits + 1; if i == 1 break 2; } } \
        print(hits)";
    assert_eq!(run(nested), "4\n");
}

#[test]
fn if_let_binding() {
    assert_eq!(
        run("tag Some; let v = Some(41); if let Some(x) = v { print(x + 1) } else { print('none') }"),
        "42\n"
    );
}

#[test]
fn while_match_loop() {
    let src = "tag Go; let n = 3; \
        function step() { if n == 0 return nil; n = n - 1; return Go(n); } \
        while step() :: Go(k) { print(k) }";
    assert_eq!(run(src), "2\n1\n0\n");
}

#[test]
fn nil_coalescing_and_elvis() {
    assert_eq!(run("print(nil ?? 5, 3 ?? 5)"), "5, 3\n");
    assert_eq!(run("print(false ?: 'fallback', 'kept' ?: 'fallback')"), "fallback, kept\n");
}

#[test]
fn ternary_conditional() {
    assert_eq!(run("let x = 9; print(x > 5 ? 'big' : 'small')"), "big\n");
}

#[test]
fn user_defined_operator() {
    let src = "operator <+> 8 left\n\
        function <+>(a, b) { return a * 10 + b; }\n\
        print(1 <+> 2 <+> 3)";
    assert_eq!(run(src), "123\n");
}

#[test]
fn check_match_operator() {
    assert_eq!(run("tag Ok; print(Ok(1) :: Ok(_), 5 :: Ok(_))"), "true, false\n");
}

#[test]
fn statements_as_expressions() {
    assert_eq!(run("let x = if true { 1 } else { 2 }; print(x)"), "1\n");
    assert_eq!(run("let x = do { let a = 2; a * 3 }; print(x)"), "6\n");
}

#[test]
fn match_expression_value() {
    assert_eq!(
        run("let word = match 2 { 1 => 'one', 2 => 'two', _ => 'many' }; print(word)"),
        "two\n"
    );
}

#[test]
fn eval_builtin_keyword() {
    assert_eq!(run("print(eval('6 * 7'))"), "42\n");
}

#[test]
fn non_ascii_strings_round_trip() {
    assert_eq!(run("print('héllo wörld')"), "héllo wörld\n");
    assert_eq!(run("let who = 'ツ'; print(\"greetings, {who}!\")"), "greetings, ツ!\n");
}

#[test]
fn doc_describes_callables() {
    assert_eq!(
        run("function f(a, *rest) { } print(doc(f))"),
        "function f(a, *rest)\n"
    );
    assert_eq!(run("print(doc(print), doc(1))"), "builtin print, nil\n");
}

#[test]
fn typeof_and_defined() {
    assert_eq!(run("print(typeof(1), typeof('s'), typeof([1]))"), "Int, String, Array\n");
    assert_eq!(run("let x = 1; print(defined(x), defined(zzz))"), "true, false\n");
}

#[test]
fn exit_code_semantics_of_uncaught_throw() {
    let (runner, _out) = Runner::new_collecting("throw 'boom'", "test.ty").expect("compiles");
    assert!(runner.run().is_err());
}

#[test]
fn template_macro_expansion() {
    let out = run("macro answer = $[ 6 * 7 ]; print(answer)");
    assert_eq!(out, "42\n");
}

#[test]
fn preprocessor_if() {
    assert_eq!(run("$if true { print('yes') } else { print('no') } print('after')"), "yes\nafter\n");
    assert_eq!(run("$if 1 == 2 { print('yes') } else { print('no') }"), "no\n");
}
