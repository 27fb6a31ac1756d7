//! Runtime semantics: exceptions, deferred actions, classes, generators,
//! threads, and the cooperative GC surface.

use pretty_assertions::assert_eq;
use ty::Runner;

fn run(src: &str) -> String {
    let (runner, output) = Runner::new_collecting(src, "runtime.ty").expect("compiles");
    runner.run().expect("runs");
    output.contents()
}

// ----------------------------------------------------------------------
// Exceptions.
// ----------------------------------------------------------------------

#[test]
fn uncaught_patterns_rethrow() {
    let src = "tag A, B; \
        try { try { throw B('inner') } catch A(x) { print('wrong') } } \
        catch B(m) { print('outer', m) }";
    assert_eq!(run(src), "outer, inner\n");
}

#[test]
fn finally_runs_on_success_and_throw_paths() {
    assert_eq!(run("try { print('body') } finally { print('fin') }"), "body\nfin\n");
    let src = "try { try { throw 'x' } finally { print('fin') } } catch e { print('caught', e) }";
    assert_eq!(run(src), "fin\ncaught, x\n");
}

#[test]
fn finally_runs_on_return_path() {
    let src = "function f() { try { return 'value' } finally { print('fin') } } print(f())";
    assert_eq!(run(src), "fin\nvalue\n");
}

#[test]
fn catch_guard_selects_handler() {
    let src = "try { throw 7 } catch n if n > 10 { print('big') } catch n { print('small', n) }";
    assert_eq!(run(src), "small, 7\n");
}

#[test]
fn division_by_zero_is_catchable() {
    let src = "try { print(1 / 0) } catch DivisionByZero(m) { print('caught') }";
    assert_eq!(run(src), "caught\n");
}

#[test]
fn defer_runs_on_scope_exit_lifo() {
    let src = "function f() { defer print('one'); defer print('two'); print('body'); } f()";
    assert_eq!(run(src), "body\ntwo\none\n");
}

#[test]
fn defer_runs_on_unwind() {
    let src = "function f() { defer print('cleanup'); throw 'boom'; } \
        try { f() } catch e { print('caught', e) }";
    assert_eq!(run(src), "cleanup\ncaught, boom\n");
}

#[test]
fn cleanup_runs_only_on_unwind() {
    let ok = "function f() { cleanup print('never'); return 1; } print(f())";
    assert_eq!(run(ok), "1\n");
    let bad = "function f() { cleanup print('ran'); throw 'x'; } try { f() } catch e { print('done') }";
    assert_eq!(run(bad), "ran\ndone\n");
}

#[test]
fn break_crossing_try_runs_finally() {
    let src = "for i in 0..3 { try { if i == 1 break; print(i) } finally { print('fin', i) } } print('after')";
    assert_eq!(run(src), "0\nfin, 0\nfin, 1\nafter\n");
}

// ----------------------------------------------------------------------
// Classes and tags.
// ----------------------------------------------------------------------

#[test]
fn class_with_init_and_methods() {
    let src = "class Point { \
            init(x, y) { self.x = x; self.y = y; } \
            norm2() { return self.x * self.x + self.y * self.y; } \
        } \
        let p = Point(3, 4); print(p.norm2())";
    assert_eq!(run(src), "25\n");
}

#[test]
fn implicit_init_parameters() {
    let src = "class Pair(a, b) { sum() { return @a + @b; } } print(Pair(2, 40).sum())";
    assert_eq!(run(src), "42\n");
}

#[test]
fn field_defaults_apply() {
    let src = "class Counter { n = 10 } let c = Counter(); print(c.n)";
    assert_eq!(run(src), "10\n");
}

#[test]
fn inheritance_and_super() {
    let src = "class Animal { init(name) { self.name = name; } speak() { return 'generic noise'; } } \
        class Dog < Animal { speak() { return self.name + ' says woof (' + super.speak() + ')'; } } \
        let d = Dog('rex'); print(d.speak())";
    assert_eq!(run(src), "rex says woof (generic noise)\n");
}

#[test]
fn getters_and_setters() {
    let src = "class Celsius { \
            init(deg) { self.deg = deg; } \
            get fahrenheit() { return self.deg * 9 / 5 + 32; } \
            set fahrenheit(f) { self.deg = (f - 32) * 5 / 9; } \
        } \
        let t = Celsius(100); print(t.fahrenheit); t.fahrenheit = 32; print(t.deg)";
    assert_eq!(run(src), "212\n0\n");
}

#[test]
fn static_methods() {
    let src = "class Math2 { static square(x) { return x * x; } } print(Math2.square(9))";
    assert_eq!(run(src), "81\n");
}

#[test]
fn tag_methods_dispatch_on_top_tag() {
    let src = "tag Just { \
            unwrap() { match self { Just(x) => return x } } \
        } \
        print(Just(5).unwrap())";
    assert_eq!(run(src), "5\n");
}

// ----------------------------------------------------------------------
// Generators.
// ----------------------------------------------------------------------

#[test]
fn generators_capture_arguments() {
    let src = "generator countdown(n) { while n > 0 { yield n; n = n - 1; } } \
        for v in countdown(3) print(v)";
    assert_eq!(run(src), "3\n2\n1\n");
}

#[test]
fn two_generator_instances_are_independent() {
    let src = "generator nums() { yield 1; yield 2; } \
        let a = nums(); let b = nums(); \
        print(a.next(), b.next(), a.next())";
    assert_eq!(run(src), "1, 1, 2\n");
}

#[test]
fn generator_end_yields_nil_from_next() {
    let src = "generator one() { yield 'only'; } \
        let g = one(); print(g.next()); print(g.next())";
    assert_eq!(run(src), "only\nnil\n");
}

#[test]
fn generator_try_survives_suspension() {
    // The try region opened before the first yield must still catch after
    // the generator is resumed.
    let src = "generator g() { try { yield 1; throw 'boom'; } catch e { yield 'caught: ' + e; } } \
        for v in g() print(v)";
    assert_eq!(run(src), "1\ncaught: boom\n");
}

#[test]
fn generator_finally_survives_suspension() {
    let src = "generator g() { try { yield 'body' } finally { print('fin') } } \
        for v in g() print(v)";
    assert_eq!(run(src), "body\nfin\n");
}

#[test]
fn generators_close_over_outer_state() {
    let src = "let base = 100; generator offsets() { yield base + 1; yield base + 2; } \
        for v in offsets() print(v)";
    assert_eq!(run(src), "101\n102\n");
}

// ----------------------------------------------------------------------
// Resources and with.
// ----------------------------------------------------------------------

#[test]
fn with_runs_drop_on_exit() {
    let src = "class Res { \
            init(name) { self.name = name; } \
            drop() { print('dropped', self.name) } \
        } \
        with Res('r1') as r { print('using', r.name) } print('after')";
    assert_eq!(run(src), "using, r1\ndropped, r1\nafter\n");
}

// ----------------------------------------------------------------------
// Threads.
// ----------------------------------------------------------------------

#[test]
fn thread_spawn_and_join() {
    let src = "function work(n) { return n * 2; } \
        let t = thread(work, 21); print(join(t))";
    assert_eq!(run(src), "42\n");
}

#[test]
fn threads_share_globals_under_the_lock() {
    let src = "let total = 0; let m = mutex(); \
        function bump() { lock(m); total = total + 1; unlock(m); } \
        let ts = [thread(bump), thread(bump), thread(bump)]; \
        join(ts[0]); join(ts[1]); join(ts[2]); \
        print(total)";
    assert_eq!(run(src), "3\n");
}

// ----------------------------------------------------------------------
// GC surface.
// ----------------------------------------------------------------------

#[test]
fn gc_reclaims_unreachable_values() {
    let src = "let keep = [1, 2, 3]; \
        let i = 0; while i < 50 { let tmp = [i, i, i]; i = i + 1; } \
        gc(); print(keep)";
    assert_eq!(run(src), "[1, 2, 3]\n");
}

#[test]
fn gc_disable_counter_gates_collection() {
    let src = "gcOff(); let before = gc(); gcOn(); print(before > 0)";
    assert_eq!(run(src), "true\n");
}

#[test]
fn finalizer_runs_after_collection() {
    let src = "class Tmp { drop() {} } \
        function make() { let o = Tmp(); setFinalizer(o, () -> print('finalized')); } \
        make(); gc(); gc(); print('end')";
    let out = run(src);
    assert!(out.contains("end"), "got: {out}");
}
