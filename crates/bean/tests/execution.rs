//! End-to-end execution tests: source in, value out.

use bean::{Engine, Object};
use pretty_assertions::assert_eq;

fn eval(code: &str) -> Object {
    let mut engine = Engine::new();
    match engine.execute(code) {
        Some(result) => result,
        None => panic!(
            "execution failed:\n{}",
            engine
                .errors()
                .iter()
                .map(bean::EngineError::serialize)
                .collect::<String>()
        ),
    }
}

/// Evaluates in REPL mode so a trailing bare expression yields the result.
fn eval_repl(code: &str) -> Object {
    let mut engine = Engine::new();
    engine.set_repl_mode(true);
    match engine.execute(code) {
        Some(result) => result,
        None => panic!(
            "execution failed:\n{}",
            engine
                .errors()
                .iter()
                .map(bean::EngineError::serialize)
                .collect::<String>()
        ),
    }
}

fn num(n: f64) -> Object {
    Object::Number(n)
}

#[test]
fn arithmetic_precedence() {
    let mut engine = Engine::new();
    let result = engine.execute("const x = 2 + 3 * 4").expect("execute");
    assert_eq!(result, num(14.0));
    assert_eq!(engine.get_object("x"), num(14.0));
}

#[test]
fn arithmetic_forms() {
    assert_eq!(eval_repl("7 % 4"), num(3.0));
    assert_eq!(eval_repl("10 / 4"), num(2.5));
    assert_eq!(eval_repl("-3 + 1"), num(-2.0));
    assert_eq!(eval_repl("2 + true"), num(3.0));
    assert_eq!(eval_repl("0x10 + 1"), num(17.0));
    assert_eq!(eval_repl("1e3 / 10"), num(100.0));
}

#[test]
fn bitwise_and_shift_operators() {
    assert_eq!(eval_repl("5 | 3"), num(7.0));
    assert_eq!(eval_repl("5 & 3"), num(1.0));
    assert_eq!(eval_repl("5 ^ 3"), num(6.0));
    assert_eq!(eval_repl("1 << 4"), num(16.0));
    assert_eq!(eval_repl("16 >> 2"), num(4.0));
}

#[test]
fn comparison_operators() {
    assert_eq!(eval_repl("1 < 2"), Object::Bool(true));
    assert_eq!(eval_repl("2 <= 2"), Object::Bool(true));
    assert_eq!(eval_repl("3 > 4"), Object::Bool(false));
    assert_eq!(eval_repl("4 >= 5"), Object::Bool(false));
    assert_eq!(eval_repl("1 == 1"), Object::Bool(true));
    assert_eq!(eval_repl("1 != 1"), Object::Bool(false));
    assert_eq!(eval_repl("\"abc\" < \"abd\""), Object::Bool(true));
    assert_eq!(eval_repl("\"a\" == \"a\""), Object::Bool(true));
    assert_eq!(eval_repl("null == null"), Object::Bool(true));
    // mismatched types are never equal
    assert_eq!(eval_repl("true == 1"), Object::Bool(false));
}

#[test]
fn logical_operators_short_circuit() {
    assert_eq!(eval_repl("true && false"), Object::Bool(false));
    assert_eq!(eval_repl("false || true"), Object::Bool(true));
    // the right side must not run when the left decides the result
    assert_eq!(
        eval("var hits = 0\nfn bump() { hits = hits + 1; return true }\nconst r = false && bump()\nassert(hits == 0)"),
        Object::Bool(true)
    );
    // `&&`/`||` yield the deciding value, not a forced bool
    assert_eq!(eval_repl("null || 5"), num(5.0));
    assert_eq!(eval_repl("0 && 5"), num(0.0));
}

#[test]
fn string_concatenation() {
    assert_eq!(
        eval_repl("\"foo\" + \"bar\""),
        Object::String("foobar".to_owned())
    );
    assert_eq!(
        eval_repl("'single' + \"double\""),
        Object::String("singledouble".to_owned())
    );
}

#[test]
fn string_indexing_and_length() {
    assert_eq!(eval_repl("\"hello\"[1]"), Object::String("e".to_owned()));
    assert_eq!(eval_repl("len(\"héllo\")"), num(5.0));
    assert_eq!(eval_repl("\"abc\"[9]"), Object::Null);
}

#[test]
fn if_elif_else_chain() {
    let code = "fn grade(n) {
        if (n >= 90) { return \"A\" }
        else if (n >= 80) { return \"B\" }
        else { return \"C\" }
    }
    ";
    assert_eq!(
        eval_repl(&format!("{code}grade(95)")),
        Object::String("A".to_owned())
    );
    assert_eq!(
        eval_repl(&format!("{code}grade(85)")),
        Object::String("B".to_owned())
    );
    assert_eq!(
        eval_repl(&format!("{code}grade(10)")),
        Object::String("C".to_owned())
    );
}

#[test]
fn while_loop_with_break_and_continue() {
    let result = eval_repl(
        "var total = 0
         var i = 0
         while (true) {
             i = i + 1
             if (i > 10) { break }
             if (i % 2 == 0) { continue }
             total = total + i
         }
         total",
    );
    // 1 + 3 + 5 + 7 + 9
    assert_eq!(result, num(25.0));
}

#[test]
fn classic_for_loop() {
    let result = eval_repl(
        "var total = 0
         for (var i = 0; i < 5; i += 1) { total = total + i }
         total",
    );
    assert_eq!(result, num(10.0));
}

#[test]
fn recursion() {
    let result = eval(
        "const f = fn(n) { if (n <= 1) { return 1 } return n * f(n - 1) }
         f(6)",
    );
    assert_eq!(result, num(720.0));
}

#[test]
fn named_function_statement_recurses() {
    let result = eval(
        "fn fib(n) { if (n < 2) { return n } return fib(n - 1) + fib(n - 2) }
         fib(10)",
    );
    assert_eq!(result, num(55.0));
}

#[test]
fn closures_are_independent() {
    let code = "const mk = fn() { var c = 0; return fn() { c = c + 1; return c } }
                const a = mk()
                a()
                a()
                a()";
    assert_eq!(eval(code), num(3.0));

    let code = "const mk = fn() { var c = 0; return fn() { c = c + 1; return c } }
                const a = mk()
                a()
                const b = mk()
                b()";
    assert_eq!(eval(code), num(1.0));
}

#[test]
fn closures_share_captured_variables() {
    // two closures over the same variable observe each other's writes
    let result = eval_repl(
        "const mk = fn() {
             var c = 0
             const inc = fn() { c = c + 1; return c }
             const get = fn() { return c }
             return [inc, get]
         }
         const pair = mk()
         pair[0]()
         pair[0]()
         pair[1]()",
    );
    assert_eq!(result, num(2.0));
}

#[test]
fn enclosing_frame_sees_closure_writes() {
    let result = eval(
        "const outer = fn() {
             var x = 1
             const set = fn() { x = 42 }
             set()
             return x
         }
         outer()",
    );
    assert_eq!(result, num(42.0));
}

#[test]
fn arrays_literal_index_and_mutation() {
    let result = eval_repl("var a = [10, 20, 30]\na[1] = a[0] + a[2]\na");
    assert_eq!(result, Object::Array(vec![num(10.0), num(40.0), num(30.0)]));
    // negative indexes wrap from the end
    assert_eq!(eval_repl("[1, 2, 3][-1]"), num(3.0));
    // out-of-range reads yield null
    assert_eq!(eval_repl("[1, 2, 3][7]"), Object::Null);
}

#[test]
fn maps_literal_get_set() {
    let result = eval_repl("const m = { a: 1, \"b\": 2, 3: 4, true: 5 }\nm.a + m[\"b\"] + m[3] + m[true]");
    assert_eq!(result, num(12.0));
    // missing keys yield null
    assert_eq!(eval_repl("{ a: 1 }.missing"), Object::Null);
}

#[test]
fn map_iteration_follows_insertion_order() {
    let result = eval_repl(
        "const m = { \"a\": 1, \"b\": 2 }
         var s = 0
         for (kv in m) { s = s + kv.value }
         s",
    );
    assert_eq!(result, num(3.0));

    let result = eval_repl(
        "const m = { zeta: 1, alpha: 2, mid: 3 }
         var order = \"\"
         for (kv in m) { order = order + kv.key }
         order",
    );
    assert_eq!(result, Object::String("zetaalphamid".to_owned()));
}

#[test]
fn foreach_over_arrays_runs_in_index_order() {
    let result = eval_repl(
        "var seen = []
         for (x in [10, 20, 30]) { append(seen, x) }
         seen",
    );
    assert_eq!(result, Object::Array(vec![num(10.0), num(20.0), num(30.0)]));
}

#[test]
fn foreach_over_expression_source_and_strings() {
    let result = eval_repl(
        "var total = 0
         for (n in range(1, 5)) { total = total + n }
         total",
    );
    assert_eq!(result, num(10.0));

    let result = eval_repl(
        "var out = \"\"
         for (ch in \"abc\") { out = ch + out }
         out",
    );
    assert_eq!(result, Object::String("cba".to_owned()));
}

#[test]
fn foreach_body_break_and_continue() {
    let result = eval_repl(
        "var total = 0
         for (n in [1, 2, 3, 4, 5]) {
             if (n == 2) { continue }
             if (n == 5) { break }
             total = total + n
         }
         total",
    );
    assert_eq!(result, num(8.0));
}

#[test]
fn this_refers_to_the_enclosing_map_literal() {
    let result = eval("const m = { val: 41, next: fn() { return this.val + 1 } }\nm.next()");
    assert_eq!(result, num(42.0));
}

#[test]
fn operator_overloading_add() {
    let result = eval_repl(
        "const vec = fn(x, y) {
             return {
                 x: x,
                 y: y,
                 __operator_add__: fn(a, b) { return vec(a.x + b.x, a.y + b.y) }
             }
         }
         const a = vec(1, 2)
         const b = vec(3, 4)
         const c = a + b
         c.x * 10 + c.y",
    );
    assert_eq!(result, num(46.0));
}

#[test]
fn operator_overloading_cmp_and_unary() {
    let result = eval_repl(
        "const box = fn(v) {
             return {
                 v: v,
                 __cmp__: fn(a, b) { return a.v - b.v },
                 __operator_minus__: fn(a) { return box(-a.v) }
             }
         }
         const small = box(1)
         const big = box(5)
         var score = 0
         if (small < big) { score = score + 1 }
         if ((-big).v == -5) { score = score + 1 }
         score",
    );
    assert_eq!(result, num(2.0));
}

#[test]
fn compound_assignment_operators() {
    let result = eval_repl(
        "var x = 8
         x += 2
         x -= 1
         x *= 4
         x /= 2
         x %= 7
         x <<= 2
         x >>= 1
         x",
    );
    // ((((8+2-1)*4/2)%7)<<2)>>1 = (18%7=4; 4<<2=16; >>1=8)
    assert_eq!(result, num(8.0));
}

#[test]
fn assignment_is_an_expression() {
    let result = eval_repl("var a = 0\nvar b = 0\na = b = 5\na + b");
    assert_eq!(result, num(10.0));
}

#[test]
fn null_and_bool_semantics() {
    assert_eq!(eval_repl("!null"), Object::Bool(true));
    assert_eq!(eval_repl("!false"), Object::Bool(true));
    assert_eq!(eval_repl("!!true"), Object::Bool(true));
    assert_eq!(eval_repl("null"), Object::Null);
}

#[test]
fn builtin_helpers() {
    assert_eq!(eval_repl("len([1, 2, 3])"), num(3.0));
    assert_eq!(eval_repl("to_str(42)"), Object::String("42".to_owned()));
    assert_eq!(eval_repl("to_num(\"2.5\")"), num(2.5));
    assert_eq!(eval_repl("sqrt(81)"), num(9.0));
    assert_eq!(eval_repl("pow(2, 10)"), num(1024.0));
    assert_eq!(eval_repl("abs(-3)"), num(3.0));
    assert_eq!(eval_repl("floor(2.7)"), num(2.0));
    assert_eq!(eval_repl("ceil(2.1)"), num(3.0));
    assert_eq!(
        eval_repl("concat([1], [2, 3])"),
        Object::Array(vec![num(1.0), num(2.0), num(3.0)])
    );
    assert_eq!(eval_repl("reverse(\"abc\")"), Object::String("cba".to_owned()));
    assert_eq!(
        eval_repl("keys({ a: 1, b: 2 })"),
        Object::Array(vec![
            Object::String("a".to_owned()),
            Object::String("b".to_owned())
        ])
    );
    assert_eq!(
        eval_repl("values({ a: 1, b: 2 })"),
        Object::Array(vec![num(1.0), num(2.0)])
    );
}

#[test]
fn copy_is_shallow_and_deep_copy_is_deep() {
    let result = eval_repl(
        "const original = { inner: [1] }
         const shallow = copy(original)
         const deep = deep_copy(original)
         append(original.inner, 2)
         [len(shallow.inner), len(deep.inner)]",
    );
    assert_eq!(result, Object::Array(vec![num(2.0), num(1.0)]));
}

#[test]
fn functions_are_first_class() {
    let result = eval_repl(
        "const apply = fn(f, v) { return f(v) }
         const double = fn(n) { return n * 2 }
         apply(double, 21)",
    );
    assert_eq!(result, num(42.0));
}

#[test]
fn nested_closure_chain_captures_transitively() {
    let result = eval(
        "const outer = fn() {
             var x = 1
             return fn() {
                 return fn() { x = x + 10; return x }
             }
         }
         const f = outer()()
         f()
         f()",
    );
    assert_eq!(result, num(21.0));
}

#[test]
fn block_scopes_shadow() {
    let result = eval_repl(
        "const f = fn() {
             var a = 1
             { var b = 2
               a = a + b }
             return a
         }
         f()",
    );
    assert_eq!(result, num(3.0));
}

#[test]
fn gc_stress_with_interval_zero() {
    let mut engine = Engine::new();
    engine.set_gc_interval(0);
    let result = engine
        .execute(
            "var acc = \"\"
             for (var i = 0; i < 100; i += 1) { acc = acc + \"x\" }
             const n = len(acc)",
        )
        .expect("gc-stressed execution");
    assert_eq!(result, num(100.0));
}

#[test]
fn gc_preserves_cyclic_structures_in_use() {
    let mut engine = Engine::new();
    engine.set_gc_interval(0);
    let result = engine
        .execute(
            "var graph = { name: \"root\" }
             graph[\"self\"] = graph
             var i = 0
             while (i < 50) { i = i + 1 }
             const ok = graph.self.self.name == \"root\"",
        )
        .expect("cyclic graph survived");
    assert_eq!(result, Object::Bool(true));
}

#[test]
fn repl_engine_keeps_state_between_executes() {
    let mut engine = Engine::new();
    engine.set_repl_mode(true);
    engine.execute("var count = 10").expect("define");
    engine.execute("count = count + 5").expect("update");
    assert_eq!(engine.execute("count").expect("read"), num(15.0));
}
