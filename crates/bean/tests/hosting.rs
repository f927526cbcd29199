//! Host boundary: native functions, global constants, object conversion,
//! output capture and program reuse.

use std::{cell::RefCell, rc::Rc};

use bean::{Engine, ErrorKind, Object, RunError, StdoutWriter, Value};
use pretty_assertions::assert_eq;

/// Writer that shares its buffer with the test.
struct SharedWriter(Rc<RefCell<String>>);

impl StdoutWriter for SharedWriter {
    fn write(&mut self, output: &str) {
        self.0.borrow_mut().push_str(output);
    }
}

#[test]
fn print_output_goes_through_the_configured_writer() {
    let buffer = Rc::new(RefCell::new(String::new()));
    let mut engine = Engine::new();
    engine.set_stdout_writer(Box::new(SharedWriter(buffer.clone())));
    engine
        .execute("println(\"hello\", 42)\nprint(\"no newline\")")
        .expect("prints");
    assert_eq!(&*buffer.borrow(), "hello 42\nno newline");
}

#[test]
fn native_functions_can_mutate_script_values() {
    let mut engine = Engine::new();
    engine.set_native_function("push_twice", |ctx, args| {
        let Some(items) = ctx.heap.as_array_mut(args[0]) else {
            return Err(RunError::new("push_twice expects an array"));
        };
        items.push(args[1]);
        items.push(args[1]);
        Ok(Value::Null)
    });
    let result = engine
        .execute("var a = [1]\npush_twice(a, 9)\nconst n = len(a)")
        .expect("native mutation");
    assert_eq!(result, Object::Number(3.0));
}

#[test]
fn native_function_errors_become_runtime_errors() {
    let mut engine = Engine::new();
    engine.set_native_function("fail", |_ctx, _args| Err(RunError::new("host said no")));
    assert!(engine.execute("fail()").is_none());
    let err = engine.error(0).expect("error");
    assert_eq!(err.kind, ErrorKind::Runtime);
    assert_eq!(err.message, "host said no");
    let traceback = err.traceback.expect("traceback");
    assert_eq!(traceback.items[0].function_name, "fail");
}

#[test]
fn native_functions_can_allocate_results() {
    let mut engine = Engine::new();
    engine.set_native_function("greet", |ctx, args| {
        let name = ctx.heap.as_str(args[0]).unwrap_or("world").to_owned();
        Ok(ctx.heap.alloc_string(format!("hi {name}")))
    });
    let result = engine
        .execute("const s = greet(\"bean\")")
        .expect("native alloc");
    assert_eq!(result, Object::String("hi bean".to_owned()));
}

#[test]
fn global_constants_accept_containers() {
    let mut engine = Engine::new();
    let config = Object::Map(vec![
        ("retries".into(), Object::Number(3.0)),
        ("name".into(), "svc".into()),
    ]);
    assert!(engine.set_global_constant("config", &config));
    let result = engine
        .execute("const r = to_str(config.retries) + config.name")
        .expect("use config");
    assert_eq!(result, Object::String("3svc".to_owned()));
}

#[test]
fn get_object_deep_converts_containers() {
    let mut engine = Engine::new();
    engine
        .execute("const data = { list: [1, true, \"x\"], nested: { k: null } }")
        .expect("define");
    let object = engine.get_object("data");
    assert_eq!(
        object,
        Object::Map(vec![
            (
                "list".into(),
                Object::Array(vec![
                    Object::Number(1.0),
                    Object::Bool(true),
                    Object::String("x".to_owned())
                ])
            ),
            ("nested".into(), Object::Map(vec![("k".into(), Object::Null)])),
        ])
    );
}

#[test]
fn get_object_reports_unknown_symbols() {
    let mut engine = Engine::new();
    assert_eq!(engine.get_object("ghost"), Object::Null);
    assert!(engine.has_errors());
    let err = engine.error(0).expect("error");
    assert_eq!(err.kind, ErrorKind::User);
    assert_eq!(err.message, "Symbol \"ghost\" is not defined");
}

#[test]
fn get_object_sees_functions_and_natives() {
    let mut engine = Engine::new();
    engine.execute("fn helper() { return 1 }").expect("define");
    assert_eq!(
        engine.get_object("helper"),
        Object::Function {
            name: "helper".to_owned()
        }
    );
    assert_eq!(
        engine.get_object("len"),
        Object::NativeFunction {
            name: "len".to_owned()
        }
    );
}

#[test]
fn call_passes_converted_arguments() {
    let mut engine = Engine::new();
    engine
        .execute("fn total(items) { var s = 0\nfor (x in items) { s = s + x }\nreturn s }")
        .expect("define");
    let result = engine
        .call(
            "total",
            &[Object::Array(vec![
                Object::Number(1.0),
                Object::Number(2.0),
                Object::Number(3.0),
            ])],
        )
        .expect("call");
    assert_eq!(result, Object::Number(6.0));
}

#[test]
fn call_with_wrong_argument_count_fails() {
    let mut engine = Engine::new();
    engine.execute("fn two(a, b) { return a }").expect("define");
    assert!(engine.call("two", &[Object::Number(1.0)]).is_none());
    let err = engine.error(0).expect("error");
    assert_eq!(
        err.message,
        "Invalid number of arguments to \"two\", expected 2, got 1"
    );
}

#[test]
fn call_can_invoke_natives_directly() {
    let mut engine = Engine::new();
    let result = engine
        .call("len", &[Object::String("four".to_owned())])
        .expect("native call");
    assert_eq!(result, Object::Number(4.0));
}

#[test]
fn programs_are_tied_to_their_engine() {
    let mut first = Engine::new();
    let mut second = Engine::new();
    let program = first.compile("const x = 1").expect("compile");
    assert!(second.execute_program(&program).is_none());
    let err = second.error(0).expect("error");
    assert_eq!(err.kind, ErrorKind::User);
    assert!(
        err.message.contains("different engine instance"),
        "{}",
        err.message
    );
}

#[test]
fn execute_file_uses_the_read_callback() {
    let mut engine = Engine::new();
    engine.set_file_read(|path| {
        (path == "script.bn").then(|| "const answer = 42".to_owned())
    });
    let result = engine.execute_file("script.bn").expect("file execution");
    assert_eq!(result, Object::Number(42.0));
    assert!(engine.execute_file("missing.bn").is_none());
    assert_eq!(
        engine.error(0).expect("error").message,
        "Reading file \"missing.bn\" failed"
    );
}

#[test]
fn write_file_round_trips_through_the_callback() {
    let written = Rc::new(RefCell::new(Vec::<(String, String)>::new()));
    let sink = written.clone();
    let mut engine = Engine::new();
    engine.set_file_write(move |path, contents| {
        sink.borrow_mut().push((path.to_owned(), contents.to_owned()));
        true
    });
    assert!(engine.write_file("out.txt", "payload"));
    assert_eq!(
        written.borrow().as_slice(),
        &[("out.txt".to_owned(), "payload".to_owned())]
    );
}

#[test]
fn disabled_gc_still_completes() {
    let mut engine = Engine::new();
    engine.set_gc_interval(-1);
    let result = engine
        .execute("var s = \"\"\nfor (var i = 0; i < 10; i += 1) { s = s + \"ab\" }\nconst n = len(s)")
        .expect("no-gc execution");
    assert_eq!(result, Object::Number(20.0));
}
