//! Module import behavior: resolution, caching, qualified symbols and the
//! import error surface.

use std::collections::HashMap;

use bean::{Engine, ErrorKind, Object};
use pretty_assertions::assert_eq;

/// An engine whose file reads come from an in-memory map of module sources.
fn engine_with_files(files: &[(&str, &str)]) -> Engine {
    let files: HashMap<String, String> = files
        .iter()
        .map(|(path, code)| ((*path).to_owned(), (*code).to_owned()))
        .collect();
    let mut engine = Engine::new();
    engine.set_file_read(move |path| files.get(path).cloned());
    engine
}

#[test]
fn imported_symbols_are_qualified_by_module_name() {
    let mut engine = engine_with_files(&[(
        "math.bn",
        "const pi = 3\nfn double(n) { return n * 2 }",
    )]);
    let result = engine
        .execute("import \"math\"\nconst r = math::double(math::pi)")
        .expect("import and use");
    assert_eq!(result, Object::Number(6.0));
}

#[test]
fn module_code_runs_once_at_first_import() {
    let mut engine = engine_with_files(&[
        ("counter.bn", "var hits = 0\nhits = hits + 1"),
        ("a.bn", "import \"counter\"\nconst from_a = counter::hits"),
        ("b.bn", "import \"counter\"\nconst from_b = counter::hits"),
    ]);
    let result = engine
        .execute("import \"a\"\nimport \"b\"\nconst total = a::from_a + b::from_b")
        .expect("transitive imports");
    // both importers observe the single execution of counter.bn
    assert_eq!(result, Object::Number(2.0));
}

#[test]
fn relative_imports_resolve_against_the_importing_file() {
    let mut engine = engine_with_files(&[
        ("lib/deep/helper.bn", "const value = 7"),
        ("lib/api.bn", "import \"deep/helper\"\nconst exported = helper::value"),
    ]);
    let result = engine
        .execute("import \"lib/api\"\nconst r = api::exported")
        .expect("nested relative import");
    assert_eq!(result, Object::Number(7.0));
}

#[test]
fn parent_segments_are_canonicalised() {
    let mut engine = engine_with_files(&[
        ("shared.bn", "const tag = \"shared\""),
        ("pkg/mod.bn", "import \"../shared\"\nconst tag = shared::tag"),
    ]);
    let result = engine
        .execute("import \"pkg/mod\"\nconst r = mod::tag")
        .expect("parent-relative import");
    assert_eq!(result, Object::String("shared".to_owned()));
}

#[test]
fn duplicate_import_in_one_file_is_rejected() {
    let mut engine = engine_with_files(&[("m.bn", "const x = 1")]);
    assert!(engine.execute("import \"m\"\nimport \"m\"").is_none());
    let err = engine.error(0).expect("error");
    assert_eq!(err.kind, ErrorKind::Compilation);
    assert_eq!(err.message, "Module \"m\" was already imported");
}

#[test]
fn cyclic_imports_are_rejected() {
    let mut engine = engine_with_files(&[
        ("a.bn", "import \"b\"\nconst xa = 1"),
        ("b.bn", "import \"a\"\nconst xb = 2"),
    ]);
    assert!(engine.execute("import \"a\"").is_none());
    let messages: Vec<String> = engine.errors().into_iter().map(|e| e.message).collect();
    assert!(
        messages.iter().any(|m| m.contains("Cyclic reference of file")),
        "{messages:?}"
    );
}

#[test]
fn import_is_only_allowed_at_file_top_level() {
    let mut engine = engine_with_files(&[("m.bn", "const x = 1")]);
    assert!(
        engine
            .execute("fn f() { import \"m\" return 1 }")
            .is_none()
    );
    let err = engine.error(0).expect("error");
    assert_eq!(err.message, "Modules can only be imported in global scope");
}

#[test]
fn missing_module_file_is_reported() {
    let mut engine = engine_with_files(&[]);
    assert!(engine.execute("import \"nowhere\"").is_none());
    let err = engine.error(0).expect("error");
    assert_eq!(err.kind, ErrorKind::Compilation);
    assert_eq!(err.message, "Reading module file \"nowhere.bn\" failed");
}

#[test]
fn module_name_is_the_last_path_component() {
    let mut engine = engine_with_files(&[("a/b/c.bn", "const inside = 5")]);
    let result = engine
        .execute("import \"a/b/c\"\nconst r = c::inside")
        .expect("import");
    assert_eq!(result, Object::Number(5.0));
}

#[test]
fn module_globals_do_not_collide_with_importer_globals() {
    let mut engine = engine_with_files(&[("m.bn", "const first = 10\nconst second = 20")]);
    let result = engine
        .execute(
            "const mine = 1
             import \"m\"
             const after = 2
             const r = mine + m::first + m::second + after",
        )
        .expect("import between defines");
    assert_eq!(result, Object::Number(33.0));
    assert_eq!(engine.get_object("mine"), Object::Number(1.0));
    assert_eq!(engine.get_object("after"), Object::Number(2.0));
}

#[test]
fn failed_module_compile_surfaces_its_error() {
    let mut engine = engine_with_files(&[("bad.bn", "const x = unresolved_thing")]);
    assert!(engine.execute("import \"bad\"").is_none());
    let messages: Vec<String> = engine.errors().into_iter().map(|e| e.message).collect();
    assert!(
        messages
            .iter()
            .any(|m| m.contains("Symbol \"unresolved_thing\" could not be resolved")),
        "{messages:?}"
    );
}

#[test]
fn module_functions_keep_their_module_globals() {
    // a module function referring to its own globals works when called from
    // the importer, because module globals live in shared slots
    let mut engine = engine_with_files(&[(
        "cfg.bn",
        "const base = 100\nfn with_base(n) { return base + n }",
    )]);
    let result = engine
        .execute("import \"cfg\"\nconst r = cfg::with_base(23)")
        .expect("module function call");
    assert_eq!(result, Object::Number(123.0));
}
