//! The embedding API: compile and execute source, call script functions,
//! register native functions and inspect errors.

use std::{
    rc::Rc,
    sync::atomic::{AtomicU64, Ordering},
};

use crate::{
    builtins,
    bytecode::CompilationUnit,
    compiler::{CompileEnv, Compiler},
    error::{EngineError, ErrorKind, Errors, RunResult},
    heap::{Heap, NativeCtx},
    io::{FileReadFn, FileWriteFn, StdStdout, StdoutWriter, fs_read, fs_write},
    object::Object,
    position::Position,
    symbols::SymbolKind,
    value::Value,
    vm::Vm,
};

/// A compiled program, reusable across executions of the engine that
/// compiled it (its constants live in that engine).
#[derive(Debug, Clone)]
pub struct Program {
    unit: Rc<CompilationUnit>,
    engine_id: u64,
}

static NEXT_ENGINE_ID: AtomicU64 = AtomicU64::new(0);

/// One scripting engine instance: heap, VM, compiler state and
/// configuration. Globals, compiled constants and the global symbol table
/// persist across executions, which is what makes REPL sessions work.
pub struct Engine {
    id: u64,
    heap: Heap,
    vm: Vm,
    compiler: Compiler,
    errors: Errors,
    repl_mode: bool,
    stdout: Box<dyn StdoutWriter>,
    file_read: Option<Box<FileReadFn>>,
    file_write: Option<Box<FileWriteFn>>,
}

impl Engine {
    pub fn new() -> Self {
        let errors = Errors::new();
        let mut heap = Heap::new();
        let mut vm = Vm::new();
        let native_names = builtins::register_all(&mut vm, &mut heap);
        let compiler = Compiler::new(native_names, errors.clone());
        Self {
            id: NEXT_ENGINE_ID.fetch_add(1, Ordering::Relaxed),
            heap,
            vm,
            compiler,
            errors,
            repl_mode: false,
            stdout: Box::new(StdStdout),
            file_read: Some(Box::new(|path: &str| fs_read(path))),
            file_write: Some(Box::new(|path: &str, contents: &str| {
                fs_write(path, contents)
            })),
        }
    }

    // ----- configuration -----

    /// In REPL mode, bare expressions are valid top-level statements and a
    /// leading `{` parses as a map literal.
    pub fn set_repl_mode(&mut self, enabled: bool) {
        self.repl_mode = enabled;
    }

    /// Instructions between garbage collections; negative disables GC.
    pub fn set_gc_interval(&mut self, interval: i64) {
        self.vm.set_gc_interval(interval);
    }

    pub fn set_stdout_writer(&mut self, writer: Box<dyn StdoutWriter>) {
        self.stdout = writer;
    }

    /// Replaces the file reader used by `compile_file`, `execute_file` and
    /// `import`.
    pub fn set_file_read(&mut self, read: impl FnMut(&str) -> Option<String> + 'static) {
        self.file_read = Some(Box::new(read));
    }

    pub fn set_file_write(&mut self, write: impl FnMut(&str, &str) -> bool + 'static) {
        self.file_write = Some(Box::new(write));
    }

    /// Writes through the configured file-write callback.
    pub fn write_file(&mut self, path: &str, contents: &str) -> bool {
        match &mut self.file_write {
            Some(write) => write(path, contents),
            None => false,
        }
    }

    // ----- compilation and execution -----

    /// Compiles source to a program without running it. Returns `None` and
    /// records errors on failure.
    pub fn compile(&mut self, code: &str) -> Option<Program> {
        self.reset_state();
        let mut env = CompileEnv {
            heap: &mut self.heap,
            repl_mode: self.repl_mode,
            file_read: &mut self.file_read,
        };
        self.compiler.compile(&mut env, code).map(|unit| Program {
            unit,
            engine_id: self.id,
        })
    }

    pub fn compile_file(&mut self, path: &str) -> Option<Program> {
        self.reset_state();
        let mut env = CompileEnv {
            heap: &mut self.heap,
            repl_mode: self.repl_mode,
            file_read: &mut self.file_read,
        };
        self.compiler.compile_file(&mut env, path).map(|unit| Program {
            unit,
            engine_id: self.id,
        })
    }

    /// Compiles and runs source, returning the value of the last popped
    /// expression. `None` means errors were recorded.
    pub fn execute(&mut self, code: &str) -> Option<Object> {
        let program = self.compile(code)?;
        self.run_program(&program)
    }

    pub fn execute_file(&mut self, path: &str) -> Option<Object> {
        let program = self.compile_file(path)?;
        self.run_program(&program)
    }

    /// Runs an already compiled program. The program must have been
    /// compiled by this engine (its constants live here).
    pub fn execute_program(&mut self, program: &Program) -> Option<Object> {
        self.reset_state();
        if program.engine_id != self.id {
            self.errors.add(EngineError::new(
                ErrorKind::User,
                Position::invalid(),
                "Program was compiled with a different engine instance",
            ));
            return None;
        }
        self.run_program(program)
    }

    fn run_program(&mut self, program: &Program) -> Option<Object> {
        let run = self.vm.run_program(
            &mut self.heap,
            self.compiler.constants(),
            &mut *self.stdout,
            &program.unit,
        );
        if let Err(err) = run {
            self.errors.add(err);
            return None;
        }
        debug_assert_eq!(self.vm.stack_len(), 0);
        let result = self.vm.last_popped();
        Some(Object::from_value(result, &self.heap))
    }

    /// Resolves a globally visible callable by name and invokes it.
    pub fn call(&mut self, function_name: &str, args: &[Object]) -> Option<Object> {
        self.reset_state();
        let callee = self.lookup_value(function_name)?;
        let arg_values: Vec<Value> = args.iter().map(|arg| arg.to_value(&mut self.heap)).collect();
        let result = self.vm.call_function(
            &mut self.heap,
            self.compiler.constants(),
            &mut *self.stdout,
            callee,
            &arg_values,
        );
        match result {
            Ok(value) => Some(Object::from_value(value, &self.heap)),
            Err(err) => {
                self.errors.add(err);
                None
            }
        }
    }

    // ----- host bindings -----

    /// Registers a native function callable from scripts.
    pub fn set_native_function(
        &mut self,
        name: &str,
        func: impl Fn(&mut NativeCtx<'_>, &[Value]) -> RunResult<Value> + 'static,
    ) {
        let index = self.vm.register_native(&mut self.heap, name, Rc::new(func));
        self.compiler.define_native(name, index);
    }

    /// Binds a non-assignable global visible to subsequently compiled code.
    pub fn set_global_constant(&mut self, name: &str, object: &Object) -> bool {
        let table = self.compiler.table_mut();
        let symbol = if table.is_defined_in_top_scope(name) {
            match table.resolve(name) {
                Some(symbol) if symbol.kind == SymbolKind::Global => symbol,
                _ => {
                    self.errors.add(EngineError::new(
                        ErrorKind::User,
                        Position::invalid(),
                        format!("Symbol \"{name}\" already defined outside global scope"),
                    ));
                    return false;
                }
            }
        } else {
            match table.define(name, false) {
                Some(symbol) => symbol,
                None => {
                    self.errors.add(EngineError::new(
                        ErrorKind::User,
                        Position::invalid(),
                        format!("Cannot define symbol \"{name}\""),
                    ));
                    return false;
                }
            }
        };
        let value = object.to_value(&mut self.heap);
        if let Err(err) = self.vm.set_global(symbol.index as usize, value) {
            self.errors.add(EngineError::new(
                ErrorKind::User,
                Position::invalid(),
                err.message,
            ));
            return false;
        }
        true
    }

    /// Fetches a globally visible value by name as a host object.
    pub fn get_object(&mut self, name: &str) -> Object {
        match self.lookup_value(name) {
            Some(value) => Object::from_value(value, &self.heap),
            None => Object::Null,
        }
    }

    fn lookup_value(&mut self, name: &str) -> Option<Value> {
        let Some(symbol) = self.compiler.table_mut().resolve(name) else {
            self.errors.add(EngineError::new(
                ErrorKind::User,
                Position::invalid(),
                format!("Symbol \"{name}\" is not defined"),
            ));
            return None;
        };
        match symbol.kind {
            SymbolKind::Global => Some(self.vm.get_global(symbol.index as usize)),
            SymbolKind::NativeFunction => self.vm.native_function(symbol.index as usize),
            _ => {
                self.errors.add(EngineError::new(
                    ErrorKind::User,
                    Position::invalid(),
                    format!("Value associated with symbol \"{name}\" could not be loaded"),
                ));
                None
            }
        }
    }

    // ----- error inspection -----

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn errors_count(&self) -> usize {
        self.errors.len()
    }

    pub fn error(&self, index: usize) -> Option<EngineError> {
        self.errors.get(index)
    }

    pub fn errors(&self) -> Vec<EngineError> {
        self.errors.to_vec()
    }

    pub fn take_errors(&mut self) -> Vec<EngineError> {
        let errors = self.errors.to_vec();
        self.errors.clear();
        errors
    }

    /// Clears accumulated errors and the VM stacks. Called on every
    /// execution entry point.
    fn reset_state(&mut self) {
        self.errors.clear();
        self.vm.reset();
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn execute_returns_last_value() {
        let mut engine = Engine::new();
        let result = engine.execute("const x = 2 + 3 * 4").expect("execute");
        assert_eq!(result, Object::Number(14.0));
        assert_eq!(engine.get_object("x"), Object::Number(14.0));
    }

    #[test]
    fn execute_records_compile_errors() {
        let mut engine = Engine::new();
        assert!(engine.execute("const x = missing").is_none());
        assert!(engine.has_errors());
        assert_eq!(engine.errors_count(), 1);
        let err = engine.error(0).expect("error");
        assert_eq!(err.kind, ErrorKind::Compilation);
        // the next execution clears the error list
        assert!(engine.execute("const y = 1").is_some());
        assert!(!engine.has_errors());
    }

    #[test]
    fn compiled_program_can_be_rerun() {
        let mut engine = Engine::new();
        engine.execute("var count = 0").expect("define");
        let program = engine.compile("count = count + 1").expect("compile");
        engine.execute_program(&program).expect("run 1");
        engine.execute_program(&program).expect("run 2");
        assert_eq!(engine.get_object("count"), Object::Number(2.0));
    }

    #[test]
    fn call_script_function_by_name() {
        let mut engine = Engine::new();
        engine
            .execute("fn add(a, b) { return a + b }")
            .expect("define");
        let result = engine
            .call("add", &[Object::Number(2.0), Object::Number(40.0)])
            .expect("call");
        assert_eq!(result, Object::Number(42.0));
    }

    #[test]
    fn call_unknown_symbol_is_a_user_error() {
        let mut engine = Engine::new();
        assert!(engine.call("nope", &[]).is_none());
        assert_eq!(engine.error(0).expect("error").kind, ErrorKind::User);
    }

    #[test]
    fn native_function_round_trip() {
        let mut engine = Engine::new();
        engine.set_native_function("twice", |_ctx, args| {
            Ok(Value::Number(args[0].coerced_number() * 2.0))
        });
        let result = engine.execute("const r = twice(21)").expect("execute");
        assert_eq!(result, Object::Number(42.0));
    }

    #[test]
    fn global_constants_are_visible_and_frozen() {
        let mut engine = Engine::new();
        assert!(engine.set_global_constant("answer", &Object::Number(42.0)));
        let result = engine.execute("const x = answer + 0").expect("execute");
        assert_eq!(result, Object::Number(42.0));
        assert!(engine.execute("answer = 1").is_none());
        assert!(engine.has_errors());
    }
}
