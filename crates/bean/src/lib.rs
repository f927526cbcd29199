//! Bean: an embeddable scripting language with C-style syntax, compiled to
//! compact bytecode and executed on a stack VM with a mark-and-sweep
//! garbage collector.
//!
//! The pipeline runs source text through the lexer and Pratt parser into an
//! AST, lowers it to bytecode in a single pass (resolving lexical scopes,
//! closure captures and module imports along the way), and executes it on
//! [`Vm`](crate::vm) frames over a tagged-value heap.
//!
//! Hosts embed through [`Engine`]:
//!
//! ```
//! use bean::{Engine, Object};
//!
//! let mut engine = Engine::new();
//! let result = engine.execute("const double = fn(n) { return n * 2 }\nconst r = double(21)");
//! assert_eq!(result, Some(Object::Number(42.0)));
//! ```

mod ast;
mod builtins;
mod bytecode;
mod compiler;
mod engine;
mod error;
mod heap;
mod io;
mod lexer;
mod object;
mod parser;
mod position;
mod symbols;
mod token;
mod value;
mod vm;

pub use crate::{
    bytecode::CompilationUnit,
    engine::{Engine, Program},
    error::{EngineError, ErrorKind, RunError, RunResult, Traceback, TracebackItem},
    heap::{
        ErrorValue, ExternalData, Heap, HeapData, HeapId, MapKey, NativeCtx, NativeFnImpl,
        NativeFunction, ScriptFunction, ValueMap,
    },
    io::{CollectString, StdStdout, StdoutWriter},
    object::Object,
    position::{CompiledFile, Position},
    value::{Value, ValueKind},
};
