//! Error records, tracebacks and the shared engine error list.

use std::{cell::RefCell, fmt::Write as _, rc::Rc};

use strum::{Display, IntoStaticStr};

use crate::position::Position;

/// Result type alias for operations that can raise a runtime error.
pub type RunResult<T> = Result<T, RunError>;

/// A runtime error in flight inside the VM or a native callback.
///
/// Carries the message, a possibly invalid position, and a partial traceback
/// (native calls prepend their own name); the VM fills in the position of
/// the raising instruction and the frame snapshot when the error either
/// reaches a recover block or escapes to the engine error list.
#[derive(Debug, Clone)]
pub struct RunError {
    pub message: String,
    pub position: Position,
    pub traceback: Option<Traceback>,
}

impl RunError {
    /// An error with no source location; the VM fills in the position of the
    /// instruction that raised it.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            position: Position::invalid(),
            traceback: None,
        }
    }

    pub fn at(position: Position, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            position,
            traceback: None,
        }
    }
}

/// The category of an engine error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, IntoStaticStr)]
#[strum(serialize_all = "UPPERCASE")]
pub enum ErrorKind {
    Parsing,
    Compilation,
    Runtime,
    /// Errors produced by host API misuse (bad `call` target, reentrant
    /// execution, unknown symbol in `get_object`).
    User,
}

/// One frame of a captured call stack, innermost first.
#[derive(Debug, Clone)]
pub struct TracebackItem {
    pub function_name: String,
    pub position: Position,
}

/// A snapshot of the call stack taken when a runtime error unwinds.
#[derive(Debug, Clone, Default)]
pub struct Traceback {
    pub items: Vec<TracebackItem>,
}

impl Traceback {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, function_name: impl Into<String>, position: Position) {
        self.items.push(TracebackItem {
            function_name: function_name.into(),
            position,
        });
    }

    pub fn depth(&self) -> usize {
        self.items.len()
    }

    /// Renders the traceback, one `name in file on line:col` row per frame.
    pub fn render(&self, out: &mut String) {
        for item in &self.items {
            if item.position.is_valid() {
                let filepath = item.position.filepath().unwrap_or("?");
                let _ = writeln!(
                    out,
                    "{} in {} on {}:{}",
                    item.function_name, filepath, item.position.line, item.position.column
                );
            } else {
                let _ = writeln!(out, "{}", item.function_name);
            }
        }
    }
}

/// A finalized error held in the engine error list.
#[derive(Debug, Clone)]
pub struct EngineError {
    pub kind: ErrorKind,
    pub message: String,
    pub position: Position,
    pub traceback: Option<Traceback>,
}

impl EngineError {
    pub fn new(kind: ErrorKind, position: Position, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            position,
            traceback: None,
        }
    }

    /// 1-based line number, or 0 when the position is invalid.
    pub fn line_number(&self) -> i32 {
        self.position.line + 1
    }

    /// 1-based column number, or 0 when the position is invalid.
    pub fn column_number(&self) -> i32 {
        self.position.column + 1
    }

    pub fn filepath(&self) -> Option<&str> {
        self.position.filepath()
    }

    /// The offending source line, when the position is known.
    pub fn source_line(&self) -> Option<&str> {
        self.position.source_line()
    }

    /// Renders the error as a multi-line report: the source line with a caret
    /// under the column, a `KIND ERROR in "file" on line:col: message` header,
    /// and the traceback if one was captured.
    pub fn serialize(&self) -> String {
        let mut out = String::new();
        if let Some(line) = self.source_line() {
            out.push_str(line);
            out.push('\n');
            let col = self.column_number();
            if col >= 0 {
                for _ in 0..(col - 1).max(0) {
                    out.push(' ');
                }
                out.push_str("^\n");
            }
        }
        let _ = writeln!(
            out,
            "{} ERROR in \"{}\" on {}:{}: {}",
            self.kind,
            self.filepath().unwrap_or("?"),
            self.line_number(),
            self.column_number(),
            self.message
        );
        if let Some(traceback) = &self.traceback {
            out.push_str("Traceback:\n");
            traceback.render(&mut out);
        }
        out
    }
}

/// Shared, clonable handle to the engine error list.
///
/// The parser, compiler and engine all append into the same list; the engine
/// clears it at the start of every execution entry point.
#[derive(Debug, Clone, Default)]
pub struct Errors {
    inner: Rc<RefCell<Vec<EngineError>>>,
}

impl Errors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, error: EngineError) {
        self.inner.borrow_mut().push(error);
    }

    pub fn add_parsing(&self, position: Position, message: impl Into<String>) {
        self.add(EngineError::new(ErrorKind::Parsing, position, message));
    }

    pub fn add_compilation(&self, position: Position, message: impl Into<String>) {
        self.add(EngineError::new(ErrorKind::Compilation, position, message));
    }

    pub fn len(&self) -> usize {
        self.inner.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.borrow().is_empty()
    }

    pub fn clear(&self) {
        self.inner.borrow_mut().clear();
    }

    pub fn get(&self, index: usize) -> Option<EngineError> {
        self.inner.borrow().get(index).cloned()
    }

    pub fn to_vec(&self) -> Vec<EngineError> {
        self.inner.borrow().clone()
    }
}
