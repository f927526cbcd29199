//! Source positions and compiled-file records.
//!
//! Every token, AST node and bytecode byte carries a [`Position`] so that
//! parse, compile and runtime diagnostics can point at the offending source
//! line. Files are registered as [`CompiledFile`]s which keep the source
//! split into lines for error rendering.

use std::rc::Rc;

/// A source file known to the engine.
///
/// Holds the path, the directory prefix used to resolve relative imports,
/// and the source split into lines (without trailing newlines) so
/// diagnostics can quote the offending line.
#[derive(Debug, PartialEq, Eq)]
pub struct CompiledFile {
    pub path: String,
    /// Directory prefix of `path` including the trailing slash, or empty
    /// when the path has no directory component.
    pub dir_path: String,
    pub lines: Vec<String>,
}

impl CompiledFile {
    pub fn new(path: &str, source: &str) -> Rc<Self> {
        let dir_path = match path.rfind('/') {
            Some(ix) => path[..=ix].to_owned(),
            None => String::new(),
        };
        let lines = source.split('\n').map(str::to_owned).collect();
        Rc::new(Self {
            path: path.to_owned(),
            dir_path,
            lines,
        })
    }

    /// Returns the 0-based source line, if it exists.
    pub fn line(&self, line: i32) -> Option<&str> {
        if line < 0 {
            return None;
        }
        self.lines.get(line as usize).map(String::as_str)
    }
}

/// A location in a source file. Lines and columns are 0-based internally
/// and surfaced 1-based by the error accessors.
#[derive(Debug, Clone, Default)]
pub struct Position {
    pub file: Option<Rc<CompiledFile>>,
    pub line: i32,
    pub column: i32,
}

impl Position {
    pub fn new(file: Rc<CompiledFile>, line: i32, column: i32) -> Self {
        Self {
            file: Some(file),
            line,
            column,
        }
    }

    /// The invalid position used for errors with no source location.
    pub fn invalid() -> Self {
        Self {
            file: None,
            line: -1,
            column: -1,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.line >= 0 && self.column >= 0
    }

    /// Path of the owning file, if any.
    pub fn filepath(&self) -> Option<&str> {
        self.file.as_deref().map(|f| f.path.as_str())
    }

    /// The source line this position points into, if available.
    pub fn source_line(&self) -> Option<&str> {
        self.file.as_deref().and_then(|f| f.line(self.line))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_splits_lines_and_dir_path() {
        let file = CompiledFile::new("scripts/util/main.bn", "var a = 1\nvar b = 2\n");
        assert_eq!(file.dir_path, "scripts/util/");
        assert_eq!(file.line(0), Some("var a = 1"));
        assert_eq!(file.line(1), Some("var b = 2"));
        // trailing newline yields a final empty line
        assert_eq!(file.line(2), Some(""));
        assert_eq!(file.line(3), None);
    }

    #[test]
    fn bare_filename_has_empty_dir() {
        let file = CompiledFile::new("main.bn", "");
        assert_eq!(file.dir_path, "");
    }

    #[test]
    fn invalid_position() {
        let pos = Position::invalid();
        assert!(!pos.is_valid());
        assert_eq!(pos.filepath(), None);
        assert_eq!(pos.source_line(), None);
    }
}
