//! Host I/O boundaries: script output and file access callbacks.

use std::io::{self, Write as _};

/// Destination for everything scripts print.
///
/// The engine never writes to process stdout directly; `print`/`println`
/// route through this trait so hosts can capture or redirect output.
pub trait StdoutWriter {
    fn write(&mut self, output: &str);
}

/// Default writer that forwards to process stdout.
#[derive(Debug, Default)]
pub struct StdStdout;

impl StdoutWriter for StdStdout {
    fn write(&mut self, output: &str) {
        let _ = io::stdout().write_all(output.as_bytes());
    }
}

/// Writer that collects output into a string, for tests and embedders.
#[derive(Debug, Default)]
pub struct CollectString {
    buffer: String,
}

impl CollectString {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn as_str(&self) -> &str {
        &self.buffer
    }

    pub fn take(&mut self) -> String {
        std::mem::take(&mut self.buffer)
    }
}

impl StdoutWriter for CollectString {
    fn write(&mut self, output: &str) {
        self.buffer.push_str(output);
    }
}

/// Callback used to load module sources during `import` and by
/// `compile_file`/`execute_file`. Returns `None` when the file cannot be
/// read.
pub type FileReadFn = dyn FnMut(&str) -> Option<String>;

/// Callback used by hosts that expose file writing to scripts. Returns
/// `true` on success.
pub type FileWriteFn = dyn FnMut(&str, &str) -> bool;

/// Default file reader backed by the filesystem.
pub fn fs_read(path: &str) -> Option<String> {
    std::fs::read_to_string(path).ok()
}

/// Default file writer backed by the filesystem.
pub fn fs_write(path: &str, contents: &str) -> bool {
    std::fs::write(path, contents).is_ok()
}
