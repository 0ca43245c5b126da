//! Source-anchored error formatting, shared by the lexer, compiler and VM.

use std::fmt;

use crate::compiler::ParserError;
use crate::lexer::ScanError;
use crate::vm::RuntimeError;

/// A single source line number, `0`-indexed internally but rendered `1`-indexed.
#[derive(Eq, PartialEq, Debug, Clone, Copy)]
pub struct Location {
    pub line: usize,
}

impl Location {
    pub fn new(line: usize) -> Location {
        Location { line }
    }
}

pub trait AsErrorWithContext {
    fn location(&self) -> Location;
    fn message(&self) -> String;
}

/// A source file (or REPL line) paired with its text, kept around so that
/// errors discovered much later (a runtime error several calls deep) can
/// still point back at the line that caused them.
pub struct SourceView {
    name: String,
    text: String,
}

impl SourceView {
    pub fn new(name: impl Into<String>, text: impl Into<String>) -> SourceView {
        SourceView {
            name: name.into(),
            text: text.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    fn line(&self, index: usize) -> &str {
        self.text.lines().nth(index).unwrap_or("")
    }

    pub fn format<E: AsErrorWithContext>(&self, error: &E) -> String {
        format_error(self, error.location(), &error.message())
    }

    /// Runtime errors carry a full call stack, rendered top-down as
    /// `[line N] in <fn name or "script">`, after the error message itself.
    pub fn format_runtime_error(&self, error: &RuntimeError) -> String {
        let mut text = format_error(self, error.location, &error.error.to_string());
        for frame in &error.stack_trace {
            text.push_str(&format!("[line {}] in {}\n", frame.line + 1, frame.name));
        }
        text
    }
}

fn format_error(view: &SourceView, loc: Location, message: &str) -> String {
    format!(
        "{}\n  at: line {} ({})\n  at:\n\n{}\n",
        message,
        loc.line + 1,
        view.name(),
        view.line(loc.line)
    )
}

impl AsErrorWithContext for ScanError {
    fn location(&self) -> Location {
        self.loc
    }

    fn message(&self) -> String {
        self.error.to_string()
    }
}

impl AsErrorWithContext for ParserError {
    fn location(&self) -> Location {
        self.loc
    }

    fn message(&self) -> String {
        self.error.to_string()
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line {}", self.line + 1)
    }
}
