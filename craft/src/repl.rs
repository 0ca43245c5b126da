//! Read-compile-execute loop shared by the CLI binary and tests.
//!
//! Kept independent of any particular line-editing library: the host
//! supplies a [`Reader`], so a terminal frontend (rustyline, in
//! `craft-cli`) and a scripted test harness can drive the same loop.

use std::io::Write;

use crate::reporting::SourceView;
use crate::vm::{InterpretResult, Vm};

/// A source of REPL input lines. Returns `None` to end the session (EOF or
/// interrupt), `Some(Err(..))` for a reader-level I/O failure, and
/// `Some(Ok(line))` for ordinary input.
pub trait Reader {
    fn read(&mut self, prompt: &'static str) -> Option<Result<String, String>>;
}

/// Runs the loop against one persistent [`Vm`], so declarations from one
/// line stay visible to the next — the way entering `var x = 1;` then `x;`
/// on separate lines works in any Lox-family REPL.
pub fn run<R: Reader, W: Write>(mut reader: R, out: W, verbose: bool) -> Result<(), String> {
    let mut vm = Vm::new(out);
    let mut line_number: usize = 0;

    loop {
        let prompt = if line_number == 0 { "> " } else { "| " };
        let line = match reader.read(prompt) {
            None => break,
            Some(Err(e)) => return Err(e),
            Some(Ok(line)) => line,
        };

        if line.trim() == "exit" {
            break;
        }
        line_number += 1;

        let view = SourceView::new(format!("<repl:{}>", line_number), line.clone());
        match vm.interpret(&line) {
            InterpretResult::Ok => {
                if verbose {
                    writeln!(vm.output_mut(), "-- ok --").ok();
                }
            }
            InterpretResult::CompileError(errors) => {
                for error in &errors {
                    eprint!("{}", view.format(error));
                }
            }
            InterpretResult::RuntimeError(error) => {
                eprint!("{}", view.format_runtime_error(&error));
            }
        }
        std::io::stdout().flush().ok();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct ScriptedReader {
        lines: std::vec::IntoIter<&'static str>,
    }

    impl Reader for ScriptedReader {
        fn read(&mut self, _prompt: &'static str) -> Option<Result<String, String>> {
            self.lines.next().map(|l| Ok(l.to_string()))
        }
    }

    #[test]
    fn test_repl_persists_globals_across_lines() {
        let reader = ScriptedReader { lines: vec!["var x = 1;", "x = x + 1;", "print x;"].into_iter() };
        let out: Vec<u8> = Vec::new();
        run(reader, out, false).unwrap();
    }

    #[test]
    fn test_repl_stops_on_exit() {
        let reader = ScriptedReader { lines: vec!["print 1;", "exit", "print 2;"].into_iter() };
        let out: Vec<u8> = Vec::new();
        run(reader, out, false).unwrap();
    }
}
