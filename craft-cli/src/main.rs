use std::io::{self, Write};
use std::fs;

use mimalloc::MiMalloc;
use rustyline::error::ReadlineError;
use rustyline::{DefaultEditor, Editor};

use craft::heap::Heap;
use craft::reporting::SourceView;
use craft::vm::{InterpretResult, Vm};
use craft::{compiler, debug, repl};
use craft::repl::Reader;

#[global_allocator]
static ALLOC: MiMalloc = MiMalloc;

/// Exit codes mandated for the non-interactive entry point: 0 on success,
/// 65 when the source never compiled, 70 when a compiled program raised
/// a runtime error. The REPL never uses these — it reports and keeps going.
const EXIT_OK: i32 = 0;
const EXIT_COMPILE_ERROR: i32 = 65;
const EXIT_RUNTIME_ERROR: i32 = 70;

fn main() {
    let args: Vec<String> = std::env::args().collect();
    let options = match parse_args(args) {
        Some(options) => options,
        None => return,
    };

    let code = match &options.file {
        Some(name) => run_main(name.clone(), &options),
        None => match run_repl() {
            Ok(()) => EXIT_OK,
            Err(e) => {
                eprintln!("{}", e);
                1
            }
        },
    };

    std::process::exit(code);
}

fn run_main(name: String, options: &Options) -> i32 {
    let text = match fs::read_to_string(&name) {
        Ok(text) => text,
        Err(_) => {
            eprintln!("Unable to read file '{}'", name);
            return 1;
        }
    };
    let view = SourceView::new(name, text);

    match options.mode {
        Mode::Disassembly => match compiler::compile(view.text(), &mut Heap::new()) {
            Ok(function) => {
                for line in debug::disassemble(function, !options.no_line_numbers) {
                    println!("{}", line);
                }
                EXIT_OK
            }
            Err(errors) => {
                for error in &errors {
                    eprint!("{}", view.format(error));
                }
                EXIT_COMPILE_ERROR
            }
        },
        Mode::Default => run_vm(&view),
    }
}

fn run_vm(view: &SourceView) -> i32 {
    let stdout = io::stdout();
    let mut vm = Vm::new(stdout);
    match vm.interpret(view.text()) {
        InterpretResult::Ok => EXIT_OK,
        InterpretResult::CompileError(errors) => {
            for error in &errors {
                eprint!("{}", view.format(error));
            }
            EXIT_COMPILE_ERROR
        }
        InterpretResult::RuntimeError(error) => {
            eprint!("{}", view.format_runtime_error(&error));
            EXIT_RUNTIME_ERROR
        }
    }
}

fn run_repl() -> Result<(), String> {
    println!("Welcome to craft! (exit with 'exit' or Ctrl-C)");
    repl::run(EditorRepl { editor: Editor::new().map_err(|e| e.to_string())? }, io::stdout(), false)
}

struct EditorRepl {
    editor: DefaultEditor,
}

impl Reader for EditorRepl {
    fn read(&mut self, prompt: &'static str) -> Option<Result<String, String>> {
        io::stdout().flush().ok();
        match self.editor.readline(prompt) {
            Ok(line) => {
                self.editor.add_history_entry(line.as_str()).ok();
                Some(Ok(line))
            }
            Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => None,
            Err(e) => Some(Err(format!("Error: {}", e))),
        }
    }
}

fn parse_args(args: Vec<String>) -> Option<Options> {
    let mut iter = args.into_iter();
    let mut options = Options {
        file: None,
        program_args: Vec::new(),
        mode: Mode::Default,
        no_line_numbers: false,
    };

    iter.next();

    for arg in iter.by_ref() {
        match arg.as_str() {
            "-h" | "--help" => {
                print_help();
                return None;
            }
            "-d" | "--disassembly" => {
                if options.mode.set(Mode::Disassembly).is_err() {
                    eprintln!("Must only specify one of --disassembly");
                    return None;
                }
            }
            "--no-line-numbers" => options.no_line_numbers = true,
            a => {
                options.file = Some(String::from(a));
                break;
            }
        }
    }

    options.program_args.extend(iter);
    Some(options)
}

fn print_help() {
    println!("craft [options] <file> [program arguments...]");
    println!("When invoked with no arguments, this opens a REPL (exit with 'exit' or Ctrl-C)");
    println!("Options:");
    println!("  -h --help         : Show this message and then exit.");
    println!("  -d --disassembly  : Dump the disassembly view instead of running the program.");
    println!("  --no-line-numbers : In disassembly view, omit the leading '0001' style offsets.");
}

struct Options {
    file: Option<String>,
    #[allow(dead_code)]
    program_args: Vec<String>,
    mode: Mode,
    no_line_numbers: bool,
}

#[derive(Eq, PartialEq)]
enum Mode {
    Default,
    Disassembly,
}

impl Mode {
    fn set(&mut self, new: Mode) -> Result<(), ()> {
        if *self != Mode::Default {
            Err(())
        } else {
            *self = new;
            Ok(())
        }
    }
}
