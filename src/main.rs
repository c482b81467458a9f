//! CLI driver: `lox` opens a REPL, `lox path` runs a script, anything else
//! is a usage error. Exit codes follow BSD `sysexits.h` via the `exitcode`
//! crate, matching how the rest of this codebase's ancestry reports process
//! outcomes to a shell.

use std::fs;
use std::io::{self, Write};
use std::process::ExitCode;

use lox::error::CliReporter;
use lox::gc::Heap;
use lox::vm::Vm;
use lox::{run, RunResult};

use rustyline::error::ReadlineError;
use rustyline::Editor;

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.as_slice() {
        [] => run_repl(),
        [path] => run_file(path),
        _ => {
            eprintln!("Usage: lox [path]");
            ExitCode::from(exitcode::USAGE as u8)
        }
    }
}

fn run_repl() -> ExitCode {
    let mut heap = Heap::new();
    let mut vm = Vm::new(&mut heap);
    let mut reporter = CliReporter;
    let mut editor = Editor::<()>::new().expect("failed to start line editor");

    loop {
        match editor.readline("> ") {
            Ok(line) => {
                editor.add_history_entry(line.as_str());
                run(&line, &mut heap, &mut vm, &mut reporter, &mut io::stdout());
            }
            Err(ReadlineError::Eof) | Err(ReadlineError::Interrupted) => break,
            Err(err) => {
                eprintln!("Readline error: {err}");
                break;
            }
        }
    }

    ExitCode::from(exitcode::OK as u8)
}

fn run_file(path: &str) -> ExitCode {
    let source = match fs::read_to_string(path) {
        Ok(source) => source,
        Err(err) => {
            eprintln!("Could not read file \"{path}\": {err}");
            return ExitCode::from(exitcode::IOERR as u8);
        }
    };

    let mut heap = Heap::new();
    let mut vm = Vm::new(&mut heap);
    let mut reporter = CliReporter;
    let mut stdout = io::stdout();

    match run(&source, &mut heap, &mut vm, &mut reporter, &mut stdout) {
        RunResult::Ok => ExitCode::from(exitcode::OK as u8),
        RunResult::CompileError => ExitCode::from(exitcode::DATAERR as u8),
        RunResult::RuntimeError => ExitCode::from(exitcode::SOFTWARE as u8),
    }
}
