//! Library entry point: wires the compiler and VM together behind a single
//! `run` call, and leaves choosing what to do with the outcome (which exit
//! code, what to print) to the caller. `src/main.rs` is the only caller in
//! this crate, but keeping the split means the whole pipeline is testable
//! without spawning a process.

pub mod chunk;
pub mod compiler;
pub mod error;
pub mod gc;
pub mod natives;
pub mod object;
pub mod scanner;
pub mod table;
pub mod token;
pub mod value;
pub mod vm;

use std::io::Write;

use error::{Report, Reporter};
use gc::Heap;
use vm::Vm;

/// Which of the three outcomes a `run` call produced, for the CLI to map
/// onto an exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunResult {
    Ok,
    CompileError,
    RuntimeError,
}

/// Compiles and executes `source` against a persistent `heap`/`vm` pair.
/// Persistent so a REPL can keep defining globals across lines; a one-shot
/// file run just builds a fresh `Heap`/`Vm` and calls this once. Every
/// diagnostic goes through `reporter` rather than being printed directly,
/// and all `print` output goes through `stdout` rather than directly to the
/// process's real standard output, so the whole pipeline stays testable.
pub fn run(
    source: &str,
    heap: &mut Heap,
    vm: &mut Vm,
    reporter: &mut dyn Reporter,
    stdout: &mut dyn Write,
) -> RunResult {
    let function = match compiler::compile(source, heap, &*vm) {
        Ok(function) => function,
        Err(errors) => {
            for error in errors {
                reporter.report(Report::Compile(error));
            }
            return RunResult::CompileError;
        }
    };

    match vm.interpret(function, heap, stdout) {
        Ok(()) => RunResult::Ok,
        Err(error) => {
            reporter.report(Report::Runtime(error));
            RunResult::RuntimeError
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use error::CollectingReporter;

    fn run_source(source: &str) -> (RunResult, CollectingReporter, String) {
        let mut heap = Heap::new();
        let mut vm = Vm::new(&mut heap);
        let mut reporter = CollectingReporter::default();
        let mut stdout = Vec::new();
        let result = run(source, &mut heap, &mut vm, &mut reporter, &mut stdout);
        (result, reporter, String::from_utf8(stdout).unwrap())
    }

    #[test]
    fn successful_run_produces_no_reports() {
        let (result, reporter, out) = run_source("print 1 + 1;");
        assert_eq!(result, RunResult::Ok);
        assert!(reporter.reports.is_empty());
        assert_eq!(out, "2\n");
    }

    #[test]
    fn compile_error_is_reported_with_its_line() {
        let (result, reporter, _) = run_source("var;");
        assert_eq!(result, RunResult::CompileError);
        let errors: Vec<_> = reporter.compile_errors().collect();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].line, 1);
    }

    #[test]
    fn runtime_error_is_reported_and_nothing_prints() {
        let (result, reporter, out) = run_source("1 + \"a\";");
        assert_eq!(result, RunResult::RuntimeError);
        let errors: Vec<_> = reporter.runtime_errors().collect();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].message, "Operands must be two numbers or two strings.");
        assert_eq!(out, "");
    }

    #[test]
    fn globals_persist_across_successive_run_calls() {
        let mut heap = Heap::new();
        let mut vm = Vm::new(&mut heap);
        let mut reporter = CollectingReporter::default();
        let mut stdout = Vec::new();
        run("var x = 10;", &mut heap, &mut vm, &mut reporter, &mut stdout);
        run("print x + 1;", &mut heap, &mut vm, &mut reporter, &mut stdout);
        assert!(reporter.reports.is_empty());
        assert_eq!(String::from_utf8(stdout).unwrap(), "11\n");
    }
}
