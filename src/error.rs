//! Error reporting: two concrete report shapes (compile-time, runtime) and a
//! `Reporter` trait so the CLI binary and the test suite can swap how those
//! reports are delivered without the compiler or VM knowing which.

use std::fmt;

use colored::Colorize;

/// A single compile-time diagnostic, already formatted with its source
/// position. `at` is the offending lexeme, or the literal string `"end"`
/// when the error was detected at EOF.
#[derive(Debug, Clone)]
pub struct CompileError {
    pub line: u32,
    pub at: String,
    pub message: String,
}

impl CompileError {
    pub fn new(line: u32, at: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            line,
            at: at.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[line {}] Error at {}: {}",
            self.line, self.at, self.message
        )
    }
}

/// One entry of a runtime stack trace: the name of the function that was
/// executing (`None` for the top-level script) and the line active when the
/// error propagated through that frame.
#[derive(Debug, Clone)]
pub struct BacktraceFrame {
    pub name: Option<String>,
    pub line: u32,
}

#[derive(Debug, Clone, Default)]
pub struct Backtrace {
    pub frames: Vec<BacktraceFrame>,
}

impl Backtrace {
    pub fn push(&mut self, name: Option<String>, line: u32) {
        self.frames.push(BacktraceFrame { name, line });
    }
}

impl fmt::Display for Backtrace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for frame in self.frames.iter().rev() {
            match &frame.name {
                Some(name) => writeln!(f, "[line {}] in {}()", frame.line, name)?,
                None => writeln!(f, "[line {}] in script", frame.line)?,
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct RuntimeError {
    pub message: String,
    pub backtrace: Backtrace,
}

impl RuntimeError {
    pub fn new(message: impl Into<String>, backtrace: Backtrace) -> Self {
        Self {
            message: message.into(),
            backtrace,
        }
    }
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.message)?;
        write!(f, "{}", self.backtrace)
    }
}

#[derive(Debug, Clone)]
pub enum Report {
    Compile(CompileError),
    Runtime(RuntimeError),
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Report::Compile(e) => write!(f, "{e}"),
            Report::Runtime(e) => write!(f, "{e}"),
        }
    }
}

/// Where compile/runtime diagnostics go. The CLI binary reports straight to
/// stderr; tests substitute a reporter that just collects them.
pub trait Reporter {
    fn report(&mut self, report: Report);
}

#[derive(Default)]
pub struct CliReporter;

impl Reporter for CliReporter {
    fn report(&mut self, report: Report) {
        match &report {
            Report::Compile(_) => eprintln!("{}", format!("{report}").red()),
            Report::Runtime(_) => eprintln!("{}", format!("{report}").red()),
        }
    }
}

#[derive(Default)]
pub struct CollectingReporter {
    pub reports: Vec<Report>,
}

impl Reporter for CollectingReporter {
    fn report(&mut self, report: Report) {
        self.reports.push(report);
    }
}

impl CollectingReporter {
    pub fn compile_errors(&self) -> impl Iterator<Item = &CompileError> {
        self.reports.iter().filter_map(|r| match r {
            Report::Compile(e) => Some(e),
            _ => None,
        })
    }

    pub fn runtime_errors(&self) -> impl Iterator<Item = &RuntimeError> {
        self.reports.iter().filter_map(|r| match r {
            Report::Runtime(e) => Some(e),
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compile_error_formats_line_and_lexeme() {
        let e = CompileError::new(3, "'('", "Expect expression.");
        assert_eq!(format!("{e}"), "[line 3] Error at '(': Expect expression.");
    }

    #[test]
    fn backtrace_prints_deepest_frame_first() {
        let mut bt = Backtrace::default();
        bt.push(None, 1);
        bt.push(Some("fact".to_string()), 2);
        let printed = format!("{bt}");
        let lines: Vec<&str> = printed.lines().collect();
        assert_eq!(lines[0], "[line 2] in fact()");
        assert_eq!(lines[1], "[line 1] in script");
    }

    #[test]
    fn collecting_reporter_separates_kinds() {
        let mut r = CollectingReporter::default();
        r.report(Report::Compile(CompileError::new(1, "end", "oops")));
        r.report(Report::Runtime(RuntimeError::new("boom", Backtrace::default())));
        assert_eq!(r.compile_errors().count(), 1);
        assert_eq!(r.runtime_errors().count(), 1);
    }
}
