//! The `loxi` binary's library half: argument parsing, logging setup,
//! REPL/file dispatch, and exit-code mapping. Split out of `main.rs` so it
//! can be exercised directly by integration tests.

use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};

use clap::Parser;

use lox_vm::{InterpretResult, Vm};

pub const EXIT_OK: u8 = 0;
pub const EXIT_USAGE: u8 = 64;
pub const EXIT_COMPILE_ERROR: u8 = 65;
pub const EXIT_RUNTIME_ERROR: u8 = 70;
pub const EXIT_IO_ERROR: u8 = 74;

/// clox's REPL reads into a fixed 1024-byte buffer; lines longer than that
/// are truncated rather than rejected.
const REPL_LINE_MAX: usize = 1024;

#[derive(Parser, Debug)]
#[command(name = "loxi")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Bytecode compiler and VM for the Lox scripting language", long_about = None)]
pub struct CliOptions {
    /// Lox source file to execute; omit to start a REPL. More than one is a usage error.
    pub paths: Vec<PathBuf>,

    /// Force VM instruction tracing, regardless of RUST_LOG.
    #[arg(long)]
    pub trace: bool,
}

/// Initializes the process-wide `tracing` subscriber. `RUST_LOG` always
/// wins when set; otherwise `--trace` raises the VM to `trace`, and
/// everything else defaults to `warn`.
pub fn init_logging(trace: bool) {
    let default_directives = if trace {
        "lox_vm=trace,lox_compiler=warn"
    } else {
        "lox_vm=warn,lox_compiler=warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directives)),
        )
        .with_writer(io::stderr)
        .init();
}

/// Dispatches on parsed options and returns the process exit code.
pub fn run(options: CliOptions) -> u8 {
    match options.paths.as_slice() {
        [] => run_repl(),
        [path] => run_file(path),
        _ => {
            eprintln!("Usage: loxi [path]");
            EXIT_USAGE
        }
    }
}

fn run_file(path: &Path) -> u8 {
    let source = match std::fs::read_to_string(path) {
        Ok(source) => source,
        Err(err) => {
            eprintln!("Error reading {}: {}", path.display(), err);
            return EXIT_IO_ERROR;
        }
    };
    let mut vm = Vm::new();
    exit_code_for(interpret_source(&mut vm, &source))
}

fn run_repl() -> u8 {
    let mut vm = Vm::new();
    let stdin = io::stdin();

    loop {
        print!("> ");
        if io::stdout().flush().is_err() {
            return EXIT_IO_ERROR;
        }

        let mut line = String::new();
        let bytes_read = match stdin.lock().read_line(&mut line) {
            Ok(n) => n,
            Err(err) => {
                eprintln!("Error reading from stdin: {err}");
                return EXIT_IO_ERROR;
            }
        };
        if bytes_read == 0 {
            println!();
            return EXIT_OK;
        }
        truncate_to_char_boundary(&mut line, REPL_LINE_MAX);

        // Each line runs against the same VM: globals and interned strings
        // persist, but a line's own compile/runtime errors don't end the session.
        interpret_source(&mut vm, &line);
    }
}

fn truncate_to_char_boundary(s: &mut String, max: usize) {
    if s.len() <= max {
        return;
    }
    let mut cut = max;
    while !s.is_char_boundary(cut) {
        cut -= 1;
    }
    s.truncate(cut);
}

fn interpret_source(vm: &mut Vm, source: &str) -> InterpretResult {
    let chunk = match lox_compiler::compile(source, vm.heap_mut()) {
        Ok(chunk) => chunk,
        Err(()) => return InterpretResult::CompileError,
    };
    vm.interpret(&chunk)
}

fn exit_code_for(result: InterpretResult) -> u8 {
    match result {
        InterpretResult::Ok => EXIT_OK,
        InterpretResult::CompileError => EXIT_COMPILE_ERROR,
        InterpretResult::RuntimeError => EXIT_RUNTIME_ERROR,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    fn write_source(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().expect("failed to create temp file");
        file.write_all(contents.as_bytes())
            .expect("failed to write temp source");
        file
    }

    #[test]
    fn running_a_well_formed_file_exits_ok() {
        let file = write_source("print 1 + 2;\n");
        assert_eq!(run_file(file.path()), EXIT_OK);
    }

    #[test]
    fn compile_error_exits_65() {
        let file = write_source("1 + 2 = 3;\n");
        assert_eq!(run_file(file.path()), EXIT_COMPILE_ERROR);
    }

    #[test]
    fn runtime_error_exits_70() {
        let file = write_source("print -\"abc\";\n");
        assert_eq!(run_file(file.path()), EXIT_RUNTIME_ERROR);
    }

    #[test]
    fn missing_file_exits_74() {
        assert_eq!(run_file(Path::new("/no/such/file.lox")), EXIT_IO_ERROR);
    }

    #[test]
    fn more_than_one_path_is_a_usage_error() {
        let options = CliOptions {
            paths: vec![PathBuf::from("a.lox"), PathBuf::from("b.lox")],
            trace: false,
        };
        assert_eq!(run(options), EXIT_USAGE);
    }

    #[test]
    fn truncate_respects_utf8_boundaries() {
        let mut s = "a".repeat(1023) + "é€"; // multi-byte tail straddling the cutoff
        truncate_to_char_boundary(&mut s, 1024);
        assert!(s.len() <= 1024);
        assert!(s.is_char_boundary(s.len()));
    }
}
