//! `loxi`: the Lox bytecode VM's command-line entry point.

use std::process;

use clap::Parser;

use loxi::CliOptions;

fn main() {
    let options = CliOptions::parse();
    loxi::init_logging(options.trace);
    let code = loxi::run(options);
    process::exit(code as i32);
}
