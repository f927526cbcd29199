//! Command-line runner for Bean scripts: `bean <file.bn>` executes a file,
//! `bean` with no arguments starts a line-based REPL.

use std::{
    env,
    io::{self, BufRead, Write},
    process::ExitCode,
};

use bean::{Engine, Object};

fn main() -> ExitCode {
    let args: Vec<String> = env::args().collect();
    match args.get(1) {
        Some(path) => run_file(path),
        None => repl(),
    }
}

fn run_file(path: &str) -> ExitCode {
    let mut engine = Engine::new();
    match engine.execute_file(path) {
        Some(_) => ExitCode::SUCCESS,
        None => {
            for err in engine.take_errors() {
                eprint!("{}", err.serialize());
            }
            ExitCode::FAILURE
        }
    }
}

fn repl() -> ExitCode {
    let mut engine = Engine::new();
    engine.set_repl_mode(true);

    let stdin = io::stdin();
    let mut stdout = io::stdout();
    loop {
        print!("> ");
        let _ = stdout.flush();

        let mut line = String::new();
        match stdin.lock().read_line(&mut line) {
            Ok(0) | Err(_) => return ExitCode::SUCCESS,
            Ok(_) => {}
        }
        if line.trim().is_empty() {
            continue;
        }

        match engine.execute(&line) {
            Some(Object::Null) => {}
            Some(result) => println!("{result}"),
            None => {
                for err in engine.take_errors() {
                    eprint!("{}", err.serialize());
                }
            }
        }
    }
}
