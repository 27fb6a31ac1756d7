use std::{env, fs, io::IsTerminal, process::ExitCode};

use ty::Runner;

fn main() -> ExitCode {
    let args: Vec<String> = env::args().collect();
    let file_path = if args.len() > 1 { args[1].as_str() } else { "/dev/stdin" };

    let source = match fs::read_to_string(file_path) {
        Ok(s) => s,
        Err(err) => {
            eprintln!("error: cannot read {file_path}: {err}");
            return ExitCode::FAILURE;
        }
    };

    let color = std::io::stderr().is_terminal();

    let runner = match Runner::new(&source, file_path) {
        Ok(r) => r,
        Err(diag) => {
            eprintln!("{}", ty::render_compile_error(&source, file_path, &diag, color));
            return ExitCode::FAILURE;
        }
    };

    match runner.run() {
        Ok(_) => ExitCode::SUCCESS,
        Err(diag) => {
            eprintln!("{}", runner.render(&diag, color));
            ExitCode::FAILURE
        }
    }
}
