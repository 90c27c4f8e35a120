//! Entry point for the command-line interface.
#![forbid(unsafe_code)]

fn main() {
    if let Err(err) = quadosm_cli::run() {
        eprintln!("quadosm: {err}");
        std::process::exit(1);
    }
}
