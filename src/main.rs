use clap::Parser;
use fiiopt::cli::{run, Cli};

fn main() -> std::process::ExitCode {
    run(Cli::parse())
}
