use std::process::ExitCode;

use clap::Parser;

use crate::program::{Args, Program};

mod harvest;
mod program;

#[tokio::main]
async fn main() -> ExitCode {
    let program = Program::new(Args::parse());
    ExitCode::from(program.run().await)
}
