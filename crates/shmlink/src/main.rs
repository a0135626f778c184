use std::process::ExitCode;

use clap::Parser;
use shmlink::{
    cli::{Args, Mode},
    driver, tracing_init,
};
use tracing::error;

fn main() -> ExitCode {
    let args = Args::parse();
    tracing_init::init_tracing(&args);

    let outcome = match args.mode {
        Mode::Parent => driver::run_parent(&args),
        Mode::Child => driver::run_child(&args),
    };

    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("fatal: {err}");
            ExitCode::FAILURE
        }
    }
}
