//! The ukinstall binary: set up logging, then hand off to the library.

use std::process::ExitCode;

fn main() -> ExitCode {
    ukinstall_utils::initialize_tracing();
    match ukinstall_lib::cli::run_from_args() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!("{err:#}");
            ExitCode::FAILURE
        }
    }
}
