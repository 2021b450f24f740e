//! A persistent mode target that hands over to a fresh child every third input.

use core::num::NonZeroU32;
use std::process::ExitCode;

use libafl_forkrt_tests::target;

/// Inputs per child
const ITERATIONS: Option<NonZeroU32> = NonZeroU32::new(3);

fn main() -> ExitCode {
    env_logger::init();

    let mut code = ExitCode::SUCCESS;
    loop {
        match libafl_forkrt::fuzz_loop(ITERATIONS) {
            Ok(true) => {}
            Ok(false) => break,
            Err(err) => {
                log::error!("{err}");
                return ExitCode::FAILURE;
            }
        }
        code = target::run_once().unwrap_or_else(|err| {
            log::error!("{err}");
            ExitCode::FAILURE
        });
    }
    code
}
