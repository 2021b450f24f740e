//! A persistent mode target: one input per `fuzz_loop` iteration.

use std::process::ExitCode;

use libafl_forkrt_tests::target;

fn main() -> ExitCode {
    env_logger::init();

    let mut code = ExitCode::SUCCESS;
    loop {
        match libafl_forkrt::fuzz_loop(None) {
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
