//! A one-shot target: `init`, then handle a single input from stdin.

use std::process::ExitCode;

use libafl_forkrt::InitState;
use libafl_forkrt_tests::target;
use nix::sys::signal::{signal, SigHandler, Signal};

fn main() -> ExitCode {
    env_logger::init();

    // The forkserver has to reap its children regardless.
    if let Err(err) = unsafe { signal(Signal::SIGCHLD, SigHandler::SigIgn) } {
        log::warn!("could not ignore SIGCHLD: {err}");
    }

    match libafl_forkrt::init() {
        Ok(InitState::Standalone) => log::debug!("running without a fuzzer"),
        Ok(state) => log::debug!("initialized: {state:?}"),
        Err(err) => {
            log::error!("{err}");
            return ExitCode::FAILURE;
        }
    }

    target::run_once().unwrap_or_else(|err| {
        log::error!("{err}");
        ExitCode::FAILURE
    })
}
