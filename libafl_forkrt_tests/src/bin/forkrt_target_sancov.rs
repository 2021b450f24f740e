//! A one-shot target without `edge!()` markers: built with the sancov pass,
//! every basic block is an edge.

use std::{
    io::{self, Read},
    process::ExitCode,
};

use libafl_forkrt_tests::target::Verdict;

fn verdict(input: &[u8]) -> Verdict {
    match input.first() {
        None => Verdict::Empty,
        Some(b'0') => Verdict::Zero,
        Some(_) => Verdict::NonZero,
    }
}

fn main() -> ExitCode {
    env_logger::init();

    if let Err(err) = libafl_forkrt::init() {
        log::error!("{err}");
        return ExitCode::FAILURE;
    }

    let mut input = Vec::new();
    if let Err(err) = io::stdin().lock().read_to_end(&mut input) {
        log::error!("{err}");
        return ExitCode::FAILURE;
    }
    let verdict = verdict(&input);
    println!("{}", verdict.message());
    if verdict == Verdict::Empty {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}
