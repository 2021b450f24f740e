//! The code under test of the demo targets

use std::{
    io::{self, Read, Write},
    process::ExitCode,
};

use libafl_forkrt::{edge, edge_call};

/// The unit the [`classify`] edges are recorded under
pub const UNIT: &str = file!();

/// What the target thinks of its input
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Nothing to look at
    Empty,
    /// The input starts with `0`
    Zero,
    /// Any other ASCII input
    NonZero,
}

impl Verdict {
    /// The line the target prints
    #[must_use]
    pub fn message(self) -> &'static str {
        match self {
            Verdict::Empty => "Hum?",
            Verdict::Zero => "Looks like a zero to me!",
            Verdict::NonZero => "A non-zero value? How quaint!",
        }
    }
}

/// Look at `input`. Anything that is not ASCII is a bug: it panics.
#[must_use]
pub fn classify(input: &[u8]) -> Verdict {
    let _frame = edge_call!();
    if input.is_empty() {
        edge!();
        return Verdict::Empty;
    }
    let Ok(text) = core::str::from_utf8(input) else {
        panic!("input is not text");
    };
    assert!(text.is_ascii(), "input is not ASCII");
    if text.starts_with('0') {
        edge!();
        Verdict::Zero
    } else {
        edge!();
        Verdict::NonZero
    }
}

/// One execution: read stdin, classify, print the verdict.
pub fn run_once() -> io::Result<ExitCode> {
    let mut input = Vec::new();
    io::stdin().lock().read_to_end(&mut input)?;

    let verdict = classify(&input);
    let mut stdout = io::stdout().lock();
    writeln!(stdout, "{}", verdict.message())?;
    stdout.flush()?;

    Ok(if verdict == Verdict::Empty {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}
