//! Persistent mode: run many inputs in one forked child.
//!
//! Between iterations the child stops itself with `SIGSTOP`. The forkserver
//! parent sees the stop, reports it, and resumes the same child with
//! `SIGCONT` for the next input instead of forking a new one.
//!
//! Fuzzers look for [`PERSISTENT_SIGNATURE`] in the target binary to decide
//! whether to set `__AFL_PERSISTENT` at all. Any binary calling
//! [`crate::fuzz_loop`] carries it.

use core::{hint, num::NonZeroU32};
use std::{
    env,
    io::{self, BufRead},
    sync::Mutex,
};

use nix::{
    sys::signal::{self, Signal},
    unistd::{lseek, Whence},
};

use crate::{edges, env::PERSISTENT_ENV_VAR, runtime, Error, InitState};

/// The marker `afl-fuzz` and `libafl-fuzz` scan target binaries for
#[used]
pub static PERSISTENT_SIGNATURE: [u8; 23] = *b"##SIG_AFL_PERSISTENT##\0";

/// The process-level steps of the persistent loop.
pub trait LoopHooks {
    /// One-time setup before the first iteration.
    /// Returns whether more than one iteration is allowed.
    fn first(&mut self) -> Result<bool, Error>;

    /// Wait until the next input is ready
    fn suspend(&mut self) -> Result<(), Error>;

    /// Prepare for the next input after [`LoopHooks::suspend`] returned
    fn resume(&mut self) -> Result<(), Error>;
}

/// The loop counter behind [`crate::fuzz_loop`].
#[derive(Debug)]
pub struct PersistentLoop<H> {
    hooks: H,
    started: bool,
    finished: bool,
    allowed: bool,
    iterations: u32,
}

impl<H> PersistentLoop<H>
where
    H: LoopHooks,
{
    /// A loop that has not run yet
    #[must_use]
    pub fn new(hooks: H) -> Self {
        Self {
            hooks,
            started: false,
            finished: false,
            allowed: false,
            iterations: 0,
        }
    }

    /// Whether to run the target once more.
    ///
    /// The first call always returns `true`. Later calls return `true` only
    /// in persistent mode and while fewer than `max` iterations ran, after
    /// waiting for the next input. Once `false`, always `false`.
    pub fn next(&mut self, max: Option<NonZeroU32>) -> Result<bool, Error> {
        if !self.started {
            self.allowed = self.hooks.first()?;
            self.started = true;
            self.iterations = 1;
            return Ok(true);
        }
        if self.finished {
            return Ok(false);
        }

        let more = self.allowed && max.map_or(true, |max| self.iterations < max.get());
        if !more {
            self.finished = true;
            return Ok(false);
        }

        self.hooks.suspend()?;
        self.iterations = self.iterations.saturating_add(1);
        self.hooks.resume()?;
        Ok(true)
    }

    /// Iterations started so far
    #[must_use]
    pub fn iterations(&self) -> u32 {
        self.iterations
    }

    /// Whether this loop may run more than once
    #[must_use]
    pub fn is_persistent(&self) -> bool {
        self.allowed
    }

    /// The hooks driving this loop
    #[must_use]
    pub fn hooks(&self) -> &H {
        &self.hooks
    }
}

/// [`LoopHooks`] for a forkserver child.
#[derive(Debug, Default, Clone, Copy)]
pub struct ForkserverLoopHooks;

impl LoopHooks for ForkserverLoopHooks {
    fn first(&mut self) -> Result<bool, Error> {
        // keeps the marker in binaries linked with --gc-sections
        let _ = hint::black_box(&PERSISTENT_SIGNATURE);
        let requested = env::var_os(PERSISTENT_ENV_VAR).is_some();
        let started = runtime::start(true)?;
        if requested && !started.persistent {
            log::debug!("{PERSISTENT_ENV_VAR} is set, but persistent mode is unavailable");
        }
        // Allocate the std buffers now, not during the first measured run.
        drop(io::stdin().lock());
        drop(io::stdout().lock());
        Ok(started.persistent && started.state == InitState::Child)
    }

    fn suspend(&mut self) -> Result<(), Error> {
        signal::raise(Signal::SIGSTOP)?;
        Ok(())
    }

    fn resume(&mut self) -> Result<(), Error> {
        edges::reset_previous_location();
        rewind_stdin();
        Ok(())
    }
}

/// Let the next iteration read stdin from the start.
///
/// The fuzzer rewrites the input file behind a stdin that is a regular file.
/// Anything else cannot be rewound and is left alone.
fn rewind_stdin() {
    if lseek(io::stdin(), 0, Whence::SeekCur).is_err() {
        return;
    }
    // drop what std buffered of the previous input
    let mut stdin = io::stdin().lock();
    if let Ok(stale) = stdin.fill_buf() {
        let len = stale.len();
        stdin.consume(len);
    }
    let _ = lseek(io::stdin(), 0, Whence::SeekSet);
}

static PERSISTENT_LOOP: Mutex<Option<PersistentLoop<ForkserverLoopHooks>>> = Mutex::new(None);

pub(crate) fn fuzz_loop(max: Option<NonZeroU32>) -> Result<bool, Error> {
    let mut state = PERSISTENT_LOOP
        .lock()
        .map_err(|_| Error::illegal_state("persistent loop poisoned"))?;
    state
        .get_or_insert_with(|| PersistentLoop::new(ForkserverLoopHooks))
        .next(max)
}
