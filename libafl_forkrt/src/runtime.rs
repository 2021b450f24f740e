//! The per-process instrumentation context.
//!
//! [`crate::init`] (or the first [`crate::fuzz_loop`]) goes through here
//! exactly once: it reads the [`Config`], attaches the coverage map, runs the
//! forkserver and, in the child, installs the [`EdgeRecorder`] and the crash
//! bridge.

use core::sync::atomic::{AtomicBool, Ordering};
use std::process;

use crate::{
    coverage::CoverageMap,
    crash,
    edges::{self, EdgeRecorder},
    env::Config,
    forkserver::{start_forkserver, ControlChannel, ForkserverState, MaybePersistentForkserverParent},
    Error,
};

/// What initialization found
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitState {
    /// No fuzzer in the environment. Nothing is instrumented, panics stay panics.
    Standalone,
    /// The coverage map is attached, but no forkserver is listening: the
    /// target runs once in this process (`afl-showmap` style).
    Instrumented,
    /// This process is a child forked by the forkserver.
    Child,
}

impl InitState {
    /// Whether edges are being recorded
    #[must_use]
    pub fn is_instrumented(self) -> bool {
        self != InitState::Standalone
    }
}

/// The outcome of [`start`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Started {
    pub(crate) state: InitState,
    /// The forkserver runs in persistent mode
    pub(crate) persistent: bool,
}

static INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Initialize once. `loop_driven` is set when called from the persistent
/// loop, which may then honor the persistent mode marker.
pub(crate) fn start(loop_driven: bool) -> Result<Started, Error> {
    if INITIALIZED.swap(true, Ordering::SeqCst) {
        return Err(Error::illegal_state("AFL already initialized"));
    }
    let config = Config::from_env()?;
    let persistent = loop_driven && config.persistent;
    let state = start_with(&config, persistent, ControlChannel::well_known())?;
    Ok(Started { state, persistent })
}

pub(crate) fn init(loop_driven: bool) -> Result<InitState, Error> {
    start(loop_driven).map(|started| started.state)
}

fn start_with(
    config: &Config,
    persistent: bool,
    channel: ControlChannel,
) -> Result<InitState, Error> {
    let Some(shm_id) = config.shm_id else {
        log::warn!("no AFL environment");
        return Ok(InitState::Standalone);
    };
    let map = CoverageMap::attach(shm_id)?;

    let mut parent = MaybePersistentForkserverParent::new(persistent);
    let state = match start_forkserver(channel, &mut parent) {
        Ok(ForkserverState::Child) => InitState::Child,
        Ok(ForkserverState::NoFuzzer) => {
            log::info!("no forkserver listening, running the target once");
            InitState::Instrumented
        }
        Ok(ForkserverState::Terminated) => process::exit(0),
        Err(err) => {
            // The fuzzer's view of the protocol is lost, there is no way back.
            log::error!("forkserver failed: {err}");
            process::exit(1)
        }
    };

    edges::install(EdgeRecorder::new(map, config.hash_seed, config.skip.clone()))?;
    if let Some(signal) = config.crash_signal {
        crash::install(signal);
    }
    Ok(state)
}
