//! Environment variables understood by the runtime, and the [`Config`] read from them.

use std::env::{self, VarError};

use libafl_bolts::shmem::ShMemId;
use nix::sys::signal::Signal;

use crate::{crash, edges::SkipPolicy, Error};

/// The id of the coverage map segment, set by the fuzzer
pub const SHM_ENV_VAR: &str = "__AFL_SHM_ID";
/// If present, [`crate::fuzz_loop`] runs in persistent mode
pub const PERSISTENT_ENV_VAR: &str = "__AFL_PERSISTENT";
/// The signal raised when the target panics, `0` to keep panics as they are
pub const SIGNAL_ENV_VAR: &str = "FORKRT_SIGNAL";
/// Numeric salt mixed into every location hash. Required next to [`SHM_ENV_VAR`].
pub const HASH_SEED_ENV_VAR: &str = "FORKRT_HASH_SEED";
/// `:`-separated unit prefixes that are not traced into
pub const SKIP_PREFIXES_ENV_VAR: &str = "FORKRT_SKIP_PREFIXES";

/// Runtime configuration, as read from the environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// The coverage map. `None` means there is no fuzzer.
    pub shm_id: Option<ShMemId>,
    /// Persistent mode was requested
    pub persistent: bool,
    /// The signal the crash bridge raises, `None` if disabled
    pub crash_signal: Option<Signal>,
    /// Location hash salt. Pinned per campaign: every run must use the same one.
    pub hash_seed: u32,
    /// Calls into these units are not traced into
    pub skip: SkipPolicy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            shm_id: None,
            persistent: false,
            crash_signal: Some(crash::DEFAULT_CRASH_SIGNAL),
            hash_seed: 0,
            skip: SkipPolicy::default(),
        }
    }
}

impl Config {
    /// Read the configuration from the process environment.
    ///
    /// Without [`SHM_ENV_VAR`] there is no fuzzer and nothing else is looked
    /// at. With it, malformed variables are an error: the harness was started
    /// incorrectly and coverage would be meaningless. The hash seed must then
    /// be given explicitly, so that every run of a campaign hashes alike.
    pub fn from_env() -> Result<Self, Error> {
        Self::from_lookup(|name| env::var(name))
    }

    /// Like [`Config::from_env`], with `lookup` standing in for [`env::var`].
    pub fn from_lookup<F>(lookup: F) -> Result<Self, Error>
    where
        F: Fn(&str) -> Result<String, VarError>,
    {
        let mut config = Self::default();

        let Some(id) = optional(&lookup, SHM_ENV_VAR)? else {
            return Ok(config);
        };
        config.shm_id = Some(parse_shm_id(&id)?);

        config.persistent = optional(&lookup, PERSISTENT_ENV_VAR)?.is_some();
        if let Some(signal) = optional(&lookup, SIGNAL_ENV_VAR)? {
            config.crash_signal = crash::parse_signal(&signal)?;
        }
        let Some(seed) = optional(&lookup, HASH_SEED_ENV_VAR)? else {
            return Err(Error::illegal_argument(format!(
                "{HASH_SEED_ENV_VAR} must be set when {SHM_ENV_VAR} is"
            )));
        };
        config.hash_seed = seed.trim().parse().map_err(|_| {
            Error::illegal_argument(format!(
                "{HASH_SEED_ENV_VAR} must be a fixed number, got {seed:?}"
            ))
        })?;
        if let Some(prefixes) = optional(&lookup, SKIP_PREFIXES_ENV_VAR)? {
            config.skip = SkipPolicy::new(prefixes.split(':').filter(|p| !p.is_empty()));
        }

        Ok(config)
    }
}

/// System V ids are non-negative ints.
fn parse_shm_id(id: &str) -> Result<ShMemId, Error> {
    match id.trim().parse::<i32>() {
        Ok(id) if id >= 0 => Ok(ShMemId::from_int(id)),
        _ => Err(Error::illegal_argument(format!(
            "{SHM_ENV_VAR} is not a shared memory id: {id:?}"
        ))),
    }
}

fn optional<F>(lookup: &F, name: &str) -> Result<Option<String>, Error>
where
    F: Fn(&str) -> Result<String, VarError>,
{
    match lookup(name) {
        Ok(val) => Ok(Some(val)),
        Err(VarError::NotPresent) => Ok(None),
        Err(err) => Err(Error::illegal_argument(format!(
            "Error while fetching env variable {name}: {err:?}"
        ))),
    }
}
