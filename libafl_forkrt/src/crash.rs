//! Panics are not crashes as far as the fuzzer is concerned: it only counts a
//! run as crashing when the process dies from a signal. The panic hook
//! installed here raises that signal.

use core::str::FromStr;
use std::panic;

use nix::sys::signal::{self, SigHandler, Signal};

use crate::Error;

/// The signal raised for a panic unless [`crate::env::SIGNAL_ENV_VAR`] says otherwise
pub const DEFAULT_CRASH_SIGNAL: Signal = Signal::SIGUSR1;

/// Parse a signal given by name (`SIGUSR1`, `USR1`) or number.
///
/// `0` returns `None`: the crash bridge is disabled.
pub fn parse_signal(value: &str) -> Result<Option<Signal>, Error> {
    let value = value.trim();
    if let Ok(num) = value.parse::<i32>() {
        if num == 0 {
            return Ok(None);
        }
        return Signal::try_from(num)
            .map(Some)
            .map_err(|_| Error::illegal_argument(format!("Invalid signal number {num}")));
    }

    let name = value.to_ascii_uppercase();
    let name = if name.starts_with("SIG") {
        name
    } else {
        format!("SIG{name}")
    };
    Signal::from_str(&name)
        .map(Some)
        .map_err(|_| Error::illegal_argument(format!("Unknown signal {value:?}")))
}

/// Chain a panic hook that kills the process with `signal`.
///
/// The previous hook still runs first, so the panic message is printed.
pub fn install(signal: Signal) {
    let previous = panic::take_hook();
    panic::set_hook(Box::new(move |info| {
        previous(info);
        raise_fatal(signal);
    }));
    log::debug!("panics will raise {signal}");
}

/// Die from `signal`.
///
/// The disposition is reset first: the target may have installed a handler or
/// ignore it. Should the signal still not end the process, abort.
pub fn raise_fatal(signal: Signal) -> ! {
    unsafe {
        let _ = signal::signal(signal, SigHandler::SigDfl);
    }
    let mut unblock = signal::SigSet::empty();
    unblock.add(signal);
    let _ = unblock.thread_unblock();
    let _ = signal::raise(signal);
    std::process::abort()
}
