/*!
* Welcome to `libafl_forkrt`
*/
#![doc = include_str!("../README.md")]
/*! */
#![deny(rustdoc::broken_intra_doc_links)]
#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![allow(
    clippy::unreadable_literal,
    clippy::missing_errors_doc,
    clippy::cast_possible_truncation,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions
)]
#![cfg_attr(not(test), warn(
    missing_debug_implementations,
    missing_docs,
    //trivial_casts,
    trivial_numeric_casts,
    unused_extern_crates,
    unused_import_braces,
    unused_qualifications,
    //unused_results
))]
#![cfg_attr(test, deny(
    missing_debug_implementations,
    missing_docs,
    //trivial_casts,
    trivial_numeric_casts,
    unused_extern_crates,
    unused_import_braces,
    unused_qualifications,
    unused_must_use,
    //unused_results
))]
#![cfg_attr(
    test,
    deny(
        bad_style,
        dead_code,
        improper_ctypes,
        non_shorthand_field_patterns,
        no_mangle_generic_items,
        overflowing_literals,
        path_statements,
        patterns_in_fns_without_body,
        unconditional_recursion,
        unused,
        unused_allocation,
        unused_comparisons,
        unused_parens,
        while_true
    )
)]

#[cfg(not(unix))]
compile_error!("libafl_forkrt speaks the AFL forkserver protocol, which needs a unix target");

pub mod coverage;
pub mod crash;
pub mod edges;
pub mod env;
pub mod forkserver;
pub mod hash;
pub mod persistent;
pub mod runtime;
#[cfg(feature = "sancov_pcguard")]
pub mod sancov_pcguard;

use core::num::NonZeroU32;

pub use coverage::{CoverageMap, MAP_SIZE, MAP_SIZE_POW2};
pub use edges::{EdgeRecorder, Frame, TraceDecision, TraceEvent};
pub use forkserver::{ForkserverState, FORKSRV_FD};
pub use libafl_bolts::Error;
pub use runtime::InitState;

/// Initialize the runtime for a one-shot target.
///
/// Under a fuzzer this attaches the coverage map and runs the forkserver; the
/// call only returns in the forked child (or when no forkserver is listening).
/// Without `__AFL_SHM_ID` it does nothing and returns [`InitState::Standalone`].
///
/// Must be called at most once per process, calling it again fails with
/// [`Error::IllegalState`].
pub fn init() -> Result<InitState, Error> {
    runtime::init(false)
}

/// The persistent mode gate.
///
/// Drive the per-input logic with `while fuzz_loop(None)? { .. }`. The first
/// call initializes the runtime (do not call [`init`] as well). Under a
/// fuzzer with `__AFL_PERSISTENT` set, every later call suspends the process
/// with `SIGSTOP` until the fuzzer sends the next input, then returns `true`,
/// until `max` iterations have run. Otherwise it returns `true` exactly once.
pub fn fuzz_loop(max: Option<NonZeroU32>) -> Result<bool, Error> {
    persistent::fuzz_loop(max)
}

/// Record a coverage edge at the current source line.
///
/// Expands to a call into the installed [`EdgeRecorder`], a no-op when the
/// runtime is not running under a fuzzer.
#[macro_export]
macro_rules! edge {
    () => {
        $crate::edges::trace($crate::TraceEvent::Line, file!(), line!())
    };
}

/// Enter a function at the current source line.
///
/// Records a [`TraceEvent::Call`] and returns the [`Frame`] guard. While the
/// guard lives, and this file is covered by the skip policy, line events of
/// this thread are not recorded. Nested calls still are.
///
/// ```rust,ignore
/// fn parse(input: &[u8]) {
///     let _frame = libafl_forkrt::edge_call!();
///     libafl_forkrt::edge!();
/// }
/// ```
#[macro_export]
macro_rules! edge_call {
    () => {
        $crate::edges::enter(file!(), line!())
    };
}
