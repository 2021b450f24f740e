//! End to end tests for `libafl_forkrt`.
//!
//! The `forkrt_target` and `forkrt_target_persistent` binaries are small
//! instrumented targets; [`harness::ForkserverHarness`] plays the fuzzer for them.

#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![allow(clippy::missing_errors_doc, clippy::missing_panics_doc)]
#![warn(missing_docs, missing_debug_implementations)]

pub mod harness;
pub mod target;
