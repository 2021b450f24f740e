//! [`LLVM` `PcGuard`](https://clang.llvm.org/docs/SanitizerCoverage.html#tracing-pcs-with-guards) hooks
//! feeding the installed [`crate::EdgeRecorder`].
//!
//! Build the target with
//! `-C passes=sancov-module -C llvm-args=-sanitizer-coverage-level=3 -C llvm-args=-sanitizer-coverage-trace-pc-guard`
//! and every basic block becomes an edge event, no [`crate::edge!`] markers needed.
//!
//! The pass instruments every function of every crate it sees, except the
//! `__sanitizer_` hooks themselves. Anything the edge hook calls would call
//! the hook again, so its body only touches raw pointers and integers.

#![allow(clippy::cast_lossless, clippy::cast_possible_truncation)]

use core::{
    ptr,
    sync::atomic::{AtomicU64, Ordering},
};

use crate::{edges::EdgeRecorder, hash, MAP_SIZE};

/// The map the edge hook writes to, null until a recorder is installed
static mut SANCOV_MAP: *mut u8 = ptr::null_mut();
/// The `previous_location` register of the installed recorder
static mut SANCOV_PREVIOUS_LOCATION: *mut u32 = ptr::null_mut();

/// Guards handed out so far, over all modules
static GUARDS_ASSIGNED: AtomicU64 = AtomicU64::new(0);

/// Let the edge hook write through `recorder`.
pub(crate) fn attach(recorder: &'static EdgeRecorder) {
    unsafe {
        SANCOV_PREVIOUS_LOCATION = recorder.previous_location_ptr();
        SANCOV_MAP = recorder.map().as_mut_ptr();
    }
}

/// The location of the `index`th guard. Never 0, which marks a disabled guard.
fn guard_location(index: u64) -> u32 {
    hash::fnv1a("", index) % (MAP_SIZE as u32 - 1) + 1
}

/// Callback for sancov `pc_guard`, called for every instrumented block.
///
/// Does the same as [`EdgeRecorder::record_location`], without calling it.
///
/// # Safety
/// Dereferences `guard`. Should only be called by the instrumentation.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn __sanitizer_cov_trace_pc_guard(guard: *mut u32) {
    unsafe {
        let map = SANCOV_MAP;
        if map as usize == 0 {
            return;
        }
        let location = *guard & (MAP_SIZE as u32 - 1);
        if location == 0 {
            return;
        }
        let previous = SANCOV_PREVIOUS_LOCATION;
        let cell = (map as usize + (location ^ *previous) as usize) as *mut u8;
        *cell = (*cell as u32 + 1) as u8;
        *previous = location >> 1;
    }
}

/// Initialize the sancov `pc_guard` of a module.
///
/// # Safety
/// Writes to every `u32` in `[start, stop)`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn __sanitizer_cov_trace_pc_guard_init(mut start: *mut u32, stop: *mut u32) {
    if ptr::eq(start, stop) || unsafe { *start != 0 } {
        return;
    }
    while start < stop {
        let index = GUARDS_ASSIGNED.fetch_add(1, Ordering::Relaxed);
        unsafe {
            *start = guard_location(index);
            start = start.add(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        coverage::CoverageMap,
        edges::{EdgeRecorder, SkipPolicy},
        sancov_pcguard::{
            __sanitizer_cov_trace_pc_guard, __sanitizer_cov_trace_pc_guard_init, attach,
            guard_location,
        },
        MAP_SIZE,
    };

    #[test]
    fn test_guard_init() {
        let mut guards = [0u32; 64];
        let range = guards.as_mut_ptr_range();
        unsafe { __sanitizer_cov_trace_pc_guard_init(range.start, range.end) };
        assert!(guards.iter().all(|&g| g != 0 && (g as usize) < MAP_SIZE));

        // already initialized modules are left alone
        let before = guards;
        let range = guards.as_mut_ptr_range();
        unsafe { __sanitizer_cov_trace_pc_guard_init(range.start, range.end) };
        assert_eq!(before, guards);
    }

    #[test]
    fn test_guard_locations_are_stable() {
        assert_eq!(guard_location(5), guard_location(5));
        assert_ne!(guard_location(0), 0);
    }

    #[test]
    fn test_hook_matches_the_recorder() {
        let hooked: &'static EdgeRecorder = Box::leak(Box::new(EdgeRecorder::new(
            CoverageMap::in_process(),
            0,
            SkipPolicy::none(),
        )));
        attach(hooked);
        let reference = EdgeRecorder::new(CoverageMap::in_process(), 0, SkipPolicy::none());

        let mut path = [7u32, 9, 7, 0, 7, MAP_SIZE as u32 + 9];
        for guard in &mut path {
            unsafe { __sanitizer_cov_trace_pc_guard(guard) };
            if *guard & (MAP_SIZE as u32 - 1) != 0 {
                reference.record_location(*guard);
            }
        }
        assert_eq!(hooked.map().snapshot(), reference.map().snapshot());
        assert_eq!(hooked.previous_location(), reference.previous_location());
    }
}
