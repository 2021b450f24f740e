//! Edge coverage: turns a stream of code locations into hit counts.
//!
//! For every event at `location`:
//!
//! ```text
//! map[location ^ previous_location] += 1;
//! previous_location = location >> 1;
//! ```
//!
//! The shift keeps `A -> B` apart from `B -> A` and gives self loops
//! (`A -> A`) a cell of their own. It is part of the contract with the fuzzer
//! side: maps recorded with a different transform are not comparable.
//!
//! Entering a unit covered by the [`SkipPolicy`] through [`enter`] records
//! the call itself, then mutes the line events of this thread until the
//! returned [`Frame`] is dropped.

use core::{
    cell::Cell,
    marker::PhantomData,
    sync::atomic::{AtomicU32, Ordering},
};
use std::sync::OnceLock;

use crate::{coverage::CoverageMap, hash, Error, MAP_SIZE};

/// Unit prefixes that are not traced into by default: generated code and the
/// standard library sources.
pub const DEFAULT_SKIP_PREFIXES: &[&str] = &["<", "/rustc/"];

/// The kind of control flow event being recorded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceEvent {
    /// A function (or frame) is entered
    Call,
    /// A new line or basic block is executed
    Line,
}

/// What the caller should do with further events of the current frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceDecision {
    /// Keep reporting events
    Continue,
    /// This frame belongs to a skipped unit, stop reporting its events
    Skip,
}

/// Which code units are too boring to trace into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkipPolicy {
    prefixes: Vec<String>,
}

impl SkipPolicy {
    /// Skip units starting with any of `prefixes`
    #[must_use]
    pub fn new<I, S>(prefixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            prefixes: prefixes.into_iter().map(Into::into).collect(),
        }
    }

    /// Trace everything
    #[must_use]
    pub fn none() -> Self {
        Self {
            prefixes: Vec::new(),
        }
    }

    /// Whether calls into `unit` are skipped
    #[must_use]
    pub fn skips(&self, unit: &str) -> bool {
        self.prefixes.iter().any(|prefix| unit.starts_with(prefix.as_str()))
    }
}

impl Default for SkipPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_SKIP_PREFIXES.iter().copied())
    }
}

/// Records edges into a [`CoverageMap`].
#[derive(Debug)]
pub struct EdgeRecorder {
    map: CoverageMap,
    previous_location: AtomicU32,
    salt: u32,
    skip: SkipPolicy,
}

impl EdgeRecorder {
    /// A recorder writing to `map`. `salt` is mixed into every location hash.
    #[must_use]
    pub fn new(map: CoverageMap, salt: u32, skip: SkipPolicy) -> Self {
        Self {
            map,
            previous_location: AtomicU32::new(0),
            salt,
            skip,
        }
    }

    /// The map location of `position` inside `unit`
    #[must_use]
    pub fn location(&self, unit: &str, position: u32) -> u32 {
        let h = hash::feed(hash::fnv1a(unit, u64::from(position)), u64::from(self.salt));
        h % MAP_SIZE as u32
    }

    /// Record an event at `position` of `unit`.
    ///
    /// Calls are always recorded. Lines are dropped while this thread is
    /// inside a skipped [`Frame`].
    pub fn record(&self, event: TraceEvent, unit: &str, position: u32) -> TraceDecision {
        if event == TraceEvent::Line && IN_SKIPPED_FRAME.get() {
            return TraceDecision::Skip;
        }
        self.record_location(self.location(unit, position));
        if event == TraceEvent::Call && self.skip.skips(unit) {
            TraceDecision::Skip
        } else {
            TraceDecision::Continue
        }
    }

    /// Record a call into `unit` and open its frame.
    pub fn enter(&self, unit: &str, position: u32) -> Frame {
        let skipped = self.record(TraceEvent::Call, unit, position) == TraceDecision::Skip;
        Frame::open(skipped)
    }

    /// Record an edge from the previous location to `location`.
    #[inline]
    pub fn record_location(&self, location: u32) {
        let location = location & (MAP_SIZE as u32 - 1);
        let previous = self.previous_location.load(Ordering::Relaxed);
        self.map.increment((location ^ previous) as usize);
        self.previous_location.store(location >> 1, Ordering::Relaxed);
    }

    /// Forget the previous location, the next event starts a fresh path.
    pub fn reset(&self) {
        self.previous_location.store(0, Ordering::Relaxed);
    }

    /// The current `previous_location` register
    #[must_use]
    pub fn previous_location(&self) -> u32 {
        self.previous_location.load(Ordering::Relaxed)
    }

    /// The `previous_location` register itself, for hooks that cannot afford a function call
    #[must_use]
    pub fn previous_location_ptr(&self) -> *mut u32 {
        self.previous_location.as_ptr()
    }

    /// The map this recorder writes to
    #[must_use]
    pub fn map(&self) -> &CoverageMap {
        &self.map
    }
}

thread_local! {
    /// The innermost open [`Frame`] of this thread belongs to a skipped unit
    static IN_SKIPPED_FRAME: Cell<bool> = const { Cell::new(false) };
}

/// An open function frame, see [`enter`].
///
/// Dropping it restores whatever the enclosing frame had decided.
#[derive(Debug)]
#[must_use = "the frame closes as soon as it is dropped"]
pub struct Frame {
    skipped: bool,
    outer_skipped: bool,
    /// Frames track the current thread
    phantom: PhantomData<*const ()>,
}

impl Frame {
    fn open(skipped: bool) -> Self {
        Self {
            skipped,
            outer_skipped: IN_SKIPPED_FRAME.replace(skipped),
            phantom: PhantomData,
        }
    }

    /// Lines inside this frame are not recorded
    #[must_use]
    pub fn is_skipped(&self) -> bool {
        self.skipped
    }
}

impl Drop for Frame {
    fn drop(&mut self) {
        IN_SKIPPED_FRAME.set(self.outer_skipped);
    }
}

/// The recorder of this process, if the runtime is active.
static RECORDER: OnceLock<EdgeRecorder> = OnceLock::new();

/// Make `recorder` the one the [`trace`] hooks write to. Only once per process.
pub fn install(recorder: EdgeRecorder) -> Result<&'static EdgeRecorder, Error> {
    RECORDER
        .set(recorder)
        .map_err(|_| Error::illegal_state("an edge recorder has been installed before"))?;
    let recorder = RECORDER
        .get()
        .ok_or_else(|| Error::illegal_state("edge recorder vanished"))?;
    #[cfg(feature = "sancov_pcguard")]
    crate::sancov_pcguard::attach(recorder);
    Ok(recorder)
}

/// The installed recorder
#[must_use]
pub fn installed() -> Option<&'static EdgeRecorder> {
    RECORDER.get()
}

/// Record an event with the installed recorder. Does nothing if there is none.
#[inline]
pub fn trace(event: TraceEvent, unit: &str, position: u32) -> TraceDecision {
    match RECORDER.get() {
        Some(recorder) => recorder.record(event, unit, position),
        None => TraceDecision::Continue,
    }
}

/// Record a call with the installed recorder and open its frame.
///
/// Without a recorder the frame changes nothing.
pub fn enter(unit: &str, position: u32) -> Frame {
    match RECORDER.get() {
        Some(recorder) => recorder.enter(unit, position),
        None => Frame::open(IN_SKIPPED_FRAME.get()),
    }
}

/// Record a precomputed location with the installed recorder, if any.
#[inline]
pub fn trace_location(location: u32) {
    if let Some(recorder) = RECORDER.get() {
        recorder.record_location(location);
    }
}

/// Reset the installed recorder's previous location, if any.
pub fn reset_previous_location() {
    if let Some(recorder) = RECORDER.get() {
        recorder.reset();
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        coverage::CoverageMap,
        edges::{EdgeRecorder, SkipPolicy, TraceDecision, TraceEvent},
        MAP_SIZE,
    };

    fn recorder() -> EdgeRecorder {
        EdgeRecorder::new(CoverageMap::in_process(), 0, SkipPolicy::default())
    }

    fn run(recorder: &EdgeRecorder, path: &[(&str, u32)]) -> Vec<u8> {
        recorder.map().clear();
        recorder.reset();
        for &(unit, line) in path {
            recorder.record(TraceEvent::Line, unit, line);
        }
        recorder.map().snapshot()
    }

    #[test]
    fn test_first_edge_lands_on_location() {
        let recorder = recorder();
        let loc = recorder.location("src/main.rs", 10);
        assert!((loc as usize) < MAP_SIZE);

        recorder.record_location(loc);
        assert_eq!(recorder.map().get(loc as usize), 1);
        assert_eq!(recorder.previous_location(), loc >> 1);

        recorder.record_location(loc);
        assert_eq!(recorder.map().get((loc ^ (loc >> 1)) as usize), 1);
    }

    #[test]
    fn test_replay_is_deterministic() {
        let recorder = recorder();
        let path = [("a.rs", 1), ("a.rs", 2), ("b.rs", 7), ("a.rs", 2), ("a.rs", 3)];
        assert_eq!(run(&recorder, &path), run(&recorder, &path));
    }

    #[test]
    fn test_distinct_paths_distinct_maps() {
        let recorder = recorder();
        let zero = run(&recorder, &[("t.rs", 1), ("t.rs", 2), ("t.rs", 9)]);
        let other = run(&recorder, &[("t.rs", 1), ("t.rs", 4), ("t.rs", 9)]);
        assert_ne!(zero, other);
    }

    #[test]
    fn test_direction_matters() {
        let recorder = recorder();
        let forward = run(&recorder, &[("x.rs", 1), ("x.rs", 2)]);
        let backward = run(&recorder, &[("x.rs", 2), ("x.rs", 1)]);
        assert_ne!(forward, backward);
    }

    #[test]
    fn test_salt_moves_locations() {
        let plain = recorder();
        let salted = EdgeRecorder::new(CoverageMap::in_process(), 1, SkipPolicy::none());
        assert_ne!(plain.location("t.rs", 1), salted.location("t.rs", 1));
    }

    #[test]
    fn test_skip_policy_only_applies_to_calls() {
        let recorder = recorder();
        let std_unit = "/rustc/0123abcd/library/core/src/option.rs";
        assert_eq!(
            recorder.record(TraceEvent::Call, std_unit, 1),
            TraceDecision::Skip
        );
        assert_eq!(
            recorder.record(TraceEvent::Line, std_unit, 2),
            TraceDecision::Continue
        );
        assert_eq!(
            recorder.record(TraceEvent::Call, "src/lib.rs", 3),
            TraceDecision::Continue
        );
        // the skipped call itself still counts
        assert_eq!(hits(&recorder), 3);
    }

    fn hits(recorder: &EdgeRecorder) -> u32 {
        recorder.map().snapshot().iter().map(|&c| u32::from(c)).sum()
    }

    #[test]
    fn test_skipped_frame_mutes_lines() {
        let recorder = recorder();
        let std_unit = "/rustc/0123abcd/library/core/src/option.rs";
        {
            let frame = recorder.enter(std_unit, 1);
            assert!(frame.is_skipped());
            assert_eq!(
                recorder.record(TraceEvent::Line, std_unit, 2),
                TraceDecision::Skip
            );
            recorder.record(TraceEvent::Line, std_unit, 3);
            assert_eq!(hits(&recorder), 1);
        }
        // back in the caller
        assert_eq!(
            recorder.record(TraceEvent::Line, "src/lib.rs", 4),
            TraceDecision::Continue
        );
        assert_eq!(hits(&recorder), 2);
    }

    #[test]
    fn test_calls_out_of_a_skipped_frame_are_traced() {
        let recorder = recorder();
        let _std = recorder.enter("/rustc/0123abcd/library/core/src/iter.rs", 10);
        {
            // a closure of ours, called back from the standard library
            let callback = recorder.enter("src/lib.rs", 20);
            assert!(!callback.is_skipped());
            recorder.record(TraceEvent::Line, "src/lib.rs", 21);
            assert_eq!(hits(&recorder), 3);
        }
        recorder.record(TraceEvent::Line, "/rustc/0123abcd/library/core/src/iter.rs", 11);
        assert_eq!(hits(&recorder), 3);
    }

    #[test]
    fn test_frame_without_recorder_is_inert() {
        crate::edges::trace_location(7);
        let frame = crate::edges::enter("/rustc/0123abcd/library/core/src/option.rs", 1);
        assert!(!frame.is_skipped());
    }
}
