//! Forkserver logic into targets
//!
//! This is the classic AFL protocol, the target side:
//!
//! 1. write a 4 byte hello (all zero) to the status descriptor,
//! 2. block on a 4 byte go token from the control descriptor; EOF ends the loop,
//! 3. fork; the parent reports the child pid and, once `waitpid` returns, the raw
//!    wait status, then goes back to 2.; the child closes both descriptors and
//!    runs the target.
//!
//! In persistent mode a child that stopped itself with `SIGSTOP` is continued
//! with `SIGCONT` instead of forking a new one.
//!
//! `SIGTERM` ends the loop at the next token boundary, also while blocked on
//! the control descriptor.

use core::sync::atomic::{AtomicBool, Ordering};
use std::os::fd::{BorrowedFd, RawFd};

use nix::{
    errno::Errno,
    sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal},
    unistd::{ForkResult, Pid},
};

use crate::Error;

/// The control descriptor the fuzzer writes go tokens to.
/// The status descriptor is `FORKSRV_FD + 1`.
pub const FORKSRV_FD: RawFd = 198;

/// The two descriptors shared with the fuzzer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlChannel {
    read: RawFd,
    write: RawFd,
}

impl ControlChannel {
    /// [`FORKSRV_FD`] and [`FORKSRV_FD`]` + 1`, as set up by the fuzzer.
    #[must_use]
    pub const fn well_known() -> Self {
        Self {
            read: FORKSRV_FD,
            write: FORKSRV_FD + 1,
        }
    }

    /// A channel over arbitrary descriptors. They are not owned by the channel.
    #[must_use]
    pub const fn new(read: RawFd, write: RawFd) -> Self {
        Self { read, write }
    }

    /// Say hello. Returns `false` if nobody is listening.
    fn hello(&self) -> Result<bool, Error> {
        match self.write_raw(&[0u8; 4]) {
            Ok(()) => Ok(true),
            Err(Errno::EBADF) => Ok(false),
            Err(err) => Err(Error::unknown(format!(
                "Could not write the forkserver hello: {err}"
            ))),
        }
    }

    fn write_raw(&self, message: &[u8]) -> Result<(), Errno> {
        // SAFETY: the descriptor is only used while the channel is open
        let fd = unsafe { BorrowedFd::borrow_raw(self.write) };
        let mut written = 0;
        while written < message.len() {
            match nix::unistd::write(fd, &message[written..]) {
                Ok(0) => return Err(Errno::EPIPE),
                Ok(n) => written += n,
                Err(Errno::EINTR) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    fn write_u32(&self, message: u32) -> Result<(), Error> {
        self.write_raw(&message.to_ne_bytes())
            .map_err(|err| Error::unknown(format!("Could not write to the status pipe: {err}")))
    }

    /// Read a 4 byte word, `None` on a clean EOF or once `SIGTERM` arrived.
    fn read_u32(&self) -> Result<Option<u32>, Error> {
        let mut buf = [0u8; 4];
        let mut filled = 0;
        // SAFETY: the descriptor is only used while the channel is open
        let fd = unsafe { BorrowedFd::borrow_raw(self.read) };
        while filled < buf.len() {
            match nix::unistd::read(fd, &mut buf[filled..]) {
                Ok(0) if filled == 0 => return Ok(None),
                Ok(0) => {
                    return Err(Error::illegal_state(format!(
                        "Could not read from the control pipe. Expected 4 bytes, got {filled} bytes"
                    )))
                }
                Ok(n) => filled += n,
                Err(Errno::EINTR) if STOP_SOON.load(Ordering::Relaxed) => return Ok(None),
                Err(Errno::EINTR) => {}
                Err(err) => {
                    return Err(Error::unknown(format!(
                        "Could not read from the control pipe: {err}"
                    )))
                }
            }
        }
        Ok(Some(u32::from_ne_bytes(buf)))
    }

    /// The child must not keep the fuzzer's descriptors.
    fn close(self) {
        let _ = nix::unistd::close(self.read);
        let _ = nix::unistd::close(self.write);
    }
}

/// Parent to handle all logics with forkserver children
pub trait ForkserverParent {
    /// Conduct initializing routine before fuzzing loop.
    ///
    /// Usually, several signal handlers are registered in this function.
    fn pre_fuzzing(&mut self) -> Result<(), Error>;

    /// Spawn a child after the forkserver got a go token.
    ///
    /// If the fuzzer has killed the previous child, `was_killed` is `true`.
    /// In persistent mode a stopped child may be resumed instead of forking,
    /// which the fuzzer cannot tell apart from a fresh child.
    fn spawn_child(&mut self, was_killed: bool) -> Result<ForkResult, Error>;

    /// Wait until the spawned child has done its part and return its raw
    /// wait status.
    fn handle_child_requests(&mut self) -> Result<i32, Error>;

    /// Clean up once the fuzzer has gone away.
    fn post_fuzzing(&mut self) -> Result<(), Error>;
}

/// Whether the forkserver loop is going to stop soon.
///
/// This will be set to true if the forkserver receives SIGTERM.
static STOP_SOON: AtomicBool = AtomicBool::new(false);

extern "C" fn std_handle_sigterm(_signal: libc::c_int) {
    STOP_SOON.store(true, Ordering::Relaxed);
}

/// Forkserver parent that can handle both non-persistent and persistent mode
#[derive(Debug, Default)]
pub struct MaybePersistentForkserverParent {
    persistent: bool,
    last_child_pid: Option<Pid>,
    /// This field is only touched for persistent mode to indicating
    /// whether the child is temporarily stopped or terminated
    child_stopped: bool,
    old_sigchld_action: Option<SigAction>,
    old_sigterm_action: Option<SigAction>,
}

impl MaybePersistentForkserverParent {
    /// Create a new forkserver parent. In `persistent` mode, stopped
    /// children are reported and resumed.
    #[must_use]
    pub fn new(persistent: bool) -> Self {
        Self {
            persistent,
            ..Self::default()
        }
    }

    fn last_child(&self) -> Result<Pid, Error> {
        self.last_child_pid
            .ok_or_else(|| Error::illegal_state("no child has been spawned"))
    }

    fn restore_signal_handlers(&mut self) -> Result<(), Error> {
        if let Some(action) = self.old_sigchld_action.take() {
            unsafe { signal::sigaction(Signal::SIGCHLD, &action) }.inspect_err(|_| {
                log::error!("Fail to restore signal handler for SIGCHLD.");
            })?;
        }
        if let Some(action) = self.old_sigterm_action.take() {
            unsafe { signal::sigaction(Signal::SIGTERM, &action) }.inspect_err(|_| {
                log::error!("Fail to restore signal handler for SIGTERM.");
            })?;
        }
        Ok(())
    }
}

impl ForkserverParent for MaybePersistentForkserverParent {
    fn pre_fuzzing(&mut self) -> Result<(), Error> {
        STOP_SOON.store(false, Ordering::Relaxed);

        // A target ignoring SIGCHLD would make waitpid fail with ECHILD.
        let sigchld = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
        let old_sigchld_action = unsafe { signal::sigaction(Signal::SIGCHLD, &sigchld) }
            .inspect_err(|_| {
                log::error!("Fail to swap signal handler for SIGCHLD.");
            })?;
        self.old_sigchld_action = Some(old_sigchld_action);

        // No SA_RESTART: SIGTERM has to interrupt the read of the next token.
        let sigterm = SigAction::new(
            SigHandler::Handler(std_handle_sigterm),
            SaFlags::empty(),
            SigSet::empty(),
        );
        let old_sigterm_action = unsafe { signal::sigaction(Signal::SIGTERM, &sigterm) }
            .inspect_err(|_| {
                log::error!("Fail to swap signal handler for SIGTERM.");
            })?;
        self.old_sigterm_action = Some(old_sigterm_action);

        Ok(())
    }

    fn spawn_child(&mut self, was_killed: bool) -> Result<ForkResult, Error> {
        // If we stopped the child in persistent mode, but there was a race
        // condition and the fuzzer already issued SIGKILL, write off the old
        // process.
        if self.child_stopped && was_killed {
            self.child_stopped = false;
            let child = self.last_child()?;
            self.last_child_pid = None;
            nix::sys::wait::waitpid(child, None)
                .map_err(|_| Error::illegal_state("child_stopped && was_killed"))?;
        }

        if self.child_stopped {
            // The child is alive but stopped at an input boundary, restart it.
            let child = self.last_child()?;
            signal::kill(child, Signal::SIGCONT)?;
            self.child_stopped = false;
            log::debug!("resumed child {child}");
            return Ok(ForkResult::Parent { child });
        }

        let fork_result = unsafe { nix::unistd::fork() }.inspect_err(|_| {
            log::error!("fork");
        })?;
        match fork_result {
            ForkResult::Parent { child } => {
                log::debug!("forked child {child}");
                self.last_child_pid = Some(child);
            }
            ForkResult::Child => self.restore_signal_handlers()?,
        }
        Ok(fork_result)
    }

    fn handle_child_requests(&mut self) -> Result<i32, Error> {
        let child = self.last_child()?;
        let flags = if self.persistent { libc::WUNTRACED } else { 0 };
        let mut status = 0i32;
        loop {
            if unsafe { libc::waitpid(child.as_raw(), &raw mut status, flags) } >= 0 {
                break;
            }
            let errno = Errno::last();
            if errno != Errno::EINTR {
                log::error!("waitpid");
                return Err(errno.into());
            }
        }
        if libc::WIFSTOPPED(status) {
            self.child_stopped = true;
        } else {
            self.last_child_pid = None;
        }
        Ok(status)
    }

    fn post_fuzzing(&mut self) -> Result<(), Error> {
        if self.child_stopped {
            if let Some(child) = self.last_child_pid.take() {
                let _ = signal::kill(child, Signal::SIGKILL);
                let _ = nix::sys::wait::waitpid(child, None);
            }
            self.child_stopped = false;
        }
        self.restore_signal_handlers()
    }
}

/// Success state when [`start_forkserver`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForkserverState {
    /// There is no AFL forkserver responded. In such case,
    /// we should allow user to do a normal execution.
    NoFuzzer,
    /// Current process is a spawned child.
    Child,
    /// The fuzzer closed the control channel, or `SIGTERM` arrived; the
    /// forkserver is done.
    Terminated,
}

/// Start a forkserver on `channel`, using `forkserver_parent` to deal with the
/// forked children.
///
/// In the root process the loop runs until the fuzzer closes the control
/// channel. Any error on the parent path desynchronizes the fuzzer and should
/// be treated as fatal.
pub fn start_forkserver<P: ForkserverParent>(
    channel: ControlChannel,
    forkserver_parent: &mut P,
) -> Result<ForkserverState, Error> {
    // Phone home and tell the parent that we're OK. If parent isn't there, assume we're
    // not running in forkserver mode and just execute program.
    if !channel.hello()? {
        return Ok(ForkserverState::NoFuzzer);
    }
    log::info!("forkserver is up");

    forkserver_parent.pre_fuzzing()?;

    loop {
        // Wait for parent by reading from the pipe.
        let token = if STOP_SOON.load(Ordering::Relaxed) {
            None
        } else {
            channel.read_u32()?
        };
        let Some(was_killed) = token else {
            if STOP_SOON.load(Ordering::Relaxed) {
                log::info!("SIGTERM received, shutting down");
            } else {
                log::info!("fuzzer closed the control pipe, shutting down");
            }
            forkserver_parent.post_fuzzing()?;
            return Ok(ForkserverState::Terminated);
        };

        if STOP_SOON.load(Ordering::Relaxed) {
            log::info!("SIGTERM received, shutting down");
            forkserver_parent.post_fuzzing()?;
            return Ok(ForkserverState::Terminated);
        }

        match forkserver_parent.spawn_child(was_killed != 0)? {
            ForkResult::Child => {
                channel.close();
                return Ok(ForkserverState::Child);
            }
            ForkResult::Parent { child } => {
                #[allow(clippy::cast_sign_loss)]
                channel.write_u32(child.as_raw() as u32).inspect_err(|_| {
                    log::error!("write to afl-fuzz");
                })?;
            }
        }

        let status = forkserver_parent.handle_child_requests()?;

        // Relay wait status to AFL pipe, then loop back.
        #[allow(clippy::cast_sign_loss)]
        channel.write_u32(status as u32).inspect_err(|_| {
            log::error!("writing to afl-fuzz");
        })?;
    }
}
