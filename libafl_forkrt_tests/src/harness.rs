//! The fuzzer side of the forkserver protocol, just enough to drive a target.

use core::sync::atomic::{AtomicUsize, Ordering};
use std::{
    env,
    ffi::OsStr,
    fs::{self, File, OpenOptions},
    io::{self, Read, Seek, SeekFrom, Write},
    os::{
        fd::{AsRawFd, RawFd},
        unix::process::CommandExt,
    },
    path::PathBuf,
    process::{Child, Command, ExitStatus, Stdio},
};

use libafl_bolts::shmem::{ShMem, ShMemProvider, UnixShMem, UnixShMemProvider};
use libafl_forkrt::{
    env::{
        HASH_SEED_ENV_VAR, PERSISTENT_ENV_VAR, SHM_ENV_VAR, SIGNAL_ENV_VAR, SKIP_PREFIXES_ENV_VAR,
    },
    Error, FORKSRV_FD, MAP_SIZE,
};
use nix::{
    fcntl::OFlag,
    sys::signal::{kill, Signal},
    unistd::{pipe2, Pid},
};

/// Configure the target process
pub trait ConfigTarget {
    /// Move the forkserver descriptors to [`FORKSRV_FD`] and [`FORKSRV_FD`]` + 1`.
    ///
    /// Both must be close-on-exec, so that only the copies survive `exec`.
    fn setpipe(&mut self, ctl_read: RawFd, st_write: RawFd) -> &mut Self;
}

impl ConfigTarget for Command {
    fn setpipe(&mut self, ctl_read: RawFd, st_write: RawFd) -> &mut Self {
        let func = move || {
            if unsafe { libc::dup2(ctl_read, FORKSRV_FD) } < 0 {
                return Err(io::Error::last_os_error());
            }
            if unsafe { libc::dup2(st_write, FORKSRV_FD + 1) } < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        };
        unsafe { self.pre_exec(func) }
    }
}

static INPUT_FILES: AtomicUsize = AtomicUsize::new(0);

/// The file the target reads as stdin
#[derive(Debug)]
pub struct OutFile {
    path: PathBuf,
    file: File,
}

impl OutFile {
    /// A fresh input file in the temp dir
    pub fn new() -> Result<Self, Error> {
        let path = env::temp_dir().join(format!(
            "forkrt-input-{}-{}",
            std::process::id(),
            INPUT_FILES.fetch_add(1, Ordering::Relaxed)
        ));
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        Ok(Self { path, file })
    }

    /// A handle sharing this file's offset
    pub fn stdin(&self) -> Result<Stdio, Error> {
        Ok(Stdio::from(self.file.try_clone()?))
    }

    /// Replace the contents with `buf` and rewind
    pub fn write_buf(&mut self, buf: &[u8]) -> Result<(), Error> {
        self.rewind()?;
        self.file.write_all(buf)?;
        self.file.set_len(buf.len() as u64)?;
        self.file.flush()?;
        self.rewind()
    }

    /// Move the shared offset back to the start
    pub fn rewind(&mut self) -> Result<(), Error> {
        self.file.seek(SeekFrom::Start(0))?;
        Ok(())
    }
}

impl Drop for OutFile {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

/// What the forkserver reported for one input
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunResult {
    /// The child that ran it
    pub pid: i32,
    /// Its raw wait status
    pub status: i32,
    /// The coverage map afterwards
    pub map: Vec<u8>,
}

impl RunResult {
    /// The child stopped itself and waits for the next input
    #[must_use]
    pub fn stopped(&self) -> bool {
        libc::WIFSTOPPED(self.status)
    }

    /// The signal that killed the child, if any
    #[must_use]
    pub fn signal(&self) -> Option<i32> {
        libc::WIFSIGNALED(self.status).then(|| libc::WTERMSIG(self.status))
    }

    /// The exit code, if the child exited
    #[must_use]
    pub fn exit_code(&self) -> Option<i32> {
        libc::WIFEXITED(self.status).then(|| libc::WEXITSTATUS(self.status))
    }

    /// Number of map cells hit
    #[must_use]
    pub fn edges(&self) -> usize {
        self.map.iter().filter(|&&c| c != 0).count()
    }
}

/// A target running under our forkserver
#[derive(Debug)]
pub struct ForkserverHarness {
    forkserver: Child,
    st_pipe: File,
    ctl_pipe: Option<File>,
    input: OutFile,
    shmem: UnixShMem,
    hello: u32,
    /// A persistent child stopped between inputs
    stopped_child: Option<i32>,
    /// The next go token tells the forkserver we killed its child
    was_killed: bool,
}

impl ForkserverHarness {
    /// Spawn `target` and wait for its hello.
    pub fn spawn<S: AsRef<OsStr>>(target: S, persistent: bool) -> Result<Self, Error> {
        Self::spawn_with_env(target, persistent, &[])
    }

    /// Like [`ForkserverHarness::spawn`], with extra variables in the target's environment.
    pub fn spawn_with_env<S: AsRef<OsStr>>(
        target: S,
        persistent: bool,
        envs: &[(&str, &str)],
    ) -> Result<Self, Error> {
        let mut shmem_provider = UnixShMemProvider::new()?;
        let shmem = shmem_provider.new_shmem(MAP_SIZE)?;
        let input = OutFile::new()?;

        let (st_read, st_write) = pipe2(OFlag::O_CLOEXEC)?;
        let (ctl_read, ctl_write) = pipe2(OFlag::O_CLOEXEC)?;

        let mut cmd = Command::new(target);
        cmd.stdin(input.stdin()?)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .env(SHM_ENV_VAR, shmem.id().to_string())
            .env(HASH_SEED_ENV_VAR, "0")
            .env_remove(SIGNAL_ENV_VAR)
            .env_remove(SKIP_PREFIXES_ENV_VAR)
            .setpipe(ctl_read.as_raw_fd(), st_write.as_raw_fd());
        if persistent {
            cmd.env(PERSISTENT_ENV_VAR, "1");
        } else {
            cmd.env_remove(PERSISTENT_ENV_VAR);
        }
        cmd.envs(envs.iter().copied());
        let forkserver = cmd.spawn()?;

        // the target's ends
        drop(st_write);
        drop(ctl_read);

        let mut harness = Self {
            forkserver,
            st_pipe: File::from(st_read),
            ctl_pipe: Some(File::from(ctl_write)),
            input,
            shmem,
            hello: 0,
            stopped_child: None,
            was_killed: false,
        };
        harness.hello = harness.read_st()?;
        log::debug!("forkserver {} said hello", harness.forkserver.id());
        Ok(harness)
    }

    /// The handshake word the forkserver sent
    #[must_use]
    pub fn hello(&self) -> u32 {
        self.hello
    }

    fn read_st(&mut self) -> Result<u32, Error> {
        let mut buf = [0u8; 4];
        self.st_pipe.read_exact(&mut buf)?;
        Ok(u32::from_ne_bytes(buf))
    }

    fn write_ctl(&mut self, val: u32) -> Result<(), Error> {
        let ctl = self
            .ctl_pipe
            .as_mut()
            .ok_or_else(|| Error::illegal_state("control pipe is closed"))?;
        ctl.write_all(&val.to_ne_bytes())?;
        Ok(())
    }

    /// Run the target on `input`.
    #[allow(clippy::cast_possible_wrap)]
    pub fn run(&mut self, input: &[u8]) -> Result<RunResult, Error> {
        self.shmem.fill(0);
        self.input.write_buf(input)?;

        let was_killed = core::mem::take(&mut self.was_killed);
        self.write_ctl(u32::from(was_killed))?;
        let pid = self.read_st()? as i32;
        let status = self.read_st()? as i32;
        self.stopped_child = libc::WIFSTOPPED(status).then_some(pid);

        Ok(RunResult {
            pid,
            status,
            map: self.shmem.to_vec(),
        })
    }

    /// `SIGKILL` the stopped persistent child, as a fuzzer does on a timeout.
    ///
    /// The next [`ForkserverHarness::run`] says so in its go token.
    /// Returns the killed pid, `None` if no child was stopped.
    pub fn kill_stopped_child(&mut self) -> Result<Option<i32>, Error> {
        let Some(pid) = self.stopped_child.take() else {
            return Ok(None);
        };
        kill(Pid::from_raw(pid), Signal::SIGKILL)?;
        self.was_killed = true;
        Ok(Some(pid))
    }

    /// Close the control pipe and wait for the forkserver to exit.
    pub fn shutdown(mut self) -> Result<ExitStatus, Error> {
        drop(self.ctl_pipe.take());
        let status = self.forkserver.wait()?;
        // the forkserver has killed it
        self.stopped_child = None;
        Ok(status)
    }
}

impl Drop for ForkserverHarness {
    fn drop(&mut self) {
        if let Some(pid) = self.stopped_child.take() {
            let _ = kill(Pid::from_raw(pid), Signal::SIGKILL);
        }
        if let Ok(None) = self.forkserver.try_wait() {
            let _ = self.forkserver.kill();
            let _ = self.forkserver.wait();
        }
    }
}
