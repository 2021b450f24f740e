use std::{
    fs,
    io::{Read, Write},
    process::{Command, Output, Stdio},
};

use libafl_bolts::shmem::{ShMem, ShMemProvider, UnixShMemProvider};
use libafl_forkrt::{
    env::{HASH_SEED_ENV_VAR, PERSISTENT_ENV_VAR, SHM_ENV_VAR, SKIP_PREFIXES_ENV_VAR},
    MAP_SIZE,
};
use libafl_forkrt_tests::{harness::ForkserverHarness, target};
use nix::{
    sys::{
        signal::{kill, Signal},
        wait::{waitpid, WaitPidFlag, WaitStatus},
    },
    unistd::Pid,
};
use serial_test::serial;

const TARGET: &str = env!("CARGO_BIN_EXE_forkrt_target");
const PERSISTENT_TARGET: &str = env!("CARGO_BIN_EXE_forkrt_target_persistent");
const BOUNDED_TARGET: &str = env!("CARGO_BIN_EXE_forkrt_target_bounded");

fn standalone(target: &str, input: &[u8]) -> Output {
    let mut child = Command::new(target)
        .env_remove(SHM_ENV_VAR)
        .env_remove(PERSISTENT_ENV_VAR)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .unwrap();
    child.stdin.take().unwrap().write_all(input).unwrap();
    child.wait_with_output().unwrap()
}

#[test]
#[serial]
fn test_handshake_and_shutdown() {
    let harness = ForkserverHarness::spawn(TARGET, false).unwrap();
    assert_eq!(harness.hello(), 0);
    // EOF on the control pipe ends the forkserver cleanly
    assert!(harness.shutdown().unwrap().success());
}

#[test]
#[serial]
fn test_one_shot_coverage() {
    let mut harness = ForkserverHarness::spawn(TARGET, false).unwrap();

    let zero = harness.run(b"0").unwrap();
    assert_eq!(zero.exit_code(), Some(0));
    assert!(zero.edges() > 0);

    let again = harness.run(b"0").unwrap();
    assert_ne!(zero.pid, again.pid);
    assert_eq!(zero.map, again.map);

    let one = harness.run(b"1").unwrap();
    assert_eq!(one.exit_code(), Some(0));
    assert_ne!(zero.map, one.map);

    let empty = harness.run(b"").unwrap();
    assert_eq!(empty.exit_code(), Some(1));

    assert!(harness.shutdown().unwrap().success());
}

#[test]
#[serial]
fn test_panic_is_a_crash() {
    let mut harness = ForkserverHarness::spawn(TARGET, false).unwrap();
    let crash = harness.run(b"\xff").unwrap();
    assert_eq!(crash.signal(), Some(libc::SIGUSR1));

    // the forkserver keeps going
    let fine = harness.run(b"1").unwrap();
    assert_eq!(fine.exit_code(), Some(0));
    assert!(harness.shutdown().unwrap().success());
}

#[test]
#[serial]
fn test_persistent_reuses_the_child() {
    let mut harness = ForkserverHarness::spawn(PERSISTENT_TARGET, true).unwrap();

    let zero = harness.run(b"0").unwrap();
    assert!(zero.stopped());
    let one = harness.run(b"1").unwrap();
    assert!(one.stopped());
    let zero_again = harness.run(b"0").unwrap();

    assert_eq!(zero.pid, one.pid);
    assert_eq!(zero.pid, zero_again.pid);
    assert_ne!(zero.map, one.map);
    // each iteration starts from a fresh previous location
    assert_eq!(zero.map, zero_again.map);

    assert!(harness.shutdown().unwrap().success());
}

#[test]
#[serial]
fn test_persistent_crash_ends_the_child() {
    let mut harness = ForkserverHarness::spawn(PERSISTENT_TARGET, true).unwrap();
    let first = harness.run(b"0").unwrap();
    assert!(first.stopped());

    let crash = harness.run(b"\xff").unwrap();
    assert_eq!(crash.pid, first.pid);
    assert_eq!(crash.signal(), Some(libc::SIGUSR1));

    // a new child takes over
    let next = harness.run(b"1").unwrap();
    assert_ne!(next.pid, first.pid);
    assert!(next.stopped());

    assert!(harness.shutdown().unwrap().success());
}

#[test]
fn test_standalone_runs_once() {
    let out = standalone(TARGET, b"0");
    assert!(out.status.success());
    assert_eq!(String::from_utf8_lossy(&out.stdout), "Looks like a zero to me!\n");

    let out = standalone(TARGET, b"");
    assert_eq!(out.status.code(), Some(1));
    assert_eq!(String::from_utf8_lossy(&out.stdout), "Hum?\n");

    let out = standalone(PERSISTENT_TARGET, b"7");
    assert!(out.status.success());
    assert_eq!(
        String::from_utf8_lossy(&out.stdout),
        "A non-zero value? How quaint!\n"
    );
}

#[test]
fn test_standalone_panic_stays_a_panic() {
    let out = standalone(TARGET, b"\xff");
    assert_eq!(out.status.code(), Some(101));
}

/// Run `cmd` on `input` until it exits or stops itself; a stopped target is killed.
fn run_to_end(cmd: &mut Command, input: &[u8]) -> (WaitStatus, String) {
    let mut child = cmd
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .unwrap();
    child.stdin.take().unwrap().write_all(input).unwrap();
    let pid = Pid::from_raw(child.id().try_into().unwrap());
    let status = waitpid(pid, Some(WaitPidFlag::WUNTRACED)).unwrap();
    if let WaitStatus::Stopped(..) = status {
        kill(pid, Signal::SIGKILL).unwrap();
        waitpid(pid, None).unwrap();
    }
    let mut stdout = String::new();
    child.stdout.take().unwrap().read_to_string(&mut stdout).unwrap();
    (status, stdout)
}

#[test]
fn test_binaries_carry_the_persistent_signature() {
    let signature = b"##SIG_AFL_PERSISTENT##\0";
    for target in [PERSISTENT_TARGET, BOUNDED_TARGET] {
        let binary = fs::read(target).unwrap();
        assert!(
            binary.windows(signature.len()).any(|w| w == signature),
            "{target} lacks the persistent mode signature"
        );
    }
}

#[test]
#[serial]
fn test_bounded_loop_hands_over_to_a_fresh_child() {
    let mut harness = ForkserverHarness::spawn(BOUNDED_TARGET, true).unwrap();

    let first = harness.run(b"0").unwrap();
    assert!(first.stopped());
    let second = harness.run(b"1").unwrap();
    assert!(second.stopped());
    let third = harness.run(b"0").unwrap();
    assert_eq!(first.pid, second.pid);
    assert_eq!(first.pid, third.pid);
    // the third iteration was the last one
    assert_eq!(third.exit_code(), Some(0));
    assert_eq!(first.map, third.map);

    let fourth = harness.run(b"0").unwrap();
    assert_ne!(fourth.pid, first.pid);
    assert!(fourth.stopped());
    assert_eq!(first.map, fourth.map);

    assert!(harness.shutdown().unwrap().success());
}

#[test]
fn test_persistent_marker_without_fuzzer_runs_once() {
    let mut cmd = Command::new(PERSISTENT_TARGET);
    cmd.env_remove(SHM_ENV_VAR).env(PERSISTENT_ENV_VAR, "1");
    let (status, stdout) = run_to_end(&mut cmd, b"0");
    assert!(matches!(status, WaitStatus::Exited(_, 0)), "{status:?}");
    assert_eq!(stdout, "Looks like a zero to me!\n");
}

#[test]
#[serial]
fn test_persistent_marker_without_forkserver_runs_once() {
    let mut shmem_provider = UnixShMemProvider::new().unwrap();
    let shmem = shmem_provider.new_shmem(MAP_SIZE).unwrap();

    let mut cmd = Command::new(PERSISTENT_TARGET);
    cmd.env(SHM_ENV_VAR, shmem.id().to_string())
        .env(HASH_SEED_ENV_VAR, "0")
        .env(PERSISTENT_ENV_VAR, "1");
    let (status, stdout) = run_to_end(&mut cmd, b"1");
    assert!(matches!(status, WaitStatus::Exited(_, 0)), "{status:?}");
    assert_eq!(stdout, "A non-zero value? How quaint!\n");
    // instrumented all the same
    assert!(shmem.iter().any(|&c| c != 0));
}

#[test]
#[serial]
fn test_killed_stopped_child_is_replaced() {
    let mut harness = ForkserverHarness::spawn(PERSISTENT_TARGET, true).unwrap();
    let first = harness.run(b"0").unwrap();
    assert!(first.stopped());

    assert_eq!(harness.kill_stopped_child().unwrap(), Some(first.pid));
    let next = harness.run(b"0").unwrap();
    assert_ne!(next.pid, first.pid);
    assert!(next.stopped());
    assert_eq!(first.map, next.map);
    // the forkserver has reaped the killed child
    assert!(kill(Pid::from_raw(first.pid), None).is_err());

    assert!(harness.shutdown().unwrap().success());
}

#[test]
#[serial]
fn test_skipped_unit_only_records_the_call() {
    let skip = [(SKIP_PREFIXES_ENV_VAR, target::UNIT)];
    let mut harness = ForkserverHarness::spawn_with_env(TARGET, false, &skip).unwrap();

    let zero = harness.run(b"0").unwrap();
    let one = harness.run(b"1").unwrap();
    assert_eq!(zero.exit_code(), Some(0));
    assert_eq!(one.exit_code(), Some(0));
    assert_eq!(zero.edges(), 1);
    assert_eq!(zero.map, one.map);

    assert!(harness.shutdown().unwrap().success());
}
