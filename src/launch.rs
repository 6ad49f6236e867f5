// Copyright (c) 2016-2017 Chef Software Inc. and/or applicable contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Fork/exec coordination via a self-pipe.
//!
//! In general you can't tell whether fork+exec succeeded just from the
//! fork call. We use a close-on-exec pipe to communicate success/failure
//! from the child to the parent: a successful exec closes the pipe (the
//! parent sees EOF), while a failing exec writes a phase+errno record
//! before the child exits.

use std::ffi::CString;
use std::os::unix::io::RawFd;
use std::path::PathBuf;

use log::{error, warn};

use crate::child_run::{self, RunChildParams};
use crate::error::{Error, Result};
use crate::event_loop::{EventLoop, WatchHandle, EXEC_STATUS_PRIORITY};
use crate::sys::{ForkOutcome, Pid, Syscalls};

/// How the child reports readiness to the parent.
#[derive(Clone, Debug)]
pub enum NotifyConfig {
    None,
    /// The child learns the fd number to write/close through this env var.
    EnvVar(String),
    /// The parent dup2s the notification pipe to this fixed fd number.
    FixedFd(RawFd),
}

impl NotifyConfig {
    pub fn is_configured(&self) -> bool {
        !matches!(self, NotifyConfig::None)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum LaunchPhase {
    Fork = 0,
    WorkingDir = 1,
    EnvFile = 2,
    Credentials = 3,
    ResourceLimits = 4,
    ControlSocket = 5,
    ActivationSocket = 6,
    NotifyFd = 7,
    Exec = 8,
}

impl LaunchPhase {
    fn from_byte(b: u8) -> LaunchPhase {
        match b {
            1 => LaunchPhase::WorkingDir,
            2 => LaunchPhase::EnvFile,
            3 => LaunchPhase::Credentials,
            4 => LaunchPhase::ResourceLimits,
            5 => LaunchPhase::ControlSocket,
            6 => LaunchPhase::ActivationSocket,
            7 => LaunchPhase::NotifyFd,
            8 => LaunchPhase::Exec,
            _ => LaunchPhase::Fork,
        }
    }
}

/// The exec-status pipe payload: a one-byte phase tag followed by a
/// 4-byte native-endian errno, written in a single `write(2)` so a short
/// read can never tear the phase from the errno.
pub const EXEC_STATUS_RECORD_LEN: usize = 5;

#[derive(Clone, Copy, Debug)]
pub struct ExecStatusFailure {
    pub phase: LaunchPhase,
    pub errno: i32,
}

impl ExecStatusFailure {
    pub fn encode(&self) -> [u8; EXEC_STATUS_RECORD_LEN] {
        let mut buf = [0u8; EXEC_STATUS_RECORD_LEN];
        buf[0] = self.phase as u8;
        buf[1..].copy_from_slice(&self.errno.to_ne_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Option<ExecStatusFailure> {
        if buf.len() < EXEC_STATUS_RECORD_LEN {
            return None;
        }
        let phase = LaunchPhase::from_byte(buf[0]);
        let mut errno_bytes = [0u8; 4];
        errno_bytes.copy_from_slice(&buf[1..5]);
        Some(ExecStatusFailure {
            phase,
            errno: i32::from_ne_bytes(errno_bytes),
        })
    }
}

#[derive(Clone, Debug)]
pub struct ResourceLimit {
    pub resource: i32,
    pub soft: u64,
    pub hard: u64,
}

#[derive(Clone, Debug)]
pub struct LaunchRequest {
    pub argv: Vec<CString>,
    pub working_dir: Option<PathBuf>,
    pub env_file: Option<PathBuf>,
    pub log_file: Option<PathBuf>,
    pub run_as: Option<(u32, u32)>,
    pub rlimits: Vec<ResourceLimit>,
    pub pass_control_socket_fd: bool,
    pub notify: NotifyConfig,
    pub activation_socket_fd: Option<RawFd>,
    pub on_console: bool,
    pub in_foreground: bool,
}

pub struct LaunchOutcome {
    pub pid: Pid,
    pub exec_status_fd: RawFd,
    pub exec_status_watch: WatchHandle,
    pub child_reaper: WatchHandle,
    pub control_conn_fd: Option<RawFd>,
    pub notify_fd: Option<RawFd>,
    pub ready_watch: Option<WatchHandle>,
}

/// Tracks resources acquired so far during a launch attempt so they can be
/// released in reverse order on any failure. Models the original's
/// goto-based rollback as an explicit scoped acquisition list; `commit`
/// clears the list so the resources survive into the parent-side
/// lifetime of a successful launch.
#[derive(Default)]
struct Rollback {
    fds: Vec<RawFd>,
    watches: Vec<WatchHandle>,
}

impl Rollback {
    fn push_fd(&mut self, fd: RawFd) {
        self.fds.push(fd);
    }

    fn push_watch(&mut self, w: WatchHandle) {
        self.watches.push(w);
    }

    fn unwind(mut self, sys: &dyn Syscalls, event_loop: &mut dyn EventLoop) {
        for w in self.watches.drain(..).rev() {
            event_loop.deregister_fd_watch(w);
        }
        for fd in self.fds.drain(..).rev() {
            sys.close(fd);
        }
    }

    fn commit(mut self) {
        self.fds.clear();
        self.watches.clear();
    }
}

/// Implements the launch algorithm: status pipe, optional control socket,
/// optional readiness pipe, exec-status watcher and child-reaper
/// registration (at elevated priority, before the fork), fork, and
/// parent-side post-fork bookkeeping.
///
/// On any failure, every descriptor and watcher created by this call is
/// released and the error is returned; the caller's state is left exactly
/// as if the call had never been made.
pub fn start_ps_process(
    sys: &dyn Syscalls,
    event_loop: &mut dyn EventLoop,
    req: &LaunchRequest,
) -> Result<LaunchOutcome> {
    let (status_r, status_w) = sys.pipe2_cloexec().map_err(|e| {
        error!("can't create status check pipe: {}", e);
        Error::Io(e)
    })?;
    let mut rollback = Rollback::default();
    rollback.push_fd(status_r);
    rollback.push_fd(status_w);

    let mut control_socket: Option<(RawFd, RawFd)> = None;
    if req.pass_control_socket_fd {
        match sys.socketpair_cloexec() {
            Ok((parent_end, child_end)) => {
                rollback.push_fd(parent_end);
                rollback.push_fd(child_end);
                control_socket = Some((parent_end, child_end));
            }
            Err(e) => {
                error!("can't create control socket: {}", e);
                rollback.unwind(sys, event_loop);
                return Err(Error::Io(e));
            }
        }
    }

    let mut notify_pipe: Option<(RawFd, RawFd)> = None;
    let mut ready_watch: Option<WatchHandle> = None;
    if req.notify.is_configured() {
        match sys.pipe2_cloexec() {
            Ok((r, w)) => {
                rollback.push_fd(r);
                rollback.push_fd(w);
                // Added, but not yet enabled: enabled only once the child is
                // known to have started (exec-status EOF observed).
                let handle = event_loop.register_fd_watch(r, EXEC_STATUS_PRIORITY + 1, false);
                rollback.push_watch(handle);
                ready_watch = Some(handle);
                notify_pipe = Some((r, w));
            }
            Err(e) => {
                warn!("can't create notification pipe: {}", e);
                rollback.unwind(sys, event_loop);
                return Err(Error::Io(e));
            }
        }
    }

    // Registered before the fork, at elevated priority, so child-exit is
    // always observed before any ordinary event that could signal the (by
    // then dead) pid -- the discipline behind invariant I5.
    let exec_status_watch = event_loop.register_fd_watch(status_r, EXEC_STATUS_PRIORITY, true);
    rollback.push_watch(exec_status_watch);

    match sys.fork() {
        Ok(ForkOutcome::Child) => {
            let params = RunChildParams {
                argv: req.argv.clone(),
                working_dir: req.working_dir.clone(),
                env_file: req.env_file.clone(),
                log_file: req.log_file.clone(),
                run_as: req.run_as,
                rlimits: req.rlimits.clone(),
                on_console: req.on_console,
                in_foreground: req.in_foreground,
                status_fd: status_w,
                control_socket_fd: control_socket.map(|(_, child_end)| child_end),
                activation_socket_fd: req.activation_socket_fd,
                notify_fd: notify_pipe.map(|(_, w)| w),
                notify: req.notify.clone(),
            };
            // Never returns: execs the command or writes a failure record
            // and exits.
            child_run::run_child(sys, params);
            unreachable!("run_child always exits the process");
        }
        Ok(ForkOutcome::Parent(pid)) => {
            // Registered after fork rather than reserved before it: fork()
            // returns the child pid synchronously with no intervening event
            // loop tick in this single-threaded model, so there is no window
            // where the reaper could miss the child's exit.
            let child_reaper = event_loop.register_child_reaper(pid);

            sys.close(status_w);
            if let Some((_, child_end)) = control_socket {
                sys.close(child_end);
            }
            if let Some((_, w)) = notify_pipe {
                sys.close(w);
            }

            rollback.commit();

            Ok(LaunchOutcome {
                pid,
                exec_status_fd: status_r,
                exec_status_watch,
                child_reaper,
                control_conn_fd: control_socket.map(|(parent_end, _)| parent_end),
                notify_fd: notify_pipe.map(|(r, _)| r),
                ready_watch,
            })
        }
        Err(e) => {
            error!("could not fork: {}", e);
            rollback.unwind(sys, event_loop);
            Err(Error::Io(e))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sys::fake::FakeSyscalls;
    use crate::test_support::FakeEventLoop;

    fn simple_request() -> LaunchRequest {
        LaunchRequest {
            argv: vec![CString::new("/bin/true").unwrap()],
            working_dir: None,
            env_file: None,
            log_file: None,
            run_as: None,
            rlimits: vec![],
            pass_control_socket_fd: false,
            notify: NotifyConfig::None,
            activation_socket_fd: None,
            on_console: false,
            in_foreground: true,
        }
    }

    #[test]
    fn exec_status_failure_round_trips() {
        let failure = ExecStatusFailure {
            phase: LaunchPhase::Exec,
            errno: libc::ENOENT,
        };
        let encoded = failure.encode();
        let decoded = ExecStatusFailure::decode(&encoded).unwrap();
        assert_eq!(decoded.phase, LaunchPhase::Exec);
        assert_eq!(decoded.errno, libc::ENOENT);
    }

    #[test]
    fn successful_launch_closes_child_side_fds_and_keeps_parent_side() {
        let sys = FakeSyscalls::new();
        let mut loop_ = FakeEventLoop::new();
        let outcome = start_ps_process(&sys, &mut loop_, &simple_request()).unwrap();
        assert!(outcome.pid > 0);
        // status_w (child side of the exec-status pipe) was closed by the
        // parent; status_r remains open for the parent to read from.
        assert!(sys.open_fd_count() >= 1);
    }

    // P2: a failed launch leaves the parent's fd count unchanged.
    #[test]
    fn failed_pipe_creation_leaves_no_fds_open() {
        let sys = FakeSyscalls::new();
        sys.set_pipe_fails(true);
        let mut loop_ = FakeEventLoop::new();
        let before = sys.open_fd_count();
        let result = start_ps_process(&sys, &mut loop_, &simple_request());
        assert!(result.is_err());
        assert_eq!(sys.open_fd_count(), before);
    }

    #[test]
    fn failed_fork_rolls_back_everything() {
        let sys = FakeSyscalls::new();
        sys.set_fork_fails(true);
        let mut loop_ = FakeEventLoop::new();
        let before = sys.open_fd_count();
        let result = start_ps_process(&sys, &mut loop_, &simple_request());
        assert!(result.is_err());
        assert_eq!(sys.open_fd_count(), before);
        assert!(loop_.fd_watches().is_empty());
        assert!(loop_.child_reapers().is_empty());
    }

    #[test]
    fn notify_pipe_is_registered_disabled() {
        let sys = FakeSyscalls::new();
        let mut loop_ = FakeEventLoop::new();
        let mut req = simple_request();
        req.notify = NotifyConfig::EnvVar("NOTIFY_FD".into());
        let outcome = start_ps_process(&sys, &mut loop_, &req).unwrap();
        let handle = outcome.ready_watch.unwrap();
        assert!(!loop_.is_watch_enabled(handle));
    }
}
