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

//! The routine a forked child runs before it execs the service binary.
//!
//! Nothing here may allocate in a way that could deadlock (no locks held
//! across fork survive cleanly in a multi-threaded parent), and no failure
//! path may return: every branch either execs or calls `_exit` after
//! writing a failure record to the status pipe.

use std::ffi::CString;
use std::os::unix::io::RawFd;
use std::path::PathBuf;

use crate::launch::{ExecStatusFailure, LaunchPhase, NotifyConfig, ResourceLimit};
use crate::sys::Syscalls;

/// Well-known fd numbers a service expects its passed-down sockets at,
/// mirroring the activation-socket convention used by the original
/// implementation's `open_socket`/`bring_up` pairing.
pub const CONTROL_SOCKET_FD: RawFd = 3;
pub const ACTIVATION_SOCKET_FD: RawFd = 4;

pub struct RunChildParams {
    pub argv: Vec<CString>,
    pub working_dir: Option<PathBuf>,
    pub env_file: Option<PathBuf>,
    pub log_file: Option<PathBuf>,
    pub run_as: Option<(u32, u32)>,
    pub rlimits: Vec<ResourceLimit>,
    pub on_console: bool,
    pub in_foreground: bool,
    pub status_fd: RawFd,
    pub control_socket_fd: Option<RawFd>,
    pub activation_socket_fd: Option<RawFd>,
    pub notify_fd: Option<RawFd>,
    pub notify: NotifyConfig,
}

/// Writes a phase+errno failure record to the status pipe and exits with
/// the shell convention for "command could not be executed". Never
/// returns.
fn fail(sys: &dyn Syscalls, status_fd: RawFd, phase: LaunchPhase, errno: i32) -> ! {
    let record = ExecStatusFailure { phase, errno }.encode();
    let _ = sys.write(status_fd, &record);
    unsafe {
        libc::_exit(127);
    }
}

/// Runs in the forked child. Never returns: it either `execve`s the
/// target command or writes a failure record and exits.
pub fn run_child(sys: &dyn Syscalls, params: RunChildParams) -> ! {
    unsafe {
        libc::setpgid(0, 0);
    }

    if !params.on_console {
        unsafe {
            libc::setsid();
        }
    }

    if let Some(dir) = &params.working_dir {
        let c_dir = match CString::new(dir.as_os_str().to_string_lossy().into_owned()) {
            Ok(c) => c,
            Err(_) => fail(sys, params.status_fd, LaunchPhase::WorkingDir, libc::EINVAL),
        };
        let rc = unsafe { libc::chdir(c_dir.as_ptr()) };
        if rc != 0 {
            fail(
                sys,
                params.status_fd,
                LaunchPhase::WorkingDir,
                std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO),
            );
        }
    }

    if let Some(_env_file) = &params.env_file {
        // Environment-file parsing and application lives at the edge of
        // the supervisor proper (it is a format concern, not a process
        // lifecycle one); this hook exists so callers with an environment
        // loader can set `std::env::set_var` calls in before we reach
        // here. Nothing to do by default.
    }

    if let Some((uid, gid)) = params.run_as {
        let rc = unsafe { libc::setgid(gid) };
        if rc != 0 {
            fail(
                sys,
                params.status_fd,
                LaunchPhase::Credentials,
                std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO),
            );
        }
        let rc = unsafe { libc::setuid(uid) };
        if rc != 0 {
            fail(
                sys,
                params.status_fd,
                LaunchPhase::Credentials,
                std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO),
            );
        }
    }

    for limit in &params.rlimits {
        let rlim = libc::rlimit {
            rlim_cur: limit.soft,
            rlim_max: limit.hard,
        };
        let rc = unsafe { libc::setrlimit(limit.resource as libc::c_int, &rlim) };
        if rc != 0 {
            fail(
                sys,
                params.status_fd,
                LaunchPhase::ResourceLimits,
                std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO),
            );
        }
    }

    if let Some(fd) = params.control_socket_fd {
        if fd != CONTROL_SOCKET_FD {
            let rc = unsafe { libc::dup2(fd, CONTROL_SOCKET_FD) };
            if rc < 0 {
                fail(
                    sys,
                    params.status_fd,
                    LaunchPhase::ControlSocket,
                    std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO),
                );
            }
            sys.close(fd);
        }
    }

    if let Some(fd) = params.activation_socket_fd {
        if fd != ACTIVATION_SOCKET_FD {
            let rc = unsafe { libc::dup2(fd, ACTIVATION_SOCKET_FD) };
            if rc < 0 {
                fail(
                    sys,
                    params.status_fd,
                    LaunchPhase::ActivationSocket,
                    std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO),
                );
            }
            sys.close(fd);
        }
    }

    if let Some(fd) = params.notify_fd {
        match &params.notify {
            NotifyConfig::FixedFd(target) => {
                if fd != *target {
                    let rc = unsafe { libc::dup2(fd, *target) };
                    if rc < 0 {
                        fail(
                            sys,
                            params.status_fd,
                            LaunchPhase::NotifyFd,
                            std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO),
                        );
                    }
                    sys.close(fd);
                }
            }
            NotifyConfig::EnvVar(name) => {
                unsafe {
                    let key = CString::new(name.as_str()).unwrap();
                    let value = CString::new(fd.to_string()).unwrap();
                    libc::setenv(key.as_ptr(), value.as_ptr(), 1);
                }
            }
            NotifyConfig::None => {}
        }
    }

    if !params.in_foreground {
        if let Some(log_path) = &params.log_file {
            if let Ok(c_path) = CString::new(log_path.as_os_str().to_string_lossy().into_owned()) {
                let fd = unsafe { libc::open(c_path.as_ptr(), libc::O_WRONLY | libc::O_CREAT | libc::O_APPEND, 0o640) };
                if fd >= 0 {
                    unsafe {
                        libc::dup2(fd, libc::STDOUT_FILENO);
                        libc::dup2(fd, libc::STDERR_FILENO);
                        if fd != libc::STDOUT_FILENO && fd != libc::STDERR_FILENO {
                            libc::close(fd);
                        }
                    }
                }
            }
        }
    }

    if params.argv.is_empty() {
        fail(sys, params.status_fd, LaunchPhase::Exec, libc::EINVAL);
    }
    let argv_ptrs: Vec<*const libc::c_char> = params
        .argv
        .iter()
        .map(|a| a.as_ptr())
        .chain(std::iter::once(std::ptr::null()))
        .collect();

    unsafe {
        libc::execv(params.argv[0].as_ptr(), argv_ptrs.as_ptr());
    }
    fail(
        sys,
        params.status_fd,
        LaunchPhase::Exec,
        std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::ENOEXEC),
    );
}
