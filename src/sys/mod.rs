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

//! Thin wrapper around the handful of system calls the launch routine and
//! signal delivery logic need. Production code runs against `UnixSyscalls`;
//! tests substitute `fake::FakeSyscalls` so the state machine and launch
//! routine can be exercised without forking a real process.

use std::fmt;
use std::io;
use std::os::unix::io::RawFd;

pub type Pid = libc::pid_t;

#[cfg(test)]
pub mod fake;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ForkOutcome {
    Parent(Pid),
    Child,
}

/// System calls used by the launch routine and by signal delivery.
///
/// Mirrors the `bp_sys` namespace from the original implementation: a seam
/// that exists purely so unit tests don't have to fork real processes.
pub trait Syscalls: fmt::Debug {
    fn pipe2_cloexec(&self) -> io::Result<(RawFd, RawFd)>;
    fn socketpair_cloexec(&self) -> io::Result<(RawFd, RawFd)>;
    fn close(&self, fd: RawFd);
    fn read(&self, fd: RawFd, buf: &mut [u8]) -> io::Result<usize>;
    fn write(&self, fd: RawFd, buf: &[u8]) -> io::Result<usize>;

    /// # Safety
    /// Forks the process. The child side must not return to the caller
    /// except by exec'ing or exiting; see `crate::child_run`.
    fn fork(&self) -> io::Result<ForkOutcome>;

    fn kill(&self, pid: Pid, signal: i32) -> io::Result<()>;
    fn getpgid(&self, pid: Pid) -> io::Result<Pid>;
    fn process_alive(&self, pid: Pid) -> bool;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct UnixSyscalls;

impl Syscalls for UnixSyscalls {
    fn pipe2_cloexec(&self) -> io::Result<(RawFd, RawFd)> {
        let mut fds = [0 as RawFd; 2];
        let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok((fds[0], fds[1]))
    }

    fn socketpair_cloexec(&self) -> io::Result<(RawFd, RawFd)> {
        let mut fds = [0 as RawFd; 2];
        let rc = unsafe {
            libc::socketpair(
                libc::AF_UNIX,
                libc::SOCK_STREAM | libc::SOCK_CLOEXEC,
                0,
                fds.as_mut_ptr(),
            )
        };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok((fds[0], fds[1]))
    }

    fn close(&self, fd: RawFd) {
        unsafe {
            libc::close(fd);
        }
    }

    fn read(&self, fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
        let rc = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if rc < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(rc as usize)
        }
    }

    fn write(&self, fd: RawFd, buf: &[u8]) -> io::Result<usize> {
        let rc = unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
        if rc < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(rc as usize)
        }
    }

    fn fork(&self) -> io::Result<ForkOutcome> {
        let pid = unsafe { libc::fork() };
        if pid < 0 {
            Err(io::Error::last_os_error())
        } else if pid == 0 {
            Ok(ForkOutcome::Child)
        } else {
            Ok(ForkOutcome::Parent(pid))
        }
    }

    fn kill(&self, pid: Pid, signal: i32) -> io::Result<()> {
        let rc = unsafe { libc::kill(pid, signal) };
        if rc != 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }

    fn getpgid(&self, pid: Pid) -> io::Result<Pid> {
        let rc = unsafe { libc::getpgid(pid) };
        if rc < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(rc)
        }
    }

    fn process_alive(&self, pid: Pid) -> bool {
        unsafe { libc::kill(pid, 0) == 0 }
    }
}
