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

//! In-memory stand-in for `UnixSyscalls`, used only by tests. `fork` never
//! actually forks: it hands back an incrementing fake pid and the "child"
//! branch is simply never exercised by callers in this crate, since a real
//! child's behavior is observed only through `handle_exec_status_readable`
//! and `handle_child_exit`, both of which tests drive directly.

use std::cell::RefCell;
use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;

use super::{ForkOutcome, Pid, Syscalls};

#[derive(Debug, Default)]
struct State {
    next_fd: RawFd,
    next_pid: Pid,
    open_fds: HashMap<RawFd, Vec<u8>>,
    closed_fds: Vec<RawFd>,
    kills: Vec<(Pid, i32)>,
    pgids: HashMap<Pid, Pid>,
    fork_should_fail: bool,
    pipe_should_fail: bool,
    alive_pids: HashMap<Pid, bool>,
}

#[derive(Debug)]
pub struct FakeSyscalls {
    state: RefCell<State>,
}

impl Default for FakeSyscalls {
    fn default() -> Self {
        FakeSyscalls {
            state: RefCell::new(State {
                next_fd: 100,
                next_pid: 1000,
                ..Default::default()
            }),
        }
    }
}

impl FakeSyscalls {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fork_fails(&self, fails: bool) {
        self.state.borrow_mut().fork_should_fail = fails;
    }

    pub fn set_pipe_fails(&self, fails: bool) {
        self.state.borrow_mut().pipe_should_fail = fails;
    }

    pub fn set_pgid(&self, pid: Pid, pgid: Pid) {
        self.state.borrow_mut().pgids.insert(pid, pgid);
    }

    pub fn set_alive(&self, pid: Pid, alive: bool) {
        self.state.borrow_mut().alive_pids.insert(pid, alive);
    }

    /// Number of fds this stub currently considers open; used for the
    /// "parent fd count is unchanged after a failed launch" property.
    pub fn open_fd_count(&self) -> usize {
        self.state.borrow().open_fds.len()
    }

    pub fn kills(&self) -> Vec<(Pid, i32)> {
        self.state.borrow().kills.clone()
    }

    /// Write bytes into a fd's read queue as though a peer had written them
    /// (used to simulate a child writing its exec-status payload).
    pub fn deliver(&self, fd: RawFd, bytes: &[u8]) {
        self.state
            .borrow_mut()
            .open_fds
            .entry(fd)
            .or_default()
            .extend_from_slice(bytes);
    }

    fn alloc_fd(&self) -> RawFd {
        let mut state = self.state.borrow_mut();
        let fd = state.next_fd;
        state.next_fd += 1;
        state.open_fds.insert(fd, Vec::new());
        fd
    }
}

impl Syscalls for FakeSyscalls {
    fn pipe2_cloexec(&self) -> io::Result<(RawFd, RawFd)> {
        if self.state.borrow().pipe_should_fail {
            return Err(io::Error::from_raw_os_error(libc::EMFILE));
        }
        Ok((self.alloc_fd(), self.alloc_fd()))
    }

    fn socketpair_cloexec(&self) -> io::Result<(RawFd, RawFd)> {
        Ok((self.alloc_fd(), self.alloc_fd()))
    }

    fn close(&self, fd: RawFd) {
        let mut state = self.state.borrow_mut();
        state.open_fds.remove(&fd);
        state.closed_fds.push(fd);
    }

    fn read(&self, fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.state.borrow_mut();
        match state.open_fds.get_mut(&fd) {
            Some(queue) => {
                let n = queue.len().min(buf.len());
                buf[..n].copy_from_slice(&queue[..n]);
                queue.drain(..n);
                Ok(n)
            }
            None => Ok(0),
        }
    }

    fn write(&self, fd: RawFd, buf: &[u8]) -> io::Result<usize> {
        self.deliver(fd, buf);
        Ok(buf.len())
    }

    fn fork(&self) -> io::Result<ForkOutcome> {
        let mut state = self.state.borrow_mut();
        if state.fork_should_fail {
            return Err(io::Error::from_raw_os_error(libc::EAGAIN));
        }
        let pid = state.next_pid;
        state.next_pid += 1;
        Ok(ForkOutcome::Parent(pid))
    }

    fn kill(&self, pid: Pid, signal: i32) -> io::Result<()> {
        self.state.borrow_mut().kills.push((pid, signal));
        Ok(())
    }

    fn getpgid(&self, pid: Pid) -> io::Result<Pid> {
        match self.state.borrow().pgids.get(&pid) {
            Some(&pgid) => Ok(pgid),
            None => Err(io::Error::from_raw_os_error(libc::EPERM)),
        }
    }

    fn process_alive(&self, pid: Pid) -> bool {
        *self.state.borrow().alive_pids.get(&pid).unwrap_or(&false)
    }
}
