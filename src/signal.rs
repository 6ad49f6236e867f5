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

use std::fmt;
use std::io;

use crate::sys::{Pid, Syscalls};

#[allow(non_camel_case_types)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Signal {
    HUP,
    INT,
    QUIT,
    TERM,
    KILL,
    USR1,
    USR2,
}

impl Signal {
    fn raw(self) -> i32 {
        match self {
            Signal::HUP => libc::SIGHUP,
            Signal::INT => libc::SIGINT,
            Signal::QUIT => libc::SIGQUIT,
            Signal::TERM => libc::SIGTERM,
            Signal::KILL => libc::SIGKILL,
            Signal::USR1 => libc::SIGUSR1,
            Signal::USR2 => libc::SIGUSR2,
        }
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match *self {
            Signal::HUP => "HUP",
            Signal::INT => "INT",
            Signal::QUIT => "QUIT",
            Signal::TERM => "TERM",
            Signal::KILL => "KILL",
            Signal::USR1 => "USR1",
            Signal::USR2 => "USR2",
        };
        write!(f, "{}", s)
    }
}

/// Deliver `signal` to a running child, per the service's process-group
/// policy.
///
/// If `signal_process_only` is set, the signal goes straight to `pid`.
/// Otherwise we target the negated process group id, so that a service
/// which has double-forked into its own session still has its whole
/// subtree reached. Some OSes deny `getpgid` across a session boundary;
/// when that happens we fall back to treating `pid` as its own pgid, since
/// a session leader is by definition a process group leader too.
pub fn kill_pg(sys: &dyn Syscalls, pid: Pid, signal: Signal, signal_process_only: bool) -> io::Result<()> {
    if pid <= 0 {
        return Err(io::Error::from_raw_os_error(libc::ESRCH));
    }
    if signal_process_only {
        return sys.kill(pid, signal.raw());
    }
    let pgid = sys.getpgid(pid).unwrap_or(pid);
    sys.kill(-pgid, signal.raw())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sys::fake::FakeSyscalls;

    #[test]
    fn signal_process_only_targets_pid_directly() {
        let sys = FakeSyscalls::new();
        kill_pg(&sys, 42, Signal::INT, true).unwrap();
        assert_eq!(sys.kills(), vec![(42, libc::SIGINT)]);
    }

    #[test]
    fn default_policy_targets_negated_process_group() {
        let sys = FakeSyscalls::new();
        sys.set_pgid(42, 42);
        kill_pg(&sys, 42, Signal::TERM, false).unwrap();
        assert_eq!(sys.kills(), vec![(-42, libc::SIGTERM)]);
    }

    #[test]
    fn denied_getpgid_falls_back_to_pid_as_pgid() {
        let sys = FakeSyscalls::new();
        // No pgid registered -> getpgid fails -> fall back to pid itself.
        kill_pg(&sys, 7, Signal::KILL, false).unwrap();
        assert_eq!(sys.kills(), vec![(-7, libc::SIGKILL)]);
    }

    #[test]
    fn refuses_to_signal_nonpositive_pid() {
        let sys = FakeSyscalls::new();
        assert!(kill_pg(&sys, 0, Signal::TERM, true).is_err());
        assert!(sys.kills().is_empty());
    }
}
