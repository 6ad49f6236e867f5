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

//! A thin, immutable wrapper over a POSIX wait status.

use std::os::unix::process::ExitStatusExt;
use std::process;

#[derive(Copy, Clone, Debug)]
pub struct ExitStatus(process::ExitStatus);

impl ExitStatus {
    pub fn from_raw(status: i32) -> Self {
        ExitStatus(process::ExitStatus::from_raw(status))
    }

    pub fn did_exit(&self) -> bool {
        self.0.code().is_some()
    }

    /// True iff the wait status compares equal to zero: exit code 0, no
    /// signal.
    pub fn did_exit_clean(&self) -> bool {
        self.0.success()
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.0.code()
    }

    pub fn was_signalled(&self) -> bool {
        self.0.signal().is_some()
    }

    pub fn term_signal(&self) -> Option<i32> {
        self.0.signal()
    }

    pub fn as_int(&self) -> i32 {
        self.0.into_raw()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_exit_is_clean() {
        let status = ExitStatus::from_raw(0);
        assert!(status.did_exit());
        assert!(status.did_exit_clean());
        assert_eq!(status.exit_code(), Some(0));
        assert!(!status.was_signalled());
    }

    #[test]
    fn nonzero_exit_is_not_clean() {
        // glibc wait-status encoding: exit code in bits 8..15.
        let status = ExitStatus::from_raw(1 << 8);
        assert!(status.did_exit());
        assert!(!status.did_exit_clean());
        assert_eq!(status.exit_code(), Some(1));
    }

    #[test]
    fn signalled_process_reports_term_signal() {
        let status = ExitStatus::from_raw(libc::SIGKILL);
        assert!(!status.did_exit());
        assert!(status.was_signalled());
        assert_eq!(status.term_signal(), Some(libc::SIGKILL));
    }
}
