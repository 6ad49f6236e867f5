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

//! Restart-rate limiting and inter-restart delay: decides *whether* and
//! *when* a terminated service should be relaunched. The mechanical act of
//! relaunching (calling the launch routine, notifying the service set)
//! stays with `ProcessService::do_restart`; this module only holds the
//! moving-window bookkeeping.

use std::time::Duration;

use crate::event_loop::MonotonicTime;

#[derive(Copy, Clone, Debug)]
pub struct RestartPolicy {
    pub restart_interval: Duration,
    pub max_restart_interval_count: u32,
    pub restart_delay: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        RestartPolicy {
            restart_interval: Duration::from_secs(10),
            max_restart_interval_count: 3,
            restart_delay: Duration::from_millis(200),
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RestartDecision {
    /// The service is restarting too quickly within the current window.
    Denied,
    /// Enough time has passed since the last start; relaunch now.
    RestartNow,
    /// Not enough time has passed; arm the shared timer for this long.
    WaitFor(Duration),
}

#[derive(Debug)]
pub struct RestartGovernor {
    policy: RestartPolicy,
    interval_time: MonotonicTime,
    interval_count: u32,
}

impl RestartGovernor {
    pub fn new(policy: RestartPolicy) -> Self {
        RestartGovernor {
            policy,
            interval_time: MonotonicTime::ZERO,
            interval_count: 0,
        }
    }

    pub fn policy(&self) -> &RestartPolicy {
        &self.policy
    }

    pub fn interval_count(&self) -> u32 {
        self.interval_count
    }

    /// Reset the rate-limit window to start at `at`. Called whenever a
    /// service is brought up "fresh" (not as a recovery from a crash).
    pub fn reset_window(&mut self, at: MonotonicTime) {
        self.interval_time = at;
        self.interval_count = 0;
    }

    /// Record that a restart attempt (successful or not) was made.
    pub fn note_restart_attempt(&mut self) {
        self.interval_count += 1;
    }

    /// Evaluate whether a restart may proceed now, must wait, or is denied
    /// by the rate limiter. Rolls the rate-limit window forward as a side
    /// effect when it has elapsed.
    pub fn evaluate(&mut self, now: MonotonicTime, last_start_time: MonotonicTime) -> RestartDecision {
        if self.policy.max_restart_interval_count != 0 {
            let int_diff = now.saturating_duration_since(self.interval_time);
            if int_diff < self.policy.restart_interval {
                if self.interval_count >= self.policy.max_restart_interval_count {
                    return RestartDecision::Denied;
                }
            } else {
                self.interval_time = now;
                self.interval_count = 0;
            }
        }

        let since_last_start = now.saturating_duration_since(last_start_time);
        if self.policy.restart_delay <= since_last_start {
            RestartDecision::RestartNow
        } else {
            RestartDecision::WaitFor(self.policy.restart_delay - since_last_start)
        }
    }
}
