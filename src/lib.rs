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

//! Per-service process lifecycle engine for a system-service supervisor:
//! the state machine, fork/exec coordination, restart governor and signal
//! delivery that bring a single declared service up and down.
//!
//! This crate deliberately does not own an event loop, a service-set
//! scheduler, or service-definition loading: see [`event_loop`] for the
//! collaborator traits callers must supply.

pub mod activation_socket;
pub mod child_run;
pub mod error;
pub mod event_loop;
pub mod exit_status;
pub mod governor;
pub mod launch;
pub mod service;
pub mod signal;
pub mod sys;

#[cfg(test)]
mod test_support;

pub use error::{Error, Result};
pub use event_loop::{EventLoop, MonotonicTime, ServiceEvent, ServiceSet, TimerHandle, WatchHandle};
pub use exit_status::ExitStatus;
pub use governor::{RestartDecision, RestartGovernor, RestartPolicy};
pub use service::{ActivationSocketConfig, ProcessService, ServiceConfig, ServiceState, ServiceType, StoppedReason};
pub use signal::{kill_pg, Signal};
pub use sys::{ForkOutcome, Pid, Syscalls, UnixSyscalls};
