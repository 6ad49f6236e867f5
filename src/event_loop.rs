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

//! Abstract collaborators the core consumes but never implements: the
//! event loop (fd watchers, child reaper, timers, clock) and the service
//! set (event notification, dependency queries, queue processing).
//!
//! Generalizes the teacher's concrete `Server`/`ServiceTable` poll loop
//! (`server/mod.rs`) into an explicit seam, per the redesign note against
//! mutable global event-loop and service-set pointers.

use std::ops::{Add, Sub};
use std::os::unix::io::RawFd;
use std::time::Duration;

/// Opaque identifier for a registered fd watch or child-reaper slot.
/// Dispatchers are expected to tolerate a stale handle (the service that
/// owned it may have been destroyed while an event was mid-flight).
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WatchHandle(pub u64);

/// Identifies the single shared per-service timer (start/stop/restart-delay
/// all arm the same underlying resource; see invariant I3).
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct TimerHandle(pub u64);

/// A monotonic instant, expressed as an offset from some fixed (and
/// otherwise unspecified) epoch. Kept as our own newtype rather than
/// `std::time::Instant` so tests can construct and advance it
/// deterministically.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct MonotonicTime(pub Duration);

impl MonotonicTime {
    pub const ZERO: MonotonicTime = MonotonicTime(Duration::from_secs(0));

    pub fn saturating_duration_since(&self, earlier: MonotonicTime) -> Duration {
        self.0.saturating_sub(earlier.0)
    }
}

impl Sub for MonotonicTime {
    type Output = Duration;
    fn sub(self, rhs: MonotonicTime) -> Duration {
        self.0.saturating_sub(rhs.0)
    }
}

impl Add<Duration> for MonotonicTime {
    type Output = MonotonicTime;
    fn add(self, rhs: Duration) -> MonotonicTime {
        MonotonicTime(self.0 + rhs)
    }
}

/// fd-watch priority. Dasynq-style: lower values are serviced first. The
/// exec-status watcher is registered at an elevated (numerically lower)
/// priority than ordinary events, specifically so that a just-reaped
/// child's exit is recorded before any ordinary event gets a chance to
/// signal its (possibly already-recycled) pid.
pub const EXEC_STATUS_PRIORITY: i32 = -10;
pub const DEFAULT_PRIORITY: i32 = 0;

pub trait EventLoop {
    /// Register interest in readability of `fd`. `enabled` controls whether
    /// the watch fires immediately or starts disabled (used for the
    /// readiness pipe, which is armed only once exec has been confirmed).
    fn register_fd_watch(&mut self, fd: RawFd, priority: i32, enabled: bool) -> WatchHandle;

    fn set_watch_enabled(&mut self, handle: WatchHandle, enabled: bool);

    fn deregister_fd_watch(&mut self, handle: WatchHandle);

    /// Register a child-reaper slot for `pid`. Must be registered before
    /// the fork that produces `pid`, so it observes the exit before any
    /// watcher that could signal the (by-then dead) pid.
    fn register_child_reaper(&mut self, pid: crate::sys::Pid) -> WatchHandle;

    fn deregister_child_reaper(&mut self, handle: WatchHandle);

    fn arm_timer_rel(&mut self, timer: TimerHandle, relative: Duration);

    fn stop_timer(&mut self, timer: TimerHandle);

    fn now(&self) -> MonotonicTime;
}

/// Reasons the service set is notified of, mirroring `service_event_t`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ServiceEvent {
    Started,
    Stopped,
    FailedStart,
    StartCancelled,
    StopCancelled,
}

pub trait ServiceSet {
    fn service_event(&mut self, service_name: &str, event: ServiceEvent);

    /// Re-examine queues of services that may have been unblocked by a
    /// transition (e.g. a dependent waiting on this service to start).
    fn process_queues(&mut self);

    /// Are all of this service's dependencies currently started?
    fn check_deps_started(&self, service_name: &str) -> bool;
}
