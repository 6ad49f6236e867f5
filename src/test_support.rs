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

//! In-memory `EventLoop`/`ServiceSet` doubles shared by the unit tests in
//! `launch` and `service`. Not a reimplementation of a real poll loop: just
//! enough bookkeeping for tests to assert on watches, timers and events
//! without needing epoll or a thread.

use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::time::Duration;

use crate::event_loop::{EventLoop, MonotonicTime, ServiceEvent, ServiceSet, TimerHandle, WatchHandle};
use crate::sys::Pid;

#[derive(Debug, Clone)]
struct FdWatch {
    fd: RawFd,
    priority: i32,
    enabled: bool,
}

#[derive(Default)]
pub struct FakeEventLoop {
    next_handle: u64,
    fd_watches: HashMap<WatchHandle, FdWatch>,
    child_reapers: HashMap<WatchHandle, Pid>,
    timers: HashMap<TimerHandle, Duration>,
    now: MonotonicTime,
}

impl FakeEventLoop {
    pub fn new() -> Self {
        FakeEventLoop::default()
    }

    fn alloc_handle(&mut self) -> WatchHandle {
        let h = WatchHandle(self.next_handle);
        self.next_handle += 1;
        h
    }

    pub fn fd_watches(&self) -> Vec<WatchHandle> {
        self.fd_watches.keys().copied().collect()
    }

    pub fn child_reapers(&self) -> Vec<WatchHandle> {
        self.child_reapers.keys().copied().collect()
    }

    pub fn is_watch_enabled(&self, handle: WatchHandle) -> bool {
        self.fd_watches.get(&handle).map(|w| w.enabled).unwrap_or(false)
    }

    pub fn watch_fd(&self, handle: WatchHandle) -> Option<RawFd> {
        self.fd_watches.get(&handle).map(|w| w.fd)
    }

    pub fn armed_timers(&self) -> Vec<(TimerHandle, Duration)> {
        self.timers.iter().map(|(h, d)| (*h, *d)).collect()
    }

    /// Advances the fake clock; used to drive timer-expiry scenarios.
    pub fn advance(&mut self, by: Duration) {
        self.now = self.now + by;
    }

    pub fn set_now(&mut self, at: MonotonicTime) {
        self.now = at;
    }
}

impl EventLoop for FakeEventLoop {
    fn register_fd_watch(&mut self, fd: RawFd, priority: i32, enabled: bool) -> WatchHandle {
        let handle = self.alloc_handle();
        self.fd_watches.insert(handle, FdWatch { fd, priority, enabled });
        handle
    }

    fn set_watch_enabled(&mut self, handle: WatchHandle, enabled: bool) {
        if let Some(w) = self.fd_watches.get_mut(&handle) {
            w.enabled = enabled;
        }
    }

    fn deregister_fd_watch(&mut self, handle: WatchHandle) {
        self.fd_watches.remove(&handle);
    }

    fn register_child_reaper(&mut self, pid: Pid) -> WatchHandle {
        let handle = self.alloc_handle();
        self.child_reapers.insert(handle, pid);
        handle
    }

    fn deregister_child_reaper(&mut self, handle: WatchHandle) {
        self.child_reapers.remove(&handle);
    }

    fn arm_timer_rel(&mut self, timer: TimerHandle, relative: Duration) {
        self.timers.insert(timer, relative);
    }

    fn stop_timer(&mut self, timer: TimerHandle) {
        self.timers.remove(&timer);
    }

    fn now(&self) -> MonotonicTime {
        self.now
    }
}

#[derive(Default)]
pub struct FakeServiceSet {
    events: Vec<(String, ServiceEvent)>,
    deps_started: HashMap<String, bool>,
    process_queues_calls: u32,
}

impl FakeServiceSet {
    pub fn new() -> Self {
        FakeServiceSet::default()
    }

    pub fn events(&self) -> &[(String, ServiceEvent)] {
        &self.events
    }

    pub fn set_deps_started(&mut self, name: &str, started: bool) {
        self.deps_started.insert(name.to_string(), started);
    }

    pub fn process_queues_calls(&self) -> u32 {
        self.process_queues_calls
    }
}

impl ServiceSet for FakeServiceSet {
    fn service_event(&mut self, service_name: &str, event: ServiceEvent) {
        self.events.push((service_name.to_string(), event));
    }

    fn process_queues(&mut self) {
        self.process_queues_calls += 1;
    }

    fn check_deps_started(&self, service_name: &str) -> bool {
        *self.deps_started.get(service_name).unwrap_or(&true)
    }
}
