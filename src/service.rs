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

//! The per-service state machine: the object a service set drives through
//! start/stop, and which the event loop drives through child-exit,
//! exec-status, readiness and timer callbacks.

use std::ffi::CString;
use std::io;
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};
use std::time::Duration;

use ansi_term::Colour;
use log::{error, warn};

use crate::activation_socket;
use crate::error::Result;
use crate::event_loop::{EventLoop, ServiceEvent, ServiceSet, TimerHandle, WatchHandle};
use crate::exit_status::ExitStatus;
use crate::governor::{RestartDecision, RestartGovernor, RestartPolicy};
use crate::launch::{self, ExecStatusFailure, LaunchRequest, NotifyConfig, ResourceLimit, EXEC_STATUS_RECORD_LEN};
use crate::signal::{self, Signal};
use crate::sys::{Pid, Syscalls};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ServiceState {
    Stopped,
    Starting,
    Started,
    Stopping,
}

#[derive(Clone, Debug)]
pub enum ServiceType {
    Process,
    /// `pid_file` is polled (via the shared start-timeout timer, see
    /// `timer_expired`) for the pid of the daemonized process once the
    /// immediately-forked helper has exec'd.
    Bgprocess { pid_file: PathBuf },
    Scripted { stop_argv: Vec<CString> },
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum StoppedReason {
    Normal,
    Depfailed,
    Failed,
    Execfailed,
    Timedout,
    Terminated,
}

#[derive(Clone, Debug)]
pub struct ActivationSocketConfig {
    pub path: PathBuf,
    pub owner: Option<(u32, u32)>,
    pub mode: Option<u32>,
}

#[derive(Clone, Debug)]
pub struct ServiceConfig {
    pub argv: Vec<CString>,
    pub working_dir: Option<PathBuf>,
    pub env_file: Option<PathBuf>,
    pub log_file: Option<PathBuf>,
    pub run_as: Option<(u32, u32)>,
    pub rlimits: Vec<ResourceLimit>,
    pub activation_socket: Option<ActivationSocketConfig>,
    pub notify: NotifyConfig,
    pub on_console: bool,
    pub shares_console: bool,
    pub signal_process_only: bool,
    pub pass_control_socket_fd: bool,
    pub start_timeout: Option<Duration>,
    pub stop_timeout: Option<Duration>,
    pub restart_policy: RestartPolicy,
    pub auto_restart: bool,
}

/// The per-service object: declared configuration plus all mutable
/// bookkeeping the state machine needs between suspension points.
pub struct ProcessService {
    name: String,
    service_type: ServiceType,
    config: ServiceConfig,
    timer: TimerHandle,

    state: ServiceState,
    pid: Option<Pid>,
    last_start_time: crate::event_loop::MonotonicTime,
    governor: RestartGovernor,

    restarting: bool,
    waiting_for_deps: bool,
    waiting_restart_timer: bool,
    /// Armed for either the start timeout or the stop timeout; at most one
    /// of this and `waiting_restart_timer` is ever true (invariant I3 --
    /// both share the one per-service timer resource named `timer` above).
    stop_timer_armed: bool,
    waiting_for_execstat: bool,
    reserved_child_watch: bool,
    tracking_child: bool,
    have_console: bool,

    exec_confirmed: bool,
    readiness_required: bool,
    readiness_received: bool,
    /// For BGPROCESS only: whether the pid file has been polled and
    /// resolved to a live daemon pid. Gates promotion to STARTED (see
    /// `try_promote_to_started`) so a daemonizing helper's successful exec
    /// is not mistaken for the daemon itself being up.
    bg_confirmed: bool,

    stop_reason: StoppedReason,

    activation_fd: Option<RawFd>,
    exec_status_fd: Option<RawFd>,
    exec_status_watch: Option<WatchHandle>,
    child_reaper: Option<WatchHandle>,
    notify_fd: Option<RawFd>,
    ready_watch: Option<WatchHandle>,
    control_fd: Option<RawFd>,
}

impl ProcessService {
    pub fn new(name: impl Into<String>, service_type: ServiceType, config: ServiceConfig, timer: TimerHandle) -> Self {
        let policy = config.restart_policy;
        ProcessService {
            name: name.into(),
            service_type,
            config,
            timer,
            state: ServiceState::Stopped,
            pid: None,
            last_start_time: crate::event_loop::MonotonicTime::ZERO,
            governor: RestartGovernor::new(policy),
            restarting: false,
            waiting_for_deps: false,
            waiting_restart_timer: false,
            stop_timer_armed: false,
            waiting_for_execstat: false,
            reserved_child_watch: false,
            tracking_child: false,
            have_console: false,
            exec_confirmed: false,
            readiness_required: false,
            readiness_received: false,
            bg_confirmed: false,
            stop_reason: StoppedReason::Normal,
            activation_fd: None,
            exec_status_fd: None,
            exec_status_watch: None,
            child_reaper: None,
            notify_fd: None,
            ready_watch: None,
            control_fd: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ServiceState {
        self.state
    }

    pub fn pid(&self) -> Option<Pid> {
        self.pid
    }

    pub fn stop_reason(&self) -> StoppedReason {
        self.stop_reason
    }

    pub fn restart_interval_count(&self) -> u32 {
        self.governor.interval_count()
    }

    /// Whether this service currently holds the console (only one
    /// console-using service may hold it at a time; the service set
    /// arbitrates handoff and informs us here).
    pub fn have_console(&self) -> bool {
        self.have_console
    }

    pub fn set_have_console(&mut self, have_console: bool) {
        self.have_console = have_console;
    }

    /// Whether a child is currently being tracked (a launch succeeded and
    /// its exit has not yet been reaped).
    pub fn tracking_child(&self) -> bool {
        self.tracking_child
    }

    /// For BGPROCESS services: adopt the daemonized pid discovered by a
    /// pid-file poll, replacing the immediate fork pid. Called by
    /// `check_process` on success; exposed so an external caller that has
    /// its own copy of a just-confirmed pid can record it directly.
    pub fn adopt_pid(&mut self, pid: Pid) {
        self.pid = Some(pid);
    }

    /// For BGPROCESS services: read `pid_file` and adopt the pid found
    /// there if the process it names is alive. A missing or unreadable pid
    /// file is treated as "not yet up" rather than as an error -- the
    /// daemon may simply not have written it yet.
    ///
    /// Before `bg_confirmed` is latched, this always re-reads the pid file
    /// rather than trusting `self.pid`, since `self.pid` may still hold the
    /// transient pid of the immediately-forked helper that is daemonizing
    /// (not yet the pid named by the file). Once confirmed, subsequent
    /// calls become a cheap liveness check of the adopted pid.
    pub fn check_process(&mut self, sys: &dyn Syscalls, pid_file: &Path) -> bool {
        if self.bg_confirmed {
            if let Some(pid) = self.pid {
                return sys.process_alive(pid);
            }
        }
        match std::fs::read_to_string(pid_file) {
            Ok(contents) => match contents.trim().parse::<Pid>() {
                Ok(pid) if sys.process_alive(pid) => {
                    self.adopt_pid(pid);
                    true
                }
                Ok(_) => false,
                Err(_) => {
                    warn!("{}", crate::error::Error::PidFileCorrupt(pid_file.to_path_buf()));
                    false
                }
            },
            Err(_) => false,
        }
    }

    /// The pid-file path for a BGPROCESS service, if this is one.
    fn bg_pid_file(&self) -> Option<PathBuf> {
        match &self.service_type {
            ServiceType::Bgprocess { pid_file } => Some(pid_file.clone()),
            _ => None,
        }
    }

    /// Polls the BGPROCESS pid file (a no-op, returning `false`, for any
    /// other service type) and latches `bg_confirmed` on success.
    fn poll_bgprocess(&mut self, sys: &dyn Syscalls) -> bool {
        match self.bg_pid_file() {
            Some(pid_file) if self.check_process(sys, &pid_file) => {
                self.bg_confirmed = true;
                true
            }
            _ => false,
        }
    }

    fn set_state(&mut self, state: ServiceState) {
        self.state = state;
    }

    fn disarm_timer(&mut self, event_loop: &mut dyn EventLoop) {
        if self.stop_timer_armed || self.waiting_restart_timer {
            event_loop.stop_timer(self.timer);
            self.stop_timer_armed = false;
            self.waiting_restart_timer = false;
        }
    }

    fn needs_start_timeout(&self) -> bool {
        !matches!(self.service_type, ServiceType::Process)
    }

    fn launch_request(&self) -> LaunchRequest {
        LaunchRequest {
            argv: self.config.argv.clone(),
            working_dir: self.config.working_dir.clone(),
            env_file: self.config.env_file.clone(),
            log_file: self.config.log_file.clone(),
            run_as: self.config.run_as,
            rlimits: self.config.rlimits.clone(),
            pass_control_socket_fd: self.config.pass_control_socket_fd,
            notify: self.config.notify.clone(),
            activation_socket_fd: self.activation_fd,
            on_console: self.config.on_console || self.config.shares_console || self.have_console,
            in_foreground: !self.config.shares_console,
        }
    }

    fn launch(&mut self, sys: &dyn Syscalls, event_loop: &mut dyn EventLoop) -> Result<()> {
        let req = self.launch_request();
        let outcome = launch::start_ps_process(sys, event_loop, &req)?;
        self.adopt_launch_outcome(outcome);
        self.readiness_required = self.config.notify.is_configured();
        self.readiness_received = false;
        Ok(())
    }

    /// Records the fds/handles a successful `launch::start_ps_process` call
    /// returned, shared by the main launch path and (for SCRIPTED services)
    /// the separate stop-command launch in `bring_down`.
    fn adopt_launch_outcome(&mut self, outcome: launch::LaunchOutcome) {
        self.pid = Some(outcome.pid);
        self.exec_status_fd = Some(outcome.exec_status_fd);
        self.exec_status_watch = Some(outcome.exec_status_watch);
        self.child_reaper = Some(outcome.child_reaper);
        self.control_fd = outcome.control_conn_fd;
        self.notify_fd = outcome.notify_fd;
        self.ready_watch = outcome.ready_watch;

        self.reserved_child_watch = true;
        self.tracking_child = true;
        self.waiting_for_execstat = true;
        self.exec_confirmed = false;
        self.bg_confirmed = false;
    }

    /// Drives STOPPED/STARTING-pending-restart -> STARTING. The caller
    /// (service set) is responsible for having already set the visible
    /// state to STARTING before invoking this.
    pub fn bring_up(&mut self, sys: &dyn Syscalls, event_loop: &mut dyn EventLoop, services: &mut dyn ServiceSet) -> bool {
        if self.restarting {
            if self.pid.is_none() {
                return self.restart_ps_process(sys, event_loop, services);
            }
            return true;
        }

        if let Some(sock_cfg) = self.config.activation_socket.clone() {
            if self.activation_fd.is_none() {
                match activation_socket::open_socket(&sock_cfg.path, sock_cfg.owner, sock_cfg.mode) {
                    Ok(fd) => self.activation_fd = Some(fd),
                    Err(e) => {
                        error!("{}: {}", self.name, e);
                        return false;
                    }
                }
            }
        }

        self.governor.reset_window(event_loop.now());
        self.last_start_time = event_loop.now();

        match self.launch(sys, event_loop) {
            Ok(()) => {
                if self.needs_start_timeout() {
                    if let Some(timeout) = self.config.start_timeout {
                        event_loop.arm_timer_rel(self.timer, timeout);
                        self.stop_timer_armed = true;
                    }
                } else if self.stop_timer_armed {
                    event_loop.stop_timer(self.timer);
                    self.stop_timer_armed = false;
                }
                true
            }
            Err(e) => {
                warn!("{}: {}", self.name, e);
                false
            }
        }
    }

    fn try_promote_to_started(&mut self, event_loop: &mut dyn EventLoop, services: &mut dyn ServiceSet) {
        let bg_ready = !matches!(self.service_type, ServiceType::Bgprocess { .. }) || self.bg_confirmed;
        if self.state == ServiceState::Starting
            && self.exec_confirmed
            && bg_ready
            && (!self.readiness_required || self.readiness_received)
        {
            if self.stop_timer_armed {
                event_loop.stop_timer(self.timer);
                self.stop_timer_armed = false;
            }
            self.set_state(ServiceState::Started);
            services.service_event(&self.name, ServiceEvent::Started);
        }
    }

    /// The exec-status watcher fired: either EOF (exec succeeded) or a
    /// phase+errno failure record.
    pub fn handle_exec_status_readable(&mut self, sys: &dyn Syscalls, event_loop: &mut dyn EventLoop, services: &mut dyn ServiceSet) {
        let fd = match self.exec_status_fd {
            Some(fd) => fd,
            None => return,
        };
        let mut buf = [0u8; EXEC_STATUS_RECORD_LEN];
        let n = match sys.read(fd, &mut buf) {
            Ok(n) => n,
            Err(e) => {
                warn!("{}: error reading exec-status pipe: {}", self.name, e);
                self.waiting_for_execstat = false;
                self.stop_reason = StoppedReason::Execfailed;
                return;
            }
        };

        self.waiting_for_execstat = false;

        if n == 0 {
            self.exec_confirmed = true;
            if let Some(w) = self.ready_watch {
                event_loop.set_watch_enabled(w, true);
            }
            self.poll_bgprocess(sys);
            self.try_promote_to_started(event_loop, services);
        } else if let Some(failure) = ExecStatusFailure::decode(&buf[..n]) {
            self.stop_reason = StoppedReason::Execfailed;
            warn!(
                "{}: exec failed in phase {:?}: {}",
                self.name,
                failure.phase,
                io::Error::from_raw_os_error(failure.errno)
            );
        }
    }

    /// The readiness watcher fired: the child wrote to or closed the
    /// notification pipe.
    pub fn handle_readiness(&mut self, event_loop: &mut dyn EventLoop, services: &mut dyn ServiceSet) {
        self.readiness_received = true;
        if let Some(w) = self.ready_watch {
            event_loop.set_watch_enabled(w, false);
        }
        self.try_promote_to_started(event_loop, services);
    }

    /// The event loop's child-reaper observed `pid`'s exit.
    pub fn handle_child_exit(&mut self, sys: &dyn Syscalls, event_loop: &mut dyn EventLoop, services: &mut dyn ServiceSet, exit_status: ExitStatus) {
        self.pid = None;
        self.reserved_child_watch = false;
        self.tracking_child = false;
        if let Some(h) = self.child_reaper.take() {
            event_loop.deregister_child_reaper(h);
        }
        if let Some(h) = self.exec_status_watch.take() {
            event_loop.deregister_fd_watch(h);
        }
        if let Some(fd) = self.exec_status_fd.take() {
            sys.close(fd);
        }
        if let Some(h) = self.ready_watch.take() {
            event_loop.deregister_fd_watch(h);
        }
        if let Some(fd) = self.notify_fd.take() {
            sys.close(fd);
        }
        if let Some(fd) = self.control_fd.take() {
            sys.close(fd);
        }

        match self.state {
            ServiceState::Stopping => {
                self.disarm_timer(event_loop);
                self.set_state(ServiceState::Stopped);
                services.service_event(&self.name, ServiceEvent::Stopped);
            }
            ServiceState::Starting => {
                // The immediately-forked BGPROCESS helper double-forks and
                // exits cleanly once it has handed off to the daemonized
                // process; a clean exit here is not itself a failure until
                // the pid file fails to confirm a live daemon.
                if self.bg_pid_file().is_some() && exit_status.did_exit_clean() && self.poll_bgprocess(sys) {
                    self.try_promote_to_started(event_loop, services);
                } else {
                    if self.stop_reason != StoppedReason::Execfailed {
                        self.stop_reason = StoppedReason::Failed;
                    }
                    self.failed_to_start(event_loop, services);
                }
            }
            ServiceState::Started if self.config.auto_restart => {
                self.stop_reason = StoppedReason::Terminated;
                self.do_smooth_recovery(sys, event_loop, services);
            }
            _ => {
                self.disarm_timer(event_loop);
                if matches!(self.stop_reason, StoppedReason::Normal) && !exit_status.did_exit_clean() {
                    self.stop_reason = StoppedReason::Terminated;
                }
                self.set_state(ServiceState::Stopped);
                services.service_event(&self.name, ServiceEvent::Stopped);
            }
        }
        services.process_queues();
    }

    /// Reports a start failure to the service set. If no child is currently
    /// outstanding (pid already cleared) the transition to STOPPED happens
    /// immediately; otherwise state remains STOPPING until the eventual
    /// `handle_child_exit` reaps the process we just asked to die, so
    /// invariant I2 (STOPPED implies pid = None) is never violated.
    fn failed_to_start(&mut self, event_loop: &mut dyn EventLoop, services: &mut dyn ServiceSet) {
        self.restarting = false;
        services.service_event(&self.name, ServiceEvent::FailedStart);
        if self.pid.is_none() {
            self.disarm_timer(event_loop);
            self.set_state(ServiceState::Stopped);
        }
    }

    fn unrecoverable_stop(&mut self, event_loop: &mut dyn EventLoop, services: &mut dyn ServiceSet) {
        self.restarting = false;
        self.disarm_timer(event_loop);
        self.set_state(ServiceState::Stopped);
        services.service_event(&self.name, ServiceEvent::Stopped);
    }

    fn do_smooth_recovery(&mut self, sys: &dyn Syscalls, event_loop: &mut dyn EventLoop, services: &mut dyn ServiceSet) {
        if !self.restart_ps_process(sys, event_loop, services) {
            self.unrecoverable_stop(event_loop, services);
            services.process_queues();
        }
    }

    /// Consults the governor: restart immediately, arm the restart-delay
    /// timer, or deny (rate limit exceeded).
    fn restart_ps_process(&mut self, sys: &dyn Syscalls, event_loop: &mut dyn EventLoop, services: &mut dyn ServiceSet) -> bool {
        self.restarting = true;
        let now = event_loop.now();
        match self.governor.evaluate(now, self.last_start_time) {
            RestartDecision::Denied => {
                self.restarting = false;
                let msg = format!("Service {} restarting too quickly; stopping.", self.name);
                error!("{}", Colour::Red.bold().paint(msg));
                false
            }
            RestartDecision::RestartNow => {
                self.do_restart(sys, event_loop, services);
                true
            }
            RestartDecision::WaitFor(delay) => {
                event_loop.arm_timer_rel(self.timer, delay);
                self.waiting_restart_timer = true;
                true
            }
        }
    }

    /// Called back by the service set once a dependency this service was
    /// waiting on (see `do_restart`'s deps check) has started. A no-op if
    /// this service was not actually waiting.
    pub fn dependencies_ready(&mut self, sys: &dyn Syscalls, event_loop: &mut dyn EventLoop, services: &mut dyn ServiceSet) {
        if !self.waiting_for_deps {
            return;
        }
        self.waiting_for_deps = false;
        self.do_restart(sys, event_loop, services);
    }

    /// Called back by the service set when a dependency this service was
    /// waiting on (see `dependencies_ready`) has instead failed outright
    /// and will never start. Latches `StoppedReason::Depfailed` and settles
    /// the service at STOPPED rather than leaving it waiting forever.
    pub fn dependencies_failed(&mut self, event_loop: &mut dyn EventLoop, services: &mut dyn ServiceSet) {
        if !self.waiting_for_deps {
            return;
        }
        self.waiting_for_deps = false;
        self.stop_reason = StoppedReason::Depfailed;
        self.restarting = false;
        self.unrecoverable_stop(event_loop, services);
        services.process_queues();
    }

    fn do_restart(&mut self, sys: &dyn Syscalls, event_loop: &mut dyn EventLoop, services: &mut dyn ServiceSet) {
        self.waiting_restart_timer = false;
        self.governor.note_restart_attempt();
        let was_starting = self.state == ServiceState::Starting;

        if was_starting && !services.check_deps_started(&self.name) {
            self.waiting_for_deps = true;
            return;
        }

        self.last_start_time = event_loop.now();
        match self.launch(sys, event_loop) {
            Ok(()) => {
                self.restarting = false;
            }
            Err(e) => {
                warn!("{}: {}", self.name, e);
                self.restarting = false;
                if was_starting {
                    self.failed_to_start(event_loop, services);
                } else {
                    self.unrecoverable_stop(event_loop, services);
                }
                services.process_queues();
            }
        }
    }

    /// Stops a running service, or cancels a start in progress. Returns
    /// `false` to signal the stop is asynchronous (the caller should wait
    /// for a subsequent `service_event`).
    pub fn bring_down(&mut self, sys: &dyn Syscalls, event_loop: &mut dyn EventLoop) -> bool {
        if self.waiting_restart_timer {
            event_loop.stop_timer(self.timer);
            self.waiting_restart_timer = false;
            return false;
        }

        if let Some(pid) = self.pid {
            warn!("Interrupting start of service {} with pid {} (with SIGINT).", self.name, pid);
            if let Err(e) = signal::kill_pg(sys, pid, Signal::INT, self.config.signal_process_only) {
                warn!("{}: failed to signal process group: {}", self.name, e);
            }
        } else if let ServiceType::Scripted { stop_argv } = &self.service_type {
            let stop_argv = stop_argv.clone();
            let mut req = self.launch_request();
            req.argv = stop_argv;
            match launch::start_ps_process(sys, event_loop, &req) {
                Ok(outcome) => self.adopt_launch_outcome(outcome),
                Err(e) => warn!("{}: failed to launch stop command: {}", self.name, e),
            }
        }

        if let Some(timeout) = self.config.stop_timeout {
            event_loop.arm_timer_rel(self.timer, timeout);
            self.stop_timer_armed = true;
        } else if self.stop_timer_armed {
            event_loop.stop_timer(self.timer);
            self.stop_timer_armed = false;
        }

        self.set_state(ServiceState::Stopping);
        false
    }

    fn kill_with_fire(&mut self, sys: &dyn Syscalls) {
        if let Some(pid) = self.pid {
            warn!("Service {} with pid {} exceeded allowed stop time; killing.", self.name, pid);
            if let Err(e) = signal::kill_pg(sys, pid, Signal::KILL, self.config.signal_process_only) {
                warn!("{}: failed to signal process group: {}", self.name, e);
            }
        }
    }

    /// The single demultiplexer for the per-service timer: start, stop and
    /// restart-delay all arm the same underlying resource (invariant I3),
    /// disambiguated here by current state and pid.
    pub fn timer_expired(&mut self, sys: &dyn Syscalls, event_loop: &mut dyn EventLoop, services: &mut dyn ServiceSet) {
        self.stop_timer_armed = false;

        if self.state == ServiceState::Stopping {
            self.kill_with_fire(sys);
        } else if self.state == ServiceState::Starting && self.bg_pid_file().is_some() && self.poll_bgprocess(sys) {
            self.try_promote_to_started(event_loop, services);
        } else if self.pid.is_some() {
            warn!("Service {} exceeded allowed start time; cancelling.", self.name);
            self.bring_down(sys, event_loop);
            self.stop_reason = StoppedReason::Timedout;
            self.failed_to_start(event_loop, services);
        } else {
            self.do_restart(sys, event_loop, services);
        }
    }

    /// Closes the persistent activation socket once the service set
    /// decides this service is no longer needed.
    pub fn becoming_inactive(&mut self) {
        if let (Some(fd), Some(cfg)) = (self.activation_fd.take(), self.config.activation_socket.as_ref()) {
            activation_socket::close_socket(fd, &cfg.path);
        }
    }
}
