//! Escalating shutdown of long-running examples.
//!
//! Examples tagged with `interrupt` are servers, watchers and other programs
//! that never exit on their own. After the configured delay the engine asks
//! them to stop with increasing severity (interrupt, hangup, terminate, kill),
//! checking after each request whether the process is gone.

use std::io;
use std::time::{Duration, Instant};

/// Severity of a stop request, mildest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopSignal {
    Interrupt,
    Hangup,
    Terminate,
    Kill,
}

impl StopSignal {
    #[cfg(unix)]
    fn as_raw(self) -> libc::c_int {
        match self {
            StopSignal::Interrupt => libc::SIGINT,
            StopSignal::Hangup => libc::SIGHUP,
            StopSignal::Terminate => libc::SIGTERM,
            StopSignal::Kill => libc::SIGKILL,
        }
    }
}

/// Something that can be asked to stop and observed for exit.
pub trait Stoppable {
    /// Delivers a stop request. An error means the request could not be sent.
    fn request_stop(&mut self, signal: StopSignal) -> io::Result<()>;

    /// Returns `true` once the target has exited.
    fn has_exited(&mut self) -> io::Result<bool>;
}

/// How a [`StopPolicy::stop`] call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// The target was gone before any request was delivered.
    AlreadyExited,
    /// The target exited after this request.
    Stopped(StopSignal),
    /// Every request was tried and the target is still running.
    Unresponsive,
}

impl StopOutcome {
    /// Whether the exit was caused by one of our requests.
    pub fn was_induced(&self) -> bool {
        matches!(self, StopOutcome::Stopped(_))
    }
}

/// The escalation sequence and how long to wait for each step.
#[derive(Debug, Clone)]
pub struct StopPolicy {
    pub escalation: Vec<StopSignal>,
    /// Time allowed after each request before escalating.
    pub grace: Duration,
    pub poll_interval: Duration,
}

impl Default for StopPolicy {
    fn default() -> Self {
        Self {
            escalation: vec![
                StopSignal::Interrupt,
                StopSignal::Hangup,
                StopSignal::Terminate,
                StopSignal::Kill,
            ],
            grace: Duration::from_millis(500),
            poll_interval: Duration::from_millis(25),
        }
    }
}

impl StopPolicy {
    /// Walks the escalation list until the target is confirmed dead.
    ///
    /// The number of attempts is bounded by the length of the list; a request
    /// that cannot be delivered is logged and the next severity is tried.
    pub async fn stop<S: Stoppable>(&self, target: &mut S) -> io::Result<StopOutcome> {
        let mut last_delivered = None;

        for &signal in &self.escalation {
            if target.has_exited()? {
                return Ok(last_delivered.map_or(StopOutcome::AlreadyExited, StopOutcome::Stopped));
            }

            log::debug!("Attempting stop signal {:?}", signal);
            if let Err(err) = target.request_stop(signal) {
                log::debug!("Stop signal {:?} returned error: {}", signal, err);
                tokio::time::sleep(self.grace).await;
                continue;
            }
            last_delivered = Some(signal);

            if self.wait_for_exit(target).await? {
                log::debug!("Process exited after {:?}", signal);
                return Ok(StopOutcome::Stopped(signal));
            }
        }

        if target.has_exited()? {
            return Ok(last_delivered.map_or(StopOutcome::AlreadyExited, StopOutcome::Stopped));
        }
        Ok(StopOutcome::Unresponsive)
    }

    async fn wait_for_exit<S: Stoppable>(&self, target: &mut S) -> io::Result<bool> {
        let deadline = Instant::now() + self.grace;
        loop {
            if target.has_exited()? {
                return Ok(true);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(false);
            }
            tokio::time::sleep(remaining.min(self.poll_interval)).await;
        }
    }
}

impl Stoppable for tokio::process::Child {
    #[cfg(unix)]
    fn request_stop(&mut self, signal: StopSignal) -> io::Result<()> {
        if signal == StopSignal::Kill {
            return self.start_kill();
        }
        let pid = self
            .id()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "process already reaped"))?;
        // SAFETY: `kill` takes plain integers and touches no memory of ours.
        // `id()` only yields a pid while the child is unreaped, so the pid
        // cannot have been recycled for an unrelated process.
        let ret = unsafe { libc::kill(pid as libc::pid_t, signal.as_raw()) };
        if ret == -1 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }

    #[cfg(not(unix))]
    fn request_stop(&mut self, signal: StopSignal) -> io::Result<()> {
        match signal {
            StopSignal::Kill => self.start_kill(),
            other => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                format!("{:?} is not supported on this platform", other),
            )),
        }
    }

    fn has_exited(&mut self) -> io::Result<bool> {
        Ok(self.try_wait()?.is_some())
    }
}
