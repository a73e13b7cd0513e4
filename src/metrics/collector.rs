//! The periodic collection loop and its triggers.
//!
//! Collections happen when the `timerfd` fires, or when something (usually
//! `SIGUSR1`) asks for a flush. A [`Collector`] runs the loop on its own
//! thread.

use std::{
    io,
    os::fd::{AsRawFd, RawFd},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Once,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use crate::metrics::Metrics;

/// How long the collector sleeps before looking at the flush flag again
pub const WAKE_UP_INTERVAL: Duration = Duration::from_millis(250);

static NEEDS_FLUSH: AtomicBool = AtomicBool::new(false);
static INSTALL_SIGNAL_HANDLER: Once = Once::new();

extern "C" fn on_sigusr1(_: libc::c_int) {
    NEEDS_FLUSH.store(true, Ordering::Relaxed);
}

/// Make `SIGUSR1` request a full flush. Only the first call does anything.
pub fn install_flush_signal_handler() {
    INSTALL_SIGNAL_HANDLER.call_once(|| {
        // SAFETY:
        // - A zeroed `sigaction` is a valid starting point
        // - `on_sigusr1` only touches an atomic, so it's async-signal-safe
        unsafe {
            let mut action: libc::sigaction = std::mem::zeroed();
            action.sa_sigaction = on_sigusr1 as extern "C" fn(libc::c_int) as libc::sighandler_t;
            action.sa_flags = libc::SA_RESTART;
            libc::sigemptyset(&mut action.sa_mask);
            if libc::sigaction(libc::SIGUSR1, &action, std::ptr::null_mut()) != 0 {
                log::warn!(
                    "could not install the SIGUSR1 flush handler: {}",
                    io::Error::last_os_error()
                );
            }
        }
    });
}

pub fn flush_requested() -> bool {
    NEEDS_FLUSH.load(Ordering::Relaxed)
}

/// What the signal handler does, for callers that want a flush without one
pub fn request_flush() {
    NEEDS_FLUSH.store(true, Ordering::Relaxed);
}

pub(crate) fn clear_flush_request() {
    NEEDS_FLUSH.store(false, Ordering::Relaxed);
}

/// A non-blocking `CLOCK_MONOTONIC` timerfd, firing every `interval`
#[derive(Debug)]
pub struct TimerFd {
    fd: RawFd,
}

impl TimerFd {
    pub fn new(interval: Duration) -> io::Result<Self> {
        // SAFETY: No pointers involved
        let fd = unsafe {
            libc::timerfd_create(libc::CLOCK_MONOTONIC, libc::TFD_NONBLOCK | libc::TFD_CLOEXEC)
        };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        let timer = Self { fd };

        // a zero interval would disarm the timer
        let interval = interval.max(Duration::from_millis(1));
        let period = libc::timespec {
            tv_sec: interval.as_secs() as libc::time_t,
            tv_nsec: interval.subsec_nanos() as libc::c_long,
        };
        let spec = libc::itimerspec {
            it_interval: period,
            it_value: period,
        };
        // SAFETY: `spec` is a valid `itimerspec` and the old value isn't asked
        //         for
        if unsafe { libc::timerfd_settime(timer.fd, 0, &spec, std::ptr::null_mut()) } < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(timer)
    }

    /// Read (and reset) the number of expirations since the last call
    pub fn drain(&self) -> io::Result<u64> {
        let mut expirations = 0u64;
        // SAFETY: Reading 8 bytes into a `u64`
        let read = unsafe {
            libc::read(
                self.fd,
                (&mut expirations as *mut u64).cast(),
                std::mem::size_of::<u64>(),
            )
        };
        if read < 0 {
            let err = io::Error::last_os_error();
            return match err.kind() {
                io::ErrorKind::WouldBlock => Ok(0),
                _ => Err(err),
            };
        }
        Ok(expirations)
    }

    /// Wait until the timer fires or `timeout` passes. `true` if it fired.
    pub fn wait(&self, timeout: Duration) -> io::Result<bool> {
        let mut poll_fd = libc::pollfd {
            fd: self.fd,
            events: libc::POLLIN,
            revents: 0,
        };
        // SAFETY: One valid `pollfd`
        let ready = unsafe { libc::poll(&mut poll_fd, 1, timeout.as_millis() as libc::c_int) };
        if ready < 0 {
            let err = io::Error::last_os_error();
            return match err.kind() {
                io::ErrorKind::Interrupted => Ok(false),
                _ => Err(err),
            };
        }
        Ok(ready > 0 && poll_fd.revents & libc::POLLIN != 0)
    }
}

impl AsRawFd for TimerFd {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for TimerFd {
    fn drop(&mut self) {
        // SAFETY: We own `fd`
        unsafe { libc::close(self.fd) };
    }
}

/// Runs collections on a background thread until dropped
pub struct Collector {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl Collector {
    pub fn start(metrics: Arc<Metrics>) -> io::Result<Self> {
        install_flush_signal_handler();
        metrics.start_timer()?;
        let stop = Arc::new(AtomicBool::new(false));
        let thread = thread::Builder::new().name("memtrack-collector".into()).spawn({
            let stop = Arc::clone(&stop);
            move || collect(&metrics, &stop)
        })?;
        log::debug!("metrics collector started");
        Ok(Self {
            stop,
            thread: Some(thread),
        })
    }
}

fn collect(metrics: &Metrics, stop: &AtomicBool) {
    while !stop.load(Ordering::Relaxed) {
        let fired = match metrics.wait_for_timer(WAKE_UP_INTERVAL) {
            Ok(fired) => fired,
            Err(err) => {
                log::warn!("metrics timer failed, falling back to sleeping: {err}");
                thread::sleep(WAKE_UP_INTERVAL);
                false
            }
        };
        if stop.load(Ordering::Relaxed) {
            break;
        }
        if fired || flush_requested() {
            metrics.run_timeout_handlers();
        }
    }
}

impl Drop for Collector {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("metrics collector thread panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timer_fires_and_drains() {
        let timer = TimerFd::new(Duration::from_millis(10)).unwrap();
        assert!(timer.wait(Duration::from_secs(5)).unwrap());
        assert!(timer.drain().unwrap() >= 1);
    }

    #[test]
    fn sigusr1_requests_a_flush() {
        install_flush_signal_handler();
        clear_flush_request();
        // SAFETY: The handler is installed, so this won't kill us
        unsafe { libc::raise(libc::SIGUSR1) };
        assert!(flush_requested());
        clear_flush_request();
    }
}
