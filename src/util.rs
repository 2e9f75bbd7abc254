// src/util.rs
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

/// Cooperative shutdown flag shared across pipeline threads.
pub struct BarrierFlag(AtomicBool);

impl Default for BarrierFlag {
    fn default() -> Self {
        Self(AtomicBool::new(false))
    }
}

impl BarrierFlag {
    #[inline]
    pub fn raise(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    #[inline]
    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Monotonic wall-clock seconds with microsecond precision, used to stamp
/// packets captured live. Offline replay uses the capture file's own
/// timestamps instead (§4.A: "never wall time").
#[inline]
pub fn wall_timestamp_secs() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// Monotonic nanosecond clock for internal interval measurements (sliding
/// windows, cadence timers) where wall-clock jumps must not be observed.
#[inline]
pub fn now_nanos() -> u64 {
    static START: once_cell::sync::Lazy<Instant> = once_cell::sync::Lazy::new(Instant::now);
    START.elapsed().as_nanos() as u64
}

/// Strip a trailing dot from a resolved hostname, as returned by reverse DNS.
pub fn strip_trailing_dot(s: &str) -> &str {
    s.strip_suffix('.').unwrap_or(s)
}

static PAUSED: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_pause_signal(_: libc::c_int) {
    PAUSED.store(true, Ordering::SeqCst);
}

extern "C" fn handle_resume_signal(_: libc::c_int) {
    PAUSED.store(false, Ordering::SeqCst);
}

/// True while a `pause` signal has been delivered and no matching `resume`
/// has followed (§6: "pause and resume are delivered as user-defined
/// signals to the running process"). A single process-wide flag, since
/// POSIX signal handlers cannot capture per-instance state.
#[inline]
pub fn is_paused() -> bool {
    PAUSED.load(Ordering::Relaxed)
}

/// Install `SIGUSR1`/`SIGUSR2` as the pause/resume signals. Raw `sigaction`
/// rather than the `ctrlc` crate because `ctrlc` only targets the
/// terminate-the-process signals (SIGINT/SIGTERM/SIGHUP); pause/resume need
/// two arbitrary signals left free for the operator.
pub fn install_pause_resume_handlers() {
    unsafe {
        libc::signal(libc::SIGUSR1, handle_pause_signal as libc::sighandler_t);
        libc::signal(libc::SIGUSR2, handle_resume_signal as libc::sighandler_t);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn barrier_flag_starts_lowered() {
        let b = BarrierFlag::default();
        assert!(!b.is_raised());
        b.raise();
        assert!(b.is_raised());
    }

    #[test]
    fn strip_trailing_dot_removes_one_dot() {
        assert_eq!(strip_trailing_dot("example.com."), "example.com");
        assert_eq!(strip_trailing_dot("example.com"), "example.com");
    }

    #[test]
    fn now_nanos_is_monotonic() {
        let a = now_nanos();
        let b = now_nanos();
        assert!(b >= a);
    }
}
