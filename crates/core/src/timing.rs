//! Call timing samples
//!
//! The dispatcher samples wall time, per-thread CPU split and the cycle
//! counter at four observation points per call and reports elapsed time
//! with the engine's own overhead subtracted.

use std::time::Instant;

/// One observation point.
#[derive(Clone, Copy, Debug, Default)]
pub struct TimeSample {
    /// Milliseconds since the engine epoch.
    pub time_ms: f64,
    pub kernel_ms: f64,
    pub user_ms: f64,
    pub cycles: u64,
}

impl TimeSample {
    pub fn now(epoch: Instant) -> Self {
        let (kernel_ms, user_ms) = thread_cpu_times();
        Self {
            time_ms: epoch.elapsed().as_secs_f64() * 1000.0,
            kernel_ms,
            user_ms,
            cycles: cycle_counter(),
        }
    }
}

/// `a - b` in milliseconds, floored at zero so clock adjustments and
/// sub-resolution intervals never produce negative durations.
pub fn diff_ms(a: f64, b: f64) -> f64 {
    let d = a - b;
    if d < 0.000_000_1 {
        0.0
    } else {
        d
    }
}

/// Per-thread accumulators fed from the observation samples.
#[derive(Clone, Copy, Debug, Default)]
pub struct ThreadTimes {
    pub kernel_ms: f64,
    pub user_ms: f64,
    pub cycles: u64,
    last_kernel_ms: f64,
    last_user_ms: f64,
    last_cycles: u64,
}

impl ThreadTimes {
    /// Fold the delta since the previous observation into the totals.
    pub fn accumulate(&mut self, sample: &TimeSample) {
        self.kernel_ms += diff_ms(sample.kernel_ms, self.last_kernel_ms);
        self.user_ms += diff_ms(sample.user_ms, self.last_user_ms);
        self.cycles += sample.cycles.saturating_sub(self.last_cycles);
        self.set_last(sample);
    }

    pub fn set_last(&mut self, sample: &TimeSample) {
        self.last_kernel_ms = sample.kernel_ms;
        self.last_user_ms = sample.user_ms;
        self.last_cycles = sample.cycles;
    }
}

#[cfg(target_os = "linux")]
fn thread_cpu_times() -> (f64, f64) {
    let mut usage: libc::rusage = unsafe { std::mem::zeroed() };
    if unsafe { libc::getrusage(libc::RUSAGE_THREAD, &mut usage) } != 0 {
        return (0.0, 0.0);
    }
    (timeval_ms(&usage.ru_stime), timeval_ms(&usage.ru_utime))
}

#[cfg(target_os = "linux")]
fn timeval_ms(tv: &libc::timeval) -> f64 {
    tv.tv_sec as f64 * 1000.0 + tv.tv_usec as f64 / 1000.0
}

#[cfg(not(target_os = "linux"))]
fn thread_cpu_times() -> (f64, f64) {
    (0.0, 0.0)
}

#[cfg(target_arch = "x86_64")]
fn cycle_counter() -> u64 {
    unsafe { core::arch::x86_64::_rdtsc() }
}

#[cfg(target_arch = "x86")]
fn cycle_counter() -> u64 {
    unsafe { core::arch::x86::_rdtsc() }
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "x86")))]
fn cycle_counter() -> u64 {
    0
}
