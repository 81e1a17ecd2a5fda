//! Send pacing and timestamp sources.
//!
//! The client schedules probe `k` at `origin + k * interval`, an absolute
//! monotonic deadline, so a slow iteration never pushes later sends back.
//! How the thread waits for a deadline is pluggable through [`DeadlineWait`]:
//! [`SpinWait`] burns a core for sub-millisecond precision, [`SleepWait`]
//! hands the wait to the OS scheduler.
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Nanoseconds in one second.
const NANOS_PER_SEC: f64 = 1_000_000_000.0;

/// Wall-clock time as carried on the wire: whole seconds since the Unix
/// epoch plus nanoseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WallTime {
    pub secs: u32,
    pub nanos: u32,
}

impl WallTime {
    pub fn new(secs: u32, nanos: u32) -> Self {
        Self { secs, nanos }
    }

    /// Current realtime clock reading. A clock set before the epoch reads as zero.
    pub fn now() -> Self {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(Self::from_duration)
            .unwrap_or_default()
    }

    /// Seconds are truncated to 32 bits, matching the wire field.
    pub fn from_duration(since_epoch: Duration) -> Self {
        Self {
            secs: since_epoch.as_secs() as u32,
            nanos: since_epoch.subsec_nanos(),
        }
    }

    pub fn as_secs_f64(&self) -> f64 {
        self.secs as f64 + self.nanos as f64 / NANOS_PER_SEC
    }
}

/// Current wall-clock time in fractional seconds.
pub fn wall_clock_secs() -> f64 {
    WallTime::now().as_secs_f64()
}

/// Blocks the calling thread until a monotonic deadline has passed.
pub trait DeadlineWait: Send {
    fn wait_until(&mut self, deadline: Instant);
}

/// Busy-waits on the monotonic clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SpinWait;

impl DeadlineWait for SpinWait {
    fn wait_until(&mut self, deadline: Instant) {
        while Instant::now() < deadline {
            std::hint::spin_loop();
        }
    }
}

/// Sleeps for the remaining time. Precision is whatever the OS timer gives.
#[derive(Debug, Default, Clone, Copy)]
pub struct SleepWait;

impl DeadlineWait for SleepWait {
    fn wait_until(&mut self, deadline: Instant) {
        let now = Instant::now();
        if deadline > now {
            std::thread::sleep(deadline - now);
        }
    }
}

/// Absolute-deadline send schedule anchored at a fixed origin.
#[derive(Debug, Clone)]
pub struct PacingSchedule {
    origin: Instant,
    interval: Duration,
    iteration: u64,
}

impl PacingSchedule {
    pub fn new(origin: Instant, interval: Duration) -> Self {
        Self {
            origin,
            interval,
            iteration: 0,
        }
    }

    /// Anchors the schedule at the current instant.
    pub fn start(interval: Duration) -> Self {
        Self::new(Instant::now(), interval)
    }

    pub fn origin(&self) -> Instant {
        self.origin
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Number of deadlines handed out so far.
    pub fn iteration(&self) -> u64 {
        self.iteration
    }

    /// Deadline of iteration `k`: `origin + k * interval`.
    pub fn deadline(&self, k: u64) -> Instant {
        let nanos = self.interval.as_nanos().saturating_mul(k as u128);
        let offset = Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX));
        self.origin.checked_add(offset).unwrap_or(self.origin)
    }

    /// Moves to the next iteration and returns its deadline.
    pub fn advance(&mut self) -> Instant {
        self.iteration += 1;
        self.deadline(self.iteration)
    }

    /// Advances and blocks until the new deadline using `waiter`.
    pub fn wait_next(&mut self, waiter: &mut dyn DeadlineWait) -> Instant {
        let deadline = self.advance();
        waiter.wait_until(deadline);
        deadline
    }
}

/// Inter-send interval that yields `bits_per_sec` with `message_size` byte probes.
///
/// `None` when the interval is negative, not finite or too long for a
/// [`Duration`].
pub fn interval_for_rate(message_size: usize, bits_per_sec: f64) -> Option<Duration> {
    Duration::try_from_secs_f64((message_size as f64 * 8.0) / bits_per_sec).ok()
}

/// Bit rate produced by sending `message_size` bytes every `interval`.
pub fn rate_for_interval(message_size: usize, interval: Duration) -> f64 {
    let secs = interval.as_secs_f64();
    if secs > 0.0 {
        (message_size as f64 * 8.0) / secs
    } else {
        0.0
    }
}
