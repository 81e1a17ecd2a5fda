//! Delay sampling: exponentially weighted smoothing plus running aggregates.
//!
//! Only aggregates are kept (sum, count, min, max, smoothed value, negative
//! sample count). Individual samples are returned to the caller so they can be
//! handed to a [`SampleSink`](crate::sink::SampleSink) if one is attached.

/// Smoothing factor for client round-trip samples.
pub const RTT_ALPHA: f64 = 0.125;
/// Smoothing factor for server one-way samples.
pub const OWD_ALPHA: f64 = 0.10;

/// Exponentially weighted moving average seeded by its first sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Ewma {
    alpha: f64,
    value: Option<f64>,
}

impl Ewma {
    pub fn new(alpha: f64) -> Self {
        Self { alpha, value: None }
    }

    /// Folds in a sample and returns the new smoothed value.
    pub fn update(&mut self, sample: f64) -> f64 {
        let next = match self.value {
            None => sample,
            Some(prev) => self.alpha * sample + (1.0 - self.alpha) * prev,
        };
        self.value = Some(next);
        next
    }

    pub fn value(&self) -> Option<f64> {
        self.value
    }

    pub fn alpha(&self) -> f64 {
        self.alpha
    }
}

/// One delay observation as produced for an accepted probe.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DelaySample {
    /// Seconds.
    pub raw: f64,
    /// Filter output after folding in `raw`.
    pub smoothed: f64,
    /// Wall-clock seconds when the sample was taken.
    pub timestamp: f64,
}

/// Running aggregate over delay samples.
#[derive(Debug, Clone)]
pub struct DelayStats {
    filter: Ewma,
    sum: f64,
    count: u64,
    min: f64,
    max: f64,
    negative: u64,
}

impl DelayStats {
    pub fn new(alpha: f64) -> Self {
        Self {
            filter: Ewma::new(alpha),
            sum: 0.0,
            count: 0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
            negative: 0,
        }
    }

    pub fn rtt() -> Self {
        Self::new(RTT_ALPHA)
    }

    pub fn owd() -> Self {
        Self::new(OWD_ALPHA)
    }

    /// Records a sample. Negative values (unsynchronised clocks) are kept
    /// and counted rather than discarded.
    pub fn record(&mut self, raw: f64, timestamp: f64) -> DelaySample {
        if raw < 0.0 {
            self.negative += 1;
        }
        self.sum += raw;
        self.count += 1;
        self.min = self.min.min(raw);
        self.max = self.max.max(raw);
        let smoothed = self.filter.update(raw);
        DelaySample {
            raw,
            smoothed,
            timestamp,
        }
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn sum(&self) -> f64 {
        self.sum
    }

    pub fn mean(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum / self.count as f64)
    }

    pub fn min(&self) -> Option<f64> {
        (self.count > 0).then_some(self.min)
    }

    pub fn max(&self) -> Option<f64> {
        (self.count > 0).then_some(self.max)
    }

    pub fn smoothed(&self) -> Option<f64> {
        self.filter.value()
    }

    pub fn negative_count(&self) -> u64 {
        self.negative
    }
}
