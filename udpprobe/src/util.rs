//! Helpers for keeping per-packet log output bounded.

/// Decides which occurrences of a repeated event get logged: the first one,
/// then every `every`th after it. An `every` of 0 logs only the first.
#[derive(Debug, Clone)]
pub struct LogSampler {
    every: u64,
    seen: u64,
}

impl LogSampler {
    pub fn new(every: u64) -> Self {
        Self { every, seen: 0 }
    }

    /// Counts one occurrence and reports whether it should be logged.
    pub fn should_log(&mut self) -> bool {
        self.seen += 1;
        if self.seen == 1 {
            return true;
        }
        self.every > 0 && (self.seen - 1) % self.every == 0
    }

    pub fn seen(&self) -> u64 {
        self.seen
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_logs_first_then_every_nth() {
        let mut sampler = LogSampler::new(3);
        let logged: Vec<bool> = (0..8).map(|_| sampler.should_log()).collect();
        assert_eq!(
            logged,
            vec![true, false, false, true, false, false, true, false]
        );
        assert_eq!(sampler.seen(), 8);
    }

    #[test]
    fn test_zero_interval_logs_once() {
        let mut sampler = LogSampler::new(0);
        assert!(sampler.should_log());
        assert!((0..100).all(|_| !sampler.should_log()));
    }

    #[test]
    fn test_interval_of_one_logs_everything() {
        let mut sampler = LogSampler::new(1);
        assert!((0..10).all(|_| sampler.should_log()));
    }
}
