use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Hard cap on retained samples, independent of the time window.
const MAX_SAMPLES: usize = 4096;

/// Recent `(instant, score)` samples, culled by age.
#[derive(Debug, Clone)]
pub struct ScoreHistory {
    samples: VecDeque<(Instant, f64)>,
    max_age: Duration,
}

impl ScoreHistory {
    pub fn new(max_age: Duration) -> Self {
        Self {
            samples: VecDeque::new(),
            max_age,
        }
    }

    /// Record a sample and drop those older than `max_age` relative to it.
    pub fn push(&mut self, at: Instant, score: f64) {
        self.samples.push_back((at, score));
        while let Some(&(oldest, _)) = self.samples.front() {
            if at.saturating_duration_since(oldest) > self.max_age || self.samples.len() > MAX_SAMPLES {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    /// Samples as `(seconds since the oldest sample, score)`.
    pub fn points(&self) -> Vec<(f64, f64)> {
        let Some(&(origin, _)) = self.samples.front() else {
            return Vec::new();
        };
        self.samples
            .iter()
            .map(|&(at, score)| (at.saturating_duration_since(origin).as_secs_f64(), score))
            .collect()
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }
}

/// Analysis throughput over the most recent ticks.
#[derive(Debug, Clone)]
pub struct RateMeter {
    stamps: VecDeque<Instant>,
    capacity: usize,
}

impl RateMeter {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(2);
        Self {
            stamps: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Note one completed tick at `at` and return the updated rate.
    pub fn record(&mut self, at: Instant) -> f64 {
        if self.stamps.len() == self.capacity {
            self.stamps.pop_front();
        }
        self.stamps.push_back(at);
        self.per_second()
    }

    /// Ticks per second across the retained stamps; zero until two ticks
    /// at distinct instants have been seen.
    pub fn per_second(&self) -> f64 {
        let (Some(first), Some(last)) = (self.stamps.front(), self.stamps.back()) else {
            return 0.0;
        };
        let span = last.saturating_duration_since(*first).as_secs_f64();
        if span > 0.0 {
            (self.stamps.len() - 1) as f64 / span
        } else {
            0.0
        }
    }

    pub fn clear(&mut self) {
        self.stamps.clear();
    }
}
