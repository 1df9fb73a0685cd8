use std::collections::VecDeque;

use crate::aggregation::rollup::round2;

/// Samples kept per channel before the oldest is evicted.
pub const WINDOW_CAPACITY: usize = 15;

/// Bounded FIFO of raw samples for one sensor channel.
#[derive(Debug, Clone, PartialEq)]
pub struct RollingWindow {
    samples: VecDeque<Option<f64>>,
    capacity: usize,
}

impl Default for RollingWindow {
    fn default() -> Self {
        Self::with_capacity(WINDOW_CAPACITY)
    }
}

impl RollingWindow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity + 1),
            capacity,
        }
    }

    pub fn push(&mut self, sample: Option<f64>) {
        self.samples.push_back(sample);
        while self.samples.len() > self.capacity {
            self.samples.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }

    pub fn samples(&self) -> Vec<Option<f64>> {
        self.samples.iter().copied().collect()
    }

    pub fn final_value(&self) -> Option<f64> {
        final_value(self.samples.iter().copied())
    }
}

/// Smoothed value of a window.
///
/// Missing and zero samples are left out of the sum but still count in the
/// denominator. A window whose sum is zero has no value, so a sensor that
/// genuinely reads 0 is indistinguishable from one that is absent.
pub fn final_value(samples: impl IntoIterator<Item = Option<f64>>) -> Option<f64> {
    let mut count = 0usize;
    let mut total = 0.0;
    for sample in samples {
        count += 1;
        if let Some(v) = sample.filter(|v| *v != 0.0) {
            total += v;
        }
    }
    if count == 0 || total == 0.0 {
        return None;
    }
    Some(round2(total / count as f64))
}
