use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

/// Single-pass running statistics plus a bounded FIFO of recent raw samples.
///
/// The running mean/variance use Welford's update and never store history;
/// the window only feeds drift tests and is silently capped at `capacity`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatAccumulator {
    pub count: u64,
    pub mean: f64,
    #[serde(rename = "M2")]
    pub m2: f64,
    pub window: VecDeque<f64>,
    #[serde(skip)]
    capacity: usize,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowSummary {
    pub len: usize,
    pub mean: f64,
    pub std: f64,
}

impl StatAccumulator {
    pub fn new(capacity: usize) -> Self {
        Self {
            count: 0,
            mean: 0.0,
            m2: 0.0,
            window: VecDeque::with_capacity(capacity.min(4096)),
            capacity,
        }
    }

    /// Restores the window capacity after deserialization, trimming any
    /// excess left by a larger previous configuration.
    pub fn restore_capacity(&mut self, capacity: usize) {
        self.capacity = capacity;
        while self.window.len() > capacity {
            self.window.pop_front();
        }
    }

    pub fn observe(&mut self, x: f64) {
        self.count += 1;
        let delta = x - self.mean;
        self.mean += delta / self.count as f64;
        let delta2 = x - self.mean;
        self.m2 += delta * delta2;

        self.window.push_back(x);
        while self.window.len() > self.capacity {
            self.window.pop_front();
        }
    }

    pub fn variance(&self) -> f64 {
        if self.count < 2 {
            0.0
        } else {
            self.m2 / (self.count - 1) as f64
        }
    }

    pub fn std(&self) -> f64 {
        self.variance().sqrt()
    }

    /// Two-pass mean/std over the raw window contents. The window is small
    /// and bounded, so the extra pass is cheaper than a second accumulator.
    pub fn window_summary(&self) -> WindowSummary {
        let len = self.window.len();
        if len == 0 {
            return WindowSummary {
                len: 0,
                mean: 0.0,
                std: 0.0,
            };
        }
        let mean = self.window.iter().sum::<f64>() / len as f64;
        let std = if len < 2 {
            0.0
        } else {
            let ss = self
                .window
                .iter()
                .map(|x| (x - mean) * (x - mean))
                .sum::<f64>();
            (ss / (len - 1) as f64).sqrt()
        };
        WindowSummary { len, mean, std }
    }

    /// Administrative reset; never called from the diagnostic path.
    pub fn reset(&mut self) {
        self.count = 0;
        self.mean = 0.0;
        self.m2 = 0.0;
        self.window.clear();
    }
}
