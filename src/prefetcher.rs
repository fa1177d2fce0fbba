//! Access-pattern prediction for the prefetcher.
//!
//! The fetcher reports every chunk-index access; the predictor classifies
//! the recent deltas and proposes the next indexes to prefetch. Sequential
//! runs ramp up exponentially so a cold start does not flood the pool,
//! constant strides are extrapolated, and anything else gets a single
//! conservative guess.

use std::collections::VecDeque;

const MEMORY_SIZE: usize = 3;

#[derive(Debug, Default)]
pub struct AccessPattern {
    recent: VecDeque<usize>,
    /// Length of the current run of +1 deltas.
    streak: usize,
}

impl AccessPattern {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, index: usize) {
        if let Some(&last) = self.recent.back() {
            if index == last + 1 {
                self.streak += 1;
            } else if index != last {
                self.streak = 0;
            }
            // A repeated access leaves the streak untouched.
        }
        if self.recent.back() != Some(&index) {
            self.recent.push_back(index);
            if self.recent.len() > MEMORY_SIZE {
                self.recent.pop_front();
            }
        }
    }

    /// Whether the recent accesses form a forward sequential run.
    pub fn is_sequential(&self) -> bool {
        self.streak >= 2
    }

    /// Up to `max_amount` predicted next chunk indexes, nearest first.
    pub fn predict(&self, max_amount: usize) -> Vec<usize> {
        let Some(&last) = self.recent.back() else {
            return Vec::new();
        };
        if max_amount == 0 {
            return Vec::new();
        }

        if self.streak >= 1 {
            // Exponential ramp-up: 2, 4, 8, ... up to the cache budget.
            let count = (1usize << self.streak.min(16).saturating_add(1))
                .min(max_amount)
                .max(1);
            return (1..=count).map(|ahead| last + ahead).collect();
        }

        if self.recent.len() == MEMORY_SIZE {
            let deltas: Vec<i64> = self
                .recent
                .iter()
                .zip(self.recent.iter().skip(1))
                .map(|(&a, &b)| b as i64 - a as i64)
                .collect();
            if deltas[0] == deltas[1] && deltas[0] != 0 {
                let stride = deltas[0];
                let count = max_amount.min(MEMORY_SIZE);
                return (1..=count as i64)
                    .filter_map(|step| {
                        let index = last as i64 + stride * step;
                        (index >= 0).then_some(index as usize)
                    })
                    .collect();
            }
        }

        vec![last + 1]
    }
}
