// =============================================================================
// Latency Tracker — per-stage p50/p95 sample rings for the health surface
// =============================================================================

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::RwLock;
use serde::Serialize;

/// Samples retained per stage.
const SAMPLES: usize = 256;

/// Percentile summary for one pipeline stage.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct StageLatency {
    pub p50_us: u64,
    pub p95_us: u64,
    pub samples: usize,
}

struct StageRing {
    samples_us: Vec<u64>,
    cursor: usize,
    filled: bool,
}

impl StageRing {
    fn new() -> Self {
        Self {
            samples_us: vec![0; SAMPLES],
            cursor: 0,
            filled: false,
        }
    }

    fn push(&mut self, us: u64) {
        self.samples_us[self.cursor] = us;
        self.cursor = (self.cursor + 1) % SAMPLES;
        if self.cursor == 0 {
            self.filled = true;
        }
    }

    fn summary(&self) -> StageLatency {
        let len = if self.filled { SAMPLES } else { self.cursor };
        if len == 0 {
            return StageLatency {
                p50_us: 0,
                p95_us: 0,
                samples: 0,
            };
        }
        let mut sorted: Vec<u64> = self.samples_us[..len].to_vec();
        sorted.sort_unstable();
        let idx = |p: f64| ((len as f64 * p) as usize).min(len - 1);
        StageLatency {
            p50_us: sorted[idx(0.50)],
            p95_us: sorted[idx(0.95)],
            samples: len,
        }
    }
}

/// Thread-safe per-stage latency rings.
pub struct LatencyTracker {
    stages: RwLock<HashMap<&'static str, StageRing>>,
}

impl LatencyTracker {
    pub fn new() -> Self {
        Self {
            stages: RwLock::new(HashMap::new()),
        }
    }

    pub fn record(&self, stage: &'static str, elapsed: Duration) {
        let us = elapsed.as_micros().min(u128::from(u64::MAX)) as u64;
        self.stages
            .write()
            .entry(stage)
            .or_insert_with(StageRing::new)
            .push(us);
    }

    pub fn summaries(&self) -> HashMap<String, StageLatency> {
        self.stages
            .read()
            .iter()
            .map(|(k, v)| (k.to_string(), v.summary()))
            .collect()
    }
}

impl Default for LatencyTracker {
    fn default() -> Self {
        Self::new()
    }
}
