// =============================================================================
// MarketRings — preallocated tick and candle rings per symbol/timeframe
// =============================================================================
//
// Writes are single-producer per symbol (the ingestion task); reads are
// multi-consumer and copy out under a short read lock. The rings never
// block: when full they overwrite the oldest entry and count the overwrite
// so the health surface can expose backpressure.
//
// Out-of-order ticks (epoch_ms <= last accepted) are dropped and counted.
// =============================================================================

use std::collections::{HashMap, VecDeque};

use parking_lot::RwLock;
use serde::Serialize;
use tracing::debug;

use super::{Candle, CandleKey, Tick};

/// Counters exposed on the health surface.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct RingStats {
    pub ticks_accepted: u64,
    pub ticks_dropped_out_of_order: u64,
    pub tick_overwrites: u64,
    pub candle_overwrites: u64,
}

struct TickRing {
    buf: VecDeque<Tick>,
    capacity: usize,
    last_epoch_ms: i64,
    accepted: u64,
    dropped: u64,
    overwrites: u64,
}

impl TickRing {
    fn new(capacity: usize) -> Self {
        Self {
            buf: VecDeque::with_capacity(capacity),
            capacity,
            last_epoch_ms: i64::MIN,
            accepted: 0,
            dropped: 0,
            overwrites: 0,
        }
    }

    fn push(&mut self, tick: Tick) -> bool {
        if tick.epoch_ms <= self.last_epoch_ms {
            self.dropped += 1;
            return false;
        }
        self.last_epoch_ms = tick.epoch_ms;
        if self.buf.len() == self.capacity {
            self.buf.pop_front();
            self.overwrites += 1;
        }
        self.buf.push_back(tick);
        self.accepted += 1;
        true
    }
}

struct CandleRing {
    buf: VecDeque<Candle>,
    capacity: usize,
    overwrites: u64,
}

impl CandleRing {
    fn new(capacity: usize) -> Self {
        Self {
            buf: VecDeque::with_capacity(capacity + 1),
            capacity,
            overwrites: 0,
        }
    }

    /// Same in-progress replacement semantics as a live kline feed: an open
    /// candle with a matching open time replaces the previous open version;
    /// a completed candle finalizes it and the ring trims to capacity.
    fn push(&mut self, candle: Candle) {
        if let Some(last) = self.buf.back() {
            if !last.complete && last.open_time_ms == candle.open_time_ms {
                self.buf.pop_back();
            }
        }
        self.buf.push_back(candle);
        while self.buf.iter().filter(|c| c.complete).count() > self.capacity {
            self.buf.pop_front();
            self.overwrites += 1;
        }
    }
}

/// Thread-safe store of tick and candle rings for every tracked symbol.
pub struct MarketRings {
    ticks: RwLock<HashMap<String, TickRing>>,
    candles: RwLock<HashMap<CandleKey, CandleRing>>,
    tick_capacity: usize,
    candle_capacity: usize,
}

impl MarketRings {
    pub fn new(tick_capacity: usize, candle_capacity: usize) -> Self {
        Self {
            ticks: RwLock::new(HashMap::new()),
            candles: RwLock::new(HashMap::new()),
            tick_capacity,
            candle_capacity,
        }
    }

    /// Insert a tick. Returns false when the tick was dropped as
    /// out-of-order.
    pub fn push_tick(&self, tick: Tick) -> bool {
        let mut map = self.ticks.write();
        let ring = map
            .entry(tick.symbol.clone())
            .or_insert_with(|| TickRing::new(self.tick_capacity));
        let accepted = ring.push(tick);
        if !accepted {
            debug!(dropped = ring.dropped, "out-of-order tick dropped");
        }
        accepted
    }

    pub fn push_candle(&self, key: CandleKey, candle: Candle) {
        let mut map = self.candles.write();
        let ring = map
            .entry(key)
            .or_insert_with(|| CandleRing::new(self.candle_capacity));
        ring.push(candle);
    }

    /// Most recent `n` **complete** candles, oldest first.
    pub fn candles(&self, key: &CandleKey, n: usize) -> Vec<Candle> {
        let map = self.candles.read();
        match map.get(key) {
            Some(ring) => {
                let complete: Vec<&Candle> = ring.buf.iter().filter(|c| c.complete).collect();
                let start = complete.len().saturating_sub(n);
                complete[start..].iter().map(|c| (*c).clone()).collect()
            }
            None => Vec::new(),
        }
    }

    /// The currently forming candle, if one exists.
    pub fn open_candle(&self, key: &CandleKey) -> Option<Candle> {
        let map = self.candles.read();
        map.get(key)
            .and_then(|ring| ring.buf.back().filter(|c| !c.complete).cloned())
    }

    /// Open time of the newest complete candle — the freshness anchor.
    pub fn last_complete_open_ms(&self, key: &CandleKey) -> Option<i64> {
        let map = self.candles.read();
        map.get(key).and_then(|ring| {
            ring.buf
                .iter()
                .rev()
                .find(|c| c.complete)
                .map(|c| c.open_time_ms)
        })
    }

    pub fn latest_tick(&self, symbol: &str) -> Option<Tick> {
        let map = self.ticks.read();
        map.get(symbol).and_then(|ring| ring.buf.back().cloned())
    }

    /// Most recent `n` ticks, oldest first.
    pub fn recent_ticks(&self, symbol: &str, n: usize) -> Vec<Tick> {
        let map = self.ticks.read();
        match map.get(symbol) {
            Some(ring) => {
                let start = ring.buf.len().saturating_sub(n);
                ring.buf.iter().skip(start).cloned().collect()
            }
            None => Vec::new(),
        }
    }

    pub fn stats(&self, symbol: &str) -> RingStats {
        let ticks = self.ticks.read();
        let candles = self.candles.read();
        let (accepted, dropped, tick_overwrites) = ticks
            .get(symbol)
            .map(|r| (r.accepted, r.dropped, r.overwrites))
            .unwrap_or_default();
        let candle_overwrites = candles
            .iter()
            .filter(|(k, _)| k.symbol == symbol)
            .map(|(_, r)| r.overwrites)
            .sum();
        RingStats {
            ticks_accepted: accepted,
            ticks_dropped_out_of_order: dropped,
            tick_overwrites,
            candle_overwrites,
        }
    }
}
