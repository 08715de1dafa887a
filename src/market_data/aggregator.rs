// =============================================================================
// CandleAggregator — builds candles for every timeframe from the tick stream
// =============================================================================
//
// Each timeframe bucket closes exactly at its UTC boundary: a tick whose
// epoch falls into a new bucket first finalizes the old candle, then opens
// the new one. Candles are built from the mid price; tick volume accumulates
// when the feed provides it, otherwise each tick counts as one unit.
//
// The aggregator is owned by a single ingestion task per symbol — no locking.
// =============================================================================

use std::collections::HashMap;

use super::{Candle, CandleKey, Tick, Timeframe};

/// Output of a tick application: candles to publish to the rings, with the
/// completed predecessors (if any) ordered before the updated open candles.
pub struct AggregationUpdate {
    pub candles: Vec<(CandleKey, Candle)>,
}

pub struct CandleAggregator {
    symbol: String,
    open: HashMap<Timeframe, Candle>,
}

/// Align an epoch to the open of its timeframe bucket.
pub fn bucket_open_ms(epoch_ms: i64, tf: Timeframe) -> i64 {
    let dur = tf.duration_ms();
    epoch_ms.div_euclid(dur) * dur
}

impl CandleAggregator {
    pub fn new(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            open: HashMap::new(),
        }
    }

    /// Apply one tick and return every candle update it produced.
    pub fn on_tick(&mut self, tick: &Tick) -> AggregationUpdate {
        let price = tick.mid();
        let volume = tick.volume.unwrap_or(1.0);
        let mut out = Vec::new();

        for tf in Timeframe::ALL {
            let bucket = bucket_open_ms(tick.epoch_ms, tf);
            let key = CandleKey::new(self.symbol.clone(), tf);

            match self.open.get_mut(&tf) {
                Some(candle) if candle.open_time_ms == bucket => {
                    candle.high = candle.high.max(price);
                    candle.low = candle.low.min(price);
                    candle.close = price;
                    candle.volume += volume;
                    out.push((key, candle.clone()));
                }
                Some(candle) if bucket > candle.open_time_ms => {
                    // Boundary crossed: finalize the old candle first.
                    let mut finished = candle.clone();
                    finished.complete = true;
                    out.push((key.clone(), finished));

                    let fresh = new_candle(bucket, price, volume);
                    *candle = fresh.clone();
                    out.push((key, fresh));
                }
                Some(_) => {
                    // Tick belongs to an already-closed bucket; the ring has
                    // its own out-of-order guard, skip here.
                }
                None => {
                    let fresh = new_candle(bucket, price, volume);
                    self.open.insert(tf, fresh.clone());
                    out.push((key, fresh));
                }
            }
        }

        AggregationUpdate { candles: out }
    }
}

fn new_candle(open_time_ms: i64, price: f64, volume: f64) -> Candle {
    Candle {
        open_time_ms,
        open: price,
        high: price,
        low: price,
        close: price,
        volume,
        complete: false,
    }
}
