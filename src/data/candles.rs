use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use log::warn;

use crate::data::tick::TradeTick;

/// Compact delta payload published per symbol on every flush.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Ohlcv {
    pub o: f64,
    pub h: f64,
    pub l: f64,
    pub c: f64,
    pub v: f64,
    pub t: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CandleAccumulator {
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub last_timestamp: i64,
    pub dirty: bool,
}

impl CandleAccumulator {
    fn new(tick: &TradeTick) -> Self {
        Self {
            open: tick.price,
            high: tick.price,
            low: tick.price,
            close: tick.price,
            volume: tick.size,
            last_timestamp: tick.timestamp,
            dirty: true,
        }
    }

    fn update(&mut self, tick: &TradeTick) {
        if tick.price > self.high {
            self.high = tick.price;
        }
        if tick.price < self.low {
            self.low = tick.price;
        }
        // close follows apply order, not event time
        self.close = tick.price;
        self.volume += tick.size;
        self.last_timestamp = tick.timestamp;
        self.dirty = true;
    }

    pub fn to_ohlcv(&self) -> Ohlcv {
        Ohlcv {
            o: self.open,
            h: self.high,
            l: self.low,
            c: self.close,
            v: self.volume,
            t: self.last_timestamp,
        }
    }
}

/// Aggregator shared by the ingest loop and the flush timer. Both sides hold
/// the lock only for one apply or one drain.
pub type SharedAggregator = Arc<Mutex<CandleAggregator>>;

pub fn lock_aggregator(aggregator: &SharedAggregator) -> MutexGuard<'_, CandleAggregator> {
    aggregator.lock().unwrap_or_else(|poisoned| {
        warn!("Aggregator lock poisoned, continuing with current state");
        poisoned.into_inner()
    })
}

/// Per-symbol OHLCV accumulator for the current flush window. Holds only
/// symbols that traded since the last flush.
#[derive(Debug, Default)]
pub struct CandleAggregator {
    accumulators: HashMap<String, CandleAccumulator>,
}

impl CandleAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> SharedAggregator {
        Arc::new(Mutex::new(Self::new()))
    }

    pub fn apply_tick(&mut self, tick: &TradeTick) {
        match self.accumulators.get_mut(&tick.symbol) {
            Some(acc) => acc.update(tick),
            None => {
                self.accumulators.insert(tick.symbol.clone(), CandleAccumulator::new(tick));
            }
        }
    }

    /// Drains every dirty accumulator. Results are ordered by symbol.
    pub fn flush_and_clear(&mut self) -> Vec<(String, Ohlcv)> {
        let mut flushed: Vec<(String, Ohlcv)> = self
            .accumulators
            .drain()
            .filter(|(_, acc)| acc.dirty)
            .map(|(symbol, acc)| (symbol, acc.to_ohlcv()))
            .collect();
        flushed.sort_by(|a, b| a.0.cmp(&b.0));
        flushed
    }

    pub fn get(&self, symbol: &str) -> Option<&CandleAccumulator> {
        self.accumulators.get(symbol)
    }

    pub fn active_symbols(&self) -> usize {
        self.accumulators.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tick(symbol: &str, price: f64, size: f64, timestamp: i64) -> TradeTick {
        TradeTick {
            symbol: symbol.to_string(),
            price,
            size,
            timestamp,
            entry_id: format!("{}-0", timestamp),
        }
    }

    #[test]
    fn test_window_scenario() {
        let mut agg = CandleAggregator::new();
        agg.apply_tick(&tick("AAPL", 100.00, 10.0, 1));
        agg.apply_tick(&tick("AAPL", 100.50, 5.0, 2));
        agg.apply_tick(&tick("AAPL", 99.90, 20.0, 3));

        let flushed = agg.flush_and_clear();
        assert_eq!(flushed.len(), 1);
        let (symbol, bar) = &flushed[0];
        assert_eq!(symbol, "AAPL");
        assert_eq!(*bar, Ohlcv { o: 100.00, h: 100.50, l: 99.90, c: 99.90, v: 35.0, t: 3 });
    }

    #[test]
    fn test_quiet_symbol_not_flushed() {
        let mut agg = CandleAggregator::new();
        agg.apply_tick(&tick("AAPL", 10.0, 1.0, 1));
        agg.apply_tick(&tick("MSFT", 20.0, 1.0, 1));
        assert_eq!(agg.flush_and_clear().len(), 2);

        agg.apply_tick(&tick("MSFT", 21.0, 1.0, 2));
        let flushed = agg.flush_and_clear();
        assert_eq!(flushed.len(), 1);
        assert_eq!(flushed[0].0, "MSFT");
        assert_eq!(agg.active_symbols(), 0);
        assert!(agg.flush_and_clear().is_empty());
    }

    #[test]
    fn test_open_resets_after_flush() {
        let mut agg = CandleAggregator::new();
        agg.apply_tick(&tick("AAPL", 10.0, 1.0, 1));
        agg.flush_and_clear();
        agg.apply_tick(&tick("AAPL", 12.0, 1.0, 2));
        assert_eq!(agg.get("AAPL").unwrap().open, 12.0);
    }

    #[test]
    fn test_independent_of_batch_chunking() {
        let prices = [5.0, 7.5, 3.25, 6.0, 6.5, 2.0, 9.0, 4.0];
        let ticks: Vec<TradeTick> = prices
            .iter()
            .enumerate()
            .map(|(i, p)| tick("X", *p, (i + 1) as f64, i as i64))
            .collect();

        let mut reference = None;
        for chunk_size in 1..=ticks.len() {
            let mut agg = CandleAggregator::new();
            for chunk in ticks.chunks(chunk_size) {
                for t in chunk {
                    agg.apply_tick(t);
                }
            }
            let bar = agg.flush_and_clear()[0].1;
            assert_eq!(bar.h, 9.0);
            assert_eq!(bar.l, 2.0);
            assert_eq!(bar.c, 4.0);
            assert_eq!(bar.v, 36.0);
            match reference {
                None => reference = Some(bar),
                Some(r) => assert_eq!(r, bar),
            }
        }
    }

    #[test]
    fn test_redelivered_tick_only_inflates_volume() {
        let mut once = CandleAggregator::new();
        let mut twice = CandleAggregator::new();
        let ticks = [tick("AAPL", 100.0, 10.0, 1), tick("AAPL", 101.0, 4.0, 2)];
        for t in &ticks {
            once.apply_tick(t);
            twice.apply_tick(t);
        }
        twice.apply_tick(&ticks[1]);

        let a = once.flush_and_clear()[0].1;
        let b = twice.flush_and_clear()[0].1;
        assert_eq!(b.v, a.v + 4.0);
        assert_eq!((a.o, a.h, a.l, a.c), (b.o, b.h, b.l, b.c));
    }
}
