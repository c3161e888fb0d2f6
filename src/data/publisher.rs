use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use log::{info, warn, debug};

use crate::data::candles::{lock_aggregator, Ohlcv, SharedAggregator};
use crate::data::pubsub::{PubSubManager, PublishError};
use crate::data::stats::PipelineStats;

/// Destination for flushed bars.
pub trait BarSink: Send + Sync {
    fn publish(&self, symbol: &str, bar: &Ohlcv) -> Result<usize, PublishError>;
}

impl BarSink for PubSubManager {
    fn publish(&self, symbol: &str, bar: &Ohlcv) -> Result<usize, PublishError> {
        PubSubManager::publish(self, symbol, bar)
    }
}

/// Drains the aggregator on a fixed period and publishes one delta per active symbol.
pub struct FlushPublisher {
    aggregator: SharedAggregator,
    sink: Arc<dyn BarSink>,
    stats: Arc<PipelineStats>,
    flush_interval: Duration,
    stats_interval: Duration,
}

impl FlushPublisher {
    pub fn new(
        aggregator: SharedAggregator,
        sink: Arc<dyn BarSink>,
        stats: Arc<PipelineStats>,
        flush_interval: Duration,
        stats_interval: Duration,
    ) -> Self {
        Self {
            aggregator,
            sink,
            stats,
            flush_interval,
            stats_interval,
        }
    }

    /// One flush window. The window is cleared even when publishing fails;
    /// the next window's activity supersedes the lost delta.
    pub fn flush_once(&self) -> usize {
        // drain under the lock, publish outside it
        let flushed = lock_aggregator(&self.aggregator).flush_and_clear();
        let mut published = 0;
        for (symbol, bar) in flushed {
            match self.sink.publish(&symbol, &bar) {
                Ok(receivers) => {
                    self.stats.record_publish();
                    published += 1;
                    debug!("Published {} delta to {} receivers", symbol, receivers);
                }
                Err(e) => {
                    self.stats.record_publish_error();
                    warn!("Failed to publish {} delta: {}", symbol, e);
                }
            }
        }
        published
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut flush_timer = interval(self.flush_interval);
        flush_timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut stats_timer = interval(self.stats_interval);
        stats_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // interval fires immediately, stats should cover a full period
        stats_timer.tick().await;

        info!(
            "Flush publisher running every {:?}, stats every {:?}",
            self.flush_interval, self.stats_interval
        );

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = flush_timer.tick() => {
                    self.flush_once();
                }
                _ = stats_timer.tick() => {
                    self.stats.log_and_reset();
                }
            }
        }

        self.flush_once();
        info!("Flush publisher stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use crate::data::candles::CandleAggregator;
    use crate::data::tick::TradeTick;

    #[derive(Default)]
    struct RecordingSink {
        published: Mutex<Vec<(String, Ohlcv)>>,
        fail_symbol: Option<String>,
    }

    impl BarSink for RecordingSink {
        fn publish(&self, symbol: &str, bar: &Ohlcv) -> Result<usize, PublishError> {
            if self.fail_symbol.as_deref() == Some(symbol) {
                return Err(PublishError::LockPoisoned);
            }
            self.published.lock().unwrap().push((symbol.to_string(), *bar));
            Ok(1)
        }
    }

    fn tick(symbol: &str, price: f64, size: f64) -> TradeTick {
        TradeTick {
            symbol: symbol.to_string(),
            price,
            size,
            timestamp: 1,
            entry_id: "1-0".to_string(),
        }
    }

    fn publisher(sink: Arc<RecordingSink>) -> (FlushPublisher, SharedAggregator, Arc<PipelineStats>) {
        let aggregator = CandleAggregator::shared();
        let stats = Arc::new(PipelineStats::new());
        let publisher = FlushPublisher::new(
            aggregator.clone(),
            sink,
            stats.clone(),
            Duration::from_millis(150),
            Duration::from_secs(30),
        );
        (publisher, aggregator, stats)
    }

    #[test]
    fn test_flush_publishes_active_symbols_only() {
        let sink = Arc::new(RecordingSink::default());
        let (publisher, aggregator, _) = publisher(sink.clone());

        lock_aggregator(&aggregator).apply_tick(&tick("AAPL", 100.0, 10.0));
        assert_eq!(publisher.flush_once(), 1);
        assert_eq!(publisher.flush_once(), 0);
        assert_eq!(sink.published.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_publish_failure_still_clears_window() {
        let sink = Arc::new(RecordingSink {
            fail_symbol: Some("MSFT".to_string()),
            ..Default::default()
        });
        let (publisher, aggregator, stats) = publisher(sink.clone());

        {
            let mut agg = lock_aggregator(&aggregator);
            agg.apply_tick(&tick("AAPL", 1.0, 1.0));
            agg.apply_tick(&tick("MSFT", 2.0, 1.0));
        }
        assert_eq!(publisher.flush_once(), 1);
        assert_eq!(lock_aggregator(&aggregator).active_symbols(), 0);

        let snapshot = stats.take();
        assert_eq!(snapshot.publishes, 1);
        assert_eq!(snapshot.publish_errors, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_flushes_periodically() {
        let sink = Arc::new(RecordingSink::default());
        let (publisher, aggregator, _) = publisher(sink.clone());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(publisher.run(shutdown_rx));

        lock_aggregator(&aggregator).apply_tick(&tick("AAPL", 1.0, 1.0));
        tokio::time::sleep(Duration::from_millis(200)).await;
        lock_aggregator(&aggregator).apply_tick(&tick("AAPL", 2.0, 1.0));
        tokio::time::sleep(Duration::from_millis(200)).await;

        shutdown_tx.send(true).unwrap();
        task.await.unwrap();

        let published = sink.published.lock().unwrap();
        assert_eq!(published.len(), 2);
        assert_eq!(published[0].1.c, 1.0);
        assert_eq!(published[1].1.o, 2.0);
    }
}
