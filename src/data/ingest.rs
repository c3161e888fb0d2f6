use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use log::{info, warn, error, debug};

use crate::data::candles::{lock_aggregator, SharedAggregator};
use crate::data::stream::{LogError, ReadCursor, TickLog};
use crate::data::stats::PipelineStats;
use crate::data::tick::TradeTick;

#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub group: String,
    pub consumer: String,
    pub batch_size: usize,
    pub block: Duration,
    pub retry_delay: Duration,
}

/// Reads ticks from the upstream log as a named consumer-group member and
/// feeds them into the shared aggregator. Entries are acknowledged only after
/// they have been applied, so a crash in between redelivers them.
pub struct StreamIngestConsumer {
    log: Arc<dyn TickLog>,
    aggregator: SharedAggregator,
    stats: Arc<PipelineStats>,
    config: IngestConfig,
    cursor: ReadCursor,
}

impl StreamIngestConsumer {
    pub fn new(
        log: Arc<dyn TickLog>,
        aggregator: SharedAggregator,
        stats: Arc<PipelineStats>,
        config: IngestConfig,
    ) -> Self {
        Self {
            log,
            aggregator,
            stats,
            config,
            // first drain whatever a previous run of this consumer left unacknowledged
            cursor: ReadCursor::Pending,
        }
    }

    pub fn cursor(&self) -> ReadCursor {
        self.cursor
    }

    /// Runs until the shutdown signal flips. Never returns on upstream errors.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            "Ingest consumer {} joining group {} (batch {}, block {:?})",
            self.config.consumer, self.config.group, self.config.batch_size, self.config.block
        );
        if let Err(e) = self.log.create_group(&self.config.group).await {
            warn!("Initial group creation failed, will retry on read: {}", e);
        }

        loop {
            if *shutdown.borrow() {
                break;
            }
            let result = tokio::select! {
                _ = shutdown.changed() => break,
                result = self.poll_once() => result,
            };
            if let Err(e) = result {
                let delay = self.recover(&e).await;
                if !delay.is_zero() {
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        info!("Ingest consumer {} stopped", self.config.consumer);
    }

    /// Reads one batch, applies every valid tick and acknowledges it.
    /// Returns the number of ticks applied.
    pub async fn poll_once(&mut self) -> Result<usize, LogError> {
        let block = match self.cursor {
            ReadCursor::Pending => Duration::ZERO,
            ReadCursor::New => self.config.block,
        };
        let batch = self
            .log
            .read_group(&self.config.group, &self.config.consumer, self.cursor, self.config.batch_size, block)
            .await?;

        if batch.is_empty() {
            if self.cursor == ReadCursor::Pending {
                debug!("No pending entries left for {}, switching to new entries", self.config.consumer);
                self.cursor = ReadCursor::New;
            }
            return Ok(0);
        }

        let mut applied = 0;
        for entry in batch {
            match TradeTick::from_fields(&entry.id, &entry.fields) {
                Ok(tick) => {
                    lock_aggregator(&self.aggregator).apply_tick(&tick);
                    self.stats.record_applied();
                    applied += 1;
                }
                Err(e) => {
                    // a malformed entry never becomes valid, acknowledge it so it is not redelivered
                    warn!("Skipping malformed tick {}: {}", entry.id, e);
                    self.stats.record_malformed();
                }
            }

            if let Err(e) = self.log.ack(&self.config.group, &entry.id).await {
                warn!("Failed to acknowledge {}: {}", entry.id, e);
                self.stats.record_ack_error();
                // a pending entry left unacknowledged comes straight back on the next read
                if matches!(e, LogError::NoGroup(_)) || self.cursor == ReadCursor::Pending {
                    return Err(e);
                }
            }
        }
        Ok(applied)
    }

    /// Handles a read error and returns how long to wait before the next read.
    async fn recover(&mut self, err: &LogError) -> Duration {
        self.stats.record_read_error();
        match err {
            LogError::NoGroup(group) => {
                warn!("Consumer group {} missing, recreating it", group);
                match self.log.create_group(group).await {
                    Ok(()) => {
                        self.cursor = ReadCursor::Pending;
                        Duration::ZERO
                    }
                    Err(e) => {
                        error!("Failed to recreate consumer group {}: {}", group, e);
                        self.config.retry_delay
                    }
                }
            }
            LogError::Unavailable(reason) => {
                error!(
                    "Upstream log read failed: {}. Retrying in {:?}",
                    reason, self.config.retry_delay
                );
                self.config.retry_delay
            }
        }
    }
}
