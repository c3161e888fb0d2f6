pub mod tick;
pub mod candles;
pub mod stream;
pub mod stats;
pub mod ingest;
pub mod pubsub;
pub mod publisher;
pub mod loader;
pub mod controller;

pub use tick::{TradeTick, TickError};
pub use candles::{CandleAggregator, CandleAccumulator, Ohlcv, SharedAggregator};
pub use stream::{LogEntry, LogError, MemoryLog, ReadCursor, TickLog};
pub use stats::{PipelineStats, StatsSnapshot};
pub use ingest::{IngestConfig, StreamIngestConsumer};
pub use pubsub::{PubSubManager, PublishError, channel_topic};
pub use publisher::{BarSink, FlushPublisher};
pub use loader::{TickLoader, TickRow};
pub use controller::{ReplayController, ReplayState, ReplayCommand};
