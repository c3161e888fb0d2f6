pub mod topic;
pub mod multiplexer;
pub mod broker;
pub mod registry;
pub mod http;
pub mod fallback;
pub mod token;
pub mod feed;

pub use topic::{Payload, Topic};
pub use multiplexer::{Backoff, Effect, MultiplexerCore, Status, fingerprint};
pub use broker::{Broker, MultiplexerConfig, MultiplexerHandle, Port, PortEvent, PortSender, ReconnectNotice};
pub use registry::{CachedValue, Callback, SubscriptionId, SubscriptionRegistry, SubscriptionSink, ValueSource};
pub use http::{BackfillSource, ClientError, Credential, CredentialSource, HttpBackfillSource, HttpCredentialSource};
pub use fallback::QuoteFallbackResolver;
pub use token::{TokenLifecycleCoordinator, TokenTarget};
pub use feed::LiveFeed;
