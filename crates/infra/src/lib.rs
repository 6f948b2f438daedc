//! Infrastructure layer: collaborator contracts, in-memory adapters, retry,
//! rate limiting and configuration.
//!
//! Every collaborator is a capability trait with a small set of named
//! implementations (an in-memory/dev variant here; real adapters live with
//! the deployment) chosen at composition time.

pub mod config;
pub mod images;
pub mod processor;
pub mod queue;
pub mod rate_limit;
pub mod retry;
pub mod sinks;
pub mod store;

pub use config::{
    ConfigError, FitswapConfig, LoggingConfig, RateLimitConfig, WatchConfig, WorkerConfig,
    default_config_toml, load_config, load_config_from_path, load_config_from_str,
};
pub use images::{ImageError, ImageInfo, ImageOwner, ImageService, InMemoryImageService, Visibility};
pub use processor::{ProcessRequest, Processor, ProcessorError, ScriptedProcessor};
pub use queue::{InMemoryWorkQueue, QueueError, WorkQueue, WorkReceiver};
pub use rate_limit::{RateLimited, RateLimiter, SlidingWindowRateLimiter};
pub use retry::{
    BackoffStrategy, Classify, ErrorClass, RetryError, RetryExecutor, RetryPolicies, RetryPolicy,
};
pub use sinks::{
    AuditAction, AuditEntry, AuditSink, ChannelError, ConversionNotice, InMemoryAuditLog,
    InMemoryMetrics, InMemoryNotifier, MetricsSink, MetricsSnapshot, NoticeKind,
    NotificationChannel, NotificationSink, RetryingNotifier, TracingAuditLog, TracingNotifier,
};
pub use store::{ConversionStore, CreatedConversion, InMemoryConversionStore, QuotaDefaults, StoreError};
