//! Continuous batch scheduling for annotation work.
//!
//! Items waiting in tabular sources (one row per item, a trigger column marking it ready)
//! are grouped into small units and submitted to an asynchronous batch-inference API.
//! A daemon keeps a bounded number of batches outstanding, polls them, and writes each
//! item's result back to the row it came from. Sources that deny access are put in a
//! cooldown without affecting the others; reference artifacts sent along with every
//! batch are cached by content hash.
//!
//! ```no_run
//! use std::sync::Arc;
//! use volley::{AnthropicBatchClient, AppConfig, Daemon, ShutdownSignals, TsvSource};
//!
//! # async fn run() -> volley::Result<()> {
//! let config = AppConfig::load("volley.toml".as_ref())?;
//! let source = Arc::new(TsvSource::new("sheets", &config.daemon.trigger_field));
//! let client = Arc::new(AnthropicBatchClient::new(config.inference.clone())?);
//! let daemon = Arc::new(
//!     Daemon::builder(source, client, config.daemon.clone())
//!         .sources(config.sources.clone())
//!         .cache_config(config.cache.clone())
//!         .build()?,
//! );
//! daemon.run(ShutdownSignals::new()).await
//! # }
//! ```

pub mod aggregator;
pub mod cache;
pub mod clock;
pub mod config;
pub mod daemon;
pub mod domain;
pub mod error;
pub mod fetch;
pub mod guard;
pub mod inference;
pub mod metrics;
pub mod source;
pub mod tracker;

// Re-export commonly used types
pub use aggregator::{TriggerFilter, WorkAggregator};
pub use cache::{CacheEntry, CacheLookup, ContentCache, ContentChanged};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{AppConfig, CacheConfig, InferenceConfig, SourceConfig};
pub use daemon::{
    BatchOutcome, CompletionHookFn, Daemon, DaemonBuilder, DaemonConfig, DaemonStats,
    SchedulerContext, SchedulerStatus, ShutdownSignals, TickSummary,
};
pub use domain::*;
pub use error::{Result, VolleyError};
pub use fetch::{MockReferenceFetcher, NoReferences, ReferenceFetcher};
pub use guard::SourceAccessGuard;
pub use inference::{
    AnthropicBatchClient, BatchPoll, BatchRequest, InferenceClient, ItemOutcome, ItemResult,
    MockInferenceClient, PollStatus, SharedContext,
};
#[cfg(feature = "metrics")]
pub use metrics::VolleyMetrics;
pub use source::{MemorySource, RowFields, TabularSource, TsvSource};
pub use tracker::{ClaimSet, InFlightTracker};
