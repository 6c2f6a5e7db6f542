//! `smartreq` is a pooled HTTP client runtime that learns how each destination
//! behaves and adapts its retries and headers to it.
//!
//! Every logical request runs a bounded loop: headers are prepared from a
//! baseline (optionally extended by an advisory backend once a destination
//! has failed), the request is dispatched over a per-destination slot pool,
//! the response is classified as success, bot challenge, block or error, the
//! destination's statistics are updated, and challenges and blocks are
//! retried after a delay with a rotated `User-Agent`.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::time::Duration;
//! use smartreq::blocking::Client;
//! use smartreq::{BlockingPolicy, PoolConfig, RetryAdvisor};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = Client::builder()
//!         .num_pools(10)
//!         .pool_config(
//!             PoolConfig::default()
//!                 .with_max_size(4)
//!                 .with_blocking_policy(BlockingPolicy::Block),
//!         )
//!         .request_timeout(Duration::from_secs(10))
//!         .retry_advisor(RetryAdvisor::standard().max_attempts(3))
//!         .try_build()?;
//!
//!     let response = client.get("http://example.com/").send()?;
//!     println!("{} {}", response.status(), response.classification());
//!
//!     let insights = client.domain_insights("example.com");
//!     println!("success rate {:.2}", insights.success_rate);
//!     Ok(())
//! }
//! ```
//!
//! # Features
//!
//! - `blocking`: thread-blocking [`blocking::Client`].
//! - `async`: tokio-based [`AsyncClient`].
//! - `gemini`: the bundled [`GeminiBackend`] advisory provider.

mod core;
mod response;

#[cfg(feature = "_async")]
mod async_client;
#[cfg(feature = "_blocking")]
mod blocking_client;

pub(crate) use crate::core::{
    advisory, classify, config, destination, error, execution, extensions, insights, metrics,
    observe, pool, registry, retry, transport, util,
};
#[cfg(feature = "_blocking")]
pub(crate) use crate::core::wire;

#[cfg(feature = "_async")]
pub use crate::async_client::{
    AsyncClient, AsyncClientBuilder, AsyncPooledConnection, AsyncRequestBuilder, AsyncSlotPool,
    TokioTcpTransport,
};
#[cfg(feature = "gemini")]
pub use crate::advisory::GeminiBackend;
pub use crate::advisory::{
    AdvisoryBackend, AdvisoryConfig, AdvisoryProvider, DEFAULT_GEMINI_MODEL,
};
pub use crate::classify::{
    AnomalyReport, CHALLENGE_MARKERS, Classification, classify, detect_anomaly,
};
pub use crate::config::{
    BlockingPolicy, DEFAULT_CONNECT_TIMEOUT, DEFAULT_NUM_POOLS, DEFAULT_POOL_MAX_SIZE,
    DEFAULT_REQUEST_TIMEOUT, PoolConfig, PoolOverrides,
};
pub use crate::destination::{Destination, Scheme};
pub use crate::error::{Error, ErrorCode, TransportErrorKind};
pub use crate::execution::RequestOptions;
pub use crate::extensions::{HstsPolicy, MemoryHsts, NoHsts};
pub use crate::insights::{
    DEFAULT_SUGGESTED_TIMEOUT, DestinationInsights, DomainInsights, HISTORY_LIMIT, HistoryEntry,
    INITIAL_AVG_DELAY_SECONDS, InsightsStore, OptimizedParams, insights_key, optimize_params_for,
};
pub use crate::metrics::MetricsSnapshot;
pub use crate::observe::{AttemptContext, Observer};
pub use crate::pool::PoolStatus;
pub use crate::registry::{ManagedPool, PoolRegistry};
pub use crate::response::Response;
pub use crate::retry::{DEFAULT_MAX_ATTEMPTS, RetryAdvisor, RetryDecision};
#[cfg(feature = "_async")]
pub use crate::transport::{AsyncConnection, AsyncTransportFactory};
pub use crate::transport::{Connection, TransportFactory, WireRequest, WireResponse};

/// Thread-blocking client, pool and transport.
#[cfg(feature = "_blocking")]
pub mod blocking {
    pub use crate::blocking_client::{
        Client, ClientBuilder, PooledConnection, RequestBuilder, SlotPool, TcpTransport,
    };
}

pub type Result<T> = std::result::Result<T, Error>;

pub mod prelude {
    #[cfg(feature = "_async")]
    pub use crate::AsyncClient;
    #[cfg(feature = "_blocking")]
    pub use crate::blocking::Client;
    pub use crate::{
        BlockingPolicy, Classification, DomainInsights, Error, ErrorCode, PoolConfig,
        RequestOptions, Response, RetryAdvisor, RetryDecision, TransportErrorKind,
    };
}
