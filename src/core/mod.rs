pub(crate) mod advisory;
pub(crate) mod classify;
pub(crate) mod config;
pub(crate) mod destination;
pub(crate) mod error;
pub(crate) mod execution;
pub(crate) mod extensions;
pub(crate) mod insights;
pub(crate) mod metrics;
pub(crate) mod observe;
pub(crate) mod pool;
pub(crate) mod registry;
pub(crate) mod retry;
pub(crate) mod transport;
pub(crate) mod util;
#[cfg(feature = "_blocking")]
pub(crate) mod wire;
