mod client;
mod pool;
mod request;
mod transport;

pub use client::{AsyncClient, AsyncClientBuilder};
pub use pool::{AsyncPooledConnection, AsyncSlotPool};
pub use request::AsyncRequestBuilder;
pub use transport::TokioTcpTransport;
