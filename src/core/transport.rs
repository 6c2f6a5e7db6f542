//! Byte-stream capabilities the pools are built on. The defaults speak plain
//! HTTP/1.1 over TCP; TLS or HTTP/2 come from an injected factory.

use std::io;
use std::time::Duration;

use bytes::Bytes;
#[cfg(feature = "_async")]
use futures_util::future::BoxFuture;
use http::{HeaderMap, Method, StatusCode};

use crate::destination::Destination;

#[derive(Clone, Debug)]
pub struct WireRequest {
    pub method: Method,
    /// Origin-form target, `/path?query`.
    pub target: String,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
}

#[derive(Clone, Debug)]
pub struct WireResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// One open connection to a destination.
pub trait Connection: Send {
    fn send(&mut self, request: &WireRequest, timeout: Duration) -> io::Result<WireResponse>;

    /// Whether the last exchange left the connection able to carry another
    /// request.
    fn is_reusable(&self) -> bool;
}

impl std::fmt::Debug for dyn Connection {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("Connection")
            .field("reusable", &self.is_reusable())
            .finish()
    }
}

pub trait TransportFactory: Send + Sync {
    fn connect(&self, destination: &Destination, timeout: Duration)
    -> io::Result<Box<dyn Connection>>;
}

#[cfg(feature = "_async")]
pub trait AsyncConnection: Send {
    fn send<'a>(
        &'a mut self,
        request: &'a WireRequest,
        timeout: Duration,
    ) -> BoxFuture<'a, io::Result<WireResponse>>;

    fn is_reusable(&self) -> bool;
}

#[cfg(feature = "_async")]
impl std::fmt::Debug for dyn AsyncConnection {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("AsyncConnection")
            .field("reusable", &self.is_reusable())
            .finish()
    }
}

#[cfg(feature = "_async")]
pub trait AsyncTransportFactory: Send + Sync {
    fn connect<'a>(
        &'a self,
        destination: &'a Destination,
        timeout: Duration,
    ) -> BoxFuture<'a, io::Result<Box<dyn AsyncConnection>>>;
}

pub(crate) fn unsupported_scheme(destination: &Destination) -> io::Error {
    io::Error::new(
        io::ErrorKind::Unsupported,
        format!(
            "{} requires a TLS-capable transport; the default transport speaks plain http",
            destination
        ),
    )
}
