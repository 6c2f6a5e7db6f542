use std::io;
use std::time::Duration;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use http::header::{CONNECTION, CONTENT_LENGTH, HOST, HeaderValue};
use http::{Request, Uri};
use http_body_util::{BodyExt, Full};
use hyper::client::conn::http1::{self, SendRequest};
use hyper_util::rt::TokioIo;
use tokio::net::TcpStream;
use tracing::{debug, trace};

use crate::destination::{Destination, Scheme};
use crate::transport::{
    AsyncConnection, AsyncTransportFactory, WireRequest, WireResponse, unsupported_scheme,
};

/// Plain HTTP/1.1 over `tokio::net::TcpStream`, framed by hyper's http1
/// client connection.
#[derive(Clone, Copy, Debug, Default)]
pub struct TokioTcpTransport;

impl AsyncTransportFactory for TokioTcpTransport {
    fn connect<'a>(
        &'a self,
        destination: &'a Destination,
        timeout: Duration,
    ) -> BoxFuture<'a, io::Result<Box<dyn AsyncConnection>>> {
        Box::pin(async move {
            if destination.scheme() != Scheme::Http {
                return Err(unsupported_scheme(destination));
            }
            let host = HeaderValue::from_str(&destination.host_header())
                .map_err(|error| io::Error::new(io::ErrorKind::InvalidInput, error))?;
            let authority = destination.socket_authority();
            let stream = tokio::time::timeout(timeout, TcpStream::connect(authority.as_str()))
                .await
                .map_err(|_| {
                    io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!("connect to {destination} timed out"),
                    )
                })??;
            stream.set_nodelay(true)?;

            let (sender, connection) = http1::handshake(TokioIo::new(stream))
                .await
                .map_err(hyper_to_io)?;
            let label = destination.to_string();
            tokio::spawn(async move {
                if let Err(error) = connection.await {
                    debug!(destination = %label, error = %error, "http/1 connection ended with error");
                }
            });
            trace!(destination = %destination, "http/1 connection established");

            Ok(Box::new(HyperConnection {
                sender,
                host,
                reusable: true,
            }) as Box<dyn AsyncConnection>)
        })
    }
}

struct HyperConnection {
    sender: SendRequest<Full<Bytes>>,
    host: HeaderValue,
    reusable: bool,
}

impl HyperConnection {
    async fn exchange(&mut self, request: &WireRequest) -> io::Result<WireResponse> {
        self.sender.ready().await.map_err(hyper_to_io)?;

        let uri: Uri = request
            .target
            .parse()
            .map_err(|error| io::Error::new(io::ErrorKind::InvalidInput, error))?;
        let body = Full::new(request.body.clone().unwrap_or_default());
        let mut outgoing = Request::builder()
            .method(request.method.clone())
            .uri(uri)
            .body(body)
            .map_err(|error| io::Error::new(io::ErrorKind::InvalidInput, error))?;
        let headers = outgoing.headers_mut();
        *headers = request.headers.clone();
        headers.remove(CONTENT_LENGTH);
        headers.entry(HOST).or_insert_with(|| self.host.clone());

        let response = self
            .sender
            .send_request(outgoing)
            .await
            .map_err(hyper_to_io)?;
        let (parts, incoming) = response.into_parts();
        let body = incoming.collect().await.map_err(hyper_to_io)?.to_bytes();

        let close_requested = parts
            .headers
            .get_all(CONNECTION)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .flat_map(|value| value.split(','))
            .any(|token| token.trim().eq_ignore_ascii_case("close"));
        self.reusable = !close_requested && !self.sender.is_closed();

        Ok(WireResponse {
            status: parts.status,
            headers: parts.headers,
            body,
        })
    }
}

impl AsyncConnection for HyperConnection {
    fn send<'a>(
        &'a mut self,
        request: &'a WireRequest,
        timeout: Duration,
    ) -> BoxFuture<'a, io::Result<WireResponse>> {
        Box::pin(async move {
            self.reusable = false;
            match tokio::time::timeout(timeout, self.exchange(request)).await {
                Ok(result) => result,
                Err(_) => Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "timed out waiting for response",
                )),
            }
        })
    }

    fn is_reusable(&self) -> bool {
        self.reusable && !self.sender.is_closed()
    }
}

/// Maps a hyper error onto the `io::ErrorKind` the transport classification
/// understands. An underlying socket error keeps its own kind.
fn hyper_to_io(error: hyper::Error) -> io::Error {
    let mut source = std::error::Error::source(&error);
    while let Some(cause) = source {
        if let Some(io_error) = cause.downcast_ref::<io::Error>() {
            let kind = io_error.kind();
            return io::Error::new(kind, error);
        }
        source = cause.source();
    }

    let kind = if error.is_timeout() {
        io::ErrorKind::TimedOut
    } else if error.is_parse() || error.is_parse_status() {
        io::ErrorKind::InvalidData
    } else if error.is_incomplete_message() || error.is_closed() || error.is_canceled() {
        io::ErrorKind::UnexpectedEof
    } else {
        io::ErrorKind::Other
    };
    io::Error::new(kind, error)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;
    use http::{HeaderMap, Method, StatusCode};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use super::TokioTcpTransport;
    use crate::destination::Destination;
    use crate::transport::{AsyncConnection, AsyncTransportFactory, WireRequest};

    fn get(target: &str) -> WireRequest {
        WireRequest {
            method: Method::GET,
            target: target.to_owned(),
            headers: HeaderMap::new(),
            body: None,
        }
    }

    async fn read_head(stream: &mut tokio::net::TcpStream) -> String {
        let mut raw = Vec::new();
        let mut chunk = [0_u8; 512];
        while !raw.windows(4).any(|window| window == b"\r\n\r\n") {
            let read = stream.read(&mut chunk).await.expect("read request");
            if read == 0 {
                break;
            }
            raw.extend_from_slice(&chunk[..read]);
        }
        String::from_utf8_lossy(&raw).into_owned()
    }

    #[tokio::test(flavor = "current_thread")]
    async fn chunked_response_is_collected_and_host_is_sent() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let address = listener.local_addr().expect("local address");
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.expect("accept");
            let head = read_head(&mut stream).await;
            stream
                .write_all(
                    b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n4\r\nWiki\r\n5\r\npedia\r\n0\r\n\r\n",
                )
                .await
                .expect("write response");
            (head, stream)
        });

        let destination = Destination::parse(&format!("http://{address}/")).expect("destination");
        let mut connection = TokioTcpTransport
            .connect(&destination, Duration::from_secs(1))
            .await
            .expect("connect");
        let response = connection
            .send(&get("/wiki?page=1"), Duration::from_secs(1))
            .await
            .expect("send");

        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(response.body, Bytes::from_static(b"Wikipedia"));
        assert!(connection.is_reusable());

        let (head, _stream) = server.await.expect("server task");
        assert!(head.starts_with("GET /wiki?page=1 HTTP/1.1\r\n"));
        assert!(head.to_ascii_lowercase().contains(&format!("host: {address}")));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn connection_close_response_is_not_reusable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let address = listener.local_addr().expect("local address");
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.expect("accept");
            read_head(&mut stream).await;
            stream
                .write_all(b"HTTP/1.1 403 Forbidden\r\nConnection: close\r\nContent-Length: 2\r\n\r\nno")
                .await
                .expect("write response");
        });

        let destination = Destination::parse(&format!("http://{address}/")).expect("destination");
        let mut connection = TokioTcpTransport
            .connect(&destination, Duration::from_secs(1))
            .await
            .expect("connect");
        let response = connection
            .send(&get("/"), Duration::from_secs(1))
            .await
            .expect("send");

        assert_eq!(response.status, StatusCode::FORBIDDEN);
        assert_eq!(response.body.as_ref(), b"no");
        assert!(!connection.is_reusable());
    }
}
