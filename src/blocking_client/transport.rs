use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use tracing::trace;

use crate::destination::{Destination, Scheme};
use crate::transport::{Connection, TransportFactory, WireRequest, WireResponse, unsupported_scheme};
use crate::wire::{ResponseDecoder, encode_request};

const READ_CHUNK: usize = 8 * 1024;

/// Plain HTTP/1.1 over `std::net::TcpStream`.
#[derive(Clone, Copy, Debug, Default)]
pub struct TcpTransport;

impl TransportFactory for TcpTransport {
    fn connect(
        &self,
        destination: &Destination,
        timeout: Duration,
    ) -> io::Result<Box<dyn Connection>> {
        if destination.scheme() != Scheme::Http {
            return Err(unsupported_scheme(destination));
        }

        let addresses = destination.socket_authority().to_socket_addrs()?;
        let mut last_error = None;
        for address in addresses {
            match TcpStream::connect_timeout(&address, non_zero(timeout)) {
                Ok(stream) => {
                    stream.set_nodelay(true)?;
                    trace!(%address, "tcp connection established");
                    return Ok(Box::new(TcpConnection {
                        stream,
                        host: destination.host_header(),
                        reusable: true,
                    }));
                }
                Err(error) => last_error = Some(error),
            }
        }
        Err(last_error.unwrap_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("no addresses resolved for {destination}"),
            )
        }))
    }
}

#[derive(Debug)]
struct TcpConnection {
    stream: TcpStream,
    host: String,
    reusable: bool,
}

impl TcpConnection {
    fn exchange(&mut self, request: &WireRequest, timeout: Duration) -> io::Result<WireResponse> {
        let timeout = non_zero(timeout);
        self.stream.set_write_timeout(Some(timeout))?;
        self.stream.set_read_timeout(Some(timeout))?;
        self.stream
            .write_all(&encode_request(request, &self.host))?;
        self.stream.flush()?;

        let mut decoder = ResponseDecoder::new(&request.method);
        let mut chunk = [0_u8; READ_CHUNK];
        loop {
            let read = match self.stream.read(&mut chunk) {
                Ok(read) => read,
                Err(error) if error.kind() == io::ErrorKind::Interrupted => continue,
                Err(error) => return Err(error),
            };
            let decoded = if read == 0 {
                Some(decoder.finish()?)
            } else {
                decoder.feed(&chunk[..read])?
            };
            if let Some(decoded) = decoded {
                self.reusable = decoded.reusable;
                return Ok(decoded.response);
            }
        }
    }
}

impl Connection for TcpConnection {
    fn send(&mut self, request: &WireRequest, timeout: Duration) -> io::Result<WireResponse> {
        self.reusable = false;
        self.exchange(request, timeout)
    }

    fn is_reusable(&self) -> bool {
        self.reusable
    }
}

fn non_zero(timeout: Duration) -> Duration {
    timeout.max(Duration::from_millis(1))
}
