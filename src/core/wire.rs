//! HTTP/1.1 request encoding and an incremental response decoder for the
//! blocking transport. Heads and chunk sizes are parsed by `httparse`; the
//! decoder never touches a socket: the transport feeds it whatever it reads
//! and calls `finish` on EOF.

use std::io;

use bytes::{Buf, Bytes, BytesMut};
use http::header::{CONNECTION, CONTENT_LENGTH, HOST, HeaderName, HeaderValue, TRANSFER_ENCODING};
use http::{HeaderMap, Method, StatusCode, Version};

use crate::transport::{WireRequest, WireResponse};

const MAX_HEAD_BYTES: usize = 64 * 1024;
const MAX_HEADERS: usize = 100;

pub(crate) fn encode_request(request: &WireRequest, host: &str) -> Vec<u8> {
    let body_len = request.body.as_ref().map_or(0, Bytes::len);
    let mut out = Vec::with_capacity(256 + body_len);
    out.extend_from_slice(request.method.as_str().as_bytes());
    out.push(b' ');
    out.extend_from_slice(request.target.as_bytes());
    out.extend_from_slice(b" HTTP/1.1\r\n");

    if !request.headers.contains_key(HOST) {
        push_header(&mut out, HOST.as_str(), host.as_bytes());
    }
    for (name, value) in &request.headers {
        if name == CONTENT_LENGTH {
            continue;
        }
        push_header(&mut out, name.as_str(), value.as_bytes());
    }
    if let Some(body) = &request.body {
        push_header(
            &mut out,
            CONTENT_LENGTH.as_str(),
            body.len().to_string().as_bytes(),
        );
    } else if [Method::POST, Method::PUT, Method::PATCH].contains(&request.method) {
        push_header(&mut out, CONTENT_LENGTH.as_str(), b"0");
    }
    out.extend_from_slice(b"\r\n");
    if let Some(body) = &request.body {
        out.extend_from_slice(body);
    }
    out
}

fn push_header(out: &mut Vec<u8>, name: &str, value: &[u8]) {
    out.extend_from_slice(name.as_bytes());
    out.extend_from_slice(b": ");
    out.extend_from_slice(value);
    out.extend_from_slice(b"\r\n");
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Framing {
    Empty,
    Length(usize),
    Chunked,
    UntilEof,
}

#[derive(Debug)]
struct Head {
    status: StatusCode,
    headers: HeaderMap,
    framing: Framing,
    keep_alive: bool,
}

/// A complete response and whether the connection may carry another request.
#[derive(Debug)]
pub(crate) struct Decoded {
    pub(crate) response: WireResponse,
    pub(crate) reusable: bool,
}

#[derive(Debug)]
pub(crate) struct ResponseDecoder {
    head_request: bool,
    buffer: BytesMut,
    head: Option<Head>,
}

impl ResponseDecoder {
    pub(crate) fn new(method: &Method) -> Self {
        Self {
            head_request: method == Method::HEAD,
            buffer: BytesMut::with_capacity(8 * 1024),
            head: None,
        }
    }

    /// Buffers `chunk` and returns the response once it is complete.
    pub(crate) fn feed(&mut self, chunk: &[u8]) -> io::Result<Option<Decoded>> {
        self.buffer.extend_from_slice(chunk);
        self.try_decode()
    }

    /// Called when the peer closed the stream.
    pub(crate) fn finish(&mut self) -> io::Result<Decoded> {
        if let Some(decoded) = self.try_decode()? {
            return Ok(decoded);
        }
        match self.head.take() {
            Some(head) if head.framing == Framing::UntilEof => {
                let body = self.buffer.split().freeze();
                Ok(Decoded {
                    response: WireResponse {
                        status: head.status,
                        headers: head.headers,
                        body,
                    },
                    reusable: false,
                })
            }
            Some(_) => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed before response body completed",
            )),
            None => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed before response head",
            )),
        }
    }

    fn try_decode(&mut self) -> io::Result<Option<Decoded>> {
        while self.head.is_none() {
            let Some((head, head_len)) = parse_head(&self.buffer, self.head_request)? else {
                if self.buffer.len() > MAX_HEAD_BYTES {
                    return Err(invalid_data("response head too large"));
                }
                return Ok(None);
            };
            self.buffer.advance(head_len);
            // Interim 1xx responses are skipped; 101 is not supported.
            if head.status.is_informational() {
                if head.status == StatusCode::SWITCHING_PROTOCOLS {
                    return Err(invalid_data("protocol upgrade is not supported"));
                }
                continue;
            }
            self.head = Some(head);
        }

        let framing = match &self.head {
            Some(head) => head.framing,
            None => return Ok(None),
        };
        let body = match framing {
            Framing::Empty => Bytes::new(),
            Framing::Length(length) => {
                if self.buffer.len() < length {
                    return Ok(None);
                }
                self.buffer.split_to(length).freeze()
            }
            Framing::Chunked => match decode_chunked(&self.buffer)? {
                Some((body, consumed)) => {
                    self.buffer.advance(consumed);
                    body
                }
                None => return Ok(None),
            },
            Framing::UntilEof => return Ok(None),
        };

        let Some(head) = self.head.take() else {
            return Ok(None);
        };
        let reusable = head.keep_alive && self.buffer.is_empty();
        Ok(Some(Decoded {
            response: WireResponse {
                status: head.status,
                headers: head.headers,
                body,
            },
            reusable,
        }))
    }
}

fn invalid_data(message: &'static str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message)
}

/// Parses the response head at the start of `buffer`. Returns the head and
/// its length in bytes, or `None` while the head is still incomplete.
fn parse_head(buffer: &[u8], head_request: bool) -> io::Result<Option<(Head, usize)>> {
    let mut slots = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut parsed = httparse::Response::new(&mut slots);
    let head_len = match parsed.parse(buffer) {
        Ok(httparse::Status::Complete(head_len)) => head_len,
        Ok(httparse::Status::Partial) => return Ok(None),
        Err(error) => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("malformed response head: {error}"),
            ));
        }
    };

    let version = match parsed.version {
        Some(0) => Version::HTTP_10,
        _ => Version::HTTP_11,
    };
    let status = parsed
        .code
        .and_then(|code| StatusCode::from_u16(code).ok())
        .ok_or_else(|| invalid_data("invalid status code"))?;

    let mut headers = HeaderMap::with_capacity(parsed.headers.len());
    for header in parsed.headers.iter() {
        let name = HeaderName::from_bytes(header.name.as_bytes())
            .map_err(|_| invalid_data("invalid header name"))?;
        let value = HeaderValue::from_bytes(header.value)
            .map_err(|_| invalid_data("invalid header value"))?;
        headers.append(name, value);
    }

    let framing = framing_for(status, &headers, head_request)?;
    let keep_alive = keep_alive(version, &headers) && framing != Framing::UntilEof;
    Ok(Some((
        Head {
            status,
            headers,
            framing,
            keep_alive,
        },
        head_len,
    )))
}

fn framing_for(status: StatusCode, headers: &HeaderMap, head_request: bool) -> io::Result<Framing> {
    if head_request
        || status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED
    {
        return Ok(Framing::Empty);
    }
    let chunked = headers
        .get_all(TRANSFER_ENCODING)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|coding| coding.trim().eq_ignore_ascii_case("chunked"));
    if chunked {
        return Ok(Framing::Chunked);
    }
    match headers.get(CONTENT_LENGTH) {
        Some(value) => {
            let length = value
                .to_str()
                .ok()
                .and_then(|text| text.trim().parse::<usize>().ok())
                .ok_or_else(|| invalid_data("invalid content-length"))?;
            Ok(if length == 0 {
                Framing::Empty
            } else {
                Framing::Length(length)
            })
        }
        None => Ok(Framing::UntilEof),
    }
}

fn keep_alive(version: Version, headers: &HeaderMap) -> bool {
    let mut tokens = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(str::trim);
    if version == Version::HTTP_10 {
        tokens.any(|token| token.eq_ignore_ascii_case("keep-alive"))
    } else {
        !tokens.any(|token| token.eq_ignore_ascii_case("close"))
    }
}

/// Decodes a full chunked body from the start of `buffer`. Returns the body
/// and the number of bytes consumed, or `None` while more input is needed.
fn decode_chunked(buffer: &[u8]) -> io::Result<Option<(Bytes, usize)>> {
    let mut body = BytesMut::new();
    let mut cursor = 0;
    loop {
        let (line_len, size) = match httparse::parse_chunk_size(&buffer[cursor..]) {
            Ok(httparse::Status::Complete(parsed)) => parsed,
            Ok(httparse::Status::Partial) => return Ok(None),
            Err(_) => return Err(invalid_data("invalid chunk size")),
        };
        let size = usize::try_from(size).map_err(|_| invalid_data("chunk too large"))?;
        cursor += line_len;

        if size == 0 {
            // Trailer section ends with an empty line.
            loop {
                let Some(trailer_len) = find_crlf(&buffer[cursor..]) else {
                    return Ok(None);
                };
                cursor += trailer_len + 2;
                if trailer_len == 0 {
                    return Ok(Some((body.freeze(), cursor)));
                }
            }
        }

        if buffer.len() < cursor + size + 2 {
            return Ok(None);
        }
        body.extend_from_slice(&buffer[cursor..cursor + size]);
        if &buffer[cursor + size..cursor + size + 2] != b"\r\n" {
            return Err(invalid_data("chunk is missing its terminator"));
        }
        cursor += size + 2;
    }
}

fn find_crlf(buffer: &[u8]) -> Option<usize> {
    buffer.windows(2).position(|window| window == b"\r\n")
}
