//! HTTP/1.1 request serialization and response parsing.
//!
//! # Design
//! Parsing is split into sans-IO pieces (`parse_head`, `framing`,
//! `ChunkedDecoder`) that operate on a `BytesMut`, and thin async drivers
//! that refill that buffer from the connection. The buffer belongs to the
//! connection, so bytes read past the end of one response stay with it; a
//! connection with leftover bytes is never reused.
//!
//! Error mapping: an I/O error, or the peer closing before sending anything,
//! is a read failure. Anything that arrives but does not form a complete,
//! well-framed response is a malformed response, with the raw status line as
//! the diagnostic payload.

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::Error;
use crate::http::{Headers, Method, Version};
use crate::request::{Request, Target};
use crate::response::Response;

const MAX_HEADERS: usize = 100;
const MAX_CHUNK_LINE: usize = 4096;
const MAX_STATUS_LINE_EXTRA: usize = 256;
const READ_CHUNK: usize = 8 * 1024;

/// Size caps applied while reading a response.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Limits {
    pub max_head: usize,
    pub max_body: usize,
}

/// Serialize the request line, headers and body.
///
/// `Host` and `User-Agent` are added unless the caller set them. Framing
/// headers are owned by the engine: caller-supplied `Content-Length` and
/// `Transfer-Encoding` are dropped and a `Content-Length` matching the wire
/// body is written instead.
pub(crate) fn encode_request(request: &Request, target: &Target, user_agent: Option<&str>) -> Vec<u8> {
    let body = request.wire_body();
    let headers = request.headers();

    let mut out = Vec::with_capacity(256 + body.len());
    out.extend_from_slice(request.method().as_str().as_bytes());
    out.push(b' ');
    out.extend_from_slice(target.path.as_bytes());
    out.extend_from_slice(b" HTTP/1.1\r\n");

    if !headers.contains("host") {
        push_header(&mut out, "host", &target.authority());
    }
    if let Some(agent) = user_agent {
        if !headers.contains("user-agent") {
            push_header(&mut out, "user-agent", agent);
        }
    }
    for (name, value) in headers.iter() {
        if name.eq_ignore_ascii_case("content-length") || name.eq_ignore_ascii_case("transfer-encoding") {
            continue;
        }
        push_header(&mut out, name, value);
    }
    let expects_body = matches!(request.method(), Method::Post | Method::Put | Method::Patch);
    if !body.is_empty() || expects_body {
        push_header(&mut out, "content-length", &body.len().to_string());
    }
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(body);
    out
}

fn push_header(out: &mut Vec<u8>, name: &str, value: &str) {
    out.extend_from_slice(name.as_bytes());
    out.extend_from_slice(b": ");
    out.extend_from_slice(value.as_bytes());
    out.extend_from_slice(b"\r\n");
}

/// Write an encoded request and flush it.
pub(crate) async fn write_request<W>(io: &mut W, bytes: &[u8]) -> Result<(), Error>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    io.write_all(bytes).await.map_err(Error::write)?;
    io.flush().await.map_err(Error::write)
}

/// Parsed status line and header block.
#[derive(Debug)]
pub(crate) struct Head {
    pub status: u16,
    pub reason: String,
    pub version: Version,
    pub headers: Headers,
}

impl Head {
    fn keep_alive(&self) -> bool {
        match self.version {
            Version::Http11 => !self.headers.has_token("connection", "close"),
            Version::Http10 => self.headers.has_token("connection", "keep-alive"),
        }
    }
}

/// Try to parse a response head from the front of `buf`.
///
/// Returns the head and its length in bytes, or `None` if more input is
/// needed.
pub(crate) fn parse_head(buf: &[u8], max_head: usize) -> Result<Option<(Head, usize)>, Error> {
    let mut storage = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut parsed = httparse::Response::new(&mut storage);
    match parsed.parse(buf) {
        Ok(httparse::Status::Complete(len)) => {
            let status = parsed.code.unwrap_or(0);
            if !(100..=599).contains(&status) {
                return Err(Error::malformed(status_line(buf)));
            }
            let version = match parsed.version {
                Some(0) => Version::Http10,
                Some(1) => Version::Http11,
                _ => return Err(Error::malformed(status_line(buf))),
            };
            let headers = parsed
                .headers
                .iter()
                .map(|h| (h.name.to_string(), String::from_utf8_lossy(h.value).into_owned()))
                .collect();
            let head = Head {
                status,
                reason: parsed.reason.unwrap_or_default().to_string(),
                version,
                headers,
            };
            Ok(Some((head, len)))
        }
        Ok(httparse::Status::Partial) if buf.len() > max_head => Err(Error::malformed(format!(
            "response head exceeds {max_head} bytes"
        ))),
        Ok(httparse::Status::Partial) => Ok(None),
        Err(e) => {
            let mut extra = BytesMut::from(format!("{e}: ").as_bytes());
            extra.extend_from_slice(&status_line(buf));
            Err(Error::malformed(extra.freeze()))
        }
    }
}

/// First line of the buffer, capped, as the diagnostic payload.
fn status_line(buf: &[u8]) -> Bytes {
    let end = buf
        .iter()
        .position(|&b| b == b'\r' || b == b'\n')
        .unwrap_or(buf.len())
        .min(MAX_STATUS_LINE_EXTRA);
    Bytes::copy_from_slice(&buf[..end])
}

/// How the response body is delimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Framing {
    Empty,
    Length(usize),
    Chunked,
    /// Body runs until the peer closes; the connection cannot be reused.
    Close,
}

pub(crate) fn framing(head: &Head, method: Method) -> Result<Framing, Error> {
    if method == Method::Head
        || (100..200).contains(&head.status)
        || head.status == 204
        || head.status == 304
    {
        return Ok(Framing::Empty);
    }
    if head.headers.contains("transfer-encoding") {
        if head.headers.has_token("transfer-encoding", "chunked") {
            return Ok(Framing::Chunked);
        }
        return Ok(Framing::Close);
    }

    let mut length: Option<usize> = None;
    for value in head.headers.get_all("content-length").flat_map(|v| v.split(',')) {
        let parsed: usize = value
            .trim()
            .parse()
            .map_err(|_| Error::malformed(format!("invalid content-length {value:?}")))?;
        match length {
            Some(existing) if existing != parsed => {
                return Err(Error::malformed("conflicting content-length headers"));
            }
            _ => length = Some(parsed),
        }
    }
    Ok(length.map_or(Framing::Close, Framing::Length))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkState {
    Size,
    Data(usize),
    DataEnd,
    Trailer,
    Done,
}

/// Incremental decoder for the chunked transfer coding.
#[derive(Debug)]
pub(crate) struct ChunkedDecoder {
    state: ChunkState,
}

impl ChunkedDecoder {
    pub(crate) fn new() -> Self {
        Self {
            state: ChunkState::Size,
        }
    }

    /// Consume as much of `buf` as possible, appending payload to `out`.
    /// Returns `true` once the last chunk and its trailers are consumed.
    pub(crate) fn decode(&mut self, buf: &mut BytesMut, out: &mut BytesMut) -> Result<bool, Error> {
        loop {
            match self.state {
                ChunkState::Size => {
                    let Some(pos) = find_crlf(buf) else {
                        if buf.len() > MAX_CHUNK_LINE {
                            return Err(Error::malformed("chunk size line too long"));
                        }
                        return Ok(false);
                    };
                    let line = &buf[..pos];
                    let digits = line.split(|&b| b == b';').next().unwrap_or_default();
                    let size = std::str::from_utf8(digits)
                        .ok()
                        .and_then(|s| usize::from_str_radix(s.trim(), 16).ok())
                        .ok_or_else(|| Error::malformed(Bytes::copy_from_slice(line)))?;
                    buf.advance(pos + 2);
                    self.state = if size == 0 {
                        ChunkState::Trailer
                    } else {
                        ChunkState::Data(size)
                    };
                }
                ChunkState::Data(remaining) => {
                    if buf.is_empty() {
                        return Ok(false);
                    }
                    let take = remaining.min(buf.len());
                    out.extend_from_slice(&buf.split_to(take));
                    self.state = if take == remaining {
                        ChunkState::DataEnd
                    } else {
                        ChunkState::Data(remaining - take)
                    };
                }
                ChunkState::DataEnd => {
                    if buf.len() < 2 {
                        return Ok(false);
                    }
                    if &buf[..2] != b"\r\n" {
                        return Err(Error::malformed("missing CRLF after chunk data"));
                    }
                    buf.advance(2);
                    self.state = ChunkState::Size;
                }
                ChunkState::Trailer => {
                    let Some(pos) = find_crlf(buf) else {
                        if buf.len() > MAX_CHUNK_LINE {
                            return Err(Error::malformed("chunk trailer line too long"));
                        }
                        return Ok(false);
                    };
                    buf.advance(pos + 2);
                    if pos == 0 {
                        self.state = ChunkState::Done;
                    }
                }
                ChunkState::Done => return Ok(true),
            }
        }
    }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

/// Pull more bytes into `buf`. Returns the number read; 0 means EOF.
async fn fill<R>(io: &mut R, buf: &mut BytesMut) -> Result<usize, Error>
where
    R: AsyncRead + Unpin + ?Sized,
{
    buf.reserve(READ_CHUNK);
    io.read_buf(buf).await.map_err(Error::read)
}

/// Read one response. Returns it together with whether the connection may
/// carry another exchange.
pub(crate) async fn read_response<R>(
    io: &mut R,
    buf: &mut BytesMut,
    method: Method,
    limits: Limits,
) -> Result<(Response, bool), Error>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let head = loop {
        match parse_head(buf, limits.max_head)? {
            Some((head, len)) => {
                buf.advance(len);
                // Interim responses precede the real one.
                if (100..200).contains(&head.status) && head.status != 101 {
                    continue;
                }
                break head;
            }
            None => {
                if fill(io, buf).await? == 0 {
                    if buf.is_empty() {
                        return Err(Error::read_closed("connection closed before response"));
                    }
                    return Err(Error::malformed(status_line(buf)));
                }
            }
        }
    };

    let framing = framing(&head, method)?;
    let body = match framing {
        Framing::Empty => Bytes::new(),
        Framing::Length(len) => {
            if len > limits.max_body {
                return Err(Error::malformed(format!(
                    "content-length {len} exceeds limit of {} bytes",
                    limits.max_body
                )));
            }
            while buf.len() < len {
                if fill(io, buf).await? == 0 {
                    return Err(Error::malformed(format!(
                        "body ended after {} of {len} bytes",
                        buf.len()
                    )));
                }
            }
            buf.split_to(len).freeze()
        }
        Framing::Chunked => {
            let mut decoder = ChunkedDecoder::new();
            let mut body = BytesMut::new();
            while !decoder.decode(buf, &mut body)? {
                if body.len() > limits.max_body {
                    return Err(Error::malformed(format!(
                        "chunked body exceeds limit of {} bytes",
                        limits.max_body
                    )));
                }
                if fill(io, buf).await? == 0 {
                    return Err(Error::malformed("connection closed inside chunked body"));
                }
            }
            body.freeze()
        }
        Framing::Close => {
            while fill(io, buf).await? != 0 {
                if buf.len() > limits.max_body {
                    return Err(Error::malformed(format!(
                        "body exceeds limit of {} bytes",
                        limits.max_body
                    )));
                }
            }
            buf.split().freeze()
        }
    };

    let reusable = head.keep_alive()
        && head.status != 101
        && framing != Framing::Close
        && buf.is_empty();
    let response = Response::new(head.status, head.reason, head.version, head.headers, body);
    Ok((response, reusable))
}
