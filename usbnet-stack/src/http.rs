//! Minimal HTTP/1.1 service on top of the TCP endpoint: request-line +
//! header splitter, fixed URL table, fixed or chunked response bodies.
//!
//! A request must arrive complete in one segment; anything truncated closes
//! the connection. Responses are keep-alive, so a connection serves
//! requests until the peer closes or it is idle-evicted.

use core::fmt::Write;

use usbnet::Payload;

use crate::tcp::{ConnCtx, Event, TcpIo, MAX_PAYLOAD};
use crate::wire::TCPIP_HEADER_SIZE;

/// Bytes reserved in front of a chunk for the hex size line.
const CHUNK_PREFIX: usize = 10;
/// Largest chunk body that still fits a pool buffer.
pub const CHUNK_SIZE: usize = MAX_PAYLOAD - CHUNK_PREFIX - 2;

const MAX_ROUTES: usize = 8;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Method {
    Get,
    Post,
}

pub struct HttpRequest<'a> {
    pub method: Method,
    pub path: &'a str,
    pub query: &'a str,
    pub body: &'a [u8],
}

/// URL handler. Called once with `Some(request)` when a request for its
/// path arrives; a handler that starts a chunked response keeps receiving
/// poll calls with `None` until it finishes with [`end_response`].
pub type HttpHandler = fn(&mut TcpIo<'_, '_>, Option<&HttpRequest<'_>>);

/// Per-connection HTTP state parked in the connection slot.
#[derive(Clone, Copy, Default)]
pub struct HttpConn {
    pub handler: Option<HttpHandler>,
    /// Free word for streaming handlers (byte cursor and the like).
    pub cursor: u32,
}

/// Fixed routing table, filled at boot.
pub struct Httpd {
    routes: heapless::Vec<(&'static str, HttpHandler), MAX_ROUTES>,
}

impl Httpd {
    pub(crate) fn new() -> Self {
        Self {
            routes: heapless::Vec::new(),
        }
    }

    pub fn route(&mut self, path: &'static str, handler: HttpHandler) {
        if self.routes.push((path, handler)).is_err() {
            warn!("HTTP route table full, not registering {}", path);
        }
    }

    fn lookup(&self, path: &str) -> Option<HttpHandler> {
        self.routes
            .iter()
            .find(|(p, _)| *p == path)
            .map(|(_, h)| *h)
    }
}

pub(crate) enum ParseOutcome<'a> {
    Request(HttpRequest<'a>),
    BadRequest,
    Incomplete,
}

pub(crate) fn parse(buf: &[u8]) -> ParseOutcome<'_> {
    let mut p = 0;
    while p < buf.len() && buf[p].is_ascii_whitespace() {
        p += 1;
    }

    let method = if buf[p..].starts_with(b"GET ") {
        p += 4;
        Method::Get
    } else if buf[p..].starts_with(b"POST ") {
        p += 5;
        Method::Post
    } else {
        return ParseOutcome::BadRequest;
    };

    while p < buf.len() && buf[p] == b' ' {
        p += 1;
    }
    let path_start = p;
    while p < buf.len() && !buf[p].is_ascii_whitespace() && buf[p] != b'?' {
        p += 1;
    }
    if p >= buf.len() {
        return ParseOutcome::Incomplete;
    }
    let path = &buf[path_start..p];

    let query = if buf[p] == b'?' {
        p += 1;
        let query_start = p;
        while p < buf.len() && !buf[p].is_ascii_whitespace() {
            p += 1;
        }
        if p >= buf.len() {
            return ParseOutcome::Incomplete;
        }
        &buf[query_start..p]
    } else {
        &buf[p..p]
    };

    // Skip the headers; the body begins after the blank line.
    let mut h = p;
    loop {
        if h + 4 > buf.len() {
            return ParseOutcome::Incomplete;
        }
        if &buf[h..h + 4] == b"\r\n\r\n" {
            break;
        }
        h += 1;
    }
    let body = &buf[h + 4..];

    match (core::str::from_utf8(path), core::str::from_utf8(query)) {
        (Ok(path), Ok(query)) => ParseOutcome::Request(HttpRequest {
            method,
            path,
            query,
            body,
        }),
        _ => ParseOutcome::BadRequest,
    }
}

pub(crate) fn service(httpd: &Httpd, io: &mut TcpIo<'_, '_>, event: Event) {
    match event {
        Event::Open => {
            *io.ctx() = ConnCtx::Http(HttpConn::default());
        }
        Event::Closed => {
            *io.ctx() = ConnCtx::None;
        }
        Event::Poll => {
            let handler = match io.ctx() {
                ConnCtx::Http(h) => h.handler,
                _ => None,
            };
            if let Some(handler) = handler {
                handler(io, None);
            }
        }
        Event::Data(payload) => {
            let busy = matches!(io.ctx(), ConnCtx::Http(h) if h.handler.is_some());
            if busy {
                // Pipelined request while a response is streaming; drop it.
                return;
            }
            match parse(&payload) {
                ParseOutcome::Request(request) => {
                    debug!("HTTP {} {:?}", request.path, request.method);
                    match httpd.lookup(request.path) {
                        Some(handler) => {
                            if let ConnCtx::Http(h) = io.ctx() {
                                h.handler = Some(handler);
                                h.cursor = 0;
                            }
                            handler(io, Some(&request));
                        }
                        None => start_response(io, 404, "text/plain", "Not found", true),
                    }
                }
                ParseOutcome::BadRequest => {
                    start_response(io, 400, "text/plain", "Unknown method", true)
                }
                ParseOutcome::Incomplete => {
                    warn!("HTTP closing after invalid request");
                    io.close();
                }
            }
        }
    }
}

fn reason(status: u16) -> &'static str {
    if status == 200 {
        "OK"
    } else {
        "Error"
    }
}

/// Starts a response. With `fixed` the whole body goes out now behind a
/// `Content-Length`; otherwise the transfer is chunked and the handler
/// keeps feeding [`send_chunk`] until [`end_response`].
pub fn start_response(io: &mut TcpIo<'_, '_>, status: u16, content_type: &str, body: &str, fixed: bool) {
    debug!("HTTP response, status={}", status);

    let Some(mut payload) = io.allocate(256 + body.len()) else {
        io.close();
        return;
    };

    let mut ok = if fixed {
        write!(
            payload.writer(),
            "HTTP/1.1 {} {}\r\n\
             Content-Type: {}\r\n\
             Content-Length: {}\r\n\
             Connection: keep-alive\r\n\
             \r\n\
             {}",
            status,
            reason(status),
            content_type,
            body.len(),
            body
        )
    } else {
        write!(
            payload.writer(),
            "HTTP/1.1 {} {}\r\n\
             Content-Type: {}\r\n\
             Transfer-Encoding: chunked\r\n\
             Connection: keep-alive\r\n\
             \r\n",
            status,
            reason(status),
            content_type
        )
    };
    if !fixed && !body.is_empty() && ok.is_ok() {
        ok = write!(payload.writer(), "{:08x}\r\n{}\r\n", body.len(), body);
    }
    if ok.is_err() {
        warn!("HTTP response truncated");
    }

    io.send(payload);

    if fixed {
        if let ConnCtx::Http(h) = io.ctx() {
            h.handler = None;
        }
    }
}

/// Allocates a chunk body with room reserved for the size line and the
/// trailing CRLF.
pub fn allocate_chunk(io: &TcpIo<'_, '_>, size: usize) -> Option<Payload> {
    let packet = io
        .iface
        .pool
        .allocate(TCPIP_HEADER_SIZE + CHUNK_PREFIX + size + 2)?;
    Some(packet.slice(TCPIP_HEADER_SIZE + CHUNK_PREFIX, 2))
}

/// Sends one chunk produced by [`allocate_chunk`].
pub fn send_chunk(io: &mut TcpIo<'_, '_>, chunk: Payload) {
    let body_len = chunk.len();
    let mut packet = chunk.unslice();

    let mut size_line = heapless::String::<CHUNK_PREFIX>::new();
    let _ = write!(size_line, "{:08x}\r\n", body_len);
    packet[TCPIP_HEADER_SIZE..TCPIP_HEADER_SIZE + CHUNK_PREFIX]
        .copy_from_slice(size_line.as_bytes());
    let total = packet.len();
    packet[total - 2..].copy_from_slice(b"\r\n");

    io.send(packet.slice(TCPIP_HEADER_SIZE, 0));
}

/// Terminates a chunked response and detaches the handler.
pub fn end_response(io: &mut TcpIo<'_, '_>) {
    match io.allocate(5) {
        Some(mut payload) => {
            payload.append(b"0\r\n\r\n");
            io.send(payload);
        }
        None => io.close(),
    }
    if let ConnCtx::Http(h) = io.ctx() {
        h.handler = None;
    }
}

/// `/` page: the uptime greeting.
pub fn index(io: &mut TcpIo<'_, '_>, request: Option<&HttpRequest<'_>>) {
    if request.is_none() {
        return;
    }
    let mut text = heapless::String::<64>::new();
    let _ = write!(text, "Hello, time is now {}!\n", io.now().as_micros() as u32);
    start_response(io, 200, "text/plain", &text, true);
}
