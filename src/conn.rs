//! The per-connection engine.
//!
//! Each accepted socket runs one `Connection` as its own task, walking
//! the same states for every request: read head, authenticate, match,
//! stream the body in, run the handler, stream the response out, then
//! either loop for the next request on the connection or close.
//! Requests on one connection are strictly serialized; pipelined bytes
//! simply wait in the read buffer.

use std::io::Write as _;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::SystemTime;

use bytes::{Buf, BytesMut};
use http::{header, Method, StatusCode};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use url::Url;

use crate::codec::{self, encode_chunk, encode_final_chunk, Head};
use crate::conditional::not_modified;
use crate::errors::{HttpError, HttpResult};
use crate::pipeline::Pipeline;
use crate::request::{Request, RequestHead};
use crate::response::Response;
use crate::server::ServerInner;
use crate::util::systemtime_to_httpdate;

// Bodies drained to keep a connection alive after an early error; a
// larger body forces a close instead.
const DRAIN_LIMIT: u64 = 1 << 20;

/// Per-exchange facts needed for response framing even when request
/// construction failed.
struct Exchange {
    http10: bool,
    is_head: bool,
    client_close: bool,
    accepts_gzip: bool,
}

impl Exchange {
    fn from_head(head: &Head) -> Exchange {
        let conn = head
            .headers
            .get(header::CONNECTION)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_ascii_lowercase())
            .unwrap_or_default();
        let client_close =
            conn.contains("close") || (head.http10 && !conn.contains("keep-alive"));
        let accepts_gzip = head
            .headers
            .get(header::ACCEPT_ENCODING)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_ascii_lowercase().contains("gzip"))
            .unwrap_or(false);
        Exchange {
            http10: head.http10,
            is_head: head.method == Method::HEAD,
            client_close,
            accepts_gzip,
        }
    }

    // For errors before the request line parsed; always closes.
    fn fallback() -> Exchange {
        Exchange {
            http10: false,
            is_head: false,
            client_close: true,
            accepts_gzip: false,
        }
    }
}

pub(crate) struct Connection {
    stream: TcpStream,
    buf: BytesMut,
    server: Arc<ServerInner>,
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
    shutdown: watch::Receiver<bool>,
    wrote_status: bool,
}

impl Connection {
    pub(crate) fn new(
        stream: TcpStream,
        server: Arc<ServerInner>,
        local_addr: SocketAddr,
        remote_addr: SocketAddr,
        shutdown: watch::Receiver<bool>,
    ) -> Connection {
        Connection {
            stream,
            buf: BytesMut::with_capacity(8 * 1024),
            server,
            local_addr,
            remote_addr,
            shutdown,
            wrote_status: false,
        }
    }

    /// Serve requests until the peer goes away, a fatal error occurs,
    /// or the server shuts down.
    pub(crate) async fn serve(mut self) {
        trace!("open connection from {}", self.remote_addr);
        loop {
            self.wrote_status = false;
            match self.one_exchange().await {
                Ok(true) => continue,
                Ok(false) => break,
                Err(e) => {
                    debug!("connection {}: {}", self.remote_addr, e);
                    break;
                }
            }
        }
        let _ = self.stream.shutdown().await;
        trace!("closed connection from {}", self.remote_addr);
    }

    async fn one_exchange(&mut self) -> HttpResult<bool> {
        let head_bytes = match self.read_head().await {
            Ok(Some(b)) => b,
            Ok(None) => return Ok(false),
            Err(e) => return self.write_error(e, &Exchange::fallback()).await,
        };

        let head = match codec::parse_head(&head_bytes) {
            Ok(h) => h,
            Err(e) => return self.write_error(e, &Exchange::fallback()).await,
        };
        let ex = Exchange::from_head(&head);

        let request_head = match self.request_head(head) {
            Ok(h) => h,
            Err(e) => return self.write_error(e, &ex).await,
        };

        match self.process_request(&request_head, &ex).await {
            Ok(keep) => Ok(keep),
            Err(e) => self.write_error(e, &ex).await,
        }
    }

    /// Read buffered bytes until the blank line that ends the header
    /// section. `None` means the connection is done (clean EOF, idle
    /// timeout, or shutdown).
    async fn read_head(&mut self) -> HttpResult<Option<BytesMut>> {
        let config = &self.server.config;
        loop {
            // Bounds apply whether or not the head is complete yet.
            match find(&self.buf, b"\r\n") {
                Some(eol) if eol > config.max_uri_length => {
                    return Err(HttpError::StatusClose(StatusCode::URI_TOO_LONG))
                }
                None if self.buf.len() > config.max_uri_length => {
                    return Err(HttpError::StatusClose(StatusCode::URI_TOO_LONG))
                }
                _ => {}
            }
            if let Some(pos) = find(&self.buf, b"\r\n\r\n") {
                if pos + 4 > config.max_header_size {
                    return Err(HttpError::StatusClose(
                        StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE,
                    ));
                }
                let mut head = self.buf.split_to(pos + 4);
                head.truncate(pos + 2);
                return Ok(Some(head));
            }
            if self.buf.len() > config.max_header_size {
                return Err(HttpError::StatusClose(
                    StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE,
                ));
            }

            // Idle wait for the first byte of a request, a shorter
            // timer once the head started arriving.
            let dur = if self.buf.is_empty() {
                config.keep_alive_timeout
            } else {
                config.read_header_timeout
            };
            let n = tokio::select! {
                r = tokio::time::timeout(dur, self.stream.read_buf(&mut self.buf)) => {
                    match r {
                        Err(_) => return Ok(None),
                        Ok(Ok(n)) => n,
                        Ok(Err(e)) => return Err(e.into()),
                    }
                }
                _ = self.shutdown.changed() => return Ok(None),
            };
            if n == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Err(HttpError::StatusClose(StatusCode::BAD_REQUEST));
            }
        }
    }

    /// Promote the parsed head to a [`RequestHead`] with an absolute
    /// URL derived from the server binding and the Host header.
    fn request_head(&self, head: Head) -> HttpResult<RequestHead> {
        let host = head
            .headers
            .get(header::HOST)
            .and_then(|v| v.to_str().ok())
            .map(|h| h.trim().to_string())
            .unwrap_or_else(|| self.local_addr.to_string());
        let url = Url::parse(&format!("http://{}{}", host, head.target))
            .map_err(|_| HttpError::StatusClose(StatusCode::BAD_REQUEST))?;
        Ok(RequestHead {
            method: head.method,
            url,
            path: head.path,
            query: head.query,
            headers: head.headers,
            http10: head.http10,
            local_addr: self.local_addr,
            remote_addr: self.remote_addr,
        })
    }

    async fn process_request(
        &mut self,
        request_head: &RequestHead,
        ex: &Exchange,
    ) -> HttpResult<bool> {
        debug!(
            "== START {} {} from {}",
            request_head.method, request_head.path, self.remote_addr
        );

        // Validate body framing before anything else; this rejects a
        // negative Content-Length and chunked-plus-length right away.
        // The body cannot be consumed after such an error, so the
        // connection has to close.
        if let Err(e) = Request::new(request_head) {
            return Err(HttpError::StatusClose(e.statuscode()));
        }

        // Authenticate.
        if let Some(auth) = &self.server.auth {
            if let Err(challenge) = auth.check(request_head) {
                debug!("== END {} 401", request_head.path);
                let drained = self.drain_body(request_head).await;
                let mut resp =
                    Response::error(StatusCode::UNAUTHORIZED, "Authentication required");
                resp.set_header("WWW-Authenticate", &challenge);
                let keep = self.write_response(resp, ex).await?;
                return Ok(keep && drained);
            }
        }

        // Match, with the optional HEAD-to-GET mapping.
        let mut match_head = request_head.clone();
        if ex.is_head && self.server.config.map_head_to_get {
            match_head.method = Method::GET;
        }
        let Some((mut request, process)) = self.server.registry.find(&match_head) else {
            let status = self.server.registry.no_match_status(&match_head);
            debug!("== END {} {}", request_head.path, status);
            let drained = self.drain_body(request_head).await;
            let resp = Response::error(status, "No handler for this request");
            let keep = self.write_response(resp, ex).await?;
            return Ok(keep && drained);
        };

        // Stream the request body through the decoding pipeline.
        if request.has_body() {
            let cap = self.server.config.max_body_size;
            self.read_body(&mut request, cap, StatusCode::PAYLOAD_TOO_LARGE)
                .await?;
        }

        // Facts needed after the handler consumed the request.
        let if_none_match = request.if_none_match().map(str::to_string);
        let if_modified_since = request.if_modified_since();

        // Invoke the handler. On shutdown the in-flight handler still
        // runs to completion, but its response is discarded.
        let mut fut = process(request);
        let response = tokio::select! {
            r = &mut fut => r,
            _ = self.shutdown.changed() => {
                tokio::spawn(async move {
                    let _ = fut.await;
                });
                return Ok(false);
            }
        };
        let mut response = response.ok_or_else(|| {
            HttpError::Message(
                StatusCode::INTERNAL_SERVER_ERROR,
                "handler produced no response".to_string(),
            )
        })?;

        // Conditional fast path: substitute a 304 before any body
        // bytes are produced.
        if response.has_body()
            && not_modified(if_none_match.as_deref(), if_modified_since, &response)
        {
            let mut nm = Response::new(StatusCode::NOT_MODIFIED);
            if let Some(etag) = response.etag() {
                nm.set_etag(etag.to_string());
            }
            if let Some(lm) = response.last_modified() {
                nm.set_last_modified(lm);
            }
            response = nm;
        }

        debug!("== END {} {}", request_head.path, response.status());
        self.write_response(response, ex).await
    }

    /// Run the ingest pipeline until the declared length or the chunk
    /// terminator is reached.
    async fn read_body(
        &mut self,
        request: &mut Request,
        cap: Option<u64>,
        cap_status: StatusCode,
    ) -> HttpResult<()> {
        let chunked = request.is_chunked();
        let encoding = request.body_encoding();
        let content_length = request.content_length();

        if let (Some(cap), Some(len)) = (cap, content_length) {
            if len > cap {
                return Err(HttpError::StatusClose(cap_status));
            }
        }

        let read_timeout = self.server.config.read_header_timeout;
        let mut pipe = Pipeline::new(request.sink_mut(), chunked, encoding);
        pipe.open()?;

        let mut remaining = content_length.unwrap_or(0);
        let mut total: u64 = 0;
        loop {
            if !chunked && remaining == 0 {
                break;
            }
            if self.buf.is_empty() {
                let n = tokio::time::timeout(
                    read_timeout,
                    self.stream.read_buf(&mut self.buf),
                )
                .await
                .map_err(|_| HttpError::StatusClose(StatusCode::REQUEST_TIMEOUT))??;
                if n == 0 {
                    // Client EOF before the body completed.
                    return Err(HttpError::StatusClose(StatusCode::BAD_REQUEST));
                }
            }

            let consumed = if chunked {
                let n = pipe.write(&self.buf[..])?;
                self.buf.advance(n);
                n
            } else {
                let take = (remaining as usize).min(self.buf.len());
                pipe.write(&self.buf[..take])?;
                self.buf.advance(take);
                remaining -= take as u64;
                take
            };
            total += consumed as u64;
            if let Some(cap) = cap {
                if total > cap {
                    return Err(HttpError::StatusClose(cap_status));
                }
            }
            if chunked && pipe.chunked_done() {
                break;
            }
        }
        pipe.close()
    }

    /// Consume an unread request body so the connection stays usable
    /// after an early error response. Returns false when the body is
    /// too large to be worth draining; the caller closes instead.
    async fn drain_body(&mut self, request_head: &RequestHead) -> bool {
        let mut request = match Request::new(request_head) {
            Ok(r) => r,
            Err(_) => return false,
        };
        if !request.has_body() {
            return true;
        }
        if request.content_length().map_or(false, |l| l > DRAIN_LIMIT) {
            return false;
        }
        self.read_body(&mut request, Some(DRAIN_LIMIT), StatusCode::PAYLOAD_TOO_LARGE)
            .await
            .is_ok()
    }

    async fn write_error(&mut self, err: HttpError, ex: &Exchange) -> HttpResult<bool> {
        if self.wrote_status {
            // The status line is on the wire; the error can no longer
            // be signaled. Close.
            debug!("late error on {}: {}", self.remote_addr, err);
            return Ok(false);
        }
        let resp = Response::from_error(&err);
        let keep = self.write_response(resp, ex).await?;
        Ok(keep && !err.must_close())
    }

    /// Write status line, headers and body. Returns whether the
    /// connection may be kept alive.
    async fn write_response(
        &mut self,
        mut response: Response,
        ex: &Exchange,
    ) -> HttpResult<bool> {
        let status = response.status();
        let no_body_status = status.is_informational()
            || status == StatusCode::NO_CONTENT
            || status == StatusCode::NOT_MODIFIED;
        let has_body = response.has_body() && !no_body_status;

        let gzip = has_body && ex.accepts_gzip && response.gzip_content_encoding();
        if gzip {
            // The compressed length is unknown in advance.
            response.clear_content_length();
        }
        let chunked = has_body && response.content_length().is_none() && !ex.http10;
        // An HTTP/1.0 body of unknown length is delimited by the close.
        let close_delimited =
            has_body && response.content_length().is_none() && ex.http10;

        let shutting_down = *self.shutdown.borrow();
        let keep_alive =
            !ex.client_close && !ex.http10 && !close_delimited && !shutting_down;

        let mut out = BytesMut::with_capacity(512);
        out.extend_from_slice(
            format!(
                "HTTP/1.1 {} {}\r\n",
                status.as_u16(),
                status.canonical_reason().unwrap_or("")
            )
            .as_bytes(),
        );
        let mut hdr = |name: &str, value: &str| {
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(b"\r\n");
        };
        hdr("Server", &self.server.config.server_name);
        hdr("Date", &systemtime_to_httpdate(SystemTime::now()));
        hdr("Connection", if keep_alive { "keep-alive" } else { "close" });
        if has_body {
            if let Some(ct) = response.content_type() {
                hdr("Content-Type", ct);
            }
            if gzip {
                hdr("Content-Encoding", "gzip");
            }
            if chunked {
                hdr("Transfer-Encoding", "chunked");
            } else if let Some(len) = response.content_length() {
                hdr("Content-Length", &len.to_string());
            }
        } else if !no_body_status {
            hdr("Content-Length", "0");
        }
        if let Some(age) = response.cache_max_age() {
            if age == 0 {
                hdr("Cache-Control", "no-cache");
            } else {
                hdr("Cache-Control", &format!("max-age={age}"));
            }
        }
        if let Some(lm) = response.last_modified() {
            hdr("Last-Modified", &systemtime_to_httpdate(lm));
        }
        if let Some(etag) = response.etag() {
            hdr("ETag", etag);
        }
        for (name, value) in response.headers() {
            if let Ok(value) = value.to_str() {
                hdr(name.as_str(), value);
            }
        }
        out.extend_from_slice(b"\r\n");

        self.wrote_status = true;
        self.stream.write_all(&out).await?;

        if has_body && !ex.is_head {
            self.write_body(&mut response, gzip, chunked).await?;
        } else {
            response.body_mut().close().await;
        }
        self.stream.flush().await?;
        Ok(keep_alive)
    }

    /// Pull body chunks and put them on the wire, compressing and/or
    /// chunk-framing along the way.
    async fn write_body(
        &mut self,
        response: &mut Response,
        gzip: bool,
        chunked: bool,
    ) -> HttpResult<()> {
        response.body_mut().open().await?;
        let mut encoder = gzip.then(|| {
            flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default())
        });
        let mut frame = BytesMut::new();
        loop {
            let chunk = response.body_mut().read_chunk().await;
            let chunk = match chunk {
                Ok(c) => c,
                Err(e) => {
                    response.body_mut().close().await;
                    return Err(e);
                }
            };
            if chunk.is_empty() {
                break;
            }
            let payload = match &mut encoder {
                Some(enc) => {
                    enc.write_all(&chunk)
                        .and_then(|_| enc.flush())
                        .map_err(HttpError::Io)?;
                    std::mem::take(enc.get_mut())
                }
                None => chunk.to_vec(),
            };
            if payload.is_empty() {
                continue;
            }
            if chunked {
                frame.clear();
                encode_chunk(&mut frame, &payload);
                self.stream.write_all(&frame).await?;
            } else {
                self.stream.write_all(&payload).await?;
            }
        }
        response.body_mut().close().await;

        if let Some(enc) = encoder.take() {
            let tail = enc.finish().map_err(HttpError::Io)?;
            if !tail.is_empty() {
                if chunked {
                    frame.clear();
                    encode_chunk(&mut frame, &tail);
                    self.stream.write_all(&frame).await?;
                } else {
                    self.stream.write_all(&tail).await?;
                }
            }
        }
        if chunked {
            frame.clear();
            encode_final_chunk(&mut frame);
            self.stream.write_all(&frame).await?;
        }
        Ok(())
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}
