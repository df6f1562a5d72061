//! The response handed back by handlers.
//!
//! A response carries its framing metadata (status, content type and
//! length, caching validators) plus a body variant the connection
//! engine pulls lazily: nothing is read from disk or a stream until the
//! headers are on the wire. A response has a body iff it has a content
//! type.

use std::io;
use std::path::PathBuf;
use std::time::SystemTime;

use bytes::Bytes;
use futures_util::stream::{BoxStream, Stream, StreamExt};
use http::header::{HeaderMap, HeaderName, HeaderValue};
use http::StatusCode;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use crate::codec::ByteRange;
use crate::errors::{HttpError, HttpResult};

pub(crate) const READ_BUF_SIZE: usize = 65536;
const OCTET_STREAM: &str = "application/octet-stream";

/// Where response body bytes come from.
pub(crate) enum ResponseBody {
    Empty,
    Bytes(Option<Bytes>),
    File {
        path: PathBuf,
        start: u64,
        remaining: u64,
        file: Option<tokio::fs::File>,
    },
    Stream(BoxStream<'static, io::Result<Bytes>>),
}

impl ResponseBody {
    pub(crate) async fn open(&mut self) -> HttpResult<()> {
        if let ResponseBody::File {
            path, start, file, ..
        } = self
        {
            let mut f = tokio::fs::File::open(&path).await?;
            if *start > 0 {
                f.seek(io::SeekFrom::Start(*start)).await?;
            }
            *file = Some(f);
        }
        Ok(())
    }

    /// The next chunk of body bytes; empty means end of body.
    pub(crate) async fn read_chunk(&mut self) -> HttpResult<Bytes> {
        match self {
            ResponseBody::Empty => Ok(Bytes::new()),
            ResponseBody::Bytes(data) => Ok(data.take().unwrap_or_default()),
            ResponseBody::File {
                remaining, file, ..
            } => {
                if *remaining == 0 {
                    return Ok(Bytes::new());
                }
                let file = file.as_mut().ok_or_else(|| {
                    HttpError::Io(io::Error::new(
                        io::ErrorKind::Other,
                        "file body not opened",
                    ))
                })?;
                let want = (*remaining).min(READ_BUF_SIZE as u64) as usize;
                let mut buf = vec![0u8; want];
                let n = file.read(&mut buf).await?;
                if n == 0 {
                    // The file shrank under us; the declared length can
                    // no longer be honored.
                    return Err(HttpError::Io(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "file truncated while serving",
                    )));
                }
                buf.truncate(n);
                *remaining -= n as u64;
                Ok(Bytes::from(buf))
            }
            ResponseBody::Stream(stream) => match stream.next().await {
                Some(Ok(bytes)) => Ok(bytes),
                Some(Err(e)) => Err(HttpError::Io(e)),
                None => Ok(Bytes::new()),
            },
        }
    }

    pub(crate) async fn close(&mut self) {
        if let ResponseBody::File { file, .. } = self {
            file.take();
        }
    }
}

/// A response under construction or on its way to the wire.
pub struct Response {
    status: StatusCode,
    content_type: Option<String>,
    content_length: Option<u64>,
    headers: HeaderMap,
    cache_max_age: Option<u32>,
    last_modified: Option<SystemTime>,
    etag: Option<String>,
    gzip_enabled: bool,
    body: ResponseBody,
}

impl Response {
    /// An empty response with the given status.
    pub fn new(status: StatusCode) -> Response {
        Response {
            status,
            content_type: None,
            content_length: None,
            headers: HeaderMap::new(),
            cache_max_age: None,
            last_modified: None,
            etag: None,
            gzip_enabled: false,
            body: ResponseBody::Empty,
        }
    }

    /// A 200 response carrying in-memory bytes.
    pub fn with_data(data: impl Into<Bytes>, content_type: impl Into<String>) -> Response {
        let data = data.into();
        let mut resp = Response::new(StatusCode::OK);
        resp.content_type = Some(content_type.into());
        resp.content_length = Some(data.len() as u64);
        resp.body = ResponseBody::Bytes(Some(data));
        resp
    }

    /// An HTML response.
    pub fn html(status: StatusCode, html: impl Into<String>) -> Response {
        let mut resp = Response::with_data(html.into(), "text/html; charset=utf-8");
        resp.status = status;
        resp
    }

    /// A JSON response.
    pub fn json(value: &serde_json::Value) -> Response {
        Response::with_data(value.to_string(), "application/json")
    }

    /// An error response: status plus an HTML body carrying the
    /// escaped message.
    pub fn error(status: StatusCode, message: impl AsRef<str>) -> Response {
        let code = status.as_u16();
        let reason = status.canonical_reason().unwrap_or("Error");
        let msg = htmlescape::encode_minimal(message.as_ref());
        let body = format!(
            "<!DOCTYPE html>\n<html><head><meta charset=\"utf-8\">\
             <title>{code} {reason}</title></head>\n\
             <body><h1>{code} {reason}</h1>\n<p>{msg}</p>\n</body></html>\n"
        );
        Response::html(status, body)
    }

    pub(crate) fn from_error(err: &HttpError) -> Response {
        Response::error(err.statuscode(), err.message())
    }

    /// A response streaming chunks from the given source; the length is
    /// unknown, so the body goes out chunked.
    pub fn stream(
        content_type: impl Into<String>,
        stream: impl Stream<Item = io::Result<Bytes>> + Send + 'static,
    ) -> Response {
        let mut resp = Response::new(StatusCode::OK);
        resp.content_type = Some(content_type.into());
        resp.body = ResponseBody::Stream(stream.boxed());
        resp
    }

    /// A response serving a whole file, with type, length, mtime and
    /// ETag derived from the filesystem.
    pub async fn file(path: impl Into<PathBuf>) -> HttpResult<Response> {
        Response::file_range(path, None).await
    }

    /// A response serving a file, honoring a single byte range: 206
    /// plus `Content-Range` when a range applies, 416 when it cannot be
    /// satisfied.
    pub async fn file_range(
        path: impl Into<PathBuf>,
        range: Option<ByteRange>,
    ) -> HttpResult<Response> {
        let path = path.into();
        let meta = tokio::fs::metadata(&path).await?;
        let len = meta.len();

        let (start, take, partial) = match range {
            None => (0, len, false),
            Some(ByteRange::Prefix { start, len: rlen }) => {
                if start >= len {
                    return Ok(Response::unsatisfiable_range(len));
                }
                let avail = len - start;
                (start, rlen.map_or(avail, |l| l.min(avail)), true)
            }
            Some(ByteRange::Suffix(n)) => {
                if n == 0 {
                    return Ok(Response::unsatisfiable_range(len));
                }
                let start = len.saturating_sub(n);
                (start, len - start, true)
            }
        };

        let content_type = mime_guess::from_path(&path)
            .first_raw()
            .unwrap_or(OCTET_STREAM);

        let mut resp = Response::new(if partial {
            StatusCode::PARTIAL_CONTENT
        } else {
            StatusCode::OK
        });
        resp.content_type = Some(content_type.to_string());
        resp.content_length = Some(take);
        resp.last_modified = meta.modified().ok();
        resp.etag = file_etag(&meta);
        if partial {
            let end = start + take - 1;
            resp.set_header("Content-Range", &format!("bytes {start}-{end}/{len}"));
        }
        resp.body = ResponseBody::File {
            path,
            start,
            remaining: take,
            file: None,
        };
        Ok(resp)
    }

    fn unsatisfiable_range(len: u64) -> Response {
        let mut resp = Response::new(StatusCode::RANGE_NOT_SATISFIABLE);
        resp.set_header("Content-Range", &format!("bytes */{len}"));
        resp
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn set_status(&mut self, status: StatusCode) {
        self.status = status;
    }

    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    pub fn set_content_type(&mut self, content_type: impl Into<String>) {
        self.content_type = Some(content_type.into());
    }

    pub fn content_length(&self) -> Option<u64> {
        self.content_length
    }

    /// A response has a body iff it has a content type.
    pub fn has_body(&self) -> bool {
        self.content_type.is_some()
    }

    /// Add a header beyond the standard set.
    pub fn set_header(&mut self, name: &str, value: &str) {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            self.headers.insert(name, value);
        } else {
            warn!("dropping invalid response header {name}: {value}");
        }
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// `Cache-Control: max-age=N`; 0 means `no-cache`.
    pub fn set_cache_max_age(&mut self, seconds: u32) {
        self.cache_max_age = Some(seconds);
    }

    pub fn cache_max_age(&self) -> Option<u32> {
        self.cache_max_age
    }

    pub fn set_last_modified(&mut self, t: SystemTime) {
        self.last_modified = Some(t);
    }

    pub fn last_modified(&self) -> Option<SystemTime> {
        self.last_modified
    }

    pub fn set_etag(&mut self, etag: impl Into<String>) {
        self.etag = Some(etag.into());
    }

    pub fn etag(&self) -> Option<&str> {
        self.etag.as_deref()
    }

    /// Enable gzip-on-write: when the client accepts gzip, the body is
    /// compressed on the fly and sent chunked.
    pub fn set_gzip_content_encoding(&mut self, enabled: bool) {
        self.gzip_enabled = enabled;
    }

    pub fn gzip_content_encoding(&self) -> bool {
        self.gzip_enabled
    }

    pub(crate) fn body_mut(&mut self) -> &mut ResponseBody {
        &mut self.body
    }

    pub(crate) fn clear_content_length(&mut self) {
        self.content_length = None;
    }
}

// Same scheme as the default apache etag.
#[cfg(unix)]
fn file_etag(meta: &std::fs::Metadata) -> Option<String> {
    use std::os::unix::fs::MetadataExt;
    let modified = meta.modified().ok()?;
    let t = modified
        .duration_since(std::time::UNIX_EPOCH)
        .ok()?;
    let t = t.as_secs() * 1000000 + t.subsec_nanos() as u64 / 1000;
    Some(format!("\"{:x}-{:x}-{:x}\"", meta.ino(), meta.len(), t))
}

#[cfg(not(unix))]
fn file_etag(meta: &std::fs::Metadata) -> Option<String> {
    let modified = meta.modified().ok()?;
    let t = modified
        .duration_since(std::time::UNIX_EPOCH)
        .ok()?;
    let t = t.as_secs() * 1000000 + t.subsec_nanos() as u64 / 1000;
    Some(format!("\"{:x}-{:x}\"", meta.len(), t))
}
