//! The parsed request handed to handlers.
//!
//! A [`Request`] is immutable after construction except for body
//! ingestion and the attribute bag. The body sink variant is chosen by
//! whichever match predicate claims the request (see the handler
//! registry), which is how a handler asks for the body shape it wants:
//! in memory, in a temp file, parsed multipart, or a decoded form.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::time::SystemTime;

use headers::HeaderMapExt;
use http::header::{self, HeaderMap};
use http::{Method, StatusCode};
use url::Url;

use crate::codec::{parse_byte_range, ByteRange};
use crate::errors::{HttpError, HttpResult};
use crate::multipart::{MultipartArgument, MultipartFile, MultipartSink};
use crate::pipeline::BodyEncoding;
use crate::sink::{BodySink, TempFileSink, UrlFormSink};

/// Attribute key under which the path-regex handler stores its capture
/// groups.
pub const REGEX_CAPTURES: &str = "regex-captures";

/// The request line and headers, before a handler has claimed the
/// request. This is what match predicates get to look at.
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: Method,
    pub url: Url,
    pub path: String,
    pub query: HashMap<String, String>,
    pub headers: HeaderMap,
    pub(crate) http10: bool,
    pub(crate) local_addr: SocketAddr,
    pub(crate) remote_addr: SocketAddr,
}

impl RequestHead {
    /// A header value as a string, `None` when absent or not UTF-8.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

/// The request Content-Type, distinguished from "no body" and from the
/// default a body gets when the client did not name one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentType {
    /// The request has no body.
    None,
    /// The request has a body but no Content-Type header.
    Default,
    /// The client-supplied Content-Type.
    Explicit(String),
}

impl ContentType {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            ContentType::None => None,
            ContentType::Default => Some("application/octet-stream"),
            ContentType::Explicit(s) => Some(s),
        }
    }
}

/// A value in the request attribute bag.
#[derive(Debug, Clone)]
pub enum AttrValue {
    Text(String),
    List(Vec<String>),
}

/// A fully parsed request.
pub struct Request {
    method: Method,
    url: Url,
    path: String,
    query: HashMap<String, String>,
    headers: HeaderMap,
    content_type: ContentType,
    content_length: Option<u64>,
    chunked: bool,
    body_encoding: BodyEncoding,
    if_modified_since: Option<SystemTime>,
    if_none_match: Option<String>,
    byte_range: Option<ByteRange>,
    accepts_gzip: bool,
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
    attributes: HashMap<String, AttrValue>,
    sink: BodySink,
}

impl Request {
    /// Construct a request whose body (if any) is discarded.
    pub fn new(head: &RequestHead) -> HttpResult<Request> {
        Request::with_sink(head, BodySink::Discard)
    }

    /// Construct a request whose body is buffered in memory.
    pub fn memory(head: &RequestHead) -> HttpResult<Request> {
        Request::with_sink(head, BodySink::Memory(Vec::new()))
    }

    /// Construct a request whose body is spooled to a temp file.
    pub fn temp_file(head: &RequestHead) -> HttpResult<Request> {
        Request::with_sink(head, BodySink::TempFile(TempFileSink::new()))
    }

    /// Construct a request whose body is parsed as
    /// `multipart/form-data`. Fails when the Content-Type carries no
    /// boundary.
    pub fn multipart(head: &RequestHead) -> HttpResult<Request> {
        let ct = head
            .header(header::CONTENT_TYPE.as_str())
            .ok_or(HttpError::Status(StatusCode::BAD_REQUEST))?;
        let sink = MultipartSink::new(ct)?;
        Request::with_sink(head, BodySink::Multipart(sink))
    }

    /// Construct a request whose body is parsed as
    /// `application/x-www-form-urlencoded`.
    pub fn url_encoded(head: &RequestHead) -> HttpResult<Request> {
        let charset = head
            .header(header::CONTENT_TYPE.as_str())
            .and_then(charset_param);
        let sink = UrlFormSink::new(charset.as_deref());
        Request::with_sink(head, BodySink::UrlEncoded(sink))
    }

    /// Construct a request with an explicit body sink.
    pub fn with_sink(head: &RequestHead, sink: BodySink) -> HttpResult<Request> {
        let content_length = match head.header(header::CONTENT_LENGTH.as_str()) {
            Some(v) => {
                let n: i64 = v
                    .trim()
                    .parse()
                    .map_err(|_| HttpError::Status(StatusCode::BAD_REQUEST))?;
                if n < 0 {
                    return Err(HttpError::Status(StatusCode::BAD_REQUEST));
                }
                Some(n as u64)
            }
            None => None,
        };

        let chunked = head
            .header(header::TRANSFER_ENCODING.as_str())
            .map(|v| v.to_ascii_lowercase().contains("chunked"))
            .unwrap_or(false);
        // A request may be framed by length or by chunking, not both.
        if chunked && content_length.is_some() {
            return Err(HttpError::Status(StatusCode::BAD_REQUEST));
        }

        let has_body = chunked || content_length.is_some();
        let content_type = match head.header(header::CONTENT_TYPE.as_str()) {
            Some(v) => ContentType::Explicit(v.to_string()),
            None if has_body => ContentType::Default,
            None => ContentType::None,
        };

        let body_encoding = match head
            .header(header::CONTENT_ENCODING.as_str())
            .map(|v| v.trim().to_ascii_lowercase())
            .as_deref()
        {
            Some("gzip") => BodyEncoding::Gzip,
            Some("deflate") => BodyEncoding::Deflate,
            _ => BodyEncoding::Identity,
        };

        let if_modified_since = head
            .headers
            .typed_get::<headers::IfModifiedSince>()
            .map(SystemTime::from);
        let if_none_match = head
            .header(header::IF_NONE_MATCH.as_str())
            .map(|v| v.trim().to_string());
        let byte_range = head
            .header(header::RANGE.as_str())
            .and_then(parse_byte_range);
        let accepts_gzip = head
            .header(header::ACCEPT_ENCODING.as_str())
            .map(|v| v.to_ascii_lowercase().contains("gzip"))
            .unwrap_or(false);

        Ok(Request {
            method: head.method.clone(),
            url: head.url.clone(),
            path: head.path.clone(),
            query: head.query.clone(),
            headers: head.headers.clone(),
            content_type,
            content_length,
            chunked,
            body_encoding,
            if_modified_since,
            if_none_match,
            byte_range,
            accepts_gzip,
            local_addr: head.local_addr,
            remote_addr: head.remote_addr,
            attributes: HashMap::new(),
            sink,
        })
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    /// The absolute request URL (scheme and authority derived from the
    /// server binding and the Host header).
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// The URL-decoded request path; always begins with `/`.
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn query(&self) -> &HashMap<String, String> {
        &self.query
    }

    /// A single query parameter.
    pub fn query_value(&self, name: &str) -> Option<&str> {
        self.query.get(name).map(|s| s.as_str())
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// A header value as a string, `None` when absent or not UTF-8.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn content_type(&self) -> &ContentType {
        &self.content_type
    }

    /// The declared body length; `None` means unknown (chunked or no
    /// body).
    pub fn content_length(&self) -> Option<u64> {
        self.content_length
    }

    pub fn is_chunked(&self) -> bool {
        self.chunked
    }

    /// Whether a body is expected on the wire.
    pub fn has_body(&self) -> bool {
        self.chunked || self.content_length.is_some()
    }

    pub fn if_modified_since(&self) -> Option<SystemTime> {
        self.if_modified_since
    }

    pub fn if_none_match(&self) -> Option<&str> {
        self.if_none_match.as_deref()
    }

    pub fn byte_range(&self) -> Option<ByteRange> {
        self.byte_range
    }

    /// Whether the client accepts a gzip response body.
    pub fn accepts_gzip_encoding(&self) -> bool {
        self.accepts_gzip
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn set_attribute(&mut self, key: impl Into<String>, value: AttrValue) {
        self.attributes.insert(key.into(), value);
    }

    pub fn attribute(&self, key: &str) -> Option<&AttrValue> {
        self.attributes.get(key)
    }

    /// The capture groups stored by a path-regex handler.
    pub fn regex_captures(&self) -> Option<&[String]> {
        match self.attributes.get(REGEX_CAPTURES) {
            Some(AttrValue::List(v)) => Some(v),
            _ => None,
        }
    }

    pub(crate) fn body_encoding(&self) -> BodyEncoding {
        self.body_encoding
    }

    pub(crate) fn sink_mut(&mut self) -> &mut BodySink {
        &mut self.sink
    }

    /// The body bytes, for requests built with a memory sink.
    pub fn data(&self) -> Option<&[u8]> {
        match &self.sink {
            BodySink::Memory(buf) => Some(buf),
            _ => None,
        }
    }

    /// The body as text, for requests built with a memory sink.
    pub fn text(&self) -> Option<String> {
        self.data().map(|d| String::from_utf8_lossy(d).into_owned())
    }

    /// Path of the spooled body, for requests built with a temp-file
    /// sink. The file disappears when the request is dropped.
    pub fn temp_file_path(&self) -> Option<&Path> {
        match &self.sink {
            BodySink::TempFile(s) => s.path(),
            _ => None,
        }
    }

    /// Multipart form fields.
    pub fn arguments(&self) -> &[MultipartArgument] {
        match &self.sink {
            BodySink::Multipart(s) => s.arguments(),
            _ => &[],
        }
    }

    /// Multipart file parts.
    pub fn files(&self) -> &[MultipartFile] {
        match &self.sink {
            BodySink::Multipart(s) => s.files(),
            _ => &[],
        }
    }

    /// A single multipart form field by control name.
    pub fn argument(&self, name: &str) -> Option<&MultipartArgument> {
        self.arguments().iter().find(|a| a.name == name)
    }

    /// A decoded form value: multipart field or url-encoded pair.
    pub fn form_value(&self, name: &str) -> Option<String> {
        match &self.sink {
            BodySink::UrlEncoded(s) => s.values().get(name).cloned(),
            BodySink::Multipart(_) => self.argument(name).map(|a| a.text()),
            _ => None,
        }
    }
}

/// Extract the `charset` parameter from a Content-Type value.
fn charset_param(content_type: &str) -> Option<String> {
    for param in content_type.split(';').skip(1) {
        let Some((k, v)) = param.trim().split_once('=') else {
            continue;
        };
        if k.eq_ignore_ascii_case("charset") {
            return Some(v.trim().trim_matches('"').to_string());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn head_with(headers: &[(&str, &str)]) -> RequestHead {
        let mut map = HeaderMap::new();
        for (k, v) in headers {
            map.append(
                http::header::HeaderName::from_bytes(k.as_bytes()).unwrap(),
                v.parse().unwrap(),
            );
        }
        RequestHead {
            method: Method::PUT,
            url: Url::parse("http://localhost/up.txt").unwrap(),
            path: "/up.txt".to_string(),
            query: HashMap::new(),
            headers: map,
            http10: false,
            local_addr: "127.0.0.1:8080".parse().unwrap(),
            remote_addr: "127.0.0.1:9999".parse().unwrap(),
        }
    }

    #[test]
    fn content_length_and_type() {
        let req = Request::new(&head_with(&[("content-length", "12")])).unwrap();
        assert_eq!(req.content_length(), Some(12));
        assert!(req.has_body());
        assert_eq!(req.content_type().as_str(), Some("application/octet-stream"));

        let req = Request::new(&head_with(&[])).unwrap();
        assert!(!req.has_body());
        assert_eq!(req.content_type(), &ContentType::None);
    }

    #[test]
    fn negative_content_length_rejected() {
        assert!(Request::new(&head_with(&[("content-length", "-1")])).is_err());
        assert!(Request::new(&head_with(&[("content-length", "x")])).is_err());
    }

    #[test]
    fn chunked_with_length_rejected() {
        let head = head_with(&[
            ("content-length", "5"),
            ("transfer-encoding", "chunked"),
        ]);
        assert!(Request::new(&head).is_err());

        let head = head_with(&[("transfer-encoding", "chunked")]);
        let req = Request::new(&head).unwrap();
        assert!(req.is_chunked());
        assert!(req.has_body());
        assert_eq!(req.content_length(), None);
    }

    #[test]
    fn accepts_gzip() {
        let req =
            Request::new(&head_with(&[("accept-encoding", "gzip, deflate")])).unwrap();
        assert!(req.accepts_gzip_encoding());
        let req = Request::new(&head_with(&[])).unwrap();
        assert!(!req.accepts_gzip_encoding());
    }
}
