//! HTTP/1.1 wire parsing and framing.
//!
//! The connection engine reads the request head into a buffer until it
//! sees the empty line; this module turns those bytes into a [`Head`],
//! and provides the inverse framing helpers for chunked bodies on the
//! write side. Chunked *ingestion* lives in the body pipeline.

use std::collections::HashMap;

use bytes::BytesMut;
use http::header::{HeaderMap, HeaderName, HeaderValue};
use http::{Method, StatusCode};
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, CONTROLS};

use crate::errors::{HttpError, HttpResult};

// Bytes that must be escaped when a filesystem path is emitted as a
// URL path (in PROPFIND hrefs and uploader listings).
const HREF_ENCODE_SET: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'<')
    .add(b'>')
    .add(b'`')
    .add(b'#')
    .add(b'?')
    .add(b'%')
    .add(b'{')
    .add(b'}');

/// Percent-encode a decoded path for use as a URL.
pub(crate) fn href_encode(path: &str) -> String {
    utf8_percent_encode(path, HREF_ENCODE_SET).to_string()
}

/// The parsed request line and header section of one request.
#[derive(Debug)]
pub(crate) struct Head {
    pub method: Method,
    pub target: String,
    pub path: String,
    pub query: HashMap<String, String>,
    pub http10: bool,
    pub headers: HeaderMap,
}

/// Percent-decode a URL path component.
pub(crate) fn percent_decode(s: &str) -> HttpResult<String> {
    let decoded = percent_decode_str(s)
        .decode_utf8()
        .map_err(|_| HttpError::StatusClose(StatusCode::BAD_REQUEST))?;
    Ok(decoded.into_owned())
}

/// Decode one side of a `k=v` pair from a query string or an
/// `application/x-www-form-urlencoded` body: `+` means space.
pub(crate) fn form_decode(s: &str) -> HttpResult<String> {
    percent_decode(&s.replace('+', " "))
}

/// Parse `k=v&k=v`, percent-decoding both sides. A pair without `=`
/// maps to the empty string; later duplicates overwrite earlier ones.
pub(crate) fn parse_query(s: &str) -> HttpResult<HashMap<String, String>> {
    let mut map = HashMap::new();
    for pair in s.split('&') {
        if pair.is_empty() {
            continue;
        }
        let (k, v) = match pair.split_once('=') {
            Some((k, v)) => (k, v),
            None => (pair, ""),
        };
        map.insert(form_decode(k)?, form_decode(v)?);
    }
    Ok(map)
}

/// Parse the request head: request line plus header lines, not
/// including the terminating empty line.
pub(crate) fn parse_head(bytes: &[u8]) -> HttpResult<Head> {
    let text = std::str::from_utf8(bytes)
        .map_err(|_| HttpError::StatusClose(StatusCode::BAD_REQUEST))?;
    let mut lines = text.split("\r\n");

    let request_line = lines
        .next()
        .ok_or(HttpError::StatusClose(StatusCode::BAD_REQUEST))?;
    // METHOD SP REQUEST-TARGET SP HTTP-VERSION, single spaces only.
    let mut parts = request_line.split(' ');
    let (method, target, version) = match (parts.next(), parts.next(), parts.next(), parts.next())
    {
        (Some(m), Some(t), Some(v), None) => (m, t, v),
        _ => return Err(HttpError::StatusClose(StatusCode::BAD_REQUEST)),
    };
    if method.is_empty() || target.is_empty() {
        return Err(HttpError::StatusClose(StatusCode::BAD_REQUEST));
    }

    let http10 = match version {
        "HTTP/1.1" => false,
        "HTTP/1.0" => true,
        _ => {
            return Err(HttpError::StatusClose(
                StatusCode::HTTP_VERSION_NOT_SUPPORTED,
            ))
        }
    };

    let method = Method::from_bytes(method.to_ascii_uppercase().as_bytes())
        .map_err(|_| HttpError::StatusClose(StatusCode::BAD_REQUEST))?;

    if !target.starts_with('/') {
        return Err(HttpError::StatusClose(StatusCode::BAD_REQUEST));
    }
    let (raw_path, raw_query) = match target.split_once('?') {
        Some((p, q)) => (p, q),
        None => (target, ""),
    };
    let path = percent_decode(raw_path)?;
    let query = parse_query(raw_query)?;

    let mut headers = HeaderMap::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or(HttpError::StatusClose(StatusCode::BAD_REQUEST))?;
        let name = HeaderName::from_bytes(name.trim().as_bytes())
            .map_err(|_| HttpError::StatusClose(StatusCode::BAD_REQUEST))?;
        let value = value.trim();
        // Duplicate header names are joined with ", ".
        let value = match headers.get(&name) {
            Some(prev) => {
                let prev = prev.to_str().unwrap_or_default();
                HeaderValue::from_str(&format!("{prev}, {value}"))
            }
            None => HeaderValue::from_str(value),
        }
        .map_err(|_| HttpError::StatusClose(StatusCode::BAD_REQUEST))?;
        headers.insert(name, value);
    }

    Ok(Head {
        method,
        target: target.to_string(),
        path,
        query,
        http10,
        headers,
    })
}

/// A single byte range from a `Range:` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteRange {
    /// `bytes=A-B` or `bytes=A-`: from an offset, with an optional length.
    Prefix { start: u64, len: Option<u64> },
    /// `bytes=-N`: the last N bytes.
    Suffix(u64),
}

/// Parse a `Range:` header value. Only single byte ranges are
/// supported: comma-separated lists and other units are treated as
/// "no range". `bytes=-0` parses to a zero-length suffix, which is
/// never satisfiable and turns into a 416 downstream.
pub(crate) fn parse_byte_range(value: &str) -> Option<ByteRange> {
    let rest = value.strip_prefix("bytes=")?.trim();
    if rest.contains(',') {
        return None;
    }
    let (from, to) = rest.split_once('-')?;
    let from = from.trim();
    let to = to.trim();
    if from.is_empty() {
        return Some(ByteRange::Suffix(to.parse().ok()?));
    }
    let start: u64 = from.parse().ok()?;
    if to.is_empty() {
        return Some(ByteRange::Prefix { start, len: None });
    }
    let end: u64 = to.parse().ok()?;
    if end < start {
        return None;
    }
    Some(ByteRange::Prefix {
        start,
        len: Some(end - start + 1),
    })
}

/// Append one chunk of a chunked response body.
pub(crate) fn encode_chunk(out: &mut BytesMut, data: &[u8]) {
    if data.is_empty() {
        // A zero length chunk would terminate the body.
        return;
    }
    out.extend_from_slice(format!("{:x}\r\n", data.len()).as_bytes());
    out.extend_from_slice(data);
    out.extend_from_slice(b"\r\n");
}

/// Append the chunked body terminator.
pub(crate) fn encode_final_chunk(out: &mut BytesMut) {
    out.extend_from_slice(b"0\r\n\r\n");
}
