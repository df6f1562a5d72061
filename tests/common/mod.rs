//! Raw-socket HTTP/1.1 client used by the integration tests: the
//! server under test owns the wire format, so the tests speak it
//! byte-for-byte rather than through an HTTP library.

#![allow(dead_code)]

use std::collections::HashMap;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

#[derive(Debug)]
pub struct RawResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl RawResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(|s| s.as_str())
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

pub async fn connect(port: u16) -> TcpStream {
    TcpStream::connect(("127.0.0.1", port)).await.unwrap()
}

/// One request on a fresh connection.
pub async fn roundtrip(port: u16, request: &[u8]) -> RawResponse {
    let mut stream = connect(port).await;
    stream.write_all(request).await.unwrap();
    read_response(&mut stream).await
}

/// Convenience builder for a request with a body.
pub fn request(method: &str, target: &str, headers: &[(&str, &str)], body: &[u8]) -> Vec<u8> {
    let mut out = format!("{method} {target} HTTP/1.1\r\nHost: localhost\r\n").into_bytes();
    for (k, v) in headers {
        out.extend_from_slice(format!("{k}: {v}\r\n").as_bytes());
    }
    if !body.is_empty() && !headers.iter().any(|(k, _)| k.eq_ignore_ascii_case("content-length")) {
        out.extend_from_slice(format!("Content-Length: {}\r\n", body.len()).as_bytes());
    }
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(body);
    out
}

/// Read exactly one response, honoring Content-Length or chunked
/// framing (responses without either are read to EOF).
pub async fn read_response(stream: &mut TcpStream) -> RawResponse {
    let mut buf = Vec::new();
    let head_end = loop {
        if let Some(pos) = find(&buf, b"\r\n\r\n") {
            break pos;
        }
        let mut tmp = [0u8; 4096];
        let n = stream.read(&mut tmp).await.unwrap();
        assert!(
            n > 0,
            "connection closed before response head: {:?}",
            String::from_utf8_lossy(&buf)
        );
        buf.extend_from_slice(&tmp[..n]);
    };

    let head = String::from_utf8(buf[..head_end].to_vec()).unwrap();
    let mut body = buf[head_end + 4..].to_vec();
    let mut lines = head.split("\r\n");
    let status_line = lines.next().unwrap();
    assert!(status_line.starts_with("HTTP/1.1 "), "bad status line: {status_line}");
    let status: u16 = status_line.split(' ').nth(1).unwrap().parse().unwrap();
    let mut headers = HashMap::new();
    for line in lines {
        if let Some((k, v)) = line.split_once(':') {
            headers.insert(k.trim().to_ascii_lowercase(), v.trim().to_string());
        }
    }

    if let Some(cl) = headers.get("content-length") {
        let cl: usize = cl.parse().unwrap();
        while body.len() < cl {
            let mut tmp = [0u8; 4096];
            let n = stream.read(&mut tmp).await.unwrap();
            assert!(n > 0, "connection closed mid body");
            body.extend_from_slice(&tmp[..n]);
        }
        body.truncate(cl);
    } else if headers
        .get("transfer-encoding")
        .map(|v| v.contains("chunked"))
        .unwrap_or(false)
    {
        while find(&body, b"0\r\n\r\n").is_none() {
            let mut tmp = [0u8; 4096];
            let n = stream.read(&mut tmp).await.unwrap();
            assert!(n > 0, "connection closed mid chunked body");
            body.extend_from_slice(&tmp[..n]);
        }
        body = decode_chunked(&body);
    } else {
        // Close delimited or no body; drain whatever arrives.
        loop {
            let mut tmp = [0u8; 4096];
            match tokio::time::timeout(
                std::time::Duration::from_millis(200),
                stream.read(&mut tmp),
            )
            .await
            {
                Ok(Ok(0)) | Err(_) => break,
                Ok(Ok(n)) => body.extend_from_slice(&tmp[..n]),
                Ok(Err(_)) => break,
            }
        }
    }

    RawResponse {
        status,
        headers,
        body,
    }
}

pub fn decode_chunked(mut input: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    loop {
        let eol = find(input, b"\r\n").expect("missing chunk size line");
        let size_line = std::str::from_utf8(&input[..eol]).unwrap();
        let size_part = size_line.split(';').next().unwrap().trim();
        let size = usize::from_str_radix(size_part, 16).unwrap();
        input = &input[eol + 2..];
        if size == 0 {
            break;
        }
        out.extend_from_slice(&input[..size]);
        assert_eq!(&input[size..size + 2], b"\r\n");
        input = &input[size + 2..];
    }
    out
}

pub fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|w| w == needle)
}
