//! Request body sinks.
//!
//! Every request owns one sink; the body pipeline pushes decoded body
//! bytes into it. The former class hierarchy of request subtypes is a
//! tagged enum here, with the shared `{open, write, close}` capability
//! expressed as the [`BodyWrite`] trait so the pipeline can treat the
//! sink like any other stage.

use std::collections::HashMap;
use std::io::Write;
use std::path::Path;

use http::StatusCode;
use tempfile::NamedTempFile;

use crate::codec::form_decode;
use crate::errors::{HttpError, HttpResult};
use crate::multipart::MultipartSink;

/// One stage of the body ingest pipeline.
pub trait BodyWrite: Send {
    fn open(&mut self) -> HttpResult<()> {
        Ok(())
    }
    fn write(&mut self, data: &[u8]) -> HttpResult<()>;
    fn close(&mut self) -> HttpResult<()> {
        Ok(())
    }
}

/// Where the decoded request body ends up.
pub enum BodySink {
    /// Body bytes are thrown away.
    Discard,
    /// Body bytes accumulate in memory.
    Memory(Vec<u8>),
    /// Body bytes go to a temp file, unlinked when the request is dropped.
    TempFile(TempFileSink),
    /// `multipart/form-data` parser.
    Multipart(MultipartSink),
    /// `application/x-www-form-urlencoded` parser.
    UrlEncoded(UrlFormSink),
}

impl BodyWrite for BodySink {
    fn open(&mut self) -> HttpResult<()> {
        match self {
            BodySink::Discard | BodySink::Memory(_) => Ok(()),
            BodySink::TempFile(s) => s.open(),
            BodySink::Multipart(s) => s.open(),
            BodySink::UrlEncoded(s) => s.open(),
        }
    }

    fn write(&mut self, data: &[u8]) -> HttpResult<()> {
        match self {
            BodySink::Discard => Ok(()),
            BodySink::Memory(buf) => {
                buf.extend_from_slice(data);
                Ok(())
            }
            BodySink::TempFile(s) => s.write(data),
            BodySink::Multipart(s) => s.write(data),
            BodySink::UrlEncoded(s) => s.write(data),
        }
    }

    fn close(&mut self) -> HttpResult<()> {
        match self {
            BodySink::Discard | BodySink::Memory(_) => Ok(()),
            BodySink::TempFile(s) => s.close(),
            BodySink::Multipart(s) => s.close(),
            BodySink::UrlEncoded(s) => s.close(),
        }
    }
}

/// Sink that spools the body to a file in the system temp directory.
/// The file is created on `open` and unlinked when the sink is dropped.
pub struct TempFileSink {
    file: Option<NamedTempFile>,
}

impl TempFileSink {
    pub(crate) fn new() -> TempFileSink {
        TempFileSink { file: None }
    }

    pub(crate) fn path(&self) -> Option<&Path> {
        self.file.as_ref().map(|f| f.path())
    }
}

impl BodyWrite for TempFileSink {
    fn open(&mut self) -> HttpResult<()> {
        let file = temp_file_builder().tempfile()?;
        self.file = Some(file);
        Ok(())
    }

    fn write(&mut self, data: &[u8]) -> HttpResult<()> {
        match &mut self.file {
            Some(file) => Ok(file.write_all(data)?),
            None => Err(HttpError::Status(StatusCode::INTERNAL_SERVER_ERROR)),
        }
    }

    fn close(&mut self) -> HttpResult<()> {
        if let Some(file) = &mut self.file {
            file.flush()?;
        }
        Ok(())
    }
}

/// A `tempfile::Builder` preconfigured the way all temp files in this
/// crate are created: recognizable prefix, world-readable on unix.
pub(crate) fn temp_file_builder() -> tempfile::Builder<'static, 'static> {
    let mut builder = tempfile::Builder::new();
    builder.prefix(".davshare-");
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        builder.permissions(std::fs::Permissions::from_mode(0o644));
    }
    builder
}

/// Sink that buffers the whole body, then decodes it as
/// `application/x-www-form-urlencoded` on close.
pub struct UrlFormSink {
    latin1: bool,
    buf: Vec<u8>,
    values: HashMap<String, String>,
}

impl UrlFormSink {
    /// `charset` comes from the request Content-Type; UTF-8 is the default.
    pub(crate) fn new(charset: Option<&str>) -> UrlFormSink {
        let latin1 = matches!(charset, Some(c) if c.eq_ignore_ascii_case("iso-8859-1")
            || c.eq_ignore_ascii_case("latin1"));
        UrlFormSink {
            latin1,
            buf: Vec::new(),
            values: HashMap::new(),
        }
    }

    pub(crate) fn values(&self) -> &HashMap<String, String> {
        &self.values
    }

    fn decode(&self, raw: &str) -> HttpResult<String> {
        if self.latin1 {
            let bytes: Vec<u8> = raw.replace('+', " ").into_bytes();
            let decoded: Vec<u8> =
                percent_encoding::percent_decode(&bytes).collect();
            Ok(decoded.iter().map(|&b| b as char).collect())
        } else {
            form_decode(raw)
        }
    }
}

impl BodyWrite for UrlFormSink {
    fn write(&mut self, data: &[u8]) -> HttpResult<()> {
        self.buf.extend_from_slice(data);
        Ok(())
    }

    fn close(&mut self) -> HttpResult<()> {
        let text = std::str::from_utf8(&self.buf)
            .map_err(|_| HttpError::Status(StatusCode::BAD_REQUEST))?;
        for pair in text.split('&') {
            if pair.is_empty() {
                continue;
            }
            let (k, v) = match pair.split_once('=') {
                Some((k, v)) => (k, v),
                None => (pair, ""),
            };
            self.values.insert(self.decode(k)?, self.decode(v)?);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_sink_collects() {
        let mut sink = BodySink::Memory(Vec::new());
        sink.open().unwrap();
        sink.write(b"hello ").unwrap();
        sink.write(b"world").unwrap();
        sink.close().unwrap();
        match sink {
            BodySink::Memory(buf) => assert_eq!(buf, b"hello world"),
            _ => unreachable!(),
        }
    }

    #[test]
    fn temp_file_sink_unlinks_on_drop() {
        let mut sink = TempFileSink::new();
        sink.open().unwrap();
        sink.write(b"spooled").unwrap();
        sink.close().unwrap();
        let path = sink.path().unwrap().to_path_buf();
        assert_eq!(std::fs::read(&path).unwrap(), b"spooled");
        drop(sink);
        assert!(!path.exists());
    }

    #[test]
    fn url_form_decodes_pairs() {
        let mut sink = UrlFormSink::new(None);
        sink.write(b"a=1&b=hello+world&c=%C3%A9&d&a=2").unwrap();
        sink.close().unwrap();
        let v = sink.values();
        assert_eq!(v.get("a").unwrap(), "2");
        assert_eq!(v.get("b").unwrap(), "hello world");
        assert_eq!(v.get("c").unwrap(), "é");
        assert_eq!(v.get("d").unwrap(), "");
    }

    #[test]
    fn url_form_latin1() {
        let mut sink = UrlFormSink::new(Some("ISO-8859-1"));
        sink.write(b"name=caf%E9").unwrap();
        sink.close().unwrap();
        assert_eq!(sink.values().get("name").unwrap(), "café");
    }
}
