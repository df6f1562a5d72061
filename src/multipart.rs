//! Streaming `multipart/form-data` parser.
//!
//! Fed by the body pipeline one chunk at a time; scans for boundary
//! delimiters, parses per-part headers, and routes part bodies into
//! memory (ordinary form fields) or fresh temp files (file uploads).
//! Nested `multipart/mixed` parts are flattened into file parts that
//! share the outer field name.

use std::io::Write;
use std::path::Path;

use http::StatusCode;
use tempfile::{NamedTempFile, TempPath};

use crate::errors::{HttpError, HttpResult};
use crate::sink::{temp_file_builder, BodyWrite};

const DEFAULT_PART_TYPE: &str = "text/plain";

/// A non-file form field.
#[derive(Debug)]
pub struct MultipartArgument {
    /// The `name` from the part's Content-Disposition.
    pub name: String,
    /// The part's Content-Type, `text/plain` when absent.
    pub content_type: String,
    /// Raw field bytes.
    pub data: Vec<u8>,
}

impl MultipartArgument {
    /// The field value as text.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.data).into_owned()
    }
}

/// An uploaded file, spooled to a temp file that is unlinked when this
/// value is dropped.
#[derive(Debug)]
pub struct MultipartFile {
    /// The `name` from the part's Content-Disposition.
    pub name: String,
    /// The part's Content-Type, `text/plain` when absent.
    pub content_type: String,
    /// The client-supplied `filename`.
    pub file_name: String,
    temp: TempPath,
}

impl MultipartFile {
    /// Location of the spooled bytes.
    pub fn path(&self) -> &Path {
        &self.temp
    }
}

enum State {
    /// Discarding everything before the first boundary.
    Preamble,
    /// Just consumed a delimiter; waiting for `\r\n` (next part) or
    /// `--` (end of stream).
    AfterDelimiter,
    /// Accumulating part headers until the empty line.
    Headers,
    /// Streaming the part body, watching for the next delimiter.
    Body,
    /// Saw the closing delimiter; the rest is ignored.
    Epilogue,
}

enum PartDest {
    Memory(Vec<u8>),
    File {
        file_name: String,
        file: NamedTempFile,
    },
    Nested(Box<MultipartSink>),
}

struct Part {
    name: String,
    content_type: String,
    dest: PartDest,
}

/// The `multipart/form-data` body sink.
pub struct MultipartSink {
    delimiter: Vec<u8>,
    buf: Vec<u8>,
    state: State,
    part: Option<Part>,
    require_name: bool,
    arguments: Vec<MultipartArgument>,
    files: Vec<MultipartFile>,
}

impl MultipartSink {
    /// Build a sink from the request Content-Type, which must carry a
    /// `boundary` parameter.
    pub(crate) fn new(content_type: &str) -> HttpResult<MultipartSink> {
        let boundary = boundary_param(content_type)
            .ok_or(HttpError::Status(StatusCode::BAD_REQUEST))?;
        Ok(Self::with_boundary(&boundary, true))
    }

    fn with_boundary(boundary: &str, require_name: bool) -> MultipartSink {
        let mut delimiter = b"\r\n--".to_vec();
        delimiter.extend_from_slice(boundary.as_bytes());
        MultipartSink {
            delimiter,
            // Seed with a CRLF so a boundary at offset zero is found by
            // the same scan as every later one.
            buf: b"\r\n".to_vec(),
            state: State::Preamble,
            part: None,
            require_name,
            arguments: Vec::new(),
            files: Vec::new(),
        }
    }

    /// Form fields, in order of arrival.
    pub fn arguments(&self) -> &[MultipartArgument] {
        &self.arguments
    }

    /// File parts, in order of arrival.
    pub fn files(&self) -> &[MultipartFile] {
        &self.files
    }

    /// Hand the collected parts to the caller.
    pub(crate) fn into_parts(self) -> (Vec<MultipartArgument>, Vec<MultipartFile>) {
        (self.arguments, self.files)
    }

    fn find_delimiter(&self) -> Option<usize> {
        self.buf
            .windows(self.delimiter.len())
            .position(|w| w == self.delimiter)
    }

    fn start_part(&mut self, header_block: &str) -> HttpResult<()> {
        let mut name = None;
        let mut file_name = None;
        let mut content_type = None;
        for line in header_block.split("\r\n") {
            let Some((hname, value)) = line.split_once(':') else {
                continue;
            };
            let value = value.trim();
            if hname.eq_ignore_ascii_case("content-disposition") {
                name = disposition_param(value, "name");
                file_name = disposition_param(value, "filename");
            } else if hname.eq_ignore_ascii_case("content-type") {
                content_type = Some(value.to_string());
            }
        }

        let name = match name {
            Some(n) => n,
            None if self.require_name => {
                return Err(HttpError::Status(StatusCode::BAD_REQUEST))
            }
            None => String::new(),
        };
        let content_type =
            content_type.unwrap_or_else(|| DEFAULT_PART_TYPE.to_string());

        let dest = if content_type.starts_with("multipart/mixed") {
            let boundary = boundary_param(&content_type)
                .ok_or(HttpError::Status(StatusCode::BAD_REQUEST))?;
            PartDest::Nested(Box::new(Self::with_boundary(&boundary, false)))
        } else if let Some(file_name) = file_name {
            let file = temp_file_builder().tempfile()?;
            PartDest::File { file_name, file }
        } else {
            PartDest::Memory(Vec::new())
        };

        self.part = Some(Part {
            name,
            content_type,
            dest,
        });
        Ok(())
    }

    fn write_part(&mut self, data: &[u8]) -> HttpResult<()> {
        let part = match &mut self.part {
            Some(p) => p,
            None => return Ok(()),
        };
        match &mut part.dest {
            PartDest::Memory(buf) => buf.extend_from_slice(data),
            PartDest::File { file, .. } => file.write_all(data)?,
            PartDest::Nested(inner) => inner.write(data)?,
        }
        Ok(())
    }

    fn finish_part(&mut self) -> HttpResult<()> {
        let Some(part) = self.part.take() else {
            return Ok(());
        };
        match part.dest {
            PartDest::Memory(data) => self.arguments.push(MultipartArgument {
                name: part.name,
                content_type: part.content_type,
                data,
            }),
            PartDest::File {
                file_name,
                mut file,
            } => {
                file.flush()?;
                self.files.push(MultipartFile {
                    name: part.name,
                    content_type: part.content_type,
                    file_name,
                    temp: file.into_temp_path(),
                });
            }
            PartDest::Nested(mut inner) => {
                inner.close()?;
                // Flatten: inner file parts take the outer field name.
                let (_, inner_files) = inner.into_parts();
                for f in inner_files {
                    self.files.push(MultipartFile {
                        name: part.name.clone(),
                        ..f
                    });
                }
            }
        }
        Ok(())
    }

    fn process(&mut self) -> HttpResult<()> {
        loop {
            match self.state {
                State::Preamble => match self.find_delimiter() {
                    Some(pos) => {
                        self.buf.drain(..pos + self.delimiter.len());
                        self.state = State::AfterDelimiter;
                    }
                    None => {
                        // Keep only a potential partial delimiter tail.
                        let keep = self.delimiter.len() - 1;
                        if self.buf.len() > keep {
                            self.buf.drain(..self.buf.len() - keep);
                        }
                        return Ok(());
                    }
                },
                State::AfterDelimiter => {
                    if self.buf.len() < 2 {
                        return Ok(());
                    }
                    match &self.buf[..2] {
                        b"\r\n" => {
                            self.buf.drain(..2);
                            self.state = State::Headers;
                        }
                        b"--" => {
                            self.finish_part()?;
                            self.state = State::Epilogue;
                        }
                        _ => return Err(HttpError::Status(StatusCode::BAD_REQUEST)),
                    }
                }
                State::Headers => {
                    let Some(end) = self
                        .buf
                        .windows(4)
                        .position(|w| w == b"\r\n\r\n")
                    else {
                        // An empty header block is just the terminating CRLF.
                        if self.buf.starts_with(b"\r\n") {
                            self.buf.drain(..2);
                            self.start_part("")?;
                            self.state = State::Body;
                            continue;
                        }
                        return Ok(());
                    };
                    let block = std::str::from_utf8(&self.buf[..end])
                        .map_err(|_| HttpError::Status(StatusCode::BAD_REQUEST))?
                        .to_string();
                    self.buf.drain(..end + 4);
                    self.start_part(&block)?;
                    self.state = State::Body;
                }
                State::Body => match self.find_delimiter() {
                    Some(pos) => {
                        let data: Vec<u8> = self.buf[..pos].to_vec();
                        self.write_part(&data)?;
                        self.buf.drain(..pos + self.delimiter.len());
                        self.finish_part()?;
                        self.state = State::AfterDelimiter;
                    }
                    None => {
                        let keep = self.delimiter.len() - 1;
                        if self.buf.len() > keep {
                            let flush_len = self.buf.len() - keep;
                            let data: Vec<u8> = self.buf[..flush_len].to_vec();
                            self.write_part(&data)?;
                            self.buf.drain(..flush_len);
                        }
                        return Ok(());
                    }
                },
                State::Epilogue => {
                    self.buf.clear();
                    return Ok(());
                }
            }
        }
    }
}

impl BodyWrite for MultipartSink {
    fn write(&mut self, data: &[u8]) -> HttpResult<()> {
        self.buf.extend_from_slice(data);
        self.process()
    }

    fn close(&mut self) -> HttpResult<()> {
        match self.state {
            State::Epilogue => Ok(()),
            // Body ended before the closing delimiter.
            _ => Err(HttpError::Status(StatusCode::BAD_REQUEST)),
        }
    }
}

/// Extract the `boundary` parameter from a Content-Type value.
fn boundary_param(content_type: &str) -> Option<String> {
    for param in content_type.split(';').skip(1) {
        let Some((k, v)) = param.trim().split_once('=') else {
            continue;
        };
        if k.eq_ignore_ascii_case("boundary") {
            let v = v.trim().trim_matches('"');
            if v.is_empty() {
                return None;
            }
            return Some(v.to_string());
        }
    }
    None
}

/// Extract a quoted or bare parameter from a Content-Disposition value.
fn disposition_param(value: &str, key: &str) -> Option<String> {
    for param in value.split(';') {
        let param = param.trim();
        let Some((k, v)) = param.split_once('=') else {
            continue;
        };
        if k.trim().eq_ignore_ascii_case(key) {
            return Some(v.trim().trim_matches('"').to_string());
        }
    }
    None
}
