//! The request body ingest pipeline.
//!
//! Socket bytes pass through up to three stages: the chunked-transfer
//! deframer (when `Transfer-Encoding: chunked`), the inflate stage
//! (when `Content-Encoding: gzip` or `deflate`), and finally the
//! request's own sink. The stages are composed once per request at
//! body-open time.

use http::StatusCode;

use crate::errors::{HttpError, HttpResult};
use crate::sink::{BodySink, BodyWrite};

const MAX_SIZE_LINE: usize = 128;
const MAX_TRAILER_LINE: usize = 8 * 1024;

/// The content-encoding applied to the request body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BodyEncoding {
    Identity,
    Gzip,
    Deflate,
}

enum Inflate {
    Gzip(flate2::write::GzDecoder<Vec<u8>>),
    Deflate(flate2::write::ZlibDecoder<Vec<u8>>),
}

impl Inflate {
    fn new(encoding: BodyEncoding) -> Option<Inflate> {
        match encoding {
            BodyEncoding::Identity => None,
            BodyEncoding::Gzip => Some(Inflate::Gzip(flate2::write::GzDecoder::new(
                Vec::new(),
            ))),
            BodyEncoding::Deflate => Some(Inflate::Deflate(
                flate2::write::ZlibDecoder::new(Vec::new()),
            )),
        }
    }

    fn write(&mut self, data: &[u8]) -> std::io::Result<()> {
        use std::io::Write;
        match self {
            Inflate::Gzip(d) => d.write_all(data),
            Inflate::Deflate(d) => d.write_all(data),
        }
    }

    fn take(&mut self) -> Vec<u8> {
        match self {
            Inflate::Gzip(d) => std::mem::take(d.get_mut()),
            Inflate::Deflate(d) => std::mem::take(d.get_mut()),
        }
    }

    fn finish(self) -> std::io::Result<Vec<u8>> {
        match self {
            Inflate::Gzip(d) => d.finish(),
            Inflate::Deflate(d) => d.finish(),
        }
    }
}

enum ChunkState {
    Size { line: Vec<u8> },
    Data { remaining: u64 },
    DataCr,
    DataLf,
    Trailer { line: Vec<u8> },
    Done,
}

/// Incremental decoder for `Transfer-Encoding: chunked`. Chunk
/// extensions are ignored; trailer headers are consumed and dropped.
pub(crate) struct ChunkDecoder {
    state: ChunkState,
}

impl ChunkDecoder {
    pub(crate) fn new() -> ChunkDecoder {
        ChunkDecoder {
            state: ChunkState::Size { line: Vec::new() },
        }
    }

    pub(crate) fn is_done(&self) -> bool {
        matches!(self.state, ChunkState::Done)
    }

    /// Feed input bytes, emitting decoded body bytes through `out`.
    /// Returns how much input was consumed; short only when the final
    /// chunk terminator was reached (the rest belongs to the next
    /// request on the connection).
    pub(crate) fn decode(
        &mut self,
        input: &[u8],
        out: &mut dyn FnMut(&[u8]) -> HttpResult<()>,
    ) -> HttpResult<usize> {
        let mut pos = 0;
        while pos < input.len() {
            match &mut self.state {
                ChunkState::Size { line } => {
                    let b = input[pos];
                    pos += 1;
                    if b == b'\n' {
                        if line.last() != Some(&b'\r') {
                            return Err(bad_chunk());
                        }
                        line.pop();
                        let text = std::str::from_utf8(line)
                            .map_err(|_| bad_chunk())?;
                        // Chunk extensions: everything after ';' is ignored.
                        let size_part = match text.split_once(';') {
                            Some((s, _)) => s,
                            None => text,
                        }
                        .trim();
                        if size_part.is_empty() || size_part.len() > 16 {
                            return Err(bad_chunk());
                        }
                        let size = u64::from_str_radix(size_part, 16)
                            .map_err(|_| bad_chunk())?;
                        self.state = if size == 0 {
                            ChunkState::Trailer { line: Vec::new() }
                        } else {
                            ChunkState::Data { remaining: size }
                        };
                    } else {
                        if line.len() >= MAX_SIZE_LINE {
                            return Err(bad_chunk());
                        }
                        line.push(b);
                    }
                }
                ChunkState::Data { remaining } => {
                    let avail = (input.len() - pos) as u64;
                    let take = avail.min(*remaining) as usize;
                    out(&input[pos..pos + take])?;
                    pos += take;
                    *remaining -= take as u64;
                    if *remaining == 0 {
                        self.state = ChunkState::DataCr;
                    }
                }
                ChunkState::DataCr => {
                    if input[pos] != b'\r' {
                        return Err(bad_chunk());
                    }
                    pos += 1;
                    self.state = ChunkState::DataLf;
                }
                ChunkState::DataLf => {
                    if input[pos] != b'\n' {
                        return Err(bad_chunk());
                    }
                    pos += 1;
                    self.state = ChunkState::Size { line: Vec::new() };
                }
                ChunkState::Trailer { line } => {
                    let b = input[pos];
                    pos += 1;
                    if b == b'\n' {
                        if line.last() != Some(&b'\r') {
                            return Err(bad_chunk());
                        }
                        if line.len() == 1 {
                            self.state = ChunkState::Done;
                            return Ok(pos);
                        }
                        line.clear();
                    } else {
                        if line.len() >= MAX_TRAILER_LINE {
                            return Err(bad_chunk());
                        }
                        line.push(b);
                    }
                }
                ChunkState::Done => return Ok(pos),
            }
        }
        Ok(pos)
    }
}

fn bad_chunk() -> HttpError {
    HttpError::StatusClose(StatusCode::BAD_REQUEST)
}

/// The composed ingest pipeline for one request body. Borrows the
/// request's sink for the duration of the ingest.
pub(crate) struct Pipeline<'a> {
    chunked: Option<ChunkDecoder>,
    inflate: Option<Inflate>,
    sink: &'a mut BodySink,
}

impl<'a> Pipeline<'a> {
    pub(crate) fn new(
        sink: &'a mut BodySink,
        chunked: bool,
        encoding: BodyEncoding,
    ) -> Pipeline<'a> {
        Pipeline {
            chunked: chunked.then(ChunkDecoder::new),
            inflate: Inflate::new(encoding),
            sink,
        }
    }

    pub(crate) fn open(&mut self) -> HttpResult<()> {
        self.sink.open()
    }

    /// Push socket bytes into the pipeline. Returns how much input was
    /// consumed; see [`ChunkDecoder::decode`].
    pub(crate) fn write(&mut self, data: &[u8]) -> HttpResult<usize> {
        let inflate = &mut self.inflate;
        let sink = &mut *self.sink;
        match &mut self.chunked {
            Some(decoder) => {
                decoder.decode(data, &mut |bytes| stage_write(inflate, sink, bytes))
            }
            None => {
                stage_write(inflate, sink, data)?;
                Ok(data.len())
            }
        }
    }

    /// Whether a chunked body has seen its terminator.
    pub(crate) fn chunked_done(&self) -> bool {
        self.chunked.as_ref().map_or(true, |d| d.is_done())
    }

    /// Close every stage in order, propagating the first failure.
    pub(crate) fn close(&mut self) -> HttpResult<()> {
        if let Some(decoder) = &self.chunked {
            if !decoder.is_done() {
                return Err(bad_chunk());
            }
        }
        if let Some(inflate) = self.inflate.take() {
            let tail = inflate.finish()?;
            if !tail.is_empty() {
                self.sink.write(&tail)?;
            }
        }
        self.sink.close()
    }
}

fn stage_write(
    inflate: &mut Option<Inflate>,
    sink: &mut BodySink,
    data: &[u8],
) -> HttpResult<()> {
    match inflate {
        Some(inf) => {
            inf.write(data)?;
            let decoded = inf.take();
            if !decoded.is_empty() {
                sink.write(&decoded)?;
            }
            Ok(())
        }
        None => sink.write(data),
    }
}
