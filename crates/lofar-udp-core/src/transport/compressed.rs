//! Zstandard-compressed packet-file transport.
//!
//! The whole compressed file is memory-mapped read-only and advised as
//! sequentially accessed; decompression streams directly into the
//! consumer's port buffer. Frames rarely end on a packet boundary, so a
//! read may overproduce into the buffer's reserve tail; the produced
//! position is exposed to the shift protocol, which carries the
//! overshoot to the next iteration instead of discarding it.

use super::{PortTransport, TransportError};
use crate::packet::HEADER_LEN;
use memmap2::{Advice, Mmap, UncheckedAdvice};
use std::fs::File;
use std::path::Path;
use tracing::warn;
use zstd::stream::raw::{Decoder, InBuffer, Operation, OutBuffer};

/// Reserve tail granularity for destination buffers, matching the
/// recommended zstd streaming output chunk.
pub const DECOMPRESSION_CHUNK: usize = 128 * 1024;

/// Reserve bytes a destination of `window_bytes` needs so a frame can
/// overshoot the window without truncation.
pub fn reserve_for(window_bytes: usize) -> usize {
    DECOMPRESSION_CHUNK - (window_bytes % DECOMPRESSION_CHUNK)
}

/// Streaming-decompression reader over a memory-mapped zstd file.
pub struct CompressedTransport {
    // Held to keep the mapping valid for the transport's lifetime.
    _file: File,
    map: Mmap,
    decoder: Decoder<'static>,
    /// Compressed bytes consumed from the map.
    reading_pos: usize,
    /// Bytes produced into the destination, from logical byte 0.
    output_pos: usize,
    port: usize,
}

impl CompressedTransport {
    pub fn open(path: &Path, port: usize) -> Result<Self, TransportError> {
        let open_failed = |reason: String| TransportError::OpenFailed { port, reason };

        let file =
            File::open(path).map_err(|e| open_failed(format!("{}: {e}", path.display())))?;
        let len = file
            .metadata()
            .map_err(|e| open_failed(e.to_string()))?
            .len();
        if len == 0 {
            return Err(open_failed(format!("{}: empty input", path.display())));
        }

        // Safety: the mapping is read-only and the file handle is kept
        // alive alongside it.
        let map = unsafe { Mmap::map(&file) }.map_err(|e| open_failed(e.to_string()))?;
        if let Err(e) = map.advise(Advice::Sequential) {
            warn!(port, error = %e, "madvise(SEQUENTIAL) on compressed input failed");
        }

        let decoder = Decoder::new().map_err(|e| open_failed(e.to_string()))?;

        Ok(Self {
            _file: file,
            map,
            decoder,
            reading_pos: 0,
            output_pos: 0,
            port,
        })
    }

    /// Compressed bytes consumed so far.
    pub fn reading_position(&self) -> usize {
        self.reading_pos
    }
}

impl PortTransport for CompressedTransport {
    fn read_into(
        &mut self,
        dest: &mut [u8],
        offset: usize,
        nbytes: usize,
    ) -> Result<usize, TransportError> {
        let target = offset + nbytes;

        while self.output_pos < target && self.reading_pos < self.map.len() {
            let mut input = InBuffer::around(&self.map[self.reading_pos..]);
            let mut output = OutBuffer::around(&mut dest[self.output_pos..]);

            self.decoder
                .run(&mut input, &mut output)
                .map_err(|e| TransportError::Io {
                    port: self.port,
                    source: e,
                })?;

            if input.pos == 0 && output.pos() == 0 {
                return Err(TransportError::Io {
                    port: self.port,
                    source: std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        "decompression stalled without progress",
                    ),
                });
            }

            self.reading_pos += input.pos;
            self.output_pos += output.pos();
        }

        Ok(self.output_pos.min(target) - offset)
    }

    fn peek_header(&mut self) -> Result<[u8; HEADER_LEN], TransportError> {
        if self.reading_pos != 0 || self.output_pos != 0 {
            return Err(TransportError::Io {
                port: self.port,
                source: std::io::Error::new(
                    std::io::ErrorKind::Unsupported,
                    "header peek after decompression started",
                ),
            });
        }

        // One-shot side decoder so the main stream state is untouched.
        let mut decoder = Decoder::new().map_err(|e| TransportError::Io {
            port: self.port,
            source: e,
        })?;
        let mut header = [0u8; HEADER_LEN];
        let mut produced = 0;
        let mut consumed = 0;
        while produced < HEADER_LEN && consumed < self.map.len() {
            let mut input = InBuffer::around(&self.map[consumed..]);
            let mut output = OutBuffer::around(&mut header[produced..]);
            decoder.run(&mut input, &mut output).map_err(|e| {
                TransportError::Io {
                    port: self.port,
                    source: e,
                }
            })?;
            if input.pos == 0 && output.pos() == 0 {
                break;
            }
            consumed += input.pos;
            produced += output.pos();
        }

        if produced < HEADER_LEN {
            return Err(TransportError::Io {
                port: self.port,
                source: std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "input shorter than one header",
                ),
            });
        }
        Ok(header)
    }

    fn output_position(&self) -> usize {
        self.output_pos
    }

    fn set_output_position(&mut self, pos: usize) {
        self.output_pos = pos;
    }

    fn advise_consumed(&mut self) {
        if self.reading_pos == 0 {
            return;
        }
        if let Err(e) = unsafe {
            self.map
                .unchecked_advise_range(UncheckedAdvice::DontNeed, 0, self.reading_pos)
        } {
            warn!(
                port = self.port,
                error = %e,
                "madvise(DONTNEED) on consumed compressed input failed"
            );
        }
    }
}
