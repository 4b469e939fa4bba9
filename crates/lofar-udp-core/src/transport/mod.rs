//! Input transports.
//!
//! Three source types sit behind one contract: raw packet files,
//! zstandard-compressed packet files decompressed streamingly into the
//! consumer's buffer, and externally-managed shared-memory ring buffers.
//! The session holds one boxed transport per port.
//!
//! A transport's `read_into` fills the caller's buffer starting at a
//! given offset and returns how many of the requested bytes it produced;
//! a short count only ever means the source is exhausted. The compressed
//! variant may additionally overproduce into the buffer's reserve tail;
//! the shift protocol carries that overshoot to the next iteration via
//! [`PortTransport::output_position`].

mod compressed;
mod raw;
mod ringbuffer;

pub use compressed::{reserve_for, CompressedTransport, DECOMPRESSION_CHUNK};
pub use raw::RawTransport;
pub use ringbuffer::{ring_path, RingBufferTransport, SharedRing};

use crate::config::{InputSpec, ReaderConfig};
use crate::packet::{Geometry, HEADER_LEN};

/// Transport failures. Everything at open time collapses into
/// `OpenFailed`; read-time I/O errors (other than running out of data,
/// which is a short count) are fatal.
#[derive(Debug)]
pub enum TransportError {
    OpenFailed { port: usize, reason: String },
    Io { port: usize, source: std::io::Error },
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportError::OpenFailed { port, reason } => {
                write!(f, "failed to open input for port {port}: {reason}")
            }
            TransportError::Io { port, source } => {
                write!(f, "I/O failure on port {port}: {source}")
            }
        }
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TransportError::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Capability set shared by all input variants.
pub trait PortTransport: Send {
    /// Produce up to `nbytes` into `dest[offset..]`, returning how many of
    /// the requested bytes were produced. Short counts mean the source is
    /// exhausted. `dest` is the port buffer's full active region including
    /// any reserve tail, so streaming decompression may legally overshoot
    /// past `offset + nbytes`.
    fn read_into(
        &mut self,
        dest: &mut [u8],
        offset: usize,
        nbytes: usize,
    ) -> Result<usize, TransportError>;

    /// Copy of the next header, leaving the stream positioned so the next
    /// `read_into` returns the same bytes.
    fn peek_header(&mut self) -> Result<[u8; HEADER_LEN], TransportError>;

    /// Bytes produced into the destination beyond logical byte 0 of the
    /// port buffer. Only transports that can overproduce track this;
    /// others report 0 and the shift protocol carries nothing.
    fn output_position(&self) -> usize {
        0
    }

    /// Rebase the produced-bytes position after the shift protocol moves
    /// carried bytes toward the start of the buffer.
    fn set_output_position(&mut self, _pos: usize) {}

    /// Advisory hint that all consumed source bytes may be released.
    /// Failures are logged by the implementation, never propagated.
    fn advise_consumed(&mut self) {}
}

/// Open the configured transport variant for one port.
pub fn open_for_port(
    config: &ReaderConfig,
    port: usize,
    geometry: &Geometry,
) -> Result<Box<dyn PortTransport>, TransportError> {
    let packet_length = geometry.ports[port].packet_length;
    match &config.input {
        InputSpec::Raw { paths } => Ok(Box::new(RawTransport::open(&paths[port], port)?)),
        InputSpec::Compressed { paths } => {
            Ok(Box::new(CompressedTransport::open(&paths[port], port)?))
        }
        InputSpec::Ring {
            base_key,
            key_offset,
        } => {
            let key = base_key + port as u32 * key_offset;
            Ok(Box::new(RingBufferTransport::attach(
                key,
                port,
                packet_length,
            )?))
        }
    }
}

/// Read the first header of a port before any geometry exists, leaving no
/// persistent stream behind. Ring buffers peek in place (nothing is
/// consumed); file-backed variants open, peek and drop.
pub fn peek_first_header(
    config: &ReaderConfig,
    port: usize,
) -> Result<[u8; HEADER_LEN], TransportError> {
    match &config.input {
        InputSpec::Raw { paths } => RawTransport::open(&paths[port], port)?.peek_header(),
        InputSpec::Compressed { paths } => {
            CompressedTransport::open(&paths[port], port)?.peek_header()
        }
        InputSpec::Ring {
            base_key,
            key_offset,
        } => {
            let key = base_key + port as u32 * key_offset;
            // Packet length is unknown before the parse; peek without
            // aligning and let the real attach round the cursor up.
            RingBufferTransport::attach(key, port, 1)?.peek_header()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReaderConfig;
    use crate::testutil::{build_stream, write_stream};
    use std::io::Write;

    #[test]
    fn raw_reads_are_byte_identical_to_input() {
        let stream = build_stream(&[100, 101, 102], 4, 1, true);
        let file = write_stream(&stream);
        let mut transport = RawTransport::open(file.path(), 0).unwrap();

        let mut dest = vec![0u8; stream.len()];
        let n = transport.read_into(&mut dest, 0, stream.len()).unwrap();
        assert_eq!(n, stream.len());
        assert_eq!(dest, stream);
    }

    #[test]
    fn raw_short_read_at_eof() {
        let stream = build_stream(&[100], 4, 1, true);
        let file = write_stream(&stream);
        let mut transport = RawTransport::open(file.path(), 0).unwrap();

        let mut dest = vec![0u8; stream.len() * 2];
        let n = transport
            .read_into(&mut dest, 0, stream.len() * 2)
            .unwrap();
        assert_eq!(n, stream.len());
    }

    #[test]
    fn raw_peek_does_not_consume() {
        let stream = build_stream(&[100, 101], 4, 1, true);
        let file = write_stream(&stream);
        let mut transport = RawTransport::open(file.path(), 0).unwrap();

        let header = transport.peek_header().unwrap();
        assert_eq!(&header[..], &stream[..HEADER_LEN]);

        let mut dest = vec![0u8; HEADER_LEN];
        transport.read_into(&mut dest, 0, HEADER_LEN).unwrap();
        assert_eq!(&dest[..], &stream[..HEADER_LEN]);
    }

    #[test]
    fn compressed_matches_raw_bytes() {
        let stream = build_stream(&[100, 101, 102, 103], 4, 1, true);
        let compressed = zstd::encode_all(&stream[..], 3).unwrap();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&compressed).unwrap();
        file.flush().unwrap();

        let mut transport = CompressedTransport::open(file.path(), 0).unwrap();
        let mut dest = vec![0u8; stream.len() + 256 * 1024];
        let n = transport.read_into(&mut dest, 0, stream.len()).unwrap();
        assert_eq!(n, stream.len());
        assert_eq!(&dest[..stream.len()], &stream[..]);
    }

    #[test]
    fn compressed_short_when_input_exhausted() {
        let stream = build_stream(&[100, 101], 4, 1, true);
        let compressed = zstd::encode_all(&stream[..], 3).unwrap();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&compressed).unwrap();
        file.flush().unwrap();

        let mut transport = CompressedTransport::open(file.path(), 0).unwrap();
        let mut dest = vec![0u8; stream.len() * 2 + 256 * 1024];
        let n = transport
            .read_into(&mut dest, 0, stream.len() * 2)
            .unwrap();
        assert_eq!(n, stream.len());
    }

    #[test]
    fn compressed_peek_then_read() {
        let stream = build_stream(&[100, 101], 4, 1, true);
        let compressed = zstd::encode_all(&stream[..], 3).unwrap();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&compressed).unwrap();
        file.flush().unwrap();

        let mut transport = CompressedTransport::open(file.path(), 0).unwrap();
        let header = transport.peek_header().unwrap();
        assert_eq!(&header[..], &stream[..HEADER_LEN]);

        let mut dest = vec![0u8; stream.len() + 256 * 1024];
        let n = transport.read_into(&mut dest, 0, stream.len()).unwrap();
        assert_eq!(n, stream.len());
        assert_eq!(&dest[..stream.len()], &stream[..]);
    }

    #[test]
    fn open_failures_name_the_port() {
        let mut config = ReaderConfig {
            input: InputSpec::Raw {
                paths: vec!["/nonexistent/input".into()],
            },
            num_ports: 1,
            packets_per_iteration: 4,
            ..Default::default()
        };
        config.validate().unwrap();
        let err = peek_first_header(&config, 0).unwrap_err();
        assert!(matches!(err, TransportError::OpenFailed { port: 0, .. }));
    }
}
