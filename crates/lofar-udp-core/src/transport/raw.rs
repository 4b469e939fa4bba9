//! Raw packet-file transport: sequential reads over a buffered file.

use super::{PortTransport, TransportError};
use crate::packet::HEADER_LEN;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

/// Sequential reader over a raw concatenation of packets.
pub struct RawTransport {
    reader: BufReader<File>,
    port: usize,
}

impl RawTransport {
    pub fn open(path: &Path, port: usize) -> Result<Self, TransportError> {
        let file = File::open(path).map_err(|e| TransportError::OpenFailed {
            port,
            reason: format!("{}: {e}", path.display()),
        })?;
        Ok(Self {
            reader: BufReader::new(file),
            port,
        })
    }
}

impl PortTransport for RawTransport {
    fn read_into(
        &mut self,
        dest: &mut [u8],
        offset: usize,
        nbytes: usize,
    ) -> Result<usize, TransportError> {
        let target = &mut dest[offset..offset + nbytes];
        let mut got = 0;
        while got < nbytes {
            match self.reader.read(&mut target[got..]) {
                Ok(0) => break,
                Ok(n) => got += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    return Err(TransportError::Io {
                        port: self.port,
                        source: e,
                    })
                }
            }
        }
        Ok(got)
    }

    fn peek_header(&mut self) -> Result<[u8; HEADER_LEN], TransportError> {
        let mut header = [0u8; HEADER_LEN];
        self.reader
            .read_exact(&mut header)
            .and_then(|_| self.reader.seek_relative(-(HEADER_LEN as i64)))
            .map_err(|e| TransportError::Io {
                port: self.port,
                source: e,
            })?;
        Ok(header)
    }
}
