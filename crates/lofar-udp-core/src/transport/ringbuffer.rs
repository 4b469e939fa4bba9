//! Shared-memory ring-buffer transport.
//!
//! An externally-managed single-producer queue in a memory-mapped file,
//! addressed by a numeric key (`/dev/shm/lofar-udp-<key>.buf`). The
//! layout is a 128-byte `#[repr(C)]` control header with monotonic
//! atomic head/tail counters, followed by a circular data region. After
//! attaching, the reader rounds its cursor up to the next packet
//! boundary so a mid-packet tail never desynchronises the stream; the
//! boundary comes from the parsed geometry, not a hard-coded length.
//!
//! Reads block until the producer supplies the requested bytes or marks
//! the stream finished; only a finished, drained queue returns short.

use super::{PortTransport, TransportError};
use crate::packet::HEADER_LEN;
use memmap2::{MmapMut, MmapOptions};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

const MAGIC: u64 = 0x4c_4f_46_41_52_55_44_50; // "LOFARUDP"
const CONTROL_LEN: usize = 128;

/// Control block at the head of the shared mapping.
///
/// `#[repr(C)]` so the capture side can be written in any language.
#[repr(C)]
struct RingControl {
    magic: u64,
    capacity: u64,
    /// Monotonic count of bytes written.
    write_head: AtomicU64,
    /// Monotonic count of bytes consumed.
    read_tail: AtomicU64,
    /// Producer sets this once no further data will arrive.
    finished: AtomicU64,
    _pad: [u8; CONTROL_LEN - 40],
}

const _: () = assert!(std::mem::size_of::<RingControl>() == CONTROL_LEN);

/// Default path for a keyed ring buffer.
pub fn ring_path(key: u32) -> PathBuf {
    PathBuf::from(format!("/dev/shm/lofar-udp-{key:#07x}.buf"))
}

/// One shared-memory queue endpoint. Single producer, single consumer.
pub struct SharedRing {
    // Keeps the mapping alive; all access goes through the raw pointers.
    _map: MmapMut,
    control: *const RingControl,
    data: *mut u8,
    capacity: usize,
}

// Safety: the control block is only accessed through atomics, and the
// data region is partitioned by the head/tail protocol (the producer
// writes only beyond `write_head`, the consumer reads only before it).
unsafe impl Send for SharedRing {}

impl SharedRing {
    /// Create a fresh ring of `capacity` data bytes at `path`.
    pub fn create(path: &Path, capacity: usize) -> std::io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len((CONTROL_LEN + capacity) as u64)?;

        // Safety: freshly sized file, mapping outlives all pointer use.
        let mut map = unsafe { MmapOptions::new().map_mut(&file)? };
        let control = map.as_mut_ptr() as *mut RingControl;
        // Safety: the mapping is at least CONTROL_LEN bytes.
        unsafe {
            (*control).magic = MAGIC;
            (*control).capacity = capacity as u64;
            (*control).write_head = AtomicU64::new(0);
            (*control).read_tail = AtomicU64::new(0);
            (*control).finished = AtomicU64::new(0);
        }
        let data = unsafe { map.as_mut_ptr().add(CONTROL_LEN) };

        Ok(Self {
            _map: map,
            control,
            data,
            capacity,
        })
    }

    /// Attach to an existing ring created by the producer.
    pub fn attach(path: &Path) -> std::io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let mut map = unsafe { MmapOptions::new().map_mut(&file)? };
        if map.len() < CONTROL_LEN {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "mapping shorter than the ring control block",
            ));
        }
        let control = map.as_mut_ptr() as *mut RingControl;
        // Safety: length checked above.
        let (magic, capacity) = unsafe { ((*control).magic, (*control).capacity as usize) };
        if magic != MAGIC {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "ring control magic mismatch",
            ));
        }
        if map.len() < CONTROL_LEN + capacity {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "mapping shorter than the advertised capacity",
            ));
        }
        let data = unsafe { map.as_mut_ptr().add(CONTROL_LEN) };

        Ok(Self {
            _map: map,
            control,
            data,
            capacity,
        })
    }

    #[inline]
    fn control(&self) -> &RingControl {
        // Safety: validated at construction, lives as long as the mapping.
        unsafe { &*self.control }
    }

    /// Append bytes, waiting for the consumer when the ring is full.
    pub fn write(&self, bytes: &[u8]) -> std::io::Result<()> {
        let mut written = 0;
        while written < bytes.len() {
            let head = self.control().write_head.load(Ordering::Acquire);
            let tail = self.control().read_tail.load(Ordering::Acquire);
            let free = self.capacity - (head - tail) as usize;
            if free == 0 {
                std::thread::sleep(Duration::from_micros(200));
                continue;
            }

            let chunk = free.min(bytes.len() - written);
            let at = (head as usize) % self.capacity;
            let first = chunk.min(self.capacity - at);
            // Safety: [at, at + first) and the wrapped remainder lie in the
            // data region, which only the producer writes past `head`.
            unsafe {
                std::ptr::copy_nonoverlapping(bytes[written..].as_ptr(), self.data.add(at), first);
                if chunk > first {
                    std::ptr::copy_nonoverlapping(
                        bytes[written + first..].as_ptr(),
                        self.data,
                        chunk - first,
                    );
                }
            }
            self.control()
                .write_head
                .store(head + chunk as u64, Ordering::Release);
            written += chunk;
        }
        Ok(())
    }

    /// Mark the stream complete; readers drain and then see end of data.
    pub fn finish(&self) {
        self.control().finished.store(1, Ordering::Release);
    }

    fn finished(&self) -> bool {
        self.control().finished.load(Ordering::Acquire) != 0
    }

    /// Copy bytes at the current tail without consuming them, waiting for
    /// the producer if necessary. Returns false if the stream finishes
    /// before `out.len()` bytes exist.
    fn peek(&self, out: &mut [u8]) -> bool {
        loop {
            let head = self.control().write_head.load(Ordering::Acquire);
            let tail = self.control().read_tail.load(Ordering::Acquire);
            if (head - tail) as usize >= out.len() {
                self.copy_out(tail, out);
                return true;
            }
            if self.finished() {
                return false;
            }
            std::thread::sleep(Duration::from_micros(200));
        }
    }

    fn copy_out(&self, from: u64, out: &mut [u8]) {
        let at = (from as usize) % self.capacity;
        let first = out.len().min(self.capacity - at);
        // Safety: the region before `write_head` is stable until the
        // consumer advances `read_tail` past it.
        unsafe {
            std::ptr::copy_nonoverlapping(self.data.add(at), out.as_mut_ptr(), first);
            if out.len() > first {
                std::ptr::copy_nonoverlapping(
                    self.data,
                    out[first..].as_mut_ptr(),
                    out.len() - first,
                );
            }
        }
    }

    /// Blocking read of up to `out.len()` bytes; short only when the
    /// producer has finished and the queue is drained.
    fn read(&self, out: &mut [u8]) -> usize {
        let mut got = 0;
        while got < out.len() {
            let head = self.control().write_head.load(Ordering::Acquire);
            let tail = self.control().read_tail.load(Ordering::Acquire);
            let avail = (head - tail) as usize;
            if avail == 0 {
                if self.finished() {
                    break;
                }
                std::thread::sleep(Duration::from_micros(200));
                continue;
            }

            let chunk = avail.min(out.len() - got);
            self.copy_out(tail, &mut out[got..got + chunk]);
            self.control()
                .read_tail
                .store(tail + chunk as u64, Ordering::Release);
            got += chunk;
        }
        got
    }

    /// Round the read cursor up to the next multiple of `boundary`.
    fn align_tail(&self, boundary: usize) {
        if boundary <= 1 {
            return;
        }
        let tail = self.control().read_tail.load(Ordering::Acquire);
        let aligned = tail.div_ceil(boundary as u64) * boundary as u64;
        self.control().read_tail.store(aligned, Ordering::Release);
    }
}

/// Port transport over a [`SharedRing`].
pub struct RingBufferTransport {
    ring: SharedRing,
    port: usize,
}

impl RingBufferTransport {
    /// Attach to the keyed ring for `port` and align to a packet boundary.
    pub fn attach(key: u32, port: usize, packet_length: usize) -> Result<Self, TransportError> {
        Self::attach_path(&ring_path(key), port, packet_length)
    }

    /// Attach to a ring at an explicit path; used by test rigs and
    /// non-standard deployments.
    pub fn attach_path(
        path: &Path,
        port: usize,
        packet_length: usize,
    ) -> Result<Self, TransportError> {
        let ring = SharedRing::attach(path).map_err(|e| TransportError::OpenFailed {
            port,
            reason: format!("{}: {e}", path.display()),
        })?;
        ring.align_tail(packet_length);
        Ok(Self { ring, port })
    }
}

impl PortTransport for RingBufferTransport {
    fn read_into(
        &mut self,
        dest: &mut [u8],
        offset: usize,
        nbytes: usize,
    ) -> Result<usize, TransportError> {
        Ok(self.ring.read(&mut dest[offset..offset + nbytes]))
    }

    fn peek_header(&mut self) -> Result<[u8; HEADER_LEN], TransportError> {
        let mut header = [0u8; HEADER_LEN];
        if !self.ring.peek(&mut header) {
            return Err(TransportError::Io {
                port: self.port,
                source: std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "ring finished before one header arrived",
                ),
            });
        }
        Ok(header)
    }
}
