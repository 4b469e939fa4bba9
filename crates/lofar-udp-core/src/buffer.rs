//! Per-port packet window with a guard-packet prefix.
//!
//! Each port owns one contiguous allocation holding
//! `window + 2` packets plus an optional reserve tail for streaming
//! decompression overshoot. Logical packet index 0 sits two packet
//! lengths into the allocation, so indices `-1` and `-2` are addressable:
//! `-1` holds the most recent previously-valid packet (for loss replay)
//! and `-2` holds a permanently zeroed packet (for zero-fill padding).
//!
//! The sliding-window shift copies tail packets back toward the start so
//! the next read appends after them; `input_data_offset` tracks where
//! that next read must land.

/// Guard packets before logical index 0.
pub const GUARD_PACKETS: usize = 2;

/// Owned backing storage for one port's packet window.
#[derive(Debug)]
pub struct PortBuffer {
    data: Vec<u8>,
    packet_length: usize,
    window_packets: usize,
    input_data_offset: usize,
}

impl PortBuffer {
    /// Allocate a zeroed buffer for `window_packets` packets of
    /// `packet_length` bytes, with `reserve` extra tail bytes for
    /// decompression overshoot.
    pub fn new(packet_length: usize, window_packets: usize, reserve: usize) -> Self {
        let total = packet_length * (window_packets + GUARD_PACKETS) + reserve;
        Self {
            data: vec![0u8; total],
            packet_length,
            window_packets,
            input_data_offset: 0,
        }
    }

    #[inline]
    pub fn packet_length(&self) -> usize {
        self.packet_length
    }

    #[inline]
    pub fn window_packets(&self) -> usize {
        self.window_packets
    }

    /// Byte offset within the active region at which the next read lands.
    #[inline]
    pub fn input_data_offset(&self) -> usize {
        self.input_data_offset
    }

    #[inline]
    pub fn set_input_data_offset(&mut self, offset: usize) {
        self.input_data_offset = offset;
    }

    /// Byte index of logical packet 0 within the allocation.
    #[inline]
    fn base(&self) -> usize {
        GUARD_PACKETS * self.packet_length
    }

    /// Full packet at a signed logical index in `[-2, window)`.
    #[inline]
    pub fn packet(&self, index: isize) -> &[u8] {
        let start = self.raw_offset(index * self.packet_length as isize);
        &self.data[start..start + self.packet_length]
    }

    /// Payload of the packet at a signed logical index.
    #[inline]
    pub fn payload(&self, index: isize) -> &[u8] {
        &self.packet(index)[crate::packet::HEADER_LEN..]
    }

    /// Active region plus reserve, starting at logical byte 0; reads and
    /// streaming decompression land here.
    #[inline]
    pub fn active_mut(&mut self) -> &mut [u8] {
        let base = self.base();
        &mut self.data[base..]
    }

    /// Translate a signed logical byte offset to an allocation index.
    #[inline]
    fn raw_offset(&self, logical: isize) -> usize {
        let raw = self.base() as isize + logical;
        debug_assert!(raw >= 0, "offset before the guard region");
        raw as usize
    }

    /// Overlapping-safe copy between signed logical byte offsets.
    pub fn copy_logical(&mut self, src: isize, dst: isize, len: usize) {
        let src = self.raw_offset(src);
        let dst = self.raw_offset(dst);
        self.data.copy_within(src..src + len, dst);
    }

    /// Wipe the zero-guard packet at index `-2` so replayed padding reads
    /// as silence when loss replay is disabled.
    pub fn zero_guard(&mut self) {
        let start = self.raw_offset(-2 * self.packet_length as isize);
        let len = self.packet_length;
        self.data[start..start + len].fill(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::HEADER_LEN;

    #[test]
    fn allocation_covers_guards_and_reserve() {
        let buf = PortBuffer::new(100, 4, 37);
        assert_eq!(buf.packet(-2).len(), 100);
        assert_eq!(buf.packet(3).len(), 100);
        // Active region: 4 packets + reserve.
        let mut buf = buf;
        assert_eq!(buf.active_mut().len(), 4 * 100 + 37);
    }

    #[test]
    fn logical_indexing() {
        let mut buf = PortBuffer::new(32, 4, 0);
        buf.active_mut()[0] = 0xaa;
        buf.active_mut()[32] = 0xbb;
        assert_eq!(buf.packet(0)[0], 0xaa);
        assert_eq!(buf.packet(1)[0], 0xbb);
        assert_eq!(buf.payload(0).len(), 32 - HEADER_LEN);
    }

    #[test]
    fn copy_into_guard_region() {
        let mut buf = PortBuffer::new(32, 4, 0);
        for (i, b) in buf.active_mut()[3 * 32..4 * 32].iter_mut().enumerate() {
            *b = i as u8;
        }
        // Move the last packet into the replay guard slot.
        buf.copy_logical(3 * 32, -32, 32);
        assert_eq!(buf.packet(-1)[5], 5);
    }

    #[test]
    fn zero_guard_wipes_only_index_minus_two() {
        let mut buf = PortBuffer::new(16, 2, 0);
        buf.copy_logical(0, -16, 16);
        buf.active_mut()[..16].fill(0x7f);
        buf.copy_logical(0, -32, 16);
        buf.zero_guard();
        assert!(buf.packet(-2).iter().all(|&b| b == 0));
        // Replay guard untouched.
        assert_eq!(buf.packet(-1)[0], 0);
    }

    #[test]
    fn overlapping_shift() {
        let mut buf = PortBuffer::new(8, 4, 0);
        let active = buf.active_mut();
        for (i, b) in active.iter_mut().take(32).enumerate() {
            *b = i as u8;
        }
        // Shift the last two packets (with one guard packet of padding)
        // back to logical -1, as the reader's shift protocol does.
        buf.copy_logical(8, -8, 24);
        assert_eq!(buf.packet(-1)[0], 8);
        assert_eq!(buf.packet(0)[0], 16);
        assert_eq!(buf.packet(1)[0], 24);
    }
}
