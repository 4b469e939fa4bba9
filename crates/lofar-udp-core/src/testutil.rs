//! Synthetic packet streams for unit tests.

use crate::packet::{HEADER_LEN, MIN_RSP_VERSION, POLARISATIONS, TIMESLICES_PER_PACKET};
use std::io::Write;
use tempfile::NamedTempFile;

/// Build a header from raw fields. `bit_mode_raw` is the wire selector
/// (0 = 16-bit, 1 = 8-bit, 2 = 4-bit, 3 = illegal).
pub fn build_header(
    timestamp: u32,
    sequence: u32,
    beamlets: u8,
    bit_mode_raw: u8,
    clock_200mhz: bool,
) -> [u8; HEADER_LEN] {
    let mut header = [0u8; HEADER_LEN];
    header[0] = MIN_RSP_VERSION;
    let source: u16 = ((clock_200mhz as u16) << 7) | ((bit_mode_raw as u16) << 8);
    header[1..3].copy_from_slice(&source.to_le_bytes());
    // Station id 213 (IE613) as the raw RSP code.
    header[4..6].copy_from_slice(&(213i16 * 32).to_le_bytes());
    header[6] = beamlets;
    header[7] = TIMESLICES_PER_PACKET as u8;
    header[8..12].copy_from_slice(&timestamp.to_le_bytes());
    header[12..16].copy_from_slice(&sequence.to_le_bytes());
    header
}

/// Build a header whose packet number equals `packet` exactly.
pub fn header_for_packet(
    packet: i64,
    beamlets: u8,
    bit_mode_raw: u8,
    clock_200mhz: bool,
) -> [u8; HEADER_LEN] {
    let blocks_per_mhz: i64 = 160 + 40 * clock_200mhz as i64;
    let mut timestamp = packet * 16 * 1024 / (1_000_000 * blocks_per_mhz);
    loop {
        let blocks = (timestamp * 1_000_000 * blocks_per_mhz + 512) / 1024;
        let sequence = packet * 16 - blocks;
        if sequence < 0 {
            timestamp -= 1;
            continue;
        }
        let per_second = ((timestamp + 1) * 1_000_000 * blocks_per_mhz + 512) / 1024 - blocks;
        if sequence >= per_second {
            timestamp += 1;
            continue;
        }
        return build_header(
            timestamp as u32,
            sequence as u32,
            beamlets,
            bit_mode_raw,
            clock_200mhz,
        );
    }
}

/// Payload byte count for a beamlet count and wire bit-mode selector.
pub fn payload_len(beamlets: u8, bit_mode_raw: u8) -> usize {
    let bits = match bit_mode_raw {
        0 => 16,
        1 => 8,
        2 => 4,
        _ => panic!("illegal bit mode"),
    };
    beamlets as usize * TIMESLICES_PER_PACKET * POLARISATIONS * bits / 8
}

/// One packet with a payload derived from the packet number, so holes
/// and replays are detectable in the output bytes.
pub fn build_packet(packet: i64, beamlets: u8, bit_mode_raw: u8, clock_200mhz: bool) -> Vec<u8> {
    let header = header_for_packet(packet, beamlets, bit_mode_raw, clock_200mhz);
    let mut bytes = header.to_vec();
    let len = payload_len(beamlets, bit_mode_raw);
    bytes.extend((0..len).map(|i| (packet as usize + i) as u8));
    bytes
}

/// Concatenate packets with the given numbers into one raw stream.
pub fn build_stream(packets: &[i64], beamlets: u8, bit_mode_raw: u8, clock_200mhz: bool) -> Vec<u8> {
    packets
        .iter()
        .flat_map(|&p| build_packet(p, beamlets, bit_mode_raw, clock_200mhz))
        .collect()
}

/// Write a stream to a temporary file kept alive by the returned handle.
pub fn write_stream(stream: &[u8]) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("temp file");
    file.write_all(stream).expect("write stream");
    file.flush().expect("flush stream");
    file
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet;

    #[test]
    fn synthesised_packet_numbers_are_exact() {
        for &p in &[130_000_000_000i64, 130_000_012_207, 98_765_432_100] {
            let header = header_for_packet(p, 10, 1, true);
            assert_eq!(packet::packet_number(&header), p);
        }
    }

    #[test]
    fn synthesised_160mhz_numbers_are_exact() {
        let header = header_for_packet(100_000_000_000, 10, 1, false);
        assert_eq!(packet::packet_number(&header), 100_000_000_000);
    }

    #[test]
    fn stream_length_matches_geometry() {
        let stream = build_stream(&[1_000_000_000_000, 1_000_000_000_001], 4, 1, true);
        assert_eq!(stream.len(), 2 * (HEADER_LEN + 4 * 64));
    }
}
