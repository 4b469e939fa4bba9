//! CEP wire-packet model.
//!
//! Every packet is a 16-byte little-endian header followed by a payload of
//! `beamlets x 16 timeslices x 4 polarisation components`, with the
//! component width set by the header's bit mode. This module exposes pure
//! accessors over a header view plus [`parse_headers`], which validates
//! the first header of every port and derives the session geometry.
//!
//! Header layout:
//!
//! ```text
//! offset  field
//! 0       RSP version (u8, >= 3)
//! 1..3    source field (u16): rsp id, reserved, error, clock, bit mode, flags
//! 3       board configuration (unused here)
//! 4..6    station id (i16, raw RSP code; /32 for the station number)
//! 6       beamlet count (u8)
//! 7       timeslice count (u8, always 16)
//! 8..12   timestamp (u32, Unix seconds)
//! 12..16  sequence (u32, sample offset within the second)
//! ```

use crate::time::{packet_number_from_fields, LOFAR_EPOCH};
use tracing::warn;

/// Wire header length in bytes.
pub const HEADER_LEN: usize = 16;

/// Timeslices per packet, fixed by the RSP firmware.
pub const TIMESLICES_PER_PACKET: usize = 16;

/// Polarisation components per sample: X real, X imaginary, Y real, Y imaginary.
pub const POLARISATIONS: usize = 4;

/// A station emits at most four simultaneous streams.
pub const MAX_PORTS: usize = 4;

/// Hardware maximum beamlets on one port.
pub const MAX_BEAMLETS_PER_PORT: u8 = 244;

/// Oldest RSP firmware version with this header layout.
pub const MIN_RSP_VERSION: u8 = 3;

/// Largest valid sequence counter (200 MHz clock).
pub const MAX_SEQUENCE: u32 = 195_313;

/// Sample component width, from the source field's bit-mode selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitMode {
    /// 16-bit signed components.
    Bits16,
    /// 8-bit signed components.
    Bits8,
    /// 4-bit signed components, two per byte.
    Bits4,
}

impl BitMode {
    /// Component width in bits.
    #[inline]
    pub const fn bits(self) -> usize {
        match self {
            BitMode::Bits16 => 16,
            BitMode::Bits8 => 8,
            BitMode::Bits4 => 4,
        }
    }

    /// Payload bytes for a given beamlet count.
    #[inline]
    pub const fn payload_length(self, beamlets: usize) -> usize {
        beamlets * TIMESLICES_PER_PACKET * POLARISATIONS * self.bits() / 8
    }
}

/// Decoded view of the packed source field (header bytes 1..3).
#[derive(Debug, Clone, Copy)]
pub struct SourceField(u16);

impl SourceField {
    #[inline]
    pub fn from_header(header: &[u8]) -> Self {
        SourceField(u16::from_le_bytes([header[1], header[2]]))
    }

    /// Raw RSP board id (5 bits).
    #[inline]
    pub fn rsp_id(self) -> u8 {
        (self.0 & 0x1f) as u8
    }

    /// Reserved bit; must be clear.
    #[inline]
    pub fn reserved_bit(self) -> bool {
        self.0 & (1 << 5) != 0
    }

    /// Hardware error flag; must be clear.
    #[inline]
    pub fn error_bit(self) -> bool {
        self.0 & (1 << 6) != 0
    }

    /// Clock selector: set for 200 MHz, clear for 160 MHz.
    #[inline]
    pub fn clock_200mhz(self) -> bool {
        self.0 & (1 << 7) != 0
    }

    /// Raw two-bit bit-mode selector; 3 is illegal on the wire.
    #[inline]
    pub fn bit_mode_raw(self) -> u8 {
        ((self.0 >> 8) & 0x3) as u8
    }

    #[inline]
    pub fn bit_mode(self) -> Option<BitMode> {
        match self.bit_mode_raw() {
            0 => Some(BitMode::Bits16),
            1 => Some(BitMode::Bits8),
            2 => Some(BitMode::Bits4),
            _ => None,
        }
    }

    /// Upper flag bits. A value of 1 marks data recorded through a
    /// loss-replay recorder; anything larger is a reserved pattern.
    #[inline]
    pub fn flags(self) -> u8 {
        (self.0 >> 10) as u8
    }
}

/// RSP firmware version of the emitting board.
#[inline]
pub fn rsp_version(header: &[u8]) -> u8 {
    header[0]
}

/// Station number (raw RSP station code divided by 32).
#[inline]
pub fn station_id(header: &[u8]) -> u16 {
    (i16::from_le_bytes([header[4], header[5]]) / 32) as u16
}

/// Beamlets carried by this packet.
#[inline]
pub fn beamlet_count(header: &[u8]) -> u8 {
    header[6]
}

/// Timeslices carried by this packet; 16 on current hardware.
#[inline]
pub fn timeslice_count(header: &[u8]) -> u8 {
    header[7]
}

/// Unix timestamp of the packet's first sample.
#[inline]
pub fn timestamp(header: &[u8]) -> u32 {
    u32::from_le_bytes([header[8], header[9], header[10], header[11]])
}

/// Sample-offset sequence counter within the timestamp second.
#[inline]
pub fn sequence(header: &[u8]) -> u32 {
    u32::from_le_bytes([header[12], header[13], header[14], header[15]])
}

/// Monotonic packet number; the reader's only alignment key.
///
/// The clock bit is taken from the packet itself, so this is usable
/// before any session state exists.
#[inline]
pub fn packet_number(header: &[u8]) -> i64 {
    let source = SourceField::from_header(header);
    packet_number_from_fields(timestamp(header), sequence(header), source.clock_200mhz())
}

/// Header validation failures, one per malformed condition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderParseError {
    BadVersion { port: usize, version: u8 },
    PreEpoch { port: usize, timestamp: u32 },
    SequenceOverflow { port: usize, sequence: u32 },
    TooManyBeamlets { port: usize, count: u8 },
    WrongTimesliceCount { port: usize, count: u8 },
    ReservedBitSet { port: usize },
    ErrorBitSet { port: usize },
    IllegalBitMode { port: usize },
    MixedClocks { port: usize },
    MixedBitModes { port: usize },
}

impl std::fmt::Display for HeaderParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HeaderParseError::BadVersion { port, version } => {
                write!(f, "port {port}: RSP version {version} below minimum {MIN_RSP_VERSION}")
            }
            HeaderParseError::PreEpoch { port, timestamp } => {
                write!(f, "port {port}: timestamp {timestamp} predates the LOFAR epoch")
            }
            HeaderParseError::SequenceOverflow { port, sequence } => {
                write!(f, "port {port}: sequence {sequence} exceeds the 200 MHz maximum")
            }
            HeaderParseError::TooManyBeamlets { port, count } => {
                write!(f, "port {port}: {count} beamlets exceeds the hardware maximum")
            }
            HeaderParseError::WrongTimesliceCount { port, count } => {
                write!(f, "port {port}: {count} timeslices per packet, expected {TIMESLICES_PER_PACKET}")
            }
            HeaderParseError::ReservedBitSet { port } => {
                write!(f, "port {port}: reserved source bits set")
            }
            HeaderParseError::ErrorBitSet { port } => {
                write!(f, "port {port}: hardware error bit set")
            }
            HeaderParseError::IllegalBitMode { port } => {
                write!(f, "port {port}: bit mode 3 does not exist")
            }
            HeaderParseError::MixedClocks { port } => {
                write!(f, "port {port}: clock differs from port 0; process these streams separately")
            }
            HeaderParseError::MixedBitModes { port } => {
                write!(f, "port {port}: bit mode differs from port 0; process these streams separately")
            }
        }
    }
}

impl std::error::Error for HeaderParseError {}

/// Per-port geometry derived from the first header on that port.
#[derive(Debug, Clone)]
pub struct PortGeometry {
    /// Beamlets present on the wire for this port.
    pub raw_beamlets: u32,
    /// Raw beamlets on all earlier ports.
    pub raw_cumulative: u32,
    /// First selected beamlet within this port.
    pub base_beamlet: u32,
    /// One past the last selected beamlet within this port.
    pub upper_beamlet: u32,
    /// Selected beamlets on all earlier ports.
    pub cumulative: u32,
    /// Wire packet length: header plus payload.
    pub packet_length: usize,
}

impl PortGeometry {
    /// Selected beamlets on this port.
    #[inline]
    pub fn proc_beamlets(&self) -> u32 {
        self.upper_beamlet - self.base_beamlet
    }

    /// Payload bytes per packet.
    #[inline]
    pub fn payload_length(&self) -> usize {
        self.packet_length - HEADER_LEN
    }
}

/// Session geometry shared by every component after setup.
#[derive(Debug, Clone)]
pub struct Geometry {
    pub clock_200mhz: bool,
    pub bit_mode: BitMode,
    pub station_id: u16,
    pub total_raw_beamlets: u32,
    pub total_proc_beamlets: u32,
    pub ports: Vec<PortGeometry>,
}

impl Geometry {
    #[inline]
    pub fn num_ports(&self) -> usize {
        self.ports.len()
    }

    /// Map a processed-beamlet index to its owning port and the beamlet's
    /// index within that port's payload.
    pub fn locate_beamlet(&self, proc_beamlet: u32) -> (usize, u32) {
        for (port, geo) in self.ports.iter().enumerate() {
            let span = geo.proc_beamlets();
            if proc_beamlet < geo.cumulative + span {
                return (port, geo.base_beamlet + (proc_beamlet - geo.cumulative));
            }
        }
        // Callers index within total_proc_beamlets; the last port owns the tail.
        let last = self.ports.len() - 1;
        (last, self.ports[last].upper_beamlet.saturating_sub(1))
    }
}

/// Validate the first header of every port and derive the geometry.
///
/// `beamlet_limits` is the global `[lo, hi)` selection; `(0, 0)` selects
/// everything. Ports left with no selected beamlets keep zero-width
/// selections here; dropping them entirely is the session's decision.
/// Mixed packet lengths across ports are a warning, not a failure.
pub fn parse_headers(
    headers: &[[u8; HEADER_LEN]],
    beamlet_limits: [u32; 2],
) -> Result<Geometry, HeaderParseError> {
    let mut ports: Vec<PortGeometry> = Vec::with_capacity(headers.len());
    let mut clock_200mhz = false;
    let mut bit_mode = BitMode::Bits16;
    let mut station = 0u16;
    let mut total_raw = 0u32;
    let mut total_proc = 0u32;

    let (lo, hi) = (beamlet_limits[0], beamlet_limits[1]);

    for (port, header) in headers.iter().enumerate() {
        let version = rsp_version(header);
        if version < MIN_RSP_VERSION {
            return Err(HeaderParseError::BadVersion { port, version });
        }

        let ts = timestamp(header);
        if (ts as i64) < LOFAR_EPOCH {
            return Err(HeaderParseError::PreEpoch { port, timestamp: ts });
        }

        let seq = sequence(header);
        if seq > MAX_SEQUENCE {
            return Err(HeaderParseError::SequenceOverflow { port, sequence: seq });
        }

        let beamlets = beamlet_count(header);
        if beamlets > MAX_BEAMLETS_PER_PORT {
            return Err(HeaderParseError::TooManyBeamlets { port, count: beamlets });
        }

        let slices = timeslice_count(header);
        if slices as usize != TIMESLICES_PER_PACKET {
            return Err(HeaderParseError::WrongTimesliceCount { port, count: slices });
        }

        let source = SourceField::from_header(header);
        if source.reserved_bit() {
            return Err(HeaderParseError::ReservedBitSet { port });
        }
        if source.error_bit() {
            return Err(HeaderParseError::ErrorBitSet { port });
        }
        let port_mode = match source.bit_mode() {
            Some(mode) => mode,
            None => return Err(HeaderParseError::IllegalBitMode { port }),
        };
        match source.flags() {
            0 => {}
            1 => warn!(port, "source replay-warning bit set, continuing with caution"),
            _ => return Err(HeaderParseError::ReservedBitSet { port }),
        }

        if port == 0 {
            clock_200mhz = source.clock_200mhz();
            bit_mode = port_mode;
            station = station_id(header);
        } else {
            if source.clock_200mhz() != clock_200mhz {
                return Err(HeaderParseError::MixedClocks { port });
            }
            if port_mode != bit_mode {
                return Err(HeaderParseError::MixedBitModes { port });
            }
        }

        let raw = beamlets as u32;
        let raw_cumulative = total_raw;

        // Intersect the global [lo, hi) selection with this port's span.
        let base = lo.saturating_sub(raw_cumulative).min(raw);
        let upper = if hi == 0 {
            raw
        } else {
            hi.saturating_sub(raw_cumulative).min(raw).max(base)
        };

        let packet_length = HEADER_LEN + port_mode.payload_length(raw as usize);
        if port > 0 && packet_length != ports[port - 1].packet_length {
            warn!(
                port,
                "packet length differs from previous port, proceeding with caution"
            );
        }

        ports.push(PortGeometry {
            raw_beamlets: raw,
            raw_cumulative,
            base_beamlet: base,
            upper_beamlet: upper,
            cumulative: total_proc,
            packet_length,
        });

        total_raw += raw;
        total_proc += upper - base;
    }

    Ok(Geometry {
        clock_200mhz,
        bit_mode,
        station_id: station,
        total_raw_beamlets: total_raw,
        total_proc_beamlets: total_proc,
        ports,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::build_header;

    fn header(beamlets: u8, bit_mode_raw: u8) -> [u8; HEADER_LEN] {
        build_header(1_600_000_000, 0, beamlets, bit_mode_raw, true)
    }

    #[test]
    fn accessors_round_trip() {
        let h = build_header(1_600_000_123, 4800, 122, 1, true);
        assert_eq!(rsp_version(&h), MIN_RSP_VERSION);
        assert_eq!(timestamp(&h), 1_600_000_123);
        assert_eq!(sequence(&h), 4800);
        assert_eq!(beamlet_count(&h), 122);
        assert_eq!(timeslice_count(&h) as usize, TIMESLICES_PER_PACKET);
        let src = SourceField::from_header(&h);
        assert!(src.clock_200mhz());
        assert_eq!(src.bit_mode(), Some(BitMode::Bits8));
    }

    #[test]
    fn packet_number_matches_field_math() {
        let h = build_header(1_600_000_000, 32, 122, 1, true);
        assert_eq!(
            packet_number(&h),
            packet_number_from_fields(1_600_000_000, 32, true)
        );
    }

    #[test]
    fn geometry_all_beamlets() {
        let headers = vec![header(122, 1), header(122, 1)];
        let geo = parse_headers(&headers, [0, 0]).unwrap();
        assert_eq!(geo.total_raw_beamlets, 244);
        assert_eq!(geo.total_proc_beamlets, 244);
        assert_eq!(geo.ports[1].raw_cumulative, 122);
        assert_eq!(geo.ports[1].cumulative, 122);
        // 16 header + 122 * 16 * 4 * 1 byte payload.
        assert_eq!(geo.ports[0].packet_length, 16 + 122 * 64);
    }

    #[test]
    fn geometry_beamlet_subrange() {
        let headers = vec![header(122, 1), header(122, 1)];
        let geo = parse_headers(&headers, [100, 150]).unwrap();
        assert_eq!(geo.ports[0].base_beamlet, 100);
        assert_eq!(geo.ports[0].upper_beamlet, 122);
        assert_eq!(geo.ports[1].base_beamlet, 0);
        assert_eq!(geo.ports[1].upper_beamlet, 28);
        assert_eq!(geo.total_proc_beamlets, 50);
        assert_eq!(geo.locate_beamlet(0), (0, 100));
        assert_eq!(geo.locate_beamlet(22), (1, 0));
        assert_eq!(geo.locate_beamlet(49), (1, 27));
    }

    #[test]
    fn geometry_range_outside_port() {
        let headers = vec![header(10, 1), header(10, 1)];
        let geo = parse_headers(&headers, [12, 18]).unwrap();
        assert_eq!(geo.ports[0].proc_beamlets(), 0);
        assert_eq!(geo.ports[1].base_beamlet, 2);
        assert_eq!(geo.ports[1].upper_beamlet, 8);
    }

    #[test]
    fn rejects_bad_version() {
        let mut h = header(10, 1);
        h[0] = 2;
        assert!(matches!(
            parse_headers(&[h], [0, 0]),
            Err(HeaderParseError::BadVersion { port: 0, version: 2 })
        ));
    }

    #[test]
    fn rejects_pre_epoch() {
        let h = build_header(1_000_000_000, 0, 10, 1, true);
        assert!(matches!(
            parse_headers(&[h], [0, 0]),
            Err(HeaderParseError::PreEpoch { .. })
        ));
    }

    #[test]
    fn rejects_sequence_overflow() {
        let h = build_header(1_600_000_000, MAX_SEQUENCE + 1, 10, 1, true);
        assert!(matches!(
            parse_headers(&[h], [0, 0]),
            Err(HeaderParseError::SequenceOverflow { .. })
        ));
    }

    #[test]
    fn rejects_illegal_bit_mode() {
        let h = header(10, 3);
        assert!(matches!(
            parse_headers(&[h], [0, 0]),
            Err(HeaderParseError::IllegalBitMode { port: 0 })
        ));
    }

    #[test]
    fn rejects_wrong_timeslice_count() {
        let mut h = header(10, 1);
        h[7] = 8;
        assert!(matches!(
            parse_headers(&[h], [0, 0]),
            Err(HeaderParseError::WrongTimesliceCount { port: 0, count: 8 })
        ));
    }

    #[test]
    fn rejects_error_bit() {
        let mut h = header(10, 1);
        h[1] |= 1 << 6;
        assert!(matches!(
            parse_headers(&[h], [0, 0]),
            Err(HeaderParseError::ErrorBitSet { port: 0 })
        ));
    }

    #[test]
    fn rejects_mixed_clocks() {
        let h200 = build_header(1_600_000_000, 0, 10, 1, true);
        let h160 = build_header(1_600_000_000, 0, 10, 1, false);
        assert!(matches!(
            parse_headers(&[h200, h160], [0, 0]),
            Err(HeaderParseError::MixedClocks { port: 1 })
        ));
    }

    #[test]
    fn rejects_mixed_bit_modes() {
        let a = header(10, 1);
        let b = header(10, 0);
        assert!(matches!(
            parse_headers(&[a, b], [0, 0]),
            Err(HeaderParseError::MixedBitModes { port: 1 })
        ));
    }

    #[test]
    fn four_bit_payload_length() {
        let headers = vec![header(244, 2)];
        let geo = parse_headers(&headers, [0, 0]).unwrap();
        // 244 beamlets * 16 slices * 4 components / 2 per byte.
        assert_eq!(geo.ports[0].payload_length(), 244 * 32);
    }
}
