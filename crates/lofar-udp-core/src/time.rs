//! Packet-number and time conversions.
//!
//! LOFAR beamformed packets carry a Unix timestamp (seconds) and an
//! intra-second sequence counter. The two are collapsed into a single
//! monotonic packet number, which the reader uses as its only alignment
//! key. The conversion depends on the station clock: 200 MHz stations
//! emit 195312.5 sample blocks per second, 160 MHz stations 156250.

/// Observations predating the LOFAR epoch (2008-01-01T00:00:00 UTC) are
/// malformed; packet targets below this are treated as "do not align".
pub const LOFAR_EPOCH: i64 = 1_199_145_600;

/// Days between the MJD epoch (1858-11-17) and the Unix epoch.
pub const MJD_UNIX_EPOCH_DAYS: f64 = 40_587.0;

/// Sample period in seconds for the 200 MHz clock (1024 / 200e6).
pub const SAMPLE_PERIOD_200MHZ: f64 = 5.12e-6;

/// Sample period in seconds for the 160 MHz clock (1024 / 160e6).
pub const SAMPLE_PERIOD_160MHZ: f64 = 6.4e-6;

/// Sample period for the given clock bit.
#[inline]
pub fn sample_period(clock_200mhz: bool) -> f64 {
    if clock_200mhz {
        SAMPLE_PERIOD_200MHZ
    } else {
        SAMPLE_PERIOD_160MHZ
    }
}

/// Collapse a header timestamp and sequence counter into a packet number.
///
/// `(seconds * 1e6 * (160 + 40 * clock) + 512) / 1024` converts seconds to
/// sample blocks on the station clock; adding the sequence counter and
/// dividing by the 16 timeslices per packet yields the packet index.
#[inline]
pub fn packet_number_from_fields(timestamp: u32, sequence: u32, clock_200mhz: bool) -> i64 {
    let blocks_per_mhz: i64 = 160 + 40 * clock_200mhz as i64;
    ((timestamp as i64 * 1_000_000 * blocks_per_mhz + 512) / 1024 + sequence as i64) / 16
}

/// Packet number of the first packet at or after the given Unix time.
pub fn packet_from_unix_time(unix_seconds: f64, clock_200mhz: bool) -> i64 {
    let whole = unix_seconds.floor() as u32;
    let frac = unix_seconds - unix_seconds.floor();
    let sequence = (frac / sample_period(clock_200mhz) / 16.0).round() as u32 * 16;
    packet_number_from_fields(whole, sequence, clock_200mhz)
}

/// Unix time (seconds, fractional) of the first sample of a packet.
pub fn packet_unix_time(packet: i64, clock_200mhz: bool) -> f64 {
    packet as f64 * 16.0 * sample_period(clock_200mhz)
}

/// MJD of the first sample of a packet, as fed to the beam-model helper.
pub fn packet_mjd(packet: i64, clock_200mhz: bool) -> f64 {
    packet_unix_time(packet, clock_200mhz) / 86_400.0 + MJD_UNIX_EPOCH_DAYS
}
