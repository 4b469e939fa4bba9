//! Station id to station code mapping.
//!
//! The wire header carries the raw RSP id; dividing by 32 yields the
//! station id used here. The beam-model helper is addressed by the
//! public station code (e.g. `IE613`), so the reader needs the reverse
//! mapping for the stations that produce beamformed data.

/// International and remote stations with non-sequential codes.
const INTERNATIONAL: &[(u16, &str)] = &[
    (201, "DE601"),
    (202, "DE602"),
    (203, "DE603"),
    (204, "DE604"),
    (205, "DE605"),
    (206, "FR606"),
    (207, "SE607"),
    (208, "UK608"),
    (209, "DE609"),
    (210, "PL610"),
    (211, "PL611"),
    (212, "PL612"),
    (213, "IE613"),
    (214, "LV614"),
];

/// Resolve a station id to its public station code.
///
/// Core stations (`CS`) and remote Dutch stations (`RS`) use their id
/// directly; international stations are table lookups. Unknown ids fall
/// back to a `ST<id>` placeholder so the caller can still format a
/// diagnostic.
pub fn station_code(station_id: u16) -> String {
    if let Some((_, code)) = INTERNATIONAL.iter().find(|(id, _)| *id == station_id) {
        return (*code).to_string();
    }

    match station_id {
        0..=100 => format!("CS{station_id:03}"),
        101..=200 => format!("RS{station_id:03}"),
        _ => format!("ST{station_id}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn international_stations() {
        assert_eq!(station_code(207), "SE607");
        assert_eq!(station_code(213), "IE613");
    }

    #[test]
    fn core_and_remote_stations() {
        assert_eq!(station_code(2), "CS002");
        assert_eq!(station_code(106), "RS106");
    }

    #[test]
    fn unknown_station_fallback() {
        assert_eq!(station_code(999), "ST999");
    }
}
