//! Skip-to-packet alignment.
//!
//! Given a target packet number, every port's window is advanced in
//! lock-step until the target lies inside it, then the within-window
//! offset is found by a bounded binary search that tolerates holes: if
//! the exact target was lost, the target advances by one and the search
//! interval widens. A final pass repeats the skip from the per-port
//! maximum first packet, removing the residual one-packet deltas packet
//! loss can leave between ports.

use super::{ReaderError, UdpReader};
use crate::packet;
use std::io::Write;
use tracing::warn;

/// Extra scan iterations allowed beyond the ideal target distance.
const SCAN_MARGIN: i64 = 16;

/// Binary-search iterations before declaring non-convergence; each
/// halving or widening costs one.
const SEARCH_ITERATION_CAP: usize = 128;

impl UdpReader {
    fn port_packet(&self, port: usize, index: i64) -> i64 {
        packet::packet_number(self.ports[port].buffer.packet(index as isize))
    }

    /// Advance every port until `last_packet` (the target) is the first
    /// packet of its window.
    pub(super) fn skip_to_packet(&mut self) -> Result<(), ReaderError> {
        let target = self.last_packet;
        let num_ports = self.ports.len();

        // The target must not predate any port's data.
        let mut min_first = i64::MAX;
        for port in 0..num_ports {
            let first = self.port_packet(port, 0);
            min_first = min_first.min(first);
            if first > target {
                return Err(ReaderError::TargetInPast {
                    port,
                    requested: target,
                    first,
                });
            }
        }

        // Initial deficits: how much of each window the next read must
        // replace. A port already past the target skips its reads.
        let ppi = self.packets_per_iteration;
        for port in 0..num_ports {
            let first = self.port_packet(port, 0);
            let last = self.port_packet(port, ppi - 1);
            self.ports[port].last_dropped = if last >= target {
                ppi
            } else {
                (last - (first + ppi)).clamp(0, ppi)
            };
        }

        // Bounded lock-step scan: reads fan out across every port each
        // iteration, so all windows advance together.
        let read_budget = (target - min_first) / ppi.max(1) + SCAN_MARGIN;
        let mut reads_done = 0i64;

        for port in 0..num_ports {
            let mut last_index = self.packets_per_iteration - 1;
            let mut current = self.port_packet(port, last_index);
            let initial_delta = (target - current).max(1);
            let mut scanning = false;

            while current < target {
                scanning = true;
                reads_done += 1;
                if reads_done > read_budget {
                    return Err(ReaderError::AlignFailed(format!(
                        "scan exceeded its read budget ({read_budget}) before packet {target}"
                    )));
                }

                self.read_step()?;
                last_index = self.packets_per_iteration - 1;
                if last_index < 0 {
                    return Err(ReaderError::AlignFailed(format!(
                        "input exhausted while scanning to packet {target}"
                    )));
                }
                current = self.port_packet(port, last_index);

                let ppi = self.packets_per_iteration;
                for inner in 0..num_ports {
                    let inner_last = self.port_packet(inner, last_index);
                    let dropped = if inner_last >= target {
                        ppi
                    } else {
                        let inner_first = self.port_packet(inner, 0);
                        let deficit = inner_last - (inner_first + ppi);
                        if deficit > ppi {
                            warn!(
                                port = inner,
                                lost = deficit,
                                "large packet loss during scan iteration"
                            );
                        }
                        deficit.clamp(0, ppi)
                    };
                    self.ports[inner].last_dropped = dropped;
                }

                eprint!(
                    "\rScanning to packet {target} (~{:.02}% complete, currently at packet {current} on port {port}, {} to go)",
                    100.0 - (target - current) as f64 / initial_delta as f64 * 100.0,
                    target - current
                );
                let _ = std::io::stderr().flush();
            }

            if self.port_packet(port, 0) > target {
                return Err(ReaderError::AlignFailed(format!(
                    "port {port} scanned beyond target packet {target} (window starts at {})",
                    self.port_packet(port, 0)
                )));
            }
            if scanning {
                eprintln!("\nPassed target packet {target} on port {port}.");
            }
        }

        // Per-port binary search for the target's window offset, then a
        // shift-and-refill so the target sits at index 0.
        for port in 0..num_ports {
            let ppi = self.packets_per_iteration;
            let first = self.port_packet(port, 0);
            let mut start = (self.last_packet - first).clamp(0, ppi);
            let mut end = ppi;
            let mut index = start;
            let mut guess = self.port_packet(port, index);
            let mut iterations = 0;

            while guess != self.last_packet {
                iterations += 1;
                if iterations > SEARCH_ITERATION_CAP {
                    return Err(ReaderError::AlignFailed(format!(
                        "port {port} search failed to converge near packet {}",
                        self.last_packet
                    )));
                }
                if end > ppi || end < 0 {
                    warn!(port, end, "search end offset out of range; resetting");
                    end = ppi;
                }
                if start > ppi || start < 0 {
                    warn!(port, start, "search start offset out of range; resetting");
                    start = 0;
                }

                let mid = (start + end) / 2;
                if mid > ppi {
                    return Err(ReaderError::AlignFailed(format!(
                        "port {port} search diverged past the window"
                    )));
                }
                guess = self.port_packet(port, mid.min(ppi - 1));
                index = mid;

                if guess > self.last_packet {
                    end = mid - 1;
                } else if guess < self.last_packet {
                    start = mid + 1;
                } else {
                    continue;
                }

                // Degenerate interval: the exact target was lost. Hunt
                // for the next packet with a widened window.
                if start > end {
                    warn!(
                        port,
                        target = self.last_packet,
                        "target packet missing; searching for its successor"
                    );
                    self.last_packet += 1;
                    start -= 10;
                    end += 10;
                }
            }

            let keep = ppi - index;
            let mut shifts = vec![0i64; num_ports];
            shifts[port] = keep;
            self.shift_remainder(&shifts, false)?;

            let state = &mut self.ports[port];
            let window = ppi as usize * state.buffer.packet_length();
            let offset = state.buffer.input_data_offset();
            let need = window.saturating_sub(offset);
            if need > 0 {
                let super::PortState {
                    buffer, transport, ..
                } = state;
                let got = transport.read_into(buffer.active_mut(), offset, need)?;
                if got < need {
                    return Err(ReaderError::AlignFailed(
                        "unable to read enough data to fill the first aligned window".to_string(),
                    ));
                }
            }
            self.ports[port].last_dropped = 0;
        }

        Ok(())
    }

    /// Remove residual per-port deltas by re-running the skip from the
    /// highest first packet across ports, then leave `last_packet` on
    /// the packet before the aligned window.
    pub(super) fn first_packet_alignment(&mut self) -> Result<(), ReaderError> {
        for port in 0..self.ports.len() {
            self.ports[port].last_dropped = 0;
            self.ports[port].total_dropped = 0;
            let first = self.port_packet(port, 0);
            if first > self.last_packet {
                self.last_packet = first;
            }
        }

        self.skip_to_packet()?;
        self.last_packet -= 1;
        Ok(())
    }
}
