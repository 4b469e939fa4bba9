//! Copy and voltage-reorder kernels (modes 0–32).
//!
//! Outputs are sharded into disjoint contiguous regions (per-packet
//! blocks, per-beamlet rows or per-timesample rows depending on the
//! layout) and filled in parallel. Replay and zero-fill for lost
//! packets come for free from the slot maps: a replayed slot reads the
//! guard packet, a zeroed slot reads the permanently-zero guard.

use super::{apply_jones, InputSample, KernelContext};
use crate::packet::{HEADER_LEN, POLARISATIONS, TIMESLICES_PER_PACKET};
use num_complex::Complex32;
use rayon::prelude::*;

/// Output element width: calibrated planes are f32 regardless of input.
#[inline]
fn elem_width<S: InputSample, const CAL: bool>() -> usize {
    if CAL {
        4
    } else {
        S::BYTES
    }
}

/// The four components of one sample, calibrated to f32.
#[inline]
pub(super) fn calibrated<S: InputSample>(comps: [S; 4], jones: &[Complex32], beamlet: usize) -> [f32; 4] {
    let x = Complex32::new(comps[0].to_f32(), comps[1].to_f32());
    let y = Complex32::new(comps[2].to_f32(), comps[3].to_f32());
    let (cx, cy) = apply_jones(jones, beamlet, x, y);
    [cx.re, cx.im, cy.re, cy.im]
}

#[inline]
pub(super) fn read_components<S: InputSample>(payload: &[u8], local: usize, ts: usize) -> [S; 4] {
    let base = (local * TIMESLICES_PER_PACKET + ts) * POLARISATIONS;
    [
        S::read(payload, base),
        S::read(payload, base + 1),
        S::read(payload, base + 2),
        S::read(payload, base + 3),
    ]
}

/// Write component `c` of a sample at element offset `at` in `out`.
#[inline]
fn write_component<S: InputSample, const CAL: bool>(
    out: &mut [u8],
    at: usize,
    comps: &[S; 4],
    cal: &[f32; 4],
    c: usize,
) {
    if CAL {
        out[at * 4..at * 4 + 4].copy_from_slice(&cal[c].to_le_bytes());
    } else {
        comps[c].write(&mut out[at * S::BYTES..]);
    }
}

/// Modes 0 and 1: per-port byte copies, with or without the header.
pub(super) fn copy(ctx: &KernelContext<'_>, outputs: &mut [Vec<u8>], strip_header: bool) {
    let skip = if strip_header { HEADER_LEN } else { 0 };
    outputs.par_iter_mut().enumerate().for_each(|(port, out)| {
        let len = ctx.geometry.ports[port].packet_length - skip;
        for (slot, chunk) in out.chunks_exact_mut(len).take(ctx.packets).enumerate() {
            let src = ctx.slot_maps[port][slot];
            chunk.copy_from_slice(&ctx.ports[port].packet(src)[skip..]);
        }
    });
}

/// Mode 2: four planes, packet-major `[packet][beamlet][time]`.
pub(super) fn split_pol<S: InputSample, const CAL: bool>(
    ctx: &KernelContext<'_>,
    outputs: &mut [Vec<u8>],
) {
    let w = elem_width::<S, CAL>();
    let map = ctx.beamlet_map();
    let block = map.len() * TIMESLICES_PER_PACKET * w;

    let (left, right) = outputs.split_at_mut(2);
    let (o0, o1) = left.split_at_mut(1);
    let (o2, o3) = right.split_at_mut(1);

    o0[0]
        .par_chunks_mut(block)
        .zip(o1[0].par_chunks_mut(block))
        .zip(o2[0].par_chunks_mut(block))
        .zip(o3[0].par_chunks_mut(block))
        .take(ctx.packets)
        .enumerate()
        .for_each(|(slot, (((p0, p1), p2), p3))| {
            let mut planes = [p0, p1, p2, p3];
            for (b, &(port, local)) in map.iter().enumerate() {
                let payload = ctx.payload(port, ctx.slot_maps[port][slot]);
                for ts in 0..TIMESLICES_PER_PACKET {
                    let comps = read_components::<S>(payload, local, ts);
                    let cal = if CAL {
                        calibrated(comps, ctx.jones.expect("jones row"), b)
                    } else {
                        [0.0; 4]
                    };
                    let at = b * TIMESLICES_PER_PACKET + ts;
                    for (c, plane) in planes.iter_mut().enumerate() {
                        write_component::<S, CAL>(plane, at, &comps, &cal, c);
                    }
                }
            }
        });
}

/// Modes 10/20: one plane, `[beamlet][time][pol]`, optionally with the
/// beamlet order reversed.
pub(super) fn beamlet_major<S: InputSample, const CAL: bool>(
    ctx: &KernelContext<'_>,
    outputs: &mut [Vec<u8>],
    reversed: bool,
) {
    let w = elem_width::<S, CAL>();
    let map = ctx.beamlet_map();
    let nbeam = map.len();
    let row = ctx.packets * TIMESLICES_PER_PACKET * POLARISATIONS * w;

    outputs[0]
        .par_chunks_mut(row)
        .take(nbeam)
        .enumerate()
        .for_each(|(r, out_row)| {
            let b = if reversed { nbeam - 1 - r } else { r };
            let (port, local) = map[b];
            for slot in 0..ctx.packets {
                let payload = ctx.payload(port, ctx.slot_maps[port][slot]);
                for ts in 0..TIMESLICES_PER_PACKET {
                    let comps = read_components::<S>(payload, local, ts);
                    let cal = if CAL {
                        calibrated(comps, ctx.jones.expect("jones row"), b)
                    } else {
                        [0.0; 4]
                    };
                    let t = slot * TIMESLICES_PER_PACKET + ts;
                    for c in 0..POLARISATIONS {
                        write_component::<S, CAL>(out_row, t * POLARISATIONS + c, &comps, &cal, c);
                    }
                }
            }
        });
}

/// Modes 11/21: four planes, `[beamlet][time]` per component.
pub(super) fn beamlet_major_split<S: InputSample, const CAL: bool>(
    ctx: &KernelContext<'_>,
    outputs: &mut [Vec<u8>],
    reversed: bool,
) {
    let w = elem_width::<S, CAL>();
    let map = ctx.beamlet_map();
    let nbeam = map.len();
    let row = ctx.packets * TIMESLICES_PER_PACKET * w;

    let (left, right) = outputs.split_at_mut(2);
    let (o0, o1) = left.split_at_mut(1);
    let (o2, o3) = right.split_at_mut(1);

    o0[0]
        .par_chunks_mut(row)
        .zip(o1[0].par_chunks_mut(row))
        .zip(o2[0].par_chunks_mut(row))
        .zip(o3[0].par_chunks_mut(row))
        .take(nbeam)
        .enumerate()
        .for_each(|(r, (((p0, p1), p2), p3))| {
            let mut planes = [p0, p1, p2, p3];
            let b = if reversed { nbeam - 1 - r } else { r };
            let (port, local) = map[b];
            for slot in 0..ctx.packets {
                let payload = ctx.payload(port, ctx.slot_maps[port][slot]);
                for ts in 0..TIMESLICES_PER_PACKET {
                    let comps = read_components::<S>(payload, local, ts);
                    let cal = if CAL {
                        calibrated(comps, ctx.jones.expect("jones row"), b)
                    } else {
                        [0.0; 4]
                    };
                    let t = slot * TIMESLICES_PER_PACKET + ts;
                    for (c, plane) in planes.iter_mut().enumerate() {
                        write_component::<S, CAL>(plane, t, &comps, &cal, c);
                    }
                }
            }
        });
}

/// Mode 30: one plane, `[time][beamlet][pol]`.
pub(super) fn time_major<S: InputSample, const CAL: bool>(
    ctx: &KernelContext<'_>,
    outputs: &mut [Vec<u8>],
) {
    let w = elem_width::<S, CAL>();
    let map = ctx.beamlet_map();
    let nbeam = map.len();
    let row = nbeam * POLARISATIONS * w;
    let samples = ctx.packets * TIMESLICES_PER_PACKET;

    outputs[0]
        .par_chunks_mut(row)
        .take(samples)
        .enumerate()
        .for_each(|(t, out_row)| {
            let slot = t / TIMESLICES_PER_PACKET;
            let ts = t % TIMESLICES_PER_PACKET;
            for (b, &(port, local)) in map.iter().enumerate() {
                let payload = ctx.payload(port, ctx.slot_maps[port][slot]);
                let comps = read_components::<S>(payload, local, ts);
                let cal = if CAL {
                    calibrated(comps, ctx.jones.expect("jones row"), b)
                } else {
                    [0.0; 4]
                };
                for c in 0..POLARISATIONS {
                    write_component::<S, CAL>(out_row, b * POLARISATIONS + c, &comps, &cal, c);
                }
            }
        });
}

/// Mode 31: four planes, `[time][beamlet]` per component.
pub(super) fn time_major_split<S: InputSample, const CAL: bool>(
    ctx: &KernelContext<'_>,
    outputs: &mut [Vec<u8>],
) {
    let w = elem_width::<S, CAL>();
    let map = ctx.beamlet_map();
    let row = map.len() * w;
    let samples = ctx.packets * TIMESLICES_PER_PACKET;

    let (left, right) = outputs.split_at_mut(2);
    let (o0, o1) = left.split_at_mut(1);
    let (o2, o3) = right.split_at_mut(1);

    o0[0]
        .par_chunks_mut(row)
        .zip(o1[0].par_chunks_mut(row))
        .zip(o2[0].par_chunks_mut(row))
        .zip(o3[0].par_chunks_mut(row))
        .take(samples)
        .enumerate()
        .for_each(|(t, (((p0, p1), p2), p3))| {
            let mut planes = [p0, p1, p2, p3];
            let slot = t / TIMESLICES_PER_PACKET;
            let ts = t % TIMESLICES_PER_PACKET;
            for (b, &(port, local)) in map.iter().enumerate() {
                let payload = ctx.payload(port, ctx.slot_maps[port][slot]);
                let comps = read_components::<S>(payload, local, ts);
                let cal = if CAL {
                    calibrated(comps, ctx.jones.expect("jones row"), b)
                } else {
                    [0.0; 4]
                };
                for (c, plane) in planes.iter_mut().enumerate() {
                    write_component::<S, CAL>(plane, b, &comps, &cal, c);
                }
            }
        });
}

/// Mode 32: two planes, `[time][beamlet][re,im]` per antenna polarisation.
pub(super) fn time_major_antenna<S: InputSample, const CAL: bool>(
    ctx: &KernelContext<'_>,
    outputs: &mut [Vec<u8>],
) {
    let w = elem_width::<S, CAL>();
    let map = ctx.beamlet_map();
    let row = map.len() * 2 * w;
    let samples = ctx.packets * TIMESLICES_PER_PACKET;

    let (ox, oy) = outputs.split_at_mut(1);

    ox[0]
        .par_chunks_mut(row)
        .zip(oy[0].par_chunks_mut(row))
        .take(samples)
        .enumerate()
        .for_each(|(t, (px, py))| {
            let slot = t / TIMESLICES_PER_PACKET;
            let ts = t % TIMESLICES_PER_PACKET;
            for (b, &(port, local)) in map.iter().enumerate() {
                let payload = ctx.payload(port, ctx.slot_maps[port][slot]);
                let comps = read_components::<S>(payload, local, ts);
                let cal = if CAL {
                    calibrated(comps, ctx.jones.expect("jones row"), b)
                } else {
                    [0.0; 4]
                };
                write_component::<S, CAL>(px, b * 2, &comps, &cal, 0);
                write_component::<S, CAL>(px, b * 2 + 1, &comps, &cal, 1);
                write_component::<S, CAL>(py, b * 2, &comps, &cal, 2);
                write_component::<S, CAL>(py, b * 2 + 1, &comps, &cal, 3);
            }
        });
}
