//! Stokes-combination kernels (modes 100–164).
//!
//! Every variant emits time-major `[time][beamlet]` planes of f32 values.
//! The four polarisation components of each sample combine into
//! `I = |X|² + |Y|²`, `Q = |X|² − |Y|²`, `U = 2·Re(X·Y*)` and
//! `V = 2·Im(X·Y*)`; time downsampling sums consecutive samples. Output
//! rows are disjoint per decimated time step, so planes fill in parallel
//! without coordination. A downsampling factor never exceeds the 16
//! timeslices of one packet, so each output row reads exactly one packet
//! slot per port.

use super::reorder::{calibrated, read_components};
use super::{InputSample, KernelContext, StokesParameter};
use crate::packet::TIMESLICES_PER_PACKET;
use rayon::prelude::*;

/// Accumulate all four Stokes parameters for one sample.
#[inline]
fn accumulate(acc: &mut [f32; 4], comps: [f32; 4]) {
    let [xr, xi, yr, yi] = comps;
    let xx = xr * xr + xi * xi;
    let yy = yr * yr + yi * yi;
    acc[0] += xx + yy;
    acc[1] += xx - yy;
    acc[2] += 2.0 * (xr * yr + xi * yi);
    acc[3] += 2.0 * (xi * yr - xr * yi);
}

fn fill_row<S: InputSample, const CAL: bool>(
    ctx: &KernelContext<'_>,
    map: &[(usize, usize)],
    row_index: usize,
    downsample: usize,
    rows: &mut [&mut [u8]],
    params: &[StokesParameter],
) {
    let t0 = row_index * downsample;
    let slot = t0 / TIMESLICES_PER_PACKET;
    let ts0 = t0 % TIMESLICES_PER_PACKET;

    for (b, &(port, local)) in map.iter().enumerate() {
        let payload = ctx.payload(port, ctx.slot_maps[port][slot]);
        let mut acc = [0f32; 4];
        for k in 0..downsample {
            let comps = read_components::<S>(payload, local, ts0 + k);
            let values = if CAL {
                calibrated(comps, ctx.jones.expect("jones row"), b)
            } else {
                [
                    comps[0].to_f32(),
                    comps[1].to_f32(),
                    comps[2].to_f32(),
                    comps[3].to_f32(),
                ]
            };
            accumulate(&mut acc, values);
        }
        for (row, param) in rows.iter_mut().zip(params) {
            row[b * 4..b * 4 + 4].copy_from_slice(&acc[param.index()].to_le_bytes());
        }
    }
}

/// Fill one plane per requested parameter (1, 2 or 4 planes).
pub(super) fn stokes<S: InputSample, const CAL: bool>(
    ctx: &KernelContext<'_>,
    outputs: &mut [Vec<u8>],
    params: &[StokesParameter],
    downsample: usize,
) {
    let map = ctx.beamlet_map();
    let row = map.len() * 4;
    let rows = ctx.packets * TIMESLICES_PER_PACKET / downsample;

    match params.len() {
        1 => {
            outputs[0]
                .par_chunks_mut(row)
                .take(rows)
                .enumerate()
                .for_each(|(r, plane)| {
                    fill_row::<S, CAL>(ctx, &map, r, downsample, &mut [plane], params);
                });
        }
        2 => {
            let (oi, ov) = outputs.split_at_mut(1);
            oi[0]
                .par_chunks_mut(row)
                .zip(ov[0].par_chunks_mut(row))
                .take(rows)
                .enumerate()
                .for_each(|(r, (p0, p1))| {
                    fill_row::<S, CAL>(ctx, &map, r, downsample, &mut [p0, p1], params);
                });
        }
        _ => {
            let (left, right) = outputs.split_at_mut(2);
            let (o0, o1) = left.split_at_mut(1);
            let (o2, o3) = right.split_at_mut(1);
            o0[0]
                .par_chunks_mut(row)
                .zip(o1[0].par_chunks_mut(row))
                .zip(o2[0].par_chunks_mut(row))
                .zip(o3[0].par_chunks_mut(row))
                .take(rows)
                .enumerate()
                .for_each(|(r, (((p0, p1), p2), p3))| {
                    fill_row::<S, CAL>(ctx, &map, r, downsample, &mut [p0, p1, p2, p3], params);
                });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stokes_formulas() {
        // X = 3 - 2i, Y = 1 + 4i.
        let mut acc = [0f32; 4];
        accumulate(&mut acc, [3.0, -2.0, 1.0, 4.0]);
        let (xx, yy) = (13.0, 17.0);
        assert_eq!(acc[0], xx + yy);
        assert_eq!(acc[1], xx - yy);
        // U = 2 Re(X conj(Y)) = 2 (3*1 + -2*4) = -10.
        assert_eq!(acc[2], -10.0);
        // V = 2 Im(X conj(Y)) = 2 (-2*1 - 3*4) = -28.
        assert_eq!(acc[3], -28.0);
    }

    #[test]
    fn accumulation_sums_over_samples() {
        let mut acc = [0f32; 4];
        accumulate(&mut acc, [1.0, 0.0, 0.0, 0.0]);
        accumulate(&mut acc, [0.0, 1.0, 0.0, 0.0]);
        assert_eq!(acc[0], 2.0);
        assert_eq!(acc[1], 2.0);
    }
}
