//! Processing kernels.
//!
//! A closed set of fixed transforms, selected once at configuration time
//! by integer mode id and represented internally as a tagged enum so
//! reserved ids are unrepresentable. The families:
//!
//! - **Copies** (0, 1): per-port byte copies, with or without headers.
//! - **Voltage reorders** (2–32): polarisation splits and frequency- or
//!   time-major reorders of the raw voltages, 4-bit unpacked to 8-bit.
//! - **Stokes** (100–164): I/Q/U/V combinations as 32-bit floats, with
//!   optional time downsampling.
//!
//! Kernels are pure transforms over the per-port windows: loss handling
//! is resolved beforehand into per-slot source maps (a slot reads a real
//! packet, the replay guard, or the zero guard), and calibration is a
//! per-beamlet 2×2 Jones multiply applied before any polarisation math.
//! Output buffers are sharded into disjoint regions and filled in
//! parallel.

mod reorder;
mod stokes;

use crate::buffer::PortBuffer;
use crate::packet::{BitMode, Geometry, POLARISATIONS, TIMESLICES_PER_PACKET};
use num_complex::Complex32;
use tracing::warn;

/// One Stokes parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StokesParameter {
    I,
    Q,
    U,
    V,
}

impl StokesParameter {
    /// Position in an `[I, Q, U, V]` accumulator.
    pub(crate) fn index(self) -> usize {
        match self {
            StokesParameter::I => 0,
            StokesParameter::Q => 1,
            StokesParameter::U => 2,
            StokesParameter::V => 3,
        }
    }

    fn mode_base(self) -> u16 {
        match self {
            StokesParameter::I => 100,
            StokesParameter::Q => 110,
            StokesParameter::U => 120,
            StokesParameter::V => 130,
        }
    }

    fn from_mode_base(base: u16) -> Option<Self> {
        match base {
            100 => Some(StokesParameter::I),
            110 => Some(StokesParameter::Q),
            120 => Some(StokesParameter::U),
            130 => Some(StokesParameter::V),
            _ => None,
        }
    }
}

/// The closed set of processing modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessingMode {
    /// 0: verbatim per-port copy, headers included.
    PacketCopy,
    /// 1: per-port payload copy; raw bit width is preserved.
    PayloadCopy,
    /// 2: four planes, packet-major `[packet][beamlet][time]` per
    /// polarisation component.
    SplitPol,
    /// 10: one plane, `[beamlet][time][pol]`.
    BeamletMajor,
    /// 11: four planes, `[beamlet][time]` per component.
    BeamletMajorSplitPol,
    /// 20: one plane, beamlet order reversed.
    ReversedBeamletMajor,
    /// 21: four planes, beamlet order reversed.
    ReversedBeamletMajorSplitPol,
    /// 30: one plane, `[time][beamlet][pol]`.
    TimeMajor,
    /// 31: four planes, `[time][beamlet]` per component.
    TimeMajorSplitPol,
    /// 32: two planes, `[time][beamlet][re,im]` per antenna polarisation.
    TimeMajorAntennaPol,
    /// 100–134: one Stokes parameter, time-major `[time][beamlet]` f32,
    /// summed over `2^downsample_log2` consecutive samples.
    Stokes {
        parameter: StokesParameter,
        downsample_log2: u8,
    },
    /// 150–154: all four Stokes parameters.
    StokesAll { downsample_log2: u8 },
    /// 160–164: Stokes I and V.
    StokesIV { downsample_log2: u8 },
}

impl ProcessingMode {
    /// Decode a wire mode id; `None` for anything outside the closed set.
    pub fn from_id(id: u16) -> Option<Self> {
        match id {
            0 => Some(ProcessingMode::PacketCopy),
            1 => Some(ProcessingMode::PayloadCopy),
            2 => Some(ProcessingMode::SplitPol),
            10 => Some(ProcessingMode::BeamletMajor),
            11 => Some(ProcessingMode::BeamletMajorSplitPol),
            20 => Some(ProcessingMode::ReversedBeamletMajor),
            21 => Some(ProcessingMode::ReversedBeamletMajorSplitPol),
            30 => Some(ProcessingMode::TimeMajor),
            31 => Some(ProcessingMode::TimeMajorSplitPol),
            32 => Some(ProcessingMode::TimeMajorAntennaPol),
            100..=104 | 110..=114 | 120..=124 | 130..=134 => Some(ProcessingMode::Stokes {
                parameter: StokesParameter::from_mode_base(id - id % 10)?,
                downsample_log2: (id % 10) as u8,
            }),
            150..=154 => Some(ProcessingMode::StokesAll {
                downsample_log2: (id % 10) as u8,
            }),
            160..=164 => Some(ProcessingMode::StokesIV {
                downsample_log2: (id % 10) as u8,
            }),
            _ => None,
        }
    }

    /// The wire mode id.
    pub fn id(&self) -> u16 {
        match self {
            ProcessingMode::PacketCopy => 0,
            ProcessingMode::PayloadCopy => 1,
            ProcessingMode::SplitPol => 2,
            ProcessingMode::BeamletMajor => 10,
            ProcessingMode::BeamletMajorSplitPol => 11,
            ProcessingMode::ReversedBeamletMajor => 20,
            ProcessingMode::ReversedBeamletMajorSplitPol => 21,
            ProcessingMode::TimeMajor => 30,
            ProcessingMode::TimeMajorSplitPol => 31,
            ProcessingMode::TimeMajorAntennaPol => 32,
            ProcessingMode::Stokes {
                parameter,
                downsample_log2,
            } => parameter.mode_base() + *downsample_log2 as u16,
            ProcessingMode::StokesAll { downsample_log2 } => 150 + *downsample_log2 as u16,
            ProcessingMode::StokesIV { downsample_log2 } => 160 + *downsample_log2 as u16,
        }
    }

    /// Number of output planes.
    pub fn num_outputs(&self, num_ports: usize) -> usize {
        match self {
            ProcessingMode::PacketCopy | ProcessingMode::PayloadCopy => num_ports,
            ProcessingMode::SplitPol
            | ProcessingMode::BeamletMajorSplitPol
            | ProcessingMode::ReversedBeamletMajorSplitPol
            | ProcessingMode::TimeMajorSplitPol => POLARISATIONS,
            ProcessingMode::BeamletMajor
            | ProcessingMode::ReversedBeamletMajor
            | ProcessingMode::TimeMajor => 1,
            ProcessingMode::TimeMajorAntennaPol => 2,
            ProcessingMode::Stokes { .. } => 1,
            ProcessingMode::StokesAll { .. } => POLARISATIONS,
            ProcessingMode::StokesIV { .. } => 2,
        }
    }

    /// Time samples summed into each output sample.
    pub fn downsample(&self) -> usize {
        match self {
            ProcessingMode::Stokes {
                downsample_log2, ..
            }
            | ProcessingMode::StokesAll {
                downsample_log2, ..
            }
            | ProcessingMode::StokesIV {
                downsample_log2, ..
            } => 1 << downsample_log2,
            _ => 1,
        }
    }

    /// Whether this mode produces Stokes parameters.
    pub fn is_stokes(&self) -> bool {
        matches!(
            self,
            ProcessingMode::Stokes { .. }
                | ProcessingMode::StokesAll { .. }
                | ProcessingMode::StokesIV { .. }
        )
    }

    /// Copy modes bypass sample interpretation entirely.
    pub fn is_copy(&self) -> bool {
        matches!(
            self,
            ProcessingMode::PacketCopy | ProcessingMode::PayloadCopy
        )
    }
}

/// Kernel selection resolved against the session geometry.
#[derive(Debug, Clone)]
pub struct KernelShape {
    pub mode: ProcessingMode,
    /// Whether samples are multiplied by Jones matrices. May be lowered
    /// from the requested value for modes that cannot be calibrated.
    pub calibrate: bool,
    /// Output component width in bits.
    pub output_bit_mode: usize,
    /// Bytes each output plane grows per input packet window slot.
    pub packet_output_lengths: Vec<usize>,
}

/// Resolve output count, bit depth and per-packet output lengths for a
/// mode against the parsed geometry. Calibration is incompatible with the
/// copy modes and is downgraded with a warning, as the configurator does.
pub fn setup_processing(mode: ProcessingMode, geometry: &Geometry, calibrate: bool) -> KernelShape {
    let mut calibrate = calibrate;
    if calibrate && mode.is_copy() {
        warn!(
            mode = mode.id(),
            "copy modes cannot be calibrated; disabling calibration"
        );
        calibrate = false;
    }

    let in_bits = geometry.bit_mode.bits();
    let output_bit_mode = if mode.is_stokes() || calibrate {
        32
    } else if mode.is_copy() {
        in_bits
    } else if in_bits == 4 {
        // 4-bit samples are unpacked to 8-bit for every non-copy mode.
        8
    } else {
        in_bits
    };

    let packet_output_lengths = match mode {
        ProcessingMode::PacketCopy => geometry.ports.iter().map(|p| p.packet_length).collect(),
        ProcessingMode::PayloadCopy => geometry.ports.iter().map(|p| p.payload_length()).collect(),
        _ => {
            let components =
                geometry.total_proc_beamlets as usize * POLARISATIONS * TIMESLICES_PER_PACKET;
            let base_bytes = components * output_bit_mode / 8;
            let per_output = if mode.is_stokes() {
                // Four components collapse into each Stokes value, then
                // time downsampling shrinks the plane further.
                base_bytes / POLARISATIONS / mode.downsample()
            } else {
                base_bytes / mode.num_outputs(geometry.num_ports())
            };
            vec![per_output; mode.num_outputs(geometry.num_ports())]
        }
    };

    KernelShape {
        mode,
        calibrate,
        output_bit_mode,
        packet_output_lengths,
    }
}

/// Where an output window slot reads its packet from.
pub const SLOT_REPLAY_GUARD: isize = -1;
pub const SLOT_ZERO_GUARD: isize = -2;

/// Everything a kernel invocation reads.
pub struct KernelContext<'a> {
    pub geometry: &'a Geometry,
    pub ports: &'a [&'a PortBuffer],
    /// Per port, per window slot: the signed packet index to read
    /// (a real slot, [`SLOT_REPLAY_GUARD`] or [`SLOT_ZERO_GUARD`]).
    pub slot_maps: &'a [Vec<isize>],
    /// 4-bit payloads unpacked to sign-extended bytes, one entry per
    /// guard-inclusive slot per port; `None` for 8/16-bit input.
    pub expanded: Option<&'a [Vec<u8>]>,
    /// Packets in this iteration's window.
    pub packets: usize,
    /// Jones row for this step: `total_proc_beamlets * 4` entries.
    pub jones: Option<&'a [Complex32]>,
}

impl<'a> KernelContext<'a> {
    /// Payload bytes for a signed slot index, unpacked when 4-bit.
    #[inline]
    pub(crate) fn payload(&self, port: usize, slot: isize) -> &[u8] {
        match self.expanded {
            Some(expanded) => {
                let len = self.geometry.ports[port].payload_length() * 2;
                let index = (slot + 2) as usize;
                &expanded[port][index * len..(index + 1) * len]
            }
            None => self.ports[port].payload(slot),
        }
    }

    /// Map each processed beamlet to its owning port and in-port index.
    pub(crate) fn beamlet_map(&self) -> Vec<(usize, usize)> {
        (0..self.geometry.total_proc_beamlets)
            .map(|b| {
                let (port, local) = self.geometry.locate_beamlet(b);
                (port, local as usize)
            })
            .collect()
    }
}

/// Sample component access generic over the input width.
pub(crate) trait InputSample: Copy + Send + Sync {
    const BYTES: usize;
    /// Read component `index` from a payload slice.
    fn read(payload: &[u8], index: usize) -> Self;
    fn to_f32(self) -> f32;
    /// Append the raw little-endian component to `out`.
    fn write(self, out: &mut [u8]);
}

impl InputSample for i8 {
    const BYTES: usize = 1;

    #[inline]
    fn read(payload: &[u8], index: usize) -> Self {
        payload[index] as i8
    }

    #[inline]
    fn to_f32(self) -> f32 {
        self as f32
    }

    #[inline]
    fn write(self, out: &mut [u8]) {
        out[0] = self as u8;
    }
}

impl InputSample for i16 {
    const BYTES: usize = 2;

    #[inline]
    fn read(payload: &[u8], index: usize) -> Self {
        i16::from_le_bytes([payload[2 * index], payload[2 * index + 1]])
    }

    #[inline]
    fn to_f32(self) -> f32 {
        self as f32
    }

    #[inline]
    fn write(self, out: &mut [u8]) {
        out[..2].copy_from_slice(&self.to_le_bytes());
    }
}

/// Unpack packed 4-bit components to sign-extended bytes, low nibble
/// first.
pub(crate) fn expand_nibbles(src: &[u8], dst: &mut [u8]) {
    for (i, &byte) in src.iter().enumerate() {
        dst[2 * i] = ((((byte & 0x0f) as i8) << 4) >> 4) as u8;
        dst[2 * i + 1] = ((byte as i8) >> 4) as u8;
    }
}

/// Multiply the X/Y pair for beamlet `b` by its Jones matrix.
#[inline]
pub(crate) fn apply_jones(
    jones: &[Complex32],
    beamlet: usize,
    x: Complex32,
    y: Complex32,
) -> (Complex32, Complex32) {
    let j = &jones[beamlet * 4..beamlet * 4 + 4];
    (j[0] * x + j[1] * y, j[2] * x + j[3] * y)
}

/// Run the selected kernel, filling every output plane for this window.
pub fn run(ctx: &KernelContext<'_>, shape: &KernelShape, outputs: &mut [Vec<u8>]) {
    match shape.mode {
        ProcessingMode::PacketCopy => reorder::copy(ctx, outputs, false),
        ProcessingMode::PayloadCopy => reorder::copy(ctx, outputs, true),
        _ => match ctx.geometry.bit_mode {
            BitMode::Bits16 => run_typed::<i16>(ctx, shape, outputs),
            BitMode::Bits8 | BitMode::Bits4 => run_typed::<i8>(ctx, shape, outputs),
        },
    }
}

fn run_typed<S: InputSample>(ctx: &KernelContext<'_>, shape: &KernelShape, outputs: &mut [Vec<u8>]) {
    if shape.calibrate {
        run_mode::<S, true>(ctx, shape, outputs);
    } else {
        run_mode::<S, false>(ctx, shape, outputs);
    }
}

fn run_mode<S: InputSample, const CAL: bool>(
    ctx: &KernelContext<'_>,
    shape: &KernelShape,
    outputs: &mut [Vec<u8>],
) {
    use ProcessingMode::*;
    match shape.mode {
        SplitPol => reorder::split_pol::<S, CAL>(ctx, outputs),
        BeamletMajor => reorder::beamlet_major::<S, CAL>(ctx, outputs, false),
        BeamletMajorSplitPol => reorder::beamlet_major_split::<S, CAL>(ctx, outputs, false),
        ReversedBeamletMajor => reorder::beamlet_major::<S, CAL>(ctx, outputs, true),
        ReversedBeamletMajorSplitPol => reorder::beamlet_major_split::<S, CAL>(ctx, outputs, true),
        TimeMajor => reorder::time_major::<S, CAL>(ctx, outputs),
        TimeMajorSplitPol => reorder::time_major_split::<S, CAL>(ctx, outputs),
        TimeMajorAntennaPol => reorder::time_major_antenna::<S, CAL>(ctx, outputs),
        Stokes { parameter, .. } => {
            stokes::stokes::<S, CAL>(ctx, outputs, &[parameter], shape.mode.downsample())
        }
        StokesAll { .. } => stokes::stokes::<S, CAL>(
            ctx,
            outputs,
            &[
                StokesParameter::I,
                StokesParameter::Q,
                StokesParameter::U,
                StokesParameter::V,
            ],
            shape.mode.downsample(),
        ),
        StokesIV { .. } => stokes::stokes::<S, CAL>(
            ctx,
            outputs,
            &[StokesParameter::I, StokesParameter::V],
            shape.mode.downsample(),
        ),
        PacketCopy | PayloadCopy => unreachable!("copy modes dispatch before sample typing"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_id_round_trip() {
        let ids = [
            0u16, 1, 2, 10, 11, 20, 21, 30, 31, 32, 100, 101, 102, 103, 104, 110, 114, 120, 123,
            130, 134, 150, 151, 154, 160, 161, 164,
        ];
        for id in ids {
            let mode = ProcessingMode::from_id(id).unwrap();
            assert_eq!(mode.id(), id, "round trip failed for {id}");
        }
    }

    #[test]
    fn reserved_ids_rejected() {
        for id in [3, 4, 9, 12, 33, 99, 105, 135, 140, 155, 165, 500] {
            assert!(ProcessingMode::from_id(id).is_none(), "id {id} accepted");
        }
    }

    #[test]
    fn downsample_factors() {
        assert_eq!(ProcessingMode::from_id(100).unwrap().downsample(), 1);
        assert_eq!(ProcessingMode::from_id(104).unwrap().downsample(), 16);
        assert_eq!(ProcessingMode::from_id(152).unwrap().downsample(), 4);
        assert_eq!(ProcessingMode::from_id(161).unwrap().downsample(), 2);
        assert_eq!(ProcessingMode::from_id(30).unwrap().downsample(), 1);
    }

    #[test]
    fn nibble_expansion_sign_extends() {
        // 0x7f: low nibble 0xf -> -1, high nibble 0x7 -> 7.
        let mut out = [0u8; 4];
        expand_nibbles(&[0x7f, 0x88], &mut out);
        assert_eq!(out[0] as i8, -1);
        assert_eq!(out[1] as i8, 7);
        assert_eq!(out[2] as i8, -8);
        assert_eq!(out[3] as i8, -8);
    }

    #[test]
    fn jones_identity_preserves_pair() {
        let jones = vec![
            Complex32::new(1.0, 0.0),
            Complex32::new(0.0, 0.0),
            Complex32::new(0.0, 0.0),
            Complex32::new(1.0, 0.0),
        ];
        let x = Complex32::new(3.0, -2.0);
        let y = Complex32::new(-1.0, 4.0);
        let (cx, cy) = apply_jones(&jones, 0, x, y);
        assert_eq!(cx, x);
        assert_eq!(cy, y);
    }

    #[test]
    fn jones_swap_matrix_swaps() {
        let jones = vec![
            Complex32::new(0.0, 0.0),
            Complex32::new(1.0, 0.0),
            Complex32::new(1.0, 0.0),
            Complex32::new(0.0, 0.0),
        ];
        let x = Complex32::new(3.0, -2.0);
        let y = Complex32::new(-1.0, 4.0);
        let (cx, cy) = apply_jones(&jones, 0, x, y);
        assert_eq!(cx, y);
        assert_eq!(cy, x);
    }
}
