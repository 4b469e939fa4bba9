//! # LOFAR UDP reader and reformatting engine
//!
//! Ingests a LOFAR station's recorded UDP packet streams, up to four
//! simultaneous ports per station, and emits reformatted, optionally
//! polarimetrically-calibrated, time-aligned sample streams for pulsar
//! and transient search pipelines.
//!
//! ## Overview
//!
//! A session is configured once ([`ReaderConfig`]), set up into a
//! [`UdpReader`], and then stepped: every step shifts unconsumed packets
//! from the previous window, reads fresh data on all ports in parallel,
//! and runs one of a closed set of reformatting kernels
//! ([`ProcessingMode`]) into borrowable output planes. Ports are aligned
//! onto a common packet timeline at setup (and again on
//! [`reuse`](UdpReader::reuse)) despite per-port packet loss; lost
//! packets are replayed from a guard region or zero-filled.
//!
//! Inputs may be raw packet files, zstandard-compressed files
//! decompressed streamingly into the reader's own buffers, or
//! shared-memory ring buffers fed by a capture process. Calibration
//! multiplies samples by per-time, per-beamlet Jones matrices obtained
//! from an external beam-model helper over a FIFO.
//!
//! ## Example
//!
//! ```rust,no_run
//! use lofar_udp_core::{ReaderConfig, InputSpec, UdpReader};
//!
//! let config = ReaderConfig {
//!     input: InputSpec::Raw { paths: vec!["./udp_16130".into()] },
//!     num_ports: 1,
//!     packets_per_iteration: 4096,
//!     processing_mode: 100, // Stokes I
//!     ..Default::default()
//! };
//!
//! let mut reader = UdpReader::setup(config)?;
//! while reader.step().is_ok() {
//!     let stokes_i = reader.output_data(0);
//!     // hand the plane to the downstream pipeline
//!     let _ = stokes_i;
//! }
//! # Ok::<(), lofar_udp_core::ReaderError>(())
//! ```

pub mod buffer;
pub mod calibration;
pub mod config;
pub mod kernels;
pub mod packet;
pub mod reader;
pub mod station;
pub mod time;
pub mod transport;

#[cfg(test)]
pub(crate) mod testutil;

pub use config::{CalibrationConfig, ConfigError, InputSpec, ReaderConfig};
pub use kernels::{KernelShape, ProcessingMode, StokesParameter};
pub use packet::{BitMode, Geometry, HeaderParseError};
pub use reader::{ReaderError, StepStatus, UdpReader};
