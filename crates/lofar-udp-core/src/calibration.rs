//! Jones-matrix calibration source.
//!
//! Polarimetric calibration multiplies every X/Y sample pair by a
//! per-time, per-beamlet 2×2 complex Jones matrix produced by an
//! external beam-model helper. The helper is spawned with a fixed
//! argument list and streams its table back over a FIFO:
//!
//! ```text
//! <timesteps>,<beamlets>\n
//! r,i,r,i,r,i,r,i, ... ,r,i|        one line per time step,
//! ...                               eight floats per beamlet,
//! ```
//!
//! with the last beamlet group of each line terminated by `|` instead of
//! a comma. Any parse failure or beamlet-count mismatch is fatal to the
//! session. Each generated step covers one reader iteration; the table
//! is regenerated when the consumed step count reaches the generated
//! count.

use crate::config::CalibrationConfig;
use num_complex::Complex32;
use std::io::{BufRead, BufReader};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::{debug, warn};

/// Calibration failures; all fatal.
#[derive(Debug)]
pub enum CalibrationError {
    /// FIFO creation or removal failed.
    Fifo(String),
    /// The generator could not be spawned or died before writing.
    Generator(String),
    /// The framed table could not be parsed.
    Parse(String),
    /// The generator produced a table for the wrong number of beamlets.
    BeamletMismatch { expected: usize, generated: usize },
}

impl std::fmt::Display for CalibrationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CalibrationError::Fifo(msg) => write!(f, "calibration FIFO failure: {msg}"),
            CalibrationError::Generator(msg) => write!(f, "calibration generator failure: {msg}"),
            CalibrationError::Parse(msg) => write!(f, "calibration table parse failure: {msg}"),
            CalibrationError::BeamletMismatch {
                expected,
                generated,
            } => write!(
                f,
                "calibration produced {generated} beamlets but the session processes {expected}"
            ),
        }
    }
}

impl std::error::Error for CalibrationError {}

/// A generated table of `steps x beamlets x 4` Jones entries.
#[derive(Debug, Clone)]
pub struct JonesTable {
    steps: Vec<Vec<Complex32>>,
}

impl JonesTable {
    /// Number of time steps the generator produced.
    pub fn steps_generated(&self) -> usize {
        self.steps.len()
    }

    /// The `beamlets * 4` matrix row for one time step.
    pub fn row(&self, step: usize) -> &[Complex32] {
        &self.steps[step]
    }

    /// Parse the framed table from a reader. `expected_beamlets` must
    /// match the generated beamlet count exactly.
    pub fn parse_from<R: BufRead>(
        mut reader: R,
        expected_beamlets: usize,
    ) -> Result<Self, CalibrationError> {
        let mut line = String::new();
        reader
            .read_line(&mut line)
            .map_err(|e| CalibrationError::Parse(format!("shape header: {e}")))?;
        let mut shape = line.trim_end().splitn(2, ',');
        let timesteps: usize = shape
            .next()
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| CalibrationError::Parse(format!("bad shape header {line:?}")))?;
        let beamlets: usize = shape
            .next()
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| CalibrationError::Parse(format!("bad shape header {line:?}")))?;

        if beamlets != expected_beamlets {
            return Err(CalibrationError::BeamletMismatch {
                expected: expected_beamlets,
                generated: beamlets,
            });
        }

        let mut steps = Vec::with_capacity(timesteps);
        for step in 0..timesteps {
            line.clear();
            reader
                .read_line(&mut line)
                .map_err(|e| CalibrationError::Parse(format!("step {step}: {e}")))?;
            let body = line
                .trim_end()
                .strip_suffix('|')
                .ok_or_else(|| CalibrationError::Parse(format!("step {step} missing terminator")))?;

            let mut row = Vec::with_capacity(beamlets * 4);
            let mut values = body.split(',');
            for entry in 0..beamlets * 4 {
                let re: f32 = values
                    .next()
                    .and_then(|v| v.trim().parse().ok())
                    .ok_or_else(|| {
                        CalibrationError::Parse(format!("step {step} entry {entry}: bad real"))
                    })?;
                let im: f32 = values
                    .next()
                    .and_then(|v| v.trim().parse().ok())
                    .ok_or_else(|| {
                        CalibrationError::Parse(format!("step {step} entry {entry}: bad imaginary"))
                    })?;
                row.push(Complex32::new(re, im));
            }
            if values.next().is_some() {
                return Err(CalibrationError::Parse(format!(
                    "step {step} carries trailing values"
                )));
            }
            steps.push(row);
        }

        Ok(Self { steps })
    }
}

/// Per-session suffix so concurrent sessions never share a FIFO.
fn unique_fifo_path(base: &std::path::Path) -> PathBuf {
    static COUNTER: AtomicU32 = AtomicU32::new(0);
    let serial = COUNTER.fetch_add(1, Ordering::Relaxed);
    PathBuf::from(format!(
        "{}_{:05}_{serial:02}",
        base.display(),
        std::process::id() % 100_000
    ))
}

/// Spawn the generator and read one table through a fresh FIFO.
///
/// The argument list is fixed: station code, start MJD, subband
/// strategy, duration, integration step, pointing with basis, pipe path.
/// The child inherits an explicitly injected copy of the environment.
pub fn generate_table(
    cal: &CalibrationConfig,
    station_code: &str,
    start_mjd: f64,
    integration_seconds: f64,
    expected_beamlets: usize,
) -> Result<JonesTable, CalibrationError> {
    let fifo = unique_fifo_path(&cal.fifo_path);
    if fifo.exists() {
        std::fs::remove_file(&fifo)
            .map_err(|e| CalibrationError::Fifo(format!("stale {}: {e}", fifo.display())))?;
    }
    nix::unistd::mkfifo(&fifo, nix::sys::stat::Mode::from_bits_truncate(0o664))
        .map_err(|e| CalibrationError::Fifo(format!("mkfifo {}: {e}", fifo.display())))?;

    let pointing = format!(
        "{},{},{}",
        cal.pointing[0], cal.pointing[1], cal.pointing_basis
    );
    debug!(
        generator = %cal.generator,
        station = station_code,
        mjd = start_mjd,
        "spawning Jones generator"
    );

    let spawn = Command::new(&cal.generator)
        .arg("--stn")
        .arg(station_code)
        .arg("--time")
        .arg(format!("{start_mjd:.10}"))
        .arg("--sub")
        .arg(&cal.subbands)
        .arg("--dur")
        .arg(format!("{:.10}", cal.duration))
        .arg("--int")
        .arg(format!("{integration_seconds:.10}"))
        .arg("--pnt")
        .arg(pointing)
        .arg("--pipe")
        .arg(&fifo)
        .stdin(Stdio::null())
        .env_clear()
        .envs(std::env::vars())
        .spawn();

    let mut child = match spawn {
        Ok(child) => child,
        Err(e) => {
            let _ = std::fs::remove_file(&fifo);
            return Err(CalibrationError::Generator(format!(
                "{}: {e}",
                cal.generator
            )));
        }
    };

    let result = read_table_from_fifo(&fifo, &mut child, expected_beamlets);

    if let Err(e) = std::fs::remove_file(&fifo) {
        warn!(fifo = %fifo.display(), error = %e, "failed to remove calibration FIFO");
    }
    match child.wait() {
        Ok(status) if !status.success() => {
            warn!(%status, "Jones generator exited with failure");
        }
        Err(e) => warn!(error = %e, "failed to reap Jones generator"),
        _ => {}
    }

    result
}

fn read_table_from_fifo(
    fifo: &std::path::Path,
    child: &mut Child,
    expected_beamlets: usize,
) -> Result<JonesTable, CalibrationError> {
    // Opening the read end blocks until the generator opens its write end.
    let reader = std::fs::File::open(fifo)
        .map_err(|e| CalibrationError::Fifo(format!("open {}: {e}", fifo.display())))?;

    if let Ok(Some(status)) = child.try_wait() {
        if !status.success() {
            return Err(CalibrationError::Generator(format!(
                "exited with {status} before writing"
            )));
        }
    }

    JonesTable::parse_from(BufReader::new(reader), expected_beamlets)
}
