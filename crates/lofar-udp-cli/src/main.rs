//! LOFAR UDP data extractor.
//!
//! Reads recorded station streams (raw files, zstd-compressed files or
//! shared-memory ring buffers), reformats them through a processing mode
//! and writes one file per output plane. Extraction windows come either
//! from a start time plus duration, or from an event file of
//! newline-separated `ISO-8601-start duration-seconds` pairs; each event
//! re-targets the same reader via its reuse path.

use chrono::{DateTime, NaiveDateTime, Utc};
use clap::Parser;
use lofar_udp_core::time::{packet_from_unix_time, sample_period};
use lofar_udp_core::packet::TIMESLICES_PER_PACKET;
use lofar_udp_core::{
    CalibrationConfig, InputSpec, ReaderConfig, ReaderError, StepStatus, UdpReader,
};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::PathBuf;
use tracing::{error, info, warn};

#[derive(Debug, Parser)]
#[command(
    name = "lofar-udp-extract",
    version,
    about = "Extract and reformat LOFAR UDP packet captures"
)]
struct Args {
    /// Input file name format; `%d` expands to the port number.
    /// Files ending in `.zst` select the compressed transport.
    #[arg(short = 'i', long, default_value = "./%d")]
    input: String,

    /// Shared-memory ring keys as `base,offset`; replaces file input.
    #[arg(short = 'k', long)]
    ring_keys: Option<String>,

    /// Output file name format: `%d` is the output index, `%s` the
    /// window start time, `%ld` the starting packet number.
    #[arg(short = 'o', long, default_value = "./output%d_%s_%ld")]
    output: String,

    /// Packets to process per read request.
    #[arg(short = 'm', long, default_value_t = 65_536)]
    packets_per_iteration: i64,

    /// Number of ports to combine.
    #[arg(short = 'u', long, default_value_t = 4)]
    num_ports: usize,

    /// Base value when numbering ports in the input format.
    #[arg(short = 'n', long, default_value_t = 0)]
    base_port: usize,

    /// Beamlets to extract as `lo,hi` (hi exclusive); `0,0` selects all.
    #[arg(short = 'b', long, default_value = "0,0")]
    beamlets: String,

    /// Time of the first requested packet, `YYYY-MM-DDThh:mm:ss` UTC.
    #[arg(short = 't', long)]
    start_time: Option<String>,

    /// Maximum seconds of data to process.
    #[arg(short = 's', long)]
    seconds: Option<f64>,

    /// Event file: newline-separated start time and duration pairs.
    #[arg(short = 'e', long)]
    event_file: Option<PathBuf>,

    /// Processing mode id.
    #[arg(short = 'p', long, default_value_t = 0)]
    mode: u16,

    /// Replay the previous packet on loss instead of zero padding.
    #[arg(short = 'r', long)]
    replay: bool,

    /// Calibration subband strategy, e.g. `HBA,12:499`; needs -d.
    #[arg(short = 'c', long)]
    calibration_strategy: Option<String>,

    /// Calibration pointing as `ra,dec,basis`, e.g. `0.1,0.2,J2000`;
    /// needs -c.
    #[arg(short = 'd', long)]
    calibration_pointing: Option<String>,

    /// FIFO directory for the beam-model helper.
    #[arg(long, default_value = "/tmp/lofar_udp_jones")]
    calibration_fifo: PathBuf,

    /// Use the 160 MHz clock for start-time conversions.
    #[arg(short = 'z', long)]
    clock_160mhz: bool,

    /// Only print library errors.
    #[arg(short = 'q', long)]
    silent: bool,

    /// Append to existing output files instead of failing.
    #[arg(short = 'f', long)]
    append: bool,

    /// Worker threads for reads and kernels.
    #[arg(short = 'T', long, default_value_t = 8)]
    threads: usize,
}

/// One extraction window: a starting packet and a packet budget.
#[derive(Debug, Clone, Copy)]
struct Event {
    starting_packet: i64,
    max_packets: i64,
    start_unix: Option<i64>,
}

fn parse_time(value: &str) -> Result<i64, String> {
    NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S")
        .map(|t| t.and_utc().timestamp())
        .map_err(|e| format!("bad time {value:?}: {e}"))
}

fn packets_for_seconds(seconds: f64, clock_200mhz: bool) -> i64 {
    let packet_time = TIMESLICES_PER_PACKET as f64 * sample_period(clock_200mhz);
    (seconds / packet_time).ceil() as i64
}

fn parse_events(args: &Args, clock_200mhz: bool) -> Result<Vec<Event>, String> {
    if let Some(path) = &args.event_file {
        let file = File::open(path).map_err(|e| format!("{}: {e}", path.display()))?;
        let mut events = Vec::new();
        let mut previous_end = f64::NEG_INFINITY;
        for (index, line) in BufReader::new(file).lines().enumerate() {
            let line = line.map_err(|e| format!("{}: {e}", path.display()))?;
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut fields = line.split_whitespace();
            let start = fields
                .next()
                .ok_or_else(|| format!("event {index}: missing start time"))?;
            let duration: f64 = fields
                .next()
                .and_then(|v| v.parse().ok())
                .ok_or_else(|| format!("event {index}: missing duration"))?;

            let unix = parse_time(start)?;
            if (unix as f64) < previous_end {
                return Err(format!(
                    "event {index} starts before the previous event ends; events must be \
                     monotonic and non-overlapping"
                ));
            }
            previous_end = unix as f64 + duration;

            events.push(Event {
                starting_packet: packet_from_unix_time(unix as f64, clock_200mhz),
                max_packets: packets_for_seconds(duration, clock_200mhz),
                start_unix: Some(unix),
            });
        }
        if events.is_empty() {
            return Err(format!("{}: no events", path.display()));
        }
        return Ok(events);
    }

    let (starting_packet, start_unix) = match &args.start_time {
        Some(time) => {
            let unix = parse_time(time)?;
            (packet_from_unix_time(unix as f64, clock_200mhz), Some(unix))
        }
        None => (-1, None),
    };
    let max_packets = match args.seconds {
        Some(seconds) => packets_for_seconds(seconds, clock_200mhz),
        None => -1,
    };
    Ok(vec![Event {
        starting_packet,
        max_packets,
        start_unix,
    }])
}

fn parse_input(args: &Args) -> Result<InputSpec, String> {
    if let Some(keys) = &args.ring_keys {
        let mut parts = keys.splitn(2, ',');
        let base: u32 = parts
            .next()
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| format!("bad ring keys {keys:?}"))?;
        let offset: u32 = match parts.next() {
            Some(v) => v.parse().map_err(|e| format!("bad ring offset: {e}"))?,
            None => 10,
        };
        return Ok(InputSpec::Ring {
            base_key: base,
            key_offset: offset,
        });
    }

    let paths: Vec<PathBuf> = (0..args.num_ports)
        .map(|port| PathBuf::from(args.input.replace("%d", &(args.base_port + port).to_string())))
        .collect();
    let compressed = paths
        .iter()
        .all(|p| p.extension().is_some_and(|e| e == "zst"));
    Ok(if compressed {
        InputSpec::Compressed { paths }
    } else {
        InputSpec::Raw { paths }
    })
}

fn output_name(template: &str, output: usize, event: &Event) -> String {
    let date = event
        .start_unix
        .and_then(|unix| DateTime::<Utc>::from_timestamp(unix, 0))
        .map(|t| t.format("%Y-%m-%dT%H:%M:%S").to_string())
        .unwrap_or_else(|| "start".to_string());
    template
        .replace("%ld", &event.starting_packet.to_string())
        .replace("%d", &output.to_string())
        .replace("%s", &date)
}

fn open_outputs(
    args: &Args,
    num_outputs: usize,
    event: &Event,
) -> Result<Vec<BufWriter<File>>, String> {
    (0..num_outputs)
        .map(|output| {
            let name = output_name(&args.output, output, event);
            let file = if args.append {
                OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&name)
                    .map_err(|e| format!("{name}: {e}"))?
            } else {
                OpenOptions::new()
                    .create_new(true)
                    .write(true)
                    .open(&name)
                    .map_err(|e| format!("{name}: exists or unwritable ({e})"))?
            };
            Ok(BufWriter::new(file))
        })
        .collect()
}

/// Step the reader until its budget or input runs out, streaming every
/// output plane to its file.
fn run_event(reader: &mut UdpReader, writers: &mut [BufWriter<File>]) -> Result<i64, String> {
    let mut written = 0i64;
    let mut timing = [0.0f64, 0.0];
    let mut total_io = 0.0;
    let mut total_kernel = 0.0;

    loop {
        let status = match reader.step_timed(&mut timing) {
            Ok(status) => status,
            Err(ReaderError::Exhausted) => break,
            Err(e) => return Err(e.to_string()),
        };
        total_io += timing[0];
        total_kernel += timing[1];

        for (output, writer) in writers.iter_mut().enumerate() {
            writer
                .write_all(reader.output_data(output))
                .map_err(|e| format!("output {output}: {e}"))?;
        }
        written += reader.packets_per_iteration();

        match status {
            StepStatus::Ok => {}
            StepStatus::ShortRead => {
                if reader.packets_per_iteration() == 0 {
                    break;
                }
            }
            StepStatus::CapReached => break,
        }
    }

    for writer in writers.iter_mut() {
        writer.flush().map_err(|e| e.to_string())?;
    }
    info!(
        packets = written,
        io_seconds = total_io,
        kernel_seconds = total_kernel,
        "event complete"
    );
    Ok(written)
}

fn run(args: &Args) -> Result<(), String> {
    let clock_200mhz = !args.clock_160mhz;
    let events = parse_events(args, clock_200mhz)?;

    let mut beamlet_fields = args.beamlets.splitn(2, ',');
    let beamlet_limits = [
        beamlet_fields
            .next()
            .and_then(|v| v.parse().ok())
            .ok_or("bad beamlet limits")?,
        beamlet_fields
            .next()
            .and_then(|v| v.parse().ok())
            .ok_or("bad beamlet limits")?,
    ];

    let calibrate = args.calibration_strategy.is_some() && args.calibration_pointing.is_some();
    if (args.calibration_strategy.is_some() || args.calibration_pointing.is_some()) && !calibrate {
        return Err("calibration requires both -c and -d".to_string());
    }
    let calibration = if calibrate {
        let pointing_raw = args.calibration_pointing.as_deref().unwrap_or_default();
        let fields: Vec<&str> = pointing_raw.split(',').collect();
        if fields.len() != 3 {
            return Err(format!("bad pointing {pointing_raw:?}, expected ra,dec,basis"));
        }
        let ra: f64 = fields[0].parse().map_err(|e| format!("bad pointing: {e}"))?;
        let dec: f64 = fields[1].parse().map_err(|e| format!("bad pointing: {e}"))?;
        let duration = args.seconds.unwrap_or(60.0);
        Some(CalibrationConfig {
            fifo_path: args.calibration_fifo.clone(),
            subbands: args.calibration_strategy.clone().unwrap_or_default(),
            pointing: [ra, dec],
            pointing_basis: fields[2].to_string(),
            duration,
            ..Default::default()
        })
    } else {
        None
    };

    let config = ReaderConfig {
        input: parse_input(args)?,
        num_ports: args.num_ports,
        packets_per_iteration: args.packets_per_iteration,
        processing_mode: args.mode,
        replay_dropped_packets: args.replay,
        starting_packet: events[0].starting_packet,
        packets_read_max: events[0].max_packets,
        beamlet_limits,
        calibrate_data: calibrate,
        calibration,
        threads: args.threads,
    };

    let mut reader = UdpReader::setup(config).map_err(|e| e.to_string())?;
    info!(
        station = %reader.station_code(),
        ports = reader.geometry().num_ports(),
        beamlets = reader.geometry().total_proc_beamlets,
        mode = args.mode,
        "reader ready"
    );

    let mut total_packets = 0i64;
    for (index, event) in events.iter().enumerate() {
        if index > 0 {
            if event.start_unix.is_none() {
                return Err("event files require explicit start times".to_string());
            }
            reader
                .reuse(event.starting_packet, event.max_packets)
                .map_err(|e| e.to_string())?;
        }

        let mut writers = open_outputs(args, reader.num_outputs(), event)?;
        total_packets += run_event(&mut reader, &mut writers)?;
    }

    let ports = reader.geometry().num_ports();
    for port in 0..ports {
        let dropped = reader.total_dropped(port);
        if dropped > 0 {
            warn!(port, dropped, "packets lost on port");
        }
    }
    info!(packets = total_packets, "extraction complete");
    Ok(())
}

fn main() {
    let args = Args::parse();

    let level = if args.silent { "error" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level)),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(message) = run(&args) {
        error!("{message}");
        std::process::exit(1);
    }
}
