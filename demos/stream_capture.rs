// Streaming capture
//
// Streams from a simulated unit into a record file until auto-stop, Enter or a timeout.

use clap::Parser;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::sync::Arc;
use std::time::Duration;
use usbscope::drain::AbortSignal;
use usbscope::{
    AfterDelay, Channel, ChannelSetting, DeviceRegistry, Drain, IndexMode, KeyPress, Pacing,
    Range, RecordFormat, RecordSink, Scaling, Signal, SimulatedDriver, SimulatorConfig,
    StreamingConfig, TimeUnits,
};

#[derive(Parser)]
#[command(name = "stream_capture")]
#[command(version = "1.0")]
#[command(about = "Stream samples from two channels into a file")]
struct Args {
    /// Model variant to simulate
    #[arg(long, default_value = "2204A")]
    variant: String,

    /// Requested sample interval in microseconds
    #[arg(short, long, default_value_t = 1)]
    interval_us: u32,

    /// Stop after this many samples
    #[arg(short, long, default_value_t = 100_000)]
    samples: u32,

    /// Keep streaming into the driver-sized ring until aborted
    #[arg(long)]
    continuous: bool,

    /// Driver buffer size in samples
    #[arg(long, default_value_t = 50_000)]
    buffer: u32,

    /// Abort after this many milliseconds instead of on Enter
    #[arg(long)]
    duration_ms: Option<u64>,

    /// Produce samples at the sample rate instead of as fast as possible
    #[arg(long)]
    real_time: bool,

    /// Output file; standard output when omitted
    #[arg(short, long)]
    output: Option<String>,

    /// Write ADC counts only
    #[arg(long)]
    raw: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    if args.verbose {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Debug)
            .init();
    } else {
        env_logger::init();
    }

    let pacing = if args.real_time {
        Pacing::RealTime
    } else {
        Pacing::default()
    };
    let config = SimulatorConfig::new(&args.variant)
        .with_pacing(pacing)
        .with_signal(
            Channel::A,
            Signal::Sine {
                amplitude_mv: 800,
                period_samples: 1_000,
            },
        )
        .with_signal(
            Channel::B,
            Signal::Ramp {
                low_mv: -500,
                high_mv: 500,
                period_samples: 250,
            },
        );
    let registry = DeviceRegistry::new(Arc::new(SimulatedDriver::new(config)));
    let mut device = registry.open(None)?;
    device.set_channel(Channel::A, ChannelSetting::enabled(Range::R1V))?;
    device.set_channel(Channel::B, ChannelSetting::enabled(Range::R1V))?;

    let mut stream = StreamingConfig::new(args.interval_us, TimeUnits::Us)
        .with_auto_stop(args.samples)
        .with_buffer_capacity(args.buffer);
    if args.continuous {
        stream = stream.continuous();
    } else {
        stream = stream.with_index_mode(IndexMode::AppIndexed);
    }
    let started = device.run_streaming(&stream)?;
    if started.interval_adjusted() {
        eprintln!(
            "requested {} µs, streaming at {} µs",
            started.requested_interval, started.sample_interval
        );
    }

    let abort: Box<dyn AbortSignal> = match args.duration_ms {
        Some(ms) => Box::new(AfterDelay::new(Duration::from_millis(ms))),
        None => {
            eprintln!("Streaming; press Enter to stop");
            Box::new(KeyPress::spawn()?)
        }
    };

    let out: Box<dyn Write> = match &args.output {
        Some(path) => Box::new(BufWriter::new(File::create(path)?)),
        None => Box::new(io::stdout().lock()),
    };
    let scaling = if args.raw {
        Scaling::Raw
    } else {
        Scaling::Millivolts
    };
    let mut sink = RecordSink::for_device(out, RecordFormat::Csv, scaling, &device);
    let report = Drain::new(&mut device)
        .with_sink(&mut sink)
        .with_abort(abort.as_ref())
        .run()?;

    eprintln!(
        "{:?}: {} samples in {} callbacks ({} empty polls), {} rows, overflow mask {:#06b}",
        report.exit,
        report.stats.total_samples,
        report.stats.callbacks,
        report.stats.empty_polls,
        report.rows_written,
        report.stats.overflow
    );
    if report.stats.truncated_samples > 0 {
        eprintln!("{} samples did not fit the buffer", report.stats.truncated_samples);
    }

    device.close()?;
    Ok(())
}
