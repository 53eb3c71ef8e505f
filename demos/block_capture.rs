// Single block capture
//
// Arms one block capture on a simulated unit, waits for it and writes the samples as delimited
// records or, with --frame, through a polars DataFrame.

use clap::Parser;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::sync::Arc;
use std::time::Duration;
use usbscope::sink::{capture_to_frame, write_frame_csv};
use usbscope::{
    BlockConfig, Channel, ChannelSetting, DeviceRegistry, NeverAbort, Range, RatioMode,
    RecordFormat, RecordSink, Scaling, Signal, SimulatedDriver, SimulatorConfig,
};

#[derive(Parser)]
#[command(name = "block_capture")]
#[command(version = "1.0")]
#[command(about = "Capture one block of samples")]
struct Args {
    /// Model variant to simulate
    #[arg(long, default_value = "2204A")]
    variant: String,

    /// Channels to enable, as letters
    #[arg(short, long, default_value = "A", value_delimiter = ',')]
    channels: Vec<char>,

    /// Input range in millivolts
    #[arg(short, long, default_value_t = 2_000)]
    range_mv: i32,

    /// Samples to capture
    #[arg(short, long, default_value_t = 1_000)]
    samples: u32,

    /// First timebase tried by the selection probe
    #[arg(short, long, default_value_t = 7)]
    timebase: u32,

    /// Aggregate this many samples into one min/max pair
    #[arg(long, default_value_t = 1)]
    aggregate: u32,

    /// Output file; standard output when omitted
    #[arg(short, long)]
    output: Option<String>,

    /// Tab-separated instead of comma-separated
    #[arg(long)]
    tsv: bool,

    /// Write ADC counts only
    #[arg(long)]
    raw: bool,

    /// Write through a polars DataFrame with a time column
    #[arg(long)]
    frame: bool,

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

    let range = Range::ALL
        .into_iter()
        .find(|r| r.full_scale_mv() == args.range_mv)
        .ok_or_else(|| format!("no ±{} mV range", args.range_mv))?;
    let channels = args
        .channels
        .iter()
        .map(|c| {
            Channel::ALL
                .into_iter()
                .find(|ch| ch.letter() == c.to_ascii_uppercase())
                .ok_or_else(|| format!("unknown channel {c}"))
        })
        .collect::<Result<Vec<_>, _>>()?;

    let mut config = SimulatorConfig::new(&args.variant);
    for (i, channel) in channels.iter().enumerate() {
        config = config.with_signal(
            *channel,
            Signal::Sine {
                amplitude_mv: args.range_mv / 2,
                period_samples: 100 * (i as u32 + 1),
            },
        );
    }
    let registry = DeviceRegistry::new(Arc::new(SimulatedDriver::new(config)));
    let mut device = registry.open(None)?;
    eprintln!("{}", device.describe()?);

    for channel in &channels {
        device.set_channel(*channel, ChannelSetting::enabled(range))?;
    }

    let mut block = BlockConfig::new(args.samples).with_timebase(args.timebase);
    if args.aggregate > 1 {
        block = block.with_downsampling(args.aggregate, RatioMode::Aggregate);
    }
    let armed = device.run_block(&block)?;
    eprintln!(
        "timebase {} ({} ns per sample), ready in about {} ms",
        armed.timebase, armed.sample_interval_ns, armed.time_indisposed_ms
    );
    device.wait_ready(Duration::from_millis(1), &NeverAbort)?;
    let capture = device.get_values()?;
    eprintln!("{} samples, overflow mask {:#06b}", capture.len(), capture.overflow);

    let out: Box<dyn Write> = match &args.output {
        Some(path) => Box::new(BufWriter::new(File::create(path)?)),
        None => Box::new(io::stdout().lock()),
    };
    let format = if args.tsv {
        RecordFormat::Tsv
    } else {
        RecordFormat::Csv
    };

    if args.frame {
        let mut df = capture_to_frame(&capture)?;
        write_frame_csv(&mut df, out, format)?;
    } else {
        let scaling = if args.raw {
            Scaling::Raw
        } else {
            Scaling::Millivolts
        };
        let mut sink = RecordSink::for_device(out, format, scaling, &device);
        sink.write_block(&capture)?;
        sink.into_inner()?.flush()?;
    }

    device.close()?;
    Ok(())
}
