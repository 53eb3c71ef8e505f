// Rapid block capture
//
// Splits capture memory into segments, captures one triggered waveform per segment and prints
// where each segment triggered.

use clap::Parser;
use std::fs::File;
use std::io::BufWriter;
use std::sync::Arc;
use std::time::Duration;
use usbscope::sink::{capture_to_frame, write_frame_csv};
use usbscope::{
    Channel, ChannelSetting, DeviceRegistry, KeyPress, Range, RapidBlockConfig, RecordFormat,
    Signal, SimpleTrigger, SimulatedDriver, SimulatorConfig,
};

#[derive(Parser)]
#[command(name = "rapid_block")]
#[command(version = "1.0")]
#[command(about = "Capture several triggered waveforms back to back")]
struct Args {
    /// Model variant to simulate
    #[arg(long, default_value = "3406D")]
    variant: String,

    /// Number of segments
    #[arg(short, long, default_value_t = 10)]
    captures: u32,

    /// Samples per segment
    #[arg(short, long, default_value_t = 20_000)]
    samples: u32,

    /// Samples kept before the trigger point
    #[arg(short, long, default_value_t = 2_000)]
    pre_trigger: u32,

    /// Rising-edge threshold on channel A in millivolts
    #[arg(short, long, default_value_t = 1_000)]
    threshold_mv: i32,

    /// Write each segment to `<prefix><n>.csv`
    #[arg(short, long)]
    output_prefix: Option<String>,

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

    let config = SimulatorConfig::new(&args.variant).with_signal(
        Channel::A,
        Signal::Sine {
            amplitude_mv: 1_500,
            period_samples: 50_000,
        },
    );
    let registry = DeviceRegistry::new(Arc::new(SimulatedDriver::new(config)));
    let mut device = registry.open(None)?;
    device.set_channel(Channel::A, ChannelSetting::enabled(Range::R2V))?;
    device.set_trigger(
        SimpleTrigger::start_capturing_when(Channel::A).rising_edge(args.threshold_mv),
    )?;

    let armed = device.run_rapid_block(
        &RapidBlockConfig::new(args.captures, args.samples).with_pre_trigger(args.pre_trigger),
    )?;
    eprintln!(
        "{} segments at timebase {} ({} ns per sample)",
        args.captures, armed.timebase, armed.sample_interval_ns
    );

    let abort = KeyPress::spawn()?;
    device.wait_ready(Duration::from_millis(5), &abort)?;
    eprintln!("{} captures completed", device.captures_completed()?);

    for segment in device.get_values_bulk()? {
        match segment.trigger_index {
            Some(index) => println!(
                "segment {}: triggered at sample {index} of {}",
                segment.segment,
                segment.capture.len()
            ),
            None => println!("segment {}: not triggered", segment.segment),
        }
        if let Some(prefix) = &args.output_prefix {
            let mut df = capture_to_frame(&segment.capture)?;
            let file = BufWriter::new(File::create(format!("{prefix}{}.csv", segment.segment))?);
            write_frame_csv(&mut df, file, RecordFormat::Csv)?;
        }
    }

    device.close()?;
    Ok(())
}
