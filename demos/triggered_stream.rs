// Triggered streaming
//
// Streams with a rising-edge trigger on channel A, keeping a window of samples around the
// trigger point, and reports where the trigger landed.

use clap::Parser;
use std::fs::File;
use std::io::BufWriter;
use std::sync::Arc;
use usbscope::{
    Channel, ChannelSetting, DeviceRegistry, Drain, DrainExit, KeyPress, Range, RecordFormat,
    RecordSink, Scaling, Signal, SimpleTrigger, SimulatedDriver, SimulatorConfig,
    StreamingConfig, TimeUnits,
};

#[derive(Parser)]
#[command(name = "triggered_stream")]
#[command(version = "1.0")]
#[command(about = "Stream a window of samples around a trigger event")]
struct Args {
    /// Model variant to simulate
    #[arg(long, default_value = "2204A")]
    variant: String,

    /// Samples kept before the trigger
    #[arg(long, default_value_t = 100_000)]
    pre: u32,

    /// Samples kept after the trigger
    #[arg(long, default_value_t = 900_000)]
    post: u32,

    /// Rising-edge threshold in millivolts
    #[arg(short, long, default_value_t = 1_000)]
    threshold_mv: i32,

    /// Raw sample at which the input steps over the threshold
    #[arg(long, default_value_t = 250_000)]
    edge_at: u64,

    /// Output file
    #[arg(short, long)]
    output: Option<String>,

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
        Signal::Step {
            low_mv: 0,
            high_mv: 1_500,
            at_sample: args.edge_at,
        },
    );
    let registry = DeviceRegistry::new(Arc::new(SimulatedDriver::new(config)));
    let mut device = registry.open(None)?;
    device.set_channel(Channel::A, ChannelSetting::enabled(Range::R2V))?;
    device.set_trigger(
        SimpleTrigger::start_capturing_when(Channel::A).rising_edge(args.threshold_mv),
    )?;

    let started = device.run_streaming(
        &StreamingConfig::new(1, TimeUnits::Us)
            .with_trigger_window(args.pre, args.post)
            .with_buffer_capacity(100_000),
    )?;
    eprintln!(
        "streaming every {} {:?}; press Enter to abort",
        started.sample_interval, started.time_units
    );

    let abort = KeyPress::spawn()?;
    let mut sink = match &args.output {
        Some(path) => Some(RecordSink::for_device(
            BufWriter::new(File::create(path)?),
            RecordFormat::Csv,
            Scaling::Millivolts,
            &device,
        )),
        None => None,
    };
    let mut drain = Drain::new(&mut device).with_abort(&abort);
    if let Some(sink) = sink.as_mut() {
        drain = drain.with_sink(sink);
    }
    let report = drain.run()?;

    match (report.exit, report.stats.triggered_at) {
        (DrainExit::Aborted, _) => eprintln!("aborted after {} samples", report.stats.total_samples),
        (_, Some(at)) => eprintln!(
            "triggered at sample {at} of {} ({} kept before it)",
            report.stats.total_samples, args.pre
        ),
        (_, None) => eprintln!("trigger never fired"),
    }

    device.close()?;
    Ok(())
}
