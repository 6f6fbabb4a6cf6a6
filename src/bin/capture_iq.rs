use std::sync::Arc;
use std::time::{Duration, Instant};
use std::{fs::File, io::Write};

use chrono::Local;
use clap::{Parser, ValueEnum};

use sdracq::{
    config::AcquisitionConfig,
    decimators::Placement,
    hardware::Device,
    sdr::DeviceBroker,
    synthetic::{SyntheticConfig, SyntheticDevice, Tone},
    utils::{peak_bin, slice_as_u8},
};

#[derive(ValueEnum, Debug, Clone, Copy)]
enum PlacementArg {
    Center,
    Infra,
    Supra,
}

impl From<PlacementArg> for Placement {
    fn from(p: PlacementArg) -> Self {
        match p {
            PlacementArg::Center => Placement::Center,
            PlacementArg::Infra => Placement::Infra,
            PlacementArg::Supra => Placement::Supra,
        }
    }
}

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    #[clap(short = 'r', long = "rate", value_name = "device sample rate", default_value_t = sdracq::DEFAULT_SAMP_RATE)]
    sample_rate: u32,

    /// log2 decimation of each channel, channel 0 first
    #[clap(short = 'd', value_name = "log2 decim", value_delimiter = ',', default_value = "0")]
    decim: Vec<u32>,

    /// placement of each channel, the last one repeats
    #[clap(short = 'p', value_enum, value_delimiter = ',', default_value = "center")]
    placement: Vec<PlacementArg>,

    /// tone frequency of each synthetic channel in Hz
    #[clap(short = 't', value_name = "tone Hz", value_delimiter = ',', allow_negative_numbers = true)]
    tones: Vec<f64>,

    #[clap(short = 'f', value_name = "synthetic native format", default_value = "CS16")]
    format: String,

    #[cfg(feature = "soapysdr")]
    #[clap(long = "soapy", value_name = "SoapySDR device args")]
    soapy: Option<String>,

    #[clap(short = 'o', long = "out", value_name = "out prefix")]
    outname: Option<String>,

    #[clap(short = 'N', value_name = "blocks per channel", default_value_t = 100)]
    nblocks: u64,
}

fn synthetic(args: &Args) -> Arc<dyn Device> {
    // 12-bit devices report CS16 with a 2048 full scale
    let (native_format, full_scale) = match args.format.as_str() {
        "CS8" => ("CS8", 128.0),
        "CS12" => ("CS16", 2048.0),
        "CF32" => ("CF32", 1.0),
        _ => ("CS16", 32768.0),
    };
    let tones = (0..args.decim.len())
        .map(|ch| Tone {
            freq: args
                .tones
                .get(ch)
                .copied()
                .unwrap_or((ch + 1) as f64 * args.sample_rate as f64 / 256.0),
            amplitude: 0.5,
        })
        .collect();

    Arc::new(SyntheticDevice::new(SyntheticConfig {
        native_format: native_format.to_string(),
        full_scale,
        tones,
        noise: 0.01,
        realtime: true,
        ..Default::default()
    }))
}

#[cfg(feature = "soapysdr")]
fn open_device(args: &Args) -> Arc<dyn Device> {
    match &args.soapy {
        Some(s) => Arc::new(sdracq::soapy::SoapySdr::open(s).expect("failed to open SoapySDR device")),
        None => synthetic(args),
    }
}

#[cfg(not(feature = "soapysdr"))]
fn open_device(args: &Args) -> Arc<dyn Device> {
    synthetic(args)
}

fn main() {
    env_logger::init();
    let args = Args::parse();

    let device = open_device(&args);
    let broker = DeviceBroker::new(
        device,
        AcquisitionConfig {
            sample_rate: args.sample_rate,
            ..Default::default()
        },
    );

    let mut consumers = Vec::new();
    let mut dump_files = Vec::new();
    for (ch, &decim) in args.decim.iter().enumerate() {
        let placement = args
            .placement
            .get(ch)
            .or(args.placement.last())
            .copied()
            .unwrap_or(PlacementArg::Center);

        let mut consumer = broker.attach(ch).expect("failed to attach channel");
        consumer
            .set_log2_decimation(decim)
            .expect("invalid decimation");
        consumer
            .set_placement(placement.into())
            .expect("failed to set placement");
        consumer.start().expect("failed to start channel");

        println!(
            "ch{}: {} S/s, band offset {} Hz",
            ch,
            consumer.output_rate(),
            consumer.frequency_shift()
        );
        dump_files.push(args.outname.as_ref().map(|n| {
            File::create(format!("{}_ch{}.iq", n, ch)).expect("failed to create dump file")
        }));
        consumers.push(consumer);
    }

    println!();
    println!("==================================");
    println!("start time:{}", Local::now().format("%Y-%m-%d %H:%M:%S%.3f"));
    println!("==================================");

    let print_interval = Duration::from_secs(2);
    let mut last_print_time = Instant::now();
    let mut nreceived = vec![0u64; consumers.len()];

    while nreceived.iter().any(|&n| n < args.nblocks) {
        for (ch, consumer) in consumers.iter().enumerate() {
            if nreceived[ch] >= args.nblocks {
                continue;
            }
            let Some(block) = consumer.reader().recv_timeout(Duration::from_millis(100)) else {
                continue;
            };
            nreceived[ch] += 1;
            if let Some(f) = dump_files[ch].as_mut() {
                f.write_all(slice_as_u8(&block.samples))
                    .expect("failed to write");
            }

            let now = Instant::now();
            if ch + 1 == consumers.len() && now.duration_since(last_print_time) >= print_interval {
                let local_time = Local::now().format("%Y-%m-%d %H:%M:%S");
                for c in consumers.iter() {
                    println!(
                        "{} ch{}: {} blocks {} samples dropped={} q={}",
                        local_time,
                        c.channel(),
                        c.reader().delivered_blocks(),
                        c.reader().delivered_samples(),
                        c.reader().dropped_blocks(),
                        c.reader().len()
                    );
                }
                last_print_time = now;
            }

            if nreceived[ch] == args.nblocks {
                if let Some((freq, level)) = peak_bin(&block.samples, consumer.output_rate() as f64) {
                    println!("ch{}: peak {:.1} Hz at {:.1} dBFS", ch, freq, level);
                }
            }
        }
    }

    if let Some(stats) = broker.stats() {
        println!("{:?}", stats);
    }
}
