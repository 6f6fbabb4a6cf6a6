use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Local;
use clap::Parser;

use sdracq::{
    config::AcquisitionConfig,
    decimators::Placement,
    sdr::DeviceBroker,
    synthetic::{SyntheticConfig, SyntheticDevice, Tone},
};

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    #[clap(short = 'f', value_name = "native format", default_value = "CS16")]
    format: String,

    #[clap(short = 'd', value_name = "log2 decim", default_value_t = 4)]
    decim: u32,

    #[clap(short = 'n', value_name = "nb of channels", default_value_t = 2)]
    nch: usize,

    #[clap(long = "supra")]
    supra: bool,
}

fn main() {
    env_logger::init();
    let args = Args::parse();

    // 12-bit devices report CS16 with a 2048 full scale
    let (native_format, full_scale) = match args.format.as_str() {
        "CS8" => ("CS8", 128.0),
        "CS12" => ("CS16", 2048.0),
        "CF32" => ("CF32", 1.0),
        _ => ("CS16", 32768.0),
    };
    let device = Arc::new(SyntheticDevice::new(SyntheticConfig {
        native_format: native_format.to_string(),
        full_scale,
        mtu: 65536,
        tones: vec![
            Tone {
                freq: 10_000.0,
                amplitude: 0.5
            };
            args.nch
        ],
        ..Default::default()
    }));
    let broker = DeviceBroker::new(device, AcquisitionConfig::default());

    let placement = if args.supra {
        Placement::Supra
    } else {
        Placement::Center
    };
    let consumers: Vec<_> = (0..args.nch)
        .map(|ch| {
            let mut c = broker.attach(ch).expect("failed to attach channel");
            c.set_log2_decimation(args.decim).expect("invalid decimation");
            c.set_placement(placement).expect("failed to set placement");
            c.start().expect("failed to start channel");
            c
        })
        .collect();

    let t0 = Instant::now();
    let print_interval = Duration::from_secs(2);
    let mut last_print_time = t0;
    println!("start time:{}", Local::now().format("%Y-%m-%d %H:%M:%S%.3f"));

    loop {
        for c in consumers.iter() {
            while c.reader().try_recv().is_some() {}
        }

        let now = Instant::now();
        if now.duration_since(last_print_time) >= print_interval {
            let dt = now.duration_since(t0).as_secs_f64();
            let stats = broker.stats().unwrap_or_default();
            let smp_rate = stats.samples as f64 / dt;
            let dropped: u64 = consumers.iter().map(|c| c.reader().dropped_blocks()).sum();
            println!(
                "smp_rate: {} MSps x {} ch, dropped blocks {}",
                smp_rate / 1e6,
                args.nch,
                dropped
            );
            last_print_time = now;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
}
