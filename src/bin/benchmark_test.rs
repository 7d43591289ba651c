//! Scanning throughput benchmark: drains per-head profile queues as fast
//! as possible and reports missing sequence numbers.

use clap::Parser;
use linescan::{
    Camera, DataFormat, Laser, Profile, ScanHead, ScanHeadConfiguration, ScanSystem, ScanWindow,
    Units, API_VERSION,
};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(about = "Scan head throughput benchmark")]
struct Args {
    /// Comma-separated scan head serial numbers
    #[arg(short = 's', long = "serials", value_delimiter = ',', required = true)]
    serials: Vec<u32>,

    /// Scan duration in seconds
    #[arg(short = 't', long = "time", default_value_t = 10)]
    seconds: u64,

    /// Data density: full, half, or quarter
    #[arg(short = 'f', long = "format", default_value = "full")]
    format: String,

    /// Laser on time in microseconds applied to min/def/max
    #[arg(short = 'l', long = "laser-on", default_value_t = 100)]
    laser_on_us: u32,

    /// Scan period in microseconds; defaults to the system minimum
    #[arg(short = 'p', long = "period")]
    period_us: Option<u32>,

    /// Scan window: T for a symmetric window or T,B,L,R
    #[arg(short = 'w', long = "window", value_delimiter = ',')]
    window: Option<Vec<f64>>,

    /// Print scan head status before scanning
    #[arg(long = "status", default_value_t = false)]
    status: bool,
}

struct Counters {
    total: AtomicU64,
    missing: AtomicU64,
}

fn receiver(head: &ScanHead, is_scanning: &AtomicBool, counters: &Counters) {
    let mut profiles = vec![Profile::new(); 10];
    let mut expected: BTreeMap<(Camera, Laser), u32> = BTreeMap::new();

    println!("begin receiving on scan head {}", head.serial_number());

    while is_scanning.load(Ordering::Relaxed) {
        let available = head.wait_until_available_profiles(10, Duration::from_millis(100));
        if available == 0 {
            continue;
        }

        let count = head.profiles_filtered(&mut profiles);
        if count == 0 {
            continue;
        }

        counters.total.fetch_add(count as u64, Ordering::Relaxed);
        for profile in &profiles[..count] {
            let seq = expected
                .entry((profile.camera, profile.laser))
                .or_insert(profile.sequence_number);
            if profile.sequence_number == *seq {
                *seq += 1;
            } else if profile.sequence_number > *seq {
                counters
                    .missing
                    .fetch_add((profile.sequence_number - *seq) as u64, Ordering::Relaxed);
                *seq = profile.sequence_number + 1;
            }
        }
    }

    println!("end receiving on scan head {}", head.serial_number());
}

fn print_status(head: &ScanHead) -> linescan::Result<()> {
    let status = head.request_status()?;
    println!("scan head {} status", head.serial_number());
    println!("\tglobal_time_ns={}", status.global_time_ns);
    println!("\tnum_encoder_values={}", status.num_encoder_values);
    println!(
        "\tcamera_a_pixels_in_window={} camera_a_temp={}",
        status.camera_a_pixels_in_window, status.camera_a_temp
    );
    println!(
        "\tcamera_b_pixels_in_window={} camera_b_temp={}",
        status.camera_b_pixels_in_window, status.camera_b_temp
    );
    println!("\tnum_profiles_sent={}", status.num_profiles_sent);
    Ok(())
}

fn run(args: Args) -> linescan::Result<()> {
    println!("linescan {}", API_VERSION);

    let format = match args.format.as_str() {
        "full" => DataFormat::XyBrightnessFull,
        "half" => DataFormat::XyBrightnessHalf,
        "quarter" => DataFormat::XyBrightnessQuarter,
        other => {
            return Err(linescan::Error::InvalidArgument(format!(
                "unknown format '{}'",
                other
            )))
        }
    };

    let window = match args.window.as_deref() {
        None => ScanWindow::rectangular(20.0, -20.0, -20.0, 20.0)?,
        Some([t]) => ScanWindow::rectangular(*t, -t, -t, *t)?,
        Some([t, b, l, r]) => ScanWindow::rectangular(*t, *b, *l, *r)?,
        Some(_) => {
            return Err(linescan::Error::InvalidArgument(
                "window takes one value or four".into(),
            ))
        }
    };

    let mut config = ScanHeadConfiguration::default();
    config.laser_on_time_min_us = args.laser_on_us;
    config.laser_on_time_def_us = args.laser_on_us;
    config.laser_on_time_max_us = args.laser_on_us;

    let mut system = ScanSystem::new(Units::Inches)?;
    system.discover()?;

    for (id, &serial) in args.serials.iter().enumerate() {
        system.create_scan_head(serial, id as u32)?;
        let head = system.scan_head_by_serial(serial)?;
        head.set_configuration(&config)?;
        head.set_window(&window)?;
    }

    let connected = system.connect(Duration::from_secs(10))?;
    if connected as usize != args.serials.len() {
        return Err(linescan::Error::NotConnected);
    }

    if args.status {
        for &serial in &args.serials {
            print_status(system.scan_head_by_serial(serial)?)?;
        }
    }

    // Every head pair fires in every phase slot it owns.
    let pair_counts: Vec<(u32, u32)> = args
        .serials
        .iter()
        .map(|&serial| {
            system
                .scan_head_by_serial(serial)
                .map(|h| (serial, h.pair_count()))
        })
        .collect::<linescan::Result<_>>()?;
    let max_pairs = pair_counts.iter().map(|(_, n)| *n).max().unwrap_or(0);

    for n in 0..max_pairs {
        system.phase_create()?;
        for &(serial, count) in &pair_counts {
            if n >= count {
                continue;
            }
            let head = system.scan_head_by_serial(serial)?;
            if head.head_type() == linescan::ScanHeadType::Js50Wx {
                let camera = if n == 0 { Camera::A } else { Camera::B };
                system.phase_insert_camera(serial, camera, None)?;
            } else if head.pair_count() == 1 {
                system.phase_insert_camera(serial, Camera::A, None)?;
            } else {
                system.phase_insert_laser(serial, Laser::from_number(n + 1), None)?;
            }
        }
    }

    let min_period_us = system.min_scan_period();
    let period_us = args.period_us.unwrap_or(min_period_us).max(min_period_us);
    println!("scan period {} us (minimum {} us)", period_us, min_period_us);

    system.start_scanning(period_us, format, false)?;

    let is_scanning = Arc::new(AtomicBool::new(true));
    let counters: Vec<Arc<Counters>> = args
        .serials
        .iter()
        .map(|_| {
            Arc::new(Counters {
                total: AtomicU64::new(0),
                missing: AtomicU64::new(0),
            })
        })
        .collect();

    std::thread::scope(|scope| -> linescan::Result<()> {
        let mut workers = Vec::new();
        for (&serial, counter) in args.serials.iter().zip(&counters) {
            let head = system.scan_head_by_serial(serial)?;
            let is_scanning = is_scanning.clone();
            let counter = counter.clone();
            workers.push(scope.spawn(move || receiver(head, &is_scanning, &counter)));
        }

        std::thread::sleep(Duration::from_secs(args.seconds));
        is_scanning.store(false, Ordering::Relaxed);

        for worker in workers {
            let _ = worker.join();
        }
        Ok(())
    })?;

    system.stop_scanning()?;
    system.disconnect()?;

    for (&serial, counter) in args.serials.iter().zip(&counters) {
        let total = counter.total.load(Ordering::Relaxed);
        let missing = counter.missing.load(Ordering::Relaxed);
        println!(
            "{}: {} profiles received, {} missing, {:.1} profiles/s",
            serial,
            total,
            missing,
            total as f64 / args.seconds as f64
        );
    }

    Ok(())
}

fn main() {
    env_logger::init();
    let args = Args::parse();

    if let Err(e) = run(args) {
        eprintln!("ERROR ({}): {}", e.code(), e);
        std::process::exit(1);
    }
}
