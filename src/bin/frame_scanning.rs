//! Frame scanning example: scans for ten seconds and reports per-frame
//! totals across all heads.

use linescan::{
    Camera, DataFormat, Laser, RawProfile, ScanHeadConfiguration, ScanHeadType, ScanSystem,
    ScanWindow, Units, API_VERSION,
};
use std::time::{Duration, Instant};

const SCAN_SECONDS: u64 = 10;

fn build_phase_table(system: &mut ScanSystem, serial_numbers: &[u32]) -> linescan::Result<()> {
    // One phase per distinct element index: heads of the same variant share
    // phases so their firings interleave across the system.
    let mut laser_primary: Vec<(u32, Vec<Laser>)> = Vec::new();
    let mut camera_primary: Vec<(u32, Vec<Camera>)> = Vec::new();

    for &serial in serial_numbers {
        let head = system.scan_head_by_serial(serial)?;
        match head.head_type() {
            ScanHeadType::Js50X6b20 | ScanHeadType::Js50X6b30 => {
                laser_primary.push((
                    serial,
                    vec![Laser::L1, Laser::L4, Laser::L2, Laser::L5, Laser::L3, Laser::L6],
                ));
            }
            ScanHeadType::Js50Z820 | ScanHeadType::Js50Z830 => {
                laser_primary.push((
                    serial,
                    vec![
                        Laser::L1,
                        Laser::L5,
                        Laser::L2,
                        Laser::L6,
                        Laser::L3,
                        Laser::L7,
                        Laser::L4,
                        Laser::L8,
                    ],
                ));
            }
            ScanHeadType::Js50Wx => {
                camera_primary.push((serial, vec![Camera::A, Camera::B]));
            }
            _ => {
                camera_primary.push((serial, vec![Camera::A]));
            }
        }
    }

    let phases = laser_primary
        .iter()
        .map(|(_, l)| l.len())
        .chain(camera_primary.iter().map(|(_, c)| c.len()))
        .max()
        .unwrap_or(0);

    for n in 0..phases {
        system.phase_create()?;
        for (serial, lasers) in &laser_primary {
            if let Some(&laser) = lasers.get(n) {
                system.phase_insert_laser(*serial, laser, None)?;
            }
        }
        for (serial, cameras) in &camera_primary {
            if let Some(&camera) = cameras.get(n) {
                system.phase_insert_camera(*serial, camera, None)?;
            }
        }
    }

    Ok(())
}

fn run(serial_numbers: Vec<u32>) -> linescan::Result<()> {
    println!("linescan {}", API_VERSION);

    let mut system = ScanSystem::new(Units::Inches)?;
    system.discover()?;

    let config = ScanHeadConfiguration {
        camera_exposure_time_min_us: 10_000,
        camera_exposure_time_def_us: 47_000,
        camera_exposure_time_max_us: 900_000,
        laser_on_time_min_us: 100,
        laser_on_time_def_us: 100,
        laser_on_time_max_us: 1000,
        laser_detection_threshold: 120,
        saturation_threshold: 800,
        saturation_percentage: 30,
    };
    let window = ScanWindow::rectangular(30.0, -30.0, -30.0, 30.0)?;

    for (id, &serial) in serial_numbers.iter().enumerate() {
        system.create_scan_head(serial, id as u32)?;
        let head = system.scan_head_by_serial(serial)?;
        println!("{} v{}", serial, head.firmware_version());
        head.set_configuration(&config)?;
        head.set_window(&window)?;
        head.set_alignment(0.0, 0.0, 0.0)?;
    }

    let connected = system.connect(Duration::from_secs(10))?;
    if connected as usize != serial_numbers.len() {
        for &serial in &serial_numbers {
            let head = system.scan_head_by_serial(serial)?;
            if !head.is_connected() {
                println!("{} is NOT connected", serial);
            }
        }
        return Err(linescan::Error::NotConnected);
    }

    build_phase_table(&mut system, &serial_numbers)?;

    let min_period_us = system.min_scan_period();
    println!("min scan period is {} us", min_period_us);

    println!("start scanning");
    system.start_scanning(min_period_us, DataFormat::XyBrightnessFull, true)?;

    let profiles_per_frame = system.profiles_per_frame() as usize;
    let mut frame = vec![RawProfile::new(); profiles_per_frame];
    let mut frame_count: u64 = 0;
    let mut profile_count: u64 = 0;
    let mut invalid_count: u64 = 0;

    let deadline = Instant::now() + Duration::from_secs(SCAN_SECONDS);
    while Instant::now() < deadline {
        if !system.wait_until_frame_available(Duration::from_secs(1))? {
            continue;
        }

        let valid = system.get_frame_raw(&mut frame)? as usize;
        frame_count += 1;
        profile_count += valid as u64;

        if valid != profiles_per_frame {
            invalid_count += (profiles_per_frame - valid) as u64;
            for profile in frame.iter().filter(|p| p.format == DataFormat::Invalid) {
                println!(
                    "Invalid: {} head {} {:?}/{:?}",
                    profile.sequence_number, profile.scan_head_id, profile.camera, profile.laser
                );
            }
            println!("received {} of {}", valid, profiles_per_frame);
        }
    }

    println!("stop scanning");
    system.stop_scanning()?;
    system.disconnect()?;

    println!(
        "{} frames, {} profiles, {} invalid slots",
        frame_count, profile_count, invalid_count
    );

    Ok(())
}

fn main() {
    env_logger::init();

    let serial_numbers: Vec<u32> = std::env::args()
        .skip(1)
        .filter_map(|arg| arg.parse().ok())
        .collect();

    if serial_numbers.is_empty() {
        eprintln!("Usage: frame_scanning SERIAL...");
        std::process::exit(1);
    }

    if let Err(e) = run(serial_numbers) {
        eprintln!("ERROR ({}): {}", e.code(), e);
        std::process::exit(1);
    }
}
