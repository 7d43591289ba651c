//! Reboot a scan head by serial number.

use linescan::API_VERSION;

fn main() {
    env_logger::init();

    let serial: u32 = match std::env::args().nth(1).and_then(|arg| arg.parse().ok()) {
        Some(serial) => serial,
        None => {
            eprintln!("Usage: power_cycle SERIAL");
            std::process::exit(1);
        }
    };

    println!("linescan {}", API_VERSION);
    println!("power cycling scan head {}", serial);

    if let Err(e) = linescan::power_cycle_scan_head(serial) {
        eprintln!("ERROR ({}): {}", e.code(), e);
        std::process::exit(1);
    }

    println!("scan head {} is rebooting", serial);
}
