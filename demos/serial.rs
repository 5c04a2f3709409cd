use std::env;

use fugit::ExtU32;
use inquire::Select;
use regpoll::transport::serial::available_ports;
use regpoll::{ConnectionConfig, Device, PollConfig, PollFailure, PollPlan, Snapshot, UpdateHandler};

// Configuration constants - adjust these for your setup
const BAUD_RATE: u32 = 9600;
const UNIT_ID: u8 = 0x50;
// Slow sensors can take a while to respond.
const RESPONSE_TIMEOUT_MS: u32 = 300;
const POLL_INTERVAL_MS: u32 = 500;
const POLL_START: u16 = 0x34;
const POLL_COUNT: u16 = 4;
const RUN_TIME_S: u64 = 10;

struct Printer;

impl UpdateHandler for Printer {
    fn on_update(&mut self, snapshot: Snapshot) {
        println!("v{} {}", snapshot.version(), snapshot);
    }

    fn on_failure(&mut self, failure: &PollFailure) {
        eprintln!(
            "Device not responding ({} failed cycles): {}",
            failure.consecutive_failures, failure.last_error
        );
    }

    fn on_recovered(&mut self) {
        eprintln!("Device responding again");
    }
}

fn main() {
    env_logger::init();

    // Get serial port from command line arg or interactive selection
    let port_name = env::args().nth(1).unwrap_or_else(|| {
        let ports = available_ports().expect("Failed to enumerate serial ports");
        if ports.is_empty() {
            eprintln!("No serial ports found!");
            std::process::exit(1);
        }
        Select::new("Select a serial port:", ports)
            .prompt()
            .expect("Failed to select port")
    });

    println!("Using port: {}", port_name);

    let config = ConnectionConfig::new("demo", port_name, BAUD_RATE, UNIT_ID)
        .with_timeout(RESPONSE_TIMEOUT_MS.millis());
    let device = Device::serial(config).with_handler(Printer);
    device.open().expect("Failed to open serial port");

    // One synchronous read before polling starts
    let values = device
        .read_regs(POLL_START, POLL_COUNT)
        .expect("Device did not answer");
    println!("Registers 0x{POLL_START:02X}..: {values:?}");

    let plan = PollPlan::new()
        .read(POLL_START, POLL_COUNT)
        .expect("Invalid poll block");
    let poll = PollConfig::new(plan)
        .with_interval(POLL_INTERVAL_MS.millis())
        .with_response_timeout(RESPONSE_TIMEOUT_MS.millis());
    device.start_polling(poll).expect("Failed to start polling");

    std::thread::sleep(std::time::Duration::from_secs(RUN_TIME_S));

    device.stop_polling();
    println!("{:#?}", device.poll_status());
    println!("Last snapshot: {}", device.snapshot());
}
