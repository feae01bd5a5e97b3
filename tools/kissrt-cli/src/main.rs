use std::io::BufRead;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::time::Duration;

use clap::Parser;
use kissapp::{Session, SessionConfig, SessionError};
use kisscore::PollingMode;

#[derive(Parser)]
struct Args {
    #[arg(long, help = "Serial device path, e.g. /dev/ttyUSB0")]
    device: String,
    #[arg(long, default_value_t = 9600, help = "Serial baud rate")]
    baud: u32,
    #[arg(long, value_enum, default_value = "off", help = "Polling engine mode")]
    polling: Polling,
    #[arg(long, default_value_t = 100, help = "Active-poll interval in milliseconds")]
    poll_interval: u64,
    #[arg(long, help = "Enable Kantronics/BPQ-style XOR checksum on transmit")]
    checksum: bool,
    #[arg(long, default_value_t = 100, help = "Per-port queue capacity")]
    queue_size: usize,
    #[arg(long, default_value_t = 0, help = "This host's multi-drop address, 0-15")]
    address: u8,
    #[arg(long, help = "Treat the type byte's high nibble as a multi-drop address rather than a port")]
    multi_drop: bool,
}

#[derive(clap::ValueEnum, Clone, Copy, PartialEq, Eq, Debug)]
enum Polling {
    Off,
    Active,
    Passive,
}

fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();

    let polling_mode = match args.polling {
        Polling::Off => PollingMode::Off,
        Polling::Active => PollingMode::Active,
        Polling::Passive => PollingMode::Passive,
    };

    let config = SessionConfig {
        device: args.device,
        baud: args.baud,
        polling_mode,
        poll_interval: Duration::from_millis(args.poll_interval),
        checksum_mode: args.checksum,
        max_queue_size: args.queue_size,
        own_address: args.address,
        multi_drop: args.multi_drop,
        poll_addresses: None,
    };

    let mut session = match Session::open(config) {
        Ok(session) => session,
        Err(SessionError::InvalidConfig(detail)) => {
            eprintln!("invalid configuration: {detail}");
            return ExitCode::from(2);
        }
        Err(e) => {
            eprintln!("failed to open session: {e}");
            return ExitCode::from(1);
        }
    };

    session.set_on_frame(|address, port, payload| {
        println!(
            "frame from address {address} port {port}: {} bytes",
            payload.len()
        );
    });
    session.set_on_poll(|address| {
        log::debug!("poll from address {address}");
    });
    session.set_on_overflow(|address, port, dropped| {
        log::warn!(
            "queue overflow for address {address} port {port}, dropped {} bytes",
            dropped.len()
        );
    });

    let failed = Arc::new(AtomicBool::new(false));
    let failed_in_handler = failed.clone();
    session.set_on_error(move |kind, detail| {
        log::error!("{kind:?}: {detail}");
        if matches!(kind, kissapp::ErrorKind::TransportError) {
            failed_in_handler.store(true, Ordering::SeqCst);
        }
    });

    // Stdin EOF (e.g. the controlling terminal closing, or piping from a
    // script) is this CLI's clean-shutdown signal; a background thread reads
    // it so the main loop can also notice a transport failure in between.
    let (eof_tx, eof_rx) = mpsc::channel();
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        for _line in stdin.lock().lines().map_while(Result::ok) {}
        let _ = eof_tx.send(());
    });

    loop {
        if failed.load(Ordering::SeqCst) {
            let _ = session.close();
            return ExitCode::from(1);
        }
        if eof_rx.recv_timeout(Duration::from_millis(200)).is_ok() {
            let _ = session.close();
            return ExitCode::SUCCESS;
        }
    }
}
