//! Bus Monitor Example
//!
//! Opens the first IXXAT USB adapter found, starts channel 0 at the given
//! bitrate and prints every frame and error notification.
//!
//! Usage: cargo run --example monitor -- [bitrate] [seconds]

use std::sync::Arc;
use std::time::{Duration, Instant};

use ixxat_usb::{CanFrame, Event, EventQueue, IxxatError, IxxatUsb};

fn main() {
    env_logger::init();

    if let Err(e) = run() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<(), IxxatError> {
    let mut args = std::env::args().skip(1);
    let bitrate = args
        .next()
        .and_then(|s| s.parse().ok())
        .unwrap_or(500_000u32);
    let seconds = args.next().and_then(|s| s.parse().ok()).unwrap_or(10u64);

    let devices = IxxatUsb::scan()?;
    let Some(device) = devices.first() else {
        println!("No IXXAT USB device found");
        return Ok(());
    };

    let (sink, events) = EventQueue::new();
    let sink = Arc::new(sink);
    let (dev, usb) = IxxatUsb::open(device, |_| sink.clone())?;
    println!("Found: {}", dev);
    println!("{}", dev.info());
    println!();

    let ch = dev.channel(0)?;
    ch.set_bitrate(bitrate)?;
    ch.open()?;
    println!("Channel 0 running at {} bit/s, listening for {} s", bitrate, seconds);

    let hello = CanFrame::new(0x7FF, false, &[0x12, 0x34, 0x56, 0x78])?;
    println!("TX  {:?}", ch.transmit(&hello)?);

    let deadline = Instant::now() + Duration::from_secs(seconds);
    while Instant::now() < deadline {
        usb.pump(ch, Duration::from_millis(100))?;
        for event in events.try_iter() {
            match event {
                Event::Frame {
                    frame,
                    timestamp_us,
                } => println!("{:>16}  RX  {}", timestamp_us, frame),
                Event::Error(record) => println!("{:>16}  ERR {:?}", "", record),
                Event::BusOff => {
                    println!("Bus-off, restarting");
                    ch.restart()?;
                }
                Event::QueueStopped | Event::QueueWoken => {}
            }
        }
    }

    let stats = ch.stats();
    println!();
    println!(
        "RX {} frames / {} bytes, TX {} frames, {} bus errors, state {}",
        stats.rx_packets,
        stats.rx_bytes,
        stats.tx_packets,
        stats.bus_error,
        ch.state()
    );

    ch.close()?;
    Ok(())
}
