use clap::Parser;
use log::*;
use std::net::Ipv4Addr;
use std::process::ExitCode;
use std::sync::mpsc::{self, RecvTimeoutError};
use tunbridge::config::{self, InterfaceConfig, STATS_INTERVAL};
use tunbridge::{util, BoxError, Kind, PacketWriter, VirtualInterface};

/// Bridge two virtual interfaces by forwarding every packet read on one to the other.
#[derive(Parser, Debug)]
#[command(name = "tunbridge", version, about)]
struct Cli {
    /// Use TUN interfaces instead of TAP
    #[arg(long)]
    tun: bool,

    /// Name of first interface
    #[arg(long, default_value = config::DEFAULT_INTERFACE1)]
    interface1: String,

    /// Name of second interface
    #[arg(long, default_value = config::DEFAULT_INTERFACE2)]
    interface2: String,

    /// IP address for first interface
    #[arg(long, default_value_t = config::DEFAULT_IP1)]
    ip1: Ipv4Addr,

    /// IP address for second interface
    #[arg(long, default_value_t = config::DEFAULT_IP2)]
    ip2: Ipv4Addr,

    /// Netmask for both interfaces
    #[arg(long, default_value_t = config::DEFAULT_NETMASK)]
    netmask: Ipv4Addr,

    /// Increase log verbosity (repeatable)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Silence all log output
    #[arg(short, long)]
    quiet: bool,
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            return if e.use_stderr() {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    stderrlog::new()
        .module(module_path!())
        .quiet(cli.quiet)
        .verbosity(2 + cli.verbose as usize)
        .timestamp(stderrlog::Timestamp::Millisecond)
        .init()
        .expect("failed to install logger");

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<(), BoxError> {
    let kind = if cli.tun { Kind::Tun } else { Kind::Tap };
    info!("Using {kind} interfaces");

    let (tx, rx) = mpsc::channel();
    let signals = ctrlc2::set_handler(move || {
        let _ = tx.send(());
        true
    })?;

    let mut iface1 = InterfaceConfig::new(cli.interface1, kind, cli.ip1)
        .with_netmask(cli.netmask)
        .open()?;
    let mut iface2 = InterfaceConfig::new(cli.interface2, kind, cli.ip2)
        .with_netmask(cli.netmask)
        .open()?;

    let writer1 = iface1.writer()?;
    let writer2 = iface2.writer()?;
    iface1.start_capture(forward_to(iface1.name().to_string(), kind, writer2))?;
    iface2.start_capture(forward_to(iface2.name().to_string(), kind, writer1))?;

    println!("System is running. Try the following commands to test:");
    println!("  ping {} -I {}", cli.ip2, cli.ip1);
    println!("  Or use iperf3 for throughput testing.");
    println!("Press Ctrl+C to stop.");

    loop {
        match rx.recv_timeout(STATS_INTERVAL) {
            Err(RecvTimeoutError::Timeout) => print_stats("Statistics", &[&iface1, &iface2]),
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    info!("Shutting down...");
    iface1.stop_capture();
    iface2.stop_capture();
    print_stats("Final Statistics", &[&iface1, &iface2]);

    if signals.join().is_err() {
        warn!("Signal handler thread panicked");
    }
    Ok(())
}

/// Handler logging each packet read on `name` and writing it out through `writer`.
fn forward_to(
    name: String,
    kind: Kind,
    writer: PacketWriter,
) -> impl FnMut(Vec<u8>) -> Result<(), BoxError> + Send + 'static {
    move |packet| {
        info!(
            "[{name}] Received packet of {} bytes: {}",
            packet.len(),
            util::describe_packet(kind, &packet)
        );
        debug!("[{name}]   Data: {}", util::hex_preview(&packet, 16));

        writer.write_packet(&packet)?;
        Ok(())
    }
}

fn print_stats(title: &str, ifaces: &[&VirtualInterface]) {
    println!("--- {title} ---");
    for iface in ifaces {
        println!("{}: {}", iface.name(), iface.stats());
    }
}
