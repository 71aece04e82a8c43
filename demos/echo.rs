//! Echo server on Enso pipes, driven by the in-process network emulator.
//!
//! A generator thread puts UDP frames on the wire, the application echoes every frame back out
//! of the pipe it arrived on, and the main thread counts what comes out.

use color_eyre::{eyre::WrapErr, Report, Result};
use enso_pipe::utils::{build_udp_packet, AddressInfo, HeaderInfo};
use enso_pipe::{
    poll_echo, Device, EmulatorHandle, EnsoConfig, FlowRule, NetworkEmulator, Stats, StopToken,
};
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use structopt::StructOpt;
use tracing::{debug, info};
use tracing_error::ErrorLayer;
use tracing_subscriber::prelude::*;

#[derive(Debug, Clone, StructOpt)]
struct Opt {
    #[structopt(long)]
    cfg: Option<PathBuf>,

    #[structopt(short, long, default_value = "2")]
    pipes: usize,

    /// Bind each pipe to its own destination port instead of relying on RSS.
    #[structopt(long)]
    bind: bool,

    #[structopt(short, long, default_value = "100000")]
    num_pkts: usize,

    #[structopt(short, long, default_value = "64")]
    size: usize,
}

const SERVER_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);
const BASE_PORT: u16 = 9000;

fn main() -> Result<()> {
    let subscriber = tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(ErrorLayer::default());
    let d = tracing::Dispatch::new(subscriber);
    d.init();
    color_eyre::install()?;
    let opt = Opt::from_args();

    let config = match &opt.cfg {
        Some(path) => EnsoConfig::from_path(path)?,
        None => EnsoConfig::default(),
    };

    let stop = StopToken::new();
    let (mut emulator, handle) = NetworkEmulator::new(config.rss_hash);
    let emu_stop = stop.clone();
    let emu = std::thread::spawn(move || emulator.run(&emu_stop));

    let stats = Arc::new(Stats::new());
    let app_stop = stop.clone();
    let app_stats = Arc::clone(&stats);
    let app_handle = handle.clone();
    let app_opt = opt.clone();
    let app = std::thread::spawn(move || do_echo(app_handle, config, app_opt, app_stop, app_stats));

    do_generator(&handle, &opt)?;

    let transmitted = handle.transmitted();
    let start = Instant::now();
    let mut echoed = 0;
    while echoed < opt.num_pkts {
        match transmitted.recv_timeout(Duration::from_secs(5)) {
            Ok(_) => echoed += 1,
            Err(_) => break,
        }
    }
    let elapsed = start.elapsed();

    stop.stop();
    app.join().expect("app thread panicked")?;
    emu.join().expect("emulator thread panicked")?;

    let snapshot = stats.snapshot();
    info!(?echoed, ?elapsed, ?snapshot, "done");
    println!(
        "echoed={} nb_pkts={} recv_bytes={} nb_batches={}",
        echoed, snapshot.nb_pkts, snapshot.recv_bytes, snapshot.nb_batches
    );
    Ok(())
}

#[tracing::instrument(err, skip(handle, config, stop, stats))]
fn do_echo(
    handle: EmulatorHandle,
    config: EnsoConfig,
    opt: Opt,
    stop: StopToken,
    stats: Arc<Stats>,
) -> Result<()> {
    let device = Device::open(Arc::new(handle), config).wrap_err("open device")?;
    let mut pipes = (0..opt.pipes)
        .map(|_| device.allocate_rx_tx_pipe())
        .collect::<Result<Vec<_>>>()?;
    if opt.bind {
        for (i, pipe) in pipes.iter_mut().enumerate() {
            pipe.bind(FlowRule::udp(BASE_PORT + i as u16, SERVER_IP))?;
        }
    }
    info!(pipes = pipes.len(), "echo server ready");

    poll_echo(&mut pipes, &stop, &stats, |_, pkt| swap_addresses(pkt))?;
    Ok::<_, Report>(())
}

fn do_generator(handle: &EmulatorHandle, opt: &Opt) -> Result<()> {
    let payload = vec![12u8; opt.size];
    for i in 0..opt.num_pkts {
        let header = HeaderInfo {
            src_info: AddressInfo {
                udp_port: 1024 + (i % 4096) as u16,
                ipv4_addr: Ipv4Addr::new(10, 0, 0, 1),
                ..Default::default()
            },
            dst_info: AddressInfo {
                udp_port: BASE_PORT + (i % opt.pipes.max(1)) as u16,
                ipv4_addr: SERVER_IP,
                ..Default::default()
            },
        };
        handle.inject(build_udp_packet(&header, &payload, i as u16)?)?;
    }

    debug!(num_pkts = opt.num_pkts, "generator done");
    Ok(())
}

/// Turn a received frame around: swap MAC, IPv4 and UDP source and destination.
fn swap_addresses(pkt: &mut [u8]) {
    if pkt.len() < 42 {
        return;
    }
    for i in 0..6 {
        pkt.swap(i, 6 + i);
    }
    for i in 0..4 {
        pkt.swap(26 + i, 30 + i);
    }
    for i in 0..2 {
        pkt.swap(34 + i, 36 + i);
    }
}
