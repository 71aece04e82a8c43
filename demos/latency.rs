//! Round-trip latency through an echo server on Enso pipes.
//!
//! The client puts one timestamped UDP frame on the wire at a time and waits for the echo
//! before sending the next.

use color_eyre::{
    eyre::{eyre, WrapErr},
    Result,
};
use enso_pipe::utils::{build_udp_packet, AddressInfo, HeaderInfo, TOTAL_HEADER_SIZE};
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

    #[structopt(short, long, default_value = "9000")]
    port: u16,

    #[structopt(short, long, default_value = "1000")]
    num_reqs: usize,
}

fn main() -> Result<()> {
    let subscriber = tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(ErrorLayer::default());
    let d = tracing::Dispatch::new(subscriber);
    d.init();
    color_eyre::install()?;
    let Opt {
        cfg,
        port,
        num_reqs,
    } = Opt::from_args();

    let config = match cfg {
        Some(path) => EnsoConfig::from_path(&path)?,
        None => EnsoConfig::default(),
    };

    let stop = StopToken::new();
    let (mut emulator, handle) = NetworkEmulator::new(config.rss_hash);
    let emu_stop = stop.clone();
    let emu = std::thread::spawn(move || emulator.run(&emu_stop));

    let (ready_s, ready_r) = flume::bounded(1);
    let server_stop = stop.clone();
    let server_handle = handle.clone();
    let server =
        std::thread::spawn(move || do_server(server_handle, config, port, ready_s, server_stop));
    ready_r
        .recv()
        .map_err(|_| eyre!("server exited before becoming ready"))?;

    let mut times = do_client(&handle, port, num_reqs)?;
    stop.stop();
    server.join().expect("server thread panicked")?;
    emu.join().expect("emulator thread panicked")?;

    let (p5, p25, p50, p75, p95) = percentiles_us(&mut times);
    info!(?p5, ?p25, ?p50, ?p75, ?p95, "done");
    println!(
        "p5={:?}, p25={:?}, p50={:?}, p75={:?}, p95={:?}",
        p5, p25, p50, p75, p95
    );
    Ok(())
}

#[tracing::instrument(err, skip(handle, config, ready, stop))]
fn do_server(
    handle: EmulatorHandle,
    config: EnsoConfig,
    port: u16,
    ready: flume::Sender<()>,
    stop: StopToken,
) -> Result<()> {
    let device = Device::open(Arc::new(handle), config)?;
    let mut pipe = device.allocate_rx_tx_pipe()?;
    pipe.bind(FlowRule::udp(port, Ipv4Addr::UNSPECIFIED))?;
    info!(?port, "listening");
    ready.send(()).map_err(|_| eyre!("client went away"))?;

    let stats = Stats::new();
    poll_echo(std::slice::from_mut(&mut pipe), &stop, &stats, |id, _| {
        debug!(pipe = %id, "echo");
    })?;
    Ok(())
}

#[tracing::instrument(err, skip(handle))]
fn do_client(handle: &EmulatorHandle, port: u16, num_reqs: usize) -> Result<Vec<Duration>> {
    let header = HeaderInfo {
        src_info: AddressInfo {
            udp_port: 4242,
            ipv4_addr: Ipv4Addr::new(10, 0, 0, 1),
            ..Default::default()
        },
        dst_info: AddressInfo {
            udp_port: port,
            ipv4_addr: Ipv4Addr::new(10, 0, 0, 2),
            ..Default::default()
        },
    };

    let mut times = Vec::with_capacity(num_reqs);
    let start = Instant::now();
    for i in 0..num_reqs {
        let msg = bincode::serialize(&TimeMsg::new(start))?;
        handle.inject(build_udp_packet(&header, &msg, i as u16)?)?;
        let frame = handle
            .recv_transmitted_timeout(Duration::from_secs(1))
            .wrap_err("recv echo")?;
        let msg: TimeMsg = bincode::deserialize(&frame[TOTAL_HEADER_SIZE..])?;
        let elap = msg.elapsed(start);
        debug!(?i, ?elap, "received response");
        times.push(elap);
    }

    Ok(times)
}

#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
struct TimeMsg(Duration, u32);
impl TimeMsg {
    fn new(start: Instant) -> Self {
        Self(start.elapsed(), 0xdead)
    }

    fn elapsed(&self, start: Instant) -> Duration {
        assert_eq!(self.1, 0xdead);
        start.elapsed() - self.0
    }
}

fn percentiles_us(durs: &mut [Duration]) -> (Duration, Duration, Duration, Duration, Duration) {
    durs.sort();
    let len = durs.len() as f64;
    let quantile_idxs = [0.05, 0.25, 0.5, 0.75, 0.95];
    let quantiles: Vec<_> = quantile_idxs
        .iter()
        .map(|q| (len * q) as usize)
        .map(|i| durs[i])
        .collect();
    match quantiles[..] {
        [p5, p25, p50, p75, p95] => (p5, p25, p50, p75, p95),
        [..] => unreachable!(),
    }
}
