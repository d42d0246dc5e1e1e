use std::net::Ipv4Addr;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use mpegts_demux::DemuxConfig;
use mpegts_demux::inspector::{InputSource, Options, PlpOutput, run};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser)]
#[command(version, about = "MPEG-TS demultiplexer with T2-MI PLP extraction")]
struct Opt {
    /// Read a recorded .ts file instead of listening on UDP
    #[arg(long, conflicts_with = "addr")]
    file: Option<PathBuf>,

    /// UDP socket to bind + listen (IPv4)
    #[arg(long, default_value = "239.1.1.2:1234")]
    addr: String,

    /// Interface address for the multicast join
    #[arg(long)]
    iface: Option<Ipv4Addr>,

    /// Refresh interval for the JSON snapshot (0 = final report only)
    #[arg(long, default_value_t = 2)]
    refresh: u64,

    /// Demultiplexer config (JSON)
    #[arg(long)]
    config: Option<PathBuf>,

    /// PID carrying T2-MI, decimal or 0x-prefixed hex; repeatable
    #[arg(long = "t2mi-pid", value_parser = parse_pid)]
    t2mi_pids: Vec<u16>,

    /// PLP to rebuild from the T2-MI stream
    #[arg(long)]
    plp: Option<u8>,

    /// Write the rebuilt PLP transport stream to this file
    #[arg(long, requires = "plp")]
    plp_out: Option<PathBuf>,

    /// Demultiplex the rebuilt PLP and add it to the report
    #[arg(long, requires = "plp")]
    inspect_plp: bool,

    /// Reassemble complete PES packets on elementary streams
    #[arg(long)]
    collect_pes: bool,

    /// Debug logging (RUST_LOG still wins)
    #[arg(short, long)]
    verbose: bool,
}

fn parse_pid(s: &str) -> Result<u16, String> {
    let pid = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u16::from_str_radix(hex, 16),
        None => s.parse(),
    }
    .map_err(|e| format!("invalid PID {s:?}: {e}"))?;
    if pid > 0x1FFF {
        return Err(format!("PID {pid:#x} exceeds 13 bits"));
    }
    Ok(pid)
}

fn init_logging(verbose: bool) {
    let env_filter = if verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    // stdout carries the JSON reports
    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_target(true))
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opt = Opt::parse();
    init_logging(opt.verbose);

    let mut config = match &opt.config {
        Some(path) => {
            let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
            DemuxConfig::from_json(&text).with_context(|| format!("parsing {}", path.display()))?
        }
        None => DemuxConfig::default(),
    };
    config.t2mi_pids.extend(opt.t2mi_pids.iter().copied());
    config.collect_pes |= opt.collect_pes;

    let input = match opt.file {
        Some(path) => InputSource::File(path),
        None => InputSource::Udp {
            addr: opt.addr.parse()?,
            iface: opt.iface,
        },
    };

    run(Options {
        input,
        refresh_secs: opt.refresh,
        extract: opt.plp.map(|plp| PlpOutput {
            pid: None,
            plp,
            path: opt.plp_out.clone(),
            inspect: opt.inspect_plp,
        }),
        config,
    })
    .await
}
