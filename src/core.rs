use std::{
    fs::File,
    io::{BufWriter, Write},
    time::{Duration, Instant},
};

use anyhow::Context;
use tokio::{io::AsyncReadExt, net::UdpSocket};

use crate::constants::{TS_PACKET_SIZE, TS_SYNC_BYTE};
use crate::network::create_udp_socket;
use crate::processor::Demultiplexer;
use crate::report::Reporter;
use crate::types::{DemuxConfig, InputSource, Options};

/// Reads the configured input until EOF (file) or Ctrl-C (UDP), printing a
/// JSON snapshot every `refresh_secs` and a final one at the end.
pub async fn run(opts: Options) -> anyhow::Result<()> {
    opts.config.validate()?;
    let mut session = Session::new(&opts)?;
    let mut buf = vec![0u8; TS_PACKET_SIZE * 1024];

    match &opts.input {
        InputSource::File(path) => {
            let mut file = tokio::fs::File::open(path)
                .await
                .with_context(|| format!("opening {}", path.display()))?;
            tracing::info!(path = %path.display(), "reading transport stream file");
            loop {
                let n = file.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                session.push(&buf[..n])?;
            }
        }
        InputSource::Udp { addr, iface } => {
            let socket = create_udp_socket(*addr, *iface)?;
            let sock = UdpSocket::from_std(socket.into())?;
            tracing::info!(%addr, "listening for transport stream");
            loop {
                tokio::select! {
                    received = sock.recv(&mut buf) => {
                        let n = received?;
                        if n == 0 {
                            continue;
                        }
                        session.push(&buf[..n])?;
                    }
                    _ = tokio::signal::ctrl_c() => {
                        tracing::info!("interrupted");
                        break;
                    }
                }
            }
        }
    }

    session.finish()
}

struct Session {
    demux: Demultiplexer,
    splitter: PacketSplitter,
    extract: Option<Extraction>,
    refresh: Duration,
    last_print: Instant,
}

impl Session {
    fn new(opts: &Options) -> anyhow::Result<Self> {
        let mut config = opts.config.clone();
        let extract = match &opts.extract {
            Some(request) => {
                let Some(pid) = request.pid.or_else(|| config.t2mi_pids.first().copied()) else {
                    anyhow::bail!("PLP extraction needs a T2-MI PID");
                };
                config.t2mi_pids.insert(pid);
                let out = match &request.path {
                    Some(path) => Some(BufWriter::new(
                        File::create(path).with_context(|| format!("creating {}", path.display()))?,
                    )),
                    None => None,
                };
                tracing::info!(pid, plp = request.plp, "extracting PLP");
                Some(Extraction {
                    pid,
                    plp: request.plp,
                    out,
                    nested: request.inspect.then(|| Demultiplexer::new(DemuxConfig::default())),
                    written: 0,
                })
            }
            None => None,
        };

        Ok(Self {
            demux: Demultiplexer::new(config),
            splitter: PacketSplitter::default(),
            extract,
            refresh: Duration::from_secs(opts.refresh_secs),
            last_print: Instant::now(),
        })
    }

    fn push(&mut self, data: &[u8]) -> anyhow::Result<()> {
        let demux = &mut self.demux;
        self.splitter.push(data, |chunk| {
            for update in demux.feed(chunk) {
                tracing::debug!(
                    pid = update.identity.pid,
                    table_id = update.identity.table_id,
                    key = update.instance_key,
                    section = update.section_number,
                    version = ?update.version,
                    "section available"
                );
            }
        });
        if let Some(extraction) = &mut self.extract {
            extraction.pump(&mut self.demux)?;
        }

        if !self.refresh.is_zero() && self.last_print.elapsed() >= self.refresh {
            println!("{}", self.report());
            self.last_print = Instant::now();
        }
        Ok(())
    }

    fn report(&self) -> String {
        let report = Reporter::create_report(&self.demux);
        let report = match &self.extract {
            Some(Extraction {
                pid,
                plp,
                nested: Some(nested),
                ..
            }) => Reporter::with_nested(report, *pid, *plp, nested),
            _ => report,
        };
        Reporter::to_json(&report)
    }

    fn finish(mut self) -> anyhow::Result<()> {
        if let Some(extraction) = &mut self.extract {
            extraction.pump(&mut self.demux)?;
            if let Some(out) = &mut extraction.out {
                out.flush()?;
            }
            tracing::info!(
                pid = extraction.pid,
                plp = extraction.plp,
                packets = extraction.written,
                "PLP extraction finished"
            );
        }
        if self.splitter.skipped > 0 {
            tracing::warn!(bytes = self.splitter.skipped, "bytes skipped while looking for sync");
        }
        println!("{}", self.report());
        Ok(())
    }
}

/// Output side of a PLP extraction.
struct Extraction {
    pid: u16,
    plp: u8,
    out: Option<BufWriter<File>>,
    nested: Option<Demultiplexer>,
    written: u64,
}

impl Extraction {
    /// Move every packet rebuilt so far to the file and the nested demultiplexer.
    fn pump(&mut self, demux: &mut Demultiplexer) -> anyhow::Result<()> {
        let Some(extractor) = demux.plp_extractor(self.pid, self.plp) else {
            return Ok(());
        };
        for packet in extractor {
            if let Some(out) = &mut self.out {
                out.write_all(&packet)?;
            }
            if let Some(nested) = &mut self.nested {
                nested.feed(&packet);
            }
            self.written += 1;
        }
        if let Some(plp) = demux.t2mi_mut(self.pid).and_then(|t2mi| t2mi.plp_mut(self.plp)) {
            plp.compact();
        }
        Ok(())
    }
}

/// Cuts a byte stream into 188-byte packets, realigning on the sync byte.
///
/// Out of sync, a candidate 0x47 is only taken when the byte one packet
/// later is also 0x47 (or not yet received).
#[derive(Debug)]
struct PacketSplitter {
    carry: Vec<u8>,
    in_sync: bool,
    skipped: u64,
}

impl Default for PacketSplitter {
    fn default() -> Self {
        Self {
            carry: Vec::new(),
            in_sync: true,
            skipped: 0,
        }
    }
}

impl PacketSplitter {
    fn push(&mut self, data: &[u8], mut on_packet: impl FnMut(&[u8])) {
        self.carry.extend_from_slice(data);
        let mut pos = 0;
        while self.carry.len() - pos >= TS_PACKET_SIZE {
            let aligned = self.carry[pos] == TS_SYNC_BYTE
                && (self.in_sync || self.carry.get(pos + TS_PACKET_SIZE).is_none_or(|&b| b == TS_SYNC_BYTE));
            if !aligned {
                if self.in_sync {
                    tracing::debug!(offset = pos, "lost sync");
                    self.in_sync = false;
                }
                pos += 1;
                self.skipped += 1;
                continue;
            }
            self.in_sync = true;
            on_packet(&self.carry[pos..pos + TS_PACKET_SIZE]);
            pos += TS_PACKET_SIZE;
        }
        self.carry.drain(..pos);
    }
}
