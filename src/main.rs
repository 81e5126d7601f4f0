use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::time::{self, Duration};
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use hashline::{
    Addr, Hashname, Key, Keys, PeerAddr, Switch, SwitchConfig, UdpTransport, CSID_3A,
};

#[derive(Clone, Debug)]
struct SeedPeer {
    addr: SocketAddr,
    key: Vec<u8>,
}

impl FromStr for SeedPeer {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (addr_part, key_part) = s
            .rsplit_once('/')
            .context("seed must include a public key (format: IP:PORT/KEYHEX)")?;

        let addr: SocketAddr = addr_part.parse().context("invalid socket address")?;

        let key = hex::decode(key_part).context("invalid hex public key")?;
        if key.len() != 32 {
            anyhow::bail!("public key must be 64 hex characters (32 bytes)");
        }

        Ok(SeedPeer { addr, key })
    }
}

impl SeedPeer {
    fn peer_addr(&self) -> Result<PeerAddr> {
        let mut keys = Keys::new();
        keys.insert(CSID_3A, Key::from_public(self.key.clone()));
        let hashname = Hashname::from_parts(&keys.to_parts())?;
        Ok(PeerAddr::new(hashname)
            .with_keys(keys)
            .with_path(Addr::udp(self.addr)))
    }
}

#[derive(Parser, Debug)]
#[command(name = "hashline")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value = "0.0.0.0:0")]
    bind: SocketAddr,

    #[arg(short = 'S', long = "seed", value_name = "PEER")]
    seeds: Vec<SeedPeer>,

    #[arg(short, long, default_value = "5")]
    stats_interval: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .init();

    let transport = Arc::new(UdpTransport::bind(args.bind).await?);
    info!("listening on {}", transport.local_addr());

    let config = SwitchConfig {
        seek_on_discovery: true,
        ..SwitchConfig::default()
    };
    let key = config
        .keys
        .get(CSID_3A)
        .context("generated identity lacks a key")?;
    info!("public key: {}", hex::encode(key.public()));

    let switch = Switch::open(config, transport).await?;
    info!("hashname: {}", switch.hashname());

    for seed in &args.seeds {
        info!("seeding from {}", seed.addr);
        match switch.add_peer(seed.peer_addr()?).await {
            Ok((peer, _)) => {
                if let Err(e) = switch.seek(peer.hashname()).await {
                    warn!(error = %e, "seed seek failed");
                }
            }
            Err(e) => warn!(error = %e, "seed failed"),
        }
    }

    let mut interval = time::interval(Duration::from_secs(args.stats_interval.max(1)));

    // Graceful shutdown on Ctrl+C
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("received shutdown signal, exiting gracefully");
                break;
            }
            _ = interval.tick() => {
                let stats = switch.stats();
                info!(
                    open_lines = stats.num_open_lines,
                    running_lines = stats.num_running_lines,
                    peers = stats.known_peers,
                    invalid_packets = stats.invalid_packets,
                    "switch stats"
                );
            }
        }
    }

    switch.close().await?;
    Ok(())
}
