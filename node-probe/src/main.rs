use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::process::ExitCode;

use clap::Parser;
use log::LevelFilter;
use simple_logger::SimpleLogger;
use tokio::time::{timeout, Duration};

use net::error::PeerResult;
use net::wire_protocol::connection::{Connection, ConnectionConfig};
use net::wire_protocol::messages::Payload;
use net::wire_protocol::net_addr::Host;
use net::wire_protocol::node::DEFAULT_PORT;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Remote node, e.g. 148.251.238.178:8333, [2001:db8::1]:8333 or
    /// xxxxxxxxxxxxxxxx.onion:8333
    #[arg(short, long)]
    remote: String,

    /// SOCKS5 proxy for .onion destinations, e.g. 127.0.0.1:9050
    #[arg(short, long)]
    proxy: Option<SocketAddr>,

    /// Request address gossip after the handshake
    #[arg(short, long)]
    getaddr: bool,
}

fn init_logging() {
    SimpleLogger::new()
        .with_colors(true)
        .with_level(LevelFilter::Debug)
        .with_local_timestamps()
        .init()
        .unwrap();
}

/// Splits `host:port` (with optional brackets around an IPv6 host) into a
/// [`Host`] and a port. A bare host gets the default port.
fn parse_endpoint(remote: &str) -> PeerResult<(Host, u16)> {
    if let Some(stripped) = remote.strip_prefix('[') {
        if let Some((host, port)) = stripped.split_once("]:") {
            return Ok((host.parse()?, parse_port(port)?));
        }
    }
    match remote.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') => Ok((host.parse()?, parse_port(port)?)),
        _ => Ok((remote.parse()?, DEFAULT_PORT)),
    }
}

fn parse_port(port: &str) -> PeerResult<u16> {
    port.parse()
        .map_err(|_| net::error::PeerError::Connection(format!("bad port number {port}")))
}

const PROBE_TIMEOUT: Duration = Duration::from_secs(60);

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    init_logging();
    let args = Args::parse();

    let (host, port) = match parse_endpoint(&args.remote) {
        Ok(endpoint) => endpoint,
        Err(err) => {
            log::error!("bad remote endpoint {}: {}", args.remote, err);
            return ExitCode::from(2);
        }
    };

    let from_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0);
    let config = ConnectionConfig {
        proxy: args.proxy,
        ..ConnectionConfig::default()
    };
    let mut conn = Connection::with_config(host, port, from_addr, config);

    let outcome = match timeout(PROBE_TIMEOUT, probe(&mut conn, args.getaddr)).await {
        Ok(Ok(())) => ExitCode::SUCCESS,
        Ok(Err(err)) => {
            log::warn!("probe of {} failed: {}", args.remote, err);
            ExitCode::FAILURE
        }
        Err(_) => {
            log::warn!("probe of {} timed out", args.remote);
            ExitCode::FAILURE
        }
    };

    conn.close().await;
    outcome
}

async fn probe(conn: &mut Connection, getaddr: bool) -> PeerResult<()> {
    conn.open().await?;

    let handshake_msgs = conn.handshake().await?;
    if handshake_msgs.is_empty() {
        log::warn!("peer answered the handshake with neither version nor verack");
    }
    for msg in &handshake_msgs {
        match &msg.payload {
            Payload::Version(version) => log::info!(
                "peer speaks protocol {} ({}), height {}",
                version.version,
                version.user_agent,
                version.start_height
            ),
            Payload::Verack => log::info!("version acknowledged"),
            _ => {}
        }
    }

    if getaddr {
        let addr_msgs = conn.getaddr().await?;
        let mut total = 0;
        for msg in &addr_msgs {
            if let Payload::Addr(addr) = &msg.payload {
                total += addr.addr_list.len();
                for entry in &addr.addr_list {
                    log::info!("addr {} services {:#x}", entry, entry.services);
                }
            }
        }
        log::info!("received {total} gossiped addresses");
    }

    Ok(())
}
