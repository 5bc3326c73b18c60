use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use rand::{thread_rng, Rng};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpSocket;
use tokio::time::timeout;
use tokio_socks::tcp::Socks5Stream;

use crate::error::{PeerError, PeerResult};
use crate::wire_protocol::messages::{InvEntry, Message, Payload};
use crate::wire_protocol::net_addr::{Host, NetAddr};
use crate::wire_protocol::node::{NodeDesc, DEFAULT_PORT};
use crate::wire_protocol::raw_message::RawMessage;

pub const SOCKET_BUFSIZE: usize = 8192;
pub const SOCKET_TIMEOUT: Duration = Duration::from_secs(15);

/// version (124 bytes for a typical peer) plus verack (24 bytes)
const HANDSHAKE_READ_LEN: usize = 148;

trait PeerStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> PeerStream for T {}

#[derive(Clone, Debug)]
pub struct ConnectionConfig {
    pub node: NodeDesc,
    /// applies per blocking socket operation, not per logical message
    pub socket_timeout: Duration,
    /// SOCKS5 endpoint; required for .onion destinations
    pub proxy: Option<SocketAddr>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            node: NodeDesc::default(),
            socket_timeout: SOCKET_TIMEOUT,
            proxy: None,
        }
    }
}

/// A single client session with a remote node. The connection exclusively
/// owns its stream; lifecycle is [`Connection::open`], any number of
/// sends/reads, [`Connection::close`].
///
/// Not internally thread-safe. A crawler gets parallelism by owning many
/// connections, one per task.
pub struct Connection {
    to_host: Host,
    to_port: u16,
    from_addr: SocketAddr,
    config: ConnectionConfig,
    stream: Option<Box<dyn PeerStream>>,
}

impl Connection {
    pub fn new(to_host: Host, to_port: u16) -> Self {
        let from_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0);
        Self::with_config(to_host, to_port, from_addr, ConnectionConfig::default())
    }

    pub fn with_config(
        to_host: Host,
        to_port: u16,
        from_addr: SocketAddr,
        config: ConnectionConfig,
    ) -> Self {
        let to_port = if to_port == 0 { DEFAULT_PORT } else { to_port };
        Connection {
            to_host,
            to_port,
            from_addr,
            config,
            stream: None,
        }
    }

    pub fn to_host(&self) -> &Host {
        &self.to_host
    }

    pub fn to_port(&self) -> u16 {
        self.to_port
    }

    pub async fn open(&mut self) -> PeerResult<()> {
        let stream = open_stream(
            &self.to_host,
            self.to_port,
            self.config.socket_timeout,
            self.from_addr,
            self.config.proxy,
        )
        .await?;
        log::debug!("connected to {}:{}", self.to_host, self.to_port);
        self.stream = Some(stream);
        Ok(())
    }

    /// Graceful shutdown of both directions. Transport errors during shutdown
    /// are suppressed; the stream is always released.
    pub async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            if let Err(err) = stream.shutdown().await {
                log::warn!(
                    "shutdown of connection to {}:{} failed: {}",
                    self.to_host,
                    self.to_port,
                    err
                );
            }
        }
    }

    pub async fn send(&mut self, data: &[u8]) -> PeerResult<()> {
        let io_timeout = self.config.socket_timeout;
        let stream = self.stream_mut()?;
        timeout(io_timeout, stream.write_all(data)).await??;
        Ok(())
    }

    /// Reads from the stream. With `length > 0` this accumulates until at
    /// least that many bytes have arrived; with `length == 0` it is one
    /// best-effort read of up to [`SOCKET_BUFSIZE`] bytes.
    pub async fn recv(&mut self, length: usize) -> PeerResult<Vec<u8>> {
        let io_timeout = self.config.socket_timeout;
        let endpoint = format!("{}:{}", self.to_host, self.to_port);
        let stream = self.stream_mut()?;
        let mut chunk = vec![0_u8; SOCKET_BUFSIZE];

        if length == 0 {
            let n = timeout(io_timeout, stream.read(&mut chunk)).await??;
            if n == 0 {
                return Err(PeerError::RemoteHostClosedConnection(endpoint));
            }
            chunk.truncate(n);
            return Ok(chunk);
        }

        let mut data = Vec::with_capacity(length);
        while data.len() < length {
            let n = timeout(io_timeout, stream.read(&mut chunk)).await??;
            if n == 0 {
                return Err(PeerError::RemoteHostClosedConnection(endpoint.clone()));
            }
            data.extend_from_slice(&chunk[..n]);
        }
        Ok(data)
    }

    /// Drains as many complete messages as fit in the bytes pulled from the
    /// stream.
    ///
    /// A `PayloadTooShort` decode pulls exactly the missing bytes and retries.
    /// Every received `ping` is answered with a `pong` carrying the same
    /// nonce before this call returns, regardless of `commands`. A non-empty
    /// `commands` list filters what is returned to the caller, nothing else.
    pub async fn get_messages(
        &mut self,
        length: usize,
        commands: &[&str],
    ) -> PeerResult<Vec<Message>> {
        let mut msgs = Vec::new();
        let mut data = self.recv(length).await?;

        while !data.is_empty() {
            // let a runtime multiplexing many connections on one thread
            // interleave them between decodes
            tokio::task::yield_now().await;

            let (msg, rest) = match Message::deserialize(&data) {
                Ok(parsed) => parsed,
                Err(PeerError::PayloadTooShort { required, .. }) => {
                    let more = self.recv(required - data.len()).await?;
                    data.extend_from_slice(&more);
                    Message::deserialize(&data)?
                }
                Err(err) => return Err(err),
            };
            let rest = rest.to_vec();

            log::trace!(
                "received {} message, {} buffered bytes left",
                msg.command(),
                rest.len()
            );
            if let Payload::Ping(nonce) = msg.payload {
                // respond to ping immediately, whatever the caller asked for
                self.pong(nonce).await?;
            }
            msgs.push(msg);
            data = rest;
        }

        if !commands.is_empty() {
            msgs.retain(|msg| commands.contains(&msg.command()));
        }
        Ok(msgs)
    }

    /// Sends our `version` and collects the remote `version`/`verack`,
    /// ordered so that `version` comes first. A missing half is not an error
    /// here; callers judge completeness.
    pub async fn handshake(&mut self) -> PeerResult<Vec<Message>> {
        let version = RawMessage::version(
            &self.config.node,
            &self.to_host,
            self.to_port,
            self.from_addr,
        )?;
        self.send(&version.to_bytes()).await?;

        let mut msgs = self
            .get_messages(HANDSHAKE_READ_LEN, &["version", "verack"])
            .await?;
        // "version" sorts after "verack"; reversed, it leads
        msgs.sort_by(|a, b| b.command().cmp(a.command()));
        Ok(msgs)
    }

    pub async fn getaddr(&mut self) -> PeerResult<Vec<Message>> {
        self.send(&RawMessage::getaddr().to_bytes()).await?;
        self.get_messages(0, &["addr"]).await
    }

    /// Announces addresses to the peer. The caller is responsible for the
    /// 1000-entry cap.
    pub async fn addr(&mut self, addr_list: &[NetAddr]) -> PeerResult<()> {
        let msg = RawMessage::addr(addr_list)?;
        self.send(&msg.to_bytes()).await
    }

    pub async fn ping(&mut self, nonce: Option<u64>) -> PeerResult<()> {
        let nonce = nonce.unwrap_or_else(|| thread_rng().gen());
        self.send(&RawMessage::ping(nonce).to_bytes()).await
    }

    pub async fn pong(&mut self, nonce: u64) -> PeerResult<()> {
        self.send(&RawMessage::pong(nonce).to_bytes()).await
    }

    pub async fn inv(&mut self, inventory: &[InvEntry]) -> PeerResult<()> {
        let msg = RawMessage::inv(inventory)?;
        self.send(&msg.to_bytes()).await
    }

    pub async fn getdata(&mut self, inventory: &[InvEntry]) -> PeerResult<Vec<Message>> {
        let msg = RawMessage::getdata(inventory)?;
        self.send(&msg.to_bytes()).await?;
        self.get_messages(0, &["tx", "block"]).await
    }

    fn stream_mut(&mut self) -> PeerResult<&mut Box<dyn PeerStream>> {
        self.stream
            .as_mut()
            .ok_or_else(|| PeerError::Connection("connection is not open".to_string()))
    }
}

/// Establishes the transport: SOCKS5 CONNECT for onion destinations, direct
/// TCP otherwise. The source binding is dropped when its address family does
/// not match the destination.
async fn open_stream(
    host: &Host,
    port: u16,
    io_timeout: Duration,
    source_addr: SocketAddr,
    proxy: Option<SocketAddr>,
) -> PeerResult<Box<dyn PeerStream>> {
    match host {
        Host::Onion(name) => {
            let proxy = proxy.ok_or(PeerError::ProxyRequired)?;
            let connect = Socks5Stream::connect(proxy, (name.as_str(), port));
            let stream = timeout(io_timeout, connect).await??;
            Ok(Box::new(stream))
        }
        Host::Ipv4(ip) => {
            connect_direct(SocketAddr::new(IpAddr::V4(*ip), port), io_timeout, source_addr).await
        }
        Host::Ipv6(ip) => {
            connect_direct(SocketAddr::new(IpAddr::V6(*ip), port), io_timeout, source_addr).await
        }
    }
}

async fn connect_direct(
    dest: SocketAddr,
    io_timeout: Duration,
    source_addr: SocketAddr,
) -> PeerResult<Box<dyn PeerStream>> {
    let socket = if dest.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    if dest.is_ipv4() == source_addr.is_ipv4() {
        socket.bind(source_addr)?;
    }
    let stream = timeout(io_timeout, socket.connect(dest)).await??;
    Ok(Box::new(stream))
}

#[cfg(test)]
mod test {
    use std::net::Ipv4Addr;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;
    use tokio::time::{sleep, Duration};

    use crate::wire_protocol::messages::{Payload, VersionPayload};
    use crate::wire_protocol::raw_message::Command;

    use super::*;

    /// Spawns a scripted peer on loopback: it writes `chunks` with a short
    /// pause between them, then reads up to `read_back` bytes and returns
    /// them.
    async fn scripted_peer(
        chunks: Vec<Vec<u8>>,
        read_back: usize,
    ) -> (u16, JoinHandle<Vec<u8>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            for chunk in chunks {
                socket.write_all(&chunk).await.unwrap();
                socket.flush().await.unwrap();
                sleep(Duration::from_millis(10)).await;
            }
            let mut received = vec![0_u8; read_back];
            if read_back > 0 {
                socket.read_exact(&mut received).await.unwrap();
            }
            received
        });

        (port, handle)
    }

    async fn open_local(port: u16) -> Connection {
        let mut conn = Connection::new(Host::Ipv4(Ipv4Addr::LOCALHOST), port);
        conn.open().await.unwrap();
        conn
    }

    fn version_frame_bytes(protocol_version: i32, user_agent: &str) -> Vec<u8> {
        let payload = VersionPayload {
            version: protocol_version,
            services: 1,
            timestamp: 1420000000,
            to_addr: NetAddr::new(1, Host::Ipv4(Ipv4Addr::LOCALHOST), 8333),
            from_addr: NetAddr::new(1, Host::Ipv4(Ipv4Addr::UNSPECIFIED), 0),
            nonce: 7,
            user_agent: user_agent.to_string(),
            start_height: 0,
            relay: false,
        };
        RawMessage::new(Command::Version, payload.to_bytes().unwrap()).to_bytes()
    }

    /// Our own version frame is always the same size: 24-byte header plus a
    /// 111-byte payload with the default 25-character user agent.
    const OWN_VERSION_FRAME_LEN: usize = 24 + 111;

    #[tokio::test]
    async fn test_get_messages_reassembles_arbitrary_chunks() {
        let mut wire = RawMessage::ping(1).to_bytes();
        wire.extend_from_slice(&RawMessage::pong(2).to_bytes());
        let total = wire.len();
        let chunks = vec![
            wire[..10].to_vec(),
            wire[10..40].to_vec(),
            wire[40..].to_vec(),
        ];
        let (port, peer) = scripted_peer(chunks, 32).await;

        let mut conn = open_local(port).await;
        let msgs = conn.get_messages(total, &[]).await.unwrap();

        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].command(), "ping");
        assert_eq!(msgs[1].command(), "pong");

        // the ping triggered an auto-pong with the echoed nonce
        let pong = peer.await.unwrap();
        let (msg, rest) = Message::deserialize(&pong).unwrap();
        assert!(rest.is_empty());
        assert!(matches!(msg.payload, Payload::Pong(1)));
    }

    #[tokio::test]
    async fn test_get_messages_pulls_missing_payload_bytes() {
        let wire = RawMessage::ping(99).to_bytes();
        let chunks = vec![wire[..30].to_vec(), wire[30..].to_vec()];
        let (port, peer) = scripted_peer(chunks, 32).await;

        let mut conn = open_local(port).await;
        // ask for the first 30 bytes only; the decode comes up short and the
        // driver has to fetch the remaining 2
        let msgs = conn.get_messages(30, &[]).await.unwrap();

        assert_eq!(msgs.len(), 1);
        assert!(matches!(msgs[0].payload, Payload::Ping(99)));
        peer.await.unwrap();
    }

    #[tokio::test]
    async fn test_auto_pong_ignores_the_allow_list() {
        let mut wire = RawMessage::verack().to_bytes();
        wire.extend_from_slice(&RawMessage::ping(7).to_bytes());
        let total = wire.len();
        let (port, peer) = scripted_peer(vec![wire], 32).await;

        let mut conn = open_local(port).await;
        let msgs = conn.get_messages(total, &["verack"]).await.unwrap();

        // the ping was filtered from the result but still answered
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].command(), "verack");
        let pong = peer.await.unwrap();
        let (msg, _) = Message::deserialize(&pong).unwrap();
        assert!(matches!(msg.payload, Payload::Pong(7)));
    }

    #[tokio::test]
    async fn test_handshake_orders_version_before_verack() {
        // the peer replies verack first, version second; 124 + 24 = 148 bytes
        let mut wire = RawMessage::verack().to_bytes();
        wire.extend_from_slice(&version_frame_bytes(70002, "/Satoshi:0.93/"));
        assert_eq!(wire.len(), HANDSHAKE_READ_LEN);
        let (port, peer) = scripted_peer(vec![wire], OWN_VERSION_FRAME_LEN).await;

        let mut conn = open_local(port).await;
        let msgs = conn.handshake().await.unwrap();

        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].command(), "version");
        assert_eq!(msgs[1].command(), "verack");

        // the peer got our version frame
        let received = peer.await.unwrap();
        let (msg, _) = Message::deserialize(&received).unwrap();
        assert_eq!(msg.command(), "version");
    }

    #[tokio::test]
    async fn test_handshake_rejects_incompatible_client() {
        let mut wire = version_frame_bytes(70000, "/Satoshi:0.93/");
        wire.extend_from_slice(&RawMessage::verack().to_bytes());
        let (port, peer) = scripted_peer(vec![wire], OWN_VERSION_FRAME_LEN).await;

        let mut conn = open_local(port).await;
        assert!(matches!(
            conn.handshake().await,
            Err(PeerError::IncompatibleClient { version: 70000, .. })
        ));
        peer.await.unwrap();
    }

    #[tokio::test]
    async fn test_remote_close_surfaces_during_recv() {
        let (port, _peer) = scripted_peer(vec![], 0).await;
        let mut conn = open_local(port).await;
        assert!(matches!(
            conn.get_messages(0, &[]).await,
            Err(PeerError::RemoteHostClosedConnection(_))
        ));
    }

    #[tokio::test]
    async fn test_onion_without_proxy_is_refused() {
        let mut conn = Connection::new(Host::Onion("abcdefghij234567.onion".to_string()), 8333);
        assert!(matches!(conn.open().await, Err(PeerError::ProxyRequired)));
    }

    #[tokio::test]
    async fn test_send_on_closed_connection_fails() {
        let mut conn = Connection::new(Host::Ipv4(Ipv4Addr::LOCALHOST), 8333);
        assert!(matches!(
            conn.ping(Some(1)).await,
            Err(PeerError::Connection(_))
        ));
    }

    #[test]
    fn test_port_zero_defaults_to_8333() {
        let conn = Connection::new(Host::Ipv4(Ipv4Addr::LOCALHOST), 0);
        assert_eq!(conn.to_port(), DEFAULT_PORT);
    }
}
