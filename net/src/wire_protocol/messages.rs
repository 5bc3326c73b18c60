use std::net::SocketAddr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rand::{thread_rng, Rng};

use crate::error::{PeerError, PeerResult};
use crate::wire_protocol::buffer::{ByteBufferComposer, ByteBufferParser};
use crate::wire_protocol::net_addr::{Host, NetAddr};
use crate::wire_protocol::node::{NodeDesc, MIN_PROTOCOL_VERSION};
use crate::wire_protocol::raw_message::{
    display_hash, sha256d, wire_hash, Command, MessageHeader, RawMessage,
};

/// Inventory object types
/// (https://en.bitcoin.it/wiki/Protocol_documentation#Inventory_Vectors).
pub const INV_ERROR: u32 = 0;
pub const INV_TX: u32 = 1;
pub const INV_BLOCK: u32 = 2;

/// Encode-side caps; decoding reads whatever count the peer declared.
pub const MAX_ADDR_COUNT: usize = 1000;
pub const MAX_INV_COUNT: usize = 50_000;

/// One parsed frame: the validated header plus a typed payload for the
/// commands this client understands.
#[derive(Clone, Debug)]
pub struct Message {
    pub header: MessageHeader,
    pub payload: Payload,
}

impl Message {
    pub fn command(&self) -> &str {
        &self.header.command
    }

    /// Decodes one complete message off the front of `data`, returning it
    /// together with the unread remainder of the buffer.
    pub fn deserialize(data: &[u8]) -> PeerResult<(Message, &[u8])> {
        let (raw, consumed) = RawMessage::parse(data)?;
        let payload = Payload::decode(&raw.header.command, &raw.payload)?;
        let message = Message {
            header: raw.header,
            payload,
        };
        Ok((message, &data[consumed..]))
    }
}

#[derive(Clone, Debug)]
pub enum Payload {
    Version(VersionPayload),
    Verack,
    Ping(u64),
    Pong(u64),
    Addr(AddrPayload),
    Getaddr,
    Inv(InvPayload),
    Tx(TxPayload),
    Block(BlockPayload),
    /// valid header and checksum, but no typed decoder for the command;
    /// the payload is kept as-is
    Raw(Vec<u8>),
}

impl Payload {
    fn decode(command: &str, payload: &[u8]) -> PeerResult<Payload> {
        let mut parser = ByteBufferParser::new(payload);
        let decoded = match command {
            "version" => Payload::Version(VersionPayload::parse(&mut parser)?),
            "verack" => Payload::Verack,
            "ping" => Payload::Ping(parser.read_u64_le()?),
            "pong" => Payload::Pong(parser.read_u64_le()?),
            "addr" => Payload::Addr(AddrPayload::parse(&mut parser)?),
            "getaddr" => Payload::Getaddr,
            "inv" => Payload::Inv(InvPayload::parse(&mut parser)?),
            "tx" => Payload::Tx(TxPayload::parse(&mut parser)?),
            "block" => Payload::Block(BlockPayload::parse(payload)?),
            _ => Payload::Raw(payload.to_vec()),
        };
        Ok(decoded)
    }
}

/// Outbound frames. Commands without a payload encoder here (e.g. `verack`)
/// go out as an empty-payload frame via [`RawMessage::new`] directly.
impl RawMessage {
    pub fn version(
        me: &NodeDesc,
        to_host: &Host,
        to_port: u16,
        from_addr: SocketAddr,
    ) -> PeerResult<RawMessage> {
        let payload = VersionPayload::new(me, to_host, to_port, from_addr);
        Ok(RawMessage::new(Command::Version, payload.to_bytes()?))
    }

    pub fn verack() -> RawMessage {
        RawMessage::new(Command::Verack, vec![])
    }

    pub fn ping(nonce: u64) -> RawMessage {
        RawMessage::new(Command::Ping, nonce.to_le_bytes().to_vec())
    }

    pub fn pong(nonce: u64) -> RawMessage {
        RawMessage::new(Command::Pong, nonce.to_le_bytes().to_vec())
    }

    pub fn getaddr() -> RawMessage {
        RawMessage::new(Command::Getaddr, vec![])
    }

    pub fn addr(addr_list: &[NetAddr]) -> PeerResult<RawMessage> {
        let payload = AddrPayload {
            addr_list: addr_list.to_vec(),
        };
        Ok(RawMessage::new(Command::Addr, payload.to_bytes()?))
    }

    pub fn inv(inventory: &[InvEntry]) -> PeerResult<RawMessage> {
        Ok(RawMessage::new(Command::Inv, InvPayload::to_bytes(inventory)?))
    }

    pub fn getdata(inventory: &[InvEntry]) -> PeerResult<RawMessage> {
        Ok(RawMessage::new(
            Command::Getdata,
            InvPayload::to_bytes(inventory)?,
        ))
    }
}

/// https://en.bitcoin.it/wiki/Protocol_documentation#version
///
/// size | field        | type     | description
/// ---  | -----        | ----     | ------------
/// 4    | version      | i32      | Identifies protocol version being used by the node
/// 8    | services     | u64      | bitfield of features to be enabled for this connection
/// 8    | timestamp    | i64      | standard UNIX timestamp in seconds
/// 26   | to_addr      | net_addr | The network address of the node receiving this message
/// 26   | from_addr    | net_addr | The network address of the emitting node
/// 8    | nonce        | u64      | Node random nonce
/// ?    | user_agent   | var_str  | User Agent (0x00 if string is 0 bytes long)
/// 4    | start_height | i32      | The last block received by the emitting node
/// 1    | relay        | bool     | Whether the remote peer should announce relayed transactions, see BIP 0037
#[derive(Clone, Debug)]
pub struct VersionPayload {
    pub version: i32,
    pub services: u64,
    pub timestamp: i64,
    pub to_addr: NetAddr,
    pub from_addr: NetAddr,
    pub nonce: u64,
    pub user_agent: String,
    pub start_height: i32,
    pub relay: bool,
}

impl VersionPayload {
    /// The version we announce, stamped with the current time and a fresh
    /// nonce.
    pub fn new(me: &NodeDesc, to_host: &Host, to_port: u16, from_addr: SocketAddr) -> Self {
        VersionPayload {
            version: me.protocol_version,
            services: me.from_services.as_bitmask(),
            timestamp: time_since_epoch().as_secs() as i64,
            to_addr: NetAddr::new(me.to_services.as_bitmask(), to_host.clone(), to_port),
            from_addr: NetAddr::new(
                me.from_services.as_bitmask(),
                Host::from(from_addr.ip()),
                from_addr.port(),
            ),
            nonce: thread_rng().gen(),
            user_agent: me.user_agent.clone(),
            start_height: me.start_height,
            relay: me.relay,
        }
    }

    pub fn to_bytes(&self) -> PeerResult<Vec<u8>> {
        let mut composer = ByteBufferComposer::new();
        composer.append(&self.version.to_le_bytes());
        composer.append(&self.services.to_le_bytes());
        composer.append(&self.timestamp.to_le_bytes());
        self.to_addr.append_to(&mut composer, false)?;
        self.from_addr.append_to(&mut composer, false)?;
        composer.append(&self.nonce.to_le_bytes());
        composer.append_var_str(self.user_agent.as_bytes());
        composer.append(&self.start_height.to_le_bytes());
        composer.append(&[self.relay as u8]);
        Ok(composer.result())
    }

    fn parse(parser: &mut ByteBufferParser<'_>) -> PeerResult<Self> {
        let version = parser.read_i32_le()?;
        if version < MIN_PROTOCOL_VERSION {
            return Err(PeerError::IncompatibleClient {
                version,
                min: MIN_PROTOCOL_VERSION,
            });
        }
        let services = parser.read_u64_le()?;
        let timestamp = parser.read_i64_le()?;
        let to_addr = NetAddr::parse(parser, false)?;
        let from_addr = NetAddr::parse(parser, false)?;
        let nonce = parser.read_u64_le()?;
        let user_agent = String::from_utf8_lossy(parser.read_var_str()?).into_owned();
        let start_height = parser.read_i32_le()?;
        // peers speaking exactly 70001 may omit the relay byte
        let relay = match parser.read_u8() {
            Ok(byte) => byte != 0,
            Err(_) => false,
        };

        Ok(VersionPayload {
            version,
            services,
            timestamp,
            to_addr,
            from_addr,
            nonce,
            user_agent,
            start_height,
            relay,
        })
    }
}

#[derive(Clone, Debug, Default)]
pub struct AddrPayload {
    pub addr_list: Vec<NetAddr>,
}

impl AddrPayload {
    pub fn to_bytes(&self) -> PeerResult<Vec<u8>> {
        debug_assert!(self.addr_list.len() <= MAX_ADDR_COUNT);
        let mut composer = ByteBufferComposer::new();
        composer.append_var_int(self.addr_list.len() as u64);
        for addr in &self.addr_list {
            addr.append_to(&mut composer, true)?;
        }
        Ok(composer.result())
    }

    fn parse(parser: &mut ByteBufferParser<'_>) -> PeerResult<Self> {
        let count = parser.read_var_int()?;
        let mut addr_list = Vec::new();
        for _ in 0..count {
            addr_list.push(NetAddr::parse(parser, true)?);
        }
        Ok(AddrPayload { addr_list })
    }
}

/// Inventory vector entry; `hash` is hex in display order (byte-reversed
/// from the wire).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InvEntry {
    pub inv_type: u32,
    pub hash: String,
}

impl InvEntry {
    fn append_to(&self, composer: &mut ByteBufferComposer) -> PeerResult<()> {
        composer.append(&self.inv_type.to_le_bytes());
        composer.append(&wire_hash(&self.hash)?);
        Ok(())
    }

    fn parse(parser: &mut ByteBufferParser<'_>) -> PeerResult<Self> {
        let inv_type = parser.read_u32_le()?;
        let hash = display_hash(parser.read(32)?);
        Ok(InvEntry { inv_type, hash })
    }
}

#[derive(Clone, Debug)]
pub struct InvPayload {
    /// wall clock in milliseconds at decode time; lets the crawler correlate
    /// gossip timing across connections
    pub timestamp: u64,
    pub inventory: Vec<InvEntry>,
}

impl InvPayload {
    pub fn to_bytes(inventory: &[InvEntry]) -> PeerResult<Vec<u8>> {
        debug_assert!(inventory.len() <= MAX_INV_COUNT);
        let mut composer = ByteBufferComposer::new();
        composer.append_var_int(inventory.len() as u64);
        for entry in inventory {
            entry.append_to(&mut composer)?;
        }
        Ok(composer.result())
    }

    fn parse(parser: &mut ByteBufferParser<'_>) -> PeerResult<Self> {
        let timestamp = time_since_epoch().as_millis() as u64;
        let count = parser.read_var_int()?;
        let mut inventory = Vec::new();
        for _ in 0..count {
            inventory.push(InvEntry::parse(parser)?);
        }
        Ok(InvPayload {
            timestamp,
            inventory,
        })
    }
}

#[derive(Clone, Debug)]
pub struct TxIn {
    /// previous output hash, hex in display order
    pub prev_out_hash: String,
    pub prev_out_index: u32,
    /// opaque signature script
    pub script: Vec<u8>,
    pub sequence: u32,
}

#[derive(Clone, Debug)]
pub struct TxOut {
    pub value: i64,
    /// opaque pubkey script
    pub script: Vec<u8>,
}

/// https://en.bitcoin.it/wiki/Protocol_documentation#tx
#[derive(Clone, Debug)]
pub struct TxPayload {
    pub version: u32,
    pub tx_in: Vec<TxIn>,
    pub tx_out: Vec<TxOut>,
    pub lock_time: u32,
    /// double-SHA256 of the serialized transaction, hex in display order;
    /// derived on decode
    pub tx_hash: String,
}

impl TxPayload {
    pub fn to_bytes(&self) -> PeerResult<Vec<u8>> {
        let mut composer = ByteBufferComposer::new();
        composer.append(&self.version.to_le_bytes());
        composer.append_var_int(self.tx_in.len() as u64);
        for tx_in in &self.tx_in {
            composer.append(&wire_hash(&tx_in.prev_out_hash)?);
            composer.append(&tx_in.prev_out_index.to_le_bytes());
            composer.append_var_str(&tx_in.script);
            composer.append(&tx_in.sequence.to_le_bytes());
        }
        composer.append_var_int(self.tx_out.len() as u64);
        for tx_out in &self.tx_out {
            composer.append(&tx_out.value.to_le_bytes());
            composer.append_var_str(&tx_out.script);
        }
        composer.append(&self.lock_time.to_le_bytes());
        Ok(composer.result())
    }

    fn parse(parser: &mut ByteBufferParser<'_>) -> PeerResult<Self> {
        let version = parser.read_u32_le()?;

        let tx_in_count = parser.read_var_int()?;
        let mut tx_in = Vec::new();
        for _ in 0..tx_in_count {
            tx_in.push(TxIn {
                prev_out_hash: display_hash(parser.read(32)?),
                prev_out_index: parser.read_u32_le()?,
                script: parser.read_var_str()?.to_vec(),
                sequence: parser.read_u32_le()?,
            });
        }

        let tx_out_count = parser.read_var_int()?;
        let mut tx_out = Vec::new();
        for _ in 0..tx_out_count {
            tx_out.push(TxOut {
                value: parser.read_i64_le()?,
                script: parser.read_var_str()?.to_vec(),
            });
        }

        let lock_time = parser.read_u32_le()?;

        let mut tx = TxPayload {
            version,
            tx_in,
            tx_out,
            lock_time,
            tx_hash: String::new(),
        };
        // hash over the re-serialized record; identical to hashing the wire
        // slice, and it keeps the encoder honest
        tx.tx_hash = display_hash(&sha256d(&tx.to_bytes()?));
        Ok(tx)
    }
}

/// https://en.bitcoin.it/wiki/Protocol_documentation#block
#[derive(Clone, Debug)]
pub struct BlockPayload {
    pub version: u32,
    pub prev_block_hash: String,
    pub merkle_root: String,
    pub timestamp: u32,
    pub bits: u32,
    pub nonce: u32,
    pub tx: Vec<TxPayload>,
    /// double-SHA256 of the 80-byte block header, hex in display order;
    /// derived on decode
    pub block_hash: String,
}

impl BlockPayload {
    const HEADER_SIZE: usize = 80;

    pub fn to_bytes(&self) -> PeerResult<Vec<u8>> {
        let mut composer = ByteBufferComposer::new();
        composer.append(&self.version.to_le_bytes());
        composer.append(&wire_hash(&self.prev_block_hash)?);
        composer.append(&wire_hash(&self.merkle_root)?);
        composer.append(&self.timestamp.to_le_bytes());
        composer.append(&self.bits.to_le_bytes());
        composer.append(&self.nonce.to_le_bytes());
        composer.append_var_int(self.tx.len() as u64);
        for tx in &self.tx {
            composer.append(&tx.to_bytes()?);
        }
        Ok(composer.result())
    }

    fn parse(payload: &[u8]) -> PeerResult<Self> {
        if payload.len() < Self::HEADER_SIZE {
            return Err(PeerError::Read(format!(
                "block header needs {} bytes, got {}",
                Self::HEADER_SIZE,
                payload.len()
            )));
        }
        let block_hash = display_hash(&sha256d(&payload[..Self::HEADER_SIZE]));

        let mut parser = ByteBufferParser::new(payload);
        let version = parser.read_u32_le()?;
        let prev_block_hash = display_hash(parser.read(32)?);
        let merkle_root = display_hash(parser.read(32)?);
        let timestamp = parser.read_u32_le()?;
        let bits = parser.read_u32_le()?;
        let nonce = parser.read_u32_le()?;

        let tx_count = parser.read_var_int()?;
        let mut tx = Vec::new();
        for _ in 0..tx_count {
            tx.push(TxPayload::parse(&mut parser)?);
        }

        Ok(BlockPayload {
            version,
            prev_block_hash,
            merkle_root,
            timestamp,
            bits,
            nonce,
            tx,
            block_hash,
        })
    }
}

fn time_since_epoch() -> Duration {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(elapsed) => elapsed,
        Err(_) => panic!("SystemTime too low"),
    }
}
