use sha2::digest::FixedOutput;
use sha2::{Digest, Sha256};
use strum::{EnumIter, IntoEnumIterator};

use crate::error::{PeerError, PeerResult};
use crate::wire_protocol::buffer::{ByteBufferComposer, ByteBufferParser};

/// Mainnet magic value; first on the wire as F9 BE B4 D9.
pub const MAGIC_NUMBER: u32 = 0xD9B4BEF9;

pub const HEADER_LEN: usize = 4 + 12 + 4 + 4;

/// The commands this client can put on the wire. Inbound frames may carry
/// any command; recognized ones get a typed payload, the rest stay raw.
#[derive(Copy, Clone, Debug, PartialEq, Eq, EnumIter)]
pub enum Command {
    Version,
    Verack,
    Ping,
    Pong,
    Addr,
    Getaddr,
    Inv,
    Getdata,
    Tx,
    Block,
}

impl Command {
    // ASCII string identifying the packet content, NULL padded (non-NULL padding results in packet rejected)
    fn wire_bytes(&self) -> &[u8; 12] {
        match self {
            Command::Version => b"version\0\0\0\0\0",
            Command::Verack => b"verack\0\0\0\0\0\0",
            Command::Ping => b"ping\0\0\0\0\0\0\0\0",
            Command::Pong => b"pong\0\0\0\0\0\0\0\0",
            Command::Addr => b"addr\0\0\0\0\0\0\0\0",
            Command::Getaddr => b"getaddr\0\0\0\0\0",
            Command::Inv => b"inv\0\0\0\0\0\0\0\0\0",
            Command::Getdata => b"getdata\0\0\0\0\0",
            Command::Tx => b"tx\0\0\0\0\0\0\0\0\0\0",
            Command::Block => b"block\0\0\0\0\0\0\0",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Version => "version",
            Command::Verack => "verack",
            Command::Ping => "ping",
            Command::Pong => "pong",
            Command::Addr => "addr",
            Command::Getaddr => "getaddr",
            Command::Inv => "inv",
            Command::Getdata => "getdata",
            Command::Tx => "tx",
            Command::Block => "block",
        }
    }

    pub fn from_wire(bytes: &[u8]) -> Option<Command> {
        Command::iter().find(|command| command.wire_bytes()[..] == *bytes)
    }
}

/// Frame header; `command` is trimmed of its zero padding.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MessageHeader {
    pub magic: u32,
    pub command: String,
    pub length: u32,
    pub checksum: [u8; 4],
}

/// A framed message before/without payload typing.
///
/// Message structure (see https://en.bitcoin.it/wiki/Protocol_documentation#Message_structure)
///
/// size | field    | type     | description
/// ---  | -----    | ----     | ------------
/// 4    | magic    | u32      | Magic value indicating message origin network, and used to seek to next message when stream state is unknown
/// 12   | command  | [u8; 12] | ASCII string identifying the packet content, NULL padded
/// 4    | length   | u32      | Length of payload in number of bytes
/// 4    | checksum | u32      | First 4 bytes of sha256(sha256(payload))
/// ?    | payload  | Vec<u8>  | The actual data
#[derive(Debug)]
pub struct RawMessage {
    pub header: MessageHeader,
    pub payload: Vec<u8>,
}

impl RawMessage {
    pub fn new(command: Command, payload: Vec<u8>) -> Self {
        let checksum: [u8; 4] = sha256d(&payload)[..4].try_into().unwrap();
        RawMessage {
            header: MessageHeader {
                magic: MAGIC_NUMBER,
                command: command.as_str().to_string(),
                length: payload.len() as u32,
                checksum,
            },
            payload,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut command = [0_u8; 12];
        command[..self.header.command.len()].copy_from_slice(self.header.command.as_bytes());

        let mut composer = ByteBufferComposer::new();
        composer.append(&self.header.magic.to_le_bytes());
        composer.append(&command);
        composer.append(&self.header.length.to_le_bytes());
        composer.append(&self.header.checksum);
        composer.append(&self.payload);
        composer.result()
    }

    /// Parses one frame off the front of `buffer`. Returns the message and the
    /// number of bytes it occupied.
    ///
    /// [`PeerError::PayloadTooShort`] carries the total buffer length needed
    /// for this frame so the driver can fetch exactly the missing bytes and
    /// retry; everything else is fatal for the current message.
    pub fn parse(buffer: &[u8]) -> PeerResult<(RawMessage, usize)> {
        if buffer.len() < HEADER_LEN {
            return Err(PeerError::HeaderTooShort { got: buffer.len() });
        }

        let mut parser = ByteBufferParser::new(buffer);
        let magic = parser.read_u32_le()?;
        if magic != MAGIC_NUMBER {
            return Err(PeerError::InvalidMagicNumber { got: magic });
        }
        let command = trim_command(parser.read(12)?);
        let length = parser.read_u32_le()?;
        let checksum: [u8; 4] = parser.read(4)?.try_into().unwrap();

        if buffer.len() - HEADER_LEN < length as usize {
            return Err(PeerError::PayloadTooShort {
                got: buffer.len(),
                required: HEADER_LEN + length as usize,
            });
        }

        let payload = parser.read(length as usize)?.to_vec();
        let computed = &sha256d(&payload)[..4];
        if computed != checksum {
            return Err(PeerError::InvalidPayloadChecksum {
                computed: hex::encode(computed),
                expected: hex::encode(checksum),
            });
        }

        let message = RawMessage {
            header: MessageHeader {
                magic,
                command,
                length,
                checksum,
            },
            payload,
        };

        Ok((message, parser.pos()))
    }
}

fn trim_command(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

pub fn sha256d(input: &[u8]) -> [u8; 32] {
    sha256(&sha256(input))
}

fn sha256(input: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::default();
    hasher.update(input);
    hasher.finalize_fixed().into()
}

/// Hex form of a 32-byte wire hash, byte-reversed into the display order a
/// block explorer shows.
pub fn display_hash(wire_bytes: &[u8]) -> String {
    let mut bytes = wire_bytes.to_vec();
    bytes.reverse();
    hex::encode(bytes)
}

/// Wire form of a display-order hex hash.
pub fn wire_hash(display: &str) -> PeerResult<[u8; 32]> {
    let mut bytes =
        hex::decode(display).map_err(|err| PeerError::Read(format!("bad hash hex: {err}")))?;
    if bytes.len() != 32 {
        return Err(PeerError::Read(format!(
            "hash must be 32 bytes, got {}",
            bytes.len()
        )));
    }
    bytes.reverse();
    Ok(bytes.try_into().unwrap())
}

#[cfg(test)]
mod test {
    use hex_literal::hex;
    use rstest::*;

    use super::*;

    #[rstest]
    #[case(b"hello world", & hex ! ("b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9")[..])]
    #[case(b"What a wonderful day!", & hex ! ("99645b38ff103516a86ade43cffa0116d31f6136a83f99d4fa5b6c19e29c20cf"))]
    fn test_message_sha256(#[case] input: &[u8], #[case] expected_result: &[u8]) {
        assert_eq!(&sha256(input), expected_result);
    }

    #[test]
    fn test_frame_layout() {
        let payload = hex!("0807060504030201").to_vec();
        let bytes = RawMessage::new(Command::Ping, payload.clone()).to_bytes();

        assert_eq!(bytes.len(), 32);
        assert_eq!(bytes[..4], hex!("f9beb4d9"));
        assert_eq!(&bytes[4..16], b"ping\0\0\0\0\0\0\0\0");
        assert_eq!(bytes[16..20], 8_u32.to_le_bytes());
        assert_eq!(bytes[20..24], sha256d(&payload)[..4]);
        assert_eq!(bytes[24..], payload);
    }

    #[test]
    fn test_empty_payload_checksum() {
        let bytes = RawMessage::new(Command::Getaddr, vec![]).to_bytes();
        assert_eq!(bytes.len(), HEADER_LEN);
        assert_eq!(bytes[16..20], 0_u32.to_le_bytes());
        assert_eq!(bytes[20..24], hex!("5df6e0e2"));
    }

    #[test]
    fn test_parse_roundtrip_and_consumed_len() {
        let frame = RawMessage::new(Command::Ping, hex!("0807060504030201").to_vec()).to_bytes();
        let mut buffer = frame.clone();
        buffer.extend_from_slice(b"trailing");

        let (message, consumed) = RawMessage::parse(&buffer).unwrap();
        assert_eq!(consumed, frame.len());
        assert_eq!(message.header.command, "ping");
        assert_eq!(message.header.length, 8);
        assert_eq!(message.payload, hex!("0807060504030201"));
    }

    #[test]
    fn test_header_too_short() {
        let result = RawMessage::parse(&[0_u8; 10]);
        assert!(matches!(result, Err(PeerError::HeaderTooShort { got: 10 })));
    }

    #[test]
    fn test_invalid_magic_number() {
        let mut frame = RawMessage::new(Command::Verack, vec![]).to_bytes();
        frame[0] = 0xFA;
        assert!(matches!(
            RawMessage::parse(&frame),
            Err(PeerError::InvalidMagicNumber { .. })
        ));
    }

    #[test]
    fn test_payload_too_short_names_required_len() {
        let frame = RawMessage::new(Command::Ping, hex!("0807060504030201").to_vec()).to_bytes();
        let result = RawMessage::parse(&frame[..30]);
        match result {
            Err(PeerError::PayloadTooShort { got, required }) => {
                assert_eq!(got, 30);
                assert_eq!(required, 32);
            }
            other => panic!("expected PayloadTooShort, got {other:?}"),
        }
    }

    #[test]
    fn test_invalid_payload_checksum() {
        let mut frame = RawMessage::new(Command::Ping, hex!("0807060504030201").to_vec()).to_bytes();
        let last = frame.len() - 1;
        frame[last] ^= 0xFF;
        assert!(matches!(
            RawMessage::parse(&frame),
            Err(PeerError::InvalidPayloadChecksum { .. })
        ));
    }

    #[test]
    fn test_command_table_is_twelve_bytes_and_trims() {
        for command in Command::iter() {
            let wire = command.wire_bytes();
            assert_eq!(trim_command(wire), command.as_str());
            assert_eq!(Command::from_wire(wire), Some(command));
        }
        assert_eq!(Command::from_wire(b"sendheaders\0"), None);
    }

    #[test]
    fn test_display_hash_reverses_wire_order() {
        let wire = hex!("6fe28c0ab6f1b372c1a6a246ae63f74f931e8365e15a089c68d6190000000000");
        assert_eq!(
            display_hash(&wire),
            "000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f"
        );
        assert_eq!(wire_hash(&display_hash(&wire)).unwrap(), wire);
    }
}
