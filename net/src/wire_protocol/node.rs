use strum::{EnumIter, IntoEnumIterator};

pub const PROTOCOL_VERSION: i32 = 70002;
pub const MIN_PROTOCOL_VERSION: i32 = 70001;
pub const USER_AGENT: &str = "/getaddr.bitnodes.io:0.1/";
pub const HEIGHT: i32 = 336264;
pub const DEFAULT_PORT: u16 = 8333;

#[derive(Clone, Debug, PartialEq)]
pub struct NodeServiceSet(pub Vec<NodeService>);

impl NodeServiceSet {
    pub fn as_bitmask(&self) -> u64 {
        self.0.iter().fold(0, |mask, service| mask | service.as_u64())
    }

    pub fn from_bitmask(mask: u64) -> Self {
        let mut services = vec![];

        for service in NodeService::iter() {
            if mask & service.as_u64() != 0 {
                services.push(service);
            }
        }

        NodeServiceSet(services)
    }
}

#[derive(Copy, Clone, Debug, PartialEq)]
#[repr(u64)]
#[derive(EnumIter)]
pub enum NodeService {
    NodeNetwork = 0x1, // bit mask value
    NodeGetUtxo = 0x2,
    NodeBloom = 0x4,
    NodeWitness = 0x8,
    NodeNetworkLimited = 0x400,
}

impl NodeService {
    pub fn as_u64(self) -> u64 {
        self as u64
    }
}

/// What this client announces about itself in its `version` message.
#[derive(Clone, Debug)]
pub struct NodeDesc {
    pub protocol_version: i32,
    /// services we assume the remote node offers
    pub to_services: NodeServiceSet,
    /// services we claim to offer
    pub from_services: NodeServiceSet,
    pub user_agent: String,
    pub start_height: i32,
    /// whether the remote peer should announce relayed transactions (BIP 0037)
    pub relay: bool,
}

impl Default for NodeDesc {
    fn default() -> Self {
        NodeDesc {
            protocol_version: PROTOCOL_VERSION,
            to_services: NodeServiceSet(vec![NodeService::NodeNetwork]),
            from_services: NodeServiceSet(vec![NodeService::NodeNetwork]),
            user_agent: USER_AGENT.to_string(),
            start_height: HEIGHT,
            relay: false,
        }
    }
}
