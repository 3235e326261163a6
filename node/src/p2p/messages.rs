use std::io;
use std::net::{SocketAddr, ToSocketAddrs};

use serde::{Deserialize, Serialize};

/// The (host, port) pair a node listens on; its identity on the mesh.
/// Serialized as a two-element array, `["127.0.0.1", 13337]`.
pub type PeerAddress = (String, u16);

/// Resolve an advertised peer address to a socket address.
pub fn resolve_peer_address(address: &PeerAddress) -> io::Result<SocketAddr> {
    (address.0.as_str(), address.1)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                format!("cannot resolve {}:{}", address.0, address.1),
            )
        })
}

/// The whitelisted RPC verbs. External tagging gives each message the
/// single-verb-key wire shape, e.g. `{"getLastBlock":{"latestBlockHeight":4}}`;
/// anything with an unknown verb fails to deserialize and is dropped.
///
/// Blocks ride as strings of their canonical JSON so the hash survives
/// transport byte-for-byte.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum RpcMessage {
    /// Sent on dial; the receiver records the identity and connects back.
    #[serde(rename = "connect")]
    Connect {
        server_address: PeerAddress,
        peers: Vec<PeerAddress>,
    },
    /// The sender is going away; the receiver closes its side.
    #[serde(rename = "end")]
    End { server_address: PeerAddress },
    /// Gossip of a freshly mined block.
    #[serde(rename = "newBlock")]
    NewBlock(String),
    /// Sync phase A: "who is ahead of me?"
    #[serde(rename = "getLastBlock")]
    GetLastBlock {
        #[serde(rename = "latestBlockHeight")]
        latest_block_height: u64,
    },
    /// Sync phase B reply carrying the responder's tip height.
    #[serde(rename = "listLastBlocks")]
    ListLastBlocks {
        #[serde(rename = "lastBlockHeight")]
        last_block_height: u64,
    },
    /// Sync phase C request for the blocks in `(fromHeight, toHeight]`.
    #[serde(rename = "getInventory")]
    GetInventory {
        #[serde(rename = "fromHeight")]
        from_height: u64,
        #[serde(rename = "toHeight")]
        to_height: u64,
    },
    /// Sync phase C reply: the requested blocks, lowest height first.
    #[serde(rename = "updateInventory")]
    UpdateInventory(Vec<String>),
}

impl RpcMessage {
    pub fn verb(&self) -> &'static str {
        match self {
            RpcMessage::Connect { .. } => "connect",
            RpcMessage::End { .. } => "end",
            RpcMessage::NewBlock(_) => "newBlock",
            RpcMessage::GetLastBlock { .. } => "getLastBlock",
            RpcMessage::ListLastBlocks { .. } => "listLastBlocks",
            RpcMessage::GetInventory { .. } => "getInventory",
            RpcMessage::UpdateInventory(_) => "updateInventory",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_shape_is_single_verb_key() {
        let message = RpcMessage::GetLastBlock {
            latest_block_height: 4,
        };
        assert_eq!(
            serde_json::to_string(&message).unwrap(),
            r#"{"getLastBlock":{"latestBlockHeight":4}}"#
        );

        let message = RpcMessage::Connect {
            server_address: ("127.0.0.1".to_string(), 13337),
            peers: vec![("127.0.0.1".to_string(), 13338)],
        };
        assert_eq!(
            serde_json::to_string(&message).unwrap(),
            r#"{"connect":{"server_address":["127.0.0.1",13337],"peers":[["127.0.0.1",13338]]}}"#
        );
    }

    #[test]
    fn unknown_verbs_fail_to_parse() {
        let result: Result<RpcMessage, _> =
            serde_json::from_str(r#"{"launchMissiles":{}}"#);
        assert!(result.is_err());
    }

    #[test]
    fn inventory_round_trips() {
        let message = RpcMessage::UpdateInventory(vec!["{}".to_string(); 3]);
        let raw = serde_json::to_string(&message).unwrap();
        assert!(raw.starts_with(r#"{"updateInventory":"#));
        let back: RpcMessage = serde_json::from_str(&raw).unwrap();
        assert_eq!(back, message);
    }

    #[test]
    fn resolves_loopback() {
        let addr = resolve_peer_address(&("127.0.0.1".to_string(), 13337)).unwrap();
        assert_eq!(addr.port(), 13337);
    }
}
