pub mod fullnode;
pub mod p2p;

pub use fullnode::{ChainSummary, FullNode, SyncState};
pub use p2p::codec::FrameCodec;
pub use p2p::manager::{PeerEvent, PeerManager};
pub use p2p::messages::{PeerAddress, RpcMessage};
