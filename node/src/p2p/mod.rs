pub mod codec;
pub mod manager;
pub mod messages;

pub use codec::FrameCodec;
pub use manager::{PeerEvent, PeerManager, SavedPeer};
pub use messages::{PeerAddress, RpcMessage};
