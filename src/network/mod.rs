// P2P networking: broadcasts, peer liveness and the node runtime

mod message;
mod peer;
pub mod heartbeat;
mod node;

pub use message::{BroadcastKind, BroadcastMessage, IngestError};
pub use peer::{PeerId, PeerRecord, PeerSet};
pub use heartbeat::{heartbeat_round, HeartbeatIdentity, HeartbeatScheduler, MembershipChange, RoundReport};
pub use node::{Node, NodeHandle};
