//! Cluster Module
//!
//! Consistent-hash routing, replica placement, membership and health
//! checking across cache nodes.

mod credential;
mod load;
mod manager;
mod node;
mod ring;
mod transport;

pub use credential::{ReplicationCredential, REPLICATION_HEADER};
pub use load::LoadSampler;
pub use manager::{ClusterInfo, ClusterManager, Partition, ReplicationOutcome};
pub use node::{node_id_from_url, ClusterNode, NodeStatus};
pub use ring::{ring_hash, HashRing, NodeShare};
pub use transport::{HttpPeerTransport, PeerHealth, PeerTransport};
