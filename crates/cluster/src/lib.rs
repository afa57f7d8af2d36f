// Direktiv cluster
//
// Everything that coordinates several Direktiv nodes:
// - Bus: topic/channel pub-sub with load-balanced channel groups
// - Membership: gossip with failure detection, reaping and tombstones
// - Cache: node-local values kept coherent by bus invalidations
// - Leases: leader election and per-instance exclusive ownership

pub mod bus;
pub mod cache;
pub mod error;
pub mod finder;
pub mod http;
pub mod leader;
pub mod leases;
pub mod membership;
pub mod message;
pub mod readiness;
pub mod transport;

pub use bus::{Bus, BusConfig, Handler, Subscription};
pub use cache::{Cache, CacheConfig, CacheManager, CACHE_TOPIC};
pub use error::{BusError, CacheError};
pub use finder::{DnsFinder, PeerFinder, StaticFinder};
pub use leader::{LeaderConfig, LeaderElector, LEADER_KEY};
pub use leases::{InstanceLease, InstanceLeases};
pub use membership::{ChannelKey, MemberState, MemberView, MembershipTimeouts};
pub use message::{BusMessage, WireMessage};
pub use readiness::{http_ready, wait_ready, READY_TIMEOUT};
pub use transport::{HttpTransport, LocalNetwork, LocalTransport, PeerTransport};
