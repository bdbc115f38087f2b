//! hkv-engine - the storage core: CRDT value types, TTL expiry, cache
//! eviction, sharding, and durable persistence. No networking lives here;
//! `hkv-server` wraps this crate with a wire protocol and background tasks.

pub mod cache;
pub mod crdt;
pub mod persistence;
pub mod shard;
pub mod shard_manager;
pub mod ttl;

pub use crdt::{create_crdt, CrdtKind, CrdtValue, InitialValue};
pub use persistence::PersistenceManager;
pub use shard::{Shard, ShardCounters};
pub use shard_manager::ShardManager;
pub use ttl::TtlStatus;
