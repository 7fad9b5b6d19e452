// DANS : src/state/mod.rs

pub mod pool_tracker;
pub mod store;

pub use pool_tracker::{ChunkTake, PoolRecord, PoolTracker, TokenChunk};
pub use store::{ClampedDelta, KeyValueStore, MemoryStore};
