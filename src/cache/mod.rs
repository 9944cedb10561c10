//! Whole-collection cache for offline reads.
//!
//! Snapshots are keyed by `(collection, owner_id)` and always hold the entire known
//! collection for that owner: every write replaces the snapshot, nothing is merged.
//! - Cache-first reads with network refresh ([`CacheLayer::fetch_list`])
//! - Reconciliation that discards optimistic records ([`CacheLayer::refresh`])
//! - Offline mode (serve the last snapshot when the network is unavailable)

mod layer;
mod result;

pub use layer::CacheLayer;
pub use result::{CacheResult, CacheSource, CachedRecords};
