//! Layered Cache Engine
//!
//! Memory, disk and remote tiers behind one async [`Cache`] contract, plus a
//! composite that stacks them.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                           LayeredCache                                    │
//! ├──────────────────────────────────────────────────────────────────────────┤
//! │  Tier 0 (Memory)      │ Tier 1 (Disk)       │ Tier 2 (Remote)           │
//! │  ┌────────────────┐   │ ┌────────────────┐  │ ┌────────────────────┐    │
//! │  │ HashMap        │   │ │ Value files    │  │ │ Shared store       │    │
//! │  │ + Policy       │   │ │ + metadata.json│  │ │ (mock or client)   │    │
//! │  │ TTL: 5m        │   │ │ TTL: 1h        │  │ │ TTL: 24h           │    │
//! │  └────────────────┘   │ └────────────────┘  │ └────────────────────┘    │
//! │         ▲             │         │           │           │               │
//! │         └─────────────┴─────────┴───────────┴───────────┘               │
//! │                              │                                           │
//! │              Promotion workers / Write-back flusher                     │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Tiers
//!
//! - [`MemoryCache`]: bounded map, FIFO/LRU/LFU eviction, background reaper
//! - [`DiskCache`]: one file per value plus a JSON index that survives restarts
//! - [`MockRemoteCache`]: in-process stand-in for a networked store
//!
//! # Conventions
//!
//! - A zero TTL means "use the tier's default TTL"
//! - `max_size` counts entries; 0 means unbounded
//! - Expired entries are misses whether or not the reaper has run yet

pub mod disk;
pub mod entry;
pub mod layered;
pub mod memory;
pub mod metrics;
pub mod policy;
pub mod remote;
pub mod serializer;
pub mod traits;

mod promotion;
mod proptest;
mod reaper;
mod writeback;

pub use disk::{read_index, DiskCache, DiskConfig, DiskEntryInfo};
pub use entry::{CacheEntry, EntryMeta};
pub use layered::{LayerReport, LayeredCache, LayeredOptions, LayeredStats};
pub use memory::{MemoryCache, MemoryConfig};
pub use metrics::{LayeredMetrics, MetricsSnapshot};
pub use policy::{EvictionPolicy, FifoPolicy, LfuPolicy, LruPolicy, PolicyKind};
pub use remote::{MockRemoteCache, MockRemoteConfig, RemoteCache};
pub use serializer::{JsonSerializer, Serializer};
pub use traits::{Cache, CacheStats, CacheValue};
