//! layercache - Layered Caching Engine
//!
//! A multi-tier cache for sitting in front of slow upstream APIs such as a
//! quote service. Fast memory sits over a persistent disk tier, optionally
//! backed by a remote store, and the whole stack answers to one async
//! contract.
//!
//! # Architecture
//!
//! ```text
//! Caller → CacheAside → LayeredCache → [Memory] → [Disk] → [Remote] → Provider
//!                            ▲               │
//!                            └── promotion ──┘
//! ```
//!
//! # Features
//!
//! - Memory tier with FIFO, LRU or LFU eviction
//! - Disk tier that persists an index and recovers after restart
//! - Remote tier contract with an in-process mock
//! - Promotion of lower-tier hits, write-through and write-back
//! - Per-call timeouts and composite metrics
//! - YAML configuration
//!
//! # Modules
//!
//! - [`cache`] - Cache contract, tiers, policies and the layered composite
//! - [`config`] - Serializable configuration and duration parsing
//! - [`error`] - Error types
//! - [`provider`] - Cache-aside access to an upstream data source

pub mod cache;
pub mod config;
pub mod error;
pub mod provider;

// Re-export commonly used types
pub use cache::{
    Cache, CacheStats, CacheValue, DiskCache, DiskConfig, LayeredCache, LayeredOptions,
    MemoryCache, MemoryConfig, MockRemoteCache, PolicyKind, RemoteCache,
};
pub use config::{LayerConfig, LayerKind, LayeredCacheConfig};
pub use error::{CacheError, ErrorCode, Result};
pub use provider::{CacheAside, Provider};
