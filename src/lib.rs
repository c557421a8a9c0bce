//! Elohim Blockservice - content-addressed blocks served from a pack CDN
//!
//! Stores blocks by appending them to large remote packs and remembers where
//! each one landed, so reads become a single ranged fetch. Blocks the CDN
//! doesn't know are requested from the peer exchange and, on request,
//! written back.
//!
//! ## Architecture
//!
//! - **Validator**: rejects CIDs built on unsafe hash functions
//! - **Placement index**: block hash → (pack, offset, size), owner → current pack
//! - **Remote packs**: append-only pack CDN (upload, append, ranged fetch)
//! - **Blockstore**: local cache, owned by the caller
//! - **Exchange**: peer fetches for everything the CDN misses
//!
//! ## Why Packs?
//!
//! | Per-block objects | Packs |
//! |-------------------|-------|
//! | One request per block written | One request per 32 blocks |
//! | Millions of tiny CDN objects | A few 100 MiB files |
//! | Deletable | Append-only: deletes only evict the local cache |
//!
//! ## Storage Layout
//!
//! ```text
//! ~/.local/share/elohim-blockservice/
//! ├── placements.sled/       # Placement index
//! ├── cache/blocks/          # Filesystem blockstore
//! └── config.toml            # Configuration
//! ```

pub mod block;
pub mod blockstore;
pub mod config;
pub mod context;
pub mod error;
pub mod exchange;
pub mod index;
pub mod metering;
pub mod pack;
pub mod remote;
pub mod service;
pub mod session;
pub mod stats;
pub mod streamer;
pub mod validator;

mod reader;

// Re-exports
pub use block::{content_hash_hex, Block};
pub use blockstore::{Blockstore, FsBlockstore, MemoryBlockstore};
pub use config::{Config, ServiceConfig};
pub use context::CallContext;
pub use error::{BlockServiceError, Result};
pub use exchange::{BlockStream, Exchange, Fetcher, MemoryExchange};
pub use index::{FileInfo, FileRecord, LocalIndex, MemoryIndex, PlacementIndex, SledIndex};
pub use metering::{BandwidthUsage, HttpUsageReporter, UsageReporter};
pub use remote::{HttpRemoteStore, MemoryRemoteStore, PackReceipt, Placement, RemoteStore};
pub use service::{BlockGetter, BlockService};
pub use session::Session;
pub use stats::ServiceStats;
pub use streamer::MAX_BATCH;
pub use validator::validate_cid;
