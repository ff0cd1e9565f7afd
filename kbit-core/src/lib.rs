//! Engines for the kbit shard toolkit.
//!
//! Three cooperating pieces over one on-disk representation:
//!
//! - **Generator** — dense 4^k-bit vector with an exact target population,
//!   written as a KBITv1 file.
//! - **Point query** — per-k-mer membership against a sharded set of
//!   compressed bitmaps, parallel across shards.
//! - **Streaming enumeration** — lazy, resumable pages of the k-mers
//!   *absent* from the set, optionally expanded to a longer length,
//!   filtered by GC content and substring, interleaved across a window of
//!   shards for prefix diversity.
//!
//! # Example
//!
//! ```no_run
//! use kbit_core::{run_stream, StreamConfig};
//!
//! # fn main() -> kbit_common::Result<()> {
//! let page = run_stream(&StreamConfig {
//!     shards_dir: "shards_18".into(),
//!     limit: 100,
//!     ..Default::default()
//! })?;
//! for v in &page.values {
//!     println!("{}", kbit_common::decode_kmer(*v, page.kout as usize));
//! }
//! # Ok(())
//! # }
//! ```

pub mod cursor;
pub mod engine;
pub mod expand;
pub mod filter;
pub mod gc_hist;
pub mod generator;
pub mod lane;
pub mod manifest;
pub mod perm;
pub mod query;
pub mod rng;
pub mod shard;

// Re-export the request surface
pub use cursor::{LaneRecord, StreamCursor};
pub use engine::{run_stream, Page, StreamConfig};
pub use generator::{generate, GeneratorConfig, GeneratorReport};
pub use manifest::{ShardEntry, ShardManifest};
pub use query::{run_point_query, QueryConfig};
pub use shard::{load_shard, write_shard, ShardBitmap};
