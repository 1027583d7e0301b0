//! A resource-efficient indexer.
//!
//! Minidex is an embedded indexing and retrieval engine built around
//! immutable, memory-mapped segments. Ingested (term, document) pairs land
//! in a write-ahead-logged buffer, are flushed to sorted segment files,
//! and are compacted by a background merger; queries evaluate boolean
//! trees as lazy merge-joins over snapshot-isolated views.
//!
//! # Example
//!
//! ```no_run
//! use minidex::engine::{Engine, EngineConfig};
//! use minidex::query::Query;
//!
//! # fn main() -> minidex::error::Result<()> {
//! let engine = Engine::open("./index".as_ref(), EngineConfig::default())?;
//!
//! engine.ingest(b"rust", 1, 2)?;
//! engine.ingest(b"index", 1, 1)?;
//! engine.ingest(b"rust", 2, 1)?;
//!
//! let query = Query::and(vec![Query::term("rust"), Query::term("index")]);
//! for hit in engine.search(&query)? {
//!     println!("doc {} scored {}", hit.doc_ref, hit.score);
//! }
//!
//! engine.close()?;
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub mod engine;
pub mod error;
pub mod manifest;
pub mod merge;
pub mod query;
pub mod segment;
pub mod wal;
pub mod write_buffer;

pub use engine::{Engine, EngineConfig, EngineStats};
pub use error::{MinidexError, Result};
pub use query::{Query, ScoredDoc};
pub use segment::{ChecksumMode, Posting};

/// Crate version string.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
