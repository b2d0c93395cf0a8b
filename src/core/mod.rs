//! Heap archive engine
//!
//! Copies subgraphs of a managed heap, rooted at registered static fields,
//! into two contiguous regions that can be written to disk and mapped back
//! at the next start.
//!
//! ## Dump
//!
//! - [`registry`] - Root registry: which static fields seed the archive
//! - [`checker`] - Decides which roots can be archived at all
//! - [`archiver`] - Copies reachable objects, deduplicated across roots
//! - [`subgraph`] - Per-type records of archived entry fields
//! - [`codec`] - Narrow 32-bit references and their base/shift codec
//! - [`region`] - Region buffers and the in-region object layout
//! - [`dump`] - One dump end to end, driven by [`config`]
//!
//! ## Load
//!
//! - [`image`] / [`header`] - On-disk layout with checksummed blobs
//! - [`relocation`] - Rewrites narrow references for a new mapping
//! - [`loader`] - Mapping, relocation and per-type materialization
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │             Heap Archive File               │
//! ├─────────────────────────────────────────────┤
//! │ Page 0: Header (4KB)                        │
//! │  - Magic: "HARC\x00\x01\x00\x00"            │
//! │  - Codec base and shift                     │
//! │  - Blob offsets, lengths, CRC32             │
//! ├─────────────────────────────────────────────┤
//! │ Closed region + relocation bitmap           │
//! ├─────────────────────────────────────────────┤
//! │ Open region + relocation bitmap             │
//! ├─────────────────────────────────────────────┤
//! │ Compiled subgraph table                     │
//! └─────────────────────────────────────────────┘
//! ```

pub mod archiver;
pub mod bitmap;
pub mod checker;
pub mod codec;
pub mod config;
pub mod dump;
pub mod error;
pub mod header;
pub mod heap;
pub mod image;
pub mod io;
pub mod loader;
pub mod region;
pub mod registry;
pub mod relocation;
pub mod stats;
pub mod subgraph;

// Re-export commonly used types
pub use archiver::{GraphArchiver, RootOutcome};
pub use bitmap::RelocationBitmap;
pub use checker::{PreservabilityChecker, RootFieldDescriptor, Verdicts};
pub use codec::{ArchiveCodec, DecodingState, LiveRef, NarrowRef};
pub use config::{ArchiveConfig, RegionConfig};
pub use dump::{DumpOutput, DumpSession};
pub use error::{ArchiveError, Result};
pub use header::{ArchiveHeader, PAGE_SIZE};
pub use heap::{FieldKind, Heap, HeapSource, ObjId, Slot, TypeBuilder, TypeKey};
pub use image::{ArchiveImage, ArchiveLayout};
pub use loader::{FieldValue, InitOutcome, LoadSession, StaticFieldStore, TypeInitializer};
pub use region::RegionKind;
pub use registry::{RootRegistry, RootSpec};
pub use stats::DumpStats;
pub use subgraph::{CompiledSubgraphTable, SubgraphTable};
