use crate::core::region::RegionKind;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("Invalid magic number in archive header")]
    InvalidMagic,

    #[error("Unsupported archive format version: {major}.{minor}")]
    UnsupportedVersion { major: u16, minor: u16 },

    #[error("Invalid archive header: {0}")]
    InvalidHeader(String),

    #[error("Unknown type: {0}")]
    UnknownType(String),

    #[error("Unknown static field {field} in type {type_name}")]
    UnknownField { type_name: String, field: String },

    #[error("Static field {type_name}.{field} does not hold a reference")]
    NotAReferenceField { type_name: String, field: String },

    #[error("Unknown object: {0}")]
    UnknownObject(u32),

    #[error("Object shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("Out of space in {kind} region: need {requested} bytes, capacity is {capacity}")]
    RegionOverflow {
        kind: RegionKind,
        requested: usize,
        capacity: usize,
    },

    #[error("Address {addr:#x} cannot be encoded against base {base:#x} with shift {shift}")]
    EncodeOutOfRange { addr: u64, base: u64, shift: u32 },

    #[error("External object index {0} exceeds the encodable range")]
    ExternalIndexOutOfRange(u32),

    #[error("Subgraph table overflow: {0}")]
    TableOverflow(String),

    #[error("Relocation bitmap length mismatch: expected {expected} bytes, found {actual}")]
    BitmapLengthMismatch { expected: usize, actual: usize },

    #[error("Decoded address {0:#x} lies outside every mapped region")]
    DecodeOutOfRange(u64),

    #[error("Corrupt {kind} region: {reason}")]
    CorruptRegion { kind: RegionKind, reason: String },

    #[error("Corrupt subgraph table: {0}")]
    CorruptTable(String),

    #[error("Checksum verification failed for {0}")]
    ChecksumMismatch(&'static str),

    #[error("Archive decoding has not been initialized")]
    DecodingNotInitialized,

    #[error("Archive decoding was already initialized")]
    DecodingAlreadyInitialized,

    #[error("The {0} region was already relocated")]
    AlreadyRelocated(RegionKind),

    #[error("The {0} region is not mapped")]
    RegionNotMapped(RegionKind),

    #[error("Archived objects cannot be read before the mapped regions are relocated")]
    NotRelocated,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Configuration parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ArchiveError {
    pub(crate) fn corrupt(kind: RegionKind, reason: impl Into<String>) -> Self {
        ArchiveError::CorruptRegion {
            kind,
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ArchiveError>;
