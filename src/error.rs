use std::io;

/// Single error currency for the crate. Public tier APIs collapse this into
/// `Option`/`bool` at the boundary (see module docs on `memory`, `disk`,
/// `kv_storage`); callers that need the reason reach for the lower-level
/// `KvStorage`/`DiskCache` methods that return `Result<_, CacheError>` directly.
#[derive(thiserror::Error, Debug)]
pub enum CacheError {
    #[error("key not found")]
    NotFound,

    #[error("I/O failure: {source}")]
    Io {
        #[from]
        source: io::Error,
    },

    #[error("metadata index failure: {source}")]
    Index {
        #[from]
        source: anyhow::Error,
    },

    #[error("serialization failure: {source}")]
    Serialization {
        #[from]
        source: rmp_serde::encode::Error,
    },

    #[error("deserialization failure: {source}")]
    Deserialization {
        #[from]
        source: rmp_serde::decode::Error,
    },

    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("another live cache instance is already open at this path")]
    AlreadyOpen,
}

pub type Result<T> = std::result::Result<T, CacheError>;
