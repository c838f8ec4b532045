//! Error types for the three concerns that can fail: command validation,
//! startup configuration, and the consensus core itself (persistence + wire).

use std::io;

/// Errors raised while validating or applying a client command against the
/// key-value store (see `kv::Command`).
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("invalid command, bad request")]
    UnknownOperation,

    #[error("need a key for GET/DELETE operation, bad request")]
    MissingKey,

    #[error("need a key and a value for SET operation, bad request")]
    MissingValue,

    #[error("not a valid integer value, bad request")]
    NotAnInteger,

    #[error("key not found")]
    KeyNotFound,

    #[error("command may not contain '#' or ';'")]
    ReservedCharacter,
}

/// Errors raised while parsing startup configuration (CLI flags, peer
/// registry file).
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required argument --{0}")]
    MissingArgument(&'static str),

    #[error("node id {0:?} is not present in the peer registry")]
    UnknownNodeId(String),

    #[error("failed to read peer registry {path}: {source}")]
    PeerRegistry {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("malformed peer registry line: {0:?}")]
    MalformedRegistryLine(String),
}

/// Errors raised by the consensus core: persistence failures (fatal to the
/// node, see SPEC_FULL.md §7) and malformed wire messages (dropped
/// per-connection, never fatal).
#[derive(Debug, thiserror::Error)]
pub enum RaftError {
    #[error("persistence failure: {0}")]
    Persistence(#[from] io::Error),

    #[error("malformed rpc message: {0:?}")]
    MalformedMessage(String),

    #[error("peer {0:?} unreachable")]
    PeerUnreachable(String),
}
