//! A small replicated key-value store built on a Raft-style consensus core.
//!
//! Module map:
//! - [`config`]: CLI flags and the peer-discovery registry.
//! - [`kv`]: client command grammar and the applied key-value state.
//! - [`log`]: the replicated log and its durable backing store.
//! - [`rpc`]: the text-framed peer RPC message model.
//! - [`server`]: the consensus core (`NodeState`, role transitions, RPC
//!   handlers, the client write path).
//! - [`transport`]: the peer-facing TCP listener.
//! - [`http`]: the client-facing HTTP/1.1 listener.
//! - [`error`]: error types shared across the above.

pub mod config;
pub mod error;
pub mod http;
pub mod kv;
pub mod log;
pub mod rpc;
pub mod server;
pub mod transport;
