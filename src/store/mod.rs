//! Minimal client for the coordination store.
//!
//! The store is a request/reply key-value server speaking a pipelinable,
//! length-prefixed text protocol (lists, hashes and expiring keys). Only the
//! small command set the job queue needs is wrapped in typed helpers; any
//! other command can be sent through [`StoreClient::issue`].
//!
//! - [`codec`]: command encoding and reply decoding
//! - [`client`]: the persistent connection, pipelining and error taxonomy

pub mod client;
pub mod codec;

pub use client::{Reply, StoreClient, StoreConfig};
pub use codec::{Arg, Value};
