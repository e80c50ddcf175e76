//! This module exports a minimal message-passing API, which is encapsulated
//! by a `Communicator` trait. Implementors only need to write `send` and
//! `recv` operations for a given transport layer (a pure-Rust TCP transport
//! and an in-process channel transport are included). The trait then
//! provides default implementations for pairwise exchange, broadcast,
//! reduce, and reduce-all operations.
//!

mod backoff;
pub mod channel;
pub mod comm;
pub mod tcp;
pub mod util;
