//! Broadcast relay core.
//!
//! Every line a client sends is delivered to all other connected clients.
//!
//! Components, leaves first:
//! - `framing`: `\n`-delimited frame splitting across arbitrary reads
//! - `connection`: per-client read loop and send/close handle
//! - `registry`: lock-guarded map of connected clients
//! - `bus`: bounded queue from reader tasks to the broadcaster
//! - `broadcaster`: drains the bus and fans messages out
//! - `acceptor`: binds the listener and spawns reader tasks
//! - `server`: owns all of the above and drives the lifecycle

mod acceptor;
mod broadcaster;
pub mod bus;
pub mod connection;
pub mod framing;
mod registry;
mod server;

pub use server::{Server, ServerState};
