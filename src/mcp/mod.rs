//! Message correlation and dispatch engine
//!
//! Wire codec, correlation table, handler registry and the per-connection dispatch loop shared
//! by the client and server facades.

pub mod codec;
pub mod connection;
pub mod correlation;
pub mod dispatch;
pub mod registry;
pub mod rpc;
