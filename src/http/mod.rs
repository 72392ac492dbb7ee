//! HTTP surface of the server
//!
//! Metadata endpoints and the WebSocket upgrade route that feeds the connection engine.

pub mod handlers;
