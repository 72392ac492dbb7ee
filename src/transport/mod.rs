//! Frame transports
//!
//! The engine only needs an ordered, message-oriented, full-duplex channel. WebSockets are the
//! production carrier; the in-memory pair backs tests and in-process peers.

use async_trait::async_trait;

use crate::errors::RpcError;

pub mod memory;
pub mod websocket;

#[async_trait]
pub trait FrameSink: Send + 'static {
    async fn send_frame(&mut self, frame: Vec<u8>) -> Result<(), RpcError>;

    async fn close(&mut self) -> Result<(), RpcError>;
}

#[async_trait]
pub trait FrameStream: Send + 'static {
    /// Next inbound frame, or `None` once the peer has closed.
    ///
    /// Must be cancel safe: the dispatch loop races it against the shutdown signal.
    async fn next_frame(&mut self) -> Option<Result<Vec<u8>, RpcError>>;
}

pub trait Channel: Send + 'static {
    type Sink: FrameSink;
    type Stream: FrameStream;

    fn split(self) -> (Self::Sink, Self::Stream);
}
