//! WebSocket carriers
//!
//! Adapts tokio-tungstenite client streams and axum's server-side sockets to the frame traits.
//! Text and binary messages both carry frames; control messages never reach the engine.

use std::fmt;

use async_trait::async_trait;
use axum::extract::ws::{Message as AxumMessage, WebSocket};
use futures::{
    stream::{SplitSink, SplitStream},
    Sink, SinkExt, Stream, StreamExt,
};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{self, Message as TungsteniteMessage},
    MaybeTlsStream, WebSocketStream,
};
use tracing::debug;
use url::Url;

use crate::errors::RpcError;
use crate::transport::{Channel, FrameSink, FrameStream};

pub type ClientStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Opens a client WebSocket. Only `ws` and `wss` URLs are accepted.
pub async fn connect(url: &str) -> Result<ClientStream, RpcError> {
    let url = Url::parse(url).map_err(|e| RpcError::transport(format!("invalid url: {e}")))?;
    if !matches!(url.scheme(), "ws" | "wss") {
        return Err(RpcError::transport(format!(
            "unsupported url scheme `{}`; expected ws or wss",
            url.scheme()
        )));
    }

    let (stream, response) = connect_async(url.as_str())
        .await
        .map_err(|e| RpcError::transport(format!("websocket handshake failed: {e}")))?;
    debug!(url = %url, status = %response.status(), "websocket connected");
    Ok(stream)
}

/// What an inbound WebSocket message means to the engine.
pub enum Inbound {
    Frame(Vec<u8>),
    Skip,
    Close,
}

/// Message type of a WebSocket implementation.
pub trait WireMessage: Send + Unpin + Sized + 'static {
    type Error: fmt::Display + Send + 'static;

    fn from_frame(frame: Vec<u8>) -> Self;

    fn into_inbound(self) -> Inbound;

    fn is_disconnect(err: &Self::Error) -> bool;
}

impl WireMessage for TungsteniteMessage {
    type Error = tungstenite::Error;

    fn from_frame(frame: Vec<u8>) -> Self {
        match String::from_utf8(frame) {
            Ok(text) => Self::Text(text.into()),
            Err(err) => Self::Binary(err.into_bytes().into()),
        }
    }

    fn into_inbound(self) -> Inbound {
        match self {
            Self::Text(text) => Inbound::Frame(text.as_str().as_bytes().to_vec()),
            Self::Binary(bytes) => Inbound::Frame(bytes.to_vec()),
            Self::Close(_) => Inbound::Close,
            Self::Ping(_) | Self::Pong(_) | Self::Frame(_) => Inbound::Skip,
        }
    }

    fn is_disconnect(err: &Self::Error) -> bool {
        matches!(
            err,
            tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed
        )
    }
}

impl WireMessage for AxumMessage {
    type Error = axum::Error;

    fn from_frame(frame: Vec<u8>) -> Self {
        match String::from_utf8(frame) {
            Ok(text) => Self::Text(text.into()),
            Err(err) => Self::Binary(err.into_bytes().into()),
        }
    }

    fn into_inbound(self) -> Inbound {
        match self {
            Self::Text(text) => Inbound::Frame(text.as_str().as_bytes().to_vec()),
            Self::Binary(bytes) => Inbound::Frame(bytes.to_vec()),
            Self::Close(_) => Inbound::Close,
            Self::Ping(_) | Self::Pong(_) => Inbound::Skip,
        }
    }

    fn is_disconnect(_err: &Self::Error) -> bool {
        false
    }
}

pub struct WebSocketSink<T, M> {
    inner: SplitSink<T, M>,
}

#[async_trait]
impl<T, M> FrameSink for WebSocketSink<T, M>
where
    T: Sink<M, Error = M::Error> + Send + 'static,
    M: WireMessage,
{
    async fn send_frame(&mut self, frame: Vec<u8>) -> Result<(), RpcError> {
        self.inner.send(M::from_frame(frame)).await.map_err(|e| {
            if M::is_disconnect(&e) {
                RpcError::ConnectionClosed
            } else {
                RpcError::transport(e)
            }
        })
    }

    async fn close(&mut self) -> Result<(), RpcError> {
        match self.inner.close().await {
            Ok(()) => Ok(()),
            Err(e) if M::is_disconnect(&e) => Ok(()),
            Err(e) => Err(RpcError::transport(e)),
        }
    }
}

pub struct WebSocketFrames<T> {
    inner: SplitStream<T>,
}

#[async_trait]
impl<T, M> FrameStream for WebSocketFrames<T>
where
    T: Stream<Item = Result<M, M::Error>> + Send + 'static,
    M: WireMessage,
{
    async fn next_frame(&mut self) -> Option<Result<Vec<u8>, RpcError>> {
        loop {
            match self.inner.next().await? {
                Ok(message) => match message.into_inbound() {
                    Inbound::Frame(frame) => return Some(Ok(frame)),
                    Inbound::Skip => continue,
                    Inbound::Close => return None,
                },
                Err(err) if M::is_disconnect(&err) => return None,
                Err(err) => return Some(Err(RpcError::transport(err))),
            }
        }
    }
}

impl<S> Channel for WebSocketStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    type Sink = WebSocketSink<Self, TungsteniteMessage>;
    type Stream = WebSocketFrames<Self>;

    fn split(self) -> (Self::Sink, Self::Stream) {
        let (sink, stream) = StreamExt::split(self);
        (WebSocketSink { inner: sink }, WebSocketFrames { inner: stream })
    }
}

impl Channel for WebSocket {
    type Sink = WebSocketSink<Self, AxumMessage>;
    type Stream = WebSocketFrames<Self>;

    fn split(self) -> (Self::Sink, Self::Stream) {
        let (sink, stream) = StreamExt::split(self);
        (WebSocketSink { inner: sink }, WebSocketFrames { inner: stream })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rejects_non_websocket_schemes() {
        match connect("http://127.0.0.1:1/ws").await {
            Err(err) => assert!(err.to_string().contains("unsupported url scheme `http`")),
            Ok(_) => panic!("http must be rejected"),
        }

        match connect("not a url").await {
            Err(err) => assert!(err.to_string().contains("invalid url")),
            Ok(_) => panic!("garbage must be rejected"),
        }
    }

    #[test]
    fn utf8_frames_travel_as_text() {
        assert!(matches!(
            TungsteniteMessage::from_frame(b"{}".to_vec()),
            TungsteniteMessage::Text(_)
        ));
        assert!(matches!(
            TungsteniteMessage::from_frame(vec![0xff, 0xfe]),
            TungsteniteMessage::Binary(_)
        ));
    }

    #[test]
    fn control_messages_are_skipped() {
        assert!(matches!(
            TungsteniteMessage::Ping(Vec::new().into()).into_inbound(),
            Inbound::Skip
        ));
        assert!(matches!(
            AxumMessage::Close(None).into_inbound(),
            Inbound::Close
        ));
    }
}
