use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::errors::RpcError;
use crate::transport::{Channel, FrameSink, FrameStream};

/// One end of an in-process duplex pipe.
#[derive(Debug)]
pub struct MemoryChannel {
    sink: MemorySink,
    stream: MemoryStream,
}

impl MemoryChannel {
    pub fn pair() -> (Self, Self) {
        let (left_tx, left_rx) = mpsc::unbounded_channel();
        let (right_tx, right_rx) = mpsc::unbounded_channel();

        (
            Self {
                sink: MemorySink { tx: Some(left_tx) },
                stream: MemoryStream { rx: right_rx },
            },
            Self {
                sink: MemorySink { tx: Some(right_tx) },
                stream: MemoryStream { rx: left_rx },
            },
        )
    }
}

impl Channel for MemoryChannel {
    type Sink = MemorySink;
    type Stream = MemoryStream;

    fn split(self) -> (Self::Sink, Self::Stream) {
        (self.sink, self.stream)
    }
}

#[derive(Debug)]
pub struct MemorySink {
    tx: Option<mpsc::UnboundedSender<Vec<u8>>>,
}

#[async_trait]
impl FrameSink for MemorySink {
    async fn send_frame(&mut self, frame: Vec<u8>) -> Result<(), RpcError> {
        let tx = self.tx.as_ref().ok_or(RpcError::ConnectionClosed)?;
        tx.send(frame).map_err(|_| RpcError::ConnectionClosed)
    }

    async fn close(&mut self) -> Result<(), RpcError> {
        // Dropping the sender ends the peer's stream.
        self.tx.take();
        Ok(())
    }
}

#[derive(Debug)]
pub struct MemoryStream {
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
}

#[async_trait]
impl FrameStream for MemoryStream {
    async fn next_frame(&mut self) -> Option<Result<Vec<u8>, RpcError>> {
        self.rx.recv().await.map(Ok)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frames_cross_in_both_directions() {
        let (left, right) = MemoryChannel::pair();
        let (mut left_sink, mut left_stream) = left.split();
        let (mut right_sink, mut right_stream) = right.split();

        left_sink.send_frame(b"ping".to_vec()).await.expect("send left");
        right_sink.send_frame(b"pong".to_vec()).await.expect("send right");

        assert_eq!(right_stream.next_frame().await.expect("frame").expect("ok"), b"ping");
        assert_eq!(left_stream.next_frame().await.expect("frame").expect("ok"), b"pong");
    }

    #[tokio::test]
    async fn close_ends_the_peer_stream() {
        let (left, right) = MemoryChannel::pair();
        let (mut left_sink, _left_stream) = left.split();
        let (_right_sink, mut right_stream) = right.split();

        left_sink.send_frame(b"last".to_vec()).await.expect("send");
        left_sink.close().await.expect("close");

        assert!(right_stream.next_frame().await.is_some());
        assert!(right_stream.next_frame().await.is_none());
        assert!(matches!(
            left_sink.send_frame(b"late".to_vec()).await,
            Err(RpcError::ConnectionClosed)
        ));
    }
}
