//! Framed message channels over the two transports.
//!
//! One JSON object per line on either a TCP stream (daemon to daemon)
//! or a unix stream (client to daemon). The protocol only ever
//! exchanges small control messages, so a modest line cap protects the
//! decoder from a misbehaving peer.

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, UnixStream};
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};

use crate::messages::Message;

pub const MAX_LINE_BYTES: usize = 64 * 1024;

type BoxedRead = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWrite = Box<dyn AsyncWrite + Send + Unpin>;

/// A bidirectional message channel to a local client or a remote
/// daemon. Owned by exactly one Session Context.
pub struct Channel {
    reader: FramedRead<BoxedRead, LinesCodec>,
    writer: FramedWrite<BoxedWrite, LinesCodec>,
}

impl Channel {
    fn from_parts(reader: BoxedRead, writer: BoxedWrite) -> Self {
        Channel {
            reader: FramedRead::new(reader, LinesCodec::new_with_max_length(MAX_LINE_BYTES)),
            writer: FramedWrite::new(writer, LinesCodec::new_with_max_length(MAX_LINE_BYTES)),
        }
    }

    pub fn tcp(stream: TcpStream) -> Self {
        let (reader, writer) = stream.into_split();
        Self::from_parts(Box::new(reader), Box::new(writer))
    }

    pub fn unix(stream: UnixStream) -> Self {
        let (reader, writer) = stream.into_split();
        Self::from_parts(Box::new(reader), Box::new(writer))
    }

    /// Connected in-memory channel pair.
    #[cfg(test)]
    pub fn pair() -> (Self, Self) {
        let (a, b) = tokio::io::duplex(MAX_LINE_BYTES);
        let (ar, aw) = tokio::io::split(a);
        let (br, bw) = tokio::io::split(b);
        (
            Self::from_parts(Box::new(ar), Box::new(aw)),
            Self::from_parts(Box::new(br), Box::new(bw)),
        )
    }

    pub async fn send(&mut self, message: &Message) -> Result<()> {
        let line = serde_json::to_string(message).context("failed to encode message")?;
        self.writer
            .send(line)
            .await
            .context("failed to send message")
    }

    /// Next full message, or `None` once the peer has closed the
    /// channel.
    pub async fn recv(&mut self) -> Result<Option<Message>> {
        match self.reader.next().await {
            None => Ok(None),
            Some(line) => {
                let line = line.context("failed to read message")?;
                let message =
                    serde_json::from_str(&line).context("failed to decode message")?;
                Ok(Some(message))
            }
        }
    }

    /// Flush and shut down the write half. The peer observes a clean
    /// end of stream.
    pub async fn close(&mut self) {
        let _ = SinkExt::<String>::close(&mut self.writer).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{ActionCode, ErrorCode};

    #[tokio::test]
    async fn test_send_and_recv_over_pair() {
        let (mut a, mut b) = Channel::pair();
        a.send(&Message::info("hello")).await.unwrap();
        let got = b.recv().await.unwrap().unwrap();
        assert_eq!(got.code, Some(ActionCode::Info));
        assert_eq!(got.message.as_deref(), Some("hello"));
    }

    #[tokio::test]
    async fn test_recv_returns_none_after_close() {
        let (mut a, mut b) = Channel::pair();
        a.send(&Message::error(ErrorCode::Generic, "boom"))
            .await
            .unwrap();
        a.close().await;
        assert!(b.recv().await.unwrap().is_some());
        assert!(b.recv().await.unwrap().is_none());
    }
}
