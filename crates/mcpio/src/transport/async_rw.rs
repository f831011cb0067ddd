//! Newline-delimited JSON framing over arbitrary `AsyncRead`/`AsyncWrite`
//! pairs. This is the stdio transport when given stdin/stdout.

use bytes::{BufMut, BytesMut};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Decoder, Encoder, FramedRead, FramedWrite};

use crate::{model::JsonRpcMessage, transport::Transport};

/// One JSON message per `\n`-terminated line.
///
/// A line that fails to parse is logged and skipped; framing stays intact
/// because the line boundary itself was found, so one bad frame never takes
/// the session down.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonRpcMessageCodec;

impl Decoder for JsonRpcMessageCodec {
    type Item = JsonRpcMessage;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let Some(pos) = src.iter().position(|b| *b == b'\n') else {
                return Ok(None);
            };
            let line = src.split_to(pos + 1);
            let line = &line[..line.len() - 1];
            let line = line.strip_suffix(b"\r").unwrap_or(line);
            if line.is_empty() {
                continue;
            }
            match serde_json::from_slice::<JsonRpcMessage>(line) {
                Ok(message) => return Ok(Some(message)),
                Err(error) => {
                    tracing::warn!(%error, "skipping malformed frame");
                    continue;
                }
            }
        }
    }
}

impl Encoder<JsonRpcMessage> for JsonRpcMessageCodec {
    type Error = std::io::Error;

    fn encode(&mut self, item: JsonRpcMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let payload = serde_json::to_vec(&item)?;
        dst.reserve(payload.len() + 1);
        dst.put_slice(&payload);
        dst.put_u8(b'\n');
        Ok(())
    }
}

pub struct AsyncRwTransport<R: AsyncRead, W: AsyncWrite> {
    read: FramedRead<R, JsonRpcMessageCodec>,
    write: FramedWrite<W, JsonRpcMessageCodec>,
    closed: bool,
}

impl<R, W> AsyncRwTransport<R, W>
where
    R: AsyncRead + Send + Unpin,
    W: AsyncWrite + Send + Unpin,
{
    pub fn new(read: R, write: W) -> Self {
        Self {
            read: FramedRead::new(read, JsonRpcMessageCodec),
            write: FramedWrite::new(write, JsonRpcMessageCodec),
            closed: false,
        }
    }
}

impl<R, W> Transport for AsyncRwTransport<R, W>
where
    R: AsyncRead + Send + Unpin,
    W: AsyncWrite + Send + Unpin,
{
    type Error = std::io::Error;

    async fn send(&mut self, item: JsonRpcMessage) -> Result<(), Self::Error> {
        if self.closed {
            return Err(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "transport closed",
            ));
        }
        self.write.send(item).await
    }

    async fn receive(&mut self) -> Option<JsonRpcMessage> {
        if self.closed {
            return None;
        }
        match self.read.next().await {
            Some(Ok(message)) => Some(message),
            Some(Err(error)) => {
                tracing::error!(%error, "read error, closing");
                self.closed = true;
                None
            }
            None => {
                self.closed = true;
                None
            }
        }
    }

    async fn close(&mut self) -> Result<(), Self::Error> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.write.close().await
    }
}

/// Standard input/output transport, the usual binding for a spawned server.
pub fn stdio() -> AsyncRwTransport<tokio::io::Stdin, tokio::io::Stdout> {
    AsyncRwTransport::new(tokio::io::stdin(), tokio::io::stdout())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::RequestId;

    #[test]
    fn decodes_complete_lines_only() {
        let mut codec = JsonRpcMessageCodec;
        let mut buf = BytesMut::from(
            &br#"{"jsonrpc":"2.0","id":1,"method":"ping"}
{"jsonrpc":"2.0","id":2,"met"#[..],
        );
        let first = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(first.request_id(), Some(&RequestId::Number(1)));
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.put_slice(b"hod\":\"ping\"}\n");
        let second = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(second.request_id(), Some(&RequestId::Number(2)));
    }

    #[test]
    fn malformed_line_is_skipped() {
        let mut codec = JsonRpcMessageCodec;
        let mut buf = BytesMut::from(
            &b"this is not json\n{\"jsonrpc\":\"2.0\",\"id\":7,\"method\":\"ping\"}\n"[..],
        );
        let message = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(message.request_id(), Some(&RequestId::Number(7)));
    }

    #[test]
    fn blank_and_crlf_lines_are_tolerated() {
        let mut codec = JsonRpcMessageCodec;
        let mut buf =
            BytesMut::from(&b"\r\n\n{\"jsonrpc\":\"2.0\",\"method\":\"notifications/initialized\"}\r\n"[..]);
        let message = codec.decode(&mut buf).unwrap().unwrap();
        assert!(message.request_id().is_none());
    }

    #[tokio::test]
    async fn transport_round_trip_over_duplex() {
        let (a, b) = tokio::io::duplex(1024);
        let (ar, aw) = tokio::io::split(a);
        let (br, bw) = tokio::io::split(b);
        let mut left = AsyncRwTransport::new(ar, aw);
        let mut right = AsyncRwTransport::new(br, bw);

        left.send(JsonRpcMessage::request(RequestId::Number(1), "ping", None))
            .await
            .unwrap();
        let received = right.receive().await.unwrap();
        assert_eq!(received.request_id(), Some(&RequestId::Number(1)));

        left.close().await.unwrap();
        left.close().await.unwrap();
        assert!(left
            .send(JsonRpcMessage::notification("after/close", None))
            .await
            .is_err());
    }
}
