//! Transport seams between a connection and its socket.
//!
//! A connection runs one reader task and one writer task; each owns half of
//! the underlying stream behind these traits. TCP reads arrive as raw byte
//! chunks that still need frame extraction; WebSocket reads arrive already
//! message-delimited.

use std::io;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf},
    net::TcpStream,
};
use tokio_tungstenite::{WebSocketStream, tungstenite};

/// Reading half of a connection's transport.
#[async_trait]
pub(crate) trait TransportReader: Send {
    /// Read the next chunk, up to `max` bytes for byte-stream transports.
    ///
    /// An empty chunk signals end of stream.
    async fn read_chunk(&mut self, max: usize) -> io::Result<Bytes>;

    /// Whether chunks are already whole application frames.
    fn message_delimited(&self) -> bool { false }
}

/// Writing half of a connection's transport.
#[async_trait]
pub(crate) trait TransportWriter: Send {
    /// Write one packed frame.
    async fn write_frame(&mut self, frame: Bytes) -> io::Result<()>;

    /// Flush and close the stream.
    async fn shutdown(&mut self);
}

/// Split a TCP stream into boxed transport halves.
pub(crate) fn split_tcp(
    stream: TcpStream,
) -> (Box<dyn TransportReader>, Box<dyn TransportWriter>) {
    let (read, write) = tokio::io::split(stream);
    (Box::new(TcpReader(read)), Box::new(TcpWriter(write)))
}

struct TcpReader(ReadHalf<TcpStream>);

#[async_trait]
impl TransportReader for TcpReader {
    async fn read_chunk(&mut self, max: usize) -> io::Result<Bytes> {
        let mut buf = BytesMut::with_capacity(max);
        self.0.read_buf(&mut buf).await?;
        Ok(buf.freeze())
    }
}

struct TcpWriter(WriteHalf<TcpStream>);

#[async_trait]
impl TransportWriter for TcpWriter {
    async fn write_frame(&mut self, frame: Bytes) -> io::Result<()> {
        self.0.write_all(&frame).await
    }

    async fn shutdown(&mut self) {
        let _ = self.0.shutdown().await;
    }
}

/// Split an accepted WebSocket stream into boxed transport halves.
pub(crate) fn split_websocket<S>(
    stream: WebSocketStream<S>,
) -> (Box<dyn TransportReader>, Box<dyn TransportWriter>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (sink, stream) = stream.split();
    (Box::new(WsReader(stream)), Box::new(WsWriter(sink)))
}

struct WsReader<S>(SplitStream<WebSocketStream<S>>);

#[async_trait]
impl<S> TransportReader for WsReader<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn read_chunk(&mut self, _max: usize) -> io::Result<Bytes> {
        loop {
            match self.0.next().await {
                Some(Ok(tungstenite::Message::Binary(data))) => return Ok(data),
                Some(Ok(tungstenite::Message::Text(text))) => {
                    return Ok(Bytes::from(text.as_bytes().to_vec()));
                }
                // Control frames are answered by the protocol layer.
                Some(Ok(tungstenite::Message::Ping(_) | tungstenite::Message::Pong(_))) => {}
                Some(Ok(tungstenite::Message::Close(_))) | None => return Ok(Bytes::new()),
                Some(Ok(tungstenite::Message::Frame(_))) => {
                    return Err(io::Error::other("unexpected raw websocket frame"));
                }
                Some(Err(err)) => return Err(io::Error::other(err)),
            }
        }
    }

    fn message_delimited(&self) -> bool { true }
}

struct WsWriter<S>(SplitSink<WebSocketStream<S>, tungstenite::Message>);

#[async_trait]
impl<S> TransportWriter for WsWriter<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn write_frame(&mut self, frame: Bytes) -> io::Result<()> {
        self.0
            .send(tungstenite::Message::binary(frame))
            .await
            .map_err(io::Error::other)
    }

    async fn shutdown(&mut self) {
        let _ = self.0.close().await;
    }
}

/// Split any duplex byte stream; used by in-process tests.
#[cfg(test)]
pub(crate) fn split_duplex(
    stream: tokio::io::DuplexStream,
) -> (Box<dyn TransportReader>, Box<dyn TransportWriter>) {
    struct Reader(ReadHalf<tokio::io::DuplexStream>);

    #[async_trait]
    impl TransportReader for Reader {
        async fn read_chunk(&mut self, max: usize) -> io::Result<Bytes> {
            let mut buf = BytesMut::with_capacity(max);
            self.0.read_buf(&mut buf).await?;
            Ok(buf.freeze())
        }
    }

    struct Writer(WriteHalf<tokio::io::DuplexStream>);

    #[async_trait]
    impl TransportWriter for Writer {
        async fn write_frame(&mut self, frame: Bytes) -> io::Result<()> {
            self.0.write_all(&frame).await
        }

        async fn shutdown(&mut self) {
            let _ = self.0.shutdown().await;
        }
    }

    let (read, write) = tokio::io::split(stream);
    (Box::new(Reader(read)), Box::new(Writer(write)))
}
