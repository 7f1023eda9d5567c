//! Length-prefixed framed I/O over a single QUIC stream.

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::codec::FrameCodec;
use crate::error::Error;
use crate::frame::Frame;

/// Read half of a frame stream.
pub struct FrameReader<R> {
    inner: FramedRead<R, FrameCodec>,
    stream_id: i64,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    #[must_use]
    pub fn new(recv: R, stream_id: i64) -> Self {
        Self {
            inner: FramedRead::new(recv, FrameCodec::new()),
            stream_id,
        }
    }

    /// Read the next frame. A clean FIN surfaces as [`Error::StreamClosed`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::Malformed`] for undecodable bytes and [`Error::Io`]
    /// for transport failures.
    pub async fn read_frame(&mut self) -> Result<Frame, Error> {
        match self.inner.next().await {
            Some(Ok(frame)) => Ok(frame),
            Some(Err(e)) => {
                if e.kind() == std::io::ErrorKind::InvalidData {
                    Err(Error::malformed(e.to_string()))
                } else {
                    Err(e.into())
                }
            }
            None => Err(Error::StreamClosed),
        }
    }

    #[must_use]
    pub fn stream_id(&self) -> i64 {
        self.stream_id
    }
}

/// Write half of a frame stream.
pub struct FrameWriter<W> {
    inner: FramedWrite<W, FrameCodec>,
    stream_id: i64,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    #[must_use]
    pub fn new(send: W, stream_id: i64) -> Self {
        Self {
            inner: FramedWrite::new(send, FrameCodec::new()),
            stream_id,
        }
    }

    /// # Errors
    ///
    /// Returns [`Error::Io`] when the transport write fails.
    pub async fn write_frame(&mut self, frame: Frame) -> Result<(), Error> {
        self.inner.send(frame).await.map_err(Error::from)
    }

    /// Graceful FIN of the write direction.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] when the close handshake fails.
    pub async fn close(&mut self) -> Result<(), Error> {
        self.inner.close().await.map_err(Error::from)
    }

    #[must_use]
    pub fn stream_id(&self) -> i64 {
        self.stream_id
    }
}

/// A bidirectional QUIC stream speaking whole frames in both directions.
/// Both directions close independently.
pub struct FrameStream<R, W> {
    reader: FrameReader<R>,
    writer: FrameWriter<W>,
}

impl<R: AsyncRead + Unpin, W: AsyncWrite + Unpin> FrameStream<R, W> {
    #[must_use]
    pub fn new(recv: R, send: W, stream_id: i64) -> Self {
        Self {
            reader: FrameReader::new(recv, stream_id),
            writer: FrameWriter::new(send, stream_id),
        }
    }

    /// # Errors
    ///
    /// See [`FrameReader::read_frame`].
    pub async fn read_frame(&mut self) -> Result<Frame, Error> {
        self.reader.read_frame().await
    }

    /// # Errors
    ///
    /// See [`FrameWriter::write_frame`].
    pub async fn write_frame(&mut self, frame: Frame) -> Result<(), Error> {
        self.writer.write_frame(frame).await
    }

    /// # Errors
    ///
    /// See [`FrameWriter::close`].
    pub async fn close(&mut self) -> Result<(), Error> {
        self.writer.close().await
    }

    /// The underlying QUIC stream id, for logging and handshake acks.
    #[must_use]
    pub fn stream_id(&self) -> i64 {
        self.reader.stream_id()
    }

    /// Split into independently owned halves, one per pump.
    #[must_use]
    pub fn split(self) -> (FrameReader<R>, FrameWriter<W>) {
        (self.reader, self.writer)
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::frame::{DataFrame, GoawayFrame};

    #[tokio::test]
    async fn frames_cross_a_duplex_pipe() {
        let (client, server) = tokio::io::duplex(4096);
        let (client_read, client_write) = tokio::io::split(client);
        let (server_read, server_write) = tokio::io::split(server);

        let mut client_stream = FrameStream::new(client_read, client_write, 0);
        let mut server_stream = FrameStream::new(server_read, server_write, 0);

        let frame = Frame::Data(DataFrame {
            tag: 0x21,
            metadata: Bytes::new(),
            payload: Bytes::from_static(b"test"),
            streamed: false,
            broadcast: false,
        });
        client_stream.write_frame(frame.clone()).await.unwrap();
        assert_eq!(server_stream.read_frame().await.unwrap(), frame);

        let reply = Frame::Goaway(GoawayFrame {
            reason: "done".into(),
        });
        server_stream.write_frame(reply.clone()).await.unwrap();
        assert_eq!(client_stream.read_frame().await.unwrap(), reply);
    }

    #[tokio::test]
    async fn fin_reads_as_stream_closed() {
        let (client, server) = tokio::io::duplex(4096);
        let (server_read, _server_write) = tokio::io::split(server);
        let mut server_stream = FrameReader::new(server_read, 4);
        assert_eq!(server_stream.stream_id(), 4);

        drop(client);
        assert!(matches!(
            server_stream.read_frame().await,
            Err(Error::StreamClosed)
        ));
    }

    #[tokio::test]
    async fn write_order_is_preserved() {
        let (client, server) = tokio::io::duplex(64);
        let (_client_read, client_write) = tokio::io::split(client);
        let (server_read, _server_write) = tokio::io::split(server);

        let mut writer = FrameWriter::new(client_write, 0);
        let mut reader = FrameReader::new(server_read, 0);

        let writes = tokio::spawn(async move {
            for i in 0..32u32 {
                let frame = Frame::Data(DataFrame {
                    tag: i,
                    payload: Bytes::from(vec![0u8; 128]),
                    ..DataFrame::default()
                });
                writer.write_frame(frame).await.unwrap();
            }
        });

        for i in 0..32u32 {
            let Frame::Data(frame) = reader.read_frame().await.unwrap() else {
                panic!("expected data frame");
            };
            assert_eq!(frame.tag, i);
        }
        writes.await.unwrap();
    }
}
