//! The client side of the control stream.
//!
//! One long-lived bidirectional stream per connection, opened first and
//! authenticated before anything else. Handshakes for data streams and
//! broker observation requests both travel here; data frames never do.

use iroh::Endpoint;
use iroh::endpoint::{Connection, RecvStream, SendStream};
use seam_core::{
    ALPN, Credential, Error, Frame, FrameStream, GoawayFrame, HandshakeAckFrame, HandshakeFrame,
    ObserveFrame, Tag,
};

#[allow(clippy::cast_possible_wrap)]
pub(crate) fn quic_stream_id(send: &SendStream) -> i64 {
    send.id().index() as i64
}

fn transport_err(e: impl std::error::Error + Send + Sync + 'static) -> Error {
    Error::Io(std::io::Error::other(e))
}

/// Client handle on the control stream, plus the connection it governs.
pub struct ClientControlStream {
    conn: Connection,
    stream: FrameStream<RecvStream, SendStream>,
}

impl ClientControlStream {
    /// Connect to the zipper and open the control stream.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] when the QUIC connect or stream open fails.
    pub async fn open(
        endpoint: &Endpoint,
        target: iroh::PublicKey,
    ) -> Result<Self, Error> {
        let conn = endpoint.connect(target, ALPN).await.map_err(transport_err)?;
        let (send, recv) = conn.open_bi().await.map_err(transport_err)?;
        let stream_id = quic_stream_id(&send);
        Ok(Self {
            conn,
            stream: FrameStream::new(recv, send, stream_id),
        })
    }

    /// Present the credential and wait for the server's verdict.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AuthenticateFailed`] when the server says no, and
    /// [`Error::Malformed`] when it answers with anything but an
    /// authentication ack.
    pub async fn authenticate(&mut self, credential: &Credential) -> Result<(), Error> {
        self.stream
            .write_frame(Frame::Authentication(credential.to_frame()))
            .await?;

        match self.stream.read_frame().await? {
            Frame::AuthenticationAck(ack) => {
                if ack.ok {
                    Ok(())
                } else {
                    Err(Error::AuthenticateFailed(ack.reason))
                }
            }
            other => Err(Error::malformed(format!(
                "expected authentication ack, got {}",
                other.frame_type()
            ))),
        }
    }

    /// Request a new data stream; the ack names the QUIC stream to accept.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Rejected`] when the server refuses the handshake.
    pub async fn request_stream(
        &mut self,
        handshake: HandshakeFrame,
    ) -> Result<HandshakeAckFrame, Error> {
        self.stream.write_frame(Frame::Handshake(handshake)).await?;

        match self.stream.read_frame().await? {
            Frame::HandshakeAck(ack) => Ok(ack),
            Frame::Rejected(r) => Err(Error::Rejected(r.reason)),
            Frame::Goaway(g) => {
                tracing::warn!(reason = %g.reason, "server sent goaway during handshake");
                Err(Error::StreamClosed)
            }
            other => Err(Error::malformed(format!(
                "expected handshake ack, got {}",
                other.frame_type()
            ))),
        }
    }

    /// Accept the data stream the ack refers to. The server announces it
    /// by writing the same ack as the stream's first frame, which lets us
    /// match QUIC stream ids.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Malformed`] when the accepted stream does not
    /// identify itself with the expected handshake ack.
    pub async fn accept_data_stream(
        &self,
        ack: &HandshakeAckFrame,
    ) -> Result<FrameStream<RecvStream, SendStream>, Error> {
        let (send, recv) = self.conn.accept_bi().await.map_err(transport_err)?;
        let stream_id = quic_stream_id(&send);
        let mut stream = FrameStream::new(recv, send, stream_id);

        match stream.read_frame().await? {
            Frame::HandshakeAck(announced) if announced.id == ack.id => {
                if stream_id != ack.stream_id {
                    tracing::warn!(
                        expected = ack.stream_id,
                        actual = stream_id,
                        "data stream id differs from handshake ack"
                    );
                }
                Ok(stream)
            }
            other => Err(Error::malformed(format!(
                "expected handshake ack announcing data stream, got {}",
                other.frame_type()
            ))),
        }
    }

    /// Ask the broker for the next uni-stream tagged `tag`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] when the control stream write fails.
    pub async fn observe(&mut self, tag: Tag) -> Result<(), Error> {
        self.stream
            .write_frame(Frame::Observe(ObserveFrame { tag }))
            .await
    }

    /// Announce departure and FIN the write direction.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] when the final write fails.
    pub async fn close(&mut self, reason: &str) -> Result<(), Error> {
        self.stream
            .write_frame(Frame::Goaway(GoawayFrame {
                reason: reason.to_string(),
            }))
            .await?;
        self.stream.close().await
    }

    /// The QUIC connection this control stream governs.
    #[must_use]
    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    #[must_use]
    pub fn stream_id(&self) -> i64 {
        self.stream.stream_id()
    }
}
