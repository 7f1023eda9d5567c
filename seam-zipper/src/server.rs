//! Server-side connection handling: the control-stream state machine,
//! data-stream sessions, and tag routing between endpoints.

use std::sync::Arc;

use error_stack::{Report, ResultExt};
use iroh::endpoint::{Connection, Incoming, RecvStream, SendStream};
use seam_core::{
    ALPN, AuthenticationAckFrame, Authenticator, BackflowFrame, ClientType, CloseStreamFrame,
    DataFrame, Error, Frame, FrameReader, FrameStream, FrameWriter, HandshakeAckFrame,
    HandshakeFrame, Metadata, RejectedFrame, auth, new_id,
};
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use crate::broker::{Broker, default_drain};
use crate::metrics::SharedMetrics;
use crate::registry::{EndpointEntry, EndpointRegistry};

/// Frames queued towards one endpoint's data stream.
const ENDPOINT_QUEUE_CAP: usize = 64;

#[derive(Debug)]
pub struct ServeError;

impl std::fmt::Display for ServeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("failed to serve connection")
    }
}

impl std::error::Error for ServeError {}

pub type ZipperBroker = Broker<Connection>;

#[allow(clippy::cast_possible_wrap)]
fn quic_stream_id(send: &SendStream) -> i64 {
    send.id().index() as i64
}

/// Shared state of one zipper instance.
#[derive(Clone)]
pub struct Zipper {
    registry: EndpointRegistry,
    broker: Arc<ZipperBroker>,
    authenticators: Arc<Vec<Box<dyn Authenticator>>>,
    metrics: SharedMetrics,
}

impl Zipper {
    #[must_use]
    pub fn new(authenticators: Vec<Box<dyn Authenticator>>, metrics: SharedMetrics) -> Self {
        let broker = Arc::new(Broker::new(default_drain(), metrics.clone()));
        Self {
            registry: EndpointRegistry::new(),
            broker,
            authenticators: Arc::new(authenticators),
            metrics,
        }
    }

    #[must_use]
    pub fn registry(&self) -> &EndpointRegistry {
        &self.registry
    }

    #[must_use]
    pub fn metrics(&self) -> &SharedMetrics {
        &self.metrics
    }

    pub fn close(&self) {
        self.broker.close();
    }
}

/// Serve one incoming QUIC connection: authenticate the control stream,
/// then answer handshakes and observation requests until it ends.
///
/// # Errors
///
/// Returns [`ServeError`] when the connection cannot be established or
/// authentication fails.
#[instrument(skip_all, name = "accept_connection")]
pub async fn accept_connection(incoming: Incoming, zipper: Zipper) -> Result<(), Report<ServeError>> {
    let conn = incoming
        .accept()
        .change_context(ServeError)?
        .await
        .change_context(ServeError)?;

    let alpn = conn.alpn();
    if alpn != ALPN {
        warn!(?alpn, "unexpected ALPN, closing connection");
        return Err(Report::new(ServeError).attach("unexpected ALPN"));
    }
    debug!(remote_id = ?conn.remote_id(), "accepted connection");

    // The control stream is the first bidirectional stream the client opens.
    let (send, recv) = conn.accept_bi().await.change_context(ServeError)?;
    let stream_id = quic_stream_id(&send);
    let mut control = FrameStream::new(recv, send, stream_id);

    // INIT -> AUTHENTICATING: the first frame must present a credential.
    let first = control
        .read_frame()
        .await
        .map_err(Report::new)
        .change_context(ServeError)?;
    let Frame::Authentication(credential) = first else {
        let _ = control
            .write_frame(Frame::AuthenticationAck(AuthenticationAckFrame {
                ok: false,
                reason: "authentication required".into(),
            }))
            .await;
        return Err(Report::new(ServeError).attach("control stream opened without credential"));
    };

    if !auth::authenticate(&zipper.authenticators, &credential) {
        warn!(auth_name = %credential.auth_name, "authentication failed");
        let _ = control
            .write_frame(Frame::AuthenticationAck(AuthenticationAckFrame {
                ok: false,
                reason: "invalid credential".into(),
            }))
            .await;
        return Err(Report::new(ServeError).attach("authentication failed"));
    }

    control
        .write_frame(Frame::AuthenticationAck(AuthenticationAckFrame {
            ok: true,
            reason: String::new(),
        }))
        .await
        .map_err(Report::new)
        .change_context(ServeError)?;

    zipper.metrics.metrics.connections_opened_total.inc();

    // Brokered uni-streams from this peer are accepted for the whole
    // connection lifetime.
    let accepting = tokio::spawn({
        let broker = zipper.broker.clone();
        let conn = conn.clone();
        async move {
            broker.accepting_stream(conn).await;
        }
    });

    // Observer identity for the broker; stable per connection, replaced by
    // the client id once a handshake names one.
    let mut observer_id = new_id();

    // AUTHENTICATING -> OPEN: handshakes, observations, and goaway.
    let mut sessions: Vec<(String, u64)> = Vec::new();
    loop {
        match control.read_frame().await {
            Ok(Frame::Handshake(handshake)) => {
                observer_id.clone_from(&handshake.client_id);
                match open_endpoint(&conn, &zipper, handshake).await {
                    Ok(ack) => {
                        zipper.metrics.metrics.handshakes_total.inc();
                        sessions.push((ack.0.client_id.clone(), ack.1));
                        control
                            .write_frame(Frame::HandshakeAck(ack.0))
                            .await
                            .map_err(Report::new)
                            .change_context(ServeError)?;
                    }
                    Err(reason) => {
                        zipper.metrics.metrics.handshakes_rejected_total.inc();
                        warn!(%reason, "handshake rejected");
                        control
                            .write_frame(Frame::Rejected(RejectedFrame { reason }))
                            .await
                            .map_err(Report::new)
                            .change_context(ServeError)?;
                    }
                }
            }
            Ok(Frame::Observe(observe)) => {
                zipper
                    .broker
                    .observe(observe.tag, &observer_id, conn.clone())
                    .await;
            }
            Ok(Frame::Data(_)) => {
                // The control stream is not a data path.
                control
                    .write_frame(Frame::Rejected(RejectedFrame {
                        reason: "handshake required".into(),
                    }))
                    .await
                    .map_err(Report::new)
                    .change_context(ServeError)?;
            }
            Ok(Frame::Goaway(goaway)) => {
                debug!(reason = %goaway.reason, "client sent goaway");
                break;
            }
            Ok(other) => {
                warn!(frame_type = %other.frame_type(), "unexpected frame on control stream");
            }
            Err(Error::StreamClosed) => {
                debug!("control stream closed");
                break;
            }
            Err(e) => {
                debug!(err = %e, "control stream error");
                break;
            }
        }
    }

    for (client_id, session) in sessions {
        zipper.registry.remove(&client_id, session);
    }
    accepting.abort();
    zipper.metrics.metrics.connections_closed_total.inc();
    Ok(())
}

struct SessionInfo {
    client_id: String,
    client_type: ClientType,
    session: u64,
}

/// Open a data stream for an accepted handshake and start its session.
/// Returns the ack to relay on the control stream.
async fn open_endpoint(
    conn: &Connection,
    zipper: &Zipper,
    handshake: HandshakeFrame,
) -> Result<(HandshakeAckFrame, u64), String> {
    let Some(client_type) = ClientType::from_u8(handshake.client_type) else {
        return Err("invalid client type".into());
    };

    let (send, recv) = conn
        .open_bi()
        .await
        .map_err(|e| format!("failed to open data stream: {e}"))?;
    let stream_id = quic_stream_id(&send);
    let mut data_stream = FrameStream::new(recv, send, stream_id);

    let ack = HandshakeAckFrame {
        id: handshake.id.clone(),
        client_id: handshake.client_id.clone(),
        stream_id,
    };

    // The ack is also the first frame of the new stream, both announcing
    // it to the peer and letting it match QUIC stream ids.
    data_stream
        .write_frame(Frame::HandshakeAck(ack.clone()))
        .await
        .map_err(|e| format!("failed to announce data stream: {e}"))?;

    let session = zipper.registry.next_session();
    let (frame_tx, frame_rx) = mpsc::channel(ENDPOINT_QUEUE_CAP);
    let entry = EndpointEntry {
        client_id: handshake.client_id.clone(),
        name: handshake.name.clone(),
        client_type,
        observe_data_tags: handshake.observe_data_tags.clone(),
        stream_id,
        frame_tx,
        session,
    };

    let replaced = zipper
        .registry
        .register(entry)
        .map_err(|e| e.to_string())?;
    if let Some(old) = replaced {
        debug!(client_id = %old.client_id, "handshake replaces a live data stream");
        let _ = old
            .frame_tx
            .send(Frame::CloseStream(CloseStreamFrame {
                stream_id: old.stream_id,
                reason: "replaced by new handshake".into(),
            }))
            .await;
    }

    info!(
        name = %handshake.name,
        client_id = %handshake.client_id,
        %client_type,
        stream_id,
        observed = ?handshake.observe_data_tags,
        "endpoint connected"
    );

    let info = SessionInfo {
        client_id: handshake.client_id,
        client_type,
        session,
    };
    tokio::spawn(endpoint_session(
        zipper.clone(),
        info,
        data_stream,
        frame_rx,
    ));

    Ok((ack, session))
}

/// Pump one endpoint's data stream: outbound frames from the routing
/// queue, inbound data frames into the router.
#[instrument(skip_all, name = "endpoint_session", fields(client_id = %info.client_id))]
async fn endpoint_session(
    zipper: Zipper,
    info: SessionInfo,
    data_stream: FrameStream<RecvStream, SendStream>,
    frame_rx: mpsc::Receiver<Frame>,
) {
    let (reader, writer) = data_stream.split();

    let writer_task = tokio::spawn(write_pump(writer, frame_rx));
    read_pump(&zipper, &info, reader).await;

    zipper.registry.remove(&info.client_id, info.session);
    writer_task.abort();
    debug!("endpoint session closed");
}

async fn write_pump(mut writer: FrameWriter<SendStream>, mut frame_rx: mpsc::Receiver<Frame>) {
    while let Some(frame) = frame_rx.recv().await {
        let closing = matches!(frame, Frame::CloseStream(_));
        if let Err(e) = writer.write_frame(frame).await {
            debug!(err = %e, "failed to write frame to endpoint");
            return;
        }
        if closing {
            let _ = writer.close().await;
            return;
        }
    }
}

async fn read_pump(zipper: &Zipper, info: &SessionInfo, mut reader: FrameReader<RecvStream>) {
    loop {
        match reader.read_frame().await {
            Ok(Frame::Data(frame)) => {
                if let Err(e) = route(zipper, info, frame).await {
                    // Malformed frames close the affected stream.
                    warn!(err = %e, "dropping endpoint after routing error");
                    return;
                }
            }
            Ok(Frame::CloseStream(close)) => {
                debug!(reason = %close.reason, "endpoint closed its data stream");
                return;
            }
            Ok(other) => {
                warn!(frame_type = %other.frame_type(), "unexpected frame on data stream");
            }
            Err(Error::StreamClosed) => {
                debug!("endpoint finished its data stream");
                return;
            }
            Err(e) => {
                debug!(err = %e, "data stream error");
                return;
            }
        }
    }
}

/// Deliver one data frame: to every matching observer when broadcast, to
/// the first otherwise, plus a backflow copy to the originating source
/// when a stream function emitted it.
async fn route(zipper: &Zipper, from: &SessionInfo, frame: DataFrame) -> Result<(), Error> {
    let metadata = Metadata::decode(&frame.metadata)?;
    zipper.metrics.metrics.frames_routed_total.inc();

    if from.client_type == ClientType::StreamFunction {
        let source_id = metadata.source_id();
        if !source_id.is_empty()
            && let Some(source) = zipper.registry.source_by_id(source_id)
        {
            zipper.metrics.metrics.backflow_frames_total.inc();
            let backflow = Frame::Backflow(BackflowFrame {
                tag: frame.tag,
                carriage: frame.payload.clone(),
            });
            if source.frame_tx.send(backflow).await.is_err() {
                debug!(%source_id, "backflow target is gone");
            }
        }
    }

    let observers = zipper.registry.observers_of(frame.tag, &from.client_id);
    if observers.is_empty() {
        debug!(tag = frame.tag, "no observer for tag");
        return Ok(());
    }

    if frame.broadcast {
        for observer in observers {
            if observer
                .frame_tx
                .send(Frame::Data(frame.clone()))
                .await
                .is_err()
            {
                debug!(client_id = %observer.client_id, "observer is gone");
            }
        }
    } else if let Some(observer) = observers.first() {
        if observer
            .frame_tx
            .send(Frame::Data(frame))
            .await
            .is_err()
        {
            debug!(client_id = %observer.client_id, "observer is gone");
        }
    }

    Ok(())
}
