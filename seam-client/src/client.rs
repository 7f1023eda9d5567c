//! The client engine shared by sources, stream functions, and upstream
//! zippers: connect, authenticate, handshake, pump frames, reconnect.
//!
//! Each connected engine runs three cooperating tasks: a reader pump
//! feeding decoded frames into a channel, a processor task that selects
//! over inbound frames and the write queue, and a supervisor that owns
//! reconnection. Only authentication failure, a clean EOF, and explicit
//! close are fatal; every other error is reported to the installed error
//! handler and followed by a reconnect with a fixed one-second delay.

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex as StdMutex, RwLock};
use std::time::Duration;

use error_stack::Report;
use futures::FutureExt;
use futures::future::BoxFuture;
use iroh::Endpoint;
use iroh::endpoint::SendStream;
use seam_core::{
    BackflowFrame, ClientType, Credential, DEFAULT_CHUNK_SIZE, DataFrame, Error, Frame,
    HandshakeFrame, Metadata, StreamFrame, Tag, new_id,
};
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;

use crate::control::{ClientControlStream, quic_stream_id};
use crate::options::ClientOptions;
use crate::peer::Peer;

const RECONNECT_DELAY: Duration = Duration::from_secs(1);
const WRITE_QUEUE_CAP: usize = 64;

type Processor = Arc<dyn Fn(DataFrame) -> BoxFuture<'static, ()> + Send + Sync>;
type Receiver = Arc<dyn Fn(BackflowFrame) + Send + Sync>;
type ErrorHandler = Arc<dyn Fn(&Error) + Send + Sync>;

type SharedControl = Arc<Mutex<ClientControlStream>>;

/// How one data-stream session ended, as seen by the supervisor.
enum SessionEnd {
    /// `close()` was called; shut down cleanly.
    Cancelled,
    /// The server finished the stream; the engine stops for good.
    Eof,
    /// Anything else; reconnect unless authentication failed.
    Failed(Error),
}

enum FrameOutcome {
    Continue,
    Stop(SessionEnd),
}

/// The endpoint-side state machine.
pub struct Client {
    name: String,
    client_id: String,
    client_type: ClientType,
    endpoint: Endpoint,
    credential: Credential,
    connect_until_succeed: bool,
    non_block_write: bool,
    observe_tags: RwLock<Vec<Tag>>,
    wanted_target: RwLock<Option<String>>,

    processor: RwLock<Option<Processor>>,
    receiver: RwLock<Option<Receiver>>,
    error_handler: RwLock<ErrorHandler>,

    write_tx: mpsc::Sender<Frame>,
    write_rx: StdMutex<Option<mpsc::Receiver<Frame>>>,

    control: RwLock<Option<SharedControl>>,
    cancel: CancellationToken,
}

impl Client {
    #[must_use]
    pub fn new(
        name: &str,
        client_type: ClientType,
        endpoint: Endpoint,
        options: ClientOptions,
    ) -> Arc<Self> {
        let client_id = new_id();
        let (write_tx, write_rx) = mpsc::channel(WRITE_QUEUE_CAP);

        if options.credential.name() != "none" {
            tracing::info!(
                component = %client_type,
                %client_id,
                credential_name = options.credential.name(),
                "use credential"
            );
        }

        Arc::new(Self {
            name: name.to_string(),
            client_id,
            client_type,
            endpoint,
            credential: options.credential,
            connect_until_succeed: options.connect_until_succeed,
            non_block_write: options.non_block_write,
            observe_tags: RwLock::new(options.observe_data_tags),
            wanted_target: RwLock::new(options.wanted_target),
            processor: RwLock::new(None),
            receiver: RwLock::new(None),
            error_handler: RwLock::new(Arc::new(|err: &Error| {
                tracing::error!(%err, "client error");
            })),
            write_tx,
            write_rx: StdMutex::new(Some(write_rx)),
            control: RwLock::new(None),
            cancel: CancellationToken::new(),
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    #[must_use]
    pub fn client_type(&self) -> ClientType {
        self.client_type
    }

    /// The data tags delivered to this engine. Takes effect at the next
    /// handshake; tags can only be declared to the server that way.
    pub fn set_observe_data_tags(&self, tags: Vec<Tag>) {
        *self.observe_tags.write().expect("observe tags lock") = tags;
    }

    pub fn set_wanted_target(&self, target: Option<String>) {
        *self.wanted_target.write().expect("wanted target lock") = target;
    }

    /// Install the data frame handler, invoked inline by the reader pump.
    /// Handlers must be reentrant-safe and should not block; a panic is
    /// recovered and reported without killing the pump.
    pub fn set_data_frame_observer<F, Fut>(&self, f: F)
    where
        F: Fn(DataFrame) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let processor: Processor = Arc::new(move |frame| f(frame).boxed());
        *self.processor.write().expect("processor lock") = Some(processor);
    }

    /// Install the backflow frame handler.
    pub fn set_backflow_frame_observer<F>(&self, f: F)
    where
        F: Fn(BackflowFrame) + Send + Sync + 'static,
    {
        *self.receiver.write().expect("receiver lock") = Some(Arc::new(f));
    }

    pub fn set_error_handler<F>(&self, f: F)
    where
        F: Fn(&Error) + Send + Sync + 'static,
    {
        *self.error_handler.write().expect("error handler lock") = Arc::new(f);
        tracing::debug!("the error handler has been set");
    }

    fn report_error(&self, err: &Error) {
        let handler = self.error_handler.read().expect("error handler lock").clone();
        handler(err);
    }

    /// The current control stream, swapped by the supervisor on reconnect.
    #[must_use]
    pub fn control_stream(&self) -> Option<SharedControl> {
        self.control.read().expect("control lock").clone()
    }

    fn set_control(&self, control: ClientControlStream) -> SharedControl {
        let shared = Arc::new(Mutex::new(control));
        *self.control.write().expect("control lock") = Some(shared.clone());
        shared
    }

    fn parse_addr(addr: &str) -> Result<iroh::PublicKey, Error> {
        let bytes = bs58::decode(addr)
            .into_vec()
            .map_err(|_| Error::malformed("zipper address is not valid base58"))?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| Error::malformed("zipper address must decode to 32 bytes"))?;
        iroh::PublicKey::from_bytes(&bytes)
            .map_err(|_| Error::malformed("zipper address is not a valid public key"))
    }

    /// Connect to the zipper at `addr` (a base58 endpoint key), open and
    /// authenticate the control stream, then hand off to the supervisor
    /// which opens the data stream and keeps the session alive.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AuthenticateFailed`] on credential rejection (never
    /// retried, even with `connect_until_succeed`), or the first transport
    /// error otherwise.
    pub async fn connect(self: &Arc<Self>, addr: &str) -> Result<(), Report<Error>> {
        if self.client_type == ClientType::StreamFunction
            && self.observe_tags.read().expect("observe tags lock").is_empty()
        {
            return Err(Report::new(Error::Rejected(
                "a stream function must declare observed data tags before connecting".into(),
            )));
        }

        let target = Self::parse_addr(addr).map_err(Report::new)?;

        let control = loop {
            match self.open_control(target).await {
                Ok(control) => break control,
                Err(e) => {
                    if self.connect_until_succeed && !matches!(e, Error::AuthenticateFailed(_)) {
                        tracing::error!(err = %e, "failed to connect to zipper, trying to reconnect");
                        tokio::time::sleep(RECONNECT_DELAY).await;
                        continue;
                    }
                    tracing::error!(err = %e, "can not connect to zipper");
                    return Err(Report::new(e));
                }
            }
        };
        tracing::info!(zipper_addr = addr, "connected to zipper");

        let control = self.set_control(control);

        let write_rx = self
            .write_rx
            .lock()
            .expect("write queue lock")
            .take()
            .ok_or_else(|| Report::new(Error::Io(std::io::Error::other("already connected"))))?;

        let engine = self.clone();
        tokio::spawn(engine.run_background(target, control, write_rx));

        Ok(())
    }

    async fn open_control(&self, target: iroh::PublicKey) -> Result<ClientControlStream, Error> {
        let mut control = ClientControlStream::open(&self.endpoint, target).await?;
        control.authenticate(&self.credential).await?;
        Ok(control)
    }

    /// Supervisor: runs sessions back to back, reconnecting on failure.
    async fn run_background(
        self: Arc<Self>,
        target: iroh::PublicKey,
        mut control: SharedControl,
        mut write_rx: mpsc::Receiver<Frame>,
    ) {
        loop {
            match self.process_session(&control, &mut write_rx).await {
                SessionEnd::Cancelled => {
                    let mut cs = control.lock().await;
                    if let Err(e) = cs.close("client closed").await {
                        tracing::debug!(err = %e, "error closing control stream");
                    }
                    return;
                }
                SessionEnd::Eof => {
                    self.report_error(&Error::StreamClosed);
                    self.cancel.cancel();
                    return;
                }
                SessionEnd::Failed(e) => {
                    self.report_error(&e);
                    // Active refusals (bad credential, rejected handshake)
                    // will not get better by retrying the same thing.
                    if e.is_fatal() {
                        self.cancel.cancel();
                        return;
                    }
                }
            }

            // Blocking mode preserves queued frames across the reconnect;
            // non-blocking mode promises no delivery guarantee, so frames
            // enqueued before the disconnect are discarded here.
            if self.non_block_write {
                let mut dropped = 0usize;
                while write_rx.try_recv().is_ok() {
                    dropped += 1;
                }
                if dropped > 0 {
                    tracing::debug!(dropped, "discarded queued frames on disconnect");
                }
            }

            // Reconnect: new connection, new control stream, same handshake.
            loop {
                tokio::select! {
                    () = self.cancel.cancelled() => return,
                    () = tokio::time::sleep(RECONNECT_DELAY) => {}
                }

                match self.open_control(target).await {
                    Ok(cs) => {
                        control = self.set_control(cs);
                        tracing::info!("reconnected to zipper");
                        break;
                    }
                    Err(e) => {
                        if matches!(e, Error::AuthenticateFailed(_)) {
                            self.report_error(&e);
                            self.cancel.cancel();
                            return;
                        }
                        tracing::error!(err = %e, "reconnect error");
                    }
                }
            }
        }
    }

    fn handshake_frame(&self) -> HandshakeFrame {
        HandshakeFrame {
            name: self.name.clone(),
            id: new_id(),
            client_id: self.client_id.clone(),
            client_type: self.client_type.as_u8(),
            observe_data_tags: self.observe_tags.read().expect("observe tags lock").clone(),
            auth_name: self.credential.name().to_string(),
            auth_payload: bytes::Bytes::copy_from_slice(self.credential.payload().as_bytes()),
        }
    }

    /// One data-stream session: handshake, then pump until something ends it.
    async fn process_session(
        &self,
        control: &SharedControl,
        write_rx: &mut mpsc::Receiver<Frame>,
    ) -> SessionEnd {
        let data_stream = {
            let mut cs = control.lock().await;
            let ack = match cs.request_stream(self.handshake_frame()).await {
                Ok(ack) => ack,
                Err(e) => return Self::classify(e),
            };
            match cs.accept_data_stream(&ack).await {
                Ok(stream) => stream,
                Err(e) => return Self::classify(e),
            }
        };
        tracing::debug!(stream_id = data_stream.stream_id(), "data stream open");

        let (mut reader, mut writer) = data_stream.split();

        // Reader pump: frames flow through an unbuffered-ish channel so the
        // processor can select over reads and writes together.
        let (read_tx, mut read_rx) = mpsc::channel::<Result<Frame, Error>>(1);
        let reader_task = tokio::spawn(async move {
            loop {
                let result = reader.read_frame().await;
                let failed = result.is_err();
                if read_tx.send(result).await.is_err() || failed {
                    return;
                }
            }
        });

        let end = loop {
            tokio::select! {
                biased;

                () = self.cancel.cancelled() => break SessionEnd::Cancelled,

                Some(result) = read_rx.recv() => match result {
                    Ok(frame) => match self.handle_frame(frame).await {
                        FrameOutcome::Continue => {}
                        FrameOutcome::Stop(end) => break end,
                    },
                    Err(e) => break Self::classify(e),
                },

                Some(frame) = write_rx.recv() => {
                    if let Err(e) = writer.write_frame(frame).await {
                        break Self::classify(e);
                    }
                }
            }
        };

        reader_task.abort();
        if let Err(e) = writer.close().await {
            tracing::debug!(err = %e, "error closing data stream");
        }
        end
    }

    fn classify(e: Error) -> SessionEnd {
        match e {
            Error::StreamClosed => SessionEnd::Eof,
            other => SessionEnd::Failed(other),
        }
    }

    async fn handle_frame(&self, frame: Frame) -> FrameOutcome {
        match frame {
            Frame::Data(df) => {
                if !self.wants(&df) {
                    return FrameOutcome::Continue;
                }
                let processor = self.processor.read().expect("processor lock").clone();
                let Some(processor) = processor else {
                    tracing::warn!("the processor has not been set");
                    return FrameOutcome::Continue;
                };
                if let Err(panic) = AssertUnwindSafe(processor(df)).catch_unwind().await {
                    self.recover_panic(panic);
                }
                FrameOutcome::Continue
            }
            Frame::Backflow(bf) => {
                let receiver = self.receiver.read().expect("receiver lock").clone();
                let Some(receiver) = receiver else {
                    tracing::warn!("the receiver has not been set");
                    return FrameOutcome::Continue;
                };
                if let Err(panic) =
                    std::panic::catch_unwind(AssertUnwindSafe(|| receiver(bf)))
                {
                    self.recover_panic(panic);
                }
                FrameOutcome::Continue
            }
            Frame::CloseStream(cs) => {
                tracing::info!(reason = %cs.reason, "data stream closed by server");
                FrameOutcome::Stop(SessionEnd::Failed(Error::Disconnected))
            }
            Frame::Goaway(g) => {
                tracing::warn!(reason = %g.reason, "server sent goaway");
                FrameOutcome::Stop(SessionEnd::Eof)
            }
            other => {
                tracing::warn!(
                    frame_type = %other.frame_type(),
                    "data stream received unexpected frame"
                );
                FrameOutcome::Continue
            }
        }
    }

    /// Apply the `wanted_target` filter.
    fn wants(&self, frame: &DataFrame) -> bool {
        let wanted = self.wanted_target.read().expect("wanted target lock");
        let Some(wanted) = wanted.as_deref() else {
            return true;
        };
        match Metadata::decode(&frame.metadata) {
            Ok(md) => md.target() == Some(wanted),
            Err(e) => {
                tracing::debug!(err = %e, "dropping frame with undecodable metadata");
                false
            }
        }
    }

    fn recover_panic(&self, panic: Box<dyn std::any::Any + Send>) {
        let message = panic_message(panic.as_ref());
        let backtrace = std::backtrace::Backtrace::force_capture();
        tracing::error!(%message, %backtrace, "handler panic");
        self.report_error(&Error::HandlerPanic(message));
    }

    /// Enqueue a frame on the writer pump. Blocking mode waits for queue
    /// space; non-blocking mode drops the frame and reports
    /// [`Error::Disconnected`] when the queue is full.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Disconnected`] when the engine is closed or, in
    /// non-blocking mode, when the queue is full.
    pub async fn write_frame(&self, frame: Frame) -> Result<(), Error> {
        if self.cancel.is_cancelled() {
            return Err(Error::Disconnected);
        }
        if self.non_block_write {
            self.write_tx.try_send(frame).map_err(|_| {
                tracing::debug!("failed to write frame: queue full or closed");
                Error::Disconnected
            })
        } else {
            self.write_tx
                .send(frame)
                .await
                .map_err(|_| Error::Disconnected)
        }
    }

    /// Open a uni-stream for a bulk payload and describe it with a
    /// [`StreamFrame`]. The stream is open before the companion data frame
    /// can be written, as the protocol requires.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Disconnected`] when not connected, or the
    /// transport error from the stream open.
    pub async fn open_pipe_stream(&self, tag: Tag) -> Result<(SendStream, StreamFrame), Error> {
        let peer = self.open_peer()?;
        let send = peer.open(tag).await?;
        let stream_frame = StreamFrame {
            id: new_id(),
            stream_id: quic_stream_id(&send),
            chunk_size: DEFAULT_CHUNK_SIZE,
        };
        Ok((send, stream_frame))
    }

    /// A [`Peer`] over the current connection.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Disconnected`] when not connected.
    pub fn open_peer(&self) -> Result<Peer, Error> {
        let control = self.control_stream().ok_or(Error::Disconnected)?;
        let conn = {
            let guard = control.try_lock();
            match guard {
                Ok(cs) => cs.conn().clone(),
                Err(_) => {
                    // Control stream busy with a handshake; the connection
                    // is the same either way.
                    return Err(Error::Disconnected);
                }
            }
        };
        Ok(Peer::new(conn, control))
    }

    /// Cancel the engine; both pumps exit and streams close gracefully.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    /// Wait until the engine stops.
    pub async fn wait(&self) {
        self.cancel.cancelled().await;
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
