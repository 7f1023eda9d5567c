//! Server-side fan-out of tagged uni-streams.
//!
//! Incoming uni-streams carry a tag header; observers register interest in
//! a tag and receive a fresh uni-stream when a matching reader arrives.
//! Observation is one-shot: an endpoint re-observes for every work item,
//! which bounds fan-out by the observer's own concurrency. All routing
//! state lives in one supervisor task fed by channels.

use std::collections::HashMap;

use futures::future::BoxFuture;
use seam_core::{Error, Tag};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::metrics::SharedMetrics;

/// Copy buffer for brokered streams.
const COPY_CHUNK: usize = 1024;

fn transport_err(e: impl std::error::Error + Send + Sync + 'static) -> Error {
    Error::Io(std::io::Error::other(e))
}

/// A connection that can open and accept uni-streams. Implemented for
/// iroh connections; tests substitute in-memory pipes.
pub trait UniConnection: Clone + Send + Sync + 'static {
    type Reader: AsyncRead + Unpin + Send + 'static;
    type Writer: AsyncWrite + Unpin + Send + 'static;

    fn open_uni(&self) -> impl Future<Output = Result<Self::Writer, Error>> + Send;
    fn accept_uni(&self) -> impl Future<Output = Result<Self::Reader, Error>> + Send;
}

impl UniConnection for iroh::endpoint::Connection {
    type Reader = iroh::endpoint::RecvStream;
    type Writer = iroh::endpoint::SendStream;

    async fn open_uni(&self) -> Result<Self::Writer, Error> {
        iroh::endpoint::Connection::open_uni(self)
            .await
            .map_err(transport_err)
    }

    async fn accept_uni(&self) -> Result<Self::Reader, Error> {
        iroh::endpoint::Connection::accept_uni(self)
            .await
            .map_err(transport_err)
    }
}

/// Reads the tag header off a freshly accepted uni-stream.
pub type DrainTagFn<R> =
    std::sync::Arc<dyn for<'a> Fn(&'a mut R) -> BoxFuture<'a, Result<Tag, Error>> + Send + Sync>;

/// The default header: one 4-byte big-endian tag.
#[must_use]
pub fn default_drain<R: AsyncRead + Unpin + Send>() -> DrainTagFn<R> {
    std::sync::Arc::new(|reader| {
        Box::pin(async move {
            let mut header = [0u8; 4];
            reader.read_exact(&mut header).await.map_err(Error::from)?;
            Ok(Tag::from_be_bytes(header))
        })
    })
}

struct TaggedReader<R> {
    tag: Tag,
    reader: R,
}

struct TaggedObserver<C> {
    tag: Tag,
    id: String,
    conn: C,
}

pub struct Broker<C: UniConnection> {
    reader_tx: mpsc::Sender<TaggedReader<C::Reader>>,
    observer_tx: mpsc::Sender<TaggedObserver<C>>,
    drain: DrainTagFn<C::Reader>,
    cancel: CancellationToken,
}

impl<C: UniConnection> Broker<C> {
    #[must_use]
    pub fn new(drain: DrainTagFn<C::Reader>, metrics: SharedMetrics) -> Self {
        let (reader_tx, reader_rx) = mpsc::channel(16);
        let (observer_tx, observer_rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();

        tokio::spawn(run(reader_rx, observer_rx, cancel.clone(), metrics));

        Self {
            reader_tx,
            observer_tx,
            drain,
            cancel,
        }
    }

    /// Accept uni-streams from `conn` until it fails, draining the tag
    /// header from each and handing the remainder to the supervisor.
    pub async fn accepting_stream(&self, conn: C) {
        loop {
            let mut reader = tokio::select! {
                () = self.cancel.cancelled() => return,
                accepted = conn.accept_uni() => match accepted {
                    Ok(reader) => reader,
                    Err(e) => {
                        tracing::debug!(err = %e, "failed to accept a uni-stream");
                        return;
                    }
                },
            };

            let tag = match (self.drain)(&mut reader).await {
                Ok(tag) => tag,
                Err(e) => {
                    tracing::debug!(err = %e, "failed to drain tag header");
                    continue;
                }
            };

            if self
                .reader_tx
                .send(TaggedReader { tag, reader })
                .await
                .is_err()
            {
                return;
            }
        }
    }

    /// Register `conn` for the next stream tagged `tag`. One-shot: call
    /// again after a match to keep observing.
    pub async fn observe(&self, tag: Tag, id: &str, conn: C) {
        tracing::debug!(tag, conn_id = id, "accept an observer");
        let _ = self
            .observer_tx
            .send(TaggedObserver {
                tag,
                id: id.to_string(),
                conn,
            })
            .await;
    }

    pub fn close(&self) {
        self.cancel.cancel();
    }
}

impl<C: UniConnection> Drop for Broker<C> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Supervisor: exclusive owner of the routing maps.
async fn run<C: UniConnection>(
    mut reader_rx: mpsc::Receiver<TaggedReader<C::Reader>>,
    mut observer_rx: mpsc::Receiver<TaggedObserver<C>>,
    cancel: CancellationToken,
    metrics: SharedMetrics,
) {
    let (eof_tx, mut eof_rx) = mpsc::channel::<Tag>(16);

    // The most recent parked stream per tag; at most one.
    let mut readers: HashMap<Tag, C::Reader> = HashMap::new();
    // Connections awaiting a stream, per tag, keyed by connection id.
    let mut observers: HashMap<Tag, HashMap<String, C>> = HashMap::new();

    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                tracing::debug!("broker is closed");
                return;
            }

            Some(observer) = observer_rx.recv() => {
                if let Some(reader) = readers.remove(&observer.tag) {
                    match observer.conn.open_uni().await {
                        Ok(writer) => {
                            metrics.metrics.brokered_streams_total.inc();
                            tokio::spawn(copy_to_all(
                                observer.tag,
                                reader,
                                vec![writer],
                                eof_tx.clone(),
                            ));
                        }
                        Err(e) => {
                            tracing::debug!(err = %e, "failed to open a uni-stream");
                        }
                    }
                    continue;
                }
                observers
                    .entry(observer.tag)
                    .or_default()
                    .insert(observer.id, observer.conn);
            }

            Some(tagged) = reader_rx.recv() => {
                let waiting = observers.remove(&tagged.tag).unwrap_or_default();
                if waiting.is_empty() {
                    if readers.contains_key(&tagged.tag) {
                        // At most one parked reader per tag.
                        tracing::warn!(tag = tagged.tag, "duplicate writer, close current writer");
                        drop(tagged.reader);
                    } else {
                        readers.insert(tagged.tag, tagged.reader);
                    }
                    continue;
                }

                let mut writers = Vec::with_capacity(waiting.len());
                for (id, conn) in waiting {
                    match conn.open_uni().await {
                        Ok(writer) => writers.push(writer),
                        Err(e) => {
                            tracing::debug!(err = %e, conn_id = id, "failed to open a uni-stream");
                        }
                    }
                }
                metrics.metrics.brokered_streams_total.inc_by(writers.len() as u64);
                tokio::spawn(copy_to_all(tagged.tag, tagged.reader, writers, eof_tx.clone()));
            }

            Some(tag) = eof_rx.recv() => {
                readers.remove(&tag);
            }

            else => return,
        }
    }
}

/// Multi-writer copy: every observer sees the same byte order, and
/// progress is bounded by the slowest one.
async fn copy_to_all<R, W>(tag: Tag, mut reader: R, mut writers: Vec<W>, eof_tx: mpsc::Sender<Tag>)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = [0u8; COPY_CHUNK];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => {
                for writer in &mut writers {
                    let _ = writer.shutdown().await;
                }
                let _ = eof_tx.send(tag).await;
                tracing::debug!(tag, "writing to all observers has been completed");
                return;
            }
            Ok(n) => {
                for writer in &mut writers {
                    if let Err(e) = writer.write_all(&buf[..n]).await {
                        tracing::debug!(tag, err = %e, "failed to write a uni-stream");
                        return;
                    }
                }
            }
            Err(e) => {
                tracing::debug!(tag, err = %e, "failed to read a uni-stream");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::io::DuplexStream;
    use tokio::sync::Mutex;

    use super::*;
    use crate::metrics::{MetricsEncoder, ZipperMetrics};

    /// In-memory stand-in for a QUIC connection: `open_uni` hands the far
    /// half to the test, `accept_uni` pulls streams the test queued.
    #[derive(Clone)]
    struct FakeConn {
        incoming: Arc<Mutex<mpsc::Receiver<DuplexStream>>>,
        opened_tx: mpsc::Sender<DuplexStream>,
    }

    struct FakeHandle {
        incoming_tx: mpsc::Sender<DuplexStream>,
        opened_rx: mpsc::Receiver<DuplexStream>,
    }

    fn fake_conn() -> (FakeConn, FakeHandle) {
        let (incoming_tx, incoming_rx) = mpsc::channel(8);
        let (opened_tx, opened_rx) = mpsc::channel(8);
        (
            FakeConn {
                incoming: Arc::new(Mutex::new(incoming_rx)),
                opened_tx,
            },
            FakeHandle {
                incoming_tx,
                opened_rx,
            },
        )
    }

    impl UniConnection for FakeConn {
        type Reader = DuplexStream;
        type Writer = DuplexStream;

        async fn open_uni(&self) -> Result<DuplexStream, Error> {
            let (near, far) = tokio::io::duplex(4096);
            self.opened_tx
                .send(far)
                .await
                .map_err(|_| Error::Disconnected)?;
            Ok(near)
        }

        async fn accept_uni(&self) -> Result<DuplexStream, Error> {
            self.incoming
                .lock()
                .await
                .recv()
                .await
                .ok_or(Error::Disconnected)
        }
    }

    fn test_metrics() -> SharedMetrics {
        Arc::new(MetricsEncoder::new(ZipperMetrics::new()))
    }

    async fn push_stream(handle: &FakeHandle, tag: Tag, payload: &[u8]) {
        let (mut near, far) = tokio::io::duplex(4096);
        // Hand the far half over first: payloads larger than the pipe
        // buffer need the broker draining concurrently.
        handle.incoming_tx.send(far).await.unwrap();
        near.write_all(&tag.to_be_bytes()).await.unwrap();
        near.write_all(payload).await.unwrap();
        near.shutdown().await.unwrap();
    }

    async fn read_docked(handle: &mut FakeHandle) -> Vec<u8> {
        let mut stream = tokio::time::timeout(Duration::from_secs(2), handle.opened_rx.recv())
            .await
            .expect("observer was never docked")
            .expect("fake conn closed");
        let mut bytes = Vec::new();
        stream.read_to_end(&mut bytes).await.unwrap();
        bytes
    }

    fn spawn_accepting(broker: &Arc<Broker<FakeConn>>, conn: FakeConn) {
        let broker = broker.clone();
        tokio::spawn(async move {
            broker.accepting_stream(conn).await;
        });
    }

    #[tokio::test]
    async fn fan_out_is_byte_identical() {
        let broker = Arc::new(Broker::<FakeConn>::new(default_drain(), test_metrics()));

        let (obs1, mut h1) = fake_conn();
        let (obs2, mut h2) = fake_conn();
        broker.observe(0x30, "obs-1", obs1).await;
        broker.observe(0x30, "obs-2", obs2).await;

        let (source, source_handle) = fake_conn();
        spawn_accepting(&broker, source);

        let payload: Vec<u8> = (0..8192u32).map(|i| (i % 251) as u8).collect();
        // Larger than both pipe buffers: the writer task and the two
        // reads below must make progress together.
        tokio::spawn({
            let payload = payload.clone();
            async move {
                push_stream(&source_handle, 0x30, &payload).await;
            }
        });

        assert_eq!(read_docked(&mut h1).await, payload);
        assert_eq!(read_docked(&mut h2).await, payload);
    }

    #[tokio::test]
    async fn observers_are_one_shot() {
        let broker = Arc::new(Broker::<FakeConn>::new(default_drain(), test_metrics()));

        let (obs, mut handle) = fake_conn();
        broker.observe(0x31, "obs", obs.clone()).await;

        let (source, source_handle) = fake_conn();
        spawn_accepting(&broker, source);

        // First stream matches the parked observer.
        push_stream(&source_handle, 0x31, b"first").await;
        assert_eq!(read_docked(&mut handle).await, b"first");

        // Second stream finds no observer and parks.
        push_stream(&source_handle, 0x31, b"second").await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(
            handle.opened_rx.try_recv().is_err(),
            "observer must be one-shot"
        );

        // Re-observing drains the parked stream.
        broker.observe(0x31, "obs", obs).await;
        assert_eq!(read_docked(&mut handle).await, b"second");
    }

    #[tokio::test]
    async fn duplicate_parked_reader_is_dropped() {
        let broker = Arc::new(Broker::<FakeConn>::new(default_drain(), test_metrics()));

        let (source, source_handle) = fake_conn();
        spawn_accepting(&broker, source);

        push_stream(&source_handle, 0x32, b"kept").await;
        push_stream(&source_handle, 0x32, b"dropped").await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        let (obs, mut handle) = fake_conn();
        broker.observe(0x32, "obs", obs).await;
        assert_eq!(read_docked(&mut handle).await, b"kept");
    }
}
