//! The producer-side endpoint surface.

use std::sync::Arc;

use bytes::Bytes;
use error_stack::Report;
use iroh::Endpoint;
use seam_core::{
    BackflowFrame, ClientType, DataFrame, Error, Frame, Metadata, Tag, encode_frame, trace,
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};

use crate::client::Client;
use crate::options::ClientOptions;

/// A source writes tagged data frames into the mesh and may receive
/// backflow replies from downstream stream functions.
pub struct Source {
    client: Arc<Client>,
    zipper_addr: String,
    tracer: Option<Arc<dyn seam_core::Tracer>>,
}

impl Source {
    #[must_use]
    pub fn new(name: &str, zipper_addr: &str, endpoint: Endpoint, options: ClientOptions) -> Self {
        let tracer = options.tracer.clone();
        let client = Client::new(name, ClientType::Source, endpoint, options);
        Self {
            client,
            zipper_addr: zipper_addr.to_string(),
            tracer,
        }
    }

    /// Connect to the zipper.
    ///
    /// # Errors
    ///
    /// See [`Client::connect`].
    pub async fn connect(&self) -> Result<(), Report<Error>> {
        self.client.connect(&self.zipper_addr).await
    }

    /// Install the backflow handler. Call before `connect`.
    pub fn set_receive_handler<F>(&self, f: F)
    where
        F: Fn(Tag, Bytes) + Send + Sync + 'static,
    {
        self.client
            .set_backflow_frame_observer(move |frame: BackflowFrame| {
                f(frame.tag, frame.carriage);
            });
        tracing::info!("receive handler set for the source");
    }

    pub fn set_error_handler<F>(&self, f: F)
    where
        F: Fn(&Error) + Send + Sync + 'static,
    {
        self.client.set_error_handler(f);
    }

    /// Write data to the directed downstream.
    ///
    /// # Errors
    ///
    /// See [`Client::write_frame`].
    pub async fn write(&self, tag: Tag, data: impl Into<Bytes>) -> Result<(), Report<Error>> {
        self.write_with(tag, data.into(), false).await
    }

    /// Write data to every downstream observing the tag.
    ///
    /// # Errors
    ///
    /// See [`Client::write_frame`].
    pub async fn broadcast(&self, tag: Tag, data: impl Into<Bytes>) -> Result<(), Report<Error>> {
        self.write_with(tag, data.into(), true).await
    }

    fn new_metadata(&self, streamed: bool) -> Metadata {
        let (tid, sid, traced) = match &self.tracer {
            Some(tracer) => {
                let span = tracer.start_span(self.client.name());
                (span.trace_id, span.span_id, true)
            }
            None => (trace::random_trace_id(), trace::random_span_id(), false),
        };
        Metadata::new_default(self.client.client_id(), &tid, &sid, traced, streamed)
    }

    async fn write_with(&self, tag: Tag, data: Bytes, broadcast: bool) -> Result<(), Report<Error>> {
        let metadata = self.new_metadata(false);
        tracing::debug!(
            tag,
            broadcast,
            tid = metadata.tid(),
            sid = metadata.sid(),
            "source write"
        );
        let frame = Frame::Data(DataFrame {
            tag,
            metadata: metadata.encode(),
            payload: data,
            streamed: false,
            broadcast,
        });
        self.client.write_frame(frame).await.map_err(Report::new)
    }

    /// Pipe a bulk payload into the mesh: the bytes travel on a dedicated
    /// uni-stream while a companion data frame carries the stream
    /// reference. The uni-stream is open before the frame is sent.
    ///
    /// # Errors
    ///
    /// Returns the transport error from the stream open, frame write, or
    /// byte copy.
    pub async fn pipe(
        &self,
        tag: Tag,
        mut reader: impl AsyncRead + Unpin,
        broadcast: bool,
    ) -> Result<(), Report<Error>> {
        let (mut send, stream_frame) = self
            .client
            .open_pipe_stream(tag)
            .await
            .map_err(Report::new)?;
        let chunk_size = stream_frame.chunk_size as usize;
        tracing::debug!(
            tag,
            stream_id = stream_frame.stream_id,
            chunk_size,
            "source pipe"
        );

        let metadata = self.new_metadata(true);
        let frame = Frame::Data(DataFrame {
            tag,
            metadata: metadata.encode(),
            payload: encode_frame(&Frame::Stream(stream_frame)),
            streamed: true,
            broadcast,
        });
        self.client.write_frame(frame).await.map_err(Report::new)?;

        let mut buf = vec![0u8; chunk_size];
        loop {
            let n = reader
                .read(&mut buf)
                .await
                .map_err(|e| Report::new(Error::from(e)))?;
            if n == 0 {
                break;
            }
            send.write_all(&buf[..n])
                .await
                .map_err(|e| Report::new(Error::Io(std::io::Error::other(e))))?;
        }
        send.shutdown()
            .await
            .map_err(|e| Report::new(Error::from(e)))?;
        tracing::debug!(tag, "source pipe complete");
        Ok(())
    }

    pub fn close(&self) {
        self.client.close();
        tracing::debug!("the source is closed");
    }
}
