//! The context handed to a stream function handler for each data frame.

use std::sync::Arc;

use bytes::Bytes;
use error_stack::Report;
use iroh::endpoint::RecvStream;
use seam_core::{DataFrame, Error, Frame, Metadata, Tag, decode_frame};

use crate::client::Client;

/// Builder for handler output carrying its own trace/target overrides.
#[derive(Debug, Clone)]
pub struct Payload {
    data: Bytes,
    tid: Option<String>,
    target: Option<String>,
}

impl Payload {
    #[must_use]
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            tid: None,
            target: None,
        }
    }

    #[must_use]
    pub fn with_tid(mut self, tid: impl Into<String>) -> Self {
        self.tid = Some(tid.into());
        self
    }

    #[must_use]
    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }
}

/// One invocation's view of the frame being handled, plus the verbs to
/// emit new frames into the mesh.
pub struct Context {
    frame: DataFrame,
    metadata: Metadata,
    client: Arc<Client>,
}

impl Context {
    pub(crate) fn new(frame: DataFrame, client: Arc<Client>) -> Self {
        let metadata = Metadata::decode(&frame.metadata).unwrap_or_else(|e| {
            tracing::debug!(err = %e, "frame carries undecodable metadata");
            Metadata::new()
        });
        Self {
            frame,
            metadata,
            client,
        }
    }

    #[must_use]
    pub fn tag(&self) -> Tag {
        self.frame.tag
    }

    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.frame.payload
    }

    #[must_use]
    pub fn tid(&self) -> &str {
        self.metadata.tid()
    }

    #[must_use]
    pub fn metadata(&self, key: &str) -> Option<&str> {
        self.metadata.get(key)
    }

    /// Whether the payload is a stream reference rather than inline bytes.
    #[must_use]
    pub fn streamed(&self) -> bool {
        self.frame.streamed
    }

    /// The bulk byte stream referenced by a streamed frame. Requests one
    /// observation from the broker and waits for the stream to dock.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Malformed`] when the frame is not streamed or its
    /// payload is not a valid stream reference.
    pub async fn stream(&self) -> Result<RecvStream, Report<Error>> {
        if !self.frame.streamed {
            return Err(Report::new(Error::malformed(
                "frame does not reference a stream",
            )));
        }
        let Frame::Stream(reference) =
            decode_frame(&self.frame.payload).map_err(Report::new)?
        else {
            return Err(Report::new(Error::malformed(
                "streamed frame payload is not a stream reference",
            )));
        };
        tracing::debug!(
            stream_id = reference.stream_id,
            chunk_size = reference.chunk_size,
            "docking payload stream"
        );

        let peer = self.client.open_peer().map_err(Report::new)?;
        peer.observe_once(self.frame.tag).await.map_err(Report::new)
    }

    /// Emit data under a new tag, relaying this frame's metadata verbatim
    /// so unrecognized keys survive the hop.
    ///
    /// # Errors
    ///
    /// See [`Client::write_frame`].
    pub async fn write(&self, tag: Tag, data: impl Into<Bytes>) -> Result<(), Report<Error>> {
        let frame = Frame::Data(DataFrame {
            tag,
            metadata: self.frame.metadata.clone(),
            payload: data.into(),
            streamed: false,
            broadcast: false,
        });
        self.client.write_frame(frame).await.map_err(Report::new)
    }

    /// Emit a [`Payload`] under a new tag, applying its tid/target
    /// overrides on top of the relayed metadata.
    ///
    /// # Errors
    ///
    /// See [`Client::write_frame`].
    pub async fn write_payload(&self, tag: Tag, payload: Payload) -> Result<(), Report<Error>> {
        let mut metadata = self.metadata.clone();
        if let Some(tid) = &payload.tid {
            metadata.set_tid(tid);
        }
        if let Some(target) = &payload.target {
            metadata.set_target(target);
        }
        let frame = Frame::Data(DataFrame {
            tag,
            metadata: metadata.encode(),
            payload: payload.data,
            streamed: false,
            broadcast: false,
        });
        self.client.write_frame(frame).await.map_err(Report::new)
    }
}
