//! Peer verbs for the broker protocol: open a tagged uni-stream, observe
//! a tag, and forward handler output under a configured writer tag.

use std::sync::{Arc, OnceLock};

use iroh::endpoint::{Connection, RecvStream, SendStream};
use seam_core::{Error, Tag};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::control::ClientControlStream;

fn transport_err(e: impl std::error::Error + Send + Sync + 'static) -> Error {
    Error::Io(std::io::Error::other(e))
}

/// Write the tag header that prefixes every brokered uni-stream.
///
/// # Errors
///
/// Returns [`Error::Io`] when the write fails.
pub async fn write_tag_header(writer: &mut SendStream, tag: Tag) -> Result<(), Error> {
    writer
        .write_all(&tag.to_be_bytes())
        .await
        .map_err(transport_err)
}

/// Glues a QUIC connection to the broker's verbs.
pub struct Peer {
    conn: Connection,
    control: Arc<Mutex<ClientControlStream>>,
    writer_tag: OnceLock<Tag>,
}

impl Peer {
    #[must_use]
    pub fn new(conn: Connection, control: Arc<Mutex<ClientControlStream>>) -> Self {
        Self {
            conn,
            control,
            writer_tag: OnceLock::new(),
        }
    }

    /// Configure the tag used for handler output. Only the first call has
    /// any effect; if never called, handler output is discarded.
    pub fn set_observe_handler_writer_tag(&self, tag: Tag) {
        let _ = self.writer_tag.set(tag);
    }

    /// Open a uni-stream the broker will dock under `tag`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] when the stream open or header write fails.
    pub async fn open(&self, tag: Tag) -> Result<SendStream, Error> {
        let mut send = self.conn.open_uni().await.map_err(transport_err)?;
        write_tag_header(&mut send, tag).await?;
        Ok(send)
    }

    /// Request one stream for `tag` and wait for the broker to dock it.
    /// Observation is one-shot: call again for the next stream.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] when the request or accept fails.
    pub async fn observe_once(&self, tag: Tag) -> Result<RecvStream, Error> {
        self.control.lock().await.observe(tag).await?;
        self.conn.accept_uni().await.map_err(transport_err)
    }

    /// Observe `tag` in a loop, invoking `handler` for every docked
    /// stream. The handler's writer is a fresh uni-stream under the
    /// configured writer tag, or `None` when no writer tag was set.
    ///
    /// # Errors
    ///
    /// Returns the first transport error; the loop does not survive one.
    pub async fn observe<H, Fut>(&self, tag: Tag, handler: H) -> Result<(), Error>
    where
        H: Fn(RecvStream, Option<SendStream>) -> Fut,
        Fut: Future<Output = ()>,
    {
        loop {
            let reader = self.observe_once(tag).await?;
            let writer = match self.writer_tag.get() {
                Some(writer_tag) => Some(self.open(*writer_tag).await?),
                None => None,
            };
            handler(reader, writer).await;
        }
    }
}
