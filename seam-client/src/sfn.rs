//! The stream-function endpoint surface.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use error_stack::Report;
use iroh::Endpoint;
use seam_core::{ClientType, Error, Tag};

use crate::client::Client;
use crate::options::ClientOptions;
use crate::serverless::Context;

/// A stateful handler endpoint: observes tagged frames and may emit new
/// ones through its [`Context`].
pub struct StreamFunction {
    client: Arc<Client>,
    zipper_addr: String,
    initialized: AtomicBool,
}

impl StreamFunction {
    #[must_use]
    pub fn new(name: &str, zipper_addr: &str, endpoint: Endpoint, options: ClientOptions) -> Self {
        let client = Client::new(name, ClientType::StreamFunction, endpoint, options);
        Self {
            client,
            zipper_addr: zipper_addr.to_string(),
            initialized: AtomicBool::new(false),
        }
    }

    /// Declare the observed tags. Must be called before `connect`; the set
    /// can only reach the server through a handshake.
    pub fn set_observe_data_tags(&self, tags: impl Into<Vec<Tag>>) {
        self.client.set_observe_data_tags(tags.into());
    }

    /// Only deliver frames whose metadata `target` equals this value.
    pub fn set_wanted_target(&self, target: &str) {
        self.client.set_wanted_target(Some(target.to_string()));
    }

    /// Install the frame handler. Invoked inline by the reader pump; a
    /// panic is recovered and reported without stopping delivery.
    pub fn set_handler<F, Fut>(&self, f: F)
    where
        F: Fn(Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let client = self.client.clone();
        let f = Arc::new(f);
        self.client.set_data_frame_observer(move |frame| {
            let context = Context::new(frame, client.clone());
            f(context)
        });
    }

    pub fn set_error_handler<F>(&self, f: F)
    where
        F: Fn(&Error) + Send + Sync + 'static,
    {
        self.client.set_error_handler(f);
    }

    /// Run `f` exactly once, before connecting. A second call is a no-op
    /// that reports whether the first one already ran.
    ///
    /// # Errors
    ///
    /// Propagates the closure's error.
    pub fn init<F>(&self, f: F) -> Result<(), Report<Error>>
    where
        F: FnOnce() -> Result<(), Report<Error>>,
    {
        if self.initialized.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        f()
    }

    /// Connect to the zipper and start observing.
    ///
    /// # Errors
    ///
    /// See [`Client::connect`].
    pub async fn connect(&self) -> Result<(), Report<Error>> {
        self.client.connect(&self.zipper_addr).await
    }

    /// Block until the engine stops.
    pub async fn wait(&self) {
        self.client.wait().await;
    }

    pub fn close(&self) {
        self.client.close();
        tracing::debug!("the stream function is closed");
    }
}
