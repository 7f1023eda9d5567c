//! Engine configuration.

use std::sync::Arc;

use seam_core::{Credential, Tag, Tracer};

/// Options accepted by every client engine, whichever endpoint type wraps
/// it. Transport-level settings (keys, transport config) belong to the
/// iroh `Endpoint` the engine is constructed with.
#[derive(Clone, Default)]
pub struct ClientOptions {
    /// Credential presented on the control stream. Defaults to the
    /// anonymous `none` scheme.
    pub credential: Credential,
    /// Tags a stream function wants delivered. Ignored for sources.
    pub observe_data_tags: Vec<Tag>,
    /// Retry the initial connect every second instead of failing, unless
    /// authentication itself was rejected.
    pub connect_until_succeed: bool,
    /// Drop frames instead of waiting when the write queue is full.
    pub non_block_write: bool,
    /// Only deliver frames whose metadata `target` equals this value.
    pub wanted_target: Option<String>,
    /// Span factory for outbound frames. When unset, fresh ids are
    /// generated per frame with `traced=false`.
    pub tracer: Option<Arc<dyn Tracer>>,
}

impl std::fmt::Debug for ClientOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientOptions")
            .field("credential", &self.credential.name())
            .field("observe_data_tags", &self.observe_data_tags)
            .field("connect_until_succeed", &self.connect_until_succeed)
            .field("non_block_write", &self.non_block_write)
            .field("wanted_target", &self.wanted_target)
            .field("tracer", &self.tracer.is_some())
            .finish()
    }
}

impl ClientOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_credential(mut self, raw: &str) -> Self {
        self.credential = Credential::new(raw);
        self
    }

    #[must_use]
    pub fn with_observe_data_tags(mut self, tags: impl Into<Vec<Tag>>) -> Self {
        self.observe_data_tags = tags.into();
        self
    }

    #[must_use]
    pub fn with_connect_until_succeed(mut self, retry: bool) -> Self {
        self.connect_until_succeed = retry;
        self
    }

    #[must_use]
    pub fn with_non_block_write(mut self, non_block: bool) -> Self {
        self.non_block_write = non_block;
        self
    }

    #[must_use]
    pub fn with_wanted_target(mut self, target: &str) -> Self {
        self.wanted_target = Some(target.to_string());
        self
    }

    #[must_use]
    pub fn with_tracer(mut self, tracer: Arc<dyn Tracer>) -> Self {
        self.tracer = Some(tracer);
        self
    }
}
