//! Connected-endpoint bookkeeping for one zipper.
//!
//! One entry per live data stream, keyed by client id. Registration
//! enforces the per-client single-stream invariant (a new handshake
//! replaces the old stream) and rejects name collisions between distinct
//! endpoints of the same type.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use seam_core::{ClientType, Error, Frame, Tag};
use tokio::sync::mpsc;

/// One registered endpoint and the writer handle to its data stream.
#[derive(Clone)]
pub struct EndpointEntry {
    pub client_id: String,
    pub name: String,
    pub client_type: ClientType,
    pub observe_data_tags: Vec<Tag>,
    pub stream_id: i64,
    pub frame_tx: mpsc::Sender<Frame>,
    /// Distinguishes successive data streams of the same client id so a
    /// late cleanup cannot evict the replacement.
    pub session: u64,
}

#[derive(Clone, Default)]
pub struct EndpointRegistry {
    inner: Arc<RwLock<HashMap<String, EndpointEntry>>>,
    next_session: Arc<AtomicU64>,
}

impl EndpointRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn next_session(&self) -> u64 {
        self.next_session.fetch_add(1, Ordering::Relaxed)
    }

    /// Register a new data stream. Returns the entry it replaced, if the
    /// client id already had a live one.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DuplicateName`] when a different endpoint of the
    /// same type already uses this name.
    pub fn register(&self, entry: EndpointEntry) -> Result<Option<EndpointEntry>, Error> {
        let mut inner = self.inner.write().expect("registry lock");

        let collision = inner.values().any(|existing| {
            existing.name == entry.name
                && existing.client_type == entry.client_type
                && existing.client_id != entry.client_id
        });
        if collision {
            return Err(Error::DuplicateName(entry.name));
        }

        let replaced = inner.insert(entry.client_id.clone(), entry);
        Ok(replaced)
    }

    /// Remove the entry for `client_id`, but only if it still belongs to
    /// `session`.
    pub fn remove(&self, client_id: &str, session: u64) {
        let mut inner = self.inner.write().expect("registry lock");
        if inner.get(client_id).is_some_and(|e| e.session == session) {
            inner.remove(client_id);
        }
    }

    /// Endpoints that declared interest in `tag`, excluding the sender.
    #[must_use]
    pub fn observers_of(&self, tag: Tag, exclude_client_id: &str) -> Vec<EndpointEntry> {
        let inner = self.inner.read().expect("registry lock");
        let mut matches: Vec<EndpointEntry> = inner
            .values()
            .filter(|e| {
                matches!(
                    e.client_type,
                    ClientType::StreamFunction | ClientType::UpstreamZipper
                ) && e.client_id != exclude_client_id
                    && e.observe_data_tags.contains(&tag)
            })
            .cloned()
            .collect();
        // Deterministic delivery order for directed (non-broadcast) writes.
        matches.sort_by(|a, b| a.session.cmp(&b.session));
        matches
    }

    /// The endpoint a backflow frame should return to.
    #[must_use]
    pub fn source_by_id(&self, client_id: &str) -> Option<EndpointEntry> {
        let inner = self.inner.read().expect("registry lock");
        inner.get(client_id).cloned()
    }

    #[must_use]
    pub fn connected_names(&self) -> Vec<String> {
        let inner = self.inner.read().expect("registry lock");
        let mut names: Vec<String> = inner
            .values()
            .map(|e| format!("{} ({})", e.name, e.client_type))
            .collect();
        names.sort();
        names
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read().expect("registry lock").len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(client_id: &str, name: &str, client_type: ClientType, tags: Vec<Tag>) -> EndpointEntry {
        let (frame_tx, _rx) = mpsc::channel(1);
        EndpointEntry {
            client_id: client_id.into(),
            name: name.into(),
            client_type,
            observe_data_tags: tags,
            stream_id: 0,
            frame_tx,
            session: 0,
        }
    }

    #[test]
    fn duplicate_name_same_type_rejected() {
        let registry = EndpointRegistry::new();
        registry
            .register(entry("c1", "sfn-a", ClientType::StreamFunction, vec![0x21]))
            .unwrap();

        let err = registry
            .register(entry("c2", "sfn-a", ClientType::StreamFunction, vec![0x21]))
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateName(_)));

        // Same name, different type is fine.
        registry
            .register(entry("c3", "sfn-a", ClientType::Source, vec![]))
            .unwrap();
    }

    #[test]
    fn rehandshake_replaces_previous_stream() {
        let registry = EndpointRegistry::new();
        let mut first = entry("c1", "sfn-a", ClientType::StreamFunction, vec![0x21]);
        first.session = 1;
        assert!(registry.register(first).unwrap().is_none());

        let mut second = entry("c1", "sfn-a", ClientType::StreamFunction, vec![0x21]);
        second.session = 2;
        let replaced = registry.register(second).unwrap().unwrap();
        assert_eq!(replaced.session, 1);
        assert_eq!(registry.len(), 1);

        // Stale cleanup from the replaced session is a no-op.
        registry.remove("c1", 1);
        assert_eq!(registry.len(), 1);
        registry.remove("c1", 2);
        assert!(registry.is_empty());
    }

    #[test]
    fn observers_filter_by_tag_and_sender() {
        let registry = EndpointRegistry::new();
        let mut a = entry("sfn-1", "a", ClientType::StreamFunction, vec![0x21]);
        a.session = 1;
        let mut b = entry("sfn-2", "b", ClientType::StreamFunction, vec![0x21, 0x22]);
        b.session = 2;
        let mut c = entry("sfn-3", "c", ClientType::StreamFunction, vec![0x22]);
        c.session = 3;
        let src = entry("src-1", "s", ClientType::Source, vec![]);
        for e in [a, b, c, src] {
            registry.register(e).unwrap();
        }

        let tagged: Vec<_> = registry
            .observers_of(0x21, "src-1")
            .into_iter()
            .map(|e| e.client_id)
            .collect();
        assert_eq!(tagged, vec!["sfn-1", "sfn-2"]);

        // A stream function never receives its own emission.
        let excluding: Vec<_> = registry
            .observers_of(0x22, "sfn-2")
            .into_iter()
            .map(|e| e.client_id)
            .collect();
        assert_eq!(excluding, vec!["sfn-3"]);

        // Sources are not observers.
        assert!(registry.observers_of(0x99, "nobody").is_empty());
    }
}
