//! End-to-end trace propagation.
//!
//! Sources stamp every outbound data frame with a `tid`/`sid` pair. With a
//! configured [`Tracer`] the ids come from a real span and `traced` is set;
//! without one, fresh random ids are generated per frame and `traced`
//! stays false so downstream collectors can tell the difference.

use rand::RngCore;

/// Trace and span ids for one hop, hex-encoded in the OTel widths
/// (16-byte trace id, 8-byte span id).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpanContext {
    pub trace_id: String,
    pub span_id: String,
}

/// Span factory installed via the client options.
pub trait Tracer: Send + Sync {
    /// Start a span for one outbound frame; `name` is the emitting
    /// endpoint's name.
    fn start_span(&self, name: &str) -> SpanContext;
}

fn hex(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        use std::fmt::Write;
        let _ = write!(s, "{b:02x}");
    }
    s
}

/// A fresh random 16-byte trace id.
#[must_use]
pub fn random_trace_id() -> String {
    let mut bytes = [0u8; 16];
    rand::rng().fill_bytes(&mut bytes);
    hex(&bytes)
}

/// A fresh random 8-byte span id.
#[must_use]
pub fn random_span_id() -> String {
    let mut bytes = [0u8; 8];
    rand::rng().fill_bytes(&mut bytes);
    hex(&bytes)
}

/// Tracer producing random ids; useful as a provider when no external
/// tracing backend is wired up.
#[derive(Debug, Clone, Copy, Default)]
pub struct RandomTracer;

impl Tracer for RandomTracer {
    fn start_span(&self, _name: &str) -> SpanContext {
        SpanContext {
            trace_id: random_trace_id(),
            span_id: random_span_id(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_widths() {
        assert_eq!(random_trace_id().len(), 32);
        assert_eq!(random_span_id().len(), 16);
    }

    #[test]
    fn ids_are_unique() {
        assert_ne!(random_trace_id(), random_trace_id());
    }

    #[test]
    fn random_tracer_spans() {
        let span = RandomTracer.start_span("source");
        assert_eq!(span.trace_id.len(), 32);
        assert_eq!(span.span_id.len(), 16);
    }
}
