//! Prometheus metrics for the zipper.

use std::sync::Arc;

use measured::text::BufferedTextEncoder;
use measured::{Counter, MetricGroup};
use tokio::sync::Mutex;

#[derive(MetricGroup)]
#[metric(new())]
pub struct ZipperMetrics {
    pub connections_opened_total: Counter,
    pub connections_closed_total: Counter,

    pub handshakes_total: Counter,
    pub handshakes_rejected_total: Counter,

    pub frames_routed_total: Counter,
    pub backflow_frames_total: Counter,
    pub brokered_streams_total: Counter,
}

impl Default for ZipperMetrics {
    fn default() -> Self {
        Self::new()
    }
}

pub struct MetricsEncoder {
    encoder: Mutex<BufferedTextEncoder>,
    pub metrics: ZipperMetrics,
}

impl MetricsEncoder {
    #[must_use]
    pub fn new(metrics: ZipperMetrics) -> Self {
        Self {
            encoder: Mutex::default(),
            metrics,
        }
    }

    /// # Panics
    ///
    /// Panics if metric collection fails.
    pub async fn encode(&self) -> Vec<u8> {
        let mut encoder = self.encoder.lock().await;
        self.metrics.collect_group_into(&mut *encoder).unwrap();
        encoder.finish().to_vec()
    }
}

pub type SharedMetrics = Arc<MetricsEncoder>;

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn counters_appear_in_text_encoding() {
        let encoder = MetricsEncoder::new(ZipperMetrics::new());
        encoder.metrics.frames_routed_total.inc();
        encoder.metrics.frames_routed_total.inc();

        let text = String::from_utf8(encoder.encode().await).unwrap();
        assert!(text.contains("frames_routed_total"));
        assert!(text.contains('2'));
    }
}
