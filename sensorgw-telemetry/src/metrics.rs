//! ## sensorgw-telemetry::metrics
//! **Prometheus counters for the reactor's hot paths**
//!
//! Counters live in a private registry; `gather` renders the text
//! exposition format, which the periodic stats report logs.

use prometheus::{Encoder, Histogram, HistogramOpts, IntCounter, Registry, TextEncoder};

use crate::TelemetryError;

#[derive(Debug, Clone)]
pub struct GatewayMetrics {
    registry: Registry,
    pub connections_accepted: IntCounter,
    pub connections_closed: IntCounter,
    pub flood_closures: IntCounter,
    pub frames_decoded: IntCounter,
    pub frame_resyncs: IntCounter,
    pub checksum_failures: IntCounter,
    pub echo_frames: IntCounter,
    pub frames_discarded: IntCounter,
    pub publishes: IntCounter,
    pub publish_failures: IntCounter,
    pub broker_reconnects: IntCounter,
    pub document_bytes: Histogram,
}

fn counter(registry: &Registry, name: &str, help: &str) -> Result<IntCounter, prometheus::Error> {
    let counter = IntCounter::new(name, help)?;
    registry.register(Box::new(counter.clone()))?;
    Ok(counter)
}

impl GatewayMetrics {
    pub fn new() -> Result<Self, TelemetryError> {
        let registry = Registry::new();

        let document_bytes = Histogram::with_opts(
            HistogramOpts::new(
                "sensorgw_document_bytes",
                "Size of serialized reading documents",
            )
            .buckets(vec![32.0, 64.0, 96.0, 128.0, 256.0]),
        )?;
        registry.register(Box::new(document_bytes.clone()))?;

        Ok(Self {
            connections_accepted: counter(
                &registry,
                "sensorgw_connections_accepted_total",
                "Sensor connections accepted",
            )?,
            connections_closed: counter(
                &registry,
                "sensorgw_connections_closed_total",
                "Sensor connections closed for any reason",
            )?,
            flood_closures: counter(
                &registry,
                "sensorgw_flood_closures_total",
                "Connections closed by the inbound flood guard",
            )?,
            frames_decoded: counter(
                &registry,
                "sensorgw_frames_decoded_total",
                "Sensor frames with a valid checksum",
            )?,
            frame_resyncs: counter(
                &registry,
                "sensorgw_frame_resyncs_total",
                "Single-byte slides after a bad length field",
            )?,
            checksum_failures: counter(
                &registry,
                "sensorgw_checksum_failures_total",
                "Sensor frames discarded for a checksum mismatch",
            )?,
            echo_frames: counter(
                &registry,
                "sensorgw_echo_frames_total",
                "Length-prefixed frames echoed back",
            )?,
            frames_discarded: counter(
                &registry,
                "sensorgw_frames_discarded_total",
                "Length-prefixed frames dropped in discard mode",
            )?,
            publishes: counter(
                &registry,
                "sensorgw_publishes_total",
                "Messages handed to the broker client",
            )?,
            publish_failures: counter(
                &registry,
                "sensorgw_publish_failures_total",
                "Publish calls rejected by the broker client",
            )?,
            broker_reconnects: counter(
                &registry,
                "sensorgw_broker_reconnects_total",
                "Broker reconnect attempts",
            )?,
            document_bytes,
            registry,
        })
    }

    pub fn gather(&self) -> Result<String, TelemetryError> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_show_up_in_exposition() {
        let metrics = GatewayMetrics::new().unwrap();
        metrics.frames_decoded.inc();
        metrics.frames_decoded.inc();
        metrics.checksum_failures.inc();
        metrics.document_bytes.observe(45.0);

        let text = metrics.gather().unwrap();
        assert!(text.contains("sensorgw_frames_decoded_total 2"));
        assert!(text.contains("sensorgw_checksum_failures_total 1"));
        assert!(text.contains("sensorgw_document_bytes_count 1"));
    }

    #[test]
    fn test_instances_are_independent() {
        let a = GatewayMetrics::new().unwrap();
        let b = GatewayMetrics::new().unwrap();
        a.publishes.inc();
        assert_eq!(a.publishes.get(), 1);
        assert_eq!(b.publishes.get(), 0);
    }
}
