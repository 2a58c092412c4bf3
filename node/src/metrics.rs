//! # Prometheus Metrics
//!
//! Mirrors the engine's counters and the node's topology into a dedicated
//! [`prometheus::Registry`] (prefix `lattice_`). The engine keeps its own
//! atomics; [`LatticeMetrics::observe`] copies a status report in right before
//! each scrape, so nothing here sits on the message path.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use prometheus::core::Collector;
use prometheus::{
    Encoder, Gauge, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};

use lattice_protocol::node::NodeStatusReport;

use crate::api::AppState;

const DROP_REASONS: [&str; 5] = [
    "invalid_signature",
    "untrusted",
    "stale",
    "expired_key",
    "malformed",
];

#[derive(Clone)]
pub struct LatticeMetrics {
    registry: Registry,
    pub messages_sent_total: IntCounter,
    pub messages_verified_total: IntCounter,
    /// Inbound messages dropped before dispatch, by reason.
    pub messages_dropped_total: IntCounterVec,
    pub messages_forwarded_total: IntCounter,
    pub no_route_total: IntCounter,
    pub directives_dispatched_total: IntCounter,
    pub directives_unhandled_total: IntCounter,
    pub responses_resolved_total: IntCounter,
    pub responses_duplicate_total: IntCounter,
    pub directive_timeouts_total: IntCounter,
    pub pending_directives: IntGauge,
    pub known_nodes: IntGauge,
    pub connected_nodes: IntGauge,
    pub routes: IntGauge,
    pub trusted_nodes: IntGauge,
    /// `min(1, connected / 5)`.
    pub network_health: Gauge,
}

fn register<C: Collector + Clone + 'static>(registry: &Registry, metric: C) -> prometheus::Result<C> {
    registry.register(Box::new(metric.clone()))?;
    Ok(metric)
}

/// Advance a counter to an absolute value taken from the engine.
fn sync_counter(counter: &IntCounter, value: u64) {
    let current = counter.get();
    if value > current {
        counter.inc_by(value - current);
    }
}

fn gauge_len(gauge: &IntGauge, len: usize) {
    gauge.set(i64::try_from(len).unwrap_or(i64::MAX));
}

impl LatticeMetrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new_custom(Some("lattice".into()), None)?;
        let counter = |name: &str, help: &str| register(&registry, IntCounter::new(name, help)?);
        let gauge = |name: &str, help: &str| register(&registry, IntGauge::new(name, help)?);

        Ok(Self {
            messages_sent_total: counter("messages_sent_total", "Messages signed and queued")?,
            messages_verified_total: counter(
                "messages_verified_total",
                "Inbound messages that passed signature and freshness checks",
            )?,
            messages_dropped_total: register(
                &registry,
                IntCounterVec::new(
                    Opts::new("messages_dropped_total", "Inbound messages dropped, by reason"),
                    &["reason"],
                )?,
            )?,
            messages_forwarded_total: counter(
                "messages_forwarded_total",
                "Messages relayed on behalf of other nodes",
            )?,
            no_route_total: counter("no_route_total", "Messages with no usable next hop")?,
            directives_dispatched_total: counter(
                "directives_dispatched_total",
                "Directives handed to a registered handler",
            )?,
            directives_unhandled_total: counter(
                "directives_unhandled_total",
                "Directives for commands with no handler",
            )?,
            responses_resolved_total: counter(
                "responses_resolved_total",
                "Responses that completed a pending directive",
            )?,
            responses_duplicate_total: counter(
                "responses_duplicate_total",
                "Responses discarded as late or repeated",
            )?,
            directive_timeouts_total: counter(
                "directive_timeouts_total",
                "Directives that got no response in time",
            )?,
            pending_directives: gauge("pending_directives", "Directives awaiting a response")?,
            known_nodes: gauge("known_nodes", "Nodes in the registry")?,
            connected_nodes: gauge("connected_nodes", "Nodes currently considered reachable")?,
            routes: gauge("routes", "Entries in the routing table")?,
            trusted_nodes: gauge("trusted_nodes", "Nodes with a trusted verification key")?,
            network_health: register(
                &registry,
                Gauge::new("network_health", "Connectivity score between 0 and 1")?,
            )?,
            registry,
        })
    }

    /// Copy a status report into the registry.
    pub fn observe(&self, report: &NodeStatusReport) {
        let stats = &report.stats;
        sync_counter(&self.messages_sent_total, stats.sent);
        sync_counter(&self.messages_verified_total, stats.verified);
        let dropped = [
            stats.dropped_invalid_signature,
            stats.dropped_untrusted,
            stats.dropped_stale,
            stats.dropped_expired_key,
            stats.dropped_malformed,
        ];
        for (reason, value) in DROP_REASONS.into_iter().zip(dropped) {
            sync_counter(&self.messages_dropped_total.with_label_values(&[reason]), value);
        }
        sync_counter(&self.messages_forwarded_total, stats.forwarded);
        sync_counter(&self.no_route_total, stats.no_route);
        sync_counter(&self.directives_dispatched_total, stats.dispatched);
        sync_counter(&self.directives_unhandled_total, stats.unhandled);
        sync_counter(&self.responses_resolved_total, stats.resolved);
        sync_counter(&self.responses_duplicate_total, stats.duplicates);
        sync_counter(&self.directive_timeouts_total, stats.timeouts);

        gauge_len(&self.pending_directives, report.pending_directives);
        gauge_len(&self.known_nodes, report.network.known_nodes.len());
        gauge_len(&self.connected_nodes, report.network.connected.len());
        gauge_len(&self.routes, report.network.routing_table.len());
        gauge_len(&self.trusted_nodes, report.keys.trusted_nodes);
        self.network_health.set(report.network.health);
    }

    /// Encodes all registered metrics into the Prometheus text exposition format.
    pub fn encode(&self) -> prometheus::Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

/// `GET /metrics` in Prometheus text format, refreshed from the node first.
pub async fn metrics_handler(State(state): State<AppState>) -> Response {
    state.metrics.observe(&state.node.status());
    match state.metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(e) => {
            tracing::error!(error = %e, "failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, "metrics encoding failed").into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_only_move_forward() {
        let metrics = LatticeMetrics::new().unwrap();
        sync_counter(&metrics.messages_sent_total, 5);
        sync_counter(&metrics.messages_sent_total, 3);
        assert_eq!(metrics.messages_sent_total.get(), 5);
        sync_counter(&metrics.messages_sent_total, 9);
        assert_eq!(metrics.messages_sent_total.get(), 9);
    }

    #[test]
    fn encoded_output_is_prefixed() {
        let metrics = LatticeMetrics::new().unwrap();
        metrics.connected_nodes.set(2);
        metrics
            .messages_dropped_total
            .with_label_values(&["untrusted"])
            .inc();
        let text = metrics.encode().unwrap();
        assert!(text.contains("lattice_connected_nodes 2"));
        assert!(text.contains("lattice_messages_dropped_total{reason=\"untrusted\"} 1"));
    }
}
