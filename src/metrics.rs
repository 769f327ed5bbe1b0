//! Prometheus metrics — exposition for container orchestration. A
//! registry plus typed `Counter`/`Gauge` fields, with an `encode()`
//! method returning the OpenMetrics text body.

use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;
use std::sync::atomic::AtomicU64;

#[derive(Clone, Debug, Hash, PartialEq, Eq, prometheus_client::encoding::EncodeLabelSet)]
pub struct SlotLabel {
    pub slot_id: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, prometheus_client::encoding::EncodeLabelSet)]
pub struct ChannelLabel {
    pub channel: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, prometheus_client::encoding::EncodeLabelSet)]
pub struct RestartReasonLabel {
    pub slot_id: String,
    pub reason: String,
}

/// Thread-safe metrics registry. All fields use atomic types and are safe
/// to update from any thread or async task.
pub struct Metrics {
    pub registry: Registry,
    pub slots_managed: Gauge,
    pub slot_restarts: Family<RestartReasonLabel, Counter>,
    pub leads_found: Family<SlotLabel, Counter>,
    pub leads_kept: Family<SlotLabel, Counter>,
    pub leads_verified: Family<SlotLabel, Counter>,
    pub sink_events_accepted: Counter,
    pub sink_events_rejected: Counter,
    pub dispatcher_sent: Family<ChannelLabel, Counter>,
    pub dispatcher_failed: Family<ChannelLabel, Counter>,
    pub dispatcher_held: Family<ChannelLabel, Counter>,
}

impl Metrics {
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let slots_managed = Gauge::default();
        registry.register(
            "engyne_slots_managed",
            "Number of slot directories currently tracked by the supervisor",
            slots_managed.clone(),
        );

        let slot_restarts = Family::<RestartReasonLabel, Counter>::default();
        registry.register(
            "engyne_slot_restarts",
            "Total worker restarts by slot and reason",
            slot_restarts.clone(),
        );

        let leads_found = Family::<SlotLabel, Counter>::default();
        registry.register("engyne_leads_found", "Total raw leads observed per slot", leads_found.clone());

        let leads_kept = Family::<SlotLabel, Counter>::default();
        registry.register("engyne_leads_kept", "Total leads kept by the filter per slot", leads_kept.clone());

        let leads_verified = Family::<SlotLabel, Counter>::default();
        registry.register(
            "engyne_leads_verified",
            "Total leads verified per slot",
            leads_verified.clone(),
        );

        let sink_events_accepted = Counter::<u64, AtomicU64>::default();
        registry.register(
            "engyne_sink_events_accepted",
            "Total verified events accepted by the sink",
            sink_events_accepted.clone(),
        );

        let sink_events_rejected = Counter::<u64, AtomicU64>::default();
        registry.register(
            "engyne_sink_events_rejected",
            "Total verified events rejected by the sink (bad secret)",
            sink_events_rejected.clone(),
        );

        let dispatcher_sent = Family::<ChannelLabel, Counter>::default();
        registry.register("engyne_dispatcher_sent", "Total deliveries sent per channel", dispatcher_sent.clone());

        let dispatcher_failed = Family::<ChannelLabel, Counter>::default();
        registry.register(
            "engyne_dispatcher_failed",
            "Total delivery failures per channel",
            dispatcher_failed.clone(),
        );

        let dispatcher_held = Family::<ChannelLabel, Counter>::default();
        registry.register(
            "engyne_dispatcher_held",
            "Total deliveries held for rate limiting per channel",
            dispatcher_held.clone(),
        );

        Self {
            registry,
            slots_managed,
            slot_restarts,
            leads_found,
            leads_kept,
            leads_verified,
            sink_events_accepted,
            sink_events_rejected,
            dispatcher_sent,
            dispatcher_failed,
            dispatcher_held,
        }
    }

    pub fn encode(&self) -> String {
        let mut buf = String::new();
        encode(&mut buf, &self.registry).expect("encoding metrics should not fail");
        buf
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_encode_returns_valid_text() {
        let m = Metrics::new();
        m.slots_managed.set(3);
        m.leads_found
            .get_or_create(&SlotLabel {
                slot_id: "s1".to_string(),
            })
            .inc();

        let output = m.encode();
        assert!(output.contains("engyne_slots_managed"));
        assert!(output.contains("engyne_leads_found"));
        assert!(output.contains("s1"));
    }

    #[test]
    fn restart_reasons_are_independent_series() {
        let m = Metrics::new();
        m.slot_restarts
            .get_or_create(&RestartReasonLabel {
                slot_id: "s1".to_string(),
                reason: "heartbeat_missing".to_string(),
            })
            .inc();
        m.slot_restarts
            .get_or_create(&RestartReasonLabel {
                slot_id: "s2".to_string(),
                reason: "process_exited".to_string(),
            })
            .inc_by(2);

        let output = m.encode();
        assert!(output.contains("heartbeat_missing"));
        assert!(output.contains("process_exited"));
    }
}
