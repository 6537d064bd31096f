pub(crate) const METRIC_ALIVE: &str = "heartbeat_alive";
pub(crate) const METRIC_PROBES: &str = "heartbeat_probes_total";
pub(crate) const METRIC_ACK_TIMEOUTS: &str = "heartbeat_ack_timeouts_total";

pub(crate) fn emit_alive(alive: bool) {
    metrics::gauge!(METRIC_ALIVE).set(if alive { 1.0 } else { 0.0 });
}

pub(crate) fn emit_probe_issued() {
    metrics::counter!(METRIC_PROBES).increment(1);
}

pub(crate) fn emit_ack_timeout() {
    metrics::counter!(METRIC_ACK_TIMEOUTS).increment(1);
}
