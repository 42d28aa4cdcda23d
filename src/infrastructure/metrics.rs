//! Prometheus metrics

use metrics::{counter, describe_counter};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};
use std::net::SocketAddr;
use tracing::info;

/// Install the Prometheus exporter with its scrape endpoint
pub fn init_metrics(listen: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new().with_http_listener(listen).install()?;
    info!("Prometheus metrics exposed on {}", listen);
    describe_metrics();
    Ok(())
}

/// Register metric descriptions with the installed recorder
pub fn describe_metrics() {
    describe_counter!(
        "ims_options_total",
        "Capability OPTIONS requests by outcome"
    );
    describe_counter!(
        "ims_publish_total",
        "Presence PUBLISH cycles by outcome"
    );
    describe_counter!(
        "ims_subscribe_total",
        "SUBSCRIBE cycles by event package and outcome"
    );
    describe_counter!(
        "ims_chat_messages_total",
        "Chat messages handed to the media session by outcome"
    );
    describe_counter!(
        "ims_auth_challenges_total",
        "Digest challenges answered"
    );
}

/// Record the outcome of one capability OPTIONS request
pub fn record_options(outcome: &'static str) {
    counter!("ims_options_total", "outcome" => outcome).increment(1);
}

pub fn record_publish(outcome: &'static str) {
    counter!("ims_publish_total", "outcome" => outcome).increment(1);
}

pub fn record_subscribe(event: &'static str, outcome: &'static str) {
    counter!("ims_subscribe_total", "event" => event, "outcome" => outcome).increment(1);
}

pub fn record_chat_message(outcome: &'static str) {
    counter!("ims_chat_messages_total", "outcome" => outcome).increment(1);
}

pub fn record_auth_challenge(method: &'static str) {
    counter!("ims_auth_challenges_total", "method" => method).increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_without_recorder_is_noop() {
        describe_metrics();
        record_options("rcs_capable");
        record_publish("published");
        record_subscribe("presence", "subscribed");
        record_chat_message("sent");
        record_auth_challenge("PUBLISH");
    }
}
