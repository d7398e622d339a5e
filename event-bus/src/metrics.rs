//! Prometheus metrics for the event bus

use lazy_static::lazy_static;
use prometheus::{
    register_histogram_vec, register_int_counter_vec, HistogramVec, IntCounterVec,
};

lazy_static! {
    /// Total events published
    pub static ref EVENT_PUBLISH_TOTAL: IntCounterVec = register_int_counter_vec!(
        "event_bus_publish_total",
        "Total events published",
        &["routing_key", "status"]
    )
    .unwrap();

    /// Publish duration (until the persistence ack)
    pub static ref EVENT_PUBLISH_DURATION: HistogramVec = register_histogram_vec!(
        "event_bus_publish_duration_seconds",
        "Event publish duration in seconds",
        &["routing_key"]
    )
    .unwrap();

    /// Deliveries settled, by disposition
    pub static ref DELIVERY_TOTAL: IntCounterVec = register_int_counter_vec!(
        "event_bus_delivery_total",
        "Total deliveries settled",
        &["queue", "settlement"]
    )
    .unwrap();

    /// Handler processing duration
    pub static ref DELIVERY_PROCESS_DURATION: HistogramVec = register_histogram_vec!(
        "event_bus_process_duration_seconds",
        "Delivery processing duration in seconds",
        &["queue"]
    )
    .unwrap();
}
