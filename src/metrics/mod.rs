//! Prometheus metrics for the coordination recipes
//!
//! All collectors live in the default prometheus registry; [`gather_metrics`]
//! renders them in the text exposition format for whatever endpoint the embedding
//! application exposes.


use lazy_static::lazy_static;
use prometheus::exponential_buckets;
use prometheus::register_histogram_vec;
use prometheus::register_int_counter_vec;
use prometheus::Encoder;
use prometheus::HistogramVec;
use prometheus::IntCounterVec;
use tracing::error;

lazy_static! {
    pub static ref CONNECT_ATTEMPTS: IntCounterVec = register_int_counter_vec!(
        "coord_connect_attempts",
        "Initial session connect attempts by outcome",
        &["outcome"]
    )
    .expect("metric can not be created");

    pub static ref WRITE_REQUESTS: IntCounterVec = register_int_counter_vec!(
        "coord_write_requests",
        "Committed write requests by commit path and outcome",
        &["path", "outcome"]
    )
    .expect("metric can not be created");

    pub static ref LOCK_CONTENDED: IntCounterVec = register_int_counter_vec!(
        "coord_lock_contended",
        "Lock acquire attempts that found the lock already held",
        &["lock"]
    )
    .expect("metric can not be created");

    pub static ref LOCK_WAIT_MS: HistogramVec = register_histogram_vec!(
        "coord_lock_wait_ms",
        "Histogram of time spent waiting to acquire a lock in ms",
        &["lock"],
        exponential_buckets(1.0, 2.0, 16).expect("valid buckets")
    )
    .expect("metric can not be created");

    pub static ref QUEUE_CLAIMS: IntCounterVec = register_int_counter_vec!(
        "coord_queue_claims",
        "Queue entry claim attempts by outcome",
        &["queue", "outcome"]
    )
    .expect("metric can not be created");
}

/// Export metrics for Prometheus to scrape
pub fn gather_metrics() -> String {
    let encoder = prometheus::TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&prometheus::gather(), &mut buffer) {
        error!("could not encode prometheus metrics: {}", e);
    }
    match String::from_utf8(buffer) {
        Ok(v) => v,
        Err(e) => {
            error!("prometheus metrics could not be from_utf8'd: {}", e);
            String::default()
        }
    }
}
