use lazy_static::lazy_static;
use prometheus::{Counter, Encoder, Histogram, HistogramOpts, Opts, Registry, TextEncoder};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();
    pub static ref MQTT_MESSAGES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "hub_mqtt_messages_total",
        "Total messages received from the broker"
    ))
    .unwrap();
    pub static ref MQTT_ACCEPTED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "hub_mqtt_accepted_total",
        "Broker messages that passed token verification and were queued"
    ))
    .unwrap();
    pub static ref MQTT_REJECTED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "hub_mqtt_rejected_total",
        "Broker messages dropped for malformed payload or failed auth"
    ))
    .unwrap();
    pub static ref HTTP_INGEST_TOTAL: Counter = Counter::with_opts(Opts::new(
        "hub_http_ingest_total",
        "Readings accepted over the HTTP transport"
    ))
    .unwrap();
    pub static ref DB_FAILURES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "hub_db_failures_total",
        "Total telemetry insert failures"
    ))
    .unwrap();
    pub static ref CHANNEL_FULL_TOTAL: Counter = Counter::with_opts(Opts::new(
        "hub_channel_full_total",
        "Times the broker handoff channel was full (backpressure events)"
    ))
    .unwrap();
    pub static ref INGEST_LATENCY_SECONDS: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "hub_ingest_latency_seconds",
            "Time taken to persist one reading"
        )
        .buckets(vec![
            0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0
        ])
    )
    .unwrap();
}

pub fn init_metrics() {
    REGISTRY
        .register(Box::new(MQTT_MESSAGES_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(MQTT_ACCEPTED_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(MQTT_REJECTED_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(HTTP_INGEST_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(DB_FAILURES_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(CHANNEL_FULL_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(INGEST_LATENCY_SECONDS.clone()))
        .unwrap();
}

pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer).unwrap();
    String::from_utf8(buffer).unwrap()
}
