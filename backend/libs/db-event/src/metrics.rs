use prometheus::{IntCounter, IntGauge, Opts};
use tracing::warn;

#[derive(Clone)]
pub struct ConsumerMetrics {
    pub committed: IntCounter,
    pub handler_failures: IntCounter,
    pub fetch_failures: IntCounter,
    pub committed_offset: IntGauge,
}

impl ConsumerMetrics {
    pub fn new(read_group: &str) -> Self {
        let registry = prometheus::default_registry();

        let committed = IntCounter::with_opts(
            Opts::new(
                "db_event_committed_total",
                "Total number of events handled and committed by the consumer",
            )
            .const_label("read_group", read_group.to_string()),
        )
        .expect("valid metric opts for db_event_committed_total");

        let handler_failures = IntCounter::with_opts(
            Opts::new(
                "db_event_handler_failures_total",
                "Total number of failed handler or cursor commit attempts",
            )
            .const_label("read_group", read_group.to_string()),
        )
        .expect("valid metric opts for db_event_handler_failures_total");

        let fetch_failures = IntCounter::with_opts(
            Opts::new(
                "db_event_fetch_failures_total",
                "Total number of failed fetch attempts",
            )
            .const_label("read_group", read_group.to_string()),
        )
        .expect("valid metric opts for db_event_fetch_failures_total");

        let committed_offset = IntGauge::with_opts(
            Opts::new(
                "db_event_committed_offset",
                "Id of the last event committed by this consumer",
            )
            .const_label("read_group", read_group.to_string()),
        )
        .expect("valid metric opts for db_event_committed_offset");

        for metric in [
            Box::new(committed.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(handler_failures.clone()),
            Box::new(fetch_failures.clone()),
            Box::new(committed_offset.clone()),
        ] {
            if let Err(e) = registry.register(metric) {
                warn!("Failed to register consumer metric: {}", e);
            }
        }

        Self {
            committed,
            handler_failures,
            fetch_failures,
            committed_offset,
        }
    }
}
