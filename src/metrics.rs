//! Observability hooks: Prometheus metrics (via OpenTelemetry) and `tracing` span helpers.
//!
//! Metrics are registered in a crate-owned Prometheus registry; scrape them with
//! [`TidemarkMetrics::encode_text`].

#[cfg(feature = "metrics")]
pub use self::prom::{TidemarkMetrics, METRICS};

#[cfg(feature = "metrics")]
mod prom {
    use once_cell::sync::Lazy;
    use opentelemetry::{
        metrics::{Counter, Histogram, Meter, MeterProvider as _},
        KeyValue,
    };
    use opentelemetry_sdk::metrics::SdkMeterProvider;
    use prometheus::{Encoder, Registry, TextEncoder};
    use std::time::Duration;

    pub static METRICS: Lazy<TidemarkMetrics> = Lazy::new(TidemarkMetrics::init);

    pub struct TidemarkMetrics {
        pub registry: Registry,
        // Dropping the provider shuts the reader down
        _provider: Option<SdkMeterProvider>,
        pub queries_total: Counter<u64>,
        pub query_errors_total: Counter<u64>,
        pub query_duration: Histogram<f64>,
        pub migrations_applied_total: Counter<u64>,
        pub migrations_failed_total: Counter<u64>,
        pub migration_duration: Histogram<f64>,
        pub lock_wait_duration: Histogram<f64>,
    }

    impl TidemarkMetrics {
        pub fn init() -> Self {
            let registry = Registry::new();
            let exporter = opentelemetry_prometheus::exporter()
                .with_registry(registry.clone())
                .build();

            let (provider, meter): (Option<SdkMeterProvider>, Meter) = match exporter {
                Ok(exporter) => {
                    let provider = SdkMeterProvider::builder().with_reader(exporter).build();
                    let meter = provider.meter("tidemark");
                    (Some(provider), meter)
                }
                Err(e) => {
                    log::warn!("prometheus exporter unavailable, metrics disabled: {e}");
                    (None, opentelemetry::global::meter("tidemark"))
                }
            };

            let queries_total = meter.u64_counter("tidemark_queries_total")
                .with_description("Total statements executed").build();

            let query_errors_total = meter.u64_counter("tidemark_query_errors_total")
                .with_description("Statements that returned an error").build();

            let query_duration = meter.f64_histogram("tidemark_query_duration_seconds")
                .with_description("Duration of statements").build();

            let migrations_applied_total = meter.u64_counter("tidemark_migrations_applied_total")
                .with_description("Migrations applied successfully").build();

            let migrations_failed_total = meter.u64_counter("tidemark_migrations_failed_total")
                .with_description("Migrations that failed or were cancelled mid-way").build();

            let migration_duration = meter.f64_histogram("tidemark_migration_duration_seconds")
                .with_description("Duration of individual migrations").build();

            let lock_wait_duration = meter.f64_histogram("tidemark_lock_wait_seconds")
                .with_description("Time spent waiting for the migration lock").build();

            Self {
                registry,
                _provider: provider,
                queries_total,
                query_errors_total,
                query_duration,
                migrations_applied_total,
                migrations_failed_total,
                migration_duration,
                lock_wait_duration,
            }
        }

        pub fn record_query_duration(&self, elapsed: Duration) {
            self.queries_total.add(1, &[]);
            self.query_duration.record(elapsed.as_secs_f64(), &[]);
        }

        pub fn record_query_error(&self) {
            self.query_errors_total.add(1, &[]);
        }

        pub fn record_migration_applied(&self, schema: &str, elapsed: Duration) {
            let labels = [KeyValue::new("schema", schema.to_string())];
            self.migrations_applied_total.add(1, &labels);
            self.migration_duration.record(elapsed.as_secs_f64(), &labels);
        }

        pub fn record_migration_failed(&self, schema: &str) {
            self.migrations_failed_total
                .add(1, &[KeyValue::new("schema", schema.to_string())]);
        }

        pub fn observe_lock_wait(&self, duration: Duration) {
            self.lock_wait_duration.record(duration.as_secs_f64(), &[]);
        }

        /// Render every registered metric in the Prometheus text exposition format
        pub fn encode_text(&self) -> String {
            let mut buffer = Vec::new();
            if let Err(e) = TextEncoder::new().encode(&self.registry.gather(), &mut buffer) {
                log::warn!("failed to encode metrics: {e}");
            }
            String::from_utf8_lossy(&buffer).into_owned()
        }
    }
}

/// Span constructors shared by the executor, the lock coordinator and the migrator.
#[cfg(feature = "tracing")]
pub mod tracing_helpers {
    use tracing::{info_span, Span};

    const MAX_SQL_IN_SPAN: usize = 200;

    pub fn execute_query_span(sql: &str) -> Span {
        info_span!("tidemark.query", sql = %truncate(sql.trim(), MAX_SQL_IN_SPAN))
    }

    pub fn acquire_connection_span() -> Span {
        info_span!("tidemark.connect")
    }

    pub fn acquire_lock_span(schema: &str, table: &str) -> Span {
        info_span!("tidemark.lock", schema = %schema, table = %table)
    }

    pub fn apply_migration_span(schema: &str, version: &str, description: &str) -> Span {
        info_span!(
            "tidemark.migration",
            schema = %schema,
            version = %version,
            description = %description
        )
    }

    fn truncate(s: &str, max: usize) -> &str {
        if s.len() <= max {
            return s;
        }
        let mut end = max;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        &s[..end]
    }

}

#[cfg(all(test, feature = "metrics"))]
mod tests {
    use super::METRICS;
    use std::time::Duration;

    #[test]
    fn recorded_migrations_show_up_in_text_output() {
        METRICS.record_migration_applied("metrics_test", Duration::from_millis(5));
        METRICS.observe_lock_wait(Duration::from_millis(1));
        let text = METRICS.encode_text();
        assert!(text.contains("tidemark_migrations_applied"), "{text}");
    }
}
