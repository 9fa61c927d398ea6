use metrics::{counter, describe_counter, describe_gauge, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;

/// Initialize metrics with descriptions
pub fn init_metrics() {
    describe_counter!(
        "voice_datagrams_received_total",
        "Total number of datagrams read from the public socket"
    );
    describe_counter!(
        "voice_bytes_received_total",
        "Total number of bytes read from the public socket"
    );
    describe_counter!(
        "voice_datagrams_relayed_total",
        "Total number of datagrams relayed, by direction"
    );
    describe_counter!(
        "voice_bytes_relayed_total",
        "Total number of bytes relayed, by direction"
    );
    describe_counter!(
        "voice_datagrams_discarded_total",
        "Total number of datagrams dropped without relaying, by reason"
    );
    describe_counter!(
        "voice_bridges_opened_total",
        "Total number of session bridges established"
    );
    describe_gauge!("voice_active_bridges", "Number of session bridges currently running");
}

/// Start Prometheus metrics server on given address
pub fn start_metrics_server(addr: &str) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let addr: std::net::SocketAddr = addr.parse()?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    init_metrics();

    Ok(())
}

/// Which way a datagram travelled through a bridge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Client datagram forwarded to its backend
    ToBackend,
    /// Backend reply forwarded to the client
    ToClient,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::ToBackend => "to_backend",
            Direction::ToClient => "to_client",
        }
    }
}

pub struct Metrics;

impl Metrics {
    #[inline]
    pub fn record_received(bytes: usize) {
        counter!("voice_datagrams_received_total").increment(1);
        counter!("voice_bytes_received_total").increment(bytes as u64);
    }

    #[inline]
    pub fn record_relayed(direction: Direction, bytes: usize) {
        let labels = [("direction", direction.as_str())];

        counter!("voice_datagrams_relayed_total", &labels).increment(1);
        counter!("voice_bytes_relayed_total", &labels).increment(bytes as u64);
    }

    #[inline]
    pub fn record_discarded(reason: &'static str) {
        counter!("voice_datagrams_discarded_total", "reason" => reason).increment(1);
    }

    #[inline]
    pub fn record_bridge_opened() {
        counter!("voice_bridges_opened_total").increment(1);
    }

    #[inline]
    pub fn set_active_bridges(count: u64) {
        gauge!("voice_active_bridges").set(count as f64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use metrics::{
        Counter, Gauge, Histogram, Key, KeyName, Metadata, Recorder, SharedString, Unit,
    };
    use parking_lot::Mutex;
    use std::collections::BTreeSet;

    #[derive(Default)]
    struct NameRecorder {
        described: Mutex<BTreeSet<String>>,
        registered: Mutex<BTreeSet<String>>,
    }

    impl Recorder for NameRecorder {
        fn describe_counter(&self, key: KeyName, _: Option<Unit>, _: SharedString) {
            self.described.lock().insert(key.as_str().to_string());
        }

        fn describe_gauge(&self, key: KeyName, _: Option<Unit>, _: SharedString) {
            self.described.lock().insert(key.as_str().to_string());
        }

        fn describe_histogram(&self, key: KeyName, _: Option<Unit>, _: SharedString) {
            self.described.lock().insert(key.as_str().to_string());
        }

        fn register_counter(&self, key: &Key, _: &Metadata<'_>) -> Counter {
            self.registered.lock().insert(key.name().to_string());
            Counter::noop()
        }

        fn register_gauge(&self, key: &Key, _: &Metadata<'_>) -> Gauge {
            self.registered.lock().insert(key.name().to_string());
            Gauge::noop()
        }

        fn register_histogram(&self, key: &Key, _: &Metadata<'_>) -> Histogram {
            self.registered.lock().insert(key.name().to_string());
            Histogram::noop()
        }
    }

    #[test]
    fn test_every_recorded_metric_is_described() {
        let recorder = NameRecorder::default();

        metrics::with_local_recorder(&recorder, || {
            init_metrics();
            Metrics::record_received(64);
            Metrics::record_relayed(Direction::ToBackend, 64);
            Metrics::record_relayed(Direction::ToClient, 32);
            Metrics::record_discarded("bad_magic");
            Metrics::record_bridge_opened();
            Metrics::set_active_bridges(1);
        });

        let described = recorder.described.lock();
        let registered = recorder.registered.lock();
        assert!(registered.contains("voice_bytes_received_total"));
        for name in registered.iter() {
            assert!(described.contains(name), "{} is not described", name);
        }
    }
}
