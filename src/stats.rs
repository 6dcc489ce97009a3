// Copyright 2018 TiKV Project Authors. Licensed under Apache-2.0.

//! Client metrics.
//!
//! The Prometheus integration is optional (feature `prometheus`). When disabled, this module
//! compiles to a no-op implementation.

#[cfg(feature = "prometheus")]
mod imp {
    use std::sync::OnceLock;
    use std::time::Duration;
    use std::time::Instant;

    use log::warn;
    use prometheus::register_histogram_vec;
    use prometheus::register_int_counter_vec;
    use prometheus::HistogramVec;
    use prometheus::IntCounterVec;

    use crate::Result;

    struct Metrics {
        request_duration: Option<HistogramVec>,
        failed_request_total: Option<IntCounterVec>,
        txn_cmd_total: Option<IntCounterVec>,
        backoff_sleep_duration: Option<HistogramVec>,
        lock_resolver_actions: Option<IntCounterVec>,
    }

    static METRICS: OnceLock<Metrics> = OnceLock::new();

    fn metrics() -> &'static Metrics {
        METRICS.get_or_init(Metrics::register)
    }

    impl Metrics {
        fn register_histogram_vec(
            name: &'static str,
            help: &'static str,
            labels: &'static [&'static str],
        ) -> Option<HistogramVec> {
            match register_histogram_vec!(name, help, labels) {
                Ok(v) => Some(v),
                Err(e) => {
                    warn!("failed to register prometheus histogram vec {name}: {e:?}");
                    None
                }
            }
        }

        fn register_int_counter_vec(
            name: &'static str,
            help: &'static str,
            labels: &'static [&'static str],
        ) -> Option<IntCounterVec> {
            match register_int_counter_vec!(name, help, labels) {
                Ok(v) => Some(v),
                Err(e) => {
                    warn!("failed to register prometheus counter vec {name}: {e:?}");
                    None
                }
            }
        }

        fn register() -> Metrics {
            Metrics {
                request_duration: Self::register_histogram_vec(
                    "percolator_request_duration_seconds",
                    "Bucketed histogram of region request duration",
                    &["type"],
                ),
                failed_request_total: Self::register_int_counter_vec(
                    "percolator_failed_request_total",
                    "Total number of region requests that failed in transport",
                    &["type"],
                ),
                txn_cmd_total: Self::register_int_counter_vec(
                    "percolator_txn_cmd_total",
                    "Total number of transaction commands",
                    &["type"],
                ),
                backoff_sleep_duration: Self::register_histogram_vec(
                    "percolator_backoff_sleep_duration_seconds",
                    "Bucketed histogram of backoff sleep duration",
                    &["type"],
                ),
                lock_resolver_actions: Self::register_int_counter_vec(
                    "percolator_lock_resolver_actions_total",
                    "Total number of lock resolver actions",
                    &["type"],
                ),
            }
        }
    }

    pub struct RequestStats {
        start: Instant,
        cmd: &'static str,
    }

    impl RequestStats {
        pub fn done<R>(&self, r: Result<R>) -> Result<R> {
            let metrics = metrics();
            if r.is_ok() {
                if let Some(duration) = metrics.request_duration.as_ref() {
                    duration
                        .with_label_values(&[self.cmd])
                        .observe(duration_to_sec(self.start.elapsed()));
                }
            } else if let Some(failed) = metrics.failed_request_total.as_ref() {
                failed.with_label_values(&[self.cmd]).inc();
            }
            r
        }
    }

    pub fn request_stats(cmd: &'static str) -> RequestStats {
        RequestStats {
            start: Instant::now(),
            cmd,
        }
    }

    pub fn inc_txn_cmd(cmd: &'static str) {
        if let Some(c) = metrics().txn_cmd_total.as_ref() {
            c.with_label_values(&[cmd]).inc();
        }
    }

    pub fn inc_lock_resolver(action: &'static str) {
        if let Some(c) = metrics().lock_resolver_actions.as_ref() {
            c.with_label_values(&[action]).inc();
        }
    }

    pub(crate) fn observe_backoff_sleep(kind: &'static str, duration: Duration) {
        if let Some(h) = metrics().backoff_sleep_duration.as_ref() {
            h.with_label_values(&[kind])
                .observe(duration_to_sec(duration));
        }
    }

    #[inline]
    fn duration_to_sec(d: Duration) -> f64 {
        let nanos = f64::from(d.subsec_nanos());
        d.as_secs() as f64 + (nanos / 1_000_000_000.0)
    }
}

#[cfg(not(feature = "prometheus"))]
mod imp {
    use crate::Result;

    #[derive(Debug, Default)]
    pub struct RequestStats;

    impl RequestStats {
        pub fn done<R>(&self, r: Result<R>) -> Result<R> {
            r
        }
    }

    pub fn request_stats(_cmd: &'static str) -> RequestStats {
        RequestStats
    }

    pub fn inc_txn_cmd(_cmd: &'static str) {}

    pub fn inc_lock_resolver(_action: &'static str) {}

    pub(crate) fn observe_backoff_sleep(_kind: &'static str, _duration: std::time::Duration) {}
}

pub use imp::*;
