use std::sync::{Arc, OnceLock};

use prometheus::{CounterVec, Encoder, Opts, Registry, TextEncoder};

#[derive(Clone, Debug)]
pub struct MetricsRegistry {
    inner: Arc<MetricsInner>,
}

#[derive(Debug)]
struct MetricsInner {
    registry: Registry,
    cache_batches_added: CounterVec,
    cache_batches_pulled: CounterVec,
    cache_rows_added: CounterVec,
    kernel_rows_in: CounterVec,
    kernel_rows_out: CounterVec,
    executor_tasks_completed: CounterVec,
    executor_tasks_failed: CounterVec,
    shuffle_partitions_sent: CounterVec,
    shuffle_partitions_received: CounterVec,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner::new()),
        }
    }

    pub fn record_cache_add(&self, cache: &str, rows: u64) {
        let labels = [cache];
        self.inner
            .cache_batches_added
            .with_label_values(&labels)
            .inc();
        self.inner
            .cache_rows_added
            .with_label_values(&labels)
            .inc_by(rows as f64);
    }

    pub fn record_cache_pull(&self, cache: &str) {
        self.inner
            .cache_batches_pulled
            .with_label_values(&[cache])
            .inc();
    }

    pub fn record_kernel_io(&self, query_id: &str, kernel_id: u64, rows_in: u64, rows_out: u64) {
        let labels = [query_id, &kernel_id.to_string()];
        self.inner
            .kernel_rows_in
            .with_label_values(&labels)
            .inc_by(rows_in as f64);
        self.inner
            .kernel_rows_out
            .with_label_values(&labels)
            .inc_by(rows_out as f64);
    }

    pub fn record_task_completion(&self, kernel_id: u64, succeeded: bool) {
        let kernel = kernel_id.to_string();
        let labels = [kernel.as_str()];
        if succeeded {
            self.inner
                .executor_tasks_completed
                .with_label_values(&labels)
                .inc();
        } else {
            self.inner
                .executor_tasks_failed
                .with_label_values(&labels)
                .inc();
        }
    }

    pub fn record_shuffle_sent(&self, query_id: &str, kernel_id: u64, partitions: u64) {
        let labels = [query_id, &kernel_id.to_string()];
        self.inner
            .shuffle_partitions_sent
            .with_label_values(&labels)
            .inc_by(partitions as f64);
    }

    pub fn record_shuffle_received(&self, query_id: &str, kernel_id: u64, partitions: u64) {
        let labels = [query_id, &kernel_id.to_string()];
        self.inner
            .shuffle_partitions_received
            .with_label_values(&labels)
            .inc_by(partitions as f64);
    }

    pub fn render_prometheus(&self) -> String {
        let metric_families = self.inner.registry.gather();
        let mut out = Vec::new();
        let enc = TextEncoder::new();
        if enc.encode(&metric_families, &mut out).is_err() {
            return String::new();
        }
        String::from_utf8_lossy(&out).to_string()
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsInner {
    fn new() -> Self {
        let registry = Registry::new();

        let cache_batches_added = counter_vec(
            &registry,
            "gfq_cache_batches_added_total",
            "Batches pushed into caches",
            &["cache"],
        );
        let cache_batches_pulled = counter_vec(
            &registry,
            "gfq_cache_batches_pulled_total",
            "Batches pulled out of caches",
            &["cache"],
        );
        let cache_rows_added = counter_vec(
            &registry,
            "gfq_cache_rows_added_total",
            "Rows pushed into caches",
            &["cache"],
        );
        let kernel_rows_in = counter_vec(
            &registry,
            "gfq_kernel_rows_in_total",
            "Rows consumed by kernel tasks",
            &["query_id", "kernel_id"],
        );
        let kernel_rows_out = counter_vec(
            &registry,
            "gfq_kernel_rows_out_total",
            "Rows emitted by kernel tasks",
            &["query_id", "kernel_id"],
        );
        let executor_tasks_completed = counter_vec(
            &registry,
            "gfq_executor_tasks_completed_total",
            "Kernel tasks that completed successfully",
            &["kernel_id"],
        );
        let executor_tasks_failed = counter_vec(
            &registry,
            "gfq_executor_tasks_failed_total",
            "Kernel tasks that raised an error",
            &["kernel_id"],
        );
        let shuffle_partitions_sent = counter_vec(
            &registry,
            "gfq_shuffle_partitions_sent_total",
            "Partitions shipped to peer nodes",
            &["query_id", "kernel_id"],
        );
        let shuffle_partitions_received = counter_vec(
            &registry,
            "gfq_shuffle_partitions_received_total",
            "Partitions delivered from peer nodes",
            &["query_id", "kernel_id"],
        );

        Self {
            registry,
            cache_batches_added,
            cache_batches_pulled,
            cache_rows_added,
            kernel_rows_in,
            kernel_rows_out,
            executor_tasks_completed,
            executor_tasks_failed,
            shuffle_partitions_sent,
            shuffle_partitions_received,
        }
    }
}

fn counter_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> CounterVec {
    let c = CounterVec::new(Opts::new(name, help), labels).expect("counter vec");
    registry
        .register(Box::new(c.clone()))
        .expect("register counter");
    c
}

static GLOBAL_METRICS: OnceLock<MetricsRegistry> = OnceLock::new();

pub fn global_metrics() -> &'static MetricsRegistry {
    GLOBAL_METRICS.get_or_init(MetricsRegistry::new)
}
