// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Optional Prometheus instrumentation of the engine's own operation,
//! gated behind the `metrics` feature (default off). Matches the
//! teacher's own `tracing`-always-on, `prometheus`-opt-in split: this is
//! ambient instrumentation of the engine itself, not the job-queue or
//! event-emitter consumer surface the spec leaves external.
//!
//! Call sites (in [`crate::runner`]) call these functions unconditionally;
//! with the feature off they compile to nothing.

#[cfg(feature = "metrics")]
mod enabled {
    use prometheus::{Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry};
    use std::sync::LazyLock;

    pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

    static TASKS_STARTED: LazyLock<IntCounter> = LazyLock::new(|| {
        let counter = IntCounter::new("taskgraph_tasks_started_total", "Tasks started").unwrap();
        REGISTRY.register(Box::new(counter.clone())).ok();
        counter
    });
    static TASKS_COMPLETED: LazyLock<IntCounter> = LazyLock::new(|| {
        let counter =
            IntCounter::new("taskgraph_tasks_completed_total", "Tasks completed").unwrap();
        REGISTRY.register(Box::new(counter.clone())).ok();
        counter
    });
    static TASKS_FAILED: LazyLock<IntCounterVec> = LazyLock::new(|| {
        let counter = IntCounterVec::new(
            Opts::new("taskgraph_tasks_failed_total", "Tasks failed, by outcome"),
            &["outcome"],
        )
        .unwrap();
        REGISTRY.register(Box::new(counter.clone())).ok();
        counter
    });
    static CACHE_HITS: LazyLock<IntCounter> = LazyLock::new(|| {
        let counter = IntCounter::new("taskgraph_cache_hits_total", "Output cache hits").unwrap();
        REGISTRY.register(Box::new(counter.clone())).ok();
        counter
    });
    static CACHE_MISSES: LazyLock<IntCounter> = LazyLock::new(|| {
        let counter =
            IntCounter::new("taskgraph_cache_misses_total", "Output cache misses").unwrap();
        REGISTRY.register(Box::new(counter.clone())).ok();
        counter
    });
    static GRAPH_RUN_SECONDS: LazyLock<Histogram> = LazyLock::new(|| {
        let histogram = Histogram::with_opts(HistogramOpts::new(
            "taskgraph_graph_run_seconds",
            "Wall-clock duration of a whole graph run",
        ))
        .unwrap();
        REGISTRY.register(Box::new(histogram.clone())).ok();
        histogram
    });
    static LAYER_WIDTH: LazyLock<Histogram> = LazyLock::new(|| {
        let histogram = Histogram::with_opts(HistogramOpts::new(
            "taskgraph_layer_width",
            "Number of tasks scheduled concurrently within one topological wave",
        ))
        .unwrap();
        REGISTRY.register(Box::new(histogram.clone())).ok();
        histogram
    });

    pub fn record_task_started() {
        TASKS_STARTED.inc();
    }
    pub fn record_task_completed() {
        TASKS_COMPLETED.inc();
    }
    pub fn record_task_failed(outcome: &str) {
        TASKS_FAILED.with_label_values(&[outcome]).inc();
    }
    pub fn record_cache_hit() {
        CACHE_HITS.inc();
    }
    pub fn record_cache_miss() {
        CACHE_MISSES.inc();
    }
    pub fn record_graph_run_seconds(seconds: f64) {
        GRAPH_RUN_SECONDS.observe(seconds);
    }
    pub fn record_layer_width(width: usize) {
        LAYER_WIDTH.observe(width as f64);
    }
}

#[cfg(not(feature = "metrics"))]
mod enabled {
    pub fn record_task_started() {}
    pub fn record_task_completed() {}
    pub fn record_task_failed(_outcome: &str) {}
    pub fn record_cache_hit() {}
    pub fn record_cache_miss() {}
    pub fn record_graph_run_seconds(_seconds: f64) {}
    pub fn record_layer_width(_width: usize) {}
}

pub use enabled::*;

#[cfg(all(test, feature = "metrics"))]
mod tests {
    use super::*;

    #[test]
    fn registry_gathers_registered_families() {
        record_task_started();
        record_cache_hit();
        record_layer_width(3);
        let families = enabled::REGISTRY.gather();
        let names: Vec<&str> = families.iter().map(|f| f.get_name()).collect();
        assert!(names.contains(&"taskgraph_tasks_started_total"));
        assert!(names.contains(&"taskgraph_layer_width"));
    }
}
