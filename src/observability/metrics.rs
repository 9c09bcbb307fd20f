//! Prometheus metrics for the queue engine.
//!
//! Pool counters are owned by the pools themselves; [`Metrics::refresh`]
//! copies a registry snapshot into the Prometheus collectors right before
//! export.

use std::collections::HashSet;
use std::sync::{Mutex, PoisonError};
use std::time::Instant;

use prometheus::{
    Encoder, Gauge, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder,
};

use crate::queue::QueueSummary;

const QUEUE_LABELS: &[&str] = &["qid", "queue"];

pub struct Metrics {
    registry: Registry,
    started: Instant,

    /// Registered queues
    pub queues: IntGauge,
    /// Items queued or in flight per queue
    pub queue_items: IntGaugeVec,
    /// Running workers per queue
    pub queue_workers: IntGaugeVec,
    /// 1 while a queue is paused
    pub queue_paused: IntGaugeVec,
    pub queue_handled_total: IntCounterVec,
    pub queue_unhandled_total: IntCounterVec,
    pub queue_panics_total: IntCounterVec,
    pub queue_boosts_total: IntCounterVec,

    /// Admin API requests by route and status
    pub admin_requests_total: IntCounterVec,

    pub process_uptime_seconds: Gauge,

    /// Label sets exported by the previous refresh.
    seen: Mutex<HashSet<(String, String)>>,
}

fn queue_gauge(registry: &Registry, name: &str, help: &str) -> Result<IntGaugeVec, prometheus::Error> {
    let gauge = IntGaugeVec::new(Opts::new(name, help), QUEUE_LABELS)?;
    registry.register(Box::new(gauge.clone()))?;
    Ok(gauge)
}

fn queue_counter(registry: &Registry, name: &str, help: &str) -> Result<IntCounterVec, prometheus::Error> {
    let counter = IntCounterVec::new(Opts::new(name, help), QUEUE_LABELS)?;
    registry.register(Box::new(counter.clone()))?;
    Ok(counter)
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let queues = IntGauge::new("tokio_queue_queues", "Registered queues")?;
        registry.register(Box::new(queues.clone()))?;

        let admin_requests_total = IntCounterVec::new(
            Opts::new("tokio_queue_admin_requests_total", "Admin API requests"),
            &["route", "status"],
        )?;
        registry.register(Box::new(admin_requests_total.clone()))?;

        let process_uptime_seconds =
            Gauge::new("tokio_queue_process_uptime_seconds", "Process uptime in seconds")?;
        registry.register(Box::new(process_uptime_seconds.clone()))?;

        Ok(Self {
            queue_items: queue_gauge(&registry, "tokio_queue_items", "Items queued or in flight")?,
            queue_workers: queue_gauge(&registry, "tokio_queue_workers", "Running workers")?,
            queue_paused: queue_gauge(&registry, "tokio_queue_paused", "Whether the queue is paused")?,
            queue_handled_total: queue_counter(
                &registry,
                "tokio_queue_handled_total",
                "Items the handler accepted",
            )?,
            queue_unhandled_total: queue_counter(
                &registry,
                "tokio_queue_unhandled_total",
                "Items the handler returned unhandled",
            )?,
            queue_panics_total: queue_counter(
                &registry,
                "tokio_queue_handler_panics_total",
                "Handler invocations that panicked",
            )?,
            queue_boosts_total: queue_counter(
                &registry,
                "tokio_queue_boosts_total",
                "Temporary worker boosts",
            )?,
            registry,
            started: Instant::now(),
            queues,
            admin_requests_total,
            process_uptime_seconds,
            seen: Mutex::new(HashSet::new()),
        })
    }

    /// Copy a registry snapshot into the collectors.
    ///
    /// Series of queues missing from `summaries` are removed.
    pub fn refresh(&self, summaries: &[QueueSummary]) {
        let mut seen = self.seen.lock().unwrap_or_else(PoisonError::into_inner);
        let mut current = HashSet::with_capacity(summaries.len());

        for s in summaries {
            let qid = s.qid.to_string();
            let labels = [qid.as_str(), s.name.as_str()];

            self.queue_items.with_label_values(&labels).set(s.in_queue);
            self.queue_workers.with_label_values(&labels).set(s.workers as i64);
            self.queue_paused.with_label_values(&labels).set(i64::from(s.paused));
            catch_up(&self.queue_handled_total, &labels, s.stats.handled);
            catch_up(&self.queue_unhandled_total, &labels, s.stats.unhandled);
            catch_up(&self.queue_panics_total, &labels, s.stats.panics);
            catch_up(&self.queue_boosts_total, &labels, s.stats.boosts);

            current.insert((qid, s.name.clone()));
        }

        for (qid, name) in seen.difference(&current) {
            let labels = [qid.as_str(), name.as_str()];
            for gauge in [&self.queue_items, &self.queue_workers, &self.queue_paused] {
                let _ = gauge.remove_label_values(&labels);
            }
            for counter in [
                &self.queue_handled_total,
                &self.queue_unhandled_total,
                &self.queue_panics_total,
                &self.queue_boosts_total,
            ] {
                let _ = counter.remove_label_values(&labels);
            }
        }

        self.queues.set(summaries.len() as i64);
        self.process_uptime_seconds.set(self.started.elapsed().as_secs_f64());
        *seen = current;
    }

    pub fn record_admin_request(&self, route: &str, status: u16) {
        self.admin_requests_total
            .with_label_values(&[route, &status.to_string()])
            .inc();
    }

    /// Export metrics in Prometheus text format.
    pub fn export(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

/// Advance a counter to an absolute value taken from a pool.
fn catch_up(counter: &IntCounterVec, labels: &[&str], value: u64) {
    let counter = counter.with_label_values(labels);
    let current = counter.get();
    if value > current {
        counter.inc_by(value - current);
    }
}
