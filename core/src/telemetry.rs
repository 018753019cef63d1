use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "notify_core=info,runner_container=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Counters shared by the pollers and the dispatcher of one consumer.
#[derive(Debug, Default)]
pub struct ConsumerMetrics {
    batches_dispatched: AtomicU64,
    messages_dispatched: AtomicU64,
    commits: AtomicU64,
    retries: AtomicU64,
    empty_acks: AtomicU64,
    resolve_failures: AtomicU64,
    fetch_errors: AtomicU64,
    shutdown_rollbacks: AtomicU64,
}

impl ConsumerMetrics {
    pub fn record_dispatch(&self, messages: usize) {
        self.batches_dispatched.fetch_add(1, Ordering::Relaxed);
        self.messages_dispatched
            .fetch_add(messages as u64, Ordering::Relaxed);
    }

    pub fn record_commit(&self) {
        self.commits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_empty_ack(&self) {
        self.empty_acks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_resolve_failure(&self) {
        self.resolve_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fetch_error(&self) {
        self.fetch_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_shutdown_rollback(&self) {
        self.shutdown_rollbacks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            batches_dispatched: self.batches_dispatched.load(Ordering::Relaxed),
            messages_dispatched: self.messages_dispatched.load(Ordering::Relaxed),
            commits: self.commits.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            empty_acks: self.empty_acks.load(Ordering::Relaxed),
            resolve_failures: self.resolve_failures.load(Ordering::Relaxed),
            fetch_errors: self.fetch_errors.load(Ordering::Relaxed),
            shutdown_rollbacks: self.shutdown_rollbacks.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub batches_dispatched: u64,
    pub messages_dispatched: u64,
    pub commits: u64,
    pub retries: u64,
    pub empty_acks: u64,
    pub resolve_failures: u64,
    pub fetch_errors: u64,
    pub shutdown_rollbacks: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_counters() {
        let metrics = ConsumerMetrics::default();
        metrics.record_dispatch(3);
        metrics.record_dispatch(2);
        metrics.record_commit();
        metrics.record_retry();
        metrics.record_empty_ack();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.batches_dispatched, 2);
        assert_eq!(snapshot.messages_dispatched, 5);
        assert_eq!(snapshot.commits, 1);
        assert_eq!(snapshot.retries, 1);
        assert_eq!(snapshot.empty_acks, 1);
        assert_eq!(snapshot.fetch_errors, 0);

        let json = serde_json::to_value(snapshot).unwrap();
        assert_eq!(json["messages_dispatched"], 5);
    }
}
