use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};

use crate::types::Metric;

/// Create the bounded conduit between collection and transmission.
///
/// Enqueueing never blocks: a full queue drops the metric and bumps the
/// shared drop counter.
pub fn bounded(capacity: usize) -> (MetricSender, MetricReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let dropped = Arc::new(AtomicU64::new(0));
    (MetricSender { tx, dropped }, MetricReceiver { rx })
}

#[derive(Clone)]
pub struct MetricSender {
    tx: mpsc::Sender<Metric>,
    dropped: Arc<AtomicU64>,
}

impl MetricSender {
    /// Try to enqueue without waiting. Returns `false` when the metric was dropped.
    pub fn offer(&self, metric: Metric) -> bool {
        match self.tx.try_send(metric) {
            Ok(()) => true,
            Err(TrySendError::Full(m)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(metric = %m.name, "Metric queue is full, dropping metric");
                false
            }
            Err(TrySendError::Closed(m)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(metric = %m.name, "Metric queue closed, dropping metric");
                false
            }
        }
    }

    /// Metrics dropped since the queue was created
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Number of metrics currently waiting
    pub fn queued(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }
}

pub struct MetricReceiver {
    rx: mpsc::Receiver<Metric>,
}

impl MetricReceiver {
    /// Next metric, or `None` once every sender is gone and the queue is drained
    pub async fn recv(&mut self) -> Option<Metric> {
        self.rx.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Tags;
    use chrono::Utc;

    fn metric(i: usize) -> Metric {
        Metric::gauge(format!("m{}", i), i as f64, "count", Utc::now(), &Tags::new())
    }

    #[test]
    fn overflow_drops_without_blocking() {
        let (tx, _rx) = bounded(3);
        let accepted = (0..10).filter(|i| tx.offer(metric(*i))).count();

        assert_eq!(accepted, 3);
        assert_eq!(tx.dropped(), 7);
        assert_eq!(tx.queued(), 3);
    }

    #[tokio::test]
    async fn preserves_enqueue_order() {
        let (tx, mut rx) = bounded(10);
        for i in 0..5 {
            assert!(tx.offer(metric(i)));
        }
        drop(tx);

        let mut names = Vec::new();
        while let Some(m) = rx.recv().await {
            names.push(m.name);
        }
        assert_eq!(names, vec!["m0", "m1", "m2", "m3", "m4"]);
    }

    #[tokio::test]
    async fn space_frees_after_receive() {
        let (tx, mut rx) = bounded(1);
        assert!(tx.offer(metric(0)));
        assert!(!tx.offer(metric(1)));
        rx.recv().await.unwrap();
        assert!(tx.offer(metric(2)));
        assert_eq!(tx.dropped(), 1);
    }

    #[test]
    fn closed_queue_counts_as_drop() {
        let (tx, rx) = bounded(4);
        drop(rx);
        assert!(!tx.offer(metric(0)));
        assert_eq!(tx.dropped(), 1);
    }
}
