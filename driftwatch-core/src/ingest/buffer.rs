use std::time::{Duration, Instant};

use tokio::sync::{Mutex, mpsc};
use tracing::debug;

use crate::types::MetricResult;

/// Bounded staging buffer for streamed metric results.
///
/// Results accumulate until either the capacity is reached or the flush
/// interval has elapsed since the last flush; either trigger drains the
/// buffer as one batch to the receiver returned by [`MetricsBuffer::new`].
pub struct MetricsBuffer {
    capacity: usize,
    flush_interval: Duration,
    inner: Mutex<Inner>,
    tx: mpsc::Sender<Vec<MetricResult>>,
}

struct Inner {
    items: Vec<MetricResult>,
    last_flush: Instant,
}

impl MetricsBuffer {
    pub fn new(
        capacity: usize,
        flush_interval: Duration,
    ) -> (Self, mpsc::Receiver<Vec<MetricResult>>) {
        let (tx, rx) = mpsc::channel(16);
        let buffer = Self {
            capacity: capacity.max(1),
            flush_interval,
            inner: Mutex::new(Inner {
                items: Vec::new(),
                last_flush: Instant::now(),
            }),
            tx,
        };
        (buffer, rx)
    }

    pub async fn push(&self, item: MetricResult) {
        self.extend(std::iter::once(item)).await;
    }

    pub async fn extend(&self, items: impl IntoIterator<Item = MetricResult>) {
        let mut inner = self.inner.lock().await;
        inner.items.extend(items);
        if inner.items.len() >= self.capacity
            || inner.last_flush.elapsed() >= self.flush_interval
        {
            Self::drain(&mut inner, &self.tx).await;
        }
    }

    /// Force a flush regardless of the triggers.
    pub async fn flush(&self) {
        let mut inner = self.inner.lock().await;
        Self::drain(&mut inner, &self.tx).await;
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.items.len()
    }

    async fn drain(inner: &mut Inner, tx: &mpsc::Sender<Vec<MetricResult>>) {
        inner.last_flush = Instant::now();
        if inner.items.is_empty() {
            return;
        }
        let batch = std::mem::take(&mut inner.items);
        debug!(count = batch.len(), "flushing metrics buffer");
        if tx.send(batch).await.is_err() {
            debug!("metrics buffer receiver dropped");
        }
    }
}
