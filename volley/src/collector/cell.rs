use super::values::MetricValues;
use metrics_util::AtomicBucket;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Mutex, PoisonError,
};
use volley_core::MetricKind;

/// Pending values of one metric plus their aggregate.
///
/// Recording is a lock-free push into the bucket; the lock only guards folding the pending
/// values into the aggregate, which happens on flush.
pub(crate) struct MetricCell {
    kind: MetricKind,
    pending: AtomicBucket<f64>,
    last: AtomicU64,
    values: Mutex<MetricValues>,
}

impl MetricCell {
    pub fn new(kind: MetricKind) -> Self {
        Self {
            kind,
            pending: AtomicBucket::new(),
            last: AtomicU64::new(0),
            values: Mutex::new(MetricValues::new(kind)),
        }
    }

    pub fn kind(&self) -> MetricKind {
        self.kind
    }

    pub fn push(&self, value: f64) {
        if self.kind == MetricKind::Gauge {
            self.last.store(value.to_bits(), Ordering::Relaxed);
        }
        self.pending.push(value);
    }

    /// Fold pending values into the aggregate, returning how many were dropped while doing so.
    pub fn flush(&self) -> u64 {
        let mut values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
        let before = values.dropped();
        let mut pushed = false;
        self.pending.clear_with(|chunk| {
            for value in chunk {
                pushed |= values.add(*value);
            }
        });
        if pushed && self.kind == MetricKind::Gauge {
            values.set_last(f64::from_bits(self.last.load(Ordering::Relaxed)));
        }
        values.dropped() - before
    }

    pub fn freeze(&self) -> (MetricValues, u64) {
        let dropped = self.flush();
        let values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
        (values.clone(), dropped)
    }
}
