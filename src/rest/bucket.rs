//! Per-resource rate-limit buckets.
//!
//! A bucket admits at most `limit` actions within any `window`, in arrival
//! order. A single request may need several buckets at once (say, a
//! per-channel send cap and the global cap); it fires only when every required
//! bucket has released it, coordinated through a shared [`AdmitGate`].

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug, Error)]
#[error("bucket queue is closed")]
pub struct BucketClosed;

/// Joint admission gate shared by every bucket a request must clear.
///
/// Each bucket admits the gate exactly once; the caller's future resolves only
/// after the admit count reaches the number of required buckets.
#[derive(Debug)]
pub struct AdmitGate {
    required: usize,
    admitted: AtomicUsize,
    opened_tx: Mutex<Option<oneshot::Sender<()>>>,
}

impl AdmitGate {
    /// Creates a gate requiring `required` admissions and the receiver that
    /// resolves once the gate is fully open.
    pub fn new(required: usize) -> (Arc<Self>, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        let gate = Arc::new(Self {
            required: required.max(1),
            admitted: AtomicUsize::new(0),
            opened_tx: Mutex::new(Some(tx)),
        });
        (gate, rx)
    }

    /// Records one bucket admission. Returns true when this admission opened
    /// the gate.
    pub fn admit(&self) -> bool {
        let seen = self.admitted.fetch_add(1, Ordering::AcqRel) + 1;
        if seen != self.required {
            return false;
        }
        let tx = self
            .opened_tx
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .take();
        if let Some(tx) = tx {
            let _ = tx.send(());
        }
        true
    }

    pub fn is_open(&self) -> bool {
        self.admitted.load(Ordering::Acquire) >= self.required
    }
}

/// FIFO admission queue for one rate-limited resource class.
///
/// The queue is intentionally unbounded: a flooded bucket holds requests until
/// window replenishment frees slots, it never rejects them.
#[derive(Clone, Debug)]
pub struct Bucket {
    tx: mpsc::UnboundedSender<Arc<AdmitGate>>,
    limit: u32,
    window: Duration,
}

impl Bucket {
    /// Spawns the serializing worker for a bucket admitting `limit` actions
    /// per `window`.
    pub fn new(limit: u32, window: Duration) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(bucket_worker(limit.max(1), window, rx));
        Self {
            tx,
            limit: limit.max(1),
            window,
        }
    }

    /// Queues a gate for admission. The worker admits it exactly once, no
    /// earlier than a free slot in the current window, in arrival order.
    pub fn enqueue(&self, gate: Arc<AdmitGate>) -> Result<(), BucketClosed> {
        self.tx.send(gate).map_err(|_| BucketClosed)
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    pub fn window(&self) -> Duration {
        self.window
    }
}

async fn bucket_worker(
    limit: u32,
    window: Duration,
    mut rx: mpsc::UnboundedReceiver<Arc<AdmitGate>>,
) {
    let mut remaining = limit;
    let mut reset_at = Instant::now();

    while let Some(gate) = rx.recv().await {
        let now = Instant::now();
        if now >= reset_at {
            remaining = limit;
        }
        if remaining == limit {
            // The window opens at the first admission, not at replenish time.
            reset_at = now + window;
        }
        if remaining == 0 {
            debug!(
                event = "bucket_exhausted",
                limit,
                window_ms = window.as_millis() as u64,
                "holding admission until window reset"
            );
            tokio::time::sleep_until(reset_at).await;
            remaining = limit;
            reset_at = Instant::now() + window;
        }
        remaining -= 1;
        gate.admit();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use super::*;

    /// Enqueues `count` single-bucket gates and records the virtual instant
    /// each one was admitted at.
    async fn admit_all(bucket: &Bucket, count: usize) -> Vec<(usize, Instant)> {
        let admitted = Arc::new(StdMutex::new(Vec::new()));
        let mut waiters = Vec::new();

        for index in 0..count {
            let (gate, opened) = AdmitGate::new(1);
            bucket.enqueue(gate).expect("enqueue");
            let admitted = Arc::clone(&admitted);
            waiters.push(tokio::spawn(async move {
                opened.await.expect("gate opened");
                admitted
                    .lock()
                    .expect("admissions lock")
                    .push((index, Instant::now()));
            }));
        }

        for waiter in waiters {
            waiter.await.expect("waiter finished");
        }
        Arc::try_unwrap(admitted)
            .expect("sole owner")
            .into_inner()
            .expect("admissions lock")
    }

    #[tokio::test(start_paused = true)]
    async fn seven_enqueues_split_across_two_windows() {
        let start = Instant::now();
        let bucket = Bucket::new(5, Duration::from_secs(5));

        let admissions = admit_all(&bucket, 7).await;
        assert_eq!(admissions.len(), 7);

        // Arrival order is preserved.
        let order: Vec<usize> = admissions.iter().map(|(index, _)| *index).collect();
        assert_eq!(order, vec![0, 1, 2, 3, 4, 5, 6]);

        // First five begin immediately, the rest only after the window turns.
        for (index, at) in &admissions {
            let elapsed = at.duration_since(start);
            if *index < 5 {
                assert!(elapsed < Duration::from_secs(5), "slot {index} at {elapsed:?}");
            } else {
                assert!(elapsed >= Duration::from_secs(5), "slot {index} at {elapsed:?}");
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn no_window_ever_admits_more_than_limit() {
        let bucket = Bucket::new(3, Duration::from_secs(1));
        let admissions = admit_all(&bucket, 10).await;

        let instants: Vec<Instant> = admissions.iter().map(|(_, at)| *at).collect();
        for (i, window_open) in instants.iter().enumerate() {
            let in_window = instants
                .iter()
                .filter(|at| {
                    **at >= *window_open && at.duration_since(*window_open) < Duration::from_secs(1)
                })
                .count();
            assert!(in_window <= 3, "window starting at slot {i} admitted {in_window}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn idle_bucket_replenishes_before_admitting() {
        let bucket = Bucket::new(2, Duration::from_millis(100));

        let first = admit_all(&bucket, 2).await;
        assert_eq!(first.len(), 2);

        tokio::time::sleep(Duration::from_millis(250)).await;

        let start = Instant::now();
        let second = admit_all(&bucket, 2).await;
        for (_, at) in &second {
            assert!(at.duration_since(start) < Duration::from_millis(100));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn gate_opens_only_after_every_bucket_admits() {
        let fast = Bucket::new(10, Duration::from_secs(1));
        let slow = Bucket::new(1, Duration::from_secs(5));

        // Exhaust the slow bucket's single slot.
        let (filler, filler_opened) = AdmitGate::new(1);
        slow.enqueue(filler).expect("enqueue filler");
        filler_opened.await.expect("filler admitted");

        let (gate, opened) = AdmitGate::new(2);
        fast.enqueue(Arc::clone(&gate)).expect("enqueue fast");
        slow.enqueue(Arc::clone(&gate)).expect("enqueue slow");

        // The fast bucket admits promptly; the gate must still be closed.
        tokio::task::yield_now().await;
        assert!(!gate.is_open());

        let start = Instant::now();
        opened.await.expect("gate opened");
        assert!(Instant::now().duration_since(start) >= Duration::from_secs(4));
        assert!(gate.is_open());
    }

    #[tokio::test]
    async fn bucket_reports_its_configuration() {
        let bucket = Bucket::new(5, Duration::from_secs(5));
        assert_eq!(bucket.limit(), 5);
        assert_eq!(bucket.window(), Duration::from_secs(5));

        // A zero limit is clamped to one admission per window.
        let clamped = Bucket::new(0, Duration::from_millis(1));
        assert_eq!(clamped.limit(), 1);
    }

    #[tokio::test]
    async fn admit_is_counted_once_per_bucket() {
        let (gate, opened) = AdmitGate::new(2);
        assert!(!gate.admit());
        assert!(gate.admit());
        opened.await.expect("opened");
        // Extra admissions past the threshold are harmless.
        assert!(!gate.admit());
    }
}
