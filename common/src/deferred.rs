use std::{
    io,
    sync::{
        atomic::{AtomicU64, Ordering},
        mpsc::{self, Receiver, SyncSender, TrySendError},
        Arc, Mutex, PoisonError,
    },
    thread,
};

use log::{debug, info, warn};

use crate::{
    error::{DeliveryError, SubmitError},
    http::Response,
    types::QueueCounters,
};

const WORKER_STACK_SIZE: usize = 8 * 1024;

/// Handle to the client connection a deferred response is written to.
/// Delivering consumes the handle, so a response goes out at most once;
/// dropping it without delivering releases the connection.
pub trait ResponseSink: Send + 'static {
    fn deliver(self, response: Response) -> Result<(), DeliveryError>;
}

/// One deferred response, owned by exactly one party at a time: the handler
/// that built it, then the queue, then the worker that completes it.
pub struct DeferredResponseJob<C> {
    connection: C,
    payload: Response,
}

impl<C: ResponseSink> DeferredResponseJob<C> {
    pub fn new(connection: C, payload: Response) -> Self {
        Self {
            connection,
            payload,
        }
    }

    pub fn payload(&self) -> &Response {
        &self.payload
    }

    pub fn complete(self) -> Result<(), DeliveryError> {
        self.connection.deliver(self.payload)
    }
}

/// Hand-off point between a request handler and the context that writes the
/// response. Submission never blocks; a refused job comes back to the caller.
pub trait WorkQueue<C> {
    fn submit(&self, job: DeferredResponseJob<C>)
        -> Result<(), SubmitError<DeferredResponseJob<C>>>;

    fn counters(&self) -> QueueCounters;
}

#[derive(Debug, Default)]
pub struct Counters {
    submitted: AtomicU64,
    completed: AtomicU64,
    rejected: AtomicU64,
}

impl Counters {
    pub fn record_submitted(&self) {
        self.submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_completed(&self) {
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> QueueCounters {
        QueueCounters {
            submitted: self.submitted.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }
}

/// Bounded queue drained by a fixed pool of worker threads.
///
/// Holds at most `capacity` waiting jobs on top of the ones being executed.
/// Dropping the queue lets the workers finish what is queued and exit.
pub struct DeferredQueue<C> {
    tx: SyncSender<DeferredResponseJob<C>>,
    counters: Arc<Counters>,
}

impl<C: ResponseSink> DeferredQueue<C> {
    pub fn start(capacity: usize, workers: usize) -> io::Result<Self> {
        let (tx, rx) = mpsc::sync_channel(capacity);
        let rx = Arc::new(Mutex::new(rx));
        let counters = Arc::new(Counters::default());

        for index in 0..workers.max(1) {
            let rx = Arc::clone(&rx);
            let counters = Arc::clone(&counters);
            thread::Builder::new()
                .name(format!("deferred-{index}"))
                .stack_size(WORKER_STACK_SIZE)
                .spawn(move || run_worker(&rx, &counters))?;
        }

        Ok(Self { tx, counters })
    }
}

fn run_worker<C: ResponseSink>(rx: &Mutex<Receiver<DeferredResponseJob<C>>>, counters: &Counters) {
    loop {
        // Only the receive is under the lock; the job runs unlocked.
        let next = rx.lock().unwrap_or_else(PoisonError::into_inner).recv();
        let Ok(job) = next else {
            debug!("deferred queue closed, worker exiting");
            return;
        };

        let status = job.payload().status;
        match job.complete() {
            Ok(()) => info!("executed queued work, status {status}"),
            Err(err) => warn!("deferred response not delivered: {err}"),
        }
        counters.record_completed();
    }
}

impl<C: ResponseSink> WorkQueue<C> for DeferredQueue<C> {
    fn submit(
        &self,
        job: DeferredResponseJob<C>,
    ) -> Result<(), SubmitError<DeferredResponseJob<C>>> {
        match self.tx.try_send(job) {
            Ok(()) => {
                self.counters.record_submitted();
                debug!("queued deferred response");
                Ok(())
            }
            Err(TrySendError::Full(job)) => {
                self.counters.record_rejected();
                Err(SubmitError::Full(job))
            }
            Err(TrySendError::Disconnected(job)) => {
                self.counters.record_rejected();
                Err(SubmitError::Disconnected(job))
            }
        }
    }

    fn counters(&self) -> QueueCounters {
        self.counters.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::AtomicIsize,
        time::{Duration, Instant},
    };

    use pretty_assertions::assert_eq;

    use super::*;

    const WAIT: Duration = Duration::from_secs(5);

    /// Connection stand-in that reports deliveries and tracks how many
    /// handles are alive.
    struct TestSink {
        id: usize,
        delivered: mpsc::Sender<(usize, Response)>,
        live: Arc<AtomicIsize>,
        gate: Option<(mpsc::Sender<()>, Receiver<()>)>,
    }

    impl TestSink {
        fn new(id: usize, delivered: &mpsc::Sender<(usize, Response)>, live: &Arc<AtomicIsize>) -> Self {
            live.fetch_add(1, Ordering::SeqCst);
            Self {
                id,
                delivered: delivered.clone(),
                live: Arc::clone(live),
                gate: None,
            }
        }
    }

    impl Drop for TestSink {
        fn drop(&mut self) {
            self.live.fetch_sub(1, Ordering::SeqCst);
        }
    }

    impl ResponseSink for TestSink {
        fn deliver(mut self, response: Response) -> Result<(), DeliveryError> {
            if let Some((started, release)) = self.gate.take() {
                let _ = started.send(());
                let _ = release.recv_timeout(WAIT);
            }
            self.delivered
                .send((self.id, response))
                .map_err(|_| DeliveryError::Closed)
        }
    }

    fn ack(id: usize) -> Response {
        Response::text(200, format!("ack {id}"))
    }

    fn wait_until(mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + WAIT;
        while !condition() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn job_is_delivered_exactly_once() {
        let queue = DeferredQueue::start(2, 1).unwrap();
        let (delivered_tx, delivered_rx) = mpsc::channel();
        let live = Arc::new(AtomicIsize::new(0));

        queue
            .submit(DeferredResponseJob::new(TestSink::new(7, &delivered_tx, &live), ack(7)))
            .unwrap();

        let (id, response) = delivered_rx.recv_timeout(WAIT).unwrap();
        assert_eq!(id, 7);
        assert_eq!(response, ack(7));
        assert!(delivered_rx.recv_timeout(Duration::from_millis(50)).is_err());

        wait_until(|| queue.counters().completed == 1);
        assert_eq!(live.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn saturated_queue_rejects_without_blocking_or_leaking() {
        let queue = DeferredQueue::start(2, 1).unwrap();
        let (delivered_tx, delivered_rx) = mpsc::channel();
        let live = Arc::new(AtomicIsize::new(0));

        // Park the only worker inside the first job.
        let (started_tx, started_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        let mut first = TestSink::new(0, &delivered_tx, &live);
        first.gate = Some((started_tx, release_rx));
        queue.submit(DeferredResponseJob::new(first, ack(0))).unwrap();
        started_rx.recv_timeout(WAIT).unwrap();

        let began = Instant::now();
        let mut rejected = Vec::new();
        for id in 1..=5 {
            let job = DeferredResponseJob::new(TestSink::new(id, &delivered_tx, &live), ack(id));
            if let Err(err) = queue.submit(job) {
                assert!(matches!(err, SubmitError::Full(_)));
                rejected.push(err.into_job());
            }
        }
        assert!(began.elapsed() < Duration::from_secs(1));
        assert_eq!(rejected.len(), 3);

        // The submitter owns refused jobs again and releases them itself.
        drop(rejected);
        assert_eq!(live.load(Ordering::SeqCst), 3);

        release_tx.send(()).unwrap();
        let mut ids: Vec<usize> = (0..3)
            .map(|_| delivered_rx.recv_timeout(WAIT).unwrap().0)
            .collect();
        ids.sort_unstable();
        assert_eq!(ids, vec![0, 1, 2]);

        wait_until(|| queue.counters().completed == 3);
        assert_eq!(live.load(Ordering::SeqCst), 0);

        let counters = queue.counters();
        assert_eq!(counters.submitted, 3);
        assert_eq!(counters.rejected, 3);
    }

    #[test]
    fn failed_delivery_still_releases_job() {
        let queue = DeferredQueue::start(1, 1).unwrap();
        let (delivered_tx, delivered_rx) = mpsc::channel();
        let live = Arc::new(AtomicIsize::new(0));
        drop(delivered_rx);

        queue
            .submit(DeferredResponseJob::new(TestSink::new(1, &delivered_tx, &live), ack(1)))
            .unwrap();

        wait_until(|| queue.counters().completed == 1);
        assert_eq!(live.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn multiple_workers_drain_concurrently() {
        let queue = DeferredQueue::start(8, 3).unwrap();
        let (delivered_tx, delivered_rx) = mpsc::channel();
        let live = Arc::new(AtomicIsize::new(0));

        for id in 0..8 {
            queue
                .submit(DeferredResponseJob::new(TestSink::new(id, &delivered_tx, &live), ack(id)))
                .unwrap();
        }

        let mut ids: Vec<usize> = (0..8)
            .map(|_| delivered_rx.recv_timeout(WAIT).unwrap().0)
            .collect();
        ids.sort_unstable();
        assert_eq!(ids, (0..8).collect::<Vec<_>>());

        wait_until(|| live.load(Ordering::SeqCst) == 0);
    }
}
