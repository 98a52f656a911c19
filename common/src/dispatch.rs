use std::sync::{Arc, Mutex, PoisonError};

use log::{info, warn};

use crate::{
    actuator::{Actuator, OutputPin},
    config::NodeConfig,
    connectivity::ConnectivityMonitor,
    deferred::{DeferredResponseJob, ResponseSink, WorkQueue},
    error::SubmitError,
    http::{self, Response},
    page,
    sampler::SamplerStats,
    store::TelemetryStore,
    types::{DataPayload, NodeStatus, QueueCounters},
};

pub type SharedActuator = Arc<Actuator<Box<dyn OutputPin + Send>>>;
pub type SharedMonitor = Arc<Mutex<ConnectivityMonitor>>;

/// Request handlers for the device's HTTP surface.
///
/// GET handlers only read shared state. `POST /ws` is the single writer of the
/// LED level and answers through the deferred queue.
pub struct Dispatcher {
    store: Arc<TelemetryStore>,
    actuator: SharedActuator,
    monitor: SharedMonitor,
    sampler: Arc<SamplerStats>,
    serve_unready_reading: bool,
    stale_after_ms: u64,
    max_body_bytes: usize,
}

impl Dispatcher {
    pub fn new(
        config: &NodeConfig,
        store: Arc<TelemetryStore>,
        actuator: SharedActuator,
        monitor: SharedMonitor,
        sampler: Arc<SamplerStats>,
    ) -> Self {
        Self {
            store,
            actuator,
            monitor,
            sampler,
            serve_unready_reading: config.serve_unready_reading,
            stale_after_ms: config.stale_after_ms,
            max_body_bytes: config.max_body_bytes,
        }
    }

    /// Fixed-size receive buffer for `POST /ws` bodies.
    pub fn body_buffer(&self) -> Vec<u8> {
        vec![0; self.max_body_bytes]
    }

    pub fn index(&self) -> Response {
        Response::html(page::render_index(self.store.read_address()))
    }

    pub fn data(&self) -> Response {
        let reading = self.store.read_reading();
        if !reading.valid && !self.serve_unready_reading {
            return Response::error(503, "reading not available");
        }
        Response::json(&DataPayload::from(reading))
    }

    pub fn status(&self, deferred: QueueCounters, now_ms: u64) -> Response {
        let reading = self.store.read_reading();
        let address = self.store.read_address();
        let connectivity = self
            .monitor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .state();

        Response::json(&NodeStatus {
            connectivity: connectivity.as_str(),
            address: address.ip().map(|ip| ip.to_string()),
            reading_valid: reading.valid,
            reading_age_ms: reading.age_ms(now_ms),
            reading_stale: reading.is_stale(now_ms, self.stale_after_ms),
            samples_ok: self.sampler.successes(),
            samples_failed: self.sampler.failures(),
            led_on: self.actuator.level(),
            deferred,
        })
    }

    /// Applies the LED command in `body` and queues the acknowledgment for
    /// `connection`.
    ///
    /// `Ok` means the queue now owns the connection and will answer on it.
    /// `Err` carries the response the caller must send synchronously; in that
    /// case the connection handle has already been released.
    pub fn post_led<C, Q>(&self, body: &[u8], connection: C, queue: &Q) -> Result<(), Response>
    where
        C: ResponseSink,
        Q: WorkQueue<C> + ?Sized,
    {
        info!("Data sent by the client: {}", String::from_utf8_lossy(body));

        let Some(command) = http::parse_led_command(body) else {
            return Err(Response::text(400, "expected led=on or led=off"));
        };

        if let Err(err) = self.actuator.apply(command.level()) {
            warn!("led {} failed: {err}", command.as_str());
            return Err(Response::error(500, "failed to drive led"));
        }

        let ack = Response::text(200, format!("LED {} acknowledged", command.as_str()));
        match queue.submit(DeferredResponseJob::new(connection, ack)) {
            Ok(()) => Ok(()),
            Err(err) => {
                warn!("deferred response rejected: {err}");
                let reason = match &err {
                    SubmitError::Full(_) => "queue full",
                    SubmitError::Disconnected(_) => "no worker",
                };
                drop(err.into_job());
                info!("released deferred job ({reason})");
                Err(Response::busy())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        mpsc,
    };

    use pretty_assertions::assert_eq;
    use serde_json::Value;

    use super::*;
    use crate::{
        deferred::{Counters, DeferredQueue},
        error::{ActuatorError, DeliveryError},
        types::Reading,
    };

    struct NullPin;

    impl OutputPin for NullPin {
        fn set_output(&mut self, _level: bool) -> Result<(), ActuatorError> {
            Ok(())
        }
    }

    struct ChannelSink(mpsc::Sender<Response>);

    impl ResponseSink for ChannelSink {
        fn deliver(self, response: Response) -> Result<(), DeliveryError> {
            self.0.send(response).map_err(|_| DeliveryError::Closed)
        }
    }

    /// Queue that refuses everything and counts released handles.
    struct RefusingQueue {
        counters: Counters,
    }

    struct CountedSink(Arc<AtomicUsize>);

    impl Drop for CountedSink {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl ResponseSink for CountedSink {
        fn deliver(self, _response: Response) -> Result<(), DeliveryError> {
            Ok(())
        }
    }

    impl WorkQueue<CountedSink> for RefusingQueue {
        fn submit(
            &self,
            job: DeferredResponseJob<CountedSink>,
        ) -> Result<(), SubmitError<DeferredResponseJob<CountedSink>>> {
            self.counters.record_rejected();
            Err(SubmitError::Full(job))
        }

        fn counters(&self) -> QueueCounters {
            self.counters.snapshot()
        }
    }

    fn dispatcher(config: NodeConfig) -> (Dispatcher, Arc<TelemetryStore>, SharedActuator) {
        let store = Arc::new(TelemetryStore::new());
        let actuator: SharedActuator =
            Arc::new(Actuator::new(Box::new(NullPin) as Box<dyn OutputPin + Send>).unwrap());
        let monitor = Arc::new(Mutex::new(ConnectivityMonitor::new(Arc::clone(&store))));
        let dispatcher = Dispatcher::new(
            &config,
            Arc::clone(&store),
            Arc::clone(&actuator),
            monitor,
            Arc::new(SamplerStats::default()),
        );
        (dispatcher, store, actuator)
    }

    fn json(response: &Response) -> Value {
        serde_json::from_slice(&response.body).unwrap()
    }

    #[test]
    fn data_before_first_sample_serves_zeroes_marked_invalid() {
        let (dispatcher, _, _) = dispatcher(NodeConfig::default());

        let response = dispatcher.data();

        assert_eq!(response.status, 200);
        assert_eq!(
            json(&response),
            serde_json::json!({"temperature": 0.0, "humidity": 0.0, "valid": false})
        );
    }

    #[test]
    fn data_before_first_sample_can_answer_not_ready() {
        let (dispatcher, _, _) = dispatcher(NodeConfig {
            serve_unready_reading: false,
            ..NodeConfig::default()
        });

        assert_eq!(dispatcher.data().status, 503);
    }

    #[test]
    fn data_serves_latest_reading() {
        let (dispatcher, store, _) = dispatcher(NodeConfig::default());
        store.write_reading(Reading::new(24.5, 38.0, 10));

        let body = json(&dispatcher.data());

        assert_eq!(body["temperature"], 24.5);
        assert_eq!(body["humidity"], 38.0);
        assert_eq!(body["valid"], true);
    }

    #[test]
    fn index_embeds_address_only_when_present() {
        let (dispatcher, store, _) = dispatcher(NodeConfig::default());
        let page = String::from_utf8(dispatcher.index().body).unwrap();
        assert!(page.contains("unassigned"));

        store.write_address(crate::types::LinkAddress::new([10, 1, 2, 3]));
        let page = String::from_utf8(dispatcher.index().body).unwrap();
        assert!(page.contains("10.1.2.3"));
    }

    #[test]
    fn led_on_sets_level_and_defers_one_ack() {
        let (dispatcher, _, actuator) = dispatcher(NodeConfig::default());
        let queue = DeferredQueue::start(2, 1).unwrap();
        let (tx, rx) = mpsc::channel();

        dispatcher
            .post_led(b"led=on", ChannelSink(tx), &queue)
            .unwrap();

        assert!(actuator.level());
        let ack = rx.recv_timeout(std::time::Duration::from_secs(5)).unwrap();
        assert_eq!(ack.status, 200);
        assert_eq!(ack.body, b"LED on acknowledged".to_vec());
        assert!(rx.recv_timeout(std::time::Duration::from_millis(50)).is_err());
    }

    #[test]
    fn led_off_clears_level() {
        let (dispatcher, _, actuator) = dispatcher(NodeConfig::default());
        let queue = DeferredQueue::start(2, 1).unwrap();

        let (tx, _rx) = mpsc::channel();
        dispatcher.post_led(b"led=on", ChannelSink(tx), &queue).unwrap();
        let (tx, _rx2) = mpsc::channel();
        dispatcher.post_led(b"led=off", ChannelSink(tx), &queue).unwrap();

        assert!(!actuator.level());
    }

    #[test]
    fn unknown_body_is_rejected_without_touching_led() {
        let (dispatcher, _, actuator) = dispatcher(NodeConfig::default());
        let queue = DeferredQueue::start(2, 1).unwrap();
        let (tx, _rx) = mpsc::channel();

        let response = dispatcher
            .post_led(b"colour=red", ChannelSink(tx), &queue)
            .unwrap_err();

        assert_eq!(response.status, 400);
        assert!(!actuator.level());
        assert_eq!(queue.counters().submitted, 0);
    }

    #[test]
    fn refused_submission_releases_job_and_reports_busy() {
        let (dispatcher, _, actuator) = dispatcher(NodeConfig::default());
        let queue = RefusingQueue {
            counters: Counters::default(),
        };
        let released = Arc::new(AtomicUsize::new(0));

        let response = dispatcher
            .post_led(b"led=on", CountedSink(Arc::clone(&released)), &queue)
            .unwrap_err();

        assert_eq!(response.status, 503);
        assert_eq!(response.retry_after_secs, Some(1));
        assert_eq!(released.load(Ordering::SeqCst), 1);
        assert!(actuator.level());
        assert_eq!(queue.counters().rejected, 1);
    }

    #[test]
    fn status_reports_shared_state() {
        let (dispatcher, store, actuator) = dispatcher(NodeConfig::default());
        store.write_reading(Reading::new(20.0, 50.0, 1_000));
        actuator.apply(true).unwrap();

        let body = json(&dispatcher.status(
            QueueCounters {
                submitted: 2,
                completed: 1,
                rejected: 0,
            },
            3_000,
        ));

        assert_eq!(body["connectivity"], "DISCONNECTED");
        assert_eq!(body["address"], Value::Null);
        assert_eq!(body["readingValid"], true);
        assert_eq!(body["readingAgeMs"], 2_000);
        assert_eq!(body["readingStale"], false);
        assert_eq!(body["ledOn"], true);
        assert_eq!(body["deferred"]["submitted"], 2);
    }
}
