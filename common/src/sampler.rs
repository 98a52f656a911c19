use std::{
    io,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

use log::{info, warn};

use crate::{clock::monotonic_ms, error::SensorError, store::TelemetryStore, types::Reading};

const SAMPLER_STACK_SIZE: usize = 8 * 1024;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SensorSample {
    pub temperature: f32,
    pub humidity: f32,
}

/// Opaque temperature/humidity source. Implementations must return within
/// roughly `timeout`; the bit-level protocol lives behind this call.
pub trait Sensor {
    fn sample(&mut self, timeout: Duration) -> Result<SensorSample, SensorError>;
}

impl<S: Sensor + ?Sized> Sensor for Box<S> {
    fn sample(&mut self, timeout: Duration) -> Result<SensorSample, SensorError> {
        (**self).sample(timeout)
    }
}

#[derive(Debug, Default)]
pub struct SamplerStats {
    ok: AtomicU64,
    failed: AtomicU64,
}

impl SamplerStats {
    pub fn successes(&self) -> u64 {
        self.ok.load(Ordering::Relaxed)
    }

    pub fn failures(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }
}

/// Periodic task that feeds the telemetry store.
///
/// A failed sample leaves the previous reading untouched; its growing age is
/// the only trace a consumer sees.
pub struct Sampler<S> {
    sensor: S,
    store: Arc<TelemetryStore>,
    stats: Arc<SamplerStats>,
    timeout: Duration,
    stale_after_ms: u64,
    consecutive_failures: u32,
}

impl<S: Sensor> Sampler<S> {
    pub fn new(
        sensor: S,
        store: Arc<TelemetryStore>,
        timeout: Duration,
        stale_after_ms: u64,
    ) -> Self {
        Self {
            sensor,
            store,
            stats: Arc::new(SamplerStats::default()),
            timeout,
            stale_after_ms,
            consecutive_failures: 0,
        }
    }

    pub fn stats(&self) -> Arc<SamplerStats> {
        Arc::clone(&self.stats)
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn run_cycle(&mut self, now_ms: u64) -> Result<Reading, SensorError> {
        match self.sensor.sample(self.timeout) {
            Ok(sample) => {
                let reading = Reading::new(sample.temperature, sample.humidity, now_ms);
                self.store.write_reading(reading);
                self.stats.ok.fetch_add(1, Ordering::Relaxed);
                self.consecutive_failures = 0;
                info!(
                    "Temperature: {:.2}, Humidity: {:.2}",
                    reading.temperature, reading.humidity
                );
                Ok(reading)
            }
            Err(err) => {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                warn!(
                    "sensor read failed ({} in a row): {err}",
                    self.consecutive_failures
                );

                let previous = self.store.read_reading();
                if previous.valid && previous.is_stale(now_ms, self.stale_after_ms) {
                    warn!(
                        "last good reading is {}ms old",
                        previous.age_ms(now_ms).unwrap_or_default()
                    );
                }
                Err(err)
            }
        }
    }
}

impl<S: Sensor + Send + 'static> Sampler<S> {
    /// Runs the sampling loop on its own thread for the process lifetime.
    pub fn spawn(mut self, period: Duration) -> io::Result<thread::JoinHandle<()>> {
        thread::Builder::new()
            .name("sampler".into())
            .stack_size(SAMPLER_STACK_SIZE)
            .spawn(move || loop {
                let started = Instant::now();
                let _ = self.run_cycle(monotonic_ms());
                thread::sleep(next_delay(period, started.elapsed()));
            })
    }
}

/// Time left in the current period once a cycle took `spent`.
fn next_delay(period: Duration, spent: Duration) -> Duration {
    period.saturating_sub(spent)
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use pretty_assertions::assert_eq;

    use super::*;

    struct ScriptedSensor {
        script: VecDeque<Result<SensorSample, SensorError>>,
        timeouts: Vec<Duration>,
    }

    impl ScriptedSensor {
        fn new(script: Vec<Result<SensorSample, SensorError>>) -> Self {
            Self {
                script: script.into(),
                timeouts: Vec::new(),
            }
        }
    }

    impl Sensor for ScriptedSensor {
        fn sample(&mut self, timeout: Duration) -> Result<SensorSample, SensorError> {
            self.timeouts.push(timeout);
            self.script.pop_front().unwrap_or(Err(SensorError::Timeout))
        }
    }

    fn ok(temperature: f32, humidity: f32) -> Result<SensorSample, SensorError> {
        Ok(SensorSample {
            temperature,
            humidity,
        })
    }

    fn sampler(
        script: Vec<Result<SensorSample, SensorError>>,
    ) -> (Sampler<ScriptedSensor>, Arc<TelemetryStore>) {
        let store = Arc::new(TelemetryStore::new());
        let sampler = Sampler::new(
            ScriptedSensor::new(script),
            Arc::clone(&store),
            Duration::from_millis(500),
            10_000,
        );
        (sampler, store)
    }

    #[test]
    fn successful_sample_marks_reading_valid() {
        let (mut sampler, store) = sampler(vec![ok(23.0, 41.0)]);

        sampler.run_cycle(2_000).unwrap();

        let reading = store.read_reading();
        assert!(reading.valid);
        assert_eq!(reading, Reading::new(23.0, 41.0, 2_000));
        assert_eq!(sampler.sensor.timeouts, vec![Duration::from_millis(500)]);
    }

    #[test]
    fn timestamps_do_not_decrease_across_cycles() {
        let (mut sampler, store) = sampler(vec![ok(20.0, 40.0), ok(20.5, 40.0), ok(21.0, 39.0)]);
        let mut last = 0;

        for now_ms in [2_000, 4_000, 6_001] {
            sampler.run_cycle(now_ms).unwrap();
            let reading = store.read_reading();
            assert!(reading.valid);
            assert!(reading.sampled_at_ms >= last);
            last = reading.sampled_at_ms;
        }
        assert_eq!(sampler.stats().successes(), 3);
    }

    #[test]
    fn failure_keeps_previous_reading() {
        let (mut sampler, store) = sampler(vec![
            ok(22.0, 50.0),
            Err(SensorError::ChecksumMismatch),
            Err(SensorError::Timeout),
        ]);

        sampler.run_cycle(2_000).unwrap();
        let good = store.read_reading();

        assert_eq!(
            sampler.run_cycle(4_000),
            Err(SensorError::ChecksumMismatch)
        );
        assert_eq!(sampler.run_cycle(6_000), Err(SensorError::Timeout));

        assert_eq!(store.read_reading(), good);
        assert_eq!(store.read_reading().age_ms(6_000), Some(4_000));
        assert_eq!(sampler.consecutive_failures(), 2);
        assert_eq!(sampler.stats().failures(), 2);
    }

    #[test]
    fn failure_before_first_sample_leaves_store_unset() {
        let (mut sampler, store) = sampler(vec![Err(SensorError::Timeout)]);

        assert!(sampler.run_cycle(2_000).is_err());
        assert_eq!(store.read_reading(), Reading::UNSET);
    }

    #[test]
    fn recovery_resets_failure_streak() {
        let (mut sampler, _store) = sampler(vec![Err(SensorError::Timeout), ok(19.0, 60.0)]);

        let _ = sampler.run_cycle(2_000);
        sampler.run_cycle(4_000).unwrap();

        assert_eq!(sampler.consecutive_failures(), 0);
    }

    #[test]
    fn slow_read_shortens_the_following_sleep() {
        let period = Duration::from_millis(2_000);

        assert_eq!(next_delay(period, Duration::from_millis(300)), Duration::from_millis(1_700));
        assert_eq!(next_delay(period, Duration::ZERO), period);
        assert_eq!(next_delay(period, Duration::from_millis(2_500)), Duration::ZERO);
    }

    #[test]
    fn spawned_task_publishes_readings() {
        let store = Arc::new(TelemetryStore::new());
        let sampler = Sampler::new(
            ScriptedSensor::new(vec![ok(18.0, 55.0)]),
            Arc::clone(&store),
            Duration::from_millis(10),
            10_000,
        );
        let stats = sampler.stats();
        let _handle = sampler.spawn(Duration::from_millis(5)).unwrap();

        for _ in 0..200 {
            if stats.successes() > 0 {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }

        let reading = store.read_reading();
        assert!(reading.valid);
        assert_eq!(reading.temperature, 18.0);
    }
}
